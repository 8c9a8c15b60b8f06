//! Publishers (spec §4.H): each runs a delivery task backed by a bounded
//! FIFO (default capacity 20). `publish` enqueues non-blocking; on overflow
//! a local loss counter increments, and after `max_lost` consecutive losses
//! the publisher's handle reports `Overflow` so its coupler can deregister
//! it. Three built-in kinds ship with the core: Client (TCP, with
//! transparent/dyfmt/stfmt encodings), Injector (delivers into another
//! coupler's `send`), and Pull (consumer-driven dequeue for streaming gRPC).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, warn};

use crate::envelope::{encode_mxpgn, encode_pdgy};
use crate::error::CouplerError;
use crate::router_core::filter::FilterSet;
use crate::router_core::RouterMessage;

pub const DEFAULT_CAPACITY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEncoding {
    Transparent,
    Dyfmt,
    Stfmt,
}

impl ClientEncoding {
    pub fn parse(name: &str) -> Self {
        match name {
            "dyfmt" => ClientEncoding::Dyfmt,
            "stfmt" => ClientEncoding::Stfmt,
            _ => ClientEncoding::Transparent,
        }
    }
}

/// A component a coupler registers itself with and delivers messages to
/// (spec §4.H). Implementations own their own delivery task; `enqueue`
/// never blocks the caller.
#[async_trait]
pub trait Publisher: Send + Sync {
    fn name(&self) -> &str;
    fn enqueue(&self, msg: RouterMessage) -> Result<(), Overflow>;
    fn lost_count(&self) -> u32;
}

/// Signalled back to the registering coupler once `max_lost` consecutive
/// enqueue failures have occurred (spec §4.H "raises Overflow").
#[derive(Debug)]
pub struct Overflow;

struct Shared {
    lost: AtomicU32,
    max_lost: u32,
}

/// A publisher backed by a bounded channel and a background delivery task
/// that renders each `RouterMessage` through a `Sink`.
pub struct PublisherHandle {
    name: String,
    tx: mpsc::Sender<RouterMessage>,
    shared: Arc<Shared>,
}

#[async_trait]
pub trait Sink: Send + Sync {
    async fn deliver(&mut self, msg: RouterMessage) -> Result<(), CouplerError>;
}

impl PublisherHandle {
    pub fn spawn(name: impl Into<String>, max_lost: u32, sink: impl Sink + 'static) -> Self {
        Self::spawn_filtered(name, max_lost, None, sink)
    }

    /// Spawns the delivery task with an optional filter set applied to each
    /// message before it reaches the sink (spec §4.H "applies the optional
    /// filter set (pass-through if none)").
    pub fn spawn_filtered(name: impl Into<String>, max_lost: u32, mut filter: Option<FilterSet>, mut sink: impl Sink + 'static) -> Self {
        let (tx, mut rx) = mpsc::channel(DEFAULT_CAPACITY);
        let name = name.into();
        let shared = Arc::new(Shared { lost: AtomicU32::new(0), max_lost });
        let task_name = name.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Some(filter) = &mut filter {
                    if !filter.accept(&msg, std::time::Instant::now()) {
                        continue;
                    }
                }
                if let Err(e) = sink.deliver(msg).await {
                    error!(publisher = %task_name, error = %e, "delivery failed, stopping publisher");
                    break;
                }
            }
        });
        PublisherHandle { name, tx, shared }
    }
}

#[async_trait]
impl Publisher for PublisherHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn enqueue(&self, msg: RouterMessage) -> Result<(), Overflow> {
        match self.tx.try_send(msg) {
            Ok(()) => {
                self.shared.lost.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => {
                let lost = self.shared.lost.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(publisher = %self.name, lost, "publisher queue full, message dropped");
                if lost >= self.shared.max_lost {
                    Err(Overflow)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn lost_count(&self) -> u32 {
        self.shared.lost.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod handle_tests {
    use super::*;

    struct CountingSink {
        count: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Sink for CountingSink {
        async fn deliver(&mut self, _msg: RouterMessage) -> Result<(), CouplerError> {
            self.count.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivered_messages_reset_loss_streak() {
        let count = Arc::new(AtomicU32::new(0));
        let handle = PublisherHandle::spawn("sink", 5, CountingSink { count: count.clone() });
        for _ in 0..3 {
            handle.enqueue(RouterMessage::Raw(vec![1])).unwrap();
        }
        tokio::task::yield_now().await;
        assert_eq!(handle.lost_count(), 0);
        assert_eq!(count.load(Ordering::Relaxed), 3);
    }
}

/// Sends each message on a TCP socket to a connected peer, applying one of
/// three encodings for NMEA2000 traffic: transparent, dyfmt, or stfmt.
pub struct ClientSink {
    stream: TcpStream,
    encoding: ClientEncoding,
}

impl ClientSink {
    pub fn new(stream: TcpStream, encoding: ClientEncoding) -> Self {
        ClientSink { stream, encoding }
    }
}

#[async_trait]
impl Sink for ClientSink {
    async fn deliver(&mut self, msg: RouterMessage) -> Result<(), CouplerError> {
        let line = match (&msg, self.encoding) {
            (RouterMessage::Raw(bytes), ClientEncoding::Transparent) => bytes.clone(),
            (RouterMessage::Nmea0183(sentence), _) => sentence.render().into_bytes(),
            (RouterMessage::Nmea2000(n2k), ClientEncoding::Dyfmt) => encode_pdgy(n2k, false).render().into_bytes(),
            (RouterMessage::Nmea2000(n2k), ClientEncoding::Stfmt) => encode_mxpgn(n2k).render().into_bytes(),
            (RouterMessage::Nmea2000(n2k), ClientEncoding::Transparent) => n2k.payload.clone(),
            (RouterMessage::Raw(bytes), _) => bytes.clone(),
        };
        self.stream.write_all(&line).await.map_err(|e| CouplerError::ReadError(e.to_string()))?;
        Ok(())
    }
}

/// Delivers each message into another coupler's `send`.
pub struct InjectorSink {
    target: Arc<dyn crate::router_core::coupler::Sendable>,
}

impl InjectorSink {
    pub fn new(target: Arc<dyn crate::router_core::coupler::Sendable>) -> Self {
        InjectorSink { target }
    }
}

#[async_trait]
impl Sink for InjectorSink {
    async fn deliver(&mut self, msg: RouterMessage) -> Result<(), CouplerError> {
        self.target.send(msg).await
    }
}

/// Consumer-driven queue used by streaming gRPC endpoints: instead of a
/// delivery task, the consumer calls `pull()` to dequeue.
pub struct PullPublisher {
    name: String,
    tx: mpsc::Sender<RouterMessage>,
    rx: Mutex<mpsc::Receiver<RouterMessage>>,
    shared: Arc<Shared>,
    filter: Option<std::sync::Mutex<FilterSet>>,
}

impl PullPublisher {
    pub fn new(name: impl Into<String>, max_lost: u32) -> Self {
        Self::with_filter(name, max_lost, None)
    }

    pub fn with_filter(name: impl Into<String>, max_lost: u32, filter: Option<FilterSet>) -> Self {
        let (tx, rx) = mpsc::channel(DEFAULT_CAPACITY);
        PullPublisher {
            name: name.into(),
            tx,
            rx: Mutex::new(rx),
            shared: Arc::new(Shared { lost: AtomicU32::new(0), max_lost }),
            filter: filter.map(std::sync::Mutex::new),
        }
    }

    pub async fn pull(&self) -> Option<RouterMessage> {
        self.rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod pull_tests {
    use super::*;

    fn raw(n: u8) -> RouterMessage {
        RouterMessage::Raw(vec![n])
    }

    #[tokio::test]
    async fn overflow_on_one_publisher_does_not_affect_a_sibling() {
        let blocked = PullPublisher::new("blocked", 5);
        let draining = PullPublisher::new("draining", 5);

        // Fill the blocked publisher's queue (capacity 20) then push past
        // max_lost=5 without ever calling pull() on it.
        for n in 0..DEFAULT_CAPACITY as u8 {
            blocked.enqueue(raw(n)).unwrap();
        }
        let mut overflowed = false;
        for n in 0..6 {
            if blocked.enqueue(raw(100 + n)).is_err() {
                overflowed = true;
                break;
            }
        }
        assert!(overflowed, "blocked publisher should signal Overflow after max_lost drops");

        // The sibling publisher, drained normally, observes every message
        // in order with no loss.
        for n in 0..10u8 {
            draining.enqueue(raw(n)).unwrap();
            assert_eq!(draining.pull().await, Some(raw(n)));
        }
        assert_eq!(draining.lost_count(), 0);
    }
}

#[async_trait]
impl Publisher for PullPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    fn enqueue(&self, msg: RouterMessage) -> Result<(), Overflow> {
        if let Some(filter) = &self.filter {
            if !filter.lock().unwrap().accept(&msg, std::time::Instant::now()) {
                return Ok(());
            }
        }
        match self.tx.try_send(msg) {
            Ok(()) => {
                self.shared.lost.store(0, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => {
                let lost = self.shared.lost.fetch_add(1, Ordering::Relaxed) + 1;
                if lost >= self.shared.max_lost { Err(Overflow) } else { Ok(()) }
            }
        }
    }

    fn lost_count(&self) -> u32 {
        self.shared.lost.load(Ordering::Relaxed)
    }
}
