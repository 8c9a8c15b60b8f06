//! Couplers (spec §4.G): abstract ingress/egress. Every variant implements
//! one `Coupler` trait (open/read/send/close) — a capability set, not a
//! deep class hierarchy (REDESIGN FLAGS) — and is driven by one free
//! `run_coupler` loop grounded on `original_source/instrument.py`'s
//! `Instrument.run` (open-if-not-ready, read, count, publish,
//! retry-on-error).

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use nmea2k::can_interface::{open_with_retry, BurstConfig, CanReader, CanTrace, CanWriter};
use nmea2k::{ActiveController, NMEA2000Msg, PgnDictionary};

use crate::envelope::{decode_mxpgn, decode_pdgy};
use crate::error::CouplerError;
use crate::nmea0183::Sentence;
use crate::router_core::publisher::{Overflow, Publisher};
use crate::router_core::RouterMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Bidirectional,
    ReadOnly,
    WriteOnly,
}

/// Accepted by an Injector publisher's sink: any coupler that can accept a
/// message on its write side.
#[async_trait]
pub trait Sendable: Send + Sync {
    async fn send(&self, msg: RouterMessage) -> Result<(), CouplerError>;
}

/// The coupler contract (spec §4.G): `open`/`read`/`send`/`close`, driven by
/// `run_coupler`. A null `read()` result means end of stream.
#[async_trait]
pub trait Coupler: Send {
    fn name(&self) -> &str;
    fn direction(&self) -> Direction;
    async fn open(&mut self) -> bool;
    async fn read(&mut self) -> Result<Option<RouterMessage>, CouplerError>;
    async fn send(&mut self, msg: &RouterMessage) -> Result<(), CouplerError>;
    async fn close(&mut self);
}

/// Shared publisher registry every coupler drives through `publish`.
#[derive(Default, Clone)]
pub struct CouplerHandle {
    publishers: Arc<RwLock<HashMap<String, Arc<dyn Publisher>>>>,
}

impl CouplerHandle {
    pub async fn register(&self, publisher: Arc<dyn Publisher>) {
        self.publishers.write().await.insert(publisher.name().to_string(), publisher);
    }

    pub async fn deregister(&self, name: &str) {
        self.publishers.write().await.remove(name);
    }

    async fn publish(&self, msg: &RouterMessage) {
        let publishers = self.publishers.read().await;
        let mut overflowed = Vec::new();
        for (name, publisher) in publishers.iter() {
            if let Err(Overflow) = publisher.enqueue(msg.clone()) {
                overflowed.push(name.clone());
            }
        }
        drop(publishers);
        for name in overflowed {
            warn!(publisher = %name, "publisher overflowed, deregistering");
            self.deregister(&name).await;
        }
    }
}

/// Open-if-not-ready / read / count / publish / retry-on-error, grounded on
/// `Instrument.run`. Runs until `stop` fires or `read` returns end of stream.
/// The coupler is shared behind a lock rather than owned outright so an
/// Injector publisher can hold the same handle and drive `send` on it
/// (spec §4.H Injector kind).
pub async fn run_coupler(
    coupler: Arc<tokio::sync::Mutex<Box<dyn Coupler>>>,
    handle: CouplerHandle,
    max_attempt: u32,
    open_delay: Duration,
    mut stop: mpsc::Receiver<()>,
) {
    let name = coupler.lock().await.name().to_string();
    let mut total_msg: u64 = 0;
    let mut attempts = 0u32;
    let mut ready = false;
    loop {
        if stop.try_recv().is_ok() {
            break;
        }
        if !ready {
            if !coupler.lock().await.open().await {
                attempts += 1;
                if attempts >= max_attempt {
                    error!(coupler = %name, "giving up after {attempts} failed open attempts");
                    return;
                }
                tokio::time::sleep(open_delay).await;
                continue;
            }
            ready = true;
            attempts = 0;
        }

        let read_result = coupler.lock().await.read().await;
        match read_result {
            Ok(Some(msg)) => {
                total_msg += 1;
                debug!(coupler = %name, total_msg, "message read");
                handle.publish(&msg).await;
            }
            Ok(None) => {
                info!(coupler = %name, "end of stream, stopping");
                break;
            }
            Err(CouplerError::ReadTimeout) => continue,
            Err(e) => {
                warn!(coupler = %name, error = %e, "read error, reopening");
                coupler.lock().await.close().await;
                ready = false;
            }
        }
    }
    coupler.lock().await.close().await;
}

/// Direct CAN coupler wrapping the `nmea2k` CAN interface. When an
/// `ActiveController` is attached (spec §4.E/§4.F "Module E/F"), sends route
/// through its address-claim gate instead of writing straight to the bus,
/// and the reader drops frames not addressed to a locally claimed address.
pub struct DirectCanCoupler {
    name: String,
    interface: String,
    bandwidth_percent: f64,
    trace_path: Option<String>,
    dictionary: Arc<PgnDictionary>,
    burst: BurstConfig,
    controller: Option<Arc<tokio::sync::Mutex<ActiveController>>>,
    controller_started: bool,
    stop: Arc<AtomicBool>,
    reader_rx: Option<mpsc::Receiver<NMEA2000Msg>>,
    writer: Option<CanWriter>,
}

impl DirectCanCoupler {
    pub fn new(
        name: impl Into<String>,
        interface: impl Into<String>,
        bandwidth_percent: f64,
        trace_path: Option<String>,
        dictionary: Arc<PgnDictionary>,
        burst: BurstConfig,
        controller: Option<Arc<tokio::sync::Mutex<ActiveController>>>,
    ) -> Self {
        DirectCanCoupler {
            name: name.into(),
            interface: interface.into(),
            bandwidth_percent,
            trace_path,
            dictionary,
            burst,
            controller,
            controller_started: false,
            stop: Arc::new(AtomicBool::new(false)),
            reader_rx: None,
            writer: None,
        }
    }

    /// Starts address claim for every hosted application and spawns the
    /// recurring timer poll (heartbeats, claim timeouts) that drives the
    /// `ActiveController`'s applications after the writer is attached.
    /// Runs once per coupler lifetime, not on every reopen.
    async fn start_controller(&mut self, controller: Arc<tokio::sync::Mutex<ActiveController>>) {
        let outgoing = controller.lock().await.start_applications();
        for msg in outgoing {
            let _ = controller.lock().await.send(&msg, true).await;
        }
        if self.controller_started {
            return;
        }
        self.controller_started = true;
        let stop = self.stop.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(100));
            loop {
                ticker.tick().await;
                if stop.load(Ordering::Relaxed) {
                    return;
                }
                let outgoing = controller.lock().await.poll_timers(std::time::Instant::now());
                for msg in outgoing {
                    let _ = controller.lock().await.send(&msg, true).await;
                }
            }
        });
    }
}

#[async_trait]
impl Coupler for DirectCanCoupler {
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        Direction::Bidirectional
    }

    async fn open(&mut self) -> bool {
        self.stop.store(false, Ordering::Relaxed);
        let socket = Arc::new(open_with_retry(&self.interface).await);
        let trace = self.trace_path.as_ref().and_then(|p| CanTrace::open(Path::new(p)).ok()).map(Arc::new);
        let (tx, rx) = mpsc::channel(256);

        let local_addresses = match &self.controller {
            Some(controller) => controller.lock().await.local_addresses(),
            None => HashSet::new(),
        };
        let mut reader = CanReader::new(socket.clone(), trace.clone(), self.stop.clone(), self.dictionary.clone());
        reader.set_local_addresses(local_addresses);
        tokio::spawn(reader.run(tx));

        let writer = CanWriter::spawn(socket, trace, self.bandwidth_percent, self.burst);
        if let Some(controller) = self.controller.clone() {
            controller.lock().await.attach_writer(writer);
            self.start_controller(controller).await;
        } else {
            self.writer = Some(writer);
        }
        self.reader_rx = Some(rx);
        true
    }

    async fn read(&mut self) -> Result<Option<RouterMessage>, CouplerError> {
        let Some(rx) = &mut self.reader_rx else { return Err(CouplerError::Closed) };
        match timeout(Duration::from_millis(500), rx.recv()).await {
            Ok(Some(msg)) => Ok(Some(RouterMessage::Nmea2000(msg))),
            Ok(None) => Ok(None),
            Err(_) => Err(CouplerError::ReadTimeout),
        }
    }

    async fn send(&mut self, msg: &RouterMessage) -> Result<(), CouplerError> {
        let RouterMessage::Nmea2000(n2k) = msg else {
            return Err(CouplerError::Malformed("direct CAN coupler only sends NMEA2000 messages".into()));
        };
        if let Some(controller) = &self.controller {
            return controller.lock().await.send(n2k, false).await.map_err(|e| CouplerError::ReadError(e.to_string()));
        }
        let Some(writer) = &self.writer else { return Err(CouplerError::Closed) };
        writer.send(n2k.build_arbitration_id(), n2k.payload.clone()).await.map_err(|e| CouplerError::ReadError(e.to_string()))
    }

    async fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.reader_rx = None;
        self.writer = None;
    }
}

/// Lets an Injector publisher deliver into the same coupler instance
/// `run_coupler` is driving, by sharing the lock rather than the coupler.
#[async_trait]
impl Sendable for tokio::sync::Mutex<Box<dyn Coupler>> {
    async fn send(&self, msg: RouterMessage) -> Result<(), CouplerError> {
        self.lock().await.send(&msg).await
    }
}

/// A line-oriented source abstracted behind a trait so serial couplers are
/// testable without real hardware.
#[async_trait]
pub trait LineSource: Send {
    async fn open(&mut self) -> bool;
    async fn read_line(&mut self) -> Result<Option<String>, CouplerError>;
    async fn write_line(&mut self, line: &str) -> Result<(), CouplerError>;
}

/// Serial / NMEA0183 line port, generic over any [`LineSource`] (a real
/// serial port in production, an in-memory buffer in tests).
pub struct LineCoupler<S: LineSource> {
    name: String,
    source: S,
    direction: Direction,
}

impl<S: LineSource> LineCoupler<S> {
    pub fn new(name: impl Into<String>, source: S, direction: Direction) -> Self {
        LineCoupler { name: name.into(), source, direction }
    }
}

#[async_trait]
impl<S: LineSource> Coupler for LineCoupler<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    async fn open(&mut self) -> bool {
        self.source.open().await
    }

    async fn read(&mut self) -> Result<Option<RouterMessage>, CouplerError> {
        let Some(line) = self.source.read_line().await? else { return Ok(None) };
        if let Some(leader) = line.chars().next() {
            if leader == '$' || leader == '!' {
                match Sentence::parse(&line) {
                    Ok(sentence) if sentence.formatter == "PGN" => return Ok(Some(RouterMessage::Nmea2000(decode_mxpgn(&sentence, 0)?))),
                    Ok(sentence) if sentence.formatter == "DGY" => return Ok(Some(RouterMessage::Nmea2000(decode_pdgy(&sentence)?))),
                    Ok(sentence) => return Ok(Some(RouterMessage::Nmea0183(sentence))),
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(Some(RouterMessage::Raw(line.into_bytes())))
    }

    async fn send(&mut self, msg: &RouterMessage) -> Result<(), CouplerError> {
        let line = match msg {
            RouterMessage::Nmea0183(sentence) => sentence.render(),
            RouterMessage::Nmea2000(n2k) => decode_requires_encode(n2k),
            RouterMessage::Raw(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        };
        self.source.write_line(&line).await
    }

    async fn close(&mut self) {}
}

fn decode_requires_encode(n2k: &NMEA2000Msg) -> String {
    crate::envelope::encode_mxpgn(n2k).render()
}

/// TCP reader/writer coupler: reads CRLF-terminated lines from a connected
/// socket, same line-decode rules as [`LineCoupler`].
pub struct TcpCoupler {
    name: String,
    addr: String,
    direction: Direction,
    stream: Option<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    write_half: Option<tokio::net::tcp::OwnedWriteHalf>,
}

impl TcpCoupler {
    pub fn new(name: impl Into<String>, addr: impl Into<String>, direction: Direction) -> Self {
        TcpCoupler { name: name.into(), addr: addr.into(), direction, stream: None, write_half: None }
    }
}

#[async_trait]
impl Coupler for TcpCoupler {
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    async fn open(&mut self) -> bool {
        match TcpStream::connect(&self.addr).await {
            Ok(stream) => {
                let (read_half, write_half) = stream.into_split();
                self.stream = Some(BufReader::new(read_half));
                self.write_half = Some(write_half);
                true
            }
            Err(e) => {
                warn!(coupler = %self.name, error = %e, "failed to connect");
                false
            }
        }
    }

    async fn read(&mut self) -> Result<Option<RouterMessage>, CouplerError> {
        let Some(reader) = &mut self.stream else { return Err(CouplerError::Closed) };
        let mut line = String::new();
        let n = match timeout(Duration::from_secs(5), reader.read_line(&mut line)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(CouplerError::ReadError(e.to_string())),
            Err(_) => return Err(CouplerError::ReadTimeout),
        };
        if n == 0 {
            return Ok(None);
        }
        match line.chars().next() {
            Some('$') | Some('!') => {
                let sentence = Sentence::parse(&line)?;
                match sentence.formatter.as_str() {
                    "PGN" => Ok(Some(RouterMessage::Nmea2000(decode_mxpgn(&sentence, 0)?))),
                    "DGY" => Ok(Some(RouterMessage::Nmea2000(decode_pdgy(&sentence)?))),
                    _ => Ok(Some(RouterMessage::Nmea0183(sentence))),
                }
            }
            _ => Ok(Some(RouterMessage::Raw(line.into_bytes()))),
        }
    }

    async fn send(&mut self, msg: &RouterMessage) -> Result<(), CouplerError> {
        let Some(writer) = &mut self.write_half else { return Err(CouplerError::Closed) };
        let bytes = match msg {
            RouterMessage::Nmea0183(sentence) => sentence.render().into_bytes(),
            RouterMessage::Nmea2000(n2k) => crate::envelope::encode_mxpgn(n2k).render().into_bytes(),
            RouterMessage::Raw(bytes) => bytes.clone(),
        };
        writer.write_all(&bytes).await.map_err(|e| CouplerError::ReadError(e.to_string()))
    }

    async fn close(&mut self) {
        self.stream = None;
        self.write_half = None;
    }
}

/// UDP reader coupler: one datagram per `read()`.
pub struct UdpCoupler {
    name: String,
    bind_addr: String,
    socket: Option<UdpSocket>,
}

impl UdpCoupler {
    pub fn new(name: impl Into<String>, bind_addr: impl Into<String>) -> Self {
        UdpCoupler { name: name.into(), bind_addr: bind_addr.into(), socket: None }
    }
}

#[async_trait]
impl Coupler for UdpCoupler {
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        Direction::ReadOnly
    }

    async fn open(&mut self) -> bool {
        match UdpSocket::bind(&self.bind_addr).await {
            Ok(socket) => {
                self.socket = Some(socket);
                true
            }
            Err(e) => {
                warn!(coupler = %self.name, error = %e, "failed to bind");
                false
            }
        }
    }

    async fn read(&mut self) -> Result<Option<RouterMessage>, CouplerError> {
        let Some(socket) = &self.socket else { return Err(CouplerError::Closed) };
        let mut buf = [0u8; 2048];
        let n = match timeout(Duration::from_secs(5), socket.recv(&mut buf)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(CouplerError::ReadError(e.to_string())),
            Err(_) => return Err(CouplerError::ReadTimeout),
        };
        Ok(Some(RouterMessage::Raw(buf[..n].to_vec())))
    }

    async fn send(&mut self, _msg: &RouterMessage) -> Result<(), CouplerError> {
        Err(CouplerError::Malformed("UDP coupler is read-only".into()))
    }

    async fn close(&mut self) {
        self.socket = None;
    }
}

/// Replays a YDWG-format log file: `<timestamp> R <id-hex> <byte-hex> ...`
/// (spec §6). `R` marks a receive line; other directions are ignored.
pub struct ReplayCoupler {
    name: String,
    path: String,
    lines: Option<std::io::Lines<std::io::BufReader<std::fs::File>>>,
}

impl ReplayCoupler {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        ReplayCoupler { name: name.into(), path: path.into(), lines: None }
    }

    fn parse_ydwg_line(line: &str) -> Result<Option<NMEA2000Msg>, CouplerError> {
        let mut parts = line.split_whitespace();
        let _timestamp = parts.next();
        let direction = parts.next();
        if direction != Some("R") {
            return Ok(None);
        }
        let id_hex = parts.next().ok_or_else(|| CouplerError::Malformed("YDWG line missing id".into()))?;
        let can_id = u32::from_str_radix(id_hex, 16).map_err(|_| CouplerError::Malformed("bad YDWG can id".into()))?;
        let payload: Result<Vec<u8>, _> = parts.map(|b| u8::from_str_radix(b, 16)).collect();
        let payload = payload.map_err(|_| CouplerError::Malformed("bad YDWG data byte".into()))?;
        let (pgn, da, sa, priority) = NMEA2000Msg::parse_arbitration_id(can_id);
        Ok(Some(NMEA2000Msg::new(pgn, priority, sa, da, payload)))
    }
}

#[async_trait]
impl Coupler for ReplayCoupler {
    fn name(&self) -> &str {
        &self.name
    }

    fn direction(&self) -> Direction {
        Direction::ReadOnly
    }

    async fn open(&mut self) -> bool {
        match std::fs::File::open(&self.path) {
            Ok(file) => {
                use std::io::BufRead;
                self.lines = Some(std::io::BufReader::new(file).lines());
                true
            }
            Err(e) => {
                warn!(coupler = %self.name, error = %e, "failed to open replay log");
                false
            }
        }
    }

    async fn read(&mut self) -> Result<Option<RouterMessage>, CouplerError> {
        let Some(lines) = &mut self.lines else { return Err(CouplerError::Closed) };
        loop {
            match lines.next() {
                Some(Ok(line)) => {
                    if let Some(msg) = Self::parse_ydwg_line(&line)? {
                        return Ok(Some(RouterMessage::Nmea2000(msg)));
                    }
                }
                Some(Err(e)) => return Err(CouplerError::ReadError(e.to_string())),
                None => return Ok(None),
            }
        }
    }

    async fn send(&mut self, _msg: &RouterMessage) -> Result<(), CouplerError> {
        Err(CouplerError::Malformed("replay coupler is read-only".into()))
    }

    async fn close(&mut self) {
        self.lines = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MemoryLineSource {
        lines: std::collections::VecDeque<String>,
        written: Vec<String>,
    }

    #[async_trait]
    impl LineSource for MemoryLineSource {
        async fn open(&mut self) -> bool {
            true
        }

        async fn read_line(&mut self) -> Result<Option<String>, CouplerError> {
            Ok(self.lines.pop_front())
        }

        async fn write_line(&mut self, line: &str) -> Result<(), CouplerError> {
            self.written.push(line.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn line_coupler_decodes_talker_sentences() {
        let sentence = Sentence::new("GP", "GLL", vec!["4807.038".into(), "N".into()]).render();
        let source = MemoryLineSource { lines: [sentence].into(), written: vec![] };
        let mut coupler = LineCoupler::new("serial0", source, Direction::ReadOnly);
        assert!(coupler.open().await);
        let msg = coupler.read().await.unwrap().unwrap();
        assert!(matches!(msg, RouterMessage::Nmea0183(_)));
    }

    #[tokio::test]
    async fn replay_coupler_parses_ydwg_lines() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("ydwg-test-{}.log", std::process::id()));
        std::fs::write(&path, "12:00:00.000 R 09F11203 01 02 03 04 05 06 07 08\n").unwrap();
        let mut coupler = ReplayCoupler::new("replay0", path.to_string_lossy().to_string());
        assert!(coupler.open().await);
        let msg = coupler.read().await.unwrap().unwrap();
        let RouterMessage::Nmea2000(n2k) = msg else { panic!("expected NMEA2000 message") };
        assert_eq!(n2k.payload.len(), 8);
        std::fs::remove_file(&path).ok();
    }

    struct CountingOpenSource {
        lines: std::collections::VecDeque<String>,
        opens: Arc<std::sync::atomic::AtomicU32>,
    }

    #[async_trait]
    impl LineSource for CountingOpenSource {
        async fn open(&mut self) -> bool {
            self.opens.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            true
        }

        async fn read_line(&mut self) -> Result<Option<String>, CouplerError> {
            Ok(self.lines.pop_front())
        }

        async fn write_line(&mut self, _line: &str) -> Result<(), CouplerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn run_coupler_opens_once_for_a_multi_message_session() {
        let sentence = Sentence::new("GP", "GLL", vec!["4807.038".into(), "N".into()]).render();
        let opens = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let source = CountingOpenSource { lines: [sentence.clone(), sentence.clone(), sentence].into(), opens: opens.clone() };
        let coupler: Box<dyn Coupler> = Box::new(LineCoupler::new("serial0", source, Direction::ReadOnly));
        let coupler = Arc::new(tokio::sync::Mutex::new(coupler));
        let handle = CouplerHandle::default();
        let (_stop_tx, stop_rx) = mpsc::channel(1);
        run_coupler(coupler, handle, 1, Duration::from_millis(10), stop_rx).await;
        assert_eq!(opens.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
