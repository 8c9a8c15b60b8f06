//! CAN transport: frame reader/writer tasks, reassembly dispatch, write pacing and
//! tracing (spec §4.D).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socketcan::tokio::CanSocket;
use socketcan::{CanFrame, EmbeddedFrame, ExtendedId, Id};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::CanInterfaceError;
use crate::fast_packet::FastPacketHandler;
use crate::iso_tp::IsoTpHandler;
use crate::message::NMEA2000Msg;
use crate::pgn::{pgn_pdu1_adjust, PgnDictionary};

const BAM_TPCM: u32 = 60416;
const BAM_TPDT: u32 = 60160;
const WRITE_QUEUE_CAPACITY: usize = 50;
const MAX_THROUGHPUT_PER_SEC: f64 = 2000.0;

/// CAN writer burst pacing (spec §12): once the outgoing queue backs up past
/// `threshold` pending frames, `size` frames are flushed back-to-back
/// (`spacing` apart) instead of one at a time at `bandwidth_percent`'s pace.
/// Defaults match the router's prior fixed behavior.
#[derive(Debug, Clone, Copy)]
pub struct BurstConfig {
    pub threshold: usize,
    pub size: usize,
    pub spacing: Duration,
}

impl Default for BurstConfig {
    fn default() -> Self {
        BurstConfig { threshold: WRITE_QUEUE_CAPACITY.saturating_sub(2), size: 5, spacing: Duration::from_millis(2) }
    }
}

/// Appends `direction,arbitration_id,payload_hex` lines to a trace file (spec §4.D).
pub struct CanTrace {
    writer: std::sync::Mutex<std::io::BufWriter<std::fs::File>>,
    count: AtomicU64,
}

impl CanTrace {
    pub fn open(path: &std::path::Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(CanTrace { writer: std::sync::Mutex::new(std::io::BufWriter::new(file)), count: AtomicU64::new(0) })
    }

    pub fn record(&self, direction: char, can_id: u32, data: &[u8]) {
        use std::io::Write;
        let n = self.count.fetch_add(1, Ordering::Relaxed);
        let hex: String = data.iter().map(|b| format!("{b:02X}")).collect();
        if let Ok(mut w) = self.writer.lock() {
            let _ = writeln!(w, "{n},{direction},{can_id:08X},{hex}");
            let _ = w.flush();
        }
    }
}

/// Bandwidth-paced, burst-capable CAN frame sender, running as an async task.
/// Cheaply cloneable: every clone shares the same queue and writer task, so
/// an `ActiveController` and its coupler can both hold a handle to it.
#[derive(Clone)]
pub struct CanWriter {
    tx: mpsc::Sender<(u32, Vec<u8>)>,
}

impl CanWriter {
    pub fn spawn(socket: Arc<CanSocket>, trace: Option<Arc<CanTrace>>, bandwidth_percent: f64, burst: BurstConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<(u32, Vec<u8>)>(WRITE_QUEUE_CAPACITY);
        let min_interval = Duration::from_secs_f64((100.0 / bandwidth_percent.clamp(5.0, 50.0)) / MAX_THROUGHPUT_PER_SEC);

        tokio::spawn(async move {
            let mut last_write = Instant::now();
            let mut consecutive_errors = 0u32;

            while let Some((can_id, data)) = rx.recv().await {
                let burst_size = if rx.len() > burst.threshold { burst.size } else { 1 };
                if burst_size == 1 {
                    let elapsed = last_write.elapsed();
                    if elapsed < min_interval {
                        tokio::time::sleep(min_interval - elapsed).await;
                    }
                }

                if let Some(t) = &trace {
                    t.record('O', can_id, &data);
                }

                match send_one(&socket, can_id, &data).await {
                    Ok(()) => {
                        last_write = Instant::now();
                        consecutive_errors = 0;
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        error!(can_id, error = %e, attempt = consecutive_errors, "CAN write failed");
                        last_write = Instant::now();
                        if consecutive_errors > 20 {
                            error!("CAN writer giving up after repeated failures, stopping task");
                            break;
                        }
                    }
                }

                let mut remaining_burst = burst_size - 1;
                while remaining_burst > 0 {
                    match rx.try_recv() {
                        Ok((can_id, data)) => {
                            if let Some(t) = &trace {
                                t.record('O', can_id, &data);
                            }
                            if send_one(&socket, can_id, &data).await.is_ok() {
                                last_write = Instant::now();
                            }
                            tokio::time::sleep(burst.spacing).await;
                            remaining_burst -= 1;
                        }
                        Err(_) => break,
                    }
                }
            }
        });

        CanWriter { tx }
    }

    pub async fn send(&self, can_id: u32, data: Vec<u8>) -> Result<(), CanInterfaceError> {
        self.tx
            .send((can_id, data))
            .await
            .map_err(|_| CanInterfaceError::Fatal("CAN write task has stopped".into()))
    }
}

async fn send_one(socket: &CanSocket, can_id: u32, data: &[u8]) -> Result<(), CanInterfaceError> {
    let id = ExtendedId::new(can_id).ok_or_else(|| CanInterfaceError::Fatal(format!("invalid arbitration id {can_id:08X}")))?;
    let frame = CanFrame::new(Id::Extended(id), data).ok_or_else(|| CanInterfaceError::Fatal("frame payload too long".into()))?;
    socket.write_frame(frame).await.map_err(|e| CanInterfaceError::Socket(e.into()))
}

/// The read side: owns Fast-Packet and ISO-TP reassembly state for one CAN channel
/// and emits fully reassembled `NMEA2000Msg`s on `out`.
pub struct CanReader {
    socket: Arc<CanSocket>,
    fast_packet: FastPacketHandler,
    iso_tp: IsoTpHandler,
    local_addresses: HashSet<u8>,
    trace: Option<Arc<CanTrace>>,
    stop: Arc<AtomicBool>,
    dictionary: Arc<PgnDictionary>,
}

impl CanReader {
    pub fn new(socket: Arc<CanSocket>, trace: Option<Arc<CanTrace>>, stop: Arc<AtomicBool>, dictionary: Arc<PgnDictionary>) -> Self {
        CanReader {
            socket,
            fast_packet: FastPacketHandler::new(),
            iso_tp: IsoTpHandler::new(),
            local_addresses: HashSet::new(),
            trace,
            stop,
            dictionary,
        }
    }

    pub fn set_local_addresses(&mut self, addresses: HashSet<u8>) {
        self.local_addresses = addresses;
    }

    /// Runs until stopped, pushing completed messages into `out` (spec §4.D "One
    /// background reader task").
    pub async fn run(mut self, out: mpsc::Sender<NMEA2000Msg>) {
        while !self.stop.load(Ordering::Relaxed) {
            let frame = match tokio::time::timeout(Duration::from_millis(500), self.socket.read_frame()).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(e)) => {
                    warn!(error = %e, "CAN read error");
                    continue;
                }
                Err(_) => continue,
            };

            let CanFrame::Data(data_frame) = frame else { continue };
            let Id::Extended(ext) = data_frame.id() else { continue };
            let can_id = ext.as_raw();
            let (pgn, da) = pgn_pdu1_adjust((can_id >> 8) & 0x1FFFF);

            if !self.local_addresses.is_empty() && da != 0xFF && !self.local_addresses.contains(&da) {
                debug!(pgn, da, "discarding frame not addressed to a locally claimed address");
                continue;
            }

            let sa = (can_id & 0xFF) as u8;
            let priority = ((can_id >> 26) & 0x7) as u8;
            let data = data_frame.data();

            if let Some(t) = &self.trace {
                t.record('I', can_id, data);
            }

            if let Some(msg) = self.reassemble(pgn, sa, da, priority, data) {
                if out.send(msg).await.is_err() {
                    break;
                }
            }
        }
    }

    fn reassemble(&mut self, pgn: u32, sa: u8, da: u8, priority: u8, data: &[u8]) -> Option<NMEA2000Msg> {
        if pgn == BAM_TPCM {
            self.iso_tp.new_transaction(sa, priority, data);
            return None;
        }
        if pgn == BAM_TPDT {
            return match self.iso_tp.incoming_packet(sa, data) {
                Ok(Some((target_pgn, prio, payload))) => Some(NMEA2000Msg::new(target_pgn, prio, sa, 0xFF, payload)),
                Ok(None) => None,
                Err(e) => {
                    warn!(sa, error = %e, "ISO-TP transaction discarded");
                    None
                }
            };
        }

        let is_fast_packet = self.dictionary.is_fast_packet(pgn);
        let active = self.fast_packet.is_pgn_active(pgn, sa, data);

        if active || is_fast_packet {
            return match self.fast_packet.process_frame(pgn, sa, data) {
                Ok(Some(payload)) => Some(NMEA2000Msg::new(pgn, priority, sa, da, payload)),
                Ok(None) => None,
                Err(e) => {
                    error!(pgn, sa, error = %e, "fast packet reassembly error");
                    None
                }
            };
        }

        Some(NMEA2000Msg::new(pgn, priority, sa, da, data.to_vec()))
    }
}

pub async fn open_with_retry(channel: &str) -> CanSocket {
    loop {
        match CanSocket::open(channel) {
            Ok(socket) => {
                info!(channel, "CAN interface opened");
                return socket;
            }
            Err(e) => {
                warn!(channel, error = %e, "failed to open CAN interface, retrying in 10s");
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        }
    }
}
