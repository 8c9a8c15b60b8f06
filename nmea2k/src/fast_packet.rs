//! Fast-Packet reassembly for NMEA2000 payloads over 8 bytes (spec §4.B).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::FastPacketError;

type Key = (u32, u8, u8);

struct Sequence {
    pgn: u32,
    source: u8,
    seq: u8,
    byte_length: usize,
    frames: HashMap<u8, Vec<u8>>,
    received_bytes: usize,
    frame_count: usize,
    started: Instant,
}

impl Sequence {
    fn new(pgn: u32, source: u8, seq: u8) -> Self {
        Sequence {
            pgn,
            source,
            seq,
            byte_length: 0,
            frames: HashMap::new(),
            received_bytes: 0,
            frame_count: 0,
            started: Instant::now(),
        }
    }

    fn first_packet(&mut self, frame: &[u8]) {
        self.byte_length = frame[1] as usize;
        let l7 = self.byte_length.saturating_sub(6);
        let nb7 = l7.div_ceil(7);
        self.frame_count = nb7 + 1;
        self.frames.insert(0, frame[2..].to_vec());
        self.received_bytes += 6;
    }

    fn add_packet(&mut self, frame: &[u8]) -> Result<(), FastPacketError> {
        let counter = frame[0] & 0x1F;
        if self.frames.contains_key(&counter) {
            return Err(FastPacketError::DuplicateFrame { pgn: self.pgn, sa: self.source, seq: self.seq, counter });
        }
        self.received_bytes += frame.len() - 1;
        self.frames.insert(counter, frame[1..].to_vec());
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.frame_count > 0
            && (self.received_bytes >= self.byte_length || self.frames.len() >= self.frame_count)
    }

    fn reassemble(&self) -> Result<Vec<u8>, FastPacketError> {
        let mut result = Vec::with_capacity(self.byte_length);
        for i in 0..self.frame_count as u8 {
            let chunk = self.frames.get(&i).ok_or(FastPacketError::MissingFrame {
                pgn: self.pgn,
                sa: self.source,
                seq: self.seq,
                counter: i,
            })?;
            result.extend_from_slice(chunk);
        }
        result.truncate(self.byte_length);
        Ok(result)
    }

    fn is_still_valid(&self) -> bool {
        self.frame_count > 0 && self.started.elapsed() < Duration::from_millis(10 * self.frame_count as u64)
    }
}

/// One instance is bound to a single coupler and reassembles every Fast-Packet PGN it
/// sees from any source address concurrently (spec §4.B).
pub struct FastPacketHandler {
    sequences: HashMap<Key, Sequence>,
    write_sequences: HashMap<u32, u8>,
}

impl Default for FastPacketHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl FastPacketHandler {
    pub fn new() -> Self {
        FastPacketHandler { sequences: HashMap::new(), write_sequences: HashMap::new() }
    }

    /// Feed one CAN frame's 8-byte payload. Returns the reassembled payload once the
    /// sequence completes, or `None` while reassembly is still in progress.
    pub fn process_frame(&mut self, pgn: u32, addr: u8, frame: &[u8]) -> Result<Option<Vec<u8>>, FastPacketError> {
        let seq = (frame[0] >> 5) & 7;
        let counter = frame[0] & 0x1F;
        let key = (pgn, addr, seq);

        if counter == 0 {
            // A fresh counter 0 always starts a new sequence, discarding any
            // in-flight one for this key.
            self.sequences.insert(key, Sequence::new(pgn, addr, seq));
        } else if !self.sequences.contains_key(&key) {
            return Err(FastPacketError::WrongFirstFrame { pgn, sa: addr, counter });
        }

        let handle = self.sequences.get_mut(&key).expect("just inserted");
        if counter == 0 {
            handle.first_packet(frame);
        } else if let Err(e) = handle.add_packet(frame) {
            self.sequences.remove(&key);
            return Err(e);
        }

        let handle = self.sequences.get(&key).expect("present");
        if handle.is_complete() {
            let result = handle.reassemble();
            self.sequences.remove(&key);
            result.map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn is_pgn_active(&self, pgn: u32, addr: u8, frame: &[u8]) -> bool {
        let seq = (frame[0] >> 5) & 7;
        self.sequences.contains_key(&(pgn, addr, seq))
    }

    /// Drop sequences that have stalled longer than 10ms per expected frame (spec §4.B).
    pub fn collect_garbage(&mut self) {
        self.sequences.retain(|_, s| s.is_still_valid());
    }

    /// Split an outgoing payload into Fast-Packet frames, each 8 bytes.
    pub fn split_message(&mut self, pgn: u32, data: &[u8]) -> Result<Vec<[u8; 8]>, FastPacketError> {
        let nb_frames = data.len().saturating_sub(6).div_ceil(7) + 1;
        let seq = self.allocate_seq(pgn)?;
        let seq_bits = seq << 5;
        let mut frames = Vec::with_capacity(nb_frames);
        let mut data_ptr = 0usize;

        for counter in 0..nb_frames as u8 {
            let mut frame = [0xFFu8; 8];
            frame[0] = seq_bits | counter;
            let mut ptr = 1usize;
            if counter == 0 {
                frame[1] = data.len() as u8;
                ptr += 1;
            }
            while ptr < 8 && data_ptr < data.len() {
                frame[ptr] = data[data_ptr];
                data_ptr += 1;
                ptr += 1;
            }
            frames.push(frame);
        }

        self.free_seq(pgn);
        Ok(frames)
    }

    /// One outstanding send sequence per PGN (spec §12 / SPEC_FULL open-question decision).
    fn allocate_seq(&mut self, pgn: u32) -> Result<u8, FastPacketError> {
        let in_use = *self.write_sequences.get(&pgn).unwrap_or(&0);
        if in_use != 0 {
            return Err(FastPacketError::NoOutstandingSequence(pgn));
        }
        self.write_sequences.insert(pgn, 1);
        Ok(1)
    }

    fn free_seq(&mut self, pgn: u32) {
        self.write_sequences.insert(pgn, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_a_round_tripped_message() {
        let mut handler = FastPacketHandler::new();
        let payload: Vec<u8> = (0u8..20).collect();
        let frames = handler.split_message(129029, &payload).unwrap();

        let mut result = None;
        for frame in &frames {
            result = handler.process_frame(129029, 7, frame).unwrap();
        }
        assert_eq!(result.unwrap(), payload);
    }

    #[test]
    fn rejects_frame_not_starting_sequence() {
        let mut handler = FastPacketHandler::new();
        let frame = [0x21u8, 0, 0, 0, 0, 0, 0, 0];
        let err = handler.process_frame(129029, 3, &frame).unwrap_err();
        assert!(matches!(err, FastPacketError::WrongFirstFrame { .. }));
    }

    #[test]
    fn concurrent_sources_do_not_interfere() {
        let mut handler = FastPacketHandler::new();
        let payload_a: Vec<u8> = (0u8..12).collect();
        let payload_b: Vec<u8> = (100u8..112).collect();
        let frames_a = handler.split_message(127506, &payload_a).unwrap();
        let frames_b = handler.split_message(127506, &payload_b).unwrap();

        let mut result_a = None;
        let mut result_b = None;
        for frame in &frames_a {
            result_a = handler.process_frame(127506, 1, frame).unwrap();
        }
        for frame in &frames_b {
            result_b = handler.process_frame(127506, 2, frame).unwrap();
        }
        assert_eq!(result_a.unwrap(), payload_a);
        assert_eq!(result_b.unwrap(), payload_b);
    }
}
