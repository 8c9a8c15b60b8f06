//! J1939-21 Transport Protocol (ISO-TP), broadcast (BAM) variant only on receive
//! (spec §4.C).

use std::collections::HashMap;

use crate::error::IsoTpError;

struct Transaction {
    expected_packets: u8,
    total_bytes: usize,
    target_pgn: u32,
    priority: u8,
    buffer: Vec<u8>,
    received_packets: u8,
}

/// Keyed by source address: only one outstanding broadcast transaction per sender.
pub struct IsoTpHandler {
    transactions: HashMap<u8, Transaction>,
}

impl Default for IsoTpHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl IsoTpHandler {
    pub fn new() -> Self {
        IsoTpHandler { transactions: HashMap::new() }
    }

    /// Handle a TPCM-BAM announcement (PGN 60416).
    pub fn new_transaction(&mut self, sa: u8, priority: u8, data: &[u8]) {
        let total_bytes = u16::from_le_bytes([data[1], data[2]]) as usize;
        let expected_packets = data[3];
        let target_pgn = u32::from_le_bytes([data[5], data[6], data[7], 0]);
        self.transactions.insert(
            sa,
            Transaction { expected_packets, total_bytes, target_pgn, priority, buffer: Vec::with_capacity(total_bytes), received_packets: 0 },
        );
    }

    /// Handle a TPDT data packet (PGN 60160). Returns the reassembled payload plus the
    /// target PGN and priority once the announced packet count is reached.
    pub fn incoming_packet(&mut self, sa: u8, data: &[u8]) -> Result<Option<(u32, u8, Vec<u8>)>, IsoTpError> {
        let transaction = self.transactions.get_mut(&sa).ok_or(IsoTpError::UnexpectedDataPacket(sa))?;
        transaction.buffer.extend_from_slice(&data[1..8]);
        transaction.received_packets += 1;

        if transaction.received_packets < transaction.expected_packets {
            return Ok(None);
        }

        let transaction = self.transactions.remove(&sa).expect("checked above");
        if transaction.buffer.len() < transaction.total_bytes {
            return Err(IsoTpError::LengthMismatch {
                sa,
                expected: transaction.total_bytes,
                actual: transaction.buffer.len(),
            });
        }
        let mut payload = transaction.buffer;
        payload.truncate(transaction.total_bytes);
        Ok(Some((transaction.target_pgn, transaction.priority, payload)))
    }

    /// Build the TPCM-BAM announcement frame plus the TPDT data frames for sending
    /// `payload` as `target_pgn` over broadcast ISO-TP.
    pub fn new_output_transaction(priority: u8, target_pgn: u32, payload: &[u8]) -> ([u8; 8], Vec<[u8; 8]>) {
        let total_packets = payload.len().div_ceil(7) as u8;
        let mut tpcm = [0xFFu8; 8];
        tpcm[0] = 0x20; // BAM control byte
        let len_bytes = (payload.len() as u16).to_le_bytes();
        tpcm[1] = len_bytes[0];
        tpcm[2] = len_bytes[1];
        tpcm[3] = total_packets;
        let pgn_bytes = target_pgn.to_le_bytes();
        tpcm[5] = pgn_bytes[0];
        tpcm[6] = pgn_bytes[1];
        tpcm[7] = pgn_bytes[2];
        let _ = priority;

        let mut frames = Vec::with_capacity(total_packets as usize);
        for (i, chunk) in payload.chunks(7).enumerate() {
            let mut frame = [0xFFu8; 8];
            frame[0] = (i + 1) as u8;
            frame[1..1 + chunk.len()].copy_from_slice(chunk);
            frames.push(frame);
        }
        (tpcm, frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_bam_transaction() {
        let payload: Vec<u8> = (0u8..20).collect();
        let (tpcm, tpdt_frames) = IsoTpHandler::new_output_transaction(6, 126998, &payload);

        let mut handler = IsoTpHandler::new();
        handler.new_transaction(11, 6, &tpcm);

        let mut result = None;
        for frame in &tpdt_frames {
            result = handler.incoming_packet(11, frame).unwrap();
        }
        let (pgn, priority, data) = result.unwrap();
        assert_eq!(pgn, 126998);
        assert_eq!(priority, 6);
        assert_eq!(data, payload);
    }

    #[test]
    fn data_packet_without_announcement_is_an_error() {
        let mut handler = IsoTpHandler::new();
        let frame = [1u8, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(handler.incoming_packet(5, &frame), Err(IsoTpError::UnexpectedDataPacket(5))));
    }
}
