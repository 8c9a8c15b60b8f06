//! The fixed J1939/NMEA2000 PGN range table (spec §3, §4.A).
//!
//! Every PGN falls into exactly one of nine ranges. The range decides the
//! PDU addressing mode and, for all but the "standard mixed" range, whether
//! the PGN is transported as a single CAN frame or as a Fast-Packet.

/// PDU1 carries an explicit destination address in the low byte of the
/// arbitration id's PGN field; PDU2 is pure broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduType {
    Pdu1,
    Pdu2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeKind {
    CanJ1939,
    StdSingleFrameAddressed,
    PropSingleFrameAddressed,
    StdSingleFrame,
    PropSingleFrame,
    StdFastPacketAddressed,
    PropFastPacketAddressed,
    /// 0x1F000-0x1FEFF: fast/single packet decided by the PGN's own byte length.
    StdMixed,
    PropFastPacket,
}

pub struct PgnRange {
    pub start: u32,
    pub end: u32,
    pub pdu: PduType,
    pub kind: RangeKind,
    pub description: &'static str,
}

pub const PGN_RANGES: &[PgnRange] = &[
    PgnRange { start: 0, end: 0xE7FF, pdu: PduType::Pdu1, kind: RangeKind::CanJ1939, description: "CAN J1939 PGN" },
    PgnRange { start: 0xE800, end: 0xEEFF, pdu: PduType::Pdu1, kind: RangeKind::StdSingleFrameAddressed, description: "Standard single-frame addressed" },
    PgnRange { start: 0xEF00, end: 0xEFFF, pdu: PduType::Pdu1, kind: RangeKind::PropSingleFrameAddressed, description: "Proprietary single-frame addressed" },
    PgnRange { start: 0xF000, end: 0xFEFF, pdu: PduType::Pdu2, kind: RangeKind::StdSingleFrame, description: "Standard single-frame non-addressed" },
    PgnRange { start: 0xFF00, end: 0xFFFF, pdu: PduType::Pdu2, kind: RangeKind::PropSingleFrame, description: "Proprietary single-frame non-addressed" },
    PgnRange { start: 0x10000, end: 0x1EE00, pdu: PduType::Pdu1, kind: RangeKind::StdFastPacketAddressed, description: "Standard fast packet addressed" },
    PgnRange { start: 0x1EF00, end: 0x1EFFF, pdu: PduType::Pdu1, kind: RangeKind::PropFastPacketAddressed, description: "Proprietary fast packet addressed" },
    PgnRange { start: 0x1F000, end: 0x1FEFF, pdu: PduType::Pdu2, kind: RangeKind::StdMixed, description: "Standard mixed (fast/single) packet non addressed" },
    PgnRange { start: 0x1FF00, end: 0x1FFFF, pdu: PduType::Pdu2, kind: RangeKind::PropFastPacket, description: "Proprietary fast packet non-addressed" },
];

/// PGNs that carry protocol/network-management semantics rather than data (ISO Request,
/// Address Claim, Commanded Address, Group Function, Heartbeat, Product/Config Information).
pub const SERVICE_PGNS: &[u32] = &[59392, 59904, 60928, 65240, 126208, 126464, 126993, 126996, 126998];

pub fn find_range(pgn: u32) -> Option<&'static PgnRange> {
    PGN_RANGES.iter().find(|r| pgn >= r.start && pgn <= r.end)
}

pub fn is_pgn_proprietary(pgn: u32) -> bool {
    match find_range(pgn).map(|r| r.kind) {
        Some(RangeKind::PropSingleFrameAddressed)
        | Some(RangeKind::PropSingleFrame)
        | Some(RangeKind::PropFastPacketAddressed)
        | Some(RangeKind::PropFastPacket) => true,
        _ => false,
    }
}

/// Split a raw 17-bit PGN-with-destination field (as read from the CAN arbitration id,
/// shifted down by 8 bits) into the stored PGN and the destination address.
///
/// PDU1 (pdu format byte < 240): the low byte is the destination address and is masked
/// out of the stored PGN. PDU2: the low byte is part of the PGN and `da` is always 255
/// (spec §3, "NMEA2000 raw message" invariants).
pub fn pgn_pdu1_adjust(raw_pgn: u32) -> (u32, u8) {
    let pdu_format = (raw_pgn >> 8) & 0xFF;
    if pdu_format < 240 {
        (raw_pgn & 0x1FF00, (raw_pgn & 0xFF) as u8)
    } else {
        (raw_pgn, 0xFF)
    }
}

pub fn pdu_type_of(pgn: u32) -> PduType {
    find_range(pgn).map(|r| r.pdu).unwrap_or(PduType::Pdu2)
}

pub fn is_pdu1(pgn: u32) -> bool {
    matches!(pdu_type_of(pgn), PduType::Pdu1)
}

/// True if the range alone decides Fast-Packet framing (every range but the "mixed" one).
pub fn fast_packet_by_range(pgn: u32) -> Option<bool> {
    let range = find_range(pgn)?;
    match range.kind {
        RangeKind::StdMixed => None,
        RangeKind::StdFastPacketAddressed
        | RangeKind::PropFastPacketAddressed
        | RangeKind::PropFastPacket => Some(true),
        _ => Some(false),
    }
}

pub fn pgn_for_controller(pgn: u32) -> bool {
    if pgn <= PGN_RANGES[0].end {
        return true;
    }
    SERVICE_PGNS.contains(&pgn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdu2_broadcast_heading() {
        // 127250 Vessel Heading, scenario 1 of spec §8.
        let (pgn, da) = pgn_pdu1_adjust(127250);
        assert_eq!(pgn, 127250);
        assert_eq!(da, 255);
        assert!(!is_pdu1(127250));
    }

    #[test]
    fn pdu1_iso_request() {
        // raw id 0x18EA0A23 => pgn field (id>>8)&0x1FFFF = 0xEA0A, da=0x0A
        let raw = (0x18EA0A23u32 >> 8) & 0x1FFFF;
        let (pgn, da) = pgn_pdu1_adjust(raw);
        assert_eq!(pgn, 59904);
        assert_eq!(da, 10);
        assert!(is_pdu1(pgn));
    }

    #[test]
    fn fast_packet_range_standard_fixed() {
        assert_eq!(fast_packet_by_range(129029), Some(true));
        assert_eq!(fast_packet_by_range(127250), Some(false));
        assert_eq!(fast_packet_by_range(0x1F100), None);
    }
}
