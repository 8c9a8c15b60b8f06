use thiserror::Error;

/// Errors raised while looking up or decoding/encoding against the PGN dictionary (spec §4.A, §7).
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("PGN {0} is not present in the dictionary")]
    UnknownPgn(u32),
    #[error("PGN {pgn} field '{field}' out of range: {detail}")]
    FieldOutOfRange { pgn: u32, field: String, detail: String },
    #[error("PGN {pgn} payload too short: expected at least {expected} bytes, got {actual}")]
    PayloadTooShort { pgn: u32, expected: usize, actual: usize },
    #[error("enum key {key} not defined for field '{field}' of PGN {pgn}")]
    MissingEnumKey { pgn: u32, field: String, key: i64 },
    #[error("malformed PGN definition: {0}")]
    DefinitionError(String),
    #[error("failed to parse PGN schema XML: {0}")]
    XmlError(#[from] roxmltree::Error),
}

/// Errors from Fast-Packet reassembly (spec §4.B).
#[derive(Debug, Error)]
pub enum FastPacketError {
    #[error("PGN {pgn} from address {sa}: first frame must start at counter 0, got {counter}")]
    WrongFirstFrame { pgn: u32, sa: u8, counter: u8 },
    #[error("PGN {pgn} from address {sa} sequence {seq}: duplicate frame index {counter}")]
    DuplicateFrame { pgn: u32, sa: u8, seq: u8, counter: u8 },
    #[error("PGN {pgn} from address {sa} sequence {seq}: missing frame index {counter} at reassembly")]
    MissingFrame { pgn: u32, sa: u8, seq: u8, counter: u8 },
    #[error("PGN {0} has no outstanding send sequence to free")]
    NoOutstandingSequence(u32),
}

/// Errors from ISO-TP / J1939-21 reassembly (spec §4.C).
#[derive(Debug, Error)]
pub enum IsoTpError {
    #[error("TPDT received from address {0} without a preceding TPCM announcement")]
    UnexpectedDataPacket(u8),
    #[error("ISO-TP transaction from address {sa}: byte count mismatch, expected {expected}, got {actual}")]
    LengthMismatch { sa: u8, expected: usize, actual: usize },
}

/// Fatal and transient errors from the CAN transport (spec §4.D, §7).
#[derive(Debug, Error)]
pub enum CanInterfaceError {
    #[error("CAN channel '{0}' is not available")]
    ChannelUnavailable(String),
    #[error("CAN socket error: {0}")]
    Socket(#[from] socketcan::Error),
    #[error("CAN interface fatal: {0}")]
    Fatal(String),
    #[error("send refused: no address has been claimed on this controller yet")]
    NotClaimed,
}
