//! Top-level error aggregation for the router binary (spec §7).

use thiserror::Error;

use nmea2k::{CanInterfaceError, CodecError, FastPacketError, IsoTpError};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    FastPacket(#[from] FastPacketError),

    #[error(transparent)]
    IsoTp(#[from] IsoTpError),

    #[error(transparent)]
    CanInterface(#[from] CanInterfaceError),

    #[error(transparent)]
    Coupler(#[from] CouplerError),

    #[error("fatal: {0}")]
    Fatal(String),
}

/// Missing class, bad YAML, unresolvable factory — abort startup (spec §7 "Configuration error").
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse YAML configuration: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("unknown component class '{0}'")]
    UnknownClass(String),

    #[error("component '{name}' is missing required field '{field}'")]
    MissingField { name: String, field: String },

    #[error("failed to read PGN schema {path}: {source}")]
    SchemaRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse PGN schema {path}: {source}")]
    SchemaParse {
        path: String,
        #[source]
        source: CodecError,
    },
}

/// Transport transient vs. fatal errors for couplers (spec §7).
#[derive(Debug, Error)]
pub enum CouplerError {
    #[error("read timed out")]
    ReadTimeout,

    #[error("read error: {0}")]
    ReadError(String),

    #[error("end of stream")]
    EndOfStream,

    #[error("transport closed")]
    Closed,

    #[error("malformed frame: {0}")]
    Malformed(String),
}
