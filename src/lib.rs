//! Protocol-agnostic routing fabric for marine navigation data: couplers
//! (ingress/egress), publishers (fan-out to consumers), filters, and the
//! configuration-driven Main Server that wires them together (spec
//! §4.G-§4.J). Exposed as a library, separately from the `nmea_router`
//! binary, so the wiring can be exercised from integration tests.

pub mod config;
pub mod envelope;
pub mod error;
pub mod grpc;
pub mod nmea0183;
pub mod router_core;
pub mod server;
