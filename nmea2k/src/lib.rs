//! Protocol core for a marine NMEA2000/J1939 router: PGN dictionary and codec,
//! Fast-Packet and ISO-TP reassembly, the CAN transport, and the Controller
//! Application / Active Controller network-management layer.
//!
//! This crate has no knowledge of configuration files, couplers, or publishers —
//! those live in the router binary built on top of it. It is usable standalone
//! against any SocketCAN-capable channel.

pub mod application;
pub mod can_interface;
pub mod controller;
pub mod error;
pub mod fast_packet;
pub mod group_function;
pub mod iso_tp;
pub mod message;
pub mod name;
pub mod pgn;

pub use application::{ApplicationPool, NMEA2000Application};
pub use controller::ActiveController;
pub use error::{CanInterfaceError, CodecError, FastPacketError, IsoTpError};
pub use fast_packet::FastPacketHandler;
pub use iso_tp::IsoTpHandler;
pub use message::NMEA2000Msg;
pub use name::Name;
pub use pgn::{PgnDef, PgnDictionary, Value};
