//! Routing fabric: the generic message envelope that flows between couplers
//! and publishers, the `Coupler`/`Publisher` capability-set traits (spec
//! §4.G/4.H, REDESIGN FLAGS — capability sets rather than deep
//! inheritance), the filter predicate engine (spec §4.I), and the
//! class-name registry the Main Server uses to build components from
//! configuration (spec §4.J, REDESIGN FLAGS — explicit registry, not
//! reflection).

pub mod coupler;
pub mod filter;
pub mod publisher;
pub mod registry;

use nmea2k::NMEA2000Msg;

use crate::nmea0183::Sentence;

/// The one message type every coupler produces and every publisher consumes.
/// Conversion between the two protocol families (spec §4.H "converts if
/// needed") happens at the coupler/publisher boundary, not in this type.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterMessage {
    Nmea0183(Sentence),
    Nmea2000(NMEA2000Msg),
    /// Bytes a coupler could not parse into either protocol but still wants
    /// to hand a transparent-mode publisher (spec §4.H "transparent").
    Raw(Vec<u8>),
}

impl RouterMessage {
    pub fn pgn(&self) -> Option<u32> {
        match self {
            RouterMessage::Nmea2000(msg) => Some(msg.pgn),
            _ => None,
        }
    }

    pub fn source_address(&self) -> Option<u8> {
        match self {
            RouterMessage::Nmea2000(msg) => Some(msg.sa),
            _ => None,
        }
    }

    pub fn talker_formatter(&self) -> Option<(&str, &str)> {
        match self {
            RouterMessage::Nmea0183(sentence) => Some((&sentence.talker, &sentence.formatter)),
            _ => None,
        }
    }
}

pub use coupler::{Coupler, CouplerHandle};
pub use filter::{FilterPredicate, FilterSet};
pub use publisher::{Publisher, PublisherHandle};
