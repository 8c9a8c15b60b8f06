//! Filter sets (spec §4.I): an ordered list of predicates, each tagged
//! "select" (keep on match) or "discard" (drop on match). Policy: any
//! discard match drops the message; else any select match keeps it; else
//! the default applies (a list with any select predicate defaults to drop,
//! a discard-only list defaults to keep).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::RouterMessage;

#[derive(Debug, Clone)]
pub enum PredicateShape {
    Nmea0183 { talker: Option<String>, formatter: String },
    Nmea2000 { pgn: u32, source_address: Option<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredicateKind {
    Select,
    Discard,
}

#[derive(Debug, Clone)]
pub struct FilterPredicate {
    pub kind: PredicateKind,
    pub shape: PredicateShape,
    /// Throttle a given (pgn, sa) pair to at most one message per interval.
    pub min_interval: Option<Duration>,
}

impl FilterPredicate {
    fn matches(&self, msg: &RouterMessage) -> bool {
        match (&self.shape, msg) {
            (PredicateShape::Nmea0183 { talker, formatter }, RouterMessage::Nmea0183(sentence)) => {
                talker.as_deref().is_none_or(|t| t == sentence.talker) && *formatter == sentence.formatter
            }
            (PredicateShape::Nmea2000 { pgn, source_address }, RouterMessage::Nmea2000(n2k)) => {
                *pgn == n2k.pgn && source_address.is_none_or(|sa| sa == n2k.sa)
            }
            _ => false,
        }
    }
}

pub struct FilterSet {
    predicates: Vec<FilterPredicate>,
    last_seen: HashMap<(u32, u8), Instant>,
}

impl FilterSet {
    pub fn new(predicates: Vec<FilterPredicate>) -> Self {
        FilterSet { predicates, last_seen: HashMap::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// Returns true if `msg` should be kept.
    pub fn accept(&mut self, msg: &RouterMessage, now: Instant) -> bool {
        if self.predicates.is_empty() {
            return true;
        }

        let mut any_select = false;
        for predicate in &self.predicates {
            if !predicate.matches(msg) {
                continue;
            }
            match predicate.kind {
                PredicateKind::Discard => return false,
                PredicateKind::Select => any_select = true,
            }
        }

        if any_select {
            if let RouterMessage::Nmea2000(n2k) = msg {
                for predicate in &self.predicates {
                    let Some(interval) = predicate.min_interval else { continue };
                    if !predicate.matches(msg) {
                        continue;
                    }
                    let key = (n2k.pgn, n2k.sa);
                    if let Some(last) = self.last_seen.get(&key) {
                        if now.duration_since(*last) < interval {
                            return false;
                        }
                    }
                    self.last_seen.insert(key, now);
                }
            }
            return true;
        }

        let has_select_predicate = self.predicates.iter().any(|p| p.kind == PredicateKind::Select);
        !has_select_predicate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nmea2k::NMEA2000Msg;

    fn n2k(pgn: u32, sa: u8) -> RouterMessage {
        RouterMessage::Nmea2000(NMEA2000Msg::new(pgn, 3, sa, 0xFF, vec![0; 8]))
    }

    #[test]
    fn discard_wins_over_select() {
        let mut filters = FilterSet::new(vec![
            FilterPredicate { kind: PredicateKind::Select, shape: PredicateShape::Nmea2000 { pgn: 127250, source_address: None }, min_interval: None },
            FilterPredicate { kind: PredicateKind::Discard, shape: PredicateShape::Nmea2000 { pgn: 127250, source_address: Some(9) }, min_interval: None },
        ]);
        assert!(!filters.accept(&n2k(127250, 9), Instant::now()));
        assert!(filters.accept(&n2k(127250, 1), Instant::now()));
    }

    #[test]
    fn select_only_list_defaults_to_drop() {
        let mut filters = FilterSet::new(vec![FilterPredicate {
            kind: PredicateKind::Select,
            shape: PredicateShape::Nmea2000 { pgn: 127250, source_address: None },
            min_interval: None,
        }]);
        assert!(!filters.accept(&n2k(129029, 1), Instant::now()));
    }

    #[test]
    fn discard_only_list_defaults_to_keep() {
        let mut filters = FilterSet::new(vec![FilterPredicate {
            kind: PredicateKind::Discard,
            shape: PredicateShape::Nmea2000 { pgn: 127250, source_address: None },
            min_interval: None,
        }]);
        assert!(filters.accept(&n2k(129029, 1), Instant::now()));
    }

    #[test]
    fn min_interval_throttles_repeat_messages() {
        let mut filters = FilterSet::new(vec![FilterPredicate {
            kind: PredicateKind::Select,
            shape: PredicateShape::Nmea2000 { pgn: 127250, source_address: None },
            min_interval: Some(Duration::from_secs(1)),
        }]);
        let t0 = Instant::now();
        assert!(filters.accept(&n2k(127250, 1), t0));
        assert!(!filters.accept(&n2k(127250, 1), t0 + Duration::from_millis(100)));
        assert!(filters.accept(&n2k(127250, 1), t0 + Duration::from_secs(2)));
    }
}
