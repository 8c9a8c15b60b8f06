//! Explicit class-name → factory mapping (REDESIGN FLAGS: registry, not
//! reflection) used by the Main Server to turn configuration entries into
//! live couplers and publishers (spec §4.J "builds components... classes").

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpStream;

use nmea2k::can_interface::BurstConfig;
use nmea2k::{ActiveController, ApplicationPool, NMEA2000Application, PgnDictionary};

use crate::config::ComponentEntry;
use crate::error::ConfigError;
use crate::router_core::coupler::{Coupler, Direction, DirectCanCoupler, ReplayCoupler, TcpCoupler, UdpCoupler};
use crate::router_core::filter::{FilterPredicate, FilterSet, PredicateKind, PredicateShape};
use crate::router_core::publisher::{ClientEncoding, ClientSink, InjectorSink, Publisher, PublisherHandle, PullPublisher};

/// Every coupler class name this registry can build.
pub const COUPLER_CLASSES: &[&str] = &["DirectCanCoupler", "TcpCoupler", "UdpCoupler", "ReplayCoupler"];

/// Every publisher class name this registry can build.
pub const PUBLISHER_CLASSES: &[&str] = &["ClientPublisher", "PullPublisher", "Injector"];

/// Every application class name this registry can build.
pub const APPLICATION_CLASSES: &[&str] = &["NMEA2000Application"];

/// Builds a `FilterSet` from a `filters:` entry's `predicates` list (spec
/// §4.I): each item is `{kind: select|discard, pgn, source_address?,
/// min_interval_ms?}` for NMEA2000 or `{kind, talker?, formatter}` for
/// NMEA0183.
pub fn build_filter(entry: &ComponentEntry) -> Result<FilterSet, ConfigError> {
    let missing = |field: &str| ConfigError::MissingField { name: entry.name.clone(), field: field.to_string() };
    let items = entry.params.get("predicates").and_then(|v| v.as_sequence()).ok_or_else(|| missing("predicates"))?;

    let mut predicates = Vec::with_capacity(items.len());
    for item in items {
        let kind = match item.get("kind").and_then(|v| v.as_str()) {
            Some("select") => PredicateKind::Select,
            Some("discard") => PredicateKind::Discard,
            _ => return Err(missing("kind")),
        };
        let shape = if let Some(formatter) = item.get("formatter").and_then(|v| v.as_str()) {
            let talker = item.get("talker").and_then(|v| v.as_str()).map(str::to_string);
            PredicateShape::Nmea0183 { talker, formatter: formatter.to_string() }
        } else {
            let pgn = item.get("pgn").and_then(|v| v.as_u64()).ok_or_else(|| missing("pgn"))? as u32;
            let source_address = item.get("source_address").and_then(|v| v.as_u64()).map(|v| v as u8);
            PredicateShape::Nmea2000 { pgn, source_address }
        };
        let min_interval = item.get("min_interval_ms").and_then(|v| v.as_u64()).map(std::time::Duration::from_millis);
        predicates.push(FilterPredicate { kind, shape, min_interval });
    }

    Ok(FilterSet::new(predicates))
}

pub fn build_coupler(entry: &ComponentEntry, controller: Option<Arc<tokio::sync::Mutex<ActiveController>>>) -> Result<Box<dyn Coupler>, ConfigError> {
    let direction = match entry.string_or("direction", "bidirectional").as_str() {
        "read_only" => Direction::ReadOnly,
        "write_only" => Direction::WriteOnly,
        _ => Direction::Bidirectional,
    };
    match entry.class.as_str() {
        "DirectCanCoupler" => {
            let interface = entry.string("interface")?;
            let bandwidth = entry.u64_or("bandwidth_percent", 25) as f64;
            let trace_path = entry.params.get("trace_file").and_then(|v| v.as_str().map(str::to_string));
            let dictionary = match entry.params.get("pgn_schema").and_then(|v| v.as_str()) {
                Some(path) => {
                    let xml = std::fs::read_to_string(path)
                        .map_err(|source| ConfigError::SchemaRead { path: path.to_string(), source })?;
                    PgnDictionary::parse(&xml).map_err(|source| ConfigError::SchemaParse { path: path.to_string(), source })?
                }
                None => PgnDictionary::empty(),
            };
            let default_burst = BurstConfig::default();
            let burst = BurstConfig {
                threshold: entry.u64_or("burst_threshold", default_burst.threshold as u64) as usize,
                size: entry.u64_or("burst_size", default_burst.size as u64) as usize,
                spacing: std::time::Duration::from_millis(entry.u64_or("burst_spacing_ms", default_burst.spacing.as_millis() as u64)),
            };
            Ok(Box::new(DirectCanCoupler::new(&entry.name, interface, bandwidth, trace_path, Arc::new(dictionary), burst, controller)))
        }
        "TcpCoupler" => {
            let addr = entry.string("address")?;
            Ok(Box::new(TcpCoupler::new(&entry.name, addr, direction)))
        }
        "UdpCoupler" => {
            let bind_addr = entry.string("bind_address")?;
            Ok(Box::new(UdpCoupler::new(&entry.name, bind_addr)))
        }
        "ReplayCoupler" => {
            let path = entry.string("file")?;
            Ok(Box::new(ReplayCoupler::new(&entry.name, path)))
        }
        other => Err(ConfigError::UnknownClass(other.to_string())),
    }
}

/// Builds one `ActiveController` hosting every configured `applications:`
/// entry (spec §4.E/§4.F). Every entry shares one address pool; `None` means
/// no applications are configured, so couplers fall back to writing straight
/// to the bus with no address-claim gate.
pub fn build_controller(entries: &[ComponentEntry]) -> Result<Option<ActiveController>, ConfigError> {
    if entries.is_empty() {
        return Ok(None);
    }
    if let Some(bad) = entries.iter().find(|e| !APPLICATION_CLASSES.contains(&e.class.as_str())) {
        return Err(ConfigError::UnknownClass(bad.class.clone()));
    }

    let first = &entries[0];
    let mac_source = first.string_or("mac_source", "00:00:00:00:00:00");
    let mfg_code = first.u64_or("mfg_code", 999) as u16;
    let first_address = first.u64_or("first_address", 128) as u8;
    let mut pool = ApplicationPool::new(&mac_source, mfg_code, entries.len() as u32, first_address);

    let mut allocated = Vec::with_capacity(entries.len());
    let mut taken = Vec::new();
    for entry in entries {
        let name = pool
            .next_name()
            .ok_or_else(|| ConfigError::MissingField { name: entry.name.clone(), field: "address pool exhausted".to_string() })?;
        let address = match entry.params.get("address").and_then(|v| v.as_u64()) {
            Some(addr) => addr as u8,
            None => pool.next_address(&taken),
        };
        taken.push(address);
        allocated.push((address, name, entry));
    }

    let mut controller = ActiveController::new(pool);
    for (address, name, entry) in allocated {
        controller.add_application(NMEA2000Application::new(address, name));
        if let Some(pgns) = entry.params.get("subscribe_pgns").and_then(|v| v.as_sequence()) {
            for pgn in pgns.iter().filter_map(|v| v.as_u64()) {
                controller.subscribe_pgn(address, Some(pgn as u32));
            }
        }
        if entry.bool_or("catch_all", false) {
            controller.subscribe_pgn(address, None);
        }
    }

    Ok(Some(controller))
}

/// Built separately from couplers since `ClientPublisher` needs an active
/// TCP connection, which `Main Server` establishes during start rather than
/// at config-build time.
pub async fn build_publisher(
    entry: &ComponentEntry,
    couplers: &HashMap<String, Arc<dyn crate::router_core::coupler::Sendable>>,
    filters: &mut HashMap<String, FilterSet>,
) -> Result<Arc<dyn Publisher>, ConfigError> {
    let max_lost = entry.u64_or("max_lost", 3) as u32;
    let filter = match entry.params.get("filter").and_then(|v| v.as_str()) {
        Some(filter_name) => {
            Some(filters.remove(filter_name).ok_or_else(|| ConfigError::MissingField { name: entry.name.clone(), field: "filter".to_string() })?)
        }
        None => None,
    };
    match entry.class.as_str() {
        "PullPublisher" => Ok(Arc::new(PullPublisher::with_filter(&entry.name, max_lost, filter))),
        "ClientPublisher" => {
            let addr = entry.string("address")?;
            let encoding = ClientEncoding::parse(&entry.string_or("encoding", "transparent"));
            let stream = TcpStream::connect(&addr)
                .await
                .map_err(|_| ConfigError::MissingField { name: entry.name.clone(), field: "address".to_string() })?;
            let sink = ClientSink::new(stream, encoding);
            Ok(Arc::new(PublisherHandle::spawn_filtered(&entry.name, max_lost, filter, sink)))
        }
        "Injector" => {
            let target_name = entry.string("target")?;
            let target = couplers
                .get(&target_name)
                .ok_or_else(|| ConfigError::MissingField { name: entry.name.clone(), field: "target".to_string() })?
                .clone();
            let sink = InjectorSink::new(target);
            Ok(Arc::new(PublisherHandle::spawn_filtered(&entry.name, max_lost, filter, sink)))
        }
        other => Err(ConfigError::UnknownClass(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(class: &str, params: &[(&str, &str)]) -> ComponentEntry {
        let mut body = format!("class: {class}\n");
        for (k, v) in params {
            body.push_str(&format!("{k}: {v}\n"));
        }
        let indented: String = body.lines().map(|l| format!("    {l}\n")).collect();
        let doc = format!("test_instance:\n{indented}");
        serde_yaml::from_str(&doc).unwrap()
    }

    #[test]
    fn unknown_class_is_rejected() {
        let entry = entry("NotARealCoupler", &[]);
        assert!(build_coupler(&entry, None).is_err());
    }

    #[test]
    fn direct_can_coupler_builds_from_entry() {
        let entry = entry("DirectCanCoupler", &[("interface", "vcan0")]);
        assert!(build_coupler(&entry, None).is_ok());
    }

    #[test]
    fn build_controller_is_none_with_no_applications() {
        assert!(build_controller(&[]).unwrap().is_none());
    }

    #[test]
    fn build_controller_allocates_distinct_addresses() {
        let a = entry("NMEA2000Application", &[("mac_source", "\"01:02:03:04:05:06\""), ("mfg_code", "999")]);
        let b = entry("NMEA2000Application", &[]);
        let controller = build_controller(&[a, b]).unwrap().unwrap();
        assert_eq!(controller.local_addresses().len(), 2);
    }

    #[test]
    fn filter_predicates_parse_from_yaml() {
        let yaml = r#"
nav_filter:
    class: FilterSet
    predicates:
      - kind: select
        pgn: 127250
      - kind: discard
        pgn: 127250
        source_address: 9
        min_interval_ms: 1000
"#;
        let entry: ComponentEntry = serde_yaml::from_str(yaml).unwrap();
        let filter = build_filter(&entry).unwrap();
        assert!(!filter.is_empty());
    }
}
