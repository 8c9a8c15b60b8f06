//! Cross-module pipeline: a replay-log coupler feeds a run loop that fans
//! out to two publishers, one carrying a throttling filter (spec §8
//! scenario 5) and one plain, confirming the filtered publisher's drops do
//! not affect its sibling (spec §8 "Publisher isolation").

use std::time::Duration;

use nmea2k::NMEA2000Msg;

use nmea_router::router_core::coupler::{run_coupler, Coupler, CouplerHandle, ReplayCoupler};
use nmea_router::router_core::filter::{FilterPredicate, FilterSet, PredicateKind, PredicateShape};
use nmea_router::router_core::publisher::PullPublisher;
use nmea_router::router_core::Publisher;
use nmea_router::router_core::RouterMessage;

fn write_ydwg_log(path: &std::path::Path, messages: &[NMEA2000Msg]) {
    let mut body = String::new();
    for msg in messages {
        let can_id = msg.build_arbitration_id();
        let bytes: Vec<String> = msg.payload.iter().map(|b| format!("{b:02X}")).collect();
        body.push_str(&format!("12:00:00.000 R {can_id:08X} {}\n", bytes.join(" ")));
    }
    std::fs::write(path, body).unwrap();
}

#[tokio::test]
async fn filtered_publisher_throttles_without_starving_its_sibling() {
    let path = std::env::temp_dir().join(format!("router_pipeline_{}.log", std::process::id()));
    let messages: Vec<NMEA2000Msg> =
        (0..10).map(|n| NMEA2000Msg::new(127488, 2, 5, 0xFF, vec![n, 0, 0, 0, 0, 0, 0, 0])).collect();
    write_ydwg_log(&path, &messages);

    let handle = CouplerHandle::default();

    let throttled = std::sync::Arc::new(PullPublisher::with_filter(
        "throttled",
        5,
        Some(FilterSet::new(vec![FilterPredicate {
            kind: PredicateKind::Select,
            shape: PredicateShape::Nmea2000 { pgn: 127488, source_address: None },
            min_interval: Some(Duration::from_millis(1000)),
        }])),
    ));
    let plain = std::sync::Arc::new(PullPublisher::new("plain", 5));
    handle.register(throttled.clone()).await;
    handle.register(plain.clone()).await;

    let coupler: Box<dyn Coupler> = Box::new(ReplayCoupler::new("replay", path.to_string_lossy().to_string()));
    let coupler = std::sync::Arc::new(tokio::sync::Mutex::new(coupler));
    let (_stop_tx, stop_rx) = tokio::sync::mpsc::channel(1);
    run_coupler(coupler, handle, 1, Duration::from_millis(10), stop_rx).await;

    // The throttled sibling only accepted its first message; the plain
    // publisher received all ten, in order.
    let first = throttled.pull().await;
    assert!(matches!(first, Some(RouterMessage::Nmea2000(ref m)) if m.payload[0] == 0));
    assert_eq!(throttled.lost_count(), 0);

    for n in 0..10u8 {
        match plain.pull().await {
            Some(RouterMessage::Nmea2000(msg)) => assert_eq!(msg.payload[0], n),
            other => panic!("expected message {n}, got {other:?}"),
        }
    }

    std::fs::remove_file(&path).ok();
}
