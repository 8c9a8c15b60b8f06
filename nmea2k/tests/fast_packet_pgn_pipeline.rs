//! Fast-Packet reassembly feeding straight into the PGN dictionary decoder —
//! the two halves of ingesting a real multi-frame PGN off the wire (spec
//! §8 scenario 3, extended with the decode step §4.A leaves implicit).

use nmea2k::{FastPacketHandler, PgnDictionary, Value};

const GNSS_POSITION_SCHEMA: &str = r#"
<PGNDefinitions>
  <PGNInfo>
    <PGN>129029</PGN>
    <Id>gnssPosition</Id>
    <Complete>true</Complete>
    <Fields>
      <UIntField>
        <Name>SID</Name>
        <BitLength>8</BitLength>
      </UIntField>
      <UIntField>
        <Name>Date</Name>
        <BitLength>16</BitLength>
      </UIntField>
      <UDblField>
        <Name>Time</Name>
        <BitLength>32</BitLength>
        <Scale>0.0001</Scale>
        <Offset>0</Offset>
        <Unit>s</Unit>
      </UDblField>
    </Fields>
  </PGNInfo>
</PGNDefinitions>
"#;

#[test]
fn reassembled_fast_packet_payload_decodes_against_the_schema() {
    let mut payload = vec![7u8, 0x34, 0x12];
    payload.extend_from_slice(&100_000_000u32.to_le_bytes());
    payload.extend(std::iter::repeat(0xAA).take(43 - payload.len()));
    assert_eq!(payload.len(), 43);

    let mut handler = FastPacketHandler::new();
    let frames = handler.split_message(129029, &payload).unwrap();
    assert_eq!(frames.len(), 7);

    // Feed out of order except the first frame, which must lead.
    let mut order: Vec<usize> = (1..frames.len()).collect();
    order.reverse();
    order.insert(0, 0);

    let mut reassembled = None;
    for idx in order {
        let result = handler.process_frame(129029, 35, &frames[idx]).unwrap();
        if let Some(bytes) = result {
            reassembled = Some(bytes);
        }
    }
    let reassembled = reassembled.expect("sequence should complete once all 7 frames arrive");
    assert_eq!(reassembled, payload);

    let dict = PgnDictionary::parse(GNSS_POSITION_SCHEMA).unwrap();
    let decoded = dict.decode(129029, None, &reassembled).unwrap();
    assert_eq!(decoded.get("SID").unwrap().as_u64(), Some(7));
    match decoded.get("Time").unwrap() {
        Value::Float(v) => assert!((*v - 10_000.0).abs() < 1e-2),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn feeding_the_same_sequence_twice_emits_two_reassemblies() {
    let payload = vec![1u8; 20];
    let mut handler = FastPacketHandler::new();
    let frames = handler.split_message(129029, &payload).unwrap();

    let mut emissions = 0;
    for frame in &frames {
        if handler.process_frame(129029, 9, frame).unwrap().is_some() {
            emissions += 1;
        }
    }
    assert_eq!(emissions, 1);

    let frames_again = handler.split_message(129029, &payload).unwrap();
    let mut emissions_again = 0;
    for frame in &frames_again {
        if handler.process_frame(129029, 9, frame).unwrap().is_some() {
            emissions_again += 1;
        }
    }
    assert_eq!(emissions_again, 1);
}
