//! NMEA2000-over-NMEA0183 encapsulation codecs used by Shipmodul (MXPGN) and
//! Digital Yacht (PDGY) gateways (spec §6). Both wrap a raw `NMEA2000Msg`
//! inside an NMEA0183 encapsulation sentence so it can travel the serial/TCP
//! couplers unchanged.

use base64::Engine;
use nmea2k::NMEA2000Msg;

use crate::error::CouplerError;
use crate::nmea0183::Sentence;

/// `$MXPGN,<pgn-hex-6>,<attr-hex-4>,<data-hex>*CS`
///
/// `attr` packs priority in bits 12-14, data length in bits 8-11, and the
/// destination address in bits 0-7; the high bit (bit 15) is always set.
/// Data bytes appear reversed in the hex string.
pub fn encode_mxpgn(msg: &NMEA2000Msg) -> Sentence {
    let attr: u16 = 0x8000 | ((msg.priority as u16 & 0x7) << 12) | ((msg.payload.len() as u16 & 0xF) << 8) | msg.da as u16;
    let mut reversed = msg.payload.clone();
    reversed.reverse();
    let data_hex: String = reversed.iter().map(|b| format!("{b:02X}")).collect();
    Sentence::new("MX", "PGN", vec![format!("{:06X}", msg.pgn), format!("{attr:04X}"), data_hex])
}

pub fn decode_mxpgn(sentence: &Sentence, sa: u8) -> Result<NMEA2000Msg, CouplerError> {
    if sentence.formatter != "PGN" {
        return Err(CouplerError::Malformed(format!("not an MXPGN sentence: {}", sentence.formatter)));
    }
    let [pgn_hex, attr_hex, data_hex] = sentence.fields.as_slice() else {
        return Err(CouplerError::Malformed("MXPGN sentence needs exactly 3 fields".into()));
    };
    let pgn = u32::from_str_radix(pgn_hex, 16).map_err(|_| CouplerError::Malformed("bad MXPGN pgn field".into()))?;
    let attr = u16::from_str_radix(attr_hex, 16).map_err(|_| CouplerError::Malformed("bad MXPGN attr field".into()))?;
    let priority = ((attr >> 12) & 0x7) as u8;
    let da = (attr & 0xFF) as u8;
    let mut payload = hex_decode(data_hex)?;
    payload.reverse();

    Ok(NMEA2000Msg::new(pgn, priority, sa, da, payload))
}

/// `!PDGY,<pgn>,<prio>,<sa>,<da>,<timer>,<base64-payload>` on receive; the
/// transmit form omits `sa` and `timer` since the gateway fills those in.
pub fn encode_pdgy(msg: &NMEA2000Msg, for_transmit: bool) -> Sentence {
    let payload_b64 = base64::engine::general_purpose::STANDARD.encode(&msg.payload);
    let fields = if for_transmit {
        vec![msg.pgn.to_string(), msg.priority.to_string(), msg.da.to_string(), payload_b64]
    } else {
        vec![
            msg.pgn.to_string(),
            msg.priority.to_string(),
            msg.sa.to_string(),
            msg.da.to_string(),
            "0".to_string(),
            payload_b64,
        ]
    };
    Sentence { encapsulated: true, talker: "P".to_string(), formatter: "DGY".to_string(), fields }
}

pub fn decode_pdgy(sentence: &Sentence) -> Result<NMEA2000Msg, CouplerError> {
    if sentence.formatter != "DGY" {
        return Err(CouplerError::Malformed(format!("not a PDGY sentence: {}", sentence.formatter)));
    }
    let fields = &sentence.fields;
    if fields.len() < 4 {
        return Err(CouplerError::Malformed("PDGY sentence too short".into()));
    }
    let pgn: u32 = fields[0].parse().map_err(|_| CouplerError::Malformed("bad PDGY pgn field".into()))?;
    let priority: u8 = fields[1].parse().map_err(|_| CouplerError::Malformed("bad PDGY priority field".into()))?;

    let (sa, da, payload_field) = if fields.len() >= 6 {
        let sa: u8 = fields[2].parse().map_err(|_| CouplerError::Malformed("bad PDGY sa field".into()))?;
        let da: u8 = fields[3].parse().map_err(|_| CouplerError::Malformed("bad PDGY da field".into()))?;
        (sa, da, fields[5].as_str())
    } else {
        let da: u8 = fields[2].parse().map_err(|_| CouplerError::Malformed("bad PDGY da field".into()))?;
        (0xFF, da, fields[3].as_str())
    };

    let payload = base64::engine::general_purpose::STANDARD
        .decode(payload_field)
        .map_err(|e| CouplerError::Malformed(format!("bad PDGY base64 payload: {e}")))?;

    Ok(NMEA2000Msg::new(pgn, priority, sa, da, payload))
}

fn hex_decode(hex: &str) -> Result<Vec<u8>, CouplerError> {
    if hex.len() % 2 != 0 {
        return Err(CouplerError::Malformed("odd-length hex payload".into()));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| CouplerError::Malformed("invalid hex digit".into())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mxpgn_round_trips() {
        let msg = NMEA2000Msg::new(127250, 2, 5, 255, vec![0xFF, 0x10, 0x20, 0x30, 0xFD, 0x7F, 0xFF, 0xFF]);
        let sentence = encode_mxpgn(&msg);
        let decoded = decode_mxpgn(&sentence, msg.sa).unwrap();
        assert_eq!(decoded.pgn, msg.pgn);
        assert_eq!(decoded.da, msg.da);
        assert_eq!(decoded.payload, msg.payload);
    }

    #[test]
    fn pdgy_round_trips_receive_form() {
        let msg = NMEA2000Msg::new(129029, 3, 12, 255, vec![1, 2, 3, 4]);
        let sentence = encode_pdgy(&msg, false);
        let decoded = decode_pdgy(&sentence).unwrap();
        assert_eq!(decoded.pgn, msg.pgn);
        assert_eq!(decoded.sa, msg.sa);
        assert_eq!(decoded.payload, msg.payload);
    }
}
