//! Small protocol message structs used by the Controller Application and Active
//! Controller: Address Claim, ISO Request, Product/Configuration Information,
//! Heartbeat, Commanded Address, and Group Function (spec §4.E).

use crate::message::NMEA2000Msg;
use crate::name::Name;

pub const PGN_ISO_REQUEST: u32 = 59904;
pub const PGN_ADDRESS_CLAIM: u32 = 60928;
pub const PGN_COMMANDED_ADDRESS: u32 = 65240;
pub const PGN_GROUP_FUNCTION: u32 = 126208;
pub const PGN_HEARTBEAT: u32 = 126993;
pub const PGN_PRODUCT_INFORMATION: u32 = 126996;
pub const PGN_CONFIGURATION_INFORMATION: u32 = 126998;

/// PGN 60928: ISO Address Claim. Payload is the 8-byte ISO NAME.
pub struct AddressClaim {
    pub sa: u8,
    pub da: u8,
    pub name: Name,
}

impl AddressClaim {
    pub fn new(sa: u8, da: u8, name: Name) -> Self {
        AddressClaim { sa, da, name }
    }

    pub fn from_message(msg: &NMEA2000Msg) -> Option<Self> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(msg.payload.get(0..8)?);
        Some(AddressClaim { sa: msg.sa, da: msg.da, name: Name::from_le_bytes(bytes) })
    }

    pub fn message(&self) -> NMEA2000Msg {
        NMEA2000Msg::new(PGN_ADDRESS_CLAIM, 6, self.sa, self.da, self.name.to_le_bytes().to_vec())
    }
}

/// PGN 59904: ISO Request. Payload is the 3-byte little-endian requested PGN.
pub struct IsoRequest {
    pub sa: u8,
    pub da: u8,
    pub request_pgn: u32,
}

impl IsoRequest {
    pub fn new(sa: u8, da: u8, request_pgn: u32) -> Self {
        IsoRequest { sa, da, request_pgn }
    }

    pub fn from_message(msg: &NMEA2000Msg) -> Option<Self> {
        if msg.payload.len() < 3 {
            return None;
        }
        let request_pgn = u32::from_le_bytes([msg.payload[0], msg.payload[1], msg.payload[2], 0]);
        Some(IsoRequest { sa: msg.sa, da: msg.da, request_pgn })
    }

    pub fn message(&self) -> NMEA2000Msg {
        let bytes = self.request_pgn.to_le_bytes();
        NMEA2000Msg::new(PGN_ISO_REQUEST, 6, self.sa, self.da, vec![bytes[0], bytes[1], bytes[2]])
    }
}

/// PGN 126996: NMEA2000/J1939 Product Information.
#[derive(Clone)]
pub struct ProductInformation {
    pub sa: u8,
    pub nmea2000_version: u16,
    pub product_code: u16,
    pub model_id: String,
    pub software_version: String,
    pub model_version: String,
    pub serial_code: String,
    pub certification_level: u8,
    pub load_equivalency: u8,
}

impl Default for ProductInformation {
    fn default() -> Self {
        ProductInformation {
            sa: 0,
            nmea2000_version: 2100,
            product_code: 1226,
            model_id: String::new(),
            software_version: String::new(),
            model_version: String::new(),
            serial_code: String::new(),
            certification_level: 1,
            load_equivalency: 1,
        }
    }
}

impl ProductInformation {
    pub fn set_product_information(&mut self, model_id: &str, software_version: &str, model_version: &str, serial_code: &str) {
        self.model_id = model_id.to_string();
        self.software_version = software_version.to_string();
        self.model_version = model_version.to_string();
        self.serial_code = serial_code.to_string();
    }

    pub fn message(&self) -> NMEA2000Msg {
        let mut payload = Vec::with_capacity(134);
        payload.extend_from_slice(&self.nmea2000_version.to_le_bytes());
        payload.extend_from_slice(&self.product_code.to_le_bytes());
        push_fixed_string(&mut payload, &self.model_id, 32);
        push_fixed_string(&mut payload, &self.software_version, 32);
        push_fixed_string(&mut payload, &self.model_version, 32);
        push_fixed_string(&mut payload, &self.serial_code, 32);
        payload.push(self.certification_level);
        payload.push(self.load_equivalency);
        NMEA2000Msg::new(PGN_PRODUCT_INFORMATION, 6, self.sa, 0xFF, payload)
    }
}

/// PGN 126998: Configuration Information, three variable-length installation strings.
#[derive(Clone, Default)]
pub struct ConfigurationInformation {
    pub sa: u8,
    pub installation_1: String,
    pub installation_2: String,
    pub manufacturer_info: String,
}

impl ConfigurationInformation {
    pub fn message(&self) -> NMEA2000Msg {
        let mut payload = Vec::new();
        push_var_string(&mut payload, &self.installation_1);
        push_var_string(&mut payload, &self.installation_2);
        push_var_string(&mut payload, &self.manufacturer_info);
        NMEA2000Msg::new(PGN_CONFIGURATION_INFORMATION, 6, self.sa, 0xFF, payload)
    }
}

/// PGN 126993: Heartbeat, interval in milliseconds plus a mod-254 sequence counter.
pub struct Heartbeat {
    pub sa: u8,
    pub interval_ms: u32,
    pub sequence: u8,
}

impl Heartbeat {
    pub fn message(&self) -> NMEA2000Msg {
        let mut payload = vec![0xFFu8; 8];
        payload[0..2].copy_from_slice(&(self.interval_ms as u16).to_le_bytes());
        payload[2] = self.sequence;
        NMEA2000Msg::new(PGN_HEARTBEAT, 7, self.sa, 0xFF, payload)
    }
}

/// PGN 65240: Commanded Address — NAME plus the new address in byte 8.
pub struct CommandedAddress {
    pub name: Name,
    pub commanded_address: u8,
}

impl CommandedAddress {
    pub fn from_message(msg: &NMEA2000Msg) -> Option<Self> {
        if msg.payload.len() < 9 {
            return None;
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&msg.payload[0..8]);
        Some(CommandedAddress { name: Name::from_le_bytes(bytes), commanded_address: msg.payload[8] })
    }
}

/// Per-parameter acknowledge codes for PGN 126208 Command Group Function (spec §4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamError {
    Ok = 0,
    Unsupported = 1,
    OutOfRange = 3,
}

/// PGN 126208: Group Function. `function` 0 = Request, 1 = Command, 2 = Acknowledge.
pub struct GroupFunction {
    pub sa: u8,
    pub da: u8,
    pub function: u8,
    pub function_pgn: u32,
    pub parameters: Vec<(u8, Vec<u8>)>,
}

impl GroupFunction {
    /// Parses a Command Group Function: byte 0 function code, bytes 1-3 the
    /// target PGN, byte 4 priority setting/reserved, byte 5 the parameter
    /// count, then one `(field_number, length, value...)` triple per
    /// parameter.
    pub fn from_message(msg: &NMEA2000Msg) -> Option<Self> {
        if msg.payload.len() < 5 {
            return None;
        }
        let function = msg.payload[0];
        let function_pgn = u32::from_le_bytes([msg.payload[1], msg.payload[2], msg.payload[3], 0]);
        let mut parameters = Vec::new();
        if function == 1 {
            let count = msg.payload.get(5).copied().unwrap_or(0) as usize;
            let mut ptr = 6usize;
            for _ in 0..count {
                let Some(&field_number) = msg.payload.get(ptr) else { break };
                let Some(&len) = msg.payload.get(ptr + 1) else { break };
                let start = ptr + 2;
                let end = start + len as usize;
                let Some(value) = msg.payload.get(start..end) else { break };
                parameters.push((field_number, value.to_vec()));
                ptr = end;
            }
        }
        Some(GroupFunction { sa: msg.sa, da: msg.da, function, function_pgn, parameters })
    }

    pub fn is_command(&self) -> bool {
        self.function == 1
    }
}

/// Acknowledge Group Function response: one error code per requested parameter.
pub struct AcknowledgeGroupFunction {
    pub sa: u8,
    pub da: u8,
    pub function_pgn: u32,
    pub param_errors: Vec<ParamError>,
}

impl AcknowledgeGroupFunction {
    pub fn new(function_pgn: u32, param_errors: Vec<ParamError>) -> Self {
        AcknowledgeGroupFunction { sa: 0, da: 0xFF, function_pgn, param_errors }
    }

    pub fn message(&self) -> NMEA2000Msg {
        let mut payload = Vec::new();
        payload.push(2); // Acknowledge
        let pgn_bytes = self.function_pgn.to_le_bytes();
        payload.extend_from_slice(&pgn_bytes[0..3]);
        payload.push(0xF8 | self.param_errors.first().copied().unwrap_or(ParamError::Ok) as u8);
        payload.push(self.param_errors.len() as u8);
        for err in &self.param_errors {
            payload.push(*err as u8);
        }
        NMEA2000Msg::new(PGN_GROUP_FUNCTION, 3, self.sa, self.da, payload)
    }
}

fn push_fixed_string(buf: &mut Vec<u8>, s: &str, len: usize) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(len);
    buf.extend_from_slice(&bytes[..n]);
    buf.extend(std::iter::repeat_n(0xFFu8, len - n));
}

fn push_var_string(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    let total_len = (bytes.len() + 2).min(255);
    buf.push(total_len as u8);
    buf.push(1);
    buf.extend_from_slice(&bytes[..total_len - 2]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_claim_round_trips() {
        let name = Name::from_parts(1, 999, 0, 0, 130, 25, 0, 4, 1);
        let claim = AddressClaim::new(128, 0xFF, name);
        let msg = claim.message();
        let parsed = AddressClaim::from_message(&msg).unwrap();
        assert_eq!(parsed.name, name);
    }

    #[test]
    fn iso_request_round_trips() {
        let req = IsoRequest::new(128, 0xFF, 126996);
        let msg = req.message();
        let parsed = IsoRequest::from_message(&msg).unwrap();
        assert_eq!(parsed.request_pgn, 126996);
    }
}
