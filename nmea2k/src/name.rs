//! The 64-bit ISO NAME used to arbitrate CAN addresses (spec §3 "ISO NAME").
//!
//! Bit layout (LSB first, little-endian on the wire):
//! identity_number(21) | manufacturer_code(11) | device_instance_lower(3) |
//! device_instance_upper(5) | device_function(8) | reserved(1) | device_class(7) |
//! system_instance(4) | industry_group(3) | arbitrary_address_capable(1)

use std::fmt;

macro_rules! name_field {
    ($get:ident, $set:ident, $offset:expr, $bits:expr) => {
        pub fn $get(&self) -> u64 {
            (self.0 >> $offset) & ((1u64 << $bits) - 1)
        }

        pub fn $set(&mut self, value: u64) {
            let mask = (1u64 << $bits) - 1;
            self.0 = (self.0 & !(mask << $offset)) | ((value & mask) << $offset);
        }
    };
}

/// A 64-bit ISO NAME. Ordering is the numeric value of the word: smaller wins
/// address-claim arbitration (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Name(pub u64);

impl Name {
    pub fn from_parts(
        identity_number: u64,
        manufacturer_code: u64,
        device_instance_lower: u64,
        device_instance_upper: u64,
        device_function: u64,
        device_class: u64,
        system_instance: u64,
        industry_group: u64,
        arbitrary_address_capable: u64,
    ) -> Self {
        let mut n = Name(0);
        n.set_identity_number(identity_number);
        n.set_manufacturer_code(manufacturer_code);
        n.set_device_instance_lower(device_instance_lower);
        n.set_device_instance_upper(device_instance_upper);
        n.set_device_function(device_function);
        n.set_device_class(device_class);
        n.set_system_instance(system_instance);
        n.set_industry_group(industry_group);
        n.set_arbitrary_address_capable(arbitrary_address_capable);
        n
    }

    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Name(u64::from_le_bytes(bytes))
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    name_field!(identity_number, set_identity_number, 0, 21);
    name_field!(manufacturer_code, set_manufacturer_code, 21, 11);
    name_field!(device_instance_lower, set_device_instance_lower, 32, 3);
    name_field!(device_instance_upper, set_device_instance_upper, 35, 5);
    name_field!(device_function, set_device_function, 40, 8);
    name_field!(reserved, set_reserved, 48, 1);
    name_field!(device_class, set_device_class, 49, 7);
    name_field!(system_instance, set_system_instance, 56, 4);
    name_field!(industry_group, set_industry_group, 60, 3);
    name_field!(arbitrary_address_capable, set_arbitrary_address_capable, 63, 1);
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NAME(0x{:016X} id={} mfg={} fn={} class={} ig={})",
            self.0,
            self.identity_number(),
            self.manufacturer_code(),
            self.device_function(),
            self.device_class(),
            self.industry_group()
        )
    }
}

/// Builds ISO NAMEs for the local application pool from a MAC-address fingerprint
/// (spec §4.E "Address allocation pool").
pub fn identity_root_from_mac(mac: &str) -> u64 {
    let digits: String = mac.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    u64::from_str_radix(&digits, 16).unwrap_or(0) & 0x1FFFFF
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_all_fields() {
        let n = Name::from_parts(0x1A2B3, 0x123, 5, 17, 130, 25, 3, 4, 1);
        assert_eq!(n.identity_number(), 0x1A2B3);
        assert_eq!(n.manufacturer_code(), 0x123);
        assert_eq!(n.device_instance_lower(), 5);
        assert_eq!(n.device_instance_upper(), 17);
        assert_eq!(n.device_function(), 130);
        assert_eq!(n.device_class(), 25);
        assert_eq!(n.system_instance(), 3);
        assert_eq!(n.industry_group(), 4);
        assert_eq!(n.arbitrary_address_capable(), 1);
        assert_eq!(Name::from_le_bytes(n.to_le_bytes()), n);
    }

    #[test]
    fn ordering_smaller_name_wins() {
        let n1 = Name(0x4000_0000_0000_0001);
        let n2 = Name(0x3000_0000_0000_0000);
        assert!(n2 < n1);
    }
}
