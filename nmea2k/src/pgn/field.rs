//! Field definitions and their decode/encode rules (spec §4.A, §6 XML schema).

use std::collections::HashMap;

use crate::error::CodecError;
use crate::name::Name;

use super::value::{signed_invalid, unsigned_invalid, Value};

#[derive(Debug, Clone)]
pub enum FieldKind {
    UInt,
    Int,
    /// Signed scaled double (XML `DblField`).
    Dbl { scale: f64, offset: f64 },
    /// Unsigned scaled double (XML `UDblField`).
    UDbl { scale: f64, offset: f64 },
    /// Unsigned enumeration (`EnumField`).
    Enum(HashMap<i64, String>),
    /// Signed enumeration (`EnumIntField`).
    EnumInt(HashMap<i64, String>),
    Instance,
    Name,
    Ascii,
    VarString,
    FixString,
    CommunicationStatus,
    /// Present in the schema but never surfaced to consumers; filled with 1-bits on encode.
    Reserved,
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub byte_length: usize,
    pub kind: FieldKind,
    pub unit: Option<String>,
    pub description: Option<String>,
}

impl FieldDef {
    fn is_numeric(&self) -> bool {
        matches!(
            self.kind,
            FieldKind::UInt
                | FieldKind::Int
                | FieldKind::Dbl { .. }
                | FieldKind::UDbl { .. }
                | FieldKind::Enum(_)
                | FieldKind::EnumInt(_)
                | FieldKind::Instance
                | FieldKind::CommunicationStatus
        )
    }

    fn signed(&self) -> bool {
        matches!(self.kind, FieldKind::Int | FieldKind::Dbl { .. } | FieldKind::EnumInt(_))
    }

    /// Decode starting at `byte_index` in `data`. Returns the value and the number of
    /// bytes consumed (0 for `Reserved`, which is skipped but still occupies space).
    pub fn decode(&self, pgn: u32, data: &[u8], byte_index: usize) -> Result<(Value, usize), CodecError> {
        match &self.kind {
            FieldKind::Reserved => Ok((Value::Invalid, self.byte_length)),
            FieldKind::Name => {
                let raw = read_bytes(pgn, data, byte_index, 8, &self.name)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(raw);
                Ok((Value::Name(Name::from_le_bytes(buf)), 8))
            }
            FieldKind::Ascii | FieldKind::FixString => {
                let raw = read_bytes(pgn, data, byte_index, self.byte_length, &self.name)?;
                Ok((decode_fixed_string(raw), self.byte_length))
            }
            FieldKind::VarString => decode_var_string(pgn, data, byte_index, &self.name),
            _ if self.is_numeric() => self.decode_numeric(pgn, data, byte_index),
            _ => unreachable!(),
        }
    }

    fn decode_numeric(&self, pgn: u32, data: &[u8], byte_index: usize) -> Result<(Value, usize), CodecError> {
        let raw = read_bytes(pgn, data, byte_index, self.byte_length, &self.name)?;
        let unsigned = le_to_u64(raw);
        if self.signed() {
            let signed = sign_extend(unsigned, self.byte_length);
            if unsigned == signed_invalid_as_unsigned(self.byte_length) {
                return Ok((Value::Invalid, self.byte_length));
            }
            let value = match &self.kind {
                FieldKind::Dbl { scale, offset } => {
                    Value::Float(signed as f64 * scale + offset)
                }
                FieldKind::EnumInt(map) => resolve_enum(pgn, &self.name, signed, map)?,
                _ => Value::Int(signed),
            };
            Ok((value, self.byte_length))
        } else {
            if unsigned == unsigned_invalid(self.byte_length) {
                return Ok((Value::Invalid, self.byte_length));
            }
            let value = match &self.kind {
                FieldKind::UDbl { scale, offset } => Value::Float(unsigned as f64 * scale + offset),
                FieldKind::Enum(map) => resolve_enum(pgn, &self.name, unsigned as i64, map)?,
                _ => Value::UInt(unsigned),
            };
            Ok((value, self.byte_length))
        }
    }

    pub fn no_value(&self) -> Value {
        match &self.kind {
            FieldKind::Reserved => Value::Invalid,
            FieldKind::Name => Value::Name(Name(u64::MAX)),
            FieldKind::Ascii | FieldKind::FixString | FieldKind::VarString => Value::Str(String::new()),
            FieldKind::Dbl { .. } | FieldKind::UDbl { .. } => Value::Float(f64::NAN),
            _ if self.signed() => Value::Int(signed_invalid(self.byte_length)),
            _ => Value::UInt(unsigned_invalid(self.byte_length)),
        }
    }

    /// Encode `value` into `buffer` at `index`, returning bytes written.
    pub fn encode(&self, value: &Value, buffer: &mut [u8], index: usize) -> Result<usize, CodecError> {
        match &self.kind {
            FieldKind::Reserved => {
                fill_ones(buffer, index, self.byte_length);
                Ok(self.byte_length)
            }
            FieldKind::Name => {
                let bytes = match value {
                    Value::Name(n) => n.to_le_bytes(),
                    _ => Name(u64::MAX).to_le_bytes(),
                };
                buffer[index..index + 8].copy_from_slice(&bytes);
                Ok(8)
            }
            FieldKind::Ascii | FieldKind::FixString => {
                encode_fixed_string(value, buffer, index, self.byte_length);
                Ok(self.byte_length)
            }
            FieldKind::VarString => Ok(encode_var_string(value, buffer, index)),
            _ => self.encode_numeric(value, buffer, index),
        }
    }

    fn encode_numeric(&self, value: &Value, buffer: &mut [u8], index: usize) -> Result<usize, CodecError> {
        let raw: u64 = if self.signed() {
            let signed = match (&self.kind, value) {
                (FieldKind::Dbl { scale, offset }, Value::Float(f)) if f.is_finite() => {
                    (((*f - offset) / scale).round()) as i64
                }
                (_, Value::Int(v)) => *v,
                (_, Value::Enum { key, .. }) => *key,
                _ => signed_invalid(self.byte_length),
            };
            (signed as u64) & byte_mask(self.byte_length)
        } else {
            let unsigned = match (&self.kind, value) {
                (FieldKind::UDbl { scale, offset }, Value::Float(f)) if f.is_finite() => {
                    (((*f - offset) / scale).round()) as u64
                }
                (_, Value::UInt(v)) => *v,
                (_, Value::Enum { key, .. }) => *key as u64,
                _ => unsigned_invalid(self.byte_length),
            };
            unsigned & byte_mask(self.byte_length)
        };
        let bytes = raw.to_le_bytes();
        buffer[index..index + self.byte_length].copy_from_slice(&bytes[..self.byte_length]);
        Ok(self.byte_length)
    }
}

fn byte_mask(byte_len: usize) -> u64 {
    if byte_len >= 8 {
        u64::MAX
    } else {
        (1u64 << (byte_len * 8)) - 1
    }
}

fn signed_invalid_as_unsigned(byte_len: usize) -> u64 {
    signed_invalid(byte_len) as u64 & byte_mask(byte_len)
}

fn sign_extend(raw: u64, byte_len: usize) -> i64 {
    let bits = byte_len * 8;
    if bits >= 64 {
        return raw as i64;
    }
    let shift = 64 - bits;
    ((raw << shift) as i64) >> shift
}

fn le_to_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn read_bytes<'a>(pgn: u32, data: &'a [u8], index: usize, len: usize, field: &str) -> Result<&'a [u8], CodecError> {
    data.get(index..index + len).ok_or_else(|| CodecError::PayloadTooShort {
        pgn,
        expected: index + len,
        actual: data.len(),
    }).map_err(|e| {
        let _ = field;
        e
    })
}

fn resolve_enum(pgn: u32, field: &str, key: i64, map: &HashMap<i64, String>) -> Result<Value, CodecError> {
    match map.get(&key) {
        Some(label) => Ok(Value::Enum { key, label: label.clone() }),
        None => Err(CodecError::MissingEnumKey { pgn, field: field.to_string(), key }),
    }
}

fn decode_fixed_string(raw: &[u8]) -> Value {
    let trimmed_len = raw
        .iter()
        .rposition(|&b| b != 0xFF && b != 0x00)
        .map(|i| i + 1)
        .unwrap_or(0);
    let trimmed = &raw[..trimmed_len];
    if trimmed.iter().all(|&b| (0x20..0x7F).contains(&b)) {
        Value::Str(String::from_utf8_lossy(trimmed).trim_end().to_string())
    } else {
        Value::Invalid
    }
}

fn encode_fixed_string(value: &Value, buffer: &mut [u8], index: usize, len: usize) {
    let s = match value {
        Value::Str(s) => s.as_str(),
        _ => "",
    };
    let bytes = s.as_bytes();
    let copy_len = bytes.len().min(len);
    buffer[index..index + copy_len].copy_from_slice(&bytes[..copy_len]);
    for b in &mut buffer[index + copy_len..index + len] {
        *b = 0xFF;
    }
}

/// Variable-length string: `length, type(=1), bytes...` (spec §3).
fn decode_var_string(pgn: u32, data: &[u8], index: usize, field: &str) -> Result<(Value, usize), CodecError> {
    let header = read_bytes(pgn, data, index, 2, field)?;
    let length = header[0] as usize;
    if length < 2 {
        return Ok((Value::Str(String::new()), length.max(0)));
    }
    let str_len = length - 2;
    let raw = read_bytes(pgn, data, index + 2, str_len, field)?;
    Ok((decode_fixed_string(raw), length))
}

fn encode_var_string(value: &Value, buffer: &mut [u8], index: usize) -> usize {
    let s = match value {
        Value::Str(s) => s.as_str(),
        _ => "",
    };
    let bytes = s.as_bytes();
    let total_len = (bytes.len() + 2).min(255);
    buffer[index] = total_len as u8;
    buffer[index + 1] = 1;
    let copy_len = total_len - 2;
    buffer[index + 2..index + 2 + copy_len].copy_from_slice(&bytes[..copy_len]);
    total_len
}

fn fill_ones(buffer: &mut [u8], index: usize, len: usize) {
    for b in &mut buffer[index..index + len] {
        *b = 0xFF;
    }
}

/// Consecutive sub-byte fields that share a byte boundary, decoded/encoded as one word
/// (spec §4.A "Bit-packed fields"; see SPEC_FULL §12 for the grouping heuristic decision).
#[derive(Debug, Clone)]
pub struct BitField {
    pub byte_length: usize,
    /// (bit_offset within the group, bit_length, sub-field)
    pub members: Vec<(usize, usize, SubField)>,
}

#[derive(Debug, Clone)]
pub struct SubField {
    pub name: String,
    pub signed: bool,
    pub enum_map: Option<HashMap<i64, String>>,
    pub reserved: bool,
}

impl BitField {
    pub fn decode(&self, pgn: u32, data: &[u8], byte_index: usize) -> Result<(Vec<(String, Value)>, usize), CodecError> {
        let raw = read_bytes(pgn, data, byte_index, self.byte_length, "bitfield")?;
        let word = le_to_u64(raw);
        let mut out = Vec::with_capacity(self.members.len());
        for (offset, len, sub) in &self.members {
            let mask = (1u64 << len) - 1;
            let raw_bits = (word >> offset) & mask;
            if sub.reserved {
                continue;
            }
            let value = if sub.signed {
                let signed = sign_extend_bits(raw_bits, *len);
                if raw_bits == mask >> 1 {
                    Value::Invalid
                } else if let Some(map) = &sub.enum_map {
                    resolve_enum(pgn, &sub.name, signed, map)?
                } else {
                    Value::Int(signed)
                }
            } else if raw_bits == mask {
                Value::Invalid
            } else if let Some(map) = &sub.enum_map {
                resolve_enum(pgn, &sub.name, raw_bits as i64, map)?
            } else {
                Value::UInt(raw_bits)
            };
            out.push((sub.name.clone(), value));
        }
        Ok((out, self.byte_length))
    }

    pub fn encode(&self, values: &HashMap<String, Value>, buffer: &mut [u8], index: usize) -> usize {
        let mut word: u64 = 0;
        for (offset, len, sub) in &self.members {
            let mask = (1u64 << len) - 1;
            let raw = if sub.reserved {
                mask
            } else {
                match values.get(&sub.name) {
                    Some(Value::UInt(v)) => *v & mask,
                    Some(Value::Int(v)) => (*v as u64) & mask,
                    Some(Value::Enum { key, .. }) => (*key as u64) & mask,
                    _ => mask,
                }
            };
            word |= raw << offset;
        }
        let bytes = word.to_le_bytes();
        buffer[index..index + self.byte_length].copy_from_slice(&bytes[..self.byte_length]);
        self.byte_length
    }
}

fn sign_extend_bits(raw: u64, bits: usize) -> i64 {
    if bits >= 64 {
        return raw as i64;
    }
    let shift = 64 - bits;
    ((raw << shift) as i64) >> shift
}

/// A repeated field set: an ordered list of subfield tuples repeated `count` times,
/// with `count` taken from an earlier field already decoded in the same PGN (spec §3).
#[derive(Debug, Clone)]
pub struct RepeatedFieldSet {
    pub count_field: String,
    pub fields: Vec<FieldDef>,
}

impl RepeatedFieldSet {
    pub fn decode(
        &self,
        pgn: u32,
        data: &[u8],
        byte_index: usize,
        prior: &HashMap<String, Value>,
    ) -> Result<(Vec<HashMap<String, Value>>, usize), CodecError> {
        let count = prior
            .get(&self.count_field)
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        let mut index = byte_index;
        let mut groups = Vec::with_capacity(count);
        for _ in 0..count {
            let mut group = HashMap::new();
            for field in &self.fields {
                let (value, consumed) = field.decode(pgn, data, index)?;
                index += consumed;
                if value.is_valid() {
                    group.insert(field.name.clone(), value);
                }
            }
            groups.push(group);
        }
        Ok((groups, index - byte_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_invalid_sentinels() {
        let f = FieldDef { name: "x".into(), byte_length: 2, kind: FieldKind::UInt, unit: None, description: None };
        let (v, n) = f.decode(1, &[0xFF, 0xFF], 0).unwrap();
        assert_eq!(n, 2);
        assert_eq!(v, Value::Invalid);
    }

    #[test]
    fn scaled_double_round_trips() {
        let f = FieldDef {
            name: "lat".into(),
            byte_length: 4,
            kind: FieldKind::Dbl { scale: 1e-7, offset: 0.0 },
            unit: None,
            description: None,
        };
        let mut buf = [0u8; 4];
        let value = Value::Float(12.3456789);
        f.encode(&value, &mut buf, 0).unwrap();
        let (decoded, _) = f.decode(1, &buf, 0).unwrap();
        match decoded {
            Value::Float(v) => assert!((v - 12.3456789).abs() < 1e-5),
            other => panic!("expected float, got {other:?}"),
        }
    }

    #[test]
    fn fixed_string_trims_padding() {
        let f = FieldDef { name: "s".into(), byte_length: 6, kind: FieldKind::FixString, unit: None, description: None };
        let (v, _) = f.decode(1, b"ABC\xFF\xFF\xFF", 0).unwrap();
        assert_eq!(v, Value::Str("ABC".to_string()));
    }
}
