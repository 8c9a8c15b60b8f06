//! Loads the PGN schema XML once at startup and answers lookup/decode/encode
//! requests against it (spec §4.A).

use std::collections::HashMap;

use roxmltree::{Document, Node};

use crate::error::CodecError;

use super::field::{BitField, FieldDef, FieldKind, RepeatedFieldSet, SubField};
use super::range::{fast_packet_by_range, is_pdu1, pgn_pdu1_adjust};
use super::value::Value;

#[derive(Debug, Clone)]
pub enum Element {
    Field(FieldDef),
    Bits(BitField),
    Repeated(RepeatedFieldSet),
}

#[derive(Debug, Clone)]
pub struct PgnDef {
    pub pgn: u32,
    pub name: String,
    /// `None` for a variable-length PGN (Fast-Packet or repeated-field set driven).
    pub byte_length: Option<usize>,
    pub proprietary: bool,
    pub elements: Vec<Element>,
}

impl PgnDef {
    pub fn is_fast_packet(&self) -> bool {
        match fast_packet_by_range(self.pgn) {
            Some(v) => v,
            None => self.byte_length.map(|n| n > 8).unwrap_or(true),
        }
    }

    pub fn is_pdu1(&self) -> bool {
        is_pdu1(self.pgn)
    }

    pub fn decode(&self, data: &[u8]) -> Result<HashMap<String, Value>, CodecError> {
        let mut out = HashMap::new();
        let mut index = 0usize;
        for element in &self.elements {
            match element {
                Element::Field(field) => {
                    let (value, consumed) = field.decode(self.pgn, data, index)?;
                    index += consumed;
                    if value.is_valid() || matches!(field.kind, FieldKind::Reserved) {
                        if !matches!(field.kind, FieldKind::Reserved) {
                            out.insert(field.name.clone(), value);
                        }
                    } else {
                        out.insert(field.name.clone(), Value::Invalid);
                    }
                }
                Element::Bits(bits) => {
                    let (values, consumed) = bits.decode(self.pgn, data, index)?;
                    index += consumed;
                    for (name, value) in values {
                        out.insert(name, value);
                    }
                }
                Element::Repeated(rep) => {
                    let (groups, consumed) = rep.decode(self.pgn, data, index, &out)?;
                    index += consumed;
                    out.insert(
                        rep.count_field.clone() + "_groups",
                        Value::UInt(groups.len() as u64),
                    );
                    for (i, group) in groups.into_iter().enumerate() {
                        for (name, value) in group {
                            out.insert(format!("{name}#{i}"), value);
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn encode(&self, values: &HashMap<String, Value>) -> Vec<u8> {
        let capacity = self.byte_length.unwrap_or(223);
        let mut buffer = vec![0xFFu8; capacity];
        let mut index = 0usize;
        for element in &self.elements {
            match element {
                Element::Field(field) => {
                    let value = values.get(&field.name).cloned().unwrap_or_else(|| field.no_value());
                    if index + field.byte_length > buffer.len() {
                        buffer.resize(index + field.byte_length, 0xFF);
                    }
                    index += field.encode(&value, &mut buffer, index).unwrap_or(field.byte_length);
                }
                Element::Bits(bits) => {
                    if index + bits.byte_length > buffer.len() {
                        buffer.resize(index + bits.byte_length, 0xFF);
                    }
                    index += bits.encode(values, &mut buffer, index);
                }
                Element::Repeated(rep) => {
                    // Encoding repeated groups back onto the wire is not exercised by the
                    // router today (it only ever re-sends PGNs it authored itself); the
                    // count field governs how many group slots a future encoder would fill.
                    let _ = rep;
                }
            }
        }
        buffer.truncate(index.max(self.byte_length.unwrap_or(index)));
        buffer
    }
}

pub struct PgnDictionary {
    pgns: HashMap<u32, PgnDef>,
    proprietary: HashMap<(u32, u32), PgnDef>,
}

impl PgnDictionary {
    /// A dictionary with no loaded PGN definitions; every lookup falls back
    /// to the range-based heuristics.
    pub fn empty() -> Self {
        PgnDictionary { pgns: HashMap::new(), proprietary: HashMap::new() }
    }

    pub fn parse(xml: &str) -> Result<Self, CodecError> {
        let doc = Document::parse(xml)?;
        let mut pgns = HashMap::new();
        let proprietary = HashMap::new();
        let root = doc.root_element();
        for pgn_node in root.descendants().filter(|n| n.has_tag_name("PGNInfo")) {
            let def = parse_pgn(pgn_node)?;
            pgns.insert(def.pgn, def);
        }
        Ok(PgnDictionary { pgns, proprietary })
    }

    pub fn lookup(&self, pgn: u32, mfg_id: Option<u32>) -> Result<&PgnDef, CodecError> {
        if let Some(mfg) = mfg_id {
            if let Some(def) = self.proprietary.get(&(pgn, mfg)) {
                return Ok(def);
            }
        }
        self.pgns.get(&pgn).ok_or(CodecError::UnknownPgn(pgn))
    }

    pub fn is_fast_packet(&self, pgn: u32) -> bool {
        self.pgns.get(&pgn).map(|d| d.is_fast_packet()).unwrap_or_else(|| {
            fast_packet_by_range(pgn).unwrap_or(false)
        })
    }

    pub fn is_pdu1(&self, pgn: u32) -> bool {
        is_pdu1(pgn)
    }

    pub fn pdu1_split(&self, raw_pgn: u32) -> (u32, u8) {
        pgn_pdu1_adjust(raw_pgn)
    }

    pub fn decode(&self, pgn: u32, mfg_id: Option<u32>, data: &[u8]) -> Result<HashMap<String, Value>, CodecError> {
        self.lookup(pgn, mfg_id)?.decode(data)
    }

    pub fn encode(&self, pgn: u32, mfg_id: Option<u32>, values: &HashMap<String, Value>) -> Result<Vec<u8>, CodecError> {
        Ok(self.lookup(pgn, mfg_id)?.encode(values))
    }

    pub fn len(&self) -> usize {
        self.pgns.len()
    }
}

fn parse_pgn(node: Node) -> Result<PgnDef, CodecError> {
    let pgn = text_child(node, "PGN")
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| CodecError::DefinitionError("PGNInfo missing PGN".into()))?;
    let name = text_child(node, "Id").unwrap_or_default();
    let byte_length = text_child(node, "Length").and_then(|s| s.parse::<usize>().ok());
    let proprietary = text_child(node, "Complete")
        .map(|s| s.eq_ignore_ascii_case("false"))
        .unwrap_or(false);

    let mut elements = Vec::new();
    if let Some(fields_node) = node.children().find(|n| n.has_tag_name("Fields")) {
        let mut pending_bits: Vec<(usize, usize, SubField)> = Vec::new();
        let mut bit_cursor = 0usize;

        for field_node in fields_node.children().filter(Node::is_element) {
            let bit_length = text_child(field_node, "BitLength").and_then(|s| s.parse::<usize>().ok());
            let is_sub_byte = bit_length.map(|b| b % 8 != 0).unwrap_or(false);

            if is_sub_byte {
                let len = bit_length.unwrap();
                let sub = parse_subfield(field_node)?;
                pending_bits.push((bit_cursor, len, sub));
                bit_cursor += len;
                if bit_cursor % 8 == 0 {
                    let byte_length = bit_cursor / 8;
                    elements.push(Element::Bits(BitField { byte_length, members: std::mem::take(&mut pending_bits) }));
                    bit_cursor = 0;
                }
                continue;
            }

            if !pending_bits.is_empty() {
                let byte_length = bit_cursor.div_ceil(8);
                elements.push(Element::Bits(BitField { byte_length, members: std::mem::take(&mut pending_bits) }));
                bit_cursor = 0;
            }

            if field_node.has_tag_name("RepeatedFieldSet") {
                let count_field = text_child(field_node, "CountField").unwrap_or_default();
                let mut sub_fields = Vec::new();
                if let Some(inner) = field_node.children().find(|n| n.has_tag_name("Field") || n.has_tag_name("Fields")) {
                    for inner_field in inner.children().filter(Node::is_element) {
                        sub_fields.push(parse_field(inner_field)?);
                    }
                }
                elements.push(Element::Repeated(RepeatedFieldSet { count_field, fields: sub_fields }));
                continue;
            }

            elements.push(Element::Field(parse_field(field_node)?));
        }

        if !pending_bits.is_empty() {
            let byte_length = bit_cursor.div_ceil(8);
            elements.push(Element::Bits(BitField { byte_length, members: pending_bits }));
        }
    }

    Ok(PgnDef { pgn, name, byte_length, proprietary, elements })
}

fn parse_subfield(node: Node) -> Result<SubField, CodecError> {
    let name = text_child(node, "Name").or_else(|| node.attribute("Name").map(str::to_string)).unwrap_or_default();
    let reserved = name.eq_ignore_ascii_case("reserved") || node.has_tag_name("ReservedField");
    let signed = node.has_tag_name("IntField") || node.has_tag_name("EnumIntField");
    let enum_map = parse_enum_values(node);
    Ok(SubField { name, signed, enum_map, reserved })
}

fn parse_field(node: Node) -> Result<FieldDef, CodecError> {
    let name = text_child(node, "Name").or_else(|| node.attribute("Name").map(str::to_string)).unwrap_or_default();
    let bit_length = text_child(node, "BitLength").and_then(|s| s.parse::<usize>().ok()).unwrap_or(8);
    let byte_length = bit_length.div_ceil(8);
    let unit = text_child(node, "Unit");
    let description = text_child(node, "Description");

    let kind = match node.tag_name().name() {
        "UIntField" => FieldKind::UInt,
        "IntField" => FieldKind::Int,
        "DblField" => FieldKind::Dbl {
            scale: text_child(node, "Scale").and_then(|s| s.parse().ok()).unwrap_or(1.0),
            offset: text_child(node, "Offset").and_then(|s| s.parse().ok()).unwrap_or(0.0),
        },
        "UDblField" => FieldKind::UDbl {
            scale: text_child(node, "Scale").and_then(|s| s.parse().ok()).unwrap_or(1.0),
            offset: text_child(node, "Offset").and_then(|s| s.parse().ok()).unwrap_or(0.0),
        },
        "EnumField" => FieldKind::Enum(parse_enum_values(node).unwrap_or_default()),
        "EnumIntField" => FieldKind::EnumInt(parse_enum_values(node).unwrap_or_default()),
        "InstanceField" => FieldKind::Instance,
        "NameField" => FieldKind::Name,
        "AsciiField" => FieldKind::Ascii,
        "StringVarField" | "VarStringField" => FieldKind::VarString,
        "StringFixField" | "FixStringField" => FieldKind::FixString,
        "CommunicationStatusField" => FieldKind::CommunicationStatus,
        "ReservedField" => FieldKind::Reserved,
        other => return Err(CodecError::DefinitionError(format!("unknown field tag '{other}'"))),
    };

    Ok(FieldDef { name, byte_length, kind, unit, description })
}

fn parse_enum_values(node: Node) -> Option<HashMap<i64, String>> {
    let values_node = node.children().find(|n| n.has_tag_name("EnumValues"))?;
    let mut map = HashMap::new();
    for pair in values_node.children().filter(|n| n.has_tag_name("EnumPair")) {
        let key = pair.attribute("Value").and_then(|s| s.parse::<i64>().ok());
        let label = pair.attribute("Name").map(str::to_string);
        if let (Some(k), Some(v)) = (key, label) {
            map.insert(k, v);
        }
    }
    Some(map)
}

fn text_child(node: Node, tag: &str) -> Option<String> {
    node.children()
        .find(|n| n.has_tag_name(tag))
        .and_then(|n| n.text())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
    <PGNDefinitions>
      <PGNInfo>
        <PGN>127250</PGN>
        <Id>heading</Id>
        <Length>8</Length>
        <Complete>true</Complete>
        <Fields>
          <UIntField>
            <Name>SID</Name>
            <BitLength>8</BitLength>
          </UIntField>
          <UDblField>
            <Name>Heading</Name>
            <BitLength>16</BitLength>
            <Scale>0.0001</Scale>
            <Offset>0</Offset>
            <Unit>rad</Unit>
          </UDblField>
        </Fields>
      </PGNInfo>
    </PGNDefinitions>
    "#;

    #[test]
    fn parses_and_decodes_heading() {
        let dict = PgnDictionary::parse(SAMPLE).unwrap();
        assert_eq!(dict.len(), 1);
        let data = [5u8, 0x10, 0x27, 0, 0, 0, 0, 0];
        let decoded = dict.decode(127250, None, &data).unwrap();
        assert_eq!(decoded.get("SID").unwrap().as_u64(), Some(5));
        match decoded.get("Heading").unwrap() {
            Value::Float(v) => assert!((*v - 1.0).abs() < 1e-3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_pgn_is_an_error() {
        let dict = PgnDictionary::parse(SAMPLE).unwrap();
        assert!(matches!(dict.lookup(999999, None), Err(CodecError::UnknownPgn(999999))));
    }
}
