//! NMEA0183 sentence parsing, encoding, and checksum (spec §3, §6).
//!
//! A sentence is a line terminated by CRLF: a leading `$` (talker) or `!`
//! (encapsulation) sentence, comma-separated fields, and a two hex digit
//! checksum after `*` computed as the XOR of every byte between the leading
//! `$`/`!` and the `*`.

use crate::error::CouplerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    /// `$` for a talker sentence, `!` for an encapsulation sentence.
    pub encapsulated: bool,
    pub talker: String,
    pub formatter: String,
    pub fields: Vec<String>,
}

impl Sentence {
    pub fn new(talker: impl Into<String>, formatter: impl Into<String>, fields: Vec<String>) -> Self {
        Sentence { encapsulated: false, talker: talker.into(), formatter: formatter.into(), fields }
    }

    /// Parse a single line (CRLF already stripped). Rejects sentences whose
    /// checksum does not match or whose talker/formatter pair is malformed.
    pub fn parse(line: &str) -> Result<Self, CouplerError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let leader = line.chars().next().ok_or_else(|| CouplerError::Malformed("empty line".into()))?;
        let encapsulated = match leader {
            '$' => false,
            '!' => true,
            other => return Err(CouplerError::Malformed(format!("unexpected leader '{other}'"))),
        };

        let (body, checksum_hex) = line[1..]
            .split_once('*')
            .ok_or_else(|| CouplerError::Malformed("missing checksum delimiter".into()))?;
        let expected = u8::from_str_radix(checksum_hex.trim(), 16)
            .map_err(|_| CouplerError::Malformed(format!("invalid checksum digits '{checksum_hex}'")))?;
        let actual = xor_checksum(body.as_bytes());
        if actual != expected {
            return Err(CouplerError::Malformed(format!(
                "checksum mismatch: computed {actual:02X}, frame claims {expected:02X}"
            )));
        }

        let mut fields = body.split(',');
        let header = fields.next().ok_or_else(|| CouplerError::Malformed("missing header field".into()))?;
        if header.len() < 5 {
            return Err(CouplerError::Malformed(format!("header '{header}' too short for talker+formatter")));
        }
        let talker = header[..2].to_string();
        let formatter = header[2..].to_string();
        let fields: Vec<String> = fields.map(str::to_string).collect();

        Ok(Sentence { encapsulated, talker, formatter, fields })
    }

    /// Render as a full line including leading `$`/`!`, checksum, and CRLF.
    pub fn render(&self) -> String {
        let body = format!("{}{},{}", self.talker, self.formatter, self.fields.join(","));
        let checksum = xor_checksum(body.as_bytes());
        let leader = if self.encapsulated { '!' } else { '$' };
        format!("{leader}{body}*{checksum:02X}\r\n")
    }
}

fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_talker_sentence() {
        let sentence = Sentence::new("GP", "GLL", vec!["4807.038".into(), "N".into(), "01131.000".into(), "E".into()]);
        let line = sentence.render();
        let parsed = Sentence::parse(&line).unwrap();
        assert_eq!(parsed, sentence);
    }

    #[test]
    fn rejects_bad_checksum() {
        let err = Sentence::parse("$GPGLL,4807.038,N,01131.000,E*00\r\n").unwrap_err();
        assert!(matches!(err, CouplerError::Malformed(_)));
    }

    #[test]
    fn accepts_encapsulation_sentences() {
        let sentence = Sentence::new("P", "DGY", vec!["1".into()]).render();
        let line = format!("!{}", &sentence[1..]);
        let parsed = Sentence::parse(&line).unwrap();
        assert!(parsed.encapsulated);
    }
}
