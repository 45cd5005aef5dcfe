//! NDEF messages, as exchanged with tags and peers in their raw wire form.

use std::convert::TryFrom;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const FLAG_MB: u8 = 0x80;
const FLAG_ME: u8 = 0x40;
const FLAG_CF: u8 = 0x20;
const FLAG_SR: u8 = 0x10;
const FLAG_IL: u8 = 0x08;
const TNF_MASK: u8 = 0x07;

/// The type name format of a record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tnf {
    Empty,
    WellKnown,
    Mime,
    Uri,
    External,
    Unknown,
    Unchanged,
}

impl Tnf {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Tnf::Empty),
            1 => Some(Tnf::WellKnown),
            2 => Some(Tnf::Mime),
            3 => Some(Tnf::Uri),
            4 => Some(Tnf::External),
            5 => Some(Tnf::Unknown),
            6 => Some(Tnf::Unchanged),
            _ => None,
        }
    }

    fn bits(self) -> u8 {
        match self {
            Tnf::Empty => 0,
            Tnf::WellKnown => 1,
            Tnf::Mime => 2,
            Tnf::Uri => 3,
            Tnf::External => 4,
            Tnf::Unknown => 5,
            Tnf::Unchanged => 6,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NdefRecord {
    pub tnf: Tnf,
    pub record_type: Vec<u8>,
    pub id: Vec<u8>,
    pub payload: Vec<u8>,
}

impl NdefRecord {
    pub fn new(tnf: Tnf, record_type: &[u8], id: &[u8], payload: &[u8]) -> Self {
        NdefRecord {
            tnf,
            record_type: record_type.to_vec(),
            id: id.to_vec(),
            payload: payload.to_vec(),
        }
    }

    /// A well known "T" record with a UTF-8 payload
    pub fn text(text: &str, language: &str) -> Self {
        let mut payload = Vec::with_capacity(1 + language.len() + text.len());
        payload.push((language.len() & 0x3f) as u8);
        payload.extend_from_slice(language.as_bytes());
        payload.extend_from_slice(text.as_bytes());
        NdefRecord::new(Tnf::WellKnown, b"T", &[], &payload)
    }

    /// A well known "U" record, without any URI prefix abbreviation
    pub fn uri(uri: &str) -> Self {
        let mut payload = vec![0u8];
        payload.extend_from_slice(uri.as_bytes());
        NdefRecord::new(Tnf::WellKnown, b"U", &[], &payload)
    }

    pub fn mime(mime_type: &str, data: &[u8]) -> Self {
        NdefRecord::new(Tnf::Mime, mime_type.as_bytes(), &[], data)
    }
}

/// An ordered list of records
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NdefMessage {
    pub records: Vec<NdefRecord>,
}

fn invalid(reason: &str) -> Error {
    Error::InvalidValues(format!("Invalid NDEF message: {}", reason))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.bytes.len());
        match end {
            Some(end) => {
                let slice = &self.bytes[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(invalid("truncated record")),
        }
    }

    fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
}

impl NdefMessage {
    pub fn new(records: Vec<NdefRecord>) -> Self {
        NdefMessage { records }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(invalid("empty"));
        }
        let mut reader = Reader { bytes, pos: 0 };
        let mut records = Vec::new();

        loop {
            let header = reader.byte()?;
            if records.is_empty() && header & FLAG_MB == 0 {
                return Err(invalid("first record lacks the message begin flag"));
            }
            if header & FLAG_CF != 0 {
                return Err(invalid("chunked records aren't supported"));
            }
            let tnf = Tnf::from_bits(header & TNF_MASK).ok_or_else(|| invalid("reserved type name format"))?;

            let type_len = reader.byte()? as usize;
            let payload_len = if header & FLAG_SR != 0 {
                reader.byte()? as usize
            } else {
                let len = reader.take(4)?;
                u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize
            };
            let id_len = if header & FLAG_IL != 0 { reader.byte()? as usize } else { 0 };

            let record_type = reader.take(type_len)?.to_vec();
            let id = reader.take(id_len)?.to_vec();
            let payload = reader.take(payload_len)?.to_vec();
            records.push(NdefRecord { tnf, record_type, id, payload });

            if header & FLAG_ME != 0 {
                break;
            }
        }

        if reader.pos != bytes.len() {
            return Err(invalid("trailing bytes after the last record"));
        }
        Ok(NdefMessage { records })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.records.is_empty() {
            return Err(invalid("no records"));
        }
        let mut out = Vec::new();
        let last = self.records.len() - 1;
        for (i, record) in self.records.iter().enumerate() {
            if record.record_type.len() > u8::MAX as usize || record.id.len() > u8::MAX as usize {
                return Err(invalid("record type or id too long"));
            }
            let short = record.payload.len() <= u8::MAX as usize;

            let mut header = record.tnf.bits();
            if i == 0 {
                header |= FLAG_MB;
            }
            if i == last {
                header |= FLAG_ME;
            }
            if short {
                header |= FLAG_SR;
            }
            if !record.id.is_empty() {
                header |= FLAG_IL;
            }

            out.push(header);
            out.push(record.record_type.len() as u8);
            if short {
                out.push(record.payload.len() as u8);
            } else {
                let len = u32::try_from(record.payload.len()).map_err(|_| invalid("payload too long"))?;
                out.extend_from_slice(&len.to_be_bytes());
            }
            if !record.id.is_empty() {
                out.push(record.id.len() as u8);
            }
            out.extend_from_slice(&record.record_type);
            out.extend_from_slice(&record.id);
            out.extend_from_slice(&record.payload);
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_text_record() {
        // A single short "T" record: "en" + "hi"
        let bytes = [0xd1, 0x01, 0x05, b'T', 0x02, b'e', b'n', b'h', b'i'];
        let message = NdefMessage::from_bytes(&bytes).unwrap();
        assert_eq!(message.records, vec![NdefRecord::text("hi", "en")]);
        assert_eq!(message.to_bytes().unwrap(), bytes.to_vec());
    }

    #[test]
    fn long_payloads_and_ids() {
        let payload = vec![0xab; 300];
        let message = NdefMessage::new(vec![
            NdefRecord::uri("https://tizen.org"),
            NdefRecord::new(Tnf::External, b"tizen.org:x", b"id1", &payload),
        ]);
        let bytes = message.to_bytes().unwrap();
        // The second record doesn't fit a short record
        assert_eq!(NdefMessage::from_bytes(&bytes).unwrap(), message);
        assert_eq!(bytes[0] & (FLAG_MB | FLAG_ME), FLAG_MB);
    }

    #[test]
    fn malformed_messages_are_invalid_values() {
        assert!(matches!(NdefMessage::from_bytes(&[]), Err(Error::InvalidValues(_))));
        assert!(matches!(NdefMessage::from_bytes(&[0xd1, 0x01, 0x09, b'T']), Err(Error::InvalidValues(_))));
        assert!(matches!(NdefMessage::from_bytes(&[0x51, 0x00, 0x00]), Err(Error::InvalidValues(_))));
        assert!(matches!(NdefMessage::default().to_bytes(), Err(Error::InvalidValues(_))));
    }
}
