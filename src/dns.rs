//! DNS message inspection.
//!
//! The proxy is byte-transparent: only the header and the first question
//! are read, to build a [`CacheKey`]. Everything else is forwarded untouched.
//! Only a standard query with exactly one question is cacheable; NOTIFY,
//! UPDATE and multi-question messages are forwarded but never cached.

use std::fmt;
use std::fmt::Write as _;

use crate::error::ParseError;

pub const HEADER_LEN: usize = 12;

const MAX_NAME_LEN: usize = 255;

// Bits of the third header byte.
const FLAG_QR: u8 = 0x80;
const OPCODE_MASK: u8 = 0x78;
const FLAG_TC: u8 = 0x02;

/// Opcode of a standard query.
pub const OPCODE_QUERY: u8 = 0;

/// Canonical identity of a question: name, record type and class.
///
/// The name is stored lowercased in presentation format with a trailing dot,
/// so `Example.COM` and `example.com` share a key while `A` and `AAAA` do not.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    name: String,
    qtype: u16,
    qclass: u16,
}

impl CacheKey {
    pub fn new(name: &str, qtype: u16, qclass: u16) -> Self {
        let mut name = name.to_ascii_lowercase();
        if !name.ends_with('.') {
            name.push('.');
        }

        Self {
            name,
            qtype,
            qclass,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn qtype(&self) -> u16 {
        self.qtype
    }

    pub fn qclass(&self) -> u16 {
        self.qclass
    }
}

impl fmt::Display for CacheKey {
    /// Renders as `example.com. IN A`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        match class_name(self.qclass) {
            Some(class) => write!(f, " {class}")?,
            None => write!(f, " CLASS{}", self.qclass)?,
        }
        match type_name(self.qtype) {
            Some(rtype) => write!(f, " {rtype}"),
            None => write!(f, " TYPE{}", self.qtype),
        }
    }
}

/// The parts of an inbound query the proxy cares about.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub id: u16,
    pub opcode: u8,
    pub qdcount: u16,
    pub key: CacheKey,
}

impl DnsQuery {
    /// Parse the header and first question of a query.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < HEADER_LEN {
            return Err(ParseError::TooShort(data.len()));
        }
        if data[2] & FLAG_QR != 0 {
            return Err(ParseError::NotAQuery);
        }

        let id = u16::from_be_bytes([data[0], data[1]]);
        let opcode = (data[2] & OPCODE_MASK) >> 3;
        let qdcount = u16::from_be_bytes([data[4], data[5]]);
        if qdcount == 0 {
            return Err(ParseError::NoQuestion);
        }

        let mut pos = HEADER_LEN;
        let mut name = String::new();
        // Wire length of the name, counting the terminating root label.
        let mut wire_len = 1;

        loop {
            let label_len = *data.get(pos).ok_or(ParseError::Truncated)?;
            pos += 1;
            if label_len == 0 {
                break;
            }
            if label_len & 0xC0 != 0 {
                return Err(ParseError::BadLabel(label_len));
            }

            let label_len = label_len as usize;
            wire_len += label_len + 1;
            if wire_len > MAX_NAME_LEN {
                return Err(ParseError::NameTooLong);
            }

            let label = data
                .get(pos..pos + label_len)
                .ok_or(ParseError::Truncated)?;
            for &byte in label {
                push_presentation_byte(&mut name, byte.to_ascii_lowercase());
            }
            name.push('.');
            pos += label_len;
        }

        if name.is_empty() {
            name.push('.');
        }

        let fixed = data.get(pos..pos + 4).ok_or(ParseError::Truncated)?;
        let qtype = u16::from_be_bytes([fixed[0], fixed[1]]);
        let qclass = u16::from_be_bytes([fixed[2], fixed[3]]);

        Ok(Self {
            id,
            opcode,
            qdcount,
            key: CacheKey {
                name,
                qtype,
                qclass,
            },
        })
    }

    /// Whether the answer depends on the key alone. Other opcodes and
    /// additional questions change the response for the same first question.
    pub fn is_cacheable(&self) -> bool {
        self.opcode == OPCODE_QUERY && self.qdcount == 1
    }
}

/// Copy of `message` carrying transaction ID `id`.
///
/// Cached responses were stored under the ID of the query that fetched them;
/// a later client only accepts a reply echoing its own ID.
pub fn with_id(message: &[u8], id: u16) -> Vec<u8> {
    let mut out = message.to_vec();
    if out.len() >= 2 {
        out[..2].copy_from_slice(&id.to_be_bytes());
    }
    out
}

/// Whether the TC (truncated) header bit is set.
pub fn is_truncated(message: &[u8]) -> bool {
    message.len() >= HEADER_LEN && message[2] & FLAG_TC != 0
}

// Escapes follow the master file format: `\.` and `\\` for the two
// characters with meaning, `\DDD` for anything outside printable ASCII.
fn push_presentation_byte(out: &mut String, byte: u8) {
    match byte {
        b'.' | b'\\' => {
            out.push('\\');
            out.push(byte as char);
        }
        0x21..=0x7E => out.push(byte as char),
        _ => {
            let _ = write!(out, "\\{byte:03}");
        }
    }
}

fn type_name(qtype: u16) -> Option<&'static str> {
    Some(match qtype {
        1 => "A",
        2 => "NS",
        5 => "CNAME",
        6 => "SOA",
        12 => "PTR",
        15 => "MX",
        16 => "TXT",
        28 => "AAAA",
        33 => "SRV",
        35 => "NAPTR",
        41 => "OPT",
        43 => "DS",
        46 => "RRSIG",
        48 => "DNSKEY",
        64 => "SVCB",
        65 => "HTTPS",
        255 => "ANY",
        257 => "CAA",
        _ => return None,
    })
}

fn class_name(qclass: u16) -> Option<&'static str> {
    Some(match qclass {
        1 => "IN",
        3 => "CH",
        4 => "HS",
        254 => "NONE",
        255 => "ANY",
        _ => return None,
    })
}
