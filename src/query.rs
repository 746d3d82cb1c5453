//! DNS-shaped query parsing and reply encoding.
//!
//! Peers ask for their address by sending an ordinary DNS `A` query for
//! their own hostname. Only the header and the first question are read; the
//! reply echoes the question bytes verbatim and carries at most one answer.
//!
//! # Message Structure
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |             id (2)            |QR| opcode |AA|TC|RD|RA| Z|rcode|
//! +-------------------------------+-------------------------------+
//! |           qdcount (2)         |           ancount (2)         |
//! +-------------------------------+-------------------------------+
//! |           nscount (2)         |           arcount (2)         |
//! +-------------------------------+-------------------------------+
//! |     qname (length-prefixed labels, zero terminated) ...       |
//! +-------------------------------+-------------------------------+
//! |           qtype (2)           |           qclass (2)          |
//! +-------------------------------+-------------------------------+
//! ```
//!
//! # References
//!
//! - RFC 1035: Domain Names - Implementation and Specification

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// Record type for IPv4 host addresses.
pub const TYPE_A: u16 = 1;

/// The Internet class.
pub const CLASS_IN: u16 = 1;

/// TTL attached to every address answer.
pub const ANSWER_TTL_SECONDS: u32 = 60;

const HEADER_SIZE: usize = 12;
const QUESTION_FIXED_SIZE: usize = 4;
const ANSWER_FIXED_SIZE: usize = 10;
const MAX_LABEL_LENGTH: usize = 63;
const MAX_NAME_LENGTH: usize = 255;

/// Label length bytes with either of the top two bits set are compression
/// pointers or extended label types.
const LABEL_TYPE_MASK: u8 = 0xC0;

/// Pointer to the question name, which always starts right after the header.
const QUESTION_NAME_POINTER: [u8; 2] = [0xC0, HEADER_SIZE as u8];

pub const FLAG_QR: u16 = 1 << 15;
pub const FLAG_AA: u16 = 1 << 10;
pub const FLAG_RD: u16 = 1 << 8;
pub const FLAG_RA: u16 = 1 << 7;
const MASK_OPCODE: u16 = 0x7800;
const MASK_RCODE: u16 = 0x000F;

pub const RCODE_NOERROR: u16 = 0;
pub const RCODE_SERVFAIL: u16 = 2;
pub const RCODE_REFUSED: u16 = 5;

/// Outcome of resolving a query, as carried in the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    /// The hostname holds this address.
    Address(Ipv4Addr),
    /// Well-formed query for a record type this server does not serve.
    NoData,
    /// The address could not be granted (pool exhausted or persistence failed).
    ServerFailure,
    /// The hostname can never be leased.
    Refused,
}

impl Answer {
    pub fn rcode(&self) -> u16 {
        match self {
            Answer::Address(_) | Answer::NoData => RCODE_NOERROR,
            Answer::ServerFailure => RCODE_SERVFAIL,
            Answer::Refused => RCODE_REFUSED,
        }
    }
}

/// A decoded inbound query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// Transaction ID chosen by the client, echoed in replies.
    pub id: u16,

    /// Header flags as received.
    pub flags: u16,

    /// Queried name in absolute form, labels joined by `.` with a trailing `.`.
    pub name: String,

    /// Question type. [`TYPE_A`] is the only one answered with data.
    pub qtype: u16,

    /// Question class.
    pub qclass: u16,

    /// The raw question section (name, type, class), echoed in replies.
    question: Vec<u8>,
}

impl Query {
    /// Decodes a query from raw datagram bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedQuery`] if:
    /// - The datagram is shorter than the 12-byte header
    /// - The message is a response or carries no question
    /// - A label runs past the end of the buffer
    /// - The name has no zero-length terminator before the buffer ends
    /// - A label uses compression or extended label bits, or is not UTF-8
    /// - The type/class fields are missing
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::MalformedQuery(format!(
                "Message too short: {} bytes (minimum {})",
                data.len(),
                HEADER_SIZE
            )));
        }

        let id = u16::from_be_bytes([data[0], data[1]]);
        let flags = u16::from_be_bytes([data[2], data[3]]);
        let qdcount = u16::from_be_bytes([data[4], data[5]]);

        if flags & FLAG_QR != 0 {
            return Err(Error::MalformedQuery("Message is a response".to_string()));
        }

        if qdcount == 0 {
            return Err(Error::MalformedQuery("No question present".to_string()));
        }

        let (name, name_end) = decode_question_name(data, HEADER_SIZE)?;

        let question_end = name_end + QUESTION_FIXED_SIZE;
        if question_end > data.len() {
            return Err(Error::MalformedQuery(
                "Question type/class truncated".to_string(),
            ));
        }

        let qtype = u16::from_be_bytes([data[name_end], data[name_end + 1]]);
        let qclass = u16::from_be_bytes([data[name_end + 2], data[name_end + 3]]);

        Ok(Self {
            id,
            flags,
            name,
            qtype,
            qclass,
            question: data[HEADER_SIZE..question_end].to_vec(),
        })
    }

    /// Returns the queried name without the trailing root separator.
    pub fn hostname(&self) -> &str {
        self.name.strip_suffix('.').unwrap_or(&self.name)
    }

    /// Returns true for an `A` query, the only kind answered with data.
    pub fn is_address_query(&self) -> bool {
        self.qtype == TYPE_A
    }

    /// The question section exactly as received.
    pub fn question(&self) -> &[u8] {
        &self.question
    }

    /// Encodes the reply to this query.
    ///
    /// The header keeps the transaction ID, opcode and RD bit, and sets QR,
    /// AA and RA. The question is echoed verbatim. [`Answer::Address`] adds
    /// one `A` record; every other answer leaves the answer section empty.
    pub fn encode_reply(&self, answer: Answer) -> Vec<u8> {
        let answer_count: u16 = match answer {
            Answer::Address(_) => 1,
            _ => 0,
        };
        let flags = FLAG_QR
            | FLAG_AA
            | FLAG_RA
            | (self.flags & (MASK_OPCODE | FLAG_RD))
            | answer.rcode();

        let mut reply =
            Vec::with_capacity(HEADER_SIZE + self.question.len() + ANSWER_FIXED_SIZE + 6);

        reply.extend_from_slice(&self.id.to_be_bytes());
        reply.extend_from_slice(&flags.to_be_bytes());
        reply.extend_from_slice(&1u16.to_be_bytes());
        reply.extend_from_slice(&answer_count.to_be_bytes());
        reply.extend_from_slice(&0u16.to_be_bytes());
        reply.extend_from_slice(&0u16.to_be_bytes());

        reply.extend_from_slice(&self.question);

        if let Answer::Address(address) = answer {
            reply.extend_from_slice(&QUESTION_NAME_POINTER);
            reply.extend_from_slice(&TYPE_A.to_be_bytes());
            reply.extend_from_slice(&CLASS_IN.to_be_bytes());
            reply.extend_from_slice(&ANSWER_TTL_SECONDS.to_be_bytes());
            reply.extend_from_slice(&4u16.to_be_bytes());
            reply.extend_from_slice(&address.octets());
        }

        reply
    }
}

/// Encodes an `A` query for `hostname`, as sent by the companion client.
///
/// # Errors
///
/// Returns [`Error::InvalidHostname`] if a label is empty or longer than 63
/// bytes, or the whole name is longer than 255 bytes.
pub fn encode_address_query(id: u16, hostname: &str) -> Result<Vec<u8>> {
    let hostname = hostname.strip_suffix('.').unwrap_or(hostname);
    let invalid = || Error::InvalidHostname(hostname.to_string());

    let mut query = Vec::with_capacity(HEADER_SIZE + hostname.len() + 2 + QUESTION_FIXED_SIZE);
    query.extend_from_slice(&id.to_be_bytes());
    query.extend_from_slice(&FLAG_RD.to_be_bytes());
    query.extend_from_slice(&1u16.to_be_bytes());
    query.extend_from_slice(&[0; 6]);

    for label in hostname.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LENGTH {
            return Err(invalid());
        }
        query.push(label.len() as u8);
        query.extend_from_slice(label.as_bytes());
    }
    query.push(0);

    if query.len() - HEADER_SIZE > MAX_NAME_LENGTH {
        return Err(invalid());
    }

    query.extend_from_slice(&TYPE_A.to_be_bytes());
    query.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok(query)
}

/// The parts of a reply the companion client needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub id: u16,
    pub flags: u16,
    /// Every `A`/`IN` answer, in order.
    pub addresses: Vec<Ipv4Addr>,
}

impl Reply {
    /// Decodes a reply, collecting its `A` answers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedQuery`] if the message is not a reply or
    /// any section is truncated.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::MalformedQuery("Reply too short".to_string()));
        }

        let id = u16::from_be_bytes([data[0], data[1]]);
        let flags = u16::from_be_bytes([data[2], data[3]]);
        let qdcount = u16::from_be_bytes([data[4], data[5]]);
        let ancount = u16::from_be_bytes([data[6], data[7]]);

        if flags & FLAG_QR == 0 {
            return Err(Error::MalformedQuery("Message is not a reply".to_string()));
        }

        let mut offset = HEADER_SIZE;
        for _ in 0..qdcount {
            offset = skip_name(data, offset)? + QUESTION_FIXED_SIZE;
        }

        let mut addresses = Vec::new();
        for _ in 0..ancount {
            offset = skip_name(data, offset)?;
            let fixed = data
                .get(offset..offset + ANSWER_FIXED_SIZE)
                .ok_or_else(|| Error::MalformedQuery("Answer truncated".to_string()))?;
            let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
            let rclass = u16::from_be_bytes([fixed[2], fixed[3]]);
            let rdlength = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
            offset += ANSWER_FIXED_SIZE;

            let rdata = data
                .get(offset..offset + rdlength)
                .ok_or_else(|| Error::MalformedQuery("Answer data truncated".to_string()))?;
            if rtype == TYPE_A && rclass == CLASS_IN && rdlength == 4 {
                addresses.push(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]));
            }
            offset += rdlength;
        }

        Ok(Self {
            id,
            flags,
            addresses,
        })
    }

    pub fn rcode(&self) -> u16 {
        self.flags & MASK_RCODE
    }
}

/// Walks uncompressed labels from `offset`, returning the absolute name and
/// the offset just past its terminator.
fn decode_question_name(data: &[u8], mut offset: usize) -> Result<(String, usize)> {
    let mut name = String::new();
    let mut wire_length = 0;

    loop {
        let length = *data
            .get(offset)
            .ok_or_else(|| Error::MalformedQuery("Name not terminated".to_string()))?;
        offset += 1;
        wire_length += 1;

        if length == 0 {
            break;
        }

        if length & LABEL_TYPE_MASK != 0 {
            return Err(Error::MalformedQuery(format!(
                "Unsupported label type 0x{:02x} in question",
                length
            )));
        }

        let length = length as usize;
        let label = data
            .get(offset..offset + length)
            .ok_or_else(|| Error::MalformedQuery("Label truncated".to_string()))?;
        let label = std::str::from_utf8(label)
            .map_err(|_| Error::MalformedQuery("Label is not valid UTF-8".to_string()))?;

        wire_length += length;
        // The terminating zero byte still has to fit.
        if wire_length >= MAX_NAME_LENGTH {
            return Err(Error::MalformedQuery("Name too long".to_string()));
        }

        name.push_str(label);
        name.push('.');
        offset += length;
    }

    if name.is_empty() {
        name.push('.');
    }

    Ok((name, offset))
}

/// Skips a possibly compressed name, returning the offset just past it.
fn skip_name(data: &[u8], mut offset: usize) -> Result<usize> {
    loop {
        let length = *data
            .get(offset)
            .ok_or_else(|| Error::MalformedQuery("Name not terminated".to_string()))?;

        if length & LABEL_TYPE_MASK == LABEL_TYPE_MASK {
            if offset + 2 > data.len() {
                return Err(Error::MalformedQuery("Pointer truncated".to_string()));
            }
            return Ok(offset + 2);
        }

        offset += 1;
        if length == 0 {
            return Ok(offset);
        }
        offset += length as usize;
    }
}
