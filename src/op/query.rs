// Copyright 2020-2024 the stub-resolv authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Query struct for looking up resource records

use std::fmt;

use crate::error::{ResolveErrorKind, ResolveResult};
use crate::op::{Header, RecordType, Response};
use crate::serialize::{BinDecoder, BinEncoder};

/// The IN class, the only one the resolver issues
pub(crate) const CLASS_IN: u16 = 1;

/// A single entry of the question section.
///
/// [RFC 1035, DOMAIN NAMES - IMPLEMENTATION AND SPECIFICATION, November 1987](https://tools.ietf.org/html/rfc1035)
///
/// ```text
/// 4.1.2. Question section format
///
///                                     1  1  1  1  1  1
///       0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                                               |
///     /                     QNAME                     /
///     /                                               /
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                     QTYPE                     |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                     QCLASS                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Question {
    name: String,
    query_type: RecordType,
    query_class: u16,
}

impl Question {
    /// The name being queried, lowercased, without the trailing dot
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The record type being queried
    pub fn query_type(&self) -> RecordType {
        self.query_type
    }

    /// Read one question entry from the decoder
    pub(crate) fn read(decoder: &mut BinDecoder<'_>) -> ResolveResult<Self> {
        Ok(Self {
            name: decoder.read_name()?,
            query_type: RecordType::from(decoder.read_u16()?),
            query_class: decoder.read_u16()?,
        })
    }

    pub(crate) fn emit(&self, encoder: &mut BinEncoder<'_>) -> ResolveResult<()> {
        encoder.emit_name(&self.name)?;
        encoder.emit_u16(u16::from(self.query_type));
        encoder.emit_u16(self.query_class);
        Ok(())
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.query_type)
    }
}

/// An encoded DNS request, ready to be put on the wire.
///
/// The transaction id is randomized at construction and never changes over
/// the lifetime of the query; retransmissions reuse the exact same bytes.
#[derive(Clone, Debug)]
pub struct Query {
    bytes: Vec<u8>,
    id: u16,
    question: Question,
}

impl Query {
    /// Create a standard recursion-desired query for `name`/`query_type`
    /// with a random transaction id.
    pub fn new(name: &str, query_type: RecordType) -> ResolveResult<Self> {
        Self::with_id(name, query_type, rand::random())
    }

    /// Create a query with an explicit transaction id.
    pub fn with_id(name: &str, query_type: RecordType, id: u16) -> ResolveResult<Self> {
        let question = Question {
            name: name.trim_end_matches('.').to_ascii_lowercase(),
            query_type,
            query_class: CLASS_IN,
        };
        if question.name.is_empty() {
            return Err(ResolveErrorKind::InvalidName(name.to_string()).into());
        }

        let mut bytes = Vec::with_capacity(Header::len() + question.name.len() + 6);
        let mut encoder = BinEncoder::new(&mut bytes);

        let mut header = Header::new();
        header.set_id(id).set_recursion_desired(true).set_query_count(1);
        header.emit(&mut encoder);
        question.emit(&mut encoder)?;

        Ok(Self { bytes, id, question })
    }

    /// The transaction id of this query
    pub fn id(&self) -> u16 {
        self.id
    }

    /// The question this query asks
    pub fn question(&self) -> &Question {
        &self.question
    }

    /// The raw wire-format bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether `response` answers this query: the transaction id must match
    /// and the response must echo the exact question.
    pub fn matches(&self, response: &Response) -> bool {
        if response.id() != self.id {
            return false;
        }

        match response.question() {
            Ok(Some(question)) => question == self.question,
            _ => false,
        }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} id:{}", self.question, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::ResponseCode;

    #[test]
    fn test_query_layout() {
        let query = Query::with_id("www.example.com", RecordType::A, 0x1234).unwrap();
        let bytes = query.bytes();

        assert_eq!(&bytes[0..2], &[0x12, 0x34]);
        // RD set, everything else clear
        assert_eq!(&bytes[2..4], &[0x01, 0x00]);
        // one question, no other records
        assert_eq!(&bytes[4..12], &[0, 1, 0, 0, 0, 0, 0, 0]);
        // type A, class IN at the tail
        assert_eq!(&bytes[bytes.len() - 4..], &[0, 1, 0, 1]);
    }

    #[test]
    fn test_name_is_normalized() {
        let query = Query::with_id("Example.COM.", RecordType::AAAA, 7).unwrap();
        assert_eq!(query.question().name(), "example.com");
    }

    #[test]
    fn test_empty_name_is_rejected() {
        assert!(Query::new("", RecordType::A).is_err());
        assert!(Query::new(".", RecordType::A).is_err());
    }

    #[test]
    fn test_matches_echoed_response() {
        let query = Query::with_id("example.com", RecordType::A, 42).unwrap();
        let response = Response::synthesize(&query, ResponseCode::NoError, false);
        assert!(query.matches(&response));

        let other = Query::with_id("example.com", RecordType::A, 43).unwrap();
        assert!(!other.matches(&response));

        let wrong_name = Query::with_id("example.org", RecordType::A, 42).unwrap();
        assert!(!wrong_name.matches(&response));

        let wrong_type = Query::with_id("example.com", RecordType::AAAA, 42).unwrap();
        assert!(!wrong_type.matches(&response));
    }
}
