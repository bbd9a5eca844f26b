// Copyright 2020-2024 the stub-resolv authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Responses received from a nameserver

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::ResolveResult;
use crate::op::query::CLASS_IN;
use crate::op::{Header, MessageType, Query, Question, RecordType, ResponseCode};
use crate::serialize::{BinDecoder, BinEncoder};

/// A DNS response message: raw wire bytes plus the decoded header.
///
/// The header is decoded once at construction; the question and answer
/// sections are decoded on demand since most responses are only ever
/// checked for their id and flags.
#[derive(Clone)]
pub struct Response {
    bytes: Vec<u8>,
    header: Header,
}

impl Response {
    /// Decode a response from raw bytes. Fails if the buffer is too short
    /// to carry a header.
    pub fn from_vec(bytes: Vec<u8>) -> ResolveResult<Self> {
        let header = Header::read(&mut BinDecoder::new(&bytes))?;
        Ok(Self { bytes, header })
    }

    /// The transaction id
    pub fn id(&self) -> u16 {
        self.header.id()
    }

    /// The decoded header
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Whether the TC bit is set: the answer did not fit the datagram and
    /// the query should be retried over a stream transport
    pub fn truncated(&self) -> bool {
        self.header.truncated()
    }

    /// The response code
    pub fn response_code(&self) -> ResponseCode {
        self.header.response_code()
    }

    /// Number of answer records
    pub fn answer_count(&self) -> u16 {
        self.header.answer_count()
    }

    /// The raw wire-format bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The first entry of the question section, or `None` for an empty one
    pub fn question(&self) -> ResolveResult<Option<Question>> {
        if self.header.query_count() == 0 {
            return Ok(None);
        }

        let mut decoder = BinDecoder::new(&self.bytes);
        decoder.read_slice(Header::len())?;
        Question::read(&mut decoder).map(Some)
    }

    /// Decode the answer section
    pub fn answers(&self) -> ResolveResult<Vec<Record>> {
        let mut decoder = BinDecoder::new(&self.bytes);
        decoder.read_slice(Header::len())?;

        for _ in 0..self.header.query_count() {
            Question::read(&mut decoder)?;
        }

        let mut records = Vec::with_capacity(usize::from(self.header.answer_count()));
        for _ in 0..self.header.answer_count() {
            records.push(Record::read(&mut decoder)?);
        }
        Ok(records)
    }

    /// All A/AAAA addresses in the answer section
    pub fn addresses(&self) -> ResolveResult<Vec<IpAddr>> {
        Ok(self.answers()?.iter().filter_map(Record::address).collect())
    }

    /// Build a response to `query` out of thin air: same transaction id,
    /// question and request flags, the given response code, and an empty
    /// answer section. Used when the answer is known locally and no server
    /// was actually asked.
    pub fn synthesize(query: &Query, response_code: ResponseCode, truncated: bool) -> Self {
        Self::compose(query, response_code, truncated, &[], 0)
    }

    /// Build a positive response to `query` carrying the given addresses as
    /// answer records. Addresses that do not match the query type are
    /// skipped.
    pub fn answer(query: &Query, addresses: &[IpAddr], ttl: u32) -> Self {
        Self::compose(query, ResponseCode::NoError, false, addresses, ttl)
    }

    fn compose(
        query: &Query,
        response_code: ResponseCode,
        truncated: bool,
        addresses: &[IpAddr],
        ttl: u32,
    ) -> Self {
        let query_type = query.question().query_type();
        let answers: Vec<&IpAddr> = addresses
            .iter()
            .filter(|addr| match addr {
                IpAddr::V4(_) => query_type == RecordType::A,
                IpAddr::V6(_) => query_type == RecordType::AAAA,
            })
            .collect();

        let mut bytes = Vec::with_capacity(query.bytes().len() + answers.len() * 16);
        let mut encoder = BinEncoder::new(&mut bytes);

        let mut header = Header::new();
        header
            .set_id(query.id())
            .set_message_type(MessageType::Response)
            .set_recursion_desired(true)
            .set_recursion_available(true)
            .set_truncated(truncated)
            .set_response_code(response_code)
            .set_query_count(1)
            .set_answer_count(answers.len() as u16);
        header.emit(&mut encoder);

        // copy the question section verbatim from the query
        encoder.emit_bytes(&query.bytes()[Header::len()..]);

        for address in answers {
            // the owner is always the question name: emit a pointer to it
            encoder.emit_u16(0xC000 | Header::len() as u16);
            encoder.emit_u16(u16::from(query_type));
            encoder.emit_u16(CLASS_IN);
            encoder.emit_u32(ttl);
            match address {
                IpAddr::V4(v4) => {
                    encoder.emit_u16(4);
                    encoder.emit_bytes(&v4.octets());
                }
                IpAddr::V6(v6) => {
                    encoder.emit_u16(16);
                    encoder.emit_bytes(&v6.octets());
                }
            }
        }

        let header = Header::read(&mut BinDecoder::new(&bytes)).expect("just encoded");
        Self { bytes, header }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("header", &self.header)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// A single decoded resource record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    name: String,
    record_type: RecordType,
    dns_class: u16,
    ttl: u32,
    rdata: Vec<u8>,
}

impl Record {
    /// The owner name of the record
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The type of the record
    pub fn record_type(&self) -> RecordType {
        self.record_type
    }

    /// Time to live in seconds
    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    /// The raw record data
    pub fn rdata(&self) -> &[u8] {
        &self.rdata
    }

    /// The address carried by an A or AAAA record
    pub fn address(&self) -> Option<IpAddr> {
        match (self.record_type, self.rdata.as_slice()) {
            (RecordType::A, &[a, b, c, d]) => Some(IpAddr::V4(Ipv4Addr::new(a, b, c, d))),
            (RecordType::AAAA, rdata) if rdata.len() == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            _ => None,
        }
    }

    fn read(decoder: &mut BinDecoder<'_>) -> ResolveResult<Self> {
        let name = decoder.read_name()?;
        let record_type = RecordType::from(decoder.read_u16()?);
        let dns_class = decoder.read_u16()?;
        let ttl = decoder.read_u32()?;
        let rdlength = decoder.read_u16()?;
        let rdata = decoder.read_slice(usize::from(rdlength))?.to_vec();

        Ok(Self {
            name,
            record_type,
            dns_class,
            ttl,
            rdata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesized_response_matches_query() {
        let query = Query::with_id("myhost.local", RecordType::A, 99).unwrap();
        let response = Response::synthesize(&query, ResponseCode::NoError, false);

        assert_eq!(response.id(), 99);
        assert!(!response.truncated());
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.answer_count(), 0);
        assert!(query.matches(&response));
    }

    #[test]
    fn test_answer_records_decode() {
        let query = Query::with_id("example.com", RecordType::A, 7).unwrap();
        let addresses = [
            IpAddr::V4(Ipv4Addr::new(10, 0, 1, 102)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 1, 103)),
            // filtered out: wrong family for an A query
            IpAddr::V6(Ipv6Addr::LOCALHOST),
        ];
        let response = Response::answer(&query, &addresses, 300);

        assert_eq!(response.answer_count(), 2);
        let records = response.answers().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].name(), "example.com");
        assert_eq!(records[0].ttl(), 300);
        assert_eq!(
            response.addresses().unwrap(),
            vec![
                IpAddr::V4(Ipv4Addr::new(10, 0, 1, 102)),
                IpAddr::V4(Ipv4Addr::new(10, 0, 1, 103)),
            ]
        );
    }

    #[test]
    fn test_aaaa_answer() {
        let query = Query::with_id("example.com", RecordType::AAAA, 8).unwrap();
        let response = Response::answer(&query, &[IpAddr::V6(Ipv6Addr::LOCALHOST)], 60);
        assert_eq!(response.addresses().unwrap(), vec![IpAddr::V6(Ipv6Addr::LOCALHOST)]);
    }

    #[test]
    fn test_short_buffer_is_rejected() {
        assert!(Response::from_vec(vec![0; 4]).is_err());
    }
}
