// Copyright 2020-2024 the stub-resolv authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Message metadata

use std::fmt;

use crate::error::ResolveResult;
use crate::op::ResponseCode;
use crate::serialize::{BinDecoder, BinEncoder};

/// Metadata for a DNS message.
///
/// [RFC 1035, DOMAIN NAMES - IMPLEMENTATION AND SPECIFICATION, November 1987](https://tools.ietf.org/html/rfc1035)
///
/// ```text
/// 4.1.1. Header section format
///
///                                    1  1  1  1  1  1
///      0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                      ID                       |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    QDCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    ANCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    NSCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                    ARCOUNT                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    id: u16,
    message_type: MessageType,
    op_code: u8,
    authoritative: bool,
    truncated: bool,
    recursion_desired: bool,
    recursion_available: bool,
    response_code: ResponseCode,
    query_count: u16,
    answer_count: u16,
    name_server_count: u16,
    additional_count: u16,
}

/// Message types are either Query or Response
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    /// Queries are client requests
    Query,
    /// Response message from the server
    Response,
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

impl Header {
    /// A new header for a standard query with all flags and counts cleared
    pub fn new() -> Self {
        Self {
            id: 0,
            message_type: MessageType::Query,
            op_code: 0,
            authoritative: false,
            truncated: false,
            recursion_desired: false,
            recursion_available: false,
            response_code: ResponseCode::NoError,
            query_count: 0,
            answer_count: 0,
            name_server_count: 0,
            additional_count: 0,
        }
    }

    /// Length of the header, always 12 bytes
    pub const fn len() -> usize {
        12
    }

    /// Transaction id of the message
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Whether this is a query or a response
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// The raw opcode of the message
    pub fn op_code(&self) -> u8 {
        self.op_code
    }

    /// The TC bit: the message was cut off by the transport and should be
    /// retried over a stream connection
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// The RD bit
    pub fn recursion_desired(&self) -> bool {
        self.recursion_desired
    }

    /// The RA bit
    pub fn recursion_available(&self) -> bool {
        self.recursion_available
    }

    /// Response code of the message
    pub fn response_code(&self) -> ResponseCode {
        self.response_code
    }

    /// Number of entries in the question section
    pub fn query_count(&self) -> u16 {
        self.query_count
    }

    /// Number of entries in the answer section
    pub fn answer_count(&self) -> u16 {
        self.answer_count
    }

    /// Set the transaction id
    pub fn set_id(&mut self, id: u16) -> &mut Self {
        self.id = id;
        self
    }

    /// Set the QR bit
    pub fn set_message_type(&mut self, message_type: MessageType) -> &mut Self {
        self.message_type = message_type;
        self
    }

    /// Set the TC bit
    pub fn set_truncated(&mut self, truncated: bool) -> &mut Self {
        self.truncated = truncated;
        self
    }

    /// Set the RD bit
    pub fn set_recursion_desired(&mut self, rd: bool) -> &mut Self {
        self.recursion_desired = rd;
        self
    }

    /// Set the RA bit
    pub fn set_recursion_available(&mut self, ra: bool) -> &mut Self {
        self.recursion_available = ra;
        self
    }

    /// Set the response code
    pub fn set_response_code(&mut self, response_code: ResponseCode) -> &mut Self {
        self.response_code = response_code;
        self
    }

    /// Set the number of question entries
    pub fn set_query_count(&mut self, count: u16) -> &mut Self {
        self.query_count = count;
        self
    }

    /// Set the number of answer records
    pub fn set_answer_count(&mut self, count: u16) -> &mut Self {
        self.answer_count = count;
        self
    }

    /// Write the header to the encoder
    pub fn emit(&self, encoder: &mut BinEncoder<'_>) {
        encoder.emit_u16(self.id);

        let mut flags = 0u16;
        if let MessageType::Response = self.message_type {
            flags |= 0x8000;
        }
        flags |= u16::from(self.op_code & 0x0F) << 11;
        if self.authoritative {
            flags |= 0x0400;
        }
        if self.truncated {
            flags |= 0x0200;
        }
        if self.recursion_desired {
            flags |= 0x0100;
        }
        if self.recursion_available {
            flags |= 0x0080;
        }
        flags |= u16::from(u8::from(self.response_code)) & 0x000F;
        encoder.emit_u16(flags);

        encoder.emit_u16(self.query_count);
        encoder.emit_u16(self.answer_count);
        encoder.emit_u16(self.name_server_count);
        encoder.emit_u16(self.additional_count);
    }

    /// Read a header from the decoder
    pub fn read(decoder: &mut BinDecoder<'_>) -> ResolveResult<Self> {
        let id = decoder.read_u16()?;
        let flags = decoder.read_u16()?;

        Ok(Self {
            id,
            message_type: if flags & 0x8000 != 0 {
                MessageType::Response
            } else {
                MessageType::Query
            },
            op_code: ((flags >> 11) & 0x0F) as u8,
            authoritative: flags & 0x0400 != 0,
            truncated: flags & 0x0200 != 0,
            recursion_desired: flags & 0x0100 != 0,
            recursion_available: flags & 0x0080 != 0,
            response_code: ResponseCode::from((flags & 0x000F) as u8),
            query_count: decoder.read_u16()?,
            answer_count: decoder.read_u16()?,
            name_server_count: decoder.read_u16()?,
            additional_count: decoder.read_u16()?,
        })
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{id}:{message_type:?}:{code:?}:{answers}",
            id = self.id,
            message_type = self.message_type,
            code = self.response_code,
            answers = self.answer_count,
        )
    }
}
