// Copyright 2020-2024 the stub-resolv authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Binary serialization for the RFC 1035 wire format.
//!
//! Only the small subset the resolver core needs: fixed-width integers,
//! raw slices, and domain names (with bounded decompression on read).

use crate::error::{ResolveError, ResolveErrorKind, ResolveResult};

/// Maximum length of a single label on the wire
const MAX_LABEL_LEN: usize = 63;

/// Maximum length of an encoded domain name, including the root byte
const MAX_NAME_LEN: usize = 255;

/// Encodes DNS messages into a caller-supplied buffer
pub struct BinEncoder<'a> {
    buffer: &'a mut Vec<u8>,
}

impl<'a> BinEncoder<'a> {
    /// Creates a new encoder appending to `buffer`
    pub fn new(buffer: &'a mut Vec<u8>) -> Self {
        Self { buffer }
    }

    /// Emit a single byte
    pub fn emit_u8(&mut self, b: u8) {
        self.buffer.push(b);
    }

    /// Emit a u16 in network byte order
    pub fn emit_u16(&mut self, data: u16) {
        self.buffer.extend_from_slice(&data.to_be_bytes());
    }

    /// Emit a u32 in network byte order
    pub fn emit_u32(&mut self, data: u32) {
        self.buffer.extend_from_slice(&data.to_be_bytes());
    }

    /// Emit raw bytes
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Emit a domain name in uncompressed wire format.
    ///
    /// The name is taken in presentation format; a trailing dot is
    /// accepted and the root/empty name encodes as a single zero byte.
    pub fn emit_name(&mut self, name: &str) -> ResolveResult<()> {
        let name = name.strip_suffix('.').unwrap_or(name);
        let mut total = 1; // the terminating root byte

        if !name.is_empty() {
            for label in name.split('.') {
                if label.is_empty() || label.len() > MAX_LABEL_LEN {
                    return Err(ResolveErrorKind::InvalidName(name.to_string()).into());
                }

                total += 1 + label.len();
                if total > MAX_NAME_LEN {
                    return Err(ResolveErrorKind::InvalidName(name.to_string()).into());
                }

                self.emit_u8(label.len() as u8);
                // names compare case-insensitively, emit them lowercased
                self.emit_bytes(label.to_ascii_lowercase().as_bytes());
            }
        }

        self.emit_u8(0);
        Ok(())
    }
}

/// This is non-destructive to the inner buffer: name decompression needs to
/// seek backwards for pointer targets, so the decoder keeps the full slice
/// and an index.
pub struct BinDecoder<'a> {
    buffer: &'a [u8],
    index: usize,
}

impl<'a> BinDecoder<'a> {
    /// Creates a new decoder over `buffer`
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, index: 0 }
    }

    /// Remaining unread bytes
    pub fn len(&self) -> usize {
        self.buffer.len().saturating_sub(self.index)
    }

    /// Returns `true` if all input has been consumed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop one byte from the buffer
    pub fn read_u8(&mut self) -> ResolveResult<u8> {
        if self.index < self.buffer.len() {
            let byte = self.buffer[self.index];
            self.index += 1;
            Ok(byte)
        } else {
            Err(truncated())
        }
    }

    /// Read a u16 in network byte order
    pub fn read_u16(&mut self) -> ResolveResult<u16> {
        let hi = self.read_u8()?;
        let lo = self.read_u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    /// Read a u32 in network byte order
    pub fn read_u32(&mut self) -> ResolveResult<u32> {
        let bytes = self.read_slice(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a slice of `len` bytes
    pub fn read_slice(&mut self, len: usize) -> ResolveResult<&'a [u8]> {
        let end = self
            .index
            .checked_add(len)
            .filter(|&end| end <= self.buffer.len())
            .ok_or_else(truncated)?;
        let slice = &self.buffer[self.index..end];
        self.index = end;
        Ok(slice)
    }

    /// Read a domain name, following compression pointers, and return it in
    /// lowercased presentation format without the trailing dot (the root
    /// name reads as the empty string).
    ///
    /// Pointer chains are bounded so a malicious message cannot loop.
    pub fn read_name(&mut self) -> ResolveResult<String> {
        let mut name = String::new();
        let mut index = self.index;
        // after the first pointer the main index no longer advances
        let mut jumped = false;
        let mut jumps = 0;

        loop {
            let len = *self.buffer.get(index).ok_or_else(truncated)? as usize;

            match len {
                0 => {
                    if !jumped {
                        self.index = index + 1;
                    }
                    return Ok(name);
                }
                // upper two bits set: compression pointer
                len if len & 0xC0 == 0xC0 => {
                    let lo = *self.buffer.get(index + 1).ok_or_else(truncated)? as usize;
                    if !jumped {
                        self.index = index + 2;
                        jumped = true;
                    }

                    jumps += 1;
                    if jumps > 16 {
                        return Err(ResolveErrorKind::Malformed("compression loop").into());
                    }

                    index = (len & 0x3F) << 8 | lo;
                }
                len if len > MAX_LABEL_LEN => {
                    return Err(ResolveErrorKind::Malformed("label too long").into());
                }
                len => {
                    let end = index + 1 + len;
                    let label = self.buffer.get(index + 1..end).ok_or_else(truncated)?;

                    if name.len() + 1 + len > MAX_NAME_LEN {
                        return Err(ResolveErrorKind::Malformed("name too long").into());
                    }
                    if !name.is_empty() {
                        name.push('.');
                    }
                    for &b in label {
                        name.push(b.to_ascii_lowercase() as char);
                    }

                    if !jumped {
                        self.index = end;
                    }
                    index = end;
                }
            }
        }
    }
}

fn truncated() -> ResolveError {
    ResolveErrorKind::Malformed("unexpected end of input").into()
}
