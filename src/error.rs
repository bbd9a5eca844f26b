// Copyright 2020-2024 the stub-resolv authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Error types for the crate

use std::{fmt, io};

use thiserror::Error;

/// An alias for results returned by functions of this crate
pub type ResolveResult<T> = Result<T, ResolveError>;

/// The error kind for errors that get returned in the crate
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ResolveErrorKind {
    /// An error with an arbitrary message, referenced as &'static str
    #[error("{0}")]
    Message(&'static str),

    /// An error with an arbitrary message, stored as String
    #[error("{0}")]
    Msg(String),

    /// A domain name could not be encoded into wire format
    #[error("invalid domain name: {0}")]
    InvalidName(String),

    /// A DNS message could not be decoded
    #[error("malformed message: {0}")]
    Malformed(&'static str),

    /// The resolver configuration could not be parsed
    #[error("error parsing resolver configuration: {0}")]
    Config(String),

    /// An underlying IO error occurred
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// The error type for errors that get returned in the crate
#[derive(Debug, Error)]
pub struct ResolveError {
    kind: ResolveErrorKind,
}

impl ResolveError {
    /// Get the kind of the error
    pub fn kind(&self) -> &ResolveErrorKind {
        &self.kind
    }

    /// Take the kind of the error
    pub fn into_kind(self) -> ResolveErrorKind {
        self.kind
    }
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl From<ResolveErrorKind> for ResolveError {
    fn from(kind: ResolveErrorKind) -> Self {
        Self { kind }
    }
}

impl From<&'static str> for ResolveError {
    fn from(msg: &'static str) -> Self {
        ResolveErrorKind::Message(msg).into()
    }
}

impl From<String> for ResolveError {
    fn from(msg: String) -> Self {
        ResolveErrorKind::Msg(msg).into()
    }
}

impl From<io::Error> for ResolveError {
    fn from(e: io::Error) -> Self {
        ResolveErrorKind::from(e).into()
    }
}
