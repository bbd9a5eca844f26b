// Copyright 2020-2024 the stub-resolv authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A tick-driven stub DNS resolver.
//!
//! `stub-resolv` multiplexes many concurrent DNS lookups over one shared
//! UDP socket per address family, driven by an external event loop through
//! a narrow [`Reactor`] contract (a ready-to-use mio implementation,
//! [`PollReactor`], is included). The scheduler bounds how many lookups are
//! in flight, retries unanswered queries across the configured nameservers
//! (optionally rotating through them), transparently retries truncated
//! answers over TCP, and answers names listed in `/etc/hosts` locally.
//!
//! Results are pushed to [`Handler`] callbacks in strict event-loop ticks:
//! never synchronously from [`Resolver::query`], never more than a handful
//! per tick, and exactly one terminal callback per lookup.
//!
//! What this crate deliberately does not do: recursive resolution,
//! response caching, DNSSEC validation, or zone transfers. It is the thin,
//! predictable client end of DNS.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![cfg(unix)]

mod config;
mod core;
mod error;
mod hosts;
mod lookup;
mod op;
mod queue;
mod reactor;
mod resolver;
mod serialize;
mod tcp;
mod udp;
mod watcher;

pub use crate::config::{parse_resolv_conf, system_conf, ResolverConfig, ResolverOpts, DEFAULT_PORT};
pub use crate::error::{ResolveError, ResolveErrorKind, ResolveResult};
pub use crate::hosts::Hosts;
pub use crate::lookup::Operation;
pub use crate::op::{Header, MessageType, Query, Question, Record, RecordType, Response, ResponseCode};
pub use crate::reactor::{Interest, Monitor, PollReactor, Reactor, RegistrationId, TimerId};
pub use crate::resolver::{Handler, Resolver};
