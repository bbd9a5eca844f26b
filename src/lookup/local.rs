// Copyright 2020-2024 the stub-resolv authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A lookup answered from the local hosts database.
//!
//! Nothing goes on the wire, but the answer is still delivered from inside
//! a scheduler tick rather than synchronously from `query()`: user code
//! observes one uniform contract for every lookup.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Instant;

use crate::core::Core;
use crate::lookup::Lookup;
use crate::op::{Query, Response, ResponseCode};
use crate::resolver::Handler;

pub(crate) struct LocalLookup {
    core: Weak<RefCell<Core>>,
    query: Query,
    handler: Option<Rc<dyn Handler>>,
    /// set once the outcome is decided (delivered or cancelled)
    ready: bool,
    timestamp: Option<Instant>,
    self_ref: Weak<Lookup>,
}

impl LocalLookup {
    pub(crate) fn new(
        core: Weak<RefCell<Core>>,
        query: Query,
        handler: Rc<dyn Handler>,
        self_ref: Weak<Lookup>,
    ) -> Self {
        Self {
            core,
            query,
            handler: Some(handler),
            ready: false,
            timestamp: None,
            self_ref,
        }
    }

    pub(crate) fn query(&self) -> &Query {
        &self.query
    }

    /// One nominal credit before execution so the scheduler never treats a
    /// waiting local lookup as exhausted; zero afterwards so it is released
    /// instead of being re-scheduled.
    pub(crate) fn credits(&self) -> usize {
        if self.ready {
            0
        } else {
            1
        }
    }

    pub(crate) fn timestamp(&self) -> Option<Instant> {
        self.timestamp
    }

    /// Compose the answer from the hosts database. Always returns `false`:
    /// there is nothing to wait for.
    pub(crate) fn execute(&mut self, now: Instant) -> (bool, Option<(Rc<dyn Handler>, Response)>) {
        if self.ready {
            return (false, None);
        }
        self.timestamp = Some(now);
        self.ready = true;

        let Some(handler) = self.handler.take() else {
            return (false, None);
        };
        let response = match self.core.upgrade() {
            Some(core) => {
                let response = core.borrow().hosts().compose(&self.query);
                response
            }
            // resolver went away under us; answer with a server failure
            None => Response::synthesize(&self.query, ResponseCode::ServFail, false),
        };

        (false, Some((handler, response)))
    }

    pub(crate) fn cancel(&mut self) -> Option<Rc<dyn Handler>> {
        let handler = self.handler.take()?;
        self.ready = true;

        // hand the lookup to the release queue so it is never executed
        if let (Some(core), Some(lookup)) = (self.core.upgrade(), self.self_ref.upgrade()) {
            core.borrow_mut().done(&lookup);
        }
        Some(handler)
    }
}
