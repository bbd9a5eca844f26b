// Copyright 2020-2024 the stub-resolv authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The event-loop seam.
//!
//! The resolver core never polls by itself: it registers file descriptors
//! and timers with a [`Reactor`] and is driven back through [`Monitor`]
//! callbacks. The crate ships [`PollReactor`], a single-threaded mio-based
//! implementation, but any loop that honors this contract can drive the
//! resolver.

mod poll;

use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

pub use self::poll::PollReactor;

/// Readiness events a registration is interested in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interest {
    /// The descriptor became readable
    Readable,
    /// The descriptor became writable
    Writable,
    /// Either direction
    ReadWrite,
}

/// Identifies a file-descriptor registration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RegistrationId(pub(crate) u64);

/// Identifies an armed timer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

/// The object notified when a watched event happens.
///
/// Monitors are registered as `Rc<dyn Monitor>`; implementations hold weak
/// back-references into the resolver so a registration left behind in the
/// loop never keeps resolver state alive.
pub trait Monitor {
    /// Activity happened on the watched file descriptor
    fn notify(&self) {}

    /// The watched timer expired
    fn expire(&self) {}
}

/// A single-threaded event loop the resolver can be driven by.
///
/// All methods take `&self`: they are invoked re-entrantly from inside
/// monitor callbacks, so implementations use interior mutability and must
/// not hold internal borrows while dispatching.
pub trait Reactor {
    /// Watch a file descriptor; `monitor.notify()` fires on activity.
    ///
    /// The caller keeps ownership of the descriptor and must call
    /// [`Reactor::remove`] before closing it.
    fn add(&self, fd: RawFd, interest: Interest, monitor: Rc<dyn Monitor>)
        -> io::Result<RegistrationId>;

    /// Stop watching a previously added file descriptor
    fn remove(&self, id: RegistrationId, fd: RawFd) -> io::Result<()>;

    /// Arm a one-shot timer; `monitor.expire()` fires after `delay`
    fn timer(&self, delay: Duration, monitor: Rc<dyn Monitor>) -> TimerId;

    /// Disarm a timer; firing and cancelling race benignly (a cancelled
    /// timer never dispatches)
    fn cancel(&self, id: TimerId);
}
