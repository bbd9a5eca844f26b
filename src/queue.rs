// Copyright 2020-2024 the stub-resolv authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An insertion-ordered queue of lookups with O(1) removal of interior
//! elements.
//!
//! Responses and timeouts arrive out of order, so the scheduler constantly
//! removes lookups from the middle of its queues. Each pushed lookup gets
//! its position stamped back onto it; removal goes straight to that slot.
//! Slots live in an arena with a free list, linked as a doubly-linked list.

use std::cell::Cell;
use std::rc::Rc;

use crate::lookup::Lookup;

const NIL: usize = usize::MAX;

/// Which scheduler queue a position belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum QueueTag {
    Scheduled,
    Inflight,
    Ready,
}

/// A stable handle to a queued lookup: the queue it is in and its slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Position {
    pub(crate) tag: QueueTag,
    slot: usize,
}

struct Slot {
    item: Option<Rc<Lookup>>,
    prev: usize,
    next: usize,
}

pub(crate) struct Queue {
    tag: QueueTag,
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    len: usize,
}

impl Queue {
    pub(crate) fn new(tag: QueueTag) -> Self {
        Self {
            tag,
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The oldest element
    pub(crate) fn front(&self) -> Option<&Rc<Lookup>> {
        if self.head == NIL {
            return None;
        }
        self.slots[self.head].item.as_ref()
    }

    /// Append `item` and stamp its position
    pub(crate) fn push(&mut self, item: Rc<Lookup>) {
        let position = Position {
            tag: self.tag,
            slot: self.free.pop().unwrap_or_else(|| {
                self.slots.push(Slot {
                    item: None,
                    prev: NIL,
                    next: NIL,
                });
                self.slots.len() - 1
            }),
        };
        item.set_position(Some(position));

        let slot = position.slot;
        self.slots[slot] = Slot {
            item: Some(item),
            prev: self.tail,
            next: NIL,
        };
        if self.tail != NIL {
            self.slots[self.tail].next = slot;
        } else {
            self.head = slot;
        }
        self.tail = slot;
        self.len += 1;
    }

    /// Remove and return the oldest element
    pub(crate) fn pop_front(&mut self) -> Option<Rc<Lookup>> {
        if self.head == NIL {
            return None;
        }
        Some(self.unlink(self.head))
    }

    /// Remove `item` through its stamped position, in O(1).
    ///
    /// Returns whether the item was at the front. The position must name
    /// this queue; membership is the caller's invariant.
    pub(crate) fn remove(&mut self, item: &Rc<Lookup>) -> bool {
        let position = item.position().expect("lookup is not queued");
        assert_eq!(position.tag, self.tag, "lookup queued elsewhere");

        let was_front = position.slot == self.head;
        self.unlink(position.slot);
        was_front
    }

    fn unlink(&mut self, slot: usize) -> Rc<Lookup> {
        let (prev, next) = (self.slots[slot].prev, self.slots[slot].next);
        match prev {
            NIL => self.head = next,
            prev => self.slots[prev].next = next,
        }
        match next {
            NIL => self.tail = prev,
            next => self.slots[next].prev = prev,
        }

        let item = self.slots[slot].item.take().expect("slot is vacant");
        self.free.push(slot);
        self.len -= 1;

        item.set_position(None);
        item
    }
}

/// Shared position cell, kept outside the lookup's state so queue surgery
/// never contends with a state borrow.
#[derive(Default)]
pub(crate) struct PositionCell(Cell<Option<Position>>);

impl PositionCell {
    pub(crate) fn get(&self) -> Option<Position> {
        self.0.get()
    }

    pub(crate) fn set(&self, position: Option<Position>) {
        self.0.set(position);
    }
}
