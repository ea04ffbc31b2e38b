// Bitmask event signals shared between a control API and its worker thread

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::{Duration, Instant};

/// A set of named event bits
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Events(u32);

impl Events {
    pub const NONE: Events = Events(0);
    pub const ALL: Events = Events(u32::MAX);

    /// Single event at bit position `n`
    pub const fn bit(n: u32) -> Self {
        Events(1 << n)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Events) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn intersects(self, other: Events) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn intersection(self, other: Events) -> Events {
        Events(self.0 & other.0)
    }

    pub const fn difference(self, other: Events) -> Events {
        Events(self.0 & !other.0)
    }
}

impl BitOr for Events {
    type Output = Events;

    fn bitor(self, rhs: Events) -> Events {
        Events(self.0 | rhs.0)
    }
}

impl BitOrAssign for Events {
    fn bitor_assign(&mut self, rhs: Events) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Events({:#x})", self.0)
    }
}

/// Condition variable plus a bitset.
///
/// `signal` sets bits and wakes every waiter. `wait` returns the subset of
/// the mask that fired and consumes it; `watch` returns it without
/// consuming, so a worker can sleep on a stop request and still observe it
/// at the top of its loop.
pub struct EventGroup {
    bits: Mutex<Events>,
    cond: Condvar,
}

impl EventGroup {
    pub fn new() -> Self {
        Self {
            bits: Mutex::new(Events::NONE),
            cond: Condvar::new(),
        }
    }

    pub fn signal(&self, events: Events) {
        let mut bits = self.bits.lock();
        *bits |= events;
        self.cond.notify_all();
    }

    pub fn clear(&self, events: Events) {
        let mut bits = self.bits.lock();
        *bits = bits.difference(events);
    }

    pub fn peek(&self) -> Events {
        *self.bits.lock()
    }

    /// Block until any bit in `mask` is set, or `timeout` passes.
    /// `None` waits forever. The returned bits are cleared.
    pub fn wait(&self, mask: Events, timeout: Option<Duration>) -> Events {
        self.wait_inner(mask, timeout, true)
    }

    /// Like [`EventGroup::wait`] but leaves the bits set.
    pub fn watch(&self, mask: Events, timeout: Option<Duration>) -> Events {
        self.wait_inner(mask, timeout, false)
    }

    fn wait_inner(&self, mask: Events, timeout: Option<Duration>, consume: bool) -> Events {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut bits = self.bits.lock();
        loop {
            let hit = bits.intersection(mask);
            if !hit.is_empty() {
                if consume {
                    *bits = bits.difference(hit);
                }
                return hit;
            }
            match deadline {
                None => self.cond.wait(&mut bits),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Events::NONE;
                    }
                    self.cond.wait_for(&mut bits, deadline - now);
                }
            }
        }
    }
}

impl Default for EventGroup {
    fn default() -> Self {
        Self::new()
    }
}
