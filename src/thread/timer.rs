//! # Thread Timers
//!
//! Timeouts of blocked threads and delays of sleeping threads. The system
//! keeps one ordered watchdog set keyed by expiration tick; each thread
//! remembers the deadline it armed so the entry can be removed again.
//!
//! ```text
//!   clock tick ──► ticks += 1 ──► pop entries with deadline <= ticks
//!                                        │
//!                                        ▼
//!                        timeout path races the normal wake-up
//! ```

use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::object::id::ObjectId;
use crate::sync::IsrLock;

/// Number of ticks to wait. Zero means "forever" for blocking calls.
pub type Interval = u32;

/// Wait forever.
pub const NO_TIMEOUT: Interval = 0;

/// Timer record of one thread.
pub struct TimerControl {
    deadline: IsrLock<Option<u64>>,
}

impl TimerControl {
    pub const fn new() -> Self {
        Self {
            deadline: IsrLock::new("Thread Timer", None),
        }
    }

    pub fn deadline(&self) -> Option<u64> {
        self.deadline.with(|deadline| *deadline)
    }

    pub fn is_armed(&self) -> bool {
        self.deadline().is_some()
    }
}

impl Default for TimerControl {
    fn default() -> Self {
        Self::new()
    }
}

/// System watchdog set.
pub struct Watchdogs {
    ticks: AtomicU64,
    set: IsrLock<BTreeSet<(u64, ObjectId)>>,
}

impl Watchdogs {
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            set: IsrLock::new("Watchdogs", BTreeSet::new()),
        }
    }

    /// Ticks since the system started.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Arms `timer` to expire `interval` ticks from now. Re-arming replaces
    /// the previous deadline.
    pub fn insert(&self, timer: &TimerControl, thread: ObjectId, interval: Interval) {
        let deadline = self.ticks() + u64::from(interval.max(1));
        let mut armed = timer.deadline.acquire();
        let mut set = self.set.acquire();
        if let Some(previous) = armed.replace(deadline) {
            set.remove(&(previous, thread));
        }
        set.insert((deadline, thread));
    }

    /// Disarms `timer`. Returns `false` if it was not armed, which includes
    /// the case of a timer that already fired.
    pub fn remove(&self, timer: &TimerControl, thread: ObjectId) -> bool {
        let mut armed = timer.deadline.acquire();
        match armed.take() {
            Some(deadline) => {
                self.set.with(|set| set.remove(&(deadline, thread)));
                true
            }
            None => false,
        }
    }

    /// Advances time by one tick and returns the threads whose timer
    /// expired, earliest first. Their records still hold the deadline until
    /// [`Watchdogs::fire`] claims them.
    pub fn tick(&self) -> Vec<(u64, ObjectId)> {
        let now = self.ticks.fetch_add(1, Ordering::AcqRel) + 1;
        let mut set = self.set.acquire();
        let mut expired = Vec::new();
        while let Some(&(deadline, thread)) = set.first() {
            if deadline > now {
                break;
            }
            set.pop_first();
            expired.push((deadline, thread));
        }
        expired
    }

    /// Claims an expired timer. Fails when the timer was removed or re-armed
    /// after the tick collected it.
    pub fn fire(&self, timer: &TimerControl, deadline: u64) -> bool {
        let mut armed = timer.deadline.acquire();
        if *armed == Some(deadline) {
            *armed = None;
            true
        } else {
            false
        }
    }

    pub fn armed_count(&self) -> usize {
        self.set.with(|set| set.len())
    }
}

impl Default for Watchdogs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(index: u16) -> ObjectId {
        ObjectId::new(2, 1, 1, index)
    }

    #[test]
    fn test_expiry_order() {
        let dogs = Watchdogs::new();
        let (a, b) = (TimerControl::new(), TimerControl::new());
        dogs.insert(&a, id(1), 2);
        dogs.insert(&b, id(2), 1);

        let first = dogs.tick();
        assert_eq!(first, vec![(1, id(2))]);
        assert!(dogs.fire(&b, 1));
        assert!(!b.is_armed());

        let second = dogs.tick();
        assert_eq!(second, vec![(2, id(1))]);
        assert!(dogs.fire(&a, 2));
        assert_eq!(dogs.armed_count(), 0);
    }

    #[test]
    fn test_remove_and_rearm() {
        let dogs = Watchdogs::new();
        let timer = TimerControl::new();
        dogs.insert(&timer, id(1), 5);
        dogs.insert(&timer, id(1), 1);
        assert_eq!(dogs.armed_count(), 1);
        assert_eq!(timer.deadline(), Some(1));

        assert!(dogs.remove(&timer, id(1)));
        assert!(!dogs.remove(&timer, id(1)));
        assert!(dogs.tick().is_empty());
    }

    #[test]
    fn test_fire_after_remove_fails() {
        let dogs = Watchdogs::new();
        let timer = TimerControl::new();
        dogs.insert(&timer, id(3), 1);
        let expired = dogs.tick();
        assert!(dogs.remove(&timer, id(3)));
        assert!(!dogs.fire(&timer, expired[0].0));
    }
}
