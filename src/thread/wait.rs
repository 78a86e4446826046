//! # Wait/Block Control
//!
//! Records which thread queue, if any, currently blocks a thread, the
//! ordering operations of that queue, and the outcome handed back to the
//! thread when someone else unblocks it.
//!
//! ## Wait lock protocol
//!
//! The record is guarded by a default lock. A party that wants to act on a
//! blocked thread (wake-up, timeout, priority change, life change) first
//! registers a *request* under the default lock and takes a snapshot of
//! the queue. It then takes the queue lock and checks whether its request
//! went stale in between:
//!
//! ```text
//!   acquire() ── snapshot queue ──► lock queue heads ──► is_stale()?
//!       │                                                   │
//!       │   restore_default() by someone else ──────────────┘ yes: back off
//!       ▼
//!   release (drop) ── last pending request opens the tranquilizer gate
//! ```
//!
//! `claim` closes the tranquilizer gate. `restore_default` opens it at once
//! when no request is pending, otherwise the release of the last pending
//! request opens it. [`WaitControl::tranquilize`] waits for the gate, so
//! that the wait state is never reused while a request still looks at it.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::error::Status;
use crate::threadq::{ThreadQueue, ThreadQueueOperations, DEFAULT};
use crate::sync::IsrLock;

// ---------------------------------------------------------------------------
// Wait flags
// ---------------------------------------------------------------------------

pub const WAIT_STATE_MASK: u32 = 0x00ff;
/// The thread is about to block but did not commit yet.
pub const WAIT_STATE_INTEND_TO_BLOCK: u32 = 0x0001;
pub const WAIT_STATE_BLOCKED: u32 = 0x0002;
pub const WAIT_STATE_READY: u32 = 0x0000;

pub const WAIT_CLASS_MASK: u32 = 0xff00;
pub const WAIT_CLASS_EVENT: u32 = 0x0100;
pub const WAIT_CLASS_SYSTEM_EVENT: u32 = 0x0200;
pub const WAIT_CLASS_OBJECT: u32 = 0x0400;
pub const WAIT_CLASS_PERIOD: u32 = 0x0800;

// ---------------------------------------------------------------------------
// Wait record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Request { ticket: u64, stale: bool },
    Tranquilizer,
}

struct WaitState {
    queue: Option<Arc<ThreadQueue>>,
    operations: &'static dyn ThreadQueueOperations,
    return_code: Status,
    return_argument: usize,
    pending: VecDeque<Pending>,
    next_ticket: u64,
}

impl WaitState {
    /// Removes a request. The tranquilizer gate opens once it is the first
    /// entry left.
    fn remove_request(&mut self, ticket: u64, gate: &AtomicBool) {
        self.pending
            .retain(|entry| !matches!(entry, Pending::Request { ticket: t, .. } if *t == ticket));
        if self.pending.front() == Some(&Pending::Tranquilizer) {
            self.pending.pop_front();
            gate.store(true, Ordering::Release);
        }
    }
}

/// Per-thread wait record.
pub struct WaitControl {
    flags: AtomicU32,
    /// Tranquilizer gate, open when `true`.
    gate: AtomicBool,
    lock: IsrLock<WaitState>,
}

impl WaitControl {
    pub fn new() -> Self {
        Self {
            flags: AtomicU32::new(WAIT_STATE_READY),
            gate: AtomicBool::new(true),
            lock: IsrLock::new("Thread Wait Default", WaitState {
                queue: None,
                operations: &DEFAULT,
                return_code: Status::Successful,
                return_argument: 0,
                pending: VecDeque::new(),
                next_ticket: 0,
            }),
        }
    }

    /// Queue currently blocking the thread.
    pub fn queue(&self) -> Option<Arc<ThreadQueue>> {
        self.lock.with(|state| state.queue.clone())
    }

    pub fn is_claimed(&self) -> bool {
        self.lock.with(|state| state.queue.is_some())
    }

    pub fn operations(&self) -> &'static dyn ThreadQueueOperations {
        self.lock.with(|state| state.operations)
    }

    /// Records `queue` as the queue blocking the thread.
    ///
    /// # Panics
    /// A thread waits on one queue at a time: claiming a claimed record is a
    /// protocol violation.
    pub fn claim(&self, queue: &Arc<ThreadQueue>, operations: &'static dyn ThreadQueueOperations) {
        let mut state = self.lock.acquire();
        assert!(state.queue.is_none(), "wait record already claimed");
        assert!(state.pending.is_empty(), "claim with pending wait lock requests");
        self.gate.store(false, Ordering::Release);
        state.queue = Some(queue.clone());
        state.operations = operations;
    }

    /// Clears the queue and reinstalls the default operations. Pending
    /// requests become stale.
    pub fn restore_default(&self) {
        let mut state = self.lock.acquire();
        let mut any = false;
        for entry in state.pending.iter_mut() {
            if let Pending::Request { stale, .. } = entry {
                *stale = true;
                any = true;
            }
        }
        if any {
            state.pending.push_back(Pending::Tranquilizer);
        } else {
            self.gate.store(true, Ordering::Release);
        }
        state.queue = None;
        state.operations = &DEFAULT;
    }

    /// Records the outcome returned to the thread once it resumes.
    pub fn set_result(&self, code: Status, argument: usize) {
        self.lock.with(|state| {
            state.return_code = code;
            state.return_argument = argument;
        });
    }

    pub fn result(&self) -> (Status, usize) {
        self.lock.with(|state| (state.return_code, state.return_argument))
    }

    /// Waits until every request that observed the last claim is released.
    ///
    /// Must not be called with any ISR lock held.
    pub fn tranquilize(&self) {
        while !self.gate.load(Ordering::Acquire) {
            spin_loop();
        }
    }

    pub fn is_tranquil(&self) -> bool {
        self.gate.load(Ordering::Acquire)
    }

    pub fn has_pending_requests(&self) -> bool {
        self.lock.with(|state| !state.pending.is_empty())
    }

    /// Registers a request and snapshots the blocking queue.
    ///
    /// No request is registered for a thread that waits on nothing.
    pub fn acquire(&self) -> WaitRequest<'_> {
        let mut state = self.lock.acquire();
        let queue = state.queue.clone();
        let ticket = queue.as_ref().map(|_| {
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.pending.push_back(Pending::Request { ticket, stale: false });
            ticket
        });
        WaitRequest {
            wait: self,
            queue,
            ticket,
        }
    }

    // -- flags ------------------------------------------------------------------

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn set_flags(&self, flags: u32) {
        self.flags.store(flags, Ordering::Release);
    }

    /// Changes the flags from `expected` to `desired`; fails if another
    /// party changed them first.
    pub fn try_change_flags(&self, expected: u32, desired: u32) -> bool {
        self.flags
            .compare_exchange(expected, desired, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for WaitControl {
    fn default() -> Self {
        Self::new()
    }
}

/// A pending request against a wait record. Released on drop.
pub struct WaitRequest<'a> {
    wait: &'a WaitControl,
    queue: Option<Arc<ThreadQueue>>,
    ticket: Option<u64>,
}

impl WaitRequest<'_> {
    /// Queue observed when the request was registered.
    pub fn queue(&self) -> Option<&Arc<ThreadQueue>> {
        self.queue.as_ref()
    }

    /// The thread left the observed queue after the request was made.
    pub fn is_stale(&self) -> bool {
        match self.ticket {
            None => false,
            Some(ticket) => self.wait.lock.with(|state| {
                state.pending.iter().any(|entry| {
                    matches!(entry, Pending::Request { ticket: t, stale: true } if *t == ticket)
                })
            }),
        }
    }
}

impl Drop for WaitRequest<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket {
            let gate = &self.wait.gate;
            self.wait.lock.with(|state| state.remove_request(ticket, gate));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::states::States;
    use crate::threadq::FIFO;
    use std::sync::atomic::AtomicBool as StdFlag;
    use std::thread;

    fn queue() -> Arc<ThreadQueue> {
        Arc::new(ThreadQueue::new("Q", States::WAITING_FOR_SEMAPHORE, &FIFO))
    }

    #[test]
    fn test_claim_and_restore() {
        let wait = WaitControl::new();
        let q = queue();
        assert!(wait.is_tranquil());

        wait.claim(&q, &FIFO);
        assert!(wait.is_claimed());
        assert!(!wait.is_tranquil());
        assert_eq!(wait.operations().name(), "FIFO");

        wait.set_result(Status::Timeout, 3);
        wait.restore_default();
        assert!(wait.queue().is_none());
        assert!(wait.is_tranquil());
        assert_eq!(wait.operations().name(), "Default");
        assert_eq!(wait.result(), (Status::Timeout, 3));
    }

    #[test]
    #[should_panic(expected = "already claimed")]
    fn test_double_claim_panics() {
        let wait = WaitControl::new();
        let q = queue();
        wait.claim(&q, &FIFO);
        wait.claim(&q, &FIFO);
    }

    #[test]
    fn test_request_goes_stale_and_opens_gate() {
        let wait = WaitControl::new();
        let q = queue();
        wait.claim(&q, &FIFO);

        let request = wait.acquire();
        assert!(Arc::ptr_eq(request.queue().unwrap(), &q));
        assert!(!request.is_stale());

        wait.restore_default();
        assert!(request.is_stale());
        assert!(!wait.is_tranquil());

        drop(request);
        assert!(wait.is_tranquil());
        assert!(!wait.has_pending_requests());
    }

    #[test]
    fn test_request_on_unclaimed_record() {
        let wait = WaitControl::new();
        let request = wait.acquire();
        assert!(request.queue().is_none());
        assert!(!request.is_stale());
        assert!(!wait.has_pending_requests());
    }

    #[test]
    fn test_tranquilize_waits_for_requests() {
        let wait = WaitControl::new();
        let q = queue();
        wait.claim(&q, &FIFO);
        let request = wait.acquire();
        wait.restore_default();

        let done = StdFlag::new(false);
        thread::scope(|scope| {
            scope.spawn(|| {
                wait.tranquilize();
                done.store(true, Ordering::SeqCst);
            });
            thread::sleep(std::time::Duration::from_millis(20));
            assert!(!done.load(Ordering::SeqCst));
            drop(request);
        });
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_flags_try_change() {
        let wait = WaitControl::new();
        wait.set_flags(WAIT_CLASS_OBJECT | WAIT_STATE_INTEND_TO_BLOCK);
        assert!(wait.try_change_flags(
            WAIT_CLASS_OBJECT | WAIT_STATE_INTEND_TO_BLOCK,
            WAIT_CLASS_OBJECT | WAIT_STATE_BLOCKED
        ));
        assert!(!wait.try_change_flags(
            WAIT_CLASS_OBJECT | WAIT_STATE_INTEND_TO_BLOCK,
            WAIT_STATE_READY
        ));
        assert_eq!(wait.flags() & WAIT_STATE_MASK, WAIT_STATE_BLOCKED);
        assert_eq!(wait.flags() & WAIT_CLASS_MASK, WAIT_CLASS_OBJECT);
    }
}
