//! # Thread Queues
//!
//! A thread queue is the blocking structure of a synchronization object
//! (mutex, semaphore, message queue, join point, ...). The core keeps the
//! queue heads and lock; the ordering policy is pluggable through
//! [`ThreadQueueOperations`].
//!
//! Queues hold thread identifiers only. A blocked thread refers back to its
//! queue through its wait record.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::object::id::ObjectId;
use crate::scheduler::Priority;
use crate::sync::{IsrLock, IsrLockGuard};
use crate::thread::states::States;

/// A waiting thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub thread: ObjectId,
    pub priority: Priority,
}

/// Waiting threads of one queue, in dequeue order.
#[derive(Debug, Default)]
pub struct QueueHeads {
    entries: VecDeque<QueueEntry>,
}

impl QueueHeads {
    pub const fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, thread: ObjectId) -> bool {
        self.entries.iter().any(|entry| entry.thread == thread)
    }

    pub fn threads(&self) -> Vec<ObjectId> {
        self.entries.iter().map(|entry| entry.thread).collect()
    }

    fn remove(&mut self, thread: ObjectId) -> Option<QueueEntry> {
        let at = self.entries.iter().position(|entry| entry.thread == thread)?;
        self.entries.remove(at)
    }

    /// Inserts behind every entry of equal or higher importance.
    fn insert_by_priority(&mut self, entry: QueueEntry) {
        let at = self
            .entries
            .iter()
            .position(|queued| queued.priority > entry.priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, entry);
    }
}

// ---------------------------------------------------------------------------
// Ordering policies
// ---------------------------------------------------------------------------

/// Ordering policy of a thread queue.
pub trait ThreadQueueOperations: Send + Sync {
    fn name(&self) -> &'static str;

    fn enqueue(&self, heads: &mut QueueHeads, thread: ObjectId, priority: Priority);

    fn extract(&self, heads: &mut QueueHeads, thread: ObjectId) -> bool {
        heads.remove(thread).is_some()
    }

    /// Thread to be woken next.
    fn first(&self, heads: &QueueHeads) -> Option<ObjectId> {
        heads.entries.front().map(|entry| entry.thread)
    }

    /// A queued thread changed priority.
    fn priority_actions(&self, heads: &mut QueueHeads, thread: ObjectId, priority: Priority);
}

/// First come, first served.
pub struct FifoOperations;

impl ThreadQueueOperations for FifoOperations {
    fn name(&self) -> &'static str {
        "FIFO"
    }

    fn enqueue(&self, heads: &mut QueueHeads, thread: ObjectId, priority: Priority) {
        heads.entries.push_back(QueueEntry { thread, priority });
    }

    fn priority_actions(&self, heads: &mut QueueHeads, thread: ObjectId, priority: Priority) {
        if let Some(entry) = heads.entries.iter_mut().find(|entry| entry.thread == thread) {
            entry.priority = priority;
        }
    }
}

/// Most important first, FIFO among equals.
pub struct PriorityOperations;

impl ThreadQueueOperations for PriorityOperations {
    fn name(&self) -> &'static str {
        "Priority"
    }

    fn enqueue(&self, heads: &mut QueueHeads, thread: ObjectId, priority: Priority) {
        heads.insert_by_priority(QueueEntry { thread, priority });
    }

    fn priority_actions(&self, heads: &mut QueueHeads, thread: ObjectId, priority: Priority) {
        if heads.remove(thread).is_some() {
            heads.insert_by_priority(QueueEntry { thread, priority });
        }
    }
}

/// Operations installed while a thread waits on nothing.
pub struct DefaultOperations;

impl ThreadQueueOperations for DefaultOperations {
    fn name(&self) -> &'static str {
        "Default"
    }

    fn enqueue(&self, _heads: &mut QueueHeads, _thread: ObjectId, _priority: Priority) {}

    fn extract(&self, _heads: &mut QueueHeads, _thread: ObjectId) -> bool {
        false
    }

    fn first(&self, _heads: &QueueHeads) -> Option<ObjectId> {
        None
    }

    fn priority_actions(&self, _heads: &mut QueueHeads, _thread: ObjectId, _priority: Priority) {}
}

pub static FIFO: FifoOperations = FifoOperations;
pub static PRIORITY: PriorityOperations = PriorityOperations;
pub static DEFAULT: DefaultOperations = DefaultOperations;

// ---------------------------------------------------------------------------
// Thread queue
// ---------------------------------------------------------------------------

/// Blocking structure of one synchronization object.
pub struct ThreadQueue {
    name: &'static str,
    /// Execution state set on threads blocked here.
    state: States,
    operations: &'static dyn ThreadQueueOperations,
    heads: IsrLock<QueueHeads>,
}

impl ThreadQueue {
    pub fn new(name: &'static str, state: States, operations: &'static dyn ThreadQueueOperations) -> Self {
        debug_assert!(
            States::BLOCKED_ON_OBJECT.contains(state) && !state.is_empty(),
            "thread queue state must be an object wait state"
        );
        Self {
            name,
            state,
            operations,
            heads: IsrLock::new("Thread Queue", QueueHeads::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> States {
        self.state
    }

    pub fn operations(&self) -> &'static dyn ThreadQueueOperations {
        self.operations
    }

    pub(crate) fn acquire(&self) -> IsrLockGuard<'_, QueueHeads> {
        self.heads.acquire()
    }

    pub fn waiters(&self) -> Vec<ObjectId> {
        self.heads.with(|heads| heads.threads())
    }

    pub fn is_empty(&self) -> bool {
        self.heads.with(|heads| heads.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(index: u16) -> ObjectId {
        ObjectId::new(2, 1, 1, index)
    }

    #[test]
    fn test_fifo_order() {
        let mut heads = QueueHeads::new();
        FIFO.enqueue(&mut heads, id(1), 9);
        FIFO.enqueue(&mut heads, id(2), 1);
        assert_eq!(FIFO.first(&heads), Some(id(1)));
        assert!(FIFO.extract(&mut heads, id(1)));
        assert!(!FIFO.extract(&mut heads, id(1)));
        assert_eq!(FIFO.first(&heads), Some(id(2)));
    }

    #[test]
    fn test_priority_order_and_actions() {
        let mut heads = QueueHeads::new();
        PRIORITY.enqueue(&mut heads, id(1), 5);
        PRIORITY.enqueue(&mut heads, id(2), 3);
        PRIORITY.enqueue(&mut heads, id(3), 5);
        assert_eq!(heads.threads(), vec![id(2), id(1), id(3)]);

        PRIORITY.priority_actions(&mut heads, id(3), 1);
        assert_eq!(heads.threads(), vec![id(3), id(2), id(1)]);
    }

    #[test]
    fn test_default_operations_do_nothing() {
        let mut heads = QueueHeads::new();
        DEFAULT.enqueue(&mut heads, id(1), 1);
        assert!(heads.is_empty());
        assert_eq!(DEFAULT.first(&heads), None);
        assert!(!DEFAULT.extract(&mut heads, id(1)));
    }

    #[test]
    fn test_queue_accessors() {
        let queue = ThreadQueue::new("SEM", States::WAITING_FOR_SEMAPHORE, &PRIORITY);
        assert_eq!(queue.name(), "SEM");
        assert_eq!(queue.operations().name(), "Priority");
        assert!(queue.is_empty());
        queue.heads.with(|heads| PRIORITY.enqueue(heads, id(4), 2));
        assert_eq!(queue.waiters(), vec![id(4)]);
    }
}
