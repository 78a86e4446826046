//! # Scheduler Interface
//!
//! The SuperCore never orders threads itself. Every scheduler instance owns
//! a [`SchedulerPolicy`] and a set of processors; the core threads scheduler
//! nodes onto its own chains and calls the policy at state transitions:
//!
//! ```text
//!   thread state change          policy call
//!   ───────────────────          ───────────
//!   blocked ─► ready             ready(node)
//!   ready ─► blocked             block(node)
//!   helping node added           enqueue(node)
//!   helping node removed         extract(node)
//!   priority change              update_priority(node)
//!   yield                        yield_node(node)
//!                  └──► heirs(processors) ──► per-CPU heir
//! ```
//!
//! Heirs are recomputed after every scheduling change and installed into
//! the per-processor records, which dispatch once dispatching is allowed
//! again.

pub mod priority;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cmp::Ordering;
use core::fmt;

use crate::config::MAX_PROCESSORS;
use crate::object::id::ObjectId;
use crate::sync::IsrLock;

/// Thread priority. Lower values are more important.
pub type Priority = u32;

// ---------------------------------------------------------------------------
// Processor sets
// ---------------------------------------------------------------------------

/// Set of processors, one bit per processor index.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessorMask(u32);

impl ProcessorMask {
    pub const fn empty() -> Self {
        ProcessorMask(0)
    }

    /// Processors `0..count`.
    pub const fn all(count: usize) -> Self {
        if count >= MAX_PROCESSORS {
            ProcessorMask(u32::MAX)
        } else {
            ProcessorMask((1u32 << count) - 1)
        }
    }

    pub const fn single(cpu: usize) -> Self {
        ProcessorMask(1 << cpu)
    }

    pub const fn from_bits(bits: u32) -> Self {
        ProcessorMask(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, cpu: usize) -> bool {
        cpu < MAX_PROCESSORS && self.0 & (1 << cpu) != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn intersection(&self, other: ProcessorMask) -> Self {
        ProcessorMask(self.0 & other.0)
    }

    pub const fn without(&self, cpu: usize) -> Self {
        ProcessorMask(self.0 & !(1 << cpu))
    }

    pub const fn with(&self, cpu: usize) -> Self {
        ProcessorMask(self.0 | (1 << cpu))
    }

    pub const fn difference(&self, other: ProcessorMask) -> Self {
        ProcessorMask(self.0 & !other.0)
    }

    pub const fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// Processor indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> {
        let bits = self.0;
        (0..MAX_PROCESSORS).filter(move |cpu| bits & (1 << cpu) != 0)
    }
}

impl fmt::Debug for ProcessorMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessorMask({:#b})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Scheduler nodes
// ---------------------------------------------------------------------------

/// Non-owning reference to the node a thread has in one scheduler
/// instance. Resolved by lookup, never by pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeRef {
    pub thread: ObjectId,
    pub scheduler: usize,
}

/// Scheduling record of one thread in one scheduler instance.
///
/// The contents only mean something to the instance's policy. The core
/// keeps the node's priority and processor set current and hands the node
/// to the policy at state transitions.
#[derive(Debug, Clone)]
pub struct SchedulerNode {
    owner: ObjectId,
    scheduler: usize,
    priority: Priority,
    affinity: ProcessorMask,
}

impl SchedulerNode {
    pub fn new(owner: ObjectId, scheduler: usize) -> Self {
        Self {
            owner,
            scheduler,
            priority: 0,
            affinity: ProcessorMask::empty(),
        }
    }

    pub fn owner(&self) -> ObjectId {
        self.owner
    }

    pub fn scheduler(&self) -> usize {
        self.scheduler
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn affinity(&self) -> ProcessorMask {
        self.affinity
    }

    pub fn node_ref(&self) -> NodeRef {
        NodeRef {
            thread: self.owner,
            scheduler: self.scheduler,
        }
    }

    pub(crate) fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    pub(crate) fn set_affinity(&mut self, affinity: ProcessorMask) {
        self.affinity = affinity;
    }
}

// ---------------------------------------------------------------------------
// Policy interface
// ---------------------------------------------------------------------------

/// Ordering policy of a scheduler instance.
pub trait SchedulerPolicy: Send {
    fn name(&self) -> &'static str;

    /// Least important valid priority.
    fn maximum_priority(&self) -> Priority;

    /// Prepares a node for use by this policy.
    fn node_initialize(&mut self, node: &mut SchedulerNode, priority: Priority);

    /// Offers a node that helps another thread to scheduling decisions.
    fn enqueue(&mut self, node: &SchedulerNode);

    /// Withdraws a helping node.
    fn extract(&mut self, node: &SchedulerNode);

    /// The node's thread became ready.
    fn ready(&mut self, node: &SchedulerNode);

    /// The node's thread blocked.
    fn block(&mut self, node: &SchedulerNode);

    /// The node's priority or processor set changed.
    fn update_priority(&mut self, node: &SchedulerNode);

    /// The node's thread gives up its processor in favour of equally
    /// important threads.
    fn yield_node(&mut self, node: &SchedulerNode);

    fn compare(&self, a: &SchedulerNode, b: &SchedulerNode) -> Ordering;

    /// Selects the thread to execute on each processor of `processors`.
    /// Threads in `taken` already execute elsewhere and must not be chosen.
    fn heirs(&self, processors: ProcessorMask, taken: &[ObjectId]) -> Vec<(usize, Option<ObjectId>)>;
}

/// A scheduler instance: a policy owning a set of processors.
pub struct SchedulerInstance {
    index: usize,
    name: &'static str,
    processors: ProcessorMask,
    policy: IsrLock<Box<dyn SchedulerPolicy>>,
}

impl SchedulerInstance {
    pub fn new(index: usize, name: &'static str, processors: ProcessorMask, policy: Box<dyn SchedulerPolicy>) -> Self {
        Self {
            index,
            name,
            processors,
            policy: IsrLock::new("Scheduler", policy),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn processors(&self) -> ProcessorMask {
        self.processors
    }

    pub fn maximum_priority(&self) -> Priority {
        self.with_policy(|policy| policy.maximum_priority())
    }

    #[inline]
    pub fn with_policy<R>(&self, f: impl FnOnce(&mut dyn SchedulerPolicy) -> R) -> R {
        let mut policy = self.policy.acquire();
        f(policy.as_mut())
    }
}
