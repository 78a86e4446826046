//! # Scheduler Node Set
//!
//! Every thread owns one scheduler node per scheduler instance. Two chains
//! of non-owning node references describe how the thread takes part in
//! scheduling:
//!
//! ```text
//!   Wait_nodes       home ──► borrowed ──► borrowed     (priority sources)
//!   Scheduler_nodes  pinned|home ──► helping ──► ...    (where it may run)
//! ```
//!
//! The home node is attached once and never leaves either chain, so neither
//! chain is ever empty. Borrowed wait nodes belong to other threads this
//! thread is helping through resource ownership. Changes that must be
//! applied by the processor owning the thread are queued with
//! [`SchedulerNodeSet::request_change`] and applied by
//! [`SchedulerNodeSet::drain_requests`].

use alloc::vec::Vec;

use crate::chain::IndexList;
use crate::object::id::ObjectId;
use crate::scheduler::{NodeRef, Priority, ProcessorMask, SchedulerNode};

/// Pin level increment of one `pin()`.
pub const PIN_STEP: u32 = 2;
/// Low pin-level bit, set when the thread was preempted while pinned.
pub const PIN_PREEMPTION: u32 = 1;

/// Pending change of a scheduler node's membership in Scheduler_nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRequest {
    NotPending,
    Add,
    Remove,
    /// An add and a remove cancelled each other.
    Nothing,
}

/// Per-thread set of scheduler nodes.
#[derive(Debug)]
pub struct SchedulerNodeSet {
    owner: ObjectId,
    home: usize,
    pinned: Option<usize>,
    /// Whether the pinned node was inserted only for the pinning.
    pinned_inserted: bool,
    pin_level: u32,
    affinity: ProcessorMask,
    /// Processor the thread was last assigned to.
    cpu: Option<usize>,
    nodes: Vec<SchedulerNode>,
    requests: Vec<NodeRequest>,
    pending: Vec<usize>,
    wait_nodes: IndexList<NodeRef>,
    scheduler_nodes: IndexList<NodeRef>,
    helping_nodes: usize,
}

impl SchedulerNodeSet {
    /// One node per scheduler instance, nothing attached yet.
    pub fn new(owner: ObjectId, scheduler_count: usize) -> Self {
        Self {
            owner,
            home: 0,
            pinned: None,
            pinned_inserted: false,
            pin_level: 0,
            affinity: ProcessorMask::empty(),
            cpu: None,
            nodes: (0..scheduler_count).map(|index| SchedulerNode::new(owner, index)).collect(),
            requests: alloc::vec![NodeRequest::NotPending; scheduler_count],
            pending: Vec::new(),
            wait_nodes: IndexList::new(),
            scheduler_nodes: IndexList::new(),
            helping_nodes: 0,
        }
    }

    /// Makes the node of `scheduler` the sole first entry of both chains.
    pub fn attach_home(&mut self, scheduler: usize, priority: Priority, affinity: ProcessorMask) {
        debug_assert!(scheduler < self.nodes.len(), "no such scheduler instance");
        self.home = scheduler;
        self.affinity = affinity;
        let node = &mut self.nodes[scheduler];
        node.set_priority(priority);
        node.set_affinity(affinity);

        self.wait_nodes = IndexList::new();
        self.scheduler_nodes = IndexList::new();
        let home = self.home_ref();
        self.wait_nodes.push_back(home);
        self.scheduler_nodes.push_back(home);
        self.helping_nodes = 0;
    }

    pub fn owner(&self) -> ObjectId {
        self.owner
    }

    pub fn home(&self) -> usize {
        self.home
    }

    pub fn home_ref(&self) -> NodeRef {
        NodeRef {
            thread: self.owner,
            scheduler: self.home,
        }
    }

    pub fn home_node(&self) -> &SchedulerNode {
        &self.nodes[self.home]
    }

    pub fn node(&self, scheduler: usize) -> Option<&SchedulerNode> {
        self.nodes.get(scheduler)
    }

    pub(crate) fn node_mut(&mut self, scheduler: usize) -> Option<&mut SchedulerNode> {
        self.nodes.get_mut(scheduler)
    }

    /// Sets the priority of every own node.
    pub(crate) fn set_priority(&mut self, priority: Priority) {
        for node in self.nodes.iter_mut() {
            node.set_priority(priority);
        }
    }

    pub fn wait_nodes(&self) -> impl Iterator<Item = &NodeRef> {
        self.wait_nodes.iter()
    }

    pub fn scheduler_nodes(&self) -> impl Iterator<Item = &NodeRef> {
        self.scheduler_nodes.iter()
    }

    /// Own nodes currently in Scheduler_nodes.
    pub fn own_scheduler_nodes(&self) -> Vec<SchedulerNode> {
        self.scheduler_nodes
            .iter()
            .filter(|node| node.thread == self.owner)
            .filter_map(|node| self.nodes.get(node.scheduler).cloned())
            .collect()
    }

    pub fn helping_nodes(&self) -> usize {
        self.helping_nodes
    }

    // -- wait nodes -------------------------------------------------------------

    /// Adds the borrowed node of a thread this one helps.
    pub fn add_wait_node(&mut self, node: NodeRef) {
        debug_assert!(node.thread != self.owner, "own nodes are attached, not added");
        self.wait_nodes.push_back(node);
    }

    /// Removes a borrowed node. Returns `false` if it was not present.
    ///
    /// # Panics
    /// The home node stays in Wait_nodes for the life of the thread.
    pub fn remove_wait_node(&mut self, node: NodeRef) -> bool {
        assert!(node != self.home_ref(), "home node removed from wait nodes");
        match self.wait_nodes.find(|entry| *entry == node) {
            Some(handle) => self.wait_nodes.remove(handle).is_some(),
            None => false,
        }
    }

    // -- pinning ----------------------------------------------------------------

    pub fn pinned(&self) -> Option<usize> {
        self.pinned
    }

    /// Pins the thread to a scheduler instance, or releases the pinning.
    pub fn set_pinned(&mut self, scheduler: Option<usize>) {
        if let Some(previous) = self.pinned.take() {
            if self.pinned_inserted {
                let node = NodeRef {
                    thread: self.owner,
                    scheduler: previous,
                };
                if let Some(handle) = self.scheduler_nodes.find(|entry| *entry == node) {
                    self.scheduler_nodes.remove(handle);
                }
            }
            self.pinned_inserted = false;
        }

        let front = match scheduler {
            Some(pinned) => {
                self.pinned = Some(pinned);
                NodeRef {
                    thread: self.owner,
                    scheduler: pinned,
                }
            }
            None => self.home_ref(),
        };
        match self.scheduler_nodes.find(|entry| *entry == front) {
            Some(handle) => {
                self.scheduler_nodes.move_to_front(handle);
            }
            None => {
                self.scheduler_nodes.push_front(front);
                self.pinned_inserted = true;
            }
        }
    }

    pub fn pin_level(&self) -> u32 {
        self.pin_level
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_level != 0
    }

    pub fn pin(&mut self) {
        self.pin_level += PIN_STEP;
    }

    /// Returns `true` when the outermost pinning of a preempted thread ends;
    /// the caller then releases the pinned scheduler.
    pub fn unpin(&mut self) -> bool {
        debug_assert!(self.pin_level >= PIN_STEP, "unpin without pin");
        if self.pin_level == PIN_STEP | PIN_PREEMPTION {
            self.pin_level = 0;
            true
        } else {
            self.pin_level -= PIN_STEP;
            false
        }
    }

    /// Records a preemption while pinned.
    pub fn mark_preempted(&mut self) {
        if self.pin_level != 0 {
            self.pin_level |= PIN_PREEMPTION;
        }
    }

    // -- processors -------------------------------------------------------------

    pub fn affinity(&self) -> ProcessorMask {
        self.affinity
    }

    pub fn set_affinity(&mut self, affinity: ProcessorMask) {
        self.affinity = affinity;
        for node in self.nodes.iter_mut() {
            node.set_affinity(affinity);
        }
    }

    pub fn cpu(&self) -> Option<usize> {
        self.cpu
    }

    pub(crate) fn set_cpu(&mut self, cpu: Option<usize>) {
        self.cpu = cpu;
    }

    // -- requests ---------------------------------------------------------------

    /// Queues an add or remove of the node of `scheduler`. An opposite
    /// pending request cancels out.
    pub fn request_change(&mut self, scheduler: usize, request: NodeRequest) {
        debug_assert!(matches!(request, NodeRequest::Add | NodeRequest::Remove));
        let Some(current) = self.requests.get_mut(scheduler) else {
            return;
        };
        match *current {
            NodeRequest::NotPending => {
                *current = request;
                self.pending.push(scheduler);
            }
            NodeRequest::Nothing => *current = request,
            pending => {
                debug_assert!(pending != request, "duplicate scheduler node request");
                *current = NodeRequest::Nothing;
            }
        }
    }

    pub fn has_pending_requests(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Applies queued requests to Scheduler_nodes and returns them in
    /// request order.
    pub fn drain_requests(&mut self) -> Vec<(usize, NodeRequest)> {
        let pending = core::mem::take(&mut self.pending);
        let mut applied = Vec::with_capacity(pending.len());
        for scheduler in pending {
            let request = core::mem::replace(&mut self.requests[scheduler], NodeRequest::NotPending);
            let node = NodeRef {
                thread: self.owner,
                scheduler,
            };
            match request {
                NodeRequest::Add => {
                    if !self.scheduler_nodes.contains(&node) {
                        self.scheduler_nodes.push_back(node);
                        self.helping_nodes += 1;
                    }
                }
                NodeRequest::Remove => {
                    debug_assert!(scheduler != self.home, "home node removed from scheduler nodes");
                    if scheduler != self.home {
                        if let Some(handle) = self.scheduler_nodes.find(|entry| *entry == node) {
                            self.scheduler_nodes.remove(handle);
                            self.helping_nodes = self.helping_nodes.saturating_sub(1);
                        }
                    }
                }
                NodeRequest::Nothing | NodeRequest::NotPending => {}
            }
            applied.push((scheduler, request));
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(index: u16) -> ObjectId {
        ObjectId::new(2, 1, 1, index)
    }

    fn attached() -> SchedulerNodeSet {
        let mut set = SchedulerNodeSet::new(owner(1), 3);
        set.attach_home(0, 10, ProcessorMask::all(2));
        set
    }

    fn firsts(set: &SchedulerNodeSet) -> (NodeRef, NodeRef) {
        (
            *set.wait_nodes().next().unwrap(),
            *set.scheduler_nodes().next().unwrap(),
        )
    }

    #[test]
    fn test_attach_home() {
        let set = attached();
        let home = set.home_ref();
        assert_eq!(firsts(&set), (home, home));
        assert_eq!(set.home_node().priority(), 10);
        assert_eq!(set.home_node().affinity(), ProcessorMask::all(2));
    }

    #[test]
    fn test_wait_nodes_never_empty() {
        let mut set = attached();
        let borrowed = [
            NodeRef { thread: owner(2), scheduler: 0 },
            NodeRef { thread: owner(3), scheduler: 1 },
        ];
        for node in borrowed {
            set.add_wait_node(node);
            assert!(set.wait_nodes().count() >= 1);
        }
        for node in borrowed {
            assert!(set.remove_wait_node(node));
            assert!(set.wait_nodes().count() >= 1);
            assert!(set.scheduler_nodes().count() >= 1);
        }
        assert_eq!(set.wait_nodes().collect::<Vec<_>>(), vec![&set.home_ref()]);
        assert!(!set.remove_wait_node(borrowed[0]));
    }

    #[test]
    #[should_panic(expected = "home node removed")]
    fn test_remove_home_wait_node_panics() {
        let mut set = attached();
        let home = set.home_ref();
        set.remove_wait_node(home);
    }

    #[test]
    fn test_pinned_scheduler_goes_first() {
        let mut set = attached();
        set.set_pinned(Some(2));
        assert_eq!(set.scheduler_nodes().next().unwrap().scheduler, 2);
        assert_eq!(set.scheduler_nodes().count(), 2);

        set.set_pinned(None);
        assert_eq!(*set.scheduler_nodes().next().unwrap(), set.home_ref());
        assert_eq!(set.scheduler_nodes().count(), 1);
        assert_eq!(set.pinned(), None);
    }

    #[test]
    fn test_pin_levels() {
        let mut set = attached();
        set.pin();
        set.pin();
        assert_eq!(set.pin_level(), 4);
        set.mark_preempted();
        assert_eq!(set.pin_level(), 5);
        assert!(!set.unpin());
        assert_eq!(set.pin_level(), 3);
        assert!(set.unpin());
        assert!(!set.is_pinned());

        set.pin();
        assert!(!set.unpin());
        assert_eq!(set.pin_level(), 0);

        set.mark_preempted();
        assert_eq!(set.pin_level(), 0);
    }

    #[test]
    fn test_requests_cancel_and_drain() {
        let mut set = attached();
        set.request_change(1, NodeRequest::Add);
        set.request_change(1, NodeRequest::Remove);
        set.request_change(2, NodeRequest::Add);
        assert!(set.has_pending_requests());

        let applied = set.drain_requests();
        assert_eq!(applied, vec![(1, NodeRequest::Nothing), (2, NodeRequest::Add)]);
        assert_eq!(set.helping_nodes(), 1);
        assert_eq!(set.scheduler_nodes().count(), 2);
        assert!(!set.has_pending_requests());

        set.request_change(2, NodeRequest::Remove);
        set.drain_requests();
        assert_eq!(set.helping_nodes(), 0);
        assert_eq!(set.scheduler_nodes().collect::<Vec<_>>(), vec![&set.home_ref()]);
    }

    #[test]
    fn test_set_affinity_updates_nodes() {
        let mut set = attached();
        set.set_affinity(ProcessorMask::single(1));
        assert_eq!(set.node(2).unwrap().affinity(), ProcessorMask::single(1));
        assert_eq!(set.affinity(), ProcessorMask::single(1));
    }
}
