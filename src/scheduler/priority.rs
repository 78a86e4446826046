//! # Fixed-Priority Policy
//!
//! Reference [`SchedulerPolicy`]: the most important ready node executes,
//! FIFO among nodes of equal priority, restricted to each node's processor
//! set.
//!
//! ## Heir selection
//!
//! Ready nodes are ranked by `(priority, arrival)`. Walking the ranking,
//! every node takes the lowest free processor of its set. Processors left
//! over execute no thread (idle).

use alloc::vec::Vec;
use core::cmp::Ordering;

use crate::object::id::ObjectId;
use crate::scheduler::{NodeRef, Priority, ProcessorMask, SchedulerNode, SchedulerPolicy};

/// Priority range of the reference policy: `0..=255`.
pub const PRIORITY_MAXIMUM: Priority = 255;

#[derive(Debug, Clone, Copy)]
struct ReadyEntry {
    node: NodeRef,
    priority: Priority,
    affinity: ProcessorMask,
    arrival: u64,
}

/// Fixed-priority FIFO scheduler.
pub struct PriorityScheduler {
    maximum_priority: Priority,
    ready: Vec<ReadyEntry>,
    arrivals: u64,
}

impl PriorityScheduler {
    pub fn new() -> Self {
        Self::with_maximum_priority(PRIORITY_MAXIMUM)
    }

    pub fn with_maximum_priority(maximum_priority: Priority) -> Self {
        Self {
            maximum_priority,
            ready: Vec::new(),
            arrivals: 0,
        }
    }

    /// Number of ready nodes.
    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    fn position(&self, node: &SchedulerNode) -> Option<usize> {
        let key = node.node_ref();
        self.ready.iter().position(|entry| entry.node == key)
    }

    fn next_arrival(&mut self) -> u64 {
        self.arrivals += 1;
        self.arrivals
    }

    fn insert(&mut self, node: &SchedulerNode) {
        let arrival = self.next_arrival();
        match self.position(node) {
            Some(at) => {
                let entry = &mut self.ready[at];
                entry.priority = node.priority();
                entry.affinity = node.affinity();
            }
            None => self.ready.push(ReadyEntry {
                node: node.node_ref(),
                priority: node.priority(),
                affinity: node.affinity(),
                arrival,
            }),
        }
    }

    fn remove(&mut self, node: &SchedulerNode) {
        if let Some(at) = self.position(node) {
            self.ready.remove(at);
        }
    }

    fn ranking(&self) -> Vec<ReadyEntry> {
        let mut ranking = self.ready.clone();
        ranking.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.arrival.cmp(&b.arrival)));
        ranking
    }
}

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerPolicy for PriorityScheduler {
    fn name(&self) -> &'static str {
        "Priority"
    }

    fn maximum_priority(&self) -> Priority {
        self.maximum_priority
    }

    fn node_initialize(&mut self, node: &mut SchedulerNode, priority: Priority) {
        node.set_priority(priority.min(self.maximum_priority));
    }

    fn enqueue(&mut self, node: &SchedulerNode) {
        self.insert(node);
    }

    fn extract(&mut self, node: &SchedulerNode) {
        self.remove(node);
    }

    fn ready(&mut self, node: &SchedulerNode) {
        self.insert(node);
    }

    fn block(&mut self, node: &SchedulerNode) {
        self.remove(node);
    }

    /// A node changing priority goes behind the nodes of its new priority.
    fn update_priority(&mut self, node: &SchedulerNode) {
        if let Some(at) = self.position(node) {
            let arrival = self.next_arrival();
            let entry = &mut self.ready[at];
            if entry.priority != node.priority() {
                entry.arrival = arrival;
            }
            entry.priority = node.priority();
            entry.affinity = node.affinity();
        }
    }

    fn yield_node(&mut self, node: &SchedulerNode) {
        if let Some(at) = self.position(node) {
            let arrival = self.next_arrival();
            self.ready[at].arrival = arrival;
        }
    }

    fn compare(&self, a: &SchedulerNode, b: &SchedulerNode) -> Ordering {
        a.priority().cmp(&b.priority())
    }

    fn heirs(&self, processors: ProcessorMask, taken: &[ObjectId]) -> Vec<(usize, Option<ObjectId>)> {
        let mut free = processors;
        let mut heirs: Vec<(usize, Option<ObjectId>)> = Vec::new();
        let mut chosen: Vec<ObjectId> = Vec::new();

        for entry in self.ranking() {
            if free.is_empty() {
                break;
            }
            let thread = entry.node.thread;
            if taken.contains(&thread) || chosen.contains(&thread) {
                continue;
            }
            if let Some(cpu) = free.intersection(entry.affinity).iter().next() {
                free = free.without(cpu);
                heirs.push((cpu, Some(thread)));
                chosen.push(thread);
            }
        }

        heirs.extend(free.iter().map(|cpu| (cpu, None)));
        heirs.sort_by_key(|(cpu, _)| *cpu);
        heirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(index: u16, priority: Priority, affinity: ProcessorMask) -> SchedulerNode {
        let mut node = SchedulerNode::new(ObjectId::new(2, 1, 1, index), 0);
        node.set_priority(priority);
        node.set_affinity(affinity);
        node
    }

    fn heir_indices(policy: &PriorityScheduler, cpus: usize) -> Vec<Option<u16>> {
        policy
            .heirs(ProcessorMask::all(cpus), &[])
            .into_iter()
            .map(|(_, heir)| heir.map(|id| id.index()))
            .collect()
    }

    #[test]
    fn test_highest_priority_first() {
        let mut policy = PriorityScheduler::new();
        let all = ProcessorMask::all(2);
        policy.ready(&node(1, 10, all));
        policy.ready(&node(2, 5, all));
        policy.ready(&node(3, 20, all));
        assert_eq!(heir_indices(&policy, 1), vec![Some(2)]);
        assert_eq!(heir_indices(&policy, 2), vec![Some(2), Some(1)]);

        policy.ready(&node(4, 1, ProcessorMask::single(1)));
        assert_eq!(heir_indices(&policy, 2), vec![Some(2), Some(4)]);
    }

    #[test]
    fn test_fifo_and_yield() {
        let mut policy = PriorityScheduler::new();
        let all = ProcessorMask::all(1);
        let a = node(1, 7, all);
        let b = node(2, 7, all);
        policy.ready(&a);
        policy.ready(&b);
        assert_eq!(heir_indices(&policy, 1), vec![Some(1)]);

        policy.yield_node(&a);
        assert_eq!(heir_indices(&policy, 1), vec![Some(2)]);
    }

    #[test]
    fn test_block_leaves_idle() {
        let mut policy = PriorityScheduler::new();
        let a = node(1, 7, ProcessorMask::all(2));
        policy.ready(&a);
        assert_eq!(heir_indices(&policy, 2), vec![Some(1), None]);
        policy.block(&a);
        assert_eq!(heir_indices(&policy, 2), vec![None, None]);
        assert_eq!(policy.ready_count(), 0);
    }

    #[test]
    fn test_affinity_is_honored() {
        let mut policy = PriorityScheduler::new();
        policy.ready(&node(1, 1, ProcessorMask::single(1)));
        policy.ready(&node(2, 2, ProcessorMask::all(2)));
        assert_eq!(heir_indices(&policy, 2), vec![Some(2), Some(1)]);

        policy.ready(&node(4, 1, ProcessorMask::single(1)));
        assert_eq!(heir_indices(&policy, 2), vec![Some(2), Some(4)]);
    }

    #[test]
    fn test_update_priority_requeues() {
        let mut policy = PriorityScheduler::new();
        let all = ProcessorMask::all(1);
        let mut a = node(1, 9, all);
        policy.ready(&a);
        policy.ready(&node(2, 4, all));
        assert_eq!(heir_indices(&policy, 1), vec![Some(2)]);

        a.set_priority(1);
        policy.update_priority(&a);
        assert_eq!(heir_indices(&policy, 1), vec![Some(1)]);
    }

    #[test]
    fn test_taken_threads_are_skipped() {
        let mut policy = PriorityScheduler::new();
        let all = ProcessorMask::all(1);
        let a = node(1, 1, all);
        policy.ready(&a);
        policy.ready(&node(2, 2, all));
        let heirs = policy.heirs(all, &[a.owner()]);
        assert_eq!(heirs[0].1.map(|id| id.index()), Some(2));
        assert_eq!(policy.compare(&a, &node(3, 2, all)), Ordering::Less);
    }

    #[test]
    fn test_priority_clamped_on_initialize() {
        let mut policy = PriorityScheduler::with_maximum_priority(31);
        let mut n = SchedulerNode::new(ObjectId::new(2, 1, 1, 1), 0);
        policy.node_initialize(&mut n, 100);
        assert_eq!(n.priority(), 31);
    }
}
