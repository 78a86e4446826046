//! Hosted port.
//!
//! Switches nothing. Every primitive call is appended to an event log that
//! callers inspect, and the "current processor" is whatever was last set
//! with [`HostPort::set_current`], so one host thread can act as any
//! simulated processor.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::CpuPort;
use crate::object::ObjectId;
use crate::sync::IsrLock;
use crate::thread::{Context, StackArea};

/// A recorded port call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    Initialize(ObjectId),
    Save { cpu: usize, thread: ObjectId },
    Restore { cpu: usize, thread: Option<ObjectId> },
    Dispatch(usize),
}

pub struct HostPort {
    current: AtomicUsize,
    events: IsrLock<Vec<PortEvent>>,
}

impl HostPort {
    pub const fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            events: IsrLock::new("Host Port", Vec::new()),
        }
    }

    /// Makes the calling context act as processor `cpu`.
    pub fn set_current(&self, cpu: usize) {
        self.current.store(cpu, Ordering::Release);
    }

    pub fn events(&self) -> Vec<PortEvent> {
        self.events.with(|events| events.clone())
    }

    /// Takes the recorded events, leaving the log empty.
    pub fn take_events(&self) -> Vec<PortEvent> {
        self.events.with(core::mem::take)
    }

    /// Threads switched to on `cpu`, in order.
    pub fn switches(&self, cpu: usize) -> Vec<Option<ObjectId>> {
        self.events.with(|events| {
            events
                .iter()
                .filter_map(|event| match *event {
                    PortEvent::Restore { cpu: on, thread } if on == cpu => Some(thread),
                    _ => None,
                })
                .collect()
        })
    }

    fn record(&self, event: PortEvent) {
        self.events.with(|events| events.push(event));
    }
}

impl Default for HostPort {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuPort for HostPort {
    fn current_processor(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    fn initialize_context(&self, thread: ObjectId, context: &Context, stack: &StackArea, _is_fp: bool) {
        context.set_stack_pointer(stack.top());
        self.record(PortEvent::Initialize(thread));
    }

    fn save_context(&self, cpu: usize, thread: ObjectId, _context: &Context) {
        self.record(PortEvent::Save { cpu, thread });
    }

    fn restore_context(&self, cpu: usize, thread: Option<ObjectId>, _context: Option<&Context>) {
        self.record(PortEvent::Restore { cpu, thread });
    }

    fn request_dispatch(&self, cpu: usize) {
        self.record(PortEvent::Dispatch(cpu));
    }
}
