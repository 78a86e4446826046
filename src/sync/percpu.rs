//! # Per-Processor Control
//!
//! Every processor owns a dispatch-disable level, a dispatch-necessary flag
//! and the identifiers of its executing thread and of its heir (the thread
//! selected to execute next).
//!
//! ```text
//!     ┌──────── dispatch_disable_level > 0 ────────┐
//!     │  heir changes only set dispatch_necessary   │
//!     └──────────────┬──────────────────────────────┘
//!                    │ last DispatchDisableGuard dropped
//!                    ▼
//!          ThreadDispatch::dispatch(cpu)
//!                    │
//!                    ▼
//!          executing := heir, context switch
//! ```

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::object::id::ObjectId;

/// Performs the deferred thread dispatch of a processor.
pub trait ThreadDispatch {
    /// Switches processor `cpu` to its heir if a dispatch is necessary.
    /// Does nothing while the processor's dispatch-disable level is non-zero.
    fn dispatch(&self, cpu: usize);
}

/// Per-processor scheduling record.
pub struct PerCpu {
    index: usize,
    dispatch_disable_level: AtomicU32,
    dispatch_necessary: AtomicBool,
    /// Raw identifier of the executing thread, `0` while idle.
    executing: AtomicU32,
    heir: AtomicU32,
}

fn to_raw(id: Option<ObjectId>) -> u32 {
    id.map_or(0, |id| id.raw())
}

fn from_raw(raw: u32) -> Option<ObjectId> {
    if raw == 0 {
        None
    } else {
        Some(ObjectId::from_raw(raw))
    }
}

impl PerCpu {
    pub const fn new(index: usize) -> Self {
        Self {
            index,
            dispatch_disable_level: AtomicU32::new(0),
            dispatch_necessary: AtomicBool::new(false),
            executing: AtomicU32::new(0),
            heir: AtomicU32::new(0),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn executing(&self) -> Option<ObjectId> {
        from_raw(self.executing.load(Ordering::Acquire))
    }

    pub fn heir(&self) -> Option<ObjectId> {
        from_raw(self.heir.load(Ordering::Acquire))
    }

    pub(crate) fn set_executing(&self, id: Option<ObjectId>) {
        self.executing.store(to_raw(id), Ordering::Release);
    }

    /// Installs a new heir. Requests a dispatch when the heir differs from
    /// the executing thread.
    pub(crate) fn set_heir(&self, id: Option<ObjectId>) {
        self.heir.store(to_raw(id), Ordering::Release);
        if id != self.executing() {
            self.dispatch_necessary.store(true, Ordering::Release);
        }
    }

    pub fn is_dispatch_necessary(&self) -> bool {
        self.dispatch_necessary.load(Ordering::Acquire)
    }

    pub(crate) fn take_dispatch_necessary(&self) -> bool {
        self.dispatch_necessary.swap(false, Ordering::AcqRel)
    }

    pub fn dispatch_disable_level(&self) -> u32 {
        self.dispatch_disable_level.load(Ordering::Acquire)
    }

    pub fn is_dispatching_allowed(&self) -> bool {
        self.dispatch_disable_level() == 0
    }

    /// Raises the dispatch-disable level until the returned guard drops.
    pub fn disable_dispatch<'a>(&'a self, dispatcher: &'a dyn ThreadDispatch) -> DispatchDisableGuard<'a> {
        self.dispatch_disable_level.fetch_add(1, Ordering::AcqRel);
        DispatchDisableGuard {
            cpu: self,
            dispatcher,
        }
    }
}

/// Scoped dispatch-disable section.
///
/// Dropping the outermost guard of a processor runs the dispatch that was
/// deferred while the section was active.
pub struct DispatchDisableGuard<'a> {
    cpu: &'a PerCpu,
    dispatcher: &'a dyn ThreadDispatch,
}

impl DispatchDisableGuard<'_> {
    pub fn cpu(&self) -> &PerCpu {
        self.cpu
    }
}

impl Drop for DispatchDisableGuard<'_> {
    fn drop(&mut self) {
        let previous = self.cpu.dispatch_disable_level.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "dispatch-disable level underflow");
        if previous == 1 && self.cpu.is_dispatch_necessary() {
            self.dispatcher.dispatch(self.cpu.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::id::Api;
    use core::sync::atomic::AtomicUsize;

    struct CountingDispatcher {
        calls: AtomicUsize,
    }

    impl ThreadDispatch for CountingDispatcher {
        fn dispatch(&self, _cpu: usize) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_nested_guards_dispatch_once() {
        let cpu = PerCpu::new(0);
        let dispatcher = CountingDispatcher {
            calls: AtomicUsize::new(0),
        };

        let outer = cpu.disable_dispatch(&dispatcher);
        let inner = cpu.disable_dispatch(&dispatcher);
        assert_eq!(cpu.dispatch_disable_level(), 2);

        cpu.set_heir(Some(ObjectId::new(Api::Classic as u8, 1, 1, 1)));
        assert!(cpu.is_dispatch_necessary());

        drop(inner);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
        drop(outer);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
        assert!(cpu.is_dispatching_allowed());
    }

    #[test]
    fn test_no_dispatch_without_heir_change() {
        let cpu = PerCpu::new(1);
        let dispatcher = CountingDispatcher {
            calls: AtomicUsize::new(0),
        };
        cpu.set_heir(None);
        assert!(!cpu.is_dispatch_necessary());
        drop(cpu.disable_dispatch(&dispatcher));
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(cpu.executing(), None);
    }
}
