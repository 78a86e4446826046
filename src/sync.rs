//! # Synchronization Primitives
//!
//! Interrupt-safe locking for the SuperCore. All shared kernel state is
//! reached through one of three mechanisms:
//!
//! - [`IsrLock`]: disables interrupts on the local processor and takes a
//!   spinlock for the other processors. Protects short state transitions
//!   (registry tables, thread state, wait records, queues).
//! - [`DispatchDisableGuard`]: raises the per-processor dispatch-disable
//!   level. **Not** mutual exclusion: it only defers thread dispatching on
//!   the calling processor until the guard drops.
//! - [`ObjectsAllocator`](crate::object::allocator::ObjectsAllocator): the
//!   recursive allocator mutex guarding object creation and deletion.
//!
//! ## Lock order
//!
//! ```text
//! thread queue heads ─► thread wait lock
//! thread state ─► scheduler node set ─► scheduler policy
//! registry table, watchdog set, zombie and retired lists (leaves)
//! ```
//!
//! Wait-lock requests are registered and withdrawn inside a
//! [`critical_section`]. No lock of this module may be held while spinning
//! on a wait-lock tranquilizer.

pub mod isr_lock;
pub mod percpu;

pub use isr_lock::{IsrLock, IsrLockGuard};
pub use percpu::{DispatchDisableGuard, PerCpu, ThreadDispatch};

/// Execute a closure within a critical section (interrupts disabled).
///
/// Used by code that touches hardware state outside of any [`IsrLock`].
/// Keep the closure short: it delays every interrupt on this processor.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(critical_section::CriticalSection<'_>) -> R,
{
    critical_section::with(f)
}
