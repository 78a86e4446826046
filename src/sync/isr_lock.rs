//! ISR lock: interrupt disable plus an SMP spinlock.

use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};

use critical_section::RestoreState;
use spin::{Mutex, MutexGuard};

/// Lock usable from thread and interrupt context alike.
///
/// Acquisition first disables interrupts on the local processor, then spins
/// on the lock word. Release happens in reverse order when the guard drops,
/// so guards must be dropped in the reverse order of acquisition.
pub struct IsrLock<T> {
    name: &'static str,
    inner: Mutex<T>,
}

impl<T> IsrLock<T> {
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            inner: Mutex::new(value),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn acquire(&self) -> IsrLockGuard<'_, T> {
        // SAFETY: the restore state is handed back exactly once, by the
        // guard's drop, after the spinlock was released.
        let restore = unsafe { critical_section::acquire() };
        IsrLockGuard {
            guard: ManuallyDrop::new(self.inner.lock()),
            restore,
        }
    }

    /// Runs `f` with the lock held.
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.acquire();
        f(&mut guard)
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for IsrLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IsrLock").field("name", &self.name).finish()
    }
}

/// Held ISR lock. Interrupts stay disabled until it drops.
pub struct IsrLockGuard<'a, T> {
    guard: ManuallyDrop<MutexGuard<'a, T>>,
    restore: RestoreState,
}

impl<T> Deref for IsrLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IsrLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for IsrLockGuard<'_, T> {
    fn drop(&mut self) {
        // SAFETY: the spinlock guard is dropped exactly once, here, and the
        // restore state comes from the matching acquire.
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
            critical_section::release(self.restore);
        }
    }
}
