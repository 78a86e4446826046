//! # Objects Allocator Lock
//!
//! Recursive mutex serializing object creation and deletion. Registry
//! tables only hand out and take back slots under this lock, witnessed by an
//! [`AllocatorGuard`] reference.
//!
//! The outermost acquisition raises the life protection of the locking
//! thread, so that the thread cannot be restarted or deleted while it owns
//! half-constructed objects. The final release restores the previous
//! protection, which may run a restart or delete that was deferred in the
//! meantime.

use core::hint::spin_loop;

use spin::Mutex;

/// Owner of the allocator lock: a thread, or the thread-less context of a
/// processor.
pub type LockOwner = u64;

/// Raises and restores the life protection of an allocator lock owner.
pub trait LifeProtection {
    /// Identity of the calling context.
    fn current_owner(&self) -> LockOwner;

    /// Sets or clears the protection of `owner`, returning whether it was
    /// protected before.
    fn set_life_protection(&self, owner: LockOwner, protect: bool) -> bool;
}

struct AllocatorState {
    owner: Option<LockOwner>,
    nest_level: u32,
    previous_protection: bool,
}

/// The recursive objects allocator mutex.
pub struct ObjectsAllocator {
    state: Mutex<AllocatorState>,
}

impl ObjectsAllocator {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(AllocatorState {
                owner: None,
                nest_level: 0,
                previous_protection: false,
            }),
        }
    }

    /// Acquires the lock for the calling context, spinning while another
    /// owner holds it.
    pub fn lock<'a>(&'a self, life: &'a dyn LifeProtection) -> AllocatorGuard<'a> {
        let owner = life.current_owner();
        // Protection first: a deferred change must not run while the lock
        // is owned.
        let previous = life.set_life_protection(owner, true);

        loop {
            let mut state = self.state.lock();
            match state.owner {
                None => {
                    state.owner = Some(owner);
                    state.nest_level = 1;
                    state.previous_protection = previous;
                    break;
                }
                Some(current) if current == owner => {
                    state.nest_level += 1;
                    break;
                }
                Some(_) => {
                    drop(state);
                    spin_loop();
                }
            }
        }

        AllocatorGuard {
            allocator: self,
            life,
            owner,
        }
    }

    pub fn is_owner(&self, owner: LockOwner) -> bool {
        self.state.lock().owner == Some(owner)
    }

    pub fn nest_level(&self) -> u32 {
        self.state.lock().nest_level
    }
}

impl Default for ObjectsAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof of holding the objects allocator lock. Unlocks on drop.
pub struct AllocatorGuard<'a> {
    allocator: &'a ObjectsAllocator,
    life: &'a dyn LifeProtection,
    owner: LockOwner,
}

impl AllocatorGuard<'_> {
    pub fn owner(&self) -> LockOwner {
        self.owner
    }
}

impl Drop for AllocatorGuard<'_> {
    fn drop(&mut self) {
        let restore = {
            let mut state = self.allocator.state.lock();
            debug_assert_eq!(state.owner, Some(self.owner));
            state.nest_level -= 1;
            if state.nest_level == 0 {
                state.owner = None;
                Some(state.previous_protection)
            } else {
                None
            }
        };

        // Nested levels restore to "protected", the outermost level to the
        // state found at the first lock.
        let protect = restore.unwrap_or(true);
        self.life.set_life_protection(self.owner, protect);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use std::vec::Vec;

    struct Recorder {
        protected: RefCell<bool>,
        log: RefCell<Vec<bool>>,
    }

    impl LifeProtection for Recorder {
        fn current_owner(&self) -> LockOwner {
            7
        }

        fn set_life_protection(&self, _owner: LockOwner, protect: bool) -> bool {
            self.log.borrow_mut().push(protect);
            self.protected.replace(protect)
        }
    }

    #[test]
    fn test_recursive_lock_restores_protection() {
        let allocator = ObjectsAllocator::new();
        let life = Recorder {
            protected: RefCell::new(false),
            log: RefCell::new(Vec::new()),
        };

        {
            let outer = allocator.lock(&life);
            assert_eq!(outer.owner(), 7);
            {
                let _inner = allocator.lock(&life);
                assert_eq!(allocator.nest_level(), 2);
                assert!(*life.protected.borrow());
            }
            assert!(*life.protected.borrow());
            assert!(allocator.is_owner(7));
        }

        assert_eq!(allocator.nest_level(), 0);
        assert!(!allocator.is_owner(7));
        assert!(!*life.protected.borrow());
    }

    #[test]
    fn test_previously_protected_owner_stays_protected() {
        let allocator = ObjectsAllocator::new();
        let life = Recorder {
            protected: RefCell::new(true),
            log: RefCell::new(Vec::new()),
        };
        drop(allocator.lock(&life));
        assert!(*life.protected.borrow());
        assert_eq!(*life.log.borrow(), vec![true, true]);
    }
}
