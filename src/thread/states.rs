//! Thread execution states.
//!
//! A thread is ready when its state is empty. Every other bit names one
//! reason why it cannot execute; several reasons may hold at once (a
//! suspended thread waiting on a semaphore, for example).

use bitflags::bitflags;

bitflags! {
    /// Execution state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct States: u32 {
        const WAITING_FOR_MUTEX = 0x0000_0001;
        const WAITING_FOR_SEMAPHORE = 0x0000_0002;
        const WAITING_FOR_EVENT = 0x0000_0004;
        const WAITING_FOR_SYSTEM_EVENT = 0x0000_0008;
        const WAITING_FOR_MESSAGE = 0x0000_0010;
        const WAITING_FOR_CONDITION_VARIABLE = 0x0000_0020;
        const WAITING_FOR_FUTEX = 0x0000_0040;
        const WAITING_FOR_BSD_WAKEUP = 0x0000_0080;
        /// Delayed or sleeping.
        const WAITING_FOR_TIME = 0x0000_0100;
        const WAITING_FOR_PERIOD = 0x0000_0200;
        const WAITING_FOR_SIGNAL = 0x0000_0400;
        const WAITING_FOR_BARRIER = 0x0000_0800;
        const WAITING_FOR_RWLOCK = 0x0000_1000;
        const WAITING_FOR_JOIN_AT_EXIT = 0x0000_2000;
        const WAITING_FOR_JOIN = 0x0000_4000;
        const SUSPENDED = 0x0000_8000;
        const WAITING_FOR_SEGMENT = 0x0001_0000;
        /// A restart or termination is being carried out.
        const LIFE_IS_CHANGING = 0x0002_0000;
        /// Terminated, waiting to be joined or released.
        const ZOMBIE = 0x4000_0000;
        /// Created but not started.
        const DORMANT = 0x8000_0000;

        /// States set by blocking on a thread queue.
        const BLOCKED_ON_OBJECT = Self::WAITING_FOR_MUTEX.bits()
            | Self::WAITING_FOR_SEMAPHORE.bits()
            | Self::WAITING_FOR_MESSAGE.bits()
            | Self::WAITING_FOR_CONDITION_VARIABLE.bits()
            | Self::WAITING_FOR_FUTEX.bits()
            | Self::WAITING_FOR_BSD_WAKEUP.bits()
            | Self::WAITING_FOR_BARRIER.bits()
            | Self::WAITING_FOR_RWLOCK.bits()
            | Self::WAITING_FOR_JOIN_AT_EXIT.bits()
            | Self::WAITING_FOR_JOIN.bits()
            | Self::WAITING_FOR_SEGMENT.bits();

        /// States a thread leaves on its own once the event arrives.
        const BLOCKED = Self::BLOCKED_ON_OBJECT.bits()
            | Self::WAITING_FOR_EVENT.bits()
            | Self::WAITING_FOR_SYSTEM_EVENT.bits()
            | Self::WAITING_FOR_TIME.bits()
            | Self::WAITING_FOR_PERIOD.bits()
            | Self::WAITING_FOR_SIGNAL.bits();
    }
}

impl States {
    pub const READY: States = States::empty();

    #[inline]
    pub const fn is_ready(&self) -> bool {
        self.is_empty()
    }

    #[inline]
    pub const fn is_blocked(&self) -> bool {
        self.intersects(States::BLOCKED)
    }

    #[inline]
    pub const fn is_blocked_on_object(&self) -> bool {
        self.intersects(States::BLOCKED_ON_OBJECT)
    }

    #[inline]
    pub const fn is_dormant(&self) -> bool {
        self.contains(States::DORMANT)
    }

    #[inline]
    pub const fn is_suspended(&self) -> bool {
        self.contains(States::SUSPENDED)
    }

    #[inline]
    pub const fn is_zombie(&self) -> bool {
        self.contains(States::ZOMBIE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_is_empty() {
        assert!(States::READY.is_ready());
        assert!(!States::DORMANT.is_ready());
    }

    #[test]
    fn test_blocked_masks() {
        let state = States::WAITING_FOR_SEMAPHORE | States::SUSPENDED;
        assert!(state.is_blocked());
        assert!(state.is_blocked_on_object());
        assert!(state.is_suspended());

        assert!(States::WAITING_FOR_TIME.is_blocked());
        assert!(!States::WAITING_FOR_TIME.is_blocked_on_object());
        assert!(!States::SUSPENDED.is_blocked());
    }

    #[test]
    fn test_bit_values() {
        assert_eq!(States::SUSPENDED.bits(), 0x8000);
        assert_eq!(States::LIFE_IS_CHANGING.bits(), 0x20000);
        assert_eq!(States::DORMANT.bits(), 0x8000_0000);
    }
}
