//! # Life-Cycle Control
//!
//! ```text
//!            create               start
//!   (none) ─────────► DORMANT ─────────► READY/BLOCKED ◄──┐
//!                                          │     │        │ restart action
//!                   restart/delete request │     └────────┘
//!                                          ▼
//!                        PROTECTED or CHANGE_DEFERRED set?
//!                          │ no                  │ yes
//!                          ▼                     ▼
//!                   action runs now     RESTARTING/TERMINATING recorded,
//!                                       runs once protection is released
//!                                                │
//!                   terminate action ◄───────────┘ (beats restart)
//!                          │
//!                          ▼
//!                  slot closed + freed ── DETACHED? ── TCB released
//!                                           └─ no ──── zombie until joined
//! ```

use bitflags::bitflags;

bitflags! {
    /// Life-cycle state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LifeState: u32 {
        /// Restart and termination are deferred.
        const PROTECTED = 0x01;
        const RESTARTING = 0x02;
        const TERMINATING = 0x04;
        /// Deferred cancellation type.
        const CHANGE_DEFERRED = 0x08;
        /// No join: the TCB is released right after termination.
        const DETACHED = 0x10;
    }
}

impl LifeState {
    pub const NONE: LifeState = LifeState::empty();

    /// A restart or termination was requested.
    #[inline]
    pub const fn is_changing(&self) -> bool {
        self.intersects(LifeState::RESTARTING.union(LifeState::TERMINATING))
    }

    /// A requested change may be carried out now.
    #[inline]
    pub const fn is_change_allowed(&self) -> bool {
        !self.intersects(LifeState::PROTECTED.union(LifeState::CHANGE_DEFERRED))
    }

    #[inline]
    pub const fn is_restarting(&self) -> bool {
        self.contains(LifeState::RESTARTING)
    }

    #[inline]
    pub const fn is_terminating(&self) -> bool {
        self.contains(LifeState::TERMINATING)
    }

    #[inline]
    pub const fn is_detached(&self) -> bool {
        self.contains(LifeState::DETACHED)
    }
}

/// Life-cycle record of a thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct LifeControl {
    pub state: LifeState,
    /// Restart and delete requests counted since the last action.
    pub pending_life_change_requests: u32,
    /// Value handed to joiners.
    pub exit_value: usize,
}

impl LifeControl {
    pub const fn new() -> Self {
        Self {
            state: LifeState::NONE,
            pending_life_change_requests: 0,
            exit_value: 0,
        }
    }

    /// Applies `clear` then `set`. Returns the previous state.
    pub fn change(&mut self, clear: LifeState, set: LifeState) -> LifeState {
        let previous = self.state;
        self.state = (self.state - clear) | set;
        previous
    }

    /// The state used for the "may the change run now" decision, with the
    /// `ignore` bits masked out.
    pub fn effective(&self, ignore: LifeState) -> LifeState {
        self.state - ignore
    }

    /// A change is both requested and allowed.
    pub fn is_action_due(&self, ignore: LifeState) -> bool {
        let effective = self.effective(ignore);
        effective.is_change_allowed() && effective.is_changing()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_values() {
        assert_eq!(LifeState::PROTECTED.bits(), 1);
        assert_eq!(LifeState::DETACHED.bits(), 0x10);
        assert!(LifeState::NONE.is_empty());
    }

    #[test]
    fn test_change_allowed() {
        assert!(LifeState::NONE.is_change_allowed());
        assert!(!LifeState::PROTECTED.is_change_allowed());
        assert!(!LifeState::CHANGE_DEFERRED.is_change_allowed());
        assert!(LifeState::DETACHED.is_change_allowed());
        assert!((LifeState::TERMINATING | LifeState::RESTARTING).is_changing());
        assert!(!LifeState::DETACHED.is_changing());
    }

    #[test]
    fn test_change_and_due() {
        let mut life = LifeControl::new();
        let previous = life.change(LifeState::NONE, LifeState::PROTECTED | LifeState::RESTARTING);
        assert_eq!(previous, LifeState::NONE);
        assert!(!life.is_action_due(LifeState::NONE));
        assert!(life.is_action_due(LifeState::PROTECTED));

        let previous = life.change(LifeState::PROTECTED, LifeState::NONE);
        assert!(previous.contains(LifeState::PROTECTED));
        assert!(life.is_action_due(LifeState::NONE));
        assert_eq!(life.state, LifeState::RESTARTING);
    }
}
