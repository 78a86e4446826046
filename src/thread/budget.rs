//! CPU budget accounting of a thread.

use crate::object::id::ObjectId;

/// What happens when a thread uses up its time slice.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum CpuBudgetAlgorithm {
    /// No time slicing.
    #[default]
    None,
    /// Time slice, reloaded at every context switch.
    ResetTimeslice,
    /// Time slice, reloaded only when used up.
    ExhaustTimeslice,
    /// Runs the callout once the budget is used up.
    Callout(fn(ObjectId)),
}

/// Result of one clock tick against a budget.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BudgetTick {
    Continue,
    /// Time slice used up; the thread yields.
    Yield,
    /// Callout budget used up.
    Callout(fn(ObjectId)),
}

#[derive(Clone, Copy, Debug)]
pub struct CpuBudget {
    algorithm: CpuBudgetAlgorithm,
    timeslice: u32,
    available: u32,
    /// Ticks executed since the last restart.
    consumed: u64,
}

impl CpuBudget {
    pub const fn new(algorithm: CpuBudgetAlgorithm, timeslice: u32) -> Self {
        Self {
            algorithm,
            timeslice,
            available: timeslice,
            consumed: 0,
        }
    }

    pub fn algorithm(&self) -> CpuBudgetAlgorithm {
        self.algorithm
    }

    pub fn available(&self) -> u32 {
        self.available
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Accounts one tick of execution.
    pub fn at_tick(&mut self, preemptible: bool) -> BudgetTick {
        self.consumed += 1;
        if !preemptible {
            return BudgetTick::Continue;
        }
        match self.algorithm {
            CpuBudgetAlgorithm::None => BudgetTick::Continue,
            CpuBudgetAlgorithm::ResetTimeslice | CpuBudgetAlgorithm::ExhaustTimeslice => {
                self.available = self.available.saturating_sub(1);
                if self.available == 0 {
                    self.available = self.timeslice;
                    BudgetTick::Yield
                } else {
                    BudgetTick::Continue
                }
            }
            CpuBudgetAlgorithm::Callout(callout) => {
                self.available = self.available.saturating_sub(1);
                if self.available == 0 {
                    self.available = self.timeslice;
                    BudgetTick::Callout(callout)
                } else {
                    BudgetTick::Continue
                }
            }
        }
    }

    /// The thread is switched in.
    pub fn at_context_switch(&mut self) {
        if matches!(self.algorithm, CpuBudgetAlgorithm::ResetTimeslice) {
            self.available = self.timeslice;
        }
    }

    /// Clears the accumulated budget.
    pub fn reset(&mut self) {
        self.available = self.timeslice;
        self.consumed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeslice_yield() {
        let mut budget = CpuBudget::new(CpuBudgetAlgorithm::ResetTimeslice, 3);
        assert_eq!(budget.at_tick(true), BudgetTick::Continue);
        assert_eq!(budget.at_tick(true), BudgetTick::Continue);
        assert_eq!(budget.at_tick(true), BudgetTick::Yield);
        assert_eq!(budget.available(), 3);
        assert_eq!(budget.consumed(), 3);
    }

    #[test]
    fn test_non_preemptible_only_counts() {
        let mut budget = CpuBudget::new(CpuBudgetAlgorithm::ExhaustTimeslice, 1);
        assert_eq!(budget.at_tick(false), BudgetTick::Continue);
        assert_eq!(budget.available(), 1);
        assert_eq!(budget.consumed(), 1);
    }

    #[test]
    fn test_context_switch_and_reset() {
        let mut reset = CpuBudget::new(CpuBudgetAlgorithm::ResetTimeslice, 5);
        let mut exhaust = CpuBudget::new(CpuBudgetAlgorithm::ExhaustTimeslice, 5);
        reset.at_tick(true);
        exhaust.at_tick(true);
        reset.at_context_switch();
        exhaust.at_context_switch();
        assert_eq!(reset.available(), 5);
        assert_eq!(exhaust.available(), 4);

        exhaust.reset();
        assert_eq!(exhaust.available(), 5);
        assert_eq!(exhaust.consumed(), 0);
    }

    #[test]
    fn test_callout() {
        fn callout(_id: ObjectId) {}
        let mut budget = CpuBudget::new(CpuBudgetAlgorithm::Callout(callout), 1);
        assert!(matches!(budget.at_tick(true), BudgetTick::Callout(_)));
    }
}
