//! # SuperCore Configuration
//!
//! Compile-time constants governing the core, plus the runtime
//! configuration handed to [`System::new`](crate::kernel::System::new).
//!
//! The constants bound fixed-size structures (processor masks, name
//! buffers). Everything that a board or an application chooses at start-up
//! (object limits, processors, scheduler instances) lives in
//! [`SystemConfig`].

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::object::name::NameMode;
use crate::scheduler::priority::PriorityScheduler;
use crate::scheduler::{ProcessorMask, SchedulerPolicy};

/// Upper bound of processors a system may be configured with.
/// [`ProcessorMask`] is a 32-bit set, one bit per processor.
pub const MAX_PROCESSORS: usize = 32;

/// SysTick frequency in Hz. One clock tick advances thread timers and
/// CPU budgets by one unit.
pub const TICK_HZ: u32 = 1000;

/// Default number of clock ticks in a timeslice.
pub const DEFAULT_TIME_SLICE: u32 = 10;

/// Maximum length of thread names in string-named thread classes.
pub const DEFAULT_MAXIMUM_NAME_SIZE: usize = 16;

/// Stack size used when a thread configuration does not ask for more.
/// Must cover the deepest call chain plus the exception frame of the port.
pub const MINIMUM_STACK_SIZE: usize = 1024;

/// System clock frequency in Hz (default for STM32F4 at 16 MHz HSI).
pub const SYSTEM_CLOCK_HZ: u32 = 16_000_000;

// ---------------------------------------------------------------------------
// Object classes
// ---------------------------------------------------------------------------

/// Maximum number of objects of one class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectsMaximum {
    /// A fixed table of `n` slots. Allocation fails once all are in use.
    Fixed(u16),
    /// The table starts with one block of `per_block` slots and grows by
    /// one block whenever the inactive chain runs dry.
    Unlimited { per_block: u16 },
}

impl ObjectsMaximum {
    /// Number of slots the table is created with.
    pub const fn initial_slots(&self) -> u16 {
        match *self {
            ObjectsMaximum::Fixed(n) => n,
            ObjectsMaximum::Unlimited { per_block } => per_block,
        }
    }

    /// Allocation block size, `0` when the class does not auto-extend.
    pub const fn objects_per_block(&self) -> u16 {
        match *self {
            ObjectsMaximum::Fixed(_) => 0,
            ObjectsMaximum::Unlimited { per_block } => per_block,
        }
    }
}

/// Per (API, Class) registry configuration.
#[derive(Debug, Clone, Copy)]
pub struct ClassConfig {
    pub maximum: ObjectsMaximum,
    pub name_mode: NameMode,
    /// Objects of this class may be resolved on other cluster nodes.
    pub global: bool,
}

impl ClassConfig {
    pub const fn fixed(maximum: u16) -> Self {
        Self {
            maximum: ObjectsMaximum::Fixed(maximum),
            name_mode: NameMode::U32,
            global: false,
        }
    }

    pub const fn unlimited(per_block: u16) -> Self {
        Self {
            maximum: ObjectsMaximum::Unlimited { per_block },
            name_mode: NameMode::U32,
            global: false,
        }
    }

    pub const fn with_string_names(mut self, max_len: usize) -> Self {
        self.name_mode = NameMode::String { max_len };
        self
    }

    pub const fn with_global(mut self) -> Self {
        self.global = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Scheduler instances
// ---------------------------------------------------------------------------

/// One scheduler instance: a policy and the processors it owns.
pub struct SchedulerConfig {
    pub name: &'static str,
    pub policy: Box<dyn SchedulerPolicy>,
    pub processors: ProcessorMask,
}

impl SchedulerConfig {
    pub fn new(
        name: &'static str,
        policy: Box<dyn SchedulerPolicy>,
        processors: ProcessorMask,
    ) -> Self {
        Self {
            name,
            policy,
            processors,
        }
    }
}

// ---------------------------------------------------------------------------
// System configuration
// ---------------------------------------------------------------------------

/// Runtime configuration of a [`System`](crate::kernel::System).
pub struct SystemConfig {
    /// Number of processors. Each processor is owned by exactly one
    /// scheduler instance.
    pub processor_count: usize,
    /// Cluster node of this system. `1` in non-clustered builds.
    pub local_node: u8,
    /// Number of cluster nodes. `1` in non-clustered builds.
    pub maximum_nodes: u8,
    /// Clock ticks per timeslice for the timeslice budget algorithms.
    pub ticks_per_timeslice: u32,
    /// Number of per-thread extension slots reserved for API subsystems.
    pub api_extension_slots: usize,
    /// Stack size used when a thread asks for less than this.
    pub minimum_stack_size: usize,
    pub internal_threads: ClassConfig,
    pub classic_tasks: ClassConfig,
    pub posix_threads: ClassConfig,
    pub schedulers: Vec<SchedulerConfig>,
}

impl SystemConfig {
    /// Configuration for `processor_count` processors all owned by one
    /// priority scheduler instance.
    pub fn with_processors(processor_count: usize) -> Self {
        Self {
            processor_count,
            schedulers: vec![SchedulerConfig::new(
                "PRIO",
                Box::new(PriorityScheduler::new()),
                ProcessorMask::all(processor_count),
            )],
            ..Self::default()
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            processor_count: 1,
            local_node: 1,
            maximum_nodes: 1,
            ticks_per_timeslice: DEFAULT_TIME_SLICE,
            api_extension_slots: 4,
            minimum_stack_size: MINIMUM_STACK_SIZE,
            internal_threads: ClassConfig::fixed(4),
            classic_tasks: ClassConfig::fixed(16),
            posix_threads: ClassConfig::unlimited(8)
                .with_string_names(DEFAULT_MAXIMUM_NAME_SIZE),
            schedulers: vec![SchedulerConfig::new(
                "PRIO",
                Box::new(PriorityScheduler::new()),
                ProcessorMask::single(0),
            )],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_objects_maximum_blocks() {
        assert_eq!(ObjectsMaximum::Fixed(4).initial_slots(), 4);
        assert_eq!(ObjectsMaximum::Fixed(4).objects_per_block(), 0);
        let unlimited = ObjectsMaximum::Unlimited { per_block: 3 };
        assert_eq!(unlimited.initial_slots(), 3);
        assert_eq!(unlimited.objects_per_block(), 3);
    }

    #[test]
    fn test_default_system_config() {
        let config = SystemConfig::default();
        assert_eq!(config.processor_count, 1);
        assert_eq!(config.local_node, 1);
        assert_eq!(config.schedulers.len(), 1);
        assert!(config.schedulers[0].processors.contains(0));
        assert_eq!(
            config.posix_threads.name_mode,
            NameMode::String { max_len: DEFAULT_MAXIMUM_NAME_SIZE }
        );
    }

    #[test]
    fn test_with_processors() {
        let config = SystemConfig::with_processors(3);
        assert_eq!(config.processor_count, 3);
        assert_eq!(config.schedulers[0].processors, ProcessorMask::all(3));
    }
}
