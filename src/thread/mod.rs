//! # Thread Control Block
//!
//! The TCB composes every per-thread record of the SuperCore:
//!
//! ```text
//! ┌─────────────────────────── ThreadControl ───────────────────────────┐
//! │ ObjectControl      id + name, registry slot holds the Arc            │
//! │ state lock         execution state · priorities · budget · life      │
//! │ node set lock      SchedulerNodeSet (+ pending node requests)        │
//! │ WaitControl        blocking queue · operations · result · flags      │
//! │ TimerControl       armed timeout                                     │
//! │ StartInformation   stack · initial priority · budget · ISR level ... │
//! │ join queue         threads waiting for this one to terminate         │
//! │ API extensions     per-API state slots                               │
//! │ Context            saved stack pointer                               │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Control blocks are reference counted. The registry slot, the zombie list
//! and transient lookups each hold a strong reference; the memory goes back
//! to the heap with the last one.

pub mod budget;
pub mod life;
pub mod nodes;
pub mod states;
pub mod timer;
pub mod wait;

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::object::id::Api;
use crate::object::{ObjectControl, ObjectId, ObjectName};
use crate::scheduler::{Priority, ProcessorMask};
use crate::sync::IsrLock;
use crate::threadq::{ThreadQueue, FIFO};

use self::budget::{CpuBudget, CpuBudgetAlgorithm};
use self::life::{LifeControl, LifeState};
use self::nodes::SchedulerNodeSet;
use self::states::States;
use self::timer::TimerControl;
use self::wait::WaitControl;

pub use self::budget::BudgetTick;

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Body of a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadEntry {
    /// Processor idle loop.
    Idle,
    /// `entry(argument)`; the thread exits with value 0 on return.
    Numeric { entry: fn(usize), argument: usize },
    /// `entry(argument)`; the return value becomes the exit value.
    Pointer { entry: fn(usize) -> usize, argument: usize },
}

impl ThreadEntry {
    /// Same entry function, new argument.
    pub fn with_argument(self, argument: usize) -> Self {
        match self {
            ThreadEntry::Idle => ThreadEntry::Idle,
            ThreadEntry::Numeric { entry, .. } => ThreadEntry::Numeric { entry, argument },
            ThreadEntry::Pointer { entry, .. } => ThreadEntry::Pointer { entry, argument },
        }
    }
}

// ---------------------------------------------------------------------------
// Stack area
// ---------------------------------------------------------------------------

/// Heap-allocated, 8-byte aligned thread stack.
pub struct StackArea {
    base: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the area is plain memory. It is only written through the saved
// context of the thread that owns it, or before that thread first runs.
unsafe impl Send for StackArea {}
unsafe impl Sync for StackArea {}

impl StackArea {
    /// Allocates `size` bytes, rounded up to a multiple of 8. `None` when
    /// the heap is exhausted.
    pub fn new(size: usize) -> Option<Self> {
        let size = size.checked_add(7)? & !7;
        let layout = Layout::from_size_align(size.max(8), 8).ok()?;
        // SAFETY: the layout has a non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        NonNull::new(base).map(|base| Self { base, layout })
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Lowest address of the area.
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// One past the highest address; the initial stack pointer.
    pub fn top(&self) -> usize {
        self.base() + self.size()
    }
}

impl Drop for StackArea {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}

impl core::fmt::Debug for StackArea {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "StackArea({:#x}..{:#x})", self.base(), self.top())
    }
}

/// Saved processor context of a thread.
///
/// Only the stack pointer lives here; the ports push the remaining
/// registers onto the thread's stack.
#[derive(Debug, Default)]
pub struct Context {
    stack_pointer: AtomicUsize,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            stack_pointer: AtomicUsize::new(0),
        }
    }

    pub fn stack_pointer(&self) -> usize {
        self.stack_pointer.load(Ordering::Acquire)
    }

    pub fn set_stack_pointer(&self, sp: usize) {
        self.stack_pointer.store(sp, Ordering::Release);
    }

    /// Storage of the saved stack pointer, for context switch code.
    pub fn slot(&self) -> *const AtomicUsize {
        &self.stack_pointer
    }
}

// ---------------------------------------------------------------------------
// Creation parameters
// ---------------------------------------------------------------------------

/// Parameters of a new thread.
#[derive(Clone, Debug)]
pub struct ThreadConfig {
    /// API whose thread class receives the thread.
    pub api: Api,
    pub name: ObjectName,
    pub priority: Priority,
    /// Home scheduler instance.
    pub scheduler: usize,
    pub stack_size: usize,
    pub budget: CpuBudgetAlgorithm,
    pub is_preemptible: bool,
    pub isr_level: u32,
    pub is_fp: bool,
    pub tls_size: usize,
    /// Defaults to the processors of the home scheduler.
    pub affinity: Option<ProcessorMask>,
    /// Released at termination instead of waiting to be joined.
    pub detached: bool,
}

impl ThreadConfig {
    pub fn new(api: Api, name: ObjectName, priority: Priority) -> Self {
        Self {
            api,
            name,
            priority,
            scheduler: 0,
            stack_size: 0,
            budget: CpuBudgetAlgorithm::None,
            is_preemptible: true,
            isr_level: 0,
            is_fp: false,
            tls_size: 0,
            affinity: None,
            detached: false,
        }
    }

    pub fn scheduler(mut self, scheduler: usize) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn budget(mut self, budget: CpuBudgetAlgorithm) -> Self {
        self.budget = budget;
        self
    }

    pub fn preemptible(mut self, is_preemptible: bool) -> Self {
        self.is_preemptible = is_preemptible;
        self
    }

    pub fn isr_level(mut self, isr_level: u32) -> Self {
        self.isr_level = isr_level;
        self
    }

    pub fn floating_point(mut self, is_fp: bool) -> Self {
        self.is_fp = is_fp;
        self
    }

    pub fn tls_size(mut self, tls_size: usize) -> Self {
        self.tls_size = tls_size;
        self
    }

    pub fn affinity(mut self, affinity: ProcessorMask) -> Self {
        self.affinity = Some(affinity);
        self
    }

    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }
}

/// What a restart returns the thread to.
#[derive(Debug)]
pub struct StartInformation {
    pub initial_priority: Priority,
    pub budget_algorithm: CpuBudgetAlgorithm,
    pub is_preemptible: bool,
    pub isr_level: u32,
    pub is_fp: bool,
    pub tls_size: usize,
    pub stack: StackArea,
}

/// State guarded by the thread state lock.
#[derive(Clone, Copy, Debug)]
pub struct ThreadState {
    pub current_state: States,
    /// Priority assigned by the application.
    pub real_priority: Priority,
    /// Priority used for scheduling.
    pub priority: Priority,
    pub budget: CpuBudget,
    pub life: LifeControl,
    pub is_preemptible: bool,
    pub entry: ThreadEntry,
}

// ---------------------------------------------------------------------------
// Thread control block
// ---------------------------------------------------------------------------

type ApiExtension = Arc<dyn Any + Send + Sync>;

/// Thread control block.
pub struct ThreadControl {
    object: ObjectControl,
    pub(crate) state: IsrLock<ThreadState>,
    pub(crate) nodes: IsrLock<SchedulerNodeSet>,
    wait: WaitControl,
    timer: TimerControl,
    start: StartInformation,
    join_queue: Arc<ThreadQueue>,
    api_extensions: IsrLock<Vec<Option<ApiExtension>>>,
    restarts: AtomicU32,
    context: Context,
}

impl ThreadControl {
    /// A dormant thread. `nodes` must already have its home node attached.
    pub(crate) fn new(
        id: ObjectId,
        config: &ThreadConfig,
        stack: StackArea,
        nodes: SchedulerNodeSet,
        ticks_per_timeslice: u32,
        api_extension_slots: usize,
    ) -> Self {
        let life = LifeControl {
            state: if config.detached {
                LifeState::DETACHED
            } else {
                LifeState::NONE
            },
            ..LifeControl::new()
        };
        Self {
            object: ObjectControl::new(id, config.name.clone()),
            state: IsrLock::new(
                "Thread State",
                ThreadState {
                    current_state: States::DORMANT,
                    real_priority: config.priority,
                    priority: config.priority,
                    budget: CpuBudget::new(config.budget, ticks_per_timeslice),
                    life,
                    is_preemptible: config.is_preemptible,
                    entry: ThreadEntry::Idle,
                },
            ),
            nodes: IsrLock::new("Thread Scheduler", nodes),
            wait: WaitControl::new(),
            timer: TimerControl::new(),
            start: StartInformation {
                initial_priority: config.priority,
                budget_algorithm: config.budget,
                is_preemptible: config.is_preemptible,
                isr_level: config.isr_level,
                is_fp: config.is_fp,
                tls_size: config.tls_size,
                stack,
            },
            join_queue: Arc::new(ThreadQueue::new("Join", States::WAITING_FOR_JOIN, &FIFO)),
            api_extensions: IsrLock::new(
                "Thread API Extensions",
                (0..api_extension_slots).map(|_| None).collect(),
            ),
            restarts: AtomicU32::new(0),
            context: Context::new(),
        }
    }

    pub fn name(&self) -> ObjectName {
        self.object.name()
    }

    /// Consistent copy of the state-lock fields.
    pub fn snapshot(&self) -> ThreadState {
        self.state.with(|state| *state)
    }

    pub fn current_state(&self) -> States {
        self.state.with(|state| state.current_state)
    }

    pub fn real_priority(&self) -> Priority {
        self.state.with(|state| state.real_priority)
    }

    pub fn priority(&self) -> Priority {
        self.state.with(|state| state.priority)
    }

    pub fn life(&self) -> LifeControl {
        self.state.with(|state| state.life)
    }

    pub fn is_preemptible(&self) -> bool {
        self.state.with(|state| state.is_preemptible)
    }

    pub fn budget(&self) -> CpuBudget {
        self.state.with(|state| state.budget)
    }

    pub fn entry(&self) -> ThreadEntry {
        self.state.with(|state| state.entry)
    }

    pub fn wait(&self) -> &WaitControl {
        &self.wait
    }

    pub fn timer(&self) -> &TimerControl {
        &self.timer
    }

    pub fn start(&self) -> &StartInformation {
        &self.start
    }

    pub fn join_queue(&self) -> &Arc<ThreadQueue> {
        &self.join_queue
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Number of restart actions carried out.
    pub fn restarts(&self) -> u32 {
        self.restarts.load(Ordering::Acquire)
    }

    pub(crate) fn count_restart(&self) {
        self.restarts.fetch_add(1, Ordering::AcqRel);
    }

    pub fn home_scheduler(&self) -> usize {
        self.nodes.with(|nodes| nodes.home())
    }

    /// Runs `f` on the scheduler node set.
    pub fn with_nodes<R>(&self, f: impl FnOnce(&SchedulerNodeSet) -> R) -> R {
        self.nodes.with(|nodes| f(nodes))
    }

    pub fn api_extension(&self, slot: usize) -> Option<ApiExtension> {
        self.api_extensions
            .with(|slots| slots.get(slot).and_then(|value| value.clone()))
    }

    /// Stores per-API state. Returns `false` for a slot that was not
    /// configured.
    pub fn set_api_extension(&self, slot: usize, value: Option<ApiExtension>) -> bool {
        self.api_extensions.with(|slots| match slots.get_mut(slot) {
            Some(entry) => {
                *entry = value;
                true
            }
            None => false,
        })
    }
}

impl crate::object::Object for ThreadControl {
    fn object(&self) -> &ObjectControl {
        &self.object
    }
}

impl core::fmt::Debug for ThreadControl {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadControl")
            .field("id", &self.object.id())
            .field("state", &self.current_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Object;

    fn thread(config: &ThreadConfig) -> ThreadControl {
        let id = ObjectId::new(Api::Classic as u8, 1, 1, 1);
        let mut nodes = SchedulerNodeSet::new(id, 1);
        nodes.attach_home(0, config.priority, ProcessorMask::single(0));
        let stack = StackArea::new(1000).unwrap();
        ThreadControl::new(id, config, stack, nodes, 10, 2)
    }

    #[test]
    fn test_new_thread_is_dormant() {
        let config = ThreadConfig::new(Api::Classic, ObjectName::U32(7), 12).preemptible(false);
        let tcb = thread(&config);
        assert!(tcb.current_state().is_dormant());
        assert_eq!(tcb.priority(), 12);
        assert!(!tcb.is_preemptible());
        assert_eq!(tcb.life().state, LifeState::NONE);
        assert_eq!(tcb.start().stack.size(), 1000);
        assert_eq!(tcb.start().stack.top() % 8, 0);
        assert_eq!(tcb.join_queue().state(), States::WAITING_FOR_JOIN);
        assert_eq!(tcb.id().index(), 1);
    }

    #[test]
    fn test_detached_config() {
        let tcb = thread(&ThreadConfig::new(Api::Classic, ObjectName::U32(1), 1).detached());
        assert!(tcb.life().state.is_detached());
    }

    #[test]
    fn test_api_extension_slots() {
        let tcb = thread(&ThreadConfig::new(Api::Classic, ObjectName::U32(1), 1));
        assert!(tcb.api_extension(0).is_none());
        assert!(tcb.set_api_extension(1, Some(Arc::new(5u32))));
        assert!(!tcb.set_api_extension(2, None));
        let value = tcb.api_extension(1).unwrap();
        assert_eq!(value.downcast_ref::<u32>(), Some(&5));
    }

    #[test]
    fn test_entry_argument() {
        fn body(_: usize) {}
        let entry = ThreadEntry::Numeric { entry: body, argument: 1 }.with_argument(9);
        assert!(matches!(entry, ThreadEntry::Numeric { argument: 9, .. }));
        assert_eq!(ThreadEntry::Idle.with_argument(3), ThreadEntry::Idle);
    }

    #[test]
    fn test_stack_rounding() {
        let stack = StackArea::new(13).unwrap();
        assert_eq!(stack.size(), 16);
        assert_eq!(stack.base() % 8, 0);
    }
}
