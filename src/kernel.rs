//! # Kernel Core
//!
//! [`System`] ties the SuperCore together: the per-processor records, the
//! thread classes of the object registry, the scheduler instances, the
//! watchdog set and the CPU port. Every thread operation of the API layers
//! lands here.
//!
//! ```text
//!             create_thread ──► DORMANT ──start_thread──► READY ◄──────┐
//!                                                        │   ▲          │
//!                            set_state(BLOCKED/SUSPENDED)│   │clear     │
//!                                                        ▼   │          │
//!                                                     BLOCKED ──timeout─┘
//!
//!   delete/cancel/exit ──► life action ──► ZOMBIE ──joined/detached──► freed
//!   restart           ──► life action ──► READY (initial priority, fresh context)
//! ```
//!
//! ## Heir selection
//!
//! Every state change ends in [`System::update_heirs`]:
//!
//! 1. Executing threads that are ready but not preemptible keep their
//!    processor.
//! 2. Every scheduler instance picks heirs for its remaining processors.
//! 3. Processors whose heir changed and whose dispatch-disable level is zero
//!    are dispatched right away; the others dispatch when their last
//!    [`DispatchDisableGuard`] drops.
//!
//! ## Wake-up races
//!
//! Wait-lock requests are only held inside a critical section, and the
//! tranquilizer wait happens outside of it. A timeout and a regular wake-up
//! may both try to unblock a thread; exactly one of them extracts it from
//! the queue, the other one sees a stale request and backs off.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Once;

use crate::arch::CpuPort;
use crate::config::{SystemConfig, MAX_PROCESSORS};
use crate::error::{KernelResult, LookupError, Status};
use crate::extension::UserExtension;
use crate::object::allocator::{LifeProtection, LockOwner, ObjectsAllocator};
use crate::object::id::{ClassicClass, InternalClass, PosixClass};
use crate::object::{Api, Information, Located, NodeScope, Object, ObjectGuard, ObjectId, ObjectName};
use crate::scheduler::{NodeRef, Priority, ProcessorMask, SchedulerInstance, SchedulerNode, SchedulerPolicy};
use crate::sync::{self, DispatchDisableGuard, PerCpu, ThreadDispatch};
use crate::thread::budget::{BudgetTick, CpuBudget};
use crate::thread::life::LifeState;
use crate::thread::nodes::{NodeRequest, SchedulerNodeSet};
use crate::thread::states::States;
use crate::thread::timer::{Interval, Watchdogs, NO_TIMEOUT};
use crate::thread::wait::{WAIT_CLASS_OBJECT, WAIT_STATE_BLOCKED, WAIT_STATE_INTEND_TO_BLOCK, WAIT_STATE_READY};
use crate::thread::{StackArea, ThreadConfig, ThreadControl, ThreadEntry};
use crate::threadq::ThreadQueue;

/// Exit value of a cancelled thread.
pub const THREAD_CANCELED: usize = usize::MAX;

/// Result of an operation that may block the calling thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<T> {
    /// Completed without blocking.
    Done(T),
    /// The executing thread blocked. The outcome is delivered through its
    /// wait result once it executes again.
    Blocked,
}

#[derive(Clone, Copy)]
enum LifeAction {
    Terminate,
    Restart,
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

/// The SuperCore of one node.
pub struct System {
    cpus: Vec<PerCpu>,
    /// Scheduler instance owning each processor.
    cpu_scheduler: Vec<Option<usize>>,
    schedulers: Vec<SchedulerInstance>,
    allocator: ObjectsAllocator,
    internal_threads: Information<ThreadControl>,
    classic_tasks: Information<ThreadControl>,
    posix_threads: Information<ThreadControl>,
    watchdogs: Watchdogs,
    /// Terminated joinable threads nobody joined yet.
    zombies: sync::IsrLock<Vec<Arc<ThreadControl>>>,
    /// Terminated threads whose stack may still be live: the context
    /// switch away from them completes after the dispatch that scheduled it.
    retired: sync::IsrLock<Vec<Arc<ThreadControl>>>,
    extensions: sync::IsrLock<Vec<Arc<dyn UserExtension>>>,
    port: Arc<dyn CpuPort>,
    ticks_per_timeslice: u32,
    api_extension_slots: usize,
    minimum_stack_size: usize,
}

impl System {
    /// Validates `config` and builds an idle system.
    pub fn new(config: SystemConfig, port: Arc<dyn CpuPort>) -> KernelResult<Self> {
        let count = config.processor_count;
        if count == 0 || count > MAX_PROCESSORS {
            return Err(Status::InvalidNumber);
        }
        if config.local_node == 0 || config.local_node > config.maximum_nodes {
            return Err(Status::InvalidNode);
        }
        if config.schedulers.is_empty() {
            return Err(Status::InvalidNumber);
        }

        let mut cpu_scheduler = alloc::vec![None; count];
        let mut schedulers = Vec::with_capacity(config.schedulers.len());
        for (index, scheduler) in config.schedulers.into_iter().enumerate() {
            if scheduler.processors.is_empty() {
                return Err(Status::InvalidNumber);
            }
            for cpu in scheduler.processors.iter() {
                match cpu_scheduler.get_mut(cpu) {
                    Some(owner) if owner.is_none() => *owner = Some(index),
                    _ => return Err(Status::InvalidNumber),
                }
            }
            schedulers.push(SchedulerInstance::new(
                index,
                scheduler.name,
                scheduler.processors,
                scheduler.policy,
            ));
        }

        let (node, nodes) = (config.local_node, config.maximum_nodes);
        let system = Self {
            cpus: (0..count).map(PerCpu::new).collect(),
            cpu_scheduler,
            schedulers,
            allocator: ObjectsAllocator::new(),
            internal_threads: Information::new(
                Api::Internal,
                InternalClass::Threads as u8,
                &config.internal_threads,
                node,
                nodes,
            ),
            classic_tasks: Information::new(
                Api::Classic,
                ClassicClass::Tasks as u8,
                &config.classic_tasks,
                node,
                nodes,
            ),
            posix_threads: Information::new(
                Api::Posix,
                PosixClass::Threads as u8,
                &config.posix_threads,
                node,
                nodes,
            ),
            watchdogs: Watchdogs::new(),
            zombies: sync::IsrLock::new("Zombies", Vec::new()),
            retired: sync::IsrLock::new("Retired", Vec::new()),
            extensions: sync::IsrLock::new("User Extensions", Vec::new()),
            port,
            ticks_per_timeslice: config.ticks_per_timeslice,
            api_extension_slots: config.api_extension_slots,
            minimum_stack_size: config.minimum_stack_size,
        };
        log::debug!(
            "system: {} processors, {} scheduler instances, node {}",
            count,
            system.schedulers.len(),
            node
        );
        Ok(system)
    }

    // -- accessors ------------------------------------------------------------

    pub fn processor_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn per_cpu(&self, cpu: usize) -> Option<&PerCpu> {
        self.cpus.get(cpu)
    }

    pub fn scheduler(&self, index: usize) -> Option<&SchedulerInstance> {
        self.schedulers.get(index)
    }

    pub fn allocator(&self) -> &ObjectsAllocator {
        &self.allocator
    }

    pub fn watchdogs(&self) -> &Watchdogs {
        &self.watchdogs
    }

    /// Thread class of `api`.
    pub fn information(&self, api: u8) -> Option<&Information<ThreadControl>> {
        match Api::from_u8(api)? {
            Api::Internal => Some(&self.internal_threads),
            Api::Classic => Some(&self.classic_tasks),
            Api::Posix => Some(&self.posix_threads),
        }
    }

    fn current_cpu(&self) -> &PerCpu {
        let index = self.port.current_processor().min(self.cpus.len() - 1);
        &self.cpus[index]
    }

    /// Defers dispatching on the calling processor until the guard drops.
    pub fn disable_dispatch(&self) -> DispatchDisableGuard<'_> {
        self.current_cpu().disable_dispatch(self)
    }

    /// Thread executing on the calling processor.
    pub fn executing(&self) -> Option<ObjectId> {
        self.current_cpu().executing()
    }

    fn executing_thread(&self) -> Option<Arc<ThreadControl>> {
        self.executing().and_then(|id| self.thread_any(id))
    }

    fn is_executing(&self, id: ObjectId) -> bool {
        self.cpus.iter().any(|cpu| cpu.executing() == Some(id))
    }

    /// Published thread `id`.
    fn lookup_thread(&self, id: ObjectId) -> KernelResult<Arc<ThreadControl>> {
        self.information(id.api())
            .and_then(|information| information.get_no_protection(id))
            .ok_or(Status::InvalidId)
    }

    /// Thread `id`, including terminated ones still referenced by the
    /// system.
    fn thread_any(&self, id: ObjectId) -> Option<Arc<ThreadControl>> {
        if let Some(thread) = self
            .information(id.api())
            .and_then(|information| information.get_no_protection(id))
        {
            return Some(thread);
        }
        let find = |list: &mut Vec<Arc<ThreadControl>>| list.iter().find(|thread| thread.id() == id).cloned();
        self.zombies.with(find).or_else(|| self.retired.with(find))
    }

    /// Resolves a published thread and disables dispatching on the calling
    /// processor while the guard lives.
    pub fn get_thread(&self, id: ObjectId) -> Result<ObjectGuard<'_, ThreadControl>, LookupError> {
        let information = self.information(id.api()).ok_or(LookupError::InvalidId)?;
        match information.get(id, self.current_cpu(), self)? {
            Located::Local(guard) => Ok(guard),
            Located::Remote(_) => Err(LookupError::InvalidId),
        }
    }

    /// Outcome of the last blocking operation of the executing thread.
    pub fn wait_result(&self) -> Option<(Status, usize)> {
        self.executing_thread().map(|thread| thread.wait().result())
    }

    pub fn add_extension(&self, extension: Arc<dyn UserExtension>) {
        self.extensions.with(|extensions| extensions.push(extension));
    }

    fn extensions(&self) -> Vec<Arc<dyn UserExtension>> {
        self.extensions.with(|extensions| extensions.clone())
    }

    // -- scheduling -------------------------------------------------------------

    fn for_each_node(
        &self,
        nodes: &SchedulerNodeSet,
        f: impl Fn(&mut dyn SchedulerPolicy, &SchedulerNode),
    ) {
        for node in nodes.own_scheduler_nodes() {
            if let Some(instance) = self.schedulers.get(node.scheduler()) {
                instance.with_policy(|policy| f(policy, &node));
            }
        }
    }

    /// Adds state bits. A thread that stops being ready leaves its
    /// schedulers. Returns the previous state.
    fn set_state(&self, thread: &ThreadControl, state: States) -> States {
        let previous = {
            let mut current = thread.state.acquire();
            let previous = current.current_state;
            current.current_state |= state;
            if previous.is_ready() && !state.is_empty() {
                let nodes = thread.nodes.acquire();
                self.for_each_node(&nodes, |policy, node| policy.block(node));
            }
            previous
        };
        self.update_heirs();
        previous
    }

    /// Removes state bits. A thread that becomes ready joins its
    /// schedulers. Returns the previous state.
    fn clear_state(&self, thread: &ThreadControl, state: States) -> States {
        let previous = {
            let mut current = thread.state.acquire();
            let previous = current.current_state;
            if previous.intersects(state) {
                current.current_state.remove(state);
                if current.current_state.is_ready() {
                    let nodes = thread.nodes.acquire();
                    self.for_each_node(&nodes, |policy, node| policy.ready(node));
                }
            }
            previous
        };
        self.update_heirs();
        previous
    }

    fn update_node_priorities(&self, thread: &ThreadControl, priority: Priority) {
        let mut nodes = thread.nodes.acquire();
        nodes.set_priority(priority);
        self.for_each_node(&nodes, |policy, node| policy.update_priority(node));
    }

    /// Applies queued helping-node changes of `thread`.
    fn apply_node_requests(&self, thread: &ThreadControl) {
        let state = thread.state.acquire();
        let mut nodes = thread.nodes.acquire();
        if !nodes.has_pending_requests() {
            return;
        }
        let ready = state.current_state.is_ready();
        for (scheduler, request) in nodes.drain_requests() {
            let (Some(node), Some(instance)) = (nodes.node(scheduler), self.schedulers.get(scheduler)) else {
                continue;
            };
            match request {
                NodeRequest::Add if ready => instance.with_policy(|policy| policy.enqueue(node)),
                NodeRequest::Remove => instance.with_policy(|policy| policy.extract(node)),
                _ => {}
            }
        }
    }

    /// Recomputes the heir of every processor and dispatches where allowed.
    pub fn update_heirs(&self) {
        let mut taken = Vec::new();
        let mut fixed = ProcessorMask::empty();
        for cpu in &self.cpus {
            let Some(id) = cpu.executing() else {
                continue;
            };
            let keeps = self.thread_any(id).is_some_and(|thread| {
                thread
                    .state
                    .with(|state| !state.is_preemptible && state.current_state.is_ready())
            });
            if keeps {
                fixed = fixed.with(cpu.index());
                taken.push(id);
                cpu.set_heir(Some(id));
            }
        }

        for instance in &self.schedulers {
            let processors = instance.processors().difference(fixed);
            if processors.is_empty() {
                continue;
            }
            let heirs = instance.with_policy(|policy| policy.heirs(processors, &taken));
            for (cpu, heir) in heirs {
                if let Some(id) = heir {
                    taken.push(id);
                }
                if let Some(percpu) = self.cpus.get(cpu) {
                    percpu.set_heir(heir);
                }
            }
        }

        for cpu in &self.cpus {
            if cpu.is_dispatching_allowed() && cpu.is_dispatch_necessary() {
                self.dispatch(cpu.index());
            }
        }
    }

    /// Drops retired threads no processor executes any more. Called before
    /// a new dispatch, once the switch away from them has happened.
    fn release_retired(&self) {
        let released: Vec<Arc<ThreadControl>> = self.retired.with(|retired| {
            let (done, busy): (Vec<_>, Vec<_>) = core::mem::take(retired)
                .into_iter()
                .partition(|thread| !self.is_executing(thread.id()));
            *retired = busy;
            done
        });
        for thread in released {
            log::trace!("thread {} released", thread.id());
        }
    }

    /// Releases the last system reference of a terminated thread.
    fn release(&self, thread: Arc<ThreadControl>) {
        if self.is_executing(thread.id()) {
            self.retired.with(|retired| retired.push(thread));
        }
    }

    pub fn yield_processor(&self) -> KernelResult<()> {
        let thread = self.executing_thread().ok_or(Status::IncorrectState)?;
        self.yield_thread(&thread);
        Ok(())
    }

    fn yield_thread(&self, thread: &ThreadControl) {
        thread.nodes.with(|nodes| {
            self.for_each_node(nodes, |policy, node| policy.yield_node(node));
        });
        self.update_heirs();
    }

    /// Enters multitasking: every processor switches to its first heir.
    pub fn start_multitasking(&self) {
        log::info!("system: start multitasking");
        self.update_heirs();
    }

    // -- creation -------------------------------------------------------------

    /// Creates a dormant thread.
    pub fn create_thread(&self, config: ThreadConfig) -> KernelResult<ObjectId> {
        let information = self.information(config.api as u8).ok_or(Status::InvalidId)?;
        let instance = self.schedulers.get(config.scheduler).ok_or(Status::InvalidNumber)?;
        if config.priority > instance.maximum_priority() {
            return Err(Status::InvalidPriority);
        }
        if !config.name.matches_mode(information.name_mode()) {
            return Err(Status::InvalidName);
        }
        let affinity = config
            .affinity
            .unwrap_or(instance.processors())
            .intersection(instance.processors());
        if affinity.is_empty() {
            return Err(Status::InvalidNumber);
        }

        let stack = StackArea::new(config.stack_size.max(self.minimum_stack_size)).ok_or(Status::NoMemory)?;

        let lock = self.allocator.lock(self);
        let id = information.allocate(&lock).ok_or(Status::TooMany)?;

        let mut nodes = SchedulerNodeSet::new(id, self.schedulers.len());
        nodes.attach_home(config.scheduler, config.priority, affinity);
        nodes.set_affinity(affinity);
        for (index, scheduler) in self.schedulers.iter().enumerate() {
            if let Some(node) = nodes.node_mut(index) {
                scheduler.with_policy(|policy| policy.node_initialize(node, config.priority));
            }
        }

        let thread = Arc::new(ThreadControl::new(
            id,
            &config,
            stack,
            nodes,
            self.ticks_per_timeslice,
            self.api_extension_slots,
        ));

        let accepted = self
            .extensions()
            .iter()
            .fold(true, |accepted, extension| extension.thread_create(&thread) && accepted);
        if !accepted {
            information.free(&lock, id);
            log::warn!("thread {}: creation vetoed by a user extension", id);
            return Err(Status::Unsatisfied);
        }

        information.open(thread, config.name);
        drop(lock);
        log::debug!("thread {} created, priority {}", id, config.priority);
        Ok(id)
    }

    /// Makes a dormant thread ready to execute `entry`.
    pub fn start_thread(&self, id: ObjectId, entry: ThreadEntry) -> KernelResult<()> {
        let thread = self.lookup_thread(id)?;
        thread.state.with(|state| {
            if !state.current_state.is_dormant() {
                return Err(Status::IncorrectState);
            }
            state.entry = entry;
            Ok(())
        })?;

        let start = thread.start();
        self.port
            .initialize_context(id, thread.context(), &start.stack, start.is_fp);
        for extension in self.extensions() {
            extension.thread_start(&thread);
        }
        self.clear_state(&thread, States::DORMANT);
        log::debug!("thread {} started", id);
        Ok(())
    }

    /// Runs the body of the executing thread and exits with its result.
    pub fn execute_thread_body(&self) -> KernelResult<()> {
        let thread = self.executing_thread().ok_or(Status::IncorrectState)?;
        let exit_value = match thread.entry() {
            ThreadEntry::Idle => return Ok(()),
            ThreadEntry::Numeric { entry, argument } => {
                entry(argument);
                0
            }
            ThreadEntry::Pointer { entry, argument } => entry(argument),
        };
        self.exit(exit_value)
    }

    // -- life cycle -------------------------------------------------------------

    /// Restarts thread `id` with a new entry argument. Deferred while the
    /// thread is protected.
    pub fn restart(&self, id: ObjectId, argument: usize) -> KernelResult<()> {
        let thread = self.lookup_thread(id)?;
        thread.state.with(|state| {
            if state.current_state.is_dormant() || state.life.state.is_terminating() {
                return Err(Status::IncorrectState);
            }
            state.entry = state.entry.with_argument(argument);
            Ok(())
        })?;
        self.request_life_change(&thread, LifeState::RESTARTING, None);
        Ok(())
    }

    /// Terminates thread `id` and releases it without a join.
    pub fn delete(&self, id: ObjectId) -> KernelResult<()> {
        let thread = self.lookup_thread(id)?;
        self.request_life_change(&thread, LifeState::TERMINATING | LifeState::DETACHED, None);
        Ok(())
    }

    /// Terminates thread `id` with exit value [`THREAD_CANCELED`].
    pub fn cancel(&self, id: ObjectId) -> KernelResult<()> {
        let thread = self.lookup_thread(id)?;
        self.request_life_change(&thread, LifeState::TERMINATING, Some(THREAD_CANCELED));
        Ok(())
    }

    /// Terminates the executing thread. Protection and deferred changes do
    /// not delay it.
    pub fn exit(&self, exit_value: usize) -> KernelResult<()> {
        let thread = self.executing_thread().ok_or(Status::IncorrectState)?;
        let ignore = LifeState::PROTECTED | LifeState::CHANGE_DEFERRED;
        let due = thread.state.with(|state| {
            state.life.exit_value = exit_value;
            state.life.state |= LifeState::TERMINATING;
            state.life.is_action_due(ignore)
        });
        if due {
            self.run_life_actions(&thread, ignore);
        }
        Ok(())
    }

    /// Changes the life state of the executing thread and carries out a
    /// pending action that became due. Returns the previous life state.
    pub fn change_life(&self, clear: LifeState, set: LifeState, ignore: LifeState) -> LifeState {
        match self.executing_thread() {
            Some(thread) => self.change_life_of(&thread, clear, set, ignore),
            None => LifeState::NONE,
        }
    }

    /// Carries out a pending cancellation even while changes are deferred.
    pub fn test_cancel(&self) {
        self.change_life(LifeState::NONE, LifeState::NONE, LifeState::CHANGE_DEFERRED);
    }

    /// Protects the executing thread against restart and termination.
    /// Returns whether it was protected before.
    pub fn enter_protected(&self) -> bool {
        self.set_life_protection(true)
    }

    /// Drops the protection of the executing thread; a deferred action runs
    /// now. Returns whether it was protected before.
    pub fn exit_protected(&self) -> bool {
        self.set_life_protection(false)
    }

    pub fn set_life_protection(&self, protect: bool) -> bool {
        let set = if protect {
            LifeState::PROTECTED
        } else {
            LifeState::NONE
        };
        self.change_life(LifeState::PROTECTED, set, LifeState::NONE)
            .contains(LifeState::PROTECTED)
    }

    fn change_life_of(
        &self,
        thread: &Arc<ThreadControl>,
        clear: LifeState,
        set: LifeState,
        ignore: LifeState,
    ) -> LifeState {
        let (previous, due) = thread.state.with(|state| {
            let previous = state.life.change(clear, set);
            (previous, state.life.is_action_due(ignore))
        });
        if due {
            self.run_life_actions(thread, ignore);
        }
        previous
    }

    fn request_life_change(&self, thread: &Arc<ThreadControl>, set: LifeState, exit_value: Option<usize>) {
        let due = thread.state.with(|state| {
            state.life.pending_life_change_requests += 1;
            state.life.state |= set;
            if let Some(value) = exit_value {
                state.life.exit_value = value;
            }
            state.life.is_action_due(LifeState::NONE)
        });
        if due {
            self.run_life_actions(thread, LifeState::NONE);
        } else {
            log::trace!("thread {}: life change deferred", thread.id());
            // A suspended thread must run to reach its deferral point.
            self.clear_state(thread, States::SUSPENDED);
        }
    }

    /// Carries out due life actions until none is left. Termination wins
    /// over a restart requested at the same time.
    fn run_life_actions(&self, thread: &Arc<ThreadControl>, ignore: LifeState) {
        let _dispatch = self.disable_dispatch();
        loop {
            let action = thread.state.with(|state| {
                if !state.life.is_action_due(ignore) {
                    return None;
                }
                state.life.state |= LifeState::PROTECTED;
                Some(if state.life.state.is_terminating() {
                    LifeAction::Terminate
                } else {
                    LifeAction::Restart
                })
            });
            let Some(action) = action else {
                break;
            };

            self.set_state(thread, States::LIFE_IS_CHANGING);
            self.extract_from_queue(thread, None, None);
            thread.wait().tranquilize();
            debug_assert!(
                !thread.wait().has_pending_requests(),
                "life change with pending wait lock requests"
            );

            match action {
                LifeAction::Terminate => {
                    self.terminate_now(thread);
                    break;
                }
                LifeAction::Restart => self.restart_now(thread),
            }
        }
    }

    fn restart_now(&self, thread: &Arc<ThreadControl>) {
        let id = thread.id();
        let start = thread.start();
        self.watchdogs.remove(thread.timer(), id);

        let priority = thread.state.with(|state| {
            state.real_priority = start.initial_priority;
            state.priority = start.initial_priority;
            state.budget = CpuBudget::new(start.budget_algorithm, self.ticks_per_timeslice);
            state.is_preemptible = start.is_preemptible;
            state.life.state.remove(LifeState::PROTECTED | LifeState::RESTARTING);
            state.life.pending_life_change_requests = 0;
            state.priority
        });
        self.update_node_priorities(thread, priority);
        thread.wait().set_flags(WAIT_STATE_READY);

        self.port
            .initialize_context(id, thread.context(), &start.stack, start.is_fp);
        if let Some(cpu) = self.cpus.iter().find(|cpu| cpu.executing() == Some(id)) {
            // The old context is discarded, not saved.
            self.port
                .restore_context(cpu.index(), Some(id), Some(thread.context()));
            self.port.request_dispatch(cpu.index());
        }
        thread.count_restart();

        for extension in self.extensions() {
            extension.thread_restart(thread);
        }
        self.clear_state(
            thread,
            States::BLOCKED | States::SUSPENDED | States::LIFE_IS_CHANGING,
        );
        log::debug!("thread {} restarted", id);
    }

    fn terminate_now(&self, thread: &Arc<ThreadControl>) {
        let id = thread.id();
        self.set_state(thread, States::ZOMBIE);
        self.watchdogs.remove(thread.timer(), id);
        thread.nodes.with(|nodes| {
            self.for_each_node(nodes, |policy, node| policy.extract(node));
        });
        let (detached, exit_value) = thread.state.with(|state| {
            state.current_state = States::ZOMBIE;
            state.life.pending_life_change_requests = 0;
            (state.life.state.is_detached(), state.life.exit_value)
        });

        for extension in self.extensions() {
            extension.thread_terminate(thread);
        }

        // A joinable zombie keeps its slot reserved, so the identifier is
        // not handed out again before the zombie is gone.
        if let Some(information) = self.information(id.api()) {
            let lock = self.allocator.lock(self);
            information.close(thread);
            if detached {
                information.free(&lock, id);
            }
        }

        // Publish the zombie before waking joiners: a joiner that enqueues
        // after the flush finds it there.
        if !detached {
            self.zombies.with(|zombies| zombies.push(thread.clone()));
        }
        let joiners = self.thread_queue_flush(thread.join_queue(), Status::Successful, exit_value);
        if detached {
            self.release(thread.clone());
        } else if joiners > 0 {
            if let Some(zombie) = self.take_zombie(id) {
                self.release_zombie(zombie);
            }
        }
        log::debug!("thread {} terminated, exit value {:#x}", id, exit_value);
    }

    /// Frees the slot of a zombie taken off the zombie list and releases
    /// it. Returns its exit value.
    fn release_zombie(&self, zombie: Arc<ThreadControl>) -> usize {
        let id = zombie.id();
        if let Some(information) = self.information(id.api()) {
            let lock = self.allocator.lock(self);
            information.free(&lock, id);
        }
        let exit_value = zombie.life().exit_value;
        self.release(zombie);
        exit_value
    }

    fn take_zombie(&self, id: ObjectId) -> Option<Arc<ThreadControl>> {
        self.zombies.with(|zombies| {
            let at = zombies.iter().position(|zombie| zombie.id() == id)?;
            Some(zombies.swap_remove(at))
        })
    }

    /// Lets thread `id` release its resources at termination without a
    /// join. An already terminated thread is released now.
    pub fn detach(&self, id: ObjectId) -> KernelResult<()> {
        if let Some(zombie) = self.take_zombie(id) {
            self.release_zombie(zombie);
            return Ok(());
        }
        let thread = self.lookup_thread(id)?;
        let previous = thread
            .state
            .with(|state| state.life.change(LifeState::NONE, LifeState::DETACHED));
        if previous.is_detached() {
            return Err(Status::IncorrectState);
        }
        Ok(())
    }

    /// Waits for thread `id` to terminate and yields its exit value.
    ///
    /// When the executing thread blocks, the exit value arrives as the
    /// argument of its wait result.
    pub fn join(&self, id: ObjectId) -> KernelResult<Outcome<usize>> {
        let joiner = self.executing_thread().ok_or(Status::IncorrectState)?;
        if joiner.id() == id {
            return Err(Status::Deadlock);
        }
        if let Some(zombie) = self.take_zombie(id) {
            return Ok(Outcome::Done(self.release_zombie(zombie)));
        }
        let target = match self.lookup_thread(id) {
            Ok(target) => target,
            Err(err) => {
                return self
                    .take_zombie(id)
                    .map(|zombie| Outcome::Done(self.release_zombie(zombie)))
                    .ok_or(err);
            }
        };
        if target.life().state.is_detached() {
            return Err(Status::IncorrectState);
        }

        self.block_on(&joiner, target.join_queue(), NO_TIMEOUT);

        // The target may have terminated between the lookup and the
        // enqueue, flushing an empty join queue.
        if let Some(zombie) = self.take_zombie(id) {
            let exit_value = self.release_zombie(zombie);
            self.extract_from_queue(&joiner, Some((Status::Successful, exit_value)), Some(target.join_queue()));
            return Ok(Outcome::Done(exit_value));
        }
        Ok(Outcome::Blocked)
    }

    // -- thread control ---------------------------------------------------------

    pub fn suspend(&self, id: ObjectId) -> KernelResult<()> {
        let thread = self.lookup_thread(id)?;
        if self.set_state(&thread, States::SUSPENDED).is_suspended() {
            return Err(Status::IncorrectState);
        }
        Ok(())
    }

    pub fn resume(&self, id: ObjectId) -> KernelResult<()> {
        let thread = self.lookup_thread(id)?;
        if !self.clear_state(&thread, States::SUSPENDED).is_suspended() {
            return Err(Status::IncorrectState);
        }
        Ok(())
    }

    /// Sets the real priority of thread `id`, returning the previous one.
    pub fn set_priority(&self, id: ObjectId, priority: Priority) -> KernelResult<Priority> {
        let thread = self.lookup_thread(id)?;
        let instance = self
            .schedulers
            .get(thread.home_scheduler())
            .ok_or(Status::InvalidId)?;
        if priority > instance.maximum_priority() {
            return Err(Status::InvalidPriority);
        }

        let previous = thread.state.with(|state| {
            let previous = state.real_priority;
            state.real_priority = priority;
            state.priority = priority;
            previous
        });
        self.update_node_priorities(&thread, priority);

        sync::critical_section(|_| {
            let request = thread.wait().acquire();
            if let Some(queue) = request.queue().cloned() {
                let mut heads = queue.acquire();
                if !request.is_stale() {
                    thread
                        .wait()
                        .operations()
                        .priority_actions(&mut heads, id, priority);
                }
            }
        });

        self.update_heirs();
        log::trace!("thread {}: priority {} -> {}", id, previous, priority);
        Ok(previous)
    }

    pub fn set_affinity(&self, id: ObjectId, affinity: ProcessorMask) -> KernelResult<()> {
        let thread = self.lookup_thread(id)?;
        let instance = self
            .schedulers
            .get(thread.home_scheduler())
            .ok_or(Status::InvalidId)?;
        let affinity = affinity.intersection(instance.processors());
        if affinity.is_empty() {
            return Err(Status::InvalidNumber);
        }
        thread.nodes.with(|nodes| {
            nodes.set_affinity(affinity);
            self.for_each_node(nodes, |policy, node| policy.update_priority(node));
        });
        self.update_heirs();
        Ok(())
    }

    /// Moves thread `id` to another home scheduler instance.
    pub fn set_scheduler(&self, id: ObjectId, scheduler: usize, priority: Priority) -> KernelResult<()> {
        let thread = self.lookup_thread(id)?;
        let instance = self.schedulers.get(scheduler).ok_or(Status::InvalidNumber)?;
        if priority > instance.maximum_priority() {
            return Err(Status::InvalidPriority);
        }

        {
            let mut state = thread.state.acquire();
            let mut nodes = thread.nodes.acquire();
            if nodes.wait_nodes().count() > 1 || nodes.helping_nodes() > 0 || nodes.is_pinned() {
                return Err(Status::ResourceInUse);
            }

            let ready = state.current_state.is_ready();
            if ready {
                self.for_each_node(&nodes, |policy, node| policy.block(node));
            }

            let mut affinity = nodes.affinity().intersection(instance.processors());
            if affinity.is_empty() {
                affinity = instance.processors();
            }
            nodes.attach_home(scheduler, priority, affinity);
            nodes.set_affinity(affinity);
            nodes.set_priority(priority);
            if let Some(node) = nodes.node_mut(scheduler) {
                instance.with_policy(|policy| policy.node_initialize(node, priority));
            }
            state.real_priority = priority;
            state.priority = priority;

            if ready {
                self.for_each_node(&nodes, |policy, node| policy.ready(node));
            }
        }

        self.update_heirs();
        log::debug!("thread {}: home scheduler {}", id, instance.name());
        Ok(())
    }

    /// Delays the executing thread for `ticks` clock ticks. Zero yields.
    pub fn wake_after(&self, ticks: Interval) -> KernelResult<()> {
        let thread = self.executing_thread().ok_or(Status::IncorrectState)?;
        if ticks == 0 {
            self.yield_thread(&thread);
            return Ok(());
        }
        let _dispatch = self.disable_dispatch();
        self.watchdogs.insert(thread.timer(), thread.id(), ticks);
        self.set_state(&thread, States::WAITING_FOR_TIME);
        Ok(())
    }

    // -- helping and pinning ----------------------------------------------------

    pub fn add_helping_scheduler(&self, id: ObjectId, scheduler: usize) -> KernelResult<()> {
        self.request_node_change(id, scheduler, NodeRequest::Add)
    }

    pub fn remove_helping_scheduler(&self, id: ObjectId, scheduler: usize) -> KernelResult<()> {
        self.request_node_change(id, scheduler, NodeRequest::Remove)
    }

    /// Queues a node change. The processor executing the thread applies
    /// it; a thread that does not execute gets it applied now.
    fn request_node_change(&self, id: ObjectId, scheduler: usize, request: NodeRequest) -> KernelResult<()> {
        let thread = self.lookup_thread(id)?;
        if scheduler >= self.schedulers.len() {
            return Err(Status::InvalidNumber);
        }
        let cpu = thread.nodes.with(|nodes| {
            if scheduler == nodes.home() {
                return Err(Status::IncorrectState);
            }
            nodes.request_change(scheduler, request);
            Ok(nodes.cpu())
        })?;

        match cpu {
            Some(cpu) if cpu != self.current_cpu().index() => self.port.request_dispatch(cpu),
            _ => {
                self.apply_node_requests(&thread);
                self.update_heirs();
            }
        }
        Ok(())
    }

    pub fn add_wait_node(&self, id: ObjectId, node: NodeRef) -> KernelResult<()> {
        let thread = self.lookup_thread(id)?;
        thread.nodes.with(|nodes| nodes.add_wait_node(node));
        Ok(())
    }

    pub fn remove_wait_node(&self, id: ObjectId, node: NodeRef) -> KernelResult<bool> {
        let thread = self.lookup_thread(id)?;
        Ok(thread.nodes.with(|nodes| nodes.remove_wait_node(node)))
    }

    /// Keeps the executing thread on its processor's scheduler instance.
    pub fn pin(&self) {
        if let Some(thread) = self.executing_thread() {
            thread.nodes.with(|nodes| nodes.pin());
        }
    }

    pub fn unpin(&self) {
        let Some(thread) = self.executing_thread() else {
            return;
        };
        let released = thread.nodes.with(|nodes| {
            let released = nodes.unpin();
            if released {
                nodes.set_pinned(None);
            }
            released
        });
        if released {
            self.update_heirs();
        }
    }

    // -- thread queues ----------------------------------------------------------

    /// Blocks `thread` on `queue`, optionally with a timeout.
    pub(crate) fn block_on(&self, thread: &Arc<ThreadControl>, queue: &Arc<ThreadQueue>, timeout: Interval) {
        let _dispatch = self.disable_dispatch();
        let wait = thread.wait();
        let priority = thread.priority();
        wait.set_result(Status::Successful, 0);
        wait.set_flags(WAIT_CLASS_OBJECT | WAIT_STATE_INTEND_TO_BLOCK);
        {
            let mut heads = queue.acquire();
            wait.claim(queue, queue.operations());
            queue.operations().enqueue(&mut heads, thread.id(), priority);
        }
        if timeout != NO_TIMEOUT {
            self.watchdogs.insert(thread.timer(), thread.id(), timeout);
        }
        self.set_state(thread, queue.state());

        let committed = wait.try_change_flags(
            WAIT_CLASS_OBJECT | WAIT_STATE_INTEND_TO_BLOCK,
            WAIT_CLASS_OBJECT | WAIT_STATE_BLOCKED,
        );
        if !committed {
            // Woken before the block was committed.
            wait.tranquilize();
            self.watchdogs.remove(thread.timer(), thread.id());
            self.clear_state(thread, States::BLOCKED);
        }
    }

    /// Blocks the executing thread on `queue`.
    pub fn thread_queue_enqueue(&self, queue: &Arc<ThreadQueue>, timeout: Interval) -> KernelResult<()> {
        let thread = self.executing_thread().ok_or(Status::IncorrectState)?;
        self.block_on(&thread, queue, timeout);
        Ok(())
    }

    /// Removes `thread` from the queue it waits on and unblocks it. With
    /// `expected`, only a wait on that queue qualifies. Returns `false` when
    /// the thread waits on nothing or another party got to it first.
    fn extract_from_queue(
        &self,
        thread: &ThreadControl,
        result: Option<(Status, usize)>,
        expected: Option<&Arc<ThreadQueue>>,
    ) -> bool {
        let extracted = sync::critical_section(|_| {
            let wait = thread.wait();
            let request = wait.acquire();
            let Some(queue) = request.queue().cloned() else {
                return false;
            };
            if expected.is_some_and(|expected| !Arc::ptr_eq(expected, &queue)) {
                return false;
            }
            let mut heads = queue.acquire();
            if request.is_stale() {
                log::trace!("thread {}: stale wait lock request", thread.id());
                return false;
            }
            wait.operations().extract(&mut heads, thread.id());
            if let Some((code, argument)) = result {
                wait.set_result(code, argument);
            }
            wait.restore_default();
            true
        });
        if extracted {
            self.unblock_after_wait(thread);
        }
        extracted
    }

    fn unblock_after_wait(&self, thread: &ThreadControl) {
        let wait = thread.wait();
        if wait.try_change_flags(
            WAIT_CLASS_OBJECT | WAIT_STATE_INTEND_TO_BLOCK,
            WAIT_CLASS_OBJECT | WAIT_STATE_READY,
        ) {
            // The blocking thread has not committed and unblocks itself.
            return;
        }
        wait.set_flags(WAIT_CLASS_OBJECT | WAIT_STATE_READY);
        wait.tranquilize();
        self.watchdogs.remove(thread.timer(), thread.id());
        self.clear_state(thread, States::BLOCKED);
    }

    /// Wakes the first waiter of `queue` with the given result.
    pub fn thread_queue_surrender(&self, queue: &Arc<ThreadQueue>, code: Status, argument: usize) -> Option<ObjectId> {
        loop {
            let first = {
                let heads = queue.acquire();
                queue.operations().first(&heads)
            }?;
            match self.thread_any(first) {
                Some(thread) => {
                    if self.extract_from_queue(&thread, Some((code, argument)), Some(queue)) {
                        return Some(first);
                    }
                }
                None => {
                    let mut heads = queue.acquire();
                    queue.operations().extract(&mut heads, first);
                }
            }
        }
    }

    /// Wakes every waiter of `queue`. Returns how many were woken.
    pub fn thread_queue_flush(&self, queue: &Arc<ThreadQueue>, code: Status, argument: usize) -> usize {
        let mut woken = 0;
        while self.thread_queue_surrender(queue, code, argument).is_some() {
            woken += 1;
        }
        woken
    }

    /// Removes thread `id` from whatever queue it waits on, leaving its
    /// wait result untouched.
    pub fn thread_queue_extract(&self, id: ObjectId) -> bool {
        self.thread_any(id)
            .is_some_and(|thread| self.extract_from_queue(&thread, None, None))
    }

    // -- clock ------------------------------------------------------------------

    /// Announces one clock tick: expires timers and charges CPU budgets.
    pub fn clock_tick(&self) {
        self.release_retired();
        for (deadline, id) in self.watchdogs.tick() {
            let Some(thread) = self.thread_any(id) else {
                continue;
            };
            if self.watchdogs.fire(thread.timer(), deadline) {
                log::trace!("thread {}: timeout", id);
                self.timeout(&thread);
            }
        }

        for cpu in &self.cpus {
            let Some(thread) = cpu.executing().and_then(|id| self.thread_any(id)) else {
                continue;
            };
            let tick = thread.state.with(|state| {
                let preemptible = state.is_preemptible && state.current_state.is_ready();
                state.budget.at_tick(preemptible)
            });
            match tick {
                BudgetTick::Continue => {}
                BudgetTick::Yield => self.yield_thread(&thread),
                BudgetTick::Callout(callout) => callout(thread.id()),
            }
            if thread.nodes.with(|nodes| nodes.has_pending_requests()) {
                self.apply_node_requests(&thread);
                self.update_heirs();
            }
        }
    }

    fn timeout(&self, thread: &ThreadControl) {
        if self.extract_from_queue(thread, Some((Status::Timeout, 0)), None) {
            return;
        }
        if thread.current_state().contains(States::WAITING_FOR_TIME) {
            self.clear_state(thread, States::WAITING_FOR_TIME);
        }
    }

    // -- queries ----------------------------------------------------------------

    /// Visits every published thread of every API until `visitor` returns
    /// `false`.
    pub fn iterate_threads(&self, mut visitor: impl FnMut(&Arc<ThreadControl>) -> bool) {
        for information in [&self.internal_threads, &self.classic_tasks, &self.posix_threads] {
            for thread in information.objects() {
                if !visitor(&thread) {
                    return;
                }
            }
        }
    }

    pub fn id_to_name(&self, id: ObjectId) -> Result<ObjectName, LookupError> {
        self.information(id.api())
            .ok_or(LookupError::InvalidId)?
            .id_to_name(id)
    }

    pub fn name_to_id(&self, api: Api, name: &ObjectName, scope: NodeScope) -> Result<ObjectId, LookupError> {
        self.information(api as u8)
            .ok_or(LookupError::InvalidId)?
            .name_to_id(name, scope)
    }

    pub fn set_name(&self, id: ObjectId, name: ObjectName) -> KernelResult<()> {
        let thread = self.lookup_thread(id)?;
        let information = self.information(id.api()).ok_or(Status::InvalidId)?;
        information.set_name(&thread, name)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dispatching
// ---------------------------------------------------------------------------

impl ThreadDispatch for System {
    fn dispatch(&self, cpu: usize) {
        let Some(percpu) = self.cpus.get(cpu) else {
            return;
        };
        if !percpu.is_dispatching_allowed() {
            return;
        }
        self.release_retired();

        while percpu.take_dispatch_necessary() {
            let executing = percpu.executing();
            let heir = percpu.heir();
            if executing == heir {
                continue;
            }

            if let Some(thread) = executing.and_then(|id| self.thread_any(id)) {
                self.port.save_context(cpu, thread.id(), thread.context());
                let preempted = thread.state.with(|state| state.current_state.is_ready());
                let scheduler = self.cpu_scheduler.get(cpu).copied().flatten();
                thread.nodes.with(|nodes| {
                    nodes.set_cpu(None);
                    if preempted && nodes.is_pinned() {
                        nodes.mark_preempted();
                        if nodes.pinned().is_none() {
                            nodes.set_pinned(scheduler);
                        }
                    }
                });
            }

            for extension in self.extensions() {
                extension.thread_switch(cpu, executing, heir);
            }
            percpu.set_executing(heir);
            log::trace!("cpu {}: {:?} -> {:?}", cpu, executing, heir);

            match heir.and_then(|id| self.thread_any(id)) {
                Some(thread) => {
                    thread.state.with(|state| state.budget.at_context_switch());
                    thread.nodes.with(|nodes| nodes.set_cpu(Some(cpu)));
                    self.port
                        .restore_context(cpu, Some(thread.id()), Some(thread.context()));
                    self.apply_node_requests(&thread);
                }
                None => self.port.restore_context(cpu, None, None),
            }
            self.port.request_dispatch(cpu);
        }
    }
}

impl LifeProtection for System {
    /// Processor index in the upper half, raw thread identifier (zero when
    /// idle) in the lower half.
    fn current_owner(&self) -> LockOwner {
        let cpu = self.current_cpu();
        let thread = cpu.executing().map_or(0, |id| id.raw());
        ((cpu.index() as u64) << 32) | u64::from(thread)
    }

    fn set_life_protection(&self, owner: LockOwner, protect: bool) -> bool {
        let raw = owner as u32;
        if raw == 0 {
            return false;
        }
        let Some(thread) = self.thread_any(ObjectId::from_raw(raw)) else {
            return false;
        };
        let set = if protect {
            LifeState::PROTECTED
        } else {
            LifeState::NONE
        };
        self.change_life_of(&thread, LifeState::PROTECTED, set, LifeState::NONE)
            .contains(LifeState::PROTECTED)
    }
}

// ---------------------------------------------------------------------------
// Global instance
// ---------------------------------------------------------------------------

static SYSTEM: Once<System> = Once::new();

/// Builds the global system. Later calls return the first instance.
pub fn init(config: SystemConfig, port: Arc<dyn CpuPort>) -> KernelResult<&'static System> {
    SYSTEM.try_call_once(|| System::new(config, port))
}

/// The global system, once [`init`] succeeded.
pub fn system() -> Option<&'static System> {
    SYSTEM.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::host::{HostPort, PortEvent};
    use crate::config::{ClassConfig, SchedulerConfig};
    use crate::scheduler::priority::PriorityScheduler;
    use crate::thread::budget::CpuBudgetAlgorithm;
    use crate::threadq::{FIFO, PRIORITY};
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::thread as host;

    fn body(_: usize) {}

    fn doubled(argument: usize) -> usize {
        argument * 2
    }

    fn boot(config: SystemConfig) -> (System, Arc<HostPort>) {
        let port = Arc::new(HostPort::new());
        let system = System::new(config, port.clone()).unwrap();
        (system, port)
    }

    fn create(system: &System, name: u32, priority: Priority) -> ObjectId {
        system
            .create_thread(ThreadConfig::new(Api::Classic, ObjectName::U32(name), priority))
            .unwrap()
    }

    fn spawn(system: &System, name: u32, priority: Priority) -> ObjectId {
        let id = create(system, name, priority);
        system
            .start_thread(id, ThreadEntry::Numeric { entry: body, argument: 0 })
            .unwrap();
        id
    }

    fn tcb(system: &System, id: ObjectId) -> Arc<ThreadControl> {
        system.thread_any(id).unwrap()
    }

    fn queue(operations: &'static dyn crate::threadq::ThreadQueueOperations) -> Arc<ThreadQueue> {
        Arc::new(ThreadQueue::new("Test", States::WAITING_FOR_SEMAPHORE, operations))
    }

    #[test]
    fn test_create_start_dispatch() {
        let (system, port) = boot(SystemConfig::default());
        let a = create(&system, 1, 5);
        assert!(tcb(&system, a).current_state().is_dormant());
        assert_eq!(system.executing(), None);

        system
            .start_thread(a, ThreadEntry::Numeric { entry: body, argument: 0 })
            .unwrap();
        assert_eq!(system.executing(), Some(a));
        assert_eq!(port.switches(0), vec![Some(a)]);
        assert!(port.events().contains(&PortEvent::Initialize(a)));
        assert_eq!(
            system.start_thread(a, ThreadEntry::Idle),
            Err(Status::IncorrectState)
        );
    }

    #[test]
    fn test_creation_errors() {
        let mut config = SystemConfig::default();
        config.classic_tasks = ClassConfig::fixed(1);
        let (system, _port) = boot(config);

        let too_low = ThreadConfig::new(Api::Classic, ObjectName::U32(1), 256);
        assert_eq!(system.create_thread(too_low), Err(Status::InvalidPriority));

        let bad_scheduler = ThreadConfig::new(Api::Classic, ObjectName::U32(1), 1).scheduler(3);
        assert_eq!(system.create_thread(bad_scheduler), Err(Status::InvalidNumber));

        let bad_name = ThreadConfig::new(Api::Posix, ObjectName::U32(1), 1);
        assert_eq!(system.create_thread(bad_name), Err(Status::InvalidName));

        let bad_affinity = ThreadConfig::new(Api::Classic, ObjectName::U32(1), 1).affinity(ProcessorMask::single(3));
        assert_eq!(system.create_thread(bad_affinity), Err(Status::InvalidNumber));

        create(&system, 1, 1);
        let one_more = ThreadConfig::new(Api::Classic, ObjectName::U32(2), 1);
        assert_eq!(system.create_thread(one_more), Err(Status::TooMany));
        assert_eq!(system.allocator().nest_level(), 0);
    }

    #[test]
    fn test_invalid_system_config() {
        let port: Arc<dyn CpuPort> = Arc::new(HostPort::new());
        assert!(matches!(
            System::new(SystemConfig::with_processors(0), port.clone()),
            Err(Status::InvalidNumber)
        ));

        let mut overlapping = SystemConfig::with_processors(2);
        overlapping.schedulers.push(SchedulerConfig::new(
            "B",
            Box::new(PriorityScheduler::new()),
            ProcessorMask::single(1),
        ));
        assert!(matches!(System::new(overlapping, port.clone()), Err(Status::InvalidNumber)));

        let mut node = SystemConfig::default();
        node.local_node = 2;
        assert!(matches!(System::new(node, port), Err(Status::InvalidNode)));
    }

    #[test]
    fn test_priority_preemption() {
        let (system, _port) = boot(SystemConfig::default());
        let a = spawn(&system, 1, 5);
        let b = spawn(&system, 2, 2);
        assert_eq!(system.executing(), Some(b));

        assert_eq!(system.set_priority(a, 1), Ok(5));
        assert_eq!(system.executing(), Some(a));
        assert_eq!(system.set_priority(a, 300), Err(Status::InvalidPriority));
    }

    #[test]
    fn test_non_preemptible_keeps_processor() {
        let (system, _port) = boot(SystemConfig::default());
        let a = system
            .create_thread(ThreadConfig::new(Api::Classic, ObjectName::U32(1), 5).preemptible(false))
            .unwrap();
        system.start_thread(a, ThreadEntry::Idle).unwrap();
        let b = spawn(&system, 2, 1);
        assert_eq!(system.executing(), Some(a));

        system.wake_after(1).unwrap();
        assert_eq!(system.executing(), Some(b));
    }

    #[test]
    fn test_suspend_resume() {
        let (system, _port) = boot(SystemConfig::default());
        let a = spawn(&system, 1, 1);
        let b = spawn(&system, 2, 2);

        system.suspend(a).unwrap();
        assert_eq!(system.executing(), Some(b));
        assert_eq!(system.suspend(a), Err(Status::IncorrectState));

        system.resume(a).unwrap();
        assert_eq!(system.executing(), Some(a));
        assert_eq!(system.resume(a), Err(Status::IncorrectState));
    }

    #[test]
    fn test_wake_after_expires() {
        let (system, _port) = boot(SystemConfig::default());
        let a = spawn(&system, 1, 1);
        let b = spawn(&system, 2, 2);

        system.wake_after(2).unwrap();
        assert_eq!(system.executing(), Some(b));
        system.clock_tick();
        assert_eq!(system.executing(), Some(b));
        system.clock_tick();
        assert_eq!(system.executing(), Some(a));
        assert!(tcb(&system, a).current_state().is_ready());
    }

    #[test]
    fn test_timeslice_rotation() {
        let (system, _port) = boot(SystemConfig::default());
        let config = |name| {
            ThreadConfig::new(Api::Classic, ObjectName::U32(name), 5).budget(CpuBudgetAlgorithm::ResetTimeslice)
        };
        let a = system.create_thread(config(1)).unwrap();
        let b = system.create_thread(config(2)).unwrap();
        system.start_thread(a, ThreadEntry::Idle).unwrap();
        system.start_thread(b, ThreadEntry::Idle).unwrap();
        assert_eq!(system.executing(), Some(a));

        for _ in 0..crate::config::DEFAULT_TIME_SLICE {
            system.clock_tick();
        }
        assert_eq!(system.executing(), Some(b));
    }

    #[test]
    fn test_queue_surrender_and_flush() {
        let (system, _port) = boot(SystemConfig::default());
        let a = spawn(&system, 1, 1);
        let b = spawn(&system, 2, 2);
        let c = spawn(&system, 3, 3);
        let q = queue(&PRIORITY);

        system.thread_queue_enqueue(&q, NO_TIMEOUT).unwrap();
        assert_eq!(system.executing(), Some(b));
        system.thread_queue_enqueue(&q, NO_TIMEOUT).unwrap();
        assert_eq!(system.executing(), Some(c));
        assert_eq!(q.waiters(), vec![a, b]);

        assert_eq!(system.thread_queue_surrender(&q, Status::Successful, 7), Some(a));
        assert_eq!(system.executing(), Some(a));
        assert_eq!(system.wait_result(), Some((Status::Successful, 7)));

        assert_eq!(system.thread_queue_flush(&q, Status::ObjectWasDeleted, 0), 1);
        assert!(q.is_empty());
        assert_eq!(tcb(&system, b).wait().result(), (Status::ObjectWasDeleted, 0));
        assert!(!tcb(&system, b).wait().is_claimed());
    }

    #[test]
    fn test_blocking_timeout() {
        let (system, _port) = boot(SystemConfig::default());
        let a = spawn(&system, 1, 1);
        let b = spawn(&system, 2, 2);
        let q = queue(&FIFO);

        system.thread_queue_enqueue(&q, 1).unwrap();
        assert_eq!(system.executing(), Some(b));
        system.clock_tick();
        assert_eq!(system.executing(), Some(a));
        assert_eq!(system.wait_result(), Some((Status::Timeout, 0)));
        assert!(q.is_empty());
    }

    /// A timeout that races a held wait-lock request waits for the request
    /// to be released before the thread becomes ready.
    #[test]
    fn test_timeout_waits_for_stale_request() {
        let (system, _port) = boot(SystemConfig::default());
        let a = spawn(&system, 1, 1);
        let q = queue(&FIFO);
        system.thread_queue_enqueue(&q, 1).unwrap();
        let thread = tcb(&system, a);

        let request = thread.wait().acquire();
        assert!(request.queue().is_some());

        host::scope(|scope| {
            scope.spawn(|| system.clock_tick());

            while thread.wait().queue().is_some() {
                host::yield_now();
            }
            assert!(request.is_stale());
            assert!(thread.current_state().is_blocked());
            drop(request);
        });

        assert!(thread.current_state().is_ready());
        assert_eq!(thread.wait().result(), (Status::Timeout, 0));
        assert_eq!(system.executing(), Some(a));
        assert!(!system.thread_queue_extract(a));
        assert_eq!(system.thread_queue_surrender(&q, Status::Successful, 0), None);
    }

    #[test]
    fn test_deferred_delete_across_processors() {
        let (system, port) = boot(SystemConfig::with_processors(2));
        let t = spawn(&system, 1, 1);
        let u = spawn(&system, 2, 2);
        assert_eq!(system.per_cpu(0).unwrap().executing(), Some(t));
        assert_eq!(system.per_cpu(1).unwrap().executing(), Some(u));

        port.set_current(0);
        assert!(!system.enter_protected());

        port.set_current(1);
        system.delete(t).unwrap();
        let life = tcb(&system, t).life();
        assert_eq!(life.pending_life_change_requests, 1);
        assert!(life.state.is_terminating());
        assert!(system.get_thread(t).is_ok());

        port.set_current(0);
        assert!(system.exit_protected());
        assert!(matches!(system.get_thread(t), Err(err) if err.is_not_found()));
        assert!(!system.is_executing(t));
        system.clock_tick();
        assert!(system.thread_any(t).is_none());
    }

    #[test]
    fn test_deferred_cancel_type() {
        let (system, port) = boot(SystemConfig::with_processors(2));
        let t = spawn(&system, 1, 1);
        let u = spawn(&system, 2, 2);
        assert_eq!(system.per_cpu(1).unwrap().executing(), Some(u));

        port.set_current(0);
        let previous = system.change_life(LifeState::NONE, LifeState::CHANGE_DEFERRED, LifeState::NONE);
        assert!(!previous.contains(LifeState::CHANGE_DEFERRED));

        port.set_current(1);
        system.cancel(t).unwrap();
        let life = tcb(&system, t).life();
        assert!(life.state.is_terminating());
        assert_eq!(life.pending_life_change_requests, 1);
        assert!(system.get_thread(t).is_ok());
        assert_eq!(system.per_cpu(0).unwrap().executing(), Some(t));

        port.set_current(0);
        system.test_cancel();
        assert!(matches!(system.get_thread(t), Err(err) if err.is_not_found()));
        assert!(!system.is_executing(t));

        port.set_current(1);
        assert_eq!(system.join(t), Ok(Outcome::Done(THREAD_CANCELED)));

        // Protection defers even when the deferred type is ignored.
        assert!(!system.enter_protected());
        system.change_life(LifeState::NONE, LifeState::CHANGE_DEFERRED, LifeState::NONE);
        port.set_current(0);
        system.cancel(u).unwrap();

        port.set_current(1);
        system.test_cancel();
        assert!(system.get_thread(u).is_ok());
        assert!(tcb(&system, u).life().state.is_terminating());

        assert!(system.exit_protected());
        assert!(system.get_thread(u).is_ok());

        system.test_cancel();
        assert!(matches!(system.get_thread(u), Err(err) if err.is_not_found()));
    }

    #[test]
    fn test_deferred_restarts_collapse() {
        let (system, _port) = boot(SystemConfig::default());
        let t = spawn(&system, 1, 1);
        system.enter_protected();

        for argument in 0..3 {
            system.restart(t, argument).unwrap();
        }
        let thread = tcb(&system, t);
        assert_eq!(thread.life().pending_life_change_requests, 3);
        assert_eq!(thread.restarts(), 0);

        system.exit_protected();
        let life = thread.life();
        assert_eq!(thread.restarts(), 1);
        assert_eq!(life.pending_life_change_requests, 0);
        assert!(!life.state.intersects(LifeState::RESTARTING | LifeState::PROTECTED));
        assert!(matches!(thread.entry(), ThreadEntry::Numeric { argument: 2, .. }));
        assert_eq!(system.executing(), Some(t));
    }

    #[test]
    fn test_restart_blocked_thread() {
        let (system, port) = boot(SystemConfig::default());
        let a = spawn(&system, 1, 3);
        let _b = spawn(&system, 2, 4);
        let q = queue(&FIFO);
        system.thread_queue_enqueue(&q, NO_TIMEOUT).unwrap();
        system.set_priority(a, 9).unwrap();

        system.restart(a, 7).unwrap();
        let thread = tcb(&system, a);
        assert!(q.is_empty());
        assert_eq!(thread.restarts(), 1);
        assert_eq!(thread.priority(), 3);
        assert_eq!(system.executing(), Some(a));
        let initializations = port
            .events()
            .iter()
            .filter(|event| **event == PortEvent::Initialize(a))
            .count();
        assert_eq!(initializations, 2);

        let dormant = create(&system, 3, 1);
        assert_eq!(system.restart(dormant, 0), Err(Status::IncorrectState));
    }

    #[test]
    fn test_join_exit_value() {
        let (system, _port) = boot(SystemConfig::default());
        let a = spawn(&system, 1, 1);
        let b = spawn(&system, 2, 2);

        assert_eq!(system.join(a), Err(Status::Deadlock));
        assert_eq!(system.join(b), Ok(Outcome::Blocked));
        assert_eq!(system.executing(), Some(b));

        system.exit(42).unwrap();
        assert_eq!(system.executing(), Some(a));
        assert_eq!(system.wait_result(), Some((Status::Successful, 42)));
        assert!(system.thread_any(b).is_some());
        system.clock_tick();
        assert!(system.thread_any(b).is_none());
    }

    #[test]
    fn test_zombie_join_and_detach() {
        let (system, _port) = boot(SystemConfig::default());
        let _a = spawn(&system, 1, 1);
        let c = spawn(&system, 2, 3);
        let d = spawn(&system, 3, 3);

        system.cancel(c).unwrap();
        assert!(system.get_thread(c).is_err());
        assert_eq!(system.join(c), Ok(Outcome::Done(THREAD_CANCELED)));
        assert_eq!(system.join(c), Err(Status::InvalidId));

        system.detach(d).unwrap();
        assert_eq!(system.detach(d), Err(Status::IncorrectState));
        assert_eq!(system.join(d), Err(Status::IncorrectState));

        system.cancel(d).unwrap();
        assert!(system.thread_any(d).is_none());
    }

    #[test]
    fn test_zombie_keeps_identifier_reserved() {
        let mut config = SystemConfig::default();
        config.classic_tasks = ClassConfig::fixed(2);
        let (system, _port) = boot(config);
        let a = spawn(&system, 1, 1);
        let c = spawn(&system, 2, 3);

        system.cancel(c).unwrap();
        let next = ThreadConfig::new(Api::Classic, ObjectName::U32(3), 3);
        assert_eq!(system.create_thread(next.clone()), Err(Status::TooMany));

        assert_eq!(system.join(c), Ok(Outcome::Done(THREAD_CANCELED)));
        let d = system.create_thread(next).unwrap();
        assert_eq!(d, c);

        assert_eq!(system.executing(), Some(a));
        assert_eq!(system.join(d), Ok(Outcome::Blocked));
        assert!(tcb(&system, a).current_state().is_blocked());
        assert_eq!(system.executing(), None);

        system.detach(d).unwrap();
        assert!(tcb(&system, d).life().state.is_detached());
        assert!(tcb(&system, d).current_state().is_dormant());
    }

    #[test]
    fn test_thread_body_exit_value() {
        let (system, _port) = boot(SystemConfig::default());
        let a = create(&system, 1, 1);
        system
            .start_thread(a, ThreadEntry::Pointer { entry: doubled, argument: 21 })
            .unwrap();
        let _b = spawn(&system, 2, 2);

        system.execute_thread_body().unwrap();
        assert_ne!(system.executing(), Some(a));
        assert_eq!(system.join(a), Ok(Outcome::Done(42)));
    }

    #[test]
    fn test_set_affinity_moves_thread() {
        let (system, _port) = boot(SystemConfig::with_processors(2));
        let a = spawn(&system, 1, 1);
        let b = spawn(&system, 2, 2);

        system.set_affinity(a, ProcessorMask::single(1)).unwrap();
        assert_eq!(system.per_cpu(1).unwrap().executing(), Some(a));
        assert_eq!(system.per_cpu(0).unwrap().executing(), Some(b));
        assert_eq!(
            system.set_affinity(a, ProcessorMask::single(5)),
            Err(Status::InvalidNumber)
        );
    }

    fn two_instances() -> SystemConfig {
        SystemConfig {
            schedulers: vec![
                SchedulerConfig::new("A", Box::new(PriorityScheduler::new()), ProcessorMask::single(0)),
                SchedulerConfig::new("B", Box::new(PriorityScheduler::new()), ProcessorMask::single(1)),
            ],
            ..SystemConfig::with_processors(2)
        }
    }

    #[test]
    fn test_helping_scheduler_nodes() {
        let (system, _port) = boot(two_instances());
        let a = spawn(&system, 1, 1);
        let thread = tcb(&system, a);

        system.add_helping_scheduler(a, 1).unwrap();
        assert_eq!(thread.with_nodes(|nodes| nodes.helping_nodes()), 1);
        assert_eq!(thread.with_nodes(|nodes| nodes.scheduler_nodes().count()), 2);
        assert_eq!(system.per_cpu(0).unwrap().executing(), Some(a));
        assert_eq!(system.per_cpu(1).unwrap().executing(), None);
        assert_eq!(system.add_helping_scheduler(a, 0), Err(Status::IncorrectState));

        system.remove_helping_scheduler(a, 1).unwrap();
        assert_eq!(thread.with_nodes(|nodes| nodes.helping_nodes()), 0);
        assert_eq!(thread.with_nodes(|nodes| nodes.wait_nodes().count()), 1);
    }

    #[test]
    fn test_set_scheduler() {
        let (system, _port) = boot(two_instances());
        let a = spawn(&system, 1, 1);

        system.set_scheduler(a, 1, 4).unwrap();
        assert_eq!(system.per_cpu(1).unwrap().executing(), Some(a));
        assert_eq!(system.per_cpu(0).unwrap().executing(), None);
        assert_eq!(tcb(&system, a).priority(), 4);
        assert_eq!(tcb(&system, a).home_scheduler(), 1);

        let other = ObjectId::new(Api::Classic as u8, 1, 1, 9);
        system
            .add_wait_node(a, NodeRef { thread: other, scheduler: 0 })
            .unwrap();
        assert_eq!(system.set_scheduler(a, 0, 1), Err(Status::ResourceInUse));
        assert_eq!(
            system.remove_wait_node(a, NodeRef { thread: other, scheduler: 0 }),
            Ok(true)
        );
        assert_eq!(system.set_scheduler(a, 2, 1), Err(Status::InvalidNumber));
    }

    #[test]
    fn test_pinned_preemption() {
        let (system, _port) = boot(SystemConfig::default());
        let a = spawn(&system, 1, 5);
        system.pin();
        spawn(&system, 2, 1);
        let thread = tcb(&system, a);
        assert_eq!(thread.with_nodes(|nodes| nodes.pin_level()), 3);
        assert_eq!(thread.with_nodes(|nodes| nodes.pinned()), Some(0));

        system.set_priority(a, 0).unwrap();
        assert_eq!(system.executing(), Some(a));
        system.unpin();
        assert_eq!(thread.with_nodes(|nodes| nodes.pin_level()), 0);
        assert_eq!(thread.with_nodes(|nodes| nodes.pinned()), None);
    }

    #[test]
    fn test_names_and_iteration() {
        let (system, _port) = boot(SystemConfig::default());
        let a = create(&system, 0x5453_4b31, 1);
        let p = system
            .create_thread(ThreadConfig::new(Api::Posix, ObjectName::from_text("worker"), 1))
            .unwrap();

        assert_eq!(
            system.name_to_id(Api::Posix, &ObjectName::from_text("worker"), NodeScope::All),
            Ok(p)
        );
        assert_eq!(system.id_to_name(a), Ok(ObjectName::U32(0x5453_4b31)));
        system.set_name(a, ObjectName::U32(2)).unwrap();
        assert_eq!(
            system.name_to_id(Api::Classic, &ObjectName::U32(2), NodeScope::Local),
            Ok(a)
        );

        let mut seen = Vec::new();
        system.iterate_threads(|thread| {
            seen.push(thread.id());
            true
        });
        assert_eq!(seen, vec![a, p]);

        let mut first = 0;
        system.iterate_threads(|_| {
            first += 1;
            false
        });
        assert_eq!(first, 1);
    }

    #[derive(Default)]
    struct Counter {
        created: AtomicUsize,
        started: AtomicUsize,
        restarted: AtomicUsize,
        terminated: AtomicUsize,
        switches: AtomicUsize,
    }

    impl UserExtension for Counter {
        fn thread_create(&self, thread: &ThreadControl) -> bool {
            self.created.fetch_add(1, Ordering::SeqCst);
            thread.name() != ObjectName::U32(666)
        }

        fn thread_start(&self, _thread: &ThreadControl) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn thread_restart(&self, _thread: &ThreadControl) {
            self.restarted.fetch_add(1, Ordering::SeqCst);
        }

        fn thread_terminate(&self, _thread: &ThreadControl) {
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }

        fn thread_switch(&self, _cpu: usize, _executing: Option<ObjectId>, _heir: Option<ObjectId>) {
            self.switches.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_user_extensions() {
        let (system, _port) = boot(SystemConfig::default());
        let counter = Arc::new(Counter::default());
        system.add_extension(counter.clone());

        let a = spawn(&system, 1, 1);
        system.restart(a, 1).unwrap();
        system.delete(a).unwrap();
        let vetoed = ThreadConfig::new(Api::Classic, ObjectName::U32(666), 1);
        assert_eq!(system.create_thread(vetoed), Err(Status::Unsatisfied));

        assert_eq!(counter.created.load(Ordering::SeqCst), 2);
        assert_eq!(counter.started.load(Ordering::SeqCst), 1);
        assert_eq!(counter.restarted.load(Ordering::SeqCst), 1);
        assert_eq!(counter.terminated.load(Ordering::SeqCst), 1);
        assert!(counter.switches.load(Ordering::SeqCst) >= 2);
        assert_eq!(system.information(Api::Classic as u8).unwrap().active_count(), 0);
    }

    #[test]
    fn test_allocator_lock_defers_delete() {
        let (system, _port) = boot(SystemConfig::default());
        let a = spawn(&system, 1, 1);
        let lock = system.allocator().lock(&system);
        system.delete(a).unwrap();
        assert!(system.get_thread(a).is_ok());
        drop(lock);
        assert!(system.get_thread(a).is_err());
        assert_eq!(system.executing(), None);
    }

    #[test]
    fn test_global_instance() {
        let system = init(SystemConfig::default(), Arc::new(HostPort::new())).unwrap();
        assert!(core::ptr::eq(system, super::system().unwrap()));
        let again = init(SystemConfig::with_processors(0), Arc::new(HostPort::new())).unwrap();
        assert!(core::ptr::eq(system, again));
    }
}
