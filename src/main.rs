//! # SuperCore Demo Firmware
//!
//! Runs a handful of classic tasks on one Cortex-M4 processor:
//!
//! | Task | Priority | Behavior |
//! |------|----------|----------|
//! | `SAMP` | 2 | Wakes every 100 ticks |
//! | `WORK` | 5 | Busy work, yields after each round |
//! | `CALC` | 3 | Spawns a short-lived child and joins its result |
//!
//! The heap is a bump allocator over a static buffer. Stacks of joined
//! children are not reclaimed, so `CALC` stops spawning once it runs dry.

#![no_std]
#![no_main]

extern crate alloc;

use alloc::sync::Arc;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{addr_of_mut, null_mut};

use cortex_m_rt::entry;
use panic_halt as _;
use spin::Mutex;

use supercore::arch::cortex_m4::{self, CortexM4Port};
use supercore::config::SystemConfig;
use supercore::kernel::{self, Outcome};
use supercore::object::name::build_name;
use supercore::thread::{ThreadConfig, ThreadEntry};
use supercore::{Api, ObjectId, ObjectName};

// ---------------------------------------------------------------------------
// Heap
// ---------------------------------------------------------------------------

const HEAP_SIZE: usize = 64 * 1024;

static mut HEAP: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

struct BumpHeap {
    inner: Mutex<BumpInner>,
}

struct BumpInner {
    start: *mut u8,
    size: usize,
    next: usize,
}

// SAFETY: the region is only handed out under the mutex.
unsafe impl Send for BumpInner {}
unsafe impl Sync for BumpHeap {}

impl BumpHeap {
    const fn new() -> Self {
        Self {
            inner: Mutex::new(BumpInner {
                start: null_mut(),
                size: 0,
                next: 0,
            }),
        }
    }

    /// # Safety
    /// `start..start + size` must be unused memory.
    unsafe fn init(&self, start: *mut u8, size: usize) {
        critical_section::with(|_| {
            let mut inner = self.inner.lock();
            inner.start = start;
            inner.size = size;
            inner.next = 0;
        });
    }
}

unsafe impl GlobalAlloc for BumpHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // SysTick allocates too.
        critical_section::with(|_| {
            let mut inner = self.inner.lock();
            if inner.start.is_null() {
                return null_mut();
            }
            let begin = (inner.next + layout.align() - 1) & !(layout.align() - 1);
            let end = begin + layout.size();
            if end > inner.size {
                return null_mut();
            }
            inner.next = end;
            inner.start.add(begin)
        })
    }

    unsafe fn dealloc(&self, _ptr: *mut u8, _layout: Layout) {}
}

#[global_allocator]
static ALLOCATOR: BumpHeap = BumpHeap::new();

// ---------------------------------------------------------------------------
// Task bodies
// ---------------------------------------------------------------------------

fn sampler(period: usize) {
    let Some(system) = kernel::system() else {
        return;
    };
    let mut samples: u32 = 0;
    loop {
        samples = samples.wrapping_add(1);
        if system.wake_after(period as u32).is_err() {
            return;
        }
    }
}

fn worker(rounds: usize) {
    let Some(system) = kernel::system() else {
        return;
    };
    let mut acc: u32 = 0;
    loop {
        for _ in 0..rounds {
            acc = acc.wrapping_add(1);
        }
        let _ = system.yield_processor();
        let _ = system.wake_after(10);
    }
}

fn square(value: usize) -> usize {
    value * value
}

fn calculator(_argument: usize) {
    let Some(system) = kernel::system() else {
        return;
    };
    let mut input = 1;
    loop {
        if let Ok(child) = spawn(
            ThreadConfig::new(Api::Classic, ObjectName::U32(build_name(b'S', b'Q', b'R', b' ')), 4),
            ThreadEntry::Pointer { entry: square, argument: input },
        ) {
            let result = match system.join(child) {
                Ok(Outcome::Done(value)) => Some(value),
                Ok(Outcome::Blocked) => system.wait_result().map(|(_, value)| value),
                Err(_) => None,
            };
            if let Some(value) = result {
                log::info!("demo: {}^2 = {}", input, value);
            }
        }
        input += 1;
        let _ = system.wake_after(500);
    }
}

fn spawn(config: ThreadConfig, entry: ThreadEntry) -> supercore::KernelResult<ObjectId> {
    let system = kernel::system().ok_or(supercore::Status::IncorrectState)?;
    let id = system.create_thread(config)?;
    system.start_thread(id, entry)?;
    Ok(id)
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

#[entry]
fn main() -> ! {
    // SAFETY: the buffer is handed to the allocator once, before any use.
    unsafe { ALLOCATOR.init(addr_of_mut!(HEAP) as *mut u8, HEAP_SIZE) };

    let Some(mut cp) = cortex_m::Peripherals::take() else {
        halt()
    };

    if kernel::init(SystemConfig::default(), Arc::new(CortexM4Port::new())).is_err() {
        halt()
    }

    let tasks = [
        (ObjectName::U32(build_name(b'S', b'A', b'M', b'P')), 2, ThreadEntry::Numeric { entry: sampler, argument: 100 }),
        (ObjectName::U32(build_name(b'W', b'O', b'R', b'K')), 5, ThreadEntry::Numeric { entry: worker, argument: 2000 }),
        (ObjectName::U32(build_name(b'C', b'A', b'L', b'C')), 3, ThreadEntry::Numeric { entry: calculator, argument: 0 }),
    ];
    for (name, priority, entry) in tasks {
        if spawn(ThreadConfig::new(Api::Classic, name, priority), entry).is_err() {
            halt()
        }
    }

    cortex_m4::configure_systick(&mut cp.SYST);
    cortex_m4::set_interrupt_priorities();

    let Some(system) = kernel::system() else {
        halt()
    };
    // SAFETY: called once, right before the first switch.
    unsafe { cortex_m4::prepare_first_switch() };
    system.start_multitasking();

    halt()
}

fn halt() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}
