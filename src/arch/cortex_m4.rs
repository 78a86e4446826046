//! # Cortex-M4 Port Layer
//!
//! Context switching via PendSV, the clock tick via SysTick.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M4 uses a split-stack model:
//! - **MSP** (Main Stack Pointer): used by interrupt handlers
//! - **PSP** (Process Stack Pointer): used by threads in Thread mode
//!
//! On exception entry the hardware stacks R0–R3, R12, LR, PC and xPSR onto
//! the process stack; PendSV saves and restores R4–R11 by hand.
//!
//! The SuperCore decides *what* to switch in [`CortexM4Port::save_context`]
//! and [`CortexM4Port::restore_context`], which only record the two
//! context slots. PendSV carries the switch out later:
//!
//! ```text
//!   dispatch()                         PendSV
//!   ──────────                         ──────
//!   OUTGOING := executing.slot   ──►   *OUTGOING := PSP   (unless null or == INCOMING)
//!   INCOMING := heir.slot / idle ──►   PSP := *INCOMING
//!   pend PendSV                        OUTGOING := INCOMING
//! ```
//!
//! A restarted executing thread has OUTGOING == INCOMING: its old
//! registers are dropped instead of overwriting the fresh frame.
//!
//! ## Interrupt Priorities
//!
//! SysTick and PendSV both run at the lowest priority (0xFF), so a context
//! switch never preempts an application interrupt handler.

use core::ptr::{addr_of_mut, null_mut};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use cortex_m::peripheral::syst::SystClkSource;

use crate::arch::CpuPort;
use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::kernel;
use crate::object::ObjectId;
use crate::thread::{Context, StackArea};

/// Stack of the idle context.
const IDLE_STACK_SIZE: usize = 256;

/// Initial xPSR: only the Thumb bit.
const INITIAL_XPSR: u32 = 0x0100_0000;

/// Words of an initial frame: R4–R11, then the hardware frame.
const FRAME_WORDS: usize = 16;

/// Context to save at the next PendSV.
static OUTGOING: AtomicPtr<AtomicUsize> = AtomicPtr::new(null_mut());
/// Context to load at the next PendSV. Null: nothing to switch.
static INCOMING: AtomicPtr<AtomicUsize> = AtomicPtr::new(null_mut());

/// Receives the discarded registers of the boot context at the first switch.
static mut BOOT_SCRATCH: [u32; 32] = [0; 32];

// ---------------------------------------------------------------------------
// SysTick configuration
// ---------------------------------------------------------------------------

/// Configures SysTick to fire at `TICK_HZ` from the processor clock.
pub fn configure_systick(syst: &mut cortex_m::peripheral::SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

// ---------------------------------------------------------------------------
// PendSV trigger
// ---------------------------------------------------------------------------

/// Pends PendSV by setting PENDSVSET in the ICSR.
#[inline]
pub fn trigger_pendsv() {
    // ICSR address: 0xE000_ED04, PENDSVSET = bit 28
    const ICSR: *mut u32 = 0xE000_ED04 as *mut u32;
    unsafe {
        core::ptr::write_volatile(ICSR, 1 << 28);
    }
}

// ---------------------------------------------------------------------------
// Interrupt priority configuration
// ---------------------------------------------------------------------------

/// Sets PendSV and SysTick to the lowest interrupt priority.
pub fn set_interrupt_priorities() {
    unsafe {
        // System Handler Priority Register 3 (SHPR3): 0xE000_ED20
        // Bits [23:16] = PendSV priority
        // Bits [31:24] = SysTick priority
        let shpr3: *mut u32 = 0xE000_ED20 as *mut u32;
        let val = core::ptr::read_volatile(shpr3);
        let val = val | (0xFF << 16) | (0xFF << 24);
        core::ptr::write_volatile(shpr3, val);
    }
}

// ---------------------------------------------------------------------------
// First switch
// ---------------------------------------------------------------------------

/// Points PSP at scratch memory so that the first PendSV has somewhere to
/// push the registers of the boot context. The boot context is never
/// resumed.
///
/// # Safety
/// Call once, before [`kernel::System::start_multitasking`] pends the
/// first switch.
pub unsafe fn prepare_first_switch() {
    let scratch = addr_of_mut!(BOOT_SCRATCH) as usize;
    let top = scratch + core::mem::size_of::<[u32; 32]>();
    cortex_m::register::psp::write(top as u32);
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Single-processor Cortex-M4 port.
pub struct CortexM4Port {
    idle: Context,
    idle_stack: Option<StackArea>,
}

impl CortexM4Port {
    pub fn new() -> Self {
        let port = Self {
            idle: Context::new(),
            idle_stack: StackArea::new(IDLE_STACK_SIZE),
        };
        match &port.idle_stack {
            Some(stack) => build_frame(&port.idle, stack, idle_loop as usize),
            None => log::error!("cortex-m4: no memory for the idle stack"),
        }
        port
    }
}

impl Default for CortexM4Port {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes an initial exception frame that enters `entry` at the top of
/// `stack`:
///
/// ```text
///   top ──►  xPSR   (Thumb)
///            PC     entry
///            LR     exit_loop
///            R12, R3, R2, R1, R0
///            R11 … R4   = 0      ◄── saved stack pointer
/// ```
fn build_frame(context: &Context, stack: &StackArea, entry: usize) {
    let top = stack.top() & !7;
    let sp = top - FRAME_WORDS * 4;
    let frame = sp as *mut u32;
    // SAFETY: the frame lies within the stack area, which no processor is
    // using while its context is being initialized.
    unsafe {
        for word in 0..8 {
            frame.add(word).write(0); // R4-R11
        }
        frame.add(8).write(0); // R0
        frame.add(9).write(0); // R1
        frame.add(10).write(0); // R2
        frame.add(11).write(0); // R3
        frame.add(12).write(0); // R12
        frame.add(13).write(exit_loop as usize as u32); // LR
        frame.add(14).write((entry as u32) & !1); // PC
        frame.add(15).write(INITIAL_XPSR); // xPSR
    }
    context.set_stack_pointer(sp);
}

impl CpuPort for CortexM4Port {
    fn current_processor(&self) -> usize {
        0
    }

    // FP contexts are not stacked: PendSV returns with a basic frame.
    fn initialize_context(&self, thread: ObjectId, context: &Context, stack: &StackArea, _is_fp: bool) {
        build_frame(context, stack, thread_trampoline as usize);
        log::trace!("cortex-m4: thread {} frame at {:#x}", thread, context.stack_pointer());
    }

    fn save_context(&self, _cpu: usize, _thread: ObjectId, context: &Context) {
        OUTGOING.store(context.slot() as *mut AtomicUsize, Ordering::Release);
    }

    fn restore_context(&self, _cpu: usize, _thread: Option<ObjectId>, context: Option<&Context>) {
        let context = context.unwrap_or(&self.idle);
        INCOMING.store(context.slot() as *mut AtomicUsize, Ordering::Release);
    }

    fn request_dispatch(&self, _cpu: usize) {
        trigger_pendsv();
    }
}

// ---------------------------------------------------------------------------
// Thread entry
// ---------------------------------------------------------------------------

/// First instruction of every thread: runs the body, then exits.
extern "C" fn thread_trampoline() -> ! {
    if let Some(system) = kernel::system() {
        if let Err(err) = system.execute_thread_body() {
            log::error!("cortex-m4: thread body failed: {}", err);
        }
    }
    exit_loop()
}

/// Reached only if the exit did not switch away.
extern "C" fn exit_loop() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}

extern "C" fn idle_loop() -> ! {
    loop {
        cortex_m::asm::wfi();
    }
}

// ---------------------------------------------------------------------------
// PendSV handler (context switch)
// ---------------------------------------------------------------------------

/// PendSV exception handler: performs the context switch.
///
/// 1. Push R4–R11 onto the process stack
/// 2. Let [`switch_context`] store PSP and pick the incoming PSP
/// 3. Pop R4–R11 from the incoming stack
/// 4. Return to Thread mode on PSP (EXC_RETURN = 0xFFFFFFFD)
///
/// # Safety
/// Called directly by the NVIC, following the Cortex-M4 exception entry
/// and exit convention.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    core::arch::naked_asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",
        "bl {switch}",
        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",
        "ldr r0, =0xFFFFFFFD",
        "bx r0",
        switch = sym switch_context,
    );
}

/// Stores the outgoing stack pointer and returns the incoming one.
///
/// # Safety
/// Called from PendSV only. The slots point into live thread control
/// blocks or the idle context.
#[no_mangle]
unsafe extern "C" fn switch_context(psp: usize) -> usize {
    let incoming = INCOMING.swap(null_mut(), Ordering::AcqRel);
    if incoming.is_null() {
        return psp;
    }
    let outgoing = OUTGOING.swap(incoming, Ordering::AcqRel);
    if !outgoing.is_null() && outgoing != incoming {
        (*outgoing).store(psp, Ordering::Release);
    }
    (*incoming).load(Ordering::Acquire)
}

// ---------------------------------------------------------------------------
// SysTick handler
// ---------------------------------------------------------------------------

/// SysTick exception handler: announces a clock tick. The SuperCore pends
/// PendSV itself when the tick changes an heir.
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    if let Some(system) = kernel::system() {
        system.clock_tick();
    }
}
