//! # Architecture Abstraction Layer
//!
//! The SuperCore selects heirs; a [`CpuPort`] performs the actual context
//! switch. Ports are sibling modules:
//!
//! - [`host`]: records switches, for hosted use and tests.
//! - `cortex_m4`: PendSV context switch and SysTick (bare-metal ARM only).

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;
pub mod host;

use crate::object::ObjectId;
use crate::thread::{Context, StackArea};

/// Processor-specific context switch primitives.
pub trait CpuPort: Send + Sync {
    /// Index of the executing processor.
    fn current_processor(&self) -> usize;

    /// Prepares `context` so that restoring it enters the thread body on a
    /// fresh `stack`.
    fn initialize_context(&self, thread: ObjectId, context: &Context, stack: &StackArea, is_fp: bool);

    /// The context of `thread` on processor `cpu` is about to be left.
    fn save_context(&self, cpu: usize, thread: ObjectId, context: &Context);

    /// Processor `cpu` continues with `thread`, or idles for `None`.
    fn restore_context(&self, cpu: usize, thread: Option<ObjectId>, context: Option<&Context>);

    /// Makes processor `cpu` carry out the switch prepared by
    /// `save_context`/`restore_context`.
    fn request_dispatch(&self, cpu: usize);
}
