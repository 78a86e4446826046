//! # SuperCore
//!
//! The object identification and thread control core of a real-time
//! kernel. API layers (a classic task API, a POSIX thread API) build their
//! objects on top of it; the core owns identifiers, names, thread state,
//! blocking and life-cycle transitions.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                 API layers / Application                │
//! ├────────────────────────────────────────────────────────┤
//! │                 System (kernel.rs)                      │
//! │  create · start · restart · delete · join · suspend    │
//! │  block_on · surrender · clock_tick · dispatch          │
//! ├──────────────┬──────────────────┬─────────────────────┤
//! │ Object       │ Thread control   │ Scheduler            │
//! │ object/      │ thread/          │ scheduler.rs         │
//! │ ─ id codec   │ ─ states, life   │ ─ node priority keys │
//! │ ─ registry   │ ─ wait flags     │ ─ policy trait       │
//! │ ─ names      │ ─ node set       │ ─ priority policy    │
//! │ ─ allocator  │ ─ budget, timer  │                      │
//! ├──────────────┴──────────────────┴─────────────────────┤
//! │   Thread queues (threadq.rs) · Extensions · chain.rs   │
//! ├────────────────────────────────────────────────────────┤
//! │   Sync (sync.rs): IsrLock · per-CPU dispatch disable   │
//! ├────────────────────────────────────────────────────────┤
//! │   CpuPort (arch/): host recorder · Cortex-M4 PendSV    │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Object identifiers
//!
//! ```text
//!  31      27 26  24 23      16 15               0
//! ┌──────────┬──────┬──────────┬──────────────────┐
//! │  class   │ API  │   node   │      index       │
//! └──────────┴──────┴──────────┴──────────────────┘
//! ```
//!
//! ## Memory Model
//!
//! - **Heap**: thread control blocks, stacks and registry tables come from
//!   `alloc`; the target supplies the global allocator.
//! - **Shared state**: every mutable field sits behind an
//!   [`IsrLock`](sync::IsrLock) or an atomic.
//! - **Global instance**: [`kernel::init`] installs the one [`System`]
//!   that interrupt handlers reach through [`kernel::system`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod chain;
pub mod config;
pub mod error;
pub mod extension;
pub mod kernel;
pub mod object;
pub mod scheduler;
pub mod sync;
pub mod thread;
pub mod threadq;

pub use error::{KernelResult, LookupError, Status};
pub use kernel::{Outcome, System};
pub use object::{Api, ObjectId, ObjectName};
