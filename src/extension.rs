//! # User Extensions
//!
//! Hooks invoked at thread life-cycle transitions. API layers and
//! applications install them with
//! [`System::add_extension`](crate::kernel::System::add_extension); every
//! hook has an empty default.
//!
//! Hooks run without any SuperCore lock held, in installation order.

use crate::object::ObjectId;
use crate::thread::ThreadControl;

pub trait UserExtension: Send + Sync {
    /// A thread was created. Returning `false` makes the creation fail.
    fn thread_create(&self, _thread: &ThreadControl) -> bool {
        true
    }

    fn thread_start(&self, _thread: &ThreadControl) {}

    fn thread_restart(&self, _thread: &ThreadControl) {}

    /// The thread is about to release its identifier.
    fn thread_terminate(&self, _thread: &ThreadControl) {}

    /// Processor `cpu` switches from `executing` to `heir`. `None` is the
    /// idle context.
    fn thread_switch(&self, _cpu: usize, _executing: Option<ObjectId>, _heir: Option<ObjectId>) {}
}
