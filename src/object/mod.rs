//! # Object Identification Registry
//!
//! Gives every kernel-managed entity a unique, typed identifier that can be
//! dereferenced in O(1) and looked up by name.
//!
//! ```text
//!   ObjectId ──decode──► (API, Class) ──► Information<T>
//!                                              │ index
//!                                              ▼
//!                        slot table: [ Active(Arc<T>) | Allocated | Inactive ]
//!                                              │
//!                 inactive chain (FIFO) ◄──────┘ free / allocate
//! ```
//!
//! - [`id`]: identifier bit layout.
//! - [`name`]: 32-bit and string object names.
//! - [`information`]: per-class registry tables.
//! - [`allocator`]: the objects allocator mutex.

pub mod allocator;
pub mod id;
pub mod information;
pub mod name;

use crate::sync::IsrLock;

pub use id::{Api, ObjectId};
pub use information::{Information, Located, NodeScope, ObjectGuard};
pub use name::{NameMode, ObjectName};

/// Control record embedded in every managed object.
pub struct ObjectControl {
    id: ObjectId,
    name: IsrLock<ObjectName>,
}

impl ObjectControl {
    pub fn new(id: ObjectId, name: ObjectName) -> Self {
        Self {
            id,
            name: IsrLock::new("Object Name", name),
        }
    }

    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn name(&self) -> ObjectName {
        self.name.with(|name| name.clone())
    }

    pub(crate) fn set_name(&self, name: ObjectName) {
        self.name.with(|current| *current = name);
    }

    pub(crate) fn name_matches(&self, name: &ObjectName) -> bool {
        self.name.with(|current| current == name)
    }
}

/// An entity managed by an [`Information`] table.
pub trait Object: Send + Sync {
    fn object(&self) -> &ObjectControl;

    #[inline]
    fn id(&self) -> ObjectId {
        self.object().id()
    }
}
