//! # Object Identifiers
//!
//! Every kernel-managed object is named by a 32-bit identifier packing four
//! fields:
//!
//! ```text
//!  31      27 26  24 23        16 15                     0
//! ┌──────────┬──────┬────────────┬────────────────────────┐
//! │  Class   │ API  │    Node    │         Index          │
//! │  5 bits  │3 bits│   8 bits   │        16 bits         │
//! └──────────┴──────┴────────────┴────────────────────────┘
//! ```
//!
//! - **API**: top-level API owning the class (internal, Classic, POSIX).
//! - **Class**: object kind within the API.
//! - **Node**: cluster node owning the instance, `1` on single-node systems.
//! - **Index**: 1-based slot number of the instance. Index `0` never
//!   denotes a live object.
//!
//! Field widths are checked at compile time. Client code never shifts raw
//! identifiers itself.

use core::fmt;

pub const INDEX_START_BIT: u32 = 0;
pub const NODE_START_BIT: u32 = 16;
pub const API_START_BIT: u32 = 24;
pub const CLASS_START_BIT: u32 = 27;

pub const INDEX_BITS: u32 = NODE_START_BIT - INDEX_START_BIT;
pub const NODE_BITS: u32 = API_START_BIT - NODE_START_BIT;
pub const API_BITS: u32 = CLASS_START_BIT - API_START_BIT;
pub const CLASS_BITS: u32 = 32 - CLASS_START_BIT;

pub const INDEX_MASK: u32 = ((1 << INDEX_BITS) - 1) << INDEX_START_BIT;
pub const NODE_MASK: u32 = ((1 << NODE_BITS) - 1) << NODE_START_BIT;
pub const API_MASK: u32 = ((1 << API_BITS) - 1) << API_START_BIT;
pub const CLASS_MASK: u32 = ((1 << CLASS_BITS) - 1) << CLASS_START_BIT;

/// Largest API number in use.
pub const APIS_LAST: u8 = Api::Posix as u8;

const _: () = {
    assert!(INDEX_BITS == 16);
    assert!(NODE_BITS == 8);
    assert!(API_BITS == 3);
    assert!(CLASS_BITS == 5);
    assert!(INDEX_MASK | NODE_MASK | API_MASK | CLASS_MASK == u32::MAX);
    assert!(INDEX_MASK & NODE_MASK & API_MASK & CLASS_MASK == 0);
    assert!((APIS_LAST as u32) < (1 << API_BITS));
};

// ---------------------------------------------------------------------------
// APIs and classes
// ---------------------------------------------------------------------------

/// Object APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Api {
    Internal = 1,
    Classic = 2,
    Posix = 3,
}

impl Api {
    pub const fn from_u8(api: u8) -> Option<Api> {
        match api {
            1 => Some(Api::Internal),
            2 => Some(Api::Classic),
            3 => Some(Api::Posix),
            _ => None,
        }
    }
}

/// `api` must be within `1..=APIS_LAST`.
#[inline]
pub const fn is_valid_api(api: u8) -> bool {
    api >= 1 && api <= APIS_LAST
}

/// Classes of the internal API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InternalClass {
    Threads = 1,
    Mutexes = 2,
}

/// Classes of the Classic API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClassicClass {
    Tasks = 1,
    Timers = 2,
    Semaphores = 3,
    MessageQueues = 4,
    Partitions = 5,
    Regions = 6,
    Ports = 7,
    Periods = 8,
    Extensions = 9,
    Barriers = 10,
}

/// Classes of the POSIX API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PosixClass {
    Threads = 1,
    Keys = 2,
    Interrupts = 3,
    MessageQueues = 4,
    Semaphores = 5,
    Timers = 6,
    Shms = 7,
}

// ---------------------------------------------------------------------------
// Identifier
// ---------------------------------------------------------------------------

/// Bit-packed object identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u32);

impl ObjectId {
    /// Packs the four fields. Fields wider than their bit width are a
    /// caller error.
    #[inline]
    pub const fn new(api: u8, class: u8, node: u8, index: u16) -> Self {
        debug_assert!((api as u32) < (1 << API_BITS));
        debug_assert!((class as u32) < (1 << CLASS_BITS));
        ObjectId(
            ((class as u32) << CLASS_START_BIT) & CLASS_MASK
                | ((api as u32) << API_START_BIT) & API_MASK
                | ((node as u32) << NODE_START_BIT)
                | ((index as u32) << INDEX_START_BIT),
        )
    }

    /// Like [`ObjectId::new`], but rejects out-of-range fields.
    pub const fn try_new(api: u8, class: u8, node: u8, index: u16) -> Option<Self> {
        if (api as u32) >= (1 << API_BITS) || (class as u32) >= (1 << CLASS_BITS) {
            None
        } else {
            Some(Self::new(api, class, node, index))
        }
    }

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        ObjectId(raw)
    }

    #[inline]
    pub const fn raw(&self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn api(&self) -> u8 {
        ((self.0 & API_MASK) >> API_START_BIT) as u8
    }

    #[inline]
    pub const fn class(&self) -> u8 {
        ((self.0 & CLASS_MASK) >> CLASS_START_BIT) as u8
    }

    #[inline]
    pub const fn node(&self) -> u8 {
        ((self.0 & NODE_MASK) >> NODE_START_BIT) as u8
    }

    #[inline]
    pub const fn index(&self) -> u16 {
        ((self.0 & INDEX_MASK) >> INDEX_START_BIT) as u16
    }

    /// Unpacks `(api, class, node, index)`.
    #[inline]
    pub const fn decode(&self) -> (u8, u8, u8, u16) {
        (self.api(), self.class(), self.node(), self.index())
    }

    /// Same API, class and node with a different index.
    #[inline]
    pub const fn with_index(&self, index: u16) -> Self {
        ObjectId((self.0 & !INDEX_MASK) | index as u32)
    }

    /// Identifier of index 1 of the given class.
    pub const fn minimum_id(api: u8, class: u8, node: u8) -> Self {
        Self::new(api, class, node, 1)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({:#010x})", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Free-function form of [`ObjectId::new`].
#[inline]
pub const fn encode(api: u8, class: u8, node: u8, index: u16) -> ObjectId {
    ObjectId::new(api, class, node, index)
}

/// Free-function form of [`ObjectId::decode`].
#[inline]
pub const fn decode(id: ObjectId) -> (u8, u8, u8, u16) {
    id.decode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for api in 0..8u8 {
            for class in [0u8, 1, 2, 15, 31] {
                for node in [0u8, 1, 2, 127, 255] {
                    for index in [0u16, 1, 2, 0x1234, u16::MAX] {
                        let id = encode(api, class, node, index);
                        assert_eq!(decode(id), (api, class, node, index));
                        assert_eq!(ObjectId::from_raw(id.raw()), id);
                    }
                }
            }
        }
    }

    #[test]
    fn test_field_layout() {
        let id = ObjectId::new(Api::Classic as u8, ClassicClass::Tasks as u8, 1, 1);
        assert_eq!(id.raw(), 0x0A01_0001);
        assert_eq!(format!("{}", id), "0x0a010001");
    }

    #[test]
    fn test_valid_api() {
        assert!(!is_valid_api(0));
        assert!(is_valid_api(Api::Internal as u8));
        assert!(is_valid_api(Api::Posix as u8));
        assert!(!is_valid_api(APIS_LAST + 1));
        assert_eq!(Api::from_u8(2), Some(Api::Classic));
        assert_eq!(Api::from_u8(4), None);
    }

    #[test]
    fn test_try_new_rejects_wide_fields() {
        assert!(ObjectId::try_new(8, 1, 1, 1).is_none());
        assert!(ObjectId::try_new(1, 32, 1, 1).is_none());
        assert!(ObjectId::try_new(7, 31, 255, u16::MAX).is_some());
    }

    #[test]
    fn test_with_index() {
        let id = ObjectId::minimum_id(Api::Posix as u8, PosixClass::Threads as u8, 3);
        let other = id.with_index(42);
        assert_eq!(other.decode(), (3, 1, 3, 42));
        assert_eq!(id.index(), 1);
    }
}
