//! # Object Information Tables
//!
//! One [`Information`] table per (API, Class) pair owns the mapping from
//! identifier to live object and from name to identifier.
//!
//! ## Slot life cycle
//!
//! ```text
//!            allocate()              open()
//!  Inactive ───────────► Allocated ─────────► Active(Arc<T>)
//!     ▲                     │  ▲                  │
//!     └──────── free() ─────┘  └──── close() ─────┘
//! ```
//!
//! Only `Active` slots are resolvable by [`Information::get`] and
//! [`Information::name_to_id`]. Inactive slots are linked into a FIFO chain
//! through their indices: `allocate` takes the head, `free` appends to the
//! tail.
//!
//! ## Auto-extension
//!
//! Classes configured with [`ObjectsMaximum::Unlimited`] grow the table by
//! one allocation block when the inactive chain runs dry. Memory of blocks
//! whose slots are all inactive is only given back by
//! [`Information::shrink`]. The first block is never released.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Deref;

use crate::config::{ClassConfig, ObjectsMaximum};
use crate::error::LookupError;
use crate::object::allocator::AllocatorGuard;
use crate::object::id::{Api, ObjectId};
use crate::object::name::{NameMode, ObjectName};
use crate::object::Object;
use crate::sync::{DispatchDisableGuard, IsrLock, PerCpu, ThreadDispatch};

// ---------------------------------------------------------------------------
// Lookup results
// ---------------------------------------------------------------------------

/// Where a looked-up object lives.
#[derive(Debug)]
pub enum Located<T> {
    /// Published on this node.
    Local(T),
    /// Owned by another cluster node. Only produced for global classes.
    Remote(ObjectId),
}

impl<T> Located<T> {
    pub fn local(self) -> Option<T> {
        match self {
            Located::Local(object) => Some(object),
            Located::Remote(_) => None,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Located::Remote(_))
    }
}

/// Scope of a name search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeScope {
    All,
    Local,
    /// Every node except the local one.
    Other,
    Node(u8),
}

/// A local object returned by [`Information::get`].
///
/// Holds the processor's dispatch disabled while alive. Dropping it is the
/// `put` operation; [`ObjectGuard::put`] spells it out.
pub struct ObjectGuard<'a, T> {
    object: Arc<T>,
    _dispatch: DispatchDisableGuard<'a>,
}

impl<'a, T> ObjectGuard<'a, T> {
    /// A strong reference that outlives the dispatch-disabled section.
    pub fn object(&self) -> &Arc<T> {
        &self.object
    }

    /// Ends the dispatch-disabled section started by `get`.
    pub fn put(self) {}
}

impl<T> Deref for ObjectGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.object
    }
}

// ---------------------------------------------------------------------------
// Slot table
// ---------------------------------------------------------------------------

enum Slot<T> {
    /// Part of a released allocation block.
    Unallocated,
    Inactive { next: Option<u16> },
    Allocated,
    Active(Arc<T>),
}

impl<T> Slot<T> {
    fn is_inactive(&self) -> bool {
        matches!(self, Slot::Inactive { .. })
    }

    fn is_unallocated(&self) -> bool {
        matches!(self, Slot::Unallocated)
    }
}

struct Table<T> {
    /// `slots[i]` holds index `i + 1`.
    slots: Vec<Slot<T>>,
    inactive_head: Option<u16>,
    inactive_tail: Option<u16>,
    inactive: usize,
    /// Names of objects published by other cluster nodes, ordered by node
    /// and then by index.
    global: BTreeMap<(u8, u16), ObjectName>,
}

impl<T> Table<T> {
    fn slot(&self, index: u16) -> Option<&Slot<T>> {
        if index == 0 {
            return None;
        }
        self.slots.get(usize::from(index) - 1)
    }

    fn slot_mut(&mut self, index: u16) -> Option<&mut Slot<T>> {
        if index == 0 {
            return None;
        }
        self.slots.get_mut(usize::from(index) - 1)
    }

    fn push_inactive(&mut self, index: u16) {
        if let Some(slot) = self.slot_mut(index) {
            *slot = Slot::Inactive { next: None };
        }
        match self.inactive_tail {
            Some(tail) => {
                if let Some(Slot::Inactive { next }) = self.slot_mut(tail) {
                    *next = Some(index);
                }
            }
            None => self.inactive_head = Some(index),
        }
        self.inactive_tail = Some(index);
        self.inactive += 1;
    }

    fn pop_inactive(&mut self) -> Option<u16> {
        let index = self.inactive_head?;
        let next = match self.slot(index) {
            Some(Slot::Inactive { next }) => *next,
            _ => None,
        };
        self.inactive_head = next;
        if next.is_none() {
            self.inactive_tail = None;
        }
        if let Some(slot) = self.slot_mut(index) {
            *slot = Slot::Allocated;
        }
        self.inactive -= 1;
        Some(index)
    }

    /// Rebuilds the inactive chain in its current order, dropping the
    /// indices for which `keep` returns false.
    fn retain_inactive(&mut self, mut keep: impl FnMut(u16) -> bool) {
        let mut order = Vec::with_capacity(self.inactive);
        let mut cursor = self.inactive_head;
        while let Some(index) = cursor {
            cursor = match self.slot(index) {
                Some(Slot::Inactive { next }) => *next,
                _ => None,
            };
            order.push(index);
        }

        self.inactive_head = None;
        self.inactive_tail = None;
        self.inactive = 0;
        for index in order {
            if keep(index) {
                self.push_inactive(index);
            } else if let Some(slot) = self.slot_mut(index) {
                *slot = Slot::Unallocated;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Information
// ---------------------------------------------------------------------------

/// Registry table of one (API, Class) pair.
pub struct Information<T> {
    api: Api,
    class: u8,
    local_node: u8,
    maximum_nodes: u8,
    maximum: ObjectsMaximum,
    name_mode: NameMode,
    global: bool,
    table: IsrLock<Table<T>>,
}

impl<T: Object> Information<T> {
    /// Creates the table with its initial allocation block.
    pub fn new(api: Api, class: u8, config: &ClassConfig, local_node: u8, maximum_nodes: u8) -> Self {
        let initial = config.maximum.initial_slots();
        let mut table = Table {
            slots: Vec::with_capacity(usize::from(initial)),
            inactive_head: None,
            inactive_tail: None,
            inactive: 0,
            global: BTreeMap::new(),
        };
        for index in 1..=initial {
            table.slots.push(Slot::Allocated);
            table.push_inactive(index);
        }

        Self {
            api,
            class,
            local_node,
            maximum_nodes,
            maximum: config.maximum,
            name_mode: config.name_mode,
            global: config.global,
            table: IsrLock::new("Object Information", table),
        }
    }

    pub fn api(&self) -> Api {
        self.api
    }

    pub fn class(&self) -> u8 {
        self.class
    }

    pub fn name_mode(&self) -> NameMode {
        self.name_mode
    }

    pub fn is_auto_extend(&self) -> bool {
        self.maximum.objects_per_block() != 0
    }

    pub fn is_global(&self) -> bool {
        self.global
    }

    pub fn minimum_id(&self) -> ObjectId {
        ObjectId::minimum_id(self.api as u8, self.class, self.local_node)
    }

    /// Identifier of the highest index currently backed by the table.
    pub fn maximum_id(&self) -> ObjectId {
        self.minimum_id().with_index(self.maximum_index())
    }

    pub fn maximum_index(&self) -> u16 {
        self.table.with(|table| table.slots.len() as u16)
    }

    pub fn active_count(&self) -> usize {
        self.table.with(|table| {
            table
                .slots
                .iter()
                .filter(|slot| matches!(slot, Slot::Active(_)))
                .count()
        })
    }

    pub fn inactive_count(&self) -> usize {
        self.table.with(|table| table.inactive)
    }

    fn id_of(&self, index: u16) -> ObjectId {
        ObjectId::new(self.api as u8, self.class, self.local_node, index)
    }

    fn is_own_class(&self, id: ObjectId) -> bool {
        id.api() == self.api as u8 && id.class() == self.class
    }

    // -- allocation ---------------------------------------------------------

    /// Takes the first inactive slot. The slot is reserved but stays
    /// unpublished until [`Information::open`].
    pub fn allocate(&self, _lock: &AllocatorGuard<'_>) -> Option<ObjectId> {
        let mut table = self.table.acquire();

        if let Some(index) = table.pop_inactive() {
            return Some(self.id_of(index));
        }

        if self.is_auto_extend() && self.extend(&mut table) {
            return table.pop_inactive().map(|index| self.id_of(index));
        }

        log::warn!(
            "objects: no free slot in api {} class {}",
            self.api as u8,
            self.class
        );
        None
    }

    /// Adds one allocation block: the first released block if there is
    /// one, otherwise a new block at the end of the table.
    fn extend(&self, table: &mut Table<T>) -> bool {
        let per_block = usize::from(self.maximum.objects_per_block());
        let reusable = table
            .slots
            .chunks(per_block)
            .position(|block| block.iter().all(Slot::is_unallocated));

        let first = match reusable {
            Some(block) => block * per_block,
            None => {
                if table.slots.len() + per_block > usize::from(u16::MAX) {
                    return false;
                }
                let start = table.slots.len();
                table.slots.resize_with(start + per_block, || Slot::Unallocated);
                start
            }
        };

        for position in first..first + per_block {
            table.slots[position] = Slot::Allocated;
            table.push_inactive((position + 1) as u16);
        }
        log::debug!(
            "objects: api {} class {} extended to {} slots",
            self.api as u8,
            self.class,
            table.slots.len()
        );
        true
    }

    /// Returns a closed slot to the tail of the inactive chain.
    pub fn free(&self, _lock: &AllocatorGuard<'_>, id: ObjectId) {
        let mut table = self.table.acquire();
        let reserved = matches!(table.slot(id.index()), Some(Slot::Allocated));
        debug_assert!(reserved, "free of an unreserved or published slot");
        if reserved && self.is_own_class(id) {
            table.push_inactive(id.index());
        }
    }

    /// Releases every allocation block, except the first, whose slots are
    /// all inactive.
    pub fn shrink(&self, _lock: &AllocatorGuard<'_>) -> usize {
        let per_block = usize::from(self.maximum.objects_per_block());
        if per_block == 0 {
            return 0;
        }

        let mut table = self.table.acquire();
        let released: Vec<usize> = table
            .slots
            .chunks(per_block)
            .enumerate()
            .skip(1)
            .filter(|(_, block)| block.iter().all(Slot::is_inactive))
            .map(|(block, _)| block)
            .collect();

        if released.is_empty() {
            return 0;
        }

        table.retain_inactive(|index| {
            let block = (usize::from(index) - 1) / per_block;
            !released.contains(&block)
        });

        // Trailing released blocks give their memory back.
        while table.slots.len() > per_block
            && table.slots[table.slots.len() - per_block..]
                .iter()
                .all(Slot::is_unallocated)
        {
            let len = table.slots.len() - per_block;
            table.slots.truncate(len);
        }
        table.slots.shrink_to_fit();

        log::debug!(
            "objects: api {} class {} shrunk by {} blocks",
            self.api as u8,
            self.class,
            released.len()
        );
        released.len()
    }

    // -- publication ----------------------------------------------------------

    /// Stores the name and publishes the object under its identifier.
    pub fn open(&self, object: Arc<T>, name: ObjectName) -> ObjectId {
        let id = object.id();
        object.object().set_name(name.truncated(self.name_mode));

        let mut table = self.table.acquire();
        let slot = table.slot_mut(id.index());
        debug_assert!(
            matches!(slot, Some(Slot::Allocated)),
            "open of a slot that was not allocated"
        );
        if let Some(slot) = slot {
            *slot = Slot::Active(object);
        }
        id
    }

    /// Removes the name association and unpublishes the object. Returns the
    /// table's reference.
    pub fn close(&self, object: &T) -> Option<Arc<T>> {
        let id = object.id();
        if !self.is_own_class(id) {
            return None;
        }
        let closed = {
            let mut table = self.table.acquire();
            match table.slot_mut(id.index()) {
                Some(slot) if matches!(slot, Slot::Active(_)) => {
                    match core::mem::replace(slot, Slot::Allocated) {
                        Slot::Active(arc) => Some(arc),
                        _ => None,
                    }
                }
                _ => None,
            }
        };
        if closed.is_some() && matches!(self.name_mode, NameMode::String { .. }) {
            object.object().set_name(ObjectName::empty(self.name_mode));
        }
        closed
    }

    // -- lookup -----------------------------------------------------------------

    /// Resolves `id` and disables dispatching on `cpu` for as long as the
    /// returned guard lives.
    pub fn get<'a>(
        &self,
        id: ObjectId,
        cpu: &'a PerCpu,
        dispatcher: &'a dyn ThreadDispatch,
    ) -> Result<Located<ObjectGuard<'a, T>>, LookupError> {
        match self.lookup(id)? {
            Located::Local(object) => Ok(Located::Local(ObjectGuard {
                object,
                _dispatch: cpu.disable_dispatch(dispatcher),
            })),
            Located::Remote(id) => Ok(Located::Remote(id)),
        }
    }

    /// Resolves `id` without starting a dispatch-disabled section. The
    /// reference keeps the control block alive but not published.
    pub fn get_no_protection(&self, id: ObjectId) -> Option<Arc<T>> {
        match self.lookup(id) {
            Ok(Located::Local(object)) => Some(object),
            _ => None,
        }
    }

    fn lookup(&self, id: ObjectId) -> Result<Located<Arc<T>>, LookupError> {
        if !self.is_own_class(id) {
            return Err(LookupError::InvalidId);
        }

        if id.node() != self.local_node {
            if self.global && id.node() != 0 && id.node() <= self.maximum_nodes {
                return Ok(Located::Remote(id));
            }
            return Err(LookupError::InvalidId);
        }

        let table = self.table.acquire();
        match table.slot(id.index()) {
            None => Err(LookupError::InvalidId),
            Some(Slot::Active(object)) => Ok(Located::Local(object.clone())),
            Some(_) => Err(LookupError::Unpublished),
        }
    }

    /// Snapshot of the published objects in index order.
    pub fn objects(&self) -> Vec<Arc<T>> {
        self.table.with(|table| {
            table
                .slots
                .iter()
                .filter_map(|slot| match slot {
                    Slot::Active(object) => Some(object.clone()),
                    _ => None,
                })
                .collect()
        })
    }

    // -- names ----------------------------------------------------------------

    /// Finds the identifier of an object by name.
    ///
    /// Locally the lowest index wins. Remote candidates are only considered
    /// for global classes: the lowest node wins, then the lowest index on
    /// that node.
    pub fn name_to_id(&self, name: &ObjectName, scope: NodeScope) -> Result<ObjectId, LookupError> {
        if name.is_empty() || !name.matches_mode(self.name_mode) {
            return Err(LookupError::InvalidName);
        }

        let search_local = match scope {
            NodeScope::All | NodeScope::Local => true,
            NodeScope::Other => false,
            NodeScope::Node(node) => node == self.local_node,
        };

        if let NodeScope::Node(node) = scope {
            if node == 0 || node > self.maximum_nodes {
                return Err(LookupError::InvalidNode);
            }
        }

        let name = name.clone().truncated(self.name_mode);
        let table = self.table.acquire();

        if search_local {
            let found = table.slots.iter().find_map(|slot| match slot {
                Slot::Active(object) if object.object().name_matches(&name) => Some(object.id()),
                _ => None,
            });
            if let Some(id) = found {
                return Ok(id);
            }
        }

        if !self.global || matches!(scope, NodeScope::Local) {
            return Err(LookupError::InvalidName);
        }

        table
            .global
            .iter()
            .filter(|((node, _), _)| match scope {
                NodeScope::Node(wanted) => *node == wanted,
                _ => *node != self.local_node,
            })
            .find(|(_, candidate)| **candidate == name)
            .map(|((node, index), _)| ObjectId::new(self.api as u8, self.class, *node, *index))
            .ok_or(LookupError::InvalidName)
    }

    /// Name of a published local object.
    pub fn id_to_name(&self, id: ObjectId) -> Result<ObjectName, LookupError> {
        match self.lookup(id)? {
            Located::Local(object) => Ok(object.object().name()),
            Located::Remote(id) => self
                .table
                .with(|table| table.global.get(&(id.node(), id.index())).cloned())
                .ok_or(LookupError::Unpublished),
        }
    }

    /// Renames a published object.
    pub fn set_name(&self, object: &T, name: ObjectName) -> Result<(), LookupError> {
        if !name.matches_mode(self.name_mode) {
            return Err(LookupError::InvalidName);
        }
        object.object().set_name(name.truncated(self.name_mode));
        Ok(())
    }

    /// Publishes the name of an object owned by another cluster node.
    pub fn register_global(&self, id: ObjectId, name: ObjectName) -> Result<(), LookupError> {
        if !self.global || !self.is_own_class(id) {
            return Err(LookupError::InvalidId);
        }
        if id.node() == 0 || id.node() == self.local_node || id.node() > self.maximum_nodes {
            return Err(LookupError::InvalidNode);
        }
        if name.is_empty() || !name.matches_mode(self.name_mode) {
            return Err(LookupError::InvalidName);
        }
        let name = name.truncated(self.name_mode);
        self.table.with(|table| {
            table.global.insert((id.node(), id.index()), name);
        });
        Ok(())
    }

    pub fn unregister_global(&self, id: ObjectId) -> bool {
        self.table
            .with(|table| table.global.remove(&(id.node(), id.index())))
            .is_some()
    }
}
