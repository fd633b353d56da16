//! Generation-tagged handles and the slot tables behind the registries.
//!
//! A handle packs three fields into a `u64`:
//!
//! ```text
//! +------+----------------+--------------------+
//! | kind | generation     | slot               |
//! | 2b   | 30b            | 32b                |
//! +------+----------------+--------------------+
//! ```
//!
//! Removing an entry bumps its slot's generation before the slot is reused,
//! so a stale handle never aliases the new occupant. A slot whose generation
//! is exhausted is retired instead of reused.

use crate::error::{MeshError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

const KIND_SHIFT: u32 = 62;
const GENERATION_SHIFT: u32 = 32;
const MAX_GENERATION: u32 = (1 << 30) - 1;

/// Which registry a handle belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// Server (node) handle
    Server = 1,
    /// Listener handle
    Listener = 2,
    /// Connection handle
    Connection = 3,
}

impl HandleKind {
    fn name(self) -> &'static str {
        match self {
            HandleKind::Server => "server",
            HandleKind::Listener => "listener",
            HandleKind::Connection => "connection",
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Opaque handle referencing a registry-owned object
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    /// Value never issued by any registry
    pub const INVALID: Handle = Handle(0);

    fn new(kind: HandleKind, slot: u32, generation: u32) -> Self {
        Handle(
            ((kind as u64) << KIND_SHIFT)
                | (u64::from(generation) << GENERATION_SHIFT)
                | u64::from(slot),
        )
    }

    /// Reinterpret a raw value received across the flat surface
    pub fn from_raw(raw: u64) -> Self {
        Handle(raw)
    }

    /// Raw value handed across the flat surface
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Registry kind encoded in the handle, if any
    pub fn kind(self) -> Option<HandleKind> {
        match self.0 >> KIND_SHIFT {
            1 => Some(HandleKind::Server),
            2 => Some(HandleKind::Listener),
            3 => Some(HandleKind::Connection),
            _ => None,
        }
    }

    fn slot(self) -> u32 {
        self.0 as u32
    }

    fn generation(self) -> u32 {
        ((self.0 >> GENERATION_SHIFT) as u32) & MAX_GENERATION
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(kind) => write!(f, "{}#{}.{}", kind, self.slot(), self.generation()),
            None => write!(f, "#{:x}", self.0),
        }
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

impl<T> Slot<T> {
    fn retired(&self) -> bool {
        self.value.is_none() && self.generation == MAX_GENERATION
    }
}

/// Slot table issuing generation-tagged handles
pub struct HandleTable<T> {
    kind: HandleKind,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> HandleTable<T> {
    /// Create an empty table for one handle kind
    pub fn new(kind: HandleKind) -> Self {
        Self {
            kind,
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Insert a value built from its own handle
    pub fn insert_with(&mut self, make: impl FnOnce(Handle) -> T) -> Handle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let handle = Handle::new(self.kind, index, slot.generation);
            slot.value = Some(make(handle));
            return handle;
        }

        let index = self.slots.len() as u32;
        let handle = Handle::new(self.kind, index, 1);
        self.slots.push(Slot {
            generation: 1,
            value: Some(make(handle)),
        });
        handle
    }

    fn slot(&self, handle: Handle) -> Option<&Slot<T>> {
        if handle.kind() != Some(self.kind) {
            return None;
        }
        self.slots.get(handle.slot() as usize)
    }

    /// Look up a live entry
    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slot(handle)
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.value.as_ref())
    }

    /// Remove a live entry; the handle is never valid again
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        if handle.kind() != Some(self.kind) {
            return None;
        }
        let index = handle.slot();
        let slot = self.slots.get_mut(index as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }

        let value = slot.value.take()?;
        if slot.generation < MAX_GENERATION {
            slot.generation += 1;
            self.free.push(index);
        }
        Some(value)
    }

    /// Whether the handle was issued by this table and has since been removed
    pub fn was_closed(&self, handle: Handle) -> bool {
        match self.slot(handle) {
            Some(slot) => {
                let generation = handle.generation();
                generation >= 1
                    && (generation < slot.generation
                        || (generation == slot.generation && slot.retired()))
            }
            None => false,
        }
    }

    /// Handles of all live entries
    pub fn handles(&self) -> Vec<Handle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.value.is_some())
            .map(|(index, slot)| Handle::new(self.kind, index as u32, slot.generation))
            .collect()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.value.is_some()).count()
    }

    /// Whether no entry is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Thread-safe table of reference-counted objects
pub struct Registry<T> {
    kind: HandleKind,
    table: Mutex<HandleTable<Arc<T>>>,
}

impl<T> Registry<T> {
    /// Create an empty registry
    pub fn new(kind: HandleKind) -> Self {
        Self {
            kind,
            table: Mutex::new(HandleTable::new(kind)),
        }
    }

    /// Insert an object built from its own handle
    pub fn insert_with(&self, make: impl FnOnce(Handle) -> T) -> (Handle, Arc<T>) {
        let mut table = self.table.lock();
        let handle = table.insert_with(|handle| Arc::new(make(handle)));
        let object = table
            .get(handle)
            .cloned()
            .unwrap_or_else(|| unreachable!("freshly inserted handle {} is live", handle));
        (handle, object)
    }

    /// Look up a live object, failing with a handle error otherwise
    pub fn get(&self, handle: Handle) -> Result<Arc<T>> {
        let table = self.table.lock();
        if let Some(object) = table.get(handle) {
            return Ok(object.clone());
        }
        if table.was_closed(handle) {
            Err(MeshError::Handle(format!("{} is closed", handle)))
        } else {
            Err(MeshError::Handle(format!("unknown {} handle {}", self.kind, handle)))
        }
    }

    /// Remove a live object
    pub fn remove(&self, handle: Handle) -> Option<Arc<T>> {
        self.table.lock().remove(handle)
    }

    /// Whether the handle was issued here and already removed
    pub fn was_closed(&self, handle: Handle) -> bool {
        self.table.lock().was_closed(handle)
    }

    /// Handles of all live objects
    pub fn handles(&self) -> Vec<Handle> {
        self.table.lock().handles()
    }

    /// Number of live objects
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// Whether no object is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
