//! Per-record data slots.
//!
//! Each loaded record owns one [`DataSlot`]: the live attribute hash plus
//! the bookkeeping snapshots the lifecycle needs. The live hash is held
//! behind `Rc` so a nested store can inherit it *by identity*; the first
//! write in the overlay clones it (`Rc::make_mut`), which is the whole
//! copy-on-write protocol.
//!
//! Snapshot roles:
//! - `committed` — the hash as last acknowledged by the source; present iff
//!   local edits exist (or a commit is being assembled).
//! - `changed` — per-attribute dirty flags against `committed`.
//! - `rollback` — `committed` as captured at commit dispatch; consulted on
//!   commit failure and on concurrent server pushes.

use std::collections::HashMap;
use std::rc::Rc;

use lodestore_types::{AttributeHash, StoreKey};

/// State for one record's data.
#[derive(Debug, Default)]
pub(crate) struct DataSlot {
    /// The authoritative in-memory hash. `None` in a nested store means the
    /// slot is inherited from the parent (copy-on-write not yet triggered).
    pub(crate) data: Option<Rc<AttributeHash>>,
    /// Snapshot of `data` at the moment local edits began.
    pub(crate) committed: Option<AttributeHash>,
    /// attribute → true iff its current value differs from `committed`.
    pub(crate) changed: Option<HashMap<String, bool>>,
    /// Snapshot captured when a commit was dispatched.
    pub(crate) rollback: Option<AttributeHash>,
    /// Store-local access counter for external memory managers.
    pub(crate) last_access: u64,
}

impl DataSlot {
    /// Whether any per-attribute dirty flag is set.
    pub(crate) fn seen_change(&self) -> bool {
        self.changed
            .as_ref()
            .is_some_and(|changed| changed.values().any(|dirty| *dirty))
    }

    /// The attribute names currently flagged dirty.
    pub(crate) fn dirty_attributes(&self) -> Vec<String> {
        self.changed
            .as_ref()
            .map(|changed| {
                changed
                    .iter()
                    .filter(|(_, dirty)| **dirty)
                    .map(|(key, _)| key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop the edit bookkeeping (`committed` + `changed`), keeping `data`.
    pub(crate) fn clear_edits(&mut self) {
        self.committed = None;
        self.changed = None;
    }
}

/// All data slots of one store, keyed by store key.
#[derive(Debug, Default)]
pub(crate) struct DataTable {
    slots: HashMap<StoreKey, DataSlot>,
}

impl DataTable {
    pub(crate) fn slot(&self, sk: StoreKey) -> Option<&DataSlot> {
        self.slots.get(&sk)
    }

    pub(crate) fn slot_mut(&mut self, sk: StoreKey) -> &mut DataSlot {
        self.slots.entry(sk).or_default()
    }

    pub(crate) fn existing_slot_mut(&mut self, sk: StoreKey) -> Option<&mut DataSlot> {
        self.slots.get_mut(&sk)
    }

    pub(crate) fn remove(&mut self, sk: StoreKey) {
        self.slots.remove(&sk);
    }

    /// Whether this table owns a hash for `sk` (as opposed to inheriting).
    pub(crate) fn has_own_data(&self, sk: StoreKey) -> bool {
        self.slots.get(&sk).is_some_and(|slot| slot.data.is_some())
    }

    /// Keys with any local state in this table.
    pub(crate) fn keys(&self) -> Vec<StoreKey> {
        self.slots.keys().copied().collect()
    }
}
