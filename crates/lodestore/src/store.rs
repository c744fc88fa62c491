//! The store: tables, status machine, and the single write path.
//!
//! A [`Store`] is a cheap clonable handle (`Rc` inside) to one store
//! instance. All state lives behind a `RefCell`; the scheduling model is
//! single-threaded cooperative and no operation suspends mid-method.
//!
//! Re-entrancy discipline: every public operation mutates the tables under
//! one scoped borrow while *collecting* collaborator notifications
//! (materialized records, nested stores, the source) as [`Effect`]s, then
//! releases the borrow and dispatches them. Callbacks are therefore free to
//! read — or re-enter — the store.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use smallvec::SmallVec;
use tracing::{debug, warn};

use lodestore_error::{Result, StoreError};
use lodestore_types::{AttributeHash, AttributeValue, RecordId, RecordStatus, RecordType, StoreKey};

use crate::commit::Changeset;
use crate::config::StoreConfig;
use crate::data::DataTable;
use crate::journal::MutationJournal;
use crate::query::{LocalQuery, QueryRegistry, RemoteQuery};
use crate::record::{MaterializedRecord, RecordMaterializer};
use crate::registry::KeyRegistry;
use crate::scheduler::{DeferredHook, DeferredTask, TickQueue};
use crate::source::Source;

/// Outcome of a write through [`Store::update_hash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Written {
    /// The patch went through the write path (it may have been a no-op).
    Applied,
    /// The write was refused: a dirty write against a record that is not
    /// ready.
    Refused,
}

impl Written {
    /// Whether the write went through.
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Shared core of one store instance.
pub(crate) struct StoreShared {
    pub(crate) config: StoreConfig,
    /// Parent overlay link; `None` for a root store. Children hold their
    /// parent strongly, parents hold children weakly, so there is no cycle.
    pub(crate) parent: Option<Rc<StoreShared>>,
    pub(crate) state: RefCell<StoreState>,
}

/// All mutable tables of one store.
pub(crate) struct StoreState {
    /// Identity tables. Authoritative at the root; unused in overlays.
    pub(crate) registry: KeyRegistry,
    pub(crate) statuses: HashMap<StoreKey, RecordStatus>,
    pub(crate) data: DataTable,
    pub(crate) journal: MutationJournal,
    pub(crate) records: HashMap<StoreKey, Rc<dyn MaterializedRecord>>,
    pub(crate) materializers: HashMap<RecordType, RecordMaterializer>,
    pub(crate) children: Vec<Weak<StoreShared>>,
    pub(crate) queries: QueryRegistry,
    pub(crate) tick: TickQueue,
    pub(crate) hook: Option<Rc<dyn DeferredHook>>,
    pub(crate) source: Option<Rc<dyn Source>>,
    pub(crate) access_clock: u64,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            registry: KeyRegistry::default(),
            statuses: HashMap::new(),
            data: DataTable::default(),
            journal: MutationJournal::default(),
            records: HashMap::new(),
            materializers: HashMap::new(),
            children: Vec::new(),
            queries: QueryRegistry::default(),
            tick: TickQueue::default(),
            hook: None,
            source: None,
            access_clock: 0,
        }
    }
}

/// A collaborator notification collected during a mutation and dispatched
/// after the state borrow is released.
///
/// Record handles are captured at creation time: a record destroyed and
/// unloaded within one operation still hears its final transition.
pub(crate) enum Effect {
    /// Attributes changed: notify the materialized record and every nested
    /// store.
    DataChanged {
        sk: StoreKey,
        keys: SmallVec<[String; 4]>,
        record: Option<Rc<dyn MaterializedRecord>>,
    },
    /// Status changed: notify the materialized record and every nested
    /// store.
    StatusChanged {
        sk: StoreKey,
        previous: RecordStatus,
        next: RecordStatus,
        record: Option<Rc<dyn MaterializedRecord>>,
    },
    /// The record was unloaded; its object gets a final callback.
    Unloaded { record: Rc<dyn MaterializedRecord> },
    /// A deferred task became pending; tell the host hook.
    TaskScheduled { task: DeferredTask },
    /// Ask the source for one record.
    FetchRecord { ty: RecordType, id: RecordId },
    /// Ask the source to re-fetch a loaded record.
    RefreshRecord { ty: RecordType, id: RecordId },
    /// Ask the source for all records of a type.
    FetchRecords { ty: RecordType },
    /// Ask the source for a remote query's results.
    FetchQuery { query: Rc<dyn RemoteQuery> },
    /// Hand a built changeset to the source.
    CommitToSource { changeset: Changeset },
    /// Re-evaluate a local query.
    RefreshQuery { query: Rc<dyn LocalQuery> },
}

impl Effect {
    pub(crate) fn data_changed(
        state: &StoreState,
        sk: StoreKey,
        keys: SmallVec<[String; 4]>,
    ) -> Self {
        Self::DataChanged {
            sk,
            keys,
            record: state.records.get(&sk).cloned(),
        }
    }

    pub(crate) fn status_changed(
        state: &StoreState,
        sk: StoreKey,
        previous: RecordStatus,
        next: RecordStatus,
    ) -> Self {
        Self::StatusChanged {
            sk,
            previous,
            next,
            record: state.records.get(&sk).cloned(),
        }
    }
}

/// Client-side record store handle.
///
/// Clones share the same underlying store.
#[derive(Clone)]
pub struct Store {
    pub(crate) shared: Rc<StoreShared>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("nested", &self.is_nested())
            .finish_non_exhaustive()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Create a root store with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Create a root store.
    #[must_use]
    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            shared: Rc::new(StoreShared {
                config,
                parent: None,
                state: RefCell::new(StoreState::default()),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Rc<StoreShared>) -> Self {
        Self { shared }
    }

    /// Attach the remote source.
    pub fn set_source(&self, source: Rc<dyn Source>) {
        self.shared.state.borrow_mut().source = Some(source);
    }

    /// Attach a host hook observing deferred-task scheduling.
    pub fn set_deferred_hook(&self, hook: Rc<dyn DeferredHook>) {
        self.shared.state.borrow_mut().hook = Some(hook);
    }

    /// Register the constructor used to materialize records of `ty`.
    pub fn register_materializer(&self, ty: RecordType, materializer: RecordMaterializer) {
        self.shared
            .state
            .borrow_mut()
            .materializers
            .insert(ty, materializer);
    }

    /// Whether this store is a nested overlay.
    #[must_use]
    pub fn is_nested(&self) -> bool {
        self.shared.parent.is_some()
    }

    /// The parent store, for overlays.
    #[must_use]
    pub fn parent(&self) -> Option<Store> {
        self.shared.parent.clone().map(Store::from_shared)
    }

    /// This store's configuration.
    #[must_use]
    pub fn config(&self) -> StoreConfig {
        self.shared.config
    }

    fn root_shared(&self) -> Rc<StoreShared> {
        let mut shared = self.shared.clone();
        while let Some(parent) = shared.parent.clone() {
            shared = parent;
        }
        shared
    }

    /// Run `f` against the identity registry (always the root's).
    ///
    /// Must not be called while the root's state is already borrowed; locked
    /// code on the root uses `state.registry` directly instead.
    pub(crate) fn with_registry<R>(&self, f: impl FnOnce(&mut KeyRegistry) -> R) -> R {
        let root = self.root_shared();
        let mut state = root.state.borrow_mut();
        f(&mut state.registry)
    }

    pub(crate) fn record_type_locked(
        &self,
        state: &StoreState,
        sk: StoreKey,
    ) -> Option<RecordType> {
        if self.shared.parent.is_none() {
            state.registry.type_of(sk)
        } else {
            self.with_registry(|reg| reg.type_of(sk))
        }
    }

    // ------------------------------------------------------------------
    // Key registry surface
    // ------------------------------------------------------------------

    /// Existing key for `(ty, id)` if mapped, else a fresh allocation.
    pub fn store_key_for(&self, ty: RecordType, id: Option<&RecordId>) -> StoreKey {
        self.with_registry(|reg| reg.key_for(ty, id))
    }

    /// Key for `(ty, id)` without allocating.
    #[must_use]
    pub fn lookup_store_key(&self, ty: RecordType, id: &RecordId) -> Option<StoreKey> {
        self.with_registry(|reg| reg.lookup(ty, id))
    }

    /// The server id mapped to `sk`, if one was assigned.
    #[must_use]
    pub fn id_for(&self, sk: StoreKey) -> Option<RecordId> {
        self.with_registry(|reg| reg.id_of(sk).cloned())
    }

    /// The record type `sk` was allocated for.
    #[must_use]
    pub fn record_type_of(&self, sk: StoreKey) -> Option<RecordType> {
        self.with_registry(|reg| reg.type_of(sk))
    }

    /// All keys of `ty`, in allocation order.
    #[must_use]
    pub fn store_keys_of(&self, ty: RecordType) -> Vec<StoreKey> {
        self.with_registry(|reg| reg.keys_of(ty))
    }

    /// Bind a server id to `sk` and patch the primary-key attribute through
    /// the normal update path, so observers fire.
    pub fn set_id_for_store_key(&self, sk: StoreKey, id: RecordId) -> Result<()> {
        if self.is_nested() {
            return Err(StoreError::UnsupportedOnNested {
                operation: "set_id_for_store_key",
            });
        }
        let ty = self
            .record_type_of(sk)
            .ok_or(StoreError::UnknownStoreKey { store_key: sk })?;
        self.with_registry(|reg| reg.assign_id(sk, id.clone()))
            .map_err(|id| StoreError::DuplicateId {
                type_name: ty.name(),
                id,
            })?;
        let mut patch = AttributeHash::new();
        patch.insert(ty.primary_key().to_owned(), id.to_value());
        let _ = self.update_hash(sk, &patch, false);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Status table
    // ------------------------------------------------------------------

    /// Current status of `sk` (`EMPTY` when nothing is known).
    ///
    /// In a nested store this reads through to the parent unless the overlay
    /// holds its own status for the key.
    #[must_use]
    pub fn status(&self, sk: StoreKey) -> RecordStatus {
        if let Some(status) = self.shared.state.borrow().statuses.get(&sk) {
            return *status;
        }
        match &self.shared.parent {
            Some(parent) => Store::from_shared(parent.clone()).status(sk),
            None => RecordStatus::EMPTY,
        }
    }

    pub(crate) fn status_locked(&self, state: &StoreState, sk: StoreKey) -> RecordStatus {
        if let Some(status) = state.statuses.get(&sk) {
            return *status;
        }
        match &self.shared.parent {
            Some(parent) => Store::from_shared(parent.clone()).status(sk),
            None => RecordStatus::EMPTY,
        }
    }

    /// The single mutation point for record status.
    pub(crate) fn set_status_locked(
        &self,
        state: &mut StoreState,
        sk: StoreKey,
        next: RecordStatus,
        effects: &mut Vec<Effect>,
    ) {
        let previous = self.status_locked(state, sk);
        if previous == next {
            return;
        }
        debug_assert!(
            next.has_single_core_state(),
            "status must carry exactly one core state, got {next:?}"
        );
        state.statuses.insert(sk, next);
        debug!(store_key = %sk, previous = ?previous, next = ?next, "record status changed");
        effects.push(Effect::status_changed(state, sk, previous, next));
    }

    /// Remove an overlay's local status for `sk`, falling back to the
    /// parent's view.
    pub(crate) fn drop_status_override_locked(
        &self,
        state: &mut StoreState,
        sk: StoreKey,
        effects: &mut Vec<Effect>,
    ) {
        if let Some(previous) = state.statuses.remove(&sk) {
            let next = self.status_locked(state, sk);
            if previous != next {
                effects.push(Effect::status_changed(state, sk, previous, next));
            }
        }
    }

    /// OR a single modifier flag into the status.
    pub(crate) fn or_status_locked(
        &self,
        state: &mut StoreState,
        sk: StoreKey,
        flag: RecordStatus,
        effects: &mut Vec<Effect>,
    ) {
        let status = self.status_locked(state, sk);
        self.set_status_locked(state, sk, status | flag, effects);
    }

    // ------------------------------------------------------------------
    // Data table reads
    // ------------------------------------------------------------------

    /// The record's current attribute hash, reading through to the parent in
    /// an overlay. Stamps the access counter.
    #[must_use]
    pub fn read_data_hash(&self, sk: StoreKey) -> Option<AttributeHash> {
        {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            state.access_clock += 1;
            let clock = state.access_clock;
            if let Some(slot) = state.data.existing_slot_mut(sk) {
                if let Some(data) = &slot.data {
                    slot.last_access = clock;
                    return Some((**data).clone());
                }
            }
        }
        self.shared
            .parent
            .as_ref()
            .and_then(|parent| Store::from_shared(parent.clone()).read_data_hash(sk))
    }

    /// One attribute of the record's current hash.
    #[must_use]
    pub fn read_attribute(&self, sk: StoreKey, key: &str) -> Option<AttributeValue> {
        self.data_rc(sk).and_then(|hash| hash.get(key).cloned())
    }

    /// Access counter stamped by the last read/materialization of `sk`.
    #[must_use]
    pub fn last_access(&self, sk: StoreKey) -> u64 {
        self.shared
            .state
            .borrow()
            .data
            .slot(sk)
            .map_or(0, |slot| slot.last_access)
    }

    /// The committed snapshot for `sk`, present iff local edits exist or a
    /// commit is being assembled.
    #[must_use]
    pub fn committed_snapshot(&self, sk: StoreKey) -> Option<AttributeHash> {
        self.shared
            .state
            .borrow()
            .data
            .slot(sk)
            .and_then(|slot| slot.committed.clone())
    }

    /// The attribute names currently dirty against the committed snapshot.
    #[must_use]
    pub fn changed_attributes(&self, sk: StoreKey) -> Vec<String> {
        self.shared
            .state
            .borrow()
            .data
            .slot(sk)
            .map(crate::data::DataSlot::dirty_attributes)
            .unwrap_or_default()
    }

    /// Store keys journaled for creation, in insertion order.
    #[must_use]
    pub fn pending_created(&self) -> Vec<StoreKey> {
        self.shared
            .state
            .borrow()
            .journal
            .created
            .iter()
            .copied()
            .collect()
    }

    /// Store keys journaled for destruction, in insertion order.
    #[must_use]
    pub fn pending_destroyed(&self) -> Vec<StoreKey> {
        self.shared
            .state
            .borrow()
            .journal
            .destroyed
            .iter()
            .copied()
            .collect()
    }

    /// Store keys with journaled attribute edits, in insertion order.
    #[must_use]
    pub fn pending_changed(&self) -> Vec<StoreKey> {
        self.shared
            .state
            .borrow()
            .journal
            .changed
            .iter()
            .copied()
            .collect()
    }

    /// Whether any mutation awaits commit.
    #[must_use]
    pub fn has_pending_changes(&self) -> bool {
        !self.shared.state.borrow().journal.is_empty()
    }

    /// The live hash by identity, walking the overlay chain. No access
    /// stamp.
    pub(crate) fn data_rc(&self, sk: StoreKey) -> Option<Rc<AttributeHash>> {
        if let Some(slot) = self.shared.state.borrow().data.slot(sk) {
            if let Some(data) = &slot.data {
                return Some(data.clone());
            }
        }
        self.shared
            .parent
            .as_ref()
            .and_then(|parent| Store::from_shared(parent.clone()).data_rc(sk))
    }

    /// The parent chain's live hash for `sk` (never this store's own slot).
    pub(crate) fn inherited_rc(&self, sk: StoreKey) -> Option<Rc<AttributeHash>> {
        self.parent().and_then(|parent| parent.data_rc(sk))
    }

    // ------------------------------------------------------------------
    // Update path
    // ------------------------------------------------------------------

    /// The sole write path for record data.
    ///
    /// With `dirty = true` this is a user edit: the committed snapshot and
    /// per-attribute dirty flags are maintained, `DIRTY` is set or cleared
    /// from the surviving flags, and a commit is scheduled under
    /// auto-commit. With `dirty = false` the hash is mutated in place (used
    /// by reconciliation and id assignment).
    ///
    /// A dirty write against a record that is not `READY` is refused softly:
    /// a warning is logged and [`Written::Refused`] returned.
    pub fn update_hash(&self, sk: StoreKey, patch: &AttributeHash, dirty: bool) -> Written {
        let mut effects = Vec::new();
        let outcome = {
            let mut guard = self.shared.state.borrow_mut();
            self.update_hash_locked(&mut guard, sk, patch, dirty, &mut effects)
        };
        self.dispatch_effects(effects);
        outcome
    }

    pub(crate) fn update_hash_locked(
        &self,
        state: &mut StoreState,
        sk: StoreKey,
        patch: &AttributeHash,
        mut dirty: bool,
        effects: &mut Vec<Effect>,
    ) -> Written {
        let status = self.status_locked(state, sk);

        // A locally-created record is pending creation as a whole; edits to
        // it carry no dirty-against-committed semantics.
        if status.contains(RecordStatus::READY | RecordStatus::NEW) {
            dirty = false;
        }

        if dirty && !status.is_ready() {
            warn!(store_key = %sk, status = ?status, "dirty write to a record that is not ready; refused");
            return Written::Refused;
        }

        // Overlay copy-on-write: pull the parent's hash in by identity
        // before the first local write.
        if self.is_nested() && !state.data.has_own_data(sk) {
            if let Some(inherited) = self.inherited_rc(sk) {
                state.data.slot_mut(sk).data = Some(inherited);
            }
        }

        let slot = state.data.slot_mut(sk);
        if slot.data.is_none() {
            slot.data = Some(Rc::new(AttributeHash::new()));
        }

        let mut changed_keys: SmallVec<[String; 4]> = SmallVec::new();
        if dirty {
            if slot.committed.is_none() {
                slot.committed = Some((**slot.data.as_ref().expect("data present")).clone());
            }
            if slot.changed.is_none() {
                slot.changed = Some(HashMap::new());
            }
            let committed = slot.committed.clone().expect("committed snapshot present");
            let data = Rc::make_mut(slot.data.as_mut().expect("data present"));
            let changed = slot.changed.as_mut().expect("changed map present");
            for (key, value) in patch {
                if data.get(key) != Some(value) {
                    data.insert(key.clone(), value.clone());
                    changed.insert(key.clone(), committed.get(key) != Some(value));
                    changed_keys.push(key.clone());
                }
            }

            if slot.seen_change() {
                state.journal.changed.insert(sk);
                self.set_status_locked(state, sk, status | RecordStatus::DIRTY, effects);
                if self.shared.config.auto_commit {
                    self.schedule_locked(state, DeferredTask::Commit, effects);
                }
            } else {
                let slot = state.data.slot_mut(sk);
                slot.clear_edits();
                state.journal.changed.shift_remove(&sk);
                if self.is_nested() {
                    // Every edit reverted: fall back to parent inheritance,
                    // for the data slot and the status override alike.
                    let slot = state.data.slot_mut(sk);
                    slot.data = None;
                    self.drop_status_override_locked(state, sk, effects);
                } else if status.is_dirty() {
                    self.set_status_locked(state, sk, status - RecordStatus::DIRTY, effects);
                }
            }
        } else {
            let data = Rc::make_mut(slot.data.as_mut().expect("data present"));
            for (key, value) in patch {
                if data.get(key) != Some(value) {
                    data.insert(key.clone(), value.clone());
                    changed_keys.push(key.clone());
                }
            }
        }

        if !changed_keys.is_empty() {
            effects.push(Effect::data_changed(state, sk, changed_keys));
            if let Some(ty) = self.record_type_locked(state, sk) {
                self.mark_record_set_changed_locked(state, ty, effects);
            }
        }
        Written::Applied
    }

    /// Erase all local edits by replaying the committed snapshot through the
    /// write path. A no-op when the record is clean.
    pub fn revert_hash(&self, sk: StoreKey) {
        let mut effects = Vec::new();
        {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            let Some(slot) = state.data.existing_slot_mut(sk) else {
                return;
            };
            let Some(committed) = slot.committed.clone() else {
                return;
            };
            let reverted_keys = Self::replace_hash_in_slot(slot, &committed);
            slot.clear_edits();
            state.journal.changed.shift_remove(&sk);
            if self.is_nested() {
                let slot = state.data.slot_mut(sk);
                slot.data = None;
                self.drop_status_override_locked(state, sk, &mut effects);
            } else {
                let status = self.status_locked(state, sk);
                if status.is_dirty() {
                    self.set_status_locked(state, sk, status - RecordStatus::DIRTY, &mut effects);
                }
            }
            if !reverted_keys.is_empty() {
                effects.push(Effect::data_changed(state, sk, reverted_keys));
                if let Some(ty) = self.record_type_locked(state, sk) {
                    self.mark_record_set_changed_locked(state, ty, &mut effects);
                }
            }
        }
        self.dispatch_effects(effects);
    }

    /// Replace the slot's live hash wholesale, returning the keys whose
    /// values differ in either direction (including removals).
    pub(crate) fn replace_hash_in_slot(
        slot: &mut crate::data::DataSlot,
        next: &AttributeHash,
    ) -> SmallVec<[String; 4]> {
        let mut keys: SmallVec<[String; 4]> = SmallVec::new();
        if let Some(current) = &slot.data {
            for (key, value) in current.iter() {
                if next.get(key) != Some(value) {
                    keys.push(key.clone());
                }
            }
            for key in next.keys() {
                if !current.contains_key(key) {
                    keys.push(key.clone());
                }
            }
        } else {
            keys.extend(next.keys().cloned());
        }
        slot.data = Some(Rc::new(next.clone()));
        keys
    }

    // ------------------------------------------------------------------
    // Materialized records
    // ------------------------------------------------------------------

    /// The materialized record for `sk`, creating it through the registered
    /// materializer on first use.
    #[must_use]
    pub fn materialize_record(&self, sk: StoreKey) -> Option<Rc<dyn MaterializedRecord>> {
        if let Some(record) = self.shared.state.borrow().records.get(&sk).cloned() {
            return Some(record);
        }
        let ty = self.record_type_of(sk)?;
        let materializer = self.materializer_for(ty)?;
        let record = materializer(self, sk);
        let mut guard = self.shared.state.borrow_mut();
        let state = &mut *guard;
        state.access_clock += 1;
        let clock = state.access_clock;
        state.data.slot_mut(sk).last_access = clock;
        Some(state.records.entry(sk).or_insert(record).clone())
    }

    /// The already-materialized record for `sk`, if any.
    #[must_use]
    pub fn record_for(&self, sk: StoreKey) -> Option<Rc<dyn MaterializedRecord>> {
        self.shared.state.borrow().records.get(&sk).cloned()
    }

    fn materializer_for(&self, ty: RecordType) -> Option<RecordMaterializer> {
        if let Some(m) = self.shared.state.borrow().materializers.get(&ty).cloned() {
            return Some(m);
        }
        self.parent().and_then(|parent| parent.materializer_for(ty))
    }

    // ------------------------------------------------------------------
    // Unloading
    // ------------------------------------------------------------------

    /// Whether `sk` may be unloaded: clean core state, no modifier bits, no
    /// observers, and every nested store concurs.
    #[must_use]
    pub fn may_unload_record(&self, sk: StoreKey) -> bool {
        if !self.status(sk).is_unloadable() {
            return false;
        }
        if self
            .record_for(sk)
            .is_some_and(|record| record.has_observers())
        {
            return false;
        }
        self.live_children()
            .iter()
            .all(|child| child.concurs_unload(sk))
    }

    /// Fully remove `sk` and all its table entries.
    pub fn unload_record(&self, sk: StoreKey) -> Result<()> {
        if self.is_nested() {
            return Err(StoreError::UnsupportedOnNested {
                operation: "unload_record",
            });
        }
        let status = self.status(sk);
        if !status.is_unloadable() {
            return Err(StoreError::UnloadRefused {
                store_key: sk,
                status,
                reason: "record is mid-lifecycle",
            });
        }
        if self
            .record_for(sk)
            .is_some_and(|record| record.has_observers())
        {
            return Err(StoreError::UnloadRefused {
                store_key: sk,
                status,
                reason: "record has observers",
            });
        }
        if !self
            .live_children()
            .iter()
            .all(|child| child.concurs_unload(sk))
        {
            return Err(StoreError::UnloadRefused {
                store_key: sk,
                status,
                reason: "a nested store still uses the record",
            });
        }
        let mut effects = Vec::new();
        {
            let mut guard = self.shared.state.borrow_mut();
            self.unload_locked(&mut guard, sk, &mut effects);
        }
        self.dispatch_effects(effects);
        Ok(())
    }

    /// Drop every trace of `sk` from the tables. Used by both the gated
    /// public unload and the reconciliation engine's forced unloads.
    pub(crate) fn unload_locked(
        &self,
        state: &mut StoreState,
        sk: StoreKey,
        effects: &mut Vec<Effect>,
    ) {
        debug!(store_key = %sk, "record unloaded");
        if let Some(record) = state.records.remove(&sk) {
            effects.push(Effect::Unloaded { record });
        }
        state.data.remove(sk);
        state.statuses.remove(&sk);
        state.journal.forget(sk);
        if self.shared.parent.is_none() {
            state.registry.remove(sk);
        }
    }

    // ------------------------------------------------------------------
    // Retrieval
    // ------------------------------------------------------------------

    /// Ask the source for `(ty, id)`, allocating its key and flagging it
    /// `LOADING`. On a `READY` record this refreshes instead. Records that
    /// are dirty, committing, new, or already loading are left alone.
    pub fn retrieve_record(&self, ty: RecordType, id: &RecordId) -> Result<StoreKey> {
        if self.is_nested() {
            return Err(StoreError::UnsupportedOnNested {
                operation: "retrieve_record",
            });
        }
        if self.shared.state.borrow().source.is_none() {
            return Err(StoreError::NoSource);
        }
        let sk = self.store_key_for(ty, Some(id));
        let mut effects = Vec::new();
        {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            let status = self.status_locked(state, sk);
            if status.contains(RecordStatus::LOADING)
                || status.is_dirty()
                || status.is_committing()
                || status.is_new()
            {
                // In flight or locally mutated; nothing to start.
            } else if status.is_ready() {
                self.set_status_locked(state, sk, status | RecordStatus::LOADING, &mut effects);
                effects.push(Effect::RefreshRecord { ty, id: id.clone() });
            } else {
                self.set_status_locked(
                    state,
                    sk,
                    RecordStatus::EMPTY | RecordStatus::LOADING,
                    &mut effects,
                );
                effects.push(Effect::FetchRecord { ty, id: id.clone() });
            }
        }
        self.dispatch_effects(effects);
        Ok(sk)
    }

    /// Batch form of [`retrieve_record`](Store::retrieve_record).
    pub fn retrieve_records(&self, ty: RecordType, ids: &[RecordId]) -> Result<Vec<StoreKey>> {
        ids.iter().map(|id| self.retrieve_record(ty, id)).collect()
    }

    /// Explicitly re-fetch a `READY` record (typically after it was flagged
    /// obsolete).
    pub fn refresh_record(&self, ty: RecordType, id: &RecordId) -> Result<()> {
        if self.is_nested() {
            return Err(StoreError::UnsupportedOnNested {
                operation: "refresh_record",
            });
        }
        if self.shared.state.borrow().source.is_none() {
            return Err(StoreError::NoSource);
        }
        let Some(sk) = self.lookup_store_key(ty, id) else {
            return Ok(());
        };
        let mut effects = Vec::new();
        {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            let status = self.status_locked(state, sk);
            if status.is_ready() && !status.contains(RecordStatus::LOADING) {
                self.set_status_locked(state, sk, status | RecordStatus::LOADING, &mut effects);
                effects.push(Effect::RefreshRecord { ty, id: id.clone() });
            }
        }
        self.dispatch_effects(effects);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Deferred execution
    // ------------------------------------------------------------------

    /// Run the end-of-tick work: at most one commit and one query-refresh
    /// pass, regardless of how many mutations scheduled them.
    ///
    /// Only tasks pending when the flush starts are run; anything scheduled
    /// while they execute (acks from a synchronous source, re-queued
    /// records) waits for the next tick.
    pub fn flush_deferred(&self) {
        let mut tasks = Vec::new();
        {
            let mut state = self.shared.state.borrow_mut();
            while let Some(task) = state.tick.pop() {
                tasks.push(task);
            }
        }
        for task in tasks {
            match task {
                DeferredTask::Commit => {
                    if let Err(error) = self.commit_changes() {
                        warn!(%error, "deferred commit failed");
                    }
                }
                DeferredTask::RefreshQueries => self.refresh_live_queries(),
            }
        }
    }

    /// Whether any deferred task is pending.
    #[must_use]
    pub fn has_pending_deferred(&self) -> bool {
        !self.shared.state.borrow().tick.is_empty()
    }

    pub(crate) fn schedule_locked(
        &self,
        state: &mut StoreState,
        task: DeferredTask,
        effects: &mut Vec<Effect>,
    ) {
        if task == DeferredTask::Commit && self.is_nested() {
            // Overlays never talk to the source.
            return;
        }
        if state.tick.schedule(task) && state.hook.is_some() {
            effects.push(Effect::TaskScheduled { task });
        }
    }

    pub(crate) fn mark_record_set_changed_locked(
        &self,
        state: &mut StoreState,
        ty: RecordType,
        effects: &mut Vec<Effect>,
    ) {
        state.queries.mark_changed(ty);
        self.schedule_locked(state, DeferredTask::RefreshQueries, effects);
    }

    // ------------------------------------------------------------------
    // Effect dispatch
    // ------------------------------------------------------------------

    pub(crate) fn live_children(&self) -> Vec<Store> {
        self.shared
            .state
            .borrow()
            .children
            .iter()
            .filter_map(Weak::upgrade)
            .map(Store::from_shared)
            .collect()
    }

    pub(crate) fn source_handle(&self) -> Option<Rc<dyn Source>> {
        self.shared.state.borrow().source.clone()
    }

    pub(crate) fn dispatch_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::DataChanged { sk, keys, record } => {
                    if let Some(record) = record {
                        record.begin_property_changes();
                        for key in &keys {
                            record.property_did_change(key);
                        }
                        record.end_property_changes();
                    }
                    for child in self.live_children() {
                        child.parent_did_change_data(sk, &keys);
                    }
                }
                Effect::StatusChanged {
                    sk,
                    previous,
                    next,
                    record,
                } => {
                    if let Some(record) = record {
                        record.status_did_change(previous, next);
                    }
                    for child in self.live_children() {
                        child.parent_did_change_status(sk, previous, next);
                    }
                }
                Effect::Unloaded { record } => {
                    record.store_will_unload();
                }
                Effect::TaskScheduled { task } => {
                    let hook = self.shared.state.borrow().hook.clone();
                    if let Some(hook) = hook {
                        hook.task_scheduled(task);
                    }
                }
                Effect::FetchRecord { ty, id } => {
                    if let Some(source) = self.source_handle() {
                        source.fetch_record(self, ty, &id);
                    }
                }
                Effect::RefreshRecord { ty, id } => {
                    if let Some(source) = self.source_handle() {
                        source.refresh_record(self, ty, &id);
                    }
                }
                Effect::FetchRecords { ty } => {
                    if let Some(source) = self.source_handle() {
                        source.fetch_records(self, ty);
                    }
                }
                Effect::FetchQuery { query } => {
                    if let Some(source) = self.source_handle() {
                        source.fetch_query(self, &query);
                    }
                }
                Effect::CommitToSource { changeset } => {
                    if let Some(source) = self.source_handle() {
                        crate::metrics::count_commit();
                        source.commit_changes(self, changeset);
                    } else {
                        warn!("changeset built but no source is attached; dropped");
                    }
                }
                Effect::RefreshQuery { query } => {
                    query.refresh(self);
                }
            }
        }
    }
}
