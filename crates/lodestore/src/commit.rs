//! Record creation/destruction and the commit coordinator.
//!
//! User mutations accumulate in the journal; once per tick the coordinator
//! builds a per-type changeset, transitions the affected records to
//! `COMMITTING`, and hands the batch to the source. Records the build must
//! wait on — already mid-commit, or a destroy still waiting for its
//! create-ack to learn the server id — stay journaled for the next tick.

use indexmap::IndexMap;
use tracing::warn;

use lodestore_error::{Result, StoreError};
use lodestore_types::{AttributeHash, RecordId, RecordStatus, RecordType, StoreKey};

use crate::scheduler::DeferredTask;
use crate::store::{Effect, Store};

/// Records of one type to create upstream.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct CreateBatch {
    pub store_keys: Vec<StoreKey>,
    pub records: Vec<AttributeHash>,
}

/// Records of one type with attribute edits to persist.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct UpdateBatch {
    pub store_keys: Vec<StoreKey>,
    pub records: Vec<AttributeHash>,
    /// Per record, the attribute names that changed since the last commit.
    pub changes: Vec<Vec<String>>,
}

/// Records of one type to destroy upstream.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct DestroyBatch {
    pub store_keys: Vec<StoreKey>,
    pub ids: Vec<RecordId>,
}

/// All pending mutations of one record type.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct TypeChangeset {
    pub create: CreateBatch,
    pub update: UpdateBatch,
    pub destroy: DestroyBatch,
}

impl TypeChangeset {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.create.store_keys.is_empty()
            && self.update.store_keys.is_empty()
            && self.destroy.store_keys.is_empty()
    }
}

/// The batch handed to [`Source::commit_changes`](crate::Source::commit_changes),
/// keyed by record type name in first-touched order.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct Changeset {
    pub by_type: IndexMap<&'static str, TypeChangeset>,
}

impl Changeset {
    /// The (possibly fresh) per-type bucket for `ty`.
    pub fn entry(&mut self, ty: RecordType) -> &mut TypeChangeset {
        self.by_type.entry(ty.name()).or_default()
    }

    /// The bucket for a type name, if the changeset touches it.
    #[must_use]
    pub fn get(&self, type_name: &str) -> Option<&TypeChangeset> {
        self.by_type.get(type_name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_type.values().all(TypeChangeset::is_empty)
    }
}

impl Store {
    // ------------------------------------------------------------------
    // Create / destroy
    // ------------------------------------------------------------------

    /// Create a record locally: status `READY|NEW`, journaled for the next
    /// commit. The key is the id-mapped one when `hash` carries the
    /// primary-key attribute, else a fresh allocation.
    pub fn create_record(&self, ty: RecordType, hash: AttributeHash) -> Result<StoreKey> {
        if self.is_nested() {
            return Err(StoreError::UnsupportedOnNested {
                operation: "create_record",
            });
        }
        let id = ty.id_of(&hash);
        let sk = self.store_key_for(ty, id.as_ref());
        self.create_record_at(sk, hash)?;
        Ok(sk)
    }

    /// Create a record at an already-allocated key.
    ///
    /// Valid only from a clean `EMPTY` or `DESTROYED` status.
    pub fn create_record_at(&self, sk: StoreKey, hash: AttributeHash) -> Result<()> {
        if self.is_nested() {
            return Err(StoreError::UnsupportedOnNested {
                operation: "create_record",
            });
        }
        let mut effects = Vec::new();
        {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            let status = self.status_locked(state, sk);
            let creatable = status == RecordStatus::EMPTY || status == RecordStatus::DESTROYED;
            if !creatable {
                return Err(StoreError::CreateOnExisting {
                    store_key: sk,
                    status,
                });
            }
            let slot = state.data.slot_mut(sk);
            let keys = Self::replace_hash_in_slot(slot, &hash);
            slot.clear_edits();
            slot.rollback = None;
            self.set_status_locked(
                state,
                sk,
                RecordStatus::READY | RecordStatus::NEW,
                &mut effects,
            );
            state.journal.created.insert(sk);
            if self.shared.config.auto_commit {
                self.schedule_locked(state, DeferredTask::Commit, &mut effects);
            }
            if !keys.is_empty() {
                effects.push(Effect::data_changed(state, sk, keys));
            }
            if let Some(ty) = self.record_type_locked(state, sk) {
                self.mark_record_set_changed_locked(state, ty, &mut effects);
            }
        }
        self.dispatch_effects(effects);
        Ok(())
    }

    /// Destroy a record.
    ///
    /// A record that never reached the source (`READY|NEW`, no commit in
    /// flight) is dropped from the journal and unloaded on the spot. Any
    /// other loaded record has its local edits reverted, is journaled for a
    /// destroy, and keeps its `NEW` bit if a create-ack is still owed — the
    /// commit build waits for the server id before issuing the destroy.
    pub fn destroy_record(&self, sk: StoreKey) -> Result<()> {
        if self.is_nested() {
            return Err(StoreError::UnsupportedOnNested {
                operation: "destroy_record",
            });
        }
        let mut effects = Vec::new();
        {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            let status = self.status_locked(state, sk);
            if status == RecordStatus::READY | RecordStatus::NEW {
                state.journal.created.shift_remove(&sk);
                self.set_status_locked(state, sk, RecordStatus::DESTROYED, &mut effects);
                let ty = self.record_type_locked(state, sk);
                self.unload_locked(state, sk, &mut effects);
                if let Some(ty) = ty {
                    self.mark_record_set_changed_locked(state, ty, &mut effects);
                }
            } else if status.is_ready() {
                if status.is_dirty() {
                    if let Some(committed) = state
                        .data
                        .existing_slot_mut(sk)
                        .and_then(|slot| slot.committed.clone())
                    {
                        let slot = state.data.slot_mut(sk);
                        let keys = Self::replace_hash_in_slot(slot, &committed);
                        slot.clear_edits();
                        if !keys.is_empty() {
                            effects.push(Effect::data_changed(state, sk, keys));
                        }
                    }
                    state.journal.changed.shift_remove(&sk);
                }
                state.journal.destroyed.insert(sk);
                let next = RecordStatus::DESTROYED
                    | RecordStatus::DIRTY
                    | (status & (RecordStatus::OBSOLETE | RecordStatus::NEW));
                self.set_status_locked(state, sk, next, &mut effects);
                if self.shared.config.auto_commit {
                    self.schedule_locked(state, DeferredTask::Commit, &mut effects);
                }
                if let Some(ty) = self.record_type_locked(state, sk) {
                    self.mark_record_set_changed_locked(state, ty, &mut effects);
                }
            } else {
                return Err(StoreError::illegal("destroy", sk, status));
            }
        }
        self.dispatch_effects(effects);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commit
    // ------------------------------------------------------------------

    /// Build the pending changeset and hand it to the source.
    ///
    /// Safe to call any number of times per tick; under auto-commit the
    /// deferred executor already coalesces to one call. Records mid-commit
    /// stay journaled and ride the next build after their ack lands.
    pub fn commit_changes(&self) -> Result<()> {
        if self.is_nested() {
            return Err(StoreError::UnsupportedOnNested {
                operation: "commit_changes",
            });
        }
        let mut effects = Vec::new();
        {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            let mut changeset = Changeset::default();

            let created: Vec<StoreKey> = state.journal.created.drain(..).collect();
            for sk in created {
                let Some(ty) = state.registry.type_of(sk) else {
                    warn!(store_key = %sk, "journaled create for an unregistered key; dropped");
                    continue;
                };
                let Some(data) = state.data.slot(sk).and_then(|slot| slot.data.clone()) else {
                    warn!(store_key = %sk, "journaled create without data; dropped");
                    continue;
                };
                let bucket = changeset.entry(ty);
                bucket.create.store_keys.push(sk);
                bucket.create.records.push((*data).clone());
                let status = self.status_locked(state, sk);
                self.set_status_locked(state, sk, status | RecordStatus::COMMITTING, &mut effects);
            }

            let changed: Vec<StoreKey> = state.journal.changed.drain(..).collect();
            for sk in changed {
                let status = self.status_locked(state, sk);
                if status.is_committing() {
                    // Prior commit still in flight; ride the next build.
                    state.journal.changed.insert(sk);
                    continue;
                }
                let Some(ty) = state.registry.type_of(sk) else {
                    warn!(store_key = %sk, "journaled update for an unregistered key; dropped");
                    continue;
                };
                let Some(slot) = state.data.existing_slot_mut(sk) else {
                    continue;
                };
                slot.rollback = slot.committed.take();
                let dirty_attrs = slot.dirty_attributes();
                slot.changed = None;
                let Some(data) = slot.data.clone() else {
                    continue;
                };
                let bucket = changeset.entry(ty);
                bucket.update.store_keys.push(sk);
                bucket.update.records.push((*data).clone());
                bucket.update.changes.push(dirty_attrs);
                self.set_status_locked(
                    state,
                    sk,
                    (status - RecordStatus::DIRTY) | RecordStatus::COMMITTING,
                    &mut effects,
                );
            }

            let destroyed: Vec<StoreKey> = state.journal.destroyed.drain(..).collect();
            for sk in destroyed {
                let status = self.status_locked(state, sk);
                if status.is_new() {
                    // The destroy needs the server id; wait for the
                    // create-ack.
                    state.journal.destroyed.insert(sk);
                    continue;
                }
                let Some(ty) = state.registry.type_of(sk) else {
                    warn!(store_key = %sk, "journaled destroy for an unregistered key; dropped");
                    continue;
                };
                let Some(id) = state.registry.id_of(sk).cloned() else {
                    warn!(store_key = %sk, "journaled destroy without a server id; dropped");
                    continue;
                };
                let bucket = changeset.entry(ty);
                bucket.destroy.store_keys.push(sk);
                bucket.destroy.ids.push(id);
                self.set_status_locked(
                    state,
                    sk,
                    RecordStatus::DESTROYED | RecordStatus::COMMITTING,
                    &mut effects,
                );
            }

            if !changeset.is_empty() {
                effects.push(Effect::CommitToSource { changeset });
            }
        }
        self.dispatch_effects(effects);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Discard
    // ------------------------------------------------------------------

    /// Drop all pending local mutations.
    ///
    /// Created records are unloaded; edited records revert to their
    /// committed snapshots; destroyed records return to `READY`. Requests
    /// already sent to the source are not aborted — their acks land on
    /// whatever state this leaves behind.
    pub fn discard_changes(&self) {
        if self.is_nested() {
            self.discard_overlay();
            return;
        }
        let mut effects = Vec::new();
        {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;

            let created: Vec<StoreKey> = state.journal.created.drain(..).collect();
            for sk in created {
                self.set_status_locked(state, sk, RecordStatus::DESTROYED, &mut effects);
                let ty = self.record_type_locked(state, sk);
                self.unload_locked(state, sk, &mut effects);
                if let Some(ty) = ty {
                    self.mark_record_set_changed_locked(state, ty, &mut effects);
                }
            }

            let changed: Vec<StoreKey> = state.journal.changed.drain(..).collect();
            for sk in changed {
                let mut reverted_keys = None;
                if let Some(slot) = state.data.existing_slot_mut(sk) {
                    if let Some(committed) = slot.committed.clone() {
                        let keys = Self::replace_hash_in_slot(slot, &committed);
                        if !keys.is_empty() {
                            reverted_keys = Some(keys);
                        }
                    }
                    slot.clear_edits();
                }
                if let Some(keys) = reverted_keys {
                    effects.push(Effect::data_changed(state, sk, keys));
                }
                let status = self.status_locked(state, sk);
                let keep = status
                    & (RecordStatus::OBSOLETE | RecordStatus::LOADING | RecordStatus::COMMITTING);
                self.set_status_locked(state, sk, RecordStatus::READY | keep, &mut effects);
                if let Some(ty) = self.record_type_locked(state, sk) {
                    self.mark_record_set_changed_locked(state, ty, &mut effects);
                }
            }

            let destroyed: Vec<StoreKey> = state.journal.destroyed.drain(..).collect();
            for sk in destroyed {
                let status = self.status_locked(state, sk);
                let keep = status & RecordStatus::OBSOLETE;
                self.set_status_locked(state, sk, RecordStatus::READY | keep, &mut effects);
                if let Some(ty) = self.record_type_locked(state, sk) {
                    self.mark_record_set_changed_locked(state, ty, &mut effects);
                }
            }
        }
        self.dispatch_effects(effects);
    }
}
