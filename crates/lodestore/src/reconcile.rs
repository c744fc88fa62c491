//! The reconciliation engine: source → store transitions.
//!
//! Every callback here is driven by the source (fetch responses, push
//! updates, commit acks, failures) and applies the exhaustive transition
//! matrix against local state. Callbacks never error and never throw across
//! the seam: unknown or stale store keys are skipped, protocol mismatches
//! are logged and leave state untouched, and each invocation is applied
//! atomically before control returns to the source.
//!
//! The delicate cases are the races between an in-flight commit and a
//! concurrent push: the push consumes the `rollback` snapshot so a later
//! failure cannot restore a stale base, and a dirty record meeting a push
//! either rebases its surviving edits onto the new base or surrenders them.

use std::collections::HashMap;

use tracing::{debug, warn};

use lodestore_error::StoreError;
use lodestore_types::{
    merge_hash, AttributeHash, RecordId, RecordStatus, RecordType, StoreKey,
};

use crate::metrics;
use crate::scheduler::DeferredTask;
use crate::store::{Effect, Store, StoreState};

/// Log a refused callback, routed by the error's classification: protocol
/// mismatches are loud, benign races (unknown or stale store keys) are not.
/// Either way the record is left untouched.
fn log_refused(error: &StoreError) {
    if error.is_protocol_mismatch() {
        warn!(%error, "source callback left record untouched");
    } else {
        debug!(%error, "source callback skipped");
    }
}

/// Count a commit-failure callback against the metrics, routed by the
/// error's classification.
fn note_commit_failure(error: &StoreError) {
    if error.is_transient() {
        metrics::count_transient_failure();
    } else {
        metrics::count_permanent_failure();
    }
    debug!(%error, "commit failure reconciled");
}

impl Store {
    /// Whether this store may not process source callbacks (overlays never
    /// talk to the source).
    fn refuse_nested(&self, operation: &'static str) -> bool {
        if self.is_nested() {
            warn!(operation, "source callback on a nested store; ignored");
            return true;
        }
        false
    }

    /// Under auto-commit, keep draining journaled work that a commit build
    /// had to defer (records mid-commit, destroys awaiting their create-ack).
    fn reschedule_if_pending_locked(&self, state: &mut StoreState, effects: &mut Vec<Effect>) {
        if self.shared.config.auto_commit && !state.journal.is_empty() {
            self.schedule_locked(state, DeferredTask::Commit, effects);
        }
    }

    // ------------------------------------------------------------------
    // Fetch responses and pushes
    // ------------------------------------------------------------------

    /// Records arrived from the source (a fetch response or an unsolicited
    /// push). Records the store already holds `READY` are folded through the
    /// update branch; empty slots are filled and become `READY`.
    ///
    /// With `all = true` the payload is the complete record set of `ty`:
    /// every known id absent from it is treated as destroyed upstream.
    ///
    /// Returns the store keys of the records that landed.
    pub fn source_did_fetch_records(
        &self,
        ty: RecordType,
        records: Vec<AttributeHash>,
        all: bool,
    ) -> Vec<StoreKey> {
        if self.refuse_nested("source_did_fetch_records") {
            return Vec::new();
        }
        let mut loaded = Vec::new();
        let mut updates: Vec<AttributeHash> = Vec::new();
        let mut missing: Vec<RecordId> = Vec::new();
        let mut effects = Vec::new();
        {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            let mut seen: Vec<RecordId> = Vec::new();
            for hash in records {
                let Some(id) = ty.id_of(&hash) else {
                    warn!(record_type = %ty, "fetched record without a primary key; skipped");
                    continue;
                };
                seen.push(id.clone());
                let sk = state.registry.key_for(ty, Some(&id));
                let status = self.status_locked(state, sk);
                if status.is_ready() {
                    updates.push(hash);
                    loaded.push(sk);
                } else if status.core_state() != RecordStatus::EMPTY {
                    // Fetched a record that is destroyed or non-existent.
                    log_refused(&StoreError::mismatch("fetch", sk, status));
                } else {
                    state.access_clock += 1;
                    let clock = state.access_clock;
                    let slot = state.data.slot_mut(sk);
                    let keys = Self::replace_hash_in_slot(slot, &hash);
                    slot.last_access = clock;
                    self.set_status_locked(state, sk, RecordStatus::READY, &mut effects);
                    if !keys.is_empty() {
                        effects.push(Effect::data_changed(state, sk, keys));
                    }
                    self.mark_record_set_changed_locked(state, ty, &mut effects);
                    loaded.push(sk);
                }
            }
            if all {
                missing = state
                    .registry
                    .ids_of_type(ty)
                    .into_iter()
                    .filter(|(id, _)| !seen.contains(id))
                    .map(|(id, _)| id)
                    .collect();
            }
        }
        self.dispatch_effects(effects);
        if !missing.is_empty() {
            self.source_did_destroy_records(ty, &missing);
        }
        if !updates.is_empty() {
            self.source_did_fetch_updates(ty, updates);
        }
        loaded
    }

    /// Host-side bulk load of already-fetched data. Funnels into the same
    /// path as a fetch response (without the complete-set sweep).
    pub fn load_records(&self, ty: RecordType, records: Vec<AttributeHash>) -> Vec<StoreKey> {
        self.source_did_fetch_records(ty, records, false)
    }

    /// Single-record form of [`load_records`](Store::load_records).
    pub fn load_record(&self, ty: RecordType, record: AttributeHash) -> Option<StoreKey> {
        self.load_records(ty, vec![record]).pop()
    }

    /// The source signals newer data may exist upstream for these ids.
    pub fn source_has_updates_for_records(&self, ty: RecordType, ids: &[RecordId]) {
        if self.refuse_nested("source_has_updates_for_records") {
            return;
        }
        let mut effects = Vec::new();
        {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            for id in ids {
                let Some(sk) = state.registry.lookup(ty, id) else {
                    continue;
                };
                if self.status_locked(state, sk).is_ready() {
                    self.or_status_locked(state, sk, RecordStatus::OBSOLETE, &mut effects);
                }
            }
        }
        self.dispatch_effects(effects);
    }

    /// Updated attribute hashes arrived for loaded records.
    pub fn source_did_fetch_updates(&self, ty: RecordType, updates: Vec<AttributeHash>) {
        if self.refuse_nested("source_did_fetch_updates") {
            return;
        }
        let mut effects = Vec::new();
        {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            for update in updates {
                let Some(id) = ty.id_of(&update) else {
                    warn!(record_type = %ty, "update without a primary key; skipped");
                    continue;
                };
                let Some(sk) = state.registry.lookup(ty, &id) else {
                    debug!(record_type = %ty, id = %id, "update for an unknown record; skipped");
                    continue;
                };
                self.apply_update_locked(state, ty, sk, update, &mut effects);
            }
        }
        self.dispatch_effects(effects);
    }

    fn apply_update_locked(
        &self,
        state: &mut StoreState,
        ty: RecordType,
        sk: StoreKey,
        update: AttributeHash,
        effects: &mut Vec<Effect>,
    ) {
        let status = self.status_locked(state, sk);
        if !status.is_ready() {
            debug!(store_key = %sk, status = ?status, "update for a record that is not ready; skipped");
            return;
        }

        let mut update = update;
        if status.is_committing() {
            // The push represents the pre-commit server state. Merge it over
            // the rollback snapshot and consume the snapshot, so a later
            // commit failure cannot restore a base the server has moved past.
            let rollback = state
                .data
                .existing_slot_mut(sk)
                .and_then(|slot| slot.rollback.take());
            if let Some(rollback) = rollback {
                update = merge_hash(&rollback, &update);
            }
            let committed_present = state
                .data
                .slot(sk)
                .is_some_and(|slot| slot.committed.is_some());
            if !(status.is_dirty() && committed_present) {
                // The in-flight commit supersedes the push; the record can
                // be refetched once the ack lands.
                return;
            }
        }

        if status.is_dirty() {
            let Some(slot) = state.data.existing_slot_mut(sk) else {
                return;
            };
            let Some(committed) = slot.committed.clone() else {
                return;
            };
            // Conflict: server moved while local edits are pending. The new
            // base is the server's view; update wins on overlapping keys.
            let new_base = merge_hash(&committed, &update);
            if self.shared.config.rebase_conflicts {
                let data = slot.data.clone().expect("dirty record holds data");
                let changed = slot.changed.clone().unwrap_or_default();
                let mut rebased = new_base.clone();
                let mut surviving: HashMap<String, bool> = HashMap::new();
                for (key, value) in data.iter() {
                    let locally_changed = changed.get(key).copied().unwrap_or(false);
                    if locally_changed && new_base.get(key) != Some(value) {
                        rebased.insert(key.clone(), value.clone());
                        surviving.insert(key.clone(), true);
                    }
                }
                if !surviving.is_empty() {
                    let keys = Self::replace_hash_in_slot(slot, &rebased);
                    slot.committed = Some(new_base);
                    slot.changed = Some(surviving);
                    metrics::count_conflict_rebased();
                    self.set_status_locked(
                        state,
                        sk,
                        RecordStatus::READY | RecordStatus::DIRTY,
                        effects,
                    );
                    state.journal.changed.insert(sk);
                    if !keys.is_empty() {
                        effects.push(Effect::data_changed(state, sk, keys));
                    }
                    self.mark_record_set_changed_locked(state, ty, effects);
                    return;
                }
            }
            // Rebase off, or no local edit survived: the server wins.
            metrics::count_conflict_dropped();
            slot.clear_edits();
            state.journal.changed.shift_remove(&sk);
            let slot = state.data.slot_mut(sk);
            let keys = Self::replace_hash_in_slot(slot, &new_base);
            self.set_status_locked(state, sk, RecordStatus::READY, effects);
            if !keys.is_empty() {
                effects.push(Effect::data_changed(state, sk, keys));
            }
            self.mark_record_set_changed_locked(state, ty, effects);
            return;
        }

        // Clean record: plain merge through the non-dirty update path.
        let _ = self.update_hash_locked(state, sk, &update, false, effects);
        self.set_status_locked(state, sk, RecordStatus::READY, effects);
    }

    /// The source has no record for these ids.
    pub fn source_could_not_find_records(&self, ty: RecordType, ids: &[RecordId]) {
        if self.refuse_nested("source_could_not_find_records") {
            return;
        }
        let mut effects = Vec::new();
        {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            for id in ids {
                let Some(sk) = state.registry.lookup(ty, id) else {
                    continue;
                };
                let status = self.status_locked(state, sk);
                let core = status.core_state();
                if core == RecordStatus::EMPTY || core == RecordStatus::NON_EXISTENT {
                    self.set_status_locked(state, sk, RecordStatus::NON_EXISTENT, &mut effects);
                } else {
                    if let Some(slot) = state.data.existing_slot_mut(sk) {
                        slot.clear_edits();
                        slot.rollback = None;
                    }
                    self.set_status_locked(state, sk, RecordStatus::DESTROYED, &mut effects);
                    self.unload_locked(state, sk, &mut effects);
                    self.mark_record_set_changed_locked(state, ty, &mut effects);
                }
            }
        }
        self.dispatch_effects(effects);
    }

    /// Records were destroyed upstream.
    pub fn source_did_destroy_records(&self, ty: RecordType, ids: &[RecordId]) {
        if self.refuse_nested("source_did_destroy_records") {
            return;
        }
        let mut effects = Vec::new();
        {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            for id in ids {
                let Some(sk) = state.registry.lookup(ty, id) else {
                    continue;
                };
                if let Some(slot) = state.data.existing_slot_mut(sk) {
                    slot.clear_edits();
                    slot.rollback = None;
                }
                self.set_status_locked(state, sk, RecordStatus::DESTROYED, &mut effects);
                self.unload_locked(state, sk, &mut effects);
                self.mark_record_set_changed_locked(state, ty, &mut effects);
            }
        }
        self.dispatch_effects(effects);
    }

    // ------------------------------------------------------------------
    // Commit acknowledgements
    // ------------------------------------------------------------------

    /// The source created these records and assigned their server ids.
    pub fn source_did_commit_create(&self, assignments: &[(StoreKey, RecordId)]) {
        if self.refuse_nested("source_did_commit_create") {
            return;
        }
        for (sk, id) in assignments {
            let sk = *sk;
            let status = self.status(sk);
            if !status.is_new() {
                log_refused(&StoreError::mismatch("create acknowledgement", sk, status));
                continue;
            }
            if let Err(error) = self.set_id_for_store_key(sk, id.clone()) {
                warn!(store_key = %sk, %error, "could not bind the server id from a create ack; skipped");
                continue;
            }
            let mut effects = Vec::new();
            {
                let mut guard = self.shared.state.borrow_mut();
                let state = &mut *guard;
                let status = self.status_locked(state, sk);
                self.set_status_locked(
                    state,
                    sk,
                    status - (RecordStatus::NEW | RecordStatus::COMMITTING),
                    &mut effects,
                );
                self.reschedule_if_pending_locked(state, &mut effects);
            }
            metrics::count_create_acked();
            self.dispatch_effects(effects);
            if let Some(record) = self.record_for(sk) {
                // The id rewires anything derived from identity.
                record.computed_property_did_change();
            }
        }
    }

    /// The source could not create these records right now (transient).
    /// They return to `READY|NEW` and retry on the next commit.
    pub fn source_did_not_create(&self, sks: &[StoreKey]) {
        if self.refuse_nested("source_did_not_create") {
            return;
        }
        let mut effects = Vec::new();
        {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            for &sk in sks {
                if state.registry.type_of(sk).is_none() {
                    log_refused(&StoreError::UnknownStoreKey { store_key: sk });
                    continue;
                }
                let status = self.status_locked(state, sk);
                if status.is_destroyed() {
                    // Destroyed while the create was in flight; nothing ever
                    // reached the server, so just drop the record.
                    self.unload_locked(state, sk, &mut effects);
                    continue;
                }
                if let Some(slot) = state.data.existing_slot_mut(sk) {
                    slot.clear_edits();
                    slot.rollback = None;
                }
                self.set_status_locked(
                    state,
                    sk,
                    RecordStatus::READY | RecordStatus::NEW,
                    &mut effects,
                );
                state.journal.created.insert(sk);
                note_commit_failure(&StoreError::transient("create", sk));
            }
            self.reschedule_if_pending_locked(state, &mut effects);
        }
        self.dispatch_effects(effects);
    }

    /// The source persisted these updates.
    pub fn source_did_commit_update(&self, sks: &[StoreKey]) {
        if self.refuse_nested("source_did_commit_update") {
            return;
        }
        let mut effects = Vec::new();
        {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            for &sk in sks {
                if state.registry.type_of(sk).is_none() {
                    log_refused(&StoreError::UnknownStoreKey { store_key: sk });
                    continue;
                }
                if let Some(slot) = state.data.existing_slot_mut(sk) {
                    slot.rollback = None;
                }
                let status = self.status_locked(state, sk);
                if !status.is_ready() {
                    continue;
                }
                if status.is_committing() {
                    self.set_status_locked(state, sk, status - RecordStatus::COMMITTING, &mut effects);
                } else {
                    // A push intervened mid-commit and took over the record;
                    // upstream may now differ from what we hold.
                    self.or_status_locked(state, sk, RecordStatus::OBSOLETE, &mut effects);
                }
                metrics::count_update_acked();
            }
            self.reschedule_if_pending_locked(state, &mut effects);
        }
        self.dispatch_effects(effects);
    }

    /// The source could not persist these updates right now (transient).
    /// State rolls back to the pre-commit snapshot and the records become
    /// eligible for the next commit.
    pub fn source_did_not_update(&self, sks: &[StoreKey]) {
        if self.refuse_nested("source_did_not_update") {
            return;
        }
        let mut effects = Vec::new();
        {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            for &sk in sks {
                if state.registry.type_of(sk).is_none() {
                    log_refused(&StoreError::UnknownStoreKey { store_key: sk });
                    continue;
                }
                let status = self.status_locked(state, sk);
                let Some(slot) = state.data.existing_slot_mut(sk) else {
                    continue;
                };
                if !status.is_ready() {
                    // Destroyed (or otherwise superseded) while the update
                    // was in flight; the pending destroy wins. Drop the
                    // stale snapshot.
                    slot.rollback = None;
                    continue;
                }
                if let Some(rollback) = slot.rollback.take() {
                    slot.committed = Some(rollback);
                }
                // Rebuild the dirty flags once, from the full comparison of
                // current data against the restored snapshot.
                let restored = slot.committed.clone();
                if let (Some(committed), Some(data)) = (&restored, slot.data.clone()) {
                    let mut changed: HashMap<String, bool> = HashMap::new();
                    for (key, value) in data.iter() {
                        if committed.get(key) != Some(value) {
                            changed.insert(key.clone(), true);
                        }
                    }
                    for key in committed.keys() {
                        if !data.contains_key(key) {
                            changed.insert(key.clone(), true);
                        }
                    }
                    slot.changed = Some(changed);
                }
                if restored.is_none() {
                    // A concurrent push consumed the rollback; there is no
                    // base to be dirty against anymore. Flag for refetch.
                    self.set_status_locked(
                        state,
                        sk,
                        (status - RecordStatus::COMMITTING) | RecordStatus::OBSOLETE,
                        &mut effects,
                    );
                    note_commit_failure(&StoreError::transient("update", sk));
                    continue;
                }
                if status.is_committing() {
                    self.set_status_locked(
                        state,
                        sk,
                        (status - RecordStatus::COMMITTING) | RecordStatus::DIRTY,
                        &mut effects,
                    );
                } else {
                    // A push intervened mid-commit.
                    self.set_status_locked(
                        state,
                        sk,
                        status | RecordStatus::OBSOLETE | RecordStatus::DIRTY,
                        &mut effects,
                    );
                }
                state.journal.changed.insert(sk);
                note_commit_failure(&StoreError::transient("update", sk));
            }
            self.reschedule_if_pending_locked(state, &mut effects);
        }
        self.dispatch_effects(effects);
    }

    /// The source destroyed these records.
    pub fn source_did_commit_destroy(&self, sks: &[StoreKey]) {
        if self.refuse_nested("source_did_commit_destroy") {
            return;
        }
        let mut effects = Vec::new();
        {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            for &sk in sks {
                if state.registry.type_of(sk).is_none() {
                    log_refused(&StoreError::UnknownStoreKey { store_key: sk });
                    continue;
                }
                let status = self.status_locked(state, sk);
                if !status.is_destroyed() {
                    log_refused(&StoreError::mismatch("destroy acknowledgement", sk, status));
                    continue;
                }
                let ty = self.record_type_locked(state, sk);
                self.set_status_locked(state, sk, RecordStatus::DESTROYED, &mut effects);
                self.unload_locked(state, sk, &mut effects);
                if let Some(ty) = ty {
                    self.mark_record_set_changed_locked(state, ty, &mut effects);
                }
                metrics::count_destroy_acked();
            }
            self.reschedule_if_pending_locked(state, &mut effects);
        }
        self.dispatch_effects(effects);
    }

    /// The source could not destroy these records right now (transient).
    /// They stay destroyed locally and retry on the next commit.
    pub fn source_did_not_destroy(&self, sks: &[StoreKey]) {
        if self.refuse_nested("source_did_not_destroy") {
            return;
        }
        let mut effects = Vec::new();
        {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            for &sk in sks {
                if state.registry.type_of(sk).is_none() {
                    log_refused(&StoreError::UnknownStoreKey { store_key: sk });
                    continue;
                }
                let status = self.status_locked(state, sk);
                if !status.is_destroyed() {
                    log_refused(&StoreError::mismatch("destroy failure", sk, status));
                    continue;
                }
                self.set_status_locked(
                    state,
                    sk,
                    RecordStatus::DESTROYED | RecordStatus::DIRTY,
                    &mut effects,
                );
                state.journal.destroyed.insert(sk);
                note_commit_failure(&StoreError::transient("destroy", sk));
            }
            self.reschedule_if_pending_locked(state, &mut effects);
        }
        self.dispatch_effects(effects);
    }

    /// Permanent commit failure.
    ///
    /// Never-created records are unloaded; everything else rolls back to the
    /// last known committed snapshot, loses all pending bookkeeping, and is
    /// flagged `OBSOLETE` for a refetch.
    pub fn source_did_error(&self, sks: &[StoreKey]) {
        if self.refuse_nested("source_did_error") {
            return;
        }
        let mut effects = Vec::new();
        {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            for &sk in sks {
                if state.registry.type_of(sk).is_none() {
                    log_refused(&StoreError::UnknownStoreKey { store_key: sk });
                    continue;
                }
                let status = self.status_locked(state, sk);
                if status.is_new() {
                    self.unload_locked(state, sk, &mut effects);
                    note_commit_failure(&StoreError::permanent(sk));
                    continue;
                }
                let mut restored_keys = None;
                if let Some(slot) = state.data.existing_slot_mut(sk) {
                    if let Some(rollback) = slot.rollback.take() {
                        let keys = Self::replace_hash_in_slot(slot, &rollback);
                        if !keys.is_empty() {
                            restored_keys = Some(keys);
                        }
                    }
                    slot.clear_edits();
                }
                if let Some(keys) = restored_keys {
                    effects.push(Effect::data_changed(state, sk, keys));
                }
                state.journal.forget(sk);
                self.set_status_locked(
                    state,
                    sk,
                    RecordStatus::READY | RecordStatus::OBSOLETE,
                    &mut effects,
                );
                if let Some(ty) = self.record_type_locked(state, sk) {
                    self.mark_record_set_changed_locked(state, ty, &mut effects);
                }
                note_commit_failure(&StoreError::permanent(sk));
            }
        }
        self.dispatch_effects(effects);
    }
}
