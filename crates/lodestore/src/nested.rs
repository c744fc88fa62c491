//! Nested overlay stores.
//!
//! An overlay shares the parent's tables: reads fall through until the
//! overlay writes, at which point the record's hash is cloned into the
//! overlay (copy-on-write, by `Rc` identity). Edits stay local until
//! discarded; the overlay never talks to the source. The parent keeps weak
//! links to its overlays and forwards data/status changes; an overlay with
//! local state for a record vetoes the parent's unload.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::debug;

use lodestore_types::StoreKey;

use crate::store::{Effect, Store, StoreShared, StoreState};

impl Store {
    /// Create a nested overlay of this store.
    ///
    /// The overlay shares identity (store keys, ids, types) and inherits
    /// this store's configuration and materializers; its edits are invisible
    /// to the parent until host code applies them through its own channel.
    #[must_use]
    pub fn nest(&self) -> Store {
        let child = Store {
            shared: Rc::new(StoreShared {
                config: self.shared.config,
                parent: Some(self.shared.clone()),
                state: RefCell::new(StoreState::default()),
            }),
        };
        self.prune_dead_children();
        self.shared
            .state
            .borrow_mut()
            .children
            .push(Rc::downgrade(&child.shared));
        debug!("nested store created");
        child
    }

    /// Parent hook: a record's status changed upstream.
    pub(crate) fn parent_did_change_status(
        &self,
        sk: StoreKey,
        previous: lodestore_types::RecordStatus,
        next: lodestore_types::RecordStatus,
    ) {
        let effects = {
            let state = self.shared.state.borrow();
            if state.statuses.contains_key(&sk) {
                // The overlay re-statused this record locally; its view
                // stands until the overlay's changes are discarded.
                debug!(store_key = %sk, "parent status change shadowed by overlay");
                return;
            }
            vec![Effect::status_changed(&state, sk, previous, next)]
        };
        self.dispatch_effects(effects);
    }

    /// Parent hook: a record's attributes changed upstream.
    pub(crate) fn parent_did_change_data(&self, sk: StoreKey, keys: &[String]) {
        let mut effects = Vec::new();
        {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            if state.data.has_own_data(sk) {
                // Copy-on-write already triggered: the overlay is isolated
                // from this change until its edits are discarded.
                debug!(store_key = %sk, "parent data change shadowed by overlay");
                return;
            }
            effects.push(Effect::data_changed(
                state,
                sk,
                keys.iter().cloned().collect(),
            ));
            if let Some(ty) = self.record_type_locked(state, sk) {
                self.mark_record_set_changed_locked(state, ty, &mut effects);
            }
        }
        self.dispatch_effects(effects);
    }

    /// Whether this overlay (and its own overlays) have no stake in `sk`.
    pub(crate) fn concurs_unload(&self, sk: StoreKey) -> bool {
        {
            let state = self.shared.state.borrow();
            if state.data.slot(sk).is_some() || state.statuses.contains_key(&sk) {
                return false;
            }
            if let Some(record) = state.records.get(&sk) {
                if record.has_observers() {
                    return false;
                }
            }
        }
        self.live_children()
            .iter()
            .all(|child| child.concurs_unload(sk))
    }

    /// Whether the overlay holds any local edits.
    #[must_use]
    pub fn has_overlay_changes(&self) -> bool {
        let state = self.shared.state.borrow();
        !state.journal.is_empty() || !state.data.keys().is_empty()
    }

    /// Drop every local edit of the overlay and fall back to the parent's
    /// view. Materialized records are notified of the attributes and
    /// statuses that snap back.
    pub(crate) fn discard_overlay(&self) {
        let mut effects = Vec::new();
        {
            let mut guard = self.shared.state.borrow_mut();
            let state = &mut *guard;
            for sk in state.data.keys() {
                let dirty_keys: Vec<String> = state
                    .data
                    .slot(sk)
                    .map(|slot| slot.dirty_attributes())
                    .unwrap_or_default();
                state.data.remove(sk);
                state.journal.forget(sk);
                if !dirty_keys.is_empty() {
                    effects.push(Effect::data_changed(
                        state,
                        sk,
                        dirty_keys.into_iter().collect(),
                    ));
                }
                if let Some(ty) = self.record_type_locked(state, sk) {
                    self.mark_record_set_changed_locked(state, ty, &mut effects);
                }
            }
            let overridden: Vec<StoreKey> = state.statuses.keys().copied().collect();
            for sk in overridden {
                self.drop_status_override_locked(state, sk, &mut effects);
            }
        }
        self.dispatch_effects(effects);
    }

    pub(crate) fn prune_dead_children(&self) {
        self.shared
            .state
            .borrow_mut()
            .children
            .retain(|child| child.strong_count() > 0);
    }
}
