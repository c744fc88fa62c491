//! The mutation journal.
//!
//! Three insertion-ordered sets of store keys awaiting commit: records to
//! create, records to destroy, and records with attribute edits. The commit
//! build drains them in insertion order; entries it must wait on (a record
//! already mid-commit, a destroy still waiting for its create-ack) are
//! carried over to the next tick.

use indexmap::IndexSet;
use lodestore_types::StoreKey;

/// Pending local mutations, in insertion order.
#[derive(Debug, Default)]
pub(crate) struct MutationJournal {
    /// Store keys awaiting their initial create.
    pub(crate) created: IndexSet<StoreKey>,
    /// Store keys awaiting a destroy.
    pub(crate) destroyed: IndexSet<StoreKey>,
    /// Store keys with attribute edits awaiting an update.
    pub(crate) changed: IndexSet<StoreKey>,
}

impl MutationJournal {
    pub(crate) fn is_empty(&self) -> bool {
        self.created.is_empty() && self.destroyed.is_empty() && self.changed.is_empty()
    }

    /// Remove `sk` from every set (record unloaded or reconciled away).
    pub(crate) fn forget(&mut self, sk: StoreKey) {
        self.created.shift_remove(&sk);
        self.destroyed.shift_remove(&sk);
        self.changed.shift_remove(&sk);
    }
}
