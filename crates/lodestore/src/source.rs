//! The remote-source seam.
//!
//! A [`Source`] is the transport to the server or API behind the store. The
//! store invokes it to fetch and commit; the source answers — synchronously
//! or on a later tick — through the store's `source_did_*` callback surface.
//! The store never assumes a response arrives, never retries on its own, and
//! never calls the source while its internal state is mid-mutation, so a
//! source is free to call straight back into the store from any method.

use std::rc::Rc;

use lodestore_types::{RecordId, RecordType};

use crate::commit::Changeset;
use crate::query::RemoteQuery;
use crate::Store;

/// Remote transport collaborator.
pub trait Source {
    /// Fetch one record by id. Respond through
    /// [`Store::source_did_fetch_records`] or
    /// [`Store::source_could_not_find_records`].
    fn fetch_record(&self, store: &Store, ty: RecordType, id: &RecordId);

    /// Re-fetch a record the store already holds (`READY`), typically after
    /// it was flagged obsolete.
    fn refresh_record(&self, store: &Store, ty: RecordType, id: &RecordId);

    /// Fetch all records of a type (backing a newly-registered local query).
    fn fetch_records(&self, store: &Store, ty: RecordType);

    /// Fetch a server-backed query's result list.
    fn fetch_query(&self, store: &Store, query: &Rc<dyn RemoteQuery>);

    /// Persist a batch of local mutations. Acks arrive through the
    /// `source_did_commit_*` / `source_did_not_*` / `source_did_error`
    /// callbacks, keyed by the store keys carried in `changeset`.
    fn commit_changes(&self, store: &Store, changeset: Changeset);
}

impl std::fmt::Debug for dyn Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Source")
    }
}
