//! The materialized-record seam.
//!
//! The store's tables are the authority for record data; a *materialized
//! record* is the host-side object (view model, proxy, ORM instance) the
//! store notifies when attributes or status change. The store allocates one
//! lazily per store key through a registered materializer and drops it on
//! unload.

use std::rc::Rc;

use lodestore_types::{RecordStatus, StoreKey};

use crate::Store;

/// Callbacks the store invokes on a host record object.
///
/// All methods are synchronous and run on the store's thread. Implementations
/// may read the store freely from any callback; mutations should be deferred
/// to the host's own tick.
pub trait MaterializedRecord {
    /// Batch marker before a run of [`property_did_change`] calls.
    ///
    /// [`property_did_change`]: MaterializedRecord::property_did_change
    fn begin_property_changes(&self) {}

    /// The named attribute changed in the store.
    fn property_did_change(&self, key: &str);

    /// Batch marker after a run of property notifications.
    fn end_property_changes(&self) {}

    /// A derived property may have changed even though no stored attribute
    /// did (e.g. after an id assignment rewired relationships).
    fn computed_property_did_change(&self) {}

    /// The record's status bits changed.
    fn status_did_change(&self, previous: RecordStatus, next: RecordStatus);

    /// Whether host code currently observes this record. Records with
    /// observers are never unloaded.
    fn has_observers(&self) -> bool {
        false
    }

    /// The store is about to drop this record's state.
    fn store_will_unload(&self) {}
}

impl std::fmt::Debug for dyn MaterializedRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn MaterializedRecord")
    }
}

/// Constructor for a record type's materialized objects.
///
/// Invoked lazily the first time host code asks the store to materialize a
/// record of the type.
pub type RecordMaterializer = Rc<dyn Fn(&Store, StoreKey) -> Rc<dyn MaterializedRecord>>;
