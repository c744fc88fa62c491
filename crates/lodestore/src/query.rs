//! Query registration and refresh scheduling.
//!
//! Two query kinds exist. *Local* queries are filtered views over the loaded
//! records of one type; the store owns their refresh cadence: any change to
//! a type's record set marks that type, and one deferred pass per tick calls
//! [`LocalQuery::refresh`] on every query of every marked type. *Remote*
//! queries are server-backed lists that refresh themselves from source
//! events; the store only holds their registration and triggers the initial
//! fetch.

use std::rc::Rc;

use indexmap::IndexSet;
use std::collections::HashMap;

use lodestore_types::RecordType;

use crate::Store;

/// A live filtered view over the loaded records of one type.
pub trait LocalQuery {
    /// The record type this query filters.
    fn record_type(&self) -> RecordType;

    /// Re-evaluate the query against the store's current record set.
    ///
    /// Called at most once per tick per query, after the record set of
    /// [`record_type`](LocalQuery::record_type) changed.
    fn refresh(&self, store: &Store);
}

impl std::fmt::Debug for dyn LocalQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("dyn LocalQuery")
            .field(&self.record_type())
            .finish()
    }
}

/// A server-backed record list.
///
/// The store forwards the registration to the source via
/// [`Source::fetch_query`](crate::Source::fetch_query) and otherwise leaves
/// the query alone: it refreshes itself in response to source events.
pub trait RemoteQuery {
    /// Stable descriptor the source uses to route the fetch (an endpoint
    /// name, a serialized query, ...).
    fn descriptor(&self) -> &str;
}

impl std::fmt::Debug for dyn RemoteQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("dyn RemoteQuery").field(&self.descriptor()).finish()
    }
}

/// Registered queries plus the per-type refresh marks for the current tick.
#[derive(Debug, Default)]
pub(crate) struct QueryRegistry {
    local: HashMap<RecordType, Vec<Rc<dyn LocalQuery>>>,
    remote: Vec<Rc<dyn RemoteQuery>>,
    needs_refresh: IndexSet<RecordType>,
}

impl QueryRegistry {
    pub(crate) fn add_local(&mut self, query: Rc<dyn LocalQuery>) {
        self.local.entry(query.record_type()).or_default().push(query);
    }

    pub(crate) fn add_remote(&mut self, query: Rc<dyn RemoteQuery>) {
        self.remote.push(query);
    }

    /// Mark `ty`'s record set as changed. Returns true if this is the first
    /// mark since the last flush (i.e. a refresh pass must be scheduled).
    pub(crate) fn mark_changed(&mut self, ty: RecordType) -> bool {
        self.needs_refresh.insert(ty)
    }

    /// Take the marked types and collect the local queries to refresh, in
    /// mark order.
    pub(crate) fn drain_refreshes(&mut self) -> Vec<Rc<dyn LocalQuery>> {
        let marked = std::mem::take(&mut self.needs_refresh);
        let mut queries = Vec::new();
        for ty in marked {
            if let Some(local) = self.local.get(&ty) {
                queries.extend(local.iter().cloned());
            }
        }
        queries
    }

    pub(crate) fn remote_queries(&self) -> &[Rc<dyn RemoteQuery>] {
        &self.remote
    }
}

impl Store {
    /// Register a live local query. The source is asked for all records of
    /// the query's type so the view can populate.
    pub fn register_local_query(&self, query: Rc<dyn LocalQuery>) {
        let ty = query.record_type();
        self.shared.state.borrow_mut().queries.add_local(query);
        self.dispatch_effects(vec![crate::store::Effect::FetchRecords { ty }]);
    }

    /// Register a server-backed query and trigger its fetch.
    pub fn register_remote_query(&self, query: Rc<dyn RemoteQuery>) {
        self.shared
            .state
            .borrow_mut()
            .queries
            .add_remote(query.clone());
        self.dispatch_effects(vec![crate::store::Effect::FetchQuery { query }]);
    }

    /// The registered remote queries, in registration order.
    #[must_use]
    pub fn remote_queries(&self) -> Vec<Rc<dyn RemoteQuery>> {
        self.shared
            .state
            .borrow()
            .queries
            .remote_queries()
            .to_vec()
    }

    /// Run the per-tick refresh pass over every local query whose record set
    /// changed. Normally driven by [`flush_deferred`](Store::flush_deferred).
    pub(crate) fn refresh_live_queries(&self) {
        let queries = self.shared.state.borrow_mut().queries.drain_refreshes();
        let effects = queries
            .into_iter()
            .map(|query| crate::store::Effect::RefreshQuery { query })
            .collect();
        self.dispatch_effects(effects);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestore_types::RecordTypeDef;
    use std::cell::Cell;

    static SONG: RecordTypeDef = RecordTypeDef {
        name: "Song",
        primary_key: "id",
    };
    static ALBUM: RecordTypeDef = RecordTypeDef {
        name: "Album",
        primary_key: "id",
    };

    struct CountingQuery {
        ty: RecordType,
        refreshed: Cell<u32>,
    }

    impl LocalQuery for CountingQuery {
        fn record_type(&self) -> RecordType {
            self.ty
        }

        fn refresh(&self, _store: &Store) {
            self.refreshed.set(self.refreshed.get() + 1);
        }
    }

    #[test]
    fn drain_only_returns_marked_types() {
        let mut registry = QueryRegistry::default();
        let song = Rc::new(CountingQuery {
            ty: RecordType::new(&SONG),
            refreshed: Cell::new(0),
        });
        let album = Rc::new(CountingQuery {
            ty: RecordType::new(&ALBUM),
            refreshed: Cell::new(0),
        });
        registry.add_local(song.clone());
        registry.add_local(album);

        assert!(registry.mark_changed(RecordType::new(&SONG)));
        assert!(!registry.mark_changed(RecordType::new(&SONG)));

        let to_refresh = registry.drain_refreshes();
        assert_eq!(to_refresh.len(), 1);
        assert_eq!(to_refresh[0].record_type(), RecordType::new(&SONG));

        // Flushing clears the marks.
        assert!(registry.drain_refreshes().is_empty());
        assert!(registry.mark_changed(RecordType::new(&SONG)));
    }
}
