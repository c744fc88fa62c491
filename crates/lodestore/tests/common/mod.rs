//! Shared fixture: a scripted recording source and hash helpers.
#![allow(dead_code)] // each test binary uses a subset

use std::cell::RefCell;
use std::rc::Rc;

use lodestore::{
    AttributeHash, Changeset, RecordId, RecordType, RecordTypeDef, RemoteQuery, Source, Store,
    StoreConfig,
};

pub static TODO: RecordTypeDef = RecordTypeDef {
    name: "Todo",
    primary_key: "id",
};

pub fn todo() -> RecordType {
    RecordType::new(&TODO)
}

pub fn hash(value: serde_json::Value) -> AttributeHash {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

/// Source that records every call and answers nothing on its own; tests
/// drive the store's callback surface explicitly.
#[derive(Default)]
pub struct RecordingSource {
    pub commits: RefCell<Vec<Changeset>>,
    pub fetched: RefCell<Vec<(String, RecordId)>>,
    pub refreshed: RefCell<Vec<(String, RecordId)>>,
    pub fetched_all: RefCell<Vec<String>>,
    pub queries: RefCell<Vec<String>>,
}

impl RecordingSource {
    pub fn commit_count(&self) -> usize {
        self.commits.borrow().len()
    }

    pub fn last_commit(&self) -> Changeset {
        self.commits.borrow().last().cloned().expect("a commit was dispatched")
    }
}

impl Source for RecordingSource {
    fn fetch_record(&self, _store: &Store, ty: RecordType, id: &RecordId) {
        self.fetched
            .borrow_mut()
            .push((ty.name().to_owned(), id.clone()));
    }

    fn refresh_record(&self, _store: &Store, ty: RecordType, id: &RecordId) {
        self.refreshed
            .borrow_mut()
            .push((ty.name().to_owned(), id.clone()));
    }

    fn fetch_records(&self, _store: &Store, ty: RecordType) {
        self.fetched_all.borrow_mut().push(ty.name().to_owned());
    }

    fn fetch_query(&self, _store: &Store, query: &Rc<dyn RemoteQuery>) {
        self.queries.borrow_mut().push(query.descriptor().to_owned());
    }

    fn commit_changes(&self, _store: &Store, changeset: Changeset) {
        self.commits.borrow_mut().push(changeset);
    }
}

pub fn store_with_source() -> (Store, Rc<RecordingSource>) {
    let store = Store::new();
    let source = Rc::new(RecordingSource::default());
    store.set_source(source.clone());
    (store, source)
}

pub fn manual_store_with_source() -> (Store, Rc<RecordingSource>) {
    let store = Store::with_config(StoreConfig::manual_commit());
    let source = Rc::new(RecordingSource::default());
    store.set_source(source.clone());
    (store, source)
}
