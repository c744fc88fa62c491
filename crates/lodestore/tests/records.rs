//! Materialized-record notifications and unload interplay.

mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use common::{hash, manual_store_with_source, todo};
use serde_json::json;

use lodestore::{MaterializedRecord, RecordId, RecordStatus, Store, StoreKey};

#[derive(Default)]
struct ProbeRecord {
    props: RefCell<Vec<String>>,
    statuses: RefCell<Vec<(RecordStatus, RecordStatus)>>,
    computed: Cell<u32>,
    observed: Cell<bool>,
    unloaded: Cell<bool>,
}

impl MaterializedRecord for ProbeRecord {
    fn property_did_change(&self, key: &str) {
        self.props.borrow_mut().push(key.to_owned());
    }

    fn computed_property_did_change(&self) {
        self.computed.set(self.computed.get() + 1);
    }

    fn status_did_change(&self, previous: RecordStatus, next: RecordStatus) {
        self.statuses.borrow_mut().push((previous, next));
    }

    fn has_observers(&self) -> bool {
        self.observed.get()
    }

    fn store_will_unload(&self) {
        self.unloaded.set(true);
    }
}

type ProbeSink = Rc<RefCell<Vec<Rc<ProbeRecord>>>>;

/// Store with a probe materializer; every materialized probe is collected so
/// tests can inspect it.
fn probe_store_with_sink() -> (Store, StoreKey, Rc<ProbeRecord>, ProbeSink) {
    let (store, _source) = manual_store_with_source();
    let probes: ProbeSink = Rc::new(RefCell::new(Vec::new()));
    let sink = probes.clone();
    store.register_materializer(
        todo(),
        Rc::new(move |_store, _sk| {
            let probe = Rc::new(ProbeRecord::default());
            sink.borrow_mut().push(probe.clone());
            probe
        }),
    );
    let sk = store
        .load_record(todo(), hash(json!({"id": "t1", "x": 1})))
        .unwrap();
    store.materialize_record(sk).expect("materializer registered");
    let probe = probes.borrow()[0].clone();
    (store, sk, probe, probes)
}

fn probe_store() -> (Store, StoreKey, Rc<ProbeRecord>) {
    let (store, sk, probe, _sink) = probe_store_with_sink();
    (store, sk, probe)
}

#[test]
fn materialization_is_lazy_and_cached() {
    let (store, sk, _probe) = probe_store();
    let first = store.materialize_record(sk).unwrap();
    let second = store.materialize_record(sk).unwrap();
    assert!(Rc::ptr_eq(&first, &second));
}

#[test]
fn attribute_writes_notify_the_record() {
    let (store, sk, probe) = probe_store();
    let _ = store.update_hash(sk, &hash(json!({"x": 2, "y": 3})), true);
    let props = probe.props.borrow();
    assert!(props.contains(&"x".to_owned()));
    assert!(props.contains(&"y".to_owned()));
}

#[test]
fn status_transitions_notify_the_record() {
    let (store, sk, probe) = probe_store();
    let _ = store.update_hash(sk, &hash(json!({"x": 2})), true);
    assert_eq!(
        probe.statuses.borrow().last().copied(),
        Some((
            RecordStatus::READY,
            RecordStatus::READY | RecordStatus::DIRTY
        ))
    );
}

#[test]
fn observed_records_cannot_unload() {
    let (store, sk, probe) = probe_store();
    probe.observed.set(true);
    assert!(!store.may_unload_record(sk));
    assert!(store.unload_record(sk).is_err());

    probe.observed.set(false);
    store.unload_record(sk).unwrap();
    assert!(probe.unloaded.get());
    assert!(store.record_for(sk).is_none());
}

#[test]
fn id_assignment_notifies_identity_changes() {
    let (store, _sk, probe, sink) = probe_store_with_sink();

    let created = store.create_record(todo(), hash(json!({"x": 9}))).unwrap();
    store.materialize_record(created).unwrap();
    store.commit_changes().unwrap();
    store.source_did_commit_create(&[(created, RecordId::new("srv1"))]);

    let created_probe = sink.borrow()[1].clone();
    assert!(created_probe.props.borrow().contains(&"id".to_owned()));
    assert_eq!(created_probe.computed.get(), 1);
    assert_eq!(store.read_attribute(created, "id"), Some(json!("srv1")));
    assert_eq!(store.status(created), RecordStatus::READY);
    // The unrelated record saw no identity change.
    assert_eq!(probe.computed.get(), 0);
}
