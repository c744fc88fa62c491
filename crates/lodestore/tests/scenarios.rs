//! End-to-end lifecycle scenarios against a scripted source.

mod common;

use common::{hash, manual_store_with_source, store_with_source, todo};
use serde_json::json;

use lodestore::{RecordId, RecordStatus, StoreError, Written};

#[test]
fn create_then_ack_assigns_id_and_settles() {
    let (store, source) = store_with_source();
    let sk = store.create_record(todo(), hash(json!({"name": "a"}))).unwrap();
    assert_eq!(store.status(sk), RecordStatus::READY | RecordStatus::NEW);
    assert_eq!(store.pending_created(), vec![sk]);

    store.flush_deferred();
    assert_eq!(source.commit_count(), 1);
    let changeset = source.last_commit();
    let batch = changeset.get("Todo").expect("todo bucket");
    assert_eq!(batch.create.store_keys, vec![sk]);
    assert_eq!(batch.create.records[0].get("name"), Some(&json!("a")));
    assert_eq!(
        store.status(sk),
        RecordStatus::READY | RecordStatus::NEW | RecordStatus::COMMITTING
    );

    store.source_did_commit_create(&[(sk, RecordId::new("id1"))]);
    assert_eq!(store.status(sk), RecordStatus::READY);
    assert_eq!(store.id_for(sk), Some(RecordId::new("id1")));
    assert_eq!(store.lookup_store_key(todo(), &RecordId::new("id1")), Some(sk));
    assert_eq!(store.read_attribute(sk, "id"), Some(json!("id1")));
    assert!(!store.has_pending_changes());
}

#[test]
fn edit_commit_push_race_keeps_the_committed_value() {
    let (store, source) = store_with_source();
    let sk = store
        .load_record(todo(), hash(json!({"id": "t1", "x": 1})))
        .unwrap();

    assert_eq!(
        store.update_hash(sk, &hash(json!({"x": 2})), true),
        Written::Applied
    );
    store.flush_deferred();
    assert_eq!(source.commit_count(), 1);
    assert_eq!(
        store.status(sk),
        RecordStatus::READY | RecordStatus::COMMITTING
    );

    // A push lands before the ack: it merges over (and consumes) the
    // rollback snapshot and is otherwise superseded by the in-flight commit.
    store.source_did_fetch_updates(todo(), vec![hash(json!({"id": "t1", "x": 3}))]);
    assert_eq!(
        store.status(sk),
        RecordStatus::READY | RecordStatus::COMMITTING
    );
    assert_eq!(store.read_attribute(sk, "x"), Some(json!(2)));

    store.source_did_commit_update(&[sk]);
    assert_eq!(store.status(sk), RecordStatus::READY);
    assert_eq!(store.read_attribute(sk, "x"), Some(json!(2)));
    assert!(!store.has_pending_changes());
}

#[test]
fn push_to_dirty_record_rebases_surviving_edits() {
    let (store, _source) = manual_store_with_source();
    let sk = store
        .load_record(todo(), hash(json!({"id": "t1", "a": 1, "b": 1})))
        .unwrap();
    let _ = store.update_hash(sk, &hash(json!({"a": 2})), true);

    store.source_did_fetch_updates(todo(), vec![hash(json!({"id": "t1", "b": 9}))]);

    assert_eq!(store.status(sk), RecordStatus::READY | RecordStatus::DIRTY);
    assert_eq!(store.read_attribute(sk, "a"), Some(json!(2)));
    assert_eq!(store.read_attribute(sk, "b"), Some(json!(9)));
    let committed = store.committed_snapshot(sk).unwrap();
    assert_eq!(committed.get("a"), Some(&json!(1)));
    assert_eq!(committed.get("b"), Some(&json!(9)));
    assert_eq!(store.changed_attributes(sk), vec!["a".to_owned()]);
    // Still journaled: the surviving edit commits against the new base.
    assert_eq!(store.pending_changed(), vec![sk]);
}

#[test]
fn push_to_dirty_record_without_rebase_drops_local_edits() {
    let store = lodestore::Store::with_config(lodestore::StoreConfig {
        auto_commit: false,
        rebase_conflicts: false,
    });
    let sk = store
        .load_record(todo(), hash(json!({"id": "t1", "a": 1, "b": 1})))
        .unwrap();
    let _ = store.update_hash(sk, &hash(json!({"a": 2})), true);

    store.source_did_fetch_updates(todo(), vec![hash(json!({"id": "t1", "b": 9}))]);

    assert_eq!(store.status(sk), RecordStatus::READY);
    assert_eq!(store.read_attribute(sk, "a"), Some(json!(1)));
    assert_eq!(store.read_attribute(sk, "b"), Some(json!(9)));
    assert_eq!(store.committed_snapshot(sk), None);
    assert!(store.pending_changed().is_empty());
}

#[test]
fn rebase_where_push_matches_local_edit_goes_clean() {
    let (store, _source) = manual_store_with_source();
    let sk = store
        .load_record(todo(), hash(json!({"id": "t1", "a": 1})))
        .unwrap();
    let _ = store.update_hash(sk, &hash(json!({"a": 2})), true);

    // The server arrived at the same value; no local edit survives.
    store.source_did_fetch_updates(todo(), vec![hash(json!({"id": "t1", "a": 2}))]);

    assert_eq!(store.status(sk), RecordStatus::READY);
    assert_eq!(store.read_attribute(sk, "a"), Some(json!(2)));
    assert_eq!(store.committed_snapshot(sk), None);
    assert!(store.pending_changed().is_empty());
}

#[test]
fn destroying_a_new_record_issues_no_commit() {
    let (store, source) = store_with_source();
    let sk = store.create_record(todo(), hash(json!({"name": "a"}))).unwrap();
    store.destroy_record(sk).unwrap();

    // Unloaded on the spot: key forgotten, nothing journaled.
    assert_eq!(store.record_type_of(sk), None);
    assert!(!store.has_pending_changes());

    store.flush_deferred();
    assert_eq!(source.commit_count(), 0);
}

#[test]
fn permanent_error_rolls_back_and_flags_obsolete() {
    let (store, source) = store_with_source();
    let sk = store
        .load_record(todo(), hash(json!({"id": "t1", "x": 1})))
        .unwrap();
    let _ = store.update_hash(sk, &hash(json!({"x": 2})), true);
    store.flush_deferred();
    assert_eq!(source.commit_count(), 1);

    store.source_did_error(&[sk]);
    assert_eq!(store.status(sk), RecordStatus::READY | RecordStatus::OBSOLETE);
    assert_eq!(store.read_attribute(sk, "x"), Some(json!(1)));
    assert!(store.pending_created().is_empty());
    assert!(store.pending_destroyed().is_empty());
    assert!(store.pending_changed().is_empty());
}

#[test]
fn permanent_error_unloads_a_never_created_record() {
    let (store, source) = store_with_source();
    let sk = store.create_record(todo(), hash(json!({"name": "a"}))).unwrap();
    store.flush_deferred();
    assert_eq!(source.commit_count(), 1);

    store.source_did_error(&[sk]);
    assert_eq!(store.record_type_of(sk), None);
    assert_eq!(store.status(sk), RecordStatus::EMPTY);
}

#[test]
fn fetch_all_sweeps_records_missing_upstream() {
    let (store, _source) = manual_store_with_source();
    let first = store
        .load_record(todo(), hash(json!({"id": "1", "x": 1})))
        .unwrap();
    let second = store
        .load_record(todo(), hash(json!({"id": "2", "x": 2})))
        .unwrap();

    store.source_did_fetch_records(todo(), vec![hash(json!({"id": "1", "x": 10}))], true);

    // "2" was absent from the complete set: destroyed and unloaded.
    assert_eq!(store.record_type_of(second), None);
    assert_eq!(store.lookup_store_key(todo(), &RecordId::new("2")), None);
    // "1" was update-merged.
    assert_eq!(store.read_attribute(first, "x"), Some(json!(10)));
    assert_eq!(store.status(first), RecordStatus::READY);
}

#[test]
fn retrieve_lifecycle_loading_to_ready() {
    let (store, source) = store_with_source();
    let id = RecordId::new("t1");
    let sk = store.retrieve_record(todo(), &id).unwrap();
    assert_eq!(store.status(sk), RecordStatus::EMPTY | RecordStatus::LOADING);
    assert_eq!(source.fetched.borrow().len(), 1);

    // A second retrieve while the fetch is in flight does not re-fetch.
    let again = store.retrieve_record(todo(), &id).unwrap();
    assert_eq!(again, sk);
    assert_eq!(source.fetched.borrow().len(), 1);

    store.source_did_fetch_records(todo(), vec![hash(json!({"id": "t1", "x": 1}))], false);
    assert_eq!(store.status(sk), RecordStatus::READY);
    assert_eq!(store.read_attribute(sk, "x"), Some(json!(1)));
}

#[test]
fn retrieve_missing_record_goes_non_existent() {
    let (store, _source) = store_with_source();
    let id = RecordId::new("ghost");
    let sk = store.retrieve_record(todo(), &id).unwrap();

    store.source_could_not_find_records(todo(), &[id.clone()]);
    assert_eq!(store.status(sk), RecordStatus::NON_EXISTENT);

    // Idempotent against a repeat.
    store.source_could_not_find_records(todo(), &[id]);
    assert_eq!(store.status(sk), RecordStatus::NON_EXISTENT);
}

#[test]
fn refresh_of_a_ready_record_sets_loading() {
    let (store, source) = store_with_source();
    let id = RecordId::new("t1");
    let sk = store
        .load_record(todo(), hash(json!({"id": "t1", "x": 1})))
        .unwrap();

    store.refresh_record(todo(), &id).unwrap();
    assert_eq!(store.status(sk), RecordStatus::READY | RecordStatus::LOADING);
    assert_eq!(source.refreshed.borrow().len(), 1);

    store.source_did_fetch_records(todo(), vec![hash(json!({"id": "t1", "x": 5}))], false);
    assert_eq!(store.status(sk), RecordStatus::READY);
    assert_eq!(store.read_attribute(sk, "x"), Some(json!(5)));
}

#[test]
fn destroy_waits_for_the_create_ack() {
    let (store, source) = store_with_source();
    let sk = store.create_record(todo(), hash(json!({"name": "a"}))).unwrap();
    store.flush_deferred();
    assert_eq!(source.commit_count(), 1);

    // Destroyed while the create is in flight: the destroy must wait for
    // the server id.
    store.destroy_record(sk).unwrap();
    assert_eq!(
        store.status(sk),
        RecordStatus::DESTROYED | RecordStatus::DIRTY | RecordStatus::NEW
    );
    store.flush_deferred();
    assert_eq!(source.commit_count(), 1, "destroy deferred until the id exists");
    assert_eq!(store.pending_destroyed(), vec![sk]);

    store.source_did_commit_create(&[(sk, RecordId::new("id9"))]);
    store.flush_deferred();
    assert_eq!(source.commit_count(), 2);
    let changeset = source.last_commit();
    let batch = changeset.get("Todo").unwrap();
    assert_eq!(batch.destroy.ids, vec![RecordId::new("id9")]);
    assert_eq!(
        store.status(sk),
        RecordStatus::DESTROYED | RecordStatus::COMMITTING
    );

    store.source_did_commit_destroy(&[sk]);
    assert_eq!(store.record_type_of(sk), None);
}

#[test]
fn transient_update_failure_requeues_the_record() {
    let (store, source) = store_with_source();
    let sk = store
        .load_record(todo(), hash(json!({"id": "t1", "x": 1})))
        .unwrap();
    let _ = store.update_hash(sk, &hash(json!({"x": 2})), true);
    store.flush_deferred();
    assert_eq!(source.commit_count(), 1);

    store.source_did_not_update(&[sk]);
    assert_eq!(store.status(sk), RecordStatus::READY | RecordStatus::DIRTY);
    assert_eq!(
        store.committed_snapshot(sk).unwrap().get("x"),
        Some(&json!(1))
    );
    assert_eq!(store.changed_attributes(sk), vec!["x".to_owned()]);
    assert_eq!(store.pending_changed(), vec![sk]);

    store.flush_deferred();
    assert_eq!(source.commit_count(), 2, "record retries on the next commit");
}

#[test]
fn transient_create_failure_requeues_the_record() {
    let (store, source) = store_with_source();
    let sk = store.create_record(todo(), hash(json!({"name": "a"}))).unwrap();
    store.flush_deferred();

    store.source_did_not_create(&[sk]);
    assert_eq!(store.status(sk), RecordStatus::READY | RecordStatus::NEW);
    assert_eq!(store.pending_created(), vec![sk]);

    store.commit_changes().unwrap();
    assert_eq!(source.commit_count(), 2);
}

#[test]
fn transient_destroy_failure_requeues_the_record() {
    let (store, source) = store_with_source();
    let sk = store
        .load_record(todo(), hash(json!({"id": "t1"})))
        .unwrap();
    store.destroy_record(sk).unwrap();
    store.flush_deferred();
    assert_eq!(source.commit_count(), 1);

    store.source_did_not_destroy(&[sk]);
    assert_eq!(
        store.status(sk),
        RecordStatus::DESTROYED | RecordStatus::DIRTY
    );
    assert_eq!(store.pending_destroyed(), vec![sk]);
}

#[test]
fn update_ack_after_a_push_cleared_committing_flags_obsolete() {
    let (store, _source) = store_with_source();
    let sk = store
        .load_record(todo(), hash(json!({"id": "t1", "a": 1})))
        .unwrap();
    let _ = store.update_hash(sk, &hash(json!({"a": 2})), true);
    store.flush_deferred();

    // Re-dirty the record mid-flight, then let a push rebase it; the rebase
    // clears COMMITTING.
    let _ = store.update_hash(sk, &hash(json!({"a": 3})), true);
    store.source_did_fetch_updates(todo(), vec![hash(json!({"id": "t1", "b": 7}))]);
    assert_eq!(store.status(sk), RecordStatus::READY | RecordStatus::DIRTY);

    store.source_did_commit_update(&[sk]);
    assert!(store.status(sk).contains(RecordStatus::OBSOLETE));
}

#[test]
fn has_updates_flags_ready_records_obsolete() {
    let (store, _source) = manual_store_with_source();
    let sk = store
        .load_record(todo(), hash(json!({"id": "t1"})))
        .unwrap();

    store.source_has_updates_for_records(todo(), &[RecordId::new("t1"), RecordId::new("ghost")]);
    assert_eq!(store.status(sk), RecordStatus::READY | RecordStatus::OBSOLETE);

    // OBSOLETE is a modifier: the record is not unloadable.
    assert!(!store.may_unload_record(sk));
    assert!(matches!(
        store.unload_record(sk),
        Err(StoreError::UnloadRefused { .. })
    ));
}

#[test]
fn discard_changes_drops_every_pending_mutation() {
    let (store, _source) = manual_store_with_source();
    let created = store.create_record(todo(), hash(json!({"name": "new"}))).unwrap();
    let edited = store
        .load_record(todo(), hash(json!({"id": "t1", "x": 1})))
        .unwrap();
    let doomed = store
        .load_record(todo(), hash(json!({"id": "t2"})))
        .unwrap();
    let _ = store.update_hash(edited, &hash(json!({"x": 2})), true);
    store.destroy_record(doomed).unwrap();

    store.discard_changes();

    assert!(store.pending_created().is_empty());
    assert!(store.pending_destroyed().is_empty());
    assert!(store.pending_changed().is_empty());
    assert_eq!(store.record_type_of(created), None, "created record unloaded");
    assert_eq!(store.status(edited), RecordStatus::READY);
    assert_eq!(store.read_attribute(edited, "x"), Some(json!(1)));
    assert_eq!(store.committed_snapshot(edited), None);
    assert_eq!(store.status(doomed), RecordStatus::READY);
}

#[test]
fn create_on_an_existing_record_is_refused() {
    let (store, _source) = manual_store_with_source();
    let sk = store
        .load_record(todo(), hash(json!({"id": "t1"})))
        .unwrap();
    let err = store.create_record_at(sk, hash(json!({"x": 1}))).unwrap_err();
    assert!(matches!(err, StoreError::CreateOnExisting { .. }));
    assert_eq!(store.status(sk), RecordStatus::READY);
}

#[test]
fn destroy_of_an_unloaded_record_is_refused() {
    let (store, _source) = manual_store_with_source();
    let sk = store.store_key_for(todo(), Some(&RecordId::new("t1")));
    assert!(matches!(
        store.destroy_record(sk),
        Err(StoreError::IllegalStatus { .. })
    ));
}

#[test]
fn fetched_record_for_a_destroyed_key_is_skipped() {
    let (store, _source) = manual_store_with_source();
    let sk = store
        .load_record(todo(), hash(json!({"id": "t1", "x": 1})))
        .unwrap();
    store.destroy_record(sk).unwrap();

    store.source_did_fetch_records(todo(), vec![hash(json!({"id": "t1", "x": 9}))], false);
    assert_eq!(
        store.status(sk),
        RecordStatus::DESTROYED | RecordStatus::DIRTY
    );
    assert_eq!(store.read_attribute(sk, "x"), Some(json!(1)));
}

#[test]
fn upstream_destroy_unloads_even_a_dirty_record() {
    let (store, _source) = manual_store_with_source();
    let sk = store
        .load_record(todo(), hash(json!({"id": "t1", "x": 1})))
        .unwrap();
    let _ = store.update_hash(sk, &hash(json!({"x": 2})), true);

    store.source_did_destroy_records(todo(), &[RecordId::new("t1")]);
    assert_eq!(store.record_type_of(sk), None);
    assert!(store.pending_changed().is_empty());

    // Destroy of an already-unloaded record is a no-op.
    store.source_did_destroy_records(todo(), &[RecordId::new("t1")]);
}

#[test]
fn create_ack_for_a_non_new_record_is_ignored() {
    let (store, _source) = manual_store_with_source();
    let sk = store
        .load_record(todo(), hash(json!({"id": "t1"})))
        .unwrap();
    store.source_did_commit_create(&[(sk, RecordId::new("other"))]);
    assert_eq!(store.status(sk), RecordStatus::READY);
    assert_eq!(store.id_for(sk), Some(RecordId::new("t1")));
}
