//! Client-side record store.
//!
//! An in-memory cache of structured records that mediates between user code
//! and an asynchronous remote [`Source`]. The store guarantees a
//! well-defined per-record lifecycle (a bitfield [`RecordStatus`] of one
//! core state plus modifier flags), coalesces user mutations into batched
//! commits at end of tick, reconciles concurrent local edits with
//! server-originated updates — including a rebase policy for conflicts —
//! and maintains derived query views and nested overlay stores.
//!
//! The scheduling model is single-threaded cooperative: no operation
//! suspends, all collaborator callbacks are synchronous, and the only
//! deferral primitive is the per-tick task queue drained by
//! [`Store::flush_deferred`].
//!
//! ```
//! use std::rc::Rc;
//! use lodestore::{Store, StoreConfig};
//! use lodestore_types::{RecordType, RecordTypeDef};
//! use serde_json::json;
//!
//! static CONTACT: RecordTypeDef = RecordTypeDef { name: "Contact", primary_key: "id" };
//! let contact = RecordType::new(&CONTACT);
//!
//! let store = Store::with_config(StoreConfig::manual_commit());
//! let hash = match json!({"id": "c1", "name": "Ada"}) {
//!     serde_json::Value::Object(map) => map,
//!     _ => unreachable!(),
//! };
//! let sk = store.load_record(contact, hash).unwrap();
//! assert!(store.status(sk).is_ready());
//! ```

pub mod commit;
pub mod config;
pub mod metrics;
pub mod query;
pub mod record;
pub mod scheduler;
pub mod source;

mod data;
mod journal;
mod nested;
mod reconcile;
mod registry;
mod store;

pub use commit::{Changeset, CreateBatch, DestroyBatch, TypeChangeset, UpdateBatch};
pub use config::StoreConfig;
pub use lodestore_error::{Result, StoreError};
pub use lodestore_types::{
    AttributeHash, AttributeValue, RecordId, RecordStatus, RecordType, RecordTypeDef, StoreKey,
};
pub use metrics::{metrics_snapshot, reset_metrics, MetricsSnapshot};
pub use query::{LocalQuery, RemoteQuery};
pub use record::{MaterializedRecord, RecordMaterializer};
pub use scheduler::{DeferredHook, DeferredTask};
pub use source::Source;
pub use store::{Store, Written};
