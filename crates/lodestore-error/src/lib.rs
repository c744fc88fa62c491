use lodestore_types::{RecordId, RecordStatus, StoreKey};
use thiserror::Error;

/// Primary error type for lodestore operations.
///
/// Two families share this enum. *Illegal client operations* — misuse of the
/// store's mutation API — surface as `Err` values the caller can fix.
/// *Source-side conditions* (transient commit failures, protocol mismatches)
/// never cross the callback seam as errors; the reconciliation engine
/// constructs them to classify what happened — via [`is_transient`] and
/// [`is_protocol_mismatch`] — and routes logging and metrics off that, so
/// the classification lives in one place.
///
/// [`is_transient`]: StoreError::is_transient
/// [`is_protocol_mismatch`]: StoreError::is_protocol_mismatch
#[derive(Error, Debug)]
pub enum StoreError {
    /// `create_record` targeted a key whose status does not permit creation.
    #[error("cannot create record at {store_key}: status {status:?} is neither empty nor destroyed")]
    CreateOnExisting {
        store_key: StoreKey,
        status: RecordStatus,
    },

    /// A mutation targeted a status it is not defined for.
    #[error("cannot {operation} record at {store_key} in status {status:?}")]
    IllegalStatus {
        operation: &'static str,
        store_key: StoreKey,
        status: RecordStatus,
    },

    /// An id was assigned that another record of the type already holds.
    #[error("id '{id}' is already in use for record type {type_name}")]
    DuplicateId {
        type_name: &'static str,
        id: RecordId,
    },

    /// The store key was never allocated by this store (or its parent
    /// chain). As a callback classification this is the benign stale-key
    /// race: the record was unloaded while a source response was in flight.
    #[error("unknown store key {store_key}")]
    UnknownStoreKey { store_key: StoreKey },

    /// `unload_record` was refused: the record is mid-lifecycle, observed,
    /// or a nested store still depends on it.
    #[error("cannot unload record at {store_key} (status {status:?}): {reason}")]
    UnloadRefused {
        store_key: StoreKey,
        status: RecordStatus,
        reason: &'static str,
    },

    /// The operation is only defined on a root store, not a nested overlay.
    #[error("operation '{operation}' is not supported on a nested store")]
    UnsupportedOnNested { operation: &'static str },

    /// The operation needs a source and none is attached.
    #[error("no source is attached to this store")]
    NoSource,

    /// The source could not commit a mutation right now. The record rolls
    /// back to its pre-commit state and retries on the next commit.
    #[error("transient {operation} failure for record at {store_key}; re-queued")]
    TransientCommitFailure {
        operation: &'static str,
        store_key: StoreKey,
    },

    /// The source failed a commit permanently. The record rolls back to its
    /// last committed snapshot and is flagged obsolete (or unloaded, if it
    /// never reached the server).
    #[error("permanent commit failure for record at {store_key}")]
    PermanentCommitFailure { store_key: StoreKey },

    /// A source acknowledgement targeted a record whose status cannot
    /// accept it (e.g. a create ack for a record that is not new). The
    /// record is left untouched.
    #[error("protocol mismatch: {operation} for record at {store_key} in status {status:?}")]
    ProtocolMismatch {
        operation: &'static str,
        store_key: StoreKey,
        status: RecordStatus,
    },
}

impl StoreError {
    /// Whether this error reports API misuse the caller must fix (as opposed
    /// to a missing-collaborator configuration problem or a source-side
    /// condition).
    #[must_use]
    pub const fn is_illegal_operation(&self) -> bool {
        matches!(
            self,
            Self::CreateOnExisting { .. }
                | Self::IllegalStatus { .. }
                | Self::DuplicateId { .. }
                | Self::UnknownStoreKey { .. }
                | Self::UnloadRefused { .. }
                | Self::UnsupportedOnNested { .. }
        )
    }

    /// Whether this is a transient condition that may succeed on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientCommitFailure { .. })
    }

    /// Whether the source and the store disagreed about a record's state.
    /// Mismatches are logged loudly; the record is never touched.
    #[must_use]
    pub const fn is_protocol_mismatch(&self) -> bool {
        matches!(self, Self::ProtocolMismatch { .. })
    }

    /// Create an [`StoreError::IllegalStatus`] for `operation`.
    #[must_use]
    pub const fn illegal(
        operation: &'static str,
        store_key: StoreKey,
        status: RecordStatus,
    ) -> Self {
        Self::IllegalStatus {
            operation,
            store_key,
            status,
        }
    }

    /// Create a [`StoreError::TransientCommitFailure`] for `operation`.
    #[must_use]
    pub const fn transient(operation: &'static str, store_key: StoreKey) -> Self {
        Self::TransientCommitFailure {
            operation,
            store_key,
        }
    }

    /// Create a [`StoreError::PermanentCommitFailure`].
    #[must_use]
    pub const fn permanent(store_key: StoreKey) -> Self {
        Self::PermanentCommitFailure { store_key }
    }

    /// Create a [`StoreError::ProtocolMismatch`] for `operation`.
    #[must_use]
    pub const fn mismatch(
        operation: &'static str,
        store_key: StoreKey,
        status: RecordStatus,
    ) -> Self {
        Self::ProtocolMismatch {
            operation,
            store_key,
            status,
        }
    }
}

/// Result type alias using [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;
