//! Store metrics.
//!
//! Process-wide counters covering the commit pipeline and the
//! reconciliation engine. Cheap relaxed atomics; read them through
//! [`metrics_snapshot`] and reset in tests with [`reset_metrics`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Changesets handed to the source.
static LODESTORE_COMMITS_TOTAL: AtomicU64 = AtomicU64::new(0);
/// Create acks applied.
static LODESTORE_CREATES_ACKED_TOTAL: AtomicU64 = AtomicU64::new(0);
/// Update acks applied.
static LODESTORE_UPDATES_ACKED_TOTAL: AtomicU64 = AtomicU64::new(0);
/// Destroy acks applied.
static LODESTORE_DESTROYS_ACKED_TOTAL: AtomicU64 = AtomicU64::new(0);
/// Dirty-vs-push conflicts where local edits survived a rebase.
static LODESTORE_CONFLICTS_REBASED_TOTAL: AtomicU64 = AtomicU64::new(0);
/// Dirty-vs-push conflicts where local edits were dropped.
static LODESTORE_CONFLICTS_DROPPED_TOTAL: AtomicU64 = AtomicU64::new(0);
/// Transient commit failures (records re-queued).
static LODESTORE_TRANSIENT_FAILURES_TOTAL: AtomicU64 = AtomicU64::new(0);
/// Permanent commit failures (records rolled back and flagged obsolete).
static LODESTORE_PERMANENT_FAILURES_TOTAL: AtomicU64 = AtomicU64::new(0);

/// Point-in-time snapshot of the store metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub commits_total: u64,
    pub creates_acked_total: u64,
    pub updates_acked_total: u64,
    pub destroys_acked_total: u64,
    pub conflicts_rebased_total: u64,
    pub conflicts_dropped_total: u64,
    pub transient_failures_total: u64,
    pub permanent_failures_total: u64,
}

/// Read a point-in-time snapshot of all counters.
#[must_use]
pub fn metrics_snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        commits_total: LODESTORE_COMMITS_TOTAL.load(Ordering::Relaxed),
        creates_acked_total: LODESTORE_CREATES_ACKED_TOTAL.load(Ordering::Relaxed),
        updates_acked_total: LODESTORE_UPDATES_ACKED_TOTAL.load(Ordering::Relaxed),
        destroys_acked_total: LODESTORE_DESTROYS_ACKED_TOTAL.load(Ordering::Relaxed),
        conflicts_rebased_total: LODESTORE_CONFLICTS_REBASED_TOTAL.load(Ordering::Relaxed),
        conflicts_dropped_total: LODESTORE_CONFLICTS_DROPPED_TOTAL.load(Ordering::Relaxed),
        transient_failures_total: LODESTORE_TRANSIENT_FAILURES_TOTAL.load(Ordering::Relaxed),
        permanent_failures_total: LODESTORE_PERMANENT_FAILURES_TOTAL.load(Ordering::Relaxed),
    }
}

/// Reset all counters to zero (tests/diagnostics).
pub fn reset_metrics() {
    LODESTORE_COMMITS_TOTAL.store(0, Ordering::Relaxed);
    LODESTORE_CREATES_ACKED_TOTAL.store(0, Ordering::Relaxed);
    LODESTORE_UPDATES_ACKED_TOTAL.store(0, Ordering::Relaxed);
    LODESTORE_DESTROYS_ACKED_TOTAL.store(0, Ordering::Relaxed);
    LODESTORE_CONFLICTS_REBASED_TOTAL.store(0, Ordering::Relaxed);
    LODESTORE_CONFLICTS_DROPPED_TOTAL.store(0, Ordering::Relaxed);
    LODESTORE_TRANSIENT_FAILURES_TOTAL.store(0, Ordering::Relaxed);
    LODESTORE_PERMANENT_FAILURES_TOTAL.store(0, Ordering::Relaxed);
}

pub(crate) fn count_commit() {
    LODESTORE_COMMITS_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn count_create_acked() {
    LODESTORE_CREATES_ACKED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn count_update_acked() {
    LODESTORE_UPDATES_ACKED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn count_destroy_acked() {
    LODESTORE_DESTROYS_ACKED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn count_conflict_rebased() {
    LODESTORE_CONFLICTS_REBASED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn count_conflict_dropped() {
    LODESTORE_CONFLICTS_DROPPED_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn count_transient_failure() {
    LODESTORE_TRANSIENT_FAILURES_TOTAL.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn count_permanent_failure() {
    LODESTORE_PERMANENT_FAILURES_TOTAL.fetch_add(1, Ordering::Relaxed);
}
