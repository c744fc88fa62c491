//! Per-store configuration.

/// Behavior switches for one [`Store`](crate::Store) instance.
///
/// Nested overlay semantics are not a flag here: a store is nested iff it
/// was created through [`Store::nest`](crate::Store::nest), which makes the
/// invalid "nested without a parent" combination unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// After any mutation, schedule a commit at end of tick.
    pub auto_commit: bool,
    /// On a server update to a dirty record, reapply surviving local edits
    /// on top of the new base instead of dropping them.
    pub rebase_conflicts: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            auto_commit: true,
            rebase_conflicts: true,
        }
    }
}

impl StoreConfig {
    /// Configuration with automatic end-of-tick commits disabled.
    #[must_use]
    pub const fn manual_commit() -> Self {
        Self {
            auto_commit: false,
            rebase_conflicts: true,
        }
    }
}
