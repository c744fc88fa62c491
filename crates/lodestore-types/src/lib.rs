//! Foundation types for the lodestore record store.
//!
//! This crate is intentionally small: it defines the identity and status
//! vocabulary shared by the store core and by host code implementing the
//! collaborator seams (sources, materialized records, queries).

pub mod record;
pub mod status;

pub use record::{AttributeHash, AttributeValue, RecordId, RecordType, RecordTypeDef, merge_hash};
pub use status::RecordStatus;

use std::fmt;
use std::num::NonZeroU64;

/// Opaque identity token for one record within one store instance.
///
/// Store keys are allocated monotonically starting at 1 and are never reused
/// within an instance's lifetime. A newly-created record has a store key
/// before it has a server-assigned id; the key stays stable until the record
/// is unloaded.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct StoreKey(NonZeroU64);

impl StoreKey {
    /// The first key an allocator hands out.
    pub const FIRST: Self = Self(NonZeroU64::MIN);

    /// Create a store key from a raw u64.
    ///
    /// Returns `None` if `n` is 0 (key 0 does not exist).
    #[inline]
    #[must_use]
    pub const fn new(n: u64) -> Option<Self> {
        match NonZeroU64::new(n) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Get the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }

    /// The key following this one in allocation order.
    ///
    /// Returns `None` on overflow (practically unreachable).
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        Self::new(self.0.get().wrapping_add(1))
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sk{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_key_zero_is_invalid() {
        assert!(StoreKey::new(0).is_none());
        assert_eq!(StoreKey::new(1), Some(StoreKey::FIRST));
    }

    #[test]
    fn store_key_next_is_monotonic() {
        let first = StoreKey::FIRST;
        let second = first.next().unwrap();
        assert!(second > first);
        assert_eq!(second.get(), 2);
    }

    #[test]
    fn store_key_display() {
        assert_eq!(StoreKey::new(42).unwrap().to_string(), "sk42");
    }

    #[test]
    fn store_key_serde_round_trip() {
        let key = StoreKey::new(7).unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "7");
        let back: StoreKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
