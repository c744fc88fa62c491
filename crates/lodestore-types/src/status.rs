//! The per-record status bitfield.
//!
//! A record's status combines exactly one *core state* (`EMPTY`, `READY`,
//! `DESTROYED`, `NON_EXISTENT`) with any subset of *modifier flags*
//! (`LOADING`, `COMMITTING`, `NEW`, `DIRTY`, `OBSOLETE`). Core-state and
//! modifier bits are orthogonal, which is what makes the bitfield encoding
//! load-bearing rather than incidental.

bitflags::bitflags! {
    /// Bitfield status of one record.
    ///
    /// Exactly one core-state bit is set at any time; the store's status
    /// table enforces this at its single mutation point.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RecordStatus: u16 {
        /// No data known.
        const EMPTY = 0x0001;
        /// Data in memory.
        const READY = 0x0002;
        /// Destroyed, locally or upstream.
        const DESTROYED = 0x0004;
        /// Server confirms no such record.
        const NON_EXISTENT = 0x0008;

        /// Fetch in flight.
        const LOADING = 0x0100;
        /// Commit in flight.
        const COMMITTING = 0x0200;
        /// Locally created; not yet acknowledged by the source.
        const NEW = 0x0400;
        /// Local edits not yet committed.
        const DIRTY = 0x0800;
        /// The source signaled newer data may exist upstream.
        const OBSOLETE = 0x1000;

        /// All core-state bits.
        const CORE_MASK = Self::EMPTY.bits()
            | Self::READY.bits()
            | Self::DESTROYED.bits()
            | Self::NON_EXISTENT.bits();
        /// All modifier bits.
        const MODIFIER_MASK = Self::LOADING.bits()
            | Self::COMMITTING.bits()
            | Self::NEW.bits()
            | Self::DIRTY.bits()
            | Self::OBSOLETE.bits();
    }
}

impl RecordStatus {
    /// The core-state bits of this status.
    #[inline]
    #[must_use]
    pub const fn core_state(self) -> Self {
        self.intersection(Self::CORE_MASK)
    }

    /// The modifier bits of this status.
    #[inline]
    #[must_use]
    pub const fn modifiers(self) -> Self {
        self.intersection(Self::MODIFIER_MASK)
    }

    /// Replace the core state, keeping the modifiers.
    #[inline]
    #[must_use]
    pub const fn with_core(self, core: Self) -> Self {
        self.modifiers().union(core.core_state())
    }

    /// Whether exactly one core-state bit is set.
    #[must_use]
    pub const fn has_single_core_state(self) -> bool {
        self.core_state().bits().count_ones() == 1
    }

    /// Whether the record holds data in memory.
    #[inline]
    #[must_use]
    pub const fn is_ready(self) -> bool {
        self.contains(Self::READY)
    }

    /// Whether the record is destroyed (locally or upstream).
    #[inline]
    #[must_use]
    pub const fn is_destroyed(self) -> bool {
        self.contains(Self::DESTROYED)
    }

    /// Whether local edits are pending commit.
    #[inline]
    #[must_use]
    pub const fn is_dirty(self) -> bool {
        self.contains(Self::DIRTY)
    }

    /// Whether a commit is in flight for this record.
    #[inline]
    #[must_use]
    pub const fn is_committing(self) -> bool {
        self.contains(Self::COMMITTING)
    }

    /// Whether the record was created locally and not yet acknowledged.
    #[inline]
    #[must_use]
    pub const fn is_new(self) -> bool {
        self.contains(Self::NEW)
    }

    /// Whether the record can be unloaded: a clean `EMPTY`, `READY`, or
    /// `DESTROYED` core state with no modifier bits whatsoever. `OBSOLETE`
    /// counts as a modifier here and vetoes unload.
    #[must_use]
    pub const fn is_unloadable(self) -> bool {
        self.modifiers().is_empty()
            && (self.contains(Self::EMPTY)
                || self.contains(Self::READY)
                || self.contains(Self::DESTROYED))
    }
}

impl Default for RecordStatus {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl serde::Serialize for RecordStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.bits().serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for RecordStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u16::deserialize(deserializer)?;
        Self::from_bits(bits).ok_or_else(|| {
            serde::de::Error::custom(format!("invalid RecordStatus bits: {bits:#x}"))
        })
    }
}
