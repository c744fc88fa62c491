//! Store-key allocation and the `(type, id) ↔ key` bijection.
//!
//! Keys are allocated monotonically and never reused within a store's
//! lifetime. A key exists before its record has a server id (locally-created
//! records); the id side of the bijection is patched in by the create-ack.

use std::collections::HashMap;

use indexmap::IndexSet;
use lodestore_types::{RecordId, RecordType, StoreKey};

/// Identity tables for one store family (shared by nested overlays).
#[derive(Debug)]
pub(crate) struct KeyRegistry {
    next: StoreKey,
    types: HashMap<StoreKey, RecordType>,
    ids: HashMap<StoreKey, RecordId>,
    by_id: HashMap<RecordType, HashMap<RecordId, StoreKey>>,
    by_type: HashMap<RecordType, IndexSet<StoreKey>>,
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self {
            next: StoreKey::FIRST,
            types: HashMap::new(),
            ids: HashMap::new(),
            by_id: HashMap::new(),
            by_type: HashMap::new(),
        }
    }
}

impl KeyRegistry {
    /// Existing key for `(ty, id)` if mapped, else a fresh allocation.
    ///
    /// With `id = None` this always allocates: a new record gets its key
    /// before the server assigns an id.
    pub(crate) fn key_for(&mut self, ty: RecordType, id: Option<&RecordId>) -> StoreKey {
        if let Some(id) = id {
            if let Some(sk) = self.by_id.get(&ty).and_then(|m| m.get(id)) {
                return *sk;
            }
        }
        let sk = self.allocate(ty);
        if let Some(id) = id {
            self.ids.insert(sk, id.clone());
            self.by_id.entry(ty).or_default().insert(id.clone(), sk);
        }
        sk
    }

    /// Key for `(ty, id)` without allocating.
    pub(crate) fn lookup(&self, ty: RecordType, id: &RecordId) -> Option<StoreKey> {
        self.by_id.get(&ty).and_then(|m| m.get(id)).copied()
    }

    /// Bind `id` to an already-allocated key. Fails when another key of the
    /// same type already holds the id.
    pub(crate) fn assign_id(&mut self, sk: StoreKey, id: RecordId) -> Result<(), RecordId> {
        let Some(ty) = self.types.get(&sk).copied() else {
            return Err(id);
        };
        let ids_of_type = self.by_id.entry(ty).or_default();
        if let Some(existing) = ids_of_type.get(&id) {
            if *existing != sk {
                return Err(id);
            }
            return Ok(());
        }
        if let Some(previous) = self.ids.insert(sk, id.clone()) {
            ids_of_type.remove(&previous);
        }
        ids_of_type.insert(id, sk);
        Ok(())
    }

    pub(crate) fn type_of(&self, sk: StoreKey) -> Option<RecordType> {
        self.types.get(&sk).copied()
    }

    pub(crate) fn id_of(&self, sk: StoreKey) -> Option<&RecordId> {
        self.ids.get(&sk)
    }

    /// All keys of `ty`, in allocation order.
    pub(crate) fn keys_of(&self, ty: RecordType) -> Vec<StoreKey> {
        self.by_type
            .get(&ty)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The ids currently mapped for `ty`, with their keys.
    pub(crate) fn ids_of_type(&self, ty: RecordType) -> Vec<(RecordId, StoreKey)> {
        self.by_id
            .get(&ty)
            .map(|m| m.iter().map(|(id, sk)| (id.clone(), *sk)).collect())
            .unwrap_or_default()
    }

    /// Drop every trace of `sk`. The key is never handed out again.
    pub(crate) fn remove(&mut self, sk: StoreKey) {
        if let Some(ty) = self.types.remove(&sk) {
            if let Some(set) = self.by_type.get_mut(&ty) {
                set.shift_remove(&sk);
            }
            if let Some(id) = self.ids.remove(&sk) {
                if let Some(m) = self.by_id.get_mut(&ty) {
                    m.remove(&id);
                }
            }
        }
    }

    fn allocate(&mut self, ty: RecordType) -> StoreKey {
        let sk = self.next;
        self.next = sk.next().expect("store key space exhausted");
        self.types.insert(sk, ty);
        self.by_type.entry(ty).or_default().insert(sk);
        sk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestore_types::RecordTypeDef;

    static CONTACT: RecordTypeDef = RecordTypeDef {
        name: "Contact",
        primary_key: "guid",
    };

    fn ty() -> RecordType {
        RecordType::new(&CONTACT)
    }

    #[test]
    fn same_id_returns_same_key() {
        let mut reg = KeyRegistry::default();
        let id = RecordId::new("c1");
        let a = reg.key_for(ty(), Some(&id));
        let b = reg.key_for(ty(), Some(&id));
        assert_eq!(a, b);
        assert_eq!(reg.id_of(a), Some(&id));
        assert_eq!(reg.type_of(a), Some(ty()));
    }

    #[test]
    fn keys_without_id_are_always_fresh() {
        let mut reg = KeyRegistry::default();
        let a = reg.key_for(ty(), None);
        let b = reg.key_for(ty(), None);
        assert_ne!(a, b);
        assert_eq!(reg.id_of(a), None);
    }

    #[test]
    fn assign_id_completes_the_bijection() {
        let mut reg = KeyRegistry::default();
        let sk = reg.key_for(ty(), None);
        reg.assign_id(sk, RecordId::new("c9")).unwrap();
        assert_eq!(reg.lookup(ty(), &RecordId::new("c9")), Some(sk));
    }

    #[test]
    fn assign_id_rejects_duplicates() {
        let mut reg = KeyRegistry::default();
        let taken = reg.key_for(ty(), Some(&RecordId::new("c1")));
        let sk = reg.key_for(ty(), None);
        assert!(reg.assign_id(sk, RecordId::new("c1")).is_err());
        assert_eq!(reg.lookup(ty(), &RecordId::new("c1")), Some(taken));
    }

    #[test]
    fn assign_id_is_idempotent_for_the_same_key() {
        let mut reg = KeyRegistry::default();
        let sk = reg.key_for(ty(), Some(&RecordId::new("c1")));
        assert!(reg.assign_id(sk, RecordId::new("c1")).is_ok());
    }

    #[test]
    fn reassign_id_rewrites_the_index() {
        let mut reg = KeyRegistry::default();
        let sk = reg.key_for(ty(), Some(&RecordId::new("old")));
        reg.assign_id(sk, RecordId::new("new")).unwrap();
        assert_eq!(reg.lookup(ty(), &RecordId::new("new")), Some(sk));
        assert_eq!(reg.lookup(ty(), &RecordId::new("old")), None);
    }

    #[test]
    fn remove_forgets_the_key_but_never_reuses_it() {
        let mut reg = KeyRegistry::default();
        let a = reg.key_for(ty(), Some(&RecordId::new("c1")));
        reg.remove(a);
        assert_eq!(reg.type_of(a), None);
        assert_eq!(reg.lookup(ty(), &RecordId::new("c1")), None);
        let b = reg.key_for(ty(), Some(&RecordId::new("c1")));
        assert_ne!(a, b);
    }

    #[test]
    fn keys_of_preserves_allocation_order() {
        let mut reg = KeyRegistry::default();
        let a = reg.key_for(ty(), Some(&RecordId::new("1")));
        let b = reg.key_for(ty(), Some(&RecordId::new("2")));
        let c = reg.key_for(ty(), None);
        assert_eq!(reg.keys_of(ty()), vec![a, b, c]);
    }
}
