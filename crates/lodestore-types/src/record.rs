//! Record identity and type descriptors.
//!
//! A *record type* is a static descriptor: a stable class name plus the name
//! of the primary-key attribute. A *record id* is the server-assigned primary
//! key value, canonicalized to a string. Attribute data is a JSON object
//! (`AttributeHash`), the natural value model for a store mirroring a remote
//! API.

use std::fmt;

/// Attribute-name → value mapping for one record.
pub type AttributeHash = serde_json::Map<String, serde_json::Value>;

/// A single attribute value.
pub type AttributeValue = serde_json::Value;

/// Merge `patch` over `base`; patch wins on overlapping keys.
#[must_use]
pub fn merge_hash(base: &AttributeHash, patch: &AttributeHash) -> AttributeHash {
    let mut merged = base.clone();
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Server-assigned primary key of a record, canonicalized to a string.
///
/// Absent for locally-created records until the source acknowledges the
/// create and assigns one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Construct an id from its canonical string form.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Canonicalize a primary-key attribute value into an id.
    ///
    /// Strings are used as-is; integers render in decimal. Other JSON shapes
    /// (objects, arrays, booleans, floats, null) do not identify records and
    /// yield `None`.
    #[must_use]
    pub fn from_value(value: &AttributeValue) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Some(Self(s.clone())),
            serde_json::Value::Number(n) => n.as_i64().map(|i| Self(i.to_string())),
            _ => None,
        }
    }

    /// The canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id as a primary-key attribute value.
    #[must_use]
    pub fn to_value(&self) -> AttributeValue {
        serde_json::Value::String(self.0.clone())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Static descriptor backing a [`RecordType`].
///
/// Hosts declare one `static` per record type and hand out [`RecordType`]
/// handles referring to it.
#[derive(Debug)]
pub struct RecordTypeDef {
    /// Stable class identifier, unique across the application.
    pub name: &'static str,
    /// Name of the attribute holding the primary key.
    pub primary_key: &'static str,
}

/// Cheap `Copy` handle to a record type.
///
/// Identity is the descriptor's `name`: two handles compare equal iff their
/// class names match.
#[derive(Clone, Copy)]
pub struct RecordType(&'static RecordTypeDef);

impl RecordType {
    /// Wrap a static descriptor.
    #[must_use]
    pub const fn new(def: &'static RecordTypeDef) -> Self {
        Self(def)
    }

    /// Stable class identifier.
    #[inline]
    #[must_use]
    pub const fn name(self) -> &'static str {
        self.0.name
    }

    /// Name of the primary-key attribute.
    #[inline]
    #[must_use]
    pub const fn primary_key(self) -> &'static str {
        self.0.primary_key
    }

    /// Extract the record id from an attribute hash, if present and
    /// id-shaped.
    #[must_use]
    pub fn id_of(self, hash: &AttributeHash) -> Option<RecordId> {
        hash.get(self.0.primary_key).and_then(RecordId::from_value)
    }
}

impl fmt::Debug for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RecordType").field(&self.0.name).finish()
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.name)
    }
}

impl PartialEq for RecordType {
    fn eq(&self, other: &Self) -> bool {
        self.0.name == other.0.name
    }
}

impl Eq for RecordType {}

impl std::hash::Hash for RecordType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.name.hash(state);
    }
}
