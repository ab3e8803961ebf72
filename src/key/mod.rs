//! Composite key types and the key spec every virtual table is declared
//! with.
//!
//! A [`KeySpec`] is an ordered sequence of [`FieldSpec`] descriptors; every
//! [`Key`] written to or queried from a table must match the spec in arity
//! and per-field type. See [`codec`] for the byte encoding that makes
//! ordered range scans portable across backends.

pub mod codec;

use serde::{Deserialize, Serialize};

/// One field's type within a key spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldSpec {
    /// Fixed-width 16-byte identifier (e.g. a UUID).
    Id,
    /// Signed 64-bit integer.
    Int,
    /// Variable-length UTF-8 string.
    Str,
}

/// The ordered sequence of field descriptors legal for one virtual table's
/// keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpec(pub Vec<FieldSpec>);

impl KeySpec {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        KeySpec(fields)
    }

    pub fn arity(&self) -> usize {
        self.0.len()
    }

    /// `true` if every field in this spec is a 16-byte identifier.
    ///
    /// [`crate::backends::column_store::ColumnStoreBackend`] requires this
    /// (spec.md §4.9's documented limitation).
    pub fn is_all_ids(&self) -> bool {
        self.0.iter().all(|f| matches!(f, FieldSpec::Id))
    }
}

/// One field's value within a [`Key`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum FieldValue {
    Id([u8; 16]),
    Int(i64),
    Str(String),
}

impl FieldValue {
    fn spec(&self) -> FieldSpec {
        match self {
            FieldValue::Id(_) => FieldSpec::Id,
            FieldValue::Int(_) => FieldSpec::Int,
            FieldValue::Str(_) => FieldSpec::Str,
        }
    }
}

/// An ordered tuple of field values conforming to a table's key spec.
pub type Key = Vec<FieldValue>;

/// Checks a stored key's arity and per-field types against a spec. Used
/// by `put`/`get`/`delete`, where keys must be fully specified.
pub fn validate(key: &[FieldValue], spec: &KeySpec) -> bool {
    key.len() == spec.0.len()
        && key
            .iter()
            .zip(spec.0.iter())
            .all(|(v, s)| v.spec() == *s)
}

/// Checks a range endpoint's arity and per-field types against a spec.
/// Unlike [`validate`], a shorter tuple is legal -- scans address a
/// prefix of the key spec (e.g. every row under a given first field).
pub fn validate_prefix(key: &[FieldValue], spec: &KeySpec) -> bool {
    key.len() <= spec.0.len()
        && key
            .iter()
            .zip(spec.0.iter())
            .all(|(v, s)| v.spec() == *s)
}
