//! The public facade contract (spec.md §4.2).
//!
//! Grounded on `netabase_store`'s prelude re-export shape and `kvx`'s
//! `KeyValueStore`, which wraps a `Box<dyn PubKeyValueStoreBackend>` and
//! dispatches every call straight through to it -- `Storage` does the
//! same, adding only the closed-client check and the table-declaration
//! bookkeeping spec.md §4.2 assigns to the facade rather than the
//! backend.

use std::collections::HashMap;

use crate::backend::{Backend, KeyRange, PutItem};
use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::key::{self, Key, KeySpec};
use crate::registry;

/// A storage client. Owns its backend exclusively (spec.md §3); not
/// `Clone` -- share it behind whatever synchronization the caller needs.
pub struct Storage {
    backend: Box<dyn Backend>,
    tables: HashMap<String, KeySpec>,
    closed: bool,
}

impl Storage {
    /// Resolves `storage_type` in `config` via the registry and builds a
    /// client. The backend has not connected yet; the first operation
    /// triggers a lazy connect.
    pub fn open(config: &StorageConfig) -> StorageResult<Self> {
        let storage_type = config.get_str("storage_type")?;
        let backend = registry::construct(storage_type, config)?;
        Ok(Storage {
            backend,
            tables: HashMap::new(),
            closed: false,
        })
    }

    /// Builds a client directly from an already-resolved backend, for
    /// callers that construct a backend without going through the
    /// registry (tests, mainly).
    pub fn from_backend(backend: Box<dyn Backend>) -> Self {
        Storage {
            backend,
            tables: HashMap::new(),
            closed: false,
        }
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed {
            Err(StorageError::ClosedClient)
        } else {
            Ok(())
        }
    }

    fn spec_of(&self, table: &str) -> StorageResult<&KeySpec> {
        self.tables
            .get(table)
            .ok_or_else(|| StorageError::UnknownTable(table.to_string()))
    }

    /// Declares or extends the namespace's schema. `tables` maps name to
    /// key spec; existing tables keep their data.
    pub fn setup_namespace(&mut self, tables: HashMap<String, KeySpec>) -> StorageResult<()> {
        self.ensure_open()?;
        self.backend.setup_namespace(&tables)?;
        self.tables.extend(tables);
        Ok(())
    }

    /// Removes every table and all data for this namespace. A no-op if
    /// the namespace doesn't exist.
    pub fn delete_namespace(&mut self) -> StorageResult<()> {
        self.ensure_open()?;
        self.backend.delete_namespace()?;
        self.tables.clear();
        Ok(())
    }

    /// Deletes every row in `table`, preserving the table.
    pub fn clear_table(&mut self, table: &str) -> StorageResult<()> {
        self.ensure_open()?;
        self.spec_of(table)?;
        self.backend.clear_table(table)
    }

    /// Upserts `items` into `table`. The final stored value for a key is
    /// the last one written for it in `items`' order.
    pub fn put(&mut self, table: &str, items: &[PutItem]) -> StorageResult<()> {
        self.ensure_open()?;
        let spec = self.spec_of(table)?;
        for (k, _) in items {
            if !key::validate(k, spec) {
                return Err(StorageError::bad_key(format!(
                    "key does not match the spec declared for table '{table}'"
                )));
            }
        }
        self.backend.put(table, items)
    }

    /// Looks up `keys` in `table`, returning one entry per requested key
    /// in request order; an absent key maps to `None`. Never fails on a
    /// missing key.
    pub fn get(&mut self, table: &str, keys: &[Key]) -> StorageResult<Vec<(Key, Option<Vec<u8>>)>> {
        self.ensure_open()?;
        let spec = self.spec_of(table)?;
        for k in keys {
            if !key::validate(k, spec) {
                return Err(StorageError::bad_key(format!(
                    "key does not match the spec declared for table '{table}'"
                )));
            }
        }
        let values = self.backend.get(table, keys)?;
        Ok(keys.iter().cloned().zip(values).collect())
    }

    /// Streams `(key, value)` pairs with `start <= key <= end` per range,
    /// ascending within each range, ranges visited in argument order. An
    /// empty `ranges` scans the whole table. Empty `start`/`end` within a
    /// range mean "minus/plus infinity".
    pub fn scan<'a>(
        &'a mut self,
        table: &str,
        ranges: &[KeyRange],
    ) -> StorageResult<Box<dyn Iterator<Item = StorageResult<(Key, Vec<u8>)>> + 'a>> {
        self.ensure_open()?;
        let spec = self.spec_of(table)?;
        validate_ranges(ranges, spec)?;
        self.backend.scan(table, ranges)
    }

    /// Like [`Storage::scan`] but yields only keys.
    pub fn scan_keys<'a>(
        &'a mut self,
        table: &str,
        ranges: &[KeyRange],
    ) -> StorageResult<Box<dyn Iterator<Item = StorageResult<Key>> + 'a>> {
        self.ensure_open()?;
        let spec = self.spec_of(table)?;
        validate_ranges(ranges, spec)?;
        self.backend.scan_keys(table, ranges)
    }

    /// Deletes `keys` from `table`. Absent keys succeed silently.
    pub fn delete(&mut self, table: &str, keys: &[Key]) -> StorageResult<()> {
        self.ensure_open()?;
        let spec = self.spec_of(table)?;
        for k in keys {
            if !key::validate(k, spec) {
                return Err(StorageError::bad_key(format!(
                    "key does not match the spec declared for table '{table}'"
                )));
            }
        }
        self.backend.delete(table, keys)
    }

    /// Releases all resources. Subsequent operations fail with
    /// [`StorageError::ClosedClient`].
    pub fn close(&mut self) -> StorageResult<()> {
        self.ensure_open()?;
        self.backend.close()?;
        self.closed = true;
        Ok(())
    }
}

fn validate_ranges(ranges: &[KeyRange], spec: &KeySpec) -> StorageResult<()> {
    for (start, end) in ranges {
        if !key::validate_prefix(start, spec) || !key::validate_prefix(end, spec) {
            return Err(StorageError::bad_key(
                "range endpoint does not match the table's key spec",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::FieldSpec;

    struct NullBackend;

    impl Backend for NullBackend {
        fn setup_namespace(&mut self, _tables: &HashMap<String, KeySpec>) -> StorageResult<()> {
            Ok(())
        }
        fn delete_namespace(&mut self) -> StorageResult<()> {
            Ok(())
        }
        fn clear_table(&mut self, _table: &str) -> StorageResult<()> {
            Ok(())
        }
        fn put(&mut self, _table: &str, _items: &[PutItem]) -> StorageResult<()> {
            Ok(())
        }
        fn get(&mut self, _table: &str, keys: &[Key]) -> StorageResult<Vec<Option<Vec<u8>>>> {
            Ok(vec![None; keys.len()])
        }
        fn scan<'a>(
            &'a mut self,
            _table: &str,
            _ranges: &[KeyRange],
        ) -> StorageResult<Box<dyn Iterator<Item = StorageResult<(Key, Vec<u8>)>> + 'a>> {
            Ok(Box::new(std::iter::empty()))
        }
        fn scan_keys<'a>(
            &'a mut self,
            _table: &str,
            _ranges: &[KeyRange],
        ) -> StorageResult<Box<dyn Iterator<Item = StorageResult<Key>> + 'a>> {
            Ok(Box::new(std::iter::empty()))
        }
        fn delete(&mut self, _table: &str, _keys: &[Key]) -> StorageResult<()> {
            Ok(())
        }
        fn close(&mut self) -> StorageResult<()> {
            Ok(())
        }
    }

    fn storage_with_one_table() -> Storage {
        let mut s = Storage::from_backend(Box::new(NullBackend));
        let mut tables = HashMap::new();
        tables.insert("t".to_string(), KeySpec::new(vec![FieldSpec::Int]));
        s.setup_namespace(tables).unwrap();
        s
    }

    #[test]
    fn unknown_table_is_rejected() {
        let mut s = storage_with_one_table();
        let err = s.clear_table("nope").unwrap_err();
        assert!(matches!(err, StorageError::UnknownTable(_)));
    }

    #[test]
    fn operations_after_close_fail() {
        let mut s = storage_with_one_table();
        s.close().unwrap();
        let err = s.clear_table("t").unwrap_err();
        assert!(matches!(err, StorageError::ClosedClient));
    }

    #[test]
    fn double_close_is_closed_client_not_panic() {
        let mut s = storage_with_one_table();
        s.close().unwrap();
        assert!(matches!(s.close().unwrap_err(), StorageError::ClosedClient));
    }

    #[test]
    fn put_rejects_key_with_wrong_arity() {
        use crate::key::FieldValue;
        let mut s = storage_with_one_table();
        let err = s
            .put("t", &[(vec![FieldValue::Int(1), FieldValue::Int(2)], vec![1])])
            .unwrap_err();
        assert!(matches!(err, StorageError::BadKey(_)));
    }
}
