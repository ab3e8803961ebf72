//! The pluggable backend protocol: the trait every storage engine
//! implements, and the constructor signature the registry dispatches to.
//!
//! Grounded on `netabase_store`'s `BackendStore` trait (associated
//! transaction types, `begin_read`/`begin_write`), generalized here to a
//! single synchronous trait since every concrete backend in this crate
//! either is inherently synchronous (sled, a blocking HTTP client) or owns
//! its own `tokio::runtime::Runtime` and blocks on it internally (redis's
//! sync client is used directly; tokio-postgres/bigtable_rs/scylla are
//! driven through a runtime each backend module owns).

use std::collections::HashMap;

use crate::config::StorageConfig;
use crate::error::StorageResult;
use crate::key::{Key, KeySpec};

/// Builds a backend from a configuration map. The returned backend has
/// not yet connected -- construction is pure with respect to `config`;
/// connecting happens lazily on first use (spec.md §4.3).
pub type BackendConstructor = fn(&StorageConfig) -> StorageResult<Box<dyn Backend>>;

/// One key/value pair destined for `put`.
pub type PutItem = (Key, Vec<u8>);

/// A `[start, end]` range over encoded keys. An empty `Key` on either end
/// means "unbounded" in that direction (spec.md §4.2).
pub type KeyRange = (Key, Key);

/// The operational contract every storage engine implements. A
/// `Box<dyn Backend>` is owned exclusively by one [`crate::Storage`]
/// facade instance (spec.md §3's ownership invariant) -- methods take
/// `&mut self` throughout, so the trait needs no internal locking.
pub trait Backend: Send {
    /// Declares or extends the namespace's schema. Idempotent: tables
    /// already known keep their data; only new tables are created.
    fn setup_namespace(&mut self, tables: &HashMap<String, KeySpec>) -> StorageResult<()>;

    /// Removes every table and all data for this namespace. A no-op if
    /// the namespace doesn't exist.
    fn delete_namespace(&mut self) -> StorageResult<()>;

    /// Deletes every row in `table`, keeping the table declared.
    fn clear_table(&mut self, table: &str) -> StorageResult<()>;

    /// Upserts `items` into `table`. Within one call, the last value
    /// written for a given key wins.
    fn put(&mut self, table: &str, items: &[PutItem]) -> StorageResult<()>;

    /// Looks up `keys` in `table`, returning one entry per requested key
    /// in request order; an absent key maps to `None`.
    fn get(&mut self, table: &str, keys: &[Key]) -> StorageResult<Vec<Option<Vec<u8>>>>;

    /// Streams `(key, value)` pairs over `ranges`, ascending within each
    /// range, ranges visited in argument order. An empty `ranges` scans
    /// the whole table.
    fn scan<'a>(
        &'a mut self,
        table: &str,
        ranges: &[KeyRange],
    ) -> StorageResult<Box<dyn Iterator<Item = StorageResult<(Key, Vec<u8>)>> + 'a>>;

    /// Like [`Backend::scan`] but yields only keys.
    fn scan_keys<'a>(
        &'a mut self,
        table: &str,
        ranges: &[KeyRange],
    ) -> StorageResult<Box<dyn Iterator<Item = StorageResult<Key>> + 'a>>;

    /// Deletes `keys` from `table`. Absent keys succeed silently.
    fn delete(&mut self, table: &str, keys: &[Key]) -> StorageResult<()>;

    /// Releases connection resources. Called at most once; the facade
    /// enforces the closed-client error for anything after.
    fn close(&mut self) -> StorageResult<()>;
}
