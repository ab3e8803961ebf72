//! In-memory backend (spec.md §4.4): an ordered map scoped to this
//! process, backed by `sled`'s temporary-database mode. Grounded on
//! `netabase_store::databases::sled_store`'s
//! `sled::Config::new().temporary(true)` usage. Not thread-safe by
//! contract -- intended for tests and reference semantics, matching
//! spec.md's "reference semantics for tests".

use crate::backend::Backend;
use crate::config::StorageConfig;
use crate::error::StorageResult;
use crate::registry;

use super::sled_common::SledBackend;

pub(crate) fn register() -> StorageResult<()> {
    registry::register("local", construct)
}

fn construct(_config: &StorageConfig) -> StorageResult<Box<dyn Backend>> {
    let db = sled::Config::new().temporary(true).open()?;
    Ok(Box::new(SledBackend::from_db(db)))
}
