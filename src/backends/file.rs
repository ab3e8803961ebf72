//! Persisted single-file backend (spec.md §4.5). Same ordered-map
//! semantics as [`super::local`], but `sled::open(path)` instead of a
//! temporary database, plus the original's copy-on-open and
//! zero-length-file handling (`examples/original_source/src/kvlayer/_file_storage.py`).
//!
//! `copy_to_filename`, when set, names the *working* path: `filename` is
//! copied to it, and the copy -- not `filename` -- is the one opened.
//! This lets a caller open an ephemeral, disposable copy of a reference
//! file without touching the original, matching the original's
//! `filename` -> `copy_to_filename` direction exactly.
//!
//! Atomic durability across crashes is **not** promised -- sled flushes
//! on `close`, but a crash between writes and the next flush can lose the
//! unflushed tail. This mirrors the documented limitation in spec.md §4.5.

use std::fs;
use std::path::PathBuf;

use log::debug;

use crate::backend::Backend;
use crate::config::StorageConfig;
use crate::error::StorageResult;
use crate::registry;

use super::sled_common::SledBackend;

pub(crate) fn register() -> StorageResult<()> {
    registry::register("filestorage", construct)
}

fn construct(config: &StorageConfig) -> StorageResult<Box<dyn Backend>> {
    let filename = config.get_str("filename")?;
    let mut working_path = PathBuf::from(filename);

    if let Some(copy_to_filename) = config.get_str_opt("copy_to_filename")? {
        debug!("filestorage: copying '{filename}' to '{copy_to_filename}' before opening");
        fs::copy(filename, copy_to_filename)?;
        working_path = PathBuf::from(copy_to_filename);
    }

    if let Ok(metadata) = fs::metadata(&working_path) {
        if metadata.len() == 0 {
            let working = working_path.display();
            debug!("filestorage: removing zero-length file '{working}', treating as never written");
            fs::remove_file(&working_path)?;
        }
    }

    let db = sled::open(&working_path)?;
    Ok(Box::new(SledBackend::from_db(db)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_length_file_is_treated_as_never_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        fs::write(&path, []).unwrap();

        let cfg = StorageConfig::new().set_str("filename", path.to_str().unwrap());
        let backend = construct(&cfg);
        assert!(backend.is_ok());
    }

    #[test]
    fn copy_to_filename_seeds_the_working_file() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("source.db");
        let working_path = dir.path().join("working.db");

        {
            let cfg = StorageConfig::new().set_str("filename", source_path.to_str().unwrap());
            let mut backend = construct(&cfg).unwrap();
            let mut tables = std::collections::HashMap::new();
            tables.insert(
                "t".to_string(),
                crate::key::KeySpec::new(vec![crate::key::FieldSpec::Int]),
            );
            backend.setup_namespace(&tables).unwrap();
            backend
                .put(
                    "t",
                    &[(vec![crate::key::FieldValue::Int(1)], b"v".to_vec())],
                )
                .unwrap();
            backend.close().unwrap();
        }

        let cfg = StorageConfig::new()
            .set_str("filename", source_path.to_str().unwrap())
            .set_str("copy_to_filename", working_path.to_str().unwrap());
        let mut backend = construct(&cfg).unwrap();
        let mut tables = std::collections::HashMap::new();
        tables.insert(
            "t".to_string(),
            crate::key::KeySpec::new(vec![crate::key::FieldSpec::Int]),
        );
        backend.setup_namespace(&tables).unwrap();
        let got = backend
            .get("t", &[vec![crate::key::FieldValue::Int(1)]])
            .unwrap();
        assert_eq!(got, vec![Some(b"v".to_vec())]);
    }
}
