//! End-to-end facade tests against the persisted `filestorage` backend:
//! data survives closing and reopening the same file (spec.md §4.5),
//! which the in-module unit tests don't exercise through `Storage`.

use std::collections::HashMap;

use polykv::{FieldSpec, FieldValue, KeySpec, Storage, StorageConfig};

fn open_file(path: &std::path::Path) -> Storage {
    let config = StorageConfig::new()
        .set_str("storage_type", "filestorage")
        .set_str("filename", path.to_str().unwrap());
    Storage::open(&config).unwrap()
}

#[test]
fn data_survives_close_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");

    {
        let mut s = open_file(&path);
        let mut tables = HashMap::new();
        tables.insert("widgets".to_string(), KeySpec::new(vec![FieldSpec::Int]));
        s.setup_namespace(tables).unwrap();
        s.put("widgets", &[(vec![FieldValue::Int(7)], b"seven".to_vec())])
            .unwrap();
        s.close().unwrap();
    }

    let mut s = open_file(&path);
    let mut tables = HashMap::new();
    tables.insert("widgets".to_string(), KeySpec::new(vec![FieldSpec::Int]));
    s.setup_namespace(tables).unwrap();
    let rows = s.get("widgets", &[vec![FieldValue::Int(7)]]).unwrap();
    assert_eq!(rows[0].1, Some(b"seven".to_vec()));
}

#[test]
fn reopening_an_empty_zero_length_file_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");
    std::fs::write(&path, []).unwrap();

    let mut s = open_file(&path);
    let mut tables = HashMap::new();
    tables.insert("widgets".to_string(), KeySpec::new(vec![FieldSpec::Int]));
    s.setup_namespace(tables).unwrap();
    let rows = s.get("widgets", &[vec![FieldValue::Int(1)]]).unwrap();
    assert_eq!(rows[0].1, None);
}
