//! End-to-end facade tests against the in-memory `local` backend
//! (spec.md §8's scenarios that don't require a live external service:
//! namespace setup idempotence, range scans, delete, and close).

use std::collections::HashMap;

use polykv::{FieldSpec, FieldValue, KeySpec, Storage, StorageConfig, StorageError};

fn open_local(namespace: &str) -> Storage {
    let config = StorageConfig::new()
        .set_str("storage_type", "local")
        .set_str("app_name", "polykv-tests")
        .set_str("namespace", namespace);
    Storage::open(&config).unwrap()
}

fn int_key(n: i64) -> Vec<FieldValue> {
    vec![FieldValue::Int(n)]
}

#[test]
fn setup_namespace_is_idempotent_and_preserves_data() {
    let mut s = open_local("setup_idempotent");
    let mut tables = HashMap::new();
    tables.insert("widgets".to_string(), KeySpec::new(vec![FieldSpec::Int]));
    s.setup_namespace(tables.clone()).unwrap();

    s.put("widgets", &[(int_key(1), b"one".to_vec())]).unwrap();

    // Re-declaring the same table must not drop existing rows.
    s.setup_namespace(tables).unwrap();
    let rows = s.get("widgets", &[int_key(1)]).unwrap();
    assert_eq!(rows[0].1, Some(b"one".to_vec()));
}

#[test]
fn put_then_get_round_trips_latest_value() {
    let mut s = open_local("put_get");
    let mut tables = HashMap::new();
    tables.insert("widgets".to_string(), KeySpec::new(vec![FieldSpec::Int]));
    s.setup_namespace(tables).unwrap();

    s.put(
        "widgets",
        &[(int_key(1), b"first".to_vec()), (int_key(1), b"second".to_vec())],
    )
    .unwrap();
    let rows = s.get("widgets", &[int_key(1)]).unwrap();
    assert_eq!(rows[0].1, Some(b"second".to_vec()));
}

#[test]
fn get_of_absent_key_is_none_not_error() {
    let mut s = open_local("get_absent");
    let mut tables = HashMap::new();
    tables.insert("widgets".to_string(), KeySpec::new(vec![FieldSpec::Int]));
    s.setup_namespace(tables).unwrap();

    let rows = s.get("widgets", &[int_key(42)]).unwrap();
    assert_eq!(rows[0].1, None);
}

#[test]
fn scan_returns_rows_in_ascending_key_order() {
    let mut s = open_local("scan_order");
    let mut tables = HashMap::new();
    tables.insert("widgets".to_string(), KeySpec::new(vec![FieldSpec::Int]));
    s.setup_namespace(tables).unwrap();

    for n in [5, -3, 0, 100, 1] {
        s.put("widgets", &[(int_key(n), n.to_string().into_bytes())]).unwrap();
    }

    let rows: Vec<i64> = s
        .scan("widgets", &[])
        .unwrap()
        .map(|r| match &r.unwrap().0[0] {
            FieldValue::Int(n) => *n,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(rows, vec![-3, 0, 1, 5, 100]);
}

#[test]
fn scan_with_bounded_range_excludes_rows_outside_it() {
    let mut s = open_local("scan_bounded");
    let mut tables = HashMap::new();
    tables.insert("widgets".to_string(), KeySpec::new(vec![FieldSpec::Int]));
    s.setup_namespace(tables).unwrap();

    for n in 0..10 {
        s.put("widgets", &[(int_key(n), vec![n as u8])]).unwrap();
    }

    let rows: Vec<i64> = s
        .scan("widgets", &[(int_key(3), int_key(6))])
        .unwrap()
        .map(|r| match &r.unwrap().0[0] {
            FieldValue::Int(n) => *n,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(rows, vec![3, 4, 5, 6]);
}

#[test]
fn scan_with_open_upper_bound_reaches_the_end() {
    let mut s = open_local("scan_open_upper");
    let mut tables = HashMap::new();
    tables.insert("widgets".to_string(), KeySpec::new(vec![FieldSpec::Int]));
    s.setup_namespace(tables).unwrap();

    for n in 0..5 {
        s.put("widgets", &[(int_key(n), vec![n as u8])]).unwrap();
    }

    let rows: Vec<i64> = s
        .scan("widgets", &[(int_key(3), Vec::new())])
        .unwrap()
        .map(|r| match &r.unwrap().0[0] {
            FieldValue::Int(n) => *n,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(rows, vec![3, 4]);
}

#[test]
fn delete_is_idempotent_on_absent_keys() {
    let mut s = open_local("delete_idempotent");
    let mut tables = HashMap::new();
    tables.insert("widgets".to_string(), KeySpec::new(vec![FieldSpec::Int]));
    s.setup_namespace(tables).unwrap();

    s.put("widgets", &[(int_key(1), b"v".to_vec())]).unwrap();
    s.delete("widgets", &[int_key(1)]).unwrap();
    s.delete("widgets", &[int_key(1)]).unwrap(); // already gone, must not error

    let rows = s.get("widgets", &[int_key(1)]).unwrap();
    assert_eq!(rows[0].1, None);
}

#[test]
fn clear_table_empties_rows_but_keeps_it_queryable() {
    let mut s = open_local("clear_table");
    let mut tables = HashMap::new();
    tables.insert("widgets".to_string(), KeySpec::new(vec![FieldSpec::Int]));
    s.setup_namespace(tables).unwrap();

    s.put("widgets", &[(int_key(1), b"v".to_vec())]).unwrap();
    s.clear_table("widgets").unwrap();

    let rows = s.get("widgets", &[int_key(1)]).unwrap();
    assert_eq!(rows[0].1, None);
    // Still a known table -- clear_table doesn't drop it.
    assert!(s.scan("widgets", &[]).is_ok());
}

#[test]
fn delete_namespace_forgets_tables() {
    let mut s = open_local("delete_namespace");
    let mut tables = HashMap::new();
    tables.insert("widgets".to_string(), KeySpec::new(vec![FieldSpec::Int]));
    s.setup_namespace(tables).unwrap();
    s.delete_namespace().unwrap();

    let err = s.get("widgets", &[int_key(1)]).unwrap_err();
    assert!(matches!(err, StorageError::UnknownTable(_)));
}

#[test]
fn close_rejects_further_operations() {
    let mut s = open_local("close_rejects");
    let mut tables = HashMap::new();
    tables.insert("widgets".to_string(), KeySpec::new(vec![FieldSpec::Int]));
    s.setup_namespace(tables).unwrap();
    s.close().unwrap();

    let err = s.put("widgets", &[(int_key(1), b"v".to_vec())]).unwrap_err();
    assert!(matches!(err, StorageError::ClosedClient));
}

#[test]
fn composite_key_scan_orders_by_field_then_by_value() {
    let mut s = open_local("composite_scan");
    let mut tables = HashMap::new();
    tables.insert(
        "events".to_string(),
        KeySpec::new(vec![FieldSpec::Str, FieldSpec::Int]),
    );
    s.setup_namespace(tables).unwrap();

    let entries = [("b", 1), ("a", 2), ("a", 1), ("b", 0)];
    for (tag, n) in entries {
        let key = vec![FieldValue::Str(tag.to_string()), FieldValue::Int(n)];
        s.put("events", &[(key, vec![])]).unwrap();
    }

    let ordered: Vec<(String, i64)> = s
        .scan("events", &[])
        .unwrap()
        .map(|r| {
            let (key, _) = r.unwrap();
            let tag = match &key[0] {
                FieldValue::Str(s) => s.clone(),
                _ => unreachable!(),
            };
            let n = match &key[1] {
                FieldValue::Int(n) => *n,
                _ => unreachable!(),
            };
            (tag, n)
        })
        .collect();
    assert_eq!(
        ordered,
        vec![
            ("a".to_string(), 1),
            ("a".to_string(), 2),
            ("b".to_string(), 0),
            ("b".to_string(), 1),
        ]
    );
}
