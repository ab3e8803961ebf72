//! Shared ordered-map-over-sled implementation behind [`crate::backends::local`]
//! and [`crate::backends::file`]. Grounded on
//! `netabase_store::databases::sled_store`: one `sled::Tree` per virtual
//! table, values stored as the caller's raw bytes (the facade never
//! interprets a value's contents, so there is nothing to serialize here),
//! `log::debug!` on every mutating call.

use std::collections::HashMap;

use log::debug;

use crate::backend::{Backend, KeyRange, PutItem};
use crate::error::StorageResult;
use crate::key::{self, codec, Key, KeySpec};

pub struct SledBackend {
    db: sled::Db,
    tables: HashMap<String, KeySpec>,
}

impl SledBackend {
    pub fn from_db(db: sled::Db) -> Self {
        SledBackend {
            db,
            tables: HashMap::new(),
        }
    }

    fn tree(&self, table: &str) -> StorageResult<sled::Tree> {
        Ok(self.db.open_tree(table)?)
    }

    fn spec(&self, table: &str) -> StorageResult<&KeySpec> {
        self.tables
            .get(table)
            .ok_or_else(|| crate::error::StorageError::UnknownTable(table.to_string()))
    }
}

impl Backend for SledBackend {
    fn setup_namespace(&mut self, tables: &HashMap<String, KeySpec>) -> StorageResult<()> {
        for (name, spec) in tables {
            debug!("sled: declaring table '{name}'");
            self.db.open_tree(name)?;
            self.tables.entry(name.clone()).or_insert_with(|| spec.clone());
        }
        Ok(())
    }

    fn delete_namespace(&mut self) -> StorageResult<()> {
        for name in self.tables.keys() {
            debug!("sled: dropping table '{name}'");
            self.db.drop_tree(name)?;
        }
        self.tables.clear();
        Ok(())
    }

    fn clear_table(&mut self, table: &str) -> StorageResult<()> {
        self.spec(table)?;
        self.tree(table)?.clear()?;
        Ok(())
    }

    fn put(&mut self, table: &str, items: &[PutItem]) -> StorageResult<()> {
        let spec = self.spec(table)?.clone();
        let tree = self.tree(table)?;
        for (k, v) in items {
            let encoded = codec::encode(k, &spec)?;
            tree.insert(encoded, v.as_slice())?;
        }
        Ok(())
    }

    fn get(&mut self, table: &str, keys: &[Key]) -> StorageResult<Vec<Option<Vec<u8>>>> {
        let spec = self.spec(table)?.clone();
        let tree = self.tree(table)?;
        let mut out = Vec::with_capacity(keys.len());
        for k in keys {
            let encoded = codec::encode(k, &spec)?;
            out.push(tree.get(encoded)?.map(|v| v.to_vec()));
        }
        Ok(out)
    }

    fn scan<'a>(
        &'a mut self,
        table: &str,
        ranges: &[KeyRange],
    ) -> StorageResult<Box<dyn Iterator<Item = StorageResult<(Key, Vec<u8>)>> + 'a>> {
        let spec = self.spec(table)?.clone();
        let tree = self.tree(table)?;
        let owned_ranges: Vec<KeyRange> = if ranges.is_empty() {
            vec![(Vec::new(), Vec::new())]
        } else {
            ranges.to_vec()
        };
        let iter = owned_ranges.into_iter().flat_map(move |(start, end)| {
            sled_range_iter(&tree, &spec, &start, &end)
        });
        Ok(Box::new(iter))
    }

    fn scan_keys<'a>(
        &'a mut self,
        table: &str,
        ranges: &[KeyRange],
    ) -> StorageResult<Box<dyn Iterator<Item = StorageResult<Key>> + 'a>> {
        let inner = Backend::scan(self, table, ranges)?;
        Ok(Box::new(inner.map(|r| r.map(|(k, _)| k))))
    }

    fn delete(&mut self, table: &str, keys: &[Key]) -> StorageResult<()> {
        let spec = self.spec(table)?.clone();
        let tree = self.tree(table)?;
        for k in keys {
            let encoded = codec::encode(k, &spec)?;
            tree.remove(encoded)?;
        }
        Ok(())
    }

    fn close(&mut self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Builds the lazy iterator for one `(start, end)` range against `tree`,
/// decoding each entry back into a [`Key`] as it's pulled.
fn sled_range_iter(
    tree: &sled::Tree,
    spec: &KeySpec,
    start: &[crate::key::FieldValue],
    end: &[crate::key::FieldValue],
) -> Box<dyn Iterator<Item = StorageResult<(Key, Vec<u8>)>>> {
    let start_bytes = match codec::range_start(start, spec) {
        Ok(b) => b,
        Err(e) => return Box::new(std::iter::once(Err(e))),
    };
    let end_bytes = match codec::range_end(end, spec) {
        Ok(b) => b,
        Err(e) => return Box::new(std::iter::once(Err(e))),
    };
    let spec = spec.clone();
    let raw: Box<dyn Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>> = match end_bytes {
        Some(end_bytes) => Box::new(tree.range(start_bytes..=end_bytes)),
        None => Box::new(tree.range(start_bytes..)),
    };
    Box::new(raw.map(move |item| {
        let (k, v) = item?;
        let key = key::codec::decode(&k, &spec)?;
        Ok((key, v.to_vec()))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::FieldSpec;
    use crate::key::FieldValue;

    fn backend() -> SledBackend {
        SledBackend::from_db(sled::Config::new().temporary(true).open().unwrap())
    }

    fn declare(b: &mut SledBackend, name: &str, spec: KeySpec) {
        let mut tables = HashMap::new();
        tables.insert(name.to_string(), spec);
        b.setup_namespace(&tables).unwrap();
    }

    #[test]
    fn put_then_get_returns_latest_value() {
        let mut b = backend();
        declare(&mut b, "t", KeySpec::new(vec![FieldSpec::Int]));
        let k = vec![FieldValue::Int(1)];
        b.put("t", &[(k.clone(), b"v1".to_vec())]).unwrap();
        b.put("t", &[(k.clone(), b"v2".to_vec())]).unwrap();
        let got = b.get("t", &[k]).unwrap();
        assert_eq!(got, vec![Some(b"v2".to_vec())]);
    }

    #[test]
    fn scan_with_no_ranges_covers_whole_table() {
        let mut b = backend();
        declare(&mut b, "t", KeySpec::new(vec![FieldSpec::Int]));
        for n in 0..5 {
            b.put("t", &[(vec![FieldValue::Int(n)], vec![n as u8])]).unwrap();
        }
        let rows: Vec<_> = Backend::scan(&mut b, "t", &[]).unwrap().collect::<StorageResult<_>>().unwrap();
        assert_eq!(rows.len(), 5);
    }

    #[test]
    fn clear_table_empties_it_without_touching_others() {
        let mut b = backend();
        declare(&mut b, "a", KeySpec::new(vec![FieldSpec::Int]));
        declare(&mut b, "b", KeySpec::new(vec![FieldSpec::Int]));
        b.put("a", &[(vec![FieldValue::Int(1)], vec![1])]).unwrap();
        b.put("b", &[(vec![FieldValue::Int(1)], vec![1])]).unwrap();
        b.clear_table("a").unwrap();
        let a_rows: Vec<_> = Backend::scan(&mut b, "a", &[]).unwrap().collect::<StorageResult<_>>().unwrap();
        let b_rows: Vec<_> = Backend::scan(&mut b, "b", &[]).unwrap().collect::<StorageResult<_>>().unwrap();
        assert!(a_rows.is_empty());
        assert_eq!(b_rows.len(), 1);
    }

    #[test]
    fn delete_is_idempotent() {
        let mut b = backend();
        declare(&mut b, "t", KeySpec::new(vec![FieldSpec::Int]));
        let k = vec![FieldValue::Int(1)];
        b.delete("t", &[k.clone()]).unwrap();
        b.delete("t", &[k]).unwrap();
    }
}
