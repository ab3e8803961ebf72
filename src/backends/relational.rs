//! Server-side relational backend (spec.md §4.7, "hard part #1").
//! Grounded directly on
//! `examples/original_source/kvlayer/_postgres.py`: one physical table
//! `kv_<namespace>` with columns `(t text, k bytea, v bytea)` and primary
//! key `(t, k)`, a server-side `upsert_<namespace>` stored procedure that
//! retries update-then-insert until one succeeds, and a chunked
//! `ORDER BY k ASC LIMIT N` scan that re-anchors at the last key returned
//! on each round trip.
//!
//! The facade is synchronous; `tokio-postgres` is async, so this backend
//! owns a single-threaded `tokio::runtime::Runtime` and blocks on it for
//! every call, exactly as the source's blocking psycopg2 driver blocks
//! the calling thread.

use std::collections::{HashMap, VecDeque};

use log::{debug, error, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};

use crate::backend::{Backend, KeyRange, PutItem};
use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::key::{codec, Key, KeySpec};
use crate::registry;

/// Conservative inline-blob ceiling carried forward from the source's
/// `MAX_BLOB_BYTES`.
pub const MAX_VALUE_BYTES: usize = 15_000_000;

static IDENTIFIER_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").unwrap());

pub(crate) fn register() -> StorageResult<()> {
    registry::register("postgres", construct)
}

fn construct(config: &StorageConfig) -> StorageResult<Box<dyn Backend>> {
    let namespace = config.get_str("namespace")?.to_string();
    if !IDENTIFIER_RE.is_match(&namespace) {
        return Err(StorageError::bad_config(format!(
            "namespace '{namespace}' is not a valid SQL identifier"
        )));
    }
    let address = config.primary_address()?.to_string();
    let scan_inner_limit = config.get_u64_or("scan_inner_limit", 1000)?;
    let runtime = tokio::runtime::Runtime::new().map_err(StorageError::from)?;

    Ok(Box::new(RelationalBackend {
        runtime,
        client: None,
        address,
        namespace,
        scan_inner_limit,
        tables: HashMap::new(),
    }))
}

struct RelationalBackend {
    runtime: tokio::runtime::Runtime,
    client: Option<tokio_postgres::Client>,
    address: String,
    namespace: String,
    scan_inner_limit: u64,
    tables: HashMap<String, KeySpec>,
}

impl RelationalBackend {
    fn table_sql_name(&self) -> String {
        format!("kv_{}", self.namespace)
    }

    fn upsert_fn_name(&self) -> String {
        format!("upsert_{}", self.namespace)
    }

    fn spec(&self, table: &str) -> StorageResult<&KeySpec> {
        self.tables
            .get(table)
            .ok_or_else(|| StorageError::UnknownTable(table.to_string()))
    }

    fn connect_if_needed(&mut self) -> StorageResult<()> {
        if self.client.is_some() {
            return Ok(());
        }
        debug!("postgres: connecting to {}", self.address);
        let conn_str = format!("host={} user=postgres dbname=postgres", self.address);
        let (client, connection) = self
            .runtime
            .block_on(tokio_postgres::connect(&conn_str, NoTls))?;
        self.runtime.spawn(async move {
            if let Err(e) = connection.await {
                warn!("postgres: connection task ended with error: {e}");
            }
        });
        self.client = Some(client);
        Ok(())
    }

    /// Any driver error on a data operation detaches the connection
    /// (spec.md §4.7/§5): the client is dropped so the next call
    /// reconnects, and the original error is surfaced.
    fn execute(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> StorageResult<u64> {
        self.connect_if_needed()?;
        let client = self.client.as_ref().expect("just connected");
        match self.runtime.block_on(client.execute(sql, params)) {
            Ok(n) => Ok(n),
            Err(e) => {
                warn!("postgres: detaching connection after error: {e}");
                self.client = None;
                Err(e.into())
            }
        }
    }

    fn query(&mut self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> StorageResult<Vec<Row>> {
        self.connect_if_needed()?;
        let client = self.client.as_ref().expect("just connected");
        match self.runtime.block_on(client.query(sql, params)) {
            Ok(rows) => Ok(rows),
            Err(e) => {
                warn!("postgres: detaching connection after error: {e}");
                self.client = None;
                Err(e.into())
            }
        }
    }

    /// Fetches one chunk of a scan. Returns the raw `(key_bytes,
    /// value_or_skipped)` pairs in `k` order -- `None` for a row whose
    /// value exceeds [`MAX_VALUE_BYTES`], logged and dropped rather than
    /// failing the scan (spec.md's read path preserves the source's
    /// silent-skip behavior; see `SPEC_FULL.md` §6).
    fn fetch_chunk(
        &mut self,
        table: &str,
        start_inclusive: &[u8],
        end_inclusive: Option<&[u8]>,
    ) -> StorageResult<Vec<(Vec<u8>, Option<Vec<u8>>)>> {
        let table_sql = self.table_sql_name();
        let limit = self.scan_inner_limit as i64;
        let rows = match end_inclusive {
            Some(end) => {
                let sql = format!(
                    "SELECT k, v FROM {table_sql} WHERE t = $1 AND k >= $2 AND k <= $3 ORDER BY k ASC LIMIT $4"
                );
                self.query(&sql, &[&table, &start_inclusive, &end, &limit])?
            }
            None => {
                let sql = format!(
                    "SELECT k, v FROM {table_sql} WHERE t = $1 AND k >= $2 ORDER BY k ASC LIMIT $3"
                );
                self.query(&sql, &[&table, &start_inclusive, &limit])?
            }
        };
        Ok(rows
            .into_iter()
            .map(|row| {
                let k: Vec<u8> = row.get(0);
                let v: Vec<u8> = row.get(1);
                if v.len() > MAX_VALUE_BYTES {
                    error!(
                        "postgres: value for a key in table '{table}' exceeds {MAX_VALUE_BYTES} bytes, skipping on read"
                    );
                    (k, None)
                } else {
                    (k, Some(v))
                }
            })
            .collect())
    }
}

impl Backend for RelationalBackend {
    fn setup_namespace(&mut self, tables: &HashMap<String, KeySpec>) -> StorageResult<()> {
        let table_sql = self.table_sql_name();
        let upsert_fn = self.upsert_fn_name();
        self.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {table_sql} (t text NOT NULL, k bytea NOT NULL, v bytea NOT NULL, PRIMARY KEY (t, k))"
            ),
            &[],
        )?;
        self.execute(
            &format!(
                "CREATE OR REPLACE FUNCTION {upsert_fn}(tname TEXT, key BYTEA, data BYTEA) RETURNS VOID AS $$
                 BEGIN
                     LOOP
                         UPDATE {table_sql} SET v = data WHERE t = tname AND k = key;
                         IF found THEN
                             RETURN;
                         END IF;
                         BEGIN
                             INSERT INTO {table_sql}(t, k, v) VALUES (tname, key, data);
                             RETURN;
                         EXCEPTION WHEN unique_violation THEN
                         END;
                     END LOOP;
                 END;
                 $$ LANGUAGE plpgsql"
            ),
            &[],
        )?;
        self.tables.extend(tables.clone());
        Ok(())
    }

    fn delete_namespace(&mut self) -> StorageResult<()> {
        let table_sql = self.table_sql_name();
        let upsert_fn = self.upsert_fn_name();
        self.execute(&format!("DROP FUNCTION IF EXISTS {upsert_fn}(text, bytea, bytea)"), &[])?;
        self.execute(&format!("DROP TABLE IF EXISTS {table_sql}"), &[])?;
        self.tables.clear();
        Ok(())
    }

    fn clear_table(&mut self, table: &str) -> StorageResult<()> {
        self.spec(table)?;
        let table_sql = self.table_sql_name();
        self.execute(&format!("DELETE FROM {table_sql} WHERE t = $1"), &[&table])?;
        Ok(())
    }

    fn put(&mut self, table: &str, items: &[PutItem]) -> StorageResult<()> {
        let spec = self.spec(table)?.clone();
        let upsert_fn = self.upsert_fn_name();
        for (k, v) in items {
            if v.len() > MAX_VALUE_BYTES {
                return Err(StorageError::ValueTooLarge {
                    size: v.len(),
                    limit: MAX_VALUE_BYTES,
                });
            }
            let encoded = codec::encode(k, &spec)?;
            self.query(&format!("SELECT {upsert_fn}($1, $2, $3)"), &[&table, &encoded, v])?;
        }
        Ok(())
    }

    fn get(&mut self, table: &str, keys: &[Key]) -> StorageResult<Vec<Option<Vec<u8>>>> {
        let spec = self.spec(table)?.clone();
        let table_sql = self.table_sql_name();
        let mut out = Vec::with_capacity(keys.len());
        for k in keys {
            let encoded = codec::encode(k, &spec)?;
            let rows = self.query(
                &format!("SELECT v FROM {table_sql} WHERE t = $1 AND k = $2"),
                &[&table, &encoded],
            )?;
            match rows.into_iter().next() {
                None => out.push(None),
                Some(row) => {
                    let v: Vec<u8> = row.get(0);
                    if v.len() > MAX_VALUE_BYTES {
                        error!(
                            "postgres: value for a key in table '{table}' exceeds {MAX_VALUE_BYTES} bytes, skipping on read"
                        );
                        out.push(None);
                    } else {
                        out.push(Some(v));
                    }
                }
            }
        }
        Ok(out)
    }

    fn scan<'a>(
        &'a mut self,
        table: &str,
        ranges: &[KeyRange],
    ) -> StorageResult<Box<dyn Iterator<Item = StorageResult<(Key, Vec<u8>)>> + 'a>> {
        let spec = self.spec(table)?.clone();
        let ranges: Vec<KeyRange> = if ranges.is_empty() {
            vec![(Vec::new(), Vec::new())]
        } else {
            ranges.to_vec()
        };
        Ok(Box::new(ChunkedScanIter {
            backend: self,
            table: table.to_string(),
            spec,
            ranges: ranges.into_iter().collect(),
            state: None,
        }))
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
        let table_sql = self.table_sql_name();
        for k in keys {
            let encoded = codec::encode(k, &spec)?;
            self.execute(
                &format!("DELETE FROM {table_sql} WHERE t = $1 AND k = $2"),
                &[&table, &encoded],
            )?;
        }
        Ok(())
    }

    fn close(&mut self) -> StorageResult<()> {
        self.client = None;
        Ok(())
    }
}

struct RangeState {
    range_end: Option<Vec<u8>>,
    next_start: Vec<u8>,
    first_chunk: bool,
    buffer: VecDeque<(Vec<u8>, Vec<u8>)>,
    exhausted: bool,
}

/// Lazily walks a sequence of ranges, each as a sequence of
/// `scan_inner_limit`-bounded chunks re-anchored at the last key
/// returned, directly mirroring `_postgres.py`'s `_scan_subscan_kminmax`.
struct ChunkedScanIter<'a> {
    backend: &'a mut RelationalBackend,
    table: String,
    spec: KeySpec,
    ranges: VecDeque<KeyRange>,
    state: Option<RangeState>,
}

impl<'a> Iterator for ChunkedScanIter<'a> {
    type Item = StorageResult<(Key, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.state.is_none() {
                let (start, end) = self.ranges.pop_front()?;
                let start_bytes = match codec::range_start(&start, &self.spec) {
                    Ok(b) => b,
                    Err(e) => return Some(Err(e)),
                };
                let end_bytes = match codec::range_end(&end, &self.spec) {
                    Ok(b) => b,
                    Err(e) => return Some(Err(e)),
                };
                self.state = Some(RangeState {
                    range_end: end_bytes,
                    next_start: start_bytes,
                    first_chunk: true,
                    buffer: VecDeque::new(),
                    exhausted: false,
                });
            }
            let state = self.state.as_mut().expect("just set");
            if let Some((k_bytes, v)) = state.buffer.pop_front() {
                return Some(codec::decode(&k_bytes, &self.spec).map(|k| (k, v)));
            }
            if state.exhausted {
                self.state = None;
                continue;
            }
            let chunk = match self.backend.fetch_chunk(
                &self.table,
                &state.next_start,
                state.range_end.as_deref(),
            ) {
                Ok(rows) => rows,
                Err(e) => {
                    self.state = None;
                    return Some(Err(e));
                }
            };
            if (chunk.len() as u64) < self.backend.scan_inner_limit {
                state.exhausted = true;
            }
            if chunk.is_empty() {
                continue;
            }
            let skip_first = !state.first_chunk;
            state.first_chunk = false;
            if let Some((last_key, _)) = chunk.last() {
                state.next_start = last_key.clone();
            }
            let mut entries = chunk.into_iter();
            if skip_first {
                entries.next();
            }
            state
                .buffer
                .extend(entries.filter_map(|(k, v)| v.map(|v| (k, v))));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_namespace_is_bad_config() {
        let cfg = StorageConfig::new()
            .set_str("namespace", "1bad-name")
            .set_str_list("storage_addresses", vec!["localhost".into()]);
        let err = construct(&cfg).unwrap_err();
        assert!(matches!(err, StorageError::BadConfig(_)));
    }

    #[test]
    fn valid_namespace_is_accepted() {
        let cfg = StorageConfig::new()
            .set_str("namespace", "my_ns1")
            .set_str_list("storage_addresses", vec!["localhost".into()]);
        assert!(construct(&cfg).is_ok());
    }
}
