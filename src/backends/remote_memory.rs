//! Single-connection client to an external in-memory KV server (spec.md
//! §4.6), modeled on Redis. Grounded on the `redis` crate's synchronous
//! `Client`/`Connection` (the connector crate in the pack depends on
//! `redis` with the async features; this backend uses the plain sync
//! client since the facade contract is itself synchronous).
//!
//! All virtual tables of one namespace share a single sorted set (the
//! "flat keyspace" spec.md §4.6 describes): each entry's *member* is
//! `table_name ++ 0x00 ++ encoded_key`, scored `0` so lexicographic order
//! (`ZRANGEBYLEX`) does the range-scan work natively -- Redis has no
//! native ordered scan over an arbitrary unordered keyspace, so the
//! sorted set is the idiomatic way to get one. Values live in ordinary
//! string keys addressed by the same member bytes, since sorted set
//! members can't carry a payload.
//!
//! Only the first of `storage_addresses` is used; this is a documented
//! limitation carried forward from the source (spec.md §4.6).

use std::collections::{HashMap, VecDeque};

use log::{debug, warn};
use redis::Commands;

use crate::backend::{Backend, KeyRange, PutItem};
use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::key::{codec, Key, KeySpec};
use crate::registry;

pub(crate) fn register() -> StorageResult<()> {
    registry::register("redis", construct)
}

fn construct(config: &StorageConfig) -> StorageResult<Box<dyn Backend>> {
    let address = config.primary_address()?.to_string();
    let db_num = config.get_u64_or("redis_db_num", 0)?;
    let scan_chunk_members = config.get_u64_or("scan_inner_limit", 1000)?;
    let client = redis::Client::open(format!("redis://{address}/{db_num}"))?;
    Ok(Box::new(RemoteMemoryBackend {
        client,
        conn: None,
        scan_chunk_members,
        tables: HashMap::new(),
    }))
}

struct RemoteMemoryBackend {
    client: redis::Client,
    conn: Option<redis::Connection>,
    scan_chunk_members: u64,
    tables: HashMap<String, KeySpec>,
}

const INDEX_KEY: &str = "polykv:index";

impl RemoteMemoryBackend {
    fn spec(&self, table: &str) -> StorageResult<&KeySpec> {
        self.tables
            .get(table)
            .ok_or_else(|| StorageError::UnknownTable(table.to_string()))
    }

    /// Connects lazily, then hands back the live connection. On any
    /// driver error the connection is detached (spec.md §5) so the next
    /// call reconnects from scratch.
    fn with_conn<T>(
        &mut self,
        f: impl FnOnce(&mut redis::Connection) -> redis::RedisResult<T>,
    ) -> StorageResult<T> {
        if self.conn.is_none() {
            debug!("redis: connecting");
            self.conn = Some(self.client.get_connection()?);
        }
        let conn = self.conn.as_mut().expect("just connected");
        match f(conn) {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!("redis: detaching connection after error: {e}");
                self.conn = None;
                Err(e.into())
            }
        }
    }

    fn member(table: &str, encoded_key: &[u8]) -> Vec<u8> {
        let mut m = Vec::with_capacity(table.len() + 1 + encoded_key.len());
        m.extend_from_slice(table.as_bytes());
        m.push(0);
        m.extend_from_slice(encoded_key);
        m
    }

    fn lex_bounds(table: &str, start: &[u8], end_inclusive: Option<&[u8]>) -> (Vec<u8>, Vec<u8>) {
        let mut min = vec![b'['];
        min.extend_from_slice(&Self::member(table, start));
        let max = match end_inclusive {
            Some(end) => {
                let mut m = vec![b'['];
                m.extend_from_slice(&Self::member(table, end));
                m
            }
            None => {
                // one past the separator byte: strictly greater than any
                // member starting with `table ++ 0x00`, and no valid
                // member of a different table can fall in between since
                // table names are plain identifiers (no embedded NUL).
                let mut prefix = table.as_bytes().to_vec();
                prefix.push(1);
                let mut m = vec![b'('];
                m.extend_from_slice(&prefix);
                m
            }
        };
        (min, max)
    }

    /// Fetches one `scan_chunk_members`-bounded page of the sorted-set
    /// member range starting at `offset`, via `ZRANGEBYLEX ... LIMIT`.
    fn fetch_member_page(&mut self, min: &[u8], max: &[u8], offset: isize) -> StorageResult<Vec<Vec<u8>>> {
        let limit = self.scan_chunk_members as isize;
        self.with_conn(|c| c.zrangebylex_limit(INDEX_KEY, min, max, offset, limit))
    }
}

impl Backend for RemoteMemoryBackend {
    fn setup_namespace(&mut self, tables: &HashMap<String, KeySpec>) -> StorageResult<()> {
        self.tables.extend(tables.clone());
        Ok(())
    }

    fn delete_namespace(&mut self) -> StorageResult<()> {
        let members: Vec<Vec<u8>> = self.with_conn(|c| c.zrange(INDEX_KEY, 0, -1))?;
        if !members.is_empty() {
            self.with_conn(|c| {
                for m in &members {
                    c.del::<_, ()>(m)?;
                }
                c.zrem::<_, _, ()>(INDEX_KEY, &members)
            })?;
        }
        self.tables.clear();
        Ok(())
    }

    fn clear_table(&mut self, table: &str) -> StorageResult<()> {
        self.spec(table)?;
        let (min, max) = Self::lex_bounds(table, &[], None);
        let members: Vec<Vec<u8>> =
            self.with_conn(|c| c.zrangebylex(INDEX_KEY, min, max))?;
        if !members.is_empty() {
            self.with_conn(|c| {
                for m in &members {
                    c.del::<_, ()>(m)?;
                }
                c.zrem::<_, _, ()>(INDEX_KEY, &members)
            })?;
        }
        Ok(())
    }

    fn put(&mut self, table: &str, items: &[PutItem]) -> StorageResult<()> {
        let spec = self.spec(table)?.clone();
        for (k, v) in items {
            let encoded = codec::encode(k, &spec)?;
            let member = Self::member(table, &encoded);
            self.with_conn(|c| {
                c.zadd::<_, _, _, ()>(INDEX_KEY, &member, 0)?;
                c.set::<_, _, ()>(&member, v)
            })?;
        }
        Ok(())
    }

    fn get(&mut self, table: &str, keys: &[Key]) -> StorageResult<Vec<Option<Vec<u8>>>> {
        let spec = self.spec(table)?.clone();
        let mut out = Vec::with_capacity(keys.len());
        for k in keys {
            let encoded = codec::encode(k, &spec)?;
            let member = Self::member(table, &encoded);
            let value: Option<Vec<u8>> = self.with_conn(|c| c.get(&member))?;
            out.push(value);
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
        Ok(Box::new(MemberScanIter {
            backend: self,
            table: table.to_string(),
            table_len: table.len() + 1,
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
        for k in keys {
            let encoded = codec::encode(k, &spec)?;
            let member = Self::member(table, &encoded);
            self.with_conn(|c| {
                c.del::<_, ()>(&member)?;
                c.zrem::<_, _, ()>(INDEX_KEY, &member)
            })?;
        }
        Ok(())
    }

    fn close(&mut self) -> StorageResult<()> {
        self.conn = None;
        Ok(())
    }
}

struct MemberPageState {
    min: Vec<u8>,
    max: Vec<u8>,
    offset: isize,
    buffer: VecDeque<Vec<u8>>,
    exhausted: bool,
}

/// Lazily walks a sequence of ranges, each paged through
/// `ZRANGEBYLEX ... LIMIT offset count` -- a single `ZRANGEBYLEX` call has
/// no notion of a result-set cursor, so `offset` does the paging -- with
/// each member's value fetched only once the consumer's `next()` reaches
/// it, since the member list and its values are separate round trips.
struct MemberScanIter<'a> {
    backend: &'a mut RemoteMemoryBackend,
    table: String,
    table_len: usize,
    spec: KeySpec,
    ranges: VecDeque<KeyRange>,
    state: Option<MemberPageState>,
}

impl<'a> Iterator for MemberScanIter<'a> {
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
                let (min, max) = RemoteMemoryBackend::lex_bounds(&self.table, &start_bytes, end_bytes.as_deref());
                self.state = Some(MemberPageState {
                    min,
                    max,
                    offset: 0,
                    buffer: VecDeque::new(),
                    exhausted: false,
                });
            }
            let state = self.state.as_mut().expect("just set");
            if let Some(member) = state.buffer.pop_front() {
                let value: Option<Vec<u8>> = match self.backend.with_conn(|c| c.get(&member)) {
                    Ok(v) => v,
                    Err(e) => return Some(Err(e)),
                };
                let Some(value) = value else { continue };
                return Some(codec::decode(&member[self.table_len..], &self.spec).map(|key| (key, value)));
            }
            if state.exhausted {
                self.state = None;
                continue;
            }
            let scan_chunk_members = self.backend.scan_chunk_members;
            let page = match self.backend.fetch_member_page(&state.min, &state.max, state.offset) {
                Ok(p) => p,
                Err(e) => {
                    self.state = None;
                    return Some(Err(e));
                }
            };
            if (page.len() as u64) < scan_chunk_members {
                state.exhausted = true;
            }
            if page.is_empty() {
                continue;
            }
            state.offset += page.len() as isize;
            state.buffer.extend(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_encodes_table_prefix_and_key() {
        let m = RemoteMemoryBackend::member("t", &[1, 2, 3]);
        assert_eq!(m, vec![b't', 0, 1, 2, 3]);
    }

    #[test]
    fn lex_bounds_unbounded_end_is_exclusive_above_table_prefix() {
        let (_min, max) = RemoteMemoryBackend::lex_bounds("t", &[], None);
        // "(t\x01" -- strictly greater than any "t\x00..." member.
        assert_eq!(max, vec![b'(', b't', 1]);
    }
}
