//! Structured KV (component C3): string cell, hash, and list primitives
//! built atop a single MVCC transaction and a caller-supplied byte prefix.
//!
//! All three structures share one key prefix and disambiguate by a one-byte
//! type tag, so a single `(prefix, key)` pair can carry a string, a hash and
//! a list simultaneously without collision — callers just don't mix them in
//! practice.

use std::collections::Bound;
use crate::codec::memcmp;
use crate::error::{CResult, Error};
use crate::mvcc::transaction::Transaction;
use crate::storage::engine::Engine;

const TAG_STRING: u8 = b's';
const TAG_HASH_META: u8 = b'H';
const TAG_HASH_DATA: u8 = b'h';
const TAG_LIST_META: u8 = b'L';
const TAG_LIST_DATA: u8 = b'l';

fn cell_key(prefix: &[u8], key: &[u8], tag: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(prefix.len() + memcmp::encoded_bytes_length(key.len()) + 1);
    buf.extend_from_slice(prefix);
    memcmp::encode_bytes(&mut buf, key);
    buf.push(tag);
    buf
}

/// Parses a human-readable decimal int64, treating an absent cell as `0`.
fn parse_decimal(raw: Option<Vec<u8>>) -> CResult<i64> {
    match raw {
        None => Ok(0),
        Some(bytes) => std::str::from_utf8(&bytes)
            .map_err(|e| Error::CodecCorrupt(e.to_string()))?
            .parse::<i64>()
            .map_err(Error::from),
    }
}

fn format_decimal(v: i64) -> Vec<u8> {
    v.to_string().into_bytes()
}

/// Entry point: builds string/hash/list handles sharing `(prefix, key)`.
pub struct StructuredKv<'a, E: Engine> {
    txn: &'a Transaction<E>,
    prefix: Vec<u8>,
}

impl<'a, E: Engine> StructuredKv<'a, E> {
    pub fn new(txn: &'a Transaction<E>, prefix: impl Into<Vec<u8>>) -> Self {
        Self { txn, prefix: prefix.into() }
    }

    pub fn string(&self, key: &[u8]) -> StringCell<'a, E> {
        StringCell { txn: self.txn, key: cell_key(&self.prefix, key, TAG_STRING) }
    }

    pub fn hash(&self, key: &[u8]) -> HashHandle<'a, E> {
        HashHandle {
            txn: self.txn,
            meta_key: cell_key(&self.prefix, key, TAG_HASH_META),
            data_prefix: cell_key(&self.prefix, key, TAG_HASH_DATA),
        }
    }

    pub fn list(&self, key: &[u8]) -> ListHandle<'a, E> {
        ListHandle {
            txn: self.txn,
            meta_key: cell_key(&self.prefix, key, TAG_LIST_META),
            data_prefix: cell_key(&self.prefix, key, TAG_LIST_DATA),
        }
    }
}

/// A single string cell: `get`/`set`/`clear`, plus a decimal-int64 `inc` used
/// pervasively by the sequence allocator and meta store for counters that
/// should stay human-readable on disk.
pub struct StringCell<'a, E: Engine> {
    txn: &'a Transaction<E>,
    key: Vec<u8>,
}

impl<'a, E: Engine> StringCell<'a, E> {
    pub fn get(&self) -> CResult<Option<Vec<u8>>> {
        self.txn.get(&self.key)
    }

    pub fn set(&self, value: Vec<u8>) -> CResult<()> {
        self.txn.set(&self.key, value)
    }

    pub fn clear(&self) -> CResult<()> {
        self.txn.delete(&self.key)
    }

    pub fn get_int64(&self) -> CResult<i64> {
        parse_decimal(self.get()?)
    }

    pub fn set_int64(&self, v: i64) -> CResult<()> {
        self.set(format_decimal(v))
    }

    /// Reads the current decimal int64 (0 if absent), adds `step`, and
    /// writes the result back, returning the new value.
    pub fn inc(&self, step: i64) -> CResult<i64> {
        let next = self.get_int64()?.wrapping_add(step);
        self.set_int64(next)?;
        Ok(next)
    }
}

/// A hash: field -> value, with a meta cell tracking the live field count so
/// `HLen` doesn't need a full scan.
pub struct HashHandle<'a, E: Engine> {
    txn: &'a Transaction<E>,
    meta_key: Vec<u8>,
    data_prefix: Vec<u8>,
}

impl<'a, E: Engine> HashHandle<'a, E> {
    fn field_key(&self, field: &[u8]) -> Vec<u8> {
        let mut buf = self.data_prefix.clone();
        memcmp::encode_bytes(&mut buf, field);
        buf
    }

    fn field_count(&self) -> CResult<u64> {
        match self.txn.get(&self.meta_key)? {
            None => Ok(0),
            Some(raw) => {
                if raw.len() != 8 {
                    return Err(Error::InvalidHashDataKey);
                }
                Ok(u64::from_be_bytes(raw.try_into().unwrap()))
            }
        }
    }

    fn set_field_count(&self, n: u64) -> CResult<()> {
        if n == 0 {
            self.txn.delete(&self.meta_key)
        } else {
            self.txn.set(&self.meta_key, n.to_be_bytes().to_vec())
        }
    }

    /// Creates or updates `field`. Does not change `HLen` if `field` already existed.
    pub fn hset(&self, field: &[u8], value: Vec<u8>) -> CResult<()> {
        let key = self.field_key(field);
        let existed = self.txn.get(&key)?.is_some();
        self.txn.set(&key, value)?;
        if !existed {
            self.set_field_count(self.field_count()? + 1)?;
        }
        Ok(())
    }

    pub fn hget(&self, field: &[u8]) -> CResult<Option<Vec<u8>>> {
        self.txn.get(&self.field_key(field))
    }

    pub fn hget_int64(&self, field: &[u8]) -> CResult<i64> {
        parse_decimal(self.hget(field)?)
    }

    pub fn hset_int64(&self, field: &[u8], v: i64) -> CResult<()> {
        self.hset(field, format_decimal(v))
    }

    /// Returns `true` iff `field` existed (and was deleted). Decrements
    /// `HLen`; deletes the meta cell entirely once the last field is gone.
    pub fn hdel(&self, field: &[u8]) -> CResult<bool> {
        let key = self.field_key(field);
        if self.txn.get(&key)?.is_none() {
            return Ok(false);
        }
        self.txn.delete(&key)?;
        let count = self.field_count()?;
        self.set_field_count(count.saturating_sub(1))?;
        Ok(true)
    }

    pub fn hlen(&self) -> CResult<u64> {
        self.field_count()
    }

    /// Reads the field as a decimal int64 (0 if absent), adds `step`, writes
    /// it back, and returns the new value.
    pub fn hinc(&self, field: &[u8], step: i64) -> CResult<i64> {
        let next = self.hget_int64(field)?.wrapping_add(step);
        self.hset_int64(field, next)?;
        Ok(next)
    }

    fn scan_fields(&self) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut scan = self.txn.scan_prefix(&self.data_prefix)?;
        let mut out = Vec::new();
        for item in scan.scan()? {
            let (key, value) = item?;
            let field = decode_field(&key, self.data_prefix.len())?;
            out.push((field, value));
        }
        Ok(out)
    }

    pub fn hkeys(&self) -> CResult<Vec<Vec<u8>>> {
        Ok(self.scan_fields()?.into_iter().map(|(k, _)| k).collect())
    }

    pub fn hget_all(&self) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.scan_fields()
    }

    /// Returns the first `n` fields in ascending order.
    pub fn hget_n(&self, n: usize) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut all = self.scan_fields()?;
        all.truncate(n);
        Ok(all)
    }

    /// Returns the first `n` fields in descending order.
    pub fn hget_n_desc(&self, n: usize) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut all = self.scan_fields()?;
        all.reverse();
        all.truncate(n);
        Ok(all)
    }

    /// Deletes every field, then the meta cell.
    pub fn hclear(&self) -> CResult<()> {
        for (field, _) in self.scan_fields()? {
            self.txn.delete(&self.field_key(&field))?;
        }
        self.txn.delete(&self.meta_key)
    }
}

fn decode_field(key: &[u8], prefix_len: usize) -> CResult<Vec<u8>> {
    let (field, rest) = memcmp::decode_bytes(&key[prefix_len..])?;
    if !rest.is_empty() {
        return Err(Error::InvalidHashDataKey);
    }
    Ok(field)
}

/// A FIFO/LIFO list addressed by a pair of monotonically diverging cursors:
/// `lIndex` only ever decreases (via `LPush`), `rIndex` only ever increases
/// (via `RPush`), and `LLen == rIndex - lIndex`.
pub struct ListHandle<'a, E: Engine> {
    txn: &'a Transaction<E>,
    meta_key: Vec<u8>,
    data_prefix: Vec<u8>,
}

#[derive(Clone, Copy)]
struct ListMeta {
    l_index: i64,
    r_index: i64,
}

impl<'a, E: Engine> ListHandle<'a, E> {
    fn index_key(&self, index: i64) -> Vec<u8> {
        let mut buf = self.data_prefix.clone();
        memcmp::encode_i64(&mut buf, index);
        buf
    }

    fn meta(&self) -> CResult<ListMeta> {
        match self.txn.get(&self.meta_key)? {
            None => Ok(ListMeta { l_index: 0, r_index: 0 }),
            Some(raw) => {
                if raw.len() != 16 {
                    return Err(Error::InvalidListMetaData);
                }
                let (l_index, rest) = memcmp::decode_i64(&raw)?;
                let (r_index, _) = memcmp::decode_i64(rest)?;
                Ok(ListMeta { l_index, r_index })
            }
        }
    }

    fn set_meta(&self, meta: ListMeta) -> CResult<()> {
        if meta.l_index == meta.r_index {
            return self.txn.delete(&self.meta_key);
        }
        let mut buf = Vec::with_capacity(16);
        memcmp::encode_i64(&mut buf, meta.l_index);
        memcmp::encode_i64(&mut buf, meta.r_index);
        self.txn.set(&self.meta_key, buf)
    }

    pub fn llen(&self) -> CResult<i64> {
        let m = self.meta()?;
        Ok(m.r_index - m.l_index)
    }

    pub fn lpush(&self, value: Vec<u8>) -> CResult<()> {
        let mut m = self.meta()?;
        m.l_index -= 1;
        self.txn.set(&self.index_key(m.l_index), value)?;
        self.set_meta(m)
    }

    pub fn rpush(&self, value: Vec<u8>) -> CResult<()> {
        let mut m = self.meta()?;
        let idx = m.r_index;
        m.r_index += 1;
        self.txn.set(&self.index_key(idx), value)?;
        self.set_meta(m)
    }

    pub fn lpop(&self) -> CResult<Option<Vec<u8>>> {
        let mut m = self.meta()?;
        if m.l_index == m.r_index {
            return Ok(None);
        }
        let key = self.index_key(m.l_index);
        let value = self.txn.get(&key)?;
        self.txn.delete(&key)?;
        m.l_index += 1;
        self.set_meta(m)?;
        Ok(value)
    }

    pub fn rpop(&self) -> CResult<Option<Vec<u8>>> {
        let mut m = self.meta()?;
        if m.l_index == m.r_index {
            return Ok(None);
        }
        m.r_index -= 1;
        let key = self.index_key(m.r_index);
        let value = self.txn.get(&key)?;
        self.txn.delete(&key)?;
        self.set_meta(m)?;
        Ok(value)
    }

    /// Supports negative indexing relative to `rIndex` (`-1` is the last element).
    pub fn lindex(&self, i: i64) -> CResult<Option<Vec<u8>>> {
        let m = self.meta()?;
        let idx = if i < 0 { m.r_index + i } else { m.l_index + i };
        if idx < m.l_index || idx >= m.r_index {
            return Ok(None);
        }
        self.txn.get(&self.index_key(idx))
    }

    pub fn lset(&self, i: i64, value: Vec<u8>) -> CResult<()> {
        let m = self.meta()?;
        let idx = if i < 0 { m.r_index + i } else { m.l_index + i };
        if idx < m.l_index || idx >= m.r_index {
            return Err(Error::ListIndexOutOfRange);
        }
        self.txn.set(&self.index_key(idx), value)
    }

    /// Iterates right-to-left (most recently `RPush`-ed first).
    pub fn lget_all(&self) -> CResult<Vec<Vec<u8>>> {
        let mut scan = self.txn.scan_prefix(&self.data_prefix)?;
        let mut out = Vec::new();
        for item in scan.scan()?.rev() {
            let (_, value) = item?;
            out.push(value);
        }
        Ok(out)
    }

    pub fn lclear(&self) -> CResult<()> {
        let m = self.meta()?;
        let mut idx = m.l_index;
        while idx < m.r_index {
            self.txn.delete(&self.index_key(idx))?;
            idx += 1;
        }
        self.txn.delete(&self.meta_key)
    }
}

/// Convenience alias used by callers that only need to bound a prefix scan
/// over a structured-KV key's data keyspace without round-tripping through
/// `Bound` themselves.
pub(crate) fn unbounded_prefix(prefix: &[u8]) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    (Bound::Included(prefix.to_vec()), Bound::Unbounded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::transaction::TransactionDef;
    use crate::storage::memory::Memory;
    use std::sync::{Arc, Mutex};

    fn new_txn() -> Transaction<Memory> {
        Transaction::begin(Arc::new(Mutex::new(Memory::new()))).unwrap()
    }

    #[test]
    fn string_cell_get_set_clear() {
        let txn = new_txn();
        let kv = StructuredKv::new(&txn, b"p".to_vec());
        let cell = kv.string(b"k");
        assert_eq!(cell.get().unwrap(), None);
        cell.set(b"v".to_vec()).unwrap();
        assert_eq!(cell.get().unwrap(), Some(b"v".to_vec()));
        cell.clear().unwrap();
        assert_eq!(cell.get().unwrap(), None);
    }

    #[test]
    fn string_cell_inc_starts_at_zero() {
        let txn = new_txn();
        let kv = StructuredKv::new(&txn, b"p".to_vec());
        let cell = kv.string(b"counter");
        assert_eq!(cell.inc(1).unwrap(), 1);
        assert_eq!(cell.inc(41).unwrap(), 42);
    }

    #[test]
    fn hash_set_get_and_len() {
        let txn = new_txn();
        let kv = StructuredKv::new(&txn, b"p".to_vec());
        let h = kv.hash(b"h");
        h.hset(b"f1", b"v1".to_vec()).unwrap();
        assert_eq!(h.hget(b"f1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(h.hlen().unwrap(), 1);
        h.hset(b"f1", b"v2".to_vec()).unwrap();
        assert_eq!(h.hlen().unwrap(), 1);
        assert_eq!(h.hget(b"f1").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn hash_del_decrements_len_once() {
        let txn = new_txn();
        let kv = StructuredKv::new(&txn, b"p".to_vec());
        let h = kv.hash(b"h");
        h.hset(b"f1", b"v1".to_vec()).unwrap();
        assert!(h.hdel(b"f1").unwrap());
        assert!(!h.hdel(b"f1").unwrap());
        assert_eq!(h.hlen().unwrap(), 0);
    }

    #[test]
    fn hash_get_n_and_desc_n_mirror_each_other() {
        let txn = new_txn();
        let kv = StructuredKv::new(&txn, b"p".to_vec());
        let h = kv.hash(b"h");
        h.hset(b"f1", b"v1".to_vec()).unwrap();
        h.hset(b"f2", b"v2".to_vec()).unwrap();
        h.hset(b"f3", b"v3".to_vec()).unwrap();

        let asc = h.hget_n(3).unwrap();
        let desc = h.hget_n_desc(3).unwrap();
        assert_eq!(asc.len(), 3);
        for i in 0..3 {
            assert_eq!(asc[i], desc[2 - i]);
        }
    }

    #[test]
    fn list_push_pop_fifo_and_lifo() {
        let txn = new_txn();
        let kv = StructuredKv::new(&txn, b"p".to_vec());
        let l = kv.list(b"l");

        l.rpush(b"a".to_vec()).unwrap();
        l.rpush(b"b".to_vec()).unwrap();
        assert_eq!(l.lpop().unwrap(), Some(b"a".to_vec()));
        assert_eq!(l.lpop().unwrap(), Some(b"b".to_vec()));
        assert_eq!(l.lpop().unwrap(), None);

        l.lpush(b"a".to_vec()).unwrap();
        l.lpush(b"b".to_vec()).unwrap();
        assert_eq!(l.lpop().unwrap(), Some(b"b".to_vec()));
        assert_eq!(l.lpop().unwrap(), Some(b"a".to_vec()));
    }

    #[test]
    fn list_len_tracks_cursor_span() {
        let txn = new_txn();
        let kv = StructuredKv::new(&txn, b"p".to_vec());
        let l = kv.list(b"l");
        l.rpush(b"a".to_vec()).unwrap();
        l.rpush(b"b".to_vec()).unwrap();
        l.lpush(b"z".to_vec()).unwrap();
        assert_eq!(l.llen().unwrap(), 3);
    }

    #[test]
    fn list_set_out_of_range_fails() {
        let txn = new_txn();
        let kv = StructuredKv::new(&txn, b"p".to_vec());
        let l = kv.list(b"l");
        l.rpush(b"a".to_vec()).unwrap();
        assert!(matches!(l.lset(5, b"x".to_vec()), Err(Error::ListIndexOutOfRange)));
    }
}
