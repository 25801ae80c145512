//! DML collection ops (component C10): Insert/Update/Upsert/Delete/Get/
//! GetMany/Count/DeleteAll/Scan/GetDidRange on documents, integrated with
//! sequences and the schema cache.

use std::sync::Arc;
use crate::document::keys::{document_key, document_prefix};
use crate::document::sequence::Sequence;
use crate::document::txn::Txn;
use crate::error::{CResult, Error};
use crate::storage::engine::Engine;

/// Bound to a single `(db, collection)` pair for the lifetime of one `Txn`.
pub struct CollectionOps<'a, E: Engine> {
    txn: &'a Txn<E>,
    cid: u64,
    sequence: Option<Arc<Sequence<E>>>,
}

impl<'a, E: Engine> CollectionOps<'a, E> {
    pub(crate) fn new(txn: &'a Txn<E>, cid: u64, sequence: Option<Arc<Sequence<E>>>) -> Self {
        txn.mark_referred(cid);
        Self { txn, cid, sequence }
    }

    fn sequence(&self) -> CResult<&Arc<Sequence<E>>> {
        self.sequence.as_ref().ok_or(Error::SequenceNotExists)
    }

    /// Allocates a `did` via the collection's sequence and writes the
    /// document unconditionally. Registers a cancel hook to `PutBack` the
    /// allocated ID if the enclosing transaction's commit fails.
    pub fn insert_one(&self, doc: Vec<u8>) -> CResult<u64> {
        let did = self.sequence()?.next()? as u64;
        let key = document_key(self.cid, did);
        self.txn.inner().set(&key, doc)?;
        let seq = self.sequence()?.clone();
        self.txn.on_cancel(move || {
            let _ = seq.put_back([did as i64]);
        });
        Ok(did)
    }

    /// Writes only if `did` already exists. Returns whether it existed.
    pub fn update_one(&self, did: u64, doc: Vec<u8>) -> CResult<bool> {
        let key = document_key(self.cid, did);
        let exists = self.txn.inner().get(&key)?.is_some();
        if exists {
            self.txn.inner().set(&key, doc)?;
        }
        Ok(exists)
    }

    /// Writes unconditionally. Returns whether `did` was newly created.
    pub fn upsert_one(&self, did: u64, doc: Vec<u8>) -> CResult<bool> {
        let key = document_key(self.cid, did);
        let is_new = self.txn.inner().get(&key)?.is_none();
        self.txn.inner().set(&key, doc)?;
        Ok(is_new)
    }

    /// Fails `doc-exists` if `did` is already present.
    pub fn insert_one_managed(&self, did: u64, doc: Vec<u8>) -> CResult<()> {
        let key = document_key(self.cid, did);
        if self.txn.inner().get(&key)?.is_some() {
            return Err(Error::DocExists);
        }
        self.txn.inner().set(&key, doc)
    }

    pub fn get(&self, did: u64) -> CResult<Option<Vec<u8>>> {
        self.txn.inner().get(&document_key(self.cid, did))
    }

    /// Aborts with `doc-not-found` on the first missing ID.
    pub fn get_many(&self, dids: &[u64]) -> CResult<Vec<Vec<u8>>> {
        dids.iter()
            .map(|&did| self.get(did)?.ok_or(Error::DocNotFound))
            .collect()
    }

    pub fn delete(&self, did: u64) -> CResult<()> {
        self.txn.inner().delete(&document_key(self.cid, did))
    }

    /// Ordered scan over every document key in this collection.
    pub fn count(&self) -> CResult<u64> {
        let mut scan = self.txn.inner().scan_prefix(&document_prefix(self.cid))?;
        let mut n = 0u64;
        for item in scan.scan()? {
            item?;
            n += 1;
        }
        Ok(n)
    }

    /// Deletes every document in the collection, against the transaction
    /// this op is bound to. If that transaction hits `txn-too-big`, the
    /// error propagates to the caller, who is expected to retry with a
    /// fresh transaction — see `Store::delete_all` for a helper that does
    /// this automatically when the caller doesn't already hold a txn.
    pub fn delete_all(&self) -> CResult<u64> {
        let keys: Vec<Vec<u8>> = {
            let mut scan = self.txn.inner().scan_prefix(&document_prefix(self.cid))?;
            scan.scan()?.map(|item| item.map(|(k, _)| k)).collect::<CResult<_>>()?
        };
        for key in &keys {
            self.txn.inner().delete(key)?;
        }
        Ok(keys.len() as u64)
    }

    /// Deletes up to as many documents as the bound transaction's write
    /// budget allows, stopping (without error) the moment a delete would
    /// overflow it. Returns `(deleted, more_remaining)`.
    pub(crate) fn delete_all_batch(&self) -> CResult<(u64, bool)> {
        let keys: Vec<Vec<u8>> = {
            let mut scan = self.txn.inner().scan_prefix(&document_prefix(self.cid))?;
            scan.scan()?.map(|item| item.map(|(k, _)| k)).collect::<CResult<_>>()?
        };
        let mut n = 0u64;
        for key in &keys {
            match self.txn.inner().delete(key) {
                Ok(()) => n += 1,
                Err(Error::TxnTooBig) => return Ok((n, true)),
                Err(e) => return Err(e),
            }
        }
        Ok((n, false))
    }

    /// All `(did, value)` pairs in ascending `did` order.
    pub fn scan(&self) -> CResult<Vec<(u64, Vec<u8>)>> {
        let mut scan = self.txn.inner().scan_prefix(&document_prefix(self.cid))?;
        let prefix_len = document_prefix(self.cid).len();
        let mut out = Vec::new();
        for item in scan.scan()? {
            let (key, value) = item?;
            let (did, _) = crate::codec::memcmp::decode_u64(&key[prefix_len..])?;
            out.push((did, value));
        }
        Ok(out)
    }

    /// `(min, max)` of existing document IDs, or `(0, 0)` if the collection
    /// is empty. Forward-scan-first, reverse-scan-last under the prefix.
    pub fn get_did_range(&self) -> CResult<(u64, u64)> {
        let prefix = document_prefix(self.cid);
        let prefix_len = prefix.len();
        let mut scan = self.txn.inner().scan_prefix(&prefix)?;
        let mut iter = scan.scan()?;
        let first = match iter.next() {
            Some(item) => item?,
            None => return Ok((0, 0)),
        };
        let last = iter.next_back().unwrap_or(Ok(first.clone()))?;
        let (min, _) = crate::codec::memcmp::decode_u64(&first.0[prefix_len..])?;
        let (max, _) = crate::codec::memcmp::decode_u64(&last.0[prefix_len..])?;
        Ok((min, max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::cache::MetaCache;
    use crate::document::handle::SchemaHandle;
    use crate::storage::memory::Memory;
    use std::sync::Mutex;

    fn new_txn() -> Txn<Memory> {
        let engine = Arc::new(Mutex::new(Memory::new()));
        let schema = Arc::new(SchemaHandle::new(MetaCache::new(0, vec![])));
        Txn::begin(engine, schema).unwrap()
    }

    #[test]
    fn insert_then_get_roundtrips() {
        let txn = new_txn();
        let seq = Some(Arc::new(Sequence::new_string(Arc::new(Mutex::new(Memory::new())), "docseq:1", 10).unwrap()));
        let ops = CollectionOps::new(&txn, 1, seq);
        let did = ops.insert_one(b"hello".to_vec()).unwrap();
        assert_eq!(ops.get(did).unwrap(), Some(b"hello".to_vec()));
    }

    #[test]
    fn update_one_requires_existing_doc() {
        let txn = new_txn();
        let ops = CollectionOps::new(&txn, 1, None);
        assert!(!ops.update_one(1, b"x".to_vec()).unwrap());
        ops.insert_one_managed(1, b"x".to_vec()).unwrap();
        assert!(ops.update_one(1, b"y".to_vec()).unwrap());
        assert_eq!(ops.get(1).unwrap(), Some(b"y".to_vec()));
    }

    #[test]
    fn upsert_reports_new_vs_overwrite() {
        let txn = new_txn();
        let ops = CollectionOps::new(&txn, 1, None);
        assert!(ops.upsert_one(1, b"a".to_vec()).unwrap());
        assert!(!ops.upsert_one(1, b"b".to_vec()).unwrap());
    }

    #[test]
    fn insert_one_managed_rejects_existing() {
        let txn = new_txn();
        let ops = CollectionOps::new(&txn, 1, None);
        ops.insert_one_managed(1, b"a".to_vec()).unwrap();
        assert!(matches!(ops.insert_one_managed(1, b"b".to_vec()), Err(Error::DocExists)));
    }

    #[test]
    fn get_many_aborts_on_first_missing() {
        let txn = new_txn();
        let ops = CollectionOps::new(&txn, 1, None);
        ops.insert_one_managed(1, b"a".to_vec()).unwrap();
        assert!(matches!(ops.get_many(&[1, 2]), Err(Error::DocNotFound)));
    }

    #[test]
    fn count_and_delete_all() {
        let txn = new_txn();
        let ops = CollectionOps::new(&txn, 1, None);
        for i in 1..=3u64 {
            ops.insert_one_managed(i, vec![i as u8]).unwrap();
        }
        assert_eq!(ops.count().unwrap(), 3);
        assert_eq!(ops.delete_all().unwrap(), 3);
        assert_eq!(ops.count().unwrap(), 0);
    }

    #[test]
    fn get_did_range_reports_min_and_max() {
        let txn = new_txn();
        let ops = CollectionOps::new(&txn, 1, None);
        assert_eq!(ops.get_did_range().unwrap(), (0, 0));
        ops.insert_one_managed(5, vec![]).unwrap();
        ops.insert_one_managed(1, vec![]).unwrap();
        ops.insert_one_managed(9, vec![]).unwrap();
        assert_eq!(ops.get_did_range().unwrap(), (1, 9));
    }
}
