//! Lease-based sequence allocator (component C4).
//!
//! A sequence reserves a range of integers from persistent storage (a
//! "lease") and hands out `Next()` values from that range without further
//! I/O until the lease is exhausted, at which point it renews by committing
//! a small transaction of its own. This keeps steady-state allocation cheap
//! (amortized over `bandwidth` calls) at the cost of monotonic gaps on crash
//! — values in `(next, leased]` that were never handed out are abandoned,
//! never reused.
//!
//! Two flavors share this logic: a **string sequence**, persisted in a
//! string cell at `META || "_s" || keyword`, and a **hash sequence**,
//! persisted in a hash field under `(key, field)` — used for per-collection
//! document-ID sequences, keyed by `(db-key, cid-field)`.

use std::sync::{Arc, Mutex};
use crate::document::keys::META;
use crate::document::structure::StructuredKv;
use crate::error::{CResult, Error};
use crate::mvcc::transaction::{Transaction, TransactionDef};
use crate::storage::engine::Engine;

/// Default lease size for collection/index-ID sequences.
pub const DEFAULT_COLLECTION_ID_BANDWIDTH: i64 = 50;
/// Default lease size for per-collection document-ID sequences.
pub const DEFAULT_DOCUMENT_ID_BANDWIDTH: i64 = 1000;

enum Backend {
    /// `META || "_s" || keyword`
    Keyword(String),
    /// A hash field under `(key, field)`.
    HashField { key: Vec<u8>, field: Vec<u8> },
}

struct State {
    next: i64,
    leased: i64,
    bandwidth: i64,
    putbacks: Vec<i64>,
    closed: bool,
}

/// A single `[start, end)` range returned by `NextN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: i64,
    pub end: i64,
}

pub struct Sequence<E: Engine> {
    engine: Arc<Mutex<E>>,
    backend: Backend,
    state: Mutex<State>,
}

impl<E: Engine> Sequence<E> {
    /// A sequence persisted in the meta string cell `META || "_s" || keyword`.
    pub fn new_string(engine: Arc<Mutex<E>>, keyword: impl Into<String>, bandwidth: i64) -> CResult<Self> {
        let keyword = keyword.into();
        if keyword.is_empty() {
            return Err(Error::EmptyKeyword);
        }
        if bandwidth <= 0 {
            return Err(Error::ZeroBandwidth);
        }
        Ok(Self {
            engine,
            backend: Backend::Keyword(keyword),
            state: Mutex::new(State { next: 0, leased: 0, bandwidth, putbacks: Vec::new(), closed: false }),
        })
    }

    /// A sequence persisted in a hash field under `(key, field)` — used for
    /// per-collection document IDs keyed by `(db-key, cid-field)`.
    pub fn new_hash(
        engine: Arc<Mutex<E>>,
        key: impl Into<Vec<u8>>,
        field: impl Into<Vec<u8>>,
        bandwidth: i64,
    ) -> CResult<Self> {
        let key = key.into();
        let field = field.into();
        if key.is_empty() {
            return Err(Error::EmptyKeyForHashSequence);
        }
        if field.is_empty() {
            return Err(Error::EmptyFieldForHashSequence);
        }
        if bandwidth <= 0 {
            return Err(Error::ZeroBandwidth);
        }
        Ok(Self {
            engine,
            backend: Backend::HashField { key, field },
            state: Mutex::new(State { next: 0, leased: 0, bandwidth, putbacks: Vec::new(), closed: false }),
        })
    }

    fn read_persisted(&self, txn: &Transaction<E>) -> CResult<i64> {
        let kv = StructuredKv::new(txn, META.to_vec());
        match &self.backend {
            Backend::Keyword(keyword) => kv.string(keyword.as_bytes()).get_int64(),
            Backend::HashField { key, field } => kv.hash(key).hget_int64(field),
        }
    }

    fn write_persisted(&self, txn: &Transaction<E>, value: i64) -> CResult<()> {
        let kv = StructuredKv::new(txn, META.to_vec());
        match &self.backend {
            Backend::Keyword(keyword) => kv.string(keyword.as_bytes()).set_int64(value),
            Backend::HashField { key, field } => kv.hash(key).hset_int64(field, value),
        }
    }

    fn clear_persisted(&self, txn: &Transaction<E>) -> CResult<()> {
        let kv = StructuredKv::new(txn, META.to_vec());
        match &self.backend {
            Backend::Keyword(keyword) => kv.string(keyword.as_bytes()).clear(),
            Backend::HashField { key, field } => {
                kv.hash(key).hdel(field)?;
                Ok(())
            }
        }
    }

    /// Atomically reads the persisted integer, adds `step`, writes it back
    /// and commits. On success, extends the in-memory lease by `step`: the
    /// lease's upper bound never decreases.
    pub fn renew(&self, step: i64) -> CResult<()> {
        let txn = Transaction::begin(self.engine.clone())?;
        let current = self.read_persisted(&txn)?;
        let new = current + step;
        self.write_persisted(&txn, new)?;
        txn.commit()?;

        let mut st = self.state.lock()?;
        st.leased = new;
        st.next = new - step;
        Ok(())
    }

    /// Returns the next value in the sequence.
    pub fn next(&self) -> CResult<i64> {
        let mut st = self.state.lock()?;
        if st.closed {
            return Err(Error::SequenceClosed);
        }
        if let Some(v) = st.putbacks.pop() {
            return Ok(v);
        }
        if st.next >= st.leased {
            let bandwidth = st.bandwidth;
            drop(st);
            self.renew(bandwidth)?;
            st = self.state.lock()?;
        }
        st.next += 1;
        Ok(st.next)
    }

    /// Returns one or two `[start, end)` ranges covering `n` consecutive
    /// values. Two ranges are returned when the current lease doesn't have
    /// enough room left and a renewal has to start a fresh block.
    pub fn next_n(&self, n: i64) -> CResult<Vec<Range>> {
        if n <= 0 {
            return Ok(Vec::new());
        }
        let mut st = self.state.lock()?;
        if st.closed {
            return Err(Error::SequenceClosed);
        }
        let remaining = st.leased - st.next;
        if remaining >= n {
            let start = st.next + 1;
            st.next += n;
            return Ok(vec![Range { start, end: start + n }]);
        }

        let first = if remaining > 0 {
            let start = st.next + 1;
            let end = st.leased + 1;
            st.next = st.leased;
            Some(Range { start, end })
        } else {
            None
        };

        let bandwidth = st.bandwidth;
        let step = n - remaining + bandwidth;
        drop(st);
        self.renew(step)?;
        st = self.state.lock()?;

        let second_len = n - remaining;
        let start = st.next + 1;
        st.next += second_len;
        let second = Range { start, end: start + second_len };

        Ok(match first {
            Some(first) => vec![first, second],
            None => vec![second],
        })
    }

    /// Returns previously-allocated values for reuse. The caller must not
    /// have committed any persisted write referring to them. Returned in
    /// LIFO order by subsequent `Next()` calls.
    pub fn put_back(&self, vals: impl IntoIterator<Item = i64>) -> CResult<()> {
        let mut st = self.state.lock()?;
        st.putbacks.extend(vals);
        Ok(())
    }

    /// Writes `next` back as the authoritative persisted value, so a clean
    /// shutdown doesn't leave unused lease values as permanent gaps.
    pub fn release_remaining(&self) -> CResult<()> {
        let mut st = self.state.lock()?;
        if st.next == st.leased {
            return Ok(());
        }
        let next = st.next;
        let txn = Transaction::begin(self.engine.clone())?;
        self.write_persisted(&txn, next)?;
        txn.commit()?;
        st.leased = next;
        Ok(())
    }

    /// Deletes the persisted cell and resets in-memory state to zero.
    pub fn clear(&self) -> CResult<()> {
        let txn = Transaction::begin(self.engine.clone())?;
        self.clear_persisted(&txn)?;
        txn.commit()?;

        let mut st = self.state.lock()?;
        st.next = 0;
        st.leased = 0;
        st.putbacks.clear();
        Ok(())
    }

    /// Marks the sequence closed; optionally releases the unused lease tail.
    pub fn close(&self, release_remaining: bool) -> CResult<()> {
        if release_remaining {
            self.release_remaining()?;
        }
        self.state.lock()?.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::Memory;

    fn new_engine() -> Arc<Mutex<Memory>> {
        Arc::new(Mutex::new(Memory::new()))
    }

    #[test]
    fn next_is_monotonic_across_lease_boundaries() {
        let seq = Sequence::new_string(new_engine(), "doc", 2).unwrap();
        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.push(seq.next().unwrap());
        }
        for w in seen.windows(2) {
            assert!(w[1] > w[0]);
        }
    }

    #[test]
    fn put_back_values_are_reused_lifo() {
        let seq = Sequence::new_string(new_engine(), "doc", 10).unwrap();
        let a = seq.next().unwrap();
        let b = seq.next().unwrap();
        seq.put_back([a, b]).unwrap();
        assert_eq!(seq.next().unwrap(), b);
        assert_eq!(seq.next().unwrap(), a);
    }

    #[test]
    fn next_n_splits_across_lease_renewal() {
        let seq = Sequence::new_string(new_engine(), "doc", 3).unwrap();
        assert_eq!(seq.next().unwrap(), 1);
        assert_eq!(seq.next().unwrap(), 2);
        // only one value remains in the current lease; requesting 5 must
        // span a renewal and come back as two contiguous ranges.
        let ranges = seq.next_n(5).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0], Range { start: 3, end: 4 });
        assert_eq!(ranges[1].start, 4);
        assert_eq!(ranges[1].end - ranges[1].start, 4);
    }

    #[test]
    fn next_n_single_range_when_lease_has_room() {
        let seq = Sequence::new_string(new_engine(), "doc", 100).unwrap();
        let ranges = seq.next_n(5).unwrap();
        assert_eq!(ranges, vec![Range { start: 1, end: 6 }]);
    }

    #[test]
    fn close_rejects_further_next_calls() {
        let seq = Sequence::new_string(new_engine(), "doc", 10).unwrap();
        seq.next().unwrap();
        seq.close(true).unwrap();
        assert!(matches!(seq.next(), Err(Error::SequenceClosed)));
    }

    #[test]
    fn release_remaining_persists_next_not_leased() {
        let engine = new_engine();
        let seq = Sequence::new_string(engine.clone(), "doc", 10).unwrap();
        seq.next().unwrap();
        seq.release_remaining().unwrap();

        let seq2 = Sequence::new_string(engine, "doc", 10).unwrap();
        assert_eq!(seq2.next().unwrap(), 2);
    }

    #[test]
    fn hash_sequence_rejects_empty_key_or_field() {
        assert!(matches!(
            Sequence::new_hash(new_engine(), Vec::new(), b"f".to_vec(), 10),
            Err(Error::EmptyKeyForHashSequence)
        ));
        assert!(matches!(
            Sequence::new_hash(new_engine(), b"k".to_vec(), Vec::new(), 10),
            Err(Error::EmptyFieldForHashSequence)
        ));
    }

    #[test]
    fn zero_bandwidth_rejected() {
        assert!(matches!(
            Sequence::new_string(new_engine(), "doc", 0),
            Err(Error::ZeroBandwidth)
        ));
    }
}
