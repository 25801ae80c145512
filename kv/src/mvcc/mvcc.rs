//! This mod implements MVCC (Multi-Version Concurrency Control), a widely used method for ACID transactions and concurrency control.
//! It allows multiple concurrent transactions to access and modify the same dataset, isolates them from each other,
//! detects and handles conflicts, and commits their writes atomically as a single unit.
//! It uses an underlying storage engine to store raw keys and values.
//!
//!
//! VERSIONS
//! ========
//! MVCC handles concurrency control by managing multiple historical versions of keys, identified by a timestamp.
//! Every write adds a new version at a higher timestamp, with deletes having a special tombstone value.
//!
//! For example, the keys a,b,c,d may have the following values at various logical timestamps (x is tombstone):
//!
//! Time
//! 5
//! 4  a4
//! 3      b3      x
//! 2
//! 1  a1      c1  d1
//!    a   b   c   d   Keys
//!
//! * At time t1, a transaction writes a=a1,c=c1,d=d1 and commits it.
//! * At time t2, transaction T2 is started, will see the values a=a1, c=c1, d=d1.
//! * At t3, a transaction writes b=b3 and deletes D.
//! * At t4, a transaction writes a=a4.
//! * A different transaction t5 running at T=5 will see a=a4, b=b3, c=c1.
//!
//! KV Storage Engine uses logical timestamps with a sequence number stored in `Key::NextVersion`.
//! Each new read-write transaction takes its timestamp from the current value of `Key::NextVersion`
//! and then increments the value for the next transaction.
//!
//!
//! ISOLATION
//! =========
//! MVCC provides an isolation level called snapshot isolation.
//! Briefly, transactions see a consistent snapshot of the database state as of their start time.
//! Writes made by concurrent or subsequent transactions are never visible to it.
//! If two concurrent transactions write to the same key they will conflict and one of them must retry.
//! A transaction's writes become atomically visible to subsequent transactions only when they commit,
//! and are rolled back on failure.
//! Read-only transactions never conflict with other transactions.
//!
//! Transactions write new versions at their timestamp, storing them as `Key::Version(key, version) => value`.
//! If a transaction writes to a key and finds a newer version, it returns an error and the client must retry.
//!
//! Active (uncommitted) read-write transactions record their version in the active set,
//! stored as `Key::TxnActive(version)`.
//! When new transactions begin, they take a snapshot of this active set,
//! and any key versions that belong to a transaction in the active set are considered `invisible` (to anyone except that transaction itself).
//! Writes to keys that already have a past version in the active set will also return an error.
//!
//! To commit, a transaction simply deletes its record in the active set.
//! This will immediately (and, crucially, atomically) make all of its writes visible to subsequent transactions,
//! but not ongoing ones.
//!
//! mvcc:
//!   Writers don't block readers.
//!   Readers don't block writers.

use std::borrow::Cow;
use std::sync::{Arc, Mutex};
use serde_derive::{Deserialize, Serialize};
use crate::codec::memcmp;
use crate::error::{CResult, Error};
use crate::mvcc::transaction::{Transaction, TransactionDef, TransactionState};
use crate::mvcc::Version;
use crate::storage::engine::Engine;

/// An MVCC-based transactional key-value engine.
/// It wraps an underlying storage engine that's used for raw key/value storage.
pub struct MVCC<E: Engine> {
    engine: Arc<Mutex<E>>,
}

pub trait MVCCDef<E: Engine> {
    fn new(engine: E) -> MVCC<E>;

    fn begin(&self) -> CResult<Transaction<E>>;

    fn begin_read_only(&self) -> CResult<Transaction<E>>;

    fn resume(&self, state: TransactionState) -> CResult<Transaction<E>>;

    fn status(&self) -> CResult<Status>;
}

/// MVCC keys. Every variant starts with a 1-byte tag (memory-comparable),
/// so keys of different variants never compare equal, and within a variant
/// the remaining fields use the memory-comparable codec so range scans
/// (over versions, or over the active-transaction set) come back in the
/// right order.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub enum Key<'a> {
    /// The next available version.
    NextVersion,

    /// Active (uncommitted) transactions by version.
    TxnActive(Version),

    /// `A snapshot of the active set` at each version.
    /// Only written for versions where the active set is non-empty (excluding itself).
    TxnActiveSnapshot(Version),

    /// Keeps track of all keys written to by an active transaction (identified by its version), in case it needs to roll back.
    TxnWrite(Version, Cow<'a, [u8]>),

    /// A versioned key/value pair.
    Version(Cow<'a, [u8]>, Version),

    /// Unversioned non-transactional key/value pairs.
    /// These exist separately from versioned keys, i.e. the unversioned key "abcdefg" is entirely independent of the versioned key "abcdefg@7".
    /// These are mostly used for metadata.
    Unversioned(Cow<'a, [u8]>),
}

const TAG_NEXT_VERSION: u8 = 0;
const TAG_TXN_ACTIVE: u8 = 1;
const TAG_TXN_ACTIVE_SNAPSHOT: u8 = 2;
const TAG_TXN_WRITE: u8 = 3;
const TAG_VERSION: u8 = 4;
const TAG_UNVERSIONED: u8 = 5;

impl<'a> Key<'a> {
    /// `Version` and `TxnWrite` carry one variable-length raw key alongside a
    /// fixed-width 8-byte version. Rather than group-encode the raw key (which
    /// would break plain byte-prefix scans over it), it's concatenated as-is,
    /// with the version kept at a fixed offset from one end so it can always
    /// be split off unambiguously: trailing for `Version`, leading for
    /// `TxnWrite`. The document layer relies on this for prefix scans over
    /// raw collection/document keys.
    pub fn decode(bytes: &'a [u8]) -> CResult<Self> {
        let (tag, rest) = memcmp::decode_u8(bytes)?;
        Ok(match tag {
            TAG_NEXT_VERSION => Key::NextVersion,
            TAG_TXN_ACTIVE => {
                let (version, _) = memcmp::decode_u64(rest)?;
                Key::TxnActive(version)
            }
            TAG_TXN_ACTIVE_SNAPSHOT => {
                let (version, _) = memcmp::decode_u64(rest)?;
                Key::TxnActiveSnapshot(version)
            }
            TAG_TXN_WRITE => {
                let (version, key) = memcmp::decode_u64(rest)?;
                Key::TxnWrite(version, Cow::Borrowed(key))
            }
            TAG_VERSION => {
                if rest.len() < 8 {
                    return Err(Error::InsufficientBytes);
                }
                let (key, version_bytes) = rest.split_at(rest.len() - 8);
                let (version, _) = memcmp::decode_u64(version_bytes)?;
                Key::Version(Cow::Borrowed(key), version)
            }
            TAG_UNVERSIONED => Key::Unversioned(Cow::Borrowed(rest)),
            other => {
                return Err(Error::CodecCorrupt(format!("unknown mvcc key tag {}", other)))
            }
        })
    }

    pub fn encode(&self) -> CResult<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Key::NextVersion => memcmp::encode_u8(&mut buf, TAG_NEXT_VERSION),
            Key::TxnActive(version) => {
                memcmp::encode_u8(&mut buf, TAG_TXN_ACTIVE);
                memcmp::encode_u64(&mut buf, *version);
            }
            Key::TxnActiveSnapshot(version) => {
                memcmp::encode_u8(&mut buf, TAG_TXN_ACTIVE_SNAPSHOT);
                memcmp::encode_u64(&mut buf, *version);
            }
            Key::TxnWrite(version, key) => {
                memcmp::encode_u8(&mut buf, TAG_TXN_WRITE);
                memcmp::encode_u64(&mut buf, *version);
                buf.extend_from_slice(key);
            }
            Key::Version(key, version) => {
                memcmp::encode_u8(&mut buf, TAG_VERSION);
                buf.extend_from_slice(key);
                memcmp::encode_u64(&mut buf, *version);
            }
            Key::Unversioned(key) => {
                memcmp::encode_u8(&mut buf, TAG_UNVERSIONED);
                buf.extend_from_slice(key);
            }
        }
        Ok(buf)
    }
}

/// MVCC key prefixes, for prefix scans. These must match the keys above, including the enum variant index.
pub(crate) enum KeyPrefix<'a> {
    NextVersion,
    TxnActive,
    TxnActiveSnapshot,
    TxnWrite(Version),
    Version(Cow<'a, [u8]>),
    Unversioned,
}

impl<'a> KeyPrefix<'a> {
    pub(crate) fn encode(&self) -> CResult<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            KeyPrefix::NextVersion => memcmp::encode_u8(&mut buf, TAG_NEXT_VERSION),
            KeyPrefix::TxnActive => memcmp::encode_u8(&mut buf, TAG_TXN_ACTIVE),
            KeyPrefix::TxnActiveSnapshot => memcmp::encode_u8(&mut buf, TAG_TXN_ACTIVE_SNAPSHOT),
            KeyPrefix::TxnWrite(version) => {
                memcmp::encode_u8(&mut buf, TAG_TXN_WRITE);
                memcmp::encode_u64(&mut buf, *version);
            }
            KeyPrefix::Version(key) => {
                // Must match `Key::Version`'s raw (non-group-encoded) key
                // layout exactly, or this prefix would never actually match
                // the keys it's meant to bound.
                memcmp::encode_u8(&mut buf, TAG_VERSION);
                buf.extend_from_slice(key);
            }
            KeyPrefix::Unversioned => memcmp::encode_u8(&mut buf, TAG_UNVERSIONED),
        }
        Ok(buf)
    }
}

impl<E: Engine> MVCCDef<E> for MVCC<E> {
    fn new(engine: E) -> MVCC<E> {
        MVCC { engine: Arc::new(Mutex::new(engine)) }
    }

    fn begin(&self) -> CResult<Transaction<E>> {
        Transaction::begin(self.engine.clone())
    }

    fn begin_read_only(&self) -> CResult<Transaction<E>> {
        Transaction::begin_read_only(self.engine.clone(), None)
    }

    fn resume(&self, state: TransactionState) -> CResult<Transaction<E>> {
        Transaction::resume(self.engine.clone(), state)
    }

    fn status(&self) -> CResult<Status> {
        let mut session = self.engine.lock()?;
        let versions = match session.get(&Key::NextVersion.encode()?)? {
            Some(ref v) => bincode::deserialize::<Version>(v)? - 1,
            None => 0,
        };
        let active_txns = session.scan_prefix(&KeyPrefix::TxnActive.encode()?).count() as u64;
        Ok(Status { versions, active_txns, storage: session.status()? })
    }
}

impl<E: Engine> Clone for MVCC<E> {
    fn clone(&self) -> Self {
        MVCC { engine: self.engine.clone() }
    }
}

/// MVCC engine status.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    /// The total number of MVCC versions (i.e.  read-write transactions).
    pub versions: u64,
    /// Number of currently active transactions.
    pub active_txns: u64,
    /// The storage engine.
    pub storage: super::super::storage::Status,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_roundtrip() {
        for key in [
            Key::NextVersion,
            Key::TxnActive(7),
            Key::TxnActiveSnapshot(7),
            Key::TxnWrite(3, Cow::Borrowed(b"foo".as_slice())),
            Key::Version(Cow::Borrowed(b"foo".as_slice()), 3),
            Key::Unversioned(Cow::Borrowed(b"foo".as_slice())),
        ] {
            let encoded = key.encode().unwrap();
            let decoded = Key::decode(&encoded).unwrap();
            assert_eq!(format!("{:?}", key), format!("{:?}", decoded));
        }
    }

    #[test]
    fn version_keys_sort_by_key_then_version() {
        let a = Key::Version(Cow::Borrowed(b"a".as_slice()), 5).encode().unwrap();
        let b = Key::Version(Cow::Borrowed(b"a".as_slice()), 9).encode().unwrap();
        let c = Key::Version(Cow::Borrowed(b"b".as_slice()), 1).encode().unwrap();
        assert!(a < b);
        assert!(b < c);
    }
}
