use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use serde_derive::{Deserialize, Serialize};
use crate::error::{CResult, Error};
use crate::mvcc::mvcc::{Key, KeyPrefix};
use crate::mvcc::scan::Scan;
use crate::mvcc::Version;
use crate::storage::engine::Engine;

/// An MVCC transaction.
pub struct Transaction<E: Engine> {
    /// The underlying engine, shared by all transactions.
    engine: Arc<Mutex<E>>,

    /// The transaction state.
    st: TransactionState,

    /// Write budget; see `WriteBudget`. Interior-mutable since writes go
    /// through `&self`.
    budget: Mutex<WriteBudget>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionState {
    /// The version this transaction is running at.
    /// Only one read-write transaction can run at a given version, since this identifies its writes.
    pub version: Version,

    /// If true, the transaction is read only.
    pub read_only: bool,

    /// The set of concurrent active (uncommitted) transactions, as of the start of this transaction.
    /// Their writes should be invisible to this transaction even if they're writing at a lower version,
    /// since they're not committed yet.
    pub active: HashSet<Version>,
}

/// Per-transaction write budget: once a transaction has issued `max_writes`
/// `set`/`delete` calls, further writes fail with `TxnTooBig` rather than
/// growing an unbounded commit. `None` (the default for `begin`) means
/// unlimited, matching the underlying engine's actual behavior; callers that
/// want a bounded, retry-on-overflow transaction opt in via
/// `begin_with_max_writes`.
#[derive(Clone, Copy, Debug, Default)]
struct WriteBudget {
    max_writes: Option<u64>,
    used: u64,
}

impl TransactionState {
    /// Checks whether the given version is visible to this transaction.
    ///
    /// Future versions, and active versions excluding the transaction's own
    /// version, are never isible.
    pub(crate) fn is_visible(&self, version: Version) -> bool {
        if self.active.contains(&version) {
            version == self.version
        } else {
            version <= self.version
        }
    }
}

pub trait TransactionDef<E: Engine> {
    fn begin(engine: Arc<Mutex<E>>) -> CResult<Transaction<E>>;

    fn begin_read_only(engine: Arc<Mutex<E>>, as_of: Option<Version>) -> CResult<Transaction<E>>;

    fn resume(engine: Arc<Mutex<E>>, state: TransactionState) -> CResult<Transaction<E>>;
}

impl<E: Engine> TransactionDef<E> for Transaction<E> {
    /// Begins a new read-write transaction.
    fn begin(engine: Arc<Mutex<E>>) -> CResult<Transaction<E>> {
        let mut session = engine.lock()?;

        let version = match session.get(&Key::NextVersion.encode()?)? {
            Some(ref v) => bincode::deserialize(v)?,
            None => 1,
        };
        session.set(&Key::NextVersion.encode()?, bincode::serialize(&(version + 1))?)?;

        let active = Self::scan_active(&mut session)?;
        if !active.is_empty() {
            session.set(&Key::TxnActiveSnapshot(version).encode()?, bincode::serialize(&active)?)?;
        }

        session.set(&Key::TxnActive(version).encode()?, vec![])?;
        drop(session);

        Ok(Self { engine, st: TransactionState { version, read_only: false, active }, budget: Mutex::new(WriteBudget::default()) })
    }

    /// Begins a new read-only transaction. If `as_of` is given, the transaction
    /// can read historical data as of the given version, as long as it's not
    /// still active.
    fn begin_read_only(engine: Arc<Mutex<E>>, as_of: Option<Version>) -> CResult<Transaction<E>> {
        let mut session = engine.lock()?;

        let mut version = match session.get(&Key::NextVersion.encode()?)? {
            Some(ref v) => bincode::deserialize(v)?,
            None => 1,
        };
        let mut active = HashSet::new();

        if let Some(as_of) = as_of {
            if as_of >= version {
                return Err(Error::Internal(format!(
                    "version {} does not exist yet (next version is {})",
                    as_of, version
                )));
            }
            version = as_of;
            if let Some(ref v) = session.get(&Key::TxnActiveSnapshot(version).encode()?)? {
                active = bincode::deserialize(v)?;
            }
        } else {
            active = Self::scan_active(&mut session)?;
        }

        drop(session);

        Ok(Self { engine, st: TransactionState { version, read_only: true, active }, budget: Mutex::new(WriteBudget::default()) })
    }

    /// Resumes a transaction from the given state.
    fn resume(engine: Arc<Mutex<E>>, state: TransactionState) -> CResult<Transaction<E>> {
        if !state.read_only {
            let mut session = engine.lock()?;
            if session.get(&Key::TxnActive(state.version).encode()?)?.is_none() {
                return Err(Error::Internal(format!(
                    "no active transaction at version {}",
                    state.version
                )));
            }
        }
        Ok(Self { engine, st: state, budget: Mutex::new(WriteBudget::default()) })
    }
}

impl<E: Engine> Transaction<E> {
    /// Begins a read-write transaction that fails its writes with
    /// `TxnTooBig` once more than `max_writes` `set`/`delete` calls have
    /// been issued against it. Used by the DML layer's `DeleteAll` helper to
    /// bound how much a single transaction commits at once.
    pub fn begin_with_max_writes(engine: Arc<Mutex<E>>, max_writes: u64) -> CResult<Transaction<E>> {
        let txn = Self::begin(engine)?;
        txn.budget.lock()?.max_writes = Some(max_writes);
        Ok(txn)
    }

    /// Returns the version the transaction is running at.
    pub fn version(&self) -> Version {
        self.st.version
    }

    /// Returns whether the transaction is read-only.
    pub fn read_only(&self) -> bool {
        self.st.read_only
    }

    /// Returns the transaction's state, for resuming it later.
    pub fn state(&self) -> &TransactionState {
        &self.st
    }

    /// Fetches the set of currently active transactions.
    fn scan_active(session: &mut std::sync::MutexGuard<E>) -> CResult<HashSet<Version>> {
        let mut active = HashSet::new();
        let mut scan = session.scan_prefix(&KeyPrefix::TxnActive.encode()?);
        while let Some(item) = scan.next() {
            let (key, _) = item?;
            match Key::decode(&key)? {
                Key::TxnActive(version) => active.insert(version),
                _ => return Err(Error::Internal("expected TxnActive key".into())),
            };
        }
        Ok(active)
    }

    /// Commits the transaction, making its writes visible to others.
    pub fn commit(self) -> CResult<()> {
        if self.st.read_only {
            return Ok(());
        }
        let mut session = self.engine.lock()?;
        let remove: Vec<Vec<u8>> = session
            .scan_prefix(&KeyPrefix::TxnWrite(self.st.version).encode()?)
            .map(|r| r.map(|(k, _)| k))
            .collect::<CResult<_>>()?;
        for key in remove {
            session.delete(&key)?;
        }
        session.delete(&Key::TxnActive(self.st.version).encode()?)?;
        session.flush()
    }

    /// Rolls back the transaction, discarding any writes it made.
    pub fn rollback(self) -> CResult<()> {
        if self.st.read_only {
            return Ok(());
        }
        let mut session = self.engine.lock()?;
        let mut rollback: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut scan = session.scan_prefix(&KeyPrefix::TxnWrite(self.st.version).encode()?);
        while let Some(item) = scan.next() {
            let (txn_write_key, _) = item?;
            let raw_key = match Key::decode(&txn_write_key)? {
                Key::TxnWrite(_, raw) => raw.into_owned(),
                _ => return Err(Error::Internal("expected TxnWrite key".into())),
            };
            rollback.push((txn_write_key, raw_key));
        }
        drop(scan);
        for (txn_write_key, raw_key) in rollback {
            session.delete(&Key::Version(Cow::Owned(raw_key), self.st.version).encode()?)?;
            session.delete(&txn_write_key)?;
        }
        session.delete(&Key::TxnActive(self.st.version).encode()?)?;
        session.flush()
    }

    /// Deletes a key.
    pub fn delete(&self, key: &[u8]) -> CResult<()> {
        self.write_version(key, None)
    }

    /// Sets a value for a key.
    pub fn set(&self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        self.write_version(key, Some(value))
    }

    /// Writes a new version for a key, or None for a deletion (tombstone).
    /// Checks that there's no conflicting write, i.e. a newer committed or
    /// active version, or a version from a concurrent active transaction.
    fn write_version(&self, key: &[u8], value: Option<Vec<u8>>) -> CResult<()> {
        if self.st.read_only {
            return Err(Error::MutateForReadonlyTxn);
        }
        {
            let mut budget = self.budget.lock()?;
            if let Some(max) = budget.max_writes {
                if budget.used >= max {
                    return Err(Error::TxnTooBig);
                }
            }
            budget.used += 1;
        }
        let mut session = self.engine.lock()?;

        // Check for write conflicts: if the oldest version that could still
        // be invisible to us (the lowest currently-active version, or our own
        // version+1 if none are active) already has a write, and that write
        // isn't visible to us, somebody else raced us and we must retry.
        let min = self.st.active.iter().min().copied().unwrap_or(self.st.version + 1);
        let from = Key::Version(Cow::Borrowed(key), min).encode()?;
        let to = Key::Version(Cow::Borrowed(key), u64::MAX).encode()?;
        if let Some((k, _)) = session.scan(from..=to).next().transpose()? {
            if let Key::Version(_, version) = Key::decode(&k)? {
                if !self.st.is_visible(version) {
                    return Err(Error::Internal("serialization failure, retry transaction".into()));
                }
            }
        }

        session.set(
            &Key::TxnWrite(self.st.version, Cow::Borrowed(key)).encode()?,
            vec![],
        )?;
        session.set(
            &Key::Version(Cow::Borrowed(key), self.st.version).encode()?,
            bincode::serialize(&value)?,
        )?;
        Ok(())
    }

    /// Fetches a key's value, or None if it does not exist.
    pub fn get(&self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        let mut session = self.engine.lock()?;
        let from = Key::Version(Cow::Borrowed(key), 0).encode()?;
        let to = Key::Version(Cow::Borrowed(key), self.st.version).encode()?;
        let mut scan = session.scan(from..=to);
        while let Some(item) = scan.next_back() {
            let (k, v) = item?;
            if let Key::Version(_, version) = Key::decode(&k)? {
                if self.st.is_visible(version) {
                    return Ok(bincode::deserialize(&v)?);
                }
            }
        }
        Ok(None)
    }

    /// Iterates over the latest visible key/value pairs in the given range.
    pub fn scan(
        &self,
        range: (std::ops::Bound<Vec<u8>>, std::ops::Bound<Vec<u8>>),
    ) -> CResult<Scan<E>> {
        Ok(Scan::new(self.engine.lock()?, &self.st, range))
    }

    /// Iterates over the latest visible key/value pairs with the given prefix.
    pub fn scan_prefix(&self, prefix: &[u8]) -> CResult<Scan<E>> {
        Ok(Scan::new_prefix(self.engine.lock()?, &self.st, prefix.to_vec()))
    }
}
