use std::borrow::Cow;
use std::collections::Bound;
use std::sync::MutexGuard;
use crate::error::CResult;
use crate::mvcc::mvcc::{Key, KeyPrefix};
use crate::mvcc::transaction::TransactionState;
use crate::mvcc::Version;
use crate::storage::engine::Engine;

/// A scan result. Can produce an iterator or collect an owned Vec.
///
/// This intermediate struct is unfortunately needed to hold the MutexGuard for the scan() caller,
/// since placing it in ScanIterator along with the inner iterator borrowing from it would create a self-referential struct.
pub struct Scan<'a, E: Engine + 'a> {
    /// Access to the locked engine.
    engine: MutexGuard<'a, E>,

    /// The transaction state.
    txn: &'a TransactionState,

    /// The scan type and parameter.
    param: ScanType,
}

enum ScanType {
    Range((Bound<Vec<u8>>, Bound<Vec<u8>>)),
    Prefix(Vec<u8>),
}

impl<'a, E: Engine + 'a> Scan<'a, E> {
    pub(crate) fn new(
        engine: MutexGuard<'a, E>,
        txn: &'a TransactionState,
        range: (Bound<Vec<u8>>, Bound<Vec<u8>>),
    ) -> Self {
        Self { engine, txn, param: ScanType::Range(range) }
    }

    /// Creates a new prefix scan.
    pub(crate) fn new_prefix(engine: MutexGuard<'a, E>, txn: &'a TransactionState, prefix: Vec<u8>) -> Self {
        Self { engine, txn, param: ScanType::Prefix(prefix) }
    }

    /// Translates the caller's range over raw (unversioned) keys into the
    /// corresponding range over `Key::Version(key, version)`-encoded engine
    /// keys: every version of every key in the caller's range, bounded so
    /// the scan never spills into an adjacent MVCC key variant.
    fn encode_bounds(&self) -> CResult<(Bound<Vec<u8>>, Bound<Vec<u8>>)> {
        Ok(match &self.param {
            ScanType::Range((start, end)) => {
                let start = match start {
                    Bound::Included(k) => Bound::Included(Key::Version(Cow::Borrowed(k), 0).encode()?),
                    Bound::Excluded(k) => {
                        Bound::Excluded(Key::Version(Cow::Borrowed(k), Version::MAX).encode()?)
                    }
                    Bound::Unbounded => Bound::Included(KeyPrefix::Version(Cow::Borrowed(&[])).encode()?),
                };
                let end = match end {
                    Bound::Included(k) => {
                        Bound::Included(Key::Version(Cow::Borrowed(k), Version::MAX).encode()?)
                    }
                    Bound::Excluded(k) => Bound::Excluded(Key::Version(Cow::Borrowed(k), 0).encode()?),
                    Bound::Unbounded => Bound::Excluded(KeyPrefix::Unversioned.encode()?),
                };
                (start, end)
            }
            ScanType::Prefix(prefix) => {
                let start = Bound::Included(KeyPrefix::Version(Cow::Borrowed(prefix)).encode()?);
                let end = match prefix.iter().rposition(|b| *b != 0xff) {
                    Some(i) => {
                        let mut bumped = prefix[..i].to_vec();
                        bumped.push(prefix[i] + 1);
                        Bound::Excluded(KeyPrefix::Version(Cow::Owned(bumped)).encode()?)
                    }
                    // Every byte is 0xff: there's no next sibling prefix, so the
                    // range runs to the end of the Version keyspace.
                    None => Bound::Excluded(KeyPrefix::Unversioned.encode()?),
                };
                (start, end)
            }
        })
    }

    /// Runs the scan, returning a double-ended iterator over the latest
    /// visible (key, value) pairs, with tombstones already filtered out.
    pub fn scan(&mut self) -> CResult<ScanIterator<'_, E>> {
        let bounds = self.encode_bounds()?;
        let inner = self.engine.scan(bounds);
        Ok(ScanIterator::new(self.txn, inner))
    }
}

/// An iterator over the latest live and visible key/value pairs at the txn
/// version.
pub struct ScanIterator<'a, E: Engine + 'a> {
    /// Decodes and filters visible MVCC versions from the inner engine iterator.
    inner: std::iter::Peekable<VersionIterator<'a, E>>,

    /// Dedup state is tracked separately per direction: `next()` and
    /// `next_back()` consume from opposite ends of the same underlying
    /// iterator and must not clobber each other's "last key seen" marker.
    last_fwd: Option<Vec<u8>>,
    last_back: Option<Vec<u8>>,
}

impl<'a, E: Engine + 'a> ScanIterator<'a, E> {
    fn new(txn: &'a TransactionState, inner: E::ScanIterator<'a>) -> Self {
        Self {
            inner: VersionIterator::new(txn, inner).peekable(),
            last_fwd: None,
            last_back: None,
        }
    }

    /// Fallible next(), emitting the next item, or None if exhausted.
    ///
    /// Versions of a given key ascend, so the *last* version seen before the
    /// key changes is the most recent one visible to this transaction.
    fn try_next(&mut self) -> CResult<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            let (key, _version, mut value) = match self.inner.next() {
                Some(item) => item?,
                None => return Ok(None),
            };
            if self.last_back.as_deref() == Some(&key) {
                continue;
            }
            while let Some(Ok((next_key, _, _))) = self.inner.peek() {
                if next_key != &key {
                    break;
                }
                let (_, _, next_value) = self.inner.next().unwrap()?;
                value = next_value;
            }
            self.last_fwd = Some(key.clone());
            if let Some(value) = deserialize_value(value)? {
                return Ok(Some((key, value)));
            }
            // Tombstone: keep scanning forward for the next live key.
        }
    }

    /// Fallible next_back(), emitting the next item from the back, or None if exhausted.
    ///
    /// Walking backward visits the highest (most recent) version of a key
    /// first, so the first occurrence per key is already the right one.
    fn try_next_back(&mut self) -> CResult<Option<(Vec<u8>, Vec<u8>)>> {
        loop {
            let (key, _version, value) = match self.inner.next_back() {
                Some(item) => item?,
                None => return Ok(None),
            };
            if self.last_fwd.as_deref() == Some(&key) || self.last_back.as_deref() == Some(&key) {
                continue;
            }
            self.last_back = Some(key.clone());
            if let Some(value) = deserialize_value(value)? {
                return Ok(Some((key, value)));
            }
            // Tombstone: keep scanning backward for the next live key.
        }
    }
}

fn deserialize_value(raw: Vec<u8>) -> CResult<Option<Vec<u8>>> {
    Ok(bincode::deserialize(&raw)?)
}

impl<'a, E: Engine> Iterator for ScanIterator<'a, E> {
    type Item = CResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.try_next().transpose()
    }
}

impl<'a, E: Engine> DoubleEndedIterator for ScanIterator<'a, E> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.try_next_back().transpose()
    }
}

/// An iterator that decodes raw engine key/value pairs into MVCC key/value versions, and skips invisible versions. Helper for ScanIterator.
struct VersionIterator<'a, E: Engine + 'a> {
    /// The transaction the scan is running in.
    txn: &'a TransactionState,

    /// The inner engine scan iterator.
    inner: E::ScanIterator<'a>,
}

impl<'a, E: Engine> VersionIterator<'a, E> {
    fn new(txn: &'a TransactionState, inner: E::ScanIterator<'a>) -> Self {
        Self { txn, inner }
    }

    /// Fallible next(), emitting the next item, or None if exhausted.
    fn try_next(&mut self) -> CResult<Option<(Vec<u8>, Version, Vec<u8>)>> {
        while let Some(item) = self.inner.next() {
            let (k, v) = item?;
            let (key, version) = match Key::decode(&k)? {
                Key::Version(key, version) => (key.into_owned(), version),
                _ => return Err(crate::error::Error::Internal("expected Version key".into())),
            };
            if self.txn.is_visible(version) {
                return Ok(Some((key, version, v)));
            }
        }
        Ok(None)
    }

    /// Fallible next_back(), emitting the previous item, or None if exhausted.
    fn try_next_back(&mut self) -> CResult<Option<(Vec<u8>, Version, Vec<u8>)>> {
        while let Some(item) = self.inner.next_back() {
            let (k, v) = item?;
            let (key, version) = match Key::decode(&k)? {
                Key::Version(key, version) => (key.into_owned(), version),
                _ => return Err(crate::error::Error::Internal("expected Version key".into())),
            };
            if self.txn.is_visible(version) {
                return Ok(Some((key, version, v)));
            }
        }
        Ok(None)
    }
}

impl<'a, E: Engine> Iterator for VersionIterator<'a, E> {
    type Item = CResult<(Vec<u8>, Version, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.try_next().transpose()
    }
}

impl<'a, E: Engine> DoubleEndedIterator for VersionIterator<'a, E> {
    fn next_back(&mut self) -> Option<Self::Item> {
        self.try_next_back().transpose()
    }
}
