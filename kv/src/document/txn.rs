//! DML transaction (component C9): wraps a KV transaction, pins the schema
//! cache snapshot taken at `start`, and records the collections referred to
//! and the cancellation hooks to run if the commit fails.

use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::Arc;
use crate::document::cache::MetaCache;
use crate::document::handle::SchemaHandle;
use crate::error::{CResult, Error};
use crate::mvcc::transaction::{Transaction, TransactionDef};
use crate::storage::engine::Engine;

type CancelFunc = Box<dyn FnOnce() + Send>;

pub struct Txn<E: Engine> {
    pub(crate) inner: Transaction<E>,
    schema: Arc<SchemaHandle>,
    start_cache: Arc<MetaCache>,
    referred_collections: RefCell<HashSet<u64>>,
    cancel_funcs: RefCell<Vec<CancelFunc>>,
}

impl<E: Engine> Txn<E> {
    pub(crate) fn begin(engine: std::sync::Arc<std::sync::Mutex<E>>, schema: Arc<SchemaHandle>) -> CResult<Self> {
        let inner = Transaction::begin(engine)?;
        let start_cache = schema.get()?;
        Ok(Self {
            inner,
            schema,
            start_cache,
            referred_collections: RefCell::new(HashSet::new()),
            cancel_funcs: RefCell::new(Vec::new()),
        })
    }

    pub(crate) fn begin_with_max_writes(
        engine: std::sync::Arc<std::sync::Mutex<E>>,
        schema: Arc<SchemaHandle>,
        max_writes: u64,
    ) -> CResult<Self> {
        let inner = Transaction::begin_with_max_writes(engine, max_writes)?;
        let start_cache = schema.get()?;
        Ok(Self {
            inner,
            schema,
            start_cache,
            referred_collections: RefCell::new(HashSet::new()),
            cancel_funcs: RefCell::new(Vec::new()),
        })
    }

    pub(crate) fn begin_read_only(
        engine: std::sync::Arc<std::sync::Mutex<E>>,
        schema: Arc<SchemaHandle>,
    ) -> CResult<Self> {
        let inner = Transaction::begin_read_only(engine, None)?;
        let start_cache = schema.get()?;
        Ok(Self {
            inner,
            schema,
            start_cache,
            referred_collections: RefCell::new(HashSet::new()),
            cancel_funcs: RefCell::new(Vec::new()),
        })
    }

    pub fn start_cache(&self) -> &Arc<MetaCache> {
        &self.start_cache
    }

    pub fn inner(&self) -> &Transaction<E> {
        &self.inner
    }

    pub(crate) fn mark_referred(&self, cid: u64) {
        self.referred_collections.borrow_mut().insert(cid);
    }

    pub(crate) fn on_cancel(&self, f: impl FnOnce() + Send + 'static) {
        self.cancel_funcs.borrow_mut().push(Box::new(f));
    }

    fn run_cancel_funcs(&self) {
        let mut funcs = self.cancel_funcs.borrow_mut();
        while let Some(f) = funcs.pop() {
            f();
        }
    }

    /// Commits the underlying KV transaction after checking for concurrent
    /// DDL against every collection this transaction referred to.
    pub fn commit(self) -> CResult<()> {
        if self.inner.read_only() {
            return self.inner.commit();
        }
        self.schema.check(&self.start_cache, &self.referred_collections.borrow())?;
        match self.inner.commit() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.run_cancel_funcs();
                Err(e)
            }
        }
    }

    /// Always safe and idempotent.
    pub fn discard(self) -> CResult<()> {
        self.inner.rollback()
    }
}
