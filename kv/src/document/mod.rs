//! Document engine: turns the `storage`/`mvcc` KV substrate into a
//! transactional, schema-versioned document database (components C1-C10 of
//! the component design).
//!
//! `Store` is the top-level handle a host embeds: it owns the meta store,
//! the DDL engine and its background workers, and the schema cache, and
//! hands out `DocTxn`s that DML collection operations run against.

pub mod cache;
pub mod collection;
pub mod ddl;
pub mod handle;
pub mod keys;
pub mod meta;
pub mod sequence;
pub mod structure;
pub mod txn;
pub mod types;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::document::cache::MetaCache;
use crate::document::collection::CollectionOps;
use crate::document::ddl::{AddIndexInput, CreateSchemaInput, DdlConfig, DdlEngine};
use crate::document::handle::SchemaHandle;
use crate::document::meta::{MetaStore, SharedMetaStore};
use crate::document::sequence::{Sequence, DEFAULT_DOCUMENT_ID_BANDWIDTH};
use crate::document::types::DBInfo;
use crate::error::{CResult, Error};
use crate::mvcc::transaction::{Transaction, TransactionDef};
use crate::storage::engine::Engine;
pub use crate::document::txn::Txn as DocTxn;

fn autoincrement_field(cid: u64) -> Vec<u8> {
    format!("autoincr:{}", cid).into_bytes()
}

fn collections_hash_key(db_id: u64) -> Vec<u8> {
    // Mirrors `document::meta`'s private helper of the same name: the
    // per-database hash that document-ID sequences are parked under, keyed
    // by `(db-key, cid-field)`. Bare (no `META` prefix) since `Sequence`
    // wraps every key in `StructuredKv::new(txn, META)` itself.
    format!("collections:{}", db_id).into_bytes()
}

/// Top-level handle owning the catalog, the DDL engine and its background
/// workers, the schema cache, and a cache of per-collection document-ID
/// sequences. One `Store` per KV engine instance.
pub struct Store<E: Engine + 'static> {
    engine: Arc<Mutex<E>>,
    meta: SharedMetaStore,
    schema: Arc<SchemaHandle>,
    ddl: Arc<DdlEngine<E>>,
    sequences: Mutex<HashMap<u64, Arc<Sequence<E>>>>,
}

impl<E: Engine + 'static> Store<E> {
    /// Opens a store over `engine`, bootstrapping the schema cache from
    /// whatever catalog already exists on disk (an empty catalog on first
    /// run, a full snapshot otherwise).
    pub fn open(engine: E, config: DdlConfig) -> CResult<Arc<Self>> {
        let engine = Arc::new(Mutex::new(engine));
        let meta: SharedMetaStore = Arc::new(MetaStore::new());

        let txn = Transaction::begin_read_only(engine.clone(), None)?;
        let version = meta.get_schema_version(&txn)?;
        let dbs = meta.list_databases(&txn)?;
        txn.rollback()?;

        let schema = Arc::new(SchemaHandle::new(MetaCache::new(version, dbs)));
        let ddl = DdlEngine::new(engine.clone(), meta.clone(), schema.clone(), config);

        Ok(Arc::new(Self { engine, meta, schema, ddl, sequences: Mutex::new(HashMap::new()) }))
    }

    pub fn schema(&self) -> &Arc<SchemaHandle> {
        &self.schema
    }

    /// Hands out the shared engine handle backing this store, so a host can
    /// also drive raw (non-document) transactions against the same
    /// underlying KV data — e.g. a raw-KV RPC surface operating below the
    /// document layer.
    pub fn engine(&self) -> Arc<Mutex<E>> {
        self.engine.clone()
    }

    /// Spawns a background reloader that keeps the schema cache current by
    /// periodically reading `schemaVersion` and diffs, as an alternative to
    /// the DDL worker's post-commit push. Useful on a replica that doesn't
    /// run the DDL worker locally; harmless to run alongside it too, since
    /// `apply_diffs`/`Update` are idempotent once caught up. `interval == 0`
    /// disables periodic reload.
    pub fn spawn_reloader(self: &Arc<Self>, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        let this = self.clone();
        std::thread::spawn(move || loop {
            std::thread::sleep(interval);
            if let Err(e) = this.reload_schema_once() {
                log::warn!("schema cache reload failed: {}", e);
            }
        });
    }

    fn reload_schema_once(&self) -> CResult<()> {
        let txn = Transaction::begin_read_only(self.engine.clone(), None)?;
        let latest_version = self.meta.get_schema_version(&txn)?;
        let current = self.schema.get()?;
        if latest_version == current.version {
            txn.rollback()?;
            return Ok(());
        }

        let first_needed = current.version + 1;
        if first_needed < current.diff_start_version() {
            // Too far behind the retained window: fall back to a full
            // snapshot reload instead of an incremental apply.
            let dbs = self.meta.list_databases(&txn)?;
            txn.rollback()?;
            self.schema.update(MetaCache::new(latest_version, dbs))?;
            return Ok(());
        }

        let mut diffs = Vec::new();
        for v in first_needed..=latest_version {
            match self.meta.get_schema_diff(&txn, v)? {
                Some(d) => diffs.push(d),
                None => {
                    let dbs = self.meta.list_databases(&txn)?;
                    txn.rollback()?;
                    self.schema.update(MetaCache::new(latest_version, dbs))?;
                    return Ok(());
                }
            }
        }
        txn.rollback()?;

        let mut next = (*current).clone();
        next.apply_diffs(&diffs)?;
        self.schema.update(next)?;
        Ok(())
    }

    pub fn create_schema(&self, input: CreateSchemaInput) -> CResult<()> {
        self.ddl.create_schema(input)
    }

    pub fn add_index(&self, input: AddIndexInput) -> CResult<()> {
        self.ddl.add_index(input)
    }

    /// Begins a read-write DML transaction pinned to the current schema
    /// cache snapshot.
    pub fn begin(self: &Arc<Self>) -> CResult<DocTxn<E>> {
        DocTxn::begin(self.engine.clone(), self.schema.clone())
    }

    pub fn begin_read_only(self: &Arc<Self>) -> CResult<DocTxn<E>> {
        DocTxn::begin_read_only(self.engine.clone(), self.schema.clone())
    }

    /// Looks up `(db, collection)` in the transaction's pinned snapshot and
    /// returns a bound `CollectionOps`, fetching or lazily creating the
    /// collection's document-ID sequence (a hash sequence parked in the
    /// per-database collections hash, keyed by the collection's
    /// autoincrement field).
    pub fn collection<'t>(&self, txn: &'t DocTxn<E>, db: &str, collection: &str) -> CResult<CollectionOps<'t, E>> {
        let info = txn
            .start_cache()
            .collection_info(db, collection)
            .cloned()
            .ok_or(Error::CollectionNotExists)?;
        let db_id = txn
            .start_cache()
            .dbs
            .get(db)
            .map(|d| d.id)
            .ok_or(Error::DbNotExists)?;
        let sequence = Some(self.collection_sequence(db_id, info.id)?);
        Ok(CollectionOps::new(txn, info.id, sequence))
    }

    /// Deletes every document in `(db, collection)`, batching across
    /// multiple transactions if the deletion is too big for one: on
    /// `txn-too-big`, commits what's done so far and retries with a fresh
    /// transaction to continue. Returns the total durably-deleted count.
    pub fn delete_all(self: &Arc<Self>, db: &str, collection: &str) -> CResult<u64> {
        const BATCH_WRITES: u64 = 10_000;
        let mut total = 0u64;
        loop {
            let txn = DocTxn::begin_with_max_writes(self.engine.clone(), self.schema.clone(), BATCH_WRITES)?;
            let ops = self.collection(&txn, db, collection)?;
            let (deleted, more) = ops.delete_all_batch()?;
            total += deleted;
            txn.commit()?;
            if !more {
                return Ok(total);
            }
        }
    }

    fn collection_sequence(&self, db_id: u64, cid: u64) -> CResult<Arc<Sequence<E>>> {
        let mut sequences = self.sequences.lock()?;
        if let Some(seq) = sequences.get(&cid) {
            return Ok(seq.clone());
        }
        let seq = Arc::new(Sequence::new_hash(
            self.engine.clone(),
            collections_hash_key(db_id),
            autoincrement_field(cid),
            DEFAULT_DOCUMENT_ID_BANDWIDTH,
        )?);
        sequences.insert(cid, seq.clone());
        Ok(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ddl::{CreateCollectionInput, CreateIndexInput};
    use crate::storage::memory::Memory;

    fn test_config() -> DdlConfig {
        DdlConfig { lease: Duration::from_millis(5), worker_max_tick_interval: Duration::from_millis(20) }
    }

    #[test]
    fn end_to_end_document_crud() {
        let store = Store::open(Memory::new(), test_config()).unwrap();
        store
            .create_schema(CreateSchemaInput {
                db_name: "db".into(),
                collections: vec![CreateCollectionInput { name: "c".into(), indices: vec![] }],
            })
            .unwrap();

        let txn = store.begin().unwrap();
        let ops = store.collection(&txn, "db", "c").unwrap();
        let did = ops.insert_one(br#"{"key":"value"}"#.to_vec()).unwrap();
        assert_eq!(did, 1);
        assert_eq!(ops.get(did).unwrap(), Some(br#"{"key":"value"}"#.to_vec()));
        txn.commit().unwrap();

        let txn = store.begin().unwrap();
        let ops = store.collection(&txn, "db", "c").unwrap();
        assert!(ops.update_one(1, br#"{"key":"value2"}"#.to_vec()).unwrap());
        assert_eq!(ops.count().unwrap(), 1);
        txn.commit().unwrap();

        let txn = store.begin().unwrap();
        let ops = store.collection(&txn, "db", "c").unwrap();
        ops.delete(1).unwrap();
        txn.commit().unwrap();

        let txn = store.begin_read_only().unwrap();
        let ops = store.collection(&txn, "db", "c").unwrap();
        assert_eq!(ops.get(1).unwrap(), None);
    }

    #[test]
    fn insert_one_managed_preserves_explicit_id() {
        let store = Store::open(Memory::new(), test_config()).unwrap();
        store
            .create_schema(CreateSchemaInput {
                db_name: "db".into(),
                collections: vec![CreateCollectionInput { name: "c".into(), indices: vec![] }],
            })
            .unwrap();

        let txn = store.begin().unwrap();
        let ops = store.collection(&txn, "db", "c").unwrap();
        ops.insert_one_managed(1000, b"value".to_vec()).unwrap();
        assert_eq!(ops.count().unwrap(), 1);
        assert!(matches!(ops.insert_one_managed(1000, b"anything".to_vec()), Err(Error::DocExists)));
        txn.commit().unwrap();
    }

    #[test]
    fn ddl_conflict_fails_commit_of_concurrent_dml() {
        let store = Store::open(Memory::new(), test_config()).unwrap();
        store
            .create_schema(CreateSchemaInput {
                db_name: "db".into(),
                collections: vec![CreateCollectionInput { name: "c".into(), indices: vec![] }],
            })
            .unwrap();

        let t1 = store.begin().unwrap();
        let _ops = store.collection(&t1, "db", "c").unwrap();

        store
            .add_index(AddIndexInput {
                db_name: "db".into(),
                collection_name: "c".into(),
                index_name: "idx".into(),
                columns: vec!["key".into()],
                unique: false,
            })
            .unwrap();

        assert!(matches!(t1.commit(), Err(Error::DdlConflict)));
    }

    #[test]
    fn dml_on_unrelated_collection_is_unaffected_by_ddl() {
        let store = Store::open(Memory::new(), test_config()).unwrap();
        store
            .create_schema(CreateSchemaInput {
                db_name: "db".into(),
                collections: vec![
                    CreateCollectionInput { name: "c1".into(), indices: vec![] },
                    CreateCollectionInput { name: "c2".into(), indices: vec![] },
                ],
            })
            .unwrap();

        let t1 = store.begin().unwrap();
        let ops = store.collection(&t1, "db", "c1").unwrap();
        ops.insert_one_managed(1, b"v".to_vec()).unwrap();

        store
            .add_index(AddIndexInput {
                db_name: "db".into(),
                collection_name: "c2".into(),
                index_name: "idx".into(),
                columns: vec!["key".into()],
                unique: false,
            })
            .unwrap();

        assert!(t1.commit().is_ok());
    }

    #[test]
    fn reloader_catches_up_a_second_store_over_the_same_engine() {
        // Two `Store`s sharing one engine simulate a second replica that
        // only learns about DDL through the periodic reloader rather than
        // running the worker that produced it.
        let engine = Memory::new();
        let store_a = Store::open(engine, test_config()).unwrap();
        store_a
            .create_schema(CreateSchemaInput { db_name: "db".into(), collections: vec![] })
            .unwrap();

        let store_b = Store { engine: store_a.engine.clone(), meta: store_a.meta.clone(), schema: Arc::new(SchemaHandle::new(MetaCache::new(0, vec![]))), ddl: store_a.ddl.clone(), sequences: Mutex::new(HashMap::new()) };
        assert!(!store_b.schema.get().unwrap().check_db_exists("db"));
        store_b.reload_schema_once().unwrap();
        assert!(store_b.schema.get().unwrap().check_db_exists("db"));
    }

    #[test]
    fn delete_all_removes_every_document() {
        let store = Store::open(Memory::new(), test_config()).unwrap();
        store
            .create_schema(CreateSchemaInput {
                db_name: "db".into(),
                collections: vec![CreateCollectionInput { name: "c".into(), indices: vec![] }],
            })
            .unwrap();

        let txn = store.begin().unwrap();
        let ops = store.collection(&txn, "db", "c").unwrap();
        for _ in 0..25 {
            ops.insert_one(b"v".to_vec()).unwrap();
        }
        txn.commit().unwrap();

        let deleted = store.delete_all("db", "c").unwrap();
        assert_eq!(deleted, 25);

        let txn = store.begin_read_only().unwrap();
        let ops = store.collection(&txn, "db", "c").unwrap();
        assert_eq!(ops.count().unwrap(), 0);
    }
}
