//! Meta store (component C5): a thin façade over structured KV with a fixed
//! `META` prefix, holding the catalog (databases/collections), the global ID
//! generator, the schema version counter, the DDL job queues, DDL history
//! and DDL reorg progress.

use std::sync::{Arc, Mutex};
use crate::document::keys::META;
use crate::document::structure::StructuredKv;
use crate::document::types::{DBInfo, CollectionInfo, Job, SchemaDiff};
use crate::error::{CResult, Error};
use crate::mvcc::transaction::Transaction;
use crate::storage::engine::Engine;

const GLOBAL_ID_KEY: &[u8] = b"nextGlobalID";
const SCHEMA_VERSION_KEY: &[u8] = b"schemaVersion";
const BOOTSTRAP_KEY: &[u8] = b"bootstrap";
const DBS_HASH_KEY: &[u8] = b"dbs";
const SCHEMA_DIFFS_HASH_KEY: &[u8] = b"schemaDiffs";
const DDL_JOB_LIST_KEY: &[u8] = b"DDLJobList";
const DDL_JOB_ADD_IDX_LIST_KEY: &[u8] = b"DDLJobAddIdxList";
const DDL_JOB_HISTORY_KEY: &[u8] = b"DDLJobHistory";
const DDL_JOB_REORG_KEY: &[u8] = b"DDLJobReorg";

pub const MAX_JOBS_IN_QUEUE: usize = 100;

/// Which of the two DDL queues a job belongs to. Add-index jobs have their
/// own queue so they never block other DDL behind a slow reorg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobQueue {
    Default,
    AddIndex,
}

impl JobQueue {
    fn list_key(self) -> &'static [u8] {
        match self {
            JobQueue::Default => DDL_JOB_LIST_KEY,
            JobQueue::AddIndex => DDL_JOB_ADD_IDX_LIST_KEY,
        }
    }
}

fn db_field(name: &str) -> Vec<u8> {
    format!("db:{}", name).into_bytes()
}

fn collection_field(cid: u64) -> Vec<u8> {
    format!("collection:{}", cid).into_bytes()
}

fn schema_diff_field(version: u64) -> Vec<u8> {
    format!("schemaDiff:{}", version).into_bytes()
}

fn db_collections_hash_key(db_id: u64) -> Vec<u8> {
    format!("collections:{}", db_id).into_bytes()
}

fn history_field(job_id: u64) -> Vec<u8> {
    job_id.to_be_bytes().to_vec()
}

fn reorg_start_field(job_id: u64) -> Vec<u8> {
    format!("{}:start", job_id).into_bytes()
}

fn reorg_end_field(job_id: u64) -> Vec<u8> {
    format!("{}:end", job_id).into_bytes()
}

/// Serializes `nextGlobalID` and `schemaVersion` increments across
/// concurrent callers, beyond whatever conflict detection the underlying KV
/// transaction already performs — the point is to avoid a retry storm when
/// many DDL submitters race on the same counter.
pub struct MetaStore {
    global_id_lock: Mutex<()>,
    schema_version_lock: Mutex<()>,
}

impl Default for MetaStore {
    fn default() -> Self {
        Self { global_id_lock: Mutex::new(()), schema_version_lock: Mutex::new(()) }
    }
}

impl MetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn kv<'a, E: Engine>(&self, txn: &'a Transaction<E>) -> StructuredKv<'a, E> {
        StructuredKv::new(txn, META.to_vec())
    }

    pub fn gen_global_id<E: Engine>(&self, txn: &Transaction<E>) -> CResult<u64> {
        let _guard = self.global_id_lock.lock()?;
        let next = self.kv(txn).string(GLOBAL_ID_KEY).inc(1)?;
        Ok(next as u64)
    }

    /// Returns `[origID+1 .. origID+n]`.
    pub fn gen_global_ids<E: Engine>(&self, txn: &Transaction<E>, n: u64) -> CResult<Vec<u64>> {
        let _guard = self.global_id_lock.lock()?;
        let cell = self.kv(txn).string(GLOBAL_ID_KEY);
        let orig = cell.get_int64()?;
        cell.set_int64(orig + n as i64)?;
        Ok((1..=n).map(|i| (orig + i as i64) as u64).collect())
    }

    pub fn get_schema_version<E: Engine>(&self, txn: &Transaction<E>) -> CResult<u64> {
        Ok(self.kv(txn).string(SCHEMA_VERSION_KEY).get_int64()? as u64)
    }

    pub fn gen_schema_version<E: Engine>(&self, txn: &Transaction<E>) -> CResult<u64> {
        let _guard = self.schema_version_lock.lock()?;
        Ok(self.kv(txn).string(SCHEMA_VERSION_KEY).inc(1)? as u64)
    }

    pub fn is_bootstrapped<E: Engine>(&self, txn: &Transaction<E>) -> CResult<bool> {
        Ok(self.kv(txn).string(BOOTSTRAP_KEY).get()?.is_some())
    }

    pub fn set_bootstrapped<E: Engine>(&self, txn: &Transaction<E>) -> CResult<()> {
        self.kv(txn).string(BOOTSTRAP_KEY).set(vec![1])
    }

    // -- database CRUD --

    pub fn create_database<E: Engine>(&self, txn: &Transaction<E>, db: &DBInfo) -> CResult<()> {
        let hash = self.kv(txn).hash(DBS_HASH_KEY);
        let field = db_field(&db.name);
        if hash.hget(&field)?.is_some() {
            return Err(Error::DbExists);
        }
        hash.hset(&field, serde_json::to_vec(db)?)
    }

    pub fn update_database<E: Engine>(&self, txn: &Transaction<E>, db: &DBInfo) -> CResult<()> {
        let hash = self.kv(txn).hash(DBS_HASH_KEY);
        let field = db_field(&db.name);
        if hash.hget(&field)?.is_none() {
            return Err(Error::DbNotExists);
        }
        hash.hset(&field, serde_json::to_vec(db)?)
    }

    /// Clears the per-database collection hash, then removes the `dbs` field.
    pub fn drop_database<E: Engine>(&self, txn: &Transaction<E>, db: &DBInfo) -> CResult<()> {
        self.kv(txn).hash(&db_collections_hash_key(db.id)).hclear()?;
        if !self.kv(txn).hash(DBS_HASH_KEY).hdel(&db_field(&db.name))? {
            return Err(Error::DbNotExists);
        }
        Ok(())
    }

    pub fn get_database<E: Engine>(&self, txn: &Transaction<E>, name: &str) -> CResult<Option<DBInfo>> {
        match self.kv(txn).hash(DBS_HASH_KEY).hget(&db_field(name))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn list_databases<E: Engine>(&self, txn: &Transaction<E>) -> CResult<Vec<DBInfo>> {
        self.kv(txn)
            .hash(DBS_HASH_KEY)
            .hget_all()?
            .into_iter()
            .map(|(_, v)| Ok(serde_json::from_slice(&v)?))
            .collect()
    }

    // -- collection CRUD (stored under the per-database hash) --

    pub fn create_collection<E: Engine>(
        &self,
        txn: &Transaction<E>,
        db_id: u64,
        coll: &CollectionInfo,
    ) -> CResult<()> {
        let hash = self.kv(txn).hash(&db_collections_hash_key(db_id));
        let field = collection_field(coll.id);
        if hash.hget(&field)?.is_some() {
            return Err(Error::CollectionExists);
        }
        hash.hset(&field, serde_json::to_vec(coll)?)
    }

    pub fn update_collection<E: Engine>(
        &self,
        txn: &Transaction<E>,
        db_id: u64,
        coll: &CollectionInfo,
    ) -> CResult<()> {
        let hash = self.kv(txn).hash(&db_collections_hash_key(db_id));
        let field = collection_field(coll.id);
        if hash.hget(&field)?.is_none() {
            return Err(Error::CollectionNotExists);
        }
        hash.hset(&field, serde_json::to_vec(coll)?)
    }

    /// `remove_autoincrement_field` also drops the collection's document-ID
    /// sequence field from the per-database hash.
    pub fn drop_collection<E: Engine>(
        &self,
        txn: &Transaction<E>,
        db_id: u64,
        cid: u64,
        remove_autoincrement_field: bool,
    ) -> CResult<()> {
        let hash = self.kv(txn).hash(&db_collections_hash_key(db_id));
        if !hash.hdel(&collection_field(cid))? {
            return Err(Error::CollectionNotExists);
        }
        if remove_autoincrement_field {
            hash.hdel(format!("autoincr:{}", cid).as_bytes())?;
        }
        Ok(())
    }

    pub fn get_collection<E: Engine>(
        &self,
        txn: &Transaction<E>,
        db_id: u64,
        cid: u64,
    ) -> CResult<Option<CollectionInfo>> {
        match self.kv(txn).hash(&db_collections_hash_key(db_id)).hget(&collection_field(cid))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    // -- schema diffs --

    pub fn set_schema_diff<E: Engine>(&self, txn: &Transaction<E>, diff: &SchemaDiff) -> CResult<()> {
        self.kv(txn).hash(SCHEMA_DIFFS_HASH_KEY).hset(&schema_diff_field(diff.version), serde_json::to_vec(diff)?)
    }

    pub fn get_schema_diff<E: Engine>(&self, txn: &Transaction<E>, version: u64) -> CResult<Option<SchemaDiff>> {
        match self.kv(txn).hash(SCHEMA_DIFFS_HASH_KEY).hget(&schema_diff_field(version))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    // -- DDL job queue --

    pub fn enqueue_ddl_job<E: Engine>(&self, txn: &Transaction<E>, queue: JobQueue, job: &Job) -> CResult<()> {
        let list = self.kv(txn).list(queue.list_key());
        if list.llen()? as usize >= MAX_JOBS_IN_QUEUE {
            return Err(Error::JobsInQueueExceeded);
        }
        list.rpush(serde_json::to_vec(job)?)
    }

    pub fn dequeue_ddl_job<E: Engine>(&self, txn: &Transaction<E>, queue: JobQueue) -> CResult<Option<Job>> {
        match self.kv(txn).list(queue.list_key()).lpop()? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn get_ddl_job_by_idx<E: Engine>(
        &self,
        txn: &Transaction<E>,
        queue: JobQueue,
        idx: i64,
    ) -> CResult<Option<Job>> {
        match self.kv(txn).list(queue.list_key()).lindex(idx)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn update_ddl_job<E: Engine>(
        &self,
        txn: &Transaction<E>,
        queue: JobQueue,
        idx: i64,
        job: &Job,
    ) -> CResult<()> {
        self.kv(txn).list(queue.list_key()).lset(idx, serde_json::to_vec(job)?)
    }

    // -- DDL history --

    pub fn add_ddl_history<E: Engine>(&self, txn: &Transaction<E>, job: &Job) -> CResult<()> {
        self.kv(txn).hash(DDL_JOB_HISTORY_KEY).hset(&history_field(job.id), serde_json::to_vec(job)?)
    }

    pub fn get_ddl_history_job<E: Engine>(&self, txn: &Transaction<E>, job_id: u64) -> CResult<Option<Job>> {
        match self.kv(txn).hash(DDL_JOB_HISTORY_KEY).hget(&history_field(job_id))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Last `n` history entries in descending (most recent first) job-ID order.
    pub fn list_ddl_history_desc<E: Engine>(&self, txn: &Transaction<E>, n: usize) -> CResult<Vec<Job>> {
        self.kv(txn)
            .hash(DDL_JOB_HISTORY_KEY)
            .hget_n_desc(n)?
            .into_iter()
            .map(|(_, v)| Ok(serde_json::from_slice(&v)?))
            .collect()
    }

    // -- DDL reorg progress --

    pub fn get_ddl_reorg_handle<E: Engine>(&self, txn: &Transaction<E>, job_id: u64) -> CResult<(i64, i64)> {
        let hash = self.kv(txn).hash(DDL_JOB_REORG_KEY);
        Ok((hash.hget_int64(&reorg_start_field(job_id))?, hash.hget_int64(&reorg_end_field(job_id))?))
    }

    pub fn set_ddl_reorg_handle<E: Engine>(
        &self,
        txn: &Transaction<E>,
        job_id: u64,
        start: i64,
        end: i64,
    ) -> CResult<()> {
        let hash = self.kv(txn).hash(DDL_JOB_REORG_KEY);
        hash.hset_int64(&reorg_start_field(job_id), start)?;
        hash.hset_int64(&reorg_end_field(job_id), end)
    }

    /// A cursor kept alongside the reorg handle so an index-backfill
    /// extension could hand out batches of document IDs without re-deriving
    /// bounds. No DDL step currently calls this.
    pub fn gen_collection_autoincrement_id<E: Engine>(
        &self,
        txn: &Transaction<E>,
        db_id: u64,
        cid: u64,
        step: i64,
    ) -> CResult<i64> {
        self.kv(txn).hash(&db_collections_hash_key(db_id)).hinc(format!("autoincr:{}", cid).as_bytes(), step)
    }
}

pub fn queue_len<E: Engine>(store: &MetaStore, txn: &Transaction<E>, queue: JobQueue) -> CResult<i64> {
    store.kv(txn).list(queue.list_key()).llen()
}

/// Shared handle, since `MetaStore` is stateless besides its two mutexes and
/// gets threaded through the DDL engine and DML collection ops alike.
pub type SharedMetaStore = Arc<MetaStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::types::SchemaState;
    use crate::mvcc::transaction::TransactionDef;
    use crate::storage::memory::Memory;
    use std::collections::HashMap;

    fn new_txn() -> Transaction<Memory> {
        Transaction::begin(Arc::new(Mutex::new(Memory::new()))).unwrap()
    }

    fn sample_db(id: u64, name: &str) -> DBInfo {
        DBInfo {
            id,
            name: name.to_string(),
            state: SchemaState::Public,
            collections: HashMap::new(),
            collection_order: Vec::new(),
        }
    }

    #[test]
    fn global_id_is_strictly_increasing() {
        let txn = new_txn();
        let store = MetaStore::new();
        let a = store.gen_global_id(&txn).unwrap();
        let b = store.gen_global_id(&txn).unwrap();
        assert!(b > a);
    }

    #[test]
    fn gen_global_ids_returns_contiguous_range() {
        let txn = new_txn();
        let store = MetaStore::new();
        let ids = store.gen_global_ids(&txn, 3).unwrap();
        assert_eq!(ids, vec![ids[0], ids[0] + 1, ids[0] + 2]);
    }

    #[test]
    fn create_database_rejects_duplicate_name() {
        let txn = new_txn();
        let store = MetaStore::new();
        let db = sample_db(1, "app");
        store.create_database(&txn, &db).unwrap();
        assert!(matches!(store.create_database(&txn, &db), Err(Error::DbExists)));
    }

    #[test]
    fn drop_database_rejects_unknown_name() {
        let txn = new_txn();
        let store = MetaStore::new();
        let db = sample_db(1, "app");
        assert!(matches!(store.drop_database(&txn, &db), Err(Error::DbNotExists)));
    }

    #[test]
    fn ddl_queue_enforces_max_length() {
        let txn = new_txn();
        let store = MetaStore::new();
        for i in 0..MAX_JOBS_IN_QUEUE as u64 {
            let job = Job::new(i, crate::document::types::ActionType::CreateSchema, vec![]);
            store.enqueue_ddl_job(&txn, JobQueue::Default, &job).unwrap();
        }
        let overflow = Job::new(999, crate::document::types::ActionType::CreateSchema, vec![]);
        assert!(matches!(
            store.enqueue_ddl_job(&txn, JobQueue::Default, &overflow),
            Err(Error::JobsInQueueExceeded)
        ));
    }

    #[test]
    fn ddl_queue_is_fifo() {
        let txn = new_txn();
        let store = MetaStore::new();
        let j1 = Job::new(1, crate::document::types::ActionType::CreateSchema, vec![]);
        let j2 = Job::new(2, crate::document::types::ActionType::CreateSchema, vec![]);
        store.enqueue_ddl_job(&txn, JobQueue::Default, &j1).unwrap();
        store.enqueue_ddl_job(&txn, JobQueue::Default, &j2).unwrap();
        assert_eq!(store.dequeue_ddl_job(&txn, JobQueue::Default).unwrap().unwrap().id, 1);
        assert_eq!(store.dequeue_ddl_job(&txn, JobQueue::Default).unwrap().unwrap().id, 2);
    }

    #[test]
    fn bootstrap_flag_roundtrips() {
        let txn = new_txn();
        let store = MetaStore::new();
        assert!(!store.is_bootstrapped(&txn).unwrap());
        store.set_bootstrapped(&txn).unwrap();
        assert!(store.is_bootstrapped(&txn).unwrap());
    }
}
