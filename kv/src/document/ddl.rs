//! DDL engine (component C6): schema mutation API, a background worker per
//! queue that drives jobs through the online-schema-change (OSC) state
//! machine, and `checkJob` polling for callers awaiting completion.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::document::cache::MetaCache;
use crate::document::handle::SchemaHandle;
use crate::document::meta::{JobQueue, MetaStore, SharedMetaStore};
use crate::document::types::{ActionType, CollectionInfo, DBInfo, IndexInfo, Job, JobRedundant, JobState, SchemaDiff, SchemaState};
use crate::error::{CResult, Error};
use crate::mvcc::transaction::{Transaction, TransactionDef};
use crate::storage::engine::Engine;

/// Input shape for `CreateSchema`: a database name plus its collections and
/// their indices, all unassigned IDs — the engine allocates `2 + |collections|
/// + |indices|` global IDs (schema first, then one per collection, then one
/// per index) before composing the `DBInfo`.
pub struct CreateSchemaInput {
    pub db_name: String,
    pub collections: Vec<CreateCollectionInput>,
}

pub struct CreateCollectionInput {
    pub name: String,
    pub indices: Vec<CreateIndexInput>,
}

pub struct CreateIndexInput {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

pub struct AddIndexInput {
    pub db_name: String,
    pub collection_name: String,
    pub index_name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// Ticker intervals and the inter-replica propagation delay for the
/// background DDL worker.
#[derive(Debug, Clone, Copy)]
pub struct DdlConfig {
    pub lease: Duration,
    pub worker_max_tick_interval: Duration,
}

impl Default for DdlConfig {
    fn default() -> Self {
        Self { lease: Duration::from_millis(200), worker_max_tick_interval: Duration::from_secs(2) }
    }
}

struct WorkerChannel {
    notify: Sender<()>,
}

pub struct DdlEngine<E: Engine> {
    engine: Arc<Mutex<E>>,
    meta: SharedMetaStore,
    schema: Arc<SchemaHandle>,
    config: DdlConfig,
    default_channel: WorkerChannel,
    add_index_channel: WorkerChannel,
}

impl<E: Engine + 'static> DdlEngine<E> {
    pub fn new(engine: Arc<Mutex<E>>, meta: SharedMetaStore, schema: Arc<SchemaHandle>, config: DdlConfig) -> Arc<Self> {
        let (default_tx, default_rx) = mpsc::channel();
        let (add_idx_tx, add_idx_rx) = mpsc::channel();
        let this = Arc::new(Self {
            engine,
            meta,
            schema,
            config,
            default_channel: WorkerChannel { notify: default_tx },
            add_index_channel: WorkerChannel { notify: add_idx_tx },
        });
        spawn_worker(this.clone(), JobQueue::Default, default_rx);
        spawn_worker(this.clone(), JobQueue::AddIndex, add_idx_rx);
        this
    }

    fn notify(&self, queue: JobQueue) {
        let channel = match queue {
            JobQueue::Default => &self.default_channel,
            JobQueue::AddIndex => &self.add_index_channel,
        };
        let _ = channel.notify.send(());
    }

    /// Validates input, allocates IDs, composes the `DBInfo`, enqueues an
    /// `ActionCreateSchema` job and waits for it to reach `synced`.
    pub fn create_schema(&self, input: CreateSchemaInput) -> CResult<()> {
        if self.schema.get()?.check_db_exists(&input.db_name) {
            return Err(Error::DbAlreadyExists);
        }

        let txn = Transaction::begin(self.engine.clone())?;
        if let Err(e) = self.check_queue_not_saturated(&txn, JobQueue::Default) {
            txn.rollback()?;
            return Err(e);
        }

        let n_indices: usize = input.collections.iter().map(|c| c.indices.len()).sum();
        let mut ids = match self.meta.gen_global_ids(&txn, (2 + input.collections.len() + n_indices) as u64) {
            Ok(ids) => ids,
            Err(e) => {
                txn.rollback()?;
                return Err(e);
            }
        };
        ids.reverse(); // pop() below hands them out in allocation order

        let schema_id = ids.pop().unwrap();
        let job_id = ids.pop().unwrap();

        let mut collections = HashMap::new();
        let mut collection_order = Vec::new();
        for c in &input.collections {
            let cid = ids.pop().unwrap();
            let mut indices = HashMap::new();
            let mut index_order = Vec::new();
            for idx in &c.indices {
                let iid = ids.pop().unwrap();
                indices.insert(
                    idx.name.clone(),
                    IndexInfo {
                        id: iid,
                        name: idx.name.clone(),
                        columns: idx.columns.clone(),
                        unique: idx.unique,
                        state: SchemaState::Public,
                        job_redundant: None,
                    },
                );
                index_order.push(idx.name.clone());
            }
            collections.insert(
                c.name.clone(),
                CollectionInfo { id: cid, name: c.name.clone(), state: SchemaState::Public, indices, index_order },
            );
            collection_order.push(c.name.clone());
        }

        let db = DBInfo { id: schema_id, name: input.db_name, state: SchemaState::Public, collections, collection_order };
        let job = Job::new(job_id, ActionType::CreateSchema, serde_json::to_vec(&db)?);
        self.meta.enqueue_ddl_job(&txn, JobQueue::Default, &job)?;
        txn.commit()?;

        self.notify(JobQueue::Default);
        self.check_job(JobQueue::Default, job_id)
    }

    /// Allocates an index ID and a job ID, enqueues an `ActionAddIndex` job
    /// carrying `{db, collection}` in `job_redundant`, and waits for it to
    /// progress through the OSC states to `public`.
    pub fn add_index(&self, input: AddIndexInput) -> CResult<()> {
        if self.schema.get()?.check_index_exists(&input.db_name, &input.collection_name, &input.index_name) {
            return Err(Error::IndexAlreadyExists);
        }
        let txn = Transaction::begin(self.engine.clone())?;
        let queue_len = crate::document::meta::queue_len(&self.meta, &txn, JobQueue::AddIndex)?;
        if queue_len as usize >= crate::document::meta::MAX_JOBS_IN_QUEUE {
            return Err(Error::JobsInQueueExceeded);
        }
        let mut ids = self.meta.gen_global_ids(&txn, 2)?;
        let job_id = ids.pop().unwrap();
        let index_id = ids.pop().unwrap();

        let index = IndexInfo {
            id: index_id,
            name: input.index_name.clone(),
            columns: input.columns,
            unique: input.unique,
            state: SchemaState::Absent,
            job_redundant: Some(JobRedundant { db: input.db_name, collection: input.collection_name }),
        };
        let job = Job::new(job_id, ActionType::AddIndex, serde_json::to_vec(&index)?);
        self.meta.enqueue_ddl_job(&txn, JobQueue::AddIndex, &job)?;
        txn.commit()?;

        self.notify(JobQueue::AddIndex);
        self.check_job(JobQueue::AddIndex, job_id)
    }

    /// `DropSchema`/`CreateCollection`/`DropCollection`/`DropIndex` are
    /// extension points — the job queue and history machinery supports
    /// arbitrary action types, but no OSC step is wired up for them yet, so
    /// enqueuing one would wait forever. Surfacing that explicitly rather
    /// than silently no-oping.
    pub fn drop_schema(&self, _db_name: &str) -> CResult<()> {
        Err(Error::InvalidDdlState("drop-schema has no worker step wired up".into()))
    }

    pub fn create_collection(&self, _db_name: &str, _input: CreateCollectionInput) -> CResult<()> {
        Err(Error::InvalidDdlState("create-collection has no worker step wired up".into()))
    }

    pub fn drop_collection(&self, _db_name: &str, _collection_name: &str) -> CResult<()> {
        Err(Error::InvalidDdlState("drop-collection has no worker step wired up".into()))
    }

    pub fn drop_index(&self, _db_name: &str, _collection_name: &str, _index_name: &str) -> CResult<()> {
        Err(Error::InvalidDdlState("drop-index has no worker step wired up".into()))
    }

    pub fn get_history_job(&self, job_id: u64) -> CResult<Option<Job>> {
        let txn = Transaction::begin_read_only(self.engine.clone(), None)?;
        self.meta.get_ddl_history_job(&txn, job_id)
    }

    /// Polls history until the job reaches `synced`, returning `job.error`
    /// if it was cancelled or rolled back (a non-null error there is a
    /// programming bug, not a caller-facing condition).
    fn check_job(&self, queue: JobQueue, job_id: u64) -> CResult<()> {
        let interval = match queue {
            JobQueue::Default => Duration::from_millis(500).max(self.config.lease * 10),
            JobQueue::AddIndex => Duration::from_secs(3).max(self.config.lease * 10),
        };
        let deadline = Instant::now() + Duration::from_secs(60);
        loop {
            if let Some(job) = self.get_history_job(job_id)? {
                if job.state.is_synced() {
                    return Ok(());
                }
                if job.state.is_cancelled() || job.state.is_rollback_done() {
                    return Err(Error::InvalidDdlState(
                        job.error.unwrap_or_else(|| "job cancelled with no error recorded".into()),
                    ));
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Cancelled);
            }
            std::thread::sleep(interval);
        }
    }
}

fn spawn_worker<E: Engine + 'static>(engine: Arc<DdlEngine<E>>, queue: JobQueue, notify: Receiver<()>) {
    std::thread::spawn(move || {
        let tick = engine.config.worker_max_tick_interval.max(engine.config.lease * 2);
        loop {
            match notify.recv_timeout(tick) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => return,
            }
            loop {
                match handle_one_job(&engine, queue) {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(_) => break,
                }
            }
        }
    });
}

/// Processes the head-of-queue job, if any. Returns `Ok(true)` if a job was
/// processed (caller should loop again), `Ok(false)` if the queue is empty.
fn handle_one_job<E: Engine>(engine: &DdlEngine<E>, queue: JobQueue) -> CResult<bool> {
    let txn = Transaction::begin(engine.engine.clone())?;
    let job = match engine.meta.get_ddl_job_by_idx(&txn, queue, 0)? {
        Some(job) => job,
        None => return Ok(false),
    };

    if job.state.is_terminal() {
        let mut finished = job;
        if finished.state == JobState::Done {
            finished.state = JobState::Synced;
        }
        engine.meta.add_ddl_history(&txn, &finished)?;
        engine.meta.dequeue_ddl_job(&txn, queue)?;
        txn.commit()?;
        return Ok(true);
    }

    let result = panic::catch_unwind(AssertUnwindSafe(|| run_job_step(engine, &txn, job.clone())));
    let (mut job, after_commit, diff): (Job, Option<Box<dyn FnOnce() + Send>>, Option<SchemaDiff>) = match result {
        Ok(Ok((job, hook, diff))) => (job, hook, diff),
        Ok(Err(e)) => {
            let mut job = job;
            job.error_count += 1;
            job.error = Some(e.to_string());
            if job.error_count >= 3 {
                job.state = JobState::Cancelled;
            }
            (job, None, None)
        }
        Err(_) => {
            let mut job = job;
            job.state = JobState::Cancelling;
            (job, None, None)
        }
    };

    if job.state.is_terminal() || matches!(job.state, JobState::Cancelled | JobState::RollbackDone) {
        if job.state == JobState::Done {
            job.state = JobState::Synced;
        }
        engine.meta.add_ddl_history(&txn, &job)?;
        engine.meta.dequeue_ddl_job(&txn, queue)?;
    } else {
        engine.meta.update_ddl_job(&txn, queue, 0, &job)?;
    }
    txn.commit()?;

    // Publish the new schema version to this process's cache right after
    // commit, rather than waiting for the periodic reloader — the worker
    // already holds the diff it just wrote, so applying it here is free and
    // lets same-process DML see the new schema immediately.
    if let Some(diff) = diff {
        if let Ok(current) = engine.schema.get() {
            let mut next = (*current).clone();
            if next.apply_diffs(&[diff]).is_ok() {
                let _ = engine.schema.update(next);
            }
        }
    }

    if let Some(hook) = after_commit {
        hook();
    }
    Ok(true)
}

/// Runs the OSC state-machine step for one job. Returns
/// the updated job, an optional post-commit hook (e.g. creating
/// document-ID sequences for newly public collections), and the schema
/// diff committed by this step, if any, so the caller can advance the
/// schema cache in step with the catalog.
fn run_job_step<E: Engine>(
    engine: &DdlEngine<E>,
    txn: &Transaction<E>,
    mut job: Job,
) -> CResult<(Job, Option<Box<dyn FnOnce() + Send>>, Option<SchemaDiff>)> {
    job.state = JobState::Running;
    match job.action {
        ActionType::CreateSchema => on_create_schema(engine, txn, job),
        ActionType::AddIndex => on_add_index(engine, txn, job),
        _ => {
            job.state = JobState::Cancelled;
            job.error = Some("action has no worker step wired up".into());
            Ok((job, None, None))
        }
    }
}

fn bump_schema_version_and_diff<E: Engine>(
    engine: &DdlEngine<E>,
    txn: &Transaction<E>,
    action: ActionType,
    collection_ids: Vec<u64>,
    arg: Vec<u8>,
) -> CResult<SchemaDiff> {
    let version = engine.meta.gen_schema_version(txn)?;
    let diff = SchemaDiff { version, action, collection_ids, arg };
    engine.meta.set_schema_diff(txn, &diff)?;
    Ok(diff)
}

fn on_create_schema<E: Engine>(
    engine: &DdlEngine<E>,
    txn: &Transaction<E>,
    mut job: Job,
) -> CResult<(Job, Option<Box<dyn FnOnce() + Send>>, Option<SchemaDiff>)> {
    let mut db: DBInfo = serde_json::from_slice(&job.arg)?;
    if engine.meta.get_database(txn, &db.name)?.is_some() {
        job.state = JobState::Cancelled;
        job.error = Some("database already exists".into());
        return Ok((job, None, None));
    }

    db.state = SchemaState::Public;
    for coll in db.collections.values_mut() {
        coll.state = SchemaState::Public;
        for idx in coll.indices.values_mut() {
            idx.state = SchemaState::Public;
        }
    }

    engine.meta.create_database(txn, &db)?;
    let collection_ids: Vec<u64> = db.collections.values().map(|c| c.id).collect();
    for coll in db.collections.values() {
        engine.meta.create_collection(txn, db.id, coll)?;
    }

    let diff = bump_schema_version_and_diff(
        engine,
        txn,
        ActionType::CreateSchema,
        collection_ids.clone(),
        serde_json::to_vec(&db)?,
    )?;

    job.state = JobState::Done;
    job.schema_state = SchemaState::Public;

    let meta = engine.meta.clone();
    let engine_handle = engine_ref(engine);
    let db_id = db.id;
    let cids = collection_ids;
    let hook: Box<dyn FnOnce() + Send> = Box::new(move || {
        // Idempotently create the per-collection document-ID sequence cells
        // by touching their autoincrement hash field once.
        if let Ok(txn) = Transaction::begin(engine_handle) {
            for cid in &cids {
                let _ = meta.gen_collection_autoincrement_id(&txn, db_id, *cid, 0);
            }
            let _ = txn.commit();
        }
    });
    Ok((job, Some(hook), Some(diff)))
}

fn engine_ref<E: Engine>(engine: &DdlEngine<E>) -> Arc<Mutex<E>> {
    engine.engine.clone()
}

fn on_add_index<E: Engine>(
    engine: &DdlEngine<E>,
    txn: &Transaction<E>,
    mut job: Job,
) -> CResult<(Job, Option<Box<dyn FnOnce() + Send>>, Option<SchemaDiff>)> {
    let mut index: IndexInfo = serde_json::from_slice(&job.arg)?;
    let redundant = index.job_redundant.clone().ok_or_else(|| Error::Internal("add-index job missing job_redundant".into()))?;

    let mut db = engine
        .meta
        .get_database(txn, &redundant.db)?
        .ok_or(Error::DbNotExists)?;
    let cid = db
        .collections
        .get(&redundant.collection)
        .map(|c| c.id)
        .ok_or(Error::CollectionNotExists)?;

    let next_state = match job.schema_state {
        SchemaState::Absent => SchemaState::DeleteOnly,
        SchemaState::DeleteOnly => SchemaState::WriteOnly,
        SchemaState::WriteOnly => SchemaState::WriteReorganization,
        SchemaState::WriteReorganization => SchemaState::Public,
        SchemaState::Public => SchemaState::Public,
    };

    index.state = next_state;
    index.job_redundant = None;
    let coll = db.collections.get_mut(&redundant.collection).unwrap();
    coll.indices.insert(index.name.clone(), index.clone());
    if !coll.index_order.contains(&index.name) {
        coll.index_order.push(index.name.clone());
    }
    engine.meta.update_collection(txn, db.id, coll)?;

    let diff = bump_schema_version_and_diff(engine, txn, ActionType::AddIndex, vec![cid], serde_json::to_vec(&index)?)?;

    job.schema_state = next_state;
    job.arg = serde_json::to_vec(&IndexInfo {
        job_redundant: Some(redundant),
        ..index
    })?;
    if next_state == SchemaState::Public {
        job.state = JobState::Done;
    }
    Ok((job, None, Some(diff)))
}
