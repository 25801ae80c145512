//! Catalog entity types shared by the meta store (C5), DDL engine (C6) and
//! schema cache (C7). These are JSON-encoded wherever the meta store persists
//! them (`CreateDatabase`, `CreateCollection`, schema diffs, DDL jobs), per
//! spec's data model.

use std::collections::HashMap;
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaState {
    Absent,
    DeleteOnly,
    WriteOnly,
    WriteReorganization,
    Public,
}

impl SchemaState {
    pub fn next(self) -> Option<Self> {
        match self {
            SchemaState::Absent => Some(SchemaState::DeleteOnly),
            SchemaState::DeleteOnly => Some(SchemaState::WriteOnly),
            SchemaState::WriteOnly => Some(SchemaState::WriteReorganization),
            SchemaState::WriteReorganization => Some(SchemaState::Public),
            SchemaState::Public => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub id: u64,
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub state: SchemaState,
    /// Transient payload carried inside a DDL job so a worker can resolve
    /// `(db, collection)` without a second lookup. Cleared before the index
    /// is actually stored on the collection.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub job_redundant: Option<JobRedundant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRedundant {
    pub db: String,
    pub collection: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub id: u64,
    pub name: String,
    pub state: SchemaState,
    pub indices: HashMap<String, IndexInfo>,
    pub index_order: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DBInfo {
    pub id: u64,
    pub name: String,
    pub state: SchemaState,
    pub collections: HashMap<String, CollectionInfo>,
    pub collection_order: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    CreateSchema,
    DropSchema,
    CreateCollection,
    DropCollection,
    AddIndex,
    DropIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub version: u64,
    #[serde(rename = "type")]
    pub action: ActionType,
    pub collection_ids: Vec<u64>,
    /// The minimal payload needed for incremental cache apply, e.g. the new
    /// `DBInfo` for `CreateSchema`.
    pub arg: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    None,
    Running,
    Done,
    Cancelled,
    Cancelling,
    RollingBack,
    RollbackDone,
    Synced,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::RollbackDone)
    }

    pub fn is_synced(self) -> bool {
        matches!(self, JobState::Synced)
    }

    pub fn is_cancelled(self) -> bool {
        matches!(self, JobState::Cancelled)
    }

    pub fn is_rollback_done(self) -> bool {
        matches!(self, JobState::RollbackDone)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub action: ActionType,
    pub state: JobState,
    pub schema_state: SchemaState,
    /// The live decoded payload. `rawArg` is cleared when `arg` is
    /// re-encoded on update; only one of the pair is authoritative at a
    /// given moment.
    pub arg: Vec<u8>,
    pub raw_arg: Vec<u8>,
    pub error: Option<String>,
    pub error_count: u32,
    pub dependency_id: Option<u64>,
}

impl Job {
    pub fn new(id: u64, action: ActionType, arg: Vec<u8>) -> Self {
        Self {
            id,
            action,
            state: JobState::None,
            schema_state: SchemaState::Absent,
            raw_arg: arg.clone(),
            arg,
            error: None,
            error_count: 0,
            dependency_id: None,
        }
    }
}
