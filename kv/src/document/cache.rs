//! Schema cache (component C7): a versioned, atomically swappable snapshot
//! of every database/collection/index, with incremental diff application
//! and a bounded diff history used for commit-time conflict checks.

use std::collections::{HashMap, VecDeque};
use crate::document::types::{ActionType, DBInfo, SchemaDiff};
use crate::error::CResult;

/// Diffs older than this collapse the retained window; a `Check` whose
/// start version falls further back than this must conservatively fail.
pub const MAX_RETAINED_DIFFS: usize = 100;

#[derive(Clone, Debug, PartialEq)]
pub struct MetaCache {
    pub version: u64,
    pub dbs: HashMap<String, DBInfo>,
    /// `diffs[i]` holds the collection-ID set touched at version
    /// `diff_start_version + i`.
    diffs: VecDeque<Vec<u64>>,
    diff_start_version: u64,
}

impl MetaCache {
    pub fn new(version: u64, db_infos: Vec<DBInfo>) -> Self {
        let dbs = db_infos.into_iter().map(|d| (d.name.clone(), d)).collect();
        Self { version, dbs, diffs: VecDeque::new(), diff_start_version: version + 1 }
    }

    pub fn diff_start_version(&self) -> u64 {
        self.diff_start_version
    }

    pub fn diff_count(&self) -> usize {
        self.diffs.len()
    }

    /// `diffs[version - diff_start_version]`'s collection-ID set, or `None`
    /// if `version` has fallen out of the retained window.
    pub fn collection_ids_touched_at(&self, version: u64) -> Option<&[u64]> {
        if version < self.diff_start_version {
            return None;
        }
        let idx = (version - self.diff_start_version) as usize;
        self.diffs.get(idx).map(|v| v.as_slice())
    }

    /// Applies `diffs` in order. Requires them to be consecutive and to
    /// start immediately after `self.version`.
    pub fn apply_diffs(&mut self, diffs: &[SchemaDiff]) -> CResult<()> {
        for diff in diffs {
            if diff.version != self.version + 1 {
                return Err(crate::error::Error::Internal(format!(
                    "schema diff out of order: expected version {}, got {}",
                    self.version + 1,
                    diff.version
                )));
            }
            self.diffs.push_back(diff.collection_ids.clone());
            match diff.action {
                ActionType::CreateSchema => {
                    let db: DBInfo = serde_json::from_slice(&diff.arg)?;
                    self.dbs.insert(db.name.clone(), db);
                }
                // Remaining action types are extension points: only
                // CreateSchema and AddIndex have worker steps wired up so
                // far; the others will reuse this same diff machinery once
                // implemented.
                _ => {}
            }
            self.version = diff.version;
            if self.diffs.len() > MAX_RETAINED_DIFFS {
                self.diffs.pop_front();
                self.diff_start_version += 1;
            }
        }
        Ok(())
    }

    pub fn collection_info(
        &self,
        db_name: &str,
        collection_name: &str,
    ) -> Option<&crate::document::types::CollectionInfo> {
        self.dbs.get(db_name)?.collections.get(collection_name)
    }

    pub fn check_db_exists(&self, db_name: &str) -> bool {
        self.dbs.contains_key(db_name)
    }

    pub fn check_collection_exists(&self, db_name: &str, collection_name: &str) -> bool {
        self.collection_info(db_name, collection_name).is_some()
    }

    pub fn check_index_exists(&self, db_name: &str, collection_name: &str, index_name: &str) -> bool {
        self.collection_info(db_name, collection_name)
            .map(|c| c.indices.contains_key(index_name))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::types::SchemaState;
    use std::collections::HashMap as Map;

    fn db(name: &str) -> DBInfo {
        DBInfo {
            id: 1,
            name: name.to_string(),
            state: SchemaState::Public,
            collections: Map::new(),
            collection_order: Vec::new(),
        }
    }

    #[test]
    fn apply_diffs_rejects_out_of_order_version() {
        let mut cache = MetaCache::new(5, vec![]);
        let diff = SchemaDiff { version: 7, action: ActionType::CreateSchema, collection_ids: vec![], arg: vec![] };
        assert!(cache.apply_diffs(&[diff]).is_err());
    }

    #[test]
    fn apply_create_schema_diff_inserts_db_and_bumps_version() {
        let mut cache = MetaCache::new(0, vec![]);
        let d = db("app");
        let diff = SchemaDiff {
            version: 1,
            action: ActionType::CreateSchema,
            collection_ids: vec![10, 11],
            arg: serde_json::to_vec(&d).unwrap(),
        };
        cache.apply_diffs(&[diff]).unwrap();
        assert_eq!(cache.version, 1);
        assert!(cache.check_db_exists("app"));
        assert_eq!(cache.collection_ids_touched_at(1), Some(&[10u64, 11][..]));
    }

    #[test]
    fn ring_trims_past_max_retained() {
        let mut cache = MetaCache::new(0, vec![]);
        for v in 1..=(MAX_RETAINED_DIFFS as u64 + 5) {
            let diff = SchemaDiff {
                version: v,
                action: ActionType::CreateSchema,
                collection_ids: vec![v],
                arg: serde_json::to_vec(&db("app")).unwrap(),
            };
            cache.apply_diffs(&[diff]).unwrap();
        }
        assert_eq!(cache.diff_count(), MAX_RETAINED_DIFFS);
        assert!(cache.collection_ids_touched_at(1).is_none());
    }
}
