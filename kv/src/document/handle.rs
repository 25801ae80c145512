//! Schema handle (component C8): a concurrent reader/writer guard around the
//! schema cache snapshot, exposing `get_snapshot` (lock-free for readers)
//! and `check_against_latest` used during DML commit.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use crate::document::cache::MetaCache;
use crate::error::CResult;

pub struct SchemaHandle {
    current: RwLock<Arc<MetaCache>>,
}

impl SchemaHandle {
    pub fn new(cache: MetaCache) -> Self {
        Self { current: RwLock::new(Arc::new(cache)) }
    }

    /// Atomic load of the snapshot to pin at transaction start.
    pub fn get(&self) -> CResult<Arc<MetaCache>> {
        Ok(self.current.read()?.clone())
    }

    /// Takes the writer lock and stores the new cache. Readers calling
    /// `get()` block only for the duration of the swap.
    pub fn update(&self, new_cache: MetaCache) -> CResult<()> {
        *self.current.write()? = Arc::new(new_cache);
        Ok(())
    }

    /// Compares `start` (the snapshot a DML transaction began with) against
    /// the latest cache. `Ok(())` if no DDL committed since `start`, or if
    /// none of the diffs since then touched `referred_collections`.
    /// `Err(DdlConflict)` otherwise, including when the required diff
    /// history has already fallen outside the retained window (a
    /// conservative "must retry" answer).
    pub fn check(&self, start: &Arc<MetaCache>, referred_collections: &HashSet<u64>) -> CResult<()> {
        let current = self.current.read()?;
        if Arc::ptr_eq(start, &current) || start.version == current.version {
            return Ok(());
        }
        let first_needed = start.version + 1;
        if first_needed < current.diff_start_version() {
            return Err(crate::error::Error::DdlConflict);
        }
        for v in first_needed..=current.version {
            match current.collection_ids_touched_at(v) {
                Some(ids) if ids.iter().any(|id| referred_collections.contains(id)) => {
                    return Err(crate::error::Error::DdlConflict);
                }
                Some(_) => {}
                None => return Err(crate::error::Error::DdlConflict),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::types::{ActionType, DBInfo, SchemaDiff, SchemaState};
    use std::collections::HashMap;

    fn db(name: &str) -> DBInfo {
        DBInfo { id: 1, name: name.to_string(), state: SchemaState::Public, collections: HashMap::new(), collection_order: Vec::new() }
    }

    #[test]
    fn check_passes_when_no_ddl_happened() {
        let handle = SchemaHandle::new(MetaCache::new(0, vec![]));
        let start = handle.get().unwrap();
        assert!(handle.check(&start, &HashSet::new()).is_ok());
    }

    #[test]
    fn check_fails_when_a_referred_collection_was_touched() {
        let handle = SchemaHandle::new(MetaCache::new(0, vec![]));
        let start = handle.get().unwrap();

        let mut cache = MetaCache::new(0, vec![]);
        let diff = SchemaDiff {
            version: 1,
            action: ActionType::CreateSchema,
            collection_ids: vec![42],
            arg: serde_json::to_vec(&db("app")).unwrap(),
        };
        cache.apply_diffs(&[diff]).unwrap();
        handle.update(cache).unwrap();

        let mut referred = HashSet::new();
        referred.insert(42u64);
        assert!(handle.check(&start, &referred).is_err());
    }

    #[test]
    fn check_passes_when_referred_collection_untouched() {
        let handle = SchemaHandle::new(MetaCache::new(0, vec![]));
        let start = handle.get().unwrap();

        let mut cache = MetaCache::new(0, vec![]);
        let diff = SchemaDiff {
            version: 1,
            action: ActionType::CreateSchema,
            collection_ids: vec![42],
            arg: serde_json::to_vec(&db("app")).unwrap(),
        };
        cache.apply_diffs(&[diff]).unwrap();
        handle.update(cache).unwrap();

        let mut referred = HashSet::new();
        referred.insert(7u64);
        assert!(handle.check(&start, &referred).is_ok());
    }
}
