use std::sync::Mutex;

use fm_core::{MemoryNode, Persistence, PersistenceError};

use crate::error::StoreError;
use crate::store::NodeStore;

/// [`Persistence`] over a [`NodeStore`]. The connection sits behind a mutex
/// so the engine can be shared across threads.
pub struct SqlitePersistence {
    store: Mutex<NodeStore>,
}

impl SqlitePersistence {
    pub fn new(store: NodeStore) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    pub fn open_in_memory() -> crate::Result<Self> {
        Ok(Self::new(NodeStore::open_in_memory()?))
    }

    /// Run `f` against the underlying store.
    pub fn with_store<T>(&self, f: impl FnOnce(&NodeStore) -> T) -> T {
        let guard = self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }
}

impl From<StoreError> for PersistenceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Sqlite(e) => PersistenceError::Unavailable(e.to_string()),
            StoreError::Json(e) => PersistenceError::Corrupt(e.to_string()),
            StoreError::InvalidData(msg) => PersistenceError::Corrupt(msg),
        }
    }
}

impl Persistence for SqlitePersistence {
    fn save(&self, nodes: &[&MemoryNode]) -> Result<(), PersistenceError> {
        self.with_store(|s| s.save_nodes(nodes))?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<MemoryNode>, PersistenceError> {
        Ok(self.with_store(NodeStore::load_nodes)?)
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        Ok(self.with_store(NodeStore::clear)?)
    }

    fn flush(&self) -> Result<(), PersistenceError> {
        Ok(self.with_store(NodeStore::checkpoint)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fm_core::{ContentRecord, FieldMemory, FieldMemoryConfig, ManualClock, QueryContext, QueryRequest};

    fn engine(backend: SqlitePersistence) -> FieldMemory {
        let config = FieldMemoryConfig {
            seed: Some(9),
            ..Default::default()
        };
        FieldMemory::with_clock(config, Box::new(ManualClock::new(5_000)))
            .unwrap()
            .with_persistence(Box::new(backend))
    }

    #[test]
    fn test_engine_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("field.db");

        {
            let mut fm = engine(SqlitePersistence::new(NodeStore::open(&path).unwrap()));
            fm.store(ContentRecord::new("a", "function", "parse header").with_confidence(0.5))
                .unwrap();
            fm.store(ContentRecord::new("b", "function", "parse body").with_confidence(0.4))
                .unwrap();
            let mut ctx = QueryContext::default();
            fm.query(QueryRequest::precision("function", 0.9), &mut ctx)
                .unwrap();
            assert!(!fm.is_degraded());
        }

        let fm = engine(SqlitePersistence::new(NodeStore::open(&path).unwrap()));
        assert_eq!(fm.len(), 2);
        let a = fm.get("a").unwrap();
        assert!(a.confidence() > 0.5);
        assert_eq!(a.access_history.len(), 1);
        assert!(fm.stats().persistent);
    }

    #[test]
    fn test_stale_resonance_decay_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("field.db");

        let in_memory = {
            let mut fm = engine(SqlitePersistence::new(NodeStore::open(&path).unwrap()));
            fm.store(ContentRecord::new("a", "pair", "left half")).unwrap();
            fm.store(ContentRecord::new("b", "pair", "right half")).unwrap();
            fm.store(ContentRecord::new("y", "other", "unrelated")).unwrap();
            let mut ctx = QueryContext::default();
            fm.query(QueryRequest::precision("pair", 0.9), &mut ctx).unwrap();
            let fresh = fm.get("a").unwrap().resonance();
            assert!(fresh > 0.0);

            for _ in 0..80 {
                fm.query(QueryRequest::precision("other", 0.9), &mut ctx).unwrap();
            }
            let decayed = fm.get("a").unwrap().resonance();
            assert!(decayed < fresh);
            (decayed, fm.get("b").unwrap().resonance())
        };

        let fm = engine(SqlitePersistence::new(NodeStore::open(&path).unwrap()));
        assert_eq!(fm.get("a").unwrap().resonance(), in_memory.0);
        assert_eq!(fm.get("b").unwrap().resonance(), in_memory.1);
    }

    #[test]
    fn test_clear_reaches_the_database() {
        let backend = SqlitePersistence::open_in_memory().unwrap();
        let mut fm = engine(backend);
        fm.store(ContentRecord::new("a", "x", "title")).unwrap();
        fm.clear();
        assert!(fm.is_empty());
        assert!(!fm.is_degraded());
    }

    #[test]
    fn test_corrupt_rows_degrade_instead_of_failing() {
        let backend = SqlitePersistence::open_in_memory().unwrap();
        backend.with_store(|s| {
            s.conn()
                .execute(
                    "INSERT INTO nodes (id, category, x, y, z, act_resting, act_threshold, act_current, confidence, content)
                     VALUES ('bad', 'x', 0, 0, 0, 0.1, 0.8, 0.1, 0.5, '{broken')",
                    [],
                )
                .unwrap();
        });
        let fm = engine(backend);
        assert!(fm.is_degraded());
        assert!(fm.is_empty());
    }
}
