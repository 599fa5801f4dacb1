//! Optional persistence collaborator.
//!
//! The engine keeps its primary state in memory. A backend is called on
//! store, after query adaptation and on clear. Every call is best-effort:
//! failures put the engine in degraded mode instead of failing the caller.

use crate::node::MemoryNode;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("persistence backend unavailable: {0}")]
    Unavailable(String),

    #[error("persisted data is unreadable: {0}")]
    Corrupt(String),
}

pub trait Persistence: Send + Sync {
    /// Upsert the given nodes.
    fn save(&self, nodes: &[&MemoryNode]) -> Result<(), PersistenceError>;

    /// Every persisted node.
    fn load(&self) -> Result<Vec<MemoryNode>, PersistenceError>;

    /// Remove every persisted node.
    fn clear(&self) -> Result<(), PersistenceError>;

    /// Make everything saved so far durable. Called on clean shutdown.
    fn flush(&self) -> Result<(), PersistenceError> {
        Ok(())
    }
}
