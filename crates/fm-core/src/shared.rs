//! Thread-safe handle for hosts that query from several threads.
//!
//! Queries take the write lock because every query adapts the nodes it
//! returned. Read-only calls (`stats`, `export_json`, `get`) share the read
//! lock. A poisoned lock is recovered rather than propagated.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::adaptation::{FeedbackResult, FeedbackSignal};
use crate::emergence::EmergentInsight;
use crate::engine::{FieldMemory, FieldStats, SimilarOptions};
use crate::error::Result;
use crate::node::MemoryNode;
use crate::query::{QueryContext, QueryRequest, QueryResponse};
use crate::record::ContentRecord;

#[derive(Clone)]
pub struct SharedFieldMemory {
    inner: Arc<RwLock<FieldMemory>>,
}

impl SharedFieldMemory {
    pub fn new(memory: FieldMemory) -> Self {
        Self {
            inner: Arc::new(RwLock::new(memory)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, FieldMemory> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, FieldMemory> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn store(&self, record: ContentRecord) -> Result<()> {
        self.write().store(record)
    }

    pub fn bulk_store(&self, records: Vec<ContentRecord>) -> Result<usize> {
        self.write().bulk_store(records)
    }

    pub fn query(&self, request: impl Into<QueryRequest>, context: &mut QueryContext) -> Result<QueryResponse> {
        self.write().query(request, context)
    }

    pub fn find_similar(&self, id: &str, options: SimilarOptions) -> Result<QueryResponse> {
        self.write().find_similar(id, options)
    }

    pub fn trigger_emergent_discovery(&self, policy: &str) -> Result<Vec<EmergentInsight>> {
        self.write().trigger_emergent_discovery(policy)
    }

    pub fn apply_feedback(&self, ids: &[String], signal: FeedbackSignal) -> FeedbackResult {
        self.write().apply_feedback(ids, signal)
    }

    pub fn idle_tick(&self) -> Vec<EmergentInsight> {
        self.write().idle_tick()
    }

    pub fn get(&self, id: &str) -> Option<MemoryNode> {
        self.read().get(id).cloned()
    }

    pub fn stats(&self) -> FieldStats {
        self.read().stats()
    }

    pub fn export_json(&self) -> Result<String> {
        self.read().export_json()
    }

    pub fn clear(&self) {
        self.write().clear();
    }
}
