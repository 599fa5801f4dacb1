//! Field memory: a hybrid retrieval engine.
//!
//! Records live as nodes in a bounded 3-D space. A query becomes a
//! probability field over that space; nodes inside the field form a
//! weighted ensemble whose interference patterns seed emergent insights.
//! Precision queries skip the field entirely and read the category index.
//! Every query feeds back into node confidence, activation, co-retrieval
//! strength and position.
//!
//! Zero I/O. Persistence is an optional collaborator behind
//! [`Persistence`]; the engine keeps working in memory when it fails.

pub mod adaptation;
pub mod config;
pub mod constants;
pub mod coords;
pub mod emergence;
pub mod engine;
pub mod ensemble;
pub mod error;
pub mod field;
pub mod filter;
pub mod node;
pub mod observer;
pub mod persistence;
pub mod query;
pub mod record;
pub mod shared;
pub mod snapshot;
pub mod store;
pub mod time;
pub mod tokenizer;

pub use adaptation::{AdaptationEngine, AdaptationStats, FeedbackResult, FeedbackSignal, Outcome};
pub use config::FieldMemoryConfig;
pub use coords::{Coord3, SpaceBounds};
pub use emergence::{EmergenceEngine, EmergentInsight, TriggerPolicy};
pub use engine::{FieldMemory, FieldStats, RollingMetrics, SimilarOptions};
pub use ensemble::{
    ConflictTable, Ensemble, EnsembleEngine, EnsembleMember, InterferenceKind, InterferencePattern, collapse,
};
pub use error::{FieldError, Result};
pub use field::{Distortion, FieldGenerator, ProbabilityField};
pub use filter::{Filter, Predicate};
pub use node::{Activation, MemoryNode, NodeContent};
pub use observer::{EventLog, FieldEvent, FieldObserver, TracingObserver};
pub use persistence::{Persistence, PersistenceError};
pub use query::{ExecutionMetrics, QueryContext, QueryKind, QueryMode, QueryRequest, QueryResponse};
pub use record::{ContentRecord, Payload, Signature};
pub use shared::SharedFieldMemory;
pub use snapshot::{SNAPSHOT_VERSION, WireNode, export_json, import_json};
pub use store::{QueryOptions, RecordStore};
pub use time::{Clock, ManualClock, SystemClock};
