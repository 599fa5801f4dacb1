//! Query requests, per-call context, and responses.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::coords::Coord3;
use crate::emergence::EmergentInsight;
use crate::ensemble::InterferencePattern;
use crate::error::{FieldError, Result};
use crate::field::{Distortion, ProbabilityField};
use crate::filter::Filter;
use crate::node::MemoryNode;
use crate::record::Signature;

/// The retrieval style a caller asks for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Precision,
    Discovery,
    Hybrid,
    /// Let the orchestrator decide from confidence and exploration.
    #[default]
    Auto,
}

impl std::str::FromStr for QueryKind {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "precision" => Ok(Self::Precision),
            "discovery" => Ok(Self::Discovery),
            "hybrid" => Ok(Self::Hybrid),
            "auto" => Ok(Self::Auto),
            other => Err(FieldError::malformed(format!(
                "unknown query type '{other}' (expected precision, discovery, hybrid or auto)"
            ))),
        }
    }
}

/// The pipeline a query actually ran through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    Precision,
    Discovery,
    Hybrid,
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Precision => "precision",
            Self::Discovery => "discovery",
            Self::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

fn default_confidence() -> f64 {
    0.5
}

fn default_exploration() -> f64 {
    0.5
}

/// A fully specified query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(default, rename = "type")]
    pub kind: QueryKind,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default = "default_exploration")]
    pub exploration: f64,
    #[serde(default)]
    pub signature: Option<Signature>,
    /// Optional embedding; its first three components become the center.
    #[serde(default)]
    pub embedding: Option<Vec<f64>>,
    #[serde(default)]
    pub center: Option<Coord3>,
    #[serde(default)]
    pub distortion: Option<Distortion>,
    #[serde(default)]
    pub max_results: Option<usize>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub quality_threshold: f64,
    /// Post-hoc relevance of the results. When absent, relevance is read
    /// from the request confidence.
    #[serde(default)]
    pub relevant: Option<bool>,
}

impl Default for QueryRequest {
    fn default() -> Self {
        Self {
            kind: QueryKind::Auto,
            category: None,
            confidence: default_confidence(),
            exploration: default_exploration(),
            signature: None,
            embedding: None,
            center: None,
            distortion: None,
            max_results: None,
            filters: Vec::new(),
            quality_threshold: 0.0,
            relevant: None,
        }
    }
}

impl QueryRequest {
    /// Default discovery-leaning request for a bare category.
    pub fn for_category(category: impl Into<String>) -> Self {
        Self {
            category: Some(category.into()),
            confidence: 0.5,
            exploration: 0.7,
            ..Default::default()
        }
    }

    pub fn precision(category: impl Into<String>, confidence: f64) -> Self {
        Self {
            kind: QueryKind::Precision,
            category: Some(category.into()),
            confidence,
            exploration: 0.1,
            ..Default::default()
        }
    }

    pub fn discovery(category: impl Into<String>, exploration: f64) -> Self {
        Self {
            kind: QueryKind::Discovery,
            category: Some(category.into()),
            confidence: 0.3,
            exploration,
            ..Default::default()
        }
    }

    pub fn hybrid(category: impl Into<String>) -> Self {
        Self {
            kind: QueryKind::Hybrid,
            category: Some(category.into()),
            ..Default::default()
        }
    }

    pub fn with_max_results(mut self, max: usize) -> Self {
        self.max_results = Some(max);
        self
    }

    pub fn with_filters(mut self, filters: Vec<Filter>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_center(mut self, center: Coord3) -> Self {
        self.center = Some(center);
        self
    }

    pub fn with_relevance(mut self, relevant: bool) -> Self {
        self.relevant = Some(relevant);
        self
    }

    /// Explicit category, falling back to the signature's.
    pub fn effective_category(&self) -> Option<&str> {
        self.category
            .as_deref()
            .or(self.signature.as_ref().map(|s| s.category.as_str()))
            .filter(|c| !c.trim().is_empty())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, v) in [("confidence", self.confidence), ("exploration", self.exploration)] {
            if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                return Err(FieldError::malformed(format!("{name} must be in [0, 1], got {v}")));
            }
        }
        if !self.quality_threshold.is_finite() {
            return Err(FieldError::malformed("quality_threshold must be finite"));
        }
        if let Some(e) = &self.embedding
            && (e.is_empty() || e.iter().any(|v| !v.is_finite()))
        {
            return Err(FieldError::malformed("embedding must be non-empty and finite"));
        }
        if let Some(c) = self.center
            && !c.is_finite()
        {
            return Err(FieldError::malformed("center must be finite"));
        }
        let category = self.effective_category();
        if category.is_none() && self.center.is_none() && self.embedding.is_none() {
            return Err(FieldError::malformed(
                "query needs a category, signature, center or embedding",
            ));
        }
        if category.is_none() && matches!(self.kind, QueryKind::Precision | QueryKind::Hybrid) {
            return Err(FieldError::malformed(format!(
                "{:?} queries need a category",
                self.kind
            )));
        }
        Ok(())
    }
}

impl From<&str> for QueryRequest {
    fn from(category: &str) -> Self {
        Self::for_category(category)
    }
}

impl From<String> for QueryRequest {
    fn from(category: String) -> Self {
        Self::for_category(category)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct ContextEntry {
    category: Option<String>,
    center: Coord3,
    successful: bool,
}

/// Recent-query history and active categories, owned by the caller and
/// passed into each orchestrator call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryContext {
    recent: VecDeque<ContextEntry>,
    active_categories: HashSet<String>,
    capacity: usize,
}

impl Default for QueryContext {
    fn default() -> Self {
        Self::new(32)
    }
}

impl QueryContext {
    pub fn new(capacity: usize) -> Self {
        Self {
            recent: VecDeque::new(),
            active_categories: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    /// Remember a finished query's field center.
    pub fn record(&mut self, category: Option<&str>, center: Coord3, successful: bool) {
        self.recent.push_back(ContextEntry {
            category: category.map(str::to_string),
            center,
            successful,
        });
        while self.recent.len() > self.capacity {
            self.recent.pop_front();
        }
    }

    pub fn activate(&mut self, category: impl Into<String>) {
        self.active_categories.insert(category.into());
    }

    pub fn deactivate(&mut self, category: &str) {
        self.active_categories.remove(category);
    }

    pub fn is_active(&self, category: &str) -> bool {
        self.active_categories.contains(category)
    }

    /// Centers of recent successful queries for `category`.
    pub fn successful_centers(&self, category: &str) -> Vec<Coord3> {
        self.recent
            .iter()
            .filter(|e| e.successful && e.category.as_deref() == Some(category))
            .map(|e| e.center)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.recent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.is_empty()
    }
}

/// Per-query measurements.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub latency_ms: f64,
    pub candidates_considered: usize,
    pub ensemble_size: usize,
    pub emergence_ran: bool,
    /// The persistence collaborator was unreachable during this query.
    pub degraded: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    pub memories: Vec<MemoryNode>,
    pub emergent_insights: Vec<EmergentInsight>,
    pub interference_patterns: Vec<InterferencePattern>,
    pub coherence_level: f64,
    pub field_used: ProbabilityField,
    pub mode: QueryMode,
    pub execution_metrics: ExecutionMetrics,
    /// Human-readable explanation when nothing was found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl QueryResponse {
    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.memories.iter().map(|m| m.id.as_str()).collect()
    }
}
