//! The retrieval orchestrator.
//!
//! Each query runs the same lifecycle: classify into a mode, retrieve
//! through that mode's pipeline, run emergence (never in precision mode),
//! snapshot the response, then adapt. The response always shows the node
//! state from before adaptation.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::adaptation::{AdaptationEngine, AdaptationStats, FeedbackResult, FeedbackSignal, Outcome};
use crate::config::FieldMemoryConfig;
use crate::coords::Coord3;
use crate::emergence::{DetectOptions, EmergenceEngine, EmergentInsight, TriggerPolicy};
use crate::ensemble::{ConflictTable, Ensemble, EnsembleEngine, collapse};
use crate::error::{FieldError, Result};
use crate::field::{FieldGenerator, ProbabilityField};
use crate::filter::matches_all;
use crate::node::MemoryNode;
use crate::observer::{FieldEvent, FieldObserver};
use crate::persistence::{Persistence, PersistenceError};
use crate::query::{ExecutionMetrics, QueryContext, QueryKind, QueryMode, QueryRequest, QueryResponse};
use crate::record::{ContentRecord, clamp_unit};
use crate::snapshot;
use crate::store::{QueryOptions, RecordStore};
use crate::time::{Clock, SystemClock, unix_ms_to_iso8601};

/// Per-mode query counters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModeCounts {
    pub precision: u64,
    pub discovery: u64,
    pub hybrid: u64,
}

/// Exponential moving averages over completed queries.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RollingMetrics {
    pub total_queries: u64,
    pub avg_latency_ms: f64,
    /// Share of queries that returned at least one memory.
    pub hit_rate: f64,
    /// Share of queries that produced at least one insight.
    pub emergence_frequency: f64,
    pub modes: ModeCounts,
}

impl RollingMetrics {
    fn record(&mut self, alpha: f64, latency_ms: f64, hit: bool, emerged: bool, mode: QueryMode) {
        let ema = |prev: f64, sample: f64, first: bool| {
            if first { sample } else { prev + alpha * (sample - prev) }
        };
        let first = self.total_queries == 0;
        self.avg_latency_ms = ema(self.avg_latency_ms, latency_ms, first);
        self.hit_rate = ema(self.hit_rate, if hit { 1.0 } else { 0.0 }, first);
        self.emergence_frequency = ema(self.emergence_frequency, if emerged { 1.0 } else { 0.0 }, first);
        self.total_queries += 1;
        match mode {
            QueryMode::Precision => self.modes.precision += 1,
            QueryMode::Discovery => self.modes.discovery += 1,
            QueryMode::Hybrid => self.modes.hybrid += 1,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldStats {
    pub total_memories: usize,
    pub categories: BTreeMap<String, usize>,
    pub metrics: RollingMetrics,
    pub adaptation: AdaptationStats,
    /// The persistence collaborator is unreachable; state is memory-only.
    pub degraded: bool,
    pub persistent: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarOptions {
    pub min_similarity: f64,
    pub max_results: usize,
}

impl Default for SimilarOptions {
    fn default() -> Self {
        Self {
            min_similarity: 0.0,
            max_results: 10,
        }
    }
}

/// Output of one mode pipeline, before emergence.
struct Retrieval {
    ids: Vec<String>,
    ensemble: Ensemble,
    field: ProbabilityField,
    candidates: usize,
}

pub struct FieldMemory {
    config: FieldMemoryConfig,
    store: RecordStore,
    fields: FieldGenerator,
    ensembles: EnsembleEngine,
    emergence: EmergenceEngine,
    adaptation: AdaptationEngine,
    rng: SmallRng,
    clock: Box<dyn Clock>,
    persistence: Option<Box<dyn Persistence>>,
    observers: Vec<Arc<dyn FieldObserver>>,
    metrics: RollingMetrics,
    degraded: bool,
    /// Last query or idle scan, for the idle policy.
    last_activity_ms: u64,
}

impl FieldMemory {
    pub fn new(config: FieldMemoryConfig) -> Result<Self> {
        Self::with_clock(config, Box::new(SystemClock))
    }

    pub fn with_clock(config: FieldMemoryConfig, clock: Box<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };
        let now = clock.now_ms();
        Ok(Self {
            store: RecordStore::new(config.space, config.store.clone(), config.field.clone()),
            fields: FieldGenerator::new(config.space, config.field.clone()),
            ensembles: EnsembleEngine::new(config.ensemble.clone()),
            emergence: EmergenceEngine::new(config.emergence.clone()),
            adaptation: AdaptationEngine::new(config.adaptation.clone()),
            config,
            rng,
            clock,
            persistence: None,
            observers: Vec::new(),
            metrics: RollingMetrics::default(),
            degraded: false,
            last_activity_ms: now,
        })
    }

    /// Replace the conflict table from the configuration.
    pub fn with_conflicts(mut self, conflicts: ConflictTable) -> Self {
        self.ensembles = EnsembleEngine::new(self.config.ensemble.clone()).with_conflicts(conflicts);
        self
    }

    /// Attach a persistence backend and load what it holds. A failing
    /// backend leaves the engine empty and degraded, never errored.
    pub fn with_persistence(mut self, backend: Box<dyn Persistence>) -> Self {
        match backend.load() {
            Ok(nodes) => {
                let count = nodes.len();
                for node in nodes {
                    self.store.insert_node(node);
                }
                info!(count, "loaded persisted memories");
            }
            Err(e) => self.note_persistence(Err(e)),
        }
        self.persistence = Some(backend);
        self
    }

    pub fn subscribe(&mut self, observer: Arc<dyn FieldObserver>) {
        self.observers.push(observer);
    }

    fn notify(&self, event: FieldEvent) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }

    pub fn config(&self) -> &FieldMemoryConfig {
        &self.config
    }

    pub fn store_ref(&self) -> &RecordStore {
        &self.store
    }

    pub fn adaptation(&self) -> &AdaptationEngine {
        &self.adaptation
    }

    pub fn metrics(&self) -> &RollingMetrics {
        &self.metrics
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&MemoryNode> {
        self.store.get(id)
    }

    // --- store ---

    pub fn store(&mut self, record: ContentRecord) -> Result<()> {
        let now = self.clock.now_ms();
        self.store.store(&record, now)?;
        debug!(id = %record.id, category = %record.category, "stored memory");
        self.persist(std::slice::from_ref(&record.id));
        self.notify(FieldEvent::Stored { count: 1 });
        Ok(())
    }

    /// Store every record or none of them.
    pub fn bulk_store(&mut self, records: Vec<ContentRecord>) -> Result<usize> {
        let now = self.clock.now_ms();
        let count = self.store.bulk_store(&records, now)?;
        let ids: Vec<String> = records.into_iter().map(|r| r.id).collect();
        debug!(count, "bulk stored memories");
        self.persist(&ids);
        self.notify(FieldEvent::Stored { count });
        Ok(count)
    }

    // --- query ---

    /// Mode for a validated request.
    pub fn classify(&self, request: &QueryRequest) -> QueryMode {
        let q = &self.config.query;
        let has_category = request.effective_category().is_some();
        match request.kind {
            QueryKind::Precision => {
                if request.confidence < q.precision_min_confidence && request.exploration >= q.discovery_exploration {
                    QueryMode::Hybrid
                } else {
                    QueryMode::Precision
                }
            }
            QueryKind::Discovery => QueryMode::Discovery,
            QueryKind::Hybrid => QueryMode::Hybrid,
            QueryKind::Auto => {
                if !has_category || request.exploration >= q.discovery_exploration {
                    QueryMode::Discovery
                } else if request.confidence >= q.auto_precision_confidence {
                    QueryMode::Precision
                } else {
                    QueryMode::Hybrid
                }
            }
        }
    }

    pub fn query(&mut self, request: impl Into<QueryRequest>, context: &mut QueryContext) -> Result<QueryResponse> {
        let started = Instant::now();
        let request = request.into();
        request.validate()?;
        let mode = self.classify(&request);
        let now = self.clock.now_ms();
        let idle_due = self.emergence.idle_due(Some(self.last_activity_ms), now);
        let max = request.max_results.unwrap_or(self.config.query.default_max_results);
        let field = match self.stored_anchor(&request, mode) {
            Some(base) => self.fields.generate_field_around(&request, context, base),
            None => self.fields.generate_field(&request, context),
        };

        let retrieval = match mode {
            QueryMode::Precision => self.retrieve_precision(&request, field, max)?,
            QueryMode::Discovery => self.retrieve_discovery(&request, field, max),
            QueryMode::Hybrid => self.retrieve_hybrid(&request, field, max)?,
        };

        let insights = match mode {
            QueryMode::Precision => Vec::new(),
            QueryMode::Discovery => self.emerge(&retrieval, self.emergence.discovery_options(), idle_due),
            QueryMode::Hybrid => self.emerge(&retrieval, self.emergence.hybrid_options(), idle_due),
        };

        let relevant = request
            .relevant
            .unwrap_or_else(|| self.adaptation.is_relevant(request.confidence));
        let category = request.effective_category().map(str::to_string);
        let note = retrieval.ids.is_empty().then(|| match &category {
            Some(c) => format!("no memories matched the {mode} query for category '{c}'"),
            None => format!("no memories matched the {mode} query"),
        });

        let response = self.respond_and_adapt(mode, retrieval, insights, relevant, now, started, note);
        context.record(category.as_deref(), response.field_used.center, relevant && !response.is_empty());
        Ok(response)
    }

    /// Where a category's records actually sit. Discovery and hybrid
    /// fields start from the centroid of the matching stored nodes unless
    /// the request pins a position; records placed at explicit coordinates
    /// are nowhere near the category's hash anchor.
    fn stored_anchor(&self, request: &QueryRequest, mode: QueryMode) -> Option<Coord3> {
        let pinned = request.center.is_some() || request.embedding.as_deref().is_some_and(|e| !e.is_empty());
        if mode == QueryMode::Precision || pinned {
            return None;
        }
        let category = request.effective_category()?;
        let options = QueryOptions {
            center: None,
            radius: f64::INFINITY,
            quality_threshold: request.quality_threshold,
            max_results: usize::MAX,
        };
        let points: Vec<Coord3> = self
            .store
            .query(category, &request.filters, &options)
            .iter()
            .map(|n| n.coordinates)
            .collect();
        Coord3::centroid(&points)
    }

    fn retrieve_precision(&self, request: &QueryRequest, field: ProbabilityField, max: usize) -> Result<Retrieval> {
        let category = required_category(request)?;
        let narrowed = self.fields.narrow(&field, self.config.field.precision_narrowing);
        let options = QueryOptions {
            center: None,
            radius: f64::INFINITY,
            quality_threshold: request.quality_threshold,
            max_results: usize::MAX,
        };
        let mut hits = self.store.query(category, &request.filters, &options);
        let candidates = hits.len();

        // The narrowed field only orders equal-confidence hits.
        let closeness = |n: &MemoryNode| {
            let d = narrowed.distance_to(n.coordinates);
            self.ensembles.probability(n, d, narrowed.radius)
        };
        hits.sort_by(|a, b| {
            b.confidence()
                .total_cmp(&a.confidence())
                .then_with(|| closeness(b).total_cmp(&closeness(a)))
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(max);

        let ensemble = self.ensembles.create_ensemble(&narrowed, &hits, &self.adaptation);
        Ok(Retrieval {
            ids: hits.iter().map(|n| n.id.clone()).collect(),
            ensemble,
            field: narrowed,
            candidates,
        })
    }

    fn retrieve_discovery(&mut self, request: &QueryRequest, mut field: ProbabilityField, max: usize) -> Retrieval {
        for _ in 0..self.config.query.morph_steps {
            self.fields.morph_field(&mut field, self.config.field.morph_step, &mut self.rng);
        }
        let reach = field.cutoff() / min_stretch(&field);
        let candidates: Vec<&MemoryNode> = self
            .store
            .within(field.center, reach)
            .into_iter()
            .filter(|n| n.confidence() >= request.quality_threshold)
            .filter(|n| matches_all(&request.filters, n))
            .collect();
        let ensemble = self.ensembles.create_ensemble(&field, &candidates, &self.adaptation);
        Retrieval {
            ids: collapse(&ensemble, max),
            candidates: candidates.len(),
            ensemble,
            field,
        }
    }

    fn retrieve_hybrid(&self, request: &QueryRequest, field: ProbabilityField, max: usize) -> Result<Retrieval> {
        let category = required_category(request)?;
        let q = &self.config.query;
        let options = QueryOptions {
            center: Some(field.center),
            radius: field.radius * q.hybrid_radius_factor,
            quality_threshold: request.quality_threshold,
            max_results: max.saturating_mul(q.hybrid_overfetch.max(1)),
        };
        let candidates = self.store.query(category, &request.filters, &options);
        let wide = self.fields.widen(&field, q.hybrid_radius_factor);
        let ensemble = self.ensembles.create_ensemble(&wide, &candidates, &self.adaptation);
        Ok(Retrieval {
            ids: collapse(&ensemble, max),
            candidates: candidates.len(),
            ensemble,
            field: wide,
        })
    }

    /// Query-time emergence: the ensemble scan plus whichever policies fire.
    fn emerge(&self, retrieval: &Retrieval, options: DetectOptions, idle_due: bool) -> Vec<EmergentInsight> {
        let mut insights = self.emergence.detect(&retrieval.ensemble, &self.store, &options);

        let members: Vec<&MemoryNode> = retrieval
            .ensemble
            .members
            .iter()
            .filter_map(|m| self.store.get(&m.node_id))
            .collect();
        let firing = self.emergence.firing(&members);
        if !firing.is_empty() {
            insights.extend(self.emergence.cascade(&firing, &self.store, &self.adaptation));
        }

        if let Some(factor) = self.emergence.uncertainty_widen(retrieval.ensemble.coherence) {
            let wide = self.fields.widen(&retrieval.field, factor);
            let reach = wide.cutoff() / min_stretch(&wide);
            let candidates = self.store.within(wide.center, reach);
            let patterns = self.ensembles.interference(&candidates);
            debug!(factor, candidates = candidates.len(), "uncertainty widened the field");
            insights.extend(
                self.emergence
                    .detect_groups(&patterns, &self.store, &options, Some(TriggerPolicy::Uncertainty)),
            );
        }

        if idle_due {
            insights.extend(self.scan_store(1.0, options, TriggerPolicy::Idle));
        }

        dedup_and_rank(&mut insights, options.max_insights);
        insights
    }

    /// Whole-store group scan with the interference radius scaled by
    /// `radius_factor`.
    fn scan_store(&self, radius_factor: f64, options: DetectOptions, trigger: TriggerPolicy) -> Vec<EmergentInsight> {
        let mut nodes: Vec<&MemoryNode> = self.store.iter().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        let radius = self.ensembles.config().interference_radius * radius_factor;
        let patterns = self.ensembles.interference_within(&nodes, radius);
        debug!(%trigger, nodes = nodes.len(), patterns = patterns.len(), "store-wide emergence scan");
        self.emergence
            .detect_groups(&patterns, &self.store, &options, Some(trigger))
    }

    #[allow(clippy::too_many_arguments)]
    fn respond_and_adapt(
        &mut self,
        mode: QueryMode,
        retrieval: Retrieval,
        insights: Vec<EmergentInsight>,
        relevant: bool,
        now: u64,
        started: Instant,
        note: Option<String>,
    ) -> QueryResponse {
        let memories: Vec<MemoryNode> = retrieval
            .ids
            .iter()
            .filter_map(|id| self.store.get(id).cloned())
            .collect();

        let touched = self.adaptation.process_outcome(
            &mut self.store,
            &Outcome {
                result_ids: retrieval.ids.clone(),
                relevant,
                now,
            },
        );
        self.persist(&touched);
        self.last_activity_ms = now;

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let emergence_ran = mode != QueryMode::Precision;
        self.metrics.record(
            self.config.metrics.ema_alpha,
            latency_ms,
            !memories.is_empty(),
            !insights.is_empty(),
            mode,
        );
        debug!(
            %mode,
            candidates = retrieval.candidates,
            results = memories.len(),
            insights = insights.len(),
            coherence = retrieval.ensemble.coherence,
            "query complete"
        );

        self.notify(FieldEvent::QueryCompleted {
            mode,
            results: memories.len(),
            latency_ms,
        });
        if !insights.is_empty() {
            self.notify(FieldEvent::InsightsEmerged {
                count: insights.len(),
                trigger: None,
            });
        }

        QueryResponse {
            memories,
            emergent_insights: insights,
            interference_patterns: retrieval.ensemble.interference,
            coherence_level: clamp_unit(retrieval.ensemble.coherence),
            field_used: retrieval.field,
            mode,
            execution_metrics: ExecutionMetrics {
                latency_ms,
                candidates_considered: retrieval.candidates,
                ensemble_size: retrieval.ensemble.members.len(),
                emergence_ran,
                degraded: self.degraded,
            },
            note,
        }
    }

    /// Precision lookup around an existing node. Similarity is spatial
    /// closeness in units of the base radius, halved across categories.
    pub fn find_similar(&mut self, id: &str, options: SimilarOptions) -> Result<QueryResponse> {
        let started = Instant::now();
        let now = self.clock.now_ms();
        let origin = self.store.get_or_err(id)?;
        let center = origin.coordinates;
        let category = origin.category().to_string();
        let scale = self.config.field.base_radius;

        let similarity = |n: &MemoryNode| {
            let closeness = clamp_unit(1.0 - n.coordinates.distance(center) / scale);
            if n.category() == category { closeness } else { 0.5 * closeness }
        };
        let mut hits: Vec<(&MemoryNode, f64)> = self
            .store
            .within(center, scale)
            .into_iter()
            .filter(|n| n.id != id)
            .map(|n| (n, similarity(n)))
            .filter(|(_, s)| *s >= options.min_similarity && *s > 0.0)
            .collect();
        let candidates = hits.len();
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.id.cmp(&b.0.id)));
        hits.truncate(options.max_results);

        let field = ProbabilityField {
            center,
            radius: scale * self.config.field.precision_narrowing,
            distortion: None,
            dominant_cap: self.config.field.dominant_cap,
        };
        let nodes: Vec<&MemoryNode> = hits.iter().map(|(n, _)| *n).collect();
        let ensemble = self.ensembles.create_ensemble(&field, &nodes, &self.adaptation);
        let ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        let note = ids
            .is_empty()
            .then(|| format!("no memories similar to '{id}' above {:.2}", options.min_similarity));

        let retrieval = Retrieval {
            ids,
            ensemble,
            field,
            candidates,
        };
        let relevant = self.adaptation.is_relevant(self.config.query.auto_precision_confidence);
        Ok(self.respond_and_adapt(QueryMode::Precision, retrieval, Vec::new(), relevant, now, started, note))
    }

    // --- emergence on demand ---

    /// Force a trigger policy by name, bypassing its gate.
    pub fn trigger_emergent_discovery(&mut self, policy: &str) -> Result<Vec<EmergentInsight>> {
        let policy: TriggerPolicy = policy.parse()?;
        Ok(self.trigger_policy(policy))
    }

    pub fn trigger_policy(&mut self, policy: TriggerPolicy) -> Vec<EmergentInsight> {
        let options = self.emergence.discovery_options();
        let insights = match policy {
            TriggerPolicy::Idle => {
                self.last_activity_ms = self.clock.now_ms();
                self.scan_store(1.0, options, TriggerPolicy::Idle)
            }
            TriggerPolicy::Cascade => {
                let mut seeds: Vec<&MemoryNode> = self.store.iter().filter(|n| n.activation.is_firing()).collect();
                if seeds.is_empty()
                    && let Some(hottest) = self.store.iter().max_by(|a, b| {
                        a.activation
                            .current
                            .total_cmp(&b.activation.current)
                            .then_with(|| b.id.cmp(&a.id))
                    })
                {
                    seeds.push(hottest);
                }
                seeds.sort_by(|a, b| a.id.cmp(&b.id));
                self.emergence.cascade(&seeds, &self.store, &self.adaptation)
            }
            TriggerPolicy::Uncertainty => {
                let factor = self.config.emergence.uncertainty.widen_factor;
                self.scan_store(factor, options, TriggerPolicy::Uncertainty)
            }
            TriggerPolicy::Synthesis if !self.config.emergence.synthesis.enabled => {
                debug!("synthesis policy disabled");
                Vec::new()
            }
            TriggerPolicy::Synthesis => {
                let any_group = DetectOptions {
                    threshold: 0.0,
                    ..options
                };
                self.scan_store(1.0, any_group, TriggerPolicy::Synthesis)
            }
        };
        info!(%policy, insights = insights.len(), "forced emergent discovery");
        if !insights.is_empty() {
            self.notify(FieldEvent::InsightsEmerged {
                count: insights.len(),
                trigger: Some(policy),
            });
        }
        insights
    }

    /// Background maintenance: activation leak, stale resonance decay and,
    /// when the idle interval has passed, an idle scan.
    pub fn idle_tick(&mut self) -> Vec<EmergentInsight> {
        let now = self.clock.now_ms();
        let touched = self.adaptation.reinforce(&mut self.store, now);
        debug!(settled = touched.len(), "background reinforcement");
        self.persist(&touched);
        if !self.emergence.idle_due(Some(self.last_activity_ms), now) {
            return Vec::new();
        }
        self.last_activity_ms = now;
        let insights = self.scan_store(1.0, self.emergence.discovery_options(), TriggerPolicy::Idle);
        if !insights.is_empty() {
            self.notify(FieldEvent::InsightsEmerged {
                count: insights.len(),
                trigger: Some(TriggerPolicy::Idle),
            });
        }
        insights
    }

    // --- feedback ---

    pub fn apply_feedback(&mut self, ids: &[String], signal: FeedbackSignal) -> FeedbackResult {
        let now = self.clock.now_ms();
        let result = self.adaptation.apply_feedback(&mut self.store, ids, signal, now);
        self.persist(ids);
        self.notify(FieldEvent::FeedbackApplied {
            nodes: result.boosted + result.demoted,
        });
        result
    }

    // --- maintenance ---

    pub fn stats(&self) -> FieldStats {
        FieldStats {
            total_memories: self.store.len(),
            categories: self.store.category_counts().into_iter().collect(),
            metrics: self.metrics.clone(),
            adaptation: self.adaptation.stats(),
            degraded: self.degraded,
            persistent: self.persistence.is_some(),
        }
    }

    pub fn clear(&mut self) {
        self.store.clear();
        self.adaptation.clear();
        if let Some(backend) = &self.persistence {
            let result = backend.clear();
            self.note_persistence(result);
        }
        info!("field memory cleared");
        self.notify(FieldEvent::Cleared);
    }

    pub fn export_json(&self) -> Result<String> {
        snapshot::export_json(self.store.iter(), &unix_ms_to_iso8601(self.clock.now_ms()))
    }

    /// Merge a snapshot into the store, overwriting nodes with the same id.
    /// Nothing is inserted if any node in the snapshot is malformed.
    pub fn import_json(&mut self, json: &str) -> Result<usize> {
        let nodes = snapshot::import_json(json)?;
        let ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        for node in nodes {
            self.store.insert_node(node);
        }
        self.persist(&ids);
        self.notify(FieldEvent::Stored { count: ids.len() });
        Ok(ids.len())
    }

    // --- persistence ---

    /// Flush the persistence backend, if any.
    pub fn flush(&mut self) {
        if let Some(backend) = &self.persistence {
            let result = backend.flush();
            self.note_persistence(result);
        }
    }

    fn persist(&mut self, ids: &[String]) {
        let Some(backend) = &self.persistence else {
            return;
        };
        if ids.is_empty() {
            return;
        }
        let nodes: Vec<&MemoryNode> = ids.iter().filter_map(|id| self.store.get(id)).collect();
        let result = backend.save(&nodes);
        self.note_persistence(result);
    }

    fn note_persistence(&mut self, result: std::result::Result<(), PersistenceError>) {
        match result {
            Ok(()) => {
                if self.degraded {
                    self.degraded = false;
                    info!("persistence recovered");
                    self.notify(FieldEvent::Recovered);
                }
            }
            Err(e) => {
                warn!(error = %e, "persistence failed, continuing in memory");
                self.degraded = true;
                self.notify(FieldEvent::Degraded { reason: e.to_string() });
            }
        }
    }
}

fn required_category(request: &QueryRequest) -> Result<&str> {
    request
        .effective_category()
        .ok_or_else(|| FieldError::malformed("this query mode needs a category"))
}

/// Smallest axis stretch of a field, at most 1. Dividing the cutoff by it
/// gives a plain radius that covers every point the field admits.
fn min_stretch(field: &ProbabilityField) -> f64 {
    field
        .distortion
        .map_or(1.0, |d| d.stretch.iter().copied().fold(1.0, f64::min))
        .max(1e-6)
}

fn dedup_and_rank(insights: &mut Vec<EmergentInsight>, max: usize) {
    let mut seen = HashSet::new();
    insights.retain(|i| seen.insert(i.id));
    insights.sort_by(|a, b| b.score().total_cmp(&a.score()).then_with(|| a.id.cmp(&b.id)));
    insights.truncate(max);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use crate::observer::EventLog;
    use crate::time::ManualClock;

    fn seeded() -> FieldMemoryConfig {
        FieldMemoryConfig {
            seed: Some(7),
            ..Default::default()
        }
    }

    fn memory() -> (FieldMemory, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        let fm = FieldMemory::with_clock(seeded(), Box::new(clock.clone())).unwrap();
        (fm, clock)
    }

    fn rec(id: &str, category: &str, confidence: f64) -> ContentRecord {
        ContentRecord::new(id, category, format!("{id} title")).with_confidence(confidence)
    }

    #[test]
    fn test_classification() {
        let (fm, _) = memory();
        assert_eq!(fm.classify(&QueryRequest::precision("x", 0.9)), QueryMode::Precision);
        assert_eq!(fm.classify(&QueryRequest::discovery("x", 0.9)), QueryMode::Discovery);
        assert_eq!(fm.classify(&QueryRequest::hybrid("x")), QueryMode::Hybrid);
        assert_eq!(fm.classify(&"x".into()), QueryMode::Discovery);

        let unsure_precision = QueryRequest {
            exploration: 0.9,
            ..QueryRequest::precision("x", 0.1)
        };
        assert_eq!(fm.classify(&unsure_precision), QueryMode::Hybrid);

        let auto_confident = QueryRequest {
            confidence: 0.9,
            exploration: 0.1,
            ..QueryRequest::for_category("x")
        };
        assert_eq!(fm.classify(&auto_confident), QueryMode::Precision);

        let auto_middle = QueryRequest {
            confidence: 0.5,
            exploration: 0.3,
            ..QueryRequest::for_category("x")
        };
        assert_eq!(fm.classify(&auto_middle), QueryMode::Hybrid);
    }

    #[test]
    fn test_precision_ties_prefer_field_center() {
        let (mut fm, _) = memory();
        let center = fm
            .fields
            .generate_field(&QueryRequest::precision("x", 0.9), &QueryContext::default())
            .center;
        fm.store(rec("far", "x", 0.5).with_coordinates(center + Coord3::new(0.5, 0.0, 0.0)))
            .unwrap();
        fm.store(rec("near", "x", 0.5).with_coordinates(center)).unwrap();
        let mut ctx = QueryContext::default();
        let resp = fm.query(QueryRequest::precision("x", 0.9), &mut ctx).unwrap();
        assert_eq!(resp.ids(), vec!["near", "far"]);
    }

    #[test]
    fn test_response_reflects_pre_adaptation_state() {
        let (mut fm, _) = memory();
        fm.store(rec("a", "x", 0.5)).unwrap();
        let mut ctx = QueryContext::default();
        let resp = fm.query(QueryRequest::precision("x", 0.9), &mut ctx).unwrap();
        assert_eq!(resp.memories[0].confidence(), 0.5);
        assert!(resp.memories[0].access_history.is_empty());
        assert!(fm.get("a").unwrap().confidence() > 0.5);
        assert_eq!(fm.get("a").unwrap().access_history.len(), 1);
    }

    #[test]
    fn test_empty_result_has_note() {
        let (mut fm, _) = memory();
        let mut ctx = QueryContext::default();
        let resp = fm.query("nothing-here", &mut ctx).unwrap();
        assert!(resp.is_empty());
        assert!(resp.note.as_deref().unwrap_or_default().contains("nothing-here"));
        assert_eq!(fm.metrics().total_queries, 1);
        assert_eq!(fm.metrics().hit_rate, 0.0);
    }

    #[test]
    fn test_malformed_request_mutates_nothing() {
        let (mut fm, _) = memory();
        fm.store(rec("a", "x", 0.5)).unwrap();
        let mut ctx = QueryContext::default();
        let bad = QueryRequest::precision("x", 4.0);
        assert!(matches!(fm.query(bad, &mut ctx), Err(FieldError::MalformedInput(_))));
        assert_eq!(fm.metrics().total_queries, 0);
        assert!(fm.get("a").unwrap().access_history.is_empty());
    }

    #[test]
    fn test_filters_apply_in_every_mode() {
        let (mut fm, _) = memory();
        fm.store(rec("tagged", "x", 0.5).with_tags(["keep"])).unwrap();
        fm.store(rec("plain", "x", 0.6)).unwrap();
        let mut ctx = QueryContext::default();
        for req in [
            QueryRequest::precision("x", 0.9),
            QueryRequest::hybrid("x"),
            QueryRequest::discovery("x", 0.9),
        ] {
            let req = req.with_filters(vec![Filter::tag("keep")]);
            let resp = fm.query(req, &mut ctx).unwrap();
            assert_eq!(resp.ids(), vec!["tagged"], "mode {}", resp.mode);
        }
    }

    #[test]
    fn test_find_similar_excludes_origin() {
        let (mut fm, _) = memory();
        fm.store(rec("a", "x", 0.5).with_coordinates(Coord3::ORIGIN)).unwrap();
        fm.store(rec("b", "x", 0.5).with_coordinates(Coord3::new(0.05, 0.0, 0.0)))
            .unwrap();
        fm.store(rec("c", "y", 0.5).with_coordinates(Coord3::new(0.05, 0.0, 0.0)))
            .unwrap();
        fm.store(rec("far", "x", 0.5).with_coordinates(Coord3::new(0.9, 0.9, 0.9)))
            .unwrap();
        let resp = fm.find_similar("a", SimilarOptions::default()).unwrap();
        assert_eq!(resp.ids(), vec!["b", "c"]);
        assert_eq!(resp.mode, QueryMode::Precision);
        assert!(resp.emergent_insights.is_empty());

        let strict = SimilarOptions {
            min_similarity: 0.6,
            max_results: 10,
        };
        assert_eq!(fm.find_similar("a", strict).unwrap().ids(), vec!["b"]);
        assert!(matches!(
            fm.find_similar("ghost", SimilarOptions::default()),
            Err(FieldError::UnknownNode(_))
        ));
    }

    #[test]
    fn test_trigger_unknown_policy() {
        let (mut fm, _) = memory();
        assert!(matches!(
            fm.trigger_emergent_discovery("dream"),
            Err(FieldError::UnknownPolicy(_))
        ));
    }

    #[test]
    fn test_forced_synthesis_finds_any_group() {
        let (mut fm, _) = memory();
        fm.store(rec("a", "x", 0.5).with_coordinates(Coord3::ORIGIN)).unwrap();
        fm.store(rec("b", "x", 0.5).with_coordinates(Coord3::new(0.2, 0.0, 0.0)))
            .unwrap();
        // magnitude 0.2 is below the normal group threshold
        assert!(fm.trigger_emergent_discovery("idle").unwrap().is_empty());
        let insights = fm.trigger_emergent_discovery("synthesis").unwrap();
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].trigger, Some(TriggerPolicy::Synthesis));
    }

    #[test]
    fn test_disabled_synthesis_yields_nothing() {
        let mut config = seeded();
        config.emergence.synthesis.enabled = false;
        let mut fm = FieldMemory::with_clock(config, Box::new(ManualClock::new(1_000_000))).unwrap();
        fm.store(rec("a", "x", 0.5).with_coordinates(Coord3::ORIGIN)).unwrap();
        fm.store(rec("b", "x", 0.5).with_coordinates(Coord3::new(0.2, 0.0, 0.0)))
            .unwrap();
        assert!(fm.trigger_emergent_discovery("synthesis").unwrap().is_empty());
        assert!(fm.trigger_emergent_discovery("uncertainty").is_ok());
    }

    #[test]
    fn test_idle_tick_respects_interval() {
        let (mut fm, clock) = memory();
        fm.store(rec("a", "x", 0.5).with_coordinates(Coord3::ORIGIN)).unwrap();
        fm.store(rec("b", "x", 0.5).with_coordinates(Coord3::new(0.01, 0.0, 0.0)))
            .unwrap();
        assert!(fm.idle_tick().is_empty());
        clock.advance(fm.config().emergence.idle.idle_interval_ms);
        let insights = fm.idle_tick();
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].trigger, Some(TriggerPolicy::Idle));
        // the scan counts as activity
        assert!(fm.idle_tick().is_empty());
    }

    #[test]
    fn test_feedback_and_stats() {
        let (mut fm, _) = memory();
        fm.store(rec("a", "x", 0.5)).unwrap();
        fm.store(rec("b", "y", 0.5)).unwrap();
        let r = fm.apply_feedback(&["a".into()], FeedbackSignal::Boost);
        assert_eq!(r.boosted, 1);
        let stats = fm.stats();
        assert_eq!(stats.total_memories, 2);
        assert_eq!(stats.categories.get("x"), Some(&1));
        assert_eq!(stats.adaptation.feedback_events, 1);
        assert!(!stats.persistent);
    }

    #[test]
    fn test_export_import_roundtrip() {
        let (mut fm, _) = memory();
        fm.store(rec("a", "x", 0.7).with_coordinates(Coord3::new(0.2, 0.2, 0.2)))
            .unwrap();
        let json = fm.export_json().unwrap();
        let (mut other, _) = memory();
        assert_eq!(other.import_json(&json).unwrap(), 1);
        let n = other.get("a").unwrap();
        assert_eq!(n.confidence(), 0.7);
        assert_eq!(n.coordinates, Coord3::new(0.2, 0.2, 0.2));
    }

    #[test]
    fn test_import_truncates_long_access_history() {
        let (mut fm, _) = memory();
        fm.store(rec("a", "x", 0.7)).unwrap();
        let mut snapshot: serde_json::Value = serde_json::from_str(&fm.export_json().unwrap()).unwrap();
        snapshot["nodes"][0]["accessHistory"] = serde_json::json!((1..=40).collect::<Vec<u64>>());

        let (mut other, _) = memory();
        other.import_json(&snapshot.to_string()).unwrap();
        let history = &other.get("a").unwrap().access_history;
        assert_eq!(history.len(), seeded().store.access_history_len);
        assert_eq!(history.back(), Some(&40));
    }

    struct UnreachableBackend;

    impl Persistence for UnreachableBackend {
        fn save(&self, _nodes: &[&MemoryNode]) -> std::result::Result<(), PersistenceError> {
            Err(PersistenceError::Unavailable("disk gone".into()))
        }

        fn load(&self) -> std::result::Result<Vec<MemoryNode>, PersistenceError> {
            Err(PersistenceError::Unavailable("disk gone".into()))
        }

        fn clear(&self) -> std::result::Result<(), PersistenceError> {
            Ok(())
        }
    }

    #[test]
    fn test_persistence_failure_degrades_without_error() {
        let clock = ManualClock::new(0);
        let log = EventLog::new();
        let mut fm = FieldMemory::with_clock(seeded(), Box::new(clock))
            .unwrap()
            .with_persistence(Box::new(UnreachableBackend));
        fm.subscribe(Arc::new(log.clone()));
        assert!(fm.is_degraded());

        fm.store(rec("a", "x", 0.5)).unwrap();
        let mut ctx = QueryContext::default();
        let resp = fm.query(QueryRequest::precision("x", 0.9), &mut ctx).unwrap();
        assert_eq!(resp.ids(), vec!["a"]);
        assert!(resp.execution_metrics.degraded);
        assert!(fm.stats().degraded);
        assert!(
            log.events()
                .iter()
                .any(|e| matches!(e, FieldEvent::Degraded { .. }))
        );
    }

    #[test]
    fn test_observers_see_lifecycle() {
        let (mut fm, _) = memory();
        let log = EventLog::new();
        fm.subscribe(Arc::new(log.clone()));
        fm.store(rec("a", "x", 0.5)).unwrap();
        let mut ctx = QueryContext::default();
        fm.query(QueryRequest::precision("x", 0.9), &mut ctx).unwrap();
        fm.clear();
        let events = log.events();
        assert_eq!(events[0], FieldEvent::Stored { count: 1 });
        assert!(matches!(events[1], FieldEvent::QueryCompleted { mode: QueryMode::Precision, results: 1, .. }));
        assert_eq!(events.last(), Some(&FieldEvent::Cleared));
    }

    #[test]
    fn test_context_records_successful_queries() {
        let (mut fm, _) = memory();
        fm.store(rec("a", "x", 0.5)).unwrap();
        let mut ctx = QueryContext::default();
        fm.query(QueryRequest::precision("x", 0.9), &mut ctx).unwrap();
        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx.successful_centers("x").len(), 1);
    }
}
