//! Emergent patterns: groups of candidates that mean more together than
//! any of them alone.
//!
//! The base scan takes the reinforcing interference edges of a candidate
//! set, splits them into connected groups and keeps the groups whose summed
//! magnitude clears a threshold. Four trigger policies decide when extra
//! scans run; each can be switched off independently.
//!
//! Insights are reports. Nothing here writes to the store.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::adaptation::AdaptationEngine;
use crate::config::EmergenceConfig;
use crate::ensemble::{Ensemble, InterferencePattern};
use crate::error::FieldError;
use crate::node::MemoryNode;
use crate::record::clamp_unit;
use crate::store::RecordStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerPolicy {
    /// No query for the configured idle interval.
    Idle,
    /// A node's activation crossed its firing threshold.
    Cascade,
    /// Ensemble coherence fell below the uncertainty threshold.
    Uncertainty,
    /// Requested by the caller.
    Synthesis,
}

impl TriggerPolicy {
    pub const ALL: [TriggerPolicy; 4] = [Self::Idle, Self::Cascade, Self::Uncertainty, Self::Synthesis];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Cascade => "cascade",
            Self::Uncertainty => "uncertainty",
            Self::Synthesis => "synthesis",
        }
    }
}

impl fmt::Display for TriggerPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerPolicy {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, FieldError> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| FieldError::UnknownPolicy(s.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmergentInsight {
    /// Stable for a given trigger and supporting set.
    pub id: Uuid,
    pub description: String,
    /// Sorted node ids.
    pub supporting_nodes: Vec<String>,
    pub novelty: f64,
    pub confidence: f64,
    /// `None` for the regular query-time scan.
    #[serde(default)]
    pub trigger: Option<TriggerPolicy>,
}

impl EmergentInsight {
    /// Ranking key: confident and novel insights first.
    pub fn score(&self) -> f64 {
        self.confidence * self.novelty
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectOptions {
    /// Summed reinforcing magnitude a group must exceed.
    pub threshold: f64,
    pub max_insights: usize,
}

pub struct EmergenceEngine {
    config: EmergenceConfig,
}

impl EmergenceEngine {
    pub fn new(config: EmergenceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EmergenceConfig {
        &self.config
    }

    /// Options for a full discovery scan.
    pub fn discovery_options(&self) -> DetectOptions {
        DetectOptions {
            threshold: self.config.group_threshold,
            max_insights: self.config.max_insights,
        }
    }

    /// Stricter, smaller scan for hybrid queries.
    pub fn hybrid_options(&self) -> DetectOptions {
        DetectOptions {
            threshold: self.config.group_threshold * self.config.hybrid_threshold_factor,
            max_insights: self.config.hybrid_max_insights,
        }
    }

    /// Scan an ensemble's reinforcing interference.
    pub fn detect(&self, ensemble: &Ensemble, store: &RecordStore, options: &DetectOptions) -> Vec<EmergentInsight> {
        self.detect_groups(&ensemble.interference, store, options, None)
    }

    /// Connected components over reinforcing edges whose summed magnitude
    /// exceeds `options.threshold`, ranked by confidence × novelty.
    pub fn detect_groups(
        &self,
        patterns: &[InterferencePattern],
        store: &RecordStore,
        options: &DetectOptions,
        trigger: Option<TriggerPolicy>,
    ) -> Vec<EmergentInsight> {
        if options.max_insights == 0 {
            return Vec::new();
        }
        let reinforcing: Vec<&InterferencePattern> = patterns
            .iter()
            .filter(|p| p.kind == crate::ensemble::InterferenceKind::Reinforcing)
            .collect();

        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for p in &reinforcing {
            adjacency.entry(&p.node_a).or_default().push(&p.node_b);
            adjacency.entry(&p.node_b).or_default().push(&p.node_a);
        }

        let mut starts: Vec<&str> = adjacency.keys().copied().collect();
        starts.sort_unstable();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut insights = Vec::new();

        for start in starts {
            if visited.contains(start) {
                continue;
            }
            let mut group: BTreeSet<&str> = BTreeSet::new();
            let mut queue = VecDeque::from([start]);
            visited.insert(start);
            while let Some(id) = queue.pop_front() {
                group.insert(id);
                for next in adjacency.get(id).into_iter().flatten() {
                    if visited.insert(*next) {
                        queue.push_back(*next);
                    }
                }
            }

            let edges: Vec<&InterferencePattern> = reinforcing
                .iter()
                .copied()
                .filter(|p| group.contains(p.node_a.as_str()))
                .collect();
            let total: f64 = edges.iter().map(|p| p.magnitude).sum();
            if total <= options.threshold {
                continue;
            }
            let members: Vec<&MemoryNode> = group.iter().filter_map(|id| store.get(id)).collect();
            if members.len() < 2 {
                continue;
            }
            let mean_magnitude = total / edges.len() as f64;
            insights.push(self.group_insight(&members, mean_magnitude, trigger));
        }

        rank(&mut insights, options.max_insights);
        insights
    }

    fn group_insight(&self, members: &[&MemoryNode], mean_magnitude: f64, trigger: Option<TriggerPolicy>) -> EmergentInsight {
        let anchor = strongest(members);
        let category = anchor.category();
        let description = format!(
            "{} '{}' memories reinforce each other around '{}'",
            members.len(),
            category,
            display_title(anchor),
        );
        let mean_confidence = members.iter().map(|n| n.confidence()).sum::<f64>() / members.len() as f64;
        insight(
            description,
            members,
            novelty(members),
            0.5 * mean_confidence + 0.5 * mean_magnitude,
            trigger,
        )
    }

    /// Whether the idle policy is due, given the time of the last query.
    pub fn idle_due(&self, last_activity: Option<u64>, now: u64) -> bool {
        if !self.config.idle.enabled {
            return false;
        }
        match last_activity {
            Some(t) => now.saturating_sub(t) >= self.config.idle.idle_interval_ms,
            None => false,
        }
    }

    /// Widening factor when coherence is low enough to trigger exploration.
    pub fn uncertainty_widen(&self, coherence: f64) -> Option<f64> {
        let u = &self.config.uncertainty;
        (u.enabled && coherence < u.threshold).then_some(u.widen_factor)
    }

    /// Nodes among `candidates` whose activation is past the firing
    /// threshold. Empty when the cascade policy is disabled.
    pub fn firing<'a>(&self, candidates: &[&'a MemoryNode]) -> Vec<&'a MemoryNode> {
        if !self.config.cascade.enabled {
            return Vec::new();
        }
        candidates
            .iter()
            .copied()
            .filter(|n| n.activation.is_firing())
            .collect()
    }

    /// Spread from each seed through the co-retrieval graph, up to
    /// `max_depth` hops, and report every reach of two or more nodes.
    pub fn cascade(
        &self,
        seeds: &[&MemoryNode],
        store: &RecordStore,
        correlations: &AdaptationEngine,
    ) -> Vec<EmergentInsight> {
        let cfg = &self.config.cascade;
        let mut insights = Vec::new();
        let mut covered: HashSet<BTreeSet<String>> = HashSet::new();

        for seed in seeds {
            let mut reached: BTreeSet<String> = BTreeSet::from([seed.id.clone()]);
            let mut frontier = vec![seed.id.clone()];
            let mut strengths = Vec::new();
            let mut depth = 0;
            while depth < cfg.max_depth && !frontier.is_empty() {
                let mut next = Vec::new();
                for id in &frontier {
                    for (neighbor, strength) in correlations.neighbors(id, cfg.min_correlation) {
                        if store.contains(&neighbor) && reached.insert(neighbor.clone()) {
                            strengths.push(strength);
                            next.push(neighbor);
                        }
                    }
                }
                frontier = next;
                depth += 1;
            }
            if reached.len() < 2 || !covered.insert(reached.clone()) {
                continue;
            }
            let members: Vec<&MemoryNode> = reached.iter().filter_map(|id| store.get(id)).collect();
            let mean_strength = strengths.iter().sum::<f64>() / strengths.len().max(1) as f64;
            let mean_confidence = members.iter().map(|n| n.confidence()).sum::<f64>() / members.len() as f64;
            let description = format!(
                "activation of '{}' cascades to {} correlated memories within {} hops",
                display_title(seed),
                members.len() - 1,
                depth,
            );
            insights.push(insight(
                description,
                &members,
                novelty(&members),
                0.5 * mean_confidence + 0.5 * mean_strength,
                Some(TriggerPolicy::Cascade),
            ));
        }

        rank(&mut insights, self.config.max_insights);
        insights
    }
}

fn insight(
    description: String,
    members: &[&MemoryNode],
    novelty: f64,
    confidence: f64,
    trigger: Option<TriggerPolicy>,
) -> EmergentInsight {
    let mut supporting: Vec<String> = members.iter().map(|n| n.id.clone()).collect();
    supporting.sort();
    let label = trigger.map_or("scan", TriggerPolicy::as_str);
    let key = format!("{label}:{}", supporting.join("\u{1f}"));
    EmergentInsight {
        id: Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes()),
        description,
        supporting_nodes: supporting,
        novelty: clamp_unit(novelty),
        confidence: clamp_unit(confidence),
        trigger,
    }
}

/// One minus the mean pairwise co-occurrence rate in access history.
/// Members that were never returned together score 1.
fn novelty(members: &[&MemoryNode]) -> f64 {
    let mut rate = 0.0;
    let mut pairs = 0usize;
    for (i, a) in members.iter().enumerate() {
        for b in &members[i + 1..] {
            let shortest = a.access_history.len().min(b.access_history.len());
            if shortest > 0 {
                rate += a.shared_accesses(b) as f64 / shortest as f64;
            }
            pairs += 1;
        }
    }
    if pairs == 0 {
        return 1.0;
    }
    1.0 - (rate / pairs as f64).min(1.0)
}

fn strongest<'a>(members: &[&'a MemoryNode]) -> &'a MemoryNode {
    members
        .iter()
        .copied()
        .max_by(|a, b| {
            a.confidence()
                .total_cmp(&b.confidence())
                .then_with(|| b.id.cmp(&a.id))
        })
        .unwrap_or(members[0])
}

fn display_title(node: &MemoryNode) -> &str {
    if node.content.title.trim().is_empty() {
        &node.id
    } else {
        &node.content.title
    }
}

fn rank(insights: &mut Vec<EmergentInsight>, max: usize) {
    insights.sort_by(|a, b| b.score().total_cmp(&a.score()).then_with(|| a.id.cmp(&b.id)));
    insights.truncate(max);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptation::Outcome;
    use crate::config::{AdaptationConfig, EnsembleConfig, FieldConfig, StoreConfig};
    use crate::coords::{Coord3, SpaceBounds};
    use crate::ensemble::{EnsembleEngine, NoCorrelations};
    use crate::field::ProbabilityField;
    use crate::record::ContentRecord;

    fn store_with(points: &[(&str, &str, Coord3)]) -> RecordStore {
        let mut store = RecordStore::new(SpaceBounds::default(), StoreConfig::default(), FieldConfig::default());
        for (id, cat, at) in points {
            store
                .store(&ContentRecord::new(*id, *cat, *id).with_coordinates(*at).with_confidence(0.6), 0)
                .unwrap();
        }
        store
    }

    fn ensemble_over(store: &RecordStore) -> Ensemble {
        let field = ProbabilityField {
            center: Coord3::ORIGIN,
            radius: 0.5,
            distortion: None,
            dominant_cap: 5,
        };
        let nodes: Vec<&MemoryNode> = store.iter().collect();
        EnsembleEngine::new(EnsembleConfig::default()).create_ensemble(&field, &nodes, &NoCorrelations)
    }

    fn engine() -> EmergenceEngine {
        EmergenceEngine::new(EmergenceConfig::default())
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("Cascade".parse::<TriggerPolicy>().unwrap(), TriggerPolicy::Cascade);
        let err = "dream".parse::<TriggerPolicy>().unwrap_err();
        assert!(matches!(err, FieldError::UnknownPolicy(_)));
    }

    #[test]
    fn test_reinforcing_group_becomes_insight() {
        let store = store_with(&[
            ("a", "x", Coord3::new(0.0, 0.0, 0.0)),
            ("b", "x", Coord3::new(0.01, 0.0, 0.0)),
            ("c", "x", Coord3::new(0.02, 0.0, 0.0)),
            ("lone", "y", Coord3::new(0.4, 0.0, 0.0)),
        ]);
        let ens = ensemble_over(&store);
        let insights = engine().detect(&ens, &store, &engine().discovery_options());
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].supporting_nodes, vec!["a", "b", "c"]);
        assert_eq!(insights[0].trigger, None);
        assert_eq!(insights[0].novelty, 1.0);
        assert!((0.0..=1.0).contains(&insights[0].confidence));
    }

    #[test]
    fn test_threshold_filters_weak_groups() {
        // 0.2 apart with interference radius 0.25: magnitude 0.2
        let store = store_with(&[("a", "x", Coord3::ORIGIN), ("b", "x", Coord3::new(0.2, 0.0, 0.0))]);
        let ens = ensemble_over(&store);
        assert!(engine().detect(&ens, &store, &engine().discovery_options()).is_empty());
        let loose = DetectOptions {
            threshold: 0.1,
            max_insights: 5,
        };
        assert_eq!(engine().detect(&ens, &store, &loose).len(), 1);
    }

    #[test]
    fn test_insight_ids_are_stable() {
        let store = store_with(&[("a", "x", Coord3::ORIGIN), ("b", "x", Coord3::new(0.01, 0.0, 0.0))]);
        let ens = ensemble_over(&store);
        let e = engine();
        let first = e.detect(&ens, &store, &e.discovery_options());
        let second = e.detect(&ens, &store, &e.discovery_options());
        assert_eq!(first[0].id, second[0].id);
        let synthesized = e.detect_groups(&ens.interference, &store, &e.discovery_options(), Some(TriggerPolicy::Synthesis));
        assert_ne!(first[0].id, synthesized[0].id);
    }

    #[test]
    fn test_novelty_drops_with_shared_history() {
        let mut store = store_with(&[("a", "x", Coord3::ORIGIN), ("b", "x", Coord3::new(0.01, 0.0, 0.0))]);
        let mut adaptation = AdaptationEngine::new(AdaptationConfig::default());
        for t in 1..=4 {
            adaptation.process_outcome(
                &mut store,
                &Outcome {
                    result_ids: vec!["a".into(), "b".into()],
                    relevant: true,
                    now: t,
                },
            );
        }
        let ens = ensemble_over(&store);
        let insights = engine().detect(&ens, &store, &engine().discovery_options());
        assert!(insights[0].novelty < 0.5);
    }

    #[test]
    fn test_idle_gate() {
        let e = engine();
        let interval = e.config().idle.idle_interval_ms;
        assert!(!e.idle_due(None, 10));
        assert!(!e.idle_due(Some(0), interval - 1));
        assert!(e.idle_due(Some(0), interval));

        let mut cfg = EmergenceConfig::default();
        cfg.idle.enabled = false;
        assert!(!EmergenceEngine::new(cfg).idle_due(Some(0), u64::MAX));
    }

    #[test]
    fn test_uncertainty_gate() {
        let e = engine();
        assert_eq!(e.uncertainty_widen(0.1), Some(e.config().uncertainty.widen_factor));
        assert_eq!(e.uncertainty_widen(0.9), None);
    }

    #[test]
    fn test_cascade_follows_correlations() {
        let mut store = store_with(&[
            ("a", "x", Coord3::new(-0.5, 0.0, 0.0)),
            ("b", "y", Coord3::new(0.0, 0.5, 0.0)),
            ("c", "z", Coord3::new(0.5, 0.0, 0.0)),
            ("d", "w", Coord3::new(0.0, -0.5, 0.0)),
        ]);
        let mut adaptation = AdaptationEngine::new(AdaptationConfig::default());
        for t in 1..=3 {
            for pair in [["a", "b"], ["b", "c"]] {
                adaptation.process_outcome(
                    &mut store,
                    &Outcome {
                        result_ids: pair.iter().map(|s| s.to_string()).collect(),
                        relevant: true,
                        now: t,
                    },
                );
            }
        }
        let a = store.get("a").unwrap();
        assert!(a.activation.is_firing());
        let all: Vec<&MemoryNode> = store.iter().collect();
        let e = engine();
        let seeds: Vec<&MemoryNode> = e.firing(&all).into_iter().filter(|n| n.id == "a").collect();
        let insights = e.cascade(&seeds, &store, &adaptation);
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].supporting_nodes, vec!["a", "b", "c"]);
        assert_eq!(insights[0].trigger, Some(TriggerPolicy::Cascade));
    }

    #[test]
    fn test_max_insights_respected() {
        let store = store_with(&[
            ("a1", "x", Coord3::new(-0.3, 0.0, 0.0)),
            ("a2", "x", Coord3::new(-0.29, 0.0, 0.0)),
            ("b1", "x", Coord3::new(0.3, 0.0, 0.0)),
            ("b2", "x", Coord3::new(0.29, 0.0, 0.0)),
        ]);
        let ens = ensemble_over(&store);
        let one = DetectOptions {
            threshold: 0.5,
            max_insights: 1,
        };
        assert_eq!(engine().detect(&ens, &store, &one).len(), 1);
        assert_eq!(engine().detect(&ens, &store, &engine().discovery_options()).len(), 2);
    }
}
