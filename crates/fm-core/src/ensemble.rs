//! Candidate ensembles: weighted candidates for one field, their pairwise
//! interference, and the coherence of the dominant subset.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::EnsembleConfig;
use crate::constants::{EPSILON, INTERNAL_COHERENCE_WEIGHT};
use crate::field::ProbabilityField;
use crate::node::MemoryNode;
use crate::record::clamp_unit;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnsembleMember {
    pub node_id: String,
    /// Relevance in [0, 1]. Independent per member.
    pub probability: f64,
    /// `probability` scaled so the weights of an ensemble sum to at most 1.
    pub weight: f64,
    /// Distance from the field center, distortion applied.
    pub distance: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterferenceKind {
    Reinforcing,
    Cancelling,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterferencePattern {
    pub node_a: String,
    pub node_b: String,
    pub kind: InterferenceKind,
    pub magnitude: f64,
}

impl InterferencePattern {
    pub fn involves(&self, id: &str) -> bool {
        self.node_a == id || self.node_b == id
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Ensemble {
    /// Probability descending, ties by id.
    pub members: Vec<EnsembleMember>,
    /// Ids of the top members, at most the field's dominant cap.
    pub dominant: Vec<String>,
    pub interference: Vec<InterferencePattern>,
    pub coherence: f64,
}

impl Ensemble {
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn member(&self, id: &str) -> Option<&EnsembleMember> {
        self.members.iter().find(|m| m.node_id == id)
    }

    pub fn reinforcing(&self) -> impl Iterator<Item = &InterferencePattern> {
        self.interference
            .iter()
            .filter(|p| p.kind == InterferenceKind::Reinforcing)
    }
}

/// Category pairs that contradict each other. Symmetric.
#[derive(Clone, Debug, Default)]
pub struct ConflictTable {
    pairs: HashSet<(String, String)>,
}

impl ConflictTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = [S; 2]>,
        S: Into<String>,
    {
        let mut table = Self::new();
        for [a, b] in pairs {
            table.insert(a, b);
        }
        table
    }

    pub fn insert(&mut self, a: impl Into<String>, b: impl Into<String>) {
        self.pairs.insert(ordered(a.into(), b.into()));
    }

    pub fn conflicts(&self, a: &str, b: &str) -> bool {
        if self.pairs.is_empty() {
            return false;
        }
        self.pairs.contains(&ordered(a.to_string(), b.to_string()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

fn ordered(a: String, b: String) -> (String, String) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Co-retrieval strength between two nodes, in [0, 1].
pub trait Correlations {
    fn correlation(&self, a: &str, b: &str) -> f64;
}

/// No history: every pair is uncorrelated.
pub struct NoCorrelations;

impl Correlations for NoCorrelations {
    fn correlation(&self, _a: &str, _b: &str) -> f64 {
        0.0
    }
}

impl<F> Correlations for F
where
    F: Fn(&str, &str) -> f64,
{
    fn correlation(&self, a: &str, b: &str) -> f64 {
        self(a, b)
    }
}

pub struct EnsembleEngine {
    config: EnsembleConfig,
    conflicts: ConflictTable,
}

impl EnsembleEngine {
    pub fn new(config: EnsembleConfig) -> Self {
        let conflicts = ConflictTable::from_pairs(config.conflicts.iter().cloned());
        Self { config, conflicts }
    }

    pub fn with_conflicts(mut self, conflicts: ConflictTable) -> Self {
        self.conflicts = conflicts;
        self
    }

    pub fn conflicts(&self) -> &ConflictTable {
        &self.conflicts
    }

    pub fn config(&self) -> &EnsembleConfig {
        &self.config
    }

    /// Relevance of a node at `distance` from the center of a field with
    /// `radius`. Gaussian falloff scaled by confidence and resonance.
    pub fn probability(&self, node: &MemoryNode, distance: f64, radius: f64) -> f64 {
        let sigma = (radius * self.config.sigma_fraction).max(EPSILON);
        let falloff = (-(distance * distance) / (2.0 * sigma * sigma)).exp();
        let c = &self.config;
        let total = (c.base_weight + c.confidence_weight + c.resonance_weight).max(1.0);
        let quality =
            (c.base_weight + c.confidence_weight * node.confidence() + c.resonance_weight * node.resonance()) / total;
        clamp_unit(falloff * quality)
    }

    /// Score `candidates` against `field`. Candidates outside the field's
    /// cutoff are dropped; duplicates are counted once.
    pub fn create_ensemble(
        &self,
        field: &ProbabilityField,
        candidates: &[&MemoryNode],
        correlations: &impl Correlations,
    ) -> Ensemble {
        let mut seen = HashSet::new();
        let admitted: Vec<&MemoryNode> = candidates
            .iter()
            .copied()
            .filter(|n| seen.insert(n.id.as_str()))
            .filter(|n| field.admits(n.coordinates))
            .collect();

        let mut members: Vec<EnsembleMember> = admitted
            .iter()
            .map(|n| {
                let distance = field.distance_to(n.coordinates);
                EnsembleMember {
                    node_id: n.id.clone(),
                    probability: self.probability(n, distance, field.radius),
                    weight: 0.0,
                    distance,
                }
            })
            .collect();
        members.sort_by(|a, b| {
            b.probability
                .total_cmp(&a.probability)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        let total: f64 = members.iter().map(|m| m.probability).sum();
        let scale = total.max(1.0);
        for m in &mut members {
            m.weight = m.probability / scale;
        }

        let dominant: Vec<String> = members
            .iter()
            .take(field.dominant_cap)
            .map(|m| m.node_id.clone())
            .collect();

        let interference = self.interference(&admitted);

        let by_id: HashMap<&str, &MemoryNode> = admitted.iter().map(|n| (n.id.as_str(), *n)).collect();
        let coherence = self.coherence(field, &members, &dominant, &by_id, correlations);

        Ensemble {
            members,
            dominant,
            interference,
            coherence,
        }
    }

    /// Pairwise interference among `nodes`, ordered by magnitude descending.
    pub fn interference(&self, nodes: &[&MemoryNode]) -> Vec<InterferencePattern> {
        self.interference_within(nodes, self.config.interference_radius)
    }

    /// Interference with an explicit proximity radius.
    pub fn interference_within(&self, nodes: &[&MemoryNode], radius: f64) -> Vec<InterferencePattern> {
        if radius <= 0.0 {
            return Vec::new();
        }
        let mut patterns = Vec::new();
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                let d = a.coordinates.distance(b.coordinates);
                if d >= radius {
                    continue;
                }
                let kind = if a.category() == b.category() {
                    InterferenceKind::Reinforcing
                } else if self.conflicts.conflicts(a.category(), b.category()) {
                    InterferenceKind::Cancelling
                } else {
                    continue;
                };
                let (node_a, node_b) = ordered(a.id.clone(), b.id.clone());
                patterns.push(InterferencePattern {
                    node_a,
                    node_b,
                    kind,
                    magnitude: clamp_unit(1.0 - d / radius),
                });
            }
        }
        patterns.sort_by(|x, y| {
            y.magnitude
                .total_cmp(&x.magnitude)
                .then_with(|| x.node_a.cmp(&y.node_a))
                .then_with(|| x.node_b.cmp(&y.node_b))
        });
        patterns
    }

    /// Agreement of two nodes relative to the field scale: spatial closeness
    /// weighted by category agreement.
    fn agreement(&self, field: &ProbabilityField, a: &MemoryNode, b: &MemoryNode) -> f64 {
        let span = (2.0 * field.cutoff()).max(EPSILON);
        let closeness = clamp_unit(1.0 - a.coordinates.distance(b.coordinates) / span);
        let category = if a.category() == b.category() {
            1.0
        } else if self.conflicts.conflicts(a.category(), b.category()) {
            0.0
        } else {
            0.5
        };
        closeness * category
    }

    fn coherence(
        &self,
        field: &ProbabilityField,
        members: &[EnsembleMember],
        dominant: &[String],
        nodes: &HashMap<&str, &MemoryNode>,
        correlations: &impl Correlations,
    ) -> f64 {
        let top: Vec<&MemoryNode> = dominant.iter().filter_map(|id| nodes.get(id.as_str()).copied()).collect();
        let (internal, external) = match top.as_slice() {
            [] => return 0.0,
            [only] => (
                members.first().map_or(0.0, |m| m.probability),
                only.resonance(),
            ),
            _ => {
                let mut agreement = 0.0;
                let mut correlation = 0.0;
                let mut pairs = 0usize;
                for (i, a) in top.iter().enumerate() {
                    for b in &top[i + 1..] {
                        agreement += self.agreement(field, a, b);
                        correlation += clamp_unit(correlations.correlation(&a.id, &b.id));
                        pairs += 1;
                    }
                }
                (agreement / pairs as f64, correlation / pairs as f64)
            }
        };
        clamp_unit(INTERNAL_COHERENCE_WEIGHT * internal + (1.0 - INTERNAL_COHERENCE_WEIGHT) * external)
    }
}

/// Final result ids: the dominant subset first, then the remaining members
/// by probability, without duplicates.
pub fn collapse(ensemble: &Ensemble, max_results: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(max_results.min(ensemble.len()));
    let mut taken: HashSet<&str> = HashSet::new();
    let ordered_ids = ensemble
        .dominant
        .iter()
        .map(String::as_str)
        .chain(ensemble.members.iter().map(|m| m.node_id.as_str()));
    for id in ordered_ids {
        if out.len() >= max_results {
            break;
        }
        if taken.insert(id) {
            out.push(id.to_string());
        }
    }
    out
}
