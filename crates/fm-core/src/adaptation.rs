//! Reinforcement from query outcomes.
//!
//! Every query reports its result set here. Nodes that keep turning up
//! together grow mutual resonance and slowly drift toward one another;
//! confidence follows whether the results were relevant. Explicit
//! Boost/Demote feedback is a stronger version of the same signal.
//!
//! All writes go through the node's clamping setters and
//! [`RecordStore::set_coordinates`], so no update can leave the bounds.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::AdaptationConfig;
use crate::coords::Coord3;
use crate::ensemble::Correlations;
use crate::node::MemoryNode;
use crate::store::RecordStore;

/// Caller verdict on results they were shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSignal {
    /// The results helped: raise confidence and pull them together.
    Boost,
    /// The results were noise: lower confidence and loosen their ties.
    Demote,
}

impl std::str::FromStr for FeedbackSignal {
    type Err = crate::error::FieldError;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "boost" => Ok(Self::Boost),
            "demote" => Ok(Self::Demote),
            other => Err(crate::error::FieldError::malformed(format!(
                "unknown feedback signal '{other}' (expected boost or demote)"
            ))),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackResult {
    pub boosted: usize,
    pub demoted: usize,
    /// Ids that are not in the store.
    pub unknown: Vec<String>,
}

/// What a finished query returned.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub result_ids: Vec<String>,
    pub relevant: bool,
    pub now: u64,
}

#[derive(Debug, Clone, Copy)]
struct PairStats {
    count: u32,
    strength: f64,
    last_seq: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptationStats {
    pub outcomes: u64,
    pub relevant_outcomes: u64,
    pub tracked_pairs: usize,
    pub mean_pair_strength: f64,
    pub drift_events: u64,
    pub feedback_events: u64,
}

pub struct AdaptationEngine {
    config: AdaptationConfig,
    pairs: HashMap<(String, String), PairStats>,
    /// Outcome sequence number of each node's latest co-retrieval.
    last_co_retrieval: HashMap<String, u64>,
    seq: u64,
    relevant_outcomes: u64,
    drift_events: u64,
    feedback_events: u64,
}

fn pair_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl AdaptationEngine {
    pub fn new(config: AdaptationConfig) -> Self {
        Self {
            config,
            pairs: HashMap::new(),
            last_co_retrieval: HashMap::new(),
            seq: 0,
            relevant_outcomes: 0,
            drift_events: 0,
            feedback_events: 0,
        }
    }

    pub fn config(&self) -> &AdaptationConfig {
        &self.config
    }

    /// Whether a request with this confidence counts as a relevant outcome.
    pub fn is_relevant(&self, request_confidence: f64) -> bool {
        request_confidence >= self.config.success_confidence
    }

    /// Apply one query's outcome to the nodes it returned. Returns every
    /// node id the update changed, including stale partners that weakened.
    pub fn process_outcome(&mut self, store: &mut RecordStore, outcome: &Outcome) -> Vec<String> {
        self.seq += 1;
        if outcome.relevant {
            self.relevant_outcomes += 1;
        }
        let history_len = store.history_len();
        let ids: Vec<&String> = {
            let mut seen = HashSet::new();
            outcome
                .result_ids
                .iter()
                .filter(|id| seen.insert(id.as_str()) && store.contains(id))
                .collect()
        };

        for id in &ids {
            let Some(node) = store.get_mut(id) else { continue };
            self.settle_activation(node, outcome.now);
            node.record_access(outcome.now, history_len);
            let confidence = if outcome.relevant {
                node.confidence() + self.config.success_increment
            } else {
                self.lowered(node.confidence(), self.config.uncertainty_decay)
            };
            node.set_confidence(confidence);
            node.last_adapted = outcome.now;
        }

        if ids.len() > 1 {
            self.strengthen(store, &ids);
        }
        let weakened = self.weaken_stale(store);
        self.drift(store, &ids);

        let mut touched: Vec<String> = ids.into_iter().cloned().collect();
        for id in weakened {
            if !touched.contains(&id) {
                touched.push(id);
            }
        }
        touched
    }

    /// Hebbian update for every pair in `ids`.
    fn strengthen(&mut self, store: &mut RecordStore, ids: &[&String]) {
        let rate = self.config.hebbian_rate;
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                let entry = self.pairs.entry(pair_key(a, b)).or_insert(PairStats {
                    count: 0,
                    strength: 0.0,
                    last_seq: self.seq,
                });
                entry.count = entry.count.saturating_add(1);
                entry.strength = (entry.strength + rate * (1.0 - entry.strength)).min(1.0);
                entry.last_seq = self.seq;
            }
        }
        for id in ids {
            self.last_co_retrieval.insert((*id).clone(), self.seq);
            if let Some(node) = store.get_mut(id) {
                let r = node.resonance();
                node.set_resonance(r + rate * (1.0 - r));
            }
        }
    }

    /// Pairs and nodes not co-retrieved within the decay window weaken.
    /// Returns the ids of nodes whose resonance dropped.
    fn weaken_stale(&mut self, store: &mut RecordStore) -> Vec<String> {
        let window = self.config.decay_window;
        let decay = self.config.resonance_decay;
        let seq = self.seq;

        self.pairs.retain(|_, p| {
            if seq.saturating_sub(p.last_seq) > window {
                p.strength -= decay;
            }
            p.strength > 0.0
        });

        let mut weakened = Vec::new();
        self.last_co_retrieval.retain(|id, last| {
            if seq.saturating_sub(*last) <= window {
                return true;
            }
            match store.get_mut(id) {
                Some(node) => {
                    let r = node.resonance();
                    node.set_resonance(r - decay);
                    if node.resonance() != r {
                        weakened.push(id.clone());
                    }
                    node.resonance() > 0.0
                }
                None => false,
            }
        });
        weakened
    }

    /// Move each node a bounded step toward the centroid of the neighbors it
    /// has been co-retrieved with at least `min_co_retrievals` times.
    fn drift(&mut self, store: &mut RecordStore, ids: &[&String]) {
        if self.config.drift_step <= 0.0 {
            return;
        }
        let mut moves: Vec<(String, Coord3)> = Vec::new();
        for id in ids {
            let Some(node) = store.get(id) else { continue };
            let neighbors: Vec<Coord3> = self
                .pairs
                .iter()
                .filter(|(_, p)| p.count >= self.config.min_co_retrievals)
                .filter_map(|((a, b), _)| {
                    if a == *id {
                        Some(b)
                    } else if b == *id {
                        Some(a)
                    } else {
                        None
                    }
                })
                .filter_map(|other| store.get(other).map(|n| n.coordinates))
                .collect();
            if let Some(target) = Coord3::centroid(&neighbors) {
                let to = node.coordinates.step_toward(target, self.config.drift_step);
                if to != node.coordinates {
                    moves.push(((*id).clone(), to));
                }
            }
        }
        for (id, to) in moves {
            store.set_coordinates(&id, to);
            self.drift_events += 1;
        }
    }

    /// Decrease `confidence` by `by`, stopping at the floor. Values already
    /// at or below the floor are left alone.
    fn lowered(&self, confidence: f64, by: f64) -> f64 {
        let floor = self.config.confidence_floor;
        if confidence > floor {
            (confidence - by).max(floor)
        } else {
            confidence
        }
    }

    /// Leak activation for the time elapsed since the node was last adapted.
    fn settle_activation(&self, node: &mut MemoryNode, now: u64) -> u64 {
        let cycle = self.config.activation_cycle_ms.max(1);
        let cycles = now.saturating_sub(node.last_adapted) / cycle;
        for _ in 0..cycles.min(64) {
            node.activation.decay();
        }
        cycles
    }

    /// Explicit relevance feedback on `ids`.
    pub fn apply_feedback(
        &mut self,
        store: &mut RecordStore,
        ids: &[String],
        signal: FeedbackSignal,
        now: u64,
    ) -> FeedbackResult {
        self.feedback_events += 1;
        let mut result = FeedbackResult::default();
        let mut known: Vec<&String> = Vec::new();
        for id in ids {
            if store.contains(id) {
                known.push(id);
            } else {
                result.unknown.push(id.clone());
            }
        }

        match signal {
            FeedbackSignal::Boost => {
                let points: Vec<Coord3> = known
                    .iter()
                    .filter_map(|id| store.get(id).map(|n| n.coordinates))
                    .collect();
                let centroid = Coord3::centroid(&points);
                for id in &known {
                    let step = self.config.drift_step;
                    let Some(node) = store.get_mut(id) else { continue };
                    node.set_confidence(node.confidence() + 2.0 * self.config.success_increment);
                    node.activation.boost();
                    node.last_adapted = now;
                    let from = node.coordinates;
                    if let Some(c) = centroid {
                        store.set_coordinates(id, from.step_toward(c, step));
                    }
                    result.boosted += 1;
                }
                if known.len() > 1 {
                    self.strengthen(store, &known);
                }
            }
            FeedbackSignal::Demote => {
                for id in &known {
                    let Some(node) = store.get_mut(id) else { continue };
                    let lowered = self.lowered(node.confidence(), 2.0 * self.config.success_increment);
                    node.set_confidence(lowered);
                    node.set_resonance(node.resonance() - self.config.hebbian_rate);
                    node.last_adapted = now;
                    result.demoted += 1;
                }
            }
        }
        result
    }

    /// Background pass: activation leak for elapsed time and stale-pair
    /// weakening. Returns the ids of nodes that changed.
    pub fn reinforce(&mut self, store: &mut RecordStore, now: u64) -> Vec<String> {
        let cycle = self.config.activation_cycle_ms.max(1);
        let mut touched = Vec::new();
        for node in store.iter_mut() {
            let cycles = self.settle_activation(node, now);
            if cycles > 0 {
                node.last_adapted = node.last_adapted.saturating_add(cycles * cycle);
                touched.push(node.id.clone());
            }
        }
        for id in self.weaken_stale(store) {
            if !touched.contains(&id) {
                touched.push(id);
            }
        }
        touched
    }

    /// Correlated neighbors of `id` with strength at least `min_strength`,
    /// strongest first.
    pub fn neighbors(&self, id: &str, min_strength: f64) -> Vec<(String, f64)> {
        let mut out: Vec<(String, f64)> = self
            .pairs
            .iter()
            .filter(|(_, p)| p.strength >= min_strength)
            .filter_map(|((a, b), p)| {
                if a == id {
                    Some((b.clone(), p.strength))
                } else if b == id {
                    Some((a.clone(), p.strength))
                } else {
                    None
                }
            })
            .collect();
        out.sort_by(|x, y| y.1.total_cmp(&x.1).then_with(|| x.0.cmp(&y.0)));
        out
    }

    /// Number of outcomes in which both nodes were returned.
    pub fn co_retrievals(&self, a: &str, b: &str) -> u32 {
        self.pairs.get(&pair_key(a, b)).map_or(0, |p| p.count)
    }

    pub fn stats(&self) -> AdaptationStats {
        let tracked = self.pairs.len();
        let mean = if tracked == 0 {
            0.0
        } else {
            self.pairs.values().map(|p| p.strength).sum::<f64>() / tracked as f64
        };
        AdaptationStats {
            outcomes: self.seq,
            relevant_outcomes: self.relevant_outcomes,
            tracked_pairs: tracked,
            mean_pair_strength: mean,
            drift_events: self.drift_events,
            feedback_events: self.feedback_events,
        }
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
        self.last_co_retrieval.clear();
    }
}

impl Correlations for AdaptationEngine {
    fn correlation(&self, a: &str, b: &str) -> f64 {
        self.pairs.get(&pair_key(a, b)).map_or(0.0, |p| p.strength)
    }
}
