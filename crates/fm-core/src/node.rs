use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::constants::{ACCESS_BOOST, ACTIVATION_LEAK, FIRING_THRESHOLD, RESTING_LEVEL};
use crate::coords::Coord3;
use crate::record::{ContentRecord, Payload, Signature, clamp_unit};

/// Leaky-integrator activation.
///
/// `current` sits in `[resting, threshold]` at rest. An access pushes it up
/// by [`ACCESS_BOOST`], possibly past the threshold (the node "fires"), and
/// every update cycle removes [`ACTIVATION_LEAK`] of the gap to `resting`.
/// The overshoot is capped at one boost above the threshold, so a single
/// cycle brings a firing node back into range.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Activation {
    pub resting: f64,
    pub threshold: f64,
    pub current: f64,
}

impl Default for Activation {
    fn default() -> Self {
        Self::new(RESTING_LEVEL, FIRING_THRESHOLD)
    }
}

impl Activation {
    pub fn new(resting: f64, threshold: f64) -> Self {
        let resting = clamp_unit(resting);
        let threshold = clamp_unit(threshold).max(resting);
        Self {
            resting,
            threshold,
            current: resting,
        }
    }

    /// Raise the current level for an access event.
    pub fn boost(&mut self) {
        let ceiling = self.threshold + ACCESS_BOOST;
        self.current = (self.current + ACCESS_BOOST).min(ceiling);
    }

    /// One update cycle of leak toward the resting level.
    pub fn decay(&mut self) {
        self.current = self.resting + (self.current - self.resting) * (1.0 - ACTIVATION_LEAK);
        if (self.current - self.resting).abs() < 1e-9 {
            self.current = self.resting;
        }
    }

    /// Whether the current level has crossed the firing threshold.
    pub fn is_firing(&self) -> bool {
        self.current >= self.threshold
    }

    /// Whether the level is inside the resting band.
    pub fn is_settled(&self) -> bool {
        self.current >= self.resting - 1e-12 && self.current <= self.threshold + 1e-12
    }
}

/// Denormalized, displayable copy of the stored record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeContent {
    pub category: String,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub payload: Payload,
    pub signature: Signature,
}

impl From<&ContentRecord> for NodeContent {
    fn from(record: &ContentRecord) -> Self {
        Self {
            category: record.category.clone(),
            title: record.title.clone(),
            description: record.description.clone(),
            tags: record.tags.clone(),
            payload: record.payload.clone(),
            signature: record.signature.clone().clamped(),
        }
    }
}

/// Internal representation of one stored record.
///
/// Confidence, resonance and coordinates are written only through the
/// clamping setters so the bounds invariants hold after every mutation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryNode {
    pub id: String,
    pub coordinates: Coord3,
    pub content: NodeContent,
    pub activation: Activation,
    confidence: f64,
    resonance: f64,
    pub access_history: VecDeque<u64>,
    pub last_adapted: u64,
    pub created_at: u64,
}

impl MemoryNode {
    pub fn new(id: String, coordinates: Coord3, content: NodeContent, confidence: f64, now: u64) -> Self {
        Self {
            id,
            coordinates,
            content,
            activation: Activation::default(),
            confidence: clamp_unit(confidence),
            resonance: 0.0,
            access_history: VecDeque::new(),
            last_adapted: now,
            created_at: now,
        }
    }

    pub fn category(&self) -> &str {
        &self.content.category
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn resonance(&self) -> f64 {
        self.resonance
    }

    pub fn set_confidence(&mut self, value: f64) {
        self.confidence = clamp_unit(value);
    }

    pub fn set_resonance(&mut self, value: f64) {
        self.resonance = clamp_unit(value);
    }

    /// Record an access at `now`: append to the bounded history and boost
    /// activation.
    pub fn record_access(&mut self, now: u64, history_len: usize) {
        self.access_history.push_back(now);
        while self.access_history.len() > history_len.max(1) {
            self.access_history.pop_front();
        }
        self.activation.boost();
    }

    /// Number of access timestamps shared with `other`, i.e. the queries
    /// that returned both nodes.
    pub fn shared_accesses(&self, other: &MemoryNode) -> usize {
        self.access_history
            .iter()
            .filter(|t| other.access_history.contains(t))
            .count()
    }

    pub fn last_access(&self) -> Option<u64> {
        self.access_history.back().copied()
    }
}
