//! JSON snapshot format for backup and for moving state between stores.
//!
//! The wire format uses camelCase field names, stores coordinates as
//! `[x, y, z]` arrays and activation as `[resting, threshold, current]`.
//! Imported values are clamped exactly like freshly stored ones.

use serde::{Deserialize, Serialize};

use crate::coords::Coord3;
use crate::error::{FieldError, Result};
use crate::node::{Activation, MemoryNode, NodeContent};
use crate::record::{Payload, Signature};

pub const SNAPSHOT_VERSION: &str = "1";

#[derive(Serialize, Deserialize, Debug)]
pub struct WireSnapshot {
    pub version: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(rename = "totalMemories", default)]
    pub total_memories: usize,
    pub nodes: Vec<WireNode>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WireNode {
    pub id: String,
    pub category: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub payload: Payload,
    pub signature: Signature,
    pub coordinates: [f64; 3],
    /// `[resting, threshold, current]`
    #[serde(default = "default_activation")]
    pub activation: [f64; 3],
    pub confidence: f64,
    #[serde(default)]
    pub resonance: f64,
    #[serde(rename = "accessHistory", default)]
    pub access_history: Vec<u64>,
    #[serde(rename = "lastAdapted", default)]
    pub last_adapted: u64,
    #[serde(rename = "createdAt", default)]
    pub created_at: u64,
}

fn default_activation() -> [f64; 3] {
    let a = Activation::default();
    [a.resting, a.threshold, a.current]
}

impl WireNode {
    pub fn from_node(node: &MemoryNode) -> Self {
        let c = &node.content;
        Self {
            id: node.id.clone(),
            category: c.category.clone(),
            title: c.title.clone(),
            description: c.description.clone(),
            tags: c.tags.clone(),
            payload: c.payload.clone(),
            signature: c.signature.clone(),
            coordinates: node.coordinates.to_array(),
            activation: [node.activation.resting, node.activation.threshold, node.activation.current],
            confidence: node.confidence(),
            resonance: node.resonance(),
            access_history: node.access_history.iter().copied().collect(),
            last_adapted: node.last_adapted,
            created_at: node.created_at,
        }
    }

    /// Rebuild a node. Fails on missing identity fields; numeric values are
    /// clamped rather than rejected.
    pub fn into_node(self) -> Result<MemoryNode> {
        if self.id.trim().is_empty() {
            return Err(FieldError::malformed("snapshot node without id"));
        }
        if self.category.trim().is_empty() {
            return Err(FieldError::malformed(format!("snapshot node '{}' without category", self.id)));
        }
        let content = NodeContent {
            category: self.category,
            title: self.title,
            description: self.description,
            tags: self.tags,
            payload: self.payload,
            signature: self.signature.clamped(),
        };
        let mut node = MemoryNode::new(
            self.id,
            Coord3::from_array(self.coordinates),
            content,
            self.confidence,
            self.created_at,
        );
        let [resting, threshold, current] = self.activation;
        let mut activation = Activation::new(resting, threshold);
        if current.is_finite() {
            activation.current = current.clamp(activation.resting, activation.threshold + crate::constants::ACCESS_BOOST);
        }
        node.activation = activation;
        node.set_resonance(self.resonance);
        node.access_history = self.access_history.into();
        node.last_adapted = self.last_adapted;
        Ok(node)
    }
}

/// Serialize nodes to the snapshot wire format.
pub fn export_json<'a>(nodes: impl IntoIterator<Item = &'a MemoryNode>, timestamp: &str) -> Result<String> {
    let mut wire: Vec<WireNode> = nodes.into_iter().map(WireNode::from_node).collect();
    wire.sort_by(|a, b| a.id.cmp(&b.id));
    let snapshot = WireSnapshot {
        version: SNAPSHOT_VERSION.to_string(),
        timestamp: timestamp.to_string(),
        total_memories: wire.len(),
        nodes: wire,
    };
    Ok(serde_json::to_string_pretty(&snapshot)?)
}

/// Parse a snapshot. Every node is validated before any is returned.
pub fn import_json(json: &str) -> Result<Vec<MemoryNode>> {
    let snapshot: WireSnapshot = serde_json::from_str(json)?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(FieldError::malformed(format!(
            "unsupported snapshot version '{}' (expected {SNAPSHOT_VERSION})",
            snapshot.version
        )));
    }
    snapshot.nodes.into_iter().map(WireNode::into_node).collect()
}
