//! Deterministic associative store of memory nodes.
//!
//! Nodes live in one table keyed by id; a category index maps each category
//! to the ids filed under it. Every mutation goes through this type so the
//! two stay in step: an id is in the index if and only if it is in the
//! table, under exactly one category.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::{FieldConfig, StoreConfig};
use crate::coords::{Coord3, SpaceBounds};
use crate::error::{FieldError, Result};
use crate::field::signature_anchor;
use crate::filter::{Filter, matches_all};
use crate::node::{MemoryNode, NodeContent};
use crate::record::ContentRecord;

/// Lookup options for [`RecordStore::query`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// When set, only nodes within `radius` of this point qualify.
    pub center: Option<Coord3>,
    pub radius: f64,
    pub quality_threshold: f64,
    pub max_results: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            center: None,
            radius: f64::INFINITY,
            quality_threshold: 0.0,
            max_results: usize::MAX,
        }
    }
}

pub struct RecordStore {
    nodes: HashMap<String, MemoryNode>,
    category_index: HashMap<String, HashSet<String>>,
    bounds: SpaceBounds,
    config: StoreConfig,
    placement: FieldConfig,
}

impl RecordStore {
    pub fn new(bounds: SpaceBounds, config: StoreConfig, placement: FieldConfig) -> Self {
        Self {
            nodes: HashMap::new(),
            category_index: HashMap::new(),
            bounds,
            config,
            placement,
        }
    }

    pub fn bounds(&self) -> SpaceBounds {
        self.bounds
    }

    pub fn history_len(&self) -> usize {
        self.config.access_history_len
    }

    /// Insert or overwrite the node for `record.id`.
    pub fn store(&mut self, record: &ContentRecord, now: u64) -> Result<()> {
        record.validate()?;
        let node = self.build_node(record, now);
        self.insert_node(node);
        Ok(())
    }

    /// Validate every record, then insert them all. A single malformed record
    /// leaves the store untouched.
    pub fn bulk_store(&mut self, records: &[ContentRecord], now: u64) -> Result<usize> {
        for record in records {
            record.validate()?;
        }
        for record in records {
            let node = self.build_node(record, now);
            self.insert_node(node);
        }
        Ok(records.len())
    }

    /// Insert a fully formed node (used when restoring a snapshot).
    /// Confidence and resonance are re-clamped through the setters, the
    /// coordinates are clamped into bounds and only the newest
    /// `access_history_len` accesses are kept.
    pub fn insert_node(&mut self, mut node: MemoryNode) {
        node.coordinates = self.bounds.clamp(node.coordinates);
        let confidence = node.confidence();
        node.set_confidence(confidence);
        let resonance = node.resonance();
        node.set_resonance(resonance);
        node.access_history.make_contiguous().sort_unstable();
        let keep = self.config.access_history_len.max(1);
        while node.access_history.len() > keep {
            node.access_history.pop_front();
        }

        if let Some(previous) = self.nodes.get(&node.id)
            && previous.category() != node.category()
        {
            let old_category = previous.category().to_string();
            self.unindex(&old_category, &node.id);
        }
        self.category_index
            .entry(node.category().to_string())
            .or_default()
            .insert(node.id.clone());
        self.nodes.insert(node.id.clone(), node);
    }

    fn unindex(&mut self, category: &str, id: &str) {
        if let Some(ids) = self.category_index.get_mut(category) {
            ids.remove(id);
            if ids.is_empty() {
                self.category_index.remove(category);
            }
        }
    }

    fn build_node(&self, record: &ContentRecord, now: u64) -> MemoryNode {
        let content = NodeContent::from(record);
        let coordinates = record
            .coordinates
            .unwrap_or_else(|| signature_anchor(&content.signature, &self.bounds, &self.placement));
        let confidence = record
            .initial_confidence
            .unwrap_or_else(|| self.derived_confidence(content.signature.strength));
        MemoryNode::new(
            record.id.clone(),
            self.bounds.clamp(coordinates),
            content,
            confidence,
            now,
        )
    }

    /// `0.5 + 0.5 * strength`, rescaled into `[initial_confidence_floor, 1]`.
    fn derived_confidence(&self, strength: f64) -> f64 {
        let raw = 0.5 + 0.5 * strength;
        let floor = self.config.initial_confidence_floor.clamp(0.0, 1.0);
        floor + (1.0 - floor) * raw
    }

    /// Nodes of `category` passing `filters` and the quality threshold,
    /// within the optional radius, by confidence descending (ties by id).
    pub fn query(&self, category: &str, filters: &[Filter], options: &QueryOptions) -> Vec<&MemoryNode> {
        if options.max_results == 0 || options.radius <= 0.0 {
            return Vec::new();
        }
        let Some(ids) = self.category_index.get(category) else {
            return Vec::new();
        };
        let mut hits: Vec<&MemoryNode> = ids
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|n| n.confidence() >= options.quality_threshold)
            .filter(|n| match options.center {
                Some(c) => n.coordinates.distance(c) <= options.radius,
                None => true,
            })
            .filter(|n| matches_all(filters, n))
            .collect();
        sort_by_confidence(&mut hits);
        hits.truncate(options.max_results);
        hits
    }

    /// Every node within `radius` of `center`, regardless of category,
    /// nearest first.
    pub fn within(&self, center: Coord3, radius: f64) -> Vec<&MemoryNode> {
        if radius <= 0.0 {
            return Vec::new();
        }
        let mut hits: Vec<(&MemoryNode, f64)> = self
            .nodes
            .values()
            .map(|n| (n, n.coordinates.distance(center)))
            .filter(|(_, d)| *d <= radius)
            .collect();
        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.id.cmp(&b.0.id)));
        hits.into_iter().map(|(n, _)| n).collect()
    }

    pub fn get(&self, id: &str) -> Option<&MemoryNode> {
        self.nodes.get(id)
    }

    /// Mutable access for the adaptation engine. Callers must go through the
    /// node's clamping setters; coordinates are re-clamped by
    /// [`RecordStore::clamp_coordinates`].
    pub fn get_mut(&mut self, id: &str) -> Option<&mut MemoryNode> {
        self.nodes.get_mut(id)
    }

    pub fn get_or_err(&self, id: &str) -> Result<&MemoryNode> {
        self.nodes
            .get(id)
            .ok_or_else(|| FieldError::UnknownNode(id.to_string()))
    }

    /// Move a node, clamped into bounds.
    pub fn set_coordinates(&mut self, id: &str, to: Coord3) {
        let bounds = self.bounds;
        if let Some(node) = self.nodes.get_mut(id) {
            node.coordinates = bounds.clamp(to);
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryNode> {
        self.nodes.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut MemoryNode> {
        self.nodes.values_mut()
    }

    /// Node ids in a stable order.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Category name → node count, sorted by name.
    pub fn category_counts(&self) -> Vec<(String, usize)> {
        let mut counts: Vec<(String, usize)> = self
            .category_index
            .iter()
            .map(|(c, ids)| (c.clone(), ids.len()))
            .collect();
        counts.sort();
        counts
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.category_index.clear();
    }

    /// Table and index agree. Used by tests and debug assertions.
    pub fn is_consistent(&self) -> bool {
        let indexed: usize = self.category_index.values().map(HashSet::len).sum();
        indexed == self.nodes.len()
            && self.category_index.iter().all(|(cat, ids)| {
                ids.iter()
                    .all(|id| self.nodes.get(id).is_some_and(|n| n.category() == cat))
            })
    }
}

pub(crate) fn sort_by_confidence(nodes: &mut [&MemoryNode]) {
    nodes.sort_by(|a, b| {
        b.confidence()
            .total_cmp(&a.confidence())
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Payload;
    use serde_json::json;

    fn store() -> RecordStore {
        RecordStore::new(SpaceBounds::default(), StoreConfig::default(), FieldConfig::default())
    }

    fn rec(id: &str, category: &str, confidence: f64) -> ContentRecord {
        ContentRecord::new(id, category, format!("{id} title")).with_confidence(confidence)
    }

    #[test]
    fn test_query_orders_by_confidence() {
        let mut s = store();
        s.store(&rec("a", "x", 0.3), 0).unwrap();
        s.store(&rec("b", "x", 0.9), 0).unwrap();
        s.store(&rec("c", "x", 0.6), 0).unwrap();
        s.store(&rec("d", "y", 1.0), 0).unwrap();

        let opts = QueryOptions {
            max_results: 2,
            ..Default::default()
        };
        let ids: Vec<&str> = s.query("x", &[], &opts).iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_ties_broken_by_id() {
        let mut s = store();
        s.store(&rec("z", "x", 0.5), 0).unwrap();
        s.store(&rec("m", "x", 0.5), 0).unwrap();
        let hits = s.query("x", &[], &QueryOptions::default());
        assert_eq!(hits[0].id, "m");
    }

    #[test]
    fn test_zero_radius_or_max_is_empty() {
        let mut s = store();
        s.store(&rec("a", "x", 0.5), 0).unwrap();
        let zero_max = QueryOptions {
            max_results: 0,
            ..Default::default()
        };
        assert!(s.query("x", &[], &zero_max).is_empty());
        let zero_radius = QueryOptions {
            radius: 0.0,
            ..Default::default()
        };
        assert!(s.query("x", &[], &zero_radius).is_empty());
        assert!(s.within(Coord3::ORIGIN, 0.0).is_empty());
    }

    #[test]
    fn test_quality_threshold_and_radius() {
        let mut s = store();
        s.store(&rec("near", "x", 0.8).with_coordinates(Coord3::new(0.1, 0.0, 0.0)), 0)
            .unwrap();
        s.store(&rec("far", "x", 0.8).with_coordinates(Coord3::new(0.9, 0.9, 0.0)), 0)
            .unwrap();
        s.store(&rec("weak", "x", 0.1).with_coordinates(Coord3::ORIGIN), 0)
            .unwrap();
        let opts = QueryOptions {
            center: Some(Coord3::ORIGIN),
            radius: 0.5,
            quality_threshold: 0.5,
            max_results: 10,
        };
        let ids: Vec<&str> = s.query("x", &[], &opts).iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["near"]);
    }

    #[test]
    fn test_filters_applied() {
        let mut s = store();
        s.store(
            &rec("j", "x", 0.5).with_payload(Payload::Json {
                value: json!({"lang": "rust"}),
            }),
            0,
        )
        .unwrap();
        s.store(&rec("p", "x", 0.6), 0).unwrap();
        let filters = [Filter::field_equals("lang", json!("rust"))];
        let hits = s.query("x", &filters, &QueryOptions::default());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "j");
    }

    #[test]
    fn test_overwrite_moves_category() {
        let mut s = store();
        s.store(&rec("a", "x", 0.5), 0).unwrap();
        s.store(&rec("a", "y", 0.5), 1).unwrap();
        assert_eq!(s.len(), 1);
        assert!(s.query("x", &[], &QueryOptions::default()).is_empty());
        assert_eq!(s.query("y", &[], &QueryOptions::default()).len(), 1);
        assert!(s.is_consistent());
        assert_eq!(s.category_counts(), vec![("y".to_string(), 1)]);
    }

    #[test]
    fn test_bulk_store_is_atomic() {
        let mut s = store();
        let records = vec![rec("a", "x", 0.5), ContentRecord::new("", "x", "broken")];
        assert!(s.bulk_store(&records, 0).is_err());
        assert!(s.is_empty());

        let ok = vec![rec("a", "x", 0.5), rec("b", "x", 0.5)];
        assert_eq!(s.bulk_store(&ok, 0).unwrap(), 2);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn test_explicit_coordinates_clamped() {
        let mut s = store();
        s.store(&rec("a", "x", 0.5).with_coordinates(Coord3::new(4.0, -9.0, 0.2)), 0)
            .unwrap();
        let n = s.get("a").unwrap();
        assert_eq!(n.coordinates, Coord3::new(1.0, -1.0, 0.2));
    }

    #[test]
    fn test_restored_history_keeps_newest_accesses() {
        let config = StoreConfig {
            access_history_len: 4,
            ..StoreConfig::default()
        };
        let mut s = RecordStore::new(SpaceBounds::default(), config, FieldConfig::default());
        s.store(&rec("a", "x", 0.5), 0).unwrap();
        let mut node = s.get("a").unwrap().clone();
        node.access_history = (0..20u64).rev().collect();

        s.insert_node(node);
        let history: Vec<u64> = s.get("a").unwrap().access_history.iter().copied().collect();
        assert_eq!(history, vec![16, 17, 18, 19]);
    }

    #[test]
    fn test_derived_placement_is_deterministic() {
        let mut s = store();
        s.store(&ContentRecord::new("a", "function", "parse"), 0).unwrap();
        s.store(&ContentRecord::new("b", "function", "parse"), 0).unwrap();
        assert_eq!(s.get("a").unwrap().coordinates, s.get("b").unwrap().coordinates);
        assert!(s.bounds().contains(s.get("a").unwrap().coordinates));
    }

    #[test]
    fn test_derived_confidence_respects_floor() {
        let s = store();
        let c = s.derived_confidence(0.0);
        assert!(c >= StoreConfig::default().initial_confidence_floor);
        assert!(s.derived_confidence(1.0) <= 1.0);
    }

    #[test]
    fn test_within_nearest_first() {
        let mut s = store();
        s.store(&rec("a", "x", 0.5).with_coordinates(Coord3::new(0.3, 0.0, 0.0)), 0)
            .unwrap();
        s.store(&rec("b", "y", 0.5).with_coordinates(Coord3::new(0.1, 0.0, 0.0)), 0)
            .unwrap();
        let ids: Vec<&str> = s.within(Coord3::ORIGIN, 0.5).iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_clear() {
        let mut s = store();
        s.store(&rec("a", "x", 0.5), 0).unwrap();
        s.clear();
        assert!(s.is_empty());
        assert!(s.category_counts().is_empty());
        assert!(s.get_or_err("a").is_err());
    }
}
