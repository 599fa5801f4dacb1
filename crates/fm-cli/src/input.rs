//! Lenient record input shared by `fm store` and the `fm_store` tool.
//!
//! Only `id`, `category` and `title` are required; the signature is derived
//! from the text and tags unless one is given.

use fm_core::{ContentRecord, Coord3, FieldError, Payload, Signature};
use schemars::JsonSchema;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct RecordInput {
    /// Unique record id. Storing an existing id overwrites it.
    pub id: String,
    /// Record category, e.g. "function", "document"
    pub category: String,
    /// Short display title
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Tagged payload, e.g. {"kind": "text", "body": "..."}
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
    /// Explicit signature {"category", "strength", "complexity"}
    #[serde(default)]
    pub signature: Option<serde_json::Value>,
    /// Explicit [x, y, z] placement
    #[serde(default)]
    pub coordinates: Option<[f64; 3]>,
    /// Starting confidence in [0, 1]
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl RecordInput {
    pub fn into_record(self) -> Result<ContentRecord, FieldError> {
        let mut record = ContentRecord::new(self.id, self.category, self.title).with_tags(self.tags);
        if let Some(description) = self.description {
            record = record.with_description(description);
        }
        if let Some(payload) = self.payload {
            let payload: Payload = serde_json::from_value(payload)?;
            record = record.with_payload(payload);
        }
        if let Some(signature) = self.signature {
            let signature: Signature = serde_json::from_value(signature)?;
            record = record.with_signature(signature);
        }
        if let Some(at) = self.coordinates {
            record = record.with_coordinates(Coord3::from_array(at));
        }
        if let Some(confidence) = self.confidence {
            record = record.with_confidence(confidence);
        }
        record.validate()?;
        Ok(record)
    }
}

/// Parse a JSON document holding one record or an array of records.
pub fn parse_records(json: &str) -> Result<Vec<ContentRecord>, FieldError> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    let inputs: Vec<RecordInput> = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value)?,
        other => vec![serde_json::from_value(other)?],
    };
    inputs.into_iter().map(RecordInput::into_record).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_and_array() {
        let one = r#"{"id": "a", "category": "note", "title": "hello"}"#;
        assert_eq!(parse_records(one).unwrap().len(), 1);

        let many = r#"[
            {"id": "a", "category": "note", "title": "hello", "tags": ["x"]},
            {"id": "b", "category": "code", "title": "parse",
             "payload": {"kind": "code", "language": "rust", "source": "fn main() {}"},
             "coordinates": [0.1, 0.2, 0.3], "confidence": 0.8}
        ]"#;
        let records = parse_records(many).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].payload.kind(), "code");
        assert_eq!(records[1].initial_confidence, Some(0.8));
        assert_eq!(records[0].tags, vec!["x"]);
    }

    #[test]
    fn test_rejects_bad_payload_and_empty_id() {
        let bad_payload = r#"{"id": "a", "category": "n", "title": "t", "payload": {"kind": "video"}}"#;
        assert!(matches!(parse_records(bad_payload), Err(FieldError::Serialization(_))));

        let empty_id = r#"{"id": "", "category": "n", "title": "t"}"#;
        assert!(matches!(parse_records(empty_id), Err(FieldError::MalformedInput(_))));
    }
}
