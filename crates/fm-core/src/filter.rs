//! Boolean filters over node content for Record Store lookups.
//!
//! Filters are evaluated left to right with short-circuiting. A predicate
//! that refers to content the node does not have (a missing JSON path, a
//! payload without text) evaluates to `false`, never to an error.

use serde::{Deserialize, Serialize};

use crate::node::MemoryNode;
use crate::tokenizer::mentions;

/// A single test against a node's content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    /// Node carries this tag (case-insensitive).
    TagEquals { tag: String },
    /// Title contains the substring (case-insensitive).
    TitleContains { text: String },
    /// Every token of `text` appears in title, description or payload text.
    Mentions { text: String },
    /// Payload discriminant equals `kind`.
    PayloadKind { kind: String },
    /// JSON payload value at a dotted path equals `value`.
    FieldEquals { path: String, value: serde_json::Value },
    /// Signature strength is at least `min`.
    MinStrength { min: f64 },
    /// Signature complexity is at least `min`.
    MinComplexity { min: f64 },
}

impl Predicate {
    pub fn evaluate(&self, node: &MemoryNode) -> bool {
        let content = &node.content;
        match self {
            Self::TagEquals { tag } => content.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)),
            Self::TitleContains { text } => {
                !text.is_empty() && content.title.to_lowercase().contains(&text.to_lowercase())
            }
            Self::Mentions { text } => {
                let mut haystack = format!("{} {}", content.title, content.description);
                if let Some(body) = content.payload.text() {
                    haystack.push(' ');
                    haystack.push_str(body);
                }
                mentions(&haystack, text)
            }
            Self::PayloadKind { kind } => content.payload.kind() == kind,
            Self::FieldEquals { path, value } => match &content.payload {
                crate::record::Payload::Json { value: root } => {
                    lookup_path(root, path).is_some_and(|v| v == value)
                }
                _ => false,
            },
            Self::MinStrength { min } => content.signature.strength >= *min,
            Self::MinComplexity { min } => content.signature.complexity >= *min,
        }
    }
}

/// Boolean combination of predicates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    Match(Predicate),
    /// Conjunction. Empty means "true".
    All(Vec<Filter>),
    /// Disjunction. Empty means "false".
    Any(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn matches(&self, node: &MemoryNode) -> bool {
        match self {
            Self::Match(p) => p.evaluate(node),
            Self::All(fs) => fs.iter().all(|f| f.matches(node)),
            Self::Any(fs) => fs.iter().any(|f| f.matches(node)),
            Self::Not(f) => !f.matches(node),
        }
    }

    pub fn tag(tag: impl Into<String>) -> Self {
        Self::Match(Predicate::TagEquals { tag: tag.into() })
    }

    pub fn mentions(text: impl Into<String>) -> Self {
        Self::Match(Predicate::Mentions { text: text.into() })
    }

    pub fn field_equals(path: impl Into<String>, value: serde_json::Value) -> Self {
        Self::Match(Predicate::FieldEquals {
            path: path.into(),
            value,
        })
    }

    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }
}

/// All filters in `filters` must match. This is the top-level semantics of
/// the list passed to a store query.
pub fn matches_all(filters: &[Filter], node: &MemoryNode) -> bool {
    filters.iter().all(|f| f.matches(node))
}

/// Resolve `a.b.0.c` against a JSON value. Numeric segments index arrays.
fn lookup_path<'a>(root: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |cur, seg| match cur {
        serde_json::Value::Object(map) => map.get(seg),
        serde_json::Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coords::Coord3;
    use crate::node::NodeContent;
    use crate::record::{ContentRecord, Payload};
    use serde_json::json;

    fn node(record: ContentRecord) -> MemoryNode {
        MemoryNode::new(record.id.clone(), Coord3::ORIGIN, NodeContent::from(&record), 0.5, 0)
    }

    fn sample() -> MemoryNode {
        node(
            ContentRecord::new("f1", "function", "parseHeader")
                .with_description("Reads the HTTP header block")
                .with_tags(["http", "Parser"])
                .with_payload(Payload::Json {
                    value: json!({"lang": "rust", "metrics": {"loc": 42}, "callers": ["a", "b"]}),
                }),
        )
    }

    #[test]
    fn test_tag_case_insensitive() {
        assert!(Filter::tag("parser").matches(&sample()));
        assert!(!Filter::tag("json").matches(&sample()));
    }

    #[test]
    fn test_mentions_uses_title_and_description() {
        assert!(Filter::mentions("parse http").matches(&sample()));
        assert!(!Filter::mentions("parse body").matches(&sample()));
    }

    #[test]
    fn test_field_equals_nested_and_array() {
        let n = sample();
        assert!(Filter::field_equals("metrics.loc", json!(42)).matches(&n));
        assert!(Filter::field_equals("callers.1", json!("b")).matches(&n));
        assert!(!Filter::field_equals("lang", json!("go")).matches(&n));
    }

    #[test]
    fn test_missing_field_is_non_matching() {
        let n = sample();
        assert!(!Filter::field_equals("does.not.exist", json!(1)).matches(&n));
        let plain = node(ContentRecord::new("p", "doc", "plain"));
        assert!(!Filter::field_equals("lang", json!("rust")).matches(&plain));
        // Negation of a missing field is a match: the predicate itself is false.
        assert!(Filter::field_equals("lang", json!("rust")).negate().matches(&plain));
    }

    #[test]
    fn test_boolean_combinators() {
        let n = sample();
        let f = Filter::All(vec![
            Filter::tag("http"),
            Filter::Any(vec![Filter::tag("nope"), Filter::mentions("header")]),
        ]);
        assert!(f.matches(&n));
        assert!(Filter::All(vec![]).matches(&n));
        assert!(!Filter::Any(vec![]).matches(&n));
    }

    #[test]
    fn test_filter_serde_shape() {
        let f = Filter::All(vec![Filter::tag("http"), Filter::mentions("header").negate()]);
        let json = serde_json::to_value(&f).unwrap();
        assert_eq!(json["all"][0]["match"]["op"], "tag_equals");
        let back: Filter = serde_json::from_value(json).unwrap();
        assert_eq!(back, f);
    }
}
