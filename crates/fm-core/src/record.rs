//! Content records: the inbound unit of the store.
//!
//! A record is produced by an external collaborator (code analysis,
//! document ingestion, a pattern detector) and is immutable once stored.
//! Validation happens here, at the store boundary, so the rest of the
//! engine can assume well-formed content.

use serde::{Deserialize, Serialize};

use crate::coords::Coord3;
use crate::error::{FieldError, Result};
use crate::tokenizer::tokenize;

/// Derived numeric fingerprint of a record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub category: String,
    /// How strongly the record expresses its category, in [0, 1].
    pub strength: f64,
    /// Structural/lexical complexity, in [0, 1].
    pub complexity: f64,
}

impl Signature {
    pub fn new(category: impl Into<String>, strength: f64, complexity: f64) -> Self {
        Self {
            category: category.into(),
            strength,
            complexity,
        }
    }

    /// Derive a signature from the record's text and tags.
    ///
    /// Strength grows with tag count and text length (saturating); complexity
    /// is the lexical diversity of the text (unique tokens / tokens), damped
    /// for very short texts.
    pub fn derive(category: &str, text: &str, tags: &[String]) -> Self {
        let tokens = tokenize(text);
        let tag_part = (tags.len() as f64 / 5.0).min(1.0);
        let length_part = (tokens.len() as f64 / 50.0).min(1.0);
        let strength = 0.5 * tag_part + 0.5 * length_part;

        let complexity = if tokens.is_empty() {
            0.0
        } else {
            let unique: std::collections::HashSet<&str> =
                tokens.iter().map(String::as_str).collect();
            let diversity = unique.len() as f64 / tokens.len() as f64;
            let damping = (tokens.len() as f64 / 10.0).min(1.0);
            diversity * damping
        };

        Self::new(category, strength, complexity).clamped()
    }

    /// Clamp strength and complexity into [0, 1]. NaN becomes 0.
    pub fn clamped(mut self) -> Self {
        self.strength = clamp_unit(self.strength);
        self.complexity = clamp_unit(self.complexity);
        self
    }
}

/// Record payload, discriminated by an explicit `kind`.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    #[default]
    Empty,
    Text {
        body: String,
    },
    Code {
        language: String,
        source: String,
    },
    Document {
        uri: String,
        #[serde(default)]
        excerpt: String,
    },
    Json {
        value: serde_json::Value,
    },
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Text { .. } => "text",
            Self::Code { .. } => "code",
            Self::Document { .. } => "document",
            Self::Json { .. } => "json",
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Code { language, .. } if language.trim().is_empty() => {
                Err(FieldError::malformed("code payload requires a language"))
            }
            Self::Document { uri, .. } if uri.trim().is_empty() => {
                Err(FieldError::malformed("document payload requires a uri"))
            }
            _ => Ok(()),
        }
    }

    /// Plain text view used for token predicates.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text { body } => Some(body),
            Self::Code { source, .. } => Some(source),
            Self::Document { excerpt, .. } => Some(excerpt),
            Self::Empty | Self::Json { .. } => None,
        }
    }
}

/// Inbound content record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
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
    /// Explicit placement. When absent the position is derived from the
    /// signature.
    #[serde(default)]
    pub coordinates: Option<Coord3>,
    /// Explicit starting confidence. When absent it is derived from the
    /// signature strength.
    #[serde(default)]
    pub initial_confidence: Option<f64>,
}

impl ContentRecord {
    /// Build a record whose signature is derived from its text and tags.
    pub fn new(id: impl Into<String>, category: impl Into<String>, title: impl Into<String>) -> Self {
        let id = id.into();
        let category = category.into();
        let title = title.into();
        let signature = Signature::derive(&category, &title, &[]);
        Self {
            id,
            category,
            title,
            description: String::new(),
            tags: Vec::new(),
            payload: Payload::Empty,
            signature,
            coordinates: None,
            initial_confidence: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self.rederive_signature();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self.rederive_signature();
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = signature;
        self
    }

    pub fn with_coordinates(mut self, coordinates: Coord3) -> Self {
        self.coordinates = Some(coordinates);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.initial_confidence = Some(confidence);
        self
    }

    fn rederive_signature(&mut self) {
        let text = format!("{} {}", self.title, self.description);
        self.signature = Signature::derive(&self.category, &text, &self.tags);
    }

    /// Check required fields. Called before any mutation of the store.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(FieldError::malformed("record id must not be empty"));
        }
        if self.category.trim().is_empty() {
            return Err(FieldError::malformed(format!(
                "record '{}' has an empty category",
                self.id
            )));
        }
        if self.signature.category.trim().is_empty() {
            return Err(FieldError::malformed(format!(
                "record '{}' has a signature without category",
                self.id
            )));
        }
        if let Some(c) = self.coordinates
            && !c.is_finite()
        {
            return Err(FieldError::malformed(format!(
                "record '{}' has non-finite coordinates",
                self.id
            )));
        }
        if let Some(conf) = self.initial_confidence
            && !conf.is_finite()
        {
            return Err(FieldError::malformed(format!(
                "record '{}' has a non-finite initial confidence",
                self.id
            )));
        }
        self.payload.validate()
    }
}

pub(crate) fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}
