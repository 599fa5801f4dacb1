/// Errors surfaced by the field memory engine.
///
/// Empty results and unreachable persistence are not errors: the former is
/// a normal response, the latter degrades the engine to in-memory operation.
#[derive(Debug, thiserror::Error)]
pub enum FieldError {
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("unknown memory node: {0}")]
    UnknownNode(String),

    #[error("unknown emergence policy '{0}' (expected idle, cascade, uncertainty or synthesis)")]
    UnknownPolicy(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FieldError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedInput(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, FieldError>;
