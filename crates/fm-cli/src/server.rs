use std::sync::Arc;
use std::time::Duration;

use fm_core::{Coord3, FeedbackSignal, FieldError, FieldMemory, Filter, QueryContext, QueryKind, SimilarOptions};
use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler, tool, tool_handler, tool_router};
use schemars::JsonSchema;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::input::RecordInput;

#[derive(Clone)]
pub struct FmServer {
    state: Arc<Mutex<ServerState>>,
    tool_router: ToolRouter<Self>,
}

struct ServerState {
    memory: FieldMemory,
    /// Session history; lives as long as the server process.
    context: QueryContext,
}

impl FmServer {
    pub fn new(memory: FieldMemory) -> Self {
        Self {
            state: Arc::new(Mutex::new(ServerState {
                memory,
                context: QueryContext::default(),
            })),
            tool_router: Self::tool_router(),
        }
    }

    /// One background maintenance pass. Returns the number of insights
    /// the idle scan produced.
    pub async fn idle_tick(&self) -> usize {
        let mut state = self.state.lock().await;
        let insights = state.memory.idle_tick();
        if !insights.is_empty() {
            tracing::debug!(insights = insights.len(), "idle scan");
        }
        insights.len()
    }

    /// How often `fm serve` runs [`FmServer::idle_tick`]: the configured
    /// idle interval, kept between one second and one minute.
    pub async fn tick_period(&self) -> Duration {
        let state = self.state.lock().await;
        let ms = state.memory.config().emergence.idle.idle_interval_ms;
        Duration::from_millis(ms.clamp(1_000, 60_000))
    }

    /// Flush the persistence backend. Called on shutdown so the WAL is
    /// checkpointed even when the runtime is winding down.
    pub async fn flush(&self) {
        let mut state = self.state.lock().await;
        state.memory.flush();
        if state.memory.is_degraded() {
            tracing::warn!("persistence flush failed");
        } else {
            tracing::info!("persistence flushed");
        }
    }
}

fn to_mcp(e: FieldError) -> McpError {
    match e {
        FieldError::MalformedInput(_) | FieldError::UnknownNode(_) | FieldError::UnknownPolicy(_) => {
            McpError::invalid_params(e.to_string(), None)
        }
        other => McpError::internal_error(other.to_string(), None),
    }
}

fn json_result(value: &impl serde::Serialize) -> Result<CallToolResult, McpError> {
    let text = serde_json::to_string_pretty(value).map_err(|e| McpError::internal_error(e.to_string(), None))?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

// --- Tool parameter types ---

#[derive(Debug, Deserialize, JsonSchema)]
struct StoreRequest {
    /// Records to store. Existing ids are overwritten.
    records: Vec<RecordInput>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct QueryToolRequest {
    /// Category to search; required for precision and hybrid
    category: Option<String>,
    /// precision, discovery, hybrid or auto (default)
    mode: Option<String>,
    /// How sure the caller is about what it wants, in [0, 1]
    confidence: Option<f64>,
    /// Appetite for unexpected results, in [0, 1]
    exploration: Option<f64>,
    max_results: Option<usize>,
    /// Explicit [x, y, z] field center
    center: Option<[f64; 3]>,
    /// Only return memories carrying every listed tag
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SimilarRequest {
    /// Id of an existing memory
    id: String,
    min_similarity: Option<f64>,
    max_results: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct DiscoverRequest {
    /// idle, cascade, uncertainty or synthesis
    policy: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct FeedbackRequest {
    /// Ids of memories that were shown
    ids: Vec<String>,
    /// "boost" if they helped, "demote" if not
    signal: String,
}

#[tool_router]
impl FmServer {
    #[tool(
        description = "Store memory records. Each record needs an id, category and title; tags, description, payload, signature, coordinates and confidence are optional. Records are placed in the field by category and content."
    )]
    async fn fm_store(&self, Parameters(req): Parameters<StoreRequest>) -> Result<CallToolResult, McpError> {
        let records = req
            .records
            .into_iter()
            .map(RecordInput::into_record)
            .collect::<Result<Vec<_>, _>>()
            .map_err(to_mcp)?;
        let mut state = self.state.lock().await;
        let stored = state.memory.bulk_store(records).map_err(to_mcp)?;

        json_result(&serde_json::json!({
            "stored": stored,
            "total": state.memory.len(),
            "degraded": state.memory.is_degraded(),
        }))
    }

    #[tool(
        description = "Query field memory. Precision mode returns the most confident memories of a category; discovery mode explores the field and reports emergent insights; hybrid does both. Auto picks a mode from confidence and exploration."
    )]
    async fn fm_query(&self, Parameters(req): Parameters<QueryToolRequest>) -> Result<CallToolResult, McpError> {
        let kind = match req.mode.as_deref() {
            Some(mode) => mode.parse::<QueryKind>().map_err(to_mcp)?,
            None => QueryKind::Auto,
        };
        let mut request = fm_core::QueryRequest {
            kind,
            category: req.category,
            max_results: req.max_results,
            center: req.center.map(Coord3::from_array),
            filters: req.tags.into_iter().map(Filter::tag).collect(),
            ..Default::default()
        };
        if let Some(confidence) = req.confidence {
            request.confidence = confidence;
        }
        if let Some(exploration) = req.exploration {
            request.exploration = exploration;
        }

        let mut state = self.state.lock().await;
        let ServerState { memory, context } = &mut *state;
        let response = memory.query(request, context).map_err(to_mcp)?;
        json_result(&response)
    }

    #[tool(description = "Find memories near an existing memory, most similar first.")]
    async fn fm_find_similar(&self, Parameters(req): Parameters<SimilarRequest>) -> Result<CallToolResult, McpError> {
        let defaults = SimilarOptions::default();
        let options = SimilarOptions {
            min_similarity: req.min_similarity.unwrap_or(defaults.min_similarity),
            max_results: req.max_results.unwrap_or(defaults.max_results),
        };
        let mut state = self.state.lock().await;
        let response = state.memory.find_similar(&req.id, options).map_err(to_mcp)?;
        json_result(&response)
    }

    #[tool(
        description = "Force an emergent discovery pass with the given policy (idle, cascade, uncertainty or synthesis) and return the insights it found."
    )]
    async fn fm_discover(&self, Parameters(req): Parameters<DiscoverRequest>) -> Result<CallToolResult, McpError> {
        let mut state = self.state.lock().await;
        let insights = state
            .memory
            .trigger_emergent_discovery(&req.policy)
            .map_err(to_mcp)?;
        json_result(&serde_json::json!({
            "policy": req.policy,
            "insights": insights,
        }))
    }

    #[tool(
        description = "Give relevance feedback on memories you were shown. Boost raises their confidence and strengthens their links; demote lowers confidence."
    )]
    async fn fm_feedback(&self, Parameters(req): Parameters<FeedbackRequest>) -> Result<CallToolResult, McpError> {
        let signal: FeedbackSignal = req.signal.parse().map_err(to_mcp)?;
        let mut state = self.state.lock().await;
        let result = state.memory.apply_feedback(&req.ids, signal);
        json_result(&result)
    }

    #[tool(description = "Memory statistics: counts per category, rolling query metrics and adaptation state.")]
    async fn fm_stats(&self) -> Result<CallToolResult, McpError> {
        let state = self.state.lock().await;
        json_result(&state.memory.stats())
    }
}

#[tool_handler]
impl ServerHandler for FmServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Field memory: a project-scoped store of categorized records that learns from use.\n\n\
                 - fm_store records as you learn about the project (functions, documents, decisions).\n\
                 - fm_query with a category and high confidence for exact lookups; lower confidence and \
                   raise exploration to surface related material and emergent insights.\n\
                 - fm_feedback boost on memories that helped, demote on ones that did not.\n\
                 - fm_discover runs a discovery pass on demand; fm_stats reports the current state."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
