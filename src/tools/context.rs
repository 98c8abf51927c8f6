//! MCP `context` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `context` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ContextParams {
    /// Token budget for the injection text (default 2000; 65% core, 35% working).
    #[schemars(description = "Token budget for the injection text (default 2000; 65% core, 35% working)")]
    pub token_budget: Option<usize>,

    /// Core-memory types to load (default preference, error, procedure).
    #[schemars(description = "Core-memory types to load (default preference, error, procedure)")]
    pub types: Option<Vec<String>>,

    /// Session whose working memory should be included.
    #[schemars(description = "Session whose working memory should be included")]
    pub session_id: Option<String>,

    /// Caller's agent scope.
    #[schemars(description = "Caller's agent scope")]
    pub agent_id: Option<String>,
}
