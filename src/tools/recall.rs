//! MCP `recall` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `recall` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RecallParams {
    /// Keywords for the L1/L2 tiers.
    #[schemars(description = "Keywords for the keyword tiers")]
    pub keywords: Option<Vec<String>>,

    /// Restrict to one topic.
    #[schemars(description = "Restrict to one topic")]
    pub topic: Option<String>,

    /// Restrict to one fragment type.
    #[schemars(description = "Restrict to one fragment type")]
    pub r#type: Option<String>,

    /// Free-text query; enables semantic search when embeddings are configured.
    #[schemars(description = "Free-text query. Enables semantic search when embeddings are configured.")]
    pub text: Option<String>,

    /// Importance floor applied across all tiers.
    #[schemars(description = "Importance floor applied across all tiers")]
    pub min_importance: Option<f64>,

    /// Token budget for the response (default 1000).
    #[schemars(description = "Token budget for the response (default 1000)")]
    pub token_budget: Option<usize>,

    /// Expand one hop of linked fragments (default true).
    #[schemars(description = "Expand one hop of linked fragments (default true)")]
    pub include_links: Option<bool>,

    /// Relation whitelist for link expansion (default caused_by, resolved_by, related).
    #[schemars(
        description = "Relation whitelist for link expansion (default caused_by, resolved_by, related)"
    )]
    pub link_relation_type: Option<Vec<String>>,

    /// Drop semantic results below this similarity; keyword results are kept.
    #[schemars(description = "Drop semantic results below this similarity. Keyword results are kept.")]
    pub threshold: Option<f64>,

    /// Caller's agent scope.
    #[schemars(description = "Caller's agent scope")]
    pub agent_id: Option<String>,

    /// Session id for activity tracking.
    #[schemars(description = "Session id for activity tracking")]
    pub session_id: Option<String>,
}
