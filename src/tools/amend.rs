//! MCP `amend` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `amend` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct AmendParams {
    /// Fragment id to amend. The previous state is archived first.
    #[schemars(description = "Fragment id to amend. The previous state is archived first.")]
    pub id: String,

    /// Replacement content. Recomputes the hash and invalidates the embedding.
    #[schemars(description = "Replacement content. Recomputes the hash and invalidates the embedding.")]
    pub content: Option<String>,

    /// Replacement topic.
    #[schemars(description = "Replacement topic")]
    pub topic: Option<String>,

    /// Replacement keywords.
    #[schemars(description = "Replacement keywords")]
    pub keywords: Option<Vec<String>>,

    /// Replacement fragment type.
    #[schemars(description = "Replacement fragment type")]
    pub r#type: Option<String>,

    /// Replacement importance in `[0.0, 1.0]`.
    #[schemars(description = "Replacement importance 0.0-1.0")]
    pub importance: Option<f64>,

    /// Set or clear the anchor flag.
    #[schemars(description = "Set or clear the anchor flag")]
    pub is_anchor: Option<bool>,

    /// Id of an older fragment this amendment supersedes; its importance
    /// drops to 0.3 and it gains a `related` edge to this one.
    #[schemars(
        description = "Id of an older fragment this amendment supersedes (importance drops to 0.3)"
    )]
    pub supersedes: Option<String>,

    /// Caller's agent scope.
    #[schemars(description = "Caller's agent scope")]
    pub agent_id: Option<String>,
}
