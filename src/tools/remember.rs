//! MCP `remember` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `remember` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct RememberParams {
    /// The knowledge to store. PII is redacted and content is capped at 300 chars.
    #[schemars(description = "The knowledge to store. PII is redacted; content is capped at 300 chars.")]
    pub content: String,

    /// Categorical topic label, e.g. `"redis"`.
    #[schemars(description = "Categorical topic label, e.g. 'redis'")]
    pub topic: String,

    /// Fragment type: `fact`, `decision`, `error`, `preference`, `procedure`, or `relation`.
    #[schemars(
        description = "Fragment type: 'fact', 'decision', 'error', 'preference', 'procedure', or 'relation'"
    )]
    pub r#type: String,

    /// Explicit keywords; auto-extracted from the content when omitted.
    #[schemars(description = "Explicit keywords. Auto-extracted from the content when omitted.")]
    pub keywords: Option<Vec<String>>,

    /// Importance in `[0.0, 1.0]`; defaults by type.
    #[schemars(description = "Importance 0.0-1.0. Defaults by type (preference 0.95 ... fact 0.5).")]
    pub importance: Option<f64>,

    /// Optional provenance string.
    #[schemars(description = "Optional provenance string")]
    pub source: Option<String>,

    /// Existing fragment ids to link with `related` edges.
    #[schemars(description = "Existing fragment ids to link with 'related' edges")]
    pub linked_to: Option<Vec<String>>,

    /// `"permanent"` (durable store, default) or `"session"` (working memory only).
    #[schemars(description = "'permanent' (durable, default) or 'session' (working memory only)")]
    pub scope: Option<String>,

    /// Anchored fragments are exempt from decay, demotion, and expiry.
    #[schemars(description = "Anchor the fragment: exempt from decay, demotion, and expiry")]
    pub is_anchor: Option<bool>,

    /// Owning agent scope; `"default"` is the shared pool.
    #[schemars(description = "Owning agent scope. 'default' is the shared pool.")]
    pub agent_id: Option<String>,

    /// Session the write belongs to (activity tracking, working memory).
    #[schemars(description = "Session id for activity tracking and working memory")]
    pub session_id: Option<String>,
}
