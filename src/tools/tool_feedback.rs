//! MCP `tool_feedback` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `tool_feedback` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ToolFeedbackParams {
    /// The tool being rated.
    #[schemars(description = "The tool being rated")]
    pub tool_name: String,

    /// Whether the tool's output was relevant.
    #[schemars(description = "Whether the tool's output was relevant")]
    pub relevant: bool,

    /// Whether the tool's output was sufficient.
    #[schemars(description = "Whether the tool's output was sufficient")]
    pub sufficient: bool,

    /// Improvement suggestion (≤ 100 chars).
    #[schemars(description = "Improvement suggestion (max 100 chars)")]
    pub suggestion: Option<String>,

    /// Invocation context (≤ 50 chars).
    #[schemars(description = "Invocation context (max 50 chars)")]
    pub context: Option<String>,

    /// Session the feedback belongs to.
    #[schemars(description = "Session the feedback belongs to")]
    pub session_id: Option<String>,

    /// `"sampled"` or `"voluntary"` (default).
    #[schemars(description = "'sampled' or 'voluntary' (default)")]
    pub trigger_type: Option<String>,
}
