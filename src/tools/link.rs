//! MCP `link` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `link` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct LinkParams {
    /// Source fragment id.
    #[schemars(description = "Source fragment id")]
    pub from_id: String,

    /// Target fragment id.
    #[schemars(description = "Target fragment id")]
    pub to_id: String,

    /// Edge type: `related` (default), `caused_by`, `resolved_by`, `part_of`,
    /// `contradicts`, or `superseded_by`.
    #[schemars(
        description = "Edge type: 'related' (default), 'caused_by', 'resolved_by', 'part_of', 'contradicts', or 'superseded_by'"
    )]
    pub relation_type: Option<String>,

    /// Caller's agent scope.
    #[schemars(description = "Caller's agent scope")]
    pub agent_id: Option<String>,
}
