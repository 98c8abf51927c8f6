//! MCP `graph_explore` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `graph_explore` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct GraphExploreParams {
    /// Fragment to start the root-cause walk from.
    #[schemars(description = "Fragment to start the root-cause walk from")]
    pub start_id: String,

    /// Caller's agent scope.
    #[schemars(description = "Caller's agent scope")]
    pub agent_id: Option<String>,
}
