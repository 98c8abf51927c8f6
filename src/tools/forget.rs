//! MCP `forget` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `forget` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ForgetParams {
    /// Fragment id to delete.
    #[schemars(description = "Fragment id to delete")]
    pub id: Option<String>,

    /// Delete every visible fragment under this topic instead.
    #[schemars(description = "Delete every visible fragment under this topic instead")]
    pub topic: Option<String>,

    /// Required to delete permanent-tier fragments.
    #[schemars(description = "Required to delete permanent-tier fragments")]
    pub force: Option<bool>,

    /// Caller's agent scope.
    #[schemars(description = "Caller's agent scope")]
    pub agent_id: Option<String>,
}
