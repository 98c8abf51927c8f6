//! MCP `reflect` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Task-effectiveness recap persisted to `task_feedback`.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct TaskEffectivenessParams {
    /// Whether the overall task succeeded.
    #[schemars(description = "Whether the overall task succeeded")]
    pub overall_success: bool,

    /// Tools that worked well.
    #[schemars(description = "Tools that worked well")]
    pub tool_highlights: Option<Vec<String>>,

    /// Tools that caused friction.
    #[schemars(description = "Tools that caused friction")]
    pub tool_pain_points: Option<Vec<String>>,
}

/// Parameters for the `reflect` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ReflectParams {
    /// Free-form session recap; split into `fact` fragments.
    #[schemars(description = "Free-form session recap. Split into 'fact' fragments.")]
    pub summary: String,

    /// Decisions made this session; each becomes a `decision` fragment.
    #[schemars(description = "Decisions made this session (each becomes a 'decision' fragment)")]
    pub decisions: Option<Vec<String>>,

    /// Errors resolved this session; each becomes an `error` fragment marked resolved.
    #[schemars(description = "Errors resolved this session (each becomes an 'error' fragment marked resolved)")]
    pub errors_resolved: Option<Vec<String>>,

    /// New procedures learned; each becomes a `procedure` fragment.
    #[schemars(description = "New procedures learned (each becomes a 'procedure' fragment)")]
    pub new_procedures: Option<Vec<String>>,

    /// Questions left open; stored as facts marked unresolved.
    #[schemars(description = "Questions left open (stored as facts marked unresolved)")]
    pub open_questions: Option<Vec<String>>,

    /// Optional task-effectiveness recap.
    #[schemars(description = "Optional task-effectiveness recap")]
    pub task_effectiveness: Option<TaskEffectivenessParams>,

    /// Session being reflected; clears its working memory.
    #[schemars(description = "Session being reflected. Clears its working memory.")]
    pub session_id: Option<String>,

    /// Caller's agent scope.
    #[schemars(description = "Caller's agent scope")]
    pub agent_id: Option<String>,
}
