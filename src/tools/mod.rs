pub mod amend;
pub mod context;
pub mod forget;
pub mod graph_explore;
pub mod link;
pub mod memory_consolidate;
pub mod memory_stats;
pub mod recall;
pub mod reflect;
pub mod remember;
pub mod tool_feedback;

use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use std::sync::Arc;

use crate::memory::error::MemoryError;
use crate::memory::manager::{self, MemoryManager, RememberScope};
use crate::memory::types::{FragmentType, RelationType};

/// The mnemon MCP tool handler. Holds the memory facade and exposes the
/// eleven agent operations via the `#[tool_router]` macro.
#[derive(Clone)]
pub struct MnemonTools {
    tool_router: ToolRouter<Self>,
    manager: Arc<MemoryManager>,
}

/// Run a facade call on a blocking worker and serialize the outcome.
///
/// Validation, not-found, and permission errors surface as tool errors with
/// full detail; backend failures surface as `{success:false, error}` so the
/// agent can degrade rather than crash its loop.
async fn run_blocking<T, F>(f: F) -> Result<String, String>
where
    T: serde::Serialize + Send + 'static,
    F: FnOnce() -> Result<T, MemoryError> + Send + 'static,
{
    let result = tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| format!("task failed: {e}"))?;
    match result {
        Ok(value) => {
            serde_json::to_string(&value).map_err(|e| format!("serialization failed: {e}"))
        }
        Err(e @ (MemoryError::Validation(_) | MemoryError::NotFound(_) | MemoryError::Permission(_))) => {
            Err(e.to_string())
        }
        Err(e) => Ok(serde_json::json!({
            "success": false,
            "error": e.to_string(),
        })
        .to_string()),
    }
}

fn parse_type(s: &str) -> Result<FragmentType, String> {
    s.parse::<FragmentType>()
}

fn parse_relation(s: &str) -> Result<RelationType, String> {
    s.parse::<RelationType>()
}

#[tool_router]
impl MnemonTools {
    pub fn new(manager: Arc<MemoryManager>) -> Self {
        Self {
            tool_router: Self::tool_router(),
            manager,
        }
    }

    fn track(&self, session_id: &Option<String>, tool: &str) {
        if let Some(session) = session_id {
            self.manager.sessions().record_tool_call(session, tool);
        }
    }

    /// Store a fragment of knowledge.
    #[tool(description = "Store a knowledge fragment. Types: fact, decision, error, preference, procedure, relation. Content is PII-redacted and deduplicated by hash.")]
    async fn remember(
        &self,
        Parameters(params): Parameters<remember::RememberParams>,
    ) -> Result<String, String> {
        let fragment_type = parse_type(&params.r#type)?;
        let scope = match params.scope.as_deref() {
            None | Some("permanent") => RememberScope::Permanent,
            Some("session") => RememberScope::Session,
            Some(other) => return Err(format!("unknown scope: {other}. Supported: permanent, session")),
        };
        self.track(&params.session_id, "remember");
        tracing::info!(
            content_len = params.content.len(),
            topic = %params.topic,
            fragment_type = %fragment_type,
            "remember called"
        );

        let manager = Arc::clone(&self.manager);
        run_blocking(move || {
            manager.remember(manager::RememberParams {
                content: params.content,
                topic: params.topic,
                fragment_type,
                keywords: params.keywords,
                importance: params.importance,
                source: params.source,
                linked_to: params.linked_to.unwrap_or_default(),
                scope,
                is_anchor: params.is_anchor.unwrap_or(false),
                agent_id: params.agent_id,
                session_id: params.session_id,
            })
        })
        .await
    }

    /// Retrieve fragments through the three-tier cascade.
    #[tool(description = "Retrieve fragments by keywords, topic, type, or free text. Cascades keyword index → durable search → semantic search under a token budget.")]
    async fn recall(
        &self,
        Parameters(params): Parameters<recall::RecallParams>,
    ) -> Result<String, String> {
        let fragment_type = params.r#type.as_deref().map(parse_type).transpose()?;
        let link_relations = params
            .link_relation_type
            .map(|relations| {
                relations
                    .iter()
                    .map(|r| parse_relation(r))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;
        self.track(&params.session_id, "recall");

        let manager = Arc::clone(&self.manager);
        run_blocking(move || {
            manager.recall(manager::RecallParams {
                keywords: params.keywords.unwrap_or_default(),
                topic: params.topic,
                fragment_type,
                text: params.text,
                min_importance: params.min_importance,
                token_budget: params.token_budget,
                include_links: params.include_links.unwrap_or(true),
                link_relations,
                threshold: params.threshold,
                agent_id: params.agent_id,
                session_id: params.session_id,
            })
        })
        .await
    }

    /// Delete fragments by id or topic.
    #[tool(description = "Delete a fragment by id, or every fragment under a topic. Permanent fragments require force=true.")]
    async fn forget(
        &self,
        Parameters(params): Parameters<forget::ForgetParams>,
    ) -> Result<String, String> {
        let manager = Arc::clone(&self.manager);
        run_blocking(move || {
            manager.forget(manager::ForgetParams {
                id: params.id,
                topic: params.topic,
                force: params.force.unwrap_or(false),
                agent_id: params.agent_id,
            })
        })
        .await
    }

    /// Create a typed edge between two fragments.
    #[tool(description = "Create a typed edge between two fragments: related, caused_by, resolved_by, part_of, contradicts, superseded_by.")]
    async fn link(
        &self,
        Parameters(params): Parameters<link::LinkParams>,
    ) -> Result<String, String> {
        let relation_type = match params.relation_type.as_deref() {
            None => RelationType::Related,
            Some(s) => parse_relation(s)?,
        };

        let manager = Arc::clone(&self.manager);
        run_blocking(move || {
            manager.link(manager::LinkParams {
                from_id: params.from_id,
                to_id: params.to_id,
                relation_type,
                agent_id: params.agent_id,
            })
        })
        .await
    }

    /// Amend a fragment, archiving its previous state.
    #[tool(description = "Amend a fragment. The previous state is archived; a content change that collides with another fragment reports merged=true.")]
    async fn amend(
        &self,
        Parameters(params): Parameters<amend::AmendParams>,
    ) -> Result<String, String> {
        let fragment_type = params.r#type.as_deref().map(parse_type).transpose()?;

        let manager = Arc::clone(&self.manager);
        run_blocking(move || {
            manager.amend(manager::AmendParams {
                id: params.id,
                content: params.content,
                topic: params.topic,
                keywords: params.keywords,
                fragment_type,
                importance: params.importance,
                is_anchor: params.is_anchor,
                supersedes: params.supersedes,
                agent_id: params.agent_id,
            })
        })
        .await
    }

    /// Project a session recap into typed fragments.
    #[tool(description = "Project a session recap into typed fragments: summary facts, decisions, resolved errors, procedures, open questions — with rule-based auto-linking.")]
    async fn reflect(
        &self,
        Parameters(params): Parameters<reflect::ReflectParams>,
    ) -> Result<String, String> {
        self.track(&params.session_id, "reflect");
        if let Some(ref session) = params.session_id {
            self.manager.sessions().mark_reflected(session);
        }

        let manager = Arc::clone(&self.manager);
        run_blocking(move || {
            manager.reflect(manager::ReflectParams {
                summary: params.summary,
                decisions: params.decisions.unwrap_or_default(),
                errors_resolved: params.errors_resolved.unwrap_or_default(),
                new_procedures: params.new_procedures.unwrap_or_default(),
                open_questions: params.open_questions.unwrap_or_default(),
                task_effectiveness: params.task_effectiveness.map(|t| {
                    manager::TaskEffectiveness {
                        overall_success: t.overall_success,
                        tool_highlights: t.tool_highlights.unwrap_or_default(),
                        tool_pain_points: t.tool_pain_points.unwrap_or_default(),
                    }
                }),
                session_id: params.session_id,
                agent_id: params.agent_id,
            })
        })
        .await
    }

    /// Load session-bootstrap context.
    #[tool(description = "Load session-bootstrap context: core memory (preferences, errors, procedures) plus the session's working memory, as one injection text.")]
    async fn context(
        &self,
        Parameters(params): Parameters<context::ContextParams>,
    ) -> Result<String, String> {
        let types = params
            .types
            .map(|types| {
                types
                    .iter()
                    .map(|t| parse_type(t))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;
        self.track(&params.session_id, "context");

        let manager = Arc::clone(&self.manager);
        run_blocking(move || {
            manager.context(manager::ContextParams {
                token_budget: params.token_budget,
                types,
                session_id: params.session_id,
                agent_id: params.agent_id,
            })
        })
        .await
    }

    /// Record feedback about a tool.
    #[tool(description = "Record feedback about a memory tool: was it relevant and sufficient, plus an optional suggestion.")]
    async fn tool_feedback(
        &self,
        Parameters(params): Parameters<tool_feedback::ToolFeedbackParams>,
    ) -> Result<String, String> {
        self.track(&params.session_id, "tool_feedback");

        let manager = Arc::clone(&self.manager);
        run_blocking(move || {
            manager
                .tool_feedback(manager::ToolFeedbackParams {
                    tool_name: params.tool_name,
                    relevant: params.relevant,
                    sufficient: params.sufficient,
                    suggestion: params.suggestion,
                    context: params.context,
                    session_id: params.session_id,
                    trigger_type: params.trigger_type,
                })
                .map(|()| serde_json::json!({"recorded": true}))
        })
        .await
    }

    /// Memory store statistics.
    #[tool(description = "Memory store statistics: counts by type, tier, and agent, anchors, embedding coverage, and size.")]
    async fn memory_stats(
        &self,
        Parameters(_params): Parameters<memory_stats::MemoryStatsParams>,
    ) -> Result<String, String> {
        let manager = Arc::clone(&self.manager);
        run_blocking(move || manager.stats()).await
    }

    /// Run the consolidation pipeline.
    #[tool(description = "Run the consolidation pipeline: tier transitions, decay, expiry, dedup, embedding backfill, contradiction detection, and reporting.")]
    async fn memory_consolidate(
        &self,
        Parameters(_params): Parameters<memory_consolidate::MemoryConsolidateParams>,
    ) -> Result<String, String> {
        let manager = Arc::clone(&self.manager);
        run_blocking(move || manager.consolidate()).await
    }

    /// Walk the causal graph from a fragment.
    #[tool(description = "Walk the causal graph from a fragment: its caused_by and resolved_by neighbors, annotated with relation and depth.")]
    async fn graph_explore(
        &self,
        Parameters(params): Parameters<graph_explore::GraphExploreParams>,
    ) -> Result<String, String> {
        let manager = Arc::clone(&self.manager);
        run_blocking(move || manager.graph_explore(&params.start_id, params.agent_id)).await
    }
}

#[tool_handler]
impl ServerHandler for MnemonTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "mnemon is a persistent memory server for agents. Use remember to store \
                 fragments, recall to search them, context at session start, and reflect \
                 at session end."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}
