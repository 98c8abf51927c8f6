//! The memory facade — the eleven agent-facing operations.
//!
//! [`MemoryManager`] composes the factory, index, store, search cascade,
//! session tracker, consolidator, and providers behind explicit
//! constructor-injected collaborators. Handlers call it from blocking worker
//! threads; everything here is synchronous.
//!
//! Ordering inside `remember`: validate → redact/hash (factory) →
//! store-insert → index → link → conflict scan → auto-link → enqueue.
//! A failure before the insert prevents all later effects; afterwards every
//! step is best-effort and never surfaces to the caller.

use anyhow::Context as _;
use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::consolidate::{ConsolidationReport, Consolidator};
use super::error::{MemoryError, MemoryResult};
use super::factory::{CreateParams, FragmentFactory};
use super::index::{EvalJob, KeywordIndex, WorkingMemoryEntry};
use super::reflect::{
    build_reflect_prompt, minimal_fact_content, parse_structured_summary, would_create_cycle,
    RESOLVED_PREFIX, UNRESOLVED_PREFIX,
};
use super::search::{default_link_relations, FragmentSearch, SearchRequest};
use super::session::SessionTracker;
use super::stats::{memory_stats, StatsResponse};
use super::store::{self, RcaNode, UpdateOutcome, UpdatePatch};
use super::tokens::{chars_for_tokens, TokenCounter};
use super::types::{
    is_valid_fragment_id, AgentScope, Fragment, FragmentType, RecallResult, RelationType,
    TaskFeedback, ToolFeedback, TtlTier,
};
use crate::config::MnemonConfig;
use crate::embedding::EmbeddingProvider;
use crate::llm::LlmClient;
use crate::nli::NliClassifier;

/// Same-topic cosine floor for the insert-time conflict scan.
const CONFLICT_SIMILARITY: f64 = 0.8;
/// Same-topic cosine floor for insert-time auto-linking.
const AUTOLINK_SIMILARITY: f64 = 0.7;
/// Cosine floor above which a same-type auto-link becomes a supersession.
const SUPERSEDE_SIMILARITY: f64 = 0.85;
/// Auto-link candidate cap.
const AUTOLINK_LIMIT: usize = 3;

// ── Parameter / result types ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RememberScope {
    Permanent,
    Session,
}

pub struct RememberParams {
    pub content: String,
    pub topic: String,
    pub fragment_type: FragmentType,
    pub keywords: Option<Vec<String>>,
    pub importance: Option<f64>,
    pub source: Option<String>,
    pub linked_to: Vec<String>,
    pub scope: RememberScope,
    pub is_anchor: bool,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
}

/// A same-topic near-duplicate surfaced by the conflict scan.
#[derive(Debug, Serialize)]
pub struct ConflictNote {
    pub id: String,
    pub content: String,
    pub similarity: f64,
}

#[derive(Debug, Serialize)]
pub struct RememberResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub created: bool,
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_tier: Option<TtlTier>,
    pub scope: String,
    pub conflicts: Vec<ConflictNote>,
    /// Best-effort steps that failed after the durable insert succeeded.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

pub struct RecallParams {
    pub keywords: Vec<String>,
    pub topic: Option<String>,
    pub fragment_type: Option<FragmentType>,
    pub text: Option<String>,
    pub min_importance: Option<f64>,
    pub token_budget: Option<usize>,
    pub include_links: bool,
    pub link_relations: Option<Vec<RelationType>>,
    pub threshold: Option<f64>,
    pub agent_id: Option<String>,
    pub session_id: Option<String>,
}

pub struct ForgetParams {
    pub id: Option<String>,
    pub topic: Option<String>,
    pub force: bool,
    pub agent_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ForgetResult {
    pub deleted: usize,
    pub protected: usize,
}

pub struct LinkParams {
    pub from_id: String,
    pub to_id: String,
    pub relation_type: RelationType,
    pub agent_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LinkResult {
    pub created: bool,
}

pub struct AmendParams {
    pub id: String,
    pub content: Option<String>,
    pub topic: Option<String>,
    pub keywords: Option<Vec<String>>,
    pub fragment_type: Option<FragmentType>,
    pub importance: Option<f64>,
    pub is_anchor: Option<bool>,
    /// Id of an older fragment this amendment supersedes.
    pub supersedes: Option<String>,
    pub agent_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AmendResult {
    pub updated: bool,
    pub merged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing_id: Option<String>,
}

pub struct TaskEffectiveness {
    pub overall_success: bool,
    pub tool_highlights: Vec<String>,
    pub tool_pain_points: Vec<String>,
}

pub struct ReflectParams {
    pub summary: String,
    pub decisions: Vec<String>,
    pub errors_resolved: Vec<String>,
    pub new_procedures: Vec<String>,
    pub open_questions: Vec<String>,
    pub task_effectiveness: Option<TaskEffectiveness>,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreatedFragment {
    pub id: String,
    #[serde(rename = "type")]
    pub fragment_type: FragmentType,
}

#[derive(Debug, Serialize)]
pub struct ReflectResult {
    pub created: Vec<CreatedFragment>,
    pub links: usize,
}

pub struct ContextParams {
    pub token_budget: Option<usize>,
    pub types: Option<Vec<FragmentType>>,
    pub session_id: Option<String>,
    pub agent_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ContextResult {
    pub injection_text: String,
    pub core_count: usize,
    pub working_count: usize,
    pub total_tokens: usize,
}

pub struct ToolFeedbackParams {
    pub tool_name: String,
    pub relevant: bool,
    pub sufficient: bool,
    pub suggestion: Option<String>,
    pub context: Option<String>,
    pub session_id: Option<String>,
    pub trigger_type: Option<String>,
}

// ── The facade ───────────────────────────────────────────────────────────────

pub struct MemoryManager {
    db: Arc<Mutex<Connection>>,
    index: Arc<KeywordIndex>,
    sessions: Arc<SessionTracker>,
    factory: FragmentFactory,
    search: FragmentSearch,
    consolidator: Consolidator,
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Arc<LlmClient>,
    nli: Arc<NliClassifier>,
    tokens: Arc<TokenCounter>,
    config: Arc<MnemonConfig>,
    db_path: Option<PathBuf>,
}

impl MemoryManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<Mutex<Connection>>,
        index: Arc<KeywordIndex>,
        sessions: Arc<SessionTracker>,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Arc<LlmClient>,
        nli: Arc<NliClassifier>,
        tokens: Arc<TokenCounter>,
        config: Arc<MnemonConfig>,
        db_path: Option<PathBuf>,
    ) -> Self {
        let factory = FragmentFactory::new(Arc::clone(&tokens));
        let search = FragmentSearch::new(
            config.search.clone(),
            config.ranking.clone(),
            config.stale.clone(),
        );
        let consolidator = Consolidator::new(
            config.consolidation.clone(),
            config.resolved_report_dir(),
        );
        Self {
            db,
            index,
            sessions,
            factory,
            search,
            consolidator,
            embedder,
            llm,
            nli,
            tokens,
            config,
            db_path,
        }
    }

    pub fn index(&self) -> &KeywordIndex {
        &self.index
    }

    /// Shared handle to the underlying connection (CLI maintenance, tests).
    pub fn db_handle(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.db)
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }

    fn scope_for(&self, agent_id: &Option<String>) -> AgentScope {
        AgentScope::agent(
            agent_id
                .clone()
                .unwrap_or_else(|| self.config.storage.default_agent.clone()),
        )
    }

    fn lock_db(&self) -> MemoryResult<std::sync::MutexGuard<'_, Connection>> {
        self.db
            .lock()
            .map_err(|e| MemoryError::Backend(anyhow::anyhow!("db lock poisoned: {e}")))
    }

    // ── remember ─────────────────────────────────────────────────────────────

    pub fn remember(&self, params: RememberParams) -> MemoryResult<RememberResult> {
        if params.content.trim().is_empty() {
            return Err(MemoryError::validation("content must not be empty"));
        }
        if params.topic.trim().is_empty() {
            return Err(MemoryError::validation("topic must not be empty"));
        }
        if let Some(importance) = params.importance {
            if !(0.0..=1.0).contains(&importance) {
                return Err(MemoryError::validation(
                    "importance must be between 0.0 and 1.0",
                ));
            }
        }

        let scope = self.scope_for(&params.agent_id);
        let agent_id = scope.owner().to_string();

        // Session scope never touches the durable store
        if params.scope == RememberScope::Session {
            let session_id = params
                .session_id
                .clone()
                .ok_or_else(|| MemoryError::validation("scope=session requires a sessionId"))?;
            let content = super::redact::redact(&params.content);
            let tokens = self.tokens.count(&content);
            let importance = params
                .importance
                .unwrap_or_else(|| params.fragment_type.default_importance());
            self.index.wm_push(
                &session_id,
                WorkingMemoryEntry {
                    content,
                    importance,
                    tokens,
                    created_at: Utc::now().to_rfc3339(),
                },
            );
            return Ok(RememberResult {
                id: None,
                created: true,
                keywords: Vec::new(),
                ttl_tier: None,
                scope: "session".to_string(),
                conflicts: Vec::new(),
                notes: Vec::new(),
            });
        }

        let fragment = self.factory.create(
            CreateParams {
                content: params.content,
                topic: params.topic,
                fragment_type: params.fragment_type,
                keywords: params.keywords,
                importance: params.importance,
                source: params.source,
                agent_id,
                is_anchor: params.is_anchor,
            },
            Utc::now(),
        );

        let mut notes = Vec::new();
        let outcome = {
            let mut conn = self.lock_db()?;
            store::insert(&mut conn, &fragment, self.embedder.as_ref())
                .context("fragment insert failed")?
        };

        if !outcome.created {
            // Dedup hit: surface the existing id, nothing else to do
            return Ok(RememberResult {
                id: Some(outcome.id),
                created: false,
                keywords: fragment.keywords,
                ttl_tier: Some(fragment.ttl_tier),
                scope: "permanent".to_string(),
                conflicts: Vec::new(),
                notes,
            });
        }

        // Everything after the durable insert is best-effort
        self.index.index(&fragment, params.session_id.as_deref());

        for target in &params.linked_to {
            let mut conn = match self.lock_db() {
                Ok(conn) => conn,
                Err(_) => break,
            };
            if let Err(e) =
                store::create_link(&mut conn, &fragment.id, target, RelationType::Related, &scope)
            {
                warn!(from = %fragment.id, to = %target, error = %e, "explicit link failed");
                notes.push(format!("link to {target} failed"));
            }
        }

        let conflicts = match self.conflict_scan(&fragment, &scope) {
            Ok(conflicts) => conflicts,
            Err(e) => {
                warn!(id = %fragment.id, error = %e, "conflict scan failed");
                notes.push("conflict scan unavailable".to_string());
                Vec::new()
            }
        };

        if let Err(e) = self.auto_link(&fragment, &scope) {
            warn!(id = %fragment.id, error = %e, "auto-link failed");
        }

        if !fragment.fragment_type.excluded_from_evaluation() {
            self.index.enqueue_evaluation(EvalJob {
                fragment_id: fragment.id.clone(),
                agent_id: fragment.agent_id.clone(),
                fragment_type: fragment.fragment_type.as_str().to_string(),
                content: fragment.content.clone(),
            });
        }

        if let Some(ref session_id) = params.session_id {
            self.sessions.record_keywords(session_id, &fragment.keywords);
            self.sessions
                .record_fragments(session_id, std::slice::from_ref(&fragment.id));
        }

        Ok(RememberResult {
            id: Some(fragment.id),
            created: true,
            keywords: fragment.keywords,
            ttl_tier: Some(fragment.ttl_tier),
            scope: "permanent".to_string(),
            conflicts,
            notes,
        })
    }

    /// Same-topic peers with L3 cosine similarity above the conflict floor.
    fn conflict_scan(
        &self,
        fragment: &Fragment,
        scope: &AgentScope,
    ) -> anyhow::Result<Vec<ConflictNote>> {
        let conn = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
        let Some(embedding) = store::get_embedding(&conn, &fragment.id)? else {
            return Ok(Vec::new());
        };
        let peers = store::search_by_semantic(&conn, &embedding, 10, CONFLICT_SIMILARITY, scope)?;
        Ok(peers
            .into_iter()
            .filter(|(peer, _)| peer.id != fragment.id && peer.topic == fragment.topic)
            .map(|(peer, similarity)| ConflictNote {
                id: peer.id,
                content: peer.content,
                similarity,
            })
            .collect())
    }

    /// Insert-time similarity-driven edge creation (up to three candidates).
    fn auto_link(&self, fragment: &Fragment, scope: &AgentScope) -> anyhow::Result<()> {
        let peers = {
            let conn = self
                .db
                .lock()
                .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            let Some(embedding) = store::get_embedding(&conn, &fragment.id)? else {
                return Ok(());
            };
            store::search_by_semantic(&conn, &embedding, 10, AUTOLINK_SIMILARITY, scope)?
        };

        let candidates: Vec<(Fragment, f64)> = peers
            .into_iter()
            .filter(|(peer, _)| peer.id != fragment.id && peer.topic == fragment.topic)
            .take(AUTOLINK_LIMIT)
            .collect();

        for (peer, similarity) in candidates {
            let relation = classify_auto_link(fragment, &peer, similarity);
            let mut conn = self
                .db
                .lock()
                .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
            let (from, to) = match relation {
                // The older peer gains the pointer to its replacement/resolution
                RelationType::SupersededBy | RelationType::ResolvedBy => {
                    (peer.id.clone(), fragment.id.clone())
                }
                _ => (fragment.id.clone(), peer.id.clone()),
            };
            if let Err(e) = store::create_link(&mut conn, &from, &to, relation, scope) {
                debug!(from = %from, to = %to, error = %e, "auto-link edge failed");
            }
        }
        Ok(())
    }

    // ── recall ───────────────────────────────────────────────────────────────

    pub fn recall(&self, params: RecallParams) -> MemoryResult<RecallResult> {
        if let Some(threshold) = params.threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(MemoryError::validation(
                    "threshold must be between 0.0 and 1.0",
                ));
            }
        }

        let scope = self.scope_for(&params.agent_id);
        let request = SearchRequest {
            keywords: super::keywords::normalize_keywords(&params.keywords),
            topic: params.topic,
            fragment_type: params.fragment_type,
            text: params.text,
            min_importance: params.min_importance,
            token_budget: params
                .token_budget
                .unwrap_or(self.config.search.recall_token_budget),
            include_links: params.include_links,
            link_relations: params
                .link_relations
                .unwrap_or_else(default_link_relations),
            threshold: params.threshold,
        };

        let result = {
            let conn = self.lock_db()?;
            self.search
                .search(&conn, &self.index, self.embedder.as_ref(), &request, &scope)
                .context("recall failed")?
        };

        if let Some(ref session_id) = params.session_id {
            self.sessions.record_keywords(session_id, &request.keywords);
            let ids: Vec<String> = result
                .fragments
                .iter()
                .map(|f| f.fragment.id.clone())
                .collect();
            self.sessions.record_fragments(session_id, &ids);
        }

        Ok(result)
    }

    // ── forget ───────────────────────────────────────────────────────────────

    pub fn forget(&self, params: ForgetParams) -> MemoryResult<ForgetResult> {
        let scope = self.scope_for(&params.agent_id);

        let targets: Vec<Fragment> = match (&params.id, &params.topic) {
            (Some(id), _) => {
                if !is_valid_fragment_id(id) {
                    return Err(MemoryError::validation(format!("malformed fragment id: {id}")));
                }
                let conn = self.lock_db()?;
                let fragment = store::get_by_id(&conn, id, &scope)
                    .context("lookup failed")?
                    .ok_or_else(|| MemoryError::not_found(format!("fragment {id}")))?;
                vec![fragment]
            }
            (None, Some(topic)) => {
                let conn = self.lock_db()?;
                store::get_by_topic(&conn, topic, &scope).context("topic lookup failed")?
            }
            (None, None) => {
                return Err(MemoryError::validation("forget requires an id or a topic"));
            }
        };

        let mut deleted = 0;
        let mut protected = 0;
        for fragment in targets {
            if fragment.ttl_tier == TtlTier::Permanent && !params.force {
                protected += 1;
                continue;
            }
            let removed = {
                let mut conn = self.lock_db()?;
                store::delete(&mut conn, &fragment.id, &scope).context("delete failed")?
            };
            if removed {
                deleted += 1;
                self.index.deindex(
                    &fragment.id,
                    &fragment.keywords,
                    &fragment.topic,
                    fragment.fragment_type.as_str(),
                );
            }
        }

        if params.id.is_some() && deleted == 0 && protected > 0 && !params.force {
            // Deleting a single permanent row without force is a permission
            // problem the caller can see in the counters; keep the shape but
            // make the cause explicit in logs.
            debug!("forget blocked on permanent fragment without force");
        }

        Ok(ForgetResult { deleted, protected })
    }

    // ── link ─────────────────────────────────────────────────────────────────

    pub fn link(&self, params: LinkParams) -> MemoryResult<LinkResult> {
        for id in [&params.from_id, &params.to_id] {
            if !is_valid_fragment_id(id) {
                return Err(MemoryError::validation(format!("malformed fragment id: {id}")));
            }
        }
        let scope = self.scope_for(&params.agent_id);
        let mut conn = self.lock_db()?;

        let target = store::get_by_id(&conn, &params.to_id, &scope)
            .context("target lookup failed")?
            .ok_or_else(|| MemoryError::not_found(format!("fragment {}", params.to_id)))?;

        let created = store::create_link(
            &mut conn,
            &params.from_id,
            &params.to_id,
            params.relation_type,
            &scope,
        )
        .context("link failed")?;

        // Marking an error resolved halves its weight in future recalls
        if params.relation_type == RelationType::ResolvedBy
            && target.fragment_type == FragmentType::Error
            && target.importance > 0.5
        {
            conn.execute(
                "UPDATE fragments SET importance = importance / 2.0 WHERE id = ?1",
                rusqlite::params![target.id],
            )
            .context("importance update failed")?;
        }

        // Refresh cached copies so the new mirrors are visible immediately
        let mut refreshed = Vec::new();
        for id in [&params.from_id, &params.to_id] {
            if let Ok(Some(fragment)) = store::get_by_id(&conn, id, &scope) {
                refreshed.push(fragment);
            }
        }
        drop(conn);
        self.index.hot_put(&refreshed);

        Ok(LinkResult { created })
    }

    // ── amend ────────────────────────────────────────────────────────────────

    pub fn amend(&self, params: AmendParams) -> MemoryResult<AmendResult> {
        if !is_valid_fragment_id(&params.id) {
            return Err(MemoryError::validation(format!(
                "malformed fragment id: {}",
                params.id
            )));
        }
        if let Some(importance) = params.importance {
            if !(0.0..=1.0).contains(&importance) {
                return Err(MemoryError::validation(
                    "importance must be between 0.0 and 1.0",
                ));
            }
        }

        let scope = self.scope_for(&params.agent_id);
        let previous = {
            let conn = self.lock_db()?;
            store::get_by_id(&conn, &params.id, &scope)
                .context("lookup failed")?
                .ok_or_else(|| MemoryError::not_found(format!("fragment {}", params.id)))?
        };

        let patch = UpdatePatch {
            content: params.content,
            topic: params.topic,
            keywords: params.keywords.map(|k| super::keywords::normalize_keywords(&k)),
            fragment_type: params.fragment_type,
            importance: params.importance,
            is_anchor: params.is_anchor,
            source: None,
        };

        let outcome = {
            let mut conn = self.lock_db()?;
            store::update(&mut conn, &params.id, patch, scope.owner(), &scope, &self.tokens)
                .context("update failed")?
                .ok_or_else(|| MemoryError::not_found(format!("fragment {}", params.id)))?
        };

        match outcome {
            UpdateOutcome::Merged { existing_id } => Ok(AmendResult {
                updated: false,
                merged: true,
                existing_id: Some(existing_id),
            }),
            UpdateOutcome::Updated(updated) => {
                // Reindex under the new keywords/topic/type and refresh any
                // cached copy so readers never see the pre-amendment row
                self.index.deindex(
                    &previous.id,
                    &previous.keywords,
                    &previous.topic,
                    previous.fragment_type.as_str(),
                );
                self.index.index(&updated, None);
                self.index.hot_put(std::slice::from_ref(&updated));

                if let Some(ref superseded_id) = params.supersedes {
                    if let Err(e) = self.apply_supersedes(superseded_id, &updated.id, &scope) {
                        warn!(superseded = %superseded_id, error = %e, "supersedes bookkeeping failed");
                    }
                }

                Ok(AmendResult {
                    updated: true,
                    merged: false,
                    existing_id: None,
                })
            }
        }
    }

    /// `supersedes`: link the displaced original to its replacement and cut
    /// its importance to 0.3.
    fn apply_supersedes(
        &self,
        superseded_id: &str,
        replacement_id: &str,
        scope: &AgentScope,
    ) -> anyhow::Result<()> {
        let mut conn = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
        store::create_link(
            &mut conn,
            superseded_id,
            replacement_id,
            RelationType::Related,
            scope,
        )?;
        conn.execute(
            "UPDATE fragments SET importance = 0.3 WHERE id = ?1",
            rusqlite::params![superseded_id],
        )?;
        Ok(())
    }

    // ── reflect ──────────────────────────────────────────────────────────────

    pub fn reflect(&self, params: ReflectParams) -> MemoryResult<ReflectResult> {
        if params.summary.trim().is_empty() {
            return Err(MemoryError::validation("summary must not be empty"));
        }

        let scope = self.scope_for(&params.agent_id);
        let agent_id = scope.owner().to_string();
        let now = Utc::now();
        let mut created: Vec<CreatedFragment> = Vec::new();

        // Summary → chained fact fragments
        let summary_fragments = self.factory.split(
            &params.summary,
            CreateParams {
                content: String::new(),
                topic: "session-summary".to_string(),
                fragment_type: FragmentType::Fact,
                keywords: None,
                importance: None,
                source: params.session_id.clone(),
                agent_id: agent_id.clone(),
                is_anchor: false,
            },
            now,
        );

        let mut summary_ids: Vec<String> = Vec::new();
        for fragment in &summary_fragments {
            if let Some(id) = self.insert_reflect_fragment(fragment, &params.session_id)? {
                summary_ids.push(id.clone());
                created.push(CreatedFragment {
                    id,
                    fragment_type: FragmentType::Fact,
                });
            }
        }
        // Chain consecutive summary fragments
        let mut links = 0usize;
        for pair in summary_ids.windows(2) {
            if self
                .guarded_link(&pair[1], &pair[0], RelationType::Related, &scope)
                .unwrap_or(false)
            {
                links += 1;
            }
        }

        // Typed list entries
        let mut decision_ids = Vec::new();
        let mut error_ids = Vec::new();
        let mut procedure_ids = Vec::new();

        for text in &params.decisions {
            if let Some(id) = self.materialize(text, FragmentType::Decision, &agent_id, &params)? {
                decision_ids.push(id.clone());
                created.push(CreatedFragment {
                    id,
                    fragment_type: FragmentType::Decision,
                });
            }
        }
        for text in &params.errors_resolved {
            let wrapped = format!("{RESOLVED_PREFIX}{text}");
            if let Some(id) = self.materialize(&wrapped, FragmentType::Error, &agent_id, &params)? {
                error_ids.push(id.clone());
                created.push(CreatedFragment {
                    id,
                    fragment_type: FragmentType::Error,
                });
            }
        }
        for text in &params.new_procedures {
            if let Some(id) = self.materialize(text, FragmentType::Procedure, &agent_id, &params)? {
                procedure_ids.push(id.clone());
                created.push(CreatedFragment {
                    id,
                    fragment_type: FragmentType::Procedure,
                });
            }
        }
        for text in &params.open_questions {
            let wrapped = format!("{UNRESOLVED_PREFIX}{text}");
            if let Some(id) = self.materialize(&wrapped, FragmentType::Fact, &agent_id, &params)? {
                created.push(CreatedFragment {
                    id,
                    fragment_type: FragmentType::Fact,
                });
            }
        }

        // Rule-based auto-linking with the cycle guard
        for error_id in &error_ids {
            for decision_id in &decision_ids {
                if self
                    .guarded_link(error_id, decision_id, RelationType::CausedBy, &scope)
                    .unwrap_or(false)
                {
                    links += 1;
                }
            }
        }
        for procedure_id in &procedure_ids {
            for error_id in &error_ids {
                if self
                    .guarded_link(procedure_id, error_id, RelationType::ResolvedBy, &scope)
                    .unwrap_or(false)
                {
                    links += 1;
                }
            }
        }

        if let Some(ref effectiveness) = params.task_effectiveness {
            let conn = self.lock_db()?;
            store::insert_task_feedback(
                &conn,
                &TaskFeedback {
                    session_id: params.session_id.clone(),
                    overall_success: effectiveness.overall_success,
                    tool_highlights: effectiveness.tool_highlights.clone(),
                    tool_pain_points: effectiveness.tool_pain_points.clone(),
                    created_at: now.to_rfc3339(),
                },
            )
            .context("task feedback insert failed")?;
        }

        if let Some(ref session_id) = params.session_id {
            self.index.wm_clear(session_id);
        }

        Ok(ReflectResult { created, links })
    }

    fn materialize(
        &self,
        content: &str,
        fragment_type: FragmentType,
        agent_id: &str,
        params: &ReflectParams,
    ) -> MemoryResult<Option<String>> {
        if content.trim().is_empty() {
            return Ok(None);
        }
        let fragment = self.factory.create(
            CreateParams {
                content: content.to_string(),
                topic: "session-summary".to_string(),
                fragment_type,
                keywords: None,
                importance: None,
                source: params.session_id.clone(),
                agent_id: agent_id.to_string(),
                is_anchor: false,
            },
            Utc::now(),
        );
        self.insert_reflect_fragment(&fragment, &params.session_id)
    }

    fn insert_reflect_fragment(
        &self,
        fragment: &Fragment,
        session_id: &Option<String>,
    ) -> MemoryResult<Option<String>> {
        let outcome = {
            let mut conn = self.lock_db()?;
            store::insert(&mut conn, fragment, self.embedder.as_ref())
                .context("reflect insert failed")?
        };
        if outcome.created {
            self.index.index(fragment, session_id.as_deref());
        }
        Ok(Some(outcome.id))
    }

    /// Create an edge unless it would close a cycle. Returns whether an edge
    /// was created.
    fn guarded_link(
        &self,
        from_id: &str,
        to_id: &str,
        relation: RelationType,
        scope: &AgentScope,
    ) -> anyhow::Result<bool> {
        let mut conn = self
            .db
            .lock()
            .map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
        if would_create_cycle(&conn, from_id, to_id)? {
            debug!(from = %from_id, to = %to_id, "skipping link — would create a cycle");
            return Ok(false);
        }
        store::create_link(&mut conn, from_id, to_id, relation, scope)
    }

    // ── context ──────────────────────────────────────────────────────────────

    pub fn context(&self, params: ContextParams) -> MemoryResult<ContextResult> {
        let budget = params
            .token_budget
            .unwrap_or(self.config.search.context_token_budget);
        let types = params.types.unwrap_or_else(|| {
            vec![
                FragmentType::Preference,
                FragmentType::Error,
                FragmentType::Procedure,
            ]
        });
        let scope = self.scope_for(&params.agent_id);

        // Core memory: one recall bucket per type, importance floor 0.3
        let mut buckets: Vec<Vec<Fragment>> = Vec::new();
        for fragment_type in &types {
            let request = SearchRequest {
                keywords: Vec::new(),
                topic: None,
                fragment_type: Some(*fragment_type),
                text: None,
                min_importance: Some(0.3),
                token_budget: budget,
                include_links: false,
                link_relations: Vec::new(),
                threshold: None,
            };
            let conn = self.lock_db()?;
            let result = self
                .search
                .search(&conn, &self.index, self.embedder.as_ref(), &request, &scope)
                .context("context recall failed")?;
            buckets.push(result.fragments.into_iter().map(|f| f.fragment).collect());
        }

        let core_char_budget = chars_for_tokens(budget * 65 / 100);
        let mut core: Vec<Fragment> = Vec::new();
        let mut core_chars = 0usize;
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();

        // The best fragment of each type is guaranteed a slot first
        for bucket in &buckets {
            if let Some(first) = bucket.first() {
                if seen.insert(first.id.clone()) {
                    core_chars += first.content.chars().count();
                    core.push(first.clone());
                }
            }
        }
        // Then fill with the remaining rank-ordered fragments
        'fill: for bucket in &buckets {
            for fragment in bucket.iter().skip(1) {
                if core_chars >= core_char_budget {
                    break 'fill;
                }
                if seen.insert(fragment.id.clone()) {
                    core_chars += fragment.content.chars().count();
                    core.push(fragment.clone());
                }
            }
        }

        // Working memory from the session queue
        let wm_char_budget = chars_for_tokens(budget * 35 / 100);
        let mut working: Vec<WorkingMemoryEntry> = Vec::new();
        let mut wm_chars = 0usize;
        if let Some(ref session_id) = params.session_id {
            for entry in self.index.wm_entries(session_id) {
                let len = entry.content.chars().count();
                if wm_chars + len > wm_char_budget {
                    break;
                }
                wm_chars += len;
                working.push(entry);
            }
        }

        let mut text = String::new();
        if !core.is_empty() {
            text.push_str("[CORE MEMORY]\n");
            for fragment in &core {
                text.push_str(&format!(
                    "- ({}) {}\n",
                    fragment.fragment_type, fragment.content
                ));
            }
        }
        if !working.is_empty() {
            text.push_str("[WORKING MEMORY]\n");
            for entry in &working {
                text.push_str(&format!("- {}\n", entry.content));
            }
        }
        let unreflected = self.sessions.unreflected_sessions(5);
        if !unreflected.is_empty() {
            let ids: Vec<&str> = unreflected
                .iter()
                .map(|a| a.session_id.as_str())
                .collect();
            text.push_str(&format!(
                "[SYSTEM HINT] {} unreflected session(s): {} — consider calling reflect.\n",
                ids.len(),
                ids.join(", ")
            ));
        }

        let total_tokens = core.iter().map(|f| f.estimated_tokens).sum::<usize>()
            + working.iter().map(|e| e.tokens).sum::<usize>();

        Ok(ContextResult {
            injection_text: text,
            core_count: core.len(),
            working_count: working.len(),
            total_tokens,
        })
    }

    // ── forwarders ───────────────────────────────────────────────────────────

    pub fn tool_feedback(&self, params: ToolFeedbackParams) -> MemoryResult<()> {
        if params.tool_name.trim().is_empty() {
            return Err(MemoryError::validation("tool_name must not be empty"));
        }
        if params.suggestion.as_deref().map_or(0, |s| s.chars().count()) > 100 {
            return Err(MemoryError::validation("suggestion must be ≤ 100 chars"));
        }
        if params.context.as_deref().map_or(0, |s| s.chars().count()) > 50 {
            return Err(MemoryError::validation("context must be ≤ 50 chars"));
        }
        let trigger = params.trigger_type.unwrap_or_else(|| "voluntary".to_string());
        if trigger != "sampled" && trigger != "voluntary" {
            return Err(MemoryError::validation(
                "trigger_type must be 'sampled' or 'voluntary'",
            ));
        }

        let conn = self.lock_db()?;
        store::insert_tool_feedback(
            &conn,
            &ToolFeedback {
                tool_name: params.tool_name,
                relevant: params.relevant,
                sufficient: params.sufficient,
                suggestion: params.suggestion,
                context: params.context,
                session_id: params.session_id,
                trigger_type: trigger,
                created_at: Utc::now().to_rfc3339(),
            },
        )
        .context("feedback insert failed")?;
        Ok(())
    }

    pub fn graph_explore(
        &self,
        start_id: &str,
        agent_id: Option<String>,
    ) -> MemoryResult<Vec<RcaNode>> {
        if !is_valid_fragment_id(start_id) {
            return Err(MemoryError::validation(format!(
                "malformed fragment id: {start_id}"
            )));
        }
        let scope = self.scope_for(&agent_id);
        let conn = self.lock_db()?;
        store::get_rca_chain(&conn, start_id, &scope)
            .context("graph walk failed")?
            .ok_or_else(|| MemoryError::not_found(format!("fragment {start_id}")))
    }

    pub fn consolidate(&self) -> MemoryResult<ConsolidationReport> {
        let mut conn = self.lock_db()?;
        Ok(self.consolidator.run(
            &mut conn,
            &self.index,
            self.embedder.as_ref(),
            &self.nli,
            &self.llm,
        ))
    }

    pub fn stats(&self) -> MemoryResult<StatsResponse> {
        let conn = self.lock_db()?;
        memory_stats(&conn, self.db_path.as_deref()).map_err(MemoryError::Backend)
    }

    // ── auto-reflect ─────────────────────────────────────────────────────────

    /// Session-end summariser. Runs the LLM structured path when a backend is
    /// reachable, otherwise records one minimal `fact` fragment. Always marks
    /// the session reflected.
    pub fn auto_reflect(&self, session_id: &str) {
        let Some(activity) = self.sessions.get(session_id) else {
            return;
        };
        if activity.reflected || activity.tool_calls.is_empty() {
            self.sessions.mark_reflected(session_id);
            return;
        }

        let reflected = if self.llm.available() {
            let (system, user) = build_reflect_prompt(&activity);
            match self.llm.complete_json(&system, &user) {
                Ok(value) => match parse_structured_summary(&value) {
                    Some(summary) => self
                        .reflect(ReflectParams {
                            summary: summary.summary,
                            decisions: summary.decisions,
                            errors_resolved: summary.errors_resolved,
                            new_procedures: summary.new_procedures,
                            open_questions: summary.open_questions,
                            task_effectiveness: None,
                            session_id: Some(session_id.to_string()),
                            agent_id: None,
                        })
                        .is_ok(),
                    None => false,
                },
                Err(e) => {
                    debug!(session = %session_id, error = %e, "LLM auto-reflect failed");
                    false
                }
            }
        } else {
            false
        };

        if !reflected {
            // Degraded path: one minimal fact describing the session
            let content = minimal_fact_content(&activity);
            if let Err(e) = self.remember(RememberParams {
                content,
                topic: "session-summary".to_string(),
                fragment_type: FragmentType::Fact,
                keywords: None,
                importance: None,
                source: Some(session_id.to_string()),
                linked_to: Vec::new(),
                scope: RememberScope::Permanent,
                is_anchor: false,
                agent_id: None,
                session_id: Some(session_id.to_string()),
            }) {
                warn!(session = %session_id, error = %e, "minimal auto-reflect failed");
            }
        }

        self.sessions.mark_reflected(session_id);
    }
}

/// Insert-time auto-link classification.
fn classify_auto_link(new: &Fragment, peer: &Fragment, similarity: f64) -> RelationType {
    let both_errors =
        new.fragment_type == FragmentType::Error && peer.fragment_type == FragmentType::Error;
    if both_errors && marks_resolution(&new.content) {
        return RelationType::ResolvedBy;
    }
    if new.fragment_type == peer.fragment_type
        && similarity > SUPERSEDE_SIMILARITY
        && new.created_at > peer.created_at
    {
        return RelationType::SupersededBy;
    }
    RelationType::Related
}

/// Whether content reads as a resolution record.
fn marks_resolution(content: &str) -> bool {
    let lowered = content.to_lowercase();
    lowered.contains("해결") || lowered.contains("resolved") || lowered.contains("fixed")
}
