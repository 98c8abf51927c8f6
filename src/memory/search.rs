//! Read path — the three-tier retrieval cascade.
//!
//! L1 consults the in-process keyword index (with hot-cache materialisation),
//! L2 the durable keyword-overlap search, L3 the vector index. Each stage
//! reports whether the next should run; results merge into one [`Candidates`]
//! accumulator, deduplicated by id with the higher-similarity variant
//! winning. Ranking, token-budget trimming, link expansion, stale
//! annotation, and the caller's threshold filter are applied afterwards —
//! composite ranking runs *after* link expansion so primary and linked
//! fragments compete on the same scale.

use anyhow::Result;
use chrono::Utc;
use rusqlite::Connection;
use std::collections::HashMap;

use super::index::KeywordIndex;
use super::store::{self, KeywordFilter};
use super::types::{
    AgentScope, Fragment, FragmentType, RecallResult, RelationType, ScoredFragment, StaleInfo,
};
use crate::config::{RankingConfig, SearchConfig, StaleConfig};
use crate::embedding::{prepare_text, EmbeddingProvider};

/// Recall request after validation by the facade.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub keywords: Vec<String>,
    pub topic: Option<String>,
    pub fragment_type: Option<FragmentType>,
    /// Free-text query; enables the semantic tier.
    pub text: Option<String>,
    pub min_importance: Option<f64>,
    pub token_budget: usize,
    pub include_links: bool,
    pub link_relations: Vec<RelationType>,
    pub threshold: Option<f64>,
}

impl SearchRequest {
    /// Whether the request carries no filter at all (recency fallback).
    fn is_unfiltered(&self) -> bool {
        self.keywords.is_empty()
            && self.topic.is_none()
            && self.fragment_type.is_none()
            && self.text.is_none()
    }
}

/// Default one-hop relations admitted during link expansion.
pub fn default_link_relations() -> Vec<RelationType> {
    vec![
        RelationType::CausedBy,
        RelationType::ResolvedBy,
        RelationType::Related,
    ]
}

/// Accumulator shared by the cascade stages.
struct Candidates {
    by_id: HashMap<String, (Fragment, Option<f64>)>,
    order: Vec<String>,
    trace: Vec<String>,
}

impl Candidates {
    fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            order: Vec::new(),
            trace: Vec::new(),
        }
    }

    /// Merge a fragment, preferring the variant carrying the higher
    /// similarity score.
    fn merge(&mut self, fragment: Fragment, similarity: Option<f64>) {
        if let Some((_, existing_sim)) = self.by_id.get_mut(&fragment.id) {
            if similarity > *existing_sim {
                *existing_sim = similarity;
            }
            return;
        }
        self.order.push(fragment.id.clone());
        self.by_id.insert(fragment.id.clone(), (fragment, similarity));
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn into_vec(self) -> (Vec<(Fragment, Option<f64>)>, Vec<String>) {
        let mut by_id = self.by_id;
        let list = self
            .order
            .iter()
            .filter_map(|id| by_id.remove(id))
            .collect();
        (list, self.trace)
    }
}

/// The cascade orchestrator. Holds only configuration.
pub struct FragmentSearch {
    search: SearchConfig,
    ranking: RankingConfig,
    stale: StaleConfig,
}

impl FragmentSearch {
    pub fn new(search: SearchConfig, ranking: RankingConfig, stale: StaleConfig) -> Self {
        Self {
            search,
            ranking,
            stale,
        }
    }

    /// Run the full cascade and post-processing. Access counters for the
    /// returned fragments are bumped best-effort at the end.
    pub fn search(
        &self,
        conn: &Connection,
        index: &KeywordIndex,
        embedder: &dyn EmbeddingProvider,
        request: &SearchRequest,
        scope: &AgentScope,
    ) -> Result<RecallResult> {
        let mut candidates = Candidates::new();

        self.stage_l1(conn, index, request, scope, &mut candidates)?;

        // L2 runs when L1 was thin or asked for predicates L1 cannot express
        if candidates.len() < self.search.min_l1_results
            || request.min_importance.is_some()
        {
            self.stage_l2(conn, request, scope, &mut candidates)?;
        }

        if candidates.len() < self.search.min_l1_results {
            self.stage_l3(conn, embedder, request, scope, &mut candidates)?;
        }

        let (mut merged, trace) = candidates.into_vec();

        // Superseded sources are invisible regardless of which tier found them
        let superseded = store::superseded_source_ids(conn)?;
        merged.retain(|(f, _)| !superseded.contains(&f.id));

        // The importance floor applies to every tier's results
        if let Some(min) = request.min_importance {
            merged.retain(|(f, _)| f.importance >= min);
        }

        // Rank, trim, expand, re-rank, re-trim
        let composite = store::fragment_count(conn)? >= self.ranking.activation_threshold;
        let mut ranked = self.rank(merged, composite);
        let mut selected = self.trim_to_budget(ranked, request.token_budget);

        if request.include_links && !selected.is_empty() {
            let ids: Vec<String> = selected.iter().map(|(f, _)| f.id.clone()).collect();
            let linked = store::get_linked_fragments(
                conn,
                &ids,
                &request.link_relations,
                self.search.linked_fragment_limit,
                scope,
            )?;
            if !linked.is_empty() {
                for (fragment, _) in linked {
                    if !selected.iter().any(|(f, _)| f.id == fragment.id) {
                        selected.push((fragment, None));
                    }
                }
                ranked = self.rank(selected, composite);
                selected = self.trim_to_budget(ranked, request.token_budget);
            }
        }

        // Threshold filter: fragments without a similarity score survive
        if let Some(threshold) = request.threshold {
            selected.retain(|(_, sim)| sim.map_or(true, |s| s >= threshold));
        }

        let now = Utc::now();
        let fragments: Vec<ScoredFragment> = selected
            .into_iter()
            .map(|(fragment, similarity)| ScoredFragment {
                stale: self.stale_info(&fragment, now),
                similarity,
                fragment,
            })
            .collect();

        let total_tokens = fragments.iter().map(|f| f.fragment.estimated_tokens).sum();
        let returned_ids: Vec<String> = fragments.iter().map(|f| f.fragment.id.clone()).collect();

        // Best-effort post-retrieval bookkeeping
        if let Err(e) = store::increment_access(conn, &returned_ids) {
            tracing::warn!(error = %e, "access-count bump failed");
        }
        let plain: Vec<Fragment> = fragments.iter().map(|f| f.fragment.clone()).collect();
        index.hot_put(&plain);

        let count = fragments.len();
        Ok(RecallResult {
            fragments,
            total_tokens,
            search_path: trace.join(" → "),
            count,
        })
    }

    // ── Stages ───────────────────────────────────────────────────────────────

    /// L1: intersect the in-process candidate sets for the supplied filters;
    /// with no filters at all, fall back to the recency list.
    fn stage_l1(
        &self,
        conn: &Connection,
        index: &KeywordIndex,
        request: &SearchRequest,
        scope: &AgentScope,
        candidates: &mut Candidates,
    ) -> Result<()> {
        let ids: Vec<String> = if request.is_unfiltered() {
            index.recent_ids(20)
        } else {
            let mut sets: Vec<Vec<String>> = Vec::new();
            if !request.keywords.is_empty() {
                sets.push(index.search_by_keywords(&request.keywords, self.search.min_l1_results));
            }
            if let Some(ref topic) = request.topic {
                sets.push(index.by_topic(topic));
            }
            if let Some(ft) = request.fragment_type {
                sets.push(index.by_type(ft.as_str()));
            }

            match sets.split_first() {
                None => Vec::new(),
                Some((first, rest)) => {
                    let mut ids = first.clone();
                    for set in rest {
                        ids.retain(|id| set.contains(id));
                    }
                    ids
                }
            }
        };

        if ids.is_empty() {
            candidates.trace.push("L1:0".to_string());
            return Ok(());
        }

        // Materialise: hot cache first, then the store for the rest
        let mut hot_hits = 0usize;
        let mut missing: Vec<String> = Vec::new();
        let mut l1_count = 0usize;
        for id in &ids {
            match index.hot_get(id) {
                Some(fragment) if scope.admits(&fragment.agent_id) => {
                    candidates.merge(fragment, None);
                    hot_hits += 1;
                    l1_count += 1;
                }
                Some(_) => {}
                None => missing.push(id.clone()),
            }
        }

        let fetched = store::get_by_ids(conn, &missing, scope)?;
        for id in &missing {
            if let Some(fragment) = fetched.get(id) {
                candidates.merge(fragment.clone(), None);
                l1_count += 1;
            }
        }

        candidates.trace.push(format!("L1:{l1_count}"));
        if hot_hits > 0 {
            candidates.trace.push(format!("HotCache:{hot_hits}"));
        }
        Ok(())
    }

    /// L2: durable keyword overlap with type/topic/importance predicates.
    fn stage_l2(
        &self,
        conn: &Connection,
        request: &SearchRequest,
        scope: &AgentScope,
        candidates: &mut Candidates,
    ) -> Result<()> {
        if request.keywords.is_empty() && request.topic.is_none() && request.fragment_type.is_none()
        {
            return Ok(());
        }

        // With no keywords, fall back to topic/type terms so FTS has a query
        let keywords: Vec<String> = if request.keywords.is_empty() {
            request
                .topic
                .iter()
                .cloned()
                .chain(request.fragment_type.map(|t| t.as_str().to_string()))
                .collect()
        } else {
            request.keywords.clone()
        };

        let results = store::search_by_keywords(
            conn,
            &keywords,
            &KeywordFilter {
                fragment_type: request.fragment_type,
                topic: request.topic.clone(),
                min_importance: request.min_importance,
                limit: self.search.l2_limit,
            },
            scope,
        )?;

        let mut added = 0usize;
        for fragment in results {
            if !candidates.by_id.contains_key(&fragment.id) {
                added += 1;
            }
            candidates.merge(fragment, None);
        }
        candidates.trace.push(format!("L2:{added}"));
        Ok(())
    }

    /// L3: embed the query text and cosine-search the vector index.
    fn stage_l3(
        &self,
        conn: &Connection,
        embedder: &dyn EmbeddingProvider,
        request: &SearchRequest,
        scope: &AgentScope,
        candidates: &mut Candidates,
    ) -> Result<()> {
        let Some(ref text) = request.text else {
            return Ok(());
        };
        if !embedder.enabled() {
            return Ok(());
        }

        let prepared = prepare_text(text);
        let query = match embedder.embed(&prepared) {
            Ok(vec) => vec,
            Err(e) => {
                tracing::warn!(error = %e, "query embedding failed — skipping L3");
                return Ok(());
            }
        };

        let results = store::search_by_semantic(
            conn,
            &query,
            self.search.l3_limit,
            self.search.l3_min_similarity,
            scope,
        )?;

        let mut added = 0usize;
        for (fragment, similarity) in results {
            if !candidates.by_id.contains_key(&fragment.id) {
                added += 1;
            }
            candidates.merge(fragment, Some(similarity));
        }
        candidates.trace.push(format!("L3:{added}"));
        Ok(())
    }

    // ── Post-processing ──────────────────────────────────────────────────────

    /// Rank by the composite score when the store is above the activation
    /// threshold, otherwise by plain importance.
    fn rank(
        &self,
        mut fragments: Vec<(Fragment, Option<f64>)>,
        composite: bool,
    ) -> Vec<(Fragment, Option<f64>)> {
        if composite {
            let now = Utc::now();
            fragments.sort_by(|a, b| {
                let score_a = self.composite_score(&a.0, now);
                let score_b = self.composite_score(&b.0, now);
                score_b
                    .partial_cmp(&score_a)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        } else {
            fragments.sort_by(|a, b| {
                b.0.importance
                    .partial_cmp(&a.0.importance)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        fragments
    }

    fn composite_score(&self, fragment: &Fragment, now: chrono::DateTime<Utc>) -> f64 {
        self.ranking.importance_weight * fragment.importance
            + self.ranking.recency_weight * self.recency(fragment, now)
    }

    /// `max(0, 1 − age_days / window)`.
    fn recency(&self, fragment: &Fragment, now: chrono::DateTime<Utc>) -> f64 {
        let Ok(created) = chrono::DateTime::parse_from_rfc3339(&fragment.created_at) else {
            return 0.0;
        };
        let age_days = (now - created.with_timezone(&Utc)).num_seconds() as f64 / 86_400.0;
        (1.0 - age_days / self.ranking.recency_window_days as f64).max(0.0)
    }

    /// Keep fragments in rank order while the running token total stays
    /// within the budget; anything that would cross it is dropped.
    fn trim_to_budget(
        &self,
        fragments: Vec<(Fragment, Option<f64>)>,
        budget: usize,
    ) -> Vec<(Fragment, Option<f64>)> {
        let mut used = 0usize;
        let mut kept = Vec::new();
        for (fragment, similarity) in fragments {
            if used + fragment.estimated_tokens > budget {
                continue;
            }
            used += fragment.estimated_tokens;
            kept.push((fragment, similarity));
        }
        kept
    }

    /// Attach stale metadata when `verified_at` is past the per-type window.
    fn stale_info(&self, fragment: &Fragment, now: chrono::DateTime<Utc>) -> Option<StaleInfo> {
        let Ok(verified) = chrono::DateTime::parse_from_rfc3339(&fragment.verified_at) else {
            return None;
        };
        let days = (now - verified.with_timezone(&Utc)).num_days();
        let limit = match fragment.fragment_type {
            FragmentType::Procedure => self.stale.procedure_days,
            FragmentType::Fact => self.stale.fact_days,
            FragmentType::Decision => self.stale.decision_days,
            _ => self.stale.default_days,
        };
        if days <= limit {
            return None;
        }
        Some(StaleInfo {
            stale: true,
            warning: format!(
                "{} fragment unverified for {days} days (limit {limit})",
                fragment.fragment_type
            ),
            days_since_verification: days,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::NoEmbeddingProvider;
    use crate::memory::factory::{CreateParams, FragmentFactory};
    use crate::memory::tokens::TokenCounter;
    use std::sync::Arc;

    fn search_engine() -> FragmentSearch {
        FragmentSearch::new(
            SearchConfig::default(),
            RankingConfig::default(),
            StaleConfig::default(),
        )
    }

    fn test_env() -> (Connection, KeywordIndex) {
        let conn = crate::db::open_memory_database().unwrap();
        let index = KeywordIndex::new(500, 0.8);
        (conn, index)
    }

    fn seed(
        conn: &mut Connection,
        index: &KeywordIndex,
        content: &str,
        topic: &str,
        ft: FragmentType,
    ) -> String {
        let factory = FragmentFactory::new(Arc::new(TokenCounter::approximate()));
        let fragment = factory.create(
            CreateParams {
                content: content.to_string(),
                topic: topic.to_string(),
                fragment_type: ft,
                keywords: None,
                importance: None,
                source: None,
                agent_id: "default".to_string(),
                is_anchor: false,
            },
            Utc::now(),
        );
        let outcome = store::insert(conn, &fragment, &NoEmbeddingProvider).unwrap();
        index.index(&fragment, None);
        outcome.id
    }

    fn request(keywords: &[&str]) -> SearchRequest {
        SearchRequest {
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            topic: None,
            fragment_type: None,
            text: None,
            min_importance: None,
            token_budget: 1000,
            include_links: true,
            link_relations: default_link_relations(),
            threshold: None,
        }
    }

    fn scope() -> AgentScope {
        AgentScope::agent("default")
    }

    #[test]
    fn l1_keyword_hit_leads_the_trace() {
        let (mut conn, index) = test_env();
        let id = seed(&mut conn, &index, "Redis NOAUTH indicates missing REDIS_PASSWORD", "redis", FragmentType::Error);
        seed(&mut conn, &index, "pgvector HNSW uses m=16 ef_construction=64", "pgvector", FragmentType::Fact);

        let result = search_engine()
            .search(&conn, &index, &NoEmbeddingProvider, &request(&["redis", "noauth"]), &scope())
            .unwrap();

        assert_eq!(result.count, 1);
        assert_eq!(result.fragments[0].fragment.id, id);
        assert!(result.search_path.starts_with("L1:"), "path was {}", result.search_path);
    }

    #[test]
    fn unfiltered_request_falls_back_to_recency() {
        let (mut conn, index) = test_env();
        seed(&mut conn, &index, "first note", "a", FragmentType::Fact);
        let newest = seed(&mut conn, &index, "second note", "b", FragmentType::Fact);

        let result = search_engine()
            .search(&conn, &index, &NoEmbeddingProvider, &request(&[]), &scope())
            .unwrap();

        assert_eq!(result.count, 2);
        assert!(result.fragments.iter().any(|f| f.fragment.id == newest));
    }

    #[test]
    fn l2_backfills_when_index_is_cold() {
        let (mut conn, index) = test_env();
        // Insert into the store only — simulates a restarted process
        let factory = FragmentFactory::new(Arc::new(TokenCounter::approximate()));
        let fragment = factory.create(
            CreateParams {
                content: "Kafka consumer lag spikes under rebalance".to_string(),
                topic: "kafka".to_string(),
                fragment_type: FragmentType::Error,
                keywords: None,
                importance: None,
                source: None,
                agent_id: "default".to_string(),
                is_anchor: false,
            },
            Utc::now(),
        );
        store::insert(&mut conn, &fragment, &NoEmbeddingProvider).unwrap();

        let result = search_engine()
            .search(&conn, &index, &NoEmbeddingProvider, &request(&["kafka", "rebalance"]), &scope())
            .unwrap();

        assert_eq!(result.count, 1);
        assert!(result.search_path.contains("L2:1"), "path was {}", result.search_path);
    }

    #[test]
    fn min_importance_forces_l2_predicates() {
        let (mut conn, index) = test_env();
        seed(&mut conn, &index, "redis low importance fact", "redis", FragmentType::Fact); // 0.5
        let err = seed(&mut conn, &index, "redis high importance error", "redis", FragmentType::Error); // 0.9

        let mut req = request(&["redis"]);
        req.min_importance = Some(0.8);
        let result = search_engine()
            .search(&conn, &index, &NoEmbeddingProvider, &req, &scope())
            .unwrap();

        // L1 cannot express min_importance, so L2 must have run
        assert!(result.search_path.contains("L2:"));
        assert!(result.fragments.iter().any(|f| f.fragment.id == err));
    }

    #[test]
    fn token_budget_never_exceeded() {
        let (mut conn, index) = test_env();
        for i in 0..8 {
            seed(
                &mut conn,
                &index,
                &format!("budget filler fragment number {i} with a reasonable amount of content to occupy tokens"),
                "budget",
                FragmentType::Fact,
            );
        }

        let mut req = request(&[]);
        req.topic = Some("budget".to_string());
        req.token_budget = 60;
        let result = search_engine()
            .search(&conn, &index, &NoEmbeddingProvider, &req, &scope())
            .unwrap();

        assert!(result.count < 8);
        assert!(result.total_tokens <= 60);
    }

    #[test]
    fn link_expansion_pulls_one_hop_neighbors() {
        let (mut conn, index) = test_env();
        let error = seed(&mut conn, &index, "deploy failed with missing env var", "deploy", FragmentType::Error);
        let fix = seed(&mut conn, &index, "the remediation runbook for env vars", "deploy", FragmentType::Procedure);
        store::create_link(&mut conn, &error, &fix, RelationType::ResolvedBy, &scope()).unwrap();

        let result = search_engine()
            .search(&conn, &index, &NoEmbeddingProvider, &request(&["deploy", "env"]), &scope())
            .unwrap();

        let ids: Vec<&str> = result.fragments.iter().map(|f| f.fragment.id.as_str()).collect();
        assert!(ids.contains(&error.as_str()));
        assert!(ids.contains(&fix.as_str()));
    }

    #[test]
    fn link_expansion_respects_relation_filter() {
        let (mut conn, index) = test_env();
        let a = seed(&mut conn, &index, "primary fragment for filter", "links", FragmentType::Fact);
        let contradicting = seed(&mut conn, &index, "a contradicting fragment", "other", FragmentType::Fact);
        store::create_link(&mut conn, &a, &contradicting, RelationType::Contradicts, &scope()).unwrap();

        let result = search_engine()
            .search(&conn, &index, &NoEmbeddingProvider, &request(&["primary", "filter"]), &scope())
            .unwrap();

        // contradicts is not in the default whitelist
        let ids: Vec<&str> = result.fragments.iter().map(|f| f.fragment.id.as_str()).collect();
        assert!(ids.contains(&a.as_str()));
        assert!(!ids.contains(&contradicting.as_str()));
    }

    #[test]
    fn stale_annotation_uses_per_type_windows() {
        let (mut conn, index) = test_env();
        let id = seed(&mut conn, &index, "an aging procedure", "ops", FragmentType::Procedure);
        let old = (Utc::now() - chrono::Duration::days(45)).to_rfc3339();
        conn.execute(
            "UPDATE fragments SET verified_at = ?1 WHERE id = ?2",
            rusqlite::params![old, id],
        )
        .unwrap();
        let mut req = request(&[]);
        req.topic = Some("ops".to_string());
        let result = search_engine()
            .search(&conn, &index, &NoEmbeddingProvider, &req, &scope())
            .unwrap();

        // Procedure window is 30 days; 45 days exceeds it
        let f = result
            .fragments
            .iter()
            .find(|f| f.fragment.id == id)
            .expect("fragment returned");
        let stale = f.stale.as_ref().expect("stale annotation expected");
        assert!(stale.stale);
        assert!(stale.days_since_verification >= 44);
    }

    #[test]
    fn threshold_preserves_scoreless_fragments() {
        let factory = FragmentFactory::new(Arc::new(TokenCounter::approximate()));
        let fragment = factory.create(
            CreateParams {
                content: "unscored".to_string(),
                topic: "t".to_string(),
                fragment_type: FragmentType::Fact,
                keywords: None,
                importance: None,
                source: None,
                agent_id: "default".to_string(),
                is_anchor: false,
            },
            Utc::now(),
        );

        // The retain rule applied after ranking: score-less survives
        let mut selected = vec![(fragment.clone(), None), (fragment, Some(0.2))];
        selected.retain(|(_, sim)| sim.map_or(true, |s| s >= 0.5));
        assert_eq!(selected.len(), 1);
        assert!(selected[0].1.is_none());
    }

    #[test]
    fn recall_bumps_access_counters() {
        let (mut conn, index) = test_env();
        let id = seed(&mut conn, &index, "tracked fragment content", "track", FragmentType::Fact);

        search_engine()
            .search(&conn, &index, &NoEmbeddingProvider, &request(&["tracked", "fragment"]), &scope())
            .unwrap();

        let count: u32 = conn
            .query_row(
                "SELECT access_count FROM fragments WHERE id = ?1",
                rusqlite::params![id],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn composite_ranking_activates_on_store_size() {
        let (mut conn, index) = test_env();
        let mut engine = search_engine();
        engine.ranking.activation_threshold = 2;

        // Older but slightly more important vs newer — with 0.6/0.4 the
        // fresher row can win once recency factors in; just assert ordering
        // is deterministic and nothing panics with the composite path on.
        seed(&mut conn, &index, "composite seed one", "rank", FragmentType::Fact);
        seed(&mut conn, &index, "composite seed two", "rank", FragmentType::Decision);

        let mut req = request(&[]);
        req.topic = Some("rank".to_string());
        let result = engine
            .search(&conn, &index, &NoEmbeddingProvider, &req, &scope())
            .unwrap();
        assert_eq!(result.count, 2);
        // Decision (0.8, same age) outranks fact (0.5) under either rule
        assert_eq!(result.fragments[0].fragment.fragment_type, FragmentType::Decision);
    }
}
