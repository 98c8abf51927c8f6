//! The consolidation pipeline — eleven ordered maintenance stages.
//!
//! A single entry point runs the stages sequentially and returns per-stage
//! counters. A stage failure is logged and recorded; the pipeline never
//! aborts. Contradiction detection is the three-stage hybrid: cosine
//! similarity gate → NLI classification → LLM arbitration, parking
//! high-similarity unresolvable pairs on the pending queue.
//!
//! Resolution applies the time-ordering heuristic: the chronologically newer
//! fragment supersedes the older; the older (unless anchored) has its
//! importance halved and gains a `superseded_by` edge pointing at the newer.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::PathBuf;

use super::index::{KeywordIndex, PendingContradiction};
use super::store;
use super::types::{AgentScope, Fragment, RelationType};
use crate::config::ConsolidationConfig;
use crate::db::migrations::{get_meta, set_meta};
use crate::embedding::EmbeddingProvider;
use crate::llm::LlmClient;
use crate::nli::NliClassifier;

const CONTRA_SYSTEM_PROMPT: &str = "You judge whether two memory fragments contradict each \
other. Respond with JSON: {\"contradicts\": true|false, \"reasoning\": \"<one sentence>\"}.";

const LAST_CONTRADICTION_CHECK: &str = "last_contradiction_check";
const FEEDBACK_WATERMARK: &str = "feedback_watermark";
const EPOCH: &str = "1970-01-01T00:00:00+00:00";

/// A stale fragment surfaced by the final stage.
#[derive(Debug, Clone, Serialize)]
pub struct StaleEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub fragment_type: String,
    pub topic: String,
    pub days_since_verified: i64,
}

/// Per-stage counters returned by one pipeline run.
#[derive(Debug, Default, Serialize)]
pub struct ConsolidationReport {
    pub tier_transitions: usize,
    pub decayed: usize,
    pub expired: usize,
    pub duplicates_merged: usize,
    pub embeddings_backfilled: usize,
    pub utility_recomputed: usize,
    pub anchors_promoted: usize,
    pub contradictions_found: usize,
    pub contradictions_queued: usize,
    pub pending_resolved: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback_report: Option<String>,
    pub keyword_memberships_pruned: usize,
    pub stale_fragments: Vec<StaleEntry>,
    /// Stage-local failures; the pipeline continued past each.
    pub stage_errors: Vec<String>,
}

pub struct Consolidator {
    config: ConsolidationConfig,
    report_dir: PathBuf,
}

impl Consolidator {
    pub fn new(config: ConsolidationConfig, report_dir: PathBuf) -> Self {
        Self { config, report_dir }
    }

    /// Run the full pipeline. Callers serialize externally; stages tolerate
    /// overlap by operating on current state only.
    pub fn run(
        &self,
        conn: &mut Connection,
        index: &KeywordIndex,
        embedder: &dyn EmbeddingProvider,
        nli: &NliClassifier,
        llm: &LlmClient,
    ) -> ConsolidationReport {
        let mut report = ConsolidationReport::default();

        macro_rules! stage {
            ($name:literal, $body:expr) => {
                match $body {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!(stage = $name, error = %e, "consolidation stage failed");
                        report.stage_errors.push(format!("{}: {e}", $name));
                        Default::default()
                    }
                }
            };
        }

        report.tier_transitions = stage!("ttl_transitions", store::transition_tiers(conn));
        report.decayed = stage!(
            "importance_decay",
            store::decay_importance(
                conn,
                self.config.decay_factor,
                self.config.decay_inactive_days
            )
        );
        report.expired = stage!(
            "expired_deletion",
            store::delete_expired(
                conn,
                self.config.expiry_importance_floor,
                self.config.expiry_inactive_days
            )
        );
        report.duplicates_merged = stage!("dedup_merge", merge_duplicates(conn));
        report.embeddings_backfilled = stage!(
            "embedding_backfill",
            store::generate_missing_embeddings(
                conn,
                self.config.embedding_backfill_batch,
                embedder
            )
        );
        report.utility_recomputed = stage!("utility_recompute", store::recompute_utility(conn));
        report.anchors_promoted = stage!(
            "anchor_promotion",
            store::promote_anchors(
                conn,
                self.config.anchor_access_count,
                self.config.anchor_importance
            )
        );

        let (found, queued) = stage!(
            "contradiction_detection",
            self.detect_contradictions(conn, index, nli, llm)
        );
        report.contradictions_found = found;
        report.contradictions_queued = queued;

        report.pending_resolved = stage!(
            "pending_drain",
            self.drain_pending(conn, index, nli, llm)
        );

        report.feedback_report = stage!("feedback_report", self.emit_feedback_report(conn));

        report.keyword_memberships_pruned =
            index.prune_keyword_sets(self.config.max_keyword_set_size);
        report.stale_fragments = stage!(
            "stale_gather",
            gather_stale(conn, self.config.stale_report_limit)
        );
        stage!("mirror_reconcile", store::prune_dangling_mirrors(conn));

        tracing::info!(
            transitions = report.tier_transitions,
            decayed = report.decayed,
            expired = report.expired,
            merged = report.duplicates_merged,
            contradictions = report.contradictions_found,
            errors = report.stage_errors.len(),
            "consolidation pipeline finished"
        );
        report
    }

    // ── Stage 8: hybrid contradiction detection ──────────────────────────────

    /// Returns (resolved pairs, queued pairs).
    fn detect_contradictions(
        &self,
        conn: &mut Connection,
        index: &KeywordIndex,
        nli: &NliClassifier,
        llm: &LlmClient,
    ) -> Result<(usize, usize)> {
        let since = get_meta(conn, LAST_CONTRADICTION_CHECK)?
            .unwrap_or_else(|| EPOCH.to_string());
        let now = Utc::now().to_rfc3339();

        let new_ids: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM fragments WHERE created_at > ?1 ORDER BY created_at",
            )?;
            let rows = stmt
                .query_map(params![since], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut found = 0usize;
        let mut queued = 0usize;
        let mut handled: std::collections::HashSet<(String, String)> =
            std::collections::HashSet::new();

        for id in &new_ids {
            let Some(fragment) = store::get_by_id(conn, id, &AgentScope::Maintenance)? else {
                continue;
            };
            let Some(embedding) = store::get_embedding(conn, id)? else {
                continue; // stage gate is cosine similarity — no vector, no pair
            };

            let peers = store::search_by_semantic(
                conn,
                &embedding,
                10,
                self.config.contradiction_similarity,
                &AgentScope::Maintenance,
            )?;

            for (peer, similarity) in peers {
                if peer.id == fragment.id
                    || peer.topic != fragment.topic
                    || !AgentScope::agent(fragment.agent_id.clone()).admits(&peer.agent_id)
                {
                    continue;
                }
                let pair_key = ordered_pair(&fragment.id, &peer.id);
                if !handled.insert(pair_key) {
                    continue;
                }

                match self.judge_pair(conn, index, nli, llm, &fragment, &peer, similarity)? {
                    PairOutcome::Resolved => found += 1,
                    PairOutcome::Queued => queued += 1,
                    PairOutcome::Clean => {}
                }
            }
        }

        set_meta(conn, LAST_CONTRADICTION_CHECK, &now)?;
        Ok((found, queued))
    }

    /// NLI → LLM → pending-queue decision for one candidate pair.
    fn judge_pair(
        &self,
        conn: &mut Connection,
        index: &KeywordIndex,
        nli: &NliClassifier,
        llm: &LlmClient,
        a: &Fragment,
        b: &Fragment,
        similarity: f64,
    ) -> Result<PairOutcome> {
        if let Some(verdict) = nli.detect_contradiction(&a.content, &b.content) {
            if verdict.contradicts && !verdict.needs_escalation {
                resolve_contradiction(conn, a, b)?;
                return Ok(PairOutcome::Resolved);
            }
            if !verdict.contradicts && !verdict.needs_escalation {
                return Ok(PairOutcome::Clean);
            }
            // Ambiguous — fall through to the LLM
        }

        if llm.available() {
            let prompt = format!(
                "Fragment A: {}\nFragment B: {}\n\nDo these contradict each other?",
                a.content, b.content
            );
            match llm.complete_json(CONTRA_SYSTEM_PROMPT, &prompt) {
                Ok(verdict) => {
                    if verdict["contradicts"].as_bool().unwrap_or(false) {
                        resolve_contradiction(conn, a, b)?;
                        return Ok(PairOutcome::Resolved);
                    }
                    return Ok(PairOutcome::Clean);
                }
                Err(e) => {
                    tracing::debug!(error = %e, "contradiction arbitration failed");
                }
            }
        }

        if similarity > self.config.pending_similarity {
            index.enqueue_pending_contradiction(PendingContradiction {
                first_id: a.id.clone(),
                second_id: b.id.clone(),
                similarity,
            });
            return Ok(PairOutcome::Queued);
        }
        Ok(PairOutcome::Clean)
    }

    // ── Stage 9: pending queue drain ─────────────────────────────────────────

    fn drain_pending(
        &self,
        conn: &mut Connection,
        index: &KeywordIndex,
        nli: &NliClassifier,
        llm: &LlmClient,
    ) -> Result<usize> {
        let mut resolved = 0usize;
        for _ in 0..self.config.pending_drain_batch {
            let Some(pair) = index.dequeue_pending_contradiction() else {
                break;
            };
            let scope = AgentScope::Maintenance;
            let (Some(a), Some(b)) = (
                store::get_by_id(conn, &pair.first_id, &scope)?,
                store::get_by_id(conn, &pair.second_id, &scope)?,
            ) else {
                continue; // an endpoint is gone — the conflict died with it
            };

            match self.judge_pair(conn, index, nli, llm, &a, &b, pair.similarity)? {
                PairOutcome::Resolved => resolved += 1,
                PairOutcome::Queued | PairOutcome::Clean => {}
            }
        }
        Ok(resolved)
    }

    // ── Stage 10: feedback report ────────────────────────────────────────────

    fn emit_feedback_report(&self, conn: &Connection) -> Result<Option<String>> {
        let watermark =
            get_meta(conn, FEEDBACK_WATERMARK)?.unwrap_or_else(|| EPOCH.to_string());
        let tool_rows = store::tool_feedback_since(conn, &watermark)?;
        let task_rows = store::task_feedback_since(conn, &watermark)?;
        if tool_rows.is_empty() && task_rows.is_empty() {
            return Ok(None);
        }

        let now = Utc::now();
        let mut doc = format!(
            "# Feedback report — {}\n\nSince: {}\n\n## Tool feedback ({} entries)\n\n",
            now.format("%Y-%m-%d"),
            watermark,
            tool_rows.len()
        );
        let mut by_tool: std::collections::BTreeMap<String, (u32, u32, u32)> =
            std::collections::BTreeMap::new();
        for row in &tool_rows {
            let entry = by_tool.entry(row.tool_name.clone()).or_insert((0, 0, 0));
            entry.0 += 1;
            if row.relevant {
                entry.1 += 1;
            }
            if row.sufficient {
                entry.2 += 1;
            }
        }
        doc.push_str("| tool | entries | relevant | sufficient |\n|---|---|---|---|\n");
        for (tool, (total, relevant, sufficient)) in &by_tool {
            doc.push_str(&format!(
                "| {tool} | {total} | {relevant} | {sufficient} |\n"
            ));
        }
        let suggestions: Vec<&str> = tool_rows
            .iter()
            .filter_map(|r| r.suggestion.as_deref())
            .collect();
        if !suggestions.is_empty() {
            doc.push_str("\n### Suggestions\n\n");
            for s in suggestions {
                doc.push_str(&format!("- {s}\n"));
            }
        }

        doc.push_str(&format!(
            "\n## Task feedback ({} entries)\n\n",
            task_rows.len()
        ));
        let successes = task_rows.iter().filter(|t| t.overall_success).count();
        doc.push_str(&format!(
            "- successful tasks: {successes}/{}\n",
            task_rows.len()
        ));
        for row in &task_rows {
            for highlight in &row.tool_highlights {
                doc.push_str(&format!("- highlight: {highlight}\n"));
            }
            for pain in &row.tool_pain_points {
                doc.push_str(&format!("- pain point: {pain}\n"));
            }
        }

        std::fs::create_dir_all(&self.report_dir).with_context(|| {
            format!("failed to create report dir {}", self.report_dir.display())
        })?;
        let path = self
            .report_dir
            .join(format!("feedback-{}.md", now.format("%Y-%m-%d")));
        std::fs::write(&path, doc)
            .with_context(|| format!("failed to write report {}", path.display()))?;

        set_meta(conn, FEEDBACK_WATERMARK, &now.to_rfc3339())?;
        Ok(Some(path.to_string_lossy().into_owned()))
    }
}

enum PairOutcome {
    Resolved,
    Queued,
    Clean,
}

fn ordered_pair(a: &str, b: &str) -> (String, String) {
    if a < b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Record the confirmed contradiction and apply the time-ordering heuristic:
/// the chronologically newer fragment supersedes the older one.
pub fn resolve_contradiction(conn: &mut Connection, a: &Fragment, b: &Fragment) -> Result<()> {
    let (older, newer) = if a.created_at <= b.created_at {
        (a, b)
    } else {
        (b, a)
    };
    let scope = AgentScope::Maintenance;

    store::create_link(conn, &older.id, &newer.id, RelationType::Contradicts, &scope)?;
    store::create_link(conn, &older.id, &newer.id, RelationType::SupersededBy, &scope)?;

    if !older.is_anchor {
        conn.execute(
            "UPDATE fragments SET importance = importance / 2.0 WHERE id = ?1",
            params![older.id],
        )?;
    }
    tracing::info!(
        older = %older.id,
        newer = %newer.id,
        "contradiction resolved — newer fragment supersedes"
    );
    Ok(())
}

// ── Stage 4: dedup merge ─────────────────────────────────────────────────────

/// Merge rows sharing a content hash within the same agent scope. The
/// earliest-created row survives; edges and `linked_to` references are
/// rewritten to the survivor, and the losers' access counts accrue to it.
fn merge_duplicates(conn: &mut Connection) -> Result<usize> {
    let groups: Vec<(String, String)> = {
        let mut stmt = conn.prepare(
            "SELECT agent_id, content_hash FROM fragments \
             GROUP BY agent_id, content_hash HAVING COUNT(*) > 1",
        )?;
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?
    };

    let mut merged = 0usize;
    for (agent_id, hash) in groups {
        let members: Vec<(String, u32)> = {
            let mut stmt = conn.prepare(
                "SELECT id, access_count FROM fragments \
                 WHERE agent_id = ?1 AND content_hash = ?2 ORDER BY created_at ASC, id ASC",
            )?;
            stmt.query_map(params![agent_id, hash], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?
        };
        let Some(((survivor_id, survivor_access), losers)) = members.split_first() else {
            continue;
        };

        let mut total_access = *survivor_access;
        for (loser_id, loser_access) in losers {
            total_access += loser_access;
            rewrite_references(conn, loser_id, survivor_id)?;

            let tx = conn.transaction()?;
            tx.execute("DELETE FROM fragments_fts WHERE id = ?1", params![loser_id])?;
            tx.execute("DELETE FROM fragments_vec WHERE id = ?1", params![loser_id])?;
            tx.execute("DELETE FROM fragments WHERE id = ?1", params![loser_id])?;
            tx.commit()?;
            merged += 1;
        }

        conn.execute(
            "UPDATE fragments SET access_count = ?1 WHERE id = ?2",
            params![total_access, survivor_id],
        )?;
    }
    Ok(merged)
}

/// Point every edge and `linked_to` mention of `loser` at `survivor`.
fn rewrite_references(conn: &Connection, loser: &str, survivor: &str) -> Result<()> {
    let edges: Vec<(String, String, String)> = {
        let mut stmt = conn.prepare(
            "SELECT from_id, to_id, relation_type FROM fragment_links \
             WHERE from_id = ?1 OR to_id = ?1",
        )?;
        stmt.query_map(params![loser], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?
    };

    for (from_id, to_id, relation) in edges {
        let new_from = if from_id == loser { survivor } else { &from_id };
        let new_to = if to_id == loser { survivor } else { &to_id };
        if new_from != new_to {
            conn.execute(
                "INSERT OR IGNORE INTO fragment_links (from_id, to_id, relation_type, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![new_from, new_to, relation, Utc::now().to_rfc3339()],
            )?;
        }
    }
    // Loser edges cascade when the loser row is deleted

    let mentions: Vec<(String, String)> = {
        let mut stmt = conn.prepare(
            "SELECT id, linked_to FROM fragments WHERE linked_to LIKE '%' || ?1 || '%'",
        )?;
        stmt.query_map(params![loser], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?
    };
    for (row_id, linked_json) in mentions {
        let linked: Vec<String> = serde_json::from_str(&linked_json).unwrap_or_default();
        let mut rewritten: Vec<String> = Vec::with_capacity(linked.len());
        for id in linked {
            let target = if id == loser {
                survivor.to_string()
            } else {
                id
            };
            if target != row_id && !rewritten.contains(&target) {
                rewritten.push(target);
            }
        }
        conn.execute(
            "UPDATE fragments SET linked_to = ?1 WHERE id = ?2",
            params![serde_json::to_string(&rewritten)?, row_id],
        )?;
    }
    Ok(())
}

// ── Stage 11: stale gather ───────────────────────────────────────────────────

fn gather_stale(conn: &Connection, limit: usize) -> Result<Vec<StaleEntry>> {
    let now = Utc::now();
    let mut stmt = conn.prepare(
        "SELECT id, type, topic, verified_at FROM fragments ORDER BY verified_at ASC LIMIT ?1",
    )?;
    let rows: Vec<(String, String, String, String)> = stmt
        .query_map(params![limit as i64], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows
        .into_iter()
        .filter_map(|(id, fragment_type, topic, verified_at)| {
            let verified = chrono::DateTime::parse_from_rfc3339(&verified_at).ok()?;
            Some(StaleEntry {
                id,
                fragment_type,
                topic,
                days_since_verified: (now - verified.with_timezone(&Utc)).num_days(),
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::NoEmbeddingProvider;
    use crate::memory::factory::{CreateParams, FragmentFactory};
    use crate::memory::tokens::TokenCounter;
    use crate::memory::types::FragmentType;
    use std::sync::Arc;

    fn consolidator(dir: &std::path::Path) -> Consolidator {
        Consolidator::new(ConsolidationConfig::default(), dir.to_path_buf())
    }

    fn seed(
        conn: &mut Connection,
        content: &str,
        topic: &str,
        ft: FragmentType,
        importance: f64,
    ) -> String {
        let factory = FragmentFactory::new(Arc::new(TokenCounter::approximate()));
        let mut fragment = factory.create(
            CreateParams {
                content: content.to_string(),
                topic: topic.to_string(),
                fragment_type: ft,
                keywords: None,
                importance: Some(importance),
                source: None,
                agent_id: "default".to_string(),
                is_anchor: false,
            },
            Utc::now(),
        );
        fragment.ttl_tier = crate::memory::factory::infer_tier(ft, importance);
        store::insert(conn, &fragment, &NoEmbeddingProvider).unwrap().id
    }

    /// Insert a raw duplicate row, bypassing the insert gate, to simulate
    /// drift the dedup stage reconciles.
    fn seed_raw_duplicate(conn: &Connection, of_id: &str, new_id: &str, access: u32) {
        let (content, topic, hash, created): (String, String, String, String) = conn
            .query_row(
                "SELECT content, topic, content_hash, created_at FROM fragments WHERE id = ?1",
                params![of_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .unwrap();
        let later = (chrono::DateTime::parse_from_rfc3339(&created).unwrap()
            + chrono::Duration::seconds(5))
        .to_rfc3339();
        conn.execute(
            "INSERT INTO fragments (id, content, topic, type, content_hash, agent_id, \
             access_count, created_at, verified_at) \
             VALUES (?1, ?2, ?3, 'fact', ?4, 'default', ?5, ?6, ?6)",
            params![new_id, content, topic, hash, access, later],
        )
        .unwrap();
    }

    fn run_pipeline(conn: &mut Connection) -> ConsolidationReport {
        let dir = tempfile::tempdir().unwrap();
        let index = KeywordIndex::new(500, 0.8);
        consolidator(dir.path()).run(
            conn,
            &index,
            &NoEmbeddingProvider,
            &NliClassifier::disabled(),
            &LlmClient::none(),
        )
    }

    #[test]
    fn pipeline_runs_all_stages_on_empty_db() {
        let mut conn = crate::db::open_memory_database().unwrap();
        let report = run_pipeline(&mut conn);
        assert!(report.stage_errors.is_empty(), "errors: {:?}", report.stage_errors);
        assert_eq!(report.expired, 0);
        assert_eq!(report.duplicates_merged, 0);
        assert!(report.feedback_report.is_none());
    }

    #[test]
    fn dedup_merge_keeps_earliest_and_sums_access() {
        let mut conn = crate::db::open_memory_database().unwrap();
        let survivor = seed(&mut conn, "duplicated wisdom", "t", FragmentType::Fact, 0.5);
        conn.execute(
            "UPDATE fragments SET access_count = 3 WHERE id = ?1",
            params![survivor],
        )
        .unwrap();
        seed_raw_duplicate(&conn, &survivor, "frag-00000000000000d1", 4);
        seed_raw_duplicate(&conn, &survivor, "frag-00000000000000d2", 2);

        let report = run_pipeline(&mut conn);
        assert_eq!(report.duplicates_merged, 2);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM fragments", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let access: u32 = conn
            .query_row(
                "SELECT access_count FROM fragments WHERE id = ?1",
                params![survivor],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(access, 9); // 3 + 4 + 2
    }

    #[test]
    fn dedup_merge_rewrites_edges_to_survivor() {
        let mut conn = crate::db::open_memory_database().unwrap();
        let survivor = seed(&mut conn, "edge target original", "t", FragmentType::Fact, 0.5);
        let other = seed(&mut conn, "a linked neighbor", "t", FragmentType::Fact, 0.5);
        let dup = "frag-00000000000000d1";
        seed_raw_duplicate(&conn, &survivor, dup, 0);
        // Edge from the duplicate to the neighbor
        conn.execute(
            "INSERT INTO fragment_links (from_id, to_id, relation_type, created_at) \
             VALUES (?1, ?2, 'related', ?3)",
            params![dup, other, Utc::now().to_rfc3339()],
        )
        .unwrap();

        run_pipeline(&mut conn);

        let (from, to): (String, String) = conn
            .query_row(
                "SELECT from_id, to_id FROM fragment_links WHERE relation_type = 'related'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(from, survivor);
        assert_eq!(to, other);
    }

    #[test]
    fn anchors_survive_every_destructive_stage() {
        let mut conn = crate::db::open_memory_database().unwrap();
        let id = seed(&mut conn, "anchored truth", "t", FragmentType::Fact, 0.05);
        let old = (Utc::now() - chrono::Duration::days(200)).to_rfc3339();
        conn.execute(
            "UPDATE fragments SET is_anchor = 1, created_at = ?1, ttl_tier = 'cold' WHERE id = ?2",
            params![old, id],
        )
        .unwrap();

        for _ in 0..3 {
            run_pipeline(&mut conn);
        }

        let (importance, tier, anchor): (f64, String, i64) = conn
            .query_row(
                "SELECT importance, ttl_tier, is_anchor FROM fragments WHERE id = ?1",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert!((importance - 0.05).abs() < 1e-9, "anchor importance changed");
        assert_eq!(tier, "cold");
        assert_eq!(anchor, 1);
    }

    #[test]
    fn contradiction_resolution_supersedes_older() {
        let mut conn = crate::db::open_memory_database().unwrap();
        let older_id = seed(&mut conn, "Max connection pool size is 10.", "db", FragmentType::Decision, 0.8);
        // Make the second row clearly newer
        std::thread::sleep(std::time::Duration::from_millis(10));
        let newer_id = seed(&mut conn, "Max connection pool size is 20.", "db", FragmentType::Decision, 0.8);

        let scope = AgentScope::Maintenance;
        let older = store::get_by_id(&conn, &older_id, &scope).unwrap().unwrap();
        let newer = store::get_by_id(&conn, &newer_id, &scope).unwrap().unwrap();
        resolve_contradiction(&mut conn, &newer, &older).unwrap();

        // Edges run older → newer regardless of argument order
        let links = store::get_links_from(&conn, &older_id).unwrap();
        assert!(links.contains(&(newer_id.clone(), RelationType::Contradicts)));
        assert!(links.contains(&(newer_id.clone(), RelationType::SupersededBy)));

        let older_row = store::get_by_id(&conn, &older_id, &scope).unwrap().unwrap();
        let newer_row = store::get_by_id(&conn, &newer_id, &scope).unwrap().unwrap();
        assert!((older_row.importance - 0.4).abs() < 1e-9);
        assert!((newer_row.importance - 0.8).abs() < 1e-9);
    }

    #[test]
    fn anchored_older_fragment_keeps_importance_on_resolution() {
        let mut conn = crate::db::open_memory_database().unwrap();
        let older_id = seed(&mut conn, "Anchored claim.", "t", FragmentType::Decision, 0.8);
        conn.execute("UPDATE fragments SET is_anchor = 1 WHERE id = ?1", params![older_id]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let newer_id = seed(&mut conn, "Replacement claim.", "t", FragmentType::Decision, 0.8);

        let scope = AgentScope::Maintenance;
        let older = store::get_by_id(&conn, &older_id, &scope).unwrap().unwrap();
        let newer = store::get_by_id(&conn, &newer_id, &scope).unwrap().unwrap();
        resolve_contradiction(&mut conn, &older, &newer).unwrap();

        let older_row = store::get_by_id(&conn, &older_id, &scope).unwrap().unwrap();
        assert!((older_row.importance - 0.8).abs() < 1e-9);
        // The edge is still recorded
        let links = store::get_links_from(&conn, &older_id).unwrap();
        assert!(links.contains(&(newer_id, RelationType::SupersededBy)));
    }

    #[test]
    fn detection_pairs_same_topic_high_similarity_rows() {
        let mut conn = crate::db::open_memory_database().unwrap();
        let a = seed(&mut conn, "Max connection pool size is 10.", "db", FragmentType::Decision, 0.8);
        std::thread::sleep(std::time::Duration::from_millis(10));
        let b = seed(&mut conn, "Max connection pool size is 20.", "db", FragmentType::Decision, 0.8);
        // Same direction vectors → cosine similarity 1.0
        let mut v = vec![0.0f32; 1536];
        v[11] = 1.0;
        store::put_embedding(&conn, &a, &v).unwrap();
        store::put_embedding(&conn, &b, &v).unwrap();

        // NLI that always reports a strong contradiction is out of reach
        // without a model file; exercise the pending-queue path instead.
        let dir = tempfile::tempdir().unwrap();
        let index = KeywordIndex::new(500, 0.8);
        let report = consolidator(dir.path()).run(
            &mut conn,
            &index,
            &NoEmbeddingProvider,
            &NliClassifier::disabled(),
            &LlmClient::none(),
        );

        // No NLI, no LLM, similarity 1.0 > 0.92 → queued for a later pass
        assert_eq!(report.contradictions_found, 0);
        assert!(report.contradictions_queued >= 1);
        assert!(index.pending_contradiction_len() >= 1);
    }

    #[test]
    fn contradiction_watermark_advances() {
        let mut conn = crate::db::open_memory_database().unwrap();
        seed(&mut conn, "watermark seed", "t", FragmentType::Fact, 0.5);
        run_pipeline(&mut conn);
        let mark = get_meta(&conn, LAST_CONTRADICTION_CHECK).unwrap();
        assert!(mark.is_some());
    }

    #[test]
    fn feedback_report_written_and_watermarked() {
        let mut conn = crate::db::open_memory_database().unwrap();
        store::insert_tool_feedback(
            &conn,
            &crate::memory::types::ToolFeedback {
                tool_name: "recall".into(),
                relevant: true,
                sufficient: true,
                suggestion: Some("expose similarity scores".into()),
                context: None,
                session_id: None,
                trigger_type: "voluntary".into(),
                created_at: Utc::now().to_rfc3339(),
            },
        )
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let index = KeywordIndex::new(500, 0.8);
        let report = consolidator(dir.path()).run(
            &mut conn,
            &index,
            &NoEmbeddingProvider,
            &NliClassifier::disabled(),
            &LlmClient::none(),
        );

        let path = report.feedback_report.expect("report path");
        let doc = std::fs::read_to_string(&path).unwrap();
        assert!(doc.contains("| recall | 1 | 1 | 1 |"));
        assert!(doc.contains("expose similarity scores"));

        // Second run with no new feedback emits nothing
        let report2 = consolidator(dir.path()).run(
            &mut conn,
            &index,
            &NoEmbeddingProvider,
            &NliClassifier::disabled(),
            &LlmClient::none(),
        );
        assert!(report2.feedback_report.is_none());
    }

    #[test]
    fn stale_gather_reports_oldest_verified() {
        let mut conn = crate::db::open_memory_database().unwrap();
        let id = seed(&mut conn, "ancient fragment", "t", FragmentType::Fact, 0.5);
        let old = (Utc::now() - chrono::Duration::days(400)).to_rfc3339();
        conn.execute(
            "UPDATE fragments SET verified_at = ?1, accessed_at = ?2 WHERE id = ?3",
            params![old, Utc::now().to_rfc3339(), id],
        )
        .unwrap();

        let report = run_pipeline(&mut conn);
        assert!(!report.stale_fragments.is_empty());
        assert_eq!(report.stale_fragments[0].id, id);
        assert!(report.stale_fragments[0].days_since_verified >= 399);
    }

    #[test]
    fn tier_transition_counts_promotions() {
        let mut conn = crate::db::open_memory_database().unwrap();
        let id = seed(&mut conn, "about to be permanent", "t", FragmentType::Fact, 0.5);
        conn.execute(
            "UPDATE fragments SET importance = 0.85, ttl_tier = 'warm' WHERE id = ?1",
            params![id],
        )
        .unwrap();

        let report = run_pipeline(&mut conn);
        assert!(report.tier_transitions >= 1);

        let tier: String = conn
            .query_row("SELECT ttl_tier FROM fragments WHERE id = ?1", params![id], |r| r.get(0))
            .unwrap();
        assert_eq!(tier, "permanent");
    }
}
