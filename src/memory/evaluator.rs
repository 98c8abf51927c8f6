//! Background quality evaluator.
//!
//! A single long-lived task polls the evaluation queue (5-second cadence when
//! empty), asks the LLM to score each newly stored fragment, and writes the
//! verdict back: `importance = score`, clamped to 0.3 for `downgrade` and 0.1
//! for `discard`, with the rationale appended to the keywords array. LLM
//! unavailability drops the job — there is no retry queue.
//!
//! `fact`, `procedure`, and `error` fragments are never enqueued; they carry
//! their own provenance discipline.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::index::{EvalJob, KeywordIndex};
use crate::llm::LlmClient;

const EVAL_SYSTEM_PROMPT: &str = "You judge the long-term utility of a memory fragment \
stored by an AI agent. Respond with JSON: {\"score\": <0.0-1.0>, \"rationale\": \
\"<one short sentence>\", \"action\": \"keep\"|\"downgrade\"|\"discard\"}.";

/// The background evaluator worker.
pub struct Evaluator {
    db: Arc<Mutex<Connection>>,
    index: Arc<KeywordIndex>,
    llm: Arc<LlmClient>,
    poll_interval: Duration,
}

impl Evaluator {
    pub fn new(
        db: Arc<Mutex<Connection>>,
        index: Arc<KeywordIndex>,
        llm: Arc<LlmClient>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            db,
            index,
            llm,
            poll_interval,
        }
    }

    /// Spawn the poll loop. The task finishes its current job and exits when
    /// the shutdown channel flips.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("evaluator worker started");
            loop {
                if *shutdown.borrow() {
                    break;
                }

                match self.index.dequeue_evaluation() {
                    Some(job) => {
                        let db = Arc::clone(&self.db);
                        let llm = Arc::clone(&self.llm);
                        let result = tokio::task::spawn_blocking(move || {
                            process_job(&db, &llm, &job)
                        })
                        .await;
                        match result {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => debug!(error = %e, "evaluation job dropped"),
                            Err(e) => warn!(error = %e, "evaluation task panicked"),
                        }
                    }
                    None => {
                        // Idle — sleep one cadence or wake on shutdown
                        tokio::select! {
                            _ = tokio::time::sleep(self.poll_interval) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                }
            }
            info!("evaluator worker stopped");
        })
    }
}

/// Score one fragment and write the verdict back. Errors are job-local.
fn process_job(db: &Mutex<Connection>, llm: &LlmClient, job: &EvalJob) -> Result<()> {
    if !llm.available() {
        anyhow::bail!("LLM unavailable");
    }

    let user_prompt = format!(
        "Fragment type: {}\nContent: {}\n\nScore its long-term utility.",
        job.fragment_type, job.content
    );
    let verdict = llm.complete_json(EVAL_SYSTEM_PROMPT, &user_prompt)?;

    let score = verdict["score"].as_f64().context("missing score")?;
    let rationale = verdict["rationale"].as_str().unwrap_or("").to_string();
    let action = verdict["action"].as_str().unwrap_or("keep").to_string();

    let conn = db.lock().map_err(|e| anyhow::anyhow!("db lock poisoned: {e}"))?;
    apply_verdict(&conn, &job.fragment_id, score, &rationale, &action)?;
    debug!(id = %job.fragment_id, score, action = %action, "fragment evaluated");
    Ok(())
}

/// Apply an evaluation verdict to the stored row.
pub fn apply_verdict(
    conn: &Connection,
    fragment_id: &str,
    score: f64,
    rationale: &str,
    action: &str,
) -> Result<()> {
    let importance = match action {
        "downgrade" => score.min(0.3),
        "discard" => score.min(0.1),
        _ => score,
    }
    .clamp(0.0, 1.0);

    let keywords_json: Option<String> = conn
        .query_row(
            "SELECT keywords FROM fragments WHERE id = ?1",
            params![fragment_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(keywords_json) = keywords_json else {
        anyhow::bail!("fragment vanished before evaluation: {fragment_id}");
    };

    let mut keywords: Vec<String> = serde_json::from_str(&keywords_json).unwrap_or_default();
    if !rationale.is_empty() {
        keywords.push(format!("Rationale: {rationale}"));
    }

    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE fragments SET importance = ?1, keywords = ?2, verified_at = ?3 WHERE id = ?4",
        params![
            importance,
            serde_json::to_string(&keywords)?,
            now,
            fragment_id
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::NoEmbeddingProvider;
    use crate::memory::factory::{CreateParams, FragmentFactory};
    use crate::memory::store;
    use crate::memory::tokens::TokenCounter;
    use crate::memory::types::FragmentType;

    fn seed(conn: &mut Connection) -> String {
        let factory = FragmentFactory::new(Arc::new(TokenCounter::approximate()));
        let fragment = factory.create(
            CreateParams {
                content: "We will cap the pool at 10 connections".to_string(),
                topic: "db".to_string(),
                fragment_type: FragmentType::Decision,
                keywords: None,
                importance: None,
                source: None,
                agent_id: "default".to_string(),
                is_anchor: false,
            },
            chrono::Utc::now(),
        );
        store::insert(conn, &fragment, &NoEmbeddingProvider).unwrap().id
    }

    #[test]
    fn keep_sets_importance_to_score() {
        let mut conn = crate::db::open_memory_database().unwrap();
        let id = seed(&mut conn);

        apply_verdict(&conn, &id, 0.65, "clear operational decision", "keep").unwrap();

        let (importance, keywords_json): (f64, String) = conn
            .query_row(
                "SELECT importance, keywords FROM fragments WHERE id = ?1",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert!((importance - 0.65).abs() < 1e-9);
        let keywords: Vec<String> = serde_json::from_str(&keywords_json).unwrap();
        assert!(keywords
            .iter()
            .any(|k| k == "Rationale: clear operational decision"));
    }

    #[test]
    fn downgrade_clamps_to_point_three() {
        let mut conn = crate::db::open_memory_database().unwrap();
        let id = seed(&mut conn);

        apply_verdict(&conn, &id, 0.7, "weak provenance", "downgrade").unwrap();

        let importance: f64 = conn
            .query_row("SELECT importance FROM fragments WHERE id = ?1", params![id], |r| r.get(0))
            .unwrap();
        assert!((importance - 0.3).abs() < 1e-9);
    }

    #[test]
    fn discard_clamps_to_point_one() {
        let mut conn = crate::db::open_memory_database().unwrap();
        let id = seed(&mut conn);

        apply_verdict(&conn, &id, 0.9, "ephemeral detail", "discard").unwrap();

        let importance: f64 = conn
            .query_row("SELECT importance FROM fragments WHERE id = ?1", params![id], |r| r.get(0))
            .unwrap();
        assert!((importance - 0.1).abs() < 1e-9);
    }

    #[test]
    fn missing_fragment_is_an_error_not_a_panic() {
        let conn = crate::db::open_memory_database().unwrap();
        let result = apply_verdict(&conn, "frag-feedfeedfeedfeed", 0.5, "", "keep");
        assert!(result.is_err());
    }

    #[test]
    fn unavailable_llm_drops_the_job() {
        let conn = Mutex::new(crate::db::open_memory_database().unwrap());
        let llm = LlmClient::none();
        let job = EvalJob {
            fragment_id: "frag-0000000000000000".into(),
            agent_id: "default".into(),
            fragment_type: "decision".into(),
            content: "anything".into(),
        };
        assert!(process_job(&conn, &llm, &job).is_err());
    }
}
