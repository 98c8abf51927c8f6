#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use mnemon::config::MnemonConfig;
use mnemon::db;
use mnemon::embedding::{l2_normalize, EmbeddingProvider, NoEmbeddingProvider};
use mnemon::llm::LlmClient;
use mnemon::memory::index::KeywordIndex;
use mnemon::memory::manager::{MemoryManager, RecallParams, RememberParams, RememberScope};
use mnemon::memory::session::SessionTracker;
use mnemon::memory::tokens::TokenCounter;
use mnemon::memory::types::FragmentType;
use mnemon::nli::NliClassifier;
use rusqlite::Connection;

/// Open a fresh in-memory database with schema and migrations applied.
pub fn test_db() -> Connection {
    db::load_sqlite_vec();
    let conn = Connection::open_in_memory().unwrap();
    conn.pragma_update(None, "foreign_keys", "ON").unwrap();
    db::schema::init_schema(&conn).unwrap();
    db::migrations::run_migrations(&conn).unwrap();
    conn
}

/// Deterministic bag-of-words embedder: each token ≥ 3 chars lights one
/// hashed dimension, so texts sharing vocabulary have high cosine similarity.
pub struct BagOfWordsEmbedder;

impl EmbeddingProvider for BagOfWordsEmbedder {
    fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let mut v = vec![0.0f32; 1536];
        for token in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
            if token.chars().count() < 3 {
                continue;
            }
            let mut h: u64 = 0xcbf29ce484222325;
            for b in token.bytes() {
                h ^= u64::from(b);
                h = h.wrapping_mul(0x100000001b3);
            }
            v[(h % 1536) as usize] += 1.0;
        }
        Ok(l2_normalize(&v))
    }

    fn dimensions(&self) -> usize {
        1536
    }
}

/// Build a manager over a fresh in-memory database without embeddings.
pub fn test_manager() -> MemoryManager {
    manager_with_embedder(Arc::new(NoEmbeddingProvider))
}

/// Build a manager with the deterministic test embedder (enables L3 and the
/// similarity-driven paths).
pub fn embedded_manager() -> MemoryManager {
    manager_with_embedder(Arc::new(BagOfWordsEmbedder))
}

/// Build a manager whose keyword index is unreachable (degradation tests).
pub fn degraded_manager() -> MemoryManager {
    build_manager(Arc::new(NoEmbeddingProvider), Arc::new(KeywordIndex::disabled()))
}

fn manager_with_embedder(embedder: Arc<dyn EmbeddingProvider>) -> MemoryManager {
    build_manager(embedder, Arc::new(KeywordIndex::new(500, 0.8)))
}

fn build_manager(
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<KeywordIndex>,
) -> MemoryManager {
    let conn = test_db();
    MemoryManager::new(
        Arc::new(Mutex::new(conn)),
        index,
        Arc::new(SessionTracker::new()),
        embedder,
        Arc::new(LlmClient::none()),
        Arc::new(NliClassifier::disabled()),
        Arc::new(TokenCounter::approximate()),
        Arc::new(MnemonConfig::default()),
        None,
    )
}

/// Shorthand remember params for a durable fragment.
pub fn remember(content: &str, topic: &str, fragment_type: FragmentType) -> RememberParams {
    RememberParams {
        content: content.to_string(),
        topic: topic.to_string(),
        fragment_type,
        keywords: None,
        importance: None,
        source: None,
        linked_to: Vec::new(),
        scope: RememberScope::Permanent,
        is_anchor: false,
        agent_id: None,
        session_id: None,
    }
}

/// Shorthand recall params for a keyword query.
pub fn recall_keywords(keywords: &[&str]) -> RecallParams {
    RecallParams {
        keywords: keywords.iter().map(|s| s.to_string()).collect(),
        topic: None,
        fragment_type: None,
        text: None,
        min_importance: None,
        token_budget: None,
        include_links: true,
        link_relations: None,
        threshold: None,
        agent_id: None,
        session_id: None,
    }
}

/// Shorthand recall params for a free-text (semantic) query.
pub fn recall_text(text: &str) -> RecallParams {
    RecallParams {
        keywords: Vec::new(),
        topic: None,
        fragment_type: None,
        text: Some(text.to_string()),
        min_importance: None,
        token_budget: None,
        include_links: true,
        link_relations: None,
        threshold: None,
        agent_id: None,
        session_id: None,
    }
}
