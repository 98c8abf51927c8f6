//! Durable fragment persistence over SQLite.
//!
//! The write path runs inside transactions: hash-dedup gate, row insert, FTS
//! sync, conditional vector insert. Reads apply the caller's [`AgentScope`]
//! as a post-filter. Updates archive the previous row into
//! `fragment_versions` before mutating, so no amendment is observable without
//! its predecessor snapshot.
//!
//! Link edges are authoritative; every `linked_to` array is a mirror
//! maintained here and reconciled by the consolidator.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::{HashMap, HashSet};

use super::factory::content_hash;
use super::tokens::TokenCounter;
use super::types::{
    AgentScope, Fragment, FragmentType, FragmentVersion, RelationType, TaskFeedback,
    ToolFeedback, TtlTier,
};
use super::{cosine_threshold_to_l2, embedding_to_bytes, l2_to_cosine};
use crate::embedding::EmbeddingProvider;

/// Result returned from an insert.
#[derive(Debug)]
pub struct InsertOutcome {
    pub id: String,
    /// `false` when the content hash matched an existing row.
    pub created: bool,
    /// Whether a vector was generated and stored.
    pub embedded: bool,
}

/// Patch applied by `update`. `None` fields are left untouched.
#[derive(Debug, Default)]
pub struct UpdatePatch {
    pub content: Option<String>,
    pub topic: Option<String>,
    pub keywords: Option<Vec<String>>,
    pub fragment_type: Option<FragmentType>,
    pub importance: Option<f64>,
    pub is_anchor: Option<bool>,
    pub source: Option<String>,
}

/// Result of an update.
#[derive(Debug)]
pub enum UpdateOutcome {
    Updated(Fragment),
    /// The new content hash collides with another row; nothing was mutated.
    Merged { existing_id: String },
}

/// Filters for the durable keyword tier.
#[derive(Debug, Default)]
pub struct KeywordFilter {
    pub fragment_type: Option<FragmentType>,
    pub topic: Option<String>,
    pub min_importance: Option<f64>,
    pub limit: usize,
}

/// One hop of an RCA walk.
#[derive(Debug, serde::Serialize)]
pub struct RcaNode {
    #[serde(flatten)]
    pub fragment: Fragment,
    pub relation: Option<String>,
    pub depth: u32,
}

// ── Insert ───────────────────────────────────────────────────────────────────

/// Insert a fragment. A content-hash collision inside the row's agent scope
/// returns the existing id, raises its importance to the greater of the two,
/// and counts as an access. Otherwise the row, its FTS body, and (when
/// importance > 0.5 and the provider is reachable) its embedding are written
/// in one transaction.
pub fn insert(
    conn: &mut Connection,
    fragment: &Fragment,
    embedder: &dyn EmbeddingProvider,
) -> Result<InsertOutcome> {
    // Embed outside the transaction — provider calls can be slow
    let embedding = maybe_embed(fragment, embedder);

    let tx = conn.transaction()?;

    if let Some((existing_id, existing_importance)) = find_by_hash(
        &tx,
        &fragment.agent_id,
        &fragment.content_hash,
    )? {
        let bumped = existing_importance.max(fragment.importance);
        tx.execute(
            "UPDATE fragments SET importance = ?1, access_count = access_count + 1, accessed_at = ?2 \
             WHERE id = ?3",
            params![bumped, Utc::now().to_rfc3339(), existing_id],
        )?;
        tx.commit()?;
        return Ok(InsertOutcome {
            id: existing_id,
            created: false,
            embedded: false,
        });
    }

    insert_row(&tx, fragment)?;
    insert_fts(&tx, fragment)?;

    let embedded = match &embedding {
        Some(vec) => {
            insert_vec(&tx, &fragment.id, vec)?;
            true
        }
        None => false,
    };

    tx.commit()?;

    Ok(InsertOutcome {
        id: fragment.id.clone(),
        created: true,
        embedded,
    })
}

/// Generate an embedding when the fragment qualifies and the provider is up.
/// Failure is logged and the fragment is stored without a vector.
fn maybe_embed(fragment: &Fragment, embedder: &dyn EmbeddingProvider) -> Option<Vec<f32>> {
    if fragment.importance <= 0.5 || !embedder.enabled() {
        return None;
    }
    match embedder.embed(&fragment.content) {
        Ok(vec) => Some(vec),
        Err(e) => {
            tracing::warn!(id = %fragment.id, error = %e, "embedding failed — storing without vector");
            None
        }
    }
}

fn find_by_hash(
    conn: &Connection,
    agent_id: &str,
    hash: &str,
) -> Result<Option<(String, f64)>> {
    let row = conn
        .query_row(
            "SELECT id, importance FROM fragments WHERE agent_id = ?1 AND content_hash = ?2",
            params![agent_id, hash],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(row)
}

fn insert_row(conn: &Transaction, f: &Fragment) -> Result<()> {
    conn.execute(
        "INSERT INTO fragments (id, content, topic, keywords, type, importance, content_hash, \
         source, linked_to, agent_id, access_count, accessed_at, created_at, ttl_tier, \
         estimated_tokens, utility_score, verified_at, is_anchor) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            f.id,
            f.content,
            f.topic,
            serde_json::to_string(&f.keywords)?,
            f.fragment_type.as_str(),
            f.importance,
            f.content_hash,
            f.source,
            serde_json::to_string(&f.linked_to)?,
            f.agent_id,
            f.access_count,
            f.accessed_at,
            f.created_at,
            f.ttl_tier.as_str(),
            f.estimated_tokens as i64,
            f.utility_score,
            f.verified_at,
            f.is_anchor as i64,
        ],
    )?;
    Ok(())
}

fn insert_fts(conn: &Transaction, f: &Fragment) -> Result<()> {
    conn.execute(
        "INSERT INTO fragments_fts (body, id) VALUES (?1, ?2)",
        params![fts_body(&f.content, &f.topic, &f.keywords), f.id],
    )?;
    Ok(())
}

fn update_fts(
    conn: &Connection,
    id: &str,
    content: &str,
    topic: &str,
    keywords: &[String],
) -> Result<()> {
    conn.execute("DELETE FROM fragments_fts WHERE id = ?1", params![id])?;
    conn.execute(
        "INSERT INTO fragments_fts (body, id) VALUES (?1, ?2)",
        params![fts_body(content, topic, keywords), id],
    )?;
    Ok(())
}

/// The FTS document: content plus topic plus keywords, so any of them match.
fn fts_body(content: &str, topic: &str, keywords: &[String]) -> String {
    let mut body = String::with_capacity(content.len() + topic.len() + 32);
    body.push_str(content);
    body.push(' ');
    body.push_str(topic);
    for kw in keywords {
        body.push(' ');
        body.push_str(kw);
    }
    body
}

fn insert_vec(conn: &Connection, id: &str, embedding: &[f32]) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO fragments_vec (id, embedding) VALUES (?1, ?2)",
        params![id, embedding_to_bytes(embedding)],
    )?;
    Ok(())
}

// ── Reads ────────────────────────────────────────────────────────────────────

const FRAGMENT_COLUMNS: &str = "id, content, topic, keywords, type, importance, content_hash, \
     source, linked_to, agent_id, access_count, accessed_at, created_at, ttl_tier, \
     estimated_tokens, utility_score, verified_at, is_anchor";

fn row_to_fragment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fragment> {
    let keywords_json: String = row.get(3)?;
    let type_str: String = row.get(4)?;
    let linked_json: String = row.get(8)?;
    let tier_str: String = row.get(13)?;
    Ok(Fragment {
        id: row.get(0)?,
        content: row.get(1)?,
        topic: row.get(2)?,
        keywords: serde_json::from_str(&keywords_json).unwrap_or_default(),
        fragment_type: type_str.parse().unwrap_or(FragmentType::Fact),
        importance: row.get(5)?,
        content_hash: row.get(6)?,
        source: row.get(7)?,
        linked_to: serde_json::from_str(&linked_json).unwrap_or_default(),
        agent_id: row.get(9)?,
        access_count: row.get(10)?,
        accessed_at: row.get(11)?,
        created_at: row.get(12)?,
        ttl_tier: tier_str.parse().unwrap_or(TtlTier::Warm),
        estimated_tokens: row.get::<_, i64>(14)? as usize,
        utility_score: row.get(15)?,
        verified_at: row.get(16)?,
        is_anchor: row.get::<_, i64>(17)? != 0,
    })
}

/// Fetch a fragment by id under the caller's scope.
pub fn get_by_id(conn: &Connection, id: &str, scope: &AgentScope) -> Result<Option<Fragment>> {
    let sql = format!("SELECT {FRAGMENT_COLUMNS} FROM fragments WHERE id = ?1");
    let fragment = conn
        .query_row(&sql, params![id], row_to_fragment)
        .optional()?;
    Ok(fragment.filter(|f| scope.admits(&f.agent_id)))
}

/// Batch-fetch fragments by id, keyed for merge steps. Rows outside the
/// caller's scope are silently absent.
pub fn get_by_ids(
    conn: &Connection,
    ids: &[String],
    scope: &AgentScope,
) -> Result<HashMap<String, Fragment>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }
    let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "SELECT {FRAGMENT_COLUMNS} FROM fragments WHERE id IN ({})",
        placeholders.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let sql_params: Vec<&dyn rusqlite::types::ToSql> =
        ids.iter().map(|id| id as &dyn rusqlite::types::ToSql).collect();
    let rows = stmt
        .query_map(sql_params.as_slice(), row_to_fragment)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut map = HashMap::new();
    for fragment in rows {
        if scope.admits(&fragment.agent_id) {
            map.insert(fragment.id.clone(), fragment);
        }
    }
    Ok(map)
}

/// All fragments under a topic visible to the caller, importance first.
pub fn get_by_topic(conn: &Connection, topic: &str, scope: &AgentScope) -> Result<Vec<Fragment>> {
    let sql = format!(
        "SELECT {FRAGMENT_COLUMNS} FROM fragments WHERE topic = ?1 ORDER BY importance DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![topic], row_to_fragment)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .filter(|f| scope.admits(&f.agent_id))
        .collect())
}

/// Ids of fragments that are the source of a `superseded_by` edge — these
/// are excluded from every search tier.
pub fn superseded_source_ids(conn: &Connection) -> Result<HashSet<String>> {
    let mut stmt = conn
        .prepare("SELECT DISTINCT from_id FROM fragment_links WHERE relation_type = 'superseded_by'")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;
    Ok(ids)
}

/// Durable keyword-overlap search (the L2 tier). Any supplied keyword may
/// match; filters narrow afterwards.
pub fn search_by_keywords(
    conn: &Connection,
    keywords: &[String],
    filter: &KeywordFilter,
    scope: &AgentScope,
) -> Result<Vec<Fragment>> {
    let query = fts_overlap_query(keywords);
    if query.is_empty() {
        return Ok(Vec::new());
    }

    let candidate_ids: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM fragments_fts WHERE fragments_fts MATCH ?1 ORDER BY rank LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![query, (filter.limit.max(1) * 3) as i64], |row| {
                row.get(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let superseded = superseded_source_ids(conn)?;
    let fragments = get_by_ids(conn, &candidate_ids, scope)?;

    let mut results: Vec<Fragment> = Vec::new();
    for id in &candidate_ids {
        let Some(f) = fragments.get(id) else { continue };
        if superseded.contains(&f.id) {
            continue;
        }
        if let Some(ft) = filter.fragment_type {
            if f.fragment_type != ft {
                continue;
            }
        }
        if let Some(ref topic) = filter.topic {
            if &f.topic != topic {
                continue;
            }
        }
        if let Some(min) = filter.min_importance {
            if f.importance < min {
                continue;
            }
        }
        results.push(f.clone());
        if results.len() >= filter.limit {
            break;
        }
    }
    Ok(results)
}

/// Build an OR-of-terms FTS5 query so any keyword overlap matches.
fn fts_overlap_query(keywords: &[String]) -> String {
    keywords
        .iter()
        .map(|kw| format!("\"{}\"", kw.replace('"', "")))
        .filter(|t| t != "\"\"")
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// Cosine-similarity search (the L3 tier). Returns fragments with their
/// similarity, best first, excluding superseded sources.
pub fn search_by_semantic(
    conn: &Connection,
    query: &[f32],
    limit: usize,
    min_similarity: f64,
    scope: &AgentScope,
) -> Result<Vec<(Fragment, f64)>> {
    let max_distance = cosine_threshold_to_l2(min_similarity);

    let neighbors: Vec<(String, f64)> = {
        let mut stmt = conn.prepare(
            "SELECT id, distance FROM fragments_vec WHERE embedding MATCH ?1 \
             ORDER BY distance LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(
                params![embedding_to_bytes(query), (limit * 3) as i64],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let ids: Vec<String> = neighbors
        .iter()
        .filter(|(_, dist)| *dist <= max_distance)
        .map(|(id, _)| id.clone())
        .collect();
    let superseded = superseded_source_ids(conn)?;
    let fragments = get_by_ids(conn, &ids, scope)?;

    let mut results = Vec::new();
    for (id, distance) in neighbors {
        if distance > max_distance {
            break;
        }
        if superseded.contains(&id) {
            continue;
        }
        if let Some(f) = fragments.get(&id) {
            results.push((f.clone(), l2_to_cosine(distance)));
        }
        if results.len() >= limit {
            break;
        }
    }
    Ok(results)
}

/// Stored embedding for a fragment, if one exists.
pub fn get_embedding(conn: &Connection, id: &str) -> Result<Option<Vec<f32>>> {
    let bytes: Option<Vec<u8>> = conn
        .query_row(
            "SELECT embedding FROM fragments_vec WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(bytes.map(|b| super::bytes_to_embedding(&b)))
}

/// Insert or replace a fragment's embedding (consolidator backfill, tests).
pub fn put_embedding(conn: &Connection, id: &str, embedding: &[f32]) -> Result<()> {
    insert_vec(conn, id, embedding)
}

/// Batched access bump. Non-transactional; callers log and swallow failures.
pub fn increment_access(conn: &Connection, ids: &[String]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let now = Utc::now().to_rfc3339();
    let mut stmt = conn.prepare(
        "UPDATE fragments SET access_count = access_count + 1, accessed_at = ?1 WHERE id = ?2",
    )?;
    for id in ids {
        stmt.execute(params![now, id])?;
    }
    Ok(())
}

// ── Update ───────────────────────────────────────────────────────────────────

/// Amend a fragment. Archives the current row into `fragment_versions`
/// first. A content change recomputes the hash — a collision with a
/// different row returns [`UpdateOutcome::Merged`] without mutating either
/// row — and invalidates the embedding (the backfill stage regenerates it).
/// Returns `None` when the id is not visible under the caller's scope.
pub fn update(
    conn: &mut Connection,
    id: &str,
    patch: UpdatePatch,
    amended_by: &str,
    scope: &AgentScope,
    tokens: &TokenCounter,
) -> Result<Option<UpdateOutcome>> {
    let Some(current) = get_by_id(conn, id, scope)? else {
        return Ok(None);
    };

    // Work out the new content/hash before touching anything
    let (new_content, new_hash, content_changed) = match &patch.content {
        Some(raw) => {
            let redacted = super::redact::redact(raw);
            let truncated = truncate_for_update(&redacted);
            let hash = content_hash(&truncated);
            let changed = truncated != current.content;
            (truncated, hash, changed)
        }
        None => (current.content.clone(), current.content_hash.clone(), false),
    };

    if content_changed {
        if let Some((existing_id, _)) = find_by_hash(conn, &current.agent_id, &new_hash)? {
            if existing_id != id {
                return Ok(Some(UpdateOutcome::Merged { existing_id }));
            }
        }
    }

    let now = Utc::now().to_rfc3339();
    let tx = conn.transaction()?;

    // Archive the pre-amendment state before any mutation
    archive_version(&tx, &current, amended_by, &now)?;

    let new_topic = patch.topic.unwrap_or_else(|| current.topic.clone());
    let new_keywords = patch.keywords.unwrap_or_else(|| current.keywords.clone());
    let new_type = patch.fragment_type.unwrap_or(current.fragment_type);
    let new_importance = patch
        .importance
        .unwrap_or(current.importance)
        .clamp(0.0, 1.0);
    let new_anchor = patch.is_anchor.unwrap_or(current.is_anchor);
    let new_source = patch.source.or_else(|| current.source.clone());
    let new_tokens = if content_changed {
        tokens.count(&new_content)
    } else {
        current.estimated_tokens
    };

    tx.execute(
        "UPDATE fragments SET content = ?1, topic = ?2, keywords = ?3, type = ?4, \
         importance = ?5, content_hash = ?6, source = ?7, estimated_tokens = ?8, \
         is_anchor = ?9, verified_at = ?10, accessed_at = ?10 WHERE id = ?11",
        params![
            new_content,
            new_topic,
            serde_json::to_string(&new_keywords)?,
            new_type.as_str(),
            new_importance,
            new_hash,
            new_source,
            new_tokens as i64,
            new_anchor as i64,
            now,
            id,
        ],
    )?;

    update_fts(&tx, id, &new_content, &new_topic, &new_keywords)?;

    if content_changed {
        // Stale vector would lie about the new content
        tx.execute("DELETE FROM fragments_vec WHERE id = ?1", params![id])?;
    }

    tx.commit()?;

    let updated = get_by_id(conn, id, scope)?
        .context("fragment vanished during update")?;
    Ok(Some(UpdateOutcome::Updated(updated)))
}

/// Amendments re-apply the factory's truncation rule.
fn truncate_for_update(content: &str) -> String {
    let content = content.trim();
    if content.chars().count() <= super::factory::MAX_CONTENT_CHARS {
        return content.to_string();
    }
    let kept: String = content
        .chars()
        .take(super::factory::MAX_CONTENT_CHARS - 1)
        .collect();
    format!("{}…", kept.trim_end())
}

fn archive_version(
    conn: &Transaction,
    current: &Fragment,
    amended_by: &str,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO fragment_versions (fragment_id, content, topic, keywords, type, importance, \
         amended_at, amended_by) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            current.id,
            current.content,
            current.topic,
            serde_json::to_string(&current.keywords)?,
            current.fragment_type.as_str(),
            current.importance,
            now,
            amended_by,
        ],
    )?;
    Ok(())
}

/// Version history for a fragment, newest first.
pub fn get_versions(conn: &Connection, fragment_id: &str) -> Result<Vec<FragmentVersion>> {
    let mut stmt = conn.prepare(
        "SELECT fragment_id, content, topic, keywords, type, importance, amended_at, amended_by \
         FROM fragment_versions WHERE fragment_id = ?1 ORDER BY id DESC",
    )?;
    let versions = stmt
        .query_map(params![fragment_id], |row| {
            let keywords_json: String = row.get(3)?;
            let type_str: String = row.get(4)?;
            Ok(FragmentVersion {
                fragment_id: row.get(0)?,
                content: row.get(1)?,
                topic: row.get(2)?,
                keywords: serde_json::from_str(&keywords_json).unwrap_or_default(),
                fragment_type: type_str.parse().unwrap_or(FragmentType::Fact),
                importance: row.get(5)?,
                amended_at: row.get(6)?,
                amended_by: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(versions)
}

// ── Delete ───────────────────────────────────────────────────────────────────

/// Delete a fragment: FTS row, vector, `linked_to` references in other rows,
/// then the row itself (edges and versions cascade via FK). Returns `false`
/// when the id is not visible under the caller's scope.
pub fn delete(conn: &mut Connection, id: &str, scope: &AgentScope) -> Result<bool> {
    let Some(_fragment) = get_by_id(conn, id, scope)? else {
        return Ok(false);
    };

    let tx = conn.transaction()?;

    tx.execute("DELETE FROM fragments_fts WHERE id = ?1", params![id])?;
    tx.execute("DELETE FROM fragments_vec WHERE id = ?1", params![id])?;
    prune_linked_to_references(&tx, id)?;
    tx.execute("DELETE FROM fragments WHERE id = ?1", params![id])?;

    tx.commit()?;
    Ok(true)
}

/// Remove `target_id` from every `linked_to` array that mentions it.
fn prune_linked_to_references(conn: &Connection, target_id: &str) -> Result<()> {
    let affected: Vec<(String, String)> = {
        let mut stmt = conn.prepare(
            "SELECT id, linked_to FROM fragments WHERE linked_to LIKE '%' || ?1 || '%'",
        )?;
        let rows = stmt
            .query_map(params![target_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    for (row_id, linked_json) in affected {
        let mut linked: Vec<String> = serde_json::from_str(&linked_json).unwrap_or_default();
        let before = linked.len();
        linked.retain(|l| l != target_id);
        if linked.len() != before {
            conn.execute(
                "UPDATE fragments SET linked_to = ?1 WHERE id = ?2",
                params![serde_json::to_string(&linked)?, row_id],
            )?;
        }
    }
    Ok(())
}

// ── Links ────────────────────────────────────────────────────────────────────

/// Upsert a typed edge and maintain the undirected `linked_to` mirrors on
/// both endpoints. Idempotent. Returns `true` when a new edge row was
/// created.
pub fn create_link(
    conn: &mut Connection,
    from_id: &str,
    to_id: &str,
    relation: RelationType,
    scope: &AgentScope,
) -> Result<bool> {
    anyhow::ensure!(from_id != to_id, "self-links are not allowed");
    let from = get_by_id(conn, from_id, scope)?
        .with_context(|| format!("link source not found: {from_id}"))?;
    let to = get_by_id(conn, to_id, scope)?
        .with_context(|| format!("link target not found: {to_id}"))?;

    let tx = conn.transaction()?;
    let created = tx.execute(
        "INSERT OR IGNORE INTO fragment_links (from_id, to_id, relation_type, created_at) \
         VALUES (?1, ?2, ?3, ?4)",
        params![from_id, to_id, relation.as_str(), Utc::now().to_rfc3339()],
    )? > 0;

    add_to_mirror(&tx, &from, to_id)?;
    add_to_mirror(&tx, &to, from_id)?;
    tx.commit()?;

    Ok(created)
}

fn add_to_mirror(conn: &Connection, fragment: &Fragment, other_id: &str) -> Result<()> {
    if fragment.linked_to.iter().any(|l| l == other_id) {
        return Ok(());
    }
    let mut linked = fragment.linked_to.clone();
    linked.push(other_id.to_string());
    conn.execute(
        "UPDATE fragments SET linked_to = ?1 WHERE id = ?2",
        params![serde_json::to_string(&linked)?, fragment.id],
    )?;
    Ok(())
}

/// Outgoing edges from a fragment.
pub fn get_links_from(conn: &Connection, from_id: &str) -> Result<Vec<(String, RelationType)>> {
    let mut stmt = conn.prepare(
        "SELECT to_id, relation_type FROM fragment_links WHERE from_id = ?1",
    )?;
    let rows = stmt
        .query_map(params![from_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .filter_map(|(id, rel)| rel.parse().ok().map(|r| (id, r)))
        .collect())
}

/// Incoming edges pointing at a fragment.
pub fn get_links_to(conn: &Connection, to_id: &str) -> Result<Vec<(String, RelationType)>> {
    let mut stmt = conn.prepare(
        "SELECT from_id, relation_type FROM fragment_links WHERE to_id = ?1",
    )?;
    let rows = stmt
        .query_map(params![to_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows
        .into_iter()
        .filter_map(|(id, rel)| rel.parse().ok().map(|r| (id, r)))
        .collect())
}

/// One-hop neighbors of a result set, filtered to the given relation types,
/// ordered by relation priority (`resolved_by` < `caused_by` < other) then
/// importance, capped at `limit`. Edges are followed in both directions —
/// `linked_to` mirrors are undirected and expansion matches them. The
/// relation filter is an enum — free-form strings never reach the SQL.
pub fn get_linked_fragments(
    conn: &Connection,
    from_ids: &[String],
    relations: &[RelationType],
    limit: usize,
    scope: &AgentScope,
) -> Result<Vec<(Fragment, RelationType)>> {
    if from_ids.is_empty() || relations.is_empty() {
        return Ok(Vec::new());
    }

    let mut edges: Vec<(String, RelationType)> = Vec::new();
    for from_id in from_ids {
        for (to_id, relation) in get_links_from(conn, from_id)? {
            if relations.contains(&relation) && !from_ids.contains(&to_id) {
                edges.push((to_id, relation));
            }
        }
        for (other_id, relation) in get_links_to(conn, from_id)? {
            if relations.contains(&relation) && !from_ids.contains(&other_id) {
                edges.push((other_id, relation));
            }
        }
    }

    let ids: Vec<String> = edges.iter().map(|(id, _)| id.clone()).collect();
    let fragments = get_by_ids(conn, &ids, scope)?;

    let mut results: Vec<(Fragment, RelationType)> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for (id, relation) in edges {
        if !seen.insert(id.clone()) {
            continue;
        }
        if let Some(f) = fragments.get(&id) {
            results.push((f.clone(), relation));
        }
    }

    results.sort_by(|a, b| {
        a.1.fetch_priority()
            .cmp(&b.1.fetch_priority())
            .then_with(|| {
                b.0.importance
                    .partial_cmp(&a.0.importance)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    });
    results.truncate(limit);
    Ok(results)
}

/// Root-cause walk: the start node plus its one-hop `caused_by` /
/// `resolved_by` targets, annotated with relation and depth.
pub fn get_rca_chain(
    conn: &Connection,
    start_id: &str,
    scope: &AgentScope,
) -> Result<Option<Vec<RcaNode>>> {
    let Some(start) = get_by_id(conn, start_id, scope)? else {
        return Ok(None);
    };

    let mut chain = vec![RcaNode {
        fragment: start,
        relation: None,
        depth: 0,
    }];

    for (to_id, relation) in get_links_from(conn, start_id)? {
        if !matches!(relation, RelationType::CausedBy | RelationType::ResolvedBy) {
            continue;
        }
        if let Some(f) = get_by_id(conn, &to_id, scope)? {
            chain.push(RcaNode {
                fragment: f,
                relation: Some(relation.as_str().to_string()),
                depth: 1,
            });
        }
    }
    Ok(Some(chain))
}

// ── Maintenance sweeps (maintenance scope) ───────────────────────────────────

/// Drop rows that have faded out: importance below the floor, non-permanent,
/// non-anchor, inactive past the cutoff, and fewer than two links.
pub fn delete_expired(
    conn: &mut Connection,
    importance_floor: f64,
    inactive_days: i64,
) -> Result<usize> {
    let cutoff = (Utc::now() - Duration::days(inactive_days)).to_rfc3339();
    let ids: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM fragments \
             WHERE importance < ?1 \
               AND ttl_tier != 'permanent' \
               AND is_anchor = 0 \
               AND ((accessed_at IS NOT NULL AND accessed_at < ?2) \
                    OR (accessed_at IS NULL AND created_at < ?2)) \
               AND json_array_length(linked_to) < 2",
        )?;
        let rows = stmt
            .query_map(params![importance_floor, cutoff], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut deleted = 0;
    for id in &ids {
        if delete(conn, id, &AgentScope::Maintenance)? {
            deleted += 1;
        }
    }
    Ok(deleted)
}

/// Multiply importance by the decay factor for non-permanent, non-preference,
/// non-anchor rows inactive for at least the given number of days.
pub fn decay_importance(conn: &Connection, factor: f64, inactive_days: i64) -> Result<usize> {
    let cutoff = (Utc::now() - Duration::days(inactive_days)).to_rfc3339();
    let affected = conn.execute(
        "UPDATE fragments SET importance = importance * ?1 \
         WHERE ttl_tier != 'permanent' \
           AND type != 'preference' \
           AND is_anchor = 0 \
           AND ((accessed_at IS NOT NULL AND accessed_at < ?2) \
                OR (accessed_at IS NULL AND created_at < ?2))",
        params![factor, cutoff],
    )?;
    Ok(affected)
}

/// Tier transitions: three promotion rules, then the demotion rule.
/// Returns the number of rows whose tier changed.
pub fn transition_tiers(conn: &Connection) -> Result<usize> {
    let mut changed = 0;

    // Promotions to permanent: preferences, hubs, high importance
    changed += conn.execute(
        "UPDATE fragments SET ttl_tier = 'permanent' \
         WHERE ttl_tier != 'permanent' AND type = 'preference'",
        [],
    )?;
    changed += conn.execute(
        "UPDATE fragments SET ttl_tier = 'permanent' \
         WHERE ttl_tier != 'permanent' AND json_array_length(linked_to) >= 5",
        [],
    )?;
    changed += conn.execute(
        "UPDATE fragments SET ttl_tier = 'permanent' \
         WHERE ttl_tier != 'permanent' AND importance >= 0.8",
        [],
    )?;

    // Demotion: warm → cold on low importance or 30 days of inactivity
    let cutoff = (Utc::now() - Duration::days(30)).to_rfc3339();
    changed += conn.execute(
        "UPDATE fragments SET ttl_tier = 'cold' \
         WHERE ttl_tier = 'warm' AND is_anchor = 0 \
           AND (importance < 0.3 \
                OR (accessed_at IS NOT NULL AND accessed_at < ?1) \
                OR (accessed_at IS NULL AND created_at < ?1))",
        params![cutoff],
    )?;

    Ok(changed)
}

/// Backfill embeddings for the top-`n` vectorless rows by importance.
pub fn generate_missing_embeddings(
    conn: &Connection,
    n: usize,
    embedder: &dyn EmbeddingProvider,
) -> Result<usize> {
    if !embedder.enabled() || n == 0 {
        return Ok(0);
    }

    let candidates: Vec<(String, String)> = {
        let mut stmt = conn.prepare(
            "SELECT f.id, f.content FROM fragments f \
             WHERE f.id NOT IN (SELECT id FROM fragments_vec) \
             ORDER BY f.importance DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![n as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut generated = 0;
    for (id, content) in candidates {
        match embedder.embed(&content) {
            Ok(vec) => {
                insert_vec(conn, &id, &vec)?;
                generated += 1;
            }
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "embedding backfill failed");
            }
        }
    }
    Ok(generated)
}

/// Rewrite `utility_score` as `importance * (1 + ln(max(access_count, 1)))`.
pub fn recompute_utility(conn: &Connection) -> Result<usize> {
    let rows: Vec<(String, f64, u32)> = {
        let mut stmt = conn.prepare("SELECT id, importance, access_count FROM fragments")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut stmt = conn.prepare("UPDATE fragments SET utility_score = ?1 WHERE id = ?2")?;
    let count = rows.len();
    for (id, importance, access_count) in rows {
        let utility = importance * (1.0 + f64::from(access_count.max(1)).ln());
        stmt.execute(params![utility, id])?;
    }
    Ok(count)
}

/// Promote heavily-used, high-importance rows to anchors.
pub fn promote_anchors(conn: &Connection, min_access: u32, min_importance: f64) -> Result<usize> {
    let affected = conn.execute(
        "UPDATE fragments SET is_anchor = 1 \
         WHERE is_anchor = 0 AND access_count >= ?1 AND importance >= ?2",
        params![min_access, min_importance],
    )?;
    Ok(affected)
}

/// Reconcile `linked_to` mirrors: drop ids whose row no longer exists.
pub fn prune_dangling_mirrors(conn: &Connection) -> Result<usize> {
    let existing: HashSet<String> = {
        let mut stmt = conn.prepare("SELECT id FROM fragments")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        rows
    };

    let rows: Vec<(String, String)> = {
        let mut stmt = conn.prepare("SELECT id, linked_to FROM fragments WHERE linked_to != '[]'")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut pruned = 0;
    for (id, linked_json) in rows {
        let mut linked: Vec<String> = serde_json::from_str(&linked_json).unwrap_or_default();
        let before = linked.len();
        linked.retain(|l| existing.contains(l));
        if linked.len() != before {
            conn.execute(
                "UPDATE fragments SET linked_to = ?1 WHERE id = ?2",
                params![serde_json::to_string(&linked)?, id],
            )?;
            pruned += before - linked.len();
        }
    }
    Ok(pruned)
}

// ── Feedback ─────────────────────────────────────────────────────────────────

pub fn insert_tool_feedback(conn: &Connection, feedback: &ToolFeedback) -> Result<()> {
    conn.execute(
        "INSERT INTO tool_feedback (tool_name, relevant, sufficient, suggestion, context, \
         session_id, trigger_type, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            feedback.tool_name,
            feedback.relevant as i64,
            feedback.sufficient as i64,
            feedback.suggestion,
            feedback.context,
            feedback.session_id,
            feedback.trigger_type,
            feedback.created_at,
        ],
    )?;
    Ok(())
}

pub fn insert_task_feedback(conn: &Connection, feedback: &TaskFeedback) -> Result<()> {
    conn.execute(
        "INSERT INTO task_feedback (session_id, overall_success, tool_highlights, \
         tool_pain_points, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            feedback.session_id,
            feedback.overall_success as i64,
            serde_json::to_string(&feedback.tool_highlights)?,
            serde_json::to_string(&feedback.tool_pain_points)?,
            feedback.created_at,
        ],
    )?;
    Ok(())
}

/// Tool feedback recorded since the watermark (for the consolidation report).
pub fn tool_feedback_since(conn: &Connection, watermark: &str) -> Result<Vec<ToolFeedback>> {
    let mut stmt = conn.prepare(
        "SELECT tool_name, relevant, sufficient, suggestion, context, session_id, trigger_type, \
         created_at FROM tool_feedback WHERE created_at > ?1 ORDER BY created_at",
    )?;
    let rows = stmt
        .query_map(params![watermark], |row| {
            Ok(ToolFeedback {
                tool_name: row.get(0)?,
                relevant: row.get::<_, i64>(1)? != 0,
                sufficient: row.get::<_, i64>(2)? != 0,
                suggestion: row.get(3)?,
                context: row.get(4)?,
                session_id: row.get(5)?,
                trigger_type: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Task feedback recorded since the watermark.
pub fn task_feedback_since(conn: &Connection, watermark: &str) -> Result<Vec<TaskFeedback>> {
    let mut stmt = conn.prepare(
        "SELECT session_id, overall_success, tool_highlights, tool_pain_points, created_at \
         FROM task_feedback WHERE created_at > ?1 ORDER BY created_at",
    )?;
    let rows = stmt
        .query_map(params![watermark], |row| {
            let highlights: String = row.get(2)?;
            let pain_points: String = row.get(3)?;
            Ok(TaskFeedback {
                session_id: row.get(0)?,
                overall_success: row.get::<_, i64>(1)? != 0,
                tool_highlights: serde_json::from_str(&highlights).unwrap_or_default(),
                tool_pain_points: serde_json::from_str(&pain_points).unwrap_or_default(),
                created_at: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Total row count (drives the composite-ranking activation threshold).
pub fn fragment_count(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM fragments", [], |row| row.get(0))?;
    Ok(count as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::NoEmbeddingProvider;
    use crate::memory::factory::{CreateParams, FragmentFactory};
    use crate::memory::tokens::TokenCounter;
    use std::sync::Arc;

    fn test_db() -> Connection {
        crate::db::open_memory_database().unwrap()
    }

    fn factory() -> FragmentFactory {
        FragmentFactory::new(Arc::new(TokenCounter::approximate()))
    }

    fn make_fragment(content: &str, topic: &str, ft: FragmentType, agent: &str) -> Fragment {
        factory().create(
            CreateParams {
                content: content.to_string(),
                topic: topic.to_string(),
                fragment_type: ft,
                keywords: None,
                importance: None,
                source: None,
                agent_id: agent.to_string(),
                is_anchor: false,
            },
            Utc::now(),
        )
    }

    fn store_fragment(conn: &mut Connection, content: &str, topic: &str, ft: FragmentType) -> String {
        let f = make_fragment(content, topic, ft, "default");
        insert(conn, &f, &NoEmbeddingProvider).unwrap().id
    }

    fn scope() -> AgentScope {
        AgentScope::agent("default")
    }

    #[test]
    fn insert_and_fetch_round_trip() {
        let mut conn = test_db();
        let id = store_fragment(&mut conn, "Redis NOAUTH means missing password", "redis", FragmentType::Error);

        let f = get_by_id(&conn, &id, &scope()).unwrap().unwrap();
        assert_eq!(f.content, "Redis NOAUTH means missing password");
        assert_eq!(f.fragment_type, FragmentType::Error);
        assert_eq!(f.importance, 0.9);
        assert_eq!(f.ttl_tier, TtlTier::Hot);
        assert!(f.keywords.contains(&"redis".to_string()));
    }

    #[test]
    fn duplicate_hash_returns_existing_and_bumps_importance() {
        let mut conn = test_db();
        let f1 = make_fragment("Node 20 is required.", "stack", FragmentType::Fact, "default");
        let first = insert(&mut conn, &f1, &NoEmbeddingProvider).unwrap();
        assert!(first.created);

        let mut f2 = make_fragment("Node 20 is required.", "stack", FragmentType::Fact, "default");
        f2.importance = 0.8;
        let second = insert(&mut conn, &f2, &NoEmbeddingProvider).unwrap();
        assert!(!second.created);
        assert_eq!(second.id, first.id);

        let row = get_by_id(&conn, &first.id, &scope()).unwrap().unwrap();
        assert_eq!(row.importance, 0.8); // max(0.5, 0.8)
        assert_eq!(row.access_count, 1);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM fragments", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn same_hash_different_agents_both_insert() {
        let mut conn = test_db();
        let a = make_fragment("shared wisdom", "t", FragmentType::Fact, "agent-a");
        let b = make_fragment("shared wisdom", "t", FragmentType::Fact, "agent-b");
        assert!(insert(&mut conn, &a, &NoEmbeddingProvider).unwrap().created);
        assert!(insert(&mut conn, &b, &NoEmbeddingProvider).unwrap().created);
    }

    #[test]
    fn scope_hides_foreign_rows_but_shows_shared_pool() {
        let mut conn = test_db();
        let private = make_fragment("private note", "t", FragmentType::Fact, "agent-a");
        let shared = make_fragment("shared note", "t", FragmentType::Fact, "default");
        let private_id = insert(&mut conn, &private, &NoEmbeddingProvider).unwrap().id;
        let shared_id = insert(&mut conn, &shared, &NoEmbeddingProvider).unwrap().id;

        let b_scope = AgentScope::agent("agent-b");
        assert!(get_by_id(&conn, &private_id, &b_scope).unwrap().is_none());
        assert!(get_by_id(&conn, &shared_id, &b_scope).unwrap().is_some());
        assert!(get_by_id(&conn, &private_id, &AgentScope::Maintenance).unwrap().is_some());
    }

    #[test]
    fn keyword_search_matches_overlap() {
        let mut conn = test_db();
        let id = store_fragment(&mut conn, "Redis NOAUTH indicates missing REDIS_PASSWORD", "redis", FragmentType::Error);
        store_fragment(&mut conn, "pgvector HNSW tuning notes", "pgvector", FragmentType::Fact);

        let results = search_by_keywords(
            &conn,
            &["redis".into(), "noauth".into()],
            &KeywordFilter { limit: 30, ..Default::default() },
            &scope(),
        )
        .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, id);
    }

    #[test]
    fn keyword_search_applies_filters() {
        let mut conn = test_db();
        store_fragment(&mut conn, "redis cluster sizing fact", "redis", FragmentType::Fact);
        let err_id = store_fragment(&mut conn, "redis timeout error seen", "redis", FragmentType::Error);

        let results = search_by_keywords(
            &conn,
            &["redis".into()],
            &KeywordFilter {
                fragment_type: Some(FragmentType::Error),
                min_importance: Some(0.5),
                limit: 30,
                ..Default::default()
            },
            &scope(),
        )
        .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, err_id);
    }

    #[test]
    fn keyword_search_excludes_superseded_sources() {
        let mut conn = test_db();
        let old_id = store_fragment(&mut conn, "redis old advice", "redis", FragmentType::Fact);
        let new_id = store_fragment(&mut conn, "redis new advice", "redis", FragmentType::Fact);
        create_link(&mut conn, &old_id, &new_id, RelationType::SupersededBy, &scope()).unwrap();

        let results = search_by_keywords(
            &conn,
            &["redis".into()],
            &KeywordFilter { limit: 30, ..Default::default() },
            &scope(),
        )
        .unwrap();
        let ids: Vec<&str> = results.iter().map(|f| f.id.as_str()).collect();
        assert!(!ids.contains(&old_id.as_str()));
        assert!(ids.contains(&new_id.as_str()));
    }

    #[test]
    fn semantic_search_orders_by_similarity() {
        let mut conn = test_db();
        let id_a = store_fragment(&mut conn, "alpha fragment", "t", FragmentType::Fact);
        let id_b = store_fragment(&mut conn, "beta fragment", "t", FragmentType::Fact);

        let mut va = vec![0.0f32; 1536];
        va[0] = 1.0;
        let mut vb = vec![0.0f32; 1536];
        vb[7] = 1.0;
        insert_vec(&conn, &id_a, &va).unwrap();
        insert_vec(&conn, &id_b, &vb).unwrap();

        let results = search_by_semantic(&conn, &va, 10, 0.3, &scope()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.id, id_a);
        assert!(results[0].1 > 0.99);
    }

    #[test]
    fn vectorless_fragments_are_invisible_at_l3() {
        let mut conn = test_db();
        store_fragment(&mut conn, "no vector here", "t", FragmentType::Fact);

        let mut query = vec![0.0f32; 1536];
        query[0] = 1.0;
        let results = search_by_semantic(&conn, &query, 10, 0.3, &scope()).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn update_archives_previous_version() {
        let mut conn = test_db();
        let id = store_fragment(&mut conn, "original content", "t", FragmentType::Fact);

        let outcome = update(
            &mut conn,
            &id,
            UpdatePatch {
                content: Some("amended content".into()),
                ..Default::default()
            },
            "default",
            &scope(),
            &TokenCounter::approximate(),
        )
        .unwrap()
        .unwrap();

        let UpdateOutcome::Updated(updated) = outcome else {
            panic!("expected update, got merge");
        };
        assert_eq!(updated.content, "amended content");

        let versions = get_versions(&conn, &id).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].content, "original content");
        assert_eq!(versions[0].amended_by, "default");
    }

    #[test]
    fn update_with_hash_collision_merges_without_mutation() {
        let mut conn = test_db();
        let id_a = store_fragment(&mut conn, "Node 20 is required.", "stack", FragmentType::Fact);
        let id_b = store_fragment(&mut conn, "Use Node 22 instead.", "stack", FragmentType::Fact);

        let outcome = update(
            &mut conn,
            &id_a,
            UpdatePatch {
                content: Some("Use Node 22 instead.".into()),
                ..Default::default()
            },
            "default",
            &scope(),
            &TokenCounter::approximate(),
        )
        .unwrap()
        .unwrap();

        let UpdateOutcome::Merged { existing_id } = outcome else {
            panic!("expected merge");
        };
        assert_eq!(existing_id, id_b);

        // Row A unchanged, no version row created
        let a = get_by_id(&conn, &id_a, &scope()).unwrap().unwrap();
        assert_eq!(a.content, "Node 20 is required.");
        assert!(get_versions(&conn, &id_a).unwrap().is_empty());
    }

    #[test]
    fn content_change_invalidates_embedding() {
        let mut conn = test_db();
        let id = store_fragment(&mut conn, "embedded content", "t", FragmentType::Fact);
        let mut v = vec![0.0f32; 1536];
        v[3] = 1.0;
        insert_vec(&conn, &id, &v).unwrap();

        update(
            &mut conn,
            &id,
            UpdatePatch {
                content: Some("entirely new content".into()),
                ..Default::default()
            },
            "default",
            &scope(),
            &TokenCounter::approximate(),
        )
        .unwrap()
        .unwrap();

        let vec_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM fragments_vec WHERE id = ?1", params![id], |r| r.get(0))
            .unwrap();
        assert_eq!(vec_count, 0);
    }

    #[test]
    fn delete_cascades_links_and_prunes_mirrors() {
        let mut conn = test_db();
        let id_a = store_fragment(&mut conn, "fragment a", "t", FragmentType::Fact);
        let id_b = store_fragment(&mut conn, "fragment b", "t", FragmentType::Fact);
        create_link(&mut conn, &id_a, &id_b, RelationType::Related, &scope()).unwrap();

        assert!(delete(&mut conn, &id_b, &scope()).unwrap());

        // Edge cascaded
        let edge_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM fragment_links", [], |r| r.get(0))
            .unwrap();
        assert_eq!(edge_count, 0);

        // Mirror pruned
        let a = get_by_id(&conn, &id_a, &scope()).unwrap().unwrap();
        assert!(a.linked_to.is_empty());
    }

    #[test]
    fn create_link_is_idempotent_and_mirrors_both_ways() {
        let mut conn = test_db();
        let id_a = store_fragment(&mut conn, "cause", "t", FragmentType::Error);
        let id_b = store_fragment(&mut conn, "effect", "t", FragmentType::Decision);

        assert!(create_link(&mut conn, &id_a, &id_b, RelationType::CausedBy, &scope()).unwrap());
        assert!(!create_link(&mut conn, &id_a, &id_b, RelationType::CausedBy, &scope()).unwrap());

        let a = get_by_id(&conn, &id_a, &scope()).unwrap().unwrap();
        let b = get_by_id(&conn, &id_b, &scope()).unwrap().unwrap();
        assert_eq!(a.linked_to, vec![id_b.clone()]);
        assert_eq!(b.linked_to, vec![id_a.clone()]);
    }

    #[test]
    fn linked_fragments_order_by_relation_priority() {
        let mut conn = test_db();
        let start = store_fragment(&mut conn, "start node", "t", FragmentType::Error);
        let related = store_fragment(&mut conn, "merely related", "t", FragmentType::Fact);
        let resolution = store_fragment(&mut conn, "the fix", "t", FragmentType::Procedure);
        create_link(&mut conn, &start, &related, RelationType::Related, &scope()).unwrap();
        create_link(&mut conn, &start, &resolution, RelationType::ResolvedBy, &scope()).unwrap();

        let linked = get_linked_fragments(
            &conn,
            &[start],
            &[RelationType::Related, RelationType::ResolvedBy],
            10,
            &scope(),
        )
        .unwrap();
        assert_eq!(linked.len(), 2);
        assert_eq!(linked[0].0.id, resolution); // resolved_by sorts first
    }

    #[test]
    fn rca_chain_walks_causal_edges_only() {
        let mut conn = test_db();
        let error = store_fragment(&mut conn, "the error", "t", FragmentType::Error);
        let cause = store_fragment(&mut conn, "the cause", "t", FragmentType::Decision);
        let noise = store_fragment(&mut conn, "unrelated", "t", FragmentType::Fact);
        create_link(&mut conn, &error, &cause, RelationType::CausedBy, &scope()).unwrap();
        create_link(&mut conn, &error, &noise, RelationType::Related, &scope()).unwrap();

        let chain = get_rca_chain(&conn, &error, &scope()).unwrap().unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].depth, 0);
        assert_eq!(chain[1].fragment.id, cause);
        assert_eq!(chain[1].relation.as_deref(), Some("caused_by"));
    }

    #[test]
    fn decay_skips_protected_rows() {
        let mut conn = test_db();
        let plain = store_fragment(&mut conn, "plain fact", "t", FragmentType::Fact);
        let pref = store_fragment(&mut conn, "a preference", "t", FragmentType::Preference);

        // Backdate both so the inactivity mask applies
        let old = (Utc::now() - Duration::days(5)).to_rfc3339();
        conn.execute("UPDATE fragments SET created_at = ?1", params![old]).unwrap();

        decay_importance(&conn, 0.995, 1).unwrap();

        let plain_row = get_by_id(&conn, &plain, &scope()).unwrap().unwrap();
        let pref_row = get_by_id(&conn, &pref, &scope()).unwrap().unwrap();
        assert!((plain_row.importance - 0.5 * 0.995).abs() < 1e-9);
        assert_eq!(pref_row.importance, 0.95); // preference untouched
    }

    #[test]
    fn expiry_requires_all_conditions() {
        let mut conn = test_db();
        let id = store_fragment(&mut conn, "fading fragment", "t", FragmentType::Fact);
        let old = (Utc::now() - Duration::days(120)).to_rfc3339();
        conn.execute(
            "UPDATE fragments SET importance = 0.05, created_at = ?1 WHERE id = ?2",
            params![old, id],
        )
        .unwrap();

        // Anchored → survives
        conn.execute("UPDATE fragments SET is_anchor = 1 WHERE id = ?1", params![id]).unwrap();
        assert_eq!(delete_expired(&mut conn, 0.1, 90).unwrap(), 0);

        // Unanchored → expires
        conn.execute("UPDATE fragments SET is_anchor = 0 WHERE id = ?1", params![id]).unwrap();
        assert_eq!(delete_expired(&mut conn, 0.1, 90).unwrap(), 1);
        assert!(get_by_id(&conn, &id, &scope()).unwrap().is_none());
    }

    #[test]
    fn tier_transitions_promote_and_demote() {
        let mut conn = test_db();
        let hub = store_fragment(&mut conn, "hub fragment", "t", FragmentType::Fact);
        let fading = store_fragment(&mut conn, "fading warm", "t", FragmentType::Fact);

        conn.execute(
            "UPDATE fragments SET linked_to = ?1, ttl_tier = 'warm' WHERE id = ?2",
            params![
                serde_json::to_string(&vec!["a", "b", "c", "d", "e"]).unwrap(),
                hub
            ],
        )
        .unwrap();
        conn.execute(
            "UPDATE fragments SET importance = 0.2, ttl_tier = 'warm' WHERE id = ?1",
            params![fading],
        )
        .unwrap();

        let changed = transition_tiers(&conn).unwrap();
        assert!(changed >= 2);

        let hub_row = get_by_id(&conn, &hub, &scope()).unwrap().unwrap();
        let fading_row = get_by_id(&conn, &fading, &scope()).unwrap().unwrap();
        assert_eq!(hub_row.ttl_tier, TtlTier::Permanent);
        assert_eq!(fading_row.ttl_tier, TtlTier::Cold);
    }

    #[test]
    fn utility_recompute_uses_log_formula() {
        let mut conn = test_db();
        let id = store_fragment(&mut conn, "useful fragment", "t", FragmentType::Fact);
        conn.execute(
            "UPDATE fragments SET importance = 0.8, access_count = 7 WHERE id = ?1",
            params![id],
        )
        .unwrap();

        recompute_utility(&conn).unwrap();

        let row = get_by_id(&conn, &id, &scope()).unwrap().unwrap();
        let expected = 0.8 * (1.0 + 7.0f64.ln());
        assert!((row.utility_score - expected).abs() < 1e-9);
    }

    #[test]
    fn anchor_promotion_thresholds() {
        let mut conn = test_db();
        let hot = store_fragment(&mut conn, "much used", "t", FragmentType::Fact);
        let cold = store_fragment(&mut conn, "barely used", "t", FragmentType::Fact);
        conn.execute(
            "UPDATE fragments SET access_count = 12, importance = 0.85 WHERE id = ?1",
            params![hot],
        )
        .unwrap();
        conn.execute(
            "UPDATE fragments SET access_count = 12, importance = 0.5 WHERE id = ?1",
            params![cold],
        )
        .unwrap();

        assert_eq!(promote_anchors(&conn, 10, 0.8).unwrap(), 1);
        assert!(get_by_id(&conn, &hot, &scope()).unwrap().unwrap().is_anchor);
        assert!(!get_by_id(&conn, &cold, &scope()).unwrap().unwrap().is_anchor);
    }

    #[test]
    fn increment_access_bumps_counters() {
        let mut conn = test_db();
        let id = store_fragment(&mut conn, "tracked", "t", FragmentType::Fact);
        increment_access(&conn, &[id.clone()]).unwrap();
        increment_access(&conn, &[id.clone()]).unwrap();

        let row = get_by_id(&conn, &id, &scope()).unwrap().unwrap();
        assert_eq!(row.access_count, 2);
        assert!(row.accessed_at.is_some());
    }

    #[test]
    fn feedback_round_trips_with_watermark() {
        let conn = test_db();
        insert_tool_feedback(
            &conn,
            &ToolFeedback {
                tool_name: "recall".into(),
                relevant: true,
                sufficient: false,
                suggestion: Some("return more context".into()),
                context: None,
                session_id: Some("sess-1".into()),
                trigger_type: "voluntary".into(),
                created_at: Utc::now().to_rfc3339(),
            },
        )
        .unwrap();
        insert_task_feedback(
            &conn,
            &TaskFeedback {
                session_id: Some("sess-1".into()),
                overall_success: true,
                tool_highlights: vec!["recall".into()],
                tool_pain_points: vec![],
                created_at: Utc::now().to_rfc3339(),
            },
        )
        .unwrap();

        let tools = tool_feedback_since(&conn, "1970-01-01T00:00:00Z").unwrap();
        assert_eq!(tools.len(), 1);
        assert!(tools[0].relevant);
        assert!(!tools[0].sufficient);

        let tasks = task_feedback_since(&conn, "1970-01-01T00:00:00Z").unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].tool_highlights, vec!["recall"]);

        let future = tool_feedback_since(&conn, "2999-01-01T00:00:00Z").unwrap();
        assert!(future.is_empty());
    }
}
