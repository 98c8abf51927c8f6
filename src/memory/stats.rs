use anyhow::Result;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

use super::types::{FragmentType, TtlTier};

/// Response from memory_stats.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total_fragments: u64,
    pub by_type: HashMap<String, u64>,
    pub by_tier: HashMap<String, u64>,
    pub by_agent: HashMap<String, u64>,
    pub anchors: u64,
    pub with_embedding: u64,
    pub links: u64,
    pub versions: u64,
    pub tool_feedback_entries: u64,
    pub task_feedback_entries: u64,
    pub avg_importance: f64,
    pub db_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_fragment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_fragment: Option<String>,
}

/// Compute store statistics. `db_path` is used for file size calculation;
/// pass `None` for in-memory databases.
pub fn memory_stats(conn: &Connection, db_path: Option<&Path>) -> Result<StatsResponse> {
    let total = count(conn, "SELECT COUNT(*) FROM fragments")?;
    let anchors = count(conn, "SELECT COUNT(*) FROM fragments WHERE is_anchor = 1")?;
    let with_embedding = count(conn, "SELECT COUNT(*) FROM fragments_vec")?;
    let links = count(conn, "SELECT COUNT(*) FROM fragment_links")?;
    let versions = count(conn, "SELECT COUNT(*) FROM fragment_versions")?;
    let tool_feedback_entries = count(conn, "SELECT COUNT(*) FROM tool_feedback")?;
    let task_feedback_entries = count(conn, "SELECT COUNT(*) FROM task_feedback")?;

    let by_type = group_counts(
        conn,
        "SELECT type, COUNT(*) FROM fragments GROUP BY type",
        FragmentType::ALL.iter().map(|t| t.as_str()),
    )?;
    let by_tier = group_counts(
        conn,
        "SELECT ttl_tier, COUNT(*) FROM fragments GROUP BY ttl_tier",
        [TtlTier::Hot, TtlTier::Warm, TtlTier::Cold, TtlTier::Permanent]
            .iter()
            .map(|t| t.as_str()),
    )?;
    let by_agent = group_counts(
        conn,
        "SELECT agent_id, COUNT(*) FROM fragments GROUP BY agent_id",
        std::iter::empty(),
    )?;

    let avg_importance: f64 = conn
        .query_row(
            "SELECT COALESCE(AVG(importance), 0.0) FROM fragments",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0.0);

    let (oldest_fragment, newest_fragment): (Option<String>, Option<String>) = conn.query_row(
        "SELECT MIN(created_at), MAX(created_at) FROM fragments",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let db_size_bytes = db_path
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0);

    Ok(StatsResponse {
        total_fragments: total,
        by_type,
        by_tier,
        by_agent,
        anchors,
        with_embedding,
        links,
        versions,
        tool_feedback_entries,
        task_feedback_entries,
        avg_importance,
        db_size_bytes,
        oldest_fragment,
        newest_fragment,
    })
}

fn count(conn: &Connection, sql: &str) -> Result<u64> {
    let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
    Ok(n as u64)
}

fn group_counts<'a>(
    conn: &Connection,
    sql: &str,
    zero_keys: impl Iterator<Item = &'a str>,
) -> Result<HashMap<String, u64>> {
    let mut map: HashMap<String, u64> = zero_keys.map(|k| (k.to_string(), 0)).collect();
    let mut stmt = conn.prepare(sql)?;
    let rows: Vec<(String, i64)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    for (key, n) in rows {
        map.insert(key, n as u64);
    }
    Ok(map)
}
