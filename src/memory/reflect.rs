//! Session reflection — projecting a free-form recap into typed fragments.
//!
//! `reflect` splits the summary into `fact` fragments, materialises each list
//! entry as a typed fragment (errors wrapped `[해결됨]`, open questions
//! `[미해결]`), then applies the rule-based auto-links: every error is
//! `caused_by` each decision, every procedure `resolved_by` each error, both
//! guarded by a bounded BFS cycle check.
//!
//! Auto-reflect runs at session close: the LLM path requests a structured
//! summary of the activity log; without an LLM a single minimal `fact`
//! fragment records the session's shape.

use anyhow::Result;
use rusqlite::Connection;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};

use super::session::{tool_summary, SessionActivity};
use super::store;

/// Prefix applied to `errors_resolved` entries.
pub const RESOLVED_PREFIX: &str = "[해결됨] ";
/// Prefix applied to `open_questions` entries.
pub const UNRESOLVED_PREFIX: &str = "[미해결] ";

/// Node budget for the cycle guard.
const CYCLE_SCAN_LIMIT: usize = 20;

/// Structured summary returned by the LLM during auto-reflect.
#[derive(Debug, Default)]
pub struct SessionSummary {
    pub summary: String,
    pub decisions: Vec<String>,
    pub errors_resolved: Vec<String>,
    pub new_procedures: Vec<String>,
    pub open_questions: Vec<String>,
}

/// Whether adding an edge `from → to` would close a cycle. Walks outgoing
/// edges from `to` breadth-first, giving up (conservatively reporting a
/// cycle) after [`CYCLE_SCAN_LIMIT`] nodes.
pub fn would_create_cycle(conn: &Connection, from_id: &str, to_id: &str) -> Result<bool> {
    if from_id == to_id {
        return Ok(true);
    }

    let mut visited: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    queue.push_back(to_id.to_string());

    while let Some(current) = queue.pop_front() {
        if current == from_id {
            return Ok(true);
        }
        if !visited.insert(current.clone()) {
            continue;
        }
        if visited.len() > CYCLE_SCAN_LIMIT {
            return Ok(true);
        }
        for (next, _) in store::get_links_from(conn, &current)? {
            queue.push_back(next);
        }
    }
    Ok(false)
}

/// Prompt pair for the LLM auto-reflect path.
pub fn build_reflect_prompt(activity: &SessionActivity) -> (String, String) {
    let system = "You summarise an AI agent's work session into structured memory. \
Respond with JSON: {\"summary\": \"...\", \"decisions\": [..], \"errors_resolved\": [..], \
\"new_procedures\": [..], \"open_questions\": [..]}. Keep every entry under 300 characters."
        .to_string();

    let user = format!(
        "Session {} ran from {} to {}.\nTool calls: {}\nKeywords seen: {}\nFragments touched: {}\n\n\
         Produce the structured summary.",
        activity.session_id,
        activity.started_at,
        activity.last_activity,
        tool_summary(&activity.tool_calls),
        activity.keywords.join(", "),
        activity.fragments.len(),
    );
    (system, user)
}

/// Parse the LLM's structured-summary JSON; `None` when the shape is wrong.
pub fn parse_structured_summary(value: &Value) -> Option<SessionSummary> {
    let summary = value["summary"].as_str()?.trim().to_string();
    if summary.is_empty() {
        return None;
    }
    Some(SessionSummary {
        summary,
        decisions: string_list(&value["decisions"]),
        errors_resolved: string_list(&value["errors_resolved"]),
        new_procedures: string_list(&value["new_procedures"]),
        open_questions: string_list(&value["open_questions"]),
    })
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// The degraded auto-reflect artefact: one line describing the session.
pub fn minimal_fact_content(activity: &SessionActivity) -> String {
    let duration = session_duration(activity);
    format!(
        "session {}: {}, tools={}, fragments={}",
        activity.session_id,
        duration,
        tool_summary(&activity.tool_calls),
        activity.fragments.len(),
    )
}

fn session_duration(activity: &SessionActivity) -> String {
    let (Ok(start), Ok(end)) = (
        chrono::DateTime::parse_from_rfc3339(&activity.started_at),
        chrono::DateTime::parse_from_rfc3339(&activity.last_activity),
    ) else {
        return "unknown duration".to_string();
    };
    let minutes = (end - start).num_minutes();
    if minutes < 1 {
        format!("{}s", (end - start).num_seconds().max(0))
    } else {
        format!("{minutes}m")
    }
}
