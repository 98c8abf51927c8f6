//! Per-session activity tracking.
//!
//! Each session carries a rolling document (24 h TTL): tool-call counts, the
//! last 50 unique keywords, the last 100 unique fragment ids, and a
//! `reflected` flag. Auto-reflect reads these documents on session close;
//! the context tool surfaces unreflected sessions as a hint.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;

use super::index::SESSION_TTL;

/// Bounded-list caps.
const MAX_KEYWORDS: usize = 50;
const MAX_FRAGMENTS: usize = 100;

/// One session's rolling activity document.
#[derive(Debug, Clone, Serialize)]
pub struct SessionActivity {
    pub session_id: String,
    pub started_at: String,
    pub last_activity: String,
    pub tool_calls: HashMap<String, u32>,
    pub keywords: Vec<String>,
    pub fragments: Vec<String>,
    pub reflected: bool,
}

struct TrackedSession {
    activity: SessionActivity,
    expires: Instant,
}

/// In-process session activity tracker.
#[derive(Default)]
pub struct SessionTracker {
    sessions: RwLock<HashMap<String, TrackedSession>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_session<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SessionActivity) -> R,
    ) -> R {
        let now = chrono::Utc::now().to_rfc3339();
        let mut sessions = self.sessions.write();
        let tracked = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| TrackedSession {
                activity: SessionActivity {
                    session_id: session_id.to_string(),
                    started_at: now.clone(),
                    last_activity: now.clone(),
                    tool_calls: HashMap::new(),
                    keywords: Vec::new(),
                    fragments: Vec::new(),
                    reflected: false,
                },
                expires: Instant::now() + SESSION_TTL,
            });
        tracked.activity.last_activity = now;
        tracked.expires = Instant::now() + SESSION_TTL;
        f(&mut tracked.activity)
    }

    /// Count one tool invocation.
    pub fn record_tool_call(&self, session_id: &str, tool: &str) {
        self.with_session(session_id, |activity| {
            *activity.tool_calls.entry(tool.to_string()).or_insert(0) += 1;
        });
    }

    /// Append keywords, keeping the last `MAX_KEYWORDS` unique entries.
    pub fn record_keywords(&self, session_id: &str, keywords: &[String]) {
        self.with_session(session_id, |activity| {
            for kw in keywords {
                activity.keywords.retain(|k| k != kw);
                activity.keywords.push(kw.clone());
            }
            let overflow = activity.keywords.len().saturating_sub(MAX_KEYWORDS);
            if overflow > 0 {
                activity.keywords.drain(..overflow);
            }
        });
    }

    /// Append fragment ids, keeping the last `MAX_FRAGMENTS` unique entries.
    pub fn record_fragments(&self, session_id: &str, ids: &[String]) {
        self.with_session(session_id, |activity| {
            for id in ids {
                activity.fragments.retain(|f| f != id);
                activity.fragments.push(id.clone());
            }
            let overflow = activity.fragments.len().saturating_sub(MAX_FRAGMENTS);
            if overflow > 0 {
                activity.fragments.drain(..overflow);
            }
        });
    }

    pub fn mark_reflected(&self, session_id: &str) {
        self.with_session(session_id, |activity| {
            activity.reflected = true;
        });
    }

    /// Snapshot of one session, purging it if expired.
    pub fn get(&self, session_id: &str) -> Option<SessionActivity> {
        let mut sessions = self.sessions.write();
        let snapshot = sessions
            .get(session_id)
            .map(|tracked| (tracked.expires > Instant::now(), tracked.activity.clone()));
        match snapshot {
            Some((true, activity)) => Some(activity),
            Some((false, _)) => {
                sessions.remove(session_id);
                None
            }
            None => None,
        }
    }

    /// Up to `limit` sessions that have activity but were never reflected.
    pub fn unreflected_sessions(&self, limit: usize) -> Vec<SessionActivity> {
        let sessions = self.sessions.read();
        let now = Instant::now();
        sessions
            .values()
            .filter(|t| t.expires > now && !t.activity.reflected)
            .filter(|t| !t.activity.tool_calls.is_empty())
            .take(limit)
            .map(|t| t.activity.clone())
            .collect()
    }

    /// Ids of every live session (shutdown auto-reflect walks these).
    pub fn live_session_ids(&self) -> Vec<String> {
        let sessions = self.sessions.read();
        let now = Instant::now();
        sessions
            .values()
            .filter(|t| t.expires > now)
            .map(|t| t.activity.session_id.clone())
            .collect()
    }
}

/// Compact `tool=count` summary used by minimal reflect fragments.
pub fn tool_summary(tool_calls: &HashMap<String, u32>) -> String {
    let mut entries: Vec<(&String, &u32)> = tool_calls.iter().collect();
    entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    entries
        .iter()
        .map(|(tool, count)| format!("{tool}:{count}"))
        .collect::<Vec<_>>()
        .join(",")
}
