//! In-process keyword index — the L1 retrieval tier and session-scoped state.
//!
//! Keyspaces: keyword/topic/type → fragment-id sets, a recency list, a hot
//! cache of materialised fragments (2 h TTL), per-session working-memory
//! queues, per-session emitted-fragment sets (24 h TTL), and the two FIFO
//! queues drained by the evaluator and the consolidator.
//!
//! Everything here is best-effort: when the index is disabled (or an entry
//! expired) operations quietly no-op and callers fall through to the durable
//! store. Nothing in this module is authoritative.

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use super::types::Fragment;

/// Hot-cache entry lifetime.
const HOT_TTL: Duration = Duration::from_secs(2 * 60 * 60);
/// Session keyspace lifetime (working memory, emitted sets, activity).
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// One working-memory entry for a `scope=session` remember.
#[derive(Debug, Clone)]
pub struct WorkingMemoryEntry {
    pub content: String,
    pub importance: f64,
    pub tokens: usize,
    pub created_at: String,
}

/// Job enqueued for the background evaluator.
#[derive(Debug, Clone)]
pub struct EvalJob {
    pub fragment_id: String,
    pub agent_id: String,
    pub fragment_type: String,
    pub content: String,
}

/// Contradiction pair parked for a later consolidation pass.
#[derive(Debug, Clone)]
pub struct PendingContradiction {
    pub first_id: String,
    pub second_id: String,
    pub similarity: f64,
}

struct HotEntry {
    fragment: Fragment,
    expires: Instant,
}

struct SessionEntry {
    ids: HashSet<String>,
    expires: Instant,
}

struct WorkingMemoryQueue {
    entries: VecDeque<WorkingMemoryEntry>,
    expires: Instant,
}

#[derive(Default)]
struct IndexState {
    by_keyword: HashMap<String, HashSet<String>>,
    by_topic: HashMap<String, HashSet<String>>,
    by_type: HashMap<String, HashSet<String>>,
    /// (insertion epoch millis, id), oldest first.
    recent: VecDeque<(i64, String)>,
    hot: HashMap<String, HotEntry>,
    sessions: HashMap<String, SessionEntry>,
    working_memory: HashMap<String, WorkingMemoryQueue>,
    eval_queue: VecDeque<EvalJob>,
    pending_contradictions: VecDeque<PendingContradiction>,
}

impl Default for WorkingMemoryQueue {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            expires: Instant::now() + SESSION_TTL,
        }
    }
}

pub struct KeywordIndex {
    state: RwLock<IndexState>,
    /// Working-memory token ceiling per session.
    wm_max_tokens: usize,
    /// Entries at or below this importance are evictable early.
    wm_eviction_importance: f64,
    /// When false, every operation is a no-op (models an unreachable layer).
    enabled: bool,
}

impl KeywordIndex {
    pub fn new(wm_max_tokens: usize, wm_eviction_importance: f64) -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            wm_max_tokens,
            wm_eviction_importance,
            enabled: true,
        }
    }

    /// An index that ignores every call — used to exercise degradation paths.
    pub fn disabled() -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            wm_max_tokens: 0,
            wm_eviction_importance: 0.0,
            enabled: false,
        }
    }

    // ── Indexing ─────────────────────────────────────────────────────────────

    /// Index a fragment into the keyword, topic, type, and recency keyspaces.
    /// Also records it in the session's emitted set when a session id is
    /// supplied. The hot cache is only filled by [`Self::hot_put`] after a
    /// recall, so link and amend mutations are never served stale.
    pub fn index(&self, fragment: &Fragment, session_id: Option<&str>) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.write();
        for kw in &fragment.keywords {
            state
                .by_keyword
                .entry(kw.clone())
                .or_default()
                .insert(fragment.id.clone());
        }
        state
            .by_topic
            .entry(fragment.topic.clone())
            .or_default()
            .insert(fragment.id.clone());
        state
            .by_type
            .entry(fragment.fragment_type.as_str().to_string())
            .or_default()
            .insert(fragment.id.clone());

        let epoch = chrono::Utc::now().timestamp_millis();
        state.recent.push_back((epoch, fragment.id.clone()));

        if let Some(session) = session_id {
            let entry = state
                .sessions
                .entry(session.to_string())
                .or_insert_with(|| SessionEntry {
                    ids: HashSet::new(),
                    expires: Instant::now() + SESSION_TTL,
                });
            entry.ids.insert(fragment.id.clone());
            entry.expires = Instant::now() + SESSION_TTL;
        }
    }

    /// Remove a fragment from the keyword, topic, type, recency, and hot
    /// keyspaces.
    pub fn deindex(&self, id: &str, keywords: &[String], topic: &str, fragment_type: &str) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.write();
        for kw in keywords {
            if let Some(set) = state.by_keyword.get_mut(kw) {
                set.remove(id);
            }
        }
        if let Some(set) = state.by_topic.get_mut(topic) {
            set.remove(id);
        }
        if let Some(set) = state.by_type.get_mut(fragment_type) {
            set.remove(id);
        }
        state.recent.retain(|(_, rid)| rid != id);
        state.hot.remove(id);
    }

    // ── L1 lookups ───────────────────────────────────────────────────────────

    /// Search by keyword sets. Intersection first; when that yields fewer
    /// than `min_results` and at least two keywords were given, fall back to
    /// the union.
    pub fn search_by_keywords(&self, keywords: &[String], min_results: usize) -> Vec<String> {
        if !self.enabled || keywords.is_empty() {
            return Vec::new();
        }
        let state = self.state.read();

        let sets: Vec<&HashSet<String>> = keywords
            .iter()
            .filter_map(|kw| state.by_keyword.get(kw))
            .collect();
        if sets.is_empty() {
            return Vec::new();
        }

        let mut intersection: HashSet<String> = sets[0].clone();
        for set in &sets[1..] {
            intersection.retain(|id| set.contains(id));
        }

        if intersection.len() >= min_results || keywords.len() < 2 {
            return intersection.into_iter().collect();
        }

        let mut union: HashSet<String> = HashSet::new();
        for set in sets {
            union.extend(set.iter().cloned());
        }
        union.into_iter().collect()
    }

    pub fn by_topic(&self, topic: &str) -> Vec<String> {
        if !self.enabled {
            return Vec::new();
        }
        self.state
            .read()
            .by_topic
            .get(topic)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn by_type(&self, fragment_type: &str) -> Vec<String> {
        if !self.enabled {
            return Vec::new();
        }
        self.state
            .read()
            .by_type
            .get(fragment_type)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Newest `n` fragment ids by insertion order.
    pub fn recent_ids(&self, n: usize) -> Vec<String> {
        if !self.enabled {
            return Vec::new();
        }
        self.state
            .read()
            .recent
            .iter()
            .rev()
            .take(n)
            .map(|(_, id)| id.clone())
            .collect()
    }

    // ── Hot cache ────────────────────────────────────────────────────────────

    /// Fetch a fragment from the hot cache, purging it if expired.
    pub fn hot_get(&self, id: &str) -> Option<Fragment> {
        if !self.enabled {
            return None;
        }
        let mut state = self.state.write();
        let hit = state
            .hot
            .get(id)
            .map(|entry| (entry.expires > Instant::now(), entry.fragment.clone()));
        match hit {
            Some((true, fragment)) => Some(fragment),
            Some((false, _)) => {
                state.hot.remove(id);
                None
            }
            None => None,
        }
    }

    /// Re-materialise fragments after a recall.
    pub fn hot_put(&self, fragments: &[Fragment]) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.write();
        let expires = Instant::now() + HOT_TTL;
        for fragment in fragments {
            state.hot.insert(
                fragment.id.clone(),
                HotEntry {
                    fragment: fragment.clone(),
                    expires,
                },
            );
        }
    }

    // ── Working memory ───────────────────────────────────────────────────────

    /// Append a session-scoped entry, evicting under the token ceiling.
    ///
    /// Eviction drops oldest entries whose importance is at or below the
    /// configured threshold; higher-importance entries survive their turn.
    /// If protected entries alone still exceed the ceiling, the whole queue
    /// rotates out to make room.
    pub fn wm_push(&self, session_id: &str, entry: WorkingMemoryEntry) {
        if !self.enabled {
            return;
        }
        let mut state = self.state.write();
        let queue = state
            .working_memory
            .entry(session_id.to_string())
            .or_default();
        queue.expires = Instant::now() + SESSION_TTL;

        let mut used: usize = queue.entries.iter().map(|e| e.tokens).sum();
        while used + entry.tokens > self.wm_max_tokens && !queue.entries.is_empty() {
            let evictable = queue
                .entries
                .iter()
                .position(|e| e.importance <= self.wm_eviction_importance);
            match evictable {
                Some(pos) => {
                    let removed = queue.entries.remove(pos).expect("position is valid");
                    used -= removed.tokens;
                }
                None => {
                    // Only protected entries left — rotate the whole list
                    queue.entries.clear();
                    used = 0;
                }
            }
        }
        queue.entries.push_back(entry);
    }

    /// Current working-memory entries for a session, oldest first.
    pub fn wm_entries(&self, session_id: &str) -> Vec<WorkingMemoryEntry> {
        if !self.enabled {
            return Vec::new();
        }
        let mut state = self.state.write();
        let snapshot = state.working_memory.get(session_id).map(|queue| {
            (
                queue.expires > Instant::now(),
                queue.entries.iter().cloned().collect::<Vec<_>>(),
            )
        });
        match snapshot {
            Some((true, entries)) => entries,
            Some((false, _)) => {
                state.working_memory.remove(session_id);
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    /// Drop the session's working memory (reflect calls this).
    pub fn wm_clear(&self, session_id: &str) {
        if !self.enabled {
            return;
        }
        self.state.write().working_memory.remove(session_id);
    }

    /// Fragment ids emitted during a session.
    pub fn session_ids(&self, session_id: &str) -> Vec<String> {
        if !self.enabled {
            return Vec::new();
        }
        let mut state = self.state.write();
        let snapshot = state.sessions.get(session_id).map(|entry| {
            (
                entry.expires > Instant::now(),
                entry.ids.iter().cloned().collect::<Vec<_>>(),
            )
        });
        match snapshot {
            Some((true, ids)) => ids,
            Some((false, _)) => {
                state.sessions.remove(session_id);
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    // ── Queues ───────────────────────────────────────────────────────────────

    pub fn enqueue_evaluation(&self, job: EvalJob) {
        if !self.enabled {
            return;
        }
        self.state.write().eval_queue.push_back(job);
    }

    pub fn dequeue_evaluation(&self) -> Option<EvalJob> {
        if !self.enabled {
            return None;
        }
        self.state.write().eval_queue.pop_front()
    }

    pub fn eval_queue_len(&self) -> usize {
        if !self.enabled {
            return 0;
        }
        self.state.read().eval_queue.len()
    }

    pub fn enqueue_pending_contradiction(&self, pair: PendingContradiction) {
        if !self.enabled {
            return;
        }
        self.state.write().pending_contradictions.push_back(pair);
    }

    pub fn dequeue_pending_contradiction(&self) -> Option<PendingContradiction> {
        if !self.enabled {
            return None;
        }
        self.state.write().pending_contradictions.pop_front()
    }

    pub fn pending_contradiction_len(&self) -> usize {
        if !self.enabled {
            return 0;
        }
        self.state.read().pending_contradictions.len()
    }

    // ── Maintenance ──────────────────────────────────────────────────────────

    /// Trim keyword sets above `max_set_size` by removing a random sample of
    /// the excess. Returns the number of removed memberships.
    pub fn prune_keyword_sets(&self, max_set_size: usize) -> usize {
        if !self.enabled {
            return 0;
        }
        let mut rng = rand::thread_rng();
        let mut removed = 0;
        let mut state = self.state.write();
        for set in state.by_keyword.values_mut() {
            if set.len() <= max_set_size {
                continue;
            }
            let excess = set.len() - max_set_size;
            let mut members: Vec<String> = set.iter().cloned().collect();
            members.shuffle(&mut rng);
            for id in members.into_iter().take(excess) {
                set.remove(&id);
                removed += 1;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::{Fragment, FragmentType, TtlTier};

    fn fragment(id: &str, keywords: &[&str], topic: &str, ft: FragmentType) -> Fragment {
        Fragment {
            id: id.to_string(),
            content: format!("content of {id}"),
            topic: topic.to_string(),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            fragment_type: ft,
            importance: 0.5,
            content_hash: format!("{id:>16}").replace(' ', "0"),
            source: None,
            linked_to: Vec::new(),
            agent_id: "default".to_string(),
            access_count: 0,
            accessed_at: None,
            created_at: chrono::Utc::now().to_rfc3339(),
            ttl_tier: TtlTier::Warm,
            estimated_tokens: 10,
            utility_score: 1.0,
            verified_at: chrono::Utc::now().to_rfc3339(),
            is_anchor: false,
        }
    }

    fn index() -> KeywordIndex {
        KeywordIndex::new(500, 0.8)
    }

    fn wm_entry(content: &str, importance: f64, tokens: usize) -> WorkingMemoryEntry {
        WorkingMemoryEntry {
            content: content.to_string(),
            importance,
            tokens,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn keyword_intersection_narrows() {
        let idx = index();
        idx.index(&fragment("frag-a", &["redis", "noauth"], "redis", FragmentType::Error), None);
        idx.index(&fragment("frag-b", &["redis", "cluster"], "redis", FragmentType::Fact), None);

        let hits = idx.search_by_keywords(&["redis".into(), "noauth".into()], 1);
        assert_eq!(hits, vec!["frag-a"]);
    }

    #[test]
    fn keyword_union_fallback_below_min_results() {
        let idx = index();
        idx.index(&fragment("frag-a", &["redis", "noauth"], "redis", FragmentType::Error), None);
        idx.index(&fragment("frag-b", &["redis", "cluster"], "redis", FragmentType::Fact), None);

        // Intersection of {a} ∩ {b} = ∅, union kicks in
        let mut hits = idx.search_by_keywords(&["noauth".into(), "cluster".into()], 1);
        hits.sort();
        assert_eq!(hits, vec!["frag-a", "frag-b"]);
    }

    #[test]
    fn single_keyword_never_falls_back() {
        let idx = index();
        idx.index(&fragment("frag-a", &["redis"], "redis", FragmentType::Fact), None);
        let hits = idx.search_by_keywords(&["postgres".into()], 5);
        assert!(hits.is_empty());
    }

    #[test]
    fn topic_and_type_lookups() {
        let idx = index();
        idx.index(&fragment("frag-a", &["x"], "redis", FragmentType::Error), None);
        idx.index(&fragment("frag-b", &["y"], "redis", FragmentType::Fact), None);

        assert_eq!(idx.by_topic("redis").len(), 2);
        assert_eq!(idx.by_type("error"), vec!["frag-a"]);
        assert!(idx.by_topic("pgvector").is_empty());
    }

    #[test]
    fn recent_returns_newest_first() {
        let idx = index();
        idx.index(&fragment("frag-a", &["x"], "t", FragmentType::Fact), None);
        idx.index(&fragment("frag-b", &["y"], "t", FragmentType::Fact), None);
        idx.index(&fragment("frag-c", &["z"], "t", FragmentType::Fact), None);

        let recent = idx.recent_ids(2);
        assert_eq!(recent, vec!["frag-c", "frag-b"]);
    }

    #[test]
    fn deindex_removes_everywhere() {
        let idx = index();
        let f = fragment("frag-a", &["redis"], "redis", FragmentType::Error);
        idx.index(&f, None);
        idx.deindex(&f.id, &f.keywords, &f.topic, f.fragment_type.as_str());

        assert!(idx.search_by_keywords(&["redis".into()], 1).is_empty());
        assert!(idx.by_topic("redis").is_empty());
        assert!(idx.by_type("error").is_empty());
        assert!(idx.recent_ids(10).is_empty());
        assert!(idx.hot_get("frag-a").is_none());
    }

    #[test]
    fn hot_cache_serves_materialised_fragments() {
        let idx = index();
        let f = fragment("frag-a", &["x"], "t", FragmentType::Fact);
        idx.index(&f, None);
        // Indexing alone does not materialise; a recall does
        assert!(idx.hot_get("frag-a").is_none());
        idx.hot_put(std::slice::from_ref(&f));
        let hit = idx.hot_get("frag-a").unwrap();
        assert_eq!(hit.content, f.content);
    }

    #[test]
    fn session_set_records_emitted_ids() {
        let idx = index();
        idx.index(&fragment("frag-a", &["x"], "t", FragmentType::Fact), Some("sess-1"));
        idx.index(&fragment("frag-b", &["y"], "t", FragmentType::Fact), Some("sess-1"));
        idx.index(&fragment("frag-c", &["z"], "t", FragmentType::Fact), Some("sess-2"));

        let mut ids = idx.session_ids("sess-1");
        ids.sort();
        assert_eq!(ids, vec!["frag-a", "frag-b"]);
        assert!(idx.session_ids("sess-9").is_empty());
    }

    #[test]
    fn wm_evicts_oldest_low_importance_first() {
        let idx = KeywordIndex::new(100, 0.8);
        idx.wm_push("s", wm_entry("first", 0.5, 40));
        idx.wm_push("s", wm_entry("second", 0.5, 40));
        // 40 + 40 + 40 > 100 — "first" is evicted
        idx.wm_push("s", wm_entry("third", 0.5, 40));

        let entries = idx.wm_entries("s");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].content, "second");
        assert_eq!(entries[1].content, "third");
    }

    #[test]
    fn wm_protects_high_importance_entries() {
        let idx = KeywordIndex::new(100, 0.8);
        idx.wm_push("s", wm_entry("keep-me", 0.95, 40));
        idx.wm_push("s", wm_entry("droppable", 0.5, 40));
        idx.wm_push("s", wm_entry("new", 0.5, 40));

        let entries = idx.wm_entries("s");
        let contents: Vec<&str> = entries.iter().map(|e| e.content.as_str()).collect();
        assert!(contents.contains(&"keep-me"));
        assert!(!contents.contains(&"droppable"));
    }

    #[test]
    fn wm_rotates_when_only_protected_entries_remain() {
        let idx = KeywordIndex::new(100, 0.8);
        idx.wm_push("s", wm_entry("anchor-1", 0.95, 60));
        idx.wm_push("s", wm_entry("anchor-2", 0.95, 39));
        // Nothing evictable and over budget — whole list rotates
        idx.wm_push("s", wm_entry("fresh", 0.5, 60));

        let entries = idx.wm_entries("s");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "fresh");
    }

    #[test]
    fn wm_clear_empties_session() {
        let idx = index();
        idx.wm_push("s", wm_entry("a", 0.5, 10));
        idx.wm_clear("s");
        assert!(idx.wm_entries("s").is_empty());
    }

    #[test]
    fn queues_are_fifo() {
        let idx = index();
        idx.enqueue_evaluation(EvalJob {
            fragment_id: "frag-a".into(),
            agent_id: "default".into(),
            fragment_type: "decision".into(),
            content: "first".into(),
        });
        idx.enqueue_evaluation(EvalJob {
            fragment_id: "frag-b".into(),
            agent_id: "default".into(),
            fragment_type: "decision".into(),
            content: "second".into(),
        });

        assert_eq!(idx.eval_queue_len(), 2);
        assert_eq!(idx.dequeue_evaluation().unwrap().fragment_id, "frag-a");
        assert_eq!(idx.dequeue_evaluation().unwrap().fragment_id, "frag-b");
        assert!(idx.dequeue_evaluation().is_none());
    }

    #[test]
    fn pruning_caps_oversized_sets() {
        let idx = index();
        for i in 0..50 {
            idx.index(
                &fragment(&format!("frag-{i:03}"), &["common"], "t", FragmentType::Fact),
                None,
            );
        }
        let removed = idx.prune_keyword_sets(30);
        assert_eq!(removed, 20);
        assert_eq!(idx.search_by_keywords(&["common".into()], 1).len(), 30);
    }

    #[test]
    fn disabled_index_noops_everything() {
        let idx = KeywordIndex::disabled();
        idx.index(&fragment("frag-a", &["x"], "t", FragmentType::Fact), Some("s"));
        idx.wm_push("s", wm_entry("a", 0.5, 10));
        idx.enqueue_evaluation(EvalJob {
            fragment_id: "frag-a".into(),
            agent_id: "default".into(),
            fragment_type: "decision".into(),
            content: "x".into(),
        });

        assert!(idx.search_by_keywords(&["x".into()], 1).is_empty());
        assert!(idx.recent_ids(10).is_empty());
        assert!(idx.wm_entries("s").is_empty());
        assert!(idx.dequeue_evaluation().is_none());
        assert_eq!(idx.prune_keyword_sets(1), 0);
    }
}
