//! Core fragment type definitions.
//!
//! Defines [`FragmentType`] (the six knowledge categories), [`TtlTier`]
//! (lifecycle buckets), [`RelationType`] (graph edges), [`AgentScope`]
//! (row visibility), [`Fragment`] (a full record), and the auxiliary records
//! for links, versions, and feedback.

use serde::{Deserialize, Serialize};

/// The six fragment types. The type drives default importance, the initial
/// TTL tier, evaluator eligibility, and staleness thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentType {
    /// Plain knowledge — slow decay, moderate default importance.
    Fact,
    /// A choice that was made and why — promoted to permanent early.
    Decision,
    /// A failure and its context — hot tier, high importance.
    Error,
    /// A standing user/agent preference — permanent, near-max importance.
    Preference,
    /// A how-to or runbook step — hot tier.
    Procedure,
    /// A statement about how two things relate.
    Relation,
}

impl FragmentType {
    pub const ALL: [FragmentType; 6] = [
        Self::Fact,
        Self::Decision,
        Self::Error,
        Self::Preference,
        Self::Procedure,
        Self::Relation,
    ];

    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fact => "fact",
            Self::Decision => "decision",
            Self::Error => "error",
            Self::Preference => "preference",
            Self::Procedure => "procedure",
            Self::Relation => "relation",
        }
    }

    /// Default importance when the caller does not supply one.
    pub fn default_importance(&self) -> f64 {
        match self {
            Self::Preference => 0.95,
            Self::Error => 0.9,
            Self::Decision => 0.8,
            Self::Procedure => 0.7,
            Self::Relation => 0.6,
            Self::Fact => 0.5,
        }
    }

    /// Types that carry their own provenance discipline and are never sent
    /// to the LLM evaluator.
    pub fn excluded_from_evaluation(&self) -> bool {
        matches!(self, Self::Fact | Self::Procedure | Self::Error)
    }
}

impl std::fmt::Display for FragmentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FragmentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fact" => Ok(Self::Fact),
            "decision" => Ok(Self::Decision),
            "error" => Ok(Self::Error),
            "preference" => Ok(Self::Preference),
            "procedure" => Ok(Self::Procedure),
            "relation" => Ok(Self::Relation),
            _ => Err(format!("unknown fragment type: {s}")),
        }
    }
}

/// Lifecycle bucket governing decay and eviction eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtlTier {
    Hot,
    Warm,
    Cold,
    /// Exempt from the expiration sweep. Deleting requires force.
    Permanent,
}

impl TtlTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
            Self::Permanent => "permanent",
        }
    }
}

impl std::fmt::Display for TtlTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TtlTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hot" => Ok(Self::Hot),
            "warm" => Ok(Self::Warm),
            "cold" => Ok(Self::Cold),
            "permanent" => Ok(Self::Permanent),
            _ => Err(format!("unknown ttl tier: {s}")),
        }
    }
}

/// Directed, typed edge between two fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    Related,
    CausedBy,
    ResolvedBy,
    PartOf,
    Contradicts,
    SupersededBy,
}

impl RelationType {
    pub const ALL: [RelationType; 6] = [
        Self::Related,
        Self::CausedBy,
        Self::ResolvedBy,
        Self::PartOf,
        Self::Contradicts,
        Self::SupersededBy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Related => "related",
            Self::CausedBy => "caused_by",
            Self::ResolvedBy => "resolved_by",
            Self::PartOf => "part_of",
            Self::Contradicts => "contradicts",
            Self::SupersededBy => "superseded_by",
        }
    }

    /// Ordering used when link-expanding search results: resolutions first,
    /// then causes, then everything else.
    pub fn fetch_priority(&self) -> u8 {
        match self {
            Self::ResolvedBy => 0,
            Self::CausedBy => 1,
            _ => 2,
        }
    }
}

impl std::fmt::Display for RelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RelationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "related" => Ok(Self::Related),
            "caused_by" => Ok(Self::CausedBy),
            "resolved_by" => Ok(Self::ResolvedBy),
            "part_of" => Ok(Self::PartOf),
            "contradicts" => Ok(Self::Contradicts),
            "superseded_by" => Ok(Self::SupersededBy),
            _ => Err(format!("unknown relation type: {s}")),
        }
    }
}

/// Identifier of the shared pool every agent can read and write.
pub const SHARED_POOL: &str = "default";

/// Row-visibility scope carried through every store call.
///
/// A fragment is visible iff its `agent_id` equals the caller's agent, equals
/// the shared pool, or the caller holds the maintenance scope (sweeps,
/// consolidation, the evaluator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentScope {
    Agent(String),
    Maintenance,
}

impl AgentScope {
    pub fn agent(id: impl Into<String>) -> Self {
        Self::Agent(id.into())
    }

    /// The agent id new rows are written under.
    pub fn owner(&self) -> &str {
        match self {
            Self::Agent(id) => id,
            Self::Maintenance => SHARED_POOL,
        }
    }

    pub fn is_maintenance(&self) -> bool {
        matches!(self, Self::Maintenance)
    }

    /// Whether a row owned by `owner` is visible under this scope.
    pub fn admits(&self, owner: &str) -> bool {
        match self {
            Self::Maintenance => true,
            Self::Agent(id) => owner == id || owner == SHARED_POOL,
        }
    }
}

/// A fragment record, matching the `fragments` table schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    /// Stable identifier, `frag-<16 hex>`.
    pub id: String,
    /// Redacted, truncated content (≤ 300 chars + ellipsis marker).
    pub content: String,
    /// Free-form categorical label, scoped per agent.
    pub topic: String,
    /// Unique lowercase terms; auto-extracted when the caller omits them.
    pub keywords: Vec<String>,
    #[serde(rename = "type")]
    pub fragment_type: FragmentType,
    /// Importance in `[0, 1]`; decays unless anchored/permanent.
    pub importance: f64,
    /// 16-hex prefix of SHA-256 over the redacted, truncated content.
    pub content_hash: String,
    /// Optional provenance string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Mirror of outgoing edges for fast one-hop fetch. Materialisation of
    /// the edge table; never authoritative.
    pub linked_to: Vec<String>,
    /// Owner scope key; `"default"` is the shared pool.
    pub agent_id: String,
    pub access_count: u32,
    /// RFC 3339 timestamp of the last retrieval, or `None` if never accessed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accessed_at: Option<String>,
    pub created_at: String,
    pub ttl_tier: TtlTier,
    pub estimated_tokens: usize,
    /// `importance * (1 + ln(max(access_count, 1)))`, recomputed by the
    /// consolidator.
    pub utility_score: f64,
    /// Last quality-check timestamp; drives stale annotation.
    pub verified_at: String,
    /// Anchored fragments are exempt from decay, demotion, and expiry.
    pub is_anchor: bool,
}

impl Fragment {
    /// Whether the consolidator may lower importance, demote, or delete.
    pub fn is_protected(&self) -> bool {
        self.is_anchor || self.ttl_tier == TtlTier::Permanent
    }
}

/// A directed, typed edge between two fragments (one `fragment_links` row).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentLink {
    pub from_id: String,
    pub to_id: String,
    pub relation_type: RelationType,
    pub created_at: String,
}

/// Pre-amendment snapshot (one `fragment_versions` row). Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentVersion {
    pub fragment_id: String,
    pub content: String,
    pub topic: String,
    pub keywords: Vec<String>,
    #[serde(rename = "type")]
    pub fragment_type: FragmentType,
    pub importance: f64,
    pub amended_at: String,
    pub amended_by: String,
}

/// Per-tool feedback left by an agent (one `tool_feedback` row).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFeedback {
    pub tool_name: String,
    pub relevant: bool,
    pub sufficient: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// `"sampled"` or `"voluntary"`.
    pub trigger_type: String,
    pub created_at: String,
}

/// Whole-task feedback recorded by `reflect` (one `task_feedback` row).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFeedback {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub overall_success: bool,
    pub tool_highlights: Vec<String>,
    pub tool_pain_points: Vec<String>,
    pub created_at: String,
}

/// A fragment in a recall response, carrying retrieval metadata.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredFragment {
    #[serde(flatten)]
    pub fragment: Fragment,
    /// Cosine similarity when the fragment came through L3.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
    /// Set when `now − verified_at` exceeds the per-type staleness window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale: Option<StaleInfo>,
}

/// Stale-annotation metadata attached to recall results.
#[derive(Debug, Clone, Serialize)]
pub struct StaleInfo {
    pub stale: bool,
    pub warning: String,
    pub days_since_verification: i64,
}

/// Response from `recall`.
#[derive(Debug, Serialize)]
pub struct RecallResult {
    pub fragments: Vec<ScoredFragment>,
    /// Sum of `estimated_tokens` over the returned fragments.
    pub total_tokens: usize,
    /// Human-readable trace, e.g. `"L1:3 → HotCache:1 → L2:2"`.
    pub search_path: String,
    pub count: usize,
}

/// Validate a fragment id of the form `frag-<16 hex>`.
pub fn is_valid_fragment_id(id: &str) -> bool {
    match id.strip_prefix("frag-") {
        Some(hex) => hex.len() == 16 && hex.bytes().all(|b| b.is_ascii_hexdigit()),
        None => false,
    }
}
