//! Fragment construction — the single ingress point for new records.
//!
//! [`FragmentFactory::create`] runs the full pipeline: PII redaction,
//! truncation to the content cap, content hashing over the redacted truncated
//! form, tier inference, keyword extraction, and token estimation. The
//! factory is pure; persistence happens in [`store`](super::store).

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::keywords::{extract_keywords, normalize_keywords};
use super::redact::redact;
use super::tokens::TokenCounter;
use super::types::{Fragment, FragmentType, TtlTier};

/// Maximum content length in characters, ellipsis included.
pub const MAX_CONTENT_CHARS: usize = 300;

/// Inputs for [`FragmentFactory::create`].
pub struct CreateParams {
    pub content: String,
    pub topic: String,
    pub fragment_type: FragmentType,
    /// Caller-supplied keywords; auto-extracted when `None` or empty.
    pub keywords: Option<Vec<String>>,
    /// Defaults to the type's table value when `None`. Clamped to `[0, 1]`.
    pub importance: Option<f64>,
    pub source: Option<String>,
    pub agent_id: String,
    pub is_anchor: bool,
}

/// Stateless fragment constructor. Holds only the token counter.
pub struct FragmentFactory {
    tokens: Arc<TokenCounter>,
}

impl FragmentFactory {
    pub fn new(tokens: Arc<TokenCounter>) -> Self {
        Self { tokens }
    }

    /// Build a fragment record: redact → truncate → hash → infer tier →
    /// extract keywords → count tokens.
    pub fn create(&self, params: CreateParams, now: DateTime<Utc>) -> Fragment {
        let content = truncate_content(&redact(&params.content));
        let content_hash = content_hash(&content);

        let importance = params
            .importance
            .unwrap_or_else(|| params.fragment_type.default_importance())
            .clamp(0.0, 1.0);

        let keywords = match params.keywords {
            Some(ref kws) if !kws.is_empty() => normalize_keywords(kws),
            _ => extract_keywords(&content),
        };

        let ttl_tier = infer_tier(params.fragment_type, importance);
        let estimated_tokens = self.tokens.count(&content);
        let now_str = now.to_rfc3339();

        Fragment {
            id: new_fragment_id(),
            content,
            topic: params.topic,
            keywords,
            fragment_type: params.fragment_type,
            importance,
            content_hash,
            source: params.source,
            linked_to: Vec::new(),
            agent_id: params.agent_id,
            access_count: 0,
            accessed_at: None,
            created_at: now_str.clone(),
            ttl_tier,
            estimated_tokens,
            utility_score: 1.0,
            verified_at: now_str,
            is_anchor: params.is_anchor,
        }
    }

    /// Split a longer text into a chain of fragments, each within the content
    /// cap, with every fragment after the first carrying its predecessor in
    /// `linked_to`. Chunks break on whitespace where possible.
    pub fn split(&self, text: &str, params: CreateParams, now: DateTime<Utc>) -> Vec<Fragment> {
        let redacted = redact(text);
        let chunks = chunk_text(&redacted, MAX_CONTENT_CHARS);

        let mut fragments: Vec<Fragment> = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let mut fragment = self.create(
                CreateParams {
                    content: chunk,
                    topic: params.topic.clone(),
                    fragment_type: params.fragment_type,
                    keywords: None,
                    importance: params.importance,
                    source: params.source.clone(),
                    agent_id: params.agent_id.clone(),
                    is_anchor: params.is_anchor,
                },
                now,
            );
            if let Some(prev) = fragments.last() {
                fragment.linked_to.push(prev.id.clone());
            }
            fragments.push(fragment);
        }
        fragments
    }
}

/// Allocate a fragment id: `frag-<16 hex>`.
pub fn new_fragment_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("frag-{}", &hex[..16])
}

/// 16-hex prefix of SHA-256 over the redacted, truncated content.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Tier inference, first match wins.
pub fn infer_tier(fragment_type: FragmentType, importance: f64) -> TtlTier {
    if fragment_type == FragmentType::Preference {
        TtlTier::Permanent
    } else if importance >= 0.8 {
        TtlTier::Permanent
    } else if matches!(fragment_type, FragmentType::Error | FragmentType::Procedure) {
        TtlTier::Hot
    } else if importance >= 0.5 {
        TtlTier::Warm
    } else {
        TtlTier::Cold
    }
}

/// Truncate to the content cap, appending `…` when anything was cut.
fn truncate_content(content: &str) -> String {
    let content = content.trim();
    if content.chars().count() <= MAX_CONTENT_CHARS {
        return content.to_string();
    }
    let kept: String = content.chars().take(MAX_CONTENT_CHARS - 1).collect();
    format!("{}…", kept.trim_end())
}

/// Break text into chunks of at most `max_chars`, preferring whitespace
/// boundaries so words are not split mid-way.
fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let remaining = chars.len() - start;
        if remaining <= max_chars {
            chunks.push(chars[start..].iter().collect::<String>().trim().to_string());
            break;
        }

        // Look backwards from the hard cap for a whitespace break point
        let hard_end = start + max_chars;
        let mut end = hard_end;
        for i in (start + max_chars / 2..hard_end).rev() {
            if chars[i].is_whitespace() {
                end = i;
                break;
            }
        }

        chunks.push(chars[start..end].iter().collect::<String>().trim().to_string());
        start = end;
        // Skip the whitespace we broke on
        while start < chars.len() && chars[start].is_whitespace() {
            start += 1;
        }
    }

    chunks.retain(|c| !c.is_empty());
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> FragmentFactory {
        FragmentFactory::new(Arc::new(TokenCounter::approximate()))
    }

    fn params(content: &str, fragment_type: FragmentType) -> CreateParams {
        CreateParams {
            content: content.to_string(),
            topic: "testing".to_string(),
            fragment_type,
            keywords: None,
            importance: None,
            source: None,
            agent_id: "default".to_string(),
            is_anchor: false,
        }
    }

    #[test]
    fn create_applies_type_defaults() {
        let f = factory().create(params("Redis NOAUTH means no password.", FragmentType::Error), Utc::now());
        assert!(f.id.starts_with("frag-"));
        assert_eq!(f.importance, 0.9);
        assert_eq!(f.ttl_tier, TtlTier::Hot);
        assert_eq!(f.utility_score, 1.0);
        assert_eq!(f.access_count, 0);
        assert!(f.accessed_at.is_none());
        assert!(!f.keywords.is_empty());
    }

    #[test]
    fn tier_inference_first_match_wins() {
        assert_eq!(infer_tier(FragmentType::Preference, 0.1), TtlTier::Permanent);
        assert_eq!(infer_tier(FragmentType::Fact, 0.85), TtlTier::Permanent);
        assert_eq!(infer_tier(FragmentType::Error, 0.6), TtlTier::Hot);
        assert_eq!(infer_tier(FragmentType::Procedure, 0.2), TtlTier::Hot);
        assert_eq!(infer_tier(FragmentType::Fact, 0.5), TtlTier::Warm);
        assert_eq!(infer_tier(FragmentType::Fact, 0.2), TtlTier::Cold);
    }

    #[test]
    fn content_is_redacted_before_hashing() {
        let f1 = factory().create(
            params("reach me at alice@example.com", FragmentType::Fact),
            Utc::now(),
        );
        let f2 = factory().create(
            params("reach me at bob@example.org", FragmentType::Fact),
            Utc::now(),
        );
        assert_eq!(f1.content, "reach me at [REDACTED_EMAIL]");
        // Different originals, identical redacted forms — identical hashes
        assert_eq!(f1.content_hash, f2.content_hash);
    }

    #[test]
    fn long_content_is_truncated_with_ellipsis() {
        let long = "word ".repeat(120);
        let f = factory().create(params(&long, FragmentType::Fact), Utc::now());
        assert!(f.content.chars().count() <= MAX_CONTENT_CHARS);
        assert!(f.content.ends_with('…'));
    }

    #[test]
    fn hash_is_stable_across_recreation() {
        let now = Utc::now();
        let f1 = factory().create(params("stable content", FragmentType::Fact), now);
        let f2 = factory().create(params("stable content", FragmentType::Fact), now);
        assert_eq!(f1.content_hash, f2.content_hash);
        assert_ne!(f1.id, f2.id);
        assert_eq!(f1.content_hash.len(), 16);
    }

    #[test]
    fn caller_keywords_are_normalized_not_extracted() {
        let mut p = params("some content here", FragmentType::Fact);
        p.keywords = Some(vec!["Redis".into(), "NOAUTH".into(), "redis".into()]);
        let f = factory().create(p, Utc::now());
        assert_eq!(f.keywords, vec!["redis", "noauth"]);
    }

    #[test]
    fn importance_is_clamped() {
        let mut p = params("clamped", FragmentType::Fact);
        p.importance = Some(1.7);
        let f = factory().create(p, Utc::now());
        assert_eq!(f.importance, 1.0);
    }

    #[test]
    fn split_chains_fragments_in_order() {
        let text = "sentence one is here. ".repeat(40); // ~880 chars
        let fragments = factory().split(&text, params("", FragmentType::Fact), Utc::now());
        assert!(fragments.len() >= 3);
        for f in &fragments {
            assert!(f.content.chars().count() <= MAX_CONTENT_CHARS);
        }
        assert!(fragments[0].linked_to.is_empty());
        for i in 1..fragments.len() {
            assert_eq!(fragments[i].linked_to, vec![fragments[i - 1].id.clone()]);
        }
    }

    #[test]
    fn split_short_text_is_single_fragment() {
        let fragments = factory().split("just one short note", params("", FragmentType::Fact), Utc::now());
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].linked_to.is_empty());
    }
}
