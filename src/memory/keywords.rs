//! Keyword auto-extraction for fragments stored without explicit keywords.
//!
//! Lowercases, splits on non-alphanumeric boundaries (Unicode-aware, so
//! Hangul survives intact), drops a fixed bilingual stopword set, ranks by
//! term frequency, and returns the top five.

use std::collections::HashMap;

/// How many keywords extraction returns.
const TOP_K: usize = 5;

/// English + Korean stopwords dropped before frequency ranking.
const STOPWORDS: &[&str] = &[
    // English
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from",
    "has", "have", "in", "into", "is", "it", "its", "not", "of", "on", "or",
    "that", "the", "this", "to", "use", "was", "were", "when", "will", "with",
    // Korean particles and fillers
    "그", "그리고", "것", "수", "있다", "없다", "하다", "이", "가", "을", "를",
    "은", "는", "에", "에서", "의", "와", "과", "도", "로", "으로", "하는",
    "해야", "있는", "된다",
];

fn is_stopword(term: &str) -> bool {
    STOPWORDS.contains(&term)
}

/// Extract up to five keywords from `content` by term frequency.
///
/// Single-character Latin tokens are noise and are dropped; single-character
/// Hangul/CJK tokens are kept (they carry a full syllable of meaning).
pub fn extract_keywords(content: &str) -> Vec<String> {
    let lowered = content.to_lowercase();

    let mut freq: HashMap<&str, usize> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();

    for term in lowered.split(|c: char| !c.is_alphanumeric()) {
        if term.is_empty() || is_stopword(term) {
            continue;
        }
        if term.chars().count() == 1 && term.is_ascii() {
            continue;
        }
        let counter = freq.entry(term).or_insert(0);
        if *counter == 0 {
            order.push(term);
        }
        *counter += 1;
    }

    // Stable ranking: frequency desc, then first appearance
    let mut ranked: Vec<&str> = order;
    ranked.sort_by(|a, b| freq[b].cmp(&freq[a]));
    ranked.truncate(TOP_K);
    ranked.into_iter().map(str::to_string).collect()
}

/// Normalise caller-supplied keywords: lowercase, dedup, preserve order.
pub fn normalize_keywords(keywords: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for kw in keywords {
        let k = kw.trim().to_lowercase();
        if !k.is_empty() && seen.insert(k.clone()) {
            out.push(k);
        }
    }
    out
}
