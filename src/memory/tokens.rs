//! Token estimation for fragment content and budget accounting.
//!
//! Uses a HuggingFace tokenizer file when one is present in the model cache
//! directory, falling back to `ceil(chars / 4)`. A failed tokenizer load is
//! logged once and the counter degrades silently for the rest of the process.

use std::path::Path;
use std::sync::Once;

use tokenizers::Tokenizer;

static INIT_FAILURE_LOGGED: Once = Once::new();

/// Process-wide token counter. Cheap to clone behind an `Arc`.
pub struct TokenCounter {
    tokenizer: Option<Tokenizer>,
}

impl TokenCounter {
    /// Try to load `tokenizer.json` from the cache directory; fall back to
    /// the character heuristic when the file is missing or malformed.
    pub fn from_cache_dir(cache_dir: &Path) -> Self {
        let path = cache_dir.join("tokenizer.json");
        if !path.exists() {
            return Self { tokenizer: None };
        }
        match Tokenizer::from_file(&path) {
            Ok(tok) => Self {
                tokenizer: Some(tok),
            },
            Err(e) => {
                INIT_FAILURE_LOGGED.call_once(|| {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "tokenizer load failed — using chars/4 approximation"
                    );
                });
                Self { tokenizer: None }
            }
        }
    }

    /// A counter that always uses the character heuristic.
    pub fn approximate() -> Self {
        Self { tokenizer: None }
    }

    /// Estimate the token count of `text`. Never fails.
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        if let Some(tok) = &self.tokenizer {
            if let Ok(encoding) = tok.encode(text, false) {
                return encoding.get_ids().len().max(1);
            }
        }
        approx_tokens(text)
    }
}

/// `ceil(chars / 4)` — the degraded estimate. Counts chars, not bytes, so
/// CJK text is not overcounted.
pub fn approx_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    text.chars().count().div_ceil(4).max(1)
}

/// Characters that fit in a token budget under the chars-per-token ratio
/// used everywhere budgets are expressed (chars = 4 × tokens).
pub fn chars_for_tokens(tokens: usize) -> usize {
    tokens * 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approximation_is_ceil_chars_over_four() {
        assert_eq!(approx_tokens(""), 0);
        assert_eq!(approx_tokens("a"), 1);
        assert_eq!(approx_tokens("abcd"), 1);
        assert_eq!(approx_tokens("abcde"), 2);
        let hundred = "x".repeat(100);
        assert_eq!(approx_tokens(&hundred), 25);
    }

    #[test]
    fn approximation_counts_chars_not_bytes() {
        // 9 Hangul chars = 27 bytes; char-based estimate is 3, not 7
        assert_eq!(approx_tokens("메모리조각저장소야"), 3);
    }

    #[test]
    fn counter_without_tokenizer_falls_back() {
        let counter = TokenCounter::approximate();
        assert_eq!(counter.count("abcdefgh"), 2);
        assert_eq!(counter.count(""), 0);
    }

    #[test]
    fn missing_cache_dir_degrades_silently() {
        let counter = TokenCounter::from_cache_dir(Path::new("/nonexistent/nowhere"));
        assert_eq!(counter.count("abcd"), 1);
    }

    #[test]
    fn budget_char_conversion() {
        assert_eq!(chars_for_tokens(500), 2000);
    }
}
