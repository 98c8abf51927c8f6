pub mod remote;

use anyhow::Result;

/// Trait for embedding text into vectors.
///
/// Implementations produce L2-normalized vectors of exactly `dimensions()`
/// entries. All methods are synchronous — callers in async contexts should
/// use `tokio::task::spawn_blocking`.
///
/// Embedding is best-effort everywhere it is used: a provider failure means
/// the fragment is stored without a vector and stays invisible to the
/// semantic tier until the backfill stage retries.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text string into a unit vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Return the number of dimensions this provider produces.
    fn dimensions(&self) -> usize;

    /// Whether the provider is configured at all. `false` short-circuits
    /// every call site without logging a failure.
    fn enabled(&self) -> bool {
        true
    }
}

/// A provider that is permanently absent. Fragments never get embeddings and
/// the semantic tier stays silent.
pub struct NoEmbeddingProvider;

impl EmbeddingProvider for NoEmbeddingProvider {
    fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        anyhow::bail!("embedding provider not configured")
    }

    fn dimensions(&self) -> usize {
        0
    }

    fn enabled(&self) -> bool {
        false
    }
}

/// Create an embedding provider from config.
///
/// `"remote"` targets an OpenAI-compatible `/embeddings` endpoint;
/// `"none"` disables the semantic tier entirely.
pub fn create_provider(
    config: &crate::config::EmbeddingConfig,
) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "remote" => Ok(Box::new(remote::RemoteEmbeddingProvider::new(config)?)),
        "none" => Ok(Box::new(NoEmbeddingProvider)),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: remote, none"),
    }
}

/// Prepare free text for query embedding: strip frontmatter, collapse code
/// blocks, flatten markdown links, drop HTML tags, trim, and cap the length
/// at roughly 8k tokens worth of characters.
pub fn prepare_text(text: &str) -> String {
    const MAX_CHARS: usize = 32_000; // ~8k tokens at 4 chars/token

    let mut s = text.trim();

    // Strip YAML frontmatter fence
    if let Some(rest) = s.strip_prefix("---") {
        if let Some(end) = rest.find("\n---") {
            s = rest[end + 4..].trim_start();
        }
    }

    let mut out = String::with_capacity(s.len().min(MAX_CHARS));
    let mut in_code_block = false;
    for line in s.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            if !in_code_block {
                out.push_str("[code]\n");
            }
            in_code_block = !in_code_block;
            continue;
        }
        if in_code_block {
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }

    // Flatten [label](url) to label, drop HTML tags
    let flattened = flatten_markdown_links(&out);
    let stripped = strip_html_tags(&flattened);

    let trimmed = stripped.trim();
    if trimmed.chars().count() > MAX_CHARS {
        trimmed.chars().take(MAX_CHARS).collect()
    } else {
        trimmed.to_string()
    }
}

fn flatten_markdown_links(text: &str) -> String {
    use regex::Regex;
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").expect("valid regex"));
    re.replace_all(text, "$1").into_owned()
}

fn strip_html_tags(text: &str) -> String {
    use regex::Regex;
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"</?[A-Za-z][^>]*>").expect("valid regex"));
    re.replace_all(text, "").into_owned()
}

/// L2-normalize a vector. Returns a zero vector if the input norm is zero.
pub fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}
