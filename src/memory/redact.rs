//! PII redaction applied to fragment content at ingress.
//!
//! Four ordered substitutions: API keys, emails, password assignments
//! (English and Korean keywords), and Korean mobile numbers. Redaction is
//! destructive — originals are never stored — and idempotent, so re-running
//! the pipeline over already-redacted text is a no-op.

use regex::Regex;
use std::sync::OnceLock;

fn api_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(sk-[A-Za-z0-9]{32,}|AIza[0-9A-Za-z_-]{35})").expect("valid regex")
    })
}

fn email_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("valid regex")
    })
}

fn password_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(password|passwd|pwd|비밀번호|비번)\s*[:=]\s*\S+").expect("valid regex")
    })
}

fn korean_mobile_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"01[016789][-\s]?\d{3,4}[-\s]?\d{4}").expect("valid regex")
    })
}

/// Apply the four ordered substitutions to `content`.
///
/// Topic, keywords, and source are never redacted — only content.
pub fn redact(content: &str) -> String {
    let s = api_key_re().replace_all(content, "[REDACTED_API_KEY]");
    let s = email_re().replace_all(&s, "[REDACTED_EMAIL]");
    let s = password_re().replace_all(&s, |caps: &regex::Captures<'_>| {
        format!("{}: [REDACTED_PWD]", &caps[1])
    });
    let s = korean_mobile_re().replace_all(&s, "[REDACTED_PHONE]");
    s.into_owned()
}
