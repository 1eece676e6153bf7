use std::sync::LazyLock;

use regex::Regex;
use regex::RegexBuilder;

/// Phrases that indicate the model declined because it believes it has no
/// browsing capability. Matching any of these (case-insensitively) makes
/// the reply a candidate for a synthetic `web_fetch` follow-up.
static REFUSAL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"i (do|don't|cannot) have (browser|browsing|internet) (capability|access)",
        r"cannot look up information",
        r"no web browsing capability",
        r"can'?t (access|reach) the internet",
        r"(do not|don't) have access to .*web (?:browsing|browser|internet)",
        r"(do not|don't) have .*browser",
        r"web(fetch|_fetch| search).*(not available|disabled|unavailable)",
        r"tool.*(not available|disabled|unavailable)",
        r"don't have access to real-time",
    ]
    .iter()
    .map(|pattern| {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .unwrap_or_else(|e| panic!("invalid web fallback pattern: {e}"))
    })
    .collect()
});

/// Concrete financial phrasing suppresses the fallback: a reply that quotes
/// real market data was not a capability refusal.
static FINANCIAL_PHRASES: &[&str] = &[
    "closed at $",
    "previous close",
    "day's range",
    "trading volume",
];

/// Whether the assistant text should trigger a synthetic `web_fetch`.
pub fn triggers_web_fallback(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    let lowered = text.to_lowercase();
    if FINANCIAL_PHRASES
        .iter()
        .any(|phrase| lowered.contains(phrase))
    {
        return false;
    }
    REFUSAL_PATTERNS.iter().any(|pattern| pattern.is_match(text))
}
