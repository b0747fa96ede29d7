//! Scrubs credential-looking fragments from messages shown to users.

use std::sync::OnceLock;

use regex::Regex;

const REDACTED: &str = "[REDACTED]";

fn patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let rules: [(&str, &'static str); 4] = [
            // key=value / key: value for well known secret names
            (
                r"(?i)\b(password|passwd|pwd|secret|token|api[_-]?key|access[_-]?key|auth)(\s*[=:]\s*)([^\s,;&]+)",
                "${1}${2}[REDACTED]",
            ),
            (r"(?i)\bbearer\s+[A-Za-z0-9._~+/=-]+", "Bearer [REDACTED]"),
            // userinfo in URLs
            (r"([a-zA-Z][a-zA-Z0-9+.-]*://)[^/\s:@]+:[^/\s@]+@", "${1}[REDACTED]@"),
            (r"\bAKIA[0-9A-Z]{16}\b", REDACTED),
        ];
        rules
            .into_iter()
            .map(|(pattern, replacement)| {
                (
                    Regex::new(pattern).expect("redaction pattern is valid"),
                    replacement,
                )
            })
            .collect()
    })
}

/// Returns `message` with anything resembling a credential replaced.
pub fn redact_credentials(message: &str) -> String {
    let mut out = message.to_string();
    for (regex, replacement) in patterns() {
        out = regex.replace_all(&out, *replacement).into_owned();
    }
    out
}
