use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // Connection-string pairs: `Password=...;`, `Pwd=...`, `User Id=...`.
        Regex::new(r#"(?i)\b(password|pwd|user\s?id|uid|access\s?token)\s*=\s*("[^"]*"|'[^']*'|[^;\s]+)"#)
            .expect("valid regex"),
        Regex::new(r#"(?i)(api[_-]?key|token|secret)\s*[:=]\s*["']?([A-Za-z0-9_\-\.]{6,})["']?"#)
            .expect("valid regex"),
        Regex::new(r"(?i)\b(bearer)\s+([A-Za-z0-9_\-\.=]{12,})").expect("valid regex"),
        Regex::new(r"(?i)(://)[^/\s:@]+:[^/\s@]+@").expect("valid regex"),
    ]
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RedactionResult {
    pub content: String,
    pub redaction_count: usize,
}

/// Scrubs credentials out of backend error text before it is logged or stored.
#[derive(Debug, Default, Clone)]
pub struct Redactor {
    aggressive: bool,
}

impl Redactor {
    pub fn new(aggressive: bool) -> Self {
        Self { aggressive }
    }

    pub fn redact(&self, input: &str) -> RedactionResult {
        if input.is_empty() {
            return RedactionResult {
                content: String::new(),
                redaction_count: 0,
            };
        }

        let mut result = input.to_string();
        let mut redaction_count = 0usize;

        for pattern in SECRET_PATTERNS.iter() {
            let matches = pattern.find_iter(&result).count();
            if matches == 0 {
                continue;
            }

            redaction_count += matches;
            result = pattern
                .replace_all(&result, |caps: &regex::Captures<'_>| {
                    let key = caps.get(1).map(|m| m.as_str()).unwrap_or("secret");
                    match key {
                        "://" => "://[REDACTED]@".to_string(),
                        key if key.eq_ignore_ascii_case("bearer") => "Bearer [REDACTED]".to_string(),
                        key => format!("{}=[REDACTED]", key.to_ascii_lowercase()),
                    }
                })
                .to_string();
        }

        if self.aggressive {
            result = result
                .split(' ')
                .map(|token| {
                    if token.len() > 48 && token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
                        redaction_count += 1;
                        "[REDACTED_LONG_TOKEN]"
                    } else {
                        token
                    }
                })
                .collect::<Vec<_>>()
                .join(" ");
        }

        RedactionResult {
            content: result,
            redaction_count,
        }
    }

    pub fn scrub(&self, input: &str) -> String {
        self.redact(input).content
    }
}
