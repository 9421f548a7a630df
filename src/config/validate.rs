//! Configuration validation with unknown field detection.

use serde_json::Value;
use std::collections::HashSet;

/// Known top-level config field names.
const KNOWN_TOP_LEVEL: &[&str] = &[
    "agent",
    "backend",
    "retry",
    "tools",
    "storage",
    "retrieval",
    "logging",
];

/// Known fields for each section.
const KNOWN_SECTIONS: &[(&str, &[&str])] = &[
    (
        "agent",
        &[
            "model",
            "max_tokens",
            "temperature",
            "context_budget",
            "max_tool_depth",
            "tool_timeout_secs",
            "system_prompt",
            "codeblock_tools",
            "summarize_dropped",
        ],
    ),
    (
        "backend",
        &["kind", "api_key", "api_base", "request_timeout_secs"],
    ),
    (
        "retry",
        &["enabled", "max_retries", "base_delay_ms", "max_delay_ms"],
    ),
    (
        "tools",
        &[
            "confirmation",
            "workspace",
            "env_allowlist",
            "max_output_chars",
            "python_bin",
        ],
    ),
    ("storage", &["dir"]),
    (
        "retrieval",
        &["enabled", "top_k", "min_score", "precedence", "docs_dir"],
    ),
    ("logging", &["format", "level", "file"]),
];

/// A validation diagnostic.
#[derive(Debug)]
pub struct Diagnostic {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Simple Levenshtein distance for "did you mean?" suggestions.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();

    for (i, ca) in a.iter().enumerate() {
        let mut current = vec![i + 1; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            current[j + 1] = (prev[j + 1] + 1).min(current[j] + 1).min(prev[j] + cost);
        }
        prev = current;
    }
    prev[b.len()]
}

/// Suggest the closest known field name (if distance <= 3).
pub fn suggest_field(unknown: &str, known: &[&str]) -> Option<String> {
    known
        .iter()
        .map(|k| (k, levenshtein(unknown, k)))
        .filter(|(_, d)| *d <= 3)
        .min_by_key(|(_, d)| *d)
        .map(|(k, _)| format!("did you mean '{}'?", k))
}

fn unknown_field(path: String, key: &str, known: &[&str]) -> Diagnostic {
    let message = match suggest_field(key, known) {
        Some(suggestion) => format!("unknown field '{}', {}", key, suggestion),
        None => format!("unknown field '{}'", key),
    };
    Diagnostic { path, message }
}

/// Report unknown fields in a raw JSON config value.
///
/// Unknown fields are ignored by deserialization, so a typo silently falls
/// back to a default; these diagnostics make that visible.
pub fn validate_config(raw: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    let obj = match raw.as_object() {
        Some(o) => o,
        None => {
            diagnostics.push(Diagnostic {
                path: String::new(),
                message: "config must be a JSON object".to_string(),
            });
            return diagnostics;
        }
    };

    let known_set: HashSet<&str> = KNOWN_TOP_LEVEL.iter().copied().collect();
    for key in obj.keys() {
        if !known_set.contains(key.as_str()) {
            diagnostics.push(unknown_field(key.clone(), key, KNOWN_TOP_LEVEL));
        }
    }

    for (section, known) in KNOWN_SECTIONS {
        if let Some(fields) = obj.get(*section).and_then(|v| v.as_object()) {
            for key in fields.keys() {
                if !known.contains(&key.as_str()) {
                    diagnostics.push(unknown_field(
                        format!("{}.{}", section, key),
                        key,
                        known,
                    ));
                }
            }
        }
    }

    diagnostics
}
