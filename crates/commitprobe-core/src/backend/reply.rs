//! Validation of raw model output into tagged replies.

use std::collections::BTreeSet;

use serde_json::Value;

use super::BackendError;
use crate::domain::assessment::UNKNOWN_TAG;

/// Classified answer to a risk request.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskReply {
    Score { score: f64, tags: BTreeSet<String> },
    /// The model answered, but not with a usable score.
    ParseError(String),
    RateLimited { retry_after_ms: Option<u64> },
    Unavailable(String),
}

impl RiskReply {
    pub fn classify(result: Result<String, BackendError>) -> Self {
        match result {
            Ok(text) => Self::parse(&text),
            Err(BackendError::RateLimited { retry_after_ms }) => RiskReply::RateLimited { retry_after_ms },
            Err(BackendError::Unavailable(reason)) => RiskReply::Unavailable(reason),
        }
    }

    /// Parse reply text. Accepts a bare JSON object or one wrapped in prose
    /// or a code fence: `{"score": 0.8, "tags": ["null-handling"]}`.
    pub fn parse(text: &str) -> Self {
        let Some(object) = first_json_object(text) else {
            return RiskReply::ParseError("no JSON object in reply".to_string());
        };

        let raw_score = object.get("score").or_else(|| object.get("risk_score"));
        let score = match raw_score {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        let Some(score) = score else {
            return RiskReply::ParseError("missing or non-numeric `score`".to_string());
        };
        if !score.is_finite() || !(0.0..=1.0).contains(&score) {
            return RiskReply::ParseError(format!("score {score} outside [0, 1]"));
        }

        let tags = match object.get("tags") {
            None | Some(Value::Null) => BTreeSet::new(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(normalize_tag)
                .collect(),
            Some(Value::String(single)) => normalize_tag(single).into_iter().collect(),
            Some(_) => return RiskReply::ParseError("`tags` must be a list of strings".to_string()),
        };

        RiskReply::Score { score, tags }
    }
}

/// Classified answer to a synthesis request.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisReply {
    /// Raw reply text that should contain test code.
    Source(String),
    Declined(String),
    RateLimited { retry_after_ms: Option<u64> },
    Unavailable(String),
}

impl SynthesisReply {
    pub fn classify(result: Result<String, BackendError>) -> Self {
        match result {
            Ok(text) => Self::parse(&text),
            Err(BackendError::RateLimited { retry_after_ms }) => {
                SynthesisReply::RateLimited { retry_after_ms }
            }
            Err(BackendError::Unavailable(reason)) => SynthesisReply::Unavailable(reason),
        }
    }

    pub fn parse(text: &str) -> Self {
        if text.trim().is_empty() {
            return SynthesisReply::Declined("empty reply".to_string());
        }
        if let Some(object) = envelope(text) {
            match object.get("declined").or_else(|| object.get("decline")) {
                Some(Value::String(reason)) => return SynthesisReply::Declined(reason.clone()),
                Some(Value::Bool(true)) => {
                    return SynthesisReply::Declined("model declined".to_string())
                }
                _ => {}
            }
            if matches!(object.get("test"), Some(Value::Null)) {
                return SynthesisReply::Declined("model returned no test".to_string());
            }
        }
        SynthesisReply::Source(text.to_string())
    }
}

/// Lowercase, hyphenate whitespace, drop empties and the reserved tag.
fn normalize_tag(raw: &str) -> Option<String> {
    let tag = raw
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase();
    if tag.is_empty() || tag == UNKNOWN_TAG {
        None
    } else {
        Some(tag)
    }
}

/// A synthesis reply that is a JSON object as a whole, either bare or as the
/// entire content of its first fenced block. Objects embedded in code do not
/// count.
fn envelope(text: &str) -> Option<serde_json::Map<String, Value>> {
    let whole = |candidate: &str| match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    };
    whole(text).or_else(|| first_fenced_block(text).and_then(|block| whole(&block)))
}

/// The first balanced `{...}` in `text` that parses as a JSON object.
pub(crate) fn first_json_object(text: &str) -> Option<serde_json::Map<String, Value>> {
    let bytes = text.as_bytes();
    let mut start = 0;
    while let Some(offset) = text[start..].find('{') {
        let open = start + offset;
        if let Some(close) = balanced_end(bytes, open) {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&text[open..=close]) {
                return Some(map);
            }
        }
        start = open + 1;
    }
    None
}

/// Index of the `}` closing the `{` at `open`, skipping braces in strings.
fn balanced_end(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

const CODE_MARKERS: &[&str] = &[
    "def ", "import ", "from ", "class ", "assert", "fn ", "use ", "#[", "mod ", "func ",
    "package ", "function ", "const ", "let ", "test(", "describe(", "it(", "#!",
];

/// Pull test code out of a synthesis reply.
///
/// Tries, in order: a JSON envelope (`test`, `source` or `code`) making up
/// the whole reply, the first fenced code block, then the raw text if it
/// looks like code.
pub fn extract_code(text: &str) -> Option<String> {
    if let Some(object) = envelope(text) {
        for field in ["test", "source", "code"] {
            if let Some(Value::String(code)) = object.get(field) {
                if !code.trim().is_empty() {
                    return Some(code.clone());
                }
            }
        }
    }

    if let Some(code) = first_fenced_block(text) {
        if !code.trim().is_empty() {
            return Some(code);
        }
    }

    let looks_like_code = text.lines().map(str::trim_start).any(|line| {
        CODE_MARKERS.iter().any(|marker| line.starts_with(marker))
    });
    if looks_like_code && !text.contains("```") {
        return Some(text.to_string());
    }
    None
}

fn first_fenced_block(text: &str) -> Option<String> {
    let mut lines = text.lines();
    lines.by_ref().find(|l| l.trim_start().starts_with("```"))?;
    let mut body = Vec::new();
    for line in lines {
        if line.trim_start().starts_with("```") {
            return Some(body.join("\n"));
        }
        body.push(line);
    }
    // Unterminated fence: take the rest.
    Some(body.join("\n"))
}
