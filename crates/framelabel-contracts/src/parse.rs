use serde_json::{Map, Value};
use thiserror::Error;

const JSON_FENCE_OPEN: &str = "```json";
const FENCE: &str = "```";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed response: {reason}")]
    MalformedResponse { reason: String },
}

impl ParseError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            reason: reason.into(),
        }
    }
}

/// Pulls the label object out of free-form model text.
///
/// A ```` ```json ```` fenced block wins when present; otherwise the whole
/// trimmed text must be a JSON object.
pub fn parse_label_response(text: &str) -> Result<Map<String, Value>, ParseError> {
    let candidate = fenced_json_block(text).unwrap_or_else(|| text.trim());
    if candidate.is_empty() {
        return Err(ParseError::malformed("empty response"));
    }
    let parsed: Value = serde_json::from_str(candidate)
        .map_err(|err| ParseError::malformed(format!("invalid JSON: {err}")))?;
    match parsed {
        Value::Object(object) => Ok(object),
        other => Err(ParseError::malformed(format!(
            "expected a JSON object, got {}",
            truncate_text(&other.to_string(), 64)
        ))),
    }
}

fn fenced_json_block(text: &str) -> Option<&str> {
    // ASCII lowercasing keeps byte offsets valid for `text`.
    let lowered = text.to_ascii_lowercase();
    let open = lowered.find(JSON_FENCE_OPEN)?;
    let body_start = open + JSON_FENCE_OPEN.len();
    let close = lowered[body_start..].find(FENCE)?;
    Some(text[body_start..body_start + close].trim())
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
