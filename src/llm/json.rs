//! Best-effort extraction of JSON objects from completion text.
//!
//! Completion output frequently arrives wrapped in code fences, prefixed
//! with `json`, or with escape sequences the JSON grammar rejects.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

fn control_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\x00-\x1F]+").expect("static regex"))
}

fn code_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*```(?:json)?\s*$").expect("static regex"))
}

/// Slice from the first `{` to the last `}`, if both exist in that order.
fn outer_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Repair common defects so that `serde_json` accepts the text.
///
/// - backslashes that do not start a valid JSON escape are doubled
/// - raw control characters (newlines inside strings, tabs) become spaces
pub fn repair_json(text: &str) -> String {
    let mut fixed = String::with_capacity(text.len() + 8);
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some('"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') => {
                    fixed.push(c);
                    if let Some(next) = chars.next() {
                        fixed.push(next);
                    }
                }
                _ => fixed.push_str("\\\\"),
            }
        } else {
            fixed.push(c);
        }
    }
    control_chars().replace_all(&fixed, " ").into_owned()
}

/// Extract the outermost JSON object from completion text.
///
/// Tries a strict parse of the outer `{...}` slice first, then the repaired
/// text. Returns `None` when neither yields an object.
pub fn extract_json_object(raw: &str) -> Option<Value> {
    let unfenced = code_fence().replace_all(raw, "");
    let cleaned = unfenced.trim().trim_start_matches("json").trim();
    let candidate = outer_object(cleaned)?;

    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(candidate) {
        return Some(value);
    }

    let repaired = repair_json(candidate);
    match serde_json::from_str::<Value>(&repaired) {
        Ok(value @ Value::Object(_)) => Some(value),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!("JSON repair failed: {}", e);
            None
        }
    }
}
