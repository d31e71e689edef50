//! Best-effort repair of malformed structured output.
//!
//! Language models asked for a JSON object routinely wrap it in prose or
//! code fences, leave trailing commas, or stop mid-object. The repair chain
//! is an ordered list of pure text transforms; [`extract_json_object`]
//! applies them cumulatively and stops at the first text that parses as a
//! JSON object.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use tracing::debug;

use crate::errors::RepairError;

/// A single repair step.
pub type RepairStep = fn(&str) -> String;

/// The repair steps, in application order.
pub const REPAIR_CHAIN: &[(&str, RepairStep)] = &[
    ("strip_code_fence", strip_code_fence),
    ("slice_object", slice_object),
    ("remove_comments", remove_comments),
    ("strip_trailing_commas", strip_trailing_commas),
    ("insert_missing_commas", insert_missing_commas),
    ("balance_unterminated", balance_unterminated),
];

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z]*[ \t]*\r?\n?(.*?)(?:```|$)").unwrap_or_else(|_| unreachable!())
});

static MISSING_COMMA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(["}\]\d]|true|false|null)([ \t]*\r?\n\s*)(["{\[])"#)
        .unwrap_or_else(|_| unreachable!())
});

/// Parses `text` into a JSON object, repairing it if needed.
pub fn extract_json_object(text: &str) -> Result<Map<String, Value>, RepairError> {
    let mut current = text.trim().to_string();
    if let Some(object) = parse_object(&current) {
        return Ok(object);
    }

    let mut attempted = Vec::with_capacity(REPAIR_CHAIN.len());
    for (name, step) in REPAIR_CHAIN {
        current = step(&current);
        attempted.push((*name).to_string());
        if let Some(object) = parse_object(&current) {
            debug!(step = name, "Repaired structured output");
            return Ok(object);
        }
    }

    Err(RepairError::new("no JSON object could be recovered", text).with_attempted(attempted))
}

fn parse_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Removes a surrounding Markdown code fence, keeping its body.
#[must_use]
pub fn strip_code_fence(text: &str) -> String {
    CODE_FENCE
        .captures(text)
        .and_then(|c| c.get(1))
        .map_or_else(|| text.to_string(), |m| m.as_str().trim().to_string())
}

/// Keeps the text from the first `{` to its matching `}`.
///
/// When the object never closes the tail is kept so that
/// [`balance_unterminated`] can close it.
#[must_use]
pub fn slice_object(text: &str) -> String {
    let Some(start) = text.find('{') else {
        return text.to_string();
    };
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return text[start..=start + offset].to_string();
                }
            }
            _ => {}
        }
    }
    text[start..].to_string()
}

/// Removes `//` line comments and `/* */` block comments outside strings.
#[must_use]
pub fn remove_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match (c, chars.peek().copied()) {
            ('"', _) => {
                in_string = true;
                out.push(c);
            }
            ('/', Some('/')) => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Drops commas directly followed by a closing bracket, outside strings.
#[must_use]
pub fn strip_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            out.push(c);
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|n| !n.is_whitespace());
            if matches!(next, Some('}' | ']')) {
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Inserts commas between values separated only by a line break.
#[must_use]
pub fn insert_missing_commas(text: &str) -> String {
    MISSING_COMMA.replace_all(text, "$1,$2$3").into_owned()
}

/// Closes an unterminated string and any unclosed brackets.
#[must_use]
pub fn balance_unterminated(text: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let mut out = text.to_string();
    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    let trimmed_len = out.trim_end().trim_end_matches(',').trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(':') {
        out.push_str(" null");
    }
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_clean_object_passes_through() {
        let obj = extract_json_object(r#"{"a": 1}"#).unwrap();
        assert_eq!(Value::Object(obj), json!({"a": 1}));
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_code_fence("no fence"), "no fence");
        assert_eq!(strip_code_fence("```\n{\"a\": 1"), "{\"a\": 1");
    }

    #[test]
    fn test_slice_object() {
        assert_eq!(slice_object("Sure! {\"a\": 1} Hope this helps."), "{\"a\": 1}");
        assert_eq!(slice_object("prefix {\"a\": [1"), "{\"a\": [1");
        assert_eq!(slice_object("nothing here"), "nothing here");
    }

    #[test]
    fn test_remove_comments_keeps_strings() {
        let text = "{\"url\": \"http://x\", // note\n \"b\": /* inline */ 2}";
        assert_eq!(remove_comments(text), "{\"url\": \"http://x\", \n \"b\":  2}");
    }

    #[test]
    fn test_strip_trailing_commas() {
        assert_eq!(strip_trailing_commas("{\"a\": [1, 2,], }"), "{\"a\": [1, 2] }");
        assert_eq!(strip_trailing_commas("{\"a\": \",}\"}"), "{\"a\": \",}\"}");
    }

    #[test]
    fn test_insert_missing_commas() {
        let text = "{\n  \"a\": 1\n  \"b\": \"x\"\n  \"c\": true\n}";
        let fixed = insert_missing_commas(text);
        assert_eq!(
            serde_json::from_str::<Value>(&fixed).unwrap(),
            json!({"a": 1, "b": "x", "c": true})
        );
    }

    #[test]
    fn test_balance_unterminated() {
        assert_eq!(balance_unterminated("{\"a\": [1, 2"), "{\"a\": [1, 2]}");
        assert_eq!(balance_unterminated("{\"a\": \"trunc"), "{\"a\": \"trunc\"}");
        assert_eq!(balance_unterminated("{\"a\": 1,"), "{\"a\": 1}");
        assert_eq!(balance_unterminated("{\"a\":"), "{\"a\": null}");
    }

    #[test]
    fn test_chain_repairs_realistic_output() {
        let text = "Here is the routing:\n```json\n{\n  \"routing\": {\"start_agent\": \"storyboard_artist\", \"mode\": \"incremental\",},\n  \"target_ids\": {\"shot_ids\": [3, 4";
        let obj = extract_json_object(text).unwrap();
        assert_eq!(obj["routing"]["start_agent"], json!("storyboard_artist"));
        assert_eq!(obj["target_ids"]["shot_ids"], json!([3, 4]));
    }

    #[test]
    fn test_chain_exhausted_reports_attempts() {
        let err = extract_json_object("I cannot help with that.").unwrap_err();
        assert_eq!(err.attempted.len(), REPAIR_CHAIN.len());
        assert!(err.excerpt.starts_with("I cannot"));
    }

    #[test]
    fn test_non_object_json_rejected() {
        assert!(extract_json_object("[1, 2, 3]").is_err());
    }
}
