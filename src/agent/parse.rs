//! Recovers one JSON value from model output that may be wrapped in prose or
//! code fences, or cut off by the token budget.
//!
//! Fallbacks run in order and the first success wins:
//! 1. strip fences and parse the whole text;
//! 2. parse from the first `[` (then the first `{`) to the end, then accept the
//!    leading value of whichever starts first and ignore trailing prose;
//! 3. walk backwards over every `}` and close the prefix with a single `]`/`}`;
//! 4. cut at element boundaries and close every bracket still open.
//!
//! Steps 3 and 4 keep the largest prefix that parses. They run from the first
//! `[`, then from the first `{` (object first when it encloses that `[`), so a
//! bracket in leading prose cannot hide the real value behind an empty `{}`.

use serde_json::Value;
use thiserror::Error;

use crate::text::truncate_chars;

const EXCERPT_LIMIT_CHARS: usize = 500;

#[derive(Debug, Error)]
#[error("no JSON value could be recovered from model output: {excerpt}")]
pub struct ParseError {
    pub excerpt: String,
}

pub fn parse_lenient(raw: &str) -> Result<Value, ParseError> {
    let cleaned = strip_fences(raw);
    let text = cleaned.trim();

    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Ok(value);
    }

    let array_at = text.find('[');
    let object_at = text.find('{');
    for start in [array_at, object_at].into_iter().flatten() {
        if let Ok(value) = serde_json::from_str::<Value>(&text[start..]) {
            return Ok(value);
        }
    }

    let failure = || ParseError {
        excerpt: truncate_chars(raw, EXCERPT_LIMIT_CHARS),
    };
    let earliest = match (array_at, object_at) {
        (Some(a), Some(o)) => a.min(o),
        (Some(a), None) => a,
        (None, Some(o)) => o,
        (None, None) => return Err(failure()),
    };
    if let Some(value) = leading_value(&text[earliest..]) {
        return Ok(value);
    }

    // Arrays take precedence unless the first `[` sits inside the first `{`.
    // An empty root only stands when no other start salvages anything.
    let starts = match (array_at, object_at) {
        (Some(a), Some(o)) if o < a && encloses(text, o, a) => [object_at, array_at],
        _ => [array_at, object_at],
    };
    let mut hollow = None;
    for start in starts.into_iter().flatten() {
        let tail = &text[start..];
        match salvage_at_braces(tail).or_else(|| salvage_structural(tail)) {
            Some(value) if is_hollow(&value) => {
                hollow.get_or_insert(value);
            }
            Some(value) => return Ok(value),
            None => {}
        }
    }
    hollow.ok_or_else(failure)
}

/// True when the bracket opened at `open` is still unclosed at `at`.
fn encloses(text: &str, open: usize, at: usize) -> bool {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for ch in text[open..at].chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth > 0
}

fn is_hollow(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
        _ => false,
    }
}

fn strip_fences(raw: &str) -> String {
    raw.replace("```json", "").replace("```JSON", "").replace("```", "")
}

fn leading_value(tail: &str) -> Option<Value> {
    serde_json::Deserializer::from_str(tail)
        .into_iter::<Value>()
        .next()?
        .ok()
}

fn salvage_at_braces(tail: &str) -> Option<Value> {
    let closer = if tail.starts_with('[') { ']' } else { '}' };
    tail.rmatch_indices('}').find_map(|(pos, _)| {
        let mut candidate = String::with_capacity(pos + 2);
        candidate.push_str(&tail[..=pos]);
        candidate.push(closer);
        serde_json::from_str::<Value>(&candidate).ok()
    })
}

/// Cut points are positions where every open container below the root is an
/// array, so a partially written element object is dropped whole.
fn salvage_structural(tail: &str) -> Option<Value> {
    let mut stack: Vec<char> = Vec::new();
    let mut cuts: Vec<(usize, String)> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in tail.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => {
                stack.push(ch);
                if can_cut(&stack) {
                    cuts.push((idx + 1, closers(&stack)));
                }
            }
            '}' | ']' => {
                stack.pop();
                if stack.is_empty() {
                    break;
                }
                if can_cut(&stack) {
                    cuts.push((idx + 1, closers(&stack)));
                }
            }
            ',' if can_cut(&stack) => cuts.push((idx, closers(&stack))),
            _ => {}
        }
    }

    cuts.into_iter().rev().find_map(|(end, close)| {
        let mut candidate = tail[..end].trim_end().to_string();
        candidate.push_str(&close);
        serde_json::from_str::<Value>(&candidate).ok()
    })
}

fn can_cut(stack: &[char]) -> bool {
    !stack.is_empty() && stack.iter().skip(1).all(|c| *c == '[')
}

fn closers(stack: &[char]) -> String {
    stack
        .iter()
        .rev()
        .map(|c| if *c == '{' { '}' } else { ']' })
        .collect()
}
