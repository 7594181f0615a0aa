//! Structured extraction from model output.
//!
//! Model replies are untrusted: JSON arrives wrapped in prose, inside fenced
//! blocks, cut off mid-generation, or with raw newlines inside string
//! literals. [`extract`] tries a fixed sequence of strategies and returns the
//! first structured value (object or array) that parses.

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("no valid structured value found")]
    NoValidValue,
}

/// Recover a JSON object or array from `text`.
///
/// Strategies, first success wins:
/// 1. the whole text;
/// 2. each closed fenced block (```` ``` ```` with an optional tag);
/// 3. an unclosed fenced block, with missing closers appended;
/// 4. each top-level balanced `{…}` / `[…]` region;
/// 5. the text from its first `{` or `[`, with missing closers appended.
///
/// When `sample_shape` is given, only values of the same kind (object or
/// array) are accepted and, for objects, keys missing from the result are
/// copied from the sample. Each name in `required_fields` that is still
/// missing is then inserted as an empty string.
pub fn extract(
    text: &str,
    required_fields: &[&str],
    sample_shape: Option<&Value>,
) -> Result<Value, ParseError> {
    let value = find_value(text, sample_shape).ok_or(ParseError::NoValidValue)?;
    Ok(fill_defaults(value, required_fields, sample_shape))
}

/// [`extract`] followed by deserialization into `T`.
pub fn extract_as<T: DeserializeOwned>(
    text: &str,
    required_fields: &[&str],
    sample_shape: Option<&Value>,
) -> Result<T, ParseError> {
    let value = extract(text, required_fields, sample_shape)?;
    serde_json::from_value(value).map_err(|e| {
        trace!(%e, "Extracted value does not fit the target type");
        ParseError::NoValidValue
    })
}

fn find_value(text: &str, shape: Option<&Value>) -> Option<Value> {
    if let Some(v) = try_parse(text, shape) {
        return Some(v);
    }

    let (blocks, open_tail) = fenced_blocks(text);
    for block in blocks {
        if let Some(v) = try_parse(block, shape) {
            return Some(v);
        }
    }

    if let Some(tail) = open_tail {
        if let Some(v) = close_truncated(tail).and_then(|r| try_parse(&r, shape)) {
            return Some(v);
        }
    }

    for region in balanced_regions(text) {
        if let Some(v) = try_parse(region, shape) {
            return Some(v);
        }
    }

    let start = text.find(['{', '['])?;
    close_truncated(&text[start..]).and_then(|r| try_parse(&r, shape))
}

fn try_parse(candidate: &str, shape: Option<&Value>) -> Option<Value> {
    let candidate = candidate.trim();
    if candidate.is_empty() {
        return None;
    }
    let parsed = serde_json::from_str::<Value>(candidate)
        .ok()
        .or_else(|| serde_json::from_str::<Value>(&escape_raw_newlines(candidate)).ok())?;

    let structured = parsed.is_object() || parsed.is_array();
    let shape_ok = match shape {
        Some(Value::Object(_)) => parsed.is_object(),
        Some(Value::Array(_)) => parsed.is_array(),
        _ => true,
    };
    if structured && shape_ok {
        Some(parsed)
    } else {
        trace!(candidate, "Parsed value has the wrong shape");
        None
    }
}

fn fill_defaults(mut value: Value, required: &[&str], shape: Option<&Value>) -> Value {
    if let Value::Object(ref mut map) = value {
        if let Some(Value::Object(sample)) = shape {
            for (key, default) in sample {
                map.entry(key.clone()).or_insert_with(|| default.clone());
            }
        }
        for field in required {
            map.entry((*field).to_string())
                .or_insert_with(|| Value::String(String::new()));
        }
    }
    value
}

/// Closed fenced blocks, plus the body of a trailing fence that was opened
/// but never closed.
fn fenced_blocks(text: &str) -> (Vec<&str>, Option<&str>) {
    let mut blocks = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let tag_len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
            .unwrap_or(after.len());
        let mut body = &after[tag_len..];
        if let Some(nl) = body.find('\n') {
            if body[..nl].trim().is_empty() {
                body = &body[nl + 1..];
            }
        }

        match body.find("```") {
            Some(close) => {
                blocks.push(&body[..close]);
                rest = &body[close + 3..];
            }
            None => return (blocks, Some(body)),
        }
    }

    (blocks, None)
}

/// Append the closing delimiters a cut-off value is missing. Returns `None`
/// when the fragment is already balanced or its nesting is inconsistent.
fn close_truncated(fragment: &str) -> Option<String> {
    let body = fragment.trim_end().trim_end_matches('`').trim_end();
    let start = body.find(['{', '['])?;
    let body = &body[start..];

    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escape = false;
    for ch in body.chars() {
        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(ch) {
                    return None;
                }
            }
            _ => {}
        }
    }
    if stack.is_empty() {
        return None;
    }

    let mut repaired = body.to_string();
    if in_string {
        if escape {
            repaired.pop();
        }
        repaired.push('"');
    }
    loop {
        let trimmed_len = repaired.trim_end().len();
        repaired.truncate(trimmed_len);
        if repaired.ends_with(',') {
            repaired.pop();
        } else {
            break;
        }
    }
    if repaired.ends_with(':') {
        repaired.push_str(" null");
    }
    repaired.extend(stack.iter().rev());
    Some(repaired)
}

/// Top-level balanced `{…}` / `[…]` regions, in order. Delimiters inside
/// string literals are ignored.
fn balanced_regions(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut stack: Vec<char> = Vec::new();
    let mut start: Option<usize> = None;
    let mut in_string = false;
    let mut escape = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' if start.is_some() => in_string = true,
            '{' | '[' => {
                if stack.is_empty() {
                    start = Some(i);
                }
                stack.push(if ch == '{' { '}' } else { ']' });
            }
            '}' | ']' => {
                if stack.last() == Some(&ch) {
                    stack.pop();
                    if stack.is_empty() {
                        if let Some(s) = start.take() {
                            out.push(&text[s..=i]);
                        }
                    }
                } else {
                    stack.clear();
                    start = None;
                }
            }
            _ => {}
        }
    }

    out
}

/// Escape raw control characters that appear inside JSON string literals.
fn escape_raw_newlines(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escape = false;

    for ch in input.chars() {
        if in_string {
            if escape {
                escape = false;
                out.push(ch);
                continue;
            }
            match ch {
                '\\' => {
                    escape = true;
                    out.push(ch);
                }
                '"' => {
                    in_string = false;
                    out.push(ch);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                _ => out.push(ch),
            }
        } else {
            if ch == '"' {
                in_string = true;
            }
            out.push(ch);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_direct_object() {
        let v = extract(r#"{"name": "Mira"}"#, &[], None).unwrap();
        assert_eq!(v["name"], "Mira");
    }

    #[test]
    fn test_object_inside_prose() {
        let text = r#"Sure! Here is the character: {"name": "Tobin", "tags": ["a", "}"]} Enjoy."#;
        let v = extract(text, &[], None).unwrap();
        assert_eq!(v["name"], "Tobin");
        assert_eq!(v["tags"][1], "}");
    }

    #[test]
    fn test_fenced_block_with_and_without_tag() {
        let tagged = "Result:\n```json\n{\"a\": 1}\n```\nDone.";
        assert_eq!(extract(tagged, &[], None).unwrap(), json!({"a": 1}));
        let plain = "```\n[1, 2]\n```";
        assert_eq!(extract(plain, &[], None).unwrap(), json!([1, 2]));
    }

    #[test]
    fn test_open_fence_truncated() {
        let text = "```json\n{\"name\": \"Mira\", \"traits\": [\"brave\", \"kind\"";
        let v = extract(text, &[], None).unwrap();
        assert_eq!(v["traits"][1], "kind");
    }

    #[test]
    fn test_missing_final_brace() {
        let text = r#"{"title": "Dusk", "characters": [{"name": "Mira"}]"#;
        let v = extract(text, &[], None).unwrap();
        assert_eq!(v["characters"][0]["name"], "Mira");
    }

    #[test]
    fn test_truncated_inside_string_and_trailing_comma() {
        let v = extract(r#"{"a": "x", "b": "half"#, &[], None).unwrap();
        assert_eq!(v["b"], "half");
        let v = extract(r#"{"a": [1, 2,"#, &[], None).unwrap();
        assert_eq!(v["a"], json!([1, 2]));
    }

    #[test]
    fn test_mismatched_nesting_is_not_repaired() {
        assert_eq!(
            extract(r#"{"a": [1, 2}"#, &[], None),
            Err(ParseError::NoValidValue)
        );
    }

    #[test]
    fn test_raw_newline_inside_string() {
        let text = "{\"text\": \"line one\nline two\"}";
        let v = extract(text, &[], None).unwrap();
        assert_eq!(v["text"], "line one\nline two");
    }

    #[test]
    fn test_required_fields_default_to_empty() {
        let v = extract(r#"{"name": "Mira"}"#, &["name", "description"], None).unwrap();
        assert_eq!(v["description"], "");
        assert_eq!(v["name"], "Mira");
    }

    #[test]
    fn test_sample_shape_selects_kind_and_fills_keys() {
        let text = r#"[1, 2] then {"name": "Harbor"}"#;
        let shape = json!({"name": "", "atmosphere": "calm"});
        let v = extract(text, &[], Some(&shape)).unwrap();
        assert_eq!(v["name"], "Harbor");
        assert_eq!(v["atmosphere"], "calm");
    }

    #[test]
    fn test_plain_text_fails() {
        assert_eq!(
            extract("I could not do that, sorry.", &[], None),
            Err(ParseError::NoValidValue)
        );
        assert_eq!(extract("42", &[], None), Err(ParseError::NoValidValue));
    }

    #[test]
    fn test_extract_as_typed() {
        #[derive(serde::Deserialize)]
        struct Named {
            name: String,
        }
        let named: Named = extract_as("ok: {\"name\": \"Ash\"}", &[], None).unwrap();
        assert_eq!(named.name, "Ash");
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-zA-Z0-9 ,:{}\\[\\]]{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    fn arb_object() -> impl Strategy<Value = Value> {
        prop::collection::btree_map("[a-z]{1,6}", arb_json(), 0..5)
            .prop_map(|m| Value::Object(m.into_iter().collect()))
    }

    proptest! {
        #[test]
        fn prop_round_trip_in_prose(
            value in arb_object(),
            prefix in prop_oneof![Just(""), Just("Here is the result:"), Just("Sure. Output follows\n")],
            suffix in prop_oneof![Just(""), Just("Hope this helps!"), Just("\nLet me know.")],
        ) {
            let text = format!("{prefix} {} {suffix}", serde_json::to_string(&value).unwrap());
            prop_assert_eq!(extract(&text, &[], None).unwrap(), value);
        }

        #[test]
        fn prop_round_trip_in_fence(value in arb_object(), pretty in any::<bool>()) {
            let body = if pretty {
                serde_json::to_string_pretty(&value).unwrap()
            } else {
                serde_json::to_string(&value).unwrap()
            };
            let text = format!("Here you go:\n```json\n{body}\n```\nAnything else?");
            prop_assert_eq!(extract(&text, &[], None).unwrap(), value);
        }
    }
}
