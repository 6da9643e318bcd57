//! Scraping structured tool invocations out of free-form assistant text.
//!
//! Four strategies run in order, first non-empty result wins:
//!   1. fenced ```json blocks holding a {"tool_calls":[...]} object
//!   2. inline balanced-brace JSON containing a "tool_calls" array
//!   3. a bare single-function object {"name":..., "arguments":...}
//!   4. natural-language 调用函数 phrasing
//!
//! The brace scanner is hand-rolled: candidates are embedded in prose, so a
//! JSON parser cannot find them, and the scanner must be string- and
//! escape-aware to survive braces inside argument strings.

use super::{ToolCall, ToolCallFunction};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;

static FENCE_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?s)```json\s*(\{.*?\})\s*```").expect("fence regex"));

static NATURAL_CALL_PATTERN: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?s)调用函数\s*[：:]\s*([\w\-\.]+)\s*(?:参数|arguments)[：:]\s*(\{.*?\})")
        .expect("natural call regex")
});

static CALL_ID_SEQ: AtomicU64 = AtomicU64::new(0);

fn generate_call_id() -> String {
    let seq = CALL_ID_SEQ.fetch_add(1, Ordering::Relaxed) + 1;
    format!("call_{}_{}", chrono::Utc::now().timestamp_millis(), seq)
}

/// Walk from an opening brace to its matching close, tracking string and
/// escape state. Returns the exclusive end offset, or `None` when the
/// object never closes.
fn find_matching_brace(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if start >= bytes.len() || bytes[start] != b'{' {
        return None;
    }
    let mut depth = 1usize;
    let mut in_string = false;
    let mut escape_next = false;
    let mut j = start + 1;
    while j < bytes.len() && depth > 0 {
        let ch = bytes[j];
        if escape_next {
            escape_next = false;
            j += 1;
            continue;
        }
        match ch {
            b'\\' if in_string => escape_next = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => depth -= 1,
            _ => {}
        }
        j += 1;
    }
    if depth == 0 {
        Some(j)
    } else {
        None
    }
}

/// Normalize an argument string into valid JSON text. Empty becomes `{}`,
/// invalid JSON gets a single-quote repair attempt, the original survives
/// when nothing works.
pub fn normalize_arguments(args: &str) -> String {
    let trimmed = args.trim();
    if trimmed.is_empty() {
        return "{}".to_string();
    }
    if serde_json::from_str::<Value>(trimmed).is_ok() {
        return trimmed.to_string();
    }
    let fixed = trimmed.replace('\'', "\"");
    if serde_json::from_str::<Value>(&fixed).is_ok() {
        return fixed;
    }
    trimmed.to_string()
}

/// Normalize arguments arriving as an arbitrary JSON value.
fn normalize_value_arguments(args: Option<&Value>) -> String {
    match args {
        Some(Value::String(s)) => normalize_arguments(s),
        Some(v @ Value::Object(_)) | Some(v @ Value::Array(_)) => v.to_string(),
        _ => "{}".to_string(),
    }
}

fn validate_and_normalize(calls: Vec<ToolCall>) -> Option<Vec<ToolCall>> {
    let valid: Vec<ToolCall> = calls
        .into_iter()
        .filter(|c| !c.function.name.is_empty())
        .map(|mut c| {
            if c.id.is_empty() {
                c.id = generate_call_id();
            }
            if c.kind.is_empty() {
                c.kind = "function".to_string();
            }
            c.function.arguments = normalize_arguments(&c.function.arguments);
            c
        })
        .collect();
    if valid.is_empty() {
        None
    } else {
        Some(valid)
    }
}

/// Parse a candidate JSON object into tool calls. Lenient about shapes:
/// missing ids/types are filled in later, arguments may be string or object.
fn parse_tool_calls_json(json_str: &str) -> Option<Vec<ToolCall>> {
    let value: Value = serde_json::from_str(json_str).ok()?;
    let raw_calls = value.get("tool_calls")?.as_array()?;
    if raw_calls.is_empty() {
        return None;
    }
    let mut calls = Vec::with_capacity(raw_calls.len());
    for tc in raw_calls {
        let function = tc.get("function");
        let name = function
            .and_then(|f| f.get("name"))
            .and_then(|n| n.as_str())
            .unwrap_or("")
            .to_string();
        calls.push(ToolCall {
            id: tc
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            kind: tc
                .get("type")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            function: ToolCallFunction {
                name,
                arguments: normalize_value_arguments(function.and_then(|f| f.get("arguments"))),
            },
        });
    }
    Some(calls)
}

/// Truncate at a byte limit without splitting a UTF-8 sequence.
fn truncate_at_boundary(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Extract tool invocations from assistant text, scanning at most
/// `scan_limit` bytes.
pub fn extract_tool_invocations(text: &str, scan_limit: usize) -> Option<Vec<ToolCall>> {
    if text.is_empty() {
        return None;
    }
    let scan_text = truncate_at_boundary(text, scan_limit);

    // 1. fenced ```json blocks
    for caps in FENCE_PATTERN.captures_iter(scan_text) {
        if let Some(body) = caps.get(1) {
            if let Some(calls) = parse_tool_calls_json(body.as_str()) {
                return validate_and_normalize(calls);
            }
        }
    }

    // 2. inline balanced-brace JSON containing "tool_calls"
    if let Some(calls) = extract_inline_tool_calls(scan_text) {
        return validate_and_normalize(calls);
    }

    // 3. single-function object
    if let Some(calls) = extract_single_function_call(scan_text) {
        return validate_and_normalize(calls);
    }

    // 4. natural-language phrasing
    if let Some(caps) = NATURAL_CALL_PATTERN.captures(scan_text) {
        let name = caps.get(1)?.as_str().trim().to_string();
        let args = caps.get(2)?.as_str().trim();
        if serde_json::from_str::<Value>(args).is_ok() {
            return validate_and_normalize(vec![ToolCall {
                id: String::new(),
                kind: "function".to_string(),
                function: ToolCallFunction {
                    name,
                    arguments: args.to_string(),
                },
            }]);
        }
    }

    None
}

fn extract_inline_tool_calls(text: &str) -> Option<Vec<ToolCall>> {
    if !text.contains(r#""tool_calls""#) {
        return None;
    }
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }
        let Some(end) = find_matching_brace(text, i) else {
            i += 1;
            continue;
        };
        let json_str = &text[i..end];
        if json_str.contains(r#""tool_calls""#) {
            if let Some(calls) = parse_tool_calls_json(json_str) {
                return Some(calls);
            }
        }
        i = end;
    }
    None
}

fn extract_single_function_call(text: &str) -> Option<Vec<ToolCall>> {
    #[derive(serde::Deserialize)]
    struct RawCall {
        name: String,
        #[serde(default)]
        arguments: Option<Value>,
    }

    let mut search_start = 0;
    while let Some(rel) = text[search_start..].find(r#""name""#) {
        let idx = search_start + rel;

        // walk back over whitespace only; anything else disqualifies
        let bytes = text.as_bytes();
        let mut brace_start = None;
        let mut k = idx;
        while k > 0 {
            k -= 1;
            match bytes[k] {
                b'{' => {
                    brace_start = Some(k);
                    break;
                }
                b' ' | b'\t' | b'\n' | b'\r' => continue,
                _ => break,
            }
        }
        let Some(start) = brace_start else {
            search_start = idx + 1;
            continue;
        };
        let Some(end) = find_matching_brace(text, start) else {
            search_start = idx + 1;
            continue;
        };

        if let Ok(raw) = serde_json::from_str::<RawCall>(&text[start..end]) {
            if !raw.name.is_empty() {
                return Some(vec![ToolCall {
                    id: String::new(),
                    kind: "function".to_string(),
                    function: ToolCallFunction {
                        name: raw.name,
                        arguments: normalize_value_arguments(raw.arguments.as_ref()),
                    },
                }]);
            }
        }
        search_start = idx + 1;
    }
    None
}

fn json_has_tool_calls(json_str: &str) -> bool {
    serde_json::from_str::<Value>(json_str)
        .ok()
        .and_then(|v| v.get("tool_calls").map(|_| ()))
        .is_some()
}

/// Remove tool-call JSON without trimming: fenced blocks whose body carries
/// tool_calls, then inline balanced objects doing the same. The streaming
/// engine needs the untrimmed form to emit incremental tails.
pub fn clean_tool_json(text: &str) -> String {
    let without_fences = FENCE_PATTERN.replace_all(text, |caps: &regex::Captures| {
        let body = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        if json_has_tool_calls(body) {
            String::new()
        } else {
            caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default()
        }
    });
    remove_inline_tool_call_json(&without_fences)
}

/// Client-visible form of an answer: tool JSON removed, result trimmed.
pub fn strip_tool_json(text: &str) -> String {
    clean_tool_json(text).trim().to_string()
}

fn remove_inline_tool_call_json(text: &str) -> String {
    if !text.contains(r#""tool_calls""#) {
        return text.to_string();
    }
    let bytes = text.as_bytes();
    let mut result = String::with_capacity(text.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'{' {
            // copy the full UTF-8 sequence starting here
            let next = (i + 1..=bytes.len())
                .find(|&p| text.is_char_boundary(p))
                .unwrap_or(bytes.len());
            result.push_str(&text[i..next]);
            i = next;
            continue;
        }
        match find_matching_brace(text, i) {
            Some(end) => {
                let json_str = &text[i..end];
                if json_str.contains(r#""tool_calls""#) && json_has_tool_calls(json_str) {
                    i = end;
                } else {
                    result.push('{');
                    i += 1;
                }
            }
            None => {
                result.push('{');
                i += 1;
            }
        }
    }
    result
}

/// How much of a partially streamed answer is safe to show. Held back:
/// the last ``` fence with no closing fence, and the earliest brace-balanced
/// object still missing its close — either could turn into tool JSON.
pub(crate) fn visible_prefix_len(text: &str) -> usize {
    let mut hold = text.len();

    // unclosed fence
    let mut fence_positions = Vec::new();
    let mut pos = 0;
    while let Some(rel) = text[pos..].find("```") {
        fence_positions.push(pos + rel);
        pos += rel + 3;
    }
    if fence_positions.len() % 2 == 1 {
        hold = hold.min(*fence_positions.last().unwrap());
    }

    // unmatched opening brace
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            match find_matching_brace(text, i) {
                Some(end) => i = end,
                None => {
                    hold = hold.min(i);
                    break;
                }
            }
        } else {
            i += 1;
        }
    }

    // keep the boundary on a full character
    let mut hold = hold.min(text.len());
    while hold > 0 && !text.is_char_boundary(hold) {
        hold -= 1;
    }
    hold
}

#[cfg(test)]
mod tests {
    use super::*;

    const WRAPPED: &str = r#"{"tool_calls":[{"id":"a","type":"function","function":{"name":"f","arguments":{"x":1}}}]}"#;

    #[test]
    fn fenced_payload_extracts() {
        let text = format!("```json\n{}\n```", WRAPPED);
        let calls = extract_tool_invocations(&text, 200_000).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function.name, "f");
        assert_eq!(calls[0].function.arguments, r#"{"x":1}"#);
    }

    #[test]
    fn inline_payload_after_prose_extracts() {
        let text = format!("让我查一下。\n{}", WRAPPED);
        let calls = extract_tool_invocations(&text, 200_000).unwrap();
        assert_eq!(calls[0].function.arguments, r#"{"x":1}"#);
    }

    #[test]
    fn embedded_payload_extracts() {
        let text = format!(r#"{{"result":{},"note":"embedded"}}"#, WRAPPED);
        let calls = extract_tool_invocations(&text, 200_000).unwrap();
        assert_eq!(calls[0].function.name, "f");
        assert_eq!(calls[0].function.arguments, r#"{"x":1}"#);
    }

    #[test]
    fn single_function_object_extracts() {
        let text = r#"好的 {"name": "lookup", "arguments": {"q": "rust"}} 继续"#;
        let calls = extract_tool_invocations(text, 200_000).unwrap();
        assert_eq!(calls[0].function.name, "lookup");
        assert_eq!(calls[0].function.arguments, r#"{"q":"rust"}"#);
        assert!(calls[0].id.starts_with("call_"));
    }

    #[test]
    fn natural_language_call_extracts() {
        let text = r#"调用函数: get_weather 参数: {"city": "北京"}"#;
        let calls = extract_tool_invocations(text, 200_000).unwrap();
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(calls[0].function.arguments, r#"{"city": "北京"}"#);
    }

    #[test]
    fn braces_inside_argument_strings_do_not_confuse_the_scanner() {
        let text = r#"{"tool_calls":[{"id":"a","type":"function","function":{"name":"f","arguments":"{\"code\":\"if (x) { y(); }\"}"}}]}"#;
        let calls = extract_tool_invocations(text, 200_000).unwrap();
        assert_eq!(calls[0].function.arguments, r#"{"code":"if (x) { y(); }"}"#);
    }

    #[test]
    fn empty_and_plain_text_extract_nothing() {
        assert!(extract_tool_invocations("", 200_000).is_none());
        assert!(extract_tool_invocations("就是普通文本而已", 200_000).is_none());
    }

    #[test]
    fn scan_limit_bounds_the_search() {
        let text = format!("{}{}", "x".repeat(100), WRAPPED);
        assert!(extract_tool_invocations(&text, 50).is_none());
        assert!(extract_tool_invocations(&text, 100_000).is_some());
    }

    #[test]
    fn normalize_handles_edge_shapes() {
        assert_eq!(normalize_arguments(""), "{}");
        assert_eq!(normalize_arguments("  "), "{}");
        assert_eq!(normalize_arguments(r#"{"a":1}"#), r#"{"a":1}"#);
        assert_eq!(normalize_arguments("{'a': 1}"), r#"{"a": 1}"#);
        // unrepairable input survives untouched
        assert_eq!(normalize_arguments("not json"), "not json");
    }

    #[test]
    fn strip_removes_fenced_tool_json() {
        let visible = "这是答案";
        let text = format!("{}\n```json\n{}\n```", visible, WRAPPED);
        assert_eq!(strip_tool_json(&text), visible);
    }

    #[test]
    fn strip_removes_inline_tool_json() {
        let text = format!("前文 {} 后文", WRAPPED);
        assert_eq!(strip_tool_json(&text), "前文  后文");
    }

    #[test]
    fn strip_keeps_ordinary_fences() {
        let text = "```json\n{\"data\": 1}\n```";
        assert_eq!(strip_tool_json(text), text);
    }

    #[test]
    fn missing_ids_are_generated_unique() {
        let text = r#"{"tool_calls":[{"type":"function","function":{"name":"a"}},{"type":"function","function":{"name":"b"}}]}"#;
        let calls = extract_tool_invocations(text, 200_000).unwrap();
        assert_eq!(calls.len(), 2);
        assert_ne!(calls[0].id, calls[1].id);
        assert_eq!(calls[0].function.arguments, "{}");
    }

    #[test]
    fn visible_prefix_holds_back_open_fence() {
        let text = "答案开始 ```json\n{\"tool";
        let n = visible_prefix_len(text);
        assert_eq!(&text[..n], "答案开始 ");
    }

    #[test]
    fn visible_prefix_holds_back_open_brace() {
        let text = "ok {\"tool_calls\":[";
        assert_eq!(visible_prefix_len(text), 3);
    }

    #[test]
    fn visible_prefix_passes_complete_text() {
        let text = "plain answer with {\"done\": true} inline";
        assert_eq!(visible_prefix_len(text), text.len());
    }
}
