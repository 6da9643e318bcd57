//! Tool-emulation round trips: extraction across embeddings and content
//! stripping.

use zgate::tools::{extract_tool_invocations, strip_tool_json};

const PAYLOAD: &str = r#"{"tool_calls":[{"id":"a","type":"function","function":{"name":"f","arguments":{"x":1}}}]}"#;

fn assert_roundtrip(text: &str) {
    let calls = extract_tool_invocations(text, 200_000)
        .unwrap_or_else(|| panic!("no calls extracted from: {}", text));
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].id, "a");
    assert_eq!(calls[0].kind, "function");
    assert_eq!(calls[0].function.name, "f");
    assert_eq!(calls[0].function.arguments, r#"{"x":1}"#);
}

#[test]
fn extraction_from_fenced_block() {
    assert_roundtrip(&format!("```json\n{}\n```", PAYLOAD));
}

#[test]
fn extraction_inlined_after_prose() {
    assert_roundtrip(&format!("我需要调用一个工具。\n\n{}", PAYLOAD));
}

#[test]
fn extraction_embedded_in_longer_object() {
    let embedded = format!(r#"{{"analysis":"done","result":{},"confidence":0.9}}"#, PAYLOAD);
    // the id is lost in the single-function fallback path, but name and
    // normalized arguments survive
    let calls = extract_tool_invocations(&embedded, 200_000).unwrap();
    assert_eq!(calls[0].function.name, "f");
    assert_eq!(calls[0].function.arguments, r#"{"x":1}"#);
}

#[test]
fn strip_compose_is_identity_on_visible_text() {
    let visible = "这里是给用户看的答案。\n第二行。";
    let composed = format!("{}\n```json\n{}\n```", visible, PAYLOAD);
    assert_eq!(strip_tool_json(&composed), visible.trim());
}

#[test]
fn strip_leaves_unrelated_json_alone() {
    let text = r#"数据如下：{"count": 3, "ok": true} 完毕。"#;
    assert_eq!(strip_tool_json(text), text);
}

#[test]
fn strip_handles_inline_and_fenced_together() {
    let composed = format!("开头 {} 中间\n```json\n{}\n```\n结尾", PAYLOAD, PAYLOAD);
    let stripped = strip_tool_json(&composed);
    assert!(!stripped.contains("tool_calls"));
    assert!(stripped.contains("开头"));
    assert!(stripped.contains("结尾"));
}

#[test]
fn multiple_calls_in_one_payload() {
    let text = r#"{"tool_calls":[
        {"id":"c1","type":"function","function":{"name":"first","arguments":"{}"}},
        {"id":"c2","type":"function","function":{"name":"second","arguments":{"k":"v"}}}
    ]}"#;
    let calls = extract_tool_invocations(text, 200_000).unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].function.name, "first");
    assert_eq!(calls[1].function.arguments, r#"{"k":"v"}"#);
}

#[test]
fn single_quoted_arguments_are_repaired() {
    let text = r#"{"tool_calls":[{"id":"q","type":"function","function":{"name":"f","arguments":"{'a': 'b'}"}}]}"#;
    let calls = extract_tool_invocations(text, 200_000).unwrap();
    assert_eq!(calls[0].function.arguments, r#"{"a": "b"}"#);
}
