//! Streaming state machine over a recorded upstream transcript: thinking
//! chunks, then answer chunks with embedded tool JSON, then DONE.

use zgate::models::ChatCompletionChunk;
use zgate::proxy::StreamEngine;
use zgate::upstream::parse_sse_data;

const TOOL_JSON: &str = r#"{"tool_calls":[{"id":"call_w1","type":"function","function":{"name":"get_weather","arguments":"{\"city\":\"北京\"}"}}]}"#;

fn recorded_transcript() -> String {
    let mut sse = String::new();
    let mut push = |phase: &str, delta: &str| {
        sse.push_str(&format!(
            "data: {}\n\n",
            serde_json::json!({
                "type": "chat:completion",
                "data": {"phase": phase, "delta_content": delta}
            })
        ));
    };
    push("thinking", "用户想查天气，");
    push("thinking", "需要调用工具。");
    push("answer", "好的，我来查询。\n");
    push("answer", "```json\n");
    push("answer", TOOL_JSON);
    push("answer", "\n```");
    sse.push_str("data: [DONE]\n\n");
    sse
}

struct Emitted {
    role_chunks: usize,
    content: String,
    reasoning: String,
    tool_names: Vec<String>,
    tool_args: String,
    finish_reason: Option<String>,
    saw_usage: bool,
}

fn drive(transcript: &str, show_thinking: bool) -> Emitted {
    let mut engine = StreamEngine::new("GLM-4.5".to_string(), show_thinking, 200_000, 25);
    let mut chunks: Vec<ChatCompletionChunk> = Vec::new();
    for payload in parse_sse_data(transcript) {
        chunks.extend(engine.process_payload(&payload));
    }
    chunks.extend(engine.finish());

    let mut emitted = Emitted {
        role_chunks: 0,
        content: String::new(),
        reasoning: String::new(),
        tool_names: Vec::new(),
        tool_args: String::new(),
        finish_reason: None,
        saw_usage: false,
    };
    for chunk in &chunks {
        if chunk.usage.is_some() {
            emitted.saw_usage = true;
        }
        for choice in &chunk.choices {
            if choice.delta.role.is_some() {
                emitted.role_chunks += 1;
            }
            if let Some(c) = &choice.delta.content {
                emitted.content.push_str(c);
            }
            if let Some(r) = &choice.delta.reasoning_content {
                emitted.reasoning.push_str(r);
            }
            if let Some(calls) = &choice.delta.tool_calls {
                for call in calls {
                    if let Some(f) = &call.function {
                        if let Some(name) = &f.name {
                            emitted.tool_names.push(name.clone());
                        }
                        if let Some(args) = &f.arguments {
                            emitted.tool_args.push_str(args);
                        }
                    }
                }
            }
            if let Some(reason) = &choice.finish_reason {
                emitted.finish_reason = Some(reason.clone());
            }
        }
    }
    emitted
}

#[test]
fn transcript_with_thinking_enabled() {
    let emitted = drive(&recorded_transcript(), true);

    assert_eq!(emitted.role_chunks, 1, "exactly one role chunk");
    assert_eq!(emitted.reasoning, "用户想查天气，需要调用工具。");
    // visible content equals the cleaned answer, tool JSON never leaks
    assert_eq!(emitted.content.trim(), "好的，我来查询。");
    assert!(!emitted.content.contains("tool_calls"));
    assert_eq!(emitted.tool_names, vec!["get_weather"]);
    assert_eq!(emitted.tool_args, r#"{"city":"北京"}"#);
    assert_eq!(emitted.finish_reason.as_deref(), Some("tool_calls"));
    assert!(emitted.saw_usage);
}

#[test]
fn transcript_with_thinking_suppressed() {
    let emitted = drive(&recorded_transcript(), false);
    assert!(emitted.reasoning.is_empty());
    assert_eq!(emitted.role_chunks, 1);
    assert_eq!(emitted.finish_reason.as_deref(), Some("tool_calls"));
}

#[test]
fn plain_transcript_finishes_with_stop() {
    let sse = format!(
        "data: {}\n\ndata: [DONE]\n\n",
        serde_json::json!({
            "type": "chat:completion",
            "data": {"phase": "answer", "delta_content": "纯文本回答"}
        })
    );
    let emitted = drive(&sse, true);
    assert_eq!(emitted.content, "纯文本回答");
    assert!(emitted.tool_names.is_empty());
    assert_eq!(emitted.finish_reason.as_deref(), Some("stop"));
}

#[test]
fn finish_after_done_is_idempotent() {
    let mut engine = StreamEngine::new("m".to_string(), true, 200_000, 1);
    engine.process_payload(r#"{"type":"chat:completion","data":{"phase":"answer","delta_content":"x"}}"#);
    let first = engine.process_payload("[DONE]");
    assert!(!first.is_empty());
    assert!(engine.finish().is_empty());
}
