//! Character-class-weighted approximate token counting.
//!
//! The upstream does not report token usage for every response, so prompt and
//! completion totals are estimated here. Weights: CJK ideographs 1.4,
//! CJK symbols/full-width forms 1.0, ASCII 0.25, everything else 0.5.

use crate::models::Message;
use crate::tools::{Tool, ToolCall};

pub fn count_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }

    let mut tokens = 0.0f64;
    for c in text.chars() {
        let cp = c as u32;
        tokens += match cp {
            0x4E00..=0x9FFF
            | 0x3400..=0x4DBF
            | 0x20000..=0x2A6DF
            | 0xF900..=0xFAFF
            | 0x2F800..=0x2FA1F => 1.4,
            0x3000..=0x303F | 0xFF00..=0xFFEF => 1.0,
            0x0000..=0x007F => 0.25,
            _ => 0.5,
        };
    }

    let rounded = (tokens + 0.5) as u64;
    rounded.max(1)
}

pub fn count_messages_tokens(messages: &[Message]) -> u64 {
    let mut total = 0;
    for msg in messages {
        total += 4;
        total += count_tokens(&msg.role);
        total += count_tokens(&msg.content_text());
    }
    total + 3
}

pub fn count_tools_tokens(tools: &[Tool]) -> u64 {
    if tools.is_empty() {
        return 0;
    }

    let mut total = 0;
    for tool in tools {
        total += count_tokens(&tool.kind);
        total += 3;
        total += count_tokens(&tool.function.name);
        total += count_tokens(tool.function.description.as_deref().unwrap_or(""));
        if let Some(params) = &tool.function.parameters {
            total += count_tokens(&params.to_string());
        }
        total += 6;
    }
    total + 4
}

pub fn count_tool_call_tokens(calls: &[ToolCall]) -> u64 {
    let mut total = 0;
    for tc in calls {
        total += count_tokens(&tc.id);
        total += count_tokens(&tc.kind);
        total += count_tokens(&tc.function.name);
        total += count_tokens(&tc.function.arguments);
        total += 8;
    }
    total
}

/// Prompt-side estimate for a full translated request.
pub fn count_request_tokens(messages: &[Message], tools: &[Tool]) -> u64 {
    count_messages_tokens(messages) + count_tools_tokens(tools)
}
