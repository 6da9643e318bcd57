//! Streaming response engine: folds the upstream phase-tagged SSE events
//! into OpenAI-shaped chunks.
//!
//! Answer text is staged through the content cleaner before it becomes
//! visible: only the tail that can no longer turn into tool JSON is emitted,
//! so embedded tool invocations never leak to the client mid-stream.

use crate::models::{
    ChatCompletionChunk, ChatCompletionResponse, Choice, ChunkChoice, Delta, FunctionDelta,
    ResponseMessage, ToolCallDelta, Usage,
};
use crate::tokenizer;
use crate::tools::{self, ToolCall};
use crate::upstream::{UpstreamEvent, UpstreamUsage};
use tracing::debug;

/// Upper bound for one streamed `arguments` fragment.
const ARGUMENT_CHUNK_BYTES: usize = 1024;

pub struct StreamEngine {
    id: String,
    created: u64,
    model: String,
    show_thinking: bool,
    scan_limit: usize,
    /// Prompt-side estimate used when the upstream reports no usage.
    prompt_tokens: u64,

    sent_role: bool,
    answer_buf: String,
    thinking_buf: String,
    /// delta_content accumulated while the upstream is in an explicit
    /// tool_call phase.
    tool_phase_buf: String,
    /// Bytes of the cleaned answer already emitted to the client.
    emitted_visible: usize,
    emitted_content: String,
    upstream_usage: Option<UpstreamUsage>,
    tool_calls: Vec<ToolCall>,
    finish_reason: Option<String>,
    finished: bool,
}

impl StreamEngine {
    pub fn new(model: String, show_thinking: bool, scan_limit: usize, prompt_tokens: u64) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            created: chrono::Utc::now().timestamp() as u64,
            model,
            show_thinking,
            scan_limit,
            prompt_tokens,
            sent_role: false,
            answer_buf: String::new(),
            thinking_buf: String::new(),
            tool_phase_buf: String::new(),
            emitted_visible: 0,
            emitted_content: String::new(),
            upstream_usage: None,
            tool_calls: Vec::new(),
            finish_reason: None,
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn make_chunk(&self, delta: Delta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }

    fn ensure_role(&mut self, out: &mut Vec<ChatCompletionChunk>) {
        if !self.sent_role {
            self.sent_role = true;
            out.push(self.make_chunk(
                Delta {
                    role: Some("assistant".to_string()),
                    ..Default::default()
                },
                None,
            ));
        }
    }

    /// Emit the newly visible tail of the cleaned cumulative answer.
    fn emit_visible_tail(&mut self, out: &mut Vec<ChatCompletionChunk>) {
        let cleaned = tools::clean_tool_json(&self.answer_buf);
        let visible = tools::visible_prefix_len(&cleaned);
        // an edit_content rewrite can shift offsets off a char boundary
        if !cleaned.is_char_boundary(self.emitted_visible) {
            return;
        }
        if visible > self.emitted_visible {
            let tail = cleaned[self.emitted_visible..visible].to_string();
            self.emitted_visible = visible;
            self.emitted_content.push_str(&tail);
            self.ensure_role(out);
            out.push(self.make_chunk(
                Delta {
                    content: Some(tail),
                    ..Default::default()
                },
                None,
            ));
        }
    }

    /// Process one SSE data payload. `[DONE]` and `done=true` both close
    /// the stream.
    pub fn process_payload(&mut self, payload: &str) -> Vec<ChatCompletionChunk> {
        if self.finished {
            return Vec::new();
        }
        if payload.trim() == "[DONE]" {
            return self.finish();
        }

        let event: UpstreamEvent = match serde_json::from_str(payload) {
            Ok(event) => event,
            Err(e) => {
                debug!("unparseable upstream payload skipped: {}", e);
                return Vec::new();
            }
        };
        let data = event.data;
        let mut out = Vec::new();

        if let Some(usage) = data.usage {
            self.upstream_usage = Some(usage);
        }

        if data.error.is_some() {
            debug!("upstream signalled an error mid-stream, closing");
            out.extend(self.finish());
            return out;
        }

        match data.phase.as_deref().unwrap_or("answer") {
            "thinking" => {
                if let Some(delta) = data.delta_content.as_deref() {
                    if !delta.is_empty() {
                        self.ensure_role(&mut out);
                        self.thinking_buf.push_str(delta);
                        if self.show_thinking {
                            out.push(self.make_chunk(
                                Delta {
                                    reasoning_content: Some(delta.to_string()),
                                    ..Default::default()
                                },
                                None,
                            ));
                        }
                    }
                }
            }
            "tool_call" => {
                if let Some(delta) = data.delta_content.as_deref() {
                    self.tool_phase_buf.push_str(delta);
                }
                // some upstream builds ship the call object out-of-band
                if let Some(inner) = &data.inner {
                    if inner.get("tool_calls").is_some() {
                        self.tool_phase_buf.push_str(&inner.to_string());
                    }
                }
            }
            // answer and any unknown phase carry visible content
            _ => {
                let mut changed = false;
                if let Some(edit) = data.edit_content.as_deref() {
                    if !edit.is_empty() {
                        self.answer_buf = edit.to_string();
                        changed = true;
                    }
                }
                if let Some(delta) = data.delta_content.as_deref() {
                    if !delta.is_empty() {
                        self.answer_buf.push_str(delta);
                        changed = true;
                    }
                }
                if changed {
                    self.ensure_role(&mut out);
                    self.emit_visible_tail(&mut out);
                }
            }
        }

        if data.done == Some(true) {
            out.extend(self.finish());
        }

        out
    }

    /// Close the stream: run tool extraction, flush the remaining visible
    /// answer, emit tool-call chunks and the terminal usage chunk.
    pub fn finish(&mut self) -> Vec<ChatCompletionChunk> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut out = Vec::new();
        self.ensure_role(&mut out);

        // explicit tool_call phase first, then extraction from the answer
        self.tool_calls = tools::extract_tool_invocations(&self.tool_phase_buf, self.scan_limit)
            .or_else(|| tools::extract_tool_invocations(&self.answer_buf, self.scan_limit))
            .unwrap_or_default();

        // flush what is still held back
        let cleaned = tools::clean_tool_json(&self.answer_buf);
        let final_visible = cleaned.trim_end();
        if final_visible.len() > self.emitted_visible
            && final_visible.is_char_boundary(self.emitted_visible)
        {
            let tail = final_visible[self.emitted_visible..].to_string();
            self.emitted_content.push_str(&tail);
            out.push(self.make_chunk(
                Delta {
                    content: Some(tail),
                    ..Default::default()
                },
                None,
            ));
        }

        for (i, call) in self.tool_calls.iter().enumerate() {
            out.push(self.make_chunk(
                Delta {
                    tool_calls: Some(vec![ToolCallDelta {
                        index: i as u32,
                        id: Some(call.id.clone()),
                        kind: Some(call.kind.clone()),
                        function: Some(FunctionDelta {
                            name: Some(call.function.name.clone()),
                            arguments: None,
                        }),
                    }]),
                    ..Default::default()
                },
                None,
            ));
            for fragment in split_bounded(&call.function.arguments, ARGUMENT_CHUNK_BYTES) {
                out.push(self.make_chunk(
                    Delta {
                        tool_calls: Some(vec![ToolCallDelta {
                            index: i as u32,
                            id: None,
                            kind: None,
                            function: Some(FunctionDelta {
                                name: None,
                                arguments: Some(fragment),
                            }),
                        }]),
                        ..Default::default()
                    },
                    None,
                ));
            }
        }

        let finish_reason = if self.tool_calls.is_empty() {
            "stop".to_string()
        } else {
            "tool_calls".to_string()
        };
        self.finish_reason = Some(finish_reason.clone());

        let mut terminal = self.make_chunk(Delta::default(), Some(finish_reason));
        terminal.usage = Some(self.usage());
        out.push(terminal);

        out
    }

    /// Upstream usage passes through; any field it omits falls back to the
    /// heuristic counter over the emitted answer and tool-call strings.
    pub fn usage(&self) -> Usage {
        let estimated_completion = || {
            tokenizer::count_tokens(&self.emitted_content)
                + tokenizer::count_tool_call_tokens(&self.tool_calls)
        };
        if let Some(upstream) = &self.upstream_usage {
            if upstream.prompt_tokens.is_some() || upstream.completion_tokens.is_some() {
                let prompt = upstream.prompt_tokens.unwrap_or(self.prompt_tokens);
                let completion = upstream.completion_tokens.unwrap_or_else(estimated_completion);
                // the upstream total only holds when both parts came from it
                let complete = upstream.prompt_tokens.is_some() && upstream.completion_tokens.is_some();
                let total = match upstream.total_tokens {
                    Some(total) if complete => total,
                    _ => prompt + completion,
                };
                return Usage {
                    prompt_tokens: prompt,
                    completion_tokens: completion,
                    total_tokens: total,
                };
            }
        }
        Usage::new(self.prompt_tokens, estimated_completion())
    }

    /// Assemble the non-streaming envelope. Call after `finish()`.
    pub fn into_response(self) -> ChatCompletionResponse {
        let content = tools::strip_tool_json(&self.answer_buf);
        let reasoning = if self.show_thinking && !self.thinking_buf.is_empty() {
            Some(self.thinking_buf.clone())
        } else {
            None
        };
        let usage = self.usage();
        ChatCompletionResponse {
            id: self.id,
            object: "chat.completion".to_string(),
            created: self.created,
            model: self.model,
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: Some(content),
                    reasoning_content: reasoning,
                    tool_calls: if self.tool_calls.is_empty() {
                        None
                    } else {
                        Some(self.tool_calls)
                    },
                },
                finish_reason: self.finish_reason,
            }],
            usage,
        }
    }
}

/// Split a string into fragments of at most `max` bytes on char boundaries.
fn split_bounded(s: &str, max: usize) -> Vec<String> {
    if s.is_empty() {
        return Vec::new();
    }
    let mut fragments = Vec::new();
    let mut start = 0;
    while start < s.len() {
        let mut end = (start + max).min(s.len());
        while end > start && !s.is_char_boundary(end) {
            end -= 1;
        }
        fragments.push(s[start..end].to_string());
        start = end;
    }
    fragments
}
