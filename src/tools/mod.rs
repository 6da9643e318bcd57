//! Function-calling emulation over an upstream without a native tool API.
//!
//! Tool schemas are injected into the system prompt as a Markdown catalog
//! with strict output-format instructions; tool invocations are scraped back
//! out of the assistant's free-form text by [`extract`].

mod extract;

pub use extract::{clean_tool_json, extract_tool_invocations, normalize_arguments, strip_tool_json};
pub(crate) use extract::visible_prefix_len;

use crate::models::{ContentPart, Message, MessageContent};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// OpenAI tool definition as received in a chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

/// Emitted (or replayed) tool call. `arguments` is always a JSON string on
/// the wire; object forms arriving from lenient clients are re-serialized
/// during deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "default_call_kind")]
    pub kind: String,
    pub function: ToolCallFunction,
}

fn default_call_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    #[serde(default, deserialize_with = "string_or_json")]
    pub arguments: String,
}

/// Accept `arguments` as either a JSON string or a bare object/array and
/// normalize to the string form OpenAI requires.
fn string_or_json<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => s,
        Value::Null => "{}".to_string(),
        other => other.to_string(),
    })
}

/// Build the Markdown tool catalog plus invocation instructions that get
/// appended to the system prompt. Empty when no function tools are present.
pub fn generate_tool_prompt(tools: &[Tool], tool_choice: Option<&Value>) -> String {
    let mut defs = Vec::new();

    for tool in tools {
        if tool.kind != "function" {
            continue;
        }
        let func = &tool.function;

        let mut info = format!(
            "### {}\n{}",
            func.name,
            func.description.as_deref().unwrap_or("")
        );
        if let Some(params) = &func.parameters {
            if let Some(props) = params.get("properties").and_then(|p| p.as_object()) {
                if !props.is_empty() {
                    let required: Vec<&str> = params
                        .get("required")
                        .and_then(|r| r.as_array())
                        .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
                        .unwrap_or_default();

                    info.push_str("\n**参数:**");
                    for (name, details) in props {
                        let param_type = details.get("type").and_then(|v| v.as_str()).unwrap_or("");
                        let desc = details
                            .get("description")
                            .and_then(|v| v.as_str())
                            .unwrap_or("");
                        let req_mark = if required.contains(&name.as_str()) {
                            " (必填)"
                        } else {
                            ""
                        };
                        info.push_str(&format!("\n- **{}** ({}{}): {}", name, param_type, req_mark, desc));
                        if let Some(enums) = details.get("enum").and_then(|v| v.as_array()) {
                            if !enums.is_empty() {
                                let vals: Vec<String> =
                                    enums.iter().map(|e| format!("`{}`", e)).collect();
                                info.push_str(&format!(" [可选值: {}]", vals.join(", ")));
                            }
                        }
                    }
                }
            }
        }
        defs.push(info);
    }

    if defs.is_empty() {
        return String::new();
    }

    format!(
        "\n\n# 可用工具\n{}\n\n{}",
        defs.join("\n\n"),
        tool_choice_instructions(tool_choice)
    )
}

fn tool_choice_instructions(tool_choice: Option<&Value>) -> String {
    let base = concat!(
        "# 工具调用格式\n",
        "当需要调用工具时，请严格按照以下 JSON 格式输出：\n",
        "```json\n",
        r#"{"tool_calls":[{"id":"call_1","type":"function","function":{"name":"函数名","arguments":"{\"参数名\":\"参数值\"}"}}]}"#,
        "\n```\n",
        "**重要规则：**\n",
        "1. arguments 字段必须是 JSON 字符串（双引号包裹），不是对象\n",
        "2. 调用工具时只输出 JSON，不要添加任何解释文字\n",
        "3. 可以在 tool_calls 数组中同时调用多个工具\n",
        "\n",
        "# 工具结果处理\n",
        "当你看到以 \"[已执行工具调用]\" 开头的助手消息和以 \"[工具返回结果]\" 开头的用户消息时，说明工具已经被调用并返回了结果。\n",
        "**此时你必须直接使用工具返回的数据来回答用户，绝对不要再次调用工具。**"
    );

    match tool_choice {
        Some(Value::String(s)) if s == "required" => {
            format!("{}\n4. **必须**调用至少一个工具来响应用户请求", base)
        }
        Some(Value::Object(obj)) if obj.get("type").and_then(|v| v.as_str()) == Some("function") => {
            if let Some(name) = obj
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())
            {
                return format!("{}\n4. **必须**调用 `{}` 工具来响应用户请求", base, name);
            }
            format!("{}\n4. 根据用户需求自行判断是否需要调用工具", base)
        }
        _ => format!("{}\n4. 根据用户需求自行判断是否需要调用工具", base),
    }
}

/// Rewrite the message history for the upstream and inject the tool prompt.
///
/// Tool-result and assistant-tool-call messages become plain conversational
/// turns, and the catalog is appended to the system message (one is created
/// when absent). Returns the input untouched when tool support is off, the
/// tool list is empty, or tool_choice is "none".
pub fn process_messages_with_tools(
    messages: &[Message],
    tools: &[Tool],
    tool_choice: Option<&Value>,
    tool_support: bool,
) -> Vec<Message> {
    if !tool_support || tools.is_empty() {
        return messages.to_vec();
    }
    if matches!(tool_choice, Some(Value::String(s)) if s == "none") {
        return messages.to_vec();
    }

    let tool_prompt = generate_tool_prompt(tools, tool_choice);
    if tool_prompt.is_empty() {
        return messages.to_vec();
    }

    let mut processed: Vec<Message> = messages
        .iter()
        .map(|msg| {
            if msg.role == "assistant" && msg.tool_calls.as_ref().is_some_and(|tc| !tc.is_empty()) {
                rewrite_assistant_tool_calls(msg)
            } else if msg.role == "tool" {
                rewrite_tool_result(msg)
            } else {
                msg.clone()
            }
        })
        .collect();

    if let Some(system) = processed.iter_mut().find(|m| m.role == "system") {
        system.content = Some(append_text(system.content.take(), &tool_prompt));
    } else {
        let system = Message::text(
            "system",
            format!("你是一个智能助手，能够帮助用户完成各种任务。{}", tool_prompt),
        );
        processed.insert(0, system);
    }

    processed
}

/// Assistant turns that carried tool_calls are replayed as plain text so the
/// upstream sees a coherent conversation.
fn rewrite_assistant_tool_calls(msg: &Message) -> Message {
    let mut body = String::new();
    let text = msg.content_text();
    if !text.is_empty() {
        body.push_str(&text);
        body.push_str("\n\n");
    }
    body.push_str("[已执行工具调用]\n");
    if let Some(calls) = &msg.tool_calls {
        for tc in calls {
            body.push_str(&format!(
                "- 调用了 {}，参数: {} (call_id: {})\n",
                tc.function.name, tc.function.arguments, tc.id
            ));
        }
    }
    Message::text("assistant", body)
}

/// Tool results become user turns carrying the call id.
fn rewrite_tool_result(msg: &Message) -> Message {
    let content = msg.content_text();
    let body = match msg.tool_call_id.as_deref() {
        Some(id) if !id.is_empty() => format!(
            "[工具返回结果] (call_id: {})\n以下是工具返回的数据，请直接使用这些数据回答用户：\n{}",
            id, content
        ),
        _ => format!(
            "[工具返回结果]\n以下是工具返回的数据，请直接使用这些数据回答用户：\n{}",
            content
        ),
    };
    Message::text("user", body)
}

/// Append a text suffix to message content, keeping the content shape:
/// strings get the suffix appended, part lists get it merged into the last
/// text part (or a new text part when none exists).
fn append_text(content: Option<MessageContent>, suffix: &str) -> MessageContent {
    match content {
        Some(MessageContent::Text(s)) => MessageContent::Text(format!("{}{}", s, suffix)),
        Some(MessageContent::Parts(mut parts)) => {
            let last_text = parts.iter().rposition(|p| p.kind == "text");
            match last_text {
                Some(idx) => {
                    let text = parts[idx].text.take().unwrap_or_default();
                    parts[idx].text = Some(format!("{}{}", text, suffix));
                }
                None => parts.push(ContentPart::text_part(suffix)),
            }
            MessageContent::Parts(parts)
        }
        None => MessageContent::Text(suffix.to_string()),
    }
}
