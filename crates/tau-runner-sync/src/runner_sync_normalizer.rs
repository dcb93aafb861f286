//! Canonicalizes heterogeneous CLI transcript records.
//!
//! Every backend record is matched into a closed set of [`ContentBlock`]
//! variants. Records that only carry CLI bookkeeping, or that carry nothing
//! displayable, are dropped rather than reported as errors.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tau_runner_protocol::RawMessage;

const INTERNAL_RECORD_TYPES: [&str; 5] = [
    "queue-operation",
    "file-history-snapshot",
    "progress",
    "snapshot",
    "summary-snapshot",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    fn from_hint(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" | "human" | "user_input" | "prompt" => Some(Self::User),
            "assistant" | "model" | "agent" | "ai" | "gemini" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
/// Canonical content block. Each variant has its own rendering rule.
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: Option<String>,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: Option<String>,
        content: String,
        is_error: bool,
    },
    Plan {
        plan: String,
        explanation: Option<String>,
    },
    ApprovalNeeded {
        tool_name: Option<String>,
        description: String,
    },
    Raw {
        value: Value,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub role: MessageRole,
    pub blocks: Vec<ContentBlock>,
    pub timestamp: Option<String>,
}

/// Normalizes a batch of raw records, preserving order and dropping records
/// with no displayable content.
pub fn normalize_messages(raw_messages: &[RawMessage]) -> Vec<NormalizedMessage> {
    raw_messages.iter().filter_map(normalize_message).collect()
}

pub fn normalize_message(raw: &RawMessage) -> Option<NormalizedMessage> {
    if is_internal_record(raw) {
        return None;
    }
    let blocks = extract_blocks(raw)?;
    if blocks.is_empty() {
        return None;
    }
    Some(NormalizedMessage {
        role: resolve_role(raw),
        blocks,
        timestamp: raw.timestamp.clone(),
    })
}

pub fn is_internal_record(raw: &RawMessage) -> bool {
    if raw.is_snapshot_update {
        return true;
    }
    raw.record_type
        .as_deref()
        .map(|record_type| INTERNAL_RECORD_TYPES.contains(&record_type))
        .unwrap_or(false)
}

fn resolve_role(raw: &RawMessage) -> MessageRole {
    raw.role
        .as_deref()
        .and_then(MessageRole::from_hint)
        .or_else(|| raw.record_type.as_deref().and_then(MessageRole::from_hint))
        .or_else(|| {
            raw.message
                .as_ref()
                .and_then(|inner| inner.role.as_deref())
                .and_then(MessageRole::from_hint)
        })
        .or_else(|| source_role_hint(raw))
        .unwrap_or(MessageRole::Assistant)
}

fn source_role_hint(raw: &RawMessage) -> Option<MessageRole> {
    raw.source
        .as_deref()
        .or_else(|| {
            raw.data
                .as_ref()
                .and_then(|data| data.get("source"))
                .and_then(Value::as_str)
        })
        .and_then(MessageRole::from_hint)
}

fn extract_blocks(raw: &RawMessage) -> Option<Vec<ContentBlock>> {
    if let Some(content) = raw
        .message
        .as_ref()
        .and_then(|inner| inner.content.as_ref())
        .filter(|content| !content.is_null())
    {
        return Some(parse_content(content));
    }
    let payload = raw
        .data
        .as_ref()
        .filter(|value| !value.is_null())
        .or_else(|| raw.tool_use_result.as_ref().filter(|value| !value.is_null()))?;
    parse_payload(payload, raw.tool_use_id.as_deref())
}

fn parse_content(content: &Value) -> Vec<ContentBlock> {
    match content {
        Value::Array(items) => parse_block_array(items),
        other => parse_block(other).into_iter().collect(),
    }
}

fn parse_payload(payload: &Value, tool_use_id: Option<&str>) -> Option<Vec<ContentBlock>> {
    match payload {
        Value::String(text) => Some(text_block(text).into_iter().collect()),
        Value::Array(items) => Some(parse_block_array(items)),
        Value::Object(object) => {
            if let Some(text) = object.get("text").and_then(Value::as_str) {
                return Some(text_block(text).into_iter().collect());
            }
            if let Some(blocks) = object.get("blocks").and_then(Value::as_array) {
                return Some(parse_block_array(blocks));
            }
            if let Some(output) = object.get("output") {
                return Some(vec![ContentBlock::ToolResult {
                    tool_use_id: tool_use_id.map(str::to_string),
                    content: value_to_text(output),
                    is_error: object_is_error(object),
                }]);
            }
            if let Some(message) = object.get("message").and_then(Value::as_str) {
                return Some(text_block(message).into_iter().collect());
            }
            None
        }
        _ => None,
    }
}

fn parse_block_array(items: &[Value]) -> Vec<ContentBlock> {
    items.iter().filter_map(parse_block).collect()
}

fn parse_block(value: &Value) -> Option<ContentBlock> {
    let object = match value {
        Value::String(text) => return text_block(text),
        Value::Object(object) => object,
        Value::Null => return None,
        other => {
            return Some(ContentBlock::Raw {
                value: other.clone(),
            })
        }
    };
    let Some(block_type) = object.get("type").and_then(Value::as_str) else {
        return match object.get("text").and_then(Value::as_str) {
            Some(text) => text_block(text),
            None => Some(ContentBlock::Raw {
                value: value.clone(),
            }),
        };
    };
    match block_type {
        "text" | "input_text" | "output_text" => text_block(string_field(object, "text")),
        "thinking" | "reasoning" => {
            let thinking = object
                .get("thinking")
                .and_then(Value::as_str)
                .unwrap_or_else(|| string_field(object, "text"));
            if thinking.trim().is_empty() {
                None
            } else {
                Some(ContentBlock::Thinking {
                    thinking: thinking.to_string(),
                })
            }
        }
        "redacted_thinking" => None,
        "tool_use" | "server_tool_use" | "function_call" => Some(ContentBlock::ToolUse {
            id: object
                .get("id")
                .or_else(|| object.get("call_id"))
                .and_then(Value::as_str)
                .map(str::to_string),
            name: string_field(object, "name").to_string(),
            input: object
                .get("input")
                .or_else(|| object.get("arguments"))
                .cloned()
                .unwrap_or(Value::Null),
        }),
        "tool_result" | "function_call_output" => Some(ContentBlock::ToolResult {
            tool_use_id: object
                .get("tool_use_id")
                .or_else(|| object.get("call_id"))
                .and_then(Value::as_str)
                .map(str::to_string),
            content: object
                .get("content")
                .or_else(|| object.get("output"))
                .map(value_to_text)
                .unwrap_or_default(),
            is_error: object_is_error(object),
        }),
        "plan" => Some(ContentBlock::Plan {
            plan: object.get("plan").map(plan_to_text).unwrap_or_default(),
            explanation: object
                .get("explanation")
                .and_then(Value::as_str)
                .filter(|value| !value.trim().is_empty())
                .map(str::to_string),
        }),
        "approval_needed" => Some(ContentBlock::ApprovalNeeded {
            tool_name: object
                .get("tool_name")
                .or_else(|| object.get("toolName"))
                .and_then(Value::as_str)
                .map(str::to_string),
            description: object
                .get("description")
                .or_else(|| object.get("message"))
                .map(value_to_text)
                .unwrap_or_default(),
        }),
        _ => Some(ContentBlock::Raw {
            value: value.clone(),
        }),
    }
}

fn text_block(text: &str) -> Option<ContentBlock> {
    if text.trim().is_empty() {
        return None;
    }
    Some(ContentBlock::Text {
        text: text.to_string(),
    })
}

fn string_field<'a>(object: &'a Map<String, Value>, key: &str) -> &'a str {
    object.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn object_is_error(object: &Map<String, Value>) -> bool {
    object
        .get("is_error")
        .or_else(|| object.get("isError"))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn plan_to_text(plan: &Value) -> String {
    match plan {
        Value::Array(steps) => steps
            .iter()
            .map(|step| match step {
                Value::Object(object) => {
                    let status = string_field(object, "status");
                    let text = string_field(object, "step");
                    if status.is_empty() {
                        format!("- {text}")
                    } else {
                        format!("- [{status}] {text}")
                    }
                }
                other => format!("- {}", value_to_text(other)),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => value_to_text(other),
    }
}

/// Flattens a JSON payload into display text.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .map(value_to_text)
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(object) => {
            for key in ["text", "content", "output", "message", "stdout"] {
                if let Some(inner) = object.get(key) {
                    let text = value_to_text(inner);
                    if !text.is_empty() {
                        return text;
                    }
                }
            }
            serde_json::to_string_pretty(value).unwrap_or_default()
        }
        other => other.to_string(),
    }
}

/// Best-effort text for a block type this engine does not recognize.
pub fn best_effort_text(value: &Value) -> Option<String> {
    let object = value.as_object()?;
    ["text", "content", "message", "output"]
        .iter()
        .filter_map(|key| object.get(*key))
        .map(value_to_text)
        .find(|text| !text.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tau_runner_protocol::{RawInnerMessage, RawMessage};

    use super::{
        best_effort_text, normalize_message, normalize_messages, ContentBlock, MessageRole,
    };

    fn record(value: serde_json::Value) -> RawMessage {
        serde_json::from_value(value).expect("raw message")
    }

    #[test]
    fn unit_normalize_drops_internal_bookkeeping_records() {
        for record_type in ["queue-operation", "file-history-snapshot", "progress", "snapshot"] {
            let raw = record(json!({
                "type": record_type,
                "message": {"role": "user", "content": "visible?"}
            }));
            assert!(normalize_message(&raw).is_none(), "{record_type}");
        }
        let snapshot = record(json!({
            "type": "user",
            "isSnapshotUpdate": true,
            "message": {"content": "hidden"}
        }));
        assert!(normalize_message(&snapshot).is_none());
    }

    #[test]
    fn functional_normalize_claude_assistant_record_with_mixed_blocks() {
        let raw = record(json!({
            "type": "assistant",
            "uuid": "a1",
            "message": {
                "id": "msg_1",
                "role": "assistant",
                "content": [
                    {"type": "thinking", "thinking": "consider files"},
                    {"type": "text", "text": "Running tests"},
                    {"type": "tool_use", "id": "toolu_1", "name": "Bash", "input": {"command": "cargo test"}},
                    {"type": "image", "source": {"data": "..."}}
                ]
            }
        }));
        let normalized = normalize_message(&raw).expect("normalized");
        assert_eq!(normalized.role, MessageRole::Assistant);
        assert_eq!(normalized.blocks.len(), 4);
        assert_eq!(
            normalized.blocks[0],
            ContentBlock::Thinking {
                thinking: "consider files".to_string()
            }
        );
        assert!(matches!(
            &normalized.blocks[2],
            ContentBlock::ToolUse { name, .. } if name == "Bash"
        ));
        assert!(matches!(&normalized.blocks[3], ContentBlock::Raw { .. }));
    }

    #[test]
    fn functional_normalize_tool_result_record_as_user_output() {
        let raw = record(json!({
            "type": "user",
            "message": {
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": "toolu_1",
                    "is_error": true,
                    "content": [{"type": "text", "text": "error: failed"}]
                }]
            }
        }));
        let normalized = normalize_message(&raw).expect("normalized");
        assert_eq!(normalized.role, MessageRole::User);
        assert_eq!(
            normalized.blocks,
            vec![ContentBlock::ToolResult {
                tool_use_id: Some("toolu_1".to_string()),
                content: "error: failed".to_string(),
                is_error: true,
            }]
        );
    }

    #[test]
    fn functional_normalize_data_payload_shapes() {
        let text = record(json!({"data": "plain"}));
        assert_eq!(
            normalize_message(&text).expect("string").blocks,
            vec![ContentBlock::Text {
                text: "plain".to_string()
            }]
        );

        let blocks = record(json!({"data": {"blocks": [{"type": "text", "text": "a"}, "b"]}}));
        assert_eq!(normalize_message(&blocks).expect("blocks").blocks.len(), 2);

        let output = record(json!({
            "toolUseId": "call_1",
            "toolUseResult": {"output": "done", "is_error": false}
        }));
        assert_eq!(
            normalize_message(&output).expect("output").blocks,
            vec![ContentBlock::ToolResult {
                tool_use_id: Some("call_1".to_string()),
                content: "done".to_string(),
                is_error: false,
            }]
        );

        let message = record(json!({"data": {"message": "status line"}}));
        assert_eq!(normalize_message(&message).expect("message").blocks.len(), 1);

        let unknown = record(json!({"data": {"percent": 40}}));
        assert!(normalize_message(&unknown).is_none());
    }

    #[test]
    fn unit_role_resolution_order_and_default() {
        let explicit = record(json!({"role": "user", "data": "x"}));
        assert_eq!(normalize_message(&explicit).expect("m").role, MessageRole::User);

        let nested = RawMessage {
            message: Some(RawInnerMessage {
                id: None,
                role: Some("system".to_string()),
                content: Some(json!("boot")),
            }),
            ..RawMessage::default()
        };
        assert_eq!(normalize_message(&nested).expect("m").role, MessageRole::System);

        let source_hint = record(json!({"data": {"source": "user_input", "text": "hi"}}));
        assert_eq!(
            normalize_message(&source_hint).expect("m").role,
            MessageRole::User
        );

        let unknown = record(json!({"data": "x"}));
        assert_eq!(
            normalize_message(&unknown).expect("m").role,
            MessageRole::Assistant
        );
    }

    #[test]
    fn functional_normalize_plan_and_approval_blocks() {
        let raw = record(json!({
            "type": "assistant",
            "message": {"content": [
                {"type": "plan", "plan": [
                    {"step": "read code", "status": "completed"},
                    {"step": "write tests", "status": "pending"}
                ], "explanation": "two steps"},
                {"type": "approval_needed", "tool_name": "Bash", "description": "rm -rf target"}
            ]}
        }));
        let normalized = normalize_message(&raw).expect("normalized");
        assert_eq!(
            normalized.blocks[0],
            ContentBlock::Plan {
                plan: "- [completed] read code\n- [pending] write tests".to_string(),
                explanation: Some("two steps".to_string()),
            }
        );
        assert_eq!(
            normalized.blocks[1],
            ContentBlock::ApprovalNeeded {
                tool_name: Some("Bash".to_string()),
                description: "rm -rf target".to_string(),
            }
        );
    }

    #[test]
    fn regression_empty_records_are_dropped_not_errors() {
        let raw = vec![
            record(json!({"type": "assistant", "message": {"content": []}})),
            record(json!({"type": "assistant", "message": {"content": "   "}})),
            record(json!({"type": "assistant"})),
            RawMessage::text("user", "u1", "kept"),
        ];
        let normalized = normalize_messages(&raw);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].role, MessageRole::User);
    }

    #[test]
    fn unit_best_effort_text_reads_common_fields() {
        assert_eq!(
            best_effort_text(&json!({"type": "custom", "content": "hello"})),
            Some("hello".to_string())
        );
        assert_eq!(best_effort_text(&json!({"type": "image"})), None);
    }
}
