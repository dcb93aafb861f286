//! Chat-platform rendering of normalized content blocks.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tau_runner_protocol::CliType;

use crate::runner_sync_normalizer::{best_effort_text, ContentBlock, MessageRole, NormalizedMessage};

/// Format version that predates plan and approval blocks.
pub const SYNC_FORMAT_VERSION_LEGACY: u32 = 1;
/// First format version whose sessions render plan and approval blocks.
pub const SYNC_FORMAT_VERSION_RICH_BLOCKS: u32 = 2;
pub const APPROVAL_ACTION_PREFIX: &str = "sync_attach";

const TOOL_SUMMARY_MAX_CHARS: usize = 1_000;
const CONTINUED_MARKER: &str = " (continued)";

pub const COLOR_USER: u32 = 0x3498db;
pub const COLOR_SYSTEM: u32 = 0x95a5a6;
pub const COLOR_THINKING: u32 = 0x9b59b6;
pub const COLOR_TOOL_USE: u32 = 0xe67e22;
pub const COLOR_TOOL_OUTPUT: u32 = 0x2ecc71;
pub const COLOR_TOOL_ERROR: u32 = 0xe74c3c;
pub const COLOR_PLAN: u32 = 0x1abc9c;
pub const COLOR_APPROVAL: u32 = 0xf1c40f;
pub const COLOR_NOTICE: u32 = 0x7f8c8d;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Embed {
    pub title: Option<String>,
    pub description: String,
    pub color: u32,
    pub fields: Vec<EmbedField>,
}

impl Embed {
    pub fn new(title: impl Into<String>, description: impl Into<String>, color: u32) -> Self {
        Self {
            title: Some(title.into()),
            description: description.into(),
            color,
            fields: Vec::new(),
        }
    }

    fn with_field(mut self, name: &str, value: impl Into<String>, inline: bool) -> Self {
        self.fields.push(EmbedField {
            name: name.to_string(),
            value: value.into(),
            inline,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Interactive control attached to a posted message.
pub struct MessageAction {
    pub action_id: String,
    pub label: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// One post to a chat thread.
pub struct OutboundMessage {
    pub content: Option<String>,
    pub embeds: Vec<Embed>,
    pub actions: Vec<MessageAction>,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn embed(embed: Embed) -> Self {
        Self {
            embeds: vec![embed],
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content
            .as_deref()
            .map(|content| content.trim().is_empty())
            .unwrap_or(true)
            && self.embeds.is_empty()
            && self.actions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Per-session rendering parameters.
pub struct RenderContext {
    pub runner_id: String,
    pub session_key: String,
    pub sync_format_version: u32,
    pub message_chunk_chars: usize,
    pub embed_chunk_chars: usize,
}

/// Splits text into chunks of at most `max_chars` characters.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    if text.is_empty() || max_chars == 0 {
        return Vec::new();
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    for ch in text.chars() {
        current.push(ch);
        current_len = current_len.saturating_add(1);
        if current_len >= max_chars {
            chunks.push(current);
            current = String::new();
            current_len = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Truncates to at most `max_chars` characters including a trailing `...`.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    let mut truncated = text.chars().take(keep).collect::<String>();
    truncated.push_str("...");
    truncated
}

pub fn approval_action_id(runner_id: &str, session_key: &str) -> String {
    format!("{APPROVAL_ACTION_PREFIX}:{runner_id}:{session_key}")
}

/// Thread name for a synced session: `[cli] first prompt`.
pub fn thread_title(
    cli_type: CliType,
    first_prompt: Option<&str>,
    external_session_id: &str,
    max_chars: usize,
) -> String {
    let prompt = first_prompt
        .map(|prompt| prompt.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|prompt| !prompt.is_empty())
        .unwrap_or_else(|| format!("session {}", external_session_id.trim()));
    truncate_chars(&format!("[{cli_type}] {prompt}"), max_chars)
}

/// Introductory message posted once when a session thread is created.
pub fn intro_summary(
    cli_type: CliType,
    external_session_id: &str,
    project_path: &str,
    message_count: Option<usize>,
    first_prompt: Option<&str>,
) -> OutboundMessage {
    let description = first_prompt
        .map(str::trim)
        .filter(|prompt| !prompt.is_empty())
        .map(|prompt| truncate_chars(prompt, TOOL_SUMMARY_MAX_CHARS))
        .unwrap_or_else(|| "(no prompt recorded)".to_string());
    let embed = Embed::new("Synced session", description, COLOR_NOTICE)
        .with_field("CLI", cli_type.as_str(), true)
        .with_field("Session", external_session_id, true)
        .with_field("Project", project_path, false)
        .with_field(
            "Messages",
            message_count
                .map(|count| count.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            true,
        );
    OutboundMessage::embed(embed)
}

/// Notice posted before a truncated history import.
pub fn truncation_notice(skipped: usize, kept: usize) -> OutboundMessage {
    OutboundMessage::embed(Embed::new(
        "History truncated",
        format!("Skipped {skipped} earlier messages; showing the most recent {kept}."),
        COLOR_NOTICE,
    ))
}

/// Renders every block of a normalized message in order.
pub fn render_message(message: &NormalizedMessage, context: &RenderContext) -> Vec<OutboundMessage> {
    message
        .blocks
        .iter()
        .flat_map(|block| render_block(message.role, block, context))
        .filter(|outbound| !outbound.is_empty())
        .collect()
}

pub fn render_block(
    role: MessageRole,
    block: &ContentBlock,
    context: &RenderContext,
) -> Vec<OutboundMessage> {
    let rich = context.sync_format_version >= SYNC_FORMAT_VERSION_RICH_BLOCKS;
    match block {
        ContentBlock::Text { text } => render_text(role, text, context),
        ContentBlock::Thinking { thinking } => chunk_text(thinking.trim(), context.embed_chunk_chars)
            .into_iter()
            .map(|chunk| OutboundMessage::embed(Embed::new("Thinking", chunk, COLOR_THINKING)))
            .collect(),
        ContentBlock::ToolUse { name, input, .. } => {
            let title = if name.trim().is_empty() {
                "Tool".to_string()
            } else {
                format!("Tool: {name}")
            };
            let summary = truncate_chars(
                &tool_use_summary(name, input),
                context.embed_chunk_chars.min(TOOL_SUMMARY_MAX_CHARS),
            );
            vec![OutboundMessage::embed(Embed::new(
                title,
                summary,
                COLOR_TOOL_USE,
            ))]
        }
        ContentBlock::ToolResult {
            content, is_error, ..
        } => render_tool_result(content, *is_error, context),
        ContentBlock::Plan { plan, explanation } if rich => {
            let mut description = plan.trim().to_string();
            if let Some(explanation) = explanation {
                if !description.is_empty() {
                    description.push_str("\n\n");
                }
                description.push_str(explanation.trim());
            }
            if description.is_empty() {
                return Vec::new();
            }
            vec![OutboundMessage::embed(Embed::new(
                "Plan",
                truncate_chars(&description, context.embed_chunk_chars),
                COLOR_PLAN,
            ))]
        }
        ContentBlock::ApprovalNeeded {
            tool_name,
            description,
        } if rich => {
            let mut embed = Embed::new(
                "Approval needed",
                truncate_chars(description.trim(), context.embed_chunk_chars),
                COLOR_APPROVAL,
            );
            if let Some(tool_name) = tool_name {
                embed = embed.with_field("Tool", tool_name.as_str(), true);
            }
            vec![OutboundMessage {
                content: None,
                embeds: vec![embed],
                actions: vec![MessageAction {
                    action_id: approval_action_id(&context.runner_id, &context.session_key),
                    label: "Attach to session".to_string(),
                }],
            }]
        }
        ContentBlock::Plan { .. } | ContentBlock::ApprovalNeeded { .. } => Vec::new(),
        ContentBlock::Raw { value } => best_effort_text(value)
            .map(|text| render_text(role, &text, context))
            .unwrap_or_default(),
    }
}

fn render_text(role: MessageRole, text: &str, context: &RenderContext) -> Vec<OutboundMessage> {
    let text = text.trim();
    match role {
        MessageRole::Assistant => chunk_text(text, context.message_chunk_chars)
            .into_iter()
            .map(OutboundMessage::text)
            .collect(),
        MessageRole::User => chunk_text(text, context.embed_chunk_chars)
            .into_iter()
            .map(|chunk| OutboundMessage::embed(Embed::new("User", chunk, COLOR_USER)))
            .collect(),
        MessageRole::System => chunk_text(text, context.embed_chunk_chars)
            .into_iter()
            .map(|chunk| OutboundMessage::embed(Embed::new("System", chunk, COLOR_SYSTEM)))
            .collect(),
    }
}

fn render_tool_result(content: &str, is_error: bool, context: &RenderContext) -> Vec<OutboundMessage> {
    let (title, color) = if is_error {
        ("Error", COLOR_TOOL_ERROR)
    } else {
        ("Output", COLOR_TOOL_OUTPUT)
    };
    let trimmed = content.trim_end();
    if trimmed.trim().is_empty() {
        return vec![OutboundMessage::embed(Embed::new(title, "(no output)", color))];
    }
    // Leave room for the code fence around each chunk.
    let chunk_chars = context.embed_chunk_chars.saturating_sub(8).max(1);
    let chunks = chunk_text(trimmed, chunk_chars);
    let last = chunks.len().saturating_sub(1);
    chunks
        .into_iter()
        .enumerate()
        .map(|(index, chunk)| {
            let title = if index < last {
                format!("{title}{CONTINUED_MARKER}")
            } else {
                title.to_string()
            };
            OutboundMessage::embed(Embed::new(title, format!("```\n{chunk}\n```"), color))
        })
        .collect()
}

/// One-line description of a tool invocation, specialized for common tools.
pub fn tool_use_summary(name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(Value::as_str).map(str::trim);
    let summary = match name {
        "Bash" => field("command").map(|command| format!("$ {command}")),
        "shell" | "exec_command" | "local_shell" => match input.get("command") {
            Some(Value::Array(parts)) => Some(format!(
                "$ {}",
                parts
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(" ")
            )),
            Some(Value::String(command)) => Some(format!("$ {command}")),
            _ => None,
        },
        "Read" | "Write" | "Edit" | "MultiEdit" | "NotebookEdit" => {
            field("file_path").or_else(|| field("notebook_path")).map(str::to_string)
        }
        "Grep" | "Glob" => field("pattern").map(|pattern| match field("path") {
            Some(path) if !path.is_empty() => format!("{pattern} in {path}"),
            _ => pattern.to_string(),
        }),
        "WebFetch" => field("url").map(str::to_string),
        "WebSearch" => field("query").map(str::to_string),
        "Task" => field("description").map(str::to_string),
        "TodoWrite" => input
            .get("todos")
            .and_then(Value::as_array)
            .map(|todos| format!("{} todo items", todos.len())),
        _ => None,
    };
    summary.unwrap_or_else(|| match input {
        Value::Null => String::new(),
        other => truncate_chars(&other.to_string(), TOOL_SUMMARY_MAX_CHARS),
    })
}
