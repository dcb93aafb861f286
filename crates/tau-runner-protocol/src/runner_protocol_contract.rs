//! Raw session and message records reported by runner CLI backends.
//!
//! Each backend (tmux-scraped terminals, line-streamed JSON processes and
//! SDK processes) emits slightly different message shapes. The records here
//! keep every field the sync engine may consult and leave interpretation to
//! the normalizer on the bridge side.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Separator between CLI type and external session id in a session key.
pub const SESSION_KEY_SEPARATOR: char = ':';

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
/// Enumerates supported coding-assistant CLI backends.
pub enum CliType {
    #[default]
    Claude,
    Codex,
    Gemini,
}

impl CliType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "claude" => Some(Self::Claude),
            "codex" => Some(Self::Codex),
            "gemini" => Some(Self::Gemini),
            _ => None,
        }
    }
}

impl std::fmt::Display for CliType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the canonical `cliType:externalSessionId` identity for a session.
pub fn session_key(cli_type: CliType, external_session_id: &str) -> String {
    format!(
        "{}{}{}",
        cli_type.as_str(),
        SESSION_KEY_SEPARATOR,
        external_session_id.trim()
    )
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Nested provider message carried by most structured CLI records.
pub struct RawInnerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
/// One raw record from a CLI session transcript.
pub struct RawMessage {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub record_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<RawInnerMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_snapshot_update: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl RawMessage {
    /// Plain user or assistant text record, mainly useful for fixtures.
    pub fn text(role: &str, id: &str, text: &str) -> Self {
        Self {
            record_type: Some(role.to_string()),
            uuid: Some(id.to_string()),
            message: Some(RawInnerMessage {
                id: None,
                role: Some(role.to_string()),
                content: Some(Value::String(text.to_string())),
            }),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Session summary reported by a runner, optionally with inline messages.
pub struct RawSession {
    pub session_id: String,
    #[serde(default)]
    pub cli_type: CliType,
    #[serde(default)]
    pub project_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<RawMessage>,
}

impl RawSession {
    pub fn session_key(&self) -> String {
        session_key(self.cli_type, &self.session_id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
/// Project entry of a `sync_projects_response`.
pub struct ProjectSummary {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub session_count: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
/// Completion status carried by `*_complete` notifications.
pub enum SyncCompletionStatus {
    #[serde(alias = "complete", alias = "completed", alias = "ok")]
    Success,
    #[serde(alias = "failed", alias = "failure")]
    Error,
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{session_key, CliType, RawMessage, RawSession, SyncCompletionStatus};

    #[test]
    fn unit_session_key_prefixes_cli_type() {
        assert_eq!(session_key(CliType::Gemini, " s-1 "), "gemini:s-1");
        assert_eq!(CliType::parse("CODEX"), Some(CliType::Codex));
        assert_eq!(CliType::parse("cursor"), None);
    }

    #[test]
    fn unit_raw_session_defaults_cli_type_to_claude() {
        let session: RawSession = serde_json::from_value(json!({
            "sessionId": "abc",
            "projectPath": "/work/app",
            "messageCount": 3
        }))
        .expect("decode session");
        assert_eq!(session.cli_type, CliType::Claude);
        assert_eq!(session.session_key(), "claude:abc");
        assert_eq!(session.message_count, Some(3));
        assert!(session.messages.is_empty());
    }

    #[test]
    fn unit_raw_message_decodes_camel_case_fields() {
        let message: RawMessage = serde_json::from_value(json!({
            "type": "user",
            "uuid": "u-1",
            "toolUseResult": {"stdout": "ok"},
            "isSnapshotUpdate": true,
            "message": {"role": "user", "content": "hi"}
        }))
        .expect("decode message");
        assert_eq!(message.record_type.as_deref(), Some("user"));
        assert!(message.is_snapshot_update);
        assert_eq!(message.tool_use_result, Some(json!({"stdout": "ok"})));
        assert_eq!(
            message.message.and_then(|inner| inner.content),
            Some(json!("hi"))
        );
    }

    #[test]
    fn regression_completion_status_tolerates_unknown_values() {
        let status: SyncCompletionStatus =
            serde_json::from_value(json!("completed")).expect("alias");
        assert_eq!(status, SyncCompletionStatus::Success);
        let status: SyncCompletionStatus =
            serde_json::from_value(json!("cancelled")).expect("other");
        assert_eq!(status, SyncCompletionStatus::Unknown);
    }
}
