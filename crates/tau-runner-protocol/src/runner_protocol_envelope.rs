//! Typed `{type, data}` envelopes exchanged with runners.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::runner_protocol_contract::{
    CliType, ProjectSummary, RawMessage, RawSession, SyncCompletionStatus,
};

#[derive(Debug, Error)]
/// Errors raised while decoding or encoding runner envelopes.
pub enum RunnerProtocolError {
    #[error("runner envelope is not valid json: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("runner envelope '{event_type}' has an invalid payload: {source}")]
    InvalidPayload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode runner request: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncProjectsResponse {
    pub request_id: String,
    #[serde(default)]
    pub projects: Vec<ProjectSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSessionsResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub project_path: String,
    #[serde(default)]
    pub sessions: Vec<RawSession>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_format_version: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusResponse {
    pub request_id: String,
    #[serde(default)]
    pub status: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncProjectsProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncProjectsComplete {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub status: SyncCompletionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSessionsComplete {
    pub project_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub status: SyncCompletionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSessionDiscovered {
    pub session: RawSession,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSessionUpdated {
    pub session: RawSession,
    #[serde(default)]
    pub new_messages: Vec<RawMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSessionMessagesResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub session_id: String,
    pub project_path: String,
    #[serde(default)]
    pub cli_type: CliType,
    #[serde(default)]
    pub messages: Vec<RawMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_format_version: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
/// Inbound runner events: pull responses and unsolicited push notifications.
pub enum RunnerEvent {
    SyncProjectsResponse(SyncProjectsResponse),
    SyncSessionsResponse(SyncSessionsResponse),
    SyncStatusResponse(SyncStatusResponse),
    SyncProjectsProgress(SyncProjectsProgress),
    SyncProjectsComplete(SyncProjectsComplete),
    SyncSessionsComplete(SyncSessionsComplete),
    SyncSessionDiscovered(SyncSessionDiscovered),
    SyncSessionUpdated(SyncSessionUpdated),
    SyncSessionMessagesResponse(SyncSessionMessagesResponse),
}

impl RunnerEvent {
    pub const KNOWN_TYPES: [&'static str; 9] = [
        "sync_projects_response",
        "sync_sessions_response",
        "sync_status_response",
        "sync_projects_progress",
        "sync_projects_complete",
        "sync_sessions_complete",
        "sync_session_discovered",
        "sync_session_updated",
        "sync_session_messages_response",
    ];

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SyncProjectsResponse(_) => "sync_projects_response",
            Self::SyncSessionsResponse(_) => "sync_sessions_response",
            Self::SyncStatusResponse(_) => "sync_status_response",
            Self::SyncProjectsProgress(_) => "sync_projects_progress",
            Self::SyncProjectsComplete(_) => "sync_projects_complete",
            Self::SyncSessionsComplete(_) => "sync_sessions_complete",
            Self::SyncSessionDiscovered(_) => "sync_session_discovered",
            Self::SyncSessionUpdated(_) => "sync_session_updated",
            Self::SyncSessionMessagesResponse(_) => "sync_session_messages_response",
        }
    }

    pub fn is_known_type(event_type: &str) -> bool {
        Self::KNOWN_TYPES.contains(&event_type)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncProjectsRequest {
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSessionsRequest {
    pub project_path: String,
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusRequest {
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSessionMessagesRequest {
    pub session_id: String,
    pub project_path: String,
    pub cli_type: CliType,
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
/// Outbound pull requests. Resends reuse the same request id.
pub enum RunnerRequest {
    SyncProjects(SyncProjectsRequest),
    SyncSessions(SyncSessionsRequest),
    SyncStatusRequest(SyncStatusRequest),
    SyncSessionMessages(SyncSessionMessagesRequest),
}

impl RunnerRequest {
    pub fn request_id(&self) -> &str {
        match self {
            Self::SyncProjects(request) => &request.request_id,
            Self::SyncSessions(request) => &request.request_id,
            Self::SyncStatusRequest(request) => &request.request_id,
            Self::SyncSessionMessages(request) => &request.request_id,
        }
    }

    pub fn request_type(&self) -> &'static str {
        match self {
            Self::SyncProjects(_) => "sync_projects",
            Self::SyncSessions(_) => "sync_sessions",
            Self::SyncStatusRequest(_) => "sync_status_request",
            Self::SyncSessionMessages(_) => "sync_session_messages",
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    envelope_type: String,
    #[serde(default)]
    data: Value,
}

/// Decodes a runner envelope. Unknown envelope types yield `Ok(None)`.
pub fn parse_runner_envelope(raw: &str) -> Result<Option<RunnerEvent>, RunnerProtocolError> {
    let envelope =
        serde_json::from_str::<RawEnvelope>(raw).map_err(RunnerProtocolError::InvalidJson)?;
    if !RunnerEvent::is_known_type(&envelope.envelope_type) {
        return Ok(None);
    }
    let tagged = json!({
        "type": envelope.envelope_type,
        "data": envelope.data,
    });
    serde_json::from_value::<RunnerEvent>(tagged)
        .map(Some)
        .map_err(|source| RunnerProtocolError::InvalidPayload {
            event_type: envelope.envelope_type,
            source,
        })
}

pub fn encode_runner_request(request: &RunnerRequest) -> Result<String, RunnerProtocolError> {
    serde_json::to_string(request).map_err(RunnerProtocolError::Encode)
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::{
        encode_runner_request, parse_runner_envelope, RunnerEvent, RunnerProtocolError,
        RunnerRequest, SyncSessionMessagesRequest, SyncSessionsRequest,
    };
    use crate::{CliType, SyncCompletionStatus};

    #[test]
    fn unit_parse_runner_envelope_decodes_sessions_response() {
        let raw = json!({
            "type": "sync_sessions_response",
            "data": {
                "projectPath": "/work/app",
                "syncFormatVersion": 2,
                "sessions": [
                    {"sessionId": "s1", "cliType": "claude", "messageCount": 2},
                    {"sessionId": "s2", "cliType": "gemini"}
                ]
            }
        })
        .to_string();
        let Some(RunnerEvent::SyncSessionsResponse(response)) =
            parse_runner_envelope(&raw).expect("parse")
        else {
            panic!("expected sessions response");
        };
        assert_eq!(response.project_path, "/work/app");
        assert_eq!(response.sync_format_version, Some(2));
        assert_eq!(response.request_id, None);
        assert_eq!(response.sessions.len(), 2);
        assert_eq!(response.sessions[1].cli_type, CliType::Gemini);
    }

    #[test]
    fn unit_parse_runner_envelope_ignores_unknown_types() {
        let raw = r#"{"type":"terminal_output","data":{"text":"hi"}}"#;
        assert!(parse_runner_envelope(raw).expect("parse").is_none());
    }

    #[test]
    fn regression_parse_runner_envelope_reports_invalid_payloads() {
        let raw = r#"{"type":"sync_projects_complete","data":{"requestId":"r1"}}"#;
        let error = parse_runner_envelope(raw).expect_err("missing status");
        assert!(matches!(
            error,
            RunnerProtocolError::InvalidPayload { ref event_type, .. }
                if event_type == "sync_projects_complete"
        ));

        let error = parse_runner_envelope("{not json").expect_err("bad json");
        assert!(matches!(error, RunnerProtocolError::InvalidJson(_)));
    }

    #[test]
    fn functional_parse_runner_envelope_decodes_completion_notifications() {
        let raw = json!({
            "type": "sync_sessions_complete",
            "data": {
                "projectPath": "/work/app",
                "requestId": "r-9",
                "status": "error",
                "error": "disk unavailable",
                "sessionCount": 0,
                "completedAt": "2026-01-01T00:00:00Z"
            }
        })
        .to_string();
        let Some(RunnerEvent::SyncSessionsComplete(complete)) =
            parse_runner_envelope(&raw).expect("parse")
        else {
            panic!("expected sessions complete");
        };
        assert_eq!(complete.status, SyncCompletionStatus::Error);
        assert_eq!(complete.error.as_deref(), Some("disk unavailable"));
        assert_eq!(complete.request_id.as_deref(), Some("r-9"));
    }

    #[test]
    fn unit_encode_runner_request_uses_type_data_envelope() {
        let request = RunnerRequest::SyncSessions(SyncSessionsRequest {
            project_path: "/work/app".to_string(),
            request_id: "req-1".to_string(),
        });
        let encoded = encode_runner_request(&request).expect("encode");
        let value: Value = serde_json::from_str(&encoded).expect("json");
        assert_eq!(
            value,
            json!({
                "type": "sync_sessions",
                "data": {"projectPath": "/work/app", "requestId": "req-1"}
            })
        );

        let hydrate = RunnerRequest::SyncSessionMessages(SyncSessionMessagesRequest {
            session_id: "s1".to_string(),
            project_path: "/work/app".to_string(),
            cli_type: CliType::Codex,
            request_id: "req-2".to_string(),
        });
        assert_eq!(hydrate.request_type(), "sync_session_messages");
        assert_eq!(hydrate.request_id(), "req-2");
        let value: Value =
            serde_json::from_str(&encode_runner_request(&hydrate).expect("encode")).expect("json");
        assert_eq!(value["data"]["cliType"], json!("codex"));
    }
}
