//! External collaborator contracts used by the sync engine.
//!
//! The chat platform, channel directory, durable runner records and runner
//! transport are owned by the hosting service. The engine only talks to them
//! through these traits, so every suspension point is an `async` call here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tau_runner_protocol::{CliType, RunnerProtocolError, RunnerRequest};
use thiserror::Error;

use crate::runner_sync_render::OutboundMessage;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
/// Chat-platform failures. `NotFound` drives channel-loss recovery.
pub enum PlatformError {
    #[error("platform resource '{0}' was not found")]
    NotFound(String),
    #[error("platform request failed: {0}")]
    Request(String),
}

impl PlatformError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("runner '{0}' is not connected")]
    RunnerOffline(String),
    #[error("failed to send to runner '{runner_id}': {detail}")]
    Send { runner_id: String, detail: String },
}

#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("runner record store failed: {0}")]
    Backend(String),
    #[error(transparent)]
    Persistence(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
/// Engine-level failure of one sync operation. Never fatal to the process.
pub enum SyncError {
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    RecordStore(#[from] RecordStoreError),
    #[error(transparent)]
    Protocol(#[from] RunnerProtocolError),
    #[error("no project state for runner '{runner_id}' project '{project_path}'")]
    MissingProjectState {
        runner_id: String,
        project_path: String,
    },
    #[error("channel for project '{project_path}' could not be recovered: {source}")]
    ChannelUnavailable {
        project_path: String,
        #[source]
        source: PlatformError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub channel_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub thread_id: String,
    pub parent_channel_id: String,
    pub archived: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedMessage {
    pub thread_id: String,
    pub message_id: String,
}

#[async_trait]
/// Chat-platform client surface needed by the engine.
pub trait ChatPlatform: Send + Sync {
    async fn fetch_channel(&self, channel_id: &str) -> Result<ChannelInfo, PlatformError>;
    async fn fetch_thread(&self, thread_id: &str) -> Result<ThreadInfo, PlatformError>;
    async fn create_thread(&self, channel_id: &str, name: &str)
        -> Result<ThreadInfo, PlatformError>;
    async fn unarchive_thread(&self, thread_id: &str) -> Result<(), PlatformError>;
    async fn send_message(
        &self,
        thread_id: &str,
        message: &OutboundMessage,
    ) -> Result<PostedMessage, PlatformError>;
}

#[async_trait]
/// Maps runner projects to chat channels and recreates them after deletion.
pub trait ChannelDirectory: Send + Sync {
    async fn ensure_project_channel(
        &self,
        runner_id: &str,
        project_path: &str,
    ) -> Result<String, PlatformError>;
    async fn recreate_project_channel(
        &self,
        runner_id: &str,
        project_path: &str,
    ) -> Result<String, PlatformError>;
}

#[async_trait]
/// Persistent per-runner connection used for pull requests.
pub trait RunnerTransport: Send + Sync {
    async fn send(&self, runner_id: &str, request: &RunnerRequest) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Durable thread/session mapping for one runner session.
pub struct PersistedSessionRecord {
    pub thread_id: String,
    pub project_path: String,
    pub last_sync: u64,
    #[serde(default)]
    pub cli_type: CliType,
}

#[async_trait]
/// Durable runner record store. `record_key` is a session key or, for
/// records written before session keys existed, the bare session id.
pub trait RunnerRecordStore: Send + Sync {
    async fn load_session_record(
        &self,
        runner_id: &str,
        record_key: &str,
    ) -> Result<Option<PersistedSessionRecord>, RecordStoreError>;
    async fn save_session_record(
        &self,
        runner_id: &str,
        session_key: &str,
        record: PersistedSessionRecord,
    ) -> Result<(), RecordStoreError>;
    async fn remove_session_record(
        &self,
        runner_id: &str,
        record_key: &str,
    ) -> Result<(), RecordStoreError>;
    async fn is_project_onboarded(
        &self,
        runner_id: &str,
        project_path: &str,
    ) -> Result<bool, RecordStoreError>;
    async fn mark_project_onboarded(
        &self,
        runner_id: &str,
        project_path: &str,
    ) -> Result<(), RecordStoreError>;
    /// True when the chat side started this session and it is still live.
    async fn is_bot_session_active(
        &self,
        runner_id: &str,
        session_key: &str,
    ) -> Result<bool, RecordStoreError>;
}

#[cfg(test)]
mod tests {
    use super::{PlatformError, SyncError};

    #[test]
    fn unit_platform_error_classifies_not_found() {
        assert!(PlatformError::NotFound("c1".to_string()).is_not_found());
        assert!(!PlatformError::Request("429".to_string()).is_not_found());
    }

    #[test]
    fn unit_sync_error_wraps_platform_error_transparently() {
        let error = SyncError::from(PlatformError::NotFound("thread-9".to_string()));
        assert_eq!(error.to_string(), "platform resource 'thread-9' was not found");
    }
}
