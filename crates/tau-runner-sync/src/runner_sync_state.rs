//! In-memory sync state: runner → project → session hierarchy.
//!
//! This is the only place shared sync maps are mutated. It performs no
//! network or platform calls; the orchestrator wraps it in a mutex that is
//! never held across a suspension point.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tau_runner_protocol::{session_key, CliType, RawMessage, RunnerRequest};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::AbortHandle;

const FINGERPRINT_PREFIX_CHARS: usize = 120;

/// Trims whitespace and trailing path separators. The filesystem root is kept.
pub fn normalize_project_path(path: &str) -> String {
    let trimmed = path.trim();
    let stripped = trimmed.trim_end_matches(|ch: char| ch == '/' || ch == '\\');
    if stripped.is_empty() && !trimmed.is_empty() {
        return trimmed[..1].to_string();
    }
    stripped.to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Complete,
    Error,
}

impl SyncState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Display-only sync progress for a runner or project.
pub struct SyncStatus {
    pub state: SyncState,
    pub last_error: Option<String>,
    pub last_sync_unix_ms: Option<u64>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Sync-side record of one remote coding session reconciled to a thread.
pub struct SyncedSession {
    pub session_id: String,
    pub external_session_id: String,
    pub cli_type: CliType,
    pub project_path: String,
    pub thread_id: String,
    pub first_prompt: Option<String>,
    pub status: Option<String>,
    pub last_synced_at: u64,
    pub message_count: usize,
    pub sync_format_version: u32,
}

impl SyncedSession {
    pub fn session_key(&self) -> String {
        session_key(self.cli_type, &self.external_session_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSyncState {
    pub project_path: String,
    pub channel_id: String,
    pub sessions: HashMap<String, SyncedSession>,
    pub last_sync: Option<u64>,
    pub status: SyncStatus,
}

impl ProjectSyncState {
    pub fn new(project_path: &str, channel_id: &str) -> Self {
        Self {
            project_path: normalize_project_path(project_path),
            channel_id: channel_id.to_string(),
            sessions: HashMap::new(),
            last_sync: None,
            status: SyncStatus::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerSyncState {
    pub projects: HashMap<String, ProjectSyncState>,
    pub status: SyncStatus,
    /// Latest `syncFormatVersion` the runner reported on a pull response.
    pub sync_format_version: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Families of outstanding pull exchanges.
pub enum PendingRequestKind {
    Status,
    ProjectList,
    SessionList,
    SessionMessages,
}

impl PendingRequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::ProjectList => "project_list",
            Self::SessionList => "session_list",
            Self::SessionMessages => "session_messages",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingRequestContext {
    Runner,
    Project {
        project_path: String,
    },
    Session {
        project_path: String,
        session_key: String,
    },
}

#[derive(Debug)]
/// Correlation state for one outstanding pull request.
pub struct PendingRequest {
    pub request_id: String,
    pub runner_id: String,
    pub kind: PendingRequestKind,
    pub context: PendingRequestContext,
    pub request: RunnerRequest,
    pub attempts: u32,
    pub timer: Option<AbortHandle>,
}

impl PendingRequest {
    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

#[derive(Debug, Default)]
struct MessageIdentityIndex {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl MessageIdentityIndex {
    fn insert(&mut self, identity: String, cap: usize) -> bool {
        if self.seen.contains(&identity) {
            return false;
        }
        self.seen.insert(identity.clone());
        self.order.push_back(identity);
        while self.order.len() > cap {
            if let Some(removed) = self.order.pop_front() {
                self.seen.remove(&removed);
            }
        }
        true
    }
}

/// Derives the de-duplication identity of a raw message.
///
/// Preference order: explicit unique id, nested message id, tool-use id, then
/// a positional fingerprint over the first characters of the content.
pub fn message_identity(message: &RawMessage, position: usize) -> String {
    if let Some(id) = non_empty(message.uuid.as_deref()).or(non_empty(message.id.as_deref())) {
        return format!("id:{id}");
    }
    if let Some(id) = message
        .message
        .as_ref()
        .and_then(|inner| non_empty(inner.id.as_deref()))
    {
        return format!("msg:{id}");
    }
    if let Some(id) = tool_use_identity(message) {
        return format!("tool:{id}");
    }
    let content = message
        .message
        .as_ref()
        .and_then(|inner| inner.content.as_ref())
        .or(message.data.as_ref())
        .or(message.tool_use_result.as_ref())
        .map(Value::to_string)
        .unwrap_or_default();
    let prefix = content
        .chars()
        .take(FINGERPRINT_PREFIX_CHARS)
        .collect::<String>();
    format!(
        "pos:{position}:{}:{prefix}",
        message.record_type.as_deref().unwrap_or_default()
    )
}

fn tool_use_identity(message: &RawMessage) -> Option<String> {
    if let Some(id) = non_empty(message.tool_use_id.as_deref()) {
        return Some(id.to_string());
    }
    let blocks = message
        .message
        .as_ref()
        .and_then(|inner| inner.content.as_ref())
        .and_then(Value::as_array)?;
    blocks.iter().find_map(|block| {
        let block_type = block.get("type").and_then(Value::as_str)?;
        let id = match block_type {
            "tool_use" => block.get("id"),
            "tool_result" => block.get("tool_use_id"),
            _ => None,
        }?;
        id.as_str()
            .filter(|value| !value.trim().is_empty())
            .map(str::to_string)
    })
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.trim().is_empty())
}

#[derive(Debug)]
/// Runner/project/session hierarchy plus ownership, pending requests, the
/// message de-duplication index and per-session creation locks.
pub struct SyncStateStore {
    dedup_cap: usize,
    runners: HashMap<String, RunnerSyncState>,
    owned_sessions: HashSet<String>,
    pending_requests: HashMap<PendingRequestKind, HashMap<String, PendingRequest>>,
    dedup_index: HashMap<String, MessageIdentityIndex>,
    creation_locks: HashMap<String, Arc<AsyncMutex<()>>>,
    next_session_sequence: u64,
}

impl SyncStateStore {
    pub fn new(dedup_cap: usize) -> Self {
        Self {
            dedup_cap: dedup_cap.max(1),
            runners: HashMap::new(),
            owned_sessions: HashSet::new(),
            pending_requests: HashMap::new(),
            dedup_index: HashMap::new(),
            creation_locks: HashMap::new(),
            next_session_sequence: 0,
        }
    }

    pub fn runner(&self, runner_id: &str) -> Option<&RunnerSyncState> {
        self.runners.get(runner_id)
    }

    pub fn runner_mut(&mut self, runner_id: &str) -> Option<&mut RunnerSyncState> {
        self.runners.get_mut(runner_id)
    }

    pub fn ensure_runner(&mut self, runner_id: &str) -> &mut RunnerSyncState {
        self.runners.entry(runner_id.to_string()).or_default()
    }

    pub fn runner_ids(&self) -> Vec<String> {
        let mut ids = self.runners.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// Drops runner state and every pending request for the runner. Retry
    /// timers of the removed requests are cancelled.
    pub fn remove_runner(&mut self, runner_id: &str) -> Option<RunnerSyncState> {
        for table in self.pending_requests.values_mut() {
            table.retain(|_, pending| {
                if pending.runner_id == runner_id {
                    pending.cancel_timer();
                    false
                } else {
                    true
                }
            });
        }
        self.runners.remove(runner_id)
    }

    pub fn project(&self, runner_id: &str, project_path: &str) -> Option<&ProjectSyncState> {
        self.runners
            .get(runner_id)?
            .projects
            .get(&normalize_project_path(project_path))
    }

    pub fn project_mut(
        &mut self,
        runner_id: &str,
        project_path: &str,
    ) -> Option<&mut ProjectSyncState> {
        self.runners
            .get_mut(runner_id)?
            .projects
            .get_mut(&normalize_project_path(project_path))
    }

    /// Stores project state under its normalized path. Sessions already
    /// tracked for that path are carried over into the new state.
    pub fn set_project(&mut self, runner_id: &str, mut project: ProjectSyncState) {
        project.project_path = normalize_project_path(&project.project_path);
        let runner = self.ensure_runner(runner_id);
        if let Some(existing) = runner.projects.remove(&project.project_path) {
            for (key, session) in existing.sessions {
                project.sessions.entry(key).or_insert(session);
            }
        }
        runner
            .projects
            .insert(project.project_path.clone(), project);
    }

    /// Returns the project state, creating it with `channel_id` if absent.
    pub fn ensure_project(
        &mut self,
        runner_id: &str,
        project_path: &str,
        channel_id: &str,
    ) -> &mut ProjectSyncState {
        let normalized = normalize_project_path(project_path);
        self.ensure_runner(runner_id)
            .projects
            .entry(normalized.clone())
            .or_insert_with(|| ProjectSyncState::new(&normalized, channel_id))
    }

    pub fn session(
        &self,
        runner_id: &str,
        project_path: &str,
        session_key: &str,
    ) -> Option<&SyncedSession> {
        self.project(runner_id, project_path)?
            .sessions
            .get(session_key)
    }

    pub fn session_mut(
        &mut self,
        runner_id: &str,
        project_path: &str,
        session_key: &str,
    ) -> Option<&mut SyncedSession> {
        self.project_mut(runner_id, project_path)?
            .sessions
            .get_mut(session_key)
    }

    /// Looks a session up by session key across every project of a runner.
    pub fn find_session_by_key(&self, runner_id: &str, session_key: &str) -> Option<&SyncedSession> {
        self.runners
            .get(runner_id)?
            .projects
            .values()
            .find_map(|project| project.sessions.get(session_key))
    }

    pub fn find_session_by_thread(&self, thread_id: &str) -> Option<(String, &SyncedSession)> {
        self.runners.iter().find_map(|(runner_id, runner)| {
            runner
                .projects
                .values()
                .flat_map(|project| project.sessions.values())
                .find(|session| session.thread_id == thread_id)
                .map(|session| (runner_id.clone(), session))
        })
    }

    pub fn find_session_by_external_id(
        &self,
        runner_id: &str,
        external_session_id: &str,
    ) -> Option<&SyncedSession> {
        self.runners
            .get(runner_id)?
            .projects
            .values()
            .flat_map(|project| project.sessions.values())
            .find(|session| session.external_session_id == external_session_id)
    }

    /// Inserts a session into an existing project. Returns false when the
    /// project has not been ensured.
    pub fn insert_session(&mut self, runner_id: &str, session: SyncedSession) -> bool {
        let key = session.session_key();
        let Some(project) = self.project_mut(runner_id, &session.project_path) else {
            return false;
        };
        project.sessions.insert(key, session);
        true
    }

    pub fn next_session_id(&mut self) -> String {
        self.next_session_sequence = self.next_session_sequence.saturating_add(1);
        format!("synced-session-{}", self.next_session_sequence)
    }

    pub fn mark_session_owned(&mut self, session_key: &str) -> bool {
        self.owned_sessions.insert(session_key.to_string())
    }

    pub fn unmark_session_owned(&mut self, session_key: &str) -> bool {
        self.owned_sessions.remove(session_key)
    }

    pub fn is_session_owned(&self, session_key: &str) -> bool {
        self.owned_sessions.contains(session_key)
    }

    pub fn insert_pending_request(&mut self, pending: PendingRequest) {
        self.pending_requests
            .entry(pending.kind)
            .or_default()
            .insert(pending.request_id.clone(), pending);
    }

    pub fn pending_request(
        &self,
        kind: PendingRequestKind,
        request_id: &str,
    ) -> Option<&PendingRequest> {
        self.pending_requests.get(&kind)?.get(request_id)
    }

    pub fn pending_request_mut(
        &mut self,
        kind: PendingRequestKind,
        request_id: &str,
    ) -> Option<&mut PendingRequest> {
        self.pending_requests.get_mut(&kind)?.get_mut(request_id)
    }

    /// Removes a pending request and cancels its retry timer.
    pub fn take_pending_request(
        &mut self,
        kind: PendingRequestKind,
        request_id: &str,
    ) -> Option<PendingRequest> {
        let mut pending = self.pending_requests.get_mut(&kind)?.remove(request_id)?;
        pending.cancel_timer();
        Some(pending)
    }

    /// Finds the request id of a pending request matching runner and context.
    pub fn find_pending_request(
        &self,
        kind: PendingRequestKind,
        runner_id: &str,
        context: &PendingRequestContext,
    ) -> Option<String> {
        self.pending_requests
            .get(&kind)?
            .values()
            .find(|pending| pending.runner_id == runner_id && &pending.context == context)
            .map(|pending| pending.request_id.clone())
    }

    pub fn pending_request_count(&self, kind: PendingRequestKind) -> usize {
        self.pending_requests.get(&kind).map_or(0, HashMap::len)
    }

    /// Returns the messages whose identities were not seen before for this
    /// session key and records them. Identities are bounded by the dedup cap.
    pub fn filter_new_messages(
        &mut self,
        session_key: &str,
        messages: &[RawMessage],
    ) -> Vec<RawMessage> {
        self.filter_new_messages_at(session_key, 0, messages)
    }

    /// Like [`Self::filter_new_messages`] for a slice that starts at
    /// `base_position` of the full transcript.
    pub fn filter_new_messages_at(
        &mut self,
        session_key: &str,
        base_position: usize,
        messages: &[RawMessage],
    ) -> Vec<RawMessage> {
        let cap = self.dedup_cap;
        let index = self.dedup_index.entry(session_key.to_string()).or_default();
        messages
            .iter()
            .enumerate()
            .filter(|(offset, message)| {
                index.insert(
                    message_identity(message, base_position.saturating_add(*offset)),
                    cap,
                )
            })
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn dedup_len(&self, session_key: &str) -> usize {
        self.dedup_index
            .get(session_key)
            .map_or(0, |index| index.order.len())
    }

    pub fn has_seen_message(&self, session_key: &str, identity: &str) -> bool {
        self.dedup_index
            .get(session_key)
            .is_some_and(|index| index.seen.contains(identity))
    }

    pub fn has_creation_lock(&self, session_key: &str) -> bool {
        self.creation_locks.contains_key(session_key)
    }

    pub fn creation_lock(&self, session_key: &str) -> Option<Arc<AsyncMutex<()>>> {
        self.creation_locks.get(session_key).cloned()
    }

    /// Returns the creation lock for a session key, registering one if absent.
    pub fn set_creation_lock(&mut self, session_key: &str) -> Arc<AsyncMutex<()>> {
        self.creation_locks
            .entry(session_key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Unregisters the creation lock once no caller holds or awaits it.
    pub fn delete_creation_lock(&mut self, session_key: &str) -> bool {
        let idle = self
            .creation_locks
            .get(session_key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            self.creation_locks.remove(session_key);
        }
        idle
    }
}
