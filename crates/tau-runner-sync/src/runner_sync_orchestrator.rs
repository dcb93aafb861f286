//! Session-sync orchestrator: pull exchanges, push events and reconciliation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use tau_runner_protocol::{parse_runner_envelope, RawMessage, RawSession, RunnerEvent};
use tracing::{debug, warn};

use crate::runner_sync_collaborators::{
    ChannelDirectory, ChatPlatform, RunnerRecordStore, RunnerTransport, SyncError,
};
use crate::runner_sync_config::SessionSyncConfig;
use crate::runner_sync_delivery::DeliveryQueue;
use crate::runner_sync_state::{
    normalize_project_path, PendingRequestKind, SyncState, SyncStateStore, SyncStatus,
    SyncedSession,
};

mod pull_requests;
mod reconcile;


pub use reconcile::ReconcileOutcome;

struct SessionSyncInner {
    config: SessionSyncConfig,
    platform: Arc<dyn ChatPlatform>,
    directory: Arc<dyn ChannelDirectory>,
    records: Arc<dyn RunnerRecordStore>,
    transport: Arc<dyn RunnerTransport>,
    delivery: DeliveryQueue,
    state: Mutex<SyncStateStore>,
    request_sequence: AtomicU64,
}

#[derive(Clone)]
/// Cloneable handle to the sync engine. Construct once and share.
pub struct SessionSyncService {
    inner: Arc<SessionSyncInner>,
}

impl std::fmt::Debug for SessionSyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSyncService")
            .field("config", &self.inner.config)
            .field("delivery", &self.inner.delivery)
            .finish_non_exhaustive()
    }
}

impl SessionSyncService {
    /// Builds the engine. Fails when `config` does not validate.
    pub fn new(
        config: SessionSyncConfig,
        platform: Arc<dyn ChatPlatform>,
        directory: Arc<dyn ChannelDirectory>,
        records: Arc<dyn RunnerRecordStore>,
        transport: Arc<dyn RunnerTransport>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let delivery = DeliveryQueue::new(
            Arc::clone(&platform),
            config.delivery_delay(),
            config.delivery_lane_idle(),
        );
        let state = SyncStateStore::new(config.dedup_cap);
        Ok(Self {
            inner: Arc::new(SessionSyncInner {
                config,
                platform,
                directory,
                records,
                transport,
                delivery,
                state: Mutex::new(state),
                request_sequence: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &SessionSyncConfig {
        &self.inner.config
    }

    pub fn delivery_queue(&self) -> &DeliveryQueue {
        &self.inner.delivery
    }

    /// Decodes a `{type, data}` envelope from `runner_id` and dispatches it.
    /// Unknown envelope types are ignored.
    pub async fn handle_runner_message(&self, runner_id: &str, raw: &str) -> Result<(), SyncError> {
        match parse_runner_envelope(raw)? {
            Some(event) => self.handle_runner_event(runner_id, event).await,
            None => {
                debug!(runner_id, "ignoring unknown runner envelope type");
                Ok(())
            }
        }
    }

    pub async fn handle_runner_event(
        &self,
        runner_id: &str,
        event: RunnerEvent,
    ) -> Result<(), SyncError> {
        debug!(runner_id, event_type = event.event_type(), "runner sync event");
        match event {
            RunnerEvent::SyncProjectsResponse(response) => {
                self.handle_projects_response(runner_id, response).await
            }
            RunnerEvent::SyncSessionsResponse(response) => {
                self.handle_sessions_response(runner_id, response).await
            }
            RunnerEvent::SyncStatusResponse(response) => {
                self.handle_status_response(runner_id, response);
                Ok(())
            }
            RunnerEvent::SyncSessionMessagesResponse(response) => {
                self.handle_session_messages_response(runner_id, response)
                    .await
            }
            RunnerEvent::SyncProjectsProgress(progress) => {
                self.handle_projects_progress(runner_id, progress);
                Ok(())
            }
            RunnerEvent::SyncProjectsComplete(complete) => {
                self.handle_projects_complete(runner_id, complete);
                Ok(())
            }
            RunnerEvent::SyncSessionsComplete(complete) => {
                self.handle_sessions_complete(runner_id, complete);
                Ok(())
            }
            RunnerEvent::SyncSessionDiscovered(discovered) => {
                let session = discovered.session;
                self.reconcile_pushed_session(runner_id, &session, &session.messages, false)
                    .await
                    .map(|_| ())
            }
            RunnerEvent::SyncSessionUpdated(updated) => {
                let session = updated.session;
                let (messages, appended) = if updated.new_messages.is_empty() {
                    (&session.messages, false)
                } else {
                    (&updated.new_messages, true)
                };
                self.reconcile_pushed_session(runner_id, &session, messages, appended)
                    .await
                    .map(|_| ())
            }
        }
    }

    async fn reconcile_pushed_session(
        &self,
        runner_id: &str,
        session: &RawSession,
        messages: &[RawMessage],
        appended: bool,
    ) -> Result<ReconcileOutcome, SyncError> {
        let session_key = session.session_key();
        if self.is_sync_suppressed(runner_id, &session_key).await {
            return Ok(ReconcileOutcome::Skipped);
        }
        if session.project_path.trim().is_empty() {
            warn!(runner_id, session_key = %session_key, "pushed session has no project path");
            return Ok(ReconcileOutcome::Skipped);
        }
        self.ensure_project_state(runner_id, &session.project_path)
            .await?;
        // Pushes carry no format version; reuse the one the runner last reported.
        let sync_format_version = self.known_format_version(runner_id);
        if appended {
            self.reconcile_appended(
                runner_id,
                &session.project_path,
                session,
                messages,
                sync_format_version,
            )
            .await
        } else {
            self.reconcile(
                runner_id,
                &session.project_path,
                session,
                messages,
                sync_format_version,
            )
            .await
        }
    }

    /// Drops all state of a runner and cancels its pending retries.
    pub fn unregister_runner(&self, runner_id: &str) -> bool {
        let removed = self.state().remove_runner(runner_id).is_some();
        if removed {
            debug!(runner_id, "runner sync state dropped");
        }
        removed
    }

    pub fn mark_session_owned(&self, session_key: &str) -> bool {
        self.state().mark_session_owned(session_key)
    }

    pub fn unmark_session_owned(&self, session_key: &str) -> bool {
        self.state().unmark_session_owned(session_key)
    }

    pub fn is_session_owned(&self, session_key: &str) -> bool {
        self.state().is_session_owned(session_key)
    }

    pub fn runner_status(&self, runner_id: &str) -> Option<SyncStatus> {
        self.state()
            .runner(runner_id)
            .map(|runner| runner.status.clone())
    }

    pub fn project_status(&self, runner_id: &str, project_path: &str) -> Option<SyncStatus> {
        self.state()
            .project(runner_id, project_path)
            .map(|project| project.status.clone())
    }

    pub fn project_channel_id(&self, runner_id: &str, project_path: &str) -> Option<String> {
        self.state()
            .project(runner_id, project_path)
            .map(|project| project.channel_id.clone())
    }

    pub fn synced_session(&self, runner_id: &str, session_key: &str) -> Option<SyncedSession> {
        self.state()
            .find_session_by_key(runner_id, session_key)
            .cloned()
    }

    /// Resolves the runner and session mirrored into `thread_id`.
    pub fn session_for_thread(&self, thread_id: &str) -> Option<(String, SyncedSession)> {
        self.state()
            .find_session_by_thread(thread_id)
            .map(|(runner_id, session)| (runner_id, session.clone()))
    }

    pub fn pending_request_count(&self, kind: PendingRequestKind) -> usize {
        self.state().pending_request_count(kind)
    }

    /// Returns the project channel, creating project state through the
    /// channel directory when the project is not tracked yet.
    pub async fn ensure_project_state(
        &self,
        runner_id: &str,
        project_path: &str,
    ) -> Result<String, SyncError> {
        let project_path = normalize_project_path(project_path);
        if let Some(channel_id) = self.project_channel_id(runner_id, &project_path) {
            return Ok(channel_id);
        }
        let channel_id = self
            .inner
            .directory
            .ensure_project_channel(runner_id, &project_path)
            .await
            .map_err(|source| SyncError::ChannelUnavailable {
                project_path: project_path.clone(),
                source,
            })?;
        let channel_id = self
            .state()
            .ensure_project(runner_id, &project_path, &channel_id)
            .channel_id
            .clone();
        if let Err(error) = self
            .inner
            .records
            .mark_project_onboarded(runner_id, &project_path)
            .await
        {
            warn!(runner_id, project_path = %project_path, error = %error, "failed to persist project onboarding");
        }
        Ok(channel_id)
    }

    fn state(&self) -> MutexGuard<'_, SyncStateStore> {
        lock_or_recover(&self.inner.state)
    }

    fn next_request_id(&self, kind: PendingRequestKind, runner_id: &str) -> String {
        let sequence = self
            .inner
            .request_sequence
            .fetch_add(1, Ordering::Relaxed)
            .saturating_add(1);
        format!(
            "{}-{runner_id}-{}-{sequence}",
            kind.as_str(),
            current_unix_timestamp_ms()
        )
    }

    fn remember_format_version(&self, runner_id: &str, sync_format_version: Option<u32>) {
        if let Some(version) = sync_format_version {
            self.state().ensure_runner(runner_id).sync_format_version = Some(version);
        }
    }

    fn known_format_version(&self, runner_id: &str) -> Option<u32> {
        self.state()
            .runner(runner_id)
            .and_then(|runner| runner.sync_format_version)
    }

    fn update_runner_status(&self, runner_id: &str, update: impl FnOnce(&mut SyncStatus)) {
        let mut state = self.state();
        update(&mut state.ensure_runner(runner_id).status);
    }

    fn update_project_status(
        &self,
        runner_id: &str,
        project_path: &str,
        update: impl FnOnce(&mut SyncStatus),
    ) -> bool {
        let mut state = self.state();
        match state.project_mut(runner_id, project_path) {
            Some(project) => {
                update(&mut project.status);
                true
            }
            None => false,
        }
    }
}

fn set_status(status: &mut SyncStatus, state: SyncState, detail: Option<String>) {
    status.state = state;
    status.detail = detail;
    if state != SyncState::Error {
        status.last_error = None;
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn current_unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

/// Parses an RFC 3339 completion timestamp into unix milliseconds.
fn parse_timestamp_ms(raw: Option<&str>) -> Option<u64> {
    let parsed = chrono::DateTime::parse_from_rfc3339(raw?.trim()).ok()?;
    u64::try_from(parsed.timestamp_millis()).ok()
}
