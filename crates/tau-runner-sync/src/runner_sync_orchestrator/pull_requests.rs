//! Correlated pull exchanges with bounded resend and status aggregation.

use std::sync::Arc;

use tau_runner_protocol::{
    RawSession, RunnerRequest, SyncCompletionStatus, SyncProjectsComplete, SyncProjectsProgress,
    SyncProjectsRequest, SyncProjectsResponse, SyncSessionMessagesRequest,
    SyncSessionMessagesResponse, SyncSessionsComplete, SyncSessionsRequest, SyncSessionsResponse,
    SyncStatusRequest, SyncStatusResponse,
};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::{
    current_unix_timestamp_ms, parse_timestamp_ms, set_status, ReconcileOutcome,
    SessionSyncService,
};
use crate::runner_sync_collaborators::SyncError;
use crate::runner_sync_state::{
    normalize_project_path, PendingRequest, PendingRequestContext, PendingRequestKind, SyncState,
};

impl SessionSyncService {
    /// Asks the runner for its project list. Returns the correlation id.
    pub async fn request_project_sync(&self, runner_id: &str) -> Result<String, SyncError> {
        let request_id = self.next_request_id(PendingRequestKind::ProjectList, runner_id);
        self.update_runner_status(runner_id, |status| {
            set_status(status, SyncState::Syncing, Some("requesting projects".to_string()));
        });
        let request = RunnerRequest::SyncProjects(SyncProjectsRequest {
            request_id: request_id.clone(),
        });
        self.dispatch_pending(
            runner_id,
            PendingRequestKind::ProjectList,
            PendingRequestContext::Runner,
            request,
        )
        .await;
        Ok(request_id)
    }

    /// Asks the runner for the sessions of one project.
    pub async fn request_session_sync(
        &self,
        runner_id: &str,
        project_path: &str,
    ) -> Result<String, SyncError> {
        let project_path = normalize_project_path(project_path);
        let request_id = self.next_request_id(PendingRequestKind::SessionList, runner_id);
        self.update_project_status(runner_id, &project_path, |status| {
            set_status(status, SyncState::Syncing, None);
        });
        let request = RunnerRequest::SyncSessions(SyncSessionsRequest {
            project_path: project_path.clone(),
            request_id: request_id.clone(),
        });
        self.dispatch_pending(
            runner_id,
            PendingRequestKind::SessionList,
            PendingRequestContext::Project { project_path },
            request,
        )
        .await;
        Ok(request_id)
    }

    /// Asks the runner for its live sync status.
    pub async fn request_status(&self, runner_id: &str) -> Result<String, SyncError> {
        let request_id = self.next_request_id(PendingRequestKind::Status, runner_id);
        let request = RunnerRequest::SyncStatusRequest(SyncStatusRequest {
            request_id: request_id.clone(),
        });
        self.dispatch_pending(
            runner_id,
            PendingRequestKind::Status,
            PendingRequestContext::Runner,
            request,
        )
        .await;
        Ok(request_id)
    }

    /// Asks the runner for the full transcript of a session reported without
    /// inline messages.
    pub async fn request_session_messages(
        &self,
        runner_id: &str,
        session: &RawSession,
    ) -> Result<String, SyncError> {
        let project_path = normalize_project_path(&session.project_path);
        let session_key = session.session_key();
        let request_id = self.next_request_id(PendingRequestKind::SessionMessages, runner_id);
        let request = RunnerRequest::SyncSessionMessages(SyncSessionMessagesRequest {
            session_id: session.session_id.clone(),
            project_path: project_path.clone(),
            cli_type: session.cli_type,
            request_id: request_id.clone(),
        });
        self.dispatch_pending(
            runner_id,
            PendingRequestKind::SessionMessages,
            PendingRequestContext::Session {
                project_path,
                session_key,
            },
            request,
        )
        .await;
        Ok(request_id)
    }

    /// Records the pending entry, arms its retry timer and sends the first
    /// attempt. A failed first send is left to the retry timer.
    async fn dispatch_pending(
        &self,
        runner_id: &str,
        kind: PendingRequestKind,
        context: PendingRequestContext,
        request: RunnerRequest,
    ) {
        let request_id = request.request_id().to_string();
        let timer = self.arm_retry_timer(kind, &request_id);
        self.state().insert_pending_request(PendingRequest {
            request_id: request_id.clone(),
            runner_id: runner_id.to_string(),
            kind,
            context,
            request: request.clone(),
            attempts: 0,
            timer: Some(timer),
        });
        debug!(
            runner_id,
            request_id = %request_id,
            request_type = request.request_type(),
            "sending sync request"
        );
        if let Err(error) = self.inner.transport.send(runner_id, &request).await {
            warn!(
                runner_id,
                request_id = %request_id,
                error = %error,
                "sync request send failed; will retry"
            );
        }
    }

    fn arm_retry_timer(&self, kind: PendingRequestKind, request_id: &str) -> AbortHandle {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.retry_interval();
        let request_id = request_id.to_string();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let service = SessionSyncService { inner };
                if !service.retry_pending(kind, &request_id).await {
                    return;
                }
            }
        })
        .abort_handle()
    }

    /// Resends a still-pending request with the same id. Returns false once
    /// the request is gone or its retry budget is spent.
    async fn retry_pending(&self, kind: PendingRequestKind, request_id: &str) -> bool {
        let max_retries = self.inner.config.max_sync_retries;
        let (runner_id, request, attempt) = {
            let mut state = self.state();
            let Some(pending) = state.pending_request_mut(kind, request_id) else {
                return false;
            };
            if pending.attempts >= max_retries {
                // The timer task is the caller; detach it so removal does not abort it.
                pending.timer = None;
                let attempts = pending.attempts;
                let runner_id = pending.runner_id.clone();
                state.take_pending_request(kind, request_id);
                warn!(
                    runner_id = %runner_id,
                    request_id,
                    kind = kind.as_str(),
                    attempts,
                    "sync request abandoned after retries"
                );
                return false;
            }
            pending.attempts = pending.attempts.saturating_add(1);
            (
                pending.runner_id.clone(),
                pending.request.clone(),
                pending.attempts,
            )
        };
        debug!(
            runner_id = %runner_id,
            request_id,
            attempt,
            "resending sync request"
        );
        if let Err(error) = self.inner.transport.send(&runner_id, &request).await {
            warn!(runner_id = %runner_id, request_id, error = %error, "sync request resend failed");
        }
        true
    }

    /// Clears the pending entry for a response, matching by request id and
    /// falling back to the request context. Returns whether one matched.
    fn settle_pending(
        &self,
        kind: PendingRequestKind,
        runner_id: &str,
        request_id: Option<&str>,
        context: &PendingRequestContext,
    ) -> bool {
        let mut state = self.state();
        let matched_id = request_id
            .filter(|id| state.pending_request(kind, id).is_some())
            .map(str::to_string)
            .or_else(|| state.find_pending_request(kind, runner_id, context));
        match matched_id {
            Some(id) => state.take_pending_request(kind, &id).is_some(),
            None => false,
        }
    }

    pub(super) async fn handle_projects_response(
        &self,
        runner_id: &str,
        response: SyncProjectsResponse,
    ) -> Result<(), SyncError> {
        if !self.settle_pending(
            PendingRequestKind::ProjectList,
            runner_id,
            Some(&response.request_id),
            &PendingRequestContext::Runner,
        ) {
            debug!(runner_id, request_id = %response.request_id, "unmatched projects response");
        }
        info!(runner_id, projects = response.projects.len(), "runner projects reported");

        let mut failures = 0usize;
        for project in &response.projects {
            let project_path = normalize_project_path(&project.path);
            if project_path.is_empty() {
                continue;
            }
            if let Err(error) = self.ensure_project_state(runner_id, &project_path).await {
                warn!(runner_id, project_path = %project_path, error = %error, "failed to ensure project channel");
                failures = failures.saturating_add(1);
                continue;
            }
            self.request_session_sync(runner_id, &project_path).await?;
        }

        let now = current_unix_timestamp_ms();
        self.update_runner_status(runner_id, |status| {
            if response.projects.is_empty() {
                set_status(status, SyncState::Complete, None);
                status.last_sync_unix_ms = Some(now);
            } else {
                set_status(
                    status,
                    SyncState::Syncing,
                    Some(format!("{} projects", response.projects.len())),
                );
            }
            if failures > 0 {
                status.last_error = Some(format!("{failures} project channels unavailable"));
            }
        });
        Ok(())
    }

    pub(super) async fn handle_sessions_response(
        &self,
        runner_id: &str,
        response: SyncSessionsResponse,
    ) -> Result<(), SyncError> {
        let project_path = normalize_project_path(&response.project_path);
        if !self.settle_pending(
            PendingRequestKind::SessionList,
            runner_id,
            response.request_id.as_deref(),
            &PendingRequestContext::Project {
                project_path: project_path.clone(),
            },
        ) {
            debug!(runner_id, project_path = %project_path, "unmatched sessions response");
        }
        self.ensure_project_state(runner_id, &project_path).await?;
        self.remember_format_version(runner_id, response.sync_format_version);

        let mut failures = Vec::new();
        for session in &response.sessions {
            if self
                .is_sync_suppressed(runner_id, &session.session_key())
                .await
            {
                continue;
            }
            let outcome = self
                .reconcile(
                    runner_id,
                    &project_path,
                    session,
                    &session.messages,
                    response.sync_format_version,
                )
                .await;
            match outcome {
                Ok(outcome) => self.hydrate_if_needed(runner_id, session, outcome).await,
                Err(error) => {
                    warn!(
                        runner_id,
                        session_key = %session.session_key(),
                        error = %error,
                        "session reconciliation failed"
                    );
                    failures.push(error.to_string());
                }
            }
        }

        let now = current_unix_timestamp_ms();
        self.update_project_status(runner_id, &project_path, |status| {
            match failures.first() {
                Some(first) => {
                    set_status(status, SyncState::Error, None);
                    status.last_error = Some(first.clone());
                }
                None => set_status(
                    status,
                    SyncState::Complete,
                    Some(format!("{} sessions", response.sessions.len())),
                ),
            }
            status.last_sync_unix_ms = Some(now);
        });
        if let Some(project) = self.state().project_mut(runner_id, &project_path) {
            project.last_sync = Some(now);
        }
        Ok(())
    }

    async fn hydrate_if_needed(&self, runner_id: &str, session: &RawSession, outcome: ReconcileOutcome) {
        if outcome == ReconcileOutcome::Skipped || !session.messages.is_empty() {
            return;
        }
        let reported = session.message_count.unwrap_or(0);
        let synced = self
            .synced_session(runner_id, &session.session_key())
            .map_or(0, |synced| synced.message_count);
        if reported <= synced {
            return;
        }
        let context = PendingRequestContext::Session {
            project_path: normalize_project_path(&session.project_path),
            session_key: session.session_key(),
        };
        let already_pending = self
            .state()
            .find_pending_request(PendingRequestKind::SessionMessages, runner_id, &context)
            .is_some();
        if already_pending {
            return;
        }
        if let Err(error) = self.request_session_messages(runner_id, session).await {
            warn!(runner_id, session_key = %session.session_key(), error = %error, "failed to request session messages");
        }
    }

    pub(super) async fn handle_session_messages_response(
        &self,
        runner_id: &str,
        response: SyncSessionMessagesResponse,
    ) -> Result<(), SyncError> {
        let session = RawSession {
            session_id: response.session_id,
            cli_type: response.cli_type,
            project_path: normalize_project_path(&response.project_path),
            message_count: Some(response.messages.len()),
            ..RawSession::default()
        };
        self.settle_pending(
            PendingRequestKind::SessionMessages,
            runner_id,
            response.request_id.as_deref(),
            &PendingRequestContext::Session {
                project_path: session.project_path.clone(),
                session_key: session.session_key(),
            },
        );
        self.ensure_project_state(runner_id, &session.project_path)
            .await?;
        self.remember_format_version(runner_id, response.sync_format_version);
        self.reconcile(
            runner_id,
            &session.project_path,
            &session,
            &response.messages,
            response.sync_format_version,
        )
        .await
        .map(|_| ())
    }

    pub(super) fn handle_status_response(&self, runner_id: &str, response: SyncStatusResponse) {
        self.settle_pending(
            PendingRequestKind::Status,
            runner_id,
            Some(&response.request_id),
            &PendingRequestContext::Runner,
        );
        let reported_state = response
            .status
            .get("state")
            .or_else(|| response.status.get("status"))
            .and_then(|value| value.as_str())
            .and_then(parse_sync_state);
        let detail = match &response.status {
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        };
        self.update_runner_status(runner_id, |status| {
            if let Some(state) = reported_state {
                status.state = state;
            }
            status.detail = detail;
        });
    }

    pub(super) fn handle_projects_progress(&self, runner_id: &str, progress: SyncProjectsProgress) {
        let detail = match (progress.processed, progress.total) {
            (Some(processed), Some(total)) => Some(format!("{processed}/{total} projects")),
            _ => progress.message,
        };
        self.update_runner_status(runner_id, |status| {
            set_status(status, SyncState::Syncing, detail);
        });
    }

    pub(super) fn handle_projects_complete(&self, runner_id: &str, complete: SyncProjectsComplete) {
        let completed_at =
            parse_timestamp_ms(complete.completed_at.as_deref()).unwrap_or_else(current_unix_timestamp_ms);
        self.update_runner_status(runner_id, |status| {
            apply_completion(status, complete.status, complete.error, completed_at);
        });
        info!(runner_id, status = ?complete.status, "runner project sync complete");
    }

    pub(super) fn handle_sessions_complete(&self, runner_id: &str, complete: SyncSessionsComplete) {
        let completed_at =
            parse_timestamp_ms(complete.completed_at.as_deref()).unwrap_or_else(current_unix_timestamp_ms);
        let project_path = normalize_project_path(&complete.project_path);
        let updated = self.update_project_status(runner_id, &project_path, |status| {
            apply_completion(status, complete.status, complete.error, completed_at);
            if let Some(count) = complete.session_count {
                status.detail = Some(format!("{count} sessions"));
            }
        });
        if !updated {
            debug!(runner_id, project_path = %project_path, "sessions complete for untracked project");
        }
    }
}

fn apply_completion(
    status: &mut crate::runner_sync_state::SyncStatus,
    completion: SyncCompletionStatus,
    error: Option<String>,
    completed_at: u64,
) {
    match completion {
        SyncCompletionStatus::Error => {
            set_status(status, SyncState::Error, None);
            status.last_error = Some(error.unwrap_or_else(|| "sync failed".to_string()));
        }
        SyncCompletionStatus::Success | SyncCompletionStatus::Unknown => {
            set_status(status, SyncState::Complete, None);
            status.last_error = error;
        }
    }
    status.last_sync_unix_ms = Some(completed_at);
}

fn parse_sync_state(raw: &str) -> Option<SyncState> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "idle" => Some(SyncState::Idle),
        "syncing" | "running" | "in_progress" => Some(SyncState::Syncing),
        "complete" | "completed" | "success" => Some(SyncState::Complete),
        "error" | "failed" => Some(SyncState::Error),
        _ => None,
    }
}
