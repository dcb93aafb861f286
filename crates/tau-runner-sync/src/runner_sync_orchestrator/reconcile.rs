//! Session reconciliation, thread creation and message application.

use futures_util::future::join_all;
use tau_runner_protocol::{RawMessage, RawSession};
use tracing::{debug, info, warn};

use super::{current_unix_timestamp_ms, SessionSyncService};
use crate::runner_sync_collaborators::{
    PersistedSessionRecord, PlatformError, SyncError, ThreadInfo,
};
use crate::runner_sync_normalizer::normalize_messages;
use crate::runner_sync_render::{
    intro_summary, render_message, thread_title, truncation_notice, RenderContext,
    SYNC_FORMAT_VERSION_LEGACY,
};
use crate::runner_sync_state::{normalize_project_path, SyncedSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Result of reconciling one reported session.
pub enum ReconcileOutcome {
    /// Owned by the chat side, or not reconcilable; nothing was touched.
    Skipped,
    Created { delivered: usize },
    Updated { delivered: usize },
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageWindow {
    /// The full transcript so far; messages before the synced count are old.
    Transcript,
    /// Only messages appended since the last report.
    Appended,
}

#[derive(Debug, Default)]
struct AppliedBatch {
    posted: usize,
    failed: usize,
}

impl SessionSyncService {
    /// Brings the thread of one reported session up to date with `raw_messages`,
    /// the session's full transcript as known to the runner.
    pub async fn reconcile(
        &self,
        runner_id: &str,
        project_path: &str,
        session: &RawSession,
        raw_messages: &[RawMessage],
        sync_format_version: Option<u32>,
    ) -> Result<ReconcileOutcome, SyncError> {
        self.reconcile_window(
            runner_id,
            project_path,
            session,
            raw_messages,
            sync_format_version,
            MessageWindow::Transcript,
        )
        .await
    }

    /// Like [`Self::reconcile`] for a batch of newly appended messages.
    pub async fn reconcile_appended(
        &self,
        runner_id: &str,
        project_path: &str,
        session: &RawSession,
        new_messages: &[RawMessage],
        sync_format_version: Option<u32>,
    ) -> Result<ReconcileOutcome, SyncError> {
        self.reconcile_window(
            runner_id,
            project_path,
            session,
            new_messages,
            sync_format_version,
            MessageWindow::Appended,
        )
        .await
    }

    async fn reconcile_window(
        &self,
        runner_id: &str,
        project_path: &str,
        session: &RawSession,
        raw_messages: &[RawMessage],
        sync_format_version: Option<u32>,
        window: MessageWindow,
    ) -> Result<ReconcileOutcome, SyncError> {
        let project_path = normalize_project_path(project_path);
        let session_key = session.session_key();
        if self.is_sync_suppressed(runner_id, &session_key).await {
            return Ok(ReconcileOutcome::Skipped);
        }
        if self.project_channel_id(runner_id, &project_path).is_none() {
            warn!(runner_id, project_path = %project_path, "reconcile called without project state");
            return Err(SyncError::MissingProjectState {
                runner_id: runner_id.to_string(),
                project_path,
            });
        }

        let exists = self
            .state()
            .session(runner_id, &project_path, &session_key)
            .is_some();
        if exists {
            return self
                .update_session(
                    runner_id,
                    &project_path,
                    &session_key,
                    session,
                    raw_messages,
                    sync_format_version,
                    window,
                )
                .await;
        }

        let lock = self.state().set_creation_lock(&session_key);
        let outcome = {
            let _guard = lock.lock().await;
            let exists = self
                .state()
                .session(runner_id, &project_path, &session_key)
                .is_some();
            if exists {
                self.update_session(
                    runner_id,
                    &project_path,
                    &session_key,
                    session,
                    raw_messages,
                    sync_format_version,
                    window,
                )
                .await
            } else {
                self.create_session(
                    runner_id,
                    &project_path,
                    &session_key,
                    session,
                    raw_messages,
                    sync_format_version,
                    window,
                )
                .await
            }
        };
        drop(lock);
        self.state().delete_creation_lock(&session_key);
        outcome
    }

    /// True when the session is owned by the chat side, either already marked
    /// or recorded as an active bot session; the latter is marked owned here.
    pub(super) async fn is_sync_suppressed(&self, runner_id: &str, session_key: &str) -> bool {
        if self.is_session_owned(session_key) {
            debug!(runner_id, session_key, "skipping sync for owned session");
            return true;
        }
        match self
            .inner
            .records
            .is_bot_session_active(runner_id, session_key)
            .await
        {
            Ok(true) => {
                self.mark_session_owned(session_key);
                debug!(runner_id, session_key, "session is driven from chat; marked owned");
                true
            }
            Ok(false) => false,
            Err(error) => {
                warn!(runner_id, session_key, error = %error, "failed to read bot session record");
                false
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn update_session(
        &self,
        runner_id: &str,
        project_path: &str,
        session_key: &str,
        session: &RawSession,
        raw_messages: &[RawMessage],
        sync_format_version: Option<u32>,
        window: MessageWindow,
    ) -> Result<ReconcileOutcome, SyncError> {
        let (thread_id, fresh, reported_count, format_version) = {
            let mut state = self.state();
            let Some(synced) = state.session_mut(runner_id, project_path, session_key) else {
                return Err(SyncError::MissingProjectState {
                    runner_id: runner_id.to_string(),
                    project_path: project_path.to_string(),
                });
            };
            if let Some(version) = sync_format_version {
                synced.sync_format_version = version;
            }
            if session.status.is_some() {
                synced.status = session.status.clone();
            }
            let current = synced.message_count;
            let thread_id = synced.thread_id.clone();
            let format_version = synced.sync_format_version;
            let (base, window_messages, reported_count) = match window {
                MessageWindow::Transcript => (
                    current,
                    raw_messages.get(current..).unwrap_or_default(),
                    raw_messages.len().max(current),
                ),
                // A push delta sits at the end of the runner's transcript, which
                // may overlap messages a pull already delivered.
                MessageWindow::Appended => (
                    session
                        .message_count
                        .map_or(current, |count| count.saturating_sub(raw_messages.len())),
                    raw_messages,
                    session
                        .message_count
                        .unwrap_or(current.saturating_add(raw_messages.len()))
                        .max(current),
                ),
            };
            let fresh = state.filter_new_messages_at(session_key, base, window_messages);
            (thread_id, fresh, reported_count, format_version)
        };

        if fresh.is_empty() {
            self.record_progress(runner_id, project_path, session_key, reported_count);
            return Ok(ReconcileOutcome::Unchanged);
        }
        let context = self.render_context(runner_id, session_key, format_version);
        let applied = self.apply_messages(&thread_id, &context, &fresh).await;
        self.record_progress(runner_id, project_path, session_key, reported_count);
        self.persist_session_mapping(runner_id, session_key).await;
        debug!(
            runner_id,
            session_key,
            thread_id = %thread_id,
            posted = applied.posted,
            failed = applied.failed,
            "synced session update"
        );
        Ok(ReconcileOutcome::Updated {
            delivered: applied.posted,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_session(
        &self,
        runner_id: &str,
        project_path: &str,
        session_key: &str,
        session: &RawSession,
        raw_messages: &[RawMessage],
        sync_format_version: Option<u32>,
        window: MessageWindow,
    ) -> Result<ReconcileOutcome, SyncError> {
        let (thread, legacy_key) = self
            .resolve_session_thread(runner_id, project_path, session_key, session)
            .await?;
        let format_version = sync_format_version.unwrap_or(SYNC_FORMAT_VERSION_LEGACY);
        let now = current_unix_timestamp_ms();
        let mut synced = SyncedSession {
            session_id: self.state().next_session_id(),
            external_session_id: session.session_id.trim().to_string(),
            cli_type: session.cli_type,
            project_path: project_path.to_string(),
            thread_id: thread.thread_id.clone(),
            first_prompt: session.first_prompt.clone(),
            status: session.status.clone(),
            last_synced_at: now,
            message_count: 0,
            sync_format_version: format_version,
        };
        self.save_session_record(runner_id, &synced, legacy_key.as_deref())
            .await;

        let base = match window {
            MessageWindow::Transcript => 0,
            MessageWindow::Appended => session
                .message_count
                .unwrap_or(raw_messages.len())
                .saturating_sub(raw_messages.len()),
        };
        let fresh = self
            .state()
            .filter_new_messages_at(session_key, base, raw_messages);
        let context = self.render_context(runner_id, session_key, format_version);
        let applied = self.apply_messages(&thread.thread_id, &context, &fresh).await;

        synced.message_count = match window {
            MessageWindow::Transcript => raw_messages.len(),
            MessageWindow::Appended => base.saturating_add(raw_messages.len()),
        };
        synced.last_synced_at = current_unix_timestamp_ms();
        let inserted = self.state().insert_session(runner_id, synced.clone());
        if !inserted {
            warn!(runner_id, project_path, session_key, "project state vanished during session creation");
            return Err(SyncError::MissingProjectState {
                runner_id: runner_id.to_string(),
                project_path: project_path.to_string(),
            });
        }
        self.save_session_record(runner_id, &synced, None).await;
        info!(
            runner_id,
            session_key,
            thread_id = %thread.thread_id,
            posted = applied.posted,
            failed = applied.failed,
            "synced session created"
        );
        Ok(ReconcileOutcome::Created {
            delivered: applied.posted,
        })
    }

    /// Reuses a persisted thread when it still resolves, otherwise creates a
    /// new one and posts the intro summary. Returns the thread and, when the
    /// record was found under its legacy bare-id key, that key.
    async fn resolve_session_thread(
        &self,
        runner_id: &str,
        project_path: &str,
        session_key: &str,
        session: &RawSession,
    ) -> Result<(ThreadInfo, Option<String>), SyncError> {
        let (persisted, legacy_key) = self
            .load_persisted_record(runner_id, session_key, &session.session_id)
            .await;
        if let Some(record) = persisted {
            match self.reopen_thread(&record.thread_id).await {
                Ok(thread) => {
                    debug!(runner_id, session_key, thread_id = %thread.thread_id, "reusing persisted session thread");
                    return Ok((thread, legacy_key));
                }
                Err(error) if error.is_not_found() => {
                    debug!(runner_id, session_key, thread_id = %record.thread_id, "persisted session thread is gone");
                }
                Err(error) => return Err(error.into()),
            }
        }

        let name = thread_title(
            session.cli_type,
            session.first_prompt.as_deref(),
            &session.session_id,
            self.inner.config.thread_name_max_chars,
        );
        let thread = self
            .create_thread_with_recovery(runner_id, project_path, &name)
            .await?;
        let intro = intro_summary(
            session.cli_type,
            &session.session_id,
            project_path,
            session.message_count,
            session.first_prompt.as_deref(),
        );
        if let Err(error) = self
            .inner
            .delivery
            .send(&thread.thread_id, intro)
            .wait()
            .await
        {
            warn!(runner_id, session_key, thread_id = %thread.thread_id, error = %error, "failed to post session intro");
        }
        Ok((thread, legacy_key))
    }

    async fn load_persisted_record(
        &self,
        runner_id: &str,
        session_key: &str,
        external_session_id: &str,
    ) -> (Option<PersistedSessionRecord>, Option<String>) {
        let records = &self.inner.records;
        match records.load_session_record(runner_id, session_key).await {
            Ok(Some(record)) => return (Some(record), None),
            Ok(None) => {}
            Err(error) => {
                warn!(runner_id, session_key, error = %error, "failed to load session record");
                return (None, None);
            }
        }
        let legacy_key = external_session_id.trim();
        if legacy_key.is_empty() || legacy_key == session_key {
            return (None, None);
        }
        match records.load_session_record(runner_id, legacy_key).await {
            Ok(Some(record)) => (Some(record), Some(legacy_key.to_string())),
            Ok(None) => (None, None),
            Err(error) => {
                warn!(runner_id, legacy_key, error = %error, "failed to load legacy session record");
                (None, None)
            }
        }
    }

    async fn reopen_thread(&self, thread_id: &str) -> Result<ThreadInfo, PlatformError> {
        let mut thread = self.inner.platform.fetch_thread(thread_id).await?;
        if thread.archived {
            self.inner.platform.unarchive_thread(thread_id).await?;
            thread.archived = false;
        }
        Ok(thread)
    }

    async fn create_thread_with_recovery(
        &self,
        runner_id: &str,
        project_path: &str,
        name: &str,
    ) -> Result<ThreadInfo, SyncError> {
        let channel_id = self.project_channel_id(runner_id, project_path).ok_or_else(|| {
            SyncError::MissingProjectState {
                runner_id: runner_id.to_string(),
                project_path: project_path.to_string(),
            }
        })?;
        match self.create_thread_in_channel(&channel_id, name).await {
            Ok(thread) => Ok(thread),
            Err(error) if error.is_not_found() => {
                warn!(runner_id, project_path, channel_id = %channel_id, "project channel lost; recreating");
                let channel_id = self.recover_project_channel(runner_id, project_path).await?;
                self.create_thread_in_channel(&channel_id, name)
                    .await
                    .map_err(|source| SyncError::ChannelUnavailable {
                        project_path: project_path.to_string(),
                        source,
                    })
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn create_thread_in_channel(
        &self,
        channel_id: &str,
        name: &str,
    ) -> Result<ThreadInfo, PlatformError> {
        self.inner.platform.fetch_channel(channel_id).await?;
        self.inner.platform.create_thread(channel_id, name).await
    }

    async fn recover_project_channel(
        &self,
        runner_id: &str,
        project_path: &str,
    ) -> Result<String, SyncError> {
        let channel_id = self
            .inner
            .directory
            .recreate_project_channel(runner_id, project_path)
            .await
            .map_err(|source| SyncError::ChannelUnavailable {
                project_path: project_path.to_string(),
                source,
            })?;
        self.state()
            .ensure_project(runner_id, project_path, &channel_id)
            .channel_id = channel_id.clone();
        info!(runner_id, project_path, channel_id = %channel_id, "project channel recreated");
        Ok(channel_id)
    }

    /// Normalizes, truncates, renders and enqueues a batch for one thread,
    /// then waits for every post to settle.
    async fn apply_messages(
        &self,
        thread_id: &str,
        context: &RenderContext,
        raw_messages: &[RawMessage],
    ) -> AppliedBatch {
        let mut normalized = normalize_messages(raw_messages);
        if normalized.is_empty() {
            return AppliedBatch::default();
        }
        let cap = self.inner.config.max_messages_per_sync;
        let mut handles = Vec::new();
        if normalized.len() > cap {
            let skipped = normalized.len() - cap;
            normalized.drain(..skipped);
            handles.push(
                self.inner
                    .delivery
                    .send(thread_id, truncation_notice(skipped, cap)),
            );
        }
        for message in &normalized {
            handles.extend(
                self.inner
                    .delivery
                    .send_all(thread_id, render_message(message, context)),
            );
        }

        let mut applied = AppliedBatch::default();
        for result in join_all(handles.into_iter().map(|handle| handle.wait())).await {
            match result {
                Ok(_) => applied.posted = applied.posted.saturating_add(1),
                Err(_) => applied.failed = applied.failed.saturating_add(1),
            }
        }
        if applied.failed > 0 {
            warn!(thread_id, failed = applied.failed, "some synced messages were not delivered");
        }
        applied
    }

    fn render_context(&self, runner_id: &str, session_key: &str, format_version: u32) -> RenderContext {
        RenderContext {
            runner_id: runner_id.to_string(),
            session_key: session_key.to_string(),
            sync_format_version: format_version,
            message_chunk_chars: self.inner.config.message_chunk_chars,
            embed_chunk_chars: self.inner.config.embed_chunk_chars,
        }
    }

    fn record_progress(
        &self,
        runner_id: &str,
        project_path: &str,
        session_key: &str,
        message_count: usize,
    ) {
        let mut state = self.state();
        if let Some(synced) = state.session_mut(runner_id, project_path, session_key) {
            synced.message_count = synced.message_count.max(message_count);
            synced.last_synced_at = current_unix_timestamp_ms();
        }
    }

    async fn persist_session_mapping(&self, runner_id: &str, session_key: &str) {
        let synced = self.synced_session(runner_id, session_key);
        if let Some(synced) = synced {
            self.save_session_record(runner_id, &synced, None).await;
        }
    }

    /// Persists the thread mapping under the session key. A record read from
    /// its legacy bare-id key is moved to the session key.
    async fn save_session_record(
        &self,
        runner_id: &str,
        synced: &SyncedSession,
        legacy_key: Option<&str>,
    ) {
        let session_key = synced.session_key();
        let record = PersistedSessionRecord {
            thread_id: synced.thread_id.clone(),
            project_path: synced.project_path.clone(),
            last_sync: synced.last_synced_at,
            cli_type: synced.cli_type,
        };
        let records = &self.inner.records;
        if let Err(error) = records
            .save_session_record(runner_id, &session_key, record)
            .await
        {
            warn!(runner_id, session_key = %session_key, error = %error, "failed to persist session record");
            return;
        }
        if let Some(legacy_key) = legacy_key {
            match records.remove_session_record(runner_id, legacy_key).await {
                Ok(()) => debug!(runner_id, legacy_key, session_key = %session_key, "migrated legacy session record"),
                Err(error) => warn!(runner_id, legacy_key, error = %error, "failed to remove legacy session record"),
            }
        }
    }
}
