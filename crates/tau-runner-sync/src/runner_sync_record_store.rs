//! Durable runner record store implementations.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::runner_sync_collaborators::{PersistedSessionRecord, RecordStoreError, RunnerRecordStore};
use crate::runner_sync_state::normalize_project_path;

pub const RUNNER_RECORD_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectOnboardingRecord {
    pub onboarded_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Durable state of one runner: session mappings and onboarded projects.
pub struct RunnerRecordDocument {
    pub schema_version: u32,
    pub runner_id: String,
    #[serde(default)]
    pub sessions: BTreeMap<String, PersistedSessionRecord>,
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectOnboardingRecord>,
    #[serde(default)]
    pub active_bot_sessions: BTreeSet<String>,
}

impl RunnerRecordDocument {
    pub fn new(runner_id: &str) -> Self {
        Self {
            schema_version: RUNNER_RECORD_SCHEMA_VERSION,
            runner_id: runner_id.to_string(),
            sessions: BTreeMap::new(),
            projects: BTreeMap::new(),
            active_bot_sessions: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Default)]
/// Process-local record store.
pub struct InMemoryRunnerRecordStore {
    inner: RwLock<HashMap<String, RunnerRecordDocument>>,
}

impl InMemoryRunnerRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_bot_session_active(&self, runner_id: &str, session_key: &str, active: bool) {
        let mut inner = self.inner.write().await;
        let document = inner
            .entry(runner_id.to_string())
            .or_insert_with(|| RunnerRecordDocument::new(runner_id));
        if active {
            document.active_bot_sessions.insert(session_key.to_string());
        } else {
            document.active_bot_sessions.remove(session_key);
        }
    }

    /// Keys of every stored session record for a runner, sorted.
    pub async fn session_record_keys(&self, runner_id: &str) -> Vec<String> {
        self.inner
            .read()
            .await
            .get(runner_id)
            .map(|document| document.sessions.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RunnerRecordStore for InMemoryRunnerRecordStore {
    async fn load_session_record(
        &self,
        runner_id: &str,
        record_key: &str,
    ) -> Result<Option<PersistedSessionRecord>, RecordStoreError> {
        Ok(self
            .inner
            .read()
            .await
            .get(runner_id)
            .and_then(|document| document.sessions.get(record_key).cloned()))
    }

    async fn save_session_record(
        &self,
        runner_id: &str,
        session_key: &str,
        record: PersistedSessionRecord,
    ) -> Result<(), RecordStoreError> {
        let mut inner = self.inner.write().await;
        inner
            .entry(runner_id.to_string())
            .or_insert_with(|| RunnerRecordDocument::new(runner_id))
            .sessions
            .insert(session_key.to_string(), record);
        Ok(())
    }

    async fn remove_session_record(
        &self,
        runner_id: &str,
        record_key: &str,
    ) -> Result<(), RecordStoreError> {
        if let Some(document) = self.inner.write().await.get_mut(runner_id) {
            document.sessions.remove(record_key);
        }
        Ok(())
    }

    async fn is_project_onboarded(
        &self,
        runner_id: &str,
        project_path: &str,
    ) -> Result<bool, RecordStoreError> {
        Ok(self
            .inner
            .read()
            .await
            .get(runner_id)
            .is_some_and(|document| {
                document
                    .projects
                    .contains_key(&normalize_project_path(project_path))
            }))
    }

    async fn mark_project_onboarded(
        &self,
        runner_id: &str,
        project_path: &str,
    ) -> Result<(), RecordStoreError> {
        let mut inner = self.inner.write().await;
        inner
            .entry(runner_id.to_string())
            .or_insert_with(|| RunnerRecordDocument::new(runner_id))
            .projects
            .entry(normalize_project_path(project_path))
            .or_insert(ProjectOnboardingRecord {
                onboarded_at: current_unix_timestamp_ms(),
            });
        Ok(())
    }

    async fn is_bot_session_active(
        &self,
        runner_id: &str,
        session_key: &str,
    ) -> Result<bool, RecordStoreError> {
        Ok(self
            .inner
            .read()
            .await
            .get(runner_id)
            .is_some_and(|document| document.active_bot_sessions.contains(session_key)))
    }
}

#[derive(Debug)]
/// File-backed record store: one JSON document per runner under `state_dir`,
/// replaced atomically on every write.
pub struct JsonFileRunnerRecordStore {
    state_dir: PathBuf,
    documents: Mutex<HashMap<String, RunnerRecordDocument>>,
}

impl JsonFileRunnerRecordStore {
    /// Opens the store, creating `state_dir` and loading every runner
    /// document already present.
    pub fn open(state_dir: impl Into<PathBuf>) -> Result<Self> {
        let state_dir = state_dir.into();
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("failed to create {}", state_dir.display()))?;
        let mut documents = HashMap::new();
        let entries = std::fs::read_dir(&state_dir)
            .with_context(|| format!("failed to list {}", state_dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to list {}", state_dir.display()))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let document = load_runner_document(&path)?;
            documents.insert(document.runner_id.clone(), document);
        }
        Ok(Self {
            state_dir,
            documents: Mutex::new(documents),
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    fn document_path(&self, runner_id: &str) -> PathBuf {
        self.state_dir
            .join(format!("{}.json", sanitize_for_path(runner_id)))
    }

    async fn update<F>(&self, runner_id: &str, mutate: F) -> Result<(), RecordStoreError>
    where
        F: FnOnce(&mut RunnerRecordDocument) -> bool + Send,
    {
        let mut documents = self.documents.lock().await;
        let mut next = documents
            .get(runner_id)
            .cloned()
            .unwrap_or_else(|| RunnerRecordDocument::new(runner_id));
        if !mutate(&mut next) {
            return Ok(());
        }
        // The cached document only changes once the new one is on disk.
        save_runner_document(&self.document_path(runner_id), &next)?;
        documents.insert(runner_id.to_string(), next);
        Ok(())
    }

    /// Records whether a session is currently driven from the chat side.
    pub async fn set_bot_session_active(
        &self,
        runner_id: &str,
        session_key: &str,
        active: bool,
    ) -> Result<(), RecordStoreError> {
        self.update(runner_id, |document| {
            if active {
                document.active_bot_sessions.insert(session_key.to_string())
            } else {
                document.active_bot_sessions.remove(session_key)
            }
        })
        .await
    }

    async fn read<T, F>(&self, runner_id: &str, query: F) -> Option<T>
    where
        F: FnOnce(&RunnerRecordDocument) -> Option<T> + Send,
    {
        self.documents.lock().await.get(runner_id).and_then(query)
    }
}

#[async_trait]
impl RunnerRecordStore for JsonFileRunnerRecordStore {
    async fn load_session_record(
        &self,
        runner_id: &str,
        record_key: &str,
    ) -> Result<Option<PersistedSessionRecord>, RecordStoreError> {
        Ok(self
            .read(runner_id, |document| document.sessions.get(record_key).cloned())
            .await)
    }

    async fn save_session_record(
        &self,
        runner_id: &str,
        session_key: &str,
        record: PersistedSessionRecord,
    ) -> Result<(), RecordStoreError> {
        self.update(runner_id, |document| {
            if document.sessions.get(session_key) == Some(&record) {
                return false;
            }
            document.sessions.insert(session_key.to_string(), record);
            true
        })
        .await
    }

    async fn remove_session_record(
        &self,
        runner_id: &str,
        record_key: &str,
    ) -> Result<(), RecordStoreError> {
        self.update(runner_id, |document| {
            document.sessions.remove(record_key).is_some()
        })
        .await
    }

    async fn is_project_onboarded(
        &self,
        runner_id: &str,
        project_path: &str,
    ) -> Result<bool, RecordStoreError> {
        let key = normalize_project_path(project_path);
        Ok(self
            .read(runner_id, |document| document.projects.get(&key).map(|_| ()))
            .await
            .is_some())
    }

    async fn mark_project_onboarded(
        &self,
        runner_id: &str,
        project_path: &str,
    ) -> Result<(), RecordStoreError> {
        let key = normalize_project_path(project_path);
        self.update(runner_id, |document| {
            if document.projects.contains_key(&key) {
                return false;
            }
            document.projects.insert(
                key,
                ProjectOnboardingRecord {
                    onboarded_at: current_unix_timestamp_ms(),
                },
            );
            true
        })
        .await
    }

    async fn is_bot_session_active(
        &self,
        runner_id: &str,
        session_key: &str,
    ) -> Result<bool, RecordStoreError> {
        Ok(self
            .read(runner_id, |document| {
                document
                    .active_bot_sessions
                    .contains(session_key)
                    .then_some(())
            })
            .await
            .is_some())
    }
}

fn load_runner_document(path: &Path) -> Result<RunnerRecordDocument> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read runner record file {}", path.display()))?;
    let document = serde_json::from_str::<RunnerRecordDocument>(&raw)
        .with_context(|| format!("failed to parse runner record file {}", path.display()))?;
    if document.schema_version != RUNNER_RECORD_SCHEMA_VERSION {
        bail!(
            "unsupported runner record schema in {}: expected {}, found {}",
            path.display(),
            RUNNER_RECORD_SCHEMA_VERSION,
            document.schema_version
        );
    }
    Ok(document)
}

fn save_runner_document(path: &Path, document: &RunnerRecordDocument) -> Result<()> {
    let mut payload =
        serde_json::to_string_pretty(document).context("failed to serialize runner records")?;
    payload.push('\n');
    write_text_atomic(path, &payload)
        .with_context(|| format!("failed to write runner record file {}", path.display()))
}

/// Writes text using a temp file + rename so readers never observe partial data.
fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    let parent_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent_dir)
        .with_context(|| format!("failed to create {}", parent_dir.display()))?;
    let temp_path = parent_dir.join(format!(
        ".{}.tmp-{}-{}",
        path.file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("runner-records"),
        std::process::id(),
        current_unix_timestamp_ms()
    ));
    std::fs::write(&temp_path, content)
        .with_context(|| format!("failed to write temporary file {}", temp_path.display()))?;
    std::fs::rename(&temp_path, path).with_context(|| {
        format!(
            "failed to rename temporary file {} to {}",
            temp_path.display(),
            path.display()
        )
    })
}

fn sanitize_for_path(raw: &str) -> String {
    let sanitized = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>();
    if sanitized.trim_matches('.').is_empty() {
        "runner".to_string()
    } else {
        sanitized
    }
}

fn current_unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
