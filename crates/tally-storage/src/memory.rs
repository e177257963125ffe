//! In-process store used by tests and dry runs. Supports failure injection.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use tally_core::{DueDateChange, ExistingTask, ProjectKind, RunFinish, RunLogEntry, TaskRecord};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::gateway::{RunLogStore, StoreError, TaskStore};

#[derive(Debug, Default)]
struct MemoryState {
    tasks: BTreeMap<(ProjectKind, String), TaskRecord>,
    due_date_changes: Vec<DueDateChange>,
    runs: Vec<RunLogEntry>,
    load_calls: usize,
    upsert_calls: usize,
    failing_upsert_ids: HashSet<String>,
    fail_due_date_inserts: bool,
    fail_run_log: bool,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, records: impl IntoIterator<Item = TaskRecord>) {
        let mut state = self.state.lock().await;
        for record in records {
            state
                .tasks
                .insert((record.project_kind, record.external_id.clone()), record);
        }
    }

    /// Rows of one kind ordered by external id.
    pub async fn tasks(&self, kind: ProjectKind) -> Vec<TaskRecord> {
        let state = self.state.lock().await;
        state
            .tasks
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub async fn task(&self, kind: ProjectKind, external_id: &str) -> Option<TaskRecord> {
        let state = self.state.lock().await;
        state.tasks.get(&(kind, external_id.to_string())).cloned()
    }

    pub async fn due_date_changes(&self) -> Vec<DueDateChange> {
        self.state.lock().await.due_date_changes.clone()
    }

    pub async fn runs(&self) -> Vec<RunLogEntry> {
        self.state.lock().await.runs.clone()
    }

    pub async fn load_calls(&self) -> usize {
        self.state.lock().await.load_calls
    }

    pub async fn upsert_calls(&self) -> usize {
        self.state.lock().await.upsert_calls
    }

    /// Any upsert batch containing `external_id` fails without writing.
    pub async fn fail_upserts_containing(&self, external_id: &str) {
        self.state
            .lock()
            .await
            .failing_upsert_ids
            .insert(external_id.to_string());
    }

    pub async fn fail_due_date_inserts(&self, fail: bool) {
        self.state.lock().await.fail_due_date_inserts = fail;
    }

    pub async fn fail_run_log(&self, fail: bool) {
        self.state.lock().await.fail_run_log = fail;
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn load_tasks(&self, kind: ProjectKind) -> Result<Vec<ExistingTask>, StoreError> {
        let mut state = self.state.lock().await;
        state.load_calls += 1;
        Ok(state
            .tasks
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, record)| ExistingTask::from(record))
            .collect())
    }

    async fn upsert_tasks(
        &self,
        kind: ProjectKind,
        tasks: &[TaskRecord],
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        state.upsert_calls += 1;
        if let Some(bad) = tasks
            .iter()
            .find(|t| state.failing_upsert_ids.contains(&t.external_id))
        {
            return Err(StoreError::Unavailable(format!(
                "injected upsert failure for {}",
                bad.external_id
            )));
        }
        for task in tasks {
            let mut row = task.clone();
            row.project_kind = kind;
            state.tasks.insert((kind, row.external_id.clone()), row);
        }
        Ok(tasks.len() as u64)
    }

    async fn insert_due_date_changes(&self, changes: &[DueDateChange]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        if state.fail_due_date_inserts {
            return Err(StoreError::Unavailable("injected due-date insert failure".into()));
        }
        state.due_date_changes.extend(changes.iter().cloned());
        Ok(changes.len() as u64)
    }

    async fn delete_tasks(
        &self,
        kind: ProjectKind,
        external_ids: &[String],
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut deleted = 0u64;
        for id in external_ids {
            if state.tasks.remove(&(kind, id.clone())).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl RunLogStore for MemoryStore {
    async fn create_run(&self, entry: &RunLogEntry) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.fail_run_log {
            return Err(StoreError::Unavailable("injected run log failure".into()));
        }
        state.runs.push(entry.clone());
        Ok(())
    }

    async fn finish_run(&self, id: Uuid, finish: &RunFinish) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.fail_run_log {
            return Err(StoreError::Unavailable("injected run log failure".into()));
        }
        let run = state
            .runs
            .iter_mut()
            .find(|run| run.id == id)
            .ok_or_else(|| StoreError::Unavailable(format!("run {id} not found")))?;
        run.ended_at = Some(finish.ended_at);
        run.status = finish.status;
        run.tasks_processed = finish.tasks_processed;
        run.tasks_updated = finish.tasks_updated;
        run.error_message = finish.error_message.clone();
        Ok(())
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<RunLogEntry>, StoreError> {
        let state = self.state.lock().await;
        let mut runs = state.runs.clone();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(runs)
    }
}
