//! Multi-kind sync runs, their JSON report, and the run log recorder.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tally_core::{ParseEnumError, ProjectKind, RunFinish, RunLogEntry, RunStatus};
use tally_storage::{RunLogStore, StoreError};
use tracing::{info, warn};
use uuid::Uuid;

use crate::reconcile::{KindOutcome, Reconciler};

/// Which project kinds a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KindSelection {
    #[default]
    All,
    Only(ProjectKind),
}

impl KindSelection {
    pub fn kinds(self) -> Vec<ProjectKind> {
        match self {
            KindSelection::All => ProjectKind::ALL.to_vec(),
            KindSelection::Only(kind) => vec![kind],
        }
    }
}

impl FromStr for KindSelection {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(KindSelection::All);
        }
        s.parse().map(KindSelection::Only)
    }
}

impl fmt::Display for KindSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KindSelection::All => f.write_str("all"),
            KindSelection::Only(kind) => write!(f, "{kind}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KindReport {
    pub processed: usize,
    pub updated: usize,
    pub due_date_changes: usize,
    pub deleted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<KindOutcome> for KindReport {
    fn from(outcome: KindOutcome) -> Self {
        Self {
            processed: outcome.processed,
            updated: outcome.updated,
            due_date_changes: outcome.due_date_changes,
            deleted: outcome.deleted,
            error: None,
        }
    }
}

impl KindReport {
    fn failed(message: String) -> Self {
        Self {
            processed: 0,
            updated: 0,
            due_date_changes: 0,
            deleted: 0,
            error: Some(message),
        }
    }
}

/// Aggregate result of one run, as returned to HTTP and CLI callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    pub success: bool,
    pub status: RunStatus,
    pub projects: BTreeMap<ProjectKind, KindReport>,
    pub tasks_processed: usize,
    pub tasks_updated: usize,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Writes run log rows. Failures are logged and never surface to the caller.
#[derive(Clone)]
pub struct RunLogRecorder {
    store: Arc<dyn RunLogStore>,
}

impl RunLogRecorder {
    pub fn new(store: Arc<dyn RunLogStore>) -> Self {
        Self { store }
    }

    pub async fn start(&self, kinds: &[ProjectKind]) -> Option<Uuid> {
        let entry = RunLogEntry::started(kinds, Utc::now());
        match self.store.create_run(&entry).await {
            Ok(()) => Some(entry.id),
            Err(err) => {
                warn!(error = %err, "could not create run log entry");
                None
            }
        }
    }

    pub async fn finish(&self, id: Option<Uuid>, finish: &RunFinish) {
        let Some(id) = id else {
            return;
        };
        if let Err(err) = self.store.finish_run(id, finish).await {
            warn!(run_id = %id, error = %err, "could not finalize run log entry");
        }
    }
}

pub struct SyncRunner {
    reconciler: Reconciler,
    recorder: RunLogRecorder,
    runs: Arc<dyn RunLogStore>,
}

impl SyncRunner {
    pub fn new(reconciler: Reconciler, runs: Arc<dyn RunLogStore>) -> Self {
        Self {
            reconciler,
            recorder: RunLogRecorder::new(Arc::clone(&runs)),
            runs,
        }
    }

    /// Reconcile every selected kind in turn. A failing or panicking kind never
    /// stops the others, and the run log row is always finished.
    pub async fn run(&self, selection: KindSelection) -> RunReport {
        let started = Instant::now();
        let kinds = selection.kinds();
        let run_id = self.recorder.start(&kinds).await;

        let mut projects = BTreeMap::new();
        let mut errors = Vec::new();
        let mut succeeded = 0usize;
        let mut tasks_processed = 0usize;
        let mut tasks_updated = 0usize;

        for kind in kinds {
            let attempt = AssertUnwindSafe(self.reconciler.reconcile(kind))
                .catch_unwind()
                .await;
            let result = match attempt {
                Ok(result) => result.map_err(|err| err.to_string()),
                Err(payload) => {
                    Err(format!("internal error: {}", panic_message(payload.as_ref())))
                }
            };
            match result {
                Ok(outcome) => {
                    succeeded += 1;
                    tasks_processed += outcome.processed;
                    tasks_updated += outcome.updated;
                    projects.insert(kind, KindReport::from(outcome));
                }
                Err(message) => {
                    warn!(%kind, error = %message, "reconciliation failed");
                    errors.push(format!("{kind}: {message}"));
                    projects.insert(kind, KindReport::failed(message));
                }
            }
        }

        let status = RunStatus::summarize(succeeded, errors.len());
        let finish = RunFinish {
            ended_at: Utc::now(),
            status,
            tasks_processed: i64::try_from(tasks_processed).unwrap_or(i64::MAX),
            tasks_updated: i64::try_from(tasks_updated).unwrap_or(i64::MAX),
            error_message: (!errors.is_empty()).then(|| errors.join("; ")),
        };
        self.recorder.finish(run_id, &finish).await;

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            selection = %selection,
            status = status.as_str(),
            tasks_processed,
            tasks_updated,
            duration_ms,
            "sync run finished"
        );

        RunReport {
            run_id,
            success: errors.is_empty(),
            status,
            projects,
            tasks_processed,
            tasks_updated,
            duration_ms,
            errors,
        }
    }

    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<RunLogEntry>, StoreError> {
        self.runs.recent_runs(limit).await
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("reconciliation panicked")
}
