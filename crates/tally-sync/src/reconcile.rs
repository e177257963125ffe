//! Per-kind reconciliation of an upstream snapshot against the stored mirror.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tally_adapters::{map_task, ProjectProfile, RawTask, SourceError, TaskSource};
use tally_core::{DueDateChange, ExistingTask, ProjectKind, TaskRecord};
use tally_storage::{ChunkReport, PersistenceGateway, StoreError};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};

use crate::config::ProjectSettings;

/// Recorded as `changed_by` on every due-date audit row written by sync.
pub const SYNC_ACTOR: &str = "Asana Sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no upstream project id configured for {0}")]
    MissingProjectId(ProjectKind),
    #[error("project kind {0} is not configured")]
    UnknownKind(ProjectKind),
    #[error("fetching {kind} snapshot: {source}")]
    Source {
        kind: ProjectKind,
        #[source]
        source: SourceError,
    },
    #[error("loading existing {kind} tasks: {source}")]
    LoadExisting {
        kind: ProjectKind,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KindOutcome {
    /// Distinct tasks in the upstream snapshot.
    pub processed: usize,
    /// Rows whose upsert chunk succeeded.
    pub updated: usize,
    pub due_date_changes: usize,
    pub deleted: usize,
    pub failed_rows: usize,
}

/// Everything one reconciliation intends to write, computed without I/O.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilePlan {
    pub records: Vec<TaskRecord>,
    pub due_date_changes: Vec<DueDateChange>,
    pub stale_ids: Vec<String>,
    pub purge_skipped: bool,
}

/// Map the snapshot, diff it against `existing`, and pick rows to delete.
///
/// Duplicate upstream ids collapse to their last occurrence. An empty snapshot
/// never marks anything stale.
pub fn plan_reconciliation(
    kind: ProjectKind,
    profile: &ProjectProfile,
    snapshot: &[RawTask],
    existing: Vec<ExistingTask>,
    now: DateTime<Utc>,
) -> ReconcilePlan {
    let mut records: Vec<TaskRecord> = Vec::with_capacity(snapshot.len());
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(snapshot.len());
    for raw in snapshot {
        let record = map_task(raw, profile, now);
        match positions.get(&record.external_id) {
            Some(&index) => records[index] = record,
            None => {
                positions.insert(record.external_id.clone(), records.len());
                records.push(record);
            }
        }
    }

    let existing = existing
        .into_iter()
        .map(|task| (task.external_id.clone(), task))
        .collect::<BTreeMap<_, _>>();

    let due_date_changes = records
        .iter()
        .filter_map(|record| {
            let previous = existing.get(&record.external_id)?;
            (previous.due_date != record.due_date).then(|| DueDateChange {
                task_external_id: record.external_id.clone(),
                task_name: record.name.clone(),
                assignee_name: record.assignee_name.clone(),
                old_due_date: previous.due_date,
                new_due_date: record.due_date,
                changed_by: SYNC_ACTOR.to_string(),
                reason: format!("Due date changed in Asana ({kind})"),
                project_kind: kind,
            })
        })
        .collect();

    let purge_skipped = snapshot.is_empty() && !existing.is_empty();
    let stale_ids = if snapshot.is_empty() {
        Vec::new()
    } else {
        let current = positions.keys().map(String::as_str).collect::<HashSet<_>>();
        existing
            .into_keys()
            .filter(|id| !current.contains(id.as_str()))
            .collect()
    };

    ReconcilePlan {
        records,
        due_date_changes,
        stale_ids,
        purge_skipped,
    }
}

/// Drives fetch, diff, audit, upsert and purge for each project kind.
pub struct Reconciler {
    source: Arc<dyn TaskSource>,
    gateway: PersistenceGateway,
    projects: BTreeMap<ProjectKind, ProjectSettings>,
    lookback: Duration,
    guards: BTreeMap<ProjectKind, Arc<Mutex<()>>>,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn TaskSource>,
        gateway: PersistenceGateway,
        projects: BTreeMap<ProjectKind, ProjectSettings>,
        lookback: Duration,
    ) -> Self {
        let guards = ProjectKind::ALL
            .iter()
            .map(|kind| (*kind, Arc::new(Mutex::new(()))))
            .collect();
        Self {
            source,
            gateway,
            projects,
            lookback,
            guards,
        }
    }

    /// Reconcile one kind. Calls for the same kind run one at a time.
    pub async fn reconcile(&self, kind: ProjectKind) -> Result<KindOutcome, SyncError> {
        let settings = self.projects.get(&kind).ok_or(SyncError::UnknownKind(kind))?;
        let project_id = settings
            .project_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .ok_or(SyncError::MissingProjectId(kind))?;

        let guard = self
            .guards
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| Arc::new(Mutex::new(())));
        let _held = guard.lock().await;

        let span = info_span!("reconcile", %kind, project_id);
        self.reconcile_locked(kind, &settings.profile, project_id)
            .instrument(span)
            .await
    }

    async fn reconcile_locked(
        &self,
        kind: ProjectKind,
        profile: &ProjectProfile,
        project_id: &str,
    ) -> Result<KindOutcome, SyncError> {
        let now = Utc::now();
        let snapshot = self
            .source
            .fetch_all(project_id, self.lookback)
            .await
            .map_err(|source| SyncError::Source { kind, source })?;
        let existing = self
            .gateway
            .load_existing(kind)
            .await
            .map_err(|source| SyncError::LoadExisting { kind, source })?;

        let plan = plan_reconciliation(kind, profile, &snapshot, existing, now);

        let audit = self
            .gateway
            .record_due_date_changes(&plan.due_date_changes)
            .await;
        let due_date_changes = match audit {
            Ok(_) => plan.due_date_changes.len(),
            Err(err) => {
                warn!(
                    error = %err,
                    changes = plan.due_date_changes.len(),
                    "due date audit insert failed; continuing"
                );
                0
            }
        };

        let upserted = self.gateway.upsert(kind, &plan.records).await;

        let deleted = if plan.purge_skipped {
            warn!("upstream returned no tasks; skipping stale purge");
            ChunkReport::default()
        } else {
            self.gateway.delete_missing(kind, &plan.stale_ids).await
        };

        let outcome = KindOutcome {
            processed: plan.records.len(),
            updated: upserted.rows_ok,
            due_date_changes,
            deleted: deleted.rows_ok,
            failed_rows: upserted.rows_failed + deleted.rows_failed,
        };
        info!(
            processed = outcome.processed,
            updated = outcome.updated,
            due_date_changes = outcome.due_date_changes,
            deleted = outcome.deleted,
            failed_rows = outcome.failed_rows,
            "reconciled"
        );
        Ok(outcome)
    }
}
