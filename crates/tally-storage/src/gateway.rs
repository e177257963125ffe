//! Store contract and the chunking gateway the reconciler writes through.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{stream, FutureExt, StreamExt};
use tally_core::{DueDateChange, ExistingTask, ProjectKind, RunFinish, RunLogEntry, TaskRecord};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The four operations reconciliation needs from persistence.
///
/// Every write is scoped to one project kind; implementations must treat
/// `(external_id, project_kind)` as the unique key.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn load_tasks(&self, kind: ProjectKind) -> Result<Vec<ExistingTask>, StoreError>;

    /// Insert or overwrite one batch. Returns the number of rows written.
    async fn upsert_tasks(
        &self,
        kind: ProjectKind,
        tasks: &[TaskRecord],
    ) -> Result<u64, StoreError>;

    async fn insert_due_date_changes(
        &self,
        changes: &[DueDateChange],
    ) -> Result<u64, StoreError>;

    async fn delete_tasks(
        &self,
        kind: ProjectKind,
        external_ids: &[String],
    ) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait RunLogStore: Send + Sync {
    async fn create_run(&self, entry: &RunLogEntry) -> Result<(), StoreError>;

    async fn finish_run(&self, id: Uuid, finish: &RunFinish) -> Result<(), StoreError>;

    /// Most recent runs first.
    async fn recent_runs(&self, limit: i64) -> Result<Vec<RunLogEntry>, StoreError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkReport {
    pub rows_ok: usize,
    pub rows_failed: usize,
    pub chunks_failed: usize,
}

struct ChunkAttempt {
    index: usize,
    rows: usize,
    result: Result<u64, StoreError>,
}

/// Batched access to a [`TaskStore`] with per-chunk error isolation.
#[derive(Clone)]
pub struct PersistenceGateway {
    store: Arc<dyn TaskStore>,
    chunk_size: usize,
    max_in_flight: usize,
}

impl PersistenceGateway {
    pub const DEFAULT_CHUNK_SIZE: usize = 500;
    pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

    pub fn new(store: Arc<dyn TaskStore>, chunk_size: usize, max_in_flight: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
            max_in_flight: max_in_flight.max(1),
        }
    }

    pub fn with_defaults(store: Arc<dyn TaskStore>) -> Self {
        Self::new(store, Self::DEFAULT_CHUNK_SIZE, Self::DEFAULT_MAX_IN_FLIGHT)
    }

    pub async fn load_existing(&self, kind: ProjectKind) -> Result<Vec<ExistingTask>, StoreError> {
        self.store.load_tasks(kind).await
    }

    pub async fn upsert(&self, kind: ProjectKind, tasks: &[TaskRecord]) -> ChunkReport {
        let jobs = tasks
            .chunks(self.chunk_size)
            .enumerate()
            .map(|(index, chunk)| {
                let store = Arc::clone(&self.store);
                async move {
                    ChunkAttempt {
                        index,
                        rows: chunk.len(),
                        result: store.upsert_tasks(kind, chunk).await,
                    }
                }
                .boxed()
            })
            .collect::<Vec<_>>();
        self.drain(kind, "upsert", jobs).await
    }

    /// One insert call for the whole batch.
    pub async fn record_due_date_changes(
        &self,
        changes: &[DueDateChange],
    ) -> Result<u64, StoreError> {
        if changes.is_empty() {
            return Ok(0);
        }
        self.store.insert_due_date_changes(changes).await
    }

    pub async fn delete_missing(&self, kind: ProjectKind, external_ids: &[String]) -> ChunkReport {
        let jobs = external_ids
            .chunks(self.chunk_size)
            .enumerate()
            .map(|(index, chunk)| {
                let store = Arc::clone(&self.store);
                async move {
                    ChunkAttempt {
                        index,
                        rows: chunk.len(),
                        result: store.delete_tasks(kind, chunk).await,
                    }
                }
                .boxed()
            })
            .collect::<Vec<_>>();
        self.drain(kind, "delete", jobs).await
    }

    async fn drain(
        &self,
        kind: ProjectKind,
        operation: &'static str,
        jobs: Vec<BoxFuture<'_, ChunkAttempt>>,
    ) -> ChunkReport {
        let attempts = stream::iter(jobs)
            .buffer_unordered(self.max_in_flight)
            .collect::<Vec<_>>()
            .await;

        let mut report = ChunkReport::default();
        for attempt in attempts {
            match attempt.result {
                Ok(_) => report.rows_ok += attempt.rows,
                Err(err) => {
                    tracing::warn!(
                        %kind,
                        operation,
                        chunk = attempt.index,
                        rows = attempt.rows,
                        error = %err,
                        "chunk failed"
                    );
                    report.rows_failed += attempt.rows;
                    report.chunks_failed += 1;
                }
            }
        }
        report
    }
}
