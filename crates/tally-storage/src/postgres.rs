//! PostgreSQL store backed by sqlx.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tally_core::{DueDateChange, ExistingTask, ProjectKind, RunFinish, RunLogEntry, TaskRecord};
use uuid::Uuid;

use crate::gateway::{RunLogStore, StoreError, TaskStore};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for PgStore {
    async fn load_tasks(&self, kind: ProjectKind) -> Result<Vec<ExistingTask>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT external_id, due_date
              FROM tasks
             WHERE project_kind = $1
            "#,
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ExistingTask {
                external_id: row.try_get("external_id")?,
                due_date: row.try_get::<Option<NaiveDate>, _>("due_date")?,
            });
        }
        Ok(out)
    }

    async fn upsert_tasks(
        &self,
        kind: ProjectKind,
        tasks: &[TaskRecord],
    ) -> Result<u64, StoreError> {
        if tasks.is_empty() {
            return Ok(0);
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO tasks (external_id, project_kind, name, description, assignee_name, \
             assignee_email, status, completed_at, due_date, classification, quantity, score, \
             secondary_classification, tags, raw_snapshot, updated_at) ",
        );
        qb.push_values(tasks, |mut row, task| {
            row.push_bind(task.external_id.clone())
                .push_bind(kind.as_str())
                .push_bind(task.name.clone())
                .push_bind(task.description.clone())
                .push_bind(task.assignee_name.clone())
                .push_bind(task.assignee_email.clone())
                .push_bind(task.status.as_str())
                .push_bind(task.completed_at)
                .push_bind(task.due_date)
                .push_bind(task.classification.clone())
                .push_bind(task.quantity)
                .push_bind(task.score)
                .push_bind(task.secondary_classification.clone())
                .push_bind(task.tags.clone())
                .push_bind(task.raw_snapshot.clone())
                .push_bind(task.updated_at);
        });
        qb.push(
            " ON CONFLICT (external_id, project_kind) DO UPDATE SET \
             name = EXCLUDED.name, \
             description = EXCLUDED.description, \
             assignee_name = EXCLUDED.assignee_name, \
             assignee_email = EXCLUDED.assignee_email, \
             status = EXCLUDED.status, \
             completed_at = EXCLUDED.completed_at, \
             due_date = EXCLUDED.due_date, \
             classification = EXCLUDED.classification, \
             quantity = EXCLUDED.quantity, \
             score = EXCLUDED.score, \
             secondary_classification = EXCLUDED.secondary_classification, \
             tags = EXCLUDED.tags, \
             raw_snapshot = EXCLUDED.raw_snapshot, \
             updated_at = EXCLUDED.updated_at",
        );

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn insert_due_date_changes(&self, changes: &[DueDateChange]) -> Result<u64, StoreError> {
        if changes.is_empty() {
            return Ok(0);
        }

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO due_date_changes (task_external_id, task_name, assignee_name, \
             old_due_date, new_due_date, changed_by, reason, project_kind) ",
        );
        qb.push_values(changes, |mut row, change| {
            row.push_bind(change.task_external_id.clone())
                .push_bind(change.task_name.clone())
                .push_bind(change.assignee_name.clone())
                .push_bind(change.old_due_date)
                .push_bind(change.new_due_date)
                .push_bind(change.changed_by.clone())
                .push_bind(change.reason.clone())
                .push_bind(change.project_kind.as_str());
        });

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn delete_tasks(
        &self,
        kind: ProjectKind,
        external_ids: &[String],
    ) -> Result<u64, StoreError> {
        if external_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            DELETE FROM tasks
             WHERE project_kind = $1
               AND external_id = ANY($2)
            "#,
        )
        .bind(kind.as_str())
        .bind(external_ids.to_vec())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RunLogStore for PgStore {
    async fn create_run(&self, entry: &RunLogEntry) -> Result<(), StoreError> {
        let kinds = entry
            .project_kinds
            .iter()
            .map(|k| k.as_str().to_string())
            .collect::<Vec<_>>();
        sqlx::query(
            r#"
            INSERT INTO sync_logs
                (id, started_at, status, project_kinds, tasks_processed, tasks_updated)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id)
        .bind(entry.started_at)
        .bind(entry.status.as_str())
        .bind(kinds)
        .bind(entry.tasks_processed)
        .bind(entry.tasks_updated)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_run(&self, id: Uuid, finish: &RunFinish) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE sync_logs
               SET ended_at = $2,
                   status = $3,
                   tasks_processed = $4,
                   tasks_updated = $5,
                   error_message = $6
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(finish.ended_at)
        .bind(finish.status.as_str())
        .bind(finish.tasks_processed)
        .bind(finish.tasks_updated)
        .bind(finish.error_message.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<RunLogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, started_at, ended_at, status, project_kinds,
                   tasks_processed, tasks_updated, error_message
              FROM sync_logs
             ORDER BY started_at DESC
             LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(run_from_row).collect()
    }
}

fn run_from_row(row: &PgRow) -> Result<RunLogEntry, StoreError> {
    let status: String = row.try_get("status")?;
    let kinds: Vec<String> = row.try_get("project_kinds")?;
    let project_kinds = kinds
        .iter()
        .map(|k| k.parse::<ProjectKind>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| StoreError::CorruptRow(err.to_string()))?;

    Ok(RunLogEntry {
        id: row.try_get("id")?,
        started_at: row.try_get::<DateTime<Utc>, _>("started_at")?,
        ended_at: row.try_get::<Option<DateTime<Utc>>, _>("ended_at")?,
        status: status
            .parse()
            .map_err(|err: tally_core::ParseEnumError| StoreError::CorruptRow(err.to_string()))?,
        project_kinds,
        tasks_processed: row.try_get("tasks_processed")?,
        tasks_updated: row.try_get("tasks_updated")?,
        error_message: row.try_get("error_message")?,
    })
}
