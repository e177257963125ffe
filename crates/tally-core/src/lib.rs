//! Core domain model for Tally: project kinds, mirrored task rows, audit and run-log records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

/// Logical partition of tasks with its own point table and field-matching rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectKind {
    Creative,
    Graphic,
}

impl ProjectKind {
    pub const ALL: [ProjectKind; 2] = [ProjectKind::Creative, ProjectKind::Graphic];

    pub fn as_str(self) -> &'static str {
        match self {
            ProjectKind::Creative => "creative",
            ProjectKind::Graphic => "graphic",
        }
    }
}

impl fmt::Display for ProjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {what} `{value}`")]
pub struct ParseEnumError {
    what: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}

impl FromStr for ProjectKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "creative" => Ok(ProjectKind::Creative),
            "graphic" => Ok(ProjectKind::Graphic),
            _ => Err(ParseEnumError::new("project kind", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Done,
    NotDone,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Done => "done",
            TaskStatus::NotDone => "not_done",
        }
    }

    pub fn is_done(self) -> bool {
        self == TaskStatus::Done
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "done" => Ok(TaskStatus::Done),
            "not_done" => Ok(TaskStatus::NotDone),
            _ => Err(ParseEnumError::new("task status", s)),
        }
    }
}

/// Normalized, persisted mirror of one upstream task.
///
/// `(external_id, project_kind)` is the upsert conflict key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub external_id: String,
    pub project_kind: ProjectKind,
    pub name: String,
    pub description: Option<String>,
    pub assignee_name: Option<String>,
    pub assignee_email: Option<String>,
    pub status: TaskStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub due_date: Option<NaiveDate>,
    pub classification: Option<String>,
    pub quantity: i32,
    pub score: f64,
    pub secondary_classification: Option<String>,
    pub tags: Vec<String>,
    pub raw_snapshot: JsonValue,
    pub updated_at: DateTime<Utc>,
}

/// The slice of a stored task row that reconciliation diffs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingTask {
    pub external_id: String,
    pub due_date: Option<NaiveDate>,
}

impl From<&TaskRecord> for ExistingTask {
    fn from(record: &TaskRecord) -> Self {
        Self {
            external_id: record.external_id.clone(),
            due_date: record.due_date,
        }
    }
}

/// Append-only audit row for one observed due-date mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DueDateChange {
    pub task_external_id: String,
    pub task_name: String,
    pub assignee_name: Option<String>,
    pub old_due_date: Option<NaiveDate>,
    pub new_due_date: Option<NaiveDate>,
    pub changed_by: String,
    pub reason: String,
    pub project_kind: ProjectKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Error,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Error => "error",
        }
    }

    /// Final status of a run from its per-kind outcomes.
    pub fn summarize(succeeded: usize, failed: usize) -> Self {
        match (succeeded, failed) {
            (_, 0) => RunStatus::Success,
            (0, _) => RunStatus::Error,
            _ => RunStatus::Partial,
        }
    }
}

impl FromStr for RunStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "partial" => Ok(RunStatus::Partial),
            "error" => Ok(RunStatus::Error),
            _ => Err(ParseEnumError::new("run status", s)),
        }
    }
}

/// One reconciliation invocation as recorded in the run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub project_kinds: Vec<ProjectKind>,
    pub tasks_processed: i64,
    pub tasks_updated: i64,
    pub error_message: Option<String>,
}

impl RunLogEntry {
    pub fn started(kinds: &[ProjectKind], started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at,
            ended_at: None,
            status: RunStatus::Running,
            project_kinds: kinds.to_vec(),
            tasks_processed: 0,
            tasks_updated: 0,
            error_message: None,
        }
    }
}

/// Terminal update applied to a run log row exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFinish {
    pub ended_at: DateTime<Utc>,
    pub status: RunStatus,
    pub tasks_processed: i64,
    pub tasks_updated: i64,
    pub error_message: Option<String>,
}

/// Order-preserving de-duplication; tags are a set upstream but arrive as a list.
pub fn dedup_tags<I>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        if !out.contains(&tag) {
            out.push(tag);
        }
    }
    out
}
