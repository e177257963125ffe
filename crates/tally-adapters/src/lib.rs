//! Source adapter contract, the Asana task client, and the field mapper.

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value as JsonValue;
use tally_storage::{FetchError, HttpFetcher, Url};
use thiserror::Error;
use tracing::{debug, info};

mod mapper;

pub use mapper::{map_task, FieldRule, MappingRules, NamePattern, ProjectProfile};

pub const ASANA_API_BASE: &str = "https://app.asana.com/api/1.0";
pub const DEFAULT_PAGE_SIZE: u32 = 100;

const TASK_OPT_FIELDS: &str = "gid,name,notes,completed,completed_at,due_on,assignee,assignee.name,\
assignee.email,custom_fields,custom_fields.name,custom_fields.display_value,\
custom_fields.number_value,custom_fields.enum_value,tags,tags.name";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("ASANA_ACCESS_TOKEN is not configured")]
    MissingToken,
    #[error("invalid source url: {0}")]
    InvalidUrl(String),
    #[error("source API error: {0}")]
    Fetch(#[from] FetchError),
    #[error("unexpected source payload: {0}")]
    InvalidPayload(String),
    #[error("lookback window {0} is out of range")]
    InvalidLookback(Duration),
}

/// Anything that can produce the full current task snapshot of a project.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// All incomplete tasks plus tasks completed within `lookback`, across every page.
    async fn fetch_all(
        &self,
        project_id: &str,
        lookback: Duration,
    ) -> Result<Vec<RawTask>, SourceError>;
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawAssignee {
    #[serde(default)]
    pub gid: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawEnumValue {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawCustomField {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_value: Option<String>,
    #[serde(default)]
    pub number_value: Option<f64>,
    #[serde(default)]
    pub enum_value: Option<RawEnumValue>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawTag {
    #[serde(default)]
    pub name: Option<String>,
}

/// One upstream task with its freeform custom-field metadata.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawTask {
    pub gid: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub due_on: Option<NaiveDate>,
    #[serde(default)]
    pub assignee: Option<RawAssignee>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub custom_fields: Vec<RawCustomField>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub tags: Vec<RawTag>,
    /// The record exactly as received.
    #[serde(skip)]
    pub raw: JsonValue,
}

impl RawTask {
    pub fn from_value(value: JsonValue) -> Result<Self, serde_json::Error> {
        let mut task: RawTask = serde_json::from_value(value.clone())?;
        task.raw = value;
        Ok(task)
    }
}

/// Asana REST client for project task listings.
#[derive(Debug, Clone)]
pub struct AsanaSource {
    http: HttpFetcher,
    api_base: Url,
    token: Option<String>,
    page_size: u32,
}

impl AsanaSource {
    pub fn new(
        http: HttpFetcher,
        api_base: &str,
        token: Option<String>,
    ) -> Result<Self, SourceError> {
        let api_base = Url::parse(api_base)
            .map_err(|e| SourceError::InvalidUrl(format!("{api_base}: {e}")))?;
        Ok(Self {
            http,
            api_base,
            token: token.filter(|t| !t.trim().is_empty()),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.clamp(1, DEFAULT_PAGE_SIZE);
        self
    }

    fn token(&self) -> Result<&str, SourceError> {
        self.token.as_deref().ok_or(SourceError::MissingToken)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SourceError> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| SourceError::InvalidUrl(self.api_base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn tasks_url(
        &self,
        project_id: &str,
        completed_since: DateTime<Utc>,
        offset: Option<&str>,
    ) -> Result<Url, SourceError> {
        let mut url = self.endpoint(&["projects", project_id, "tasks"])?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("opt_fields", TASK_OPT_FIELDS)
                .append_pair("limit", &self.page_size.to_string())
                .append_pair(
                    "completed_since",
                    &completed_since.to_rfc3339_opts(SecondsFormat::Millis, true),
                );
            if let Some(offset) = offset {
                query.append_pair("offset", offset);
            }
        }
        Ok(url)
    }

    /// Connectivity check: returns the project's display name.
    pub async fn probe_project(&self, project_id: &str) -> Result<String, SourceError> {
        let token = self.token()?;
        let url = self.endpoint(&["projects", project_id])?;
        let body = self.http.get_json(&url, Some(token)).await?;
        body.pointer("/data/name")
            .and_then(JsonValue::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| {
                SourceError::InvalidPayload("project response has no data.name".into())
            })
    }
}

#[async_trait]
impl TaskSource for AsanaSource {
    async fn fetch_all(
        &self,
        project_id: &str,
        lookback: Duration,
    ) -> Result<Vec<RawTask>, SourceError> {
        let token = self.token()?;
        let completed_since = Utc::now()
            .checked_sub_signed(lookback)
            .ok_or(SourceError::InvalidLookback(lookback))?;

        let mut tasks = Vec::new();
        let mut offset: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let url = self.tasks_url(project_id, completed_since, offset.as_deref())?;
            let body = self.http.get_json(&url, Some(token)).await?;
            pages += 1;

            let data = body
                .get("data")
                .and_then(JsonValue::as_array)
                .ok_or_else(|| SourceError::InvalidPayload("response has no data array".into()))?;
            for item in data {
                let task = RawTask::from_value(item.clone())
                    .map_err(|e| SourceError::InvalidPayload(format!("task record: {e}")))?;
                tasks.push(task);
            }

            let next = body
                .pointer("/next_page/offset")
                .and_then(JsonValue::as_str)
                .map(ToString::to_string);
            debug!(
                project_id,
                page = pages,
                received = data.len(),
                has_next = next.is_some(),
                "fetched task page"
            );

            match next {
                Some(next) if offset.as_deref() == Some(next.as_str()) => {
                    return Err(SourceError::InvalidPayload(format!(
                        "pagination cursor did not advance past {next}"
                    )));
                }
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        info!(project_id, pages, tasks = tasks.len(), "fetched project snapshot");
        Ok(tasks)
    }
}
