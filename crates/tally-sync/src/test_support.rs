//! Scripted task source and project settings shared by the unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use serde_json::Value as JsonValue;
use tally_adapters::{ProjectProfile, RawTask, SourceError, TaskSource};
use tally_core::ProjectKind;
use tally_storage::FetchError;

use crate::config::ProjectSettings;

pub fn raw(value: JsonValue) -> RawTask {
    RawTask::from_value(value).unwrap()
}

pub fn settings(
    creative: Option<&str>,
    graphic: Option<&str>,
) -> BTreeMap<ProjectKind, ProjectSettings> {
    BTreeMap::from([
        (
            ProjectKind::Creative,
            ProjectSettings {
                project_id: creative.map(ToString::to_string),
                profile: ProjectProfile::creative(),
            },
        ),
        (
            ProjectKind::Graphic,
            ProjectSettings {
                project_id: graphic.map(ToString::to_string),
                profile: ProjectProfile::graphic(),
            },
        ),
    ])
}

pub fn creative_settings() -> BTreeMap<ProjectKind, ProjectSettings> {
    settings(Some("creative-project"), None)
}

#[derive(Debug, Clone)]
enum Script {
    Tasks(Vec<JsonValue>),
    Fail(String),
    Panic,
}

/// Task source that serves whatever snapshot a test last scripted.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<HashMap<String, Script>>,
    delay: Option<StdDuration>,
}

impl ScriptedSource {
    pub fn with_delay(mut self, delay: StdDuration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn script(&self, project_id: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(project_id.to_string(), script);
    }

    pub fn set(&self, project_id: &str, tasks: Vec<JsonValue>) {
        self.script(project_id, Script::Tasks(tasks));
    }

    pub fn fail(&self, project_id: &str, message: &str) {
        self.script(project_id, Script::Fail(message.to_string()));
    }

    pub fn panic_on(&self, project_id: &str) {
        self.script(project_id, Script::Panic);
    }
}

#[async_trait]
impl TaskSource for ScriptedSource {
    async fn fetch_all(
        &self,
        project_id: &str,
        _lookback: Duration,
    ) -> Result<Vec<RawTask>, SourceError> {
        let scripted = self.scripts.lock().unwrap().get(project_id).cloned();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match scripted {
            Some(Script::Tasks(values)) => Ok(values.into_iter().map(raw).collect()),
            Some(Script::Fail(message)) => Err(SourceError::Fetch(FetchError::HttpStatus {
                status: 503,
                url: format!("https://asana.test/projects/{project_id}/tasks"),
                body: message,
            })),
            Some(Script::Panic) => panic!("scripted source panicked for {project_id}"),
            None => Ok(Vec::new()),
        }
    }
}
