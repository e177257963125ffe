//! Reconciliation engine, run log, and scheduling for the task mirror.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tally_adapters::{AsanaSource, TaskSource};
use tally_storage::{
    HttpClientConfig, HttpFetcher, PersistenceGateway, PgStore, RunLogStore, TaskStore,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

mod config;
mod reconcile;
mod runner;
#[cfg(test)]
mod test_support;

pub use config::{
    load_profiles, project_settings, ProjectSettings, SyncConfig, MAX_LOOKBACK_DAYS,
};
pub use reconcile::{
    plan_reconciliation, KindOutcome, ReconcilePlan, Reconciler, SyncError, SYNC_ACTOR,
};
pub use runner::{KindReport, KindSelection, RunLogRecorder, RunReport, SyncRunner};

pub fn build_source(config: &SyncConfig) -> Result<AsanaSource> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    AsanaSource::new(http, &config.asana_api_base, config.asana_token.clone())
        .context("configuring Asana client")
}

pub fn build_runner(
    config: &SyncConfig,
    source: Arc<dyn TaskSource>,
    tasks: Arc<dyn TaskStore>,
    runs: Arc<dyn RunLogStore>,
) -> Result<SyncRunner> {
    let projects = project_settings(config)?;
    for (kind, settings) in &projects {
        if settings.project_id.is_none() {
            warn!(
                %kind,
                "no upstream project id configured; this kind will fail until one is set"
            );
        }
    }
    let lookback = chrono::Duration::try_days(config.lookback_days)
        .with_context(|| format!("lookback of {} days is out of range", config.lookback_days))?;
    let gateway = PersistenceGateway::new(
        tasks,
        config.upsert_chunk_size,
        config.max_chunks_in_flight,
    );
    let reconciler = Reconciler::new(source, gateway, projects, lookback);
    Ok(SyncRunner::new(reconciler, runs))
}

/// Production wiring: Postgres store, Asana source, and the runner over both.
pub struct SyncApp {
    pub config: SyncConfig,
    pub store: Arc<PgStore>,
    pub source: Arc<AsanaSource>,
    pub runner: Arc<SyncRunner>,
}

impl SyncApp {
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let store = Arc::new(
            PgStore::connect(&config.database_url)
                .await
                .context("connecting to DATABASE_URL")?,
        );
        let source = Arc::new(build_source(&config)?);
        let runner = build_runner(&config, source.clone(), store.clone(), store.clone())?;
        Ok(Self {
            config,
            store,
            source,
            runner: Arc::new(runner),
        })
    }

    pub async fn from_env() -> Result<Self> {
        Self::connect(SyncConfig::from_env()).await
    }
}

pub async fn run_sync_once_from_env(selection: KindSelection) -> Result<RunReport> {
    let app = SyncApp::from_env().await?;
    Ok(app.runner.run(selection).await)
}

/// Cron-driven full runs, or `None` when scheduling is disabled.
pub async fn build_scheduler(
    config: &SyncConfig,
    runner: Arc<SyncRunner>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let runner = Arc::clone(&runner);
        Box::pin(async move {
            let report = runner.run(KindSelection::All).await;
            info!(
                status = report.status.as_str(),
                tasks_processed = report.tasks_processed,
                "scheduled sync finished"
            );
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
