use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tally_sync::{KindSelection, SyncApp, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tally")]
#[command(about = "Team points sync: mirror Asana project tasks into Postgres")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation and print the report as JSON.
    Sync {
        #[arg(long, default_value_t = KindSelection::All)]
        project: KindSelection,
    },
    /// Show the most recent run log entries.
    Runs {
        #[arg(long, default_value_t = 5)]
        limit: i64,
    },
    /// HTTP trigger surface, plus the scheduler when enabled.
    Serve,
    Migrate,
    /// Verify the access token can read each configured project.
    Check,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { project: KindSelection::All }) {
        Commands::Sync { project } => {
            let report = tally_sync::run_sync_once_from_env(project).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.success {
                bail!("sync finished with status {}", report.status.as_str());
            }
        }
        Commands::Runs { limit } => {
            let app = SyncApp::from_env().await?;
            for run in app.runner.recent_runs(limit.clamp(1, 100)).await? {
                println!("{}", serde_json::to_string(&run)?);
            }
        }
        Commands::Serve => {
            tally_web::serve_from_env().await?;
        }
        Commands::Migrate => {
            let app = SyncApp::from_env().await?;
            app.store.migrate().await?;
            info!("migrations applied");
        }
        Commands::Check => {
            let config = SyncConfig::from_env();
            if config.project_ids.is_empty() {
                bail!("neither ASANA_PROJECT_ID nor ASANA_GRAPHIC_PROJECT_ID is set");
            }
            let source = tally_sync::build_source(&config)?;
            let mut failed = 0usize;
            for (kind, project_id) in &config.project_ids {
                match source.probe_project(project_id).await {
                    Ok(name) => println!("{kind}: ok ({name})"),
                    Err(err) => {
                        failed += 1;
                        println!("{kind}: FAILED ({err})");
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} project(s) unreachable");
            }
        }
    }

    Ok(())
}
