use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use eip_core::{RunAudit, RunStatus};
use eip_storage::Database;
use eip_sync::{apply_control, render_audit_report, ControlAction, Pipeline, PipelineConfig, TriggerOutcome};
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "eip-cli")]
#[command(about = "Economic indicators pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, cleanse, aggregate and analyse once.
    Run,
    /// Re-cleanse all landed raw rows and rebuild the aggregate without fetching.
    Rebuild,
    /// Serve the HTTP trigger (and the cron trigger when enabled).
    Serve,
    Migrate,
    /// Print recent run audits as Markdown.
    Report {
        #[arg(long, default_value_t = 10)]
        runs: u32,
    },
    /// Show or change the pause flags: status, pause, resume, pause-ai,
    /// resume-ai, emergency-stop, restart.
    Control {
        action: String,
        #[arg(long)]
        reason: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let pipeline = Pipeline::from_config(config).await?;
            match pipeline.trigger().await? {
                TriggerOutcome::Paused(flags) => {
                    println!(
                        "pipeline paused ({}); no run started",
                        flags.reason.as_deref().unwrap_or("no reason given")
                    );
                }
                TriggerOutcome::Completed(audit) => finish_run(&audit)?,
            }
        }
        Commands::Rebuild => {
            let pipeline = Pipeline::from_config(config).await?;
            finish_run(&pipeline.rebuild().await)?;
        }
        Commands::Serve => {
            let pipeline = Arc::new(Pipeline::from_config(config).await?);
            let scheduler = pipeline.maybe_build_scheduler().await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
            }
            eip_web::serve(pipeline).await?;
        }
        Commands::Migrate => {
            Database::connect(&config.database_url)
                .await
                .with_context(|| format!("migrating {}", config.database_url))?;
            info!(database = %config.database_url, "migrations applied");
        }
        Commands::Report { runs } => {
            let db = Database::connect(&config.database_url).await?;
            let audits = db.recent_run_audits(runs).await?;
            println!("{}", render_audit_report(&audits));
        }
        Commands::Control { action, reason } => {
            let db = Database::connect(&config.database_url).await?;
            let flags = if action == "status" {
                db.control_flags().await?
            } else {
                let Some(parsed) = ControlAction::parse(&action) else {
                    let allowed: Vec<_> = ControlAction::ALL.iter().map(|a| a.as_str()).collect();
                    bail!("unknown control action {action:?}; expected status or one of {}", allowed.join(", "));
                };
                apply_control(&db, parsed, reason.as_deref(), Utc::now()).await?
            };
            println!("{}", serde_json::to_string_pretty(&flags)?);
        }
    }

    Ok(())
}

fn finish_run(audit: &RunAudit) -> Result<()> {
    println!(
        "run {} {}: raw={} valid={} invalid={} curated={} months={} insight={} ({:.2}s)",
        audit.run_id,
        audit.status.as_str(),
        audit.counts.raw_landed,
        audit.counts.valid_records,
        audit.counts.invalid_records,
        audit.counts.curated_changed,
        audit.counts.aggregated_rows,
        audit.insight.as_str(),
        audit.duration_seconds,
    );
    for failure in &audit.indicator_failures {
        println!("  {}: {}", failure.indicator_code, failure.message);
    }
    if audit.status == RunStatus::Failed {
        bail!(
            "pipeline run failed: {}",
            audit.error_message.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}
