//! databackup - backup/restore session runner
//!
//! Lists catalog candidates, runs a session for a workflow and shows the
//! persisted session log.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use databackup_agent::{
    config::Config,
    daemon::shutdown::ShutdownCoordinator,
    utils::{self, format::format_bytes, format::format_duration_ms},
    ConflictPolicy, FsCatalogSource, LocalGateway, SessionLog, SessionOptions, WorkflowController,
    WorkflowType,
};
use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the catalog of a workflow
    List {
        /// app-backup, media-backup, app-restore or media-restore
        workflow: WorkflowType,
    },

    /// Run a session
    Run {
        workflow: WorkflowType,

        /// Identifier to select (repeatable)
        #[arg(short, long = "select", value_name = "ID")]
        select: Vec<String>,

        /// Select every catalog entry
        #[arg(long)]
        all: bool,

        /// Conflict policy (fail, skip, overwrite); overrides config
        #[arg(long)]
        conflict: Option<ConflictPolicy>,

        /// Entries executed at once; overrides config
        #[arg(short, long)]
        parallelism: Option<usize>,
    },

    /// Show persisted results of a workflow
    Log {
        workflow: WorkflowType,

        /// Only show results of this session
        #[arg(long)]
        session: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!("databackup v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::List { workflow } => list(&config, workflow).await,
        Command::Run {
            workflow,
            select,
            all,
            conflict,
            parallelism,
        } => {
            if let Some(parallelism) = parallelism {
                config.session.parallelism = parallelism;
            }
            config.validate()?;
            let policy = conflict.unwrap_or(config.session.conflict_policy);
            run(&config, workflow, &select, all, policy).await
        }
        Command::Log { workflow, session } => show_log(&config, workflow, session.as_deref()),
    }
}

fn controller(config: &Config, workflow: WorkflowType) -> WorkflowController {
    WorkflowController::new(
        workflow,
        Arc::new(LocalGateway::from_config(config)),
        Arc::new(FsCatalogSource::from_config(config)),
        SessionOptions::from_config(config),
    )
}

async fn list(config: &Config, workflow: WorkflowType) -> Result<()> {
    let mut session = controller(config, workflow);
    session.start().await?;

    let Some(catalog) = session.catalog() else {
        bail!("catalog was not enumerated");
    };
    println!("{} candidates for {}:", catalog.len(), workflow);
    for entry in catalog.iter() {
        let mark = if session.is_selected(&entry.id) { "*" } else { " " };
        let last = entry
            .last_operation_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        let availability = if entry.available { "" } else { " (unavailable)" };
        println!(
            "{} {:<40} {:>12}  last: {}{}",
            mark,
            entry.id,
            format_bytes(entry.size_bytes),
            last,
            availability
        );
    }
    println!("Total: {}", format_bytes(catalog.total_size()));
    Ok(())
}

async fn run(
    config: &Config,
    workflow: WorkflowType,
    select: &[String],
    all: bool,
    policy: ConflictPolicy,
) -> Result<()> {
    let mut session = controller(config, workflow);

    // Signals cancel the session between entries
    let watcher = ShutdownCoordinator::new(session.cancel_token()).spawn();

    let printer = tokio::spawn(session.progress_stream().for_each(|progress| async move {
        if let Some(current) = &progress.current {
            tracing::info!(
                "[{:>5.1}%] {}/{} {} ({} failed)",
                progress.percent(),
                progress.completed,
                progress.total,
                current,
                progress.failed_count
            );
        }
    }));

    session.start().await?;

    if all {
        session.select_all()?;
    }
    for id in select {
        session.select(id)?;
    }

    let manifest = session.build_manifest(policy)?;
    for rejected in manifest.rejected() {
        tracing::warn!("Excluded {}: {}", rejected.source_id, rejected.status);
    }
    tracing::info!(
        "Manifest: {} entries, {}",
        manifest.len(),
        format_bytes(manifest.total_bytes())
    );

    let outcome = session.confirm_and_execute().await;

    let pending = session.flush_log();
    if let Err(e) = &pending {
        tracing::error!("Session log incomplete: {}", e);
    }
    let session_id = session.session_id().to_string();
    drop(session);

    watcher.abort();
    let _ = printer.await;

    let summary = outcome?;
    for result in &summary.results {
        println!(
            "{:<40} {:<40} {:>12} {:>8}  {}",
            result.source_id,
            result.target_id,
            format_bytes(result.metrics.bytes),
            format_duration_ms(result.metrics.duration_ms),
            result.outcome
        );
    }
    println!(
        "Session {}: {} succeeded, {} failed ({} skipped), {} moved",
        session_id,
        summary.progress.succeeded(),
        summary.progress.failed_count,
        summary.progress.skipped,
        format_bytes(summary.progress.bytes)
    );
    for warning in &summary.progress.warnings {
        println!("warning: {}", warning);
    }

    pending?;
    Ok(())
}

fn show_log(config: &Config, workflow: WorkflowType, session: Option<&str>) -> Result<()> {
    let records = SessionLog::load(&config.storage.log_dir, workflow)?;
    let mut shown = 0usize;

    for record in records.iter().filter(|r| session.map_or(true, |id| r.session_id == id)) {
        let result = &record.result;
        println!(
            "{} {} {:<40} -> {:<40} {}",
            result.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.session_id,
            result.source_id,
            result.target_id,
            result.outcome
        );
        shown += 1;
    }

    if shown == 0 {
        println!("No results logged for {}", workflow);
    }
    Ok(())
}
