//! Backup Forge binary: one-shot backup runs and the integration bridge
//! server.
//!
//! The production object-store and cluster-API adapters are supplied by the
//! embedding distribution through the backend traits in
//! `backup_forge::resilient_clients`; this binary wires the in-memory
//! backends for local smoke runs and serves the bridge for real webhook
//! traffic.
//!
//! Exit codes: 0 success, 1 retryable failure exhausted (or any failed
//! item), 2 circuit-open top-level failure, 3 configuration error.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use backup_forge::integration_bridge::IntegrationBridge;
use backup_forge::logging::{log_error, log_info, LogCategory, LoggingOptions};
use backup_forge::orchestrator::{exit_code_for, BackupOrchestrator};
use backup_forge::resilience_core::BreakerManager;
use backup_forge::resilient_clients::{MemoryObjectStore, ScriptedClusterApi};
use backup_forge::runtime_config::BackupConfig;
use backup_forge::BackupForgeError;

#[derive(Parser)]
#[command(name = "backup-forge", version, about = "Cluster state backup & GitOps orchestration")]
struct Cli {
    /// Path to an explicit config file (highest precedence)
    #[arg(global = true, long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run one backup job (default)
    Backup {
        /// Enumerate retention candidates without deleting anything
        #[arg(long)]
        dry_run_cleanup: bool,
    },
    /// Serve the integration bridge webhook endpoints
    Serve,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = match build_runtime() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::from(1);
        }
    };

    let code = runtime.block_on(run(cli));
    ExitCode::from(code)
}

fn build_runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    use anyhow::Context;
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")
}

async fn run(cli: Cli) -> u8 {
    if let Err(e) = backup_forge::logging::init(&LoggingOptions::default()) {
        eprintln!("configuration error: {e}");
        return 3;
    }

    // The exporter is touched only here; everything else records through the
    // metrics facade
    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new().install() {
        eprintln!("metrics exporter not installed: {e}");
    }

    let config = match BackupConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return 3;
        }
    };

    match cli.command.unwrap_or(Command::Backup {
        dry_run_cleanup: false,
    }) {
        Command::Serve => serve_bridge(config).await,
        Command::Backup { dry_run_cleanup } => run_backup(config, dry_run_cleanup).await,
    }
}

async fn run_backup(mut config: BackupConfig, dry_run_cleanup: bool) -> u8 {
    if dry_run_cleanup {
        config.retention.dry_run = true;
    }

    let store = Arc::new(MemoryObjectStore::new());
    let api = Arc::new(ScriptedClusterApi::new());

    let breakers = Arc::new(BreakerManager::new());
    let bridge = match IntegrationBridge::new(config.bridge.clone(), breakers) {
        Ok(bridge) => bridge,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return 3;
        }
    };
    bridge.clone().start_event_pump();

    let mut orchestrator = match BackupOrchestrator::new(config, store, api).await {
        Ok(orchestrator) => orchestrator.with_event_bus(bridge.event_bus()),
        Err(e) => {
            eprintln!("configuration error: {e}");
            return 3;
        }
    };

    // SIGINT triggers the bounded-grace shutdown path
    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log_info(LogCategory::System, "Interrupt received, shutting down");
            cancel.cancel();
        }
    });

    let result = orchestrator.run_backup().await;
    match &result {
        Ok(report) => log_info(
            LogCategory::System,
            &format!(
                "Run finished: {} resources, {} failed, manifest at {}",
                report.manifest.resource_count, report.manifest.failed, report.manifest_key
            ),
        ),
        Err(e) => log_error(LogCategory::System, &format!("Run failed: {e}")),
    }

    bridge.shutdown();
    exit_code_for(&result) as u8
}

async fn serve_bridge(config: BackupConfig) -> u8 {
    let breakers = Arc::new(BreakerManager::new());
    let bridge = match IntegrationBridge::new(config.bridge, breakers) {
        Ok(bridge) => bridge,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return 3;
        }
    };

    bridge.clone().start_event_pump();
    bridge.clone().start_probe_loop();
    let address = match bridge.clone().start_server().await {
        Ok(address) => address,
        Err(e) => {
            let code = match e {
                BackupForgeError::Configuration(_) => 3,
                _ => 1,
            };
            eprintln!("bridge failed to start: {e}");
            return code;
        }
    };
    log_info(
        LogCategory::System,
        &format!("Bridge serving on {address}, press Ctrl-C to stop"),
    );

    let _ = tokio::signal::ctrl_c().await;
    bridge.shutdown();
    0
}
