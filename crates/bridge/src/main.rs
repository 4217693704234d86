mod config;
mod logging;

use std::process::ExitCode;
use std::sync::Arc;

use bridge_api::ApiClient;
use bridge_config::mapping_config::MappingConfigStore;
use bridge_config::paths::BridgePaths;
use bridge_core::clock::{Clock, SystemClock};
use bridge_engine::{
    DefaultAdapterFactory, EnvConnectionResolver, RunnerConfig, SyncDispatcher, SyncDispatcherArgs, SyncOptions,
    SyncRunner, SyncRunnerArgs, TelemetryEmitter,
};
use bridge_engine::running_set::RunningSet;
use bridge_storage::{MappingStateStore, TokenCache};
use bridge_upload::{BatchUploader, FileUploader};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{Cli, Command};

/// `BatchUploader.upload_files` concurrency cap (§4.6's "up to max_concurrent (default 3)").
const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _logging_guard = match logging::init(&cli.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialise logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "bridge exited with a fatal error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, anyhow::Error> {
    let paths = BridgePaths::resolve(cli.base_dir)?;
    paths.ensure_directories()?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let config_store = Arc::new(MappingConfigStore::new(paths.clone()));
    let state_store = Arc::new(MappingStateStore::load(paths.sync_state_file(), clock.clone()).await?);
    let api = Arc::new(ApiClient::from_env()?);
    let tokens = Arc::new(TokenCache::load(paths.upload_tokens_file(), clock.clone()).await?);
    let file_uploader = Arc::new(FileUploader::new(api.clone(), tokens, clock.clone()));
    let uploader = Arc::new(BatchUploader::new(file_uploader, DEFAULT_MAX_CONCURRENT_UPLOADS));
    let telemetry = Arc::new(TelemetryEmitter::new(api, clock.clone()));

    let runner = Arc::new(SyncRunner::new(SyncRunnerArgs {
        paths: paths.clone(),
        config_store: config_store.clone(),
        state_store: state_store.clone(),
        connection_resolver: Arc::new(EnvConnectionResolver),
        adapter_factory: Arc::new(DefaultAdapterFactory),
        uploader,
        clock,
        running: Arc::new(RunningSet::new()),
        telemetry,
        runner_config: RunnerConfig::default(),
    }));

    match cli.command {
        Command::Status(args) => {
            let dispatcher = SyncDispatcher::with_default_workers(config_store, state_store, runner);
            print_status(&dispatcher, args.json).await;
            Ok(ExitCode::SUCCESS)
        }
        Command::Sync(args) => {
            let max_workers = args.workers.max(1);
            let dispatcher =
                SyncDispatcher::new(SyncDispatcherArgs { config_store: config_store.clone(), state_store, runner, max_workers });

            let names = if args.all {
                config_store.list_names().await?
            } else {
                args.mapping.clone()
            };

            let opts = SyncOptions { dry_run: args.dry_run, force: args.force, batch_size_override: args.batch_size };
            let cancel = CancellationToken::new();
            let cancel_on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("shutdown signal received, canceling in-flight syncs");
                    cancel_on_signal.cancel();
                }
            });

            let outcome = dispatcher.sync_many(&names, opts, args.parallel, cancel.clone()).await;
            for result in &outcome.results {
                if result.success {
                    info!(
                        mapping_name = %result.mapping_name,
                        rows_extracted = result.rows_extracted,
                        files_uploaded = result.files_uploaded,
                        duration_ms = result.duration_ms,
                        message = ?result.error_message,
                        "sync succeeded"
                    );
                } else {
                    tracing::error!(
                        mapping_name = %result.mapping_name,
                        error = ?result.error_message,
                        duration_ms = result.duration_ms,
                        "sync failed"
                    );
                }
            }

            if args.status {
                print_status(&dispatcher, false).await;
            }

            if cancel.is_cancelled() {
                return Ok(ExitCode::from(130));
            }
            if outcome.results.iter().any(|r| !r.success) {
                return Ok(ExitCode::FAILURE);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn print_status(dispatcher: &SyncDispatcher, json: bool) {
    let status = dispatcher.status().await;
    if json {
        match serde_json::to_string_pretty(&status) {
            Ok(body) => println!("{body}"),
            Err(e) => tracing::warn!(error = %e, "failed to serialise status"),
        }
        return;
    }
    let mut names: Vec<&String> = status.keys().collect();
    names.sort();
    for name in names {
        let state = &status[name];
        println!(
            "{name}: running={} sync_count={} total_records={} last_sync={} last_error={}",
            state.is_running,
            state.sync_count,
            state.total_records_processed,
            state.last_sync_timestamp.as_deref().unwrap_or("never"),
            state.last_error.as_deref().unwrap_or("none"),
        );
    }
}
