use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use statsync::config::{AppConfig, Cli, JobsConfig};
use statsync::logging::{init_logging, start_retention_cleanup};
use statsync::panic_hook;
use statsync::services::ServiceContainer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env()?.apply_cli(&cli);

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_logging(config.log_dir.as_deref())?;
    panic_hook::install();

    info!(
        instance = %config.instance_id,
        jobs_file = %config.jobs_file.display(),
        run_once = config.run_once,
        "statsync starting"
    );

    let jobs = JobsConfig::load(&config.jobs_file)
        .await
        .with_context(|| format!("loading jobs from {}", config.jobs_file.display()))?;
    let run_once = config.run_once;
    let log_dir = config.log_dir.clone();

    let container = ServiceContainer::new(config, jobs)
        .await
        .context("initializing services")?;

    if run_once {
        let report = container.run_once().await;
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Run-once pass finished"
        );
        if !report.failed.is_empty() {
            warn!(failed = ?report.failed, "Some jobs failed during run-once pass");
        }
        container.pool.close().await;
        return Ok(());
    }

    if let Some(dir) = &log_dir {
        let _retention = start_retention_cleanup(dir, container.cancellation_token());
    }

    let services = container.start().context("starting services")?;
    wait_for_shutdown_signal().await;

    if let Err(e) = services.shutdown().await {
        error!(error = %e, "Shutdown finished with errors");
    }
    info!("statsync stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Cannot listen for SIGTERM, waiting for Ctrl+C only"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Received shutdown signal");
}
