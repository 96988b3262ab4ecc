use std::sync::Arc;

use anyhow::{Context, Result};
use filehost_sync::locker::{user_file_lock_key, with_lock, LockOptions, LockerRegistry};
use filehost_sync::telemetry::{init_tracing, TelemetryConfig};
use filehost_sync::{Manager, QueueService};
use filehost_worker::{Mailer, WorkerConfig};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    if let Ok(path) = dotenvy::dotenv() {
        eprintln!("Loaded environment from {}", path.display());
    }

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "filehost_worker=debug,filehost_sync=info")
    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.service_name == "filehost" {
        telemetry_config.service_name = "filehost-worker".to_string();
    }
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter = Some("filehost_worker=debug,filehost_sync=info".to_string());
    }
    init_tracing(&telemetry_config);

    tracing::info!("filehost-worker starting...");

    let config = WorkerConfig::from_env().context("Failed to load worker configuration")?;
    let locker = LockerRegistry::new()
        .create(&config.locker_type, &config.locker_config)
        .with_context(|| format!("Failed to create locker backend {}", config.locker_type))?;

    let manager = Arc::new(Manager::new());
    let service = QueueService::new(Arc::clone(&manager), config.queues.clone());
    let mailer =
        Mailer::start(&service, config.mailer.clone()).context("Failed to start mailer")?;

    tracing::info!(
        locker = %config.locker_type,
        queues = manager.len(),
        "Worker initialized"
    );

    // Serialize a change to one user's file tree and announce it
    let cancel = CancellationToken::new();
    let uid = 1;
    let key = user_file_lock_key(uid);
    with_lock(locker.as_ref(), &cancel, &key, LockOptions::default(), async {
        let message = mailer.message(
            vec!["owner@localhost".to_string()],
            "Files updated",
            "Your file tree was reorganized.",
        );
        mailer.send(message).await.context("Failed to queue mail")
    })
    .await?;
    tracing::info!(uid, %key, "File tree updated");

    let snapshot = serde_json::to_string_pretty(&manager.summaries())
        .context("Failed to serialize queue snapshot")?;
    println!("{}", snapshot);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    mailer.shutdown();
    let deadline = CancellationToken::new();
    let timer = {
        let deadline = deadline.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            deadline.cancel();
        })
    };
    if let Err(e) = mailer.flush(&deadline).await {
        tracing::warn!(error = %e, "Mail queue not drained before shutdown");
    }
    timer.abort();
    locker.close().context("Failed to close locker")?;

    tracing::info!("Worker shutdown complete");
    Ok(())
}
