//! One client run: register watches, pick the initial file set, then keep
//! the remote tree in sync until cancelled.

use anyhow::{bail, Context, Result};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::classify::PathClassifier;
use crate::cli::InitMode;
use crate::client::UploadClient;
use crate::fs_enum::{git_diff_files, walk_tree};
use crate::logger::{JsonlLogger, Logger, NoopLogger};
use crate::pipeline::{EventPipeline, Settle};
use crate::pool::{PoolSummary, UploadJob, Uploader, WorkerPool};
use crate::watch::{notify_channel, WatchRegistry};

/// Fully validated client settings
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub watch_root: PathBuf,
    pub endpoint: Url,
    pub target_root: String,
    pub mode: InitMode,
    pub concurrency: NonZeroUsize,
    pub settle: Settle,
    pub token: Option<String>,
    pub timeout: Duration,
    pub log_file: Option<PathBuf>,
}

/// Run against the configured HTTP endpoint.
pub async fn run(config: SyncConfig, cancel: CancellationToken) -> Result<PoolSummary> {
    let client = UploadClient::new(config.endpoint.clone(), config.token.clone(), config.timeout)
        .context("failed to build HTTP client")?;
    info!(endpoint = %client.endpoint(), "uploading to receiver");
    run_with_uploader(config, Arc::new(client), cancel).await
}

/// Run with any [`Uploader`]. Returns once `cancel` fires and every queued
/// job has been processed.
pub async fn run_with_uploader<U: Uploader>(
    config: SyncConfig,
    uploader: Arc<U>,
    cancel: CancellationToken,
) -> Result<PoolSummary> {
    let journal: Arc<dyn Logger> = match &config.log_file {
        Some(path) => {
            let logger = JsonlLogger::new(path)?;
            info!(path = %path.display(), session = logger.session(), "writing upload journal");
            Arc::new(logger)
        }
        None => Arc::new(NoopLogger),
    };
    let pool = WorkerPool::spawn(config.concurrency, uploader, journal);
    let queue = pool.queue();

    let classifier = PathClassifier::new(&config.watch_root);
    let (watcher, events) = notify_channel()?;
    let mut registry = WatchRegistry::new(watcher, classifier.clone());
    if !registry.add_directory(&config.watch_root) {
        pool.shutdown().await;
        bail!("failed to watch {}", config.watch_root.display());
    }

    // Watches go in before the initial selection so nothing written in
    // between is missed.
    let listing = walk_tree(&config.watch_root, &classifier);
    for dir in &listing.dirs {
        registry.add_directory(dir);
    }
    info!(
        root = %config.watch_root.display(),
        directories = registry.len(),
        "watch registered"
    );

    let initial = match config.mode {
        InitMode::All => listing.files,
        InitMode::Git => match git_diff_files(&config.watch_root, &classifier).await {
            Ok(files) => files,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "git diff failed, skipping initial sync");
                Vec::new()
            }
        },
    };
    info!(mode = ?config.mode, files = initial.len(), "initial sync");

    let pipeline = EventPipeline::new(registry, queue.clone(), config.target_root.clone(), config.settle);
    let drain = tokio::spawn(pipeline.run(events, cancel.clone()));

    for path in initial {
        let job = match UploadJob::new(&config.watch_root, &config.target_root, &path) {
            Ok(job) => job,
            Err(err) => {
                debug!(error = %err, "skipping initial file");
                continue;
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = queue.submit(job) => if res.is_err() { break },
        }
    }

    let registry = drain.await.context("event pipeline task failed")?;
    debug!(directories = registry.len(), "event pipeline stopped");
    // The watcher lives in the registry; dropping it ends notifications.
    drop(registry);

    let summary = pool.shutdown().await;
    info!(
        uploaded = summary.uploaded,
        failed = summary.failed,
        bytes = summary.bytes,
        "sync stopped"
    );
    Ok(summary)
}
