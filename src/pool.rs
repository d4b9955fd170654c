//! Upload jobs, the bounded job queue and the fixed-size worker pool

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::num::NonZeroUsize;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::logger::Logger;

/// One file to push. Jobs carry no identity beyond their path; duplicates
/// are processed independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadJob {
    pub absolute_path: PathBuf,
    pub relative_path: PathBuf,
    pub target_root: String,
}

impl UploadJob {
    /// Build a job for `path`, which must live under `watch_root`.
    pub fn new(watch_root: &Path, target_root: &str, path: &Path) -> Result<Self> {
        let Ok(rel) = path.strip_prefix(watch_root) else {
            bail!(
                "{} is outside the watch root {}",
                path.display(),
                watch_root.display()
            );
        };
        if rel.as_os_str().is_empty() {
            bail!("refusing to upload the watch root itself");
        }
        Ok(Self {
            absolute_path: path.to_path_buf(),
            relative_path: rel.to_path_buf(),
            target_root: target_root.to_string(),
        })
    }

    /// Server-side destination: target root joined with the relative path,
    /// always `/`-separated with empty segments collapsed.
    pub fn target_path(&self) -> String {
        let mut out = String::new();
        for seg in self.target_root.split('/').filter(|s| !s.is_empty()) {
            out.push('/');
            out.push_str(seg);
        }
        for comp in self.relative_path.components() {
            if let Component::Normal(s) = comp {
                out.push('/');
                out.push_str(&s.to_string_lossy());
            }
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    }

    pub fn file_name(&self) -> String {
        self.absolute_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Outcome of a single upload as reported to the pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Uploaded {
    pub bytes: u64,
}

/// Performs one upload per job. Implemented by the HTTP client; tests plug
/// in fakes.
#[async_trait]
pub trait Uploader: Send + Sync + 'static {
    async fn upload(&self, job: &UploadJob) -> Result<Uploaded>;
}

/// Producer side of the bounded job queue. `submit` waits while the queue is
/// full instead of dropping jobs.
#[derive(Clone)]
pub struct JobQueue {
    tx: async_channel::Sender<UploadJob>,
}

impl JobQueue {
    /// Queue of `capacity` slots plus the consumer end
    pub fn bounded(capacity: usize) -> (Self, async_channel::Receiver<UploadJob>) {
        let (tx, rx) = async_channel::bounded(capacity);
        (Self { tx }, rx)
    }

    pub async fn submit(&self, job: UploadJob) -> Result<()> {
        if self.tx.send(job).await.is_err() {
            bail!("job queue is closed");
        }
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

/// Totals collected by the workers
#[derive(Debug, Default)]
struct PoolStats {
    uploaded: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
}

/// Snapshot returned when the pool shuts down
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolSummary {
    pub uploaded: u64,
    pub failed: u64,
    pub bytes: u64,
}

impl PoolStats {
    fn summary(&self) -> PoolSummary {
        PoolSummary {
            uploaded: self.uploaded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// N workers draining one queue of capacity N.
pub struct WorkerPool {
    queue: JobQueue,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    pub fn spawn<U: Uploader>(
        concurrency: NonZeroUsize,
        uploader: Arc<U>,
        journal: Arc<dyn Logger>,
    ) -> Self {
        let (queue, rx) = JobQueue::bounded(concurrency.get());
        let stats = Arc::new(PoolStats::default());
        let handles = (1..=concurrency.get())
            .map(|id| {
                let rx = rx.clone();
                let uploader = Arc::clone(&uploader);
                let journal = Arc::clone(&journal);
                let stats = Arc::clone(&stats);
                tokio::spawn(async move {
                    // recv() fails only once the queue is closed and empty
                    while let Ok(job) = rx.recv().await {
                        run_job(id, &job, &*uploader, &*journal, &stats).await;
                    }
                    debug!(worker = id, "worker exiting");
                })
            })
            .collect();
        Self {
            queue,
            handles,
            stats,
        }
    }

    pub fn queue(&self) -> JobQueue {
        self.queue.clone()
    }

    pub fn summary(&self) -> PoolSummary {
        self.stats.summary()
    }

    /// Close the queue, let workers finish the jobs already queued, and wait
    /// for them to exit.
    pub async fn shutdown(self) -> PoolSummary {
        let pending = self.queue.len();
        self.queue.tx.close();
        if pending > 0 {
            info!(pending, "draining queued uploads");
        }
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "upload worker panicked");
            }
        }
        self.stats.summary()
    }
}

async fn run_job(
    id: usize,
    job: &UploadJob,
    uploader: &dyn Uploader,
    journal: &dyn Logger,
    stats: &PoolStats,
) {
    let target = job.target_path();
    match uploader.upload(job).await {
        Ok(done) => {
            stats.uploaded.fetch_add(1, Ordering::Relaxed);
            stats.bytes.fetch_add(done.bytes, Ordering::Relaxed);
            journal.uploaded(&job.absolute_path, &target, done.bytes);
        }
        Err(err) => {
            // Failed uploads are dropped, never retried or re-queued
            stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!(
                worker = id,
                path = %job.absolute_path.display(),
                error = %format!("{err:#}"),
                "failed to upload file"
            );
            journal.failed(&job.absolute_path, &target, &format!("{err:#}"));
        }
    }
}
