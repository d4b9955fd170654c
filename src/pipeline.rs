//! Notification draining: classify, register new directories, settle, enqueue.
//!
//! A single task owns the [`WatchRegistry`] and runs [`EventPipeline::run`].
//! Settling happens inline, so a burst of writes throttles the whole
//! pipeline rather than piling up jobs.

use anyhow::{bail, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::PathClass;
use crate::pool::{JobQueue, UploadJob};
use crate::protocol::defaults;
use crate::watch::{DirectoryWatcher, EventReceiver, WatchRegistry};

/// Change kinds the pipeline acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsChange {
    Create,
    Write,
    Remove,
    Rename,
}

/// Split a backend event into per-path changes.
///
/// A name arriving in a watched directory (rename target) counts as a
/// create; the name that went away counts as a rename. Attribute-only and
/// access events are dropped.
pub fn changes(event: &Event) -> Vec<(FsChange, PathBuf)> {
    let per_path = |change: FsChange| -> Vec<(FsChange, PathBuf)> {
        event.paths.iter().map(|p| (change, p.clone())).collect()
    };
    match &event.kind {
        EventKind::Create(_) => per_path(FsChange::Create),
        EventKind::Remove(_) => per_path(FsChange::Remove),
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::To => per_path(FsChange::Create),
            RenameMode::From => per_path(FsChange::Rename),
            RenameMode::Both => {
                let mut out = Vec::with_capacity(2);
                if let Some(from) = event.paths.first() {
                    out.push((FsChange::Rename, from.clone()));
                }
                if let Some(to) = event.paths.get(1) {
                    out.push((FsChange::Create, to.clone()));
                }
                out
            }
            // Backends that can't tell the two sides apart
            _ => event
                .paths
                .iter()
                .map(|p| {
                    let change = if p.exists() {
                        FsChange::Create
                    } else {
                        FsChange::Rename
                    };
                    (change, p.clone())
                })
                .collect(),
        },
        EventKind::Modify(_) => per_path(FsChange::Write),
        _ => Vec::new(),
    }
}

/// Size and mtime of a regular file
type Snapshot = (u64, Option<SystemTime>);

async fn snapshot(path: &Path) -> Option<Snapshot> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    if !meta.is_file() {
        return None;
    }
    Some((meta.len(), meta.modified().ok()))
}

/// Wait for files to stop changing before they are read.
///
/// Each round sleeps `delay` and re-reads (size, mtime); a file is ready once
/// two consecutive snapshots match. After `polls` rounds the remaining files
/// are released anyway, so the delay is the floor, not a guarantee.
#[derive(Debug, Clone, Copy)]
pub struct Settle {
    pub delay: Duration,
    pub polls: u32,
}

impl Default for Settle {
    fn default() -> Self {
        Self {
            delay: defaults::SETTLE_DELAY,
            polls: defaults::SETTLE_POLLS,
        }
    }
}

impl Settle {
    /// Returns the paths to upload, or `None` if cancelled while waiting.
    /// Paths that disappear while settling are dropped.
    pub async fn wait(&self, paths: Vec<PathBuf>, cancel: &CancellationToken) -> Option<Vec<PathBuf>> {
        let mut pending = Vec::with_capacity(paths.len());
        for p in paths {
            let snap = snapshot(&p).await;
            pending.push((p, snap));
        }
        let mut ready = Vec::with_capacity(pending.len());

        // at least one round, so the delay really is the floor
        for _ in 0..self.polls.max(1) {
            if pending.is_empty() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.delay) => {}
            }
            let mut still = Vec::new();
            for (p, prev) in pending {
                match snapshot(&p).await {
                    None => debug!(path = %p.display(), "file vanished before upload"),
                    Some(now) if prev == Some(now) => ready.push(p),
                    now => still.push((p, now)),
                }
            }
            pending = still;
        }

        for (p, _) in pending {
            debug!(path = %p.display(), "file still changing, uploading anyway");
            ready.push(p);
        }
        Some(ready)
    }
}

pub struct EventPipeline<W> {
    registry: WatchRegistry<W>,
    queue: JobQueue,
    target_root: String,
    settle: Settle,
}

impl<W: DirectoryWatcher> EventPipeline<W> {
    pub fn new(registry: WatchRegistry<W>, queue: JobQueue, target_root: impl Into<String>, settle: Settle) -> Self {
        Self {
            registry,
            queue,
            target_root: target_root.into(),
            settle,
        }
    }

    /// Drain notifications until cancelled, the channel closes, or the job
    /// queue is closed. Hands the registry back for inspection.
    pub async fn run(mut self, mut events: EventReceiver, cancel: CancellationToken) -> WatchRegistry<W> {
        loop {
            let raw = tokio::select! {
                _ = cancel.cancelled() => break,
                raw = events.recv() => raw,
            };
            let Some(raw) = raw else {
                debug!("notification channel closed");
                break;
            };
            match raw {
                Ok(event) => {
                    if let Err(err) = self.handle_event(event, &cancel).await {
                        debug!(reason = %err, "event pipeline stopping");
                        break;
                    }
                }
                Err(err) => warn!(error = %err, "filesystem watcher error"),
            }
        }
        self.registry
    }

    /// Process one backend event. Errors only when the pipeline must stop
    /// (cancelled, or the queue was closed).
    pub async fn handle_event(&mut self, event: Event, cancel: &CancellationToken) -> Result<()> {
        debug!(kind = ?event.kind, paths = ?event.paths, "notification");
        for (change, path) in changes(&event) {
            self.handle_path(change, path, cancel).await?;
        }
        Ok(())
    }

    async fn handle_path(&mut self, change: FsChange, path: PathBuf, cancel: &CancellationToken) -> Result<()> {
        // Unreadable metadata: assume not a directory and carry on
        let meta = tokio::fs::metadata(&path).await.ok();
        let class = self.registry.classifier().classify(&path, meta.as_ref());
        if class == PathClass::Ignore {
            debug!(path = %path.display(), "skipping ignored path");
            return Ok(());
        }

        match change {
            FsChange::Create if class == PathClass::DirectoryToWatch => {
                info!(path = %path.display(), "detected new directory");
                let existing = self.registry.register_tree(&path);
                if existing.is_empty() {
                    return Ok(());
                }
                self.settle_and_enqueue(existing, cancel).await
            }
            FsChange::Create | FsChange::Write => {
                if class == PathClass::DirectoryToWatch {
                    return Ok(());
                }
                debug!(path = %path.display(), ?change, "detected file change");
                self.settle_and_enqueue(vec![path], cancel).await
            }
            FsChange::Remove => {
                info!(path = %path.display(), "detected removal");
                Ok(())
            }
            FsChange::Rename => {
                info!(path = %path.display(), "detected rename");
                Ok(())
            }
        }
    }

    async fn settle_and_enqueue(&mut self, paths: Vec<PathBuf>, cancel: &CancellationToken) -> Result<()> {
        let Some(ready) = self.settle.wait(paths, cancel).await else {
            bail!("cancelled while settling");
        };
        let root = self.registry.classifier().root().to_path_buf();
        for path in ready {
            let job = match UploadJob::new(&root, &self.target_root, &path) {
                Ok(job) => job,
                Err(err) => {
                    warn!(error = %err, "dropping job");
                    continue;
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => bail!("cancelled while queue was full"),
                res = self.queue.submit(job) => res?,
            }
        }
        Ok(())
    }

    pub fn registry(&self) -> &WatchRegistry<W> {
        &self.registry
    }
}
