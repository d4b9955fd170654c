//! Watch registration for the synchronized tree.
//!
//! Directories are registered one by one (non-recursive watches) so that the
//! classifier decides which subtrees are observed. The watch set only grows:
//! removed directories are never unregistered.

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::classify::PathClassifier;
use crate::fs_enum::walk_tree;

/// Raw notification as delivered by the backend
pub type RawEvent = notify::Result<notify::Event>;

/// Seam over the notification backend so the registry can be driven in tests
pub trait DirectoryWatcher: Send {
    fn watch_dir(&mut self, path: &Path) -> notify::Result<()>;
}

impl DirectoryWatcher for RecommendedWatcher {
    fn watch_dir(&mut self, path: &Path) -> notify::Result<()> {
        self.watch(path, RecursiveMode::NonRecursive)
    }
}

/// Consumer end of [`notify_channel`]
pub type EventReceiver = mpsc::UnboundedReceiver<RawEvent>;

/// Create the platform watcher plus the channel its callback feeds.
///
/// The callback runs on notify's event-loop thread, which also answers
/// `watch()` calls. It must never block: the task draining the channel is
/// the one registering new directories, so a parked callback would leave
/// that registration waiting forever.
pub fn notify_channel() -> Result<(RecommendedWatcher, EventReceiver)> {
    let (tx, rx) = mpsc::unbounded_channel::<RawEvent>();
    let watcher = notify::recommended_watcher(move |res: RawEvent| {
        // Receiver gone means the pipeline has shut down
        let _ = tx.send(res);
    })
    .context("failed to create filesystem watcher")?;
    Ok((watcher, rx))
}

/// Owns the watch set. Mutated only by the notification-draining task.
pub struct WatchRegistry<W> {
    watcher: W,
    classifier: PathClassifier,
    watched: HashSet<PathBuf>,
}

impl<W: DirectoryWatcher> WatchRegistry<W> {
    pub fn new(watcher: W, classifier: PathClassifier) -> Self {
        Self {
            watcher,
            classifier,
            watched: HashSet::new(),
        }
    }

    /// Register `path` for notifications.
    ///
    /// Returns `true` if the directory is watched after the call. Registering
    /// an already watched directory is a no-op. Failures are logged and leave
    /// that directory (and everything below it) unobserved.
    pub fn add_directory(&mut self, path: &Path) -> bool {
        if self.watched.contains(path) {
            return true;
        }
        match self.watcher.watch_dir(path) {
            Ok(()) => {
                info!(path = %path.display(), "watching directory");
                self.watched.insert(path.to_path_buf());
                true
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to add directory to watcher");
                false
            }
        }
    }

    /// Register `dir` and every non-ignored directory below it.
    ///
    /// Returns the files already present in the subtree. Anything written
    /// before a watch became active would otherwise never be reported.
    pub fn register_tree(&mut self, dir: &Path) -> Vec<PathBuf> {
        let listing = walk_tree(dir, &self.classifier);
        for d in &listing.dirs {
            self.add_directory(d);
        }
        if !listing.files.is_empty() {
            debug!(
                path = %dir.display(),
                files = listing.files.len(),
                "found files in newly watched directory"
            );
        }
        listing.files
    }

    pub fn is_watched(&self, path: &Path) -> bool {
        self.watched.contains(path)
    }

    pub fn len(&self) -> usize {
        self.watched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
    }

    pub fn classifier(&self) -> &PathClassifier {
        &self.classifier
    }

    pub fn watcher(&self) -> &W {
        &self.watcher
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Records registrations; paths listed in `refuse` fail to register.
    #[derive(Default)]
    pub(crate) struct RecordingWatcher {
        pub calls: Vec<PathBuf>,
        pub refuse: Vec<PathBuf>,
    }

    impl DirectoryWatcher for RecordingWatcher {
        fn watch_dir(&mut self, path: &Path) -> notify::Result<()> {
            self.calls.push(path.to_path_buf());
            if self.refuse.iter().any(|r| r == path) {
                return Err(notify::Error::generic("refused"));
            }
            Ok(())
        }
    }

    #[test]
    fn add_directory_is_idempotent() {
        let mut reg = WatchRegistry::new(RecordingWatcher::default(), PathClassifier::new("/w"));
        assert!(reg.add_directory(Path::new("/w/a")));
        assert!(reg.add_directory(Path::new("/w/a")));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.watcher().calls.len(), 1);
    }

    #[test]
    fn failed_registration_is_not_fatal() {
        let watcher = RecordingWatcher {
            refuse: vec![PathBuf::from("/w/locked")],
            ..Default::default()
        };
        let mut reg = WatchRegistry::new(watcher, PathClassifier::new("/w"));
        assert!(!reg.add_directory(Path::new("/w/locked")));
        assert!(!reg.is_watched(Path::new("/w/locked")));
        assert!(reg.add_directory(Path::new("/w/open")));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn registration_completes_while_events_pile_up() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let (watcher, events) = notify_channel().unwrap();
        let mut reg = WatchRegistry::new(watcher, PathClassifier::new(&root));
        assert!(reg.add_directory(&root));

        // Nobody drains `events` while the burst is delivered
        for i in 0..500 {
            fs::write(root.join(format!("f{i}.txt")), b"x").unwrap();
        }
        fs::create_dir(root.join("sub")).unwrap();

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let sub = root.join("sub");
        std::thread::spawn(move || {
            let ok = reg.add_directory(&sub);
            let _ = done_tx.send(ok);
            drop(reg);
        });
        let ok = done_rx
            .recv_timeout(std::time::Duration::from_secs(10))
            .expect("add_directory should not wait on the event consumer");
        assert!(ok);
        drop(events);
    }

    #[test]
    fn register_tree_watches_nested_dirs_and_returns_files() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::create_dir_all(root.join("a/.hidden")).unwrap();
        fs::write(root.join("a/b/b.txt"), b"hi").unwrap();
        fs::write(root.join("a/.hidden/secret"), b"s").unwrap();

        let mut reg = WatchRegistry::new(RecordingWatcher::default(), PathClassifier::new(root));
        let files = reg.register_tree(&root.join("a"));

        assert!(reg.is_watched(&root.join("a")));
        assert!(reg.is_watched(&root.join("a/b")));
        assert!(!reg.is_watched(&root.join("a/.hidden")));
        assert_eq!(files, vec![root.join("a/b/b.txt")]);
    }
}
