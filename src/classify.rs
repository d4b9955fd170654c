//! Path classification shared by the initial walk and live notifications

use std::fs::Metadata;
use std::path::{Component, Path, PathBuf};

/// Trailing marker of editor backup files (`notes.txt~`)
pub const BACKUP_SUFFIX: char = '~';

/// Leading marker of hidden entries (`.git`)
pub const HIDDEN_PREFIX: char = '.';

/// What the pipeline should do with a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClass {
    Ignore,
    DirectoryToWatch,
    FileToUpload,
}

/// Stateless classifier rooted at the watch root.
#[derive(Debug, Clone)]
pub struct PathClassifier {
    root: PathBuf,
}

impl PathClassifier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Classify `path` given its metadata, if it could be read.
    ///
    /// Rules, in order:
    /// 1. names ending in `~` are ignored
    /// 2. anything below a `.`-prefixed directory (between the root and the
    ///    entry) is ignored
    /// 3. `.`-prefixed directories are ignored, other directories are watched
    /// 4. regular files are uploaded; special files are ignored
    ///
    /// Missing metadata means "assume not a directory": the path is treated as
    /// a file so the pipeline keeps moving.
    pub fn classify(&self, path: &Path, meta: Option<&Metadata>) -> PathClass {
        if path == self.root {
            return PathClass::DirectoryToWatch;
        }
        if is_backup(path) || self.has_hidden_ancestor(path) {
            return PathClass::Ignore;
        }
        match meta {
            Some(m) if m.is_dir() => {
                if is_hidden(path) {
                    PathClass::Ignore
                } else {
                    PathClass::DirectoryToWatch
                }
            }
            Some(m) if m.is_file() => PathClass::FileToUpload,
            Some(_) => PathClass::Ignore,
            None => PathClass::FileToUpload,
        }
    }

    /// Same rules for a walkdir entry: lets `filter_entry` prune hidden
    /// subtrees before descending into them.
    pub fn classify_entry(&self, entry: &walkdir::DirEntry) -> PathClass {
        let path = entry.path();
        if path == self.root {
            return PathClass::DirectoryToWatch;
        }
        if is_backup(path) {
            return PathClass::Ignore;
        }
        let ft = entry.file_type();
        if ft.is_dir() {
            if is_hidden(path) {
                PathClass::Ignore
            } else {
                PathClass::DirectoryToWatch
            }
        } else if ft.is_file() {
            PathClass::FileToUpload
        } else if ft.is_symlink() {
            // walkdir does not follow links; resolve the target once
            match std::fs::metadata(path) {
                Ok(m) if m.is_file() => PathClass::FileToUpload,
                _ => PathClass::Ignore,
            }
        } else {
            PathClass::Ignore
        }
    }

    fn has_hidden_ancestor(&self, path: &Path) -> bool {
        let Ok(rel) = path.strip_prefix(&self.root) else {
            return false;
        };
        let Some(parent) = rel.parent() else {
            return false;
        };
        parent.components().any(|c| match c {
            Component::Normal(s) => s.to_string_lossy().starts_with(HIDDEN_PREFIX),
            _ => false,
        })
    }
}

fn file_name_lossy(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn is_backup(path: &Path) -> bool {
    file_name_lossy(path).ends_with(BACKUP_SUFFIX)
}

fn is_hidden(path: &Path) -> bool {
    file_name_lossy(path).starts_with(HIDDEN_PREFIX)
}
