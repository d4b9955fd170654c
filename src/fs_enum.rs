use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::classify::{PathClass, PathClassifier};
// Filesystem enumeration for the initial sync and new-directory catch-up

/// Directories to watch and files to upload found under one subtree
#[derive(Debug, Default, Clone)]
pub struct TreeListing {
    pub dirs: Vec<PathBuf>,
    pub files: Vec<PathBuf>,
}

/// Walk `start` (inclusive), pruning ignored directories before descending.
///
/// Unreadable entries are logged and skipped; a partial listing is still
/// useful to the caller.
pub fn walk_tree(start: &Path, classifier: &PathClassifier) -> TreeListing {
    let mut listing = TreeListing::default();

    for entry in WalkDir::new(start)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            // Skip hidden directories entirely - this prevents walking into them
            if e.file_type().is_dir() {
                let keep = classifier.classify_entry(e) != PathClass::Ignore;
                if !keep {
                    debug!(path = %e.path().display(), "skipping hidden directory");
                }
                keep
            } else {
                true
            }
        })
    {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                warn!(error = %err, "skipping unreadable entry");
                continue;
            }
        };
        match classifier.classify_entry(&entry) {
            PathClass::DirectoryToWatch => listing.dirs.push(entry.into_path()),
            PathClass::FileToUpload => listing.files.push(entry.into_path()),
            PathClass::Ignore => {
                debug!(path = %entry.path().display(), "skipping ignored entry")
            }
        }
    }

    listing
}

/// Files that differ from `origin`, scoped to the watch root.
///
/// Runs `git diff --name-only --relative origin` inside `root`, so the
/// paths are relative to the watch root even when it is a repository
/// subdirectory. Deleted or ignored paths are dropped.
pub async fn git_diff_files(root: &Path, classifier: &PathClassifier) -> Result<Vec<PathBuf>> {
    let output = tokio::process::Command::new("git")
        .args(["diff", "--name-only", "--relative", "origin"])
        .current_dir(root)
        .output()
        .await
        .context("failed to run git diff")?;
    if !output.status.success() {
        bail!(
            "git diff failed ({}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(parse_diff_names(root, &String::from_utf8_lossy(&output.stdout), classifier))
}

fn parse_diff_names(root: &Path, stdout: &str, classifier: &PathClassifier) -> Vec<PathBuf> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| root.join(l))
        .filter(|p| {
            let meta = std::fs::metadata(p).ok();
            if meta.is_none() {
                debug!(path = %p.display(), "diff entry no longer exists");
                return false;
            }
            classifier.classify(p, meta.as_ref()) == PathClass::FileToUpload
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn walk_prunes_hidden_and_backup() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::create_dir_all(root.join(".git/objects")).unwrap();
        fs::write(root.join("a/b/c.txt"), b"c").unwrap();
        fs::write(root.join("a/x.txt~"), b"old").unwrap();
        fs::write(root.join(".git/objects/pack"), b"p").unwrap();
        fs::write(root.join(".env"), b"A=1").unwrap();

        let listing = walk_tree(root, &PathClassifier::new(root));

        let mut dirs = listing.dirs.clone();
        dirs.sort();
        assert_eq!(dirs, vec![root.to_path_buf(), root.join("a"), root.join("a/b")]);

        let mut files = listing.files.clone();
        files.sort();
        assert_eq!(files, vec![root.join(".env"), root.join("a/b/c.txt")]);
    }

    #[test]
    fn walk_of_subtree_lists_only_that_subtree() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("fresh/deeper")).unwrap();
        fs::write(root.join("fresh/deeper/f.bin"), b"f").unwrap();
        fs::write(root.join("other.txt"), b"o").unwrap();

        let listing = walk_tree(&root.join("fresh"), &PathClassifier::new(root));
        assert_eq!(listing.dirs.len(), 2);
        assert_eq!(listing.files, vec![root.join("fresh/deeper/f.bin")]);
    }

    #[test]
    fn diff_names_skip_missing_and_ignored() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("src/lib.rs"), b"").unwrap();
        fs::write(root.join("src/lib.rs~"), b"").unwrap();

        let out = "src/lib.rs\nsrc/lib.rs~\nsrc/deleted.rs\n\n";
        let files = parse_diff_names(root, out, &PathClassifier::new(root));
        assert_eq!(files, vec![root.join("src/lib.rs")]);
    }
}
