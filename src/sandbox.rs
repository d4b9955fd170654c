//! Server-side write boundary.
//!
//! The sandbox root is the daemon user's home directory joined with the
//! configured limit suffix. Targets are compared to it component-wise after
//! resolving `.`/`..` and symlinks, so `~/work-evil` is not inside `~/work`
//! and `~/work/../.ssh` is not either.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Invalid target path, valid path: {root}")]
    Outside { root: String },
    #[error("failed to resolve {path}: {source}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `home` + `limit`. Leading separators of `limit` are ignored, an empty
    /// limit means the whole home directory.
    pub fn from_home(home: &Path, limit: &str) -> Self {
        let suffix = limit.trim_start_matches(['/', '\\']);
        if suffix.is_empty() {
            Self::new(home)
        } else {
            Self::new(home.join(suffix))
        }
    }

    /// Sandbox rooted in the current user's home directory
    pub fn for_current_user(limit: &str) -> anyhow::Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
        Ok(Self::from_home(&home, limit))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a client-supplied target to the path that will be written.
    ///
    /// The target must be absolute and, once resolved, lie strictly below
    /// the sandbox root.
    pub fn resolve(&self, target: &str) -> Result<PathBuf, SandboxError> {
        let outside = || SandboxError::Outside {
            root: self.root.display().to_string(),
        };
        if target.contains('\0') {
            return Err(outside());
        }
        let target = Path::new(target);
        if !target.is_absolute() {
            return Err(outside());
        }

        let canon_root = resolve_existing_prefix(&normalize_lexically(&self.root))?;
        let resolved = resolve_existing_prefix(&normalize_lexically(target))?;

        if resolved == canon_root || !resolved.starts_with(&canon_root) {
            return Err(outside());
        }
        Ok(resolved)
    }
}

/// Drop `.` and apply `..` without touching the filesystem
fn normalize_lexically(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                // never climbs past the root component
                if out.parent().is_some() {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Symlink hops followed before giving up, as the kernel does with ELOOP
const MAX_LINK_HOPS: u32 = 40;

/// Canonicalize the deepest existing ancestor and re-attach the rest, so
/// symlinks anywhere along the existing part are resolved. A dangling
/// symlink counts as existing: its target is followed, since creating the
/// file would write there.
fn resolve_existing_prefix(p: &Path) -> Result<PathBuf, SandboxError> {
    let mut existing = p.to_path_buf();
    let mut rest: Vec<std::ffi::OsString> = Vec::new();
    let mut hops = 0u32;
    loop {
        match existing.canonicalize() {
            Ok(canon) => {
                let mut out = canon;
                for name in rest.iter().rev() {
                    out.push(name);
                }
                return Ok(out);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if is_symlink(&existing) {
                    hops += 1;
                    existing = follow_dangling(&existing, hops)?;
                    continue;
                }
                let Some(name) = existing.file_name().map(|n| n.to_os_string()) else {
                    return Ok(p.to_path_buf());
                };
                rest.push(name);
                if !existing.pop() {
                    return Ok(p.to_path_buf());
                }
            }
            Err(source) => {
                return Err(SandboxError::Resolve {
                    path: existing,
                    source,
                })
            }
        }
    }
}

fn is_symlink(p: &Path) -> bool {
    fs::symlink_metadata(p)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

/// Where a dangling link at `link` points, as an absolute normalized path
fn follow_dangling(link: &Path, hops: u32) -> Result<PathBuf, SandboxError> {
    let fail = |source: io::Error| SandboxError::Resolve {
        path: link.to_path_buf(),
        source,
    };
    if hops > MAX_LINK_HOPS {
        return Err(fail(io::Error::other("too many levels of symbolic links")));
    }
    let target = fs::read_link(link).map_err(fail)?;
    // The link exists, so its parent directory does too
    let base = match link.parent() {
        Some(parent) => parent.canonicalize().map_err(fail)?,
        None => PathBuf::from("/"),
    };
    Ok(normalize_lexically(&base.join(target)))
}
