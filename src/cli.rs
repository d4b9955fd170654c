//! Command-line options for the client and the receiver daemon

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use crate::pipeline::Settle;
use crate::protocol::{defaults, DEFAULT_PORT};
use crate::session::SyncConfig;
use crate::url::parse_endpoint;

/// Initial file selection before live watching starts
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum InitMode {
    /// Upload every file under the watch root
    All,
    /// Upload files that differ from `origin` (git diff)
    Git,
}

/// Watch a local directory and push changed files to a receiver
#[derive(Clone, Debug, Parser)]
#[command(author, version, about)]
pub struct ClientOpts {
    /// Initial sync selection
    #[arg(long, value_enum, default_value_t = InitMode::All)]
    pub mode: InitMode,

    /// Absolute path of the directory to watch
    #[arg(long)]
    pub dir: PathBuf,

    /// Receiver endpoint (http://host:port/receiver or host:port)
    #[arg(long)]
    pub url: String,

    /// Absolute destination root on the receiver
    #[arg(long)]
    pub target: String,

    /// Shared secret sent with every upload
    #[arg(long, env = "PUSHSYNC_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Concurrent uploads (also the job queue capacity)
    #[arg(long, default_value_t = defaults::CONCURRENCY)]
    pub workers: usize,

    /// Delay between settle polls, in milliseconds
    #[arg(long = "settle-ms", default_value_t = defaults::SETTLE_DELAY.as_millis() as u64)]
    pub settle_ms: u64,

    /// Settle polls before a still-changing file is uploaded anyway
    #[arg(
        long = "settle-polls",
        default_value_t = defaults::SETTLE_POLLS,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub settle_polls: u32,

    /// Per-request timeout, in seconds
    #[arg(long = "timeout-secs", default_value_t = defaults::REQUEST_TIMEOUT.as_secs())]
    pub timeout_secs: u64,

    /// Append a JSONL record for every finished upload
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// More logging (-v, -vv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl ClientOpts {
    /// Validate flags and build the session settings.
    pub fn into_config(self) -> Result<SyncConfig> {
        if !self.dir.is_absolute() {
            bail!("--dir must be an absolute path: {}", self.dir.display());
        }
        if !self.dir.is_dir() {
            bail!("--dir is not a directory: {}", self.dir.display());
        }
        if !self.target.starts_with('/') {
            bail!("--target must be an absolute path: {}", self.target);
        }
        let Some(concurrency) = NonZeroUsize::new(self.workers) else {
            bail!("--workers must be at least 1");
        };
        let endpoint = parse_endpoint(&self.url).context("invalid --url")?;

        Ok(SyncConfig {
            watch_root: self.dir,
            endpoint,
            target_root: self.target,
            mode: self.mode,
            concurrency,
            settle: Settle {
                delay: Duration::from_millis(self.settle_ms),
                polls: self.settle_polls,
            },
            token: self.token.filter(|t| !t.is_empty()),
            timeout: Duration::from_secs(self.timeout_secs),
            log_file: self.log_file,
        })
    }
}

/// Receive uploads and write them below the home directory
#[derive(Clone, Debug, Parser)]
#[command(author, version, about)]
pub struct DaemonOpts {
    /// Listen port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Listen address
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    /// Shared secret required from clients (unset = no check)
    #[arg(long, env = "PUSHSYNC_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Writes are confined to $HOME/<limit-dir>
    #[arg(long = "limit-dir", default_value = "")]
    pub limit_dir: String,

    /// Reject request bodies larger than this many MiB
    #[arg(long = "max-upload-mb")]
    pub max_upload_mb: Option<usize>,

    /// More logging (-v, -vv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl DaemonOpts {
    pub fn listen_addr(&self) -> String {
        if self.bind.contains(':') && !self.bind.starts_with('[') {
            format!("[{}]:{}", self.bind, self.port)
        } else {
            format!("{}:{}", self.bind, self.port)
        }
    }

    pub fn max_upload_bytes(&self) -> Option<usize> {
        self.max_upload_mb.map(|mb| mb.saturating_mul(1024 * 1024))
    }
}
