use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber. `RUST_LOG` wins over `-v`.
pub fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "info,tower_http=warn",
        1 => "debug,tower_http=info",
        _ => "trace",
    };
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Upload journal, one call per finished job
pub trait Logger: Send + Sync {
    fn uploaded(&self, _src: &Path, _target: &str, _bytes: u64) {}
    fn failed(&self, _src: &Path, _target: &str, _msg: &str) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Uploaded,
    Failed,
}

#[derive(Serialize, Debug)]
struct JournalEntry<'a> {
    timestamp: String,
    session: &'a str,
    source: &'a Path,
    target: &'a str,
    status: UploadStatus,
    bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// Appends one JSON object per line to a journal file
pub struct JsonlLogger {
    file: Mutex<File>,
    session: String,
}

impl JsonlLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open upload journal {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(f),
            session: uuid::Uuid::new_v4().to_string(),
        })
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    fn line(&self, entry: &JournalEntry<'_>) {
        let Ok(json) = serde_json::to_string(entry) else {
            return;
        };
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "{json}");
        }
    }
}

impl Logger for JsonlLogger {
    fn uploaded(&self, src: &Path, target: &str, bytes: u64) {
        self.line(&JournalEntry {
            timestamp: Utc::now().to_rfc3339(),
            session: &self.session,
            source: src,
            target,
            status: UploadStatus::Uploaded,
            bytes,
            error: None,
        });
    }

    fn failed(&self, src: &Path, target: &str, msg: &str) {
        self.line(&JournalEntry {
            timestamp: Utc::now().to_rfc3339(),
            session: &self.session,
            source: src,
            target,
            status: UploadStatus::Failed,
            bytes: 0,
            error: Some(msg),
        });
    }
}
