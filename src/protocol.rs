//! Shared protocol constants for the pushsync upload endpoint

use std::time::Duration;

// The daemon serves exactly one route
pub const RECEIVER_PATH: &str = "/receiver";

// Default daemon port (client `host:port` shorthand falls back to it too)
pub const DEFAULT_PORT: u16 = 8120;

// Multipart field names (keep stable for compat with older clients)
pub mod field {
    pub const FILE: &str = "file";
    pub const TARGET: &str = "target";
    pub const TOKEN: &str = "token";
}

// Client-side defaults
pub mod defaults {
    use super::Duration;

    /// Worker count and job queue capacity; one knob for both.
    pub const CONCURRENCY: usize = 30;

    /// Pause between size/mtime snapshots of a just-changed file.
    pub const SETTLE_DELAY: Duration = Duration::from_millis(2000);

    /// Snapshots taken before a still-changing file is enqueued anyway.
    pub const SETTLE_POLLS: u32 = 3;

    /// Per-request HTTP timeout.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
}

/// Confirmation body returned by the daemon for a stored upload
pub fn upload_confirmation(path: &std::path::Path) -> String {
    format!("File uploaded successfully: {}\n", path.display())
}
