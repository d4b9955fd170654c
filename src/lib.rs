//! pushsync: mirror a local directory tree to a receiver daemon over HTTP.
//!
//! The client registers non-recursive watches for every non-hidden directory
//! below the watch root, settles changed files and hands them to a bounded
//! worker pool that uploads each one as a multipart POST. The daemon checks
//! the token, confines the target to its sandbox and writes the file.

pub mod classify;
pub mod cli;
pub mod client;
pub mod fs_enum;
pub mod logger;
pub mod pipeline;
pub mod pool;
pub mod protocol;
pub mod sandbox;
pub mod server;
pub mod session;
pub mod url;
pub mod watch;
