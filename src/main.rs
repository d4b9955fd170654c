//! pushsync client: watch a directory and push changed files to pushsyncd

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pushsync::cli::ClientOpts;
use pushsync::logger::init_tracing;
use pushsync::session;

fn main() -> Result<()> {
    let opts = ClientOpts::parse();
    init_tracing(opts.verbose);
    let config = opts.into_config()?;

    let cancel = CancellationToken::new();
    install_interrupt(cancel.clone())?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    info!(
        dir = %config.watch_root.display(),
        target = %config.target_root,
        workers = config.concurrency.get(),
        "starting pushsync"
    );
    let summary = rt.block_on(session::run(config, cancel))?;
    if summary.failed > 0 {
        warn!(failed = summary.failed, "some uploads failed");
    }
    Ok(())
}

/// First Ctrl-C drains queued uploads and stops; a second one exits at once.
fn install_interrupt(cancel: CancellationToken) -> Result<()> {
    let interrupted = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if interrupted.swap(true, Ordering::SeqCst) {
            eprintln!("\nInterrupted again. Exiting (Ctrl-C)...");
            // 128 + SIGINT
            std::process::exit(130);
        }
        eprintln!("\nInterrupted. Finishing queued uploads (Ctrl-C again to quit)...");
        cancel.cancel();
    })
    .context("Error setting Ctrl-C handler")
}
