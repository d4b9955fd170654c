//! pushsyncd: receive uploads from pushsync clients

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pushsync::cli::DaemonOpts;
use pushsync::logger::init_tracing;
use pushsync::sandbox::Sandbox;
use pushsync::server::{self, ReceiverConfig};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    init_tracing(opts.verbose);

    let sandbox = Sandbox::for_current_user(&opts.limit_dir)?;
    let token = opts.token.clone().filter(|t| !t.is_empty());
    if token.is_none() {
        warn!("no --token set: any client can write inside the sandbox");
    }
    let addr = opts.listen_addr();
    if opts.bind == "0.0.0.0" || opts.bind == "::" {
        warn!(%addr, "listening on all interfaces");
    }
    let config = ReceiverConfig {
        sandbox,
        token,
        max_upload_bytes: opts.max_upload_bytes(),
    };

    let shutdown = CancellationToken::new();
    let on_interrupt = shutdown.clone();
    let interrupted = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if interrupted.swap(true, Ordering::SeqCst) {
            eprintln!("\nInterrupted again. Exiting (Ctrl-C)...");
            std::process::exit(130);
        }
        eprintln!("\nInterrupted. Finishing in-flight uploads (Ctrl-C again to quit)...");
        on_interrupt.cancel();
    })
    .context("Error setting Ctrl-C handler")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))?;
        server::serve(listener, config, shutdown).await?;
        info!("receiver stopped");
        Ok(())
    })
}
