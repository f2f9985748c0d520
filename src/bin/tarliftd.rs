use anyhow::{Context, Result};
use clap::Parser;

use tarlift::cli::{init_tracing, DaemonOpts};
use tarlift::server;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    init_tracing(opts.verbose);

    // Validate root directory exists and is a directory
    if !opts.root.exists() {
        anyhow::bail!("Error: Root directory does not exist: {}", opts.root.display());
    }
    if !opts.root.is_dir() {
        anyhow::bail!("Error: Root path is not a directory: {}", opts.root.display());
    }

    // Canonicalize the path for better logging
    let canonical_root = std::fs::canonicalize(&opts.root)
        .with_context(|| format!("Failed to canonicalize root path: {}", opts.root.display()))?;

    tracing::info!("Starting tarliftd v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("  Root: {}", canonical_root.display());
    tracing::info!("  Bind: {}", opts.bind);

    // Security warning for 0.0.0.0 binding
    if opts.bind.starts_with("0.0.0.0") {
        tracing::warn!("Binding to 0.0.0.0 exposes the daemon to all network interfaces");
        tracing::warn!("The protocol is unencrypted and unauthenticated; only use on trusted networks");
    }

    server::serve(&opts.bind, &canonical_root).context("Daemon stopped")
}
