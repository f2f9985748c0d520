//! tarlift - stream directory trees to and from object storage
//!
//! upload:   DIR -> tar(.gz) -> pipe -> BUCKET/KEY
//! download: BUCKET/KEY -> pipe -> untar -> DIR

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;

use tarlift::archive::{manifest, Compression};
use tarlift::cli::{init_tracing, Args, Command};
use tarlift::ledger::{TransferLog, TransferLogEntry};
use tarlift::store::{self, ObjectRef};
use tarlift::{Config, Coordinator, Direction, StoreConfig, TransferOptions};

fn main() -> Result<()> {
    // Set up Ctrl-C handler
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user. Exiting (Ctrl-C)...");
        // Exit immediately with 130 (128 + SIGINT)
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    let args = Args::parse();
    init_tracing(args.verbose);

    let config = effective_config(&args)?;
    let options = config
        .transfer_options()
        .context("Invalid transfer options")?;

    match &args.command {
        Command::List { dir } => list(dir, &options),
        Command::Upload { dir, object } => {
            run_transfer(&args, &config, &options, Direction::Upload, dir, object)
        }
        Command::Download { object, dir } => {
            run_transfer(&args, &config, &options, Direction::Download, dir, object)
        }
    }
}

/// Config file (if any) with command-line overrides applied on top.
fn effective_config(args: &Args) -> Result<Config> {
    let mut config = Config::load_or_default(args.config.as_deref())
        .with_context(|| match &args.config {
            Some(p) => format!("Failed to load config {}", p.display()),
            None => "Failed to build default config".to_string(),
        })?;

    if let Some(url) = &args.store {
        config.store = StoreConfig::from_url(url)?;
    }
    if !args.exclude.is_empty() {
        config.transfer.exclude.extend(args.exclude.iter().cloned());
    }
    if let Some(prefix) = &args.prefix {
        config.transfer.prefix = Some(prefix.clone());
    }
    if args.no_gzip {
        config.transfer.compression = Compression::None;
    }
    if let Some(capacity) = args.capacity {
        config.transfer.pipe_capacity = capacity;
    }
    if let Some(secs) = args.refresh_secs {
        config.transfer.refresh_interval_secs = secs;
    }

    config.validate()?;
    Ok(config)
}

fn list(dir: &Path, options: &TransferOptions) -> Result<()> {
    let entries = manifest(dir, options.archive_prefix.as_deref(), options.filter.as_ref())
        .with_context(|| format!("Failed to walk {}", dir.display()))?;
    let mut total = 0u64;
    for entry in &entries {
        println!("{:>12}  {}", entry.size, entry.archive_path.display());
        total += entry.size;
    }
    println!("{} files, {} bytes", entries.len(), total);
    Ok(())
}

fn run_transfer(
    args: &Args,
    config: &Config,
    options: &TransferOptions,
    direction: Direction,
    local_path: &Path,
    object: &str,
) -> Result<()> {
    let object: ObjectRef = object
        .parse()
        .with_context(|| format!("Invalid object reference '{}'", object))?;
    let store = store::from_config(&config.store).context("Failed to open object store")?;
    let coordinator = Coordinator::new(store);

    let ledger = args.log_file.as_ref().map(TransferLog::new);
    let started = TransferLogEntry::started(direction, local_path, &object);
    if let Some(log) = &ledger {
        log.add_entry(&started)
            .with_context(|| format!("Failed to write ledger {}", log.path().display()))?;
    }

    // Simple activity indicator
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "),
    );
    spinner.set_message(format!("{} {}", direction, object));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let result = coordinator.transfer(direction, local_path, &object, options);
    spinner.finish_and_clear();

    match result {
        Ok(summary) => {
            if let Some(log) = &ledger {
                log.add_entry(&started.completed(&summary))?;
            }
            println!(
                "{} complete: {} files ({} bytes) as {} archive bytes in {:.2?}",
                direction,
                summary.entries,
                summary.content_bytes,
                summary.total_bytes,
                summary.elapsed
            );
            Ok(())
        }
        Err(e) => {
            if let Some(log) = &ledger {
                if let Err(log_err) = log.add_entry(&started.failed(&e)) {
                    tracing::warn!("failed to record failure in ledger: {}", log_err);
                }
            }
            Err(e).with_context(|| format!("{} of {} failed", direction, object))
        }
    }
}
