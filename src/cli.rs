//! Command-line definitions for tarlift and tarliftd

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// Command-line arguments
#[derive(Clone, Debug, Parser)]
#[command(
    name = "tarlift",
    author,
    version,
    about = "Stream directory trees to and from object storage as tar archives"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Store URL overriding the config (file:///dir, tarlift://host:port, s3://[endpoint], memory://)
    #[arg(long, global = true)]
    pub store: Option<String>,

    /// Glob pattern to leave out of uploads (repeatable)
    #[arg(long = "exclude", global = true)]
    pub exclude: Vec<String>,

    /// Directory prepended to every archive member on upload
    #[arg(long, global = true)]
    pub prefix: Option<PathBuf>,

    /// Plain tar instead of tar.gz
    #[arg(long = "no-gzip", global = true)]
    pub no_gzip: bool,

    /// Pipe capacity in bytes between the archive and transport stages
    #[arg(long, global = true)]
    pub capacity: Option<usize>,

    /// Seconds between throughput lines
    #[arg(long = "refresh-secs", global = true)]
    pub refresh_secs: Option<u64>,

    /// Append JSONL ledger entries to file
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Archive DIR and stream it to BUCKET/KEY
    Upload {
        dir: PathBuf,
        /// Remote object as BUCKET/KEY
        object: String,
    },
    /// Stream BUCKET/KEY and extract it into DIR
    Download {
        /// Remote object as BUCKET/KEY
        object: String,
        dir: PathBuf,
    },
    /// Print the files an upload of DIR would archive
    List { dir: PathBuf },
}

/// Options for the tarliftd object daemon
#[derive(Clone, Debug, Parser)]
#[command(name = "tarliftd", version, about = "tarlift object daemon")]
pub struct DaemonOpts {
    /// Bind address (host:port)
    #[arg(long, default_value = "0.0.0.0:9041")]
    pub bind: String,

    /// Root directory for stored objects
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

/// Default log filter for a `-v` count, used when RUST_LOG is unset.
pub fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Install the stderr tracing subscriber for a binary.
pub fn init_tracing(verbose: u8) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level(verbose).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_with_flags() {
        let args = Args::try_parse_from([
            "tarlift",
            "upload",
            "/data/run42",
            "seq/run42.tar.gz",
            "--exclude",
            "*.fastq.*",
            "--prefix",
            "run42",
            "--no-gzip",
            "-vv",
        ])
        .unwrap();
        match args.command {
            Command::Upload { dir, object } => {
                assert_eq!(dir, PathBuf::from("/data/run42"));
                assert_eq!(object, "seq/run42.tar.gz");
            }
            other => panic!("unexpected command: {:?}", other),
        }
        assert_eq!(args.exclude, vec!["*.fastq.*".to_string()]);
        assert!(args.no_gzip);
        assert_eq!(log_level(args.verbose), "trace");
    }

    #[test]
    fn download_requires_both_positionals() {
        assert!(Args::try_parse_from(["tarlift", "download", "b/k"]).is_err());
        assert!(Args::try_parse_from(["tarlift", "download", "b/k", "out"]).is_ok());
    }

    #[test]
    fn daemon_defaults() {
        let opts = DaemonOpts::try_parse_from(["tarliftd"]).unwrap();
        assert_eq!(opts.bind, "0.0.0.0:9041");
        assert_eq!(opts.root, PathBuf::from("."));
    }
}
