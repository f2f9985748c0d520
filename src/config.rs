//! TOML configuration.

use crate::archive::Compression;
use crate::error::{TransferError, TransferResult};
use crate::filter::GlobExclude;
use crate::pipe::DEFAULT_CAPACITY;
use crate::transfer::TransferOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Default port of the object daemon.
pub const DEFAULT_DAEMON_PORT: u16 = 9041;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub transfer: TransferConfig,
}

/// Object store backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Directory tree under `path`.
    Filesystem { path: PathBuf },
    /// A `tarliftd` at `host:port`.
    Daemon { addr: String },
    /// In-process only; lost on exit.
    Memory,
    S3(S3Config),
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./tarlift-store"),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct S3Config {
    /// Endpoint for S3-compatible services; `http://` is assumed without a scheme.
    pub endpoint: Option<String>,
    pub region: Option<String>,
    /// Falls back to the ambient AWS credential chain when unset.
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Path-style addressing, needed by MinIO and friends.
    pub force_path_style: bool,
}

impl StoreConfig {
    /// Parse a store URL: `file:///dir`, `tarlift://host[:port]`,
    /// `s3://` or `s3://endpoint`, `memory://`.
    pub fn from_url(url: &str) -> TransferResult<Self> {
        let trimmed = url.trim();
        let (scheme, rest) = trimmed
            .split_once("://")
            .ok_or_else(|| TransferError::Config(format!("store URL has no scheme: {}", url)))?;

        match scheme.to_ascii_lowercase().as_str() {
            "file" => {
                if rest.is_empty() {
                    return Err(TransferError::Config("file:// URL needs a path".into()));
                }
                Ok(StoreConfig::Filesystem {
                    path: PathBuf::from(rest),
                })
            }
            "tarlift" => {
                let host_port = rest.trim_end_matches('/');
                if host_port.is_empty() {
                    return Err(TransferError::Config("tarlift:// URL needs a host".into()));
                }
                let addr = match host_port.rsplit_once(':') {
                    Some((_, port)) if port.parse::<u16>().is_ok() => host_port.to_string(),
                    Some(_) => {
                        return Err(TransferError::Config(format!(
                            "invalid port in store URL: {}",
                            url
                        )))
                    }
                    None => format!("{}:{}", host_port, DEFAULT_DAEMON_PORT),
                };
                Ok(StoreConfig::Daemon { addr })
            }
            "s3" => {
                let endpoint = rest.trim_end_matches('/');
                Ok(StoreConfig::S3(S3Config {
                    force_path_style: !endpoint.is_empty(),
                    endpoint: (!endpoint.is_empty()).then(|| endpoint.to_string()),
                    ..S3Config::default()
                }))
            }
            "memory" => Ok(StoreConfig::Memory),
            other => Err(TransferError::Config(format!(
                "unsupported store scheme '{}'",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    pub pipe_capacity: usize,
    pub refresh_interval_secs: u64,
    pub compression: Compression,
    /// Glob patterns left out of uploads.
    pub exclude: Vec<String>,
    /// Directory prepended to archive members on upload.
    pub prefix: Option<PathBuf>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            pipe_capacity: DEFAULT_CAPACITY,
            refresh_interval_secs: 30,
            compression: Compression::Gzip,
            exclude: Vec::new(),
            prefix: None,
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> TransferResult<Self> {
        toml::from_str(text).map_err(|e| TransferError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> TransferResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| TransferError::filesystem(path, e))?;
        let config = Self::from_toml(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, otherwise use defaults.
    pub fn load_or_default(path: Option<&Path>) -> TransferResult<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> TransferResult<()> {
        if self.transfer.pipe_capacity == 0 {
            return Err(TransferError::Config(
                "transfer.pipe_capacity must be at least 1".into(),
            ));
        }
        if self.transfer.refresh_interval_secs == 0 {
            return Err(TransferError::Config(
                "transfer.refresh_interval_secs must be at least 1".into(),
            ));
        }
        GlobExclude::new(&self.transfer.exclude)?;
        if let StoreConfig::S3(s3) = &self.store {
            if s3.access_key_id.is_some() != s3.secret_access_key.is_some() {
                return Err(TransferError::Config(
                    "s3 access_key_id and secret_access_key must be set together".into(),
                ));
            }
        }
        Ok(())
    }

    /// Transfer options described by the `[transfer]` table.
    pub fn transfer_options(&self) -> TransferResult<TransferOptions> {
        let t = &self.transfer;
        let mut options = TransferOptions {
            archive_prefix: t.prefix.clone(),
            compression: t.compression,
            pipe_capacity: t.pipe_capacity,
            refresh_interval: Duration::from_secs(t.refresh_interval_secs),
            ..TransferOptions::default()
        };
        if !t.exclude.is_empty() {
            options.filter = Arc::new(GlobExclude::new(&t.exclude)?);
        }
        Ok(options)
    }
}
