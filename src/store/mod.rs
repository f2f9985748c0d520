//! Remote object stores.
//!
//! The transport stage talks to whatever implements [`ObjectStore`]: a
//! whole-object streaming upload from a reader and a whole-object streaming
//! download into a writer, both reporting progress per chunk.

mod daemon;
mod filesystem;
mod memory;
#[cfg(feature = "s3")]
mod s3;

pub use daemon::DaemonStore;
pub use filesystem::FilesystemStore;
pub use memory::MemoryStore;
#[cfg(feature = "s3")]
pub use s3::S3Store;

use crate::config::StoreConfig;
use std::fmt;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Chunk size used when copying between a store and a pipe end.
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Object store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("cannot connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[cfg(feature = "s3")]
    #[error("S3 error: {0}")]
    S3(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Identity of one remote object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
}

impl ObjectRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> StoreResult<Self> {
        let object = Self {
            bucket: bucket.into(),
            key: key.into(),
        };
        validate_bucket(&object.bucket)?;
        validate_key(&object.key)?;
        Ok(object)
    }

    /// Relative path of the object under a store root: `bucket/key`.
    pub fn relative_path(&self) -> StoreResult<PathBuf> {
        validate_bucket(&self.bucket)?;
        Ok(Path::new(&self.bucket).join(validate_key(&self.key)?))
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

impl FromStr for ObjectRef {
    type Err = StoreError;

    /// Parse `bucket/key/with/slashes`; an `s3://` scheme is accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let rest = trimmed.strip_prefix("s3://").unwrap_or(trimmed);
        match rest.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                ObjectRef::new(bucket, key)
            }
            _ => Err(StoreError::InvalidKey(format!(
                "expected BUCKET/KEY, got '{}'",
                s
            ))),
        }
    }
}

/// Whole-object streaming store.
///
/// Both directions call `progress` once per chunk with the chunk length.
pub trait ObjectStore: Send + Sync + 'static {
    /// Stream `source` to end-of-stream into `object`, returning the byte
    /// count stored.
    fn upload(
        &self,
        object: &ObjectRef,
        source: &mut dyn Read,
        progress: &mut dyn FnMut(u64),
    ) -> StoreResult<u64>;

    /// Stream the whole of `object` into `sink`, returning the byte count
    /// delivered.
    fn download(
        &self,
        object: &ObjectRef,
        sink: &mut dyn Write,
        progress: &mut dyn FnMut(u64),
    ) -> StoreResult<u64>;

    fn backend_name(&self) -> &'static str;
}

/// Build the store described by `config`.
pub fn from_config(config: &StoreConfig) -> StoreResult<Arc<dyn ObjectStore>> {
    match config {
        StoreConfig::Filesystem { path } => Ok(Arc::new(FilesystemStore::new(path)?)),
        StoreConfig::Daemon { addr } => Ok(Arc::new(DaemonStore::new(addr.clone()))),
        StoreConfig::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "s3")]
        StoreConfig::S3(s3) => Ok(Arc::new(S3Store::new(s3)?)),
        #[cfg(not(feature = "s3"))]
        StoreConfig::S3(_) => Err(StoreError::Config(
            "S3 support not compiled in (enable the `s3` feature)".to_string(),
        )),
    }
}

/// Copy `source` into `sink` in [`STREAM_CHUNK_SIZE`] pieces, reporting each.
pub fn copy_with_progress(
    source: &mut dyn Read,
    sink: &mut dyn Write,
    progress: &mut dyn FnMut(u64),
) -> io::Result<u64> {
    let mut buf = vec![0u8; STREAM_CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        sink.write_all(&buf[..n])?;
        total += n as u64;
        progress(n as u64);
    }
    sink.flush()?;
    Ok(total)
}

fn validate_bucket(bucket: &str) -> StoreResult<()> {
    let mut components = Path::new(bucket).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !bucket.contains('\0') => Ok(()),
        _ => Err(StoreError::InvalidKey(format!("invalid bucket name '{}'", bucket))),
    }
}

/// Check that a key stays inside its bucket, returning it as a relative path.
///
/// `.` components and repeated separators are dropped; `..`, absolute keys
/// and NUL bytes are rejected.
pub fn validate_key(key: &str) -> StoreResult<PathBuf> {
    if key.contains('\0') {
        return Err(StoreError::InvalidKey("key contains NUL byte".to_string()));
    }

    let mut safe = PathBuf::new();
    for component in Path::new(key).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => {
                #[cfg(windows)]
                if part.to_string_lossy().contains(':') {
                    return Err(StoreError::InvalidKey(format!(
                        "key component contains colon: {}",
                        key
                    )));
                }
                safe.push(part);
            }
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StoreError::InvalidKey(format!(
                    "unsafe path component in key: {}",
                    key
                )));
            }
        }
    }

    if safe.as_os_str().is_empty() {
        return Err(StoreError::InvalidKey(format!("empty key: '{}'", key)));
    }
    Ok(safe)
}
