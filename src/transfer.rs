//! Transfer coordinator.
//!
//! A transfer is two threads joined by one pipe. For an upload the archive
//! stage produces and the transport stage consumes; a download is the mirror
//! image. The coordinator wires the ends, waits for both threads and reports
//! a single outcome.

use crate::archive::{archive_to_pipe, extract_from_pipe, ArchiveSummary, Compression, PackRequest};
use crate::error::{TransferError, TransferResult};
use crate::filter::{AcceptAll, EntryFilter};
use crate::pipe::{self, DEFAULT_CAPACITY};
use crate::store::{ObjectRef, ObjectStore};
use crate::throughput::{ThroughputMeter, TransferMetrics, DEFAULT_REFRESH_INTERVAL};
use crate::transport::{download_to_pipe, upload_from_pipe};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
        }
    }
}

/// Knobs for one transfer.
#[derive(Clone)]
pub struct TransferOptions {
    /// Directory name prepended to every archive member on upload.
    pub archive_prefix: Option<PathBuf>,
    /// Which walked files go into the archive on upload.
    pub filter: Arc<dyn EntryFilter>,
    pub compression: Compression,
    /// Bytes the pipe may hold before the producer blocks.
    pub pipe_capacity: usize,
    pub refresh_interval: Duration,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            archive_prefix: None,
            filter: Arc::new(AcceptAll),
            compression: Compression::Gzip,
            pipe_capacity: DEFAULT_CAPACITY,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

impl TransferOptions {
    pub fn with_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.archive_prefix = Some(prefix.into());
        self
    }

    pub fn with_filter(mut self, filter: impl EntryFilter + 'static) -> Self {
        self.filter = Arc::new(filter);
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.pipe_capacity = capacity;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }
}

impl fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOptions")
            .field("archive_prefix", &self.archive_prefix)
            .field("compression", &self.compression)
            .field("pipe_capacity", &self.pipe_capacity)
            .field("refresh_interval", &self.refresh_interval)
            .finish_non_exhaustive()
    }
}

/// Outcome of a successful transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSummary {
    pub direction: Direction,
    pub object: ObjectRef,
    /// Archive bytes that crossed the transport stage.
    pub total_bytes: u64,
    /// Files written into (upload) or out of (download) the archive.
    pub entries: u64,
    /// Their uncompressed content size.
    pub content_bytes: u64,
    /// Throughput lines emitted.
    pub measurements: u64,
    pub elapsed: Duration,
}

/// Runs transfers against one object store.
#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn ObjectStore>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Move `local_path` to `object` (upload) or `object` to `local_path`
    /// (download), returning once both stages have finished.
    pub fn transfer(
        &self,
        direction: Direction,
        local_path: &Path,
        object: &ObjectRef,
        options: &TransferOptions,
    ) -> TransferResult<TransferSummary> {
        info!(
            "Starting {} {} {} via {} backend",
            direction,
            local_path.display(),
            object,
            self.store.backend_name()
        );
        let started = Instant::now();

        let (archive, metrics) = match direction {
            Direction::Upload => self.run_upload(local_path, object, options)?,
            Direction::Download => self.run_download(local_path, object, options)?,
        };

        let summary = TransferSummary {
            direction,
            object: object.clone(),
            total_bytes: metrics.total_bytes,
            entries: archive.entries,
            content_bytes: archive.content_bytes,
            measurements: metrics.measurements,
            elapsed: started.elapsed(),
        };
        info!(
            "Finished {} of {}: {} bytes, {} files in {:.2?}",
            direction, object, summary.total_bytes, summary.entries, summary.elapsed
        );
        Ok(summary)
    }

    pub fn upload(
        &self,
        local_path: &Path,
        object: &ObjectRef,
        options: &TransferOptions,
    ) -> TransferResult<TransferSummary> {
        self.transfer(Direction::Upload, local_path, object, options)
    }

    pub fn download(
        &self,
        object: &ObjectRef,
        local_path: &Path,
        options: &TransferOptions,
    ) -> TransferResult<TransferSummary> {
        self.transfer(Direction::Download, local_path, object, options)
    }

    fn run_upload(
        &self,
        root: &Path,
        object: &ObjectRef,
        options: &TransferOptions,
    ) -> TransferResult<(ArchiveSummary, TransferMetrics)> {
        let meta = fs::metadata(root).map_err(|e| TransferError::filesystem(root, e))?;
        if !meta.is_dir() {
            return Err(TransferError::filesystem(
                root,
                io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
            ));
        }

        let (reader, writer) = pipe::pipe(options.pipe_capacity);

        let root = root.to_path_buf();
        let prefix = options.archive_prefix.clone();
        let filter = Arc::clone(&options.filter);
        let compression = options.compression;
        let archive = spawn_stage("archive", move || {
            let request = PackRequest {
                root: &root,
                prefix: prefix.as_deref(),
                filter: filter.as_ref(),
                compression,
            };
            archive_to_pipe(&request, writer)
        })?;

        let store = Arc::clone(&self.store);
        let target = object.clone();
        let meter = ThroughputMeter::new(options.refresh_interval);
        let transport = match spawn_stage("transport", move || {
            upload_from_pipe(store.as_ref(), &target, reader, meter)
        }) {
            Ok(handle) => handle,
            Err(e) => {
                let _ = join_stage("archive", archive);
                return Err(e);
            }
        };

        let archived = join_stage("archive", archive);
        let transported = join_stage("transport", transport);
        settle(archived, transported)
    }

    fn run_download(
        &self,
        dest: &Path,
        object: &ObjectRef,
        options: &TransferOptions,
    ) -> TransferResult<(ArchiveSummary, TransferMetrics)> {
        fs::create_dir_all(dest).map_err(|e| TransferError::filesystem(dest, e))?;

        let (reader, writer) = pipe::pipe(options.pipe_capacity);

        let store = Arc::clone(&self.store);
        let source = object.clone();
        let meter = ThroughputMeter::new(options.refresh_interval);
        let transport = spawn_stage("transport", move || {
            download_to_pipe(store.as_ref(), &source, writer, meter)
        })?;

        let dest = dest.to_path_buf();
        let compression = options.compression;
        let archive = match spawn_stage("archive", move || {
            extract_from_pipe(reader, &dest, compression)
        }) {
            Ok(handle) => handle,
            Err(e) => {
                let _ = join_stage("transport", transport);
                return Err(e);
            }
        };

        let transported = join_stage("transport", transport);
        let extracted = join_stage("archive", archive);
        let (metrics, archive) = settle(transported, extracted)?;
        Ok((archive, metrics))
    }
}

fn spawn_stage<T, F>(name: &'static str, body: F) -> TransferResult<JoinHandle<TransferResult<T>>>
where
    T: Send + 'static,
    F: FnOnce() -> TransferResult<T> + Send + 'static,
{
    thread::Builder::new()
        .name(format!("tarlift-{}", name))
        .spawn(body)
        .map_err(TransferError::Io)
}

fn join_stage<T>(name: &'static str, handle: JoinHandle<TransferResult<T>>) -> TransferResult<T> {
    handle
        .join()
        .map_err(|_| TransferError::StagePanicked(name))?
}

/// Combine the producer's and consumer's results into one outcome.
///
/// With a single failure that failure is the outcome. When both failed, the
/// producer's error wins unless it is only the echo of the consumer going
/// away.
fn settle<P, C>(producer: TransferResult<P>, consumer: TransferResult<C>) -> TransferResult<(P, C)> {
    match (producer, consumer) {
        (Ok(p), Ok(c)) => Ok((p, c)),
        (Err(e), Ok(_)) | (Ok(_), Err(e)) => Err(e),
        (Err(p), Err(c)) => {
            let (reported, dropped) = if p.is_pipe_fallout() && !c.is_pipe_fallout() {
                (c, p)
            } else {
                (p, c)
            };
            warn!("secondary stage failure: {}", dropped);
            Err(reported)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::PipeClosed;
    use crate::store::{MemoryStore, StoreError};

    fn pipe_error() -> TransferError {
        TransferError::Pipe(PipeClosed::ReaderGone.into())
    }

    #[test]
    fn settle_prefers_root_cause_over_pipe_fallout() {
        let producer: TransferResult<()> = Err(pipe_error());
        let consumer: TransferResult<()> =
            Err(TransferError::Remote(StoreError::Remote("denied".into())));
        let err = settle(producer, consumer).unwrap_err();
        assert!(matches!(err, TransferError::Remote(_)));
    }

    #[test]
    fn settle_keeps_producer_error_when_both_are_real() {
        let producer: TransferResult<()> = Err(TransferError::Config("first".into()));
        let consumer: TransferResult<()> = Err(TransferError::Config("second".into()));
        match settle(producer, consumer) {
            Err(TransferError::Config(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn upload_of_missing_directory_is_filesystem_error() {
        let coordinator = Coordinator::new(Arc::new(MemoryStore::new()));
        let object = ObjectRef::new("b", "k").unwrap();
        let err = coordinator
            .upload(
                Path::new("/definitely/not/here"),
                &object,
                &TransferOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, TransferError::Filesystem { .. }));
    }

    #[test]
    fn upload_of_a_file_is_filesystem_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("plain.txt");
        fs::write(&file, b"x").unwrap();

        let coordinator = Coordinator::new(Arc::new(MemoryStore::new()));
        let object = ObjectRef::new("b", "k").unwrap();
        let err = coordinator
            .upload(&file, &object, &TransferOptions::default())
            .unwrap_err();
        assert!(matches!(err, TransferError::Filesystem { .. }));
    }

    #[test]
    fn download_of_missing_object_is_remote_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let coordinator = Coordinator::new(Arc::new(MemoryStore::new()));
        let object = ObjectRef::new("b", "absent").unwrap();
        let err = coordinator
            .download(&object, &dir.path().join("out"), &TransferOptions::default())
            .unwrap_err();
        assert!(
            matches!(err, TransferError::Remote(StoreError::NotFound(_))),
            "got {err}"
        );
    }

    #[test]
    fn options_debug_skips_filter() {
        let options = TransferOptions::default().with_prefix("run1");
        let rendered = format!("{:?}", options);
        assert!(rendered.contains("run1"));
        assert!(!rendered.contains("filter"));
    }
}
