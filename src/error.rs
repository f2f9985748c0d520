//! Transfer error taxonomy.

use crate::pipe::PipeClosed;
use crate::store::StoreError;
use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by a transfer or one of its stages.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Local filesystem failure: missing source, permission denied,
    /// destination not creatable.
    #[error("filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Remote object store failure.
    #[error("remote store error: {0}")]
    Remote(#[from] StoreError),

    /// Malformed or truncated archive stream.
    #[error("archive error: {0}")]
    Archive(#[source] io::Error),

    /// The pipe between the stages was broken by the other side.
    #[error("pipe error: {0}")]
    Pipe(#[source] io::Error),

    #[error("invalid archive path: {}", .0.display())]
    InvalidArchivePath(PathBuf),

    #[error("{0} stage panicked")]
    StagePanicked(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for transfer operations.
pub type TransferResult<T> = std::result::Result<T, TransferError>;

impl TransferError {
    pub(crate) fn filesystem(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TransferError::Filesystem {
            path: path.into(),
            source,
        }
    }

    /// True when this error is only the echo of the other stage going away.
    ///
    /// When both stages fail, the coordinator reports the error for which
    /// this returns false.
    pub fn is_pipe_fallout(&self) -> bool {
        matches!(self, TransferError::Pipe(_)) || chain_mentions_pipe(self)
    }
}

/// Walk an error chain looking for a [`PipeClosed`], including the payloads
/// of custom `io::Error`s (which `source()` skips over).
pub(crate) fn chain_mentions_pipe(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<PipeClosed>() {
            return true;
        }
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if let Some(inner) = io_err.get_ref() {
                if chain_mentions_pipe(inner) {
                    return true;
                }
            }
        }
        current = e.source();
    }
    false
}

/// Classify an I/O error raised while reading or writing one archive entry.
pub(crate) fn classify_entry_error(path: impl Into<PathBuf>, err: io::Error) -> TransferError {
    if chain_mentions_pipe(&err) {
        TransferError::Pipe(err)
    } else {
        TransferError::filesystem(path, err)
    }
}

/// Classify an I/O error raised while decoding the archive stream itself.
pub(crate) fn classify_stream_error(err: io::Error) -> TransferError {
    if chain_mentions_pipe(&err) {
        TransferError::Pipe(err)
    } else {
        TransferError::Archive(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_fallout_detected_through_wrapping() {
        let inner = io::Error::new(io::ErrorKind::BrokenPipe, PipeClosed::ReaderGone);
        let wrapped = io::Error::new(io::ErrorKind::BrokenPipe, inner);
        let err = TransferError::Remote(StoreError::Io(wrapped));
        assert!(err.is_pipe_fallout());
    }

    #[test]
    fn plain_io_error_is_root_cause() {
        let err = TransferError::filesystem(
            "/nope",
            io::Error::new(io::ErrorKind::NotFound, "missing"),
        );
        assert!(!err.is_pipe_fallout());
        assert!(err.to_string().contains("/nope"));
    }

    #[test]
    fn classify_separates_pipe_from_filesystem() {
        let pipe = io::Error::new(io::ErrorKind::BrokenPipe, PipeClosed::WriterDropped);
        assert!(matches!(
            classify_entry_error("a.txt", pipe),
            TransferError::Pipe(_)
        ));

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(
            classify_entry_error("a.txt", denied),
            TransferError::Filesystem { .. }
        ));

        let truncated = io::Error::new(io::ErrorKind::UnexpectedEof, "short block");
        assert!(matches!(
            classify_stream_error(truncated),
            TransferError::Archive(_)
        ));
    }
}
