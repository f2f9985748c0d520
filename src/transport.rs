//! Transport stage: pipe end <-> remote object.
//!
//! Each chunk crossing the stage goes through the throughput meter, which
//! owns the byte counters for the transfer.

use crate::error::{TransferError, TransferResult};
use crate::pipe::{PipeReader, PipeWriter};
use crate::store::{ObjectRef, ObjectStore};
use crate::throughput::{ThroughputMeter, TransferMetrics};
use tracing::debug;

/// Upload body: stream the read end into `object` until end-of-stream.
///
/// Dropping the reader on failure tells the archive stage to stop.
pub fn upload_from_pipe(
    store: &dyn ObjectStore,
    object: &ObjectRef,
    mut reader: PipeReader,
    mut meter: ThroughputMeter,
) -> TransferResult<TransferMetrics> {
    let stored = store.upload(object, &mut reader, &mut |n| {
        meter.record(n);
    })?;
    debug!("{} backend stored {} bytes as {}", store.backend_name(), stored, object);
    Ok(meter.finish())
}

/// Download body: stream `object` into the write end, then close it.
///
/// A failed download aborts the write end so the extractor stops with an
/// error instead of treating a short stream as complete.
pub fn download_to_pipe(
    store: &dyn ObjectStore,
    object: &ObjectRef,
    mut writer: PipeWriter,
    mut meter: ThroughputMeter,
) -> TransferResult<TransferMetrics> {
    let fetched = store.download(object, &mut writer, &mut |n| {
        meter.record(n);
    });

    match fetched {
        Ok(n) => {
            writer.close().map_err(TransferError::Pipe)?;
            debug!("{} backend delivered {} bytes of {}", store.backend_name(), n, object);
            Ok(meter.finish())
        }
        Err(e) => {
            writer.abort(&e.to_string());
            Err(e.into())
        }
    }
}
