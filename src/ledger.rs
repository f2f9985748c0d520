//! JSON-lines ledger of transfers.
//!
//! Each transfer appends an `InProgress` entry when it starts and a
//! `Completed` or `Failed` entry sharing the same id when it ends.

use crate::error::{TransferError, TransferResult};
use crate::store::ObjectRef;
use crate::transfer::{Direction, TransferSummary};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    InProgress,
    Completed,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TransferLogEntry {
    pub timestamp: String,
    pub transfer_id: String,
    pub direction: Direction,
    pub local_path: PathBuf,
    /// `bucket/key` of the remote archive.
    pub object: String,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
    pub entries: u64,
    pub error: Option<String>,
}

impl TransferLogEntry {
    pub fn started(direction: Direction, local_path: &Path, object: &ObjectRef) -> Self {
        TransferLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            transfer_id: Uuid::new_v4().to_string(),
            direction,
            local_path: local_path.to_path_buf(),
            object: object.to_string(),
            status: TransferStatus::InProgress,
            bytes_transferred: 0,
            entries: 0,
            error: None,
        }
    }

    pub fn completed(&self, summary: &TransferSummary) -> Self {
        TransferLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            status: TransferStatus::Completed,
            bytes_transferred: summary.total_bytes,
            entries: summary.entries,
            ..self.clone()
        }
    }

    pub fn failed(&self, error: &TransferError) -> Self {
        TransferLogEntry {
            timestamp: Utc::now().to_rfc3339(),
            status: TransferStatus::Failed,
            error: Some(error.to_string()),
            ..self.clone()
        }
    }
}

pub struct TransferLog {
    log_file_path: PathBuf,
}

impl TransferLog {
    pub fn new(log_file_path: impl Into<PathBuf>) -> Self {
        TransferLog {
            log_file_path: log_file_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.log_file_path
    }

    pub fn add_entry(&self, entry: &TransferLogEntry) -> TransferResult<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .map_err(|e| TransferError::filesystem(&self.log_file_path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry).map_err(io::Error::from)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_log(&self) -> TransferResult<Vec<TransferLogEntry>> {
        if !self.log_file_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.log_file_path)
            .map_err(|e| TransferError::filesystem(&self.log_file_path, e))?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: TransferLogEntry = serde_json::from_str(&line).map_err(io::Error::from)?;
            entries.push(entry);
        }
        Ok(entries)
    }
}
