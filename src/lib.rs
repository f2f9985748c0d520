//! tarlift library
//!
//! Streams a directory tree to an object store as a tar archive, and back,
//! without ever holding the whole archive in memory or on disk. An archive
//! thread and a transport thread are joined by a bounded pipe.

pub mod archive;
pub mod cli;
pub mod config;
pub mod error;
pub mod filter;
pub mod ledger;
pub mod pipe;
pub mod protocol;
pub mod protocol_core;
pub mod server;
pub mod store;
pub mod throughput;
pub mod transfer;
pub mod transport;

pub use archive::{ArchiveSummary, Compression};
pub use config::{Config, StoreConfig};
pub use error::{TransferError, TransferResult};
pub use filter::{AcceptAll, EntryFilter, GlobExclude};
pub use store::{ObjectRef, ObjectStore, StoreError};
pub use transfer::{Coordinator, Direction, TransferOptions, TransferSummary};
