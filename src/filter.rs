//! Inclusion filters applied while walking a tree for archiving.
//!
//! A filter is a pure predicate over the walked path: `true` keeps the file,
//! `false` leaves it out of the archive. It runs once per discovered file.

use crate::error::{TransferError, TransferResult};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fmt;
use std::path::Path;

/// Pattern for derived read files kept out of run archives.
pub const DERIVED_READS_PATTERN: &str = "*.fastq.*";

pub trait EntryFilter: Send + Sync {
    fn include(&self, path: &Path) -> bool;
}

impl<F> EntryFilter for F
where
    F: Fn(&Path) -> bool + Send + Sync,
{
    fn include(&self, path: &Path) -> bool {
        self(path)
    }
}

/// Default filter: everything goes in.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl EntryFilter for AcceptAll {
    fn include(&self, _path: &Path) -> bool {
        true
    }
}

/// Excludes paths matching any of a set of glob patterns.
///
/// Patterns match against the full walked path and `*` crosses directory
/// separators, so `*.fastq.*` excludes such files at any depth.
#[derive(Clone)]
pub struct GlobExclude {
    globset: GlobSet,
    patterns: Vec<String>,
}

impl GlobExclude {
    pub fn new<I, S>(patterns: I) -> TransferResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        let mut kept = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let glob = Glob::new(pattern).map_err(|e| {
                TransferError::Config(format!("invalid exclusion pattern '{}': {}", pattern, e))
            })?;
            builder.add(glob);
            kept.push(pattern.to_string());
        }

        let globset = builder
            .build()
            .map_err(|e| TransferError::Config(format!("failed to build exclusion set: {}", e)))?;

        Ok(Self {
            globset,
            patterns: kept,
        })
    }

    /// The exclusion used for sequencing run uploads.
    pub fn derived_reads() -> TransferResult<Self> {
        Self::new([DERIVED_READS_PATTERN])
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl fmt::Debug for GlobExclude {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobExclude")
            .field("patterns", &self.patterns)
            .finish()
    }
}

impl EntryFilter for GlobExclude {
    fn include(&self, path: &Path) -> bool {
        !self.globset.is_match(path)
    }
}
