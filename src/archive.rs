//! Archive stage: directory tree <-> tar stream.
//!
//! Write mode walks a tree, filters it, and streams tar records (optionally
//! gzip-compressed) into a writer. Read mode unpacks such a stream into a
//! destination directory. Neither mode seeks: the stream is consumed and
//! produced strictly front to back.

use crate::error::{classify_entry_error, classify_stream_error, TransferError, TransferResult};
use crate::filter::EntryFilter;
use crate::pipe::{PipeReader, PipeWriter};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Builder};
use tracing::{debug, warn};
use walkdir::WalkDir;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Stream encoding around the tar records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Gzip,
    None,
}

/// One file selected for archiving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub source_path: PathBuf,
    pub archive_path: PathBuf,
    /// Content size; zero for symlinks.
    pub size: u64,
}

/// What an archive stage moved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    /// Files written into or out of the archive.
    pub entries: u64,
    /// Sum of their content sizes.
    pub content_bytes: u64,
}

/// Everything the serialize side needs besides the output.
#[derive(Clone)]
pub struct PackRequest<'a> {
    pub root: &'a Path,
    pub prefix: Option<&'a Path>,
    pub filter: &'a dyn EntryFilter,
    pub compression: Compression,
}

/// Deterministic walk of `root` yielding the entries that pass `filter`.
///
/// Entries come out in walk order: sorted by file name inside each
/// directory, parents before children. Directories themselves are not
/// entries.
pub struct ManifestWalker<'a> {
    root: PathBuf,
    prefix: Option<PathBuf>,
    filter: &'a dyn EntryFilter,
    inner: walkdir::IntoIter,
}

impl<'a> ManifestWalker<'a> {
    pub fn new(root: &Path, prefix: Option<&Path>, filter: &'a dyn EntryFilter) -> Self {
        let inner = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();
        Self {
            root: root.to_path_buf(),
            prefix: prefix.map(Path::to_path_buf),
            filter,
            inner,
        }
    }
}

impl Iterator for ManifestWalker<'_> {
    type Item = TransferResult<ManifestEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| self.root.clone());
                    return Some(Err(TransferError::filesystem(path, io::Error::from(e))));
                }
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }
            if !file_type.is_file() && !file_type.is_symlink() {
                warn!(path = %entry.path().display(), "skipping special file");
                continue;
            }

            let path = entry.path();
            if !self.filter.include(path) {
                debug!(path = %path.display(), "excluded by filter");
                continue;
            }

            let archive_path = match archive_path(&self.root, self.prefix.as_deref(), path) {
                Ok(p) => p,
                Err(e) => return Some(Err(e)),
            };

            let size = if file_type.is_file() {
                match entry.metadata() {
                    Ok(meta) => meta.len(),
                    Err(e) => {
                        return Some(Err(TransferError::filesystem(path, io::Error::from(e))))
                    }
                }
            } else {
                0
            };

            return Some(Ok(ManifestEntry {
                source_path: path.to_path_buf(),
                archive_path,
                size,
            }));
        }
    }
}

/// Collect the manifest an upload of `root` would produce.
pub fn manifest(
    root: &Path,
    prefix: Option<&Path>,
    filter: &dyn EntryFilter,
) -> TransferResult<Vec<ManifestEntry>> {
    ManifestWalker::new(root, prefix, filter).collect()
}

/// Archive member name for `path` found under `root`.
///
/// With a prefix the name is `prefix/relative`. Without one, an absolute
/// root maps to the bare relative path (the root prefix "/" stripped, since
/// tar members are relative) and a relative root keeps the walked path,
/// minus everything up to its last `..` (`../run42/a.txt` becomes
/// `run42/a.txt`).
pub fn archive_path(root: &Path, prefix: Option<&Path>, path: &Path) -> TransferResult<PathBuf> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| TransferError::InvalidArchivePath(path.to_path_buf()))?;

    let joined = match prefix {
        Some(prefix) => prefix.join(rel),
        None if root.is_absolute() => rel.to_path_buf(),
        None => walked_base(root).join(rel),
    };

    let mut member = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::Normal(part) => member.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return Err(TransferError::InvalidArchivePath(joined)),
        }
    }

    if member.as_os_str().is_empty() {
        return Err(TransferError::InvalidArchivePath(path.to_path_buf()));
    }
    Ok(member)
}

/// Components of a relative root that can name archive members.
fn walked_base(root: &Path) -> PathBuf {
    let mut base = PathBuf::new();
    for component in root.components() {
        match component {
            Component::ParentDir => base = PathBuf::new(),
            other => base.push(other),
        }
    }
    base
}

/// Write the tar stream for `request` into `out`, returning `out` once the
/// end-of-archive marker (and gzip trailer) has been written.
pub fn pack<W: Write>(request: &PackRequest<'_>, out: W) -> TransferResult<(W, ArchiveSummary)> {
    match request.compression {
        Compression::Gzip => {
            let encoder = GzEncoder::new(out, flate2::Compression::default());
            let (encoder, summary) = write_tar(request, encoder)?;
            let out = encoder.finish().map_err(classify_stream_error)?;
            Ok((out, summary))
        }
        Compression::None => write_tar(request, out),
    }
}

fn write_tar<W: Write>(request: &PackRequest<'_>, out: W) -> TransferResult<(W, ArchiveSummary)> {
    let mut builder = Builder::new(out);
    builder.follow_symlinks(false);
    let mut summary = ArchiveSummary::default();

    for entry in ManifestWalker::new(request.root, request.prefix, request.filter) {
        let entry = entry?;
        debug!(
            "Archiving `{}` as `{}`",
            entry.source_path.display(),
            entry.archive_path.display()
        );
        builder
            .append_path_with_name(&entry.source_path, &entry.archive_path)
            .map_err(|e| classify_entry_error(&entry.source_path, e))?;
        summary.entries += 1;
        summary.content_bytes += entry.size;
    }

    let out = builder.into_inner().map_err(classify_stream_error)?;
    Ok((out, summary))
}

/// Serialize stage body: pack into the pipe, then close it.
///
/// On failure the pipe is aborted so the consumer sees an error rather than
/// a short but well-formed stream.
pub fn archive_to_pipe(
    request: &PackRequest<'_>,
    mut writer: PipeWriter,
) -> TransferResult<ArchiveSummary> {
    let packed = pack(request, &mut writer).map(|(_, summary)| summary);
    match packed {
        Ok(summary) => {
            writer.close().map_err(TransferError::Pipe)?;
            Ok(summary)
        }
        Err(e) => {
            writer.abort(&e.to_string());
            Err(e)
        }
    }
}

/// Unpack a tar stream from `input` into `dest`, then drain `input` to
/// end-of-stream.
///
/// The stream's leading bytes decide between gzip and plain tar;
/// `compression` is only used when the stream is too short to tell.
pub fn extract<R: Read>(
    input: R,
    dest: &Path,
    compression: Compression,
) -> TransferResult<ArchiveSummary> {
    fs::create_dir_all(dest).map_err(|e| TransferError::filesystem(dest, e))?;

    let (input, detected) = sniff_compression(input, compression)?;
    if detected != compression {
        debug!("stream is {:?}, expected {:?}", detected, compression);
    }

    match detected {
        Compression::Gzip => {
            let decoder = MultiGzDecoder::new(input);
            let (mut decoder, summary) = read_tar(decoder, dest)?;
            drain(&mut decoder)?;
            Ok(summary)
        }
        Compression::None => {
            let (mut input, summary) = read_tar(input, dest)?;
            drain(&mut input)?;
            Ok(summary)
        }
    }
}

/// Read up to the gzip magic length and report what the stream holds. The
/// returned reader replays the peeked bytes.
fn sniff_compression<R: Read>(
    mut input: R,
    fallback: Compression,
) -> TransferResult<(io::Chain<io::Cursor<Vec<u8>>, R>, Compression)> {
    let mut head = [0u8; 2];
    let mut filled = 0;
    while filled < head.len() {
        match input.read(&mut head[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(classify_stream_error(e)),
        }
    }

    let detected = if filled < head.len() {
        fallback
    } else if head == GZIP_MAGIC {
        Compression::Gzip
    } else {
        Compression::None
    };
    Ok((io::Cursor::new(head[..filled].to_vec()).chain(input), detected))
}

fn read_tar<R: Read>(input: R, dest: &Path) -> TransferResult<(R, ArchiveSummary)> {
    let mut archive = Archive::new(input);
    archive.set_overwrite(true);
    let mut summary = ArchiveSummary::default();

    for entry in archive.entries().map_err(classify_stream_error)? {
        let mut entry = entry.map_err(classify_stream_error)?;
        let entry_type = entry.header().entry_type();
        let member = entry.path().map_err(classify_stream_error)?.into_owned();

        if entry_type.is_block_special()
            || entry_type.is_character_special()
            || entry_type.is_fifo()
        {
            warn!(member = %member.display(), "skipping device entry");
            continue;
        }

        let unpacked = entry.unpack_in(dest).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                classify_stream_error(e)
            } else {
                classify_entry_error(dest.join(&member), e)
            }
        })?;
        if !unpacked {
            warn!(member = %member.display(), "skipping entry outside destination");
            continue;
        }

        debug!("Extracted `{}`", member.display());
        if !entry_type.is_dir() {
            summary.entries += 1;
            summary.content_bytes += entry.size();
        }
    }

    Ok((archive.into_inner(), summary))
}

/// Consume whatever follows the end-of-archive marker (record padding, gzip
/// trailer) so the producer can finish writing.
fn drain<R: Read>(input: &mut R) -> TransferResult<u64> {
    io::copy(input, &mut io::sink()).map_err(classify_stream_error)
}

/// Extract stage body: unpack everything the pipe delivers.
pub fn extract_from_pipe(
    reader: PipeReader,
    dest: &Path,
    compression: Compression,
) -> TransferResult<ArchiveSummary> {
    extract(reader, dest, compression)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{AcceptAll, GlobExclude};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn write_file(path: &Path, content: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    fn sample_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        write_file(&dir.path().join("b.txt"), &[b'b'; 20]);
        write_file(&dir.path().join("a.txt"), &[b'a'; 10]);
        write_file(&dir.path().join("sub/c.bin"), &[0u8; 700]);
        write_file(&dir.path().join("sub/deeper/d.txt"), b"dee");
        write_file(&dir.path().join("skip.fastq.gz"), &[1u8; 1000]);
        dir
    }

    #[test]
    fn walk_is_sorted_and_filtered() {
        let tree = sample_tree();
        let filter = GlobExclude::derived_reads().unwrap();
        let entries = manifest(tree.path(), None, &filter).unwrap();
        let names: Vec<_> = entries
            .iter()
            .map(|e| e.archive_path.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub/c.bin", "sub/deeper/d.txt"]);
        assert_eq!(entries[2].size, 700);
    }

    #[test]
    fn prefix_is_prepended() {
        let tree = sample_tree();
        let entries = manifest(tree.path(), Some(Path::new("run42/")), &AcceptAll).unwrap();
        assert!(entries
            .iter()
            .all(|e| e.archive_path.starts_with("run42")));
        assert_eq!(entries.len(), 5);
    }

    #[test]
    fn archive_path_rules() {
        let abs = Path::new("/data/run");
        assert_eq!(
            archive_path(abs, None, Path::new("/data/run/x/y.txt")).unwrap(),
            PathBuf::from("x/y.txt")
        );
        assert_eq!(
            archive_path(abs, Some(Path::new("/")), Path::new("/data/run/y.txt")).unwrap(),
            PathBuf::from("y.txt")
        );
        assert_eq!(
            archive_path(Path::new("./data"), None, Path::new("./data/y.txt")).unwrap(),
            PathBuf::from("data/y.txt")
        );
        assert_eq!(
            archive_path(Path::new("../up"), None, Path::new("../up/y.txt")).unwrap(),
            PathBuf::from("up/y.txt")
        );
        assert_eq!(
            archive_path(Path::new("../../runs/./r1"), None, Path::new("../../runs/./r1/y.txt"))
                .unwrap(),
            PathBuf::from("runs/r1/y.txt")
        );
        assert!(archive_path(Path::new("up"), Some(Path::new("../out")), Path::new("up/y.txt"))
            .is_err());
        assert!(archive_path(abs, None, Path::new("/elsewhere/y.txt")).is_err());
    }

    #[test]
    fn pack_then_extract_plain_tar() {
        let tree = sample_tree();
        let filter = GlobExclude::derived_reads().unwrap();
        let request = PackRequest {
            root: tree.path(),
            prefix: None,
            filter: &filter,
            compression: Compression::None,
        };
        let (bytes, packed) = pack(&request, Vec::new()).unwrap();
        assert_eq!(packed.entries, 4);
        assert_eq!(packed.content_bytes, 10 + 20 + 700 + 3);
        assert_eq!(bytes.len() % 512, 0);

        let out = TempDir::new().unwrap();
        let extracted = extract(Cursor::new(bytes), out.path(), Compression::None).unwrap();
        assert_eq!(extracted, packed);
        assert_eq!(fs::read(out.path().join("sub/deeper/d.txt")).unwrap(), b"dee");
        assert!(!out.path().join("skip.fastq.gz").exists());
    }

    #[test]
    fn pack_then_extract_gzip() {
        let tree = sample_tree();
        let request = PackRequest {
            root: tree.path(),
            prefix: Some(Path::new("lib")),
            filter: &AcceptAll,
            compression: Compression::Gzip,
        };
        let (bytes, packed) = pack(&request, Vec::new()).unwrap();
        assert_eq!(&bytes[..2], &[0x1f, 0x8b]);

        let out = TempDir::new().unwrap();
        let extracted = extract(Cursor::new(bytes), out.path(), Compression::Gzip).unwrap();
        assert_eq!(extracted.entries, packed.entries);
        assert_eq!(fs::read(out.path().join("lib/a.txt")).unwrap(), vec![b'a'; 10]);
    }

    #[test]
    fn empty_tree_is_just_the_end_marker() {
        let tree = TempDir::new().unwrap();
        let request = PackRequest {
            root: tree.path(),
            prefix: None,
            filter: &AcceptAll,
            compression: Compression::None,
        };
        let (bytes, summary) = pack(&request, Vec::new()).unwrap();
        assert_eq!(summary, ArchiveSummary::default());
        assert_eq!(bytes.len(), 1024);
    }

    #[test]
    fn truncated_stream_is_archive_error() {
        let tree = sample_tree();
        let request = PackRequest {
            root: tree.path(),
            prefix: None,
            filter: &AcceptAll,
            compression: Compression::None,
        };
        let (bytes, _) = pack(&request, Vec::new()).unwrap();
        let cut = &bytes[..700];

        let out = TempDir::new().unwrap();
        let err = extract(Cursor::new(cut.to_vec()), out.path(), Compression::None).unwrap_err();
        assert!(
            matches!(err, TransferError::Archive(_)),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn garbage_stream_is_archive_error() {
        let out = TempDir::new().unwrap();
        let err = extract(
            Cursor::new(b"definitely not gzip".to_vec()),
            out.path(),
            Compression::Gzip,
        )
        .unwrap_err();
        assert!(matches!(err, TransferError::Archive(_)));

        let mut broken_gzip = GZIP_MAGIC.to_vec();
        broken_gzip.extend_from_slice(b"not a deflate body");
        let err = extract(Cursor::new(broken_gzip), out.path(), Compression::Gzip).unwrap_err();
        assert!(matches!(err, TransferError::Archive(_)));
    }

    #[test]
    fn extract_follows_the_stream_not_the_hint() {
        let tree = sample_tree();
        for packed_as in [Compression::Gzip, Compression::None] {
            let request = PackRequest {
                root: tree.path(),
                prefix: None,
                filter: &AcceptAll,
                compression: packed_as,
            };
            let (bytes, packed) = pack(&request, Vec::new()).unwrap();

            for hint in [Compression::Gzip, Compression::None] {
                let out = TempDir::new().unwrap();
                let extracted = extract(Cursor::new(bytes.clone()), out.path(), hint).unwrap();
                assert_eq!(extracted, packed, "packed {packed_as:?}, hint {hint:?}");
                assert_eq!(fs::read(out.path().join("b.txt")).unwrap(), vec![b'b'; 20]);
            }
        }
    }

    #[test]
    fn missing_root_is_filesystem_error() {
        let tree = TempDir::new().unwrap();
        let missing = tree.path().join("nope");
        let err = manifest(&missing, None, &AcceptAll).unwrap_err();
        assert!(matches!(err, TransferError::Filesystem { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_archived_as_links() {
        let tree = sample_tree();
        std::os::unix::fs::symlink("a.txt", tree.path().join("link")).unwrap();
        let request = PackRequest {
            root: tree.path(),
            prefix: None,
            filter: &AcceptAll,
            compression: Compression::None,
        };
        let (bytes, _) = pack(&request, Vec::new()).unwrap();

        let out = TempDir::new().unwrap();
        extract(Cursor::new(bytes), out.path(), Compression::None).unwrap();
        let meta = fs::symlink_metadata(out.path().join("link")).unwrap();
        assert!(meta.file_type().is_symlink());
    }
}
