//! Local directory acting as an object store.

use super::{copy_with_progress, ObjectRef, ObjectStore, StoreError, StoreResult};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Objects live at `root/bucket/key`.
///
/// Uploads are written to a temporary file beside the destination and renamed
/// into place once the source reaches end-of-stream, so a failed upload never
/// leaves a partial object behind.
#[derive(Debug, Clone)]
pub struct FilesystemStore {
    root: PathBuf,
}

impl FilesystemStore {
    pub fn new(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where `object` is (or would be) stored.
    pub fn object_path(&self, object: &ObjectRef) -> StoreResult<PathBuf> {
        Ok(self.root.join(object.relative_path()?))
    }
}

impl ObjectStore for FilesystemStore {
    fn upload(
        &self,
        object: &ObjectRef,
        source: &mut dyn Read,
        progress: &mut dyn FnMut(u64),
    ) -> StoreResult<u64> {
        let path = self.object_path(object)?;
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(object.to_string()))?;
        fs::create_dir_all(parent)?;

        let temp = NamedTempFile::new_in(parent)?;
        let mut writer = BufWriter::new(temp);
        let written = copy_with_progress(source, &mut writer, progress)?;
        let temp = writer.into_inner().map_err(|e| e.into_error())?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| e.error)?;

        debug!("Stored {} ({} bytes) at {}", object, written, path.display());
        Ok(written)
    }

    fn download(
        &self,
        object: &ObjectRef,
        sink: &mut dyn Write,
        progress: &mut dyn FnMut(u64),
    ) -> StoreResult<u64> {
        let path = self.object_path(object)?;
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(object.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if file.metadata()?.is_dir() {
            return Err(StoreError::NotFound(object.to_string()));
        }
        Ok(copy_with_progress(&mut file, sink, progress)?)
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    struct FailingReader {
        remaining: usize,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.remaining == 0 {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "source died"));
            }
            let n = buf.len().min(self.remaining);
            buf[..n].fill(b'x');
            self.remaining -= n;
            Ok(n)
        }
    }

    #[test]
    fn upload_then_download() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemStore::new(dir.path()).unwrap();
        let object = ObjectRef::new("runs", "2024/run1.tar.gz").unwrap();

        let payload = vec![3u8; 200_000];
        let mut chunks = 0;
        let n = store
            .upload(&object, &mut Cursor::new(&payload), &mut |_| chunks += 1)
            .unwrap();
        assert_eq!(n, payload.len() as u64);
        assert!(chunks > 1);
        assert!(dir.path().join("runs/2024/run1.tar.gz").is_file());

        let mut out = Vec::new();
        let n = store.download(&object, &mut out, &mut |_| {}).unwrap();
        assert_eq!(n, payload.len() as u64);
        assert_eq!(out, payload);
    }

    #[test]
    fn missing_object_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemStore::new(dir.path()).unwrap();
        let object = ObjectRef::new("runs", "absent.tar.gz").unwrap();
        let err = store.download(&object, &mut Vec::new(), &mut |_| {}).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn failed_upload_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemStore::new(dir.path()).unwrap();
        let object = ObjectRef::new("runs", "broken.tar.gz").unwrap();

        let err = store
            .upload(
                &object,
                &mut FailingReader { remaining: 100_000 },
                &mut |_| {},
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));

        let leftovers: Vec<_> = fs::read_dir(dir.path().join("runs"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn traversal_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemStore::new(dir.path()).unwrap();
        let object = ObjectRef {
            bucket: "runs".into(),
            key: "../../escape".into(),
        };
        let err = store
            .upload(&object, &mut Cursor::new(b"x"), &mut |_| {})
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }
}
