use super::{copy_with_progress, ObjectRef, ObjectStore, StoreError, StoreResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;

/// In-process object store. Clones share the same objects.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    objects: Arc<RwLock<BTreeMap<ObjectRef, Arc<Vec<u8>>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, object: &ObjectRef) -> Option<Arc<Vec<u8>>> {
        self.objects.read().get(object).cloned()
    }

    pub fn insert(&self, object: ObjectRef, data: Vec<u8>) {
        self.objects.write().insert(object, Arc::new(data));
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl ObjectStore for MemoryStore {
    fn upload(
        &self,
        object: &ObjectRef,
        source: &mut dyn Read,
        progress: &mut dyn FnMut(u64),
    ) -> StoreResult<u64> {
        object.relative_path()?;
        let mut data = Vec::new();
        let n = copy_with_progress(source, &mut data, progress)?;
        self.insert(object.clone(), data);
        Ok(n)
    }

    fn download(
        &self,
        object: &ObjectRef,
        sink: &mut dyn Write,
        progress: &mut dyn FnMut(u64),
    ) -> StoreResult<u64> {
        let data = self
            .get(object)
            .ok_or_else(|| StoreError::NotFound(object.to_string()))?;
        let mut reader = Cursor::new(data.as_slice());
        Ok(copy_with_progress(&mut reader, sink, progress)?)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
