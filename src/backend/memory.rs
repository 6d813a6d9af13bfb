//! Memory Backend
//!
//! Keeps segments in a shared [`MemoryStore`] instead of on disk. Used for
//! dry runs and tests; it follows the same rotation and locking rules as the
//! segment backend so the two are interchangeable behind the writer.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use super::{needs_rotation, FileWriter};
use crate::error::{Error, Result};
use crate::fs::FileSystem;
use crate::serializer::Serializer;
use crate::wal::record::MapRecord;

/// Registered name of this backend
pub const NAME: &str = "memory";

#[derive(Debug, Default)]
struct StoreInner {
    /// Segments per parent path, each a list of serialized records
    logs: HashMap<PathBuf, Vec<Vec<Vec<u8>>>>,
    /// Parent paths held by an open writer
    held: HashSet<PathBuf>,
}

/// Shared in-memory segment storage; clones see the same data
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store behind the registry's built-in `memory` backend
    pub fn shared() -> MemoryStore {
        static SHARED: OnceLock<MemoryStore> = OnceLock::new();
        SHARED.get_or_init(MemoryStore::new).clone()
    }

    /// Copy of the segments written under `path`
    pub fn segments(&self, path: &Path) -> Vec<Vec<Vec<u8>>> {
        self.inner.lock().logs.get(path).cloned().unwrap_or_default()
    }

    pub fn segment_count(&self, path: &Path) -> usize {
        self.inner.lock().logs.get(path).map_or(0, Vec::len)
    }

    /// Decode every record under `path` in write order
    pub fn records(&self, path: &Path, serializer: &dyn Serializer) -> Result<Vec<MapRecord>> {
        let inner = self.inner.lock();
        let Some(segments) = inner.logs.get(path) else {
            return Ok(Vec::new());
        };
        segments
            .iter()
            .flatten()
            .map(|bytes| serializer.deserialize(bytes))
            .collect()
    }

    /// Whether a writer currently holds `path`
    pub fn is_held(&self, path: &Path) -> bool {
        self.inner.lock().held.contains(path)
    }

    fn acquire(&self, path: &Path) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.held.insert(path.to_path_buf()) {
            return Err(Error::Initialization(format!(
                "memory log {} is held by another writer",
                path.display()
            )));
        }
        // a new writer always opens a fresh segment
        inner.logs.entry(path.to_path_buf()).or_default().push(Vec::new());
        Ok(())
    }

    fn release(&self, path: &Path) {
        self.inner.lock().held.remove(path);
    }

    fn append(&self, path: &Path, payload: Vec<u8>, rotate: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let segments = inner
            .logs
            .get_mut(path)
            .ok_or_else(|| Error::BackendWrite(format!("memory log {} vanished", path.display())))?;
        if rotate || segments.is_empty() {
            segments.push(Vec::new());
        }
        if let Some(current) = segments.last_mut() {
            current.push(payload);
        }
        Ok(())
    }
}

/// [`FileWriter`] over a [`MemoryStore`]
pub struct MemoryFileWriter {
    store: MemoryStore,
    block_size: u64,
    path: Option<PathBuf>,
    serializer: Option<Arc<dyn Serializer>>,
    segment_bytes: u64,
    closed: bool,
}

impl MemoryFileWriter {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            block_size: u64::MAX,
            path: None,
            serializer: None,
            segment_bytes: 0,
            closed: false,
        }
    }
}

impl FileWriter for MemoryFileWriter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn set_block_size(&mut self, block_size: u64) {
        self.block_size = block_size;
    }

    fn initialize(
        &mut self,
        _fs: Arc<dyn FileSystem>,
        parent_path: &Path,
        serializer: Arc<dyn Serializer>,
    ) -> Result<()> {
        if self.path.is_some() || self.closed {
            return Err(Error::Initialization("memory backend initialized twice".into()));
        }
        self.store.acquire(parent_path)?;
        self.path = Some(parent_path.to_path_buf());
        self.serializer = Some(serializer);
        tracing::debug!(path = %parent_path.display(), "memory backend initialized");
        Ok(())
    }

    fn write(&mut self, record: &MapRecord) -> Result<()> {
        if self.closed {
            return Err(Error::ClosedResource("memory backend"));
        }
        let (Some(path), Some(serializer)) = (self.path.as_ref(), self.serializer.as_ref()) else {
            return Err(Error::BackendWrite("memory backend not initialized".into()));
        };

        let payload = serializer.serialize(record)?;
        let len = payload.len() as u64;
        let rotate = needs_rotation(self.segment_bytes, len, self.block_size);
        self.store.append(path, payload, rotate)?;

        self.segment_bytes = if rotate { len } else { self.segment_bytes + len };
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::ClosedResource("memory backend"));
        }
        self.closed = true;
        if let Some(path) = self.path.take() {
            self.store.release(&path);
        }
        Ok(())
    }
}

impl Drop for MemoryFileWriter {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            self.store.release(&path);
        }
    }
}
