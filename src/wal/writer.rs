//! WAL Writer
//!
//! Front door for logging map mutations. A writer binds one backend to one
//! parent path and persists records either inline (`Sync`) or on a bounded
//! worker pool (`Async`).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::record::MapRecord;
use crate::backend::{BackendRegistry, FileWriter};
use crate::config::{StorageConfig, WalConfig};
use crate::error::{Error, Result};
use crate::fs::FileSystem;
use crate::metrics::{MetricsSnapshot, WriteMetrics};
use crate::pool::{ShutdownPolicy, TaskHandle, TaskStatus, WorkerPool};
use crate::serializer::Serializer;

/// When a write counts as done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// `write` returns once the backend has the record
    #[default]
    #[serde(alias = "SYNC")]
    Sync,
    /// `write` returns once the record is queued; failures go to metrics
    #[serde(alias = "ASYNC")]
    Async,
}

impl std::fmt::Display for Durability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Durability::Sync => write!(f, "sync"),
            Durability::Async => write!(f, "async"),
        }
    }
}

/// What `close` did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloseReport {
    /// The most recently submitted task was still queued and will not run
    pub cancelled_pending: bool,
    /// Other queued tasks dropped by `ShutdownPolicy::Discard`
    pub abandoned: u64,
    /// Workers were still running when the close timeout expired
    pub timed_out: bool,
    /// The backend was closed; false when a running write still held it at
    /// the close timeout
    pub backend_closed: bool,
    /// Counters at the moment the backend was closed
    pub metrics: MetricsSnapshot,
}

/// Write-ahead log writer for one map
pub struct WalWriter {
    backend: Arc<Mutex<Box<dyn FileWriter>>>,
    backend_name: &'static str,
    parent_path: PathBuf,
    mode: Durability,
    pool: Option<WorkerPool>,
    shutdown: ShutdownPolicy,
    close_timeout: Duration,
    /// Last async submission; cancelled on close
    pending: Mutex<Option<TaskHandle>>,
    closed: AtomicBool,
    metrics: Arc<WriteMetrics>,
}

impl WalWriter {
    /// Open a writer using the process-wide backend registry
    pub fn open(
        fs: Arc<dyn FileSystem>,
        storage: &StorageConfig,
        wal: &WalConfig,
        parent_path: impl AsRef<Path>,
        serializer: Arc<dyn Serializer>,
    ) -> Result<Self> {
        Self::open_with_registry(
            BackendRegistry::global(),
            fs,
            storage,
            wal,
            parent_path,
            serializer,
        )
    }

    /// Open a writer resolving the backend in `registry`.
    ///
    /// The backend name is resolved before anything touches `fs`, so an
    /// unknown name leaves no trace on disk.
    pub fn open_with_registry(
        registry: &BackendRegistry,
        fs: Arc<dyn FileSystem>,
        storage: &StorageConfig,
        wal: &WalConfig,
        parent_path: impl AsRef<Path>,
        serializer: Arc<dyn Serializer>,
    ) -> Result<Self> {
        let parent_path = parent_path.as_ref().to_path_buf();
        let factory = registry.resolve(&storage.backend)?;

        if storage.block_size == 0 {
            return Err(Error::Config(
                "storage.block_size must be greater than 0".into(),
            ));
        }
        if wal.mode == Durability::Async {
            wal.pool.validate()?;
        }

        let mut backend = factory();
        let backend_name = backend.name();
        backend.configure(storage);
        backend.set_block_size(storage.block_size);
        backend.initialize(fs, &parent_path, serializer)?;

        let pool = match wal.mode {
            Durability::Sync => None,
            Durability::Async => {
                let name = parent_path
                    .file_name()
                    .map(|n| format!("mapwal-{}", n.to_string_lossy()))
                    .unwrap_or_else(|| "mapwal".to_string());
                match WorkerPool::new(
                    name,
                    wal.pool.sizing(),
                    wal.pool.keep_alive(),
                    wal.pool.rejection,
                ) {
                    Ok(pool) => Some(pool),
                    Err(e) => {
                        if let Err(close_err) = backend.close() {
                            tracing::warn!("failed to close backend after pool error: {}", close_err);
                        }
                        return Err(e);
                    }
                }
            }
        };

        tracing::info!(
            backend = backend_name,
            path = %parent_path.display(),
            mode = %wal.mode,
            block_size = storage.block_size,
            workers = ?pool.as_ref().map(|p| p.sizing().min_threads),
            "WAL writer opened"
        );

        Ok(Self {
            backend: Arc::new(Mutex::new(backend)),
            backend_name,
            parent_path,
            mode: wal.mode,
            pool,
            shutdown: wal.pool.shutdown,
            close_timeout: wal.close_timeout(),
            pending: Mutex::new(None),
            closed: AtomicBool::new(false),
            metrics: Arc::new(WriteMetrics::new()),
        })
    }

    /// Log one mutation.
    ///
    /// In `Sync` mode the record is on the backend when this returns. In
    /// `Async` mode it is only queued; a later failure shows up in
    /// [`metrics`](Self::metrics) and the log, never here.
    ///
    /// # Errors
    ///
    /// `Error::ClosedResource` after close. `Sync`: `Error::WalWrite` around
    /// the backend failure. `Async`: `Error::Rejected` when the pool is
    /// saturated under the abort policy.
    pub fn write(&self, record: MapRecord) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ClosedResource("WAL writer"));
        }

        let Some(pool) = &self.pool else {
            let mut backend = self.backend.lock();
            // close may have finished while we waited for the lock
            if self.is_closed() {
                return Err(Error::ClosedResource("WAL writer"));
            }
            backend.write(&record).map_err(Error::wal_write)?;
            drop(backend);
            self.metrics.record_submitted();
            self.metrics.record_persisted();
            return Ok(());
        };

        let backend = Arc::clone(&self.backend);
        let metrics = Arc::clone(&self.metrics);
        let submitted = pool.submit(move || match backend.lock().write(&record) {
            Ok(()) => metrics.record_persisted(),
            Err(e) => metrics.record_failure(&record, &e),
        });

        let handle = match submitted {
            Ok(handle) => handle,
            Err(e) => {
                if matches!(e, Error::Rejected { .. }) {
                    self.metrics.record_rejected();
                }
                return Err(e);
            }
        };

        // discard policy hands back an already-rejected task
        if handle.status() == TaskStatus::Rejected {
            self.metrics.record_rejected();
            return Ok(());
        }

        self.metrics.record_submitted();
        *self.pending.lock() = Some(handle);
        Ok(())
    }

    /// Stop accepting writes, settle background work and close the backend.
    ///
    /// Under `ShutdownPolicy::Discard` the last submitted task is cancelled
    /// if it has not started and every other queued task is dropped; under
    /// `ShutdownPolicy::Drain` all of them run. Either way `close` returns
    /// within the close timeout: if a write still holds the backend when it
    /// expires, the backend is left open and `backend_closed` is false.
    ///
    /// # Errors
    ///
    /// `Error::ClosedResource` on a second call; otherwise whatever the
    /// backend returns from its own close.
    pub fn close(&self) -> Result<CloseReport> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::ClosedResource("WAL writer"));
        }

        let deadline = Instant::now() + self.close_timeout;
        let pending = self.pending.lock().take();
        let cancelled_pending = self.shutdown == ShutdownPolicy::Discard
            && pending.is_some_and(|handle| handle.cancel());

        let (abandoned, timed_out) = match &self.pool {
            Some(pool) => {
                let report = pool.shutdown(self.shutdown, self.close_timeout);
                (report.abandoned, report.timed_out)
            }
            None => (0, false),
        };

        if cancelled_pending || abandoned > 0 {
            tracing::warn!(
                path = %self.parent_path.display(),
                cancelled_pending,
                abandoned,
                "queued WAL writes dropped on close"
            );
        }
        if timed_out {
            tracing::warn!(
                path = %self.parent_path.display(),
                timeout_ms = self.close_timeout.as_millis() as u64,
                "background writes still running at close timeout"
            );
        }

        let backend_closed = match self.backend.try_lock_until(deadline) {
            Some(mut backend) => {
                backend.close()?;
                true
            }
            None => {
                tracing::warn!(
                    path = %self.parent_path.display(),
                    timeout_ms = self.close_timeout.as_millis() as u64,
                    "backend busy at close timeout; left open"
                );
                false
            }
        };

        let report = CloseReport {
            cancelled_pending,
            abandoned,
            timed_out: timed_out || !backend_closed,
            backend_closed,
            metrics: self.metrics.snapshot(),
        };

        tracing::info!(
            backend = self.backend_name,
            path = %self.parent_path.display(),
            persisted = report.metrics.persisted,
            failed = report.metrics.failed,
            "WAL writer closed"
        );
        Ok(report)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn durability(&self) -> Durability {
        self.mode
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    pub fn parent_path(&self) -> &Path {
        &self.parent_path
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        tracing::debug!(path = %self.parent_path.display(), "WAL writer dropped without close");
        if let Err(e) = self.close() {
            tracing::error!(path = %self.parent_path.display(), "failed to close WAL writer: {}", e);
        }
    }
}

impl std::fmt::Debug for WalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalWriter")
            .field("backend", &self.backend_name)
            .field("parent_path", &self.parent_path)
            .field("mode", &self.mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryFileWriter, MemoryStore};
    use crate::config::PoolConfig;
    use crate::fs::LocalFileSystem;
    use crate::serializer::BincodeSerializer;
    use crossbeam::channel::{self, Receiver, Sender};
    use tempfile::tempdir;

    /// Backend that fails every write
    struct FailingBackend;

    impl FileWriter for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn set_block_size(&mut self, _block_size: u64) {}

        fn initialize(
            &mut self,
            _fs: Arc<dyn FileSystem>,
            _parent_path: &Path,
            _serializer: Arc<dyn Serializer>,
        ) -> Result<()> {
            Ok(())
        }

        fn write(&mut self, _record: &MapRecord) -> Result<()> {
            Err(Error::BackendWrite("disk full".into()))
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Backend that reports each write and blocks until released
    struct GatedBackend {
        started: Sender<u64>,
        release: Receiver<()>,
    }

    impl FileWriter for GatedBackend {
        fn name(&self) -> &'static str {
            "gated"
        }

        fn set_block_size(&mut self, _block_size: u64) {}

        fn initialize(
            &mut self,
            _fs: Arc<dyn FileSystem>,
            _parent_path: &Path,
            _serializer: Arc<dyn Serializer>,
        ) -> Result<()> {
            Ok(())
        }

        fn write(&mut self, record: &MapRecord) -> Result<()> {
            let _ = self.started.send(record.sequence());
            let _ = self.release.recv();
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn fs() -> Arc<dyn FileSystem> {
        Arc::new(LocalFileSystem::new("/nonexistent"))
    }

    fn storage(backend: &str) -> StorageConfig {
        StorageConfig {
            backend: backend.to_string(),
            ..Default::default()
        }
    }

    fn async_wal(threads: usize, queue: usize) -> WalConfig {
        WalConfig {
            mode: Durability::Async,
            close_timeout_ms: 5_000,
            pool: PoolConfig {
                min_threads: Some(threads),
                max_threads: Some(threads),
                queue_capacity: queue,
                ..Default::default()
            },
        }
    }

    fn record(seq: u64) -> MapRecord {
        MapRecord::put(seq, format!("k{}", seq), "String", "v", "String")
    }

    #[test]
    fn test_sync_failure_is_wrapped() {
        let registry = BackendRegistry::builder()
            .register("failing", || Box::new(FailingBackend))
            .build();
        let writer = WalWriter::open_with_registry(
            &registry,
            fs(),
            &storage("failing"),
            &WalConfig::default(),
            "maps/m",
            Arc::new(BincodeSerializer),
        )
        .unwrap();

        let err = writer.write(record(1)).unwrap_err();
        assert!(matches!(err, Error::WalWrite { .. }));
        assert!(matches!(err.root_cause(), Error::BackendWrite(_)));
        assert_eq!(writer.metrics().persisted, 0);
    }

    #[test]
    fn test_async_failure_goes_to_metrics() {
        let registry = BackendRegistry::builder()
            .register("failing", || Box::new(FailingBackend))
            .build();
        let mut wal = async_wal(1, 8);
        wal.pool.shutdown = ShutdownPolicy::Drain;
        let writer = WalWriter::open_with_registry(
            &registry,
            fs(),
            &storage("failing"),
            &wal,
            "maps/m",
            Arc::new(BincodeSerializer),
        )
        .unwrap();

        writer.write(record(1)).unwrap();
        writer.write(record(2)).unwrap();
        let pending = writer.pending.lock().clone().unwrap();
        assert_eq!(pending.wait(Duration::from_secs(5)), Some(TaskStatus::Completed));

        let metrics = writer.metrics();
        assert_eq!(metrics.submitted, 2);
        assert_eq!(metrics.failed, 2);
        assert_eq!(
            metrics.last_failure.as_deref(),
            Some("Backend write failed: disk full")
        );
    }

    #[test]
    fn test_close_cancels_pending_task() {
        let (started_tx, started_rx) = channel::unbounded();
        let (release_tx, release_rx) = channel::unbounded();
        let registry = BackendRegistry::builder()
            .register("gated", move || {
                Box::new(GatedBackend {
                    started: started_tx.clone(),
                    release: release_rx.clone(),
                })
            })
            .build();
        let writer = WalWriter::open_with_registry(
            &registry,
            fs(),
            &storage("gated"),
            &async_wal(1, 8),
            "maps/m",
            Arc::new(BincodeSerializer),
        )
        .unwrap();

        writer.write(record(1)).unwrap();
        assert_eq!(started_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        writer.write(record(2)).unwrap();
        writer.write(record(3)).unwrap();

        // the single worker is busy with record 1 until close is underway
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            release_tx.send(()).unwrap();
        });
        let report = writer.close().unwrap();
        releaser.join().unwrap();

        assert!(report.cancelled_pending);
        assert_eq!(report.abandoned, 1);
        assert!(!report.timed_out);
        assert_eq!(report.metrics.persisted, 1);
        assert!(started_rx.try_recv().is_err());
    }

    #[test]
    fn test_accessors_and_debug() {
        let store = MemoryStore::new();
        let registry = BackendRegistry::builder()
            .register("memory", move || Box::new(MemoryFileWriter::new(store.clone())))
            .build();
        let writer = WalWriter::open_with_registry(
            &registry,
            fs(),
            &storage("memory"),
            &WalConfig::default(),
            "maps/jobs",
            Arc::new(BincodeSerializer),
        )
        .unwrap();

        assert_eq!(writer.durability(), Durability::Sync);
        assert_eq!(writer.backend_name(), "memory");
        assert_eq!(writer.parent_path(), Path::new("maps/jobs"));
        assert!(format!("{:?}", writer).contains("maps/jobs"));
    }

    #[test]
    fn test_drop_closes_backend() {
        let store = MemoryStore::new();
        let shared = store.clone();
        let registry = BackendRegistry::builder()
            .register("memory", move || Box::new(MemoryFileWriter::new(shared.clone())))
            .build();

        let writer = WalWriter::open_with_registry(
            &registry,
            fs(),
            &storage("memory"),
            &WalConfig::default(),
            "maps/jobs",
            Arc::new(BincodeSerializer),
        )
        .unwrap();
        writer.write(record(1)).unwrap();
        assert!(store.is_held(Path::new("maps/jobs")));

        drop(writer);
        assert!(!store.is_held(Path::new("maps/jobs")));
    }

    #[test]
    fn test_durability_names() {
        assert_eq!(Durability::Async.to_string(), "async");
        let parsed: Durability = serde_json::from_str("\"SYNC\"").unwrap();
        assert_eq!(parsed, Durability::Sync);
    }

    #[test]
    fn test_segment_backend_end_to_end() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(dir.path()));
        let writer = WalWriter::open(
            fs.clone(),
            &StorageConfig {
                fsync: false,
                ..Default::default()
            },
            &WalConfig::default(),
            "maps/jobs",
            Arc::new(BincodeSerializer),
        )
        .unwrap();

        writer.write(record(1)).unwrap();
        writer.write(MapRecord::delete(2, "k1", "String")).unwrap();
        let report = writer.close().unwrap();
        assert_eq!(report.metrics.persisted, 2);

        let records = crate::backend::segment::read_records(
            fs.as_ref(),
            Path::new("maps/jobs"),
            &BincodeSerializer,
        )
        .unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[1].is_delete());
    }
}
