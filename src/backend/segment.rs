//! Segment Backend
//!
//! The default on-disk format: a directory of checksummed, append-only
//! segment files (see [`crate::wal::segment`]) rotated by block size.
//! Each writer holds the directory's `LOCK` file while open and always
//! starts a fresh segment after the highest one already present.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{needs_rotation, FileWriter};
use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::fs::{DirLock, FileSystem};
use crate::serializer::Serializer;
use crate::wal::record::MapRecord;
use crate::wal::segment::{list_segments, read_segment, segment_file_name, Segment};

/// Registered name of this backend
pub const NAME: &str = "segment";

/// State that exists once the backend is initialized
struct OpenLog {
    fs: Arc<dyn FileSystem>,
    dir: PathBuf,
    serializer: Arc<dyn Serializer>,
    current: Segment,
    segments_started: u64,
    _lock: Box<dyn DirLock>,
}

impl OpenLog {
    fn rotate(&mut self, compression: bool) -> Result<()> {
        let sealed = self.current.index();
        if self.current.is_poisoned() {
            // left unsealed; readers see its partial frame as a torn tail
            tracing::warn!(
                segment = %self.current.path().display(),
                "abandoning segment after failed append"
            );
        } else {
            self.current
                .seal()
                .map_err(|e| write_error(e, self.current.path()))?;
        }

        let index = sealed + 1;
        let path = self.dir.join(segment_file_name(index));
        self.current = Segment::create(
            self.fs.as_ref(),
            path.clone(),
            index,
            self.serializer.version(),
            compression,
        )
        .map_err(|e| write_error(e, &path))?;
        self.segments_started += 1;

        tracing::debug!(
            dir = %self.dir.display(),
            sealed,
            next = index,
            "rotated WAL segment"
        );
        Ok(())
    }
}

/// [`FileWriter`] for the segment format
pub struct SegmentFileWriter {
    block_size: u64,
    compression: bool,
    fsync: bool,
    log: Option<OpenLog>,
    closed: bool,
}

impl Default for SegmentFileWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentFileWriter {
    pub fn new() -> Self {
        Self {
            block_size: u64::MAX,
            compression: false,
            fsync: true,
            log: None,
            closed: false,
        }
    }

    /// Index of the segment currently taking appends
    pub fn current_segment(&self) -> Option<u64> {
        self.log.as_ref().map(|log| log.current.index())
    }

    /// Segments this writer has created
    pub fn segments_started(&self) -> u64 {
        self.log.as_ref().map_or(0, |log| log.segments_started)
    }
}

/// Turn I/O failures during an append into backend write errors
fn write_error(err: Error, path: &Path) -> Error {
    match err {
        Error::Io(e) => Error::BackendWrite(format!("{}: {}", path.display(), e)),
        other => other,
    }
}

impl FileWriter for SegmentFileWriter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn configure(&mut self, config: &StorageConfig) {
        self.compression = config.compression;
        self.fsync = config.fsync;
    }

    fn set_block_size(&mut self, block_size: u64) {
        self.block_size = block_size;
    }

    fn initialize(
        &mut self,
        fs: Arc<dyn FileSystem>,
        parent_path: &Path,
        serializer: Arc<dyn Serializer>,
    ) -> Result<()> {
        if self.log.is_some() || self.closed {
            return Err(Error::Initialization(
                "segment backend initialized twice".into(),
            ));
        }

        let dir = parent_path.to_path_buf();
        let full_dir = fs.root().join(&dir);
        let init_error = |what: &str, e: &dyn std::fmt::Display| {
            Error::Initialization(format!("{} {}: {}", what, full_dir.display(), e))
        };

        fs.create_dir_all(&dir)
            .map_err(|e| init_error("cannot create WAL directory", &e))?;
        let lock = fs
            .lock(&dir)
            .map_err(|e| init_error("cannot lock WAL directory", &e))?;

        let existing = list_segments(fs.as_ref(), &dir)
            .map_err(|e| init_error("cannot list WAL directory", &e))?;
        let index = existing.last().map_or(0, |(index, _)| index + 1);

        let current = Segment::create(
            fs.as_ref(),
            dir.join(segment_file_name(index)),
            index,
            serializer.version(),
            self.compression,
        )
        .map_err(|e| init_error("cannot create segment in", &e))?;

        tracing::info!(
            dir = %full_dir.display(),
            existing_segments = existing.len(),
            segment = index,
            block_size = self.block_size,
            compression = self.compression,
            serializer = serializer.name(),
            "segment backend initialized"
        );

        self.log = Some(OpenLog {
            fs,
            dir,
            serializer,
            current,
            segments_started: 1,
            _lock: lock,
        });
        Ok(())
    }

    fn write(&mut self, record: &MapRecord) -> Result<()> {
        if self.closed {
            return Err(Error::ClosedResource("segment backend"));
        }
        let log = self
            .log
            .as_mut()
            .ok_or_else(|| Error::BackendWrite("segment backend not initialized".into()))?;

        let payload = log.serializer.serialize(record)?;

        if log.current.is_poisoned()
            || needs_rotation(log.current.data_bytes(), payload.len() as u64, self.block_size)
        {
            log.rotate(self.compression)?;
        }

        let segment = &mut log.current;
        segment
            .append(&payload, self.fsync)
            .map_err(|e| write_error(e, segment.path()))?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::ClosedResource("segment backend"));
        }
        self.closed = true;

        if let Some(mut log) = self.log.take() {
            log.current
                .seal()
                .map_err(|e| write_error(e, log.current.path()))?;
            tracing::info!(
                dir = %log.fs.root().join(&log.dir).display(),
                last_segment = log.current.index(),
                segments_started = log.segments_started,
                "segment backend closed"
            );
        }
        Ok(())
    }
}

/// Decode every record under `dir`, oldest segment first.
///
/// Used for inspection; a torn tail in the newest segment is skipped.
pub fn read_records(
    fs: &dyn FileSystem,
    dir: &Path,
    serializer: &dyn Serializer,
) -> Result<Vec<MapRecord>> {
    let mut records = Vec::new();
    for (_, path) in list_segments(fs, dir)? {
        let contents = read_segment(fs, &path)?;
        if contents.torn_tail {
            tracing::warn!(segment = %path.display(), "segment ends in a partial frame");
        }
        for (_, payload) in contents.payloads {
            records.push(serializer.deserialize(&payload)?);
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{AppendFile, LocalFileSystem};
    use crate::serializer::{BincodeSerializer, JsonSerializer};
    use parking_lot::Mutex;
    use std::io::{self, Write};
    use tempfile::tempdir;

    /// Failures to inject into the next append
    #[derive(Debug, Default)]
    struct Faults {
        /// Accept this many bytes, then fail with "no space left"
        short_write: Option<usize>,
        fail_sync: bool,
        fail_truncate: bool,
    }

    /// Local filesystem whose files fail on demand
    #[derive(Debug)]
    struct FaultyFileSystem {
        inner: LocalFileSystem,
        faults: Arc<Mutex<Faults>>,
    }

    struct FaultyFile {
        inner: Box<dyn AppendFile>,
        faults: Arc<Mutex<Faults>>,
    }

    fn no_space() -> io::Error {
        io::Error::new(io::ErrorKind::Other, "no space left on device")
    }

    impl Write for FaultyFile {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut faults = self.faults.lock();
            match faults.short_write {
                Some(0) => {
                    faults.short_write = None;
                    Err(no_space())
                }
                Some(allowed) => {
                    let n = self.inner.write(&buf[..allowed.min(buf.len())])?;
                    faults.short_write = Some(allowed - n);
                    Ok(n)
                }
                None => self.inner.write(buf),
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    impl AppendFile for FaultyFile {
        fn sync(&mut self) -> io::Result<()> {
            if std::mem::take(&mut self.faults.lock().fail_sync) {
                return Err(io::Error::new(io::ErrorKind::Other, "fsync failed"));
            }
            self.inner.sync()
        }

        fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
            self.inner.write_at(offset, data)
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            if self.faults.lock().fail_truncate {
                return Err(no_space());
            }
            self.inner.truncate(len)
        }
    }

    impl FileSystem for FaultyFileSystem {
        fn root(&self) -> &Path {
            self.inner.root()
        }

        fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
            self.inner.create_dir_all(dir)
        }

        fn create(&self, path: &Path) -> io::Result<Box<dyn AppendFile>> {
            Ok(Box::new(FaultyFile {
                inner: self.inner.create(path)?,
                faults: Arc::clone(&self.faults),
            }))
        }

        fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
            self.inner.list(dir)
        }

        fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
            self.inner.read(path)
        }

        fn exists(&self, path: &Path) -> bool {
            self.inner.exists(path)
        }

        fn lock(&self, dir: &Path) -> io::Result<Box<dyn crate::fs::DirLock>> {
            self.inner.lock(dir)
        }
    }

    fn faulty(root: &Path) -> (Arc<dyn FileSystem>, Arc<Mutex<Faults>>) {
        let faults = Arc::new(Mutex::new(Faults::default()));
        let fs = FaultyFileSystem {
            inner: LocalFileSystem::new(root),
            faults: Arc::clone(&faults),
        };
        (Arc::new(fs), faults)
    }

    fn sequences(fs: &Arc<dyn FileSystem>) -> Vec<u64> {
        read_records(fs.as_ref(), Path::new("maps/jobs"), &BincodeSerializer)
            .unwrap()
            .iter()
            .map(|r| r.sequence())
            .collect()
    }

    fn open(
        fs: &Arc<dyn FileSystem>,
        block_size: u64,
        compression: bool,
    ) -> Result<SegmentFileWriter> {
        let mut writer = SegmentFileWriter::new();
        writer.configure(&StorageConfig {
            compression,
            fsync: false,
            ..Default::default()
        });
        writer.set_block_size(block_size);
        writer.initialize(fs.clone(), Path::new("maps/jobs"), Arc::new(BincodeSerializer))?;
        Ok(writer)
    }

    fn record(seq: u64, value_len: usize) -> MapRecord {
        MapRecord::put(seq, format!("key-{}", seq), "String", vec![b'x'; value_len], "Bytes")
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(dir.path()));

        let mut writer = open(&fs, 1024 * 1024, false).unwrap();
        writer.write(&record(1, 8)).unwrap();
        writer.write(&MapRecord::delete(2, "key-1", "String")).unwrap();
        writer.close().unwrap();

        let records = read_records(fs.as_ref(), Path::new("maps/jobs"), &BincodeSerializer).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key(), b"key-1");
        assert!(records[1].is_delete());
    }

    #[test]
    fn test_rotates_on_block_size() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(dir.path()));
        let size = BincodeSerializer.serialize(&record(1, 100)).unwrap().len() as u64;

        // two records fit, the third starts a new segment
        let mut writer = open(&fs, size * 2, false).unwrap();
        for seq in 1..=5 {
            writer.write(&record(seq, 100)).unwrap();
        }
        assert_eq!(writer.current_segment(), Some(2));
        assert_eq!(writer.segments_started(), 3);
        writer.close().unwrap();

        let segments = list_segments(fs.as_ref(), Path::new("maps/jobs")).unwrap();
        let counts: Vec<usize> = segments
            .iter()
            .map(|(_, path)| read_segment(fs.as_ref(), path).unwrap().payloads.len())
            .collect();
        assert_eq!(counts, vec![2, 2, 1]);
        assert!(segments
            .iter()
            .all(|(_, path)| read_segment(fs.as_ref(), path).unwrap().header.sealed));
    }

    #[test]
    fn test_oversized_record_gets_own_segment() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(dir.path()));

        let mut writer = open(&fs, 256, false).unwrap();
        writer.write(&record(1, 4)).unwrap();
        writer.write(&record(2, 4096)).unwrap();
        writer.write(&record(3, 4)).unwrap();
        writer.close().unwrap();

        let segments = list_segments(fs.as_ref(), Path::new("maps/jobs")).unwrap();
        assert_eq!(segments.len(), 3);
        let middle = read_segment(fs.as_ref(), &segments[1].1).unwrap();
        assert_eq!(middle.payloads.len(), 1);
        assert!(middle.payloads[0].1.len() > 4096);
    }

    #[test]
    fn test_compressed_segments_read_back() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(dir.path()));

        let mut writer = open(&fs, 1024 * 1024, true).unwrap();
        writer.write(&record(1, 2048)).unwrap();
        writer.close().unwrap();

        let records = read_records(fs.as_ref(), Path::new("maps/jobs"), &BincodeSerializer).unwrap();
        assert_eq!(records[0].value().map(|v| v.len()), Some(2048));
    }

    #[test]
    fn test_reopen_starts_after_existing_segments() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(dir.path()));

        let mut first = open(&fs, 1024, false).unwrap();
        first.write(&record(1, 8)).unwrap();
        first.close().unwrap();

        let mut second = open(&fs, 1024, false).unwrap();
        assert_eq!(second.current_segment(), Some(1));
        second.write(&record(2, 8)).unwrap();
        second.close().unwrap();

        let records = read_records(fs.as_ref(), Path::new("maps/jobs"), &BincodeSerializer).unwrap();
        let sequences: Vec<u64> = records.iter().map(|r| r.sequence()).collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[test]
    fn test_second_writer_on_same_dir_fails() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(dir.path()));

        let mut first = open(&fs, 1024, false).unwrap();
        let err = open(&fs, 1024, false).err().unwrap();
        assert!(matches!(err, Error::Initialization(_)));

        first.close().unwrap();
        assert!(open(&fs, 1024, false).is_ok());
    }

    #[test]
    fn test_write_after_close_fails() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(dir.path()));

        let mut writer = open(&fs, 1024, false).unwrap();
        writer.close().unwrap();
        assert!(matches!(writer.write(&record(1, 1)), Err(Error::ClosedResource(_))));
        assert!(matches!(writer.close(), Err(Error::ClosedResource(_))));
    }

    #[test]
    fn test_short_write_is_cut_back() {
        let dir = tempdir().unwrap();
        let (fs, faults) = faulty(dir.path());

        let mut writer = open(&fs, 1024 * 1024, false).unwrap();
        writer.write(&record(1, 8)).unwrap();

        faults.lock().short_write = Some(3);
        let err = writer.write(&record(2, 8)).unwrap_err();
        assert!(matches!(err, Error::BackendWrite(ref msg) if msg.contains("no space left")));

        writer.write(&record(3, 8)).unwrap();
        assert_eq!(writer.current_segment(), Some(0));
        writer.close().unwrap();

        assert_eq!(sequences(&fs), vec![1, 3]);
        let segments = list_segments(fs.as_ref(), Path::new("maps/jobs")).unwrap();
        let contents = read_segment(fs.as_ref(), &segments[0].1).unwrap();
        assert!(!contents.torn_tail);
        assert_eq!(contents.header.record_count, 2);
    }

    #[test]
    fn test_failed_sync_is_cut_back() {
        let dir = tempdir().unwrap();
        let (fs, faults) = faulty(dir.path());

        let mut writer = SegmentFileWriter::new();
        writer.set_block_size(1024 * 1024);
        writer
            .initialize(fs.clone(), Path::new("maps/jobs"), Arc::new(BincodeSerializer))
            .unwrap();
        writer.write(&record(1, 8)).unwrap();

        faults.lock().fail_sync = true;
        assert!(writer.write(&record(2, 8)).is_err());
        writer.write(&record(3, 8)).unwrap();
        writer.close().unwrap();

        assert_eq!(sequences(&fs), vec![1, 3]);
    }

    #[test]
    fn test_unrecoverable_append_moves_to_new_segment() {
        let dir = tempdir().unwrap();
        let (fs, faults) = faulty(dir.path());

        let mut writer = open(&fs, 1024 * 1024, false).unwrap();
        writer.write(&record(1, 8)).unwrap();

        {
            let mut faults = faults.lock();
            faults.short_write = Some(3);
            faults.fail_truncate = true;
        }
        assert!(writer.write(&record(2, 8)).is_err());

        writer.write(&record(3, 8)).unwrap();
        assert_eq!(writer.current_segment(), Some(1));
        writer.close().unwrap();

        assert_eq!(sequences(&fs), vec![1, 3]);
        let segments = list_segments(fs.as_ref(), Path::new("maps/jobs")).unwrap();
        let abandoned = read_segment(fs.as_ref(), &segments[0].1).unwrap();
        assert!(abandoned.torn_tail);
        assert!(!abandoned.header.sealed);
        assert!(read_segment(fs.as_ref(), &segments[1].1).unwrap().header.sealed);
    }

    #[test]
    fn test_write_before_initialize_fails() {
        let mut writer = SegmentFileWriter::new();
        assert!(matches!(writer.write(&record(1, 1)), Err(Error::BackendWrite(_))));
    }

    #[test]
    fn test_reader_must_match_serializer() {
        let dir = tempdir().unwrap();
        let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(dir.path()));

        let mut writer = open(&fs, 1024, false).unwrap();
        writer.write(&record(1, 8)).unwrap();
        writer.close().unwrap();

        let err = read_records(fs.as_ref(), Path::new("maps/jobs"), &JsonSerializer).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
