//! Filesystem Handle
//!
//! Backends reach storage through a [`FileSystem`] rooted at a directory, so
//! the writer never touches paths outside the configured root.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

/// Name of the per-directory lock file
pub const LOCK_FILE: &str = "LOCK";

/// Append-only handle to a file created through a [`FileSystem`]
pub trait AppendFile: Write + Send {
    /// Flush buffers and force contents to stable storage
    fn sync(&mut self) -> io::Result<()>;

    /// Overwrite bytes at `offset` without moving the append position
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Drop unflushed bytes and cut the file back to `len`; appends resume there
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

/// Exclusive claim on a directory, released on drop
pub trait DirLock: Send + std::fmt::Debug {}

/// Open/create/list access to files under a root directory.
///
/// All paths are relative to [`FileSystem::root`].
pub trait FileSystem: Send + Sync + std::fmt::Debug {
    fn root(&self) -> &Path;

    fn create_dir_all(&self, dir: &Path) -> io::Result<()>;

    /// Create a new file; fails if it already exists
    fn create(&self, path: &Path) -> io::Result<Box<dyn AppendFile>>;

    /// List the files directly under `dir`, sorted by name
    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;

    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    fn exists(&self, path: &Path) -> bool;

    /// Take an exclusive lock on `dir`; `WouldBlock` if someone else holds it
    fn lock(&self, dir: &Path) -> io::Result<Box<dyn DirLock>>;
}

/// [`FileSystem`] over the local disk
#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    root: PathBuf,
}

impl LocalFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &Path) -> io::Result<PathBuf> {
        let escapes = path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
        if escapes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path {:?} escapes filesystem root", path),
            ));
        }
        Ok(self.root.join(path))
    }
}

impl FileSystem for LocalFileSystem {
    fn root(&self) -> &Path {
        &self.root
    }

    fn create_dir_all(&self, dir: &Path) -> io::Result<()> {
        std::fs::create_dir_all(self.resolve(dir)?)
    }

    fn create(&self, path: &Path) -> io::Result<Box<dyn AppendFile>> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.resolve(path)?)?;
        Ok(Box::new(LocalAppendFile {
            inner: BufWriter::new(file),
        }))
    }

    fn list(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let full = self.resolve(dir)?;
        let mut files = Vec::new();

        if !full.exists() {
            return Ok(files);
        }

        for entry in std::fs::read_dir(&full)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(dir.join(entry.file_name()));
            }
        }

        files.sort();
        Ok(files)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(self.resolve(path)?)
    }

    fn exists(&self, path: &Path) -> bool {
        self.resolve(path).map(|p| p.exists()).unwrap_or(false)
    }

    fn lock(&self, dir: &Path) -> io::Result<Box<dyn DirLock>> {
        let lock_path = self.resolve(dir)?.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)?;

        fs2::FileExt::try_lock_exclusive(&file).map_err(|e| {
            io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("{} is held by another writer: {}", lock_path.display(), e),
            )
        })?;

        // Owner note for operators; the advisory lock is what counts.
        file.set_len(0)?;
        writeln!(
            file,
            "pid={} writer={} since={}",
            std::process::id(),
            uuid::Uuid::new_v4(),
            chrono::Utc::now().to_rfc3339()
        )?;

        Ok(Box::new(LocalDirLock { file }))
    }
}

struct LocalAppendFile {
    inner: BufWriter<File>,
}

impl Write for LocalAppendFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl AppendFile for LocalAppendFile {
    fn sync(&mut self) -> io::Result<()> {
        self.inner.flush()?;
        self.inner.get_ref().sync_data()
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.inner.flush()?;
        write_all_at(self.inner.get_ref(), offset, data)
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        let file = self.inner.get_ref().try_clone()?;
        let stale = std::mem::replace(&mut self.inner, BufWriter::new(file));
        // into_parts hands back the buffer instead of flushing it
        let (_, _unflushed) = stale.into_parts();

        let file = self.inner.get_mut();
        file.set_len(len)?;
        file.seek(SeekFrom::Start(len))?;
        Ok(())
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, offset: u64, data: &[u8]) -> io::Result<()> {
    std::os::unix::fs::FileExt::write_all_at(file, data, offset)
}

#[cfg(not(unix))]
fn write_all_at(mut file: &File, offset: u64, data: &[u8]) -> io::Result<()> {
    let end = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    file.seek(SeekFrom::Start(end))?;
    Ok(())
}

#[derive(Debug)]
struct LocalDirLock {
    file: File,
}

impl DirLock for LocalDirLock {}

impl Drop for LocalDirLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            tracing::warn!("failed to release directory lock: {}", e);
        }
    }
}
