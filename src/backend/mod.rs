//! Storage-Format Backends
//!
//! A backend owns the physical representation of the log for one file
//! format. The writer picks one by name through the [`BackendRegistry`] and
//! drives it through the [`FileWriter`] capability trait.

pub mod memory;
pub mod registry;
pub mod segment;

pub use memory::{MemoryFileWriter, MemoryStore};
pub use registry::{BackendFactory, BackendRegistry};
pub use segment::SegmentFileWriter;

use std::path::Path;
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::error::Result;
use crate::fs::FileSystem;
use crate::serializer::Serializer;
use crate::wal::record::MapRecord;

/// One named on-disk log format.
///
/// Call order: [`configure`](Self::configure) and
/// [`set_block_size`](Self::set_block_size), then
/// [`initialize`](Self::initialize) exactly once, then any number of
/// [`write`](Self::write) calls, then [`close`](Self::close) once.
pub trait FileWriter: Send {
    /// Registered name of this format
    fn name(&self) -> &'static str;

    /// Apply format options from the storage configuration
    fn configure(&mut self, _config: &StorageConfig) {}

    /// Rotation threshold in bytes of serialized records per segment.
    ///
    /// Only affects segments started after the call.
    fn set_block_size(&mut self, block_size: u64);

    /// Open or create the log under `parent_path`.
    ///
    /// # Errors
    ///
    /// `Error::Initialization` if the target is inaccessible or held by
    /// another writer.
    fn initialize(
        &mut self,
        fs: Arc<dyn FileSystem>,
        parent_path: &Path,
        serializer: Arc<dyn Serializer>,
    ) -> Result<()>;

    /// Serialize and append one record, rotating first if the current
    /// segment cannot take it without passing the block size.
    ///
    /// # Errors
    ///
    /// `Error::Serialization` if the record cannot be encoded,
    /// `Error::BackendWrite` on I/O failure, `Error::ClosedResource` after
    /// close.
    fn write(&mut self, record: &MapRecord) -> Result<()>;

    /// Flush and release all segment handles
    fn close(&mut self) -> Result<()>;
}

/// Where the next record goes, given how full the current segment is.
///
/// A non-empty segment rotates when the record would push it past the block
/// size; an empty segment always takes the record, so an oversized record
/// gets a segment to itself instead of being split.
pub(crate) fn needs_rotation(segment_bytes: u64, record_bytes: u64, block_size: u64) -> bool {
    segment_bytes > 0 && segment_bytes + record_bytes > block_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_rule() {
        assert!(!needs_rotation(0, 10, 64));
        assert!(!needs_rotation(50, 14, 64));
        assert!(needs_rotation(50, 15, 64));
        // oversized record on an empty segment stays put
        assert!(!needs_rotation(0, 1000, 64));
        assert!(needs_rotation(1, 1000, 64));
    }
}
