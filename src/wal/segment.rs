//! WAL Segment Files
//!
//! On-disk layout of one segment of the `segment` backend:
//!
//! ```text
//! [header: 32 bytes]
//! [len: u32 LE][flags: u8][payload: len bytes][crc32(payload): u32 LE]
//! [len: u32 LE][flags: u8][payload: len bytes][crc32(payload): u32 LE]
//! ...
//! ```
//!
//! A payload is one serialized record, LZ4-compressed when flag bit 0 is set.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::fs::{AppendFile, FileSystem};

/// Magic bytes at the start of each segment file
const SEGMENT_MAGIC: &[u8; 8] = b"MAPWAL01";

/// Segment file version
const SEGMENT_VERSION: u32 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Length prefix + flags + checksum around each payload
pub const FRAME_OVERHEAD: usize = 4 + 1 + 4;

const FLAG_COMPRESSED: u8 = 0b01;
const FLAG_SEALED: u8 = 0b10;

/// Segment file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Position of this segment in the log
    pub index: u64,
    /// Version of the serializer that produced the payloads
    pub serializer_version: u8,
    /// Whether payloads are LZ4-compressed
    pub compressed: bool,
    /// Whether the segment was closed cleanly (no more writes)
    pub sealed: bool,
    /// Number of records, valid once sealed; saturates at `u32::MAX`
    pub record_count: u32,
}

impl SegmentHeader {
    pub fn new(index: u64, serializer_version: u8, compressed: bool) -> Self {
        Self {
            index,
            serializer_version,
            compressed,
            sealed: false,
            record_count: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut flags = 0u8;
        if self.compressed {
            flags |= FLAG_COMPRESSED;
        }
        if self.sealed {
            flags |= FLAG_SEALED;
        }

        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(SEGMENT_MAGIC);
        bytes[8..12].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        bytes[12..20].copy_from_slice(&self.index.to_le_bytes());
        bytes[20] = self.serializer_version;
        bytes[21] = flags;
        bytes[22..26].copy_from_slice(&self.record_count.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Serialization("segment header too short".into()));
        }

        if &bytes[0..8] != SEGMENT_MAGIC {
            return Err(Error::Serialization("invalid segment magic bytes".into()));
        }

        let version = u32::from_le_bytes(le_array(&bytes[8..12]));
        if version != SEGMENT_VERSION {
            return Err(Error::Serialization(format!(
                "unsupported segment version: {}",
                version
            )));
        }

        let flags = bytes[21];
        Ok(Self {
            index: u64::from_le_bytes(le_array(&bytes[12..20])),
            serializer_version: bytes[20],
            compressed: flags & FLAG_COMPRESSED != 0,
            sealed: flags & FLAG_SEALED != 0,
            record_count: u32::from_le_bytes(le_array(&bytes[22..26])),
        })
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// File name of the segment at `index`
pub fn segment_file_name(index: u64) -> String {
    format!("wal_{:020}.log", index)
}

/// Parse the index out of a segment file name
pub fn parse_segment_index(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix("wal_")?
        .strip_suffix(".log")?
        .parse()
        .ok()
}

/// List segment files under `dir`, ordered by index
pub fn list_segments(fs: &dyn FileSystem, dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments: Vec<(u64, PathBuf)> = fs
        .list(dir)?
        .into_iter()
        .filter_map(|path| parse_segment_index(&path).map(|index| (index, path)))
        .collect();
    segments.sort_by_key(|(index, _)| *index);
    Ok(segments)
}

/// A segment open for appending
pub struct Segment {
    path: PathBuf,
    file: Box<dyn AppendFile>,
    header: SegmentHeader,
    /// Bytes written so far, header included
    write_pos: u64,
    /// Sum of uncompressed payload sizes; drives rotation
    data_bytes: u64,
    /// A failed append could not be rolled back; the tail is garbage
    poisoned: bool,
}

impl Segment {
    /// Create a new segment file and write its header
    pub fn create(
        fs: &dyn FileSystem,
        path: PathBuf,
        index: u64,
        serializer_version: u8,
        compressed: bool,
    ) -> Result<Self> {
        let mut file = fs.create(&path)?;
        let header = SegmentHeader::new(index, serializer_version, compressed);
        file.write_all(&header.to_bytes())?;
        // a later cut back must never reach into the header
        file.flush()?;

        Ok(Self {
            path,
            file,
            header,
            write_pos: HEADER_SIZE as u64,
            data_bytes: 0,
            poisoned: false,
        })
    }

    /// Append one serialized record, syncing it when asked; returns the
    /// frame offset.
    ///
    /// On failure the file is cut back to the end of the previous frame, so
    /// later appends never land behind a partial one. If that cut fails too
    /// the segment is poisoned and refuses further appends.
    pub fn append(&mut self, payload: &[u8], sync: bool) -> Result<u64> {
        if self.poisoned {
            return Err(Error::BackendWrite(format!(
                "{}: segment has an unrecoverable partial frame",
                self.path.display()
            )));
        }

        let frame = encode_frame(payload, self.header.compressed)?;
        let written = self
            .file
            .write_all(&frame)
            .and_then(|()| self.file.flush())
            .and_then(|()| if sync { self.file.sync() } else { Ok(()) });

        if let Err(e) = written {
            self.roll_back();
            return Err(e.into());
        }

        let offset = self.write_pos;
        self.write_pos += frame.len() as u64;
        self.data_bytes += payload.len() as u64;
        self.header.record_count = self.header.record_count.saturating_add(1);
        Ok(offset)
    }

    fn roll_back(&mut self) {
        if let Err(e) = self.file.truncate(self.write_pos) {
            tracing::warn!(
                segment = %self.path.display(),
                "cannot cut back failed append: {}",
                e
            );
            self.poisoned = true;
        }
    }

    /// Force appended frames to stable storage
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync()?;
        Ok(())
    }

    /// Record the final count in the header and sync
    pub fn seal(&mut self) -> Result<()> {
        self.header.sealed = true;
        self.file.write_at(0, &self.header.to_bytes())?;
        self.sync()
    }

    pub fn index(&self) -> u64 {
        self.header.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_count(&self) -> u32 {
        self.header.record_count
    }

    pub fn data_bytes(&self) -> u64 {
        self.data_bytes
    }

    pub fn file_len(&self) -> u64 {
        self.write_pos
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}

/// Frame one payload, compressing it when asked
pub fn encode_frame(payload: &[u8], compress: bool) -> Result<Vec<u8>> {
    let (flags, data) = if compress {
        (FLAG_COMPRESSED, lz4_flex::compress_prepend_size(payload))
    } else {
        (0, payload.to_vec())
    };

    let len = u32::try_from(data.len())
        .map_err(|_| Error::Serialization(format!("record too large: {} bytes", data.len())))?;

    let mut frame = Vec::with_capacity(FRAME_OVERHEAD + data.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.push(flags);
    frame.extend_from_slice(&data);
    frame.extend_from_slice(&crc32fast::hash(&data).to_le_bytes());
    Ok(frame)
}

/// Decoded contents of one segment file
#[derive(Debug)]
pub struct SegmentContents {
    pub header: SegmentHeader,
    /// (offset, serialized record) in append order
    pub payloads: Vec<(u64, Vec<u8>)>,
    /// The file ends in an incomplete frame (interrupted append)
    pub torn_tail: bool,
}

/// Read every frame of a segment for inspection.
///
/// A checksum mismatch is an error; a short frame at the very end is
/// reported through `torn_tail` instead.
pub fn read_segment(fs: &dyn FileSystem, path: &Path) -> Result<SegmentContents> {
    let bytes = fs.read(path)?;
    let header = SegmentHeader::from_bytes(&bytes)?;
    let corrupted = |offset: usize, reason: String| Error::Corrupted {
        segment: path.display().to_string(),
        offset: offset as u64,
        reason,
    };

    let mut payloads = Vec::new();
    let mut pos = HEADER_SIZE;
    let mut torn_tail = false;

    while pos < bytes.len() {
        if bytes.len() - pos < FRAME_OVERHEAD {
            torn_tail = true;
            break;
        }

        let len = u32::from_le_bytes(le_array(&bytes[pos..pos + 4])) as usize;
        let flags = bytes[pos + 4];
        let data_start = pos + 5;
        let data_end = data_start + len;
        if data_end + 4 > bytes.len() {
            torn_tail = true;
            break;
        }

        let data = &bytes[data_start..data_end];
        let stored = u32::from_le_bytes(le_array(&bytes[data_end..data_end + 4]));
        if stored != crc32fast::hash(data) {
            return Err(corrupted(pos, "checksum mismatch".into()));
        }

        let payload = if flags & FLAG_COMPRESSED != 0 {
            lz4_flex::decompress_size_prepended(data)
                .map_err(|e| corrupted(pos, format!("decompression failed: {}", e)))?
        } else {
            data.to_vec()
        };

        payloads.push((pos as u64, payload));
        pos = data_end + 4;
    }

    Ok(SegmentContents {
        header,
        payloads,
        torn_tail,
    })
}
