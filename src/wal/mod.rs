//! Write-Ahead Log Module
//!
//! Records, the on-disk segment format and the writer that ties a backend to
//! one map's log.

pub mod record;
pub mod segment;
pub mod writer;

pub use record::{MapRecord, Operation, SeqNo};
pub use segment::{read_segment, SegmentContents, SegmentHeader};
pub use writer::{CloseReport, Durability, WalWriter};
