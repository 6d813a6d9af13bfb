//! MapWAL - Pluggable Write-Ahead Log for Replicated Maps
//!
//! Persists put/delete mutations of an in-memory key-value map so the map can
//! be rebuilt after a restart. Every mutation becomes a [`MapRecord`] that a
//! [`WalWriter`] hands to a storage-format backend, either inline or on a
//! bounded background worker pool.
//!
//! # Architecture
//!
//! - **Writer** ([`wal::writer`]): one per map; chooses `Sync` or `Async`
//!   durability and owns the worker pool in async mode.
//! - **Backends** ([`backend`]): named on-disk formats behind the
//!   [`FileWriter`](backend::FileWriter) trait, discovered through a
//!   write-once registry.
//! - **Serializers** ([`serializer`]): deterministic, versioned record
//!   encodings (bincode, JSON).
//!
//! # Features
//!
//! - Checksummed segment files with size-based rotation and optional LZ4
//! - Exclusive directory lock per log
//! - Bounded worker pool with abort, block and discard rejection policies
//! - Explicit close policy for queued async writes
//! - Write metrics in place of silently dropped async failures

pub mod backend;
pub mod config;
pub mod error;
pub mod fs;
pub mod metrics;
pub mod pool;
pub mod sequence;
pub mod serializer;
pub mod tuning;
pub mod wal;

pub use config::MapWalConfig;
pub use error::{Error, Result};
pub use wal::{CloseReport, Durability, MapRecord, WalWriter};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::backend::{BackendRegistry, FileWriter};
    pub use crate::config::MapWalConfig;
    pub use crate::error::{Error, Result};
    pub use crate::fs::{FileSystem, LocalFileSystem};
    pub use crate::sequence::SequenceGenerator;
    pub use crate::serializer::{BincodeSerializer, JsonSerializer, Serializer};
    pub use crate::wal::{CloseReport, Durability, MapRecord, Operation, WalWriter};
}
