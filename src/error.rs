//! MapWAL Error Types

use thiserror::Error;

/// Result type alias for MapWAL operations
pub type Result<T> = std::result::Result<T, Error>;

/// MapWAL error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Construction errors
    #[error("Backend initialization failed: {0}")]
    Initialization(String),

    #[error("Unknown WAL backend: {0}")]
    UnknownBackend(String),

    // Write path errors
    #[error("Backend write failed: {0}")]
    BackendWrite(String),

    #[error("WAL write failed: {source}")]
    WalWrite {
        #[source]
        source: Box<Error>,
    },

    #[error("Write rejected: worker queue full ({capacity} pending tasks)")]
    Rejected { capacity: usize },

    #[error("Resource already closed: {0}")]
    ClosedResource(&'static str),

    // Encoding errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Segment {segment} corrupted at offset {offset}: {reason}")]
    Corrupted {
        segment: String,
        offset: u64,
        reason: String,
    },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// Wrap a backend failure surfaced by a synchronous write
    pub fn wal_write(source: Error) -> Self {
        Error::WalWrite {
            source: Box::new(source),
        }
    }

    /// The innermost error, looking through `WalWrite` wrappers
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::WalWrite { source } => source.root_cause(),
            other => other,
        }
    }

    /// Check if the caller may reasonably retry the operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root_cause(),
            Error::BackendWrite(_) | Error::Io(_) | Error::Rejected { .. }
        )
    }

    /// Check if this error should abort construction or shut the writer down
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root_cause(),
            Error::Initialization(_)
                | Error::UnknownBackend(_)
                | Error::Config(_)
                | Error::ConfigParse(_)
                | Error::ClosedResource(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_cause_unwraps_nested_write_errors() {
        let err = Error::wal_write(Error::wal_write(Error::BackendWrite("disk full".into())));
        assert!(matches!(err.root_cause(), Error::BackendWrite(_)));
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_classification() {
        assert!(Error::UnknownBackend("hdfs".into()).is_fatal());
        assert!(Error::ClosedResource("wal writer").is_fatal());
        assert!(!Error::Serialization("bad".into()).is_retryable());
        assert!(Error::Rejected { capacity: 8 }.is_retryable());
    }

    #[test]
    fn test_display_includes_source() {
        let err = Error::wal_write(Error::BackendWrite("short write".into()));
        assert_eq!(
            err.to_string(),
            "WAL write failed: Backend write failed: short write"
        );
    }
}
