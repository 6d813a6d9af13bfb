//! WAL Record Types
//!
//! Defines the map mutation records that are written to the WAL.

use serde::{Deserialize, Serialize};

/// Logical sequence number used to order records on replay
pub type SeqNo = u64;

/// Kind of mutation a record carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Insert or overwrite the entry
    Put,
    /// Remove the entry
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Put => write!(f, "put"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// One mutation of the replicated map.
///
/// Key and value are opaque bytes produced by the map layer; the class names
/// tell the map layer which decoder to use when it reads them back. A record
/// is immutable once built: fields are private and the writer takes it by
/// value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapRecord {
    operation: Operation,
    key: Vec<u8>,
    key_class: String,
    value: Option<Vec<u8>>,
    value_class: String,
    /// Milliseconds since the Unix epoch when the record was created
    timestamp: i64,
    sequence: SeqNo,
}

impl MapRecord {
    /// Create a put record stamped with the current time
    pub fn put(
        sequence: SeqNo,
        key: impl Into<Vec<u8>>,
        key_class: impl Into<String>,
        value: impl Into<Vec<u8>>,
        value_class: impl Into<String>,
    ) -> Self {
        Self {
            operation: Operation::Put,
            key: key.into(),
            key_class: key_class.into(),
            value: Some(value.into()),
            value_class: value_class.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            sequence,
        }
    }

    /// Create a delete record stamped with the current time
    pub fn delete(sequence: SeqNo, key: impl Into<Vec<u8>>, key_class: impl Into<String>) -> Self {
        Self {
            operation: Operation::Delete,
            key: key.into(),
            key_class: key_class.into(),
            value: None,
            value_class: String::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            sequence,
        }
    }

    /// Replace the creation timestamp (used when re-logging an existing mutation)
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Delete
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn key_class(&self) -> &str {
        &self.key_class
    }

    /// The value bytes, `None` for deletes
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn value_class(&self) -> &str {
        &self.value_class
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn sequence(&self) -> SeqNo {
        self.sequence
    }

    /// Check the put/value pairing, which a decoded record may violate
    pub fn is_well_formed(&self) -> bool {
        match self.operation {
            Operation::Put => self.value.is_some(),
            Operation::Delete => self.value.is_none(),
        }
    }
}

impl std::fmt::Display for MapRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} #{} key={} ({} bytes, {})",
            self.operation,
            self.sequence,
            String::from_utf8_lossy(&self.key),
            self.value.as_ref().map_or(0, |v| v.len()),
            self.key_class,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_carries_value() {
        let record = MapRecord::put(7, "job-1", "java.lang.Long", b"RUNNING".to_vec(), "JobStatus");
        assert_eq!(record.operation(), Operation::Put);
        assert_eq!(record.value(), Some(&b"RUNNING"[..]));
        assert_eq!(record.sequence(), 7);
        assert!(record.timestamp() > 0);
        assert!(record.is_well_formed());
    }

    #[test]
    fn test_delete_has_no_value() {
        let record = MapRecord::delete(8, "job-1", "java.lang.Long");
        assert!(record.is_delete());
        assert_eq!(record.value(), None);
        assert_eq!(record.value_class(), "");
        assert!(record.is_well_formed());
    }

    #[test]
    fn test_display() {
        let record = MapRecord::put(3, "k", "String", vec![1, 2, 3], "Bytes").with_timestamp(10);
        assert_eq!(record.to_string(), "put #3 key=k (3 bytes, String)");
        assert_eq!(record.timestamp(), 10);
    }
}
