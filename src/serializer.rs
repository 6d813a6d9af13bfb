//! Record Serializers
//!
//! A serializer turns a [`MapRecord`] into the bytes a backend appends and
//! back. Encodings are deterministic: backends size segments by encoded
//! length, so the same record must always produce the same bytes.

use crate::error::{Error, Result};
use crate::wal::record::MapRecord;

/// Reversible, versioned binary encoding of map records
pub trait Serializer: Send + Sync {
    /// Short name recorded in segment headers and logs
    fn name(&self) -> &'static str;

    /// Encoding version, bumped whenever the byte layout changes
    fn version(&self) -> u8;

    fn serialize(&self, record: &MapRecord) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> Result<MapRecord>;
}

/// Compact bincode encoding, prefixed with a one-byte version tag
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeSerializer;

impl BincodeSerializer {
    pub const VERSION: u8 = 1;
}

impl Serializer for BincodeSerializer {
    fn name(&self) -> &'static str {
        "bincode"
    }

    fn version(&self) -> u8 {
        Self::VERSION
    }

    fn serialize(&self, record: &MapRecord) -> Result<Vec<u8>> {
        let body_len = bincode::serialized_size(record)? as usize;
        let mut bytes = Vec::with_capacity(1 + body_len);
        bytes.push(Self::VERSION);
        bincode::serialize_into(&mut bytes, record)?;
        Ok(bytes)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<MapRecord> {
        let (version, body) = bytes
            .split_first()
            .ok_or_else(|| Error::Serialization("empty record payload".into()))?;

        match *version {
            Self::VERSION => {
                let record: MapRecord = bincode::deserialize(body)?;
                check_well_formed(record)
            }
            v => Err(Error::Serialization(format!(
                "unsupported bincode record version: {}",
                v
            ))),
        }
    }
}

/// JSON encoding, slower but readable with standard tools
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn version(&self) -> u8 {
        1
    }

    fn serialize(&self, record: &MapRecord) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(record)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<MapRecord> {
        let record: MapRecord = serde_json::from_slice(bytes)?;
        check_well_formed(record)
    }
}

fn check_well_formed(record: MapRecord) -> Result<MapRecord> {
    if record.is_well_formed() {
        Ok(record)
    } else {
        Err(Error::Serialization(format!(
            "{} record #{} has inconsistent value",
            record.operation(),
            record.sequence()
        )))
    }
}

/// Look up a built-in serializer by name
pub fn by_name(name: &str) -> Result<std::sync::Arc<dyn Serializer>> {
    match name {
        "bincode" => Ok(std::sync::Arc::new(BincodeSerializer)),
        "json" => Ok(std::sync::Arc::new(JsonSerializer)),
        other => Err(Error::Config(format!("unknown serializer: {}", other))),
    }
}
