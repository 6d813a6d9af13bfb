//! Backend Registry
//!
//! Maps backend names to factories. The process-wide registry is built once
//! on first use and is read-only afterwards.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use super::memory::{self, MemoryFileWriter, MemoryStore};
use super::segment::{self, SegmentFileWriter};
use super::FileWriter;
use crate::error::{Error, Result};

/// Builds a fresh, unconfigured backend instance
pub type BackendFactory = Arc<dyn Fn() -> Box<dyn FileWriter> + Send + Sync>;

static GLOBAL: OnceLock<BackendRegistry> = OnceLock::new();

/// Name to factory table
#[derive(Clone)]
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.names())
            .finish()
    }
}

/// Collects factories before freezing them into a [`BackendRegistry`]
#[derive(Default)]
pub struct RegistryBuilder {
    factories: BTreeMap<String, BackendFactory>,
}

impl RegistryBuilder {
    /// Add a backend; a later registration under the same name wins
    pub fn register<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn FileWriter> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn build(self) -> BackendRegistry {
        BackendRegistry {
            factories: self.factories,
        }
    }
}

impl BackendRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Registry holding the backends that ship with the crate
    pub fn builtin() -> Self {
        Self::builder()
            .register(segment::NAME, || Box::new(SegmentFileWriter::new()))
            .register(memory::NAME, || Box::new(MemoryFileWriter::new(MemoryStore::shared())))
            .build()
    }

    /// The process-wide registry, initialized with the built-ins on first use
    pub fn global() -> &'static BackendRegistry {
        GLOBAL.get_or_init(Self::builtin)
    }

    /// Replace the built-ins for this process.
    ///
    /// Only possible before anything has used [`BackendRegistry::global`].
    pub fn install(registry: BackendRegistry) -> Result<()> {
        GLOBAL.set(registry).map_err(|_| {
            Error::Config("backend registry is already initialized".into())
        })
    }

    /// Look up the factory for `name`
    pub fn resolve(&self, name: &str) -> Result<BackendFactory> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownBackend(name.to_string()))
    }

    /// Registered backend names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}
