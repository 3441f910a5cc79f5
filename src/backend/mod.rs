//! Pluggable key/value persistence.
//!
//! Every store implements [`Backend`]. A [`BackendRegistry`] is built once at
//! process start and hands out the single active backend; asking it for a
//! different kind afterwards is a configuration error.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

pub mod consul;
pub mod file;
pub mod memory;
pub mod sqlite;

pub use consul::ConsulBackend;
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

pub type Result<T> = std::result::Result<T, BackendError>;

/// A key/value store. Implementations serialize their own writes.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Returns [`BackendError::NotFound`] for keys never written or deleted.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Values of every key starting with `prefix`, in no particular order.
    async fn get_prefixed(&self, prefix: &str) -> Result<Vec<Vec<u8>>>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    File,
    Sqlite,
    Consul,
}

impl BackendKind {
    /// Builds a fresh backend of this kind. `uri` is a directory for local
    /// stores and a base URL for consul; empty falls back to `data_dir`.
    pub fn construct(self, uri: &str, data_dir: &Path) -> Result<Arc<dyn Backend>> {
        let dir = if uri.is_empty() { data_dir } else { Path::new(uri) };
        let backend: Arc<dyn Backend> = match self {
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
            BackendKind::File => Arc::new(FileBackend::open(dir)?),
            BackendKind::Sqlite => Arc::new(SqliteBackend::open(dir)?),
            BackendKind::Consul => Arc::new(ConsulBackend::new(uri)?),
        };
        Ok(backend)
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendKind::Memory => "memory",
            BackendKind::File => "file",
            BackendKind::Sqlite => "sqlite",
            BackendKind::Consul => "consul",
        };
        f.write_str(s)
    }
}

pub(crate) fn check_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(BackendError::EmptyKey);
    }
    Ok(())
}

/// Owns the one active backend of the process.
#[derive(Default)]
pub struct BackendRegistry {
    active: Mutex<Option<(BackendKind, Arc<dyn Backend>)>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the active backend, constructing it on first use.
    pub fn open(&self, kind: BackendKind, uri: &str, data_dir: &Path) -> Result<Arc<dyn Backend>> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| BackendError::Config("backend registry poisoned".into()))?;

        if let Some((active_kind, backend)) = active.as_ref() {
            if *active_kind != kind {
                return Err(BackendError::Config(format!(
                    "a {} backend is already active, cannot open {}",
                    active_kind, kind
                )));
            }
            return Ok(Arc::clone(backend));
        }

        let backend = kind.construct(uri, data_dir)?;
        info!("Opened {} backend", kind);
        *active = Some((kind, Arc::clone(&backend)));
        Ok(backend)
    }
}
