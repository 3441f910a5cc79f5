//! JSON document store.
//!
//! The whole store is one JSON object on disk, shared by the daemon, hook
//! and CLI processes. Every operation re-reads the file so each process
//! sees the others' writes. Writers hold an exclusive lock on a sibling
//! lock file across the whole read-modify-write, and replace the document
//! by renaming a uniquely named temp file over it, so readers never observe
//! a partially written document.

use std::collections::BTreeMap;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::{check_key, Backend, Result};
use crate::error::BackendError;
use crate::lock::FileLock;

pub const FILE_NAME: &str = "dockhand.json";
pub const LOCK_NAME: &str = "dockhand.json.lock";

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    entries: BTreeMap<String, Vec<u8>>,
}

impl Document {
    fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    fn read(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => Self::parse(&bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, dir: &Path, path: &Path) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

pub struct FileBackend {
    dir: PathBuf,
    path: PathBuf,
}

impl FileBackend {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(FILE_NAME);
        debug!("Using file store at {}", path.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            path,
        })
    }

    async fn load(&self) -> Result<Document> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Document::parse(&bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Document::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Applies `change` under the store lock and writes the document back
    /// when it reports a modification.
    async fn update<F>(&self, change: F) -> Result<()>
    where
        F: FnOnce(&mut Document) -> bool + Send + 'static,
    {
        let dir = self.dir.clone();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let _lock = FileLock::acquire_blocking(&dir.join(LOCK_NAME))?;
            let mut document = Document::read(&path)?;
            if change(&mut document) {
                document.write(&dir, &path)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| BackendError::Io(io::Error::other(e)))?
    }
}

#[async_trait]
impl Backend for FileBackend {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        check_key(key)?;
        let mut document = self.load().await?;
        document
            .entries
            .remove(key)
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    async fn get_prefixed(&self, prefix: &str) -> Result<Vec<Vec<u8>>> {
        check_key(prefix)?;
        let document = self.load().await?;
        Ok(document
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        check_key(key)?;
        let (key, value) = (key.to_string(), value.to_vec());
        self.update(move |document| {
            document.entries.insert(key, value);
            true
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        check_key(key)?;
        let key = key.to_string();
        self.update(move |document| document.entries.remove(&key).is_some())
            .await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
