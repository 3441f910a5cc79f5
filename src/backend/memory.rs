//! Process-local store, used for debugging and tests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{check_key, Backend, Result};
use crate::error::BackendError;

#[derive(Default)]
pub struct MemoryBackend {
    store: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> BackendError {
        BackendError::Config("memory store lock poisoned".into())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        check_key(key)?;
        let store = self.store.read().map_err(|_| Self::poisoned())?;
        store
            .get(key)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(key.to_string()))
    }

    async fn get_prefixed(&self, prefix: &str) -> Result<Vec<Vec<u8>>> {
        check_key(prefix)?;
        let store = self.store.read().map_err(|_| Self::poisoned())?;
        Ok(store
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        check_key(key)?;
        let mut store = self.store.write().map_err(|_| Self::poisoned())?;
        store.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        check_key(key)?;
        let mut store = self.store.write().map_err(|_| Self::poisoned())?;
        store.remove(key);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
