//! Typed records on top of the raw key/value backend.
//!
//! Layout:
//! * `dockhand/configuration` - the daemon configuration
//! * `dockhand/apps/<name>` - one [`AppHeader`] per deployed app
//! * `dockhand/keys/<fingerprint>` - public keys allowed to push

use std::sync::Arc;

use log::info;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backend::{Backend, Result};
use crate::config::Configuration;
use crate::types::{AppHeader, PublicKey};

pub const CONFIG_KEY: &str = "dockhand/configuration";
pub const APPS_PREFIX: &str = "dockhand/apps/";
pub const KEYS_PREFIX: &str = "dockhand/keys/";

async fn get_json<T: DeserializeOwned>(backend: &dyn Backend, key: &str) -> Result<T> {
    let bytes = backend.get(key).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn put_json<T: Serialize>(backend: &dyn Backend, key: &str, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    backend.put(key, &bytes).await
}

async fn list_json<T: DeserializeOwned>(backend: &dyn Backend, prefix: &str) -> Result<Vec<T>> {
    backend
        .get_prefixed(prefix)
        .await?
        .iter()
        .map(|bytes| serde_json::from_slice(bytes).map_err(Into::into))
        .collect()
}

#[derive(Clone)]
pub struct AppStore {
    backend: Arc<dyn Backend>,
}

impl AppStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    fn key(name: &str) -> String {
        format!("{}{}", APPS_PREFIX, name)
    }

    pub async fn get(&self, name: &str) -> Result<AppHeader> {
        get_json(self.backend.as_ref(), &Self::key(name)).await
    }

    /// Stores `header`, replacing any previous record for the same app.
    pub async fn put(&self, header: &AppHeader) -> Result<()> {
        put_json(self.backend.as_ref(), &Self::key(&header.name), header).await
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        self.backend.delete(&Self::key(name)).await
    }

    pub async fn list(&self) -> Result<Vec<AppHeader>> {
        let mut apps: Vec<AppHeader> = list_json(self.backend.as_ref(), APPS_PREFIX).await?;
        apps.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(apps)
    }
}

#[derive(Clone)]
pub struct KeyStore {
    backend: Arc<dyn Backend>,
}

impl KeyStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    fn key(fingerprint: &str) -> String {
        format!("{}{}", KEYS_PREFIX, fingerprint)
    }

    pub async fn add(&self, key: &PublicKey) -> Result<()> {
        put_json(self.backend.as_ref(), &Self::key(&key.fingerprint), key).await
    }

    pub async fn get(&self, fingerprint: &str) -> Result<PublicKey> {
        get_json(self.backend.as_ref(), &Self::key(fingerprint)).await
    }

    pub async fn list(&self) -> Result<Vec<PublicKey>> {
        list_json(self.backend.as_ref(), KEYS_PREFIX).await
    }

    pub async fn remove(&self, fingerprint: &str) -> Result<()> {
        self.backend.delete(&Self::key(fingerprint)).await
    }

    /// With no registered keys every key may push; otherwise the
    /// fingerprint must be registered.
    pub async fn is_allowed(&self, fingerprint: &str) -> Result<bool> {
        match self.get(fingerprint).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(self.list().await?.is_empty()),
            Err(e) => Err(e),
        }
    }
}

#[derive(Clone)]
pub struct ConfigStore {
    backend: Arc<dyn Backend>,
}

impl ConfigStore {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Returns the persisted configuration, seeding it with `defaults` on
    /// first run.
    pub async fn load_or_seed(&self, defaults: &Configuration) -> Result<Configuration> {
        match get_json::<Configuration>(self.backend.as_ref(), CONFIG_KEY).await {
            Ok(mut stored) => {
                stored.source = defaults.source.clone();
                Ok(stored)
            }
            Err(e) if e.is_not_found() => {
                info!("No configuration in backend, persisting defaults");
                self.save(defaults).await?;
                Ok(defaults.clone())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn save(&self, config: &Configuration) -> Result<()> {
        put_json(self.backend.as_ref(), CONFIG_KEY, config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::types::RouteState;
    use chrono::Utc;

    fn backend() -> Arc<dyn Backend> {
        Arc::new(MemoryBackend::new())
    }

    fn header(name: &str, container_id: &str) -> AppHeader {
        AppHeader {
            name: name.into(),
            repository: "demo".into(),
            branch: "master".into(),
            commit: "abc123".into(),
            public_url: format!("{}.example.com", name),
            container_id: container_id.into(),
            status: "running".into(),
            start_time: Utc::now(),
            route: RouteState::NoHttpPort,
        }
    }

    #[tokio::test]
    async fn app_put_replaces_previous_record() {
        let apps = AppStore::new(backend());
        apps.put(&header("demo", "first")).await.unwrap();
        apps.put(&header("demo", "second")).await.unwrap();
        apps.put(&header("demo_feature", "third")).await.unwrap();

        let all = apps.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(apps.get("demo").await.unwrap().container_id, "second");
    }

    #[tokio::test]
    async fn missing_app_is_not_found() {
        let apps = AppStore::new(backend());
        assert!(apps.get("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn deleted_app_leaves_the_listing() {
        let apps = AppStore::new(backend());
        apps.put(&header("demo", "first")).await.unwrap();
        apps.put(&header("blog", "second")).await.unwrap();

        apps.delete("demo").await.unwrap();
        assert!(apps.get("demo").await.unwrap_err().is_not_found());
        let names: Vec<_> = apps.list().await.unwrap().into_iter().map(|a| a.name).collect();
        assert_eq!(names, ["blog"]);
    }

    #[tokio::test]
    async fn keys_gate_only_once_registered() {
        let keys = KeyStore::new(backend());
        assert!(keys.is_allowed("aa:bb").await.unwrap());

        let key = PublicKey::new(b"ssh-ed25519 AAAA".to_vec(), "alice@laptop");
        keys.add(&key).await.unwrap();
        assert!(keys.is_allowed(&key.fingerprint).await.unwrap());
        assert!(!keys.is_allowed("aa:bb").await.unwrap());

        keys.remove(&key.fingerprint).await.unwrap();
        assert!(keys.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn config_is_seeded_once() {
        let store = ConfigStore::new(backend());
        let first = Configuration {
            hostname: "first.example".into(),
            ..Default::default()
        };
        let seeded = store.load_or_seed(&first).await.unwrap();
        assert_eq!(seeded.hostname, "first.example");

        let second = Configuration {
            hostname: "second.example".into(),
            ..Default::default()
        };
        let loaded = store.load_or_seed(&second).await.unwrap();
        assert_eq!(loaded.hostname, "first.example");
    }
}
