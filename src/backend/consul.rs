//! Distributed store on Consul's KV HTTP API.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use log::debug;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::{check_key, Backend, Result};
use crate::error::BackendError;

pub const DEFAULT_ADDRESS: &str = "http://127.0.0.1:8500";

#[derive(Debug, Deserialize)]
struct KvPair {
    #[serde(rename = "Value")]
    value: Option<String>,
}

pub struct ConsulBackend {
    client: Client,
    base_url: String,
}

impl ConsulBackend {
    /// `address` is the agent's base URL; empty uses `CONSUL_HTTP_ADDR` or
    /// the local agent.
    pub fn new(address: &str) -> Result<Self> {
        let address = if address.is_empty() {
            std::env::var("CONSUL_HTTP_ADDR").unwrap_or_else(|_| DEFAULT_ADDRESS.to_string())
        } else {
            address.to_string()
        };
        let address = if address.contains("://") {
            address
        } else {
            format!("http://{}", address)
        };

        let client = Client::builder()
            .build()
            .map_err(|e| BackendError::Config(format!("failed to initialize consul API: {}", e)))?;

        Ok(Self {
            client,
            base_url: format!("{}/v1/kv", address.trim_end_matches('/')),
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.trim_start_matches('/'))
    }

    fn decode(pair: KvPair) -> Result<Vec<u8>> {
        match pair.value {
            Some(value) => STANDARD
                .decode(value)
                .map_err(|e| BackendError::Remote(format!("invalid value encoding: {}", e))),
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl Backend for ConsulBackend {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        check_key(key)?;
        let response = self.client.get(self.url(key)).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound(key.to_string()));
        }

        let pairs: Vec<KvPair> = response.error_for_status()?.json().await?;
        match pairs.into_iter().next() {
            Some(pair) => Self::decode(pair),
            None => Err(BackendError::NotFound(key.to_string())),
        }
    }

    async fn get_prefixed(&self, prefix: &str) -> Result<Vec<Vec<u8>>> {
        check_key(prefix)?;
        let response = self
            .client
            .get(self.url(prefix))
            .query(&[("recurse", "true"), ("consistent", "true")])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }

        let pairs: Vec<KvPair> = response.error_for_status()?.json().await?;
        debug!("consul returned {} values under {}", pairs.len(), prefix);
        pairs.into_iter().map(Self::decode).collect()
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        check_key(key)?;
        let accepted: bool = self
            .client
            .put(self.url(key))
            .body(value.to_vec())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if !accepted {
            return Err(BackendError::Remote(format!("consul rejected write to {}", key)));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        check_key(key)?;
        self.client
            .delete(self.url(key))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
