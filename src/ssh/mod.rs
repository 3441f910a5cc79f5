//! Git transport over SSH.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use log::info;
use russh_keys::PublicKeyBase64;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub mod git;
pub mod server;

use crate::backend::Backend;
use crate::config::Configuration;
use crate::service::Service;
use crate::store::KeyStore;
use crate::types::PublicKey;
use git::HookScript;
use server::GitContext;

pub struct SshService {
    config: Configuration,
    keys: KeyStore,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SshService {
    pub fn construct(config: &Configuration, backend: Arc<dyn Backend>) -> Box<dyn Service> {
        Box::new(Self {
            config: config.clone(),
            keys: KeyStore::new(backend),
            shutdown: None,
            task: None,
        })
    }
}

#[async_trait]
impl Service for SshService {
    fn name(&self) -> &'static str {
        "ssh"
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        let key = server::host_key(&self.config.data_dir)?;
        let hook = HookScript::current(&self.config)
            .context("could not prepare the pre-receive hook")?;
        tokio::fs::create_dir_all(&self.config.git_path)
            .await
            .with_context(|| format!("could not create {}", self.config.git_path.display()))?;

        let listener = TcpListener::bind(self.config.ssh)
            .await
            .with_context(|| format!("could not bind {}", self.config.ssh))?;
        info!("SSH server listening on {}", self.config.ssh);

        let ctx = Arc::new(GitContext {
            keys: self.keys.clone(),
            git_path: self.config.git_path.clone(),
            hook,
        });
        let (tx, rx) = oneshot::channel();
        self.shutdown = Some(tx);
        self.task = Some(tokio::spawn(server::serve(
            listener,
            Arc::new(server::server_config(key)),
            ctx,
            rx,
        )));
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.context("ssh accept loop panicked")?;
        }
        Ok(())
    }
}

/// Parses an `authorized_keys` style line: `<type> <base64> [comment]`.
pub fn parse_authorized_key(line: &str) -> anyhow::Result<PublicKey> {
    let mut fields = line.split_whitespace();
    let kind = fields.next().context("empty key line")?;
    let encoded = fields
        .next()
        .with_context(|| format!("{} key has no key data", kind))?;
    let comment = fields.collect::<Vec<_>>().join(" ");

    let key = russh_keys::parse_public_key_base64(encoded)
        .with_context(|| format!("invalid {} key", kind))?;
    Ok(PublicKey::new(key.public_key_bytes(), comment))
}
