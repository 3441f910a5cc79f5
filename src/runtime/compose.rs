//! Compose projects are handed to the `docker compose` CLI.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, info};
use tokio::process::Command;

use crate::error::DaemonError;

/// Brings a compose project up or down.
#[async_trait]
pub trait ComposeDriver: Send + Sync {
    /// Replaces the running project `name` with the one in `archive`.
    /// Returns the combined CLI output.
    async fn up(&self, name: &str, archive: &[u8]) -> Result<String, DaemonError>;

    /// Takes project `name` down and drops its checkout. A project that was
    /// never brought up is not an error.
    async fn down(&self, name: &str) -> Result<(), DaemonError>;
}

pub struct ComposeRunner {
    checkout_root: PathBuf,
    docker_endpoint: String,
}

impl ComposeRunner {
    pub fn new(checkout_root: impl Into<PathBuf>, docker_endpoint: impl Into<String>) -> Self {
        Self {
            checkout_root: checkout_root.into(),
            docker_endpoint: docker_endpoint.into(),
        }
    }

    fn command(&self, dir: &Path, project: &str) -> Command {
        let mut cmd = Command::new("docker");
        cmd.arg("compose")
            .arg("-p")
            .arg(project)
            .current_dir(dir)
            .stdin(Stdio::null());
        if !self.docker_endpoint.is_empty() {
            cmd.env("DOCKER_HOST", &self.docker_endpoint);
        }
        cmd
    }

    async fn run(&self, mut cmd: Command) -> Result<String, DaemonError> {
        let output = cmd
            .output()
            .await
            .map_err(|e| DaemonError::Compose(format!("could not run docker compose: {}", e)))?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(DaemonError::Compose(text));
        }
        Ok(text)
    }

    async fn bring_down(&self, dir: &Path, project: &str) -> Result<(), DaemonError> {
        debug!("Bringing down compose project {}", project);
        let mut down = self.command(dir, project);
        down.args(["down", "--remove-orphans"]);
        self.run(down).await?;
        Ok(())
    }
}

/// Replaces `dir` with the contents of `archive`.
pub(crate) fn unpack(archive: &[u8], dir: &Path) -> std::io::Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)?;
    tar::Archive::new(Cursor::new(archive)).unpack(dir)
}

#[async_trait]
impl ComposeDriver for ComposeRunner {
    async fn up(&self, name: &str, archive: &[u8]) -> Result<String, DaemonError> {
        let project = name.to_lowercase();
        let dir = self.checkout_root.join(name);

        if dir.exists() {
            self.bring_down(&dir, &project).await?;
        }

        let unpack_dir = dir.clone();
        let archive = archive.to_vec();
        tokio::task::spawn_blocking(move || unpack(&archive, &unpack_dir))
            .await
            .map_err(|e| DaemonError::Compose(e.to_string()))?
            .map_err(|e| DaemonError::Compose(format!("could not unpack archive: {}", e)))?;

        let mut up = self.command(&dir, &project);
        up.args(["up", "-d", "--build", "--force-recreate", "--remove-orphans"]);
        let output = self.run(up).await?;
        info!("Compose project {} is up", project);
        Ok(output)
    }

    async fn down(&self, name: &str) -> Result<(), DaemonError> {
        let dir = self.checkout_root.join(name);
        if !dir.exists() {
            return Ok(());
        }
        let project = name.to_lowercase();
        self.bring_down(&dir, &project).await?;
        tokio::fs::remove_dir_all(&dir).await.map_err(|e| {
            DaemonError::Compose(format!("could not remove {}: {}", dir.display(), e))
        })?;
        info!("Compose project {} is down", project);
        Ok(())
    }
}
