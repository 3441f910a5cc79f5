//! Guarantees at most one running unit per app name.
//!
//! A deploy runs four gated steps: tear down the stale units, build the
//! image, launch a fresh unit, inspect it. Deploys of the same name are
//! serialised through a per-name lock that holds across processes; different
//! names proceed in parallel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info};

use crate::error::DaemonError;
use crate::lock::FileLock;
use crate::runtime::{
    ComposeDriver, ContainerRuntime, LaunchedUnit, UnitSummary, COMPOSE_PROJECT_LABEL,
};
use crate::types::ProjectKind;

/// What a successful deploy left behind.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub unit: LaunchedUnit,
    /// Ids of the units torn down to make room.
    pub replaced: Vec<String>,
    pub build_log: String,
}

/// Holds both halves of the per-name deploy lock.
struct DeployGuard {
    _file: FileLock,
    _local: tokio::sync::OwnedMutexGuard<()>,
}

pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    compose: Arc<dyn ComposeDriver>,
    lock_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    /// `lock_dir` holds one `<name>.lock` file per app; every process
    /// deploying to the same daemon must share it.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        compose: Arc<dyn ComposeDriver>,
        lock_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runtime,
            compose,
            lock_dir: lock_dir.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn local_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    async fn lock(&self, name: &str) -> Result<DeployGuard, DaemonError> {
        let local = self.local_lock(name).lock_owned().await;
        let path = self.lock_dir.join(format!("{}.lock", name));
        let file = FileLock::acquire(path)
            .await
            .map_err(|source| DaemonError::Lock {
                name: name.to_string(),
                source,
            })?;
        debug!("Acquired deploy lock for {}", name);
        Ok(DeployGuard {
            _file: file,
            _local: local,
        })
    }

    /// Replaces whatever runs as `name` with a fresh build of `archive`.
    pub async fn deploy(
        &self,
        name: &str,
        kind: ProjectKind,
        archive: Vec<u8>,
    ) -> Result<Deployment, DaemonError> {
        let _guard = self.lock(name).await?;

        let replaced = self.remove_stale(name).await?;
        let mut deployment = match kind {
            ProjectKind::Compose => self.deploy_compose(name, &archive).await?,
            _ => {
                self.compose.down(name).await?;
                self.deploy_image(name, archive).await?
            }
        };
        deployment.replaced = replaced;
        Ok(deployment)
    }

    /// Stops and removes everything deployed as `name`. Returns the ids of
    /// the removed units.
    pub async fn remove(&self, name: &str) -> Result<Vec<String>, DaemonError> {
        let _guard = self.lock(name).await?;

        let removed = self.remove_stale(name).await?;
        self.compose.down(name).await?;
        info!("Removed {} ({} units)", name, removed.len());
        Ok(removed)
    }

    async fn deploy_image(&self, name: &str, archive: Vec<u8>) -> Result<Deployment, DaemonError> {
        let tag = name.to_lowercase();
        let build_log = self.runtime.build_image(&tag, archive).await?;

        let image = self
            .runtime
            .latest_image(&tag)
            .await?
            .ok_or_else(|| DaemonError::NoImageFound(tag.clone()))?;
        let id = self.runtime.create_and_start(name, &image).await?;

        let unit = self.runtime.inspect_unit(&id).await?;
        info!("Deployed {} as {} ({})", name, unit.id, unit.status);
        Ok(Deployment {
            unit,
            replaced: Vec::new(),
            build_log,
        })
    }

    async fn deploy_compose(&self, name: &str, archive: &[u8]) -> Result<Deployment, DaemonError> {
        let build_log = self.compose.up(name, archive).await?;

        let project = name.to_lowercase();
        let mut units = Vec::new();
        for summary in self
            .runtime
            .list_labelled(COMPOSE_PROJECT_LABEL, &project)
            .await?
        {
            units.push(self.runtime.inspect_unit(&summary.id).await?);
        }

        let pick = units
            .iter()
            .position(|u| u.host_port_for(80).is_some())
            .unwrap_or(0);
        if units.is_empty() {
            return Err(DaemonError::LaunchFailed(format!(
                "compose project {} started no containers",
                project
            )));
        }
        let unit = units.swap_remove(pick);
        info!("Deployed compose project {} fronted by {}", project, unit.name);
        Ok(Deployment {
            unit,
            replaced: Vec::new(),
            build_log,
        })
    }

    /// Stops and removes every unit belonging to `name`, whatever kind of
    /// project launched it: the unit named `name` and the units of the
    /// compose project of the same name. Absence is fine.
    async fn remove_stale(&self, name: &str) -> Result<Vec<String>, DaemonError> {
        let mut stale: Vec<UnitSummary> = self
            .runtime
            .list_units()
            .await?
            .into_iter()
            .filter(|u| u.name == name)
            .collect();
        let project = name.to_lowercase();
        for unit in self
            .runtime
            .list_labelled(COMPOSE_PROJECT_LABEL, &project)
            .await?
        {
            if !stale.iter().any(|s| s.id == unit.id) {
                stale.push(unit);
            }
        }

        let mut removed = Vec::with_capacity(stale.len());
        for unit in stale {
            if unit.running {
                info!("Stopping {} ({}, {})", unit.name, unit.id, unit.status);
                self.runtime.stop_unit(&unit.id).await?;
            }
            self.runtime.remove_unit(&unit.id).await?;
            info!("Removed previous container {} for {}", unit.id, name);
            removed.push(unit.id);
        }
        Ok(removed)
    }
}
