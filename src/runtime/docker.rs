use super::{ContainerRuntime, HostBinding, LaunchedUnit, UnitSummary};
use crate::error::DaemonError;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::image::{BuildImageOptions, ListImagesOptions};
use bollard::models::{ContainerInspectResponse, ContainerSummary, HostConfig};
use bollard::{Docker, API_DEFAULT_VERSION};
use chrono::{DateTime, Utc};
use futures_util::stream::StreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::time::Duration;

/// Daemon calls are never timed out by the client. bollard wraps every
/// request in `tokio::time::timeout`, which treats a deadline past the end
/// of the clock as "never".
const DAEMON_TIMEOUT: Duration = Duration::from_secs(u64::MAX);

/// Seconds the daemon waits for a unit to exit before killing it.
const STOP_GRACE_SECS: i64 = 10;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects according to `endpoint`: `unix://<path>`, `tcp://` or
    /// `http://<addr>`, or empty for the `DOCKER_HOST`-derived defaults.
    pub fn connect(endpoint: &str) -> Result<Self, DaemonError> {
        let timeout = DAEMON_TIMEOUT.as_secs();
        let docker = if endpoint.is_empty() {
            Docker::connect_with_defaults()?
        } else if let Some(path) = endpoint.strip_prefix("unix://") {
            Docker::connect_with_unix(path, timeout, API_DEFAULT_VERSION)?
        } else if endpoint.starts_with("tcp://") || endpoint.starts_with("http://") {
            Docker::connect_with_http(endpoint, timeout, API_DEFAULT_VERSION)?
        } else {
            return Err(DaemonError::Unreachable(format!(
                "unsupported docker endpoint {}",
                endpoint
            )));
        };
        debug!("Docker client configured for {}", endpoint);
        Ok(Self {
            docker: docker.with_timeout(DAEMON_TIMEOUT),
        })
    }

    async fn list(
        &self,
        filters: HashMap<String, Vec<String>>,
    ) -> Result<Vec<UnitSummary>, DaemonError> {
        let opts = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;
        Ok(containers.into_iter().filter_map(summarize).collect())
    }
}

fn summarize(c: ContainerSummary) -> Option<UnitSummary> {
    let id = c.id?;
    let name = c
        .names
        .as_ref()
        .and_then(|n| n.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| id.clone());
    let status = c.status.unwrap_or_default();
    let running = c.state.as_deref() == Some("running") || status.starts_with("Up");
    Some(UnitSummary {
        id,
        name,
        status,
        running,
    })
}

fn launch_failed(err: bollard::errors::Error) -> DaemonError {
    DaemonError::LaunchFailed(err.to_string())
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_units(&self) -> Result<Vec<UnitSummary>, DaemonError> {
        self.list(HashMap::new()).await
    }

    async fn list_labelled(
        &self,
        label: &str,
        value: &str,
    ) -> Result<Vec<UnitSummary>, DaemonError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}={}", label, value)],
        )]);
        self.list(filters).await
    }

    async fn stop_unit(&self, id: &str) -> Result<(), DaemonError> {
        self.docker
            .stop_container(id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await?;
        Ok(())
    }

    async fn remove_unit(&self, id: &str) -> Result<(), DaemonError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    async fn build_image(&self, tag: &str, archive: Vec<u8>) -> Result<String, DaemonError> {
        let opts = BuildImageOptions::<String> {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut log = String::new();
        let mut stream = self.docker.build_image(opts, None, Some(archive.into()));
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(info) => {
                    if let Some(line) = info.stream {
                        debug!("[build {}] {}", tag, line.trim_end());
                        log.push_str(&line);
                    }
                    if let Some(err) = info.error {
                        warn!("Build of {} failed: {}", tag, err);
                        log.push_str(&err);
                        return Err(DaemonError::BuildFailed { log });
                    }
                }
                Err(e) => {
                    warn!("Build of {} failed: {}", tag, e);
                    log.push_str(&e.to_string());
                    return Err(DaemonError::BuildFailed { log });
                }
            }
        }

        info!("Built image {}", tag);
        Ok(log)
    }

    async fn latest_image(&self, name: &str) -> Result<Option<String>, DaemonError> {
        let opts = ListImagesOptions::<String> {
            filters: HashMap::from([("reference".to_string(), vec![name.to_string()])]),
            ..Default::default()
        };
        let images = self.docker.list_images(Some(opts)).await?;
        Ok(images
            .into_iter()
            .max_by_key(|image| image.created)
            .map(|image| image.id))
    }

    async fn create_and_start(&self, name: &str, image: &str) -> Result<String, DaemonError> {
        let opts = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let config = Config {
            image: Some(image.to_string()),
            host_config: Some(HostConfig {
                publish_all_ports: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Some(opts), config)
            .await
            .map_err(launch_failed)?;
        for warning in &created.warnings {
            warn!("Creating {}: {}", name, warning);
        }

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(launch_failed)?;
        info!("Started container {} ({})", name, created.id);
        Ok(created.id)
    }

    async fn inspect_unit(&self, id: &str) -> Result<LaunchedUnit, DaemonError> {
        let detail = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        Ok(launched_unit(id, detail))
    }
}

fn launched_unit(id: &str, detail: ContainerInspectResponse) -> LaunchedUnit {
    let status = detail
        .state
        .as_ref()
        .and_then(|s| s.status.as_ref())
        .map(|s| s.to_string())
        .unwrap_or_default();

    let created = detail
        .created
        .as_deref()
        .and_then(|c| DateTime::parse_from_rfc3339(c).ok())
        .map(|c| c.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let ports = detail
        .network_settings
        .and_then(|s| s.ports)
        .unwrap_or_default()
        .into_iter()
        .map(|(spec, bindings)| {
            let bindings = bindings
                .unwrap_or_default()
                .into_iter()
                .map(|b| HostBinding {
                    host_ip: b.host_ip.unwrap_or_default(),
                    host_port: b.host_port.unwrap_or_default(),
                })
                .collect();
            (spec, bindings)
        })
        .collect();

    LaunchedUnit {
        id: detail.id.unwrap_or_else(|| id.to_string()),
        name: detail
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        status,
        created,
        ports,
    }
}
