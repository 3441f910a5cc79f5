use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DaemonError;

pub mod compose;
pub mod docker;
pub use compose::{ComposeDriver, ComposeRunner};
pub use docker::DockerRuntime;

/// Label docker compose puts on every unit of a project.
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";

/// One execution unit as reported by a daemon listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSummary {
    pub id: String,
    /// Logical name, without the leading slash the daemon adds.
    pub name: String,
    /// Human status, e.g. `Up 3 minutes`.
    pub status: String,
    pub running: bool,
}

/// Host side of a published container port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBinding {
    pub host_ip: String,
    pub host_port: String,
}

/// Full state of a launched unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedUnit {
    pub id: String,
    pub name: String,
    pub status: String,
    pub created: DateTime<Utc>,
    /// `"<port>/<proto>"` → host bindings.
    pub ports: HashMap<String, Vec<HostBinding>>,
}

impl LaunchedUnit {
    /// First host port bound to the given container port, any protocol.
    pub fn host_port_for(&self, container_port: u16) -> Option<&str> {
        let wanted = container_port.to_string();
        self.ports
            .iter()
            .filter(|(spec, _)| spec.split('/').next() == Some(wanted.as_str()))
            .flat_map(|(_, bindings)| bindings.iter())
            .map(|b| b.host_port.as_str())
            .find(|p| !p.is_empty())
    }
}

/// The operations the orchestrator needs from a container daemon.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// All units, running or not.
    async fn list_units(&self) -> Result<Vec<UnitSummary>, DaemonError>;

    /// Units carrying `label=value`.
    async fn list_labelled(&self, label: &str, value: &str)
        -> Result<Vec<UnitSummary>, DaemonError>;

    async fn stop_unit(&self, id: &str) -> Result<(), DaemonError>;

    async fn remove_unit(&self, id: &str) -> Result<(), DaemonError>;

    /// Builds `archive` as a build context tagged `tag`. Returns the build log.
    async fn build_image(&self, tag: &str, archive: Vec<u8>) -> Result<String, DaemonError>;

    /// Id of the most recently built image matching `name`, if any.
    async fn latest_image(&self, name: &str) -> Result<Option<String>, DaemonError>;

    /// Creates a unit named `name` from `image` with every port published,
    /// starts it and returns its id.
    async fn create_and_start(&self, name: &str, image: &str) -> Result<String, DaemonError>;

    async fn inspect_unit(&self, id: &str) -> Result<LaunchedUnit, DaemonError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_lookup_ignores_protocol() {
        let mut ports = HashMap::new();
        ports.insert(
            "80/tcp".to_string(),
            vec![HostBinding {
                host_ip: "0.0.0.0".into(),
                host_port: "32768".into(),
            }],
        );
        ports.insert("443/tcp".to_string(), vec![]);
        let unit = LaunchedUnit {
            id: "abc".into(),
            name: "demo".into(),
            status: "running".into(),
            created: Utc::now(),
            ports,
        };

        assert_eq!(unit.host_port_for(80), Some("32768"));
        assert_eq!(unit.host_port_for(443), None);
        assert_eq!(unit.host_port_for(8080), None);
    }
}
