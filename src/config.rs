use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::backend::BackendKind;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_PATH_ENV: &str = "DOCKHAND_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Connection string or directory, depending on `kind`. Empty means
    /// "derive from `data_dir`" for local stores.
    #[serde(default)]
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NginxConfig {
    pub available_dir: PathBuf,
    pub enabled_dir: PathBuf,
    pub reload_command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HttpAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Configuration {
    /// Apps are reachable at `<name>.<hostname>`.
    pub hostname: String,
    pub ssh: SocketAddr,
    pub http: SocketAddr,
    pub rpc: SocketAddr,
    /// Root directory of the pushed bare repositories.
    pub git_path: PathBuf,
    pub data_dir: PathBuf,
    /// `unix://…`, `tcp://…`/`http://…`, or empty for `DOCKER_HOST` defaults.
    pub docker_endpoint: String,
    pub master_only: bool,
    pub debug: bool,
    pub backend: BackendConfig,
    pub nginx: NginxConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_auth: Option<HttpAuth>,
    /// File the configuration was loaded from, handed to provisioned hooks.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1.xip.io".into(),
            ssh: SocketAddr::from(([0, 0, 0, 0], 2222)),
            http: SocketAddr::from(([0, 0, 0, 0], 8080)),
            rpc: SocketAddr::from(([127, 0, 0, 1], 5127)),
            git_path: PathBuf::from("./repositories"),
            data_dir: PathBuf::from("./data"),
            docker_endpoint: "unix:///var/run/docker.sock".into(),
            master_only: false,
            debug: false,
            backend: BackendConfig {
                kind: BackendKind::File,
                uri: String::new(),
            },
            nginx: NginxConfig {
                available_dir: PathBuf::from("/etc/nginx/sites-available"),
                enabled_dir: PathBuf::from("/etc/nginx/sites-enabled"),
                reload_command: vec!["service".into(), "nginx".into(), "reload".into()],
            },
            http_auth: None,
            source: None,
        }
    }
}

impl Configuration {
    /// Loads defaults, then `dockhand.toml` (or the explicit `path`),
    /// `dockhand.json`, then `DOCKHAND_*` environment variables.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));

        let mut figment = Figment::from(Serialized::defaults(Configuration::default()));
        figment = match &explicit {
            Some(file) if is_json(file) => figment.merge(Json::file(file)),
            Some(file) => figment.merge(Toml::file(file)),
            None => figment
                .merge(Toml::file("dockhand.toml"))
                .merge(Json::file("dockhand.json")),
        };

        let mut config: Configuration = figment
            .merge(Env::prefixed("DOCKHAND_").split("__"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        config.source = match explicit {
            Some(file) => Some(std::fs::canonicalize(&file).unwrap_or(file)),
            None => ["dockhand.toml", "dockhand.json"]
                .iter()
                .map(PathBuf::from)
                .find(|p| p.exists())
                .and_then(|p| std::fs::canonicalize(p).ok()),
        };

        Ok(config)
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("json")
}
