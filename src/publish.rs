//! Publishes launched apps through an nginx virtual host.

use std::io::ErrorKind;
use std::path::PathBuf;

use log::{debug, info};
use tokio::process::Command;

use crate::config::NginxConfig;
use crate::error::PublishError;
use crate::runtime::LaunchedUnit;

/// Container port the proxy forwards to.
pub const HTTP_PORT: u16 = 80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Published { host_port: String },
    /// The unit exposes no port 80, so there is nothing to route.
    NoHttpPort,
}

pub fn render_vhost(domain: &str, host_port: &str) -> String {
    format!(
        r#"
server {{
    listen 80;

    server_name {domain};

    location / {{
        proxy_set_header Host $http_host;
        proxy_set_header X-Real-IP $remote_addr;

        proxy_pass http://localhost:{host_port}/;
    }}
}}
"#
    )
}

pub struct RoutePublisher {
    config: NginxConfig,
}

impl RoutePublisher {
    pub fn new(config: NginxConfig) -> Self {
        Self { config }
    }

    fn available_path(&self, app_name: &str) -> PathBuf {
        self.config.available_dir.join(app_name)
    }

    fn enabled_path(&self, app_name: &str) -> PathBuf {
        self.config.enabled_dir.join(app_name)
    }

    /// Staging file for the vhost; the full app name keeps it unique.
    fn temp_path(&self, app_name: &str) -> PathBuf {
        self.config
            .available_dir
            .join(format!(".{}.tmp", app_name))
    }

    /// Routes `domain` to the unit's host binding for port 80.
    pub async fn publish(
        &self,
        domain: &str,
        app_name: &str,
        unit: &LaunchedUnit,
    ) -> Result<RouteOutcome, PublishError> {
        let Some(host_port) = unit.host_port_for(HTTP_PORT) else {
            info!("{} exposes no port {}, not publishing", app_name, HTTP_PORT);
            return Ok(RouteOutcome::NoHttpPort);
        };

        self.write_vhost(domain, app_name, host_port).await?;
        self.enable(app_name).await?;
        self.reload().await?;

        info!("Published {} at {} -> localhost:{}", app_name, domain, host_port);
        Ok(RouteOutcome::Published {
            host_port: host_port.to_string(),
        })
    }

    async fn write_vhost(
        &self,
        domain: &str,
        app_name: &str,
        host_port: &str,
    ) -> Result<(), PublishError> {
        let path = self.available_path(app_name);
        let write_err = |source| PublishError::Write {
            path: path.display().to_string(),
            source,
        };

        let vhost = render_vhost(domain, host_port);
        debug!("{}", vhost);

        let tmp = self.temp_path(app_name);
        tokio::fs::write(&tmp, vhost).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(write_err)?;
        Ok(())
    }

    /// Links the vhost into the enabled directory unless a link exists.
    async fn enable(&self, app_name: &str) -> Result<(), PublishError> {
        let available = self.available_path(app_name);
        let enabled = self.enabled_path(app_name);
        let symlink_err = |source| PublishError::Symlink {
            path: enabled.display().to_string(),
            source,
        };

        match tokio::fs::symlink_metadata(&enabled).await {
            Ok(_) => {
                debug!("{} already enabled", app_name);
                return Ok(());
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(symlink_err(e)),
        }

        tokio::fs::symlink(&available, &enabled)
            .await
            .map_err(symlink_err)
    }

    /// Drops the vhost and its enabled link, reloading the proxy if either
    /// existed. Returns whether anything was removed.
    pub async fn unpublish(&self, app_name: &str) -> Result<bool, PublishError> {
        let mut removed = false;
        for path in [self.enabled_path(app_name), self.available_path(app_name)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(PublishError::Remove {
                        path: path.display().to_string(),
                        source,
                    })
                }
            }
        }

        if removed {
            self.reload().await?;
            info!("Unpublished {}", app_name);
        }
        Ok(removed)
    }

    async fn reload(&self) -> Result<(), PublishError> {
        let Some((program, args)) = self.config.reload_command.split_first() else {
            return Err(PublishError::Reload("no reload command configured".into()));
        };

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| PublishError::Reload(format!("could not start {}: {}", program, e)))?;
        if !output.status.success() {
            return Err(PublishError::Reload(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::runtime::HostBinding;
    use chrono::Utc;
    use std::collections::HashMap;

    pub(crate) fn nginx_dirs(root: &std::path::Path, reload: &[&str]) -> NginxConfig {
        let available_dir = root.join("sites-available");
        let enabled_dir = root.join("sites-enabled");
        std::fs::create_dir_all(&available_dir).unwrap();
        std::fs::create_dir_all(&enabled_dir).unwrap();
        NginxConfig {
            available_dir,
            enabled_dir,
            reload_command: reload.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn unit(http_port: Option<&str>) -> LaunchedUnit {
        let mut ports = HashMap::new();
        if let Some(port) = http_port {
            ports.insert(
                "80/tcp".to_string(),
                vec![HostBinding {
                    host_ip: "0.0.0.0".into(),
                    host_port: port.into(),
                }],
            );
        }
        LaunchedUnit {
            id: "abc".into(),
            name: "demo".into(),
            status: "running".into(),
            created: Utc::now(),
            ports,
        }
    }

    #[test]
    fn template_substitutes_domain_and_port() {
        let vhost = render_vhost("demo.example.com", "32768");
        assert!(vhost.contains("server_name demo.example.com;"));
        assert!(vhost.contains("proxy_pass http://localhost:32768/;"));
    }

    #[tokio::test]
    async fn publish_writes_links_and_reloads() {
        let root = tempfile::tempdir().unwrap();
        let config = nginx_dirs(root.path(), &["true"]);
        let publisher = RoutePublisher::new(config.clone());

        let outcome = publisher
            .publish("demo.example.com", "demo", &unit(Some("32768")))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RouteOutcome::Published {
                host_port: "32768".into()
            }
        );

        let written = std::fs::read_to_string(config.available_dir.join("demo")).unwrap();
        assert!(written.contains("localhost:32768"));
        let link = std::fs::read_link(config.enabled_dir.join("demo")).unwrap();
        assert_eq!(link, config.available_dir.join("demo"));

        // republishing keeps the existing link and rewrites the vhost
        publisher
            .publish("demo.example.com", "demo", &unit(Some("40000")))
            .await
            .unwrap();
        let written = std::fs::read_to_string(config.enabled_dir.join("demo")).unwrap();
        assert!(written.contains("localhost:40000"));
    }

    #[test]
    fn dotted_app_names_stage_to_distinct_files() {
        let root = tempfile::tempdir().unwrap();
        let publisher = RoutePublisher::new(nginx_dirs(root.path(), &["true"]));
        assert_ne!(publisher.temp_path("my.app"), publisher.temp_path("my.web"));
    }

    #[tokio::test]
    async fn dotted_app_names_publish_side_by_side() {
        let root = tempfile::tempdir().unwrap();
        let config = nginx_dirs(root.path(), &["true"]);
        let publisher = RoutePublisher::new(config.clone());

        let app_unit = unit(Some("32768"));
        let web_unit = unit(Some("32769"));
        let (app, web) = tokio::join!(
            publisher.publish("my.app.example.com", "my.app", &app_unit),
            publisher.publish("my.web.example.com", "my.web", &web_unit),
        );
        app.unwrap();
        web.unwrap();

        let app = std::fs::read_to_string(config.available_dir.join("my.app")).unwrap();
        let web = std::fs::read_to_string(config.available_dir.join("my.web")).unwrap();
        assert!(app.contains("localhost:32768"));
        assert!(web.contains("localhost:32769"));
        let mut names: Vec<_> = std::fs::read_dir(&config.available_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, ["my.app", "my.web"]);
    }

    #[tokio::test]
    async fn unpublish_removes_vhost_and_link() {
        let root = tempfile::tempdir().unwrap();
        let config = nginx_dirs(root.path(), &["true"]);
        let publisher = RoutePublisher::new(config.clone());
        publisher
            .publish("demo.example.com", "demo", &unit(Some("32768")))
            .await
            .unwrap();

        assert!(publisher.unpublish("demo").await.unwrap());
        assert!(std::fs::symlink_metadata(config.enabled_dir.join("demo")).is_err());
        assert!(!config.available_dir.join("demo").exists());

        // nothing left, so no reload either
        let idle = RoutePublisher::new(nginx_dirs(root.path(), &["false"]));
        assert!(!idle.unpublish("demo").await.unwrap());
    }

    #[tokio::test]
    async fn no_http_port_is_a_noop() {
        let root = tempfile::tempdir().unwrap();
        let config = nginx_dirs(root.path(), &["false"]);
        let publisher = RoutePublisher::new(config.clone());

        let outcome = publisher
            .publish("demo.example.com", "demo", &unit(None))
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::NoHttpPort);
        assert!(!config.available_dir.join("demo").exists());
    }

    #[tokio::test]
    async fn failed_reload_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let publisher = RoutePublisher::new(nginx_dirs(root.path(), &["false"]));

        let err = publisher
            .publish("demo.example.com", "demo", &unit(Some("32768")))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Reload(_)));
    }

    #[tokio::test]
    async fn missing_directory_is_a_write_error() {
        let root = tempfile::tempdir().unwrap();
        let mut config = nginx_dirs(root.path(), &["true"]);
        config.available_dir = root.path().join("does-not-exist");
        let publisher = RoutePublisher::new(config);

        let err = publisher
            .publish("demo.example.com", "demo", &unit(Some("32768")))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Write { .. }));
    }
}
