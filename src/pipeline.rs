//! The push pipeline: checkout, deploy, publish, record.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::backend::Backend;
use crate::checkout::{self, PushContext, MASTER_BRANCH};
use crate::config::Configuration;
use crate::error::{DaemonError, PipelineError};
use crate::orchestrator::Orchestrator;
use crate::publish::{RouteOutcome, RoutePublisher};
use crate::runtime::{ComposeRunner, DockerRuntime};
use crate::store::AppStore;
use crate::types::{AppHeader, RouteState};

/// Directory under `data_dir` compose projects are unpacked into.
pub const CHECKOUTS_DIR: &str = "checkouts";

/// Directory under `data_dir` holding the per-app deploy locks.
pub const LOCKS_DIR: &str = "locks";

pub struct Pipeline {
    orchestrator: Orchestrator,
    publisher: RoutePublisher,
    apps: AppStore,
    master_only: bool,
}

impl Pipeline {
    pub fn new(
        orchestrator: Orchestrator,
        publisher: RoutePublisher,
        apps: AppStore,
        master_only: bool,
    ) -> Self {
        Self {
            orchestrator,
            publisher,
            apps,
            master_only,
        }
    }

    /// Wires the pipeline to the configured docker daemon and proxy.
    pub fn connect(config: &Configuration, backend: Arc<dyn Backend>) -> Result<Self, DaemonError> {
        let runtime = Arc::new(DockerRuntime::connect(&config.docker_endpoint)?);
        let compose = Arc::new(ComposeRunner::new(
            config.data_dir.join(CHECKOUTS_DIR),
            config.docker_endpoint.clone(),
        ));
        Ok(Self::new(
            Orchestrator::new(runtime, compose, config.data_dir.join(LOCKS_DIR)),
            RoutePublisher::new(config.nginx.clone()),
            AppStore::new(backend),
            config.master_only,
        ))
    }

    /// Runs one push end to end, reporting progress to `status`.
    ///
    /// The app record is written as soon as the unit runs, so a failed
    /// publish still leaves a visible `Unpublished` record behind.
    pub async fn run<R, W>(
        &self,
        push: &PushContext,
        archive: R,
        status: &mut W,
    ) -> Result<AppHeader, PipelineError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        say(
            status,
            &format!(
                "Checking out {} ({} @ {})",
                push.repository, push.branch, push.commit
            ),
        )
        .await?;
        let repo = checkout::checkout(archive, push).await?;
        say(status, &format!("Received {} files", repo.files.len())).await?;

        if self.master_only && repo.branch != MASTER_BRANCH {
            return Err(PipelineError::BranchRejected(repo.branch));
        }

        let target = repo.target_file.as_deref().unwrap_or("-");
        say(
            status,
            &format!("Detected a {} project ({})", repo.kind, target),
        )
        .await?;
        say(status, &format!("Deploying {}", repo.name)).await?;

        let deployment = self
            .orchestrator
            .deploy(&repo.name, repo.kind, repo.archive)
            .await?;
        for line in deployment.build_log.lines() {
            say_raw(status, &format!("       {}\n", line)).await?;
        }
        for old in &deployment.replaced {
            say(status, &format!("Replaced previous container {}", short_id(old))).await?;
        }

        let public_url = format!("http://{}", repo.domain);
        let mut header = AppHeader {
            name: repo.name.clone(),
            repository: push.repository_name(),
            branch: repo.branch.clone(),
            commit: repo.commit.clone(),
            public_url: public_url.clone(),
            container_id: deployment.unit.id.clone(),
            status: deployment.unit.status.clone(),
            start_time: deployment.unit.created,
            route: RouteState::Unpublished {
                reason: "publishing".into(),
            },
        };
        self.apps.put(&header).await?;

        let route = match self
            .publisher
            .publish(&repo.domain, &repo.name, &deployment.unit)
            .await
        {
            Ok(RouteOutcome::Published { host_port }) => {
                debug!("{} routed to host port {}", repo.name, host_port);
                RouteState::Published {
                    url: public_url.clone(),
                }
            }
            Ok(RouteOutcome::NoHttpPort) => RouteState::NoHttpPort,
            Err(e) => {
                warn!("{} is running but unpublished: {}", repo.name, e);
                header.route = RouteState::Unpublished {
                    reason: e.to_string(),
                };
                self.apps.put(&header).await?;
                return Err(e.into());
            }
        };
        header.route = route;
        self.apps.put(&header).await?;

        match &header.route {
            RouteState::Published { url } => {
                say(status, &format!("{} deployed to {}", repo.name, url)).await?
            }
            _ => {
                say(
                    status,
                    &format!("{} is running but exposes no HTTP port", repo.name),
                )
                .await?
            }
        }
        info!(
            "Push of {} at {} deployed as {}",
            header.repository, header.commit, header.container_id
        );
        Ok(header)
    }

    /// Takes a deployed app out of service: its units, its route and its
    /// record. Returns the record as it was. Unknown names are
    /// [`crate::error::BackendError::NotFound`].
    pub async fn retire(&self, name: &str) -> Result<AppHeader, PipelineError> {
        let header = self.apps.get(name).await?;
        let removed = self.orchestrator.remove(name).await?;
        self.publisher.unpublish(name).await?;
        self.apps.delete(name).await?;
        info!("Retired {} ({} units removed)", name, removed.len());
        Ok(header)
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

async fn say<W: AsyncWrite + Unpin>(status: &mut W, line: &str) -> Result<(), PipelineError> {
    say_raw(status, &format!("-----> {}\n", line)).await
}

async fn say_raw<W: AsyncWrite + Unpin>(status: &mut W, text: &str) -> Result<(), PipelineError> {
    status
        .write_all(text.as_bytes())
        .await
        .map_err(PipelineError::Status)?;
    status.flush().await.map_err(PipelineError::Status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::checkout::tests::{push, tar_of};
    use crate::config::NginxConfig;
    use crate::orchestrator::tests::{FakeCompose, FakeRuntime};
    use crate::publish::tests::nginx_dirs;
    use crate::runtime::ContainerRuntime;

    struct Harness {
        runtime: Arc<FakeRuntime>,
        apps: AppStore,
        nginx: NginxConfig,
        pipeline: Pipeline,
        _root: tempfile::TempDir,
    }

    fn harness(runtime: FakeRuntime, reload: &str, master_only: bool) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let nginx = nginx_dirs(root.path(), &[reload]);
        let runtime = Arc::new(runtime);
        let apps = AppStore::new(Arc::new(MemoryBackend::new()));
        let orchestrator = Orchestrator::new(
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            Arc::new(FakeCompose::default()),
            root.path().join(LOCKS_DIR),
        );
        let pipeline = Pipeline::new(
            orchestrator,
            RoutePublisher::new(nginx.clone()),
            apps.clone(),
            master_only,
        );
        Harness {
            runtime,
            apps,
            nginx,
            pipeline,
            _root: root,
        }
    }

    async fn run(
        h: &Harness,
        repo: &str,
        branch: &str,
    ) -> (Result<AppHeader, PipelineError>, String) {
        let archive = tar_of(&[("Dockerfile", "FROM nginx\n"), ("index.html", "hi")]);
        let mut status = Vec::new();
        let result = h
            .pipeline
            .run(&push(repo, branch), &archive[..], &mut status)
            .await;
        (result, String::from_utf8(status).unwrap())
    }

    #[tokio::test]
    async fn master_push_is_built_launched_and_published() {
        let h = harness(FakeRuntime::with_http_port("32768"), "true", false);
        let (result, status) = run(&h, "demo.git", "master").await;
        let header = result.unwrap();

        assert_eq!(header.name, "demo");
        assert_eq!(header.repository, "demo");
        assert_eq!(
            header.route,
            RouteState::Published {
                url: "http://demo.apps.test".into()
            }
        );
        assert!(h.runtime.calls().contains(&"build demo".to_string()));
        assert_eq!(h.runtime.units_named("demo").len(), 1);

        let vhost = std::fs::read_to_string(h.nginx.available_dir.join("demo")).unwrap();
        assert!(vhost.contains("server_name demo.apps.test;"));
        assert!(vhost.contains("localhost:32768"));

        assert_eq!(h.apps.get("demo").await.unwrap(), header);
        assert!(status.contains("Detected a dockerfile project (Dockerfile)"));
        assert!(status.contains("demo deployed to http://demo.apps.test"));
    }

    #[tokio::test]
    async fn feature_branch_does_not_touch_master() {
        let h = harness(FakeRuntime::with_http_port("32768"), "true", false);
        run(&h, "demo.git", "master").await.0.unwrap();
        let feature = run(&h, "demo.git", "feature").await.0.unwrap();

        assert_eq!(feature.name, "demo_feature");
        assert_eq!(feature.public_url, "http://demo_feature.apps.test");
        assert_eq!(h.runtime.units_named("demo").len(), 1);
        assert_eq!(h.runtime.units_named("demo_feature").len(), 1);
        assert!(!h
            .runtime
            .calls()
            .iter()
            .any(|c| c.starts_with("stop") || c.starts_with("remove")));
        assert!(h.nginx.available_dir.join("demo").exists());
        assert!(h.nginx.available_dir.join("demo_feature").exists());
        assert_eq!(h.apps.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn master_only_rejects_other_branches_before_deploying() {
        let h = harness(FakeRuntime::default(), "true", true);
        let (result, _) = run(&h, "demo.git", "feature").await;

        assert!(matches!(result, Err(PipelineError::BranchRejected(ref b)) if b == "feature"));
        assert!(h.runtime.calls().is_empty());
        assert!(h.apps.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_leaves_an_unpublished_record() {
        let h = harness(FakeRuntime::with_http_port("32768"), "false", false);
        let (result, _) = run(&h, "demo.git", "master").await;

        assert!(matches!(result, Err(PipelineError::Publish(_))));
        assert_eq!(h.runtime.units_named("demo").len(), 1);
        let header = h.apps.get("demo").await.unwrap();
        assert!(matches!(
            header.route,
            RouteState::Unpublished { ref reason } if reason.contains("reload")
        ));
    }

    #[tokio::test]
    async fn app_without_http_port_runs_unrouted() {
        let h = harness(FakeRuntime::default(), "true", false);
        let header = run(&h, "demo.git", "master").await.0.unwrap();

        assert_eq!(header.route, RouteState::NoHttpPort);
        assert!(!h.nginx.available_dir.join("demo").exists());
    }

    #[tokio::test]
    async fn retired_app_leaves_no_unit_route_or_record() {
        let h = harness(FakeRuntime::with_http_port("32768"), "true", false);
        run(&h, "demo.git", "master").await.0.unwrap();
        run(&h, "blog.git", "master").await.0.unwrap();

        let retired = h.pipeline.retire("demo").await.unwrap();
        assert_eq!(retired.name, "demo");
        assert!(h.runtime.units_named("demo").is_empty());
        assert_eq!(h.runtime.units_named("blog").len(), 1);
        assert!(!h.nginx.available_dir.join("demo").exists());
        assert!(std::fs::symlink_metadata(h.nginx.enabled_dir.join("demo")).is_err());
        assert!(h.nginx.available_dir.join("blog").exists());
        assert!(h.apps.get("demo").await.unwrap_err().is_not_found());

        let err = h.pipeline.retire("demo").await.unwrap_err();
        assert!(matches!(err, PipelineError::Backend(ref e) if e.is_not_found()));
    }

    #[tokio::test]
    async fn unbuildable_push_never_reaches_the_daemon() {
        let h = harness(FakeRuntime::default(), "true", false);
        let archive = tar_of(&[("README.md", "# demo")]);
        let mut status = Vec::new();
        let err = h
            .pipeline
            .run(&push("demo.git", "master"), &archive[..], &mut status)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Archive(crate::error::CheckoutError::NoBuildableProject)
        ));
        assert!(h.runtime.calls().is_empty());
    }
}
