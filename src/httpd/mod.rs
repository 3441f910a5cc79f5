//! HTTP surface: health, app listing and removal, and the push webhook.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{middleware, Json, Router};
use log::{error, info, warn};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub mod auth;

use crate::backend::Backend;
use crate::checkout::{PushContext, MASTER_BRANCH};
use crate::config::{Configuration, HttpAuth};
use crate::error::PipelineError;
use crate::pipeline::Pipeline;
use crate::service::Service;
use crate::ssh::git;
use crate::store::AppStore;

pub struct HttpState {
    pub pipeline: Pipeline,
    pub apps: AppStore,
    pub hostname: String,
}

pub type SharedState = Arc<HttpState>;

#[derive(Debug, Deserialize)]
pub struct PushQuery {
    pub repository: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub commit: String,
}

fn default_branch() -> String {
    MASTER_BRANCH.to_string()
}

pub fn router(state: SharedState, auth: Option<HttpAuth>) -> Router {
    let mut protected = Router::new()
        .route("/api/v1/apps", get(list_apps))
        .route("/api/v1/apps/{name}", delete(remove_app))
        .route(
            "/hooks/push",
            post(push).layer(DefaultBodyLimit::disable()),
        );
    if let Some(auth) = auth {
        protected = protected.route_layer(middleware::from_fn_with_state(
            Arc::new(auth),
            auth::require_basic_auth,
        ));
    }

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

fn error_response(code: StatusCode, message: String) -> Response {
    (code, Json(serde_json::json!({ "error": message }))).into_response()
}

async fn list_apps(State(state): State<SharedState>) -> Response {
    match state.apps.list().await {
        Ok(apps) => Json(apps).into_response(),
        Err(e) => {
            error!("Could not list apps: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Retires an app and answers with its last record.
async fn remove_app(State(state): State<SharedState>, Path(name): Path<String>) -> Response {
    match state.pipeline.retire(&name).await {
        Ok(header) => Json(header).into_response(),
        Err(PipelineError::Backend(e)) if e.is_not_found() => {
            error_response(StatusCode::NOT_FOUND, format!("no app named {}", name))
        }
        Err(e) => {
            error!("Could not remove {}: {}", name, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Runs the pipeline on a tar body and answers with the push status log.
async fn push(
    State(state): State<SharedState>,
    Query(query): Query<PushQuery>,
    body: Bytes,
) -> Response {
    if let Err(e) = git::validate_name(&query.repository) {
        warn!("Webhook push rejected: {}", e);
        return (StatusCode::BAD_REQUEST, format!("-----> {}\n", e)).into_response();
    }
    let push = PushContext {
        repository: query.repository,
        branch: query.branch,
        commit: query.commit,
        hostname: state.hostname.clone(),
    };
    info!("Webhook push of {} ({})", push.repository, push.branch);

    let mut status = Vec::new();
    let code = match state.pipeline.run(&push, &body[..], &mut status).await {
        Ok(_) => StatusCode::OK,
        Err(e) => {
            warn!("Webhook push of {} failed: {}", push.repository, e);
            status.extend_from_slice(format!("-----> {}\n", e).as_bytes());
            StatusCode::UNPROCESSABLE_ENTITY
        }
    };
    (code, String::from_utf8_lossy(&status).into_owned()).into_response()
}

pub struct HttpService {
    config: Configuration,
    backend: Arc<dyn Backend>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<std::io::Result<()>>>,
}

impl HttpService {
    pub fn construct(config: &Configuration, backend: Arc<dyn Backend>) -> Box<dyn Service> {
        Box::new(Self {
            config: config.clone(),
            backend,
            shutdown: None,
            task: None,
        })
    }
}

#[async_trait]
impl Service for HttpService {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        let state = Arc::new(HttpState {
            pipeline: Pipeline::connect(&self.config, Arc::clone(&self.backend))?,
            apps: AppStore::new(Arc::clone(&self.backend)),
            hostname: self.config.hostname.clone(),
        });
        let app = router(state, self.config.http_auth.clone());

        let listener = TcpListener::bind(self.config.http)
            .await
            .with_context(|| format!("could not bind {}", self.config.http))?;
        info!("HTTP server listening on {}", self.config.http);

        let (tx, rx) = oneshot::channel();
        self.shutdown = Some(tx);
        self.task = Some(tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await
        }));
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.await
                .context("http server panicked")?
                .context("http server failed")?;
        }
        Ok(())
    }
}
