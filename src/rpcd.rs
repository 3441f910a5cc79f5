//! Newline-delimited JSON RPC over TCP.
//!
//! Each request line is `{"id": .., "method": .., "params": ..}` and gets
//! exactly one response line carrying the same id.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::backend::Backend;
use crate::config::Configuration;
use crate::error::PipelineError;
use crate::pipeline::Pipeline;
use crate::service::Service;
use crate::store::AppStore;

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const NOT_FOUND: i64 = 404;
const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Clone)]
pub struct RpcHandler {
    apps: AppStore,
    pipeline: Arc<Pipeline>,
}

impl RpcHandler {
    pub fn new(apps: AppStore, pipeline: Arc<Pipeline>) -> Self {
        Self { apps, pipeline }
    }

    pub async fn handle_line(&self, line: &str) -> RpcResponse {
        match serde_json::from_str::<RpcRequest>(line) {
            Ok(request) => self.handle(request).await,
            Err(e) => RpcResponse::err(Value::Null, PARSE_ERROR, e.to_string()),
        }
    }

    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        let id = request.id;
        match request.method.as_str() {
            "ping" => RpcResponse::ok(id, Value::from("pong")),
            "apps.list" => match self.apps.list().await {
                Ok(apps) => to_result(id, &apps),
                Err(e) => RpcResponse::err(id, INTERNAL_ERROR, e.to_string()),
            },
            "apps.get" => {
                let Some(name) = app_name(&request.params) else {
                    return RpcResponse::err(id, INVALID_PARAMS, "params.name is required");
                };
                match self.apps.get(name).await {
                    Ok(app) => to_result(id, &app),
                    Err(e) if e.is_not_found() => {
                        RpcResponse::err(id, NOT_FOUND, format!("no app named {}", name))
                    }
                    Err(e) => RpcResponse::err(id, INTERNAL_ERROR, e.to_string()),
                }
            }
            "apps.kill" => {
                let Some(name) = app_name(&request.params) else {
                    return RpcResponse::err(id, INVALID_PARAMS, "params.name is required");
                };
                match self.pipeline.retire(name).await {
                    Ok(app) => to_result(id, &app),
                    Err(PipelineError::Backend(e)) if e.is_not_found() => {
                        RpcResponse::err(id, NOT_FOUND, format!("no app named {}", name))
                    }
                    Err(e) => RpcResponse::err(id, INTERNAL_ERROR, e.to_string()),
                }
            }
            other => RpcResponse::err(id, METHOD_NOT_FOUND, format!("unknown method {}", other)),
        }
    }
}

fn app_name(params: &Value) -> Option<&str> {
    params.get("name").and_then(Value::as_str)
}

fn to_result<T: Serialize>(id: Value, value: &T) -> RpcResponse {
    match serde_json::to_value(value) {
        Ok(result) => RpcResponse::ok(id, result),
        Err(e) => RpcResponse::err(id, INTERNAL_ERROR, e.to_string()),
    }
}

async fn serve_connection(stream: TcpStream, handler: RpcHandler) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = handler.handle_line(&line).await;
        let mut out = serde_json::to_vec(&response)?;
        out.push(b'\n');
        writer.write_all(&out).await?;
    }
    Ok(())
}

async fn serve(listener: TcpListener, handler: RpcHandler, mut shutdown: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, handler).await {
                            debug!("RPC connection {} closed: {}", peer, e);
                        }
                    });
                }
                Err(e) => warn!("RPC accept failed: {}", e),
            },
        }
    }
}

pub struct RpcService {
    config: Configuration,
    backend: Arc<dyn Backend>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RpcService {
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
impl Service for RpcService {
    fn name(&self) -> &'static str {
        "rpc"
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        let pipeline = Pipeline::connect(&self.config, Arc::clone(&self.backend))?;
        let handler = RpcHandler::new(AppStore::new(Arc::clone(&self.backend)), Arc::new(pipeline));

        let addr = self.config.rpc;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("could not bind {}", addr))?;
        info!("RPC server listening on {}", addr);

        let (tx, rx) = oneshot::channel();
        self.shutdown = Some(tx);
        self.task = Some(tokio::spawn(serve(listener, handler, rx)));
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.context("rpc accept loop panicked")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::orchestrator::tests::{FakeCompose, FakeRuntime};
    use crate::orchestrator::Orchestrator;
    use crate::publish::tests::nginx_dirs;
    use crate::publish::RoutePublisher;
    use crate::runtime::ContainerRuntime;
    use crate::types::{AppHeader, RouteState};
    use chrono::Utc;
    use serde_json::json;

    struct Fixture {
        handler: RpcHandler,
        runtime: Arc<FakeRuntime>,
        _root: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::default());
        runtime.add_unit("unit1", "demo", true, &[]);

        let apps = AppStore::new(Arc::new(MemoryBackend::new()));
        apps.put(&AppHeader {
            name: "demo".into(),
            repository: "demo".into(),
            branch: "master".into(),
            commit: "abc".into(),
            public_url: "http://demo.apps.test".into(),
            container_id: "unit1".into(),
            status: "running".into(),
            start_time: Utc::now(),
            route: RouteState::NoHttpPort,
        })
        .await
        .unwrap();

        let pipeline = Pipeline::new(
            Orchestrator::new(
                Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
                Arc::new(FakeCompose::default()),
                root.path().join("locks"),
            ),
            RoutePublisher::new(nginx_dirs(root.path(), &["true"])),
            apps.clone(),
            false,
        );
        Fixture {
            handler: RpcHandler::new(apps, Arc::new(pipeline)),
            runtime,
            _root: root,
        }
    }

    #[tokio::test]
    async fn ping_echoes_the_id() {
        let f = fixture().await;
        let response = f.handler.handle_line(r#"{"id": 7, "method": "ping"}"#).await;
        assert_eq!(response, RpcResponse::ok(json!(7), json!("pong")));
    }

    #[tokio::test]
    async fn apps_can_be_listed_and_fetched() {
        let f = fixture().await;

        let list = f.handler.handle_line(r#"{"id": 1, "method": "apps.list"}"#).await;
        assert_eq!(list.result.unwrap()[0]["name"], "demo");

        let get = f
            .handler
            .handle_line(r#"{"id": 2, "method": "apps.get", "params": {"name": "demo"}}"#)
            .await;
        assert_eq!(get.result.unwrap()["container_id"], "unit1");

        let missing = f
            .handler
            .handle_line(r#"{"id": 3, "method": "apps.get", "params": {"name": "nope"}}"#)
            .await;
        assert_eq!(missing.error.unwrap().code, NOT_FOUND);
    }

    #[tokio::test]
    async fn killed_app_is_gone() {
        let f = fixture().await;

        let kill = f
            .handler
            .handle_line(r#"{"id": 5, "method": "apps.kill", "params": {"name": "demo"}}"#)
            .await;
        assert_eq!(kill.result.unwrap()["name"], "demo");
        assert!(f.runtime.units_named("demo").is_empty());

        let list = f.handler.handle_line(r#"{"id": 6, "method": "apps.list"}"#).await;
        assert_eq!(list.result.unwrap(), json!([]));

        let again = f
            .handler
            .handle_line(r#"{"id": 7, "method": "apps.kill", "params": {"name": "demo"}}"#)
            .await;
        assert_eq!(again.error.unwrap().code, NOT_FOUND);
    }

    #[tokio::test]
    async fn bad_requests_get_error_objects() {
        let f = fixture().await;

        let unknown = f.handler.handle_line(r#"{"id": "x", "method": "apps.delete"}"#).await;
        assert_eq!(unknown.id, json!("x"));
        assert_eq!(unknown.error.unwrap().code, METHOD_NOT_FOUND);

        let no_params = f.handler.handle_line(r#"{"id": 4, "method": "apps.get"}"#).await;
        assert_eq!(no_params.error.unwrap().code, INVALID_PARAMS);

        let no_name = f.handler.handle_line(r#"{"id": 8, "method": "apps.kill"}"#).await;
        assert_eq!(no_name.error.unwrap().code, INVALID_PARAMS);

        let garbage = f.handler.handle_line("not json").await;
        assert_eq!(garbage.id, Value::Null);
        assert_eq!(garbage.error.unwrap().code, PARSE_ERROR);
    }

    #[tokio::test]
    async fn accept_loop_answers_over_tcp_until_shut_down() {
        let f = fixture().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(serve(listener, f.handler.clone(), rx));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        writer.write_all(b"{\"id\":1,\"method\":\"ping\"}\n").await.unwrap();
        let mut lines = BufReader::new(reader).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"id":1,"result":"pong"}"#);

        tx.send(()).unwrap();
        task.await.unwrap();
    }
}
