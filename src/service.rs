//! Long-running services and the supervisor that owns their lifetime.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info};

use crate::backend::Backend;
use crate::config::Configuration;

/// A unit the supervisor can start and stop. `start` returns once the
/// service is accepting work; `stop` makes its accept loop return.
#[async_trait]
pub trait Service: Send {
    fn name(&self) -> &'static str;

    async fn start(&mut self) -> anyhow::Result<()>;

    async fn stop(&mut self) -> anyhow::Result<()>;
}

pub type ServiceConstructor = fn(&Configuration, Arc<dyn Backend>) -> Box<dyn Service>;

pub struct Supervisor {
    services: Vec<Box<dyn Service>>,
}

impl Supervisor {
    pub fn new(
        constructors: &[ServiceConstructor],
        config: &Configuration,
        backend: Arc<dyn Backend>,
    ) -> Self {
        Self {
            services: constructors
                .iter()
                .map(|construct| construct(config, Arc::clone(&backend)))
                .collect(),
        }
    }

    /// Starts every service, waits for `shutdown`, then stops them in
    /// reverse order.
    ///
    /// The first failing `start` is returned straight away; services started
    /// before it keep running. Stop errors are logged and the remaining
    /// services are still stopped.
    pub async fn run_until<F>(&mut self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        for service in self.services.iter_mut() {
            service.start().await.map_err(|e| {
                error!("Service {} failed to start: {:#}", service.name(), e);
                e.context(format!("starting {}", service.name()))
            })?;
            info!("Service {} started", service.name());
        }

        shutdown.await;
        info!("Shutting down {} services", self.services.len());

        let mut failures = Vec::new();
        for service in self.services.iter_mut().rev() {
            match service.stop().await {
                Ok(()) => info!("Service {} stopped", service.name()),
                Err(e) => {
                    error!("Service {} failed to stop: {:#}", service.name(), e);
                    failures.push(format!("{}: {:#}", service.name(), e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("failed to stop {}", failures.join("; ")))
        }
    }

    /// Runs until Ctrl+C.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.run_until(async {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, shutting down..."),
                Err(err) => error!("Unable to listen for shutdown signal: {}", err),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        log: Log,
        fail_start: bool,
        fail_stop: bool,
    }

    #[async_trait]
    impl Service for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn start(&mut self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("start {}", self.name));
            if self.fail_start {
                anyhow::bail!("port in use");
            }
            Ok(())
        }

        async fn stop(&mut self) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
            if self.fail_stop {
                anyhow::bail!("stuck");
            }
            Ok(())
        }
    }

    fn supervisor(log: &Log, specs: &[(&'static str, bool, bool)]) -> Supervisor {
        Supervisor {
            services: specs
                .iter()
                .map(|&(name, fail_start, fail_stop)| {
                    Box::new(Recorder {
                        name,
                        log: Arc::clone(log),
                        fail_start,
                        fail_stop,
                    }) as Box<dyn Service>
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn starts_in_order_and_stops_in_reverse() {
        let log = Log::default();
        let mut sup = supervisor(
            &log,
            &[("ssh", false, false), ("http", false, false), ("rpc", false, false)],
        );
        sup.run_until(async {}).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["start ssh", "start http", "start rpc", "stop rpc", "stop http", "stop ssh"]
        );
    }

    #[tokio::test]
    async fn start_failure_aborts_without_stopping() {
        let log = Log::default();
        let mut sup = supervisor(
            &log,
            &[("ssh", false, false), ("http", true, false), ("rpc", false, false)],
        );
        let err = sup.run_until(async {}).await.unwrap_err();

        assert!(format!("{:#}", err).contains("port in use"));
        assert_eq!(*log.lock().unwrap(), vec!["start ssh", "start http"]);
    }

    #[tokio::test]
    async fn stop_failures_are_collected() {
        let log = Log::default();
        let mut sup = supervisor(
            &log,
            &[("ssh", false, true), ("http", false, false), ("rpc", false, true)],
        );
        let err = sup.run_until(async {}).await.unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("ssh: stuck") && msg.contains("rpc: stuck"));
        assert_eq!(
            log.lock().unwrap().iter().filter(|l| l.starts_with("stop")).count(),
            3
        );
    }

    fn build_recorder(_: &Configuration, _: Arc<dyn Backend>) -> Box<dyn Service> {
        Box::new(Recorder {
            name: "built",
            log: Log::default(),
            fail_start: false,
            fail_stop: false,
        })
    }

    #[test]
    fn constructors_receive_config_and_backend() {
        let sup = Supervisor::new(
            &[build_recorder, build_recorder],
            &Configuration::default(),
            Arc::new(MemoryBackend::new()),
        );
        assert_eq!(sup.services.len(), 2);
        assert_eq!(sup.services[0].name(), "built");
    }
}
