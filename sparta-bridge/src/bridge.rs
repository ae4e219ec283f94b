//! Bridge entry point: wires config, supervisor, and readiness together.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::BridgeConfig;
use crate::forwarder::Forwarder;
use crate::invocation::InvokeResult;
use crate::materializer::BinaryMaterializer;
use crate::metrics::{HttpMetricsSink, LogMetricsSink, MetricEmitter, MetricsError, MetricsSink};
use crate::readiness::listen_for_readiness;
use crate::state::SupervisorSnapshot;
use crate::supervisor::{SupervisorConfig, SupervisorHandle, start_supervisor};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to build metrics sink: {0}")]
    Metrics(#[from] MetricsError),
    #[error("failed to install readiness handler: {0}")]
    Readiness(#[from] std::io::Error),
}

pub struct Bridge {
    supervisor: SupervisorHandle,
    readiness: Option<JoinHandle<()>>,
}

impl Bridge {
    /// Start supervising with the production collaborators.
    pub fn start(config: BridgeConfig) -> Result<Self, BridgeError> {
        let sink: Arc<dyn MetricsSink> = match config.metrics_url {
            Some(ref url) => Arc::new(HttpMetricsSink::new(url)?),
            None => Arc::new(LogMetricsSink),
        };

        let supervisor_config = SupervisorConfig::new(
            BinaryMaterializer::new(config.binary_source(), config.binary_target()),
            Forwarder::new(&config.worker_url),
            MetricEmitter::new(&config.service_name, sink),
        )
        .with_max_respawn_count(config.max_respawn_count)
        .with_extra_path(config.task_root.clone())
        .with_shutdown_grace(config.shutdown_grace);

        Self::with_supervisor_config(supervisor_config)
    }

    pub fn with_supervisor_config(config: SupervisorConfig) -> Result<Self, BridgeError> {
        let supervisor = start_supervisor(config);
        let readiness = listen_for_readiness(supervisor.clone())?;
        Ok(Self {
            supervisor,
            readiness: Some(readiness),
        })
    }

    /// Wrap an existing supervisor; readiness must be delivered by the caller.
    pub fn from_supervisor(supervisor: SupervisorHandle) -> Self {
        Self {
            supervisor,
            readiness: None,
        }
    }

    pub async fn invoke(
        &self,
        path: &str,
        event: serde_json::Value,
        context: serde_json::Value,
    ) -> InvokeResult {
        self.supervisor.invoke(path, event, context).await
    }

    /// Handler bound to one worker route.
    pub fn handler(&self, path: impl Into<String>) -> RouteHandler {
        RouteHandler {
            path: path.into(),
            supervisor: self.supervisor.clone(),
        }
    }

    pub fn main_handler(&self) -> RouteHandler {
        self.handler("/")
    }

    pub fn supervisor(&self) -> &SupervisorHandle {
        &self.supervisor
    }

    pub async fn snapshot(&self) -> Option<SupervisorSnapshot> {
        self.supervisor.snapshot().await
    }

    /// Terminate the worker and stop listening for readiness.
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
        if let Some(ref readiness) = self.readiness {
            readiness.abort();
        }
    }
}

/// Forwards invocations to a fixed worker route.
#[derive(Clone)]
pub struct RouteHandler {
    path: String,
    supervisor: SupervisorHandle,
}

impl RouteHandler {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn invoke(
        &self,
        event: serde_json::Value,
        context: serde_json::Value,
    ) -> InvokeResult {
        self.supervisor.invoke(&self.path, event, context).await
    }
}
