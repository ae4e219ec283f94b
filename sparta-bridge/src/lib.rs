//! sparta-bridge: supervising host for a Sparta Go worker process.

mod state;
mod version;
mod worker_log;

pub mod bridge;
pub mod config;
pub mod envelope;
pub mod forwarder;
pub mod invocation;
pub mod materializer;
pub mod metrics;
pub mod readiness;
pub mod status_text;
pub mod supervisor;
pub mod transport;

pub use bridge::{Bridge, BridgeError, RouteHandler};
pub use config::{BridgeConfig, ConfigError};
pub use envelope::{HandlerFailure, RequestEnvelope, ResponseEnvelope};
pub use forwarder::{ForwardError, Forwarder};
pub use invocation::{InvokeError, InvokeResult};
pub use materializer::{BinaryMaterializer, MaterializeError};
pub use metrics::{HttpMetricsSink, LogMetricsSink, MetricEmitter, MetricName, MetricsSink};
pub use state::{SupervisorSnapshot, WorkerState};
pub use status_text::status_text;
pub use supervisor::{
    BinarySpawner, ProcessExit, SupervisorConfig, SupervisorHandle, WorkerSpawner,
    start_supervisor,
};
pub use version::{BRIDGE_VERSION, EnvironmentInfo};
