//! Lifecycle counters.
//!
//! Counters are best-effort: posts run on their own task and a failed post is
//! logged, never propagated to the request path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MetricName {
    #[serde(rename = "ProcessCreated")]
    Created,
    #[serde(rename = "ProcessReused")]
    Reused,
    #[serde(rename = "ProcessTerminated")]
    Terminated,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "ProcessCreated",
            Self::Reused => "ProcessReused",
            Self::Terminated => "ProcessTerminated",
        }
    }
}

impl std::fmt::Display for MetricName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("metrics request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("metrics sink rejected datapoint with status {0}")]
    Rejected(u16),
}

/// Destination for counter datapoints.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn put_counter(&self, namespace: &str, name: MetricName) -> Result<(), MetricsError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct MetricDatum {
    metric_name: MetricName,
    unit: &'static str,
    value: u64,
}

/// PutMetricData-shaped document.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct PutMetricData<'a> {
    metric_data: Vec<MetricDatum>,
    namespace: &'a str,
}

impl<'a> PutMetricData<'a> {
    fn count(namespace: &'a str, name: MetricName) -> Self {
        Self {
            metric_data: vec![MetricDatum {
                metric_name: name,
                unit: "Count",
                value: 1,
            }],
            namespace,
        }
    }
}

/// Posts counters as JSON to a metrics endpoint.
pub struct HttpMetricsSink {
    url: String,
    client: reqwest::Client,
}

impl HttpMetricsSink {
    pub fn new(url: impl Into<String>) -> Result<Self, MetricsError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl MetricsSink for HttpMetricsSink {
    async fn put_counter(&self, namespace: &str, name: MetricName) -> Result<(), MetricsError> {
        let response = self
            .client
            .post(&self.url)
            .json(&PutMetricData::count(namespace, name))
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(MetricsError::Rejected(response.status().as_u16()))
        }
    }
}

/// Writes counters to the log.
pub struct LogMetricsSink;

#[async_trait]
impl MetricsSink for LogMetricsSink {
    async fn put_counter(&self, namespace: &str, name: MetricName) -> Result<(), MetricsError> {
        tracing::info!(
            target: "sparta_bridge::metrics",
            namespace,
            metric = %name,
            unit = "Count",
            value = 1,
            "Metric"
        );
        Ok(())
    }
}

/// Fire-and-forget counter emitter bound to a namespace.
#[derive(Clone)]
pub struct MetricEmitter {
    namespace: String,
    sink: Arc<dyn MetricsSink>,
}

impl MetricEmitter {
    pub fn new(service_name: &str, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            namespace: format!("Sparta/{}", service_name),
            sink,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Emit one count of `name`.
    ///
    /// The returned handle resolves once the post finished, whether it
    /// succeeded or not. Dropping it does not cancel the post.
    pub fn emit(&self, name: MetricName) -> JoinHandle<()> {
        let sink = Arc::clone(&self.sink);
        let namespace = self.namespace.clone();
        tokio::spawn(async move {
            if let Err(e) = sink.put_counter(&namespace, name).await {
                tracing::warn!(metric = %name, error = %e, "Failed to post metric");
            }
        })
    }
}
