//! Bridge configuration, loaded from the environment.

use std::path::PathBuf;
use std::time::Duration;

use crate::forwarder::DEFAULT_WORKER_URL;
use crate::supervisor::MAXIMUM_RESPAWN_COUNT;

pub const DEFAULT_BINARY_NAME: &str = "Sparta.lambda.amd64";
pub const DEFAULT_SERVICE_NAME: &str = "SpartaService";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub binary_name: String,
    pub service_name: String,
    /// Directory holding the shipped worker binary.
    pub task_root: PathBuf,
    /// Writable directory the binary is materialized into.
    pub binary_dir: PathBuf,
    pub worker_url: String,
    pub max_respawn_count: u32,
    pub metrics_url: Option<String>,
    pub shutdown_grace: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            binary_name: DEFAULT_BINARY_NAME.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            task_root: PathBuf::from("."),
            binary_dir: std::env::temp_dir(),
            worker_url: DEFAULT_WORKER_URL.to_string(),
            max_respawn_count: MAXIMUM_RESPAWN_COUNT,
            metrics_url: None,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(name) = get("SPARTA_BINARY_NAME") {
            config.binary_name = name;
        }
        if let Some(name) = get("SPARTA_SERVICE_NAME") {
            config.service_name = name;
        }
        if let Some(root) = get("SPARTA_TASK_ROOT").or_else(|| get("LAMBDA_TASK_ROOT")) {
            config.task_root = PathBuf::from(root);
        }
        if let Some(dir) = get("SPARTA_BINARY_DIR") {
            config.binary_dir = PathBuf::from(dir);
        }
        if let Some(url) = get("SPARTA_WORKER_URL") {
            config.worker_url = url;
        }
        if let Some(raw) = get("SPARTA_MAX_RESPAWN_COUNT") {
            config.max_respawn_count = parse("SPARTA_MAX_RESPAWN_COUNT", &raw)?;
        }
        config.metrics_url = get("SPARTA_METRICS_URL");
        if let Some(raw) = get("SPARTA_SHUTDOWN_GRACE_MS") {
            config.shutdown_grace = Duration::from_millis(parse("SPARTA_SHUTDOWN_GRACE_MS", &raw)?);
        }

        Ok(config)
    }

    pub fn with_binary_name(mut self, name: impl Into<String>) -> Self {
        self.binary_name = name.into();
        self
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_task_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.task_root = dir.into();
        self
    }

    pub fn with_binary_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.binary_dir = dir.into();
        self
    }

    pub fn with_worker_url(mut self, url: impl Into<String>) -> Self {
        self.worker_url = url.into();
        self
    }

    pub fn with_max_respawn_count(mut self, n: u32) -> Self {
        self.max_respawn_count = n;
        self
    }

    pub fn with_metrics_url(mut self, url: impl Into<String>) -> Self {
        self.metrics_url = Some(url.into());
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Where the binary ships in the deployment package.
    pub fn binary_source(&self) -> PathBuf {
        self.task_root.join(&self.binary_name)
    }

    /// Where the binary is executed from.
    pub fn binary_target(&self) -> PathBuf {
        self.binary_dir.join(&self.binary_name)
    }
}

fn parse<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = BridgeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.binary_name, "Sparta.lambda.amd64");
        assert_eq!(config.service_name, "SpartaService");
        assert_eq!(config.worker_url, "http://localhost:9999");
        assert_eq!(config.max_respawn_count, 5);
        assert!(config.metrics_url.is_none());
        assert_eq!(config.binary_source(), PathBuf::from("./Sparta.lambda.amd64"));
        assert_eq!(
            config.binary_target(),
            std::env::temp_dir().join("Sparta.lambda.amd64")
        );
    }

    #[test]
    fn env_overrides() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("SPARTA_BINARY_NAME", "hello.lambda"),
            ("SPARTA_SERVICE_NAME", "Hello"),
            ("LAMBDA_TASK_ROOT", "/var/task"),
            ("SPARTA_BINARY_DIR", "/scratch"),
            ("SPARTA_WORKER_URL", "http://127.0.0.1:7777"),
            ("SPARTA_MAX_RESPAWN_COUNT", "2"),
            ("SPARTA_METRICS_URL", "http://metrics.local/put"),
            ("SPARTA_SHUTDOWN_GRACE_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.binary_source(), PathBuf::from("/var/task/hello.lambda"));
        assert_eq!(config.binary_target(), PathBuf::from("/scratch/hello.lambda"));
        assert_eq!(config.service_name, "Hello");
        assert_eq!(config.worker_url, "http://127.0.0.1:7777");
        assert_eq!(config.max_respawn_count, 2);
        assert_eq!(config.metrics_url.as_deref(), Some("http://metrics.local/put"));
        assert_eq!(config.shutdown_grace, Duration::from_millis(250));
    }

    #[test]
    fn sparta_task_root_wins_over_lambda_task_root() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("SPARTA_TASK_ROOT", "/opt/sparta"),
            ("LAMBDA_TASK_ROOT", "/var/task"),
        ]))
        .unwrap();
        assert_eq!(config.task_root, PathBuf::from("/opt/sparta"));
    }

    #[test]
    fn empty_values_are_ignored() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("SPARTA_METRICS_URL", ""),
            ("SPARTA_BINARY_NAME", "  "),
        ]))
        .unwrap();
        assert!(config.metrics_url.is_none());
        assert_eq!(config.binary_name, DEFAULT_BINARY_NAME);
    }

    #[test]
    fn invalid_respawn_count_is_rejected() {
        let err = BridgeConfig::from_lookup(lookup(&[("SPARTA_MAX_RESPAWN_COUNT", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("SPARTA_MAX_RESPAWN_COUNT"));
    }

    #[test]
    fn builder_setters() {
        let config = BridgeConfig::default()
            .with_binary_name("w")
            .with_task_root("/src")
            .with_binary_dir("/dst")
            .with_max_respawn_count(0)
            .with_metrics_url("http://m");
        assert_eq!(config.binary_source(), PathBuf::from("/src/w"));
        assert_eq!(config.binary_target(), PathBuf::from("/dst/w"));
        assert_eq!(config.max_respawn_count, 0);
        assert_eq!(config.metrics_url.as_deref(), Some("http://m"));
    }
}
