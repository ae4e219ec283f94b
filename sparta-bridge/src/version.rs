//! Version and host environment information.

/// Bridge version from Cargo.toml
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Host environment summary, logged once at startup.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EnvironmentInfo {
    pub bridge: &'static str,
    pub os: &'static str,
    pub family: &'static str,
    pub arch: &'static str,
    pub pid: u32,
    /// AWS Lambda runtime environment, when running inside one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_env: Option<String>,
}

impl EnvironmentInfo {
    pub fn detect() -> Self {
        Self {
            bridge: BRIDGE_VERSION,
            os: std::env::consts::OS,
            family: std::env::consts::FAMILY,
            arch: std::env::consts::ARCH,
            pid: std::process::id(),
            execution_env: std::env::var("AWS_EXECUTION_ENV").ok(),
        }
    }

    pub fn log(&self) {
        tracing::info!(
            bridge = self.bridge,
            os = self.os,
            family = self.family,
            arch = self.arch,
            pid = self.pid,
            execution_env = self.execution_env.as_deref().unwrap_or("none"),
            "Host environment"
        );
    }
}
