//! sparta-bridge binary: serves invocations over HTTP.

use std::sync::Arc;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use sparta_bridge::transport::{ServerConfig, serve};
use sparta_bridge::{Bridge, BridgeConfig, EnvironmentInfo};

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("SPARTA_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("sparta_bridge={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    EnvironmentInfo::detect().log();

    let config = BridgeConfig::from_env()?;
    tracing::info!(
        binary = %config.binary_source().display(),
        worker_url = %config.worker_url,
        service = %config.service_name,
        "Bridge configuration"
    );

    let bridge = Bridge::start(config)?;
    serve(ServerConfig::from_env()?, Arc::new(bridge)).await
}
