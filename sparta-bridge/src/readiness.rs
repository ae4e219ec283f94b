//! Out-of-band readiness: the worker sends SIGUSR2 to the host once its
//! listener is bound.
//!
//! Every delivery is forwarded; the supervisor only honors the first one per
//! spawn.

use tokio::task::JoinHandle;

use crate::supervisor::SupervisorHandle;

/// Subscribe to SIGUSR2 and relay deliveries to the supervisor.
///
/// Must be called before the first worker is spawned: the default SIGUSR2
/// action terminates the host.
#[cfg(unix)]
pub fn listen_for_readiness(supervisor: SupervisorHandle) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut signals = signal(SignalKind::user_defined2())?;
    tracing::debug!("Installed SIGUSR2 readiness handler");

    Ok(tokio::spawn(async move {
        while signals.recv().await.is_some() {
            tracing::info!("SIGUSR2 signal received");
            if !supervisor.notify_ready() {
                break;
            }
        }
        tracing::debug!("Readiness listener exiting");
    }))
}

#[cfg(not(unix))]
pub fn listen_for_readiness(_supervisor: SupervisorHandle) -> std::io::Result<JoinHandle<()>> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "readiness signals require a unix host",
    ))
}
