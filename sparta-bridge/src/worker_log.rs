//! Relay of worker stdout/stderr into tracing.
//!
//! The Go worker logs through logrus; in JSON mode each line carries `level`
//! and `msg`, which are re-emitted at the matching tracing level. Plain lines
//! are emitted at INFO.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::Level;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WorkerLine {
    pub level: Level,
    pub message: String,
}

fn parse_level(level: &str) -> Level {
    match level.to_ascii_lowercase().as_str() {
        "panic" | "fatal" | "error" => Level::ERROR,
        "warn" | "warning" => Level::WARN,
        "debug" => Level::DEBUG,
        "trace" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Parse one output line. Blank lines yield `None`.
pub(crate) fn parse_worker_line(line: &str) -> Option<WorkerLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.starts_with('{')
        && let Ok(serde_json::Value::Object(fields)) = serde_json::from_str(trimmed)
        && let Some(serde_json::Value::String(msg)) = fields.get("msg")
    {
        let level = fields
            .get("level")
            .and_then(|l| l.as_str())
            .map(parse_level)
            .unwrap_or(Level::INFO);
        return Some(WorkerLine {
            level,
            message: msg.clone(),
        });
    }

    Some(WorkerLine {
        level: Level::INFO,
        message: trimmed.to_string(),
    })
}

fn emit_worker_line(stream: &'static str, line: &str) {
    let Some(WorkerLine { level, message }) = parse_worker_line(line) else {
        return;
    };

    match level {
        Level::ERROR => tracing::error!(target: "sparta_bridge::worker", stream, "{}", message),
        Level::WARN => tracing::warn!(target: "sparta_bridge::worker", stream, "{}", message),
        Level::DEBUG => tracing::debug!(target: "sparta_bridge::worker", stream, "{}", message),
        Level::TRACE => tracing::trace!(target: "sparta_bridge::worker", stream, "{}", message),
        _ => tracing::info!(target: "sparta_bridge::worker", stream, "{}", message),
    }
}

/// Spawn a task that relays `reader` line by line until EOF.
pub(crate) fn relay_output<R>(reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => emit_worker_line(stream, &line),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(stream, error = %e, "Worker output stream error");
                    break;
                }
            }
        }
        tracing::trace!(stream, "Worker output relay exiting");
    });
}
