//! Invocation types: one (event, context) pair plus its completion channel.

use tokio::sync::oneshot;

use crate::forwarder::ForwardError;

/// Errors an invocation can complete with.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error(transparent)]
    Forward(#[from] ForwardError),
    #[error("bridge halted: {0}")]
    Halted(String),
    #[error("bridge unavailable")]
    Unavailable,
}

impl InvokeError {
    /// Short error kind used by the invocation transport.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Forward(ForwardError::Handler(_)) => "HandlerError",
            Self::Forward(_) => "TransportError",
            Self::Halted(_) => "BridgeHalted",
            Self::Unavailable => "BridgeUnavailable",
        }
    }
}

pub type InvokeResult = Result<serde_json::Value, InvokeError>;

/// Single-shot completion for one invocation.
///
/// `done` consumes the completion, so a result is delivered at most once.
#[derive(Debug)]
pub struct Completion {
    tx: oneshot::Sender<InvokeResult>,
}

impl Completion {
    pub fn channel() -> (Self, oneshot::Receiver<InvokeResult>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    pub fn done(self, result: InvokeResult) {
        if self.tx.send(result).is_err() {
            tracing::debug!("Invocation caller went away before completion");
        }
    }
}

/// An invocation waiting to be forwarded to a worker route.
#[derive(Debug)]
pub struct Invocation {
    pub path: String,
    pub event: serde_json::Value,
    pub context: serde_json::Value,
    pub completion: Completion,
}

impl Invocation {
    pub fn new(
        path: impl Into<String>,
        event: serde_json::Value,
        context: serde_json::Value,
    ) -> (Self, oneshot::Receiver<InvokeResult>) {
        let (completion, rx) = Completion::channel();
        let invocation = Self {
            path: path.into(),
            event,
            context,
            completion,
        };
        (invocation, rx)
    }

    pub fn done(self, result: InvokeResult) {
        self.completion.done(result);
    }
}
