//! Wire envelopes exchanged with the worker.
//!
//! Request: `{"event": .., "context": ..}` posted as JSON.
//! Response: status code + headers + body, normalized into either a success
//! value or a [`HandlerFailure`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::status_text::status_text;

/// Request body sent to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub event: serde_json::Value,
    pub context: serde_json::Value,
}

impl RequestEnvelope {
    /// Build an envelope, decoding `event.body` in place when it holds JSON text.
    ///
    /// API Gateway mapping templates deliver the body as a string. A body that
    /// is not valid JSON is left untouched.
    pub fn new(mut event: serde_json::Value, context: serde_json::Value) -> Self {
        if let Some(body) = event.get_mut("body") {
            let decoded = match body {
                serde_json::Value::String(text) if !text.is_empty() => {
                    serde_json::from_str::<serde_json::Value>(text).ok()
                }
                _ => None,
            };
            if let Some(value) = decoded {
                *body = value;
            }
        }
        Self { event, context }
    }
}

/// Structured failure for worker responses with status >= 400.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerFailure {
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub error: String,
}

impl HandlerFailure {
    pub fn new(code: u16, headers: BTreeMap<String, String>, body: String) -> Self {
        Self {
            code,
            status: status_text(code).map(str::to_string),
            headers,
            error: body,
        }
    }

    pub fn to_json(&self) -> String {
        // A struct of strings and integers always serializes.
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"code":{},"error":"unserializable failure"}}"#, self.code)
        })
    }
}

impl std::fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_json())
    }
}

/// Normalized worker response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEnvelope {
    Success(serde_json::Value),
    Failure(HandlerFailure),
}

impl ResponseEnvelope {
    pub fn from_parts(status: u16, headers: BTreeMap<String, String>, body: String) -> Self {
        if status >= 400 {
            return Self::Failure(HandlerFailure::new(status, headers, body));
        }

        match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(value) => Self::Success(value),
            Err(_) => Self::Success(serde_json::Value::String(body)),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }
}

/// Flatten response headers into lowercase name -> value pairs.
///
/// Repeated headers are joined with `", "`.
pub fn flatten_headers(headers: &reqwest::header::HeaderMap) -> BTreeMap<String, String> {
    let mut flat: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match flat.get_mut(name.as_str()) {
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(&value);
            }
            None => {
                flat.insert(name.as_str().to_string(), value);
            }
        }
    }
    flat
}
