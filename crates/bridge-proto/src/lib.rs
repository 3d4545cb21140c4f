//! JSON envelope protocol for host-sandbox communication.
//!
//! ## Wire Format
//!
//! One JSON object per line:
//!
//! ```text
//! {"id":7,"type":"exec","payload":{"command":"node --version","timeout_ms":5000}}\n
//! ```
//!
//! - **id**: correlation id chosen by the host; the guest echoes it back
//! - **type**: message type, snake_case
//! - **payload**: type-specific object, omitted for empty messages
//! - **error**: set by the guest instead of a typed payload when a request failed
//!
//! ## Message Types
//!
//! | Type            | Direction | Payload |
//! |-----------------|-----------|---------|
//! | `ping`          | H→G       | (empty) |
//! | `pong`          | G→H       | (empty) |
//! | `exec`          | H→G       | `{command, timeout_ms, env}` |
//! | `exec_result`   | G→H       | `{exit_code, stdout, stderr}` |
//! | `service_start` | H→G       | `{service, config}` |
//! | `service_stop`  | H→G       | `{service}` |
//! | `service_ready` | G→H       | `{service, port?}` |
//! | `ack`           | G→H       | (empty) |
//! | `invoke`        | H→G       | `{function, version, code, request, context}` |
//! | `invoke_result` | G→H       | `{status, headers, body, logs, metrics}` |
//! | `proxy`         | H→G       | `{method, path, headers, body?}` |
//! | `proxy_response`| G→H       | `{status, headers, body}` |
//! | `shutdown`      | H→G       | (empty) |
//! | `shutdown_ack`  | G→H       | (empty) |

mod message;

pub use message::{
    ExecutionContext, Invocation, InvocationMetrics, InvocationRequest, InvocationResponse,
    ProxyRequest, ProxyResponse, Request, Response, ServiceKind,
};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum encoded line size (16 MB), newline excluded.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Message type used by guests for error replies with no typed payload.
pub const ERROR_TYPE: &str = "error";

/// Protocol error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message too large: {0}")]
    MessageTooLarge(usize),
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("invalid payload for '{kind}': {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("message body is not a tagged object")]
    Untagged,
}

/// A decoded envelope whose payload has not been interpreted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    /// Wrap a typed message under `id`.
    pub fn new<T: Serialize>(id: u64, body: &T) -> Result<Self, ProtocolError> {
        let Value::Object(mut map) = serde_json::to_value(body).map_err(ProtocolError::Malformed)?
        else {
            return Err(ProtocolError::Untagged);
        };
        let Some(Value::String(kind)) = map.remove("type") else {
            return Err(ProtocolError::Untagged);
        };
        Ok(Self {
            id,
            kind,
            payload: map.remove("payload").unwrap_or(Value::Null),
            error: None,
        })
    }

    /// Build an error reply for request `id`.
    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            kind: ERROR_TYPE.to_string(),
            payload: Value::Null,
            error: Some(message.into()),
        }
    }

    /// Interpret `type` + `payload` as a typed message.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let mut map = serde_json::Map::new();
        map.insert("type".to_string(), Value::String(self.kind.clone()));
        if !self.payload.is_null() {
            map.insert("payload".to_string(), self.payload.clone());
        }
        serde_json::from_value(Value::Object(map)).map_err(|source| ProtocolError::InvalidPayload {
            kind: self.kind.clone(),
            source,
        })
    }

    /// Encode as a single newline-terminated line.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut line = serde_json::to_vec(self).map_err(ProtocolError::Malformed)?;
        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(line.len()));
        }
        line.push(b'\n');
        Ok(line)
    }
}

/// Encode a typed request under `id`.
pub fn encode_request(id: u64, request: &Request) -> Result<Vec<u8>, ProtocolError> {
    Envelope::new(id, request)?.encode()
}

/// Encode a typed response under `id`.
pub fn encode_response(id: u64, response: &Response) -> Result<Vec<u8>, ProtocolError> {
    Envelope::new(id, response)?.encode()
}

// ---------------------------------------------------------------------------
// Decoder (buffered, handles partial reads)
// ---------------------------------------------------------------------------

/// Buffered line decoder for streaming data.
///
/// Each complete line decodes independently, so one malformed envelope never
/// poisons the ones that follow it.
pub struct Decoder {
    buf: Vec<u8>,
    /// Dropping bytes until the next newline after an oversized line.
    discarding: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(64 * 1024),
            discarding: false,
        }
    }

    /// Feed data and extract complete envelopes.
    pub fn decode(&mut self, data: &[u8]) -> Vec<Result<Envelope, ProtocolError>> {
        let mut out = Vec::new();
        let mut rest = data;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = tail.get(1..).unwrap_or_default();

            if self.discarding {
                self.discarding = false;
                self.buf.clear();
                continue;
            }
            self.buf.extend_from_slice(head);
            if let Some(result) = self.take_line() {
                out.push(result);
            }
        }

        if !self.discarding {
            self.buf.extend_from_slice(rest);
            if self.buf.len() > MAX_MESSAGE_SIZE {
                out.push(Err(ProtocolError::MessageTooLarge(self.buf.len())));
                self.buf.clear();
                self.discarding = true;
            }
        }
        out
    }

    fn take_line(&mut self) -> Option<Result<Envelope, ProtocolError>> {
        let line = std::mem::take(&mut self.buf);
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        if line.len() > MAX_MESSAGE_SIZE {
            return Some(Err(ProtocolError::MessageTooLarge(line.len())));
        }
        Some(serde_json::from_slice(&line).map_err(ProtocolError::Malformed))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
