//! Client Module
//!
//! Client-side IPC: marshal one CLI invocation into one request, send it,
//! and hand back the result. There is deliberately no retry anywhere in
//! this module; retried writes are not idempotent and the daemon promises
//! at-most-once dispatch per client request.

pub mod connection;

pub use connection::DaemonClient;

use serde_json::Value;
use thiserror::Error;

use crate::daemon::protocol::ErrorCode;

/// Errors that can occur when communicating with the daemon.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Daemon is not running at {socket}. Start it with: commgate daemon start")]
    ConnectionUnavailable { socket: String },

    #[error("Daemon did not respond within {0} ms")]
    Timeout(u64),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{service}.{method} failed [{code:?}]: {message}")]
    Daemon {
        service: String,
        method: String,
        code: ErrorCode,
        message: String,
    },
}

impl ClientError {
    /// Process exit code for the CLI layer: distinct codes for the two
    /// availability failures so scripts can tell them apart.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::ConnectionUnavailable { .. } => 2,
            ClientError::Timeout(_) => 3,
            _ => 1,
        }
    }
}

/// Send one request and return the daemon's `result` payload.
pub async fn call(
    client: &DaemonClient,
    service: &str,
    method: &str,
    params: Value,
) -> Result<Value, ClientError> {
    let request = crate::daemon::protocol::Request::new(service, method, params);
    let request_id = request.id.clone();
    let response = client.round_trip(&request).await?;

    // Correlation check: a response carrying someone else's id means the
    // framing broke, and the payload cannot be trusted.
    if response.id.as_deref() != Some(request_id.as_str()) {
        return Err(ClientError::Protocol(format!(
            "response id {:?} does not match request id {request_id}",
            response.id
        )));
    }

    if response.ok {
        Ok(response.result.unwrap_or(Value::Null))
    } else {
        let error = response.error.unwrap_or(crate::daemon::protocol::ErrorPayload {
            code: ErrorCode::BackendError,
            message: "daemon returned no error payload".to_string(),
        });
        Err(ClientError::Daemon {
            service: service.to_string(),
            method: method.to_string(),
            code: error.code,
            message: error.message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_distinguish_failures() {
        let unavailable = ClientError::ConnectionUnavailable {
            socket: "/tmp/x.sock".to_string(),
        };
        assert_eq!(unavailable.exit_code(), 2);
        assert_eq!(ClientError::Timeout(500).exit_code(), 3);
        assert_eq!(ClientError::Protocol("x".to_string()).exit_code(), 1);
    }
}
