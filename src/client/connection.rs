//! Client Connection
//!
//! One connection per invocation: connect, write one request line, read
//! one response line, close. The whole round trip sits under a single
//! timeout, and a missing socket fails immediately instead of hanging:
//! the daemon is either warm or absent, never worth waiting for.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use crate::config::Config;
use crate::daemon::protocol::{decode_line, encode_line, Request, Response, MAX_LINE_BYTES};

use super::ClientError;

pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl DaemonClient {
    pub fn new(config: &Config) -> Self {
        Self {
            socket_path: config.socket_path(),
            timeout: Duration::from_millis(config.daemon.client_timeout_ms),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one request and wait for its response, bounded by the client
    /// timeout. On timeout only this wait is cancelled; the daemon may
    /// still finish the call and discard the response.
    pub async fn round_trip(&self, request: &Request) -> Result<Response, ClientError> {
        let timeout_ms = self.timeout.as_millis() as u64;
        tokio::time::timeout(self.timeout, self.round_trip_inner(request))
            .await
            .map_err(|_| ClientError::Timeout(timeout_ms))?
    }

    async fn round_trip_inner(&self, request: &Request) -> Result<Response, ClientError> {
        let unavailable = || ClientError::ConnectionUnavailable {
            socket: self.socket_path.display().to_string(),
        };

        // Fail fast when the daemon has never started here.
        if !self.socket_path.exists() {
            return Err(unavailable());
        }

        debug!("Connecting to daemon at {}", self.socket_path.display());
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            if matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
            ) {
                unavailable()
            } else {
                ClientError::Protocol(format!("connect failed: {e}"))
            }
        })?;

        let (read_half, mut write_half) = stream.into_split();

        let encoded = encode_line(request)
            .map_err(|e| ClientError::Protocol(format!("failed to encode request: {e}")))?;
        write_half
            .write_all(&encoded)
            .await
            .map_err(|e| ClientError::Protocol(format!("failed to send request: {e}")))?;
        write_half
            .flush()
            .await
            .map_err(|e| ClientError::Protocol(format!("failed to flush request: {e}")))?;

        let mut reader = BufReader::new(read_half).take(MAX_LINE_BYTES as u64 + 1);
        let mut line: Vec<u8> = Vec::new();
        reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| ClientError::Protocol(format!("failed to read response: {e}")))?;

        if line.is_empty() {
            return Err(ClientError::Protocol("empty response from daemon".to_string()));
        }
        if line.len() > MAX_LINE_BYTES {
            return Err(ClientError::Protocol(format!(
                "response exceeds {MAX_LINE_BYTES} bytes"
            )));
        }

        decode_line(&line).map_err(|e| ClientError::Protocol(format!("malformed response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;

    fn client_for_missing_socket() -> (DaemonClient, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.daemon.state_dir = dir.path().to_path_buf();
        config.daemon.client_timeout_ms = 500;
        (DaemonClient::new(&config), dir)
    }

    #[tokio::test]
    async fn missing_socket_fails_fast() {
        let (client, _dir) = client_for_missing_socket();
        let request = Request::new("daemon", "health", json!({}));

        let started = Instant::now();
        let err = client.round_trip(&request).await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionUnavailable { .. }));
        // Fail-fast bound: far under the configured round-trip timeout.
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn stale_socket_file_is_connection_unavailable() {
        let (client, dir) = client_for_missing_socket();
        // A socket file with no listener behind it: bind and drop.
        let path = dir.path().join("gateway.sock");
        drop(tokio::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let request = Request::new("daemon", "health", json!({}));
        let err = client.round_trip(&request).await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionUnavailable { .. }));
    }
}
