//! Gateway Server
//!
//! Unix domain socket accept loop. Each connection carries exactly one
//! newline-delimited request and gets exactly one newline-delimited
//! response; connection tasks run behind a bounded pool so a burst of
//! client spawns cannot exhaust daemon resources.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::handler::RequestHandler;
use super::protocol::{encode_line, ErrorCode, Response, ResponseMeta, MAX_LINE_BYTES};

pub struct GatewayServer {
    socket_path: PathBuf,
    handler: Arc<RequestHandler>,
    max_connections: usize,
    shutdown_grace: Duration,
}

impl GatewayServer {
    pub fn new(socket_path: PathBuf, handler: Arc<RequestHandler>) -> Self {
        let config = &handler.state().config().daemon;
        let max_connections = config.max_connections;
        let shutdown_grace = Duration::from_secs(config.shutdown_grace_secs);
        Self {
            socket_path,
            handler,
            max_connections,
            shutdown_grace,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Run the accept loop until shutdown, then drain in-flight
    /// connections for the grace period and abort whatever remains.
    ///
    /// A bind failure here is fatal by design: a daemon that cannot listen
    /// is restart-worthy, and external supervision owns the restart.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .context("failed to remove existing socket file")?;
        }

        let listener =
            UnixListener::bind(&self.socket_path).context("failed to bind to Unix socket")?;

        // Private data flows over this socket; owner-only access.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!("Gateway listening on {}", self.socket_path.display());

        let semaphore = Arc::new(Semaphore::new(self.max_connections));
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            // Hold a pool slot before accepting; excess clients queue in
            // the listener backlog instead of spawning unbounded tasks.
            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.recv() => break,
            };

            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        debug!("New client connection");
                        let handler = Arc::clone(&self.handler);
                        tasks.spawn(async move {
                            let _permit = permit;
                            if let Err(e) = handle_connection(stream, handler).await {
                                debug!("Connection ended with error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                },
                _ = shutdown.recv() => break,
            }
        }

        // Stop accepting before draining so no new work sneaks in.
        drop(listener);
        if !tasks.is_empty() {
            info!(
                "Draining {} in-flight connection(s), grace {:?}",
                tasks.len(),
                self.shutdown_grace
            );
            let drained = tokio::time::timeout(self.shutdown_grace, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("Grace period expired, closing remaining connections");
                tasks.shutdown().await;
            }
        }

        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        info!("Gateway stopped");
        Ok(())
    }
}

/// Serve one connection: one request line in, one response line out.
async fn handle_connection(stream: UnixStream, handler: Arc<RequestHandler>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();

    // Bound the read so a client cannot stream an endless "line".
    let mut reader = BufReader::new(read_half).take(MAX_LINE_BYTES as u64 + 1);
    let mut line: Vec<u8> = Vec::new();
    reader.read_until(b'\n', &mut line).await?;

    if line.is_empty() {
        debug!("Client disconnected without sending a request");
        return Ok(());
    }

    let response = if line.len() > MAX_LINE_BYTES {
        Response::error(
            None,
            ErrorCode::ProtocolError,
            format!("request exceeds {MAX_LINE_BYTES} bytes"),
            ResponseMeta {
                duration_ms: 0.0,
                service: String::new(),
            },
        )
    } else {
        handler.handle_line(&line).await
    };

    let encoded = encode_line(&response)?;
    write_half.write_all(&encoded).await?;
    write_half.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::daemon::protocol::{decode_line, Request};
    use crate::daemon::registry::DaemonState;
    use serde_json::json;

    struct TestServer {
        socket_path: PathBuf,
        shutdown_tx: broadcast::Sender<()>,
        task: tokio::task::JoinHandle<Result<()>>,
        _dir: tempfile::TempDir,
    }

    async fn spawn_server() -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("contacts.json"),
            r#"[{"name": "John Doe", "phone": "4155551234"}]"#,
        )
        .unwrap();

        let mut config = Config::default();
        config.daemon.state_dir = dir.path().to_path_buf();
        config.daemon.max_connections = 8;
        config.daemon.shutdown_grace_secs = 1;
        config.contacts.path = dir.path().join("contacts.json");
        config.reminders.db_path = dir.path().join("reminders.db");
        config.messages.db_path = dir.path().join("missing/chat.db");

        let socket_path = config.socket_path();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
        let state = Arc::new(DaemonState::new(config));
        let handler = Arc::new(RequestHandler::new(state, shutdown_tx.clone()));
        let server = GatewayServer::new(socket_path.clone(), handler);

        let task = tokio::spawn(async move { server.run(shutdown_rx).await });
        for _ in 0..100 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        TestServer {
            socket_path,
            shutdown_tx,
            task,
            _dir: dir,
        }
    }

    async fn raw_roundtrip(socket_path: &Path, line: &[u8]) -> Response {
        let mut stream = UnixStream::connect(socket_path).await.unwrap();
        stream.write_all(line).await.unwrap();
        let mut reader = BufReader::new(stream);
        let mut response_line = Vec::new();
        reader.read_until(b'\n', &mut response_line).await.unwrap();
        decode_line(&response_line).unwrap()
    }

    #[tokio::test]
    async fn serves_one_request_per_connection() {
        let server = spawn_server().await;
        let request = Request::new("contacts", "resolve", json!({"query": "John"}));
        let line = encode_line(&request).unwrap();
        let response = raw_roundtrip(&server.socket_path, &line).await;
        assert!(response.ok);
        assert_eq!(response.id.as_deref(), Some(request.id.as_str()));

        server.shutdown_tx.send(()).unwrap();
        server.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_line_gets_protocol_error_and_daemon_survives() {
        let server = spawn_server().await;
        let bad = raw_roundtrip(&server.socket_path, b"this is not json\n").await;
        assert!(!bad.ok);
        assert_eq!(bad.error.unwrap().code, ErrorCode::ProtocolError);

        let request = Request::new("daemon", "health", json!({}));
        let good = raw_roundtrip(&server.socket_path, &encode_line(&request).unwrap()).await;
        assert!(good.ok, "daemon must survive a malformed request");

        server.shutdown_tx.send(()).unwrap();
        server.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_removes_socket_file() {
        let server = spawn_server().await;
        assert!(server.socket_path.exists());
        server.shutdown_tx.send(()).unwrap();
        server.task.await.unwrap().unwrap();
        assert!(!server.socket_path.exists());
    }
}
