//! Request Handler
//!
//! Turns one raw request line into one response: parse, validate, resolve
//! the target backend, invoke it under a timer and a timeout, and convert
//! every failure into a structured error payload. Nothing that happens in
//! here may take the process or a sibling connection down.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::protocol::{decode_line, ErrorCode, Request, Response, ResponseMeta, PROTOCOL_VERSION};
use super::registry::{BackendLookup, DaemonState};

/// Service name handled by the dispatcher itself.
const BUILTIN_SERVICE: &str = "daemon";

pub struct RequestHandler {
    state: Arc<DaemonState>,
    shutdown_tx: broadcast::Sender<()>,
}

impl RequestHandler {
    pub fn new(state: Arc<DaemonState>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self { state, shutdown_tx }
    }

    pub fn state(&self) -> &Arc<DaemonState> {
        &self.state
    }

    /// Handle one request line and produce the response to write back.
    pub async fn handle_line(&self, line: &[u8]) -> Response {
        let started = Instant::now();

        let request: Request = match decode_line(line) {
            Ok(req) => req,
            Err(e) => {
                // Salvage the id for correlation if the line is valid JSON
                // with one, even though the request itself is malformed.
                let id = serde_json::from_slice::<Value>(line)
                    .ok()
                    .and_then(|v| v.get("id").and_then(Value::as_str).map(str::to_string));
                return Response::error(
                    id,
                    ErrorCode::ProtocolError,
                    format!("malformed request: {e}"),
                    self.meta(started, ""),
                );
            }
        };

        self.handle(request, started).await
    }

    /// Handle a parsed request.
    pub async fn handle(&self, request: Request, started: Instant) -> Response {
        let Request {
            id,
            version,
            service,
            method,
            params,
        } = request;
        debug!("Dispatching {}.{}", service, method);

        if version != PROTOCOL_VERSION {
            return Response::error(
                Some(id),
                ErrorCode::ProtocolError,
                format!("unsupported protocol version {version}"),
                self.meta(started, &service),
            );
        }
        if service.is_empty() || method.is_empty() {
            return Response::error(
                Some(id),
                ErrorCode::ProtocolError,
                "service and method are required",
                self.meta(started, &service),
            );
        }
        if !params.is_object() {
            return Response::error(
                Some(id),
                ErrorCode::ProtocolError,
                "params must be an object",
                self.meta(started, &service),
            );
        }

        if service == BUILTIN_SERVICE {
            return self.handle_builtin(id, &method, started).await;
        }

        let backend = match self.state.backend(&service).await {
            Ok(backend) => backend,
            Err(BackendLookup::UnknownService) => {
                return Response::error(
                    Some(id),
                    ErrorCode::UnknownService,
                    format!("unknown service: {service}"),
                    self.meta(started, &service),
                );
            }
            Err(BackendLookup::Construction(e)) => {
                warn!("Failed to construct backend '{}': {}", service, e);
                return Response::error(
                    Some(id),
                    e.code(),
                    e.to_string(),
                    self.meta(started, &service),
                );
            }
        };

        let budget = Duration::from_millis(self.state.config().daemon.request_timeout_ms);
        let outcome = tokio::time::timeout(budget, backend.dispatch(&method, params)).await;
        let meta = self.meta(started, &service);

        match outcome {
            Ok(Ok(result)) => Response::success(id, result, meta),
            Ok(Err(e)) => {
                warn!("{}.{} failed: {}", service, method, e);
                Response::error(Some(id), e.code(), e.to_string(), meta)
            }
            Err(_) => {
                warn!("{}.{} timed out after {:?}", service, method, budget);
                Response::error(
                    Some(id),
                    ErrorCode::Timeout,
                    format!("{service}.{method} exceeded {} ms", budget.as_millis()),
                    meta,
                )
            }
        }
    }

    /// The built-in `daemon` service: health, status, shutdown.
    async fn handle_builtin(&self, id: String, method: &str, started: Instant) -> Response {
        let meta = self.meta(started, BUILTIN_SERVICE);
        match method {
            "health" => Response::success(
                id,
                json!({
                    "pid": std::process::id(),
                    "started_at": self.state.started_at_utc().to_rfc3339(),
                    "socket": self.state.config().socket_path().display().to_string(),
                }),
                meta,
            ),
            "status" => Response::success(
                id,
                json!({
                    "pid": std::process::id(),
                    "uptime_seconds": self.state.uptime_seconds(),
                    "socket": self.state.config().socket_path().display().to_string(),
                    "initialized_services": self.state.initialized_services().await,
                    "contacts_path": self.state.contacts().path().display().to_string(),
                }),
                meta,
            ),
            "shutdown" => {
                info!("Shutdown requested via IPC");
                let _ = self.shutdown_tx.send(());
                Response::success(id, json!({ "shutting_down": true }), meta)
            }
            _ => Response::error(
                Some(id),
                ErrorCode::UnknownMethod,
                format!("daemon.{method}"),
                meta,
            ),
        }
    }

    fn meta(&self, started: Instant, service: &str) -> ResponseMeta {
        ResponseMeta {
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            service: service.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::daemon::protocol::encode_line;

    fn handler() -> (RequestHandler, broadcast::Receiver<()>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("contacts.json"),
            r#"[{"name": "John Doe", "phone": "4155551234"}]"#,
        )
        .unwrap();

        let mut config = Config::default();
        config.daemon.state_dir = dir.path().to_path_buf();
        config.contacts.path = dir.path().join("contacts.json");
        config.reminders.db_path = dir.path().join("reminders.db");
        config.messages.db_path = dir.path().join("missing/chat.db");

        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
        let state = Arc::new(DaemonState::new(config));
        (RequestHandler::new(state, shutdown_tx), shutdown_rx, dir)
    }

    async fn roundtrip(handler: &RequestHandler, request: &Request) -> Response {
        let line = encode_line(request).unwrap();
        handler.handle_line(&line).await
    }

    #[tokio::test]
    async fn response_id_echoes_request_id() {
        let (handler, _rx, _dir) = handler();
        let request = Request::new("contacts", "list", json!({}));
        let response = roundtrip(&handler, &request).await;
        assert!(response.ok);
        assert_eq!(response.id.as_deref(), Some(request.id.as_str()));
        assert_eq!(response.meta.service, "contacts");
        assert!(response.meta.duration_ms >= 0.0);
    }

    #[tokio::test]
    async fn unknown_service_yields_typed_error() {
        let (handler, _rx, _dir) = handler();
        let response = roundtrip(&handler, &Request::new("spotify", "play", json!({}))).await;
        assert!(!response.ok);
        assert_eq!(response.error.unwrap().code, ErrorCode::UnknownService);
    }

    #[tokio::test]
    async fn malformed_line_is_protocol_error_with_salvaged_id() {
        let (handler, _rx, _dir) = handler();
        let response = handler.handle_line(b"{\"id\": \"x1\", \"service\": 42}").await;
        assert!(!response.ok);
        assert_eq!(response.id.as_deref(), Some("x1"));
        assert_eq!(response.error.unwrap().code, ErrorCode::ProtocolError);

        let response = handler.handle_line(b"not json at all").await;
        assert_eq!(response.id, None);
        assert_eq!(response.error.unwrap().code, ErrorCode::ProtocolError);
    }

    #[tokio::test]
    async fn unsupported_version_rejected() {
        let (handler, _rx, _dir) = handler();
        let mut request = Request::new("contacts", "list", json!({}));
        request.version = 9;
        let response = roundtrip(&handler, &request).await;
        assert_eq!(response.error.unwrap().code, ErrorCode::ProtocolError);
    }

    #[tokio::test]
    async fn backend_failure_leaves_handler_usable() {
        let (handler, _rx, _dir) = handler();

        // messages backend cannot construct (missing db).
        let failed = roundtrip(&handler, &Request::new("messages", "recent", json!({}))).await;
        assert!(!failed.ok);
        assert_eq!(failed.error.unwrap().code, ErrorCode::BackendError);

        // The next request on another service still succeeds.
        let ok = roundtrip(&handler, &Request::new("reminders", "list", json!({}))).await;
        assert!(ok.ok, "handler must survive a backend failure");
    }

    #[tokio::test]
    async fn not_found_maps_to_wire_code() {
        let (handler, _rx, _dir) = handler();
        let response = roundtrip(
            &handler,
            &Request::new("contacts", "resolve", json!({"query": "Zzyzx"})),
        )
        .await;
        assert_eq!(response.error.unwrap().code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn builtin_shutdown_signals_broadcast() {
        let (handler, mut rx, _dir) = handler();
        let response = roundtrip(&handler, &Request::new("daemon", "shutdown", json!({}))).await;
        assert!(response.ok);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn builtin_status_reports_initialized_services() {
        let (handler, _rx, _dir) = handler();
        roundtrip(&handler, &Request::new("reminders", "list", json!({}))).await;
        let response = roundtrip(&handler, &Request::new("daemon", "status", json!({}))).await;
        let result = response.result.unwrap();
        assert_eq!(result["initialized_services"], json!(["reminders"]));
    }
}
