//! Wire Protocol Types
//!
//! Defines the request/response types for daemon-client communication.
//! Uses newline-delimited JSON over a Unix domain socket: one request line
//! in, one response line out, then the connection closes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version expected in requests.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum accepted line length. A request larger than this is rejected
/// rather than buffered without bound.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

fn default_params() -> Value {
    Value::Object(serde_json::Map::new())
}

/// A single request sent from client to daemon.
///
/// `id` is client-generated and opaque; the daemon echoes it back for
/// correlation and never interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    #[serde(rename = "v", default = "default_version")]
    pub version: u32,
    pub service: String,
    pub method: String,
    #[serde(default = "default_params")]
    pub params: Value,
}

impl Request {
    pub fn new(service: impl Into<String>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            version: PROTOCOL_VERSION,
            service: service.into(),
            method: method.into(),
            params,
        }
    }
}

/// Error codes carried on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ProtocolError,
    UnknownService,
    UnknownMethod,
    InvalidParams,
    BackendError,
    NotFound,
    PermissionDenied,
    Timeout,
    ShuttingDown,
}

/// Structured error payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// Per-response metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub duration_ms: f64,
    pub service: String,
}

/// A single response sent from daemon to client.
///
/// Exactly one of `result`/`error` is present, matching `ok`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Echo of the request id; `None` only when the request line could not
    /// be parsed far enough to recover one.
    pub id: Option<String>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    pub meta: ResponseMeta,
}

impl Response {
    /// Create a success response.
    pub fn success(id: impl Into<String>, result: Value, meta: ResponseMeta) -> Self {
        Self {
            id: Some(id.into()),
            ok: true,
            result: Some(result),
            error: None,
            meta,
        }
    }

    /// Create an error response.
    pub fn error(
        id: Option<String>,
        code: ErrorCode,
        message: impl Into<String>,
        meta: ResponseMeta,
    ) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(ErrorPayload {
                code,
                message: message.into(),
            }),
            meta,
        }
    }
}

/// Encode a message as one NDJSON line (payload + trailing `\n`).
///
/// JSON string escaping guarantees no raw newline appears inside the
/// payload, so the trailing byte is the only `\n` on the wire.
pub fn encode_line<T: Serialize>(msg: &T) -> anyhow::Result<Vec<u8>> {
    let mut buf = serde_json::to_vec(msg)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Decode a message from a single line (trailing newline optional).
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &[u8]) -> anyhow::Result<T> {
    Ok(serde_json::from_slice(line)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta() -> ResponseMeta {
        ResponseMeta {
            duration_ms: 1.5,
            service: "messages".to_string(),
        }
    }

    #[test]
    fn request_round_trip() {
        let req = Request::new("messages", "search", json!({"query": "lunch", "limit": 5}));
        let encoded = encode_line(&req).unwrap();
        let decoded: Request = decode_line(&encoded).unwrap();
        assert_eq!(decoded.id, req.id);
        assert_eq!(decoded.service, "messages");
        assert_eq!(decoded.method, "search");
        assert_eq!(decoded.params["limit"], 5);
    }

    #[test]
    fn request_defaults_version_and_params() {
        let decoded: Request =
            decode_line(br#"{"id":"abc","service":"messages","method":"recent"}"#).unwrap();
        assert_eq!(decoded.version, PROTOCOL_VERSION);
        assert!(decoded.params.is_object());
    }

    #[test]
    fn response_serializes_exactly_one_of_result_error() {
        let ok = Response::success("a", json!({"count": 3}), meta());
        let line = String::from_utf8(encode_line(&ok).unwrap()).unwrap();
        assert!(line.contains("\"result\""));
        assert!(!line.contains("\"error\""));

        let err = Response::error(Some("a".into()), ErrorCode::NotFound, "no such contact", meta());
        let line = String::from_utf8(encode_line(&err).unwrap()).unwrap();
        assert!(line.contains("\"error\""));
        assert!(!line.contains("\"result\""));
        assert!(line.contains("NOT_FOUND"));
    }

    #[test]
    fn embedded_newlines_never_escape_the_line() {
        // A decoded message body may contain any control character; the
        // JSON encoder must keep the line framing intact regardless.
        let resp = Response::success("a", json!({"text": "line one\nline two\r\n\ttabbed"}), meta());
        let encoded = encode_line(&resp).unwrap();
        let newline_count = encoded.iter().filter(|&&b| b == b'\n').count();
        assert_eq!(newline_count, 1);
        assert_eq!(*encoded.last().unwrap(), b'\n');

        let decoded: Response = decode_line(&encoded).unwrap();
        assert_eq!(decoded.result.unwrap()["text"], "line one\nline two\r\n\ttabbed");
    }

    #[test]
    fn error_codes_use_screaming_snake_case() {
        let v = serde_json::to_value(ErrorCode::UnknownService).unwrap();
        assert_eq!(v, "UNKNOWN_SERVICE");
        let v = serde_json::to_value(ErrorCode::PermissionDenied).unwrap();
        assert_eq!(v, "PERMISSION_DENIED");
    }
}
