//! Service Backends
//!
//! Each integration exposes the same capability: `dispatch(method, params)`.
//! Backends hold their own external-API state (database handles, OAuth
//! tokens) and are constructed lazily on first request for their service.

pub mod calendar;
pub mod email;
pub mod messages;
pub mod reminders;

pub use calendar::CalendarService;
pub use email::EmailService;
pub use messages::MessageService;
pub use reminders::ReminderService;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::daemon::protocol::ErrorCode;

/// Errors a backend can surface through dispatch.
///
/// Everything a backend throws is caught at the dispatcher boundary and
/// converted to a structured wire error; nothing here crashes the daemon.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl ServiceError {
    /// Map to the wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            ServiceError::UnknownMethod(_) => ErrorCode::UnknownMethod,
            ServiceError::InvalidParams(_) => ErrorCode::InvalidParams,
            ServiceError::NotFound(_) => ErrorCode::NotFound,
            ServiceError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            ServiceError::Backend(_) => ErrorCode::BackendError,
        }
    }
}

/// The uniform capability every backend implements.
///
/// Method routing happens inside the backend via an explicit match on the
/// method name; unknown methods are rejected with a typed error at the
/// boundary instead of surfacing as a missing-handler panic.
#[async_trait]
pub trait ServiceBackend: Send + Sync {
    /// Service name this backend registers under.
    fn name(&self) -> &'static str;

    /// Invoke one operation. The returned value becomes `result` on the wire.
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, ServiceError>;
}

/// Typed accessors for the loosely-shaped `params` object.
///
/// Every backend validates its inputs through these so malformed requests
/// fail with `InvalidParams` before touching any external resource.
pub mod params {
    use super::ServiceError;
    use serde_json::Value;

    /// A required string field.
    pub fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, ServiceError> {
        match params.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Ok(s),
            Some(Value::String(_)) => {
                Err(ServiceError::InvalidParams(format!("{key} must not be empty")))
            }
            Some(_) => Err(ServiceError::InvalidParams(format!("{key} must be a string"))),
            None => Err(ServiceError::InvalidParams(format!("{key} is required"))),
        }
    }

    /// An optional string field.
    pub fn opt_str<'a>(params: &'a Value, key: &str) -> Result<Option<&'a str>, ServiceError> {
        match params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(ServiceError::InvalidParams(format!("{key} must be a string"))),
        }
    }

    /// An optional boolean field, defaulted.
    pub fn bool_or(params: &Value, key: &str, default: bool) -> Result<bool, ServiceError> {
        match params.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(ServiceError::InvalidParams(format!("{key} must be a boolean"))),
        }
    }

    /// A bounded integer field, clamped to `[1, max]` and defaulted when
    /// absent. Out-of-type values are rejected rather than coerced.
    pub fn limit(params: &Value, key: &str, default: usize, max: usize) -> Result<usize, ServiceError> {
        match params.get(key) {
            None | Some(Value::Null) => Ok(default.min(max)),
            Some(Value::Number(n)) => {
                let raw = n
                    .as_i64()
                    .ok_or_else(|| ServiceError::InvalidParams(format!("{key} must be an integer")))?;
                if raw < 1 {
                    Ok(1)
                } else {
                    Ok((raw as usize).min(max))
                }
            }
            Some(_) => Err(ServiceError::InvalidParams(format!("{key} must be an integer"))),
        }
    }

    /// An optional list of strings.
    pub fn opt_str_list(params: &Value, key: &str) -> Result<Option<Vec<String>>, ServiceError> {
        match params.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| ServiceError::InvalidParams(format!("{key} must be a list of strings")))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(_) => Err(ServiceError::InvalidParams(format!("{key} must be a list of strings"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::params::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn required_str_rejects_missing_and_wrong_type() {
        let p = json!({"query": "hi", "n": 3});
        assert_eq!(required_str(&p, "query").unwrap(), "hi");
        assert!(matches!(required_str(&p, "absent"), Err(ServiceError::InvalidParams(_))));
        assert!(matches!(required_str(&p, "n"), Err(ServiceError::InvalidParams(_))));
        assert!(matches!(
            required_str(&json!({"query": ""}), "query"),
            Err(ServiceError::InvalidParams(_))
        ));
    }

    #[test]
    fn limit_clamps_and_defaults() {
        let p = json!({"limit": 500, "neg": -3});
        assert_eq!(limit(&p, "limit", 20, 100).unwrap(), 100);
        assert_eq!(limit(&p, "neg", 20, 100).unwrap(), 1);
        assert_eq!(limit(&p, "absent", 20, 100).unwrap(), 20);
        assert!(limit(&json!({"limit": "ten"}), "limit", 20, 100).is_err());
    }

    #[test]
    fn error_codes_map() {
        assert_eq!(
            ServiceError::UnknownMethod("x".into()).code(),
            ErrorCode::UnknownMethod
        );
        assert_eq!(
            ServiceError::PermissionDenied("x".into()).code(),
            ErrorCode::PermissionDenied
        );
        assert_eq!(
            ServiceError::Backend(anyhow::anyhow!("boom")).code(),
            ErrorCode::BackendError
        );
    }
}
