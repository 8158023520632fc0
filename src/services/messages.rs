//! Message service backend.
//!
//! Read operations go through the store adapter; `send` goes through the
//! OS automation channel, which is an exclusive resource: sends are
//! serialized behind a lock and dispatched at most once per request, with
//! no retry at any layer.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::Config;
use crate::contacts::ContactDirectory;
use crate::services::{params, ServiceBackend, ServiceError};
use crate::store::MessageStore;

const MAX_LIMIT: usize = 500;

pub struct MessageService {
    store: MessageStore,
    contacts: Arc<ContactDirectory>,
    send_command: String,
    send_lock: tokio::sync::Mutex<()>,
}

impl MessageService {
    pub fn new(config: &Config, contacts: Arc<ContactDirectory>) -> Result<Self, ServiceError> {
        let store = MessageStore::open(&config.messages.db_path)?;
        Ok(Self {
            store,
            contacts,
            send_command: config.messages.send_command.clone(),
            send_lock: tokio::sync::Mutex::new(()),
        })
    }

    async fn health(&self) -> Result<Value, ServiceError> {
        let can_read_db = self.store.unread_count().await.is_ok();
        Ok(json!({
            "db_path": self.store.path().display().to_string(),
            "can_read_db": can_read_db,
        }))
    }

    async fn unread_count(&self) -> Result<Value, ServiceError> {
        Ok(json!({ "count": self.store.unread_count().await? }))
    }

    async fn unread(&self, params: &Value) -> Result<Value, ServiceError> {
        let limit = params::limit(params, "limit", 20, MAX_LIMIT)?;
        Ok(json!({ "messages": self.store.unread(limit).await? }))
    }

    async fn recent(&self, params: &Value) -> Result<Value, ServiceError> {
        let limit = params::limit(params, "limit", 10, MAX_LIMIT)?;
        Ok(json!({ "messages": self.store.recent(limit).await? }))
    }

    async fn search(&self, params: &Value) -> Result<Value, ServiceError> {
        let query = params::required_str(params, "query")?;
        let limit = params::limit(params, "limit", 20, MAX_LIMIT)?;
        let since = match params::opt_str(params, "since")? {
            Some(raw) => Some(parse_since(raw)?),
            None => None,
        };
        let results = self.store.search(query.to_string(), limit, since).await?;
        Ok(json!({ "query": query, "results": results }))
    }

    async fn with_contact(&self, params: &Value) -> Result<Value, ServiceError> {
        let query = params::required_str(params, "contact")?;
        let limit = params::limit(params, "limit", 20, MAX_LIMIT)?;
        let resolved = self.contacts.resolve(query)?;
        let messages = self
            .store
            .by_handle(resolved.identifier.clone(), limit, 0)
            .await?;
        Ok(json!({ "contact": resolved, "messages": messages }))
    }

    async fn resolve(&self, params: &Value) -> Result<Value, ServiceError> {
        let query = params::required_str(params, "query")?;
        let resolved = self.contacts.resolve(query)?;
        Ok(serde_json::to_value(resolved).map_err(anyhow::Error::from)?)
    }

    /// Send one outbound message through the automation channel.
    ///
    /// The channel is exclusive, so sends are serialized; a client that
    /// gives up waiting gets no retry from us, which keeps dispatch
    /// at-most-once across the request's lifetime.
    async fn send(&self, params: &Value) -> Result<Value, ServiceError> {
        let to = params::required_str(params, "to")?;
        let text = params::required_str(params, "text")?;
        let resolved = self.contacts.resolve(to)?;

        let script = send_script(&resolved.identifier, text);
        let _guard = self.send_lock.lock().await;
        debug!("Dispatching send to {}", resolved.identifier);

        let output = Command::new(&self.send_command)
            .arg("-e")
            .arg(&script)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.send_command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ServiceError::Backend(anyhow::anyhow!(
                "send automation failed: {}",
                stderr.trim()
            )));
        }

        info!("Sent message to {}", resolved.identifier);
        Ok(json!({ "sent": true, "to": resolved.identifier, "contact": resolved.name }))
    }
}

#[async_trait]
impl ServiceBackend for MessageService {
    fn name(&self) -> &'static str {
        "messages"
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, ServiceError> {
        match method {
            "health" => self.health().await,
            "unread_count" => self.unread_count().await,
            "unread" => self.unread(&params).await,
            "recent" => self.recent(&params).await,
            "search" => self.search(&params).await,
            "with_contact" => self.with_contact(&params).await,
            "resolve" => self.resolve(&params).await,
            "send" => self.send(&params).await,
            _ => Err(ServiceError::UnknownMethod(format!("messages.{method}"))),
        }
    }
}

/// Parse a `since` bound: RFC 3339, or a bare date meaning midnight UTC.
fn parse_since(raw: &str) -> Result<DateTime<Utc>, ServiceError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(date) = raw.parse::<NaiveDate>() {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc());
        }
    }
    Err(ServiceError::InvalidParams(format!(
        "since must be an RFC 3339 timestamp or YYYY-MM-DD date, got '{raw}'"
    )))
}

/// Automation script for one send. The recipient and body are embedded as
/// quoted literals, so both must be escaped.
fn send_script(identifier: &str, text: &str) -> String {
    let to = escape_script_literal(identifier);
    let body = escape_script_literal(text);
    format!(
        "tell application \"Messages\"\n\
         \tset targetService to 1st service whose service type = iMessage\n\
         \tset targetBuddy to buddy \"{to}\" of targetService\n\
         \tsend \"{body}\" to targetBuddy\n\
         end tell"
    )
}

fn escape_script_literal(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContactsConfig;
    use crate::store::test_fixtures::fixture_store;

    fn service() -> (MessageService, tempfile::TempDir, tempfile::TempDir) {
        let (store, store_dir) = fixture_store();

        let contacts_dir = tempfile::tempdir().unwrap();
        let contacts_path = contacts_dir.path().join("contacts.json");
        std::fs::write(
            &contacts_path,
            r#"[{"name": "John Doe", "phone": "+1 (415) 555-1234"}]"#,
        )
        .unwrap();
        let contacts = Arc::new(ContactDirectory::load(&ContactsConfig {
            path: contacts_path,
            fuzzy_threshold: 0.85,
            default_country_code: "1".to_string(),
        }));

        let service = MessageService {
            store,
            contacts,
            send_command: "osascript".to_string(),
            send_lock: tokio::sync::Mutex::new(()),
        };
        (service, store_dir, contacts_dir)
    }

    #[tokio::test]
    async fn unread_count_dispatches() {
        let (service, _s, _c) = service();
        let result = service.dispatch("unread_count", serde_json::json!({})).await.unwrap();
        assert_eq!(result["count"], 2);
    }

    #[tokio::test]
    async fn with_contact_resolves_then_queries() {
        let (service, _s, _c) = service();
        let result = service
            .dispatch("with_contact", serde_json::json!({"contact": "John"}))
            .await
            .unwrap();
        assert_eq!(result["contact"]["name"], "John Doe");
        assert!(!result["messages"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_requires_query() {
        let (service, _s, _c) = service();
        let err = service.dispatch("search", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidParams(_)));
    }

    #[tokio::test]
    async fn unknown_method_is_typed() {
        let (service, _s, _c) = service();
        let err = service.dispatch("nope", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, ServiceError::UnknownMethod(_)));
    }

    #[tokio::test]
    async fn send_to_unknown_contact_is_not_found() {
        let (service, _s, _c) = service();
        let err = service
            .dispatch("send", serde_json::json!({"to": "Zzyzx", "text": "hi"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[test]
    fn since_accepts_both_forms() {
        assert!(parse_since("2026-01-01T00:00:00Z").is_ok());
        assert!(parse_since("2026-01-01").is_ok());
        assert!(parse_since("yesterday").is_err());
    }

    #[test]
    fn script_literals_are_escaped() {
        let script = send_script("14155551234", "say \"hi\" \\ bye");
        assert!(script.contains("say \\\"hi\\\" \\\\ bye"));
        assert!(script.contains("buddy \"14155551234\""));
    }
}
