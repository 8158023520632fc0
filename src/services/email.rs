//! Email service backend (Gmail REST).
//!
//! Shares the credential cache with the calendar backend; its tokens live
//! under the "gmail" scope. `send` builds an RFC 2822 message and submits
//! it once, with no retry, matching the at-most-once dispatch contract.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use tracing::info;

use crate::auth::{CredentialCache, GoogleTokenProvider};
use crate::config::Config;
use crate::services::{params, ServiceBackend, ServiceError};

use super::calendar::read_api_response;

const CREDENTIAL_SCOPE: &str = "gmail";

pub struct EmailService {
    http: reqwest::Client,
    api_base: String,
    credentials: Arc<CredentialCache>,
    provider: GoogleTokenProvider,
}

impl EmailService {
    pub fn new(config: &Config, credentials: Arc<CredentialCache>) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.google.http_timeout_secs))
            .build()
            .context("failed to build HTTP client")?;
        let provider = GoogleTokenProvider::new(CREDENTIAL_SCOPE, &config.google)?;
        Ok(Self {
            http,
            api_base: config.google.gmail_api_base.trim_end_matches('/').to_string(),
            credentials,
            provider,
        })
    }

    async fn bearer(&self) -> Result<String, ServiceError> {
        let token = self.credentials.token(&self.provider).await?;
        Ok(token.access_token)
    }

    /// List message ids matching a Gmail search expression, then fetch
    /// metadata for each.
    async fn query_messages(&self, query: &str, max_results: usize) -> Result<Vec<Value>, ServiceError> {
        let bearer = self.bearer().await?;
        let response = self
            .http
            .get(format!("{}/users/me/messages", self.api_base))
            .bearer_auth(&bearer)
            .query(&[("q", query.to_string()), ("maxResults", max_results.to_string())])
            .send()
            .await
            .context("email list request failed")?;
        let body = read_api_response(response, "email").await?;

        let ids: Vec<String> = body["messages"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|m| m["id"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            messages.push(self.fetch_metadata(&bearer, &id).await?);
        }
        Ok(messages)
    }

    async fn fetch_metadata(&self, bearer: &str, id: &str) -> Result<Value, ServiceError> {
        let response = self
            .http
            .get(format!("{}/users/me/messages/{id}", self.api_base))
            .bearer_auth(bearer)
            .query(&[
                ("format", "metadata"),
                ("metadataHeaders", "From"),
                ("metadataHeaders", "To"),
                ("metadataHeaders", "Subject"),
                ("metadataHeaders", "Date"),
            ])
            .send()
            .await
            .context("email metadata request failed")?;
        let body = read_api_response(response, "email").await?;
        Ok(simplify_message(&body))
    }

    async fn unread_count(&self) -> Result<Value, ServiceError> {
        let bearer = self.bearer().await?;
        let response = self
            .http
            .get(format!("{}/users/me/labels/UNREAD", self.api_base))
            .bearer_auth(bearer)
            .send()
            .await
            .context("email label request failed")?;
        let body = read_api_response(response, "email").await?;
        Ok(json!({ "unread_count": body["messagesUnread"].as_i64().unwrap_or(0) }))
    }

    async fn list(&self, params: &Value) -> Result<Value, ServiceError> {
        let count = params::limit(params, "count", 10, 100)?;
        let unread_only = params::bool_or(params, "unread_only", false)?;

        let mut query_parts: Vec<String> = Vec::new();
        if unread_only {
            query_parts.push("is:unread".to_string());
        }
        if let Some(label) = params::opt_str(params, "label")? {
            query_parts.push(format!("label:{label}"));
        }
        if let Some(sender) = params::opt_str(params, "sender")? {
            query_parts.push(format!("from:{sender}"));
        }

        let emails = self.query_messages(&query_parts.join(" "), count).await?;
        Ok(json!({ "count": emails.len(), "emails": emails }))
    }

    async fn search(&self, params: &Value) -> Result<Value, ServiceError> {
        let query = params::required_str(params, "query")?;
        let max_results = params::limit(params, "max_results", 10, 100)?;
        let emails = self.query_messages(query, max_results).await?;
        Ok(json!({ "query": query, "count": emails.len(), "emails": emails }))
    }

    async fn get(&self, params: &Value) -> Result<Value, ServiceError> {
        let message_id = params::required_str(params, "message_id")?;
        let bearer = self.bearer().await?;
        let response = self
            .http
            .get(format!("{}/users/me/messages/{message_id}", self.api_base))
            .bearer_auth(bearer)
            .query(&[("format", "full")])
            .send()
            .await
            .context("email get request failed")?;
        let body = read_api_response(response, "email").await?;

        let mut message = simplify_message(&body);
        message["body"] = json!(extract_body_text(&body["payload"]));
        Ok(message)
    }

    async fn send(&self, params: &Value) -> Result<Value, ServiceError> {
        let to = params::required_str(params, "to")?;
        let subject = params::required_str(params, "subject")?;
        let body = params::required_str(params, "body")?;

        let raw = encode_rfc2822(to, subject, body);
        let bearer = self.bearer().await?;
        let response = self
            .http
            .post(format!("{}/users/me/messages/send", self.api_base))
            .bearer_auth(bearer)
            .json(&json!({ "raw": raw }))
            .send()
            .await
            .context("email send request failed")?;
        let sent = read_api_response(response, "email").await?;

        info!("Sent email to {}", to);
        Ok(json!({ "sent": true, "to": to, "message_id": sent["id"] }))
    }

    async fn mark_read(&self, params: &Value) -> Result<Value, ServiceError> {
        let message_id = params::required_str(params, "message_id")?;
        let bearer = self.bearer().await?;
        let response = self
            .http
            .post(format!("{}/users/me/messages/{message_id}/modify", self.api_base))
            .bearer_auth(bearer)
            .json(&json!({ "removeLabelIds": ["UNREAD"] }))
            .send()
            .await
            .context("email modify request failed")?;
        read_api_response(response, "email").await?;
        Ok(json!({ "marked_read": true, "message_id": message_id }))
    }
}

#[async_trait]
impl ServiceBackend for EmailService {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, ServiceError> {
        match method {
            "unread_count" => self.unread_count().await,
            "list" => self.list(&params).await,
            "search" => self.search(&params).await,
            "get" => self.get(&params).await,
            "send" => self.send(&params).await,
            "mark_read" => self.mark_read(&params).await,
            _ => Err(ServiceError::UnknownMethod(format!("email.{method}"))),
        }
    }
}

/// Flatten a Gmail message to its interesting headers and snippet.
fn simplify_message(message: &Value) -> Value {
    let mut out = json!({
        "id": message["id"],
        "thread_id": message["threadId"],
        "snippet": message.get("snippet").cloned().unwrap_or(Value::Null),
        "unread": message["labelIds"]
            .as_array()
            .is_some_and(|labels| labels.iter().any(|l| l == "UNREAD")),
    });
    if let Some(headers) = message["payload"]["headers"].as_array() {
        for header in headers {
            let (Some(name), Some(value)) = (header["name"].as_str(), header["value"].as_str())
            else {
                continue;
            };
            match name.to_ascii_lowercase().as_str() {
                "from" => out["from"] = json!(value),
                "to" => out["to"] = json!(value),
                "subject" => out["subject"] = json!(value),
                "date" => out["date"] = json!(value),
                _ => {}
            }
        }
    }
    out
}

/// Best-effort plain-text body: prefer a text/plain part, fall back to the
/// top-level body data.
fn extract_body_text(payload: &Value) -> String {
    fn decode_data(part: &Value) -> Option<String> {
        let data = part["body"]["data"].as_str()?;
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(data.trim_end_matches('='))
            .ok()?;
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    if let Some(parts) = payload["parts"].as_array() {
        for part in parts {
            if part["mimeType"] == "text/plain" {
                if let Some(text) = decode_data(part) {
                    return text;
                }
            }
        }
        for part in parts {
            if let Some(text) = decode_data(part) {
                return text;
            }
        }
    }
    decode_data(payload).unwrap_or_default()
}

fn encode_rfc2822(to: &str, subject: &str, body: &str) -> String {
    let message = format!(
        "To: {to}\r\nSubject: {subject}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{body}"
    );
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(message.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simplify_pulls_headers_and_unread_flag() {
        let message = json!({
            "id": "m1",
            "threadId": "t1",
            "snippet": "see you at noon",
            "labelIds": ["INBOX", "UNREAD"],
            "payload": { "headers": [
                { "name": "From", "value": "ana@example.com" },
                { "name": "Subject", "value": "Lunch" },
                { "name": "X-Ignored", "value": "x" }
            ]}
        });
        let out = simplify_message(&message);
        assert_eq!(out["from"], "ana@example.com");
        assert_eq!(out["subject"], "Lunch");
        assert_eq!(out["unread"], true);
        assert!(out.get("x-ignored").is_none());
    }

    #[test]
    fn body_prefers_text_plain_part() {
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode("plain body");
        let html = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode("<p>html</p>");
        let payload = json!({
            "parts": [
                { "mimeType": "text/html", "body": { "data": html } },
                { "mimeType": "text/plain", "body": { "data": encoded } }
            ]
        });
        assert_eq!(extract_body_text(&payload), "plain body");
    }

    #[test]
    fn rfc2822_round_trips_through_base64() {
        let raw = encode_rfc2822("ana@example.com", "Lunch?", "noon works\r\n-- me");
        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(raw).unwrap();
        let text = String::from_utf8(decoded).unwrap();
        assert!(text.starts_with("To: ana@example.com\r\n"));
        assert!(text.contains("Subject: Lunch?"));
        assert!(text.ends_with("noon works\r\n-- me"));
    }
}
