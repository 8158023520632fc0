//! Calendar service backend (Google Calendar REST).
//!
//! Bearer tokens come from the shared credential cache under the
//! "calendar" scope, so a daemon serving calendar and email traffic at
//! once still refreshes each scope at most once.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Timelike, Utc};
use serde_json::{json, Value};

use crate::auth::{CredentialCache, GoogleTokenProvider};
use crate::config::Config;
use crate::services::{params, ServiceBackend, ServiceError};

const CREDENTIAL_SCOPE: &str = "calendar";

pub struct CalendarService {
    http: reqwest::Client,
    api_base: String,
    credentials: Arc<CredentialCache>,
    provider: GoogleTokenProvider,
}

impl CalendarService {
    pub fn new(config: &Config, credentials: Arc<CredentialCache>) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.google.http_timeout_secs))
            .build()
            .context("failed to build HTTP client")?;
        let provider = GoogleTokenProvider::new(CREDENTIAL_SCOPE, &config.google)?;
        Ok(Self {
            http,
            api_base: config.google.calendar_api_base.trim_end_matches('/').to_string(),
            credentials,
            provider,
        })
    }

    async fn bearer(&self) -> Result<String, ServiceError> {
        let token = self.credentials.token(&self.provider).await?;
        Ok(token.access_token)
    }

    async fn list_events(
        &self,
        time_min: DateTime<Utc>,
        time_max: DateTime<Utc>,
        max_results: usize,
    ) -> Result<Vec<Value>, ServiceError> {
        let bearer = self.bearer().await?;
        let response = self
            .http
            .get(format!("{}/calendars/primary/events", self.api_base))
            .bearer_auth(bearer)
            .query(&[
                ("timeMin", time_min.to_rfc3339()),
                ("timeMax", time_max.to_rfc3339()),
                ("singleEvents", "true".to_string()),
                ("orderBy", "startTime".to_string()),
                ("maxResults", max_results.to_string()),
            ])
            .send()
            .await
            .context("calendar list request failed")?;

        let body = read_api_response(response, "calendar").await?;
        let items = body["items"].as_array().cloned().unwrap_or_default();
        Ok(items.iter().map(simplify_event).collect())
    }

    async fn today(&self) -> Result<Value, ServiceError> {
        let now = Utc::now();
        let end_of_day = now
            .with_hour(23)
            .and_then(|t| t.with_minute(59))
            .and_then(|t| t.with_second(59))
            .unwrap_or(now);
        let events = self.list_events(now, end_of_day, 50).await?;
        Ok(json!({
            "date": now.format("%Y-%m-%d").to_string(),
            "count": events.len(),
            "events": events,
        }))
    }

    async fn week(&self) -> Result<Value, ServiceError> {
        let now = Utc::now();
        let end = now + Duration::days(7);
        let events = self.list_events(now, end, 100).await?;
        Ok(json!({
            "start": now.format("%Y-%m-%d").to_string(),
            "end": end.format("%Y-%m-%d").to_string(),
            "count": events.len(),
            "events": events,
        }))
    }

    async fn upcoming(&self, params: &Value) -> Result<Value, ServiceError> {
        let count = params::limit(params, "count", 10, 100)?;
        let days = params::limit(params, "days", 7, 365)?;
        let now = Utc::now();
        let events = self.list_events(now, now + Duration::days(days as i64), count).await?;
        Ok(json!({ "count": events.len(), "events": events }))
    }

    async fn get(&self, params: &Value) -> Result<Value, ServiceError> {
        let event_id = params::required_str(params, "event_id")?;
        let bearer = self.bearer().await?;
        let response = self
            .http
            .get(format!("{}/calendars/primary/events/{event_id}", self.api_base))
            .bearer_auth(bearer)
            .send()
            .await
            .context("calendar get request failed")?;
        let body = read_api_response(response, "calendar").await?;
        Ok(simplify_event(&body))
    }

    async fn create(&self, params: &Value) -> Result<Value, ServiceError> {
        let title = params::required_str(params, "title")?;
        let start = parse_instant(params::required_str(params, "start")?)?;
        let end = parse_instant(params::required_str(params, "end")?)?;
        if end <= start {
            return Err(ServiceError::InvalidParams("end must be after start".into()));
        }

        let mut event = json!({
            "summary": title,
            "start": { "dateTime": start.to_rfc3339() },
            "end": { "dateTime": end.to_rfc3339() },
        });
        if let Some(description) = params::opt_str(params, "description")? {
            event["description"] = json!(description);
        }
        if let Some(location) = params::opt_str(params, "location")? {
            event["location"] = json!(location);
        }
        if let Some(attendees) = params::opt_str_list(params, "attendees")? {
            event["attendees"] = json!(attendees
                .iter()
                .map(|email| json!({ "email": email }))
                .collect::<Vec<_>>());
        }

        let bearer = self.bearer().await?;
        let response = self
            .http
            .post(format!("{}/calendars/primary/events", self.api_base))
            .bearer_auth(bearer)
            .json(&event)
            .send()
            .await
            .context("calendar create request failed")?;
        let body = read_api_response(response, "calendar").await?;
        Ok(json!({ "created": true, "event": simplify_event(&body) }))
    }

    async fn delete(&self, params: &Value) -> Result<Value, ServiceError> {
        let event_id = params::required_str(params, "event_id")?;
        let bearer = self.bearer().await?;
        let response = self
            .http
            .delete(format!("{}/calendars/primary/events/{event_id}", self.api_base))
            .bearer_auth(bearer)
            .send()
            .await
            .context("calendar delete request failed")?;

        let status = response.status();
        if status.is_success() {
            Ok(json!({ "deleted": true, "event_id": event_id }))
        } else {
            Err(api_error(status, response.text().await.unwrap_or_default(), "calendar"))
        }
    }

    async fn free(&self, params: &Value) -> Result<Value, ServiceError> {
        let duration_min = params::limit(params, "duration", 60, 480)? as i64;
        let days = params::limit(params, "days", 7, 30)?;
        let limit = params::limit(params, "limit", 10, 50)?;
        let work_start = params::limit(params, "work_start", 9, 23)? as u32;
        let work_end = params::limit(params, "work_end", 17, 24)? as u32;
        if work_end <= work_start {
            return Err(ServiceError::InvalidParams("work_end must be after work_start".into()));
        }

        let now = Utc::now();
        let events = self.list_events(now, now + Duration::days(days as i64), 250).await?;
        let busy: Vec<(DateTime<Utc>, DateTime<Utc>)> = events
            .iter()
            .filter_map(|e| {
                let start = e["start"].as_str().and_then(parse_instant_opt)?;
                let end = e["end"].as_str().and_then(parse_instant_opt)?;
                Some((start, end))
            })
            .collect();

        let slots = free_slots(&busy, now, days as i64, duration_min, work_start, work_end, limit);
        Ok(json!({
            "duration_minutes": duration_min,
            "count": slots.len(),
            "free_slots": slots
                .iter()
                .map(|(start, end)| json!({
                    "start": start.to_rfc3339(),
                    "end": end.to_rfc3339(),
                    "minutes": (*end - *start).num_minutes(),
                }))
                .collect::<Vec<_>>(),
        }))
    }
}

#[async_trait]
impl ServiceBackend for CalendarService {
    fn name(&self) -> &'static str {
        "calendar"
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, ServiceError> {
        match method {
            "today" => self.today().await,
            "week" => self.week().await,
            "upcoming" => self.upcoming(&params).await,
            "get" => self.get(&params).await,
            "create" => self.create(&params).await,
            "delete" => self.delete(&params).await,
            "free" => self.free(&params).await,
            _ => Err(ServiceError::UnknownMethod(format!("calendar.{method}"))),
        }
    }
}

/// Flatten an API event to the fields callers actually use.
fn simplify_event(event: &Value) -> Value {
    json!({
        "id": event["id"],
        "title": event.get("summary").cloned().unwrap_or(Value::Null),
        "start": event["start"].get("dateTime").or_else(|| event["start"].get("date")).cloned().unwrap_or(Value::Null),
        "end": event["end"].get("dateTime").or_else(|| event["end"].get("date")).cloned().unwrap_or(Value::Null),
        "location": event.get("location").cloned().unwrap_or(Value::Null),
        "attendees": event["attendees"].as_array().map(|a| a.len()).unwrap_or(0),
        "status": event.get("status").cloned().unwrap_or(Value::Null),
    })
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>, ServiceError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| {
            ServiceError::InvalidParams(format!("expected an RFC 3339 timestamp, got '{raw}'"))
        })
}

fn parse_instant_opt(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc)).ok()
}

/// Gaps of at least `duration_min` minutes inside working hours, skipping
/// busy intervals. Scans day by day from `from` and stops at `limit`.
fn free_slots(
    busy: &[(DateTime<Utc>, DateTime<Utc>)],
    from: DateTime<Utc>,
    days: i64,
    duration_min: i64,
    work_start: u32,
    work_end: u32,
    limit: usize,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut busy: Vec<_> = busy.to_vec();
    busy.sort_by_key(|(start, _)| *start);

    let mut slots = Vec::new();
    for offset in 0..days {
        let day = (from + Duration::days(offset)).date_naive();
        let window_start = match day.and_hms_opt(work_start, 0, 0) {
            Some(t) => t.and_utc(),
            None => continue,
        };
        let window_end = match day.and_hms_opt(work_end % 24, 0, 0) {
            Some(t) if work_end < 24 => t.and_utc(),
            _ => day.and_hms_opt(23, 59, 59).map(|t| t.and_utc()).unwrap_or(window_start),
        };

        let mut cursor = window_start.max(from);
        for (busy_start, busy_end) in &busy {
            if *busy_end <= cursor || *busy_start >= window_end {
                continue;
            }
            if (*busy_start - cursor).num_minutes() >= duration_min {
                slots.push((cursor, (*busy_start).min(window_end)));
                if slots.len() >= limit {
                    return slots;
                }
            }
            cursor = cursor.max(*busy_end);
        }
        if cursor < window_end && (window_end - cursor).num_minutes() >= duration_min {
            slots.push((cursor, window_end));
            if slots.len() >= limit {
                return slots;
            }
        }
    }
    slots
}

/// Map an API response to a value or a typed error by status class.
pub(crate) async fn read_api_response(
    response: reqwest::Response,
    what: &str,
) -> Result<Value, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response
            .json()
            .await
            .with_context(|| format!("{what} API returned malformed JSON"))?);
    }
    Err(api_error(status, response.text().await.unwrap_or_default(), what))
}

fn api_error(status: reqwest::StatusCode, body: String, what: &str) -> ServiceError {
    let detail = crate::util::truncate_str(body.trim(), 200);
    match status.as_u16() {
        401 | 403 => ServiceError::PermissionDenied(format!("{what} API denied access: {detail}")),
        404 => ServiceError::NotFound(format!("{what} resource not found")),
        _ => ServiceError::Backend(anyhow::anyhow!("{what} API returned {status}: {detail}")),
    }
}
