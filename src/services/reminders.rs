//! Reminders service backend.
//!
//! Unlike the message store, the reminders database is owned by this
//! daemon: it is created on first use and written through the same
//! single-connection, blocking-pool pattern the message adapter uses.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::Config;
use crate::services::{params, ServiceBackend, ServiceError};

const SCHEMA: &str = "\
    CREATE TABLE IF NOT EXISTS reminders (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        due TEXT,
        notes TEXT,
        priority INTEGER NOT NULL DEFAULT 0,
        completed INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        completed_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_reminders_due ON reminders(due);
    CREATE INDEX IF NOT EXISTS idx_reminders_completed ON reminders(completed);";

#[derive(Debug, Clone, Serialize)]
pub struct Reminder {
    pub id: String,
    pub title: String,
    pub due: Option<String>,
    pub notes: Option<String>,
    pub priority: i64,
    pub completed: bool,
    pub created_at: String,
    pub completed_at: Option<String>,
}

fn row_to_reminder(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reminder> {
    Ok(Reminder {
        id: row.get(0)?,
        title: row.get(1)?,
        due: row.get(2)?,
        notes: row.get(3)?,
        priority: row.get(4)?,
        completed: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
        completed_at: row.get(7)?,
    })
}

const COLUMNS: &str = "id, title, due, notes, priority, completed, created_at, completed_at";

pub struct ReminderService {
    conn: Arc<Mutex<Connection>>,
}

impl ReminderService {
    pub fn new(config: &Config) -> Result<Self, ServiceError> {
        Self::open(&config.reminders.db_path)
    }

    pub fn open(path: &Path) -> Result<Self, ServiceError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ServiceError::Backend(anyhow::anyhow!("create reminders dir: {e}")))?;
        }
        let conn = Connection::open(path).map_err(|e| {
            ServiceError::Backend(anyhow::anyhow!(
                "failed to open reminders database at {}: {e}",
                path.display()
            ))
        })?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| ServiceError::Backend(anyhow::anyhow!("reminders schema: {e}")))?;
        debug!("Opened reminders store at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn query<T, F>(&self, f: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let result = tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(|e| ServiceError::Backend(anyhow::anyhow!("reminders query task failed: {e}")))?;
        result.map_err(|e| ServiceError::Backend(anyhow::anyhow!("reminders query: {e}")))
    }

    async fn list(&self, params: &Value) -> Result<Value, ServiceError> {
        let include_completed = params::bool_or(params, "include_completed", false)?;
        let reminders = self
            .query(move |conn| {
                let sql = if include_completed {
                    format!("SELECT {COLUMNS} FROM reminders ORDER BY due IS NULL, due, created_at")
                } else {
                    format!(
                        "SELECT {COLUMNS} FROM reminders WHERE completed = 0 \
                         ORDER BY due IS NULL, due, created_at"
                    )
                };
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], row_to_reminder)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;
        Ok(json!({ "count": reminders.len(), "reminders": reminders }))
    }

    async fn upcoming(&self, params: &Value) -> Result<Value, ServiceError> {
        let days = params::limit(params, "days", 7, 365)? as i64;
        let limit = params::limit(params, "limit", 20, 200)?;
        let horizon = (Utc::now() + Duration::days(days)).to_rfc3339();
        let reminders = self
            .query(move |conn| {
                let sql = format!(
                    "SELECT {COLUMNS} FROM reminders \
                     WHERE completed = 0 AND due IS NOT NULL AND due <= ?1 \
                     ORDER BY due LIMIT ?2"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params![horizon, limit as i64], row_to_reminder)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;
        Ok(json!({ "count": reminders.len(), "reminders": reminders }))
    }

    async fn create(&self, params: &Value) -> Result<Value, ServiceError> {
        let title = params::required_str(params, "title")?.to_string();
        let due = match params::opt_str(params, "due")? {
            Some(raw) => Some(parse_due(raw)?.to_rfc3339()),
            None => None,
        };
        let notes = params::opt_str(params, "notes")?.map(str::to_string);
        let priority = match params.get("priority") {
            None | Some(Value::Null) => 0,
            Some(v) => v
                .as_i64()
                .filter(|p| (0..=3).contains(p))
                .ok_or_else(|| ServiceError::InvalidParams("priority must be 0-3".into()))?,
        };

        let id = uuid::Uuid::new_v4().to_string();
        let created_at = Utc::now().to_rfc3339();
        let reminder = Reminder {
            id: id.clone(),
            title,
            due,
            notes,
            priority,
            completed: false,
            created_at,
            completed_at: None,
        };
        let stored = reminder.clone();
        self.query(move |conn| {
            conn.execute(
                "INSERT INTO reminders (id, title, due, notes, priority, completed, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)",
                rusqlite::params![
                    stored.id,
                    stored.title,
                    stored.due,
                    stored.notes,
                    stored.priority,
                    stored.created_at
                ],
            )
        })
        .await?;
        Ok(json!({ "created": true, "reminder": reminder }))
    }

    async fn complete(&self, params: &Value) -> Result<Value, ServiceError> {
        let id = params::required_str(params, "id")?.to_string();
        let completed_at = Utc::now().to_rfc3339();
        let lookup_id = id.clone();
        let changed = self
            .query(move |conn| {
                conn.execute(
                    "UPDATE reminders SET completed = 1, completed_at = ?1 \
                     WHERE id = ?2 AND completed = 0",
                    rusqlite::params![completed_at, lookup_id],
                )
            })
            .await?;
        if changed == 0 {
            return Err(ServiceError::NotFound(format!(
                "no open reminder with id {id}"
            )));
        }
        Ok(json!({ "completed": true, "id": id }))
    }
}

#[async_trait]
impl ServiceBackend for ReminderService {
    fn name(&self) -> &'static str {
        "reminders"
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, ServiceError> {
        match method {
            "list" => self.list(&params).await,
            "upcoming" => self.upcoming(&params).await,
            "create" => self.create(&params).await,
            "complete" => self.complete(&params).await,
            _ => Err(ServiceError::UnknownMethod(format!("reminders.{method}"))),
        }
    }
}

fn parse_due(raw: &str) -> Result<DateTime<Utc>, ServiceError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(date) = raw.parse::<chrono::NaiveDate>() {
        if let Some(dt) = date.and_hms_opt(9, 0, 0) {
            return Ok(dt.and_utc());
        }
    }
    Err(ServiceError::InvalidParams(format!(
        "due must be an RFC 3339 timestamp or YYYY-MM-DD date, got '{raw}'"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service() -> (ReminderService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let service = ReminderService::open(&dir.path().join("reminders.db")).unwrap();
        (service, dir)
    }

    #[tokio::test]
    async fn create_then_list() {
        let (service, _dir) = service();
        let created = service
            .dispatch("create", json!({"title": "water plants", "priority": 2}))
            .await
            .unwrap();
        assert_eq!(created["reminder"]["title"], "water plants");

        let listed = service.dispatch("list", json!({})).await.unwrap();
        assert_eq!(listed["count"], 1);
    }

    #[tokio::test]
    async fn complete_removes_from_default_list() {
        let (service, _dir) = service();
        let created = service
            .dispatch("create", json!({"title": "file taxes"}))
            .await
            .unwrap();
        let id = created["reminder"]["id"].as_str().unwrap().to_string();

        service.dispatch("complete", json!({"id": id})).await.unwrap();

        let open = service.dispatch("list", json!({})).await.unwrap();
        assert_eq!(open["count"], 0);
        let all = service
            .dispatch("list", json!({"include_completed": true}))
            .await
            .unwrap();
        assert_eq!(all["count"], 1);
        assert_eq!(all["reminders"][0]["completed"], true);
    }

    #[tokio::test]
    async fn completing_twice_is_not_found() {
        let (service, _dir) = service();
        let created = service.dispatch("create", json!({"title": "x"})).await.unwrap();
        let id = created["reminder"]["id"].as_str().unwrap().to_string();
        service.dispatch("complete", json!({"id": id.clone()})).await.unwrap();
        let err = service.dispatch("complete", json!({"id": id})).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[tokio::test]
    async fn upcoming_filters_by_horizon() {
        let (service, _dir) = service();
        let soon = (Utc::now() + Duration::days(2)).to_rfc3339();
        let far = (Utc::now() + Duration::days(40)).to_rfc3339();
        service
            .dispatch("create", json!({"title": "soon", "due": soon}))
            .await
            .unwrap();
        service
            .dispatch("create", json!({"title": "far", "due": far}))
            .await
            .unwrap();

        let upcoming = service.dispatch("upcoming", json!({"days": 7})).await.unwrap();
        assert_eq!(upcoming["count"], 1);
        assert_eq!(upcoming["reminders"][0]["title"], "soon");
    }

    #[tokio::test]
    async fn invalid_priority_rejected() {
        let (service, _dir) = service();
        let err = service
            .dispatch("create", json!({"title": "x", "priority": 9}))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidParams(_)));
    }

    #[test]
    fn due_accepts_bare_dates() {
        assert!(parse_due("2026-05-01").is_ok());
        assert!(parse_due("not a date").is_err());
    }
}
