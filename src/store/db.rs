//! Read-only adapter for the external message database.
//!
//! The database is owned by the messaging application; this adapter opens
//! it read-only and treats the single connection as an exclusive resource
//! behind a mutex. Queries run on the blocking pool so a slow scan never
//! stalls the accept loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, Row};
use serde::Serialize;
use tracing::debug;

use crate::services::ServiceError;
use crate::store::decode;
use crate::util::escape_like;

/// A decoded message row. `text` is the decoder's best-effort extraction
/// or the explicit unavailable sentinel, never fabricated content.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: i64,
    pub chat_id: Option<String>,
    pub sender: Option<String>,
    pub timestamp_utc: Option<DateTime<Utc>>,
    pub text: String,
    pub is_from_me: bool,
    pub is_group: bool,
    pub attachments: i64,
}

const MESSAGE_COLUMNS: &str = "\
    message.ROWID, \
    message.cache_roomnames, \
    handle.id, \
    message.date, \
    message.text, \
    message.attributedBody, \
    message.is_from_me, \
    (SELECT COUNT(*) FROM message_attachment_join j WHERE j.message_id = message.ROWID)";

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let chat_id: Option<String> = row.get(1)?;
    let raw_date: Option<i64> = row.get(3)?;
    let text: Option<String> = row.get(4)?;
    let blob: Option<Vec<u8>> = row.get(5)?;
    Ok(Message {
        id: row.get(0)?,
        is_group: chat_id.as_deref().is_some_and(|c| !c.is_empty()),
        chat_id,
        sender: row.get(2)?,
        timestamp_utc: raw_date.map(decode::store_timestamp_to_utc),
        text: decode::message_text(text.as_deref(), blob.as_deref()),
        is_from_me: row.get::<_, i64>(6)? != 0,
        attachments: row.get(7)?,
    })
}

/// Read-only handle to the message database.
#[derive(Clone)]
pub struct MessageStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl MessageStore {
    /// Open the database read-only. An OS-level access restriction (the
    /// platform's local data-access grant) surfaces as `PermissionDenied`
    /// so the client can show an actionable message.
    pub fn open(path: &Path) -> Result<Self, ServiceError> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| classify_open_error(path, e))?;
        debug!(path = %path.display(), "opened message store");
        Ok(Self {
            path: path.to_path_buf(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a query on the blocking pool while holding the connection lock.
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
        .map_err(|e| ServiceError::Backend(anyhow::anyhow!("store query task failed: {e}")))?;
        result.map_err(|e| ServiceError::Backend(anyhow::anyhow!("message store query: {e}")))
    }

    pub async fn unread_count(&self) -> Result<i64, ServiceError> {
        self.query(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM message WHERE is_read = 0 AND is_from_me = 0",
                [],
                |row| row.get(0),
            )
        })
        .await
    }

    pub async fn unread(&self, limit: usize) -> Result<Vec<Message>, ServiceError> {
        self.query(move |conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM message \
                 LEFT JOIN handle ON message.handle_id = handle.ROWID \
                 WHERE message.is_read = 0 AND message.is_from_me = 0 \
                 ORDER BY message.date DESC LIMIT ?1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([limit as i64], row_to_message)?;
            rows.collect()
        })
        .await
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<Message>, ServiceError> {
        self.query(move |conn| {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM message \
                 LEFT JOIN handle ON message.handle_id = handle.ROWID \
                 ORDER BY message.date DESC LIMIT ?1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([limit as i64], row_to_message)?;
            rows.collect()
        })
        .await
    }

    /// Messages exchanged with a single handle, matched by identifier
    /// suffix so `14155551234` finds `+14155551234` rows.
    pub async fn by_handle(
        &self,
        identifier: String,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, ServiceError> {
        self.query(move |conn| {
            let pattern = format!("%{}", escape_like(&identifier));
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM message \
                 JOIN handle ON message.handle_id = handle.ROWID \
                 WHERE handle.id LIKE ?1 ESCAPE '\\' \
                 ORDER BY message.date DESC LIMIT ?2 OFFSET ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params![pattern, limit as i64, offset as i64],
                row_to_message,
            )?;
            rows.collect()
        })
        .await
    }

    /// Substring search over message text.
    ///
    /// Rows whose `text` is NULL but carry a body blob cannot be matched
    /// by SQL LIKE, so they are pulled, decoded, and filtered here.
    pub async fn search(
        &self,
        needle: String,
        limit: usize,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, ServiceError> {
        let since_raw = since.map(decode::utc_to_store_timestamp);
        let lowered = needle.to_lowercase();
        let rows = self
            .query(move |conn| {
                let pattern = format!("%{}%", escape_like(&needle));
                let sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM message \
                     LEFT JOIN handle ON message.handle_id = handle.ROWID \
                     WHERE (message.text LIKE ?1 ESCAPE '\\' \
                            OR (message.text IS NULL AND message.attributedBody IS NOT NULL)) \
                       AND (?2 IS NULL OR message.date >= ?2) \
                     ORDER BY message.date DESC LIMIT ?3"
                );
                let mut stmt = conn.prepare(&sql)?;
                // Over-fetch to leave room for blob rows that decode to a miss.
                let fetch = (limit * 4).max(limit) as i64;
                let rows = stmt.query_map(
                    rusqlite::params![pattern, since_raw, fetch],
                    row_to_message,
                )?;
                rows.collect::<rusqlite::Result<Vec<Message>>>()
            })
            .await?;

        Ok(rows
            .into_iter()
            .filter(|m| m.text.to_lowercase().contains(&lowered))
            .take(limit)
            .collect())
    }
}

fn classify_open_error(path: &Path, err: rusqlite::Error) -> ServiceError {
    let denied = matches!(
        &err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::PermissionDenied
                || e.code == rusqlite::ErrorCode::CannotOpen
    );
    if denied && path.exists() {
        ServiceError::PermissionDenied(format!(
            "cannot read message database at {} (missing local data-access grant?)",
            path.display()
        ))
    } else {
        ServiceError::Backend(anyhow::anyhow!(
            "failed to open message database at {}: {err}",
            path.display()
        ))
    }
}
