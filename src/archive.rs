use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::app_dirs::AppDirs;
use crate::submission::{CompletionPayload, Delivery};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("csv export failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("archive i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("no state directory available for the archive")]
    NoStateDir,
}

/// One finalised session as kept on this machine
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchivedSession {
    pub id: i64,
    pub device_id: String,
    pub completion_code: String,
    pub trials_completed: usize,
    pub correct_responses: usize,
    pub accuracy: String,
    pub language: String,
    pub admin_mode: bool,
    pub response_times: String,
    pub trial_statuses: String,
    pub submitted_at: DateTime<Utc>,
    pub delivery: String,
}

/// Local record of completed sessions and whether they reached the endpoint
#[derive(Debug)]
pub struct ResultsArchive {
    conn: Connection,
}

impl ResultsArchive {
    /// Open the archive under the state directory, creating it if needed
    pub fn open_default() -> Result<Self, ArchiveError> {
        let path = AppDirs::archive_path().ok_or(ArchiveError::NoStateDir)?;
        Self::open(path)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ArchiveError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "results archive opened");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, ArchiveError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, ArchiveError> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS completed_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                completion_code TEXT NOT NULL UNIQUE,
                trials_completed INTEGER NOT NULL,
                correct_responses INTEGER NOT NULL,
                accuracy TEXT NOT NULL,
                language TEXT NOT NULL,
                admin_mode BOOLEAN NOT NULL,
                response_times TEXT NOT NULL,
                trial_statuses TEXT NOT NULL,
                submitted_at TEXT NOT NULL,
                delivery TEXT NOT NULL
            )
            "#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_completed_sessions_submitted ON completed_sessions(submitted_at)",
            [],
        )?;
        Ok(Self { conn })
    }

    /// Store a payload, or update its delivery status when the same
    /// completion code was archived before (a retried save).
    pub fn record(&self, payload: &CompletionPayload, delivery: Delivery) -> Result<(), ArchiveError> {
        self.conn.execute(
            r#"
            INSERT INTO completed_sessions
            (device_id, completion_code, trials_completed, correct_responses, accuracy,
             language, admin_mode, response_times, trial_statuses, submitted_at, delivery)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(completion_code) DO UPDATE SET delivery = excluded.delivery
            "#,
            params![
                payload.device_id,
                payload.completion_code,
                payload.trials_completed as i64,
                payload.correct_responses as i64,
                payload.accuracy,
                payload.language,
                payload.admin_mode,
                payload.response_times,
                payload.trial_statuses,
                payload.submitted_at.to_rfc3339(),
                delivery.to_string(),
            ],
        )?;
        info!(code = %payload.completion_code, %delivery, "session archived");
        Ok(())
    }

    pub fn update_delivery(&self, completion_code: &str, delivery: Delivery) -> Result<bool, ArchiveError> {
        let changed = self.conn.execute(
            "UPDATE completed_sessions SET delivery = ?1 WHERE completion_code = ?2",
            params![delivery.to_string(), completion_code],
        )?;
        Ok(changed > 0)
    }

    /// Most recent first
    pub fn list_recent(&self, limit: usize) -> Result<Vec<ArchivedSession>, ArchiveError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, device_id, completion_code, trials_completed, correct_responses, accuracy,
                   language, admin_mode, response_times, trial_statuses, submitted_at, delivery
            FROM completed_sessions
            ORDER BY submitted_at DESC, id DESC
            LIMIT ?1
            "#,
        )?;

        let rows = stmt.query_map([limit as i64], |row| {
            let submitted: String = row.get(10)?;
            let submitted_at = DateTime::parse_from_rfc3339(&submitted)
                .map_err(|_| {
                    rusqlite::Error::InvalidColumnType(
                        10,
                        "submitted_at".to_string(),
                        rusqlite::types::Type::Text,
                    )
                })?
                .with_timezone(&Utc);

            Ok(ArchivedSession {
                id: row.get(0)?,
                device_id: row.get(1)?,
                completion_code: row.get(2)?,
                trials_completed: row.get::<_, i64>(3)? as usize,
                correct_responses: row.get::<_, i64>(4)? as usize,
                accuracy: row.get(5)?,
                language: row.get(6)?,
                admin_mode: row.get(7)?,
                response_times: row.get(8)?,
                trial_statuses: row.get(9)?,
                submitted_at,
                delivery: row.get(11)?,
            })
        })?;

        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count(&self) -> Result<usize, ArchiveError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM completed_sessions", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn clear_all(&self) -> Result<usize, ArchiveError> {
        let removed = self.conn.execute("DELETE FROM completed_sessions", [])?;
        info!(removed, "results archive cleared");
        Ok(removed)
    }

    /// Write every archived session to `path` as CSV. Returns the row count.
    pub fn export_csv<P: AsRef<Path>>(&self, path: P) -> Result<usize, ArchiveError> {
        let sessions = self.list_recent(usize::MAX >> 1)?;
        let mut writer = csv::Writer::from_path(path.as_ref())?;
        for session in &sessions {
            writer.serialize(session)?;
        }
        writer.flush()?;
        info!(rows = sessions.len(), path = %path.as_ref().display(), "archive exported");
        Ok(sessions.len())
    }

    pub fn default_path() -> Option<PathBuf> {
        AppDirs::archive_path()
    }
}
