//! SQLite-backed call record store.

use super::schema::{apply_schema, read_schema_version};
use super::{CallMetadata, CallRecordStore, StatusTimestamps, TurnRecord, VoicemailRecord};
use crate::error::{BridgeError, Result};
use crate::sip::CallState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Summary of a stored call, for inspection tooling and tests.
#[derive(Debug, Clone)]
pub struct CallSummary {
    pub call_id: String,
    pub caller: String,
    pub called: String,
    pub status: CallState,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub recording_path: Option<PathBuf>,
}

/// Thread-safe via an internal `Mutex<Connection>`; every statement runs on
/// the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

fn sql_err(e: rusqlite::Error) -> BridgeError {
    BridgeError::Store(e.to_string())
}

fn ts(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(|t| t.to_rfc3339())
}

fn parse_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns a store error if the file cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(sql_err)?;
        Self::from_connection(conn)
    }

    /// Private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns a store error if SQLite cannot be initialised.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory().map_err(sql_err)?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        apply_schema(&conn).map_err(sql_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| BridgeError::Store(format!("sqlite lock poisoned: {e}")))?;
            f(&guard).map_err(sql_err)
        })
        .await
        .map_err(|e| BridgeError::Store(format!("sqlite task failed: {e}")))?
    }

    pub async fn schema_version(&self) -> Result<Option<u32>> {
        self.with_conn(read_schema_version).await
    }

    pub async fn find_call(&self, call_id: &str) -> Result<Option<CallSummary>> {
        let id = call_id.to_owned();
        let row = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT call_id, caller, called, status, answered_at, ended_at, recording_path
                     FROM calls WHERE call_id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, Option<String>>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, Option<String>>(6)?,
                        ))
                    },
                )
                .optional()
            })
            .await?;

        let Some((call_id, caller, called, status, answered, ended, recording)) = row else {
            return Ok(None);
        };
        Ok(Some(CallSummary {
            call_id,
            caller,
            called,
            status: status.parse()?,
            answered_at: parse_ts(answered),
            ended_at: parse_ts(ended),
            recording_path: recording.map(PathBuf::from),
        }))
    }

    pub async fn voicemail_count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM voicemails", [], |row| row.get(0))
        })
        .await
    }

    pub async fn turn_count(&self, call_id: &str) -> Result<i64> {
        let id = call_id.to_owned();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM turns WHERE call_id = ?1",
                params![id],
                |row| row.get(0),
            )
        })
        .await
    }
}

#[async_trait]
impl CallRecordStore for SqliteStore {
    async fn create_call(&self, call: &CallMetadata) -> Result<()> {
        let call = call.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO calls
                 (call_id, direction, caller, called, scheme_id, assistant_id, status, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    call.call_id,
                    call.direction.as_str(),
                    call.caller,
                    call.called,
                    call.scheme_id,
                    call.assistant_id,
                    CallState::Ringing.as_str(),
                    call.started_at.to_rfc3339(),
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn update_status(
        &self,
        call_id: &str,
        status: CallState,
        timestamps: StatusTimestamps,
    ) -> Result<()> {
        let id = call_id.to_owned();
        let changed = self
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE calls SET status = ?1,
                         answered_at = COALESCE(?2, answered_at),
                         ended_at = COALESCE(?3, ended_at)
                     WHERE call_id = ?4",
                    params![
                        status.as_str(),
                        ts(timestamps.answered_at),
                        ts(timestamps.ended_at),
                        id
                    ],
                )
            })
            .await?;
        if changed == 0 {
            return Err(BridgeError::Store(format!("unknown call {call_id}")));
        }
        Ok(())
    }

    async fn attach_recording(&self, call_id: &str, path: &Path) -> Result<()> {
        let id = call_id.to_owned();
        let path = path.to_string_lossy().into_owned();
        let changed = self
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE calls SET recording_path = ?1 WHERE call_id = ?2",
                    params![path, id],
                )
            })
            .await?;
        if changed == 0 {
            return Err(BridgeError::Store(format!("unknown call {call_id}")));
        }
        Ok(())
    }

    async fn create_voicemail(&self, voicemail: &VoicemailRecord) -> Result<()> {
        let vm = voicemail.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO voicemails
                 (id, call_id, caller, called, recording_path, duration_ms, transcript, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    vm.id,
                    vm.call_id,
                    vm.caller,
                    vm.called,
                    vm.recording_path.map(|p| p.to_string_lossy().into_owned()),
                    i64::try_from(vm.duration_ms).unwrap_or(i64::MAX),
                    vm.transcript,
                    vm.created_at.to_rfc3339(),
                ],
            )
            .map(|_| ())
        })
        .await
    }

    async fn record_turn(&self, turn: &TurnRecord) -> Result<()> {
        let turn = turn.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO turns
                 (call_id, turn_index, user_text, assistant_text, interrupted, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    turn.call_id,
                    i64::try_from(turn.turn_index).unwrap_or(i64::MAX),
                    turn.user_text,
                    turn.assistant_text,
                    turn.interrupted,
                    turn.created_at.to_rfc3339(),
                ],
            )
            .map(|_| ())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::sip::Direction;

    fn meta(id: &str) -> CallMetadata {
        CallMetadata {
            call_id: id.into(),
            direction: Direction::Inbound,
            caller: "alice".into(),
            called: "100".into(),
            scheme_id: "s1".into(),
            assistant_id: Some("a1".into()),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn call_lifecycle_persists() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_call(&meta("c1")).await.unwrap();
        let answered = Utc::now();
        store
            .update_status(
                "c1",
                CallState::Active,
                StatusTimestamps {
                    answered_at: Some(answered),
                    ended_at: None,
                },
            )
            .await
            .unwrap();
        store
            .update_status(
                "c1",
                CallState::Ended,
                StatusTimestamps {
                    answered_at: None,
                    ended_at: Some(Utc::now()),
                },
            )
            .await
            .unwrap();
        store
            .attach_recording("c1", Path::new("/var/rec/c1.wav"))
            .await
            .unwrap();

        let call = store.find_call("c1").await.unwrap().unwrap();
        assert_eq!(call.status, CallState::Ended);
        assert!(call.answered_at.is_some(), "COALESCE keeps answered_at");
        assert!(call.ended_at.is_some());
        assert_eq!(call.recording_path.unwrap(), PathBuf::from("/var/rec/c1.wav"));
    }

    #[tokio::test]
    async fn unknown_call_is_error() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(
            store
                .update_status("zz", CallState::Ended, StatusTimestamps::default())
                .await
                .is_err()
        );
        assert!(store.find_call("zz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn voicemail_and_turns_are_written() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_call(&meta("c1")).await.unwrap();
        store
            .create_voicemail(&VoicemailRecord {
                id: "vm1".into(),
                call_id: "c1".into(),
                caller: "alice".into(),
                called: "100".into(),
                recording_path: None,
                duration_ms: 4_200,
                transcript: "call me back".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        for i in 0..2 {
            store
                .record_turn(&TurnRecord {
                    call_id: "c1".into(),
                    turn_index: i,
                    user_text: "hi".into(),
                    assistant_text: "hello".into(),
                    interrupted: false,
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        assert_eq!(store.voicemail_count().await.unwrap(), 1);
        assert_eq!(store.turn_count("c1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn file_database_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("calls.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.create_call(&meta("c9")).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.schema_version().await.unwrap(), Some(1));
        assert!(store.find_call("c9").await.unwrap().is_some());
    }
}
