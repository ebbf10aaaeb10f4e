//! Call record persistence.
//!
//! The bridge writes call metadata, status changes, recordings, voicemails
//! and conversation turns through [`CallRecordStore`]. It never reads the
//! store back for control decisions.

mod memory;
mod schema;
mod sqlite;

pub use memory::{MemoryStore, StoredCall};
pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::sip::{CallState, Direction};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// Metadata written when a call is accepted.
#[derive(Debug, Clone)]
pub struct CallMetadata {
    pub call_id: String,
    pub direction: Direction,
    pub caller: String,
    pub called: String,
    pub scheme_id: String,
    pub assistant_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Timestamps accompanying a status change.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusTimestamps {
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A voicemail left in message mode.
#[derive(Debug, Clone)]
pub struct VoicemailRecord {
    pub id: String,
    pub call_id: String,
    pub caller: String,
    pub called: String,
    pub recording_path: Option<PathBuf>,
    pub duration_ms: u64,
    pub transcript: String,
    pub created_at: DateTime<Utc>,
}

/// One completed conversation turn.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub call_id: String,
    pub turn_index: u64,
    pub user_text: String,
    pub assistant_text: String,
    /// Whether the caller barged in before the reply finished.
    pub interrupted: bool,
    pub created_at: DateTime<Utc>,
}

/// Write-mostly call record collaborator.
#[async_trait]
pub trait CallRecordStore: Send + Sync {
    async fn create_call(&self, call: &CallMetadata) -> Result<()>;

    async fn update_status(
        &self,
        call_id: &str,
        status: CallState,
        timestamps: StatusTimestamps,
    ) -> Result<()>;

    async fn attach_recording(&self, call_id: &str, path: &Path) -> Result<()>;

    async fn create_voicemail(&self, voicemail: &VoicemailRecord) -> Result<()>;

    async fn record_turn(&self, turn: &TurnRecord) -> Result<()>;
}
