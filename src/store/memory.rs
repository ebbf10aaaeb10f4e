use super::{
    CallMetadata, CallRecordStore, StatusTimestamps, TurnRecord, VoicemailRecord,
};
use crate::error::{BridgeError, Result};
use crate::sip::CallState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// A call as seen by the store.
#[derive(Debug, Clone)]
pub struct StoredCall {
    pub metadata: CallMetadata,
    pub status: CallState,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub recording: Option<PathBuf>,
    /// Every status written, in order.
    pub status_history: Vec<CallState>,
    /// Number of `attach_recording` calls.
    pub recording_attachments: u32,
}

#[derive(Debug, Default)]
struct Inner {
    calls: HashMap<String, StoredCall>,
    voicemails: Vec<VoicemailRecord>,
    turns: Vec<TurnRecord>,
}

/// In-process store with read accessors for inspection.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|e| BridgeError::Store(format!("memory store poisoned: {e}")))
    }

    pub fn call(&self, call_id: &str) -> Option<StoredCall> {
        self.lock().ok()?.calls.get(call_id).cloned()
    }

    pub fn call_count(&self) -> usize {
        self.lock().map(|g| g.calls.len()).unwrap_or(0)
    }

    pub fn voicemails(&self) -> Vec<VoicemailRecord> {
        self.lock().map(|g| g.voicemails.clone()).unwrap_or_default()
    }

    pub fn turns(&self, call_id: &str) -> Vec<TurnRecord> {
        self.lock()
            .map(|g| {
                g.turns
                    .iter()
                    .filter(|t| t.call_id == call_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl CallRecordStore for MemoryStore {
    async fn create_call(&self, call: &CallMetadata) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.calls.contains_key(&call.call_id) {
            return Err(BridgeError::Store(format!("call {} already exists", call.call_id)));
        }
        inner.calls.insert(
            call.call_id.clone(),
            StoredCall {
                metadata: call.clone(),
                status: CallState::Ringing,
                answered_at: None,
                ended_at: None,
                recording: None,
                status_history: vec![CallState::Ringing],
                recording_attachments: 0,
            },
        );
        Ok(())
    }

    async fn update_status(
        &self,
        call_id: &str,
        status: CallState,
        timestamps: StatusTimestamps,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let call = inner
            .calls
            .get_mut(call_id)
            .ok_or_else(|| BridgeError::Store(format!("unknown call {call_id}")))?;
        call.status = status;
        call.status_history.push(status);
        if timestamps.answered_at.is_some() {
            call.answered_at = timestamps.answered_at;
        }
        if timestamps.ended_at.is_some() {
            call.ended_at = timestamps.ended_at;
        }
        Ok(())
    }

    async fn attach_recording(&self, call_id: &str, path: &Path) -> Result<()> {
        let mut inner = self.lock()?;
        let call = inner
            .calls
            .get_mut(call_id)
            .ok_or_else(|| BridgeError::Store(format!("unknown call {call_id}")))?;
        call.recording = Some(path.to_path_buf());
        call.recording_attachments += 1;
        Ok(())
    }

    async fn create_voicemail(&self, voicemail: &VoicemailRecord) -> Result<()> {
        self.lock()?.voicemails.push(voicemail.clone());
        Ok(())
    }

    async fn record_turn(&self, turn: &TurnRecord) -> Result<()> {
        self.lock()?.turns.push(turn.clone());
        Ok(())
    }
}
