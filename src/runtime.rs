//! Runtime events emitted by signaling and the per-call handlers.
//!
//! Events are small and cloned onto a broadcast channel, so emitting never
//! blocks the media path. A lagging subscriber loses events, not calls.

use crate::error::{ErrorKind, ErrorRecord, Stage};
use crate::pipeline::ConversationState;
use crate::sip::CallState;
use tokio::sync::broadcast;

/// Capacity of the process-wide event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What a call is doing "right now".
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// A call entered a new signaling state.
    CallState { call_id: String, state: CallState },
    /// The conversation handler changed state.
    Conversation {
        call_id: String,
        state: ConversationState,
    },
    /// Caller speech recognized by the transcriber.
    Transcript {
        call_id: String,
        text: String,
        is_final: bool,
    },
    /// A reply segment handed to synthesis.
    AssistantSegment {
        call_id: String,
        turn: u64,
        index: usize,
        text: String,
        is_last: bool,
    },
    /// The caller talked over playback and the turn was cut.
    BargeIn { call_id: String, turn: u64 },
    VoiceSwitched {
        call_id: String,
        from: String,
        to: String,
    },
    /// A stage failed. Fatal errors end the call.
    StageError {
        call_id: String,
        kind: ErrorKind,
        stage: Stage,
        message: String,
    },
    /// The bridge decided to end the call itself.
    HangupRequested { call_id: String, reason: String },
}

impl RuntimeEvent {
    pub fn call_id(&self) -> &str {
        match self {
            Self::CallState { call_id, .. }
            | Self::Conversation { call_id, .. }
            | Self::Transcript { call_id, .. }
            | Self::AssistantSegment { call_id, .. }
            | Self::BargeIn { call_id, .. }
            | Self::VoiceSwitched { call_id, .. }
            | Self::StageError { call_id, .. }
            | Self::HangupRequested { call_id, .. } => call_id,
        }
    }

    pub fn stage_error(call_id: &str, record: &ErrorRecord) -> Self {
        Self::StageError {
            call_id: call_id.to_owned(),
            kind: record.kind,
            stage: record.stage,
            message: record.message.clone(),
        }
    }
}

/// Sender half of the event channel. Emitting with no subscribers is fine.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<RuntimeEvent>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: RuntimeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }
}
