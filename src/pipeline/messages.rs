//! Message types passed between the handler's tasks.

use crate::error::ErrorRecord;
use crate::providers::TranscriberEvent;
use std::fmt;
use std::path::PathBuf;

/// Conversation state of one call's handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationState {
    /// Not started, or torn down.
    Idle,
    /// Waiting for the caller to finish an utterance.
    Listening,
    /// A reply is being generated; no audio has gone out yet.
    Thinking,
    /// Reply audio is playing to the caller.
    Speaking,
    /// Message mode: capturing a voicemail.
    Recording,
}

impl ConversationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Recording => "recording",
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the handler asked signaling to end a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HangupReason {
    MaxDuration,
    /// A fatal stage error; carries the error message.
    Fatal(String),
}

impl fmt::Display for HangupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxDuration => f.write_str("maximum call duration reached"),
            Self::Fatal(msg) => write!(f, "fatal error: {msg}"),
        }
    }
}

/// A request from a handler to hang up its call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalHangup {
    pub call_id: String,
    pub reason: HangupReason,
}

/// What a finished handler did, returned from shutdown.
#[derive(Debug, Clone, Default)]
pub struct HandlerSummary {
    pub call_id: String,
    /// Reply turns completed or interrupted.
    pub turns: u64,
    pub barge_ins: u32,
    pub recording: Option<PathBuf>,
    pub voicemail_id: Option<String>,
}

/// Origin of a turn's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TurnKind {
    /// Reply to a caller utterance, generated by the language model.
    Reply,
    /// Fixed text such as a greeting or an apology.
    Canned,
}

#[derive(Debug)]
pub(crate) enum TurnOutcome {
    Completed,
    Interrupted,
    Failed(ErrorRecord),
}

/// Result of one turn task.
#[derive(Debug)]
pub(crate) struct TurnReport {
    pub turn_id: u64,
    pub kind: TurnKind,
    pub user_text: Option<String>,
    /// Text of the segments that were synthesized.
    pub assistant_text: String,
    pub frames: usize,
    pub outcome: TurnOutcome,
}

/// Sent to the supervisor by the ingest, turn and playout tasks.
#[derive(Debug)]
pub(crate) enum HandlerMsg {
    Transcript(TranscriberEvent),
    /// The turn queued its first frame for playout.
    TurnSpeaking(u64),
    TurnDone(TurnReport),
    /// The playout task reached the end of the turn's audio.
    PlayoutDone(u64),
    StageFailed(ErrorRecord),
}

#[derive(Debug)]
pub(crate) enum PlayoutItem {
    Frame { turn_id: u64, frame: Vec<i16> },
    EndOfTurn(u64),
}
