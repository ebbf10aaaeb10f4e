//! Call session state.

use crate::error::{BridgeError, Result};
use crate::resolver::{AssistantProfile, AutoAnswerScheme};
use chrono::{DateTime, Utc};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Lifecycle of a call.
///
/// ```text
/// Ringing ──► Answering ──► Active ──► Ended
///    │            │            │
///    ├──► Cancelled ◄┘          │
///    └──► Failed ◄──────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    Ringing,
    Answering,
    Active,
    Ended,
    Cancelled,
    Failed,
}

impl CallState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ringing => "ringing",
            Self::Answering => "answering",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Cancelled | Self::Failed)
    }

    /// Whether `self -> next` is a legal edge.
    pub fn can_transition_to(self, next: Self) -> bool {
        use CallState::{Active, Answering, Cancelled, Ended, Failed, Ringing};
        matches!(
            (self, next),
            (Ringing, Answering | Cancelled | Failed)
                | (Answering, Active | Cancelled | Failed)
                | (Active, Ended | Failed)
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallState {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ringing" => Ok(Self::Ringing),
            "answering" => Ok(Self::Answering),
            "active" => Ok(Self::Active),
            "ended" => Ok(Self::Ended),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(BridgeError::Store(format!("unknown call state {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

/// One call and its resolved configuration.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: String,
    pub direction: Direction,
    state: CallState,
    /// Caller identity (From user part).
    pub caller: String,
    /// Called identity (Request-URI user part).
    pub called: String,
    pub local_media: SocketAddr,
    pub remote_media: SocketAddr,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub scheme: AutoAnswerScheme,
    pub assistant: AssistantProfile,
}

impl CallSession {
    pub fn inbound(
        call_id: impl Into<String>,
        caller: impl Into<String>,
        called: impl Into<String>,
        local_media: SocketAddr,
        remote_media: SocketAddr,
        scheme: AutoAnswerScheme,
        assistant: AssistantProfile,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            direction: Direction::Inbound,
            state: CallState::Ringing,
            caller: caller.into(),
            called: called.into(),
            local_media,
            remote_media,
            started_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            scheme,
            assistant,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Move to `next`, stamping answer/end times.
    ///
    /// # Errors
    ///
    /// Returns a signaling error for an illegal edge; the state is unchanged.
    pub fn transition(&mut self, next: CallState) -> Result<CallState> {
        if !self.state.can_transition_to(next) {
            return Err(BridgeError::Signaling(format!(
                "illegal call transition {} -> {next} for {}",
                self.state, self.call_id
            )));
        }
        let prev = self.state;
        self.state = next;
        let now = Utc::now();
        if next == CallState::Active {
            self.answered_at = Some(now);
        }
        if next.is_terminal() {
            self.ended_at = Some(now);
        }
        tracing::debug!(call_id = %self.call_id, from = %prev, to = %next, "call state");
        Ok(prev)
    }
}
