//! Error types for the voice bridge.
//!
//! [`BridgeError`] is the plain library error. Pipeline stages report
//! failures to the conversation handler as [`ErrorRecord`]s, which carry a
//! supervision [`ErrorKind`] and the originating [`Stage`].

use std::fmt;

/// Top-level error type for the bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// SIP parse or dialog error.
    #[error("signaling error: {0}")]
    Signaling(String),

    /// SDP offer/answer could not be agreed.
    #[error("media negotiation error: {0}")]
    Negotiation(String),

    /// RTP socket or routing error.
    #[error("media error: {0}")]
    Media(String),

    /// Audio conversion error (G.711, resampling, WAV).
    #[error("codec error: {0}")]
    Codec(String),

    /// Speech-to-text provider error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Language model provider error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// Text-to-speech provider error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Call record persistence error.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// A bounded wait elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// How the handler must react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The call cannot continue; tear it down.
    Fatal,
    /// The current turn is abandoned; the call continues listening.
    Recoverable,
    /// A provider hiccup; the owning stage may reconnect once.
    Transient,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fatal => "fatal",
            Self::Recoverable => "recoverable",
            Self::Transient => "transient",
        };
        f.write_str(s)
    }
}

/// Pipeline stage that produced an [`ErrorRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Signaling,
    Media,
    Transcriber,
    LanguageModel,
    Synthesizer,
    Recording,
    Handler,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Signaling => "signaling",
            Self::Media => "media",
            Self::Transcriber => "transcriber",
            Self::LanguageModel => "language_model",
            Self::Synthesizer => "synthesizer",
            Self::Recording => "recording",
            Self::Handler => "handler",
        };
        f.write_str(s)
    }
}

/// A classified failure reported by a pipeline stage.
#[derive(Debug, thiserror::Error)]
#[error("{kind} {stage} error: {message}")]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub message: String,
    #[source]
    pub cause: Option<BridgeError>,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
            cause: None,
        }
    }

    pub fn fatal(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, stage, message)
    }

    pub fn recoverable(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Recoverable, stage, message)
    }

    pub fn transient(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, stage, message)
    }

    /// Attach the underlying error.
    pub fn with_cause(mut self, cause: BridgeError) -> Self {
        self.cause = Some(cause);
        self
    }

    /// A transient failure that survived its single retry becomes recoverable.
    /// Fatal and recoverable records are returned unchanged.
    pub fn escalate(mut self) -> Self {
        if self.kind == ErrorKind::Transient {
            self.kind = ErrorKind::Recoverable;
        }
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::Fatal
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

/// Result type for provider calls made on behalf of a pipeline stage.
pub type StageResult<T> = std::result::Result<T, ErrorRecord>;
