//! Configuration types for the voice bridge.

use crate::resolver::{AssistantProfile, AutoAnswerScheme};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// SIP listener and dialog timers.
    pub signaling: SignalingConfig,
    /// RTP socket.
    pub media: MediaConfig,
    /// Barge-in and utterance detection.
    pub vad: VadConfig,
    /// Reply segmentation for synthesis.
    pub segmenter: SegmenterConfig,
    /// Speech-to-text provider.
    pub stt: SttConfig,
    /// Language model provider.
    pub llm: LlmConfig,
    /// Text-to-speech provider.
    pub tts: TtsConfig,
    /// Per-call handler behaviour.
    pub handler: HandlerConfig,
    /// Call recordings.
    pub recording: RecordingConfig,
    /// Call record persistence.
    pub store: StoreConfig,
    /// Log output.
    pub logging: LoggingConfig,
    /// Voice registry source.
    pub voices: VoicesConfig,
    /// Auto-answer schemes keyed by called number.
    pub schemes: Vec<AutoAnswerScheme>,
    /// Assistant profiles referenced by schemes.
    pub assistants: Vec<AssistantProfile>,
}

/// API key wrapper that never prints its value.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(pub String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("\"\"")
        } else {
            f.write_str("\"***\"")
        }
    }
}

/// SIP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// UDP address the SIP listener binds to.
    pub bind_addr: String,
    /// Host advertised in Contact headers and SDP answers.
    pub public_host: String,
    /// How long to wait for the caller's ACK after sending 200 OK.
    pub ack_timeout_ms: u64,
    /// First 200 OK retransmission interval; doubles up to `retransmit_max_ms`.
    pub retransmit_initial_ms: u64,
    /// Cap for the 200 OK retransmission interval.
    pub retransmit_max_ms: u64,
    /// Value of the `Server` / `User-Agent` header.
    pub user_agent: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5060".to_owned(),
            public_host: "127.0.0.1".to_owned(),
            ack_timeout_ms: 10_000,
            retransmit_initial_ms: 500,
            retransmit_max_ms: 4_000,
            user_agent: "voxbridge".to_owned(),
        }
    }
}

/// RTP socket configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// UDP address the shared RTP socket binds to.
    pub bind_addr: String,
    /// Per-call inbound payload queue depth (20 ms frames). Full queues drop.
    pub inbound_queue_frames: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:10000".to_owned(),
            inbound_queue_frames: 64,
        }
    }
}

/// Voice activity configuration.
///
/// RMS values are on the 16-bit PCM scale: silence sits under ~100 and
/// ordinary speech in the low thousands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Whether barge-in is enabled at all.
    pub barge_in_enabled: bool,
    /// Idle speech-detection threshold.
    pub speech_threshold: f32,
    /// Multiplier applied to `speech_threshold` while synthesized audio plays.
    pub playback_multiplier: f32,
    /// Consecutive loud frames required to declare barge-in.
    pub consecutive_frames: u32,
    /// Trailing silence that closes an utterance (endpointing transcriber).
    pub endpoint_silence_ms: u32,
    /// Utterances shorter than this are discarded (endpointing transcriber).
    pub endpoint_min_speech_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            barge_in_enabled: true,
            speech_threshold: 500.0,
            playback_multiplier: 4.0,
            consecutive_frames: 20,
            endpoint_silence_ms: 700,
            endpoint_min_speech_ms: 300,
        }
    }
}

impl VadConfig {
    /// Threshold applied while the assistant is speaking.
    pub fn playback_threshold(&self) -> f32 {
        self.speech_threshold * self.playback_multiplier
    }
}

/// Streaming segmenter configuration. Lengths are in characters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Buffer length at which the first segment may be cut.
    pub first_min_chars: usize,
    /// Hard cut position for the first segment.
    pub first_max_chars: usize,
    /// Minimum length of later segments before a sentence end is accepted.
    pub min_chars: usize,
    /// Buffer length at which a later segment is split near its midpoint.
    pub max_chars: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            first_min_chars: 4,
            first_max_chars: 20,
            min_chars: 6,
            max_chars: 80,
        }
    }
}

/// Which transcriber implementation to construct.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SttBackend {
    /// Endpointed utterances posted to an OpenAI-compatible transcription API.
    #[default]
    Http,
    /// In-process scripted transcripts (dry runs and tests).
    Scripted,
}

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    pub backend: SttBackend,
    pub base_url: String,
    pub api_key: Secret,
    pub model: String,
    /// Language hint passed to the provider (empty = auto).
    pub language: String,
    /// Size of each paced audio chunk sent to the provider.
    pub chunk_ms: u32,
    /// Maximum wait for a final transcript while listening.
    pub final_timeout_secs: u64,
    /// Per-request HTTP timeout.
    pub request_timeout_secs: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            backend: SttBackend::default(),
            base_url: "https://api.openai.com".to_owned(),
            api_key: Secret::default(),
            model: "whisper-1".to_owned(),
            language: String::new(),
            chunk_ms: 200,
            final_timeout_secs: 30,
            request_timeout_secs: 15,
        }
    }
}

/// Which language model client to construct.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmBackend {
    /// OpenAI-compatible chat completions with SSE streaming.
    #[default]
    OpenAi,
    /// In-process scripted replies.
    Scripted,
}

/// Language model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub base_url: String,
    pub api_key: Secret,
    pub model: String,
    /// Maximum wait for the first reply fragment.
    pub first_token_timeout_secs: u64,
    /// History entries kept per call (oldest dropped first).
    pub max_history_messages: usize,
    /// Connect timeout for the HTTP client.
    pub connect_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: LlmBackend::default(),
            base_url: "https://api.openai.com".to_owned(),
            api_key: Secret::default(),
            model: "gpt-4o-mini".to_owned(),
            first_token_timeout_secs: 10,
            max_history_messages: 20,
            connect_timeout_secs: 5,
        }
    }
}

/// Which synthesizer implementation to construct.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsBackend {
    /// OpenAI-compatible speech endpoint returning WAV.
    #[default]
    Http,
    /// In-process tone generator.
    Scripted,
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub backend: TtsBackend,
    pub base_url: String,
    pub api_key: Secret,
    pub model: String,
    /// Per-request HTTP timeout.
    pub request_timeout_secs: u64,
    /// Bounded wait for a retired synthesizer's producers to stop.
    pub teardown_timeout_ms: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            backend: TtsBackend::default(),
            base_url: "https://api.openai.com".to_owned(),
            api_key: Secret::default(),
            model: "tts-1".to_owned(),
            request_timeout_secs: 15,
            teardown_timeout_ms: 500,
        }
    }
}

/// Per-call handler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerConfig {
    /// Local hangup after this long (0 = unlimited).
    pub max_call_duration_secs: u64,
    /// Bounded wait for owned tasks on teardown.
    pub shutdown_timeout_ms: u64,
    /// Consecutive failed turns before the apology is spoken.
    pub surface_after_failures: u32,
    /// Spoken when turns keep failing.
    pub apology_text: String,
    /// Depth of the queue feeding the transcriber ingest task (20 ms frames).
    pub ingest_queue_frames: usize,
    /// Depth of the outbound frame queue (20 ms frames).
    pub playout_queue_frames: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            max_call_duration_secs: 1_800,
            shutdown_timeout_ms: 1_000,
            surface_after_failures: 3,
            apology_text: "Sorry, I'm having trouble right now. Please try again.".to_owned(),
            ingest_queue_frames: 250,
            playout_queue_frames: 500,
        }
    }
}

/// Call recording configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Record conversation-mode calls. Message mode always records.
    pub enabled: bool,
    /// Directory receiving `<call_id>.wav`.
    pub dir: PathBuf,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_data_dir().join("recordings"),
        }
    }
}

/// Which call record store to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// SQLite database at `store.path`.
    #[default]
    Sqlite,
    /// Process memory only.
    Memory,
}

/// Call record store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_data_dir().join("calls.db"),
        }
    }
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// When set, logs are also written to a daily-rolling file here.
    pub file_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "voxbridge=info".to_owned(),
            file_dir: None,
        }
    }
}

/// Voice registry configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoicesConfig {
    /// TOML file with `[[voices]]` entries. Built-in profiles when unset.
    pub file: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("voxbridge")
}

impl BridgeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::BridgeError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::BridgeError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/voxbridge/config.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| std::env::temp_dir().join("voxbridge-config"))
            .join("voxbridge")
            .join("config.toml")
    }

    /// Check cross-field constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns a config error describing the first violation found.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::BridgeError;

        if self.vad.consecutive_frames == 0 {
            return Err(BridgeError::Config(
                "vad.consecutive_frames must be at least 1".into(),
            ));
        }
        if self.vad.playback_multiplier < 1.0 {
            return Err(BridgeError::Config(
                "vad.playback_multiplier must be >= 1.0".into(),
            ));
        }
        let seg = &self.segmenter;
        if seg.first_min_chars == 0 || seg.first_max_chars < seg.first_min_chars {
            return Err(BridgeError::Config(
                "segmenter.first_max_chars must be >= first_min_chars >= 1".into(),
            ));
        }
        if seg.max_chars < seg.min_chars {
            return Err(BridgeError::Config(
                "segmenter.max_chars must be >= min_chars".into(),
            ));
        }
        if self.stt.chunk_ms < 20 || self.stt.chunk_ms % 20 != 0 {
            return Err(BridgeError::Config(
                "stt.chunk_ms must be a positive multiple of 20".into(),
            ));
        }
        for scheme in &self.schemes {
            if let Some(id) = &scheme.assistant_id
                && !self.assistants.iter().any(|a| &a.id == id)
            {
                tracing::warn!(
                    scheme = %scheme.id,
                    assistant = %id,
                    "scheme references an unknown assistant; matching calls will be rejected"
                );
            }
        }
        Ok(())
    }
}
