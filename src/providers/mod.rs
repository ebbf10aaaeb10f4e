//! Streaming provider contracts for speech recognition, language models and
//! speech synthesis.
//!
//! The conversation handler depends only on these traits. Concrete vendors
//! are chosen once per process by [`ProviderSet::from_config`].

pub mod http_stt;
pub mod http_tts;
pub mod openai_llm;
pub mod scripted;
pub mod sse;

use crate::config::{BridgeConfig, LlmBackend, SttBackend, TtsBackend};
use crate::error::{ErrorKind, ErrorRecord, Result, Stage, StageResult};
use crate::voices::VoiceProfile;
use async_trait::async_trait;
use futures_util::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Per-call information handed to providers.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub call_id: String,
    /// Conversation language, e.g. `en` or `zh-CN`.
    pub language: String,
}

// ── Transcriber ──────────────────────────────────────────────

/// Output of a running transcriber.
#[derive(Debug)]
pub enum TranscriberEvent {
    Partial(String),
    Final(String),
    Error(ErrorRecord),
}

/// A streaming speech recognizer for one call.
///
/// `feed` receives fixed-size paced chunks of 8 kHz PCM and must not wait on
/// network round trips.
#[async_trait]
pub trait Transcriber: Send {
    async fn start(&mut self, ctx: &CallContext) -> StageResult<mpsc::Receiver<TranscriberEvent>>;

    async fn feed(&mut self, chunk: &[i16]) -> StageResult<()>;

    /// Flush pending audio and close the event stream.
    async fn finish(&mut self) -> StageResult<()>;
}

pub trait TranscriberFactory: Send + Sync {
    fn create(&self, ctx: &CallContext) -> StageResult<Box<dyn Transcriber>>;
}

// ── Synthesizer ──────────────────────────────────────────────

/// 20 ms frames of 8 kHz PCM, in playback order.
pub type AudioFrameStream = Pin<Box<dyn Stream<Item = StageResult<Vec<i16>>> + Send>>;

/// One synthesis voice.
///
/// Streams returned by `synthesize` end promptly once `cancel` fires and
/// release their request when dropped.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    fn voice_id(&self) -> &str;

    async fn synthesize(&self, text: &str, cancel: CancellationToken) -> StageResult<AudioFrameStream>;

    /// Release provider resources. Further `synthesize` calls fail.
    async fn close(&self);
}

pub trait SynthesizerFactory: Send + Sync {
    fn create(&self, voice: &VoiceProfile) -> StageResult<Arc<dyn Synthesizer>>;
}

// ── Language model ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One entry of the conversation history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Reply text fragments in arrival order.
pub type FragmentStream = Pin<Box<dyn Stream<Item = StageResult<String>> + Send>>;

#[async_trait]
pub trait LanguageModelClient: Send + Sync {
    async fn query(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        options: &QueryOptions,
    ) -> StageResult<FragmentStream>;
}

// ── Shared helpers ───────────────────────────────────────────

/// Run `attempt` and retry once, after `backoff`, if it fails transiently.
///
/// A second transient failure is escalated to recoverable.
pub async fn retry_transient_once<T, F, Fut>(backoff: Duration, mut attempt: F) -> StageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StageResult<T>>,
{
    match attempt().await {
        Err(e) if e.is_transient() => {
            tracing::debug!(stage = %e.stage, "transient failure, retrying once: {}", e.message);
            tokio::time::sleep(backoff).await;
            attempt().await.map_err(ErrorRecord::escalate)
        }
        other => other,
    }
}

/// Classify an HTTP status from a provider.
pub fn classify_status(stage: Stage, status: u16, message: &str) -> ErrorRecord {
    let kind = match status {
        401 | 403 => ErrorKind::Fatal,
        408 | 429 | 500..=599 => ErrorKind::Transient,
        _ => ErrorKind::Recoverable,
    };
    ErrorRecord::new(kind, stage, format!("HTTP {status}: {message}"))
}

/// Classify a transport-level `reqwest` error.
pub fn classify_transport(stage: Stage, err: &reqwest::Error) -> ErrorRecord {
    if err.is_connect() || err.is_timeout() || err.is_request() || err.is_body() {
        ErrorRecord::transient(stage, format!("request failed: {err}"))
    } else if let Some(status) = err.status() {
        classify_status(stage, status.as_u16(), &err.to_string())
    } else {
        ErrorRecord::recoverable(stage, format!("request failed: {err}"))
    }
}

/// `error.message` from an OpenAI-style error body, else the raw body.
pub(crate) fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.pointer("/error/message")?.as_str().map(str::to_owned))
        .unwrap_or_else(|| body.trim().to_owned())
}

pub(crate) fn http_client(connect_timeout: Duration, request_timeout: Option<Duration>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().connect_timeout(connect_timeout);
    if let Some(t) = request_timeout {
        builder = builder.timeout(t);
    }
    builder
        .build()
        .map_err(|e| crate::error::BridgeError::Config(format!("http client: {e}")))
}

// ── Selection ────────────────────────────────────────────────

/// The providers every handler in this process uses.
#[derive(Clone)]
pub struct ProviderSet {
    pub transcribers: Arc<dyn TranscriberFactory>,
    pub synthesizers: Arc<dyn SynthesizerFactory>,
    pub language_model: Arc<dyn LanguageModelClient>,
}

impl ProviderSet {
    /// Build the configured implementations.
    ///
    /// # Errors
    ///
    /// Returns a config error if an HTTP client cannot be constructed or a
    /// required API key is missing.
    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        let transcribers: Arc<dyn TranscriberFactory> = match config.stt.backend {
            SttBackend::Http => Arc::new(http_stt::HttpTranscriberFactory::new(
                config.stt.clone(),
                config.vad.clone(),
            )?),
            SttBackend::Scripted => Arc::new(scripted::ScriptedTranscriberFactory::endpointed(
                config.vad.clone(),
            )),
        };
        let synthesizers: Arc<dyn SynthesizerFactory> = match config.tts.backend {
            TtsBackend::Http => Arc::new(http_tts::HttpSynthesizerFactory::new(config.tts.clone())?),
            TtsBackend::Scripted => Arc::new(scripted::ScriptedSynthesizerFactory::default()),
        };
        let language_model: Arc<dyn LanguageModelClient> = match config.llm.backend {
            LlmBackend::OpenAi => Arc::new(openai_llm::OpenAiChatClient::new(&config.llm)?),
            LlmBackend::Scripted => Arc::new(scripted::ScriptedLanguageModel::echo()),
        };
        tracing::info!(
            stt = ?config.stt.backend,
            tts = ?config.tts.backend,
            llm = ?config.llm.backend,
            "providers configured"
        );
        Ok(Self {
            transcribers,
            synthesizers,
            language_model,
        })
    }
}
