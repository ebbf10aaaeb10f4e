//! Speech synthesis over an OpenAI-compatible `/v1/audio/speech` endpoint.

use super::{
    AudioFrameStream, Synthesizer, SynthesizerFactory, classify_status, classify_transport,
    error_message, http_client, retry_transient_once,
};
use crate::audio::{NARROWBAND_RATE, resample_linear, split_frames, wav::decode_wav};
use crate::config::{Secret, TtsConfig};
use crate::error::{ErrorRecord, Result, Stage, StageResult};
use crate::voices::VoiceProfile;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const RETRY_BACKOFF: Duration = Duration::from_millis(200);

pub struct HttpSynthesizerFactory {
    client: reqwest::Client,
    config: Arc<TtsConfig>,
}

impl HttpSynthesizerFactory {
    /// # Errors
    ///
    /// Returns a config error if the HTTP client cannot be built.
    pub fn new(config: TtsConfig) -> Result<Self> {
        let client = http_client(
            Duration::from_secs(5),
            Some(Duration::from_secs(config.request_timeout_secs)),
        )?;
        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }
}

impl SynthesizerFactory for HttpSynthesizerFactory {
    fn create(&self, voice: &VoiceProfile) -> StageResult<Arc<dyn Synthesizer>> {
        Ok(Arc::new(HttpSynthesizer {
            client: self.client.clone(),
            url: format!("{}/v1/audio/speech", self.config.base_url.trim_end_matches('/')),
            api_key: self.config.api_key.clone(),
            model: self.config.model.clone(),
            voice_id: voice.id.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// One voice on the speech endpoint. The profile id is sent as `voice`.
pub struct HttpSynthesizer {
    client: reqwest::Client,
    url: String,
    api_key: Secret,
    model: String,
    voice_id: String,
    closed: AtomicBool,
}

impl HttpSynthesizer {
    async fn fetch(&self, text: &str) -> StageResult<Vec<u8>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice_id,
            "response_format": "wav",
        });
        let mut request = self.client.post(&self.url).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(self.api_key.expose());
        }
        let response = request
            .send()
            .await
            .map_err(|e| classify_transport(Stage::Synthesizer, &e))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(
                Stage::Synthesizer,
                status.as_u16(),
                &error_message(&text),
            ));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_transport(Stage::Synthesizer, &e))?;
        Ok(bytes.to_vec())
    }
}

/// Decode provider WAV into 20 ms narrowband frames.
pub fn wav_to_frames(wav: &[u8]) -> StageResult<Vec<Vec<i16>>> {
    let (samples, rate) = decode_wav(wav).map_err(|e| {
        ErrorRecord::recoverable(Stage::Synthesizer, "undecodable audio").with_cause(e)
    })?;
    let narrow = resample_linear(&samples, rate, NARROWBAND_RATE).map_err(|e| {
        ErrorRecord::recoverable(Stage::Synthesizer, "resample failed").with_cause(e)
    })?;
    Ok(split_frames(&narrow))
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    fn voice_id(&self) -> &str {
        &self.voice_id
    }

    async fn synthesize(&self, text: &str, cancel: CancellationToken) -> StageResult<AudioFrameStream> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ErrorRecord::recoverable(
                Stage::Synthesizer,
                format!("voice {} is closed", self.voice_id),
            ));
        }
        let fetch = retry_transient_once(RETRY_BACKOFF, || self.fetch(text));
        let wav = tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!(voice = %self.voice_id, "synthesis abandoned before audio arrived");
                return Ok(Box::pin(futures_util::stream::empty()));
            }
            wav = fetch => wav?,
        };
        let frames = wav_to_frames(&wav)?;
        tracing::trace!(voice = %self.voice_id, frames = frames.len(), "synthesized");
        Ok(Box::pin(
            futures_util::stream::iter(frames.into_iter().map(Ok))
                .take_until(cancel.cancelled_owned()),
        ))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::audio::wav::encode_wav;
    use crate::error::ErrorKind;
    use crate::voices::VoiceRegistry;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn synth(base_url: &str) -> Arc<dyn Synthesizer> {
        let factory = HttpSynthesizerFactory::new(TtsConfig {
            base_url: base_url.to_owned(),
            api_key: Secret("k".into()),
            ..TtsConfig::default()
        })
        .unwrap();
        let registry = VoiceRegistry::builtin();
        let voice = registry.get("en-us-female").unwrap().clone();
        factory.create(&voice).unwrap()
    }

    #[test]
    fn wideband_wav_becomes_narrowband_frames() {
        let wav = encode_wav(&vec![1000i16; 24_000], 24_000).unwrap(); // 1 s
        let frames = wav_to_frames(&wav).unwrap();
        assert_eq!(frames.len(), 50);
        assert!(frames.iter().all(|f| f.len() == 160));
        assert!(wav_to_frames(b"not a wav").is_err());
    }

    #[tokio::test]
    async fn posts_text_and_streams_frames() {
        let server = MockServer::start().await;
        let wav = encode_wav(&vec![500i16; 3_200], 16_000).unwrap(); // 200 ms
        Mock::given(method("POST"))
            .and(path("/v1/audio/speech"))
            .and(body_partial_json(serde_json::json!({
                "input": "Sure,",
                "voice": "en-us-female",
                "response_format": "wav",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(wav, "audio/wav"))
            .expect(1)
            .mount(&server)
            .await;

        let stream = synth(&server.uri())
            .synthesize("Sure,", CancellationToken::new())
            .await
            .unwrap();
        let frames: Vec<_> = stream.collect().await;
        assert_eq!(frames.len(), 10);
    }

    #[tokio::test]
    async fn cancelled_token_yields_no_frames() {
        let server = MockServer::start().await;
        let wav = encode_wav(&vec![500i16; 8_000], 8_000).unwrap();
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(wav, "audio/wav"))
            .mount(&server)
            .await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let frames: Vec<_> = synth(&server.uri())
            .synthesize("hello", cancel)
            .await
            .unwrap()
            .collect()
            .await;
        assert!(frames.is_empty());
    }

    #[tokio::test]
    async fn rate_limit_retries_then_escalates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .expect(2)
            .mount(&server)
            .await;
        let err = synth(&server.uri())
            .synthesize("hello", CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::Recoverable);
    }

    #[tokio::test]
    async fn closed_voice_refuses_work() {
        let s = synth("http://127.0.0.1:9");
        s.close().await;
        assert!(s.synthesize("x", CancellationToken::new()).await.is_err());
    }
}
