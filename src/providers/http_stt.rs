//! Endpointed transcription over an OpenAI-compatible
//! `/v1/audio/transcriptions` endpoint.
//!
//! Caller audio is grouped into utterances by energy endpointing and each
//! utterance is posted as a WAV file. One final transcript is produced per
//! utterance; an empty partial marks speech onset.

use super::{
    CallContext, Transcriber, TranscriberEvent, TranscriberFactory, classify_status,
    classify_transport, error_message, http_client, retry_transient_once,
};
use crate::audio::{FRAME_SAMPLES, NARROWBAND_RATE, wav::encode_wav};
use crate::config::{SttConfig, VadConfig};
use crate::error::{ErrorRecord, Result, Stage, StageResult};
use crate::vad::{EndpointEvent, UtteranceDetector};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const RETRY_BACKOFF: Duration = Duration::from_millis(200);
const AUDIO_QUEUE: usize = 64;

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

pub struct HttpTranscriberFactory {
    client: reqwest::Client,
    stt: Arc<SttConfig>,
    vad: VadConfig,
}

impl HttpTranscriberFactory {
    /// # Errors
    ///
    /// Returns a config error if the HTTP client cannot be built.
    pub fn new(stt: SttConfig, vad: VadConfig) -> Result<Self> {
        let client = http_client(
            Duration::from_secs(5),
            Some(Duration::from_secs(stt.request_timeout_secs)),
        )?;
        Ok(Self {
            client,
            stt: Arc::new(stt),
            vad,
        })
    }
}

impl TranscriberFactory for HttpTranscriberFactory {
    fn create(&self, _ctx: &CallContext) -> StageResult<Box<dyn Transcriber>> {
        Ok(Box::new(HttpTranscriber {
            poster: UtterancePoster {
                client: self.client.clone(),
                config: Arc::clone(&self.stt),
            },
            vad: self.vad.clone(),
            audio_tx: None,
            worker: None,
        }))
    }
}

#[derive(Clone)]
struct UtterancePoster {
    client: reqwest::Client,
    config: Arc<SttConfig>,
}

impl UtterancePoster {
    async fn post(&self, wav: &[u8], language: &str) -> StageResult<String> {
        let part = reqwest::multipart::Part::bytes(wav.to_vec())
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| ErrorRecord::recoverable(Stage::Transcriber, e.to_string()))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.config.model.clone());
        if !language.is_empty() {
            form = form.text("language", language.to_owned());
        }

        let url = format!(
            "{}/v1/audio/transcriptions",
            self.config.base_url.trim_end_matches('/')
        );
        let mut request = self.client.post(url).multipart(form);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(self.config.api_key.expose());
        }
        let response = request
            .send()
            .await
            .map_err(|e| classify_transport(Stage::Transcriber, &e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(
                Stage::Transcriber,
                status.as_u16(),
                &error_message(&body),
            ));
        }
        let parsed: TranscriptionResponse = response.json().await.map_err(|e| {
            ErrorRecord::recoverable(Stage::Transcriber, format!("bad transcription body: {e}"))
        })?;
        Ok(parsed.text.trim().to_owned())
    }

    async fn transcribe(&self, audio: &[i16], language: &str) -> StageResult<String> {
        let wav = encode_wav(audio, NARROWBAND_RATE).map_err(|e| {
            ErrorRecord::recoverable(Stage::Transcriber, "wav encode failed").with_cause(e)
        })?;
        retry_transient_once(RETRY_BACKOFF, || self.post(&wav, language)).await
    }
}

pub struct HttpTranscriber {
    poster: UtterancePoster,
    vad: VadConfig,
    audio_tx: Option<mpsc::Sender<Vec<i16>>>,
    worker: Option<JoinHandle<()>>,
}

async fn run_worker(
    poster: UtterancePoster,
    mut detector: UtteranceDetector,
    language: String,
    mut audio_rx: mpsc::Receiver<Vec<i16>>,
    events: mpsc::Sender<TranscriberEvent>,
) {
    let mut pending: Vec<i16> = Vec::new();
    let emit = |utterance: Vec<i16>| {
        let poster = poster.clone();
        let language = language.clone();
        let events = events.clone();
        async move {
            let event = match poster.transcribe(&utterance, &language).await {
                Ok(text) if text.is_empty() => return,
                Ok(text) => TranscriberEvent::Final(text),
                Err(e) => TranscriberEvent::Error(e),
            };
            let _ = events.send(event).await;
        }
    };

    while let Some(chunk) = audio_rx.recv().await {
        pending.extend_from_slice(&chunk);
        let whole = pending.len() - pending.len() % FRAME_SAMPLES;
        let frames: Vec<i16> = pending.drain(..whole).collect();
        for frame in frames.chunks(FRAME_SAMPLES) {
            match detector.process_frame(frame) {
                Some(EndpointEvent::SpeechStarted) => {
                    let _ = events.try_send(TranscriberEvent::Partial(String::new()));
                }
                Some(EndpointEvent::Utterance(audio)) => {
                    debug!(samples = audio.len(), "utterance endpointed");
                    emit(audio).await;
                }
                None => {}
            }
        }
    }
    if let Some(tail) = detector.flush() {
        emit(tail).await;
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn start(&mut self, ctx: &CallContext) -> StageResult<mpsc::Receiver<TranscriberEvent>> {
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE);
        let (events_tx, events_rx) = mpsc::channel(16);
        let language = if self.poster.config.language.is_empty() {
            ctx.language.clone()
        } else {
            self.poster.config.language.clone()
        };
        let worker = tokio::spawn(run_worker(
            self.poster.clone(),
            UtteranceDetector::new(&self.vad),
            language,
            audio_rx,
            events_tx,
        ));
        if let Some(old) = self.worker.replace(worker) {
            old.abort();
        }
        self.audio_tx = Some(audio_tx);
        Ok(events_rx)
    }

    async fn feed(&mut self, chunk: &[i16]) -> StageResult<()> {
        let Some(tx) = &self.audio_tx else {
            return Err(ErrorRecord::recoverable(Stage::Transcriber, "transcriber not started"));
        };
        match tx.try_send(chunk.to_vec()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("transcriber backlog full, dropping audio chunk");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ErrorRecord::transient(
                Stage::Transcriber,
                "transcription worker stopped",
            )),
        }
    }

    async fn finish(&mut self) -> StageResult<()> {
        self.audio_tx.take();
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let limit = Duration::from_secs(self.poster.config.request_timeout_secs.max(1));
        match tokio::time::timeout(limit, worker).await {
            Ok(_) => Ok(()),
            Err(_) => Err(ErrorRecord::recoverable(
                Stage::Transcriber,
                "timed out flushing final utterance",
            )),
        }
    }
}

impl Drop for HttpTranscriber {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::error::ErrorKind;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx() -> CallContext {
        CallContext {
            call_id: "c1".into(),
            language: "en".into(),
        }
    }

    fn factory(base_url: &str) -> HttpTranscriberFactory {
        HttpTranscriberFactory::new(
            SttConfig {
                base_url: base_url.to_owned(),
                ..SttConfig::default()
            },
            VadConfig::default(),
        )
        .unwrap()
    }

    fn speech_then_silence() -> Vec<i16> {
        let mut audio = vec![4000i16; 40 * FRAME_SAMPLES];
        audio.extend(vec![0i16; 40 * FRAME_SAMPLES]);
        audio
    }

    #[tokio::test]
    async fn utterance_is_posted_and_transcribed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/audio/transcriptions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"text": " turn the light on "})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut stt = factory(&server.uri()).create(&ctx()).unwrap();
        let mut rx = stt.start(&ctx()).await.unwrap();
        for chunk in speech_then_silence().chunks(1600) {
            stt.feed(chunk).await.unwrap();
        }

        assert!(matches!(rx.recv().await, Some(TranscriberEvent::Partial(_))));
        match rx.recv().await {
            Some(TranscriberEvent::Final(text)) => assert_eq!(text, "turn the light on"),
            other => panic!("expected final transcript, got {other:?}"),
        }
        stt.finish().await.unwrap();
    }

    #[tokio::test]
    async fn finish_flushes_open_utterance() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"text": "bye"})))
            .expect(1)
            .mount(&server)
            .await;

        let mut stt = factory(&server.uri()).create(&ctx()).unwrap();
        let mut rx = stt.start(&ctx()).await.unwrap();
        stt.feed(&vec![4000i16; 40 * FRAME_SAMPLES]).await.unwrap();
        stt.finish().await.unwrap();

        let mut finals = Vec::new();
        while let Some(event) = rx.recv().await {
            if let TranscriberEvent::Final(t) = event {
                finals.push(t);
            }
        }
        assert_eq!(finals, vec!["bye"]);
    }

    #[tokio::test]
    async fn provider_failure_is_reported_as_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let mut stt = factory(&server.uri()).create(&ctx()).unwrap();
        let mut rx = stt.start(&ctx()).await.unwrap();
        for chunk in speech_then_silence().chunks(1600) {
            stt.feed(chunk).await.unwrap();
        }
        loop {
            match rx.recv().await {
                Some(TranscriberEvent::Error(e)) => {
                    assert_eq!(e.kind, ErrorKind::Fatal);
                    break;
                }
                Some(_) => continue,
                None => panic!("stream ended without error"),
            }
        }
    }

    #[tokio::test]
    async fn feed_before_start_is_error() {
        let mut stt = factory("http://127.0.0.1:9").create(&ctx()).unwrap();
        assert!(stt.feed(&[0; 160]).await.is_err());
    }
}
