//! Deterministic in-process providers.
//!
//! Used by the test suites and by dry runs with `backend = "scripted"`.
//! Each factory hands out a handle so a test can drive transcripts and
//! inspect what the handler asked for.

use super::{
    AudioFrameStream, CallContext, ChatMessage, FragmentStream, LanguageModelClient, QueryOptions,
    Role, Synthesizer, SynthesizerFactory, Transcriber, TranscriberEvent, TranscriberFactory,
};
use crate::audio::{FRAME_SAMPLES, split_frames};
use crate::config::VadConfig;
use crate::error::{ErrorKind, ErrorRecord, Stage, StageResult};
use crate::vad::{EndpointEvent, UtteranceDetector};
use crate::voices::VoiceProfile;
use async_trait::async_trait;
use futures_util::stream;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Transcriber ──────────────────────────────────────────────

#[derive(Default)]
struct SttShared {
    tx: Mutex<Option<mpsc::Sender<TranscriberEvent>>>,
    fed_samples: AtomicUsize,
    chunk_sizes: Mutex<Vec<usize>>,
    queued: Mutex<VecDeque<String>>,
    utterances: AtomicUsize,
    starts: AtomicUsize,
    failing_starts: AtomicUsize,
    finished: AtomicBool,
}

/// Test-side control of a [`ScriptedTranscriber`].
#[derive(Clone)]
pub struct ScriptedTranscriberHandle {
    shared: Arc<SttShared>,
}

impl ScriptedTranscriberHandle {
    fn emit(&self, event: TranscriberEvent) -> bool {
        lock(&self.shared.tx)
            .as_ref()
            .is_some_and(|tx| tx.try_send(event).is_ok())
    }

    pub fn partial(&self, text: &str) -> bool {
        self.emit(TranscriberEvent::Partial(text.to_owned()))
    }

    /// Deliver a final transcript. Returns false if no transcriber is running.
    pub fn final_text(&self, text: &str) -> bool {
        self.emit(TranscriberEvent::Final(text.to_owned()))
    }

    pub fn error(&self, record: ErrorRecord) -> bool {
        self.emit(TranscriberEvent::Error(record))
    }

    /// Drop the event sender as if the provider connection went away.
    pub fn close_events(&self) -> bool {
        lock(&self.shared.tx).take().is_some()
    }

    /// The next `n` calls to `start` fail with a transient error.
    pub fn fail_starts(&self, n: usize) {
        self.shared.failing_starts.store(n, Ordering::SeqCst);
    }

    /// Transcripts returned, in order, for utterances found by the endpointer.
    pub fn queue_utterances<I, S>(&self, texts: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        lock(&self.shared.queued).extend(texts.into_iter().map(Into::into));
    }

    pub fn is_running(&self) -> bool {
        lock(&self.shared.tx).is_some()
    }

    pub fn start_count(&self) -> usize {
        self.shared.starts.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::SeqCst)
    }

    pub fn fed_samples(&self) -> usize {
        self.shared.fed_samples.load(Ordering::SeqCst)
    }

    /// Sizes of the chunks passed to `feed`, in order.
    pub fn chunk_sizes(&self) -> Vec<usize> {
        lock(&self.shared.chunk_sizes).clone()
    }
}

pub struct ScriptedTranscriberFactory {
    shared: Arc<SttShared>,
    endpoint: Option<VadConfig>,
}

impl ScriptedTranscriberFactory {
    /// Transcripts are injected through the returned handle.
    pub fn new() -> (Self, ScriptedTranscriberHandle) {
        let shared = Arc::new(SttShared::default());
        let handle = ScriptedTranscriberHandle {
            shared: Arc::clone(&shared),
        };
        (
            Self {
                shared,
                endpoint: None,
            },
            handle,
        )
    }

    /// Emits a final transcript per detected utterance: the next queued text,
    /// or `utterance N` when the queue is empty.
    pub fn endpointed(vad: VadConfig) -> Self {
        Self {
            shared: Arc::new(SttShared::default()),
            endpoint: Some(vad),
        }
    }

    pub fn handle(&self) -> ScriptedTranscriberHandle {
        ScriptedTranscriberHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl TranscriberFactory for ScriptedTranscriberFactory {
    fn create(&self, _ctx: &CallContext) -> StageResult<Box<dyn Transcriber>> {
        Ok(Box::new(ScriptedTranscriber {
            shared: Arc::clone(&self.shared),
            detector: self.endpoint.as_ref().map(UtteranceDetector::new),
            pending: Vec::new(),
        }))
    }
}

pub struct ScriptedTranscriber {
    shared: Arc<SttShared>,
    detector: Option<UtteranceDetector>,
    pending: Vec<i16>,
}

impl ScriptedTranscriber {
    fn send(&self, event: TranscriberEvent) {
        if let Some(tx) = lock(&self.shared.tx).as_ref() {
            let _ = tx.try_send(event);
        }
    }

    fn utterance_text(&self) -> String {
        let n = self.shared.utterances.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.shared.queued)
            .pop_front()
            .unwrap_or_else(|| format!("utterance {n}"))
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn start(&mut self, _ctx: &CallContext) -> StageResult<mpsc::Receiver<TranscriberEvent>> {
        let failing = self.shared.failing_starts.load(Ordering::SeqCst);
        if failing > 0 {
            self.shared.failing_starts.store(failing - 1, Ordering::SeqCst);
            return Err(ErrorRecord::transient(Stage::Transcriber, "connect refused"));
        }
        let (tx, rx) = mpsc::channel(64);
        *lock(&self.shared.tx) = Some(tx);
        self.shared.starts.fetch_add(1, Ordering::SeqCst);
        self.shared.finished.store(false, Ordering::SeqCst);
        Ok(rx)
    }

    async fn feed(&mut self, chunk: &[i16]) -> StageResult<()> {
        self.shared.fed_samples.fetch_add(chunk.len(), Ordering::SeqCst);
        lock(&self.shared.chunk_sizes).push(chunk.len());
        let Some(detector) = self.detector.as_mut() else {
            return Ok(());
        };
        self.pending.extend_from_slice(chunk);
        let whole = self.pending.len() - self.pending.len() % FRAME_SAMPLES;
        let frames: Vec<i16> = self.pending.drain(..whole).collect();
        let mut events = Vec::new();
        for frame in frames.chunks(FRAME_SAMPLES) {
            if let Some(event) = detector.process_frame(frame) {
                events.push(event);
            }
        }
        for event in events {
            match event {
                EndpointEvent::SpeechStarted => self.send(TranscriberEvent::Partial(String::new())),
                EndpointEvent::Utterance(_) => {
                    let text = self.utterance_text();
                    self.send(TranscriberEvent::Final(text));
                }
            }
        }
        Ok(())
    }

    async fn finish(&mut self) -> StageResult<()> {
        let tail = self.detector.as_mut().and_then(UtteranceDetector::flush);
        if tail.is_some() {
            let text = self.utterance_text();
            self.send(TranscriberEvent::Final(text));
        }
        lock(&self.shared.tx).take();
        self.shared.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ── Language model ───────────────────────────────────────────

/// One canned reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Fragments(Vec<String>),
    /// `query` itself fails.
    Fail(ErrorKind, String),
    /// Some fragments, then a stream error.
    FailAfter(Vec<String>, ErrorKind, String),
    /// Never produces a fragment.
    Stall,
}

impl ScriptedReply {
    pub fn fragments<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Fragments(parts.into_iter().map(Into::into).collect())
    }
}

/// Replies from a queue; echoes the last user message once the queue is empty
/// (or always, for [`ScriptedLanguageModel::echo`]).
pub struct ScriptedLanguageModel {
    replies: Mutex<VecDeque<ScriptedReply>>,
    queries: Mutex<Vec<(String, Vec<ChatMessage>)>>,
    fragment_delay: Duration,
}

impl ScriptedLanguageModel {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            queries: Mutex::new(Vec::new()),
            fragment_delay: Duration::ZERO,
        }
    }

    pub fn echo() -> Self {
        Self::new([])
    }

    /// Pause between fragments.
    pub fn with_fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = delay;
        self
    }

    pub fn push_reply(&self, reply: ScriptedReply) {
        lock(&self.replies).push_back(reply);
    }

    /// `(system_prompt, history)` of every query so far.
    pub fn queries(&self) -> Vec<(String, Vec<ChatMessage>)> {
        lock(&self.queries).clone()
    }

    fn fragment_stream(&self, parts: Vec<String>, tail: Option<ErrorRecord>) -> FragmentStream {
        let delay = self.fragment_delay;
        Box::pin(async_stream::stream! {
            for part in parts {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(part);
            }
            if let Some(err) = tail {
                yield Err(err);
            }
        })
    }
}

#[async_trait]
impl LanguageModelClient for ScriptedLanguageModel {
    async fn query(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        _options: &QueryOptions,
    ) -> StageResult<FragmentStream> {
        lock(&self.queries).push((system_prompt.to_owned(), history.to_vec()));
        let reply = lock(&self.replies).pop_front();
        match reply {
            Some(ScriptedReply::Fragments(parts)) => Ok(self.fragment_stream(parts, None)),
            Some(ScriptedReply::Fail(kind, msg)) => {
                Err(ErrorRecord::new(kind, Stage::LanguageModel, msg))
            }
            Some(ScriptedReply::FailAfter(parts, kind, msg)) => Ok(self.fragment_stream(
                parts,
                Some(ErrorRecord::new(kind, Stage::LanguageModel, msg)),
            )),
            Some(ScriptedReply::Stall) => Ok(Box::pin(stream::pending::<StageResult<String>>())),
            None => {
                let last = history
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .map_or("nothing", |m| m.content.as_str());
                Ok(self.fragment_stream(vec![format!("You said: {last}.")], None))
            }
        }
    }
}

// ── Synthesizer ──────────────────────────────────────────────

#[derive(Default)]
struct SynthLog {
    requests: Mutex<Vec<(String, String)>>,
    created: Mutex<Vec<String>>,
    closed: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    panicking: Mutex<HashSet<String>>,
    active_streams: AtomicUsize,
    frames_sent: AtomicUsize,
}

/// Produces constant-valued frames: every sample of request N (1-based) is N,
/// so a test can tell which segment a frame came from.
#[derive(Clone)]
pub struct ScriptedSynthesizerFactory {
    log: Arc<SynthLog>,
    frames_per_segment: usize,
    frame_delay: Duration,
}

impl Default for ScriptedSynthesizerFactory {
    fn default() -> Self {
        Self {
            log: Arc::new(SynthLog::default()),
            frames_per_segment: 5,
            frame_delay: Duration::ZERO,
        }
    }
}

impl ScriptedSynthesizerFactory {
    pub fn with_frames(mut self, frames: usize) -> Self {
        self.frames_per_segment = frames;
        self
    }

    /// Pause before each frame, standing in for provider latency.
    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    /// Requests for exactly this text fail as recoverable.
    pub fn fail_on(&self, text: &str) {
        lock(&self.log.failing).insert(text.to_owned());
    }

    /// Requests for exactly this text panic inside the provider.
    pub fn panic_on(&self, text: &str) {
        lock(&self.log.panicking).insert(text.to_owned());
    }

    /// `(voice_id, text)` of every synthesis request.
    pub fn requests(&self) -> Vec<(String, String)> {
        lock(&self.log.requests).clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.requests().into_iter().map(|(_, t)| t).collect()
    }

    pub fn created_voices(&self) -> Vec<String> {
        lock(&self.log.created).clone()
    }

    pub fn closed_voices(&self) -> Vec<String> {
        lock(&self.log.closed).clone()
    }

    /// Streams not yet dropped.
    pub fn active_streams(&self) -> usize {
        self.log.active_streams.load(Ordering::SeqCst)
    }

    /// Frames yielded by all streams.
    pub fn frames_sent(&self) -> usize {
        self.log.frames_sent.load(Ordering::SeqCst)
    }
}

impl SynthesizerFactory for ScriptedSynthesizerFactory {
    fn create(&self, voice: &VoiceProfile) -> StageResult<Arc<dyn Synthesizer>> {
        lock(&self.log.created).push(voice.id.clone());
        Ok(Arc::new(ScriptedSynthesizer {
            voice_id: voice.id.clone(),
            log: Arc::clone(&self.log),
            frames: self.frames_per_segment,
            frame_delay: self.frame_delay,
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct ScriptedSynthesizer {
    voice_id: String,
    log: Arc<SynthLog>,
    frames: usize,
    frame_delay: Duration,
    closed: AtomicBool,
}

struct StreamGuard(Arc<SynthLog>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.active_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Synthesizer for ScriptedSynthesizer {
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
        let ordinal = {
            let mut requests = lock(&self.log.requests);
            requests.push((self.voice_id.clone(), text.to_owned()));
            requests.len()
        };
        if lock(&self.log.panicking).contains(text) {
            panic!("scripted synthesizer panic for {text:?}");
        }
        if lock(&self.log.failing).contains(text) {
            return Err(ErrorRecord::recoverable(
                Stage::Synthesizer,
                format!("scripted failure for {text:?}"),
            ));
        }

        self.log.active_streams.fetch_add(1, Ordering::SeqCst);
        let guard = StreamGuard(Arc::clone(&self.log));
        let value = i16::try_from(ordinal).unwrap_or(i16::MAX);
        let samples = vec![value; self.frames * FRAME_SAMPLES];
        let delay = self.frame_delay;
        Ok(Box::pin(async_stream::stream! {
            let guard = guard;
            for frame in split_frames(&samples) {
                if !delay.is_zero() {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                if cancel.is_cancelled() {
                    break;
                }
                guard.0.frames_sent.fetch_add(1, Ordering::SeqCst);
                yield Ok(frame);
            }
        }))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            lock(&self.log.closed).push(self.voice_id.clone());
        }
    }
}
