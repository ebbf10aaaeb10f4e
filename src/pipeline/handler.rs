//! Per-call voice conversation handler.
//!
//! A supervisor task owns the call's conversation state and is the only
//! place it changes. Around it run:
//!
//! - the transcriber ingest task ([`super::ingest`]),
//! - the playout task ([`super::playout`]),
//! - at most one turn task at a time ([`super::turn`]).
//!
//! All of them hold child tokens of the handler's [`CancellationToken`], and
//! each turn gets its own grandchild token so a barge-in can cancel one turn
//! without touching the rest of the call.

use super::ingest::{IngestConfig, run_ingest};
use super::messages::{
    ConversationState, HandlerMsg, HandlerSummary, HangupReason, LocalHangup, PlayoutItem,
    TurnKind, TurnOutcome, TurnReport,
};
use super::playout::{NO_TURN, run_playout};
use super::turn::{TurnContext, TurnSource, run_turn};
use crate::audio::{FRAME_SAMPLES, RecordingBuffer, decode_ulaw, write_recording};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, ErrorRecord, Stage, StageResult};
use crate::providers::{
    CallContext, ChatMessage, ProviderSet, QueryOptions, Synthesizer, TranscriberEvent,
};
use crate::resolver::{AssistantProfile, HandlerMode};
use crate::rtp::MediaSink;
use crate::runtime::{EventSink, RuntimeEvent};
use crate::store::{CallRecordStore, TurnRecord, VoicemailRecord};
use crate::vad::BargeInDetector;
use crate::voices::{SpeakerSelector, VoiceProfile, VoiceRegistry};
use chrono::Utc;
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the handler needs to know about its call.
#[derive(Debug, Clone)]
pub struct HandlerSetup {
    pub call_id: String,
    pub caller: String,
    pub called: String,
    pub mode: HandlerMode,
    pub assistant: AssistantProfile,
    pub voicemail_prompt: Option<String>,
    /// Record the call. Message mode records regardless.
    pub record: bool,
}

/// Process-wide collaborators shared by every handler.
#[derive(Clone)]
pub struct HandlerDeps {
    pub config: Arc<BridgeConfig>,
    pub providers: ProviderSet,
    pub voices: Arc<VoiceRegistry>,
    pub store: Arc<dyn CallRecordStore>,
    pub events: EventSink,
    /// Where local hangup requests go. Without it the handler stops itself.
    pub hangups: Option<mpsc::UnboundedSender<LocalHangup>>,
}

/// Run a task body, turning a panic into a recoverable error.
pub(crate) async fn guarded<F: Future>(stage: Stage, fut: F) -> StageResult<F::Output> {
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|panic| {
            ErrorRecord::recoverable(stage, format!("task panicked: {}", panic_message(&*panic)))
        })
}

/// Ingest and playout run for the whole call; losing either ends it.
fn task_lost(error: ErrorRecord) -> ErrorRecord {
    ErrorRecord::fatal(error.stage, error.message)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

pub struct VoiceConversationHandler;

impl VoiceConversationHandler {
    /// Start the handler for an active call.
    ///
    /// Inbound µ-law payloads go to [`HandlerHandle::inbound_sender`];
    /// outbound frames leave through `sink`.
    ///
    /// # Errors
    ///
    /// Fails fatally when no synthesis voice can be resolved or created.
    pub fn spawn(
        setup: HandlerSetup,
        deps: HandlerDeps,
        sink: Box<dyn MediaSink>,
        parent: &CancellationToken,
    ) -> StageResult<HandlerHandle> {
        let voice = initial_voice(&deps.voices, &setup.assistant)?;
        let synth = deps.providers.synthesizers.create(&voice).map_err(|e| {
            ErrorRecord::fatal(Stage::Synthesizer, format!("voice {}: {}", voice.id, e.message))
        })?;

        let cfg = Arc::clone(&deps.config);
        let cancel = parent.child_token();
        let (inbound_tx, inbound_rx) = mpsc::channel(cfg.media.inbound_queue_frames.max(1));
        let (ingest_tx, ingest_rx) = mpsc::channel(cfg.handler.ingest_queue_frames.max(1));
        let (playout_tx, playout_rx) = mpsc::channel(cfg.handler.playout_queue_frames.max(1));
        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let initial = match setup.mode {
            HandlerMode::Conversation => ConversationState::Listening,
            HandlerMode::Message => ConversationState::Recording,
        };
        let (state_tx, state_rx) = watch::channel(ConversationState::Idle);

        let recording_on = setup.record || setup.mode == HandlerMode::Message;
        let recording = Arc::new(Mutex::new(RecordingBuffer::new(recording_on)));
        let active_turn = Arc::new(AtomicU64::new(NO_TURN));

        let ctx = CallContext {
            call_id: setup.call_id.clone(),
            language: setup.assistant.language.clone(),
        };
        let ingest = {
            let notify = msg_tx.clone();
            let factory = Arc::clone(&deps.providers.transcribers);
            let config = IngestConfig {
                chunk_ms: cfg.stt.chunk_ms,
                max_backlog: cfg.handler.ingest_queue_frames * FRAME_SAMPLES,
                // Must finish inside the supervisor's shutdown wait.
                finish_timeout: Duration::from_millis(cfg.handler.shutdown_timeout_ms * 3 / 4),
            };
            tokio::spawn(async move {
                let body = run_ingest(factory, ctx, ingest_rx, notify.clone(), config);
                if let Err(e) = guarded(Stage::Transcriber, body).await {
                    let _ = notify.send(HandlerMsg::StageFailed(task_lost(e)));
                }
            })
        };
        let playout = {
            let notify = msg_tx.clone();
            let body = run_playout(
                playout_rx,
                sink,
                Arc::clone(&active_turn),
                Arc::clone(&recording),
                msg_tx.clone(),
                cancel.child_token(),
            );
            tokio::spawn(async move {
                if let Err(e) = guarded(Stage::Media, body).await {
                    let _ = notify.send(HandlerMsg::StageFailed(task_lost(e)));
                }
            })
        };

        let max_duration = cfg.handler.max_call_duration_secs;
        let supervisor = Supervisor {
            selector: SpeakerSelector::new(Arc::clone(&deps.voices), voice.id.clone()),
            barge_in: BargeInDetector::new(&cfg.vad),
            synth,
            cfg,
            setup,
            deps,
            cancel: cancel.clone(),
            state_tx,
            state: ConversationState::Idle,
            inbound_rx,
            msg_rx,
            msg_tx,
            ingest_tx: Some(ingest_tx),
            playout_tx,
            active_turn,
            recording,
            ingest: Some(ingest),
            playout: Some(playout),
            turn: None,
            next_turn_id: 1,
            pending: None,
            playout_finished: None,
            held_transcript: None,
            history: Vec::new(),
            consecutive_failures: 0,
            turn_index: 0,
            listen_deadline: None,
            max_deadline: (max_duration > 0)
                .then(|| Instant::now() + Duration::from_secs(max_duration)),
            hangup_requested: false,
            voicemail_parts: Vec::new(),
            after_playout: initial,
            summary: HandlerSummary::default(),
        };
        let call_id = supervisor.setup.call_id.clone();
        let task = tokio::spawn(supervisor.run());

        Ok(HandlerHandle {
            call_id,
            inbound: inbound_tx,
            state: state_rx,
            cancel,
            stopped: AtomicBool::new(false),
            task: tokio::sync::Mutex::new(Some(task)),
        })
    }
}

fn initial_voice(voices: &VoiceRegistry, assistant: &AssistantProfile) -> StageResult<VoiceProfile> {
    assistant
        .voice_id
        .as_deref()
        .and_then(|id| voices.get(id))
        .or_else(|| voices.default_voice_for(&assistant.language))
        .cloned()
        .ok_or_else(|| ErrorRecord::fatal(Stage::Synthesizer, "no synthesis voice configured"))
}

/// Control surface of a running handler.
pub struct HandlerHandle {
    call_id: String,
    inbound: mpsc::Sender<Vec<u8>>,
    state: watch::Receiver<ConversationState>,
    cancel: CancellationToken,
    stopped: AtomicBool,
    task: tokio::sync::Mutex<Option<JoinHandle<HandlerSummary>>>,
}

impl std::fmt::Debug for HandlerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerHandle")
            .field("call_id", &self.call_id)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl HandlerHandle {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Queue for inbound µ-law payloads, one 20 ms frame per item.
    pub fn inbound_sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.inbound.clone()
    }

    pub fn state(&self) -> ConversationState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConversationState> {
        self.state.clone()
    }

    /// Wait until the handler reaches `target`. Returns false on timeout.
    pub async fn wait_for_state(&self, target: ConversationState, limit: Duration) -> bool {
        let mut rx = self.state.clone();
        tokio::time::timeout(limit, rx.wait_for(|s| *s == target))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop the handler and release its resources.
    ///
    /// Idempotent: only the first call does the work and returns the
    /// summary; later calls return `None` immediately.
    pub async fn shutdown(&self) -> Option<HandlerSummary> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.cancel.cancel();
        let task = self.task.lock().await.take()?;
        match task.await {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(call_id = %self.call_id, "handler task failed: {e}");
                None
            }
        }
    }
}

struct RunningTurn {
    id: u64,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

struct Supervisor {
    cfg: Arc<BridgeConfig>,
    setup: HandlerSetup,
    deps: HandlerDeps,
    cancel: CancellationToken,
    state_tx: watch::Sender<ConversationState>,
    state: ConversationState,

    inbound_rx: mpsc::Receiver<Vec<u8>>,
    msg_rx: mpsc::UnboundedReceiver<HandlerMsg>,
    msg_tx: mpsc::UnboundedSender<HandlerMsg>,
    ingest_tx: Option<mpsc::Sender<Vec<i16>>>,
    playout_tx: mpsc::Sender<PlayoutItem>,
    active_turn: Arc<AtomicU64>,
    recording: Arc<Mutex<RecordingBuffer>>,
    ingest: Option<JoinHandle<()>>,
    playout: Option<JoinHandle<()>>,

    barge_in: BargeInDetector,
    selector: SpeakerSelector,
    synth: Arc<dyn Synthesizer>,

    turn: Option<RunningTurn>,
    next_turn_id: u64,
    /// Report of the current turn, held until its audio has played out.
    pending: Option<TurnReport>,
    /// Playout finished before the turn task reported.
    playout_finished: Option<u64>,
    /// Final transcript that arrived while a turn was in flight.
    held_transcript: Option<String>,
    history: Vec<ChatMessage>,
    consecutive_failures: u32,
    turn_index: u64,
    listen_deadline: Option<Instant>,
    max_deadline: Option<Instant>,
    hangup_requested: bool,
    voicemail_parts: Vec<String>,
    /// State entered when a canned turn finishes playing.
    after_playout: ConversationState,
    summary: HandlerSummary,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

impl Supervisor {
    async fn run(mut self) -> HandlerSummary {
        info!(
            call_id = %self.setup.call_id,
            mode = ?self.setup.mode,
            assistant = %self.setup.assistant.id,
            voice = %self.synth.voice_id(),
            "conversation handler started"
        );
        self.begin().await;

        let mut inbound_open = true;
        loop {
            let listen = self.listen_deadline;
            let max = if self.hangup_requested { None } else { self.max_deadline };
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                Some(msg) = self.msg_rx.recv() => self.on_message(msg).await,
                payload = self.inbound_rx.recv(), if inbound_open => match payload {
                    Some(payload) => self.on_inbound(&payload).await,
                    None => inbound_open = false,
                },
                () = sleep_until_opt(listen) => self.on_listen_timeout(),
                () = sleep_until_opt(max) => self.request_hangup(HangupReason::MaxDuration),
            }
        }
        self.teardown().await
    }

    async fn begin(&mut self) {
        match self.setup.mode {
            HandlerMode::Conversation => {
                self.set_state(ConversationState::Listening);
                if let Some(greeting) = self.setup.assistant.greeting.clone() {
                    self.start_turn(TurnKind::Canned, greeting).await;
                }
            }
            HandlerMode::Message => {
                self.after_playout = ConversationState::Recording;
                match self.setup.voicemail_prompt.clone() {
                    Some(prompt) => self.start_turn(TurnKind::Canned, prompt).await,
                    None => self.set_state(ConversationState::Recording),
                }
            }
        }
    }

    fn set_state(&mut self, next: ConversationState) {
        if next == ConversationState::Listening {
            self.arm_listen_deadline();
        } else {
            self.listen_deadline = None;
        }
        if self.state == next {
            return;
        }
        debug!(call_id = %self.setup.call_id, from = %self.state, to = %next, "conversation state");
        self.state = next;
        let _ = self.state_tx.send(next);
        self.deps.events.emit(RuntimeEvent::Conversation {
            call_id: self.setup.call_id.clone(),
            state: next,
        });
    }

    fn arm_listen_deadline(&mut self) {
        let secs = self.cfg.stt.final_timeout_secs;
        self.listen_deadline = (secs > 0).then(|| Instant::now() + Duration::from_secs(secs));
    }

    fn current_turn(&self) -> u64 {
        self.turn.as_ref().map_or(NO_TURN, |t| t.id)
    }

    // ── inbound audio ────────────────────────────────────────

    async fn on_inbound(&mut self, payload: &[u8]) {
        let pcm = decode_ulaw(payload);
        self.recording
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_caller(&pcm);

        let playing = self.state == ConversationState::Speaking;
        let barged = self.barge_in.check(&pcm, playing);

        // Caller audio always reaches the transcriber, including overlap.
        if let Some(tx) = &self.ingest_tx {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(pcm) {
                debug!(call_id = %self.setup.call_id, "ingest queue full, frame dropped");
            }
        }

        if barged {
            self.on_barge_in().await;
        }
    }

    async fn on_barge_in(&mut self) {
        let turn = self.active_turn.swap(NO_TURN, Ordering::SeqCst);
        if turn == NO_TURN {
            return;
        }
        if let Some(running) = &self.turn {
            running.cancel.cancel();
        }
        self.summary.barge_ins += 1;
        info!(call_id = %self.setup.call_id, turn, "barge-in");
        self.deps.events.emit(RuntimeEvent::BargeIn {
            call_id: self.setup.call_id.clone(),
            turn,
        });
        if let Some(report) = self.pending.take() {
            self.finalize(report, true).await;
        }
        let resume = self.after_playout;
        self.set_state(resume);

        if let Some(text) = self.held_transcript.take() {
            self.start_turn(TurnKind::Reply, text).await;
        }
    }

    // ── messages from owned tasks ────────────────────────────

    async fn on_message(&mut self, msg: HandlerMsg) {
        match msg {
            HandlerMsg::Transcript(event) => self.on_transcript(event).await,
            HandlerMsg::TurnSpeaking(id) => {
                if id == self.current_turn()
                    && self.active_turn.load(Ordering::SeqCst) == id
                    && self.state == ConversationState::Thinking
                {
                    self.set_state(ConversationState::Speaking);
                }
            }
            HandlerMsg::TurnDone(report) => self.on_turn_done(report).await,
            HandlerMsg::PlayoutDone(id) => {
                if id != self.current_turn() {
                    return;
                }
                match self.pending.take() {
                    Some(report) => self.finish_playout(report).await,
                    None => self.playout_finished = Some(id),
                }
            }
            HandlerMsg::StageFailed(e) => self.on_stage_failed(e).await,
        }
    }

    async fn on_transcript(&mut self, event: TranscriberEvent) {
        let (text, is_final) = match event {
            TranscriberEvent::Partial(text) => (text, false),
            TranscriberEvent::Final(text) => (text, true),
            TranscriberEvent::Error(e) => return self.on_stage_failed(e).await,
        };
        if !text.is_empty() {
            self.deps.events.emit(RuntimeEvent::Transcript {
                call_id: self.setup.call_id.clone(),
                text: text.clone(),
                is_final,
            });
        }
        if !is_final {
            if self.state == ConversationState::Listening {
                self.arm_listen_deadline();
            }
            return;
        }
        let text = text.trim().to_owned();
        if text.is_empty() {
            return;
        }

        match self.state {
            ConversationState::Recording => self.voicemail_parts.push(text),
            ConversationState::Listening => self.start_turn(TurnKind::Reply, text).await,
            ConversationState::Thinking | ConversationState::Speaking => {
                debug!(call_id = %self.setup.call_id, "holding transcript during playback");
                self.held_transcript = Some(text);
            }
            ConversationState::Idle => {}
        }
    }

    async fn on_turn_done(&mut self, mut report: TurnReport) {
        let current = report.turn_id == self.current_turn();
        match std::mem::replace(&mut report.outcome, TurnOutcome::Completed) {
            TurnOutcome::Failed(e) => {
                if current {
                    self.active_turn.store(NO_TURN, Ordering::SeqCst);
                    self.turn = None;
                    self.held_transcript = None;
                    let resume = self.after_playout;
                    self.set_state(resume);
                }
                self.on_stage_failed(e).await;
            }
            TurnOutcome::Interrupted => {
                if current {
                    self.turn = None;
                }
                self.finalize(report, true).await;
            }
            TurnOutcome::Completed if !current => self.finalize(report, false).await,
            TurnOutcome::Completed => {
                if self.playout_finished.take() == Some(report.turn_id) {
                    self.finish_playout(report).await;
                } else {
                    self.pending = Some(report);
                }
            }
        }
    }

    /// The current turn's audio has fully played.
    async fn finish_playout(&mut self, report: TurnReport) {
        self.active_turn.store(NO_TURN, Ordering::SeqCst);
        self.turn = None;
        if let Some(text) = self.held_transcript.take() {
            debug!(call_id = %self.setup.call_id, %text, "discarding transcript heard during playback");
        }
        self.finalize(report, false).await;
        let resume = self.after_playout;
        self.set_state(resume);
    }

    /// Book-keeping for a turn that produced speech.
    async fn finalize(&mut self, report: TurnReport, interrupted: bool) {
        if report.kind != TurnKind::Reply {
            return;
        }
        let Some(user_text) = report.user_text else {
            return;
        };
        if !interrupted {
            self.consecutive_failures = 0;
        }
        self.history.push(ChatMessage::user(user_text.clone()));
        if !report.assistant_text.trim().is_empty() {
            self.history
                .push(ChatMessage::assistant(report.assistant_text.trim().to_owned()));
        }
        let max = self.cfg.llm.max_history_messages.max(2);
        if self.history.len() > max {
            let excess = self.history.len() - max;
            self.history.drain(..excess);
        }

        self.turn_index += 1;
        self.summary.turns += 1;
        let record = TurnRecord {
            call_id: self.setup.call_id.clone(),
            turn_index: self.turn_index,
            user_text,
            assistant_text: report.assistant_text.trim().to_owned(),
            interrupted,
            created_at: Utc::now(),
        };
        if let Err(e) = self.deps.store.record_turn(&record).await {
            warn!(call_id = %self.setup.call_id, "failed to record turn: {e}");
        }
    }

    async fn on_stage_failed(&mut self, error: ErrorRecord) {
        warn!(call_id = %self.setup.call_id, "{error}");
        self.deps
            .events
            .emit(RuntimeEvent::stage_error(&self.setup.call_id, &error));
        if error.is_fatal() {
            self.request_hangup(HangupReason::Fatal(error.message));
            return;
        }
        if self.setup.mode == HandlerMode::Message {
            return;
        }
        self.consecutive_failures += 1;
        let limit = self.cfg.handler.surface_after_failures;
        if limit > 0 && self.consecutive_failures >= limit && self.turn.is_none() {
            self.consecutive_failures = 0;
            let apology = self.cfg.handler.apology_text.clone();
            self.start_turn(TurnKind::Canned, apology).await;
        }
    }

    fn on_listen_timeout(&mut self) {
        let secs = self.cfg.stt.final_timeout_secs;
        debug!(call_id = %self.setup.call_id, "no final transcript within {secs}s");
        let error = ErrorRecord::recoverable(
            Stage::Transcriber,
            format!("no final transcript within {secs}s"),
        );
        self.deps
            .events
            .emit(RuntimeEvent::stage_error(&self.setup.call_id, &error));
        self.arm_listen_deadline();
    }

    fn request_hangup(&mut self, reason: HangupReason) {
        if self.hangup_requested {
            return;
        }
        self.hangup_requested = true;
        info!(call_id = %self.setup.call_id, %reason, "requesting hangup");
        self.deps.events.emit(RuntimeEvent::HangupRequested {
            call_id: self.setup.call_id.clone(),
            reason: reason.to_string(),
        });
        let request = LocalHangup {
            call_id: self.setup.call_id.clone(),
            reason,
        };
        let delivered = self
            .deps
            .hangups
            .as_ref()
            .is_some_and(|tx| tx.send(request).is_ok());
        if !delivered {
            self.cancel.cancel();
        }
    }

    // ── turns ────────────────────────────────────────────────

    async fn start_turn(&mut self, kind: TurnKind, text: String) {
        self.retire_turn().await;
        if kind == TurnKind::Reply {
            self.maybe_switch_voice(&text).await;
        }

        let turn_id = self.next_turn_id;
        self.next_turn_id += 1;
        let cancel = self.cancel.child_token();
        self.pending = None;
        self.playout_finished = None;
        self.held_transcript = None;
        self.barge_in.reset();

        let (user_text, source) = match kind {
            TurnKind::Canned => (None, TurnSource::Canned(text)),
            TurnKind::Reply => {
                let mut history = self.history.clone();
                history.push(ChatMessage::user(text.clone()));
                let source = TurnSource::Reply {
                    llm: Arc::clone(&self.deps.providers.language_model),
                    system_prompt: self.setup.assistant.system_prompt.clone(),
                    history,
                    options: QueryOptions {
                        temperature: self.setup.assistant.temperature,
                        max_tokens: self.setup.assistant.max_tokens,
                    },
                    first_token_timeout: Duration::from_secs(self.cfg.llm.first_token_timeout_secs),
                };
                (Some(text), source)
            }
        };
        let ctx = TurnContext {
            call_id: self.setup.call_id.clone(),
            turn_id,
            user_text: user_text.clone(),
            source,
            synth: Arc::clone(&self.synth),
            segmenter: self.cfg.segmenter.clone(),
            cancel: cancel.clone(),
            playout: self.playout_tx.clone(),
            notify: self.msg_tx.clone(),
            events: self.deps.events.clone(),
        };
        let notify = self.msg_tx.clone();
        let join = tokio::spawn(async move {
            let report = match guarded(Stage::Handler, run_turn(ctx)).await {
                Ok(report) => report,
                Err(e) => TurnReport {
                    turn_id,
                    kind,
                    user_text,
                    assistant_text: String::new(),
                    frames: 0,
                    outcome: TurnOutcome::Failed(e),
                },
            };
            let _ = notify.send(HandlerMsg::TurnDone(report));
        });

        self.active_turn.store(turn_id, Ordering::SeqCst);
        self.turn = Some(RunningTurn {
            id: turn_id,
            cancel,
            join,
        });
        self.set_state(ConversationState::Thinking);
    }

    /// Cancel the previous turn, if any, and wait briefly for it to stop.
    async fn retire_turn(&mut self) {
        let Some(mut turn) = self.turn.take() else {
            return;
        };
        turn.cancel.cancel();
        let limit = Duration::from_millis(self.cfg.tts.teardown_timeout_ms);
        if tokio::time::timeout(limit, &mut turn.join).await.is_err() {
            warn!(call_id = %self.setup.call_id, turn = turn.id, "turn did not stop in time, aborting");
            turn.join.abort();
        }
    }

    async fn maybe_switch_voice(&mut self, transcript: &str) {
        let previous = self.selector.active_id().to_owned();
        let Some(profile) = self.selector.select(transcript) else {
            return;
        };
        let fresh = match self.deps.providers.synthesizers.create(&profile) {
            Ok(s) => s,
            Err(e) => {
                warn!(call_id = %self.setup.call_id, voice = %profile.id, "voice switch failed: {e}");
                self.selector = SpeakerSelector::new(Arc::clone(&self.deps.voices), previous);
                return;
            }
        };
        let old = std::mem::replace(&mut self.synth, fresh);
        let limit = Duration::from_millis(self.cfg.tts.teardown_timeout_ms);
        if tokio::time::timeout(limit, old.close()).await.is_err() {
            warn!(call_id = %self.setup.call_id, voice = %previous, "old voice did not close in time");
        }
        info!(call_id = %self.setup.call_id, from = %previous, to = %profile.id, "voice switched");
        self.deps.events.emit(RuntimeEvent::VoiceSwitched {
            call_id: self.setup.call_id.clone(),
            from: previous,
            to: profile.id,
        });
    }

    // ── teardown ─────────────────────────────────────────────

    async fn teardown(mut self) -> HandlerSummary {
        let call_id = self.setup.call_id.clone();
        let limit = Duration::from_millis(self.cfg.handler.shutdown_timeout_ms);
        self.active_turn.store(NO_TURN, Ordering::SeqCst);
        self.set_state(ConversationState::Idle);

        if let Some(mut turn) = self.turn.take() {
            turn.cancel.cancel();
            if tokio::time::timeout(limit, &mut turn.join).await.is_err() {
                warn!(%call_id, "turn task did not stop in time");
                turn.join.abort();
            }
        }
        // Closing the ingest queue lets the transcriber flush its tail.
        self.ingest_tx = None;
        for (name, task) in [("ingest", self.ingest.take()), ("playout", self.playout.take())] {
            if let Some(mut task) = task {
                if tokio::time::timeout(limit, &mut task).await.is_err() {
                    warn!(%call_id, task = name, "task did not stop in time");
                    task.abort();
                }
            }
        }
        while let Ok(msg) = self.msg_rx.try_recv() {
            if let HandlerMsg::Transcript(TranscriberEvent::Final(text)) = msg {
                let text = text.trim();
                if self.setup.mode == HandlerMode::Message && !text.is_empty() {
                    self.voicemail_parts.push(text.to_owned());
                }
            }
        }

        let synth = Arc::clone(&self.synth);
        if tokio::time::timeout(limit, synth.close()).await.is_err() {
            warn!(%call_id, "synthesizer did not close in time");
        }

        let (mixed, duration) = {
            let mut rec = self.recording.lock().unwrap_or_else(|e| e.into_inner());
            let duration = rec.duration();
            (rec.take_mixed(), duration)
        };
        let recording = match mixed {
            Some(mixed) => self.flush_recording(mixed).await,
            None => None,
        };
        if self.setup.mode == HandlerMode::Message {
            self.summary.voicemail_id = self.save_voicemail(recording.clone(), duration).await;
        }
        self.summary.recording = recording;
        self.summary.call_id = call_id.clone();
        info!(
            %call_id,
            turns = self.summary.turns,
            barge_ins = self.summary.barge_ins,
            "conversation handler stopped"
        );
        self.summary
    }

    async fn flush_recording(&self, mixed: Vec<i16>) -> Option<PathBuf> {
        let dir = self.cfg.recording.dir.clone();
        let call_id = self.setup.call_id.clone();
        let written = tokio::task::spawn_blocking(move || -> Result<PathBuf, BridgeError> {
            std::fs::create_dir_all(&dir).map_err(BridgeError::from)?;
            write_recording(&dir, &call_id, &mixed)
        })
        .await;
        let path = match written {
            Ok(Ok(path)) => path,
            Ok(Err(e)) => {
                warn!(call_id = %self.setup.call_id, "recording not written: {e}");
                return None;
            }
            Err(e) => {
                warn!(call_id = %self.setup.call_id, "recording task failed: {e}");
                return None;
            }
        };
        if let Err(e) = self.deps.store.attach_recording(&self.setup.call_id, &path).await {
            warn!(call_id = %self.setup.call_id, "failed to attach recording: {e}");
        }
        Some(path)
    }

    async fn save_voicemail(&self, recording: Option<PathBuf>, duration: Duration) -> Option<String> {
        let record = VoicemailRecord {
            id: uuid::Uuid::new_v4().to_string(),
            call_id: self.setup.call_id.clone(),
            caller: self.setup.caller.clone(),
            called: self.setup.called.clone(),
            recording_path: recording,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            transcript: self.voicemail_parts.join(" "),
            created_at: Utc::now(),
        };
        match self.deps.store.create_voicemail(&record).await {
            Ok(()) => Some(record.id),
            Err(e) => {
                warn!(call_id = %self.setup.call_id, "failed to save voicemail: {e}");
                None
            }
        }
    }
}
