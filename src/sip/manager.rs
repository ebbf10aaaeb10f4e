//! Inbound call signaling: the auto-answer state machine.
//!
//! Every call lives in one map keyed by Call-ID. The map lock is never held
//! across an await; whoever removes an entry owns its teardown, which makes
//! teardown happen exactly once no matter how BYE, CANCEL, ACK timeout and
//! local hangup race.

use super::message::{
    Headers, Method, SipMessage, SipRequest, SipResponse, addr_spec, random_token, tag_param,
};
use super::sdp::{NegotiatedMedia, build_answer, negotiate, parse_offer};
use super::session::{CallSession, CallState, Direction};
use super::transport::SipSender;
use crate::config::BridgeConfig;
use crate::error::StageResult;
use crate::pipeline::{HandlerHandle, LocalHangup};
use crate::resolver::{AssistantResolver, SchemeResolver, match_scheme};
use crate::rtp::MediaBridge;
use crate::runtime::{EventSink, RuntimeEvent};
use crate::store::{CallMetadata, CallRecordStore, StatusTimestamps};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Final responses kept for replaying to retransmitted INVITEs.
const RECENT_FINALS: usize = 64;

const ALLOW: &str = "INVITE, ACK, BYE, CANCEL, OPTIONS";

/// What happened to an inbound message.
#[derive(Debug)]
pub enum Disposition {
    Handled,
    /// An INVITE no scheme claims; normal call handling should take it.
    PassThrough(SipRequest),
    /// Not for us: stray responses, ACKs for unknown calls.
    Ignored,
}

/// Starts the media side of a call once it is active.
pub trait CallStarter: Send + Sync {
    /// # Errors
    ///
    /// A fatal record ends the call.
    fn start(
        &self,
        session: &CallSession,
        media: &NegotiatedMedia,
        hangups: mpsc::UnboundedSender<LocalHangup>,
    ) -> StageResult<Arc<HandlerHandle>>;
}

#[derive(Clone)]
pub struct SignalingDeps {
    pub config: Arc<BridgeConfig>,
    pub schemes: Arc<dyn SchemeResolver>,
    pub assistants: Arc<dyn AssistantResolver>,
    pub store: Arc<dyn CallRecordStore>,
    pub media: Arc<MediaBridge>,
    pub sender: Arc<dyn SipSender>,
    pub starter: Arc<dyn CallStarter>,
    pub events: EventSink,
    /// Port advertised in Contact headers.
    pub sip_port: u16,
}

/// Dialog state needed to send in-dialog requests.
#[derive(Debug, Clone)]
pub struct DialogInfo {
    pub call_id: String,
    pub local_tag: String,
    /// From of the INVITE; the To of our requests.
    pub remote_party: String,
    /// To of our responses, with our tag; the From of our requests.
    pub local_party: String,
    /// Request-URI for in-dialog requests: the caller's Contact.
    pub remote_target: String,
    /// Where in-dialog requests are sent.
    pub remote_addr: SocketAddr,
    pub local_cseq: u32,
}

impl DialogInfo {
    pub fn from_invite(invite: &SipRequest, src: SocketAddr, local_tag: &str) -> Self {
        let to = invite.headers.get("To").unwrap_or_default();
        let local_party = if tag_param(to).is_some() {
            to.to_owned()
        } else {
            format!("{to};tag={local_tag}")
        };
        let remote_target = invite
            .headers
            .get("Contact")
            .or_else(|| invite.headers.get("From"))
            .map(|v| addr_spec(v).to_owned())
            .unwrap_or_else(|| format!("sip:{src}"));
        Self {
            call_id: invite.call_id().unwrap_or_default().to_owned(),
            local_tag: local_tag.to_owned(),
            remote_party: invite.headers.get("From").unwrap_or_default().to_owned(),
            local_party,
            remote_target,
            remote_addr: src,
            local_cseq: 0,
        }
    }

    /// Next BYE for this dialog.
    pub fn bye(&mut self, via_host: &str, user_agent: &str) -> SipRequest {
        self.local_cseq += 1;
        let mut request = SipRequest {
            method: Method::Bye,
            uri: self.remote_target.clone(),
            headers: Headers::new(),
            body: String::new(),
        };
        let h = &mut request.headers;
        h.push("Via", format!("SIP/2.0/UDP {via_host};branch=z9hG4bK{}", random_token()));
        h.push("Max-Forwards", "70");
        h.push("From", self.local_party.clone());
        h.push("To", self.remote_party.clone());
        h.push("Call-ID", self.call_id.clone());
        h.push("CSeq", format!("{} BYE", self.local_cseq));
        h.push("User-Agent", user_agent);
        request
    }
}

struct CallEntry {
    session: CallSession,
    dialog: DialogInfo,
    invite: SipRequest,
    media: NegotiatedMedia,
    answer_sdp: String,
    /// Replayed to retransmitted INVITEs.
    last_response: SipResponse,
    /// 200 OK has been sent.
    answered: bool,
    /// Cancelled on teardown; stops the answer task.
    token: CancellationToken,
    /// Cancelled when the ACK arrives.
    acked: CancellationToken,
    handler: Option<Arc<HandlerHandle>>,
}

/// Owns every inbound call.
pub struct SessionManager {
    deps: SignalingDeps,
    calls: Mutex<HashMap<String, CallEntry>>,
    finals: Mutex<VecDeque<(String, SipResponse)>>,
    hangup_tx: mpsc::UnboundedSender<LocalHangup>,
    hangup_rx: Mutex<Option<mpsc::UnboundedReceiver<LocalHangup>>>,
    root: CancellationToken,
    /// Handler shutdowns still flushing recordings and records.
    teardowns: TaskTracker,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl SessionManager {
    pub fn new(deps: SignalingDeps, root: CancellationToken) -> Arc<Self> {
        let (hangup_tx, hangup_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            deps,
            calls: Mutex::new(HashMap::new()),
            finals: Mutex::new(VecDeque::new()),
            hangup_tx,
            hangup_rx: Mutex::new(Some(hangup_rx)),
            root,
            teardowns: TaskTracker::new(),
        })
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn call_state(&self, call_id: &str) -> Option<CallState> {
        lock(&self.calls).get(call_id).map(|e| e.session.state())
    }

    pub fn call_ids(&self) -> Vec<String> {
        lock(&self.calls).keys().cloned().collect()
    }

    /// Handler of an active call.
    pub fn handler(&self, call_id: &str) -> Option<Arc<HandlerHandle>> {
        lock(&self.calls).get(call_id).and_then(|e| e.handler.clone())
    }

    fn config(&self) -> &BridgeConfig {
        &self.deps.config
    }

    fn contact(&self, user: &str) -> String {
        format!(
            "<sip:{user}@{}:{}>",
            self.config().signaling.public_host,
            self.deps.sip_port
        )
    }

    /// Dispatch one parsed message from `src`.
    pub async fn handle_message(self: &Arc<Self>, message: SipMessage, src: SocketAddr) -> Disposition {
        let request = match message {
            SipMessage::Request(r) => r,
            SipMessage::Response(r) => {
                debug!(status = r.status, call_id = ?r.headers.get("Call-ID"), "SIP response");
                return Disposition::Ignored;
            }
        };
        if request.call_id().is_none() {
            self.respond(&SipResponse::for_request(&request, 400, "Missing Call-ID", None), src)
                .await;
            return Disposition::Handled;
        }
        match request.method {
            Method::Invite => self.on_invite(request, src).await,
            Method::Ack => self.on_ack(&request).await,
            Method::Bye => self.on_bye(&request, src).await,
            Method::Cancel => self.on_cancel(&request, src).await,
            Method::Options => {
                let response = SipResponse::for_request(&request, 200, "OK", None)
                    .with_header("Allow", ALLOW)
                    .with_header("Server", self.config().signaling.user_agent.clone());
                self.respond(&response, src).await;
                Disposition::Handled
            }
            Method::Other(_) => {
                let response = SipResponse::for_request(&request, 501, "Not Implemented", None)
                    .with_header("Allow", ALLOW);
                self.respond(&response, src).await;
                Disposition::Handled
            }
        }
    }

    async fn respond(&self, response: &SipResponse, to: SocketAddr) {
        if let Err(e) = self.deps.sender.send(&response.to_bytes(), to).await {
            warn!(%to, status = response.status, "failed to send response: {e}");
        }
    }

    async fn send_request(&self, request: &SipRequest, to: SocketAddr) {
        if let Err(e) = self.deps.sender.send(&request.to_bytes(), to).await {
            warn!(%to, method = %request.method, "failed to send request: {e}");
        }
    }

    // ── INVITE ───────────────────────────────────────────────

    async fn on_invite(self: &Arc<Self>, invite: SipRequest, src: SocketAddr) -> Disposition {
        let call_id = invite.call_id().unwrap_or_default().to_owned();

        let replay = {
            let calls = lock(&self.calls);
            calls.get(&call_id).map(|entry| {
                let to_tagged = invite.headers.get("To").and_then(tag_param).is_some();
                if to_tagged && entry.answered {
                    // Session refresh: answer with the same description.
                    let to_tag = entry.dialog.local_tag.clone();
                    SipResponse::for_request(&invite, 200, "OK", Some(&to_tag))
                        .with_header("Contact", self.contact(&entry.session.called))
                        .with_body("application/sdp", entry.answer_sdp.clone())
                } else {
                    entry.last_response.clone()
                }
            })
        };
        let replay = replay.or_else(|| {
            lock(&self.finals)
                .iter()
                .find(|(id, _)| *id == call_id)
                .map(|(_, r)| r.clone())
        });
        if let Some(response) = replay {
            debug!(%call_id, status = response.status, "INVITE retransmission, replaying");
            self.respond(&response, src).await;
            return Disposition::Handled;
        }

        let called = invite.called_user().unwrap_or_default().to_owned();
        let caller = invite.caller_user().unwrap_or_default().to_owned();
        let Some(scheme) = match_scheme(&*self.deps.schemes, &called) else {
            debug!(%call_id, %called, "no auto-answer scheme, passing through");
            return Disposition::PassThrough(invite);
        };
        self.respond(&SipResponse::for_request(&invite, 100, "Trying", None), src)
            .await;

        let metadata = CallMetadata {
            call_id: call_id.clone(),
            direction: Direction::Inbound,
            caller: caller.clone(),
            called: called.clone(),
            scheme_id: scheme.id.clone(),
            assistant_id: scheme.assistant_id.clone(),
            started_at: Utc::now(),
        };
        let local_tag = random_token();

        let assistant = scheme
            .assistant_id
            .as_deref()
            .and_then(|id| self.deps.assistants.assistant(id));
        let Some(assistant) = assistant else {
            warn!(%call_id, scheme = %scheme.id, "assistant not configured");
            self.reject(&invite, src, &local_tag, 503, "Service Unavailable", &metadata)
                .await;
            return Disposition::Handled;
        };

        let negotiated = parse_offer(&invite.body).and_then(|offer| negotiate(&offer));
        let media = match negotiated {
            Ok(m) => m,
            Err(e) => {
                warn!(%call_id, "media negotiation failed: {e}");
                self.reject(&invite, src, &local_tag, 488, "Not Acceptable Here", &metadata)
                    .await;
                return Disposition::Handled;
            }
        };
        let local_media = match self.deps.media.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(%call_id, "media socket unavailable: {e}");
                self.reject(&invite, src, &local_tag, 503, "Service Unavailable", &metadata)
                    .await;
                return Disposition::Handled;
            }
        };

        let mut session = CallSession::inbound(
            call_id.clone(),
            caller,
            called.clone(),
            local_media,
            media.remote,
            scheme.clone(),
            assistant,
        );
        self.persist_new(&metadata).await;
        self.emit_state(&call_id, CallState::Ringing);

        let ringing = SipResponse::for_request(&invite, 180, "Ringing", Some(&local_tag))
            .with_header("Contact", self.contact(&called));
        // Ringing -> Answering is always legal on a fresh session.
        let _ = session.transition(CallState::Answering);

        let answer_sdp = build_answer(
            &self.config().signaling.public_host,
            local_media.port(),
            media.payload_type,
            u64::try_from(Utc::now().timestamp()).unwrap_or_default(),
        );
        let token = self.root.child_token();
        let acked = CancellationToken::new();
        let entry = CallEntry {
            dialog: DialogInfo::from_invite(&invite, src, &local_tag),
            session,
            invite,
            media,
            answer_sdp,
            last_response: ringing.clone(),
            answered: false,
            token: token.clone(),
            acked: acked.clone(),
            handler: None,
        };
        lock(&self.calls).insert(call_id.clone(), entry);
        self.respond(&ringing, src).await;
        self.persist_state(&call_id, CallState::Answering, StatusTimestamps::default())
            .await;
        info!(%call_id, %called, scheme = %scheme.id, delay_ms = scheme.answer_delay_ms, "auto-answering");

        let manager = Arc::clone(self);
        let delay = Duration::from_millis(scheme.answer_delay_ms);
        tokio::spawn(async move {
            manager.answer(call_id, delay, token, acked).await;
        });
        Disposition::Handled
    }

    async fn reject(
        &self,
        invite: &SipRequest,
        src: SocketAddr,
        local_tag: &str,
        status: u16,
        reason: &str,
        metadata: &CallMetadata,
    ) {
        let response = SipResponse::for_request(invite, status, reason, Some(local_tag));
        self.remember_final(&metadata.call_id, response.clone());
        self.respond(&response, src).await;
        self.persist_new(metadata).await;
        let stamps = StatusTimestamps {
            answered_at: None,
            ended_at: Some(Utc::now()),
        };
        self.persist_state(&metadata.call_id, CallState::Failed, stamps)
            .await;
    }

    fn remember_final(&self, call_id: &str, response: SipResponse) {
        let mut finals = lock(&self.finals);
        finals.push_back((call_id.to_owned(), response));
        while finals.len() > RECENT_FINALS {
            finals.pop_front();
        }
    }

    /// Ring for `delay`, send 200 OK and retransmit it until ACK.
    async fn answer(
        self: Arc<Self>,
        call_id: String,
        delay: Duration,
        token: CancellationToken,
        acked: CancellationToken,
    ) {
        if !delay.is_zero() {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }

        let sent = {
            let mut calls = lock(&self.calls);
            calls.get_mut(&call_id).map(|entry| {
                let ok = SipResponse::for_request(&entry.invite, 200, "OK", Some(&entry.dialog.local_tag))
                    .with_header("Contact", self.contact(&entry.session.called))
                    .with_header("Allow", ALLOW)
                    .with_header("Server", self.config().signaling.user_agent.clone())
                    .with_body("application/sdp", entry.answer_sdp.clone());
                entry.last_response = ok.clone();
                entry.answered = true;
                (ok, entry.dialog.remote_addr)
            })
        };
        let Some((ok, dest)) = sent else { return };
        self.respond(&ok, dest).await;
        debug!(%call_id, "200 OK sent, awaiting ACK");

        let sig = &self.config().signaling;
        let deadline = Instant::now() + Duration::from_millis(sig.ack_timeout_ms);
        let max = Duration::from_millis(sig.retransmit_max_ms.max(1));
        let mut interval = Duration::from_millis(sig.retransmit_initial_ms.max(1)).min(max);
        loop {
            let wake = (Instant::now() + interval).min(deadline);
            tokio::select! {
                () = acked.cancelled() => return,
                () = token.cancelled() => return,
                () = tokio::time::sleep_until(wake) => {}
            }
            if Instant::now() >= deadline {
                break;
            }
            debug!(%call_id, ?interval, "retransmitting 200 OK");
            self.respond(&ok, dest).await;
            interval = (interval * 2).min(max);
        }

        warn!(%call_id, "no ACK for 200 OK, giving up");
        if let Some(mut entry) = self.take(&call_id) {
            if entry.session.state() == CallState::Answering {
                self.send_bye(&mut entry).await;
                self.finish(entry, CallState::Failed, "ACK timeout").await;
            } else {
                // ACK raced the deadline; the call is up.
                self.reinsert(entry);
            }
        }
    }

    // ── ACK ──────────────────────────────────────────────────

    async fn on_ack(self: &Arc<Self>, ack: &SipRequest) -> Disposition {
        let call_id = ack.call_id().unwrap_or_default().to_owned();
        let activated = {
            let mut calls = lock(&self.calls);
            let Some(entry) = calls.get_mut(&call_id) else {
                return Disposition::Ignored;
            };
            if entry.session.state() != CallState::Answering || !entry.answered {
                return Disposition::Handled;
            }
            match entry.session.transition(CallState::Active) {
                Ok(_) => {
                    entry.acked.cancel();
                    Some((entry.session.clone(), entry.media))
                }
                Err(e) => {
                    warn!(%call_id, "{e}");
                    None
                }
            }
        };
        let Some((session, media)) = activated else {
            return Disposition::Handled;
        };
        let stamps = StatusTimestamps {
            answered_at: session.answered_at,
            ended_at: None,
        };
        self.persist_state(&call_id, CallState::Active, stamps).await;
        info!(%call_id, remote_media = %media.remote, "call active");

        let handler = match self.deps.starter.start(&session, &media, self.hangup_tx.clone()) {
            Ok(h) => h,
            Err(e) => {
                warn!(%call_id, "handler failed to start: {e}");
                self.deps.events.emit(RuntimeEvent::stage_error(&call_id, &e));
                if let Some(mut entry) = self.take(&call_id) {
                    self.send_bye(&mut entry).await;
                    self.finish(entry, CallState::Failed, "handler start failed").await;
                }
                return Disposition::Handled;
            }
        };

        let orphaned = {
            let mut calls = lock(&self.calls);
            match calls.get_mut(&call_id) {
                Some(entry) => {
                    self.deps.media.register(
                        media.remote,
                        &call_id,
                        media.payload_type,
                        handler.inbound_sender(),
                    );
                    entry.handler = Some(Arc::clone(&handler));
                    false
                }
                None => true,
            }
        };
        if orphaned {
            // The call was torn down while the handler was starting.
            self.teardowns.spawn(async move {
                handler.shutdown().await;
            });
        }
        Disposition::Handled
    }

    // ── BYE / CANCEL ─────────────────────────────────────────

    async fn on_bye(&self, bye: &SipRequest, src: SocketAddr) -> Disposition {
        let call_id = bye.call_id().unwrap_or_default().to_owned();
        let Some(entry) = self.take(&call_id) else {
            let response = SipResponse::for_request(bye, 481, "Call/Transaction Does Not Exist", None);
            self.respond(&response, src).await;
            return Disposition::Handled;
        };
        self.respond(&SipResponse::for_request(bye, 200, "OK", None), src)
            .await;
        let state = if entry.session.state() == CallState::Active {
            CallState::Ended
        } else {
            CallState::Cancelled
        };
        self.finish(entry, state, "remote hangup").await;
        Disposition::Handled
    }

    async fn on_cancel(&self, cancel: &SipRequest, src: SocketAddr) -> Disposition {
        let call_id = cancel.call_id().unwrap_or_default().to_owned();
        let cancellable = lock(&self.calls).get(&call_id).map(|e| {
            matches!(e.session.state(), CallState::Ringing | CallState::Answering) && !e.answered
        });
        match cancellable {
            None => {
                let response = SipResponse::for_request(cancel, 481, "Call/Transaction Does Not Exist", None);
                self.respond(&response, src).await;
            }
            Some(false) => {
                // Too late: the final response is out. The caller must BYE.
                self.respond(&SipResponse::for_request(cancel, 200, "OK", None), src)
                    .await;
            }
            Some(true) => {
                self.respond(&SipResponse::for_request(cancel, 200, "OK", None), src)
                    .await;
                if let Some(entry) = self.take(&call_id) {
                    let terminated = SipResponse::for_request(
                        &entry.invite,
                        487,
                        "Request Terminated",
                        Some(&entry.dialog.local_tag),
                    );
                    self.remember_final(&call_id, terminated.clone());
                    self.respond(&terminated, entry.dialog.remote_addr).await;
                    self.finish(entry, CallState::Cancelled, "caller cancelled").await;
                }
            }
        }
        Disposition::Handled
    }

    // ── local hangup ─────────────────────────────────────────

    /// Hang up `call_id` from our side. Returns false if the call is unknown.
    pub async fn hangup(&self, call_id: &str, reason: &str) -> bool {
        let Some(mut entry) = self.take(call_id) else {
            return false;
        };
        let state = match entry.session.state() {
            CallState::Active => CallState::Ended,
            _ => CallState::Cancelled,
        };
        if entry.answered {
            self.send_bye(&mut entry).await;
        } else {
            let response = SipResponse::for_request(
                &entry.invite,
                480,
                "Temporarily Unavailable",
                Some(&entry.dialog.local_tag),
            );
            self.remember_final(call_id, response.clone());
            self.respond(&response, entry.dialog.remote_addr).await;
        }
        self.finish(entry, state, reason).await;
        true
    }

    /// Serve hangup requests from handlers until `cancel` fires.
    pub async fn run_hangups(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut rx) = lock(&self.hangup_rx).take() else {
            warn!("hangup loop already running");
            return;
        };
        loop {
            let request = tokio::select! {
                () = cancel.cancelled() => break,
                r = rx.recv() => r,
            };
            let Some(request) = request else { break };
            let reason = request.reason.to_string();
            if !self.hangup(&request.call_id, &reason).await {
                debug!(call_id = %request.call_id, "hangup for unknown call");
            }
        }
    }

    /// Hang up every call and wait for their handlers to stop.
    pub async fn shutdown_all(&self) {
        for call_id in self.call_ids() {
            self.hangup(&call_id, "bridge shutting down").await;
        }
        self.settle().await;
    }

    /// Wait for every handler shutdown started so far.
    pub async fn settle(&self) {
        self.teardowns.close();
        self.teardowns.wait().await;
        self.teardowns.reopen();
    }

    // ── teardown ─────────────────────────────────────────────

    fn take(&self, call_id: &str) -> Option<CallEntry> {
        lock(&self.calls).remove(call_id)
    }

    fn reinsert(&self, entry: CallEntry) {
        let call_id = entry.session.call_id.clone();
        lock(&self.calls).insert(call_id, entry);
    }

    async fn send_bye(&self, entry: &mut CallEntry) {
        let sig = &self.config().signaling;
        let via_host = format!("{}:{}", sig.public_host, self.deps.sip_port);
        let bye = entry.dialog.bye(&via_host, &sig.user_agent);
        self.send_request(&bye, entry.dialog.remote_addr).await;
    }

    /// Tear down a call removed from the map.
    async fn finish(&self, mut entry: CallEntry, state: CallState, reason: &str) {
        let call_id = entry.session.call_id.clone();
        entry.token.cancel();
        if let Err(e) = entry.session.transition(state) {
            warn!(%call_id, "{e}");
        }
        self.deps.media.unregister(&call_id);
        let stamps = StatusTimestamps {
            answered_at: entry.session.answered_at,
            ended_at: entry.session.ended_at.or_else(|| Some(Utc::now())),
        };
        self.persist_state(&call_id, entry.session.state(), stamps)
            .await;
        info!(%call_id, state = %entry.session.state(), reason, "call finished");
        if let Some(handler) = entry.handler.take() {
            self.teardowns.spawn(async move {
                handler.shutdown().await;
            });
        }
    }

    fn emit_state(&self, call_id: &str, state: CallState) {
        self.deps.events.emit(RuntimeEvent::CallState {
            call_id: call_id.to_owned(),
            state,
        });
    }

    async fn persist_new(&self, metadata: &CallMetadata) {
        if let Err(e) = self.deps.store.create_call(metadata).await {
            warn!(call_id = %metadata.call_id, "failed to record call: {e}");
        }
    }

    async fn persist_state(&self, call_id: &str, state: CallState, stamps: StatusTimestamps) {
        self.emit_state(call_id, state);
        if let Err(e) = self.deps.store.update_status(call_id, state, stamps).await {
            warn!(%call_id, %state, "failed to record call state: {e}");
        }
    }
}
