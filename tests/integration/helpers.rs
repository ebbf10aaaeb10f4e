//! Shared helpers for integration tests.
//!
//! A [`TestBridge`] runs the whole bridge on loopback with scripted
//! providers and an in-memory store. A [`Phone`] is a minimal SIP user agent
//! with its own RTP socket.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use voxbridge::audio::encode_ulaw;
use voxbridge::config::BridgeConfig;
use voxbridge::providers::ProviderSet;
use voxbridge::providers::scripted::{
    ScriptedLanguageModel, ScriptedReply, ScriptedSynthesizerFactory, ScriptedTranscriberFactory,
    ScriptedTranscriberHandle,
};
use voxbridge::resolver::{AssistantProfile, AutoAnswerScheme, HandlerMode};
use voxbridge::rtp::RtpPacket;
use voxbridge::sip::{PassThrough, SipMessage, SipRequest, SipResponse};
use voxbridge::store::MemoryStore;
use voxbridge::voices::VoiceRegistry;
use voxbridge::{BridgeServer, RunningBridge, RuntimeEvent};

pub(crate) const WAIT: Duration = Duration::from_secs(5);

// ── bridge ───────────────────────────────────────────────────

pub(crate) struct TestBridge {
    pub bridge: RunningBridge,
    pub store: Arc<MemoryStore>,
    pub stt: ScriptedTranscriberHandle,
    pub synth: ScriptedSynthesizerFactory,
    pub llm: Arc<ScriptedLanguageModel>,
    pub events: broadcast::Receiver<RuntimeEvent>,
    pub dir: tempfile::TempDir,
}

/// Numbers served by the test directory:
///
/// - `100`: conversation with the `front-desk` assistant
/// - `200`: voicemail with a spoken prompt
/// - `300`: references an assistant that does not exist
/// - `400`: disabled scheme
/// - `500`: conversation answered after a 500 ms ring
pub(crate) fn test_config(dir: &std::path::Path) -> BridgeConfig {
    let mut cfg = BridgeConfig::default();
    cfg.signaling.bind_addr = "127.0.0.1:0".into();
    cfg.signaling.public_host = "127.0.0.1".into();
    cfg.media.bind_addr = "127.0.0.1:0".into();
    cfg.recording.dir = dir.join("recordings");
    cfg.stt.final_timeout_secs = 0;
    cfg.handler.max_call_duration_secs = 0;

    let scheme = |id: &str, number: &str, assistant: &str| AutoAnswerScheme {
        id: id.into(),
        called_number: number.into(),
        assistant_id: Some(assistant.into()),
        ..AutoAnswerScheme::default()
    };
    cfg.schemes = vec![
        scheme("desk", "100", "front-desk"),
        AutoAnswerScheme {
            mode: HandlerMode::Message,
            voicemail_prompt: Some("Beep".into()),
            ..scheme("voicemail", "200", "front-desk")
        },
        scheme("broken", "300", "ghost"),
        AutoAnswerScheme {
            enabled: false,
            ..scheme("off", "400", "front-desk")
        },
        AutoAnswerScheme {
            answer_delay_ms: 500,
            ..scheme("slow", "500", "front-desk")
        },
    ];
    cfg.assistants = vec![AssistantProfile {
        id: "front-desk".into(),
        name: "Front desk".into(),
        ..AssistantProfile::default()
    }];
    cfg
}

pub(crate) struct BridgeOptions {
    pub replies: Vec<ScriptedReply>,
    pub synth: ScriptedSynthesizerFactory,
    pub passthrough: Option<mpsc::UnboundedSender<PassThrough>>,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            replies: Vec::new(),
            synth: ScriptedSynthesizerFactory::default(),
            passthrough: None,
        }
    }
}

pub(crate) async fn start_bridge(tweak: impl FnOnce(&mut BridgeConfig)) -> TestBridge {
    start_bridge_with(BridgeOptions::default(), tweak).await
}

pub(crate) async fn start_bridge_with(
    options: BridgeOptions,
    tweak: impl FnOnce(&mut BridgeConfig),
) -> TestBridge {
    let dir = tempfile::tempdir().expect("create temp dir");
    let mut cfg = test_config(dir.path());
    tweak(&mut cfg);

    let (stt_factory, stt) = ScriptedTranscriberFactory::new();
    let llm = Arc::new(ScriptedLanguageModel::new(options.replies));
    let store = Arc::new(MemoryStore::new());
    let providers = ProviderSet {
        transcribers: Arc::new(stt_factory),
        synthesizers: Arc::new(options.synth.clone()),
        language_model: llm.clone(),
    };
    let mut server = BridgeServer::with_parts(
        cfg,
        store.clone(),
        providers,
        Arc::new(VoiceRegistry::builtin()),
    );
    if let Some(tx) = options.passthrough {
        server = server.with_passthrough(tx);
    }
    let events = server.events().subscribe();
    let bridge = server.start().await.expect("start bridge");
    TestBridge {
        bridge,
        store,
        stt,
        synth: options.synth,
        llm,
        events,
        dir,
    }
}

/// Poll `check` until it holds or `limit` passes.
pub(crate) async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub(crate) async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, fut).await.expect("timed out")
}

pub(crate) fn drain_events(rx: &mut broadcast::Receiver<RuntimeEvent>) -> Vec<RuntimeEvent> {
    let mut events = Vec::new();
    while let Ok(evt) = rx.try_recv() {
        events.push(evt);
    }
    events
}

// ── phone ────────────────────────────────────────────────────

/// A SIP user agent on loopback.
pub(crate) struct Phone {
    pub sip: UdpSocket,
    pub rtp: UdpSocket,
    pub bridge: SocketAddr,
    rtp_seq: u16,
}

impl Phone {
    pub async fn new(bridge: SocketAddr) -> Self {
        Self {
            sip: UdpSocket::bind("127.0.0.1:0").await.expect("bind sip"),
            rtp: UdpSocket::bind("127.0.0.1:0").await.expect("bind rtp"),
            bridge,
            rtp_seq: 1,
        }
    }

    pub fn sip_addr(&self) -> SocketAddr {
        self.sip.local_addr().expect("sip addr")
    }

    pub fn rtp_port(&self) -> u16 {
        self.rtp.local_addr().expect("rtp addr").port()
    }

    pub fn offer(&self, payload_types: &str) -> String {
        format!(
            "v=0\r\n\
             o=phone 1 1 IN IP4 127.0.0.1\r\n\
             s=call\r\n\
             c=IN IP4 127.0.0.1\r\n\
             t=0 0\r\n\
             m=audio {} RTP/AVP {payload_types}\r\n\
             a=rtpmap:0 PCMU/8000\r\n\
             a=rtpmap:8 PCMA/8000\r\n",
            self.rtp_port()
        )
    }

    pub fn invite(&self, call_id: &str, called: &str) -> String {
        self.invite_with_sdp(call_id, called, &self.offer("0 8"))
    }

    pub fn invite_with_sdp(&self, call_id: &str, called: &str, sdp: &str) -> String {
        let me = self.sip_addr();
        format!(
            "INVITE sip:{called}@{bridge} SIP/2.0\r\n\
             Via: SIP/2.0/UDP {me};branch=z9hG4bK-{call_id}-1\r\n\
             Max-Forwards: 70\r\n\
             From: <sip:alice@{me}>;tag=phone-{call_id}\r\n\
             To: <sip:{called}@{bridge}>\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: 1 INVITE\r\n\
             Contact: <sip:alice@{me}>\r\n\
             Content-Type: application/sdp\r\n\
             Content-Length: {len}\r\n\r\n{sdp}",
            bridge = self.bridge,
            len = sdp.len(),
        )
    }

    /// An in-dialog request using the To (with tag) of `answer`.
    pub fn in_dialog(&self, method: &str, cseq: u32, call_id: &str, answer: &SipResponse) -> String {
        let me = self.sip_addr();
        let to = answer.headers.get("To").expect("To header");
        format!(
            "{method} sip:100@{bridge} SIP/2.0\r\n\
             Via: SIP/2.0/UDP {me};branch=z9hG4bK-{call_id}-{cseq}\r\n\
             Max-Forwards: 70\r\n\
             From: <sip:alice@{me}>;tag=phone-{call_id}\r\n\
             To: {to}\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: {cseq} {method}\r\n\
             Content-Length: 0\r\n\r\n",
            bridge = self.bridge,
        )
    }

    pub fn cancel(&self, call_id: &str, called: &str) -> String {
        let me = self.sip_addr();
        format!(
            "CANCEL sip:{called}@{bridge} SIP/2.0\r\n\
             Via: SIP/2.0/UDP {me};branch=z9hG4bK-{call_id}-1\r\n\
             Max-Forwards: 70\r\n\
             From: <sip:alice@{me}>;tag=phone-{call_id}\r\n\
             To: <sip:{called}@{bridge}>\r\n\
             Call-ID: {call_id}\r\n\
             CSeq: 1 CANCEL\r\n\
             Content-Length: 0\r\n\r\n",
            bridge = self.bridge,
        )
    }

    pub async fn send(&self, raw: &str) {
        self.sip
            .send_to(raw.as_bytes(), self.bridge)
            .await
            .expect("send sip");
    }

    pub async fn recv(&self) -> Option<SipMessage> {
        let mut buf = vec![0u8; 65_535];
        let (len, _) = tokio::time::timeout(WAIT, self.sip.recv_from(&mut buf))
            .await
            .ok()?
            .ok()?;
        SipMessage::parse(&buf[..len]).ok()
    }

    /// Next response with `status`, skipping anything else.
    pub async fn expect_status(&self, status: u16) -> SipResponse {
        loop {
            match self.recv().await {
                Some(SipMessage::Response(r)) if r.status == status => return r,
                Some(_) => continue,
                None => panic!("no {status} response"),
            }
        }
    }

    /// Next `status` response to a `method` request.
    pub async fn expect_for(&self, status: u16, method: &str) -> SipResponse {
        loop {
            match self.recv().await {
                Some(SipMessage::Response(r))
                    if r.status == status
                        && r.cseq().is_some_and(|(_, m)| m.as_str() == method) =>
                {
                    return r;
                }
                Some(_) => continue,
                None => panic!("no {status} response to {method}"),
            }
        }
    }

    /// Next request with `method`, skipping anything else.
    pub async fn expect_request(&self, method: &str) -> SipRequest {
        loop {
            match self.recv().await {
                Some(SipMessage::Request(r)) if r.method.as_str() == method => return r,
                Some(_) => continue,
                None => panic!("no {method} request"),
            }
        }
    }

    /// Reply 200 to a request from the bridge.
    pub async fn ok(&self, request: &SipRequest) {
        let response = SipResponse::for_request(request, 200, "OK", None);
        self.sip
            .send_to(&response.to_bytes(), self.bridge)
            .await
            .expect("send sip");
    }

    /// INVITE, wait for 200 OK and ACK it.
    pub async fn call(&self, call_id: &str, called: &str) -> SipResponse {
        self.send(&self.invite(call_id, called)).await;
        let ok = self.expect_for(200, "INVITE").await;
        self.send(&self.in_dialog("ACK", 1, call_id, &ok)).await;
        ok
    }

    pub async fn hang_up(&self, call_id: &str, answer: &SipResponse) -> SipResponse {
        self.send(&self.in_dialog("BYE", 2, call_id, answer)).await;
        self.expect_for(200, "BYE").await
    }

    /// Send `frames` µ-law packets of constant `level` to `media`.
    pub async fn send_audio(&mut self, media: SocketAddr, level: i16, frames: usize) {
        for _ in 0..frames {
            let payload = encode_ulaw(&[level; 160]);
            let seq = self.rtp_seq;
            self.rtp_seq = self.rtp_seq.wrapping_add(1);
            let packet = RtpPacket::new(0, seq, u32::from(seq) * 160, 0x1234_5678, payload);
            self.rtp
                .send_to(&packet.to_bytes(), media)
                .await
                .expect("send rtp");
        }
    }

    /// RTP packets received within `limit`.
    pub async fn collect_rtp(&self, limit: Duration) -> Vec<RtpPacket> {
        let mut packets = Vec::new();
        let mut buf = vec![0u8; 2048];
        let deadline = tokio::time::Instant::now() + limit;
        while let Ok(Ok((len, _))) =
            tokio::time::timeout_at(deadline, self.rtp.recv_from(&mut buf)).await
        {
            if let Ok(p) = RtpPacket::parse(&buf[..len]) {
                packets.push(p);
            }
        }
        packets
    }
}
