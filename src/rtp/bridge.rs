//! Shared media socket routing RTP to per-call handlers.

use super::packet::RtpPacket;
use crate::audio::encode_ulaw;
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const RECV_BUFFER: usize = 2048;
const DROP_LOG_EVERY: u64 = 100;

/// What happened to one inbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    /// No active call is registered for the source address.
    UnknownSource,
    /// Payload type other than the negotiated codec.
    WrongPayload,
    Malformed,
    /// The handler's queue was full or closed.
    Dropped,
}

struct Route {
    call_id: String,
    payload_type: u8,
    tx: mpsc::Sender<Vec<u8>>,
}

/// Process-wide RTP socket.
///
/// The route table is keyed by the remote media address negotiated in SDP.
/// Delivery uses `try_send` so a slow handler never stalls the receive loop.
pub struct MediaBridge {
    socket: Arc<UdpSocket>,
    routes: Mutex<HashMap<SocketAddr, Route>>,
    dropped: AtomicU64,
}

impl MediaBridge {
    /// Bind the media socket.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the address cannot be bound.
    pub async fn bind(addr: &str) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Arc::new(Self::from_socket(socket)))
    }

    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
            routes: Mutex::new(HashMap::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// # Errors
    ///
    /// Returns an I/O error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<SocketAddr, Route>> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start forwarding packets from `remote` to `tx`.
    pub fn register(
        &self,
        remote: SocketAddr,
        call_id: &str,
        payload_type: u8,
        tx: mpsc::Sender<Vec<u8>>,
    ) {
        let previous = self.routes().insert(
            remote,
            Route {
                call_id: call_id.to_owned(),
                payload_type,
                tx,
            },
        );
        if let Some(old) = previous {
            warn!(%remote, old_call = %old.call_id, call_id, "media route replaced");
        }
        debug!(%remote, call_id, "media route registered");
    }

    /// Remove every route belonging to `call_id`. Returns whether one existed.
    pub fn unregister(&self, call_id: &str) -> bool {
        let mut routes = self.routes();
        let before = routes.len();
        routes.retain(|_, r| r.call_id != call_id);
        let removed = routes.len() != before;
        drop(routes);
        if removed {
            debug!(call_id, "media route removed");
        }
        removed
    }

    pub fn route_count(&self) -> usize {
        self.routes().len()
    }

    /// Route one datagram from `src`.
    pub fn route(&self, src: SocketAddr, datagram: &[u8]) -> RouteOutcome {
        let packet = match RtpPacket::parse(datagram) {
            Ok(p) => p,
            Err(e) => {
                trace!(%src, "dropping malformed rtp: {e}");
                return RouteOutcome::Malformed;
            }
        };
        let routes = self.routes();
        let Some(route) = routes.get(&src) else {
            return RouteOutcome::UnknownSource;
        };
        if packet.payload_type != route.payload_type {
            return RouteOutcome::WrongPayload;
        }
        match route.tx.try_send(packet.payload) {
            Ok(()) => RouteOutcome::Delivered,
            Err(_) => {
                let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if n % DROP_LOG_EVERY == 1 {
                    debug!(call_id = %route.call_id, total_dropped = n, "inbound media dropped");
                }
                RouteOutcome::Dropped
            }
        }
    }

    /// Total inbound packets dropped because a handler queue was full.
    pub fn dropped_packets(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Receive loop shared by every call. Returns when `cancel` fires.
    ///
    /// # Errors
    ///
    /// Never fails on per-packet errors; socket errors are logged and the loop
    /// keeps reading.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        info!(addr = ?self.socket.local_addr().ok(), "media bridge listening");
        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                recv = self.socket.recv_from(&mut buf) => match recv {
                    Ok((len, src)) => {
                        let outcome = self.route(src, &buf[..len]);
                        trace!(%src, ?outcome, "rtp");
                    }
                    Err(e) => warn!("media socket receive error: {e}"),
                },
            }
        }
        info!("media bridge stopped");
        Ok(())
    }

    /// Outbound sender for one call.
    pub fn sender(&self, remote: SocketAddr, payload_type: u8) -> RtpSender {
        RtpSender::new(Arc::clone(&self.socket), remote, payload_type)
    }
}

/// Where a handler writes its 20 ms PCM frames.
#[async_trait]
pub trait MediaSink: Send {
    async fn send_frame(&mut self, frame: &[i16]) -> Result<()>;

    /// Mark the start of a new talk spurt.
    fn begin_talkspurt(&mut self);
}

/// Encodes frames as PCMU and writes them to the remote media address.
pub struct RtpSender {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    payload_type: u8,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    marker_pending: bool,
}

impl RtpSender {
    fn new(socket: Arc<UdpSocket>, remote: SocketAddr, payload_type: u8) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            socket,
            remote,
            payload_type,
            ssrc: rng.r#gen(),
            sequence: rng.r#gen(),
            timestamp: rng.r#gen(),
            marker_pending: true,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }
}

#[async_trait]
impl MediaSink for RtpSender {
    async fn send_frame(&mut self, frame: &[i16]) -> Result<()> {
        let mut packet = RtpPacket::new(
            self.payload_type,
            self.sequence,
            self.timestamp,
            self.ssrc,
            encode_ulaw(frame),
        );
        packet.marker = std::mem::take(&mut self.marker_pending);
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self
            .timestamp
            .wrapping_add(u32::try_from(frame.len()).unwrap_or(u32::MAX));
        self.socket
            .send_to(&packet.to_bytes(), self.remote)
            .await
            .map_err(|e| BridgeError::Media(format!("rtp send to {}: {e}", self.remote)))?;
        Ok(())
    }

    fn begin_talkspurt(&mut self) {
        self.marker_pending = true;
    }
}

/// Forwards frames into a channel; used for tests and local capture.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Vec<i16>>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<i16>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MediaSink for ChannelSink {
    async fn send_frame(&mut self, frame: &[i16]) -> Result<()> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| BridgeError::Channel("capture sink closed".into()))
    }

    fn begin_talkspurt(&mut self) {}
}
