//! UDP transport for SIP.

use super::manager::{Disposition, SessionManager};
use super::message::{SipMessage, SipRequest, SipResponse};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const MAX_DATAGRAM: usize = 65_535;

/// Sends serialized SIP messages.
#[async_trait]
pub trait SipSender: Send + Sync {
    async fn send(&self, data: &[u8], to: SocketAddr) -> Result<()>;
}

pub struct UdpSipSender {
    socket: Arc<UdpSocket>,
}

impl UdpSipSender {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl SipSender for UdpSipSender {
    async fn send(&self, data: &[u8], to: SocketAddr) -> Result<()> {
        self.socket
            .send_to(data, to)
            .await
            .map_err(|e| BridgeError::Signaling(format!("send to {to}: {e}")))?;
        Ok(())
    }
}

/// An INVITE no scheme claimed, with its source address.
pub type PassThrough = (SipRequest, SocketAddr);

/// The SIP listening socket and its receive loop.
pub struct SipTransport {
    socket: Arc<UdpSocket>,
    passthrough: Option<mpsc::UnboundedSender<PassThrough>>,
}

impl SipTransport {
    /// # Errors
    ///
    /// Returns a signaling error if the socket cannot be bound.
    pub async fn bind(addr: &str) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| BridgeError::Signaling(format!("bind {addr}: {e}")))?;
        Ok(Self {
            socket: Arc::new(socket),
            passthrough: None,
        })
    }

    /// Forward unmatched INVITEs here instead of rejecting them.
    pub fn with_passthrough(mut self, tx: mpsc::UnboundedSender<PassThrough>) -> Self {
        self.passthrough = Some(tx);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn sender(&self) -> Arc<UdpSipSender> {
        Arc::new(UdpSipSender::new(Arc::clone(&self.socket)))
    }

    /// Receive and dispatch until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket fails.
    pub async fn run(self, manager: Arc<SessionManager>, cancel: CancellationToken) -> Result<()> {
        info!(addr = ?self.socket.local_addr().ok(), "SIP transport listening");
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, src) = tokio::select! {
                () = cancel.cancelled() => break,
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok(v) => v,
                    Err(e) => {
                        // ICMP port-unreachable surfaces here on some platforms.
                        debug!("SIP recv error: {e}");
                        continue;
                    }
                },
            };
            let datagram = &buf[..len];
            if datagram.iter().all(u8::is_ascii_whitespace) {
                trace!(%src, "keep-alive");
                continue;
            }
            let message = match SipMessage::parse(datagram) {
                Ok(m) => m,
                Err(e) => {
                    debug!(%src, "unparseable SIP datagram: {e}");
                    continue;
                }
            };
            match manager.handle_message(message, src).await {
                Disposition::Handled | Disposition::Ignored => {}
                Disposition::PassThrough(request) => self.pass_through(request, src).await,
            }
        }
        info!("SIP transport stopped");
        Ok(())
    }

    async fn pass_through(&self, request: SipRequest, src: SocketAddr) {
        if let Some(tx) = &self.passthrough {
            if tx.send((request.clone(), src)).is_ok() {
                return;
            }
        }
        let response = SipResponse::for_request(&request, 404, "Not Found", None);
        if let Err(e) = self.socket.send_to(&response.to_bytes(), src).await {
            warn!(%src, "failed to reject unmatched INVITE: {e}");
        }
    }
}
