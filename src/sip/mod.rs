//! Inbound-call signaling: the SIP subset needed for auto-answer.
//!
//! [`SessionManager`] owns the call state machine. [`SipTransport`] runs the
//! UDP receive loop and delivers parsed messages to the manager.

pub mod manager;
pub mod message;
pub mod sdp;
pub mod session;
pub mod transport;

pub use manager::{CallStarter, DialogInfo, Disposition, SessionManager, SignalingDeps};
pub use message::{Method, SipMessage, SipRequest, SipResponse};
pub use session::{CallSession, CallState, Direction};
pub use transport::{PassThrough, SipSender, SipTransport, UdpSipSender};
