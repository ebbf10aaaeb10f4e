//! voxbridge: a real-time telephony voice-AI bridge.
//!
//! Inbound SIP calls that match an auto-answer scheme are answered and
//! connected to a cascaded voice pipeline:
//! Caller RTP → G.711 decode → STT → LLM → segmenter → TTS → G.711 encode → Caller RTP
//!
//! # Architecture
//!
//! - **Signaling** ([`sip`]): SIP/UDP auto-answer state machine and SDP offer/answer
//! - **Media** ([`rtp`]): one shared RTP socket, packets routed to calls by source address
//! - **Audio** ([`audio`]): G.711 µ-law, 8/16/24 kHz resampling, call recordings
//! - **VAD** ([`vad`]): barge-in and utterance endpoint detection
//! - **Segmenter** ([`segmenter`]): streaming LLM text into speakable chunks
//! - **Voices** ([`voices`]): voice registry and per-call speaker selection
//! - **Pipeline** ([`pipeline`]): the per-call conversation handler
//! - **Providers** ([`providers`]): STT, LLM and TTS backends behind traits
//! - **Store** ([`store`]): call, voicemail and turn records

pub mod audio;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod providers;
pub mod resolver;
pub mod rtp;
pub mod runtime;
pub mod segmenter;
pub mod server;
pub mod sip;
pub mod store;
pub mod vad;
pub mod voices;

pub use config::BridgeConfig;
pub use error::{BridgeError, ErrorKind, ErrorRecord, Result, Stage};
pub use pipeline::{HandlerHandle, VoiceConversationHandler};
pub use runtime::{EventSink, RuntimeEvent};
pub use server::{BridgeServer, RunningBridge};
pub use sip::{CallState, SessionManager};
