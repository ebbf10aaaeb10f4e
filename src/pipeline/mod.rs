//! The per-call conversation pipeline: caller audio → transcriber →
//! language model → segmenter → synthesizer → caller.

pub mod handler;
mod ingest;
pub mod messages;
mod playout;
mod turn;

pub use handler::{HandlerDeps, HandlerHandle, HandlerSetup, VoiceConversationHandler};
pub use messages::{ConversationState, HandlerSummary, HangupReason, LocalHangup};
