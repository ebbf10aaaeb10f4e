//! Real-time media transport.

pub mod bridge;
pub mod packet;

pub use bridge::{ChannelSink, MediaBridge, MediaSink, RouteOutcome, RtpSender};
pub use packet::RtpPacket;
