//! RFC 3550 packet parsing and building.

use crate::error::{BridgeError, Result};

const FIXED_HEADER_LEN: usize = 12;
const RTP_VERSION: u8 = 2;

/// One RTP packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
    /// Header extension as `(profile, data)`; data length is a multiple of 4.
    pub extension: Option<(u16, Vec<u8>)>,
    pub payload: Vec<u8>,
}

fn malformed(msg: impl Into<String>) -> BridgeError {
    BridgeError::Media(msg.into())
}

fn be_u16(b: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([b[at], b[at + 1]])
}

fn be_u32(b: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
}

impl RtpPacket {
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32, payload: Vec<u8>) -> Self {
        Self {
            marker: false,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            csrc: Vec::new(),
            extension: None,
            payload,
        }
    }

    /// Parse a datagram. Padding is stripped from the payload.
    ///
    /// # Errors
    ///
    /// Returns a media error for truncated packets or a version other than 2.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < FIXED_HEADER_LEN {
            return Err(malformed(format!("rtp packet too short ({} bytes)", data.len())));
        }
        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(malformed(format!("unsupported rtp version {version}")));
        }
        let padding = data[0] & 0x20 != 0;
        let has_extension = data[0] & 0x10 != 0;
        let csrc_count = usize::from(data[0] & 0x0F);
        let marker = data[1] & 0x80 != 0;
        let payload_type = data[1] & 0x7F;

        let mut offset = FIXED_HEADER_LEN;
        if data.len() < offset + csrc_count * 4 {
            return Err(malformed("rtp csrc list truncated"));
        }
        let csrc = (0..csrc_count).map(|i| be_u32(data, offset + i * 4)).collect();
        offset += csrc_count * 4;

        let extension = if has_extension {
            if data.len() < offset + 4 {
                return Err(malformed("rtp extension header truncated"));
            }
            let profile = be_u16(data, offset);
            let words = usize::from(be_u16(data, offset + 2));
            offset += 4;
            if data.len() < offset + words * 4 {
                return Err(malformed("rtp extension truncated"));
            }
            let ext = data[offset..offset + words * 4].to_vec();
            offset += words * 4;
            Some((profile, ext))
        } else {
            None
        };

        let mut end = data.len();
        if padding {
            let pad = usize::from(data[end - 1]);
            if pad == 0 || offset + pad > end {
                return Err(malformed("rtp padding exceeds packet"));
            }
            end -= pad;
        }

        Ok(Self {
            marker,
            payload_type,
            sequence: be_u16(data, 2),
            timestamp: be_u32(data, 4),
            ssrc: be_u32(data, 8),
            csrc,
            extension,
            payload: data[offset..end].to_vec(),
        })
    }

    /// Serialize without padding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let ext_len = self.extension.as_ref().map_or(0, |(_, d)| 4 + d.len());
        let mut out =
            Vec::with_capacity(FIXED_HEADER_LEN + self.csrc.len() * 4 + ext_len + self.payload.len());
        let csrc_count = self.csrc.len().min(15) as u8;
        let ext_bit = if self.extension.is_some() { 0x10 } else { 0 };
        out.push((RTP_VERSION << 6) | ext_bit | csrc_count);
        out.push((u8::from(self.marker) << 7) | (self.payload_type & 0x7F));
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        for c in self.csrc.iter().take(15) {
            out.extend_from_slice(&c.to_be_bytes());
        }
        if let Some((profile, data)) = &self.extension {
            let words = u16::try_from(data.len().div_ceil(4)).unwrap_or(u16::MAX);
            out.extend_from_slice(&profile.to_be_bytes());
            out.extend_from_slice(&words.to_be_bytes());
            out.extend_from_slice(data);
            out.resize(out.len() + usize::from(words) * 4 - data.len(), 0);
        }
        out.extend_from_slice(&self.payload);
        out
    }
}
