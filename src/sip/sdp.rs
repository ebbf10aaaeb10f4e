//! SDP offer/answer for a single PCMU audio stream.

use crate::error::{BridgeError, Result};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

/// Static payload type for G.711 µ-law.
pub const PCMU_PAYLOAD_TYPE: u8 = 0;

/// The parts of an SDP offer the bridge uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpOffer {
    pub connection: IpAddr,
    pub audio_port: u16,
    /// Payload types from the `m=audio` line, in preference order.
    pub payload_types: Vec<u8>,
    /// `a=rtpmap` encodings, e.g. `0 -> "PCMU/8000"`.
    pub rtpmap: HashMap<u8, String>,
}

/// Agreed media parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedMedia {
    pub remote: SocketAddr,
    pub payload_type: u8,
}

fn neg(msg: impl Into<String>) -> BridgeError {
    BridgeError::Negotiation(msg.into())
}

fn parse_connection(value: &str) -> Result<IpAddr> {
    // c=IN IP4 10.0.0.5[/ttl]
    let addr = value
        .split_whitespace()
        .nth(2)
        .ok_or_else(|| neg(format!("bad c= line {value:?}")))?;
    let addr = addr.split('/').next().unwrap_or(addr);
    addr.parse().map_err(|_| neg(format!("bad connection address {addr:?}")))
}

/// Parse an SDP body.
///
/// # Errors
///
/// Returns a negotiation error if the body lacks an audio stream or a
/// connection address.
pub fn parse_offer(body: &str) -> Result<SdpOffer> {
    let mut session_conn: Option<IpAddr> = None;
    let mut media_conn: Option<IpAddr> = None;
    let mut audio: Option<(u16, Vec<u8>)> = None;
    let mut rtpmap = HashMap::new();
    let mut in_audio = false;

    for line in body.lines().map(str::trim) {
        let Some((kind, value)) = line.split_once('=') else {
            continue;
        };
        match kind {
            "m" => {
                in_audio = false;
                let mut parts = value.split_whitespace();
                if parts.next() != Some("audio") || audio.is_some() {
                    continue;
                }
                let port = parts
                    .next()
                    .and_then(|p| p.split('/').next())
                    .and_then(|p| p.parse::<u16>().ok())
                    .ok_or_else(|| neg(format!("bad m= line {value:?}")))?;
                let _proto = parts.next();
                let pts = parts.filter_map(|p| p.parse::<u8>().ok()).collect();
                audio = Some((port, pts));
                in_audio = true;
            }
            "c" if audio.is_none() => session_conn = Some(parse_connection(value)?),
            "c" if in_audio => media_conn = Some(parse_connection(value)?),
            "a" if in_audio => {
                if let Some(map) = value.strip_prefix("rtpmap:")
                    && let Some((pt, enc)) = map.split_once(' ')
                    && let Ok(pt) = pt.trim().parse::<u8>()
                {
                    rtpmap.insert(pt, enc.trim().to_owned());
                }
            }
            _ => {}
        }
    }

    let (audio_port, payload_types) = audio.ok_or_else(|| neg("offer has no audio stream"))?;
    let connection = media_conn
        .or(session_conn)
        .ok_or_else(|| neg("offer has no connection address"))?;
    Ok(SdpOffer {
        connection,
        audio_port,
        payload_types,
        rtpmap,
    })
}

/// Choose PCMU from the offer.
///
/// # Errors
///
/// Returns a negotiation error when the stream is disabled or PCMU is not offered.
pub fn negotiate(offer: &SdpOffer) -> Result<NegotiatedMedia> {
    if offer.audio_port == 0 {
        return Err(neg("audio stream is disabled (port 0)"));
    }
    let is_pcmu = |pt: u8| match offer.rtpmap.get(&pt) {
        Some(enc) => enc.to_ascii_uppercase().starts_with("PCMU/8000"),
        None => pt == PCMU_PAYLOAD_TYPE,
    };
    let payload_type = offer
        .payload_types
        .iter()
        .copied()
        .find(|&pt| is_pcmu(pt))
        .ok_or_else(|| neg("PCMU not offered"))?;
    Ok(NegotiatedMedia {
        remote: SocketAddr::new(offer.connection, offer.audio_port),
        payload_type,
    })
}

/// Render the answer for a negotiated stream.
pub fn build_answer(local_host: &str, local_port: u16, payload_type: u8, session_id: u64) -> String {
    let ip_ver = if local_host.contains(':') { "IP6" } else { "IP4" };
    format!(
        "v=0\r\n\
         o=voxbridge {session_id} {session_id} IN {ip_ver} {local_host}\r\n\
         s=voxbridge\r\n\
         c=IN {ip_ver} {local_host}\r\n\
         t=0 0\r\n\
         m=audio {local_port} RTP/AVP {payload_type}\r\n\
         a=rtpmap:{payload_type} PCMU/8000\r\n\
         a=ptime:20\r\n\
         a=sendrecv\r\n"
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    const OFFER: &str = "v=0\r\n\
o=- 1 1 IN IP4 10.0.0.5\r\n\
s=-\r\n\
c=IN IP4 10.0.0.5\r\n\
t=0 0\r\n\
m=audio 40000 RTP/AVP 8 0 101\r\n\
a=rtpmap:8 PCMA/8000\r\n\
a=rtpmap:0 PCMU/8000\r\n\
a=rtpmap:101 telephone-event/8000\r\n";

    #[test]
    fn parses_offer() {
        let offer = parse_offer(OFFER).unwrap();
        assert_eq!(offer.connection, "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(offer.audio_port, 40000);
        assert_eq!(offer.payload_types, vec![8, 0, 101]);
        assert_eq!(offer.rtpmap.get(&101).unwrap(), "telephone-event/8000");
    }

    #[test]
    fn negotiates_pcmu_even_when_not_first() {
        let media = negotiate(&parse_offer(OFFER).unwrap()).unwrap();
        assert_eq!(media.payload_type, 0);
        assert_eq!(media.remote, "10.0.0.5:40000".parse().unwrap());
    }

    #[test]
    fn media_level_connection_overrides_session() {
        let body = "v=0\nc=IN IP4 1.1.1.1\nm=audio 5000 RTP/AVP 0\nc=IN IP4 2.2.2.2\n";
        let offer = parse_offer(body).unwrap();
        assert_eq!(offer.connection, "2.2.2.2".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn dynamic_pcmu_mapping_is_accepted() {
        let body = "v=0\nc=IN IP4 1.1.1.1\nm=audio 5000 RTP/AVP 96\na=rtpmap:96 pcmu/8000\n";
        assert_eq!(negotiate(&parse_offer(body).unwrap()).unwrap().payload_type, 96);
    }

    #[test]
    fn no_pcmu_is_negotiation_error() {
        let body = "v=0\nc=IN IP4 1.1.1.1\nm=audio 5000 RTP/AVP 8\na=rtpmap:8 PCMA/8000\n";
        let err = negotiate(&parse_offer(body).unwrap()).unwrap_err();
        assert!(matches!(err, BridgeError::Negotiation(_)));
    }

    #[test]
    fn missing_audio_or_connection_is_error() {
        assert!(parse_offer("v=0\nc=IN IP4 1.1.1.1\nm=video 5000 RTP/AVP 96\n").is_err());
        assert!(parse_offer("v=0\nm=audio 5000 RTP/AVP 0\n").is_err());
        assert!(parse_offer("").is_err());
    }

    #[test]
    fn disabled_stream_is_rejected() {
        let body = "v=0\nc=IN IP4 1.1.1.1\nm=audio 0 RTP/AVP 0\n";
        assert!(negotiate(&parse_offer(body).unwrap()).is_err());
    }

    #[test]
    fn answer_advertises_pcmu_and_ptime() {
        let answer = build_answer("192.0.2.10", 10000, 0, 42);
        assert!(answer.contains("c=IN IP4 192.0.2.10\r\n"));
        assert!(answer.contains("m=audio 10000 RTP/AVP 0\r\n"));
        assert!(answer.contains("a=rtpmap:0 PCMU/8000\r\n"));
        assert!(answer.contains("a=ptime:20\r\n"));
        let reparsed = parse_offer(&answer).unwrap();
        assert_eq!(reparsed.audio_port, 10000);
    }
}
