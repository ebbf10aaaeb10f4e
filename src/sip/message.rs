//! SIP message parsing and building for the auto-answer subset.
//!
//! Handles request/response start lines, case-insensitive headers with
//! compact-form aliases, header folding and Content-Length bounded bodies.

use crate::error::{BridgeError, Result};
use std::fmt;

/// SIP request method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Options,
    Other(String),
}

impl Method {
    pub fn parse(s: &str) -> Self {
        match s {
            "INVITE" => Self::Invite,
            "ACK" => Self::Ack,
            "BYE" => Self::Bye,
            "CANCEL" => Self::Cancel,
            "OPTIONS" => Self::Options,
            other => Self::Other(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Invite => "INVITE",
            Self::Ack => "ACK",
            Self::Bye => "BYE",
            Self::Cancel => "CANCEL",
            Self::Options => "OPTIONS",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expand a compact header name to its long form.
fn canonical_name(name: &str) -> &str {
    match name {
        "i" | "I" => "Call-ID",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "v" | "V" => "Via",
        "m" | "M" => "Contact",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        "k" | "K" => "Supported",
        "s" | "S" => "Subject",
        other => other,
    }
}

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in message order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Replace all values for `name` with one value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.0.push((name.to_owned(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A SIP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipRequest {
    pub method: Method,
    pub uri: String,
    pub headers: Headers,
    pub body: String,
}

/// A SIP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: String,
}

/// Either kind of SIP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    /// Parse one UDP datagram.
    ///
    /// # Errors
    ///
    /// Returns a signaling error for a malformed start line or header.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|_| BridgeError::Signaling("message is not UTF-8".into()))?;
        let (head, rest) = split_head(text);

        let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
        let start = lines
            .by_ref()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| BridgeError::Signaling("empty message".into()))?;
        let headers = parse_headers(lines)?;
        let body = bounded_body(&headers, rest);

        if let Some(status_line) = start.strip_prefix("SIP/2.0 ") {
            let (code, reason) = status_line.split_once(' ').unwrap_or((status_line, ""));
            let status = code
                .parse::<u16>()
                .map_err(|_| BridgeError::Signaling(format!("bad status code {code:?}")))?;
            return Ok(Self::Response(SipResponse {
                status,
                reason: reason.to_owned(),
                headers,
                body,
            }));
        }

        let mut parts = start.split_whitespace();
        let (Some(method), Some(uri), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(BridgeError::Signaling(format!("bad request line {start:?}")));
        };
        if version != "SIP/2.0" {
            return Err(BridgeError::Signaling(format!("unsupported version {version}")));
        }
        Ok(Self::Request(SipRequest {
            method: Method::parse(method),
            uri: uri.to_owned(),
            headers,
            body,
        }))
    }
}

fn split_head(text: &str) -> (&str, &str) {
    if let Some(i) = text.find("\r\n\r\n") {
        (&text[..i], &text[i + 4..])
    } else if let Some(i) = text.find("\n\n") {
        (&text[..i], &text[i + 2..])
    } else {
        (text, "")
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Headers> {
    let mut headers: Vec<(String, String)> = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // Folded continuation of the previous header.
            let Some(last) = headers.last_mut() else {
                return Err(BridgeError::Signaling("continuation before first header".into()));
            };
            last.1.push(' ');
            last.1.push_str(line.trim());
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| BridgeError::Signaling(format!("bad header line {line:?}")))?;
        headers.push((canonical_name(name.trim()).to_owned(), value.trim().to_owned()));
    }
    Ok(Headers(headers))
}

fn bounded_body(headers: &Headers, rest: &str) -> String {
    match headers.get("Content-Length").and_then(|v| v.parse::<usize>().ok()) {
        Some(len) if len <= rest.len() && rest.is_char_boundary(len) => rest[..len].to_owned(),
        _ => rest.to_owned(),
    }
}

fn write_message(
    f: &mut fmt::Formatter<'_>,
    start: &str,
    headers: &Headers,
    body: &str,
) -> fmt::Result {
    write!(f, "{start}\r\n")?;
    for (k, v) in headers.iter() {
        if k.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        write!(f, "{k}: {v}\r\n")?;
    }
    write!(f, "Content-Length: {}\r\n\r\n{body}", body.len())
}

impl fmt::Display for SipRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_message(
            f,
            &format!("{} {} SIP/2.0", self.method, self.uri),
            &self.headers,
            &self.body,
        )
    }
}

impl fmt::Display for SipResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_message(
            f,
            &format!("SIP/2.0 {} {}", self.status, self.reason),
            &self.headers,
            &self.body,
        )
    }
}

impl SipRequest {
    pub fn call_id(&self) -> Option<&str> {
        self.headers.get("Call-ID")
    }

    /// CSeq number and method.
    pub fn cseq(&self) -> Option<(u32, Method)> {
        parse_cseq(self.headers.get("CSeq")?)
    }

    /// Called identity: the Request-URI user part.
    pub fn called_user(&self) -> Option<&str> {
        uri_user(&self.uri)
    }

    /// Caller identity: the From user part.
    pub fn caller_user(&self) -> Option<&str> {
        uri_user(self.headers.get("From")?)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl SipResponse {
    /// Build a response mirroring the dialog headers of `req`.
    ///
    /// When `to_tag` is given and the request's To has no tag yet, the tag is
    /// appended.
    pub fn for_request(req: &SipRequest, status: u16, reason: &str, to_tag: Option<&str>) -> Self {
        let mut headers = Headers::new();
        for via in req.headers.get_all("Via") {
            headers.push("Via", via);
        }
        if let Some(from) = req.headers.get("From") {
            headers.push("From", from);
        }
        if let Some(to) = req.headers.get("To") {
            match to_tag {
                Some(tag) if tag_param(to).is_none() => headers.push("To", format!("{to};tag={tag}")),
                _ => headers.push("To", to),
            }
        }
        if let Some(call_id) = req.headers.get("Call-ID") {
            headers.push("Call-ID", call_id);
        }
        if let Some(cseq) = req.headers.get("CSeq") {
            headers.push("CSeq", cseq);
        }
        Self {
            status,
            reason: reason.to_owned(),
            headers,
            body: String::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push(name, value);
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<String>) -> Self {
        self.headers.set("Content-Type", content_type);
        self.body = body.into();
        self
    }

    pub fn cseq(&self) -> Option<(u32, Method)> {
        parse_cseq(self.headers.get("CSeq")?)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

fn parse_cseq(value: &str) -> Option<(u32, Method)> {
    let mut parts = value.split_whitespace();
    let num = parts.next()?.parse().ok()?;
    let method = Method::parse(parts.next()?);
    Some((num, method))
}

/// User part of a SIP URI or name-addr: `"Bob" <sip:100@host;x=y>` gives `100`.
pub fn uri_user(value: &str) -> Option<&str> {
    let uri = match (value.find('<'), value.find('>')) {
        (Some(a), Some(b)) if a < b => &value[a + 1..b],
        _ => value.split(';').next().unwrap_or(value),
    };
    let rest = uri
        .strip_prefix("sips:")
        .or_else(|| uri.strip_prefix("sip:"))
        .or_else(|| uri.strip_prefix("tel:"))
        .unwrap_or(uri);
    let user = match rest.split_once('@') {
        Some((user, _)) => user,
        None if uri.starts_with("tel:") => rest,
        None => return None,
    };
    let user = user.split(';').next().unwrap_or(user);
    (!user.is_empty()).then_some(user)
}

/// Bare URI from a name-addr or Contact value.
pub fn addr_spec(value: &str) -> &str {
    match (value.find('<'), value.find('>')) {
        (Some(a), Some(b)) if a < b => &value[a + 1..b],
        _ => value.split(';').next().unwrap_or(value).trim(),
    }
}

/// `tag` parameter of a From/To header.
pub fn tag_param(value: &str) -> Option<&str> {
    let params = match value.rfind('>') {
        Some(i) => &value[i + 1..],
        None => value,
    };
    params.split(';').find_map(|p| {
        let (k, v) = p.trim().split_once('=')?;
        k.eq_ignore_ascii_case("tag").then_some(v)
    })
}

/// `branch` parameter of the top Via.
pub fn via_branch(value: &str) -> Option<&str> {
    value.split(';').find_map(|p| {
        let (k, v) = p.trim().split_once('=')?;
        k.eq_ignore_ascii_case("branch").then_some(v)
    })
}

/// Random token for tags and branches.
pub fn random_token() -> String {
    use rand::Rng;
    let n: u64 = rand::thread_rng().r#gen();
    format!("{n:016x}")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    const INVITE: &str = "INVITE sip:100@bridge.example SIP/2.0\r\n\
Via: SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bKabc\r\n\
v: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKproxy\r\n\
f: \"Alice\" <sip:alice@example.com>;tag=a1\r\n\
To: <sip:100@bridge.example>\r\n\
i: call-123@10.0.0.5\r\n\
CSeq: 1 INVITE\r\n\
Contact: <sip:alice@10.0.0.5:5060>\r\n\
Subject: a folded\r\n\
\x20subject line\r\n\
Content-Type: application/sdp\r\n\
Content-Length: 4\r\n\
\r\n\
v=0\ntrailing-garbage";

    fn invite() -> SipRequest {
        match SipMessage::parse(INVITE.as_bytes()).unwrap() {
            SipMessage::Request(r) => r,
            SipMessage::Response(_) => panic!("expected request"),
        }
    }

    #[test]
    fn parses_request_with_compact_headers() {
        let req = invite();
        assert_eq!(req.method, Method::Invite);
        assert_eq!(req.call_id(), Some("call-123@10.0.0.5"));
        assert_eq!(req.cseq(), Some((1, Method::Invite)));
        assert_eq!(req.headers.get_all("via").count(), 2);
        assert_eq!(req.called_user(), Some("100"));
        assert_eq!(req.caller_user(), Some("alice"));
        assert_eq!(req.headers.get("subject"), Some("a folded subject line"));
    }

    #[test]
    fn body_is_bounded_by_content_length() {
        assert_eq!(invite().body, "v=0\n");
    }

    #[test]
    fn parses_response() {
        let raw = "SIP/2.0 180 Ringing\r\nCall-ID: x\r\nCSeq: 1 INVITE\r\n\r\n";
        let SipMessage::Response(resp) = SipMessage::parse(raw.as_bytes()).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(resp.status, 180);
        assert_eq!(resp.reason, "Ringing");
        assert_eq!(resp.cseq(), Some((1, Method::Invite)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(SipMessage::parse(b"").is_err());
        assert!(SipMessage::parse(b"HELLO\r\n\r\n").is_err());
        assert!(SipMessage::parse(b"INVITE sip:x SIP/3.0\r\n\r\n").is_err());
        assert!(SipMessage::parse(b"INVITE sip:x SIP/2.0\r\nno colon here\r\n\r\n").is_err());
    }

    #[test]
    fn response_mirrors_dialog_headers_and_adds_tag() {
        let req = invite();
        let resp = SipResponse::for_request(&req, 200, "OK", Some("b2"));
        let text = resp.to_string();
        assert!(text.starts_with("SIP/2.0 200 OK\r\n"));
        let vias: Vec<_> = resp.headers.get_all("Via").collect();
        assert_eq!(vias.len(), 2);
        assert!(vias[0].contains("z9hG4bKabc"));
        assert_eq!(tag_param(resp.headers.get("To").unwrap()), Some("b2"));
        assert!(text.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn existing_to_tag_is_kept() {
        let mut req = invite();
        req.headers.set("To", "<sip:100@bridge.example>;tag=zz");
        let resp = SipResponse::for_request(&req, 487, "Request Terminated", Some("b2"));
        assert_eq!(tag_param(resp.headers.get("To").unwrap()), Some("zz"));
    }

    #[test]
    fn serialized_request_reparses() {
        let req = invite();
        let reparsed = SipMessage::parse(&req.to_bytes()).unwrap();
        let SipMessage::Request(r2) = reparsed else {
            panic!("expected request");
        };
        assert_eq!(r2.body, req.body);
        assert_eq!(r2.call_id(), req.call_id());
    }

    #[test]
    fn uri_helpers() {
        assert_eq!(uri_user("sip:100@host;transport=udp"), Some("100"));
        assert_eq!(uri_user("<sips:bob@host>;tag=1"), Some("bob"));
        assert_eq!(uri_user("tel:+15551234"), Some("+15551234"));
        assert_eq!(uri_user("sip:host.only"), None);
        assert_eq!(addr_spec("\"A\" <sip:a@h:5060>;tag=1"), "sip:a@h:5060");
        assert_eq!(tag_param("<sip:a@h;tag=inuri>;tag=real"), Some("real"));
        assert_eq!(tag_param("<sip:a@h>"), None);
        assert_eq!(via_branch("SIP/2.0/UDP h;branch=z9hG4bK1;rport"), Some("z9hG4bK1"));
    }

    #[test]
    fn random_tokens_differ() {
        assert_ne!(random_token(), random_token());
        assert_eq!(random_token().len(), 16);
    }
}
