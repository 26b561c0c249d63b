//! Text handshake and capability negotiation.
//!
//! A connection starts with a three-step exchange of HTTP-like header
//! blocks:
//!
//! ```text
//! initiator -> GNUTELLA CONNECT/0.6   + headers
//! acceptor  -> GNUTELLA/0.6 200 OK    + headers
//! initiator -> GNUTELLA/0.6 200 OK    + headers
//! ```
//!
//! Each block ends with an empty line. The acceptor learns the initiator's
//! capabilities from the greeting, the initiator learns the acceptor's from
//! the welcome, and the final acknowledgement only confirms the stream
//! encoding the initiator will use.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::HandshakeError;
use crate::node::{NodeAttributes, PeerRole};
use crate::HostAddr;

/// Greeting prefix of a connection request.
pub const GNUTELLA_HELLO: &str = "GNUTELLA CONNECT/";

/// Prefix of a status line.
pub const GNUTELLA_STATUS: &str = "GNUTELLA/";

/// Maximum number of lines accepted in one header block.
pub const MAX_HEADER_LINES: usize = 64;

/// Protocol version exchanged during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl ProtocolVersion {
    /// The version we speak.
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 0, minor: 6 };

    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Parses `major.minor`, ignoring anything after the minor number.
    pub fn parse(text: &str) -> Option<Self> {
        let (major, rest) = text.trim().split_once('.')?;
        let minor: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Four-letter vendor code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VendorCode(pub [u8; 4]);

impl VendorCode {
    /// Parses a code of exactly four ASCII characters.
    pub fn parse(text: &str) -> Option<Self> {
        let bytes = text.trim().as_bytes();
        if bytes.len() != 4 || !bytes.iter().all(|b| b.is_ascii_graphic()) {
            return None;
        }
        let mut code = [0u8; 4];
        code.copy_from_slice(bytes);
        Some(Self(code))
    }

    /// Guesses the code from a `User-Agent` string.
    pub fn from_user_agent(agent: &str) -> Option<Self> {
        const KNOWN: &[(&str, &str)] = &[
            ("gtk-gnutella", "GTKG"),
            ("limewire", "LIME"),
            ("bearshare", "BEAR"),
            ("shareaza", "RAZA"),
            ("morpheus", "MRPH"),
            ("phex", "PHEX"),
            ("gnucleus", "GNUC"),
            ("gnet", "GNET"),
        ];
        let lower = agent.to_ascii_lowercase();
        if let Some((_, code)) = KNOWN.iter().find(|(name, _)| lower.starts_with(name)) {
            return Self::parse(code);
        }
        let letters: String = agent
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(4)
            .map(|c| c.to_ascii_uppercase())
            .collect();
        Self::parse(&letters)
    }
}

impl fmt::Display for VendorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for VendorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VendorCode({})", self)
    }
}

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header. A repeated name is merged into a comma-separated list.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some((_, existing)) => {
                existing.push_str(", ");
                existing.push_str(&value);
            }
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Reads a `True`/`False` header.
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)?.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    /// Reads a header whose value starts with a `major.minor` version.
    pub fn get_version(&self, name: &str) -> Option<ProtocolVersion> {
        ProtocolVersion::parse(self.get(name)?)
    }

    pub fn get_number<T: std::str::FromStr>(&self, name: &str) -> Option<T> {
        self.get(name)?.trim().parse().ok()
    }

    /// Returns true if the comma-separated header lists `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get(name).is_some_and(|value| {
            value.split(',').any(|item| {
                let item = item.trim();
                let item = item.split(|c: char| c == '/' || c == ';').next().unwrap_or(item);
                item.trim().eq_ignore_ascii_case(token)
            })
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    fn parse_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Self, HandshakeError> {
        let mut headers = HeaderMap::new();
        let mut last: Option<usize> = None;
        for (count, line) in lines.enumerate() {
            if line.is_empty() {
                break;
            }
            if count >= MAX_HEADER_LINES {
                return Err(HandshakeError::TooLarge);
            }
            if line.starts_with(|c: char| c == ' ' || c == '\t') {
                let idx = last.ok_or_else(|| HandshakeError::MalformedHeader(line.to_string()))?;
                let value = &mut headers.entries[idx].1;
                value.push(' ');
                value.push_str(line.trim());
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HandshakeError::MalformedHeader(line.to_string()))?;
            let name = name.trim();
            if name.is_empty() || name.contains(' ') {
                return Err(HandshakeError::MalformedHeader(line.to_string()));
            }
            headers.insert(name, value.trim());
            last = headers
                .entries
                .iter()
                .position(|(n, _)| n.eq_ignore_ascii_case(name));
        }
        Ok(headers)
    }

    fn write_to(&self, out: &mut String) {
        for (name, value) in &self.entries {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
    }
}

fn split_lines(block: &str) -> impl Iterator<Item = &str> {
    block.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l))
}

/// A `GNUTELLA CONNECT` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub version: ProtocolVersion,
    pub headers: HeaderMap,
}

impl HandshakeRequest {
    /// Parses a full request block.
    pub fn parse(block: &str) -> Result<Self, HandshakeError> {
        let mut lines = split_lines(block);
        let first = lines.next().unwrap_or_default();
        let version = first
            .strip_prefix(GNUTELLA_HELLO)
            .and_then(ProtocolVersion::parse)
            .ok_or_else(|| HandshakeError::MalformedGreeting(first.to_string()))?;
        let headers = HeaderMap::parse_lines(lines)?;
        Ok(Self { version, headers })
    }

    pub fn to_wire(&self) -> String {
        let mut out = format!("{}{}\r\n", GNUTELLA_HELLO, self.version);
        self.headers.write_to(&mut out);
        out
    }
}

/// A `GNUTELLA/x.y code message` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub version: ProtocolVersion,
    pub code: u16,
    pub message: String,
    pub headers: HeaderMap,
}

impl HandshakeResponse {
    /// A `200 OK` reply.
    pub fn ok(headers: HeaderMap) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            code: 200,
            message: "OK".to_string(),
            headers,
        }
    }

    /// A refusal without headers.
    pub fn refusal(code: u16, message: impl Into<String>) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            code,
            message: message.into(),
            headers: HeaderMap::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 200
    }

    /// Parses a full reply block.
    pub fn parse(block: &str) -> Result<Self, HandshakeError> {
        let mut lines = split_lines(block);
        let first = lines.next().unwrap_or_default();
        let malformed = || HandshakeError::MalformedStatus(first.to_string());
        let rest = first.strip_prefix(GNUTELLA_STATUS).ok_or_else(malformed)?;
        let (version, rest) = rest.split_once(' ').ok_or_else(malformed)?;
        let version = ProtocolVersion::parse(version).ok_or_else(malformed)?;
        let (code, message) = rest.split_once(' ').unwrap_or((rest, ""));
        let code = code.trim().parse().map_err(|_| malformed())?;
        let headers = HeaderMap::parse_lines(lines)?;
        Ok(Self {
            version,
            code,
            message: message.trim().to_string(),
            headers,
        })
    }

    pub fn to_wire(&self) -> String {
        let mut out = format!("{}{} {} {}\r\n", GNUTELLA_STATUS, self.version, self.code, self.message);
        self.headers.write_to(&mut out);
        out
    }

    /// Turns a non-200 reply into an error.
    pub fn check(&self) -> Result<(), HandshakeError> {
        if self.is_success() {
            Ok(())
        } else {
            Err(HandshakeError::Refused {
                code: self.code,
                message: self.message.clone(),
            })
        }
    }
}

/// Identity and preferences of the local node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalNodeInfo {
    pub user_agent: String,
    pub vendor_code: String,
    /// Run as an ultrapeer; leaves only connect to ultrapeers.
    pub ultrapeer: bool,
    /// Offer and accept deflated streams.
    pub compression: bool,
    /// Address advertised to peers and in our pongs.
    pub listen_addr: Option<SocketAddr>,
    pub max_ttl: u8,
    pub degree: u16,
    pub query_routing: bool,
    pub shared_files: u32,
    pub shared_kbytes: u32,
}

impl Default for LocalNodeInfo {
    fn default() -> Self {
        Self {
            user_agent: format!("gnet/{}", env!("CARGO_PKG_VERSION")),
            vendor_code: "GNET".to_string(),
            ultrapeer: true,
            compression: true,
            listen_addr: None,
            max_ttl: 7,
            degree: 32,
            query_routing: true,
            shared_files: 0,
            shared_kbytes: 0,
        }
    }
}

impl LocalNodeInfo {
    /// Headers sent in both the request and the welcome.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("User-Agent", self.user_agent.clone());
        headers.insert("X-Vendor-Code", self.vendor_code.clone());
        if let Some(addr) = self.listen_addr {
            headers.insert("Listen-IP", addr.to_string());
        }
        headers.insert("X-Ultrapeer", if self.ultrapeer { "True" } else { "False" });
        if self.query_routing {
            headers.insert("X-Query-Routing", "0.2");
            if self.ultrapeer {
                headers.insert("X-Ultrapeer-Query-Routing", "0.1");
            }
        }
        headers.insert("Pong-Caching", "0.1");
        headers.insert("Bye-Packet", "0.1");
        headers.insert("GGEP", "0.5");
        headers.insert("Vendor-Message", "0.1");
        headers.insert("X-Dynamic-Querying", "0.1");
        headers.insert("X-Max-TTL", self.max_ttl.to_string());
        headers.insert("X-Degree", self.degree.to_string());
        if self.compression {
            headers.insert("Accept-Encoding", "deflate");
        }
        headers
    }

    /// Our connection request.
    pub fn request(&self) -> HandshakeRequest {
        HandshakeRequest {
            version: ProtocolVersion::CURRENT,
            headers: self.headers(),
        }
    }

    /// Our reply to an accepted request.
    pub fn welcome(&self, negotiated: &NegotiatedCapabilities) -> HandshakeResponse {
        let mut headers = self.headers();
        if negotiated.attributes.tx_deflate {
            headers.insert("Content-Encoding", "deflate");
        }
        HandshakeResponse::ok(headers)
    }

    /// Final acknowledgement of an outgoing handshake.
    pub fn final_ack(&self, negotiated: &NegotiatedCapabilities) -> HandshakeResponse {
        let mut headers = HeaderMap::new();
        if negotiated.attributes.tx_deflate {
            headers.insert("Content-Encoding", "deflate");
        }
        HandshakeResponse::ok(headers)
    }
}

/// What the remote announced and what was agreed on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiatedCapabilities {
    pub version: ProtocolVersion,
    pub vendor: String,
    pub vendor_code: Option<VendorCode>,
    pub role: PeerRole,
    pub attributes: NodeAttributes,
    pub query_routing: Option<ProtocolVersion>,
    pub ultra_query_routing: Option<ProtocolVersion>,
    pub max_ttl: Option<u8>,
    pub degree: Option<u16>,
    pub listen_addr: Option<HostAddr>,
    pub ultrapeer_needed: Option<bool>,
    pub crawler: bool,
}

/// Checks the remote's announced `version` and `headers` against our own
/// settings.
pub fn negotiate(
    local: &LocalNodeInfo,
    version: ProtocolVersion,
    headers: &HeaderMap,
) -> Result<NegotiatedCapabilities, HandshakeError> {
    if version < ProtocolVersion::CURRENT {
        return Err(HandshakeError::VersionMismatch {
            major: version.major,
            minor: version.minor,
        });
    }

    let crawler = headers.get("Crawler").is_some();
    let vendor = match headers.get("User-Agent") {
        Some(agent) if !agent.trim().is_empty() => agent.trim().to_string(),
        _ => return Err(HandshakeError::MissingUserAgent),
    };
    let vendor_code = headers
        .get("X-Vendor-Code")
        .and_then(VendorCode::parse)
        .or_else(|| VendorCode::from_user_agent(&vendor));

    let role = match (local.ultrapeer, headers.get_bool("X-Ultrapeer")) {
        (_, None) => PeerRole::Normal,
        (_, Some(true)) => PeerRole::Ultra,
        (true, Some(false)) => PeerRole::Leaf,
        (false, Some(false)) if crawler => PeerRole::Normal,
        (false, Some(false)) => {
            return Err(HandshakeError::RoleConflict(
                "shielded leaf cannot connect to a leaf".to_string(),
            ))
        }
    };

    let query_routing = headers.get_version("X-Query-Routing");
    let ultra_query_routing = headers.get_version("X-Ultrapeer-Query-Routing");
    let can_inflate = headers.has_token("Accept-Encoding", "deflate");

    let attributes = NodeAttributes {
        bye_packet: headers.get_version("Bye-Packet").is_some(),
        pong_caching: headers.get_version("Pong-Caching").is_some(),
        can_ggep: headers.get_version("GGEP").is_some(),
        can_vendor: headers.get_version("Vendor-Message").is_some(),
        can_qrp: query_routing.is_some(),
        up_qrp: ultra_query_routing.is_some(),
        can_hsep: headers.has_token("X-Features", "hsep"),
        leaf_guide: headers.get_version("X-Dynamic-Querying").is_some(),
        can_ultra: headers.get_bool("X-Ultrapeer").is_some(),
        can_inflate,
        tx_deflate: can_inflate && local.compression,
        rx_inflate: headers.has_token("Content-Encoding", "deflate"),
    };

    let listen_addr = headers
        .get("Listen-IP")
        .or_else(|| headers.get("X-My-Address"))
        .and_then(|v| v.trim().parse::<HostAddr>().ok());

    Ok(NegotiatedCapabilities {
        version,
        vendor,
        vendor_code,
        role,
        attributes,
        query_routing,
        ultra_query_routing,
        max_ttl: headers.get_number("X-Max-TTL"),
        degree: headers.get_number("X-Degree"),
        listen_addr,
        ultrapeer_needed: headers.get_bool("X-Ultrapeer-Needed"),
        crawler,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote_headers(ultra: bool) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("User-Agent", "gtk-gnutella/1.2.2");
        h.insert("X-Ultrapeer", if ultra { "True" } else { "False" });
        h.insert("Accept-Encoding", "deflate");
        h.insert("Bye-Packet", "0.1");
        h.insert("X-Query-Routing", "0.2");
        h.insert("Listen-IP", "1.2.3.4:6346");
        h
    }

    #[test]
    fn test_request_wire_format() {
        let local = LocalNodeInfo::default();
        let wire = local.request().to_wire();
        assert!(wire.starts_with("GNUTELLA CONNECT/0.6\r\n"));
        assert!(wire.contains("\r\nUser-Agent: gnet/"));
        assert!(wire.ends_with("\r\n\r\n"));

        let parsed = HandshakeRequest::parse(&wire).unwrap();
        assert_eq!(parsed.version, ProtocolVersion::CURRENT);
        assert_eq!(parsed.headers.get("x-ultrapeer"), Some("True"));
    }

    #[test]
    fn test_parse_greeting_errors() {
        let err = HandshakeRequest::parse("HTTP/1.1 GET /\r\n\r\n").unwrap_err();
        assert!(matches!(err, HandshakeError::MalformedGreeting(_)));

        let err = HandshakeRequest::parse("GNUTELLA CONNECT/0.6\r\nno colon here\r\n\r\n").unwrap_err();
        assert!(matches!(err, HandshakeError::MalformedHeader(_)));
    }

    #[test]
    fn test_parse_status_line() {
        let resp = HandshakeResponse::parse("GNUTELLA/0.6 503 Service Unavailable\r\nX-Try: 1.1.1.1:1\r\n\r\n").unwrap();
        assert_eq!(resp.code, 503);
        assert_eq!(resp.message, "Service Unavailable");
        assert!(resp.check().unwrap_err().is_busy());

        assert!(matches!(
            HandshakeResponse::parse("GNUTELLA/0.6 abc\r\n\r\n").unwrap_err(),
            HandshakeError::MalformedStatus(_)
        ));
    }

    #[test]
    fn test_continuation_and_repeated_headers() {
        let block = "GNUTELLA CONNECT/0.6\r\nUser-Agent: foo\r\n  bar\r\nAccept-Encoding: gzip\r\naccept-encoding: deflate\r\n\r\n";
        let req = HandshakeRequest::parse(block).unwrap();
        assert_eq!(req.headers.get("User-Agent"), Some("foo bar"));
        assert!(req.headers.has_token("Accept-Encoding", "deflate"));
        assert_eq!(req.headers.len(), 2);
    }

    #[test]
    fn test_too_many_headers() {
        let mut block = String::from("GNUTELLA CONNECT/0.6\r\n");
        for i in 0..=MAX_HEADER_LINES {
            block.push_str(&format!("X-H{}: v\r\n", i));
        }
        block.push_str("\r\n");
        assert_eq!(HandshakeRequest::parse(&block).unwrap_err(), HandshakeError::TooLarge);
    }

    #[test]
    fn test_negotiate_ultra_to_leaf() {
        let local = LocalNodeInfo::default();
        let caps = negotiate(&local, ProtocolVersion::CURRENT, &remote_headers(false)).unwrap();
        assert_eq!(caps.role, PeerRole::Leaf);
        assert!(caps.attributes.tx_deflate);
        assert!(caps.attributes.bye_packet);
        assert!(caps.attributes.can_qrp);
        assert!(!caps.attributes.rx_inflate);
        assert_eq!(caps.vendor_code.unwrap().to_string(), "GTKG");
        assert_eq!(caps.listen_addr, Some("1.2.3.4:6346".parse().unwrap()));
    }

    #[test]
    fn test_negotiate_leaf_to_leaf_conflict() {
        let local = LocalNodeInfo {
            ultrapeer: false,
            ..Default::default()
        };
        let err = negotiate(&local, ProtocolVersion::CURRENT, &remote_headers(false)).unwrap_err();
        assert!(matches!(err, HandshakeError::RoleConflict(_)));
        assert_eq!(err.status_code(), 204);
    }

    #[test]
    fn test_negotiate_rejects_old_version() {
        let err = negotiate(
            &LocalNodeInfo::default(),
            ProtocolVersion::new(0, 4),
            &remote_headers(true),
        )
        .unwrap_err();
        assert_eq!(err, HandshakeError::VersionMismatch { major: 0, minor: 4 });
    }

    #[test]
    fn test_negotiate_requires_user_agent() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Ultrapeer", "True");
        let err = negotiate(&LocalNodeInfo::default(), ProtocolVersion::CURRENT, &headers).unwrap_err();
        assert_eq!(err, HandshakeError::MissingUserAgent);
    }

    #[test]
    fn test_no_compression_when_disabled_locally() {
        let local = LocalNodeInfo {
            compression: false,
            ..Default::default()
        };
        let caps = negotiate(&local, ProtocolVersion::CURRENT, &remote_headers(true)).unwrap();
        assert!(caps.attributes.can_inflate);
        assert!(!caps.attributes.tx_deflate);
        assert!(local.welcome(&caps).headers.get("Content-Encoding").is_none());
        assert!(!local.request().headers.has_token("Accept-Encoding", "deflate"));
    }

    #[test]
    fn test_vendor_code_guess() {
        assert_eq!(VendorCode::from_user_agent("LimeWire/4.12").unwrap().to_string(), "LIME");
        assert_eq!(VendorCode::from_user_agent("Foo-Bar 1.0").unwrap().to_string(), "FOOB");
        assert!(VendorCode::from_user_agent("ab").is_none());
    }
}
