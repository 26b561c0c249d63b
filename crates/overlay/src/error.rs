//! Error types for overlay operations.
//!
//! [`OverlayError`] covers everything the engine can report to its caller:
//!
//! - Connection failures and timeouts
//! - Handshake refusals and malformed handshake text
//! - Framing errors on the message stream
//! - Node table and host cache errors
//!
//! [`HandshakeError`] is kept separate because the node state machine inspects
//! it to decide which host cache category a failed peer lands in.

use thiserror::Error;

use crate::NodeId;

/// Errors that can occur during overlay operations.
#[derive(Debug, Error)]
pub enum OverlayError {
    // ===== Connection Errors =====
    /// TCP connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection attempt timed out.
    #[error("connection timeout: {0}")]
    ConnectionTimeout(String),

    /// The peer closed the connection.
    #[error("peer disconnected: {0}")]
    PeerDisconnected(String),

    // ===== Protocol Errors =====
    /// Handshake negotiation failed.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Message framing failed.
    #[error("message error: {0}")]
    Message(String),

    /// Received a malformed message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Compression or decompression stream failure.
    #[error("compression error: {0}")]
    Compression(String),

    // ===== Node Errors =====
    /// Cannot accept more connections (limit reached).
    #[error("connection limit reached")]
    PeerLimitReached,

    /// The node is not in the table.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// Already have a connection to this address.
    #[error("already connected to {0}")]
    AlreadyConnected(String),

    /// Address is unusable for a peer connection.
    #[error("invalid host address: {0}")]
    InvalidAddress(String),

    // ===== Database Errors =====
    /// Host cache persistence failed.
    #[error("database error: {0}")]
    DatabaseError(String),

    // ===== Wrapped Errors =====
    /// Low-level I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Internal Errors =====
    /// Internal channel send failed (receiver dropped).
    #[error("channel send error")]
    ChannelSend,

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl OverlayError {
    /// Returns true if this error is transient and a later attempt may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            OverlayError::ConnectionFailed(_)
                | OverlayError::ConnectionTimeout(_)
                | OverlayError::Io(_)
        ) || matches!(self, OverlayError::Handshake(e) if e.is_busy())
    }

    /// Returns true if the peer speaks something we can never talk to.
    pub fn is_fatal(&self) -> bool {
        matches!(self, OverlayError::Handshake(e) if e.is_alien())
    }
}

impl From<rusqlite::Error> for OverlayError {
    fn from(e: rusqlite::Error) -> Self {
        OverlayError::DatabaseError(e.to_string())
    }
}

/// Handshake failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// First line was not a `GNUTELLA CONNECT/x.y` greeting.
    #[error("malformed greeting: {0:?}")]
    MalformedGreeting(String),

    /// First line of a reply was not a `GNUTELLA/x.y code message` status.
    #[error("malformed status line: {0:?}")]
    MalformedStatus(String),

    /// A header line had no `Name:` part.
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    /// Header block exceeded the line limit.
    #[error("header block too large")]
    TooLarge,

    /// Remote speaks an older protocol.
    #[error("protocol version {major}.{minor} not supported")]
    VersionMismatch { major: u8, minor: u8 },

    /// Remote answered with a non-200 status.
    #[error("refused with {code} {message}")]
    Refused { code: u16, message: String },

    /// Remote sent no `User-Agent` header.
    #[error("missing User-Agent header")]
    MissingUserAgent,

    /// Both sides want the same subordinate role.
    #[error("role conflict: {0}")]
    RoleConflict(String),

    /// Handshake text arrived in a state that does not expect it.
    #[error("unexpected handshake step while {0}")]
    UnexpectedStep(&'static str),
}

impl HandshakeError {
    /// Status code sent back to the remote when refusing.
    pub fn status_code(&self) -> u16 {
        match self {
            HandshakeError::RoleConflict(_) => 204,
            HandshakeError::Refused { code, .. } => *code,
            HandshakeError::UnexpectedStep(_) => 500,
            _ => 400,
        }
    }

    /// The remote is up but refused us for lack of slots.
    pub fn is_busy(&self) -> bool {
        matches!(self, HandshakeError::Refused { code: 503, .. })
    }

    /// The remote does not speak our protocol.
    pub fn is_alien(&self) -> bool {
        matches!(
            self,
            HandshakeError::MalformedGreeting(_)
                | HandshakeError::MalformedStatus(_)
                | HandshakeError::VersionMismatch { .. }
        )
    }
}
