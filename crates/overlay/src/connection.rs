//! Low-level TCP connection handling.
//!
//! This module provides the transport layer under each node:
//!
//! - [`Connection`] - a TCP stream during the handshake, read as header blocks
//! - [`ConnectionReader`] / [`ConnectionWriter`] - the two halves once the
//!   handshake is done, moving raw byte chunks
//! - [`Listener`] - accepts incoming TCP connections
//!
//! Message framing is not done here. A link may be compressed, so bytes go to
//! the node's receive stack untouched and the node frames what it inflates.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::{BytesCodec, Decoder, FramedRead, FramedWrite};
use tracing::{debug, trace};

use crate::error::HandshakeError;
use crate::{HostAddr, OverlayError, Result};

/// Largest header block accepted from a remote.
pub const MAX_HANDSHAKE_BLOCK: usize = 16 * 1024;

/// Direction of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    /// We dialed the remote.
    Outbound,
    /// The remote connected to us.
    Inbound,
}

impl ConnectionDirection {
    pub fn we_called_remote(&self) -> bool {
        matches!(self, ConnectionDirection::Outbound)
    }
}

/// Splits the handshake stream into header blocks, each ending with an
/// empty line.
#[derive(Debug, Clone)]
pub struct HandshakeCodec {
    max_size: usize,
}

impl HandshakeCodec {
    pub fn new(max_size: usize) -> Self {
        Self { max_size }
    }
}

impl Default for HandshakeCodec {
    fn default() -> Self {
        Self::new(MAX_HANDSHAKE_BLOCK)
    }
}

impl Decoder for HandshakeCodec {
    type Item = String;
    type Error = OverlayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        let end = src
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|i| i + 4)
            .or_else(|| src.windows(2).position(|w| w == b"\n\n").map(|i| i + 2));
        match end {
            Some(end) if end <= self.max_size => {
                let block = src.split_to(end);
                Ok(Some(String::from_utf8_lossy(&block).into_owned()))
            }
            Some(_) => Err(HandshakeError::TooLarge.into()),
            None if src.len() > self.max_size => Err(HandshakeError::TooLarge.into()),
            None => Ok(None),
        }
    }
}

/// A TCP connection going through the handshake.
pub struct Connection {
    reader: FramedRead<OwnedReadHalf, HandshakeCodec>,
    writer: OwnedWriteHalf,
    remote_addr: SocketAddr,
    direction: ConnectionDirection,
}

impl Connection {
    /// Wraps an established TCP stream.
    pub fn new(stream: TcpStream, direction: ConnectionDirection) -> Result<Self> {
        let remote_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (read, writer) = stream.into_split();
        Ok(Self {
            reader: FramedRead::new(read, HandshakeCodec::default()),
            writer,
            remote_addr,
            direction,
        })
    }

    /// Dials `addr`.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionTimeout` if the connection is not established
    /// within `timeout_secs`, or `ConnectionFailed` for other errors.
    pub async fn connect(addr: HostAddr, timeout_secs: u64) -> Result<Self> {
        debug!("Connecting to {}", addr);
        let stream = timeout(
            Duration::from_secs(timeout_secs),
            TcpStream::connect(addr.to_socket_addr()),
        )
        .await
        .map_err(|_| OverlayError::ConnectionTimeout(addr.to_string()))?
        .map_err(|e| OverlayError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        Self::new(stream, ConnectionDirection::Outbound)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn direction(&self) -> ConnectionDirection {
        self.direction
    }

    pub fn we_called_remote(&self) -> bool {
        self.direction.we_called_remote()
    }

    /// Reads the next header block.
    pub async fn read_block(&mut self, timeout_secs: u64) -> Result<String> {
        match timeout(Duration::from_secs(timeout_secs), self.reader.next()).await {
            Err(_) => Err(OverlayError::ConnectionTimeout(self.remote_addr.to_string())),
            Ok(None) => Err(OverlayError::PeerDisconnected(self.remote_addr.to_string())),
            Ok(Some(block)) => {
                let block = block?;
                trace!("{} sent {} handshake bytes", self.remote_addr, block.len());
                Ok(block)
            }
        }
    }

    /// Writes handshake text.
    pub async fn write_text(&mut self, text: &str) -> Result<()> {
        self.writer.write_all(text.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Splits into raw byte halves. Bytes already read past the last header
    /// block are kept for the reader.
    pub fn into_split(self) -> (ConnectionReader, ConnectionWriter) {
        let remote_addr = self.remote_addr;
        (
            ConnectionReader {
                framed: self.reader.map_decoder(|_| BytesCodec::new()),
                remote_addr,
            },
            ConnectionWriter {
                framed: FramedWrite::new(self.writer, BytesCodec::new()),
                remote_addr,
            },
        )
    }
}

/// Receiving half of an established connection.
pub struct ConnectionReader {
    framed: FramedRead<OwnedReadHalf, BytesCodec>,
    remote_addr: SocketAddr,
}

impl ConnectionReader {
    /// Next chunk of bytes, or `None` on EOF.
    pub async fn recv(&mut self) -> Result<Option<BytesMut>> {
        match self.framed.next().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

/// Sending half of an established connection.
pub struct ConnectionWriter {
    framed: FramedWrite<OwnedWriteHalf, BytesCodec>,
    remote_addr: SocketAddr,
}

impl ConnectionWriter {
    pub async fn send(&mut self, data: Bytes) -> Result<()> {
        self.framed.send(data).await?;
        Ok(())
    }

    pub async fn close(&mut self) {
        let _ = SinkExt::<Bytes>::close(&mut self.framed).await;
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

/// TCP listener for incoming connections.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Binds to `addr`.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the port is already in use or binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        debug!("Listening on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts the next incoming connection.
    pub async fn accept(&self) -> Result<Connection> {
        let (stream, remote_addr) = self.listener.accept().await?;
        debug!("Accepted connection from {}", remote_addr);
        Connection::new(stream, ConnectionDirection::Inbound)
    }
}
