//! Connection and routing engine for a Gnutella-style overlay node.
//!
//! This crate implements the part of a servent that sits between raw TCP
//! connections and message routing. It provides:
//!
//! - **Host cache** - categorised, bounded sets of known peer addresses with
//!   freshness-based eviction and optional SQLite persistence
//! - **Connection state machine** - handshake, establishment, shutdown and
//!   removal of each peer connection, with the node owning all of its
//!   per-connection resources
//! - **Egress queueing** - prioritised per-node send queues with watermark
//!   flow control, "swift" mode shedding and optional deflate compression
//! - **Ping/pong reduction** - per-node ping throttling and pong demand
//!   accounting so pings are answered from a cache instead of flooded
//! - **Remote flow control monitoring** - how often a peer asks us to stop
//!   sending queries, and disconnection when it does so too much
//!
//! # Architecture
//!
//! - [`Overlay`] - owns the node table, the [`HostCache`] and the
//!   [`RoutingTable`]. It is synchronous; time is passed in explicitly.
//! - [`Node`] - a single peer connection and its state machine
//! - [`OverlayDriver`] - the tokio side: listener, dialing, per-connection
//!   reader/writer tasks and the one-second tick, all feeding one engine task
//!
//! # Example
//!
//! ```rust,no_run
//! use gnet_overlay::{current_timestamp, Overlay, OverlayConfig, OverlayDriver};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OverlayConfig::default();
//! let overlay = Overlay::new(config, current_timestamp())?;
//! let driver = OverlayDriver::bind(overlay).await?;
//! driver.run(async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! # Ok(())
//! # }
//! ```

mod codec;
mod compress;
mod connection;
mod driver;
mod egress;
mod error;
mod flow_monitor;
mod handshake;
mod host_cache;
mod node;
mod overlay;
mod ping_pong;
mod routing;

pub use codec::{
    helpers as message_helpers, parse_bye, Message, MessageCodec, MessageFunction, MessageHeader,
    Muid, PongInfo, DEFAULT_MAX_PAYLOAD, HEADER_SIZE,
};
pub use compress::{compression_ratio, RxInflater, TxDeflater};
pub use connection::{
    Connection, ConnectionDirection, ConnectionReader, ConnectionWriter, HandshakeCodec, Listener,
};
pub use driver::{DriverEvent, OverlayDriver};
pub use egress::{
    EgressQueue, EnqueueResult, MessagePriority, QueueConfig, QueueStats, SwiftTiming,
};
pub use error::{HandshakeError, OverlayError};
pub use flow_monitor::{FlowControlMonitor, MonitorTick, FC_HALF_PERIOD};
pub use handshake::{
    negotiate, HandshakeRequest, HandshakeResponse, HeaderMap, LocalNodeInfo,
    NegotiatedCapabilities, ProtocolVersion, VendorCode,
};
pub use host_cache::{
    HostCache, HostCacheConfig, HostCacheEntry, HostCacheStats, HostCategory, HostType,
};
pub use node::{
    ConnectionFlags, DropReason, Inbound, Node, NodeAttributes, NodeId, NodeSettings, NodeStats,
    NodeStatus, NodeTick, PeerRole, QrtTransferId, QueryRouting, QueryTableId, SendOutcome,
    Transport, HOPS_FLOW_UNLIMITED,
};
pub use overlay::{HandshakeOutcome, HandshakeStep, NodeSnapshot, Overlay, OverlayStats};
pub use ping_pong::{
    PingPongState, PingVerdict, MAX_CACHE_HOPS, MAX_PONGS, PING_LEAF_THROTTLE, PING_REG_THROTTLE,
};
pub use routing::{RouteTable, RouteTableStats, RoutingTable};

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Result type for overlay operations.
pub type Result<T> = std::result::Result<T, OverlayError>;

/// Configuration for the overlay engine and its driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// Whether to accept incoming connections.
    pub listen_enabled: bool,

    /// Address the listener binds to.
    pub listen_addr: SocketAddr,

    /// Maximum number of nodes, connecting ones included.
    ///
    /// Incoming connections beyond this are closed at once.
    pub max_connections: usize,

    /// Number of connections the driver tries to keep by dialing hosts from
    /// the host cache.
    pub target_connections: usize,

    /// TCP connect timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Time allowed for the whole handshake, in seconds.
    pub handshake_timeout_secs: u64,

    /// Grace period between entering shutdown and removal, in seconds.
    ///
    /// Leaves the peer time to read our Bye.
    pub shutdown_delay_secs: u64,

    /// Messages whose TTL plus hops exceed this are dropped.
    pub hard_ttl_limit: u8,

    /// Percentage of time a peer may keep us flow-controlled before we drop
    /// it.
    pub rx_fc_ratio: u32,

    /// Largest accepted message payload, in bytes.
    pub max_payload_size: u32,

    /// How long request routes are remembered, in seconds.
    pub route_ttl_secs: u64,

    /// Bytes handed to a connection's writer at a time.
    pub write_chunk_size: usize,

    pub queue: QueueConfig,

    pub host_cache: HostCacheConfig,

    /// What we announce about ourselves during handshakes.
    pub local: LocalNodeInfo,

    /// SQLite file for the host cache. In-memory only when unset.
    pub host_cache_db: Option<PathBuf>,

    /// Bootstrap hosts as `ip:port` strings.
    pub known_hosts: Vec<String>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            listen_enabled: true,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_connections: 32,
            target_connections: 8,
            connect_timeout_secs: 10,
            handshake_timeout_secs: 30,
            shutdown_delay_secs: 15,
            hard_ttl_limit: 7,
            rx_fc_ratio: 50,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            route_ttl_secs: routing::DEFAULT_ROUTE_TTL_SECS,
            write_chunk_size: 16 * 1024,
            queue: QueueConfig::default(),
            host_cache: HostCacheConfig::default(),
            local: LocalNodeInfo::default(),
            host_cache_db: None,
            known_hosts: Vec::new(),
        }
    }
}

/// Standard servent port.
pub const DEFAULT_PORT: u16 = 6346;

/// Address of a peer: IP and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostAddr {
    pub ip: IpAddr,
    pub port: u16,
}

impl HostAddr {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Returns true if the address can be reached across the Internet.
    ///
    /// Port 0 and unspecified, multicast, broadcast and link-local addresses
    /// never are. Private and loopback ranges are accepted only with
    /// `allow_private`.
    pub fn is_routable(&self, allow_private: bool) -> bool {
        if self.port == 0 || self.ip.is_unspecified() || self.ip.is_multicast() {
            return false;
        }
        match self.ip {
            IpAddr::V4(v4) => {
                if v4.is_broadcast() || v4.is_link_local() || v4.is_documentation() {
                    return false;
                }
                allow_private || !(v4.is_private() || v4.is_loopback())
            }
            IpAddr::V6(v6) => {
                let first = v6.segments()[0];
                // fe80::/10
                if first & 0xffc0 == 0xfe80 {
                    return false;
                }
                // fc00::/7
                let unique_local = first & 0xfe00 == 0xfc00;
                allow_private || !(unique_local || v6.is_loopback())
            }
        }
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

impl FromStr for HostAddr {
    type Err = OverlayError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<SocketAddr>()
            .map(Self::from)
            .map_err(|_| OverlayError::InvalidAddress(s.to_string()))
    }
}

impl From<SocketAddr> for HostAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

/// Seconds since the Unix epoch.
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
