//! Per-peer connection state machine.
//!
//! A [`Node`] owns everything specific to one peer connection: its egress
//! queue, its remote flow-control monitor, its ping/pong accounting, its
//! receive stack and the transport handle. Status moves strictly forward:
//!
//! ```text
//! Connecting -> HelloSent ----------.
//!                                    +--> Connected -> Shutdown -> Removing
//! ReceivingHello -> WelcomeSent -----'         \___________________/^
//! ```
//!
//! Any handshake failure, EOF or timeout goes straight to `Removing`. Removal
//! releases every owned resource synchronously and closes the transport
//! exactly once; the owning [`Overlay`](crate::Overlay) then drops the node
//! from its table and from the shared routing state.

use std::fmt;
use std::io::{self, Write};

use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tracing::{debug, info, trace, warn};

use crate::codec::{parse_bye, Message, MessageCodec, MessageFunction, PongInfo, HEADER_SIZE};
use crate::compress::{compression_ratio, RxInflater};
use crate::egress::{EgressQueue, EnqueueResult, QueueConfig, SwiftTiming};
use crate::error::HandshakeError;
use crate::flow_monitor::{FlowControlMonitor, MonitorTick};
use crate::handshake::{
    negotiate, HandshakeRequest, HandshakeResponse, LocalNodeInfo, NegotiatedCapabilities,
    ProtocolVersion, VendorCode,
};
use crate::host_cache::HostType;
use crate::ping_pong::{PingPongState, PingVerdict, PING_LEAF_THROTTLE, PING_REG_THROTTLE};
use crate::routing::RoutingTable;
use crate::{HostAddr, OverlayConfig, Result};

/// Hops-flow value meaning "send me everything".
pub const HOPS_FLOW_UNLIMITED: u8 = 255;

/// Identifier of a node in the overlay table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Pseudo node standing for ourselves in routing tables.
    pub const LOCAL: NodeId = NodeId(0);
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    /// Outgoing TCP connection in progress.
    Connecting,
    /// Outgoing: our greeting is out, waiting for the welcome.
    HelloSent,
    /// Incoming: our welcome is out, waiting for the final acknowledgement.
    WelcomeSent,
    /// Incoming: waiting for the remote's greeting.
    ReceivingHello,
    Connected,
    /// Closing down; no new traffic is accepted.
    Shutdown,
    Removing,
}

impl NodeStatus {
    /// Handshake still in progress.
    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            NodeStatus::Connecting
                | NodeStatus::HelloSent
                | NodeStatus::WelcomeSent
                | NodeStatus::ReceivingHello
        )
    }

    /// Handshake done and not yet removed.
    pub fn is_connected(self) -> bool {
        matches!(self, NodeStatus::Connected | NodeStatus::Shutdown)
    }

    pub fn name(self) -> &'static str {
        match self {
            NodeStatus::Connecting => "connecting",
            NodeStatus::HelloSent => "hello sent",
            NodeStatus::WelcomeSent => "welcome sent",
            NodeStatus::ReceivingHello => "receiving hello",
            NodeStatus::Connected => "connected",
            NodeStatus::Shutdown => "shutdown",
            NodeStatus::Removing => "removing",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Role of the remote peer relative to us.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PeerRole {
    /// Flat network peer without role headers.
    #[default]
    Normal,
    Ultra,
    Leaf,
}

impl PeerRole {
    /// Ping throttle window for this role.
    pub fn ping_throttle(self) -> u64 {
        match self {
            PeerRole::Leaf => PING_LEAF_THROTTLE,
            _ => PING_REG_THROTTLE,
        }
    }

    /// Swift mode timing for this role.
    pub fn swift_timing(self) -> SwiftTiming {
        match self {
            PeerRole::Leaf => SwiftTiming::LEAF,
            _ => SwiftTiming::REGULAR,
        }
    }

    /// Host cache type the peer's address belongs to.
    pub fn host_type(self) -> HostType {
        match self {
            PeerRole::Ultra => HostType::Ultra,
            _ => HostType::Any,
        }
    }
}

/// Connection state flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionFlags {
    /// The remote dialed us.
    pub incoming: bool,
    /// Handshake completed and messages may flow.
    pub established: bool,
    /// Handshake validated the remote as one of us.
    pub valid: bool,
    /// The egress queue accepts messages.
    pub writable: bool,
    /// Inbound messages are processed.
    pub readable: bool,
    /// Reads are ignored (Bye received or socket failed).
    pub no_read: bool,
    /// A Bye was queued; nothing else follows it.
    pub bye_sent: bool,
    /// Shutdown started, only draining remains.
    pub closing: bool,
    /// The remote identified itself as a crawler.
    pub crawler: bool,
    /// The remote advertises a listening address other than its socket's.
    pub alien_ip: bool,
    /// Our query routing table went out at least once.
    pub qrp_sent: bool,
    /// The table sent to the remote no longer matches ours.
    pub stale_qrp: bool,
}

/// Capabilities announced by the remote and agreed encodings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeAttributes {
    /// Remote understands Bye messages.
    pub bye_packet: bool,
    /// Remote answers pings from its pong cache.
    pub pong_caching: bool,
    /// Remote parses GGEP extensions.
    pub can_ggep: bool,
    /// Remote accepts vendor messages.
    pub can_vendor: bool,
    /// Remote takes query routing tables.
    pub can_qrp: bool,
    /// Remote sends query routing tables between ultrapeers.
    pub up_qrp: bool,
    /// Remote exchanges horizon size estimates.
    pub can_hsep: bool,
    /// Remote is a leaf that accepts ultrapeer guidance.
    pub leaf_guide: bool,
    /// Remote is able to act as an ultrapeer.
    pub can_ultra: bool,
    /// Remote accepts deflated input.
    pub can_inflate: bool,
    /// We deflate what we send.
    pub tx_deflate: bool,
    /// Remote deflates what it sends.
    pub rx_inflate: bool,
}

/// Query routing table handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryTableId(pub u32);

/// In-flight routing table transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QrtTransferId(pub u32);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryRouting {
    pub sent_table: Option<QueryTableId>,
    pub received_table: Option<QueryTableId>,
    pub sending: Option<QrtTransferId>,
    pub receiving: Option<QrtTransferId>,
}

/// Traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub sent: u64,
    pub received: u64,
    pub tx_dropped: u64,
    pub rx_dropped: u64,
    pub n_bad: u64,
    pub n_dups: u64,
    pub n_hard_ttl: u64,
    pub n_weird: u64,
    pub n_ping_accepted: u64,
    pub n_ping_throttled: u64,
    pub n_ping_special: u64,
    pub n_ping_sent: u64,
    pub n_pong_received: u64,
    pub n_pong_sent: u64,
    pub rx_queries: u64,
    pub tx_queries: u64,
    pub rx_qhits: u64,
    pub tx_qhits: u64,
    pub qrp_queries: u64,
    pub qrp_matches: u64,
    pub tx_given: u64,
    pub tx_deflated: u64,
    pub tx_written: u64,
    pub rx_given: u64,
    pub rx_inflated: u64,
    pub rx_read: u64,
}

impl NodeStats {
    /// Share of outgoing bytes saved by compression.
    pub fn tx_compression_ratio(&self) -> f64 {
        compression_ratio(self.tx_given, self.tx_deflated)
    }

    /// Share of incoming bytes saved by compression.
    pub fn rx_compression_ratio(&self) -> f64 {
        compression_ratio(self.rx_inflated, self.rx_given)
    }
}

/// Releases the connection underlying a node.
pub trait Transport: Send {
    /// Called exactly once, when the node is removed.
    fn close(&mut self, reason: &str);
}

/// Per-node limits taken from the overlay configuration.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub queue: QueueConfig,
    pub hard_ttl_limit: u8,
    pub rx_fc_ratio: u32,
    pub handshake_timeout: u64,
    pub shutdown_delay: u64,
    pub max_payload: u32,
}

impl NodeSettings {
    pub fn from_config(config: &OverlayConfig) -> Self {
        Self {
            queue: config.queue.clone(),
            hard_ttl_limit: config.hard_ttl_limit,
            rx_fc_ratio: config.rx_fc_ratio,
            handshake_timeout: config.handshake_timeout_secs,
            shutdown_delay: config.shutdown_delay_secs,
            max_payload: config.max_payload_size,
        }
    }
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self::from_config(&OverlayConfig::default())
    }
}

/// What the caller should do with a received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Hand the message to routing.
    Route,
    /// A ping to answer; only `Accepted` pings are forwarded.
    Ping(PingVerdict),
    /// The peer said goodbye; the node is now shutting down.
    Bye { code: u16, reason: String },
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotReadable,
    TooManyHops,
    HardTtl,
    Throttled,
    Malformed,
    UnknownFunction,
}

/// Result of [`Node::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// Handshake not finished or connection gone.
    NotConnected,
    /// The node is shutting down.
    Closing,
    /// Hops-flow or reply-route filter refused the message.
    Filtered,
    /// No room in the queue.
    QueueFull,
}

/// Result of [`Node::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeTick {
    Keep,
    Remove,
}

struct RxStack {
    inflater: Option<RxInflater>,
    /// Plain bytes inflated before the buffer is framed again.
    inflate_limit: usize,
    buffer: BytesMut,
    codec: MessageCodec,
}

pub struct Node {
    id: NodeId,
    addr: HostAddr,
    status: NodeStatus,
    role: PeerRole,
    flags: ConnectionFlags,
    attributes: NodeAttributes,
    version: Option<ProtocolVersion>,
    vendor: Option<String>,
    vendor_code: Option<VendorCode>,
    listen_addr: Option<HostAddr>,
    hops_flow: u8,
    max_ttl: u8,
    degree: Option<u16>,
    queue: Option<EgressQueue>,
    rx_fc: Option<FlowControlMonitor>,
    ping: Option<PingPongState>,
    rx: Option<RxStack>,
    transport: Option<Box<dyn Transport>>,
    qrt: QueryRouting,
    stats: NodeStats,
    settings: NodeSettings,
    created_at: u64,
    connected_at: Option<u64>,
    shutdown_at: Option<u64>,
    last_rx: u64,
    last_tx: u64,
    remove_reason: Option<String>,
}

impl Node {
    /// A node we are dialing.
    pub fn new_outgoing(id: NodeId, addr: HostAddr, settings: NodeSettings, now: u64) -> Self {
        Self::new(id, addr, NodeStatus::Connecting, false, settings, now)
    }

    /// A node that connected to us.
    pub fn new_incoming(id: NodeId, addr: HostAddr, settings: NodeSettings, now: u64) -> Self {
        Self::new(id, addr, NodeStatus::ReceivingHello, true, settings, now)
    }

    fn new(
        id: NodeId,
        addr: HostAddr,
        status: NodeStatus,
        incoming: bool,
        settings: NodeSettings,
        now: u64,
    ) -> Self {
        Self {
            id,
            addr,
            status,
            role: PeerRole::Normal,
            flags: ConnectionFlags {
                incoming,
                ..ConnectionFlags::default()
            },
            attributes: NodeAttributes::default(),
            version: None,
            vendor: None,
            vendor_code: None,
            listen_addr: None,
            hops_flow: HOPS_FLOW_UNLIMITED,
            max_ttl: settings.hard_ttl_limit,
            degree: None,
            queue: None,
            rx_fc: None,
            ping: None,
            rx: None,
            transport: None,
            qrt: QueryRouting::default(),
            stats: NodeStats::default(),
            settings,
            created_at: now,
            connected_at: None,
            shutdown_at: None,
            last_rx: now,
            last_tx: now,
            remove_reason: None,
        }
    }

    /// Hands the node its connection. It is released on removal.
    pub fn attach_transport(&mut self, transport: Box<dyn Transport>) {
        if self.status == NodeStatus::Removing {
            let mut transport = transport;
            transport.close(self.remove_reason.as_deref().unwrap_or("Removed"));
            return;
        }
        self.transport = Some(transport);
    }

    // ===== Handshake =====

    /// The outgoing TCP connection is up: returns the greeting to send.
    pub fn on_connected(&mut self, local: &LocalNodeInfo) -> std::result::Result<HandshakeRequest, HandshakeError> {
        let result = if self.status == NodeStatus::Connecting {
            self.status = NodeStatus::HelloSent;
            Ok(local.request())
        } else {
            Err(HandshakeError::UnexpectedStep(self.status.name()))
        };
        self.handshake_result(result)
    }

    /// Incoming greeting: returns our welcome.
    pub fn on_hello(
        &mut self,
        request: &HandshakeRequest,
        local: &LocalNodeInfo,
    ) -> std::result::Result<HandshakeResponse, HandshakeError> {
        let result = if self.status != NodeStatus::ReceivingHello {
            Err(HandshakeError::UnexpectedStep(self.status.name()))
        } else {
            negotiate(local, request.version, &request.headers).map(|caps| {
                self.apply_capabilities(&caps);
                self.status = NodeStatus::WelcomeSent;
                local.welcome(&caps)
            })
        };
        self.handshake_result(result)
    }

    /// Welcome to our greeting: returns the final acknowledgement and
    /// establishes the connection.
    pub fn on_welcome(
        &mut self,
        response: &HandshakeResponse,
        local: &LocalNodeInfo,
        now: u64,
    ) -> std::result::Result<HandshakeResponse, HandshakeError> {
        let result = if self.status != NodeStatus::HelloSent {
            Err(HandshakeError::UnexpectedStep(self.status.name()))
        } else {
            response
                .check()
                .and_then(|()| negotiate(local, response.version, &response.headers))
                .map(|caps| {
                    self.apply_capabilities(&caps);
                    self.establish(now);
                    local.final_ack(&caps)
                })
        };
        self.handshake_result(result)
    }

    /// Final acknowledgement of an incoming handshake.
    pub fn on_final_ack(
        &mut self,
        response: &HandshakeResponse,
        now: u64,
    ) -> std::result::Result<(), HandshakeError> {
        let result = if self.status != NodeStatus::WelcomeSent {
            Err(HandshakeError::UnexpectedStep(self.status.name()))
        } else {
            response.check().map(|()| {
                self.attributes.rx_inflate = response.headers.has_token("Content-Encoding", "deflate");
                self.establish(now);
            })
        };
        self.handshake_result(result)
    }

    fn handshake_result<T>(
        &mut self,
        result: std::result::Result<T, HandshakeError>,
    ) -> std::result::Result<T, HandshakeError> {
        if let Err(e) = &result {
            debug!("Handshake with {} ({}) failed: {}", self.id, self.addr, e);
            self.remove(&format!("Handshake failed: {}", e));
        }
        result
    }

    fn apply_capabilities(&mut self, caps: &NegotiatedCapabilities) {
        self.version = Some(caps.version);
        self.vendor = Some(caps.vendor.clone());
        self.vendor_code = caps.vendor_code;
        self.role = caps.role;
        self.attributes = caps.attributes;
        self.listen_addr = caps.listen_addr;
        self.degree = caps.degree;
        self.flags.crawler = caps.crawler;
        if let Some(ttl) = caps.max_ttl {
            self.max_ttl = ttl.min(self.settings.hard_ttl_limit);
        }
        if let Some(listen) = caps.listen_addr {
            self.flags.alien_ip = self.flags.incoming && listen.ip != self.addr.ip;
        }
    }

    fn establish(&mut self, now: u64) {
        self.status = NodeStatus::Connected;
        self.flags.established = true;
        self.flags.valid = true;
        self.flags.writable = true;
        self.flags.readable = true;
        self.connected_at = Some(now);
        self.queue = Some(EgressQueue::new(
            self.settings.queue.clone(),
            self.role.swift_timing(),
            self.attributes.tx_deflate,
        ));
        self.ping = Some(PingPongState::new(self.role));
        self.rx = Some(RxStack {
            inflater: self.attributes.rx_inflate.then(RxInflater::new),
            inflate_limit: self.settings.max_payload as usize + HEADER_SIZE,
            buffer: BytesMut::new(),
            codec: MessageCodec::new(self.settings.max_payload),
        });
        info!(
            "Connected to {} {} ({}, {:?}{}{})",
            self.id,
            self.addr,
            self.vendor(),
            self.role,
            if self.attributes.tx_deflate { ", tx deflate" } else { "" },
            if self.attributes.rx_inflate { ", rx inflate" } else { "" },
        );
    }

    // ===== Receive path =====

    /// Feeds raw socket bytes, returning the complete messages they finish.
    ///
    /// A corrupt stream shuts the node down and is reported as an error.
    pub fn feed(&mut self, data: &[u8], now: u64) -> Result<Vec<Message>> {
        if !self.is_readable() {
            return Ok(Vec::new());
        }
        let Some(rx) = self.rx.as_mut() else {
            return Ok(Vec::new());
        };
        self.stats.rx_read += data.len() as u64;
        self.last_rx = now;

        let decoded = Self::decode_into(rx, data, &mut self.stats);
        match decoded {
            Ok(messages) => Ok(messages),
            Err(e) => {
                warn!("Dropping {} ({}): {}", self.id, self.addr, e);
                self.bye(400, "Malformed message stream", now);
                self.flags.no_read = true;
                Err(e)
            }
        }
    }

    fn decode_into(rx: &mut RxStack, data: &[u8], stats: &mut NodeStats) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        let Some(inflater) = rx.inflater.as_mut() else {
            rx.buffer.extend_from_slice(data);
            while let Some(message) = rx.codec.decode(&mut rx.buffer)? {
                messages.push(message);
            }
            return Ok(messages);
        };

        // Inflate at most one maximal message at a time, framing in between,
        // so a small chunk cannot balloon the buffer.
        let mut rest = data;
        loop {
            let mut plain = Vec::new();
            let (consumed, produced) = inflater.inflate_bounded(rest, &mut plain, rx.inflate_limit)?;
            rest = &rest[consumed..];
            stats.rx_given += consumed as u64;
            stats.rx_inflated += produced as u64;
            rx.buffer.extend_from_slice(&plain);
            while let Some(message) = rx.codec.decode(&mut rx.buffer)? {
                messages.push(message);
            }
            if produced < rx.inflate_limit {
                break;
            }
        }
        Ok(messages)
    }

    /// Accounts for a received message and decides what happens to it.
    pub fn receive(&mut self, message: &Message, now: u64) -> Inbound {
        self.stats.received += 1;
        self.last_rx = now;

        if !self.is_readable() {
            self.stats.rx_dropped += 1;
            return Inbound::Dropped(DropReason::NotReadable);
        }

        let header = &message.header;
        let limit = self.settings.hard_ttl_limit;
        if header.hops > limit {
            self.stats.n_bad += 1;
            self.stats.rx_dropped += 1;
            trace!("{}: {} with {} hops", self.id, header.function.name(), header.hops);
            return Inbound::Dropped(DropReason::TooManyHops);
        }
        if header.ttl as u16 + header.hops as u16 > limit as u16 {
            self.stats.n_hard_ttl += 1;
            self.stats.rx_dropped += 1;
            trace!(
                "{}: {} over hard TTL limit (ttl {} hops {})",
                self.id,
                header.function.name(),
                header.ttl,
                header.hops
            );
            return Inbound::Dropped(DropReason::HardTtl);
        }

        match header.function {
            MessageFunction::Ping => {
                let verdict = match self.ping.as_mut() {
                    Some(ping) => ping.on_ping(header.muid, header.ttl, header.hops, now),
                    None => PingVerdict::Throttled,
                };
                match verdict {
                    PingVerdict::Accepted => self.stats.n_ping_accepted += 1,
                    PingVerdict::Alive => self.stats.n_ping_special += 1,
                    PingVerdict::Throttled => {
                        self.stats.n_ping_throttled += 1;
                        self.stats.rx_dropped += 1;
                        return Inbound::Dropped(DropReason::Throttled);
                    }
                }
                Inbound::Ping(verdict)
            }
            MessageFunction::Pong => {
                self.stats.n_pong_received += 1;
                if PongInfo::parse(&message.payload).is_none() {
                    self.stats.n_weird += 1;
                    self.stats.rx_dropped += 1;
                    return Inbound::Dropped(DropReason::Malformed);
                }
                Inbound::Route
            }
            MessageFunction::Bye => {
                let (code, reason) = parse_bye(&message.payload).unwrap_or((0, String::new()));
                info!("{} ({}) said bye: {} {}", self.id, self.addr, code, reason);
                self.flags.no_read = true;
                self.enter_shutdown(&format!("Got bye {} {}", code, reason), now);
                Inbound::Bye { code, reason }
            }
            MessageFunction::Query => {
                self.stats.rx_queries += 1;
                Inbound::Route
            }
            MessageFunction::QueryHit => {
                self.stats.rx_qhits += 1;
                Inbound::Route
            }
            MessageFunction::Other(code) => {
                self.stats.n_weird += 1;
                self.stats.rx_dropped += 1;
                trace!("{}: unknown function 0x{:02x}", self.id, code);
                Inbound::Dropped(DropReason::UnknownFunction)
            }
            _ => Inbound::Route,
        }
    }

    /// The routing layer saw this message before.
    pub fn note_duplicate(&mut self) {
        self.stats.n_dups += 1;
        self.stats.rx_dropped += 1;
    }

    /// A query was checked against this node's routing table.
    pub fn note_qrp_query(&mut self, matched: bool) {
        self.stats.qrp_queries += 1;
        if matched {
            self.stats.qrp_matches += 1;
        }
    }

    // ===== Send path =====

    /// Queries go out only below the peer's hops-flow, and relayed ones only
    /// while a route for their replies still exists.
    pub fn can_send(&self, message: &Message, routes: &dyn RoutingTable) -> bool {
        if message.function() != MessageFunction::Query {
            return true;
        }
        let hops = message.header.hops;
        hops < self.hops_flow
            && (hops == 0 || routes.route_exists_for_reply(&message.header.muid, MessageFunction::Query))
    }

    /// Queues a message for the peer.
    pub fn send(&mut self, message: &Message, routes: &dyn RoutingTable, now: u64) -> SendOutcome {
        if self.flags.closing || self.status == NodeStatus::Shutdown {
            return SendOutcome::Closing;
        }
        if self.status != NodeStatus::Connected || !self.flags.writable {
            return SendOutcome::NotConnected;
        }
        if !self.can_send(message, routes) {
            return SendOutcome::Filtered;
        }
        self.enqueue(message, now)
    }

    fn enqueue(&mut self, message: &Message, now: u64) -> SendOutcome {
        let Some(queue) = self.queue.as_mut() else {
            return SendOutcome::NotConnected;
        };
        match queue.enqueue(message, now) {
            EnqueueResult::Queued { dropped } => {
                self.stats.tx_dropped += dropped as u64;
                self.stats.sent += 1;
                match message.function() {
                    MessageFunction::Ping => self.stats.n_ping_sent += 1,
                    MessageFunction::Pong => {
                        self.stats.n_pong_sent += 1;
                        if let Some(ping) = self.ping.as_mut() {
                            ping.on_pong_sent(message.header.hops);
                        }
                    }
                    MessageFunction::Query => self.stats.tx_queries += 1,
                    MessageFunction::QueryHit => self.stats.tx_qhits += 1,
                    _ => {}
                }
                SendOutcome::Queued
            }
            EnqueueResult::QueueFull => {
                self.stats.tx_dropped += 1;
                if queue.is_swift_controlled() {
                    warn!("{} ({}): send queue overflow in swift mode", self.id, self.addr);
                    self.flags.writable = false;
                    self.enter_shutdown("Send queue overflow", now);
                }
                SendOutcome::QueueFull
            }
        }
    }

    /// Writes queued data to `sink`.
    pub fn drain<W: Write>(&mut self, sink: &mut W, max_bytes: usize, now: u64) -> io::Result<usize> {
        let Some(queue) = self.queue.as_mut() else {
            return Ok(0);
        };
        let written = queue.drain(sink, max_bytes, now)?;
        let qstats = queue.stats();
        self.stats.tx_given = qstats.tx_given;
        self.stats.tx_deflated = qstats.tx_deflated;
        self.stats.tx_written = qstats.tx_written;
        if written > 0 {
            self.last_tx = now;
        }
        Ok(written)
    }

    /// Returns true if the queue holds data for the socket.
    pub fn has_pending_output(&self) -> bool {
        self.queue.as_ref().is_some_and(|q| !q.is_empty())
    }

    // ===== Control =====

    /// The peer announced how far it wants our queries to travel. Zero
    /// means it is flow-controlling us.
    pub fn set_hops_flow(&mut self, hops: u8, now: u64) {
        let previous = self.hops_flow;
        self.hops_flow = hops;
        if hops == 0 {
            self.rx_fc
                .get_or_insert_with(|| FlowControlMonitor::new(now))
                .enter(now);
        } else if let Some(monitor) = self.rx_fc.as_mut() {
            monitor.leave(now);
        }
        if previous != hops {
            debug!("{}: hops-flow {} -> {}", self.id, previous, hops);
        }
    }

    /// Says goodbye and starts shutting down.
    pub fn bye(&mut self, code: u16, reason: &str, now: u64) {
        match self.status {
            s if s.is_connecting() => {
                self.remove(reason);
                return;
            }
            NodeStatus::Connected => {}
            _ => return,
        }
        if self.attributes.bye_packet && !self.flags.bye_sent {
            self.enqueue(&Message::bye(code, reason), now);
            self.flags.bye_sent = true;
        }
        self.enter_shutdown(reason, now);
    }

    /// Fatal socket error.
    pub fn on_io_error(&mut self, error: &str, now: u64) {
        let reason = format!("I/O error: {}", error);
        if self.status.is_connecting() {
            self.remove(&reason);
            return;
        }
        self.flags.writable = false;
        self.flags.no_read = true;
        self.enter_shutdown(&reason, now);
    }

    /// The peer closed the connection.
    pub fn on_eof(&mut self) {
        self.remove("Got EOF");
    }

    fn enter_shutdown(&mut self, reason: &str, now: u64) {
        if self.status != NodeStatus::Connected {
            return;
        }
        self.status = NodeStatus::Shutdown;
        self.flags.closing = true;
        self.shutdown_at = Some(now);
        self.remove_reason.get_or_insert_with(|| reason.to_string());
        debug!("{} ({}) shutting down: {}", self.id, self.addr, reason);
    }

    /// Periodic housekeeping.
    pub fn tick(&mut self, now: u64) -> NodeTick {
        match self.status {
            s if s.is_connecting() => {
                if now.saturating_sub(self.created_at) >= self.settings.handshake_timeout {
                    self.remove("Handshake timeout");
                }
            }
            NodeStatus::Connected => self.tick_connected(now),
            NodeStatus::Shutdown => {
                let since = self.shutdown_at.unwrap_or(now);
                if now.saturating_sub(since) >= self.settings.shutdown_delay {
                    let reason = self.remove_reason.clone().unwrap_or_else(|| "Shutdown".to_string());
                    self.remove(&reason);
                }
            }
            _ => {}
        }
        if self.status == NodeStatus::Removing {
            NodeTick::Remove
        } else {
            NodeTick::Keep
        }
    }

    fn tick_connected(&mut self, now: u64) {
        if let Some(queue) = self.queue.as_mut() {
            self.stats.tx_dropped += queue.check_swift(now) as u64;
        }
        if let Some(ping) = self.ping.as_mut() {
            ping.expire(now);
        }
        let Some(monitor) = self.rx_fc.as_mut() else {
            return;
        };
        match monitor.tick(now) {
            MonitorTick::Disposable => {
                trace!("{}: dropping idle flow control monitor", self.id);
                self.rx_fc = None;
            }
            MonitorTick::Rolled { ratio } if ratio > self.settings.rx_fc_ratio => {
                info!(
                    "{} ({}) flow-controlled us {}% of the time",
                    self.id, self.addr, ratio
                );
                self.bye(405, "Remotely flow-controlled too often", now);
            }
            _ => {}
        }
    }

    /// Releases everything the node owns. Returns false if it was already
    /// removed.
    pub fn remove(&mut self, reason: &str) -> bool {
        if self.status == NodeStatus::Removing {
            return false;
        }
        self.status = NodeStatus::Removing;
        let reason = self.remove_reason.get_or_insert_with(|| reason.to_string()).clone();
        self.flags.writable = false;
        self.flags.readable = false;
        self.flags.closing = true;

        if let Some(mut queue) = self.queue.take() {
            self.stats.tx_dropped += queue.clear() as u64;
        }
        self.rx_fc = None;
        self.ping = None;
        self.rx = None;
        if let Some(mut transport) = self.transport.take() {
            transport.close(&reason);
        }
        info!("Removing {} ({}): {}", self.id, self.addr, reason);
        true
    }

    // ===== Query routing bookkeeping =====

    /// Our routing table started going out as `transfer`.
    pub fn begin_qrt_send(&mut self, transfer: QrtTransferId) {
        self.qrt.sending = Some(transfer);
    }

    /// The remote now holds `table`.
    pub fn finish_qrt_send(&mut self, table: QueryTableId) {
        self.qrt.sending = None;
        self.qrt.sent_table = Some(table);
        self.flags.qrp_sent = true;
        self.flags.stale_qrp = false;
    }

    /// The remote started sending its routing table.
    pub fn begin_qrt_receive(&mut self, transfer: QrtTransferId) {
        self.qrt.receiving = Some(transfer);
    }

    /// The remote's table arrived in full as `table`.
    pub fn finish_qrt_receive(&mut self, table: QueryTableId) {
        self.qrt.receiving = None;
        self.qrt.received_table = Some(table);
    }

    /// Our table changed since it was last sent.
    pub fn mark_qrt_stale(&mut self) {
        if self.flags.qrp_sent {
            self.flags.stale_qrp = true;
        }
    }

    /// An ultrapeer finished receiving our routing table.
    pub fn ultra_received_qrp(&self) -> bool {
        self.attributes.up_qrp && self.qrt.receiving.is_none() && self.qrt.received_table.is_some()
    }

    /// A leaf has its routing table sent in full.
    pub fn leaf_sent_qrp(&self) -> bool {
        self.qrt.sending.is_none() && self.qrt.sent_table.is_some()
    }

    // ===== Accessors =====

    /// Engine-wide identifier, never reused while the node lives.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Socket address of the remote end.
    pub fn addr(&self) -> HostAddr {
        self.addr
    }

    /// Current lifecycle state.
    pub fn status(&self) -> NodeStatus {
        self.status
    }

    /// Role negotiated during the handshake.
    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Snapshot of the connection flags.
    pub fn flags(&self) -> ConnectionFlags {
        self.flags
    }

    /// Capabilities agreed with the remote.
    pub fn attributes(&self) -> NodeAttributes {
        self.attributes
    }

    /// Protocol version from the remote's status line.
    pub fn version(&self) -> Option<ProtocolVersion> {
        self.version
    }

    /// Remote's `User-Agent`, or a placeholder before the handshake.
    pub fn vendor(&self) -> &str {
        self.vendor.as_deref().unwrap_or("????")
    }

    /// Four-letter vendor code, when the user agent maps to one.
    pub fn vendor_code(&self) -> Option<VendorCode> {
        self.vendor_code
    }

    /// Address the peer accepts connections on, if known.
    pub fn listen_addr(&self) -> Option<HostAddr> {
        self.listen_addr
            .or_else(|| (!self.flags.incoming).then_some(self.addr))
    }

    /// Highest hop count (exclusive) the remote accepts queries at.
    pub fn hops_flow(&self) -> u8 {
        self.hops_flow
    }

    /// TTL cap announced by the remote, bounded by our hard limit.
    pub fn max_ttl(&self) -> u8 {
        self.max_ttl
    }

    /// Connection count the remote advertises.
    pub fn degree(&self) -> Option<u16> {
        self.degree
    }

    /// Routing table transfers with this peer.
    pub fn query_routing(&self) -> QueryRouting {
        self.qrt
    }

    /// Traffic counters.
    pub fn stats(&self) -> NodeStats {
        self.stats
    }

    /// Egress queue, present from connection until removal.
    pub fn queue(&self) -> Option<&EgressQueue> {
        self.queue.as_ref()
    }

    /// Monitor of time spent flow-controlled by the remote.
    /// 
    /// Only exists after the remote first sent a zero hops-flow.
    pub fn flow_monitor(&self) -> Option<&FlowControlMonitor> {
        self.rx_fc.as_ref()
    }

    /// Ping throttling and pong demand for this connection.
    pub fn ping_state(&self) -> Option<&PingPongState> {
        self.ping.as_ref()
    }

    /// The transport has not been released yet.
    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    /// Why the node was removed, once it was.
    pub fn remove_reason(&self) -> Option<&str> {
        self.remove_reason.as_deref()
    }

    /// When the node was created.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// When the handshake completed.
    pub fn connected_at(&self) -> Option<u64> {
        self.connected_at
    }

    /// When shutdown began.
    pub fn shutdown_at(&self) -> Option<u64> {
        self.shutdown_at
    }

    /// Last time data arrived.
    pub fn last_rx(&self) -> u64 {
        self.last_rx
    }

    /// Last time data was written.
    pub fn last_tx(&self) -> u64 {
        self.last_tx
    }

    pub fn is_connecting(&self) -> bool {
        self.status.is_connecting()
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    /// Connected with a completed handshake.
    pub fn is_established(&self) -> bool {
        self.flags.established && self.status.is_connected()
    }

    /// Accepts new outgoing messages.
    pub fn is_writable(&self) -> bool {
        self.flags.writable && !self.flags.closing
    }

    /// Incoming messages are still processed.
    pub fn is_readable(&self) -> bool {
        self.flags.readable && !self.flags.no_read
    }

    pub fn is_ultra(&self) -> bool {
        self.role == PeerRole::Ultra
    }

    pub fn is_leaf(&self) -> bool {
        self.role == PeerRole::Leaf
    }

    /// A query with `hops` hops would pass the peer's hops-flow.
    pub fn query_hops_ok(&self, hops: u8) -> bool {
        hops < self.hops_flow
    }

    /// Our send queue is above its high watermark.
    pub fn in_tx_flow_control(&self) -> bool {
        self.queue.as_ref().is_some_and(|q| q.is_flow_controlled())
    }

    /// Our send queue is shedding traffic in swift mode.
    pub fn in_tx_swift_control(&self) -> bool {
        self.queue.as_ref().is_some_and(|q| q.is_swift_controlled())
    }

    /// The remote asked us to stop sending queries.
    pub fn in_rx_flow_control(&self) -> bool {
        self.rx_fc.as_ref().is_some_and(|m| m.in_flow_control())
    }

    /// Swift mode grace and period for this peer's role.
    pub fn swift_timing(&self) -> SwiftTiming {
        self.role.swift_timing()
    }

    /// Messages waiting in the send queue.
    pub fn mqueue_count(&self) -> usize {
        self.queue.as_ref().map_or(0, |q| q.count())
    }

    /// Bytes waiting in the send queue.
    pub fn mqueue_pending(&self) -> usize {
        self.queue.as_ref().map_or(0, |q| q.size_bytes())
    }

    /// Send queue fill level, in percent of the high watermark.
    pub fn mqueue_percent_used(&self) -> usize {
        self.queue.as_ref().map_or(0, |q| q.percent_used())
    }

    /// Send queue still above its low watermark.
    pub fn mqueue_above_lowat(&self) -> bool {
        self.queue.as_ref().is_some_and(|q| q.above_low_watermark())
    }

    /// Outgoing data is deflated.
    pub fn tx_compressed(&self) -> bool {
        self.attributes.tx_deflate
    }

    /// Incoming data is inflated.
    pub fn rx_compressed(&self) -> bool {
        self.attributes.rx_inflate
    }

    /// Share of bytes saved by deflating, 0.0 to 1.0.
    pub fn tx_compression_ratio(&self) -> f64 {
        self.stats.tx_compression_ratio()
    }

    /// Share of bytes saved by the remote's deflating.
    pub fn rx_compression_ratio(&self) -> f64 {
        self.stats.rx_compression_ratio()
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("status", &self.status)
            .field("role", &self.role)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Muid;
    use crate::compress::TxDeflater;
    use crate::handshake::HeaderMap;
    use crate::routing::RouteTable;
    use crate::ping_pong::MAX_PONGS;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingTransport(Arc<AtomicUsize>);

    impl Transport for CountingTransport {
        fn close(&mut self, _reason: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn addr() -> HostAddr {
        "1.2.3.4:6346".parse().unwrap()
    }

    fn remote_welcome(ultra: bool, deflate: bool) -> HandshakeResponse {
        let mut headers = HeaderMap::new();
        headers.insert("User-Agent", "gtk-gnutella/1.2.2");
        headers.insert("X-Ultrapeer", if ultra { "True" } else { "False" });
        headers.insert("Bye-Packet", "0.1");
        if deflate {
            headers.insert("Accept-Encoding", "deflate");
            headers.insert("Content-Encoding", "deflate");
        }
        HandshakeResponse::ok(headers)
    }

    /// An outgoing node taken through the full handshake.
    pub(crate) fn connected_node(role_ultra: bool, now: u64) -> Node {
        let local = LocalNodeInfo {
            compression: false,
            ..Default::default()
        };
        let mut node = Node::new_outgoing(NodeId(1), addr(), NodeSettings::default(), now);
        node.on_connected(&local).unwrap();
        node.on_welcome(&remote_welcome(role_ultra, false), &local, now)
            .unwrap();
        node
    }

    fn relayed_query(hops: u8) -> Message {
        Message::with_muid(Muid::random(), MessageFunction::Query, 3, hops, Bytes::from_static(b"\0\0q\0"))
    }

    #[test]
    fn test_outgoing_handshake() {
        let local = LocalNodeInfo::default();
        let mut node = Node::new_outgoing(NodeId(1), addr(), NodeSettings::default(), 0);
        assert!(node.is_connecting());
        let request = node.on_connected(&local).unwrap();
        assert_eq!(node.status(), NodeStatus::HelloSent);
        assert_eq!(request.version, ProtocolVersion::CURRENT);

        let ack = node.on_welcome(&remote_welcome(true, true), &local, 5).unwrap();
        assert_eq!(node.status(), NodeStatus::Connected);
        assert_eq!(node.role(), PeerRole::Ultra);
        assert!(node.tx_compressed());
        assert!(node.rx_compressed());
        assert_eq!(ack.headers.get("Content-Encoding"), Some("deflate"));
        assert_eq!(node.connected_at(), Some(5));
        assert!(node.queue().is_some());
        assert!(node.is_writable());
        assert_eq!(node.vendor_code().unwrap().to_string(), "GTKG");
        assert_eq!(node.listen_addr(), Some(addr()));
    }

    #[test]
    fn test_incoming_handshake() {
        let local = LocalNodeInfo::default();
        let mut node = Node::new_incoming(NodeId(2), addr(), NodeSettings::default(), 0);
        assert_eq!(node.status(), NodeStatus::ReceivingHello);

        let mut request = LocalNodeInfo {
            ultrapeer: false,
            user_agent: "LimeWire/4.12".into(),
            ..Default::default()
        }
        .request();
        request.headers.insert("Listen-IP", "9.9.9.9:6346");
        let welcome = node.on_hello(&request, &local).unwrap();
        assert!(welcome.is_success());
        assert_eq!(node.status(), NodeStatus::WelcomeSent);
        assert_eq!(node.role(), PeerRole::Leaf);
        assert!(node.flags().alien_ip);

        let mut ack_headers = HeaderMap::new();
        ack_headers.insert("Content-Encoding", "deflate");
        node.on_final_ack(&HandshakeResponse::ok(ack_headers), 1).unwrap();
        assert_eq!(node.status(), NodeStatus::Connected);
        assert!(node.rx_compressed());
        assert_eq!(node.swift_timing(), SwiftTiming::LEAF);
        assert_eq!(node.ping_state().unwrap().throttle_window(), PING_LEAF_THROTTLE);
    }

    #[test]
    fn test_version_mismatch_removes_node() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut node = Node::new_incoming(NodeId(3), addr(), NodeSettings::default(), 0);
        node.attach_transport(Box::new(CountingTransport(closes.clone())));

        let mut request = LocalNodeInfo::default().request();
        request.version = ProtocolVersion::new(0, 4);
        let err = node.on_hello(&request, &LocalNodeInfo::default()).unwrap_err();
        assert!(err.is_alien());
        assert_eq!(node.status(), NodeStatus::Removing);
        assert!(node.remove_reason().unwrap().contains("0.4"));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_refused_welcome_removes_node() {
        let local = LocalNodeInfo::default();
        let mut node = Node::new_outgoing(NodeId(4), addr(), NodeSettings::default(), 0);
        node.on_connected(&local).unwrap();
        let err = node
            .on_welcome(&HandshakeResponse::refusal(503, "Busy"), &local, 1)
            .unwrap_err();
        assert!(err.is_busy());
        assert_eq!(node.status(), NodeStatus::Removing);
    }

    #[test]
    fn test_out_of_order_handshake_step() {
        let local = LocalNodeInfo::default();
        let mut node = Node::new_incoming(NodeId(5), addr(), NodeSettings::default(), 0);
        let err = node
            .on_welcome(&remote_welcome(true, false), &local, 0)
            .unwrap_err();
        assert!(matches!(err, HandshakeError::UnexpectedStep(_)));
        assert_eq!(node.status(), NodeStatus::Removing);
    }

    #[test]
    fn test_transport_released_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut node = connected_node(true, 0);
        node.attach_transport(Box::new(CountingTransport(closes.clone())));
        assert!(node.remove("first"));
        assert!(!node.remove("second"));
        node.on_eof();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(node.remove_reason(), Some("first"));
        assert!(node.queue().is_none());
        assert!(node.ping_state().is_none());
        assert!(!node.has_transport());
    }

    #[test]
    fn test_send_rules() {
        let routes = RouteTable::default();
        let mut connecting = Node::new_outgoing(NodeId(6), addr(), NodeSettings::default(), 0);
        assert_eq!(connecting.send(&Message::ping(1), &routes, 0), SendOutcome::NotConnected);

        let mut node = connected_node(true, 0);
        assert_eq!(node.send(&Message::ping(3), &routes, 0), SendOutcome::Queued);
        // Relayed query with no reply route.
        assert_eq!(node.send(&relayed_query(2), &routes, 0), SendOutcome::Filtered);
        // Our own query needs no route.
        assert_eq!(node.send(&relayed_query(0), &routes, 0), SendOutcome::Queued);

        node.bye(200, "Closing", 1);
        assert_eq!(node.status(), NodeStatus::Shutdown);
        assert_eq!(node.send(&Message::ping(3), &routes, 1), SendOutcome::Closing);
        assert!(node.flags().bye_sent);
        assert_eq!(node.mqueue_count(), 3);
    }

    #[test]
    fn test_hops_flow_filters_queries() {
        let mut routes = RouteTable::default();
        let mut node = connected_node(true, 0);
        let query = relayed_query(2);
        routes.record(query.header.muid, MessageFunction::Query, NodeId(9), 0);
        assert!(node.can_send(&query, &routes));

        node.set_hops_flow(2, 0);
        assert!(!node.can_send(&query, &routes));
        assert!(node.query_hops_ok(1));
        // Non-queries are never filtered.
        assert!(node.can_send(&Message::ping(2), &routes));

        node.set_hops_flow(0, 10);
        assert!(node.in_rx_flow_control());
        assert!(!node.can_send(&relayed_query(0), &routes));
        node.set_hops_flow(HOPS_FLOW_UNLIMITED, 40);
        assert!(!node.in_rx_flow_control());
        assert_eq!(node.flow_monitor().unwrap().fc_accumulator(), 30);
    }

    #[test]
    fn test_hard_ttl_and_bad_hops() {
        let mut node = connected_node(true, 0);
        let over = Message::with_muid(Muid::random(), MessageFunction::Query, 6, 3, Bytes::new());
        assert_eq!(node.receive(&over, 1), Inbound::Dropped(DropReason::HardTtl));
        let bad = Message::with_muid(Muid::random(), MessageFunction::Query, 0, 8, Bytes::new());
        assert_eq!(node.receive(&bad, 1), Inbound::Dropped(DropReason::TooManyHops));
        let stats = node.stats();
        assert_eq!(stats.n_hard_ttl, 1);
        assert_eq!(stats.n_bad, 1);
        assert_eq!(stats.rx_dropped, 2);
        assert_eq!(stats.received, 2);
    }

    #[test]
    fn test_ping_throttling_through_node() {
        let mut node = connected_node(true, 0);
        assert_eq!(node.receive(&Message::ping(4), 10), Inbound::Ping(PingVerdict::Accepted));
        assert_eq!(node.receive(&Message::ping(4), 11), Inbound::Dropped(DropReason::Throttled));
        assert_eq!(node.receive(&Message::ping(1), 11), Inbound::Ping(PingVerdict::Alive));
        let stats = node.stats();
        assert_eq!(stats.n_ping_accepted, 1);
        assert_eq!(stats.n_ping_throttled, 1);
        assert_eq!(stats.n_ping_special, 1);
    }

    #[test]
    fn test_pong_sent_settles_demand() {
        let routes = RouteTable::default();
        let mut node = connected_node(true, 0);
        let ping = Message::ping(2);
        node.receive(&ping, 0);
        let state = node.ping_state().unwrap();
        assert_eq!(state.pongs_missing(), MAX_PONGS);
        assert_eq!(state.pongs_needed(1), MAX_PONGS - 1);

        let info = PongInfo {
            addr: "5.6.7.8:6346".parse().unwrap(),
            files: 0,
            kbytes: 0,
        };
        let own = Message::pong(ping.header.muid, 1, &info);
        assert_eq!(node.send(&own, &routes, 0), SendOutcome::Queued);
        let mut cached = Message::pong(ping.header.muid, 1, &info);
        cached.header.hops = 1;
        assert_eq!(node.send(&cached, &routes, 0), SendOutcome::Queued);
        assert_eq!(node.ping_state().unwrap().pongs_missing(), MAX_PONGS - 2);
    }

    #[test]
    fn test_received_bye() {
        let mut node = connected_node(true, 0);
        let inbound = node.receive(&Message::bye(503, "Too many connections"), 7);
        assert_eq!(
            inbound,
            Inbound::Bye {
                code: 503,
                reason: "Too many connections".into()
            }
        );
        assert_eq!(node.status(), NodeStatus::Shutdown);
        assert!(!node.is_readable());
        assert_eq!(node.receive(&Message::ping(3), 8), Inbound::Dropped(DropReason::NotReadable));
    }

    #[test]
    fn test_handshake_timeout() {
        let mut node = Node::new_outgoing(NodeId(7), addr(), NodeSettings::default(), 100);
        let timeout = NodeSettings::default().handshake_timeout;
        assert_eq!(node.tick(100 + timeout - 1), NodeTick::Keep);
        assert_eq!(node.tick(100 + timeout), NodeTick::Remove);
        assert_eq!(node.remove_reason(), Some("Handshake timeout"));
    }

    #[test]
    fn test_shutdown_delay() {
        let mut node = connected_node(true, 0);
        let delay = NodeSettings::default().shutdown_delay;
        node.bye(200, "Closing", 10);
        assert_eq!(node.tick(10 + delay - 1), NodeTick::Keep);
        assert_eq!(node.tick(10 + delay), NodeTick::Remove);
        assert_eq!(node.remove_reason(), Some("Closing"));
    }

    #[test]
    fn test_io_error_moves_to_shutdown() {
        let mut node = connected_node(true, 0);
        node.on_io_error("connection reset", 3);
        assert_eq!(node.status(), NodeStatus::Shutdown);
        assert!(!node.is_writable());

        let mut dialing = Node::new_outgoing(NodeId(8), addr(), NodeSettings::default(), 0);
        dialing.on_io_error("connection refused", 1);
        assert_eq!(dialing.status(), NodeStatus::Removing);
    }

    #[test]
    fn test_remote_flow_control_ratio() {
        let mut node = connected_node(true, 0);
        node.set_hops_flow(0, 0);
        assert_eq!(node.tick(150), NodeTick::Keep);
        // Half the time so far: not above the 50% limit yet.
        node.tick(300);
        assert_eq!(node.status(), NodeStatus::Connected);
        node.tick(600);
        assert_eq!(node.status(), NodeStatus::Shutdown);
        assert_eq!(node.remove_reason(), Some("Remotely flow-controlled too often"));
    }

    #[test]
    fn test_idle_monitor_is_dropped() {
        let mut node = connected_node(true, 0);
        node.set_hops_flow(0, 0);
        node.set_hops_flow(HOPS_FLOW_UNLIMITED, 1);
        node.tick(300);
        node.tick(600);
        assert!(node.flow_monitor().is_some());
        node.tick(900);
        assert!(node.flow_monitor().is_none());
        assert_eq!(node.status(), NodeStatus::Connected);
    }

    #[test]
    fn test_feed_inflates_and_frames() {
        let local = LocalNodeInfo::default();
        let mut node = Node::new_outgoing(NodeId(9), addr(), NodeSettings::default(), 0);
        node.on_connected(&local).unwrap();
        node.on_welcome(&remote_welcome(true, true), &local, 0).unwrap();

        let a = Message::ping(3);
        let b = relayed_query(1);
        let plain = [a.to_bytes(), b.to_bytes()].concat();
        let mut wire = Vec::new();
        TxDeflater::new(6).deflate(&plain, &mut wire).unwrap();

        let (first, second) = wire.split_at(wire.len() / 2);
        let mut messages = node.feed(first, 1).unwrap();
        messages.extend(node.feed(second, 1).unwrap());
        assert_eq!(messages, vec![a, b]);

        let stats = node.stats();
        assert_eq!(stats.rx_read, wire.len() as u64);
        assert_eq!(stats.rx_inflated, plain.len() as u64);
        assert!(node.rx_compression_ratio() < 1.0);
    }

    #[test]
    fn test_inflated_chunk_is_bounded() {
        let local = LocalNodeInfo::default();
        let mut node = Node::new_outgoing(NodeId(9), addr(), NodeSettings::default(), 0);
        node.on_connected(&local).unwrap();
        node.on_welcome(&remote_welcome(true, true), &local, 0).unwrap();

        // A few KB on the wire, a megabyte once inflated, and no valid header.
        let mut wire = Vec::new();
        TxDeflater::new(9).deflate(&vec![0xffu8; 1 << 20], &mut wire).unwrap();
        assert!(node.feed(&wire, 1).is_err());

        let limit = NodeSettings::default().max_payload as u64 + HEADER_SIZE as u64;
        assert!(node.stats().rx_inflated <= limit);
        assert!(!node.is_readable());
    }

    #[test]
    fn test_feed_oversized_message_shuts_down() {
        let mut node = connected_node(true, 0);
        let mut header = BytesMut::new();
        crate::codec::MessageHeader {
            muid: Muid::random(),
            function: MessageFunction::Query,
            ttl: 1,
            hops: 0,
            size: u32::MAX,
        }
        .encode(&mut header);
        assert!(node.feed(&header, 2).is_err());
        assert_eq!(node.status(), NodeStatus::Shutdown);
        assert!(node.feed(b"more", 3).unwrap().is_empty());
    }

    #[test]
    fn test_drain_updates_traffic() {
        let routes = RouteTable::default();
        let mut node = connected_node(true, 0);
        node.send(&Message::ping(3), &routes, 0);
        assert!(node.has_pending_output());
        let mut sink = Vec::new();
        assert_eq!(node.drain(&mut sink, 1024, 4).unwrap(), 23);
        assert_eq!(node.stats().tx_written, 23);
        assert_eq!(node.last_tx(), 4);
        assert!(!node.has_pending_output());
    }

    #[test]
    fn test_qrp_bookkeeping() {
        let mut node = connected_node(true, 0);
        assert!(!node.leaf_sent_qrp());
        node.begin_qrt_send(QrtTransferId(1));
        assert!(!node.leaf_sent_qrp());
        node.finish_qrt_send(QueryTableId(7));
        assert!(node.leaf_sent_qrp());
        node.mark_qrt_stale();
        assert!(node.flags().stale_qrp);

        node.begin_qrt_receive(QrtTransferId(2));
        node.finish_qrt_receive(QueryTableId(8));
        // The remote did not announce ultrapeer query routing.
        assert!(!node.ultra_received_qrp());
    }
}
