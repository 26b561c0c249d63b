//! The overlay engine: node table, host cache and routing in one owned context.
//!
//! [`Overlay`] is synchronous and does no I/O. The driver feeds it socket
//! events and handshake blocks and picks up the bytes it wants written; every
//! decision about a connection is taken here or in the node itself.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::codec::{helpers, Message, MessageFunction, Muid, PongInfo};
use crate::error::HandshakeError;
use crate::handshake::{HandshakeRequest, HandshakeResponse};
use crate::host_cache::{HostCache, HostCategory, HostType};
use crate::node::{
    Inbound, Node, NodeId, NodeSettings, NodeStats, NodeStatus, NodeTick, PeerRole, SendOutcome,
    Transport,
};
use crate::ping_pong::PingVerdict;
use crate::routing::{RouteTable, RoutingTable};
use crate::{HostAddr, OverlayConfig, OverlayError, Result};

/// Seconds between discovery pings while the host cache runs low.
const DISCOVERY_PING_INTERVAL: u64 = 60;

/// Cached pongs sent in answer to one ping, at most.
const MAX_CACHED_PONGS: usize = 10;

/// Where a handshake stands after a block was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Another block is expected from the remote.
    Continue,
    /// Both sides agreed; switch to message framing.
    Established,
    /// The node was removed. Send the reply, if any, and close.
    Failed,
}

/// Result of [`Overlay::handshake_block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeStep {
    /// Text to write back to the remote.
    pub reply: Option<String>,
    pub outcome: HandshakeOutcome,
}

/// Engine-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlayStats {
    pub nodes_added: u64,
    pub nodes_removed: u64,
    pub handshakes_completed: u64,
    pub handshakes_failed: u64,
    pub messages_received: u64,
    pub messages_routed: u64,
    pub duplicates: u64,
    pub pongs_harvested: u64,
    pub pongs_from_cache: u64,
}

/// Point-in-time view of one node.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub id: NodeId,
    pub addr: HostAddr,
    pub status: NodeStatus,
    pub role: PeerRole,
    pub vendor: String,
    pub incoming: bool,
    pub stats: NodeStats,
    pub mqueue_count: usize,
    pub mqueue_percent_used: usize,
    pub in_tx_flow_control: bool,
    pub in_tx_swift_control: bool,
    pub in_rx_flow_control: bool,
}

impl NodeSnapshot {
    fn of(node: &Node) -> Self {
        Self {
            id: node.id(),
            addr: node.addr(),
            status: node.status(),
            role: node.role(),
            vendor: node.vendor().to_string(),
            incoming: node.flags().incoming,
            stats: node.stats(),
            mqueue_count: node.mqueue_count(),
            mqueue_percent_used: node.mqueue_percent_used(),
            in_tx_flow_control: node.in_tx_flow_control(),
            in_tx_swift_control: node.in_tx_swift_control(),
            in_rx_flow_control: node.in_rx_flow_control(),
        }
    }
}

pub struct Overlay {
    config: OverlayConfig,
    settings: NodeSettings,
    nodes: BTreeMap<NodeId, Node>,
    host_cache: HostCache,
    routes: Box<dyn RoutingTable>,
    next_id: u32,
    last_discovery: Option<u64>,
    stats: OverlayStats,
}

impl Overlay {
    /// Creates the engine, loading the host cache and seeding it with the
    /// configured bootstrap hosts.
    pub fn new(config: OverlayConfig, now: u64) -> Result<Self> {
        let routes = Box::new(RouteTable::new(config.route_ttl_secs));
        Self::with_routing(config, routes, now)
    }

    /// Creates the engine around a caller-provided routing table.
    pub fn with_routing(config: OverlayConfig, routes: Box<dyn RoutingTable>, now: u64) -> Result<Self> {
        let mut host_cache = HostCache::init(config.host_cache.clone(), config.host_cache_db.as_deref())?;
        for entry in &config.known_hosts {
            match entry.parse::<HostAddr>() {
                Ok(addr) => {
                    host_cache.add_caught(HostType::Any, addr, now, "bootstrap");
                }
                Err(_) => warn!("Ignoring malformed bootstrap host {:?}", entry),
            }
        }
        info!(
            "Overlay started with {} cached hosts",
            host_cache.total_size()
        );
        Ok(Self {
            settings: NodeSettings::from_config(&config),
            config,
            nodes: BTreeMap::new(),
            host_cache,
            routes,
            next_id: 1,
            last_discovery: None,
            stats: OverlayStats::default(),
        })
    }

    // ===== Node lifecycle =====

    /// Registers a connection we are about to dial.
    pub fn add_outgoing(&mut self, addr: HostAddr, now: u64) -> Result<NodeId> {
        self.check_admission(&addr)?;
        let id = self.allocate_id();
        debug!("Dialing {} as {}", addr, id);
        self.insert(Node::new_outgoing(id, addr, self.settings.clone(), now));
        Ok(id)
    }

    /// Registers a connection accepted from the listener.
    pub fn add_incoming(&mut self, addr: HostAddr, now: u64) -> Result<NodeId> {
        if self.nodes.len() >= self.config.max_connections {
            return Err(OverlayError::PeerLimitReached);
        }
        let id = self.allocate_id();
        debug!("Incoming connection from {} as {}", addr, id);
        self.insert(Node::new_incoming(id, addr, self.settings.clone(), now));
        Ok(id)
    }

    fn check_admission(&self, addr: &HostAddr) -> Result<()> {
        if self.nodes.len() >= self.config.max_connections {
            return Err(OverlayError::PeerLimitReached);
        }
        if !self.host_cache.is_routable(addr) {
            return Err(OverlayError::InvalidAddress(addr.to_string()));
        }
        if self.is_connected_to(addr) {
            return Err(OverlayError::AlreadyConnected(addr.to_string()));
        }
        Ok(())
    }

    fn allocate_id(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }

    fn insert(&mut self, node: Node) {
        self.stats.nodes_added += 1;
        self.nodes.insert(node.id(), node);
    }

    /// Hands a node its transport.
    pub fn attach_transport(&mut self, id: NodeId, transport: Box<dyn Transport>) -> Result<()> {
        self.node_mut(id)?.attach_transport(transport);
        Ok(())
    }

    /// The outgoing TCP connection is up: returns the greeting to write.
    pub fn connection_established(&mut self, id: NodeId) -> Result<String> {
        let node = self.nodes.get_mut(&id).ok_or(OverlayError::NodeNotFound(id))?;
        let result = node.on_connected(&self.config.local);
        match result {
            Ok(request) => Ok(request.to_wire()),
            Err(e) => {
                self.reap(id);
                Err(e.into())
            }
        }
    }

    /// The dial failed or timed out.
    pub fn connect_failed(&mut self, id: NodeId, error: &OverlayError, now: u64) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let addr = node.addr();
        node.on_io_error(&error.to_string(), now);
        self.host_cache.add(HostCategory::Timeout, addr, now, "connect failed");
        self.reap(id);
    }

    /// Processes one complete handshake block (greeting or status line with
    /// its headers).
    pub fn handshake_block(&mut self, id: NodeId, block: &str, now: u64) -> Result<HandshakeStep> {
        let local = self.config.local.clone();
        let node = self.nodes.get_mut(&id).ok_or(OverlayError::NodeNotFound(id))?;
        let status = node.status();

        let result = match status {
            NodeStatus::ReceivingHello => HandshakeRequest::parse(block)
                .and_then(|request| node.on_hello(&request, &local))
                .map(|welcome| (Some(welcome.to_wire()), HandshakeOutcome::Continue)),
            NodeStatus::HelloSent => HandshakeResponse::parse(block)
                .and_then(|response| node.on_welcome(&response, &local, now))
                .map(|ack| (Some(ack.to_wire()), HandshakeOutcome::Established)),
            NodeStatus::WelcomeSent => HandshakeResponse::parse(block)
                .and_then(|response| node.on_final_ack(&response, now))
                .map(|()| (None, HandshakeOutcome::Established)),
            other => Err(HandshakeError::UnexpectedStep(other.name())),
        };

        match result {
            Ok((reply, outcome)) => {
                if outcome == HandshakeOutcome::Established {
                    self.on_established(id, now);
                }
                Ok(HandshakeStep { reply, outcome })
            }
            Err(e) => {
                let reply = self.on_handshake_failed(id, &e, now);
                Ok(HandshakeStep {
                    reply,
                    outcome: HandshakeOutcome::Failed,
                })
            }
        }
    }

    fn on_established(&mut self, id: NodeId, now: u64) {
        self.stats.handshakes_completed += 1;
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        if let Some(listen) = node.listen_addr() {
            self.host_cache
                .add_valid(node.role().host_type(), listen, now, "connected");
        }
        if self.host_cache.is_low(HostCategory::FreshAny) {
            let ttl = self.config.local.max_ttl;
            self.send_ping(id, ttl, now);
        }
    }

    fn on_handshake_failed(&mut self, id: NodeId, error: &HandshakeError, now: u64) -> Option<String> {
        self.stats.handshakes_failed += 1;
        let mut reply = None;
        if let Some(node) = self.nodes.get_mut(&id) {
            // Make sure the node is gone even for failures detected here.
            node.remove(&format!("Handshake failed: {}", error));
            if !node.flags().incoming {
                let addr = node.addr();
                if error.is_busy() {
                    self.host_cache.add(HostCategory::Busy, addr, now, "busy");
                } else if error.is_alien() {
                    self.host_cache.add(HostCategory::Alien, addr, now, "alien");
                }
            }
            if !matches!(error, HandshakeError::Refused { .. }) {
                reply = Some(HandshakeResponse::refusal(error.status_code(), error.to_string()).to_wire());
            }
        }
        self.reap(id);
        reply
    }

    // ===== Message flow =====

    /// Feeds bytes read from a node's socket.
    pub fn receive_data(&mut self, id: NodeId, data: &[u8], now: u64) -> Result<()> {
        let node = self.node_mut(id)?;
        let messages = node.feed(data, now)?;
        for message in messages {
            self.dispatch(id, message, now);
        }
        Ok(())
    }

    fn dispatch(&mut self, from: NodeId, message: Message, now: u64) {
        self.stats.messages_received += 1;
        let Some(node) = self.nodes.get_mut(&from) else {
            return;
        };
        match node.receive(&message, now) {
            Inbound::Dropped(reason) => {
                trace!("{}: dropped {} ({:?})", from, message.function().name(), reason);
            }
            Inbound::Bye { .. } => {}
            Inbound::Ping(verdict) => self.answer_ping(from, &message, verdict, now),
            Inbound::Route => self.route(from, message, now),
        }
    }

    /// Answers a ping with our own pong and, for accepted pings, with pongs
    /// for cached hosts. Pings are never relayed.
    fn answer_ping(&mut self, from: NodeId, ping: &Message, verdict: PingVerdict, now: u64) {
        let muid = ping.header.muid;
        if !self.routes.record(muid, MessageFunction::Ping, from, now) {
            self.note_duplicate(from);
            return;
        }
        let pong_ttl = ping.header.hops.saturating_add(1);
        let own = Message::pong(muid, pong_ttl, &self.local_pong());
        let Some(node) = self.nodes.get_mut(&from) else {
            return;
        };
        node.send(&own, &*self.routes, now);
        if verdict != PingVerdict::Accepted {
            return;
        }

        let missing = node
            .ping_state()
            .map_or(0, |state| state.pongs_missing() as usize)
            .min(MAX_CACHED_PONGS);
        if missing == 0 {
            return;
        }
        let requester = node.listen_addr();
        // One spare in case the requester itself is drawn.
        let wanted = missing + 1;
        let mut candidates = self.host_cache.fill(HostCategory::ValidUltra, wanted);
        if candidates.len() < wanted {
            candidates.extend(self.host_cache.fill(HostCategory::ValidAny, wanted - candidates.len()));
        }
        for entry in candidates.into_iter().filter(|e| Some(e.addr) != requester) {
            // Hops below the ping's TTL keep `ttl + hops` under the hard limit.
            let Some(hops) = node.ping_state().and_then(|state| state.next_cached_hops()) else {
                break;
            };
            let info = PongInfo {
                addr: entry.addr,
                files: 0,
                kbytes: 0,
            };
            let mut pong = Message::pong(muid, pong_ttl, &info);
            pong.header.hops = hops;
            if node.send(&pong, &*self.routes, now) != SendOutcome::Queued {
                break;
            }
            self.stats.pongs_from_cache += 1;
        }
    }

    fn route(&mut self, from: NodeId, message: Message, now: u64) {
        let function = message.function();
        match function {
            MessageFunction::Query => {
                if !self.routes.record(message.header.muid, function, from, now) {
                    self.note_duplicate(from);
                    return;
                }
                if let Some(relayed) = message.relayed() {
                    self.forward(from, &relayed, now);
                }
            }
            MessageFunction::Pong => {
                if let Some(info) = PongInfo::parse(&message.payload) {
                    if self.host_cache.add_caught(HostType::Any, info.addr, now, "pong") {
                        self.stats.pongs_harvested += 1;
                    }
                }
                self.route_reply(from, &message, now);
            }
            MessageFunction::QueryHit => self.route_reply(from, &message, now),
            f if helpers::is_link_local(f) => {}
            _ => trace!("{}: not routing {}", from, function.name()),
        }
    }

    fn route_reply(&mut self, from: NodeId, reply: &Message, now: u64) {
        match self.routes.reply_target(&reply.header.muid, reply.function()) {
            Some(NodeId::LOCAL) => trace!("{} for us from {}", reply.function().name(), from),
            Some(target) if target != from => {
                let (Some(relayed), Some(node)) = (reply.relayed(), self.nodes.get_mut(&target)) else {
                    return;
                };
                if node.send(&relayed, &*self.routes, now) == SendOutcome::Queued {
                    self.stats.messages_routed += 1;
                }
            }
            _ => trace!("No route for {} {}", reply.function().name(), reply.header.muid),
        }
    }

    /// Sends to every established non-leaf node except `except`. Returns the
    /// number of nodes that took the message.
    fn forward(&mut self, except: NodeId, message: &Message, now: u64) -> usize {
        let mut sent = 0;
        for (id, node) in self.nodes.iter_mut() {
            if *id == except || !node.is_established() || node.is_leaf() {
                continue;
            }
            if node.send(message, &*self.routes, now) == SendOutcome::Queued {
                sent += 1;
            }
        }
        self.stats.messages_routed += sent as u64;
        sent
    }

    fn note_duplicate(&mut self, from: NodeId) {
        self.stats.duplicates += 1;
        if let Some(node) = self.nodes.get_mut(&from) {
            node.note_duplicate();
        }
    }

    fn local_pong(&self) -> PongInfo {
        let local = &self.config.local;
        let addr = local.listen_addr.map(HostAddr::from).unwrap_or_else(|| {
            HostAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.config.listen_addr.port())
        });
        PongInfo {
            addr,
            files: local.shared_files,
            kbytes: local.shared_kbytes,
        }
    }

    fn send_ping(&mut self, id: NodeId, ttl: u8, now: u64) {
        let ping = Message::ping(ttl);
        self.routes
            .record(ping.header.muid, MessageFunction::Ping, NodeId::LOCAL, now);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.send(&ping, &*self.routes, now);
        }
    }

    /// Queues a message for one node.
    pub fn send(&mut self, id: NodeId, message: &Message, now: u64) -> Result<SendOutcome> {
        let node = self.nodes.get_mut(&id).ok_or(OverlayError::NodeNotFound(id))?;
        Ok(node.send(message, &*self.routes, now))
    }

    /// Issues a query of our own to all eligible nodes. Returns its MUID
    /// and the number of nodes it went to.
    pub fn query(&mut self, payload: Bytes, now: u64) -> (Muid, usize) {
        let query = Message::new(MessageFunction::Query, self.config.local.max_ttl, payload);
        let muid = query.header.muid;
        self.routes.record(muid, MessageFunction::Query, NodeId::LOCAL, now);
        (muid, self.forward(NodeId::LOCAL, &query, now))
    }

    /// Pings every established node to discover hosts.
    pub fn ping_all(&mut self, now: u64) {
        let ttl = self.config.local.max_ttl;
        let ids: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.is_established())
            .map(|n| n.id())
            .collect();
        for id in ids {
            self.send_ping(id, ttl, now);
        }
        self.last_discovery = Some(now);
    }

    /// The peer announced a new hops-flow value.
    pub fn set_hops_flow(&mut self, id: NodeId, hops: u8, now: u64) -> Result<()> {
        self.node_mut(id)?.set_hops_flow(hops, now);
        Ok(())
    }

    /// Bytes the node wants written, up to `max_bytes`.
    pub fn take_output(&mut self, id: NodeId, max_bytes: usize, now: u64) -> Result<Option<Bytes>> {
        let node = self.node_mut(id)?;
        if !node.has_pending_output() {
            return Ok(None);
        }
        let mut buf = Vec::with_capacity(max_bytes.min(64 * 1024));
        node.drain(&mut buf, max_bytes, now)?;
        Ok((!buf.is_empty()).then(|| Bytes::from(buf)))
    }

    /// Nodes that have data waiting for their socket.
    pub fn pending_output(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.has_pending_output())
            .map(|n| n.id())
            .collect()
    }

    /// Closes a node with a Bye.
    pub fn close(&mut self, id: NodeId, code: u16, reason: &str, now: u64) -> Result<()> {
        self.node_mut(id)?.bye(code, reason, now);
        self.reap(id);
        Ok(())
    }

    /// The remote closed the connection.
    pub fn on_eof(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.on_eof();
        }
        self.reap(id);
    }

    /// Reading or writing the socket failed.
    pub fn on_io_error(&mut self, id: NodeId, error: &str, now: u64) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.on_io_error(error, now);
        }
        self.reap(id);
    }

    // ===== Housekeeping =====

    /// Periodic tick. Returns the nodes removed during it.
    pub fn tick(&mut self, now: u64) -> Vec<NodeId> {
        let mut removed = Vec::new();
        let mut timed_out = Vec::new();
        for (id, node) in self.nodes.iter_mut() {
            let dialing = node.is_connecting() && !node.flags().incoming;
            if node.tick(now) == NodeTick::Remove {
                if dialing {
                    timed_out.push(node.addr());
                }
                removed.push(*id);
            }
        }
        for addr in timed_out {
            self.host_cache.add(HostCategory::Timeout, addr, now, "handshake timeout");
        }
        for id in &removed {
            self.purge(*id);
        }

        self.routes.expire(now);
        self.host_cache.tick(now);

        let due = self
            .last_discovery
            .map_or(true, |last| now.saturating_sub(last) >= DISCOVERY_PING_INTERVAL);
        if due && self.host_cache.is_low(HostCategory::FreshAny) && self.established_count() > 0 {
            debug!("Host cache is low, pinging neighbours");
            self.ping_all(now);
        }
        removed
    }

    fn reap(&mut self, id: NodeId) -> bool {
        let removing = self
            .nodes
            .get(&id)
            .is_some_and(|n| n.status() == NodeStatus::Removing);
        if removing {
            self.purge(id);
        }
        removing
    }

    fn purge(&mut self, id: NodeId) -> Option<Node> {
        let mut node = self.nodes.remove(&id)?;
        node.remove("Removed");
        self.routes.remove_node(id);
        self.stats.nodes_removed += 1;
        Some(node)
    }

    /// Removes a node at once, without a Bye.
    pub fn remove_node(&mut self, id: NodeId, reason: &str) -> Option<Node> {
        self.nodes.get_mut(&id)?.remove(reason);
        self.purge(id)
    }

    /// Says goodbye to every node. Their queues stay up so the Bye can still
    /// be written before [`shutdown`](Self::shutdown).
    pub fn begin_shutdown(&mut self, now: u64) {
        info!("Closing {} nodes", self.nodes.len());
        for node in self.nodes.values_mut() {
            node.bye(200, "Servent shutdown", now);
        }
    }

    /// Removes every node and saves the host cache.
    pub fn shutdown(&mut self) -> Result<()> {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            self.remove_node(id, "Servent shutdown");
        }
        self.host_cache.shutdown()
    }

    /// Next address to dial, if we are below the target connection count.
    pub fn next_bootstrap_addr(&mut self) -> Option<HostAddr> {
        if self.nodes.len() >= self.config.target_connections {
            return None;
        }
        let local_ip = self.config.local.listen_addr.map(|a| a.ip());
        for host_type in [HostType::Ultra, HostType::Any] {
            if let Some(ip) = local_ip {
                if let Some(addr) = self.host_cache.find_nearby(host_type, ip) {
                    if !self.is_connected_to(&addr) {
                        return Some(addr);
                    }
                }
            }
            while let Some(addr) = self.host_cache.get_caught(host_type) {
                if !self.is_connected_to(&addr) {
                    return Some(addr);
                }
            }
        }
        None
    }

    // ===== Accessors =====

    fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(&id).ok_or(OverlayError::NodeNotFound(id))
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn established_count(&self) -> usize {
        self.nodes.values().filter(|n| n.is_established()).count()
    }

    pub fn is_connected_to(&self, addr: &HostAddr) -> bool {
        self.nodes
            .values()
            .any(|n| n.addr() == *addr || n.listen_addr() == Some(*addr))
    }

    pub fn snapshots(&self) -> Vec<NodeSnapshot> {
        self.nodes.values().map(NodeSnapshot::of).collect()
    }

    pub fn host_cache(&self) -> &HostCache {
        &self.host_cache
    }

    pub fn host_cache_mut(&mut self) -> &mut HostCache {
        &mut self.host_cache
    }

    pub fn routes(&self) -> &dyn RoutingTable {
        &*self.routes
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    pub fn stats(&self) -> OverlayStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Muid;
    use crate::handshake::{HeaderMap, LocalNodeInfo};

    fn config() -> OverlayConfig {
        OverlayConfig {
            local: LocalNodeInfo {
                compression: false,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn addr(n: u8) -> HostAddr {
        format!("20.0.0.{}:6346", n).parse().unwrap()
    }

    fn welcome(ultra: bool) -> String {
        let mut headers = HeaderMap::new();
        headers.insert("User-Agent", "gtk-gnutella/1.2.2");
        headers.insert("X-Ultrapeer", if ultra { "True" } else { "False" });
        headers.insert("Bye-Packet", "0.1");
        HandshakeResponse::ok(headers).to_wire()
    }

    /// Dials `addr` and completes the handshake.
    fn connect(overlay: &mut Overlay, addr: HostAddr, now: u64) -> NodeId {
        let id = overlay.add_outgoing(addr, now).unwrap();
        let greeting = overlay.connection_established(id).unwrap();
        assert!(greeting.starts_with("GNUTELLA CONNECT/0.6"));
        let step = overlay.handshake_block(id, &welcome(true), now).unwrap();
        assert_eq!(step.outcome, HandshakeOutcome::Established);
        id
    }

    fn drain_all(overlay: &mut Overlay, id: NodeId) -> Vec<Message> {
        let bytes = overlay.take_output(id, usize::MAX, 0).unwrap().unwrap_or_default();
        let mut codec = crate::codec::MessageCodec::default();
        let mut buf = bytes::BytesMut::from(&bytes[..]);
        let mut out = Vec::new();
        while let Some(m) = tokio_util::codec::Decoder::decode(&mut codec, &mut buf).unwrap() {
            out.push(m);
        }
        out
    }

    #[test]
    fn test_outgoing_handshake_validates_host() {
        let mut overlay = Overlay::new(config(), 0).unwrap();
        let id = connect(&mut overlay, addr(1), 0);
        assert!(overlay.node(id).unwrap().is_established());
        assert_eq!(
            overlay.host_cache().category_of(&addr(1)),
            Some(HostCategory::ValidUltra)
        );
        assert_eq!(overlay.stats().handshakes_completed, 1);
    }

    #[test]
    fn test_incoming_handshake() {
        let mut overlay = Overlay::new(config(), 0).unwrap();
        let id = overlay.add_incoming(addr(2), 0).unwrap();
        let request = LocalNodeInfo {
            user_agent: "LimeWire/4.12".into(),
            ..Default::default()
        }
        .request();
        let step = overlay.handshake_block(id, &request.to_wire(), 0).unwrap();
        assert_eq!(step.outcome, HandshakeOutcome::Continue);
        assert!(step.reply.unwrap().starts_with("GNUTELLA/0.6 200"));

        let ack = HandshakeResponse::ok(HeaderMap::new()).to_wire();
        let step = overlay.handshake_block(id, &ack, 1).unwrap();
        assert_eq!(step.outcome, HandshakeOutcome::Established);
        assert!(step.reply.is_none());
        assert_eq!(overlay.established_count(), 1);
    }

    #[test]
    fn test_busy_host_is_remembered() {
        let mut overlay = Overlay::new(config(), 0).unwrap();
        let id = overlay.add_outgoing(addr(3), 0).unwrap();
        overlay.connection_established(id).unwrap();
        let busy = HandshakeResponse::refusal(503, "Busy").to_wire();
        let step = overlay.handshake_block(id, &busy, 1).unwrap();
        assert_eq!(step.outcome, HandshakeOutcome::Failed);
        assert!(step.reply.is_none());
        assert!(overlay.node(id).is_none());
        assert_eq!(overlay.host_cache().category_of(&addr(3)), Some(HostCategory::Busy));
        assert_eq!(overlay.stats().handshakes_failed, 1);
    }

    #[test]
    fn test_garbage_greeting_is_refused() {
        let mut overlay = Overlay::new(config(), 0).unwrap();
        let id = overlay.add_incoming(addr(4), 0).unwrap();
        let step = overlay.handshake_block(id, "HELLO THERE\r\n\r\n", 0).unwrap();
        assert_eq!(step.outcome, HandshakeOutcome::Failed);
        assert!(step.reply.unwrap().starts_with("GNUTELLA/0.6 400"));
        assert_eq!(overlay.node_count(), 0);
    }

    #[test]
    fn test_duplicate_connection_rejected() {
        let mut overlay = Overlay::new(config(), 0).unwrap();
        connect(&mut overlay, addr(5), 0);
        assert!(matches!(
            overlay.add_outgoing(addr(5), 0),
            Err(OverlayError::AlreadyConnected(_))
        ));
    }

    #[test]
    fn test_connection_limit() {
        let mut overlay = Overlay::new(
            OverlayConfig {
                max_connections: 1,
                ..config()
            },
            0,
        )
        .unwrap();
        overlay.add_incoming(addr(6), 0).unwrap();
        assert!(matches!(
            overlay.add_incoming(addr(7), 0),
            Err(OverlayError::PeerLimitReached)
        ));
    }

    #[test]
    fn test_query_forwarded_and_hit_routed_back() {
        let mut overlay = Overlay::new(config(), 0).unwrap();
        let a = connect(&mut overlay, addr(10), 0);
        let b = connect(&mut overlay, addr(11), 0);
        drain_all(&mut overlay, a);
        drain_all(&mut overlay, b);

        let query = Message::with_muid(Muid::random(), MessageFunction::Query, 3, 0, Bytes::from_static(b"\0\0x\0"));
        overlay.receive_data(a, &query.to_bytes(), 1).unwrap();
        let at_b = drain_all(&mut overlay, b);
        assert_eq!(at_b.len(), 1);
        assert_eq!(at_b[0].header.ttl, 2);
        assert_eq!(at_b[0].header.hops, 1);

        // Second copy through b is a duplicate.
        overlay.receive_data(b, &at_b[0].to_bytes(), 1).unwrap();
        assert!(drain_all(&mut overlay, a).is_empty());
        assert_eq!(overlay.stats().duplicates, 1);

        let hit = Message::with_muid(query.header.muid, MessageFunction::QueryHit, 3, 0, Bytes::from_static(b"hit"));
        overlay.receive_data(b, &hit.to_bytes(), 2).unwrap();
        let at_a = drain_all(&mut overlay, a);
        assert_eq!(at_a.len(), 1);
        assert_eq!(at_a[0].function(), MessageFunction::QueryHit);
    }

    #[test]
    fn test_ping_answered_with_pongs() {
        let mut overlay = Overlay::new(config(), 0).unwrap();
        overlay
            .host_cache_mut()
            .add_valid(HostType::Ultra, addr(50), 0, "test");
        let a = connect(&mut overlay, addr(12), 0);
        drain_all(&mut overlay, a);

        let ping = Message::ping(3);
        overlay.receive_data(a, &ping.to_bytes(), 5).unwrap();
        let replies = drain_all(&mut overlay, a);
        assert!(replies.iter().all(|m| m.function() == MessageFunction::Pong));
        let hosts: Vec<HostAddr> = replies
            .iter()
            .filter_map(|m| PongInfo::parse(&m.payload))
            .map(|info| info.addr)
            .collect();
        assert!(hosts.contains(&addr(50)));
        assert_eq!(overlay.stats().pongs_from_cache, 1);
        // Our pong and one cached pong settled their share of the demand.
        let state = overlay.node(a).unwrap().ping_state().unwrap();
        assert_eq!(state.pongs_missing(), crate::ping_pong::MAX_PONGS - 2);
    }

    #[test]
    fn test_relayed_ping_answers_stay_within_hard_ttl() {
        let mut overlay = Overlay::new(config(), 0).unwrap();
        for n in 70..80 {
            overlay
                .host_cache_mut()
                .add_valid(HostType::Ultra, addr(n), 0, "test");
        }
        let a = connect(&mut overlay, addr(15), 0);
        drain_all(&mut overlay, a);

        let mut ping = Message::ping(6);
        ping.header.hops = 1;
        overlay.receive_data(a, &ping.to_bytes(), 5).unwrap();
        let replies = drain_all(&mut overlay, a);
        assert!(replies.len() > 1);
        assert_eq!(replies.len() as u32, crate::ping_pong::MAX_PONGS);

        let limit = overlay.config().hard_ttl_limit;
        let mut peer = Overlay::new(config(), 0).unwrap();
        let p = connect(&mut peer, addr(16), 0);
        for pong in &replies {
            assert_eq!(pong.header.ttl, 2);
            assert!(pong.header.ttl + pong.header.hops <= limit);
            assert!(pong.header.hops < 6);
            peer.receive_data(p, &pong.to_bytes(), 5).unwrap();
        }
        let stats = peer.node(p).unwrap().stats();
        assert_eq!(stats.n_hard_ttl, 0);
        assert_eq!(stats.rx_dropped, 0);
        assert_eq!(stats.n_pong_received, replies.len() as u64);
    }

    #[test]
    fn test_pongs_feed_host_cache() {
        let mut overlay = Overlay::new(config(), 0).unwrap();
        let a = connect(&mut overlay, addr(13), 0);
        let info = PongInfo {
            addr: addr(60),
            files: 3,
            kbytes: 100,
        };
        let pong = Message::pong(Muid::random(), 2, &info);
        overlay.receive_data(a, &pong.to_bytes(), 1).unwrap();
        assert_eq!(overlay.host_cache().category_of(&addr(60)), Some(HostCategory::FreshAny));
        assert_eq!(overlay.stats().pongs_harvested, 1);
    }

    #[test]
    fn test_close_and_tick_removal() {
        let mut overlay = Overlay::new(config(), 0).unwrap();
        let a = connect(&mut overlay, addr(14), 0);
        overlay.close(a, 200, "Bye", 10).unwrap();
        assert_eq!(overlay.node(a).unwrap().status(), NodeStatus::Shutdown);
        let delay = overlay.config().shutdown_delay_secs;
        assert_eq!(overlay.tick(10 + delay), vec![a]);
        assert!(overlay.node(a).is_none());
    }

    #[test]
    fn test_handshake_timeout_marks_host() {
        let mut overlay = Overlay::new(config(), 0).unwrap();
        let id = overlay.add_outgoing(addr(15), 0).unwrap();
        let timeout = overlay.config().handshake_timeout_secs;
        assert_eq!(overlay.tick(timeout), vec![id]);
        assert_eq!(overlay.host_cache().category_of(&addr(15)), Some(HostCategory::Timeout));
    }

    #[test]
    fn test_bootstrap_skips_connected_hosts() {
        let mut overlay = Overlay::new(
            OverlayConfig {
                known_hosts: vec!["20.0.0.20:6346".into(), "not an address".into()],
                ..config()
            },
            0,
        )
        .unwrap();
        assert_eq!(overlay.next_bootstrap_addr(), Some(addr(20)));
        assert_eq!(overlay.next_bootstrap_addr(), None);
    }

    #[test]
    fn test_shutdown_sends_bye_then_removes() {
        let mut overlay = Overlay::new(config(), 0).unwrap();
        let a = connect(&mut overlay, addr(16), 0);
        drain_all(&mut overlay, a);
        overlay.begin_shutdown(5);
        let out = drain_all(&mut overlay, a);
        assert_eq!(out.last().map(|m| m.function()), Some(MessageFunction::Bye));
        overlay.shutdown().unwrap();
        assert_eq!(overlay.node_count(), 0);
        assert_eq!(overlay.stats().nodes_removed, 1);
    }

    #[test]
    fn test_own_query_reaches_all() {
        let mut overlay = Overlay::new(config(), 0).unwrap();
        connect(&mut overlay, addr(30), 0);
        connect(&mut overlay, addr(31), 0);
        assert_eq!(overlay.query(Bytes::from_static(b"\0\0abc\0"), 1).1, 2);
    }
}
