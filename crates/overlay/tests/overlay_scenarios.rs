//! End-to-end scenarios driving the engine without sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use gnet_overlay::{
    HandshakeOutcome, HostAddr, HostCache, HostCacheConfig, HostCategory, HostType, LocalNodeInfo,
    Message, MessageFunction, Node, NodeId, NodeSettings, NodeStatus, NodeTick, Overlay,
    OverlayConfig, PeerRole, RouteTable, SendOutcome, Transport,
};

fn host(s: &str) -> HostAddr {
    s.parse().unwrap()
}

// ===== Host cache =====

#[test]
fn full_category_keeps_the_freshest_hosts() {
    let config = HostCacheConfig {
        fresh_capacity: 5,
        ..Default::default()
    };
    let mut cache = HostCache::new_in_memory(config);
    for i in 1..=10u8 {
        let addr = host(&format!("30.0.0.{}:6346", i));
        assert!(cache.add_caught(HostType::Any, addr, 1000 + i as u64, "test"));
    }

    let mut kept: Vec<HostAddr> = cache
        .entries(HostCategory::FreshAny)
        .into_iter()
        .map(|e| e.addr)
        .collect();
    kept.sort();
    let expected: Vec<HostAddr> = (6..=10u8)
        .map(|i| host(&format!("30.0.0.{}:6346", i)))
        .collect();
    assert_eq!(kept, expected);
    assert_eq!(cache.size(HostCategory::FreshAny), 5);
    assert_eq!(cache.total_size(), 5);
    assert!(!cache.lookup(&host("30.0.0.1:6346")));
}

// ===== Swift mode =====

/// Connects a node to a peer announcing `peer_ultra`, as seen from an
/// ultrapeer.
fn established_node(peer_ultra: bool) -> Node {
    let local = LocalNodeInfo {
        compression: false,
        ..Default::default()
    };
    let remote = LocalNodeInfo {
        compression: false,
        ultrapeer: peer_ultra,
        ..Default::default()
    };

    let mut ours = Node::new_outgoing(NodeId(1), host("40.0.0.1:6346"), NodeSettings::default(), 0);
    let mut theirs = Node::new_incoming(NodeId(1), host("40.0.0.2:50000"), NodeSettings::default(), 0);

    let hello = ours.on_connected(&local).unwrap();
    let welcome = theirs.on_hello(&hello, &remote).unwrap();
    let ack = ours.on_welcome(&welcome, &local, 0).unwrap();
    theirs.on_final_ack(&ack, 0).unwrap();
    assert!(theirs.is_established());
    ours
}

/// Fills the queue to twice its high watermark at t=0 and never drains it.
fn clog(node: &mut Node) {
    let routes = RouteTable::default();
    let target = 2 * node.queue().unwrap().high_watermark();
    while node.mqueue_pending() < target {
        let query = Message::new(MessageFunction::Query, 5, Bytes::from(vec![b'q'; 1000]));
        assert_eq!(node.send(&query, &routes, 0), SendOutcome::Queued);
    }
    assert!(node.in_tx_flow_control());
}

#[test]
fn regular_peer_goes_swift_after_grace() {
    let mut node = established_node(true);
    assert_eq!(node.role(), PeerRole::Ultra);
    clog(&mut node);

    for now in 1..=30 {
        assert_eq!(node.tick(now), NodeTick::Keep);
        assert!(!node.in_tx_swift_control(), "swift too early at t={}", now);
    }
    node.tick(31);
    assert!(node.in_tx_swift_control());
    // Swift mode shed queries down to the high watermark.
    assert!(node.mqueue_pending() <= node.queue().unwrap().high_watermark());
    assert!(node.stats().tx_dropped > 0);
}

#[test]
fn leaf_peer_waits_for_the_longer_grace() {
    let mut node = established_node(false);
    assert_eq!(node.role(), PeerRole::Leaf);
    clog(&mut node);

    for now in 1..=210 {
        node.tick(now);
        assert!(!node.in_tx_swift_control(), "swift too early at t={}", now);
    }
    node.tick(211);
    assert!(node.in_tx_swift_control());
}

#[test]
fn draining_below_high_watermark_avoids_swift() {
    let mut node = established_node(true);
    clog(&mut node);
    let hiwat = node.queue().unwrap().high_watermark();

    // Write out just enough to shrink the queue under the watermark.
    let mut sink = Vec::new();
    let excess = node.mqueue_pending() - hiwat + 1;
    node.drain(&mut sink, excess, 10).unwrap();
    assert!(node.mqueue_pending() < hiwat);

    for now in 11..=100 {
        node.tick(now);
        assert!(!node.in_tx_swift_control());
    }
}

// ===== Two engines talking =====

fn engine(listen: &str, ultrapeer: bool) -> Overlay {
    let config = OverlayConfig {
        local: LocalNodeInfo {
            listen_addr: Some(listen.parse().unwrap()),
            ultrapeer,
            ..Default::default()
        },
        ..Default::default()
    };
    Overlay::new(config, 0).unwrap()
}

/// Moves whatever `from` has queued for `from_id` into `to`.
fn pump(from: &mut Overlay, from_id: NodeId, to: &mut Overlay, to_id: NodeId, now: u64) -> bool {
    match from.take_output(from_id, usize::MAX, now).unwrap() {
        Some(bytes) => {
            to.receive_data(to_id, &bytes, now).unwrap();
            true
        }
        None => false,
    }
}

fn handshake(a: &mut Overlay, b: &mut Overlay, now: u64) -> (NodeId, NodeId) {
    let a_id = a.add_outgoing(host("50.0.0.2:6346"), now).unwrap();
    let b_id = b.add_incoming(host("50.0.0.1:41000"), now).unwrap();

    let greeting = a.connection_established(a_id).unwrap();
    let welcome = b.handshake_block(b_id, &greeting, now).unwrap();
    assert_eq!(welcome.outcome, HandshakeOutcome::Continue);
    let ack = a.handshake_block(a_id, welcome.reply.as_deref().unwrap(), now).unwrap();
    assert_eq!(ack.outcome, HandshakeOutcome::Established);
    let done = b.handshake_block(b_id, ack.reply.as_deref().unwrap(), now).unwrap();
    assert_eq!(done.outcome, HandshakeOutcome::Established);
    assert!(done.reply.is_none());
    (a_id, b_id)
}

#[test]
fn engines_handshake_and_exchange_compressed_traffic() {
    let mut a = engine("50.0.0.1:6346", true);
    let mut b = engine("50.0.0.2:6346", true);
    let (a_id, b_id) = handshake(&mut a, &mut b, 0);

    let node = a.node(a_id).unwrap();
    assert_eq!(node.role(), PeerRole::Ultra);
    assert!(node.tx_compressed() && node.rx_compressed());
    assert_eq!(node.listen_addr(), Some(host("50.0.0.2:6346")));
    // Incoming side learns the listening address from the handshake.
    assert_eq!(b.node(b_id).unwrap().listen_addr(), Some(host("50.0.0.1:6346")));
    assert_eq!(
        a.host_cache().category_of(&host("50.0.0.2:6346")),
        Some(HostCategory::ValidUltra)
    );

    // Both sides pinged on connect since their caches are nearly empty.
    assert!(pump(&mut a, a_id, &mut b, b_id, 1));
    assert!(pump(&mut b, b_id, &mut a, a_id, 1));
    assert!(pump(&mut a, a_id, &mut b, b_id, 1));
    assert!(a.node(a_id).unwrap().stats().n_pong_received >= 1);
    assert!(b.node(b_id).unwrap().stats().n_pong_received >= 1);

    // A query from a, answered by b.
    let (query_muid, reached) = a.query(Bytes::from_static(b"\0\0gnutella\0"), 2);
    assert_eq!(reached, 1);
    assert!(pump(&mut a, a_id, &mut b, b_id, 2));
    assert_eq!(b.node(b_id).unwrap().stats().rx_queries, 1);

    let hit = Message::with_muid(query_muid, MessageFunction::QueryHit, 7, 0, Bytes::from_static(b"hit"));
    assert_eq!(b.send(b_id, &hit, 3).unwrap(), SendOutcome::Queued);
    assert!(pump(&mut b, b_id, &mut a, a_id, 3));
    assert_eq!(a.node(a_id).unwrap().stats().rx_qhits, 1);

    let stats = a.node(a_id).unwrap().stats();
    assert!(stats.tx_given > 0 && stats.tx_written > 0);
}

#[test]
fn leaf_to_leaf_is_refused() {
    let mut a = engine("50.0.0.1:6346", false);
    let mut b = engine("50.0.0.2:6346", false);
    let a_id = a.add_outgoing(host("50.0.0.2:6346"), 0).unwrap();
    let b_id = b.add_incoming(host("50.0.0.1:41000"), 0).unwrap();

    let greeting = a.connection_established(a_id).unwrap();
    let refusal = b.handshake_block(b_id, &greeting, 0).unwrap();
    assert_eq!(refusal.outcome, HandshakeOutcome::Failed);
    assert!(b.node(b_id).is_none());

    let step = a
        .handshake_block(a_id, refusal.reply.as_deref().unwrap(), 0)
        .unwrap();
    assert_eq!(step.outcome, HandshakeOutcome::Failed);
    // The remote refused us, so there is nothing to answer.
    assert!(step.reply.is_none());
    assert!(a.node(a_id).is_none());
    assert_eq!(a.stats().handshakes_failed, 1);
}

// ===== Removal =====

struct CountingTransport(Arc<AtomicUsize>);

impl Transport for CountingTransport {
    fn close(&mut self, _reason: &str) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn removal_releases_the_transport_once() {
    let mut a = engine("50.0.0.1:6346", true);
    let mut b = engine("50.0.0.2:6346", true);
    let (a_id, _) = handshake(&mut a, &mut b, 0);

    let closes = Arc::new(AtomicUsize::new(0));
    a.attach_transport(a_id, Box::new(CountingTransport(closes.clone())))
        .unwrap();

    a.close(a_id, 200, "Going away", 10).unwrap();
    assert_eq!(a.node(a_id).unwrap().status(), NodeStatus::Shutdown);
    assert_eq!(closes.load(Ordering::SeqCst), 0);
    // The Bye is still waiting to be written.
    assert!(a.pending_output().contains(&a_id));

    // A read error during shutdown changes nothing.
    a.on_io_error(a_id, "connection reset", 11);
    assert_eq!(closes.load(Ordering::SeqCst), 0);

    let removed = a.tick(10 + a.config().shutdown_delay_secs);
    assert_eq!(removed, vec![a_id]);
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    assert!(a.remove_node(a_id, "again").is_none());
    a.on_eof(a_id);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(a.node_count(), 0);
}
