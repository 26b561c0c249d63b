//! Duplicate detection and reply routing.
//!
//! Broadcast messages (pings and queries) are remembered by MUID together
//! with the node they came from. A second copy of the same request is a
//! duplicate and is not forwarded again. Replies (pongs and query hits)
//! carry the MUID of their request and travel back along the recorded
//! route.
//!
//! Nodes only ever see the table through [`RoutingTable`], which is what
//! lets a node decide whether relaying a query is still useful without
//! owning any routing state itself.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::codec::{helpers, MessageFunction, Muid};
use crate::NodeId;

/// How long routes are remembered by default.
pub const DEFAULT_ROUTE_TTL_SECS: u64 = 600;

/// Entries kept before an early cleanup is forced.
const MAX_ENTRIES: usize = 100_000;

/// Shared routing state, as seen from the nodes and the overlay.
pub trait RoutingTable: Send {
    /// Remembers a request. Returns false if it was already known.
    fn record(&mut self, muid: Muid, function: MessageFunction, from: NodeId, now: u64) -> bool;

    /// Where a reply with this MUID should go.
    fn reply_target(&self, muid: &Muid, reply: MessageFunction) -> Option<NodeId>;

    /// True if replies to this request still have somewhere to go.
    fn route_exists_for_reply(&self, muid: &Muid, request: MessageFunction) -> bool;

    /// Forgets a node as the origin of any route.
    fn remove_node(&mut self, node: NodeId);

    /// Drops routes older than the retention period.
    fn expire(&mut self, now: u64);
}

struct RouteEntry {
    first_seen: u64,
    origin: Option<NodeId>,
    duplicates: u32,
}

/// Statistics snapshot from a [`RouteTable`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteTableStats {
    /// Requests currently remembered.
    pub routes: usize,
    pub total_messages: u64,
    pub duplicates: u64,
}

impl RouteTableStats {
    /// Duplicate rate as a percentage, 0.0 before any traffic.
    pub fn duplicate_rate(&self) -> f64 {
        if self.total_messages == 0 {
            0.0
        } else {
            (self.duplicates as f64 / self.total_messages as f64) * 100.0
        }
    }
}

/// In-memory [`RoutingTable`] with time-based expiry.
pub struct RouteTable {
    routes: HashMap<(Muid, MessageFunction), RouteEntry>,
    ttl: u64,
    last_cleanup: u64,
    total_messages: u64,
    duplicates: u64,
}

impl RouteTable {
    pub fn new(ttl: u64) -> Self {
        Self {
            routes: HashMap::new(),
            ttl,
            last_cleanup: 0,
            total_messages: 0,
            duplicates: 0,
        }
    }

    pub fn stats(&self) -> RouteTableStats {
        RouteTableStats {
            routes: self.routes.len(),
            total_messages: self.total_messages,
            duplicates: self.duplicates,
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Number of extra copies seen for a request.
    pub fn duplicates_of(&self, muid: &Muid, function: MessageFunction) -> u32 {
        self.routes
            .get(&(*muid, function))
            .map_or(0, |entry| entry.duplicates)
    }

    fn maybe_cleanup(&mut self, now: u64) {
        if now.saturating_sub(self.last_cleanup) > self.ttl / 4 || self.routes.len() > MAX_ENTRIES {
            self.expire(now);
        }
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new(DEFAULT_ROUTE_TTL_SECS)
    }
}

impl RoutingTable for RouteTable {
    fn record(&mut self, muid: Muid, function: MessageFunction, from: NodeId, now: u64) -> bool {
        self.total_messages += 1;
        self.maybe_cleanup(now);

        if let Some(entry) = self.routes.get_mut(&(muid, function)) {
            entry.duplicates += 1;
            self.duplicates += 1;
            trace!("Duplicate {} {} from {}", function.name(), muid, from);
            return false;
        }
        self.routes.insert(
            (muid, function),
            RouteEntry {
                first_seen: now,
                origin: Some(from),
                duplicates: 0,
            },
        );
        true
    }

    fn reply_target(&self, muid: &Muid, reply: MessageFunction) -> Option<NodeId> {
        let request = helpers::request_for_reply(reply)?;
        self.routes.get(&(*muid, request))?.origin
    }

    fn route_exists_for_reply(&self, muid: &Muid, request: MessageFunction) -> bool {
        self.routes
            .get(&(*muid, request))
            .is_some_and(|entry| entry.origin.is_some())
    }

    fn remove_node(&mut self, node: NodeId) {
        let mut orphaned = 0;
        for entry in self.routes.values_mut() {
            if entry.origin == Some(node) {
                entry.origin = None;
                orphaned += 1;
            }
        }
        if orphaned > 0 {
            debug!("Orphaned {} routes through {}", orphaned, node);
        }
    }

    fn expire(&mut self, now: u64) {
        let ttl = self.ttl;
        let before = self.routes.len();
        self.routes
            .retain(|_, entry| now.saturating_sub(entry.first_seen) < ttl);
        let removed = before - self.routes.len();
        if removed > 0 {
            debug!("Route table cleanup: removed {} expired entries", removed);
        }
        self.last_cleanup = now;
    }
}
