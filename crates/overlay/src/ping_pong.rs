//! Per-connection ping throttling and pong demultiplexing.
//!
//! Each connection keeps a small table of how many pongs it still owes the
//! remote peer, indexed by the hop count of the pong. Regular pings arriving
//! before the throttle window has elapsed are dropped. An accepted ping
//! replaces the table: one pong at hop 0 (our own), and the rest of
//! [`MAX_PONGS`] spread over hops `1..ttl`, so that every pong sent back
//! satisfies `ttl + hops` within the ping's own reach. Every pong sent at hop
//! `h` settles one unit of demand at `h`.
//!
//! "Alive" pings (TTL 1, hops 0) only check that the link is up. They are
//! answered directly and never touch the throttle.

use tracing::trace;

use crate::codec::Muid;
use crate::node::PeerRole;

/// Highest hop bucket tracked; higher hop counts are clamped into it.
pub const MAX_CACHE_HOPS: u8 = 6;

/// Most pongs owed for a single accepted ping.
pub const MAX_PONGS: u32 = 10;

/// Throttle window for peers and ultrapeers, in seconds.
pub const PING_REG_THROTTLE: u64 = 3;

/// Throttle window for leaves, in seconds.
pub const PING_LEAF_THROTTLE: u64 = 60;

const BUCKETS: usize = MAX_CACHE_HOPS as usize + 1;

/// Outcome of an incoming ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingVerdict {
    /// Regular ping accepted; the caller may answer and forward it.
    Accepted,
    /// Received inside the throttle window and dropped.
    Throttled,
    /// Alive ping, answer with our own pong only.
    Alive,
}

/// Ping/pong bookkeeping for one connection.
#[derive(Debug, Clone)]
pub struct PingPongState {
    pongs_needed: [u32; BUCKETS],
    pongs_missing: u32,
    ping_accept: u64,
    throttle: u64,
    last_ping: Option<Muid>,
    n_ping_accepted: u64,
    n_ping_throttled: u64,
    n_ping_alive: u64,
}

impl PingPongState {
    pub fn new(role: PeerRole) -> Self {
        Self {
            pongs_needed: [0; BUCKETS],
            pongs_missing: 0,
            ping_accept: 0,
            throttle: role.ping_throttle(),
            last_ping: None,
            n_ping_accepted: 0,
            n_ping_throttled: 0,
            n_ping_alive: 0,
        }
    }

    /// Updates the throttle window after the role was negotiated.
    pub fn set_role(&mut self, role: PeerRole) {
        self.throttle = role.ping_throttle();
    }

    /// Handles an incoming ping.
    ///
    /// A ping with TTL `t` reaches hosts up to `t - 1` hops behind us, so
    /// accepted pings owe pongs at hops `0..t`.
    pub fn on_ping(&mut self, muid: Muid, ttl: u8, hops: u8, now: u64) -> PingVerdict {
        if ttl == 1 && hops == 0 {
            self.n_ping_alive += 1;
            return PingVerdict::Alive;
        }
        if now < self.ping_accept {
            self.n_ping_throttled += 1;
            trace!(
                "Throttling ping {:?}, next accepted at {} (now {})",
                muid,
                self.ping_accept,
                now
            );
            return PingVerdict::Throttled;
        }

        self.ping_accept = now + self.throttle;
        self.last_ping = Some(muid);
        self.n_ping_accepted += 1;
        self.setup_demand(ttl);
        PingVerdict::Accepted
    }

    fn setup_demand(&mut self, ttl: u8) {
        self.pongs_needed = [0; BUCKETS];
        self.pongs_needed[0] = 1;

        let max_hop = bucket(ttl.saturating_sub(1));
        let mut remains = MAX_PONGS - 1;
        for h in 1..=max_hop {
            let amount = remains / (max_hop - h + 1) as u32;
            self.pongs_needed[h] = amount;
            remains -= amount;
        }
        self.pongs_missing = self.pongs_needed.iter().sum();
        self.check_invariant();
    }

    /// Records a pong sent back at hop distance `hops`.
    ///
    /// Returns true if that pong settled outstanding demand.
    pub fn on_pong_sent(&mut self, hops: u8) -> bool {
        let bucket = bucket(hops);
        let settled = self.pongs_needed[bucket] > 0;
        if settled {
            self.pongs_needed[bucket] -= 1;
            self.pongs_missing -= 1;
        }
        self.check_invariant();
        settled
    }

    /// Lowest non-zero hop count still owed a pong, for pongs relayed from
    /// the host cache.
    pub fn next_cached_hops(&self) -> Option<u8> {
        (1..BUCKETS)
            .find(|&h| self.pongs_needed[h] > 0)
            .map(|h| h as u8)
    }

    /// Forgets demand left over once the throttle window has elapsed.
    ///
    /// The remote is allowed to ping again at that point, so pongs still owed
    /// for the previous ping are stale.
    pub fn expire(&mut self, now: u64) {
        if self.pongs_missing > 0 && now >= self.ping_accept {
            trace!("Dropping {} stale pong demands", self.pongs_missing);
            self.pongs_needed = [0; BUCKETS];
            self.pongs_missing = 0;
            self.last_ping = None;
        }
        self.check_invariant();
    }

    fn check_invariant(&self) {
        debug_assert_eq!(
            self.pongs_missing,
            self.pongs_needed.iter().sum::<u32>(),
            "pongs_missing out of sync with per-hop demand"
        );
        debug_assert!(self.pongs_missing <= MAX_PONGS);
    }

    pub fn pongs_needed(&self, hops: u8) -> u32 {
        self.pongs_needed[bucket(hops)]
    }

    pub fn pongs_missing(&self) -> u32 {
        self.pongs_missing
    }

    /// Time from which the next regular ping is accepted.
    pub fn accept_after(&self) -> u64 {
        self.ping_accept
    }

    pub fn throttle_window(&self) -> u64 {
        self.throttle
    }

    /// MUID of the ping whose pongs are owed.
    pub fn last_ping(&self) -> Option<Muid> {
        self.last_ping
    }

    pub fn n_ping_accepted(&self) -> u64 {
        self.n_ping_accepted
    }

    pub fn n_ping_throttled(&self) -> u64 {
        self.n_ping_throttled
    }

    pub fn n_ping_alive(&self) -> u64 {
        self.n_ping_alive
    }
}

fn bucket(hops: u8) -> usize {
    hops.min(MAX_CACHE_HOPS) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum(state: &PingPongState) -> u32 {
        (0..=MAX_CACHE_HOPS).map(|h| state.pongs_needed(h)).sum()
    }

    #[test]
    fn test_peer_throttle_window() {
        let mut state = PingPongState::new(PeerRole::Normal);
        assert_eq!(state.on_ping(Muid::random(), 7, 0, 100), PingVerdict::Accepted);
        assert_eq!(state.accept_after(), 103);
        assert_eq!(state.on_ping(Muid::random(), 7, 0, 102), PingVerdict::Throttled);
        assert_eq!(state.on_ping(Muid::random(), 7, 0, 103), PingVerdict::Accepted);
        assert_eq!(state.n_ping_throttled(), 1);
        assert_eq!(state.n_ping_accepted(), 2);
    }

    #[test]
    fn test_ultra_uses_regular_window() {
        assert_eq!(PingPongState::new(PeerRole::Ultra).throttle_window(), PING_REG_THROTTLE);
    }

    #[test]
    fn test_leaf_throttle_window() {
        let mut state = PingPongState::new(PeerRole::Leaf);
        assert_eq!(state.on_ping(Muid::random(), 3, 0, 0), PingVerdict::Accepted);
        assert_eq!(state.on_ping(Muid::random(), 3, 0, 59), PingVerdict::Throttled);
        assert_eq!(state.on_ping(Muid::random(), 3, 0, 60), PingVerdict::Accepted);
    }

    #[test]
    fn test_set_role_changes_window() {
        let mut state = PingPongState::new(PeerRole::Normal);
        state.set_role(PeerRole::Leaf);
        assert_eq!(state.throttle_window(), PING_LEAF_THROTTLE);
    }

    #[test]
    fn test_alive_ping_bypasses_throttle() {
        let mut state = PingPongState::new(PeerRole::Normal);
        state.on_ping(Muid::random(), 7, 0, 10);
        assert_eq!(state.on_ping(Muid::random(), 1, 0, 10), PingVerdict::Alive);
        assert_eq!(state.pongs_missing(), MAX_PONGS);
        assert_eq!(state.n_ping_alive(), 1);
    }

    #[test]
    fn test_demand_spread_below_ping_ttl() {
        let mut state = PingPongState::new(PeerRole::Normal);
        state.on_ping(Muid::random(), 4, 0, 0);
        assert_eq!(state.pongs_needed(0), 1);
        assert_eq!(state.pongs_needed(1), 3);
        assert_eq!(state.pongs_needed(2), 3);
        assert_eq!(state.pongs_needed(3), 3);
        assert_eq!(state.pongs_needed(4), 0);
        assert_eq!(state.pongs_missing(), MAX_PONGS);
        assert_eq!(state.next_cached_hops(), Some(1));
    }

    #[test]
    fn test_ttl_one_owes_only_our_pong() {
        let mut state = PingPongState::new(PeerRole::Normal);
        assert_eq!(state.on_ping(Muid::random(), 1, 2, 0), PingVerdict::Accepted);
        assert_eq!(state.pongs_missing(), 1);
        assert_eq!(state.next_cached_hops(), None);
        assert!(state.on_pong_sent(0));
        assert_eq!(state.pongs_missing(), 0);
    }

    #[test]
    fn test_pong_accounting() {
        let mut state = PingPongState::new(PeerRole::Normal);
        state.on_ping(Muid::random(), 2, 0, 0);
        assert_eq!(state.pongs_needed(1), MAX_PONGS - 1);

        assert!(!state.on_pong_sent(3));
        assert_eq!(state.pongs_missing(), MAX_PONGS);
        assert!(state.on_pong_sent(0));
        // Floors at zero.
        assert!(!state.on_pong_sent(0));
        for _ in 1..MAX_PONGS {
            assert!(state.on_pong_sent(1));
        }
        assert!(!state.on_pong_sent(1));
        assert_eq!(state.pongs_missing(), 0);
        assert_eq!(state.next_cached_hops(), None);
    }

    #[test]
    fn test_high_ttl_is_clamped() {
        let mut state = PingPongState::new(PeerRole::Normal);
        state.on_ping(Muid::random(), 200, 0, 0);
        assert!(state.pongs_needed(MAX_CACHE_HOPS) > 0);
        assert_eq!(state.pongs_missing(), MAX_PONGS);
        assert!(state.on_pong_sent(50));
        assert_eq!(state.pongs_missing(), MAX_PONGS - 1);
    }

    #[test]
    fn test_repeated_pings_do_not_accumulate_demand() {
        let mut state = PingPongState::new(PeerRole::Normal);
        state.on_ping(Muid::random(), 7, 0, 0);
        assert!(state.on_pong_sent(0));
        // Next window opens before the remaining demand is settled.
        assert_eq!(state.on_ping(Muid::random(), 7, 0, 3), PingVerdict::Accepted);
        assert_eq!(state.pongs_missing(), MAX_PONGS);
        assert_eq!(state.on_ping(Muid::random(), 3, 0, 6), PingVerdict::Accepted);
        assert_eq!(state.pongs_missing(), MAX_PONGS);
        assert_eq!(state.pongs_needed(5), 0);
    }

    #[test]
    fn test_missing_matches_sum_after_mixed_sequence() {
        let mut state = PingPongState::new(PeerRole::Normal);
        let mut now = 0;
        for round in 0..20u8 {
            state.on_ping(Muid::random(), round % 9, round % 2, now);
            for h in 0..(round % 4) {
                state.on_pong_sent(h + round % 3);
            }
            assert_eq!(state.pongs_missing(), sum(&state));
            assert!(state.pongs_missing() <= MAX_PONGS);
            now += 2;
            if round % 5 == 0 {
                state.expire(now);
                assert_eq!(state.pongs_missing(), sum(&state));
            }
        }
    }

    #[test]
    fn test_expire_clears_stale_demand() {
        let mut state = PingPongState::new(PeerRole::Normal);
        state.on_ping(Muid::random(), 5, 0, 10);
        state.expire(12);
        assert_eq!(state.pongs_missing(), MAX_PONGS);
        state.expire(13);
        assert_eq!(state.pongs_missing(), 0);
        assert!(state.last_ping().is_none());
    }
}
