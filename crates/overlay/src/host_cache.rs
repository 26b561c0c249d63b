//! Bootstrap cache of peer addresses.
//!
//! Addresses are segmented into [`HostCategory`] buckets, each with its own
//! fixed capacity. A given `(ip, port)` lives in at most one bucket:
//!
//! - "caught" hosts (heard about through pongs or handshake headers) go to a
//!   fresh bucket
//! - hosts we completed a handshake with go to a valid bucket and are never
//!   demoted back to fresh
//! - hosts that misbehaved go to a bad bucket (timeout, busy, unstable,
//!   alien) and cannot re-enter a good bucket until they age out
//!
//! When a bucket is full the least-fresh entry is evicted before admitting the
//! new one. Entries with the same timestamp are evicted in insertion order.
//!
//! The cache is optionally backed by SQLite: [`HostCache::new_with_db`] loads
//! the good buckets and [`HostCache::shutdown`] writes them back.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::path::Path;

use rand::seq::IteratorRandom;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::{HostAddr, OverlayError, Result};

/// Host cache bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HostCategory {
    FreshAny,
    ValidAny,
    FreshUltra,
    ValidUltra,
    Timeout,
    Busy,
    Unstable,
    Alien,
}

impl HostCategory {
    /// All categories, in storage order.
    pub const ALL: [HostCategory; 8] = [
        HostCategory::FreshAny,
        HostCategory::ValidAny,
        HostCategory::FreshUltra,
        HostCategory::ValidUltra,
        HostCategory::Timeout,
        HostCategory::Busy,
        HostCategory::Unstable,
        HostCategory::Alien,
    ];

    /// Number of categories.
    pub const COUNT: usize = 8;

    fn index(self) -> usize {
        self as usize
    }

    fn from_index(index: i64) -> Option<Self> {
        usize::try_from(index)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
    }

    /// Returns true for buckets holding hosts we should not contact.
    pub fn is_bad(self) -> bool {
        matches!(
            self,
            HostCategory::Timeout | HostCategory::Busy | HostCategory::Unstable | HostCategory::Alien
        )
    }

    fn is_valid(self) -> bool {
        matches!(self, HostCategory::ValidAny | HostCategory::ValidUltra)
    }

    /// Human readable name, used in logs and the `hosts` listing.
    pub fn name(self) -> &'static str {
        match self {
            HostCategory::FreshAny => "fresh regular",
            HostCategory::ValidAny => "valid regular",
            HostCategory::FreshUltra => "fresh ultra",
            HostCategory::ValidUltra => "valid ultra",
            HostCategory::Timeout => "timeout",
            HostCategory::Busy => "busy",
            HostCategory::Unstable => "unstable",
            HostCategory::Alien => "alien",
        }
    }
}

impl fmt::Display for HostCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of host being added or looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostType {
    /// Any servent.
    Any,
    /// A host known to run as an ultrapeer.
    Ultra,
}

impl HostType {
    /// Bucket for hosts heard about but not yet contacted.
    pub fn fresh(self) -> HostCategory {
        match self {
            HostType::Any => HostCategory::FreshAny,
            HostType::Ultra => HostCategory::FreshUltra,
        }
    }

    /// Bucket for hosts we completed a handshake with.
    pub fn valid(self) -> HostCategory {
        match self {
            HostType::Any => HostCategory::ValidAny,
            HostType::Ultra => HostCategory::ValidUltra,
        }
    }
}

/// Host cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostCacheConfig {
    /// Capacity of each fresh bucket.
    pub fresh_capacity: usize,
    /// Capacity of each valid bucket.
    pub valid_capacity: usize,
    /// Capacity of each bad bucket.
    pub bad_capacity: usize,
    /// A bucket is low when its occupancy is under this fraction of capacity.
    pub low_ratio: f64,
    /// Seconds a host stays in a bad bucket.
    pub bad_max_age_secs: u64,
    /// Seconds a host stays in a good bucket (0 keeps it until evicted).
    pub good_max_age_secs: u64,
    /// Accept private-range addresses.
    pub allow_private: bool,
}

impl Default for HostCacheConfig {
    fn default() -> Self {
        Self {
            fresh_capacity: 1000,
            valid_capacity: 1000,
            bad_capacity: 500,
            low_ratio: 0.25,
            bad_max_age_secs: 1800,
            good_max_age_secs: 0,
            allow_private: false,
        }
    }
}

impl HostCacheConfig {
    /// Capacity of a bucket.
    pub fn capacity(&self, category: HostCategory) -> usize {
        match category {
            HostCategory::FreshAny | HostCategory::FreshUltra => self.fresh_capacity,
            HostCategory::ValidAny | HostCategory::ValidUltra => self.valid_capacity,
            _ => self.bad_capacity,
        }
    }

    fn max_age(&self, category: HostCategory) -> Option<u64> {
        let age = if category.is_bad() {
            self.bad_max_age_secs
        } else {
            self.good_max_age_secs
        };
        (age > 0).then_some(age)
    }
}

/// A cached host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCacheEntry {
    pub addr: HostAddr,
    /// Bucket the host currently lives in.
    pub category: HostCategory,
    /// Last time the host was seen, in seconds since the epoch.
    pub last_seen: u64,
}

/// Counters kept by the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostCacheStats {
    /// Hosts inserted or moved between categories.
    pub added: u64,
    /// Additions ignored because the host was already known there.
    pub duplicates: u64,
    /// Unroutable, bad or zero-capacity additions.
    pub rejected: u64,
    /// Oldest hosts pushed out of a full category.
    pub evicted: u64,
    /// Hosts dropped for age.
    pub pruned: u64,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    category: HostCategory,
    last_seen: u64,
    seq: u64,
}

/// Bounded, category-segmented address store.
pub struct HostCache {
    config: HostCacheConfig,
    hosts: HashMap<HostAddr, Slot>,
    /// Per-category eviction order, oldest first.
    order: [BTreeMap<(u64, u64), HostAddr>; HostCategory::COUNT],
    next_seq: u64,
    stats: HostCacheStats,
    db: Option<Connection>,
}

impl HostCache {
    /// Creates a cache with no persistence.
    pub fn new_in_memory(config: HostCacheConfig) -> Self {
        Self {
            config,
            hosts: HashMap::new(),
            order: std::array::from_fn(|_| BTreeMap::new()),
            next_seq: 0,
            stats: HostCacheStats::default(),
            db: None,
        }
    }

    /// Creates a cache backed by the SQLite file at `db_path`.
    pub fn new_with_db(config: HostCacheConfig, db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(|e| {
            OverlayError::DatabaseError(format!("Failed to open host database: {}", e))
        })?;
        Self::from_connection(config, conn)
    }

    /// Creates a cache using an existing database connection.
    pub fn from_connection(config: HostCacheConfig, conn: Connection) -> Result<Self> {
        Self::init_db(&conn)?;
        let mut cache = Self::new_in_memory(config);
        let loaded = cache.load_from_db(&conn)?;
        if loaded > 0 {
            info!("Loaded {} hosts from database", loaded);
        }
        cache.db = Some(conn);
        Ok(cache)
    }

    /// Creates a cache, persistent when `db_path` is given.
    pub fn init(config: HostCacheConfig, db_path: Option<&Path>) -> Result<Self> {
        match db_path {
            Some(path) => Self::new_with_db(config, path),
            None => Ok(Self::new_in_memory(config)),
        }
    }

    fn init_db(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS hosts (
                ip TEXT NOT NULL,
                port INT NOT NULL CHECK (port > 0 AND port <= 65535),
                category INT NOT NULL,
                last_seen INTEGER NOT NULL,
                PRIMARY KEY (ip, port)
            )",
            [],
        )
        .map_err(|e| OverlayError::DatabaseError(format!("Failed to create hosts table: {}", e)))?;
        Ok(())
    }

    fn load_from_db(&mut self, conn: &Connection) -> Result<usize> {
        let mut stmt = conn
            .prepare("SELECT ip, port, category, last_seen FROM hosts ORDER BY last_seen")
            .map_err(|e| OverlayError::DatabaseError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .map_err(|e| OverlayError::DatabaseError(format!("Failed to query hosts: {}", e)))?;

        let mut loaded = 0;
        for (ip, port, category, last_seen) in rows.flatten() {
            let (Ok(ip), Ok(port), Some(category)) = (
                ip.parse::<IpAddr>(),
                u16::try_from(port),
                HostCategory::from_index(category),
            ) else {
                debug!("Skipping unparsable host row {}:{}", ip, port);
                continue;
            };
            let last_seen = u64::try_from(last_seen).unwrap_or(0);
            if self.add(category, HostAddr::new(ip, port), last_seen, "database") {
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Writes the good buckets to the database, replacing its contents.
    pub fn persist(&mut self) -> Result<usize> {
        let Some(conn) = self.db.as_mut() else {
            return Ok(0);
        };
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM hosts", [])?;
        let mut written = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO hosts (ip, port, category, last_seen) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (addr, slot) in &self.hosts {
                if slot.category.is_bad() {
                    continue;
                }
                stmt.execute(params![
                    addr.ip.to_string(),
                    addr.port as i64,
                    slot.category.index() as i64,
                    slot.last_seen as i64
                ])?;
                written += 1;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    /// Persists the cache and empties every bucket.
    pub fn shutdown(&mut self) -> Result<()> {
        let written = self.persist()?;
        if self.db.is_some() {
            info!("Saved {} hosts to database", written);
        }
        for category in HostCategory::ALL {
            self.clear(category);
        }
        Ok(())
    }

    /// Capacities and ageing limits in force.
    pub fn config(&self) -> &HostCacheConfig {
        &self.config
    }

    /// Counters since creation.
    pub fn stats(&self) -> HostCacheStats {
        self.stats
    }

    /// Returns true if `addr` is usable as a peer address.
    pub fn is_routable(&self, addr: &HostAddr) -> bool {
        addr.is_routable(self.config.allow_private)
    }

    /// Adds `addr` to `category` with the sighting time `seen_at`.
    ///
    /// Returns false when the host is rejected: unroutable, already in this
    /// category, held in a bad category, or already valid when adding as
    /// fresh. A host in another category is moved.
    pub fn add(&mut self, category: HostCategory, addr: HostAddr, seen_at: u64, reason: &str) -> bool {
        if !self.is_routable(&addr) {
            self.stats.rejected += 1;
            trace!("Rejecting unroutable host {} ({})", addr, reason);
            return false;
        }

        if let Some(slot) = self.hosts.get(&addr).copied() {
            if slot.category == category {
                self.stats.duplicates += 1;
                return false;
            }
            if slot.category.is_bad() && !category.is_bad() {
                self.stats.rejected += 1;
                trace!("Host {} is {}, not adding as {} ({})", addr, slot.category, category, reason);
                return false;
            }
            if slot.category.is_valid() && !category.is_valid() && !category.is_bad() {
                self.stats.duplicates += 1;
                return false;
            }
            self.unlink(&addr);
        }

        let capacity = self.config.capacity(category);
        if capacity == 0 {
            self.stats.rejected += 1;
            return false;
        }
        while self.order[category.index()].len() >= capacity {
            self.evict_oldest(category);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.hosts.insert(
            addr,
            Slot {
                category,
                last_seen: seen_at,
                seq,
            },
        );
        self.order[category.index()].insert((seen_at, seq), addr);
        self.stats.added += 1;
        trace!("Added {} host {} ({})", category, addr, reason);
        true
    }

    /// Adds a host heard about through the network.
    pub fn add_caught(&mut self, host_type: HostType, addr: HostAddr, seen_at: u64, reason: &str) -> bool {
        self.add(host_type.fresh(), addr, seen_at, reason)
    }

    /// Adds a host we completed a handshake with.
    pub fn add_valid(&mut self, host_type: HostType, addr: HostAddr, seen_at: u64, reason: &str) -> bool {
        self.add(host_type.valid(), addr, seen_at, reason)
    }

    fn unlink(&mut self, addr: &HostAddr) -> Option<Slot> {
        let slot = self.hosts.remove(addr)?;
        self.order[slot.category.index()].remove(&(slot.last_seen, slot.seq));
        Some(slot)
    }

    fn evict_oldest(&mut self, category: HostCategory) {
        if let Some((_, addr)) = self.order[category.index()].pop_first() {
            self.hosts.remove(&addr);
            self.stats.evicted += 1;
            trace!("Evicted {} host {}", category, addr);
        }
    }

    /// Returns true if `addr` is cached in any category.
    pub fn lookup(&self, addr: &HostAddr) -> bool {
        self.hosts.contains_key(addr)
    }

    /// Category holding `addr`.
    pub fn category_of(&self, addr: &HostAddr) -> Option<HostCategory> {
        self.hosts.get(addr).map(|slot| slot.category)
    }

    /// Last sighting time of `addr`.
    pub fn timestamp(&self, addr: &HostAddr) -> Option<u64> {
        self.hosts.get(addr).map(|slot| slot.last_seen)
    }

    /// Returns true if any port of `ip` sits in a bad category.
    pub fn is_bad(&self, ip: IpAddr) -> bool {
        HostCategory::ALL
            .iter()
            .filter(|c| c.is_bad())
            .any(|c| self.order[c.index()].values().any(|addr| addr.ip == ip))
    }

    /// Number of hosts in `category`.
    pub fn size(&self, category: HostCategory) -> usize {
        self.order[category.index()].len()
    }

    /// Number of hosts across all categories.
    pub fn total_size(&self) -> usize {
        self.hosts.len()
    }

    /// Returns true when `category` is under its low-water fraction.
    pub fn is_low(&self, category: HostCategory) -> bool {
        let capacity = self.config.capacity(category);
        (self.size(category) as f64) < capacity as f64 * self.config.low_ratio
    }

    /// Samples up to `n` hosts from `category` without removing them.
    pub fn fill(&self, category: HostCategory, n: usize) -> Vec<HostCacheEntry> {
        self.order[category.index()]
            .iter()
            .choose_multiple(&mut rand::thread_rng(), n)
            .into_iter()
            .map(|(&(last_seen, _), &addr)| HostCacheEntry {
                addr,
                category,
                last_seen,
            })
            .collect()
    }

    /// Entries of `category`, least fresh first.
    pub fn entries(&self, category: HostCategory) -> Vec<HostCacheEntry> {
        self.order[category.index()]
            .iter()
            .map(|(&(last_seen, _), &addr)| HostCacheEntry {
                addr,
                category,
                last_seen,
            })
            .collect()
    }

    /// Removes and returns the freshest caught host of `host_type`, falling
    /// back to the freshest valid one.
    pub fn get_caught(&mut self, host_type: HostType) -> Option<HostAddr> {
        for category in [host_type.fresh(), host_type.valid()] {
            if let Some((_, addr)) = self.order[category.index()].pop_last() {
                self.hosts.remove(&addr);
                return Some(addr);
            }
        }
        None
    }

    /// Removes and returns a host sharing the network prefix of `local`.
    pub fn find_nearby(&mut self, host_type: HostType, local: IpAddr) -> Option<HostAddr> {
        for category in [host_type.fresh(), host_type.valid()] {
            let found = self.order[category.index()]
                .values()
                .rev()
                .find(|addr| same_prefix(addr.ip, local))
                .copied();
            if let Some(addr) = found {
                self.unlink(&addr);
                return Some(addr);
            }
        }
        None
    }

    /// Drops expired entries and trims `category` to its capacity.
    pub fn prune(&mut self, category: HostCategory, now: u64) -> usize {
        let mut removed = 0;
        if let Some(max_age) = self.config.max_age(category) {
            let cutoff = now.saturating_sub(max_age);
            while let Some((&(last_seen, _), _)) = self.order[category.index()].first_key_value() {
                if last_seen >= cutoff {
                    break;
                }
                if let Some((_, addr)) = self.order[category.index()].pop_first() {
                    self.hosts.remove(&addr);
                    removed += 1;
                }
            }
        }
        let capacity = self.config.capacity(category);
        while self.order[category.index()].len() > capacity {
            self.evict_oldest(category);
            removed += 1;
        }
        if removed > 0 {
            self.stats.pruned += removed as u64;
            debug!("Pruned {} {} hosts", removed, category);
        }
        removed
    }

    /// Empties `category`.
    pub fn clear(&mut self, category: HostCategory) {
        let bucket = std::mem::take(&mut self.order[category.index()]);
        for addr in bucket.values() {
            self.hosts.remove(addr);
        }
    }

    /// Periodic aging of every category.
    pub fn tick(&mut self, now: u64) {
        for category in HostCategory::ALL {
            self.prune(category, now);
        }
    }
}

/// Same /16 for IPv4, same /48 for IPv6.
fn same_prefix(a: IpAddr, b: IpAddr) -> bool {
    match (a, b) {
        (IpAddr::V4(a), IpAddr::V4(b)) => a.octets()[..2] == b.octets()[..2],
        (IpAddr::V6(a), IpAddr::V6(b)) => a.segments()[..3] == b.segments()[..3],
        _ => false,
    }
}
