//! Outbound message queue for one connection.
//!
//! Messages wait here until the socket accepts them. The queue tracks its
//! byte size against two watermarks:
//!
//! - above the high watermark the connection enters flow control
//! - it leaves flow control only once the size falls under the low watermark
//!
//! A connection that stays in flow control for longer than its grace period
//! without the queue shrinking at all switches to swift mode. In swift mode
//! the queue is re-evaluated every period and, when it did not shrink since
//! the previous check, low-priority messages are dropped down to the high
//! watermark.
//!
//! Messages can optionally pass through a deflate stage on their way out;
//! the queue then keeps bytes given, bytes compressed and bytes written.

use std::collections::VecDeque;
use std::io::{self, Write};

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::codec::{Message, MessageFunction};
use crate::compress::{compression_ratio, TxDeflater};

/// Message priority levels for outbound queuing.
/// Higher values are dropped last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(usize)]
pub enum MessagePriority {
    /// Relayed broadcast traffic.
    Low = 0,
    /// Replies and our own broadcasts.
    Normal = 1,
    /// Link control messages.
    High = 2,
}

impl MessagePriority {
    /// Number of priority levels.
    pub const COUNT: usize = 3;

    const ALL: [MessagePriority; Self::COUNT] =
        [MessagePriority::Low, MessagePriority::Normal, MessagePriority::High];

    /// Get the priority for a message.
    pub fn for_message(message: &Message) -> Self {
        match message.function() {
            MessageFunction::Bye
            | MessageFunction::QueryRoutingTable
            | MessageFunction::VendorMessage
            | MessageFunction::StandardVendorMessage
            | MessageFunction::Hsep => Self::High,
            MessageFunction::QueryHit | MessageFunction::Push => Self::Normal,
            MessageFunction::Ping | MessageFunction::Pong | MessageFunction::Query
                if message.header.hops == 0 =>
            {
                Self::Normal
            }
            _ => Self::Low,
        }
    }
}

/// Grace and re-evaluation period of swift mode, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwiftTiming {
    /// Time in flow control before swift mode kicks in.
    pub grace: u64,
    /// Interval between later swift checkpoints.
    pub period: u64,
}

impl SwiftTiming {
    /// Timing for peers and ultrapeers.
    pub const REGULAR: SwiftTiming = SwiftTiming {
        grace: 30,
        period: 20,
    };

    /// Timing for leaves, which are given more slack.
    pub const LEAF: SwiftTiming = SwiftTiming {
        grace: 210,
        period: 140,
    };
}

/// Configuration for the egress queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Hard limit on queued bytes.
    pub max_size: usize,
    /// Flow control starts above this size.
    pub high_watermark: usize,
    /// Flow control ends below this size.
    pub low_watermark: usize,
    /// Deflate level used on compressed links.
    pub compression_level: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 128 * 1024,
            high_watermark: 48 * 1024,
            low_watermark: 16 * 1024,
            compression_level: 6,
        }
    }
}

/// Outcome of [`EgressQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Queued, possibly after dropping `dropped` lower priority messages.
    Queued { dropped: usize },
    /// No room could be made; the message was dropped.
    QueueFull,
}

/// Queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages accepted into the queue.
    pub enqueued: u64,
    /// Messages discarded after being queued, or refused.
    pub dropped: u64,
    /// Enqueues that found no room even after dropping.
    pub overflows: u64,
    /// Times the queue crossed its high watermark.
    pub flow_control_entries: u64,
    /// Times swift mode was entered.
    pub swift_entries: u64,
    /// Bytes handed to the compression stage or the socket.
    pub tx_given: u64,
    /// Bytes produced by the compression stage.
    pub tx_deflated: u64,
    /// Bytes accepted by the socket.
    pub tx_written: u64,
}

#[derive(Debug)]
struct QueuedItem {
    wire: Bytes,
    priority: MessagePriority,
    function: MessageFunction,
}

#[derive(Debug, Clone, Copy)]
struct FlowState {
    since: u64,
    swift: bool,
    checkpoint: u64,
    size_at_checkpoint: usize,
    min_size: usize,
}

/// Per-connection send queue with flow control and optional compression.
pub struct EgressQueue {
    config: QueueConfig,
    timing: SwiftTiming,
    items: VecDeque<QueuedItem>,
    /// Unsent message bytes, excluding what the head already wrote.
    size: usize,
    head_offset: usize,
    deflater: Option<TxDeflater>,
    pending: BytesMut,
    flow: Option<FlowState>,
    stats: QueueStats,
}

impl EgressQueue {
    /// Creates an empty queue; `compress` deflates everything drained.
    pub fn new(config: QueueConfig, timing: SwiftTiming, compress: bool) -> Self {
        let deflater = compress.then(|| TxDeflater::new(config.compression_level));
        Self {
            config,
            timing,
            items: VecDeque::new(),
            size: 0,
            head_offset: 0,
            deflater,
            pending: BytesMut::new(),
            flow: None,
            stats: QueueStats::default(),
        }
    }

    /// Queues a message, making room by dropping strictly lower priority
    /// messages when the queue is full.
    pub fn enqueue(&mut self, message: &Message, now: u64) -> EnqueueResult {
        let priority = MessagePriority::for_message(message);
        let len = message.wire_len();

        let mut dropped = 0;
        if self.size + len > self.config.max_size {
            let target = self.config.max_size.saturating_sub(len);
            dropped = self.drop_below(priority, target);
            if self.size + len > self.config.max_size {
                self.stats.dropped += 1;
                self.stats.overflows += 1;
                trace!(
                    "Queue full, dropping {} ({} bytes queued)",
                    message.function().name(),
                    self.size
                );
                return EnqueueResult::QueueFull;
            }
        }

        self.items.push_back(QueuedItem {
            wire: message.to_bytes(),
            priority,
            function: message.function(),
        });
        self.size += len;
        self.stats.enqueued += 1;
        self.update_flow_control(now);
        EnqueueResult::Queued { dropped }
    }

    /// Drops messages with priority below `limit` until `size <= target`.
    /// A partially written head is never dropped.
    fn drop_below(&mut self, limit: MessagePriority, target: usize) -> usize {
        let mut dropped = 0;
        for level in MessagePriority::ALL {
            if level >= limit || self.size <= target {
                break;
            }
            let mut i = usize::from(self.head_offset > 0);
            while self.size > target && i < self.items.len() {
                if self.items[i].priority != level {
                    i += 1;
                    continue;
                }
                if let Some(item) = self.items.remove(i) {
                    self.size -= item.wire.len();
                    dropped += 1;
                    trace!("Dropped queued {}", item.function.name());
                }
            }
        }
        self.stats.dropped += dropped as u64;
        dropped
    }

    /// Writes up to `max_bytes` to `sink`, stopping early when the sink
    /// would block. Returns the number of bytes written.
    pub fn drain<W: Write>(&mut self, sink: &mut W, max_bytes: usize, now: u64) -> io::Result<usize> {
        let mut written = 0;
        while written < max_bytes {
            if !self.pending.is_empty() {
                let budget = (max_bytes - written).min(self.pending.len());
                match sink.write(&self.pending[..budget]) {
                    Ok(0) => break,
                    Ok(n) => {
                        self.pending.advance(n);
                        written += n;
                        self.stats.tx_written += n as u64;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
                continue;
            }

            let Some(head) = self.items.front() else {
                break;
            };
            let wire = head.wire.clone();

            if let Some(deflater) = self.deflater.as_mut() {
                let mut out = Vec::with_capacity(wire.len() / 2 + 16);
                let produced = deflater
                    .deflate(&wire, &mut out)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
                self.stats.tx_given += wire.len() as u64;
                self.stats.tx_deflated += produced as u64;
                self.size -= wire.len();
                self.items.pop_front();
                self.pending.extend_from_slice(&out);
                continue;
            }

            let remaining = &wire[self.head_offset..];
            let budget = (max_bytes - written).min(remaining.len());
            match sink.write(&remaining[..budget]) {
                Ok(0) => break,
                Ok(n) => {
                    written += n;
                    self.size -= n;
                    self.head_offset += n;
                    self.stats.tx_given += n as u64;
                    self.stats.tx_written += n as u64;
                    if self.head_offset == wire.len() {
                        self.items.pop_front();
                        self.head_offset = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.update_flow_control(now);
        Ok(written)
    }

    fn update_flow_control(&mut self, now: u64) {
        match self.flow.as_mut() {
            None if self.size > self.config.high_watermark => {
                self.flow = Some(FlowState {
                    since: now,
                    swift: false,
                    checkpoint: now,
                    size_at_checkpoint: self.size,
                    min_size: self.size,
                });
                self.stats.flow_control_entries += 1;
                debug!("Entering flow control with {} bytes queued", self.size);
            }
            Some(fc) if self.size < self.config.low_watermark => {
                debug!(
                    "Leaving flow control after {}s{}",
                    now.saturating_sub(fc.since),
                    if fc.swift { " (was swift)" } else { "" }
                );
                self.flow = None;
            }
            Some(fc) => fc.min_size = fc.min_size.min(self.size),
            None => {}
        }
    }

    /// Evaluates swift mode. Returns the number of messages dropped.
    pub fn check_swift(&mut self, now: u64) -> usize {
        let Some(fc) = self.flow.as_mut() else {
            return 0;
        };
        fc.min_size = fc.min_size.min(self.size);
        let elapsed = now.saturating_sub(fc.checkpoint);
        let due = if fc.swift {
            elapsed >= self.timing.period
        } else {
            elapsed > self.timing.grace
        };
        if !due {
            return 0;
        }

        let shrunk = fc.min_size < fc.size_at_checkpoint;
        let mut dropped = 0;
        // Swift mode needs a queue stuck above the high watermark.
        if !shrunk && self.size > self.config.high_watermark {
            if !fc.swift {
                fc.swift = true;
                self.stats.swift_entries += 1;
                debug!(
                    "Entering swift mode after {}s in flow control ({} bytes queued)",
                    now.saturating_sub(fc.since),
                    self.size
                );
            }
            dropped = self.drop_below(MessagePriority::High, self.config.high_watermark);
            if dropped > 0 {
                debug!("Swift mode dropped {} messages, {} bytes left", dropped, self.size);
            }
        }

        let size = self.size;
        if let Some(fc) = self.flow.as_mut() {
            fc.checkpoint = now;
            fc.size_at_checkpoint = size;
            fc.min_size = size;
        }
        self.update_flow_control(now);
        dropped
    }

    /// Drops everything still queued. Returns the number of messages lost.
    pub fn clear(&mut self) -> usize {
        let count = self.items.len();
        self.items.clear();
        self.pending.clear();
        self.size = 0;
        self.head_offset = 0;
        self.flow = None;
        self.stats.dropped += count as u64;
        count
    }

    /// Queued message bytes.
    pub fn size_bytes(&self) -> usize {
        self.size
    }

    /// Number of queued messages.
    pub fn count(&self) -> usize {
        self.items.len()
    }

    /// Compressed bytes waiting for the socket.
    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }

    /// Returns true when nothing is waiting to be written.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.pending.is_empty()
    }

    /// Fill level relative to the high watermark.
    pub fn percent_used(&self) -> usize {
        if self.config.high_watermark == 0 {
            return 0;
        }
        self.size * 100 / self.config.high_watermark
    }

    /// Queued bytes still above the low watermark.
    pub fn above_low_watermark(&self) -> bool {
        self.size > self.config.low_watermark
    }

    /// Size above which flow control starts.
    pub fn high_watermark(&self) -> usize {
        self.config.high_watermark
    }

    /// Size below which flow control ends.
    pub fn low_watermark(&self) -> usize {
        self.config.low_watermark
    }

    /// Hard limit on queued bytes.
    pub fn max_size(&self) -> usize {
        self.config.max_size
    }

    /// Swift mode timing this queue was built with.
    pub fn timing(&self) -> SwiftTiming {
        self.timing
    }

    /// Flow control is active.
    pub fn is_flow_controlled(&self) -> bool {
        self.flow.is_some()
    }

    /// Flow control escalated to swift mode.
    pub fn is_swift_controlled(&self) -> bool {
        self.flow.is_some_and(|fc| fc.swift)
    }

    /// Time flow control started, if active.
    pub fn flow_control_since(&self) -> Option<u64> {
        self.flow.map(|fc| fc.since)
    }

    /// Drained data goes through a deflate stage.
    pub fn is_compressing(&self) -> bool {
        self.deflater.is_some()
    }

    /// Share of bytes saved by the compression stage.
    pub fn compression_ratio(&self) -> f64 {
        self.deflater
            .as_ref()
            .map_or(0.0, |d| compression_ratio(d.given(), d.deflated()))
    }

    /// Counters since creation.
    pub fn stats(&self) -> QueueStats {
        self.stats
    }
}
