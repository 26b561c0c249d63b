//! Time spent under remote flow control.
//!
//! A peer flow-controls us by announcing a hops-flow of zero. The monitor is
//! created the first time that happens and accumulates the seconds spent in
//! that state over two consecutive half periods. Once both half periods saw
//! no flow control at all the monitor is of no further use and the owner
//! drops it.

use tracing::trace;

/// Length of one accounting half period, in seconds.
pub const FC_HALF_PERIOD: u64 = 300;

/// Result of a periodic check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorTick {
    /// Still inside the current half period.
    Running,
    /// A half period ended; `ratio` is the percentage of time spent in flow
    /// control over the last two half periods.
    Rolled { ratio: u32 },
    /// Both half periods were free of flow control; drop the monitor.
    Disposable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowControlMonitor {
    half_period_start: u64,
    fc_last_half: u64,
    fc_accumulator: u64,
    fc_start: Option<u64>,
}

impl FlowControlMonitor {
    pub fn new(now: u64) -> Self {
        Self {
            half_period_start: now,
            fc_last_half: 0,
            fc_accumulator: 0,
            fc_start: None,
        }
    }

    /// Enters flow control. Has no effect if already inside.
    pub fn enter(&mut self, now: u64) {
        if self.fc_start.is_none() {
            self.fc_start = Some(now);
        }
    }

    /// Leaves flow control.
    pub fn leave(&mut self, now: u64) {
        if let Some(start) = self.fc_start.take() {
            self.fc_accumulator += now.saturating_sub(start);
        }
    }

    pub fn in_flow_control(&self) -> bool {
        self.fc_start.is_some()
    }

    /// Seconds spent in flow control over the last and current half period.
    pub fn time_in_flow_control(&self, now: u64) -> u64 {
        let ongoing = self.fc_start.map_or(0, |start| now.saturating_sub(start));
        self.fc_last_half + self.fc_accumulator + ongoing
    }

    /// Periodic check, rolling the half period over when it has elapsed.
    pub fn tick(&mut self, now: u64) -> MonitorTick {
        if now.saturating_sub(self.half_period_start) < FC_HALF_PERIOD {
            return MonitorTick::Running;
        }

        // Time in an ongoing flow control episode belongs to the half period
        // that just ended.
        if let Some(start) = self.fc_start {
            self.fc_accumulator += now.saturating_sub(start);
            self.fc_start = Some(now);
        }

        let elapsed = FC_HALF_PERIOD + now - self.half_period_start;
        let total = self.fc_last_half + self.fc_accumulator;
        let ratio = (total * 100 / elapsed) as u32;

        let idle = self.fc_last_half == 0 && self.fc_accumulator == 0;
        self.fc_last_half = self.fc_accumulator;
        self.fc_accumulator = 0;
        self.half_period_start = now;
        trace!(
            "Flow control half period rolled: {}s last half, ratio {}%",
            self.fc_last_half,
            ratio
        );

        // An episode entered exactly at the boundary has no seconds yet.
        if idle && self.fc_start.is_none() {
            MonitorTick::Disposable
        } else {
            MonitorTick::Rolled { ratio }
        }
    }

    pub fn half_period_start(&self) -> u64 {
        self.half_period_start
    }

    pub fn fc_last_half(&self) -> u64 {
        self.fc_last_half
    }

    pub fn fc_accumulator(&self) -> u64 {
        self.fc_accumulator
    }
}
