//! Byte accounting and the outbound upload target.

use crate::unix_time;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const ONE_MEGABYTE: u64 = 1024 * 1024;

#[derive(Debug)]
struct SentState {
    total: u64,
    /// Bytes limit per cycle, 0 = unlimited.
    limit: u64,
    /// Cycle length, seconds.
    timeframe: u64,
    /// Unix seconds, 0 before the first send.
    cycle_start: u64,
    sent_in_cycle: u64,
}

/// Lifetime byte totals and the rolling outbound target.
#[derive(Debug)]
pub struct Bandwidth {
    recv: AtomicU64,
    sent: Mutex<SentState>,
}

/// Point-in-time view for the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BandwidthStats {
    pub total_bytes_recv: u64,
    pub total_bytes_sent: u64,
    pub target: u64,
    pub timeframe_secs: u64,
    pub target_reached: bool,
    pub serve_historical_blocks: bool,
    pub bytes_left_in_cycle: u64,
    pub time_left_in_cycle: u64,
}

impl Bandwidth {
    pub fn new(limit: u64, timeframe: Duration) -> Self {
        Self {
            recv: AtomicU64::new(0),
            sent: Mutex::new(SentState {
                total: 0,
                limit,
                timeframe: timeframe.as_secs(),
                cycle_start: 0,
                sent_in_cycle: 0,
            }),
        }
    }

    pub fn record_recv(&self, bytes: u64) {
        self.recv.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: u64) {
        self.record_sent_at(bytes, unix_time() as u64);
    }

    fn record_sent_at(&self, bytes: u64, now: u64) {
        let mut sent = self.sent.lock();
        sent.total += bytes;
        if sent.cycle_start + sent.timeframe < now {
            sent.cycle_start = now;
            sent.sent_in_cycle = 0;
        }
        sent.sent_in_cycle += bytes;
    }

    pub fn total_recv(&self) -> u64 {
        self.recv.load(Ordering::Relaxed)
    }

    pub fn total_sent(&self) -> u64 {
        self.sent.lock().total
    }

    pub fn set_target(&self, limit: u64) {
        self.sent.lock().limit = limit;
    }

    pub fn target(&self) -> u64 {
        self.sent.lock().limit
    }

    /// Change the cycle length. A different length restarts the cycle.
    pub fn set_timeframe(&self, timeframe: Duration) {
        self.set_timeframe_at(timeframe, unix_time() as u64);
    }

    fn set_timeframe_at(&self, timeframe: Duration, now: u64) {
        let mut sent = self.sent.lock();
        if sent.timeframe != timeframe.as_secs() {
            sent.cycle_start = now;
        }
        sent.timeframe = timeframe.as_secs();
    }

    pub fn timeframe(&self) -> Duration {
        Duration::from_secs(self.sent.lock().timeframe)
    }

    /// Seconds until the current cycle ends; 0 without a target.
    pub fn time_left_in_cycle(&self) -> u64 {
        Self::time_left(&self.sent.lock(), unix_time() as u64)
    }

    fn time_left(sent: &SentState, now: u64) -> u64 {
        if sent.limit == 0 {
            return 0;
        }
        if sent.cycle_start == 0 {
            return sent.timeframe;
        }
        (sent.cycle_start + sent.timeframe).saturating_sub(now)
    }

    /// Whether the upload target for this cycle is used up.
    ///
    /// With `historical_block_serving`, keeps one megabyte per ten minutes
    /// left in the cycle in reserve so new blocks can still be relayed.
    pub fn outbound_target_reached(&self, historical_block_serving: bool) -> bool {
        self.target_reached_at(historical_block_serving, unix_time() as u64)
    }

    fn target_reached_at(&self, historical_block_serving: bool, now: u64) -> bool {
        let sent = self.sent.lock();
        if sent.limit == 0 {
            return false;
        }
        if historical_block_serving {
            let buffer = Self::time_left(&sent, now) / 600 * ONE_MEGABYTE;
            buffer >= sent.limit || sent.sent_in_cycle >= sent.limit - buffer
        } else {
            sent.sent_in_cycle >= sent.limit
        }
    }

    /// Bytes left in this cycle; 0 without a target.
    pub fn bytes_left_in_cycle(&self) -> u64 {
        let sent = self.sent.lock();
        if sent.limit == 0 {
            return 0;
        }
        sent.limit.saturating_sub(sent.sent_in_cycle)
    }

    pub fn stats(&self) -> BandwidthStats {
        let reached = self.outbound_target_reached(false);
        let historical = self.outbound_target_reached(true);
        let sent = self.sent.lock();
        BandwidthStats {
            total_bytes_recv: self.total_recv(),
            total_bytes_sent: sent.total,
            target: sent.limit,
            timeframe_secs: sent.timeframe,
            target_reached: reached,
            serve_historical_blocks: !historical,
            bytes_left_in_cycle: if sent.limit == 0 { 0 } else { sent.limit.saturating_sub(sent.sent_in_cycle) },
            time_left_in_cycle: Self::time_left(&sent, unix_time() as u64),
        }
    }
}
