//! Capped, time-ordered rolling buffer of readings backing the history chart.

use std::collections::VecDeque;
use std::time::Duration;

use crate::reading::Reading;

/// Default buffer capacity when the config does not say otherwise.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Result of a single `TimeSeries::insert`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored at its sorted position.
    Inserted,
    /// An identical reading was already held (broker redelivery); nothing changed.
    Duplicate,
    /// Older than everything in a full buffer, so evicted on arrival.
    Evicted,
}

impl InsertOutcome {
    /// Whether the insert counts as fresh data from the device.
    pub fn is_success(self) -> bool {
        !matches!(self, Self::Evicted)
    }
}

/// Readings ordered by non-decreasing timestamp, never more than `capacity`.
#[derive(Debug, Clone)]
pub struct TimeSeries {
    buf: VecDeque<Reading>,
    capacity: usize,
}

impl TimeSeries {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Insert at the sorted position (after any equal timestamps), then evict
    /// oldest-by-timestamp until back at capacity.
    pub fn insert(&mut self, reading: Reading) -> InsertOutcome {
        let lo = self.buf.partition_point(|r| r.timestamp < reading.timestamp);
        let hi = self.buf.partition_point(|r| r.timestamp <= reading.timestamp);
        if self.buf.range(lo..hi).any(|r| *r == reading) {
            return InsertOutcome::Duplicate;
        }

        if self.buf.len() >= self.capacity && hi == 0 {
            return InsertOutcome::Evicted;
        }

        self.buf.insert(hi, reading);
        while self.buf.len() > self.capacity {
            self.buf.pop_front();
        }
        InsertOutcome::Inserted
    }

    /// Owned copy of the ordered sequence.
    pub fn snapshot(&self) -> Vec<Reading> {
        self.buf.iter().cloned().collect()
    }

    /// Reading with the greatest timestamp.
    pub fn latest(&self) -> Option<&Reading> {
        self.buf.back()
    }

    /// Readings with `timestamp > now_ms - window`, oldest first.
    pub fn query_range(&self, window: Duration, now_ms: i64) -> Vec<Reading> {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_ms.saturating_sub(window_ms);
        let start = self.buf.partition_point(|r| r.timestamp <= cutoff);
        self.buf.range(start..).cloned().collect()
    }
}

impl Default for TimeSeries {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Chart windows
// ---------------------------------------------------------------------------

/// Parse a chart window label such as `"5m"`, `"6h"`, `"7d"` or `"30s"`.
pub fn parse_window(label: &str) -> Option<Duration> {
    let label = label.trim();
    let split = label.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = label.split_at(split);
    let n: u64 = digits.parse().ok()?;
    if n == 0 {
        return None;
    }
    let secs = match unit {
        "s" => n,
        "m" => n.checked_mul(60)?,
        "h" => n.checked_mul(3600)?,
        "d" => n.checked_mul(86_400)?,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

// ===========================================================================
// Tests
// ===========================================================================
