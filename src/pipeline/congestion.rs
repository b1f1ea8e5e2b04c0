//! Rolling congestion percentile.
//!
//! Per-pool order-statistic window over trailing `gas_usd` observations.
//! Values are kept twice: in arrival order (for eviction by age) and in a
//! sorted vector (for rank queries by binary search). Insert and evict are
//! explicit operations; there is no module-level state.
//!
//! Rank is `O(log n)`. Insert and evict shift the sorted vector, so they are
//! `O(n)` memmoves over at most one value per minute (43 200 at 30 days).
//! A count map would make updates logarithmic but rank linear, and rank runs
//! once per row.

use crate::pipeline::clock::{Nanos, NANOS_PER_DAY};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct CongestionWindow {
    window_ns: Nanos,
    arrivals: VecDeque<(Nanos, f64)>,
    sorted: Vec<f64>,
}

impl CongestionWindow {
    pub fn new(window_days: u32) -> Self {
        Self {
            window_ns: window_days as Nanos * NANOS_PER_DAY,
            arrivals: VecDeque::new(),
            sorted: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    /// Timestamp of the most recent insert.
    pub fn last_ts(&self) -> Option<Nanos> {
        self.arrivals.back().map(|(t, _)| *t)
    }

    /// Drop observations with `ts <= now - window`.
    pub fn evict(&mut self, now: Nanos) {
        let cutoff = now - self.window_ns;
        while let Some(&(ts, v)) = self.arrivals.front() {
            if ts > cutoff {
                break;
            }
            self.arrivals.pop_front();
            let idx = self.sorted.partition_point(|x| x.total_cmp(&v).is_lt());
            if idx < self.sorted.len() && self.sorted[idx].total_cmp(&v).is_eq() {
                self.sorted.remove(idx);
            }
        }
    }

    /// Insert an observation. Non-finite values are ignored.
    pub fn insert(&mut self, ts: Nanos, value: f64) {
        if !value.is_finite() {
            return;
        }
        let idx = self.sorted.partition_point(|x| x.total_cmp(&value).is_le());
        self.sorted.insert(idx, value);
        self.arrivals.push_back((ts, value));
    }

    /// Fraction of window values `<= value`, in `[0, 1]`. `None` if the window is empty.
    pub fn rank(&self, value: f64) -> Option<f64> {
        if self.sorted.is_empty() || !value.is_finite() {
            return None;
        }
        let le = self.sorted.partition_point(|x| x.total_cmp(&value).is_le());
        Some(le as f64 / self.sorted.len() as f64)
    }

    /// Slide to `ts`, insert `value` and return its percentile.
    ///
    /// A missing value yields `None` and is not inserted, but the window still
    /// slides.
    pub fn observe(&mut self, ts: Nanos, value: Option<f64>) -> Option<f64> {
        self.evict(ts);
        let v = value.filter(|v| v.is_finite())?;
        self.insert(ts, v);
        self.rank(v)
    }
}
