//! Minute Aligner
//!
//! Resamples one canonical stream onto a minute grid.
//!
//! # Rules
//!
//! 1. A bar's value is the last event in `[minute_ts, minute_ts + 1min)`,
//!    "last" meaning the maximum of (event time, native ordering key, source id).
//!    The result does not depend on arrival order.
//! 2. Minutes with no event get `close = None` and `is_stale = true`.
//!    There is no forward-fill here.
//! 3. Out-of-order events are accepted unless their minute is frozen; those are
//!    rejected, logged and counted.
//! 4. Exactly one bar per grid minute per requested venue.

use crate::pipeline::clock::{minute_floor, MinuteGrid, Nanos, TimeRange};
use crate::pipeline::events::{CanonicalPayload, CanonicalRecord, SourceDomain};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// One row per (minute_ts, venue_key, domain).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinuteBar {
    pub minute_ts: Nanos,
    pub venue_key: String,
    pub domain: SourceDomain,
    /// Payload of the minute's last event.
    pub close: Option<CanonicalPayload>,
    pub is_stale: bool,
    pub event_count: u32,
    /// Sum of |amount_usd| over swaps in the minute. Zero for other domains.
    pub turnover_usd: f64,
    pub last_event_ts: Option<Nanos>,
}

impl MinuteBar {
    fn stale(minute_ts: Nanos, venue_key: &str, domain: SourceDomain) -> Self {
        Self {
            minute_ts,
            venue_key: venue_key.to_string(),
            domain,
            close: None,
            is_stale: true,
            event_count: 0,
            turnover_usd: 0.0,
            last_event_ts: None,
        }
    }
}

/// Frozen time ranges. Events landing inside are rejected.
#[derive(Debug, Clone, Default)]
pub struct FrozenRanges {
    ranges: Vec<TimeRange>,
}

impl FrozenRanges {
    pub fn new(ranges: Vec<TimeRange>) -> Self {
        Self { ranges }
    }

    pub fn push(&mut self, range: TimeRange) {
        self.ranges.push(range);
    }

    pub fn contains(&self, t: Nanos) -> bool {
        self.ranges.iter().any(|r| r.contains(t))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignStats {
    pub accepted: u64,
    /// Accepted, but earlier than an already-seen event of the same venue.
    pub out_of_order: u64,
    pub rejected_frozen: u64,
    pub outside_grid: u64,
}

#[derive(Debug, Default)]
struct Slot {
    last: Option<CanonicalRecord>,
    count: u32,
    turnover_usd: f64,
}

/// Incremental aligner for one source domain.
pub struct MinuteAligner {
    domain: SourceDomain,
    grid: MinuteGrid,
    frozen: FrozenRanges,
    slots: HashMap<(String, Nanos), Slot>,
    max_seen: HashMap<String, Nanos>,
    stats: AlignStats,
}

impl MinuteAligner {
    pub fn new(domain: SourceDomain, grid: MinuteGrid, frozen: FrozenRanges) -> Self {
        Self {
            domain,
            grid,
            frozen,
            slots: HashMap::new(),
            max_seen: HashMap::new(),
            stats: AlignStats::default(),
        }
    }

    pub fn stats(&self) -> AlignStats {
        self.stats
    }

    /// Feed one record. Returns false if it was rejected or fell outside the grid.
    pub fn push(&mut self, rec: CanonicalRecord) -> bool {
        if rec.domain != self.domain {
            return false;
        }
        let minute = minute_floor(rec.event_ts);
        if self.frozen.contains(minute) {
            self.stats.rejected_frozen += 1;
            warn!(
                domain = %self.domain,
                venue = %rec.venue_key,
                minute_ts = minute,
                "late event for frozen minute rejected"
            );
            return false;
        }
        if !self.grid.contains(minute) {
            self.stats.outside_grid += 1;
            return false;
        }

        let seen = self.max_seen.entry(rec.venue_key.clone()).or_insert(rec.event_ts);
        if rec.event_ts < *seen {
            self.stats.out_of_order += 1;
        } else {
            *seen = rec.event_ts;
        }

        let slot = self.slots.entry((rec.venue_key.clone(), minute)).or_default();
        slot.count += 1;
        if let CanonicalPayload::Swap { amount_usd, .. } = rec.payload {
            slot.turnover_usd += amount_usd.abs();
        }
        let replace = match &slot.last {
            Some(cur) => rec.sequence_cmp(cur).is_gt(),
            None => true,
        };
        if replace {
            slot.last = Some(rec);
        }
        self.stats.accepted += 1;
        true
    }

    pub fn extend(&mut self, recs: impl IntoIterator<Item = CanonicalRecord>) {
        for r in recs {
            self.push(r);
        }
    }

    /// Emit exactly one bar per grid minute for each venue in `venues`.
    pub fn finish(mut self, venues: &[String]) -> BTreeMap<String, Vec<MinuteBar>> {
        let mut out = BTreeMap::new();
        for venue in venues {
            let bars: Vec<MinuteBar> = self
                .grid
                .minutes()
                .map(|m| match self.slots.remove(&(venue.clone(), m)) {
                    Some(slot) => {
                        let last_event_ts = slot.last.as_ref().map(|r| r.event_ts);
                        MinuteBar {
                            minute_ts: m,
                            venue_key: venue.clone(),
                            domain: self.domain,
                            close: slot.last.map(|r| r.payload),
                            is_stale: false,
                            event_count: slot.count,
                            turnover_usd: slot.turnover_usd,
                            last_event_ts,
                        }
                    }
                    None => MinuteBar::stale(m, venue, self.domain),
                })
                .collect();
            out.insert(venue.clone(), bars);
        }
        out
    }
}

/// Share of non-stale bars.
pub fn coverage(bars: &[MinuteBar]) -> f64 {
    if bars.is_empty() {
        return 0.0;
    }
    bars.iter().filter(|b| !b.is_stale).count() as f64 / bars.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::clock::{NANOS_PER_MIN, NANOS_PER_SEC};
    use crate::pipeline::events::OrderingKey;

    fn quote(ts: Nanos, seq: u64, mid: f64) -> CanonicalRecord {
        CanonicalRecord {
            domain: SourceDomain::CexQuote,
            venue_key: "ETHUSDT".into(),
            event_ts: ts,
            ordering: OrderingKey::sequence(seq),
            source_id: "cex".into(),
            payload: CanonicalPayload::CexQuote {
                bid: mid,
                ask: mid,
                mid,
                spread_bps: 0.0,
                taker_fee_bps: None,
            },
        }
    }

    fn mid(bar: &MinuteBar) -> Option<f64> {
        match bar.close {
            Some(CanonicalPayload::CexQuote { mid, .. }) => Some(mid),
            _ => None,
        }
    }

    fn venues() -> Vec<String> {
        vec!["ETHUSDT".to_string()]
    }

    #[test]
    fn test_one_bar_per_minute_with_stale_gaps() {
        let grid = MinuteGrid::new(0, 3 * NANOS_PER_MIN);
        let mut a = MinuteAligner::new(SourceDomain::CexQuote, grid, FrozenRanges::default());
        a.push(quote(10 * NANOS_PER_SEC, 1, 100.0));
        a.push(quote(2 * NANOS_PER_MIN + 5, 2, 102.0));
        let bars = a.finish(&venues()).remove("ETHUSDT").unwrap();

        assert_eq!(bars.len(), 3);
        assert_eq!(mid(&bars[0]), Some(100.0));
        assert!(bars[1].is_stale);
        assert!(bars[1].close.is_none());
        assert_eq!(bars[1].event_count, 0);
        assert_eq!(mid(&bars[2]), Some(102.0));
    }

    #[test]
    fn test_boundary_event_belongs_to_next_minute() {
        let grid = MinuteGrid::new(0, 2 * NANOS_PER_MIN);
        let mut a = MinuteAligner::new(SourceDomain::CexQuote, grid, FrozenRanges::default());
        a.push(quote(NANOS_PER_MIN, 1, 101.0));
        let bars = a.finish(&venues()).remove("ETHUSDT").unwrap();
        assert!(bars[0].is_stale);
        assert_eq!(mid(&bars[1]), Some(101.0));
    }

    #[test]
    fn test_last_event_independent_of_arrival_order() {
        let grid = MinuteGrid::new(0, NANOS_PER_MIN);
        let events = vec![
            quote(5 * NANOS_PER_SEC, 1, 100.0),
            quote(50 * NANOS_PER_SEC, 3, 105.0),
            quote(50 * NANOS_PER_SEC, 2, 104.0),
        ];

        let mut forward = MinuteAligner::new(SourceDomain::CexQuote, grid, FrozenRanges::default());
        forward.extend(events.clone());
        let mut reversed = MinuteAligner::new(SourceDomain::CexQuote, grid, FrozenRanges::default());
        reversed.extend(events.into_iter().rev());
        assert!(reversed.stats().out_of_order > 0);

        let f = forward.finish(&venues());
        let r = reversed.finish(&venues());
        assert_eq!(f, r);
        assert_eq!(mid(&f["ETHUSDT"][0]), Some(105.0));
        assert_eq!(f["ETHUSDT"][0].event_count, 3);
    }

    #[test]
    fn test_frozen_minute_rejects_late_event() {
        let grid = MinuteGrid::new(0, 2 * NANOS_PER_MIN);
        let frozen = FrozenRanges::new(vec![TimeRange::new(0, NANOS_PER_MIN)]);
        let mut a = MinuteAligner::new(SourceDomain::CexQuote, grid, frozen);
        assert!(!a.push(quote(30 * NANOS_PER_SEC, 1, 100.0)));
        assert!(a.push(quote(NANOS_PER_MIN + 1, 2, 101.0)));
        assert_eq!(a.stats().rejected_frozen, 1);
        let bars = a.finish(&venues()).remove("ETHUSDT").unwrap();
        assert!(bars[0].is_stale);
        assert!((coverage(&bars) - 0.5).abs() < 1e-12);
    }
}
