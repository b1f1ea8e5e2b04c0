//! Feature Constructor
//!
//! Joins the four per-source minute bars of a pool into one [`FeatureRow`] per
//! (minute_ts, pool_key) and derives prices, returns, the signed wedge, cost
//! band components, violation fields, congestion and realized volatility.
//!
//! # Design Principles
//!
//! 1. **Null, never fabricated**: a missing required input gives a null derived
//!    value plus a quality flag. Rows are always emitted.
//! 2. **O(1) per row**: everything is computed from the current minute and
//!    incrementally maintained per-pool state ([`PoolFeatureState`]).
//! 3. **Raw inputs exposed**: band components sit next to the raw values they
//!    are built from (depth, spread, taker fee, gas) so downstream analysis can
//!    choose its own cost model.
//!
//! Sign convention: `wedge_bps = 10000 * (ln dex - ln cex)`.

use crate::pipeline::aligner::MinuteBar;
use crate::pipeline::clock::{Nanos, MINUTES_PER_YEAR, NANOS_PER_MIN};
use crate::pipeline::config::{CostBandConfig, ImpactModel, MevProxy, PoolConfig};
use crate::pipeline::congestion::CongestionWindow;
use crate::pipeline::events::CanonicalPayload;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::collections::VecDeque;

// =============================================================================
// QUALITY FLAGS
// =============================================================================

/// Bitmask of row-level quality conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QualityFlags(pub u32);

impl QualityFlags {
    pub const MISSING_DEX: u32 = 1 << 0;
    pub const MISSING_CEX: u32 = 1 << 1;
    pub const MISSING_GAS: u32 = 1 << 2;
    pub const MISSING_DEPTH: u32 = 1 << 3;
    pub const ZERO_DEPTH: u32 = 1 << 4;
    /// At least one band component is null; violation fields are null.
    pub const INCOMPLETE_BAND: u32 = 1 << 5;
    pub const MISSING_RETURN: u32 = 1 << 6;
    pub const EMPTY_CONGESTION_WINDOW: u32 = 1 << 7;
    pub const MISSING_REALIZED_VOL: u32 = 1 << 8;
    pub const RANGE_VIOLATION: u32 = 1 << 9;
    pub const RECONCILIATION_MISMATCH: u32 = 1 << 10;
    pub const FORWARD_FILLED: u32 = 1 << 11;
    pub const OUTLIER_REJECTED: u32 = 1 << 12;
    pub const SPIKE_PATCHED: u32 = 1 << 13;

    pub const NAMES: [(u32, &'static str); 14] = [
        (Self::MISSING_DEX, "missing_dex"),
        (Self::MISSING_CEX, "missing_cex"),
        (Self::MISSING_GAS, "missing_gas"),
        (Self::MISSING_DEPTH, "missing_depth"),
        (Self::ZERO_DEPTH, "zero_depth"),
        (Self::INCOMPLETE_BAND, "incomplete_band"),
        (Self::MISSING_RETURN, "missing_return"),
        (Self::EMPTY_CONGESTION_WINDOW, "empty_congestion_window"),
        (Self::MISSING_REALIZED_VOL, "missing_realized_vol"),
        (Self::RANGE_VIOLATION, "range_violation"),
        (Self::RECONCILIATION_MISMATCH, "reconciliation_mismatch"),
        (Self::FORWARD_FILLED, "forward_filled"),
        (Self::OUTLIER_REJECTED, "outlier_rejected"),
        (Self::SPIKE_PATCHED, "spike_patched"),
    ];

    #[inline]
    pub fn set(&mut self, flag: u32) {
        self.0 |= flag;
    }

    #[inline]
    pub fn has(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn names(&self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(bit, _)| self.has(*bit))
            .map(|(_, name)| *name)
            .collect()
    }
}

// =============================================================================
// FEATURE ROW
// =============================================================================

/// One row per (minute_ts, pool_key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub minute_ts: Nanos,
    pub pool_key: String,
    pub fee_tier_bps: f64,

    // Raw joined inputs
    pub dex_mid: Option<f64>,
    pub depth_usd: Option<f64>,
    pub swap_last_price: Option<f64>,
    pub swap_count: u32,
    pub swap_turnover_usd: f64,
    pub cex_bid: Option<f64>,
    pub cex_ask: Option<f64>,
    pub cex_mid: Option<f64>,
    pub cex_spread_bps: Option<f64>,
    pub taker_fee_bps: Option<f64>,
    pub gas_base_fee_gwei: Option<f64>,
    pub effective_gas_gwei: Option<f64>,
    pub eth_usd: Option<f64>,
    pub gas_usd: Option<f64>,

    // Prices and returns
    pub dex_log_price: Option<f64>,
    pub cex_log_price: Option<f64>,
    pub dex_log_return: Option<f64>,
    pub cex_log_return: Option<f64>,
    pub price_diff: Option<f64>,
    pub wedge_bps: Option<f64>,

    // Cost band
    pub gas_cost_bps: Option<f64>,
    pub dex_fee_bps: Option<f64>,
    pub impact_cost_bps: Option<f64>,
    pub cex_cost_bps: Option<f64>,
    pub mev_cost_bps: Option<f64>,
    /// Sum of the non-null components.
    pub band_bps: Option<f64>,
    pub violation_flag: Option<bool>,
    pub violation_magnitude_bps: Option<f64>,

    // Controls
    pub congestion_pct: Option<f64>,
    pub realized_vol: Option<f64>,
    pub dex_staleness_min: Option<i64>,
    pub cex_staleness_min: Option<i64>,

    // Quality
    pub quality_flags: QualityFlags,
    pub is_interpolated: bool,
    pub is_late_arrival_revision: bool,
    pub source_coverage_score: f64,
}

impl FeatureRow {
    pub fn key(&self) -> (Nanos, &str) {
        (self.minute_ts, self.pool_key.as_str())
    }

    /// All band components present.
    pub fn band_complete(&self) -> bool {
        self.band_components().iter().all(|(_, v)| v.is_some())
    }

    pub fn band_components(&self) -> [(&'static str, Option<f64>); 5] {
        [
            ("gas_cost_bps", self.gas_cost_bps),
            ("dex_fee_bps", self.dex_fee_bps),
            ("impact_cost_bps", self.impact_cost_bps),
            ("cex_cost_bps", self.cex_cost_bps),
            ("mev_cost_bps", self.mev_cost_bps),
        ]
    }
}

// =============================================================================
// COST BAND
// =============================================================================

/// Computed band for one minute.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CostBand {
    pub gas_cost_bps: Option<f64>,
    pub dex_fee_bps: Option<f64>,
    pub impact_cost_bps: Option<f64>,
    pub cex_cost_bps: Option<f64>,
    pub mev_cost_bps: Option<f64>,
}

impl CostBand {
    fn components(&self) -> [Option<f64>; 5] {
        [
            self.gas_cost_bps,
            self.dex_fee_bps,
            self.impact_cost_bps,
            self.cex_cost_bps,
            self.mev_cost_bps,
        ]
    }

    pub fn is_complete(&self) -> bool {
        self.components().iter().all(Option::is_some)
    }

    pub fn total_bps(&self) -> f64 {
        self.components().iter().flatten().sum()
    }
}

/// `10000 * k * Q / depth` (or the square-root form). `None` for zero/missing depth.
///
/// Monotonically decreasing in depth for either model.
pub fn impact_cost_bps(model: ImpactModel, notional_usd: f64, depth_usd: Option<f64>) -> Option<f64> {
    let depth = depth_usd.filter(|d| d.is_finite() && *d > 0.0)?;
    let v = match model {
        ImpactModel::InverseDepth { coefficient } => 1e4 * coefficient * notional_usd / depth,
        ImpactModel::SquareRootDepth { coefficient } => 1e4 * coefficient * (notional_usd / depth).sqrt(),
    };
    Some(v)
}

/// `10000 * gas_usd / Q`
pub fn gas_cost_bps(gas_usd: Option<f64>, notional_usd: f64) -> Option<f64> {
    gas_usd.map(|g| 1e4 * g / notional_usd)
}

/// `taker_fee_bps + 0.5 * spread_bps`
pub fn cex_cost_bps(taker_fee_bps: f64, spread_bps: Option<f64>) -> Option<f64> {
    spread_bps.map(|s| taker_fee_bps + 0.5 * s)
}

pub fn mev_cost_bps(proxy: MevProxy, gas_cost_bps: Option<f64>) -> Option<f64> {
    match proxy {
        MevProxy::None => Some(0.0),
        MevProxy::ConstantBps { bps } => Some(bps),
        MevProxy::GasMultiple { multiple } => gas_cost_bps.map(|g| g * multiple),
    }
}

/// `(flag, magnitude)` with `magnitude = max(0, |wedge| - band)`.
pub fn violation(wedge_bps: f64, band_bps: f64) -> (bool, f64) {
    let magnitude = (wedge_bps.abs() - band_bps).max(0.0);
    (magnitude > 0.0, magnitude)
}

// =============================================================================
// PER-POOL STATE
// =============================================================================

/// State carried from one minute to the next for a pool, including across
/// partition boundaries.
#[derive(Debug, Clone)]
pub struct PoolFeatureState {
    pub last_minute: Option<Nanos>,
    pub prev_dex_log: Option<f64>,
    pub prev_cex_log: Option<f64>,
    pub last_dex_seen: Option<Nanos>,
    pub last_cex_seen: Option<Nanos>,
    pub last_fee_tier: Option<f64>,
    pub congestion: CongestionWindow,
    vol_window: VecDeque<Option<f64>>,
    vol_len: usize,
}

impl PoolFeatureState {
    pub fn new(congestion_window_days: u32, realized_vol_window_minutes: usize) -> Self {
        Self {
            last_minute: None,
            prev_dex_log: None,
            prev_cex_log: None,
            last_dex_seen: None,
            last_cex_seen: None,
            last_fee_tier: None,
            congestion: CongestionWindow::new(congestion_window_days),
            vol_window: VecDeque::with_capacity(realized_vol_window_minutes),
            vol_len: realized_vol_window_minutes,
        }
    }

    /// Rebuild state from previously published rows, oldest first.
    ///
    /// Produces the same state as having computed those rows in-process.
    pub fn warm_start(
        congestion_window_days: u32,
        realized_vol_window_minutes: usize,
        history: &[FeatureRow],
    ) -> Self {
        let mut state = Self::new(congestion_window_days, realized_vol_window_minutes);
        for row in history {
            state.congestion.evict(row.minute_ts);
            if let Some(g) = row.gas_usd {
                state.congestion.insert(row.minute_ts, g);
            }
            state.push_return(row.cex_log_return);
            if row.dex_mid.is_some() {
                state.last_dex_seen = Some(row.minute_ts);
                state.last_fee_tier = Some(row.fee_tier_bps);
            }
            if row.cex_mid.is_some() {
                state.last_cex_seen = Some(row.minute_ts);
            }
            state.prev_dex_log = row.dex_log_price;
            state.prev_cex_log = row.cex_log_price;
            state.last_minute = Some(row.minute_ts);
        }
        state
    }

    fn push_return(&mut self, r: Option<f64>) {
        self.vol_window.push_back(r);
        while self.vol_window.len() > self.vol_len {
            self.vol_window.pop_front();
        }
    }

    /// Annualized population std of the trailing returns. `None` unless the
    /// window is full and every return is present.
    fn realized_vol(&self) -> Option<f64> {
        if self.vol_window.len() < self.vol_len {
            return None;
        }
        let returns: Option<Vec<f64>> = self.vol_window.iter().copied().collect();
        let returns = returns?;
        Some(returns.population_std_dev() * MINUTES_PER_YEAR.sqrt())
    }
}

// =============================================================================
// CONSTRUCTOR
// =============================================================================

/// Bars of all four sources for one minute of one pool.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinuteInputs<'a> {
    pub pool_state: Option<&'a MinuteBar>,
    pub swaps: Option<&'a MinuteBar>,
    pub cex: Option<&'a MinuteBar>,
    pub gas: Option<&'a MinuteBar>,
}

pub struct FeatureConstructor<'a> {
    cost: &'a CostBandConfig,
    pool: &'a PoolConfig,
}

impl<'a> FeatureConstructor<'a> {
    pub fn new(cost: &'a CostBandConfig, pool: &'a PoolConfig) -> Self {
        Self { cost, pool }
    }

    /// Build one row and advance the pool state.
    pub fn build_row(&self, state: &mut PoolFeatureState, minute_ts: Nanos, inputs: MinuteInputs<'_>) -> FeatureRow {
        let mut flags = QualityFlags::default();

        let (dex_mid, depth_usd, fee_tier) = match inputs.pool_state.and_then(|b| b.close.as_ref()) {
            Some(CanonicalPayload::PoolState { mid, depth_usd, fee_tier_bps }) => {
                (Some(*mid), *depth_usd, *fee_tier_bps)
            }
            _ => (None, None, None),
        };
        let (swap_last_price, swap_count, swap_turnover_usd) = match inputs.swaps {
            Some(bar) => match bar.close {
                Some(CanonicalPayload::Swap { price, .. }) => (Some(price), bar.event_count, bar.turnover_usd),
                _ => (None, 0, 0.0),
            },
            None => (None, 0, 0.0),
        };
        let (cex_bid, cex_ask, cex_mid, cex_spread_bps, quote_fee) =
            match inputs.cex.and_then(|b| b.close.as_ref()) {
                Some(CanonicalPayload::CexQuote { bid, ask, mid, spread_bps, taker_fee_bps }) => {
                    (Some(*bid), Some(*ask), Some(*mid), Some(*spread_bps), *taker_fee_bps)
                }
                _ => (None, None, None, None, None),
            };
        let (gas_base_fee_gwei, effective_gas_gwei) = match inputs.gas.and_then(|b| b.close.as_ref()) {
            Some(CanonicalPayload::GasFee { base_fee_wei, effective_gas_gwei, .. }) => {
                (Some(base_fee_wei / 1e9), Some(*effective_gas_gwei))
            }
            _ => (None, None),
        };

        if dex_mid.is_none() {
            flags.set(QualityFlags::MISSING_DEX);
        }
        if cex_mid.is_none() {
            flags.set(QualityFlags::MISSING_CEX);
        }
        if effective_gas_gwei.is_none() {
            flags.set(QualityFlags::MISSING_GAS);
        }

        // Depth is never carried into a stale minute; the fee tier is.
        if dex_mid.is_some() && fee_tier.is_some() {
            state.last_fee_tier = fee_tier;
        }
        let fee_tier_bps = fee_tier.or(state.last_fee_tier).unwrap_or(self.pool.fee_tier_bps);

        // Prices
        let dex_log_price = dex_mid.map(f64::ln);
        let cex_log_price = cex_mid.map(f64::ln);
        let contiguous = state.last_minute == Some(minute_ts - NANOS_PER_MIN);
        let ret = |cur: Option<f64>, prev: Option<f64>| match (cur, prev) {
            (Some(c), Some(p)) if contiguous => Some(c - p),
            _ => None,
        };
        let dex_log_return = ret(dex_log_price, state.prev_dex_log);
        let cex_log_return = ret(cex_log_price, state.prev_cex_log);
        if dex_log_return.is_none() || cex_log_return.is_none() {
            flags.set(QualityFlags::MISSING_RETURN);
        }
        let wedge_bps = match (dex_log_price, cex_log_price) {
            (Some(d), Some(c)) => Some(1e4 * (d - c)),
            _ => None,
        };
        let price_diff = match (dex_mid, cex_mid) {
            (Some(d), Some(c)) => Some(d - c),
            _ => None,
        };

        // Gas in USD, priced with the CEX mid
        let eth_usd = cex_mid;
        let gas_usd = match (effective_gas_gwei, eth_usd) {
            (Some(g), Some(px)) => Some(self.cost.gas_units * g * 1e-9 * px),
            _ => None,
        };

        // Band
        let taker_fee_bps = if cex_mid.is_some() {
            Some(quote_fee.unwrap_or(self.cost.taker_fee_bps))
        } else {
            None
        };
        if dex_mid.is_some() && depth_usd.is_none() {
            flags.set(QualityFlags::MISSING_DEPTH);
        }
        if depth_usd == Some(0.0) {
            flags.set(QualityFlags::ZERO_DEPTH);
        }
        let gas_cost = gas_cost_bps(gas_usd, self.cost.notional_usd);
        let band = CostBand {
            gas_cost_bps: gas_cost,
            dex_fee_bps: Some(fee_tier_bps),
            impact_cost_bps: impact_cost_bps(self.cost.impact_model, self.cost.notional_usd, depth_usd),
            cex_cost_bps: taker_fee_bps.and_then(|t| cex_cost_bps(t, cex_spread_bps)),
            mev_cost_bps: mev_cost_bps(self.cost.mev_proxy, gas_cost),
        };
        let band_bps = band.total_bps();
        let (violation_flag, violation_magnitude_bps) = match wedge_bps {
            Some(w) if band.is_complete() => {
                let (f, m) = violation(w, band_bps);
                (Some(f), Some(m))
            }
            _ => (None, None),
        };
        if !band.is_complete() {
            flags.set(QualityFlags::INCOMPLETE_BAND);
        }

        // Controls
        state.congestion.evict(minute_ts);
        let congestion_pct = match gas_usd {
            Some(g) => {
                state.congestion.insert(minute_ts, g);
                state.congestion.rank(g)
            }
            None => None,
        };
        if state.congestion.is_empty() {
            flags.set(QualityFlags::EMPTY_CONGESTION_WINDOW);
        }
        state.push_return(cex_log_return);
        let realized_vol = state.realized_vol();
        if realized_vol.is_none() {
            flags.set(QualityFlags::MISSING_REALIZED_VOL);
        }

        if dex_mid.is_some() {
            state.last_dex_seen = Some(minute_ts);
        }
        if cex_mid.is_some() {
            state.last_cex_seen = Some(minute_ts);
        }
        let staleness = |seen: Option<Nanos>| seen.map(|s| (minute_ts - s) / NANOS_PER_MIN);
        let dex_staleness_min = staleness(state.last_dex_seen);
        let cex_staleness_min = staleness(state.last_cex_seen);

        state.prev_dex_log = dex_log_price;
        state.prev_cex_log = cex_log_price;
        state.last_minute = Some(minute_ts);

        let present = [dex_mid.is_some(), cex_mid.is_some(), effective_gas_gwei.is_some()];
        let source_coverage_score = present.iter().filter(|p| **p).count() as f64 / present.len() as f64;

        FeatureRow {
            minute_ts,
            pool_key: self.pool.pool_key.clone(),
            fee_tier_bps,
            dex_mid,
            depth_usd,
            swap_last_price,
            swap_count,
            swap_turnover_usd,
            cex_bid,
            cex_ask,
            cex_mid,
            cex_spread_bps,
            taker_fee_bps,
            gas_base_fee_gwei,
            effective_gas_gwei,
            eth_usd,
            gas_usd,
            dex_log_price,
            cex_log_price,
            dex_log_return,
            cex_log_return,
            price_diff,
            wedge_bps,
            gas_cost_bps: band.gas_cost_bps,
            dex_fee_bps: band.dex_fee_bps,
            impact_cost_bps: band.impact_cost_bps,
            cex_cost_bps: band.cex_cost_bps,
            mev_cost_bps: band.mev_cost_bps,
            band_bps: Some(band_bps),
            violation_flag,
            violation_magnitude_bps,
            congestion_pct,
            realized_vol,
            dex_staleness_min,
            cex_staleness_min,
            quality_flags: flags,
            is_interpolated: false,
            is_late_arrival_revision: false,
            source_coverage_score,
        }
    }

    /// Build all rows of a partition. Every bar slice must cover the same grid.
    pub fn build_partition(
        &self,
        state: &mut PoolFeatureState,
        minutes: &[Nanos],
        pool_state: &[MinuteBar],
        swaps: &[MinuteBar],
        cex: &[MinuteBar],
        gas: &[MinuteBar],
    ) -> Vec<FeatureRow> {
        minutes
            .iter()
            .enumerate()
            .map(|(i, &m)| {
                let inputs = MinuteInputs {
                    pool_state: pool_state.get(i),
                    swaps: swaps.get(i),
                    cex: cex.get(i),
                    gas: gas.get(i),
                };
                self.build_row(state, m, inputs)
            })
            .collect()
    }
}
