//! Cross-Pool Basis Spread
//!
//! Per-minute spread between the wedges of two pools quoting the same pair
//! against the same CEX symbol:
//!
//! ```text
//! basis_spread_bps(t) = wedge_bps[wide](t) - wedge_bps[narrow](t)
//! ```
//!
//! `narrow` is the lower fee tier. The spread is null whenever either leg is
//! null or either pool has no row for the minute. It is a read-only view over
//! published snapshots and never written back to a partition.

use crate::pipeline::clock::Nanos;
use crate::pipeline::config::{PipelineConfig, PoolConfig};
use crate::pipeline::error::PipelineResult;
use crate::pipeline::features::FeatureRow;
use crate::pipeline::store::SnapshotStore;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One minute of the cross-pool view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasisSpreadRow {
    pub minute_ts: Nanos,
    pub narrow_pool: String,
    pub wide_pool: String,
    pub narrow_wedge_bps: Option<f64>,
    pub wide_wedge_bps: Option<f64>,
    pub basis_spread_bps: Option<f64>,
}

/// Lowest and highest fee tier pools sharing a CEX symbol, if the config has
/// two distinct tiers for one symbol.
pub fn basis_pair(config: &PipelineConfig) -> Option<(&PoolConfig, &PoolConfig)> {
    let mut by_symbol: BTreeMap<&str, Vec<&PoolConfig>> = BTreeMap::new();
    for pool in &config.pools {
        by_symbol.entry(pool.cex_symbol.as_str()).or_default().push(pool);
    }
    by_symbol.into_values().find_map(|pools| {
        let narrow = pools.iter().min_by(|a, b| a.fee_tier_bps.total_cmp(&b.fee_tier_bps))?;
        let wide = pools.iter().max_by(|a, b| a.fee_tier_bps.total_cmp(&b.fee_tier_bps))?;
        (narrow.fee_tier_bps < wide.fee_tier_bps).then_some((*narrow, *wide))
    })
}

/// Joins two pools' rows on `minute_ts`. Minutes present in only one pool
/// appear with a null spread.
pub fn basis_spread(narrow: &[FeatureRow], wide: &[FeatureRow]) -> Vec<BasisSpreadRow> {
    let narrow_pool = narrow.first().map(|r| r.pool_key.clone()).unwrap_or_default();
    let wide_pool = wide.first().map(|r| r.pool_key.clone()).unwrap_or_default();

    let mut joined: BTreeMap<Nanos, (Option<f64>, Option<f64>)> = BTreeMap::new();
    for row in narrow {
        joined.entry(row.minute_ts).or_default().0 = row.wedge_bps;
    }
    for row in wide {
        joined.entry(row.minute_ts).or_default().1 = row.wedge_bps;
    }

    joined
        .into_iter()
        .map(|(minute_ts, (n, w))| BasisSpreadRow {
            minute_ts,
            narrow_pool: narrow_pool.clone(),
            wide_pool: wide_pool.clone(),
            narrow_wedge_bps: n,
            wide_wedge_bps: w,
            basis_spread_bps: match (n, w) {
                (Some(n), Some(w)) => Some(w - n),
                _ => None,
            },
        })
        .collect()
}

/// The spread over the current published snapshots of both pools.
pub fn basis_spread_view(
    store: &SnapshotStore,
    narrow: &PoolConfig,
    wide: &PoolConfig,
    first: NaiveDate,
    last: NaiveDate,
) -> PipelineResult<Vec<BasisSpreadRow>> {
    let n = store.history_rows(&narrow.pool_key, first, last)?;
    let w = store.history_rows(&wide.pool_key, first, last)?;
    let mut rows = basis_spread(&n, &w);
    for r in rows.iter_mut() {
        r.narrow_pool.clone_from(&narrow.pool_key);
        r.wide_pool.clone_from(&wide.pool_key);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::CostBandConfig;
    use crate::pipeline::features::{FeatureConstructor, MinuteInputs, PoolFeatureState};

    fn pool(key: &str, fee: f64) -> PoolConfig {
        PoolConfig { pool_key: key.into(), fee_tier_bps: fee, cex_symbol: "ETHUSDT".into() }
    }

    /// A row carrying only the wedge of `dex` against `cex`.
    fn row(p: &PoolConfig, minute_ts: Nanos, dex: Option<f64>, cex: Option<f64>) -> FeatureRow {
        let cost = CostBandConfig::default();
        let mut state = PoolFeatureState::new(30, 30);
        let mut row = FeatureConstructor::new(&cost, p).build_row(&mut state, minute_ts, MinuteInputs::default());
        row.dex_mid = dex;
        row.cex_mid = cex;
        row.wedge_bps = dex.zip(cex).map(|(d, c)| 1e4 * (d.ln() - c.ln()));
        row
    }

    #[test]
    fn test_spread_is_wide_minus_narrow_wedge() {
        let (p5, p30) = (pool("univ3_weth_usdc_5", 5.0), pool("univ3_weth_usdc_30", 30.0));
        let narrow = vec![row(&p5, 0, Some(100.1), Some(100.0))];
        let wide = vec![row(&p30, 0, Some(99.7), Some(100.0))];

        let out = basis_spread(&narrow, &wide);
        assert_eq!(out.len(), 1);
        let spread = out[0].basis_spread_bps.unwrap();
        // Log wedges: 1e4 * ln(99.7 / 100.1), about -40 bps.
        assert!((spread - 1e4 * (99.7f64 / 100.1).ln()).abs() < 1e-6);
        assert!((spread + 40.0).abs() < 0.1, "spread {}", spread);
        assert_eq!(out[0].narrow_pool, "univ3_weth_usdc_5");
        assert_eq!(out[0].wide_pool, "univ3_weth_usdc_30");
    }

    #[test]
    fn test_null_leg_gives_null_spread() {
        let (p5, p30) = (pool("a", 5.0), pool("b", 30.0));
        let narrow = vec![row(&p5, 0, Some(100.1), Some(100.0)), row(&p5, 60, None, Some(100.0))];
        let wide = vec![row(&p30, 0, Some(99.7), None), row(&p30, 60, Some(99.7), Some(100.0)), row(&p30, 120, Some(99.7), Some(100.0))];

        let out = basis_spread(&narrow, &wide);
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|r| r.basis_spread_bps.is_none()));
        assert!(out[1].wide_wedge_bps.is_some());
        assert!(out[2].narrow_wedge_bps.is_none());
    }

    #[test]
    fn test_pair_picks_fee_extremes_per_symbol() {
        let mut cfg = PipelineConfig::default();
        cfg.pools = vec![pool("mid", 30.0), pool("low", 5.0), pool("high", 100.0)];
        let (n, w) = basis_pair(&cfg).unwrap();
        assert_eq!((n.pool_key.as_str(), w.pool_key.as_str()), ("low", "high"));

        cfg.pools = vec![pool("only", 5.0)];
        assert!(basis_pair(&cfg).is_none());
    }
}
