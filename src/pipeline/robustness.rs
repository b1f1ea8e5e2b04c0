//! Robustness view
//!
//! A derived, explicitly labeled table built on top of the primary feature
//! table. Never feeds back into it.
//!
//! Per pool, in minute order:
//! 1. Outliers are dropped: DEX/CEX ratio outside `ratio_bounds`, or a jump of
//!    more than `max_jump` times against the last accepted value of the series.
//! 2. DEX and CEX mids are forward-filled, tracking the age of the filled value,
//!    up to `max_fill_age_minutes`.
//! 3. Single-minute spikes on fresh observations are patched with the mean of
//!    the two neighbours.
//!
//! Every row touched by 2 or 3 has `is_interpolated = true`.

use crate::pipeline::clock::NANOS_PER_MIN;
use crate::pipeline::features::{violation, FeatureRow, QualityFlags};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobustnessConfig {
    #[serde(default = "default_max_fill_age")]
    pub max_fill_age_minutes: i64,
    #[serde(default = "default_ratio_bounds")]
    pub ratio_bounds: (f64, f64),
    #[serde(default = "default_max_jump")]
    pub max_jump: f64,
    /// Minimum jump-and-revert ratio for a spike.
    #[serde(default = "default_spike_ratio")]
    pub spike_ratio: f64,
    /// Maximum ratio between the two neighbours of a spike.
    #[serde(default = "default_neighbor_tolerance")]
    pub neighbor_tolerance: f64,
}

fn default_max_fill_age() -> i64 {
    60
}
fn default_ratio_bounds() -> (f64, f64) {
    (0.5, 1.5)
}
fn default_max_jump() -> f64 {
    10.0
}
fn default_spike_ratio() -> f64 {
    1.20
}
fn default_neighbor_tolerance() -> f64 {
    1.03
}

impl Default for RobustnessConfig {
    fn default() -> Self {
        Self {
            max_fill_age_minutes: default_max_fill_age(),
            ratio_bounds: default_ratio_bounds(),
            max_jump: default_max_jump(),
            spike_ratio: default_spike_ratio(),
            neighbor_tolerance: default_neighbor_tolerance(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Filled {
    value: Option<f64>,
    age: Option<i64>,
}

fn drop_jumps(series: &mut [Option<f64>], max_jump: f64, rejected: &mut [bool]) {
    let mut last: Option<f64> = None;
    for (i, v) in series.iter_mut().enumerate() {
        if let Some(x) = *v {
            if let Some(prev) = last {
                let r = x / prev;
                if r > max_jump || r < 1.0 / max_jump {
                    *v = None;
                    rejected[i] = true;
                    continue;
                }
            }
            last = Some(x);
        }
    }
}

fn forward_fill(rows: &[FeatureRow], series: &[Option<f64>], max_age: i64) -> Vec<Filled> {
    let mut out = Vec::with_capacity(series.len());
    let mut last: Option<(i64, f64)> = None;
    for (row, v) in rows.iter().zip(series) {
        match v {
            Some(x) => {
                last = Some((row.minute_ts, *x));
                out.push(Filled { value: Some(*x), age: Some(0) });
            }
            None => {
                let filled = last.and_then(|(ts, x)| {
                    let age = (row.minute_ts - ts) / NANOS_PER_MIN;
                    (age <= max_age).then_some((x, age))
                });
                out.push(match filled {
                    Some((x, age)) => Filled { value: Some(x), age: Some(age) },
                    None => Filled { value: None, age: None },
                });
            }
        }
    }
    out
}

fn patch_spikes(filled: &mut [Filled], cfg: &RobustnessConfig, patched: &mut [bool]) {
    let original: Vec<Filled> = filled.to_vec();
    for i in 1..original.len().saturating_sub(1) {
        let (prev, cur, next) = (original[i - 1].value, original[i], original[i + 1].value);
        if cur.age != Some(0) {
            continue;
        }
        let (Some(p), Some(v), Some(n)) = (prev, cur.value, next) else {
            continue;
        };
        let neighbours_agree = p.max(n) / p.min(n) <= cfg.neighbor_tolerance;
        let up = v / p >= cfg.spike_ratio && v / n >= cfg.spike_ratio;
        let down = p / v >= cfg.spike_ratio && n / v >= cfg.spike_ratio;
        if neighbours_agree && (up || down) {
            filled[i].value = Some(0.5 * (p + n));
            patched[i] = true;
        }
    }
}

/// Build the forward-filled robustness view for one pool's rows (minute order).
pub fn robustness_view(rows: &[FeatureRow], cfg: &RobustnessConfig) -> Vec<FeatureRow> {
    let n = rows.len();
    let mut dex: Vec<Option<f64>> = rows.iter().map(|r| r.dex_mid).collect();
    let mut cex: Vec<Option<f64>> = rows.iter().map(|r| r.cex_mid).collect();
    let mut rejected = vec![false; n];

    let (lo, hi) = cfg.ratio_bounds;
    for i in 0..n {
        if let (Some(d), Some(c)) = (dex[i], cex[i]) {
            let ratio = d / c;
            if ratio < lo || ratio > hi {
                dex[i] = None;
                rejected[i] = true;
            }
        }
    }
    drop_jumps(&mut dex, cfg.max_jump, &mut rejected);
    drop_jumps(&mut cex, cfg.max_jump, &mut rejected);

    let mut dex_f = forward_fill(rows, &dex, cfg.max_fill_age_minutes);
    let mut cex_f = forward_fill(rows, &cex, cfg.max_fill_age_minutes);
    let mut patched = vec![false; n];
    patch_spikes(&mut dex_f, cfg, &mut patched);
    patch_spikes(&mut cex_f, cfg, &mut patched);

    let mut out: Vec<FeatureRow> = Vec::with_capacity(n);
    for (i, src) in rows.iter().enumerate() {
        let mut row = src.clone();
        let filled = dex_f[i].age.map_or(false, |a| a > 0) || cex_f[i].age.map_or(false, |a| a > 0);

        row.dex_mid = dex_f[i].value;
        row.cex_mid = cex_f[i].value;
        row.dex_staleness_min = dex_f[i].age;
        row.cex_staleness_min = cex_f[i].age;
        row.dex_log_price = row.dex_mid.map(f64::ln);
        row.cex_log_price = row.cex_mid.map(f64::ln);
        row.price_diff = match (row.dex_mid, row.cex_mid) {
            (Some(d), Some(c)) => Some(d - c),
            _ => None,
        };
        row.wedge_bps = match (row.dex_log_price, row.cex_log_price) {
            (Some(d), Some(c)) => Some(1e4 * (d - c)),
            _ => None,
        };
        let prev = out.last().filter(|p| p.minute_ts == src.minute_ts - NANOS_PER_MIN);
        let ret = |cur: Option<f64>, p: Option<f64>| match (cur, p) {
            (Some(c), Some(p)) => Some(c - p),
            _ => None,
        };
        row.dex_log_return = ret(row.dex_log_price, prev.and_then(|p| p.dex_log_price));
        row.cex_log_return = ret(row.cex_log_price, prev.and_then(|p| p.cex_log_price));
        let (flag, magnitude) = match (row.wedge_bps, row.band_bps) {
            (Some(w), Some(b)) if row.band_complete() => {
                let (f, m) = violation(w, b);
                (Some(f), Some(m))
            }
            _ => (None, None),
        };
        row.violation_flag = flag;
        row.violation_magnitude_bps = magnitude;

        if filled {
            row.quality_flags.set(QualityFlags::FORWARD_FILLED);
        }
        if rejected[i] {
            row.quality_flags.set(QualityFlags::OUTLIER_REJECTED);
        }
        if patched[i] {
            row.quality_flags.set(QualityFlags::SPIKE_PATCHED);
        }
        row.is_interpolated = filled || patched[i];
        out.push(row);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::config::{CostBandConfig, PoolConfig};
    use crate::pipeline::features::{FeatureConstructor, MinuteInputs, PoolFeatureState};

    fn rows(dex: &[Option<f64>], cex: &[Option<f64>]) -> Vec<FeatureRow> {
        let cost = CostBandConfig::default();
        let pool = PoolConfig { pool_key: "p".into(), fee_tier_bps: 5.0, cex_symbol: "X".into() };
        let fc = FeatureConstructor::new(&cost, &pool);
        let mut state = PoolFeatureState::new(30, 30);
        dex.iter()
            .zip(cex)
            .enumerate()
            .map(|(i, (d, c))| {
                let mut row = fc.build_row(&mut state, i as i64 * NANOS_PER_MIN, MinuteInputs::default());
                row.dex_mid = *d;
                row.cex_mid = *c;
                row
            })
            .collect()
    }

    #[test]
    fn test_forward_fill_tracks_age_and_leaves_primary_untouched() {
        let primary = rows(&[Some(3000.0), None, None, Some(3001.0)], &[Some(3000.0); 4]);
        let snapshot = primary.clone();
        let view = robustness_view(&primary, &RobustnessConfig::default());
        assert_eq!(primary, snapshot);

        assert_eq!(view[1].dex_mid, Some(3000.0));
        assert_eq!(view[2].dex_staleness_min, Some(2));
        assert!(view[1].is_interpolated && view[2].is_interpolated);
        assert!(!view[0].is_interpolated && !view[3].is_interpolated);
        assert!(view[2].quality_flags.has(QualityFlags::FORWARD_FILLED));
        assert_eq!(view[2].wedge_bps, Some(0.0));
    }

    #[test]
    fn test_fill_age_limit() {
        let cfg = RobustnessConfig { max_fill_age_minutes: 1, ..Default::default() };
        let view = robustness_view(&rows(&[Some(3000.0), None, None], &[Some(3000.0); 3]), &cfg);
        assert_eq!(view[1].dex_mid, Some(3000.0));
        assert_eq!(view[2].dex_mid, None);
    }

    #[test]
    fn test_ratio_outlier_dropped_then_filled() {
        let view = robustness_view(
            &rows(&[Some(3000.0), Some(9000.0)], &[Some(3000.0), Some(3000.0)]),
            &RobustnessConfig::default(),
        );
        assert!(view[1].quality_flags.has(QualityFlags::OUTLIER_REJECTED));
        assert_eq!(view[1].dex_mid, Some(3000.0));
        assert_eq!(view[1].dex_staleness_min, Some(1));
    }

    #[test]
    fn test_single_minute_spike_patched() {
        let cex = [Some(3000.0), Some(3000.0 * 1.25), Some(3010.0)];
        let view = robustness_view(&rows(&[None, None, None], &cex), &RobustnessConfig::default());
        assert!(view[1].quality_flags.has(QualityFlags::SPIKE_PATCHED));
        assert_eq!(view[1].cex_mid, Some(3005.0));
        assert!(view[1].is_interpolated);
    }
}
