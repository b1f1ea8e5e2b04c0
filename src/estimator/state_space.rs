//! Latent efficient-price / spread filter.
//!
//! State `x = [p*, s]` in log-price units:
//! - `p*` efficient price, random walk
//! - `s` spread, AR(1) toward `mu_t = (a + lambda * band_bps) * 1e-4`
//!
//! Observations per minute:
//! - `log cex = p* + s/2 + e_cex`
//! - `log dex = p* - s/2 + e_dex`
//!
//! Observation noise is diagonal, so the update processes the venues one at a
//! time with scalar gains (identical to the joint update for diagonal `R`).
//! Covariance updates use the Joseph form followed by symmetrization and an
//! eigenvalue floor.

use crate::estimator::regime::{select_params, FilterConfig, Regime, RegimeParams};
use crate::pipeline::clock::Nanos;
use crate::pipeline::features::FeatureRow;
use nalgebra::{Matrix2, RowVector2, SymmetricEigen, Vector2};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const H_CEX: [f64; 2] = [1.0, 0.5];
const H_DEX: [f64; 2] = [1.0, -0.5];

/// Filter input for one minute.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Observation {
    pub minute_ts: Nanos,
    pub log_cex: Option<f64>,
    pub log_dex: Option<f64>,
    pub band_bps: Option<f64>,
    pub congestion: Option<f64>,
    pub depth_usd: Option<f64>,
    /// Minutes since the venue was last observed (0 when fresh).
    pub cex_age_min: f64,
    pub dex_age_min: f64,
}

impl Observation {
    pub fn from_feature_row(row: &FeatureRow) -> Self {
        Self {
            minute_ts: row.minute_ts,
            log_cex: row.cex_log_price,
            log_dex: row.dex_log_price,
            band_bps: row.band_bps,
            congestion: row.congestion_pct,
            depth_usd: row.depth_usd,
            cex_age_min: row.cex_staleness_min.unwrap_or(0) as f64,
            dex_age_min: row.dex_staleness_min.unwrap_or(0) as f64,
        }
    }

    fn has_any(&self) -> bool {
        finite(self.log_cex).is_some() || finite(self.log_dex).is_some()
    }
}

fn finite(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateStatus {
    /// At least one venue observed and the update succeeded.
    Filtered,
    /// Neither venue observed; state is the prediction.
    PredictOnly,
    /// No usable estimate (before the first observation or after a numerical failure).
    Unavailable,
}

/// Filter belief for one minute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatentState {
    pub minute_ts: Nanos,
    pub status: EstimateStatus,
    pub regime: Regime,
    /// `[efficient log price, spread]`
    pub mean: [f64; 2],
    pub covariance: [[f64; 2]; 2],
    pub predicted_mean: [f64; 2],
    pub predicted_covariance: [[f64; 2]; 2],
    /// Spread persistence used in the prediction step.
    pub phi: f64,
    pub innovation_cex: Option<f64>,
    pub innovation_dex: Option<f64>,
    /// An eigenvalue or diagonal clamp was applied to the posterior.
    pub clamped: bool,
}

impl LatentState {
    pub fn is_available(&self) -> bool {
        self.status != EstimateStatus::Unavailable
    }

    pub fn efficient_log_price(&self) -> Option<f64> {
        self.is_available().then_some(self.mean[0])
    }

    pub fn efficient_price(&self) -> Option<f64> {
        self.efficient_log_price().map(f64::exp)
    }

    pub fn spread_bps(&self) -> Option<f64> {
        self.is_available().then_some(self.mean[1] * 1e4)
    }
}

pub(crate) fn to_vec(v: &[f64; 2]) -> Vector2<f64> {
    Vector2::new(v[0], v[1])
}

pub(crate) fn to_mat(m: &[[f64; 2]; 2]) -> Matrix2<f64> {
    Matrix2::new(m[0][0], m[0][1], m[1][0], m[1][1])
}

pub(crate) fn from_vec(v: &Vector2<f64>) -> [f64; 2] {
    [v[0], v[1]]
}

pub(crate) fn from_mat(m: &Matrix2<f64>) -> [[f64; 2]; 2] {
    [[m[(0, 0)], m[(0, 1)]], [m[(1, 0)], m[(1, 1)]]]
}

fn symmetrize(p: Matrix2<f64>) -> Matrix2<f64> {
    (p + p.transpose()) * 0.5
}

/// Symmetrize, floor eigenvalues at `floor` and clamp the diagonal at `cap`.
/// Returns the projected matrix and whether anything was clamped.
pub(crate) fn psd_project(p: Matrix2<f64>, floor: f64, cap: f64) -> (Matrix2<f64>, bool) {
    let p = symmetrize(p);
    let mut se = SymmetricEigen::new(p);
    let mut clamped = false;
    for ev in se.eigenvalues.iter_mut() {
        if *ev < floor {
            *ev = floor;
            clamped = true;
        }
    }
    let mut out = if clamped { symmetrize(se.recompose()) } else { p };
    for i in 0..2 {
        if out[(i, i)] > cap {
            out[(i, i)] = cap;
            clamped = true;
        }
    }
    (out, clamped)
}

fn is_finite_state(x: &Vector2<f64>, p: &Matrix2<f64>) -> bool {
    x.iter().all(|v| v.is_finite()) && p.iter().all(|v| v.is_finite())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterStats {
    pub steps: u64,
    pub filtered: u64,
    pub predict_only: u64,
    pub unavailable: u64,
    pub clamps: u64,
    pub resets: u64,
}

/// Recursive filter for one pool.
pub struct LatentStateFilter {
    cfg: FilterConfig,
    x: Vector2<f64>,
    p: Matrix2<f64>,
    initialized: bool,
    spread_target: f64,
    last_valid: Option<(Vector2<f64>, Matrix2<f64>)>,
    stats: FilterStats,
}

impl LatentStateFilter {
    pub fn new(cfg: FilterConfig) -> Self {
        let spread_target = cfg.spread_target(0.0);
        Self {
            cfg,
            x: Vector2::zeros(),
            p: Matrix2::zeros(),
            initialized: false,
            spread_target,
            last_valid: None,
            stats: FilterStats::default(),
        }
    }

    pub fn stats(&self) -> FilterStats {
        self.stats
    }

    /// Run a whole sequence.
    pub fn run(cfg: FilterConfig, observations: &[Observation]) -> (Vec<LatentState>, FilterStats) {
        let mut filter = Self::new(cfg);
        let states = observations.iter().map(|o| filter.step(o)).collect();
        (states, filter.stats())
    }

    fn initialize(&mut self, obs: &Observation) {
        let target = self.spread_target;
        let (p0, s0) = match (finite(obs.log_cex), finite(obs.log_dex)) {
            (Some(c), Some(d)) => (0.5 * (c + d), c - d),
            (Some(c), None) => (c - 0.5 * target, target),
            (None, Some(d)) => (d + 0.5 * target, target),
            (None, None) => return,
        };
        self.x = Vector2::new(p0, s0);
        self.p = Matrix2::new(self.cfg.initial_price_var, 0.0, 0.0, self.cfg.initial_spread_var);
        self.initialized = true;
    }

    pub fn step(&mut self, obs: &Observation) -> LatentState {
        self.stats.steps += 1;

        if let Some(b) = finite(obs.band_bps) {
            self.spread_target = self.cfg.spread_target(b);
        } else if let Some(b) = obs.band_bps {
            // Non-finite band poisons the target; let the failure path handle it.
            self.spread_target = b;
        }

        let (regime, params) = select_params(obs.congestion, &self.cfg);

        let fresh_start = !self.initialized;
        if fresh_start {
            self.initialize(obs);
            if !self.initialized {
                self.stats.unavailable += 1;
                return self.unavailable_state(obs.minute_ts, regime, params.phi);
            }
        }

        let (x_pred, p_pred) = if fresh_start {
            (self.x, self.p)
        } else {
            self.predict(&params)
        };

        match self.update(obs, x_pred, p_pred) {
            Some((x, p, innov_cex, innov_dex, clamped)) => {
                self.x = x;
                self.p = p;
                self.last_valid = Some((x, p));
                if clamped {
                    self.stats.clamps += 1;
                    debug!(minute_ts = obs.minute_ts, "posterior covariance clamped");
                }
                let status = if obs.has_any() {
                    self.stats.filtered += 1;
                    EstimateStatus::Filtered
                } else {
                    self.stats.predict_only += 1;
                    EstimateStatus::PredictOnly
                };
                LatentState {
                    minute_ts: obs.minute_ts,
                    status,
                    regime,
                    mean: from_vec(&x),
                    covariance: from_mat(&p),
                    predicted_mean: from_vec(&x_pred),
                    predicted_covariance: from_mat(&p_pred),
                    phi: params.phi,
                    innovation_cex: innov_cex,
                    innovation_dex: innov_dex,
                    clamped,
                }
            }
            None => {
                warn!(minute_ts = obs.minute_ts, "numerical failure in filter update, resetting");
                self.reset();
                self.stats.unavailable += 1;
                self.unavailable_state(obs.minute_ts, regime, params.phi)
            }
        }
    }

    fn predict(&self, params: &RegimeParams) -> (Vector2<f64>, Matrix2<f64>) {
        let f = Matrix2::new(1.0, 0.0, 0.0, params.phi);
        let c = Vector2::new(0.0, (1.0 - params.phi) * self.spread_target);
        let q = Matrix2::new(params.price_process_var, 0.0, 0.0, params.spread_process_var);
        let x = f * self.x + c;
        let p = symmetrize(f * self.p * f.transpose() + q);
        (x, p)
    }

    #[allow(clippy::type_complexity)]
    fn update(
        &self,
        obs: &Observation,
        x_pred: Vector2<f64>,
        p_pred: Matrix2<f64>,
    ) -> Option<(Vector2<f64>, Matrix2<f64>, Option<f64>, Option<f64>, bool)> {
        if !is_finite_state(&x_pred, &p_pred) {
            return None;
        }
        let noise = &self.cfg.noise;
        let mut x = x_pred;
        let mut p = p_pred;
        let mut innov_cex = None;
        let mut innov_dex = None;

        if let Some(y) = finite(obs.log_cex) {
            let r = noise.cex_variance(obs.congestion, obs.cex_age_min);
            innov_cex = Some(scalar_update(&mut x, &mut p, H_CEX, y, r)?);
        }
        if let Some(y) = finite(obs.log_dex) {
            let r = noise.dex_variance(obs.congestion, obs.depth_usd, obs.dex_age_min);
            innov_dex = Some(scalar_update(&mut x, &mut p, H_DEX, y, r)?);
        }

        let (p, clamped) = psd_project(p, self.cfg.covariance_floor, self.cfg.covariance_cap);
        if !is_finite_state(&x, &p) {
            return None;
        }
        Some((x, p, innov_cex, innov_dex, clamped))
    }

    /// Restore the last valid state with inflated uncertainty.
    fn reset(&mut self) {
        self.stats.resets += 1;
        match self.last_valid {
            Some((x, p)) => {
                let (p, _) = psd_project(
                    p * self.cfg.reset_inflation,
                    self.cfg.covariance_floor,
                    self.cfg.covariance_cap,
                );
                self.x = x;
                self.p = p;
                let fallback = self.cfg.spread_target(0.0);
                if !self.spread_target.is_finite() {
                    self.spread_target = fallback;
                }
            }
            None => {
                self.initialized = false;
                self.spread_target = self.cfg.spread_target(0.0);
            }
        }
    }

    fn unavailable_state(&self, minute_ts: Nanos, regime: Regime, phi: f64) -> LatentState {
        LatentState {
            minute_ts,
            status: EstimateStatus::Unavailable,
            regime,
            mean: from_vec(&self.x),
            covariance: from_mat(&self.p),
            predicted_mean: from_vec(&self.x),
            predicted_covariance: from_mat(&self.p),
            phi,
            innovation_cex: None,
            innovation_dex: None,
            clamped: false,
        }
    }
}

/// One scalar Joseph-form update. Returns the innovation, or `None` if the
/// innovation variance is not positive and finite.
fn scalar_update(
    x: &mut Vector2<f64>,
    p: &mut Matrix2<f64>,
    h: [f64; 2],
    y: f64,
    r: f64,
) -> Option<f64> {
    let h = RowVector2::new(h[0], h[1]);
    let innovation = y - (h * *x)[0];
    let s = (h * *p * h.transpose())[0] + r;
    if !(s.is_finite() && s > 0.0) || !innovation.is_finite() {
        return None;
    }
    let k: Vector2<f64> = *p * h.transpose() / s;
    *x += k * innovation;
    let i_kh = Matrix2::identity() - k * h;
    *p = symmetrize(i_kh * *p * i_kh.transpose() + k * k.transpose() * r);
    Some(innovation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::regime::NoiseModel;

    fn obs(t: i64, cex: Option<f64>, dex: Option<f64>) -> Observation {
        Observation {
            minute_ts: t,
            log_cex: cex,
            log_dex: dex,
            band_bps: Some(20.0),
            congestion: Some(0.5),
            depth_usd: Some(1_000_000.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_unavailable_before_first_observation() {
        let mut f = LatentStateFilter::new(FilterConfig::default());
        let s = f.step(&obs(0, None, None));
        assert_eq!(s.status, EstimateStatus::Unavailable);
        assert_eq!(s.efficient_price(), None);
    }

    #[test]
    fn test_both_missing_is_predict_only() {
        let mut f = LatentStateFilter::new(FilterConfig::default());
        let lp = 3000f64.ln();
        f.step(&obs(0, Some(lp), Some(lp)));
        let s = f.step(&obs(1, None, None));
        assert_eq!(s.status, EstimateStatus::PredictOnly);
        assert!(s.covariance[0][0] > 0.0);
        assert!((s.mean[0] - lp).abs() < 1e-6);
    }

    #[test]
    fn test_single_venue_update() {
        let mut f = LatentStateFilter::new(FilterConfig::default());
        let lp = 3000f64.ln();
        f.step(&obs(0, Some(lp), Some(lp)));
        let s = f.step(&obs(1, None, Some(lp + 1e-3)));
        assert_eq!(s.status, EstimateStatus::Filtered);
        assert!(s.innovation_cex.is_none());
        assert!(s.innovation_dex.is_some());
    }

    #[test]
    fn test_zero_noise_does_not_produce_singular_update() {
        let cfg = FilterConfig {
            noise: NoiseModel {
                cex_base_var: 0.0,
                dex_base_var: 0.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let mut f = LatentStateFilter::new(cfg);
        let lp = 3000f64.ln();
        for t in 0..100 {
            let s = f.step(&obs(t, Some(lp), Some(lp - 1e-4)));
            assert_eq!(s.status, EstimateStatus::Filtered);
            assert!(s.covariance.iter().flatten().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_numerical_failure_marks_minute_unavailable_and_recovers() {
        let mut f = LatentStateFilter::new(FilterConfig {
            band_loading: 1.0,
            ..Default::default()
        });
        let lp = 3000f64.ln();
        let good = f.step(&obs(0, Some(lp), Some(lp)));
        assert_eq!(good.status, EstimateStatus::Filtered);

        let mut bad = obs(1, Some(lp), Some(lp));
        bad.band_bps = Some(f64::INFINITY);
        let s = f.step(&bad);
        assert_eq!(s.status, EstimateStatus::Unavailable);
        assert!(s.efficient_price().is_none());

        let next = f.step(&obs(2, Some(lp), Some(lp)));
        assert_eq!(next.status, EstimateStatus::Filtered);
        assert!(next.mean.iter().all(|v| v.is_finite()));
        // Reset inflates uncertainty relative to the last valid posterior.
        assert!(next.predicted_covariance[0][0] > good.covariance[0][0]);
        assert_eq!(f.stats().resets, 1);
    }

    #[test]
    fn test_psd_project_floors_negative_eigenvalues() {
        let m = Matrix2::new(-1.0, 10.0, 10.0, -1.0);
        let (p, clamped) = psd_project(m, 1e-9, 1e6);
        assert!(clamped);
        let se = SymmetricEigen::new(p);
        assert!(se.eigenvalues.iter().all(|e| *e >= 1e-9 - 1e-12));
        assert!((p[(0, 1)] - p[(1, 0)]).abs() < 1e-12);
    }
}
