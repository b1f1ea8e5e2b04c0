//! Congestion regimes and per-regime filter parameters.
//!
//! Parameters are a small tagged set of bundles. The active bundle is picked
//! each minute by an explicit classification of the congestion percentile, with
//! optional linear interpolation between neighbouring bundles.

use serde::{Deserialize, Serialize};

/// Congestion regime of a minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    /// Bottom congestion bin.
    Calm,
    Normal,
    /// Top congestion bin.
    Congested,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Calm => "calm",
            Self::Normal => "normal",
            Self::Congested => "congested",
        }
    }
}

/// Transition parameters for one regime. Variances are per minute, in log-price units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeParams {
    /// Spread persistence, `|phi| < 1`.
    pub phi: f64,
    pub price_process_var: f64,
    pub spread_process_var: f64,
}

impl RegimeParams {
    fn lerp(a: &Self, b: &Self, w: f64) -> Self {
        Self {
            phi: a.phi + (b.phi - a.phi) * w,
            price_process_var: a.price_process_var + (b.price_process_var - a.price_process_var) * w,
            spread_process_var: a.spread_process_var
                + (b.spread_process_var - a.spread_process_var) * w,
        }
    }
}

/// Observation noise as a function of friction and quality signals.
///
/// `var = base * (1 + congestion_gain * c) * (1 + staleness_gain * age_min)`,
/// with an extra `(1 + depth_gain * depth_ref / depth)` factor on the DEX leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseModel {
    #[serde(default = "default_cex_var")]
    pub cex_base_var: f64,
    #[serde(default = "default_dex_var")]
    pub dex_base_var: f64,
    #[serde(default = "default_congestion_gain")]
    pub congestion_gain: f64,
    #[serde(default = "default_staleness_gain")]
    pub staleness_gain: f64,
    #[serde(default = "default_depth_ref")]
    pub depth_ref_usd: f64,
    #[serde(default = "default_depth_gain")]
    pub depth_gain: f64,
    /// Depth ratio used when depth is missing or zero.
    #[serde(default = "default_missing_depth_ratio")]
    pub missing_depth_ratio: f64,
    /// Floor on every observation variance. Must be > 0.
    #[serde(default = "default_variance_floor")]
    pub variance_floor: f64,
    #[serde(default = "default_variance_cap")]
    pub variance_cap: f64,
}

fn default_cex_var() -> f64 {
    1.0e-8
}
fn default_dex_var() -> f64 {
    4.0e-8
}
fn default_congestion_gain() -> f64 {
    3.0
}
fn default_staleness_gain() -> f64 {
    0.5
}
fn default_depth_ref() -> f64 {
    1_000_000.0
}
fn default_depth_gain() -> f64 {
    1.0
}
fn default_missing_depth_ratio() -> f64 {
    10.0
}
fn default_variance_floor() -> f64 {
    1.0e-12
}
fn default_variance_cap() -> f64 {
    1.0
}

impl Default for NoiseModel {
    fn default() -> Self {
        Self {
            cex_base_var: default_cex_var(),
            dex_base_var: default_dex_var(),
            congestion_gain: default_congestion_gain(),
            staleness_gain: default_staleness_gain(),
            depth_ref_usd: default_depth_ref(),
            depth_gain: default_depth_gain(),
            missing_depth_ratio: default_missing_depth_ratio(),
            variance_floor: default_variance_floor(),
            variance_cap: default_variance_cap(),
        }
    }
}

impl NoiseModel {
    fn clamp(&self, v: f64) -> f64 {
        if !v.is_finite() {
            return self.variance_cap;
        }
        v.clamp(self.variance_floor, self.variance_cap)
    }

    fn congestion_factor(&self, congestion: Option<f64>) -> f64 {
        1.0 + self.congestion_gain * congestion.unwrap_or(0.5).clamp(0.0, 1.0)
    }

    pub fn cex_variance(&self, congestion: Option<f64>, staleness_min: f64) -> f64 {
        self.clamp(
            self.cex_base_var
                * self.congestion_factor(congestion)
                * (1.0 + self.staleness_gain * staleness_min.max(0.0)),
        )
    }

    pub fn dex_variance(
        &self,
        congestion: Option<f64>,
        depth_usd: Option<f64>,
        staleness_min: f64,
    ) -> f64 {
        let depth_ratio = match depth_usd {
            Some(d) if d > 0.0 && d.is_finite() => self.depth_ref_usd / d,
            _ => self.missing_depth_ratio,
        };
        self.clamp(
            self.dex_base_var
                * self.congestion_factor(congestion)
                * (1.0 + self.depth_gain * depth_ratio)
                * (1.0 + self.staleness_gain * staleness_min.max(0.0)),
        )
    }
}

/// Full estimator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Spread target intercept `a`, in bps.
    #[serde(default)]
    pub intercept_bps: f64,
    /// Loading `lambda` of the spread target on the cost band.
    #[serde(default)]
    pub band_loading: f64,

    /// Congestion at or below this is `Calm`.
    #[serde(default = "default_calm_threshold")]
    pub calm_threshold: f64,
    /// Congestion at or above this is `Congested`.
    #[serde(default = "default_congested_threshold")]
    pub congested_threshold: f64,
    /// Interpolate parameters between thresholds instead of using `Normal` flat.
    #[serde(default)]
    pub interpolate: bool,

    #[serde(default = "default_calm")]
    pub calm: RegimeParams,
    #[serde(default = "default_normal")]
    pub normal: RegimeParams,
    #[serde(default = "default_congested")]
    pub congested: RegimeParams,

    #[serde(default)]
    pub noise: NoiseModel,

    #[serde(default = "default_initial_price_var")]
    pub initial_price_var: f64,
    #[serde(default = "default_initial_spread_var")]
    pub initial_spread_var: f64,

    /// Covariance multiplier applied when resetting after a numerical failure.
    #[serde(default = "default_reset_inflation")]
    pub reset_inflation: f64,
    /// Eigenvalue floor for the posterior covariance.
    #[serde(default = "default_covariance_floor")]
    pub covariance_floor: f64,
    #[serde(default = "default_covariance_cap")]
    pub covariance_cap: f64,
}

fn default_calm_threshold() -> f64 {
    0.1
}
fn default_congested_threshold() -> f64 {
    0.9
}
fn default_calm() -> RegimeParams {
    RegimeParams { phi: 0.90, price_process_var: 1.0e-7, spread_process_var: 5.0e-9 }
}
fn default_normal() -> RegimeParams {
    RegimeParams { phi: 0.95, price_process_var: 2.0e-7, spread_process_var: 1.0e-8 }
}
fn default_congested() -> RegimeParams {
    RegimeParams { phi: 0.98, price_process_var: 4.0e-7, spread_process_var: 4.0e-8 }
}
fn default_initial_price_var() -> f64 {
    1.0e-4
}
fn default_initial_spread_var() -> f64 {
    1.0e-6
}
fn default_reset_inflation() -> f64 {
    10.0
}
fn default_covariance_floor() -> f64 {
    1.0e-16
}
fn default_covariance_cap() -> f64 {
    1.0
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            intercept_bps: 0.0,
            band_loading: 0.0,
            calm_threshold: default_calm_threshold(),
            congested_threshold: default_congested_threshold(),
            interpolate: false,
            calm: default_calm(),
            normal: default_normal(),
            congested: default_congested(),
            noise: NoiseModel::default(),
            initial_price_var: default_initial_price_var(),
            initial_spread_var: default_initial_spread_var(),
            reset_inflation: default_reset_inflation(),
            covariance_floor: default_covariance_floor(),
            covariance_cap: default_covariance_cap(),
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.calm_threshold)
            || !(0.0..=1.0).contains(&self.congested_threshold)
            || self.calm_threshold >= self.congested_threshold
        {
            return Err("filter thresholds must satisfy 0 <= calm < congested <= 1".into());
        }
        for (name, p) in [("calm", &self.calm), ("normal", &self.normal), ("congested", &self.congested)] {
            if !(p.phi.abs() < 1.0) {
                return Err(format!("filter.{}.phi must satisfy |phi| < 1", name));
            }
            if p.price_process_var < 0.0 || p.spread_process_var < 0.0 {
                return Err(format!("filter.{} process variances must be >= 0", name));
            }
        }
        if !(self.noise.variance_floor > 0.0) || self.noise.variance_cap < self.noise.variance_floor {
            return Err("filter.noise floor must be > 0 and below the cap".into());
        }
        if !(self.covariance_floor > 0.0) || !(self.reset_inflation >= 1.0) {
            return Err("filter covariance floor must be > 0 and reset inflation >= 1".into());
        }
        Ok(())
    }

    /// Spread target in log units for a given band.
    pub fn spread_target(&self, band_bps: f64) -> f64 {
        (self.intercept_bps + self.band_loading * band_bps) * 1e-4
    }

    pub fn params(&self, regime: Regime) -> RegimeParams {
        match regime {
            Regime::Calm => self.calm,
            Regime::Normal => self.normal,
            Regime::Congested => self.congested,
        }
    }
}

/// Classify a congestion percentile. Missing congestion is `Normal`.
pub fn classify(congestion: Option<f64>, cfg: &FilterConfig) -> Regime {
    match congestion {
        Some(c) if c.is_finite() && c <= cfg.calm_threshold => Regime::Calm,
        Some(c) if c.is_finite() && c >= cfg.congested_threshold => Regime::Congested,
        _ => Regime::Normal,
    }
}

/// Pick the parameter bundle for a minute.
///
/// With interpolation on, parameters move linearly from `calm` to `normal`
/// over the lower half of `(calm_threshold, congested_threshold)` and from
/// `normal` to `congested` over the upper half.
pub fn select_params(congestion: Option<f64>, cfg: &FilterConfig) -> (Regime, RegimeParams) {
    let regime = classify(congestion, cfg);
    let c = match (regime, congestion) {
        (Regime::Normal, Some(c)) if cfg.interpolate && c.is_finite() => c,
        _ => return (regime, cfg.params(regime)),
    };

    let mid = 0.5 * (cfg.calm_threshold + cfg.congested_threshold);
    let params = if c <= mid {
        let w = (c - cfg.calm_threshold) / (mid - cfg.calm_threshold);
        RegimeParams::lerp(&cfg.calm, &cfg.normal, w.clamp(0.0, 1.0))
    } else {
        let w = (c - mid) / (cfg.congested_threshold - mid);
        RegimeParams::lerp(&cfg.normal, &cfg.congested, w.clamp(0.0, 1.0))
    };
    (regime, params)
}
