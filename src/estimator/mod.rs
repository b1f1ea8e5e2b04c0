//! Latent State Estimator
//!
//! Reads published feature rows (never writes them) and produces a per-minute
//! belief about the efficient price and the CEX-DEX spread.
//!
//! - [`regime`]: congestion regimes and their parameter bundles
//! - [`state_space`]: the forward Kalman filter
//! - [`smoother`]: optional RTS backward pass, returned as a separate sequence

pub mod regime;
pub mod smoother;
pub mod state_space;

pub use regime::{classify, select_params, FilterConfig, NoiseModel, Regime, RegimeParams};
pub use smoother::{rts_smooth, SmoothedState};
pub use state_space::{EstimateStatus, FilterStats, LatentState, LatentStateFilter, Observation};

use crate::pipeline::features::FeatureRow;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Estimator output for one pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEstimate {
    pub pool_key: String,
    pub filtered: Vec<LatentState>,
    pub smoothed: Option<Vec<SmoothedState>>,
    pub stats: FilterStats,
}

impl PoolEstimate {
    /// Minutes whose estimate was lost to a numerical failure.
    pub fn numerical_issues(&self) -> u64 {
        self.stats.resets + self.stats.clamps
    }
}

/// Run the filter over rows of one pool, in minute order.
pub fn estimate_pool(pool_key: &str, rows: &[FeatureRow], cfg: &FilterConfig, smooth: bool) -> PoolEstimate {
    let observations: Vec<Observation> = rows.iter().map(Observation::from_feature_row).collect();
    let (filtered, stats) = LatentStateFilter::run(cfg.clone(), &observations);
    let smoothed = smooth.then(|| rts_smooth(&filtered, cfg.covariance_floor));

    if stats.resets > 0 {
        warn!(pool = %pool_key, resets = stats.resets, unavailable = stats.unavailable, "filter reset after numerical failure");
    }
    info!(
        pool = %pool_key,
        steps = stats.steps,
        filtered = stats.filtered,
        predict_only = stats.predict_only,
        clamps = stats.clamps,
        "estimation complete"
    );
    PoolEstimate { pool_key: pool_key.to_string(), filtered, smoothed, stats }
}
