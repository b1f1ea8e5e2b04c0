//! Pipeline configuration
//!
//! Run-level constants (notional, gas units), window lengths, validation
//! thresholds, pool registry and filter parameters. Loaded from TOML.

use crate::estimator::regime::FilterConfig;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::robustness::RobustnessConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "BASISBAND_CONFIG_PATH";
const DEFAULT_CONFIG_PATH: &str = "basisband.toml";

/// Top-level pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// SQLite snapshot store.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Landed raw data, laid out as `<raw_dir>/<domain>/<YYYY-MM-DD>.jsonl`.
    #[serde(default = "default_raw_dir")]
    pub raw_dir: PathBuf,

    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,

    #[serde(default)]
    pub output_mode: OutputMode,

    #[serde(default)]
    pub source_mode: SourceMode,

    /// Seed for the synthetic source.
    #[serde(default = "default_seed")]
    pub synthetic_seed: u64,

    #[serde(default)]
    pub cost_band: CostBandConfig,

    #[serde(default)]
    pub windows: WindowConfig,

    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default = "default_pools")]
    pub pools: Vec<PoolConfig>,

    #[serde(default)]
    pub filter: FilterConfig,

    #[serde(default)]
    pub robustness: RobustnessConfig,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/basisband.db")
}
fn default_raw_dir() -> PathBuf {
    PathBuf::from("data/raw")
}
fn default_export_dir() -> PathBuf {
    PathBuf::from("data/export")
}
fn default_seed() -> u64 {
    42
}
fn default_pools() -> Vec<PoolConfig> {
    vec![
        PoolConfig {
            pool_key: "univ3_weth_usdc_5".into(),
            fee_tier_bps: 5.0,
            cex_symbol: "ETHUSDT".into(),
        },
        PoolConfig {
            pool_key: "univ3_weth_usdc_30".into(),
            fee_tier_bps: 30.0,
            cex_symbol: "ETHUSDT".into(),
        },
    ]
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            raw_dir: default_raw_dir(),
            export_dir: default_export_dir(),
            output_mode: OutputMode::default(),
            source_mode: SourceMode::default(),
            synthetic_seed: default_seed(),
            cost_band: CostBandConfig::default(),
            windows: WindowConfig::default(),
            validation: ValidationConfig::default(),
            pools: default_pools(),
            filter: FilterConfig::default(),
            robustness: RobustnessConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `BASISBAND_CONFIG_PATH` or the default path, falling back to defaults.
    pub fn from_env() -> Self {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default pipeline config ({}): {}", path, e);
            Self::default()
        })
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> PipelineResult<()> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| PipelineError::Config(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn pool(&self, pool_key: &str) -> Option<&PoolConfig> {
        self.pools.iter().find(|p| p.pool_key == pool_key)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        let cb = &self.cost_band;
        if !(cb.notional_usd > 0.0) {
            return Err(PipelineError::Config("cost_band.notional_usd must be > 0".into()));
        }
        if !(cb.gas_units > 0.0) {
            return Err(PipelineError::Config("cost_band.gas_units must be > 0".into()));
        }
        if cb.taker_fee_bps < 0.0 {
            return Err(PipelineError::Config("cost_band.taker_fee_bps must be >= 0".into()));
        }
        match cb.mev_proxy {
            MevProxy::None => {}
            MevProxy::ConstantBps { bps } if bps >= 0.0 => {}
            MevProxy::GasMultiple { multiple } if multiple >= 0.0 => {}
            _ => return Err(PipelineError::Config("mev_proxy parameter must be >= 0".into())),
        }
        if !(cb.impact_model.coefficient() > 0.0) {
            return Err(PipelineError::Config("impact coefficient must be > 0".into()));
        }

        let w = &self.windows;
        if w.congestion_window_days == 0 || w.realized_vol_window_minutes < 2 {
            return Err(PipelineError::Config(
                "congestion window must be >= 1 day and realized vol window >= 2 minutes".into(),
            ));
        }

        if self.pools.is_empty() {
            return Err(PipelineError::Config("at least one pool is required".into()));
        }
        let mut seen = HashSet::new();
        for pool in &self.pools {
            if pool.pool_key.is_empty() || !seen.insert(pool.pool_key.as_str()) {
                return Err(PipelineError::Config(format!(
                    "pool keys must be non-empty and unique: '{}'",
                    pool.pool_key
                )));
            }
            if pool.fee_tier_bps < 0.0 {
                return Err(PipelineError::Config(format!(
                    "pool {} has negative fee tier",
                    pool.pool_key
                )));
            }
        }

        let r = &self.robustness;
        if r.max_fill_age_minutes < 0 || !(r.max_jump > 1.0) || !(r.ratio_bounds.0 < r.ratio_bounds.1) {
            return Err(PipelineError::Config("invalid robustness parameters".into()));
        }

        self.filter.validate().map_err(PipelineError::Config)
    }
}

// =============================================================================
// MODES
// =============================================================================

/// Whether a run publishes provisional partitions or freezes them directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    #[default]
    Provisional,
    Frozen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    #[default]
    Synthetic,
    /// Requires an adapter injected by the caller.
    Live,
    /// Previously landed JSONL files under `raw_dir`.
    Landed,
}

// =============================================================================
// COST BAND
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum ImpactModel {
    /// `10000 * coefficient * Q / depth`
    InverseDepth { coefficient: f64 },
    /// `10000 * coefficient * sqrt(Q / depth)`
    SquareRootDepth { coefficient: f64 },
}

/// Price move, as a fraction, for a trade the size of the quoted depth.
pub const DEFAULT_IMPACT_COEFFICIENT: f64 = 0.01;

impl ImpactModel {
    pub fn coefficient(&self) -> f64 {
        match *self {
            Self::InverseDepth { coefficient } | Self::SquareRootDepth { coefficient } => coefficient,
        }
    }
}

impl Default for ImpactModel {
    fn default() -> Self {
        Self::InverseDepth { coefficient: DEFAULT_IMPACT_COEFFICIENT }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum MevProxy {
    None,
    ConstantBps { bps: f64 },
    /// MEV cost as a multiple of the gas component.
    GasMultiple { multiple: f64 },
}

impl Default for MevProxy {
    fn default() -> Self {
        Self::None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostBandConfig {
    /// Trade notional Q in USD.
    #[serde(default = "default_notional_usd")]
    pub notional_usd: f64,

    /// Gas units per swap (GU).
    #[serde(default = "default_gas_units")]
    pub gas_units: f64,

    /// Used when the CEX quote carries no fee of its own.
    #[serde(default = "default_taker_fee_bps")]
    pub taker_fee_bps: f64,

    #[serde(default)]
    pub impact_model: ImpactModel,

    #[serde(default)]
    pub mev_proxy: MevProxy,
}

fn default_notional_usd() -> f64 {
    50_000.0
}
fn default_gas_units() -> f64 {
    200_000.0
}
fn default_taker_fee_bps() -> f64 {
    5.0
}

impl Default for CostBandConfig {
    fn default() -> Self {
        Self {
            notional_usd: default_notional_usd(),
            gas_units: default_gas_units(),
            taker_fee_bps: default_taker_fee_bps(),
            impact_model: ImpactModel::default(),
            mev_proxy: MevProxy::default(),
        }
    }
}

// =============================================================================
// WINDOWS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_congestion_days")]
    pub congestion_window_days: u32,

    /// Trailing provisional days recomputed on each run.
    #[serde(default = "default_reprocess_days")]
    pub reprocess_window_days: u32,

    /// Provisional partitions older than this (relative to run end) are frozen.
    /// `0` disables the cadence.
    #[serde(default = "default_freeze_after_days")]
    pub freeze_after_days: u32,

    #[serde(default = "default_rv_minutes")]
    pub realized_vol_window_minutes: usize,
}

fn default_congestion_days() -> u32 {
    30
}
fn default_reprocess_days() -> u32 {
    3
}
fn default_freeze_after_days() -> u32 {
    7
}
fn default_rv_minutes() -> usize {
    30
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            congestion_window_days: default_congestion_days(),
            reprocess_window_days: default_reprocess_days(),
            freeze_after_days: default_freeze_after_days(),
            realized_vol_window_minutes: default_rv_minutes(),
        }
    }
}

// =============================================================================
// VALIDATION THRESHOLDS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Max lag between partition end and the last event of each source.
    #[serde(default = "default_freshness_lag")]
    pub max_freshness_lag_minutes: i64,

    #[serde(default = "default_max_null_rate")]
    pub max_null_rate: f64,

    #[serde(default = "default_max_consecutive_nulls")]
    pub max_consecutive_nulls: usize,

    /// CEX mid vs DEX mid (ETHUSD two ways). This is the wedge itself, so
    /// any wedge beyond it is also flagged as a reconciliation mismatch.
    #[serde(default = "default_recon_tolerance")]
    pub reconciliation_tolerance_bps: f64,

    /// Last swap price vs pool mid in the same minute.
    #[serde(default = "default_swap_tolerance")]
    pub swap_tolerance_bps: f64,

    #[serde(default = "default_max_abs_wedge")]
    pub max_abs_wedge_bps: f64,

    #[serde(default = "default_zscore")]
    pub wedge_zscore_threshold: f64,

    #[serde(default = "default_outlier_share")]
    pub max_outlier_share: f64,

    #[serde(default = "default_min_coverage")]
    pub min_source_coverage: f64,

    /// Treat any warning as fatal: the run fails before the affected
    /// partition is published and its staging rows are discarded.
    #[serde(default)]
    pub fail_on_warnings: bool,
}

fn default_freshness_lag() -> i64 {
    60
}
fn default_max_null_rate() -> f64 {
    0.5
}
fn default_max_consecutive_nulls() -> usize {
    120
}
fn default_recon_tolerance() -> f64 {
    100.0
}
fn default_swap_tolerance() -> f64 {
    200.0
}
fn default_max_abs_wedge() -> f64 {
    5_000.0
}
fn default_zscore() -> f64 {
    6.0
}
fn default_outlier_share() -> f64 {
    0.01
}
fn default_min_coverage() -> f64 {
    0.5
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_freshness_lag_minutes: default_freshness_lag(),
            max_null_rate: default_max_null_rate(),
            max_consecutive_nulls: default_max_consecutive_nulls(),
            reconciliation_tolerance_bps: default_recon_tolerance(),
            swap_tolerance_bps: default_swap_tolerance(),
            max_abs_wedge_bps: default_max_abs_wedge(),
            wedge_zscore_threshold: default_zscore(),
            max_outlier_share: default_outlier_share(),
            min_source_coverage: default_min_coverage(),
            fail_on_warnings: false,
        }
    }
}

// =============================================================================
// POOLS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub pool_key: String,
    pub fee_tier_bps: f64,
    /// CEX symbol joined against this pool.
    pub cex_symbol: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = PipelineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.cost_band.notional_usd, 50_000.0);
        assert_eq!(cfg.cost_band.gas_units, 200_000.0);
        assert_eq!(cfg.windows.congestion_window_days, 30);
        assert_eq!(cfg.windows.reprocess_window_days, 3);
    }

    #[test]
    fn test_save_load_preserves_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        let mut cfg = PipelineConfig::default();
        cfg.cost_band.impact_model = ImpactModel::SquareRootDepth { coefficient: 0.5 };
        cfg.cost_band.mev_proxy = MevProxy::ConstantBps { bps: 2.0 };
        cfg.output_mode = OutputMode::Frozen;
        cfg.save(&path).unwrap();

        let loaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: PipelineConfig = toml::from_str(
            r#"
            source_mode = "landed"

            [cost_band]
            notional_usd = 10000.0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.source_mode, SourceMode::Landed);
        assert_eq!(cfg.cost_band.notional_usd, 10_000.0);
        assert_eq!(cfg.cost_band.taker_fee_bps, 5.0);
        assert_eq!(cfg.pools.len(), 2);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = PipelineConfig::default();
        cfg.cost_band.notional_usd = 0.0;
        assert!(matches!(cfg.validate(), Err(PipelineError::Config(_))));

        let mut cfg = PipelineConfig::default();
        cfg.pools.push(cfg.pools[0].clone());
        assert!(cfg.validate().is_err());
    }
}
