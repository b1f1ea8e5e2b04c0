//! Validation Engine
//!
//! Runs five check classes over one partition of feature rows:
//!
//! | Check          | Failure effect                                   |
//! |----------------|--------------------------------------------------|
//! | schema         | fatal, the run aborts before anything is persisted |
//! | freshness      | recorded as `stale_data`                         |
//! | range          | row kept, `RANGE_VIOLATION` flag set             |
//! | distribution   | recorded as `distribution_shift`                 |
//! | reconciliation | row kept, `RECONCILIATION_MISMATCH` flag set     |
//!
//! The DEX-vs-CEX reconciliation leg measures the same log distance as
//! `wedge_bps`. A wedge wider than `reconciliation_tolerance_bps` therefore
//! carries both `violation_flag` and `RECONCILIATION_MISMATCH`; a violation
//! inside the tolerance carries only the former.
//!
//! Results are collected per partition into a [`PartitionReport`] and merged
//! into the run-level [`RunReport`].

use crate::pipeline::clock::{is_minute_aligned, MinuteGrid, Nanos, NANOS_PER_MIN};
use crate::pipeline::config::ValidationConfig;
use crate::pipeline::error::{IssueKind, PipelineError, PipelineResult};
use crate::pipeline::events::SourceDomain;
use crate::pipeline::features::{FeatureRow, QualityFlags};
use crate::pipeline::normalize::NormalizeStats;
use crate::pipeline::store::RunStatus;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use statrs::statistics::Statistics;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

// =============================================================================
// TABLE SCHEMA
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Int,
    Float,
    Bool,
    Text,
}

impl FieldType {
    fn matches(&self, v: &Value) -> bool {
        match self {
            Self::Int => v.is_i64() || v.is_u64(),
            Self::Float => v.is_number(),
            Self::Bool => v.is_boolean(),
            Self::Text => v.is_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldDefinition {
    pub name: &'static str,
    pub field_type: FieldType,
    /// Must be present and non-null.
    pub required: bool,
}

impl FieldDefinition {
    const fn required(name: &'static str, field_type: FieldType) -> Self {
        Self { name, field_type, required: true }
    }

    const fn nullable(name: &'static str, field_type: FieldType) -> Self {
        Self { name, field_type, required: false }
    }
}

/// Expected columns and primary key of a table.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: &'static str,
    pub fields: Vec<FieldDefinition>,
    pub key: Vec<&'static str>,
    /// Integer nanosecond column that must sit on a minute boundary.
    pub minute_column: Option<&'static str>,
}

impl TableSchema {
    pub fn feature_table() -> Self {
        use FieldType::*;
        let mut fields = vec![
            FieldDefinition::required("minute_ts", Int),
            FieldDefinition::required("pool_key", Text),
            FieldDefinition::required("fee_tier_bps", Float),
            FieldDefinition::required("swap_count", Int),
            FieldDefinition::required("swap_turnover_usd", Float),
            FieldDefinition::nullable("violation_flag", Bool),
            FieldDefinition::nullable("dex_staleness_min", Int),
            FieldDefinition::nullable("cex_staleness_min", Int),
            FieldDefinition::required("quality_flags", Int),
            FieldDefinition::required("is_interpolated", Bool),
            FieldDefinition::required("is_late_arrival_revision", Bool),
            FieldDefinition::required("source_coverage_score", Float),
        ];
        for name in NULLABLE_FLOAT_COLUMNS {
            fields.push(FieldDefinition::nullable(name, Float));
        }
        Self {
            name: "feature_rows",
            fields,
            key: vec!["minute_ts", "pool_key"],
            minute_column: Some("minute_ts"),
        }
    }

    /// Check types, required columns and key uniqueness.
    ///
    /// Returns the rows as JSON objects for the checks that follow.
    pub fn check<T: Serialize>(&self, rows: &[T]) -> PipelineResult<Vec<Map<String, Value>>> {
        let mut objects = Vec::with_capacity(rows.len());
        let mut keys = HashSet::with_capacity(rows.len());

        for (i, row) in rows.iter().enumerate() {
            let obj = match serde_json::to_value(row)? {
                Value::Object(m) => m,
                other => {
                    return Err(PipelineError::Schema(format!(
                        "{}: row {} is not an object ({})",
                        self.name, i, other
                    )))
                }
            };
            for field in &self.fields {
                match obj.get(field.name) {
                    None => {
                        return Err(PipelineError::Schema(format!(
                            "{}: row {} missing column {}",
                            self.name, i, field.name
                        )))
                    }
                    Some(Value::Null) if field.required => {
                        return Err(PipelineError::Schema(format!(
                            "{}: row {} has null in required column {}",
                            self.name, i, field.name
                        )))
                    }
                    Some(Value::Null) => {}
                    Some(v) if !field.field_type.matches(v) => {
                        return Err(PipelineError::Schema(format!(
                            "{}: row {} column {} expected {:?}, got {}",
                            self.name, i, field.name, field.field_type, v
                        )))
                    }
                    Some(_) => {}
                }
            }
            if let Some(col) = self.minute_column {
                let ts = obj.get(col).and_then(Value::as_i64).unwrap_or(0);
                if !is_minute_aligned(ts) {
                    return Err(PipelineError::Schema(format!(
                        "{}: row {} {} = {} is not minute-aligned",
                        self.name, i, col, ts
                    )));
                }
            }
            let key: Vec<String> = self
                .key
                .iter()
                .map(|k| obj.get(*k).map(Value::to_string).unwrap_or_default())
                .collect();
            let key = key.join("|");
            if !keys.insert(key.clone()) {
                return Err(PipelineError::Schema(format!(
                    "{}: duplicate key {}",
                    self.name, key
                )));
            }
            objects.push(obj);
        }
        Ok(objects)
    }
}

const NULLABLE_FLOAT_COLUMNS: [&str; 27] = [
    "dex_mid",
    "depth_usd",
    "swap_last_price",
    "cex_bid",
    "cex_ask",
    "cex_mid",
    "cex_spread_bps",
    "taker_fee_bps",
    "gas_base_fee_gwei",
    "effective_gas_gwei",
    "eth_usd",
    "gas_usd",
    "dex_log_price",
    "cex_log_price",
    "dex_log_return",
    "cex_log_return",
    "price_diff",
    "wedge_bps",
    "gas_cost_bps",
    "dex_fee_bps",
    "impact_cost_bps",
    "cex_cost_bps",
    "mev_cost_bps",
    "band_bps",
    "violation_magnitude_bps",
    "congestion_pct",
    "realized_vol",
];

// =============================================================================
// MISSINGNESS
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnMissingness {
    pub null_count: u64,
    pub row_count: u64,
    pub null_rate: f64,
    pub max_consecutive_nulls: u64,
}

/// Per-column null statistics over rows already in key order.
pub fn missingness(objects: &[Map<String, Value>]) -> BTreeMap<String, ColumnMissingness> {
    let mut out: BTreeMap<String, ColumnMissingness> = BTreeMap::new();
    let mut runs: BTreeMap<String, u64> = BTreeMap::new();
    for obj in objects {
        for (col, v) in obj {
            let m = out.entry(col.clone()).or_default();
            m.row_count += 1;
            let run = runs.entry(col.clone()).or_insert(0);
            if v.is_null() {
                m.null_count += 1;
                *run += 1;
                m.max_consecutive_nulls = m.max_consecutive_nulls.max(*run);
            } else {
                *run = 0;
            }
        }
    }
    for m in out.values_mut() {
        m.null_rate = if m.row_count == 0 { 0.0 } else { m.null_count as f64 / m.row_count as f64 };
    }
    out
}

// =============================================================================
// REPORTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Schema,
    Freshness,
    Range,
    Distribution,
    Reconciliation,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Schema => "schema",
            Self::Freshness => "freshness",
            Self::Range => "range",
            Self::Distribution => "distribution",
            Self::Reconciliation => "reconciliation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check: CheckKind,
    pub passed: bool,
    pub detail: String,
}

/// Validation outcome for one (pool, date) partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionReport {
    pub pool_key: String,
    pub date: NaiveDate,
    pub rows_emitted: u64,
    pub checks: Vec<CheckResult>,
    pub issues: BTreeMap<String, u64>,
    /// Non-stale share of minutes per source domain.
    pub coverage: BTreeMap<String, f64>,
    pub missingness: BTreeMap<String, ColumnMissingness>,
    pub revisions: u64,
    pub published_version: Option<u32>,
}

impl PartitionReport {
    pub fn new(pool_key: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            pool_key: pool_key.into(),
            date,
            rows_emitted: 0,
            checks: Vec::new(),
            issues: BTreeMap::new(),
            coverage: BTreeMap::new(),
            missingness: BTreeMap::new(),
            revisions: 0,
            published_version: None,
        }
    }

    pub fn record_issue(&mut self, kind: IssueKind, count: u64) {
        if count > 0 {
            *self.issues.entry(kind.as_str().to_string()).or_insert(0) += count;
        }
    }

    fn record_check(&mut self, check: CheckKind, passed: bool, detail: impl Into<String>) {
        let detail = detail.into();
        if !passed {
            warn!(
                pool = %self.pool_key,
                date = %self.date,
                check = check.as_str(),
                detail = %detail,
                "validation check failed"
            );
        }
        self.checks.push(CheckResult { check, passed, detail });
    }

    pub fn check(&self, check: CheckKind) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.check == check)
    }

    /// Issues and failed checks, as `name=count` / `check` labels.
    pub fn warnings(&self) -> Vec<String> {
        let issues = self.issues.iter().filter(|(_, n)| **n > 0).map(|(k, n)| format!("{}={}", k, n));
        let checks = self.checks.iter().filter(|c| !c.passed).map(|c| format!("{} check failed", c.check.as_str()));
        issues.chain(checks).collect()
    }

    pub fn issue_count(&self, kind: IssueKind) -> u64 {
        self.issues.get(kind.as_str()).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckTally {
    pub passed: u64,
    pub failed: u64,
}

/// Machine-readable summary of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub rows_ingested: u64,
    pub rows_rejected: u64,
    pub reject_reasons: BTreeMap<String, u64>,
    pub rows_emitted: u64,
    pub null_rates: BTreeMap<String, f64>,
    pub revision_count: u64,
    pub partitions_published: u64,
    pub partitions_unchanged: u64,
    pub partitions_resumed: u64,
    pub partitions_skipped_frozen: u64,
    pub partitions_frozen: u64,
    pub checks: BTreeMap<String, CheckTally>,
    pub issues: BTreeMap<String, u64>,
    pub partitions: Vec<PartitionReport>,
    pub fatal_error: Option<String>,
    #[serde(skip)]
    null_counts: BTreeMap<String, (u64, u64)>,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunStatus::Running,
            rows_ingested: 0,
            rows_rejected: 0,
            reject_reasons: BTreeMap::new(),
            rows_emitted: 0,
            null_rates: BTreeMap::new(),
            revision_count: 0,
            partitions_published: 0,
            partitions_unchanged: 0,
            partitions_resumed: 0,
            partitions_skipped_frozen: 0,
            partitions_frozen: 0,
            checks: BTreeMap::new(),
            issues: BTreeMap::new(),
            partitions: Vec::new(),
            fatal_error: None,
            null_counts: BTreeMap::new(),
        }
    }

    pub fn add_normalize_stats(&mut self, stats: &NormalizeStats) {
        self.rows_ingested += stats.total_events;
        self.rows_rejected += stats.rejected_total();
        for (reason, n) in &stats.rejected {
            *self.reject_reasons.entry(reason.clone()).or_insert(0) += n;
        }
        self.record_issue(IssueKind::RejectedEvent, stats.rejected_total());
    }

    pub fn record_issue(&mut self, kind: IssueKind, count: u64) {
        if count > 0 {
            *self.issues.entry(kind.as_str().to_string()).or_insert(0) += count;
        }
    }

    pub fn add_partition(&mut self, partition: PartitionReport) {
        self.rows_emitted += partition.rows_emitted;
        self.revision_count += partition.revisions;
        for c in &partition.checks {
            let tally = self.checks.entry(c.check.as_str().to_string()).or_default();
            if c.passed {
                tally.passed += 1;
            } else {
                tally.failed += 1;
            }
        }
        for (k, n) in &partition.issues {
            *self.issues.entry(k.clone()).or_insert(0) += n;
        }
        for (col, m) in &partition.missingness {
            let e = self.null_counts.entry(col.clone()).or_insert((0, 0));
            e.0 += m.null_count;
            e.1 += m.row_count;
        }
        self.partitions.push(partition);
    }

    pub fn issue_count(&self, kind: IssueKind) -> u64 {
        self.issues.get(kind.as_str()).copied().unwrap_or(0)
    }

    pub fn has_warnings(&self) -> bool {
        self.issues.values().any(|n| *n > 0) || self.checks.values().any(|t| t.failed > 0)
    }

    /// Compute null rates and the terminal status. With `fail_on_warnings`
    /// a run that only raised warnings ends as `Failed`.
    pub fn finalize(&mut self, fatal: Option<&PipelineError>, fail_on_warnings: bool) -> RunStatus {
        self.null_rates = self
            .null_counts
            .iter()
            .map(|(col, (nulls, rows))| {
                let rate = if *rows == 0 { 0.0 } else { *nulls as f64 / *rows as f64 };
                (col.clone(), rate)
            })
            .collect();
        self.status = match fatal {
            Some(e) => {
                self.fatal_error = Some(e.to_string());
                RunStatus::Failed
            }
            None if self.has_warnings() && fail_on_warnings => {
                let raised: Vec<&str> = self
                    .issues
                    .iter()
                    .filter(|(_, n)| **n > 0)
                    .map(|(k, _)| k.as_str())
                    .chain(self.checks.iter().filter(|(_, t)| t.failed > 0).map(|(k, _)| k.as_str()))
                    .collect();
                let err = PipelineError::WarningsNotAllowed(raised.join(", "));
                self.fatal_error = Some(err.to_string());
                RunStatus::Failed
            }
            None if self.has_warnings() => RunStatus::SucceededWithWarnings,
            None => RunStatus::Succeeded,
        };
        self.status
    }

    pub fn to_json(&self) -> PipelineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct ValidationEngine<'a> {
    cfg: &'a ValidationConfig,
    schema: TableSchema,
}

impl<'a> ValidationEngine<'a> {
    pub fn new(cfg: &'a ValidationConfig) -> Self {
        Self { cfg, schema: TableSchema::feature_table() }
    }

    /// Run every check on one partition. Rows are flagged in place.
    ///
    /// `last_events` is the timestamp of the last aligned event per source.
    /// Returns `Err(Schema)` on a fatal schema failure.
    pub fn validate_partition(
        &self,
        report: &mut PartitionReport,
        grid: &MinuteGrid,
        rows: &mut [FeatureRow],
        last_events: &[(SourceDomain, Option<Nanos>)],
    ) -> PipelineResult<()> {
        let objects = match self.schema.check(rows) {
            Ok(o) => o,
            Err(e) => {
                report.record_check(CheckKind::Schema, false, e.to_string());
                return Err(e);
            }
        };
        report.record_check(CheckKind::Schema, true, format!("{} rows", rows.len()));
        report.rows_emitted = rows.len() as u64;

        self.check_freshness(report, grid, rows, last_events);
        self.check_ranges(report, rows);
        report.missingness = missingness(&objects);
        self.check_distribution(report, rows);
        self.check_reconciliation(report, rows);

        let missing = rows
            .iter()
            .filter(|r| {
                r.quality_flags.has(QualityFlags::MISSING_DEX)
                    || r.quality_flags.has(QualityFlags::MISSING_CEX)
                    || r.quality_flags.has(QualityFlags::MISSING_GAS)
            })
            .count() as u64;
        report.record_issue(IssueKind::MissingSourceData, missing);
        Ok(())
    }

    fn check_freshness(
        &self,
        report: &mut PartitionReport,
        grid: &MinuteGrid,
        rows: &[FeatureRow],
        last_events: &[(SourceDomain, Option<Nanos>)],
    ) {
        let mut problems = Vec::new();

        let covered: HashSet<Nanos> = rows.iter().map(|r| r.minute_ts).collect();
        let missing_minutes = grid.minutes().filter(|m| !covered.contains(m)).count();
        if missing_minutes > 0 {
            problems.push(format!("{} grid minutes without a row", missing_minutes));
        }

        let max_lag = self.cfg.max_freshness_lag_minutes;
        for (domain, last) in last_events {
            let lag = match last {
                Some(ts) => (grid.end - ts) / NANOS_PER_MIN,
                None => grid.len() as i64,
            };
            if lag > max_lag {
                problems.push(format!("{} lag {} min > {}", domain, lag, max_lag));
            }
        }

        report.record_issue(IssueKind::StaleData, problems.len() as u64);
        let passed = problems.is_empty();
        report.record_check(CheckKind::Freshness, passed, problems.join("; "));
    }

    fn check_ranges(&self, report: &mut PartitionReport, rows: &mut [FeatureRow]) {
        let mut flagged = 0u64;
        let mut first: Option<String> = None;
        for row in rows.iter_mut() {
            let bad = range_violations(row, self.cfg.max_abs_wedge_bps);
            if !bad.is_empty() {
                flagged += 1;
                row.quality_flags.set(QualityFlags::RANGE_VIOLATION);
                debug!(pool = %row.pool_key, minute_ts = row.minute_ts, fields = ?bad, "range violation");
                if first.is_none() {
                    first = Some(format!("minute {}: {}", row.minute_ts, bad.join(",")));
                }
            }
        }
        report.record_issue(IssueKind::RangeViolation, flagged);
        let detail = match first {
            Some(f) => format!("{} rows flagged, first at {}", flagged, f),
            None => String::new(),
        };
        report.record_check(CheckKind::Range, flagged == 0, detail);
    }

    fn check_distribution(&self, report: &mut PartitionReport, rows: &[FeatureRow]) {
        let mut problems = Vec::new();

        for (col, m) in &report.missingness {
            if m.null_rate > self.cfg.max_null_rate {
                problems.push(format!("{} null rate {:.3}", col, m.null_rate));
            }
            if m.max_consecutive_nulls as usize > self.cfg.max_consecutive_nulls {
                problems.push(format!("{} {} consecutive nulls", col, m.max_consecutive_nulls));
            }
        }

        let wedges: Vec<f64> = rows.iter().filter_map(|r| r.wedge_bps).filter(|w| w.is_finite()).collect();
        if wedges.len() >= 2 {
            let mean = wedges.iter().mean();
            let std = wedges.iter().population_std_dev();
            if std > 0.0 {
                let outliers = wedges
                    .iter()
                    .filter(|w| ((*w - mean) / std).abs() > self.cfg.wedge_zscore_threshold)
                    .count();
                let share = outliers as f64 / wedges.len() as f64;
                if share > self.cfg.max_outlier_share {
                    problems.push(format!("wedge outlier share {:.4}", share));
                }
            }
        }

        report.record_issue(IssueKind::DistributionShift, problems.len() as u64);
        let passed = problems.is_empty();
        report.record_check(CheckKind::Distribution, passed, problems.join("; "));
    }

    fn check_reconciliation(&self, report: &mut PartitionReport, rows: &mut [FeatureRow]) {
        let mut mismatched = 0u64;
        for row in rows.iter_mut() {
            let cex_vs_dex = match (row.dex_mid, row.cex_mid) {
                (Some(d), Some(c)) => bps_apart(d, c) > self.cfg.reconciliation_tolerance_bps,
                _ => false,
            };
            let swap_vs_pool = match (row.swap_last_price, row.dex_mid) {
                (Some(s), Some(d)) => bps_apart(s, d) > self.cfg.swap_tolerance_bps,
                _ => false,
            };
            if cex_vs_dex || swap_vs_pool {
                mismatched += 1;
                row.quality_flags.set(QualityFlags::RECONCILIATION_MISMATCH);
            }
        }
        report.record_issue(IssueKind::ReconciliationMismatch, mismatched);
        let detail = if mismatched > 0 { format!("{} rows beyond tolerance", mismatched) } else { String::new() };
        report.record_check(CheckKind::Reconciliation, mismatched == 0, detail);
    }
}

fn bps_apart(a: f64, b: f64) -> f64 {
    1e4 * (a / b).ln().abs()
}

/// Names of the fields of `row` outside their documented domain.
pub fn range_violations(row: &FeatureRow, max_abs_wedge_bps: f64) -> Vec<&'static str> {
    let mut bad = Vec::new();

    let positive = [
        ("dex_mid", row.dex_mid),
        ("cex_mid", row.cex_mid),
        ("cex_bid", row.cex_bid),
        ("cex_ask", row.cex_ask),
        ("swap_last_price", row.swap_last_price),
        ("eth_usd", row.eth_usd),
    ];
    for (name, v) in positive {
        if let Some(x) = v {
            if !(x.is_finite() && x > 0.0) {
                bad.push(name);
            }
        }
    }

    let non_negative = [
        ("fee_tier_bps", Some(row.fee_tier_bps)),
        ("swap_turnover_usd", Some(row.swap_turnover_usd)),
        ("depth_usd", row.depth_usd),
        ("cex_spread_bps", row.cex_spread_bps),
        ("taker_fee_bps", row.taker_fee_bps),
        ("gas_base_fee_gwei", row.gas_base_fee_gwei),
        ("effective_gas_gwei", row.effective_gas_gwei),
        ("gas_usd", row.gas_usd),
        ("gas_cost_bps", row.gas_cost_bps),
        ("dex_fee_bps", row.dex_fee_bps),
        ("impact_cost_bps", row.impact_cost_bps),
        ("cex_cost_bps", row.cex_cost_bps),
        ("mev_cost_bps", row.mev_cost_bps),
        ("band_bps", row.band_bps),
        ("violation_magnitude_bps", row.violation_magnitude_bps),
        ("realized_vol", row.realized_vol),
    ];
    for (name, v) in non_negative {
        if let Some(x) = v {
            if !(x.is_finite() && x >= 0.0) {
                bad.push(name);
            }
        }
    }

    let unit = [
        ("congestion_pct", row.congestion_pct),
        ("source_coverage_score", Some(row.source_coverage_score)),
    ];
    for (name, v) in unit {
        if let Some(x) = v {
            if !(0.0..=1.0).contains(&x) {
                bad.push(name);
            }
        }
    }

    if let Some(w) = row.wedge_bps {
        if !(w.is_finite() && w.abs() <= max_abs_wedge_bps) {
            bad.push("wedge_bps");
        }
    }
    if let (Some(b), Some(a)) = (row.cex_bid, row.cex_ask) {
        if b > a {
            bad.push("cex_bid");
        }
    }
    if row.dex_staleness_min.map_or(false, |s| s < 0) {
        bad.push("dex_staleness_min");
    }
    if row.cex_staleness_min.map_or(false, |s| s < 0) {
        bad.push("cex_staleness_min");
    }
    bad
}
