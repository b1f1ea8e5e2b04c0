//! Pipeline Runner
//!
//! Drives one run over a window of UTC dates.
//!
//! ```text
//! for each date (reprocess window, then requested window):
//!     fetch ─▶ normalize            (once per date, all pools)
//!     for each pool, in parallel:
//!         align ─▶ features ─▶ validate ─▶ apply (stage + publish)
//! freeze cadence ─▶ finalize run record
//! ```
//!
//! Dates run in order so each pool's rolling state carries from one
//! partition into the next. When a pool skips a date (frozen, or already
//! published by the failed run being resumed) its state is rebuilt from the
//! published history before the next partition.

use crate::pipeline::aligner::{coverage, AlignStats, FrozenRanges, MinuteAligner, MinuteBar};
use crate::pipeline::clock::{
    date_range, datetime_to_nanos, day_bounds, MinuteGrid, Nanos, TimeRange,
};
use crate::pipeline::config::{PipelineConfig, PoolConfig};
use crate::pipeline::error::{IssueKind, PipelineError, PipelineResult};
use crate::pipeline::events::{CanonicalRecord, SourceDomain, GAS_VENUE};
use crate::pipeline::features::{FeatureConstructor, FeatureRow, PoolFeatureState};
use crate::pipeline::fingerprint::config_fingerprint;
use crate::pipeline::normalize::StreamNormalizer;
use crate::pipeline::revision::{reprocess_dates, ApplyOutcome, PartitionState, RevisionManager};
use crate::pipeline::sources::SourceAdapter;
use crate::pipeline::store::{RunMetadata, RunStatus, SnapshotStatus};
use crate::pipeline::validation::{PartitionReport, RunReport, ValidationEngine};
use chrono::{Duration, NaiveDate, Utc};
use rayon::prelude::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shared cancel flag, checked between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self, stage: &str) -> PipelineResult<()> {
        if self.is_cancelled() {
            return Err(PipelineError::Cancelled(format!("before {}", stage)));
        }
        Ok(())
    }
}

fn now_nanos() -> Nanos {
    datetime_to_nanos(&Utc::now())
}

/// What the runner does with one (pool, date).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartitionPlan {
    Process,
    SkipFrozen,
    SkipResumed,
    /// Reprocess-window date never published for this pool.
    SkipUnpublished,
}

/// Per-pool state carried between consecutive dates.
struct PoolCursor {
    last_date: Option<NaiveDate>,
    state: Option<PoolFeatureState>,
}

/// A computed and validated partition, not yet applied.
struct PreparedPartition {
    pool_key: String,
    report: PartitionReport,
    align: AlignStats,
    rows: Vec<FeatureRow>,
}

pub struct PipelineRunner {
    config: PipelineConfig,
    source: Arc<dyn SourceAdapter>,
    manager: Arc<RevisionManager>,
    cancel: CancelToken,
}

impl PipelineRunner {
    pub fn new(config: PipelineConfig, source: Arc<dyn SourceAdapter>, manager: Arc<RevisionManager>) -> Self {
        Self { config, source, manager, cancel: CancelToken::new() }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn manager(&self) -> &RevisionManager {
        &self.manager
    }

    /// Run the pipeline for `[start, end]`.
    ///
    /// Errors raised before the run record exists (bad config or window) are
    /// returned as `Err`. Fatal errors during the run finalize it as `failed`,
    /// discard its staging rows and come back inside the report.
    pub fn run(&self, start: NaiveDate, end: NaiveDate) -> PipelineResult<RunReport> {
        if end < start {
            return Err(PipelineError::Config(format!("window end {} before start {}", end, start)));
        }
        self.config.validate()?;
        let fingerprint = config_fingerprint(&self.config)?;
        let store = self.manager.store();

        let resumed_from = store.find_resumable_run(&fingerprint, start, end)?;
        let completed = match &resumed_from {
            Some(prev) => store.completed_partitions(prev)?,
            None => HashSet::new(),
        };

        let run_id = Uuid::new_v4().to_string();
        store.begin_run(&RunMetadata {
            run_id: run_id.clone(),
            started_at: now_nanos(),
            finished_at: None,
            config_fingerprint: fingerprint.clone(),
            window_start: start,
            window_end: end,
            output_mode: self.config.output_mode,
            status: RunStatus::Running,
            resumed_from: resumed_from.clone(),
        })?;
        info!(
            run_id = %run_id,
            start = %start,
            end = %end,
            fingerprint = %fingerprint,
            resumed_from = ?resumed_from,
            source = self.source.name(),
            "run started"
        );

        let mut report = RunReport::new(&run_id);
        let result = self.execute(&run_id, start, end, &completed, &mut report);

        if let Err(e) = &result {
            error!(run_id = %run_id, error = %e, "run failed");
            let discarded = store.discard_staging(&run_id)?;
            if discarded > 0 {
                warn!(run_id = %run_id, rows = discarded, "staging discarded");
            }
        }
        let status = report.finalize(result.as_ref().err(), self.config.validation.fail_on_warnings);
        let report_json = report.to_json()?;
        store.finish_run(&run_id, status, now_nanos(), Some(report_json.as_str()))?;

        info!(
            run_id = %run_id,
            status = status.as_str(),
            rows = report.rows_emitted,
            revisions = report.revision_count,
            published = report.partitions_published,
            "run finished"
        );
        Ok(report)
    }

    fn execute(
        &self,
        run_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        completed: &HashSet<(String, NaiveDate)>,
        report: &mut RunReport,
    ) -> PipelineResult<()> {
        let status = SnapshotStatus::from(self.config.output_mode);
        let strict = self.config.validation.fail_on_warnings;
        let reprocess = reprocess_dates(start, self.config.windows.reprocess_window_days);
        let window: HashSet<NaiveDate> = date_range(start, end).into_iter().collect();
        let dates: Vec<NaiveDate> = reprocess.into_iter().chain(date_range(start, end)).collect();

        let mut cursors: Vec<PoolCursor> = self
            .config
            .pools
            .iter()
            .map(|_| PoolCursor { last_date: None, state: None })
            .collect();

        for date in dates {
            self.cancel.check("fetch")?;

            let mut plans = Vec::with_capacity(self.config.pools.len());
            for pool in &self.config.pools {
                let plan = self.plan(pool, date, window.contains(&date), completed)?;
                match plan {
                    PartitionPlan::SkipFrozen => {
                        report.partitions_skipped_frozen += 1;
                        warn!(pool = %pool.pool_key, date = %date, "partition frozen, skipped");
                    }
                    PartitionPlan::SkipResumed => {
                        report.partitions_resumed += 1;
                        debug!(pool = %pool.pool_key, date = %date, "partition published by resumed run");
                    }
                    _ => {}
                }
                plans.push(plan);
            }
            if !plans.contains(&PartitionPlan::Process) {
                for cursor in cursors.iter_mut() {
                    cursor.state = None;
                }
                continue;
            }

            let rejected_before = report.rows_rejected;
            let records = self.fetch_and_normalize(date, report)?;
            let rejected = report.rows_rejected - rejected_before;
            if strict && rejected > 0 {
                return Err(PipelineError::WarningsNotAllowed(format!(
                    "{} raw events rejected on {}",
                    rejected, date
                )));
            }
            let now = now_nanos();

            let prepared: Vec<PipelineResult<Option<PreparedPartition>>> = self
                .config
                .pools
                .par_iter()
                .zip(cursors.par_iter_mut())
                .zip(plans.par_iter())
                .map(|((pool, cursor), plan)| {
                    if *plan != PartitionPlan::Process {
                        cursor.state = None;
                        return Ok(None);
                    }
                    let contiguous = cursor.last_date == Some(date - Duration::days(1));
                    let carried = if contiguous { cursor.state.take() } else { None };
                    let mut state = match carried {
                        Some(s) => s,
                        None => self.warm_start(&pool.pool_key, date)?,
                    };
                    let partition = self.prepare_partition(pool, date, &records, &mut state)?;
                    cursor.state = Some(state);
                    cursor.last_date = Some(date);
                    Ok(Some(partition))
                })
                .collect();
            let prepared: Vec<PreparedPartition> =
                prepared.into_iter().filter_map(Result::transpose).collect::<PipelineResult<_>>()?;

            // Nothing for this date is published if any pool raised a warning.
            if strict {
                for p in &prepared {
                    let warnings = p.report.warnings();
                    if !warnings.is_empty() {
                        return Err(PipelineError::WarningsNotAllowed(format!(
                            "{}/{}: {}",
                            p.pool_key,
                            date,
                            warnings.join("; ")
                        )));
                    }
                }
            }

            self.cancel.check("publish")?;
            for p in prepared {
                if p.align.out_of_order > 0 {
                    debug!(pool = %p.pool_key, date = %date, out_of_order = p.align.out_of_order, "out-of-order events aligned");
                }
                let (partition, published) = self.apply_partition(run_id, date, p, status, now)?;
                if published {
                    report.partitions_published += 1;
                } else {
                    report.partitions_unchanged += 1;
                }
                report.add_partition(partition);
            }
        }

        self.cancel.check("freeze")?;
        let frozen = self
            .manager
            .freeze_due(run_id, end, self.config.windows.freeze_after_days, now_nanos())?;
        report.partitions_frozen += frozen.len() as u64;
        Ok(())
    }

    fn plan(
        &self,
        pool: &PoolConfig,
        date: NaiveDate,
        in_window: bool,
        completed: &HashSet<(String, NaiveDate)>,
    ) -> PipelineResult<PartitionPlan> {
        let state = self.manager.partition_state(&pool.pool_key, date)?;
        Ok(match state {
            PartitionState::Frozen { .. } => PartitionPlan::SkipFrozen,
            _ if completed.contains(&(pool.pool_key.clone(), date)) => PartitionPlan::SkipResumed,
            PartitionState::Unprocessed if !in_window => PartitionPlan::SkipUnpublished,
            _ => PartitionPlan::Process,
        })
    }

    /// Fetch every domain for the date and normalize into canonical records.
    fn fetch_and_normalize(
        &self,
        date: NaiveDate,
        report: &mut RunReport,
    ) -> PipelineResult<BTreeMap<SourceDomain, Vec<CanonicalRecord>>> {
        let (start, end) = day_bounds(date);
        let mut normalizer = StreamNormalizer::new();
        let mut out = BTreeMap::new();
        for domain in SourceDomain::ALL {
            let raw = self
                .source
                .fetch(domain, start, end)
                .map_err(|e| PipelineError::Source(format!("{} {}: {:#}", domain, date, e)))?;
            self.cancel.check("normalize")?;
            out.insert(domain, normalizer.normalize_batch(&raw));
        }
        report.add_normalize_stats(normalizer.stats());
        debug!(date = %date, events = normalizer.stats().total_events, "date normalized");
        Ok(out)
    }

    /// Rebuild pool state from the published partitions before `date`.
    fn warm_start(&self, pool_key: &str, date: NaiveDate) -> PipelineResult<PoolFeatureState> {
        let w = &self.config.windows;
        let first = date - Duration::days(w.congestion_window_days as i64);
        let history = self
            .manager
            .store()
            .history_rows(pool_key, first, date - Duration::days(1))?;
        debug!(pool = %pool_key, date = %date, rows = history.len(), "warm start");
        Ok(PoolFeatureState::warm_start(
            w.congestion_window_days,
            w.realized_vol_window_minutes,
            &history,
        ))
    }

    /// Frozen partitions of this pool overlapping the date, as time ranges.
    fn frozen_ranges(&self, pool_key: &str, date: NaiveDate) -> PipelineResult<FrozenRanges> {
        let mut ranges = FrozenRanges::default();
        if self.manager.partition_state(pool_key, date)?.is_frozen() {
            let (start, end) = day_bounds(date);
            ranges.push(TimeRange::new(start, end));
        }
        Ok(ranges)
    }

    /// Align, build and validate one partition.
    fn prepare_partition(
        &self,
        pool: &PoolConfig,
        date: NaiveDate,
        records: &BTreeMap<SourceDomain, Vec<CanonicalRecord>>,
        state: &mut PoolFeatureState,
    ) -> PipelineResult<PreparedPartition> {
        let grid = MinuteGrid::for_day(date);
        let mut report = PartitionReport::new(&pool.pool_key, date);

        self.cancel.check("align")?;
        let frozen = self.frozen_ranges(&pool.pool_key, date)?;
        let mut align = AlignStats::default();
        let mut bars: BTreeMap<SourceDomain, Vec<MinuteBar>> = BTreeMap::new();
        for domain in SourceDomain::ALL {
            let venue = match domain {
                SourceDomain::DexPoolState | SourceDomain::DexSwap => pool.pool_key.as_str(),
                SourceDomain::CexQuote => pool.cex_symbol.as_str(),
                SourceDomain::GasFee => GAS_VENUE,
            };
            let mut aligner = MinuteAligner::new(domain, grid, frozen.clone());
            if let Some(recs) = records.get(&domain) {
                aligner.extend(recs.iter().filter(|r| r.venue_key == venue).cloned());
            }
            let stats = aligner.stats();
            align.accepted += stats.accepted;
            align.out_of_order += stats.out_of_order;
            align.rejected_frozen += stats.rejected_frozen;
            align.outside_grid += stats.outside_grid;

            let venue = venue.to_string();
            let domain_bars = aligner
                .finish(std::slice::from_ref(&venue))
                .remove(&venue)
                .unwrap_or_default();
            let cov = coverage(&domain_bars);
            if cov < self.config.validation.min_source_coverage {
                warn!(pool = %pool.pool_key, date = %date, domain = %domain, coverage = cov, "low source coverage");
            }
            report.coverage.insert(domain.as_str().to_string(), cov);
            bars.insert(domain, domain_bars);
        }

        self.cancel.check("features")?;
        let bars_of = |d: SourceDomain| bars.get(&d).map(Vec::as_slice).unwrap_or(&[]);
        let minutes: Vec<Nanos> = grid.minutes().collect();
        let mut rows = FeatureConstructor::new(&self.config.cost_band, pool).build_partition(
            state,
            &minutes,
            bars_of(SourceDomain::DexPoolState),
            bars_of(SourceDomain::DexSwap),
            bars_of(SourceDomain::CexQuote),
            bars_of(SourceDomain::GasFee),
        );

        self.cancel.check("validate")?;
        let last_events: Vec<(SourceDomain, Option<Nanos>)> = [SourceDomain::DexPoolState, SourceDomain::CexQuote, SourceDomain::GasFee]
            .into_iter()
            .map(|d| (d, bars_of(d).iter().rev().find_map(|b| b.last_event_ts)))
            .collect();
        ValidationEngine::new(&self.config.validation).validate_partition(&mut report, &grid, &mut rows, &last_events)?;
        report.record_issue(IssueKind::LateEventRejected, align.rejected_frozen);

        Ok(PreparedPartition { pool_key: pool.pool_key.clone(), report, align, rows })
    }

    /// Stage and publish a prepared partition. Returns its report and
    /// whether a new version was written.
    fn apply_partition(
        &self,
        run_id: &str,
        date: NaiveDate,
        prepared: PreparedPartition,
        status: SnapshotStatus,
        now: Nanos,
    ) -> PipelineResult<(PartitionReport, bool)> {
        let PreparedPartition { pool_key, mut report, rows, .. } = prepared;
        let outcome = self.manager.apply(run_id, &pool_key, date, rows, status, now)?;
        report.revisions = outcome.revisions() as u64;
        report.published_version = Some(outcome.snapshot().version);
        let published = matches!(outcome, ApplyOutcome::Published { .. });

        info!(
            pool = %pool_key,
            date = %date,
            version = outcome.snapshot().version,
            status = outcome.snapshot().status.as_str(),
            revisions = report.revisions,
            published,
            "partition applied"
        );
        Ok((report, published))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::clock::NANOS_PER_MIN;
    use crate::pipeline::events::{OrderingKey, RawEvent};
    use crate::pipeline::sources::{MemorySource, SyntheticSource};
    use serde_json::json;
    use crate::pipeline::store::SnapshotStore;
    use std::sync::atomic::AtomicUsize;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn config() -> PipelineConfig {
        let mut cfg = PipelineConfig::default();
        cfg.windows.freeze_after_days = 0;
        cfg
    }

    fn runner(cfg: PipelineConfig, source: Arc<dyn SourceAdapter>) -> PipelineRunner {
        let manager = Arc::new(RevisionManager::new(SnapshotStore::in_memory().unwrap()));
        PipelineRunner::new(cfg, source, manager)
    }

    /// Cancels the token once `after` fetches have been served.
    struct CancellingSource {
        inner: SyntheticSource,
        token: CancelToken,
        after: usize,
        served: AtomicUsize,
    }

    impl SourceAdapter for CancellingSource {
        fn name(&self) -> &str {
            "cancelling"
        }

        fn fetch(&self, domain: SourceDomain, start: Nanos, end: Nanos) -> anyhow::Result<Vec<RawEvent>> {
            if self.served.fetch_add(1, Ordering::SeqCst) + 1 >= self.after {
                self.token.cancel();
            }
            self.inner.fetch(domain, start, end)
        }
    }

    #[test]
    fn test_run_publishes_every_partition() {
        let cfg = config();
        let source = Arc::new(SyntheticSource::new(cfg.synthetic_seed, cfg.pools.clone()));
        let r = runner(cfg, source);
        let report = r.run(d(1), d(2)).unwrap();

        assert_ne!(report.status, RunStatus::Failed);
        assert_eq!(report.partitions_published, 4);
        assert_eq!(report.rows_emitted, 4 * 1440);
        assert_eq!(report.revision_count, 0);
        let run = r.manager().store().get_run(&report.run_id).unwrap().unwrap();
        assert!(run.status.is_terminal());
        assert!(r.manager().store().run_report_json(&report.run_id).unwrap().is_some());
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let cfg = config();
        let source = Arc::new(SyntheticSource::new(cfg.synthetic_seed, cfg.pools.clone()));
        let r = runner(cfg, source);
        r.run(d(1), d(2)).unwrap();
        let before = r.manager().store().current_rows("univ3_weth_usdc_5", d(2)).unwrap().unwrap();

        let again = r.run(d(1), d(2)).unwrap();
        assert_eq!(again.partitions_published, 0);
        assert_eq!(again.partitions_unchanged, 4);
        assert_eq!(again.revision_count, 0);

        let after = r.manager().store().current_rows("univ3_weth_usdc_5", d(2)).unwrap().unwrap();
        assert_eq!(before.0.snapshot_id, after.0.snapshot_id);
        assert_eq!(before.1, after.1);
    }

    #[test]
    fn test_frozen_partitions_are_skipped() {
        let mut cfg = config();
        cfg.output_mode = crate::pipeline::config::OutputMode::Frozen;
        let source = Arc::new(SyntheticSource::new(cfg.synthetic_seed, cfg.pools.clone()));
        let r = runner(cfg, source);
        r.run(d(1), d(1)).unwrap();

        let again = r.run(d(1), d(1)).unwrap();
        assert_eq!(again.partitions_skipped_frozen, 2);
        assert_eq!(again.partitions_published, 0);
        assert_eq!(r.manager().store().snapshot_versions("univ3_weth_usdc_5", d(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_cancelled_run_fails_then_resumes() {
        let cfg = config();
        let token = CancelToken::new();
        let source = Arc::new(CancellingSource {
            inner: SyntheticSource::new(cfg.synthetic_seed, cfg.pools.clone()),
            token: token.clone(),
            // First date is four fetches; the first fetch of the second date cancels.
            after: 5,
            served: AtomicUsize::new(0),
        });
        let manager = Arc::new(RevisionManager::new(SnapshotStore::in_memory().unwrap()));
        let r = PipelineRunner::new(cfg.clone(), source, manager.clone()).with_cancel_token(token);

        let failed = r.run(d(1), d(2)).unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert!(failed.fatal_error.as_deref().unwrap_or("").contains("cancelled"));
        assert_eq!(manager.store().staged_row_count(&failed.run_id).unwrap(), 0);
        assert!(manager.store().latest_snapshot("univ3_weth_usdc_5", d(1)).unwrap().is_some());
        assert!(manager.store().latest_snapshot("univ3_weth_usdc_5", d(2)).unwrap().is_none());

        let source = Arc::new(SyntheticSource::new(cfg.synthetic_seed, cfg.pools.clone()));
        let retry = PipelineRunner::new(cfg, source, manager.clone()).run(d(1), d(2)).unwrap();
        assert_ne!(retry.status, RunStatus::Failed);
        assert_eq!(retry.partitions_resumed, 2);
        assert_eq!(retry.partitions_published, 2);
        let run = manager.store().get_run(&retry.run_id).unwrap().unwrap();
        assert_eq!(run.resumed_from.as_deref(), Some(failed.run_id.as_str()));
    }

    #[test]
    fn test_missing_sources_yield_rows_with_warnings() {
        let cfg = config();
        let r = runner(cfg, Arc::new(MemorySource::default()));
        let report = r.run(d(1), d(1)).unwrap();

        assert_eq!(report.status, RunStatus::SucceededWithWarnings);
        assert_eq!(report.rows_emitted, 2 * 1440);
        assert!(report.issue_count(IssueKind::MissingSourceData) > 0);
        let (_, rows) = r.manager().store().current_rows("univ3_weth_usdc_5", d(1)).unwrap().unwrap();
        assert!(rows.iter().all(|r| r.row.dex_mid.is_none() && r.row.wedge_bps.is_none()));
        assert_eq!(rows[1].row.minute_ts - rows[0].row.minute_ts, NANOS_PER_MIN);
    }

    #[test]
    fn test_fail_on_warnings_publishes_nothing() {
        let mut cfg = config();
        cfg.validation.fail_on_warnings = true;
        let r = runner(cfg, Arc::new(MemorySource::default()));
        let report = r.run(d(1), d(1)).unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.fatal_error.as_deref().unwrap_or("").contains("Warnings are fatal"));
        assert_eq!(report.rows_emitted, 0);
        assert_eq!(r.manager().store().staged_row_count(&report.run_id).unwrap(), 0);
        assert!(r.manager().store().latest_snapshot("univ3_weth_usdc_5", d(1)).unwrap().is_none());
        assert!(r.manager().store().latest_snapshot("univ3_weth_usdc_30", d(1)).unwrap().is_none());
    }

    fn pool_state(ts: Nanos, payload: serde_json::Value) -> RawEvent {
        RawEvent {
            source_id: "pool".into(),
            domain: SourceDomain::DexPoolState,
            event_ts: ts,
            ordering: OrderingKey::new(ts as u64, 0),
            venue: Some("univ3_weth_usdc_5".into()),
            payload,
        }
    }

    fn non_finite_source() -> Arc<MemorySource> {
        let t = day_bounds(d(1)).0 + 5 * NANOS_PER_MIN;
        Arc::new(MemorySource::new(vec![
            pool_state(t, json!({ "mid": 3000.0, "fee_tier_bps": 5.0 })),
            pool_state(t + NANOS_PER_MIN, json!({ "mid": 3001.0, "fee_tier_bps": "inf" })),
            pool_state(t + 2 * NANOS_PER_MIN, json!({ "mid": 3002.0, "depth_usd": "1e400" })),
        ]))
    }

    #[test]
    fn test_non_finite_amounts_are_rejected_and_run_publishes() {
        let r = runner(config(), non_finite_source());
        let report = r.run(d(1), d(1)).unwrap();

        assert_ne!(report.status, RunStatus::Failed, "{:?}", report.fatal_error);
        assert_eq!(report.rows_rejected, 2);
        assert_eq!(report.reject_reasons.get("non_finite"), Some(&2));
        assert_eq!(report.issue_count(IssueKind::RejectedEvent), 2);
        let (_, rows) = r.manager().store().current_rows("univ3_weth_usdc_5", d(1)).unwrap().unwrap();
        assert_eq!(rows.len(), 1440);
        assert!(rows.iter().all(|r| r.row.fee_tier_bps.is_finite()));
    }

    #[test]
    fn test_rejected_events_are_fatal_under_fail_on_warnings() {
        let mut cfg = config();
        cfg.validation.fail_on_warnings = true;
        let r = runner(cfg, non_finite_source());
        let report = r.run(d(1), d(1)).unwrap();

        assert_eq!(report.status, RunStatus::Failed);
        assert!(report.fatal_error.as_deref().unwrap_or("").contains("raw events rejected"));
        assert!(r.manager().store().latest_snapshot("univ3_weth_usdc_5", d(1)).unwrap().is_none());
    }

    #[test]
    fn test_inverted_window_is_rejected() {
        let cfg = config();
        let r = runner(cfg, Arc::new(MemorySource::default()));
        assert!(matches!(r.run(d(2), d(1)), Err(PipelineError::Config(_))));
    }
}
