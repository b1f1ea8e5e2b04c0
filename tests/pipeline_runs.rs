//! End-to-end pipeline runs against in-memory, landed and on-disk stores.
//!
//! 1. Trailing-window reprocessing records exactly one revision for an altered minute
//! 2. Frozen partitions reject writes and late events
//! 3. Reruns on unchanged data write nothing, across store reopen
//! 4. Landed raw files reproduce the synthetic run bit for bit
//! 5. The estimator reads published rows without touching them
//! 6. The cross-pool basis spread joins both pools' published rows

use basisband_backend::estimator::{estimate_pool, EstimateStatus};
use basisband_backend::pipeline::basis::{basis_pair, basis_spread_view};
use basisband_backend::pipeline::clock::{day_bounds, day_start, NANOS_PER_MIN, NANOS_PER_SEC};
use basisband_backend::pipeline::config::{OutputMode, PipelineConfig, PoolConfig, SourceMode};
use basisband_backend::pipeline::error::PipelineError;
use basisband_backend::pipeline::events::{OrderingKey, RawEvent, SourceDomain, GAS_VENUE};
use basisband_backend::pipeline::revision::RevisionManager;
use basisband_backend::pipeline::runner::PipelineRunner;
use basisband_backend::pipeline::sources::{build_source, LandedJsonSource, MemorySource, SourceAdapter, SyntheticSource};
use basisband_backend::pipeline::store::{RunStatus, SnapshotStatus, SnapshotStore};
use chrono::NaiveDate;
use serde_json::json;
use std::sync::Arc;

const POOL: &str = "univ3_weth_usdc_5";

fn d(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
}

fn config() -> PipelineConfig {
    let mut cfg = PipelineConfig::default();
    cfg.pools = vec![PoolConfig { pool_key: POOL.into(), fee_tier_bps: 5.0, cex_symbol: "ETHUSDT".into() }];
    cfg.windows.freeze_after_days = 0;
    cfg
}

/// Synthetic events for `[first, last]` loaded into an appendable source.
fn memory_source(cfg: &PipelineConfig, first: NaiveDate, last: NaiveDate) -> Arc<MemorySource> {
    let synthetic = SyntheticSource::new(cfg.synthetic_seed, cfg.pools.clone());
    let (start, _) = day_bounds(first);
    let (_, end) = day_bounds(last);
    let events: Vec<RawEvent> = SourceDomain::ALL
        .iter()
        .flat_map(|domain| synthetic.fetch(*domain, start, end).unwrap())
        .collect();
    Arc::new(MemorySource::new(events))
}

fn manager() -> Arc<RevisionManager> {
    Arc::new(RevisionManager::new(SnapshotStore::in_memory().unwrap()))
}

fn late_gas(minute_ts: i64, base_fee_gwei: f64) -> RawEvent {
    RawEvent {
        source_id: "late_gas".into(),
        domain: SourceDomain::GasFee,
        event_ts: minute_ts + 59 * NANOS_PER_SEC,
        ordering: OrderingKey::new(u64::MAX / 2, 0),
        venue: Some(GAS_VENUE.into()),
        payload: json!({ "base_fee_wei": base_fee_gwei * 1e9, "priority_fee_wei": 1e9 }),
    }
}

// =============================================================================
// TEST 1: TRAILING-WINDOW REPROCESSING
// =============================================================================

#[test]
fn test_trailing_reprocess_revises_only_altered_minute_inside_window() {
    let cfg = config();
    let source = memory_source(&cfg, d(1), d(5));
    let manager = manager();
    let runner = PipelineRunner::new(cfg.clone(), source.clone(), manager.clone());

    let first = runner.run(d(1), d(4)).unwrap();
    assert_ne!(first.status, RunStatus::Failed);
    assert_eq!(first.revision_count, 0);

    // A late, larger gas print for 12:00 on day 3.
    let altered = day_start(d(3)) + 720 * NANOS_PER_MIN;
    let before = manager.store().current_rows(POOL, d(3)).unwrap().unwrap();
    let old_row = before.1.iter().find(|r| r.row.minute_ts == altered).unwrap().row.clone();
    source.push(late_gas(altered, 400.0));

    // Window 5..5 with a 3-day reprocess window touches days 2, 3 and 4.
    let second = runner.run(d(5), d(5)).unwrap();
    assert_ne!(second.status, RunStatus::Failed);
    assert!(second.revision_count >= 1);

    let revisions = manager.store().revisions(POOL, d(3)).unwrap();
    let for_minute: Vec<_> = revisions.iter().filter(|r| r.minute_ts == altered).collect();
    assert_eq!(for_minute.len(), 1);
    assert!(for_minute[0].changed_fields.contains(&"gas_usd".to_string()));
    assert_eq!(for_minute[0].run_id, second.run_id);

    let (info, rows) = manager.store().current_rows(POOL, d(3)).unwrap().unwrap();
    assert_eq!(info.version, 2);
    assert_eq!(info.supersedes, Some(before.0.snapshot_id));
    let new_row = &rows.iter().find(|r| r.row.minute_ts == altered).unwrap().row;
    assert!(new_row.is_late_arrival_revision);
    assert!(new_row.gas_usd.unwrap() > old_row.gas_usd.unwrap());
    // Minutes before the altered one are carried over unchanged.
    let earlier = rows.iter().find(|r| r.row.minute_ts == altered - NANOS_PER_MIN).unwrap();
    assert!(!earlier.row.is_late_arrival_revision);
    assert_eq!(earlier, before.1.iter().find(|r| r.row.minute_ts == altered - NANOS_PER_MIN).unwrap());

    // Day 1 is outside the window, day 2 precedes the change: one version each.
    assert_eq!(manager.store().snapshot_versions(POOL, d(1)).unwrap().len(), 1);
    assert_eq!(manager.store().snapshot_versions(POOL, d(2)).unwrap().len(), 1);
    assert!(manager.store().revisions(POOL, d(1)).unwrap().is_empty());
    assert!(manager.store().revisions(POOL, d(2)).unwrap().is_empty());
}

// =============================================================================
// TEST 2: IMMUTABILITY OF FROZEN PARTITIONS
// =============================================================================

#[test]
fn test_frozen_partition_rejects_writes_and_late_events() {
    let mut frozen_cfg = config();
    frozen_cfg.output_mode = OutputMode::Frozen;
    let source = memory_source(&frozen_cfg, d(1), d(1));
    let manager = manager();

    PipelineRunner::new(frozen_cfg, source.clone(), manager.clone()).run(d(1), d(1)).unwrap();
    let (frozen, frozen_rows) = manager.store().current_rows(POOL, d(1)).unwrap().unwrap();
    assert_eq!(frozen.status, SnapshotStatus::Frozen);

    source.push(late_gas(day_start(d(1)) + 30 * NANOS_PER_MIN, 400.0));
    let report = PipelineRunner::new(config(), source, manager.clone()).run(d(1), d(1)).unwrap();
    assert_eq!(report.partitions_skipped_frozen, 1);
    assert_eq!(report.partitions_published, 0);

    let mut altered: Vec<_> = frozen_rows.iter().map(|r| r.row.clone()).collect();
    altered[30].gas_usd = Some(999.0);
    let err = manager
        .apply("direct", POOL, d(1), altered.clone(), SnapshotStatus::Provisional, 0)
        .unwrap_err();
    assert!(matches!(err, PipelineError::RevisionConflict { .. }));

    let (after, after_rows) = manager.store().current_rows(POOL, d(1)).unwrap().unwrap();
    assert_eq!(after.snapshot_id, frozen.snapshot_id);
    assert_eq!(after_rows, frozen_rows);

    // A correction is a new frozen version; the old one stays readable.
    let corrected = manager.correct_frozen("correction", POOL, d(1), altered, 0).unwrap();
    assert_eq!(corrected.version, 2);
    assert_eq!(corrected.status, SnapshotStatus::Frozen);
    assert_eq!(corrected.supersedes, Some(frozen.snapshot_id));
    assert_eq!(manager.store().snapshot_rows(frozen.snapshot_id).unwrap(), frozen_rows);
}

// =============================================================================
// TEST 3: IDEMPOTENCE ACROSS STORE REOPEN
// =============================================================================

#[test]
fn test_rerun_on_reopened_store_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("features.db");
    let cfg = config();
    let source = memory_source(&cfg, d(1), d(2));

    let first = {
        let manager = Arc::new(RevisionManager::new(SnapshotStore::new(&path).unwrap()));
        PipelineRunner::new(cfg.clone(), source.clone(), manager.clone()).run(d(1), d(2)).unwrap();
        manager.store().current_rows(POOL, d(2)).unwrap().unwrap()
    };

    let manager = Arc::new(RevisionManager::new(SnapshotStore::new(&path).unwrap()));
    let report = PipelineRunner::new(cfg, source, manager.clone()).run(d(1), d(2)).unwrap();
    assert_eq!(report.partitions_published, 0);
    assert_eq!(report.partitions_unchanged, 2);
    assert_eq!(report.revision_count, 0);
    assert_eq!(manager.store().revision_count_for_run(&report.run_id).unwrap(), 0);

    let again = manager.store().current_rows(POOL, d(2)).unwrap().unwrap();
    assert_eq!(again.0.snapshot_id, first.0.snapshot_id);
    assert_eq!(again.1, first.1);
    assert_eq!(manager.store().stats().unwrap().runs, 2);
}

// =============================================================================
// TEST 4: LANDED RAW FILES
// =============================================================================

#[test]
fn test_landed_source_matches_synthetic_run() {
    let raw = tempfile::tempdir().unwrap();
    let synthetic_cfg = config();
    let synthetic = SyntheticSource::new(synthetic_cfg.synthetic_seed, synthetic_cfg.pools.clone());
    let landed = LandedJsonSource::new(raw.path());
    let (start, end) = day_bounds(d(1));
    for domain in SourceDomain::ALL {
        landed.land(&synthetic.fetch(domain, start, end).unwrap()).unwrap();
    }

    let mut landed_cfg = config();
    landed_cfg.source_mode = SourceMode::Landed;
    landed_cfg.raw_dir = raw.path().to_path_buf();

    let a = manager();
    let b = manager();
    PipelineRunner::new(synthetic_cfg.clone(), build_source(&synthetic_cfg, None).unwrap(), a.clone())
        .run(d(1), d(1))
        .unwrap();
    PipelineRunner::new(landed_cfg.clone(), build_source(&landed_cfg, None).unwrap(), b.clone())
        .run(d(1), d(1))
        .unwrap();

    let sa = a.store().latest_snapshot(POOL, d(1)).unwrap().unwrap();
    let sb = b.store().latest_snapshot(POOL, d(1)).unwrap().unwrap();
    assert_eq!(sa.content_hash, sb.content_hash);
    assert_eq!(sa.row_count, 1440);
}

// =============================================================================
// TEST 5: ESTIMATION OVER PUBLISHED ROWS
// =============================================================================

#[test]
fn test_estimator_over_published_rows() {
    let cfg = config();
    let manager = manager();
    PipelineRunner::new(cfg.clone(), memory_source(&cfg, d(1), d(1)), manager.clone())
        .run(d(1), d(1))
        .unwrap();
    let rows = manager.store().history_rows(POOL, d(1), d(1)).unwrap();
    let snapshot = rows.clone();

    let estimate = estimate_pool(POOL, &rows, &cfg.filter, true);
    assert_eq!(rows, snapshot);
    assert_eq!(estimate.filtered.len(), 1440);
    assert_eq!(estimate.smoothed.as_ref().map(Vec::len), Some(1440));
    assert!(estimate.stats.filtered > 1000);

    for (state, row) in estimate.filtered.iter().zip(&rows) {
        if state.status == EstimateStatus::Filtered {
            let px = state.efficient_price().unwrap();
            let cex = row.cex_mid.or(row.dex_mid).unwrap();
            assert!((px / cex - 1.0).abs() < 0.01, "efficient price {} far from {}", px, cex);
        }
    }
}

// =============================================================================
// TEST 6: CROSS-POOL BASIS SPREAD
// =============================================================================

#[test]
fn test_basis_spread_over_both_default_pools() {
    let mut cfg = PipelineConfig::default();
    cfg.windows.freeze_after_days = 0;
    let manager = manager();
    PipelineRunner::new(cfg.clone(), memory_source(&cfg, d(1), d(1)), manager.clone())
        .run(d(1), d(1))
        .unwrap();

    let (narrow, wide) = basis_pair(&cfg).unwrap();
    assert_eq!(narrow.pool_key, "univ3_weth_usdc_5");
    assert_eq!(wide.pool_key, "univ3_weth_usdc_30");

    let view = basis_spread_view(manager.store(), narrow, wide, d(1), d(1)).unwrap();
    assert_eq!(view.len(), 1440);
    let narrow_rows = manager.store().history_rows(&narrow.pool_key, d(1), d(1)).unwrap();
    let wide_rows = manager.store().history_rows(&wide.pool_key, d(1), d(1)).unwrap();
    for ((v, n), w) in view.iter().zip(&narrow_rows).zip(&wide_rows) {
        assert_eq!(v.minute_ts, n.minute_ts);
        match (n.wedge_bps, w.wedge_bps) {
            (Some(a), Some(b)) => assert!((v.basis_spread_bps.unwrap() - (b - a)).abs() < 1e-12),
            _ => assert!(v.basis_spread_bps.is_none()),
        }
    }
    assert!(view.iter().any(|v| v.basis_spread_bps.is_some()));
}
