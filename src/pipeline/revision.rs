//! Revision & Freeze Manager
//!
//! Owns every write to the snapshot store.
//!
//! # Partition lifecycle
//!
//! ```text
//! unprocessed ──publish──▶ provisional ──(recomputed while inside the
//!                               │          trailing reprocess window)
//!                               └──freeze──▶ frozen  (terminal)
//! ```
//!
//! - A recomputed provisional partition gets a new version only if some row
//!   changed. Changed rows carry `is_late_arrival_revision = true` and one
//!   [`RevisionRecord`] each. Unchanged rows are carried over bit-for-bit.
//! - Frozen partitions are never written in place. A correction is a new
//!   frozen version that supersedes the old one.
//! - Recompute and freeze on the same partition are mutually exclusive; other
//!   partitions proceed independently.

use crate::pipeline::clock::Nanos;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::features::FeatureRow;
use crate::pipeline::fingerprint::{changed_fields, content_hash, row_hash};
use crate::pipeline::store::{
    PublishRequest, RevisionRecord, SnapshotInfo, SnapshotStatus, SnapshotStore, StoredRow,
};
use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum PartitionState {
    Unprocessed,
    Provisional { version: u32 },
    Frozen { version: u32 },
}

impl PartitionState {
    pub fn is_frozen(&self) -> bool {
        matches!(self, Self::Frozen { .. })
    }
}

/// Result of handing a recomputed partition to the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// A new version was published.
    Published { snapshot: SnapshotInfo, revisions: usize },
    /// Content matched the current version; nothing was written.
    Unchanged { snapshot: SnapshotInfo },
}

impl ApplyOutcome {
    pub fn snapshot(&self) -> &SnapshotInfo {
        match self {
            Self::Published { snapshot, .. } | Self::Unchanged { snapshot } => snapshot,
        }
    }

    pub fn revisions(&self) -> usize {
        match self {
            Self::Published { revisions, .. } => *revisions,
            Self::Unchanged { .. } => 0,
        }
    }
}

type PartitionKey = (String, NaiveDate);

pub struct RevisionManager {
    store: SnapshotStore,
    locks: Mutex<HashMap<PartitionKey, Arc<Mutex<()>>>>,
}

impl RevisionManager {
    pub fn new(store: SnapshotStore) -> Self {
        Self { store, locks: Mutex::new(HashMap::new()) }
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    fn partition_lock(&self, pool_key: &str, date: NaiveDate) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry((pool_key.to_string(), date))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn partition_state(&self, pool_key: &str, date: NaiveDate) -> PipelineResult<PartitionState> {
        Ok(match self.store.latest_snapshot(pool_key, date)? {
            None => PartitionState::Unprocessed,
            Some(s) if s.status == SnapshotStatus::Frozen => PartitionState::Frozen { version: s.version },
            Some(s) => PartitionState::Provisional { version: s.version },
        })
    }

    /// Compare a recomputed partition against its current version and publish
    /// a new version if anything changed.
    ///
    /// `rows` must be in minute order. With `status = Frozen` the partition is
    /// published (or frozen) as frozen even when unchanged.
    pub fn apply(
        &self,
        run_id: &str,
        pool_key: &str,
        date: NaiveDate,
        mut rows: Vec<FeatureRow>,
        status: SnapshotStatus,
        now: Nanos,
    ) -> PipelineResult<ApplyOutcome> {
        let lock = self.partition_lock(pool_key, date);
        let _guard = lock.lock();

        let current = self.store.current_rows(pool_key, date)?;
        if let Some((info, _)) = &current {
            if info.status == SnapshotStatus::Frozen {
                warn!(pool = %pool_key, date = %date, version = info.version, "write to frozen partition rejected");
                return Err(PipelineError::RevisionConflict {
                    pool: pool_key.to_string(),
                    date,
                    reason: format!("version {} is frozen", info.version),
                });
            }
        }

        let mut stored = Vec::with_capacity(rows.len());
        let mut revisions = Vec::new();
        let previous: HashMap<Nanos, &StoredRow> = current
            .as_ref()
            .map(|(_, prev)| prev.iter().map(|r| (r.row.minute_ts, r)).collect())
            .unwrap_or_default();

        for mut row in rows.drain(..) {
            row.is_late_arrival_revision = false;
            let hash = row_hash(&row)?;
            if let (Some((info, _)), Some(old)) = (&current, previous.get(&row.minute_ts)) {
                if old.row_hash == hash {
                    row.is_late_arrival_revision = old.row.is_late_arrival_revision;
                } else {
                    row.is_late_arrival_revision = true;
                    revisions.push(RevisionRecord {
                        run_id: run_id.to_string(),
                        pool_key: pool_key.to_string(),
                        partition_date: date,
                        minute_ts: row.minute_ts,
                        old_snapshot_id: info.snapshot_id,
                        new_snapshot_id: None,
                        old_row_hash: old.row_hash.clone(),
                        new_row_hash: hash.clone(),
                        changed_fields: changed_fields(&old.row, &row)?,
                        revised_at: now,
                    });
                }
            }
            stored.push(StoredRow { row, row_hash: hash });
        }

        let new_hash = content_hash(stored.iter().map(|r| r.row_hash.as_str()));
        if let Some((info, _)) = &current {
            if info.content_hash == new_hash {
                let snapshot = if status == SnapshotStatus::Frozen {
                    self.store.freeze(pool_key, date, run_id, now)?
                } else {
                    info.clone()
                };
                self.store.mark_complete(run_id, pool_key, date, Some(snapshot.snapshot_id), now)?;
                debug!(pool = %pool_key, date = %date, "partition unchanged");
                return Ok(ApplyOutcome::Unchanged { snapshot });
            }
        }

        self.store.stage_rows(run_id, pool_key, date, &stored)?;
        let snapshot = self.store.publish_staged(&PublishRequest {
            run_id,
            pool_key,
            date,
            status,
            content_hash: &new_hash,
            revisions: &revisions,
            created_at: now,
        })?;
        if !revisions.is_empty() {
            info!(pool = %pool_key, date = %date, revisions = revisions.len(), "late-arrival revisions recorded");
        }
        Ok(ApplyOutcome::Published { snapshot, revisions: revisions.len() })
    }

    /// Freeze the current provisional version of a partition.
    pub fn freeze(&self, run_id: &str, pool_key: &str, date: NaiveDate, now: Nanos) -> PipelineResult<SnapshotInfo> {
        let lock = self.partition_lock(pool_key, date);
        let _guard = lock.lock();
        self.store.freeze(pool_key, date, run_id, now)
    }

    /// Freeze every provisional partition dated `freeze_after_days` or more before `as_of`.
    pub fn freeze_due(
        &self,
        run_id: &str,
        as_of: NaiveDate,
        freeze_after_days: u32,
        now: Nanos,
    ) -> PipelineResult<Vec<SnapshotInfo>> {
        if freeze_after_days == 0 {
            return Ok(Vec::new());
        }
        let cutoff = as_of - chrono::Duration::days(freeze_after_days as i64);
        let mut frozen = Vec::new();
        for p in self.store.current_partitions()? {
            if p.status == SnapshotStatus::Provisional && p.partition_date <= cutoff {
                frozen.push(self.freeze(run_id, &p.pool_key, p.partition_date, now)?);
            }
        }
        if !frozen.is_empty() {
            info!(count = frozen.len(), cutoff = %cutoff, "freeze cadence applied");
        }
        Ok(frozen)
    }

    /// Publish corrected rows for a frozen partition as a new frozen version.
    pub fn correct_frozen(
        &self,
        run_id: &str,
        pool_key: &str,
        date: NaiveDate,
        rows: Vec<FeatureRow>,
        now: Nanos,
    ) -> PipelineResult<SnapshotInfo> {
        let lock = self.partition_lock(pool_key, date);
        let _guard = lock.lock();

        match self.store.latest_snapshot(pool_key, date)? {
            Some(s) if s.status == SnapshotStatus::Frozen => {}
            _ => {
                return Err(PipelineError::InvalidTransition(format!(
                    "{}/{} is not frozen; corrections apply to frozen partitions only",
                    pool_key, date
                )))
            }
        }
        let stored = rows
            .into_iter()
            .map(|row| Ok(StoredRow { row_hash: row_hash(&row)?, row }))
            .collect::<PipelineResult<Vec<_>>>()?;
        let hash = content_hash(stored.iter().map(|r| r.row_hash.as_str()));
        self.store.stage_rows(run_id, pool_key, date, &stored)?;
        self.store.publish_staged(&PublishRequest {
            run_id,
            pool_key,
            date,
            status: SnapshotStatus::Frozen,
            content_hash: &hash,
            revisions: &[],
            created_at: now,
        })
    }
}

/// Provisional dates to recompute ahead of `start`: the `days` dates before it.
pub fn reprocess_dates(start: NaiveDate, days: u32) -> Vec<NaiveDate> {
    (1..=days as i64).rev().map(|d| start - chrono::Duration::days(d)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::clock::{day_start, NANOS_PER_MIN};
    use crate::pipeline::config::{CostBandConfig, PoolConfig};
    use crate::pipeline::features::{FeatureConstructor, MinuteInputs, PoolFeatureState};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn rows(gas: &[f64]) -> Vec<FeatureRow> {
        let cost = CostBandConfig::default();
        let pool = PoolConfig { pool_key: "p".into(), fee_tier_bps: 5.0, cex_symbol: "X".into() };
        let fc = FeatureConstructor::new(&cost, &pool);
        let mut state = PoolFeatureState::new(30, 30);
        gas.iter()
            .enumerate()
            .map(|(i, g)| {
                let mut row = fc.build_row(&mut state, day_start(date()) + i as i64 * NANOS_PER_MIN, MinuteInputs::default());
                row.gas_usd = Some(*g);
                row
            })
            .collect()
    }

    fn manager() -> RevisionManager {
        RevisionManager::new(SnapshotStore::in_memory().unwrap())
    }

    #[test]
    fn test_first_publish_then_idempotent_rerun() {
        let m = manager();
        assert_eq!(m.partition_state("p", date()).unwrap(), PartitionState::Unprocessed);

        let first = m.apply("r1", "p", date(), rows(&[1.0, 2.0]), SnapshotStatus::Provisional, 1).unwrap();
        assert!(matches!(first, ApplyOutcome::Published { revisions: 0, .. }));
        assert_eq!(m.partition_state("p", date()).unwrap(), PartitionState::Provisional { version: 1 });

        let again = m.apply("r2", "p", date(), rows(&[1.0, 2.0]), SnapshotStatus::Provisional, 2).unwrap();
        assert!(matches!(again, ApplyOutcome::Unchanged { .. }));
        assert_eq!(again.snapshot().snapshot_id, first.snapshot().snapshot_id);
        assert!(m.store().revisions("p", date()).unwrap().is_empty());
    }

    #[test]
    fn test_changed_row_flagged_with_one_revision() {
        let m = manager();
        m.apply("r1", "p", date(), rows(&[1.0, 2.0, 3.0]), SnapshotStatus::Provisional, 1).unwrap();
        let out = m.apply("r2", "p", date(), rows(&[1.0, 2.5, 3.0]), SnapshotStatus::Provisional, 2).unwrap();
        assert_eq!(out.revisions(), 1);

        let (info, stored) = m.store().current_rows("p", date()).unwrap().unwrap();
        assert_eq!(info.version, 2);
        let flags: Vec<bool> = stored.iter().map(|r| r.row.is_late_arrival_revision).collect();
        assert_eq!(flags, vec![false, true, false]);

        let revs = m.store().revisions("p", date()).unwrap();
        assert_eq!(revs.len(), 1);
        assert_eq!(revs[0].minute_ts, stored[1].row.minute_ts);
        assert_eq!(revs[0].changed_fields, vec!["gas_usd".to_string()]);
        assert_eq!(revs[0].new_snapshot_id, Some(info.snapshot_id));

        // Re-running the revised inputs keeps the flag and writes nothing.
        let again = m.apply("r3", "p", date(), rows(&[1.0, 2.5, 3.0]), SnapshotStatus::Provisional, 3).unwrap();
        assert!(matches!(again, ApplyOutcome::Unchanged { .. }));
        assert_eq!(m.store().revisions("p", date()).unwrap().len(), 1);
    }

    #[test]
    fn test_frozen_partition_rejects_recompute() {
        let m = manager();
        m.apply("r1", "p", date(), rows(&[1.0]), SnapshotStatus::Provisional, 1).unwrap();
        m.freeze("r1", "p", date(), 2).unwrap();
        assert!(m.partition_state("p", date()).unwrap().is_frozen());

        let err = m.apply("r2", "p", date(), rows(&[9.0]), SnapshotStatus::Provisional, 3).unwrap_err();
        assert!(matches!(err, PipelineError::RevisionConflict { .. }));
        let (_, kept) = m.store().current_rows("p", date()).unwrap().unwrap();
        assert_eq!(kept[0].row.gas_usd, Some(1.0));
    }

    #[test]
    fn test_correction_supersedes_frozen_version() {
        let m = manager();
        m.apply("r1", "p", date(), rows(&[1.0]), SnapshotStatus::Provisional, 1).unwrap();
        let frozen = m.freeze("r1", "p", date(), 2).unwrap();
        let fixed = m.correct_frozen("fix", "p", date(), rows(&[1.5]), 3).unwrap();
        assert_eq!(fixed.status, SnapshotStatus::Frozen);
        assert_eq!(fixed.supersedes, Some(frozen.snapshot_id));
        assert_eq!(fixed.version, frozen.version + 1);
    }

    #[test]
    fn test_freeze_due_respects_cutoff() {
        let m = manager();
        let old = date();
        let recent = date() + chrono::Duration::days(6);
        m.apply("r1", "p", old, rows(&[1.0]), SnapshotStatus::Provisional, 1).unwrap();
        let recent_rows: Vec<FeatureRow> = rows(&[1.0])
            .into_iter()
            .map(|mut r| {
                r.minute_ts = day_start(recent);
                r
            })
            .collect();
        m.apply("r1", "p", recent, recent_rows, SnapshotStatus::Provisional, 1).unwrap();

        let frozen = m.freeze_due("r2", date() + chrono::Duration::days(8), 7, 5).unwrap();
        assert_eq!(frozen.len(), 1);
        assert_eq!(frozen[0].partition_date, old);
        assert!(!m.partition_state("p", recent).unwrap().is_frozen());
    }

    #[test]
    fn test_reprocess_dates() {
        let start = NaiveDate::from_ymd_opt(2024, 3, 6).unwrap();
        let dates = reprocess_dates(start, 3);
        assert_eq!(
            dates,
            vec![
                NaiveDate::from_ymd_opt(2024, 3, 3).unwrap(),
                NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
                NaiveDate::from_ymd_opt(2024, 3, 5).unwrap(),
            ]
        );
    }
}
