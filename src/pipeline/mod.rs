//! Basis-Band Feature Pipeline
//!
//! Batch pipeline turning raw DEX, CEX and gas events into a minute-level,
//! per-pool feature table with versioned, auditable snapshots.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ SourceAdapter│──▶│  Normalizer  │──▶│ MinuteAligner│──▶│   Feature    │
//! │ (raw events) │   │ (canonical)  │   │ (1 bar/min)  │   │ Constructor  │
//! └──────────────┘   └──────────────┘   └──────────────┘   └──────┬───────┘
//!                                                                 │
//!                    ┌──────────────┐   ┌──────────────┐          ▼
//!                    │ SnapshotStore│◀──│  Revision &  │◀──┌──────────────┐
//!                    │   (SQLite)   │   │Freeze Manager│   │  Validation  │
//!                    └──────┬───────┘   └──────────────┘   └──────────────┘
//!                           │
//!                           ▼
//!          export / basis spread / estimator (read-only)
//! ```
//!
//! # Guarantees
//!
//! - Missing inputs propagate as nulls with quality flags, never defaults.
//! - Rerunning a partition on unchanged inputs writes nothing.
//! - Frozen partitions are immutable; corrections are new versions.
//! - A failed or cancelled run publishes nothing it had not finished.

pub mod aligner;
pub mod basis;
pub mod clock;
pub mod config;
pub mod congestion;
pub mod error;
pub mod events;
pub mod export;
pub mod features;
pub mod fingerprint;
pub mod normalize;
pub mod revision;
pub mod robustness;
pub mod runner;
pub mod sources;
pub mod store;
pub mod validation;

// Re-exports for convenience
pub use aligner::{coverage, AlignStats, FrozenRanges, MinuteAligner, MinuteBar};
pub use basis::{basis_pair, basis_spread, basis_spread_view, BasisSpreadRow};
pub use clock::{MinuteGrid, Nanos, TimeRange, NANOS_PER_MIN};
pub use config::{CostBandConfig, OutputMode, PipelineConfig, PoolConfig, SourceMode};
pub use error::{ErrorClass, IssueKind, PipelineError, PipelineResult};
pub use events::{CanonicalPayload, CanonicalRecord, OrderingKey, RawEvent, SourceDomain};
pub use export::{export_snapshots, ExportMetadata, ExportRequest, ExportView};
pub use features::{FeatureConstructor, FeatureRow, MinuteInputs, PoolFeatureState, QualityFlags};
pub use revision::{ApplyOutcome, PartitionState, RevisionManager};
pub use robustness::{robustness_view, RobustnessConfig};
pub use runner::{CancelToken, PipelineRunner};
pub use sources::{build_source, LandedJsonSource, MemorySource, SourceAdapter, SyntheticSource};
pub use store::{RevisionRecord, RunMetadata, RunStatus, SnapshotInfo, SnapshotStatus, SnapshotStore};
pub use validation::{PartitionReport, RunReport, ValidationEngine};
