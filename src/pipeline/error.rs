//! Pipeline Error Taxonomy
//!
//! Two tiers:
//! - [`PipelineError`]: fatal errors that abort a run before anything is published,
//!   plus storage/IO failures and rejected writes to frozen partitions.
//! - [`IssueKind`]: non-fatal conditions. Rows are kept, the condition is flagged
//!   on the row and aggregated into the run report.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Fatal and write-path errors.
#[derive(Debug)]
pub enum PipelineError {
    /// Required field missing or mistyped, or primary key not unique.
    Schema(String),
    /// Attempt to mutate a frozen partition.
    RevisionConflict { pool: String, date: NaiveDate, reason: String },
    /// Configuration failed validation.
    Config(String),
    /// Source adapter failed to deliver events.
    Source(String),
    /// Run was cancelled between stages.
    Cancelled(String),
    /// A warning was raised while `fail_on_warnings` is set.
    WarningsNotAllowed(String),
    /// Illegal state transition (run status or partition lifecycle).
    InvalidTransition(String),
    NotFound(String),
    Sqlite(rusqlite::Error),
    Serialization(serde_json::Error),
    Io(std::io::Error),
    Toml(toml::de::Error),
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Schema(_) => ErrorClass::Schema,
            Self::RevisionConflict { .. } => ErrorClass::RevisionConflict,
            Self::WarningsNotAllowed(_) => ErrorClass::StrictValidation,
            _ => ErrorClass::Infrastructure,
        }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Schema(msg) => write!(f, "Schema error: {}", msg),
            Self::RevisionConflict { pool, date, reason } => {
                write!(f, "Revision conflict on frozen partition {}/{}: {}", pool, date, reason)
            }
            Self::Config(msg) => write!(f, "Invalid configuration: {}", msg),
            Self::Source(msg) => write!(f, "Source error: {}", msg),
            Self::Cancelled(msg) => write!(f, "Run cancelled: {}", msg),
            Self::WarningsNotAllowed(msg) => write!(f, "Warnings are fatal for this run: {}", msg),
            Self::InvalidTransition(msg) => write!(f, "Invalid transition: {}", msg),
            Self::NotFound(what) => write!(f, "Not found: {}", what),
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
            Self::Serialization(e) => write!(f, "Serialization error: {}", e),
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Toml(e) => write!(f, "TOML error: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<toml::de::Error> for PipelineError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml(e)
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

// =============================================================================
// ERROR CLASSES
// =============================================================================

/// Error classes as seen by the run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Schema,
    RangeViolation,
    MissingSourceData,
    ReconciliationMismatch,
    RevisionConflict,
    NumericalInstability,
    /// Late events for frozen minutes and raw events that failed normalization.
    RejectedInput,
    /// Non-fatal issue escalated by `fail_on_warnings`.
    StrictValidation,
    Infrastructure,
}

impl ErrorClass {
    /// Fatal classes stop the run and leave prior snapshots untouched.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Schema | Self::RevisionConflict | Self::StrictValidation | Self::Infrastructure
        )
    }
}

/// Non-fatal conditions aggregated into the run report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    RangeViolation,
    MissingSourceData,
    ReconciliationMismatch,
    NumericalInstability,
    /// Event arrived for a minute that is already frozen.
    LateEventRejected,
    /// Raw event failed normalization and was dropped.
    RejectedEvent,
    DistributionShift,
    StaleData,
}

impl IssueKind {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RangeViolation | Self::DistributionShift => ErrorClass::RangeViolation,
            Self::MissingSourceData | Self::StaleData => ErrorClass::MissingSourceData,
            Self::ReconciliationMismatch => ErrorClass::ReconciliationMismatch,
            Self::NumericalInstability => ErrorClass::NumericalInstability,
            Self::LateEventRejected | Self::RejectedEvent => ErrorClass::RejectedInput,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RangeViolation => "range_violation",
            Self::MissingSourceData => "missing_source_data",
            Self::ReconciliationMismatch => "reconciliation_mismatch",
            Self::NumericalInstability => "numerical_instability",
            Self::LateEventRejected => "late_event_rejected",
            Self::RejectedEvent => "rejected_event",
            Self::DistributionShift => "distribution_shift",
            Self::StaleData => "stale_data",
        }
    }
}

impl std::fmt::Display for IssueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classes() {
        assert!(ErrorClass::Schema.is_fatal());
        assert!(ErrorClass::RevisionConflict.is_fatal());
        assert!(!ErrorClass::RangeViolation.is_fatal());
        assert!(!ErrorClass::MissingSourceData.is_fatal());
        assert!(!ErrorClass::ReconciliationMismatch.is_fatal());
        assert!(!ErrorClass::NumericalInstability.is_fatal());
        assert!(!ErrorClass::RejectedInput.is_fatal());
        assert!(ErrorClass::StrictValidation.is_fatal());
        assert_eq!(
            PipelineError::WarningsNotAllowed("x".into()).class(),
            ErrorClass::StrictValidation
        );
    }

    #[test]
    fn test_late_event_rejection_is_not_fatal_issue() {
        assert!(!IssueKind::LateEventRejected.class().is_fatal());
        assert_eq!(IssueKind::LateEventRejected.as_str(), "late_event_rejected");
        let err = PipelineError::Schema("missing column".into());
        assert_eq!(err.class(), ErrorClass::Schema);
        assert!(err.to_string().contains("missing column"));
    }
}
