//! Pipeline Errors
//!
//! Closed error taxonomy for the churn pipeline. Row-level parse problems are
//! NOT represented here: they are recovered at ingestion and tallied in
//! [`IngestReport`](crate::churn::event_store::IngestReport).

use crate::churn::dates::YearMonth;
use crate::churn::events::{EntityId, SourceKind};
use chrono::NaiveDate;
use std::path::PathBuf;

/// Exit code: accuracy gate failed (or nothing comparable to gate on).
pub const EXIT_GATE_FAILURE: i32 = 1;
/// Exit code: configuration or usage error.
pub const EXIT_CONFIG_ERROR: i32 = 2;
/// Exit code: I/O or runtime failure.
pub const EXIT_RUNTIME_ERROR: i32 = 3;
/// Exit code: a feature aggregation used an event at/after its cutoff.
pub const EXIT_LEAKAGE: i32 = 4;

/// Errors that terminate a pipeline step.
#[derive(Debug)]
pub enum PipelineError {
    /// A required input file does not exist.
    MissingSource { kind: SourceKind, path: PathBuf },
    /// An input file exists but lacks a required column.
    MissingColumn {
        kind: SourceKind,
        column: String,
        path: PathBuf,
    },
    /// A feature snapshot was built from an event at or after its cutoff.
    LeakageViolation {
        entity_id: EntityId,
        source: SourceKind,
        event_date: NaiveDate,
        cutoff: NaiveDate,
    },
    /// Generated labels disagree with the reference beyond the allowed floor.
    AccuracyGateFailure {
        accuracy: f64,
        threshold: f64,
        comparable: usize,
        mismatches: usize,
        audit_path: Option<PathBuf>,
    },
    /// A gate was configured but no window of the run certified its month.
    GateNotEvaluated {
        expiry_month: YearMonth,
        reason: String,
    },
    /// Generated and reference labels share no entity.
    NoComparableLabels {
        generated: usize,
        reference: usize,
    },
    /// Every configured backtest window was skipped.
    NoWindowsProcessed {
        attempted: usize,
        skipped: Vec<String>,
    },
    /// A scorer returned unusable output.
    Scoring { model: String, reason: String },
    InvalidWindowSpec(String),
    Config(String),
    /// An artifact ledger row already exists for this run and window.
    ArtifactExists { run_id: String, window_tag: String },
    Io { path: PathBuf, source: std::io::Error },
    Csv(csv::Error),
    Json(serde_json::Error),
    Ledger(rusqlite::Error),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::AccuracyGateFailure { .. }
            | Self::NoComparableLabels { .. }
            | Self::GateNotEvaluated { .. } => EXIT_GATE_FAILURE,
            Self::InvalidWindowSpec(_) | Self::Config(_) => EXIT_CONFIG_ERROR,
            Self::LeakageViolation { .. } => EXIT_LEAKAGE,
            _ => EXIT_RUNTIME_ERROR,
        }
    }

    /// Whether a backtest window hitting this error is skipped rather than
    /// aborting the whole run.
    pub fn is_window_skippable(&self) -> bool {
        matches!(self, Self::MissingSource { .. })
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingSource { kind, path } => {
                write!(f, "missing {} source: {}", kind, path.display())
            }
            Self::MissingColumn { kind, column, path } => write!(
                f,
                "{} source {} has no '{}' column",
                kind,
                path.display(),
                column
            ),
            Self::LeakageViolation {
                entity_id,
                source,
                event_date,
                cutoff,
            } => write!(
                f,
                "leakage: entity {} used {} event dated {} for cutoff {}",
                entity_id, source, event_date, cutoff
            ),
            Self::AccuracyGateFailure {
                accuracy,
                threshold,
                comparable,
                mismatches,
                audit_path,
            } => {
                write!(
                    f,
                    "label accuracy {:.4} below required {:.4} ({} mismatches over {} comparable entities)",
                    accuracy, threshold, mismatches, comparable
                )?;
                if let Some(path) = audit_path {
                    write!(f, "; audit written to {}", path.display())?;
                }
                Ok(())
            }
            Self::GateNotEvaluated {
                expiry_month,
                reason,
            } => write!(
                f,
                "label gate for expiry month {} was not evaluated: {}",
                expiry_month, reason
            ),
            Self::NoComparableLabels {
                generated,
                reference,
            } => write!(
                f,
                "no comparable labels: {} generated and {} reference labels share no entity",
                generated, reference
            ),
            Self::NoWindowsProcessed { attempted, skipped } => write!(
                f,
                "no backtest window completed ({} attempted; skipped: {})",
                attempted,
                skipped.join(", ")
            ),
            Self::Scoring { model, reason } => write!(f, "scorer '{}' failed: {}", model, reason),
            Self::InvalidWindowSpec(msg) => write!(f, "invalid window spec: {}", msg),
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::ArtifactExists { run_id, window_tag } => write!(
                f,
                "artifact for window {} already recorded in run {}",
                window_tag, run_id
            ),
            Self::Io { path, source } => write!(f, "I/O error on {}: {}", path.display(), source),
            Self::Csv(e) => write!(f, "CSV error: {}", e),
            Self::Json(e) => write!(f, "JSON error: {}", e),
            Self::Ledger(e) => write!(f, "artifact ledger error: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Csv(e) => Some(e),
            Self::Json(e) => Some(e),
            Self::Ledger(e) => Some(e),
            _ => None,
        }
    }
}

impl From<csv::Error> for PipelineError {
    fn from(e: csv::Error) -> Self {
        Self::Csv(e)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Ledger(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_distinguish_gate_from_io() {
        let gate = PipelineError::AccuracyGateFailure {
            accuracy: 0.9,
            threshold: 0.99,
            comparable: 10,
            mismatches: 1,
            audit_path: None,
        };
        let io = PipelineError::io(
            "/tmp/x.csv",
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        );
        assert_eq!(gate.exit_code(), EXIT_GATE_FAILURE);
        assert_eq!(io.exit_code(), EXIT_RUNTIME_ERROR);
        assert_ne!(gate.exit_code(), io.exit_code());

        let not_run = PipelineError::GateNotEvaluated {
            expiry_month: "2017-03".parse().unwrap(),
            reason: "window skipped".into(),
        };
        assert_eq!(not_run.exit_code(), EXIT_GATE_FAILURE);
        assert!(not_run.to_string().contains("2017-03"));
    }

    #[test]
    fn test_only_missing_source_is_skippable() {
        let missing = PipelineError::MissingSource {
            kind: SourceKind::UsageLogs,
            path: PathBuf::from("logs.csv"),
        };
        assert!(missing.is_window_skippable());
        assert!(!PipelineError::Config("bad".into()).is_window_skippable());
    }

    #[test]
    fn test_gate_failure_message_points_to_audit() {
        let err = PipelineError::AccuracyGateFailure {
            accuracy: 0.6,
            threshold: 0.99,
            comparable: 5,
            mismatches: 2,
            audit_path: Some(PathBuf::from("eval/label_mismatches.csv")),
        };
        let msg = err.to_string();
        assert!(msg.contains("0.6000"));
        assert!(msg.contains("eval/label_mismatches.csv"));
    }
}
