//! Validation Harness
//!
//! Release gate for generated labels. Accuracy is computed over the entities
//! present in BOTH the generated and the reference label sets; entities only
//! one side knows about are neither penalized nor rewarded.
//!
//! # Audit Order
//!
//! ```text
//! 1. false_negative  (generated renew, reference churn)
//! 2. false_positive  (generated churn, reference renew)
//!    within a type: |days_to_renewal - boundary| ascending, no renewal last,
//!                   then entity id
//! ```
//!
//! The audit is written whenever a destination is given, pass or fail.

use crate::churn::artifacts::{write_atomic, write_rows};
use crate::churn::error::PipelineError;
use crate::churn::event_store::{load_reference_labels, SourceIngest};
use crate::churn::events::EntityId;
use crate::churn::labeler::{ChurnLabel, DEFAULT_GRACE_DAYS};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{error, info, warn};

/// Default minimum label accuracy.
pub const DEFAULT_MIN_ACCURACY: f64 = 0.99;

// =============================================================================
// REFERENCE LABELS
// =============================================================================

/// Externally supplied `{msno, is_churn}` labels.
#[derive(Debug, Clone, Default)]
pub struct ReferenceLabels {
    labels: BTreeMap<EntityId, bool>,
    ingest: Option<SourceIngest>,
}

impl ReferenceLabels {
    /// Duplicate ids keep the last row.
    pub fn new<I: IntoIterator<Item = (EntityId, bool)>>(labels: I) -> Self {
        Self {
            labels: labels.into_iter().collect(),
            ingest: None,
        }
    }

    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let (rows, ingest) = load_reference_labels(path)?;
        let mut labels = Self::new(rows);
        if labels.labels.len() as u64 != ingest.rows_kept {
            warn!(
                path = %path.display(),
                rows = ingest.rows_kept,
                distinct = labels.labels.len(),
                "duplicate reference labels, last row wins"
            );
        }
        labels.ingest = Some(ingest);
        Ok(labels)
    }

    pub fn get(&self, entity_id: &str) -> Option<bool> {
        self.labels.get(entity_id).copied()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn ingest(&self) -> Option<&SourceIngest> {
        self.ingest.as_ref()
    }
}

// =============================================================================
// MISMATCHES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MismatchType {
    /// Generated says renew, reference says churn.
    FalseNegative,
    /// Generated says churn, reference says renew.
    FalsePositive,
}

impl MismatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FalseNegative => "false_negative",
            Self::FalsePositive => "false_positive",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MismatchRecord {
    pub entity_id: EntityId,
    pub last_expiration_date: NaiveDate,
    pub next_renewal_date: Option<NaiveDate>,
    pub days_to_renewal: Option<i64>,
    pub generated: bool,
    pub reference: bool,
    pub mismatch_type: MismatchType,
}

impl MismatchRecord {
    fn from_label(label: &ChurnLabel, reference: bool) -> Self {
        Self {
            entity_id: label.entity_id.clone(),
            last_expiration_date: label.last_expiration_date,
            next_renewal_date: label.next_renewal_date,
            days_to_renewal: label.days_to_renewal,
            generated: label.is_churn,
            reference,
            mismatch_type: if label.is_churn {
                MismatchType::FalsePositive
            } else {
                MismatchType::FalseNegative
            },
        }
    }

    /// Distance from the grace boundary; `None` when there was no renewal.
    pub fn boundary_distance(&self, boundary_days: i64) -> Option<i64> {
        self.days_to_renewal.map(|d| (d - boundary_days).abs())
    }
}

/// One `label_mismatches.csv` row.
#[derive(Debug, Serialize)]
struct AuditRow<'a> {
    msno: &'a str,
    last_expire_date: String,
    next_txn_date: String,
    days_to_next: Option<i64>,
    generated_label: u8,
    reference_label: u8,
    mismatch_type: &'static str,
}

impl<'a> From<&'a MismatchRecord> for AuditRow<'a> {
    fn from(m: &'a MismatchRecord) -> Self {
        Self {
            msno: &m.entity_id,
            last_expire_date: m.last_expiration_date.format("%Y%m%d").to_string(),
            next_txn_date: m
                .next_renewal_date
                .map(|d| d.format("%Y%m%d").to_string())
                .unwrap_or_default(),
            days_to_next: m.days_to_renewal,
            generated_label: u8::from(m.generated),
            reference_label: u8::from(m.reference),
            mismatch_type: m.mismatch_type.as_str(),
        }
    }
}

// =============================================================================
// HARNESS
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub accuracy: f64,
    pub comparable: usize,
    pub generated: usize,
    pub reference: usize,
    /// Sorted in audit order.
    pub mismatches: Vec<MismatchRecord>,
}

impl ValidationReport {
    pub fn passes(&self, min_accuracy: f64) -> bool {
        self.accuracy >= min_accuracy
    }

    pub fn count(&self, kind: MismatchType) -> usize {
        self.mismatches
            .iter()
            .filter(|m| m.mismatch_type == kind)
            .count()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ValidationHarness {
    pub min_accuracy: f64,
    /// Grace period the audit is ordered around.
    pub boundary_days: i64,
    /// Cap on audit rows written; the report keeps every mismatch.
    pub max_audit_rows: Option<usize>,
}

impl Default for ValidationHarness {
    fn default() -> Self {
        Self {
            min_accuracy: DEFAULT_MIN_ACCURACY,
            boundary_days: DEFAULT_GRACE_DAYS,
            max_audit_rows: None,
        }
    }
}

impl ValidationHarness {
    pub fn new(min_accuracy: f64) -> Self {
        Self {
            min_accuracy,
            ..Default::default()
        }
    }

    /// Compare generated labels with the reference set.
    pub fn evaluate<'a, I>(
        &self,
        generated: I,
        reference: &ReferenceLabels,
    ) -> Result<ValidationReport, PipelineError>
    where
        I: IntoIterator<Item = &'a ChurnLabel>,
    {
        let mut generated_count = 0usize;
        let mut comparable = 0usize;
        let mut mismatches = Vec::new();

        for label in generated {
            generated_count += 1;
            let Some(expected) = reference.get(&label.entity_id) else {
                continue;
            };
            comparable += 1;
            if expected != label.is_churn {
                mismatches.push(MismatchRecord::from_label(label, expected));
            }
        }

        if comparable == 0 {
            return Err(PipelineError::NoComparableLabels {
                generated: generated_count,
                reference: reference.len(),
            });
        }

        let boundary = self.boundary_days;
        mismatches.sort_by(|a, b| {
            a.mismatch_type
                .cmp(&b.mismatch_type)
                .then_with(|| {
                    // None sorts after every distance.
                    match (a.boundary_distance(boundary), b.boundary_distance(boundary)) {
                        (Some(x), Some(y)) => x.cmp(&y),
                        (Some(_), None) => std::cmp::Ordering::Less,
                        (None, Some(_)) => std::cmp::Ordering::Greater,
                        (None, None) => std::cmp::Ordering::Equal,
                    }
                })
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });

        let accuracy = (comparable - mismatches.len()) as f64 / comparable as f64;
        Ok(ValidationReport {
            accuracy,
            comparable,
            generated: generated_count,
            reference: reference.len(),
            mismatches,
        })
    }

    /// Write the mismatch audit, honoring `max_audit_rows`.
    pub fn write_audit(&self, report: &ValidationReport, path: &Path) -> Result<(), PipelineError> {
        let limit = self.max_audit_rows.unwrap_or(usize::MAX);
        let rows: Vec<AuditRow> = report.mismatches.iter().take(limit).map(AuditRow::from).collect();
        if rows.len() < report.mismatches.len() {
            warn!(
                written = rows.len(),
                total = report.mismatches.len(),
                "mismatch audit truncated"
            );
        }
        if rows.is_empty() {
            // Header-only file so consumers always find the audit.
            let header = "msno,last_expire_date,next_txn_date,days_to_next,generated_label,reference_label,mismatch_type\n";
            write_atomic(path, header.as_bytes())?;
        } else {
            write_rows(path, &rows)?;
        }
        info!(path = %path.display(), mismatches = report.mismatches.len(), "wrote mismatch audit");
        Ok(())
    }

    /// Evaluate, write the audit when `audit_path` is given, then apply the
    /// accuracy gate.
    pub fn certify<'a, I>(
        &self,
        generated: I,
        reference: &ReferenceLabels,
        audit_path: Option<&Path>,
    ) -> Result<ValidationReport, PipelineError>
    where
        I: IntoIterator<Item = &'a ChurnLabel>,
    {
        let report = self.evaluate(generated, reference)?;
        if let Some(path) = audit_path {
            self.write_audit(&report, path)?;
        }

        info!(
            accuracy = report.accuracy,
            comparable = report.comparable,
            false_negatives = report.count(MismatchType::FalseNegative),
            false_positives = report.count(MismatchType::FalsePositive),
            "label validation"
        );

        if !report.passes(self.min_accuracy) {
            error!(
                accuracy = report.accuracy,
                threshold = self.min_accuracy,
                audit = ?audit_path.map(|p| p.display().to_string()),
                "label accuracy gate failed"
            );
            return Err(PipelineError::AccuracyGateFailure {
                accuracy: report.accuracy,
                threshold: self.min_accuracy,
                comparable: report.comparable,
                mismatches: report.mismatches.len(),
                audit_path: audit_path.map(Path::to_path_buf),
            });
        }
        Ok(report)
    }
}

