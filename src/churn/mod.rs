//! Churn Evaluation Pipeline
//!
//! Leak-safe churn labels, point-in-time features, rolling-window backtests,
//! drift monitoring and label certification for subscription event data.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     BacktestOrchestrator                        │
//! │  (ordered WindowSpecs, bounded pool, atomic per-window writes)  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                │
//!        ┌───────────────────────┼───────────────────────┐
//!        ▼                       ▼                       ▼
//! ┌─────────────┐        ┌──────────────┐        ┌─────────────┐
//! │ ChurnLabeler│        │FeatureWindow │        │  Scorer     │
//! │ (grace rule)│        │Builder       │        │  (trait)    │
//! └──────┬──────┘        └──────┬───────┘        └──────┬──────┘
//!        │                      │                       │
//!        └──────────┬───────────┘                       ▼
//!                   ▼                            ┌─────────────┐
//! ┌─────────────────────────────────────┐        │  Metrics    │
//! │             EventStore              │        │ (logloss,   │
//! │  per-entity arenas sorted by        │        │  AUC, ECE)  │
//! │  (event_date, ingest seq)           │        └─────────────┘
//! └─────────────────────────────────────┘
//!
//!   artifacts ──> DriftMonitor (PSI vs reference window)
//!   labels    ──> ValidationHarness (accuracy gate + mismatch audit)
//! ```
//!
//! # Leak Safety
//!
//! - **Cutoff**: every aggregation goes through [`query::AggregationQuery`],
//!   which only admits events dated strictly before the cutoff
//! - **Provenance**: snapshots record the latest event per source;
//!   [`features::FeatureTable::verify_leak_safe`] checks them before any table
//!   leaves the builder
//! - **History block**: past labels use only transactions before the cutoff
//!   and only expiry months resolved before it

pub mod artifact_store;
pub mod artifacts;
pub mod context;
pub mod dates;
pub mod drift;
pub mod error;
pub mod event_store;
pub mod events;
pub mod features;
pub mod history;
pub mod labeler;
pub mod metrics;
pub mod orchestrator;
pub mod query;
pub mod scoring;
pub mod validation;
pub mod window;
#[cfg(test)]
mod orchestrator_tests;

// Re-exports for convenience
pub use artifact_store::{ArtifactLedger, LedgerOutcome};
pub use context::PipelineContext;
pub use dates::YearMonth;
pub use drift::{DriftKind, DriftMonitor, PsiReport, PsiRow};
pub use error::{
    PipelineError, EXIT_CONFIG_ERROR, EXIT_GATE_FAILURE, EXIT_LEAKAGE, EXIT_RUNTIME_ERROR,
};
pub use event_store::{EventStore, IngestReport, Population, SourcePaths};
pub use events::{EntityId, SourceKind};
pub use features::{FeatureSnapshot, FeatureTable, FeatureValue, FeatureWindowBuilder};
pub use labeler::{ChurnLabel, ChurnLabeler, DecisionPath, LabelTable, LabelTarget};
pub use metrics::EvaluationRow;
pub use orchestrator::{BacktestOrchestrator, BacktestSummary, WindowOutcome, WindowReport};
pub use query::Cutoff;
pub use scoring::{LinearScorer, Scorer};
pub use validation::{MismatchType, ReferenceLabels, ValidationHarness, ValidationReport};
pub use window::{ArtifactLayout, WindowSpec};
