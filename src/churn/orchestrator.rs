//! Backtest Orchestrator
//!
//! Runs labeling, feature building and scoring for an ordered list of
//! `cutoff:expiry` windows and persists each window's artifacts.
//!
//! # Per Window
//!
//! ```text
//! WindowSpec ─┬─> sources.resolve_for(cutoff, expiry) ─> EventStore (cached)
//!             ├─> FeatureWindowBuilder::build(cutoff)     features_<tag>.csv
//!             ├─> ChurnLabeler::label_window(expiry)      labels_<tag>.csv
//!             ├─> [gate: expiry == gate_expiry_month]     label_mismatches.csv
//!             ├─> Scorer::score(features)                 scores_<tag>_<model>.csv
//!             ├─> metrics over features ⋈ labels          backtests.csv
//!             └─> manifest (written last)                 window_<tag>.json
//! ```
//!
//! Windows share no mutable state and are computed on a bounded rayon pool.
//! A run has two phases:
//!
//! 1. **Compute**: every window is labelled, featurized, scored and (for the
//!    gate month) certified in memory. Nothing but the mismatch audit is
//!    written.
//! 2. **Publish**: only when every window either computed or was skipped for
//!    missing inputs, and a configured gate actually passed, are window
//!    artifacts and manifests written.
//!
//! A window whose inputs are missing is skipped with a warning; any other
//! failure aborts the run before anything is published. A run in which no
//! window completes is an error.

use crate::churn::artifact_store::LedgerOutcome;
use crate::churn::artifacts::{
    write_feature_table, write_label_table, write_manifest, write_rows, write_scores,
    WindowManifest,
};
use crate::churn::context::PipelineContext;
use crate::churn::dates::YearMonth;
use crate::churn::error::PipelineError;
use crate::churn::features::FeatureTable;
use crate::churn::labeler::LabelTable;
use crate::churn::metrics::{evaluate, EvaluationRow};
use crate::churn::scoring::score_checked;
use crate::churn::validation::{ReferenceLabels, ValidationReport};
use crate::churn::window::WindowSpec;
use rayon::prelude::*;
use std::collections::BTreeSet;
use tracing::{debug, error, info, warn};

/// Result of one completed window.
#[derive(Debug, Clone)]
pub struct WindowReport {
    pub window: WindowSpec,
    pub manifest: WindowManifest,
    pub evaluations: Vec<EvaluationRow>,
    pub ledger: Option<LedgerOutcome>,
    pub validation: Option<ValidationReport>,
}

#[derive(Debug, Clone)]
pub enum WindowOutcome {
    Completed(Box<WindowReport>),
    Skipped { window: WindowSpec, reason: String },
}

impl WindowOutcome {
    pub fn window(&self) -> &WindowSpec {
        match self {
            Self::Completed(report) => &report.window,
            Self::Skipped { window, .. } => window,
        }
    }
}

/// Outcome of a whole run, in configured window order.
#[derive(Debug, Clone)]
pub struct BacktestSummary {
    pub run_id: String,
    pub outcomes: Vec<WindowOutcome>,
}

impl BacktestSummary {
    pub fn completed(&self) -> impl Iterator<Item = &WindowReport> {
        self.outcomes.iter().filter_map(|o| match o {
            WindowOutcome::Completed(report) => Some(report.as_ref()),
            WindowOutcome::Skipped { .. } => None,
        })
    }

    pub fn skipped(&self) -> impl Iterator<Item = (&WindowSpec, &str)> {
        self.outcomes.iter().filter_map(|o| match o {
            WindowOutcome::Skipped { window, reason } => Some((window, reason.as_str())),
            WindowOutcome::Completed(_) => None,
        })
    }

    pub fn evaluations(&self) -> Vec<EvaluationRow> {
        self.completed()
            .flat_map(|r| r.evaluations.iter().cloned())
            .collect()
    }
}

/// A window computed in memory and not yet published.
#[derive(Debug, Clone)]
pub struct ComputedWindow {
    pub window: WindowSpec,
    pub features: FeatureTable,
    pub labels: LabelTable,
    pub evaluated_rows: usize,
    pub model_scores: Vec<(String, Vec<f64>)>,
    pub evaluations: Vec<EvaluationRow>,
    pub validation: Option<ValidationReport>,
}

enum Pending {
    Computed(Box<ComputedWindow>),
    Skipped { window: WindowSpec, reason: String },
}

pub struct BacktestOrchestrator<'a> {
    ctx: &'a PipelineContext,
}

impl<'a> BacktestOrchestrator<'a> {
    pub fn new(ctx: &'a PipelineContext) -> Self {
        Self { ctx }
    }

    /// Process `windows` and write the run-level `backtests.csv`.
    pub fn run(&self, windows: &[WindowSpec]) -> Result<BacktestSummary, PipelineError> {
        let gate = self.gate(windows)?;
        let threads = self.ctx.config().backtest.threads;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| PipelineError::Config(format!("thread pool: {}", e)))?;

        info!(
            run_id = %self.ctx.run_id(),
            windows = windows.len(),
            threads,
            gate = ?gate.map(|(month, _)| month.to_string()),
            "backtest started"
        );

        let results: Vec<(WindowSpec, Result<ComputedWindow, PipelineError>)> =
            pool.install(|| {
                windows
                    .par_iter()
                    .map(|w| (*w, self.compute_window(w)))
                    .collect()
            });

        let mut pending = Vec::with_capacity(results.len());
        for (window, result) in results {
            match result {
                Ok(computed) => pending.push(Pending::Computed(Box::new(computed))),
                Err(e) if e.is_window_skippable() => {
                    warn!(window = %window.tag(), error = %e, "window skipped");
                    pending.push(Pending::Skipped {
                        window,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    error!(window = %window.tag(), error = %e, "window failed, nothing published");
                    return Err(e);
                }
            }
        }

        let computed = pending
            .iter()
            .filter(|p| matches!(p, Pending::Computed(_)))
            .count();
        if computed == 0 {
            return Err(PipelineError::NoWindowsProcessed {
                attempted: windows.len(),
                skipped: pending
                    .iter()
                    .filter_map(|p| match p {
                        Pending::Skipped { window, .. } => Some(window.to_string()),
                        Pending::Computed(_) => None,
                    })
                    .collect(),
            });
        }
        if let Some((month, _)) = gate {
            Self::require_gate(month, &pending)?;
        }

        let outcomes: Vec<WindowOutcome> = pool.install(|| {
            pending
                .into_par_iter()
                .map(|p| match p {
                    Pending::Computed(computed) => self
                        .publish(*computed)
                        .map(|report| WindowOutcome::Completed(Box::new(report))),
                    Pending::Skipped { window, reason } => {
                        Ok(WindowOutcome::Skipped { window, reason })
                    }
                })
                .collect::<Result<Vec<_>, PipelineError>>()
        })?;

        let summary = BacktestSummary {
            run_id: self.ctx.run_id().to_string(),
            outcomes,
        };
        self.write_backtests(&summary)?;
        info!(
            run_id = %summary.run_id,
            completed = summary.completed().count(),
            skipped = summary.skipped().count(),
            "backtest finished"
        );
        Ok(summary)
    }

    /// The configured gate month and its reference labels, checked against
    /// the window list before any work starts.
    fn gate(
        &self,
        windows: &[WindowSpec],
    ) -> Result<Option<(YearMonth, &'a ReferenceLabels)>, PipelineError> {
        let Some(month) = self.ctx.config().validation.gate_expiry_month else {
            return Ok(None);
        };
        let reference = self.ctx.reference_labels().ok_or_else(|| {
            PipelineError::Config(format!(
                "gate_expiry_month {} is set but no reference labels are configured",
                month
            ))
        })?;
        if !windows.iter().any(|w| w.expiry_month == month) {
            return Err(PipelineError::Config(format!(
                "gate_expiry_month {} matches none of the backtest windows",
                month
            )));
        }
        Ok(Some((month, reference)))
    }

    /// Refuse to publish unless a computed window certified the gate month.
    fn require_gate(month: YearMonth, pending: &[Pending]) -> Result<(), PipelineError> {
        let certified = pending.iter().any(|p| {
            matches!(p, Pending::Computed(c) if c.window.expiry_month == month && c.validation.is_some())
        });
        if certified {
            return Ok(());
        }
        let reason = pending
            .iter()
            .find_map(|p| match p {
                Pending::Skipped { window, reason } if window.expiry_month == month => {
                    Some(format!("window {} skipped: {}", window, reason))
                }
                _ => None,
            })
            .unwrap_or_else(|| "no window certified it".to_string());
        error!(expiry_month = %month, reason = %reason, "label gate not evaluated");
        Err(PipelineError::GateNotEvaluated {
            expiry_month: month,
            reason,
        })
    }

    /// Merge this run's metrics into `backtests.csv`, replacing rows of the
    /// windows it completed and keeping rows of every other window.
    fn write_backtests(&self, summary: &BacktestSummary) -> Result<(), PipelineError> {
        let path = self.ctx.layout().backtests();
        let rerun: BTreeSet<String> = summary.completed().map(|r| r.window.tag()).collect();

        let mut rows: Vec<EvaluationRow> = Vec::new();
        if path.exists() {
            let mut reader = csv::Reader::from_path(&path)?;
            for row in reader.deserialize::<EvaluationRow>() {
                let row = row?;
                if !rerun.contains(&row.window) {
                    rows.push(row);
                }
            }
        }
        rows.extend(summary.evaluations());
        write_rows(&path, &rows)?;
        Ok(())
    }

    /// Label, featurize, certify and score one window without writing any
    /// window artifact. Only the mismatch audit of a gate window is written.
    pub fn compute_window(&self, window: &WindowSpec) -> Result<ComputedWindow, PipelineError> {
        let config = self.ctx.config();
        let tag = window.tag();
        info!(window = %tag, cutoff = %window.cutoff(), "window started");

        let paths = config
            .sources
            .resolve_for(window.cutoff_month, window.expiry_month);
        let store = self.ctx.store_for(&paths)?;

        let features = config
            .feature_builder()
            .build(&store, &store.population(), window.cutoff(), &tag)?;
        let labels = config
            .labeler()
            .label_window(&store, &window.label_target());

        let validation = match (config.validation.gate_expiry_month, self.ctx.reference_labels()) {
            (Some(gate), Some(reference)) if gate == window.expiry_month => {
                let report = config.validation_harness().certify(
                    labels.iter().map(|d| &d.label),
                    reference,
                    Some(self.ctx.layout().mismatches().as_path()),
                )?;
                Some(report)
            }
            _ => None,
        };

        // Evaluation set: feature rows that also carry a label.
        let joined: Vec<(usize, bool)> = features
            .snapshots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| labels.is_churn(&s.entity_id).map(|churn| (i, churn)))
            .collect();
        let outcomes: Vec<bool> = joined.iter().map(|(_, churn)| *churn).collect();

        let mut model_scores = Vec::with_capacity(self.ctx.scorers().len());
        let mut evaluations = Vec::new();
        for scorer in self.ctx.scorers() {
            let scores = score_checked(scorer.as_ref(), &features)?;
            let probabilities: Vec<f64> = joined.iter().map(|(i, _)| scores[*i]).collect();
            match evaluate(
                &tag,
                scorer.name(),
                &probabilities,
                &outcomes,
                config.metrics.ece_bins,
            ) {
                Some(row) => evaluations.push(row),
                None => warn!(window = %tag, model = %scorer.name(), "no labelled rows to evaluate"),
            }
            model_scores.push((scorer.name().to_string(), scores));
        }

        debug!(window = %tag, features = features.len(), labels = labels.len(), "window computed");
        Ok(ComputedWindow {
            window: *window,
            features,
            labels,
            evaluated_rows: joined.len(),
            model_scores,
            evaluations,
            validation,
        })
    }

    /// Write a computed window's artifacts, manifest last, then record it in
    /// the ledger.
    fn publish(&self, computed: ComputedWindow) -> Result<WindowReport, PipelineError> {
        let layout = self.ctx.layout();
        let ComputedWindow {
            window,
            features,
            labels,
            evaluated_rows,
            model_scores,
            evaluations,
            validation,
        } = computed;
        let tag = window.tag();

        let mut manifest = WindowManifest {
            run_id: self.ctx.run_id().to_string(),
            window,
            window_tag: tag.clone(),
            cutoff: window.cutoff().date(),
            expiry_month: window.expiry_month,
            created_at: chrono::Utc::now().to_rfc3339(),
            schema: features.schema.clone(),
            feature_rows: features.len(),
            label_rows: labels.len(),
            evaluated_rows,
            models: model_scores.iter().map(|(name, _)| name.clone()).collect(),
            artifacts: Default::default(),
        };
        manifest.record(&write_feature_table(&layout.features(&window), &features)?);
        manifest.record(&write_label_table(&layout.labels(&window), &labels)?);
        for (name, scores) in &model_scores {
            manifest.record(&write_scores(
                &layout.scores(&window, name),
                features.entity_ids(),
                scores,
            )?);
        }
        write_manifest(&layout.manifest(&window), &manifest)?;

        let ledger = match self.ctx.ledger() {
            Some(ledger) => Some(ledger.record(&manifest)?),
            None => None,
        };

        info!(
            window = %tag,
            features = manifest.feature_rows,
            labels = manifest.label_rows,
            evaluated = manifest.evaluated_rows,
            models = manifest.models.len(),
            "window complete"
        );
        Ok(WindowReport {
            window,
            manifest,
            evaluations,
            ledger,
            validation,
        })
    }
}
