//! Drift Monitor
//!
//! Population Stability Index between a reference window and every other
//! persisted window, for feature columns and model scores separately.
//!
//! # Binning
//!
//! ```text
//! numeric:      edges = reference quantiles at 1/B .. (B-1)/B (linear
//!               interpolation, duplicates collapsed)
//!               bins  = (-inf, e1) [e1, e2) ... [ek, +inf)
//! categorical:  bins  = union of categories seen in either window
//! ```
//!
//! Outer bins are open-ended, so every value of both windows is counted.
//! Per-bin proportions are clipped to a floor before the log ratio:
//!
//! ```text
//! PSI = sum (p_target - p_reference) * ln(p_target / p_reference)
//! ```
//!
//! PSI is not symmetric; every row records its reference window. A window is
//! never compared against itself.

use crate::churn::artifacts::{
    list_manifests, read_feature_columns, read_scores, read_verified, write_rows, ColumnData,
    WindowManifest,
};
use crate::churn::error::PipelineError;
use crate::churn::window::ArtifactLayout;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info, warn};

pub const DEFAULT_PSI_BINS: usize = 10;
pub const DEFAULT_PSI_FLOOR: f64 = 1e-6;
pub const DEFAULT_HIGH_DRIFT: f64 = 0.2;

// =============================================================================
// PURE PSI
// =============================================================================

/// Linear-interpolated quantile of an ascending slice.
fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    let pos = q * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

/// Interior bin edges taken from the reference sample.
pub fn quantile_edges(reference: &[f64], bins: usize) -> Vec<f64> {
    let mut sorted: Vec<f64> = reference.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() || bins < 2 {
        return Vec::new();
    }
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mut edges: Vec<f64> = (1..bins)
        .map(|i| quantile_sorted(&sorted, i as f64 / bins as f64))
        .collect();
    edges.dedup();
    edges
}

fn bin_proportions(values: &[f64], edges: &[f64], floor: f64) -> Vec<f64> {
    let mut counts = vec![0usize; edges.len() + 1];
    let mut total = 0usize;
    for v in values.iter().filter(|v| v.is_finite()) {
        counts[edges.partition_point(|e| e <= v)] += 1;
        total += 1;
    }
    counts
        .into_iter()
        .map(|c| (c as f64 / total.max(1) as f64).max(floor))
        .collect()
}

/// PSI over two aligned proportion vectors.
pub fn psi_from_proportions(reference: &[f64], target: &[f64]) -> f64 {
    reference
        .iter()
        .zip(target)
        .map(|(e, a)| (a - e) * (a / e).ln())
        .sum()
}

/// Numeric PSI; `None` when either sample is empty.
pub fn psi_numeric(reference: &[f64], target: &[f64], bins: usize, floor: f64) -> Option<f64> {
    if !reference.iter().any(|v| v.is_finite()) || !target.iter().any(|v| v.is_finite()) {
        return None;
    }
    let edges = quantile_edges(reference, bins);
    let expected = bin_proportions(reference, &edges, floor);
    let actual = bin_proportions(target, &edges, floor);
    Some(psi_from_proportions(&expected, &actual))
}

fn frequencies<S: AsRef<str>>(values: &[S]) -> BTreeMap<&str, usize> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for v in values {
        *counts.entry(v.as_ref()).or_insert(0) += 1;
    }
    counts
}

fn category_proportions(
    categories: &BTreeSet<&str>,
    counts: &BTreeMap<&str, usize>,
    n: usize,
    floor: f64,
) -> Vec<f64> {
    categories
        .iter()
        .map(|c| (counts.get(c).copied().unwrap_or(0) as f64 / n as f64).max(floor))
        .collect()
}

/// Categorical PSI over the union of observed categories.
pub fn psi_categorical<S: AsRef<str>>(reference: &[S], target: &[S], floor: f64) -> Option<f64> {
    if reference.is_empty() || target.is_empty() {
        return None;
    }
    let ref_counts = frequencies(reference);
    let tgt_counts = frequencies(target);
    let categories: BTreeSet<&str> = ref_counts.keys().chain(tgt_counts.keys()).copied().collect();

    Some(psi_from_proportions(
        &category_proportions(&categories, &ref_counts, reference.len(), floor),
        &category_proportions(&categories, &tgt_counts, target.len(), floor),
    ))
}

// =============================================================================
// REPORT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftKind {
    Feature,
    Score,
}

/// One `psi.csv` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsiRow {
    pub window: String,
    pub reference: String,
    pub kind: DriftKind,
    pub dimension: String,
    pub psi: f64,
    pub high_drift: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PsiReport {
    pub reference: String,
    pub rows: Vec<PsiRow>,
}

impl PsiReport {
    pub fn high_drift(&self) -> impl Iterator<Item = &PsiRow> {
        self.rows.iter().filter(|r| r.high_drift)
    }
}

/// Persisted columns and scores of one window.
#[derive(Debug, Clone, Default)]
pub struct WindowData {
    pub tag: String,
    pub features: BTreeMap<String, ColumnData>,
    pub scores: BTreeMap<String, Vec<f64>>,
}

impl WindowData {
    /// Load a window through its manifest, verifying artifact digests.
    pub fn load(
        dir: &Path,
        layout: &ArtifactLayout,
        manifest: &WindowManifest,
    ) -> Result<Self, PipelineError> {
        let features_name = file_name(&layout.features(&manifest.window));
        let bytes = read_verified(dir, manifest, &features_name)?;
        let features = read_feature_columns(&bytes, &manifest.schema)?;

        let mut scores = BTreeMap::new();
        for model in &manifest.models {
            let name = file_name(&layout.scores(&manifest.window, model));
            let bytes = read_verified(dir, manifest, &name)?;
            scores.insert(model.clone(), read_scores(&bytes)?);
        }
        Ok(Self {
            tag: manifest.window_tag.clone(),
            features,
            scores,
        })
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

// =============================================================================
// MONITOR
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct DriftMonitor {
    pub bins: usize,
    pub floor: f64,
    pub high_drift_threshold: f64,
}

impl Default for DriftMonitor {
    fn default() -> Self {
        Self {
            bins: DEFAULT_PSI_BINS,
            floor: DEFAULT_PSI_FLOOR,
            high_drift_threshold: DEFAULT_HIGH_DRIFT,
        }
    }
}

impl DriftMonitor {
    fn row(
        &self,
        target: &WindowData,
        reference: &WindowData,
        kind: DriftKind,
        dimension: &str,
        psi: f64,
    ) -> PsiRow {
        PsiRow {
            window: target.tag.clone(),
            reference: reference.tag.clone(),
            kind,
            dimension: dimension.to_string(),
            psi,
            high_drift: psi > self.high_drift_threshold,
        }
    }

    /// Feature pass: one row per column present in both windows.
    pub fn compare_features(&self, reference: &WindowData, target: &WindowData) -> Vec<PsiRow> {
        let mut rows = Vec::new();
        for (name, ref_column) in &reference.features {
            let psi = match (ref_column, target.features.get(name)) {
                (ColumnData::Numeric(r), Some(ColumnData::Numeric(t))) => {
                    psi_numeric(r, t, self.bins, self.floor)
                }
                (ColumnData::Categorical(r), Some(ColumnData::Categorical(t))) => {
                    psi_categorical(r, t, self.floor)
                }
                _ => None,
            };
            match psi {
                Some(psi) => rows.push(self.row(target, reference, DriftKind::Feature, name, psi)),
                None => debug!(window = %target.tag, feature = %name, "feature not comparable"),
            }
        }
        rows
    }

    /// Score pass: one row per model scored in both windows.
    pub fn compare_scores(&self, reference: &WindowData, target: &WindowData) -> Vec<PsiRow> {
        reference
            .scores
            .iter()
            .filter_map(|(model, ref_scores)| {
                let tgt_scores = target.scores.get(model)?;
                let psi = psi_numeric(ref_scores, tgt_scores, self.bins, self.floor)?;
                Some(self.row(target, reference, DriftKind::Score, model, psi))
            })
            .collect()
    }

    /// Compare every persisted window with the reference and write `psi.csv`.
    ///
    /// The reference is `reference` (a window tag or `CUTOFF:EXPIRY` pair)
    /// when given, else the window with the earliest cutoff.
    pub fn run(
        &self,
        layout: &ArtifactLayout,
        reference: Option<&str>,
    ) -> Result<PsiReport, PipelineError> {
        let manifests = list_manifests(layout.root())?;
        if manifests.is_empty() {
            return Err(PipelineError::NoWindowsProcessed {
                attempted: 0,
                skipped: Vec::new(),
            });
        }

        let ref_manifest = match reference {
            Some(wanted) => manifests
                .iter()
                .find(|m| m.window_tag == wanted || m.window.to_string() == wanted)
                .ok_or_else(|| {
                    PipelineError::InvalidWindowSpec(format!(
                        "reference window '{}' has no persisted manifest",
                        wanted
                    ))
                })?,
            // Manifests are ordered by cutoff.
            None => &manifests[0],
        };

        let ref_data = WindowData::load(layout.root(), layout, ref_manifest)?;
        let mut rows = Vec::new();
        for manifest in manifests.iter().filter(|m| m.window_tag != ref_manifest.window_tag) {
            let target = WindowData::load(layout.root(), layout, manifest)?;
            rows.extend(self.compare_features(&ref_data, &target));
            rows.extend(self.compare_scores(&ref_data, &target));
        }

        let report = PsiReport {
            reference: ref_data.tag.clone(),
            rows,
        };
        for row in report.high_drift() {
            warn!(
                window = %row.window,
                reference = %row.reference,
                kind = ?row.kind,
                dimension = %row.dimension,
                psi = row.psi,
                "high drift"
            );
        }
        if manifests.len() == 1 {
            warn!(reference = %report.reference, "only the reference window is persisted");
        }

        write_rows(&layout.psi(), &report.rows)?;
        info!(
            reference = %report.reference,
            rows = report.rows.len(),
            high_drift = report.high_drift().count(),
            path = %layout.psi().display(),
            "wrote PSI report"
        );
        Ok(report)
    }
}
