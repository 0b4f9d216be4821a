//! Pipeline configuration
//!
//! Every field has a default, so an absent or partial `churnwatch.toml` is
//! valid. Lookup order:
//!
//! ```text
//! --config PATH  ->  $CHURNWATCH_CONFIG  ->  ./churnwatch.toml  ->  defaults
//! ```
//!
//! An explicitly named file must exist; the implicit `churnwatch.toml` may
//! not. CLI flags are applied on top by the binary.

use crate::churn::dates::YearMonth;
use crate::churn::drift::{DriftMonitor, DEFAULT_HIGH_DRIFT, DEFAULT_PSI_BINS, DEFAULT_PSI_FLOOR};
use crate::churn::error::PipelineError;
use crate::churn::event_store::SourcePaths;
use crate::churn::features::FeatureWindowBuilder;
use crate::churn::labeler::{ChurnLabeler, DEFAULT_GRACE_DAYS};
use crate::churn::metrics::DEFAULT_ECE_BINS;
use crate::churn::scoring::LinearScorer;
use crate::churn::validation::{ValidationHarness, DEFAULT_MIN_ACCURACY};
use crate::churn::window::{WindowSpec, DEFAULT_WINDOWS};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "CHURNWATCH_CONFIG";
/// Config file picked up from the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "churnwatch.toml";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub sources: SourcePaths,

    #[serde(default)]
    pub labels: LabelConfig,

    #[serde(default)]
    pub features: FeatureConfig,

    #[serde(default)]
    pub backtest: BacktestConfig,

    #[serde(default)]
    pub drift: DriftConfig,

    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Linear scorers; a built-in baseline is used when empty.
    #[serde(default)]
    pub models: Vec<LinearScorer>,
}

impl PipelineConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let describe =
            |e: &dyn std::fmt::Display| PipelineError::Config(format!("{}: {}", path.display(), e));
        let contents = std::fs::read_to_string(path).map_err(|e| describe(&e))?;
        let config: Self = toml::from_str(&contents).map_err(|e| describe(&e))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config file from the CLI flag, environment or working
    /// directory.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, PipelineError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load(path);
        }
        let implicit = Path::new(DEFAULT_CONFIG_FILE);
        if implicit.exists() {
            return Self::load(implicit);
        }
        tracing::debug!("No {} found, using default config", DEFAULT_CONFIG_FILE);
        Ok(Self::default())
    }

    pub fn to_toml(&self) -> Result<String, PipelineError> {
        toml::to_string_pretty(self).map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// Reject values no component can run with.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let fail = |msg: String| Err(PipelineError::Config(msg));

        if !(0.0..=1.0).contains(&self.validation.min_accuracy) {
            return fail(format!(
                "validation.min_accuracy must be within [0, 1], got {}",
                self.validation.min_accuracy
            ));
        }
        if self.labels.grace_days < 0 {
            return fail(format!("labels.grace_days must be >= 0, got {}", self.labels.grace_days));
        }
        if self.backtest.threads == 0 {
            return fail("backtest.threads must be >= 1".to_string());
        }
        if self.drift.bins < 2 {
            return fail(format!("drift.bins must be >= 2, got {}", self.drift.bins));
        }
        if !(self.drift.floor > 0.0 && self.drift.floor < 1.0) {
            return fail(format!("drift.floor must be within (0, 1), got {}", self.drift.floor));
        }
        if self.metrics.ece_bins == 0 {
            return fail("metrics.ece_bins must be >= 1".to_string());
        }

        let mut names = HashSet::new();
        for model in &self.models {
            if model.name.trim().is_empty() {
                return fail("models entry without a name".to_string());
            }
            if !names.insert(model.name.as_str()) {
                return fail(format!("model '{}' defined twice", model.name));
            }
        }

        let mut windows = HashSet::new();
        for window in &self.backtest.windows {
            if !windows.insert(window) {
                return fail(format!("backtest window {} listed twice", window));
            }
        }
        Ok(())
    }

    pub fn labeler(&self) -> ChurnLabeler {
        ChurnLabeler::new(self.labels.grace_days)
    }

    pub fn feature_builder(&self) -> FeatureWindowBuilder {
        FeatureWindowBuilder::new(
            &self.features.window_days,
            self.features.history_months,
            self.labeler(),
        )
    }

    pub fn drift_monitor(&self) -> DriftMonitor {
        DriftMonitor {
            bins: self.drift.bins,
            floor: self.drift.floor,
            high_drift_threshold: self.drift.high_drift_threshold,
        }
    }

    pub fn validation_harness(&self) -> ValidationHarness {
        ValidationHarness {
            min_accuracy: self.validation.min_accuracy,
            boundary_days: self.labels.grace_days,
            max_audit_rows: self.validation.max_audit_rows,
        }
    }

    /// Configured scorers, or the baseline when none are configured.
    pub fn scorers(&self) -> Vec<LinearScorer> {
        if self.models.is_empty() {
            vec![baseline_scorer()]
        } else {
            self.models.clone()
        }
    }
}

/// Weights only reference features present in every schema.
pub fn baseline_scorer() -> LinearScorer {
    LinearScorer::new("baseline", -1.0)
        .with_weight("cancel_ratio_total", 2.5)
        .with_weight("last_is_auto_renew", -1.5)
}

// =============================================================================
// SECTIONS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelConfig {
    /// Days after expiration a renewal may arrive and still count
    #[serde(default = "default_grace_days")]
    pub grace_days: i64,
}

fn default_grace_days() -> i64 {
    DEFAULT_GRACE_DAYS
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            grace_days: default_grace_days(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Day windows aggregated in addition to all-time
    #[serde(default = "default_window_days")]
    pub window_days: Vec<u32>,

    /// Past expiry months in the churn-history block (0 disables it)
    #[serde(default = "default_history_months")]
    pub history_months: usize,
}

fn default_window_days() -> Vec<u32> {
    vec![30, 90]
}
fn default_history_months() -> usize {
    5
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            history_months: default_history_months(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    /// `cutoff:expiry` month pairs, processed and reported in this order
    #[serde(default = "default_windows")]
    pub windows: Vec<WindowSpec>,

    /// Worker threads for window processing
    #[serde(default = "default_threads")]
    pub threads: usize,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// SQLite ledger of completed windows
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
}

fn default_windows() -> Vec<WindowSpec> {
    WindowSpec::parse_list(DEFAULT_WINDOWS).unwrap_or_default()
}
fn default_threads() -> usize {
    4
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("eval")
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            windows: default_windows(),
            threads: default_threads(),
            output_dir: default_output_dir(),
            ledger_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftConfig {
    #[serde(default = "default_psi_bins")]
    pub bins: usize,

    /// Per-bin proportion floor applied before the log ratio
    #[serde(default = "default_psi_floor")]
    pub floor: f64,

    #[serde(default = "default_high_drift")]
    pub high_drift_threshold: f64,
}

fn default_psi_bins() -> usize {
    DEFAULT_PSI_BINS
}
fn default_psi_floor() -> f64 {
    DEFAULT_PSI_FLOOR
}
fn default_high_drift() -> f64 {
    DEFAULT_HIGH_DRIFT
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            bins: default_psi_bins(),
            floor: default_psi_floor(),
            high_drift_threshold: default_high_drift(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_min_accuracy")]
    pub min_accuracy: f64,

    /// `{msno, is_churn}` table to certify labels against
    #[serde(default)]
    pub reference_labels: Option<PathBuf>,

    /// Backtest windows with this expiry month are gated against the reference
    #[serde(default)]
    pub gate_expiry_month: Option<YearMonth>,

    #[serde(default)]
    pub max_audit_rows: Option<usize>,
}

fn default_min_accuracy() -> f64 {
    DEFAULT_MIN_ACCURACY
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_accuracy: default_min_accuracy(),
            reference_labels: None,
            gate_expiry_month: None,
            max_audit_rows: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Equal-width bins for expected calibration error
    #[serde(default = "default_ece_bins")]
    pub ece_bins: usize,
}

fn default_ece_bins() -> usize {
    DEFAULT_ECE_BINS
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            ece_bins: default_ece_bins(),
        }
    }
}
