//! Backtest window specification and deterministic artifact paths.
//!
//! A window is written `cutoff_month:expiry_month` (for example
//! `2017-02:2017-03`). The feature cutoff is the LAST calendar day of the
//! cutoff month, and every artifact path is a pure function of the pair, so
//! re-running one window can only ever overwrite that window's files.

use crate::churn::dates::YearMonth;
use crate::churn::error::PipelineError;
use crate::churn::labeler::LabelTarget;
use crate::churn::query::Cutoff;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Backtest windows used when none are configured.
pub const DEFAULT_WINDOWS: &str = "2017-02:2017-03,2017-03:2017-04,2017-01:2017-02";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WindowSpec {
    pub cutoff_month: YearMonth,
    pub expiry_month: YearMonth,
}

impl WindowSpec {
    pub fn new(cutoff_month: YearMonth, expiry_month: YearMonth) -> Self {
        Self {
            cutoff_month,
            expiry_month,
        }
    }

    pub fn cutoff(&self) -> Cutoff {
        Cutoff::new(self.cutoff_month.last_day())
    }

    /// Label target for this window. Qualifying expirations are not bounded
    /// by the feature cutoff: the label looks forward by construction.
    pub fn label_target(&self) -> LabelTarget {
        LabelTarget::month(self.expiry_month)
    }

    /// `YYYY-MM_YYYY-MM`, safe for file names.
    pub fn tag(&self) -> String {
        format!("{}_{}", self.cutoff_month, self.expiry_month)
    }

    /// Parse a comma-separated list, keeping order and rejecting duplicates.
    pub fn parse_list(raw: &str) -> Result<Vec<WindowSpec>, PipelineError> {
        let mut windows: Vec<WindowSpec> = Vec::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let window: WindowSpec = part.parse()?;
            if windows.contains(&window) {
                return Err(PipelineError::InvalidWindowSpec(format!(
                    "window '{}' listed twice",
                    part
                )));
            }
            windows.push(window);
        }
        if windows.is_empty() {
            return Err(PipelineError::InvalidWindowSpec(
                "no windows given".to_string(),
            ));
        }
        Ok(windows)
    }
}

impl fmt::Display for WindowSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.cutoff_month, self.expiry_month)
    }
}

impl FromStr for WindowSpec {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (cutoff, expiry) = s.trim().split_once(':').ok_or_else(|| {
            PipelineError::InvalidWindowSpec(format!("expected CUTOFF:EXPIRY, got '{}'", s))
        })?;
        let cutoff_month: YearMonth = cutoff
            .parse()
            .map_err(|e| PipelineError::InvalidWindowSpec(format!("cutoff month: {}", e)))?;
        let expiry_month: YearMonth = expiry
            .parse()
            .map_err(|e| PipelineError::InvalidWindowSpec(format!("expiry month: {}", e)))?;
        Ok(Self::new(cutoff_month, expiry_month))
    }
}

impl TryFrom<String> for WindowSpec {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<WindowSpec> for String {
    fn from(value: WindowSpec) -> Self {
        value.to_string()
    }
}

// =============================================================================
// ARTIFACT LAYOUT
// =============================================================================

/// Every output path of a run, rooted at one directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn features(&self, window: &WindowSpec) -> PathBuf {
        self.root.join(format!("features_{}.csv", window.tag()))
    }

    pub fn labels(&self, window: &WindowSpec) -> PathBuf {
        self.root.join(format!("labels_{}.csv", window.tag()))
    }

    pub fn scores(&self, window: &WindowSpec, model: &str) -> PathBuf {
        self.root
            .join(format!("scores_{}_{}.csv", window.tag(), sanitize(model)))
    }

    pub fn manifest(&self, window: &WindowSpec) -> PathBuf {
        self.root.join(format!("window_{}.json", window.tag()))
    }

    pub fn backtests(&self) -> PathBuf {
        self.root.join("backtests.csv")
    }

    pub fn psi(&self) -> PathBuf {
        self.root.join("psi.csv")
    }

    pub fn mismatches(&self) -> PathBuf {
        self.root.join("label_mismatches.csv")
    }

    /// Standalone label table for `label` runs (not tied to a backtest window).
    pub fn labels_for_month(&self, expiry_month: YearMonth) -> PathBuf {
        self.root.join(format!("labels_{}.csv", expiry_month))
    }

    /// Standalone feature table for `build-features` runs.
    pub fn features_for_cutoff(&self, cutoff: Cutoff) -> PathBuf {
        self.root
            .join(format!("features_{}.csv", cutoff.date().format("%Y-%m-%d")))
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
