//! Scoring collaborator seam.
//!
//! Trained models live outside this crate. The pipeline only needs something
//! that maps a feature table to one churn probability per row, in row order.

use crate::churn::error::PipelineError;
use crate::churn::features::{FeatureKind, FeatureTable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub trait Scorer: Send + Sync {
    fn name(&self) -> &str;

    /// One probability per snapshot, aligned with `table.snapshots`.
    fn score(&self, table: &FeatureTable) -> Result<Vec<f64>, PipelineError>;
}

/// Run a scorer and reject unusable output.
pub fn score_checked(scorer: &dyn Scorer, table: &FeatureTable) -> Result<Vec<f64>, PipelineError> {
    let scores = scorer.score(table)?;
    if scores.len() != table.len() {
        return Err(PipelineError::Scoring {
            model: scorer.name().to_string(),
            reason: format!("returned {} scores for {} rows", scores.len(), table.len()),
        });
    }
    if let Some((i, bad)) = scores
        .iter()
        .enumerate()
        .find(|(_, s)| !s.is_finite() || **s < 0.0 || **s > 1.0)
    {
        return Err(PipelineError::Scoring {
            model: scorer.name().to_string(),
            reason: format!(
                "score {} for entity {} is not a probability",
                bad, table.snapshots[i].entity_id
            ),
        });
    }
    Ok(scores)
}

/// Logistic model over named features.
///
/// Weight keys are numeric feature names, or `column=value` for a
/// categorical indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearScorer {
    pub name: String,
    #[serde(default)]
    pub intercept: f64,
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
}

enum Term<'a> {
    Numeric(&'a str, f64),
    Indicator(&'a str, &'a str, f64),
}

impl LinearScorer {
    pub fn new(name: impl Into<String>, intercept: f64) -> Self {
        Self {
            name: name.into(),
            intercept,
            weights: BTreeMap::new(),
        }
    }

    pub fn with_weight(mut self, feature: impl Into<String>, weight: f64) -> Self {
        self.weights.insert(feature.into(), weight);
        self
    }

    fn terms(&self, table: &FeatureTable) -> Result<Vec<Term<'_>>, PipelineError> {
        let kind_of = |name: &str| {
            table
                .schema
                .iter()
                .find(|c| c.name == name)
                .map(|c| c.kind)
        };
        self.weights
            .iter()
            .map(|(key, weight)| {
                let term = match key.split_once('=') {
                    Some((column, value)) if kind_of(column) == Some(FeatureKind::Categorical) => {
                        Term::Indicator(column, value, *weight)
                    }
                    None if kind_of(key) == Some(FeatureKind::Numeric) => {
                        Term::Numeric(key.as_str(), *weight)
                    }
                    _ => {
                        return Err(PipelineError::Scoring {
                            model: self.name.clone(),
                            reason: format!("weight '{}' matches no feature column", key),
                        })
                    }
                };
                Ok(term)
            })
            .collect()
    }
}

impl Scorer for LinearScorer {
    fn name(&self) -> &str {
        &self.name
    }

    fn score(&self, table: &FeatureTable) -> Result<Vec<f64>, PipelineError> {
        let terms = self.terms(table)?;
        Ok(table
            .snapshots
            .iter()
            .map(|snapshot| {
                let z = terms.iter().fold(self.intercept, |acc, term| match term {
                    Term::Numeric(name, w) => acc + w * snapshot.numeric(name).unwrap_or(0.0),
                    Term::Indicator(column, value, w) => {
                        let hit = snapshot
                            .get(column)
                            .and_then(|v| v.as_category())
                            .map_or(false, |c| c == *value);
                        if hit {
                            acc + w
                        } else {
                            acc
                        }
                    }
                });
                1.0 / (1.0 + (-z).exp())
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::churn::features::{FeatureColumn, FeatureSnapshot, FeatureValue, Provenance};
    use crate::churn::query::Cutoff;
    use chrono::NaiveDate;

    fn table() -> FeatureTable {
        let cutoff = NaiveDate::from_ymd_opt(2017, 3, 1).unwrap();
        let row = |id: &str, secs: f64, city: &str| FeatureSnapshot {
            entity_id: id.into(),
            cutoff,
            window_tag: "t".into(),
            feature_vector: [
                ("secs_30d".to_string(), FeatureValue::Numeric(secs)),
                (
                    "city".to_string(),
                    FeatureValue::Categorical(Some(city.to_string())),
                ),
            ]
            .into_iter()
            .collect(),
            provenance: Provenance::default(),
        };
        FeatureTable {
            cutoff: Cutoff::new(cutoff),
            window_tag: "t".into(),
            schema: vec![
                FeatureColumn {
                    name: "secs_30d".into(),
                    kind: FeatureKind::Numeric,
                },
                FeatureColumn {
                    name: "city".into(),
                    kind: FeatureKind::Categorical,
                },
            ],
            snapshots: vec![row("a", 0.0, "1"), row("b", 2.0, "5")],
        }
    }

    #[test]
    fn test_linear_scorer_logistic_with_indicator() {
        let scorer = LinearScorer::new("lin", 0.0)
            .with_weight("secs_30d", 1.0)
            .with_weight("city=5", -2.0);
        let scores = score_checked(&scorer, &table()).unwrap();
        assert!((scores[0] - 0.5).abs() < 1e-12);
        assert!((scores[1] - 0.5).abs() < 1e-12, "2.0 - 2.0 = 0");
    }

    #[test]
    fn test_unknown_weight_is_scoring_error() {
        let scorer = LinearScorer::new("lin", 0.0).with_weight("nope", 1.0);
        assert!(matches!(
            score_checked(&scorer, &table()),
            Err(PipelineError::Scoring { .. })
        ));
    }

    struct Broken;

    impl Scorer for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn score(&self, table: &FeatureTable) -> Result<Vec<f64>, PipelineError> {
            Ok(vec![1.5; table.len()])
        }
    }

    #[test]
    fn test_out_of_range_scores_rejected() {
        let err = score_checked(&Broken, &table()).unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
