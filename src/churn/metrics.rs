//! Evaluation metrics for binary churn probabilities.
//!
//! All functions take aligned `probabilities` / `outcomes` slices
//! (`true` = churned) and expect them to be non-empty; [`evaluate`] is the
//! guarded entry point.

use serde::{Deserialize, Serialize};

/// Probability clip used by log-loss.
pub const LOG_LOSS_EPS: f64 = 1e-15;

/// Default number of equal-width calibration bins.
pub const DEFAULT_ECE_BINS: usize = 15;

pub fn log_loss(probabilities: &[f64], outcomes: &[bool]) -> f64 {
    debug_assert_eq!(probabilities.len(), outcomes.len());
    let total: f64 = probabilities
        .iter()
        .zip(outcomes)
        .map(|(p, y)| {
            let p = p.clamp(LOG_LOSS_EPS, 1.0 - LOG_LOSS_EPS);
            if *y {
                -p.ln()
            } else {
                -(1.0 - p).ln()
            }
        })
        .sum();
    total / probabilities.len() as f64
}

pub fn brier_score(probabilities: &[f64], outcomes: &[bool]) -> f64 {
    debug_assert_eq!(probabilities.len(), outcomes.len());
    let total: f64 = probabilities
        .iter()
        .zip(outcomes)
        .map(|(p, y)| {
            let target = if *y { 1.0 } else { 0.0 };
            (p - target).powi(2)
        })
        .sum();
    total / probabilities.len() as f64
}

/// Rank-based ROC AUC with tied scores sharing their average rank.
///
/// `None` when only one class is present.
pub fn roc_auc(probabilities: &[f64], outcomes: &[bool]) -> Option<f64> {
    debug_assert_eq!(probabilities.len(), outcomes.len());
    let positives = outcomes.iter().filter(|y| **y).count();
    let negatives = outcomes.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..probabilities.len()).collect();
    order.sort_by(|a, b| probabilities[*a].total_cmp(&probabilities[*b]));

    let mut positive_rank_sum = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && probabilities[order[j + 1]] == probabilities[order[i]] {
            j += 1;
        }
        // Ranks are 1-based; the tie group i..=j shares the mean rank.
        let mean_rank = (i + j) as f64 / 2.0 + 1.0;
        let tied_positives = order[i..=j].iter().filter(|k| outcomes[**k]).count();
        positive_rank_sum += mean_rank * tied_positives as f64;
        i = j + 1;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Some((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

/// Expected calibration error over `bins` equal-width bins on [0, 1].
pub fn expected_calibration_error(probabilities: &[f64], outcomes: &[bool], bins: usize) -> f64 {
    debug_assert_eq!(probabilities.len(), outcomes.len());
    let bins = bins.max(1);
    let mut count = vec![0usize; bins];
    let mut prob_sum = vec![0.0f64; bins];
    let mut hit_sum = vec![0.0f64; bins];

    for (p, y) in probabilities.iter().zip(outcomes) {
        // p == 1.0 lands in the last bin.
        let b = ((p * bins as f64) as usize).min(bins - 1);
        count[b] += 1;
        prob_sum[b] += p;
        if *y {
            hit_sum[b] += 1.0;
        }
    }

    let total = probabilities.len() as f64;
    (0..bins)
        .filter(|b| count[*b] > 0)
        .map(|b| {
            let n = count[b] as f64;
            (n / total) * (hit_sum[b] / n - prob_sum[b] / n).abs()
        })
        .sum()
}

/// One backtest metrics row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRow {
    pub window: String,
    pub model: String,
    pub logloss: f64,
    pub auc: Option<f64>,
    pub brier: f64,
    pub ece: f64,
    pub n: usize,
}

/// Metrics for one (window, model) pair, `None` for an empty evaluation set.
pub fn evaluate(
    window: &str,
    model: &str,
    probabilities: &[f64],
    outcomes: &[bool],
    ece_bins: usize,
) -> Option<EvaluationRow> {
    if probabilities.is_empty() || probabilities.len() != outcomes.len() {
        return None;
    }
    Some(EvaluationRow {
        window: window.to_string(),
        model: model.to_string(),
        logloss: log_loss(probabilities, outcomes),
        auc: roc_auc(probabilities, outcomes),
        brier: brier_score(probabilities, outcomes),
        ece: expected_calibration_error(probabilities, outcomes, ece_bins),
        n: probabilities.len(),
    })
}
