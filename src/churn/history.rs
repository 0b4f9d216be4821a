//! Historical churn block.
//!
//! Re-runs the labeler over the most recent expiry months that are fully
//! resolved before a cutoff (`last_day + grace < cutoff`), using only
//! transactions dated before the cutoff.

use crate::churn::dates::YearMonth;
use crate::churn::events::TransactionEvent;
use crate::churn::labeler::{ChurnLabeler, LabelTarget};
use crate::churn::query::Cutoff;
use chrono::Duration;

/// Per-entity churn history as of one cutoff.
#[derive(Debug, Clone, PartialEq)]
pub struct ChurnHistory {
    /// Most recent first; `None` when the entity had no expiration that month.
    pub recent: Vec<Option<bool>>,
    pub churn_count: u32,
    pub observed_periods: u32,
    /// `-1` when the entity never churned in the observed months.
    pub months_since_last_churn: i64,
}

impl ChurnHistory {
    pub fn churn_rate(&self) -> f64 {
        if self.observed_periods == 0 {
            0.0
        } else {
            f64::from(self.churn_count) / f64::from(self.observed_periods)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HistoryBlock {
    months: usize,
    labeler: ChurnLabeler,
}

impl HistoryBlock {
    pub fn new(months: usize, labeler: ChurnLabeler) -> Self {
        Self { months, labeler }
    }

    pub fn months(&self) -> usize {
        self.months
    }

    pub fn column_names(&self) -> Vec<String> {
        let mut names: Vec<String> = (1..=self.months)
            .map(|i| format!("last_{}_is_churn", i))
            .collect();
        names.extend(
            ["churn_count", "observed_periods", "churn_rate", "months_since_last_churn"]
                .iter()
                .map(|s| s.to_string()),
        );
        names
    }

    /// Expiry months whose grace period closed before the cutoff, most
    /// recent first.
    pub fn resolved_months(&self, cutoff: Cutoff) -> Vec<YearMonth> {
        let grace = Duration::days(self.labeler.grace_days());
        let mut months = Vec::with_capacity(self.months);
        let mut month = YearMonth::of(cutoff.date());
        while months.len() < self.months {
            if month.last_day() + grace < cutoff.date() {
                months.push(month);
            }
            month = month.prev();
        }
        months
    }

    /// `before_cutoff` must already exclude transactions at or after the cutoff.
    pub fn compute(
        &self,
        entity_id: &str,
        before_cutoff: &[TransactionEvent],
        cutoff: Cutoff,
    ) -> ChurnHistory {
        let recent: Vec<Option<bool>> = self
            .resolved_months(cutoff)
            .into_iter()
            .map(|month| {
                let target = LabelTarget::month(month).before(cutoff.date());
                self.labeler
                    .decide(entity_id, before_cutoff, &target)
                    .map(|d| d.label.is_churn)
            })
            .collect();

        let observed_periods = recent.iter().filter(|r| r.is_some()).count() as u32;
        let churn_count = recent.iter().filter(|r| **r == Some(true)).count() as u32;
        let months_since_last_churn = recent
            .iter()
            .position(|r| *r == Some(true))
            .map_or(-1, |i| i as i64);

        ChurnHistory {
            recent,
            churn_count,
            observed_periods,
            months_since_last_churn,
        }
    }
}
