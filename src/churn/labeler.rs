//! Churn Labeler
//!
//! Derives one churn label per entity and expiry month under the renewal-grace
//! rule.
//!
//! # The Rule
//!
//! ```text
//!   qualifying expiration Q = max (expire_date, transaction_date, seq)
//!                             over transactions with expire_date in month M
//!                             (and transaction_date < qualifying_before, if set)
//!
//!   renewal R = earliest (transaction_date, seq) with
//!                 transaction_date > Q.transaction_date
//!                 AND NOT is_cancel
//!                 AND expire_date > Q.expire_date
//!
//!   no R                                  -> churn      (NoRenewal)
//!   R.transaction_date - Q.expire_date <= grace  -> renewed    (RenewedWithinGrace)
//!   otherwise                             -> churn      (LateRenewal)
//! ```
//!
//! A renewal recorded before the expiration date yields a negative
//! `days_to_renewal` and counts as renewed. Cancellations never count as a
//! renewal no matter when they occur.
//!
//! # Purity
//!
//! [`ChurnLabeler::decide`] is a pure function over one entity's transaction
//! slice. It does not depend on slice order; the arena order only matters for
//! readability of the audit.

use crate::churn::dates::{days_between, YearMonth};
use crate::churn::event_store::EventStore;
use crate::churn::events::{EntityId, TransactionEvent};
use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Default renewal grace period in days.
pub const DEFAULT_GRACE_DAYS: i64 = 30;

// =============================================================================
// TYPES
// =============================================================================

/// Which expiry month to label, optionally bounded by a cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelTarget {
    pub expiry_month: YearMonth,
    /// Only transactions dated strictly before this date may qualify.
    pub qualifying_before: Option<NaiveDate>,
}

impl LabelTarget {
    pub fn month(expiry_month: YearMonth) -> Self {
        Self {
            expiry_month,
            qualifying_before: None,
        }
    }

    pub fn before(mut self, date: NaiveDate) -> Self {
        self.qualifying_before = Some(date);
        self
    }
}

/// How a label was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionPath {
    NoRenewal,
    RenewedWithinGrace,
    LateRenewal,
}

impl DecisionPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoRenewal => "no_renewal",
            Self::RenewedWithinGrace => "renewed_within_grace",
            Self::LateRenewal => "late_renewal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChurnLabel {
    pub entity_id: EntityId,
    pub last_expiration_date: NaiveDate,
    pub next_renewal_date: Option<NaiveDate>,
    pub days_to_renewal: Option<i64>,
    pub is_churn: bool,
}

/// Why a label came out the way it did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelAudit {
    pub qualifying_transaction_date: NaiveDate,
    pub qualifying_seq: u64,
    /// Transactions whose expiration fell in the target month.
    pub qualifying_candidates: usize,
    pub path: DecisionPath,
    /// Later cancellations passed over before the renewal (or in total).
    pub rejected_cancellations: usize,
    /// Later non-cancel transactions that did not extend coverage.
    pub rejected_non_extending: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelDecision {
    pub label: ChurnLabel,
    pub audit: LabelAudit,
}

/// Labels for one target, ordered by entity id.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelTable {
    target: LabelTarget,
    decisions: BTreeMap<EntityId, LabelDecision>,
}

impl LabelTable {
    pub fn new(target: LabelTarget, decisions: impl IntoIterator<Item = LabelDecision>) -> Self {
        Self {
            target,
            decisions: decisions
                .into_iter()
                .map(|d| (d.label.entity_id.clone(), d))
                .collect(),
        }
    }

    pub fn target(&self) -> &LabelTarget {
        &self.target
    }

    pub fn get(&self, entity_id: &str) -> Option<&LabelDecision> {
        self.decisions.get(entity_id)
    }

    pub fn is_churn(&self, entity_id: &str) -> Option<bool> {
        self.get(entity_id).map(|d| d.label.is_churn)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LabelDecision> {
        self.decisions.values()
    }

    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    pub fn churn_count(&self) -> usize {
        self.iter().filter(|d| d.label.is_churn).count()
    }
}

// =============================================================================
// LABELER
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct ChurnLabeler {
    grace_days: i64,
}

impl Default for ChurnLabeler {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_DAYS)
    }
}

impl ChurnLabeler {
    pub fn new(grace_days: i64) -> Self {
        Self { grace_days }
    }

    pub fn grace_days(&self) -> i64 {
        self.grace_days
    }

    /// Label one entity. `None` when no transaction expires in the target
    /// month: absence is the signal, not an error.
    pub fn decide(
        &self,
        entity_id: &str,
        events: &[TransactionEvent],
        target: &LabelTarget,
    ) -> Option<LabelDecision> {
        let qualifies = |e: &TransactionEvent| {
            target.expiry_month.contains(e.expire_date())
                && target
                    .qualifying_before
                    .map_or(true, |bound| e.transaction_date() < bound)
        };

        let qualifying_candidates = events.iter().filter(|e| qualifies(e)).count();
        let qualifying = events
            .iter()
            .filter(|e| qualifies(e))
            .max_by_key(|e| (e.expire_date(), e.transaction_date(), e.seq))?;

        let later: Vec<&TransactionEvent> = events
            .iter()
            .filter(|e| e.transaction_date() > qualifying.transaction_date())
            .collect();

        let renewal = later
            .iter()
            .copied()
            .filter(|e| !e.payload.is_cancel && e.expire_date() > qualifying.expire_date())
            .min_by_key(|e| (e.transaction_date(), e.seq));

        // Rejections are counted up to the renewal, or across all later
        // transactions when there is none.
        let (rejected_cancellations, rejected_non_extending) = later
            .iter()
            .filter(|e| match renewal {
                Some(r) => (e.transaction_date(), e.seq) < (r.transaction_date(), r.seq),
                None => true,
            })
            .fold((0usize, 0usize), |(cancels, stale), e| {
                if e.payload.is_cancel {
                    (cancels + 1, stale)
                } else if e.expire_date() <= qualifying.expire_date() {
                    (cancels, stale + 1)
                } else {
                    (cancels, stale)
                }
            });

        let days_to_renewal =
            renewal.map(|r| days_between(qualifying.expire_date(), r.transaction_date()));
        let path = match days_to_renewal {
            None => DecisionPath::NoRenewal,
            Some(days) if days <= self.grace_days => DecisionPath::RenewedWithinGrace,
            Some(_) => DecisionPath::LateRenewal,
        };

        Some(LabelDecision {
            label: ChurnLabel {
                entity_id: entity_id.to_string(),
                last_expiration_date: qualifying.expire_date(),
                next_renewal_date: renewal.map(|r| r.transaction_date()),
                days_to_renewal,
                is_churn: path != DecisionPath::RenewedWithinGrace,
            },
            audit: LabelAudit {
                qualifying_transaction_date: qualifying.transaction_date(),
                qualifying_seq: qualifying.seq,
                qualifying_candidates,
                path,
                rejected_cancellations,
                rejected_non_extending,
            },
        })
    }

    /// Label every entity with transactions in the store.
    pub fn label_window(&self, store: &EventStore, target: &LabelTarget) -> LabelTable {
        let arena = store.transactions();
        let entity_ids: Vec<&EntityId> = arena.entity_ids().collect();

        let decisions: Vec<LabelDecision> = entity_ids
            .par_iter()
            .filter_map(|id| self.decide(id, arena.events_for(id), target))
            .collect();

        let table = LabelTable::new(*target, decisions);
        info!(
            expiry_month = %target.expiry_month,
            qualifying_before = ?target.qualifying_before,
            labelled = table.len(),
            churned = table.churn_count(),
            "labelled expiry month"
        );
        table
    }
}
