//! Feature Window Builder
//!
//! Builds one as-of feature snapshot per population entity for a cutoff.
//!
//! # Leak Safety
//!
//! Every dated aggregation goes through an [`AggregationQuery`], which only
//! ever yields events strictly before the cutoff. Each snapshot additionally
//! records, per source, the latest event date that contributed to it, and
//! [`FeatureTable::verify_leak_safe`] re-checks that record after the build.
//! A table that fails the check is never returned.
//!
//! Member attributes carry no event date and are exempt from the check.
//!
//! # Totality
//!
//! - Counts and sums default to zero.
//! - Ratios default to zero when the denominator is zero.
//! - Entities absent from every source still get a complete row.

use crate::churn::dates::days_between;
use crate::churn::error::PipelineError;
use crate::churn::event_store::{EventStore, Population};
use crate::churn::events::{
    EntityId, EventRecord, SourceKind, TransactionEvent, TransactionPayload, UsageLogEvent,
    UsageLogPayload,
};
use crate::churn::history::HistoryBlock;
use crate::churn::labeler::ChurnLabeler;
use crate::churn::query::{AggregationQuery, Cutoff, WindowSpan};
use chrono::NaiveDate;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info};

// =============================================================================
// VALUES AND SCHEMA
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Numeric(f64),
    Categorical(Option<String>),
}

impl FeatureValue {
    pub fn as_numeric(&self) -> Option<f64> {
        match self {
            Self::Numeric(v) => Some(*v),
            Self::Categorical(_) => None,
        }
    }

    pub fn as_category(&self) -> Option<&str> {
        match self {
            Self::Categorical(v) => v.as_deref(),
            Self::Numeric(_) => None,
        }
    }
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(v) => write!(f, "{}", v),
            Self::Categorical(Some(v)) => f.write_str(v),
            Self::Categorical(None) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Numeric,
    Categorical,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub kind: FeatureKind,
}

impl FeatureColumn {
    fn numeric(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FeatureKind::Numeric,
        }
    }

    fn categorical(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FeatureKind::Categorical,
        }
    }
}

const TRANSACTION_FEATURES: [&str; 6] = [
    "tx_count",
    "cancel_count",
    "auto_renew_ratio",
    "cancel_ratio",
    "plan_days",
    "amount_paid",
];

const USAGE_FEATURES: [&str; 5] = ["logs", "secs", "unq", "plays", "completion_rate"];

const POINT_IN_TIME_FEATURES: [&str; 3] =
    ["days_since_last_tx", "last_plan_days", "last_is_auto_renew"];

const MEMBER_CATEGORICAL: [&str; 3] = ["city", "gender", "registered_via"];

const MEMBER_NUMERIC: [&str; 2] = ["bd", "tenure_days"];

// =============================================================================
// AGGREGATES
// =============================================================================

/// Transaction aggregates over one window, in [`TRANSACTION_FEATURES`] order.
fn transaction_aggregates(window: &[TransactionEvent]) -> [f64; 6] {
    let count = window.len() as f64;
    let cancels = window.iter().filter(|e| e.payload.is_cancel).count() as f64;
    let auto_renew = window.iter().filter(|e| e.payload.is_auto_renew).count() as f64;
    let plan_days = saturating_sum(window.iter().map(|e| e.payload.plan_days));
    let amount_paid: f64 = window.iter().filter_map(|e| e.payload.amount_paid).sum();
    [
        count,
        cancels,
        ratio(auto_renew, count),
        ratio(cancels, count),
        plan_days as f64,
        amount_paid,
    ]
}

/// Usage aggregates over one window, in [`USAGE_FEATURES`] order.
fn usage_aggregates(window: &[UsageLogEvent]) -> [f64; 5] {
    let secs: f64 = window.iter().map(|e| e.payload.total_secs).sum();
    let unq = saturating_sum(window.iter().map(|e| e.payload.num_unq));
    let plays = saturating_sum(window.iter().map(|e| e.payload.plays()));
    let completed = saturating_sum(window.iter().map(|e| e.payload.num_100));
    [
        window.len() as f64,
        secs,
        unq as f64,
        plays as f64,
        ratio(completed as f64, plays as f64),
    ]
}

/// Counter sum clamped to the `i64` range.
fn saturating_sum(values: impl Iterator<Item = i64>) -> i64 {
    values.fold(0, i64::saturating_add)
}

#[inline]
fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

// =============================================================================
// SNAPSHOTS
// =============================================================================

/// Latest contributing event date per dated source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub latest_event: BTreeMap<SourceKind, NaiveDate>,
}

impl Provenance {
    pub fn observe<P>(&mut self, source: SourceKind, window: &[EventRecord<P>]) {
        if let Some(latest) = window.iter().map(|e| e.event_date).max() {
            let slot = self.latest_event.entry(source).or_insert(latest);
            if latest > *slot {
                *slot = latest;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub entity_id: EntityId,
    pub cutoff: NaiveDate,
    pub window_tag: String,
    pub feature_vector: BTreeMap<String, FeatureValue>,
    pub provenance: Provenance,
}

impl FeatureSnapshot {
    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.feature_vector.get(name)
    }

    pub fn numeric(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(FeatureValue::as_numeric)
    }
}

/// All snapshots for one cutoff, ordered by entity id.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureTable {
    pub cutoff: Cutoff,
    pub window_tag: String,
    pub schema: Vec<FeatureColumn>,
    pub snapshots: Vec<FeatureSnapshot>,
}

impl FeatureTable {
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn get(&self, entity_id: &str) -> Option<&FeatureSnapshot> {
        self.snapshots
            .binary_search_by(|s| s.entity_id.as_str().cmp(entity_id))
            .ok()
            .map(|i| &self.snapshots[i])
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = &EntityId> {
        self.snapshots.iter().map(|s| &s.entity_id)
    }

    /// Assert that no snapshot drew on an event at or after its cutoff.
    pub fn verify_leak_safe(&self) -> Result<(), PipelineError> {
        for snapshot in &self.snapshots {
            for (source, event_date) in &snapshot.provenance.latest_event {
                if *event_date >= snapshot.cutoff {
                    return Err(PipelineError::LeakageViolation {
                        entity_id: snapshot.entity_id.clone(),
                        source: *source,
                        event_date: *event_date,
                        cutoff: snapshot.cutoff,
                    });
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// BUILDER
// =============================================================================

#[derive(Debug, Clone)]
pub struct FeatureWindowBuilder {
    spans: Vec<WindowSpan>,
    history: Option<HistoryBlock>,
}

impl Default for FeatureWindowBuilder {
    fn default() -> Self {
        Self::new(&[30, 90], 5, ChurnLabeler::default())
    }
}

impl FeatureWindowBuilder {
    /// Day windows are de-duplicated and sorted; an all-time window is
    /// always appended. `history_months == 0` disables the history block.
    pub fn new(window_days: &[u32], history_months: usize, labeler: ChurnLabeler) -> Self {
        let mut days: Vec<u32> = window_days.iter().copied().filter(|d| *d > 0).collect();
        days.sort_unstable();
        days.dedup();
        let mut spans: Vec<WindowSpan> = days.into_iter().map(WindowSpan::Days).collect();
        spans.push(WindowSpan::AllTime);

        Self {
            spans,
            history: (history_months > 0).then(|| HistoryBlock::new(history_months, labeler)),
        }
    }

    pub fn spans(&self) -> &[WindowSpan] {
        &self.spans
    }

    pub fn schema(&self) -> Vec<FeatureColumn> {
        let mut schema = Vec::new();
        for span in &self.spans {
            let suffix = span.suffix();
            for base in TRANSACTION_FEATURES.iter().chain(USAGE_FEATURES.iter()) {
                schema.push(FeatureColumn::numeric(format!("{}_{}", base, suffix)));
            }
        }
        schema.extend(POINT_IN_TIME_FEATURES.iter().map(|n| FeatureColumn::numeric(*n)));
        schema.extend(MEMBER_CATEGORICAL.iter().map(|n| FeatureColumn::categorical(*n)));
        schema.extend(MEMBER_NUMERIC.iter().map(|n| FeatureColumn::numeric(*n)));
        if let Some(history) = &self.history {
            schema.extend(history.column_names().into_iter().map(FeatureColumn::numeric));
        }
        schema
    }

    /// Snapshot for one entity.
    pub fn snapshot(
        &self,
        store: &EventStore,
        entity_id: &str,
        cutoff: Cutoff,
        window_tag: &str,
    ) -> FeatureSnapshot {
        let transactions = store.transactions().events_for(entity_id);
        let usage_logs = store.usage_logs().events_for(entity_id);

        let mut values: BTreeMap<String, FeatureValue> = BTreeMap::new();
        let mut provenance = Provenance::default();
        let mut put = |name: String, value: f64| {
            values.insert(name, FeatureValue::Numeric(value));
        };

        for span in &self.spans {
            let suffix = span.suffix();

            let tx_window =
                AggregationQuery::of::<TransactionPayload>(*span, cutoff).select(transactions);
            provenance.observe(SourceKind::Transactions, tx_window);
            for (base, value) in TRANSACTION_FEATURES.iter().zip(transaction_aggregates(tx_window)) {
                put(format!("{}_{}", base, suffix), value);
            }

            let log_window =
                AggregationQuery::of::<UsageLogPayload>(*span, cutoff).select(usage_logs);
            provenance.observe(SourceKind::UsageLogs, log_window);
            for (base, value) in USAGE_FEATURES.iter().zip(usage_aggregates(log_window)) {
                put(format!("{}_{}", base, suffix), value);
            }
        }

        let visible = AggregationQuery::of::<TransactionPayload>(WindowSpan::AllTime, cutoff)
            .select(transactions);
        let last = visible.last();
        put(
            "days_since_last_tx".into(),
            last.map_or(-1.0, |e| days_between(e.event_date, cutoff.date()) as f64),
        );
        put(
            "last_plan_days".into(),
            last.map_or(0.0, |e| e.payload.plan_days as f64),
        );
        put(
            "last_is_auto_renew".into(),
            last.map_or(0.0, |e| if e.payload.is_auto_renew { 1.0 } else { 0.0 }),
        );

        let member = store.member(entity_id);
        put("bd".into(), member.and_then(|m| m.bd).unwrap_or(0) as f64);
        put(
            "tenure_days".into(),
            member
                .and_then(|m| m.registration_init_time)
                .map_or(0.0, |r| days_between(r, cutoff.date()).max(0) as f64),
        );

        if let Some(block) = &self.history {
            provenance.observe(SourceKind::Transactions, visible);
            let history = block.compute(entity_id, visible, cutoff);
            for (i, outcome) in history.recent.iter().enumerate() {
                let value = match outcome {
                    Some(true) => 1.0,
                    Some(false) => 0.0,
                    None => -1.0,
                };
                put(format!("last_{}_is_churn", i + 1), value);
            }
            put("churn_count".into(), f64::from(history.churn_count));
            put("observed_periods".into(), f64::from(history.observed_periods));
            put("churn_rate".into(), history.churn_rate());
            put(
                "months_since_last_churn".into(),
                history.months_since_last_churn as f64,
            );
        }

        let categories = [
            ("city", member.and_then(|m| m.city.clone())),
            ("gender", member.and_then(|m| m.gender.clone())),
            ("registered_via", member.and_then(|m| m.registered_via.clone())),
        ];
        for (name, value) in categories {
            values.insert(name.to_string(), FeatureValue::Categorical(value));
        }

        FeatureSnapshot {
            entity_id: entity_id.to_string(),
            cutoff: cutoff.date(),
            window_tag: window_tag.to_string(),
            feature_vector: values,
            provenance,
        }
    }

    /// Build and verify the table for every population entity.
    pub fn build(
        &self,
        store: &EventStore,
        population: &Population,
        cutoff: Cutoff,
        window_tag: &str,
    ) -> Result<FeatureTable, PipelineError> {
        let snapshots: Vec<FeatureSnapshot> = population
            .ids()
            .par_iter()
            .map(|id| self.snapshot(store, id, cutoff, window_tag))
            .collect();

        let table = FeatureTable {
            cutoff,
            window_tag: window_tag.to_string(),
            schema: self.schema(),
            snapshots,
        };
        table.verify_leak_safe()?;

        debug!(window = %window_tag, columns = table.schema.len(), "feature schema");
        info!(
            window = %window_tag,
            cutoff = %cutoff,
            rows = table.len(),
            "built feature snapshot"
        );
        Ok(table)
    }
}
