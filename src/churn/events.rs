//! Event Records
//!
//! Uniform typed representation of the three heterogeneous sources. Every
//! dated record is an [`EventRecord`] whose `event_date` is the ONLY date used
//! for cutoff filtering; payload dates (such as a transaction's expiration)
//! never decide visibility.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Subscriber identifier (`msno` in the source tables).
pub type EntityId = String;

/// Which input table an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Transactions,
    UsageLogs,
    Members,
    Population,
    ReferenceLabels,
    GeneratedLabels,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transactions => "transactions",
            Self::UsageLogs => "user_logs",
            Self::Members => "members",
            Self::Population => "population",
            Self::ReferenceLabels => "reference_labels",
            Self::GeneratedLabels => "generated_labels",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload types carried by dated events.
pub trait EventPayload: Clone + Send + Sync {
    const SOURCE: SourceKind;
}

/// An immutable, parsed, dated event for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord<P> {
    pub entity_id: EntityId,
    pub event_date: NaiveDate,
    /// Ingest order; breaks ties between events on the same date.
    pub seq: u64,
    pub payload: P,
}

impl<P: EventPayload> EventRecord<P> {
    pub fn source(&self) -> SourceKind {
        P::SOURCE
    }
}

/// A subscription transaction. `event_date` is the transaction date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionPayload {
    pub expire_date: NaiveDate,
    pub plan_days: i64,
    pub is_auto_renew: bool,
    pub is_cancel: bool,
    pub amount_paid: Option<f64>,
}

impl EventPayload for TransactionPayload {
    const SOURCE: SourceKind = SourceKind::Transactions;
}

pub type TransactionEvent = EventRecord<TransactionPayload>;

impl TransactionEvent {
    #[inline]
    pub fn transaction_date(&self) -> NaiveDate {
        self.event_date
    }

    #[inline]
    pub fn expire_date(&self) -> NaiveDate {
        self.payload.expire_date
    }
}

/// One day of listening activity. `event_date` is the log date.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageLogPayload {
    pub num_25: i64,
    pub num_50: i64,
    pub num_75: i64,
    pub num_985: i64,
    pub num_100: i64,
    pub num_unq: i64,
    pub total_secs: f64,
}

impl UsageLogPayload {
    /// Total plays across all completion buckets, saturating at `i64::MAX`.
    pub fn plays(&self) -> i64 {
        [self.num_50, self.num_75, self.num_985, self.num_100]
            .into_iter()
            .fold(self.num_25, i64::saturating_add)
    }
}

impl EventPayload for UsageLogPayload {
    const SOURCE: SourceKind = SourceKind::UsageLogs;
}

pub type UsageLogEvent = EventRecord<UsageLogPayload>;

/// Static demographic attributes.
///
/// Members carry no event date: they are treated as non-time-varying and are
/// exempt from the cutoff check. `registration_init_time` is a payload value,
/// not a visibility date.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberProfile {
    pub entity_id: EntityId,
    pub city: Option<String>,
    pub bd: Option<i64>,
    pub gender: Option<String>,
    pub registered_via: Option<String>,
    pub registration_init_time: Option<NaiveDate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plays_sums_buckets() {
        let p = UsageLogPayload {
            num_25: 1,
            num_50: 2,
            num_75: 3,
            num_985: 4,
            num_100: 5,
            num_unq: 9,
            total_secs: 10.0,
        };
        assert_eq!(p.plays(), 15);
    }

    #[test]
    fn test_plays_saturates_on_huge_counters() {
        let p = UsageLogPayload {
            num_25: i64::MAX,
            num_50: 1,
            num_75: 0,
            num_985: 0,
            num_100: i64::MAX,
            num_unq: 0,
            total_secs: 0.0,
        };
        assert_eq!(p.plays(), i64::MAX);
    }

    #[test]
    fn test_source_kind_from_payload() {
        let ev = TransactionEvent {
            entity_id: "u1".into(),
            event_date: NaiveDate::from_ymd_opt(2017, 1, 1).unwrap(),
            seq: 0,
            payload: TransactionPayload {
                expire_date: NaiveDate::from_ymd_opt(2017, 2, 1).unwrap(),
                plan_days: 30,
                is_auto_renew: true,
                is_cancel: false,
                amount_paid: None,
            },
        };
        assert_eq!(ev.source(), SourceKind::Transactions);
        assert_eq!(SourceKind::UsageLogs.to_string(), "user_logs");
    }
}
