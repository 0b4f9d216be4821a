//! Typed As-Of Aggregation Queries
//!
//! Single source of truth for which events a feature aggregation may see.
//!
//! # Canonical Rule
//!
//! For a cutoff `C` and a window of `N` days the visible interval is
//! **half-open**: `[C - N days, C)`.
//! - Events dated `C - N days` belong to the window.
//! - Events dated `C` are NEVER visible.
//!
//! All-time windows drop the lower bound: `(-inf, C)`.
//!
//! The cutoff is a typed parameter of the query, never text substituted into
//! one, so no aggregation can be built without it.

use crate::churn::events::{EventPayload, EventRecord, SourceKind};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The as-of boundary of a feature snapshot. Events on this date are excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cutoff(NaiveDate);

impl Cutoff {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    #[inline]
    pub fn admits(&self, event_date: NaiveDate) -> bool {
        event_date < self.0
    }
}

impl fmt::Display for Cutoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Length of a feature window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WindowSpan {
    Days(u32),
    AllTime,
}

impl WindowSpan {
    /// Column name suffix: `30d`, `90d`, `total`.
    pub fn suffix(&self) -> String {
        match self {
            Self::Days(n) => format!("{}d", n),
            Self::AllTime => "total".to_string(),
        }
    }

    /// First visible date, if bounded.
    pub fn lower_bound(&self, cutoff: Cutoff) -> Option<NaiveDate> {
        match self {
            Self::Days(n) => cutoff
                .date()
                .checked_sub_signed(Duration::days(i64::from(*n))),
            Self::AllTime => None,
        }
    }
}

/// One aggregation request: which source, which window, as of when.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationQuery {
    pub source: SourceKind,
    pub span: WindowSpan,
    pub cutoff: Cutoff,
}

impl AggregationQuery {
    pub fn of<P: EventPayload>(span: WindowSpan, cutoff: Cutoff) -> Self {
        Self {
            source: P::SOURCE,
            span,
            cutoff,
        }
    }

    pub fn contains(&self, event_date: NaiveDate) -> bool {
        self.cutoff.admits(event_date)
            && self
                .span
                .lower_bound(self.cutoff)
                .map_or(true, |start| event_date >= start)
    }

    /// The visible sub-slice of one entity's chronologically sorted events.
    pub fn select<'a, P: EventPayload>(&self, events: &'a [EventRecord<P>]) -> &'a [EventRecord<P>] {
        debug_assert_eq!(P::SOURCE, self.source);
        let end = events.partition_point(|e| self.cutoff.admits(e.event_date));
        let start = match self.span.lower_bound(self.cutoff) {
            Some(lower) => events[..end].partition_point(|e| e.event_date < lower),
            None => 0,
        };
        &events[start..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::churn::events::{UsageLogEvent, UsageLogPayload};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn log(seq: u64, date: NaiveDate) -> UsageLogEvent {
        UsageLogEvent {
            entity_id: "u".into(),
            event_date: date,
            seq,
            payload: UsageLogPayload::default(),
        }
    }

    #[test]
    fn test_half_open_boundaries() {
        let cutoff = Cutoff::new(d(2017, 3, 1));
        let q = AggregationQuery::of::<UsageLogPayload>(WindowSpan::Days(30), cutoff);
        assert!(q.contains(d(2017, 1, 30)), "start of window is inclusive");
        assert!(!q.contains(d(2017, 1, 29)));
        assert!(q.contains(d(2017, 2, 28)));
        assert!(!q.contains(d(2017, 3, 1)), "cutoff is exclusive");
    }

    #[test]
    fn test_select_matches_contains() {
        let cutoff = Cutoff::new(d(2017, 3, 1));
        let events: Vec<UsageLogEvent> = (0..60)
            .map(|i| log(i, d(2017, 1, 15) + Duration::days(i as i64)))
            .collect();

        for span in [WindowSpan::Days(30), WindowSpan::Days(7), WindowSpan::AllTime] {
            let q = AggregationQuery::of::<UsageLogPayload>(span, cutoff);
            let selected = q.select(&events);
            let expected: Vec<u64> = events
                .iter()
                .filter(|e| q.contains(e.event_date))
                .map(|e| e.seq)
                .collect();
            let got: Vec<u64> = selected.iter().map(|e| e.seq).collect();
            assert_eq!(got, expected, "span {:?}", span);
            assert!(selected.iter().all(|e| e.event_date < cutoff.date()));
        }
    }

    #[test]
    fn test_suffixes() {
        assert_eq!(WindowSpan::Days(30).suffix(), "30d");
        assert_eq!(WindowSpan::AllTime.suffix(), "total");
    }
}
