//! Event Store
//!
//! Loads the raw source tables into per-entity arenas of typed, dated events.
//!
//! # Ingestion contract
//!
//! - Headers are matched by (case-insensitive) name; a missing REQUIRED column
//!   fails the whole source with [`PipelineError::MissingColumn`].
//! - A row that cannot be parsed (bad date, bad number, blank id, malformed
//!   record) is dropped and tallied by reason in [`IngestReport`]. The batch
//!   always continues.
//! - A missing file is [`PipelineError::MissingSource`]; the orchestrator
//!   decides whether that is fatal.
//!
//! # Arena layout
//!
//! ```text
//! EntityArena<P>:  entity_id -> [EventRecord<P>]  sorted by (event_date, seq)
//! ```
//!
//! Components receive `&[EventRecord<P>]` slices for one entity and never see
//! another entity's events.

use crate::churn::dates::{parse_yyyymmdd, YearMonth};
use crate::churn::error::PipelineError;
use crate::churn::labeler::ChurnLabel;
use crate::churn::events::{
    EntityId, EventPayload, EventRecord, MemberProfile, SourceKind, TransactionEvent,
    TransactionPayload, UsageLogEvent, UsageLogPayload,
};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// =============================================================================
// SOURCE PATHS
// =============================================================================

/// Locations of the input tables for one load.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcePaths {
    pub transactions: PathBuf,
    pub user_logs: PathBuf,
    pub members: Option<PathBuf>,
    /// Optional `{msno}` table naming the target population.
    pub population: Option<PathBuf>,
}

impl Default for SourcePaths {
    fn default() -> Self {
        Self {
            transactions: PathBuf::from("data/transactions.csv"),
            user_logs: PathBuf::from("data/user_logs.csv"),
            members: None,
            population: None,
        }
    }
}

impl SourcePaths {
    /// Substitute `{cutoff_month}` / `{expiry_month}` path placeholders.
    pub fn resolve_for(&self, cutoff_month: YearMonth, expiry_month: YearMonth) -> Self {
        let resolve = |p: &Path| -> PathBuf {
            let raw = p.to_string_lossy();
            if !raw.contains('{') {
                return p.to_path_buf();
            }
            PathBuf::from(
                raw.replace("{cutoff_month}", &cutoff_month.to_string())
                    .replace("{expiry_month}", &expiry_month.to_string()),
            )
        };
        Self {
            transactions: resolve(&self.transactions),
            user_logs: resolve(&self.user_logs),
            members: self.members.as_deref().map(resolve),
            population: self.population.as_deref().map(resolve),
        }
    }
}

// =============================================================================
// INGEST REPORT
// =============================================================================

/// Why a source row was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowError {
    MissingEntity,
    InvalidDate { column: &'static str },
    InvalidNumber { column: &'static str },
    InvalidFlag { column: &'static str },
    MalformedRecord,
}

impl RowError {
    pub fn reason(&self) -> String {
        match self {
            Self::MissingEntity => "missing_entity".to_string(),
            Self::InvalidDate { column } => format!("invalid_date:{}", column),
            Self::InvalidNumber { column } => format!("invalid_number:{}", column),
            Self::InvalidFlag { column } => format!("invalid_flag:{}", column),
            Self::MalformedRecord => "malformed_record".to_string(),
        }
    }
}

/// Row accounting for one source file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceIngest {
    pub kind: Option<SourceKind>,
    pub path: Option<PathBuf>,
    pub rows_read: u64,
    pub rows_kept: u64,
    pub dropped: BTreeMap<String, u64>,
}

impl SourceIngest {
    pub fn rows_dropped(&self) -> u64 {
        self.dropped.values().sum()
    }

    fn record_drop(&mut self, err: RowError) {
        *self.dropped.entry(err.reason()).or_insert(0) += 1;
    }
}

/// Row accounting for a whole store load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub sources: Vec<SourceIngest>,
}

impl IngestReport {
    pub fn total_dropped(&self) -> u64 {
        self.sources.iter().map(|s| s.rows_dropped()).sum()
    }

    pub fn for_kind(&self, kind: SourceKind) -> Option<&SourceIngest> {
        self.sources.iter().find(|s| s.kind == Some(kind))
    }
}

// =============================================================================
// COLUMN BINDING
// =============================================================================

/// Header name -> column index.
pub(crate) struct Columns {
    index: HashMap<String, usize>,
}

impl Columns {
    fn from_headers(headers: &StringRecord) -> Self {
        let index = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.trim().trim_start_matches('\u{feff}').to_ascii_lowercase(), i))
            .collect();
        Self { index }
    }

    fn required(&self, name: &str, kind: SourceKind, path: &Path) -> Result<usize, PipelineError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| PipelineError::MissingColumn {
                kind,
                column: name.to_string(),
                path: path.to_path_buf(),
            })
    }

    fn optional(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }
}

#[inline]
fn field(record: &StringRecord, idx: usize) -> &str {
    record.get(idx).unwrap_or("").trim()
}

/// Lenient integer: accepts `30` and `30.0`, rejects `30.5`.
pub(crate) fn parse_int(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    raw.parse::<i64>().ok().or_else(|| {
        raw.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && v.fract() == 0.0)
            .map(|v| v as i64)
    })
}

fn parse_flag(raw: &str) -> Option<bool> {
    match parse_int(raw)? {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    }
}

fn parse_finite(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn entity(record: &StringRecord, idx: usize) -> Result<EntityId, RowError> {
    let id = field(record, idx);
    if id.is_empty() {
        Err(RowError::MissingEntity)
    } else {
        Ok(id.to_string())
    }
}

fn required_date(
    record: &StringRecord,
    idx: usize,
    column: &'static str,
) -> Result<chrono::NaiveDate, RowError> {
    parse_yyyymmdd(field(record, idx)).ok_or(RowError::InvalidDate { column })
}

/// Optional integer column: absent or blank is zero, garbage drops the row.
fn count_or_zero(
    record: &StringRecord,
    idx: Option<usize>,
    column: &'static str,
) -> Result<i64, RowError> {
    match idx.map(|i| field(record, i)) {
        None | Some("") => Ok(0),
        Some(raw) => parse_int(raw).ok_or(RowError::InvalidNumber { column }),
    }
}

fn flag_or_false(
    record: &StringRecord,
    idx: Option<usize>,
    column: &'static str,
) -> Result<bool, RowError> {
    match idx.map(|i| field(record, i)) {
        None | Some("") => Ok(false),
        Some(raw) => parse_flag(raw).ok_or(RowError::InvalidFlag { column }),
    }
}

fn text_or_none(record: &StringRecord, idx: Option<usize>) -> Option<String> {
    idx.map(|i| field(record, i))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

// =============================================================================
// ROW PARSERS
// =============================================================================

pub(crate) trait RowParser: Sized {
    type Row;
    const KIND: SourceKind;

    fn bind(columns: &Columns, path: &Path) -> Result<Self, PipelineError>;
    fn parse(&self, record: &StringRecord, seq: u64) -> Result<Self::Row, RowError>;
}

struct TransactionParser {
    msno: usize,
    transaction_date: usize,
    expire_date: usize,
    is_cancel: usize,
    plan_days: Option<usize>,
    is_auto_renew: Option<usize>,
    amount_paid: Option<usize>,
}

impl RowParser for TransactionParser {
    type Row = TransactionEvent;
    const KIND: SourceKind = SourceKind::Transactions;

    fn bind(columns: &Columns, path: &Path) -> Result<Self, PipelineError> {
        Ok(Self {
            msno: columns.required("msno", Self::KIND, path)?,
            transaction_date: columns.required("transaction_date", Self::KIND, path)?,
            expire_date: columns.required("membership_expire_date", Self::KIND, path)?,
            is_cancel: columns.required("is_cancel", Self::KIND, path)?,
            plan_days: columns.optional("payment_plan_days"),
            is_auto_renew: columns.optional("is_auto_renew"),
            amount_paid: columns.optional("actual_amount_paid"),
        })
    }

    fn parse(&self, record: &StringRecord, seq: u64) -> Result<TransactionEvent, RowError> {
        let entity_id = entity(record, self.msno)?;
        let transaction_date = required_date(record, self.transaction_date, "transaction_date")?;
        let expire_date = required_date(record, self.expire_date, "membership_expire_date")?;
        let is_cancel = parse_flag(field(record, self.is_cancel))
            .ok_or(RowError::InvalidFlag { column: "is_cancel" })?;
        let amount_paid = match self.amount_paid.map(|i| field(record, i)) {
            None | Some("") => None,
            Some(raw) => Some(parse_finite(raw).ok_or(RowError::InvalidNumber {
                column: "actual_amount_paid",
            })?),
        };

        Ok(EventRecord {
            entity_id,
            event_date: transaction_date,
            seq,
            payload: TransactionPayload {
                expire_date,
                plan_days: count_or_zero(record, self.plan_days, "payment_plan_days")?,
                is_auto_renew: flag_or_false(record, self.is_auto_renew, "is_auto_renew")?,
                is_cancel,
                amount_paid,
            },
        })
    }
}

struct UsageLogParser {
    msno: usize,
    date: usize,
    num_25: Option<usize>,
    num_50: Option<usize>,
    num_75: Option<usize>,
    num_985: Option<usize>,
    num_100: Option<usize>,
    num_unq: Option<usize>,
    total_secs: Option<usize>,
}

impl RowParser for UsageLogParser {
    type Row = UsageLogEvent;
    const KIND: SourceKind = SourceKind::UsageLogs;

    fn bind(columns: &Columns, path: &Path) -> Result<Self, PipelineError> {
        Ok(Self {
            msno: columns.required("msno", Self::KIND, path)?,
            date: columns.required("date", Self::KIND, path)?,
            num_25: columns.optional("num_25"),
            num_50: columns.optional("num_50"),
            num_75: columns.optional("num_75"),
            num_985: columns.optional("num_985"),
            num_100: columns.optional("num_100"),
            num_unq: columns.optional("num_unq"),
            total_secs: columns.optional("total_secs"),
        })
    }

    fn parse(&self, record: &StringRecord, seq: u64) -> Result<UsageLogEvent, RowError> {
        let entity_id = entity(record, self.msno)?;
        let event_date = required_date(record, self.date, "date")?;
        let total_secs = match self.total_secs.map(|i| field(record, i)) {
            None | Some("") => 0.0,
            Some(raw) => parse_finite(raw).ok_or(RowError::InvalidNumber {
                column: "total_secs",
            })?,
        };

        Ok(EventRecord {
            entity_id,
            event_date,
            seq,
            payload: UsageLogPayload {
                num_25: count_or_zero(record, self.num_25, "num_25")?,
                num_50: count_or_zero(record, self.num_50, "num_50")?,
                num_75: count_or_zero(record, self.num_75, "num_75")?,
                num_985: count_or_zero(record, self.num_985, "num_985")?,
                num_100: count_or_zero(record, self.num_100, "num_100")?,
                num_unq: count_or_zero(record, self.num_unq, "num_unq")?,
                total_secs,
            },
        })
    }
}

struct MemberParser {
    msno: usize,
    city: Option<usize>,
    bd: Option<usize>,
    gender: Option<usize>,
    registered_via: Option<usize>,
    registration_init_time: Option<usize>,
}

impl RowParser for MemberParser {
    type Row = MemberProfile;
    const KIND: SourceKind = SourceKind::Members;

    fn bind(columns: &Columns, path: &Path) -> Result<Self, PipelineError> {
        Ok(Self {
            msno: columns.required("msno", Self::KIND, path)?,
            city: columns.optional("city"),
            bd: columns.optional("bd"),
            gender: columns.optional("gender"),
            registered_via: columns.optional("registered_via"),
            registration_init_time: columns.optional("registration_init_time"),
        })
    }

    // Static attributes: unparsable values become None instead of dropping
    // the profile.
    fn parse(&self, record: &StringRecord, _seq: u64) -> Result<MemberProfile, RowError> {
        Ok(MemberProfile {
            entity_id: entity(record, self.msno)?,
            city: text_or_none(record, self.city),
            bd: text_or_none(record, self.bd).and_then(|v| parse_int(&v)),
            gender: text_or_none(record, self.gender),
            registered_via: text_or_none(record, self.registered_via),
            registration_init_time: text_or_none(record, self.registration_init_time)
                .and_then(|v| parse_yyyymmdd(&v)),
        })
    }
}

struct PopulationParser {
    msno: usize,
}

impl RowParser for PopulationParser {
    type Row = EntityId;
    const KIND: SourceKind = SourceKind::Population;

    fn bind(columns: &Columns, path: &Path) -> Result<Self, PipelineError> {
        Ok(Self {
            msno: columns.required("msno", Self::KIND, path)?,
        })
    }

    fn parse(&self, record: &StringRecord, _seq: u64) -> Result<EntityId, RowError> {
        entity(record, self.msno)
    }
}

struct ReferenceLabelParser {
    msno: usize,
    is_churn: usize,
}

impl RowParser for ReferenceLabelParser {
    type Row = (EntityId, bool);
    const KIND: SourceKind = SourceKind::ReferenceLabels;

    fn bind(columns: &Columns, path: &Path) -> Result<Self, PipelineError> {
        Ok(Self {
            msno: columns.required("msno", Self::KIND, path)?,
            is_churn: columns.required("is_churn", Self::KIND, path)?,
        })
    }

    fn parse(&self, record: &StringRecord, _seq: u64) -> Result<(EntityId, bool), RowError> {
        let id = entity(record, self.msno)?;
        let label = parse_flag(field(record, self.is_churn))
            .ok_or(RowError::InvalidFlag { column: "is_churn" })?;
        Ok((id, label))
    }
}

/// Reads a label table previously written by `label` or `backtest`.
struct GeneratedLabelParser {
    msno: usize,
    last_expire_date: usize,
    next_txn_date: Option<usize>,
    days_to_next: Option<usize>,
    is_churn: usize,
}

impl RowParser for GeneratedLabelParser {
    type Row = ChurnLabel;
    const KIND: SourceKind = SourceKind::GeneratedLabels;

    fn bind(columns: &Columns, path: &Path) -> Result<Self, PipelineError> {
        Ok(Self {
            msno: columns.required("msno", Self::KIND, path)?,
            last_expire_date: columns.required("last_expire_date", Self::KIND, path)?,
            next_txn_date: columns.optional("next_txn_date"),
            days_to_next: columns.optional("days_to_next"),
            is_churn: columns.required("is_churn", Self::KIND, path)?,
        })
    }

    fn parse(&self, record: &StringRecord, _seq: u64) -> Result<ChurnLabel, RowError> {
        let next_renewal_date = match self.next_txn_date.map(|i| field(record, i)) {
            None | Some("") => None,
            Some(raw) => Some(
                parse_yyyymmdd(raw).ok_or(RowError::InvalidDate {
                    column: "next_txn_date",
                })?,
            ),
        };
        let days_to_renewal = match self.days_to_next.map(|i| field(record, i)) {
            None | Some("") => None,
            Some(raw) => Some(parse_int(raw).ok_or(RowError::InvalidNumber {
                column: "days_to_next",
            })?),
        };
        Ok(ChurnLabel {
            entity_id: entity(record, self.msno)?,
            last_expiration_date: required_date(record, self.last_expire_date, "last_expire_date")?,
            next_renewal_date,
            days_to_renewal,
            is_churn: parse_flag(field(record, self.is_churn))
                .ok_or(RowError::InvalidFlag { column: "is_churn" })?,
        })
    }
}

// =============================================================================
// TABLE READING
// =============================================================================

pub(crate) fn read_table<P: RowParser, R: Read>(
    reader: R,
    path: &Path,
) -> Result<(Vec<P::Row>, SourceIngest), PipelineError> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let columns = Columns::from_headers(rdr.headers()?);
    let parser = P::bind(&columns, path)?;

    let mut ingest = SourceIngest {
        kind: Some(P::KIND),
        path: Some(path.to_path_buf()),
        ..Default::default()
    };
    let mut rows = Vec::new();

    for (seq, result) in rdr.records().enumerate() {
        ingest.rows_read += 1;
        let parsed = match result {
            Ok(record) => parser.parse(&record, seq as u64),
            Err(e) => {
                debug!(source = %P::KIND, row = seq, error = %e, "malformed record");
                Err(RowError::MalformedRecord)
            }
        };
        match parsed {
            Ok(row) => {
                ingest.rows_kept += 1;
                rows.push(row);
            }
            Err(err) => ingest.record_drop(err),
        }
    }

    if ingest.rows_dropped() > 0 {
        warn!(
            source = %P::KIND,
            path = %path.display(),
            dropped = ingest.rows_dropped(),
            reasons = ?ingest.dropped,
            "dropped unparsable rows"
        );
    }
    info!(
        source = %P::KIND,
        path = %path.display(),
        rows = ingest.rows_read,
        kept = ingest.rows_kept,
        "ingested source"
    );

    Ok((rows, ingest))
}

pub(crate) fn read_file<P: RowParser>(
    path: &Path,
) -> Result<(Vec<P::Row>, SourceIngest), PipelineError> {
    if !path.exists() {
        return Err(PipelineError::MissingSource {
            kind: P::KIND,
            path: path.to_path_buf(),
        });
    }
    let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
    read_table::<P, _>(file, path)
}

/// Load a `{msno, is_churn}` reference label table.
pub fn load_reference_labels(
    path: &Path,
) -> Result<(Vec<(EntityId, bool)>, SourceIngest), PipelineError> {
    read_file::<ReferenceLabelParser>(path)
}

/// Load a persisted label table.
pub fn load_generated_labels(path: &Path) -> Result<(Vec<ChurnLabel>, SourceIngest), PipelineError> {
    read_file::<GeneratedLabelParser>(path)
}

// =============================================================================
// ARENAS
// =============================================================================

/// Events of one payload type, grouped by entity and chronologically sorted.
#[derive(Debug, Clone)]
pub struct EntityArena<P> {
    by_entity: HashMap<EntityId, Vec<EventRecord<P>>>,
    total: usize,
}

impl<P: EventPayload> EntityArena<P> {
    pub fn from_events(events: Vec<EventRecord<P>>) -> Self {
        let total = events.len();
        let mut by_entity: HashMap<EntityId, Vec<EventRecord<P>>> = HashMap::new();
        for event in events {
            by_entity
                .entry(event.entity_id.clone())
                .or_default()
                .push(event);
        }
        for events in by_entity.values_mut() {
            events.sort_by_key(|e| (e.event_date, e.seq));
        }
        Self { by_entity, total }
    }

    /// Chronological events for one entity (empty when unknown).
    pub fn events_for(&self, entity_id: &str) -> &[EventRecord<P>] {
        self.by_entity
            .get(entity_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = &EntityId> {
        self.by_entity.keys()
    }

    pub fn entity_count(&self) -> usize {
        self.by_entity.len()
    }

    pub fn event_count(&self) -> usize {
        self.total
    }
}

impl<P: EventPayload> Default for EntityArena<P> {
    fn default() -> Self {
        Self {
            by_entity: HashMap::new(),
            total: 0,
        }
    }
}

/// Sorted, de-duplicated set of entities a snapshot must cover.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Population(Vec<EntityId>);

impl Population {
    pub fn new<I: IntoIterator<Item = EntityId>>(ids: I) -> Self {
        let set: BTreeSet<EntityId> = ids.into_iter().collect();
        Self(set.into_iter().collect())
    }

    pub fn ids(&self) -> &[EntityId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.0
            .binary_search_by(|id| id.as_str().cmp(entity_id))
            .is_ok()
    }
}

// =============================================================================
// EVENT STORE
// =============================================================================

/// Normalized view over all input sources for one load.
#[derive(Debug, Clone, Default)]
pub struct EventStore {
    transactions: EntityArena<TransactionPayload>,
    usage_logs: EntityArena<UsageLogPayload>,
    members: HashMap<EntityId, MemberProfile>,
    explicit_population: Option<Population>,
    report: IngestReport,
}

impl EventStore {
    /// Load every configured source from disk.
    pub fn load(paths: &SourcePaths) -> Result<Self, PipelineError> {
        let mut report = IngestReport::default();

        let (transactions, ingest) = read_file::<TransactionParser>(&paths.transactions)?;
        report.sources.push(ingest);

        let (usage_logs, ingest) = read_file::<UsageLogParser>(&paths.user_logs)?;
        report.sources.push(ingest);

        let members = match &paths.members {
            Some(path) => {
                let (members, ingest) = read_file::<MemberParser>(path)?;
                report.sources.push(ingest);
                members
            }
            None => Vec::new(),
        };

        let explicit_population = match &paths.population {
            Some(path) => {
                let (ids, ingest) = read_file::<PopulationParser>(path)?;
                report.sources.push(ingest);
                Some(Population::new(ids))
            }
            None => None,
        };

        let mut store = Self::from_events(transactions, usage_logs, members);
        store.explicit_population = explicit_population;
        store.report = report;
        Ok(store)
    }

    /// Build a store from already-parsed records.
    pub fn from_events(
        transactions: Vec<TransactionEvent>,
        usage_logs: Vec<UsageLogEvent>,
        members: Vec<MemberProfile>,
    ) -> Self {
        Self {
            transactions: EntityArena::from_events(transactions),
            usage_logs: EntityArena::from_events(usage_logs),
            members: members
                .into_iter()
                .map(|m| (m.entity_id.clone(), m))
                .collect(),
            explicit_population: None,
            report: IngestReport::default(),
        }
    }

    pub fn with_population<I: IntoIterator<Item = EntityId>>(mut self, ids: I) -> Self {
        self.explicit_population = Some(Population::new(ids));
        self
    }

    pub fn transactions(&self) -> &EntityArena<TransactionPayload> {
        &self.transactions
    }

    pub fn usage_logs(&self) -> &EntityArena<UsageLogPayload> {
        &self.usage_logs
    }

    pub fn member(&self, entity_id: &str) -> Option<&MemberProfile> {
        self.members.get(entity_id)
    }

    /// The explicit population, or every entity seen in any source.
    pub fn population(&self) -> Population {
        if let Some(population) = &self.explicit_population {
            return population.clone();
        }
        Population::new(
            self.transactions
                .entity_ids()
                .chain(self.usage_logs.entity_ids())
                .chain(self.members.keys())
                .cloned(),
        )
    }

    pub fn report(&self) -> &IngestReport {
        &self.report
    }
}
