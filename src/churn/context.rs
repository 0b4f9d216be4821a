//! Pipeline Context
//!
//! Everything one orchestration run shares, constructed once and passed by
//! reference. Nothing here outlives the run: the event-store cache is keyed by
//! resolved source paths and dropped with the context.

use crate::churn::artifact_store::ArtifactLedger;
use crate::churn::error::PipelineError;
use crate::churn::event_store::{EventStore, SourcePaths};
use crate::churn::scoring::Scorer;
use crate::churn::validation::ReferenceLabels;
use crate::churn::window::ArtifactLayout;
use crate::config::PipelineConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// One cache entry per source set. The slot lock is held while loading so
/// concurrent windows on the same sources wait for a single load.
type StoreSlot = Arc<Mutex<Option<Arc<EventStore>>>>;

pub struct PipelineContext {
    config: PipelineConfig,
    layout: ArtifactLayout,
    scorers: Vec<Box<dyn Scorer>>,
    ledger: Option<ArtifactLedger>,
    reference_labels: Option<ReferenceLabels>,
    run_id: String,
    stores: Mutex<HashMap<SourcePaths, StoreSlot>>,
    store_loads: AtomicUsize,
}

impl PipelineContext {
    /// Build from config: configured scorers, ledger (if a path is set) and
    /// reference labels (if a path is set).
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let ledger = match &config.backtest.ledger_path {
            Some(path) => Some(ArtifactLedger::open(path)?),
            None => None,
        };
        let reference_labels = match &config.validation.reference_labels {
            Some(path) => Some(ReferenceLabels::load(path)?),
            None => None,
        };
        let scorers: Vec<Box<dyn Scorer>> = config
            .scorers()
            .into_iter()
            .map(|s| Box::new(s) as Box<dyn Scorer>)
            .collect();

        let ctx = Self {
            layout: ArtifactLayout::new(&config.backtest.output_dir),
            config,
            scorers,
            ledger,
            reference_labels,
            run_id: uuid::Uuid::new_v4().to_string(),
            stores: Mutex::new(HashMap::new()),
            store_loads: AtomicUsize::new(0),
        };
        info!(
            run_id = %ctx.run_id,
            output_dir = %ctx.layout.root().display(),
            models = ctx.scorers.len(),
            ledger = ctx.ledger.is_some(),
            "pipeline context ready"
        );
        Ok(ctx)
    }

    /// Replace the scorers (for externally trained models).
    pub fn with_scorers(mut self, scorers: Vec<Box<dyn Scorer>>) -> Self {
        self.scorers = scorers;
        self
    }

    pub fn with_ledger(mut self, ledger: ArtifactLedger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_reference_labels(mut self, labels: ReferenceLabels) -> Self {
        self.reference_labels = Some(labels);
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    pub fn scorers(&self) -> &[Box<dyn Scorer>] {
        &self.scorers
    }

    pub fn ledger(&self) -> Option<&ArtifactLedger> {
        self.ledger.as_ref()
    }

    pub fn reference_labels(&self) -> Option<&ReferenceLabels> {
        self.reference_labels.as_ref()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Event store for `paths`, loaded at most once per context.
    ///
    /// Windows with different sources load concurrently. Windows on the same
    /// sources block on that entry until the first load finishes. A failed
    /// load leaves the entry empty.
    pub fn store_for(&self, paths: &SourcePaths) -> Result<Arc<EventStore>, PipelineError> {
        let slot = Arc::clone(self.stores.lock().entry(paths.clone()).or_default());

        let mut entry = slot.lock();
        if let Some(store) = entry.as_ref() {
            debug!(transactions = %paths.transactions.display(), "event store cache hit");
            return Ok(Arc::clone(store));
        }

        let store = Arc::new(EventStore::load(paths)?);
        self.store_loads.fetch_add(1, Ordering::Relaxed);
        *entry = Some(Arc::clone(&store));
        Ok(store)
    }

    /// Source sets currently held in the cache.
    pub fn cached_stores(&self) -> usize {
        self.stores
            .lock()
            .values()
            .filter(|slot| slot.lock().is_some())
            .count()
    }

    /// Successful loads so far.
    pub fn store_loads(&self) -> usize {
        self.store_loads.load(Ordering::Relaxed)
    }
}
