//! Window Artifact Ledger
//!
//! SQLite-based append-only record of every backtest window a run completed.
//! Rows are never updated or deleted: re-running a window inserts a new row
//! under the new run id, which keeps the history of what each run produced.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE window_artifacts (
//!     run_id TEXT NOT NULL,
//!     window_tag TEXT NOT NULL,
//!     cutoff TEXT NOT NULL,
//!     expiry_month TEXT NOT NULL,
//!     content_hash TEXT NOT NULL,
//!     persisted_at INTEGER NOT NULL,
//!     manifest_json TEXT NOT NULL,
//!     PRIMARY KEY (run_id, window_tag)
//! ) WITHOUT ROWID;
//! ```

use crate::churn::artifacts::WindowManifest;
use crate::churn::error::PipelineError;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Schema version for migrations.
/// - v1: Initial schema
const SCHEMA_VERSION: u32 = 1;

/// Result of recording one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerOutcome {
    /// Hash recorded for the same window by the most recent earlier run.
    pub previous_hash: Option<String>,
    pub content_hash: String,
}

impl LedgerOutcome {
    pub fn changed(&self) -> bool {
        self.previous_hash
            .as_ref()
            .map_or(false, |prev| *prev != self.content_hash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRow {
    pub run_id: String,
    pub window_tag: String,
    pub content_hash: String,
    pub persisted_at: i64,
}

/// Append-only window ledger.
pub struct ArtifactLedger {
    conn: Arc<Mutex<Connection>>,
}

impl ArtifactLedger {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        if let Some(parent) = path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
        let ledger = Self {
            conn: Arc::new(Mutex::new(Connection::open(path)?)),
        };
        ledger.initialize_schema()?;
        Ok(ledger)
    }

    /// In-memory ledger (for testing).
    pub fn in_memory() -> Result<Self, PipelineError> {
        let ledger = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        ledger.initialize_schema()?;
        Ok(ledger)
    }

    fn initialize_schema(&self) -> Result<(), PipelineError> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .optional()?;

        match current_version {
            None => {
                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS window_artifacts (
                        run_id TEXT NOT NULL,
                        window_tag TEXT NOT NULL,
                        cutoff TEXT NOT NULL,
                        expiry_month TEXT NOT NULL,
                        content_hash TEXT NOT NULL,
                        persisted_at INTEGER NOT NULL,
                        manifest_json TEXT NOT NULL,
                        PRIMARY KEY (run_id, window_tag)
                    ) WITHOUT ROWID;

                    CREATE INDEX IF NOT EXISTS idx_window_artifacts_tag
                        ON window_artifacts(window_tag, persisted_at DESC);
                    "#,
                )?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    [SCHEMA_VERSION],
                )?;
                info!("Created artifact ledger schema v{}", SCHEMA_VERSION);
            }
            Some(v) if v == SCHEMA_VERSION => {
                debug!("Artifact ledger schema at v{}", SCHEMA_VERSION);
            }
            Some(v) => {
                warn!(
                    "Artifact ledger schema version mismatch: expected {}, got {}",
                    SCHEMA_VERSION, v
                );
            }
        }
        Ok(())
    }

    pub fn exists(&self, run_id: &str, window_tag: &str) -> Result<bool, PipelineError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM window_artifacts WHERE run_id = ? AND window_tag = ?",
            params![run_id, window_tag],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Hash recorded for `window_tag` by the most recent run other than `run_id`.
    pub fn previous_hash(
        &self,
        window_tag: &str,
        run_id: &str,
    ) -> Result<Option<String>, PipelineError> {
        let conn = self.conn.lock();
        let hash = conn
            .query_row(
                r#"SELECT content_hash FROM window_artifacts
                   WHERE window_tag = ? AND run_id != ?
                   ORDER BY persisted_at DESC, run_id DESC LIMIT 1"#,
                params![window_tag, run_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    /// Append a completed window. Rejects a second insert for the same
    /// `(run_id, window_tag)`.
    pub fn record(&self, manifest: &WindowManifest) -> Result<LedgerOutcome, PipelineError> {
        if self.exists(&manifest.run_id, &manifest.window_tag)? {
            return Err(PipelineError::ArtifactExists {
                run_id: manifest.run_id.clone(),
                window_tag: manifest.window_tag.clone(),
            });
        }

        let content_hash = manifest.content_hash()?;
        let previous_hash = self.previous_hash(&manifest.window_tag, &manifest.run_id)?;
        let manifest_json = serde_json::to_string(manifest)?;

        {
            let conn = self.conn.lock();
            conn.execute(
                r#"INSERT INTO window_artifacts (
                    run_id, window_tag, cutoff, expiry_month, content_hash,
                    persisted_at, manifest_json
                ) VALUES (?, ?, ?, ?, ?, ?, ?)"#,
                params![
                    manifest.run_id,
                    manifest.window_tag,
                    manifest.cutoff.to_string(),
                    manifest.expiry_month.to_string(),
                    content_hash,
                    chrono::Utc::now().timestamp(),
                    manifest_json,
                ],
            )?;
        }

        let outcome = LedgerOutcome {
            previous_hash,
            content_hash,
        };
        if outcome.changed() {
            warn!(
                window = %manifest.window_tag,
                run_id = %manifest.run_id,
                previous = ?outcome.previous_hash,
                current = %outcome.content_hash,
                "window re-run produced different artifacts"
            );
        }
        debug!(window = %manifest.window_tag, run_id = %manifest.run_id, "window recorded in ledger");
        Ok(outcome)
    }

    /// All rows for one window, newest first.
    pub fn history(&self, window_tag: &str) -> Result<Vec<LedgerRow>, PipelineError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"SELECT run_id, window_tag, content_hash, persisted_at FROM window_artifacts
               WHERE window_tag = ? ORDER BY persisted_at DESC, run_id DESC"#,
        )?;
        let rows = stmt
            .query_map([window_tag], |row| {
                Ok(LedgerRow {
                    run_id: row.get(0)?,
                    window_tag: row.get(1)?,
                    content_hash: row.get(2)?,
                    persisted_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Stored manifest for one row.
    pub fn manifest(
        &self,
        run_id: &str,
        window_tag: &str,
    ) -> Result<Option<WindowManifest>, PipelineError> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT manifest_json FROM window_artifacts WHERE run_id = ? AND window_tag = ?",
                params![run_id, window_tag],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(PipelineError::from))
            .transpose()
    }
}

// =============================================================================
// TESTS
// =============================================================================
