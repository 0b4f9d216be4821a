//! Artifact I/O
//!
//! # Atomicity
//!
//! Every artifact is rendered in memory, written to `<name>.tmp` in the same
//! directory, flushed and renamed over the final path. A crash leaves either
//! the previous file or the new one, never a partial table.
//!
//! # Manifests
//!
//! The window manifest is written LAST and lists the SHA-256 of every file it
//! covers. Readers resolve window artifacts through the manifest and check the
//! digests, so a table without a matching manifest is never consumed.

use crate::churn::dates::YearMonth;
use crate::churn::error::PipelineError;
use crate::churn::features::{FeatureColumn, FeatureKind, FeatureTable};
use crate::churn::labeler::LabelTable;
use crate::churn::window::WindowSpec;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Date format for dates written into output tables.
const OUTPUT_DATE_FORMAT: &str = "%Y%m%d";

// =============================================================================
// ATOMIC WRITES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDigest {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Write `content` to `path` via temp file and rename.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<ArtifactDigest, PipelineError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    }

    let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    let file = File::create(&temp_path).map_err(|e| PipelineError::io(&temp_path, e))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(content)
        .map_err(|e| PipelineError::io(&temp_path, e))?;
    writer.flush().map_err(|e| PipelineError::io(&temp_path, e))?;
    drop(writer);

    fs::rename(&temp_path, path).map_err(|e| PipelineError::io(path, e))?;
    debug!(path = %path.display(), bytes = content.len(), "artifact written");

    Ok(ArtifactDigest {
        path: path.to_path_buf(),
        sha256: sha256_hex(content),
        bytes: content.len() as u64,
    })
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>, PipelineError> {
    writer
        .into_inner()
        .map_err(|e| PipelineError::io("<csv buffer>", e.into_error()))
}

/// Serialize rows with their serde field names as the header.
pub fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<ArtifactDigest, PipelineError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row)?;
    }
    write_atomic(path, &finish(writer)?)
}

// =============================================================================
// TABLE WRITERS
// =============================================================================

fn format_date(date: Option<NaiveDate>) -> String {
    date.map(|d| d.format(OUTPUT_DATE_FORMAT).to_string())
        .unwrap_or_default()
}

pub fn write_feature_table(path: &Path, table: &FeatureTable) -> Result<ArtifactDigest, PipelineError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let mut header = vec!["msno".to_string()];
    header.extend(table.schema.iter().map(|c| c.name.clone()));
    writer.write_record(&header)?;

    for snapshot in &table.snapshots {
        let mut record = Vec::with_capacity(header.len());
        record.push(snapshot.entity_id.clone());
        for column in &table.schema {
            record.push(
                snapshot
                    .get(&column.name)
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            );
        }
        writer.write_record(&record)?;
    }
    write_atomic(path, &finish(writer)?)
}

pub fn write_label_table(path: &Path, table: &LabelTable) -> Result<ArtifactDigest, PipelineError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "msno",
        "last_expire_date",
        "next_txn_date",
        "days_to_next",
        "is_churn",
        "decision_path",
    ])?;
    for decision in table.iter() {
        let label = &decision.label;
        writer.write_record([
            label.entity_id.clone(),
            format_date(Some(label.last_expiration_date)),
            format_date(label.next_renewal_date),
            label
                .days_to_renewal
                .map(|d| d.to_string())
                .unwrap_or_default(),
            u8::from(label.is_churn).to_string(),
            decision.audit.path.as_str().to_string(),
        ])?;
    }
    write_atomic(path, &finish(writer)?)
}

pub fn write_scores<'a>(
    path: &Path,
    entity_ids: impl Iterator<Item = &'a String>,
    scores: &[f64],
) -> Result<ArtifactDigest, PipelineError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(["msno", "score"])?;
    for (id, score) in entity_ids.zip(scores) {
        writer.write_record([id.as_str(), score.to_string().as_str()])?;
    }
    write_atomic(path, &finish(writer)?)
}

// =============================================================================
// MANIFEST
// =============================================================================

/// Description of one completed backtest window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowManifest {
    pub run_id: String,
    pub window: WindowSpec,
    pub window_tag: String,
    pub cutoff: NaiveDate,
    pub expiry_month: YearMonth,
    pub created_at: String,
    pub schema: Vec<FeatureColumn>,
    pub feature_rows: usize,
    pub label_rows: usize,
    pub evaluated_rows: usize,
    pub models: Vec<String>,
    /// File name (relative to the manifest directory) -> SHA-256.
    pub artifacts: BTreeMap<String, String>,
}

impl WindowManifest {
    pub fn record(&mut self, digest: &ArtifactDigest) {
        let name = digest
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| digest.path.display().to_string());
        self.artifacts.insert(name, digest.sha256.clone());
    }

    /// Digest of everything except the run id and timestamp, used to detect
    /// a re-run that produced different content.
    pub fn content_hash(&self) -> Result<String, PipelineError> {
        let content = serde_json::json!({
            "window": self.window,
            "schema": self.schema,
            "feature_rows": self.feature_rows,
            "label_rows": self.label_rows,
            "evaluated_rows": self.evaluated_rows,
            "models": self.models,
            "artifacts": self.artifacts,
        });
        Ok(sha256_hex(&serde_json::to_vec(&content)?))
    }
}

pub fn write_manifest(path: &Path, manifest: &WindowManifest) -> Result<ArtifactDigest, PipelineError> {
    write_atomic(path, &serde_json::to_vec_pretty(manifest)?)
}

pub fn read_manifest(path: &Path) -> Result<WindowManifest, PipelineError> {
    let bytes = fs::read(path).map_err(|e| PipelineError::io(path, e))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Every `window_*.json` manifest under `root`, ordered by cutoff.
pub fn list_manifests(root: &Path) -> Result<Vec<WindowManifest>, PipelineError> {
    let entries = fs::read_dir(root).map_err(|e| PipelineError::io(root, e))?;
    let mut manifests = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| PipelineError::io(root, e))?.path();
        let is_manifest = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.starts_with("window_") && n.ends_with(".json"));
        if is_manifest {
            manifests.push(read_manifest(&path)?);
        }
    }
    manifests.sort_by_key(|m| (m.cutoff, m.expiry_month));
    Ok(manifests)
}

/// Read an artifact listed in `manifest`, checking its digest.
pub fn read_verified(dir: &Path, manifest: &WindowManifest, file_name: &str) -> Result<Vec<u8>, PipelineError> {
    let path = dir.join(file_name);
    let expected = manifest.artifacts.get(file_name).ok_or_else(|| {
        PipelineError::io(
            &path,
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("not listed in manifest for window {}", manifest.window_tag),
            ),
        )
    })?;
    let bytes = fs::read(&path).map_err(|e| PipelineError::io(&path, e))?;
    let actual = sha256_hex(&bytes);
    if &actual != expected {
        return Err(PipelineError::io(
            &path,
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("sha256 {} does not match manifest {}", actual, expected),
            ),
        ));
    }
    Ok(bytes)
}

// =============================================================================
// TABLE READERS
// =============================================================================

/// One column read back from a persisted table.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Numeric(Vec<f64>),
    Categorical(Vec<String>),
}

/// Read the schema's columns from a persisted feature table.
pub fn read_feature_columns(
    bytes: &[u8],
    schema: &[FeatureColumn],
) -> Result<BTreeMap<String, ColumnData>, PipelineError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(bytes);
    let headers = reader.headers()?.clone();
    let indices: Vec<(usize, &FeatureColumn)> = schema
        .iter()
        .filter_map(|c| headers.iter().position(|h| h == c.name).map(|i| (i, c)))
        .collect();

    let mut columns: BTreeMap<String, ColumnData> = indices
        .iter()
        .map(|(_, c)| {
            let data = match c.kind {
                FeatureKind::Numeric => ColumnData::Numeric(Vec::new()),
                FeatureKind::Categorical => ColumnData::Categorical(Vec::new()),
            };
            (c.name.clone(), data)
        })
        .collect();

    for record in reader.records() {
        let record = record?;
        for (i, column) in &indices {
            let raw = record.get(*i).unwrap_or("");
            match columns.get_mut(&column.name) {
                Some(ColumnData::Numeric(values)) => {
                    if let Ok(v) = raw.parse::<f64>() {
                        if v.is_finite() {
                            values.push(v);
                        }
                    }
                }
                Some(ColumnData::Categorical(values)) => values.push(raw.to_string()),
                None => {}
            }
        }
    }
    Ok(columns)
}

/// Scores column of a persisted `{msno, score}` table.
pub fn read_scores(bytes: &[u8]) -> Result<Vec<f64>, PipelineError> {
    #[derive(Deserialize)]
    struct Row {
        #[allow(dead_code)]
        msno: String,
        score: f64,
    }
    let mut reader = csv::Reader::from_reader(bytes);
    let mut scores = Vec::new();
    for row in reader.deserialize::<Row>() {
        scores.push(row?.score);
    }
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.csv");
        let digest = write_atomic(&path, b"a,b\n1,2\n").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"a,b\n1,2\n");
        assert_eq!(digest.sha256, sha256_hex(b"a,b\n1,2\n"));
        assert!(!dir.path().join("nested/out.csv.tmp").exists());

        write_atomic(&path, b"x\n").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"x\n");
    }

    #[test]
    fn test_read_verified_rejects_tampered_file() {
        let dir = tempfile::tempdir().unwrap();
        let digest = write_atomic(&dir.path().join("scores.csv"), b"msno,score\na,0.5\n").unwrap();
        let window: WindowSpec = "2017-01:2017-02".parse().unwrap();
        let mut manifest = WindowManifest {
            run_id: "r".into(),
            window,
            window_tag: window.tag(),
            cutoff: window.cutoff().date(),
            expiry_month: window.expiry_month,
            created_at: String::new(),
            schema: Vec::new(),
            feature_rows: 0,
            label_rows: 0,
            evaluated_rows: 0,
            models: Vec::new(),
            artifacts: BTreeMap::new(),
        };
        manifest.record(&digest);

        let bytes = read_verified(dir.path(), &manifest, "scores.csv").unwrap();
        assert_eq!(read_scores(&bytes).unwrap(), vec![0.5]);

        fs::write(dir.path().join("scores.csv"), b"msno,score\na,0.9\n").unwrap();
        assert!(read_verified(dir.path(), &manifest, "scores.csv").is_err());
        assert!(read_verified(dir.path(), &manifest, "other.csv").is_err());
    }

    #[test]
    fn test_read_feature_columns_by_kind() {
        let csv = b"msno,secs_30d,city\na,1.5,5\nb,2,\n";
        let schema = vec![
            FeatureColumn {
                name: "secs_30d".into(),
                kind: FeatureKind::Numeric,
            },
            FeatureColumn {
                name: "city".into(),
                kind: FeatureKind::Categorical,
            },
        ];
        let columns = read_feature_columns(csv, &schema).unwrap();
        assert_eq!(columns["secs_30d"], ColumnData::Numeric(vec![1.5, 2.0]));
        assert_eq!(
            columns["city"],
            ColumnData::Categorical(vec!["5".into(), "".into()])
        );
    }
}
