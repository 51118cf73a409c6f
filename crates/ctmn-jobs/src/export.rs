//! Daily sent-records export: one Parquet part per run plus a per-day manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::NaiveDateTime;
use ctmn_core::{iso_seconds, Environment};
use ctmn_storage::{write_atomic, JobPaths};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

pub const MANIFEST_FILE_NAME: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentManifest {
    pub schema_version: u32,
    pub files: Vec<SentManifestFile>,
}

impl Default for SentManifest {
    fn default() -> Self {
        Self {
            schema_version: 1,
            files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SentRecord {
    values: Vec<Option<String>>,
    recipient: String,
    subject: String,
}

/// Rows notified during one run. Every row carries the job's business columns
/// followed by `recipient` and `subject`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRecords {
    columns: Vec<&'static str>,
    rows: Vec<SentRecord>,
}

impl SentRecords {
    pub fn new(columns: &[&'static str]) -> Self {
        Self {
            columns: columns.to_vec(),
            rows: Vec::new(),
        }
    }

    /// `values` must line up with the columns given to [`SentRecords::new`].
    pub fn push(&mut self, values: Vec<Option<String>>, recipient: &str, subject: &str) {
        debug_assert_eq!(values.len(), self.columns.len());
        self.rows.push(SentRecord {
            values,
            recipient: recipient.to_string(),
            subject: subject.to_string(),
        });
    }

    pub fn columns(&self) -> &[&'static str] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[cfg(test)]
    pub(crate) fn values(&self, row: usize) -> &[Option<String>] {
        &self.rows[row].values
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn to_batch(&self, run: &RunStamp) -> Result<RecordBatch> {
        let mut fields: Vec<ArrowField> = self
            .columns
            .iter()
            .map(|c| ArrowField::new(*c, DataType::Utf8, true))
            .collect();
        for name in ["recipient", "subject", "job_run_id", "environment", "run_timestamp"] {
            fields.push(ArrowField::new(name, DataType::Utf8, false));
        }

        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(fields.len());
        for idx in 0..self.columns.len() {
            let column = StringArray::from(
                self.rows
                    .iter()
                    .map(|r| r.values.get(idx).cloned().flatten())
                    .collect::<Vec<_>>(),
            );
            arrays.push(Arc::new(column));
        }
        let run_id = run.run_id.to_string();
        let environment = run.environment.to_string();
        let timestamp = iso_seconds(run.run_timestamp);
        arrays.push(Arc::new(StringArray::from(
            self.rows.iter().map(|r| Some(r.recipient.as_str())).collect::<Vec<_>>(),
        )));
        arrays.push(Arc::new(StringArray::from(
            self.rows.iter().map(|r| Some(r.subject.as_str())).collect::<Vec<_>>(),
        )));
        for constant in [&run_id, &environment, &timestamp] {
            arrays.push(Arc::new(StringArray::from(vec![Some(constant.as_str()); self.rows.len()])));
        }

        RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).context("building sent-records batch")
    }
}

/// Identifies the run that produced an export.
#[derive(Debug, Clone, Copy)]
pub struct RunStamp {
    pub run_id: Uuid,
    pub environment: Environment,
    pub run_timestamp: NaiveDateTime,
}

/// Writes `records` as `<job>/sent/<day>/<run_id>.parquet` and appends it to
/// that day's manifest. Returns `None` without touching disk when nothing was sent.
pub async fn write_sent_records(
    paths: &JobPaths,
    run: &RunStamp,
    records: &SentRecords,
) -> Result<Option<PathBuf>> {
    if records.is_empty() {
        return Ok(None);
    }
    let day_dir = paths.sent_records_dir(run.run_timestamp.date());
    fs::create_dir_all(&day_dir)
        .await
        .with_context(|| format!("creating {}", day_dir.display()))?;

    let name = run.run_id.to_string();
    let part_path = day_dir.join(format!("{name}.parquet"));
    write_parquet(&part_path, records.to_batch(run)?)?;

    let manifest_path = day_dir.join(MANIFEST_FILE_NAME);
    let mut manifest = load_manifest(&manifest_path).await?;
    manifest.files.push(manifest_entry(&name, &day_dir, &part_path, records.len())?);
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing sent-records manifest")?;
    write_atomic(&manifest_path, &bytes).await?;

    Ok(Some(part_path))
}

pub async fn load_manifest(path: &Path) -> Result<SentManifest> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(SentManifest::default()),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn manifest_entry(name: &str, day_dir: &Path, path: &Path, rows: usize) -> Result<SentManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path.strip_prefix(day_dir).unwrap_or(path).display().to_string();
    Ok(SentManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}
