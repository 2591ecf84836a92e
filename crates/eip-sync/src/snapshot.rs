//! Parquet export of the monthly aggregate after each successful swap.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use eip_core::{format_date, MonthlyAggregate};
use eip_storage::ArtifactStore;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub rows: usize,
    pub sha256: String,
    pub bytes: u64,
}

pub fn snapshot_dir(artifacts_dir: &Path, run_id: Uuid) -> PathBuf {
    artifacts_dir.join("snapshots").join(run_id.to_string())
}

/// Write `monthly_aggregates.parquet` and `manifest.json` under
/// `<artifacts_dir>/snapshots/<run_id>/`. Returns the manifest path.
pub fn export_monthly_snapshot(
    artifacts_dir: &Path,
    run_id: Uuid,
    columns: &[String],
    rows: &[MonthlyAggregate],
) -> Result<PathBuf> {
    let dir = snapshot_dir(artifacts_dir, run_id);
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    let parquet_path = dir.join("monthly_aggregates.parquet");
    write_parquet(&parquet_path, monthly_record_batch(columns, rows)?)?;

    let bytes = std::fs::read(&parquet_path)
        .with_context(|| format!("reading {}", parquet_path.display()))?;
    let manifest = SnapshotManifest {
        schema_version: 1,
        run_id,
        files: vec![SnapshotManifestFile {
            name: "monthly_aggregates".to_string(),
            path: "monthly_aggregates.parquet".to_string(),
            rows: rows.len(),
            sha256: ArtifactStore::sha256_hex(&bytes),
            bytes: bytes.len() as u64,
        }],
    };

    let manifest_path = dir.join("manifest.json");
    let json = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    std::fs::write(&manifest_path, json)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn monthly_record_batch(columns: &[String], rows: &[MonthlyAggregate]) -> Result<RecordBatch> {
    let mut fields = vec![ArrowField::new("observation_month", DataType::Utf8, false)];
    fields.extend(
        columns
            .iter()
            .map(|c| ArrowField::new(c.as_str(), DataType::Float64, true)),
    );
    let schema = Arc::new(Schema::new(fields));

    let months = StringArray::from(
        rows.iter()
            .map(|r| Some(format_date(r.observation_month)))
            .collect::<Vec<_>>(),
    );
    let mut arrays: Vec<ArrayRef> = vec![Arc::new(months)];
    for column in columns {
        let values = Float64Array::from(
            rows.iter()
                .map(|r| r.values.get(column).copied().flatten())
                .collect::<Vec<_>>(),
        );
        arrays.push(Arc::new(values));
    }

    RecordBatch::try_new(schema, arrays).context("building monthly aggregate record batch")
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[test]
    fn snapshot_writes_parquet_and_manifest() {
        let dir = tempdir().expect("tempdir");
        let run_id = Uuid::new_v4();
        let columns = vec!["prime_rate".to_string(), "headline_cpi".to_string()];
        let rows = vec![
            MonthlyAggregate {
                observation_month: NaiveDate::from_ymd_opt(2024, 1, 1).expect("date"),
                values: BTreeMap::from([
                    ("prime_rate".to_string(), Some(11.75)),
                    ("headline_cpi".to_string(), None),
                ]),
            },
            MonthlyAggregate {
                observation_month: NaiveDate::from_ymd_opt(2024, 2, 1).expect("date"),
                values: BTreeMap::from([
                    ("prime_rate".to_string(), Some(11.75)),
                    ("headline_cpi".to_string(), Some(5.6)),
                ]),
            },
        ];

        let manifest_path =
            export_monthly_snapshot(dir.path(), run_id, &columns, &rows).expect("export");
        let manifest: SnapshotManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).expect("read manifest"))
                .expect("parse manifest");
        assert_eq!(manifest.run_id, run_id);
        assert_eq!(manifest.files[0].rows, 2);

        let parquet_path = snapshot_dir(dir.path(), run_id).join("monthly_aggregates.parquet");
        let bytes = std::fs::read(&parquet_path).expect("read parquet");
        assert_eq!(manifest.files[0].sha256, ArtifactStore::sha256_hex(&bytes));

        let reader = SerializedFileReader::new(File::open(&parquet_path).expect("open"))
            .expect("reader");
        let metadata = reader.metadata();
        assert_eq!(metadata.file_metadata().num_rows(), 2);
        assert_eq!(metadata.file_metadata().schema_descr().num_columns(), 3);
    }
}
