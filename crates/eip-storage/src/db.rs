//! SQLite-backed tier tables: raw (append-only), curated and insight (upsert),
//! monthly aggregate (staged rebuild + rename swap), run audit and control flags.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use eip_core::{
    format_date, format_timestamp, is_sql_identifier, parse_date, parse_timestamp,
    ControlFlags, CuratedIndicatorRecord, IndicatorFailure, Insight, InsightOutcome,
    MonthlyAggregate, RawBatch, RawObservation, RunAudit, RunStage, RunStatus, StageCounts,
};
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Column, Row};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decoding {column}: {reason}")]
    Decode { column: String, reason: String },
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("write interrupted: {0}")]
    Interrupted(String),
}

fn decode_err(column: &str, reason: impl Into<String>) -> StorageError {
    StorageError::Decode {
        column: column.to_string(),
        reason: reason.into(),
    }
}

/// Pipeline-level switches persisted in `pipeline_control`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlag {
    Pipeline,
    Ai,
}

impl ControlFlag {
    pub fn key(self) -> &'static str {
        match self {
            ControlFlag::Pipeline => "pipeline_enabled",
            ControlFlag::Ai => "ai_enabled",
        }
    }
}

/// Validated row headed for the curated tier.
#[derive(Debug, Clone, PartialEq)]
pub struct CuratedUpsert {
    pub observation_date: NaiveDate,
    pub value: f64,
    pub is_validated: bool,
    pub confidence_score: f64,
    pub source_batch_id: Uuid,
    pub source_ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DerivedFields {
    pub previous_value: Option<f64>,
    pub period_change: Option<f64>,
    pub period_change_percent: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Rows inserted, or updated because a newer ingestion carried a different value.
    pub upserted: u64,
    /// Rows whose previous value or period change had to be recomputed.
    pub derived_updated: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataFreshness {
    pub latest_observation_date: Option<NaiveDate>,
    pub raw_rows: i64,
    pub curated_rows: i64,
    pub aggregate_rows: i64,
}

const CURATED_UPSERT_SQL: &str = r#"
    INSERT INTO curated_indicators (
        indicator_code, observation_date, value, is_validated, confidence_score,
        source_batch_id, source_ingested_at, created_at, updated_at
    )
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT (indicator_code, observation_date) DO UPDATE SET
        value              = excluded.value,
        is_validated       = excluded.is_validated,
        confidence_score   = excluded.confidence_score,
        source_batch_id    = excluded.source_batch_id,
        source_ingested_at = excluded.source_ingested_at,
        updated_at         = excluded.updated_at
     WHERE excluded.source_ingested_at >= curated_indicators.source_ingested_at
       AND (excluded.value <> curated_indicators.value
            OR excluded.is_validated <> curated_indicators.is_validated
            OR excluded.confidence_score <> curated_indicators.confidence_score)
"#;

const CURATED_COLUMNS: &str = r#"
    indicator_code, observation_date, value, previous_value, period_change,
    period_change_percent, is_validated, confidence_score, source_batch_id,
    source_ingested_at, created_at, updated_at
"#;

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        if let Some(parent) = sqlite_file_parent(url) {
            tokio::fs::create_dir_all(&parent).await?;
        }
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Single-connection in-memory database; useful for tests and dry runs.
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ── raw tier ────────────────────────────────────────────────────────────

    /// Append every point of `batch`. Never touches earlier batches.
    pub async fn append_raw_batch(&self, batch: &RawBatch) -> Result<u64, StorageError> {
        let ingested_at = format_timestamp(batch.ingested_at);
        let batch_id = batch.batch_id.to_string();
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for point in &batch.points {
            let result = sqlx::query(
                r#"
                INSERT INTO raw_observations (
                    indicator_code, observation_date, value, source, ingested_at, batch_id, artifact_hash
                )
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&batch.indicator_code)
            .bind(point.date.as_deref())
            .bind(point.value.as_deref())
            .bind(&batch.source)
            .bind(&ingested_at)
            .bind(&batch_id)
            .bind(batch.artifact_hash.as_deref())
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    pub async fn raw_observations_for_batches(
        &self,
        batch_ids: &[Uuid],
    ) -> Result<Vec<RawObservation>, StorageError> {
        let mut out = Vec::new();
        for batch_id in batch_ids {
            let rows = sqlx::query(
                r#"
                SELECT id, indicator_code, observation_date, value, source, ingested_at, batch_id, artifact_hash
                  FROM raw_observations
                 WHERE batch_id = ?
                 ORDER BY id
                "#,
            )
            .bind(batch_id.to_string())
            .fetch_all(&self.pool)
            .await?;
            for row in rows {
                out.push(raw_from_row(&row)?);
            }
        }
        Ok(out)
    }

    pub async fn all_raw_observations(&self) -> Result<Vec<RawObservation>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, indicator_code, observation_date, value, source, ingested_at, batch_id, artifact_hash
              FROM raw_observations
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(raw_from_row).collect()
    }

    pub async fn raw_count(&self) -> Result<i64, StorageError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM raw_observations")
            .fetch_one(&self.pool)
            .await?)
    }

    // ── curated tier ────────────────────────────────────────────────────────

    /// Upsert `rows` for one indicator and recompute derived fields over that
    /// indicator's full curated history, all in one transaction.
    ///
    /// `derive` receives the date-ordered `(date, value)` series and must return
    /// one entry per element. Rows are only rewritten when something changed.
    pub async fn merge_curated<F>(
        &self,
        indicator_code: &str,
        rows: &[CuratedUpsert],
        now: DateTime<Utc>,
        derive: F,
    ) -> Result<MergeOutcome, StorageError>
    where
        F: Fn(&[(NaiveDate, f64)]) -> Vec<DerivedFields>,
    {
        let now = format_timestamp(now);
        let mut outcome = MergeOutcome::default();
        let mut tx = self.pool.begin().await?;

        for row in rows {
            let result = sqlx::query(CURATED_UPSERT_SQL)
                .bind(indicator_code)
                .bind(format_date(row.observation_date))
                .bind(row.value)
                .bind(row.is_validated)
                .bind(row.confidence_score)
                .bind(row.source_batch_id.to_string())
                .bind(format_timestamp(row.source_ingested_at))
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
            outcome.upserted += result.rows_affected();
        }

        let history = sqlx::query(
            r#"
            SELECT observation_date, value, previous_value, period_change, period_change_percent
              FROM curated_indicators
             WHERE indicator_code = ?
             ORDER BY observation_date
            "#,
        )
        .bind(indicator_code)
        .fetch_all(&mut *tx)
        .await?;

        let mut series = Vec::with_capacity(history.len());
        let mut stored = Vec::with_capacity(history.len());
        for row in &history {
            let date_text: String = row.try_get("observation_date")?;
            let date = parse_date(&date_text)
                .ok_or_else(|| decode_err("observation_date", date_text.clone()))?;
            series.push((date, row.try_get::<f64, _>("value")?));
            stored.push(DerivedFields {
                previous_value: row.try_get("previous_value")?,
                period_change: row.try_get("period_change")?,
                period_change_percent: row.try_get("period_change_percent")?,
            });
        }

        let fresh = derive(&series);
        if fresh.len() != series.len() {
            return Err(StorageError::Interrupted(format!(
                "derived {} rows for {} curated rows of {indicator_code}",
                fresh.len(),
                series.len()
            )));
        }

        for ((date, _), (old, new)) in series.iter().zip(stored.iter().zip(fresh.iter())) {
            if old == new {
                continue;
            }
            sqlx::query(
                r#"
                UPDATE curated_indicators
                   SET previous_value = ?, period_change = ?, period_change_percent = ?, updated_at = ?
                 WHERE indicator_code = ? AND observation_date = ?
                "#,
            )
            .bind(new.previous_value)
            .bind(new.period_change)
            .bind(new.period_change_percent)
            .bind(&now)
            .bind(indicator_code)
            .bind(format_date(*date))
            .execute(&mut *tx)
            .await?;
            outcome.derived_updated += 1;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn curated_records(
        &self,
        indicator_code: Option<&str>,
    ) -> Result<Vec<CuratedIndicatorRecord>, StorageError> {
        let rows = match indicator_code {
            Some(code) => {
                sqlx::query(&format!(
                    "SELECT {CURATED_COLUMNS} FROM curated_indicators WHERE indicator_code = ? ORDER BY observation_date"
                ))
                .bind(code)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {CURATED_COLUMNS} FROM curated_indicators ORDER BY indicator_code, observation_date"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(curated_from_row).collect()
    }

    pub async fn curated_record(
        &self,
        indicator_code: &str,
        observation_date: NaiveDate,
    ) -> Result<Option<CuratedIndicatorRecord>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {CURATED_COLUMNS} FROM curated_indicators WHERE indicator_code = ? AND observation_date = ?"
        ))
        .bind(indicator_code)
        .bind(format_date(observation_date))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(curated_from_row).transpose()
    }

    // ── aggregate tier ──────────────────────────────────────────────────────

    /// `(month start, indicator code, average value)` grouped from the curated tier.
    pub async fn monthly_indicator_averages(
        &self,
        since: Option<NaiveDate>,
    ) -> Result<Vec<(NaiveDate, String, f64)>, StorageError> {
        let since = since.map(format_date).unwrap_or_default();
        let rows = sqlx::query(
            r#"
            SELECT substr(observation_date, 1, 7) || '-01' AS observation_month,
                   indicator_code,
                   AVG(value) AS avg_value
              FROM curated_indicators
             WHERE observation_date >= ?
             GROUP BY observation_month, indicator_code
             ORDER BY observation_month, indicator_code
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let month_text: String = row.try_get("observation_month")?;
            let month = parse_date(&month_text)
                .ok_or_else(|| decode_err("observation_month", month_text.clone()))?;
            out.push((month, row.try_get("indicator_code")?, row.try_get("avg_value")?));
        }
        Ok(out)
    }

    /// Rebuild `monthly_aggregates` in a staging table and swap it in with a
    /// rename. On any error (including an `Err` yielded by `rows`) the staging
    /// table is dropped and the live table is left exactly as it was.
    pub async fn replace_monthly_aggregates<I>(
        &self,
        columns: &[String],
        rows: I,
    ) -> Result<u64, StorageError>
    where
        I: IntoIterator<Item = Result<MonthlyAggregate, StorageError>>,
    {
        for column in columns {
            if !is_sql_identifier(column) || column == "observation_month" {
                return Err(StorageError::InvalidIdentifier(column.clone()));
            }
        }

        let staging = format!("monthly_aggregates_staging_{}", Uuid::new_v4().simple());
        let result = self.build_and_swap(&staging, columns, rows).await;
        if let Err(err) = &result {
            warn!(%staging, error = %err, "aggregate rebuild aborted; dropping staging table");
            if let Err(drop_err) = sqlx::query(&format!("DROP TABLE IF EXISTS \"{staging}\""))
                .execute(&self.pool)
                .await
            {
                warn!(%staging, error = %drop_err, "could not drop staging table");
            }
        }
        result
    }

    async fn build_and_swap<I>(
        &self,
        staging: &str,
        columns: &[String],
        rows: I,
    ) -> Result<u64, StorageError>
    where
        I: IntoIterator<Item = Result<MonthlyAggregate, StorageError>>,
    {
        let column_defs: String = columns.iter().map(|c| format!(", \"{c}\" REAL")).collect();
        let column_list: String = columns.iter().map(|c| format!(", \"{c}\"")).collect();
        let placeholders: String = columns.iter().map(|_| ", ?").collect();

        sqlx::query(&format!(
            "CREATE TABLE \"{staging}\" (observation_month TEXT PRIMARY KEY{column_defs})"
        ))
        .execute(&self.pool)
        .await?;

        let insert_sql = format!(
            "INSERT INTO \"{staging}\" (observation_month{column_list}) VALUES (?{placeholders})"
        );
        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for row in rows {
            let row = row?;
            let mut query = sqlx::query(&insert_sql).bind(format_date(row.observation_month));
            for column in columns {
                query = query.bind(row.values.get(column).copied().flatten());
            }
            query.execute(&mut *tx).await?;
            written += 1;
        }
        tx.commit().await?;

        let mut swap = self.pool.begin().await?;
        sqlx::query("DROP TABLE IF EXISTS monthly_aggregates")
            .execute(&mut *swap)
            .await?;
        sqlx::query(&format!(
            "ALTER TABLE \"{staging}\" RENAME TO monthly_aggregates"
        ))
        .execute(&mut *swap)
        .await?;
        swap.commit().await?;

        info!(rows = written, columns = columns.len(), "monthly aggregate swapped in");
        Ok(written)
    }

    // Aggregate reads are never cached: the swap can change the column set,
    // and a cached statement would keep the old column list.
    pub async fn monthly_aggregates(&self) -> Result<Vec<MonthlyAggregate>, StorageError> {
        let rows = sqlx::query("SELECT * FROM monthly_aggregates ORDER BY observation_month")
            .persistent(false)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(aggregate_from_row).collect()
    }

    /// Most recent `limit` months, returned oldest first.
    pub async fn recent_monthly_aggregates(
        &self,
        limit: u32,
    ) -> Result<Vec<MonthlyAggregate>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM monthly_aggregates ORDER BY observation_month DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .persistent(false)
        .fetch_all(&self.pool)
        .await?;
        let mut out = rows
            .iter()
            .map(aggregate_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        out.reverse();
        Ok(out)
    }

    pub async fn staging_tables(&self) -> Result<Vec<String>, StorageError> {
        Ok(sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'monthly_aggregates_staging_%'",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    // ── insights ────────────────────────────────────────────────────────────

    /// Insert or replace the insight for its analysis date. Returns whether a
    /// row was written; identical content leaves the stored row untouched.
    pub async fn upsert_insight(&self, insight: &Insight) -> Result<bool, StorageError> {
        let generated_json = serde_json::to_string(&insight.generated_json)
            .map_err(|err| decode_err("generated_json", err.to_string()))?;
        let result = sqlx::query(
            r#"
            INSERT INTO insights (analysis_date, generated_json, model_version, load_timestamp)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (analysis_date) DO UPDATE SET
                generated_json = excluded.generated_json,
                model_version  = excluded.model_version,
                load_timestamp = excluded.load_timestamp
             WHERE excluded.generated_json <> insights.generated_json
                OR excluded.model_version <> insights.model_version
            "#,
        )
        .bind(format_date(insight.analysis_date))
        .bind(generated_json)
        .bind(&insight.model_version)
        .bind(format_timestamp(insight.load_timestamp))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn insights(&self) -> Result<Vec<Insight>, StorageError> {
        let rows = sqlx::query(
            "SELECT analysis_date, generated_json, model_version, load_timestamp FROM insights ORDER BY analysis_date",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(insight_from_row).collect()
    }

    pub async fn insight_for(&self, date: NaiveDate) -> Result<Option<Insight>, StorageError> {
        let row = sqlx::query(
            "SELECT analysis_date, generated_json, model_version, load_timestamp FROM insights WHERE analysis_date = ?",
        )
        .bind(format_date(date))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(insight_from_row).transpose()
    }

    // ── run audit ───────────────────────────────────────────────────────────

    pub async fn insert_run_audit(&self, audit: &RunAudit) -> Result<(), StorageError> {
        let failures = serde_json::to_string(&audit.indicator_failures)
            .map_err(|err| decode_err("indicator_failures", err.to_string()))?;
        let warnings = serde_json::to_string(&audit.warnings)
            .map_err(|err| decode_err("warnings", err.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO run_audit (
                run_id, run_timestamp, status, final_stage, failed_stage,
                raw_landed, valid_records, invalid_records, duplicates_collapsed,
                curated_changed, aggregated_rows, insight_produced, insight_outcome,
                indicator_failures, warnings, error_message, duration_seconds
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(audit.run_id.to_string())
        .bind(format_timestamp(audit.run_timestamp))
        .bind(audit.status.as_str())
        .bind(audit.final_stage.as_str())
        .bind(audit.failed_stage.map(RunStage::as_str))
        .bind(count_to_i64(audit.counts.raw_landed))
        .bind(count_to_i64(audit.counts.valid_records))
        .bind(count_to_i64(audit.counts.invalid_records))
        .bind(count_to_i64(audit.counts.duplicates_collapsed))
        .bind(count_to_i64(audit.counts.curated_changed))
        .bind(count_to_i64(audit.counts.aggregated_rows))
        .bind(audit.counts.insight_produced)
        .bind(audit.insight.as_str())
        .bind(failures)
        .bind(warnings)
        .bind(audit.error_message.as_deref())
        .bind(audit.duration_seconds)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_run_audits(&self, limit: u32) -> Result<Vec<RunAudit>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM run_audit ORDER BY run_timestamp DESC, rowid DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(audit_from_row).collect()
    }

    pub async fn run_audit(&self, run_id: Uuid) -> Result<Option<RunAudit>, StorageError> {
        let row = sqlx::query("SELECT * FROM run_audit WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(audit_from_row).transpose()
    }

    // ── control flags ───────────────────────────────────────────────────────

    pub async fn control_flags(&self) -> Result<ControlFlags, StorageError> {
        let rows = sqlx::query(
            "SELECT flag, enabled, reason, updated_at FROM pipeline_control ORDER BY updated_at",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut flags = ControlFlags::default();
        for row in rows {
            let flag: String = row.try_get("flag")?;
            let enabled: bool = row.try_get("enabled")?;
            match flag.as_str() {
                "pipeline_enabled" => flags.pipeline_enabled = enabled,
                "ai_enabled" => flags.ai_enabled = enabled,
                other => warn!(flag = other, "ignoring unknown control flag"),
            }
            flags.reason = row.try_get("reason")?;
            let updated_at: String = row.try_get("updated_at")?;
            flags.updated_at = parse_timestamp(&updated_at);
        }
        Ok(flags)
    }

    pub async fn set_control_flag(
        &self,
        flag: ControlFlag,
        enabled: bool,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_control (flag, enabled, reason, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (flag) DO UPDATE SET
                enabled = excluded.enabled,
                reason = excluded.reason,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(flag.key())
        .bind(enabled)
        .bind(reason)
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn data_freshness(&self) -> Result<DataFreshness, StorageError> {
        let latest: Option<String> =
            sqlx::query_scalar("SELECT MAX(observation_date) FROM curated_indicators")
                .fetch_one(&self.pool)
                .await?;
        Ok(DataFreshness {
            latest_observation_date: latest.as_deref().and_then(parse_date),
            raw_rows: self.raw_count().await?,
            curated_rows: sqlx::query_scalar("SELECT COUNT(*) FROM curated_indicators")
                .fetch_one(&self.pool)
                .await?,
            aggregate_rows: sqlx::query_scalar("SELECT COUNT(*) FROM monthly_aggregates")
                .fetch_one(&self.pool)
                .await?,
        })
    }
}

fn sqlite_file_parent(url: &str) -> Option<std::path::PathBuf> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path.starts_with(":memory:") {
        return None;
    }
    Path::new(path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

fn count_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn count_from_row(row: &SqliteRow, column: &str) -> Result<u64, StorageError> {
    let value: i64 = row.try_get(column)?;
    u64::try_from(value).map_err(|_| decode_err(column, format!("negative count {value}")))
}

fn timestamp_from_row(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, StorageError> {
    let text: String = row.try_get(column)?;
    parse_timestamp(&text).ok_or_else(|| decode_err(column, text))
}

fn uuid_from_row(row: &SqliteRow, column: &str) -> Result<Uuid, StorageError> {
    let text: String = row.try_get(column)?;
    Uuid::parse_str(&text).map_err(|err| decode_err(column, err.to_string()))
}

fn date_from_row(row: &SqliteRow, column: &str) -> Result<NaiveDate, StorageError> {
    let text: String = row.try_get(column)?;
    parse_date(&text).ok_or_else(|| decode_err(column, text))
}

fn raw_from_row(row: &SqliteRow) -> Result<RawObservation, StorageError> {
    Ok(RawObservation {
        id: row.try_get("id")?,
        indicator_code: row.try_get("indicator_code")?,
        observation_date: row.try_get("observation_date")?,
        value: row.try_get("value")?,
        source: row.try_get("source")?,
        ingested_at: timestamp_from_row(row, "ingested_at")?,
        batch_id: uuid_from_row(row, "batch_id")?,
        artifact_hash: row.try_get("artifact_hash")?,
    })
}

fn curated_from_row(row: &SqliteRow) -> Result<CuratedIndicatorRecord, StorageError> {
    Ok(CuratedIndicatorRecord {
        indicator_code: row.try_get("indicator_code")?,
        observation_date: date_from_row(row, "observation_date")?,
        value: row.try_get("value")?,
        previous_value: row.try_get("previous_value")?,
        period_change: row.try_get("period_change")?,
        period_change_percent: row.try_get("period_change_percent")?,
        is_validated: row.try_get("is_validated")?,
        confidence_score: row.try_get("confidence_score")?,
        source_batch_id: uuid_from_row(row, "source_batch_id")?,
        source_ingested_at: timestamp_from_row(row, "source_ingested_at")?,
        created_at: timestamp_from_row(row, "created_at")?,
        updated_at: timestamp_from_row(row, "updated_at")?,
    })
}

fn aggregate_from_row(row: &SqliteRow) -> Result<MonthlyAggregate, StorageError> {
    let mut values = BTreeMap::new();
    for column in row.columns() {
        let name = column.name();
        if name == "observation_month" {
            continue;
        }
        values.insert(name.to_string(), row.try_get::<Option<f64>, _>(name)?);
    }
    Ok(MonthlyAggregate {
        observation_month: date_from_row(row, "observation_month")?,
        values,
    })
}

fn insight_from_row(row: &SqliteRow) -> Result<Insight, StorageError> {
    let json_text: String = row.try_get("generated_json")?;
    Ok(Insight {
        analysis_date: date_from_row(row, "analysis_date")?,
        generated_json: serde_json::from_str(&json_text)
            .map_err(|err| decode_err("generated_json", err.to_string()))?,
        model_version: row.try_get("model_version")?,
        load_timestamp: timestamp_from_row(row, "load_timestamp")?,
    })
}

fn audit_from_row(row: &SqliteRow) -> Result<RunAudit, StorageError> {
    let status: String = row.try_get("status")?;
    let final_stage: String = row.try_get("final_stage")?;
    let failed_stage: Option<String> = row.try_get("failed_stage")?;
    let insight: String = row.try_get("insight_outcome")?;
    let failures: String = row.try_get("indicator_failures")?;
    let warnings: String = row.try_get("warnings")?;

    Ok(RunAudit {
        run_id: uuid_from_row(row, "run_id")?,
        run_timestamp: timestamp_from_row(row, "run_timestamp")?,
        status: RunStatus::parse(&status).ok_or_else(|| decode_err("status", status.clone()))?,
        final_stage: RunStage::parse(&final_stage)
            .ok_or_else(|| decode_err("final_stage", final_stage.clone()))?,
        failed_stage: match failed_stage {
            Some(stage) => Some(
                RunStage::parse(&stage).ok_or_else(|| decode_err("failed_stage", stage.clone()))?,
            ),
            None => None,
        },
        counts: StageCounts {
            raw_landed: count_from_row(row, "raw_landed")?,
            valid_records: count_from_row(row, "valid_records")?,
            invalid_records: count_from_row(row, "invalid_records")?,
            duplicates_collapsed: count_from_row(row, "duplicates_collapsed")?,
            curated_changed: count_from_row(row, "curated_changed")?,
            aggregated_rows: count_from_row(row, "aggregated_rows")?,
            insight_produced: row.try_get("insight_produced")?,
        },
        insight: InsightOutcome::parse(&insight)
            .ok_or_else(|| decode_err("insight_outcome", insight.clone()))?,
        indicator_failures: serde_json::from_str::<Vec<IndicatorFailure>>(&failures)
            .map_err(|err| decode_err("indicator_failures", err.to_string()))?,
        warnings: serde_json::from_str(&warnings)
            .map_err(|err| decode_err("warnings", err.to_string()))?,
        error_message: row.try_get("error_message")?,
        duration_seconds: row.try_get("duration_seconds")?,
    })
}
