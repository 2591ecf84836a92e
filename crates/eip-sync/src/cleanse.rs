//! Validation & cleansing: raw rows -> validated, deduplicated, enriched curated rows.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use eip_core::{IndicatorRegistry, RawObservation, ValidationError};
use eip_storage::{CuratedUpsert, Database, DerivedFields, StorageError};
use tracing::{debug, info, warn};
use uuid::Uuid;

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%Y/%m/%d"];
const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Confidence for rows outside their indicator's plausibility range.
pub const LOW_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRow {
    pub raw_id: i64,
    pub indicator_code: String,
    pub observation_date: NaiveDate,
    pub value: f64,
    pub batch_id: Uuid,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanseReport {
    pub valid_records: u64,
    pub invalid_records: u64,
    pub duplicates_collapsed: u64,
    pub curated_changed: u64,
    pub derived_updated: u64,
    pub warnings: Vec<String>,
}

pub fn parse_observation_date(text: &str) -> Result<NaiveDate, ValidationError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ValidationError::MissingDate);
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(text, fmt).ok())
        .or_else(|| {
            NaiveDateTime::parse_from_str(text, DATETIME_FORMAT)
                .ok()
                .map(|dt| dt.date())
        })
        .or_else(|| {
            DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.date_naive())
        })
        .ok_or_else(|| ValidationError::MalformedDate(text.to_string()))
}

pub fn parse_value(text: Option<&str>) -> Result<f64, ValidationError> {
    let text = text.map(str::trim).filter(|t| !t.is_empty());
    let Some(text) = text else {
        return Err(ValidationError::MissingValue);
    };
    let value: f64 = text
        .parse()
        .map_err(|_| ValidationError::NonNumericValue(text.to_string()))?;
    if !value.is_finite() {
        return Err(ValidationError::NonFiniteValue(text.to_string()));
    }
    Ok(value)
}

pub fn validate_row(row: &RawObservation, today: NaiveDate) -> Result<ValidatedRow, ValidationError> {
    let value = parse_value(row.value.as_deref())?;
    let date_text = row
        .observation_date
        .as_deref()
        .ok_or(ValidationError::MissingDate)?;
    let observation_date = parse_observation_date(date_text)?;
    if observation_date > today {
        return Err(ValidationError::FutureDate(observation_date.to_string()));
    }
    Ok(ValidatedRow {
        raw_id: row.id,
        indicator_code: row.indicator_code.clone(),
        observation_date,
        value,
        batch_id: row.batch_id,
        ingested_at: row.ingested_at,
    })
}

/// Keep one row per `(indicator_code, observation_date)`: the most recently
/// ingested, ties broken by landing order. Returns the survivors in date order
/// and the number of rows collapsed away.
pub fn collapse_duplicates(rows: Vec<ValidatedRow>) -> (Vec<ValidatedRow>, u64) {
    let total = rows.len();
    let mut latest: BTreeMap<(String, NaiveDate), ValidatedRow> = BTreeMap::new();
    for row in rows {
        let key = (row.indicator_code.clone(), row.observation_date);
        match latest.get(&key) {
            Some(kept) if (kept.ingested_at, kept.raw_id) >= (row.ingested_at, row.raw_id) => {}
            _ => {
                latest.insert(key, row);
            }
        }
    }
    let survivors: Vec<_> = latest.into_values().collect();
    let collapsed = (total - survivors.len()) as u64;
    (survivors, collapsed)
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Previous value and period-over-period change for a date-ordered series.
/// The percentage is null when the previous value is zero or absent.
pub fn compute_period_changes(series: &[(NaiveDate, f64)]) -> Vec<DerivedFields> {
    let mut previous: Option<f64> = None;
    series
        .iter()
        .map(|&(_, value)| {
            let derived = match previous {
                Some(prev) => {
                    let change = value - prev;
                    DerivedFields {
                        previous_value: Some(prev),
                        period_change: Some(change),
                        period_change_percent: (prev != 0.0).then(|| round2(change / prev * 100.0)),
                    }
                }
                None => DerivedFields::default(),
            };
            previous = Some(value);
            derived
        })
        .collect()
}

/// Validate `raw`, collapse duplicates and merge the survivors into the curated tier.
///
/// Per-row and per-indicator problems are counted and reported as warnings;
/// only storage errors are returned.
pub async fn cleanse(
    db: &Database,
    registry: &IndicatorRegistry,
    raw: &[RawObservation],
    today: NaiveDate,
    now: DateTime<Utc>,
) -> Result<CleanseReport, StorageError> {
    let mut report = CleanseReport::default();
    let mut by_indicator: BTreeMap<&str, Vec<&RawObservation>> = BTreeMap::new();
    for row in raw {
        by_indicator.entry(row.indicator_code.as_str()).or_default().push(row);
    }

    for (code, rows) in by_indicator {
        let Some(spec) = registry.get(code) else {
            report.invalid_records += rows.len() as u64;
            report
                .warnings
                .push(format!("{code}: {} raw row(s) for an unregistered indicator", rows.len()));
            continue;
        };

        let mut valid = Vec::with_capacity(rows.len());
        let mut rejections: HashMap<&'static str, u64> = HashMap::new();
        for row in &rows {
            match validate_row(row, today) {
                Ok(v) => valid.push(v),
                Err(err) => {
                    debug!(indicator = code, raw_id = row.id, error = %err, "dropping raw row");
                    *rejections.entry(rejection_kind(&err)).or_default() += 1;
                }
            }
        }
        let invalid = (rows.len() - valid.len()) as u64;
        report.invalid_records += invalid;

        if valid.is_empty() {
            let message = format!("{code}: no valid rows among {} raw row(s)", rows.len());
            warn!(indicator = code, raw = rows.len(), "indicator produced no valid rows");
            report.warnings.push(message);
            continue;
        }
        if invalid > 0 {
            warn!(indicator = code, invalid, ?rejections, "dropped invalid raw rows");
        }

        let (survivors, collapsed) = collapse_duplicates(valid);
        report.duplicates_collapsed += collapsed;
        report.valid_records += survivors.len() as u64;

        let upserts: Vec<CuratedUpsert> = survivors
            .iter()
            .map(|row| {
                let plausible = spec.is_plausible(row.value);
                CuratedUpsert {
                    observation_date: row.observation_date,
                    value: row.value,
                    is_validated: plausible,
                    confidence_score: if plausible { 1.0 } else { LOW_CONFIDENCE },
                    source_batch_id: row.batch_id,
                    source_ingested_at: row.ingested_at,
                }
            })
            .collect();

        let outcome = db
            .merge_curated(code, &upserts, now, compute_period_changes)
            .await?;
        report.curated_changed += outcome.upserted;
        report.derived_updated += outcome.derived_updated;
        info!(
            indicator = code,
            valid = survivors.len(),
            invalid,
            collapsed,
            upserted = outcome.upserted,
            derived_updated = outcome.derived_updated,
            "curated indicator"
        );
    }

    Ok(report)
}

fn rejection_kind(err: &ValidationError) -> &'static str {
    match err {
        ValidationError::MissingValue => "missing_value",
        ValidationError::NonNumericValue(_) => "non_numeric",
        ValidationError::NonFiniteValue(_) => "non_finite",
        ValidationError::MissingDate => "missing_date",
        ValidationError::MalformedDate(_) => "malformed_date",
        ValidationError::FutureDate(_) => "future_date",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eip_core::parse_timestamp;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date")
    }

    fn raw(id: i64, date: Option<&str>, value: Option<&str>, ingested_at: &str) -> RawObservation {
        RawObservation {
            id,
            indicator_code: "KBP1005M".into(),
            observation_date: date.map(str::to_string),
            value: value.map(str::to_string),
            source: "test".into(),
            ingested_at: parse_timestamp(ingested_at).expect("ts"),
            batch_id: Uuid::nil(),
            artifact_hash: None,
        }
    }

    #[test]
    fn date_formats_are_accepted() {
        for text in ["2024-01-31", "2024/01/31", "2024-01-31T00:00:00", "2024-01-31T10:00:00+02:00"] {
            assert_eq!(parse_observation_date(text), Ok(date(2024, 1, 31)), "{text}");
        }
        assert!(matches!(
            parse_observation_date("31 Jan 2024"),
            Err(ValidationError::MalformedDate(_))
        ));
        assert!(matches!(
            parse_observation_date("2024-02-30"),
            Err(ValidationError::MalformedDate(_))
        ));
    }

    #[test]
    fn values_must_be_finite_numbers() {
        assert_eq!(parse_value(Some(" 11.75 ")), Ok(11.75));
        assert_eq!(parse_value(None), Err(ValidationError::MissingValue));
        assert_eq!(parse_value(Some("")), Err(ValidationError::MissingValue));
        assert!(matches!(parse_value(Some("NaN")), Err(ValidationError::NonFiniteValue(_))));
        assert!(matches!(parse_value(Some("inf")), Err(ValidationError::NonFiniteValue(_))));
        assert!(matches!(parse_value(Some("n/a")), Err(ValidationError::NonNumericValue(_))));
    }

    #[test]
    fn future_dates_are_rejected() {
        let today = date(2024, 6, 30);
        let row = raw(1, Some("2024-07-31"), Some("1.0"), "2024-06-30T00:00:00Z");
        assert!(matches!(validate_row(&row, today), Err(ValidationError::FutureDate(_))));
        let row = raw(2, Some("2024-06-30"), Some("1.0"), "2024-06-30T00:00:00Z");
        assert!(validate_row(&row, today).is_ok());
    }

    #[test]
    fn duplicates_prefer_latest_ingestion_then_landing_order() {
        let today = date(2024, 12, 31);
        let rows = vec![
            raw(1, Some("2024-01-31"), Some("10.0"), "2024-02-01T00:00:00Z"),
            raw(2, Some("2024-01-31"), Some("10.5"), "2024-03-01T00:00:00Z"),
            raw(3, Some("2024-01-31"), Some("9.0"), "2024-02-15T00:00:00Z"),
            raw(4, Some("2024-02-29"), Some("11.0"), "2024-03-01T00:00:00Z"),
            raw(5, Some("2024-02-29"), Some("11.5"), "2024-03-01T00:00:00Z"),
        ];
        let valid = rows
            .iter()
            .map(|r| validate_row(r, today).expect("valid"))
            .collect();
        let (survivors, collapsed) = collapse_duplicates(valid);
        assert_eq!(collapsed, 3);
        assert_eq!(survivors.len(), 2);
        assert_eq!(survivors[0].value, 10.5);
        assert_eq!(survivors[1].raw_id, 5);
    }

    #[test]
    fn period_changes_follow_previous_observation() {
        let series = [
            (date(2024, 1, 31), 10.0),
            (date(2024, 2, 29), 12.0),
            (date(2024, 3, 31), 11.0),
        ];
        let derived = compute_period_changes(&series);
        assert_eq!(derived[0], DerivedFields::default());
        assert_eq!(derived[1].previous_value, Some(10.0));
        assert_eq!(derived[1].period_change, Some(2.0));
        assert_eq!(derived[1].period_change_percent, Some(20.0));
        assert_eq!(derived[2].period_change, Some(-1.0));
        assert_eq!(derived[2].period_change_percent, Some(-8.33));
    }

    #[test]
    fn zero_previous_value_yields_null_percent() {
        let series = [(date(2024, 1, 31), 0.0), (date(2024, 2, 29), 5.0)];
        let derived = compute_period_changes(&series);
        assert_eq!(derived[1].period_change, Some(5.0));
        assert_eq!(derived[1].period_change_percent, None);
    }

    #[tokio::test]
    async fn cleanse_counts_rejections_and_flags_implausible_values() {
        let db = Database::open_in_memory().await.expect("db");
        let mut registry = IndicatorRegistry::default();
        if let Some(spec) = registry.indicators.iter_mut().find(|s| s.code == "KBP1005M") {
            spec.min_value = Some(0.0);
        }
        let today = date(2024, 6, 30);
        let now = parse_timestamp("2024-06-30T12:00:00Z").expect("now");
        let rows = vec![
            raw(1, Some("2024-01-31"), Some("11.75"), "2024-06-30T00:00:00Z"),
            raw(2, Some("2024-02-29"), Some("-1.0"), "2024-06-30T00:00:00Z"),
            raw(3, Some("2024-03-31"), None, "2024-06-30T00:00:00Z"),
            raw(4, Some("2024-04-30"), Some("NaN"), "2024-06-30T00:00:00Z"),
            raw(5, Some("2099-01-31"), Some("1.0"), "2024-06-30T00:00:00Z"),
            raw(6, Some("not-a-date"), Some("1.0"), "2024-06-30T00:00:00Z"),
            RawObservation {
                indicator_code: "XYZ".into(),
                ..raw(7, Some("2024-01-31"), Some("1.0"), "2024-06-30T00:00:00Z")
            },
        ];

        let report = cleanse(&db, &registry, &rows, today, now).await.expect("cleanse");
        assert_eq!(report.valid_records, 2);
        assert_eq!(report.invalid_records, 5);
        assert_eq!(report.curated_changed, 2);
        assert_eq!(report.warnings.len(), 1);

        let curated = db.curated_records(Some("KBP1005M")).await.expect("curated");
        assert_eq!(curated.len(), 2);
        assert!(curated[0].is_validated);
        assert_eq!(curated[0].confidence_score, 1.0);
        assert!(!curated[1].is_validated);
        assert_eq!(curated[1].confidence_score, LOW_CONFIDENCE);
    }
}
