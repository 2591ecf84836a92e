//! Monthly average-then-pivot rebuild of the aggregate tier.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use eip_core::{window_start, IndicatorRegistry, MonthlyAggregate};
use eip_storage::{Database, StorageError};
use tracing::info;

/// Pivot `(month, indicator, average)` triples into one row per month with a
/// column per enabled indicator. Months without any tracked value are dropped;
/// missing indicators stay `None`.
pub fn pivot_monthly(
    averages: &[(NaiveDate, String, f64)],
    registry: &IndicatorRegistry,
) -> Vec<MonthlyAggregate> {
    let columns: HashMap<&str, &str> = registry
        .enabled()
        .map(|spec| (spec.code.as_str(), spec.column.as_str()))
        .collect();
    let empty_row: BTreeMap<String, Option<f64>> =
        registry.columns().into_iter().map(|c| (c, None)).collect();

    let mut months: BTreeMap<NaiveDate, BTreeMap<String, Option<f64>>> = BTreeMap::new();
    for (month, code, avg) in averages {
        let Some(column) = columns.get(code.as_str()) else {
            continue;
        };
        months
            .entry(*month)
            .or_insert_with(|| empty_row.clone())
            .insert((*column).to_string(), Some(*avg));
    }

    months
        .into_iter()
        .map(|(observation_month, values)| MonthlyAggregate {
            observation_month,
            values,
        })
        .collect()
}

/// Recompute the whole aggregate from the curated tier and swap it in.
/// `window_months` bounds the history read, counted back from `today`.
pub async fn rebuild_monthly_aggregates(
    db: &Database,
    registry: &IndicatorRegistry,
    window_months: Option<u32>,
    today: NaiveDate,
) -> Result<u64, StorageError> {
    let since = window_months.map(|months| window_start(today, months));
    let averages = db.monthly_indicator_averages(since).await?;
    let rows = pivot_monthly(&averages, registry);
    let columns = registry.columns();
    let written = db
        .replace_monthly_aggregates(&columns, rows.into_iter().map(Ok))
        .await?;
    info!(rows = written, since = ?since, "rebuilt monthly aggregate");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eip_core::{parse_timestamp, IndicatorSpec};
    use eip_storage::CuratedUpsert;
    use uuid::Uuid;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date")
    }

    #[test]
    fn pivot_keeps_partial_months_and_drops_untracked() {
        let mut registry = IndicatorRegistry::default();
        registry.indicators.push(IndicatorSpec {
            enabled: false,
            ..IndicatorSpec::new("KBP9999M", "retired", "Retired")
        });
        let averages = vec![
            (date(2024, 1, 1), "KBP1005M".to_string(), 11.75),
            (date(2024, 1, 1), "KBP6006M".to_string(), 5.3),
            (date(2024, 2, 1), "KBP1004M".to_string(), 18.9),
            (date(2024, 3, 1), "KBP9999M".to_string(), 1.0),
        ];
        let rows = pivot_monthly(&averages, &registry);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].values["prime_rate"], Some(11.75));
        assert_eq!(rows[0].values["headline_cpi"], Some(5.3));
        assert_eq!(rows[0].values["zar_usd_exchange_rate"], None);
        assert_eq!(rows[1].values["prime_rate"], None);
        assert_eq!(rows[1].values.len(), 3);
    }

    #[tokio::test]
    async fn rebuild_averages_within_month() {
        let db = Database::open_in_memory().await.expect("db");
        let registry = IndicatorRegistry::default();
        let now = parse_timestamp("2024-06-30T12:00:00Z").expect("now");
        let rows: Vec<CuratedUpsert> = [(date(2024, 1, 10), 10.0), (date(2024, 1, 20), 12.0), (date(2024, 2, 10), 7.0)]
            .into_iter()
            .map(|(d, value)| CuratedUpsert {
                observation_date: d,
                value,
                is_validated: true,
                confidence_score: 1.0,
                source_batch_id: Uuid::nil(),
                source_ingested_at: now,
            })
            .collect();
        db.merge_curated("KBP1004M", &rows, now, crate::cleanse::compute_period_changes)
            .await
            .expect("merge");

        let written = rebuild_monthly_aggregates(&db, &registry, None, date(2024, 6, 30))
            .await
            .expect("rebuild");
        assert_eq!(written, 2);
        let aggregates = db.monthly_aggregates().await.expect("aggregates");
        assert_eq!(aggregates[0].observation_month, date(2024, 1, 1));
        assert_eq!(aggregates[0].values["zar_usd_exchange_rate"], Some(11.0));
        assert_eq!(aggregates[0].values["prime_rate"], None);

        let windowed = rebuild_monthly_aggregates(&db, &registry, Some(5), date(2024, 6, 30))
            .await
            .expect("windowed");
        assert_eq!(windowed, 1);
    }
}
