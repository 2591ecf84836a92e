use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use eip_adapters::{FetchContext, FetchedSeries, SeriesRequest, SourceAdapter};
use eip_core::{
    FailureKind, IndicatorRegistry, InsightOutcome, InsightServiceError, RunStage, RunStatus,
    SourceError, SourcePoint,
};
use eip_storage::Database;
use eip_sync::{
    apply_control, ControlAction, InsightGenerator, InsightRequest, Pipeline, PipelineConfig,
    TriggerOutcome,
};
use tempfile::TempDir;

type Script = Result<Vec<(Option<&'static str>, Option<&'static str>)>, &'static str>;

/// Serves whatever each indicator is currently scripted to return.
#[derive(Default)]
struct ScriptedSource {
    series: Mutex<HashMap<String, Script>>,
}

impl ScriptedSource {
    fn set(&self, code: &str, script: Script) {
        self.series
            .lock()
            .expect("script lock")
            .insert(code.to_string(), script);
    }
}

#[async_trait]
impl SourceAdapter for ScriptedSource {
    fn source_id(&self) -> &str {
        "scripted"
    }

    async fn fetch_series(
        &self,
        ctx: &FetchContext,
        request: &SeriesRequest,
    ) -> Result<FetchedSeries, SourceError> {
        let script = self
            .series
            .lock()
            .expect("script lock")
            .get(&request.indicator_code)
            .cloned()
            .unwrap_or(Err("not scripted"));
        let points = script.map_err(|reason| SourceError::Unavailable {
            indicator: request.indicator_code.clone(),
            reason: reason.to_string(),
        })?;
        let points: Vec<SourcePoint> = points
            .into_iter()
            .map(|(date, value)| SourcePoint {
                date: date.map(str::to_string),
                value: value.map(str::to_string),
            })
            .collect();
        let raw_body = serde_json::to_vec(&points).expect("encode body");
        Ok(FetchedSeries {
            indicator_code: request.indicator_code.clone(),
            source: "scripted".to_string(),
            url: format!("test://{}", request.indicator_code),
            content_type: "application/json".to_string(),
            raw_body,
            fetched_at: ctx.fetched_at,
            points,
        })
    }
}

struct SlowInsight {
    delay: Duration,
}

#[async_trait]
impl InsightGenerator for SlowInsight {
    fn model_version(&self) -> &str {
        "slow-test"
    }

    async fn generate_insight(&self, _request: &InsightRequest) -> Result<String, InsightServiceError> {
        tokio::time::sleep(self.delay).await;
        Ok(r#"{"trend_summary":"late"}"#.to_string())
    }
}

struct CannedInsight;

#[async_trait]
impl InsightGenerator for CannedInsight {
    fn model_version(&self) -> &str {
        "canned-test"
    }

    async fn generate_insight(&self, request: &InsightRequest) -> Result<String, InsightServiceError> {
        assert!(!request.rows.is_empty());
        Ok("```json\n{\"trend_summary\":\"rates steady\",\"key_events\":\"prime flat\"}\n```".to_string())
    }
}

struct Harness {
    pipeline: Pipeline,
    source: Arc<ScriptedSource>,
    _artifacts: TempDir,
}

async fn harness(configure: impl FnOnce(&mut PipelineConfig)) -> Harness {
    let artifacts = tempfile::tempdir().expect("tempdir");
    let mut config = PipelineConfig::default();
    config.artifacts_dir = artifacts.path().to_path_buf();
    config.export_snapshots = false;
    configure(&mut config);

    let source = Arc::new(ScriptedSource::default());
    let db = Database::open_in_memory().await.expect("db");
    let pipeline = Pipeline::new(db, IndicatorRegistry::default(), source.clone(), config);
    Harness {
        pipeline,
        source,
        _artifacts: artifacts,
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

fn script_all_good(source: &ScriptedSource) {
    source.set(
        "KBP1005M",
        Ok(vec![
            (Some("2024-01-31"), Some("11.75")),
            (Some("2024-02-29"), Some("11.75")),
        ]),
    );
    source.set(
        "KBP6006M",
        Ok(vec![
            (Some("2024-01-31"), Some("5.3")),
            (Some("2024-02-29"), Some("5.6")),
        ]),
    );
    source.set(
        "KBP1004M",
        Ok(vec![
            (Some("2024-01-15"), Some("18.50")),
            (Some("2024-01-31"), Some("18.70")),
            (Some("2024-02-29"), Some("19.10")),
        ]),
    );
}

#[tokio::test]
async fn rerunning_identical_data_leaves_curated_and_aggregate_unchanged() {
    let h = harness(|_| {}).await;
    script_all_good(&h.source);

    let first = h.pipeline.run_once().await;
    assert_eq!(first.status, RunStatus::Success);
    assert_eq!(first.final_stage, RunStage::Completed);
    assert_eq!(first.counts.raw_landed, 7);
    assert_eq!(first.counts.valid_records, 7);
    assert_eq!(first.counts.curated_changed, 7);
    assert_eq!(first.counts.aggregated_rows, 2);
    assert_eq!(first.insight, InsightOutcome::Skipped);

    let curated_before = h.pipeline.db().curated_records(None).await.expect("curated");
    let aggregate_before = h.pipeline.db().monthly_aggregates().await.expect("aggregate");

    let second = h.pipeline.run_once().await;
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(second.counts.raw_landed, 7);
    assert_eq!(second.counts.curated_changed, 0);

    let db = h.pipeline.db();
    assert_eq!(db.raw_count().await.expect("raw"), 14);
    assert_eq!(db.curated_records(None).await.expect("curated"), curated_before);
    assert_eq!(db.monthly_aggregates().await.expect("aggregate"), aggregate_before);
    assert_eq!(db.recent_run_audits(10).await.expect("audits").len(), 2);
}

#[tokio::test]
async fn aggregate_averages_each_month_per_indicator() {
    let h = harness(|_| {}).await;
    script_all_good(&h.source);
    h.pipeline.run_once().await;

    let rows = h.pipeline.db().monthly_aggregates().await.expect("aggregate");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].observation_month, date(2024, 1, 1));
    let january = &rows[0].values;
    assert_eq!(january.get("prime_rate").copied().flatten(), Some(11.75));
    assert_eq!(january.get("headline_cpi").copied().flatten(), Some(5.3));
    let fx = january
        .get("zar_usd_exchange_rate")
        .copied()
        .flatten()
        .expect("fx average");
    assert!((fx - 18.6).abs() < 1e-9);
}

#[tokio::test]
async fn invalid_rows_are_counted_and_dropped() {
    let h = harness(|_| {}).await;
    script_all_good(&h.source);
    h.source.set(
        "KBP1005M",
        Ok(vec![
            (Some("2024-01-31"), None),
            (Some("2024-02-29"), Some("n/a")),
            (Some("31/31/2024"), Some("11.75")),
            (Some("2999-01-31"), Some("11.75")),
            (None, Some("11.75")),
            (Some("2024-03-31"), Some("11.50")),
        ]),
    );

    let audit = h.pipeline.run_once().await;
    assert_eq!(audit.status, RunStatus::Success);
    assert_eq!(audit.counts.raw_landed, 11);
    assert_eq!(audit.counts.invalid_records, 5);
    assert_eq!(audit.counts.valid_records, 6);

    let prime = h
        .pipeline
        .db()
        .curated_records(Some("KBP1005M"))
        .await
        .expect("curated");
    assert_eq!(prime.len(), 1);
    assert_eq!(prime[0].observation_date, date(2024, 3, 31));
}

#[tokio::test]
async fn duplicate_dates_in_a_batch_collapse_to_one_curated_row() {
    let h = harness(|_| {}).await;
    script_all_good(&h.source);
    h.source.set(
        "KBP1005M",
        Ok(vec![
            (Some("2024-01-31"), Some("11.50")),
            (Some("2024-01-31"), Some("11.75")),
        ]),
    );

    let audit = h.pipeline.run_once().await;
    assert_eq!(audit.counts.duplicates_collapsed, 1);

    let prime = h
        .pipeline
        .db()
        .curated_records(Some("KBP1005M"))
        .await
        .expect("curated");
    assert_eq!(prime.len(), 1);
    assert_eq!(prime[0].value, 11.75);
}

#[tokio::test]
async fn period_changes_follow_the_curated_series() {
    let h = harness(|_| {}).await;
    script_all_good(&h.source);
    h.source.set(
        "KBP1005M",
        Ok(vec![
            (Some("2024-01-31"), Some("10")),
            (Some("2024-02-29"), Some("12")),
            (Some("2024-03-31"), Some("11")),
        ]),
    );
    h.source.set(
        "KBP6006M",
        Ok(vec![(Some("2024-01-31"), Some("0")), (Some("2024-02-29"), Some("5"))]),
    );
    h.pipeline.run_once().await;

    let db = h.pipeline.db();
    let prime = db.curated_records(Some("KBP1005M")).await.expect("prime");
    let percents: Vec<_> = prime.iter().map(|r| r.period_change_percent).collect();
    assert_eq!(percents, vec![None, Some(20.0), Some(-8.33)]);
    assert_eq!(prime[2].previous_value, Some(12.0));
    assert_eq!(prime[2].period_change, Some(-1.0));

    let cpi = db.curated_records(Some("KBP6006M")).await.expect("cpi");
    assert_eq!(cpi[1].period_change, Some(5.0));
    assert_eq!(cpi[1].period_change_percent, None);
}

#[tokio::test]
async fn corrected_value_replaces_curated_but_raw_keeps_both() {
    let h = harness(|_| {}).await;
    script_all_good(&h.source);
    h.source.set(
        "KBP1005M",
        Ok(vec![
            (Some("2024-01-31"), Some("11.75")),
            (Some("2024-02-29"), Some("11.75")),
            (Some("2024-03-31"), Some("11.75")),
        ]),
    );
    h.pipeline.run_once().await;

    h.source.set("KBP1005M", Ok(vec![(Some("2024-02-29"), Some("11.50"))]));
    let audit = h.pipeline.run_once().await;
    assert_eq!(audit.status, RunStatus::Success);
    assert_eq!(audit.counts.curated_changed, 1);

    let db = h.pipeline.db();
    let corrected = db
        .curated_record("KBP1005M", date(2024, 2, 29))
        .await
        .expect("query")
        .expect("row");
    assert_eq!(corrected.value, 11.5);
    assert_eq!(corrected.period_change, Some(-0.25));

    let following = db
        .curated_record("KBP1005M", date(2024, 3, 31))
        .await
        .expect("query")
        .expect("row");
    assert_eq!(following.previous_value, Some(11.5));
    assert_eq!(following.period_change, Some(0.25));
    assert_eq!(following.period_change_percent, Some(2.17));
    assert_eq!(db.curated_records(Some("KBP1005M")).await.expect("curated").len(), 3);

    let raw_feb: Vec<_> = db
        .all_raw_observations()
        .await
        .expect("raw")
        .into_iter()
        .filter(|r| r.indicator_code == "KBP1005M" && r.observation_date.as_deref() == Some("2024-02-29"))
        .collect();
    assert_eq!(raw_feb.len(), 2);

    let february = db.monthly_aggregates().await.expect("aggregate")[1].clone();
    assert_eq!(february.values.get("prime_rate").copied().flatten(), Some(11.5));
}

#[tokio::test]
async fn one_unavailable_indicator_makes_the_run_partial() {
    let h = harness(|_| {}).await;
    script_all_good(&h.source);
    h.source.set("KBP1004M", Err("connection reset"));

    let audit = h.pipeline.run_once().await;
    assert_eq!(audit.status, RunStatus::Partial);
    assert_eq!(audit.final_stage, RunStage::Completed);
    assert_eq!(audit.indicator_failures.len(), 1);
    assert_eq!(audit.indicator_failures[0].indicator_code, "KBP1004M");
    assert_eq!(audit.indicator_failures[0].kind, FailureKind::SourceUnavailable);

    let rows = h.pipeline.db().monthly_aggregates().await.expect("aggregate");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].values.get("zar_usd_exchange_rate").copied().flatten(), None);

    let stored = h
        .pipeline
        .db()
        .run_audit(audit.run_id)
        .await
        .expect("query")
        .expect("audit row");
    assert_eq!(stored.status, RunStatus::Partial);
}

#[tokio::test]
async fn every_indicator_failing_fails_the_run_at_landing() {
    let h = harness(|_| {}).await;

    let audit = h.pipeline.run_once().await;
    assert_eq!(audit.status, RunStatus::Failed);
    assert_eq!(audit.failed_stage, Some(RunStage::Landing));
    assert_eq!(audit.indicator_failures.len(), 3);
    assert!(audit
        .error_message
        .as_deref()
        .is_some_and(|m| m.contains("no indicator could be fetched")));

    let db = h.pipeline.db();
    assert_eq!(db.raw_count().await.expect("raw"), 0);
    assert!(db.monthly_aggregates().await.expect("aggregate").is_empty());
    assert!(db.run_audit(audit.run_id).await.expect("query").is_some());
}

#[tokio::test]
async fn closed_storage_fails_the_run() {
    let h = harness(|_| {}).await;
    script_all_good(&h.source);
    h.pipeline.db().close().await;

    let audit = h.pipeline.run_once().await;
    assert_eq!(audit.status, RunStatus::Failed);
    assert_eq!(audit.failed_stage, Some(RunStage::Landing));
    assert!(audit
        .error_message
        .as_deref()
        .is_some_and(|m| m.starts_with("storage unavailable")));
}

#[tokio::test]
async fn insight_timeout_degrades_without_touching_insights() {
    let mut h = harness(|config| {
        config.ai_enabled = true;
        config.ai_timeout_secs = 1;
    })
    .await;
    script_all_good(&h.source);
    h.pipeline = h.pipeline.with_insight_generator(Arc::new(SlowInsight {
        delay: Duration::from_secs(5),
    }));

    let audit = h.pipeline.run_once().await;
    assert_eq!(audit.status, RunStatus::Partial);
    assert_eq!(audit.insight, InsightOutcome::Degraded);
    assert!(!audit.counts.insight_produced);
    assert_eq!(audit.counts.aggregated_rows, 2);
    assert!(h.pipeline.db().insights().await.expect("insights").is_empty());
}

#[tokio::test]
async fn produced_insight_is_stored_for_the_run_date() {
    let mut h = harness(|config| config.ai_enabled = true).await;
    script_all_good(&h.source);
    h.pipeline = h.pipeline.with_insight_generator(Arc::new(CannedInsight));

    let audit = h.pipeline.run_once().await;
    assert_eq!(audit.status, RunStatus::Success);
    assert_eq!(audit.insight, InsightOutcome::Produced);
    assert!(audit.counts.insight_produced);

    let insights = h.pipeline.db().insights().await.expect("insights");
    assert_eq!(insights.len(), 1);
    assert_eq!(insights[0].model_version, "canned-test");
    assert_eq!(insights[0].generated_json["trend_summary"], "rates steady");
    assert_eq!(insights[0].generated_json["notable_events"], "prime flat");
}

#[tokio::test]
async fn paused_ai_skips_the_insight_stage() {
    let mut h = harness(|config| config.ai_enabled = true).await;
    script_all_good(&h.source);
    h.pipeline = h.pipeline.with_insight_generator(Arc::new(CannedInsight));
    apply_control(h.pipeline.db(), ControlAction::PauseAi, None, chrono::Utc::now())
        .await
        .expect("pause ai");

    let audit = h.pipeline.run_once().await;
    assert_eq!(audit.status, RunStatus::Success);
    assert_eq!(audit.insight, InsightOutcome::Skipped);
    assert!(h.pipeline.db().insights().await.expect("insights").is_empty());
}

#[tokio::test]
async fn trigger_respects_the_pause_flag() {
    let h = harness(|_| {}).await;
    script_all_good(&h.source);
    apply_control(h.pipeline.db(), ControlAction::Pause, Some("maintenance"), chrono::Utc::now())
        .await
        .expect("pause");

    match h.pipeline.trigger().await.expect("trigger") {
        TriggerOutcome::Paused(flags) => assert_eq!(flags.reason.as_deref(), Some("maintenance")),
        TriggerOutcome::Completed(audit) => panic!("paused pipeline ran: {audit:?}"),
    }
    assert!(h.pipeline.db().recent_run_audits(5).await.expect("audits").is_empty());

    apply_control(h.pipeline.db(), ControlAction::Resume, None, chrono::Utc::now())
        .await
        .expect("resume");
    assert!(matches!(
        h.pipeline.trigger().await.expect("trigger"),
        TriggerOutcome::Completed(_)
    ));
}

#[tokio::test]
async fn rebuild_recomputes_from_raw_without_fetching() {
    let h = harness(|_| {}).await;
    script_all_good(&h.source);
    h.pipeline.run_once().await;
    h.source.set("KBP1005M", Err("should not be called"));

    let audit = h.pipeline.rebuild().await;
    assert_eq!(audit.status, RunStatus::Success);
    assert_eq!(audit.counts.raw_landed, 0);
    assert_eq!(audit.counts.valid_records, 7);
    assert_eq!(audit.counts.curated_changed, 0);
    assert_eq!(audit.counts.aggregated_rows, 2);
    assert_eq!(h.pipeline.db().raw_count().await.expect("raw"), 7);

    let status = h.pipeline.status().await.expect("status");
    assert_eq!(status.last_run.map(|run| run.run_id), Some(audit.run_id));
    assert_eq!(status.freshness.latest_observation_date, Some(date(2024, 2, 29)));
}

#[tokio::test]
async fn snapshot_export_writes_a_manifest_per_run() {
    let h = harness(|config| config.export_snapshots = true).await;
    script_all_good(&h.source);

    let audit = h.pipeline.run_once().await;
    let manifest = eip_sync::snapshot::snapshot_dir(&h.pipeline.config().artifacts_dir, audit.run_id)
        .join("manifest.json");
    assert!(manifest.exists());
}
