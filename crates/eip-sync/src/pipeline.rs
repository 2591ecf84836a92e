use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use eip_adapters::{
    FetchContext, FetchedSeries, FixtureSourceAdapter, SarbWebIndicatorsAdapter, SeriesRequest,
    SourceAdapter,
};
use eip_core::{
    batch_id_for, ControlFlags, IndicatorRegistry, InsightOutcome, PipelineError, RawBatch,
    RunAudit, RunStage, SourceError,
};
use eip_storage::{
    ArtifactStore, BackoffPolicy, Database, DataFreshness, HttpClientConfig, HttpFetcher,
    StorageError, TokenBucketConfig,
};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aggregate::rebuild_monthly_aggregates;
use crate::audit::RunRecorder;
use crate::cleanse::cleanse;
use crate::config::{CleanseScope, PipelineConfig, SourceMode};
use crate::insight::{
    run_insight_stage, GeminiInsightGenerator, InsightGenerator, InsightStageOutcome,
    NoopInsightGenerator,
};
use crate::snapshot::export_monthly_snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RunMode {
    fetch: bool,
    scope: CleanseScope,
    insight: bool,
}

/// Result of a trigger request that respects the pause flag.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    Paused(ControlFlags),
    Completed(RunAudit),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub control: ControlFlags,
    pub last_run: Option<RunAudit>,
    pub freshness: DataFreshness,
}

pub struct Pipeline {
    db: Database,
    registry: IndicatorRegistry,
    source: Arc<dyn SourceAdapter>,
    insight: Arc<dyn InsightGenerator>,
    artifacts: ArtifactStore,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        db: Database,
        registry: IndicatorRegistry,
        source: Arc<dyn SourceAdapter>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            db,
            registry,
            source,
            insight: Arc::new(NoopInsightGenerator),
            artifacts: ArtifactStore::new(config.artifacts_dir.clone()),
            config,
        }
    }

    pub fn with_insight_generator(mut self, generator: Arc<dyn InsightGenerator>) -> Self {
        self.insight = generator;
        self
    }

    /// Connect storage, load the indicator registry and wire the configured
    /// source and insight generator.
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let registry = config.load_registry()?;
        let db = Database::connect(&config.database_url)
            .await
            .with_context(|| format!("opening database {}", config.database_url))?;

        let source: Arc<dyn SourceAdapter> = match config.source_mode {
            SourceMode::Fixture => Arc::new(FixtureSourceAdapter::new(config.fixtures_path())),
            SourceMode::Http => {
                let http = HttpFetcher::new(HttpClientConfig {
                    timeout: Duration::from_secs(config.http_timeout_secs),
                    user_agent: Some(config.user_agent.clone()),
                    global_concurrency: config.fetch_concurrency,
                    per_host_concurrency: config.fetch_concurrency,
                    backoff: BackoffPolicy {
                        max_retries: config.fetch_max_retries,
                        base_delay: Duration::from_millis(config.fetch_backoff_ms),
                        ..BackoffPolicy::default()
                    },
                    token_bucket: config.fetch_rate_per_sec.and_then(TokenBucketConfig::per_second),
                })?;
                Arc::new(SarbWebIndicatorsAdapter::with_base_url(
                    Arc::new(http),
                    config.source_base_url.clone(),
                ))
            }
        };

        let generator: Arc<dyn InsightGenerator> = match (&config.gemini_api_key, config.ai_enabled) {
            (Some(key), true) => Arc::new(GeminiInsightGenerator::new(
                config.ai_endpoint.clone(),
                config.ai_model.clone(),
                key.clone(),
                Duration::from_secs(config.ai_timeout_secs),
            )?),
            (None, true) => {
                warn!("EIP_AI_ENABLED is set but GEMINI_API_KEY is missing; insights will be skipped");
                Arc::new(NoopInsightGenerator)
            }
            _ => Arc::new(NoopInsightGenerator),
        };

        info!(
            indicators = registry.columns().len(),
            source = source.source_id(),
            model = generator.model_version(),
            "pipeline ready"
        );
        Ok(Self::new(db, registry, source, config).with_insight_generator(generator))
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn registry(&self) -> &IndicatorRegistry {
        &self.registry
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Fetch, land, cleanse, aggregate and (optionally) analyse. Always
    /// returns the audit row, which is also persisted.
    pub async fn run_once(&self) -> RunAudit {
        self.run(RunMode {
            fetch: true,
            scope: self.config.cleanse_scope,
            insight: true,
        })
        .await
    }

    /// Re-cleanse every landed raw row and rebuild the aggregate without fetching.
    pub async fn rebuild(&self) -> RunAudit {
        self.run(RunMode {
            fetch: false,
            scope: CleanseScope::Full,
            insight: false,
        })
        .await
    }

    /// Start a run unless the pipeline is paused.
    pub async fn trigger(&self) -> Result<TriggerOutcome, StorageError> {
        let flags = self.db.control_flags().await?;
        if !flags.pipeline_enabled {
            info!(reason = ?flags.reason, "pipeline paused; not starting a run");
            return Ok(TriggerOutcome::Paused(flags));
        }
        Ok(TriggerOutcome::Completed(self.run_once().await))
    }

    pub async fn status(&self) -> Result<PipelineStatus, StorageError> {
        Ok(PipelineStatus {
            control: self.db.control_flags().await?,
            last_run: self.db.recent_run_audits(1).await?.into_iter().next(),
            freshness: self.db.data_freshness().await?,
        })
    }

    async fn run(&self, mode: RunMode) -> RunAudit {
        let run_id = Uuid::new_v4();
        let mut recorder = RunRecorder::new(run_id, Utc::now());
        info!(%run_id, fetch = mode.fetch, scope = ?mode.scope, "pipeline run started");

        let span = info_span!("pipeline_run", %run_id);
        if let Err(err) = self.execute(&mut recorder, mode).instrument(span).await {
            error!(%run_id, stage = recorder.stage().as_str(), error = %err, "pipeline run failed");
            recorder.fail(&err);
        }

        let audit = recorder.finish();
        if let Err(err) = self.db.insert_run_audit(&audit).await {
            error!(%run_id, error = %err, "could not write run audit row");
        }
        info!(
            %run_id,
            status = audit.status.as_str(),
            raw = audit.counts.raw_landed,
            valid = audit.counts.valid_records,
            invalid = audit.counts.invalid_records,
            months = audit.counts.aggregated_rows,
            insight = audit.insight.as_str(),
            seconds = audit.duration_seconds,
            "pipeline run finished"
        );
        audit
    }

    async fn execute(&self, recorder: &mut RunRecorder, mode: RunMode) -> Result<(), PipelineError> {
        recorder.advance(RunStage::Landing);
        let batch_ids = if mode.fetch {
            self.land_all(recorder).await?
        } else {
            Vec::new()
        };

        recorder.advance(RunStage::Cleansing);
        let raw = match mode.scope {
            CleanseScope::Batch => self.db.raw_observations_for_batches(&batch_ids).await,
            CleanseScope::Full => self.db.all_raw_observations().await,
        }
        .map_err(storage_unavailable)?;
        let now = Utc::now();
        let report = cleanse(&self.db, &self.registry, &raw, now.date_naive(), now)
            .await
            .map_err(storage_unavailable)?;
        recorder.counts.valid_records = report.valid_records;
        recorder.counts.invalid_records = report.invalid_records;
        recorder.counts.duplicates_collapsed = report.duplicates_collapsed;
        recorder.counts.curated_changed = report.curated_changed;
        recorder.extend_warnings(report.warnings);

        recorder.advance(RunStage::Aggregating);
        let today = Utc::now().date_naive();
        recorder.counts.aggregated_rows = rebuild_monthly_aggregates(
            &self.db,
            &self.registry,
            self.config.aggregate_window_months,
            today,
        )
        .await
        .map_err(|err| PipelineError::AggregationFailure(err.to_string()))?;
        if self.config.export_snapshots {
            self.export_snapshot(recorder.run_id()).await;
        }

        if mode.insight {
            self.insight_stage(recorder).await?;
        }
        recorder.advance(RunStage::Completed);
        Ok(())
    }

    /// Fetch every enabled indicator concurrently, then land the results
    /// sequentially in registry order. Returns the batch ids written.
    async fn land_all(&self, recorder: &mut RunRecorder) -> Result<Vec<Uuid>, PipelineError> {
        let run_id = recorder.run_id();
        let specs: Vec<_> = self.registry.enabled().cloned().collect();
        if specs.is_empty() {
            return Err(PipelineError::NoIndicatorsLanded(0));
        }

        let ctx = FetchContext {
            run_id,
            fetched_at: Utc::now(),
        };
        let limit = Arc::new(Semaphore::new(self.config.fetch_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for (idx, spec) in specs.iter().enumerate() {
            let source = Arc::clone(&self.source);
            let limit = Arc::clone(&limit);
            let ctx = ctx.clone();
            let request = SeriesRequest::from_floor(
                &spec.code,
                self.config.history_floor,
                ctx.fetched_at.date_naive(),
            );
            let span = info_span!("fetch_indicator", %run_id, indicator = %spec.code);
            tasks.spawn(
                async move {
                    let _permit = limit.acquire_owned().await;
                    (idx, source.fetch_series(&ctx, &request).await)
                }
                .instrument(span),
            );
        }

        let mut results: Vec<Option<Result<FetchedSeries, SourceError>>> =
            specs.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, result)) => results[idx] = Some(result),
                Err(err) => error!(%run_id, error = %err, "fetch task aborted"),
            }
        }

        let mut batch_ids = Vec::new();
        for (spec, result) in specs.iter().zip(results) {
            let result = result.unwrap_or_else(|| {
                Err(SourceError::Unavailable {
                    indicator: spec.code.clone(),
                    reason: "fetch task aborted".to_string(),
                })
            });
            match result {
                Ok(series) => {
                    let (batch_id, landed) = self.land_series(run_id, series).await?;
                    recorder.counts.raw_landed += landed;
                    if landed == 0 {
                        recorder.warn(format!("{}: source returned no observations", spec.code));
                    }
                    batch_ids.push(batch_id);
                }
                Err(err) => recorder.record_indicator_failure(&err),
            }
        }

        if batch_ids.is_empty() {
            return Err(PipelineError::NoIndicatorsLanded(specs.len()));
        }
        Ok(batch_ids)
    }

    async fn land_series(&self, run_id: Uuid, series: FetchedSeries) -> Result<(Uuid, u64), PipelineError> {
        let stored = self
            .artifacts
            .store_payload(
                series.fetched_at,
                &series.indicator_code,
                series.extension(),
                &series.raw_body,
            )
            .await
            .map_err(|err| PipelineError::StorageUnavailable(format!("{err:#}")))?;

        let batch = RawBatch {
            batch_id: batch_id_for(run_id, &series.indicator_code),
            indicator_code: series.indicator_code,
            source: series.source,
            ingested_at: Utc::now(),
            artifact_hash: Some(stored.content_hash),
            points: series.points,
        };
        let landed = self
            .db
            .append_raw_batch(&batch)
            .await
            .map_err(storage_unavailable)?;
        info!(
            indicator = %batch.indicator_code,
            batch_id = %batch.batch_id,
            rows = landed,
            artifact = %stored.relative_path.display(),
            deduplicated = stored.deduplicated,
            "landed raw batch"
        );
        Ok((batch.batch_id, landed))
    }

    async fn insight_stage(&self, recorder: &mut RunRecorder) -> Result<(), PipelineError> {
        let flags = self.db.control_flags().await.map_err(storage_unavailable)?;
        if !self.config.ai_enabled || !flags.ai_enabled {
            info!(
                configured = self.config.ai_enabled,
                control = flags.ai_enabled,
                "insight stage disabled"
            );
            recorder.insight = InsightOutcome::Skipped;
            return Ok(());
        }

        recorder.advance(RunStage::Insight);
        let now = Utc::now();
        let outcome = run_insight_stage(
            &self.db,
            self.insight.as_ref(),
            self.config.ai_window_months,
            Duration::from_secs(self.config.ai_timeout_secs),
            now.date_naive(),
            now,
        )
        .await
        .map_err(storage_unavailable)?;

        match outcome {
            InsightStageOutcome::Produced { .. } => {
                recorder.insight = InsightOutcome::Produced;
                recorder.counts.insight_produced = true;
            }
            InsightStageOutcome::Skipped(reason) => {
                info!(%reason, "insight skipped");
                recorder.insight = InsightOutcome::Skipped;
            }
            InsightStageOutcome::Degraded(err) => {
                recorder.warn(format!("insight degraded: {err}"));
                recorder.insight = InsightOutcome::Degraded;
            }
        }
        Ok(())
    }

    async fn export_snapshot(&self, run_id: Uuid) {
        let rows = match self.db.monthly_aggregates().await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(%run_id, error = %err, "could not read aggregate for snapshot");
                return;
            }
        };
        let columns = self.registry.columns();
        let artifacts_dir = self.artifacts.root().to_path_buf();
        let exported = tokio::task::spawn_blocking(move || {
            export_monthly_snapshot(&artifacts_dir, run_id, &columns, &rows)
        })
        .await;
        match exported {
            Ok(Ok(path)) => info!(%run_id, manifest = %path.display(), "exported aggregate snapshot"),
            Ok(Err(err)) => warn!(%run_id, error = ?err, "snapshot export failed"),
            Err(err) => warn!(%run_id, error = %err, "snapshot export task failed"),
        }
    }

    /// Register the cron trigger when `EIP_SCHEDULER_ENABLED` is set.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = &self.config.sync_cron;
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.trigger().await {
                    Ok(TriggerOutcome::Completed(audit)) => {
                        info!(run_id = %audit.run_id, status = audit.status.as_str(), "scheduled run finished")
                    }
                    Ok(TriggerOutcome::Paused(_)) => info!("scheduled run skipped; pipeline paused"),
                    Err(err) => error!(error = %err, "scheduled run could not read control flags"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(%cron, "scheduled pipeline trigger registered");
        Ok(Some(sched))
    }
}

fn storage_unavailable(err: StorageError) -> PipelineError {
    PipelineError::StorageUnavailable(err.to_string())
}
