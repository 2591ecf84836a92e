//! Per-run stage tracking and the audit row written once at completion.

use std::time::Instant;

use chrono::{DateTime, Utc};
use eip_core::{
    FailureKind, IndicatorFailure, InsightOutcome, PipelineError, RunAudit, RunStage, RunStatus,
    SourceError, StageCounts,
};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug)]
pub struct RunRecorder {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    clock: Instant,
    stage: RunStage,
    failed_stage: Option<RunStage>,
    error_message: Option<String>,
    pub counts: StageCounts,
    pub insight: InsightOutcome,
    indicator_failures: Vec<IndicatorFailure>,
    warnings: Vec<String>,
}

impl RunRecorder {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            clock: Instant::now(),
            stage: RunStage::Started,
            failed_stage: None,
            error_message: None,
            counts: StageCounts::default(),
            insight: InsightOutcome::Skipped,
            indicator_failures: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn stage(&self) -> RunStage {
        self.stage
    }

    pub fn advance(&mut self, next: RunStage) {
        if !self.stage.can_transition_to(next) {
            warn!(run_id = %self.run_id, from = self.stage.as_str(), to = next.as_str(), "ignoring invalid stage transition");
            return;
        }
        info!(run_id = %self.run_id, stage = next.as_str(), "stage");
        self.stage = next;
    }

    pub fn record_indicator_failure(&mut self, err: &SourceError) {
        let kind = match err {
            SourceError::Unavailable { .. } => FailureKind::SourceUnavailable,
            SourceError::Format { .. } => FailureKind::SourceFormat,
        };
        warn!(run_id = %self.run_id, indicator = err.indicator(), error = %err, "indicator failed");
        self.indicator_failures.push(IndicatorFailure {
            indicator_code: err.indicator().to_string(),
            kind,
            message: err.to_string(),
        });
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn extend_warnings(&mut self, messages: impl IntoIterator<Item = String>) {
        self.warnings.extend(messages);
    }

    /// Move to `Failed`, remembering which stage the error interrupted.
    pub fn fail(&mut self, err: &PipelineError) {
        if self.stage.is_terminal() {
            return;
        }
        self.failed_stage = Some(self.stage);
        self.error_message = Some(err.to_string());
        self.stage = RunStage::Failed;
    }

    pub fn status(&self) -> RunStatus {
        if self.stage == RunStage::Failed {
            RunStatus::Failed
        } else if !self.indicator_failures.is_empty() || self.insight == InsightOutcome::Degraded {
            RunStatus::Partial
        } else {
            RunStatus::Success
        }
    }

    pub fn finish(self) -> RunAudit {
        let status = self.status();
        RunAudit {
            run_id: self.run_id,
            run_timestamp: self.started_at,
            status,
            final_stage: self.stage,
            failed_stage: self.failed_stage,
            counts: self.counts,
            insight: self.insight,
            indicator_failures: self.indicator_failures,
            warnings: self.warnings,
            error_message: self.error_message,
            duration_seconds: self.clock.elapsed().as_secs_f64(),
        }
    }
}

/// Markdown table of recent runs, newest first.
pub fn render_audit_report(audits: &[RunAudit]) -> String {
    let mut lines = vec![
        "# Economic Indicators Pipeline Runs".to_string(),
        String::new(),
    ];
    if audits.is_empty() {
        lines.push("_No runs recorded._".to_string());
        return lines.join("\n");
    }

    lines.push(
        "| Run | Started | Status | Stage | Raw | Valid | Invalid | Curated | Months | Insight | Seconds |"
            .to_string(),
    );
    lines.push("|---|---|---|---|---|---|---|---|---|---|---|".to_string());
    for audit in audits {
        let stage = match audit.failed_stage {
            Some(failed) => format!("failed at {}", failed.as_str()),
            None => audit.final_stage.as_str().to_string(),
        };
        lines.push(format!(
            "| `{}` | {} | {} | {} | {} | {} | {} | {} | {} | {} | {:.2} |",
            audit.run_id,
            audit.run_timestamp.format("%Y-%m-%d %H:%M:%S"),
            audit.status.as_str(),
            stage,
            audit.counts.raw_landed,
            audit.counts.valid_records,
            audit.counts.invalid_records,
            audit.counts.curated_changed,
            audit.counts.aggregated_rows,
            audit.insight.as_str(),
            audit.duration_seconds,
        ));
    }

    for audit in audits {
        if audit.error_message.is_none()
            && audit.indicator_failures.is_empty()
            && audit.warnings.is_empty()
        {
            continue;
        }
        lines.push(String::new());
        lines.push(format!("## Run `{}`", audit.run_id));
        if let Some(error) = &audit.error_message {
            lines.push(format!("- error: {error}"));
        }
        for failure in &audit.indicator_failures {
            lines.push(format!("- {}: {}", failure.indicator_code, failure.message));
        }
        for warning in &audit.warnings {
            lines.push(format!("- warning: {warning}"));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indicator_failure_makes_run_partial() {
        let mut recorder = RunRecorder::new(Uuid::new_v4(), Utc::now());
        recorder.advance(RunStage::Landing);
        recorder.record_indicator_failure(&SourceError::Unavailable {
            indicator: "KBP1004M".into(),
            reason: "timeout".into(),
        });
        recorder.advance(RunStage::Cleansing);
        recorder.advance(RunStage::Aggregating);
        recorder.advance(RunStage::Completed);
        let audit = recorder.finish();
        assert_eq!(audit.status, RunStatus::Partial);
        assert_eq!(audit.final_stage, RunStage::Completed);
        assert_eq!(audit.indicator_failures[0].kind, FailureKind::SourceUnavailable);
    }

    #[test]
    fn failure_records_interrupted_stage() {
        let mut recorder = RunRecorder::new(Uuid::new_v4(), Utc::now());
        recorder.advance(RunStage::Landing);
        recorder.advance(RunStage::Cleansing);
        recorder.fail(&PipelineError::StorageUnavailable("pool closed".into()));
        recorder.advance(RunStage::Aggregating);
        let audit = recorder.finish();
        assert_eq!(audit.status, RunStatus::Failed);
        assert_eq!(audit.final_stage, RunStage::Failed);
        assert_eq!(audit.failed_stage, Some(RunStage::Cleansing));
        assert_eq!(audit.error_message.as_deref(), Some("storage unavailable: pool closed"));
    }

    #[test]
    fn degraded_insight_makes_run_partial() {
        let mut recorder = RunRecorder::new(Uuid::new_v4(), Utc::now());
        recorder.insight = InsightOutcome::Degraded;
        assert_eq!(recorder.status(), RunStatus::Partial);
        recorder.insight = InsightOutcome::Skipped;
        assert_eq!(recorder.status(), RunStatus::Success);
    }

    #[test]
    fn report_lists_runs_and_problems() {
        let mut recorder = RunRecorder::new(Uuid::new_v4(), Utc::now());
        recorder.advance(RunStage::Landing);
        recorder.warn("KBP6006M: no valid rows among 3 raw row(s)");
        recorder.fail(&PipelineError::NoIndicatorsLanded(3));
        let audit = recorder.finish();

        let report = render_audit_report(std::slice::from_ref(&audit));
        assert!(report.contains("| failed | failed at landing |"));
        assert!(report.contains("no indicator could be fetched (3 attempted)"));
        assert!(report.contains("- warning: KBP6006M"));
        assert!(render_audit_report(&[]).contains("No runs recorded"));
    }
}
