//! Core domain model and run-state types for the economic indicators pipeline.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Datelike, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;

pub use error::{
    InsightServiceError, PipelineError, RegistryError, SourceError, ValidationError,
};

pub const CRATE_NAME: &str = "eip-core";

/// Build-time indicator set: (code, aggregate column, display name).
pub const DEFAULT_INDICATORS: [(&str, &str, &str); 3] = [
    ("KBP1005M", "prime_rate", "Prime Overdraft Rate"),
    ("KBP6006M", "headline_cpi", "Headline Consumer Price Index"),
    ("KBP1004M", "zar_usd_exchange_rate", "ZAR to USD Exchange Rate"),
];

/// One tracked economic time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSpec {
    pub code: String,
    pub column: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub min_value: Option<f64>,
    #[serde(default)]
    pub max_value: Option<f64>,
}

fn default_true() -> bool {
    true
}

impl IndicatorSpec {
    pub fn new(code: &str, column: &str, name: &str) -> Self {
        Self {
            code: code.to_string(),
            column: column.to_string(),
            name: name.to_string(),
            enabled: true,
            min_value: None,
            max_value: None,
        }
    }

    /// Soft range check; values outside it are curated but flagged.
    pub fn is_plausible(&self, value: f64) -> bool {
        self.min_value.map_or(true, |min| value >= min)
            && self.max_value.map_or(true, |max| value <= max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRegistry {
    pub indicators: Vec<IndicatorSpec>,
}

impl Default for IndicatorRegistry {
    fn default() -> Self {
        Self {
            indicators: DEFAULT_INDICATORS
                .iter()
                .map(|(code, column, name)| IndicatorSpec::new(code, column, name))
                .collect(),
        }
    }
}

impl IndicatorRegistry {
    pub fn new(indicators: Vec<IndicatorSpec>) -> Result<Self, RegistryError> {
        let registry = Self { indicators };
        registry.validate()?;
        Ok(registry)
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        let mut codes = HashSet::new();
        let mut columns = HashSet::new();
        for spec in &self.indicators {
            if !is_indicator_code(&spec.code) {
                return Err(RegistryError::InvalidCode(spec.code.clone()));
            }
            if !is_sql_identifier(&spec.column) || spec.column == "observation_month" {
                return Err(RegistryError::InvalidColumn(spec.column.clone()));
            }
            if !codes.insert(spec.code.as_str()) {
                return Err(RegistryError::DuplicateCode(spec.code.clone()));
            }
            if !columns.insert(spec.column.as_str()) {
                return Err(RegistryError::DuplicateColumn(spec.column.clone()));
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &IndicatorSpec> {
        self.indicators.iter().filter(|spec| spec.enabled)
    }

    pub fn get(&self, code: &str) -> Option<&IndicatorSpec> {
        self.indicators.iter().find(|spec| spec.code == code)
    }

    /// Aggregate columns for enabled indicators, in registry order.
    pub fn columns(&self) -> Vec<String> {
        self.enabled().map(|spec| spec.column.clone()).collect()
    }
}

pub fn is_indicator_code(code: &str) -> bool {
    !code.is_empty()
        && code.len() <= 32
        && code
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

pub fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() || first == '_' => {}
        _ => return false,
    }
    name.len() <= 63
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// A single normalized point from the source API, still in raw textual form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePoint {
    pub date: Option<String>,
    pub value: Option<String>,
}

/// Landing-tier payload for one indicator fetched in one connector invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBatch {
    pub batch_id: Uuid,
    pub indicator_code: String,
    pub source: String,
    pub ingested_at: DateTime<Utc>,
    pub artifact_hash: Option<String>,
    pub points: Vec<SourcePoint>,
}

/// Immutable landed row. `id` is the append sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub id: i64,
    pub indicator_code: String,
    pub observation_date: Option<String>,
    pub value: Option<String>,
    pub source: String,
    pub ingested_at: DateTime<Utc>,
    pub batch_id: Uuid,
    pub artifact_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CuratedIndicatorRecord {
    pub indicator_code: String,
    pub observation_date: NaiveDate,
    pub value: f64,
    pub previous_value: Option<f64>,
    pub period_change: Option<f64>,
    pub period_change_percent: Option<f64>,
    pub is_validated: bool,
    pub confidence_score: f64,
    pub source_batch_id: Uuid,
    pub source_ingested_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One pivoted month: indicator column -> monthly average.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyAggregate {
    pub observation_month: NaiveDate,
    #[serde(flatten)]
    pub values: BTreeMap<String, Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub analysis_date: NaiveDate,
    pub generated_json: serde_json::Value,
    pub model_version: String,
    pub load_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(RunStatus::Success),
            "partial" => Some(RunStatus::Partial),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// Stage of a single invocation.
///
/// `Started -> Landing -> Cleansing -> Aggregating -> [Insight] -> Completed`,
/// or `Failed` from any non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStage {
    Started,
    Landing,
    Cleansing,
    Aggregating,
    Insight,
    Completed,
    Failed,
}

impl RunStage {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStage::Started => "started",
            RunStage::Landing => "landing",
            RunStage::Cleansing => "cleansing",
            RunStage::Aggregating => "aggregating",
            RunStage::Insight => "insight",
            RunStage::Completed => "completed",
            RunStage::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "started" => Some(RunStage::Started),
            "landing" => Some(RunStage::Landing),
            "cleansing" => Some(RunStage::Cleansing),
            "aggregating" => Some(RunStage::Aggregating),
            "insight" => Some(RunStage::Insight),
            "completed" => Some(RunStage::Completed),
            "failed" => Some(RunStage::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStage::Completed | RunStage::Failed)
    }

    pub fn can_transition_to(self, next: RunStage) -> bool {
        use RunStage::*;
        match (self, next) {
            (Completed | Failed, _) => false,
            (_, Failed) => true,
            (Started, Landing) | (Landing, Cleansing) | (Cleansing, Aggregating) => true,
            (Aggregating, Insight) | (Aggregating, Completed) | (Insight, Completed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightOutcome {
    Produced,
    Degraded,
    Skipped,
}

impl InsightOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            InsightOutcome::Produced => "produced",
            InsightOutcome::Degraded => "degraded",
            InsightOutcome::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "produced" => Some(InsightOutcome::Produced),
            "degraded" => Some(InsightOutcome::Degraded),
            "skipped" => Some(InsightOutcome::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    pub raw_landed: u64,
    pub valid_records: u64,
    pub invalid_records: u64,
    pub duplicates_collapsed: u64,
    pub curated_changed: u64,
    pub aggregated_rows: u64,
    pub insight_produced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SourceUnavailable,
    SourceFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndicatorFailure {
    pub indicator_code: String,
    pub kind: FailureKind,
    pub message: String,
}

/// One row per pipeline invocation, written once at completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunAudit {
    pub run_id: Uuid,
    pub run_timestamp: DateTime<Utc>,
    pub status: RunStatus,
    pub final_stage: RunStage,
    pub failed_stage: Option<RunStage>,
    pub counts: StageCounts,
    pub insight: InsightOutcome,
    pub indicator_failures: Vec<IndicatorFailure>,
    pub warnings: Vec<String>,
    pub error_message: Option<String>,
    pub duration_seconds: f64,
}

/// Scheduler-level switches checked before a run starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFlags {
    pub pipeline_enabled: bool,
    pub ai_enabled: bool,
    pub reason: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for ControlFlags {
    fn default() -> Self {
        Self {
            pipeline_enabled: true,
            ai_enabled: true,
            reason: None,
            updated_at: None,
        }
    }
}

/// Deterministic lineage id for one indicator fetched within one run.
pub fn batch_id_for(run_id: Uuid, indicator_code: &str) -> Uuid {
    Uuid::new_v5(&run_id, indicator_code.as_bytes())
}

/// Fixed-width UTC timestamp; lexical order equals temporal order.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}

pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// First day of the month `months - 1` months before `date`'s month.
pub fn window_start(date: NaiveDate, months: u32) -> NaiveDate {
    let back = months.saturating_sub(1);
    let total = date.year() * 12 + date.month0() as i32 - back as i32;
    NaiveDate::from_ymd_opt(total.div_euclid(12), total.rem_euclid(12) as u32 + 1, 1)
        .unwrap_or_else(|| month_start(date))
}
