use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use eip_adapters::{default_history_floor, SARB_BASE_URL};
use eip_core::{parse_date, IndicatorRegistry};
use tracing::{info, warn};

pub const DEFAULT_AI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_AI_MODEL: &str = "gemini-1.5-pro";
pub const DEFAULT_SYNC_CRON: &str = "0 0 6 * * Mon-Fri";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
    Http,
    Fixture,
}

/// Which raw rows a cleansing pass reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanseScope {
    /// Only the batches landed by the current run.
    Batch,
    /// Every raw row ever landed.
    Full,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub artifacts_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub indicators_file: PathBuf,
    pub source_mode: SourceMode,
    pub source_base_url: String,
    pub fixtures_dir: PathBuf,
    pub history_floor: NaiveDate,
    pub fetch_concurrency: usize,
    pub fetch_max_retries: usize,
    pub fetch_backoff_ms: u64,
    pub fetch_rate_per_sec: Option<u32>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub cleanse_scope: CleanseScope,
    pub aggregate_window_months: Option<u32>,
    pub ai_enabled: bool,
    pub ai_window_months: u32,
    pub ai_model: String,
    pub ai_endpoint: String,
    pub gemini_api_key: Option<String>,
    pub ai_timeout_secs: u64,
    pub export_snapshots: bool,
    pub scheduler_auth_token: Option<String>,
    pub web_port: u16,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let flag = |key: &str, default: bool| get(key).map(|v| parse_flag(&v)).unwrap_or(default);

        Self {
            database_url: get("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://./data/eip.db".to_string()),
            artifacts_dir: get("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./artifacts")),
            workspace_root: get("EIP_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            indicators_file: get("EIP_INDICATORS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("indicators.yaml")),
            source_mode: match get("EIP_SOURCE_MODE").as_deref() {
                Some("fixture") | Some("fixtures") => SourceMode::Fixture,
                Some("http") | None => SourceMode::Http,
                Some(other) => {
                    warn!(value = other, "unknown EIP_SOURCE_MODE; using http");
                    SourceMode::Http
                }
            },
            source_base_url: get("EIP_SOURCE_BASE_URL").unwrap_or_else(|| SARB_BASE_URL.to_string()),
            fixtures_dir: get("EIP_FIXTURES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("fixtures/sarb")),
            history_floor: get("EIP_HISTORY_FLOOR")
                .and_then(|v| {
                    let date = parse_date(&v);
                    if date.is_none() {
                        warn!(value = %v, "EIP_HISTORY_FLOOR is not YYYY-MM-DD; using default");
                    }
                    date
                })
                .unwrap_or_else(default_history_floor),
            fetch_concurrency: parsed(&get, "EIP_FETCH_CONCURRENCY").unwrap_or(3),
            fetch_max_retries: parsed(&get, "EIP_FETCH_MAX_RETRIES").unwrap_or(3),
            fetch_backoff_ms: parsed(&get, "EIP_FETCH_BACKOFF_MS").unwrap_or(250),
            fetch_rate_per_sec: parsed::<u32>(&get, "EIP_FETCH_RATE_PER_SEC").filter(|r| *r > 0),
            http_timeout_secs: parsed(&get, "EIP_HTTP_TIMEOUT_SECS").unwrap_or(30),
            user_agent: get("EIP_USER_AGENT").unwrap_or_else(|| "eip-bot/0.1".to_string()),
            cleanse_scope: match get("EIP_CLEANSE_SCOPE").as_deref() {
                Some("full") => CleanseScope::Full,
                _ => CleanseScope::Batch,
            },
            aggregate_window_months: parsed::<u32>(&get, "EIP_AGGREGATE_WINDOW_MONTHS").filter(|m| *m > 0),
            ai_enabled: flag("EIP_AI_ENABLED", false),
            ai_window_months: parsed(&get, "EIP_AI_WINDOW_MONTHS").unwrap_or(18),
            ai_model: get("EIP_AI_MODEL").unwrap_or_else(|| DEFAULT_AI_MODEL.to_string()),
            ai_endpoint: get("EIP_AI_ENDPOINT").unwrap_or_else(|| DEFAULT_AI_ENDPOINT.to_string()),
            gemini_api_key: get("GEMINI_API_KEY"),
            ai_timeout_secs: parsed(&get, "EIP_AI_TIMEOUT_SECS").unwrap_or(60),
            export_snapshots: flag("EIP_EXPORT_SNAPSHOTS", true),
            scheduler_auth_token: get("SCHEDULER_AUTH_TOKEN"),
            web_port: parsed(&get, "EIP_WEB_PORT").unwrap_or(8080),
            scheduler_enabled: flag("EIP_SCHEDULER_ENABLED", false),
            sync_cron: get("EIP_SYNC_CRON").unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
        }
    }

    pub fn indicators_path(&self) -> PathBuf {
        self.workspace_root.join(&self.indicators_file)
    }

    pub fn fixtures_path(&self) -> PathBuf {
        self.workspace_root.join(&self.fixtures_dir)
    }

    /// Load `indicators.yaml`, or the built-in set when the file does not exist.
    pub fn load_registry(&self) -> Result<IndicatorRegistry> {
        load_registry_file(&self.indicators_path())
    }
}

pub fn load_registry_file(path: &Path) -> Result<IndicatorRegistry> {
    if !path.exists() {
        info!(path = %path.display(), "no indicator registry file; using built-in indicators");
        return Ok(IndicatorRegistry::default());
    }
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let registry: IndicatorRegistry =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    IndicatorRegistry::new(registry.indicators)
        .with_context(|| format!("validating {}", path.display()))
}

fn parse_flag(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True" | "yes" | "on")
}

fn parsed<T: std::str::FromStr>(get: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let value = get(key)?;
    let parsed = value.parse().ok();
    if parsed.is_none() {
        warn!(key, value = %value, "ignoring unparseable setting");
    }
    parsed
}
