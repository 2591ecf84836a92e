//! Insight generator capability, the Gemini and no-op implementations, and
//! the best-effort insight stage.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use eip_core::{format_date, Insight, InsightServiceError, MonthlyAggregate};
use eip_storage::{Database, StorageError};
use reqwest::StatusCode;
use serde_json::{json, Map, Value as JsonValue};
use tracing::{info, warn};

pub const INSIGHT_FIELDS: [&str; 5] = [
    "trend_summary",
    "correlation_summary",
    "notable_events",
    "risk_assessment",
    "recommendations",
];

const LEGACY_KEYS: [(&str, &str); 4] = [
    ("economic_trends", "trend_summary"),
    ("correlation_analysis", "correlation_summary"),
    ("key_events", "notable_events"),
    ("outlook_recommendations", "recommendations"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct InsightRequest {
    pub analysis_date: NaiveDate,
    pub rows: Vec<MonthlyAggregate>,
    pub prompt: String,
}

impl InsightRequest {
    pub fn new(analysis_date: NaiveDate, rows: Vec<MonthlyAggregate>) -> Self {
        let prompt = build_prompt(analysis_date, &rows);
        Self {
            analysis_date,
            rows,
            prompt,
        }
    }

    /// `first..last` observation months covered, or `None` for an empty window.
    pub fn data_period(&self) -> Option<String> {
        let first = self.rows.first()?;
        let last = self.rows.last()?;
        Some(format!(
            "{}..{}",
            format_date(first.observation_month),
            format_date(last.observation_month)
        ))
    }
}

#[async_trait]
pub trait InsightGenerator: Send + Sync {
    fn model_version(&self) -> &str;

    /// Return the service's raw text response for `request`.
    async fn generate_insight(&self, request: &InsightRequest) -> Result<String, InsightServiceError>;
}

/// Stand-in used when no text-generation service is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInsightGenerator;

#[async_trait]
impl InsightGenerator for NoopInsightGenerator {
    fn model_version(&self) -> &str {
        "noop"
    }

    async fn generate_insight(&self, _request: &InsightRequest) -> Result<String, InsightServiceError> {
        Err(InsightServiceError::NotConfigured)
    }
}

#[derive(Debug, Clone)]
pub struct GeminiInsightGenerator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    timeout_secs: u64,
}

impl GeminiInsightGenerator {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| anyhow::anyhow!("building insight client: {err}"))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: api_key.into(),
            timeout_secs: timeout.as_secs(),
        })
    }

    fn url(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.endpoint.trim_end_matches('/'),
            self.model
        )
    }
}

#[async_trait]
impl InsightGenerator for GeminiInsightGenerator {
    fn model_version(&self) -> &str {
        &self.model
    }

    async fn generate_insight(&self, request: &InsightRequest) -> Result<String, InsightServiceError> {
        let body = json!({
            "contents": [{"role": "user", "parts": [{"text": request.prompt}]}],
            "generationConfig": {"responseMimeType": "application/json", "temperature": 0.2},
        });
        let response = self
            .client
            .post(self.url())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    InsightServiceError::Timeout(self.timeout_secs)
                } else {
                    InsightServiceError::Service(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let detail = detail.chars().take(300).collect::<String>();
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => InsightServiceError::Quota(detail),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => InsightServiceError::Auth(detail),
                _ => InsightServiceError::Service(format!("{status}: {detail}")),
            });
        }

        let payload: JsonValue = response
            .json()
            .await
            .map_err(|err| InsightServiceError::Service(format!("decoding response: {err}")))?;
        payload
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| InsightServiceError::Service("response carried no text candidate".into()))
    }
}

pub fn build_prompt(analysis_date: NaiveDate, rows: &[MonthlyAggregate]) -> String {
    let data = rows
        .iter()
        .map(|row| serde_json::to_string(row).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("\n");
    let fields = INSIGHT_FIELDS
        .iter()
        .map(|f| format!("  \"{f}\": string"))
        .collect::<Vec<_>>()
        .join(",\n");
    format!(
        "You are an economic analyst reviewing South African Reserve Bank indicators.\n\
         Analysis date: {date}\n\
         Monthly averages, one JSON object per month (null = no observation):\n\
         {data}\n\n\
         Respond with a single JSON object and nothing else, using exactly these keys:\n\
         {{\n{fields}\n}}\n",
        date = format_date(analysis_date),
    )
}

/// Parse the service text into the stored insight document. Unparseable text
/// is kept as `raw_text` with every structured field null.
pub fn parse_insight_text(text: &str, data_period: Option<&str>) -> JsonValue {
    let mut doc = Map::new();
    let parsed = extract_json_object(text);

    for field in INSIGHT_FIELDS {
        let value = parsed.as_ref().ok().and_then(|obj| {
            obj.get(field)
                .or_else(|| {
                    LEGACY_KEYS
                        .iter()
                        .find(|(_, current)| *current == field)
                        .and_then(|(legacy, _)| obj.get(*legacy))
                })
                .cloned()
        });
        doc.insert(field.to_string(), value.unwrap_or(JsonValue::Null));
    }
    doc.insert("raw_text".into(), JsonValue::String(text.to_string()));
    doc.insert(
        "data_period".into(),
        data_period.map_or(JsonValue::Null, |p| JsonValue::String(p.to_string())),
    );
    if let Err(reason) = parsed {
        doc.insert("parse_error".into(), JsonValue::String(reason));
    }
    JsonValue::Object(doc)
}

fn extract_json_object(text: &str) -> Result<Map<String, JsonValue>, String> {
    let body = strip_code_fence(text);
    let start = body.find('{').ok_or("no JSON object in response")?;
    let end = body.rfind('}').ok_or("no JSON object in response")?;
    if end < start {
        return Err("no JSON object in response".into());
    }
    match serde_json::from_str::<JsonValue>(&body[start..=end]) {
        Ok(JsonValue::Object(map)) => Ok(map),
        Ok(_) => Err("response JSON is not an object".into()),
        Err(err) => Err(format!("invalid JSON: {err}")),
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.rsplit_once("```").map_or(rest, |(body, _)| body).trim()
}

#[derive(Debug, Clone, PartialEq)]
pub enum InsightStageOutcome {
    Produced { changed: bool },
    Skipped(String),
    Degraded(InsightServiceError),
}

/// Run the generator over the last `window_months` aggregate rows and upsert
/// the result under `analysis_date`. Service failures degrade the outcome;
/// only storage errors are returned.
pub async fn run_insight_stage(
    db: &Database,
    generator: &dyn InsightGenerator,
    window_months: u32,
    timeout: Duration,
    analysis_date: NaiveDate,
    now: DateTime<Utc>,
) -> Result<InsightStageOutcome, StorageError> {
    let rows = db.recent_monthly_aggregates(window_months).await?;
    if rows.is_empty() {
        return Ok(InsightStageOutcome::Skipped("no aggregate rows to analyse".into()));
    }

    let request = InsightRequest::new(analysis_date, rows);
    let text = match tokio::time::timeout(timeout, generator.generate_insight(&request)).await {
        Ok(Ok(text)) => text,
        Ok(Err(InsightServiceError::NotConfigured)) => {
            return Ok(InsightStageOutcome::Skipped("insight generator not configured".into()));
        }
        Ok(Err(err)) => {
            warn!(error = %err, "insight service failed; continuing without insight");
            return Ok(InsightStageOutcome::Degraded(err));
        }
        Err(_) => {
            let err = InsightServiceError::Timeout(timeout.as_secs());
            warn!(timeout_ms = timeout.as_millis() as u64, "insight service timed out");
            return Ok(InsightStageOutcome::Degraded(err));
        }
    };

    let generated_json = parse_insight_text(&text, request.data_period().as_deref());
    if generated_json.get("parse_error").is_some() {
        warn!("insight response was not valid JSON; stored raw text only");
    }
    let insight = Insight {
        analysis_date,
        generated_json,
        model_version: generator.model_version().to_string(),
        load_timestamp: now,
    };
    let changed = db.upsert_insight(&insight).await?;
    info!(
        analysis_date = %analysis_date,
        model = %insight.model_version,
        months = request.rows.len(),
        changed,
        "stored insight"
    );
    Ok(InsightStageOutcome::Produced { changed })
}
