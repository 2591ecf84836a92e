//! Source connector contracts, the central-bank web-indicator adapter and a
//! fixture-backed adapter sharing the same payload normaliser.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use eip_core::{format_date, SourceError, SourcePoint};
use eip_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "eip-adapters";

pub const SARB_SOURCE_ID: &str = "sarb_webindicators";
pub const SARB_BASE_URL: &str = "https://www.resbank.co.za/webindicators/DataDownload";
pub const FIXTURE_SOURCE_ID: &str = "fixture";

/// Earliest observation requested when no start date is configured.
pub fn default_history_floor() -> NaiveDate {
    NaiveDate::from_ymd_opt(2010, 1, 1).unwrap_or(NaiveDate::MIN)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesRequest {
    pub indicator_code: String,
    pub start: NaiveDate,
    pub end: Option<NaiveDate>,
}

impl SeriesRequest {
    /// Everything from `start` up to and including `end` (normally the run date).
    pub fn from_floor(indicator_code: &str, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            indicator_code: indicator_code.to_string(),
            start,
            end: Some(end),
        }
    }
}

/// One indicator's response: the untouched body plus its normalised points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedSeries {
    pub indicator_code: String,
    pub source: String,
    pub url: String,
    pub content_type: String,
    pub raw_body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
    pub points: Vec<SourcePoint>,
}

impl FetchedSeries {
    /// File extension used when storing `raw_body` in the artifact store.
    pub fn extension(&self) -> &'static str {
        if is_json_content_type(&self.content_type) {
            "json"
        } else if self.content_type.contains("csv") {
            "csv"
        } else {
            "txt"
        }
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    /// Fetch one indicator for the requested range. Each call re-fetches from scratch.
    async fn fetch_series(
        &self,
        ctx: &FetchContext,
        request: &SeriesRequest,
    ) -> Result<FetchedSeries, SourceError>;
}

/// Live adapter for the SARB web-indicators download endpoint.
#[derive(Debug, Clone)]
pub struct SarbWebIndicatorsAdapter {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl SarbWebIndicatorsAdapter {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self::with_base_url(http, SARB_BASE_URL)
    }

    pub fn with_base_url(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn series_url(&self, request: &SeriesRequest) -> String {
        let mut url = format!(
            "{}?SeriesNames={}&startDate={}",
            self.base_url.trim_end_matches('?'),
            request.indicator_code,
            format_date(request.start)
        );
        if let Some(end) = request.end {
            url.push_str(&format!("&endDate={}", format_date(end)));
        }
        url
    }
}

#[async_trait]
impl SourceAdapter for SarbWebIndicatorsAdapter {
    fn source_id(&self) -> &str {
        SARB_SOURCE_ID
    }

    async fn fetch_series(
        &self,
        ctx: &FetchContext,
        request: &SeriesRequest,
    ) -> Result<FetchedSeries, SourceError> {
        let url = self.series_url(request);
        let response = self
            .http
            .fetch_bytes(ctx.run_id, &request.indicator_code, &url)
            .await
            .map_err(|err| unavailable(&request.indicator_code, &err))?;

        let content_type = response
            .content_type
            .unwrap_or_else(|| sniff_content_type(&response.body).to_string());
        let points =
            parse_series_payload(&request.indicator_code, Some(&content_type), &response.body)?;
        debug!(
            indicator = %request.indicator_code,
            points = points.len(),
            status = %response.status,
            "parsed source payload"
        );

        Ok(FetchedSeries {
            indicator_code: request.indicator_code.clone(),
            source: SARB_SOURCE_ID.to_string(),
            url: response.final_url,
            content_type,
            raw_body: response.body,
            fetched_at: ctx.fetched_at,
            points,
        })
    }
}

fn unavailable(indicator: &str, err: &FetchError) -> SourceError {
    SourceError::Unavailable {
        indicator: indicator.to_string(),
        reason: err.to_string(),
    }
}

/// Offline adapter reading `<root>/<indicator_code>.json` captures.
#[derive(Debug, Clone)]
pub struct FixtureSourceAdapter {
    root: PathBuf,
}

impl FixtureSourceAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn fixture_path(&self, indicator_code: &str) -> PathBuf {
        self.root.join(format!("{indicator_code}.json"))
    }
}

async fn read_fixture(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("reading fixture {}", path.display()))
}

#[async_trait]
impl SourceAdapter for FixtureSourceAdapter {
    fn source_id(&self) -> &str {
        FIXTURE_SOURCE_ID
    }

    async fn fetch_series(
        &self,
        ctx: &FetchContext,
        request: &SeriesRequest,
    ) -> Result<FetchedSeries, SourceError> {
        let path = self.fixture_path(&request.indicator_code);
        let body = read_fixture(&path).await.map_err(|err| SourceError::Unavailable {
            indicator: request.indicator_code.clone(),
            reason: format!("{err:#}"),
        })?;
        let points = parse_series_payload(&request.indicator_code, Some("application/json"), &body)?;
        Ok(FetchedSeries {
            indicator_code: request.indicator_code.clone(),
            source: FIXTURE_SOURCE_ID.to_string(),
            url: format!("file://{}", path.display()),
            content_type: "application/json".to_string(),
            raw_body: body,
            fetched_at: ctx.fetched_at,
            points,
        })
    }
}

fn is_json_content_type(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("json")
}

fn is_html_content_type(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("html")
}

fn sniff_content_type(body: &[u8]) -> &'static str {
    match body.iter().find(|b| !b.is_ascii_whitespace()) {
        Some(b'{') | Some(b'[') => "application/json",
        Some(b'<') => "text/html",
        _ => "text/csv",
    }
}

/// Normalise a source body into date-ordered points, keeping values as raw text.
///
/// Accepts `{"indicator_code", "data": [..]}`, a bare array of point objects,
/// or `date,value` CSV when the content type is not JSON. HTML bodies
/// (maintenance and error pages) are format errors.
pub fn parse_series_payload(
    indicator_code: &str,
    content_type: Option<&str>,
    body: &[u8],
) -> Result<Vec<SourcePoint>, SourceError> {
    let format_err = |reason: String| SourceError::Format {
        indicator: indicator_code.to_string(),
        reason,
    };

    let text = std::str::from_utf8(body).map_err(|err| format_err(err.to_string()))?;
    let content_type = content_type.unwrap_or_else(|| sniff_content_type(body));
    if is_html_content_type(content_type) || sniff_content_type(body) == "text/html" {
        return Err(format_err(format!("markup response ({content_type}), not a time series")));
    }

    let mut points = if is_json_content_type(content_type) {
        let value: JsonValue =
            serde_json::from_str(text).map_err(|err| format_err(format!("invalid json: {err}")))?;
        json_points(indicator_code, &value).map_err(format_err)?
    } else {
        csv_points(text).map_err(format_err)?
    };

    points.sort_by(|a, b| (a.date.is_none(), &a.date).cmp(&(b.date.is_none(), &b.date)));
    Ok(points)
}

fn json_points(indicator_code: &str, value: &JsonValue) -> Result<Vec<SourcePoint>, String> {
    match value {
        JsonValue::Array(items) => items.iter().map(json_point).collect(),
        JsonValue::Object(map) => {
            if let Some(code) = map.get("indicator_code").and_then(JsonValue::as_str) {
                if code != indicator_code {
                    return Err(format!("payload is for {code}, expected {indicator_code}"));
                }
            }
            match map.get("data") {
                Some(JsonValue::Array(items)) => items.iter().map(json_point).collect(),
                Some(JsonValue::Null) => Ok(Vec::new()),
                Some(other) => Err(format!("`data` must be an array, found {}", type_name(other))),
                None => Err("object payload has no `data` array".to_string()),
            }
        }
        other => Err(format!("unsupported top-level {}", type_name(other))),
    }
}

fn json_point(item: &JsonValue) -> Result<SourcePoint, String> {
    let JsonValue::Object(map) = item else {
        return Err(format!("series entry must be an object, found {}", type_name(item)));
    };
    let lookup = |keys: &[&str]| {
        map.iter()
            .find(|(k, _)| keys.iter().any(|key| k.eq_ignore_ascii_case(key)))
            .map(|(_, v)| v)
    };
    Ok(SourcePoint {
        date: lookup(&["date", "period", "observation_date"]).and_then(raw_text),
        value: lookup(&["value", "observation_value"]).and_then(raw_text),
    })
}

fn raw_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Lines with fewer than two fields are skipped; a non-empty body with no
/// `date,value` line at all is malformed.
fn csv_points(text: &str) -> Result<Vec<SourcePoint>, String> {
    let mut lines = text.lines().map(str::trim).filter(|line| !line.is_empty()).peekable();
    if lines.peek().is_none() {
        return Ok(Vec::new());
    }
    if lines
        .peek()
        .is_some_and(|header| header.to_ascii_lowercase().contains("date"))
    {
        lines.next();
    }

    let mut skipped = 0usize;
    let mut points = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split(',').map(|f| f.trim().trim_matches('"')).collect();
        if fields.len() < 2 {
            skipped += 1;
            continue;
        }
        let non_empty = |f: &str| (!f.is_empty()).then(|| f.to_string());
        points.push(SourcePoint {
            date: non_empty(fields[0]),
            value: non_empty(fields[1]),
        });
    }

    if points.is_empty() && skipped > 0 {
        return Err(format!("no date,value rows among {skipped} line(s)"));
    }
    if skipped > 0 {
        debug!(skipped, "ignored csv lines without a value column");
    }
    Ok(points)
}
