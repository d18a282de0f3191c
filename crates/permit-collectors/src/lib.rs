//! Source collector contract, per-source configuration, and the transport-specific
//! collectors (JSON APIs, CSV exports, HTML tables, PDF reports).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, Utc};
use permit_core::{CollectorError, PermitRecord};
use permit_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use scraper::Html;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

mod csv_export;
mod html_table;
mod json_api;
mod pdf_report;

pub use csv_export::{CsvExportCollector, CsvExportParser, CsvRowStream};
pub use html_table::{discover_report_link, parse_permit_table, HtmlTableCollector};
pub use json_api::{parse_api_page, ApiFlavor, ApiPage, JsonApiCollector, PageRequest, Pager};
pub use pdf_report::{parse_report_text, PdfReportCollector};

pub const CRATE_NAME: &str = "permit-collectors";

/// Fallback cap on records taken from one source in one cycle.
pub const DEFAULT_MAX_RECORDS: usize = 5000;
/// Longest work description kept on a canonical record.
pub const DESCRIPTION_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorKind {
    Arcgis,
    Socrata,
    Csv,
    HtmlTable,
    PdfReport,
}

impl fmt::Display for CollectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CollectorKind::Arcgis => "arcgis",
            CollectorKind::Socrata => "socrata",
            CollectorKind::Csv => "csv",
            CollectorKind::HtmlTable => "html_table",
            CollectorKind::PdfReport => "pdf_report",
        };
        f.write_str(label)
    }
}

/// Canonical record fields a source column can be mapped onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    PermitNumber,
    Address,
    PermitType,
    WorkDescription,
    EstimatedValue,
    IssueDate,
    AppliedDate,
    Contractor,
    Owner,
    Status,
}

impl CanonicalField {
    /// Separator used when several source keys feed the same field.
    fn joiner(self) -> &'static str {
        match self {
            CanonicalField::Address => ", ",
            CanonicalField::PermitType => " - ",
            _ => " ",
        }
    }

    /// Fields whose value is a single token; only the first non-empty key counts.
    fn takes_first(self) -> bool {
        matches!(
            self,
            CanonicalField::PermitNumber
                | CanonicalField::EstimatedValue
                | CanonicalField::IssueDate
                | CanonicalField::AppliedDate
        )
    }
}

/// One entry of `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default)]
    pub jurisdiction: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub kind: CollectorKind,
    pub url: String,
    #[serde(default)]
    pub lookback_days: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub max_records: Option<usize>,
    /// Source column holding the recency date used for ordering and windowing.
    #[serde(default)]
    pub date_field: Option<String>,
    #[serde(default)]
    pub where_clause: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<CanonicalField, Vec<String>>,
    /// HTML tables: canonical field per cell position.
    #[serde(default)]
    pub columns: Vec<CanonicalField>,
    #[serde(default)]
    pub table_selector: Option<String>,
    #[serde(default)]
    pub discover_link_keywords: Vec<String>,
    #[serde(default)]
    pub include_types: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_true() -> bool {
    true
}

impl SourceConfig {
    pub fn max_records(&self) -> usize {
        self.max_records.unwrap_or(DEFAULT_MAX_RECORDS).max(1)
    }

    /// Keyword allow-list on permit type. An empty list accepts everything.
    pub fn accepts_permit_type(&self, permit_type: &str) -> bool {
        if self.include_types.is_empty() {
            return true;
        }
        let lowered = permit_type.to_lowercase();
        self.include_types
            .iter()
            .any(|keyword| lowered.contains(&keyword.to_lowercase()))
    }

    pub fn endpoint(&self) -> Result<Url, CollectorError> {
        Url::parse(&self.url).map_err(|err| {
            CollectorError::structural(&self.source_id, format!("invalid url {}: {err}", self.url))
        })
    }

    /// Builds a canonical record from one source row. `lookup` returns the raw
    /// text stored under a source key, or `None` when the row lacks it.
    pub fn map_row<F>(&self, scraped_at: DateTime<Utc>, lookup: F, raw: JsonValue) -> PermitRecord
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut record = PermitRecord::new(&self.source_id, scraped_at);
        record.jurisdiction = self.jurisdiction.clone();
        record.raw_payload = raw;

        for (field, keys) in &self.fields {
            let mut values = keys
                .iter()
                .filter_map(|key| lookup(key.as_str()))
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty());
            let joined = if field.takes_first() {
                values.next()
            } else {
                let parts: Vec<String> = values.collect();
                (!parts.is_empty()).then(|| parts.join(field.joiner()))
            };
            if let Some(value) = joined {
                apply_field(&mut record, *field, &value);
            }
        }
        record
    }

    /// Recency date of a row for windowing: the configured date column when
    /// present, the record's identity date otherwise.
    pub fn row_date<F>(&self, lookup: F, record: &PermitRecord) -> Option<NaiveDate>
    where
        F: Fn(&str) -> Option<String>,
    {
        match &self.date_field {
            Some(field) => lookup(field.as_str())
                .and_then(|text| parse_source_date(&text))
                .or_else(|| record.identity_date()),
            None => record.identity_date(),
        }
    }
}

pub(crate) fn fetch_failure(source_id: &str, err: &FetchError) -> CollectorError {
    CollectorError {
        source_id: source_id.to_string(),
        kind: err.failure_kind(),
        cause: err.to_string(),
        partial_results: 0,
    }
}

/// Writes a raw source value into a canonical field, converting as needed.
/// Unparseable numbers and dates fall back to the record defaults.
pub fn apply_field(record: &mut PermitRecord, field: CanonicalField, value: &str) {
    let value = value.trim();
    if value.is_empty() {
        return;
    }
    match field {
        CanonicalField::PermitNumber => record.permit_number = value.to_string(),
        CanonicalField::Address => record.address = value.to_string(),
        CanonicalField::PermitType => record.permit_type = value.to_string(),
        CanonicalField::WorkDescription => record.work_description = strip_markup(value),
        CanonicalField::EstimatedValue => record.estimated_value = parse_money(value),
        CanonicalField::IssueDate => record.issue_date = parse_source_date(value),
        CanonicalField::AppliedDate => record.applied_date = parse_source_date(value),
        CanonicalField::Contractor => record.contractor = Some(value.to_string()),
        CanonicalField::Owner => record.owner = Some(value.to_string()),
        CanonicalField::Status => record.status = Some(value.to_string()),
    }
}

pub fn parse_money(text: &str) -> f64 {
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, '$' | ',') && !c.is_whitespace())
        .collect();
    match cleaned.parse::<f64>() {
        Ok(value) if value.is_finite() && value > 0.0 => value,
        _ => 0.0,
    }
}

/// Accepts ISO dates and date-times, `MM/DD/YYYY` with an optional trailing
/// time, and epoch timestamps (seconds or milliseconds).
pub fn parse_source_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if text.chars().all(|c| c.is_ascii_digit() || c == '-') && text.len() >= 9 {
        if let Ok(epoch) = text.parse::<i64>() {
            let at = if text.trim_start_matches('-').len() >= 12 {
                DateTime::from_timestamp_millis(epoch)
            } else {
                DateTime::from_timestamp(epoch, 0)
            };
            return at.map(|at| at.date_naive());
        }
    }

    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(at.with_timezone(&Utc).date_naive());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(at) = NaiveDateTime::parse_from_str(text, format) {
            return Some(at.date());
        }
    }

    let token = text.split([' ', 'T']).next().unwrap_or(text);
    ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d", "%m/%d/%y"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(token, format).ok())
}

/// Drops HTML tags, collapses whitespace, and truncates to [`DESCRIPTION_LIMIT`]
/// characters.
pub fn strip_markup(text: &str) -> String {
    let fragment = Html::parse_fragment(text);
    let plain = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    let collapsed = plain.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(DESCRIPTION_LIMIT).collect()
}

/// Inclusive lower bound on record dates accepted this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookbackWindow {
    pub cutoff: NaiveDate,
}

impl LookbackWindow {
    pub fn ending_at(now: DateTime<Utc>, days: u32) -> Self {
        Self {
            cutoff: (now - ChronoDuration::days(i64::from(days))).date_naive(),
        }
    }

    /// Undated records are kept (fail open).
    pub fn admits(&self, date: Option<NaiveDate>) -> bool {
        date.map_or(true, |date| date >= self.cutoff)
    }
}

/// Everything a collector needs from the orchestrator for one cycle.
#[derive(Debug, Clone)]
pub struct CollectContext {
    pub run_id: Uuid,
    pub scraped_at: DateTime<Utc>,
    pub window: LookbackWindow,
    /// Soft deadline checked between pages and chunks.
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

impl CollectContext {
    /// Returns the error a collector should stop with, if it must stop now.
    pub fn interruption(&self, source_id: &str) -> Option<CollectorError> {
        if self.cancel.is_cancelled() {
            Some(CollectorError::transient(source_id, "cancelled"))
        } else if Instant::now() >= self.deadline {
            Some(CollectorError::transient(source_id, "budget exhausted"))
        } else {
            None
        }
    }
}

/// Result of one `collect` call: whatever parsed, plus an optional annotation.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectOutcome {
    pub records: Vec<PermitRecord>,
    pub error: Option<CollectorError>,
}

impl CollectOutcome {
    pub fn complete(records: Vec<PermitRecord>) -> Self {
        Self {
            records,
            error: None,
        }
    }

    pub fn failed(error: CollectorError) -> Self {
        Self {
            records: Vec::new(),
            error: Some(error),
        }
    }

    /// Valid records plus an error; the error's `partial_results` is set to
    /// the number of records kept.
    pub fn partial(records: Vec<PermitRecord>, error: CollectorError) -> Self {
        let error = error.with_partial_results(records.len());
        Self {
            records,
            error: Some(error),
        }
    }
}

/// A source of permit records. Collectors only read from the outside world;
/// every failure is returned as data on the outcome.
#[async_trait]
pub trait Collector: Send + Sync {
    fn source_id(&self) -> &str;
    fn kind(&self) -> CollectorKind;

    async fn collect(&self, ctx: &CollectContext) -> CollectOutcome;
}

pub fn collector_for_source(
    source: &SourceConfig,
    http: Arc<HttpFetcher>,
) -> Result<Arc<dyn Collector>, CollectorError> {
    let collector: Arc<dyn Collector> = match source.kind {
        CollectorKind::Arcgis => {
            Arc::new(JsonApiCollector::new(source.clone(), ApiFlavor::ArcGis, http)?)
        }
        CollectorKind::Socrata => {
            Arc::new(JsonApiCollector::new(source.clone(), ApiFlavor::Socrata, http)?)
        }
        CollectorKind::Csv => Arc::new(CsvExportCollector::new(source.clone(), http)?),
        CollectorKind::HtmlTable => Arc::new(HtmlTableCollector::new(source.clone(), http)?),
        CollectorKind::PdfReport => Arc::new(PdfReportCollector::new(source.clone(), http)?),
    };
    Ok(collector)
}
