use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use permit_core::{CollectorError, PermitRecord};
use permit_storage::HttpFetcher;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::debug;

use crate::{
    apply_field, fetch_failure, CanonicalField, CollectContext, CollectOutcome, Collector,
    CollectorKind, LookbackWindow, SourceConfig,
};

fn selector(source_id: &str, css: &str) -> Result<Selector, CollectorError> {
    Selector::parse(css).map_err(|e| {
        CollectorError::structural(source_id, format!("invalid selector {css:?}: {e}"))
    })
}

fn cell_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Guesses the canonical field for a header cell label.
fn infer_column(label: &str) -> Option<CanonicalField> {
    let label = label.to_lowercase();
    let field = if label.contains("permit") && !label.contains("type") {
        CanonicalField::PermitNumber
    } else if label.contains("address") || label.contains("location") {
        CanonicalField::Address
    } else if label.contains("type") || label.contains("class") {
        CanonicalField::PermitType
    } else if label.contains("value") || label.contains("valuation") || label.contains("cost") {
        CanonicalField::EstimatedValue
    } else if label.contains("applied") {
        CanonicalField::AppliedDate
    } else if label.contains("date") || label.contains("issued") {
        CanonicalField::IssueDate
    } else if label.contains("contractor") {
        CanonicalField::Contractor
    } else if label.contains("owner") {
        CanonicalField::Owner
    } else if label.contains("description") || label.contains("work") {
        CanonicalField::WorkDescription
    } else if label.contains("status") {
        CanonicalField::Status
    } else {
        return None;
    };
    Some(field)
}

/// Finds the landing-page link whose text or href matches the most keywords.
/// Ties go to the earliest link on the page.
pub fn discover_report_link(html: &str, base: &Url, keywords: &[String]) -> Option<Url> {
    let document = Html::parse_document(html);
    let anchors = Selector::parse("a[href]").ok()?;
    let keywords: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();

    let mut best: Option<(usize, Url)> = None;
    for anchor in document.select(&anchors) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let haystack = format!("{} {}", cell_text(anchor), href).to_lowercase();
        let hits = keywords
            .iter()
            .filter(|keyword| haystack.contains(keyword.as_str()))
            .count();
        if hits == 0 || best.as_ref().is_some_and(|(score, _)| *score >= hits) {
            continue;
        }
        if let Ok(url) = base.join(href.trim()) {
            best = Some((hits, url));
        }
    }
    best.map(|(_, url)| url)
}

/// Reads permits out of the first table matching the source's selector that
/// has at least one data row. Short rows leave the missing fields at their
/// defaults. Records outside `window` or rejected by the type allow-list are
/// dropped.
pub fn parse_permit_table(
    source: &SourceConfig,
    html: &str,
    window: &LookbackWindow,
    scraped_at: DateTime<Utc>,
) -> Result<Vec<PermitRecord>, CollectorError> {
    let source_id = source.source_id.as_str();
    let document = Html::parse_document(html);
    let tables = selector(source_id, source.table_selector.as_deref().unwrap_or("table"))?;
    let rows_sel = selector(source_id, "tr")?;
    let data_sel = selector(source_id, "td")?;
    let cells_sel = selector(source_id, "td, th")?;

    for table in document.select(&tables) {
        let mut header: Vec<String> = Vec::new();
        let mut data_rows: Vec<Vec<String>> = Vec::new();
        for row in table.select(&rows_sel) {
            let cells: Vec<String> = row.select(&cells_sel).map(cell_text).collect();
            if row.select(&data_sel).next().is_none() {
                if header.is_empty() {
                    header = cells;
                }
                continue;
            }
            data_rows.push(cells);
        }
        if data_rows.is_empty() {
            continue;
        }

        let columns: Vec<Option<CanonicalField>> = if source.columns.is_empty() {
            header.iter().map(|label| infer_column(label)).collect()
        } else {
            source.columns.iter().copied().map(Some).collect()
        };

        let mut records = Vec::new();
        for cells in data_rows {
            let mut raw = JsonMap::new();
            for (index, cell) in cells.iter().enumerate() {
                let label = header
                    .get(index)
                    .filter(|label| !label.is_empty())
                    .cloned()
                    .unwrap_or_else(|| format!("col{index}"));
                raw.insert(label, JsonValue::String(cell.clone()));
            }
            let mut record = PermitRecord::new(source_id, scraped_at);
            record.jurisdiction = source.jurisdiction.clone();
            record.raw_payload = JsonValue::Object(raw);
            for (index, field) in columns.iter().enumerate() {
                if let (Some(field), Some(cell)) = (field, cells.get(index)) {
                    apply_field(&mut record, *field, cell);
                }
            }
            if window.admits(record.identity_date())
                && source.accepts_permit_type(&record.permit_type)
            {
                records.push(record);
            }
        }
        return Ok(records);
    }

    Err(CollectorError::transient(
        source_id,
        "no permit table with data rows found on page",
    ))
}

/// Scrapes a permit listing published as an HTML table, optionally reached
/// through a link on a landing page.
#[derive(Debug)]
pub struct HtmlTableCollector {
    source: SourceConfig,
    endpoint: Url,
    http: Arc<HttpFetcher>,
}

impl HtmlTableCollector {
    pub fn new(source: SourceConfig, http: Arc<HttpFetcher>) -> Result<Self, CollectorError> {
        let endpoint = source.endpoint()?;
        Ok(Self {
            source,
            endpoint,
            http,
        })
    }
}

#[async_trait]
impl Collector for HtmlTableCollector {
    fn source_id(&self) -> &str {
        &self.source.source_id
    }

    fn kind(&self) -> CollectorKind {
        CollectorKind::HtmlTable
    }

    async fn collect(&self, ctx: &CollectContext) -> CollectOutcome {
        let body = match fetch_report(&self.http, ctx, &self.source, &self.endpoint).await {
            Ok(body) => String::from_utf8_lossy(&body).into_owned(),
            Err(err) => return CollectOutcome::failed(err),
        };
        match parse_permit_table(&self.source, &body, &ctx.window, ctx.scraped_at) {
            Ok(mut records) => {
                records.truncate(self.source.max_records());
                CollectOutcome::complete(records)
            }
            Err(err) => CollectOutcome::failed(err),
        }
    }
}

/// Fetches the source URL, or, when link keywords are configured, the report
/// linked from it.
pub(crate) async fn fetch_report(
    http: &HttpFetcher,
    ctx: &CollectContext,
    source: &SourceConfig,
    endpoint: &Url,
) -> Result<Vec<u8>, CollectorError> {
    let source_id = source.source_id.as_str();
    let landing = http
        .fetch_bytes(ctx.run_id, source_id, endpoint)
        .await
        .map_err(|err| fetch_failure(source_id, &err))?;
    if source.discover_link_keywords.is_empty() {
        return Ok(landing.body);
    }

    let base = Url::parse(&landing.final_url).unwrap_or_else(|_| endpoint.clone());
    let html = String::from_utf8_lossy(&landing.body);
    let report = discover_report_link(&html, &base, &source.discover_link_keywords).ok_or_else(
        || CollectorError::transient(source_id, "no report link matched the configured keywords"),
    )?;
    debug!(source_id, report = %report, "following report link");
    if let Some(err) = ctx.interruption(source_id) {
        return Err(err);
    }
    let response = http
        .fetch_bytes(ctx.run_id, source_id, &report)
        .await
        .map_err(|err| fetch_failure(source_id, &err))?;
    Ok(response.body)
}
