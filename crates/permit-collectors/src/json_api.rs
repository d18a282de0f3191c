use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use permit_core::{CollectorError, PermitRecord};
use permit_storage::HttpFetcher;
use reqwest::Url;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::{
    fetch_failure, CollectContext, CollectOutcome, Collector, CollectorKind, LookbackWindow,
    SourceConfig,
};

const SOCRATA_DEFAULT_PAGE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFlavor {
    /// ArcGIS feature-service `query` endpoint.
    ArcGis,
    /// Socrata SODA resource endpoint.
    Socrata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: usize,
    /// `None` asks for a single unpaged response.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiPage {
    /// Rows kept after windowing and type filtering.
    pub records: Vec<PermitRecord>,
    /// Rows the server returned, kept or not.
    pub row_count: usize,
    /// A row older than the lookback cutoff was seen. Results are newest
    /// first, so nothing further can qualify.
    pub reached_cutoff: bool,
    /// Server hint that more rows exist past this page (ArcGIS
    /// `exceededTransferLimit`).
    pub more_available: Option<bool>,
}

/// Offset pagination state for one collect call.
#[derive(Debug, Clone)]
pub struct Pager {
    page_size: Option<usize>,
    max_records: usize,
    next_offset: usize,
    collected: usize,
    finished: bool,
    truncated: bool,
}

impl Pager {
    pub fn new(page_size: Option<usize>, max_records: usize) -> Self {
        Self {
            page_size: page_size.filter(|size| *size > 0),
            max_records,
            next_offset: 0,
            collected: 0,
            finished: false,
            truncated: false,
        }
    }

    pub fn next_request(&self) -> Option<PageRequest> {
        if self.finished {
            return None;
        }
        Some(PageRequest {
            offset: self.next_offset,
            limit: self.page_size,
        })
    }

    pub fn record_page(&mut self, request: &PageRequest, page: &ApiPage) {
        self.next_offset += page.row_count;
        self.collected += page.records.len();

        if request.limit.is_none() && page.more_available == Some(true) && !page.reached_cutoff {
            self.truncated = true;
        }
        let more = match (request.limit, page.more_available) {
            (None, _) => false,
            (Some(_), Some(hint)) => hint,
            (Some(limit), None) => page.row_count >= limit,
        };
        self.finished = page.row_count == 0
            || page.reached_cutoff
            || self.collected >= self.max_records
            || !more;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// An unpaged response was cut short by the server while rows inside the
    /// lookback window were still pending.
    pub fn truncated(&self) -> bool {
        self.truncated
    }
}

fn json_text(row: &JsonValue, key: &str) -> Option<String> {
    match row.get(key)? {
        JsonValue::Null => None,
        JsonValue::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn error_message(error: &JsonValue) -> String {
    error
        .get("message")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

/// Parses one response body into canonical records.
pub fn parse_api_page(
    flavor: ApiFlavor,
    source: &SourceConfig,
    body: &[u8],
    window: &LookbackWindow,
    scraped_at: DateTime<Utc>,
) -> Result<ApiPage, CollectorError> {
    let structural = |cause: String| CollectorError::structural(&source.source_id, cause);
    let payload: JsonValue = serde_json::from_slice(body).map_err(|err| {
        CollectorError::transient(&source.source_id, format!("response was not valid JSON: {err}"))
    })?;

    let (rows, more_available): (Vec<&JsonValue>, Option<bool>) = match flavor {
        ApiFlavor::ArcGis => {
            if let Some(error) = payload.get("error") {
                return Err(structural(format!("arcgis error: {}", error_message(error))));
            }
            let features = payload
                .get("features")
                .and_then(JsonValue::as_array)
                .ok_or_else(|| structural("response has no features array".into()))?;
            let rows = features
                .iter()
                .map(|feature| feature.get("attributes").unwrap_or(feature))
                .collect();
            let more = payload
                .get("exceededTransferLimit")
                .and_then(JsonValue::as_bool);
            (rows, more)
        }
        ApiFlavor::Socrata => match &payload {
            JsonValue::Array(rows) => (rows.iter().collect(), None),
            JsonValue::Object(_) if payload.get("error").is_some() => {
                return Err(structural(format!("socrata error: {}", error_message(&payload))));
            }
            _ => return Err(structural("expected a JSON array of rows".into())),
        },
    };

    let mut page = ApiPage {
        records: Vec::new(),
        row_count: rows.len(),
        reached_cutoff: false,
        more_available,
    };
    for row in rows {
        if !row.is_object() {
            continue;
        }
        let lookup = |key: &str| json_text(row, key);
        let record = source.map_row(scraped_at, &lookup, row.clone());
        if !window.admits(source.row_date(&lookup, &record)) {
            page.reached_cutoff = true;
            continue;
        }
        if !source.accepts_permit_type(&record.permit_type) {
            continue;
        }
        page.records.push(record);
    }
    Ok(page)
}

/// Paginated, recency-ordered JSON API collector.
#[derive(Debug)]
pub struct JsonApiCollector {
    source: SourceConfig,
    flavor: ApiFlavor,
    endpoint: Url,
    page_size: Option<usize>,
    http: Arc<HttpFetcher>,
}

impl JsonApiCollector {
    pub fn new(
        source: SourceConfig,
        flavor: ApiFlavor,
        http: Arc<HttpFetcher>,
    ) -> Result<Self, CollectorError> {
        let endpoint = source.endpoint()?;
        let page_size = match flavor {
            ApiFlavor::ArcGis => source.page_size,
            ApiFlavor::Socrata => Some(source.page_size.unwrap_or(SOCRATA_DEFAULT_PAGE)),
        };
        Ok(Self {
            source,
            flavor,
            endpoint,
            page_size,
            http,
        })
    }

    /// Socrata filters the window server-side. ArcGIS services are queried with
    /// the configured clause only and windowed on the client.
    fn combined_filter(&self, window: &LookbackWindow) -> Option<String> {
        let date_filter = match self.flavor {
            ApiFlavor::ArcGis => None,
            ApiFlavor::Socrata => self.source.date_field.as_ref().map(|field| {
                format!("{field} >= '{}T00:00:00'", window.cutoff.format("%Y-%m-%d"))
            }),
        };
        match (self.source.where_clause.as_deref(), date_filter) {
            (Some(clause), Some(dates)) => Some(format!("({clause}) AND {dates}")),
            (Some(clause), None) => Some(clause.to_string()),
            (None, dates) => dates,
        }
    }

    pub fn page_url(&self, request: &PageRequest, window: &LookbackWindow) -> Url {
        let mut url = self.endpoint.clone();
        let filter = self.combined_filter(window);
        {
            let mut query = url.query_pairs_mut();
            match self.flavor {
                ApiFlavor::ArcGis => {
                    query.append_pair("where", filter.as_deref().unwrap_or("1=1"));
                    query.append_pair("outFields", "*");
                    query.append_pair("returnGeometry", "false");
                    if let Some(field) = &self.source.date_field {
                        query.append_pair("orderByFields", &format!("{field} DESC"));
                    }
                    if let Some(limit) = request.limit {
                        query.append_pair("resultOffset", &request.offset.to_string());
                        query.append_pair("resultRecordCount", &limit.to_string());
                    }
                    query.append_pair("f", "json");
                }
                ApiFlavor::Socrata => {
                    if let Some(field) = &self.source.date_field {
                        query.append_pair("$order", &format!("{field} DESC"));
                    }
                    if let Some(filter) = &filter {
                        query.append_pair("$where", filter);
                    }
                    if let Some(limit) = request.limit {
                        query.append_pair("$limit", &limit.to_string());
                        query.append_pair("$offset", &request.offset.to_string());
                    }
                }
            }
        }
        url
    }
}

#[async_trait]
impl Collector for JsonApiCollector {
    fn source_id(&self) -> &str {
        &self.source.source_id
    }

    fn kind(&self) -> CollectorKind {
        match self.flavor {
            ApiFlavor::ArcGis => CollectorKind::Arcgis,
            ApiFlavor::Socrata => CollectorKind::Socrata,
        }
    }

    async fn collect(&self, ctx: &CollectContext) -> CollectOutcome {
        let source_id = self.source.source_id.as_str();
        let max_records = self.source.max_records();
        let mut pager = Pager::new(self.page_size, max_records);
        let mut records = Vec::new();

        while let Some(request) = pager.next_request() {
            if let Some(err) = ctx.interruption(source_id) {
                return CollectOutcome::partial(records, err);
            }
            let url = self.page_url(&request, &ctx.window);
            let response = match self.http.fetch_bytes(ctx.run_id, source_id, &url).await {
                Ok(response) => response,
                Err(err) => return CollectOutcome::partial(records, fetch_failure(source_id, &err)),
            };
            let page = match parse_api_page(
                self.flavor,
                &self.source,
                &response.body,
                &ctx.window,
                ctx.scraped_at,
            ) {
                Ok(page) => page,
                Err(err) => return CollectOutcome::partial(records, err),
            };
            debug!(
                source_id,
                offset = request.offset,
                rows = page.row_count,
                kept = page.records.len(),
                "api page parsed"
            );
            pager.record_page(&request, &page);
            records.extend(page.records);
        }

        if pager.truncated() {
            warn!(
                source_id,
                kept = records.len(),
                "transfer limit hit inside the lookback window; older permits dropped"
            );
        }
        records.truncate(max_records);
        CollectOutcome::complete(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{scraped_at, source};
    use permit_core::FailureKind;
    use permit_storage::HttpClientConfig;
    use std::collections::HashMap;

    fn window() -> LookbackWindow {
        LookbackWindow::ending_at(scraped_at(), 30)
    }

    fn socrata_source() -> SourceConfig {
        source(
            CollectorKind::Socrata,
            "date_field: applieddate\nwhere_clause: permittype = 'Residential'\nfields:\n  permit_number: [permitnum]\n  address: [originaladdress1, originalcity]\n  permit_type: [permitclass, permittype]\n  applied_date: [applieddate]\n",
        )
    }

    fn page(rows: usize, kept: usize) -> ApiPage {
        ApiPage {
            records: vec![PermitRecord::new("test", scraped_at()); kept],
            row_count: rows,
            reached_cutoff: false,
            more_available: None,
        }
    }

    #[test]
    fn socrata_rows_inside_the_window_are_kept() {
        let body = br#"[
            {"permitnum": "B-1", "originaladdress1": "1 Market St", "originalcity": "Chattanooga",
             "permitclass": "Residential", "permittype": "Addition", "applieddate": "2026-03-05T00:00:00.000"},
            {"permitnum": "B-2", "originaladdress1": "9 Broad St", "originalcity": "Chattanooga",
             "permitclass": "Commercial", "permittype": "Remodel", "applieddate": "2026-02-20T00:00:00.000"},
            {"permitnum": "B-3", "originaladdress1": "4 Old Rd", "originalcity": "Chattanooga",
             "permitclass": "Residential", "permittype": "Fence", "applieddate": "2025-12-01T00:00:00.000"}
        ]"#;
        let page =
            parse_api_page(ApiFlavor::Socrata, &socrata_source(), body, &window(), scraped_at())
                .unwrap();
        assert_eq!(page.row_count, 3);
        assert!(page.reached_cutoff);
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0].permit_number, "B-1");
        assert_eq!(page.records[0].address, "1 Market St, Chattanooga");
        assert_eq!(page.records[1].permit_type, "Commercial - Remodel");
    }

    #[test]
    fn empty_result_is_no_new_data() {
        let page =
            parse_api_page(ApiFlavor::Socrata, &socrata_source(), b"[]", &window(), scraped_at())
                .unwrap();
        assert!(page.records.is_empty());
        let mut pager = Pager::new(Some(100), 5000);
        let request = pager.next_request().unwrap();
        pager.record_page(&request, &page);
        assert!(pager.is_finished());
    }

    #[test]
    fn arcgis_error_object_is_structural() {
        let body = br#"{"error": {"code": 400, "message": "Invalid field: DATE_ACCEPTED"}}"#;
        let config = source(CollectorKind::Arcgis, "");
        let err =
            parse_api_page(ApiFlavor::ArcGis, &config, body, &window(), scraped_at()).unwrap_err();
        assert_eq!(err.kind, FailureKind::Structural);
        assert!(err.cause.contains("Invalid field"));
    }

    #[test]
    fn garbled_body_is_transient() {
        let config = source(CollectorKind::Arcgis, "");
        let body = b"<html>busy</html>";
        let err =
            parse_api_page(ApiFlavor::ArcGis, &config, body, &window(), scraped_at()).unwrap_err();
        assert_eq!(err.kind, FailureKind::Transient);
    }

    #[test]
    fn arcgis_epoch_dates_and_numeric_values_map() {
        let config = source(
            CollectorKind::Arcgis,
            "date_field: DATE_ACCEPTED\nfields:\n  permit_number: [CASE_NUMBER]\n  address: [LOCATION]\n  estimated_value: [CONSTVAL]\n  issue_date: [DATE_ACCEPTED]\n",
        );
        let body = br#"{"features": [
            {"attributes": {"CASE_NUMBER": "T2026-1", "LOCATION": "100 Broadway", "CONSTVAL": 250000, "DATE_ACCEPTED": 1772323200000}},
            {"attributes": {"CASE_NUMBER": "T2026-2", "LOCATION": "5 Elm St", "CONSTVAL": null, "DATE_ACCEPTED": null}}
        ], "exceededTransferLimit": true}"#;
        let page =
            parse_api_page(ApiFlavor::ArcGis, &config, body, &window(), scraped_at()).unwrap();
        assert_eq!(page.more_available, Some(true));
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0].estimated_value, 250_000.0);
        assert_eq!(
            page.records[0].issue_date,
            chrono::NaiveDate::from_ymd_opt(2026, 3, 1)
        );
        // undated rows are kept
        assert_eq!(page.records[1].estimated_value, 0.0);
        assert!(page.records[1].issue_date.is_none());
    }

    #[test]
    fn pager_follows_full_pages_and_stops_on_short_ones() {
        let mut pager = Pager::new(Some(2), 5000);
        let first = pager.next_request().unwrap();
        assert_eq!(first, PageRequest { offset: 0, limit: Some(2) });
        pager.record_page(&first, &page(2, 2));
        let second = pager.next_request().unwrap();
        assert_eq!(second.offset, 2);
        pager.record_page(&second, &page(1, 1));
        assert!(pager.next_request().is_none());
    }

    #[test]
    fn pager_stops_at_cutoff_and_record_cap() {
        let mut pager = Pager::new(Some(2), 5000);
        let request = pager.next_request().unwrap();
        let mut cut = page(2, 1);
        cut.reached_cutoff = true;
        pager.record_page(&request, &cut);
        assert!(pager.is_finished());

        let mut capped = Pager::new(Some(2), 3);
        let request = capped.next_request().unwrap();
        capped.record_page(&request, &page(2, 2));
        let request = capped.next_request().unwrap();
        capped.record_page(&request, &page(2, 2));
        assert!(capped.is_finished());
    }

    #[test]
    fn pager_trusts_the_server_hint_and_unpaged_requests_run_once() {
        let mut pager = Pager::new(Some(2000), 5000);
        let request = pager.next_request().unwrap();
        let mut truncated = page(1000, 1000);
        truncated.more_available = Some(true);
        pager.record_page(&request, &truncated);
        assert_eq!(pager.next_request().unwrap().offset, 1000);

        let mut single = Pager::new(None, 5000);
        let request = single.next_request().unwrap();
        assert_eq!(request.limit, None);
        single.record_page(&request, &page(40, 40));
        assert!(single.is_finished());
        assert!(!single.truncated());
    }

    #[test]
    fn unpaged_response_over_the_transfer_limit_is_flagged() {
        let mut pager = Pager::new(None, 5000);
        let request = pager.next_request().unwrap();
        let mut full = page(1000, 1000);
        full.more_available = Some(true);
        pager.record_page(&request, &full);
        assert!(pager.is_finished());
        assert!(pager.truncated());

        let mut windowed = Pager::new(None, 5000);
        let request = windowed.next_request().unwrap();
        let mut cut = page(1000, 600);
        cut.more_available = Some(true);
        cut.reached_cutoff = true;
        windowed.record_page(&request, &cut);
        assert!(!windowed.truncated());
    }

    #[test]
    fn socrata_urls_order_by_recency_and_filter_the_window() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let collector = JsonApiCollector::new(socrata_source(), ApiFlavor::Socrata, http).unwrap();
        let url = collector.page_url(&PageRequest { offset: 1000, limit: Some(1000) }, &window());
        let pairs: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["$order"], "applieddate DESC");
        assert_eq!(
            pairs["$where"],
            "(permittype = 'Residential') AND applieddate >= '2026-02-08T00:00:00'"
        );
        assert_eq!(pairs["$limit"], "1000");
        assert_eq!(pairs["$offset"], "1000");
    }

    #[test]
    fn arcgis_urls_request_json_without_geometry() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let config = source(CollectorKind::Arcgis, "date_field: DATE_ACCEPTED\n");
        let collector = JsonApiCollector::new(config, ApiFlavor::ArcGis, http).unwrap();
        let url = collector.page_url(&PageRequest { offset: 0, limit: None }, &window());
        let pairs: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["where"], "1=1");
        assert_eq!(pairs["orderByFields"], "DATE_ACCEPTED DESC");
        assert_eq!(pairs["returnGeometry"], "false");
        assert_eq!(pairs["f"], "json");
        assert!(!pairs.contains_key("resultOffset"));
    }
}
