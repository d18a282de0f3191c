use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use permit_core::{CollectorError, PermitRecord};
use permit_storage::HttpFetcher;
use reqwest::Url;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::debug;

use crate::{
    fetch_failure, CollectContext, CollectOutcome, Collector, CollectorKind, LookbackWindow,
    SourceConfig,
};

/// Incremental CSV reader. Bytes are buffered only up to the last line break
/// that falls outside a quoted field; everything before it is parsed and
/// released.
#[derive(Debug, Default)]
pub struct CsvRowStream {
    buffer: Vec<u8>,
    scanned: usize,
    in_quotes: bool,
    headers: Option<Vec<String>>,
}

impl CsvRowStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Header names from the first row, once it has been read.
    pub fn headers(&self) -> Option<&[String]> {
        self.headers.as_deref()
    }

    /// Appends a chunk and returns the data rows it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<String>>, csv::Error> {
        self.buffer.extend_from_slice(chunk);

        let mut boundary = None;
        for (offset, byte) in self.buffer[self.scanned..].iter().enumerate() {
            match byte {
                b'"' => self.in_quotes = !self.in_quotes,
                b'\n' if !self.in_quotes => boundary = Some(self.scanned + offset),
                _ => {}
            }
        }
        self.scanned = self.buffer.len();

        let Some(boundary) = boundary else {
            return Ok(Vec::new());
        };
        let complete: Vec<u8> = self.buffer.drain(..=boundary).collect();
        self.scanned = self.buffer.len();
        self.parse(&complete)
    }

    /// Parses whatever is left once the body has ended.
    pub fn finish(&mut self) -> Result<Vec<Vec<String>>, csv::Error> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        self.in_quotes = false;
        self.parse(&rest)
    }

    fn parse(&mut self, bytes: &[u8]) -> Result<Vec<Vec<String>>, csv::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes);
        let mut rows = Vec::new();
        for result in reader.byte_records() {
            let record = result?;
            let fields: Vec<String> = record
                .iter()
                .map(|field| String::from_utf8_lossy(field).into_owned())
                .collect();
            if self.headers.is_none() {
                let headers = fields
                    .iter()
                    .map(|name| name.trim_start_matches('\u{feff}').trim().to_string())
                    .collect();
                self.headers = Some(headers);
                continue;
            }
            if fields.iter().all(|field| field.trim().is_empty()) {
                continue;
            }
            rows.push(fields);
        }
        Ok(rows)
    }
}

/// Turns a chunked CSV export into canonical records for one source.
#[derive(Debug)]
pub struct CsvExportParser<'a> {
    source: &'a SourceConfig,
    window: LookbackWindow,
    scraped_at: DateTime<Utc>,
    rows: CsvRowStream,
    records: Vec<PermitRecord>,
    missing_columns: Option<Vec<String>>,
}

impl<'a> CsvExportParser<'a> {
    pub fn new(
        source: &'a SourceConfig,
        window: LookbackWindow,
        scraped_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source,
            window,
            scraped_at,
            rows: CsvRowStream::new(),
            records: Vec::new(),
            missing_columns: None,
        }
    }

    /// Feeds one body chunk. Returns `true` once the record cap is reached and
    /// the rest of the body can be skipped.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<bool, CollectorError> {
        let rows = self.rows.push(chunk).map_err(|err| self.parse_error(err))?;
        Ok(self.absorb(rows))
    }

    /// Flushes the buffered tail and produces the outcome.
    pub fn finish(mut self) -> CollectOutcome {
        match self.rows.finish() {
            Ok(rows) => {
                self.absorb(rows);
            }
            Err(err) => {
                let err = self.parse_error(err);
                return CollectOutcome::partial(self.records, err);
            }
        }
        self.into_outcome()
    }

    /// Stops early and reports what was parsed with `error`.
    pub fn interrupt(self, error: CollectorError) -> CollectOutcome {
        CollectOutcome::partial(self.records, error)
    }

    pub fn into_outcome(self) -> CollectOutcome {
        match self.missing_columns {
            Some(missing) if !missing.is_empty() => {
                let err = CollectorError::structural(
                    &self.source.source_id,
                    format!("columns missing from export header: {}", missing.join(", ")),
                );
                CollectOutcome::partial(self.records, err)
            }
            _ => CollectOutcome::complete(self.records),
        }
    }

    fn parse_error(&self, err: csv::Error) -> CollectorError {
        CollectorError::transient(&self.source.source_id, format!("csv parse error: {err}"))
    }

    fn absorb(&mut self, rows: Vec<Vec<String>>) -> bool {
        let max_records = self.source.max_records();
        let Some(headers) = self.rows.headers() else {
            return false;
        };
        if self.missing_columns.is_none() {
            self.missing_columns = Some(missing_columns(self.source, headers));
        }

        for row in rows {
            if self.records.len() >= max_records {
                return true;
            }
            let lookup = |key: &str| {
                headers
                    .iter()
                    .position(|header| header.eq_ignore_ascii_case(key))
                    .and_then(|index| row.get(index))
                    .cloned()
            };
            let raw: JsonMap<String, JsonValue> = headers
                .iter()
                .zip(&row)
                .map(|(header, value)| (header.clone(), JsonValue::String(value.clone())))
                .collect();
            let record = self
                .source
                .map_row(self.scraped_at, &lookup, JsonValue::Object(raw));
            if !self.window.admits(self.source.row_date(&lookup, &record)) {
                continue;
            }
            if !self.source.accepts_permit_type(&record.permit_type) {
                continue;
            }
            self.records.push(record);
        }
        self.records.len() >= max_records
    }
}

fn missing_columns(source: &SourceConfig, headers: &[String]) -> Vec<String> {
    let configured: BTreeSet<&str> = source
        .fields
        .values()
        .flatten()
        .chain(source.date_field.iter())
        .map(String::as_str)
        .collect();
    configured
        .into_iter()
        .filter(|key| !headers.iter().any(|header| header.eq_ignore_ascii_case(key)))
        .map(str::to_string)
        .collect()
}

/// Bulk CSV export fetched over HTTP and parsed while it downloads.
#[derive(Debug)]
pub struct CsvExportCollector {
    source: SourceConfig,
    endpoint: Url,
    http: Arc<HttpFetcher>,
}

impl CsvExportCollector {
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
impl Collector for CsvExportCollector {
    fn source_id(&self) -> &str {
        &self.source.source_id
    }

    fn kind(&self) -> CollectorKind {
        CollectorKind::Csv
    }

    async fn collect(&self, ctx: &CollectContext) -> CollectOutcome {
        let source_id = self.source.source_id.as_str();
        let mut stream = match self
            .http
            .open_stream(ctx.run_id, source_id, &self.endpoint)
            .await
        {
            Ok(stream) => stream,
            Err(err) => return CollectOutcome::failed(fetch_failure(source_id, &err)),
        };

        let mut parser = CsvExportParser::new(&self.source, ctx.window, ctx.scraped_at);
        let mut bytes_read = 0usize;
        loop {
            if let Some(err) = ctx.interruption(source_id) {
                return parser.interrupt(err);
            }
            let chunk = match stream.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(err) => return parser.interrupt(fetch_failure(source_id, &err)),
            };
            bytes_read += chunk.len();
            match parser.feed(&chunk) {
                Ok(true) => {
                    debug!(source_id, bytes_read, "record cap reached, closing export");
                    return parser.into_outcome();
                }
                Ok(false) => {}
                Err(err) => return parser.interrupt(err),
            }
        }
        debug!(source_id, bytes_read, "export fully read");
        parser.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{scraped_at, source};
    use permit_core::FailureKind;

    fn san_antonio() -> SourceConfig {
        source(
            CollectorKind::Csv,
            "date_field: DATE ISSUED\ninclude_types: [addition, remodel, new]\nfields:\n  permit_number: [\"PERMIT #\"]\n  address: [ADDRESS]\n  permit_type: [PERMIT TYPE]\n  issue_date: [DATE ISSUED]\n  estimated_value: [DECLARED VALUATION]\n  work_description: [WORK TYPE]\n  contractor: [PRIMARY CONTACT]\n",
        )
    }

    const EXPORT: &str = "\u{feff}PERMIT #,ADDRESS,PERMIT TYPE,DATE ISSUED,DECLARED VALUATION,WORK TYPE,PRIMARY CONTACT\r\n\
        P-100,\"12 Alamo Plaza\",Residential Addition,03/02/2026,\"$120,000\",\"Second story,\nrear deck\",Acme Builders\r\n\
        P-101,400 Commerce St,Commercial Remodel,not a date,85000,Interior,\r\n\
        P-102,7 Oak Ln,Fence,03/01/2026,2000,Fence,\r\n\
        P-103,9 Pine Ave,New Residential,12/01/2025,300000,House,Builder Co\r\n";

    #[test]
    fn quoted_newlines_survive_chunk_boundaries() {
        let mut stream = CsvRowStream::new();
        let bytes = EXPORT.as_bytes();
        let mut rows = Vec::new();
        for chunk in bytes.chunks(7) {
            rows.extend(stream.push(chunk).unwrap());
        }
        rows.extend(stream.finish().unwrap());
        assert_eq!(stream.headers().unwrap()[0], "PERMIT #");
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0][5], "Second story,\nrear deck");
        assert_eq!(rows[1][2], "Commercial Remodel");
    }

    #[test]
    fn rows_are_windowed_and_filtered_with_fail_open_dates() {
        let config = san_antonio();
        let mut parser = CsvExportParser::new(
            &config,
            LookbackWindow::ending_at(scraped_at(), 30),
            scraped_at(),
        );
        for chunk in EXPORT.as_bytes().chunks(16) {
            assert!(!parser.feed(chunk).unwrap());
        }
        let outcome = parser.finish();
        assert!(outcome.error.is_none());
        let numbers: Vec<&str> = outcome
            .records
            .iter()
            .map(|r| r.permit_number.as_str())
            .collect();
        // P-101 has an unparseable date and is kept; P-102 is filtered by type;
        // P-103 is older than the window.
        assert_eq!(numbers, vec!["P-100", "P-101"]);
        assert_eq!(outcome.records[0].estimated_value, 120_000.0);
        assert_eq!(outcome.records[0].contractor.as_deref(), Some("Acme Builders"));
        assert!(outcome.records[1].issue_date.is_none());
        assert!(outcome.records[1].contractor.is_none());
    }

    #[test]
    fn missing_configured_column_is_structural_but_keeps_rows() {
        let mut config = san_antonio();
        config
            .fields
            .insert(crate::CanonicalField::Owner, vec!["OWNER NAME".into()]);
        let mut parser = CsvExportParser::new(
            &config,
            LookbackWindow::ending_at(scraped_at(), 30),
            scraped_at(),
        );
        parser.feed(EXPORT.as_bytes()).unwrap();
        let outcome = parser.finish();
        let err = outcome.error.unwrap();
        assert_eq!(err.kind, FailureKind::Structural);
        assert!(err.cause.contains("OWNER NAME"));
        assert_eq!(err.partial_results, 2);
        assert_eq!(outcome.records.len(), 2);
    }

    #[test]
    fn record_cap_stops_reading() {
        let mut config = san_antonio();
        config.max_records = Some(1);
        let mut parser = CsvExportParser::new(
            &config,
            LookbackWindow::ending_at(scraped_at(), 30),
            scraped_at(),
        );
        assert!(parser.feed(EXPORT.as_bytes()).unwrap());
        assert_eq!(parser.into_outcome().records.len(), 1);
    }

    #[test]
    fn empty_export_is_no_data() {
        let config = san_antonio();
        let parser = CsvExportParser::new(
            &config,
            LookbackWindow::ending_at(scraped_at(), 30),
            scraped_at(),
        );
        let outcome = parser.finish();
        assert!(outcome.records.is_empty());
        assert!(outcome.error.is_none());
    }
}
