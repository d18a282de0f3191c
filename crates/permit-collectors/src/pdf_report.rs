use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use permit_core::{CollectorError, PermitRecord};
use permit_storage::HttpFetcher;
use regex::Regex;
use reqwest::Url;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::debug;

use crate::html_table::fetch_report;
use crate::{
    apply_field, CanonicalField, CollectContext, CollectOutcome, Collector,
    CollectorKind, LookbackWindow, SourceConfig,
};

static ENTRY_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)permit\s*#\s*:?\s*").expect("valid entry pattern"));

static FIELD_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(address|type|value|issued|date|contractor|owner|description)\s*:")
        .expect("valid label pattern")
});

fn label_field(label: &str) -> Option<CanonicalField> {
    match label.to_lowercase().as_str() {
        "address" => Some(CanonicalField::Address),
        "type" => Some(CanonicalField::PermitType),
        "value" => Some(CanonicalField::EstimatedValue),
        "issued" | "date" => Some(CanonicalField::IssueDate),
        "contractor" => Some(CanonicalField::Contractor),
        "owner" => Some(CanonicalField::Owner),
        "description" => Some(CanonicalField::WorkDescription),
        _ => None,
    }
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_entry(
    source: &SourceConfig,
    entry: &str,
    scraped_at: DateTime<Utc>,
) -> Option<PermitRecord> {
    let permit_number = entry.split_whitespace().next()?.trim_end_matches([',', ';']);
    let mut record = PermitRecord::new(&source.source_id, scraped_at);
    record.jurisdiction = source.jurisdiction.clone();
    record.permit_number = permit_number.to_string();

    let mut raw = JsonMap::new();
    raw.insert("permit_number".into(), JsonValue::String(permit_number.to_string()));

    let labels: Vec<_> = FIELD_LABEL.captures_iter(entry).collect();
    for (index, captures) in labels.iter().enumerate() {
        let (Some(whole), Some(label)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let end = labels
            .get(index + 1)
            .and_then(|next| next.get(0))
            .map_or(entry.len(), |next| next.start());
        let value = collapse(&entry[whole.end()..end]);
        if value.is_empty() {
            continue;
        }
        let label = label.as_str().to_lowercase();
        raw.insert(label.clone(), JsonValue::String(value.clone()));
        let Some(field) = label_field(&label) else {
            continue;
        };
        // "Issued:" wins over a generic "Date:" when both are printed.
        if field == CanonicalField::IssueDate && label == "date" && record.issue_date.is_some() {
            continue;
        }
        apply_field(&mut record, field, &value);
    }
    record.raw_payload = JsonValue::Object(raw);
    Some(record)
}

/// Splits extracted report text into permit entries on `Permit #` markers and
/// reads the labelled fields of each one.
pub fn parse_report_text(
    source: &SourceConfig,
    text: &str,
    window: &LookbackWindow,
    scraped_at: DateTime<Utc>,
) -> Result<Vec<PermitRecord>, CollectorError> {
    let starts: Vec<usize> = ENTRY_MARKER.find_iter(text).map(|m| m.end()).collect();
    if starts.is_empty() {
        return Err(CollectorError::transient(
            &source.source_id,
            "no permit entries found in report",
        ));
    }

    let markers: Vec<usize> = ENTRY_MARKER.find_iter(text).map(|m| m.start()).collect();
    let mut records = Vec::new();
    for (index, start) in starts.iter().enumerate() {
        let end = markers.get(index + 1).copied().unwrap_or(text.len());
        let Some(record) = parse_entry(source, &text[*start..end], scraped_at) else {
            continue;
        };
        if window.admits(record.identity_date())
            && source.accepts_permit_type(&record.permit_type)
        {
            records.push(record);
        }
    }
    Ok(records)
}

/// Daily permit report published as a PDF.
#[derive(Debug)]
pub struct PdfReportCollector {
    source: SourceConfig,
    endpoint: Url,
    http: Arc<HttpFetcher>,
}

impl PdfReportCollector {
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
impl Collector for PdfReportCollector {
    fn source_id(&self) -> &str {
        &self.source.source_id
    }

    fn kind(&self) -> CollectorKind {
        CollectorKind::PdfReport
    }

    async fn collect(&self, ctx: &CollectContext) -> CollectOutcome {
        let source_id = self.source.source_id.as_str();
        let bytes = match fetch_report(&self.http, ctx, &self.source, &self.endpoint).await {
            Ok(bytes) => bytes,
            Err(err) => return CollectOutcome::failed(err),
        };
        if let Some(err) = ctx.interruption(source_id) {
            return CollectOutcome::failed(err);
        }

        let extracted = tokio::task::spawn_blocking(move || {
            pdf_extract::extract_text_from_mem(&bytes).map_err(|e| e.to_string())
        })
        .await;
        let text = match extracted {
            Ok(Ok(text)) => text,
            Ok(Err(cause)) => {
                return CollectOutcome::failed(CollectorError::transient(
                    source_id,
                    format!("pdf text extraction failed: {cause}"),
                ))
            }
            Err(join_err) => {
                return CollectOutcome::failed(CollectorError::transient(
                    source_id,
                    format!("pdf text extraction aborted: {join_err}"),
                ))
            }
        };
        debug!(source_id, chars = text.len(), "pdf text extracted");

        match parse_report_text(&self.source, &text, &ctx.window, ctx.scraped_at) {
            Ok(mut records) => {
                records.truncate(self.source.max_records());
                CollectOutcome::complete(records)
            }
            Err(err) => CollectOutcome::failed(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{scraped_at, source};
    use permit_core::FailureKind;

    const REPORT: &str = "HARRIS COUNTY DAILY PERMIT REPORT\n\
        Permit # HC-2026-0101\n\
        Address: 1200 Westheimer Rd\n\
        Type: Commercial Remodel   Value: $310,000\n\
        Issued: 03/04/2026\n\
        Contractor: Gulf Coast Builders\n\
        Description: Interior build-out for\n  restaurant tenant\n\
        Permit #: HC-2026-0102 Address: 77 Bayou Ln Type: Pool\n\
        Permit# HC-2026-0103\n\
        Address: 5 Ranch Rd\n\
        Date: 01/15/2026\n";

    #[test]
    fn labelled_entries_are_read_inline_and_multiline() {
        let config = source(CollectorKind::PdfReport, "");
        let records = parse_report_text(
            &config,
            REPORT,
            &LookbackWindow::ending_at(scraped_at(), 30),
            scraped_at(),
        )
        .unwrap();
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.permit_number, "HC-2026-0101");
        assert_eq!(first.address, "1200 Westheimer Rd");
        assert_eq!(first.permit_type, "Commercial Remodel");
        assert_eq!(first.estimated_value, 310_000.0);
        assert_eq!(first.issue_date, chrono::NaiveDate::from_ymd_opt(2026, 3, 4));
        assert_eq!(first.contractor.as_deref(), Some("Gulf Coast Builders"));
        assert_eq!(first.work_description, "Interior build-out for restaurant tenant");

        let second = &records[1];
        assert_eq!(second.permit_number, "HC-2026-0102");
        assert_eq!(second.address, "77 Bayou Ln");
        assert_eq!(second.permit_type, "Pool");
        assert_eq!(second.estimated_value, 0.0);
    }

    #[test]
    fn type_allow_list_applies_to_report_entries() {
        let config = source(CollectorKind::PdfReport, "include_types: [remodel]\n");
        let records = parse_report_text(
            &config,
            REPORT,
            &LookbackWindow::ending_at(scraped_at(), 30),
            scraped_at(),
        )
        .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].permit_number, "HC-2026-0101");
    }

    #[test]
    fn report_without_entries_is_transient() {
        let config = source(CollectorKind::PdfReport, "");
        let err = parse_report_text(
            &config,
            "No permits were issued today.",
            &LookbackWindow::ending_at(scraped_at(), 30),
            scraped_at(),
        )
        .unwrap_err();
        assert_eq!(err.kind, FailureKind::Transient);
    }
}
