//! Canonical permit model, identity rules, and the persisted state shapes shared by
//! every other crate in the pipeline.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "permit-core";

/// Normalized building permit. Every field except `source_id` and `scraped_at`
/// may be empty; collectors fill what their source provides and leave the rest
/// at the defaults from [`PermitRecord::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermitRecord {
    pub source_id: String,
    #[serde(default)]
    pub jurisdiction: String,
    #[serde(default)]
    pub permit_number: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub permit_type: String,
    #[serde(default)]
    pub work_description: String,
    /// 0 means the source did not report a valuation.
    #[serde(default)]
    pub estimated_value: f64,
    #[serde(default)]
    pub issue_date: Option<NaiveDate>,
    #[serde(default)]
    pub applied_date: Option<NaiveDate>,
    #[serde(default)]
    pub contractor: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    pub scraped_at: DateTime<Utc>,
    /// Audit copy of the source row. Never part of identity.
    #[serde(default)]
    pub raw_payload: JsonValue,
}

impl PermitRecord {
    pub fn new(source_id: impl Into<String>, scraped_at: DateTime<Utc>) -> Self {
        Self {
            source_id: source_id.into(),
            jurisdiction: String::new(),
            permit_number: String::new(),
            address: String::new(),
            permit_type: String::new(),
            work_description: String::new(),
            estimated_value: 0.0,
            issue_date: None,
            applied_date: None,
            contractor: None,
            owner: None,
            status: None,
            scraped_at,
            raw_payload: JsonValue::Null,
        }
    }

    /// Date used for identity and recency: the issue date, or the application
    /// date for sources that only publish applications.
    pub fn identity_date(&self) -> Option<NaiveDate> {
        self.issue_date.or(self.applied_date)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(self)
    }

    /// Sanitized valuation: non-finite or negative values collapse to "unknown".
    pub fn valuation(&self) -> f64 {
        if self.estimated_value.is_finite() && self.estimated_value > 0.0 {
            self.estimated_value
        } else {
            0.0
        }
    }
}

/// Lowercases, trims, and collapses internal whitespace runs. No stemming.
pub fn normalize_identity_text(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Content digest identifying a permit within its source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(record: &PermitRecord) -> Self {
        let date = record
            .identity_date()
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        let material = format!(
            "{}|{}|{}|{}",
            record.source_id,
            normalize_identity_text(&record.address),
            normalize_identity_text(&record.permit_type),
            date
        );
        let mut hasher = Sha256::new();
        hasher.update(material.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wraps a digest read back from storage.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ledger row: this fingerprint has already been delivered as new.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenEntry {
    pub source_id: String,
    pub fingerprint: Fingerprint,
    pub first_seen_at: DateTime<Utc>,
}

/// Historical copy of an ingested permit, unique on `(source_id, fingerprint)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub source_id: String,
    pub fingerprint: Fingerprint,
    pub record: PermitRecord,
    pub archived_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ArchiveRecord {
    pub fn from_record(record: PermitRecord, at: DateTime<Utc>) -> Self {
        Self {
            source_id: record.source_id.clone(),
            fingerprint: record.fingerprint(),
            record,
            archived_at: at,
            updated_at: at,
        }
    }
}

/// Per-factor scores, each in 0..=100.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ScoreBreakdown {
    pub size: f64,
    pub location: f64,
    pub urgency: f64,
    #[serde(rename = "type")]
    pub permit_type: f64,
}

/// Transient ranked view of a permit. Recomputed every time, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRecord {
    pub record: PermitRecord,
    pub score: f64,
    pub score_breakdown: ScoreBreakdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeouts, 5xx, throttling, temporary parse anomalies. Retried next cycle.
    Transient,
    /// The source's contract changed (missing table/column, 4xx, shape mismatch).
    /// Needs an operator.
    Structural,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient => f.write_str("transient"),
            FailureKind::Structural => f.write_str("structural"),
        }
    }
}

/// Error value returned alongside whatever records a collector managed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind} failure in {source_id}: {cause}")]
pub struct CollectorError {
    pub source_id: String,
    pub kind: FailureKind,
    pub cause: String,
    /// Number of valid records returned with this error.
    pub partial_results: usize,
}

impl CollectorError {
    pub fn transient(source_id: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            kind: FailureKind::Transient,
            cause: cause.into(),
            partial_results: 0,
        }
    }

    pub fn structural(source_id: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            kind: FailureKind::Structural,
            cause: cause.into(),
            partial_results: 0,
        }
    }

    pub fn with_partial_results(mut self, count: usize) -> Self {
        self.partial_results = count;
        self
    }
}

/// One row of the cycle log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleLogEntry {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub new_count: usize,
    pub duplicate_count: usize,
    pub errors: Vec<CollectorError>,
}

/// Newest record date observed for a source, plus when it last delivered cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighWaterMark {
    pub source_id: String,
    pub last_record_date: Option<NaiveDate>,
    pub last_success_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(source: &str, address: &str, permit_type: &str, date: Option<&str>) -> PermitRecord {
        let mut r = PermitRecord::new(
            source,
            Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).single().unwrap(),
        );
        r.address = address.to_string();
        r.permit_type = permit_type.to_string();
        r.issue_date = date.map(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").unwrap());
        r
    }

    #[test]
    fn defaults_tolerate_missing_fields() {
        let r = PermitRecord::new("austin", Utc::now());
        assert_eq!(r.estimated_value, 0.0);
        assert!(r.address.is_empty());
        assert!(r.issue_date.is_none());
        assert!(r.identity_date().is_none());
        assert_eq!(r.fingerprint(), r.clone().fingerprint());
    }

    #[test]
    fn fingerprint_ignores_case_and_whitespace() {
        let a = record("nashville", "100 Broadway", "New Construction", Some("2026-02-01"));
        let b = record(
            "nashville",
            "  100   BROADWAY ",
            "new construction\t",
            Some("2026-02-01"),
        );
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_ignores_non_identity_fields() {
        let a = record("nashville", "100 Broadway", "Addition", Some("2026-02-01"));
        let mut b = a.clone();
        b.work_description = "updated narrative".into();
        b.estimated_value = 125_000.0;
        b.status = Some("Issued".into());
        b.raw_payload = serde_json::json!({"x": 1});
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_changes_with_material_differences() {
        let a = record("nashville", "100 Broadway", "Addition", Some("2026-02-01"));
        let other_address = record("nashville", "102 Broadway", "Addition", Some("2026-02-01"));
        let other_date = record("nashville", "100 Broadway", "Addition", Some("2026-02-02"));
        let other_source = record("austin", "100 Broadway", "Addition", Some("2026-02-01"));
        assert_ne!(a.fingerprint(), other_address.fingerprint());
        assert_ne!(a.fingerprint(), other_date.fingerprint());
        assert_ne!(a.fingerprint(), other_source.fingerprint());
    }

    #[test]
    fn identity_date_falls_back_to_applied_date() {
        let mut r = record("chattanooga", "1 Market St", "Residential", None);
        r.applied_date = NaiveDate::from_ymd_opt(2026, 1, 5);
        assert_eq!(r.identity_date(), NaiveDate::from_ymd_opt(2026, 1, 5));
        r.issue_date = NaiveDate::from_ymd_opt(2026, 1, 9);
        assert_eq!(r.identity_date(), NaiveDate::from_ymd_opt(2026, 1, 9));
    }

    #[test]
    fn valuation_treats_garbage_as_unknown() {
        let mut r = PermitRecord::new("x", Utc::now());
        r.estimated_value = f64::NAN;
        assert_eq!(r.valuation(), 0.0);
        r.estimated_value = -10.0;
        assert_eq!(r.valuation(), 0.0);
        r.estimated_value = 42.5;
        assert_eq!(r.valuation(), 42.5);
    }

    #[test]
    fn collector_error_serializes_kind_in_snake_case() {
        let err = CollectorError::structural("harris", "no permit table").with_partial_results(3);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "structural");
        assert_eq!(json["partial_results"], 3);
        assert_eq!(err.to_string(), "structural failure in harris: no permit table");
    }
}
