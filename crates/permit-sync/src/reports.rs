use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use async_trait::async_trait;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

use crate::orchestrator::SourceStatus;
use crate::{top_leads, RunSummary, SourceReport};

/// Downstream consumer of a finished cycle. Sinks only read the summary.
#[async_trait]
pub trait CycleSink: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, summary: &RunSummary) -> Result<()>;
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Writes `<reports_dir>/<run_id>/` with the ranked delta as JSON, a
/// markdown brief, and Parquet snapshots listed in a checksum manifest.
#[derive(Debug, Clone)]
pub struct ReportDirSink {
    reports_dir: PathBuf,
    top_n: usize,
}

impl ReportDirSink {
    pub fn new(reports_dir: PathBuf, top_n: usize) -> Self {
        Self { reports_dir, top_n }
    }

    pub fn run_dir(&self, summary: &RunSummary) -> PathBuf {
        self.reports_dir.join(summary.run_id.to_string())
    }

    async fn export_parquet_snapshots(
        &self,
        run_dir: &Path,
        summary: &RunSummary,
    ) -> Result<PathBuf> {
        let snapshot_dir = run_dir.join("snapshots");
        fs::create_dir_all(&snapshot_dir)
            .await
            .with_context(|| format!("creating {}", snapshot_dir.display()))?;

        let leads_path = snapshot_dir.join("new_leads.parquet");
        let sources_path = snapshot_dir.join("sources.parquet");
        write_leads_parquet(&leads_path, summary)?;
        write_sources_parquet(&sources_path, &summary.sources)?;

        let manifest = ParquetManifest {
            schema_version: 1,
            files: vec![
                manifest_entry("new_leads", run_dir, &leads_path)?,
                manifest_entry("sources", run_dir, &sources_path)?,
            ],
        };
        let manifest_path = snapshot_dir.join("manifest.json");
        let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;
        Ok(manifest_path)
    }
}

#[async_trait]
impl CycleSink for ReportDirSink {
    fn name(&self) -> &str {
        "report_dir"
    }

    async fn publish(&self, summary: &RunSummary) -> Result<()> {
        let run_dir = self.run_dir(summary);
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        let delta_json = serde_json::to_vec_pretty(summary).context("serializing new leads")?;
        fs::write(run_dir.join("new_leads.json"), delta_json)
            .await
            .context("writing new_leads.json")?;

        fs::write(run_dir.join("daily_brief.md"), daily_brief_markdown(summary, self.top_n))
            .await
            .context("writing daily_brief.md")?;

        let manifest = self.export_parquet_snapshots(&run_dir, summary).await?;
        info!(run_dir = %run_dir.display(), manifest = %manifest.display(), "reports written");
        Ok(())
    }
}

fn status_label(status: SourceStatus) -> &'static str {
    match status {
        SourceStatus::Succeeded => "succeeded",
        SourceStatus::Partial => "partial",
        SourceStatus::Failed => "failed",
    }
}

pub fn daily_brief_markdown(summary: &RunSummary, top_n: usize) -> String {
    let leads = top_leads(&summary.new_records, top_n)
        .iter()
        .enumerate()
        .map(|(i, lead)| {
            let r = &lead.record;
            format!(
                "| {} | {:.2} | {} | {} | {} | {} | {:.0} |",
                i + 1,
                lead.score,
                r.source_id,
                r.permit_number,
                r.address,
                r.permit_type,
                r.valuation()
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let sources = summary
        .sources
        .iter()
        .map(|s| {
            let mut line = format!(
                "- {}: {} ({} collected)",
                s.source_id,
                status_label(s.status),
                s.records_collected
            );
            if let Some(err) = &s.error {
                line.push_str(&format!(" - {} error: {}", err.kind, err.cause));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "# Permit Leads Daily Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- New leads: {}\n- Duplicates: {}\n- Sources: {} succeeded, {} partial, {} failed\n\n## Top Leads\n| # | Score | Source | Permit | Address | Type | Value |\n|---|---|---|---|---|---|---|\n{}\n\n## Sources\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.new_count(),
        summary.duplicate_count,
        summary.succeeded,
        summary.partial,
        summary.failed,
        leads,
        sources
    )
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_leads_parquet(path: &Path, summary: &RunSummary) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("rank", DataType::UInt32, false),
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("permit_number", DataType::Utf8, false),
        ArrowField::new("address", DataType::Utf8, false),
        ArrowField::new("jurisdiction", DataType::Utf8, false),
        ArrowField::new("permit_type", DataType::Utf8, false),
        ArrowField::new("issue_date", DataType::Utf8, true),
        ArrowField::new("estimated_value", DataType::Float64, false),
        ArrowField::new("score", DataType::Float64, false),
        ArrowField::new("size_score", DataType::Float64, false),
        ArrowField::new("location_score", DataType::Float64, false),
        ArrowField::new("urgency_score", DataType::Float64, false),
        ArrowField::new("type_score", DataType::Float64, false),
    ]));

    let leads = &summary.new_records;
    let text = |f: fn(&permit_core::PermitRecord) -> &str| {
        StringArray::from(leads.iter().map(|l| Some(f(&l.record))).collect::<Vec<_>>())
    };
    let ranks = UInt32Array::from((1..=leads.len() as u32).collect::<Vec<_>>());
    let issue_dates = StringArray::from(
        leads
            .iter()
            .map(|l| l.record.issue_date.map(|d| d.format("%Y-%m-%d").to_string()))
            .collect::<Vec<_>>(),
    );
    let values = Float64Array::from(leads.iter().map(|l| l.record.valuation()).collect::<Vec<_>>());
    let scores = Float64Array::from(leads.iter().map(|l| l.score).collect::<Vec<_>>());
    let sub = |f: fn(&permit_core::ScoreBreakdown) -> f64| {
        Float64Array::from(leads.iter().map(|l| f(&l.score_breakdown)).collect::<Vec<_>>())
    };

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ranks),
            Arc::new(text(|r| r.source_id.as_str())),
            Arc::new(text(|r| r.permit_number.as_str())),
            Arc::new(text(|r| r.address.as_str())),
            Arc::new(text(|r| r.jurisdiction.as_str())),
            Arc::new(text(|r| r.permit_type.as_str())),
            Arc::new(issue_dates),
            Arc::new(values),
            Arc::new(scores),
            Arc::new(sub(|b| b.size)),
            Arc::new(sub(|b| b.location)),
            Arc::new(sub(|b| b.urgency)),
            Arc::new(sub(|b| b.permit_type)),
        ],
    )
    .context("building new leads record batch")?;
    write_parquet(path, batch)
}

fn write_sources_parquet(path: &Path, sources: &[SourceReport]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("records_collected", DataType::UInt32, false),
        ArrowField::new("failed", DataType::Boolean, false),
        ArrowField::new("failure_kind", DataType::Utf8, true),
        ArrowField::new("cause", DataType::Utf8, true),
    ]));

    let ids = StringArray::from(
        sources
            .iter()
            .map(|s| Some(s.source_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let statuses = StringArray::from(
        sources
            .iter()
            .map(|s| Some(status_label(s.status)))
            .collect::<Vec<_>>(),
    );
    let counts = UInt32Array::from(
        sources
            .iter()
            .map(|s| u32::try_from(s.records_collected).unwrap_or(u32::MAX))
            .collect::<Vec<_>>(),
    );
    let failed = BooleanArray::from(
        sources
            .iter()
            .map(|s| s.status == SourceStatus::Failed)
            .collect::<Vec<_>>(),
    );
    let kinds = StringArray::from(
        sources
            .iter()
            .map(|s| s.error.as_ref().map(|e| e.kind.to_string()))
            .collect::<Vec<_>>(),
    );
    let causes = StringArray::from(
        sources
            .iter()
            .map(|s| s.error.as_ref().map(|e| e.cause.as_str()))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(ids),
            Arc::new(statuses),
            Arc::new(counts),
            Arc::new(failed),
            Arc::new(kinds),
            Arc::new(causes),
        ],
    )
    .context("building sources record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(run_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}
