use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use permit_collectors::{CollectContext, CollectOutcome, Collector, CollectorKind, LookbackWindow};
use permit_core::{CollectorError, PermitRecord};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// A collector plus the limits it runs under this cycle.
#[derive(Clone)]
pub struct CollectorTask {
    pub collector: Arc<dyn Collector>,
    /// Soft deadline handed to the collector; it is dropped outright at
    /// `budget + grace`.
    pub budget: Duration,
    pub lookback_days: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Succeeded,
    /// Returned records and an error.
    Partial,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SourceRun {
    pub source_id: String,
    pub kind: CollectorKind,
    pub status: SourceStatus,
    pub records: Vec<PermitRecord>,
    pub error: Option<CollectorError>,
    pub elapsed: Duration,
}

impl SourceRun {
    fn from_outcome(
        source_id: String,
        kind: CollectorKind,
        outcome: CollectOutcome,
        elapsed: Duration,
    ) -> Self {
        let status = match (&outcome.error, outcome.records.is_empty()) {
            (None, _) => SourceStatus::Succeeded,
            (Some(_), false) => SourceStatus::Partial,
            (Some(_), true) => SourceStatus::Failed,
        };
        Self {
            source_id,
            kind,
            status,
            records: outcome.records,
            error: outcome.error,
            elapsed,
        }
    }
}

/// Stand-in for a source whose configuration could not be turned into a
/// collector. Every cycle reports the same structural error for it.
#[derive(Debug)]
pub struct UnavailableCollector {
    source_id: String,
    kind: CollectorKind,
    error: CollectorError,
}

impl UnavailableCollector {
    pub fn new(source_id: impl Into<String>, kind: CollectorKind, error: CollectorError) -> Self {
        Self {
            source_id: source_id.into(),
            kind,
            error,
        }
    }
}

#[async_trait]
impl Collector for UnavailableCollector {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn kind(&self) -> CollectorKind {
        self.kind
    }

    async fn collect(&self, _ctx: &CollectContext) -> CollectOutcome {
        CollectOutcome::failed(self.error.clone())
    }
}

/// Runs every collector on its own task and waits for all of them. A
/// collector that fails, panics or overruns only affects its own entry.
/// Results come back in task order.
pub async fn collect_all(
    tasks: &[CollectorTask],
    run_id: Uuid,
    scraped_at: DateTime<Utc>,
    grace: Duration,
    cancel: &CancellationToken,
) -> Vec<SourceRun> {
    let mut handles = Vec::with_capacity(tasks.len());
    for task in tasks {
        let collector = task.collector.clone();
        let source_id = collector.source_id().to_string();
        let kind = collector.kind();
        let budget = task.budget;
        let ctx = CollectContext {
            run_id,
            scraped_at,
            window: LookbackWindow::ending_at(scraped_at, task.lookback_days),
            deadline: Instant::now() + budget,
            cancel: cancel.child_token(),
        };
        let span = info_span!("collector", %run_id, source_id = %source_id, kind = %kind);
        let handle = tokio::spawn(
            async move {
                let started = Instant::now();
                let outcome = tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        CollectOutcome::failed(CollectorError::transient(
                            collector.source_id(),
                            "cancelled",
                        ))
                    }
                    result = tokio::time::timeout(budget + grace, collector.collect(&ctx)) => {
                        result.unwrap_or_else(|_| {
                            CollectOutcome::failed(CollectorError::transient(
                                collector.source_id(),
                                format!("timed out after {}s", budget.as_secs_f64()),
                            ))
                        })
                    }
                };
                (outcome, started.elapsed())
            }
            .instrument(span),
        );
        handles.push((source_id, kind, handle));
    }

    let mut runs = Vec::with_capacity(handles.len());
    for (source_id, kind, handle) in handles {
        let (outcome, elapsed) = match handle.await {
            Ok(done) => done,
            Err(join_err) => (
                CollectOutcome::failed(CollectorError::transient(
                    &source_id,
                    format!("collector task aborted: {join_err}"),
                )),
                Duration::ZERO,
            ),
        };
        let run = SourceRun::from_outcome(source_id, kind, outcome, elapsed);
        match &run.error {
            None => info!(
                source_id = %run.source_id,
                records = run.records.len(),
                elapsed_ms = run.elapsed.as_millis() as u64,
                "collector finished"
            ),
            Some(err) => warn!(
                source_id = %run.source_id,
                kind = %err.kind,
                records = run.records.len(),
                cause = %err.cause,
                "collector reported a failure"
            ),
        }
        runs.push(run);
    }
    runs
}
