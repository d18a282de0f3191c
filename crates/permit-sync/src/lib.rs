//! Ingestion cycle: collect from every source, keep what has not been seen
//! before, rank it, and hand the result to report sinks.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use permit_collectors::{collector_for_source, Collector, CollectorKind, SourceConfig};
use permit_core::{CollectorError, CycleLogEntry, FailureKind, HighWaterMark, ScoredRecord};
use permit_storage::{
    ArchiveFilter, HttpClientConfig, HttpFetcher, SqliteStateStore, StateError, StateStore,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::Job;
pub use tokio_cron_scheduler::JobScheduler;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod dedup;
pub mod orchestrator;
pub mod reports;
pub mod scoring;

pub use dedup::{DedupEngine, DedupOutcome};
pub use orchestrator::{collect_all, CollectorTask, SourceRun, SourceStatus, UnavailableCollector};
pub use reports::{CycleSink, ParquetManifest, ParquetManifestFile, ReportDirSink};
pub use scoring::{top_leads, LexiconUrgency, Scorer, ScoringRules, UrgencySignal};

pub const CRATE_NAME: &str = "permit-sync";

/// A lock file older than this belongs to a run that died without cleaning up.
const STALE_LOCK_AGE: Duration = Duration::from_secs(6 * 60 * 60);

/// Extra time a collector gets past its soft deadline before it is dropped.
const COLLECTOR_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing sources.yaml")?;
        let mut ids = HashSet::new();
        for source in &registry.sources {
            if !ids.insert(source.source_id.as_str()) {
                bail!("duplicate source_id {:?} in sources.yaml", source.source_id);
            }
        }
        Ok(registry)
    }

    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn is_enabled(&self, source: &SourceConfig, config: &PipelineConfig) -> bool {
        source.enabled && !config.disabled_sources.contains(&source.source_id)
    }

    /// One task per enabled source. A source whose configuration cannot
    /// produce a collector still gets a task so its error shows up in every
    /// run summary.
    pub fn tasks(&self, config: &PipelineConfig, http: Arc<HttpFetcher>) -> Vec<CollectorTask> {
        self.sources
            .iter()
            .filter(|source| self.is_enabled(source, config))
            .map(|source| {
                let collector: Arc<dyn Collector> =
                    match collector_for_source(source, http.clone()) {
                        Ok(collector) => collector,
                        Err(err) => {
                            warn!(
                                source_id = %source.source_id,
                                cause = %err.cause,
                                "source is misconfigured"
                            );
                            Arc::new(UnavailableCollector::new(&source.source_id, source.kind, err))
                        }
                    };
                CollectorTask {
                    collector,
                    budget: Duration::from_secs(
                        source.timeout_secs.unwrap_or(config.collector_timeout_secs),
                    ),
                    lookback_days: source.lookback_days.unwrap_or(config.lookback_days),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workspace_root: PathBuf,
    pub database_path: PathBuf,
    pub reports_dir: PathBuf,
    pub lookback_days: u32,
    pub retention_days: u32,
    pub collector_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub disabled_sources: Vec<String>,
    pub scheduler_enabled: bool,
    pub sync_crons: Vec<String>,
    pub top_leads: usize,
    pub lock_path: Option<PathBuf>,
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_list(name: &str, separator: char) -> Option<Vec<String>> {
    std::env::var(name).ok().map(|v| {
        v.split(separator)
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect()
    })
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            database_path: PathBuf::from("./state/permits.sqlite"),
            reports_dir: PathBuf::from("./reports"),
            lookback_days: 30,
            retention_days: 30,
            collector_timeout_secs: 90,
            http_timeout_secs: 30,
            user_agent: "permit-leads/0.1".to_string(),
            disabled_sources: Vec::new(),
            scheduler_enabled: false,
            sync_crons: ["0 0 0 * * *", "0 0 6 * * *", "0 0 12 * * *", "0 0 18 * * *"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            top_leads: 10,
            lock_path: Some(PathBuf::from("./state/permit-sync.lock")),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workspace_root: std::env::var("PERMIT_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            database_path: std::env::var("PERMIT_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            reports_dir: std::env::var("PERMIT_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            lookback_days: env_parse("PERMIT_LOOKBACK_DAYS", defaults.lookback_days),
            retention_days: env_parse("PERMIT_RETENTION_DAYS", defaults.retention_days),
            collector_timeout_secs: env_parse(
                "PERMIT_COLLECTOR_TIMEOUT_SECS",
                defaults.collector_timeout_secs,
            ),
            http_timeout_secs: env_parse("PERMIT_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            user_agent: std::env::var("PERMIT_USER_AGENT").unwrap_or(defaults.user_agent),
            disabled_sources: env_list("PERMIT_DISABLED_SOURCES", ',')
                .unwrap_or(defaults.disabled_sources),
            scheduler_enabled: std::env::var("PERMIT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_crons: env_list("PERMIT_SYNC_CRONS", ';')
                .filter(|crons| !crons.is_empty())
                .unwrap_or(defaults.sync_crons),
            top_leads: env_parse("PERMIT_TOP_LEADS", defaults.top_leads),
            lock_path: match std::env::var("PERMIT_LOCK_PATH") {
                Ok(v) if v.trim().is_empty() => None,
                Ok(v) => Some(PathBuf::from(v)),
                Err(_) => defaults.lock_path,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("another ingestion cycle is already running")]
    AlreadyRunning,
    #[error("cycle cancelled before any state was written")]
    Cancelled,
    #[error("run lock unavailable: {0}")]
    Lock(#[from] io::Error),
    #[error(transparent)]
    State(#[from] StateError),
}

/// Per-source line of the run summary.
#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source_id: String,
    pub kind: CollectorKind,
    pub status: SourceStatus,
    pub records_collected: usize,
    pub error: Option<CollectorError>,
    pub elapsed_ms: u64,
    pub high_water_mark: Option<HighWaterMark>,
}

/// What one cycle produced. Source health is reported as counts, never a
/// single pass/fail flag.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Ranked highest first.
    pub new_records: Vec<ScoredRecord>,
    pub duplicate_count: usize,
    pub refreshed_count: usize,
    pub pruned_count: Option<u64>,
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub structural_failures: usize,
    /// Cancellation arrived while new records were being committed; only
    /// the committed part is in `new_records`.
    pub cancelled: bool,
    pub sources: Vec<SourceReport>,
}

impl RunSummary {
    pub fn errors(&self) -> Vec<CollectorError> {
        self.sources
            .iter()
            .filter_map(|source| source.error.clone())
            .collect()
    }

    pub fn new_count(&self) -> usize {
        self.new_records.len()
    }
}

/// Cross-process guard; the file is removed when the guard drops.
#[derive(Debug)]
struct RunLock {
    path: PathBuf,
}

fn lock_is_stale(path: &Path) -> bool {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}

impl RunLock {
    fn acquire(path: &Path) -> Result<Self, CycleError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{} {}", std::process::id(), Utc::now().to_rfc3339())?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if !lock_is_stale(path) {
                        return Err(CycleError::AlreadyRunning);
                    }
                    warn!(path = %path.display(), "removing stale run lock");
                    std::fs::remove_file(path)?;
                }
                Err(err) => return Err(CycleError::Lock(err)),
            }
        }
        Err(CycleError::AlreadyRunning)
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), %err, "could not remove run lock");
        }
    }
}

/// Owns the state store and the collectors; runs at most one cycle at a time.
pub struct RunCoordinator {
    store: Arc<dyn StateStore>,
    dedup: DedupEngine,
    scorer: Scorer,
    tasks: Vec<CollectorTask>,
    sinks: Vec<Arc<dyn CycleSink>>,
    retention_days: u32,
    grace: Duration,
    lock_path: Option<PathBuf>,
    run_gate: Mutex<()>,
    cancel: CancellationToken,
}

impl RunCoordinator {
    pub fn new(store: Arc<dyn StateStore>, tasks: Vec<CollectorTask>) -> Self {
        Self {
            dedup: DedupEngine::new(store.clone()),
            store,
            scorer: Scorer::default(),
            tasks,
            sinks: Vec::new(),
            retention_days: 30,
            grace: COLLECTOR_GRACE,
            lock_path: None,
            run_gate: Mutex::new(()),
            cancel: CancellationToken::new(),
        }
    }

    /// Wires the SQLite store, the configured sources, the scoring rules
    /// and the report directory sink.
    pub async fn from_config(config: &PipelineConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.workspace_root).await?;
        let rules = ScoringRules::from_workspace_root(&config.workspace_root)?;
        let store = SqliteStateStore::open(&config.database_path)
            .await
            .with_context(|| format!("opening state store {}", config.database_path.display()))?;
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);

        let mut coordinator = Self::new(Arc::new(store), registry.tasks(config, http))
            .with_scorer(Scorer::new(rules))
            .with_retention_days(config.retention_days)
            .with_sink(Arc::new(ReportDirSink::new(
                config.reports_dir.clone(),
                config.top_leads,
            )));
        if let Some(path) = &config.lock_path {
            coordinator = coordinator.with_lock_file(path.clone());
        }
        Ok(coordinator)
    }

    pub fn with_scorer(mut self, scorer: Scorer) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn CycleSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_lock_file(mut self, path: PathBuf) -> Self {
        self.lock_path = Some(path);
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn scorer(&self) -> &Scorer {
        &self.scorer
    }

    /// Cancelling this token stops the current cycle and every later one.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs one cycle, or returns [`CycleError::AlreadyRunning`] right away
    /// if one is in progress here or in another process.
    pub async fn run_cycle(&self) -> Result<RunSummary, CycleError> {
        let _in_process = self
            .run_gate
            .try_lock()
            .map_err(|_| CycleError::AlreadyRunning)?;
        let _cross_process = match &self.lock_path {
            Some(path) => Some(RunLock::acquire(path)?),
            None => None,
        };
        if self.cancel.is_cancelled() {
            return Err(CycleError::Cancelled);
        }

        let run_id = Uuid::new_v4();
        let span = info_span!("cycle", %run_id);
        self.run_locked(run_id).instrument(span).await
    }

    async fn run_locked(&self, run_id: Uuid) -> Result<RunSummary, CycleError> {
        let started_at = Utc::now();
        info!(sources = self.tasks.len(), "cycle started");

        if let Err(err) = self.store.verify().await {
            error!(%err, "state store failed its integrity check; aborting cycle");
            return Err(err.into());
        }

        let mut runs = collect_all(&self.tasks, run_id, started_at, self.grace, &self.cancel).await;
        if self.cancel.is_cancelled() {
            warn!("cycle cancelled during collection; nothing was committed");
            return Err(CycleError::Cancelled);
        }

        // (newest record date, record count) per source, taken before the
        // records move into the dedup batch.
        let mut stats: Vec<(Option<NaiveDate>, usize)> = Vec::with_capacity(runs.len());
        let mut collected = Vec::new();
        for run in &mut runs {
            let newest = run.records.iter().filter_map(|r| r.identity_date()).max();
            stats.push((newest, run.records.len()));
            collected.append(&mut run.records);
        }
        let collected_count = collected.len();

        let outcome = match self.dedup.filter_new(collected, started_at, &self.cancel).await {
            Ok(outcome) => outcome,
            Err(err) => {
                if err.is_corruption() {
                    error!(%err, "ledger corruption during dedup; aborting cycle");
                } else {
                    warn!(%err, "state store error during dedup; aborting cycle");
                }
                return Err(err.into());
            }
        };
        let new_records = self.scorer.score_batch(outcome.new_records);

        let mut sources = Vec::with_capacity(runs.len());
        for (run, (newest_date, records_collected)) in runs.into_iter().zip(stats) {
            let mut high_water_mark = None;
            if run.status != SourceStatus::Failed && !outcome.interrupted {
                match self
                    .store
                    .advance_high_water_mark(&run.source_id, newest_date, Utc::now())
                    .await
                {
                    Ok(mark) => high_water_mark = Some(mark),
                    Err(err) => {
                        warn!(source_id = %run.source_id, %err, "could not advance high-water mark")
                    }
                }
            } else {
                match self.store.high_water_mark(&run.source_id).await {
                    Ok(mark) => high_water_mark = mark,
                    Err(err) => {
                        warn!(source_id = %run.source_id, %err, "could not read high-water mark")
                    }
                }
            }
            sources.push(SourceReport {
                records_collected,
                source_id: run.source_id,
                kind: run.kind,
                status: run.status,
                error: run.error,
                elapsed_ms: run.elapsed.as_millis() as u64,
                high_water_mark,
            });
        }

        let pruned = self
            .store
            .prune_older_than(self.retention_days, Utc::now())
            .await;
        let pruned_count = match pruned {
            Ok(pruned) => {
                info!(pruned, retention_days = self.retention_days, "ledger pruned");
                Some(pruned)
            }
            Err(err) => {
                warn!(%err, "ledger pruning failed; continuing");
                None
            }
        };

        let count = |status: SourceStatus| sources.iter().filter(|s| s.status == status).count();
        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            new_records,
            duplicate_count: outcome.duplicate_count,
            refreshed_count: outcome.refreshed,
            pruned_count,
            succeeded: count(SourceStatus::Succeeded),
            partial: count(SourceStatus::Partial),
            failed: count(SourceStatus::Failed),
            structural_failures: sources
                .iter()
                .filter(|s| s.error.as_ref().is_some_and(|e| e.kind == FailureKind::Structural))
                .count(),
            cancelled: outcome.interrupted,
            sources,
        };

        let log_entry = CycleLogEntry {
            run_id,
            started_at,
            finished_at: summary.finished_at,
            new_count: summary.new_count(),
            duplicate_count: summary.duplicate_count,
            errors: summary.errors(),
        };
        if let Err(err) = self.store.record_cycle(&log_entry).await {
            warn!(%err, "could not write cycle log entry");
        }

        for sink in &self.sinks {
            if let Err(err) = sink.publish(&summary).await {
                warn!(sink = sink.name(), error = %format!("{err:#}"), "report sink failed");
            }
        }

        info!(
            collected = collected_count,
            new = summary.new_count(),
            duplicates = summary.duplicate_count,
            succeeded = summary.succeeded,
            partial = summary.partial,
            failed = summary.failed,
            "cycle finished"
        );
        Ok(summary)
    }

    /// Ledger maintenance outside a cycle.
    pub async fn prune(&self, retention_days: u32) -> Result<u64, StateError> {
        self.store.prune_older_than(retention_days, Utc::now()).await
    }

    /// Scores archive entries first archived within the last `days` days,
    /// optionally for one source. The scores are computed, not stored.
    pub async fn score_archive_window(
        &self,
        days: u32,
        source_id: Option<&str>,
    ) -> Result<Vec<ScoredRecord>, StateError> {
        let since = Utc::now() - ChronoDuration::days(i64::from(days));
        let mut filter = ArchiveFilter::since(since);
        if let Some(source_id) = source_id {
            filter = filter.for_source(source_id);
        }
        let rows = self.store.load_archive(&filter).await?;
        Ok(self
            .scorer
            .score_batch(rows.into_iter().map(|row| row.record).collect()))
    }
}

pub async fn run_cycle_once_from_env() -> Result<RunSummary> {
    let config = PipelineConfig::from_env();
    let coordinator = RunCoordinator::from_config(&config).await?;
    coordinator.run_cycle().await.context("running ingestion cycle")
}

/// Cron jobs that each trigger one cycle. A trigger that fires while a cycle
/// is still running is skipped.
pub async fn build_scheduler(
    coordinator: Arc<RunCoordinator>,
    crons: &[String],
) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in crons {
        let coordinator = coordinator.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let coordinator = coordinator.clone();
            Box::pin(async move {
                match coordinator.run_cycle().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        new = summary.new_count(),
                        "scheduled cycle complete"
                    ),
                    Err(CycleError::AlreadyRunning) => {
                        warn!("previous cycle still running; skipping scheduled trigger")
                    }
                    Err(err) => error!(%err, "scheduled cycle failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(sched)
}

pub async fn maybe_build_scheduler(
    coordinator: Arc<RunCoordinator>,
    config: &PipelineConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(coordinator, &config.sync_crons).await.map(Some)
}
