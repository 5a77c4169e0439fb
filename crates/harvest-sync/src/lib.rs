//! Harvest orchestration: table bootstrap, staged loads with job polling,
//! key-based reconciliation and per-dataset runs.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use harvest_adapters::{
    adapter_for_dataset, normalize_with_stats, AdapterError, CredentialProvider, EnvCredentials,
    IdentifierHarvest, NormalizeStats, SourceAdapter, Termination,
};
use harvest_core::{
    CoreError, DatasetDescriptor, DedupeKey, Identifier, KeyPart, TableName, TargetSchema,
    TypedRecord,
};
use harvest_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, JobId, JobState, PageTransport,
    ParquetWarehouse, TokenBucketConfig, Warehouse, WarehouseError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("creating table {table}: {source}")]
    CreateTable {
        table: TableName,
        #[source]
        source: WarehouseError,
    },
    #[error("load job {job} on {table} still {last_state} after {polls} polls")]
    LoadTimeout {
        table: TableName,
        job: JobId,
        polls: u32,
        last_state: JobState,
    },
    #[error("load job {job} on {table} failed: {reason}")]
    LoadFailed {
        table: TableName,
        job: JobId,
        reason: String,
    },
    #[error("load into {table} cancelled")]
    Cancelled { table: TableName },
    #[error("identifier {identifier}: {reason}")]
    FatalParse { identifier: Identifier, reason: String },
    #[error("fetch worker failed: {0}")]
    Worker(String),
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub datasets_path: PathBuf,
    pub warehouse_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fetch_max_retries: usize,
    pub fetch_concurrency: usize,
    pub rate_limit_per_sec: Option<u32>,
    pub poll_interval: Duration,
    pub poll_max_attempts: u32,
    pub max_duplicate_ratio: Option<f64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            datasets_path: PathBuf::from("datasets.yaml"),
            warehouse_dir: PathBuf::from("./warehouse"),
            reports_dir: PathBuf::from("./reports"),
            user_agent: "harvest-bot/0.1".to_string(),
            http_timeout_secs: 60,
            fetch_max_retries: 3,
            fetch_concurrency: 4,
            rate_limit_per_sec: None,
            poll_interval: Duration::from_secs(2),
            poll_max_attempts: 150,
            max_duplicate_ratio: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            datasets_path: std::env::var("HARVEST_DATASETS")
                .map(PathBuf::from)
                .unwrap_or(defaults.datasets_path),
            warehouse_dir: std::env::var("HARVEST_WAREHOUSE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.warehouse_dir),
            reports_dir: std::env::var("HARVEST_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            user_agent: std::env::var("HARVEST_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("HARVEST_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            fetch_max_retries: env_parse("HARVEST_FETCH_MAX_RETRIES")
                .unwrap_or(defaults.fetch_max_retries),
            fetch_concurrency: env_parse("HARVEST_FETCH_CONCURRENCY")
                .unwrap_or(defaults.fetch_concurrency),
            rate_limit_per_sec: env_parse::<u32>("HARVEST_RATE_LIMIT_PER_SEC").filter(|n| *n > 0),
            poll_interval: env_parse("HARVEST_POLL_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            poll_max_attempts: env_parse("HARVEST_POLL_MAX_ATTEMPTS")
                .unwrap_or(defaults.poll_max_attempts),
            max_duplicate_ratio: env_parse("HARVEST_MAX_DUPLICATE_RATIO"),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.fetch_max_retries,
                ..BackoffPolicy::default()
            },
            token_bucket: self.rate_limit_per_sec.map(|per_sec| TokenBucketConfig {
                capacity: per_sec,
                refill_every: Duration::from_secs(1) / per_sec,
            }),
            ..HttpClientConfig::default()
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: self.poll_interval,
            max_attempts: self.poll_max_attempts,
        }
    }
}

/// Dataset registry, read from `datasets.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetRegistry {
    pub datasets: Vec<DatasetDescriptor>,
}

impl DatasetRegistry {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(raw).context("parsing dataset registry")?;
        let mut seen = HashSet::new();
        for dataset in &registry.datasets {
            dataset.validate()?;
            if !seen.insert(dataset.dataset_id.as_str()) {
                anyhow::bail!("dataset `{}` declared twice", dataset.dataset_id);
            }
        }
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("loading {}", path.display()))
    }

    pub fn get(&self, dataset_id: &str) -> Option<&DatasetDescriptor> {
        self.datasets.iter().find(|d| d.dataset_id == dataset_id)
    }

    /// Enabled datasets when `only` is empty, otherwise the named ones
    /// (enabled or not) in registry order.
    pub fn select(&self, only: &[String]) -> Result<Vec<DatasetDescriptor>> {
        if let Some(unknown) = only.iter().find(|id| self.get(id).is_none()) {
            anyhow::bail!("unknown dataset `{unknown}`");
        }
        Ok(self
            .datasets
            .iter()
            .filter(|d| {
                if only.is_empty() {
                    d.enabled
                } else {
                    only.contains(&d.dataset_id)
                }
            })
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsureOutcome {
    Created,
    AlreadyExists,
}

#[derive(Clone)]
pub struct SchemaManager {
    warehouse: Arc<dyn Warehouse>,
}

impl SchemaManager {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self { warehouse }
    }

    /// Creates the table; an existing table counts as success. Any other
    /// creation failure is returned.
    pub async fn ensure_table(
        &self,
        name: &TableName,
        schema: &TargetSchema,
    ) -> Result<EnsureOutcome, SyncError> {
        match self.warehouse.create_table(name, schema).await {
            Ok(()) => {
                info!(table = %name, fields = schema.len(), "created table");
                Ok(EnsureOutcome::Created)
            }
            Err(WarehouseError::AlreadyExists(_)) => {
                info!(table = %name, "table already exists");
                Ok(EnsureOutcome::AlreadyExists)
            }
            Err(source) => Err(SyncError::CreateTable {
                table: name.clone(),
                source,
            }),
        }
    }

    /// Drops `name` if present. Returns whether anything was dropped.
    pub async fn drop_if_exists(&self, name: &TableName) -> Result<bool, SyncError> {
        match self.warehouse.delete_table(name).await {
            Ok(()) => Ok(true),
            Err(WarehouseError::NotFound(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: 150,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadReport {
    pub job_id: Option<JobId>,
    pub polls: u32,
    pub states_seen: Vec<JobState>,
    pub rows_loaded: usize,
}

#[derive(Clone)]
pub struct StagingLoader {
    warehouse: Arc<dyn Warehouse>,
    policy: PollPolicy,
    locks: Arc<TableLocks>,
}

impl StagingLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>, policy: PollPolicy) -> Self {
        Self {
            warehouse,
            policy,
            locks: Arc::default(),
        }
    }

    /// Per-table locks shared with every clone of this loader.
    pub fn locks(&self) -> Arc<TableLocks> {
        Arc::clone(&self.locks)
    }

    /// Submits an append job and waits for it, polling once per interval.
    /// Holds the table's lock until the job settles, so a reconcile of the
    /// same table cannot swap the rows out from under it.
    pub async fn append(
        &self,
        table: &TableName,
        records: Vec<TypedRecord>,
        cancel: &CancellationToken,
    ) -> Result<LoadReport, SyncError> {
        let _guard = self.locks.acquire(table).await;
        self.append_unlocked(table, records, cancel).await
    }

    /// Caller holds the lock for `table`, or owns the table outright.
    async fn append_unlocked(
        &self,
        table: &TableName,
        records: Vec<TypedRecord>,
        cancel: &CancellationToken,
    ) -> Result<LoadReport, SyncError> {
        if records.is_empty() {
            info!(table = %table, "nothing to append");
            return Ok(LoadReport {
                job_id: None,
                polls: 0,
                states_seen: Vec::new(),
                rows_loaded: 0,
            });
        }
        let rows = records.len();
        let job = self.warehouse.load(table, records).await?;
        let mut states_seen = vec![JobState::Pending];
        info!(table = %table, job = %job, rows, state = %JobState::Pending, "load job submitted");

        let mut polls = 0;
        while polls < self.policy.max_attempts {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(table = %table, job = %job, polls, "load wait cancelled");
                    return Err(SyncError::Cancelled { table: table.clone() });
                }
                _ = tokio::time::sleep(self.policy.interval) => {}
            }
            let state = self.warehouse.job_state(&job).await?;
            polls += 1;
            info!(table = %table, job = %job, poll = polls, state = %state, "load job state");
            states_seen.push(state.clone());
            match state {
                JobState::Done => {
                    return Ok(LoadReport {
                        job_id: Some(job),
                        polls,
                        states_seen,
                        rows_loaded: rows,
                    })
                }
                JobState::Failed(reason) => {
                    return Err(SyncError::LoadFailed {
                        table: table.clone(),
                        job,
                        reason,
                    })
                }
                JobState::Pending | JobState::Running => {}
            }
        }
        let last_state = states_seen.last().cloned().unwrap_or(JobState::Pending);
        Err(SyncError::LoadTimeout {
            table: table.clone(),
            job,
            polls,
            last_state,
        })
    }
}

/// Keeps the first row of every key group, in input order. Returns the kept
/// rows and the number dropped.
pub fn dedupe_rows(rows: Vec<TypedRecord>, key_indices: &[usize]) -> (Vec<TypedRecord>, usize) {
    let mut seen: HashSet<Vec<KeyPart>> = HashSet::with_capacity(rows.len());
    let total = rows.len();
    let kept: Vec<TypedRecord> = rows
        .into_iter()
        .filter(|row| seen.insert(DedupeKey::tuple(key_indices, row)))
        .collect();
    let removed = total - kept.len();
    (kept, removed)
}

/// One async mutex per table name.
#[derive(Debug, Default)]
pub struct TableLocks {
    locks: Mutex<HashMap<TableName, Arc<Mutex<()>>>>,
}

impl TableLocks {
    pub async fn acquire(&self, table: &TableName) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(locks.entry(table.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Locks each distinct name once, in sorted order.
    pub async fn acquire_many(&self, tables: &[&TableName]) -> Vec<OwnedMutexGuard<()>> {
        let mut names = tables.to_vec();
        names.sort();
        names.dedup();
        let mut guards = Vec::with_capacity(names.len());
        for name in names {
            guards.push(self.acquire(name).await);
        }
        guards
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub rows_read: usize,
    pub duplicates_removed: usize,
    pub final_rows: usize,
    pub duplicate_ratio: f64,
    pub staging_dropped: bool,
}

pub struct Reconciler {
    warehouse: Arc<dyn Warehouse>,
    schema: SchemaManager,
    loader: StagingLoader,
    locks: Arc<TableLocks>,
    max_duplicate_ratio: Option<f64>,
}

impl Reconciler {
    /// Shares `loader`'s table locks, so appends and reconciles through the
    /// two are serialized per table.
    pub fn new(warehouse: Arc<dyn Warehouse>, loader: StagingLoader) -> Self {
        Self {
            schema: SchemaManager::new(Arc::clone(&warehouse)),
            warehouse,
            locks: loader.locks(),
            loader,
            max_duplicate_ratio: None,
        }
    }

    pub fn with_max_duplicate_ratio(mut self, ratio: Option<f64>) -> Self {
        self.max_duplicate_ratio = ratio;
        self
    }

    async fn scan_optional(&self, name: &TableName) -> Result<Option<Vec<TypedRecord>>, SyncError> {
        match self.warehouse.scan(name).await {
            Ok(rows) => Ok(Some(rows)),
            Err(WarehouseError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Deduplicates `staging` (plus the current contents of `final_table` when
    /// the two differ) and publishes the result under `final_table`.
    ///
    /// The clean rows are built in a temporary table and swapped in with one
    /// `replace_table`, so `final_table` is never observed empty or partial.
    /// Both `staging` and `final_table` stay locked for the whole call.
    pub async fn reconcile(
        &self,
        staging: &TableName,
        final_table: &TableName,
        schema: &TargetSchema,
        key: &DedupeKey,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport, SyncError> {
        let _guards = self.locks.acquire_many(&[staging, final_table]).await;
        self.reconcile_unlocked(staging, final_table, schema, key, cancel)
            .await
    }

    async fn reconcile_unlocked(
        &self,
        staging: &TableName,
        final_table: &TableName,
        schema: &TargetSchema,
        key: &DedupeKey,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport, SyncError> {
        let indices = key.indices(schema)?;
        let separate = staging != final_table;

        let mut rows = Vec::new();
        let mut staging_found = true;
        if separate {
            if let Some(existing) = self.scan_optional(final_table).await? {
                rows.extend(existing);
            }
            match self.scan_optional(staging).await? {
                Some(staged) => rows.extend(staged),
                None => staging_found = false,
            }
        } else {
            rows = self.warehouse.scan(staging).await?;
        }

        let rows_read = rows.len();
        let (kept, duplicates_removed) = dedupe_rows(rows, &indices);
        let final_rows = kept.len();
        let duplicate_ratio = if rows_read == 0 {
            0.0
        } else {
            duplicates_removed as f64 / rows_read as f64
        };
        info!(table = %final_table, rows_read, duplicates_removed, final_rows, "deduplicated");
        if let Some(max) = self.max_duplicate_ratio {
            if duplicate_ratio > max {
                warn!(table = %final_table, duplicate_ratio, max, "duplicate ratio above threshold");
            }
        }

        let run_tag = Uuid::new_v4().simple().to_string();
        let temp = final_table.with_suffix(&format!("__reconcile_{}", &run_tag[..8]));
        self.schema.drop_if_exists(&temp).await?;
        self.schema.ensure_table(&temp, schema).await?;
        if let Err(err) = self.loader.append_unlocked(&temp, kept, cancel).await {
            if let Err(cleanup) = self.schema.drop_if_exists(&temp).await {
                warn!(table = %temp, error = %cleanup, "could not drop temporary table");
            }
            return Err(err);
        }
        self.warehouse.replace_table(&temp, final_table).await?;
        info!(table = %final_table, final_rows, "published reconciled table");

        let mut staging_dropped = false;
        if separate && staging_found {
            match self.schema.drop_if_exists(staging).await {
                Ok(dropped) => staging_dropped = dropped,
                Err(err) => warn!(table = %staging, error = %err, "could not drop staging table"),
            }
        }

        Ok(ReconcileReport {
            rows_read,
            duplicates_removed,
            final_rows,
            duplicate_ratio,
            staging_dropped,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentifierReport {
    pub identifier: Identifier,
    pub pages: usize,
    pub rows: usize,
    pub termination: Termination,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetReport {
    pub dataset_id: String,
    pub source_kind: String,
    pub staging_table: String,
    pub final_table: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub identifiers: Vec<IdentifierReport>,
    pub rows_fetched: usize,
    pub rows_normalized: usize,
    pub nulled_fields: usize,
    pub dropped_columns: Vec<String>,
    pub load: Option<LoadReport>,
    pub reconcile: Option<ReconcileReport>,
    pub skipped: Option<String>,
    pub aborted: Option<String>,
    pub source_commit_error: Option<String>,
}

impl DatasetReport {
    fn start(descriptor: &DatasetDescriptor) -> Self {
        Self {
            dataset_id: descriptor.dataset_id.clone(),
            source_kind: descriptor.source.label().to_string(),
            staging_table: descriptor.table.to_string(),
            final_table: descriptor.final_table().to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            identifiers: Vec::new(),
            rows_fetched: 0,
            rows_normalized: 0,
            nulled_fields: 0,
            dropped_columns: Vec::new(),
            load: None,
            reconcile: None,
            skipped: None,
            aborted: None,
            source_commit_error: None,
        }
    }

    pub fn duplicates_removed(&self) -> usize {
        self.reconcile.as_ref().map_or(0, |r| r.duplicates_removed)
    }

    pub fn final_rows(&self) -> Option<usize> {
        self.reconcile.as_ref().map(|r| r.final_rows)
    }

    pub fn status(&self) -> &'static str {
        if self.aborted.is_some() {
            "aborted"
        } else if self.skipped.is_some() {
            "skipped"
        } else {
            "completed"
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub datasets: Vec<DatasetReport>,
    pub reports_dir: Option<String>,
}

impl RunSummary {
    pub fn aborted(&self) -> usize {
        self.datasets.iter().filter(|d| d.aborted.is_some()).count()
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    warehouse: Arc<dyn Warehouse>,
    transport: Arc<dyn PageTransport>,
    credentials: Arc<dyn CredentialProvider>,
    schema: SchemaManager,
    loader: StagingLoader,
    reconciler: Reconciler,
    cancel: CancellationToken,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        warehouse: Arc<dyn Warehouse>,
        transport: Arc<dyn PageTransport>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let loader = StagingLoader::new(Arc::clone(&warehouse), config.poll_policy());
        let reconciler = Reconciler::new(Arc::clone(&warehouse), loader.clone())
            .with_max_duplicate_ratio(config.max_duplicate_ratio);
        Self {
            schema: SchemaManager::new(Arc::clone(&warehouse)),
            loader,
            reconciler,
            config,
            warehouse,
            transport,
            credentials,
            cancel: CancellationToken::new(),
        }
    }

    /// Parquet warehouse under `warehouse_dir`, live HTTP, environment credentials.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let warehouse = ParquetWarehouse::open(config.warehouse_dir.clone())
            .await
            .with_context(|| format!("opening warehouse {}", config.warehouse_dir.display()))?;
        let http = HttpFetcher::new(config.http_config())?;
        Ok(Self::new(
            config,
            Arc::new(warehouse),
            Arc::new(http),
            Arc::new(EnvCredentials),
        ))
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn warehouse(&self) -> &Arc<dyn Warehouse> {
        &self.warehouse
    }

    /// Runs every dataset in order. A failing dataset is reported and the run
    /// moves on to the next one.
    pub async fn run_all(&self, datasets: &[DatasetDescriptor]) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, datasets = datasets.len(), "harvest run started");

        let mut reports = Vec::with_capacity(datasets.len());
        for descriptor in datasets {
            let report = self.run_dataset(descriptor).await;
            if let Some(reason) = &report.aborted {
                error!(dataset_id = %report.dataset_id, %reason, "dataset aborted");
            }
            reports.push(report);
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            datasets: reports,
            reports_dir: None,
        };
        info!(%run_id, aborted = summary.aborted(), "harvest run finished");
        summary
    }

    pub async fn run_dataset(&self, descriptor: &DatasetDescriptor) -> DatasetReport {
        let span = info_span!("dataset", dataset_id = %descriptor.dataset_id);
        let mut report = DatasetReport::start(descriptor);
        let outcome = self
            .try_run_dataset(descriptor, &mut report)
            .instrument(span)
            .await;
        if let Err(err) = outcome {
            report.aborted = Some(err.to_string());
        }
        report.finished_at = Utc::now();
        report
    }

    async fn try_run_dataset(
        &self,
        descriptor: &DatasetDescriptor,
        report: &mut DatasetReport,
    ) -> Result<(), SyncError> {
        descriptor.validate()?;
        let adapter = adapter_for_dataset(
            descriptor,
            Arc::clone(&self.transport),
            self.credentials.as_ref(),
        )?;
        self.schema
            .ensure_table(&descriptor.table, &descriptor.schema)
            .await?;

        let harvests = self.harvest_all(Arc::clone(&adapter)).await?;
        report.identifiers = harvests
            .iter()
            .map(|h| IdentifierReport {
                identifier: h.identifier.clone(),
                pages: h.pages(),
                rows: h.rows(),
                termination: h.termination.clone(),
            })
            .collect();
        report.rows_fetched = harvests.iter().map(IdentifierHarvest::rows).sum();

        if let Some(fatal) = harvests.iter().find(|h| h.termination.is_fatal()) {
            let reason = match &fatal.termination {
                Termination::FatalParseError(reason) => reason.clone(),
                other => other.to_string(),
            };
            return Err(SyncError::FatalParse {
                identifier: fatal.identifier.clone(),
                reason,
            });
        }
        if report.rows_fetched == 0 {
            if let Some(Termination::Skipped(reason)) = harvests
                .iter()
                .map(|h| &h.termination)
                .find(|t| matches!(t, Termination::Skipped(_)))
            {
                info!(%reason, "dataset skipped");
                report.skipped = Some(reason.clone());
                return Ok(());
            }
        }

        let mut stats = NormalizeStats::default();
        let mut records = Vec::with_capacity(report.rows_fetched);
        for batch in harvests.iter().flat_map(|h| h.batches.iter()) {
            records.extend(normalize_with_stats(
                batch,
                &descriptor.schema,
                &descriptor.column_aliases,
                &mut stats,
            ));
        }
        report.rows_normalized = stats.rows_out;
        report.nulled_fields = stats.nulled_fields;
        report.dropped_columns = stats.dropped_columns.into_iter().collect();
        if report.nulled_fields > 0 {
            warn!(nulled_fields = report.nulled_fields, "values could not be coerced");
        }

        let final_table = descriptor.final_table();
        let guards = self
            .loader
            .locks()
            .acquire_many(&[&descriptor.table, final_table])
            .await;
        // a concurrent run of this dataset may have dropped the staging table
        self.schema
            .ensure_table(&descriptor.table, &descriptor.schema)
            .await?;
        report.load = Some(
            self.loader
                .append_unlocked(&descriptor.table, records, &self.cancel)
                .await?,
        );
        report.reconcile = Some(
            self.reconciler
                .reconcile_unlocked(
                    &descriptor.table,
                    final_table,
                    &descriptor.schema,
                    &descriptor.dedupe_key,
                    &self.cancel,
                )
                .await?,
        );
        drop(guards);

        if report.rows_fetched > 0 {
            if let Err(err) = adapter.commit(report.rows_fetched).await {
                warn!(error = %err, "source commit failed after warehouse commit");
                report.source_commit_error = Some(err.to_string());
            }
        }
        Ok(())
    }

    /// Re-runs only the reconciliation step for one dataset.
    pub async fn reconcile_dataset(
        &self,
        descriptor: &DatasetDescriptor,
    ) -> Result<ReconcileReport, SyncError> {
        self.reconciler
            .reconcile(
                &descriptor.table,
                descriptor.final_table(),
                &descriptor.schema,
                &descriptor.dedupe_key,
                &self.cancel,
            )
            .await
    }

    /// Fetches every identifier on a bounded pool; results come back in
    /// declared identifier order regardless of completion order.
    async fn harvest_all(
        &self,
        adapter: Arc<dyn SourceAdapter>,
    ) -> Result<Vec<IdentifierHarvest>, SyncError> {
        let limit = Arc::new(Semaphore::new(self.config.fetch_concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for (index, identifier) in adapter.identifiers().into_iter().enumerate() {
            let adapter = Arc::clone(&adapter);
            let limit = Arc::clone(&limit);
            let span = info_span!("identifier", identifier = %identifier);
            tasks.spawn(
                async move {
                    let harvest = match limit.acquire_owned().await {
                        Ok(_permit) => adapter.harvest(&identifier).await,
                        Err(_) => IdentifierHarvest {
                            identifier,
                            batches: Vec::new(),
                            termination: Termination::TransientFailure(
                                "fetch pool closed".to_string(),
                            ),
                        },
                    };
                    info!(
                        pages = harvest.pages(),
                        rows = harvest.rows(),
                        termination = %harvest.termination,
                        "identifier harvested"
                    );
                    (index, harvest)
                }
                .instrument(span),
            );
        }

        let mut harvested = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            harvested.push(joined.map_err(|e| SyncError::Worker(e.to_string()))?);
        }
        harvested.sort_by_key(|(index, _)| *index);
        Ok(harvested.into_iter().map(|(_, harvest)| harvest).collect())
    }

    pub async fn write_reports(&self, summary: &RunSummary) -> Result<PathBuf> {
        let reports_dir = self.config.reports_dir.join(summary.run_id.to_string());
        fs::create_dir_all(&reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        fs::write(reports_dir.join("run_brief.md"), run_brief_markdown(summary))
            .await
            .context("writing run_brief.md")?;

        let summary_json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        fs::write(reports_dir.join("run_summary.json"), summary_json)
            .await
            .context("writing run_summary.json")?;

        Ok(reports_dir)
    }
}

pub fn run_brief_markdown(summary: &RunSummary) -> String {
    let rows = summary
        .datasets
        .iter()
        .map(|d| {
            let outcome = match (&d.aborted, &d.skipped) {
                (Some(reason), _) => format!("aborted: {reason}"),
                (None, Some(reason)) => format!("skipped: {reason}"),
                (None, None) => format!(
                    "fetched {}, normalized {}, duplicates removed {}, final rows {}",
                    d.rows_fetched,
                    d.rows_normalized,
                    d.duplicates_removed(),
                    d.final_rows().unwrap_or(0)
                ),
            };
            format!("- `{}` ({} -> {}): {}", d.dataset_id, d.staging_table, d.final_table, outcome)
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "# Harvest Run Brief\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Datasets: {}\n- Aborted: {}\n\n## Datasets\n{}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.datasets.len(),
        summary.aborted(),
        rows
    )
}

/// Loads the registry and config from the environment, runs the selected
/// datasets (all when `only` is empty) and writes the run reports.
pub async fn run_from_env(only: &[String], cancel: CancellationToken) -> Result<RunSummary> {
    let config = SyncConfig::from_env();
    let registry = DatasetRegistry::load(&config.datasets_path).await?;
    let datasets = registry.select(only)?;
    let pipeline = SyncPipeline::from_config(config)
        .await?
        .with_cancellation(cancel);
    let mut summary = pipeline.run_all(&datasets).await;
    let dir = pipeline.write_reports(&summary).await?;
    summary.reports_dir = Some(dir.display().to_string());
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use harvest_core::{FieldSpec, FieldType, SourceKind, SourceSpec, Value};
    use harvest_storage::{FetchError, FetchedResponse, MemoryWarehouse, PageRequest, StatusCode};
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;

    /// Serves fixed bodies by URL; unknown URLs get a page without a table.
    #[derive(Default)]
    struct PagedSite {
        pages: HashMap<String, String>,
        requested: StdMutex<Vec<String>>,
    }

    impl PagedSite {
        fn page(mut self, url: &str, rows: &[(&str, &str, &str)]) -> Self {
            let mut html =
                String::from("<table><tr><th>Commodity</th><th>Market</th><th>Wholesale</th></tr>");
            for (commodity, market, price) in rows {
                html.push_str(&format!(
                    "<tr><td>{commodity}</td><td>{market}</td><td>{price}</td></tr>"
                ));
            }
            html.push_str("</table>");
            self.pages.insert(url.to_string(), html);
            self
        }

        fn raw(mut self, url: &str, body: &str) -> Self {
            self.pages.insert(url.to_string(), body.to_string());
            self
        }

        fn requests(&self) -> usize {
            self.requested.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PageTransport for PagedSite {
        async fn get(&self, request: &PageRequest) -> Result<FetchedResponse, FetchError> {
            self.requested.lock().unwrap().push(request.url.clone());
            let body = self
                .pages
                .get(&request.url)
                .cloned()
                .unwrap_or_else(|| "<html><body>No data</body></html>".to_string());
            Ok(FetchedResponse {
                status: StatusCode::OK,
                final_url: request.url.clone(),
                body: body.into_bytes(),
            })
        }
    }

    fn table(name: &str) -> TableName {
        TableName::parse(name).unwrap()
    }

    fn price_schema() -> TargetSchema {
        TargetSchema::new(vec![
            FieldSpec::new("commodity", FieldType::String),
            FieldSpec::new("market", FieldType::String),
            FieldSpec::new("wholesale", FieldType::Float),
        ])
        .unwrap()
    }

    fn price_row(commodity: &str, market: &str, price: f64) -> TypedRecord {
        TypedRecord::new(vec![
            Value::String(commodity.to_string()),
            Value::String(market.to_string()),
            Value::Float(price),
        ])
    }

    fn descriptor() -> DatasetDescriptor {
        DatasetDescriptor {
            dataset_id: "market_prices".to_string(),
            enabled: true,
            source: SourceKind::Paginated(SourceSpec {
                endpoint_template: "https://prices.test/market{offset}?product={id}&per_page={page_size}"
                    .to_string(),
                page_size: 2,
                identifiers: vec![Identifier::Int(1), Identifier::Int(2)],
                raw_schema_hint: BTreeMap::from([("Commodity".to_string(), "STRING".to_string())]),
                accept_invalid_certs: false,
            }),
            table: table("agri.market_prices_staging"),
            final_table: Some(table("agri.market_prices")),
            schema: price_schema(),
            dedupe_key: DedupeKey::new(["commodity", "market"]),
            column_aliases: BTreeMap::new(),
        }
    }

    fn site() -> PagedSite {
        PagedSite::default()
            .page(
                "https://prices.test/market?product=1&per_page=2",
                &[("Maize", "Nairobi", "50.00/Kg"), ("Beans", "Nairobi", "120.00/Kg")],
            )
            .page(
                "https://prices.test/market/2?product=1&per_page=2",
                &[("Maize", "Nairobi", "55.00/Kg")],
            )
            .page(
                "https://prices.test/market?product=2&per_page=2",
                &[("Maize", "Kisumu", "48.00/Kg")],
            )
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            poll_interval: Duration::from_millis(10),
            poll_max_attempts: 5,
            ..SyncConfig::default()
        }
    }

    fn pipeline(warehouse: Arc<MemoryWarehouse>, site: Arc<PagedSite>) -> SyncPipeline {
        SyncPipeline::new(
            fast_config(),
            warehouse,
            site,
            Arc::new(harvest_adapters::StaticCredentials::default()),
        )
    }

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let rows = vec![
            price_row("Maize", "Nairobi", 50.0),
            price_row("Beans", "Nairobi", 120.0),
            price_row("Maize", "Nairobi", 55.0),
        ];
        let indices = DedupeKey::new(["commodity", "market"]).indices(&price_schema()).unwrap();
        let (kept, removed) = dedupe_rows(rows, &indices);
        assert_eq!(removed, 1);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0], price_row("Maize", "Nairobi", 50.0));
        assert_eq!(kept[1], price_row("Beans", "Nairobi", 120.0));

        let (again, removed_again) = dedupe_rows(kept.clone(), &indices);
        assert_eq!(removed_again, 0);
        assert_eq!(again, kept);
    }

    #[test]
    fn empty_key_compares_whole_rows() {
        let rows = vec![
            price_row("Maize", "Nairobi", 50.0),
            price_row("Maize", "Nairobi", 55.0),
            price_row("Maize", "Nairobi", 50.0),
        ];
        let indices = DedupeKey::default().indices(&price_schema()).unwrap();
        let (kept, removed) = dedupe_rows(rows, &indices);
        assert_eq!((kept.len(), removed), (2, 1));
    }

    #[tokio::test]
    async fn ensure_table_is_idempotent() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let manager = SchemaManager::new(warehouse.clone());
        let name = table("agri.prices");
        assert_eq!(
            manager.ensure_table(&name, &price_schema()).await.unwrap(),
            EnsureOutcome::Created
        );
        assert_eq!(
            manager.ensure_table(&name, &price_schema()).await.unwrap(),
            EnsureOutcome::AlreadyExists
        );
        assert_eq!(warehouse.table_names().await, vec![name]);
    }

    #[tokio::test]
    async fn ensure_table_surfaces_other_failures() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        warehouse.fail_next_create("quota exceeded").await;
        let manager = SchemaManager::new(warehouse.clone());
        let err = manager
            .ensure_table(&table("agri.prices"), &price_schema())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::CreateTable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn load_job_walks_pending_running_done() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let name = table("agri.prices");
        warehouse.create_table(&name, &price_schema()).await.unwrap();
        let loader = StagingLoader::new(warehouse.clone(), PollPolicy::default());

        let report = loader
            .append(
                &name,
                vec![price_row("Maize", "Nairobi", 50.0), price_row("Beans", "Nairobi", 120.0)],
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.polls, 2);
        assert_eq!(
            report.states_seen,
            vec![JobState::Pending, JobState::Running, JobState::Done]
        );
        assert_eq!(report.rows_loaded, 2);
        assert_eq!(warehouse.row_count(&name).await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn load_job_that_never_finishes_times_out() {
        let warehouse = Arc::new(MemoryWarehouse::with_job_script(vec![JobState::Running]));
        let name = table("agri.prices");
        warehouse.create_table(&name, &price_schema()).await.unwrap();
        let loader = StagingLoader::new(
            warehouse.clone(),
            PollPolicy {
                interval: Duration::from_secs(2),
                max_attempts: 3,
            },
        );
        let err = loader
            .append(&name, vec![price_row("Maize", "Nairobi", 50.0)], &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            SyncError::LoadTimeout { polls, last_state, .. } => {
                assert_eq!(polls, 3);
                assert_eq!(last_state, JobState::Running);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(warehouse.row_count(&name).await, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_and_cancelled_loads_are_distinct() {
        let warehouse = Arc::new(MemoryWarehouse::with_job_script(vec![
            JobState::Running,
            JobState::Failed("bad row".to_string()),
        ]));
        let name = table("agri.prices");
        warehouse.create_table(&name, &price_schema()).await.unwrap();
        let loader = StagingLoader::new(warehouse.clone(), PollPolicy::default());
        let rows = vec![price_row("Maize", "Nairobi", 50.0)];

        let failed = loader
            .append(&name, rows.clone(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(failed, SyncError::LoadFailed { ref reason, .. } if reason == "bad row"));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let cancelled = loader.append(&name, rows, &cancel).await.unwrap_err();
        assert!(matches!(cancelled, SyncError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn empty_append_submits_no_job() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let loader = StagingLoader::new(warehouse, PollPolicy::default());
        let report = loader
            .append(&table("agri.absent"), Vec::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.polls, 0);
        assert!(report.job_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_twice_is_a_no_op() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let name = table("agri.prices");
        let loader = StagingLoader::new(warehouse.clone(), PollPolicy::default());
        let reconciler = Reconciler::new(warehouse.clone(), loader.clone());
        let cancel = CancellationToken::new();
        warehouse.create_table(&name, &price_schema()).await.unwrap();
        loader
            .append(
                &name,
                vec![
                    price_row("Maize", "Nairobi", 50.0),
                    price_row("Maize", "Nairobi", 55.0),
                    price_row("Beans", "Nairobi", 120.0),
                ],
                &cancel,
            )
            .await
            .unwrap();

        let key = DedupeKey::new(["commodity", "market"]);
        let first = reconciler
            .reconcile(&name, &name, &price_schema(), &key, &cancel)
            .await
            .unwrap();
        assert_eq!(first.duplicates_removed, 1);
        assert_eq!(first.final_rows, 2);
        let after_first = warehouse.scan(&name).await.unwrap();

        let second = reconciler
            .reconcile(&name, &name, &price_schema(), &key, &cancel)
            .await
            .unwrap();
        assert_eq!(second.duplicates_removed, 0);
        assert_eq!(warehouse.scan(&name).await.unwrap(), after_first);
        assert_eq!(warehouse.table_names().await, vec![name]);
    }

    #[tokio::test(start_paused = true)]
    async fn append_and_reconcile_on_one_table_never_lose_rows() {
        let key = DedupeKey::new(["commodity", "market"]);
        // append first with reconcile queued behind it, then the reverse
        for (append_delay, reconcile_delay) in [(0, 3), (1, 0)] {
            let warehouse = Arc::new(MemoryWarehouse::new());
            let name = table("agri.prices");
            let loader = StagingLoader::new(warehouse.clone(), PollPolicy::default());
            let reconciler = Reconciler::new(warehouse.clone(), loader.clone());
            let cancel = CancellationToken::new();
            warehouse.create_table(&name, &price_schema()).await.unwrap();
            loader
                .append(
                    &name,
                    vec![price_row("Maize", "Nairobi", 50.0), price_row("Maize", "Nairobi", 55.0)],
                    &cancel,
                )
                .await
                .unwrap();

            let (appended, reconciled) = tokio::join!(
                async {
                    tokio::time::sleep(Duration::from_secs(append_delay)).await;
                    loader
                        .append(&name, vec![price_row("Beans", "Nairobi", 120.0)], &cancel)
                        .await
                },
                async {
                    tokio::time::sleep(Duration::from_secs(reconcile_delay)).await;
                    reconciler
                        .reconcile(&name, &name, &price_schema(), &key, &cancel)
                        .await
                }
            );
            assert_eq!(appended.unwrap().rows_loaded, 1);
            assert_eq!(reconciled.unwrap().duplicates_removed, 1);
            assert_eq!(
                warehouse.scan(&name).await.unwrap(),
                vec![price_row("Maize", "Nairobi", 50.0), price_row("Beans", "Nairobi", 120.0)],
                "append delayed {append_delay}s, reconcile delayed {reconcile_delay}s"
            );
            assert_eq!(warehouse.table_names().await, vec![name]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_reconciles_run_one_after_the_other() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let name = table("agri.prices");
        let loader = StagingLoader::new(warehouse.clone(), PollPolicy::default());
        let reconciler = Reconciler::new(warehouse.clone(), loader.clone());
        let cancel = CancellationToken::new();
        let key = DedupeKey::new(["commodity", "market"]);
        warehouse.create_table(&name, &price_schema()).await.unwrap();
        loader
            .append(
                &name,
                vec![
                    price_row("Maize", "Nairobi", 50.0),
                    price_row("Maize", "Nairobi", 55.0),
                    price_row("Beans", "Nairobi", 120.0),
                ],
                &cancel,
            )
            .await
            .unwrap();

        let schema = price_schema();
        let (first, second) = tokio::join!(
            reconciler.reconcile(&name, &name, &schema, &key, &cancel),
            reconciler.reconcile(&name, &name, &schema, &key, &cancel)
        );
        let mut removed = vec![
            first.unwrap().duplicates_removed,
            second.unwrap().duplicates_removed,
        ];
        removed.sort_unstable();
        // the later call reads the table the earlier one published
        assert_eq!(removed, vec![0, 1]);
        assert_eq!(warehouse.row_count(&name).await, Some(2));
        assert_eq!(warehouse.table_names().await, vec![name]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_runs_of_one_dataset_both_land() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let pipeline = pipeline(warehouse.clone(), Arc::new(site()));
        let descriptor = descriptor();

        let (one, two) = tokio::join!(
            pipeline.run_dataset(&descriptor),
            pipeline.run_dataset(&descriptor)
        );
        assert_eq!(one.aborted, None);
        assert_eq!(two.aborted, None);
        let mut rows_read = vec![
            one.reconcile.as_ref().map_or(0, |r| r.rows_read),
            two.reconcile.as_ref().map_or(0, |r| r.rows_read),
        ];
        rows_read.sort_unstable();
        // 4 staged rows, then 3 published plus 4 staged again
        assert_eq!(rows_read, vec![4, 7]);

        let final_table = table("agri.market_prices");
        assert_eq!(
            warehouse.scan(&final_table).await.unwrap(),
            vec![
                price_row("Maize", "Nairobi", 50.0),
                price_row("Beans", "Nairobi", 120.0),
                price_row("Maize", "Kisumu", 48.0),
            ]
        );
        assert_eq!(warehouse.table_names().await, vec![final_table]);
    }

    #[tokio::test(start_paused = true)]
    async fn dataset_run_publishes_deduplicated_final_table() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let site = Arc::new(site());
        let pipeline = pipeline(warehouse.clone(), site.clone());
        let descriptor = descriptor();

        let report = pipeline.run_dataset(&descriptor).await;
        assert_eq!(report.aborted, None);
        assert_eq!(report.rows_fetched, 4);
        assert_eq!(report.rows_normalized, 4);
        assert_eq!(report.identifiers.len(), 2);
        assert_eq!(report.identifiers[0].identifier, Identifier::Int(1));
        assert_eq!(report.identifiers[0].pages, 2);
        assert_eq!(report.identifiers[1].pages, 1);
        assert_eq!(report.duplicates_removed(), 1);
        assert_eq!(report.final_rows(), Some(3));

        let final_table = table("agri.market_prices");
        let rows = warehouse.scan(&final_table).await.unwrap();
        assert_eq!(
            rows,
            vec![
                price_row("Maize", "Nairobi", 50.0),
                price_row("Beans", "Nairobi", 120.0),
                price_row("Maize", "Kisumu", 48.0),
            ]
        );
        assert_eq!(warehouse.table_names().await, vec![final_table.clone()]);

        let rerun = pipeline.run_dataset(&descriptor).await;
        assert_eq!(rerun.aborted, None);
        assert_eq!(rerun.final_rows(), Some(3));
        assert_eq!(warehouse.scan(&final_table).await.unwrap(), rows);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_parse_error_aborts_before_any_rows_are_written() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let site = Arc::new(site().raw(
            "https://prices.test/market?product=2&per_page=2",
            "<table><tr><th>Product</th></tr><tr><td>Maize</td></tr></table>",
        ));
        let pipeline = pipeline(warehouse.clone(), site);

        let report = pipeline.run_dataset(&descriptor()).await;
        let reason = report.aborted.expect("aborted");
        assert!(reason.contains("Commodity"), "{reason}");
        assert!(report.load.is_none());
        assert_eq!(warehouse.row_count(&table("agri.market_prices_staging")).await, Some(0));
        assert_eq!(warehouse.row_count(&table("agri.market_prices")).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn create_failure_aborts_one_dataset_and_the_run_continues() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let site = Arc::new(site());
        let pipeline = pipeline(warehouse.clone(), site.clone());
        warehouse.fail_next_create("permission denied").await;

        let summary = pipeline.run_all(&[descriptor(), descriptor()]).await;
        assert_eq!(summary.aborted(), 1);
        assert!(summary.datasets[0]
            .aborted
            .as_deref()
            .is_some_and(|r| r.contains("permission denied")));
        assert_eq!(summary.datasets[1].status(), "completed");
        assert_eq!(summary.datasets[1].final_rows(), Some(3));
        // only the second dataset fetched: three pages for product 1, two for product 2
        assert_eq!(site.requests(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn reports_are_written_per_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let warehouse = Arc::new(MemoryWarehouse::new());
        let pipeline = SyncPipeline::new(
            SyncConfig {
                reports_dir: dir.path().to_path_buf(),
                ..fast_config()
            },
            warehouse,
            Arc::new(site()),
            Arc::new(harvest_adapters::StaticCredentials::default()),
        );
        let summary = pipeline.run_all(&[descriptor()]).await;
        let out = pipeline.write_reports(&summary).await.expect("reports");

        let brief = std::fs::read_to_string(out.join("run_brief.md")).expect("brief");
        assert!(brief.contains("market_prices"));
        assert!(brief.contains("duplicates removed 1"));
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(out.join("run_summary.json")).expect("json"))
                .expect("parse");
        assert_eq!(json["datasets"][0]["rows_fetched"], 4);
    }

    #[test]
    fn registry_rejects_duplicate_ids() {
        let one = r#"
  - dataset_id: crypto
    source:
      kind: paginated
      endpoint_template: "https://coins.test/all{offset}?per_page={page_size}"
      page_size: 100
      identifiers: [1]
    table: markets.crypto
    schema:
      - { name: symbol, type: STRING }
      - { name: price, type: FLOAT }
    dedupe_key: [symbol]
"#;
        let single = DatasetRegistry::from_yaml(&format!("datasets:{one}")).unwrap();
        assert_eq!(single.select(&[]).unwrap().len(), 1);
        assert!(single.select(&["nope".to_string()]).is_err());
        assert!(DatasetRegistry::from_yaml(&format!("datasets:{one}{one}")).is_err());
    }

    #[test]
    fn disabled_datasets_run_only_when_named() {
        let raw = r#"
datasets:
  - dataset_id: prices
    source:
      kind: paginated
      endpoint_template: "https://prices.test/market{offset}?product={id}"
      page_size: 10
      identifiers: [1]
    table: agri.prices
    schema:
      - { name: commodity, type: STRING }
  - dataset_id: coins
    enabled: false
    source:
      kind: paginated
      endpoint_template: "https://coins.test/all{offset}?per_page={page_size}"
      page_size: 100
      identifiers: [1]
    table: markets.coins
    schema:
      - { name: symbol, type: STRING }
"#;
        let registry = DatasetRegistry::from_yaml(raw).unwrap();
        assert!(registry.get("prices").unwrap().enabled);
        let ids = |picked: Vec<DatasetDescriptor>| {
            picked.into_iter().map(|d| d.dataset_id).collect::<Vec<_>>()
        };
        assert_eq!(ids(registry.select(&[]).unwrap()), vec!["prices"]);
        assert_eq!(ids(registry.select(&["coins".to_string()]).unwrap()), vec!["coins"]);
    }
}
