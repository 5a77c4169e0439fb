//! Warehouse backends + HTTP fetch utilities for the harvest pipeline.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use arrow_array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, RecordBatch, StringArray,
    TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field as ArrowField, Schema, TimeUnit};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use harvest_core::{FieldSpec, FieldType, TableName, TargetSchema, TypedRecord, Value};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
pub use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-storage";

const CATALOG_FILE: &str = "catalog.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// One GET against a source. `query` is sent as URL parameters but kept out of logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub source_id: String,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub accept_invalid_certs: bool,
}

impl PageRequest {
    pub fn new(source_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
            query: Vec::new(),
            accept_invalid_certs: false,
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    /// Body decoded as UTF-8, with invalid sequences replaced by U+FFFD.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after {attempts} attempt(s): {source}")]
    Request {
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("fetcher is shutting down")]
    Shutdown,
}

/// Seam between source adapters and the network.
#[async_trait]
pub trait PageTransport: Send + Sync {
    async fn get(&self, request: &PageRequest) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    insecure_client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = Self::build_client(&config, false).context("building reqwest client")?;
        // Some public sources serve broken certificate chains; trusting them is
        // an explicit per-source opt-in.
        let insecure_client =
            Self::build_client(&config, true).context("building reqwest client without TLS verification")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            insecure_client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    fn build_client(config: &HttpClientConfig, accept_invalid_certs: bool) -> reqwest::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .danger_accept_invalid_certs(accept_invalid_certs);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        builder.build()
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    async fn send_with_retries(&self, request: &PageRequest) -> Result<FetchedResponse, FetchError> {
        let client = if request.accept_invalid_certs {
            &self.insecure_client
        } else {
            &self.client
        };

        let mut attempt = 0usize;
        loop {
            match client.get(&request.url).query(&request.query).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let mut final_url = resp.url().clone();
                    final_url.set_query(None);
                    let final_url = final_url.to_string();

                    if status.is_success() {
                        let body = resp
                            .bytes()
                            .await
                            .map_err(|source| FetchError::Request {
                                attempts: attempt + 1,
                                source,
                            })?
                            .to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(status = status.as_u16(), attempt, ?delay, "retryable http status");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(error = %err, attempt, ?delay, "retryable request error");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request {
                        attempts: attempt + 1,
                        source: err,
                    });
                }
            }
        }
    }
}

#[async_trait]
impl PageTransport for HttpFetcher {
    async fn get(&self, request: &PageRequest) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Shutdown)?;
        let per_source = self.per_source_semaphore(&request.source_id).await;
        let _source = per_source.acquire().await.map_err(|_| FetchError::Shutdown)?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", source_id = %request.source_id, url = %request.url);
        self.send_with_retries(request).instrument(span).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of an asynchronous load job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed(String),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed(_))
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => f.write_str("PENDING"),
            JobState::Running => f.write_str("RUNNING"),
            JobState::Done => f.write_str("DONE"),
            JobState::Failed(reason) => write!(f, "FAILED ({reason})"),
        }
    }
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("table {0} already exists")]
    AlreadyExists(TableName),
    #[error("table {0} not found")]
    NotFound(TableName),
    #[error("unknown load job {0}")]
    UnknownJob(JobId),
    #[error("row {row} for {table} has {actual} values, schema expects {expected}")]
    RowShape {
        table: TableName,
        row: usize,
        expected: usize,
        actual: usize,
    },
    #[error("column {column} of {table} expects {expected}, got {actual}")]
    TypeMismatch {
        table: TableName,
        column: String,
        expected: FieldType,
        actual: FieldType,
    },
    #[error("warehouse unavailable: {0}")]
    Unavailable(String),
    #[error("catalog error: {0}")]
    Catalog(String),
    #[error("i/o error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error(transparent)]
    Arrow(#[from] arrow_schema::ArrowError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> WarehouseError + '_ {
    move |source| WarehouseError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Columnar warehouse client consumed by the pipeline.
///
/// Rows are only ever created, appended, scanned, deleted, or replaced as a
/// whole table; nothing is edited in place.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Backend identifier for logging.
    fn backend(&self) -> &'static str;

    async fn create_table(&self, name: &TableName, schema: &TargetSchema) -> Result<(), WarehouseError>;

    async fn table_schema(&self, name: &TableName) -> Result<Option<TargetSchema>, WarehouseError>;

    /// Submits an append job; rows become visible once the job reaches `Done`.
    async fn load(&self, name: &TableName, rows: Vec<TypedRecord>) -> Result<JobId, WarehouseError>;

    /// A terminal state is reported at least once; after that a backend may
    /// forget the job and answer `UnknownJob`.
    async fn job_state(&self, job: &JobId) -> Result<JobState, WarehouseError>;

    /// Full read-back of a table in stored row order.
    async fn scan(&self, name: &TableName) -> Result<Vec<TypedRecord>, WarehouseError>;

    async fn delete_table(&self, name: &TableName) -> Result<(), WarehouseError>;

    /// Atomically repoints `target` at the contents of `source`. After success
    /// `source` no longer exists and the previous `target` contents are gone.
    async fn replace_table(&self, source: &TableName, target: &TableName) -> Result<(), WarehouseError>;
}

pub fn validate_rows(
    table: &TableName,
    schema: &TargetSchema,
    rows: &[TypedRecord],
) -> Result<(), WarehouseError> {
    for (row_idx, row) in rows.iter().enumerate() {
        if row.values().len() != schema.len() {
            return Err(WarehouseError::RowShape {
                table: table.clone(),
                row: row_idx,
                expected: schema.len(),
                actual: row.values().len(),
            });
        }
        for (field, value) in schema.fields().iter().zip(row.values()) {
            if let Some(actual) = value.field_type() {
                if actual != field.field_type {
                    return Err(WarehouseError::TypeMismatch {
                        table: table.clone(),
                        column: field.name.clone(),
                        expected: field.field_type,
                        actual,
                    });
                }
            }
        }
    }
    Ok(())
}

#[derive(Debug)]
struct MemoryTable {
    schema: TargetSchema,
    rows: Vec<TypedRecord>,
}

#[derive(Debug)]
struct MemoryJob {
    table: TableName,
    rows: Vec<TypedRecord>,
    script: VecDeque<JobState>,
    current: JobState,
}

/// Process-local warehouse. Each load job walks a scripted sequence of states,
/// one step per `job_state` poll, and applies its rows on reaching `Done`.
#[derive(Debug)]
pub struct MemoryWarehouse {
    tables: Mutex<HashMap<TableName, MemoryTable>>,
    jobs: Mutex<HashMap<JobId, MemoryJob>>,
    job_script: Vec<JobState>,
    create_failure: Mutex<Option<String>>,
}

impl Default for MemoryWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::with_job_script(vec![JobState::Running, JobState::Done])
    }

    /// States reported by successive polls after submission (which is `Pending`).
    /// An exhausted script keeps reporting its last state.
    pub fn with_job_script(job_script: Vec<JobState>) -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            jobs: Mutex::new(HashMap::new()),
            job_script,
            create_failure: Mutex::new(None),
        }
    }

    /// Makes the next `create_table` call fail with [`WarehouseError::Unavailable`].
    pub async fn fail_next_create(&self, message: impl Into<String>) {
        *self.create_failure.lock().await = Some(message.into());
    }

    pub async fn row_count(&self, name: &TableName) -> Option<usize> {
        self.tables.lock().await.get(name).map(|t| t.rows.len())
    }

    pub async fn table_names(&self) -> Vec<TableName> {
        let mut names: Vec<_> = self.tables.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn create_table(&self, name: &TableName, schema: &TargetSchema) -> Result<(), WarehouseError> {
        if let Some(message) = self.create_failure.lock().await.take() {
            return Err(WarehouseError::Unavailable(message));
        }
        let mut tables = self.tables.lock().await;
        if tables.contains_key(name) {
            return Err(WarehouseError::AlreadyExists(name.clone()));
        }
        tables.insert(
            name.clone(),
            MemoryTable {
                schema: schema.clone(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn table_schema(&self, name: &TableName) -> Result<Option<TargetSchema>, WarehouseError> {
        Ok(self.tables.lock().await.get(name).map(|t| t.schema.clone()))
    }

    async fn load(&self, name: &TableName, rows: Vec<TypedRecord>) -> Result<JobId, WarehouseError> {
        {
            let tables = self.tables.lock().await;
            let table = tables
                .get(name)
                .ok_or_else(|| WarehouseError::NotFound(name.clone()))?;
            validate_rows(name, &table.schema, &rows)?;
        }
        let job = JobId::new();
        self.jobs.lock().await.insert(
            job.clone(),
            MemoryJob {
                table: name.clone(),
                rows,
                script: self.job_script.iter().cloned().collect(),
                current: JobState::Pending,
            },
        );
        Ok(job)
    }

    async fn job_state(&self, job: &JobId) -> Result<JobState, WarehouseError> {
        let mut jobs = self.jobs.lock().await;
        let entry = jobs
            .get_mut(job)
            .ok_or_else(|| WarehouseError::UnknownJob(job.clone()))?;
        if entry.current.is_terminal() {
            return Ok(entry.current.clone());
        }
        let Some(next) = entry.script.pop_front() else {
            return Ok(entry.current.clone());
        };
        entry.current = if next == JobState::Done {
            let mut tables = self.tables.lock().await;
            match tables.get_mut(&entry.table) {
                Some(table) => {
                    table.rows.append(&mut entry.rows);
                    JobState::Done
                }
                None => JobState::Failed(format!("table {} not found", entry.table)),
            }
        } else {
            next
        };
        Ok(entry.current.clone())
    }

    async fn scan(&self, name: &TableName) -> Result<Vec<TypedRecord>, WarehouseError> {
        self.tables
            .lock()
            .await
            .get(name)
            .map(|t| t.rows.clone())
            .ok_or_else(|| WarehouseError::NotFound(name.clone()))
    }

    async fn delete_table(&self, name: &TableName) -> Result<(), WarehouseError> {
        self.tables
            .lock()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| WarehouseError::NotFound(name.clone()))
    }

    async fn replace_table(&self, source: &TableName, target: &TableName) -> Result<(), WarehouseError> {
        let mut tables = self.tables.lock().await;
        let table = tables
            .remove(source)
            .ok_or_else(|| WarehouseError::NotFound(source.clone()))?;
        tables.insert(target.clone(), table);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Catalog {
    tables: BTreeMap<String, CatalogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogEntry {
    schema: TargetSchema,
    /// Directory under `data/` holding this table instance's part files.
    location: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    parts: Vec<PartEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PartEntry {
    file: String,
    rows: usize,
    bytes: u64,
    sha256: String,
}

/// Local columnar warehouse: one directory of Parquet part files per table and
/// a JSON catalog mapping logical names to directories.
///
/// Every catalog change is written to a temp file and renamed into place, so a
/// logical name always points at a complete table. `replace_table` is a single
/// catalog commit.
#[derive(Debug, Clone)]
pub struct ParquetWarehouse {
    inner: Arc<ParquetInner>,
}

#[derive(Debug)]
struct ParquetInner {
    root: PathBuf,
    catalog: Mutex<Catalog>,
    jobs: Mutex<HashMap<JobId, JobState>>,
}

impl ParquetWarehouse {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, WarehouseError> {
        let root = root.into();
        let data_dir = root.join("data");
        fs::create_dir_all(&data_dir)
            .await
            .map_err(io_error(&data_dir))?;

        let catalog_path = root.join(CATALOG_FILE);
        let catalog = match fs::read(&catalog_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                WarehouseError::Catalog(format!("parsing {}: {e}", catalog_path.display()))
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Catalog::default(),
            Err(err) => return Err(io_error(&catalog_path)(err)),
        };
        info!(root = %root.display(), tables = catalog.tables.len(), "opened parquet warehouse");

        Ok(Self {
            inner: Arc::new(ParquetInner {
                root,
                catalog: Mutex::new(catalog),
                jobs: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }
}

impl ParquetInner {
    fn location_dir(&self, location: &str) -> PathBuf {
        self.root.join("data").join(location)
    }

    async fn persist(&self, catalog: &Catalog) -> Result<(), WarehouseError> {
        let bytes = serde_json::to_vec_pretty(catalog)
            .map_err(|e| WarehouseError::Catalog(format!("serializing catalog: {e}")))?;
        write_atomic(&self.root.join(CATALOG_FILE), &bytes).await
    }

    async fn set_job(&self, job: &JobId, state: JobState) {
        self.jobs.lock().await.insert(job.clone(), state);
    }

    async fn remove_location(&self, location: &str) {
        let dir = self.location_dir(location);
        if let Err(err) = fs::remove_dir_all(&dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %dir.display(), error = %err, "failed to remove table data");
            }
        }
    }

    async fn append_part(
        &self,
        name: &TableName,
        schema: TargetSchema,
        location: &str,
        rows: Vec<TypedRecord>,
    ) -> Result<usize, WarehouseError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let row_count = rows.len();
        let encoded = tokio::task::spawn_blocking(move || encode_parquet(&schema, &rows))
            .await
            .map_err(|e| WarehouseError::Catalog(format!("encoding task failed: {e}")))??;

        let file = format!("part-{}.parquet", Uuid::new_v4());
        let path = self.location_dir(location).join(&file);
        write_atomic(&path, &encoded).await?;

        let part = PartEntry {
            file,
            rows: row_count,
            bytes: encoded.len() as u64,
            sha256: sha256_hex(&encoded),
        };

        let mut catalog = self.catalog.lock().await;
        let mut next = catalog.clone();
        let still_current = match next.tables.get_mut(name.as_str()) {
            Some(entry) if entry.location == location => {
                entry.parts.push(part);
                true
            }
            _ => false,
        };
        if !still_current {
            drop(catalog);
            let _ = fs::remove_file(&path).await;
            return Err(WarehouseError::Catalog(format!(
                "table {name} was replaced or deleted during load"
            )));
        }
        self.persist(&next).await?;
        *catalog = next;
        Ok(row_count)
    }
}

#[async_trait]
impl Warehouse for ParquetWarehouse {
    fn backend(&self) -> &'static str {
        "parquet"
    }

    async fn create_table(&self, name: &TableName, schema: &TargetSchema) -> Result<(), WarehouseError> {
        let mut catalog = self.inner.catalog.lock().await;
        if catalog.tables.contains_key(name.as_str()) {
            return Err(WarehouseError::AlreadyExists(name.clone()));
        }
        let location = Uuid::new_v4().to_string();
        let dir = self.inner.location_dir(&location);
        fs::create_dir_all(&dir).await.map_err(io_error(&dir))?;

        let mut next = catalog.clone();
        next.tables.insert(
            name.as_str().to_string(),
            CatalogEntry {
                schema: schema.clone(),
                location,
                created_at: Utc::now(),
                parts: Vec::new(),
            },
        );
        self.inner.persist(&next).await?;
        *catalog = next;
        debug!(table = %name, "created table");
        Ok(())
    }

    async fn table_schema(&self, name: &TableName) -> Result<Option<TargetSchema>, WarehouseError> {
        Ok(self
            .inner
            .catalog
            .lock()
            .await
            .tables
            .get(name.as_str())
            .map(|e| e.schema.clone()))
    }

    async fn load(&self, name: &TableName, rows: Vec<TypedRecord>) -> Result<JobId, WarehouseError> {
        let (schema, location) = {
            let catalog = self.inner.catalog.lock().await;
            let entry = catalog
                .tables
                .get(name.as_str())
                .ok_or_else(|| WarehouseError::NotFound(name.clone()))?;
            (entry.schema.clone(), entry.location.clone())
        };
        validate_rows(name, &schema, &rows)?;

        let job = JobId::new();
        self.inner.set_job(&job, JobState::Pending).await;

        let inner = Arc::clone(&self.inner);
        let job_id = job.clone();
        let table = name.clone();
        tokio::spawn(async move {
            inner.set_job(&job_id, JobState::Running).await;
            let state = match inner.append_part(&table, schema, &location, rows).await {
                Ok(rows) => {
                    debug!(table = %table, rows, job = %job_id, "load job committed");
                    JobState::Done
                }
                Err(err) => {
                    warn!(table = %table, job = %job_id, error = %err, "load job failed");
                    JobState::Failed(err.to_string())
                }
            };
            inner.set_job(&job_id, state).await;
        });
        Ok(job)
    }

    async fn job_state(&self, job: &JobId) -> Result<JobState, WarehouseError> {
        let mut jobs = self.inner.jobs.lock().await;
        let state = jobs
            .get(job)
            .cloned()
            .ok_or_else(|| WarehouseError::UnknownJob(job.clone()))?;
        if state.is_terminal() {
            jobs.remove(job);
        }
        Ok(state)
    }

    async fn scan(&self, name: &TableName) -> Result<Vec<TypedRecord>, WarehouseError> {
        let entry = self
            .inner
            .catalog
            .lock()
            .await
            .tables
            .get(name.as_str())
            .cloned()
            .ok_or_else(|| WarehouseError::NotFound(name.clone()))?;

        let dir = self.inner.location_dir(&entry.location);
        let mut rows = Vec::new();
        for part in &entry.parts {
            let path = dir.join(&part.file);
            let bytes = fs::read(&path).await.map_err(io_error(&path))?;
            if sha256_hex(&bytes) != part.sha256 {
                return Err(WarehouseError::Catalog(format!(
                    "checksum mismatch for {}",
                    path.display()
                )));
            }
            decode_parquet(&entry.schema, Bytes::from(bytes), &mut rows)?;
        }
        Ok(rows)
    }

    async fn delete_table(&self, name: &TableName) -> Result<(), WarehouseError> {
        let mut catalog = self.inner.catalog.lock().await;
        let mut next = catalog.clone();
        let entry = next
            .tables
            .remove(name.as_str())
            .ok_or_else(|| WarehouseError::NotFound(name.clone()))?;
        self.inner.persist(&next).await?;
        *catalog = next;
        drop(catalog);
        self.inner.remove_location(&entry.location).await;
        Ok(())
    }

    async fn replace_table(&self, source: &TableName, target: &TableName) -> Result<(), WarehouseError> {
        let mut catalog = self.inner.catalog.lock().await;
        let mut next = catalog.clone();
        let entry = next
            .tables
            .remove(source.as_str())
            .ok_or_else(|| WarehouseError::NotFound(source.clone()))?;
        let previous = next.tables.insert(target.as_str().to_string(), entry);
        self.inner.persist(&next).await?;
        *catalog = next;
        drop(catalog);

        if let Some(previous) = previous {
            self.inner.remove_location(&previous.location).await;
        }
        Ok(())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Writes `bytes` to a uniquely named temp file next to `path`, then renames it into place.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), WarehouseError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await.map_err(io_error(parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_error(&temp_path))?;
    file.write_all(bytes).await.map_err(io_error(&temp_path))?;
    file.flush().await.map_err(io_error(&temp_path))?;
    file.sync_all().await.map_err(io_error(&temp_path))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_error(path)(err));
    }
    Ok(())
}

fn unix_epoch_date() -> NaiveDate {
    DateTime::<Utc>::UNIX_EPOCH.date_naive()
}

fn arrow_type(field_type: FieldType) -> DataType {
    match field_type {
        FieldType::String => DataType::Utf8,
        FieldType::Float => DataType::Float64,
        FieldType::Int64 => DataType::Int64,
        FieldType::Bool => DataType::Boolean,
        FieldType::Date => DataType::Date32,
        FieldType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
    }
}

pub fn arrow_schema_for(schema: &TargetSchema) -> Schema {
    Schema::new(
        schema
            .fields()
            .iter()
            .map(|f| ArrowField::new(&f.name, arrow_type(f.field_type), true))
            .collect::<Vec<_>>(),
    )
}

fn build_column(field: &FieldSpec, index: usize, rows: &[TypedRecord]) -> ArrayRef {
    let cells = rows.iter().map(|r| r.get(index).unwrap_or(&Value::Null));
    match field.field_type {
        FieldType::String => Arc::new(StringArray::from(
            cells
                .map(|v| match v {
                    Value::String(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        FieldType::Float => Arc::new(Float64Array::from(
            cells
                .map(|v| match v {
                    Value::Float(f) => Some(*f),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        FieldType::Int64 => Arc::new(Int64Array::from(
            cells
                .map(|v| match v {
                    Value::Int64(i) => Some(*i),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        FieldType::Bool => Arc::new(BooleanArray::from(
            cells
                .map(|v| match v {
                    Value::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        FieldType::Date => {
            let epoch = unix_epoch_date();
            Arc::new(Date32Array::from(
                cells
                    .map(|v| match v {
                        Value::Date(d) => Some((*d - epoch).num_days() as i32),
                        _ => None,
                    })
                    .collect::<Vec<_>>(),
            ))
        }
        FieldType::Timestamp => Arc::new(
            TimestampMicrosecondArray::from(
                cells
                    .map(|v| match v {
                        Value::Timestamp(ts) => Some(ts.timestamp_micros()),
                        _ => None,
                    })
                    .collect::<Vec<_>>(),
            )
            .with_timezone("UTC"),
        ),
    }
}

pub fn encode_parquet(schema: &TargetSchema, rows: &[TypedRecord]) -> Result<Vec<u8>, WarehouseError> {
    let arrow_schema = Arc::new(arrow_schema_for(schema));
    let columns = schema
        .fields()
        .iter()
        .enumerate()
        .map(|(idx, field)| build_column(field, idx, rows))
        .collect::<Vec<_>>();
    let batch = RecordBatch::try_new(arrow_schema.clone(), columns)?;

    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, arrow_schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(buffer)
}

fn decode_parquet(
    schema: &TargetSchema,
    bytes: Bytes,
    out: &mut Vec<TypedRecord>,
) -> Result<(), WarehouseError> {
    let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)?.build()?;
    for batch in reader {
        let batch = batch?;
        let batch_schema = batch.schema();
        let mut columns = Vec::with_capacity(schema.len());
        for field in schema.fields() {
            let idx = batch_schema.index_of(&field.name)?;
            columns.push(batch.column(idx).clone());
        }
        for row in 0..batch.num_rows() {
            let values = schema
                .fields()
                .iter()
                .zip(&columns)
                .map(|(field, column)| decode_cell(field, column.as_ref(), row))
                .collect::<Result<Vec<_>, _>>()?;
            out.push(TypedRecord::new(values));
        }
    }
    Ok(())
}

fn decode_cell(field: &FieldSpec, column: &dyn Array, row: usize) -> Result<Value, WarehouseError> {
    if column.is_null(row) {
        return Ok(Value::Null);
    }
    let mismatch = || {
        WarehouseError::Catalog(format!(
            "column {} is not stored as {}",
            field.name, field.field_type
        ))
    };
    let any = column.as_any();
    let value = match field.field_type {
        FieldType::String => Value::String(
            any.downcast_ref::<StringArray>()
                .ok_or_else(mismatch)?
                .value(row)
                .to_string(),
        ),
        FieldType::Float => Value::Float(any.downcast_ref::<Float64Array>().ok_or_else(mismatch)?.value(row)),
        FieldType::Int64 => Value::Int64(any.downcast_ref::<Int64Array>().ok_or_else(mismatch)?.value(row)),
        FieldType::Bool => Value::Bool(any.downcast_ref::<BooleanArray>().ok_or_else(mismatch)?.value(row)),
        FieldType::Date => {
            let days = any.downcast_ref::<Date32Array>().ok_or_else(mismatch)?.value(row);
            let date = unix_epoch_date()
                .checked_add_signed(chrono::Duration::days(i64::from(days)))
                .ok_or_else(mismatch)?;
            Value::Date(date)
        }
        FieldType::Timestamp => {
            let micros = any
                .downcast_ref::<TimestampMicrosecondArray>()
                .ok_or_else(mismatch)?
                .value(row);
            Value::Timestamp(DateTime::from_timestamp_micros(micros).ok_or_else(mismatch)?)
        }
    };
    Ok(value)
}
