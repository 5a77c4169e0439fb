//! Source adapters (paginated HTML tables, trend API, spreadsheet) and the
//! schema-driven normalizer.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use harvest_core::{
    DatasetDescriptor, FieldType, Identifier, RawRecord, SheetSpec, SourceKind, SourceSpec,
    StagingBatch, TargetSchema, TrendSpec, TypedRecord, Value,
};
use harvest_storage::{PageRequest, PageTransport};
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("missing credential `{0}`")]
    MissingCredential(String),
    #[error(transparent)]
    Sheet(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Scoped secret lookup handed to adapters that call keyed APIs.
pub trait CredentialProvider: Send + Sync {
    fn secret(&self, name: &str) -> Option<String>;
}

/// Reads secrets from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl CredentialProvider for EnvCredentials {
    fn secret(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    secrets: BTreeMap<String, String>,
}

impl StaticCredentials {
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), value.into());
        self
    }
}

impl CredentialProvider for StaticCredentials {
    fn secret(&self, name: &str) -> Option<String> {
        self.secrets.get(name).cloned()
    }
}

/// Why a per-identifier page sequence stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Termination {
    /// Empty page, zero-row table, or no table at all.
    EndOfData,
    /// Transport failure that outlived the transport's retries.
    TransientFailure(String),
    /// The page no longer looks like this source; the dataset must not be staged.
    FatalParseError(String),
    /// Precondition not met (e.g. too few sheet rows); nothing is staged.
    Skipped(String),
}

impl Termination {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Termination::FatalParseError(_))
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::EndOfData => f.write_str("end of data"),
            Termination::TransientFailure(msg) => write!(f, "transient failure: {msg}"),
            Termination::FatalParseError(msg) => write!(f, "fatal parse error: {msg}"),
            Termination::Skipped(msg) => write!(f, "skipped: {msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageOutcome {
    Batch(StagingBatch),
    Terminated(Termination),
}

/// Everything fetched for one identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierHarvest {
    pub identifier: Identifier,
    pub batches: Vec<StagingBatch>,
    pub termination: Termination,
}

impl IdentifierHarvest {
    pub fn pages(&self) -> usize {
        self.batches.len()
    }

    pub fn rows(&self) -> usize {
        self.batches.iter().map(StagingBatch::len).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl ParsedTable {
    pub fn into_records(self) -> Vec<RawRecord> {
        let headers: Vec<String> = self
            .headers
            .iter()
            .enumerate()
            .map(|(idx, h)| {
                if h.is_empty() {
                    format!("column_{idx}")
                } else {
                    h.clone()
                }
            })
            .collect();
        self.rows
            .into_iter()
            .map(|cells| {
                let mut record = RawRecord::new();
                for (header, cell) in headers.iter().zip(cells) {
                    record.entry(header.clone()).or_insert(cell);
                }
                record
            })
            .collect()
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn cell_text(cell: ElementRef<'_>) -> String {
    cell.text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parses the first `<table>` of a document. A header row is a row made only of
/// `<th>` cells; without one, the first row supplies the column names.
pub fn parse_first_table(html: &str) -> Result<Option<ParsedTable>, AdapterError> {
    let document = Html::parse_document(html);
    let table_sel = selector("table")?;
    let row_sel = selector("tr")?;
    let cell_sel = selector("th, td")?;
    let td_sel = selector("td")?;

    let Some(table) = document.select(&table_sel).next() else {
        return Ok(None);
    };

    let mut headers: Vec<String> = Vec::new();
    let mut rows = Vec::new();
    for tr in table.select(&row_sel) {
        let cells: Vec<String> = tr.select(&cell_sel).map(cell_text).collect();
        if cells.is_empty() {
            continue;
        }
        let header_only = tr.select(&td_sel).next().is_none();
        if headers.is_empty() && (header_only || rows.is_empty()) {
            headers = cells;
            continue;
        }
        rows.push(cells);
    }
    Ok(Some(ParsedTable { headers, rows }))
}

/// Lazy, finite, non-restartable page sequence for one identifier.
///
/// Offsets start at 0 and advance by `page_size` after each retrieved page.
/// Nothing fetch-related escapes: the first non-batch outcome ends the
/// sequence and is kept in [`PageCursor::termination`].
pub struct PageCursor {
    transport: Arc<dyn PageTransport>,
    source_id: String,
    spec: Arc<SourceSpec>,
    identifier: Identifier,
    offset: usize,
    termination: Option<Termination>,
}

impl PageCursor {
    pub fn new(
        transport: Arc<dyn PageTransport>,
        source_id: impl Into<String>,
        spec: Arc<SourceSpec>,
        identifier: Identifier,
    ) -> Self {
        Self {
            transport,
            source_id: source_id.into(),
            spec,
            identifier,
            offset: 0,
            termination: None,
        }
    }

    pub fn termination(&self) -> Option<&Termination> {
        self.termination.as_ref()
    }

    pub fn next_offset(&self) -> usize {
        self.offset
    }

    pub async fn next_batch(&mut self) -> Option<StagingBatch> {
        if self.termination.is_some() {
            return None;
        }
        match self.fetch_page().await {
            PageOutcome::Batch(batch) => {
                debug!(
                    identifier = %self.identifier,
                    offset = self.offset,
                    rows = batch.len(),
                    "page retrieved"
                );
                self.offset += self.spec.page_size;
                Some(batch)
            }
            PageOutcome::Terminated(termination) => {
                match &termination {
                    Termination::EndOfData => {
                        info!(identifier = %self.identifier, offset = self.offset, "no more pages")
                    }
                    other => {
                        warn!(identifier = %self.identifier, offset = self.offset, reason = %other, "pagination stopped")
                    }
                }
                self.termination = Some(termination);
                None
            }
        }
    }

    pub async fn fetch_page(&self) -> PageOutcome {
        let url = self.spec.page_url(&self.identifier, self.offset);
        info!(source_id = %self.source_id, %url, "fetching page");
        let request = PageRequest::new(self.source_id.clone(), url)
            .accept_invalid_certs(self.spec.accept_invalid_certs);

        let response = match self.transport.get(&request).await {
            Ok(response) => response,
            Err(err) => return PageOutcome::Terminated(Termination::TransientFailure(err.to_string())),
        };
        let text = response.text();
        let table = match parse_first_table(&text) {
            Ok(Some(table)) => table,
            Ok(None) => return PageOutcome::Terminated(Termination::EndOfData),
            Err(err) => return PageOutcome::Terminated(Termination::FatalParseError(err.to_string())),
        };
        if table.rows.is_empty() {
            return PageOutcome::Terminated(Termination::EndOfData);
        }
        if let Some(missing) = missing_hinted_column(&self.spec, &table.headers) {
            return PageOutcome::Terminated(Termination::FatalParseError(format!(
                "expected column `{missing}` not found in page header"
            )));
        }
        PageOutcome::Batch(StagingBatch::new(
            self.identifier.clone(),
            self.offset,
            table.into_records(),
        ))
    }

    /// Drains the cursor.
    pub async fn collect(mut self) -> IdentifierHarvest {
        let mut batches = Vec::new();
        while let Some(batch) = self.next_batch().await {
            batches.push(batch);
        }
        IdentifierHarvest {
            identifier: self.identifier,
            batches,
            termination: self.termination.unwrap_or(Termination::EndOfData),
        }
    }
}

fn missing_hinted_column<'a>(spec: &'a SourceSpec, headers: &[String]) -> Option<&'a str> {
    let present: BTreeSet<String> = headers.iter().map(|h| canonical_column_name(h)).collect();
    spec.raw_schema_hint
        .keys()
        .find(|hint| !present.contains(&canonical_column_name(hint)))
        .map(String::as_str)
}

/// `fetch(source, identifier)`: a cursor over the identifier's pages.
pub fn fetch(
    transport: Arc<dyn PageTransport>,
    source_id: &str,
    spec: Arc<SourceSpec>,
    identifier: Identifier,
) -> PageCursor {
    PageCursor::new(transport, source_id, spec, identifier)
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Identifiers in declared fetch order.
    fn identifiers(&self) -> Vec<Identifier>;

    async fn harvest(&self, identifier: &Identifier) -> IdentifierHarvest;

    /// Called once the dataset's rows are durably committed to the warehouse.
    async fn commit(&self, _rows_consumed: usize) -> Result<(), AdapterError> {
        Ok(())
    }
}

pub struct PaginatedTableAdapter {
    transport: Arc<dyn PageTransport>,
    source_id: String,
    spec: Arc<SourceSpec>,
}

impl PaginatedTableAdapter {
    pub fn new(transport: Arc<dyn PageTransport>, source_id: impl Into<String>, spec: SourceSpec) -> Self {
        Self {
            transport,
            source_id: source_id.into(),
            spec: Arc::new(spec),
        }
    }
}

#[async_trait]
impl SourceAdapter for PaginatedTableAdapter {
    fn kind(&self) -> &'static str {
        "paginated"
    }

    fn identifiers(&self) -> Vec<Identifier> {
        self.spec.identifiers.clone()
    }

    async fn harvest(&self, identifier: &Identifier) -> IdentifierHarvest {
        fetch(
            Arc::clone(&self.transport),
            &self.source_id,
            Arc::clone(&self.spec),
            identifier.clone(),
        )
        .collect()
        .await
    }
}

/// Keyed trend-search API. One request per region identifier; nested lists are
/// flattened into `", "`-joined strings and link fields are dropped.
pub struct TrendAdapter {
    transport: Arc<dyn PageTransport>,
    source_id: String,
    spec: TrendSpec,
    api_key: String,
}

impl TrendAdapter {
    pub fn new(
        transport: Arc<dyn PageTransport>,
        source_id: impl Into<String>,
        spec: TrendSpec,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            source_id: source_id.into(),
            spec,
            api_key: api_key.into(),
        }
    }
}

fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

fn join_names(items: Option<&JsonValue>, name_key: Option<&str>) -> String {
    items
        .and_then(JsonValue::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|item| match name_key {
                    Some(key) => item.get(key).and_then(json_text),
                    None => json_text(item),
                })
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default()
}

/// Flattens a trend-search response into raw records.
pub fn flatten_trending(body: &JsonValue) -> Result<Vec<RawRecord>, String> {
    if let Some(error) = body.get("error").and_then(JsonValue::as_str) {
        return Err(format!("api error: {error}"));
    }
    let searches = body
        .get("trending_searches")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| "response has no `trending_searches` list".to_string())?;

    let mut records = Vec::with_capacity(searches.len());
    for search in searches {
        let mut record = RawRecord::new();
        let text = |key: &str| search.get(key).and_then(json_text);
        if let Some(query) = text("query") {
            record.insert("query".to_string(), query);
        }
        if let Some(start) = text("start_timestamp") {
            record.insert("start_date".to_string(), start);
        }
        if let Some(end) = text("end_timestamp") {
            record.insert("end_date".to_string(), end);
        }
        record.insert("active".to_string(), text("active").unwrap_or_else(|| "false".to_string()));
        if let Some(volume) = text("search_volume") {
            record.insert("search_volume".to_string(), volume);
        }
        if let Some(increase) = text("increase_percentage") {
            record.insert("increase_percentage".to_string(), increase);
        }
        record.insert(
            "categories".to_string(),
            join_names(search.get("categories"), Some("name")),
        );
        record.insert(
            "trend_breakdown".to_string(),
            join_names(search.get("trend_breakdown"), None),
        );
        records.push(record);
    }
    Ok(records)
}

#[async_trait]
impl SourceAdapter for TrendAdapter {
    fn kind(&self) -> &'static str {
        "trend"
    }

    fn identifiers(&self) -> Vec<Identifier> {
        self.spec.identifiers.clone()
    }

    async fn harvest(&self, identifier: &Identifier) -> IdentifierHarvest {
        let done = |batches: Vec<StagingBatch>, termination: Termination| IdentifierHarvest {
            identifier: identifier.clone(),
            batches,
            termination,
        };
        let request = PageRequest::new(self.source_id.clone(), self.spec.endpoint.clone())
            .with_query("engine", self.spec.engine.clone())
            .with_query("geo", identifier.to_string())
            .with_query("api_key", self.api_key.clone());
        info!(source_id = %self.source_id, geo = %identifier, "fetching trending searches");

        let response = match self.transport.get(&request).await {
            Ok(response) => response,
            Err(err) => {
                warn!(geo = %identifier, error = %err, "trend request failed");
                return done(Vec::new(), Termination::TransientFailure(err.to_string()));
            }
        };
        let parsed: Result<JsonValue, String> = serde_json::from_slice(&response.body)
            .map_err(|e| format!("invalid json: {e}"));
        match parsed.and_then(|body| flatten_trending(&body)) {
            Ok(records) if records.is_empty() => done(Vec::new(), Termination::EndOfData),
            Ok(records) => done(
                vec![StagingBatch::new(identifier.clone(), 0, records)],
                Termination::EndOfData,
            ),
            Err(msg) => {
                warn!(geo = %identifier, reason = %msg, "trend response rejected");
                done(Vec::new(), Termination::FatalParseError(msg))
            }
        }
    }
}

/// Row-range access to a spreadsheet.
pub trait SheetStore: Send + Sync {
    fn read_rows(&self, limit: Option<usize>) -> Result<Vec<RawRecord>, AdapterError>;

    /// Removes the first `count` data rows; returns how many were removed.
    fn delete_leading_rows(&self, count: usize) -> Result<usize, AdapterError>;
}

/// CSV file standing in for a spreadsheet: a header row followed by data rows.
#[derive(Debug, Clone)]
pub struct CsvSheet {
    path: PathBuf,
}

impl CsvSheet {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SheetStore for CsvSheet {
    fn read_rows(&self, limit: Option<usize>) -> Result<Vec<RawRecord>, AdapterError> {
        let mut reader = csv::Reader::from_path(&self.path)?;
        let headers = reader.headers()?.clone();
        let mut rows: Vec<RawRecord> = Vec::new();
        for result in reader.records() {
            if limit.is_some_and(|limit| rows.len() >= limit) {
                break;
            }
            let record = result?;
            rows.push(
                headers
                    .iter()
                    .zip(record.iter())
                    .map(|(h, v)| (h.to_string(), v.to_string()))
                    .collect(),
            );
        }
        Ok(rows)
    }

    fn delete_leading_rows(&self, count: usize) -> Result<usize, AdapterError> {
        let mut reader = csv::Reader::from_path(&self.path)?;
        let headers = reader.headers()?.clone();
        let records = reader.records().collect::<Result<Vec<_>, _>>()?;
        let removed = count.min(records.len());

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let temp_path = parent.join(format!(".{}.csv.tmp", Uuid::new_v4()));
        {
            let mut writer = csv::Writer::from_path(&temp_path)?;
            writer.write_record(&headers)?;
            for record in records.iter().skip(removed) {
                writer.write_record(record)?;
            }
            writer.flush()?;
        }
        if let Err(err) = fs::rename(&temp_path, &self.path) {
            let _ = fs::remove_file(&temp_path);
            return Err(err.into());
        }
        Ok(removed)
    }
}

/// Spreadsheet source. Requires more than `min_rows` data rows; consumed rows
/// are deleted only from [`SourceAdapter::commit`].
pub struct SheetAdapter {
    store: Box<dyn SheetStore>,
    spec: SheetSpec,
}

impl SheetAdapter {
    pub fn new(store: Box<dyn SheetStore>, spec: SheetSpec) -> Self {
        Self { store, spec }
    }

    fn identifier(&self) -> Identifier {
        let name = self
            .spec
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "sheet".to_string());
        Identifier::Text(name)
    }
}

#[async_trait]
impl SourceAdapter for SheetAdapter {
    fn kind(&self) -> &'static str {
        "sheet"
    }

    fn identifiers(&self) -> Vec<Identifier> {
        vec![self.identifier()]
    }

    async fn harvest(&self, identifier: &Identifier) -> IdentifierHarvest {
        let done = |batches: Vec<StagingBatch>, termination: Termination| IdentifierHarvest {
            identifier: identifier.clone(),
            batches,
            termination,
        };
        let rows = match self.store.read_rows(self.spec.row_limit) {
            Ok(rows) => rows,
            Err(err) => return done(Vec::new(), Termination::TransientFailure(err.to_string())),
        };
        if rows.len() <= self.spec.min_rows {
            info!(rows = rows.len(), min_rows = self.spec.min_rows, "sheet below threshold");
            return done(
                Vec::new(),
                Termination::Skipped(format!(
                    "sheet has {} data rows, needs more than {}",
                    rows.len(),
                    self.spec.min_rows
                )),
            );
        }
        done(
            vec![StagingBatch::new(identifier.clone(), 0, rows)],
            Termination::EndOfData,
        )
    }

    async fn commit(&self, rows_consumed: usize) -> Result<(), AdapterError> {
        let removed = self.store.delete_leading_rows(rows_consumed)?;
        info!(removed, "deleted consumed sheet rows");
        Ok(())
    }
}

/// Builds the adapter for a dataset's source.
pub fn adapter_for_dataset(
    descriptor: &DatasetDescriptor,
    transport: Arc<dyn PageTransport>,
    credentials: &dyn CredentialProvider,
) -> Result<Arc<dyn SourceAdapter>, AdapterError> {
    let adapter: Arc<dyn SourceAdapter> = match &descriptor.source {
        SourceKind::Paginated(spec) => Arc::new(PaginatedTableAdapter::new(
            transport,
            descriptor.dataset_id.clone(),
            spec.clone(),
        )),
        SourceKind::Trend(spec) => {
            let api_key = credentials
                .secret(&spec.api_key_name)
                .ok_or_else(|| AdapterError::MissingCredential(spec.api_key_name.clone()))?;
            Arc::new(TrendAdapter::new(
                transport,
                descriptor.dataset_id.clone(),
                spec.clone(),
                api_key,
            ))
        }
        SourceKind::Sheet(spec) => Arc::new(SheetAdapter::new(
            Box::new(CsvSheet::new(spec.path.clone())),
            spec.clone(),
        )),
    };
    Ok(adapter)
}

/// Lowercases and collapses every run of non-alphanumeric characters into one `_`.
pub fn canonical_column_name(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// First decimal-number substring of `text`, ignoring surrounding units or
/// labels. Commas between digits are read as thousands separators.
pub fn extract_number(text: &str) -> Option<f64> {
    let chars: Vec<char> = text.chars().collect();
    let digit_at = |i: usize| chars.get(i).is_some_and(|c| c.is_ascii_digit());

    let mut i = 0;
    while i < chars.len() {
        let starts_number = digit_at(i) || (chars[i] == '.' && digit_at(i + 1));
        if !starts_number {
            i += 1;
            continue;
        }
        // A minus counts as a sign only when it is not joining two words.
        let negative = i >= 1
            && chars[i - 1] == '-'
            && (i < 2 || !chars[i - 2].is_alphanumeric());
        let mut current = String::new();
        if negative {
            current.push('-');
        }
        let mut seen_dot = false;
        while i < chars.len() {
            let ch = chars[i];
            if ch.is_ascii_digit() {
                current.push(ch);
            } else if ch == '.' && !seen_dot && digit_at(i + 1) {
                current.push('.');
                seen_dot = true;
            } else if ch == ',' && !seen_dot && i >= 1 && digit_at(i - 1) && digit_at(i + 1) {
                // thousands separator
            } else {
                break;
            }
            i += 1;
        }
        return current.parse::<f64>().ok();
    }
    None
}

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%Y/%m/%d", "%b %d, %Y", "%B %d, %Y", "%d %b %Y", "%d %B %Y",
];

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M", "%d/%m/%Y %H:%M:%S"];

pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(secs) = text.parse::<i64>() {
        return DateTime::from_timestamp(secs, 0);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    parse_date_only(text).and_then(|d| d.and_hms_opt(0, 0, 0)).map(|naive| naive.and_utc())
}

fn parse_date_only(text: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    parse_date_only(text).or_else(|| parse_timestamp(text).map(|ts| ts.date_naive()))
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" | "" => Some(false),
        _ => None,
    }
}

/// Coerces one raw field. Never fails: unparseable input becomes `Value::Null`.
pub fn coerce(raw: Option<&str>, field_type: FieldType) -> Value {
    let Some(raw) = raw else {
        return match field_type {
            FieldType::Bool => Value::Bool(false),
            _ => Value::Null,
        };
    };
    let coerced = match field_type {
        FieldType::String => {
            let trimmed = raw.trim();
            (!trimmed.is_empty()).then(|| Value::String(trimmed.to_string()))
        }
        FieldType::Float => extract_number(raw).map(Value::Float),
        FieldType::Int64 => extract_number(raw)
            .filter(|n| n.is_finite())
            .map(|n| Value::Int64(n.trunc() as i64)),
        FieldType::Bool => parse_bool(raw).map(Value::Bool),
        FieldType::Date => parse_date(raw).map(Value::Date),
        FieldType::Timestamp => parse_timestamp(raw).map(Value::Timestamp),
    };
    coerced.unwrap_or(Value::Null)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NormalizeStats {
    pub rows_in: usize,
    pub rows_out: usize,
    /// Non-empty raw values that could not be coerced.
    pub nulled_fields: usize,
    pub dropped_columns: BTreeSet<String>,
}

/// `normalize(batch, schema)`: canonical names, typed values, unknown columns dropped.
pub fn normalize(
    batch: &StagingBatch,
    schema: &TargetSchema,
    aliases: &BTreeMap<String, String>,
) -> Vec<TypedRecord> {
    let mut stats = NormalizeStats::default();
    normalize_with_stats(batch, schema, aliases, &mut stats)
}

pub fn normalize_with_stats(
    batch: &StagingBatch,
    schema: &TargetSchema,
    aliases: &BTreeMap<String, String>,
    stats: &mut NormalizeStats,
) -> Vec<TypedRecord> {
    let mut out = Vec::with_capacity(batch.len());
    for raw in &batch.records {
        let mut canonical: BTreeMap<String, &str> = BTreeMap::new();
        for (column, value) in raw {
            let name = canonical_column_name(column);
            let name = aliases.get(&name).cloned().unwrap_or(name);
            if schema.index_of(&name).is_none() {
                stats.dropped_columns.insert(name);
                continue;
            }
            canonical.entry(name).or_insert(value.as_str());
        }

        let values = schema
            .fields()
            .iter()
            .map(|field| {
                let raw_value = canonical.get(field.name.as_str()).copied();
                let value = coerce(raw_value, field.field_type);
                if value.is_null() && raw_value.is_some_and(|v| !v.trim().is_empty()) {
                    stats.nulled_fields += 1;
                }
                value
            })
            .collect();
        out.push(TypedRecord::new(values));
    }
    stats.rows_in += batch.len();
    stats.rows_out += out.len();
    out
}
