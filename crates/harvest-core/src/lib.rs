//! Core dataset model shared by the harvest crates.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "harvest-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("invalid table name `{0}`")]
    InvalidTableName(String),
    #[error("unknown field type `{0}`")]
    UnknownFieldType(String),
    #[error("duplicate field `{0}` in target schema")]
    DuplicateField(String),
    #[error("dedupe key field `{0}` is not part of the target schema")]
    UnknownKeyField(String),
    #[error("dataset `{dataset_id}`: {reason}")]
    InvalidDescriptor { dataset_id: String, reason: String },
}

/// Per-source identifier, e.g. a commodity code or a region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identifier {
    Int(i64),
    Text(String),
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Int(v) => write!(f, "{v}"),
            Identifier::Text(v) => f.write_str(v),
        }
    }
}

/// Static description of one paginated ingestion source.
///
/// `endpoint_template` carries the `{offset}`, `{id}` and `{page_size}`
/// placeholders. Offset zero renders to an empty segment, any other offset to
/// `/<offset>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub endpoint_template: String,
    pub page_size: usize,
    pub identifiers: Vec<Identifier>,
    #[serde(default)]
    pub raw_schema_hint: BTreeMap<String, String>,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl SourceSpec {
    pub fn page_url(&self, identifier: &Identifier, offset: usize) -> String {
        let offset_segment = if offset == 0 {
            String::new()
        } else {
            format!("/{offset}")
        };
        self.endpoint_template
            .replace("{offset}", &offset_segment)
            .replace("{id}", &identifier.to_string())
            .replace("{page_size}", &self.page_size.to_string())
    }
}

/// Keyed trend-search source; one request per identifier (region code).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendSpec {
    pub endpoint: String,
    pub engine: String,
    pub identifiers: Vec<Identifier>,
    #[serde(default = "default_api_key_name")]
    pub api_key_name: String,
}

fn default_api_key_name() -> String {
    "SERPAPI_KEY".to_string()
}

/// Spreadsheet-backed source. Rows are consumed destructively, but only after
/// the warehouse commit succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetSpec {
    pub path: PathBuf,
    #[serde(default)]
    pub row_limit: Option<usize>,
    #[serde(default = "default_min_rows")]
    pub min_rows: usize,
}

fn default_min_rows() -> usize {
    30
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    Paginated(SourceSpec),
    Trend(TrendSpec),
    Sheet(SheetSpec),
}

impl SourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::Paginated(_) => "paginated",
            SourceKind::Trend(_) => "trend",
            SourceKind::Sheet(_) => "sheet",
        }
    }
}

/// Mapping from raw column name (as the source returned it) to untyped text.
pub type RawRecord = BTreeMap<String, String>;

/// Raw rows of one fetched page plus their provenance. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingBatch {
    pub source_identifier: Identifier,
    pub page_offset: usize,
    pub records: Vec<RawRecord>,
}

impl StagingBatch {
    pub fn new(source_identifier: Identifier, page_offset: usize, records: Vec<RawRecord>) -> Self {
        Self {
            source_identifier,
            page_offset,
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    String,
    #[serde(alias = "FLOAT64")]
    Float,
    #[serde(alias = "INTEGER")]
    Int64,
    #[serde(alias = "BOOLEAN")]
    Bool,
    Date,
    Timestamp,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "STRING",
            FieldType::Float => "FLOAT",
            FieldType::Int64 => "INT64",
            FieldType::Bool => "BOOL",
            FieldType::Date => "DATE",
            FieldType::Timestamp => "TIMESTAMP",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STRING" => Ok(FieldType::String),
            "FLOAT" | "FLOAT64" => Ok(FieldType::Float),
            "INT64" | "INTEGER" => Ok(FieldType::Int64),
            "BOOL" | "BOOLEAN" => Ok(FieldType::Bool),
            "DATE" => Ok(FieldType::Date),
            "TIMESTAMP" => Ok(FieldType::Timestamp),
            _ => Err(CoreError::UnknownFieldType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Ordered target schema of one dataset. Fixed once the warehouse table exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetSchema {
    fields: Vec<FieldSpec>,
}

impl TargetSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Result<Self, CoreError> {
        let schema = Self { fields };
        schema.validate()?;
        Ok(schema)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(CoreError::DuplicateField(field.name.clone()));
            }
        }
        Ok(())
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}

/// One typed cell of a normalized row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    String(String),
    Float(f64),
    Int64(i64),
    Bool(bool),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Value::Null => None,
            Value::String(_) => Some(FieldType::String),
            Value::Float(_) => Some(FieldType::Float),
            Value::Int64(_) => Some(FieldType::Int64),
            Value::Bool(_) => Some(FieldType::Bool),
            Value::Date(_) => Some(FieldType::Date),
            Value::Timestamp(_) => Some(FieldType::Timestamp),
        }
    }

    /// Hashable view used for key comparison. Null compares equal to null.
    pub fn key_part(&self) -> KeyPart {
        match self {
            Value::Null => KeyPart::Null,
            Value::String(s) => KeyPart::String(s.clone()),
            // -0.0 and 0.0 compare equal as values, so they share a key.
            Value::Float(f) if *f == 0.0 => KeyPart::FloatBits(0.0f64.to_bits()),
            Value::Float(f) => KeyPart::FloatBits(f.to_bits()),
            Value::Int64(i) => KeyPart::Int64(*i),
            Value::Bool(b) => KeyPart::Bool(*b),
            Value::Date(d) => KeyPart::Date(*d),
            Value::Timestamp(ts) => KeyPart::Timestamp(*ts),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::String(s) => f.write_str(s),
            Value::Float(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPart {
    Null,
    String(String),
    FloatBits(u64),
    Int64(i64),
    Bool(bool),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

/// A normalized row: one value per target-schema field, in schema order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedRecord {
    values: Vec<Value>,
}

impl TypedRecord {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn value_of<'a>(&'a self, schema: &TargetSchema, field: &str) -> Option<&'a Value> {
        schema.index_of(field).and_then(|idx| self.values.get(idx))
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// Declared subset of schema fields whose tuple must be unique in the final table.
///
/// An empty key means "the whole row".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupeKey(Vec<String>);

impl DedupeKey {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(fields.into_iter().map(Into::into).collect())
    }

    pub fn fields(&self) -> &[String] {
        &self.0
    }

    pub fn indices(&self, schema: &TargetSchema) -> Result<Vec<usize>, CoreError> {
        if self.0.is_empty() {
            return Ok((0..schema.len()).collect());
        }
        self.0
            .iter()
            .map(|name| {
                schema
                    .index_of(name)
                    .ok_or_else(|| CoreError::UnknownKeyField(name.clone()))
            })
            .collect()
    }

    pub fn tuple(indices: &[usize], record: &TypedRecord) -> Vec<KeyPart> {
        indices
            .iter()
            .map(|idx| record.get(*idx).map_or(KeyPart::Null, Value::key_part))
            .collect()
    }
}

/// Qualified warehouse table name, `project.dataset.table` with one to three
/// segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName(String);

impl TableName {
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let trimmed = input.trim();
        let segments: Vec<&str> = trimmed.split('.').collect();
        let valid_segment = |s: &&str| {
            !s.is_empty()
                && s
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        };
        if segments.len() > 3 || !segments.iter().all(valid_segment) {
            return Err(CoreError::InvalidTableName(input.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last segment of the qualified name.
    pub fn table(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }

    /// Sibling name in the same dataset with `suffix` appended to the table segment.
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self(format!("{}{}", self.0, suffix))
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TableName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TableName {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TableName> for String {
    fn from(value: TableName) -> Self {
        value.0
    }
}

/// Declarative `{source, schema, dedupe key}` description of one dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub dataset_id: String,
    /// Disabled datasets only run when named explicitly.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub source: SourceKind,
    /// Staging table that fetched rows are appended to.
    pub table: TableName,
    /// Table the reconciled rows are published under; defaults to `table`.
    #[serde(default)]
    pub final_table: Option<TableName>,
    pub schema: TargetSchema,
    #[serde(default)]
    pub dedupe_key: DedupeKey,
    /// Canonical raw column name -> target field name.
    #[serde(default)]
    pub column_aliases: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

impl DatasetDescriptor {
    pub fn final_table(&self) -> &TableName {
        self.final_table.as_ref().unwrap_or(&self.table)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let invalid = |reason: String| CoreError::InvalidDescriptor {
            dataset_id: self.dataset_id.clone(),
            reason,
        };
        if self.schema.is_empty() {
            return Err(invalid("target schema has no fields".to_string()));
        }
        self.schema.validate().map_err(|e| invalid(e.to_string()))?;
        self.dedupe_key
            .indices(&self.schema)
            .map_err(|e| invalid(e.to_string()))?;
        match &self.source {
            SourceKind::Paginated(spec) => {
                if spec.page_size == 0 {
                    return Err(invalid("page_size must be positive".to_string()));
                }
                if spec.identifiers.is_empty() {
                    return Err(invalid("no identifiers declared".to_string()));
                }
            }
            SourceKind::Trend(spec) => {
                if spec.identifiers.is_empty() {
                    return Err(invalid("no identifiers declared".to_string()));
                }
            }
            SourceKind::Sheet(_) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market_spec() -> SourceSpec {
        SourceSpec {
            endpoint_template: "https://example.test/site/market{offset}?product={id}&per_page={page_size}"
                .to_string(),
            page_size: 3000,
            identifiers: vec![Identifier::Int(1), Identifier::Int(2)],
            raw_schema_hint: BTreeMap::new(),
            accept_invalid_certs: true,
        }
    }

    #[test]
    fn first_page_url_omits_offset_segment() {
        let spec = market_spec();
        assert_eq!(
            spec.page_url(&Identifier::Int(1), 0),
            "https://example.test/site/market?product=1&per_page=3000"
        );
        assert_eq!(
            spec.page_url(&Identifier::Int(1), 3000),
            "https://example.test/site/market/3000?product=1&per_page=3000"
        );
    }

    #[test]
    fn descriptor_parses_from_yaml_and_validates() {
        let yaml = r#"
dataset_id: market_prices
source:
  kind: paginated
  endpoint_template: "https://example.test/market{offset}?product={id}&per_page={page_size}"
  page_size: 3000
  identifiers: [1, 2, "beans"]
  accept_invalid_certs: true
table: proj.storage.market_prices_staging
final_table: proj.storage.market_prices
schema:
  - { name: commodity, type: STRING }
  - { name: wholesale, type: FLOAT }
  - { name: date, type: DATE }
dedupe_key: [commodity, date]
"#;
        let descriptor: DatasetDescriptor = serde_yaml::from_str(yaml).unwrap();
        descriptor.validate().unwrap();
        assert_eq!(descriptor.final_table().as_str(), "proj.storage.market_prices");
        assert_eq!(descriptor.schema.fields()[1].field_type, FieldType::Float);
        match &descriptor.source {
            SourceKind::Paginated(spec) => {
                assert_eq!(spec.identifiers[2], Identifier::Text("beans".to_string()));
            }
            other => panic!("unexpected source {other:?}"),
        }
    }

    #[test]
    fn dedupe_key_must_reference_schema_fields() {
        let schema = TargetSchema::new(vec![FieldSpec::new("name", FieldType::String)]).unwrap();
        let key = DedupeKey::new(["name", "missing"]);
        assert_eq!(
            key.indices(&schema),
            Err(CoreError::UnknownKeyField("missing".to_string()))
        );
        assert_eq!(DedupeKey::default().indices(&schema).unwrap(), vec![0]);
    }

    #[test]
    fn null_key_parts_compare_equal() {
        let a = TypedRecord::new(vec![Value::Null, Value::Float(-0.0)]);
        let b = TypedRecord::new(vec![Value::Null, Value::Float(0.0)]);
        assert_eq!(DedupeKey::tuple(&[0, 1], &a), DedupeKey::tuple(&[0, 1], &b));
    }

    #[test]
    fn table_names_are_validated() {
        assert!(TableName::parse("proj.storage.prices").is_ok());
        assert!(TableName::parse("prices").is_ok());
        assert!(TableName::parse("a.b.c.d").is_err());
        assert!(TableName::parse("proj..prices").is_err());
        assert!(TableName::parse("proj.sto rage.prices").is_err());
        let name = TableName::parse("proj.storage.prices").unwrap();
        assert_eq!(name.table(), "prices");
        assert_eq!(name.with_suffix("__tmp").as_str(), "proj.storage.prices__tmp");
    }

    #[test]
    fn schema_rejects_duplicate_fields() {
        let err = TargetSchema::new(vec![
            FieldSpec::new("a", FieldType::String),
            FieldSpec::new("a", FieldType::Int64),
        ])
        .unwrap_err();
        assert_eq!(err, CoreError::DuplicateField("a".to_string()));
    }
}
