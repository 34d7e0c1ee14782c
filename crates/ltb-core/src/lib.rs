//! Core domain model shared by the warehouse and labeling sides of the bridge.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "ltb-core";

/// Separator between a field name and an option name inside a name-key.
pub const DEFAULT_DIVIDER: &str = "///";

/// Longest global key the labeling service accepts.
pub const MAX_GLOBAL_KEY_LEN: usize = 200;

/// Provenance field tagging every record created through the bridge.
pub const INTEGRATION_SOURCE_FIELD: &str = "lb_integration_source";

/// Characters the warehouse cannot carry in column names, with their escapes.
pub const SANITIZED_CHARACTERS: [(char, &str); 5] = [
    ('&', "_ascii_38_"),
    ('%', "_ascii_37_"),
    ('>', "_ascii_62_"),
    ('#', "_ascii_35_"),
    ('|', "_ascii_124_"),
];

/// Input problems detected before any remote call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("divider must not be empty")]
    EmptyDivider,
    #[error("divider {divider:?} contains reserved character {character:?}")]
    DividerCharacter { divider: String, character: char },
    #[error("unknown metadata kind {0:?}; expected one of string, number, datetime, enum")]
    UnknownMetadataKind(String),
    #[error("unknown attachment kind {0:?}; expected one of IMAGE, VIDEO, RAW_TEXT, HTML, TEXT_URL")]
    UnknownAttachmentKind(String),
    #[error("metadata index must not name the reserved field {0}")]
    ReservedField(String),
    #[error("metadata index maps more than one field onto column {0}")]
    DuplicateIndexEntry(String),
    #[error("invalid table id {0:?}; expected project.dataset.table")]
    InvalidTableId(String),
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
    #[error("unknown duplicate policy {0:?}; expected skip or rename")]
    UnknownDuplicatePolicy(String),
}

/// A cell value that does not parse as its metadata kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("{0:?} is not a number")]
    NotANumber(String),
    #[error("{0:?} is not a recognised datetime")]
    NotADatetime(String),
}

/// The request does not fit the table it targets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("column {column} not found in table {table}")]
    MissingColumn { column: String, table: String },
    #[error("global key column {column} is not unique ({duplicates} repeated key(s))")]
    NonUniqueGlobalKey { column: String, duplicates: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum MetadataKind {
    String,
    Number,
    Datetime,
    Enum,
}

impl MetadataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataKind::String => "string",
            MetadataKind::Number => "number",
            MetadataKind::Datetime => "datetime",
            MetadataKind::Enum => "enum",
        }
    }

    /// Checks that a raw cell value parses as the kind. The value itself is
    /// uploaded as written.
    pub fn check_value(&self, raw: &str) -> Result<(), ValueError> {
        match self {
            MetadataKind::String | MetadataKind::Enum => Ok(()),
            MetadataKind::Number => raw
                .trim()
                .parse::<f64>()
                .map(|_| ())
                .map_err(|_| ValueError::NotANumber(raw.to_string())),
            MetadataKind::Datetime => parse_datetime(raw)
                .map(|_| ())
                .ok_or_else(|| ValueError::NotADatetime(raw.to_string())),
        }
    }
}

impl fmt::Display for MetadataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetadataKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "string" => Ok(MetadataKind::String),
            "number" => Ok(MetadataKind::Number),
            "datetime" => Ok(MetadataKind::Datetime),
            "enum" => Ok(MetadataKind::Enum),
            _ => Err(ConfigurationError::UnknownMetadataKind(s.to_string())),
        }
    }
}

impl TryFrom<String> for MetadataKind {
    type Error = ConfigurationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for pattern in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, pattern) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Kind of a remote metadata field; enum fields carry their option set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Datetime,
    Enum { options: BTreeSet<String> },
}

impl FieldKind {
    pub fn metadata_kind(&self) -> MetadataKind {
        match self {
            FieldKind::String => MetadataKind::String,
            FieldKind::Number => MetadataKind::Number,
            FieldKind::Datetime => MetadataKind::Datetime,
            FieldKind::Enum { .. } => MetadataKind::Enum,
        }
    }
}

/// Definition used to create a field in the remote ontology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataFieldSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
}

impl MetadataFieldSpec {
    /// Enum kinds get an empty option set.
    pub fn new(name: impl Into<String>, kind: MetadataKind) -> Self {
        let kind = match kind {
            MetadataKind::String => FieldKind::String,
            MetadataKind::Number => FieldKind::Number,
            MetadataKind::Datetime => FieldKind::Datetime,
            MetadataKind::Enum => FieldKind::Enum {
                options: BTreeSet::new(),
            },
        };
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn enumeration<I, S>(name: impl Into<String>, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            kind: FieldKind::Enum {
                options: options.into_iter().map(Into::into).collect(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataIndexEntry {
    pub field: String,
    pub kind: MetadataKind,
}

/// Ordered `field name -> kind` mapping naming the columns treated as metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataIndex {
    entries: Vec<MetadataIndexEntry>,
}

impl MetadataIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an entry, keeping the original position on replace.
    pub fn with(mut self, field: impl Into<String>, kind: MetadataKind) -> Self {
        self.insert(field, kind);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, kind: MetadataKind) {
        let field = field.into();
        match self.entries.iter_mut().find(|e| e.field == field) {
            Some(entry) => entry.kind = kind,
            None => self.entries.push(MetadataIndexEntry { field, kind }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetadataIndexEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn kind_of(&self, field: &str) -> Option<MetadataKind> {
        self.entries.iter().find(|e| e.field == field).map(|e| e.kind)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.kind_of(field).is_some()
    }

    /// Rejects the reserved provenance field and entries that collapse onto
    /// the same warehouse column.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let mut seen = BTreeSet::new();
        for entry in &self.entries {
            if entry.field == INTEGRATION_SOURCE_FIELD {
                return Err(ConfigurationError::ReservedField(entry.field.clone()));
            }
            let column = column_name_for(&entry.field).to_ascii_lowercase();
            if !seen.insert(column.clone()) {
                return Err(ConfigurationError::DuplicateIndexEntry(column));
            }
        }
        Ok(())
    }
}

impl<S: Into<String>> FromIterator<(S, MetadataKind)> for MetadataIndex {
    fn from_iter<T: IntoIterator<Item = (S, MetadataKind)>>(iter: T) -> Self {
        let mut index = MetadataIndex::new();
        for (field, kind) in iter {
            index.insert(field, kind);
        }
        index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", try_from = "String")]
pub enum AttachmentKind {
    Image,
    Video,
    RawText,
    Html,
    TextUrl,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "IMAGE",
            AttachmentKind::Video => "VIDEO",
            AttachmentKind::RawText => "RAW_TEXT",
            AttachmentKind::Html => "HTML",
            AttachmentKind::TextUrl => "TEXT_URL",
        }
    }
}

impl FromStr for AttachmentKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "IMAGE" => Ok(AttachmentKind::Image),
            "VIDEO" => Ok(AttachmentKind::Video),
            "RAW_TEXT" => Ok(AttachmentKind::RawText),
            "HTML" => Ok(AttachmentKind::Html),
            "TEXT_URL" => Ok(AttachmentKind::TextUrl),
            _ => Err(ConfigurationError::UnknownAttachmentKind(s.to_string())),
        }
    }
}

impl TryFrom<String> for AttachmentKind {
    type Error = ConfigurationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentIndexEntry {
    pub column: String,
    pub kind: AttachmentKind,
}

/// Ordered `column -> attachment kind` mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachmentIndex {
    entries: Vec<AttachmentIndexEntry>,
}

impl AttachmentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, kind: AttachmentKind) -> Self {
        self.entries.push(AttachmentIndexEntry {
            column: column.into(),
            kind,
        });
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttachmentIndexEntry> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Separator used to build `field<divider>option` name-keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Divider(String);

impl Divider {
    pub fn new(divider: impl Into<String>) -> Result<Self, ConfigurationError> {
        let divider = divider.into();
        if divider.is_empty() {
            return Err(ConfigurationError::EmptyDivider);
        }
        if let Some(character) = divider
            .chars()
            .find(|c| SANITIZED_CHARACTERS.iter().any(|(reserved, _)| reserved == c))
        {
            return Err(ConfigurationError::DividerCharacter { divider, character });
        }
        Ok(Self(divider))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn join(&self, field: &str, option: &str) -> String {
        format!("{field}{}{option}", self.0)
    }

    /// Splits a name-key into `(field, option)`; scalar name-keys yield `None`.
    pub fn split<'a>(&self, name_key: &'a str) -> Option<(&'a str, &'a str)> {
        name_key.split_once(self.0.as_str())
    }
}

impl Default for Divider {
    fn default() -> Self {
        Self(DEFAULT_DIVIDER.to_string())
    }
}

impl TryFrom<String> for Divider {
    type Error = ConfigurationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Divider::new(value)
    }
}

impl From<Divider> for String {
    fn from(value: Divider) -> Self {
        value.0
    }
}

/// Warehouse column name for a metadata field or a caller-supplied column.
pub fn column_name_for(name: &str) -> String {
    let mut column = name.split_whitespace().collect::<Vec<_>>().join("_");
    for (character, escape) in SANITIZED_CHARACTERS {
        column = column.replace(character, escape);
    }
    column
}

/// Column names compare case-insensitively after normalization.
pub fn columns_match(a: &str, b: &str) -> bool {
    column_name_for(a).eq_ignore_ascii_case(&column_name_for(b))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableId {
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

impl FromStr for TableId {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s.split('.').collect::<Vec<_>>();
        match parts.as_slice() {
            [project, dataset, table]
                if !project.is_empty() && !dataset.is_empty() && !table.is_empty() =>
            {
                Ok(TableId::new(*project, *dataset, *table))
            }
            _ => Err(ConfigurationError::InvalidTableId(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnType {
    String,
    Int64,
    Float64,
    Bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColumnMode {
    #[default]
    Nullable,
    Required,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    #[serde(default)]
    pub mode: ColumnMode,
}

impl Column {
    pub fn string(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: ColumnType::String,
            mode: ColumnMode::Nullable,
        }
    }

    pub fn required_string(name: impl Into<String>) -> Self {
        Self {
            mode: ColumnMode::Required,
            ..Self::string(name)
        }
    }
}

/// Schema and size of one warehouse table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseTable {
    pub id: TableId,
    pub columns: Vec<Column>,
    pub row_count: usize,
}

impl WarehouseTable {
    /// Finds a column by normalized, case-insensitive name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| columns_match(&c.name, name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

/// One warehouse row keyed by column name.
pub type Row = BTreeMap<String, JsonValue>;

/// Text form of a cell; `None` for SQL NULL.
pub fn cell_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Looks a column up in a row using the same matching rules as the table schema.
pub fn row_cell<'a>(row: &'a Row, column: &str) -> Option<&'a JsonValue> {
    row.get(column).or_else(|| {
        row.iter()
            .find(|(name, _)| columns_match(name, column))
            .map(|(_, value)| value)
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaOption {
    pub schema_id: String,
    pub name: String,
}

/// One field of the remote ontology as last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub schema_id: String,
    pub name: String,
    pub kind: MetadataKind,
    #[serde(default)]
    pub options: Vec<SchemaOption>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OntologySnapshot {
    pub fields: Vec<SchemaField>,
}

impl OntologySnapshot {
    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }
}

/// A metadata value addressed by remote schema id. For enum fields the
/// `schema_id` is the parent field and `value` is the option's schema id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataValue {
    pub schema_id: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: AttachmentKind,
    pub value: String,
}

/// Record shape handed to the labeling service for creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub row_data: String,
    pub global_key: String,
    pub external_id: Option<String>,
    #[serde(default)]
    pub metadata_fields: Vec<MetadataValue>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// A record as exported from a labeling dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub record_id: String,
    pub row_data: String,
    pub global_key: Option<String>,
    pub external_id: Option<String>,
    #[serde(default)]
    pub metadata_fields: Vec<MetadataValue>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub record_id: String,
    pub fields: Vec<MetadataValue>,
}

/// What to do with a global key that already belongs to a live record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    Skip,
    #[default]
    Rename,
}

impl FromStr for DuplicatePolicy {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(DuplicatePolicy::Skip),
            "rename" => Ok(DuplicatePolicy::Rename),
            _ => Err(ConfigurationError::UnknownDuplicatePolicy(s.to_string())),
        }
    }
}
