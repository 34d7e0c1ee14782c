use std::collections::{BTreeMap, BTreeSet};

use ltb_core::{
    cell_text, row_cell, Attachment, AttachmentIndex, MetadataIndex, MetadataValue, Row, TableId,
    UploadRecord, ValidationError, WarehouseTable, INTEGRATION_SOURCE_FIELD, MAX_GLOBAL_KEY_LEN,
};
use ltb_storage::{SelectQuery, Statement, Warehouse};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{ConversionError, SyncError};
use crate::translate::SchemaTranslation;

/// Column roles for turning warehouse rows into upload records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionSpec {
    pub row_data_col: String,
    pub global_key_col: Option<String>,
    pub external_id_col: Option<String>,
    pub metadata_index: MetadataIndex,
    pub attachment_index: AttachmentIndex,
}

impl ProjectionSpec {
    pub fn new(row_data_col: impl Into<String>) -> Self {
        Self {
            row_data_col: row_data_col.into(),
            global_key_col: None,
            external_id_col: None,
            metadata_index: MetadataIndex::new(),
            attachment_index: AttachmentIndex::new(),
        }
    }

    pub fn global_key(mut self, column: impl Into<String>) -> Self {
        self.global_key_col = Some(column.into());
        self
    }

    pub fn external_id(mut self, column: impl Into<String>) -> Self {
        self.external_id_col = Some(column.into());
        self
    }

    pub fn metadata(mut self, index: MetadataIndex) -> Self {
        self.metadata_index = index;
        self
    }

    pub fn attachments(mut self, index: AttachmentIndex) -> Self {
        self.attachment_index = index;
        self
    }

    /// Falls back to the row-data column.
    pub fn global_key_column(&self) -> &str {
        self.global_key_col.as_deref().unwrap_or(&self.row_data_col)
    }

    /// Falls back to the global-key column.
    pub fn external_id_column(&self) -> &str {
        self.external_id_col
            .as_deref()
            .unwrap_or_else(|| self.global_key_column())
    }

    fn role_columns(&self) -> Vec<&str> {
        let mut columns = vec![
            self.row_data_col.as_str(),
            self.global_key_column(),
            self.external_id_column(),
        ];
        columns.extend(self.attachment_index.iter().map(|e| e.column.as_str()));
        columns
    }

    /// Every column the projection reads, metadata included.
    pub fn referenced_columns(&self) -> Vec<&str> {
        let mut columns = self.role_columns();
        columns.extend(self.metadata_index.iter().map(|e| e.field.as_str()));
        columns
    }

    /// Checks the row-data, key, id and attachment columns. Metadata columns
    /// are left out because reconciliation may still have to create them.
    pub fn validate_roles(&self, table: &WarehouseTable) -> Result<(), ValidationError> {
        check_columns(table, self.role_columns())
    }

    pub fn validate_against(&self, table: &WarehouseTable) -> Result<(), ValidationError> {
        check_columns(table, self.referenced_columns())
    }

    /// Converts projected rows. Rows that cannot be converted are reported and
    /// left out; on repeated global keys the last row wins.
    pub fn convert_rows(
        &self,
        rows: &[Row],
        translation: &SchemaTranslation,
        integration_source: &str,
    ) -> Projection {
        let provenance = translation
            .schema_id(INTEGRATION_SOURCE_FIELD)
            .map(|schema_id| MetadataValue {
                schema_id: schema_id.to_string(),
                value: integration_source.to_string(),
            });

        let mut projection = Projection::default();
        let mut seen = BTreeSet::new();
        let mut repeated = BTreeSet::new();
        for (row_index, row) in rows.iter().enumerate() {
            let record = match self.convert_row(row, translation) {
                Ok(mut record) => {
                    record.metadata_fields.extend(provenance.clone());
                    record
                }
                Err((global_key, message)) => {
                    debug!(row_index, %message, "row not converted");
                    projection.conversion_errors.push(ConversionError {
                        row_index,
                        global_key,
                        message,
                    });
                    continue;
                }
            };
            if !seen.insert(record.global_key.clone()) {
                repeated.insert(record.global_key.clone());
            }
            projection.records.insert(record.global_key.clone(), record);
        }
        projection.duplicate_keys = repeated.into_iter().collect();
        projection
    }

    fn convert_row(
        &self,
        row: &Row,
        translation: &SchemaTranslation,
    ) -> Result<UploadRecord, (Option<String>, String)> {
        let text = |column: &str| row_cell(row, column).and_then(cell_text);

        let key_column = self.global_key_column();
        let mut global_key = text(key_column)
            .ok_or_else(|| (None::<String>, format!("global key column {key_column} is null")))?;
        let row_data = text(&self.row_data_col).ok_or_else(|| {
            (
                Some(global_key.clone()),
                format!("row data column {} is null", self.row_data_col),
            )
        })?;
        let external_id = text(self.external_id_column());

        if global_key.chars().count() > MAX_GLOBAL_KEY_LEN {
            let replacement = Uuid::new_v4().to_string();
            warn!(
                original_len = global_key.chars().count(),
                max_len = MAX_GLOBAL_KEY_LEN,
                replacement = %replacement,
                "global key too long; substituting a generated key"
            );
            global_key = replacement;
        }

        let mut metadata_fields = Vec::new();
        for entry in self.metadata_index.iter() {
            let Some(raw) = text(&entry.field) else {
                continue;
            };
            let schema_id = translation.schema_id(&entry.field).ok_or_else(|| {
                (
                    Some(global_key.clone()),
                    format!("metadata field {} is missing from the ontology", entry.field),
                )
            })?;
            entry.kind.check_value(&raw).map_err(|reason| {
                (
                    Some(global_key.clone()),
                    format!("metadata field {}: {reason}", entry.field),
                )
            })?;
            metadata_fields.push(MetadataValue {
                schema_id: schema_id.to_string(),
                value: translation.value_for_upload(&entry.field, &raw),
            });
        }

        let attachments = self
            .attachment_index
            .iter()
            .filter_map(|entry| {
                text(&entry.column).map(|value| Attachment {
                    kind: entry.kind,
                    value,
                })
            })
            .collect();

        Ok(UploadRecord {
            row_data,
            global_key,
            external_id,
            metadata_fields,
            attachments,
        })
    }
}

fn check_columns<'a>(
    table: &WarehouseTable,
    columns: impl IntoIterator<Item = &'a str>,
) -> Result<(), ValidationError> {
    match columns.into_iter().find(|column| !table.has_column(column)) {
        Some(column) => Err(ValidationError::MissingColumn {
            column: column.to_string(),
            table: table.id.to_string(),
        }),
        None => Ok(()),
    }
}

/// Upload records keyed by global key plus the rows that did not make it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Projection {
    pub records: BTreeMap<String, UploadRecord>,
    pub conversion_errors: Vec<ConversionError>,
    /// Global keys carried by more than one row.
    pub duplicate_keys: Vec<String>,
}

/// Runs one projection query over exactly the referenced columns and
/// converts the result.
pub async fn project_rows(
    warehouse: &dyn Warehouse,
    table_id: &TableId,
    spec: &ProjectionSpec,
    translation: &SchemaTranslation,
    config: &SyncConfig,
) -> Result<Projection, SyncError> {
    let table = warehouse.get_table(table_id).await?;
    spec.validate_against(&table)?;

    let columns = spec
        .referenced_columns()
        .into_iter()
        .filter_map(|name| table.column(name))
        .map(|column| column.name.clone())
        .collect::<Vec<_>>();
    let query = Statement::Select(SelectQuery::new(table_id.clone(), columns));
    let result = warehouse.run_query(&query).await?;

    let projection = spec.convert_rows(&result.rows, translation, &config.integration_source);
    if !projection.duplicate_keys.is_empty() {
        warn!(
            table = %table_id,
            column = spec.global_key_column(),
            duplicates = projection.duplicate_keys.len(),
            "global key column is not unique; keeping the last row per key"
        );
        if config.strict_global_keys {
            return Err(ValidationError::NonUniqueGlobalKey {
                column: spec.global_key_column().to_string(),
                duplicates: projection.duplicate_keys.len(),
            }
            .into());
        }
    }
    info!(
        table = %table_id,
        rows = result.rows.len(),
        records = projection.records.len(),
        conversion_errors = projection.conversion_errors.len(),
        "projected warehouse rows"
    );
    Ok(projection)
}
