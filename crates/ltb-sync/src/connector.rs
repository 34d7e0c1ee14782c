//! The four caller-facing sync operations.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ltb_adapters::{KeyStatus, LabelingService, UpsertError};
use ltb_core::{
    cell_text, column_name_for, row_cell, Column, DuplicatePolicy, MetadataIndex, MetadataValue,
    Record, RecordMetadata, Row, TableId, ValidationError, WarehouseTable,
};
use ltb_storage::{InsertError, SelectQuery, Statement, UpdateStatement, Warehouse};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, info_span, warn, Instrument};

use crate::config::SyncConfig;
use crate::error::{ConversionError, SyncError};
use crate::project::{project_rows, ProjectionSpec};
use crate::reconcile::{reconcile_schema, ReconcileReport};
use crate::translate::SchemaTranslation;
use crate::upload::{upload_records, UploadOptions, UploadReport};

#[derive(Debug, Clone)]
pub struct PushRequest {
    pub table: TableId,
    pub dataset_id: String,
    pub projection: ProjectionSpec,
    pub duplicate_policy: DuplicatePolicy,
}

#[derive(Debug, Clone, Serialize)]
pub struct PushOutcome {
    pub reconcile: ReconcileReport,
    pub upload: UploadReport,
    pub conversion_errors: Vec<ConversionError>,
    pub duplicate_keys: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MaterializeRequest {
    pub dataset_id: String,
    /// Dashes in the table name become underscores.
    pub table: TableId,
    pub metadata_index: MetadataIndex,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaterializeOutcome {
    pub table: WarehouseTable,
    pub rows: usize,
    pub insert_errors: Vec<InsertError>,
}

#[derive(Debug, Clone)]
pub struct TableUpsertRequest {
    pub table: TableId,
    pub dataset_id: String,
    pub global_key_col: String,
    pub metadata_index: MetadataIndex,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableUpsertReport {
    pub statements: usize,
    pub rows_updated: usize,
    /// Exported records with no global key or no indexed value.
    pub records_skipped: usize,
}

#[derive(Debug, Clone)]
pub struct LabelingUpsertRequest {
    pub table: TableId,
    pub global_key_col: String,
    /// Keys to push; every key in the table when `None`.
    pub global_keys: Option<Vec<String>>,
    pub metadata_index: MetadataIndex,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LabelingUpsertReport {
    pub upserted: usize,
    /// Requested keys absent from the table or without a live record.
    pub missing_keys: Vec<String>,
    pub errors: Vec<UpsertError>,
}

/// Binds the two collaborators and the sync settings.
#[derive(Clone)]
pub struct Connector {
    labeling: Arc<dyn LabelingService>,
    warehouse: Arc<dyn Warehouse>,
    config: SyncConfig,
}

impl Connector {
    pub fn new(
        labeling: Arc<dyn LabelingService>,
        warehouse: Arc<dyn Warehouse>,
        config: SyncConfig,
    ) -> Self {
        Self {
            labeling,
            warehouse,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    async fn translation(&self) -> Result<SchemaTranslation, SyncError> {
        let ontology = self.labeling.get_metadata_ontology().await?;
        Ok(SchemaTranslation::from_snapshot(&ontology, &self.config.divider))
    }

    /// Warehouse rows -> labeling records: reconcile, translate, project, upload.
    pub async fn create_records_from_table(
        &self,
        request: PushRequest,
    ) -> Result<PushOutcome, SyncError> {
        let span = info_span!("push", table = %request.table, dataset = %request.dataset_id);
        self.push(request).instrument(span).await
    }

    async fn push(&self, request: PushRequest) -> Result<PushOutcome, SyncError> {
        self.config.validate()?;
        let table = self.warehouse.get_table(&request.table).await?;
        request.projection.validate_roles(&table)?;

        let reconcile = reconcile_schema(
            self.labeling.as_ref(),
            self.warehouse.as_ref(),
            &request.table,
            &request.projection.metadata_index,
        )
        .await?;
        let translation = self.translation().await?;
        let projection = project_rows(
            self.warehouse.as_ref(),
            &request.table,
            &request.projection,
            &translation,
            &self.config,
        )
        .await?;

        if projection.records.is_empty() && !projection.conversion_errors.is_empty() {
            return Err(SyncError::NothingConverted(projection.conversion_errors));
        }

        let options = UploadOptions::from_config(&self.config, request.duplicate_policy);
        let upload = upload_records(
            self.labeling.as_ref(),
            &request.dataset_id,
            projection.records,
            &options,
        )
        .await?;

        Ok(PushOutcome {
            reconcile,
            upload,
            conversion_errors: projection.conversion_errors,
            duplicate_keys: projection.duplicate_keys,
        })
    }

    /// Labeling dataset -> new warehouse table, one row per live record.
    pub async fn create_table_from_dataset(
        &self,
        request: MaterializeRequest,
    ) -> Result<MaterializeOutcome, SyncError> {
        request.metadata_index.validate()?;
        let mut table_id = request.table;
        table_id.table = table_id.table.replace('-', "_");

        let records = self
            .labeling
            .export_rows(&request.dataset_id, true)
            .await?;
        let translation = self.translation().await?;

        let mut columns = vec![
            Column::required_string("data_row_id"),
            Column::required_string("row_data"),
        ];
        if records.iter().any(|r| r.external_id.is_some()) {
            columns.push(Column::string("external_id"));
        }
        if records.iter().any(|r| r.global_key.is_some()) {
            columns.push(Column::string("global_key"));
        }
        for entry in request.metadata_index.iter() {
            columns.push(Column::string(column_name_for(&entry.field)));
        }

        let table = self.warehouse.create_table(&table_id, columns).await?;
        let rows = records
            .iter()
            .map(|record| materialized_row(record, &request.metadata_index, &translation))
            .collect::<Vec<_>>();
        let row_count = rows.len();
        let insert_errors = self.warehouse.insert_rows(&table_id, rows).await?;
        if !insert_errors.is_empty() {
            warn!(table = %table_id, rejected = insert_errors.len(), "warehouse rejected rows");
        }
        info!(
            table = %table_id,
            dataset = %request.dataset_id,
            rows = row_count - insert_errors.len(),
            "materialized dataset"
        );
        Ok(MaterializeOutcome {
            table,
            rows: row_count,
            insert_errors,
        })
    }

    /// Remote metadata -> existing warehouse columns, one keyed UPDATE per record.
    pub async fn upsert_table_metadata(
        &self,
        request: TableUpsertRequest,
    ) -> Result<TableUpsertReport, SyncError> {
        reconcile_schema(
            self.labeling.as_ref(),
            self.warehouse.as_ref(),
            &request.table,
            &request.metadata_index,
        )
        .await?;
        let table = self.warehouse.get_table(&request.table).await?;
        let key_column = resolve_column(&table, &request.global_key_col)?;

        let records = self
            .labeling
            .export_rows(&request.dataset_id, true)
            .await?;
        let translation = self.translation().await?;

        let mut report = TableUpsertReport::default();
        for record in &records {
            let Some(global_key) = &record.global_key else {
                report.records_skipped += 1;
                continue;
            };
            let mut assignments = Vec::new();
            for entry in request.metadata_index.iter() {
                if let Some(value) = field_value(record, &entry.field, &translation) {
                    let column = resolve_column(&table, &entry.field)?;
                    assignments.push((column, JsonValue::String(value)));
                }
            }
            if assignments.is_empty() {
                report.records_skipped += 1;
                continue;
            }
            let statement = Statement::Update(UpdateStatement {
                table: request.table.clone(),
                assignments,
                key_column: key_column.clone(),
                key_value: JsonValue::String(global_key.clone()),
            });
            let result = self.warehouse.run_query(&statement).await?;
            report.statements += 1;
            report.rows_updated += result.affected_rows;
        }
        info!(
            table = %request.table,
            statements = report.statements,
            rows = report.rows_updated,
            "pushed labeling metadata into warehouse"
        );
        Ok(report)
    }

    /// Warehouse columns -> remote metadata of the records holding each key.
    pub async fn upsert_labeling_metadata(
        &self,
        request: LabelingUpsertRequest,
    ) -> Result<LabelingUpsertReport, SyncError> {
        reconcile_schema(
            self.labeling.as_ref(),
            self.warehouse.as_ref(),
            &request.table,
            &request.metadata_index,
        )
        .await?;
        let table = self.warehouse.get_table(&request.table).await?;
        let key_column = resolve_column(&table, &request.global_key_col)?;
        let mut columns = vec![key_column.clone()];
        for entry in request.metadata_index.iter() {
            columns.push(resolve_column(&table, &entry.field)?);
        }
        let result = self
            .warehouse
            .run_query(&Statement::Select(SelectQuery::new(
                request.table.clone(),
                columns,
            )))
            .await?;

        let rows_by_key = result
            .rows
            .into_iter()
            .filter_map(|row| {
                row_cell(&row, &key_column)
                    .and_then(cell_text)
                    .map(|key| (key, row))
            })
            .collect::<BTreeMap<String, Row>>();

        let mut report = LabelingUpsertReport::default();
        let keys = match request.global_keys {
            Some(requested) => {
                let mut present = Vec::new();
                for key in requested.into_iter().collect::<BTreeSet<_>>() {
                    if rows_by_key.contains_key(&key) {
                        present.push(key);
                    } else {
                        report.missing_keys.push(key);
                    }
                }
                present
            }
            None => rows_by_key.keys().cloned().collect(),
        };
        if keys.is_empty() {
            return Ok(report);
        }

        let mut key_by_record = BTreeMap::new();
        for resolution in self.labeling.get_record_ids_for_keys(&keys).await? {
            match resolution.status {
                KeyStatus::Live { record_id } => {
                    key_by_record.insert(record_id, resolution.global_key);
                }
                _ => report.missing_keys.push(resolution.global_key),
            }
        }
        let record_ids = key_by_record.keys().cloned().collect::<Vec<_>>();
        let exported = self.labeling.bulk_export(&record_ids).await?;
        let translation = self.translation().await?;

        let mut updates = Vec::new();
        for mut metadata in exported {
            let Some(row) = key_by_record
                .get(&metadata.record_id)
                .and_then(|key| rows_by_key.get(key))
            else {
                continue;
            };
            match apply_row(&mut metadata, row, &request.metadata_index, &translation) {
                Ok(()) => updates.push(metadata),
                Err(message) => report.errors.push(UpsertError {
                    record_id: metadata.record_id,
                    message,
                }),
            }
        }

        let attempted = updates.iter().map(|m| m.record_id.clone()).collect::<BTreeSet<_>>();
        let rejected = self.labeling.bulk_upsert(updates).await?;
        report.upserted = accepted_count(&attempted, &rejected);
        report.errors.extend(rejected);
        if !report.missing_keys.is_empty() {
            warn!(
                table = %request.table,
                missing = report.missing_keys.len(),
                "global keys without a live labeling record"
            );
        }
        info!(
            table = %request.table,
            upserted = report.upserted,
            errors = report.errors.len(),
            "pushed warehouse values into labeling metadata"
        );
        Ok(report)
    }
}

/// Records that were sent and drew no error, however many errors a service
/// reports per record.
fn accepted_count(attempted: &BTreeSet<String>, rejected: &[UpsertError]) -> usize {
    let rejected = rejected
        .iter()
        .filter(|e| attempted.contains(&e.record_id))
        .map(|e| e.record_id.as_str())
        .collect::<BTreeSet<_>>();
    attempted.len().saturating_sub(rejected.len())
}

fn resolve_column(table: &WarehouseTable, name: &str) -> Result<String, ValidationError> {
    table
        .column(name)
        .map(|c| c.name.clone())
        .ok_or_else(|| ValidationError::MissingColumn {
            column: name.to_string(),
            table: table.id.to_string(),
        })
}

/// Display value of `field` on a record, with option ids turned back into names.
fn field_value(record: &Record, field: &str, translation: &SchemaTranslation) -> Option<String> {
    let schema_id = translation.schema_id(field)?;
    record
        .metadata_fields
        .iter()
        .find(|m| m.schema_id == schema_id)
        .map(|m| translation.value_for_display(&m.value))
}

fn materialized_row(record: &Record, index: &MetadataIndex, translation: &SchemaTranslation) -> Row {
    let mut row = Row::new();
    row.insert("data_row_id".into(), JsonValue::String(record.record_id.clone()));
    row.insert("row_data".into(), JsonValue::String(record.row_data.clone()));
    if let Some(external_id) = &record.external_id {
        row.insert("external_id".into(), JsonValue::String(external_id.clone()));
    }
    if let Some(global_key) = &record.global_key {
        row.insert("global_key".into(), JsonValue::String(global_key.clone()));
    }
    for entry in index.iter() {
        if let Some(value) = field_value(record, &entry.field, translation) {
            row.insert(column_name_for(&entry.field), JsonValue::String(value));
        }
    }
    row
}

/// Overwrites indexed fields with the row's non-null values, adding the ones
/// the record does not carry yet.
fn apply_row(
    metadata: &mut RecordMetadata,
    row: &Row,
    index: &MetadataIndex,
    translation: &SchemaTranslation,
) -> Result<(), String> {
    for entry in index.iter() {
        let Some(raw) = row_cell(row, &entry.field).and_then(cell_text) else {
            continue;
        };
        let schema_id = translation
            .schema_id(&entry.field)
            .ok_or_else(|| format!("metadata field {} is missing from the ontology", entry.field))?;
        entry
            .kind
            .check_value(&raw)
            .map_err(|reason| format!("metadata field {}: {reason}", entry.field))?;
        let value = translation.value_for_upload(&entry.field, &raw);
        match metadata.fields.iter_mut().find(|m| m.schema_id == schema_id) {
            Some(existing) => existing.value = value,
            None => metadata.fields.push(MetadataValue {
                schema_id: schema_id.to_string(),
                value,
            }),
        }
    }
    Ok(())
}
