use std::collections::{BTreeMap, BTreeSet};

use ltb_adapters::{LabelingError, LabelingService};
use ltb_core::{
    cell_text, column_name_for, Column, MetadataFieldSpec, MetadataIndex, MetadataKind,
    OntologySnapshot, TableId, WarehouseTable, INTEGRATION_SOURCE_FIELD,
};
use ltb_storage::{SelectQuery, Statement, Warehouse};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{ReconcileFailure, SyncError};

/// What one reconciliation pass had to create.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub table: Option<TableId>,
    pub created_fields: Vec<String>,
    /// Enum field name -> options appended to an existing field.
    pub appended_options: BTreeMap<String, Vec<String>>,
    pub created_columns: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.created_fields.is_empty()
            && self.appended_options.is_empty()
            && self.created_columns.is_empty()
    }
}

/// Makes every index entry exist as an ontology field and as a warehouse
/// column, plus the provenance field. Creation is additive and repeatable.
pub async fn reconcile_schema(
    labeling: &dyn LabelingService,
    warehouse: &dyn Warehouse,
    table_id: &TableId,
    index: &MetadataIndex,
) -> Result<ReconcileReport, SyncError> {
    index.validate()?;

    let table = warehouse
        .get_table(table_id)
        .await
        .map_err(ReconcileFailure::from)?;
    let mut ontology = fetch_ontology(labeling).await?;
    let mut report = ReconcileReport {
        table: Some(table_id.clone()),
        ..ReconcileReport::default()
    };

    for entry in index.iter() {
        let values = if entry.kind == MetadataKind::Enum {
            distinct_values(warehouse, &table, &entry.field).await?
        } else {
            BTreeSet::new()
        };

        match ontology.field(&entry.field).cloned() {
            None => {
                let spec = match entry.kind {
                    MetadataKind::Enum => MetadataFieldSpec::enumeration(&entry.field, values),
                    kind => MetadataFieldSpec::new(&entry.field, kind),
                };
                if create_field(labeling, &spec).await? {
                    report.created_fields.push(entry.field.clone());
                }
                ontology = fetch_ontology(labeling).await?;
            }
            Some(existing) if existing.kind != entry.kind => {
                warn!(
                    field = %entry.field,
                    remote = %existing.kind,
                    requested = %entry.kind,
                    "metadata field exists with a different kind; leaving it as is"
                );
            }
            Some(existing) if existing.kind == MetadataKind::Enum => {
                let missing = values
                    .into_iter()
                    .filter(|value| !existing.options.iter().any(|o| &o.name == value))
                    .collect::<Vec<_>>();
                if !missing.is_empty() {
                    debug!(field = %entry.field, count = missing.len(), "appending enum options");
                    labeling
                        .add_enum_options(&existing.schema_id, &missing)
                        .await
                        .map_err(ReconcileFailure::from)?;
                    report.appended_options.insert(entry.field.clone(), missing);
                    ontology = fetch_ontology(labeling).await?;
                }
            }
            Some(_) => {}
        }
    }

    if !ontology.contains(INTEGRATION_SOURCE_FIELD) {
        let spec = MetadataFieldSpec::new(INTEGRATION_SOURCE_FIELD, MetadataKind::String);
        if create_field(labeling, &spec).await? {
            report.created_fields.push(INTEGRATION_SOURCE_FIELD.to_string());
        }
    }

    let mut columns = table.columns.clone();
    for entry in index.iter() {
        if !table.has_column(&entry.field) {
            let name = column_name_for(&entry.field);
            report.created_columns.push(name.clone());
            columns.push(Column::string(name));
        }
    }
    if !report.created_columns.is_empty() {
        warehouse
            .update_table_schema(table_id, columns)
            .await
            .map_err(ReconcileFailure::from)?;
    }

    if report.is_noop() {
        debug!(table = %table_id, "schemas already reconciled");
    } else {
        info!(
            table = %table_id,
            fields = report.created_fields.len(),
            columns = report.created_columns.len(),
            enums_extended = report.appended_options.len(),
            "reconciled metadata schema"
        );
    }
    Ok(report)
}

async fn fetch_ontology(labeling: &dyn LabelingService) -> Result<OntologySnapshot, SyncError> {
    Ok(labeling
        .get_metadata_ontology()
        .await
        .map_err(ReconcileFailure::from)?)
}

/// Returns false when another writer created the field first.
async fn create_field(
    labeling: &dyn LabelingService,
    spec: &MetadataFieldSpec,
) -> Result<bool, SyncError> {
    match labeling.create_schema(spec).await {
        Ok(()) => Ok(true),
        Err(LabelingError::FieldExists(name)) => {
            debug!(field = %name, "metadata field appeared concurrently");
            Ok(false)
        }
        Err(err) => Err(ReconcileFailure::from(err).into()),
    }
}

async fn distinct_values(
    warehouse: &dyn Warehouse,
    table: &WarehouseTable,
    field: &str,
) -> Result<BTreeSet<String>, SyncError> {
    let Some(column) = table.column(field) else {
        return Ok(BTreeSet::new());
    };
    let query = Statement::Select(SelectQuery::distinct_values(
        table.id.clone(),
        column.name.clone(),
    ));
    let result = warehouse
        .run_query(&query)
        .await
        .map_err(ReconcileFailure::from)?;
    Ok(result
        .rows
        .iter()
        .filter_map(|row| row.values().next().and_then(cell_text))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ltb_adapters::MemoryLabelingService;
    use ltb_core::Row;
    use ltb_storage::MemoryWarehouse;
    use serde_json::json;

    fn frames() -> TableId {
        TableId::new("proj", "vision", "frames")
    }

    fn row(weather: Option<&str>) -> Row {
        let mut row = Row::new();
        row.insert("row_data".into(), json!("s3://b/1.jpg"));
        row.insert("weather".into(), weather.map_or(json!(null), |w| json!(w)));
        row
    }

    async fn warehouse(rows: Vec<Row>) -> MemoryWarehouse {
        MemoryWarehouse::new()
            .with_table(
                frames(),
                vec![Column::required_string("row_data"), Column::string("weather")],
                rows,
            )
            .await
    }

    fn index() -> MetadataIndex {
        MetadataIndex::new()
            .with("weather", MetadataKind::Enum)
            .with("camera model", MetadataKind::String)
    }

    #[tokio::test]
    async fn creates_fields_options_and_columns_once() {
        let labeling = MemoryLabelingService::new();
        let warehouse = warehouse(vec![row(Some("rain")), row(Some("sun")), row(None)]).await;

        let first = reconcile_schema(&labeling, &warehouse, &frames(), &index())
            .await
            .unwrap();
        assert_eq!(
            first.created_fields,
            ["weather", "camera model", INTEGRATION_SOURCE_FIELD]
        );
        assert_eq!(first.created_columns, ["camera_model"]);

        let ontology = labeling.get_metadata_ontology().await.unwrap();
        let weather = ontology.field("weather").unwrap();
        assert_eq!(
            weather.options.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(),
            ["rain", "sun"]
        );

        let second = reconcile_schema(&labeling, &warehouse, &frames(), &index())
            .await
            .unwrap();
        assert!(second.is_noop(), "{second:?}");
        let again = labeling.get_metadata_ontology().await.unwrap();
        assert_eq!(again.fields.len(), ontology.fields.len());
        assert_eq!(warehouse.get_table(&frames()).await.unwrap().columns.len(), 3);
    }

    #[tokio::test]
    async fn new_warehouse_values_extend_existing_enums() {
        let labeling = MemoryLabelingService::new();
        let warehouse = warehouse(vec![row(Some("rain"))]).await;
        reconcile_schema(&labeling, &warehouse, &frames(), &index())
            .await
            .unwrap();

        warehouse
            .insert_rows(&frames(), vec![row(Some("fog"))])
            .await
            .unwrap();
        let report = reconcile_schema(&labeling, &warehouse, &frames(), &index())
            .await
            .unwrap();
        assert_eq!(report.appended_options.get("weather"), Some(&vec!["fog".to_string()]));
    }

    #[tokio::test]
    async fn kind_mismatches_are_left_alone() {
        let labeling = MemoryLabelingService::new();
        labeling
            .create_schema(&MetadataFieldSpec::new("weather", MetadataKind::String))
            .await
            .unwrap();
        let warehouse = warehouse(vec![row(Some("rain"))]).await;

        let report = reconcile_schema(&labeling, &warehouse, &frames(), &index())
            .await
            .unwrap();
        assert!(!report.created_fields.contains(&"weather".to_string()));
        let ontology = labeling.get_metadata_ontology().await.unwrap();
        assert_eq!(ontology.field("weather").unwrap().kind, MetadataKind::String);
    }

    #[tokio::test]
    async fn missing_table_is_a_reconciliation_failure() {
        let labeling = MemoryLabelingService::new();
        let warehouse = MemoryWarehouse::new();
        let err = reconcile_schema(&labeling, &warehouse, &frames(), &index())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Reconciliation(ReconcileFailure::Warehouse(_))
        ));
        assert!(labeling.get_metadata_ontology().await.unwrap().fields.is_empty());
    }

    #[tokio::test]
    async fn reserved_field_in_index_fails_before_any_call() {
        let labeling = MemoryLabelingService::new();
        let warehouse = warehouse(Vec::new()).await;
        let index = MetadataIndex::new().with(INTEGRATION_SOURCE_FIELD, MetadataKind::String);
        let err = reconcile_schema(&labeling, &warehouse, &frames(), &index)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
        assert!(labeling.get_metadata_ontology().await.unwrap().fields.is_empty());
    }
}
