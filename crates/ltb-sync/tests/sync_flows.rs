use std::sync::Arc;

use ltb_adapters::{LabelingService, MemoryLabelingService};
use ltb_core::{
    AttachmentIndex, AttachmentKind, Column, DuplicatePolicy, MetadataIndex, MetadataKind, Row,
    TableId, INTEGRATION_SOURCE_FIELD,
};
use ltb_storage::{MemoryWarehouse, Warehouse};
use ltb_sync::{
    Connector, LabelingUpsertRequest, MaterializeRequest, ProjectionSpec, PushRequest, SyncConfig,
    SyncError, TableUpsertRequest,
};
use serde_json::{json, Value};

fn source() -> TableId {
    TableId::new("proj", "vision", "frames")
}

fn row(pairs: &[(&str, Value)]) -> Row {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn index() -> MetadataIndex {
    MetadataIndex::new()
        .with("weather", MetadataKind::Enum)
        .with("score", MetadataKind::Number)
        .with("captured at", MetadataKind::Datetime)
}

struct Fixture {
    labeling: Arc<MemoryLabelingService>,
    warehouse: Arc<MemoryWarehouse>,
    connector: Connector,
    dataset: String,
}

async fn fixture(config: SyncConfig) -> Fixture {
    let warehouse = MemoryWarehouse::new()
        .with_table(
            source(),
            vec![
                Column::required_string("image_url"),
                Column::string("frame_id"),
                Column::string("weather"),
                Column::string("score"),
                Column::string("captured_at"),
                Column::string("caption"),
            ],
            vec![
                row(&[
                    ("image_url", json!("s3://b/1.jpg")),
                    ("frame_id", json!("f1")),
                    ("weather", json!("rain")),
                    ("score", json!("0.9")),
                    ("captured_at", json!("2024-03-01 10:15:00")),
                    ("caption", json!("wet street")),
                ]),
                row(&[
                    ("image_url", json!("s3://b/2.jpg")),
                    ("frame_id", json!("f2")),
                    ("weather", json!("sun")),
                    ("score", json!("0.4")),
                    ("captured_at", json!(null)),
                    ("caption", json!(null)),
                ]),
            ],
        )
        .await;
    let labeling = Arc::new(MemoryLabelingService::new());
    let dataset = labeling.create_dataset("frames").await;
    let warehouse = Arc::new(warehouse);
    let connector = Connector::new(labeling.clone(), warehouse.clone(), config);
    Fixture {
        labeling,
        warehouse,
        connector,
        dataset,
    }
}

fn push(fixture: &Fixture) -> PushRequest {
    PushRequest {
        table: source(),
        dataset_id: fixture.dataset.clone(),
        projection: ProjectionSpec::new("image_url")
            .global_key("frame_id")
            .metadata(index())
            .attachments(AttachmentIndex::new().with("caption", AttachmentKind::RawText)),
        duplicate_policy: DuplicatePolicy::Skip,
    }
}

#[tokio::test]
async fn push_then_materialize_recovers_the_rows() {
    let fx = fixture(SyncConfig::default()).await;
    let outcome = fx
        .connector
        .create_records_from_table(push(&fx))
        .await
        .expect("push");
    assert!(outcome.upload.is_success());
    assert_eq!(outcome.upload.results.len(), 2);
    assert!(outcome.conversion_errors.is_empty());
    assert!(outcome.reconcile.created_fields.contains(&INTEGRATION_SOURCE_FIELD.to_string()));

    let materialized = fx
        .connector
        .create_table_from_dataset(MaterializeRequest {
            dataset_id: fx.dataset.clone(),
            table: TableId::new("proj", "vision", "frames-labeled"),
            metadata_index: index(),
        })
        .await
        .expect("materialize");
    assert_eq!(materialized.table.id.table, "frames_labeled");
    assert!(materialized.insert_errors.is_empty());

    let mut rows = fx
        .warehouse
        .rows(&materialized.table.id)
        .await
        .expect("table exists");
    rows.sort_by_key(|r| r["global_key"].as_str().map(str::to_string));
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["row_data"], json!("s3://b/1.jpg"));
    assert_eq!(rows[0]["external_id"], json!("f1"));
    assert_eq!(rows[0]["weather"], json!("rain"));
    assert_eq!(rows[0]["score"], json!("0.9"));
    assert_eq!(rows[0]["captured_at"], json!("2024-03-01 10:15:00"));
    assert_eq!(rows[1]["weather"], json!("sun"));
    assert!(rows[1].get("captured_at").is_none());
}

#[tokio::test]
async fn pushing_twice_skips_existing_keys() {
    let fx = fixture(SyncConfig::default()).await;
    fx.connector.create_records_from_table(push(&fx)).await.unwrap();
    let second = fx.connector.create_records_from_table(push(&fx)).await.unwrap();
    assert!(second.reconcile.is_noop());
    assert!(second.upload.results.is_empty());
    assert_eq!(second.upload.skipped, ["f1", "f2"]);
}

#[tokio::test]
async fn all_rows_failing_conversion_aborts_before_upload() {
    let fx = fixture(SyncConfig::default()).await;
    let mut request = push(&fx);
    request.projection = ProjectionSpec::new("image_url")
        .global_key("frame_id")
        .metadata(MetadataIndex::new().with("weather", MetadataKind::Number));

    let err = fx.connector.create_records_from_table(request).await.unwrap_err();
    match err {
        SyncError::NothingConverted(errors) => assert_eq!(errors.len(), 2),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(fx.labeling.export_rows(&fx.dataset, false).await.unwrap().is_empty());
}

#[tokio::test]
async fn rows_that_fail_conversion_do_not_block_the_rest() {
    let fx = fixture(SyncConfig::default()).await;
    fx.warehouse
        .insert_rows(
            &source(),
            vec![row(&[
                ("image_url", json!("s3://b/3.jpg")),
                ("frame_id", json!("f3")),
                ("score", json!("high")),
            ])],
        )
        .await
        .unwrap();

    let outcome = fx.connector.create_records_from_table(push(&fx)).await.unwrap();
    assert_eq!(outcome.conversion_errors.len(), 1);
    assert_eq!(outcome.conversion_errors[0].global_key.as_deref(), Some("f3"));
    assert_eq!(outcome.upload.results.len(), 2);
    assert!(outcome.upload.is_success());

    let exported = fx.labeling.export_rows(&fx.dataset, false).await.unwrap();
    let mut keys = exported
        .iter()
        .filter_map(|r| r.global_key.clone())
        .collect::<Vec<_>>();
    keys.sort();
    assert_eq!(keys, ["f1", "f2"]);
}

#[tokio::test]
async fn metadata_values_round_trip_as_written() {
    let fx = fixture(SyncConfig::default()).await;
    let readings = TableId::new("proj", "vision", "readings");
    fx.warehouse
        .create_table(
            &readings,
            vec![
                Column::required_string("image_url"),
                Column::string("when"),
                Column::string("n"),
            ],
        )
        .await
        .unwrap();
    fx.warehouse
        .insert_rows(
            &readings,
            vec![row(&[
                ("image_url", json!("s3://r/1.jpg")),
                ("when", json!("2024-03-01 10:15:00")),
                ("n", json!(" 7 ")),
            ])],
        )
        .await
        .unwrap();
    let index = MetadataIndex::new()
        .with("when", MetadataKind::Datetime)
        .with("n", MetadataKind::Number);

    let outcome = fx
        .connector
        .create_records_from_table(PushRequest {
            table: readings,
            dataset_id: fx.dataset.clone(),
            projection: ProjectionSpec::new("image_url").metadata(index.clone()),
            duplicate_policy: DuplicatePolicy::Skip,
        })
        .await
        .unwrap();
    assert!(outcome.conversion_errors.is_empty());

    let materialized = fx
        .connector
        .create_table_from_dataset(MaterializeRequest {
            dataset_id: fx.dataset.clone(),
            table: TableId::new("proj", "vision", "readings_out"),
            metadata_index: index,
        })
        .await
        .unwrap();
    let rows = fx.warehouse.rows(&materialized.table.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["when"], json!("2024-03-01 10:15:00"));
    assert_eq!(rows[0]["n"], json!(" 7 "));
}

#[tokio::test]
async fn missing_role_column_fails_before_schema_changes() {
    let fx = fixture(SyncConfig::default()).await;
    let mut request = push(&fx);
    request.projection = ProjectionSpec::new("image_url").global_key("frame key");

    let err = fx.connector.create_records_from_table(request).await.unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
    assert!(fx.labeling.get_metadata_ontology().await.unwrap().fields.is_empty());
}

#[tokio::test]
async fn remote_metadata_flows_into_warehouse_columns() {
    let fx = fixture(SyncConfig::default()).await;
    fx.connector.create_records_from_table(push(&fx)).await.unwrap();

    // Blank one cell so the update has something to restore.
    fx.warehouse
        .run_query(&ltb_storage::Statement::Update(ltb_storage::UpdateStatement {
            table: source(),
            assignments: vec![("weather".into(), json!(null))],
            key_column: "frame_id".into(),
            key_value: json!("f1"),
        }))
        .await
        .unwrap();

    let report = fx
        .connector
        .upsert_table_metadata(TableUpsertRequest {
            table: source(),
            dataset_id: fx.dataset.clone(),
            global_key_col: "frame_id".into(),
            metadata_index: MetadataIndex::new().with("weather", MetadataKind::Enum),
        })
        .await
        .unwrap();
    assert_eq!(report.statements, 2);
    assert_eq!(report.rows_updated, 2);

    let rows = fx.warehouse.rows(&source()).await.unwrap();
    let f1 = rows.iter().find(|r| r["frame_id"] == json!("f1")).unwrap();
    assert_eq!(f1["weather"], json!("rain"));
}

#[tokio::test]
async fn warehouse_values_flow_into_remote_metadata() {
    let fx = fixture(SyncConfig::default()).await;
    fx.connector.create_records_from_table(push(&fx)).await.unwrap();

    fx.warehouse
        .run_query(&ltb_storage::Statement::Update(ltb_storage::UpdateStatement {
            table: source(),
            assignments: vec![
                ("weather".into(), json!("fog")),
                ("caption".into(), json!("misty")),
            ],
            key_column: "frame_id".into(),
            key_value: json!("f2"),
        }))
        .await
        .unwrap();

    let index = MetadataIndex::new()
        .with("weather", MetadataKind::Enum)
        .with("caption", MetadataKind::String);
    let report = fx
        .connector
        .upsert_labeling_metadata(LabelingUpsertRequest {
            table: source(),
            global_key_col: "frame_id".into(),
            global_keys: Some(vec!["f2".into(), "f9".into()]),
            metadata_index: index.clone(),
        })
        .await
        .unwrap();
    assert_eq!(report.upserted, 1);
    assert_eq!(report.missing_keys, ["f9"]);
    assert!(report.errors.is_empty(), "{:?}", report.errors);

    let materialized = fx
        .connector
        .create_table_from_dataset(MaterializeRequest {
            dataset_id: fx.dataset.clone(),
            table: TableId::new("proj", "vision", "check"),
            metadata_index: index,
        })
        .await
        .unwrap();
    let rows = fx.warehouse.rows(&materialized.table.id).await.unwrap();
    let f2 = rows.iter().find(|r| r["global_key"] == json!("f2")).unwrap();
    assert_eq!(f2["weather"], json!("fog"));
    assert_eq!(f2["caption"], json!("misty"));
    let f1 = rows.iter().find(|r| r["global_key"] == json!("f1")).unwrap();
    assert_eq!(f1["weather"], json!("rain"));
}

#[tokio::test]
async fn strict_global_keys_reject_repeated_keys() {
    let config = SyncConfig {
        strict_global_keys: true,
        ..SyncConfig::default()
    };
    let fx = fixture(config).await;
    fx.warehouse
        .insert_rows(
            &source(),
            vec![row(&[
                ("image_url", json!("s3://b/3.jpg")),
                ("frame_id", json!("f1")),
            ])],
        )
        .await
        .unwrap();

    let err = fx.connector.create_records_from_table(push(&fx)).await.unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
}
