//! Warehouse persisted as one parquet file per table under a root directory:
//! `<root>/<project>/<dataset>/<table>.parquet`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use arrow_array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray,
};
use arrow_schema::{DataType, Field as ArrowField, Schema, SchemaRef};
use async_trait::async_trait;
use ltb_core::{cell_text, Column, ColumnMode, ColumnType, Row, TableId, WarehouseTable};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde_json::{Number, Value as JsonValue};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::{InsertError, QueryResult, Statement, TableData, Warehouse, WarehouseError};

#[derive(Debug)]
pub struct ParquetWarehouse {
    root: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl ParquetWarehouse {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_path(&self, id: &TableId) -> PathBuf {
        self.root
            .join(&id.project)
            .join(&id.dataset)
            .join(format!("{}.parquet", id.table))
    }

    async fn load(&self, id: &TableId) -> Result<TableData, WarehouseError> {
        let path = self.table_path(id);
        let id = id.clone();
        tokio::task::spawn_blocking(move || load_table(&path, id))
            .await
            .context("parquet read task panicked")?
    }

    /// Hands the table back once it is on disk.
    async fn store(&self, data: TableData) -> Result<TableData, WarehouseError> {
        let path = self.table_path(&data.table.id);
        tokio::task::spawn_blocking(move || store_table(&path, &data).map(|()| data))
            .await
            .context("parquet write task panicked")?
    }
}

fn load_table(path: &Path, id: TableId) -> Result<TableData, WarehouseError> {
    if !path.exists() {
        return Err(WarehouseError::TableNotFound(id));
    }
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet metadata {}", path.display()))?;
    let columns = columns_from_schema(builder.schema())?;
    let reader = builder
        .build()
        .with_context(|| format!("opening parquet reader {}", path.display()))?;

    let mut data = TableData::new(id, columns);
    for batch in reader {
        let batch = batch.with_context(|| format!("decoding batch from {}", path.display()))?;
        data.rows.extend(rows_from_batch(&data.table.columns, &batch)?);
    }
    data.table.row_count = data.rows.len();
    Ok(data)
}

/// Writes to a temp file next to the target and renames it into place.
fn store_table(path: &Path, data: &TableData) -> Result<(), WarehouseError> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("table path {} has no parent", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("creating table directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", data.table.id.table, Uuid::new_v4()));
    let batch = batch_from_rows(&data.table.columns, &data.rows)?;
    let result = write_parquet(&temp_path, batch).and_then(|()| {
        std::fs::rename(&temp_path, path).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        })
    });
    if result.is_err() {
        let _ = std::fs::remove_file(&temp_path);
    }
    result.map_err(WarehouseError::from)
}

#[async_trait]
impl Warehouse for ParquetWarehouse {
    async fn get_table(&self, id: &TableId) -> Result<WarehouseTable, WarehouseError> {
        Ok(self.load(id).await?.table)
    }

    async fn create_table(
        &self,
        id: &TableId,
        columns: Vec<Column>,
    ) -> Result<WarehouseTable, WarehouseError> {
        let _guard = self.write_lock.lock().await;
        if tokio::fs::try_exists(self.table_path(id))
            .await
            .context("checking for an existing table")?
        {
            return Err(WarehouseError::TableExists(id.clone()));
        }
        let data = self.store(TableData::new(id.clone(), columns)).await?;
        info!(table = %id, path = %self.table_path(id).display(), "created parquet table");
        Ok(data.table)
    }

    async fn update_table_schema(
        &self,
        id: &TableId,
        columns: Vec<Column>,
    ) -> Result<WarehouseTable, WarehouseError> {
        let _guard = self.write_lock.lock().await;
        let mut data = self.load(id).await?;
        data.apply_schema(columns)?;
        Ok(self.store(data).await?.table)
    }

    async fn run_query(&self, statement: &Statement) -> Result<QueryResult, WarehouseError> {
        let _guard = self.write_lock.lock().await;
        let mut data = self.load(statement.table()).await?;
        let result = data.execute(statement)?;
        if matches!(statement, Statement::Update(_)) && result.affected_rows > 0 {
            self.store(data).await?;
        }
        Ok(result)
    }

    async fn insert_rows(
        &self,
        id: &TableId,
        rows: Vec<Row>,
    ) -> Result<Vec<InsertError>, WarehouseError> {
        let _guard = self.write_lock.lock().await;
        let mut data = self.load(id).await?;
        let errors = data.insert(rows);
        self.store(data).await?;
        Ok(errors)
    }
}

fn data_type(column_type: ColumnType) -> DataType {
    match column_type {
        ColumnType::String => DataType::Utf8,
        ColumnType::Int64 => DataType::Int64,
        ColumnType::Float64 => DataType::Float64,
        ColumnType::Bool => DataType::Boolean,
    }
}

fn arrow_schema(columns: &[Column]) -> SchemaRef {
    Arc::new(Schema::new(
        columns
            .iter()
            .map(|c| {
                ArrowField::new(
                    c.name.as_str(),
                    data_type(c.column_type),
                    c.mode == ColumnMode::Nullable,
                )
            })
            .collect::<Vec<_>>(),
    ))
}

fn columns_from_schema(schema: &SchemaRef) -> anyhow::Result<Vec<Column>> {
    schema
        .fields()
        .iter()
        .map(|field| {
            let column_type = match field.data_type() {
                DataType::Utf8 => ColumnType::String,
                DataType::Int64 => ColumnType::Int64,
                DataType::Float64 => ColumnType::Float64,
                DataType::Boolean => ColumnType::Bool,
                other => return Err(anyhow!("unsupported column type {other} for {}", field.name())),
            };
            Ok(Column {
                name: field.name().clone(),
                column_type,
                mode: if field.is_nullable() {
                    ColumnMode::Nullable
                } else {
                    ColumnMode::Required
                },
            })
        })
        .collect()
}

fn batch_from_rows(columns: &[Column], rows: &[Row]) -> anyhow::Result<RecordBatch> {
    let cell = |row: &Row, name: &str| row.get(name).cloned().unwrap_or(JsonValue::Null);
    let arrays = columns
        .iter()
        .map(|column| -> ArrayRef {
            let values = rows.iter().map(|row| cell(row, &column.name));
            match column.column_type {
                ColumnType::String => Arc::new(StringArray::from(
                    values.map(|v| cell_text(&v)).collect::<Vec<_>>(),
                )),
                ColumnType::Int64 => Arc::new(Int64Array::from(
                    values
                        .map(|v| v.as_i64().or_else(|| cell_text(&v)?.parse().ok()))
                        .collect::<Vec<_>>(),
                )),
                ColumnType::Float64 => Arc::new(Float64Array::from(
                    values
                        .map(|v| v.as_f64().or_else(|| cell_text(&v)?.parse().ok()))
                        .collect::<Vec<_>>(),
                )),
                ColumnType::Bool => Arc::new(BooleanArray::from(
                    values
                        .map(|v| v.as_bool().or_else(|| cell_text(&v)?.parse().ok()))
                        .collect::<Vec<_>>(),
                )),
            }
        })
        .collect::<Vec<_>>();

    if arrays.is_empty() {
        return Err(anyhow!("cannot store a table without columns"));
    }
    RecordBatch::try_new(arrow_schema(columns), arrays).context("building table record batch")
}

fn rows_from_batch(columns: &[Column], batch: &RecordBatch) -> anyhow::Result<Vec<Row>> {
    let mut rows = vec![Row::new(); batch.num_rows()];
    for (index, column) in columns.iter().enumerate() {
        let array = batch.column(index);
        for (row_index, row) in rows.iter_mut().enumerate() {
            let value = if array.is_null(row_index) {
                JsonValue::Null
            } else {
                match column.column_type {
                    ColumnType::String => JsonValue::String(
                        downcast::<StringArray>(array, &column.name)?
                            .value(row_index)
                            .to_string(),
                    ),
                    ColumnType::Int64 => {
                        JsonValue::from(downcast::<Int64Array>(array, &column.name)?.value(row_index))
                    }
                    ColumnType::Float64 => Number::from_f64(
                        downcast::<Float64Array>(array, &column.name)?.value(row_index),
                    )
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null),
                    ColumnType::Bool => {
                        JsonValue::Bool(downcast::<BooleanArray>(array, &column.name)?.value(row_index))
                    }
                }
            };
            row.insert(column.name.clone(), value);
        }
    }
    Ok(rows)
}

fn downcast<'a, T: 'static>(array: &'a ArrayRef, column: &str) -> anyhow::Result<&'a T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| anyhow!("column {column} does not match its declared type"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> anyhow::Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}
