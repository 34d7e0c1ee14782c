//! Warehouse collaborator contract, parameterized statements, and the
//! in-memory and parquet-file warehouses used by the CLI and tests.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use ltb_core::{
    cell_text, columns_match, Column, ColumnMode, ColumnType, Row, TableId, WarehouseTable,
};
use serde::Serialize;
use serde_json::{Number, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

mod file;
pub mod sql;

pub use file::ParquetWarehouse;
pub use sql::{QueryParam, RenderedQuery, SelectQuery, Statement, UpdateStatement};

pub const CRATE_NAME: &str = "ltb-storage";

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("table {0} not found")]
    TableNotFound(TableId),
    #[error("table {0} already exists")]
    TableExists(TableId),
    #[error("column {column} not found in table {table}")]
    UnknownColumn { table: TableId, column: String },
    #[error("schema update for {table} is not additive at column {column}")]
    NonAdditiveSchema { table: TableId, column: String },
    #[error("invalid value for {table}.{column}: {message}")]
    InvalidValue {
        table: TableId,
        column: String,
        message: String,
    },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// A row the warehouse refused during a streaming insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InsertError {
    pub index: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub affected_rows: usize,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn get_table(&self, id: &TableId) -> Result<WarehouseTable, WarehouseError>;

    async fn create_table(
        &self,
        id: &TableId,
        columns: Vec<Column>,
    ) -> Result<WarehouseTable, WarehouseError>;

    /// Replaces the schema; the new one must extend the current one.
    async fn update_table_schema(
        &self,
        id: &TableId,
        columns: Vec<Column>,
    ) -> Result<WarehouseTable, WarehouseError>;

    async fn run_query(&self, statement: &Statement) -> Result<QueryResult, WarehouseError>;

    /// Inserts what it can and reports the rows it rejected.
    async fn insert_rows(
        &self,
        id: &TableId,
        rows: Vec<Row>,
    ) -> Result<Vec<InsertError>, WarehouseError>;
}

/// Schema plus rows of one table, with the statement semantics shared by
/// every local warehouse.
#[derive(Debug, Clone, PartialEq)]
pub struct TableData {
    pub table: WarehouseTable,
    pub rows: Vec<Row>,
}

impl TableData {
    pub fn new(id: TableId, columns: Vec<Column>) -> Self {
        Self {
            table: WarehouseTable {
                id,
                columns,
                row_count: 0,
            },
            rows: Vec::new(),
        }
    }

    fn resolve_column(&self, name: &str) -> Result<&Column, WarehouseError> {
        self.table
            .column(name)
            .ok_or_else(|| WarehouseError::UnknownColumn {
                table: self.table.id.clone(),
                column: name.to_string(),
            })
    }

    pub fn apply_schema(&mut self, columns: Vec<Column>) -> Result<(), WarehouseError> {
        for (index, existing) in self.table.columns.iter().enumerate() {
            match columns.get(index) {
                Some(next)
                    if next.name == existing.name && next.column_type == existing.column_type => {}
                _ => {
                    return Err(WarehouseError::NonAdditiveSchema {
                        table: self.table.id.clone(),
                        column: existing.name.clone(),
                    })
                }
            }
        }
        if let Some(required) = columns[self.table.columns.len()..]
            .iter()
            .find(|c| c.mode == ColumnMode::Required && !self.rows.is_empty())
        {
            return Err(WarehouseError::NonAdditiveSchema {
                table: self.table.id.clone(),
                column: required.name.clone(),
            });
        }
        self.table.columns = columns;
        Ok(())
    }

    pub fn execute(&mut self, statement: &Statement) -> Result<QueryResult, WarehouseError> {
        match statement {
            Statement::Select(query) => self.select(query),
            Statement::Update(update) => self.update(update),
        }
    }

    fn select(&self, query: &SelectQuery) -> Result<QueryResult, WarehouseError> {
        let columns = query
            .columns
            .iter()
            .map(|requested| {
                self.resolve_column(requested)
                    .map(|c| (requested.clone(), c.name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut seen = HashSet::new();
        let mut rows = Vec::new();
        for stored in &self.rows {
            let projected = columns
                .iter()
                .map(|(requested, actual)| {
                    let value = stored.get(actual).cloned().unwrap_or(JsonValue::Null);
                    (requested.clone(), value)
                })
                .collect::<Row>();
            if query.distinct && !seen.insert(serde_json::to_string(&projected).unwrap_or_default())
            {
                continue;
            }
            rows.push(projected);
        }
        Ok(QueryResult {
            rows,
            affected_rows: 0,
        })
    }

    fn update(&mut self, update: &UpdateStatement) -> Result<QueryResult, WarehouseError> {
        let key_column = self.resolve_column(&update.key_column)?.name.clone();
        let assignments = update
            .assignments
            .iter()
            .map(|(column, value)| {
                let column = self.resolve_column(column)?;
                let value = coerce_cell(column, value.clone()).map_err(|message| {
                    WarehouseError::InvalidValue {
                        table: self.table.id.clone(),
                        column: column.name.clone(),
                        message,
                    }
                })?;
                Ok((column.name.clone(), value))
            })
            .collect::<Result<Vec<_>, WarehouseError>>()?;
        let key = cell_text(&update.key_value);

        let mut affected_rows = 0;
        for row in &mut self.rows {
            let current = row.get(&key_column).and_then(cell_text);
            if key.is_some() && current == key {
                for (column, value) in &assignments {
                    row.insert(column.clone(), value.clone());
                }
                affected_rows += 1;
            }
        }
        Ok(QueryResult {
            rows: Vec::new(),
            affected_rows,
        })
    }

    pub fn insert(&mut self, rows: Vec<Row>) -> Vec<InsertError> {
        let mut errors = Vec::new();
        'rows: for (index, row) in rows.into_iter().enumerate() {
            let mut stored = BTreeMap::new();
            for (name, value) in row {
                match self.table.columns.iter().find(|c| columns_match(&c.name, &name)) {
                    Some(column) => match coerce_cell(column, value) {
                        Ok(value) => {
                            stored.insert(column.name.clone(), value);
                        }
                        Err(message) => {
                            errors.push(InsertError {
                                index,
                                message: format!("invalid value for {}: {message}", column.name),
                            });
                            continue 'rows;
                        }
                    },
                    None => {
                        errors.push(InsertError {
                            index,
                            message: format!("no such field: {name}"),
                        });
                        continue 'rows;
                    }
                }
            }
            for column in &self.table.columns {
                let missing = stored.get(&column.name).map_or(true, JsonValue::is_null);
                if column.mode == ColumnMode::Required && missing {
                    errors.push(InsertError {
                        index,
                        message: format!("missing required field: {}", column.name),
                    });
                    continue 'rows;
                }
            }
            self.rows.push(stored);
        }
        self.table.row_count = self.rows.len();
        errors
    }
}

/// Converts a cell to the JSON shape of its column type. Strings holding a
/// valid number or boolean are accepted for typed columns.
fn coerce_cell(column: &Column, value: JsonValue) -> Result<JsonValue, String> {
    if value.is_null() {
        return Ok(value);
    }
    let text = cell_text(&value).unwrap_or_default();
    let coerced = match column.column_type {
        ColumnType::String => Some(JsonValue::String(text.clone())),
        ColumnType::Int64 => value
            .as_i64()
            .or_else(|| text.trim().parse().ok())
            .map(JsonValue::from),
        ColumnType::Float64 => value
            .as_f64()
            .or_else(|| text.trim().parse().ok())
            .and_then(Number::from_f64)
            .map(JsonValue::Number),
        ColumnType::Bool => value
            .as_bool()
            .or_else(|| text.trim().parse().ok())
            .map(JsonValue::Bool),
    };
    coerced.ok_or_else(|| format!("{text:?} is not a valid {:?}", column.column_type))
}

/// Process-local warehouse; the reference collaborator for tests.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    tables: Mutex<BTreeMap<TableId, TableData>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a table with rows, bypassing insert validation.
    pub async fn with_table(self, id: TableId, columns: Vec<Column>, rows: Vec<Row>) -> Self {
        let mut data = TableData::new(id.clone(), columns);
        data.table.row_count = rows.len();
        data.rows = rows;
        self.tables.lock().await.insert(id, data);
        self
    }

    pub async fn rows(&self, id: &TableId) -> Option<Vec<Row>> {
        self.tables.lock().await.get(id).map(|t| t.rows.clone())
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn get_table(&self, id: &TableId) -> Result<WarehouseTable, WarehouseError> {
        self.tables
            .lock()
            .await
            .get(id)
            .map(|t| t.table.clone())
            .ok_or_else(|| WarehouseError::TableNotFound(id.clone()))
    }

    async fn create_table(
        &self,
        id: &TableId,
        columns: Vec<Column>,
    ) -> Result<WarehouseTable, WarehouseError> {
        let mut tables = self.tables.lock().await;
        if tables.contains_key(id) {
            return Err(WarehouseError::TableExists(id.clone()));
        }
        let data = TableData::new(id.clone(), columns);
        let table = data.table.clone();
        tables.insert(id.clone(), data);
        Ok(table)
    }

    async fn update_table_schema(
        &self,
        id: &TableId,
        columns: Vec<Column>,
    ) -> Result<WarehouseTable, WarehouseError> {
        let mut tables = self.tables.lock().await;
        let data = tables
            .get_mut(id)
            .ok_or_else(|| WarehouseError::TableNotFound(id.clone()))?;
        data.apply_schema(columns)?;
        Ok(data.table.clone())
    }

    async fn run_query(&self, statement: &Statement) -> Result<QueryResult, WarehouseError> {
        debug!(sql = %statement.render().sql, "running warehouse statement");
        let mut tables = self.tables.lock().await;
        let id = statement.table();
        let data = tables
            .get_mut(id)
            .ok_or_else(|| WarehouseError::TableNotFound(id.clone()))?;
        data.execute(statement)
    }

    async fn insert_rows(
        &self,
        id: &TableId,
        rows: Vec<Row>,
    ) -> Result<Vec<InsertError>, WarehouseError> {
        let mut tables = self.tables.lock().await;
        let data = tables
            .get_mut(id)
            .ok_or_else(|| WarehouseError::TableNotFound(id.clone()))?;
        Ok(data.insert(rows))
    }
}
