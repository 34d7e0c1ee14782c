use ltb_adapters::LabelingError;
use ltb_core::{ConfigurationError, ValidationError};
use ltb_storage::WarehouseError;
use serde::Serialize;
use thiserror::Error;

/// A collaborator rejected a schema read or mutation during reconciliation.
#[derive(Debug, Error)]
pub enum ReconcileFailure {
    #[error("labeling service: {0}")]
    Labeling(#[from] LabelingError),
    #[error("warehouse: {0}")]
    Warehouse(#[from] WarehouseError),
}

/// One source row that could not become an upload record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversionError {
    pub row_index: usize,
    pub global_key: Option<String>,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("schema reconciliation failed: {0}")]
    Reconciliation(#[from] ReconcileFailure),
    #[error("none of the rows could be converted ({} conversion error(s))", .0.len())]
    NothingConverted(Vec<ConversionError>),
    #[error("global keys still collide after {0} resolution passes")]
    ResolutionExhausted(usize),
    #[error("labeling service resolved {received} of {requested} global keys, not one per key in order")]
    KeyResolutionMismatch { requested: usize, received: usize },
    #[error(transparent)]
    Labeling(#[from] LabelingError),
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
}
