//! Metadata reconciliation and record sync between a labeling service and a
//! warehouse table.
//!
//! Every operation in [`Connector`] follows the same order: reconcile the two
//! schemas, build a fresh [`SchemaTranslation`] from the ontology, then move
//! rows or records across.

pub mod config;
pub mod connector;
pub mod error;
pub mod project;
pub mod reconcile;
pub mod translate;
pub mod upload;

pub use config::{load_job_file, JobFile, SyncConfig};
pub use connector::{
    Connector, LabelingUpsertReport, LabelingUpsertRequest, MaterializeOutcome,
    MaterializeRequest, PushOutcome, PushRequest, TableUpsertReport, TableUpsertRequest,
};
pub use error::{ConversionError, ReconcileFailure, SyncError};
pub use project::{project_rows, Projection, ProjectionSpec};
pub use reconcile::{reconcile_schema, ReconcileReport};
pub use translate::SchemaTranslation;
pub use upload::{upload_records, BatchFailure, RenamedKey, UploadOptions, UploadReport};

pub const CRATE_NAME: &str = "ltb-sync";
