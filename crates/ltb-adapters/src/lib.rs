//! Labeling-service contract plus an in-memory implementation that can be
//! persisted to a JSON state file.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use ltb_core::{
    FieldKind, MetadataFieldSpec, MetadataKind, MetadataValue, OntologySnapshot, Record,
    RecordMetadata, SchemaField, SchemaOption, UploadRecord,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ltb-adapters";

#[derive(Debug, Error)]
pub enum LabelingError {
    #[error("dataset {0} not found")]
    DatasetNotFound(String),
    #[error("metadata field {0} already exists")]
    FieldExists(String),
    #[error("metadata field {0} not found")]
    FieldNotFound(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// What a global key currently points at on the labeling side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyStatus {
    NotFound,
    /// The key is still assigned to a deleted record and must be cleared.
    Deleted,
    Live { record_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyResolution {
    pub global_key: String,
    pub status: KeyStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedRecord {
    pub record_id: String,
    pub global_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRecordsOutcome {
    pub results: Vec<CreatedRecord>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertError {
    pub record_id: String,
    pub message: String,
}

#[async_trait]
pub trait LabelingService: Send + Sync {
    async fn get_metadata_ontology(&self) -> Result<OntologySnapshot, LabelingError>;

    async fn create_schema(&self, spec: &MetadataFieldSpec) -> Result<(), LabelingError>;

    /// Appends options to an existing enum field; known options are ignored.
    async fn add_enum_options(
        &self,
        field_schema_id: &str,
        options: &[String],
    ) -> Result<(), LabelingError>;

    async fn bulk_export(&self, record_ids: &[String]) -> Result<Vec<RecordMetadata>, LabelingError>;

    async fn bulk_upsert(
        &self,
        metadata: Vec<RecordMetadata>,
    ) -> Result<Vec<UpsertError>, LabelingError>;

    /// One resolution per input key, in input order.
    async fn get_record_ids_for_keys(
        &self,
        keys: &[String],
    ) -> Result<Vec<KeyResolution>, LabelingError>;

    async fn clear_keys(&self, keys: &[String]) -> Result<(), LabelingError>;

    async fn create_records(
        &self,
        dataset_id: &str,
        records: Vec<UploadRecord>,
    ) -> Result<CreateRecordsOutcome, LabelingError>;

    async fn export_rows(
        &self,
        dataset_id: &str,
        include_metadata: bool,
    ) -> Result<Vec<Record>, LabelingError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub dataset_id: String,
    pub deleted: bool,
    pub record: Record,
}

/// Everything the in-memory service knows; serializable as a state file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelingState {
    #[serde(default)]
    pub ontology: Vec<SchemaField>,
    #[serde(default)]
    pub datasets: BTreeMap<String, String>,
    #[serde(default)]
    pub records: BTreeMap<String, StoredRecord>,
    #[serde(default)]
    pub global_keys: BTreeMap<String, String>,
}

impl LabelingState {
    fn field_by_id(&self, schema_id: &str) -> Option<&SchemaField> {
        self.ontology.iter().find(|f| f.schema_id == schema_id)
    }

    fn check_metadata(&self, fields: &[MetadataValue]) -> Result<(), String> {
        for value in fields {
            let field = self
                .field_by_id(&value.schema_id)
                .ok_or_else(|| format!("unknown metadata schema id {}", value.schema_id))?;
            if field.kind == MetadataKind::Enum
                && !field.options.iter().any(|o| o.schema_id == value.value)
            {
                return Err(format!(
                    "{:?} is not an option of enum field {}",
                    value.value, field.name
                ));
            }
        }
        Ok(())
    }

    fn key_is_held(&self, key: &str) -> Option<&StoredRecord> {
        self.global_keys
            .get(key)
            .and_then(|record_id| self.records.get(record_id))
    }
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn options_from(names: impl IntoIterator<Item = String>) -> Vec<SchemaOption> {
    names
        .into_iter()
        .map(|name| SchemaOption {
            schema_id: new_id(),
            name,
        })
        .collect()
}

/// Process-local labeling service; the reference collaborator for tests and
/// the backing store of the CLI.
#[derive(Debug, Default)]
pub struct MemoryLabelingService {
    state: Mutex<LabelingState>,
}

impl MemoryLabelingService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: LabelingState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub async fn state(&self) -> LabelingState {
        self.state.lock().await.clone()
    }

    pub async fn create_dataset(&self, name: &str) -> String {
        let id = new_id();
        self.state
            .lock()
            .await
            .datasets
            .insert(id.clone(), name.to_string());
        id
    }

    /// Marks a record deleted while its global key stays assigned.
    pub async fn delete_record(&self, record_id: &str) -> Result<(), LabelingError> {
        let mut state = self.state.lock().await;
        let stored = state
            .records
            .get_mut(record_id)
            .ok_or_else(|| LabelingError::Message(format!("record {record_id} not found")))?;
        stored.deleted = true;
        Ok(())
    }
}

#[async_trait]
impl LabelingService for MemoryLabelingService {
    async fn get_metadata_ontology(&self) -> Result<OntologySnapshot, LabelingError> {
        Ok(OntologySnapshot {
            fields: self.state.lock().await.ontology.clone(),
        })
    }

    async fn create_schema(&self, spec: &MetadataFieldSpec) -> Result<(), LabelingError> {
        let mut state = self.state.lock().await;
        if state.ontology.iter().any(|f| f.name == spec.name) {
            return Err(LabelingError::FieldExists(spec.name.clone()));
        }
        let options = match &spec.kind {
            FieldKind::Enum { options } => options_from(options.iter().cloned()),
            _ => Vec::new(),
        };
        debug!(field = %spec.name, kind = %spec.kind.metadata_kind(), "creating metadata field");
        state.ontology.push(SchemaField {
            schema_id: new_id(),
            name: spec.name.clone(),
            kind: spec.kind.metadata_kind(),
            options,
        });
        Ok(())
    }

    async fn add_enum_options(
        &self,
        field_schema_id: &str,
        options: &[String],
    ) -> Result<(), LabelingError> {
        let mut state = self.state.lock().await;
        let field = state
            .ontology
            .iter_mut()
            .find(|f| f.schema_id == field_schema_id)
            .ok_or_else(|| LabelingError::FieldNotFound(field_schema_id.to_string()))?;
        if field.kind != MetadataKind::Enum {
            return Err(LabelingError::Message(format!(
                "metadata field {} is not an enum",
                field.name
            )));
        }
        let fresh = options
            .iter()
            .filter(|name| !field.options.iter().any(|o| &o.name == *name))
            .cloned()
            .collect::<Vec<_>>();
        field.options.extend(options_from(fresh));
        Ok(())
    }

    async fn bulk_export(&self, record_ids: &[String]) -> Result<Vec<RecordMetadata>, LabelingError> {
        let state = self.state.lock().await;
        Ok(record_ids
            .iter()
            .filter_map(|id| state.records.get(id))
            .filter(|stored| !stored.deleted)
            .map(|stored| RecordMetadata {
                record_id: stored.record.record_id.clone(),
                fields: stored.record.metadata_fields.clone(),
            })
            .collect())
    }

    async fn bulk_upsert(
        &self,
        metadata: Vec<RecordMetadata>,
    ) -> Result<Vec<UpsertError>, LabelingError> {
        let mut state = self.state.lock().await;
        let mut errors = Vec::new();
        for update in metadata {
            if let Err(message) = state.check_metadata(&update.fields) {
                errors.push(UpsertError {
                    record_id: update.record_id,
                    message,
                });
                continue;
            }
            let Some(stored) = state
                .records
                .get_mut(&update.record_id)
                .filter(|stored| !stored.deleted)
            else {
                errors.push(UpsertError {
                    message: format!("record {} not found", update.record_id),
                    record_id: update.record_id,
                });
                continue;
            };
            for value in update.fields {
                let fields = &mut stored.record.metadata_fields;
                match fields.iter_mut().find(|f| f.schema_id == value.schema_id) {
                    Some(existing) => existing.value = value.value,
                    None => fields.push(value),
                }
            }
        }
        Ok(errors)
    }

    async fn get_record_ids_for_keys(
        &self,
        keys: &[String],
    ) -> Result<Vec<KeyResolution>, LabelingError> {
        let state = self.state.lock().await;
        Ok(keys
            .iter()
            .map(|key| {
                let status = match state.key_is_held(key) {
                    None => KeyStatus::NotFound,
                    Some(stored) if stored.deleted => KeyStatus::Deleted,
                    Some(stored) => KeyStatus::Live {
                        record_id: stored.record.record_id.clone(),
                    },
                };
                KeyResolution {
                    global_key: key.clone(),
                    status,
                }
            })
            .collect())
    }

    async fn clear_keys(&self, keys: &[String]) -> Result<(), LabelingError> {
        let mut state = self.state.lock().await;
        for key in keys {
            if let Some(record_id) = state.global_keys.remove(key) {
                if let Some(stored) = state.records.get_mut(&record_id) {
                    stored.record.global_key = None;
                }
            }
        }
        Ok(())
    }

    async fn create_records(
        &self,
        dataset_id: &str,
        records: Vec<UploadRecord>,
    ) -> Result<CreateRecordsOutcome, LabelingError> {
        let mut state = self.state.lock().await;
        if !state.datasets.contains_key(dataset_id) {
            return Err(LabelingError::DatasetNotFound(dataset_id.to_string()));
        }

        let mut outcome = CreateRecordsOutcome::default();
        let mut batch_keys = HashSet::new();
        for upload in records {
            let key = upload.global_key.clone();
            if !batch_keys.insert(key.clone()) || state.key_is_held(&key).is_some() {
                outcome
                    .errors
                    .push(format!("global key {key:?} is already in use"));
                continue;
            }
            if let Err(message) = state.check_metadata(&upload.metadata_fields) {
                outcome.errors.push(format!("record {key:?}: {message}"));
                continue;
            }
            let record_id = new_id();
            state.global_keys.insert(key.clone(), record_id.clone());
            state.records.insert(
                record_id.clone(),
                StoredRecord {
                    dataset_id: dataset_id.to_string(),
                    deleted: false,
                    record: Record {
                        record_id: record_id.clone(),
                        row_data: upload.row_data,
                        global_key: Some(key.clone()),
                        external_id: upload.external_id,
                        metadata_fields: upload.metadata_fields,
                        attachments: upload.attachments,
                    },
                },
            );
            outcome.results.push(CreatedRecord {
                record_id,
                global_key: key,
            });
        }
        Ok(outcome)
    }

    async fn export_rows(
        &self,
        dataset_id: &str,
        include_metadata: bool,
    ) -> Result<Vec<Record>, LabelingError> {
        let state = self.state.lock().await;
        if !state.datasets.contains_key(dataset_id) {
            return Err(LabelingError::DatasetNotFound(dataset_id.to_string()));
        }
        Ok(state
            .records
            .values()
            .filter(|stored| stored.dataset_id == dataset_id && !stored.deleted)
            .map(|stored| {
                let mut record = stored.record.clone();
                if !include_metadata {
                    record.metadata_fields.clear();
                }
                record
            })
            .collect())
    }
}

/// Reads a state file; a missing file yields an empty state.
pub async fn load_state_file(path: impl AsRef<Path>) -> anyhow::Result<LabelingState> {
    let path = path.as_ref();
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking state file {}", path.display()))?
    {
        return Ok(LabelingState::default());
    }
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Writes a state file through a temp file and an atomic rename.
pub async fn save_state_file(path: impl AsRef<Path>, state: &LabelingState) -> anyhow::Result<()> {
    let path = path.as_ref();
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating state directory {}", parent.display()))?;

    let bytes = serde_json::to_vec_pretty(state).context("serializing labeling state")?;
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::File::create(&temp_path)
        .await
        .with_context(|| format!("opening temp state file {}", temp_path.display()))?;
    file.write_all(&bytes)
        .await
        .with_context(|| format!("writing temp state file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp state file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    info!(path = %path.display(), records = state.records.len(), "saved labeling state");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn upload(key: &str) -> UploadRecord {
        UploadRecord {
            row_data: format!("s3://bucket/{key}.jpg"),
            global_key: key.to_string(),
            external_id: Some(key.to_string()),
            metadata_fields: Vec::new(),
            attachments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn key_lookup_distinguishes_live_deleted_and_missing() {
        let service = MemoryLabelingService::new();
        let dataset = service.create_dataset("frames").await;
        let created = service
            .create_records(&dataset, vec![upload("a"), upload("b")])
            .await
            .unwrap();
        assert!(created.errors.is_empty());
        service
            .delete_record(&created.results[1].record_id)
            .await
            .unwrap();

        let keys = ["a", "b", "c"].map(String::from);
        let statuses = service
            .get_record_ids_for_keys(&keys)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.status)
            .collect::<Vec<_>>();
        assert_eq!(
            statuses,
            [
                KeyStatus::Live {
                    record_id: created.results[0].record_id.clone()
                },
                KeyStatus::Deleted,
                KeyStatus::NotFound,
            ]
        );

        service.clear_keys(&keys[1..2]).await.unwrap();
        let after = service.get_record_ids_for_keys(&keys[1..2]).await.unwrap();
        assert_eq!(after[0].status, KeyStatus::NotFound);
    }

    #[tokio::test]
    async fn creation_rejects_taken_keys_and_bad_enum_values() {
        let service = MemoryLabelingService::new();
        let dataset = service.create_dataset("frames").await;
        service
            .create_schema(&MetadataFieldSpec::enumeration("weather", ["rain", "sun"]))
            .await
            .unwrap();
        let weather = service
            .get_metadata_ontology()
            .await
            .unwrap()
            .field("weather")
            .cloned()
            .unwrap();

        let mut bad = upload("b");
        bad.metadata_fields.push(MetadataValue {
            schema_id: weather.schema_id.clone(),
            value: "hail".into(),
        });
        let outcome = service
            .create_records(&dataset, vec![upload("a"), upload("a"), bad])
            .await
            .unwrap();
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.errors.len(), 2);
    }

    #[tokio::test]
    async fn schema_creation_and_option_appends() {
        let service = MemoryLabelingService::new();
        service
            .create_schema(&MetadataFieldSpec::enumeration("weather", ["rain"]))
            .await
            .unwrap();
        assert!(matches!(
            service
                .create_schema(&MetadataFieldSpec::new("weather", MetadataKind::String))
                .await,
            Err(LabelingError::FieldExists(_))
        ));

        let id = service.get_metadata_ontology().await.unwrap().fields[0]
            .schema_id
            .clone();
        service
            .add_enum_options(&id, &["rain".to_string(), "fog".to_string()])
            .await
            .unwrap();
        let field = service.get_metadata_ontology().await.unwrap().fields[0].clone();
        assert_eq!(
            field.options.iter().map(|o| o.name.as_str()).collect::<Vec<_>>(),
            ["rain", "fog"]
        );
    }

    #[tokio::test]
    async fn upsert_replaces_and_adds_fields() {
        let service = MemoryLabelingService::new();
        let dataset = service.create_dataset("frames").await;
        service
            .create_schema(&MetadataFieldSpec::new("note", MetadataKind::String))
            .await
            .unwrap();
        service
            .create_schema(&MetadataFieldSpec::new("score", MetadataKind::Number))
            .await
            .unwrap();
        let ontology = service.get_metadata_ontology().await.unwrap();
        let note = ontology.field("note").unwrap().schema_id.clone();
        let score = ontology.field("score").unwrap().schema_id.clone();

        let mut first = upload("a");
        first.metadata_fields.push(MetadataValue {
            schema_id: note.clone(),
            value: "old".into(),
        });
        let created = service.create_records(&dataset, vec![first]).await.unwrap();
        let record_id = created.results[0].record_id.clone();

        let errors = service
            .bulk_upsert(vec![
                RecordMetadata {
                    record_id: record_id.clone(),
                    fields: vec![
                        MetadataValue { schema_id: note.clone(), value: "new".into() },
                        MetadataValue { schema_id: score.clone(), value: "3".into() },
                    ],
                },
                RecordMetadata {
                    record_id: "missing".into(),
                    fields: Vec::new(),
                },
            ])
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].record_id, "missing");

        let exported = service.bulk_export(&[record_id]).await.unwrap();
        assert_eq!(
            exported[0].fields,
            vec![
                MetadataValue { schema_id: note, value: "new".into() },
                MetadataValue { schema_id: score, value: "3".into() },
            ]
        );
    }

    #[tokio::test]
    async fn state_files_round_trip() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("labeling.json");
        assert_eq!(load_state_file(&path).await.unwrap(), LabelingState::default());

        let service = MemoryLabelingService::new();
        let dataset = service.create_dataset("frames").await;
        service.create_records(&dataset, vec![upload("a")]).await.unwrap();
        save_state_file(&path, &service.state().await).await.unwrap();

        let restored = MemoryLabelingService::from_state(load_state_file(&path).await.unwrap());
        let rows = restored.export_rows(&dataset, true).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].global_key.as_deref(), Some("a"));
    }
}
