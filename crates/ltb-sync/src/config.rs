use std::path::{Path, PathBuf};

use anyhow::Context;
use ltb_core::{AttachmentIndex, ConfigurationError, Divider, DuplicatePolicy, MetadataIndex};
use serde::Deserialize;
use tokio::fs;

pub const DEFAULT_BATCH_SIZE: usize = 20_000;
pub const DEFAULT_MAX_RESOLUTION_PASSES: usize = 32;
pub const DEFAULT_INTEGRATION_SOURCE: &str = "BigQuery";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub divider: Divider,
    pub batch_size: usize,
    pub max_resolution_passes: usize,
    /// Value written to the provenance field of every created record.
    pub integration_source: String,
    /// Fail instead of keeping the last row when global keys repeat.
    pub strict_global_keys: bool,
    pub labeling_state_path: PathBuf,
    pub warehouse_root: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            divider: Divider::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_resolution_passes: DEFAULT_MAX_RESOLUTION_PASSES,
            integration_source: DEFAULT_INTEGRATION_SOURCE.to_string(),
            strict_global_keys: false,
            labeling_state_path: PathBuf::from("./state/labeling.json"),
            warehouse_root: PathBuf::from("./warehouse"),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigurationError> {
        let defaults = Self::default();
        let divider = match std::env::var("LTB_DIVIDER") {
            Ok(value) => Divider::new(value)?,
            Err(_) => defaults.divider,
        };
        let config = Self {
            divider,
            batch_size: std::env::var("LTB_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.batch_size),
            max_resolution_passes: std::env::var("LTB_MAX_RESOLUTION_PASSES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_resolution_passes),
            integration_source: std::env::var("LTB_INTEGRATION_SOURCE")
                .unwrap_or(defaults.integration_source),
            strict_global_keys: std::env::var("LTB_STRICT_GLOBAL_KEYS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.strict_global_keys),
            labeling_state_path: std::env::var("LTB_LABELING_STATE")
                .map(PathBuf::from)
                .unwrap_or(defaults.labeling_state_path),
            warehouse_root: std::env::var("LTB_WAREHOUSE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.warehouse_root),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.batch_size == 0 {
            return Err(ConfigurationError::ZeroBatchSize);
        }
        Ok(())
    }
}

/// Per-run job description read from YAML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobFile {
    #[serde(default)]
    pub row_data_col: Option<String>,
    #[serde(default)]
    pub global_key_col: Option<String>,
    #[serde(default)]
    pub external_id_col: Option<String>,
    #[serde(default)]
    pub metadata_index: MetadataIndex,
    #[serde(default)]
    pub attachment_index: AttachmentIndex,
    #[serde(default)]
    pub duplicate_policy: Option<DuplicatePolicy>,
    #[serde(default)]
    pub global_keys: Vec<String>,
}

pub async fn load_job_file(path: impl AsRef<Path>) -> anyhow::Result<JobFile> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
