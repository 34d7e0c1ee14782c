use std::collections::{BTreeMap, HashSet};

use ltb_adapters::{CreatedRecord, KeyStatus, LabelingService};
use ltb_core::{ConfigurationError, DuplicatePolicy, UploadRecord, MAX_GLOBAL_KEY_LEN};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    pub policy: DuplicatePolicy,
    pub batch_size: usize,
    pub max_resolution_passes: usize,
}

impl UploadOptions {
    pub fn from_config(config: &SyncConfig, policy: DuplicatePolicy) -> Self {
        Self {
            policy,
            batch_size: config.batch_size,
            max_resolution_passes: config.max_resolution_passes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenamedKey {
    pub original: String,
    pub renamed: String,
}

/// The first batch the labeling service rejected. Later batches were not sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub batch_index: usize,
    pub errors: Vec<String>,
    /// Records of the failed batch the service accepted anyway.
    pub partial_results: Vec<CreatedRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    /// Records created by fully successful batches.
    pub results: Vec<CreatedRecord>,
    /// Keys dropped because a live record already holds them.
    pub skipped: Vec<String>,
    pub renamed: Vec<RenamedKey>,
    /// Keys released from deleted records before reuse.
    pub cleared: Vec<String>,
    pub failed_batch: Option<BatchFailure>,
}

impl UploadReport {
    pub fn is_success(&self) -> bool {
        self.failed_batch.is_none()
    }
}

struct Candidate {
    position: usize,
    original: String,
    attempts: usize,
    record: UploadRecord,
}

/// `base_n`, shortening `base` so the result stays a valid global key.
fn suffixed(base: &str, n: usize) -> String {
    let suffix = format!("_{n}");
    let keep = MAX_GLOBAL_KEY_LEN.saturating_sub(suffix.len());
    let mut key = base.chars().take(keep).collect::<String>();
    key.push_str(&suffix);
    key
}

/// Resolves key collisions against the labeling service, then creates the
/// remaining records in batches, stopping at the first batch with errors.
pub async fn upload_records(
    labeling: &dyn LabelingService,
    dataset_id: &str,
    records: BTreeMap<String, UploadRecord>,
    options: &UploadOptions,
) -> Result<UploadReport, SyncError> {
    if options.batch_size == 0 {
        return Err(ConfigurationError::ZeroBatchSize.into());
    }

    let mut report = UploadReport::default();
    let mut pending = records
        .into_values()
        .enumerate()
        .map(|(position, record)| Candidate {
            position,
            original: record.global_key.clone(),
            attempts: 0,
            record,
        })
        .collect::<Vec<_>>();
    let mut ready: Vec<Candidate> = Vec::new();
    let mut passes = 0;

    while !pending.is_empty() {
        if passes == options.max_resolution_passes {
            return Err(SyncError::ResolutionExhausted(passes));
        }
        passes += 1;

        let keys = pending
            .iter()
            .map(|c| c.record.global_key.clone())
            .collect::<Vec<_>>();
        let statuses = labeling.get_record_ids_for_keys(&keys).await?;
        if statuses.len() != keys.len()
            || statuses.iter().zip(&keys).any(|(r, key)| &r.global_key != key)
        {
            return Err(SyncError::KeyResolutionMismatch {
                requested: keys.len(),
                received: statuses.len(),
            });
        }
        let mut taken = keys.iter().cloned().collect::<HashSet<_>>();
        taken.extend(ready.iter().map(|c| c.record.global_key.clone()));

        let mut released = Vec::new();
        let mut next = Vec::new();
        for (mut candidate, resolution) in pending.into_iter().zip(statuses) {
            match resolution.status {
                KeyStatus::NotFound => ready.push(candidate),
                KeyStatus::Deleted => {
                    released.push(candidate.record.global_key.clone());
                    next.push(candidate);
                }
                KeyStatus::Live { record_id } => match options.policy {
                    DuplicatePolicy::Skip => {
                        debug!(key = %candidate.record.global_key, %record_id, "skipping live duplicate");
                        report.skipped.push(candidate.record.global_key);
                    }
                    DuplicatePolicy::Rename => {
                        let renamed = loop {
                            candidate.attempts += 1;
                            let key = suffixed(&candidate.original, candidate.attempts);
                            if !taken.contains(&key) {
                                break key;
                            }
                        };
                        debug!(from = %candidate.record.global_key, to = %renamed, "renaming live duplicate");
                        taken.insert(renamed.clone());
                        candidate.record.global_key = renamed;
                        next.push(candidate);
                    }
                },
            }
        }

        if !released.is_empty() {
            debug!(count = released.len(), "clearing keys held by deleted records");
            labeling.clear_keys(&released).await?;
            report.cleared.extend(released);
        }
        pending = next;
    }

    ready.sort_by_key(|c| c.position);
    report.renamed = ready
        .iter()
        .filter(|c| c.record.global_key != c.original)
        .map(|c| RenamedKey {
            original: c.original.clone(),
            renamed: c.record.global_key.clone(),
        })
        .collect();
    let records = ready.into_iter().map(|c| c.record).collect::<Vec<_>>();

    for (batch_index, batch) in records.chunks(options.batch_size).enumerate() {
        let outcome = labeling.create_records(dataset_id, batch.to_vec()).await?;
        if !outcome.errors.is_empty() {
            warn!(
                dataset = dataset_id,
                batch_index,
                errors = outcome.errors.len(),
                "batch rejected; remaining batches not submitted"
            );
            report.failed_batch = Some(BatchFailure {
                batch_index,
                errors: outcome.errors,
                partial_results: outcome.results,
            });
            break;
        }
        report.results.extend(outcome.results);
    }

    info!(
        dataset = dataset_id,
        created = report.results.len(),
        skipped = report.skipped.len(),
        renamed = report.renamed.len(),
        passes,
        "upload finished"
    );
    Ok(report)
}
