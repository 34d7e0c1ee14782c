use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use ltb_adapters::{load_state_file, save_state_file, MemoryLabelingService};
use ltb_core::{DuplicatePolicy, TableId};
use ltb_storage::ParquetWarehouse;
use ltb_sync::{
    load_job_file, Connector, JobFile, LabelingUpsertRequest, MaterializeRequest, ProjectionSpec,
    PushRequest, SyncConfig, TableUpsertRequest,
};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ltb-cli")]
#[command(about = "Sync labeling records and metadata with warehouse tables")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage labeling datasets.
    Dataset {
        #[command(subcommand)]
        command: DatasetCommands,
    },
    /// Create labeling records from the rows of a warehouse table.
    Push {
        #[arg(long)]
        table: TableId,
        #[arg(long)]
        dataset: String,
        /// YAML job file with column roles and the metadata index.
        #[arg(long)]
        job: PathBuf,
        /// Overrides the job file's duplicate policy.
        #[arg(long)]
        policy: Option<DuplicatePolicy>,
    },
    /// Write every record of a dataset into a new warehouse table.
    Materialize {
        #[arg(long)]
        dataset: String,
        #[arg(long)]
        table: TableId,
        #[arg(long)]
        job: Option<PathBuf>,
    },
    /// Copy labeling metadata into existing warehouse columns.
    UpsertTable {
        #[arg(long)]
        table: TableId,
        #[arg(long)]
        dataset: String,
        #[arg(long)]
        job: PathBuf,
    },
    /// Copy warehouse column values into labeling metadata.
    UpsertLabels {
        #[arg(long)]
        table: TableId,
        #[arg(long)]
        job: PathBuf,
        /// Global keys to push; defaults to the job file's list, then every key.
        #[arg(long = "key")]
        keys: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
enum DatasetCommands {
    Create { name: String },
}

#[derive(Debug, Serialize)]
struct CreatedDataset {
    dataset_id: String,
    name: String,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn global_key_column(job: &JobFile) -> Result<String> {
    job.global_key_col
        .clone()
        .ok_or_else(|| anyhow!("job file must set global_key_col"))
}

fn projection_spec(job: &JobFile) -> Result<ProjectionSpec> {
    let row_data = job
        .row_data_col
        .clone()
        .ok_or_else(|| anyhow!("job file must set row_data_col"))?;
    let mut spec = ProjectionSpec::new(row_data)
        .metadata(job.metadata_index.clone())
        .attachments(job.attachment_index.clone());
    spec.global_key_col = job.global_key_col.clone();
    spec.external_id_col = job.external_id_col.clone();
    Ok(spec)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ltb_sync=info,ltb_adapters=info,warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("reading LTB_* configuration")?;
    let state_path = config.labeling_state_path.clone();
    let labeling = Arc::new(MemoryLabelingService::from_state(
        load_state_file(&state_path).await?,
    ));
    let warehouse = Arc::new(ParquetWarehouse::new(config.warehouse_root.clone()));
    info!(
        state = %state_path.display(),
        warehouse = %warehouse.root().display(),
        "collaborators ready"
    );
    let connector = Connector::new(labeling.clone(), warehouse, config);

    let outcome = run(cli.command, &connector, &labeling).await;
    // Records created before a failure already exist remotely; persist them too.
    save_state_file(&state_path, &labeling.state().await).await?;
    outcome
}

async fn run(
    command: Commands,
    connector: &Connector,
    labeling: &MemoryLabelingService,
) -> Result<()> {
    match command {
        Commands::Dataset {
            command: DatasetCommands::Create { name },
        } => {
            let dataset_id = labeling.create_dataset(&name).await;
            print_json(&CreatedDataset { dataset_id, name })
        }
        Commands::Push {
            table,
            dataset,
            job,
            policy,
        } => {
            let job = load_job_file(&job).await?;
            let outcome = connector
                .create_records_from_table(PushRequest {
                    table,
                    dataset_id: dataset,
                    projection: projection_spec(&job)?,
                    duplicate_policy: policy.or(job.duplicate_policy).unwrap_or_default(),
                })
                .await?;
            print_json(&outcome)
        }
        Commands::Materialize {
            dataset,
            table,
            job,
        } => {
            let job = match job {
                Some(path) => load_job_file(&path).await?,
                None => JobFile::default(),
            };
            let outcome = connector
                .create_table_from_dataset(MaterializeRequest {
                    dataset_id: dataset,
                    table,
                    metadata_index: job.metadata_index,
                })
                .await?;
            print_json(&outcome)
        }
        Commands::UpsertTable {
            table,
            dataset,
            job,
        } => {
            let job = load_job_file(&job).await?;
            let report = connector
                .upsert_table_metadata(TableUpsertRequest {
                    table,
                    dataset_id: dataset,
                    global_key_col: global_key_column(&job)?,
                    metadata_index: job.metadata_index,
                })
                .await?;
            print_json(&report)
        }
        Commands::UpsertLabels { table, job, keys } => {
            let job = load_job_file(&job).await?;
            let global_keys = if !keys.is_empty() {
                Some(keys)
            } else if !job.global_keys.is_empty() {
                Some(job.global_keys.clone())
            } else {
                None
            };
            let report = connector
                .upsert_labeling_metadata(LabelingUpsertRequest {
                    table,
                    global_key_col: global_key_column(&job)?,
                    global_keys,
                    metadata_index: job.metadata_index,
                })
                .await?;
            print_json(&report)
        }
    }
}
