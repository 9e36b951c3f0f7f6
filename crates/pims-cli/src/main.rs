use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pims_mapping::StaticMappingConfig;
use pims_pipeline::{pipeline_from_config, PipelineConfig};

#[derive(Debug, Parser)]
#[command(name = "pims-cli")]
#[command(about = "PIMS command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Upload one insurer policy file and process it end to end.
    Ingest {
        /// Path to the CSV or Excel file
        file: PathBuf,
        /// Insurer identifier the file belongs to
        #[arg(long)]
        insurer: String,
        /// Policy type hint; resolved from configuration when omitted
        #[arg(long)]
        policy_type: Option<String>,
        /// Treat the file as a correction upload
        #[arg(long)]
        correction: bool,
        #[arg(long, default_value = "pims-cli")]
        uploaded_by: String,
    },
    /// List insurers present in the static mapping configuration.
    Insurers,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::Ingest {
            file,
            insurer,
            policy_type,
            correction,
            uploaded_by,
        } => {
            let pipeline = pipeline_from_config(&config)?;
            let bytes = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let filename = file
                .file_name()
                .and_then(|n| n.to_str())
                .context("file path has no usable filename")?;

            let file_kind_hint = correction.then_some("correction");
            let job_id = pipeline
                .upload_and_create_job(filename, &bytes, &insurer, &uploaded_by, file_kind_hint)
                .await?;
            let summary = pipeline
                .trigger_processing(&job_id, policy_type.as_deref())
                .await?;

            println!(
                "ingest {}: job_id={} insurer={} policy_type={} total={} created={} failures={}",
                summary.status,
                summary.job_id,
                summary.insurer_id,
                summary.policy_type.as_deref().unwrap_or("-"),
                summary.total_records,
                summary.created_policies,
                summary.verification_failures,
            );
            if let Some(reason) = &summary.failure_reason {
                println!("failure reason: {reason}");
            }
        }
        Commands::Insurers => {
            let static_config = StaticMappingConfig::from_path(&config.mapping_config_path)?;
            for insurer_id in static_config.insurer_ids() {
                println!("{insurer_id}");
            }
        }
    }

    Ok(())
}
