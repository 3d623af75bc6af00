use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use shelf_sync::{ConfigFile, EnrichmentPipeline, PgBookStore, PipelineConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_FILE: &str = "shelf.yaml";

#[derive(Debug, Parser)]
#[command(name = "shelf-cli")]
#[command(about = "Catalog deduplication and metadata enrichment")]
struct Cli {
    /// YAML config overriding environment settings (defaults to ./shelf.yaml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Deduplicate and enrich the cleaned catalog (default).
    Run(RunArgs),
    /// Normalize and deduplicate only; no network.
    Dedup {
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Apply database migrations to DATABASE_URL.
    Migrate,
    /// Insert the enriched output into DATABASE_URL, skipping known book keys.
    Load {
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    #[arg(long)]
    input: Option<PathBuf>,
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    #[arg(long)]
    workers: Option<usize>,
    /// Re-attempt records already in the checkpoint.
    #[arg(long)]
    refresh: bool,
    /// google-books, koha-opac or fixtures.
    #[arg(long)]
    source: Option<String>,
}

fn load_config(explicit: Option<&Path>) -> Result<PipelineConfig> {
    let config = PipelineConfig::from_env()?;
    let file = match explicit {
        Some(path) => Some(ConfigFile::load(path)?),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            Some(ConfigFile::load(Path::new(DEFAULT_CONFIG_FILE))?)
        }
        None => None,
    };
    Ok(match file {
        Some(file) => config.overlay(file),
        None => config,
    })
}

fn apply_run_args(mut config: PipelineConfig, args: RunArgs) -> Result<PipelineConfig> {
    if let Some(input) = args.input {
        config.input_csv = input;
    }
    if let Some(output) = args.output {
        config.output_json = output;
    }
    if let Some(checkpoint) = args.checkpoint {
        config.checkpoint_path = checkpoint;
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if args.refresh {
        config.force_refresh = true;
    }
    if let Some(source) = args.source {
        config.source = source.parse()?;
    }
    Ok(config.clamped())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shelf=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            let config = apply_run_args(config, args)?;
            info!(
                input = %config.input_csv.display(),
                source = %config.source,
                workers = config.workers,
                refresh = config.force_refresh,
                "starting enrichment run"
            );
            let summary = EnrichmentPipeline::new(config)?.run_once().await?;
            println!(
                "enrichment complete: run_id={} processed={} FOUND={} MISSING={} duplicates_removed={} output={} reports={}",
                summary.run_id,
                summary.processed,
                summary.found,
                summary.missing,
                summary.duplicates_removed,
                summary.output_path,
                summary.reports_dir
            );
        }
        Commands::Dedup { input } => {
            let mut config = config;
            if let Some(input) = input {
                config.input_csv = input;
            }
            let summary = shelf_sync::dedup_only(&config).await?;
            println!(
                "dedup complete: rows={} dropped={} unique={} duplicates_removed={} review_candidates={} report={}",
                summary.input_rows,
                summary.dropped_rows,
                summary.survivors,
                summary.duplicates_removed,
                summary.review_candidates,
                summary.report_path
            );
        }
        Commands::Migrate => {
            let database_url = config.database_url.context("DATABASE_URL is not set")?;
            PgBookStore::connect(&database_url).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Load { output } => {
            let output = output.unwrap_or_else(|| config.output_json.clone());
            let database_url = config.database_url.context("DATABASE_URL is not set")?;
            let store = PgBookStore::connect(&database_url).await?;
            let inserted = shelf_sync::load_into_sink(&output, &store).await?;
            println!("load complete: inserted={inserted} from={}", output.display());
        }
    }

    Ok(())
}
