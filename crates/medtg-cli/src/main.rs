use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use medtg_detect::DEFAULT_CONFIDENCE_THRESHOLD;
use medtg_pipeline::{init_logging, run_plan, run_scheduled, PipelinePlan, Settings};
use medtg_scrape::{load_channels, FetchOptions, GatewayConfig, HttpGatewaySource, MessageFetcher};
use medtg_storage::{HttpClientConfig, MediaStore, PartitionStore};
use medtg_warehouse::{Warehouse, DEFAULT_SCHEMA, MESSAGES_TABLE};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "medtg")]
#[command(about = "Medical Telegram channel ingestion and enrichment pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LoadMode {
    Json,
    Csv,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch recent channel history into date/channel partition files.
    Scrape {
        #[arg(long)]
        channels: Option<PathBuf>,
        #[arg(long, default_value_t = 3)]
        days: i64,
        #[arg(long, default_value_t = 500)]
        limit: usize,
    },
    /// Load partition files or a detection CSV into the warehouse.
    Load {
        #[arg(long, default_value = DEFAULT_SCHEMA)]
        schema: String,
        #[arg(long, default_value = MESSAGES_TABLE)]
        table: String,
        #[arg(long)]
        source: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = LoadMode::Json)]
        mode: LoadMode,
    },
    /// Run object detection over downloaded images and write the CSV.
    Detect {
        #[arg(long)]
        image_root: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        model: Option<PathBuf>,
        #[arg(long, default_value_t = DEFAULT_CONFIDENCE_THRESHOLD)]
        conf: f64,
    },
    /// Run the daily pipeline once, or on its cron schedule.
    Pipeline {
        #[arg(long)]
        once: bool,
    },
}

impl Commands {
    fn component(&self) -> &'static str {
        match self {
            Commands::Scrape { .. } => "scraper",
            Commands::Load { .. } => "loader",
            Commands::Detect { .. } => "yolo",
            Commands::Pipeline { .. } => "pipeline",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env()?;
    let _guard = init_logging(&settings.log_dir, cli.command.component())?;

    match cli.command {
        Commands::Scrape { channels, days, limit } => {
            let channels_file = channels.unwrap_or_else(|| settings.channels_file());
            let channels = load_channels(&channels_file)?;
            if channels.is_empty() {
                warn!(path = %channels_file.display(), "no channels configured");
                return Ok(());
            }

            let source = HttpGatewaySource::new(
                GatewayConfig {
                    base_url: settings.telegram.gateway_url.clone(),
                    api_id: settings.telegram.api_id,
                    api_hash: settings.telegram.api_hash.clone(),
                    session_path: settings.session_path(),
                },
                HttpClientConfig::default(),
            )?;
            let fetcher = MessageFetcher::new(
                Arc::new(source),
                PartitionStore::new(settings.raw_json_root()),
                MediaStore::new(settings.image_root()),
                settings.telegram.phone_number.clone(),
            );
            let summary = fetcher.run(&channels, FetchOptions { days, limit }).await?;
            println!(
                "scrape complete: files={} records={} empty={} abandoned={}",
                summary.written.len(),
                summary.records(),
                summary.empty.len(),
                summary.abandoned.len()
            );
        }
        Commands::Load {
            schema,
            table,
            source,
            mode,
        } => {
            let warehouse = Warehouse::new(&settings.warehouse);
            let report = match mode {
                LoadMode::Json => {
                    let source = source.unwrap_or_else(|| settings.raw_json_root());
                    warehouse.load_json(&schema, &table, &source).await?
                }
                LoadMode::Csv => {
                    let source = source.unwrap_or_else(|| settings.detections_csv());
                    warehouse.load_csv(&schema, &table, &source).await?
                }
            };
            println!(
                "load complete: read={} inserted={} skipped={}",
                report.read, report.inserted, report.skipped
            );
        }
        Commands::Detect {
            image_root,
            output,
            model,
            conf,
        } => {
            let image_root = image_root.unwrap_or_else(|| settings.image_root());
            let output = output.unwrap_or_else(|| settings.detections_csv());
            let model = model.unwrap_or_else(|| settings.model_path.clone());
            let summary =
                medtg_detect::detect(&image_root, &output, &model, conf, &settings.detector_command).await?;
            println!(
                "detect complete: images={} skipped={} rows={}",
                summary.images, summary.skipped, summary.rows
            );
        }
        Commands::Pipeline { once } => {
            let exe = std::env::current_exe().context("locating the medtg executable")?;
            let plan = PipelinePlan::daily(&settings, &exe);
            if once {
                let summary = run_plan(&plan).await?;
                info!(run_id = %summary.run_id, "pipeline pass finished");
                println!(
                    "pipeline complete: run_id={} steps={}",
                    summary.run_id, summary.steps_completed
                );
            } else {
                run_scheduled(&settings, plan).await?;
            }
        }
    }

    Ok(())
}
