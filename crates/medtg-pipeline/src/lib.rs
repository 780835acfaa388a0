//! Process-level plumbing: settings, logging and the daily
//! scrape → load → transform → detect → load orchestration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use medtg_core::ConfigError;
use medtg_warehouse::WarehouseConfig;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as fmt_layer, EnvFilter};
use uuid::Uuid;

pub const CRATE_NAME: &str = "medtg-pipeline";

pub const DEFAULT_PIPELINE_CRON: &str = "0 0 4 * * *";

#[derive(Clone)]
pub struct TelegramSettings {
    pub api_id: i64,
    pub api_hash: String,
    pub phone_number: String,
    pub gateway_url: String,
}

impl fmt::Debug for TelegramSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramSettings")
            .field("api_id", &self.api_id)
            .field("api_hash", &"<redacted>")
            .field("phone_number", &self.phone_number)
            .field("gateway_url", &self.gateway_url)
            .finish()
    }
}

/// Process configuration, built once at startup and passed to each stage.
#[derive(Debug, Clone)]
pub struct Settings {
    pub telegram: TelegramSettings,
    pub warehouse: WarehouseConfig,
    pub data_root: PathBuf,
    pub model_path: PathBuf,
    pub detector_command: String,
    pub log_dir: PathBuf,
    pub pipeline_cron: String,
    pub scheduler_enabled: bool,
    pub transform_project_dir: PathBuf,
    pub transform_command: String,
}

impl Settings {
    /// Load `.env` (if present) and read settings from the environment.
    /// Variables already set in the environment take precedence.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(err) = dotenvy::dotenv() {
            if !err.not_found() {
                return Err(ConfigError::Parse {
                    path: PathBuf::from(".env"),
                    message: err.to_string(),
                });
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Ok(Self {
            telegram: TelegramSettings {
                api_id: parse_var(&lookup, "TELEGRAM_API_ID", 0)?,
                api_hash: text("TELEGRAM_API_HASH", ""),
                phone_number: text("TELEGRAM_PHONE_NUMBER", ""),
                gateway_url: text("TELEGRAM_GATEWAY_URL", "http://localhost:8081"),
            },
            warehouse: WarehouseConfig {
                host: text("POSTGRES_HOST", "localhost"),
                port: parse_var(&lookup, "POSTGRES_PORT", 5432)?,
                database: text("POSTGRES_DB", "telegram"),
                user: text("POSTGRES_USER", "warehouse"),
                password: text("POSTGRES_PASSWORD", "warehouse"),
            },
            data_root: PathBuf::from(text("DATA_ROOT", "data")),
            model_path: PathBuf::from(text("YOLO_MODEL_PATH", "weights/yolov8n.pt")),
            detector_command: text("DETECTOR_COMMAND", "yolo-detect"),
            log_dir: PathBuf::from(text("LOG_DIR", "logs")),
            pipeline_cron: text("PIPELINE_CRON", DEFAULT_PIPELINE_CRON),
            scheduler_enabled: parse_flag(&lookup, "PIPELINE_SCHEDULER_ENABLED")?,
            transform_project_dir: PathBuf::from(text("TRANSFORM_PROJECT_DIR", "medical_warehouse")),
            transform_command: text("TRANSFORM_COMMAND", "dbt"),
        })
    }

    pub fn session_path(&self) -> PathBuf {
        self.data_root.join("sessions").join("telegram")
    }

    pub fn raw_json_root(&self) -> PathBuf {
        self.data_root.join("raw").join("telegram_messages")
    }

    pub fn image_root(&self) -> PathBuf {
        self.data_root.join("raw").join("images")
    }

    pub fn detections_csv(&self) -> PathBuf {
        self.data_root.join("yolo").join("detections.csv")
    }

    pub fn channels_file(&self) -> PathBuf {
        self.data_root.join("config").join("channels.yml")
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|err: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("`{raw}`: {err}"),
        }),
    }
}

fn parse_flag<F>(lookup: &F, key: &str) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(false);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("`{raw}` is not a boolean"),
        }),
    }
}

/// Install the global subscriber: `RUST_LOG` filter (default `info`), stderr
/// output and a non-blocking `<log_dir>/<component>.log` file. Keep the
/// returned guard alive until exit so buffered lines are flushed.
pub fn init_logging(log_dir: &Path, component: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let appender = tracing_appender::rolling::never(log_dir, format!("{component}.log"));
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new("info").context("building log filter")?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer::layer().with_writer(std::io::stderr).with_target(true))
        .with(fmt_layer::layer().with_writer(file_writer).with_ansi(false))
        .try_init()
        .context("installing tracing subscriber")?;

    info!(component, log_dir = %log_dir.display(), "logging initialised");
    Ok(guard)
}

/// One external process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCommand {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
}

impl StepCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            current_dir: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStep {
    pub name: String,
    pub commands: Vec<StepCommand>,
}

impl PipelineStep {
    pub fn new(name: impl Into<String>, commands: Vec<StepCommand>) -> Self {
        Self {
            name: name.into(),
            commands,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelinePlan {
    pub steps: Vec<PipelineStep>,
}

impl PipelinePlan {
    pub fn new(steps: Vec<PipelineStep>) -> Self {
        Self { steps }
    }

    /// The daily job. `exe` is the `medtg` binary used for the in-process
    /// stages; the transform stage runs the external modelling tool.
    pub fn daily(settings: &Settings, exe: &Path) -> Self {
        let exe = exe.display().to_string();
        let path = |p: PathBuf| p.display().to_string();
        let transform = |verb: &str| {
            StepCommand::new(settings.transform_command.clone(), [verb])
                .in_dir(settings.transform_project_dir.clone())
        };

        Self::new(vec![
            PipelineStep::new(
                "scrape",
                vec![StepCommand::new(
                    exe.clone(),
                    ["scrape".to_string(), "--channels".into(), path(settings.channels_file()), "--days".into(), "2".into()],
                )],
            ),
            PipelineStep::new(
                "load_raw_messages",
                vec![StepCommand::new(
                    exe.clone(),
                    [
                        "load".to_string(),
                        "--schema".into(),
                        "raw".into(),
                        "--table".into(),
                        "telegram_messages".into(),
                        "--mode".into(),
                        "json".into(),
                        "--source".into(),
                        path(settings.raw_json_root()),
                    ],
                )],
            ),
            PipelineStep::new("transform", vec![transform("deps"), transform("run"), transform("test")]),
            PipelineStep::new(
                "enrich_images",
                vec![
                    StepCommand::new(
                        exe.clone(),
                        [
                            "detect".to_string(),
                            "--image-root".into(),
                            path(settings.image_root()),
                            "--output".into(),
                            path(settings.detections_csv()),
                        ],
                    ),
                    StepCommand::new(
                        exe,
                        [
                            "load".to_string(),
                            "--schema".into(),
                            "raw".into(),
                            "--table".into(),
                            "image_detections".into(),
                            "--mode".into(),
                            "csv".into(),
                            "--source".into(),
                            path(settings.detections_csv()),
                        ],
                    ),
                ],
            ),
        ])
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("step {step} failed: `{command}` exited with {status}")]
    StepFailed {
        step: String,
        command: String,
        status: ExitStatus,
    },
    #[error("step {step} could not start `{command}`: {source}")]
    Spawn {
        step: String,
        command: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps_completed: usize,
}

/// Run every command of every step in order. The first command that cannot
/// be started or exits non-zero ends the run.
pub async fn run_plan(plan: &PipelinePlan) -> Result<PipelineRunSummary, PipelineError> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    info!(%run_id, steps = plan.steps.len(), "pipeline run started");

    let mut steps_completed = 0usize;
    for step in &plan.steps {
        for command in &step.commands {
            let rendered = command.display();
            info!(step = %step.name, command = %rendered, "running step command");

            let mut process = Command::new(&command.program);
            process.args(&command.args).kill_on_drop(true);
            if let Some(dir) = &command.current_dir {
                process.current_dir(dir);
            }
            let status = process.status().await.map_err(|source| PipelineError::Spawn {
                step: step.name.clone(),
                command: rendered.clone(),
                source,
            })?;
            if !status.success() {
                error!(step = %step.name, command = %rendered, %status, "step failed; aborting run");
                return Err(PipelineError::StepFailed {
                    step: step.name.clone(),
                    command: rendered,
                    status,
                });
            }
        }
        steps_completed += 1;
    }

    let finished_at = Utc::now();
    info!(
        %run_id,
        steps_completed,
        elapsed_ms = (finished_at - started_at).num_milliseconds(),
        "pipeline run finished"
    );
    Ok(PipelineRunSummary {
        run_id,
        started_at,
        finished_at,
        steps_completed,
    })
}

/// Register `plan` on `cron` (UTC, with seconds field). A failed run is
/// logged; the next trigger starts the plan from the top.
pub async fn build_scheduler(cron: &str, plan: PipelinePlan) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let plan = Arc::new(plan);
    let job = Job::new_async(cron, move |_uuid, _l| {
        let plan = Arc::clone(&plan);
        Box::pin(async move {
            match run_plan(&plan).await {
                Ok(summary) => info!(run_id = %summary.run_id, "scheduled pipeline run complete"),
                Err(err) => error!(error = %err, "scheduled pipeline run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

pub async fn maybe_build_scheduler(settings: &Settings, plan: PipelinePlan) -> Result<Option<JobScheduler>> {
    if !settings.scheduler_enabled {
        return Ok(None);
    }
    build_scheduler(&settings.pipeline_cron, plan).await.map(Some)
}

/// Start the scheduler and block until Ctrl-C.
pub async fn run_scheduled(settings: &Settings, plan: PipelinePlan) -> Result<()> {
    let Some(mut sched) = maybe_build_scheduler(settings, plan).await? else {
        warn!("PIPELINE_SCHEDULER_ENABLED is not set; nothing scheduled");
        return Ok(());
    };
    sched.start().await.context("starting scheduler")?;
    info!(cron = %settings.pipeline_cron, "pipeline scheduler running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("pipeline scheduler stopped");
    Ok(())
}
