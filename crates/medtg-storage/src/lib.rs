//! Filesystem handoffs (partition files, media, detection CSV) and HTTP
//! fetch utilities shared by the pipeline stages.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use medtg_core::{partition_path, DetectionRecord, RawMessage};
use reqwest::header::RETRY_AFTER;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;
use walkdir::WalkDir;

pub const CRATE_NAME: &str = "medtg-storage";

/// Extensions picked up by the detection stage.
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub path: PathBuf,
    pub byte_size: usize,
    pub records: usize,
}

/// Write `bytes` to `path` through a temp file in the same directory and an
/// atomic rename. An existing file at `path` is replaced.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
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
    Ok(())
}

/// Date/channel partitioned JSON files produced by the scraper.
#[derive(Debug, Clone)]
pub struct PartitionStore {
    root: PathBuf,
}

impl PartitionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a channel batch as a pretty JSON array, keyed by the first
    /// record's date and channel. Returns `None` for an empty batch.
    pub async fn write_partition(&self, records: &[RawMessage]) -> anyhow::Result<Option<StoredFile>> {
        let Some(first) = records.first() else {
            return Ok(None);
        };
        let path = partition_path(&self.root, first.message_date, &first.channel_name);
        let bytes = serde_json::to_vec_pretty(records).context("serializing partition records")?;
        write_atomic(&path, &bytes).await?;
        Ok(Some(StoredFile {
            path,
            byte_size: bytes.len(),
            records: records.len(),
        }))
    }

    /// Every non-hidden `.json` file under the root, in path order.
    pub fn partition_files(&self) -> anyhow::Result<Vec<PathBuf>> {
        discover_files(&self.root, &["json"])
    }
}

/// One partition file read back as loosely typed JSON objects.
#[derive(Debug, Clone)]
pub struct PartitionBatch {
    pub path: PathBuf,
    pub records: Vec<serde_json::Value>,
}

/// Read every partition file under `root`. Each file must hold a JSON array.
pub async fn read_partition_batches(root: &Path) -> anyhow::Result<Vec<PartitionBatch>> {
    let mut batches = Vec::new();
    for path in discover_files(root, &["json"])? {
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let records: Vec<serde_json::Value> =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        batches.push(PartitionBatch { path, records });
    }
    Ok(batches)
}

/// Downloaded media laid out as `<root>/<channel>/<message_id>.jpg`.
#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn media_path(&self, channel_name: &str, message_id: i64) -> PathBuf {
        self.root.join(channel_name).join(format!("{message_id}.jpg"))
    }

    pub async fn store_media(
        &self,
        channel_name: &str,
        message_id: i64,
        bytes: &[u8],
    ) -> anyhow::Result<PathBuf> {
        let path = self.media_path(channel_name, message_id);
        write_atomic(&path, bytes).await?;
        Ok(path)
    }

    pub fn image_files(&self) -> anyhow::Result<Vec<PathBuf>> {
        discover_files(&self.root, &IMAGE_EXTENSIONS)
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// Recursively list regular files under `root` whose extension matches one
/// of `extensions` (case-insensitive). Hidden files are skipped. A missing
/// root yields an empty list.
pub fn discover_files(root: &Path, extensions: &[&str]) -> anyhow::Result<Vec<PathBuf>> {
    if !root.exists() {
        warn!(path = %root.display(), "directory does not exist");
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        if !entry.file_type().is_file() || is_hidden(entry.file_name()) {
            continue;
        }
        let matches = entry
            .path()
            .extension()
            .map(|ext| {
                let ext = ext.to_string_lossy();
                extensions.iter().any(|want| ext.eq_ignore_ascii_case(want))
            })
            .unwrap_or(false);
        if matches {
            files.push(entry.into_path());
        }
    }
    debug!(path = %root.display(), files = files.len(), "discovered files");
    Ok(files)
}

/// Header row of the detection CSV, in column order.
pub const DETECTION_CSV_COLUMNS: [&str; 6] = [
    "message_id",
    "channel_name",
    "image_path",
    "label",
    "confidence",
    "image_category",
];

pub fn detections_to_csv(rows: &[DetectionRecord]) -> anyhow::Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer.serialize(row).context("serializing detection row")?;
    }
    writer.into_inner().context("flushing detection csv")
}

pub async fn write_detections_csv(path: &Path, rows: &[DetectionRecord]) -> anyhow::Result<StoredFile> {
    let bytes = detections_to_csv(rows)?;
    write_atomic(path, &bytes).await?;
    Ok(StoredFile {
        path: path.to_path_buf(),
        byte_size: bytes.len(),
        records: rows.len(),
    })
}

pub fn detections_from_csv(bytes: &[u8]) -> anyhow::Result<Vec<DetectionRecord>> {
    let mut reader = csv::Reader::from_reader(bytes);
    let mut rows = Vec::new();
    for (index, record) in reader.deserialize::<DetectionRecord>().enumerate() {
        rows.push(record.with_context(|| format!("parsing detection csv row {}", index + 1))?);
    }
    Ok(rows)
}

pub async fn read_detections_csv(path: &Path) -> anyhow::Result<Vec<DetectionRecord>> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    detections_from_csv(&bytes).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
    RateLimited,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::RateLimited
    } else if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Wait requested by a rate-limited response, in whole seconds.
pub fn parse_retry_after(value: Option<&str>, default: Duration) -> Duration {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub default_retry_after: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_concurrency: 8,
            backoff: BackoffPolicy::default(),
            default_retry_after: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("rate limited by {url}; retry after {retry_after:?}")]
    RateLimited { retry_after: Duration, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Thin reqwest wrapper: bounded concurrency, retries for server and
/// transport errors, and 429 surfaced as [`FetchError::RateLimited`] so the
/// caller decides how long to wait.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
    default_retry_after: Duration,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            backoff: config.backoff,
            default_retry_after: config.default_retry_after,
        })
    }

    /// Send a request built by `build`, retrying server and transport
    /// failures. `build` is called once per attempt.
    pub async fn send<F>(&self, method: Method, url: &str, build: F) -> Result<Vec<u8>, FetchError>
    where
        F: Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder,
    {
        // The semaphore is never closed; a failed acquire just runs unbounded.
        let _permit = self.limit.acquire().await.ok();
        let span = info_span!("http_fetch", %method, url);

        async {
            let mut attempt = 0usize;
            loop {
                let request = build(self.client.request(method.clone(), url));
                match request.send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().to_string();

                        if status.is_success() {
                            return Ok(resp.bytes().await?.to_vec());
                        }

                        match classify_status(status) {
                            RetryDisposition::RateLimited => {
                                let header = resp
                                    .headers()
                                    .get(RETRY_AFTER)
                                    .and_then(|v| v.to_str().ok());
                                return Err(FetchError::RateLimited {
                                    retry_after: parse_retry_after(header, self.default_retry_after),
                                    url: final_url,
                                });
                            }
                            RetryDisposition::Retryable if attempt < self.backoff.max_retries => {
                                debug!(%status, attempt, "retrying after server error");
                            }
                            _ => {
                                return Err(FetchError::HttpStatus {
                                    status: status.as_u16(),
                                    url: final_url,
                                })
                            }
                        }
                    }
                    Err(err) => {
                        if classify_reqwest_error(&err) == RetryDisposition::Retryable
                            && attempt < self.backoff.max_retries
                        {
                            debug!(error = %err, attempt, "retrying after transport error");
                        } else {
                            return Err(FetchError::Request(err));
                        }
                    }
                }
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                attempt += 1;
            }
        }
        .instrument(span)
        .await
    }

    pub async fn get_bytes<F>(&self, url: &str, build: F) -> Result<Vec<u8>, FetchError>
    where
        F: Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder,
    {
        self.send(Method::GET, url, build).await
    }

    pub async fn get_json<T, F>(&self, url: &str, build: F) -> Result<T, FetchError>
    where
        T: DeserializeOwned,
        F: Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder,
    {
        let body = self.send(Method::GET, url, build).await?;
        decode_json(url, &body)
    }

    pub async fn post_json<B, F>(&self, url: &str, body: &B, build: F) -> Result<Vec<u8>, FetchError>
    where
        B: Serialize + ?Sized,
        F: Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder,
    {
        self.send(Method::POST, url, |req| build(req.json(body))).await
    }
}

fn decode_json<T: DeserializeOwned>(url: &str, body: &[u8]) -> Result<T, FetchError> {
    serde_json::from_slice(body).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })
}
