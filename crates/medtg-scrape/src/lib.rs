//! Channel registry, message-source contract, and the channel history
//! fetcher that produces partition files and downloaded media.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use medtg_core::{channel_name_from_identifier, parse_message_timestamp, ConfigError, RawMessage};
use medtg_storage::{FetchError, HttpClientConfig, HttpFetcher, MediaStore, PartitionStore, StoredFile};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "medtg-scrape";

/// Largest page requested from the source in one call.
pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
struct ChannelFile {
    channels: Option<Vec<serde_yaml::Value>>,
}

/// Load the ordered channel list from a YAML document with a `channels` key.
/// Entries are trimmed; null, `false` and blank entries are dropped.
pub fn load_channels(path: impl AsRef<Path>) -> Result<Vec<String>, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file: ChannelFile = serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let entries = file.channels.ok_or_else(|| ConfigError::MissingKey {
        path: path.to_path_buf(),
        key: "channels",
    })?;

    let mut channels = Vec::with_capacity(entries.len());
    for entry in entries {
        let channel = match entry {
            serde_yaml::Value::String(s) => s.trim().to_string(),
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::Null | serde_yaml::Value::Bool(false) => continue,
            other => {
                return Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    message: format!("unsupported channel entry {other:?}"),
                })
            }
        };
        if !channel.is_empty() {
            channels.push(channel);
        }
    }
    Ok(channels)
}

/// One message as delivered by the source, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMessage {
    pub id: i64,
    pub date: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub has_media: bool,
    #[serde(default)]
    pub views: Option<i64>,
    #[serde(default)]
    pub forwards: Option<i64>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("session is not authorized; phone verification required, run `medtg scrape` interactively once")]
    AuthRequired,
    #[error("rate limited; wait {wait:?}")]
    RateLimited { wait: Duration },
    #[error("source protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<FetchError> for SourceError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::RateLimited { retry_after, .. } => SourceError::RateLimited { wait: retry_after },
            FetchError::HttpStatus { status: 401, .. } => SourceError::AuthRequired,
            other => SourceError::Protocol(other.to_string()),
        }
    }
}

/// A connection to the messaging source. One instance is shared by all
/// channel tasks of a run.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn connect(&self) -> Result<(), SourceError>;

    async fn is_authorized(&self) -> Result<bool, SourceError>;

    async fn request_login_code(&self, phone_number: &str) -> Result<(), SourceError>;

    /// Up to `limit` messages strictly older than `offset_id` (or the newest
    /// messages when `offset_id` is 0), newest first.
    async fn fetch_history(
        &self,
        channel: &str,
        offset_id: i64,
        limit: usize,
    ) -> Result<Vec<SourceMessage>, SourceError>;

    async fn download_media(&self, channel: &str, message_id: i64) -> Result<Vec<u8>, SourceError>;

    async fn disconnect(&self) -> Result<(), SourceError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_id: i64,
    pub api_hash: String,
    pub session_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct SessionStatus {
    authorized: bool,
}

/// [`MessageSource`] backed by an HTTP session gateway that holds the user
/// session for the messaging network.
#[derive(Debug)]
pub struct HttpGatewaySource {
    http: HttpFetcher,
    base_url: Url,
    api_id: String,
    api_hash: String,
    session: String,
    authorized: Mutex<Option<bool>>,
}

impl HttpGatewaySource {
    /// Reads the session token from `config.session_path`, creating an empty
    /// session file when none exists yet.
    pub fn new(config: GatewayConfig, http: HttpClientConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        if let Some(parent) = config.session_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating session directory {}", parent.display()))?;
        }
        if !config.session_path.exists() {
            std::fs::write(&config.session_path, b"")
                .with_context(|| format!("creating session file {}", config.session_path.display()))?;
        }
        let session = std::fs::read_to_string(&config.session_path)
            .with_context(|| format!("reading session file {}", config.session_path.display()))?
            .trim()
            .to_string();
        let base_url = Url::parse(&config.base_url)
            .with_context(|| format!("parsing gateway url {}", config.base_url))?;

        Ok(Self {
            http: HttpFetcher::new(http)?,
            base_url,
            api_id: config.api_id.to_string(),
            api_hash: config.api_hash,
            session,
            authorized: Mutex::new(None),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SourceError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SourceError::Protocol(format!("gateway url {} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .push("v1")
            .extend(segments);
        Ok(url)
    }

    async fn session_status(&self) -> Result<bool, SourceError> {
        let url = self.endpoint(&["session"])?;
        let status: SessionStatus = self
            .http
            .get_json(url.as_str(), |req| self.authenticate(req))
            .await?;
        *self.cached_status() = Some(status.authorized);
        Ok(status.authorized)
    }

    fn cached_status(&self) -> std::sync::MutexGuard<'_, Option<bool>> {
        self.authorized.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn authenticate(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("X-Api-Id", &self.api_id)
            .header("X-Api-Hash", &self.api_hash)
            .header("X-Session", &self.session)
    }
}

#[async_trait]
impl MessageSource for HttpGatewaySource {
    /// Opens the session and remembers whether it is authorized, so the
    /// following [`MessageSource::is_authorized`] needs no second request.
    async fn connect(&self) -> Result<(), SourceError> {
        self.session_status().await?;
        Ok(())
    }

    async fn is_authorized(&self) -> Result<bool, SourceError> {
        let cached = *self.cached_status();
        match cached {
            Some(authorized) => Ok(authorized),
            None => self.session_status().await,
        }
    }

    async fn request_login_code(&self, phone_number: &str) -> Result<(), SourceError> {
        let url = self.endpoint(&["session", "code"])?;
        let body = serde_json::json!({ "phone": phone_number });
        self.http
            .post_json(url.as_str(), &body, |req| self.authenticate(req))
            .await?;
        Ok(())
    }

    async fn fetch_history(
        &self,
        channel: &str,
        offset_id: i64,
        limit: usize,
    ) -> Result<Vec<SourceMessage>, SourceError> {
        let url = self.endpoint(&["channels", channel, "messages"])?;
        let query = [("offset_id", offset_id.to_string()), ("limit", limit.to_string())];
        let messages: Vec<SourceMessage> = self
            .http
            .get_json(url.as_str(), |req| self.authenticate(req).query(&query))
            .await?;
        Ok(messages)
    }

    async fn download_media(&self, channel: &str, message_id: i64) -> Result<Vec<u8>, SourceError> {
        let id = message_id.to_string();
        let url = self.endpoint(&["channels", channel, "messages", &id, "media"])?;
        Ok(self
            .http
            .get_bytes(url.as_str(), |req| self.authenticate(req))
            .await?)
    }

    async fn disconnect(&self) -> Result<(), SourceError> {
        *self.cached_status() = None;
        let url = self.endpoint(&["session"])?;
        self.http
            .send(Method::DELETE, url.as_str(), |req| self.authenticate(req))
            .await?;
        Ok(())
    }
}

/// Connected source that is disconnected on every exit path: explicitly via
/// [`SourceSession::close`], or from `Drop` when the owning future is
/// cancelled or unwinds.
pub struct SourceSession {
    source: Arc<dyn MessageSource>,
    open: bool,
}

impl SourceSession {
    pub async fn open(source: Arc<dyn MessageSource>) -> Result<Self, SourceError> {
        source.connect().await?;
        Ok(Self { source, open: true })
    }

    pub fn source(&self) -> &Arc<dyn MessageSource> {
        &self.source
    }

    pub async fn close(mut self) {
        self.open = false;
        if let Err(err) = self.source.disconnect().await {
            warn!(error = %err, "disconnecting from message source failed");
        }
    }
}

impl Drop for SourceSession {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        let source = Arc::clone(&self.source);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = source.disconnect().await;
            });
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub days: i64,
    pub limit: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self { days: 3, limit: 500 }
    }
}

impl FetchOptions {
    /// `now - days`. Negative or out-of-range `days` is a [`ConfigError`].
    pub fn horizon(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, ConfigError> {
        let invalid = |message: &str| ConfigError::InvalidValue {
            key: "days".to_string(),
            message: format!("{}: {message}", self.days),
        };
        if self.days < 0 {
            return Err(invalid("must not be negative"));
        }
        chrono::Duration::try_days(self.days)
            .and_then(|window| now.checked_sub_signed(window))
            .ok_or_else(|| invalid("window is out of range"))
    }
}

#[derive(Debug, Clone)]
pub enum ChannelOutcome {
    Written(StoredFile),
    Empty,
    Abandoned(String),
}

#[derive(Debug, Clone, Default)]
pub struct ScrapeSummary {
    pub written: Vec<StoredFile>,
    pub empty: Vec<String>,
    pub abandoned: Vec<String>,
}

impl ScrapeSummary {
    pub fn records(&self) -> usize {
        self.written.iter().map(|f| f.records).sum()
    }
}

/// Pulls channel history newest-first down to the horizon, downloads media
/// and writes one partition file per channel.
#[derive(Clone)]
pub struct MessageFetcher {
    source: Arc<dyn MessageSource>,
    partitions: PartitionStore,
    media: MediaStore,
    phone_number: String,
    page_size: usize,
}

impl MessageFetcher {
    pub fn new(
        source: Arc<dyn MessageSource>,
        partitions: PartitionStore,
        media: MediaStore,
        phone_number: impl Into<String>,
    ) -> Self {
        Self {
            source,
            partitions,
            media,
            phone_number: phone_number.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Connect, verify authorization, scrape every channel concurrently and
    /// disconnect. An unauthorized session requests a login code and fails
    /// with [`SourceError::AuthRequired`].
    pub async fn run(&self, channels: &[String], options: FetchOptions) -> Result<ScrapeSummary, SourceError> {
        options.horizon(Utc::now())?;
        let session = SourceSession::open(Arc::clone(&self.source)).await?;
        let result = self.run_connected(&session, channels, options).await;
        session.close().await;
        result
    }

    async fn run_connected(
        &self,
        session: &SourceSession,
        channels: &[String],
        options: FetchOptions,
    ) -> Result<ScrapeSummary, SourceError> {
        if !session.source().is_authorized().await? {
            session.source().request_login_code(&self.phone_number).await?;
            return Err(SourceError::AuthRequired);
        }
        self.scrape_channels(channels, options).await
    }

    /// Scrape channels as independent tasks. A protocol failure only
    /// abandons its own channel; any other error ends the run.
    pub async fn scrape_channels(
        &self,
        channels: &[String],
        options: FetchOptions,
    ) -> Result<ScrapeSummary, SourceError> {
        let mut tasks = JoinSet::new();
        for channel in channels {
            let fetcher = self.clone();
            let channel = channel.clone();
            tasks.spawn(async move {
                let outcome = fetcher.scrape_channel(&channel, options).await;
                (channel, outcome)
            });
        }

        let mut summary = ScrapeSummary::default();
        while let Some(joined) = tasks.join_next().await {
            let (channel, outcome) =
                joined.map_err(|e| SourceError::Storage(anyhow::anyhow!("channel task failed: {e}")))?;
            match outcome? {
                ChannelOutcome::Written(file) => summary.written.push(file),
                ChannelOutcome::Empty => summary.empty.push(channel),
                ChannelOutcome::Abandoned(_) => summary.abandoned.push(channel),
            }
        }
        Ok(summary)
    }

    pub async fn scrape_channel(&self, channel: &str, options: FetchOptions) -> Result<ChannelOutcome, SourceError> {
        let span = info_span!("scrape_channel", channel);
        async {
            info!("scraping channel");
            let horizon = options.horizon(Utc::now())?;
            let records = match self.collect_channel(channel, horizon, options.limit).await {
                Ok(records) => records,
                Err(SourceError::Protocol(message)) => {
                    error!(error = %message, "failed to scrape channel; skipping");
                    return Ok(ChannelOutcome::Abandoned(message));
                }
                Err(other) => return Err(other),
            };

            match self.partitions.write_partition(&records).await? {
                Some(file) => {
                    info!(records = file.records, path = %file.path.display(), "wrote partition file");
                    Ok(ChannelOutcome::Written(file))
                }
                None => {
                    info!("no records for channel");
                    Ok(ChannelOutcome::Empty)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn collect_channel(
        &self,
        channel: &str,
        horizon: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RawMessage>, SourceError> {
        let channel_name = channel_name_from_identifier(channel);
        let mut records = Vec::new();
        let mut offset_id = 0i64;

        'pages: while records.len() < limit {
            let page_size = (limit - records.len()).min(self.page_size);
            let page = match self.source.fetch_history(channel, offset_id, page_size).await {
                Ok(page) => page,
                Err(SourceError::RateLimited { wait }) => {
                    warn!(wait_secs = wait.as_secs(), "rate limited while reading history");
                    tokio::time::sleep(wait).await;
                    continue;
                }
                Err(other) => return Err(other),
            };
            if page.is_empty() {
                break;
            }

            let previous_offset = offset_id;
            for message in page {
                if records.len() >= limit {
                    break 'pages;
                }
                let message_date = parse_message_timestamp(&message.date).ok_or_else(|| {
                    SourceError::Protocol(format!(
                        "message {} has unparsable date `{}`",
                        message.id, message.date
                    ))
                })?;
                if message_date < horizon {
                    break 'pages;
                }
                offset_id = message.id;

                let image_path = if message.has_media {
                    let bytes = self.download_with_wait(channel, message.id).await?;
                    let path = self.media.store_media(&channel_name, message.id, &bytes).await?;
                    Some(path.display().to_string())
                } else {
                    None
                };

                records.push(RawMessage {
                    message_id: message.id,
                    channel_name: channel_name.clone(),
                    message_date,
                    message_text: message.message,
                    has_media: message.has_media,
                    image_path,
                    views: message.views.unwrap_or(0),
                    forwards: message.forwards.unwrap_or(0),
                });
            }

            if offset_id == previous_offset {
                break;
            }
        }

        Ok(records)
    }

    async fn download_with_wait(&self, channel: &str, message_id: i64) -> Result<Vec<u8>, SourceError> {
        loop {
            match self.source.download_media(channel, message_id).await {
                Err(SourceError::RateLimited { wait }) => {
                    warn!(message_id, wait_secs = wait.as_secs(), "rate limited while downloading media");
                    tokio::time::sleep(wait).await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use medtg_core::partition_path;
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct ScriptedSource {
        authorized: bool,
        history: HashMap<String, Vec<SourceMessage>>,
        failing: HashSet<String>,
        rate_limit_next_page: AtomicBool,
        rate_limit_after_pages: Mutex<Option<usize>>,
        attempts: Mutex<Vec<i64>>,
        connects: AtomicUsize,
        disconnects: AtomicUsize,
        code_requests: Mutex<Vec<String>>,
        offsets: Mutex<Vec<i64>>,
    }

    impl ScriptedSource {
        fn authorized() -> Self {
            Self {
                authorized: true,
                ..Default::default()
            }
        }

        fn with_channel(mut self, channel: &str, messages: Vec<SourceMessage>) -> Self {
            self.history.insert(channel.to_string(), messages);
            self
        }
    }

    #[async_trait]
    impl MessageSource for ScriptedSource {
        async fn connect(&self) -> Result<(), SourceError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn is_authorized(&self) -> Result<bool, SourceError> {
            Ok(self.authorized)
        }

        async fn request_login_code(&self, phone_number: &str) -> Result<(), SourceError> {
            self.code_requests.lock().unwrap().push(phone_number.to_string());
            Ok(())
        }

        async fn fetch_history(
            &self,
            channel: &str,
            offset_id: i64,
            limit: usize,
        ) -> Result<Vec<SourceMessage>, SourceError> {
            if self.failing.contains(channel) {
                return Err(SourceError::Protocol("CHANNEL_PRIVATE".into()));
            }
            self.attempts.lock().unwrap().push(offset_id);
            let scheduled = {
                let mut pending = self.rate_limit_after_pages.lock().unwrap();
                match *pending {
                    Some(0) => {
                        *pending = None;
                        true
                    }
                    Some(n) => {
                        *pending = Some(n - 1);
                        false
                    }
                    None => false,
                }
            };
            if scheduled || self.rate_limit_next_page.swap(false, Ordering::SeqCst) {
                return Err(SourceError::RateLimited {
                    wait: Duration::from_millis(5),
                });
            }
            self.offsets.lock().unwrap().push(offset_id);
            let messages = self.history.get(channel).cloned().unwrap_or_default();
            Ok(messages
                .into_iter()
                .filter(|m| offset_id == 0 || m.id < offset_id)
                .take(limit)
                .collect())
        }

        async fn download_media(&self, _channel: &str, message_id: i64) -> Result<Vec<u8>, SourceError> {
            Ok(format!("jpeg-{message_id}").into_bytes())
        }

        async fn disconnect(&self) -> Result<(), SourceError> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn msg(id: i64, age: chrono::Duration, has_media: bool) -> SourceMessage {
        SourceMessage {
            id,
            date: (Utc::now() - age).to_rfc3339(),
            message: Some(format!("post {id}")),
            has_media,
            views: Some(id * 10),
            forwards: None,
        }
    }

    fn five_messages() -> Vec<SourceMessage> {
        vec![
            msg(105, chrono::Duration::hours(1), true),
            msg(104, chrono::Duration::hours(5), false),
            msg(103, chrono::Duration::hours(30), true),
            msg(102, chrono::Duration::days(3), true),
            msg(101, chrono::Duration::days(4), false),
        ]
    }

    fn fetcher(source: Arc<dyn MessageSource>, root: &Path) -> MessageFetcher {
        MessageFetcher::new(
            source,
            PartitionStore::new(root.join("raw")),
            MediaStore::new(root.join("images")),
            "+251900000000",
        )
    }

    #[test]
    fn channel_file_is_trimmed_and_filtered_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("channels.yml");
        std::fs::write(
            &path,
            "channels:\n  - ' chemed_pharma '\n  - ''\n  - null\n  - https://t.me/lobelia4cosmetics\n  - tikvahpharma\n",
        )
        .unwrap();
        assert_eq!(
            load_channels(&path).unwrap(),
            vec!["chemed_pharma", "https://t.me/lobelia4cosmetics", "tikvahpharma"]
        );
    }

    #[test]
    fn channel_file_errors_are_config_errors() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            load_channels(dir.path().join("missing.yml")),
            Err(ConfigError::Read { .. })
        ));

        let malformed = dir.path().join("malformed.yml");
        std::fs::write(&malformed, "channels: [unclosed").unwrap();
        assert!(matches!(load_channels(&malformed), Err(ConfigError::Parse { .. })));

        let no_key = dir.path().join("no_key.yml");
        std::fs::write(&no_key, "sources: []\n").unwrap();
        assert!(matches!(load_channels(&no_key), Err(ConfigError::MissingKey { .. })));
    }

    #[tokio::test]
    async fn window_stops_at_first_message_older_than_horizon() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::authorized().with_channel("chemed_pharma", five_messages()));
        let fetcher = fetcher(source, dir.path());

        let summary = fetcher
            .run(&["chemed_pharma".to_string()], FetchOptions { days: 2, limit: 500 })
            .await
            .unwrap();

        assert_eq!(summary.written.len(), 1);
        let file = &summary.written[0];
        assert_eq!(file.records, 3);

        let records: Vec<RawMessage> =
            serde_json::from_str(&std::fs::read_to_string(&file.path).unwrap()).unwrap();
        assert_eq!(records.iter().map(|r| r.message_id).collect::<Vec<_>>(), vec![105, 104, 103]);
        for record in &records {
            assert_eq!(record.has_media, record.image_path.is_some());
            assert_eq!(record.channel_name, "chemed_pharma");
            assert_eq!(record.forwards, 0);
        }
        assert_eq!(
            file.path,
            partition_path(dir.path().join("raw"), records[0].message_date, "chemed_pharma")
        );
        assert!(dir.path().join("images/chemed_pharma/105.jpg").exists());
        assert!(dir.path().join("images/chemed_pharma/103.jpg").exists());
        assert!(!dir.path().join("images/chemed_pharma/102.jpg").exists());
    }

    #[tokio::test]
    async fn paging_resumes_after_rate_limit_without_losing_records() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::authorized().with_channel("chemed_pharma", five_messages()));
        let fetcher = fetcher(source.clone(), dir.path()).with_page_size(2);

        let first = fetcher
            .scrape_channel("chemed_pharma", FetchOptions { days: 2, limit: 500 })
            .await
            .unwrap();
        assert!(matches!(first, ChannelOutcome::Written(ref f) if f.records == 3));
        assert_eq!(*source.offsets.lock().unwrap(), vec![0, 104]);

        source.offsets.lock().unwrap().clear();
        source.rate_limit_next_page.store(true, Ordering::SeqCst);
        let second = fetcher
            .scrape_channel("chemed_pharma", FetchOptions { days: 2, limit: 500 })
            .await
            .unwrap();
        assert!(matches!(second, ChannelOutcome::Written(ref f) if f.records == 3));
        assert_eq!(*source.offsets.lock().unwrap(), vec![0, 104]);
    }

    #[tokio::test]
    async fn rate_limit_mid_channel_keeps_collected_records() {
        let dir = tempdir().unwrap();
        let source = ScriptedSource::authorized().with_channel("chemed_pharma", five_messages());
        *source.rate_limit_after_pages.lock().unwrap() = Some(1);
        let source = Arc::new(source);
        let fetcher = fetcher(source.clone(), dir.path()).with_page_size(2);

        let outcome = fetcher
            .scrape_channel("chemed_pharma", FetchOptions { days: 2, limit: 500 })
            .await
            .unwrap();

        let file = match outcome {
            ChannelOutcome::Written(file) => file,
            other => panic!("expected a partition file, got {other:?}"),
        };
        let records: Vec<RawMessage> =
            serde_json::from_str(&std::fs::read_to_string(&file.path).unwrap()).unwrap();
        assert_eq!(records.iter().map(|r| r.message_id).collect::<Vec<_>>(), vec![105, 104, 103]);
        assert_eq!(*source.attempts.lock().unwrap(), vec![0, 104, 104]);
        assert_eq!(*source.offsets.lock().unwrap(), vec![0, 104]);
    }

    #[tokio::test]
    async fn invalid_day_windows_fail_before_connecting() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::authorized().with_channel("chemed_pharma", five_messages()));
        let fetcher = fetcher(source.clone(), dir.path());

        for days in [-1, i64::MAX / 1000] {
            let err = fetcher
                .run(&["chemed_pharma".to_string()], FetchOptions { days, limit: 500 })
                .await
                .unwrap_err();
            assert!(matches!(err, SourceError::Config(ConfigError::InvalidValue { .. })));
        }
        assert_eq!(source.connects.load(Ordering::SeqCst), 0);
        assert!(FetchOptions { days: 0, limit: 1 }.horizon(Utc::now()).is_ok());
    }

    #[tokio::test]
    async fn limit_caps_records_per_channel() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::authorized().with_channel("chemed_pharma", five_messages()));
        let outcome = fetcher(source, dir.path())
            .scrape_channel("chemed_pharma", FetchOptions { days: 30, limit: 2 })
            .await
            .unwrap();
        assert!(matches!(outcome, ChannelOutcome::Written(ref f) if f.records == 2));
    }

    #[tokio::test]
    async fn protocol_failure_abandons_only_that_channel() {
        let dir = tempdir().unwrap();
        let mut source = ScriptedSource::authorized()
            .with_channel("chemed_pharma", five_messages())
            .with_channel("quiet_channel", vec![msg(1, chrono::Duration::days(9), false)]);
        source.failing.insert("private_channel".to_string());
        let fetcher = fetcher(Arc::new(source), dir.path());

        let summary = fetcher
            .run(
                &[
                    "private_channel".to_string(),
                    "chemed_pharma".to_string(),
                    "quiet_channel".to_string(),
                ],
                FetchOptions { days: 2, limit: 500 },
            )
            .await
            .unwrap();

        assert_eq!(summary.written.len(), 1);
        assert_eq!(summary.records(), 3);
        assert_eq!(summary.abandoned, vec!["private_channel".to_string()]);
        assert_eq!(summary.empty, vec!["quiet_channel".to_string()]);
        let files = PartitionStore::new(dir.path().join("raw")).partition_files().unwrap();
        assert_eq!(files, vec![summary.written[0].path.clone()]);
    }

    #[tokio::test]
    async fn unauthorized_session_requests_code_and_still_disconnects() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::default().with_channel("chemed_pharma", five_messages()));
        let fetcher = fetcher(source.clone(), dir.path());

        let err = fetcher
            .run(&["chemed_pharma".to_string()], FetchOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SourceError::AuthRequired));
        assert_eq!(source.connects.load(Ordering::SeqCst), 1);
        assert_eq!(source.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(*source.code_requests.lock().unwrap(), vec!["+251900000000".to_string()]);
        assert!(!dir.path().join("raw").exists());
    }

    #[tokio::test]
    async fn url_identifiers_write_under_bare_channel_name() {
        let dir = tempdir().unwrap();
        let source = Arc::new(
            ScriptedSource::authorized().with_channel("https://t.me/lobelia4cosmetics", five_messages()),
        );
        let outcome = fetcher(source, dir.path())
            .scrape_channel("https://t.me/lobelia4cosmetics", FetchOptions { days: 2, limit: 500 })
            .await
            .unwrap();
        let ChannelOutcome::Written(file) = outcome else {
            panic!("expected a partition file");
        };
        assert_eq!(file.path.file_name().unwrap(), "lobelia4cosmetics.json");
        assert!(dir.path().join("images/lobelia4cosmetics/105.jpg").exists());
    }

    #[test]
    fn rate_limit_and_auth_statuses_map_to_source_errors() {
        let limited = SourceError::from(FetchError::RateLimited {
            retry_after: Duration::from_secs(12),
            url: "http://gw/v1".into(),
        });
        assert!(matches!(limited, SourceError::RateLimited { wait } if wait == Duration::from_secs(12)));

        let unauthorized = SourceError::from(FetchError::HttpStatus {
            status: 401,
            url: "http://gw/v1".into(),
        });
        assert!(matches!(unauthorized, SourceError::AuthRequired));

        let missing = SourceError::from(FetchError::HttpStatus {
            status: 404,
            url: "http://gw/v1".into(),
        });
        assert!(matches!(missing, SourceError::Protocol(_)));
    }

    /// Minimal gateway answering every request with an authorized session.
    async fn serve_authorized_session(hits: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let hits = Arc::clone(&hits);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let _ = stream.read(&mut buf).await;
                    hits.fetch_add(1, Ordering::SeqCst);
                    let body = r#"{"authorized":true}"#;
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn gateway_checks_the_session_once_per_connect() {
        let dir = tempdir().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let base_url = serve_authorized_session(Arc::clone(&hits)).await;
        let source = HttpGatewaySource::new(
            GatewayConfig {
                base_url,
                api_id: 12345,
                api_hash: "hash".into(),
                session_path: dir.path().join("sessions").join("telegram"),
            },
            HttpClientConfig::default(),
        )
        .unwrap();

        source.connect().await.unwrap();
        assert!(source.is_authorized().await.unwrap());
        assert!(source.is_authorized().await.unwrap());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn gateway_endpoints_escape_channel_segments() {
        let dir = tempdir().unwrap();
        let source = HttpGatewaySource::new(
            GatewayConfig {
                base_url: "http://localhost:8081/".into(),
                api_id: 12345,
                api_hash: "hash".into(),
                session_path: dir.path().join("sessions").join("telegram"),
            },
            HttpClientConfig::default(),
        )
        .unwrap();

        let url = source.endpoint(&["channels", "chemed_pharma", "messages"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8081/v1/channels/chemed_pharma/messages");

        let url = source.endpoint(&["channels", "https://t.me/x", "messages"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8081/v1/channels/https:%2F%2Ft.me%2Fx/messages");
        assert!(dir.path().join("sessions").join("telegram").exists());
    }

    #[test]
    fn source_messages_tolerate_missing_counters() {
        let message: SourceMessage =
            serde_json::from_str(r#"{"id": 7, "date": "2026-01-14T10:00:00", "views": null}"#).unwrap();
        assert_eq!(message.views, None);
        assert!(!message.has_media);
        assert_eq!(message.message, None);
    }
}
