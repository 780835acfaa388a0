//! Idempotent loading of partition files and detection CSVs into the
//! PostgreSQL raw tables.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use medtg_core::{parse_message_timestamp, ConfigError, DetectionRecord};
use medtg_storage::{read_detections_csv, read_partition_batches};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Executor};
use tracing::{info, warn};

pub const CRATE_NAME: &str = "medtg-warehouse";

pub const DEFAULT_SCHEMA: &str = "raw";
pub const MESSAGES_TABLE: &str = "telegram_messages";
pub const DETECTIONS_TABLE: &str = "image_detections";

#[derive(Clone)]
pub struct WarehouseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for WarehouseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarehouseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl WarehouseConfig {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(&self.password)
    }
}

/// The two raw table shapes the loader knows how to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Messages,
    Detections,
}

/// A validated, quoted `schema.table` name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedTable {
    schema: String,
    table: String,
}

fn validate_identifier(kind: &str, value: &str) -> Result<(), ConfigError> {
    let mut chars = value.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            key: kind.to_string(),
            message: format!("`{value}` is not a plain SQL identifier"),
        })
    }
}

impl QualifiedTable {
    pub fn new(schema: &str, table: &str) -> Result<Self, ConfigError> {
        validate_identifier("schema", schema)?;
        validate_identifier("table", table)?;
        Ok(Self {
            schema: schema.to_string(),
            table: table.to_string(),
        })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }
}

impl fmt::Display for QualifiedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\".\"{}\"", self.schema, self.table)
    }
}

pub fn create_table_sql(target: &QualifiedTable, kind: TableKind) -> String {
    match kind {
        TableKind::Messages => format!(
            r#"
            CREATE TABLE IF NOT EXISTS {target} (
                message_id BIGINT PRIMARY KEY,
                channel_name TEXT,
                message_date TIMESTAMPTZ,
                message_text TEXT,
                has_media BOOLEAN,
                image_path TEXT,
                views BIGINT,
                forwards BIGINT,
                raw_payload JSONB,
                ingested_at TIMESTAMPTZ DEFAULT now()
            )
            "#
        ),
        TableKind::Detections => format!(
            r#"
            CREATE TABLE IF NOT EXISTS {target} (
                message_id BIGINT,
                channel_name TEXT,
                image_path TEXT NOT NULL,
                label TEXT NOT NULL,
                confidence DOUBLE PRECISION,
                image_category TEXT,
                ingested_at TIMESTAMPTZ DEFAULT now(),
                PRIMARY KEY (message_id, label, image_path)
            )
            "#
        ),
    }
}

fn insert_message_sql(target: &QualifiedTable) -> String {
    format!(
        r#"
        INSERT INTO {target} (
            message_id, channel_name, message_date, message_text,
            has_media, image_path, views, forwards, raw_payload
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (message_id) DO NOTHING
        "#
    )
}

fn insert_detection_sql(target: &QualifiedTable) -> String {
    format!(
        r#"
        INSERT INTO {target} (
            message_id, channel_name, image_path, label, confidence, image_category
        ) VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (message_id, label, image_path) DO NOTHING
        "#
    )
}

#[derive(Debug, Deserialize)]
struct PartitionRecord {
    message_id: i64,
    #[serde(default)]
    channel_name: Option<String>,
    #[serde(default)]
    message_date: Option<String>,
    #[serde(default)]
    message_text: Option<String>,
    #[serde(default)]
    has_media: Option<bool>,
    #[serde(default)]
    image_path: Option<String>,
    #[serde(default)]
    views: Option<i64>,
    #[serde(default)]
    forwards: Option<i64>,
}

/// A partition-file record ready to bind into the messages table.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRow {
    pub message_id: i64,
    pub channel_name: Option<String>,
    pub message_date: Option<DateTime<Utc>>,
    pub message_text: Option<String>,
    pub has_media: bool,
    pub image_path: Option<String>,
    pub views: i64,
    pub forwards: i64,
    pub raw_payload: JsonValue,
}

impl MessageRow {
    /// Counters default to 0; the payload keeps the source object plus the
    /// file it was read from.
    pub fn from_json(mut value: JsonValue, raw_file: &Path) -> Result<Self> {
        let record: PartitionRecord =
            serde_json::from_value(value.clone()).context("decoding partition record")?;
        let message_date = match record.message_date.as_deref() {
            Some(raw) => match parse_message_timestamp(raw) {
                Some(dt) => Some(dt),
                None => bail!("message {} has unparsable message_date `{raw}`", record.message_id),
            },
            None => None,
        };
        if let Some(object) = value.as_object_mut() {
            object.insert(
                "raw_file".to_string(),
                JsonValue::String(raw_file.display().to_string()),
            );
        }
        Ok(Self {
            message_id: record.message_id,
            channel_name: record.channel_name,
            message_date,
            message_text: record.message_text,
            has_media: record.has_media.unwrap_or(false),
            image_path: record.image_path,
            views: record.views.unwrap_or(0),
            forwards: record.forwards.unwrap_or(0),
            raw_payload: value,
        })
    }
}

/// Read every partition file under `source_dir` into message rows.
pub async fn read_message_rows(source_dir: &Path) -> Result<Vec<MessageRow>> {
    let mut rows = Vec::new();
    for batch in read_partition_batches(source_dir).await? {
        for (index, value) in batch.records.into_iter().enumerate() {
            let row = MessageRow::from_json(value, &batch.path)
                .with_context(|| format!("record {} of {}", index, batch.path.display()))?;
            rows.push(row);
        }
    }
    Ok(rows)
}

/// Outcome of one load. `skipped` counts rows discarded by the conflict
/// filter; they are not errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub read: usize,
    pub inserted: u64,
    pub skipped: u64,
}

impl LoadReport {
    fn new(read: usize, inserted: u64) -> Self {
        Self {
            read,
            inserted,
            skipped: (read as u64).saturating_sub(inserted),
        }
    }
}

/// Handle on the warehouse. A fresh connection is opened per operation.
#[derive(Clone)]
pub struct Warehouse {
    options: PgConnectOptions,
}

impl Warehouse {
    pub fn new(config: &WarehouseConfig) -> Self {
        Self {
            options: config.connect_options(),
        }
    }

    pub fn from_url(url: &str) -> Result<Self> {
        let options = PgConnectOptions::from_str(url).context("parsing warehouse url")?;
        Ok(Self { options })
    }

    async fn connect(&self) -> Result<PgConnection> {
        PgConnection::connect_with(&self.options)
            .await
            .context("connecting to warehouse")
    }

    /// Create the schema and table if they do not exist.
    pub async fn ensure_table(&self, schema: &str, table: &str, kind: TableKind) -> Result<()> {
        let target = QualifiedTable::new(schema, table)?;
        let mut conn = self.connect().await?;
        ensure_table_on(&mut conn, &target, kind).await?;
        conn.close().await.context("closing warehouse connection")?;
        Ok(())
    }

    /// Load every partition file under `source_dir` in one transaction.
    /// Rows whose `message_id` is already present are skipped.
    pub async fn load_json(&self, schema: &str, table: &str, source_dir: &Path) -> Result<LoadReport> {
        let target = QualifiedTable::new(schema, table)?;
        let rows = read_message_rows(source_dir).await?;
        if rows.is_empty() {
            warn!(source = %source_dir.display(), "no JSON records found");
            return Ok(LoadReport::default());
        }

        let mut conn = self.connect().await?;
        ensure_table_on(&mut conn, &target, TableKind::Messages).await?;

        let sql = insert_message_sql(&target);
        let mut tx = conn.begin().await.context("starting load transaction")?;
        let mut inserted = 0u64;
        for row in &rows {
            let result = sqlx::query(&sql)
                .bind(row.message_id)
                .bind(&row.channel_name)
                .bind(row.message_date)
                .bind(&row.message_text)
                .bind(row.has_media)
                .bind(&row.image_path)
                .bind(row.views)
                .bind(row.forwards)
                .bind(&row.raw_payload)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("inserting message {}", row.message_id))?;
            inserted += result.rows_affected();
        }
        tx.commit().await.context("committing message load")?;
        conn.close().await.context("closing warehouse connection")?;

        let report = LoadReport::new(rows.len(), inserted);
        info!(
            read = report.read,
            inserted = report.inserted,
            skipped = report.skipped,
            table = %target,
            "loaded message rows"
        );
        Ok(report)
    }

    /// Load a detection CSV in one transaction, skipping rows whose
    /// `(message_id, label, image_path)` is already present. A missing file
    /// loads nothing.
    pub async fn load_csv(&self, schema: &str, table: &str, csv_path: &Path) -> Result<LoadReport> {
        let target = QualifiedTable::new(schema, table)?;
        if !csv_path.exists() {
            warn!(source = %csv_path.display(), "detection csv not found; nothing to load");
            return Ok(LoadReport::default());
        }
        let rows = read_detections_csv(csv_path).await?;
        if rows.is_empty() {
            warn!(source = %csv_path.display(), "no detection rows found");
            return Ok(LoadReport::default());
        }

        let mut conn = self.connect().await?;
        ensure_table_on(&mut conn, &target, TableKind::Detections).await?;
        let inserted = insert_detections(&mut conn, &target, &rows).await?;
        conn.close().await.context("closing warehouse connection")?;

        let report = LoadReport::new(rows.len(), inserted);
        info!(
            read = report.read,
            inserted = report.inserted,
            skipped = report.skipped,
            table = %target,
            "loaded detection rows"
        );
        Ok(report)
    }
}

async fn ensure_table_on(conn: &mut PgConnection, target: &QualifiedTable, kind: TableKind) -> Result<()> {
    let create_schema = format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", target.schema());
    (&mut *conn)
        .execute(create_schema.as_str())
        .await
        .with_context(|| format!("creating schema {}", target.schema()))?;
    (&mut *conn)
        .execute(create_table_sql(target, kind).as_str())
        .await
        .with_context(|| format!("creating table {target}"))?;
    Ok(())
}

async fn insert_detections(
    conn: &mut PgConnection,
    target: &QualifiedTable,
    rows: &[DetectionRecord],
) -> Result<u64> {
    let sql = insert_detection_sql(target);
    let mut tx = conn.begin().await.context("starting load transaction")?;
    let mut inserted = 0u64;
    for row in rows {
        let result = sqlx::query(&sql)
            .bind(row.message_id)
            .bind(&row.channel_name)
            .bind(&row.image_path)
            .bind(&row.label)
            .bind(row.confidence)
            .bind(row.image_category.as_str())
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting detection {}/{}", row.message_id, row.label))?;
        inserted += result.rows_affected();
    }
    tx.commit().await.context("committing detection load")?;
    Ok(inserted)
}
