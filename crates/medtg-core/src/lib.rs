//! Core domain model for the medical Telegram warehouse pipeline.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "medtg-core";

/// Labels that count as a product shot.
pub const PRODUCT_LABELS: [&str; 8] = [
    "bottle",
    "cup",
    "vase",
    "handbag",
    "backpack",
    "book",
    "laptop",
    "cell phone",
];

pub const PERSON_LABEL: &str = "person";

/// Label written for an image the detector found nothing in.
pub const NO_DETECTION_LABEL: &str = "none";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("{path} has no `{key}` key")]
    MissingKey { path: PathBuf, key: &'static str },
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// One normalized channel message, as written to partition files and the
/// `telegram_messages` raw table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub message_id: i64,
    pub channel_name: String,
    pub message_date: DateTime<Utc>,
    pub message_text: Option<String>,
    pub has_media: bool,
    pub image_path: Option<String>,
    #[serde(default)]
    pub views: i64,
    #[serde(default)]
    pub forwards: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageCategory {
    Promotional,
    ProductDisplay,
    Lifestyle,
    Other,
}

impl ImageCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Promotional => "promotional",
            Self::ProductDisplay => "product_display",
            Self::Lifestyle => "lifestyle",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ImageCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "promotional" => Ok(Self::Promotional),
            "product_display" => Ok(Self::ProductDisplay),
            "lifestyle" => Ok(Self::Lifestyle),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown image category `{other}`")),
        }
    }
}

/// One detected object (or the `none` placeholder) for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub message_id: i64,
    pub channel_name: String,
    pub image_path: String,
    pub label: String,
    pub confidence: f64,
    pub image_category: ImageCategory,
}

pub fn is_product_label(label: &str) -> bool {
    PRODUCT_LABELS.contains(&label)
}

/// Classify a message's images from the union of their detected labels.
///
/// Order and duplicates in `labels` do not matter.
pub fn derive_category<I, S>(labels: I) -> ImageCategory
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut has_person = false;
    let mut has_product = false;
    for label in labels {
        let label = label.as_ref();
        has_person |= label == PERSON_LABEL;
        has_product |= is_product_label(label);
    }

    match (has_person, has_product) {
        (true, true) => ImageCategory::Promotional,
        (false, true) => ImageCategory::ProductDisplay,
        (true, false) => ImageCategory::Lifestyle,
        (false, false) => ImageCategory::Other,
    }
}

/// File name used for a channel's partition file.
pub fn partition_file_name(channel: &str) -> String {
    format!("{}.json", channel.to_lowercase().replace(' ', "_"))
}

/// `<root>/<YYYY-MM-DD>/<channel>.json`. Pure; does not touch the filesystem.
pub fn partition_path(root: impl AsRef<Path>, dt: DateTime<Utc>, channel: &str) -> PathBuf {
    root.as_ref()
        .join(dt.format("%Y-%m-%d").to_string())
        .join(partition_file_name(channel))
}

/// Channel name used on disk and in the warehouse for a configured
/// identifier. URL-like identifiers (`https://t.me/foo`, `t.me/foo`) keep
/// only their last path segment; a leading `@` is dropped.
pub fn channel_name_from_identifier(identifier: &str) -> String {
    let trimmed = identifier.trim();
    let looks_like_url = trimmed.contains("://") || trimmed.starts_with("t.me/");
    let name = if looks_like_url {
        trimmed
            .split(['/', '?', '#'])
            .filter(|segment| !segment.is_empty())
            .last()
            .unwrap_or(trimmed)
    } else {
        trimmed
    };
    name.trim_start_matches('@').to_string()
}

/// Parse a message timestamp. Offset-bearing values are converted to UTC;
/// naive values are taken to already be UTC.
pub fn parse_message_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}
