//! Object detection over downloaded channel images and per-message image
//! categorisation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use medtg_core::{derive_category, DetectionRecord, NO_DETECTION_LABEL};
use medtg_storage::{write_detections_csv, MediaStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "medtg-detect";

pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.35;

/// One bounding box reported by a detector. Box geometry is not kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f64,
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("model weights not found at {0}")]
    ModelNotFound(PathBuf),

    #[error("detector command is empty")]
    EmptyCommand,

    #[error("detector command not found: {0}")]
    ToolNotFound(String),

    #[error("detector failed on {image}: {stderr}")]
    Failed { image: PathBuf, stderr: String },

    #[error("unreadable detector output for {image}: {source}")]
    Output {
        image: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait ObjectDetector: Send + Sync {
    async fn detect(&self, image: &Path, confidence_threshold: f64) -> Result<Vec<Detection>, DetectorError>;
}

/// Runs an external inference command once per image:
/// `<command...> --model <weights> --conf <threshold> --source <image>`,
/// reading a JSON array of `{label, confidence}` from stdout.
#[derive(Debug, Clone)]
pub struct CommandDetector {
    program: String,
    leading_args: Vec<String>,
    model_path: PathBuf,
}

impl CommandDetector {
    /// `command` is split on whitespace; the first word is the program.
    pub fn new(command: &str, model_path: impl Into<PathBuf>) -> Result<Self, DetectorError> {
        let model_path = model_path.into();
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path));
        }
        let mut words = command.split_whitespace().map(ToString::to_string);
        let program = words.next().ok_or(DetectorError::EmptyCommand)?;
        Ok(Self {
            program,
            leading_args: words.collect(),
            model_path,
        })
    }
}

#[async_trait]
impl ObjectDetector for CommandDetector {
    async fn detect(&self, image: &Path, confidence_threshold: f64) -> Result<Vec<Detection>, DetectorError> {
        let output = Command::new(&self.program)
            .args(&self.leading_args)
            .arg("--model")
            .arg(&self.model_path)
            .arg("--conf")
            .arg(confidence_threshold.to_string())
            .arg("--source")
            .arg(image)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(DetectorError::ToolNotFound(self.program.clone()))
            }
            Err(e) => return Err(DetectorError::Io(e)),
        };
        if !output.status.success() {
            return Err(DetectorError::Failed {
                image: image.to_path_buf(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        serde_json::from_slice(&output.stdout).map_err(|source| DetectorError::Output {
            image: image.to_path_buf(),
            source,
        })
    }
}

/// An image file whose name identifies the message it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub path: PathBuf,
    pub message_id: i64,
    pub channel_name: String,
}

impl ImageRef {
    /// `<channel>/<message_id>.<ext>`; `None` when the stem is not numeric.
    pub fn from_path(path: &Path) -> Option<Self> {
        let message_id = path.file_stem()?.to_str()?.parse::<i64>().ok()?;
        let channel_name = path
            .parent()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        Some(Self {
            path: path.to_path_buf(),
            message_id,
            channel_name,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ImageDetections {
    pub image: ImageRef,
    pub detections: Vec<Detection>,
}

/// Group detections by `(channel, message_id)`, derive one category per
/// message from the union of its labels, then emit rows. Message ids are only
/// unique within a channel. An image with no detections yields a single
/// `none` row with confidence 0.0.
pub fn categorize(images: Vec<ImageDetections>) -> Vec<DetectionRecord> {
    let mut by_message: BTreeMap<(String, i64), Vec<ImageDetections>> = BTreeMap::new();
    for image in images {
        let key = (image.image.channel_name.clone(), image.image.message_id);
        by_message.entry(key).or_default().push(image);
    }

    let mut rows = Vec::new();
    for ((_, message_id), images) in by_message {
        let category = derive_category(
            images
                .iter()
                .flat_map(|i| i.detections.iter().map(|d| d.label.as_str())),
        );
        for ImageDetections { image, detections } in images {
            let image_path = image.path.display().to_string();
            if detections.is_empty() {
                rows.push(DetectionRecord {
                    message_id,
                    channel_name: image.channel_name,
                    image_path,
                    label: NO_DETECTION_LABEL.to_string(),
                    confidence: 0.0,
                    image_category: category,
                });
                continue;
            }
            for detection in detections {
                rows.push(DetectionRecord {
                    message_id,
                    channel_name: image.channel_name.clone(),
                    image_path: image_path.clone(),
                    label: detection.label,
                    confidence: detection.confidence,
                    image_category: category,
                });
            }
        }
    }
    rows
}

#[derive(Debug, Clone, Default)]
pub struct DetectSummary {
    pub images: usize,
    pub skipped: usize,
    pub rows: usize,
    pub output: Option<PathBuf>,
}

pub struct Categorizer {
    detector: Box<dyn ObjectDetector>,
}

impl Categorizer {
    pub fn new(detector: Box<dyn ObjectDetector>) -> Self {
        Self { detector }
    }

    /// Detect every image under `image_root` and write the categorised rows
    /// to `output_path`. Nothing is written when there are no rows.
    pub async fn detect(
        &self,
        image_root: &Path,
        output_path: &Path,
        confidence_threshold: f64,
    ) -> anyhow::Result<DetectSummary> {
        let mut summary = DetectSummary::default();
        let mut images = Vec::new();

        for path in MediaStore::new(image_root).image_files()? {
            let Some(image) = ImageRef::from_path(&path) else {
                warn!(path = %path.display(), "skipping image because filename is not numeric");
                summary.skipped += 1;
                continue;
            };
            let detections = self
                .detector
                .detect(&image.path, confidence_threshold)
                .await
                .with_context(|| format!("running detector on {}", image.path.display()))?
                .into_iter()
                .filter(|d| d.confidence >= confidence_threshold)
                .collect::<Vec<_>>();
            debug!(path = %image.path.display(), boxes = detections.len(), "detected objects");
            images.push(ImageDetections { image, detections });
        }
        summary.images = images.len();

        let rows = categorize(images);
        if rows.is_empty() {
            warn!(image_root = %image_root.display(), "no detections generated");
            return Ok(summary);
        }

        let stored = write_detections_csv(output_path, &rows).await?;
        info!(rows = stored.records, path = %stored.path.display(), "saved detections");
        summary.rows = stored.records;
        summary.output = Some(stored.path);
        Ok(summary)
    }
}

/// Detect with the external command detector loaded from `model_path`.
pub async fn detect(
    image_root: &Path,
    output_path: &Path,
    model_path: &Path,
    confidence_threshold: f64,
    detector_command: &str,
) -> anyhow::Result<DetectSummary> {
    let detector = CommandDetector::new(detector_command, model_path)?;
    Categorizer::new(Box::new(detector))
        .detect(image_root, output_path, confidence_threshold)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use medtg_core::ImageCategory;
    use medtg_storage::read_detections_csv;
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeDetector {
        by_file: HashMap<String, Vec<Detection>>,
    }

    impl FakeDetector {
        fn with(mut self, file: &str, boxes: &[(&str, f64)]) -> Self {
            self.by_file.insert(
                file.to_string(),
                boxes
                    .iter()
                    .map(|(label, confidence)| Detection {
                        label: label.to_string(),
                        confidence: *confidence,
                    })
                    .collect(),
            );
            self
        }
    }

    #[async_trait]
    impl ObjectDetector for FakeDetector {
        async fn detect(&self, image: &Path, _confidence_threshold: f64) -> Result<Vec<Detection>, DetectorError> {
            let name = image.file_name().unwrap().to_string_lossy().to_string();
            Ok(self.by_file.get(&name).cloned().unwrap_or_default())
        }
    }

    fn touch(root: &Path, channel: &str, file: &str) {
        let dir = root.join(channel);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(file), b"jpeg").unwrap();
    }

    #[tokio::test]
    async fn person_and_bottle_rows_are_promotional() {
        let dir = tempdir().unwrap();
        let images = dir.path().join("images");
        let output = dir.path().join("yolo").join("detections.csv");
        touch(&images, "channel_x", "12345.jpg");

        let detector = FakeDetector::default().with("12345.jpg", &[("person", 0.91), ("bottle", 0.66)]);
        let summary = Categorizer::new(Box::new(detector))
            .detect(&images, &output, DEFAULT_CONFIDENCE_THRESHOLD)
            .await
            .unwrap();

        assert_eq!(summary.images, 1);
        assert_eq!(summary.rows, 2);
        let rows = read_detections_csv(&output).await.unwrap();
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.message_id, 12345);
            assert_eq!(row.channel_name, "channel_x");
            assert_eq!(row.image_category, ImageCategory::Promotional);
        }
        assert_eq!(rows[0].label, "person");
        assert_eq!(rows[1].label, "bottle");
    }

    #[tokio::test]
    async fn image_without_detections_gets_placeholder_row() {
        let dir = tempdir().unwrap();
        let images = dir.path().join("images");
        let output = dir.path().join("detections.csv");
        touch(&images, "channel_x", "777.jpg");

        Categorizer::new(Box::new(FakeDetector::default()))
            .detect(&images, &output, DEFAULT_CONFIDENCE_THRESHOLD)
            .await
            .unwrap();

        let rows = read_detections_csv(&output).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].label, NO_DETECTION_LABEL);
        assert_eq!(rows[0].confidence, 0.0);
        assert_eq!(rows[0].image_category, ImageCategory::Other);
    }

    #[tokio::test]
    async fn boxes_below_threshold_are_dropped() {
        let dir = tempdir().unwrap();
        let images = dir.path().join("images");
        let output = dir.path().join("detections.csv");
        touch(&images, "channel_x", "9.jpg");

        let detector = FakeDetector::default().with("9.jpg", &[("person", 0.2), ("cup", 0.8)]);
        Categorizer::new(Box::new(detector))
            .detect(&images, &output, 0.5)
            .await
            .unwrap();

        let rows = read_detections_csv(&output).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].label, "cup");
        assert_eq!(rows[0].image_category, ImageCategory::ProductDisplay);
    }

    #[tokio::test]
    async fn non_numeric_names_are_skipped_and_empty_runs_write_nothing() {
        let dir = tempdir().unwrap();
        let images = dir.path().join("images");
        let output = dir.path().join("detections.csv");
        touch(&images, "channel_x", "banner.jpg");

        let summary = Categorizer::new(Box::new(FakeDetector::default()))
            .detect(&images, &output, DEFAULT_CONFIDENCE_THRESHOLD)
            .await
            .unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.rows, 0);
        assert!(summary.output.is_none());
        assert!(!output.exists());
    }

    #[test]
    fn category_is_shared_by_every_row_of_a_message() {
        let image = |file: &str| ImageRef::from_path(&PathBuf::from("images/channel_x").join(file)).unwrap();
        let rows = categorize(vec![
            ImageDetections {
                image: image("42.jpg"),
                detections: vec![Detection {
                    label: "person".into(),
                    confidence: 0.9,
                }],
            },
            ImageDetections {
                image: image("7.jpg"),
                detections: vec![],
            },
            ImageDetections {
                image: image("42.png"),
                detections: vec![Detection {
                    label: "laptop".into(),
                    confidence: 0.7,
                }],
            },
        ]);

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].message_id, 7);
        assert_eq!(rows[0].image_category, ImageCategory::Other);
        let message_42: Vec<_> = rows.iter().filter(|r| r.message_id == 42).collect();
        assert_eq!(message_42.len(), 2);
        assert!(message_42
            .iter()
            .all(|r| r.image_category == ImageCategory::Promotional));
    }

    #[test]
    fn same_message_id_in_different_channels_is_categorised_separately() {
        let rows = categorize(vec![
            ImageDetections {
                image: ImageRef::from_path(Path::new("img/chan_a/5.jpg")).unwrap(),
                detections: vec![Detection {
                    label: "person".into(),
                    confidence: 0.9,
                }],
            },
            ImageDetections {
                image: ImageRef::from_path(Path::new("img/chan_b/5.jpg")).unwrap(),
                detections: vec![Detection {
                    label: "bottle".into(),
                    confidence: 0.8,
                }],
            },
        ]);

        assert_eq!(rows.len(), 2);
        let category = |channel: &str| {
            rows.iter()
                .find(|r| r.channel_name == channel && r.message_id == 5)
                .map(|r| r.image_category)
                .unwrap()
        };
        assert_eq!(category("chan_a"), ImageCategory::Lifestyle);
        assert_eq!(category("chan_b"), ImageCategory::ProductDisplay);
    }

    #[test]
    fn image_refs_come_from_stem_and_parent() {
        let image = ImageRef::from_path(Path::new("data/raw/images/tikvahpharma/1001.jpg")).unwrap();
        assert_eq!(image.message_id, 1001);
        assert_eq!(image.channel_name, "tikvahpharma");
        assert!(ImageRef::from_path(Path::new("data/raw/images/tikvahpharma/cover.jpg")).is_none());
    }

    #[test]
    fn missing_weights_fail_before_any_image() {
        let dir = tempdir().unwrap();
        let err = CommandDetector::new("yolo-detect", dir.path().join("yolov8n.pt")).unwrap_err();
        assert!(matches!(err, DetectorError::ModelNotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_detector_parses_json_stdout() {
        let dir = tempdir().unwrap();
        let weights = dir.path().join("yolov8n.pt");
        std::fs::write(&weights, b"weights").unwrap();
        let script = dir.path().join("detect.sh");
        std::fs::write(
            &script,
            "echo '[{\"label\":\"person\",\"confidence\":0.91},{\"label\":\"bottle\",\"confidence\":0.4}]'\n",
        )
        .unwrap();

        let detector = CommandDetector::new(&format!("sh {}", script.display()), &weights).unwrap();
        let boxes = detector.detect(Path::new("12345.jpg"), 0.35).await.unwrap();
        assert_eq!(
            boxes,
            vec![
                Detection {
                    label: "person".into(),
                    confidence: 0.91
                },
                Detection {
                    label: "bottle".into(),
                    confidence: 0.4
                },
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_reports_stderr() {
        let dir = tempdir().unwrap();
        let weights = dir.path().join("yolov8n.pt");
        std::fs::write(&weights, b"weights").unwrap();
        let script = dir.path().join("detect.sh");
        std::fs::write(&script, "echo 'CUDA unavailable' >&2\nexit 3\n").unwrap();

        let detector = CommandDetector::new(&format!("sh {}", script.display()), &weights).unwrap();
        let err = detector.detect(Path::new("1.jpg"), 0.35).await.unwrap_err();
        assert!(matches!(err, DetectorError::Failed { ref stderr, .. } if stderr == "CUDA unavailable"));
    }
}
