//! Task records and payloads.
//!
//! A task is one unit of work: a metadata fetch or a single file
//! transfer. Tasks are appended by the enumerator, mutated only by the
//! scheduler and the download engine, and never deleted (durable audit).

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorClass;
use crate::ratelimit::Channel;

/// Work item kinds, partitioned across the two pipelines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskKind {
    MetadataFetch,
    ModelFile,
    PreviewImage,
    GalleryImage,
    UserImage,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MetadataFetch => "metadata-fetch",
            Self::ModelFile => "model-file",
            Self::PreviewImage => "preview-image",
            Self::GalleryImage => "gallery-image",
            Self::UserImage => "user-image",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "metadata-fetch" => Some(Self::MetadataFetch),
            "model-file" => Some(Self::ModelFile),
            "preview-image" => Some(Self::PreviewImage),
            "gallery-image" => Some(Self::GalleryImage),
            "user-image" => Some(Self::UserImage),
            _ => None,
        }
    }

    /// Kinds drawn by the model pipeline.
    pub const MODEL_PIPELINE: &'static [TaskKind] = &[Self::MetadataFetch, Self::ModelFile];

    /// Kinds drawn by the image pipeline.
    pub const IMAGE_PIPELINE: &'static [TaskKind] =
        &[Self::PreviewImage, Self::GalleryImage, Self::UserImage];

    /// File-transfer channel for download kinds; metadata fetches are
    /// admitted on the API channels inside the client instead.
    pub fn file_channel(&self) -> Option<Channel> {
        match self {
            Self::MetadataFetch => None,
            Self::ModelFile => Some(Channel::ModelFile),
            Self::PreviewImage | Self::GalleryImage | Self::UserImage => {
                Some(Channel::ImageFile)
            }
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle.
///
/// `pending -> in-flight -> {done, failed, quarantined, skipped}`;
/// `failed` may re-enter `pending` through the retry policy. `done`,
/// `quarantined` and `skipped` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    InFlight,
    Done,
    Failed,
    Quarantined,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Quarantined => "quarantined",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_flight" => Some(Self::InFlight),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            "quarantined" => Some(Self::Quarantined),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Quarantined | Self::Skipped)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted task row.
#[derive(Clone, Debug)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub payload: Value,
    pub status: TaskStatus,
    pub attempts: u32,
    pub error_class: Option<ErrorClass>,
    pub error_message: Option<String>,
    pub dedup_key: String,
    pub not_before: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Decodes the payload into its typed form.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// A task awaiting insertion. Idempotency is carried by the dedup key
/// `(kind, remote-id, target-path)`.
#[derive(Clone, Debug)]
pub struct NewTask {
    pub id: String,
    pub kind: TaskKind,
    pub payload: Value,
    pub dedup_key: String,
}

impl NewTask {
    fn new(kind: TaskKind, payload: Value, remote_id: &str, target: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            payload,
            dedup_key: format!("{}:{remote_id}:{target}", kind.as_str()),
        }
    }

    pub fn metadata_fetch(payload: &MetadataTaskPayload) -> Self {
        Self::new(
            TaskKind::MetadataFetch,
            serde_json::to_value(payload).expect("metadata payload serializes"),
            &payload.model_id.to_string(),
            "-",
        )
    }

    pub fn model_file(payload: &FileTaskPayload) -> Self {
        Self::new(
            TaskKind::ModelFile,
            serde_json::to_value(payload).expect("file payload serializes"),
            &payload.version_id.to_string(),
            &payload.dest.to_string_lossy(),
        )
    }

    pub fn image(kind: TaskKind, payload: &ImageTaskPayload) -> Self {
        let remote_id = payload
            .image_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| payload.url.clone());
        Self::new(
            kind,
            serde_json::to_value(payload).expect("image payload serializes"),
            &remote_id,
            &payload.dest.to_string_lossy(),
        )
    }
}

/// Payload of a `metadata-fetch` task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataTaskPayload {
    pub model_id: u64,
}

/// Payload of a `model-file` task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileTaskPayload {
    pub model_id: u64,
    pub version_id: u64,
    pub url: String,
    pub file_name: String,
    /// Declared size; 0.0 when the server did not declare one.
    #[serde(default)]
    pub size_kb: f64,
    #[serde(default)]
    pub expected_sha256: Option<String>,
    pub dest: PathBuf,
}

/// Payload of the image task kinds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageTaskPayload {
    #[serde(default)]
    pub image_id: Option<u64>,
    pub url: String,
    pub dest: PathBuf,
}

/// Destination path embedded in a download payload, when any.
pub fn payload_dest(payload: &Value) -> Option<PathBuf> {
    payload
        .get("dest")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            TaskKind::MetadataFetch,
            TaskKind::ModelFile,
            TaskKind::PreviewImage,
            TaskKind::GalleryImage,
            TaskKind::UserImage,
        ] {
            assert_eq!(TaskKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_status_terminality() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::InFlight.is_terminal());
        assert!(!TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Quarantined.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
    }

    #[test]
    fn test_pipeline_partition_is_complete() {
        let mut all: Vec<TaskKind> = TaskKind::MODEL_PIPELINE.to_vec();
        all.extend_from_slice(TaskKind::IMAGE_PIPELINE);
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn test_dedup_key_is_input_order_independent() {
        let payload = FileTaskPayload {
            model_id: 1,
            version_id: 2,
            url: "https://x/file".into(),
            file_name: "f.safetensors".into(),
            size_kb: 10.0,
            expected_sha256: None,
            dest: PathBuf::from("/out/f.safetensors"),
        };
        let a = NewTask::model_file(&payload);
        let b = NewTask::model_file(&payload);
        // Distinct ids, identical dedup keys.
        assert_ne!(a.id, b.id);
        assert_eq!(a.dedup_key, b.dedup_key);
        assert_eq!(a.dedup_key, "model-file:2:/out/f.safetensors");
    }

    #[test]
    fn test_payload_dest_extraction() {
        let payload = ImageTaskPayload {
            image_id: Some(9),
            url: "https://x/i.png".into(),
            dest: PathBuf::from("/out/9.png"),
        };
        let task = NewTask::image(TaskKind::GalleryImage, &payload);
        assert_eq!(payload_dest(&task.payload), Some(PathBuf::from("/out/9.png")));
    }
}
