//! Tolerant data model for remote payloads.
//!
//! The remote responses are heterogeneous and evolve: unknown fields are
//! ignored, optional fields default, and fields with known type drift
//! (e.g. `nsfwLevel`, cursors) get forgiving decoders. Only the handful
//! of mandatory fields (ids, urls, digests) are required; the raw
//! payload is kept verbatim alongside for the `.civitai.info` sidecar.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// A hosted model with its ordered versions.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: ModelKind,
    #[serde(default)]
    pub nsfw: bool,
    #[serde(default, deserialize_with = "de_nsfw_level")]
    pub nsfw_level: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub mode: Option<ModelMode>,
    #[serde(default)]
    pub creator: Creator,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub model_versions: Vec<Version>,
}

impl Model {
    /// Decodes one model item, returning the typed view.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    /// Creator handle with the conventional fallback.
    pub fn creator_name(&self) -> &str {
        self.creator.username.as_deref().unwrap_or("Unknown")
    }

    /// A model is active unless marked archived or taken down.
    pub fn is_active(&self) -> bool {
        self.mode.is_none()
    }
}

/// Model type taxonomy; unknown remote values collapse to `Other`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum ModelKind {
    Checkpoint,
    TextualInversion,
    Hypernetwork,
    AestheticGradient,
    #[serde(rename = "LORA", alias = "LoRA", alias = "LoCon", alias = "DoRA")]
    Lora,
    Controlnet,
    Poses,
    #[serde(other)]
    #[default]
    Other,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Checkpoint => "Checkpoint",
            Self::TextualInversion => "TextualInversion",
            Self::Hypernetwork => "Hypernetwork",
            Self::AestheticGradient => "AestheticGradient",
            Self::Lora => "LORA",
            Self::Controlnet => "Controlnet",
            Self::Poses => "Poses",
            Self::Other => "Other",
        }
    }
}

/// Availability mode; absence means active.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub enum ModelMode {
    Archived,
    TakenDown,
}

/// Creator sub-object.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Creator {
    #[serde(default)]
    pub username: Option<String>,
}

/// One published version of a model.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub id: u64,
    #[serde(default)]
    pub model_id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub base_model: Option<String>,
    #[serde(default)]
    pub trained_words: Vec<String>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub images: Vec<ImageEntry>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub stats: VersionStats,
}

impl Version {
    /// The primary file, or the first file when none is flagged.
    pub fn primary_file(&self) -> Option<&FileEntry> {
        self.files
            .iter()
            .find(|f| f.primary.unwrap_or(false))
            .or_else(|| self.files.first())
    }
}

/// Declared counters for a version.
#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionStats {
    #[serde(default)]
    pub download_count: u64,
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub thumbs_up_count: u64,
}

/// A downloadable file belonging to a version.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "sizeKB", default)]
    pub size_kb: f64,
    #[serde(default)]
    pub hashes: HashMap<String, String>,
    #[serde(default)]
    pub primary: Option<bool>,
    #[serde(default)]
    pub metadata: FileMeta,
    #[serde(default)]
    pub download_url: Option<String>,
}

impl FileEntry {
    /// Declared size in bytes (the wire unit is KiB).
    pub fn size_bytes(&self) -> u64 {
        (self.size_kb * 1024.0).round() as u64
    }

    pub fn format(&self) -> FileFormat {
        match self.metadata.format.as_deref() {
            Some(f) if f.eq_ignore_ascii_case("SafeTensor") => FileFormat::Safetensor,
            Some(f) if f.eq_ignore_ascii_case("PickleTensor") => FileFormat::Pickletensor,
            _ => FileFormat::Other,
        }
    }
}

/// Wire-declared file metadata; only the format is interpreted.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileFormat {
    Safetensor,
    Pickletensor,
    Other,
}

/// A preview or gallery image.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageEntry {
    /// Gallery/user images carry an id; version previews may not.
    #[serde(default)]
    pub id: Option<u64>,
    pub url: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    #[serde(default, deserialize_with = "de_nsfw_level")]
    pub nsfw_level: u32,
    /// Blurhash placeholder.
    #[serde(default)]
    pub hash: Option<String>,
    /// Generation-parameters blob, kept opaque.
    #[serde(default)]
    pub meta: Option<Value>,
}

impl ImageEntry {
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

/// Pagination envelope: `{ items: [...], metadata: {...} }`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ListResponse {
    #[serde(default)]
    pub items: Vec<Value>,
    #[serde(default)]
    pub metadata: PageMeta,
}

/// Pagination metadata; the service drifts between `nextPage` URLs,
/// `nextCursor` tokens, and `currentPage`/`totalPages` counters.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    #[serde(default)]
    pub next_page: Option<String>,
    #[serde(default, deserialize_with = "de_opt_tolerant_string")]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub current_page: Option<u64>,
    #[serde(default)]
    pub total_pages: Option<u64>,
}

/// `nsfwLevel` has drifted between numbers and label strings across API
/// revisions; decode both, defaulting to 0.
fn de_nsfw_level<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n.as_u64().unwrap_or(0) as u32,
        Value::String(s) => match s.as_str() {
            "None" => 0,
            "Soft" => 2,
            "Mature" => 4,
            "X" => 8,
            other => other.parse().unwrap_or(0),
        },
        _ => 0,
    })
}

/// Cursors arrive as strings or numbers; normalize to a string.
fn de_opt_tolerant_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_model_decodes_with_minimal_fields() {
        let value = json!({ "id": 42 });
        let model = Model::from_value(&value).unwrap();
        assert_eq!(model.id, 42);
        assert_eq!(model.name, "");
        assert_eq!(model.kind, ModelKind::Other);
        assert!(model.is_active());
        assert_eq!(model.creator_name(), "Unknown");
    }

    #[test]
    fn test_model_ignores_unknown_fields() {
        let value = json!({
            "id": 7,
            "name": "Test",
            "type": "LORA",
            "someFutureField": {"deeply": ["nested"]},
            "tags": ["style"],
            "creator": {"username": "alice", "image": "https://x"},
        });
        let model = Model::from_value(&value).unwrap();
        assert_eq!(model.kind, ModelKind::Lora);
        assert_eq!(model.creator_name(), "alice");
    }

    #[test]
    fn test_unknown_model_type_collapses_to_other() {
        let value = json!({ "id": 1, "type": "MotionModule" });
        let model = Model::from_value(&value).unwrap();
        assert_eq!(model.kind, ModelKind::Other);
    }

    #[test]
    fn test_mode_marks_inactive() {
        let value = json!({ "id": 1, "mode": "TakenDown" });
        let model = Model::from_value(&value).unwrap();
        assert!(!model.is_active());
        assert_eq!(model.mode, Some(ModelMode::TakenDown));
    }

    #[test]
    fn test_primary_file_selection() {
        let version: Version = serde_json::from_value(json!({
            "id": 10,
            "files": [
                {"name": "a.safetensors", "sizeKB": 1.0},
                {"name": "b.safetensors", "sizeKB": 2.0, "primary": true},
            ],
        }))
        .unwrap();
        assert_eq!(version.primary_file().unwrap().name, "b.safetensors");
    }

    #[test]
    fn test_file_size_bytes_and_format() {
        let file: FileEntry = serde_json::from_value(json!({
            "name": "m.safetensors",
            "sizeKB": 1205.6318359375,
            "metadata": {"format": "SafeTensor"},
        }))
        .unwrap();
        assert_eq!(file.size_bytes(), 1234567);
        assert_eq!(file.format(), FileFormat::Safetensor);
    }

    #[test]
    fn test_nsfw_level_type_drift() {
        let from_number: ImageEntry =
            serde_json::from_value(json!({"url": "https://x/a.png", "nsfwLevel": 4})).unwrap();
        assert_eq!(from_number.nsfw_level, 4);

        let from_label: ImageEntry =
            serde_json::from_value(json!({"url": "https://x/a.png", "nsfwLevel": "Mature"}))
                .unwrap();
        assert_eq!(from_label.nsfw_level, 4);

        let from_junk: ImageEntry =
            serde_json::from_value(json!({"url": "https://x/a.png", "nsfwLevel": [1]})).unwrap();
        assert_eq!(from_junk.nsfw_level, 0);
    }

    #[test]
    fn test_page_meta_cursor_drift() {
        let meta: PageMeta =
            serde_json::from_value(json!({"nextCursor": 12345, "totalPages": 3})).unwrap();
        assert_eq!(meta.next_cursor.as_deref(), Some("12345"));

        let meta: PageMeta = serde_json::from_value(json!({"nextCursor": "abc|99"})).unwrap();
        assert_eq!(meta.next_cursor.as_deref(), Some("abc|99"));
    }
}
