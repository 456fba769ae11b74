//! Metadata Materializer: sidecar artifacts for fetched versions.
//!
//! After a version payload is fully fetched this module writes two
//! sidecars into the version directory: `description.md` (human summary)
//! and `<stem>.civitai.info` (raw metadata snapshot, verbatim). All
//! writes are atomic: content lands in a `.tmp` file that is renamed
//! into place.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::api::models::{Model, Version};
use crate::error::{EngineError, EngineResult};
use crate::integrity::select_digest;
use crate::planner::{tmp_path, PathPlanner};

/// Writes both sidecars for a fetched (model, version) pair.
///
/// `raw_model` is the unmodified API payload the snapshot preserves.
pub fn materialize_version(
    planner: &PathPlanner,
    version_dir: &Path,
    model: &Model,
    version: &Version,
    raw_model: &Value,
    fetched_at: DateTime<Utc>,
) -> EngineResult<()> {
    fs::create_dir_all(version_dir).map_err(|e| EngineError::io(version_dir, e))?;

    let stem_source = version
        .primary_file()
        .map(|f| f.name.clone())
        .unwrap_or_else(|| format!("version-{}", version.id));

    let info_path = planner.info_path(version_dir, &stem_source);
    let pretty = serde_json::to_string_pretty(raw_model).map_err(|source| EngineError::Decode {
        context: "raw model payload".into(),
        source,
    })?;
    write_atomic(&info_path, pretty.as_bytes())?;

    let description = build_description(model, version, fetched_at);
    write_atomic(&planner.description_path(version_dir), description.as_bytes())?;

    Ok(())
}

/// Writes raw user-image metadata (`images_metadata.json`).
pub fn materialize_user_images(
    planner: &PathPlanner,
    creator: &str,
    raw_items: &[Value],
) -> EngineResult<()> {
    let dir = planner.user_images_dir(creator);
    fs::create_dir_all(&dir).map_err(|e| EngineError::io(dir.clone(), e))?;

    let body =
        serde_json::to_string_pretty(&raw_items).map_err(|source| EngineError::Decode {
            context: "user image metadata".into(),
            source,
        })?;
    write_atomic(&planner.user_images_metadata_path(creator), body.as_bytes())
}

/// Renders the human-readable `description.md` summary.
pub fn build_description(model: &Model, version: &Version, fetched_at: DateTime<Utc>) -> String {
    let file = version.primary_file();
    let file_size = file
        .map(|f| human_size_kb(f.size_kb))
        .unwrap_or_else(|| "unknown".to_string());

    let sha256 = file
        .and_then(|f| select_digest(&f.hashes))
        .map(|(_, digest)| digest)
        .unwrap_or_else(|| "unknown".to_string());
    let short_hash = file
        .and_then(|f| {
            f.hashes
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("autov2"))
                .map(|(_, v)| v.clone())
        })
        .unwrap_or_else(|| sha256.clone());

    let trigger_words = if version.trained_words.is_empty() {
        "none".to_string()
    } else {
        version.trained_words.join(", ")
    };

    let description = model
        .description
        .as_deref()
        .map(strip_html)
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| "No description available".to_string());

    let download_url = version.download_url.as_deref().unwrap_or("unknown");
    let web_url = format!(
        "https://civitai.com/models/{}?modelVersionId={}",
        model.id, version.id
    );

    format!(
        "# {name}\n\
         \n\
         **Creator**: {creator}\n\
         **Type**: {kind}\n\
         **Base model**: {base_model}\n\
         \n\
         ## Detail\n\
         \n\
         - **Trigger words**: {trigger_words}\n\
         - **Model hash**: {short_hash}\n\
         - **Version**: {version_name}\n\
         - **File size**: {file_size}\n\
         - **Downloads**: {downloads}\n\
         - **Rating**: {rating}\n\
         - **Thumbs up**: {thumbs_up}\n\
         - **NSFW level**: {nsfw_level}\n\
         \n\
         ## Description\n\
         \n\
         {description}\n\
         \n\
         ## Download\n\
         \n\
         - **Fetched at**: {fetched_at}\n\
         - **Download URL**: {download_url}\n\
         - **Web URL**: {web_url}\n\
         - **SHA256**: {sha256}\n",
        name = model.name,
        creator = model.creator_name(),
        kind = model.kind.as_str(),
        base_model = version.base_model.as_deref().unwrap_or("Unknown"),
        trigger_words = trigger_words,
        short_hash = short_hash,
        version_name = version.name,
        file_size = file_size,
        downloads = version.stats.download_count,
        rating = version.stats.rating,
        thumbs_up = version.stats.thumbs_up_count,
        nsfw_level = model.nsfw_level,
        description = description,
        fetched_at = fetched_at.format("%Y-%m-%d %H:%M:%S UTC"),
        download_url = download_url,
        web_url = web_url,
        sha256 = sha256,
    )
}

/// Formats a KiB count the way humans read it.
pub fn human_size_kb(size_kb: f64) -> String {
    if size_kb < 1024.0 {
        format!("{size_kb:.2} KB")
    } else if size_kb < 1024.0 * 1024.0 {
        format!("{:.2} MB", size_kb / 1024.0)
    } else {
        format!("{:.2} GB", size_kb / (1024.0 * 1024.0))
    }
}

/// Removes HTML tags, collapsing the remainder.
pub fn strip_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_tag = false;
    for c in input.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.trim().to_string()
}

/// Atomic write: content lands in `<path>.tmp`, then renames into place.
pub fn write_atomic(path: &Path, content: &[u8]) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
    }
    let tmp = tmp_path(path);
    fs::write(&tmp, content).map_err(|e| EngineError::io(tmp.clone(), e))?;
    fs::rename(&tmp, path).map_err(|e| EngineError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    use crate::planner::TagTable;

    fn sample_model() -> (Model, Value) {
        let raw = json!({
            "id": 42,
            "name": "Neon City",
            "type": "LORA",
            "nsfwLevel": 2,
            "tags": ["style"],
            "description": "<p>A <b>neon</b> style.</p>",
            "creator": {"username": "alice"},
            "modelVersions": [{
                "id": 101,
                "modelId": 42,
                "name": "v2.0",
                "baseModel": "SDXL 1.0",
                "trainedWords": ["neon", "city"],
                "downloadUrl": "https://civitai.com/api/download/models/101",
                "stats": {"downloadCount": 1200, "rating": 4.5, "thumbsUpCount": 88},
                "files": [{
                    "name": "neon_city.safetensors",
                    "sizeKB": 2048.0,
                    "primary": true,
                    "hashes": {"SHA256": "AABBCC", "AutoV2": "AABB"},
                }],
            }],
        });
        let model = Model::from_value(&raw).unwrap();
        (model, raw)
    }

    #[test]
    fn test_build_description_contents() {
        let (model, _) = sample_model();
        let version = model.model_versions[0].clone();
        let fetched = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

        let md = build_description(&model, &version, fetched);

        assert!(md.starts_with("# Neon City\n"));
        assert!(md.contains("**Creator**: alice"));
        assert!(md.contains("**Base model**: SDXL 1.0"));
        assert!(md.contains("- **Trigger words**: neon, city"));
        assert!(md.contains("- **Model hash**: AABB"));
        assert!(md.contains("- **File size**: 2.00 MB"));
        assert!(md.contains("- **Downloads**: 1200"));
        assert!(md.contains("A neon style."));
        assert!(md.contains("2025-06-01 12:00:00 UTC"));
        assert!(md.contains("https://civitai.com/models/42?modelVersionId=101"));
        assert!(md.contains("- **SHA256**: aabbcc"));
    }

    #[test]
    fn test_materialize_version_writes_both_sidecars() {
        let temp = TempDir::new().unwrap();
        let planner = PathPlanner::new(temp.path(), TagTable::default());
        let (model, raw) = sample_model();
        let version = model.model_versions[0].clone();
        let dir = temp.path().join("out");

        materialize_version(&planner, &dir, &model, &version, &raw, Utc::now()).unwrap();

        let info = dir.join("neon_city.civitai.info");
        assert!(info.exists());
        let parsed: Value = serde_json::from_str(&fs::read_to_string(&info).unwrap()).unwrap();
        assert_eq!(parsed["id"], 42);

        assert!(dir.join("description.md").exists());
        // No stray temp files remain.
        assert!(!tmp_path(&info).exists());
    }

    #[test]
    fn test_human_size_thresholds() {
        assert_eq!(human_size_kb(512.0), "512.00 KB");
        assert_eq!(human_size_kb(2048.0), "2.00 MB");
        assert_eq!(human_size_kb(3.5 * 1024.0 * 1024.0), "3.50 GB");
    }

    #[test]
    fn test_strip_html() {
        assert_eq!(strip_html("<p>Hello <b>world</b></p>"), "Hello world");
        assert_eq!(strip_html("plain"), "plain");
        assert_eq!(strip_html("  <div> </div> "), "");
    }

    #[test]
    fn test_write_atomic_replaces_existing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("file.txt");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
    }
}
