//! Path Planner: maps (model, version, file) to on-disk destinations.
//!
//! The layout is a pure function of remote metadata and the tag table:
//!
//! ```text
//! <root>/models/<base_model>/<tag_category>/<creator>_<model>_<version>/
//!     <file>.safetensors
//!     <file>.civitai.info
//!     description.md
//!     <file>.preview[.N].<ext>
//!     Gallery/<image_id>.<ext>
//! <root>/images/<creator>/
//!     images_metadata.json
//!     <image_id>.<ext>
//! ```

mod sanitize;
mod taxonomy;

use std::path::{Path, PathBuf};

pub use sanitize::{sanitize_segment, truncate_segment, MAX_SEGMENT_LEN};
pub use taxonomy::{TagTable, MISC_CATEGORY};

/// File name of the human-readable summary inside a version directory.
pub const DESCRIPTION_FILE: &str = "description.md";

/// File name of the raw user-image metadata sidecar.
pub const USER_IMAGES_METADATA_FILE: &str = "images_metadata.json";

/// Sub-directory holding a model's gallery images.
pub const GALLERY_DIR: &str = "Gallery";

/// Fallback extension when a URL does not reveal one.
const DEFAULT_IMAGE_EXT: &str = ".jpeg";

/// Deterministic destination planning for every artifact kind.
#[derive(Clone, Debug)]
pub struct PathPlanner {
    root: PathBuf,
    table: TagTable,
}

impl PathPlanner {
    pub fn new(root: impl Into<PathBuf>, table: TagTable) -> Self {
        Self {
            root: root.into(),
            table,
        }
    }

    /// Destination root this planner writes under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for a (model, version) pair:
    /// `<root>/models/<base_model>/<tag_category>/<creator>_<model>_<version>/`.
    pub fn version_dir(
        &self,
        creator: &str,
        model_name: &str,
        version_name: &str,
        base_model: Option<&str>,
        tags: &[String],
    ) -> PathBuf {
        let base_model = sanitize_segment(base_model.unwrap_or("Unknown"));
        let category = self.table.classify(tags);
        let folder = format!(
            "{}_{}_{}",
            sanitize_segment(creator),
            sanitize_segment(model_name),
            sanitize_segment(version_name)
        );
        self.root
            .join("models")
            .join(base_model)
            .join(category)
            .join(truncate_segment(&folder, MAX_SEGMENT_LEN))
    }

    /// Directory for images unattached to a model: `<root>/images/<creator>/`.
    pub fn user_images_dir(&self, creator: &str) -> PathBuf {
        self.root.join("images").join(sanitize_segment(creator))
    }

    /// Primary binary keeps its exact (sanitized) remote name.
    pub fn file_path(&self, version_dir: &Path, remote_name: &str) -> PathBuf {
        version_dir.join(sanitize_segment(remote_name))
    }

    /// Raw metadata snapshot: `<stem>.civitai.info`.
    pub fn info_path(&self, version_dir: &Path, remote_name: &str) -> PathBuf {
        version_dir.join(format!("{}.civitai.info", file_stem(remote_name)))
    }

    /// Human summary: `description.md`.
    pub fn description_path(&self, version_dir: &Path) -> PathBuf {
        version_dir.join(DESCRIPTION_FILE)
    }

    /// Preview image: `<stem>.preview<.N>.<ext>`, where N is empty for the
    /// first preview and 2-indexed afterwards.
    pub fn preview_path(
        &self,
        version_dir: &Path,
        remote_name: &str,
        index: usize,
        url: &str,
    ) -> PathBuf {
        let stem = file_stem(remote_name);
        let ext = image_ext_from_url(url);
        let name = if index == 0 {
            format!("{stem}.preview{ext}")
        } else {
            format!("{stem}.preview.{}{ext}", index + 1)
        };
        version_dir.join(name)
    }

    /// Gallery image: `Gallery/<image_id>.<ext>`.
    pub fn gallery_path(&self, version_dir: &Path, image_id: u64, url: &str) -> PathBuf {
        version_dir
            .join(GALLERY_DIR)
            .join(format!("{image_id}{}", image_ext_from_url(url)))
    }

    /// User-posted image: `<root>/images/<creator>/<image_id>.<ext>`.
    pub fn user_image_path(&self, creator: &str, image_id: u64, url: &str) -> PathBuf {
        self.user_images_dir(creator)
            .join(format!("{image_id}{}", image_ext_from_url(url)))
    }

    /// Sidecar listing the raw user-image metadata.
    pub fn user_images_metadata_path(&self, creator: &str) -> PathBuf {
        self.user_images_dir(creator).join(USER_IMAGES_METADATA_FILE)
    }
}

/// In-progress partial for a destination: `<name>.tmp` in the same
/// directory. Consumers never see half-written files under final names.
pub fn tmp_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".tmp");
    dest.with_file_name(name)
}

/// Stem of a remote file name (name up to the last dot).
fn file_stem(remote_name: &str) -> String {
    let sanitized = sanitize_segment(remote_name);
    match sanitized.rfind('.') {
        Some(dot) if dot > 0 => sanitized[..dot].to_string(),
        _ => sanitized,
    }
}

/// Infers an image extension from a URL path, stripping any query string;
/// falls back to `.jpeg`.
pub fn image_ext_from_url(url: &str) -> String {
    let path = url.split('?').next().unwrap_or(url);
    let last = path.rsplit('/').next().unwrap_or(path);
    match last.rfind('.') {
        Some(dot) if dot + 1 < last.len() && last.len() - dot <= 6 => {
            last[dot..].to_ascii_lowercase()
        }
        _ => DEFAULT_IMAGE_EXT.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner() -> PathPlanner {
        PathPlanner::new("/data/civitai", TagTable::default())
    }

    fn tags(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_version_dir_layout() {
        let dir = planner().version_dir(
            "alice",
            "Neon City",
            "v2.0",
            Some("SDXL 1.0"),
            &tags(&["style"]),
        );
        assert_eq!(
            dir,
            PathBuf::from("/data/civitai/models/SDXL 1.0/STYLE/alice_Neon City_v2.0")
        );
    }

    #[test]
    fn test_version_dir_sanitizes_segments() {
        let dir = planner().version_dir(
            "bad/user",
            "what?",
            "v:1",
            Some("SD 1.5"),
            &tags(&[]),
        );
        assert_eq!(
            dir,
            PathBuf::from("/data/civitai/models/SD 1.5/MISC/bad_user_what__v_1")
        );
    }

    #[test]
    fn test_missing_base_model_becomes_unknown() {
        let dir = planner().version_dir("a", "b", "c", None, &tags(&[]));
        assert!(dir.starts_with("/data/civitai/models/Unknown"));
    }

    #[test]
    fn test_sidecar_names_derive_from_stem() {
        let p = planner();
        let dir = PathBuf::from("/data/civitai/models/SD 1.5/MISC/a_b_c");
        assert_eq!(
            p.info_path(&dir, "model.v1.safetensors"),
            dir.join("model.v1.civitai.info")
        );
        assert_eq!(p.description_path(&dir), dir.join("description.md"));
    }

    #[test]
    fn test_preview_numbering() {
        let p = planner();
        let dir = PathBuf::from("/d");
        let url = "https://img.example.com/abc/img.png?width=450";
        assert_eq!(
            p.preview_path(&dir, "model.safetensors", 0, url),
            dir.join("model.preview.png")
        );
        assert_eq!(
            p.preview_path(&dir, "model.safetensors", 1, url),
            dir.join("model.preview.2.png")
        );
        assert_eq!(
            p.preview_path(&dir, "model.safetensors", 4, url),
            dir.join("model.preview.5.png")
        );
    }

    #[test]
    fn test_gallery_and_user_image_paths() {
        let p = planner();
        let dir = PathBuf::from("/d");
        assert_eq!(
            p.gallery_path(&dir, 991, "https://x/y/z.jpeg"),
            dir.join("Gallery").join("991.jpeg")
        );
        assert_eq!(
            p.user_image_path("alice", 77, "https://x/y/noext"),
            PathBuf::from("/data/civitai/images/alice/77.jpeg")
        );
        assert_eq!(
            p.user_images_metadata_path("alice"),
            PathBuf::from("/data/civitai/images/alice/images_metadata.json")
        );
    }

    #[test]
    fn test_image_ext_inference() {
        assert_eq!(image_ext_from_url("https://a/b/c.PNG?w=1"), ".png");
        assert_eq!(image_ext_from_url("https://a/b/c"), ".jpeg");
        assert_eq!(image_ext_from_url("https://a/b.dir/c"), ".jpeg");
    }

    #[test]
    fn test_tmp_path_appends_suffix() {
        assert_eq!(
            tmp_path(Path::new("/d/model.safetensors")),
            PathBuf::from("/d/model.safetensors.tmp")
        );
    }

    #[test]
    fn test_planning_is_deterministic() {
        let p = planner();
        let t = tags(&["character", "anime"]);
        let a = p.version_dir("u", "m", "v", Some("Pony"), &t);
        let b = p.version_dir("u", "m", "v", Some("Pony"), &t);
        assert_eq!(a, b);
    }
}
