//! Work enumeration.
//!
//! Walks the configured inputs (user handles, explicit model ids), fetches
//! paginated metadata, and persists every resulting work item into the
//! Task Store *before* any download is scheduled, so a crash between
//! enumeration and download resumes correctly. Work is deduplicated
//! across inputs by remote identifier.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::models::Model;
use crate::api::ApiClient;
use crate::config::DownloadConfig;
use crate::enumerate::inputs::{normalize_model_entry, normalize_user_entry};
use crate::error::{EngineError, EngineResult};
use crate::filter::BaseModelFilter;
use crate::metadata::{materialize_user_images, materialize_version};
use crate::planner::PathPlanner;
use crate::store::{
    FileTaskPayload, ImageTaskPayload, MetadataTaskPayload, NewTask, TaskKind, TaskStore,
};

/// Counters reported after an enumeration pass.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnumerationStats {
    pub models_seen: u64,
    pub models_skipped: u64,
    pub versions_admitted: u64,
    pub versions_rejected: u64,
    pub tasks_enqueued: u64,
}

impl EnumerationStats {
    fn absorb(&mut self, other: EnumerationStats) {
        self.models_seen += other.models_seen;
        self.models_skipped += other.models_skipped;
        self.versions_admitted += other.versions_admitted;
        self.versions_rejected += other.versions_rejected;
        self.tasks_enqueued += other.tasks_enqueued;
    }
}

/// Emits work items for users and models into the Task Store.
pub struct Enumerator {
    api: Arc<ApiClient>,
    store: Arc<TaskStore>,
    planner: Arc<PathPlanner>,
    filter: Arc<BaseModelFilter>,
    max_gallery_images: usize,
    max_user_images: usize,
    /// Remote model ids already expanded in this run.
    seen_models: Mutex<HashSet<u64>>,
}

impl Enumerator {
    pub fn new(
        api: Arc<ApiClient>,
        store: Arc<TaskStore>,
        planner: Arc<PathPlanner>,
        filter: Arc<BaseModelFilter>,
        config: &DownloadConfig,
    ) -> Self {
        Self {
            api,
            store,
            planner,
            filter,
            max_gallery_images: config.max_gallery_images,
            max_user_images: config.max_user_images,
            seen_models: Mutex::new(HashSet::new()),
        }
    }

    /// Enumerates all configured inputs. Explicit model ids become
    /// `metadata-fetch` tasks; user handles are expanded inline because
    /// the listing endpoint already returns full model payloads.
    pub async fn enumerate(
        &self,
        config: &DownloadConfig,
        cancel: &CancellationToken,
    ) -> EngineResult<EnumerationStats> {
        let mut stats = EnumerationStats::default();

        for entry in &config.inputs.models {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let Some(model_id) = normalize_model_entry(entry) else {
                warn!(entry = %entry, "unparseable model entry; skipping");
                continue;
            };
            let task = NewTask::metadata_fetch(&MetadataTaskPayload { model_id });
            if self.store.enqueue(task)? {
                stats.tasks_enqueued += 1;
            }
        }

        for entry in &config.inputs.users {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let username = normalize_user_entry(entry);
            stats.absorb(self.enumerate_user(&username, cancel).await?);
        }

        info!(
            models = stats.models_seen,
            admitted = stats.versions_admitted,
            rejected = stats.versions_rejected,
            enqueued = stats.tasks_enqueued,
            "enumeration complete"
        );
        Ok(stats)
    }

    /// All models of one user, plus their posted images.
    async fn enumerate_user(
        &self,
        username: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<EnumerationStats> {
        info!(username, "enumerating user");
        let mut stats = EnumerationStats::default();

        let models = self.api.user_models(username).await?;
        info!(username, count = models.len(), "models listed");

        for raw in &models {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            stats.absorb(self.expand_model(raw).await?);
        }

        stats.absorb(self.enumerate_user_images(username).await?);
        Ok(stats)
    }

    /// User-posted images: metadata sidecar plus one task per image.
    async fn enumerate_user_images(&self, username: &str) -> EngineResult<EnumerationStats> {
        let mut stats = EnumerationStats::default();
        let items = self.api.user_images(username, self.max_user_images).await?;
        if items.is_empty() {
            return Ok(stats);
        }

        materialize_user_images(&self.planner, username, &items)?;

        for raw in &items {
            let Some(image) = decode_image(raw) else { continue };
            let Some(image_id) = image.id else { continue };
            let payload = ImageTaskPayload {
                image_id: Some(image_id),
                dest: self.planner.user_image_path(username, image_id, &image.url),
                url: image.url,
            };
            if self
                .store
                .enqueue(NewTask::image(TaskKind::UserImage, &payload))?
            {
                stats.tasks_enqueued += 1;
            }
        }

        info!(username, count = items.len(), "user images enumerated");
        Ok(stats)
    }

    /// Expands one full model payload into sidecars and download tasks.
    ///
    /// Also the back half of a `metadata-fetch` task: the engine fetches
    /// `/models/{id}` and hands the payload here.
    pub async fn expand_model(&self, raw: &Value) -> EngineResult<EnumerationStats> {
        let mut stats = EnumerationStats::default();

        let model = match Model::from_value(raw) {
            Ok(model) => model,
            Err(error) => {
                // Tolerate malformed items rather than aborting the batch.
                warn!(%error, "skipping undecodable model item");
                stats.models_skipped += 1;
                return Ok(stats);
            }
        };

        {
            let mut seen = self.seen_models.lock().expect("seen set poisoned");
            if !seen.insert(model.id) {
                return Ok(stats);
            }
        }
        stats.models_seen += 1;

        if !model.is_active() {
            info!(model_id = model.id, mode = ?model.mode, "model not active; skipping");
            stats.models_skipped += 1;
            return Ok(stats);
        }

        let creator = model.creator_name().to_string();
        let fetched_at = Utc::now();
        let mut first_admitted_dir: Option<std::path::PathBuf> = None;

        for version in &model.model_versions {
            if !self.filter.admit(version.base_model.as_deref()) {
                stats.versions_rejected += 1;
                continue;
            }
            stats.versions_admitted += 1;

            let version_dir = self.planner.version_dir(
                &creator,
                &model.name,
                &version.name,
                version.base_model.as_deref(),
                &model.tags,
            );

            materialize_version(&self.planner, &version_dir, &model, version, raw, fetched_at)?;
            if first_admitted_dir.is_none() {
                first_admitted_dir = Some(version_dir.clone());
            }

            // Binary files.
            let stem_source = version
                .primary_file()
                .map(|f| f.name.clone())
                .unwrap_or_else(|| format!("version-{}", version.id));
            for file in &version.files {
                let Some(url) = file
                    .download_url
                    .clone()
                    .or_else(|| version.download_url.clone())
                else {
                    warn!(version_id = version.id, file = %file.name, "file has no download URL");
                    continue;
                };
                let file_name = if file.name.is_empty() {
                    format!("version-{}.safetensors", version.id)
                } else {
                    file.name.clone()
                };
                let payload = FileTaskPayload {
                    model_id: model.id,
                    version_id: version.id,
                    url,
                    dest: self.planner.file_path(&version_dir, &file_name),
                    file_name,
                    size_kb: file.size_kb,
                    expected_sha256: crate::integrity::select_digest(&file.hashes)
                        .filter(|(algo, _)| *algo == crate::integrity::HashAlgo::Sha256)
                        .map(|(_, digest)| digest),
                };
                if self.store.enqueue(NewTask::model_file(&payload))? {
                    stats.tasks_enqueued += 1;
                }
            }

            // Version previews.
            for (index, image) in version.images.iter().enumerate() {
                let payload = ImageTaskPayload {
                    image_id: image.id,
                    dest: self
                        .planner
                        .preview_path(&version_dir, &stem_source, index, &image.url),
                    url: image.url.clone(),
                };
                if self
                    .store
                    .enqueue(NewTask::image(TaskKind::PreviewImage, &payload))?
                {
                    stats.tasks_enqueued += 1;
                }
            }

        }

        // Gallery images belong to the model; they land once, under the
        // first admitted version's directory.
        if let Some(gallery_dir) = first_admitted_dir {
            let gallery = self
                .api
                .model_images(model.id, self.max_gallery_images)
                .await?;
            for raw_image in &gallery {
                let Some(image) = decode_image(raw_image) else {
                    continue;
                };
                let Some(image_id) = image.id else { continue };
                let payload = ImageTaskPayload {
                    image_id: Some(image_id),
                    dest: self.planner.gallery_path(&gallery_dir, image_id, &image.url),
                    url: image.url,
                };
                if self
                    .store
                    .enqueue(NewTask::image(TaskKind::GalleryImage, &payload))?
                {
                    stats.tasks_enqueued += 1;
                }
            }
        }

        Ok(stats)
    }
}

impl std::fmt::Debug for Enumerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enumerator")
            .field("max_gallery_images", &self.max_gallery_images)
            .field("max_user_images", &self.max_user_images)
            .finish()
    }
}

fn decode_image(raw: &Value) -> Option<crate::api::models::ImageEntry> {
    match crate::api::models::ImageEntry::from_value(raw) {
        Ok(image) => Some(image),
        Err(error) => {
            warn!(%error, "skipping undecodable image item");
            None
        }
    }
}
