//! Integration tests for the offline half of the download path:
//! destination planning, sidecar materialization, and the engine's
//! skip/dedup decisions. No network involved.
//!
//! Run with: `cargo test --test download_layout_integration`

use std::fs;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use civitai_dl::api::models::Model;
use civitai_dl::api::ApiClient;
use civitai_dl::config::{DownloadConfig, Inputs};
use civitai_dl::engine::{DownloadEngine, Outcome};
use civitai_dl::enumerate::Enumerator;
use civitai_dl::events::MemorySink;
use civitai_dl::filter::BaseModelFilter;
use civitai_dl::metadata::materialize_version;
use civitai_dl::planner::{PathPlanner, TagTable};
use civitai_dl::ratelimit::RateGovernor;
use civitai_dl::store::{FileTaskPayload, NewTask, Task, TaskKind, TaskStatus, TaskStore};
use civitai_dl::transport::{HttpTransport, RetryPolicy};

// ============================================================================
// Helper Functions
// ============================================================================

/// SHA-256 of b"hello world".
const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

fn sample_payload() -> serde_json::Value {
    json!({
        "id": 42,
        "name": "Neon City",
        "type": "LORA",
        "tags": ["style", "cyberpunk"],
        "creator": {"username": "alice"},
        "modelVersions": [{
            "id": 101,
            "modelId": 42,
            "name": "v2.0",
            "baseModel": "SDXL 1.0",
            "trainedWords": ["neon"],
            "downloadUrl": "https://example.com/dl/101",
            "files": [{
                "name": "neon_city.safetensors",
                "sizeKB": 2048.0,
                "primary": true,
                "hashes": {"SHA256": HELLO_SHA256},
            }],
        }],
    })
}

fn test_config(root: &std::path::Path) -> DownloadConfig {
    DownloadConfig {
        output_root: root.to_path_buf(),
        inputs: Inputs {
            users: vec!["alice".into()],
            models: vec![],
        },
        ..DownloadConfig::default()
    }
}

/// Builds an engine and its store over a temp root.
fn build_engine(config: &DownloadConfig) -> (DownloadEngine, Arc<TaskStore>) {
    config.ensure_layout().unwrap();
    let transport = Arc::new(HttpTransport::new(config).unwrap());
    let governor = Arc::new(RateGovernor::new(config.rate, 4));
    let store = Arc::new(TaskStore::open(&config.db_path()).unwrap());
    let planner = Arc::new(PathPlanner::new(config.root(), TagTable::default()));
    let filter = Arc::new(BaseModelFilter::inactive());
    let api = Arc::new(ApiClient::new(
        Arc::clone(&transport),
        Arc::clone(&governor),
        RetryPolicy::new(config.retry),
        config.api_base_url.clone(),
    ));
    let enumerator = Arc::new(Enumerator::new(
        Arc::clone(&api),
        Arc::clone(&store),
        planner,
        filter,
        config,
    ));
    let events = Arc::new(MemorySink::new());
    let engine = DownloadEngine::new(
        transport,
        Arc::clone(&store),
        api,
        enumerator,
        events,
        config,
    );
    (engine, store)
}

fn claim_one(store: &TaskStore, kind: TaskKind) -> Task {
    store.claim(&[kind], 1).unwrap().remove(0)
}

// ============================================================================
// Planner + Materializer
// ============================================================================

/// The full on-disk layout for one (model, version): classification
/// directory, sidecars, and deterministic re-planning.
#[test]
fn test_version_layout_and_sidecars() {
    let temp = TempDir::new().unwrap();
    let planner = PathPlanner::new(temp.path(), TagTable::default());

    let raw = sample_payload();
    let model = Model::from_value(&raw).unwrap();
    let version = &model.model_versions[0];

    let dir = planner.version_dir(
        model.creator_name(),
        &model.name,
        &version.name,
        version.base_model.as_deref(),
        &model.tags,
    );
    assert_eq!(
        dir,
        temp.path()
            .join("models")
            .join("SDXL 1.0")
            .join("STYLE")
            .join("alice_Neon City_v2.0")
    );

    materialize_version(&planner, &dir, &model, version, &raw, Utc::now()).unwrap();

    let info = fs::read_to_string(dir.join("neon_city.civitai.info")).unwrap();
    let round_trip: serde_json::Value = serde_json::from_str(&info).unwrap();
    assert_eq!(round_trip, raw);

    let description = fs::read_to_string(dir.join("description.md")).unwrap();
    assert!(description.contains("# Neon City"));
    assert!(description.contains(HELLO_SHA256));

    // Identical metadata plans identically.
    let again = planner.version_dir(
        model.creator_name(),
        &model.name,
        &version.name,
        version.base_model.as_deref(),
        &model.tags,
    );
    assert_eq!(dir, again);
}

// ============================================================================
// Engine skip / dedup decisions
// ============================================================================

/// A pre-existing final file with a matching digest is skipped without
/// any transfer, and the artifact index learns about it.
#[tokio::test]
async fn test_existing_verified_file_is_skipped() {
    let temp = TempDir::new().unwrap();
    let config = test_config(temp.path());
    let (engine, store) = build_engine(&config);

    let dest = config.models_dir().join("neon_city.safetensors");
    fs::create_dir_all(dest.parent().unwrap()).unwrap();
    fs::write(&dest, b"hello world").unwrap();

    store
        .enqueue(NewTask::model_file(&FileTaskPayload {
            model_id: 42,
            version_id: 101,
            url: "https://example.com/dl/101".into(),
            file_name: "neon_city.safetensors".into(),
            size_kb: 0.0107421875,
            expected_sha256: Some(HELLO_SHA256.into()),
            dest: dest.clone(),
        }))
        .unwrap();

    let task = claim_one(&store, TaskKind::ModelFile);
    let outcome = engine.execute(&task, &CancellationToken::new()).await;

    match outcome {
        Outcome::Finished { status, bytes, .. } => {
            assert_eq!(status, TaskStatus::Done);
            assert_eq!(bytes, 0);
        }
        other => panic!("expected skip, got {other:?}"),
    }
    assert_eq!(store.artifact_path(HELLO_SHA256).unwrap(), Some(dest));
}

/// A digest already on disk elsewhere in the tree is linked, not
/// re-downloaded.
#[tokio::test]
async fn test_digest_dedup_links_existing_artifact() {
    let temp = TempDir::new().unwrap();
    let config = test_config(temp.path());
    let (engine, store) = build_engine(&config);

    let original = config.models_dir().join("a").join("file.safetensors");
    fs::create_dir_all(original.parent().unwrap()).unwrap();
    fs::write(&original, b"hello world").unwrap();
    store.record_artifact(HELLO_SHA256, &original).unwrap();

    let dest = config.models_dir().join("b").join("file.safetensors");
    store
        .enqueue(NewTask::model_file(&FileTaskPayload {
            model_id: 1,
            version_id: 2,
            url: "https://example.com/dl/2".into(),
            file_name: "file.safetensors".into(),
            size_kb: 0.0107421875,
            expected_sha256: Some(HELLO_SHA256.into()),
            dest: dest.clone(),
        }))
        .unwrap();

    let task = claim_one(&store, TaskKind::ModelFile);
    let outcome = engine.execute(&task, &CancellationToken::new()).await;

    assert!(matches!(
        outcome,
        Outcome::Finished {
            status: TaskStatus::Done,
            ..
        }
    ));
    assert_eq!(fs::read(&dest).unwrap(), b"hello world");
}

/// `skip_existing` treats a large-enough pre-existing file as done, but
/// re-fetches stubs at or below 1 KiB.
#[tokio::test]
async fn test_skip_existing_honors_size_guard() {
    let temp = TempDir::new().unwrap();
    let mut config = test_config(temp.path());
    config.skip_existing = true;
    let (engine, store) = build_engine(&config);

    let big = config.images_dir().join("big.png");
    fs::create_dir_all(big.parent().unwrap()).unwrap();
    fs::write(&big, vec![0u8; 4096]).unwrap();

    store
        .enqueue(NewTask::image(
            TaskKind::UserImage,
            &civitai_dl::store::ImageTaskPayload {
                image_id: Some(1),
                url: "https://example.com/i/1.png".into(),
                dest: big,
            },
        ))
        .unwrap();

    let task = claim_one(&store, TaskKind::UserImage);
    let outcome = engine.execute(&task, &CancellationToken::new()).await;
    assert!(matches!(
        outcome,
        Outcome::Finished {
            status: TaskStatus::Skipped,
            ..
        }
    ));
}

/// The base-model whitelist admits substring matches case-insensitively
/// and rejects everything else.
#[test]
fn test_whitelist_filter_scenario() {
    let filter = BaseModelFilter::new(vec!["Illustrious".into(), "Pony".into()]);

    assert!(!filter.admit(Some("SDXL 1.0")));
    assert!(filter.admit(Some("Pony Diffusion V6 XL")));
    assert!(filter.admit(Some("Illustrious")));

    let (accepted, rejected) = filter.stats();
    assert_eq!((accepted, rejected), (2, 1));
}
