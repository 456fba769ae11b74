//! Engine configuration.
//!
//! `DownloadConfig` is the struct the CLI hands to [`crate::app::BatchRunner`].
//! It combines credentials, input selection, concurrency and rate budgets,
//! retry/resume policy, and the destination layout roots.

use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;

use crate::error::{EngineError, EngineResult};

/// Default ceiling for concurrent model-file downloads.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 3;

/// Default concurrency of the model pipeline.
pub const DEFAULT_MODEL_PIPELINE_CONCURRENCY: usize = 1;

/// Default concurrency of the image pipeline.
pub const DEFAULT_IMAGE_PIPELINE_CONCURRENCY: usize = 2;

/// Default cap on user-posted images fetched per user.
pub const DEFAULT_MAX_USER_IMAGES: usize = 1000;

/// Default cap on gallery images fetched per model.
pub const DEFAULT_MAX_GALLERY_IMAGES: usize = 50;

/// Official API endpoint; the only default (fallback endpoints are
/// configuration, not policy).
pub const DEFAULT_API_BASE_URL: &str = "https://civitai.com/api/v1";

/// Output root used when `test_mode` is set.
pub const TEST_OUTPUT_ROOT: &str = "./test_downloads";

/// Top-level configuration consumed from the CLI.
#[derive(Clone, Debug)]
pub struct DownloadConfig {
    /// Bearer credential applied to every request; anonymous when absent.
    pub api_token: Option<String>,

    /// Destination root for the whole tree (`models/`, `images/`,
    /// `corrupted/`, `.state/`).
    pub output_root: PathBuf,

    /// When set, `output_root` is overridden with [`TEST_OUTPUT_ROOT`].
    pub test_mode: bool,

    /// Work selection: user handles and explicit model identifiers.
    pub inputs: Inputs,

    /// Ceiling for concurrent model-file downloads (also the model
    /// pipeline's configurable maximum).
    pub max_concurrent_downloads: usize,

    /// Concurrency of the model pipeline (clamped to
    /// `max_concurrent_downloads`).
    pub model_pipeline_concurrency: usize,

    /// Concurrency of the image pipeline (ceiling is
    /// `2 * max_concurrent_downloads`).
    pub image_pipeline_concurrency: usize,

    /// When false, both pipelines run with a single permit regardless of
    /// the settings above.
    pub parallel_mode: bool,

    /// Treat a pre-existing file with a matching name as done without a
    /// digest recheck (files smaller than 1 KiB are still re-fetched).
    pub skip_existing: bool,

    /// Optional whitelist file for the base-model filter.
    pub base_model_filter_path: Option<PathBuf>,

    /// Cap on user-posted images fetched per user handle.
    pub max_user_images: usize,

    /// Cap on gallery images fetched per model.
    pub max_gallery_images: usize,

    /// Rate budgets per logical channel.
    pub rate: RateConfig,

    /// Retry policy knobs.
    pub retry: RetryConfig,

    /// Resume behavior.
    pub resume: ResumeConfig,

    /// HTTP timeout knobs.
    pub timeouts: TimeoutConfig,

    /// API endpoint; the official endpoint unless overridden.
    pub api_base_url: String,

    /// How long workers get to wind down after cancellation.
    pub shutdown_grace: Duration,
}

/// Work selection inputs. Entries may be fully-qualified URLs; the
/// enumerator strips them down to handles / identifiers.
#[derive(Clone, Debug, Default)]
pub struct Inputs {
    /// User handles (or `https://civitai.com/user/<handle>` URLs).
    pub users: Vec<String>,
    /// Model identifiers (or `https://civitai.com/models/<id>/...` URLs).
    pub models: Vec<String>,
}

impl Inputs {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.models.is_empty()
    }
}

/// Rate budgets per logical channel.
#[derive(Clone, Copy, Debug)]
pub struct RateConfig {
    /// model-api channel refill rate (tokens per second).
    pub model_api_rps: f64,
    /// image-api channel refill rate (tokens per second).
    pub image_api_rps: f64,
    /// Shared bound on concurrent API requests across both API channels.
    pub max_concurrent_api: usize,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            model_api_rps: 0.5,
            image_api_rps: 2.0,
            max_concurrent_api: 4,
        }
    }
}

/// Retry policy knobs.
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    /// Maximum attempts per task, including the first.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

/// Resume behavior.
#[derive(Clone, Copy, Debug)]
pub struct ResumeConfig {
    /// When true, partial `.tmp` files are continued with Range requests.
    pub enabled: bool,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// HTTP timeout knobs. The total timeout for a file download is computed
/// adaptively: `max(total_base, size_MB * secs_per_mb * (1 + recent
/// failure rate))`.
#[derive(Clone, Copy, Debug)]
pub struct TimeoutConfig {
    /// Fixed connect timeout.
    pub connect: Duration,
    /// Time allowed until the first response byte.
    pub first_byte: Duration,
    /// Floor for the adaptive total timeout.
    pub total_base: Duration,
    /// Seconds budgeted per megabyte of declared size.
    pub secs_per_mb: f64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            first_byte: Duration::from_secs(30),
            total_base: Duration::from_secs(30),
            secs_per_mb: 2.0,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            api_token: None,
            output_root: default_output_root(),
            test_mode: false,
            inputs: Inputs::default(),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            model_pipeline_concurrency: DEFAULT_MODEL_PIPELINE_CONCURRENCY,
            image_pipeline_concurrency: DEFAULT_IMAGE_PIPELINE_CONCURRENCY,
            parallel_mode: true,
            skip_existing: false,
            base_model_filter_path: None,
            max_user_images: DEFAULT_MAX_USER_IMAGES,
            max_gallery_images: DEFAULT_MAX_GALLERY_IMAGES,
            rate: RateConfig::default(),
            retry: RetryConfig::default(),
            resume: ResumeConfig::default(),
            timeouts: TimeoutConfig::default(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl DownloadConfig {
    /// Product token sent as the `User-Agent` header.
    pub fn user_agent() -> String {
        format!("civitai-dl/{}", env!("CARGO_PKG_VERSION"))
    }

    /// Effective destination root, honoring `test_mode`.
    pub fn root(&self) -> PathBuf {
        if self.test_mode {
            PathBuf::from(TEST_OUTPUT_ROOT)
        } else {
            self.output_root.clone()
        }
    }

    /// `<root>/models/`
    pub fn models_dir(&self) -> PathBuf {
        self.root().join("models")
    }

    /// `<root>/images/`
    pub fn images_dir(&self) -> PathBuf {
        self.root().join("images")
    }

    /// `<root>/corrupted/` - quarantine for integrity failures.
    pub fn corrupted_dir(&self) -> PathBuf {
        self.root().join("corrupted")
    }

    /// `<root>/.state/` - task store, backups, sentinel files.
    pub fn state_dir(&self) -> PathBuf {
        self.root().join(".state")
    }

    /// `<root>/.state/tasks.db`
    pub fn db_path(&self) -> PathBuf {
        self.state_dir().join("tasks.db")
    }

    /// `<root>/.state/emergency_stop` - presence aborts all pipelines.
    pub fn emergency_stop_path(&self) -> PathBuf {
        self.state_dir().join("emergency_stop")
    }

    /// `<root>/failed.txt` - machine-readable failure summary.
    pub fn failed_summary_path(&self) -> PathBuf {
        self.root().join("failed.txt")
    }

    /// Effective model pipeline permits, after `parallel_mode` and the
    /// configured ceiling are applied.
    pub fn model_permits(&self) -> usize {
        if !self.parallel_mode {
            return 1;
        }
        self.model_pipeline_concurrency
            .clamp(1, self.max_concurrent_downloads.max(1))
    }

    /// Effective image pipeline permits (ceiling `2 * max_concurrent`).
    pub fn image_permits(&self) -> usize {
        if !self.parallel_mode {
            return 1;
        }
        self.image_pipeline_concurrency
            .clamp(1, (2 * self.max_concurrent_downloads).max(1))
    }

    /// Shared file-transfer permit budget across both file channels
    /// (model pipeline ceiling plus image pipeline ceiling).
    pub fn file_transfer_permits(&self) -> usize {
        (3 * self.max_concurrent_downloads).max(2)
    }

    /// Validates invariants that would otherwise surface as confusing
    /// runtime failures.
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_concurrent_downloads == 0 {
            return Err(EngineError::InvalidConfig(
                "max_concurrent_downloads must be >= 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::InvalidConfig(
                "retry.max_attempts must be >= 1".into(),
            ));
        }
        if self.rate.model_api_rps <= 0.0 || self.rate.image_api_rps <= 0.0 {
            return Err(EngineError::InvalidConfig(
                "rate limits must be positive".into(),
            ));
        }
        if self.inputs.is_empty() {
            return Err(EngineError::InvalidConfig(
                "no inputs: provide at least one user or model".into(),
            ));
        }
        if !self.test_mode && !self.output_root.is_absolute() {
            return Err(EngineError::InvalidConfig(format!(
                "output_root must be absolute, got {}",
                self.output_root.display()
            )));
        }
        Ok(())
    }

    /// Creates the destination skeleton (`models/`, `images/`,
    /// `corrupted/`, `.state/`).
    pub fn ensure_layout(&self) -> EngineResult<()> {
        for dir in [
            self.root(),
            self.models_dir(),
            self.images_dir(),
            self.corrupted_dir(),
            self.state_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| EngineError::io(dir.clone(), e))?;
        }
        Ok(())
    }
}

/// OS-appropriate default output root
/// (e.g. `~/.local/share/civitai-dl/downloads` on Linux).
pub fn default_output_root() -> PathBuf {
    ProjectDirs::from("com", "civitai-dl", "civitai-dl")
        .map(|dirs| dirs.data_dir().join("downloads"))
        .unwrap_or_else(|| PathBuf::from("./civitai-downloads"))
}
