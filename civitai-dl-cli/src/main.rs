//! civitai-dl CLI - command-line front end
//!
//! This binary parses arguments, loads the input lists, assembles the
//! engine configuration, and maps the batch outcome to an exit code.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use civitai_dl::config::Inputs;
use civitai_dl::enumerate::inputs::parse_list_file;
use civitai_dl::{BatchRunner, DownloadConfig};

#[derive(Parser)]
#[command(name = "civitai-dl")]
#[command(about = "Bulk-download models and images from Civitai", long_about = None)]
#[command(version)]
struct Args {
    /// API token (falls back to the CIVITAI_API_KEY environment variable)
    #[arg(long)]
    token: Option<String>,

    /// Output root directory (default: OS data directory)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Test mode: download into ./test_downloads/
    #[arg(long)]
    test: bool,

    /// User handle or profile URL to download (repeatable)
    #[arg(long = "user")]
    users: Vec<String>,

    /// Model id or model URL to download (repeatable)
    #[arg(long = "model")]
    models: Vec<String>,

    /// File with one user handle/URL per line
    #[arg(long)]
    user_list: Option<PathBuf>,

    /// File with one model id/URL per line
    #[arg(long)]
    model_list: Option<PathBuf>,

    /// Base-model whitelist file (substring match, one entry per line)
    #[arg(long)]
    base_model_filter: Option<PathBuf>,

    /// Maximum concurrent model-file downloads
    #[arg(long, default_value_t = 3)]
    max_concurrent: usize,

    /// Disable parallel pipelines (fully sequential operation)
    #[arg(long)]
    sequential: bool,

    /// Treat pre-existing files with matching names as done
    #[arg(long)]
    skip_existing: bool,

    /// Maximum user-posted images fetched per user
    #[arg(long, default_value_t = 1000)]
    max_user_images: usize,

    /// Maximum retry attempts per task
    #[arg(long, default_value_t = 5)]
    max_attempts: u32,

    /// Disable resume of partial downloads
    #[arg(long)]
    no_resume: bool,
}

fn build_config(args: &Args) -> Result<DownloadConfig, String> {
    let mut users = args.users.clone();
    if let Some(path) = &args.user_list {
        users.extend(parse_list_file(path).map_err(|e| e.to_string())?);
    }

    let mut models = args.models.clone();
    if let Some(path) = &args.model_list {
        models.extend(parse_list_file(path).map_err(|e| e.to_string())?);
    }

    let mut config = DownloadConfig {
        api_token: args
            .token
            .clone()
            .or_else(|| std::env::var("CIVITAI_API_KEY").ok()),
        test_mode: args.test,
        inputs: Inputs { users, models },
        max_concurrent_downloads: args.max_concurrent,
        parallel_mode: !args.sequential,
        skip_existing: args.skip_existing,
        base_model_filter_path: args.base_model_filter.clone(),
        max_user_images: args.max_user_images,
        ..DownloadConfig::default()
    };
    if let Some(output) = &args.output {
        config.output_root = output.clone();
    }
    config.retry.max_attempts = args.max_attempts;
    config.resume.enabled = !args.no_resume;

    Ok(config)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(2);
        }
    };

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; winding down");
            signal_cancel.cancel();
        }
    });

    let outcome = BatchRunner::new(config).run(cancel).await;
    process::exit(outcome.exit_code());
}
