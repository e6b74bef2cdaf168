#![forbid(unsafe_code)]

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tubefetch::{
    cache::TtlCache,
    config::{RuntimeConfig, RuntimeOverrides, resolve_runtime_config},
    download::Downloader,
    engine::{ExtractionEngine, YtDlp},
    extract::Extractor,
    server::{AppState, router},
    tools::{Transcoder, program_available},
};

/// Video metadata and download API backed by yt-dlp and ffmpeg.
#[derive(Debug, Parser)]
#[command(name = "tubefetch-backend", version)]
struct BackendArgs {
    /// Address to listen on (TUBEFETCH_HOST).
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (TUBEFETCH_PORT).
    #[arg(long)]
    port: Option<u16>,
    /// Directory that receives per-request workspaces (TUBEFETCH_WORKSPACE).
    #[arg(long)]
    workspace: Option<PathBuf>,
    /// Dotenv file consulted after the process environment.
    #[arg(long = "env-file")]
    env_file: Option<PathBuf>,
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,
}

impl BackendArgs {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            host: self.host.clone(),
            port: self.port,
            workspace_root: self.workspace.clone(),
            env_path: self.env_file.clone(),
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "tubefetch=debug,backend=debug,info"
    } else {
        "tubefetch=info,backend=info,warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Only explicit paths are forwarded to yt-dlp; a bare program name is left
/// for yt-dlp to find on its own.
fn explicit_location(binary: &Path) -> Option<PathBuf> {
    (binary.is_absolute() || binary.components().count() > 1).then(|| binary.to_path_buf())
}

fn build_state(config: &RuntimeConfig) -> Result<AppState> {
    std::fs::create_dir_all(&config.workspace_root).with_context(|| {
        format!(
            "creating workspace root {}",
            config.workspace_root.display()
        )
    })?;

    let engine_available = program_available(&config.ytdlp, "--version");
    if !engine_available {
        warn!(
            program = %config.ytdlp.display(),
            "yt-dlp not found; metadata and download requests will fail"
        );
    }
    let transcoder = Transcoder::detect(&config.ffmpeg);

    let engine: Arc<dyn ExtractionEngine> = Arc::new(
        YtDlp::new(&config.ytdlp)
            .with_ffmpeg_location(transcoder.binary().and_then(explicit_location)),
    );
    let extractor = Extractor::new(
        Arc::clone(&engine),
        TtlCache::new(config.cache_ttl, config.cache_capacity),
    );
    let downloader = Downloader::new(engine, transcoder, &config.workspace_root);
    Ok(AppState::new(
        extractor,
        downloader,
        engine_available,
        config.max_downloads,
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = BackendArgs::parse();
    init_logging(args.verbose);

    let config = resolve_runtime_config(args.overrides()).context("loading configuration")?;
    let state = build_state(&config)?;
    info!(
        workspace = %config.workspace_root.display(),
        cache_ttl_secs = config.cache_ttl.as_secs(),
        cache_capacity = config.cache_capacity,
        max_downloads = config.max_downloads,
        "configuration resolved"
    );

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("binding to {}:{}", config.host, config.port))?;
    info!("API server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still ends the process.
    if let Err(err) = signal::ctrl_c().await {
        warn!("failed to install Ctrl+C handler: {err}");
    }
}
