use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lora_manager_cache::{
    is_image_path, is_video_path, Bitmap, CacheStats, CancellationToken, FileImageDecoder,
    ThumbnailConfig,
};
use lora_manager_scheduler::{
    RequestStats, ThumbnailOrchestrator, ThumbnailOwner, ThumbnailPriority,
};
use serde::Serialize;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

#[derive(Debug, Parser)]
#[command(name = "lora-thumbs")]
#[command(about = "LoRA dataset thumbnail tool")]
pub struct Cli {
    /// Configuration file (defaults to the per-user config location).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Decode thumbnails for every image and video in a dataset folder.
    Warm {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
        /// Thumbnail width in pixels (defaults to the configured width).
        #[arg(long)]
        width: Option<u32>,
        /// Descend into subfolders.
        #[arg(long)]
        recursive: bool,
        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Render one thumbnail to a PNG file.
    Render {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML.
    Config {
        /// Write the configuration to this file instead of printing it.
        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, Serialize)]
struct WarmOutput {
    directory: String,
    files: usize,
    loaded: usize,
    unavailable: Vec<String>,
    cache: CacheOutput,
    requests: RequestOutput,
}

#[derive(Debug, Serialize)]
struct CacheOutput {
    count: usize,
    capacity: usize,
    estimated_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl From<CacheStats> for CacheOutput {
    fn from(stats: CacheStats) -> Self {
        Self {
            count: stats.count,
            capacity: stats.capacity,
            estimated_bytes: stats.estimated_bytes,
            hits: stats.hits,
            misses: stats.misses,
            evictions: stats.evictions,
        }
    }
}

#[derive(Debug, Serialize)]
struct RequestOutput {
    submitted: u64,
    cache_hits: u64,
    joined: u64,
    decodes: u64,
}

impl From<RequestStats> for RequestOutput {
    fn from(stats: RequestStats) -> Self {
        Self {
            submitted: stats.submitted,
            cache_hits: stats.cache_hits,
            joined: stats.joined,
            decodes: stats.decodes,
        }
    }
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    let config = || load_config(cli.config.as_deref());

    match cli.command {
        Commands::Warm { ref dir, width, recursive, json } => {
            let config = config()?;
            let width = width.unwrap_or(config.default_target_width);
            run_warm(&config, dir, width, recursive, json)
        }
        Commands::Render { ref file, width, ref output } => {
            let config = config()?;
            let width = width.unwrap_or(config.default_target_width);
            run_render(&config, file, width, output.as_deref())
        }
        Commands::Config { ref file } => run_config(&config()?, file.as_deref()),
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Explicit file (must exist), else the per-user file if present, then env overrides.
fn load_config(path: Option<&Path>) -> Result<ThumbnailConfig> {
    let config = match path {
        Some(path) => ThumbnailConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            let path = ThumbnailConfig::default_config_path();
            ThumbnailConfig::load_or_default(&path)
                .with_context(|| format!("failed to load config from {}", path.display()))?
        }
    };

    config.apply_env().context("invalid configuration in environment")
}

fn new_orchestrator(config: &ThumbnailConfig) -> ThumbnailOrchestrator {
    ThumbnailOrchestrator::from_config(Arc::new(FileImageDecoder::new()), config)
}

fn run_warm(
    config: &ThumbnailConfig,
    dir: &Path,
    width: u32,
    recursive: bool,
    json: bool,
) -> Result<()> {
    if !dir.is_dir() {
        anyhow::bail!("directory does not exist: {}", dir.display());
    }

    let files = collect_media(dir, recursive)?;
    log::debug!("warming {} thumbnail(s) from {}", files.len(), dir.display());

    let orchestrator = new_orchestrator(config);
    let owner = ThumbnailOwner::new();
    orchestrator.set_active_owner(&owner);

    let cancel = CancellationToken::new();
    let pending: Vec<_> = files
        .iter()
        .map(|path| {
            let request = orchestrator.request_thumbnail(
                path,
                &owner,
                ThumbnailPriority::Normal,
                width,
                &cancel,
            );
            (path, request)
        })
        .collect();

    let mut loaded = 0;
    let mut unavailable = Vec::new();
    for (path, request) in pending {
        match request.wait() {
            Some(_) => loaded += 1,
            None => unavailable.push(path.display().to_string()),
        }
    }

    let payload = WarmOutput {
        directory: dir.display().to_string(),
        files: files.len(),
        loaded,
        unavailable,
        cache: orchestrator.stats().into(),
        requests: orchestrator.request_stats().into(),
    };
    orchestrator.shutdown();

    if json {
        let json = serde_json::to_string_pretty(&payload)?;
        println!("{json}");
    } else {
        print_warm_summary(&payload);
    }

    Ok(())
}

fn print_warm_summary(payload: &WarmOutput) {
    println!("loaded {} of {} thumbnails from {}", payload.loaded, payload.files, payload.directory);
    for path in &payload.unavailable {
        println!("unavailable: {path}");
    }
    println!(
        "cache: {}/{} entries, {} bytes, {} evicted",
        payload.cache.count,
        payload.cache.capacity,
        payload.cache.estimated_bytes,
        payload.cache.evictions
    );
}

/// Image and video files directly in `dir` (or below it), sorted by path.
fn collect_media(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut files = Vec::new();

    for entry in WalkDir::new(dir).max_depth(max_depth) {
        let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
        let path = entry.path();
        if entry.file_type().is_file() && (is_image_path(path) || is_video_path(path)) {
            files.push(path.to_path_buf());
        }
    }

    files.sort();
    Ok(files)
}

fn run_render(
    config: &ThumbnailConfig,
    file: &Path,
    width: u32,
    output: Option<&Path>,
) -> Result<()> {
    ensure_file_exists(file)?;

    let orchestrator = new_orchestrator(config);
    let bitmap = orchestrator
        .request_thumbnail(
            file,
            &ThumbnailOwner::new(),
            ThumbnailPriority::Critical,
            width,
            &CancellationToken::new(),
        )
        .wait();
    orchestrator.shutdown();

    let bitmap =
        bitmap.with_context(|| format!("failed to decode thumbnail for {}", file.display()))?;

    let output =
        output.map(ToOwned::to_owned).unwrap_or_else(|| default_thumbnail_output(file));

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }

    to_image(&bitmap)?
        .save(&output)
        .with_context(|| format!("failed to write image to {}", output.display()))?;

    println!("{}", output.display());

    Ok(())
}

fn to_image(bitmap: &Bitmap) -> Result<image::RgbaImage> {
    image::RgbaImage::from_raw(bitmap.width, bitmap.height, bitmap.pixels.clone())
        .context("thumbnail pixel buffer does not match its dimensions")
}

fn run_config(config: &ThumbnailConfig, file: Option<&Path>) -> Result<()> {
    match file {
        Some(path) => {
            config
                .save_to_file(path)
                .with_context(|| format!("failed to write config to {}", path.display()))?;
            println!("{}", path.display());
        }
        None => print!("{}", config.to_toml()?),
    }

    Ok(())
}

fn ensure_file_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("file does not exist: {}", path.display());
    }

    if !path.is_file() {
        anyhow::bail!("path is not a file: {}", path.display());
    }

    Ok(())
}

fn default_thumbnail_output(file: &Path) -> PathBuf {
    let stem = file.file_stem().and_then(|name| name.to_str()).unwrap_or("thumbnail");

    file.with_file_name(format!("{stem}-thumb.png"))
}
