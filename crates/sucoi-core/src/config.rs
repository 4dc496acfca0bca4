use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Bounds for `max_concurrent_downloads`.
pub const MIN_CONCURRENT: usize = 1;
pub const MAX_CONCURRENT: usize = 10;

/// Retry schedule parameters (optional section in config.toml).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before each retry in seconds; the last value repeats.
    pub delays_secs: Vec<f64>,
    /// Cancellation poll interval during backoff, clamped to 200 ms.
    pub poll_interval_ms: u64,
    /// Give up immediately on errors classified as permanent
    /// (private, geo-restricted, 404, ...). Off by default.
    pub skip_permanent: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delays_secs: vec![3.0, 5.0],
            poll_interval_ms: 200,
            skip_permanent: false,
        }
    }
}

/// Engine configuration loaded from `~/.config/sucoi/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Search API key. Not used by the engine itself; kept for the UI.
    pub api_key: String,
    /// Where new tasks are written; falls back to the XDG data dir.
    pub default_download_path: Option<PathBuf>,
    /// Worker pool size; see [`EngineConfig::effective_max_concurrent`].
    pub max_concurrent_downloads: usize,
    pub retry: Option<RetryConfig>,
    /// Override for the persisted queue location.
    pub queue_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            default_download_path: None,
            max_concurrent_downloads: 3,
            retry: None,
            queue_file: None,
        }
    }
}

impl EngineConfig {
    /// Pool size clamped to [1, 10].
    pub fn effective_max_concurrent(&self) -> usize {
        self.max_concurrent_downloads
            .clamp(MIN_CONCURRENT, MAX_CONCURRENT)
    }

    pub fn retry_config(&self) -> RetryConfig {
        self.retry.clone().unwrap_or_default()
    }

    /// The configured download path, else the XDG fallback. Created if missing.
    pub fn resolve_download_path(&self) -> Result<PathBuf> {
        let path = match &self.default_download_path {
            Some(p) => p.clone(),
            None => fallback_download_path()?,
        };
        fs::create_dir_all(&path)
            .with_context(|| format!("create download dir {}", path.display()))?;
        Ok(path)
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("sucoi")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// `~/.local/share/sucoi/download`.
pub fn fallback_download_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("sucoi")?;
    Ok(xdg_dirs.get_data_home().join("download"))
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<EngineConfig> {
    let path = config_path()?;
    load_or_init_at(&path)
}

/// Like [`load_or_init`] for an explicit path.
pub fn load_or_init_at(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let default_cfg = EngineConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml).with_context(|| format!("write {}", path.display()))?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }
    load_from_path(path)
}

pub fn load_from_path(path: &Path) -> Result<EngineConfig> {
    let data = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&data).with_context(|| format!("parse {}", path.display()))?;
    if cfg.max_concurrent_downloads != cfg.effective_max_concurrent() {
        tracing::warn!(
            configured = cfg.max_concurrent_downloads,
            effective = cfg.effective_max_concurrent(),
            "max_concurrent_downloads out of range, clamping"
        );
    }
    Ok(cfg)
}
