//! Runtime configuration.
//!
//! Every section deserializes with `#[serde(default)]`, so a config file only
//! needs to mention the values it overrides. Durations are expressed in
//! milliseconds to keep the JSON format flat.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

/// Well-known location of the mirror network's mirror list
pub const DEFAULT_MIRROR_LIST_URL: &str = "https://www.gutenberg.org/MIRRORS.ALL";

/// Origin used when neither a fresh nor a cached mirror list is available
pub const DEFAULT_ORIGIN: &str = "https://aleph.gutenberg.org/";

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(env!("CARGO_PKG_NAME"))
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub racer: RacerConfig,
    pub fetcher: FetcherConfig,
    pub navigator: NavigatorConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a JSON file, or return defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

/// Sparse byte-range cache settings
#[derive(Debug, Clone, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding `<id>.txt`, `<id>.bitmap` and `<id>.meta.json`
    #[default(default_cache_dir())]
    pub dir: PathBuf,
    /// Bytes tracked by one bitmap bit
    #[default = 4096]
    pub block_size: u64,
    /// Uncached ranges separated by at most this many cached bytes are fetched together
    #[default = 8192]
    pub max_coalesce_gap: u64,
    /// Revalidate a resource against its origin after this long (24 hours)
    #[default = 86_400_000]
    pub validation_interval_ms: u64,
}

impl CacheConfig {
    pub fn validation_interval(&self) -> Duration {
        Duration::from_millis(self.validation_interval_ms)
    }
}

/// Mirror racing settings
#[derive(Debug, Clone, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct RacerConfig {
    #[default(DEFAULT_MIRROR_LIST_URL.to_string())]
    pub mirror_list_url: String,
    #[default(DEFAULT_ORIGIN.to_string())]
    pub default_origin: String,
    /// Where the last downloaded mirror list is kept; `None` disables the fallback copy
    #[default(Some(default_cache_dir().join("mirrors.txt")))]
    pub mirror_list_cache: Option<PathBuf>,
    /// Number of top-ranked mirrors raced concurrently
    #[default = 3]
    pub race_width: usize,
    #[default = 3000]
    pub race_timeout_ms: u64,
    #[default = 3000]
    pub sticky_timeout_ms: u64,
    /// Delay before backup mirrors join a sticky GET
    #[default = 500]
    pub stagger_ms: u64,
    #[default = 2]
    pub backup_count: usize,
    #[default = 5000]
    pub mirror_list_timeout_ms: u64,
    /// A failure younger than this demotes a mirror in health ordering
    #[default = 300_000]
    pub failure_window_ms: u64,
    #[default = 0.1]
    pub ewma_alpha: f64,
}

impl RacerConfig {
    pub fn race_timeout(&self) -> Duration {
        Duration::from_millis(self.race_timeout_ms)
    }

    pub fn sticky_timeout(&self) -> Duration {
        Duration::from_millis(self.sticky_timeout_ms)
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_ms)
    }

    pub fn mirror_list_timeout(&self) -> Duration {
        Duration::from_millis(self.mirror_list_timeout_ms)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_millis(self.failure_window_ms)
    }
}

/// Retry policy of the cached fetcher façade
#[derive(Debug, Clone, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct FetcherConfig {
    #[default = 3]
    pub max_retries: usize,
    #[default = 100]
    pub min_backoff_ms: u64,
    #[default = 2000]
    pub max_backoff_ms: u64,
}

/// Word-chunk navigation settings
#[derive(Debug, Clone, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct NavigatorConfig {
    /// Words per chunk
    #[default = 250]
    pub chunk_size: usize,
    /// Multiple of the expected chunk length requested per fetch
    #[default = 2.5]
    pub overfetch_factor: f64,
    /// Extra bytes read on both sides so codepoints are never split
    #[default = 3]
    pub utf8_margin: u64,
    #[default = 50]
    pub history_cap: usize,
    #[default = 10]
    pub lru_capacity: usize,
    /// Bytes-per-word estimate used before any chunk has been measured
    #[default = 6.0]
    pub initial_bytes_per_word: f64,
    #[default = 10]
    pub prefetch_ahead_ms: u64,
    #[default = 100]
    pub prefetch_behind_ms: u64,
    /// Set to false to disable background prefetching entirely
    #[default = true]
    pub prefetch: bool,
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize, SmartDefault)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive such as `info` or `chunkread=debug`; `RUST_LOG` takes precedence
    #[default(Some("info".to_string()))]
    pub level: Option<String>,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
}
