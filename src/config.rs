use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Discord bot configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DiscordConfig {
    /// Bot token
    pub token: String,
    /// Optional prefix for text commands
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_prefix() -> String {
    "!c ".to_string()
}

/// Database configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

/// Request queue configuration
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Per-guild capacity of the download queue
    #[serde(default = "default_download_capacity")]
    pub download_capacity: usize,
    /// Per-guild capacity of the search queue
    #[serde(default = "default_search_capacity")]
    pub search_capacity: usize,
    /// Optional per-guild priority weights keyed by guild id, larger is
    /// served first
    #[serde(default)]
    pub guild_priorities: std::collections::HashMap<String, u32>,
}

fn default_download_capacity() -> usize {
    64
}

fn default_search_capacity() -> usize {
    640
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            download_capacity: default_download_capacity(),
            search_capacity: default_search_capacity(),
            guild_priorities: Default::default(),
        }
    }
}

/// Download backoff configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BackoffConfig {
    /// Base wait between downloads, in seconds
    #[serde(default = "default_base_wait_s")]
    pub base_wait_s: u64,
    /// Maximum tracked failures (and therefore maximum wait multiplier)
    #[serde(default = "default_backoff_max_size")]
    pub max_size: usize,
    /// Failures older than this are forgotten
    #[serde(default = "default_backoff_max_age_s")]
    pub max_age_s: u64,
}

fn default_base_wait_s() -> u64 {
    30
}

fn default_backoff_max_size() -> usize {
    100
}

fn default_backoff_max_age_s() -> u64 {
    300
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_wait_s: default_base_wait_s(),
            max_size: default_backoff_max_size(),
            max_age_s: default_backoff_max_age_s(),
        }
    }
}

/// Download cache configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Maximum cached source files kept on disk
    #[serde(default = "default_max_cache_entries")]
    pub max_entries: u32,
    /// Maximum memoized search strings
    #[serde(default = "default_max_search_entries")]
    pub max_search_entries: u32,
}

fn default_true() -> bool {
    true
}

fn default_max_cache_entries() -> u32 {
    2048
}

fn default_max_search_entries() -> u32 {
    4096
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_max_cache_entries(),
            max_search_entries: default_max_search_entries(),
        }
    }
}

/// Downloader configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DownloaderConfig {
    /// Path to the yt-dlp binary
    #[serde(default = "default_ytdlp_bin")]
    pub ytdlp_bin: String,
    /// Maximum media duration accepted, in seconds
    #[serde(default = "default_max_duration_s")]
    pub max_duration_s: u32,
    /// Run the loudness-normalization and silence-trim pass after download
    #[serde(default)]
    pub enable_post_processing: bool,
    /// Retry budget for retryable download failures
    #[serde(default = "default_download_retries")]
    pub download_retries: u32,
    /// Per-call timeout, in seconds
    #[serde(default = "default_download_timeout_s")]
    pub timeout_s: u64,
    /// Extra arguments appended verbatim to every yt-dlp invocation
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_ytdlp_bin() -> String {
    "yt-dlp".to_string()
}

fn default_max_duration_s() -> u32 {
    60 * 15
}

fn default_download_retries() -> u32 {
    3
}

fn default_download_timeout_s() -> u64 {
    180
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            ytdlp_bin: default_ytdlp_bin(),
            max_duration_s: default_max_duration_s(),
            enable_post_processing: false,
            download_retries: default_download_retries(),
            timeout_s: default_download_timeout_s(),
            extra_args: Vec::new(),
        }
    }
}

/// Per-guild player configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PlayerConfig {
    #[serde(default = "default_queue_max_size")]
    pub queue_max_size: usize,
    #[serde(default = "default_history_max_size")]
    pub history_max_size: usize,
    /// Shut the player down after the voice channel has been empty this long
    #[serde(default = "default_empty_channel_timeout_s")]
    pub empty_channel_timeout_s: u64,
}

fn default_queue_max_size() -> usize {
    128
}

fn default_history_max_size() -> usize {
    128
}

fn default_empty_channel_timeout_s() -> u64 {
    60 * 15
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            queue_max_size: default_queue_max_size(),
            history_max_size: default_history_max_size(),
            empty_channel_timeout_s: default_empty_channel_timeout_s(),
        }
    }
}

/// Status message configuration
#[derive(Debug, Deserialize, Clone)]
pub struct MessagesConfig {
    /// Maximum characters per message page
    #[serde(default = "default_page_char_limit")]
    pub page_char_limit: usize,
    /// Recent-message window inspected for sticky re-anchoring
    #[serde(default = "default_sticky_recent_window")]
    pub sticky_recent_window: usize,
    /// Seconds a finished bundle stays visible before its messages are removed
    #[serde(default = "default_finished_grace_s")]
    pub finished_grace_s: u64,
}

fn default_page_char_limit() -> usize {
    2000
}

fn default_sticky_recent_window() -> usize {
    10
}

fn default_finished_grace_s() -> u64 {
    300
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            page_char_limit: default_page_char_limit(),
            sticky_recent_window: default_sticky_recent_window(),
            finished_grace_s: default_finished_grace_s(),
        }
    }
}

/// History recorder configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HistoryConfig {
    #[serde(default = "default_history_playlist_max_items")]
    pub playlist_max_items: u32,
}

fn default_history_playlist_max_items() -> u32 {
    256
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            playlist_max_items: default_history_playlist_max_items(),
        }
    }
}

/// Spotify catalog credentials. Absent section disables Spotify URL support.
#[derive(Debug, Deserialize, Clone)]
pub struct SpotifyConfig {
    pub client_id: String,
    pub client_secret: String,
}

/// YouTube Data API credentials. Absent section disables playlist expansion
/// and free-text resolution.
#[derive(Debug, Deserialize, Clone)]
pub struct YoutubeConfig {
    pub api_key: String,
}

/// Object storage backup. Absent section disables cache backup.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// S3-compatible gateway endpoint, e.g. http://minio:9000
    pub endpoint: String,
    pub bucket: String,
    /// Optional bearer token for the gateway
    #[serde(default)]
    pub token: Option<String>,
    /// Uploads attempted per cleanup sweep
    #[serde(default = "default_backup_batch")]
    pub backup_batch: u32,
}

fn default_backup_batch() -> u32 {
    8
}

/// Root application configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub discord: DiscordConfig,
    pub database: DatabaseConfig,
    /// Working directory for cache files, per-guild links and scratch space
    pub work_dir: PathBuf,
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub downloader: DownloaderConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub messages: MessagesConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub spotify: Option<SpotifyConfig>,
    #[serde(default)]
    pub youtube: Option<YoutubeConfig>,
    #[serde(default)]
    pub storage: Option<StorageConfig>,
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // e.g. CADENCE_DISCORD__TOKEN, CADENCE_CACHE__MAX_ENTRIES
            .add_source(
                Environment::with_prefix("CADENCE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Initialize the global config singleton
    pub fn init() -> Result<&'static Self, ConfigError> {
        let config = Self::load()?;
        Ok(CONFIG.get_or_init(|| config))
    }

    /// Get reference to the global config
    pub fn get() -> &'static Self {
        CONFIG
            .get()
            .expect("Config not initialized. Call AppConfig::init() first.")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.work_dir.join("cache")
    }

    pub fn guild_dir(&self, guild_id: u64) -> PathBuf {
        self.work_dir.join("guilds").join(guild_id.to_string())
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.work_dir.join("tmp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_dir_layout() {
        let config = AppConfig {
            discord: DiscordConfig {
                token: "t".to_string(),
                prefix: default_prefix(),
            },
            database: DatabaseConfig {
                url: "sqlite::memory:".to_string(),
                max_connections: 1,
            },
            work_dir: PathBuf::from("/tmp/cadence"),
            queues: Default::default(),
            backoff: Default::default(),
            cache: Default::default(),
            downloader: Default::default(),
            player: Default::default(),
            messages: Default::default(),
            history: Default::default(),
            spotify: None,
            youtube: None,
            storage: None,
        };
        assert_eq!(config.cache_dir(), PathBuf::from("/tmp/cadence/cache"));
        assert_eq!(
            config.guild_dir(42),
            PathBuf::from("/tmp/cadence/guilds/42")
        );
        assert_eq!(config.tmp_dir(), PathBuf::from("/tmp/cadence/tmp"));
    }

    #[test]
    fn test_defaults() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.base_wait_s, 30);
        assert_eq!(backoff.max_size, 100);
        assert_eq!(backoff.max_age_s, 300);

        let queues = QueueConfig::default();
        assert!(queues.search_capacity > queues.download_capacity);
    }
}
