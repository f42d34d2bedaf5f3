//! Configuration loading for a ChronoShare node.
//!
//! Configuration is loaded from a TOML file (default: `chronoshare.toml`).

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use chronoshare_types::Name;

use crate::fetcher::FetchOptions;

/// Root configuration for one synchronized folder.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// The shared folder's name. Appears as one component in every action
    /// name, so it must not contain `/`.
    pub folder: String,
    /// The application name component (default: "chronoshare").
    #[serde(default = "default_app_name")]
    pub app_name: String,
    /// The local device's routable name, e.g. `/alice/laptop`.
    pub user_name: String,
    /// Routable prefix through which peers can reach this device when the
    /// device name itself is not globally routable.
    #[serde(default)]
    pub local_prefix: Option<String>,
    /// The broadcast prefix the sync collection lives under.
    #[serde(default = "default_broadcast_prefix")]
    pub broadcast_prefix: String,
    /// Sync exchange tuning.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Serving behavior.
    #[serde(default)]
    pub serve: ServeConfig,
    /// Object sub-store cache tuning.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Fetch pipeline tuning.
    #[serde(default)]
    pub fetch: FetchConfig,
}

/// Sync exchange tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Lifetime of each outstanding sync interest, in seconds.
    #[serde(default = "default_interest_interval")]
    pub interest_interval_secs: u64,
}

/// Serving behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct ServeConfig {
    /// Freshness (seconds) applied to data re-published through a
    /// forwarding hint. Non-positive disables it (default: -1).
    #[serde(default = "default_freshness")]
    pub freshness_secs: i64,
}

/// Object sub-store cache tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Idle seconds before an open sub-store is closed (default: 60).
    #[serde(default = "default_cache_lifetime")]
    pub lifetime_secs: u64,
}

/// Fetch pipeline tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Outstanding interests per fetcher (default: 6).
    #[serde(default = "default_pipeline")]
    pub pipeline: usize,
    /// Global outstanding-interest budget (default: 20).
    #[serde(default = "default_budget")]
    pub budget: usize,
    /// Fetchers run concurrently (default: 3).
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Per-segment interest lifetime, in seconds (default: 2).
    #[serde(default = "default_segment_lifetime")]
    pub segment_lifetime_secs: u64,
    /// Seconds without any arrival before a fetcher fails (default: 30).
    #[serde(default = "default_no_activity")]
    pub no_activity_secs: u64,
    /// Retries of a failed fetcher before giving up (default: 3).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_app_name() -> String {
    "chronoshare".to_string()
}

fn default_broadcast_prefix() -> String {
    "/ndn/broadcast".to_string()
}

fn default_interest_interval() -> u64 {
    30
}

fn default_freshness() -> i64 {
    -1
}

fn default_cache_lifetime() -> u64 {
    60
}

fn default_pipeline() -> usize {
    6
}

fn default_budget() -> usize {
    20
}

fn default_max_parallel() -> usize {
    3
}

fn default_segment_lifetime() -> u64 {
    2
}

fn default_no_activity() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interest_interval_secs: default_interest_interval(),
        }
    }
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            freshness_secs: default_freshness(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lifetime_secs: default_cache_lifetime(),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            pipeline: default_pipeline(),
            budget: default_budget(),
            max_parallel: default_max_parallel(),
            segment_lifetime_secs: default_segment_lifetime(),
            no_activity_secs: default_no_activity(),
            max_retries: default_max_retries(),
        }
    }
}

impl Config {
    /// A configuration for `folder` synced as `user_name`, with defaults
    /// everywhere else.
    pub fn new(folder: &str, user_name: &str) -> Self {
        Self {
            folder: folder.to_string(),
            app_name: default_app_name(),
            user_name: user_name.to_string(),
            local_prefix: None,
            broadcast_prefix: default_broadcast_prefix(),
            sync: SyncConfig::default(),
            serve: ServeConfig::default(),
            cache: CacheConfig::default(),
            fetch: FetchConfig::default(),
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// folder name is not a single name component.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check structural constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.folder.is_empty() || self.folder.contains('/') {
            return Err(ConfigError::InvalidField {
                field: "folder",
                message: "must be a single non-empty name component".into(),
            });
        }
        self.parsed_user_name()?;
        if let Some(prefix) = &self.local_prefix {
            prefix
                .parse::<Name>()
                .map_err(|e| ConfigError::InvalidField {
                    field: "local_prefix",
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }

    /// The local device name, parsed.
    pub fn parsed_user_name(&self) -> Result<Name, ConfigError> {
        self.user_name
            .parse()
            .map_err(|e: chronoshare_types::ProtocolError| ConfigError::InvalidField {
                field: "user_name",
                message: e.to_string(),
            })
    }

    /// The forwarding-hint prefix, parsed.
    pub fn parsed_local_prefix(&self) -> Option<Name> {
        self.local_prefix.as_ref().and_then(|p| p.parse().ok())
    }

    /// The sync collection prefix:
    /// `<broadcast-prefix>/<app>/<folder>`.
    pub fn sync_prefix(&self) -> Name {
        self.broadcast_prefix
            .parse::<Name>()
            .unwrap_or_default()
            .append(&self.app_name)
            .append(&self.folder)
    }

    /// The sync interest lifetime.
    pub fn interest_lifetime(&self) -> Duration {
        Duration::from_secs(self.sync.interest_interval_secs.max(1))
    }

    /// Fetch tuning in the shape the fetch pipeline takes.
    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            pipeline: self.fetch.pipeline,
            segment_lifetime: Duration::from_secs(self.fetch.segment_lifetime_secs.max(1)),
            max_no_activity: Duration::from_secs(self.fetch.no_activity_secs.max(1)),
            budget: self.fetch.budget,
            max_parallel: self.fetch.max_parallel,
            max_retries: self.fetch.max_retries,
            ..FetchOptions::default()
        }
    }

    /// The sub-store cache lifetime.
    pub fn cache_lifetime(&self) -> Duration {
        Duration::from_secs(self.cache.lifetime_secs.max(1))
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse the configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A field value is structurally invalid.
    #[error("invalid {field}: {message}")]
    InvalidField {
        /// Which field.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },
}
