//! Configuration module for datafeed-rs
//!
//! This module handles the configuration of a feed session:
//! - Bus identity and addressing (sender id, group, source id)
//! - Bounded waits for discovery and initialization
//! - Streaming mode and pacing
//! - Batch document conventions (identifier key, timestamp field)
//! - Logging
//!
//! # Config Location
//!
//! The default config file lives in the platform-appropriate location:
//! - **Linux**: `~/.config/dev.hxyulin.datafeed-rs/config.toml`
//! - **macOS**: `~/Library/Application Support/dev.hxyulin.datafeed-rs/config.toml`
//! - **Windows**: `%APPDATA%\dev.hxyulin.datafeed-rs\config.toml`
//!
//! Files ending in `.json` are read as JSON, everything else as TOML.
//!
//! # Example
//!
//! ```ignore
//! use datafeed_rs::config::AppConfig;
//!
//! let config = AppConfig::load_or_default(AppConfig::default_path());
//! println!("streaming as {}", config.bus.sender_id);
//! ```

use crate::error::{DataFeedError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for config directories
pub const APP_ID: &str = "dev.hxyulin.datafeed-rs";

/// Config filename
pub const CONFIG_FILE: &str = "config.toml";

/// Default bus group joined by every session
pub const DEFAULT_GROUP: &str = "ROPOD";

/// Default remote source identifier
pub const DEFAULT_SOURCE_ID: &str = "black_box_001";

/// Default bounded wait for discovery and initialization in milliseconds
pub const DEFAULT_QUERY_TIMEOUT_MS: u64 = 2000;

/// Default reserved identifier key skipped by the flattener
pub const DEFAULT_ID_KEY: &str = "_id";

/// Default root field holding a record's timestamp
pub const DEFAULT_TIMESTAMP_FIELD: &str = "timestamp";

// ==================== Config Directory ====================

/// Get the configuration directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

/// Ensure the configuration directory exists
pub fn ensure_config_dir() -> Result<PathBuf> {
    let dir = config_dir().ok_or_else(|| {
        DataFeedError::Config("Could not determine config directory".to_string())
    })?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            DataFeedError::Config(format!("Failed to create config directory: {}", e))
        })?;
    }

    Ok(dir)
}

// ==================== App Config ====================

/// Complete configuration of a feed session
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AppConfig {
    /// Bus identity and addressing
    #[serde(default)]
    pub bus: BusConfig,

    /// Bounded waits for the handshake
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Live streaming behavior
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// Batch document conventions
    #[serde(default)]
    pub batch: BatchConfig,

    /// Logging output
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the default config file, if a config directory exists
    pub fn default_path() -> Option<PathBuf> {
        config_dir().map(|p| p.join(CONFIG_FILE))
    }

    /// Load a config file (TOML, or JSON by extension)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            DataFeedError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let config: Self = if is_json(path) {
            serde_json::from_str(&content)
                .map_err(|e| DataFeedError::Config(format!("Failed to parse config: {}", e)))?
        } else {
            toml::from_str(&content)
                .map_err(|e| DataFeedError::Config(format!("Failed to parse config: {}", e)))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Load a config file, returning defaults on any error or missing path
    pub fn load_or_default(path: Option<impl AsRef<Path>>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };
        let path = path.as_ref();
        if !path.exists() {
            return Self::default();
        }
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save the config (TOML, or JSON by extension)
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_json(path) {
            serde_json::to_string_pretty(self)
                .map_err(|e| DataFeedError::Serialization(e.to_string()))?
        } else {
            self.to_toml()?
        };

        std::fs::write(path, content)
            .map_err(|e| DataFeedError::Config(format!("Failed to write config: {}", e)))
    }

    /// Render the config as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| DataFeedError::Serialization(e.to_string()))
    }

    /// Reject values that would stall or spin a session
    pub fn validate(&self) -> Result<()> {
        if self.bus.group.trim().is_empty() {
            return Err(DataFeedError::Config("bus.group must not be empty".into()));
        }
        if self.bus.sender_id.trim().is_empty() {
            return Err(DataFeedError::Config("bus.sender_id must not be empty".into()));
        }
        if self.discovery.timeout_ms == 0 || self.discovery.init_timeout_ms == 0 {
            return Err(DataFeedError::Config("discovery timeouts must be > 0".into()));
        }
        let s = &self.streaming;
        if s.poll_interval_ms == 0 || s.combined_interval_ms == 0 || s.sleep_slice_ms == 0 {
            return Err(DataFeedError::Config("streaming intervals must be > 0".into()));
        }
        if self.batch.id_key.is_empty() || self.batch.timestamp_field.is_empty() {
            return Err(DataFeedError::Config(
                "batch.id_key and batch.timestamp_field must not be empty".into(),
            ));
        }
        Ok(())
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

// ==================== Bus Config ====================

/// Bus identity and addressing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BusConfig {
    /// Identity placed in `senderId`; responses are accepted only when
    /// their `receiverId` matches it
    pub sender_id: String,

    /// Human-readable node name announced on the bus
    pub node_name: String,

    /// Group all queries are shouted to
    pub group: String,

    /// Remote source the queries address (`blackBoxId`)
    pub source_id: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            sender_id: uuid::Uuid::new_v4().to_string(),
            node_name: "datafeed_streaming_plugin".to_string(),
            group: DEFAULT_GROUP.to_string(),
            source_id: DEFAULT_SOURCE_ID.to_string(),
        }
    }
}

// ==================== Discovery Config ====================

/// Bounded waits for discovery and initialization
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Wait for the catalog response in milliseconds
    pub timeout_ms: u64,

    /// Wait for the initial latest-value response in milliseconds
    pub init_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            init_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
        }
    }
}

impl DiscoveryConfig {
    /// Catalog wait as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Initialization wait as a duration
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }
}

// ==================== Streaming Config ====================

/// How live data is acquired once streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StreamMode {
    /// One producer per variable, catch-up window queries, paced replay
    #[default]
    PerVariable,
    /// One producer for all variables, periodic latest-value queries
    Combined,
}

impl std::fmt::Display for StreamMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamMode::PerVariable => write!(f, "per-variable"),
            StreamMode::Combined => write!(f, "combined"),
        }
    }
}

/// Live streaming behavior
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamingConfig {
    /// Producer layout
    pub mode: StreamMode,

    /// Minimum spacing between catch-up requests of one producer (ms)
    pub poll_interval_ms: u64,

    /// Spacing of latest-value requests in combined mode (ms)
    pub combined_interval_ms: u64,

    /// How long a producer waits for a response before re-requesting (ms)
    pub response_wait_ms: u64,

    /// A producer without responses for this long is reported stalled (ms)
    pub stall_timeout_ms: u64,

    /// Replay speed multiplier for paced delivery
    pub playback_speed: f64,

    /// Granularity at which pacing sleeps observe shutdown (ms)
    pub sleep_slice_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            mode: StreamMode::PerVariable,
            poll_interval_ms: 1000,
            combined_interval_ms: 500,
            response_wait_ms: 1000,
            stall_timeout_ms: 5000,
            playback_speed: 1.0,
            sleep_slice_ms: 50,
        }
    }
}

impl StreamingConfig {
    /// Catch-up request spacing
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Combined-mode request spacing
    pub fn combined_interval(&self) -> Duration {
        Duration::from_millis(self.combined_interval_ms)
    }

    /// Response wait per request
    pub fn response_wait(&self) -> Duration {
        Duration::from_millis(self.response_wait_ms)
    }

    /// Stall threshold
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    /// Pacing sleep slice
    pub fn sleep_slice(&self) -> Duration {
        Duration::from_millis(self.sleep_slice_ms)
    }
}

// ==================== Batch Config ====================

/// Conventions of batch documents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatchConfig {
    /// Reserved identifier key whose sub-record is never flattened
    pub id_key: String,

    /// Root field holding the record timestamp in seconds
    pub timestamp_field: String,

    /// Report load progress every N records
    pub progress_every: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            id_key: DEFAULT_ID_KEY.to_string(),
            timestamp_field: DEFAULT_TIMESTAMP_FIELD.to_string(),
            progress_every: 100,
        }
    }
}

// ==================== Logging Config ====================

/// Logging output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,

    /// Directory for daily rolling log files (stderr only when unset)
    pub file_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,datafeed_rs=debug".to_string(),
            file_dir: None,
        }
    }
}

// ==================== Tests ====================
