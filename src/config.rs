//! Configuration module for the protocol watcher.
//!
//! This module provides a layered configuration system that supports:
//! - Default values
//! - TOML configuration file
//! - Environment variable overrides
//! - CLI argument overrides
//!
//! # Environment Variables
//!
//! Environment variables must be prefixed with `PW_` and use double underscores
//! to separate nested levels:
//! - `PW_WATCH__ROOT=/data/session` sets `watch.root`
//! - `PW_WATCH__MIRROR_ENABLED=true` sets `watch.mirror_enabled`
//! - `PW_SCHEDULER__MIN_INTERVAL_SECS=30` sets `scheduler.min_interval_secs`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::protocol::element::ElementType;
use crate::protocol::profile::InstrumentProfile;
use crate::watcher::retry::RetryPolicy;

/// Directory holding the settings file, searched from cwd upwards.
pub const CONFIG_DIR: &str = ".protowatch";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_version")]
    pub version: u32,

    /// Watched tree and mirror settings
    #[serde(default)]
    pub watch: WatchConfig,

    /// Retry settings for mirror and dispatch operations
    #[serde(default)]
    pub retry: RetryConfig,

    /// File stability polling
    #[serde(default)]
    pub stability: StabilityConfig,

    /// External update debouncing
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Protocol document settings
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Per element type pattern overrides
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Logging levels
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatchConfig {
    /// Directory written by the instrument software. Required.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    /// Destination of the mirrored tree. Required when mirroring is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mirror_root: Option<PathBuf>,

    /// Replicate the watched tree under `mirror_root`
    #[serde(default = "default_false")]
    pub mirror_enabled: bool,

    /// Match patterns case sensitively
    #[serde(default = "default_false")]
    pub case_sensitive: bool,

    /// Drop directory events entirely instead of always passing them
    #[serde(default = "default_false")]
    pub ignore_directories: bool,

    /// Files never mirrored nor classified (editor and transfer temp files)
    #[serde(default = "default_mirror_excludes")]
    pub mirror_excludes: Vec<String>,

    /// Compare mirrored copies byte for byte after copying
    #[serde(default = "default_false")]
    pub verify_copies: bool,

    /// Copy attempts before reporting a divergent mirror
    #[serde(default = "default_verify_attempts")]
    pub verify_attempts: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RetryConfig {
    /// Attempts for each mirror operation
    #[serde(default = "default_mirror_attempts")]
    pub mirror_attempts: u32,

    /// Fixed wait between mirror attempts in milliseconds
    #[serde(default = "default_mirror_wait_ms")]
    pub mirror_wait_ms: u64,

    /// Attempts for each dispatch operation
    #[serde(default = "default_dispatch_attempts")]
    pub dispatch_attempts: u32,

    /// First wait between dispatch attempts in milliseconds
    #[serde(default = "default_dispatch_wait_min_ms")]
    pub dispatch_wait_min_ms: u64,

    /// Increment added to the dispatch wait after each failure
    #[serde(default = "default_dispatch_wait_step_ms")]
    pub dispatch_wait_step_ms: u64,

    /// Upper bound of the dispatch wait
    #[serde(default = "default_dispatch_wait_max_ms")]
    pub dispatch_wait_max_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StabilityConfig {
    /// Give up waiting for a growing file after this many polls
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SchedulerConfig {
    /// Minimum time between two pushes to the document store
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,

    /// Pushes only happen while fewer events than this are queued
    #[serde(default = "default_queue_threshold")]
    pub queue_threshold: usize,

    /// Re-check held back updates after the queue was idle this long
    #[serde(default = "default_idle_flush_ms")]
    pub idle_flush_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProtocolConfig {
    /// Instrument profile used to build the dispatch registry
    #[serde(default)]
    pub instrument: InstrumentProfile,

    /// Protocol title, defaults to the watched directory name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Where the JSON snapshot publisher writes the document
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,

    /// Start with the remote entry locked
    #[serde(default = "default_false")]
    pub read_only: bool,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone)]
pub struct ClassifierConfig {
    /// Replacement patterns keyed by element type
    #[serde(default)]
    pub overrides: HashMap<ElementType, GuesserConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GuesserConfig {
    /// Regexes a path must match
    pub include: Vec<String>,

    /// Regexes that veto a match
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Default level for all modules
    #[serde(default = "default_log_level")]
    pub default: String,

    /// Per-target overrides; pipeline components may be named bare, e.g.
    /// `mirror = "debug"`
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

// Default value functions
fn default_version() -> u32 { 1 }
fn default_false() -> bool { false }
fn default_verify_attempts() -> u32 { 3 }
fn default_mirror_attempts() -> u32 { 5 }
fn default_mirror_wait_ms() -> u64 { 500 }
fn default_dispatch_attempts() -> u32 { 5 }
fn default_dispatch_wait_min_ms() -> u64 { 500 }
fn default_dispatch_wait_step_ms() -> u64 { 500 }
fn default_dispatch_wait_max_ms() -> u64 { 5_000 }
fn default_max_polls() -> u32 { 600 }
fn default_min_interval_secs() -> u64 { 60 }
fn default_queue_threshold() -> usize { 2 }
fn default_idle_flush_ms() -> u64 { 2_000 }
fn default_log_level() -> String { "warn".to_string() }

fn default_mirror_excludes() -> Vec<String> {
    vec![
        r"\.tmp$".to_string(),
        r"\.temp$".to_string(),
        r"\.part$".to_string(),
        r"~$".to_string(),
        r"(^|/)~\$[^/]*$".to_string(),
        r"(^|/)\.DS_Store$".to_string(),
        r"(^|/)Thumbs\.db$".to_string(),
    ]
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            watch: WatchConfig::default(),
            retry: RetryConfig::default(),
            stability: StabilityConfig::default(),
            scheduler: SchedulerConfig::default(),
            protocol: ProtocolConfig::default(),
            classifier: ClassifierConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            root: None,
            mirror_root: None,
            mirror_enabled: false,
            case_sensitive: false,
            ignore_directories: false,
            mirror_excludes: default_mirror_excludes(),
            verify_copies: false,
            verify_attempts: default_verify_attempts(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            mirror_attempts: default_mirror_attempts(),
            mirror_wait_ms: default_mirror_wait_ms(),
            dispatch_attempts: default_dispatch_attempts(),
            dispatch_wait_min_ms: default_dispatch_wait_min_ms(),
            dispatch_wait_step_ms: default_dispatch_wait_step_ms(),
            dispatch_wait_max_ms: default_dispatch_wait_max_ms(),
        }
    }
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            max_polls: default_max_polls(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: default_min_interval_secs(),
            queue_threshold: default_queue_threshold(),
            idle_flush_ms: default_idle_flush_ms(),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            instrument: InstrumentProfile::default(),
            title: None,
            snapshot_path: None,
            read_only: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: HashMap::new(),
        }
    }
}

impl RetryConfig {
    /// Fixed back-off used around mirror operations.
    pub fn mirror_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.mirror_attempts, Duration::from_millis(self.mirror_wait_ms))
    }

    /// Incrementing back-off used around dispatch operations.
    pub fn dispatch_policy(&self) -> RetryPolicy {
        RetryPolicy::incrementing(
            self.dispatch_attempts,
            Duration::from_millis(self.dispatch_wait_min_ms),
            Duration::from_millis(self.dispatch_wait_step_ms),
            Duration::from_millis(self.dispatch_wait_max_ms),
        )
    }
}

impl SchedulerConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    pub fn idle_flush(&self) -> Duration {
        Duration::from_millis(self.idle_flush_ms)
    }
}

impl Settings {
    /// Load configuration from all sources
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::find_workspace_config()
            .unwrap_or_else(|| PathBuf::from(CONFIG_DIR).join("settings.toml"));
        Self::load_from(config_path)
    }

    /// Load configuration from a specific file, still honouring `PW_` overrides
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Figment::new()
            .merge(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            // Double underscore separates nested levels, single underscore
            // stays part of the field name
            .merge(Env::prefixed("PW_").map(|key| {
                key.as_str().to_lowercase().replace("__", ".").into()
            }))
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))
    }

    /// Find `.protowatch/settings.toml` from the current directory up to root
    fn find_workspace_config() -> Option<PathBuf> {
        let current = std::env::current_dir().ok()?;

        for ancestor in current.ancestors() {
            let config_dir = ancestor.join(CONFIG_DIR);
            if config_dir.is_dir() {
                return Some(config_dir.join("settings.toml"));
            }
        }

        None
    }

    /// Check the parameters the engine cannot start without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let root = self.watch_root()?;
        if !root.is_absolute() {
            return Err(ConfigError::InvalidValue {
                parameter: "watch.root".to_string(),
                reason: format!("{} is not an absolute path", root.display()),
            });
        }

        if self.watch.mirror_enabled {
            let mirror = self.mirror_root()?;
            if mirror == root {
                return Err(ConfigError::InvalidValue {
                    parameter: "watch.mirror_root".to_string(),
                    reason: "mirror root must differ from the watched root".to_string(),
                });
            }
        }

        if self.retry.mirror_attempts == 0 || self.retry.dispatch_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                parameter: "retry".to_string(),
                reason: "attempt counts must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    /// The watched root, or the fatal missing-parameter error.
    pub fn watch_root(&self) -> Result<&Path, ConfigError> {
        self.watch
            .root
            .as_deref()
            .ok_or_else(|| ConfigError::MissingParameter {
                parameter: "watch.root".to_string(),
            })
    }

    /// The mirror root, or the fatal missing-parameter error.
    pub fn mirror_root(&self) -> Result<&Path, ConfigError> {
        self.watch
            .mirror_root
            .as_deref()
            .ok_or_else(|| ConfigError::MissingParameter {
                parameter: "watch.mirror_root".to_string(),
            })
    }

    /// Save current configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Box<dyn std::error::Error>> {
        let parent = path.as_ref().parent().ok_or("Invalid path")?;
        std::fs::create_dir_all(parent)?;

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;

        Ok(())
    }

    /// Create a default settings file watching the current directory
    pub fn init_config_file(force: bool) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = PathBuf::from(CONFIG_DIR).join("settings.toml");

        if !force && config_path.exists() {
            return Err("Configuration file already exists. Use --force to overwrite".into());
        }

        let mut settings = Settings::default();
        if let Ok(current_dir) = std::env::current_dir() {
            settings.watch.root = Some(current_dir);
        }

        settings.save(&config_path)?;
        Ok(config_path)
    }
}
