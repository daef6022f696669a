//! Stream Configuration - stage selection, filter tuning and transport knobs
//!
//! Every section implements `Default`, so an empty or partial TOML file yields
//! a working detrend stage that subscribes to everything.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::defaults::{
    DEFAULT_IDLE_SECS, DEFAULT_MAX_STREAMS, DEFAULT_PROGRESS_EVERY, DEFAULT_SERVER_ADDR,
    DEFAULT_SUBSCRIPTION,
};
use crate::stream::registry::RetentionPolicy;
use crate::stream::topic::{SegmentRule, TopicFilter};
use crate::transform::{KalmanTuning, Stage, StageKind};

/// Environment variable naming a config file.
pub const CONFIG_ENV_VAR: &str = "CPSENS_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "cpsens_stream.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one stage process.
///
/// Load with `StreamConfig::load()` which searches:
/// 1. `$CPSENS_CONFIG` env var
/// 2. `./cpsens_stream.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Stage identity, subscriptions and topic rewrite
    #[serde(default)]
    pub stage: StageConfig,

    /// Kalman integrator tuning (integrate stage only)
    #[serde(default)]
    pub kalman: KalmanTuning,

    /// Registry retention
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Bridge transport and progress reporting
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Status HTTP server
    #[serde(default)]
    pub server: ServerConfig,
}

impl StreamConfig {
    /// Load configuration using the standard search order, falling back to
    /// defaults when a file is missing or invalid.
    pub fn load() -> Self {
        // 1. Check env var
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), stage = %config.stage.kind, "Loaded config from {}", CONFIG_ENV_VAR);
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {}, falling back", CONFIG_ENV_VAR);
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", CONFIG_ENV_VAR);
            }
        }

        // 2. Check ./cpsens_stream.toml
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!(stage = %config.stage.kind, "Loaded config from ./{}", LOCAL_CONFIG_FILE);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", LOCAL_CONFIG_FILE);
                }
            }
        }

        // 3. Defaults
        info!("No {} found, using built-in defaults", LOCAL_CONFIG_FILE);
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            ConfigError::Parse(_, inner) => ConfigError::Parse(path.to_path_buf(), inner),
            other => other,
        })
    }

    /// Parse and validate a TOML document. Unknown keys only warn.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }

        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(PathBuf::new(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the current config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate every section, collecting all failures.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        // Kalman: S = C P C' + R must never be zero
        let k = &self.kalman;
        if !k.process_noise.is_finite() || k.process_noise < 0.0 {
            errors.push(format!(
                "kalman.process_noise = {} must be finite and >= 0",
                k.process_noise
            ));
        }
        if !k.measurement_noise.is_finite() || k.measurement_noise <= 0.0 {
            errors.push(format!(
                "kalman.measurement_noise = {} must be finite and > 0",
                k.measurement_noise
            ));
        }

        if let Some(ref rewrite) = self.stage.rewrite {
            rewrite.check(&mut errors);
        }

        if self.stage.subscribe.is_empty() {
            errors.push("stage.subscribe must list at least one filter".to_string());
        }
        for filter in &self.stage.subscribe {
            if let Err(e) = filter.parse::<TopicFilter>() {
                errors.push(format!("stage.subscribe: {}", e));
            }
        }

        let r = &self.registry;
        match r.retention {
            RetentionKind::MaxStreams if r.max_streams == 0 => {
                errors.push("registry.max_streams must be > 0 when retention = \"max_streams\"".to_string());
            }
            RetentionKind::Idle if r.idle_secs == 0 => {
                errors.push("registry.idle_secs must be > 0 when retention = \"idle\"".to_string());
            }
            _ => {}
        }

        if self.server.enabled && self.server.addr.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "server.addr = '{}' is not a valid socket address",
                self.server.addr
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Stage preset for the configured kind, with the rewrite override applied.
    pub fn stage(&self) -> Stage {
        let preset = match self.stage.kind {
            StageKind::Detrend => Stage {
                kalman: self.kalman,
                ..Stage::detrend()
            },
            StageKind::Integrate => Stage::integrate(self.kalman),
        };

        match self.stage.rewrite.as_ref().and_then(RewriteConfig::rule) {
            Some(rule) => preset.with_rewrite(rule),
            None => preset,
        }
    }

    /// Parsed subscription filters. Malformed entries are skipped; `validate`
    /// reports them.
    pub fn subscriptions(&self) -> Vec<TopicFilter> {
        self.stage
            .subscribe
            .iter()
            .filter_map(|f| f.parse().ok())
            .collect()
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        self.registry.policy()
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Serialize(toml::ser::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            ConfigError::Parse(path, e) => {
                write!(f, "Config parse error ({}): {}", path.display(), e)
            }
            ConfigError::Serialize(e) => write!(f, "Config serialization error: {}", e),
            ConfigError::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Stage
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    #[serde(default)]
    pub kind: StageKind,

    /// MQTT-style filters; topics matching none of them are ignored.
    #[serde(default = "default_subscribe")]
    pub subscribe: Vec<String>,

    /// Overrides the preset's segment rewrite.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<RewriteConfig>,
}

fn default_subscribe() -> Vec<String> {
    vec![DEFAULT_SUBSCRIPTION.to_string()]
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            kind: StageKind::default(),
            subscribe: default_subscribe(),
            rewrite: None,
        }
    }
}

/// `[stage.rewrite]`: either `match` or `index`, plus `replace`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteConfig {
    #[serde(default, rename = "match", skip_serializing_if = "Option::is_none")]
    pub match_segment: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,

    #[serde(default)]
    pub replace: String,
}

impl RewriteConfig {
    /// `None` unless exactly one selector is set.
    pub fn rule(&self) -> Option<SegmentRule> {
        match (&self.match_segment, self.index) {
            (Some(from), None) => Some(SegmentRule::matching(from.clone(), self.replace.clone())),
            (None, Some(index)) => Some(SegmentRule::at_index(index, self.replace.clone())),
            _ => None,
        }
    }

    fn check(&self, errors: &mut Vec<String>) {
        if self.replace.is_empty() {
            errors.push("stage.rewrite.replace must not be empty".to_string());
        } else if self.replace.contains(['/', '+', '#']) {
            errors.push(format!(
                "stage.rewrite.replace = '{}' must not contain '/', '+' or '#'",
                self.replace
            ));
        }

        match (&self.match_segment, self.index) {
            (Some(_), Some(_)) => {
                errors.push("stage.rewrite: set either 'match' or 'index', not both".to_string())
            }
            (None, None) => {
                errors.push("stage.rewrite: one of 'match' or 'index' is required".to_string())
            }
            (Some(m), None) if m.is_empty() || m.contains('/') => errors.push(format!(
                "stage.rewrite.match = '{}' must be a single non-empty segment",
                m
            )),
            _ => {}
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionKind {
    #[default]
    Unbounded,
    MaxStreams,
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub retention: RetentionKind,

    /// Entry cap when `retention = "max_streams"`.
    #[serde(default = "default_max_streams")]
    pub max_streams: usize,

    /// Idle timeout (seconds) when `retention = "idle"`.
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
}

fn default_max_streams() -> usize {
    DEFAULT_MAX_STREAMS
}

fn default_idle_secs() -> u64 {
    DEFAULT_IDLE_SECS
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            retention: RetentionKind::default(),
            max_streams: default_max_streams(),
            idle_secs: default_idle_secs(),
        }
    }
}

impl RegistryConfig {
    pub fn policy(&self) -> RetentionPolicy {
        match self.retention {
            RetentionKind::Unbounded => RetentionPolicy::Unbounded,
            RetentionKind::MaxStreams => RetentionPolicy::MaxStreams(self.max_streams),
            RetentionKind::Idle => RetentionPolicy::Idle(Duration::from_secs(self.idle_secs)),
        }
    }
}

// ============================================================================
// Bridge
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Inbound messages between progress log lines; 0 disables them.
    #[serde(default = "default_progress_every")]
    pub progress_every: u64,
}

fn default_progress_every() -> u64 {
    DEFAULT_PROGRESS_EVERY
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            progress_every: default_progress_every(),
        }
    }
}

// ============================================================================
// Server
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Status API bind address.
    ///
    /// Can be overridden by `CPSENS_SERVER_ADDR` env var or `--addr` CLI flag.
    #[serde(default = "default_server_addr")]
    pub addr: String,

    #[serde(default = "default_server_enabled")]
    pub enabled: bool,
}

fn default_server_addr() -> String {
    DEFAULT_SERVER_ADDR.to_string()
}

fn default_server_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
            enabled: default_server_enabled(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
