//! Configuration management for vmctl.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/vmctl/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vmcore::{RemoteConfig, VmKind};

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_vms must be between 1 and 1000, got {0}")]
    InvalidMaxVms(usize),

    #[error("poll_delay_ms must be between 1 and 10000, got {0}")]
    InvalidPollDelay(u64),

    #[error("interpreter not found: {0}")]
    InvalidInterpreter(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("default profile must not be empty")]
    EmptyDefaultProfile,
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for vmctl.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub logging: LoggingConfig,

    /// Local interpreter configuration.
    pub runtime: RuntimeConfig,

    /// Registry limits and housekeeping.
    pub registry: RegistryConfig,

    /// Defaults for `create`.
    pub defaults: DefaultsConfig,

    /// Virtualization host used for remote VMs.
    pub remote: RemoteSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Directory for the rolling log files.
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Interpreter binary, looked up on PATH unless absolute.
    pub interpreter: String,

    /// Arguments passed to the interpreter.
    pub args: Vec<String>,

    /// Pause between forwarding a line and polling for output.
    pub poll_delay_ms: u64,

    /// Turn off terminal echo in the worker so input is not shown twice.
    pub disable_echo: bool,

    /// Prompt prefix shown while attached.
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Maximum number of live VMs.
    pub max_vms: usize,

    /// Seconds a stopped VM stays listed before it is purged (0 = keep
    /// until `purge`).
    pub tombstone_grace_secs: u64,

    /// Seconds between background liveness checks (0 = check only before
    /// each command).
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DefaultsConfig {
    pub profile: String,
    pub kind: VmKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteSection {
    pub host: String,
    pub username: String,

    /// Environment variable holding the host password.
    pub password_env: String,

    /// Template remote VMs are cloned from.
    pub template: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: default_log_dir(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            interpreter: "lua".to_string(),
            // Silence the interpreter's own prompts; the console draws one.
            args: vec![
                "-e".to_string(),
                "_PROMPT='' _PROMPT2=''".to_string(),
                "-i".to_string(),
            ],
            poll_delay_ms: 100,
            disable_echo: true,
            prompt: "lua".to_string(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_vms: 16,
            tombstone_grace_secs: 300,
            health_check_interval_secs: 0,
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            profile: "standard".to_string(),
            kind: VmKind::Local,
        }
    }
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            username: "root".to_string(),
            password_env: "VMCTL_REMOTE_PASSWORD".to_string(),
            template: "lua-bio-template".to_string(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vmctl")
        .join("config.toml")
}

/// Returns the default log directory.
fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vmctl")
        .join("logs")
}

impl RuntimeConfig {
    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }
}

impl RegistryConfig {
    /// Grace period before tombstones are purged automatically.
    pub fn tombstone_grace(&self) -> Option<Duration> {
        (self.tombstone_grace_secs > 0).then(|| Duration::from_secs(self.tombstone_grace_secs))
    }

    /// Interval of the background health check, if enabled.
    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_secs > 0)
            .then(|| Duration::from_secs(self.health_check_interval_secs))
    }
}

impl RemoteSection {
    /// Builds remote connection parameters, with per-command overrides
    /// taking precedence.
    pub fn to_remote_config(
        &self,
        host: Option<&str>,
        username: Option<&str>,
        password_env: Option<&str>,
        template: Option<&str>,
    ) -> RemoteConfig {
        let password_env = password_env.unwrap_or(&self.password_env);
        RemoteConfig {
            host: host.unwrap_or(&self.host).to_string(),
            username: username.unwrap_or(&self.username).to_string(),
            password_env: (!password_env.is_empty()).then(|| password_env.to_string()),
            template: template.unwrap_or(&self.template).to_string(),
        }
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - VMCTL_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - VMCTL_INTERPRETER: Override the interpreter binary
    /// - VMCTL_REMOTE_HOST: Override the virtualization host
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("VMCTL_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.logging.level = level;
            }
        }

        if let Ok(interpreter) = std::env::var("VMCTL_INTERPRETER") {
            if !interpreter.is_empty() {
                tracing::info!("Overriding interpreter from environment: {}", interpreter);
                self.runtime.interpreter = interpreter;
            }
        }

        if let Ok(host) = std::env::var("VMCTL_REMOTE_HOST") {
            if !host.is_empty() {
                tracing::info!("Overriding remote host from environment: {}", host);
                self.remote.host = host;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry.max_vms < 1 || self.registry.max_vms > 1000 {
            return Err(ConfigError::InvalidMaxVms(self.registry.max_vms));
        }

        if self.runtime.poll_delay_ms < 1 || self.runtime.poll_delay_ms > 10_000 {
            return Err(ConfigError::InvalidPollDelay(self.runtime.poll_delay_ms));
        }

        let interpreter = Path::new(&self.runtime.interpreter);
        let found = if interpreter.is_absolute() {
            interpreter.exists()
        } else {
            which::which(&self.runtime.interpreter).is_ok()
        };
        if !found {
            return Err(ConfigError::InvalidInterpreter(
                self.runtime.interpreter.clone(),
            ));
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        if self.defaults.profile.trim().is_empty() {
            return Err(ConfigError::EmptyDefaultProfile);
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
