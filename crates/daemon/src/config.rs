//! Configuration management for the Termgate daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termgate/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default HTTP listen address.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default HTTP listen port.
pub const DEFAULT_PORT: u16 = 3000;

/// Upper bound for any command timeout, configured or per request.
pub const MAX_COMMAND_TIMEOUT_SECS: u64 = 86_400;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_sessions must be between 1 and 1000, got {0}")]
    InvalidMaxSessions(usize),

    #[error("command_timeout_secs must be between 1 and 86400, got {0}")]
    InvalidCommandTimeout(u64),

    #[error("resync_timeout_secs must be between 1 and 600, got {0}")]
    InvalidResyncTimeout(u64),

    #[error("poll_interval_ms must be at least 1")]
    InvalidPollInterval,

    #[error("max_output_bytes must be greater than 0, got {0}")]
    InvalidMaxOutput(usize),

    #[error("port must be non-zero")]
    InvalidPort,

    #[error("default_session_name must not be empty")]
    EmptySessionName,

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Termgate daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// HTTP listener configuration.
    pub server: ServerConfig,

    /// Shell session configuration.
    pub session: SessionConfig,

    /// Detached job configuration.
    pub job: JobConfig,

    /// Output streaming configuration.
    pub stream: StreamConfig,

    /// Security settings.
    pub security: SecurityConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for logs, job output files and the pid file.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind.
    pub host: String,

    /// Port to bind.
    pub port: u16,
}

/// Shell session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Default shell to use for new sessions.
    pub default_shell: String,

    /// Name of the session pre-created at startup.
    pub default_session_name: String,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Wall-clock budget for one dispatched command.
    pub command_timeout_secs: u64,

    /// Budget for resynchronizing a session after a timeout.
    pub resync_timeout_secs: u64,

    /// Query the shell's working directory after every command.
    pub track_cwd: bool,

    /// Number of commands kept per session for the history endpoint.
    pub history_limit: usize,

    /// How often terminated sessions are reaped.
    pub cleanup_interval_secs: u64,
}

/// Detached job configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JobConfig {
    /// Grace period between SIGTERM and SIGKILL when stopping a job.
    pub stop_grace_ms: u64,

    /// Output cap per job; further output is dropped.
    pub max_output_bytes: usize,

    /// Mirror job output to `<data_dir>/jobs/<id>.log`.
    pub log_to_file: bool,
}

/// Output streaming configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Idle delay between buffer checks when no change notification arrives.
    pub poll_interval_ms: u64,
}

/// Security settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SecurityConfig {
    /// Static bearer token. Generated on first start when absent.
    pub api_key: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            default_session_name: "default".to_string(),
            max_sessions: 10,
            command_timeout_secs: 10,
            resync_timeout_secs: 5,
            track_cwd: true,
            history_limit: 100,
            cleanup_interval_secs: 60,
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            stop_grace_ms: 2000,
            max_output_bytes: 8 * 1024 * 1024, // 8MB
            log_to_file: false,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
        }
    }
}

impl SessionConfig {
    /// Command timeout as a [`Duration`].
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Resync timeout as a [`Duration`].
    pub fn resync_timeout(&self) -> Duration {
        Duration::from_secs(self.resync_timeout_secs)
    }
}

impl JobConfig {
    /// Stop grace period as a [`Duration`].
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termgate")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termgate")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMGATE_API_KEY: Override the bearer token
    /// - TERMGATE_HOST: Override the listen address
    /// - TERMGATE_PORT: Override the listen port
    /// - TERMGATE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("TERMGATE_API_KEY") {
            if !key.is_empty() {
                tracing::info!("Overriding api_key from environment");
                self.security.api_key = Some(key);
            }
        }

        if let Ok(host) = std::env::var("TERMGATE_HOST") {
            if !host.is_empty() {
                tracing::info!("Overriding host from environment: {}", host);
                self.server.host = host;
            }
        }

        if let Ok(port) = std::env::var("TERMGATE_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Overriding port from environment: {}", port);
                    self.server.port = port;
                }
                Err(_) if port.is_empty() => {}
                Err(e) => tracing::warn!("Ignoring invalid TERMGATE_PORT {:?}: {}", port, e),
            }
        }

        if let Ok(level) = std::env::var("TERMGATE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.max_sessions < 1 || self.session.max_sessions > 1000 {
            return Err(ConfigError::InvalidMaxSessions(self.session.max_sessions));
        }

        if self.session.command_timeout_secs < 1
            || self.session.command_timeout_secs > MAX_COMMAND_TIMEOUT_SECS
        {
            return Err(ConfigError::InvalidCommandTimeout(
                self.session.command_timeout_secs,
            ));
        }

        if self.session.resync_timeout_secs < 1 || self.session.resync_timeout_secs > 600 {
            return Err(ConfigError::InvalidResyncTimeout(
                self.session.resync_timeout_secs,
            ));
        }

        if self.session.default_session_name.trim().is_empty() {
            return Err(ConfigError::EmptySessionName);
        }

        if self.job.max_output_bytes == 0 {
            return Err(ConfigError::InvalidMaxOutput(self.job.max_output_bytes));
        }

        if self.stream.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidPollInterval);
        }

        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if !shell_exists(&self.session.default_shell) {
            return Err(ConfigError::InvalidShellPath(
                self.session.default_shell.clone(),
            ));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
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

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
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

    /// Makes sure an API key is configured.
    ///
    /// When none is set, a UUID v4 key is generated and persisted to `path`
    /// so the same key survives restarts. Returns `true` when a key was
    /// generated.
    pub fn ensure_api_key<P: AsRef<Path>>(&mut self, path: P) -> Result<bool> {
        if self
            .security
            .api_key
            .as_deref()
            .is_some_and(|k| !k.is_empty())
        {
            return Ok(false);
        }

        self.security.api_key = Some(uuid::Uuid::new_v4().to_string());
        self.save(path.as_ref())
            .context("Failed to persist generated API key")?;

        tracing::info!("Generated new API key and saved to {:?}", path.as_ref());
        Ok(true)
    }

    /// Returns the configured API key, or an empty string.
    pub fn api_key(&self) -> &str {
        self.security.api_key.as_deref().unwrap_or("")
    }

    /// Returns the `host:port` listen address.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Returns the base URL a local client should use to reach the daemon.
    pub fn local_base_url(&self) -> String {
        let host = match self.server.host.as_str() {
            "0.0.0.0" | "::" | "" => "127.0.0.1",
            other => other,
        };
        format!("http://{}:{}", host, self.server.port)
    }
}

/// Returns whether a shell program is an existing absolute path or on `PATH`.
fn shell_exists(shell: &str) -> bool {
    let path = Path::new(shell);
    if path.is_absolute() {
        path.exists()
    } else {
        which::which(shell).is_ok()
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
