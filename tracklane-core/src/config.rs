//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/tracklane/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/tracklane/` (~/.config/tracklane/)
//! - Data: `$XDG_DATA_HOME/tracklane/` (~/.local/share/tracklane/)
//! - State/Logs: `$XDG_STATE_HOME/tracklane/` (~/.local/state/tracklane/)

use crate::error::{Error, Result};
use crate::types::{Authorization, FlushingMode, Project, Properties};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default tracking API host
pub const DEFAULT_BASE_URL: &str = "https://api.exponea.com";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Tracking project configuration
    #[serde(default)]
    pub project: ProjectConfig,

    /// Flushing configuration
    #[serde(default)]
    pub flushing: FlushingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Tracking project configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ProjectConfig {
    /// Project token records are tracked into
    pub project_token: Option<String>,

    /// API base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Authorization, e.g. "Token abc" or "Bearer abc"
    #[serde(default)]
    pub authorization: Authorization,

    /// Properties merged into every tracked record
    #[serde(default)]
    pub default_properties: Properties,

    /// Additional projects receiving a given event type
    #[serde(default)]
    pub mapping: HashMap<String, Vec<MappedProject>>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            project_token: None,
            base_url: default_base_url(),
            authorization: Authorization::None,
            default_properties: Properties::new(),
            mapping: HashMap::new(),
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

/// Extra project an event type is mirrored into
#[derive(Debug, Deserialize, Clone)]
pub struct MappedProject {
    pub project_token: String,
    /// Falls back to the main project's base URL
    pub base_url: Option<String>,
    /// Falls back to the main project's authorization
    pub authorization: Option<Authorization>,
}

/// Flushing mode as written in the config file
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FlushingModeKind {
    Manual,
    #[default]
    Immediate,
    Periodic,
}

/// Flushing configuration
#[derive(Debug, Deserialize, Clone)]
pub struct FlushingConfig {
    /// manual, immediate or periodic
    #[serde(default)]
    pub mode: FlushingModeKind,

    /// Seconds between flushes in periodic mode
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,

    /// Failed deliveries before a record is discarded
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Debounce before an immediate-mode flush, in milliseconds
    #[serde(default = "default_immediate_delay_ms")]
    pub immediate_delay_ms: u64,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Event types sent with a relative `age` instead of an absolute `timestamp`
    #[serde(default)]
    pub age_event_types: Vec<String>,
}

impl Default for FlushingConfig {
    fn default() -> Self {
        Self {
            mode: FlushingModeKind::default(),
            period_secs: default_period_secs(),
            max_retries: default_max_retries(),
            immediate_delay_ms: default_immediate_delay_ms(),
            timeout_secs: default_timeout_secs(),
            age_event_types: vec![],
        }
    }
}

impl FlushingConfig {
    /// Flushing mode to start with
    pub fn flushing_mode(&self) -> FlushingMode {
        match self.mode {
            FlushingModeKind::Manual => FlushingMode::Manual,
            FlushingModeKind::Immediate => FlushingMode::Immediate,
            FlushingModeKind::Periodic => FlushingMode::Periodic(self.period_secs),
        }
    }

    pub fn immediate_delay(&self) -> Duration {
        Duration::from_millis(self.immediate_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_period_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    5
}

fn default_immediate_delay_ms() -> u64 {
    3000
}

fn default_timeout_secs() -> u64 {
    30
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Only alphanumerics and dashes are accepted in project tokens.
fn validate_project_token(token: &str) -> Result<()> {
    if token.is_empty() {
        return Err(Error::Config(
            "project token cannot be an empty string".to_string(),
        ));
    }
    if !token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(Error::Config(format!(
            "project token {:?} may only contain alphanumeric symbols and dashes",
            token
        )));
    }
    Ok(())
}

fn validate_base_url(base_url: &str) -> Result<()> {
    let url = reqwest::Url::parse(base_url)
        .map_err(|e| Error::Config(format!("invalid base_url {:?}: {}", base_url, e)))?;
    if url.host_str().is_none() {
        return Err(Error::Config(format!(
            "base_url {:?} has no host",
            base_url
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        let token = self.project.project_token.as_deref().ok_or_else(|| {
            Error::Config("project.project_token is required".to_string())
        })?;
        validate_project_token(token)?;
        validate_base_url(&self.project.base_url)?;

        for (event_type, projects) in &self.project.mapping {
            for mapped in projects {
                validate_project_token(&mapped.project_token).map_err(|e| {
                    Error::Config(format!(
                        "project mapping for event type {:?} is not valid: {}",
                        event_type, e
                    ))
                })?;
                if let Some(base_url) = &mapped.base_url {
                    validate_base_url(base_url)?;
                }
            }
        }

        if self.flushing.max_retries == 0 {
            return Err(Error::Config(
                "flushing.max_retries must be at least 1".to_string(),
            ));
        }
        if self.flushing.mode == FlushingModeKind::Periodic && self.flushing.period_secs == 0 {
            return Err(Error::Config(
                "flushing.period_secs must be positive in periodic mode".to_string(),
            ));
        }
        Ok(())
    }

    /// The main project records are tracked into
    pub fn default_project(&self) -> Result<Project> {
        let project_token = self.project.project_token.clone().ok_or_else(|| {
            Error::Config("project.project_token is required".to_string())
        })?;
        Ok(Project {
            base_url: self.project.base_url.clone(),
            project_token,
            authorization: self.project.authorization.clone(),
        })
    }

    /// Every project an event type is tracked into, main project first
    pub fn projects_for(&self, event_type: &str) -> Result<Vec<Project>> {
        let main = self.default_project()?;
        let mut projects = vec![main.clone()];
        if let Some(mapped) = self.project.mapping.get(event_type) {
            projects.extend(mapped.iter().map(|m| Project {
                base_url: m.base_url.clone().unwrap_or_else(|| main.base_url.clone()),
                project_token: m.project_token.clone(),
                authorization: m
                    .authorization
                    .clone()
                    .unwrap_or_else(|| main.authorization.clone()),
            }));
        }
        Ok(projects)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/tracklane/config.toml` (~/.config/tracklane/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("tracklane").join("config.toml")
    }

    /// Returns the data directory path (for SQLite database)
    ///
    /// `$XDG_DATA_HOME/tracklane/` (~/.local/share/tracklane/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("tracklane")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/tracklane/` (~/.local/state/tracklane/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("tracklane")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/tracklane/data.db` (~/.local/share/tracklane/data.db)
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("data.db")
    }
}
