//! Configuration module for the shoutback server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

/// Which runtime drives connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    /// Single-threaded readiness loop (the core).
    Reactor,
    /// One blocking OS thread per connection (contrast baseline).
    Threaded,
}

/// What to do when a client's payload fills the buffer to capacity.
///
/// A full buffer may mean more bytes are queued behind it; with no framing
/// on the wire there is no way to tell a maximal message from a truncated
/// one, so the behavior is an explicit configuration choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OversizePolicy {
    /// Reply with the first `buffer_size` bytes and discard the rest.
    Truncate,
    /// Treat a full buffer as potentially truncated and close without
    /// replying.
    Reject,
}

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "shoutback")]
#[command(version = "0.1.0")]
#[command(about = "A TCP echo server that shouts back", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Per-connection buffer capacity in bytes
    #[arg(short = 'b', long)]
    pub buffer_size: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Behavior when a payload fills the buffer
    #[arg(long, value_enum)]
    pub oversize: Option<OversizePolicy>,

    /// Runtime to use
    #[arg(short, long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub echo: EchoConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum number of concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Runtime to use
    pub runtime: Option<RuntimeType>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            runtime: None,
        }
    }
}

/// Echo protocol configuration
#[derive(Debug, Deserialize)]
pub struct EchoConfig {
    /// Per-connection buffer capacity in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Behavior when a payload fills the buffer
    pub oversize: Option<OversizePolicy>,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            oversize: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7777
}

fn default_max_connections() -> usize {
    1024
}

fn default_buffer_size() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub buffer_size: usize,
    pub max_connections: usize,
    pub oversize: OversizePolicy,
    pub runtime: RuntimeType,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        // Merge CLI args with TOML config (CLI takes precedence)
        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            buffer_size: cli.buffer_size.unwrap_or(toml_config.echo.buffer_size),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            oversize: cli
                .oversize
                .or(toml_config.echo.oversize)
                .unwrap_or(OversizePolicy::Truncate),
            runtime: cli
                .runtime
                .or(toml_config.server.runtime)
                .unwrap_or(RuntimeType::Reactor),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be at least 1".into()));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
