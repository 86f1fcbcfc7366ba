//! Configuration module for colo-sim.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the simulation
#[derive(Parser, Debug, Default)]
#[command(name = "colo-sim")]
#[command(author = "colo-sim authors")]
#[command(version = "0.1.0")]
#[command(about = "Co-location echo server with simulated clients", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:9999)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of simulated clients
    #[arg(short = 'n', long)]
    pub clients: Option<usize>,

    /// Messages sent by each client
    #[arg(short = 'm', long)]
    pub messages: Option<usize>,

    /// Maximum number of concurrent server connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Lower bound of the client pause in milliseconds
    #[arg(long)]
    pub min_delay_ms: Option<u64>,

    /// Upper bound of the client pause in milliseconds
    #[arg(long)]
    pub max_delay_ms: Option<u64>,

    /// Seconds between resource samples
    #[arg(long)]
    pub metrics_interval: Option<u64>,

    /// Disable the resource sampler
    #[arg(long)]
    pub no_metrics: bool,

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
    pub clients: ClientsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Cap on concurrently served connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            backlog: default_backlog(),
        }
    }
}

/// Client simulation configuration
#[derive(Debug, Deserialize)]
pub struct ClientsConfig {
    #[serde(default = "default_client_count")]
    pub count: usize,
    #[serde(default = "default_messages")]
    pub messages: usize,
    /// Lower bound of the pause between send and receive
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    /// Upper bound of the pause between send and receive
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ClientsConfig {
    fn default() -> Self {
        Self {
            count: default_client_count(),
            messages: default_messages(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Resource sampler configuration
#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_metrics_interval(),
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

fn default_listen() -> String {
    "127.0.0.1:9999".to_string()
}

fn default_max_connections() -> usize {
    10000
}

fn default_backlog() -> i32 {
    1024
}

fn default_client_count() -> usize {
    5
}

fn default_messages() -> usize {
    10
}

fn default_min_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

fn default_metrics_interval() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved server settings
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen: SocketAddr,
    pub max_connections: usize,
    pub backlog: i32,
}

/// Resolved client fleet settings
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub count: usize,
    pub messages: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

/// Resolved sampler settings
#[derive(Debug, Clone)]
pub struct MetricsOptions {
    pub enabled: bool,
    pub interval: Duration,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerOptions,
    pub clients: ClientOptions,
    pub metrics: MetricsOptions,
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
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents)
                .map_err(|source| ConfigError::TomlParse {
                    path: config_path.clone(),
                    source,
                })?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen_str = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen_str
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen_str.clone()))?;

        let max_connections = cli
            .max_connections
            .unwrap_or(toml_config.server.max_connections);
        if max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }

        let backlog = cli.backlog.unwrap_or(toml_config.server.backlog);
        if backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be at least 1"));
        }

        let clients = &toml_config.clients;
        let min_delay_ms = cli.min_delay_ms.unwrap_or(clients.min_delay_ms);
        let max_delay_ms = cli.max_delay_ms.unwrap_or(clients.max_delay_ms);
        if min_delay_ms > max_delay_ms {
            return Err(ConfigError::Invalid(
                "min_delay_ms must not exceed max_delay_ms",
            ));
        }

        let interval_secs = cli
            .metrics_interval
            .unwrap_or(toml_config.metrics.interval_secs);
        if interval_secs == 0 {
            return Err(ConfigError::Invalid("metrics interval must be at least 1s"));
        }

        Ok(Config {
            server: ServerOptions {
                listen,
                max_connections,
                backlog,
            },
            clients: ClientOptions {
                count: cli.clients.unwrap_or(clients.count),
                messages: cli.messages.unwrap_or(clients.messages),
                min_delay: Duration::from_millis(min_delay_ms),
                max_delay: Duration::from_millis(max_delay_ms),
            },
            metrics: MetricsOptions {
                enabled: toml_config.metrics.enabled && !cli.no_metrics,
                interval: Duration::from_secs(interval_secs),
            },
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Invalid listen address '{0}'")]
    InvalidListen(String),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
