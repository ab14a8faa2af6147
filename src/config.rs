//! Configuration module for the echo client.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::endpoint::Endpoint;
use crate::error::EndpointError;
use crate::transport::TcpTransportOptions;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the echo client
#[derive(Parser, Debug)]
#[command(name = "echo-client")]
#[command(author = "echo-client authors")]
#[command(version = "0.1.0")]
#[command(about = "Send data to an echo server and verify it comes back intact", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Echo server as `host[:port]` or `[v6]:port`; overrides --host and --port
    #[arg(short = 'T', long, conflicts_with_all = ["host", "port"])]
    pub target: Option<Endpoint>,

    /// Echo server host name or address
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Echo server port (0 = the echo port, 7)
    #[arg(short, long, allow_negative_numbers = true)]
    pub port: Option<i64>,

    /// Timeout for each read or write in milliseconds
    #[arg(short = 't', long)]
    pub timeout_ms: Option<u64>,

    /// Connect timeout in milliseconds
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// TCP keepalive idle time in seconds (0 = off)
    #[arg(long)]
    pub keepalive_secs: Option<u64>,

    /// Times to echo each payload
    #[arg(short = 'n', long, default_value_t = 1)]
    pub count: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Payloads to echo; read lines from stdin when none are given
    pub payloads: Vec<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Target and request settings
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to connect to (0 or absent = 7)
    pub port: Option<i64>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Socket settings
#[derive(Debug, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            keepalive_secs: default_keepalive_secs(),
            nodelay: default_nodelay(),
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

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_keepalive_secs() -> u64 {
    30
}

fn default_nodelay() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint: Endpoint,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub keepalive: Option<Duration>,
    pub nodelay: bool,
    pub count: usize,
    pub payloads: Vec<String>,
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
            toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
                path: config_path.clone(),
                source,
            })?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let endpoint = match cli.target {
            Some(target) => target,
            None => {
                let host = cli.host.unwrap_or(toml_config.client.host);
                let port = cli.port.or(toml_config.client.port);
                Endpoint::new(&host, port)?
            }
        };

        let keepalive_secs = cli
            .keepalive_secs
            .unwrap_or(toml_config.transport.keepalive_secs);

        Ok(Config {
            endpoint,
            request_timeout: Duration::from_millis(
                cli.timeout_ms
                    .unwrap_or(toml_config.client.request_timeout_ms),
            ),
            connect_timeout: Duration::from_millis(
                cli.connect_timeout_ms
                    .unwrap_or(toml_config.transport.connect_timeout_ms),
            ),
            keepalive: (keepalive_secs > 0).then(|| Duration::from_secs(keepalive_secs)),
            nodelay: toml_config.transport.nodelay,
            count: cli.count,
            payloads: cli.payloads,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    pub fn transport_options(&self) -> TcpTransportOptions {
        TcpTransportOptions {
            request_timeout: self.request_timeout,
            connect_timeout: self.connect_timeout,
            keepalive: self.keepalive,
            nodelay: self.nodelay,
        }
    }
}

/// Configuration loading errors
#[derive(Error, Debug)]
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

    #[error("Invalid endpoint: {0}")]
    Endpoint(#[from] EndpointError),
}
