//! Configuration module for the echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values. With neither,
//! the server listens on `0.0.0.0:1234` with no timeouts or limits.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "echo-server")]
#[command(author = "echo-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A concurrent TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:1234)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of runtime worker threads (unset or 1 = single-threaded)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Listen backlog passed to listen(2)
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Maximum number of concurrent connections (unset = unbounded)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Per-session read buffer size in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Close a session when a read waits longer than this
    #[arg(long)]
    pub read_timeout_ms: Option<u64>,

    /// Close a session when a write waits longer than this
    #[arg(long)]
    pub write_timeout_ms: Option<u64>,

    /// Extra bind attempts before giving up
    #[arg(long)]
    pub bind_retries: Option<u32>,

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
    pub session: SessionConfig,
    #[serde(default)]
    pub bind: BindConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of runtime worker threads
    pub workers: Option<usize>,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Connection ceiling
    pub max_connections: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            backlog: default_backlog(),
            max_connections: None,
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    /// Read buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    pub read_timeout_ms: Option<u64>,
    pub write_timeout_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            read_timeout_ms: None,
            write_timeout_ms: None,
        }
    }
}

/// Bind retry policy
#[derive(Debug, Deserialize)]
pub struct BindConfig {
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            retries: 0,
            backoff_ms: default_backoff_ms(),
            backoff_max_ms: default_backoff_max_ms(),
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
    "0.0.0.0:1234".to_string()
}

fn default_backlog() -> i32 {
    1024
}

fn default_buffer_size() -> usize {
    128
}

fn default_backoff_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Bounded retry policy for binding the listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindPolicy {
    pub retries: u32,
    pub backoff_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for BindPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            backoff_ms: default_backoff_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub workers: Option<usize>,
    pub backlog: i32,
    pub max_connections: Option<usize>,
    pub buffer_size: usize,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub bind: BindPolicy,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 1234)),
            workers: None,
            backlog: default_backlog(),
            max_connections: None,
            buffer_size: default_buffer_size(),
            read_timeout: None,
            write_timeout: None,
            bind: BindPolicy::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen_str = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen_str
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("invalid listen address '{listen_str}'")))?;

        let config = Config {
            listen,
            workers: cli.workers.or(toml_config.server.workers),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            max_connections: cli
                .max_connections
                .or(toml_config.server.max_connections),
            buffer_size: cli
                .buffer_size
                .unwrap_or(toml_config.session.buffer_size),
            read_timeout: cli
                .read_timeout_ms
                .or(toml_config.session.read_timeout_ms)
                .map(Duration::from_millis),
            write_timeout: cli
                .write_timeout_ms
                .or(toml_config.session.write_timeout_ms)
                .map(Duration::from_millis),
            bind: BindPolicy {
                retries: cli.bind_retries.unwrap_or(toml_config.bind.retries),
                backoff_ms: toml_config.bind.backoff_ms,
                backoff_max_ms: toml_config.bind.backoff_max_ms,
            },
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the listener or sessions cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be greater than 0".into()));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be greater than 0".into()));
        }
        if self.max_connections == Some(0) {
            return Err(ConfigError::Invalid(
                "max_connections must be greater than 0 when set".into(),
            ));
        }
        if self.read_timeout == Some(Duration::ZERO) || self.write_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid("timeouts must be greater than 0 when set".into()));
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        let mut argv = vec!["echo-server"];
        argv.extend_from_slice(args);
        CliArgs::parse_from(argv)
    }

    #[test]
    fn test_default_config() {
        let config = Config::merge(cli(&[]), TomlConfig::default()).unwrap();
        assert_eq!(config.listen, "0.0.0.0:1234".parse::<SocketAddr>().unwrap());
        assert_eq!(config.buffer_size, 128);
        assert_eq!(config.workers, None);
        assert_eq!(config.max_connections, None);
        assert_eq!(config.read_timeout, None);
        assert_eq!(config.write_timeout, None);
        assert_eq!(config.bind.retries, 0);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:7000"
            workers = 4
            max_connections = 512

            [session]
            buffer_size = 4096
            read_timeout_ms = 30000

            [bind]
            retries = 3
            backoff_ms = 50

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:7000");
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.backlog, 1024);
        assert_eq!(config.server.max_connections, Some(512));
        assert_eq!(config.session.buffer_size, 4096);
        assert_eq!(config.session.read_timeout_ms, Some(30000));
        assert_eq!(config.session.write_timeout_ms, None);
        assert_eq!(config.bind.retries, 3);
        assert_eq!(config.bind.backoff_ms, 50);
        assert_eq!(config.bind.backoff_max_ms, 5000);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:7000"
            [session]
            buffer_size = 4096
            "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&["-l", "127.0.0.1:9000", "--buffer-size", "64", "--read-timeout-ms", "250"]),
            toml_config,
        )
        .unwrap();

        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.buffer_size, 64);
        assert_eq!(config.read_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = Config::merge(cli(&["-l", "not-an-address"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = Config::merge(cli(&["--buffer-size", "0"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err =
            Config::merge(cli(&["--max-connections", "0"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err =
            Config::merge(cli(&["--write-timeout-ms", "0"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
