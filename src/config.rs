//! Configuration module for echo-stress.
//!
//! Supports command-line arguments and a configuration file. The file is
//! either the plain `key=value` format or, for paths ending in `.toml`, a
//! TOML document. CLI arguments take precedence over config file values.

use crate::error::ConfigError;
use bytes::Bytes;
use clap::Parser;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file read when `--config` is not given, if it exists.
pub const DEFAULT_CONFIG_PATH: &str = "client_configuration.txt";

/// Command-line arguments for the load client
#[derive(Parser, Debug, Default)]
#[command(name = "echo-stress")]
#[command(author = "echo-stress authors")]
#[command(version = "0.1.0")]
#[command(about = "Drives many concurrent echo sessions against a TCP server", long_about = None)]
pub struct CliArgs {
    /// Path to configuration file (key=value, or TOML when it ends in .toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address of the server under test
    #[arg(short = 'a', long)]
    pub server_address: Option<String>,

    /// Port of the server under test
    #[arg(short = 'p', long)]
    pub server_port: Option<u16>,

    /// Number of client connections to open
    #[arg(short = 'n', long)]
    pub connections: Option<usize>,

    /// Echo round trips to perform on each connection
    #[arg(short = 'i', long)]
    pub iterations: Option<u64>,

    /// Payload sent on every request
    #[arg(short = 'e', long)]
    pub echo_string: Option<String>,

    /// Read timeout in seconds (0 disables it)
    #[arg(short = 't', long)]
    pub socket_timeout: Option<u64>,

    /// Upper bound on a single poll wait, in milliseconds
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,

    /// File the run report is appended to
    #[arg(long)]
    pub log_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Client settings as they appear in a config file.
#[derive(Debug, Deserialize, Default, PartialEq)]
pub struct ClientSection {
    pub server_address: Option<String>,
    pub server_port: Option<u16>,
    pub total_client_connections: Option<usize>,
    pub echo_iterations_per_client: Option<u64>,
    pub echo_string: Option<String>,
    pub socket_timeout: Option<u64>,
    pub poll_interval_ms: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Default, PartialEq)]
pub struct LoggingSection {
    /// Log level
    pub level: Option<String>,
    /// Report file
    pub path: Option<PathBuf>,
}

/// Parsed config file, whichever format it came from.
#[derive(Debug, Deserialize, Default, PartialEq)]
pub struct FileConfig {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

const DEFAULT_SERVER_ADDRESS: &str = "127.0.0.1";
const DEFAULT_SERVER_PORT: u16 = 7000;
const DEFAULT_ECHO_STRING: &str = "ping";
const DEFAULT_SOCKET_TIMEOUT_SECS: u64 = 5;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_LOG_PATH: &str = "client_log.txt";
const DEFAULT_LOG_LEVEL: &str = "info";

/// Final resolved configuration. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct Config {
    pub server_address: String,
    pub server_port: u16,
    pub connections: usize,
    pub iterations: u64,
    pub payload: Bytes,
    /// `None` when the read timeout is disabled.
    pub socket_timeout: Option<Duration>,
    pub poll_interval: Duration,
    pub log_path: PathBuf,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and the config file.
    /// CLI arguments take precedence over file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let file = match cli.config {
            Some(ref path) => read_config_file(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                read_config_file(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => FileConfig::default(),
        };

        Self::resolve(cli, file)
    }

    /// Merge CLI arguments over file values and fill in defaults.
    pub fn resolve(cli: CliArgs, file: FileConfig) -> Result<Self, ConfigError> {
        let FileConfig { client, logging } = file;

        let echo_string = cli
            .echo_string
            .or(client.echo_string)
            .unwrap_or_else(|| DEFAULT_ECHO_STRING.to_string());
        if echo_string.is_empty() {
            return Err(ConfigError::EmptyPayload);
        }

        let timeout_secs = cli
            .socket_timeout
            .or(client.socket_timeout)
            .unwrap_or(DEFAULT_SOCKET_TIMEOUT_SECS);
        let poll_ms = cli
            .poll_interval_ms
            .or(client.poll_interval_ms)
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS)
            .max(1);

        Ok(Config {
            server_address: cli
                .server_address
                .or(client.server_address)
                .unwrap_or_else(|| DEFAULT_SERVER_ADDRESS.to_string()),
            server_port: cli
                .server_port
                .or(client.server_port)
                .unwrap_or(DEFAULT_SERVER_PORT),
            connections: cli
                .connections
                .or(client.total_client_connections)
                .unwrap_or(1),
            iterations: cli
                .iterations
                .or(client.echo_iterations_per_client)
                .unwrap_or(1),
            payload: Bytes::from(echo_string.into_bytes()),
            socket_timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            poll_interval: Duration::from_millis(poll_ms),
            log_path: cli
                .log_path
                .or(logging.path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_PATH)),
            log_level: cli
                .log_level
                .or(logging.level)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        })
    }
}

/// Read a config file, picking the format from its extension.
pub fn read_config_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;

    if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
            path: path.to_path_buf(),
            source,
        })
    } else {
        parse_key_value(&contents)
    }
}

/// Parse the `key=value` format.
///
/// Blank lines and lines starting with `#` are skipped, unknown keys are
/// ignored, and the value is everything after the first `=`.
pub fn parse_key_value(contents: &str) -> Result<FileConfig, ConfigError> {
    let mut config = FileConfig::default();

    for (idx, raw) in contents.lines().enumerate() {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), Some(value)),
            None => (line.trim(), None),
        };

        if !is_known_key(key) {
            continue;
        }
        let value = value.ok_or_else(|| ConfigError::MissingValue {
            key: key.to_string(),
            line: idx + 1,
        })?;

        let client = &mut config.client;
        match key {
            "server_address" => client.server_address = Some(value.trim().to_string()),
            "echo_string" => client.echo_string = Some(value.to_string()),
            "server_port" => client.server_port = Some(parse_integer(key, value)?),
            "total_client_connections" => {
                client.total_client_connections = Some(parse_integer(key, value)?)
            }
            "echo_iterations_per_client" => {
                client.echo_iterations_per_client = Some(parse_integer(key, value)?)
            }
            "socket_timeout" => client.socket_timeout = Some(parse_integer(key, value)?),
            "poll_interval_ms" => client.poll_interval_ms = Some(parse_integer(key, value)?),
            "log_path" => config.logging.path = Some(PathBuf::from(value.trim())),
            "log_level" => config.logging.level = Some(value.trim().to_string()),
            _ => {}
        }
    }

    Ok(config)
}

fn is_known_key(key: &str) -> bool {
    matches!(
        key,
        "server_address"
            | "server_port"
            | "total_client_connections"
            | "echo_iterations_per_client"
            | "echo_string"
            | "socket_timeout"
            | "poll_interval_ms"
            | "log_path"
            | "log_level"
    )
}

/// Integers are plain decimal digits; signs and whitespace inside are rejected.
fn parse_integer<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    let trimmed = value.trim();
    let invalid = || ConfigError::InvalidInteger {
        key: key.to_string(),
        value: value.to_string(),
    };

    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    trimmed.parse().map_err(|_| invalid())
}
