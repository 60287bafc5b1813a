//! Configuration management for the sniffer daemon.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. `config/sniffer.ini` relative to the working directory
//! 3. `/etc/sniffer/sniffer.ini`, or the file given with `--config`
//! 4. Environment variables (`SNIFFER__SERVER__LOCATIONS=...`)

use crate::frame_decoder::MetadataLayout;
use crate::observation::{MacAddr, MacFilter};
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const SYSTEM_CONFIG_PATH: &str = "/etc/sniffer/sniffer.ini";

/// Main configuration for the sniffer daemon.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnifferConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub decoder: DecoderConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Identity, storage target and watched locations.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Identifier of this sniffer instance
    #[serde(default = "default_server_id")]
    pub id: String,

    /// Storage connection string shared by every location node
    #[serde(default = "default_db_hosts")]
    pub db_hosts: String,

    /// Comma-separated list of capture directories
    #[serde(default)]
    pub locations: String,

    /// License key required by `activate` and `stop_service`
    #[serde(default)]
    pub license_key: Option<String>,

    /// Number of decode threads
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

/// Administrative channel configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_host")]
    pub host: String,

    #[serde(default = "default_admin_port")]
    pub port: u16,

    /// Interval between pings to verified connections
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Delay between an accepted stop request and shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// How long `--stop` waits for the daemon to answer
    #[serde(default = "default_client_timeout_secs")]
    pub client_timeout_secs: u64,

    /// Longest a response or ping write may block before the peer is dropped
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecoderConfig {
    #[serde(default)]
    pub metadata_layout: MetadataLayout,

    /// Comma-separated transmitter addresses that are never stored
    #[serde(default)]
    pub filtered_macs: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Maximum number of connections per node pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus exporter port; disabled when unset
    #[serde(default)]
    pub port: Option<u16>,
}

fn default_server_id() -> String {
    "localhost".to_string()
}

fn default_db_hosts() -> String {
    "postgres://127.0.0.1/sniffer".to_string()
}

fn default_worker_threads() -> usize {
    4
}

fn default_admin_host() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    6317
}

fn default_keepalive_secs() -> u64 {
    60
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_client_timeout_secs() -> u64 {
    10
}

fn default_write_timeout_secs() -> u64 {
    5
}

fn default_max_connections() -> u32 {
    4
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: default_server_id(),
            db_hosts: default_db_hosts(),
            locations: String::new(),
            license_key: None,
            worker_threads: default_worker_threads(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            host: default_admin_host(),
            port: default_admin_port(),
            keepalive_secs: default_keepalive_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            client_timeout_secs: default_client_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl SnifferConfig {
    /// Load configuration from files and environment variables.
    ///
    /// `path` replaces the system-wide file when given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(File::new("config/sniffer", FileFormat::Ini).required(false));

        builder = match path {
            Some(path) => builder.add_source(File::from(path.to_path_buf()).format(FileFormat::Ini)),
            None => builder.add_source(File::new(SYSTEM_CONFIG_PATH, FileFormat::Ini).required(false)),
        };

        builder
            // SNIFFER__ADMIN__PORT -> admin.port
            .add_source(
                Environment::with_prefix("SNIFFER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.server.id.is_empty() {
            return Err(ConfigValidationError::MissingField("server.id".to_string()));
        }

        if self.server.db_hosts.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "server.db_hosts".to_string(),
            ));
        }

        if self.server.worker_threads == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "server.worker_threads".to_string(),
                message: "At least one worker thread is required".to_string(),
            });
        }

        if self.admin.port == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "admin.port".to_string(),
                message: "Port must be greater than 0".to_string(),
            });
        }

        for (field, secs) in [
            ("admin.keepalive_secs", self.admin.keepalive_secs),
            ("admin.shutdown_grace_secs", self.admin.shutdown_grace_secs),
            ("admin.client_timeout_secs", self.admin.client_timeout_secs),
            ("admin.write_timeout_secs", self.admin.write_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigValidationError::InvalidValue {
                    field: field.to_string(),
                    message: "Interval must be greater than 0".to_string(),
                });
            }
        }

        self.decoder.mac_filter()?;
        Ok(())
    }
}

impl ServerConfig {
    /// Watched directories in configuration order.
    pub fn location_dirs(&self) -> Vec<PathBuf> {
        split_list(&self.locations).map(PathBuf::from).collect()
    }
}

impl AdminConfig {
    /// Address of the admin listener.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

impl DecoderConfig {
    pub fn mac_filter(&self) -> Result<MacFilter, ConfigValidationError> {
        let addresses = split_list(&self.filtered_macs)
            .map(|raw| {
                raw.parse::<MacAddr>()
                    .map_err(|e| ConfigValidationError::InvalidValue {
                        field: "decoder.filtered_macs".to_string(),
                        message: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(MacFilter::new(addresses))
    }
}

impl DatabaseConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|item| !item.is_empty())
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
