use crate::paths::AppDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const CURRENT_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_config_version")]
    pub config_version: u32,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            bridge: BridgeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Network and execution limits for the command bridge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BridgeConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_per_connection: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            max_in_flight_per_connection: default_max_in_flight(),
            request_timeout_secs: default_request_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_frame_bytes: default_max_frame_bytes(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            worker_threads: default_worker_threads(),
        }
    }
}

impl BridgeConfig {
    /// Endpoint string in `host:port` form, suitable for `TcpListener::bind`.
    pub fn endpoint(&self) -> String {
        match self.host.parse::<std::net::IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, self.port).to_string(),
            Err(_) => format!("{}:{}", self.host, self.port),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.trim().is_empty() {
            return Err(ValidationError::EmptyHost);
        }
        let non_zero = [
            ("max_connections", self.max_connections as u64),
            (
                "max_in_flight_per_connection",
                self.max_in_flight_per_connection as u64,
            ),
            ("request_timeout_secs", self.request_timeout_secs),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("max_frame_bytes", self.max_frame_bytes as u64),
            ("worker_threads", self.worker_threads as u64),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ValidationError::ZeroLimit { field });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_max_log_files")]
    pub max_log_files: usize,
    #[serde(default = "default_stdout_enabled")]
    pub stdout: bool,
    #[serde(default)]
    pub file_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_log_files: default_max_log_files(),
            stdout: default_stdout_enabled(),
            file_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config validation failed: {0}")]
    Validation(ValidationError),
    #[error("failed to prepare configuration directories: {0}")]
    Directories(#[from] crate::paths::DirsError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unsupported config_version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("bridge.host must not be empty")]
    EmptyHost,
    #[error("bridge.{field} must be greater than zero")]
    ZeroLimit { field: &'static str },
}

impl Config {
    pub fn load_or_default(dirs: &AppDirs) -> Result<Self, ConfigError> {
        dirs.ensure_exists()?;
        let path = Self::config_path(dirs);
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    pub fn config_path(dirs: &AppDirs) -> PathBuf {
        dirs.config_dir().join("config.toml")
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.config_version != CURRENT_CONFIG_VERSION {
            return Err(ValidationError::UnsupportedVersion {
                found: self.config_version,
                expected: CURRENT_CONFIG_VERSION,
            });
        }
        self.bridge.validate()
    }
}

fn default_config_version() -> u32 {
    CURRENT_CONFIG_VERSION
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_max_connections() -> usize {
    8
}

fn default_max_in_flight() -> usize {
    16
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

fn default_worker_threads() -> usize {
    2
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_max_log_files() -> usize {
    7
}

fn default_stdout_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.logging.max_log_files, 7);
        assert!(config.logging.stdout);
        assert_eq!(config.logging.level, LogLevel::Info);
        assert_eq!(config.bridge.endpoint(), "127.0.0.1:8765");
        assert_eq!(config.bridge.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn invalid_version_rejected() {
        let mut config = Config::default();
        config.config_version = CURRENT_CONFIG_VERSION + 1;
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ValidationError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn zero_limits_rejected() {
        let mut config = Config::default();
        config.bridge.max_connections = 0;
        assert_eq!(
            config.validate(),
            Err(ValidationError::ZeroLimit {
                field: "max_connections"
            })
        );

        let mut config = Config::default();
        config.bridge.host = "  ".into();
        assert_eq!(config.validate(), Err(ValidationError::EmptyHost));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[bridge]
port = 9100
request_timeout_secs = 5

[logging]
level = "debug"
"#
        )
        .unwrap();

        let config = Config::load_from(file.path()).expect("config should load");
        assert_eq!(config.bridge.port, 9100);
        assert_eq!(config.bridge.request_timeout_secs, 5);
        assert_eq!(config.bridge.host, "127.0.0.1");
        assert_eq!(config.bridge.max_connections, 8);
        assert_eq!(config.logging.level, LogLevel::Debug);
    }

    #[test]
    fn invalid_file_reports_validation_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[bridge]\nmax_frame_bytes = 0").unwrap();

        let err = Config::load_from(file.path()).expect_err("zero frame size must fail");
        assert!(matches!(
            err,
            ConfigError::Validation(ValidationError::ZeroLimit {
                field: "max_frame_bytes"
            })
        ));
    }

    #[test]
    fn ipv6_endpoint_is_bracketed() {
        let bridge = BridgeConfig {
            host: "::1".into(),
            ..BridgeConfig::default()
        };
        assert_eq!(bridge.endpoint(), "[::1]:8765");
    }
}
