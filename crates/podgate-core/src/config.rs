//! Configuration management.
//!
//! podgate configuration is loaded from multiple sources with the following priority:
//!
//! 1. Environment variables (`PODGATE_*`)
//! 2. User configuration file (`~/.config/podgate/config.toml`)
//! 3. System configuration file (`/etc/podgate/config.toml`)
//! 4. Default values
//!
//! ## Example Configuration File
//!
//! ```toml
//! [service]
//! socket_path = "/run/podgate/podgate.sock"
//! idle_timeout_secs = 5
//! header_read_timeout_secs = 5
//! read_timeout_secs = 5
//! write_timeout_secs = 3600
//! stream_buffer = 0
//!
//! [logging]
//! level = "info"
//! format = "text"
//! ```

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// podgate configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// API service configuration.
    pub service: ServiceConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads configuration from files and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source cannot be parsed.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(system_config_path()))
            .merge(Toml::file(user_config_path()))
            .merge(Env::prefixed("PODGATE_").split("__"))
            .extract()
    }

    /// Loads configuration from a specific file, still honouring the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("PODGATE_").split("__"))
            .extract()
    }
}

/// API service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Unix socket the service binds when neither a URI nor socket
    /// activation is given.
    pub socket_path: PathBuf,
    /// Seconds of inactivity before the service exits. `0` serves forever.
    pub idle_timeout_secs: u64,
    /// Seconds allowed for a client to send the request head.
    pub header_read_timeout_secs: u64,
    /// Seconds allowed for reading a request body.
    pub read_timeout_secs: u64,
    /// Seconds in-flight responses may keep streaming once a graceful
    /// shutdown has started.
    pub write_timeout_secs: u64,
    /// Capacity of the channel behind each streaming bridge.
    pub stream_buffer: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            idle_timeout_secs: 5,
            header_read_timeout_secs: 5,
            read_timeout_secs: 5,
            write_timeout_secs: 3600,
            stream_buffer: 0,
        }
    }
}

impl ServiceConfig {
    /// Idle-shutdown window. Zero disables idle shutdown.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Request head timeout.
    #[must_use]
    pub const fn header_read_timeout(&self) -> Duration {
        Duration::from_secs(self.header_read_timeout_secs)
    }

    /// Request body timeout.
    #[must_use]
    pub const fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Graceful drain budget.
    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Log format (text, json).
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    if is_root() {
        return PathBuf::from("/run/podgate/podgate.sock");
    }
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("podgate")
        .join("podgate.sock")
}

fn is_root() -> bool {
    std::env::var("USER").is_ok_and(|user| user == "root")
}

fn user_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("podgate")
        .join("config.toml")
}

fn system_config_path() -> PathBuf {
    PathBuf::from("/etc/podgate/config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service.idle_timeout(), Duration::from_secs(5));
        assert_eq!(config.service.write_timeout(), Duration::from_secs(3600));
        assert_eq!(config.service.stream_buffer, 0);
        assert_eq!(config.logging.level, "info");
        assert!(config.service.socket_path.ends_with("podgate.sock"));
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[service]\nidle_timeout_secs = 0\nstream_buffer = 4\n\n[logging]\nformat = \"json\""
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.service.idle_timeout(), Duration::ZERO);
        assert_eq!(config.service.stream_buffer, 4);
        assert_eq!(config.service.header_read_timeout_secs, 5);
        assert_eq!(config.logging.format, "json");
    }
}
