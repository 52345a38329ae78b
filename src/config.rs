//! Configuration loading and types for depositstore.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! service: networking, the upload staging tree, reassembly bookkeeping,
//! logging, and observability.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Upload staging tree settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Chunk reassembly settings.
    #[serde(default)]
    pub upload: UploadConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings (metrics).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Maximum request body size in bytes for a single chunk request.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
            max_chunk_size: default_max_chunk_size(),
        }
    }
}

/// Upload staging tree configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory under which every submission directory lives.
    #[serde(default = "default_upload_root")]
    pub upload_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_root: default_upload_root(),
        }
    }
}

/// Chunk reassembly configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// How long a finished assembly is remembered so that a duplicate
    /// delivery of its final chunk is answered without re-staging it.
    #[serde(default = "default_completion_memory_secs")]
    pub completion_memory_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            completion_memory_secs: default_completion_memory_secs(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
///
/// Controls Prometheus metrics collection. Enabled by default.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9020
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_chunk_size() -> usize {
    64 * 1024 * 1024 // 64 MiB
}

fn default_upload_root() -> PathBuf {
    PathBuf::from("./data/uploads")
}

fn default_completion_memory_secs() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_config(&contents)
}

/// Parse configuration from YAML text.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = parse_config("{}").unwrap();
        assert_eq!(config.server.port, 9020);
        assert_eq!(config.storage.upload_root, PathBuf::from("./data/uploads"));
        assert_eq!(config.upload.completion_memory_secs, 300);
        assert_eq!(config.logging.format, "text");
        assert!(config.observability.metrics);
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let yaml = r#"
server:
  port: 8080
storage:
  upload_root: /srv/deposit/uploads
logging:
  format: json
"#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.max_chunk_size, 64 * 1024 * 1024);
        assert_eq!(
            config.storage.upload_root,
            PathBuf::from("/srv/deposit/uploads")
        );
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_yaml_is_error() {
        assert!(parse_config("server: [unclosed").is_err());
    }
}
