//! Configuration for Mailflow

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// SMTP configuration
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Spool configuration
    #[serde(default)]
    pub spool: SpoolConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Processing pipeline configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname used in the SMTP banner and bounce notices
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

/// SMTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Bind host
    #[serde(default = "default_smtp_host")]
    pub host: String,

    /// SMTP port (inbound)
    #[serde(default = "default_smtp_port")]
    pub port: u16,

    /// Maximum message size in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum recipients per message
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,

    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            max_message_size: default_max_message_size(),
            max_recipients: default_max_recipients(),
            max_connections: default_max_connections(),
        }
    }
}

fn default_smtp_host() -> String {
    "0.0.0.0".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

fn default_max_message_size() -> usize {
    25 * 1024 * 1024 // 25 MB
}

fn default_max_recipients() -> usize {
    100
}

fn default_max_connections() -> usize {
    100
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base path for local filesystem storage
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/var/lib/mailflow/mail")
}

/// Spool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolConfig {
    /// Number of worker tasks pulling messages off the inbound queue
    #[serde(default = "default_spool_workers")]
    pub workers: usize,
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            workers: default_spool_workers(),
        }
    }
}

fn default_spool_workers() -> usize {
    4
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
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

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Processing pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum stage-to-stage transitions for a single message; 0 disables
    /// the budget
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,

    /// Stage declarations, in configuration order
    #[serde(default, rename = "stage")]
    pub stages: Vec<StageConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_hops: default_max_hops(),
            stages: Vec::new(),
        }
    }
}

fn default_max_hops() -> u32 {
    100
}

/// A single named stage and its ordered steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Stage name; must be unique across the pipeline
    pub name: String,

    /// Ordered step declarations
    #[serde(default, rename = "step")]
    pub steps: Vec<StepConfig>,
}

/// One (matcher, mailet) step declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Mailet name, resolved through the plugin registry
    pub mailet: String,

    /// Matcher specification, e.g. "All" or "RecipientIs=admin@example.com".
    /// Mutually exclusive with `notmatch`; defaults to "All".
    #[serde(default, rename = "match")]
    pub matcher: Option<String>,

    /// Inverted matcher specification, mutually exclusive with `match`
    #[serde(default, rename = "notmatch")]
    pub not_matcher: Option<String>,

    /// What to do when the matcher itself fails:
    /// "error" (deny), "decline" (treat as no match) or a stage name.
    /// Defaults to "error".
    #[serde(default, rename = "on-match-exception")]
    pub on_match_exception: Option<String>,

    /// Opaque mailet configuration
    #[serde(default)]
    pub config: HashMap<String, String>,
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load() -> crate::Result<Self> {
        let paths = [
            std::path::PathBuf::from("./mailflow.toml"),
            std::path::PathBuf::from("./config.toml"),
            std::path::PathBuf::from("/etc/mailflow/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }
}
