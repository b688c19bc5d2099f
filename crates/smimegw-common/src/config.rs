//! Configuration for smimegw

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Processing backend configuration
    #[serde(default)]
    pub backend: BackendConfig,

    /// S/MIME decryption policy
    #[serde(default)]
    pub smime: SmimeConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backend (pipeline) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Pipe-delimited stage names, outermost first
    #[serde(default = "default_save_process")]
    pub save_process: String,

    /// Maximum number of tasks running through the chain at once
    #[serde(default = "default_save_workers_size")]
    pub save_workers_size: usize,

    /// Directory holding recipient decryption keys
    pub decryption_key_path: Option<PathBuf>,

    /// Log every received envelope from the Debugger stage
    #[serde(default)]
    pub log_received_mails: bool,

    /// Host name used in the Received header
    #[serde(default = "default_primary_mail_host")]
    pub primary_mail_host: String,

    /// Deadline for a single task run, in seconds (0 disables it)
    #[serde(default = "default_transaction_timeout")]
    pub transaction_timeout_secs: u64,

    /// Settings for custom stages
    #[serde(flatten)]
    pub extra: HashMap<String, toml::Value>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            save_process: default_save_process(),
            save_workers_size: default_save_workers_size(),
            decryption_key_path: None,
            log_received_mails: false,
            primary_mail_host: default_primary_mail_host(),
            transaction_timeout_secs: default_transaction_timeout(),
            extra: HashMap::new(),
        }
    }
}

fn default_save_process() -> String {
    "HeadersParser|Header|Hasher|Decrypt".to_string()
}

fn default_save_workers_size() -> usize {
    3
}

fn default_primary_mail_host() -> String {
    "localhost".to_string()
}

fn default_transaction_timeout() -> u64 {
    60
}

impl BackendConfig {
    /// Stage names from `save_process`, in processing order
    pub fn stage_names(&self) -> Vec<String> {
        self.save_process
            .split('|')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Look up a custom stage setting as a string
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }
}

/// Which envelope recipient is tried first when several hold keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipientSelection {
    /// Envelope order
    #[default]
    FirstMatch,
    /// Recipients whose certificate names a recipient info go first
    BestMatch,
}

/// S/MIME decryption policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmimeConfig {
    /// Recipient tie-break
    #[serde(default)]
    pub recipient_selection: RecipientSelection,

    /// Reply code when no recipient key is available
    #[serde(default = "default_no_matching_recipient_code")]
    pub no_matching_recipient_code: u16,

    /// Reply code when the enveloped data fails to decrypt
    #[serde(default = "default_decryption_failure_code")]
    pub decryption_failure_code: u16,

    /// Refuse content algorithms without an integrity tag (AES-CBC).
    /// A modified CBC ciphertext can decrypt to altered plaintext with
    /// valid padding, so only AES-GCM content is integrity checked.
    #[serde(default = "default_require_authenticated_content")]
    pub require_authenticated_content: bool,
}

impl Default for SmimeConfig {
    fn default() -> Self {
        Self {
            recipient_selection: RecipientSelection::default(),
            no_matching_recipient_code: default_no_matching_recipient_code(),
            decryption_failure_code: default_decryption_failure_code(),
            require_authenticated_content: default_require_authenticated_content(),
        }
    }
}

fn default_no_matching_recipient_code() -> u16 {
    550
}

fn default_decryption_failure_code() -> u16 {
    554
}

fn default_require_authenticated_content() -> bool {
    true
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

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML document and validate it
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the default locations
    pub fn load() -> crate::Result<Self> {
        let paths = [
            PathBuf::from("./smimegw.toml"),
            PathBuf::from("./config.toml"),
            PathBuf::from("/etc/smimegw/config.toml"),
        ];

        for path in paths {
            if path.exists() {
                tracing::debug!(path = %path.display(), "Loading configuration");
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> crate::Result<()> {
        if self.backend.stage_names().is_empty() {
            return Err(crate::Error::Config(
                "backend.save_process names no stages".to_string(),
            ));
        }

        if self.backend.save_workers_size == 0 {
            return Err(crate::Error::Config(
                "backend.save_workers_size must be at least 1".to_string(),
            ));
        }

        for (name, code) in [
            ("no_matching_recipient_code", self.smime.no_matching_recipient_code),
            ("decryption_failure_code", self.smime.decryption_failure_code),
        ] {
            if !(400..600).contains(&code) {
                return Err(crate::Error::Config(format!(
                    "smime.{} must be a 4xx or 5xx reply code, got {}",
                    name, code
                )));
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(crate::Error::Config(format!(
                "logging.format must be \"json\" or \"text\", got {:?}",
                other
            ))),
        }
    }
}
