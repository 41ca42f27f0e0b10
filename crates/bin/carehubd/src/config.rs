//! Configuration loading — TOML file with environment variable overrides.
//!
//! Looks for `carehub.toml` in the working directory. Every field has a
//! sensible default so the file is optional. Environment variables take
//! precedence over file values.

use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// State blob storage settings.
    pub storage: StorageConfig,
    /// Incoming trigger spool settings.
    pub spool: SpoolConfig,
    /// Outgoing command batch settings.
    pub outbox: OutboxConfig,
    /// Data-export delivery settings.
    pub exports: ExportsConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Where the controller blob lives.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: String,
}

/// Where the host drops trigger files.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SpoolConfig {
    pub root: String,
}

/// Where flushed command batches land.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub root: String,
}

/// Where delivered export bodies land.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ExportsConfig {
    pub root: String,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`RUST_LOG` syntax).
    pub filter: String,
}

impl Config {
    /// Load configuration from `carehub.toml` (if present) then apply
    /// environment-variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML file exists but is malformed.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::from_file("carehub.toml")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(ConfigError::Parse),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CAREHUB_STATE_DIR") {
            self.storage.root = val;
        }
        if let Ok(val) = std::env::var("CAREHUB_SPOOL_DIR") {
            self.spool.root = val;
        }
        if let Ok(val) = std::env::var("CAREHUB_OUTBOX_DIR") {
            self.outbox.root = val;
        }
        if let Ok(val) = std::env::var("CAREHUB_EXPORTS_DIR") {
            self.exports.root = val;
        }
        if let Ok(val) = std::env::var("CAREHUB_LOG") {
            self.logging.filter = val;
        }
        if let Ok(val) = std::env::var("RUST_LOG") {
            self.logging.filter = val;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, root) in [
            ("storage", &self.storage.root),
            ("spool", &self.spool.root),
            ("outbox", &self.outbox.root),
            ("exports", &self.exports.root),
        ] {
            if root.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "{name} root must not be empty"
                )));
            }
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: "data/state".to_string(),
        }
    }
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            root: "data/spool".to_string(),
        }
    }
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            root: "data/outbox".to_string(),
        }
    }
}

impl Default for ExportsConfig {
    fn default() -> Self {
        Self {
            root: "data/exports".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "carehubd=info,carehub=info".to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parse failure.
    #[error("failed to parse config file")]
    Parse(#[from] toml::de::Error),
    /// File I/O failure.
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    /// Semantic validation failure.
    #[error("invalid configuration: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_produce_sensible_defaults() {
        let config = Config::default();
        assert_eq!(config.storage.root, "data/state");
        assert_eq!(config.spool.root, "data/spool");
        assert_eq!(config.outbox.root, "data/outbox");
        assert_eq!(config.exports.root, "data/exports");
    }

    #[test]
    fn should_parse_minimal_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.storage.root, "data/state");
    }

    #[test]
    fn should_parse_full_toml() {
        let toml = "
            [storage]
            root = '/var/lib/carehub/state'

            [spool]
            root = '/var/lib/carehub/spool'

            [outbox]
            root = '/var/lib/carehub/outbox'

            [exports]
            root = '/var/lib/carehub/exports'

            [logging]
            filter = 'debug'
        ";
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.storage.root, "/var/lib/carehub/state");
        assert_eq!(config.spool.root, "/var/lib/carehub/spool");
        assert_eq!(config.outbox.root, "/var/lib/carehub/outbox");
        assert_eq!(config.exports.root, "/var/lib/carehub/exports");
        assert_eq!(config.logging.filter, "debug");
    }

    #[test]
    fn should_parse_partial_toml_with_defaults() {
        let toml = "
            [storage]
            root = 'elsewhere'
        ";
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.storage.root, "elsewhere");
        assert_eq!(config.spool.root, "data/spool");
    }

    #[test]
    fn should_return_default_when_file_not_found() {
        let config = Config::from_file("nonexistent.toml").unwrap();
        assert_eq!(config.storage.root, "data/state");
    }

    #[test]
    fn should_reject_empty_storage_root() {
        let mut config = Config::default();
        config.storage.root = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn should_accept_default_configuration() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn should_report_parse_error_for_invalid_toml() {
        let result: Result<Config, _> = toml::from_str("invalid {{{");
        assert!(result.is_err());
    }
}
