//! Configuration management for the relay.
//!
//! The top-level file carries a `[logging]` section and one `[modules.<name>]`
//! section per module. Module sections are kept as raw TOML nodes; each module
//! deserializes its own configuration during the load phase.

use serde::Deserialize;
use std::path::Path;

fn default_log_level() -> String {
    "info".to_string()
}

/// Application configuration loaded from TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Logging configuration settings
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Raw per-module configuration nodes, keyed by module name
    #[serde(default)]
    pub modules: toml::value::Table,
}

/// Logging configuration settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file. A missing or unreadable file is
    /// an error; there is no useful default configuration for a relay.
    pub async fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validates the configuration and returns helpful error messages.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        if self.modules.is_empty() {
            return Err("No modules configured".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn loads_logging_and_module_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
            [logging]
            level = "debug"

            [modules.irc]
            [[modules.irc.client]]
            name = "net1"

            [modules.minecraft]
            "#
        )
        .unwrap();

        let config = AppConfig::load_from_file(file.path()).await.unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.json_format);
        assert!(config.modules.contains_key("irc"));
        assert!(config.modules.contains_key("minecraft"));
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        assert!(AppConfig::load_from_file(&path).await.is_err());
    }

    #[test]
    fn bad_log_level_fails_validation() {
        let config = AppConfig {
            logging: LoggingSettings {
                level: "loud".to_string(),
                json_format: false,
            },
            modules: toml::from_str("[irc]").unwrap(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_modules_fail_validation() {
        let config = AppConfig {
            logging: LoggingSettings::default(),
            modules: toml::value::Table::new(),
        };
        assert!(config.validate().is_err());
    }
}
