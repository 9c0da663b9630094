//! Export configuration using Figment
//!
//! Configuration is layered from, in increasing priority:
//! 1. Built-in defaults
//! 2. An optional TOML file
//! 3. Environment variables prefixed with `SPECFILE_`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! SPECFILE_FILE_PREFIX="{start[scan_id]}-"
//! SPECFILE_DEFAULT_PRECISION=4
//! SPECFILE_LOG_LEVEL=debug
//! ```

use crate::document::PRIMARY_STREAM;
use crate::error::{SpecError, SpecResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "SPECFILE_";

/// Largest decimal-place count a data column may request.
pub const MAX_PRECISION: usize = 17;

/// Settings for a SPEC file export session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Template for the output file name, resolved against the first run start
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
    /// Stream whose events become data lines
    #[serde(default = "default_stream_name")]
    pub stream_name: String,
    /// Decimal places for number columns whose data key has no precision
    #[serde(default = "default_precision")]
    pub default_precision: usize,
    /// Owner written to the `#C` line when the run start has none
    #[serde(default = "default_owner")]
    pub owner: String,
    /// Logging level used by the command-line front end
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_file_prefix() -> String {
    "{start[uid]}-".to_string()
}

fn default_stream_name() -> String {
    PRIMARY_STREAM.to_string()
}

fn default_precision() -> usize {
    6
}

fn default_owner() -> String {
    "unknown".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            file_prefix: default_file_prefix(),
            stream_name: default_stream_name(),
            default_precision: default_precision(),
            owner: default_owner(),
            log_level: default_log_level(),
        }
    }
}

impl ExportConfig {
    /// Load defaults merged with environment overrides.
    pub fn load() -> SpecResult<Self> {
        Self::from_figment(Self::figment())
    }

    /// Load defaults, then `path`, then environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> SpecResult<Self> {
        let figment = Figment::from(Serialized::defaults(ExportConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX));
        Self::from_figment(figment)
    }

    /// The default provider stack, exposed so callers can add their own layers.
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(ExportConfig::default())).merge(Env::prefixed(ENV_PREFIX))
    }

    /// Extract and validate a configuration from any figment.
    pub fn from_figment(figment: Figment) -> SpecResult<Self> {
        let config: ExportConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate values that parse but make no sense.
    pub fn validate(&self) -> SpecResult<()> {
        if self.file_prefix.trim().is_empty() {
            return Err(SpecError::Configuration(
                "file_prefix cannot be empty".to_string(),
            ));
        }
        if self.stream_name.trim().is_empty() {
            return Err(SpecError::Configuration(
                "stream_name cannot be empty".to_string(),
            ));
        }
        if self.default_precision > MAX_PRECISION {
            return Err(SpecError::Configuration(format!(
                "default_precision {} exceeds maximum of {MAX_PRECISION}",
                self.default_precision
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_defaults_are_valid() {
        let config = ExportConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.file_prefix, "{start[uid]}-");
        assert_eq!(config.stream_name, "primary");
    }

    #[test]
    fn test_toml_and_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "specfile.toml",
                r#"
                file_prefix = "{start[scan_id]}"
                default_precision = 3
                owner = "beamline"
                "#,
            )?;
            jail.set_env("SPECFILE_DEFAULT_PRECISION", "4");

            let config = ExportConfig::load_from("specfile.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.file_prefix, "{start[scan_id]}");
            assert_eq!(config.default_precision, 4);
            assert_eq!(config.owner, "beamline");
            assert_eq!(config.stream_name, "primary");
            Ok(())
        });
    }

    #[test]
    fn test_validation_rejects_bad_precision() {
        let config = ExportConfig {
            default_precision: 40,
            ..ExportConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SpecError::Configuration(_))
        ));
    }
}
