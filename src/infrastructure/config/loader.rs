use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use super::WorkerConfig;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid temporal address: {0}")]
    InvalidTemporalAddress(String),

    #[error("sandbox base_dir cannot be empty")]
    EmptySandboxBaseDir,

    #[error("invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("configuration is incomplete and REQUIRE_CONFIG is set: {0}")]
    Incomplete(String),
}

/// Configuration loader with hierarchical merging (SPEC_FULL.md §2).
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults.
    /// 2. `fleetlift.yaml` (project config).
    /// 3. Environment variables (`FLEETLIFT_` prefix, highest priority).
    ///
    /// When `REQUIRE_CONFIG` is set and the project YAML file is missing,
    /// `load` fails startup rather than silently falling back to
    /// defaults (§6.4).
    pub fn load() -> Result<WorkerConfig> {
        let require_config = std::env::var("REQUIRE_CONFIG")
            .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(false);

        if require_config && !std::path::Path::new("fleetlift.yaml").exists() {
            anyhow::bail!(ConfigError::Incomplete(
                "fleetlift.yaml not found".to_string()
            ));
        }

        let config: WorkerConfig = Figment::new()
            .merge(Serialized::defaults(WorkerConfig::default()))
            .merge(Yaml::file("fleetlift.yaml"))
            .merge(Env::prefixed("FLEETLIFT_").split("__"))
            .extract()
            .context("failed to extract worker configuration")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file, bypassing project
    /// discovery (used by tests and the `fleetlift-worker run` smoke
    /// command).
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<WorkerConfig> {
        let config: WorkerConfig = Figment::new()
            .merge(Serialized::defaults(WorkerConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("FLEETLIFT_").split("__"))
            .extract()
            .with_context(|| format!("failed to load config from {}", path.as_ref().display()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &WorkerConfig) -> Result<(), ConfigError> {
        if config.temporal.address.trim().is_empty() {
            return Err(ConfigError::InvalidTemporalAddress(
                config.temporal.address.clone(),
            ));
        }
        if config.sandbox.base_dir.trim().is_empty() {
            return Err(ConfigError::EmptySandboxBaseDir);
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = WorkerConfig::default();
        assert_eq!(config.temporal.address, "localhost:7233");
        ConfigLoader::validate(&config).expect("default config should be valid");
    }

    #[test]
    fn yaml_overrides_defaults() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "temporal:\n  address: \"temporal.internal:7233\"\nsandbox:\n  base_dir: /var/lib/fleetlift\n"
        )
        .unwrap();
        file.flush().unwrap();

        let config = ConfigLoader::load_from_file(file.path()).unwrap();
        assert_eq!(config.temporal.address, "temporal.internal:7233");
        assert_eq!(config.sandbox.base_dir, "/var/lib/fleetlift");
    }

    #[test]
    fn rejects_invalid_log_level() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "logging:\n  level: bogus\n").unwrap();
        file.flush().unwrap();

        let result = ConfigLoader::load_from_file(file.path());
        assert!(result.is_err());
    }
}
