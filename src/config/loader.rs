use super::types::SentinelConfig;
use anyhow::{Context, Result};
use config::{Config, Environment, File};

/// Configuration loader with builder pattern
///
/// Layers: built-in defaults → configuration file → `SENTINEL_*` environment variables.
pub struct ConfigLoader {
    config_file: Option<String>,
    load_env: bool,
    env_prefix: String,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            config_file: None,
            load_env: false,
            env_prefix: "SENTINEL".to_string(),
        }
    }

    /// Load configuration from file
    pub fn load_from_file(mut self, path: Option<&str>) -> Self {
        self.config_file = path.map(String::from);
        self
    }

    /// Load configuration from environment variables
    pub fn load_from_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    /// Override the environment variable prefix
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = prefix.to_string();
        self
    }

    /// Build the final configuration
    pub fn build(self) -> Result<SentinelConfig> {
        let mut builder =
            Config::builder().add_source(Config::try_from(&SentinelConfig::default())?);

        if let Some(config_path) = &self.config_file {
            builder = builder.add_source(File::with_name(config_path).required(true));
        } else {
            // Try to load from standard locations
            builder = builder
                .add_source(File::with_name("plugin-sentinel").required(false))
                .add_source(File::with_name("config/plugin-sentinel").required(false));
        }

        if self.load_env {
            builder = builder.add_source(
                Environment::with_prefix(&self.env_prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: SentinelConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config
            .validate()
            .context("Configuration failed validation")?;

        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
