use crate::{community::LouvainConfig, error::StoryError, meta_graph::MetaGraphConfig};
use serde::{Deserialize, Serialize};
use std::{
    fs::{read_to_string, write},
    path::PathBuf,
};

pub const DEFAULT_CONFIG_FILE: &str = "arstraverse.toml";
pub const DEFAULT_DATABASE: &str = "arstraverse.db";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoryConfig {
    /// SQLite file holding graphs, workspaces and stories.
    pub database: PathBuf,
    pub detection: LouvainConfig,
    pub meta_graph: MetaGraphConfig,
}

impl Default for StoryConfig {
    fn default() -> Self {
        StoryConfig {
            database: PathBuf::from(DEFAULT_DATABASE),
            detection: LouvainConfig::default(),
            meta_graph: MetaGraphConfig::default(),
        }
    }
}

impl StoryConfig {
    pub fn validate(&self) -> Result<(), StoryError> {
        self.detection.validate()?;
        if self.meta_graph.sample_member_count == 0 {
            return Err(StoryError::Config(
                "meta_graph.sample_member_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

pub trait StoryConfigProvider: Send + Sync {
    fn get_config(&self) -> Result<StoryConfig, StoryError>;
    fn set_config(&self, config: &StoryConfig) -> Result<(), StoryError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TomlConfigProvider {
    path: PathBuf,
}

impl TomlConfigProvider {
    pub fn new(path: PathBuf) -> Self {
        TomlConfigProvider { path }
    }
}

impl StoryConfigProvider for TomlConfigProvider {
    fn get_config(&self) -> Result<StoryConfig, StoryError> {
        tracing::debug!("Attempting to read config from: {:?}", &self.path);
        if !self.path.exists() {
            tracing::debug!("Config file not found, using defaults.");
            return Ok(StoryConfig::default());
        }
        let content = read_to_string(&self.path)?;
        let config: StoryConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn set_config(&self, config: &StoryConfig) -> Result<(), StoryError> {
        tracing::debug!("Attempting to write config to: {:?}", &self.path);
        config.validate()?;
        let toml_string = toml::to_string(config)?;
        write(&self.path, toml_string)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let provider = TomlConfigProvider::new(dir.path().join("none.toml"));
        assert_eq!(provider.get_config().unwrap(), StoryConfig::default());
    }

    #[test]
    fn config_survives_a_write() {
        let dir = TempDir::new().unwrap();
        let provider = TomlConfigProvider::new(dir.path().join(DEFAULT_CONFIG_FILE));
        let mut config = StoryConfig::default();
        config.meta_graph.internal_edge_cap = 5;
        config.detection.resolution = 0.5;
        provider.set_config(&config).unwrap();
        assert_eq!(provider.get_config().unwrap(), config);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "[meta_graph]\ninternal_edge_cap = 7\n").unwrap();
        let config = TomlConfigProvider::new(path).get_config().unwrap();
        assert_eq!(config.meta_graph.internal_edge_cap, 7);
        assert_eq!(config.meta_graph.sample_member_count, 10);
        assert_eq!(config.detection, LouvainConfig::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        std::fs::write(&path, "[detection]\nresolution = -1.0\n").unwrap();
        let err = TomlConfigProvider::new(path).get_config().unwrap_err();
        assert!(matches!(err, StoryError::Config(_)), "{err:?}");
    }
}
