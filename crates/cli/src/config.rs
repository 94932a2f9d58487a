use std::path::{Path, PathBuf};

use anyhow::Context;
use maintenance::RetentionPolicy;
use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub retention: RetentionPolicy,
    pub milestones: MilestoneConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: Option<PathBuf>,
    pub legacy_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct MilestoneConfig {
    pub log: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl Config {
    pub fn default_path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        config_dir.join("focus").join("config.toml")
    }

    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config_path = path.map_or_else(Self::default_path, Path::to_path_buf);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read config file at {}", config_path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("failed to parse config file {}", config_path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.retention.max_sessions, 100);
        assert!(!config.milestones.log);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.logging.filter, "info");
        assert!(config.storage.db_path.is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [storage]
            db_path = "/tmp/focus.db"

            [retention]
            max_sessions = 20

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.db_path, Some(PathBuf::from("/tmp/focus.db")));
        assert!(config.storage.legacy_path.is_none());
        assert_eq!(config.retention.max_sessions, 20);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.retention.max_sessions, 100);
    }

    #[test]
    fn bad_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "retention = [").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}
