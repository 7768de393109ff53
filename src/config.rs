use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

const HISTORY_ENV: &str = "SAVE_HISTORY";
const CONFIG_ENV: &str = "SAVE_CONFIG";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub execution: ExecutionConfig,
    pub display: DisplayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StorageConfig {
    // Defaults to ~/.save_history.json
    pub history_path: Option<PathBuf>,
    // Defaults to a `backups` directory next to the history file
    pub backup_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ExecutionConfig {
    pub shell: String,
    pub step_timeout_secs: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            step_timeout_secs: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DisplayConfig {
    pub language: String,
    pub list_limit: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            language: "auto".to_string(),
            list_limit: 10,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

impl Config {
    /// Loads the config file, writing the defaults on first run.
    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_path();

        if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read config file {}", config_path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("invalid config file {}", config_path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path();
        if let Some(config_dir) = config_path.parent() {
            fs::create_dir_all(config_dir)
                .with_context(|| format!("failed to create {}", config_dir.display()))?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&config_path, content)
            .with_context(|| format!("failed to write config file {}", config_path.display()))?;
        Ok(())
    }

    pub fn get_config_path() -> PathBuf {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => home_dir().join(".save").join("config.toml"),
        }
    }

    /// Store location: `SAVE_HISTORY`, then the config file, then `~/.save_history.json`.
    pub fn history_path(&self) -> PathBuf {
        match std::env::var_os(HISTORY_ENV) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => self
                .storage
                .history_path
                .clone()
                .unwrap_or_else(|| home_dir().join(".save_history.json")),
        }
    }

    pub fn backup_dir(&self) -> PathBuf {
        if let Some(dir) = &self.storage.backup_dir {
            return dir.clone();
        }
        let history = self.history_path();
        history
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.join("backups"))
            .unwrap_or_else(|| PathBuf::from("backups"))
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.execution
            .step_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn get_effective_language(&self) -> String {
        if self.display.language == "auto" {
            std::env::var("LANG")
                .unwrap_or_else(|_| "en_US".to_string())
                .split('.')
                .next()
                .unwrap_or("en")
                .to_string()
        } else {
            self.display.language.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.execution.shell, "sh");
        assert_eq!(config.display.list_limit, 10);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.step_timeout(), None);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [storage]
            history_path = "/tmp/hist/save.json"

            [execution]
            step_timeout_secs = 30

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.history_path, Some(PathBuf::from("/tmp/hist/save.json")));
        assert_eq!(config.storage.backup_dir, None);
        assert_eq!(config.execution.shell, "sh");
        assert_eq!(config.step_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn explicit_language_wins() {
        let mut config = Config::default();
        config.display.language = "zh".to_string();
        assert_eq!(config.get_effective_language(), "zh");
    }

    #[test]
    fn explicit_backup_dir_wins() {
        let mut config = Config::default();
        config.storage.backup_dir = Some(PathBuf::from("/var/backups/save"));
        assert_eq!(config.backup_dir(), PathBuf::from("/var/backups/save"));
    }
}
