use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_PATH_ENV: &str = "TASKFLOW_CONFIG";
pub const DATA_DIR_ENV: &str = "TASKFLOW_DATA_DIR";
pub const BIND_ADDR_ENV: &str = "TASKFLOW_BIND";

const MIB: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackerConfig {
    pub data_dir: PathBuf,
    pub bind_addr: String,
    /// Defaults to `<data_dir>/logs`.
    pub log_dir: Option<PathBuf>,
    pub default_page_size: usize,
    pub max_page_size: usize,
    pub max_request_bytes: usize,
    pub max_file_bytes: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            bind_addr: "127.0.0.1:8080".to_string(),
            log_dir: None,
            default_page_size: 10,
            max_page_size: 100,
            max_request_bytes: 64 * MIB,
            max_file_bytes: 20 * MIB,
        }
    }
}

impl TrackerConfig {
    /// Reads the process environment.
    pub fn load() -> AppResult<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Optional JSON file first, then the single-value overrides, then validation.
    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let mut config = match lookup(CONFIG_PATH_ENV).filter(|value| !value.trim().is_empty()) {
            Some(path) => Self::from_file(Path::new(path.trim()))?,
            None => Self::default(),
        };

        if let Some(data_dir) = lookup(DATA_DIR_ENV).filter(|value| !value.trim().is_empty()) {
            config.data_dir = PathBuf::from(data_dir.trim());
        }
        if let Some(bind_addr) = lookup(BIND_ADDR_ENV).filter(|value| !value.trim().is_empty()) {
            config.bind_addr = bind_addr.trim().to_string();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            AppError::Validation(format!("Unable to read config {}: {}", path.display(), error))
        })?;
        serde_json::from_str(&raw).map_err(|error| {
            AppError::Validation(format!("Invalid config {}: {}", path.display(), error))
        })
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(AppError::Validation("dataDir must not be empty".to_string()));
        }
        if self.bind_addr.trim().is_empty() {
            return Err(AppError::Validation("bindAddr must not be empty".to_string()));
        }
        if self.max_page_size == 0 {
            return Err(AppError::Validation("maxPageSize must be at least 1".to_string()));
        }
        if self.default_page_size == 0 || self.default_page_size > self.max_page_size {
            return Err(AppError::Validation(format!(
                "defaultPageSize must be between 1 and {}",
                self.max_page_size
            )));
        }
        if self.max_file_bytes == 0 || self.max_file_bytes > self.max_request_bytes {
            return Err(AppError::Validation(
                "maxFileBytes must be positive and no larger than maxRequestBytes".to_string(),
            ));
        }
        Ok(())
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.data_dir.join("tasks.json")
    }

    pub fn categories_path(&self) -> PathBuf {
        self.data_dir.join("categories.json")
    }

    pub fn task_uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn category_uploads_dir(&self) -> PathBuf {
        self.data_dir.join("category_uploads")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| self.data_dir.join("logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, String)]) -> impl Fn(&str) -> Option<String> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect();
        move |key| values.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_environment() {
        let config = TrackerConfig::load_with(env(&[])).expect("config");
        assert_eq!(config, TrackerConfig::default());
        assert_eq!(config.tasks_path(), PathBuf::from("data").join("tasks.json"));
        assert_eq!(config.log_dir(), PathBuf::from("data").join("logs"));
    }

    #[test]
    fn file_values_are_overridden_by_env() {
        let root = tempfile::tempdir().expect("temp dir");
        let path = root.path().join("taskflow.json");
        std::fs::write(&path, r#"{"dataDir": "/srv/tasks", "maxPageSize": 40, "defaultPageSize": 20}"#)
            .expect("write config");

        let config = TrackerConfig::load_with(env(&[
            (CONFIG_PATH_ENV, path.to_string_lossy().to_string()),
            (BIND_ADDR_ENV, "0.0.0.0:9000".to_string()),
        ]))
        .expect("config");
        assert_eq!(config.data_dir, PathBuf::from("/srv/tasks"));
        assert_eq!(config.max_page_size, 40);
        assert_eq!(config.default_page_size, 20);
        assert_eq!(config.bind_addr, "0.0.0.0:9000");

        let overridden = TrackerConfig::load_with(env(&[
            (CONFIG_PATH_ENV, path.to_string_lossy().to_string()),
            (DATA_DIR_ENV, "/tmp/elsewhere".to_string()),
        ]))
        .expect("config");
        assert_eq!(overridden.data_dir, PathBuf::from("/tmp/elsewhere"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let config = TrackerConfig {
            default_page_size: 500,
            ..TrackerConfig::default()
        };
        assert!(matches!(config.validate(), Err(AppError::Validation(_))));

        let config = TrackerConfig {
            max_file_bytes: 0,
            ..TrackerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unreadable_config_file_is_an_error() {
        let root = tempfile::tempdir().expect("temp dir");
        let missing = root.path().join("absent.json");
        let result = TrackerConfig::load_with(env(&[(CONFIG_PATH_ENV, missing.to_string_lossy().to_string())]));
        assert!(matches!(result, Err(AppError::Validation(_))));
    }
}
