use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::codec::Codec;
use crate::history::MAX_STABLE_AGE_SECS;
use crate::layout::Layout;
use crate::model::ProjectType;

/// Deployment configuration loaded from `~/.config/wt/config.toml`.
///
/// Every section falls back to its defaults, so a partial file is enough.
/// `WT_*` environment variables override file values (see
/// [`Config::apply_env_overrides`]).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub projects: ProjectsConfig,
}

impl Config {
    /// Load config from the default path, falling back to defaults when the
    /// file does not exist. Environment overrides are applied in both cases.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        let mut cfg = if path.exists() {
            Self::parse_file(&path)?
        } else {
            Config::default()
        };
        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path: PathBuf = path.into();
        let mut cfg = Self::parse_file(&path)?;
        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn parse_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `WT_*` overrides. `lookup` is injected so tests don't touch the
    /// process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, raw: String) -> Result<T, ConfigError>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::Parse(format!("{key}={raw:?}: {e}")))
        }

        if let Some(v) = lookup("WT_PROJECT_ROOT") {
            self.storage.project_root = v;
        }
        if let Some(v) = lookup("WT_STORAGE_FORMAT") {
            self.storage.storage_format = parsed("WT_STORAGE_FORMAT", v)?;
        }
        if let Some(v) = lookup("WT_DATA_FORMAT") {
            self.storage.data_format = parsed("WT_DATA_FORMAT", v)?;
        }
        if let Some(v) = lookup("WT_LANGUAGE_FILE_SIZE") {
            self.storage.language_file_size = parsed("WT_LANGUAGE_FILE_SIZE", v)?;
        }
        if let Some(v) = lookup("WT_NUM_BACKUP_FILES") {
            self.storage.num_backup_files = parsed("WT_NUM_BACKUP_FILES", v)?;
        }
        if let Some(v) = lookup("WT_PROJECT_CACHE") {
            self.cache.project_cache = parsed("WT_PROJECT_CACHE", v)?;
        }
        if let Some(v) = lookup("WT_MAX_NUM_CHANGES") {
            self.history.max_num_changes = parsed("WT_MAX_NUM_CHANGES", v)?;
        }
        if let Some(v) = lookup("WT_MIN_NUM_CHANGES") {
            self.history.min_num_changes = parsed("WT_MIN_NUM_CHANGES", v)?;
        }
        if let Some(v) = lookup("WT_CHANGE_STABLE_AGE") {
            self.history.change_stable_age = parsed("WT_CHANGE_STABLE_AGE", v)?;
        }
        Ok(())
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.general.validate()?;
        self.storage.validate()?;
        self.cache.validate()?;
        self.history.validate()?;
        self.projects.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("wt")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl GeneralConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::Validation(
                "general.log_level must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_project_root")]
    pub project_root: String,
    #[serde(default)]
    pub storage_format: Layout,
    #[serde(default)]
    pub data_format: Codec,
    /// Encoded fragments larger than this many bytes are rejected.
    #[serde(default = "default_language_file_size")]
    pub language_file_size: usize,
    #[serde(default = "default_num_backup_files")]
    pub num_backup_files: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            project_root: default_project_root(),
            storage_format: Layout::default(),
            data_format: Codec::default(),
            language_file_size: default_language_file_size(),
            num_backup_files: default_num_backup_files(),
        }
    }
}

impl StorageConfig {
    /// Project root with a leading `~/` expanded to the home directory.
    pub fn project_root_path(&self) -> PathBuf {
        match self.project_root.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(rest),
            None => PathBuf::from(&self.project_root),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.project_root.trim().is_empty() {
            return Err(ConfigError::Validation(
                "storage.project_root must not be empty".to_string(),
            ));
        }
        if self.language_file_size == 0 {
            return Err(ConfigError::Validation(
                "storage.language_file_size must be positive".to_string(),
            ));
        }
        if self.num_backup_files > 100 {
            return Err(ConfigError::Validation(format!(
                "storage.num_backup_files {} exceeds 100",
                self.num_backup_files
            )));
        }
        Ok(())
    }
}

fn default_project_root() -> String {
    "./projects".into()
}
fn default_language_file_size() -> usize {
    100_000
}
fn default_num_backup_files() -> usize {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of projects kept resident.
    #[serde(default = "default_project_cache")]
    pub project_cache: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            project_cache: default_project_cache(),
        }
    }
}

impl CacheConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.project_cache == 0 {
            return Err(ConfigError::Validation(
                "cache.project_cache must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_project_cache() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_max_num_changes")]
    pub max_num_changes: usize,
    /// Values `<= 0` make every aged entry stable after its first edit.
    #[serde(default = "default_min_num_changes")]
    pub min_num_changes: i64,
    /// Seconds.
    #[serde(default = "default_change_stable_age")]
    pub change_stable_age: i64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_num_changes: default_max_num_changes(),
            min_num_changes: default_min_num_changes(),
            change_stable_age: default_change_stable_age(),
        }
    }
}

impl HistoryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_num_changes == 0 {
            return Err(ConfigError::Validation(
                "history.max_num_changes must be at least 1".to_string(),
            ));
        }
        if !(0..=MAX_STABLE_AGE_SECS).contains(&self.change_stable_age) {
            return Err(ConfigError::Validation(format!(
                "history.change_stable_age must be within 0..={}",
                MAX_STABLE_AGE_SECS
            )));
        }
        Ok(())
    }
}

fn default_max_num_changes() -> usize {
    5
}
fn default_min_num_changes() -> i64 {
    2
}
fn default_change_stable_age() -> i64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectsConfig {
    /// Project types that may be created.
    #[serde(default = "default_project_types")]
    pub project_types: Vec<ProjectType>,
}

impl Default for ProjectsConfig {
    fn default() -> Self {
        Self {
            project_types: default_project_types(),
        }
    }
}

impl ProjectsConfig {
    pub fn is_allowed(&self, project_type: ProjectType) -> bool {
        self.project_types.contains(&project_type)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.project_types.is_empty() {
            return Err(ConfigError::Validation(
                "projects.project_types must not be empty".to_string(),
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for t in &self.project_types {
            if !seen.insert(*t) {
                return Err(ConfigError::Validation(format!(
                    "projects.project_types contains duplicate '{}'",
                    t
                )));
            }
        }
        Ok(())
    }
}

fn default_project_types() -> Vec<ProjectType> {
    vec![ProjectType::NewGrf, ProjectType::GameScript]
}
