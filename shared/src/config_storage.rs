//! Configuration storage for the observatory.
//!
//! Provides centralized storage for the device/execution config and for
//! captured protocol recordings. All config is stored in ~/.seestar_config/
//! by default.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::observatory_config::ObservatoryConfig;

/// Errors loading or saving stored configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Configuration storage manager.
///
/// Manages loading and saving of the observatory config and recordings
/// from a centralized directory (defaults to ~/.seestar_config/).
#[derive(Debug, Clone)]
pub struct ConfigStorage {
    /// Root directory for all configuration (e.g., ~/.seestar_config)
    root_path: PathBuf,
}

impl ConfigStorage {
    /// Create a new config storage with default path (~/.seestar_config)
    pub fn new() -> std::io::Result<Self> {
        let home = std::env::var("HOME")
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotFound, "HOME not set"))?;
        let root_path = PathBuf::from(home).join(".seestar_config");
        Ok(Self { root_path })
    }

    /// Create a new config storage with custom root path
    pub fn with_path(root_path: PathBuf) -> Self {
        Self { root_path }
    }

    /// Get the root configuration path
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    // =========================================================================
    // Observatory config
    // =========================================================================

    fn observatory_config_path(&self) -> PathBuf {
        self.root_path.join("observatory.json")
    }

    /// Get the observatory config.
    ///
    /// Returns None if no config file exists.
    /// Returns Some(Err) if the file exists but cannot be loaded.
    pub fn get_observatory_config(&self) -> Option<Result<ObservatoryConfig, ConfigError>> {
        let path = self.observatory_config_path();

        if !path.exists() {
            return None;
        }

        Some(load_json(&path))
    }

    /// Load the observatory config, falling back to defaults when absent.
    pub fn load_observatory_config_or_default(&self) -> Result<ObservatoryConfig, ConfigError> {
        self.get_observatory_config().unwrap_or_else(|| {
            debug!(
                "No observatory config under {}, using defaults",
                self.root_path.display()
            );
            Ok(ObservatoryConfig::default())
        })
    }

    /// Save the observatory config.
    ///
    /// Creates the config directory if it doesn't exist.
    /// Returns the path where the config was saved.
    pub fn save_observatory_config(&self, config: &ObservatoryConfig) -> Result<PathBuf, ConfigError> {
        std::fs::create_dir_all(&self.root_path)?;

        let path = self.observatory_config_path();
        let json = serde_json::to_string_pretty(config).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    // =========================================================================
    // Recordings
    // =========================================================================

    /// Get the recordings directory path
    pub fn recordings_dir(&self) -> PathBuf {
        self.root_path.join("recordings")
    }

    /// Path for a named recording, creating the recordings directory.
    ///
    /// `name` is sanitized so it cannot escape the recordings directory.
    pub fn recording_path(&self, name: &str) -> std::io::Result<PathBuf> {
        let dir = self.recordings_dir();
        std::fs::create_dir_all(&dir)?;

        let safe: String = name
            .chars()
            .map(|c| if c == '/' || c == '\\' || c == ' ' { '_' } else { c })
            .collect();
        let filename = if safe.ends_with(".json") {
            safe
        } else {
            format!("{safe}.json")
        };
        Ok(dir.join(filename))
    }

    /// List the names of all stored recordings, sorted.
    pub fn list_recordings(&self) -> std::io::Result<Vec<String>> {
        let dir = self.recordings_dir();

        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();

            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }
}

impl Default for ConfigStorage {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self::with_path(PathBuf::from(".seestar_config")))
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let json = std::fs::read_to_string(path)?;
    serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (TempDir, ConfigStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = ConfigStorage::with_path(dir.path().join("config"));
        (dir, storage)
    }

    #[test]
    fn test_get_nonexistent_config() {
        let (_dir, storage) = create_test_storage();
        assert!(storage.get_observatory_config().is_none());

        let config = storage.load_observatory_config_or_default().unwrap();
        assert_eq!(config, ObservatoryConfig::default());
    }

    #[test]
    fn test_save_and_load_config() {
        let (_dir, storage) = create_test_storage();

        let mut config = ObservatoryConfig::default();
        config.device.host = "10.1.2.3".to_string();
        config.execution.phase_retries = 4;

        let path = storage.save_observatory_config(&config).unwrap();
        assert!(path.exists());

        let loaded = storage
            .get_observatory_config()
            .expect("Config should exist")
            .expect("Config should load successfully");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_corrupt_config_reports_parse_error() {
        let (_dir, storage) = create_test_storage();
        std::fs::create_dir_all(storage.root_path()).unwrap();
        std::fs::write(storage.root_path().join("observatory.json"), "{ not json").unwrap();

        let result = storage.get_observatory_config().expect("File exists");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
        assert!(storage.load_observatory_config_or_default().is_err());
    }

    #[test]
    fn test_recording_path_is_sanitized() {
        let (_dir, storage) = create_test_storage();
        let path = storage.recording_path("../night one").unwrap();

        assert_eq!(path.parent().unwrap(), storage.recordings_dir());
        assert!(path.to_str().unwrap().ends_with(".._night_one.json"));
    }

    #[test]
    fn test_list_recordings() {
        let (_dir, storage) = create_test_storage();
        assert!(storage.list_recordings().unwrap().is_empty());

        std::fs::write(storage.recording_path("b_session").unwrap(), "{}").unwrap();
        std::fs::write(storage.recording_path("a_session.json").unwrap(), "{}").unwrap();
        std::fs::write(storage.recordings_dir().join("notes.txt"), "skip").unwrap();

        assert_eq!(
            storage.list_recordings().unwrap(),
            vec!["a_session".to_string(), "b_session".to_string()]
        );
    }
}
