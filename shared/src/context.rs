//! Process-wide context, built once in `main` and passed by reference.

use crate::config_storage::{ConfigError, ConfigStorage};
use crate::observatory_config::ObservatoryConfig;

/// Configuration plus the storage it came from.
#[derive(Debug, Clone)]
pub struct ObservatoryContext {
    pub config: ObservatoryConfig,
    pub storage: ConfigStorage,
}

impl ObservatoryContext {
    pub fn new(config: ObservatoryConfig, storage: ConfigStorage) -> Self {
        Self { config, storage }
    }

    /// Load the stored config (defaults if none is saved yet).
    pub fn load(storage: ConfigStorage) -> Result<Self, ConfigError> {
        let config = storage.load_observatory_config_or_default()?;
        Ok(Self { config, storage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_uses_stored_config() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ConfigStorage::with_path(dir.path().to_path_buf());

        let mut config = ObservatoryConfig::default();
        config.device.port = 5555;
        storage.save_observatory_config(&config).unwrap();

        let ctx = ObservatoryContext::load(storage).unwrap();
        assert_eq!(ctx.config.device.port, 5555);
        assert_eq!(ctx.storage.root_path(), dir.path());
    }
}
