use crate::core::{Result, StashError};
use crate::storage::{DurabilityMode, FileBackend};
use std::path::{Path, PathBuf};

pub const ENV_DATA_DIR: &str = "STASHDB_DATA_DIR";
pub const ENV_DURABILITY: &str = "STASHDB_DURABILITY";
pub const ENV_CHECKPOINT_THRESHOLD: &str = "STASHDB_CHECKPOINT_THRESHOLD";
pub const ENV_DEFAULT_UPGRADE_VALUE: &str = "STASHDB_DEFAULT_UPGRADE_VALUE";

/// Store configuration
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Directory for the journal and snapshot; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,

    pub durability: DurabilityMode,

    /// Journal entries written before a flush triggers a checkpoint
    pub checkpoint_threshold: usize,

    /// Value read for numeric columns that a stored row predates
    pub default_upgrade_value: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self {
            data_dir: None,
            durability: DurabilityMode::default(),
            checkpoint_threshold: 1000,
            default_upgrade_value: 0,
        }
    }

    pub fn persistent<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            data_dir: Some(data_dir.as_ref().to_path_buf()),
            ..Self::in_memory()
        }
    }

    /// Set the durability mode
    pub fn durability(mut self, mode: DurabilityMode) -> Self {
        self.durability = mode;
        self
    }

    pub fn checkpoint_threshold(mut self, threshold: usize) -> Self {
        self.checkpoint_threshold = threshold;
        self
    }

    pub fn default_upgrade_value(mut self, value: i64) -> Self {
        self.default_upgrade_value = value;
        self
    }

    /// Reads `STASHDB_*` environment variables. Unset variables keep their
    /// defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(ENV_DATA_DIR) {
            Some(dir) if !dir.trim().is_empty() => Self::persistent(dir.trim()),
            _ => Self::in_memory(),
        };

        if let Some(mode) = lookup(ENV_DURABILITY) {
            config.durability = mode.trim().parse()?;
        }
        if let Some(threshold) = lookup(ENV_CHECKPOINT_THRESHOLD) {
            config.checkpoint_threshold = parse_var(ENV_CHECKPOINT_THRESHOLD, &threshold)?;
        }
        if let Some(value) = lookup(ENV_DEFAULT_UPGRADE_VALUE) {
            config.default_upgrade_value = parse_var(ENV_DEFAULT_UPGRADE_VALUE, &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_threshold == 0 {
            return Err(StashError::ConfigError(
                "checkpoint_threshold must be > 0".to_string(),
            ));
        }

        if let Some(dir) = &self.data_dir {
            if dir.as_os_str().is_empty() {
                return Err(StashError::ConfigError(
                    "data_dir cannot be empty".to_string(),
                ));
            }
            if dir.is_file() {
                return Err(StashError::ConfigError(format!(
                    "data_dir '{}' is a file",
                    dir.display()
                )));
            }
        }

        Ok(())
    }

    /// Builds the file backend this configuration describes.
    pub fn file_backend(&self) -> Result<FileBackend> {
        self.validate()?;
        let dir = self.data_dir.as_ref().ok_or_else(|| {
            StashError::ConfigError("a persistent store needs a data_dir".to_string())
        })?;
        Ok(FileBackend::new(dir, self.durability).with_checkpoint_threshold(self.checkpoint_threshold))
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| StashError::ConfigError(format!("{} has an invalid value '{}'", key, raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_builder() {
        let config = StoreConfig::persistent("/tmp/stash")
            .durability(DurabilityMode::Sync)
            .checkpoint_threshold(10)
            .default_upgrade_value(-1);

        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/stash")));
        assert_eq!(config.durability, DurabilityMode::Sync);
        assert_eq!(config.checkpoint_threshold, 10);
        assert_eq!(config.default_upgrade_value, -1);
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = StoreConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, StoreConfig::in_memory());
    }

    #[test]
    fn test_from_lookup_reads_every_key() {
        let config = StoreConfig::from_lookup(lookup(&[
            (ENV_DATA_DIR, "/var/lib/stash"),
            (ENV_DURABILITY, "NONE"),
            (ENV_CHECKPOINT_THRESHOLD, "50"),
            (ENV_DEFAULT_UPGRADE_VALUE, "7"),
        ]))
        .unwrap();

        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/stash")));
        assert_eq!(config.durability, DurabilityMode::None);
        assert_eq!(config.checkpoint_threshold, 50);
        assert_eq!(config.default_upgrade_value, 7);
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        assert!(StoreConfig::from_lookup(lookup(&[(ENV_DURABILITY, "eventually")])).is_err());
        assert!(StoreConfig::from_lookup(lookup(&[(ENV_CHECKPOINT_THRESHOLD, "lots")])).is_err());
        assert!(StoreConfig::from_lookup(lookup(&[(ENV_CHECKPOINT_THRESHOLD, "0")])).is_err());
    }

    #[test]
    fn test_file_backend_requires_dir() {
        assert!(matches!(
            StoreConfig::in_memory().file_backend(),
            Err(StashError::ConfigError(_))
        ));
    }
}
