//! Configuration structures for loess.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Storage configuration for a loess index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for data files when a file-backed device is used.
    pub data_dir: PathBuf,
    /// Epsilon for the buffered flush hierarchy. Must obey 0 < epsilon < 1;
    /// smaller values favor reads, larger values favor ingest.
    pub epsilon: f64,
    /// Number of nodes the cache may hold in memory.
    pub cache_capacity: usize,
    /// Enable fsync for durability on the file-backed device.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            epsilon: 0.5,
            cache_capacity: 1024,
            fsync_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.epsilon, 0.5);
        assert_eq!(config.cache_capacity, 1024);
        assert!(config.fsync_enabled);
    }

    #[test]
    fn test_storage_config_custom() {
        let config = StorageConfig {
            data_dir: PathBuf::from("/var/lib/loess"),
            epsilon: 0.25,
            cache_capacity: 4096,
            fsync_enabled: false,
        };

        assert_eq!(config.data_dir, PathBuf::from("/var/lib/loess"));
        assert_eq!(config.epsilon, 0.25);
        assert_eq!(config.cache_capacity, 4096);
        assert!(!config.fsync_enabled);
    }

    #[test]
    fn test_storage_config_serde_roundtrip() {
        let original = StorageConfig::default();
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: StorageConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(original.data_dir, deserialized.data_dir);
        assert_eq!(original.epsilon, deserialized.epsilon);
        assert_eq!(original.cache_capacity, deserialized.cache_capacity);
        assert_eq!(original.fsync_enabled, deserialized.fsync_enabled);
    }
}
