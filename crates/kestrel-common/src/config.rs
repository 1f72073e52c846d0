//! Configuration structures for kestrel.

use crate::error::{KestrelError, Result};
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Smallest shared segment the cache will start with, in megabytes.
pub const MIN_SHMEM_SIZE_MB: usize = 64;

/// Process-wide tunables for the columnar cache.
///
/// Values are read once at startup. Changing the segment size or the
/// number of columnizers requires a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enables the columnar cache. When false, lookups return no cache head
    /// and change notifications are ignored.
    pub enabled: bool,
    /// Size of the shared memory segment in megabytes.
    pub shmem_size_mb: usize,
    /// Number of background columnizer workers.
    pub num_columnizers: usize,
    /// Fixed row capacity of every column-store chunk.
    pub rows_per_chunk: usize,
    /// Size in bytes of each row-store staging buffer.
    pub row_store_size: usize,
    /// Initial size in bytes of a freshly created toast buffer.
    pub toast_init_size: usize,
    /// Upper bound on how long an idle columnizer sleeps before rechecking
    /// the pending queue, in milliseconds.
    pub columnizer_naptime_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            shmem_size_mb: 256,
            num_columnizers: 1,
            rows_per_chunk: 65536,
            row_store_size: 8 * 1024 * 1024, // 8 MB
            toast_init_size: 64 * 1024,      // 64 KB
            columnizer_naptime_ms: 15_000,   // 15 seconds
        }
    }
}

impl CacheConfig {
    /// Returns the shared segment size in bytes.
    pub fn segment_size_bytes(&self) -> usize {
        self.shmem_size_mb * 1024 * 1024
    }

    /// Returns a config whose segment is sized to 25% of available RAM,
    /// but never below the minimum segment size.
    pub fn auto_sized() -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available_mb = (sys.available_memory() as usize) / (1024 * 1024);
        Self {
            shmem_size_mb: (available_mb / 4).max(MIN_SHMEM_SIZE_MB),
            num_columnizers: num_cpus().div_ceil(4),
            ..Self::default()
        }
    }

    /// Checks every tunable against its lower bound.
    pub fn validate(&self) -> Result<()> {
        check_min("shmem_size_mb", self.shmem_size_mb, MIN_SHMEM_SIZE_MB)?;
        check_min("num_columnizers", self.num_columnizers, 1)?;
        check_min("rows_per_chunk", self.rows_per_chunk, 4)?;
        check_min("row_store_size", self.row_store_size, 64 * 1024)?;
        check_min("toast_init_size", self.toast_init_size, 4096)?;
        if self.columnizer_naptime_ms == 0 {
            return Err(KestrelError::InvalidParameter {
                name: "columnizer_naptime_ms".to_string(),
                value: "0".to_string(),
            });
        }
        if self.rows_per_chunk > u32::MAX as usize {
            return Err(KestrelError::ConfigError(format!(
                "rows_per_chunk {} exceeds the addressable row count",
                self.rows_per_chunk
            )));
        }
        Ok(())
    }
}

fn check_min(name: &str, value: usize, min: usize) -> Result<()> {
    if value < min {
        return Err(KestrelError::InvalidParameter {
            name: name.to_string(),
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Returns the number of available CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config_defaults() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.shmem_size_mb, 256);
        assert_eq!(config.num_columnizers, 1);
        assert_eq!(config.columnizer_naptime_ms, 15_000);
        assert_eq!(config.segment_size_bytes(), 256 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cache_config_rejects_small_segment() {
        let config = CacheConfig {
            shmem_size_mb: 32,
            ..CacheConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("shmem_size_mb"));
    }

    #[test]
    fn test_cache_config_rejects_zero_columnizers() {
        let config = CacheConfig {
            num_columnizers: 0,
            ..CacheConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(KestrelError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_auto_sized_respects_minimum() {
        let config = CacheConfig::auto_sized();
        assert!(config.shmem_size_mb >= MIN_SHMEM_SIZE_MB);
        assert!(config.num_columnizers >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = CacheConfig {
            rows_per_chunk: 1024,
            ..CacheConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: CacheConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.rows_per_chunk, 1024);
        assert_eq!(parsed.shmem_size_mb, config.shmem_size_mb);
    }

    #[test]
    fn test_config_partial_document_uses_defaults() {
        let parsed: CacheConfig = serde_json::from_str(r#"{"num_columnizers": 3}"#).unwrap();
        assert_eq!(parsed.num_columnizers, 3);
        assert_eq!(parsed.rows_per_chunk, 65536);
    }
}
