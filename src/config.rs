//! Pond configuration, read once at open time.

use crate::error::{Error, Result};
use crate::hashtable::HashAlgorithm;
use crate::record::MAX_KEY_LEN;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Settings for creating or attaching to a pond.
///
/// Loadable from TOML; every field has a default, so a file only needs to
/// name what it changes:
///
/// ```toml
/// region_size = 268435456
/// key_size = 4
/// empty_filter = true
/// expire_alert_secs = 60
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PondConfig {
    /// Region size in bytes (used when creating a region)
    pub region_size: usize,

    /// Fixed key length in bytes, or 0 for variable-length keys
    pub key_size: u16,

    /// Bucket count of the hash index. Derived from the region size when
    /// unset.
    pub hash_buckets: Option<u32>,

    /// Hash for variable-length keys
    pub hash_algorithm: HashAlgorithm,

    /// Keep zero-row records in the empty tier instead of dropping them
    pub empty_filter: bool,

    /// Most empty records kept before the oldest is purged (0 = unbounded)
    pub empty_limit: u64,

    /// Reformat a region left dirty by a writer that never closed it
    pub auto_delete_dirty: bool,

    /// Warn when purging a record modified less than this many seconds ago
    /// (0 disables the alert)
    pub expire_alert_secs: u32,

    /// Most nodes examined by a single purge sweep
    pub purge_scan_limit: usize,

    /// Nodes purged per timer tick while delayed purge requests are pending
    pub delay_purge_batch: usize,

    /// Interval of the purge timer in milliseconds
    pub purge_interval_ms: u64,

    /// Nodes the NodeID index is sized for when formatting (0 = grow on
    /// demand)
    pub expected_nodes: u64,

    /// Hash buckets swept per timer tick while a hash migration is pending
    pub hash_migrate_batch: u32,
}

impl Default for PondConfig {
    fn default() -> Self {
        Self {
            region_size: 64 * 1024 * 1024,
            key_size: 0,
            hash_buckets: None,
            hash_algorithm: HashAlgorithm::Elf,
            empty_filter: false,
            empty_limit: 0,
            auto_delete_dirty: false,
            expire_alert_secs: 0,
            purge_scan_limit: 2500,
            delay_purge_batch: 50,
            purge_interval_ms: 10,
            expected_nodes: 0,
            hash_migrate_batch: 1024,
        }
    }
}

impl PondConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: PondConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.region_size == 0 {
            return Err(Error::Config("region_size must be non-zero".to_string()));
        }
        if self.key_size as usize > MAX_KEY_LEN {
            return Err(Error::Config(format!(
                "key_size {} exceeds the {} byte key limit",
                self.key_size, MAX_KEY_LEN
            )));
        }
        if self.hash_buckets == Some(0) {
            return Err(Error::Config("hash_buckets must be non-zero".to_string()));
        }
        if self.purge_interval_ms == 0 {
            return Err(Error::Config("purge_interval_ms must be non-zero".to_string()));
        }
        if self.purge_scan_limit == 0 {
            return Err(Error::Config("purge_scan_limit must be non-zero".to_string()));
        }
        if self.hash_migrate_batch == 0 {
            return Err(Error::Config("hash_migrate_batch must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }

    /// Bucket count to build the hash index with: the configured value, or
    /// one bucket per 256 bytes of region, rounded to an odd number.
    pub fn effective_hash_buckets(&self) -> u32 {
        match self.hash_buckets {
            Some(buckets) => buckets,
            None => {
                let buckets = (self.region_size / 256).clamp(1, u32::MAX as usize) as u32;
                buckets | 1
            }
        }
    }
}
