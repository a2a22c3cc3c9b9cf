//! Store configuration: page geometry, cache, codec and admission limits.

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

use crate::addressing::IndirectLevels;

/// Largest supported node-page or fanout exponent.
pub(crate) const MAX_EXPONENT: u8 = 16;

/// Largest supported indirect-tree height.
const MAX_HEIGHT: u8 = 8;

/// Highest usable key bit; keeps every addressable key inside `i64`.
const MAX_KEY_BITS: u32 = 62;

/// Minimum page cache capacity.
const MIN_CACHE_CAPACITY: usize = 16;

/// Minimum zstd compression level.
const MIN_COMPRESSION_LEVEL: i32 = 1;

/// Maximum zstd compression level.
const MAX_COMPRESSION_LEVEL: i32 = 22;

/// Length of a page encryption key in bytes.
pub const ENCRYPTION_KEY_SIZE: usize = 32;

/// Configuration validation error.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum ConfigError {
    /// A configuration value is invalid.
    #[snafu(display("invalid config: {message}"))]
    Validation {
        /// Description of the validation failure.
        message: String,
    },
}

/// Store configuration.
///
/// Geometry fields (`node_page_exponent`, `indirect_fanout_exponent`, the two
/// heights) must be identical for every session that opens the same file; the
/// file header only records the storage properties (checksummed, encrypted).
///
/// # Validation Rules
///
/// - exponents are 1-16, heights are 1-8
/// - `indirect_fanout_exponent * revision_index_height` <= 62
/// - `indirect_fanout_exponent * node_index_height + node_page_exponent` <= 62
/// - `cache_capacity` >= 16 pages
/// - `compression_level` is 1-22 (zstd valid range)
/// - `max_read_transactions` >= 1, `read_acquire_timeout` > 0
///
/// # Example
///
/// ```no_run
/// # use revtree_store::StoreConfig;
/// let config = StoreConfig::builder()
///     .node_page_exponent(6)
///     .cache_capacity(4096)
///     .build()
///     .expect("valid store config");
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StoreConfig {
    /// Node records per node page, as a power of two.
    #[serde(default = "default_node_page_exponent")]
    pub node_page_exponent: u8,
    /// References per indirect page, as a power of two.
    #[serde(default = "default_indirect_fanout_exponent")]
    pub indirect_fanout_exponent: u8,
    /// Levels of indirect pages below the uber page.
    #[serde(default = "default_index_height")]
    pub revision_index_height: u8,
    /// Levels of indirect pages below each revision root page.
    #[serde(default = "default_index_height")]
    pub node_index_height: u8,
    /// Maximum number of committed pages held in the shared cache.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Zstd compression level for page payloads.
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
    /// Whether new stores append a CRC32 to every page blob.
    #[serde(default = "default_true")]
    pub checksummed: bool,
    /// XChaCha20-Poly1305 key. New stores are encrypted when set.
    #[serde(skip)]
    pub encryption_key: Option<[u8; ENCRYPTION_KEY_SIZE]>,
    /// Maximum number of concurrently open read transactions.
    #[serde(default = "default_max_read_transactions")]
    pub max_read_transactions: usize,
    /// How long `begin_read_transaction` waits for a read permit.
    #[serde(default = "default_read_acquire_timeout")]
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub read_acquire_timeout: Duration,
    /// Whether to fsync on every commit.
    #[serde(default = "default_true")]
    pub sync_on_commit: bool,
}

#[bon::bon]
impl StoreConfig {
    /// Creates a new store configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value violates the rules listed
    /// on [`StoreConfig`].
    #[builder]
    pub fn new(
        #[builder(default = default_node_page_exponent())] node_page_exponent: u8,
        #[builder(default = default_indirect_fanout_exponent())] indirect_fanout_exponent: u8,
        #[builder(default = default_index_height())] revision_index_height: u8,
        #[builder(default = default_index_height())] node_index_height: u8,
        #[builder(default = default_cache_capacity())] cache_capacity: usize,
        #[builder(default = default_compression_level())] compression_level: i32,
        #[builder(default = true)] checksummed: bool,
        encryption_key: Option<[u8; ENCRYPTION_KEY_SIZE]>,
        #[builder(default = default_max_read_transactions())] max_read_transactions: usize,
        #[builder(default = default_read_acquire_timeout())] read_acquire_timeout: Duration,
        #[builder(default = true)] sync_on_commit: bool,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            node_page_exponent,
            indirect_fanout_exponent,
            revision_index_height,
            node_index_height,
            cache_capacity,
            compression_level,
            checksummed,
            encryption_key,
            max_read_transactions,
            read_acquire_timeout,
            sync_on_commit,
        };
        config.validate()?;
        Ok(config)
    }
}

impl StoreConfig {
    /// Validates the configuration values.
    ///
    /// Call after deserialization to ensure values are within valid ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("node_page_exponent", self.node_page_exponent, 1, MAX_EXPONENT)?;
        check_range("indirect_fanout_exponent", self.indirect_fanout_exponent, 1, MAX_EXPONENT)?;
        check_range("revision_index_height", self.revision_index_height, 1, MAX_HEIGHT)?;
        check_range("node_index_height", self.node_index_height, 1, MAX_HEIGHT)?;

        let fanout = u32::from(self.indirect_fanout_exponent);
        let revision_bits = fanout * u32::from(self.revision_index_height);
        if revision_bits > MAX_KEY_BITS {
            return Err(ConfigError::Validation {
                message: format!(
                    "revision index addresses 2^{revision_bits} keys, maximum is 2^{MAX_KEY_BITS}"
                ),
            });
        }
        let node_bits =
            fanout * u32::from(self.node_index_height) + u32::from(self.node_page_exponent);
        if node_bits > MAX_KEY_BITS {
            return Err(ConfigError::Validation {
                message: format!(
                    "node index addresses 2^{node_bits} node keys, maximum is 2^{MAX_KEY_BITS}"
                ),
            });
        }
        if self.cache_capacity < MIN_CACHE_CAPACITY {
            return Err(ConfigError::Validation {
                message: format!(
                    "cache_capacity must be >= {MIN_CACHE_CAPACITY}, got {}",
                    self.cache_capacity
                ),
            });
        }
        if self.compression_level < MIN_COMPRESSION_LEVEL
            || self.compression_level > MAX_COMPRESSION_LEVEL
        {
            return Err(ConfigError::Validation {
                message: format!(
                    "compression_level must be {}-{}, got {}",
                    MIN_COMPRESSION_LEVEL, MAX_COMPRESSION_LEVEL, self.compression_level
                ),
            });
        }
        if self.max_read_transactions == 0 {
            return Err(ConfigError::Validation {
                message: "max_read_transactions must be >= 1".to_string(),
            });
        }
        if self.read_acquire_timeout.is_zero() {
            return Err(ConfigError::Validation {
                message: "read_acquire_timeout must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    /// Number of node slots per node page (`2^node_page_exponent`).
    pub fn node_page_capacity(&self) -> usize {
        1 << self.node_page_exponent
    }

    /// Level layout of the revision index rooted at the uber page.
    pub fn revision_levels(&self) -> IndirectLevels {
        IndirectLevels::new(self.indirect_fanout_exponent, self.revision_index_height)
    }

    /// Level layout of the node index rooted at each revision root page.
    pub fn node_levels(&self) -> IndirectLevels {
        IndirectLevels::new(self.indirect_fanout_exponent, self.node_index_height)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            node_page_exponent: default_node_page_exponent(),
            indirect_fanout_exponent: default_indirect_fanout_exponent(),
            revision_index_height: default_index_height(),
            node_index_height: default_index_height(),
            cache_capacity: default_cache_capacity(),
            compression_level: default_compression_level(),
            checksummed: true,
            encryption_key: None,
            max_read_transactions: default_max_read_transactions(),
            read_acquire_timeout: default_read_acquire_timeout(),
            sync_on_commit: true,
        }
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("node_page_exponent", &self.node_page_exponent)
            .field("indirect_fanout_exponent", &self.indirect_fanout_exponent)
            .field("revision_index_height", &self.revision_index_height)
            .field("node_index_height", &self.node_index_height)
            .field("cache_capacity", &self.cache_capacity)
            .field("compression_level", &self.compression_level)
            .field("checksummed", &self.checksummed)
            .field("encrypted", &self.encryption_key.is_some())
            .field("max_read_transactions", &self.max_read_transactions)
            .field("read_acquire_timeout", &self.read_acquire_timeout)
            .field("sync_on_commit", &self.sync_on_commit)
            .finish()
    }
}

fn check_range(field: &str, value: u8, min: u8, max: u8) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::Validation {
            message: format!("{field} must be {min}-{max}, got {value}"),
        });
    }
    Ok(())
}

fn default_node_page_exponent() -> u8 {
    7 // 128 nodes per page
}

fn default_indirect_fanout_exponent() -> u8 {
    7 // 128 references per indirect page
}

fn default_index_height() -> u8 {
    5
}

fn default_cache_capacity() -> usize {
    1024
}

fn default_compression_level() -> i32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_max_read_transactions() -> usize {
    128
}

fn default_read_acquire_timeout() -> Duration {
    Duration::from_secs(5)
}

// =========================================================================
// AutoCommitConfig
// =========================================================================

/// Periodic auto-commit configuration.
///
/// When enabled, [`AutoCommitJob`](crate::auto_commit::AutoCommitJob) commits a
/// shared write transaction every `interval` if it holds uncommitted modifications.
///
/// # Example
///
/// ```no_run
/// # use std::time::Duration;
/// # use revtree_store::AutoCommitConfig;
/// let config = AutoCommitConfig::builder()
///     .enabled(true)
///     .interval(Duration::from_millis(500))
///     .build()
///     .expect("valid auto-commit config");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AutoCommitConfig {
    /// Whether the background trigger runs at all.
    #[serde(default)]
    pub enabled: bool,
    /// Time between commit attempts.
    #[serde(default = "default_auto_commit_interval")]
    #[serde(with = "humantime_serde")]
    #[schemars(with = "String")]
    pub interval: Duration,
}

#[bon::bon]
impl AutoCommitConfig {
    /// Creates a new auto-commit configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if `interval` is zero.
    #[builder]
    pub fn new(
        #[builder(default)] enabled: bool,
        #[builder(default = default_auto_commit_interval())] interval: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { enabled, interval };
        config.validate()?;
        Ok(config)
    }
}

impl AutoCommitConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if `interval` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::Validation {
                message: "auto-commit interval must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for AutoCommitConfig {
    fn default() -> Self {
        Self { enabled: false, interval: default_auto_commit_interval() }
    }
}

fn default_auto_commit_interval() -> Duration {
    Duration::from_secs(1)
}

/// Duration serialization using humantime format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StoreConfig::builder().build().expect("defaults should be valid");
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.node_page_capacity(), 128);
        assert_eq!(config.node_levels().exponents(), &[28, 21, 14, 7, 0]);
    }

    #[test]
    fn test_rejects_oversized_node_index() {
        let err = StoreConfig::builder()
            .indirect_fanout_exponent(16)
            .node_index_height(4)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("node index addresses"), "got: {err}");
    }

    #[test]
    fn test_rejects_zero_exponent() {
        let err = StoreConfig::builder().node_page_exponent(0).build().unwrap_err();
        assert_eq!(err.to_string(), "invalid config: node_page_exponent must be 1-16, got 0");
    }

    #[test]
    fn test_rejects_bad_compression_level() {
        assert!(StoreConfig::builder().compression_level(0).build().is_err());
        assert!(StoreConfig::builder().compression_level(23).build().is_err());
    }

    #[test]
    fn test_rejects_zero_readers() {
        assert!(StoreConfig::builder().max_read_transactions(0).build().is_err());
    }

    #[test]
    fn test_serde_round_trip_skips_key() {
        let config = StoreConfig::builder()
            .encryption_key([7u8; ENCRYPTION_KEY_SIZE])
            .read_acquire_timeout(Duration::from_millis(250))
            .build()
            .unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("250ms"), "got: {json}");
        assert!(!json.contains("encryption_key"));

        let decoded: StoreConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.encryption_key, None);
        assert_eq!(decoded.read_acquire_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_debug_hides_key() {
        let config =
            StoreConfig::builder().encryption_key([9u8; ENCRYPTION_KEY_SIZE]).build().unwrap();
        let debug = format!("{config:?}");
        assert!(debug.contains("encrypted: true"));
        assert!(!debug.contains("[9"));
    }

    #[test]
    fn test_auto_commit_rejects_zero_interval() {
        assert!(AutoCommitConfig::builder().interval(Duration::ZERO).build().is_err());
        let config = AutoCommitConfig::builder().build().unwrap();
        assert!(!config.enabled);
    }
}
