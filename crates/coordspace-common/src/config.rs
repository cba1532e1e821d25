//! Configuration types for coordspace
//!
//! One [`SpaceConfig`] is loaded at startup (TOML file, then CLI overrides)
//! and passed by reference to the components that need it.

use crate::error::{Error, Result};
use crate::types::SpaceUri;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for a space node
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceConfig {
    /// Space identity
    pub space: SpaceSection,
    /// Durable storage
    pub persistence: PersistenceConfig,
    /// Value cache in front of the persistence adapter
    pub cache: CacheConfig,
    /// Query engine
    pub query: QueryConfig,
    /// Deadlock detection
    pub deadlock: DeadlockConfig,
    /// Remote messaging
    pub remote: RemoteConfig,
    /// Logging
    pub logging: LoggingConfig,
}

impl SpaceConfig {
    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// The configured space URI, parsed
    pub fn space_uri(&self) -> Result<SpaceUri> {
        SpaceUri::parse(self.space.uri.clone())
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<()> {
        self.space_uri()?;
        if self.persistence.profile == PersistenceProfile::Redb && self.persistence.path.is_none() {
            return Err(Error::configuration(
                "persistence.path is required for the redb profile",
            ));
        }
        if self.cache.policy == CachePolicyConfig::Lru && self.cache.capacity == 0 {
            return Err(Error::configuration("cache.capacity must be > 0 for lru"));
        }
        if self.remote.default_scheme.is_empty() {
            return Err(Error::configuration("remote.default_scheme is empty"));
        }
        Ok(())
    }
}

/// Space identity
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceSection {
    /// Human-readable name
    pub name: String,
    /// Address other nodes use to reach this space
    pub uri: String,
}

impl Default for SpaceSection {
    fn default() -> Self {
        Self {
            name: "coordspace".to_string(),
            uri: "mem://local-space".to_string(),
        }
    }
}

/// Named persistence profile
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PersistenceProfile {
    /// No durability; persistent containers live in process memory
    #[default]
    InMemory,
    /// redb database file
    Redb,
}

/// When a commit is flushed to disk
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitMode {
    /// fsync before commit returns
    #[default]
    Sync,
    /// Commit returns before the data is guaranteed on disk
    Async,
}

/// Durable storage configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Storage profile
    pub profile: PersistenceProfile,
    /// Database file (required for `redb`)
    pub path: Option<PathBuf>,
    /// Commit durability
    pub commit: CommitMode,
}

/// Value cache policy as configured
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicyConfig {
    /// Never caches
    None,
    /// Bounded least-recently-used cache
    #[default]
    Lru,
    /// Unbounded best-effort cache
    Unbounded,
}

/// Value cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache policy
    pub policy: CachePolicyConfig,
    /// Maximum number of cached values per container (LRU only)
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            policy: CachePolicyConfig::Lru,
            capacity: 10_000,
        }
    }
}

/// Query engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Idle time after which an entry's cached properties are dropped
    pub entry_ttl_secs: u64,
    /// Idle time after which a single cached property is dropped
    pub property_ttl_secs: u64,
}

impl QueryConfig {
    #[must_use]
    pub const fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_secs)
    }

    #[must_use]
    pub const fn property_ttl(&self) -> Duration {
        Duration::from_secs(self.property_ttl_secs)
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            entry_ttl_secs: 300,
            property_ttl_secs: 120,
        }
    }
}

/// Which transaction of a cycle is aborted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VictimPolicyConfig {
    /// Highest creation sequence
    #[default]
    Youngest,
    /// Lowest creation sequence
    Oldest,
}

/// Deadlock detection configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlockConfig {
    /// Victim selection
    pub victim: VictimPolicyConfig,
    /// Periodic scan interval; detection also runs whenever a wait edge is added
    pub scan_interval_ms: Option<u64>,
}

/// Remote messaging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Scheme used for destinations without one
    pub default_scheme: String,
    /// Reject remote requests that carry no identity
    pub require_identity: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            default_scheme: "mem".to_string(),
            require_identity: false,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
