use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Default lock expiry (seconds)
pub const DEFAULT_LOCK_EXPIRE_SECS: u64 = 15;

/// Default virtual nodes per unit of weight
pub const DEFAULT_BASE_REPLICAS: u32 = 5;

/// Upper bound for both node weight and base replicas
pub const MAX_REPLICA_FACTOR: u32 = 10;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CshashConfig {
    pub ring: RingOptions,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

/// Ring coordinator options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingOptions {
    /// Ring lock expiry (seconds). Also bounds lock acquisition.
    pub lock_expire_secs: u64,

    /// Virtual nodes per unit of node weight, clamped to [1, 10]
    pub base_replicas: u32,
}

impl Default for RingOptions {
    fn default() -> Self {
        Self {
            lock_expire_secs: DEFAULT_LOCK_EXPIRE_SECS,
            base_replicas: DEFAULT_BASE_REPLICAS,
        }
    }
}

impl RingOptions {
    /// Apply defaults and clamps: a zero expiry or zero base replicas falls
    /// back to the default, base replicas above 10 become 10.
    pub fn normalized(mut self) -> Self {
        if self.lock_expire_secs == 0 {
            self.lock_expire_secs = DEFAULT_LOCK_EXPIRE_SECS;
        }

        self.base_replicas = match self.base_replicas {
            0 => DEFAULT_BASE_REPLICAS,
            n if n > MAX_REPLICA_FACTOR => MAX_REPLICA_FACTOR,
            n => n,
        };
        self
    }

    /// Get lock expiry as Duration
    pub fn lock_expire(&self) -> Duration {
        Duration::from_secs(self.lock_expire_secs)
    }

    /// Number of virtual nodes for a node of the given weight
    pub fn replicas_for(&self, weight: i64) -> u32 {
        clamp_weight(weight) * self.base_replicas
    }
}

/// Clamp a user-supplied weight to [1, 10]
pub fn clamp_weight(weight: i64) -> u32 {
    weight.clamp(1, i64::from(MAX_REPLICA_FACTOR)) as u32
}

/// Ring store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    /// Name of the ring, used as the key suffix in shared backends
    pub ring_key: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            ring_key: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl CshashConfig {
    /// Load configuration from YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: CshashConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Ring options with defaults and clamps applied
    pub fn ring_options(&self) -> RingOptions {
        self.ring.normalized()
    }
}
