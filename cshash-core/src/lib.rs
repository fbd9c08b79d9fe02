pub mod config;
pub mod error;
pub mod metrics;
pub mod ring;
pub mod store;

// Re-export commonly used types
pub use config::{CshashConfig, LoggingConfig, RingOptions, StoreBackend, StoreConfig};
pub use error::{RingError, RingResult};
pub use ring::{
    ConsistentHash, Crc32Encryptor, Encryptor, FailureHook, MAX_SCORE, MigrationTask, Migrator,
    NoopMigrator, Score, ScoreInterval, VirtualNodeId,
};
#[cfg(feature = "redis-store")]
pub use store::RedisRingStore;
pub use store::{DynRingStore, LockToken, MemoryRingStore, RingEntry, RingStore};
pub use tokio_util::sync::CancellationToken;
