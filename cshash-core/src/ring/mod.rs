//! Consistent hash ring
//!
//! - Circular score space `[0, 2^31 - 2]`
//! - Weighted virtual node placement (`name_1 .. name_n`)
//! - Clockwise key lookup
//! - Minimal key migration on node join/leave

pub mod coordinator;
pub mod encryptor;
pub mod migration;
pub mod score;
pub mod vnode;

pub use coordinator::ConsistentHash;
pub use encryptor::{Crc32Encryptor, Encryptor};
pub use migration::{
    FailureHook, MigrationEngine, MigrationQueue, MigrationSummary, MigrationTask, Migrator,
    NoopMigrator,
};
pub use score::{MAX_SCORE, Score, ScoreInterval, ScoreSegment};
pub use vnode::VirtualNodeId;
