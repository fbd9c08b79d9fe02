//! Ring storage
//!
//! Provides a trait-based abstraction over the backend holding the ring
//! table, the real node registry and each real node's owned keys
//! (in-memory, Redis).
//!
//! Floor and ceiling lookups are strict and circular: they never return the
//! queried score itself, wrap around the score domain when nothing lies on
//! the requested side, and return `None` only when no other score is
//! occupied.

pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis;

use crate::error::RingResult;
use crate::ring::{Score, VirtualNodeId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

pub use memory::MemoryRingStore;
#[cfg(feature = "redis-store")]
pub use self::redis::RedisRingStore;

/// Proof of one ring lock acquisition. Only the matching token releases
/// the lock, so a holder whose lease ran out cannot free its successor's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(Uuid);

impl LockToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A virtual node resolved at a ring position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingEntry {
    pub score: Score,
    pub vnode: VirtualNodeId,
}

impl RingEntry {
    pub fn new(score: Score, vnode: VirtualNodeId) -> Self {
        Self { score, vnode }
    }

    /// Owning real node name
    pub fn node(&self) -> &str {
        self.vnode.node()
    }
}

/// Trait for ring store implementations
#[async_trait]
pub trait RingStore: Send + Sync {
    /// Acquire the ring-wide exclusive lock. The lock expires on its own
    /// after `expire`, and acquisition gives up with `LockTimeout` after the
    /// same duration.
    async fn lock(&self, expire: Duration) -> RingResult<LockToken>;

    /// Release the lock taken with `token`. `LockNotHeld` when the token no
    /// longer owns it (released, or expired and taken over).
    async fn unlock(&self, token: &LockToken) -> RingResult<()>;

    /// Insert a virtual node at `score`. No-op when already present.
    async fn add_virtual_node(&self, score: Score, vnode: &VirtualNodeId) -> RingResult<()>;

    /// Remove a virtual node from `score`. No-op when absent.
    async fn remove_virtual_node(&self, score: Score, vnode: &VirtualNodeId) -> RingResult<()>;

    /// Occupants of exactly `score`, in insertion order (possibly empty)
    async fn virtual_nodes(&self, score: Score) -> RingResult<Vec<VirtualNodeId>>;

    /// Clockwise lookup: first occupant at or after `score`, wrapping to the
    /// smallest score. `VirtualNodeNotFound` when the ring is empty.
    async fn find_virtual_node(&self, score: Score) -> RingResult<VirtualNodeId>;

    /// Nearest occupied score strictly before `score` (wrapping)
    async fn floor(&self, score: Score) -> RingResult<Option<RingEntry>>;

    /// Nearest occupied score strictly after `score` (wrapping)
    async fn ceiling(&self, score: Score) -> RingResult<Option<RingEntry>>;

    /// Register a real node with its replica count
    async fn add_real_node(&self, name: &str, replicas: u32) -> RingResult<()>;

    /// All registered real nodes (name -> replicas)
    async fn real_nodes(&self) -> RingResult<HashMap<String, u32>>;

    /// Replica count of a real node, `None` when not registered
    async fn real_node(&self, name: &str) -> RingResult<Option<u32>>;

    /// Deregister a real node. No-op when absent.
    async fn remove_real_node(&self, name: &str) -> RingResult<()>;

    /// Add keys to a real node's owned set
    async fn add_data(&self, name: &str, keys: &HashSet<String>) -> RingResult<()>;

    /// Owned keys of a real node (empty when none recorded)
    async fn data(&self, name: &str) -> RingResult<HashSet<String>>;

    /// Remove keys from a real node's owned set
    async fn remove_data(&self, name: &str, keys: &HashSet<String>) -> RingResult<()>;

    /// Current ring version
    async fn version(&self) -> RingResult<i64>;

    /// Overwrite the ring version
    async fn set_version(&self, version: i64) -> RingResult<()>;
}

/// Type alias for dynamic ring stores
pub type DynRingStore = dyn RingStore;
