//! In-process ring store
//!
//! Ordered map from score to occupants, with range queries for floor and
//! ceiling. The ring lock is a lease with an expiry so an abandoned holder
//! cannot wedge the ring forever.

use super::{LockToken, RingEntry, RingStore};
use crate::error::{RingError, RingResult};
use crate::ring::{Score, VirtualNodeId};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound::{Excluded, Unbounded};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
struct RingState {
    /// score -> occupants, in insertion order; never holds an empty list
    vnodes: BTreeMap<Score, Vec<VirtualNodeId>>,
    /// real node -> replica count
    real_nodes: HashMap<String, u32>,
    /// real node -> owned keys
    data: HashMap<String, HashSet<String>>,
    version: i64,
}

impl RingState {
    fn entry_at(&self, score: Score) -> Option<RingEntry> {
        self.vnodes
            .get(&score)
            .and_then(|ids| ids.first())
            .map(|vnode| RingEntry::new(score, vnode.clone()))
    }
}

/// Current lock holder
#[derive(Debug, Clone, Copy)]
struct Lease {
    token: LockToken,
    until: Instant,
}

/// In-memory ring store
#[derive(Debug, Default)]
pub struct MemoryRingStore {
    state: RwLock<RingState>,
    lease: Mutex<Option<Lease>>,
    released: Notify,
}

impl MemoryRingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of occupied scores
    pub fn score_count(&self) -> usize {
        self.state.read().vnodes.len()
    }

    /// Total number of virtual nodes, counting every occupant of a
    /// contested score
    pub fn virtual_node_count(&self) -> usize {
        self.state.read().vnodes.values().map(Vec::len).sum()
    }

    /// Whether the ring lock is currently held (and not expired)
    pub fn is_locked(&self) -> bool {
        matches!(*self.lease.lock(), Some(lease) if lease.until > Instant::now())
    }

    /// Try to take the lease. On failure returns the current holder's expiry.
    fn try_acquire(&self, expire: Duration) -> Result<LockToken, Instant> {
        let mut lease = self.lease.lock();
        let now = Instant::now();
        match *lease {
            Some(held) if held.until > now => Err(held.until),
            _ => {
                let token = LockToken::generate();
                *lease = Some(Lease {
                    token,
                    until: now + expire,
                });
                Ok(token)
            }
        }
    }
}

#[async_trait]
impl RingStore for MemoryRingStore {
    async fn lock(&self, expire: Duration) -> RingResult<LockToken> {
        let deadline = Instant::now() + expire;

        loop {
            // Register interest before checking so a release between the
            // check and the wait is not lost.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let held_until = match self.try_acquire(expire) {
                Ok(token) => return Ok(token),
                Err(until) => until,
            };

            if Instant::now() >= deadline {
                return Err(RingError::LockTimeout(expire));
            }

            // Wake on release, on the holder's lease running out, or at our deadline
            let wake_at = held_until.min(deadline);
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn unlock(&self, token: &LockToken) -> RingResult<()> {
        let mut lease = self.lease.lock();
        match *lease {
            Some(held) if held.token == *token => *lease = None,
            _ => return Err(RingError::LockNotHeld),
        }
        drop(lease);

        self.released.notify_waiters();
        Ok(())
    }

    async fn add_virtual_node(&self, score: Score, vnode: &VirtualNodeId) -> RingResult<()> {
        let mut state = self.state.write();
        let occupants = state.vnodes.entry(score).or_default();
        if occupants.contains(vnode) {
            return Ok(());
        }

        occupants.push(vnode.clone());
        state.version += 1;
        debug!(score, vnode = %vnode, version = state.version, "virtual node added");
        Ok(())
    }

    async fn remove_virtual_node(&self, score: Score, vnode: &VirtualNodeId) -> RingResult<()> {
        let mut state = self.state.write();
        let Some(occupants) = state.vnodes.get_mut(&score) else {
            return Ok(());
        };
        let Some(pos) = occupants.iter().position(|id| id == vnode) else {
            return Ok(());
        };

        occupants.remove(pos);
        if occupants.is_empty() {
            state.vnodes.remove(&score);
        }
        state.version += 1;
        debug!(score, vnode = %vnode, version = state.version, "virtual node removed");
        Ok(())
    }

    async fn virtual_nodes(&self, score: Score) -> RingResult<Vec<VirtualNodeId>> {
        Ok(self
            .state
            .read()
            .vnodes
            .get(&score)
            .cloned()
            .unwrap_or_default())
    }

    async fn find_virtual_node(&self, score: Score) -> RingResult<VirtualNodeId> {
        let state = self.state.read();
        state
            .vnodes
            .range(score..)
            .chain(state.vnodes.range(..score))
            .find_map(|(_, ids)| ids.first().cloned())
            .ok_or(RingError::VirtualNodeNotFound(score))
    }

    async fn floor(&self, score: Score) -> RingResult<Option<RingEntry>> {
        let state = self.state.read();
        let found = state
            .vnodes
            .range(..score)
            .next_back()
            .or_else(|| state.vnodes.iter().next_back())
            .map(|(s, _)| *s)
            .filter(|s| *s != score);

        Ok(found.and_then(|s| state.entry_at(s)))
    }

    async fn ceiling(&self, score: Score) -> RingResult<Option<RingEntry>> {
        let state = self.state.read();
        let found = state
            .vnodes
            .range((Excluded(score), Unbounded))
            .next()
            .or_else(|| state.vnodes.iter().next())
            .map(|(s, _)| *s)
            .filter(|s| *s != score);

        Ok(found.and_then(|s| state.entry_at(s)))
    }

    async fn add_real_node(&self, name: &str, replicas: u32) -> RingResult<()> {
        self.state
            .write()
            .real_nodes
            .insert(name.to_string(), replicas);
        Ok(())
    }

    async fn real_nodes(&self) -> RingResult<HashMap<String, u32>> {
        Ok(self.state.read().real_nodes.clone())
    }

    async fn real_node(&self, name: &str) -> RingResult<Option<u32>> {
        Ok(self.state.read().real_nodes.get(name).copied())
    }

    async fn remove_real_node(&self, name: &str) -> RingResult<()> {
        self.state.write().real_nodes.remove(name);
        Ok(())
    }

    async fn add_data(&self, name: &str, keys: &HashSet<String>) -> RingResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.state
            .write()
            .data
            .entry(name.to_string())
            .or_default()
            .extend(keys.iter().cloned());
        Ok(())
    }

    async fn data(&self, name: &str) -> RingResult<HashSet<String>> {
        Ok(self
            .state
            .read()
            .data
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn remove_data(&self, name: &str, keys: &HashSet<String>) -> RingResult<()> {
        let mut state = self.state.write();
        if let Some(owned) = state.data.get_mut(name) {
            owned.retain(|key| !keys.contains(key));
            if owned.is_empty() {
                state.data.remove(name);
            }
        }
        Ok(())
    }

    async fn version(&self) -> RingResult<i64> {
        Ok(self.state.read().version)
    }

    async fn set_version(&self, version: i64) -> RingResult<()> {
        self.state.write().version = version;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn vn(node: &str, replica: u32) -> VirtualNodeId {
        VirtualNodeId::new(node, replica)
    }

    async fn ring_with(entries: &[(Score, &str, u32)]) -> MemoryRingStore {
        let store = MemoryRingStore::new();
        for (score, node, replica) in entries {
            store
                .add_virtual_node(*score, &vn(node, *replica))
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_add_virtual_node_idempotent() {
        let store = MemoryRingStore::new();
        store.add_virtual_node(10, &vn("a", 1)).await.unwrap();
        store.add_virtual_node(10, &vn("a", 1)).await.unwrap();

        assert_eq!(store.virtual_nodes(10).await.unwrap(), vec![vn("a", 1)]);
        assert_eq!(store.version().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_collision_keeps_insertion_order() {
        let store = ring_with(&[(10, "a", 1), (10, "b", 4)]).await;
        assert_eq!(
            store.virtual_nodes(10).await.unwrap(),
            vec![vn("a", 1), vn("b", 4)]
        );
        assert_eq!(store.score_count(), 1);
        assert_eq!(store.virtual_node_count(), 2);
    }

    #[tokio::test]
    async fn test_remove_virtual_node() {
        let store = ring_with(&[(10, "a", 1), (10, "b", 1)]).await;

        store.remove_virtual_node(10, &vn("a", 1)).await.unwrap();
        assert_eq!(store.virtual_nodes(10).await.unwrap(), vec![vn("b", 1)]);

        // absent: no-op, no version bump
        let version = store.version().await.unwrap();
        store.remove_virtual_node(10, &vn("zz", 1)).await.unwrap();
        store.remove_virtual_node(99, &vn("b", 1)).await.unwrap();
        assert_eq!(store.version().await.unwrap(), version);

        store.remove_virtual_node(10, &vn("b", 1)).await.unwrap();
        assert!(store.virtual_nodes(10).await.unwrap().is_empty());
        assert_eq!(store.score_count(), 0);
    }

    #[tokio::test]
    async fn test_find_virtual_node_clockwise() {
        let store = ring_with(&[(100, "a", 1), (500, "b", 1)]).await;

        assert_eq!(store.find_virtual_node(0).await.unwrap(), vn("a", 1));
        assert_eq!(store.find_virtual_node(100).await.unwrap(), vn("a", 1));
        assert_eq!(store.find_virtual_node(101).await.unwrap(), vn("b", 1));
        assert_eq!(store.find_virtual_node(500).await.unwrap(), vn("b", 1));
        // wraps to the smallest score
        assert_eq!(store.find_virtual_node(501).await.unwrap(), vn("a", 1));
    }

    #[tokio::test]
    async fn test_find_virtual_node_empty_ring() {
        let store = MemoryRingStore::new();
        assert!(matches!(
            store.find_virtual_node(42).await,
            Err(RingError::VirtualNodeNotFound(42))
        ));
    }

    #[tokio::test]
    async fn test_floor_and_ceiling_wrap() {
        let store = ring_with(&[(100, "a", 1), (500, "b", 1), (900, "c", 1)]).await;

        let ceil = store.ceiling(500).await.unwrap().unwrap();
        assert_eq!((ceil.score, ceil.node()), (900, "c"));
        let ceil = store.ceiling(900).await.unwrap().unwrap();
        assert_eq!((ceil.score, ceil.node()), (100, "a"));

        let floor = store.floor(500).await.unwrap().unwrap();
        assert_eq!((floor.score, floor.node()), (100, "a"));
        let floor = store.floor(100).await.unwrap().unwrap();
        assert_eq!((floor.score, floor.node()), (900, "c"));

        // unoccupied query positions work too
        let floor = store.floor(50).await.unwrap().unwrap();
        assert_eq!(floor.score, 900);
        let ceil = store.ceiling(950).await.unwrap().unwrap();
        assert_eq!(ceil.score, 100);
    }

    #[tokio::test]
    async fn test_floor_and_ceiling_never_return_self() {
        let store = ring_with(&[(100, "a", 1)]).await;
        assert!(store.floor(100).await.unwrap().is_none());
        assert!(store.ceiling(100).await.unwrap().is_none());

        // any other position still sees the single occupant
        assert_eq!(store.floor(5).await.unwrap().unwrap().score, 100);
        assert_eq!(store.ceiling(5).await.unwrap().unwrap().score, 100);

        let empty = MemoryRingStore::new();
        assert!(empty.floor(1).await.unwrap().is_none());
        assert!(empty.ceiling(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_real_nodes_registry() {
        let store = MemoryRingStore::new();
        store.add_real_node("a", 5).await.unwrap();
        store.add_real_node("b", 10).await.unwrap();

        assert_eq!(store.real_node("a").await.unwrap(), Some(5));
        assert_eq!(store.real_node("zz").await.unwrap(), None);
        assert_eq!(store.real_nodes().await.unwrap().len(), 2);

        store.remove_real_node("a").await.unwrap();
        store.remove_real_node("a").await.unwrap();
        assert_eq!(store.real_node("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_data_sets() {
        let store = MemoryRingStore::new();
        let keys: HashSet<String> = ["k1", "k2", "k3"].iter().map(|s| s.to_string()).collect();
        store.add_data("a", &keys).await.unwrap();

        let gone: HashSet<String> = ["k2".to_string(), "missing".to_string()].into();
        store.remove_data("a", &gone).await.unwrap();

        let left = store.data("a").await.unwrap();
        assert_eq!(left.len(), 2);
        assert!(left.contains("k1") && left.contains("k3"));
        assert!(store.data("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_version_roundtrip() {
        let store = MemoryRingStore::new();
        store.set_version(41).await.unwrap();
        store.add_virtual_node(1, &vn("a", 1)).await.unwrap();
        assert_eq!(store.version().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_lock_unlock() {
        let store = MemoryRingStore::new();
        let token = store.lock(Duration::from_secs(5)).await.unwrap();
        assert!(store.is_locked());

        store.unlock(&token).await.unwrap();
        assert!(!store.is_locked());
        assert!(matches!(
            store.unlock(&token).await,
            Err(RingError::LockNotHeld)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_times_out_while_held() {
        let store = MemoryRingStore::new();
        store.lock(Duration::from_secs(60)).await.unwrap();

        let result = store.lock(Duration::from_secs(2)).await;
        assert!(matches!(result, Err(RingError::LockTimeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_taken_over_after_expiry() {
        let store = MemoryRingStore::new();
        store.lock(Duration::from_secs(1)).await.unwrap();

        // holder never unlocks; its lease runs out before our deadline
        store.lock(Duration::from_secs(5)).await.unwrap();
        assert!(store.is_locked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_holder_cannot_release_successor() {
        let store = MemoryRingStore::new();
        let stale = store.lock(Duration::from_secs(1)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        let current = store.lock(Duration::from_secs(30)).await.unwrap();

        assert!(matches!(
            store.unlock(&stale).await,
            Err(RingError::LockNotHeld)
        ));
        assert!(store.is_locked());
        assert!(matches!(
            store.lock(Duration::from_millis(1)).await,
            Err(RingError::LockTimeout(_))
        ));

        store.unlock(&current).await.unwrap();
        assert!(!store.is_locked());
    }

    #[tokio::test]
    async fn test_unlock_with_foreign_token() {
        let store = MemoryRingStore::new();
        let token = store.lock(Duration::from_secs(5)).await.unwrap();

        assert!(matches!(
            store.unlock(&LockToken::generate()).await,
            Err(RingError::LockNotHeld)
        ));
        assert!(store.is_locked());
        store.unlock(&token).await.unwrap();
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_unlock() {
        let store = Arc::new(MemoryRingStore::new());
        let token = store.lock(Duration::from_secs(30)).await.unwrap();

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.lock(Duration::from_secs(30)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.unlock(&token).await.unwrap();

        let acquired = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(acquired.is_ok());
    }
}
