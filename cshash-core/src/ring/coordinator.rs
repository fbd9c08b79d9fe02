//! Hash Ring Coordinator
//!
//! Node lifecycle (add, remove), key lookup and key assignment on top of a
//! [`RingStore`](crate::store::RingStore). Every operation runs under the
//! store's ring-wide lock, including plain lookups; the lock is released on
//! every exit path, cancellation included.

use super::encryptor::Encryptor;
use super::migration::{FailureHook, MigrationEngine, MigrationQueue, Migrator};
use super::vnode::VirtualNodeId;
use crate::config::RingOptions;
use crate::error::{RingError, RingResult};
use crate::metrics;
use crate::store::DynRingStore;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consistent hash ring coordinator
pub struct ConsistentHash {
    store: Arc<DynRingStore>,
    encryptor: Arc<dyn Encryptor>,
    migrator: Arc<dyn Migrator>,
    options: RingOptions,
    on_migration_failure: Option<FailureHook>,
}

impl ConsistentHash {
    /// Create a coordinator. Options are normalized (defaults and clamps).
    pub fn new(
        store: Arc<DynRingStore>,
        encryptor: Arc<dyn Encryptor>,
        migrator: Arc<dyn Migrator>,
        options: RingOptions,
    ) -> Self {
        Self {
            store,
            encryptor,
            migrator,
            options: options.normalized(),
            on_migration_failure: None,
        }
    }

    /// Observe migrator failures. They never fail the ring operation itself.
    pub fn with_failure_hook(mut self, hook: FailureHook) -> Self {
        self.on_migration_failure = Some(hook);
        self
    }

    pub fn options(&self) -> RingOptions {
        self.options
    }

    /// Add a real node with `weight` (clamped to [1, 10]) and place its
    /// virtual nodes, moving the affected keys onto it.
    pub async fn add_node(
        &self,
        cancel: &CancellationToken,
        name: &str,
        weight: i64,
    ) -> RingResult<()> {
        let start = Instant::now();
        let result = self
            .locked(cancel, async {
                let queue = self.place_node(name, weight).await?;
                let summary = queue
                    .run(
                        self.migrator.as_ref(),
                        cancel,
                        self.on_migration_failure.as_ref(),
                    )
                    .await;
                info!(
                    node = name,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    keys = summary.keys,
                    "node join migrations finished"
                );
                Ok(())
            })
            .await;

        observe("add_node", &result, start);
        result
    }

    /// Remove a real node, handing its keys back to the successors of each
    /// of its virtual nodes. Removing an unknown node is a no-op.
    pub async fn remove_node(&self, cancel: &CancellationToken, name: &str) -> RingResult<()> {
        let start = Instant::now();
        let result = self
            .locked(cancel, async {
                let queue = self.evict_node(name).await?;
                let summary = queue
                    .run(
                        self.migrator.as_ref(),
                        cancel,
                        self.on_migration_failure.as_ref(),
                    )
                    .await;
                info!(
                    node = name,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    keys = summary.keys,
                    "node leave migrations finished"
                );
                Ok(())
            })
            .await;

        observe("remove_node", &result, start);
        result
    }

    /// Resolve the real node owning `key`
    pub async fn get_node(&self, cancel: &CancellationToken, key: &str) -> RingResult<String> {
        let start = Instant::now();
        let result = self.locked(cancel, self.resolve(key)).await;

        observe("get_node", &result, start);
        result
    }

    /// Resolve the owner of `key` and record the key in its owned set
    pub async fn add_data_key_to_node(
        &self,
        cancel: &CancellationToken,
        key: &str,
    ) -> RingResult<String> {
        let start = Instant::now();
        let result = async {
            let node = self.get_node(cancel, key).await?;
            self.locked(cancel, async {
                let keys = HashSet::from([key.to_string()]);
                self.store.add_data(&node, &keys).await?;
                debug!(key, node = %node, "data key assigned");
                Ok(node)
            })
            .await
        }
        .await;

        observe("add_data_key", &result, start);
        result
    }

    /// Registered real nodes and their replica counts
    pub async fn real_nodes(&self, cancel: &CancellationToken) -> RingResult<HashMap<String, u32>> {
        self.locked(cancel, self.store.real_nodes()).await
    }

    /// Keys recorded as owned by `name`
    pub async fn owned_keys(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> RingResult<HashSet<String>> {
        self.locked(cancel, self.store.data(name)).await
    }

    /// Advisory ring version
    pub async fn version(&self, cancel: &CancellationToken) -> RingResult<i64> {
        self.locked(cancel, self.store.version()).await
    }

    async fn place_node(&self, name: &str, weight: i64) -> RingResult<MigrationQueue> {
        if name.is_empty() {
            return Err(RingError::InvalidVirtualNodeId(
                VirtualNodeId::new(name, 1).to_string(),
            ));
        }
        if self.store.real_node(name).await?.is_some() {
            return Err(RingError::NodeAlreadyExists(name.to_string()));
        }

        let replicas = self.options.replicas_for(weight);
        self.store.add_real_node(name, replicas).await?;

        let engine = MigrationEngine::new(self.store.as_ref(), self.encryptor.as_ref());
        let mut queue = MigrationQueue::new();
        for vnode in VirtualNodeId::all_of(name, replicas) {
            let score = self.encryptor.encrypt(&vnode.to_string());
            self.store.add_virtual_node(score, &vnode).await?;
            if let Some(task) = engine.migrate_in(score, &vnode).await? {
                queue.push(task);
            }
        }

        info!(
            node = name,
            weight,
            replicas,
            migrations = queue.len(),
            "node added to ring"
        );
        Ok(queue)
    }

    async fn evict_node(&self, name: &str) -> RingResult<MigrationQueue> {
        let Some(replicas) = self.store.real_node(name).await? else {
            debug!(node = name, "remove of unknown node ignored");
            return Ok(MigrationQueue::new());
        };

        self.store.remove_real_node(name).await?;

        let engine = MigrationEngine::new(self.store.as_ref(), self.encryptor.as_ref());
        let mut queue = MigrationQueue::new();
        for vnode in VirtualNodeId::all_of(name, replicas) {
            let score = self.encryptor.encrypt(&vnode.to_string());
            let task = engine.migrate_out(score, &vnode).await?;
            self.store.remove_virtual_node(score, &vnode).await?;
            if let Some(task) = task {
                queue.push(task);
            }
        }

        info!(
            node = name,
            replicas,
            migrations = queue.len(),
            "node removed from ring"
        );
        Ok(queue)
    }

    async fn resolve(&self, key: &str) -> RingResult<String> {
        let score = self.encryptor.encrypt(key);
        let vnode = self.store.find_virtual_node(score).await?.validated()?;
        Ok(vnode.node)
    }

    /// Run `op` while holding the ring lock. Lock acquisition is bounded by
    /// the configured expiry; both acquisition and `op` abort on `cancel`.
    async fn locked<T, F>(&self, cancel: &CancellationToken, op: F) -> RingResult<T>
    where
        F: Future<Output = RingResult<T>>,
    {
        let token = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RingError::Cancelled),
            acquired = self.store.lock(self.options.lock_expire()) => acquired?,
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RingError::Cancelled),
            result = op => result,
        };

        if let Err(err) = self.store.unlock(&token).await {
            warn!(error = %err, "failed to release ring lock");
        }
        result
    }
}

fn observe<T>(operation: &str, result: &RingResult<T>, start: Instant) {
    let status = match result {
        Ok(_) => "success",
        Err(err) => err.kind(),
    };
    metrics::record_ring_op(operation, status, start.elapsed().as_secs_f64());
}
