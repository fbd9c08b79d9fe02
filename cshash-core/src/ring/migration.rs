//! Migration Engine - minimal key relocation on ring changes
//!
//! When a virtual node appears at score `s`, the keys in `(floor(s), s]`
//! stop belonging to the successor's real node and start belonging to the
//! new one. Removal is the inverse: the same interval falls back to the
//! successor. The engine computes that interval, moves the owned-key
//! records in the store and emits one [`MigrationTask`] per affected virtual
//! node for the caller's [`Migrator`].
//!
//! Scores occupied by more than one real node (hash collisions) are
//! contested and never migrate automatically.

use super::encryptor::Encryptor;
use super::score::{Score, ScoreInterval};
use super::vnode::VirtualNodeId;
use crate::error::RingResult;
use crate::metrics;
use crate::store::{DynRingStore, RingEntry};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Relocates application data between real nodes.
///
/// Failures are logged, counted and handed to the coordinator's failure
/// hook, but never abort the ring change that produced the task.
#[async_trait]
pub trait Migrator: Send + Sync {
    async fn migrate(
        &self,
        cancel: &CancellationToken,
        keys: &HashSet<String>,
        from: &str,
        to: &str,
    ) -> anyhow::Result<()>;
}

/// Migrator that does nothing (ownership records only)
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMigrator;

#[async_trait]
impl Migrator for NoopMigrator {
    async fn migrate(
        &self,
        _cancel: &CancellationToken,
        _keys: &HashSet<String>,
        _from: &str,
        _to: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Called with every task whose migrator call failed
pub type FailureHook = Arc<dyn Fn(&MigrationTask, &anyhow::Error) + Send + Sync>;

/// Keys that changed owner because of one virtual node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationTask {
    /// Virtual node whose insertion or removal caused the move
    pub vnode: VirtualNodeId,
    /// Scores whose ownership changed
    pub interval: ScoreInterval,
    pub keys: HashSet<String>,
    pub from: String,
    pub to: String,
}

/// Outcome of running a [`MigrationQueue`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub keys: usize,
}

/// Ordered relocation tasks of one structural ring change.
///
/// Tasks run strictly in insertion order, one at a time: a later task may
/// read keys that an earlier task moved onto the same real node.
#[derive(Debug, Default)]
pub struct MigrationQueue {
    tasks: Vec<MigrationTask>,
}

impl MigrationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: MigrationTask) {
        self.tasks.push(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[MigrationTask] {
        &self.tasks
    }

    /// Run every task in order. Failures are swallowed; remaining tasks
    /// still run.
    pub async fn run(
        self,
        migrator: &dyn Migrator,
        cancel: &CancellationToken,
        on_failure: Option<&FailureHook>,
    ) -> MigrationSummary {
        let mut summary = MigrationSummary::default();

        for task in &self.tasks {
            match migrator.migrate(cancel, &task.keys, &task.from, &task.to).await {
                Ok(()) => {
                    summary.succeeded += 1;
                    summary.keys += task.keys.len();
                    metrics::record_migration_task("success", task.keys.len());
                }
                Err(err) => {
                    summary.failed += 1;
                    metrics::record_migration_task("failure", task.keys.len());
                    warn!(
                        vnode = %task.vnode,
                        from = %task.from,
                        to = %task.to,
                        keys = task.keys.len(),
                        error = %err,
                        "migration task failed"
                    );
                    if let Some(hook) = on_failure {
                        hook(task, &err);
                    }
                }
            }
        }

        if !self.tasks.is_empty() {
            info!(
                succeeded = summary.succeeded,
                failed = summary.failed,
                keys = summary.keys,
                "migration batch finished"
            );
        }
        summary
    }
}

/// Interval whose ownership depends on one virtual node, and the real node
/// on the other side of it
#[derive(Debug)]
struct AffectedRange {
    interval: ScoreInterval,
    successor: RingEntry,
}

/// Computes and applies ownership moves for single virtual node changes
pub struct MigrationEngine<'a> {
    store: &'a DynRingStore,
    encryptor: &'a dyn Encryptor,
}

impl<'a> MigrationEngine<'a> {
    pub fn new(store: &'a DynRingStore, encryptor: &'a dyn Encryptor) -> Self {
        Self { store, encryptor }
    }

    /// Run right after `vnode` was inserted at `score`: keys in the changed
    /// interval move from the successor's real node to `vnode`'s.
    pub async fn migrate_in(
        &self,
        score: Score,
        vnode: &VirtualNodeId,
    ) -> RingResult<Option<MigrationTask>> {
        let Some(range) = self.affected_range(score, vnode).await? else {
            return Ok(None);
        };

        let from = range.successor.node().to_string();
        let to = vnode.node().to_string();
        let keys = self.keys_in(&from, &range.interval).await?;

        self.apply(vnode, range.interval, keys, from, to).await
    }

    /// Run right before `vnode` is removed from `score`: its keys in the
    /// changed interval fall back to the successor's real node.
    pub async fn migrate_out(
        &self,
        score: Score,
        vnode: &VirtualNodeId,
    ) -> RingResult<Option<MigrationTask>> {
        let Some(range) = self.affected_range(score, vnode).await? else {
            return Ok(None);
        };

        let from = vnode.node().to_string();
        let to = range.successor.node().to_string();
        let keys = self.keys_in(&from, &range.interval).await?;

        self.apply(vnode, range.interval, keys, from, to).await
    }

    async fn affected_range(
        &self,
        score: Score,
        vnode: &VirtualNodeId,
    ) -> RingResult<Option<AffectedRange>> {
        let occupants = self.store.virtual_nodes(score).await?;
        if is_contested(&occupants) {
            debug!(score, vnode = %vnode, occupants = occupants.len(), "contested score, skipping migration");
            return Ok(None);
        }

        let Some(successor) = self.store.ceiling(score).await? else {
            return Ok(None);
        };
        if successor.node() == vnode.node() {
            return Ok(None);
        }

        let Some(predecessor) = self.store.floor(score).await? else {
            return Ok(None);
        };

        Ok(Some(AffectedRange {
            interval: ScoreInterval::new(predecessor.score, score),
            successor,
        }))
    }

    async fn keys_in(&self, node: &str, interval: &ScoreInterval) -> RingResult<HashSet<String>> {
        let owned = self.store.data(node).await?;
        Ok(owned
            .into_iter()
            .filter(|key| interval.contains(self.encryptor.encrypt(key)))
            .collect())
    }

    async fn apply(
        &self,
        vnode: &VirtualNodeId,
        interval: ScoreInterval,
        keys: HashSet<String>,
        from: String,
        to: String,
    ) -> RingResult<Option<MigrationTask>> {
        if keys.is_empty() {
            debug!(vnode = %vnode, %interval, %from, %to, "no keys in changed interval");
            return Ok(None);
        }

        self.store.remove_data(&from, &keys).await?;
        self.store.add_data(&to, &keys).await?;

        debug!(vnode = %vnode, %interval, %from, %to, keys = keys.len(), "ownership moved");
        Ok(Some(MigrationTask {
            vnode: vnode.clone(),
            interval,
            keys,
            from,
            to,
        }))
    }
}

/// A score is contested when its occupants belong to more than one real node
fn is_contested(occupants: &[VirtualNodeId]) -> bool {
    occupants
        .split_first()
        .is_some_and(|(first, rest)| rest.iter().any(|id| id.node() != first.node()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_contested() {
        let a1 = VirtualNodeId::new("a", 1);
        let a2 = VirtualNodeId::new("a", 2);
        let b1 = VirtualNodeId::new("b", 1);

        assert!(!is_contested(&[]));
        assert!(!is_contested(std::slice::from_ref(&a1)));
        assert!(!is_contested(&[a1.clone(), a2]));
        assert!(is_contested(&[a1, b1]));
    }

    #[test]
    fn test_queue_preserves_order() {
        let mut queue = MigrationQueue::new();
        for replica in 1..=3 {
            queue.push(MigrationTask {
                vnode: VirtualNodeId::new("b", replica),
                interval: ScoreInterval::new(0, 10),
                keys: HashSet::from(["k".to_string()]),
                from: "a".to_string(),
                to: "b".to_string(),
            });
        }

        let order: Vec<u32> = queue.tasks().iter().map(|t| t.vnode.replica).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(queue.len(), 3);
    }

    /// Refuses every relocation towards `to == "full"`
    struct PickyMigrator;

    #[async_trait]
    impl Migrator for PickyMigrator {
        async fn migrate(
            &self,
            _cancel: &CancellationToken,
            _keys: &HashSet<String>,
            _from: &str,
            to: &str,
        ) -> anyhow::Result<()> {
            if to == "full" {
                anyhow::bail!("{} has no room", to);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_summarizes_outcomes() {
        let mut queue = MigrationQueue::new();
        for (replica, to, keys) in [(1, "b", 2), (2, "full", 5), (3, "b", 1)] {
            queue.push(MigrationTask {
                vnode: VirtualNodeId::new(to, replica),
                interval: ScoreInterval::new(0, 10),
                keys: (0..keys).map(|i| format!("k{}-{}", replica, i)).collect(),
                from: "a".to_string(),
                to: to.to_string(),
            });
        }

        let summary = queue
            .run(&PickyMigrator, &CancellationToken::new(), None)
            .await;

        assert_eq!(
            summary,
            MigrationSummary {
                succeeded: 2,
                failed: 1,
                keys: 3,
            }
        );
    }
}
