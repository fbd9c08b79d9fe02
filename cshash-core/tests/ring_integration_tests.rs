// Ring Integration Tests
// Node churn and key ownership through the public API

use async_trait::async_trait;
use cshash_core::{
    CancellationToken, ConsistentHash, Crc32Encryptor, MemoryRingStore, Migrator, NoopMigrator,
    RingError, RingOptions, metrics,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts moved keys per (from, to) pair
#[derive(Default)]
struct TallyMigrator {
    moved: parking_lot::Mutex<HashMap<(String, String), usize>>,
    calls: AtomicUsize,
}

#[async_trait]
impl Migrator for TallyMigrator {
    async fn migrate(
        &self,
        _cancel: &CancellationToken,
        keys: &HashSet<String>,
        from: &str,
        to: &str,
    ) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .moved
            .lock()
            .entry((from.to_string(), to.to_string()))
            .or_default() += keys.len();
        Ok(())
    }
}

fn new_ring(migrator: Arc<dyn Migrator>) -> ConsistentHash {
    ConsistentHash::new(
        Arc::new(MemoryRingStore::new()),
        Arc::new(Crc32Encryptor::new()),
        migrator,
        RingOptions::default(),
    )
}

#[tokio::test]
async fn test_keys_spread_over_weighted_nodes() {
    let cancel = CancellationToken::new();
    let ring = new_ring(Arc::new(NoopMigrator));

    ring.add_node(&cancel, "small", 1).await.unwrap();
    ring.add_node(&cancel, "large", 10).await.unwrap();

    let mut counts: HashMap<String, usize> = HashMap::new();
    for i in 0..2000 {
        let node = ring
            .add_data_key_to_node(&cancel, &format!("item:{}", i))
            .await
            .unwrap();
        *counts.entry(node).or_default() += 1;
    }

    assert_eq!(counts.values().sum::<usize>(), 2000);
    assert!(counts["large"] > counts.get("small").copied().unwrap_or(0));

    let nodes = ring.real_nodes(&cancel).await.unwrap();
    assert_eq!(nodes["small"], 5);
    assert_eq!(nodes["large"], 50);
}

#[tokio::test]
async fn test_join_moves_keys_only_to_new_node() {
    let cancel = CancellationToken::new();
    let tally = Arc::new(TallyMigrator::default());
    let ring = new_ring(tally.clone());

    for name in ["n1", "n2", "n3"] {
        ring.add_node(&cancel, name, 2).await.unwrap();
    }
    let keys: Vec<String> = (0..1000).map(|i| format!("doc-{}", i)).collect();
    let mut before = HashMap::new();
    for key in &keys {
        before.insert(key.clone(), ring.add_data_key_to_node(&cancel, key).await.unwrap());
    }
    tally.moved.lock().clear();

    ring.add_node(&cancel, "n4", 2).await.unwrap();

    let mut changed = 0;
    for key in &keys {
        let now = ring.get_node(&cancel, key).await.unwrap();
        if now != before[key] {
            assert_eq!(now, "n4", "{key} moved between existing nodes");
            changed += 1;
        }
    }
    assert!(changed > 0);

    let moved = tally.moved.lock();
    assert!(moved.keys().all(|(_, to)| to == "n4"));
    assert_eq!(moved.values().sum::<usize>(), changed);
    assert_eq!(
        ring.owned_keys(&cancel, "n4").await.unwrap().len(),
        changed
    );
}

#[tokio::test]
async fn test_leave_hands_every_key_back() {
    let cancel = CancellationToken::new();
    let tally = Arc::new(TallyMigrator::default());
    let ring = new_ring(tally.clone());

    ring.add_node(&cancel, "keep", 3).await.unwrap();
    ring.add_node(&cancel, "drop", 3).await.unwrap();
    for i in 0..500 {
        ring.add_data_key_to_node(&cancel, &format!("k{}", i))
            .await
            .unwrap();
    }
    let dropped = ring.owned_keys(&cancel, "drop").await.unwrap().len();
    assert!(dropped > 0);

    ring.remove_node(&cancel, "drop").await.unwrap();

    assert!(ring.owned_keys(&cancel, "drop").await.unwrap().is_empty());
    assert_eq!(ring.owned_keys(&cancel, "keep").await.unwrap().len(), 500);
    assert_eq!(
        tally.moved.lock()[&("drop".to_string(), "keep".to_string())],
        dropped
    );
    for i in 0..500 {
        assert_eq!(
            ring.get_node(&cancel, &format!("k{}", i)).await.unwrap(),
            "keep"
        );
    }
}

#[tokio::test]
async fn test_errors_surface_through_public_api() {
    let cancel = CancellationToken::new();
    let ring = new_ring(Arc::new(NoopMigrator));

    assert!(matches!(
        ring.get_node(&cancel, "nothing").await,
        Err(RingError::VirtualNodeNotFound(_))
    ));

    ring.add_node(&cancel, "a", 1).await.unwrap();
    let err = ring.add_node(&cancel, "a", 1).await.unwrap_err();
    assert_eq!(err.kind(), "node_exists");
    assert_eq!(err.to_string(), "Node already exists: a");
}

#[tokio::test]
async fn test_ring_operations_are_metered() {
    let cancel = CancellationToken::new();
    let ring = new_ring(Arc::new(NoopMigrator));

    ring.add_node(&cancel, "metered", 1).await.unwrap();
    ring.get_node(&cancel, "some-key").await.unwrap();

    let text = metrics::encode_metrics().unwrap();
    assert!(text.contains("cshash_ring_operations_total"));
    assert!(text.contains("operation=\"add_node\""));
    assert!(text.contains("operation=\"get_node\""));
}
