use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use consul_tools::config::SyncConfig;
use consul_tools::kv::memory::{Call, MemoryStore};
use consul_tools::kv::{Indexed, KvEntry, KvStore, PutMode, QueryOptions};
use consul_tools::sync::{CycleReport, SyncEngine, SyncPair, SyncReport};
use consul_tools::Result;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

fn fast_config() -> SyncConfig {
    SyncConfig {
        watch_wait: Duration::from_millis(500),
        restart_delay: Duration::from_millis(50),
    }
}

fn pair(spec: &str) -> SyncPair {
    spec.parse().expect("sync spec")
}

async fn next_report(reports: &mut mpsc::UnboundedReceiver<SyncReport>) -> SyncReport {
    timeout(Duration::from_secs(5), reports.recv())
        .await
        .expect("cycle in time")
        .expect("engine alive")
}

fn values(pairs: &[(&str, &str)]) -> BTreeMap<String, Vec<u8>> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
        .collect()
}

/// Delivers local-datacenter listings late, so the destination watcher
/// publishes snapshots that trail the real destination.
struct LaggingDestination {
    inner: Arc<MemoryStore>,
    lag: Duration,
}

#[async_trait]
impl KvStore for LaggingDestination {
    async fn get(&self, key: &str, opts: QueryOptions) -> Result<Indexed<Option<KvEntry>>> {
        self.inner.get(key, opts).await
    }

    async fn get_all(&self, prefix: &str, opts: QueryOptions) -> Result<Indexed<Vec<KvEntry>>> {
        let local = opts.datacenter.is_none();
        let listing = self.inner.get_all(prefix, opts).await;
        if local {
            sleep(self.lag).await;
        }
        listing
    }

    async fn put(&self, key: &str, value: &[u8], mode: PutMode) -> Result<bool> {
        self.inner.put(key, value, mode).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn create_session(&self, name: &str, ttl: Duration) -> Result<String> {
        self.inner.create_session(name, ttl).await
    }

    async fn renew_session(&self, id: &str) -> Result<()> {
        self.inner.renew_session(id).await
    }

    async fn destroy_session(&self, id: &str) -> Result<()> {
        self.inner.destroy_session(id).await
    }
}

fn lagging(store: &Arc<MemoryStore>) -> Arc<LaggingDestination> {
    Arc::new(LaggingDestination {
        inner: Arc::clone(store),
        lag: Duration::from_millis(400),
    })
}

fn two_datacenters() -> Arc<MemoryStore> {
    let store = MemoryStore::new("dc1").with_datacenter("dc2");
    store.put_in("dc2", "app/config/a", b"1").expect("seed");
    store.put_in("dc2", "app/config/b", b"2").expect("seed");
    store.put_in("dc1", "app/config/a", b"1").expect("seed");
    store.put_in("dc1", "app/config/c", b"3").expect("seed");
    Arc::new(store)
}

#[tokio::test]
async fn first_cycle_mirrors_remote_prefix() {
    let store = two_datacenters();
    let (tx, mut reports) = mpsc::unbounded_channel();
    let handle = SyncEngine::new(Arc::clone(&store), vec![pair("app/config/@dc2")], fast_config())
        .with_reports(tx)
        .spawn();
    assert_eq!(handle.watchers(), 2);

    let report = next_report(&mut reports).await;
    assert_eq!(
        report.cycle,
        CycleReport {
            created: 1,
            updated: 0,
            deleted: 1,
            failed: 0
        }
    );
    assert_eq!(
        store.values("dc1").expect("dc1"),
        values(&[("app/config/a", "1"), ("app/config/b", "2")])
    );
    let writes: Vec<String> = store
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::Put { key, .. } => Some(key),
            _ => None,
        })
        .collect();
    assert_eq!(writes, vec!["app/config/b".to_string()]);

    handle.shutdown().await;
}

#[tokio::test]
async fn later_changes_and_deletions_propagate() {
    let store = two_datacenters();
    let (tx, mut reports) = mpsc::unbounded_channel();
    let handle = SyncEngine::new(Arc::clone(&store), vec![pair("app/config/@dc2")], fast_config())
        .with_reports(tx)
        .spawn();
    next_report(&mut reports).await;

    store.put_in("dc2", "app/config/a", b"9").expect("update");
    let report = next_report(&mut reports).await;
    assert_eq!(report.cycle.updated, 1);
    assert_eq!(report.cycle.deleted, 0);

    store.delete_in("dc2", "app/config/b").expect("delete");
    let report = next_report(&mut reports).await;
    assert_eq!(
        report.cycle,
        CycleReport {
            created: 0,
            updated: 0,
            deleted: 1,
            failed: 0
        }
    );
    assert_eq!(
        store.values("dc1").expect("dc1"),
        values(&[("app/config/a", "9")])
    );

    handle.shutdown().await;
}

#[tokio::test]
async fn revert_reaches_destination_despite_stale_snapshot() {
    let store = Arc::new(MemoryStore::new("dc1").with_datacenter("dc2"));
    store.put_in("dc2", "app/k", b"X").expect("seed");
    store.put_in("dc1", "app/k", b"X").expect("seed");
    let (tx, mut reports) = mpsc::unbounded_channel();
    let handle = SyncEngine::new(lagging(&store), vec![pair("app/@dc2")], fast_config())
        .with_reports(tx)
        .spawn();
    assert_eq!(next_report(&mut reports).await.cycle, CycleReport::default());

    store.put_in("dc2", "app/k", b"Y").expect("change");
    assert_eq!(next_report(&mut reports).await.cycle.updated, 1);
    store.put_in("dc2", "app/k", b"X").expect("revert");
    assert_eq!(next_report(&mut reports).await.cycle.updated, 1);

    assert_eq!(store.values("dc1").expect("dc1"), values(&[("app/k", "X")]));
    handle.shutdown().await;
}

#[tokio::test]
async fn key_removed_before_snapshot_catches_up_is_deleted() {
    let store = Arc::new(MemoryStore::new("dc1").with_datacenter("dc2"));
    store.put_in("dc2", "app/keep", b"1").expect("seed");
    let (tx, mut reports) = mpsc::unbounded_channel();
    let handle = SyncEngine::new(lagging(&store), vec![pair("app/@dc2")], fast_config())
        .with_reports(tx)
        .spawn();
    assert_eq!(next_report(&mut reports).await.cycle.created, 1);

    store.put_in("dc2", "app/brief", b"2").expect("create");
    assert_eq!(next_report(&mut reports).await.cycle.created, 1);
    store.delete_in("dc2", "app/brief").expect("delete");
    let report = next_report(&mut reports).await;
    assert_eq!(
        report.cycle,
        CycleReport {
            created: 0,
            updated: 0,
            deleted: 1,
            failed: 0
        }
    );

    assert_eq!(store.values("dc1").expect("dc1"), values(&[("app/keep", "1")]));
    handle.shutdown().await;
}

#[tokio::test]
async fn failing_pair_does_not_stall_others() {
    let store = two_datacenters();
    let (tx, mut reports) = mpsc::unbounded_channel();
    let pairs = vec![pair("mirror/=app/config/@nowhere"), pair("app/config/@dc2")];
    let handle = SyncEngine::new(Arc::clone(&store), pairs, fast_config())
        .with_reports(tx)
        .spawn();

    let report = next_report(&mut reports).await;
    assert_eq!(report.pair, pair("app/config/@dc2"));
    assert_eq!(report.cycle.created, 1);

    // The broken pair keeps retrying on its own.
    sleep(Duration::from_millis(300)).await;
    let retries = store
        .calls()
        .into_iter()
        .filter(|call| {
            matches!(call, Call::GetAll { datacenter, .. } if datacenter == "nowhere")
        })
        .count();
    assert!(retries >= 2, "expected repeated attempts, saw {retries}");
    assert!(reports.try_recv().is_err());

    handle.shutdown().await;
}

#[tokio::test]
async fn unchanged_source_issues_no_writes() {
    let store = Arc::new(MemoryStore::new("dc1").with_datacenter("dc2"));
    store.put_in("dc2", "app/config/a", b"1").expect("seed");
    store.put_in("dc1", "app/config/a", b"1").expect("seed");
    let (tx, mut reports) = mpsc::unbounded_channel();
    let handle = SyncEngine::new(Arc::clone(&store), vec![pair("app/config/@dc2")], fast_config())
        .with_reports(tx)
        .spawn();

    assert_eq!(next_report(&mut reports).await.cycle, CycleReport::default());
    // Local writes outside the source prefix wake watchers but start no cycle.
    store.put_in("dc1", "unrelated", b"x").expect("write");
    sleep(Duration::from_millis(700)).await;
    assert!(reports.try_recv().is_err());
    assert!(!store
        .calls()
        .iter()
        .any(|call| matches!(call, Call::Put { .. } | Call::Delete { .. })));

    handle.shutdown().await;
}
