//! Runs every sync pair as two independent watchers.
//!
//! The destination watcher publishes a fresh [`DestSnapshot`] after every
//! change of the destination prefix. The source watcher waits for the first
//! snapshot, then reconciles on every change of the source prefix. Writes a
//! cycle issued are laid over later snapshots until the destination watcher
//! reports them, so back-to-back source changes never plan against a stale
//! view. A failing watcher is restarted on its own after a delay; nothing
//! else is affected.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::sleep;

use super::pair::SyncPair;
use super::reconcile::{apply_plan, plan_cycle, CycleReport, DestSnapshot, PendingWrites};
use crate::config::SyncConfig;
use crate::kv::KvStore;
use crate::watch::{Watch, WatchCursor};
use crate::{Error, Result};

type SnapshotRx = watch::Receiver<Option<Arc<DestSnapshot>>>;
type SnapshotTx = watch::Sender<Option<Arc<DestSnapshot>>>;

/// A finished reconciliation cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub pair: SyncPair,
    pub cycle: CycleReport,
}

pub struct SyncEngine<S: ?Sized> {
    store: Arc<S>,
    pairs: Vec<SyncPair>,
    config: SyncConfig,
    reports: Option<mpsc::UnboundedSender<SyncReport>>,
}

impl<S: KvStore + ?Sized + 'static> SyncEngine<S> {
    pub fn new(store: Arc<S>, pairs: Vec<SyncPair>, config: SyncConfig) -> Self {
        Self {
            store,
            pairs,
            config,
            reports: None,
        }
    }

    /// Sends a [`SyncReport`] after every cycle.
    pub fn with_reports(mut self, tx: mpsc::UnboundedSender<SyncReport>) -> Self {
        self.reports = Some(tx);
        self
    }

    /// Starts the watchers on the current runtime.
    pub fn spawn(self) -> SyncHandle {
        let mut tasks = JoinSet::new();
        for pair in self.pairs {
            if pair.is_identity() {
                warn!("{pair}: source and destination are the same keys, nothing to sync");
                continue;
            }
            info!("syncing {pair}");
            let (tx, rx) = watch::channel(None);
            tasks.spawn(watch_destination(
                Arc::clone(&self.store),
                pair.clone(),
                self.config.clone(),
                tx,
            ));
            tasks.spawn(watch_source(
                Arc::clone(&self.store),
                pair,
                self.config.clone(),
                rx,
                self.reports.clone(),
            ));
        }
        SyncHandle { tasks }
    }

    /// Runs until every watcher stops, which only happens on panic.
    pub async fn run(self) {
        self.spawn().join().await
    }
}

/// Running watchers. Dropping the handle aborts them.
pub struct SyncHandle {
    tasks: JoinSet<()>,
}

impl SyncHandle {
    pub fn watchers(&self) -> usize {
        self.tasks.len()
    }

    pub async fn join(mut self) {
        while let Some(result) = self.tasks.join_next().await {
            if let Err(err) = result {
                if err.is_panic() {
                    error!("sync watcher panicked: {err}");
                }
            }
        }
    }

    pub async fn shutdown(mut self) {
        self.tasks.shutdown().await;
    }
}

async fn watch_destination<S: KvStore + ?Sized>(
    store: Arc<S>,
    pair: SyncPair,
    config: SyncConfig,
    snapshots: SnapshotTx,
) {
    loop {
        let err = follow_destination(&*store, &pair, &config, &snapshots).await;
        error!(
            "{pair}: destination watch failed: {err}; restarting in {:?}",
            config.restart_delay
        );
        sleep(config.restart_delay).await;
    }
}

/// Only returns on error.
async fn follow_destination<S: KvStore + ?Sized>(
    store: &S,
    pair: &SyncPair,
    config: &SyncConfig,
    snapshots: &SnapshotTx,
) -> Error {
    let mut watch = Watch::new(WatchCursor::new(pair.destination.clone()), config.watch_wait);
    loop {
        let change = match watch
            .changed(|opts| store.get_all(&pair.destination, opts))
            .await
        {
            Ok(change) => change,
            Err(err) => return err,
        };
        let snapshot = DestSnapshot::new(change.value, change.index);
        debug!(
            "{pair}: destination at index {} holds {} keys",
            snapshot.index(),
            snapshot.len()
        );
        snapshots.send_replace(Some(Arc::new(snapshot)));
    }
}

async fn watch_source<S: KvStore + ?Sized>(
    store: Arc<S>,
    pair: SyncPair,
    config: SyncConfig,
    mut snapshots: SnapshotRx,
    reports: Option<mpsc::UnboundedSender<SyncReport>>,
) {
    loop {
        let result = follow_source(&*store, &pair, &config, &mut snapshots, reports.as_ref()).await;
        if let Err(err) = result {
            error!(
                "{pair}: source watch failed: {err}; restarting in {:?}",
                config.restart_delay
            );
        }
        sleep(config.restart_delay).await;
    }
}

async fn follow_source<S: KvStore + ?Sized>(
    store: &S,
    pair: &SyncPair,
    config: &SyncConfig,
    snapshots: &mut SnapshotRx,
    reports: Option<&mpsc::UnboundedSender<SyncReport>>,
) -> Result<()> {
    let mut watch = Watch::new(WatchCursor::new(pair.source_topic()), config.watch_wait);
    let mut pending = PendingWrites::default();
    loop {
        let change = watch
            .changed(|opts| {
                store.get_all(&pair.source, opts.in_datacenter(pair.datacenter.as_deref()))
            })
            .await?;
        let snapshot = seeded(snapshots).await?;
        pending.settle(&snapshot);
        if !pending.is_empty() {
            debug!(
                "{pair}: {} writes not yet seen at destination index {}",
                pending.len(),
                snapshot.index()
            );
        }
        let view = pending.overlay(&snapshot);
        let plan = plan_cycle(pair, &view, &change.value, change.previous_index);
        let cycle = apply_plan(store, pair, plan, &mut pending).await;
        info!("{pair}: index {}: {cycle}", change.index);
        if let Some(tx) = reports {
            let _ = tx.send(SyncReport {
                pair: pair.clone(),
                cycle,
            });
        }
    }
}

/// Latest destination snapshot, waiting for the first one if needed.
async fn seeded(snapshots: &mut SnapshotRx) -> Result<Arc<DestSnapshot>> {
    loop {
        let current = snapshots.borrow_and_update().clone();
        if let Some(snapshot) = current {
            return Ok(snapshot);
        }
        snapshots
            .changed()
            .await
            .map_err(|_| Error::Internal("destination watcher stopped"))?;
    }
}
