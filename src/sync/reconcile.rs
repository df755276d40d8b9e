use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use futures_util::future::{join, join_all};
use log::{debug, error, info, warn};

use super::pair::SyncPair;
use crate::kv::{KvEntry, KvStore, PutMode};

/// Destination keys and values as of one index. Replaced wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestSnapshot {
    index: u64,
    entries: BTreeMap<String, Vec<u8>>,
}

impl DestSnapshot {
    pub fn new(entries: Vec<KvEntry>, index: u64) -> Self {
        Self {
            index,
            entries: entries
                .into_iter()
                .map(|entry| (entry.key, entry.value))
                .collect(),
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn value(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}

/// Writes the source watcher issued that its destination snapshot may not
/// show yet. `None` marks a delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingWrites {
    writes: BTreeMap<String, Option<Vec<u8>>>,
}

impl PendingWrites {
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Forgets every write `snapshot` already reflects.
    pub fn settle(&mut self, snapshot: &DestSnapshot) {
        self.writes.retain(|key, write| match write {
            Some(value) => snapshot.value(key) != Some(value.as_slice()),
            None => snapshot.contains(key),
        });
    }

    /// `snapshot` with the outstanding writes laid over it.
    pub fn overlay(&self, snapshot: &DestSnapshot) -> DestSnapshot {
        if self.writes.is_empty() {
            return snapshot.clone();
        }
        let mut view = snapshot.clone();
        for (key, write) in &self.writes {
            match write {
                Some(value) => {
                    view.entries.insert(key.clone(), value.clone());
                }
                None => {
                    view.entries.remove(key);
                }
            }
        }
        view
    }

    fn put(&mut self, key: &str, value: &[u8]) {
        self.writes.insert(key.to_string(), Some(value.to_vec()));
    }

    fn delete(&mut self, key: &str) {
        self.writes.insert(key.to_string(), None);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertKind {
    Create,
    Update,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upsert {
    pub key: String,
    pub value: Vec<u8>,
    pub kind: UpsertKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CyclePlan {
    pub deletes: Vec<String>,
    pub upserts: Vec<Upsert>,
    /// Seed entries whose destination already holds the same value.
    pub unchanged: usize,
}

impl CyclePlan {
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.upserts.is_empty()
    }
}

/// Outcome of one applied cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} deleted, {} failed",
            self.created, self.updated, self.deleted, self.failed
        )
    }
}

/// Computes the writes that bring the destination in line with `source`.
///
/// Every destination key with no counterpart in `source` is deleted. Source
/// entries are written when modified after `previous_index`. On a seed or
/// resync cycle (`previous_index == 0`) entries the destination already holds
/// with the same value are skipped; later cycles never trust the snapshot's
/// values, which can lag behind the destination.
pub fn plan_cycle(
    pair: &SyncPair,
    snapshot: &DestSnapshot,
    source: &[KvEntry],
    previous_index: u64,
) -> CyclePlan {
    let mut plan = CyclePlan::default();
    let mut mirrored = BTreeSet::new();
    for entry in source {
        let Some(key) = pair.destination_key(&entry.key) else {
            continue;
        };
        mirrored.insert(key.clone());
        if entry.modify_index <= previous_index {
            continue;
        }
        let kind = match snapshot.value(&key) {
            Some(current) if previous_index == 0 && current == entry.value.as_slice() => {
                plan.unchanged += 1;
                continue;
            }
            Some(_) => UpsertKind::Update,
            None => UpsertKind::Create,
        };
        plan.upserts.push(Upsert {
            key,
            value: entry.value.clone(),
            kind,
        });
    }
    plan.deletes = snapshot
        .keys()
        .filter(|key| !mirrored.contains(*key))
        .map(str::to_string)
        .collect();
    plan
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Applied {
    Created,
    Updated,
    Deleted,
    Failed,
}

/// Issues every call in `plan` concurrently and waits for all of them.
/// Successful writes are recorded in `pending`.
pub async fn apply_plan<S: KvStore + ?Sized>(
    store: &S,
    pair: &SyncPair,
    plan: CyclePlan,
    pending: &mut PendingWrites,
) -> CycleReport {
    if plan.unchanged > 0 {
        debug!("{pair}: {} entries already in sync", plan.unchanged);
    }
    let deletes = plan.deletes.iter().map(|key| async move {
        match store.delete(key).await {
            Ok(()) => {
                info!("{pair}: deleted {key}");
                Applied::Deleted
            }
            Err(err) => {
                error!("{pair}: delete {key}: {err}");
                Applied::Failed
            }
        }
    });
    let upserts = plan.upserts.iter().map(|upsert| async move {
        match store.put(&upsert.key, &upsert.value, PutMode::Plain).await {
            Ok(true) => match upsert.kind {
                UpsertKind::Create => {
                    info!("{pair}: created {}", upsert.key);
                    Applied::Created
                }
                UpsertKind::Update => {
                    info!("{pair}: updated {}", upsert.key);
                    Applied::Updated
                }
            },
            Ok(false) => {
                warn!("{pair}: put {} was rejected", upsert.key);
                Applied::Failed
            }
            Err(err) => {
                error!("{pair}: put {}: {err}", upsert.key);
                Applied::Failed
            }
        }
    });

    let (deleted, upserted) = join(join_all(deletes), join_all(upserts)).await;
    for (key, applied) in plan.deletes.iter().zip(&deleted) {
        if *applied == Applied::Deleted {
            pending.delete(key);
        }
    }
    for (upsert, applied) in plan.upserts.iter().zip(&upserted) {
        if *applied != Applied::Failed {
            pending.put(&upsert.key, &upsert.value);
        }
    }
    let mut report = CycleReport::default();
    for applied in deleted.into_iter().chain(upserted) {
        match applied {
            Applied::Created => report.created += 1,
            Applied::Updated => report.updated += 1,
            Applied::Deleted => report.deleted += 1,
            Applied::Failed => report.failed += 1,
        }
    }
    report
}
