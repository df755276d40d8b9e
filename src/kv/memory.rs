//! In-process store with Consul semantics.
//!
//! Keeps per-datacenter raft-style indices, tombstones for deleted keys,
//! TTL sessions that release their locks when invalidated, and blocking
//! reads that wake on any write. Failures can be injected per operation and
//! every call is recorded so tests can assert on the exact traffic a
//! component produced.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};

use super::{Indexed, KvEntry, KvStore, PutMode, QueryOptions};
use crate::{Error, Result};

/// Store operations failures can be injected into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Get,
    GetAll,
    Put,
    Delete,
    CreateSession,
    RenewSession,
    DestroySession,
}

/// A call as the store received it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Get { key: String, index: u64 },
    GetAll { prefix: String, datacenter: String, index: u64 },
    Put { key: String, mode: PutMode },
    Delete { key: String },
    CreateSession { name: String, id: Option<String> },
    RenewSession { id: String },
    DestroySession { id: String },
}

#[derive(Default)]
struct Datacenter {
    index: u64,
    entries: BTreeMap<String, KvEntry>,
    tombstones: BTreeMap<String, u64>,
}

impl Datacenter {
    fn bump(&mut self) -> u64 {
        self.index += 1;
        self.index
    }

    fn key_index(&self, key: &str) -> u64 {
        self.entries
            .get(key)
            .map(|entry| entry.modify_index)
            .or_else(|| self.tombstones.get(key).copied())
            .unwrap_or(self.index)
            .max(1)
    }

    fn prefix_index(&self, prefix: &str) -> u64 {
        let live = self
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, entry)| entry.modify_index);
        let dead = self
            .tombstones
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, index)| *index);
        live.chain(dead).max().unwrap_or(self.index).max(1)
    }

    fn write(&mut self, key: &str, value: &[u8], session: Option<String>, lock_taken: bool) {
        let index = self.bump();
        self.tombstones.remove(key);
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| KvEntry {
            key: key.to_string(),
            value: Vec::new(),
            create_index: index,
            modify_index: index,
            lock_index: 0,
            session: None,
        });
        entry.value = value.to_vec();
        entry.modify_index = index;
        entry.session = session;
        if lock_taken {
            entry.lock_index += 1;
        }
    }

    fn remove(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            let index = self.bump();
            self.tombstones.insert(key.to_string(), index);
        }
    }
}

struct SessionRecord {
    ttl: Duration,
    expires: Instant,
}

struct Inner {
    local: String,
    datacenters: HashMap<String, Datacenter>,
    sessions: HashMap<String, SessionRecord>,
    next_session: u64,
    faults: HashMap<Operation, u32>,
    calls: Vec<Call>,
}

impl Inner {
    fn datacenter(&self, name: Option<&str>) -> Result<&Datacenter> {
        let name = name.unwrap_or(&self.local);
        self.datacenters
            .get(name)
            .ok_or_else(|| Error::UnknownDatacenter(name.to_string()))
    }

    fn local_mut(&mut self) -> Result<&mut Datacenter> {
        self.datacenters
            .get_mut(&self.local)
            .ok_or(Error::Internal("local datacenter missing"))
    }

    fn check_fault(&mut self, op: Operation) -> Result<()> {
        match self.faults.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(Error::Status {
                    status: 500,
                    body: format!("injected {op:?} failure"),
                })
            }
            _ => Ok(()),
        }
    }

    fn expire_sessions(&mut self) -> Result<()> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, record)| record.expires <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.invalidate(&id)?;
        }
        Ok(())
    }

    /// Drops a session and releases every key it holds.
    fn invalidate(&mut self, id: &str) -> Result<bool> {
        if self.sessions.remove(id).is_none() {
            return Ok(false);
        }
        let dc = self.local_mut()?;
        let held: Vec<String> = dc
            .entries
            .values()
            .filter(|entry| entry.held_by(id))
            .map(|entry| entry.key.clone())
            .collect();
        if !held.is_empty() {
            let index = dc.bump();
            for key in held {
                if let Some(entry) = dc.entries.get_mut(&key) {
                    entry.session = None;
                    entry.modify_index = index;
                }
            }
        }
        Ok(true)
    }
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    changes: watch::Sender<u64>,
}

impl MemoryStore {
    /// Creates a store whose local datacenter is `local`.
    pub fn new(local: &str) -> Self {
        let mut datacenters = HashMap::new();
        datacenters.insert(local.to_string(), Datacenter::default());
        let (changes, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner {
                local: local.to_string(),
                datacenters,
                sessions: HashMap::new(),
                next_session: 0,
                faults: HashMap::new(),
                calls: Vec::new(),
            }),
            changes,
        }
    }

    /// Adds a remote datacenter reachable through `QueryOptions::datacenter`.
    pub fn with_datacenter(self, name: &str) -> Self {
        if let Ok(mut inner) = self.inner.lock() {
            inner.datacenters.entry(name.to_string()).or_default();
        }
        self
    }

    /// Makes the next `times` calls of `op` fail with a server error.
    pub fn fail_next(&self, op: Operation, times: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            *inner.faults.entry(op).or_insert(0) += times;
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner
            .lock()
            .map(|inner| inner.calls.clone())
            .unwrap_or_default()
    }

    /// Writes directly into any datacenter, bypassing call recording.
    pub fn put_in(&self, datacenter: &str, key: &str, value: &[u8]) -> Result<()> {
        {
            let mut inner = self.lock()?;
            let dc = inner
                .datacenters
                .get_mut(datacenter)
                .ok_or_else(|| Error::UnknownDatacenter(datacenter.to_string()))?;
            let session = dc.entries.get(key).and_then(|entry| entry.session.clone());
            dc.write(key, value, session, false);
        }
        self.notify();
        Ok(())
    }

    /// Deletes directly from any datacenter, bypassing call recording.
    pub fn delete_in(&self, datacenter: &str, key: &str) -> Result<()> {
        {
            let mut inner = self.lock()?;
            let dc = inner
                .datacenters
                .get_mut(datacenter)
                .ok_or_else(|| Error::UnknownDatacenter(datacenter.to_string()))?;
            dc.remove(key);
        }
        self.notify();
        Ok(())
    }

    /// Current key/value pairs of a datacenter.
    pub fn values(&self, datacenter: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        let inner = self.lock()?;
        let dc = inner.datacenter(Some(datacenter))?;
        Ok(dc
            .entries
            .values()
            .map(|entry| (entry.key.clone(), entry.value.clone()))
            .collect())
    }

    /// Ids of sessions that are still alive.
    pub fn live_sessions(&self) -> Result<Vec<String>> {
        let mut inner = self.lock()?;
        inner.expire_sessions()?;
        let mut ids: Vec<String> = inner.sessions.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Internal("memory store lock poisoned"))
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    /// Runs `op` under the lock after recording the call and applying faults.
    fn mutate<T>(
        &self,
        call: Call,
        fault: Operation,
        op: impl FnOnce(&mut Inner) -> Result<T>,
    ) -> Result<T> {
        let result = {
            let mut inner = self.lock()?;
            inner.calls.push(call);
            inner.check_fault(fault)?;
            inner.expire_sessions()?;
            op(&mut inner)
        };
        self.notify();
        result
    }

    async fn blocking_read<T>(
        &self,
        call: Call,
        fault: Operation,
        opts: &QueryOptions,
        mut read: impl FnMut(&Datacenter) -> T,
        index_of: impl Fn(&Datacenter) -> u64,
    ) -> Result<Indexed<T>> {
        {
            let mut inner = self.lock()?;
            inner.calls.push(call);
            inner.check_fault(fault)?;
        }
        let mut changes = self.changes.subscribe();
        let deadline = opts.wait.map(|wait| Instant::now() + wait);
        let mut timed_out = false;
        loop {
            let current = {
                let mut inner = self.lock()?;
                inner.expire_sessions()?;
                let dc = inner.datacenter(opts.datacenter.as_deref())?;
                Indexed::new(read(dc), index_of(dc))
            };
            if opts.index == 0 || current.index > opts.index || timed_out {
                return Ok(current);
            }
            let Some(deadline) = deadline else {
                return Ok(current);
            };
            match timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => {}
                _ => timed_out = true,
            }
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str, opts: QueryOptions) -> Result<Indexed<Option<KvEntry>>> {
        let call = Call::Get {
            key: key.to_string(),
            index: opts.index,
        };
        self.blocking_read(
            call,
            Operation::Get,
            &opts,
            |dc| dc.entries.get(key).cloned(),
            |dc| dc.key_index(key),
        )
        .await
    }

    async fn get_all(&self, prefix: &str, opts: QueryOptions) -> Result<Indexed<Vec<KvEntry>>> {
        let datacenter = match &opts.datacenter {
            Some(dc) => dc.clone(),
            None => self.lock()?.local.clone(),
        };
        let call = Call::GetAll {
            prefix: prefix.to_string(),
            datacenter,
            index: opts.index,
        };
        self.blocking_read(
            call,
            Operation::GetAll,
            &opts,
            |dc| {
                dc.entries
                    .range(prefix.to_string()..)
                    .take_while(|(key, _)| key.starts_with(prefix))
                    .map(|(_, entry)| entry.clone())
                    .collect()
            },
            |dc| dc.prefix_index(prefix),
        )
        .await
    }

    async fn put(&self, key: &str, value: &[u8], mode: PutMode) -> Result<bool> {
        let call = Call::Put {
            key: key.to_string(),
            mode: mode.clone(),
        };
        self.mutate(call, Operation::Put, |inner| {
            if let PutMode::Acquire(session) = &mode {
                if !inner.sessions.contains_key(session) {
                    return Err(Error::Status {
                        status: 500,
                        body: format!("invalid session \"{session}\""),
                    });
                }
            }
            let dc = inner.local_mut()?;
            let current = dc.entries.get(key).and_then(|entry| entry.session.clone());
            match mode {
                PutMode::Plain => dc.write(key, value, current, false),
                PutMode::Acquire(session) => match current {
                    Some(owner) if owner != session => return Ok(false),
                    Some(_) => dc.write(key, value, Some(session), false),
                    None => dc.write(key, value, Some(session), true),
                },
                PutMode::Release(session) => {
                    if current.as_deref() != Some(session.as_str()) {
                        return Ok(false);
                    }
                    dc.write(key, value, None, false);
                }
            }
            Ok(true)
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let call = Call::Delete {
            key: key.to_string(),
        };
        self.mutate(call, Operation::Delete, |inner| {
            inner.local_mut()?.remove(key);
            Ok(())
        })
    }

    async fn create_session(&self, name: &str, ttl: Duration) -> Result<String> {
        let result = {
            let mut inner = self.lock()?;
            match inner.check_fault(Operation::CreateSession) {
                Ok(()) => {
                    inner.next_session += 1;
                    let n = inner.next_session;
                    let id = format!("{n:08x}-0000-4000-8000-{n:012x}");
                    inner.sessions.insert(
                        id.clone(),
                        SessionRecord {
                            ttl,
                            expires: Instant::now() + ttl,
                        },
                    );
                    inner.local_mut()?.bump();
                    inner.calls.push(Call::CreateSession {
                        name: name.to_string(),
                        id: Some(id.clone()),
                    });
                    Ok(id)
                }
                Err(err) => {
                    inner.calls.push(Call::CreateSession {
                        name: name.to_string(),
                        id: None,
                    });
                    Err(err)
                }
            }
        };
        self.notify();
        result
    }

    async fn renew_session(&self, id: &str) -> Result<()> {
        let call = Call::RenewSession { id: id.to_string() };
        self.mutate(call, Operation::RenewSession, |inner| {
            match inner.sessions.get_mut(id) {
                Some(record) => {
                    record.expires = Instant::now() + record.ttl;
                    Ok(())
                }
                None => Err(Error::SessionNotFound(id.to_string())),
            }
        })
    }

    async fn destroy_session(&self, id: &str) -> Result<()> {
        let call = Call::DestroySession { id: id.to_string() };
        self.mutate(call, Operation::DestroySession, |inner| {
            inner.invalidate(id)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn acquire_is_exclusive_until_release() {
        let store = MemoryStore::new("dc1");
        let a = store.create_session("lock", TTL).await.expect("session a");
        let b = store.create_session("lock", TTL).await.expect("session b");

        assert!(store.put("k", b"", PutMode::Acquire(a.clone())).await.expect("acquire a"));
        assert!(!store.put("k", b"", PutMode::Acquire(b.clone())).await.expect("acquire b"));
        assert!(store.put("k", b"", PutMode::Acquire(a.clone())).await.expect("re-acquire a"));
        assert!(!store.put("k", b"", PutMode::Release(b.clone())).await.expect("release b"));
        assert!(store.put("k", b"", PutMode::Release(a)).await.expect("release a"));
        assert!(store.put("k", b"", PutMode::Acquire(b.clone())).await.expect("acquire b"));

        let entry = store
            .get("k", QueryOptions::default())
            .await
            .expect("get")
            .value
            .expect("entry");
        assert!(entry.held_by(&b));
        assert_eq!(entry.lock_index, 2);
    }

    #[tokio::test]
    async fn destroy_releases_held_keys() {
        let store = MemoryStore::new("dc1");
        let id = store.create_session("lock", TTL).await.expect("session");
        assert!(store.put("k", b"", PutMode::Acquire(id.clone())).await.expect("acquire"));
        store.destroy_session(&id).await.expect("destroy");

        let entry = store.get("k", QueryOptions::default()).await.expect("get");
        assert_eq!(entry.value.expect("entry").session, None);
        assert!(store.live_sessions().expect("sessions").is_empty());
    }

    #[tokio::test]
    async fn acquire_with_unknown_session_errors() {
        let store = MemoryStore::new("dc1");
        let err = store
            .put("k", b"", PutMode::Acquire("nope".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Status { status: 500, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_read_times_out_with_same_index() {
        let store = MemoryStore::new("dc1");
        store.put("k", b"v", PutMode::Plain).await.expect("put");
        let first = store.get("k", QueryOptions::default()).await.expect("seed");

        let again = store
            .get("k", QueryOptions::blocking(first.index, Duration::from_secs(30)))
            .await
            .expect("blocking");
        assert_eq!(again.index, first.index);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_read_wakes_on_write() {
        let store = std::sync::Arc::new(MemoryStore::new("dc1"));
        store.put("app/a", b"1", PutMode::Plain).await.expect("put");
        let seed = store
            .get_all("app/", QueryOptions::default())
            .await
            .expect("seed");

        let writer = std::sync::Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            writer.put("app/b", b"2", PutMode::Plain).await.expect("put b");
        });

        let next = store
            .get_all("app/", QueryOptions::blocking(seed.index, Duration::from_secs(30)))
            .await
            .expect("blocking");
        assert!(next.index > seed.index);
        assert_eq!(next.value.len(), 2);
    }

    #[tokio::test]
    async fn deletes_advance_prefix_index() {
        let store = MemoryStore::new("dc1");
        store.put("app/a", b"1", PutMode::Plain).await.expect("put");
        let before = store.get_all("app/", QueryOptions::default()).await.expect("get");
        store.delete("app/a").await.expect("delete");
        let after = store.get_all("app/", QueryOptions::default()).await.expect("get");
        assert!(after.value.is_empty());
        assert!(after.index > before.index);
    }

    #[tokio::test]
    async fn remote_datacenters_are_isolated() {
        let store = MemoryStore::new("dc1").with_datacenter("dc2");
        store.put_in("dc2", "app/a", b"1").expect("seed dc2");

        let local = store.get_all("app/", QueryOptions::default()).await.expect("dc1");
        assert!(local.value.is_empty());
        let remote = store
            .get_all("app/", QueryOptions::default().in_datacenter(Some("dc2")))
            .await
            .expect("dc2");
        assert_eq!(remote.value.len(), 1);

        let err = store
            .get_all("app/", QueryOptions::default().in_datacenter(Some("dc9")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownDatacenter(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_expire_without_renewal() {
        let store = MemoryStore::new("dc1");
        let id = store.create_session("lock", TTL).await.expect("session");
        tokio::time::advance(Duration::from_secs(6)).await;
        store.renew_session(&id).await.expect("renew");
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.live_sessions().expect("sessions"), vec![id.clone()]);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(store.live_sessions().expect("sessions").is_empty());
        let err = store.renew_session(&id).await.unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn injected_faults_are_consumed() {
        let store = MemoryStore::new("dc1");
        store.fail_next(Operation::Delete, 1);
        assert!(store.delete("k").await.is_err());
        assert!(store.delete("k").await.is_ok());
        assert_eq!(store.calls().len(), 2);
    }
}
