//! Key-value store contract.
//!
//! Everything the lock and sync tools need from the store goes through
//! [`KvStore`]. `consul::ConsulClient` talks to a real agent over HTTP,
//! `memory::MemoryStore` (feature `testing`) keeps the same semantics in
//! process.

use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

#[cfg(feature = "consul")]
pub mod consul;
#[cfg(any(test, feature = "testing"))]
pub mod memory;

/// A single key as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub create_index: u64,
    pub modify_index: u64,
    pub lock_index: u64,
    /// Session currently holding the key, if any.
    pub session: Option<String>,
}

impl KvEntry {
    /// True when `session` is the live owner. Absent and empty owners never match.
    pub fn held_by(&self, session: &str) -> bool {
        owned_by(self.session.as_deref(), session)
    }
}

/// Ownership check shared by every caller comparing a lock owner.
pub fn owned_by(owner: Option<&str>, session: &str) -> bool {
    match owner {
        Some(owner) => !owner.is_empty() && owner == session,
        None => false,
    }
}

/// A read result paired with the index the store reported for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indexed<T> {
    pub value: T,
    pub index: u64,
}

impl<T> Indexed<T> {
    pub fn new(value: T, index: u64) -> Self {
        Self { value, index }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Indexed<U> {
        Indexed {
            value: f(self.value),
            index: self.index,
        }
    }
}

/// Read options. `index == 0` never blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub index: u64,
    pub wait: Option<Duration>,
    pub datacenter: Option<String>,
}

impl QueryOptions {
    pub fn blocking(index: u64, wait: Duration) -> Self {
        Self {
            index,
            wait: Some(wait),
            datacenter: None,
        }
    }

    pub fn in_datacenter(mut self, datacenter: Option<&str>) -> Self {
        self.datacenter = datacenter.map(str::to_string);
        self
    }
}

/// Flavour of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutMode {
    Plain,
    /// Succeeds only if the key is unlocked or already held by this session.
    Acquire(String),
    /// Succeeds only if the key is held by this session.
    Release(String),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str, opts: QueryOptions) -> Result<Indexed<Option<KvEntry>>>;

    async fn get_all(&self, prefix: &str, opts: QueryOptions) -> Result<Indexed<Vec<KvEntry>>>;

    /// Writes `value`. Returns whether the store accepted the write.
    async fn put(&self, key: &str, value: &[u8], mode: PutMode) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn create_session(&self, name: &str, ttl: Duration) -> Result<String>;

    async fn renew_session(&self, id: &str) -> Result<()>;

    async fn destroy_session(&self, id: &str) -> Result<()>;
}
