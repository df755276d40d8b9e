//! Coordination tools on top of Consul.
//!
//! `consul-lock` runs a command only while holding a session-backed lock on
//! a key, and stops it when the lock is lost. `consul-sync` mirrors KV
//! prefixes from other datacenters (or other prefixes) into the local one,
//! deletions included. Both are built on the blocking watch in [`watch`]
//! and the store contract in [`kv`].

pub mod config;
pub mod error;
pub mod kv;
#[cfg(feature = "lock")]
pub mod lock;
#[cfg(feature = "cli")]
pub mod logging;
#[cfg(feature = "sync")]
pub mod sync;
pub mod watch;

pub use error::{Error, Result};
