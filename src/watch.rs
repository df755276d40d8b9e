//! Blocking watch primitive.
//!
//! A watch issues a read carrying the last index it saw and lets the store
//! hold the request until that index advances or the wait budget runs out.
//! The lock loss-watcher drives [`WatchCursor`] by hand from its event loop;
//! the sync watchers use the [`Watch`] loop.

use std::future::Future;
use std::time::Duration;

use log::{trace, warn};

use crate::kv::{Indexed, QueryOptions};
use crate::Result;

/// A change observed by a watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change<T> {
    pub value: T,
    /// Cursor position before this change. Zero on the seed read and after a
    /// store reset.
    pub previous_index: u64,
    pub index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome<T> {
    Changed(Change<T>),
    /// The wait expired without the index moving.
    Unchanged,
}

/// Last index seen for one topic. Index 0 forces a non-blocking read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchCursor {
    topic: String,
    last_index: u64,
}

impl WatchCursor {
    pub fn new(topic: impl Into<String>) -> Self {
        Self::at(topic, 0)
    }

    pub fn at(topic: impl Into<String>, index: u64) -> Self {
        Self {
            topic: topic.into(),
            last_index: index,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    pub fn query(&self, wait: Duration) -> QueryOptions {
        QueryOptions::blocking(self.last_index, wait)
    }

    /// Classifies a response and advances the cursor on change.
    pub fn observe<T>(&mut self, response: Indexed<T>) -> WatchOutcome<T> {
        // An index of 0 would turn the next read into a busy poll.
        let observed = response.index.max(1);
        let previous = self.last_index;
        if previous != 0 && observed == previous {
            return WatchOutcome::Unchanged;
        }
        let previous_index = if observed < previous {
            warn!(
                "{}: index went backwards ({} -> {}), resyncing",
                self.topic, previous, observed
            );
            0
        } else {
            previous
        };
        self.last_index = observed;
        WatchOutcome::Changed(Change {
            value: response.value,
            previous_index,
            index: observed,
        })
    }
}

/// Watch loop over one topic.
pub struct Watch {
    cursor: WatchCursor,
    wait: Duration,
}

impl Watch {
    pub fn new(cursor: WatchCursor, wait: Duration) -> Self {
        Self { cursor, wait }
    }

    pub fn cursor(&self) -> &WatchCursor {
        &self.cursor
    }

    /// Blocks until `fetch` reports a change. Timeouts re-issue the same
    /// read; fetch errors are returned for the caller to recover from.
    pub async fn changed<T, F, Fut>(&mut self, mut fetch: F) -> Result<Change<T>>
    where
        F: FnMut(QueryOptions) -> Fut,
        Fut: Future<Output = Result<Indexed<T>>>,
    {
        loop {
            let response = fetch(self.cursor.query(self.wait)).await?;
            match self.cursor.observe(response) {
                WatchOutcome::Changed(change) => return Ok(change),
                WatchOutcome::Unchanged => {
                    trace!("{}: no change at index {}", self.cursor.topic, self.cursor.last_index);
                }
            }
        }
    }
}
