use std::time::Duration;

use log::{debug, warn};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::kv::KvStore;
use crate::Result;

/// Renewal schedule for one session id.
///
/// The first renewal is due one period after start. A late renewal does not
/// trigger a burst of catch-up renewals.
pub struct SessionLease {
    id: String,
    renewal: Interval,
}

impl SessionLease {
    pub fn start(id: impl Into<String>, period: Duration) -> Self {
        let mut renewal = interval_at(Instant::now() + period, period);
        renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            id: id.into(),
            renewal,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Resolves when the next renewal is due.
    pub async fn due(&mut self) {
        self.renewal.tick().await;
    }
}

pub async fn renew<S: KvStore + ?Sized>(store: &S, id: &str) -> Result<()> {
    store.renew_session(id).await?;
    debug!("renewed session {id}");
    Ok(())
}

/// Destroys a session, logging instead of failing.
pub async fn destroy_quietly<S: KvStore + ?Sized>(store: &S, id: &str) {
    match store.destroy_session(id).await {
        Ok(()) => debug!("destroyed session {id}"),
        Err(err) => warn!("destroying session {id}: {err}"),
    }
}
