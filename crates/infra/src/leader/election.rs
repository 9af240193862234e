//! Heartbeat loop and leadership check on top of a [`LeaseStore`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use hookrelay_core::{HostId, Lease, LeaseConfig};

use super::store::{LeaseStore, LeaseStoreError};
use crate::workers::{TaskHandle, spawn_periodic};

/// Heartbeats the shared lease and answers "am I the leader right now?".
pub struct LeaderElection {
    store: Arc<dyn LeaseStore>,
    host_id: HostId,
    config: LeaseConfig,
    leading: AtomicBool,
}

impl LeaderElection {
    /// A contender with a fresh random host id.
    pub fn new(store: Arc<dyn LeaseStore>, config: LeaseConfig) -> Self {
        Self::with_host_id(store, config, HostId::random())
    }

    pub fn with_host_id(store: Arc<dyn LeaseStore>, config: LeaseConfig, host_id: HostId) -> Self {
        info!(host_id = %host_id, service = %config.service_name, "leader election initialised");
        Self {
            store,
            host_id,
            config,
            leading: AtomicBool::new(false),
        }
    }

    pub fn host_id(&self) -> HostId {
        self.host_id
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// One heartbeat at wall-clock time.
    pub async fn heartbeat(&self) {
        self.heartbeat_at(Utc::now()).await;
    }

    /// One acquire-or-renew round at `now`.
    ///
    /// Store failures are logged and swallowed. The lease then simply goes
    /// unrenewed this round.
    pub async fn heartbeat_at(&self, now: DateTime<Utc>) {
        let cutoff = self.config.expiry_cutoff(now);
        match self
            .store
            .try_acquire_or_renew(&self.config.service_name, self.host_id, now, cutoff)
            .await
        {
            Ok(holder) => self.observe(holder == self.host_id, holder),
            Err(err) => {
                error!(host_id = %self.host_id, error = %err, "leader heartbeat failed");
            }
        }
    }

    /// Leadership check against the store at wall-clock time.
    pub async fn is_leader(&self) -> bool {
        self.is_leader_at(Utc::now()).await
    }

    /// True when this host is the stored holder and its heartbeat is inside
    /// the lease window at `now`. Store errors read as "not leader".
    pub async fn is_leader_at(&self, now: DateTime<Utc>) -> bool {
        let cutoff = self.config.expiry_cutoff(now);
        match self
            .store
            .is_holder(&self.config.service_name, self.host_id, cutoff)
            .await
        {
            Ok(leading) => leading,
            Err(err) => {
                warn!(host_id = %self.host_id, error = %err, "leader check failed");
                false
            }
        }
    }

    /// The stored lease row, for diagnostics.
    pub async fn current_lease(&self) -> Result<Option<Lease>, LeaseStoreError> {
        self.store.current(&self.config.service_name).await
    }

    /// Run `heartbeat` every `heartbeat_interval` until shut down.
    pub fn spawn(self: Arc<Self>) -> TaskHandle {
        let period = self
            .config
            .heartbeat_interval
            .to_std()
            .unwrap_or(StdDuration::from_secs(2));
        spawn_periodic("leader-heartbeat", period, move || {
            let election = Arc::clone(&self);
            async move { election.heartbeat().await }
        })
    }

    fn observe(&self, holding: bool, holder: HostId) {
        let was_leading = self.leading.swap(holding, Ordering::SeqCst);
        match (was_leading, holding) {
            (false, true) => info!(host_id = %self.host_id, "acquired leadership"),
            (true, false) => {
                warn!(host_id = %self.host_id, holder = %holder, "lost leadership")
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for LeaderElection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElection")
            .field("host_id", &self.host_id)
            .field("config", &self.config)
            .field("leading", &self.leading.load(Ordering::Relaxed))
            .finish()
    }
}
