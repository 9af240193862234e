//! Leadership lease: one row per service naming the current holder.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::id::HostId;

/// Lease timing knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseConfig {
    /// Fixed key of the lease row
    pub service_name: String,
    /// How often the holder (and every contender) heartbeats
    pub heartbeat_interval: Duration,
    /// A lease not refreshed within this window may be taken over
    pub lease_window: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        let heartbeat_interval = Duration::seconds(2);
        Self {
            service_name: "notification-service".to_string(),
            heartbeat_interval,
            lease_window: heartbeat_interval * 5,
        }
    }
}

impl LeaseConfig {
    /// Heartbeats older than this instant no longer protect the holder.
    pub fn expiry_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.lease_window
    }
}

/// The stored lease row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub service_name: String,
    pub holder: HostId,
    pub last_heartbeat: DateTime<Utc>,
}

impl Lease {
    /// True when no heartbeat has been recorded since `cutoff`.
    pub fn is_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.last_heartbeat < cutoff
    }

    /// True when `host` holds the lease and it is still within its window.
    pub fn is_held_by(&self, host: HostId, cutoff: DateTime<Utc>) -> bool {
        self.holder == host && !self.is_expired(cutoff)
    }

    /// Outcome of one acquire-or-renew attempt by `host` at `now`.
    ///
    /// - no row: `host` becomes holder
    /// - expired row: `host` takes it over
    /// - row held by `host`: heartbeat refreshed
    /// - row held by someone else and still fresh: unchanged
    ///
    /// Stores must apply this as one atomic step.
    pub fn contend(
        current: Option<&Lease>,
        service_name: &str,
        host: HostId,
        now: DateTime<Utc>,
        cutoff: DateTime<Utc>,
    ) -> Lease {
        match current {
            Some(lease) if !lease.is_expired(cutoff) && lease.holder != host => lease.clone(),
            _ => Lease {
                service_name: service_name.to_string(),
                holder: host,
                last_heartbeat: now,
            },
        }
    }
}
