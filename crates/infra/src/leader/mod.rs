//! Lease-based single-leader election over a shared store.
//!
//! Every instance heartbeats the same lease row. The store applies an atomic
//! "acquire if expired, else renew if owned" step, so at most one instance
//! holds a fresh lease at any time. Leadership gates intake, the recovery
//! poller and the health monitor.

pub mod election;
pub mod postgres;
pub mod store;

pub use election::LeaderElection;
pub use postgres::PostgresLeaseStore;
pub use store::{InMemoryLeaseStore, LeaseStore, LeaseStoreError};
