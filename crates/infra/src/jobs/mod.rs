//! Durable record of notification jobs.
//!
//! ## Components
//!
//! - `JobStore`: query contracts the delivery engine depends on
//! - `InMemoryJobStore`: single-process implementation for tests/dev
//! - `PostgresJobStore`: shared store for a fleet of instances
//!
//! Every mutating call commits on its own; no caller transaction is
//! propagated into the store.

pub mod postgres;
pub mod store;

pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
