//! `hookrelay-core`: domain building blocks for notification delivery.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the job record and its lifecycle, the retry policy, and the leadership lease.

pub mod error;
pub mod id;
pub mod job;
pub mod lease;
pub mod retry;

pub use error::{DomainError, DomainResult};
pub use id::{HostId, JobId, TemplateId};
pub use job::{FailureReason, JobDraft, JobStatus, NotificationJob, Payload, Priority};
pub use lease::{Lease, LeaseConfig};
pub use retry::RetryPolicy;
