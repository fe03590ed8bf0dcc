//! Bounded execution of backend sub-calls.
//!
//! - [`group`] - [`AdmissionPool`](group::AdmissionPool), the server-wide
//!   concurrency cap, and [`TaskGroup`](group::TaskGroup), the per-batch set of
//!   jobs admitted through it.

pub mod group;

pub use group::{AdmissionPool, TaskGroup};
