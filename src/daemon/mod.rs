//! Daemon Core - orchestration loop, retry policy and crash recovery
//!
//! The daemon is the long-running process that:
//! - Discovers labeled issues and claims one per cycle
//! - Processes it in a fresh workspace and records the outcome
//! - Recovers from crashes by reclaiming expired leases and sweeping orphans

pub mod policy;
pub mod recovery;
pub mod service;
pub mod tick;

pub use policy::RetryPolicy;
pub use recovery::{RecoveryReport, recover};
pub use service::{Daemon, DaemonConfig};
pub use tick::{CycleResult, SleepPlanner};
