//! Scryer - turns labeled GitHub issues into draft pull requests
//!
//! Issues are tracked as leased work items in SQLite. Each claimed issue gets
//! a fresh git worktree, a generation tool runs inside it, and any changes
//! are committed, pushed and opened as a draft PR.

pub mod config;
pub mod daemon;
pub mod doctor;
pub mod domain;
pub mod error;
pub mod executor;
pub mod github;
pub mod id;
pub mod prompt;
pub mod store;
pub mod workspace;

#[cfg(test)]
mod testing;

pub use error::{Result, ScryerError};
