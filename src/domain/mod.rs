//! Domain types for Scryer
//!
//! - Issue types exchanged with the issue source
//! - RunOutcome: result of one processing attempt

pub mod issue;
pub mod outcome;

pub use issue::{Issue, IssueSummary, PrReference, Publication};
pub use outcome::{OutcomeKind, RunOutcome};
