//! Processing executor: runs the generation tool in a workspace and
//! classifies the result.

pub mod artifacts;
mod runner;
mod tool;

pub use crate::domain::RunOutcome;
pub use artifacts::{RunArtifacts, RunSummary};
pub use runner::{Executor, ExecutorConfig, RunReport, short_title};
pub use tool::{CommandTool, GenerationTool, ToolError, ToolInvocation};
