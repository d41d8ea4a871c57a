//! Isolated per-issue git worktrees.

pub mod git;
mod manager;

pub use manager::{Workspace, WorkspaceConfig, WorkspaceManager, parse_workspace_id};
