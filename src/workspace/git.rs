//! Thin async wrapper over the `git` binary.

use std::path::Path;

use tokio::process::Command;

use crate::error::{Result, ScryerError};

/// Run `git <args>` in `cwd` and return trimmed stdout.
pub async fn run_git(cwd: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .await
        .map_err(|e| ScryerError::Git(format!("Failed to execute git: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ScryerError::Git(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
}

/// Borrow a path as a git argument.
pub fn path_arg(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| ScryerError::Git(format!("Path is not valid UTF-8: {}", path.display())))
}
