//! Readiness checks for `scryer doctor`.

use std::path::{Path, PathBuf};

use colored::*;
use tokio::process::Command;

use crate::config::{Config, RepoLayout};
use crate::store::WorkStore;

/// Result of one readiness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    pub ok: bool,
    pub message: String,
}

impl CheckResult {
    fn pass(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            ok: true,
            message: message.into(),
        }
    }

    fn fail(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            ok: false,
            message: message.into(),
        }
    }
}

/// Locate an executable the way a shell would.
pub fn find_executable(command: &str) -> Option<PathBuf> {
    let is_exec = |path: &Path| {
        path.metadata().is_ok_and(|m| {
            use std::os::unix::fs::PermissionsExt;
            m.is_file() && m.permissions().mode() & 0o111 != 0
        })
    };

    if command.contains('/') {
        let path = PathBuf::from(command);
        return is_exec(&path).then_some(path);
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(command))
        .find(|candidate| is_exec(candidate))
}

struct Captured {
    success: bool,
    stdout: String,
    stderr: String,
}

impl Captured {
    fn detail(&self, fallback: &str) -> String {
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        if detail.is_empty() {
            fallback.to_string()
        } else {
            detail.lines().next().unwrap_or(fallback).to_string()
        }
    }
}

async fn capture(program: &str, args: &[&str], cwd: &Path) -> Captured {
    match Command::new(program)
        .args(args)
        .current_dir(cwd)
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("GH_PROMPT_DISABLED", "1")
        .output()
        .await
    {
        Ok(output) => Captured {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        },
        Err(e) => Captured {
            success: false,
            stdout: String::new(),
            stderr: e.to_string(),
        },
    }
}

fn binary_check(name: &str, command: &str, hint: &str) -> CheckResult {
    match find_executable(command) {
        Some(path) => CheckResult::pass(name, path.display().to_string()),
        None => CheckResult::fail(name, format!("{:?} not found in PATH; {}", command, hint)),
    }
}

/// Run every readiness check against `layout`.
pub async fn run_doctor(config: &Config, layout: &RepoLayout) -> Vec<CheckResult> {
    let repo_root = &layout.repo_root;
    let mut results = Vec::new();

    let git = binary_check("git binary", "git", "install git");
    let has_git = git.ok;
    results.push(git);
    results.push(binary_check(
        "tool binary",
        &config.tool.command,
        "set tool.command or install the tool",
    ));
    let gh = binary_check("gh binary", "gh", "install the GitHub CLI");
    let has_gh = gh.ok;
    results.push(gh);

    if has_git {
        let toplevel = capture("git", &["rev-parse", "--show-toplevel"], repo_root).await;
        results.push(if toplevel.success {
            CheckResult::pass("git repository", toplevel.stdout.trim())
        } else {
            CheckResult::fail("git repository", toplevel.detail("not a git repository"))
        });

        let remote_name = config.git.remote.as_str();
        let remote = capture("git", &["remote", "get-url", remote_name], repo_root).await;
        let name = format!("git {} remote", remote_name);
        results.push(if remote.success && !remote.stdout.trim().is_empty() {
            CheckResult::pass(&name, remote.stdout.trim())
        } else {
            CheckResult::fail(&name, remote.detail(&format!("missing {} remote", remote_name)))
        });

        let base = &config.git.base_branch;
        let local_ref = format!("refs/heads/{}", base);
        let remote_ref = format!("refs/remotes/{}/{}", remote_name, base);
        let local = capture("git", &["show-ref", "--verify", &local_ref], repo_root).await;
        let remote = capture("git", &["show-ref", "--verify", &remote_ref], repo_root).await;
        results.push(if local.success || remote.success {
            let place = if local.success { "local" } else { remote_name };
            CheckResult::pass("base branch", format!("{} found ({})", base, place))
        } else {
            CheckResult::fail(
                "base branch",
                format!("{} not found locally or at {}/{}", base, remote_name, base),
            )
        });
    }

    if has_gh {
        let auth = capture("gh", &["auth", "status"], repo_root).await;
        results.push(if auth.success {
            CheckResult::pass("gh auth", "authenticated")
        } else {
            CheckResult::fail("gh auth", auth.detail("authentication check failed"))
        });
    }

    results.push(check_workdir(&config.storage.workdir));

    results.push(match layout.ensure_dirs() {
        Err(e) => CheckResult::fail("store opens", e.to_string()),
        Ok(()) => match WorkStore::open(&layout.db_path) {
            Ok(_) => CheckResult::pass("store opens", layout.db_path.display().to_string()),
            Err(e) => CheckResult::fail("store opens", e.to_string()),
        },
    });

    results
}

fn check_workdir(workdir: &Path) -> CheckResult {
    let marker = workdir.join(".doctor_write_test");
    let attempt = std::fs::create_dir_all(workdir)
        .and_then(|_| std::fs::write(&marker, "ok"))
        .and_then(|_| std::fs::remove_file(&marker));
    match attempt {
        Ok(()) => CheckResult::pass("workdir writable", workdir.display().to_string()),
        Err(e) => CheckResult::fail("workdir writable", format!("{}: {}", workdir.display(), e)),
    }
}

/// Print `[PASS]`/`[FAIL]` lines; true when every check passed.
pub fn print_report(results: &[CheckResult]) -> bool {
    for check in results {
        let tag = if check.ok {
            "[PASS]".green()
        } else {
            "[FAIL]".red()
        };
        println!("{} {}: {}", tag, check.name, check.message);
    }
    results.iter().all(|c| c.ok)
}
