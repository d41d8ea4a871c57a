//! Generation tool invocation.
//!
//! The prompt goes to the tool on stdin; the tool edits files in the
//! workspace. The child is killed when the invocation is dropped, which is
//! how timeouts, lost leases and shutdown stop it.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// What the tool did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    /// None when terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ToolInvocation {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Failures to run the tool at all.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Tool timed out after {}s", .after.as_secs())]
    Timeout {
        after: Duration,
        stdout: String,
        stderr: String,
    },

    #[error("Tool IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Seam between the executor and the code-generation program.
#[async_trait]
pub trait GenerationTool: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Run the tool with `prompt` on stdin inside `workspace`.
    async fn invoke(&self, prompt: &str, workspace: &Path, timeout: Duration) -> Result<ToolInvocation, ToolError>;
}

/// Runs an external command as the generation tool.
#[derive(Debug, Clone)]
pub struct CommandTool {
    command: String,
    args: Vec<String>,
    model: Option<String>,
    heartbeat: Duration,
}

impl CommandTool {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            model: None,
            heartbeat: Duration::from_secs(20),
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat.max(Duration::from_millis(100));
        self
    }

    /// Full argument list after the program name.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = self.args.clone();
        if let Some(model) = &self.model {
            argv.push("--model".to_string());
            argv.push(model.clone());
        }
        argv
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.command.clone())
            .chain(self.argv())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn collect<R: AsyncRead + Unpin + Send + 'static>(reader: Option<R>) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut reader) = reader
            && let Err(e) = reader.read_to_end(&mut buf).await
        {
            debug!("tool output read stopped: {}", e);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Grandchildren can hold the pipes open after the tool is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

async fn drain(handle: JoinHandle<String>) -> String {
    let abort = handle.abort_handle();
    match tokio::time::timeout(DRAIN_GRACE, handle).await {
        Ok(output) => output.unwrap_or_default(),
        Err(_) => {
            abort.abort();
            debug!("tool output still open after exit, dropped");
            String::new()
        }
    }
}

#[async_trait]
impl GenerationTool for CommandTool {
    fn name(&self) -> &str {
        &self.command
    }

    async fn invoke(&self, prompt: &str, workspace: &Path, timeout: Duration) -> Result<ToolInvocation, ToolError> {
        info!(
            "starting tool cwd={} timeout_secs={} cmd={}",
            workspace.display(),
            timeout.as_secs(),
            self.command_line()
        );

        let started = Instant::now();
        let mut child = Command::new(&self.command)
            .args(self.argv())
            .current_dir(workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ToolError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.as_bytes().to_vec();
            tokio::spawn(async move {
                // The tool may exit without reading its input
                if let Err(e) = stdin.write_all(&prompt).await {
                    debug!("prompt not fully written: {}", e);
                }
                let _ = stdin.shutdown().await;
            });
        }
        let stdout = collect(child.stdout.take());
        let stderr = collect(child.stderr.take());

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.tick().await;

        let status = loop {
            tokio::select! {
                status = child.wait() => break Some(status?),
                _ = &mut deadline => {
                    child.kill().await?;
                    break None;
                }
                _ = heartbeat.tick() => {
                    info!(
                        "tool still running elapsed_secs={} cwd={}",
                        started.elapsed().as_secs(),
                        workspace.display()
                    );
                }
            }
        };

        let stdout = drain(stdout).await;
        let stderr = drain(stderr).await;
        let elapsed = started.elapsed();

        match status {
            Some(status) => {
                info!(
                    "tool finished exit_code={:?} elapsed_secs={}",
                    status.code(),
                    elapsed.as_secs()
                );
                Ok(ToolInvocation {
                    exit_code: status.code(),
                    stdout,
                    stderr,
                    elapsed,
                })
            }
            None => Err(ToolError::Timeout {
                after: timeout,
                stdout,
                stderr,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh(script: &str) -> CommandTool {
        CommandTool::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn test_argv_appends_model() {
        let tool = CommandTool::new("codex", vec!["exec".to_string()]).with_model(Some("o4-mini".to_string()));
        assert_eq!(tool.argv(), vec!["exec", "--model", "o4-mini"]);
        assert_eq!(tool.command_line(), "codex exec --model o4-mini");
        assert_eq!(tool.name(), "codex");
    }

    #[tokio::test]
    async fn test_prompt_is_delivered_on_stdin() {
        let temp = TempDir::new().unwrap();
        let tool = sh("cat > received.txt; echo done");

        let result = tool
            .invoke("Fix the bug\n", temp.path(), Duration::from_secs(10))
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(result.stdout, "done\n");
        let received = std::fs::read_to_string(temp.path().join("received.txt")).unwrap();
        assert_eq!(received, "Fix the bug\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let temp = TempDir::new().unwrap();
        let tool = sh("echo oops >&2; exit 3");

        let result = tool.invoke("", temp.path(), Duration::from_secs(10)).await.unwrap();

        assert!(!result.success());
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stderr, "oops\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_tool() {
        let temp = TempDir::new().unwrap();
        let tool = sh("echo started; exec sleep 30").with_heartbeat(Duration::from_millis(100));

        let started = Instant::now();
        let err = tool
            .invoke("", temp.path(), Duration::from_millis(500))
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(10));
        match err {
            ToolError::Timeout { stdout, .. } => assert_eq!(stdout, "started\n"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let temp = TempDir::new().unwrap();
        let tool = CommandTool::new("/nonexistent/generation-tool", vec![]);

        let err = tool.invoke("", temp.path(), Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }
}
