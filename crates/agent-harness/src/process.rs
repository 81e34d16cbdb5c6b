use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

use crate::types::HarnessRequest;
use crate::{HarnessError, Result};

// ─── AgentProcess ─────────────────────────────────────────────────────────

/// A running agent subprocess.
///
/// The prompt is written to stdin, which is then closed. Stdout and stderr
/// are drained by background tasks from the moment of spawn so a chatty
/// agent never blocks on a full pipe.
pub(crate) struct AgentProcess {
    child: Child,
    stdout_task: JoinHandle<std::io::Result<String>>,
    stderr_task: JoinHandle<std::io::Result<String>>,
}

/// Captured output of a finished process.
#[derive(Debug)]
pub(crate) struct Finished {
    pub stdout: String,
    pub stderr: String,
    /// `None` when terminated by a signal.
    pub code: Option<i32>,
}

impl AgentProcess {
    pub(crate) fn spawn(program: &Path, request: &HarnessRequest) -> Result<Self> {
        let mut cmd = Command::new(program);
        cmd.args(request.argv());
        // Nested agent sessions refuse to start when this is inherited.
        cmd.env_remove("CLAUDECODE");
        for (k, v) in &request.env {
            cmd.env(k, v);
        }
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }

        Self::from_command(cmd)
    }

    fn from_command(mut cmd: Command) -> Result<Self> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(HarnessError::Io)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HarnessError::Process("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| HarnessError::Process("stderr not captured".into()))?;

        Ok(Self {
            child,
            stdout_task: tokio::spawn(read_all(stdout)),
            stderr_task: tokio::spawn(read_all(stderr)),
        })
    }

    /// Feed `prompt` to stdin, then wait for exit and both output streams.
    ///
    /// `timeout` bounds the whole exchange: an agent that never reads its
    /// input is killed just like one that never exits.
    pub(crate) async fn finish(mut self, prompt: &str, timeout: Option<Duration>) -> Result<Finished> {
        let stdin = self.child.stdin.take();
        let exchange = async {
            send_prompt(stdin, prompt).await?;
            collect(&mut self.child, &mut self.stdout_task, &mut self.stderr_task).await
        };
        let Some(limit) = timeout else {
            return exchange.await;
        };
        let result = tokio::time::timeout(limit, exchange).await;
        match result {
            Ok(finished) => finished,
            Err(_) => {
                tracing::warn!(timeout_secs = limit.as_secs(), "agent timed out, killing");
                let _ = self.child.kill().await;
                Err(HarnessError::Timeout {
                    secs: limit.as_secs(),
                })
            }
        }
    }
}

/// Write the prompt and close stdin so the agent sees EOF.
async fn send_prompt(stdin: Option<ChildStdin>, prompt: &str) -> Result<()> {
    let Some(mut stdin) = stdin else {
        return Err(HarnessError::Process("stdin not captured".into()));
    };
    let written = match stdin.write_all(prompt.as_bytes()).await {
        Ok(()) => stdin.shutdown().await,
        Err(e) => Err(e),
    };
    match written {
        Ok(()) => Ok(()),
        // The agent may exit without reading its input.
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
            tracing::debug!("agent closed stdin before reading the prompt");
            Ok(())
        }
        Err(e) => Err(HarnessError::Io(e)),
    }
}

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> std::io::Result<String> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

async fn collect(
    child: &mut Child,
    stdout: &mut JoinHandle<std::io::Result<String>>,
    stderr: &mut JoinHandle<std::io::Result<String>>,
) -> Result<Finished> {
    let status = child.wait().await?;
    let stdout = stdout
        .await
        .map_err(|e| HarnessError::Process(format!("stdout reader failed: {e}")))??;
    let stderr = stderr
        .await
        .map_err(|e| HarnessError::Process(format!("stderr reader failed: {e}")))?
        .unwrap_or_default();
    Ok(Finished {
        stdout,
        stderr,
        code: status.code(),
    })
}
