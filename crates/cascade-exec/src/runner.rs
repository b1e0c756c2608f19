//! Shell command execution with explicit environments.
//!
//! The runner never forwards its own process environment: a command sees
//! exactly the variables its step declares. Secrets therefore reach a command
//! only because the caller resolved and passed them, never implicitly.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

/// Result of executing a shell command.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub duration_ms: u64,
}

/// Abstraction over command execution so the engine can be driven against a
/// test double or a remote runner.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` in `working_dir` with exactly the variables in `env`.
    ///
    /// A `timeout` of `None` means the command may run indefinitely; with
    /// `Some`, the process group is terminated once the deadline passes and
    /// the result carries `timed_out = true`.
    async fn execute(
        &self,
        command: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
        timeout: Option<Duration>,
    ) -> cascade_types::Result<ExecResult>;
}

/// Runs commands through `bash -c` on the local machine.
#[derive(Debug, Default)]
pub struct LocalCommandRunner;

impl LocalCommandRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for LocalCommandRunner {
    async fn execute(
        &self,
        command: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
        timeout: Option<Duration>,
    ) -> cascade_types::Result<ExecResult> {
        let mut cmd = tokio::process::Command::new("bash");
        cmd.args(["-c", command])
            .current_dir(working_dir)
            .env_clear()
            .envs(env)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            // Dropping the future (e.g. on cancellation) must not leave the
            // command running.
            .kill_on_drop(true);

        // On Unix, use a process group so termination reaches grandchildren.
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let start = tokio::time::Instant::now();
        let mut child = cmd.spawn()?;

        // Take stdout/stderr handles so we can read them while retaining child ownership
        let mut stdout = child.stdout.take().expect("stdout piped");
        let mut stderr = child.stderr.take().expect("stderr piped");

        let wait_and_read = async {
            let status = child.wait().await?;
            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            use tokio::io::AsyncReadExt;
            let _ = stdout.read_to_end(&mut stdout_buf).await;
            let _ = stderr.read_to_end(&mut stderr_buf).await;
            Ok::<_, std::io::Error>((status, stdout_buf, stderr_buf))
        };

        match timeout {
            None => {
                let (status, stdout_buf, stderr_buf) = wait_and_read.await?;
                Ok(ExecResult {
                    stdout: String::from_utf8_lossy(&stdout_buf).to_string(),
                    stderr: String::from_utf8_lossy(&stderr_buf).to_string(),
                    exit_code: status.code().unwrap_or(-1),
                    timed_out: false,
                    duration_ms: start.elapsed().as_millis() as u64,
                })
            }
            Some(limit) => {
                // Poll wait_and_read against the deadline in an inner scope so
                // the future (which borrows `child`) is dropped before we call
                // `terminate(&mut child)` on the timeout path.
                let completed = {
                    tokio::pin!(wait_and_read);
                    tokio::select! {
                        result = &mut wait_and_read => Some(result?),
                        _ = tokio::time::sleep(limit) => None,
                    }
                };
                match completed {
                    Some((status, stdout_buf, stderr_buf)) => Ok(ExecResult {
                        stdout: String::from_utf8_lossy(&stdout_buf).to_string(),
                        stderr: String::from_utf8_lossy(&stderr_buf).to_string(),
                        exit_code: status.code().unwrap_or(-1),
                        timed_out: false,
                        duration_ms: start.elapsed().as_millis() as u64,
                    }),
                    None => {
                        tracing::warn!(
                            command,
                            timeout_ms = limit.as_millis() as u64,
                            "Command timed out, terminating"
                        );
                        terminate(&mut child).await;
                        Ok(ExecResult {
                            stdout: String::new(),
                            stderr: format!("Command timed out after {}ms", limit.as_millis()),
                            exit_code: -1,
                            timed_out: true,
                            duration_ms: start.elapsed().as_millis() as u64,
                        })
                    }
                }
            }
        }
    }
}

/// Terminate a child: SIGTERM to the process group first, SIGKILL after a
/// short grace period.
async fn terminate(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
        }
        tokio::select! {
            _ = child.wait() => {}
            _ = tokio::time::sleep(Duration::from_secs(2)) => {
                let _ = child.kill().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill().await;
    }
}
