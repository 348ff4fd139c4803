//! Builder for executing external tool commands with timeout and
//! cancellation support.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use bf_core::{Error, Result};

/// Default command timeout: 5 minutes.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// One line of child output, tagged with the pipe it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamLine<'a> {
    Stdout(&'a str),
    Stderr(&'a str),
}

/// Output captured from a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Process exit status.
    pub status: ExitStatus,
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Captured standard error (lossy UTF-8).
    pub stderr: String,
}

/// A builder for constructing and executing external tool invocations.
///
/// # Example
///
/// ```no_run
/// use bf_av::ToolCommand;
/// use std::path::PathBuf;
///
/// # async fn example() -> bf_core::Result<()> {
/// let output = ToolCommand::new(PathBuf::from("ffprobe"))
///     .arg("-v").arg("error")
///     .arg("-print_format").arg("json")
///     .arg("-show_format")
///     .arg("-show_streams")
///     .arg("/path/to/video.mkv")
///     .execute()
///     .await?;
/// println!("{}", output.stdout);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ToolCommand {
    /// Create a new command for the given program path.
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Append a single argument.
    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    /// Append multiple arguments.
    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Set the maximum execution time.
    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    /// Execute the command, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// - Returns [`Error::Tool`] if the process times out (message includes
    ///   the timeout duration).
    /// - Returns [`Error::Tool`] if the process exits with a non-zero status
    ///   (message includes stderr).
    /// - Returns [`Error::Tool`] if spawning the process fails.
    pub async fn execute(&self) -> Result<ToolOutput> {
        let program_name = self.program_name();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| Error::tool(program_name.clone(), format!("failed to spawn: {e}")))?;

        let result = tokio::time::timeout(self.timeout, child.wait_with_output()).await;

        match result {
            Ok(Ok(output)) => {
                let tool_output = ToolOutput {
                    status: output.status,
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                };

                if !output.status.success() {
                    return Err(Error::tool(
                        program_name,
                        format!(
                            "exited with status {}: {}",
                            output.status,
                            tool_output.stderr.trim()
                        ),
                    ));
                }

                Ok(tool_output)
            }
            Ok(Err(e)) => Err(Error::tool(
                program_name,
                format!("I/O error waiting for process: {e}"),
            )),
            Err(_elapsed) => {
                // The wait_with_output future was dropped on timeout;
                // kill_on_drop reaps the child.
                Err(Error::tool(
                    program_name,
                    format!("timed out after {:?}", self.timeout),
                ))
            }
        }
    }

    /// Execute the command, streaming output lines to a callback as they
    /// arrive instead of buffering everything.
    ///
    /// Both pipes are drained concurrently and to EOF before the exit status
    /// is collected, so a chatty child can never deadlock on a full pipe.
    /// Returns the raw exit status; a non-zero exit is NOT an error here,
    /// the caller inspects the status together with whatever it captured
    /// from the callback.
    ///
    /// # Errors
    ///
    /// - [`Error::Tool`] if spawning fails or the timeout elapses.
    /// - [`Error::Cancelled`] if `cancel` fires; the child is killed and
    ///   reaped before returning.
    pub async fn stream(
        &self,
        mut on_line: impl FnMut(StreamLine<'_>),
        cancel: &CancellationToken,
    ) -> Result<ExitStatus> {
        let program_name = self.program_name();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::tool(program_name.clone(), format!("failed to spawn: {e}")))?;

        // The readers own the pipe handles so the child itself stays free
        // for kill/wait in the cancellation paths.
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::tool(program_name.clone(), "stdout pipe missing"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::tool(program_name.clone(), "stderr pipe missing"))?;

        let deadline = tokio::time::Instant::now() + self.timeout;

        let drain = async {
            let mut out_lines = BufReader::new(stdout).lines();
            let mut err_lines = BufReader::new(stderr).lines();
            let mut out_done = false;
            let mut err_done = false;
            while !(out_done && err_done) {
                tokio::select! {
                    res = out_lines.next_line(), if !out_done => match res {
                        Ok(Some(line)) => on_line(StreamLine::Stdout(&line)),
                        _ => out_done = true,
                    },
                    res = err_lines.next_line(), if !err_done => match res {
                        Ok(Some(line)) => on_line(StreamLine::Stderr(&line)),
                        _ => err_done = true,
                    },
                }
            }
        };

        tokio::select! {
            () = drain => {}
            () = cancel.cancelled() => {
                return self.kill_and_reap(&mut child, Error::Cancelled).await;
            }
            () = tokio::time::sleep_until(deadline) => {
                let err = Error::tool(
                    program_name,
                    format!("timed out after {:?}", self.timeout),
                );
                return self.kill_and_reap(&mut child, err).await;
            }
        }

        // Both pipes are at EOF; the child is exiting. The same deadline and
        // cancellation still bound the final wait.
        tokio::select! {
            status = child.wait() => {
                status.map_err(|e| Error::tool(
                    self.program_name(),
                    format!("I/O error waiting for process: {e}"),
                ))
            }
            () = cancel.cancelled() => {
                self.kill_and_reap(&mut child, Error::Cancelled).await
            }
            () = tokio::time::sleep_until(deadline) => {
                let err = Error::tool(
                    self.program_name(),
                    format!("timed out after {:?}", self.timeout),
                );
                self.kill_and_reap(&mut child, err).await
            }
        }
    }

    async fn kill_and_reap(
        &self,
        child: &mut tokio::process::Child,
        err: Error,
    ) -> Result<ExitStatus> {
        if let Err(e) = child.kill().await {
            tracing::warn!(tool = %self.program_name(), "failed to kill child: {e}");
        }
        let _ = child.wait().await;
        Err(err)
    }
}
