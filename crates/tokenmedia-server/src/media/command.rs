//! Builder for running external media tools with a timeout and cancellation.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::transcode::TranscodeError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Longest stderr tail kept in error messages
const STDERR_TAIL: usize = 1024;

/// Output captured from a tool execution.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    /// Raw standard output; media tools write binary here
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// A single invocation of an external tool.
///
/// ```no_run
/// use std::path::PathBuf;
/// use tokenmedia_server::media::command::ToolCommand;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), tokenmedia_server::media::TranscodeError> {
/// let output = ToolCommand::new(PathBuf::from("ffprobe"))
///     .args(["-v", "quiet", "-print_format", "json", "-show_streams", "/tmp/in.mp4"])
///     .execute(&CancellationToken::new())
///     .await?;
/// println!("{}", String::from_utf8_lossy(&output.stdout));
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
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    /// Run to completion, capturing stdout and stderr.
    ///
    /// The child is killed when the timeout expires or `cancel` fires.
    pub async fn execute(&self, cancel: &CancellationToken) -> Result<ToolOutput, TranscodeError> {
        let tool = self.tool_name();
        debug!(tool = %tool, args = ?self.args, "Running media tool");

        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TranscodeError::Spawn {
                tool: tool.clone(),
                message: e.to_string(),
            })?;

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(TranscodeError::Cancelled),
            result = tokio::time::timeout(self.timeout, child.wait_with_output()) => match result {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Err(TranscodeError::Io(e)),
                Err(_) => {
                    return Err(TranscodeError::Timeout {
                        tool,
                        timeout: self.timeout,
                    })
                }
            },
        };

        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(TranscodeError::Failed {
                tool,
                status: output.status.to_string(),
                stderr: stderr_tail(&stderr),
            });
        }

        Ok(ToolOutput {
            status: output.status,
            stdout: output.stdout,
            stderr,
        })
    }
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let count = trimmed.chars().count();
    if count <= STDERR_TAIL {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - STDERR_TAIL).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execute_echo() {
        let output = ToolCommand::new(PathBuf::from("echo"))
            .arg("hello")
            .execute(&CancellationToken::new())
            .await;

        if let Ok(out) = output {
            assert!(out.status.success());
            assert!(String::from_utf8_lossy(&out.stdout).contains("hello"));
        }
    }

    #[tokio::test]
    async fn execute_nonexistent_tool() {
        let result = ToolCommand::new(PathBuf::from("nonexistent_tool_xyz_12345"))
            .execute(&CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TranscodeError::Spawn { .. })));
    }

    #[tokio::test]
    async fn timeout_fires() {
        let result = ToolCommand::new(PathBuf::from("sleep"))
            .arg("10")
            .timeout(Duration::from_millis(100))
            .execute(&CancellationToken::new())
            .await;
        if let Err(e) = result {
            assert!(
                matches!(e, TranscodeError::Timeout { .. } | TranscodeError::Spawn { .. }),
                "unexpected error: {e}"
            );
        } else {
            panic!("sleep finished before the timeout");
        }
    }

    #[tokio::test]
    async fn cancellation_stops_the_child() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = ToolCommand::new(PathBuf::from("sleep"))
            .arg("10")
            .execute(&cancel)
            .await;
        assert!(matches!(
            result,
            Err(TranscodeError::Cancelled | TranscodeError::Spawn { .. })
        ));
    }

    #[test]
    fn test_stderr_tail_keeps_end() {
        let long = "x".repeat(2000) + "END";
        let tail = stderr_tail(&long);
        assert!(tail.ends_with("END"));
        assert_eq!(tail.chars().count(), STDERR_TAIL);
    }
}
