//! Short-lived helper commands (`aws ssm get-parameter`, `--version` checks).
//!
//! Commands run via structured args (never a shell) with captured output and
//! timeout-kill semantics. Long-lived transport processes are owned by the
//! supervisor instead.

use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Why a captured command produced no output.
#[derive(Debug)]
pub enum RunError {
    /// Spawn or I/O failure (binary missing, permission denied, ...)
    Io(std::io::Error),
    /// Timed out; the child has been killed
    TimedOut(Duration),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Io(e) => write!(f, "{}", e),
            RunError::TimedOut(after) => write!(f, "timed out after {}s", after.as_secs()),
        }
    }
}

/// Spawn `cmd`, drain stdout and stderr concurrently, and wait for exit.
///
/// On timeout the child is killed (not just the future dropped).
pub async fn run_captured(mut cmd: Command, timeout: Duration) -> Result<Output, RunError> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(RunError::Io)?;
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let collect = async {
        let read_out = async {
            let mut buf = Vec::new();
            if let Some(mut out) = stdout_pipe {
                let _ = out.read_to_end(&mut buf).await;
            }
            buf
        };
        let read_err = async {
            let mut buf = Vec::new();
            if let Some(mut err) = stderr_pipe {
                let _ = err.read_to_end(&mut buf).await;
            }
            buf
        };
        let (stdout, stderr) = tokio::join!(read_out, read_err);
        let status = child.wait().await?;
        Ok::<Output, std::io::Error>(Output {
            status,
            stdout,
            stderr,
        })
    };

    tokio::select! {
        result = collect => result.map_err(RunError::Io),
        _ = tokio::time::sleep(timeout) => {
            // kill_on_drop reaps the child when `child` goes out of scope
            Err(RunError::TimedOut(timeout))
        }
    }
}
