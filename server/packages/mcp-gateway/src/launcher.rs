//! Spawns configured server processes with piped stdio.

use std::io;
use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

#[derive(Debug, thiserror::Error)]
#[error("failed to launch `{command}`: {source}")]
pub struct LaunchError {
    pub command: String,
    #[source]
    pub source: io::Error,
}

/// A freshly spawned process with all three stdio pipes detached.
///
/// The child is configured with `kill_on_drop` so it cannot outlive the
/// session that owns it even if the exit monitor never runs.
pub struct LaunchedProcess {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    pub child: Child,
}

pub fn launch(command: &str, args: &[String]) -> Result<LaunchedProcess, LaunchError> {
    let fail = |source: io::Error| LaunchError {
        command: command.to_string(),
        source,
    };

    let mut child = Command::new(command)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(fail)?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| fail(io::Error::new(io::ErrorKind::BrokenPipe, "stdin unavailable")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| fail(io::Error::new(io::ErrorKind::BrokenPipe, "stdout unavailable")))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| fail(io::Error::new(io::ErrorKind::BrokenPipe, "stderr unavailable")))?;

    Ok(LaunchedProcess {
        stdin,
        stdout,
        stderr,
        child,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn launch_unknown_command_fails() {
        let err = launch("definitely-not-a-real-binary", &[]).unwrap_err();
        assert!(err.to_string().contains("definitely-not-a-real-binary"));
    }

    #[tokio::test]
    async fn launch_exposes_all_pipes() {
        let process = launch("cat", &[]).unwrap();
        let mut child = process.child;
        let _ = child.start_kill();
        let _ = child.wait().await;
    }
}
