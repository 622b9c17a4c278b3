//! External process invocation with output capture and a hard timeout

use common::ControlFailure;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Captured result of a finished process
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Convert a non-zero exit into a [`ControlFailure`]
    pub fn into_result(self) -> Result<Self, ControlFailure> {
        if self.success() {
            Ok(self)
        } else {
            Err(ControlFailure::NonZeroExit {
                code: self.code,
                stdout: self.stdout.trim().to_string(),
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Run `program` with `args`, capturing stdout and stderr
///
/// The child is killed if it does not finish within `timeout`.
pub async fn run_captured(
    program: &Path,
    args: &[String],
    timeout: Duration,
) -> Result<CapturedOutput, ControlFailure> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(windows)]
    {
        // CREATE_NO_WINDOW
        command.creation_flags(0x0800_0000);
    }

    debug!("Running {} {:?}", program.display(), args);

    let child = command.spawn().map_err(|e| ControlFailure::Launch {
        program: program.display().to_string(),
        reason: e.to_string(),
    })?;

    // Dropping the wait future on timeout drops the child, which kills it
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| ControlFailure::Launch {
            program: program.display().to_string(),
            reason: e.to_string(),
        })?,
        Err(_) => return Err(ControlFailure::TimedOut(timeout)),
    };

    Ok(CapturedOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
