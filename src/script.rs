//! Execution of shell-script states.
//!
//! `.sh` files run via `bash` on POSIX; `.bat` files via `cmd.exe /c` on
//! Windows. The child inherits the orchestrator's working directory and
//! environment, with caller-supplied variables layered on top. Script
//! stdout feeds the transition parser exactly like prompt output does.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("script not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("cannot execute '{extension}' script on this platform: {}", .path.display())]
    UnsupportedExtension { extension: String, path: PathBuf },
    #[error("script '{}' exceeded {} seconds", .path.display(), .timeout.as_secs())]
    Timeout { path: PathBuf, timeout: Duration },
    #[error("failed to run script: {0}")]
    Io(#[from] std::io::Error),
}

/// Captured output of a finished script.
#[derive(Debug)]
pub struct ScriptOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Run a script to completion, capturing stdout, stderr, and exit code.
///
/// On timeout the child is killed and reaped before the error is returned.
/// A non-zero exit is not an error here — the exit code is part of the
/// output and the caller decides what it means.
pub async fn run(
    script_path: &Path,
    timeout: Option<Duration>,
    env: &HashMap<String, String>,
) -> Result<ScriptOutput, ScriptError> {
    if !script_path.is_file() {
        return Err(ScriptError::NotFound(script_path.to_path_buf()));
    }

    let extension = script_path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let mut cmd = match extension.as_str() {
        "sh" if cfg!(unix) => {
            let mut cmd = Command::new("bash");
            cmd.arg(script_path);
            cmd
        }
        "bat" if cfg!(windows) => {
            let mut cmd = Command::new("cmd.exe");
            cmd.arg("/c").arg(script_path);
            cmd
        }
        _ => {
            return Err(ScriptError::UnsupportedExtension {
                extension: format!(".{extension}"),
                path: script_path.to_path_buf(),
            });
        }
    };

    // Inherits the parent environment; caller entries override on conflict.
    cmd.envs(env);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn()?;

    let output = match timeout {
        Some(duration) => match tokio::time::timeout(duration, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                // Dropping the in-flight wait drops the child handle, which
                // kills the process (kill_on_drop) and hands it to the
                // runtime for reaping.
                return Err(ScriptError::Timeout {
                    path: script_path.to_path_buf(),
                    timeout: duration,
                });
            }
        },
        None => child.wait_with_output().await?,
    };

    Ok(ScriptOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}
