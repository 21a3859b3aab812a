//! Adapter over the `claude` CLI child process.
//!
//! Spawns `claude -p` in headless stream-json mode, parses its NDJSON
//! stdout, and mines the event stream for the session id (needed to resume
//! the conversation) and the per-invocation cost.

use std::process::Stdio;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Built-in tools that never make sense under an unattended orchestrator:
/// they either block on a human or flip claude into interactive planning.
pub const DISALLOWED_TOOLS: &[&str] = &[
    "EnterPlanMode",
    "ExitPlanMode",
    "AskUserQuestion",
    "NotebookEdit",
];

/// Environment variable overriding the child program name (default `claude`).
pub const CLAUDE_BIN_ENV: &str = "WAYMARK_CLAUDE_BIN";

#[derive(Debug, thiserror::Error)]
pub enum ClaudeError {
    #[error("failed to spawn claude process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("claude exited with code {code}: {stderr}")]
    Exit { code: i32, stderr: String },
    #[error("i/o error while streaming claude output: {0}")]
    Io(#[from] std::io::Error),
}

/// The closed set of per-invocation parameters.
///
/// Anything else the CLI accepts is deliberately not reachable from here —
/// an unknown parameter is a programming error, not a passthrough.
#[derive(Debug, Clone, Default)]
pub struct ClaudeParams {
    pub model: Option<String>,
    /// Resume token for an existing conversation.
    pub session_id: Option<String>,
    /// Branch the resumed conversation instead of continuing it in place.
    pub fork_session: bool,
    /// Pass `--dangerously-skip-permissions` instead of acceptEdits.
    pub skip_permissions: bool,
}

/// Everything collected from one synchronous invocation.
#[derive(Debug)]
pub struct ClaudeOutput {
    /// Every parsed stream-json object, in arrival order.
    pub events: Vec<Value>,
    /// Last session id observed anywhere in the stream.
    pub session_id: Option<String>,
    /// Sum of `total_cost_usd` across the stream, in USD.
    pub cost_usd: f64,
}

/// Resolve the child program name, honoring [`CLAUDE_BIN_ENV`].
pub fn claude_program() -> String {
    std::env::var(CLAUDE_BIN_ENV).unwrap_or_else(|_| "claude".to_string())
}

/// Build the full argument list for one invocation.
///
/// The prompt is the final positional argument, preceded by `--` so it can
/// never be mistaken for a flag.
pub fn build_claude_command(prompt: &str, params: &ClaudeParams) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-p".into(),
        "--output-format".into(),
        "stream-json".into(),
        "--verbose".into(),
        "--disallowed-tools".into(),
        DISALLOWED_TOOLS.join(","),
    ];

    if params.skip_permissions {
        args.push("--dangerously-skip-permissions".into());
    } else {
        args.push("--permission-mode".into());
        args.push("acceptEdits".into());
    }

    if let Some(model) = &params.model {
        args.push("--model".into());
        args.push(model.clone());
    }

    if let Some(session_id) = &params.session_id {
        args.push("--resume".into());
        args.push(session_id.clone());
        if params.fork_session {
            args.push("--fork-session".into());
        }
    }

    args.push("--".into());
    args.push(prompt.to_string());
    args
}

/// Run claude synchronously, collecting the full event stream.
///
/// Each parsed event is also passed to `observer` as it arrives, for live
/// progress reporting. Lines that fail to parse are warned about and
/// skipped; a non-zero exit fails with the drained stderr.
pub async fn invoke(
    prompt: &str,
    params: &ClaudeParams,
    mut observer: impl FnMut(&Value),
) -> Result<ClaudeOutput, ClaudeError> {
    let mut child = Command::new(claude_program())
        .args(build_claude_command(prompt, params))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(ClaudeError::Spawn)?;

    let stdout = child.stdout.take().expect("stdout should be piped");
    let stderr = child.stderr.take().expect("stderr should be piped");

    // Drain stderr concurrently so a chatty child can't fill the pipe and
    // stall while we're blocked on stdout.
    let stderr_task: JoinHandle<String> = tokio::spawn(async move {
        let mut buf = String::new();
        let mut stderr = stderr;
        let _ = stderr.read_to_string(&mut buf).await;
        buf
    });

    let mut lines = BufReader::new(stdout).lines();
    let mut events = Vec::new();
    let mut session_id = None;
    let mut cost_usd = 0.0;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(event) => {
                if let Some(sid) = extract_session_id(&event) {
                    session_id = Some(sid.to_string());
                }
                cost_usd += event.get("total_cost_usd").and_then(Value::as_f64).unwrap_or(0.0);
                observer(&event);
                events.push(event);
            }
            Err(e) => {
                tracing::warn!(error = %e, line, "failed to parse claude output line");
            }
        }
    }

    let status = child.wait().await?;
    let stderr_text = stderr_task.await.unwrap_or_default();

    if !status.success() {
        return Err(ClaudeError::Exit {
            code: status.code().unwrap_or(-1),
            stderr: stderr_text,
        });
    }

    Ok(ClaudeOutput {
        events,
        session_id,
        cost_usd,
    })
}

/// Run claude, yielding events through a channel as they arrive.
///
/// The returned handle resolves once the child exits; a non-zero exit
/// surfaces there as [`ClaudeError::Exit`]. Used by the demo path.
pub fn invoke_stream(
    prompt: &str,
    params: &ClaudeParams,
) -> Result<
    (
        mpsc::UnboundedReceiver<Value>,
        JoinHandle<Result<(), ClaudeError>>,
    ),
    ClaudeError,
> {
    let mut child = Command::new(claude_program())
        .args(build_claude_command(prompt, params))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(ClaudeError::Spawn)?;

    let stdout = child.stdout.take().expect("stdout should be piped");
    let stderr = child.stderr.take().expect("stderr should be piped");

    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let stderr_task: JoinHandle<String> = tokio::spawn(async move {
            let mut buf = String::new();
            let mut stderr = stderr;
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(event) => {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, line, "failed to parse claude output line");
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(ClaudeError::Exit {
                code: status.code().unwrap_or(-1),
                stderr: stderr_task.await.unwrap_or_default(),
            });
        }
        Ok(())
    });

    Ok((rx, handle))
}

/// Pull a session id out of a stream event, top-level or under `metadata`.
pub fn extract_session_id(event: &Value) -> Option<&str> {
    event
        .get("session_id")
        .and_then(Value::as_str)
        .or_else(|| {
            event
                .get("metadata")
                .and_then(|m| m.get("session_id"))
                .and_then(Value::as_str)
        })
}

/// Concatenate all assistant text blocks across one invocation's events.
///
/// This is the response body the transition parser sees. Falls back to the
/// terminal result event's `result` string when no assistant text was
/// streamed (some models emit only the summary event).
pub fn assistant_text(events: &[Value]) -> String {
    let mut out = String::new();
    for event in events {
        if event.get("type").and_then(Value::as_str) != Some("assistant") {
            continue;
        }
        let Some(content) = event.pointer("/message/content").and_then(Value::as_array) else {
            continue;
        };
        for block in content {
            if block.get("type").and_then(Value::as_str) == Some("text")
                && let Some(text) = block.get("text").and_then(Value::as_str)
            {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
    }

    if out.is_empty()
        && let Some(result) = events
            .iter()
            .rev()
            .find(|e| e.get("type").and_then(Value::as_str) == Some("result"))
            .and_then(|e| e.get("result"))
            .and_then(Value::as_str)
    {
        out.push_str(result);
    }

    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tools_arg(cmd: &[String]) -> Vec<&str> {
        let idx = cmd.iter().position(|a| a == "--disallowed-tools").unwrap();
        cmd[idx + 1].split(',').collect()
    }

    #[test]
    fn command_has_fixed_argument_set() {
        let cmd = build_claude_command("test prompt", &ClaudeParams::default());
        assert_eq!(cmd[0], "-p");
        assert!(cmd.contains(&"--output-format".to_string()));
        assert!(cmd.contains(&"stream-json".to_string()));
        assert!(cmd.contains(&"--verbose".to_string()));
    }

    #[test]
    fn all_four_disallowed_tools_present() {
        let cmd = build_claude_command("test prompt", &ClaudeParams::default());
        let tools = tools_arg(&cmd);
        assert!(tools.contains(&"EnterPlanMode"));
        assert!(tools.contains(&"ExitPlanMode"));
        assert!(tools.contains(&"AskUserQuestion"));
        assert!(tools.contains(&"NotebookEdit"));
        assert_eq!(tools.len(), DISALLOWED_TOOLS.len());
    }

    #[test]
    fn default_uses_permission_mode_accept_edits() {
        let cmd = build_claude_command("test prompt", &ClaudeParams::default());
        let idx = cmd.iter().position(|a| a == "--permission-mode").unwrap();
        assert_eq!(cmd[idx + 1], "acceptEdits");
        assert!(!cmd.contains(&"--dangerously-skip-permissions".to_string()));
    }

    #[test]
    fn skip_permissions_replaces_permission_mode() {
        let params = ClaudeParams {
            skip_permissions: true,
            ..ClaudeParams::default()
        };
        let cmd = build_claude_command("test prompt", &params);
        assert!(cmd.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(!cmd.contains(&"--permission-mode".to_string()));
    }

    #[test]
    fn disallowed_tools_survive_other_flags() {
        let params = ClaudeParams {
            model: Some("haiku".into()),
            session_id: Some("session-abc-123".into()),
            skip_permissions: true,
            ..ClaudeParams::default()
        };
        let cmd = build_claude_command("test prompt", &params);
        assert_eq!(
            tools_arg(&cmd).len(),
            DISALLOWED_TOOLS.len(),
            "tool denylist must be present regardless of other flags"
        );
    }

    #[test]
    fn model_flag() {
        let params = ClaudeParams {
            model: Some("haiku".into()),
            ..ClaudeParams::default()
        };
        let cmd = build_claude_command("test prompt", &params);
        let idx = cmd.iter().position(|a| a == "--model").unwrap();
        assert_eq!(cmd[idx + 1], "haiku");
    }

    #[test]
    fn resume_flag_from_session_id() {
        let params = ClaudeParams {
            session_id: Some("session_123".into()),
            ..ClaudeParams::default()
        };
        let cmd = build_claude_command("test prompt", &params);
        let idx = cmd.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(cmd[idx + 1], "session_123");
        assert!(!cmd.contains(&"--fork-session".to_string()));
    }

    #[test]
    fn fork_session_requires_session_id() {
        let params = ClaudeParams {
            fork_session: true,
            ..ClaudeParams::default()
        };
        let cmd = build_claude_command("test prompt", &params);
        assert!(!cmd.contains(&"--fork-session".to_string()));

        let params = ClaudeParams {
            session_id: Some("session_123".into()),
            fork_session: true,
            ..ClaudeParams::default()
        };
        let cmd = build_claude_command("test prompt", &params);
        assert!(cmd.contains(&"--fork-session".to_string()));
    }

    #[test]
    fn double_dash_immediately_precedes_prompt() {
        let prompt = "--looks-like-a-flag";
        let cmd = build_claude_command(prompt, &ClaudeParams::default());
        assert_eq!(cmd.last().unwrap(), prompt);
        assert_eq!(cmd[cmd.len() - 2], "--");
    }

    #[test]
    fn session_id_extracted_top_level() {
        let event = json!({"type": "system", "session_id": "abc"});
        assert_eq!(extract_session_id(&event), Some("abc"));
    }

    #[test]
    fn session_id_extracted_from_metadata() {
        let event = json!({"type": "system", "metadata": {"session_id": "nested"}});
        assert_eq!(extract_session_id(&event), Some("nested"));
    }

    #[test]
    fn session_id_absent() {
        let event = json!({"type": "assistant"});
        assert_eq!(extract_session_id(&event), None);
    }

    #[test]
    fn assistant_text_concatenates_turns() {
        let events = vec![
            json!({"type": "system", "subtype": "init", "session_id": "x"}),
            json!({"type": "assistant", "message": {"content": [
                {"type": "text", "text": "First turn."},
                {"type": "tool_use", "id": "t1", "name": "Bash", "input": {}},
            ]}}),
            json!({"type": "assistant", "message": {"content": [
                {"type": "text", "text": "<goto>NEXT.md</goto>"},
            ]}}),
            json!({"type": "result", "subtype": "success", "result": "ignored"}),
        ];
        assert_eq!(assistant_text(&events), "First turn.\n<goto>NEXT.md</goto>");
    }

    #[test]
    fn assistant_text_falls_back_to_result_event() {
        let events = vec![json!({
            "type": "result",
            "subtype": "success",
            "result": "<result>done</result>",
        })];
        assert_eq!(assistant_text(&events), "<result>done</result>");
    }
}
