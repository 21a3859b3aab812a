use std::io::Write;

use anyhow::Result;

use crate::claude::{self, ClaudeParams};

/// Stream one claude invocation's raw events as pretty-printed JSON.
///
/// A smoke test for the LLM adapter, not part of workflow execution.
pub async fn demo(prompt: &str, model: Option<String>, out: &mut impl Write) -> Result<()> {
    let params = ClaudeParams {
        model,
        ..ClaudeParams::default()
    };

    let (mut events, handle) = claude::invoke_stream(prompt, &params)?;
    while let Some(event) = events.recv().await {
        writeln!(out, "{}", serde_json::to_string_pretty(&event)?)?;
        writeln!(out)?;
    }
    handle.await??;
    Ok(())
}
