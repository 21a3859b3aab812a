use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

const CONFIG_PATH: &str = ".waymark/config.toml";

/// Project-level configuration from `.waymark/config.toml`.
///
/// Every field is optional; CLI flags override config values, config
/// overrides built-in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Suppress progress and tool-invocation output.
    pub quiet: bool,
    /// Reporter width override for non-TTY environments.
    pub width: Option<usize>,
    /// Cap on concurrently stepping agents.
    pub max_parallel: Option<usize>,
    /// Workflow-level monetary cap in USD.
    pub budget_usd: Option<f64>,
    /// Workflow-level wall-clock cap in seconds.
    pub wall_clock_secs: Option<u64>,
    /// Consecutive no-transition retries before an agent fails.
    pub retry_limit: Option<u32>,
    /// Model name forwarded to the LLM CLI.
    pub model: Option<String>,
    /// Pass `--dangerously-skip-permissions` to the LLM CLI.
    pub skip_permissions: bool,
    /// Per-script timeout in seconds.
    pub script_timeout_secs: Option<u64>,
}

/// Load configuration from `.waymark/config.toml` under `dir`.
///
/// Falls back to defaults if the file is missing.
pub fn load(dir: &Path) -> Result<Config> {
    let path = dir.join(CONFIG_PATH);
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(&path)?;
    let config: Config = toml::from_str(&contents)?;
    Ok(config)
}
