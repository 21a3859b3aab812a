use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use waymark::commands::RunOptions;

#[derive(Parser, Debug)]
#[command(
    name = "waymark",
    about = "A multi-agent workflow orchestrator for Claude Code's -p mode",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a new workflow from a scope directory or zip archive.
    Run {
        /// Directory or zip archive holding the workflow's state files.
        scope: PathBuf,

        /// Entry state for the main agent.
        #[arg(long, default_value = "START.md")]
        entry: String,

        #[command(flatten)]
        opts: RunArgs,
    },

    /// Resume a paused or interrupted workflow.
    Resume {
        /// Workflow id as printed at startup (and by `list`).
        workflow_id: String,

        #[command(flatten)]
        opts: RunArgs,
    },

    /// List persisted workflows.
    List,

    /// Stream one claude invocation's raw events to stdout.
    Demo {
        /// Prompt to send to claude.
        prompt: String,

        /// Model to use (e.g. haiku, sonnet, opus).
        #[arg(long)]
        model: Option<String>,
    },
}

/// Flags shared by `run` and `resume`.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Suppress progress and tool-invocation lines.
    #[arg(long)]
    pub quiet: bool,

    /// Override terminal width for output truncation.
    #[arg(long)]
    pub width: Option<usize>,

    /// Model to pass to the LLM CLI.
    #[arg(long)]
    pub model: Option<String>,

    /// Monetary cap in USD; the workflow pauses when reached.
    #[arg(long)]
    pub budget: Option<f64>,

    /// Wall-clock cap in seconds; the workflow pauses when reached.
    #[arg(long)]
    pub wall_clock: Option<u64>,

    /// Maximum concurrently stepping agents.
    #[arg(long)]
    pub max_parallel: Option<usize>,

    /// Pass --dangerously-skip-permissions to the LLM CLI.
    #[arg(long)]
    pub skip_permissions: bool,

    /// Per-script timeout in seconds.
    #[arg(long)]
    pub script_timeout: Option<u64>,
}

impl From<RunArgs> for RunOptions {
    fn from(args: RunArgs) -> Self {
        RunOptions {
            quiet: args.quiet,
            width: args.width,
            model: args.model,
            budget_usd: args.budget,
            wall_clock_secs: args.wall_clock,
            max_parallel: args.max_parallel,
            skip_permissions: args.skip_permissions,
            script_timeout_secs: args.script_timeout,
        }
    }
}
