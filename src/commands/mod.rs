//! Thin command adapters between the CLI surface and the scheduler.

pub mod demo;
pub mod list;
pub mod resume;
pub mod run;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::Config;
use crate::console::ReporterOptions;
use crate::scheduler::{RunOutcome, SchedulerConfig};
use crate::step::{DEFAULT_RETRY_LIMIT, StepConfig};

/// Process exit codes for workflow outcomes.
pub const EXIT_COMPLETED: i32 = 0;
pub const EXIT_FATAL: i32 = 1;
pub const EXIT_PAUSED: i32 = 2;

/// Options shared by `run` and `resume`, already merged from CLI flags.
/// CLI values win over `.waymark/config.toml`, which wins over defaults.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub quiet: bool,
    pub width: Option<usize>,
    pub model: Option<String>,
    pub budget_usd: Option<f64>,
    pub wall_clock_secs: Option<u64>,
    pub max_parallel: Option<usize>,
    pub skip_permissions: bool,
    pub script_timeout_secs: Option<u64>,
}

pub(crate) fn reporter_options(opts: &RunOptions, config: &Config) -> ReporterOptions {
    ReporterOptions {
        quiet: opts.quiet || config.quiet,
        width: opts.width.or(config.width),
        color: None,
        unicode: None,
    }
}

pub(crate) fn scheduler_config(opts: &RunOptions, config: &Config) -> SchedulerConfig {
    SchedulerConfig {
        max_parallel: opts.max_parallel.or(config.max_parallel),
        budget_usd: opts.budget_usd.or(config.budget_usd),
        wall_clock: opts
            .wall_clock_secs
            .or(config.wall_clock_secs)
            .map(Duration::from_secs),
        step: StepConfig {
            model: opts.model.clone().or_else(|| config.model.clone()),
            skip_permissions: opts.skip_permissions || config.skip_permissions,
            retry_limit: config.retry_limit.unwrap_or(DEFAULT_RETRY_LIMIT),
            script_timeout: opts
                .script_timeout_secs
                .or(config.script_timeout_secs)
                .map(Duration::from_secs),
        },
    }
}

/// Latch a cancel flag on the first Ctrl+C. The scheduler finishes
/// in-flight steps and pauses the rest.
pub(crate) fn install_cancel_handler() -> Arc<AtomicBool> {
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; finishing in-flight steps");
            flag.store(true, Ordering::SeqCst);
        }
    });
    cancel
}

pub fn exit_code(outcome: &RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Completed { .. } => EXIT_COMPLETED,
        RunOutcome::Paused => EXIT_PAUSED,
    }
}
