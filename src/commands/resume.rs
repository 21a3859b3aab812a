use std::path::Path;

use anyhow::{Context, Result};

use crate::config;
use crate::console::Reporter;
use crate::scheduler;
use crate::scope::Scope;
use crate::state::StateStore;

use super::RunOptions;

/// Resume a persisted workflow: paused agents return to the running set
/// and the scheduler picks up where the last save left off.
pub async fn resume(workflow_id: &str, opts: &RunOptions) -> Result<i32> {
    let project_config = config::load(Path::new("."))?;
    let reporter = Reporter::stdout(&super::reporter_options(opts, &project_config));

    let store = StateStore::open(StateStore::default_dir())?;
    let _lock = store.acquire(workflow_id)?;
    let mut workflow = store.load(workflow_id)?;

    let scope = Scope::open(Path::new(&workflow.scope))
        .with_context(|| format!("failed to open scope {}", workflow.scope))?;

    for agent in &mut workflow.agents {
        agent.unpause();
    }

    reporter.workflow_started(&workflow.workflow_id, &scope.location());

    let scheduler_config = super::scheduler_config(opts, &project_config);
    let cancel = super::install_cancel_handler();
    let outcome = scheduler::run_workflow(
        &mut workflow,
        &scope,
        &store,
        &reporter,
        &scheduler_config,
        &cancel,
    )
    .await?;

    Ok(super::exit_code(&outcome))
}
