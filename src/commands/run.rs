use std::path::Path;

use anyhow::{Context, Result, ensure};

use crate::config;
use crate::console::Reporter;
use crate::scheduler;
use crate::scope::Scope;
use crate::state::{StateStore, Workflow};

use super::RunOptions;

/// Start a new workflow: open the scope, create the `main` agent at the
/// entry state, and drive it until complete or paused.
pub async fn run(scope_path: &Path, entry: &str, opts: &RunOptions) -> Result<i32> {
    let project_config = config::load(Path::new("."))?;
    let reporter = Reporter::stdout(&super::reporter_options(opts, &project_config));

    let scope = Scope::open(scope_path)
        .with_context(|| format!("failed to open scope {}", scope_path.display()))?;
    ensure!(
        scope.exists(entry),
        "entry state '{entry}' not found in scope {}",
        scope_path.display()
    );

    let store = StateStore::open(StateStore::default_dir())?;
    let mut workflow = Workflow::create(&scope_path.display().to_string(), entry);
    let _lock = store.acquire(&workflow.workflow_id)?;
    store.save(&workflow)?;

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
