//! Concurrently drive every live agent until the workflow is quiescent.
//!
//! One tick steps all RUNNING agents through a bounded pool; each step
//! owns a clone of its agent record, and the workflow is mutated only
//! here, between step completions. State is persisted after every
//! reconciled step so a crash loses at most the in-flight step.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use futures::StreamExt;

use crate::console::{Reporter, TransitionKind};
use crate::scope::Scope;
use crate::state::{Agent, FailureRecord, StateStore, Workflow};
use crate::step::{self, Disposition, StepConfig, StepOutcome};

/// Cap on concurrently stepping agents when none is configured.
const DEFAULT_MAX_PARALLEL: usize = 8;

#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    /// Pool size; defaults to the live RUNNING count capped at 8.
    pub max_parallel: Option<usize>,
    /// Workflow-level monetary cap in USD.
    pub budget_usd: Option<f64>,
    /// Workflow-level wall-clock cap.
    pub wall_clock: Option<Duration>,
    pub step: StepConfig,
}

/// How a scheduler run ended. Fatal workflow errors surface as `Err`
/// from [`run_workflow`] instead.
#[derive(Debug)]
pub enum RunOutcome {
    /// Every agent terminated.
    Completed {
        /// Body of the last root-level `<result>`.
        final_result: Option<String>,
    },
    /// Agents remain, but none is running.
    Paused,
}

/// Drive the workflow until complete, paused, or fatally failed.
pub async fn run_workflow<W: Write>(
    workflow: &mut Workflow,
    scope: &Scope,
    store: &StateStore,
    reporter: &Reporter<W>,
    config: &SchedulerConfig,
    cancel: &AtomicBool,
) -> Result<RunOutcome> {
    let started = Instant::now();
    let mut final_result: Option<String> = None;

    loop {
        if workflow.is_complete() {
            store.save(workflow).context("failed to persist workflow state")?;
            reporter.workflow_completed(workflow.total_cost);
            return Ok(RunOutcome::Completed { final_result });
        }

        if let Some(reason) = pause_reason(workflow, config, started, cancel) {
            pause_all(workflow, reporter, reason);
            workflow.updated_at = Utc::now();
            store.save(workflow).context("failed to persist workflow state")?;
            let paused = workflow.agents.iter().filter(|a| !a.is_running()).count();
            reporter.workflow_paused(&workflow.workflow_id, workflow.total_cost, paused);
            return Ok(RunOutcome::Paused);
        }

        let running: Vec<Agent> = workflow
            .agents
            .iter()
            .filter(|a| a.is_running())
            .cloned()
            .collect();
        if running.is_empty() {
            store.save(workflow).context("failed to persist workflow state")?;
            let paused = workflow.agents.len();
            reporter.workflow_paused(&workflow.workflow_id, workflow.total_cost, paused);
            return Ok(RunOutcome::Paused);
        }

        let limit = config
            .max_parallel
            .unwrap_or_else(|| running.len().min(DEFAULT_MAX_PARALLEL))
            .max(1);

        // Forked children appended during this tick are not in `running`,
        // so they never execute before the next tick.
        let mut outcomes = futures::stream::iter(
            running
                .into_iter()
                .map(|agent| step::step_agent(agent, scope, reporter, &config.step)),
        )
        .buffer_unordered(limit);

        while let Some(outcome) = outcomes.next().await {
            apply_outcome(workflow, outcome, reporter, &mut final_result, config);
            workflow.updated_at = Utc::now();
            store.save(workflow).context("failed to persist workflow state")?;
        }
    }
}

/// Whether the whole workflow must pause before the next tick.
fn pause_reason(
    workflow: &Workflow,
    config: &SchedulerConfig,
    started: Instant,
    cancel: &AtomicBool,
) -> Option<&'static str> {
    if cancel.load(Ordering::SeqCst) {
        return Some("interrupt");
    }
    if let Some(budget) = config.budget_usd
        && workflow.total_cost >= budget
    {
        return Some("budget");
    }
    if let Some(cap) = config.wall_clock
        && started.elapsed() >= cap
    {
        return Some("timeout");
    }
    None
}

fn pause_all<W: Write>(workflow: &mut Workflow, reporter: &Reporter<W>, reason: &str) {
    for agent in &mut workflow.agents {
        if agent.is_running() {
            agent.pause(reason);
            reporter.agent_paused(&agent.id, reason);
        }
    }
}

/// Fold one step's outcome into the workflow: mutate in place, remove
/// terminated, then append forks.
fn apply_outcome<W: Write>(
    workflow: &mut Workflow,
    outcome: StepOutcome,
    reporter: &Reporter<W>,
    final_result: &mut Option<String>,
    config: &SchedulerConfig,
) {
    let StepOutcome {
        agent,
        state,
        disposition,
        forks,
        llm_cost,
    } = outcome;
    let agent_id = agent.id.clone();

    if let Some(cost) = llm_cost {
        workflow.total_cost += cost;
        reporter.state_completed(&agent_id, cost, workflow.total_cost);
    }

    match disposition {
        Disposition::Transitioned { kind, target } => {
            reporter.transition(&agent_id, &target, kind, None);
            replace_agent(workflow, agent);
        }
        Disposition::Retrying { attempt } => {
            reporter.error(
                &agent_id,
                &format!(
                    "No transition found, retrying ({attempt}/{})",
                    config.step.retry_limit
                ),
            );
            replace_agent(workflow, agent);
        }
        Disposition::Terminated { result } => {
            reporter.agent_terminated(&agent_id, &result);
            workflow.agents.retain(|a| a.id != agent_id);
            *final_result = Some(result);
        }
        Disposition::Failed { error } => {
            reporter.error(&agent_id, &error);
            workflow.failures.push(FailureRecord {
                agent_id: agent_id.clone(),
                state,
                error,
                at: Utc::now(),
            });
            workflow.agents.retain(|a| a.id != agent_id);
        }
    }

    for mut child in forks {
        // A supplied <id> can collide with a live agent; rename rather
        // than clobber.
        if workflow.has_agent(&child.id) {
            let base = child.id.clone();
            let mut n = 2;
            while workflow.has_agent(&format!("{base}-{n}")) {
                n += 1;
            }
            let renamed = format!("{base}-{n}");
            tracing::warn!(agent = %base, renamed = %renamed, "fork id already taken; renaming");
            child.id = renamed;
        }
        reporter.transition(
            &agent_id,
            &child.current_state,
            TransitionKind::Fork,
            Some(&child.id),
        );
        workflow.agents.push(child);
    }
}

fn replace_agent(workflow: &mut Workflow, agent: Agent) {
    if let Some(slot) = workflow.agent_mut(&agent.id) {
        *slot = agent;
    } else {
        // The record disappeared mid-tick; keep the step's copy.
        workflow.agents.push(agent);
    }
}
