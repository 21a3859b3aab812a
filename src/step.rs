//! Execute one state for one agent and apply the resulting transition.
//!
//! A step owns a copy of its agent record and never touches the shared
//! workflow; the scheduler reconciles the returned outcome. Dispatch is by
//! file extension: scripts run through the script runner, everything else
//! is a prompt for the LLM adapter. Either way the output feeds the
//! transition parser.

use std::collections::HashMap;
use std::io::Write;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::claude::{self, ClaudeParams};
use crate::console::{Reporter, TransitionKind};
use crate::scope::Scope;
use crate::script;
use crate::state::{Agent, Frame};
use crate::transition::{self, Directives, Transition};

/// Consecutive no-transition retries before an agent fails.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Per-step knobs, fixed for a scheduler run.
#[derive(Debug, Clone)]
pub struct StepConfig {
    pub model: Option<String>,
    pub skip_permissions: bool,
    pub retry_limit: u32,
    pub script_timeout: Option<Duration>,
}

impl Default for StepConfig {
    fn default() -> Self {
        StepConfig {
            model: None,
            skip_permissions: false,
            retry_limit: DEFAULT_RETRY_LIMIT,
            script_timeout: None,
        }
    }
}

/// What a step decided about its agent.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// A transition was applied; the agent continues.
    Transitioned { kind: TransitionKind, target: String },
    /// No transition found; the state will re-execute.
    Retrying { attempt: u32 },
    /// `<result>` with an empty stack: the agent is done.
    Terminated { result: String },
    /// Agent-fatal error; siblings keep running.
    Failed { error: String },
}

/// The full result of stepping one agent once.
#[derive(Debug)]
pub struct StepOutcome {
    /// The mutated agent record, replacing the one stepped.
    pub agent: Agent,
    /// The state that was executed.
    pub state: String,
    pub disposition: Disposition,
    /// Children spawned by `<fork>` directives.
    pub forks: Vec<Agent>,
    /// LLM cost for prompt steps that got a response; `None` for scripts
    /// and for steps that failed before invoking.
    pub llm_cost: Option<f64>,
}

/// Whether a state file runs as a script rather than a prompt.
pub fn is_script_state(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".sh") || lower.ends_with(".bat")
}

/// Execute the agent's current state and fold the emitted directives into
/// its record.
pub async fn step_agent<W: Write>(
    mut agent: Agent,
    scope: &Scope,
    reporter: &Reporter<W>,
    config: &StepConfig,
) -> StepOutcome {
    let state = agent.current_state.clone();
    let agent_id = agent.id.clone();

    if !scope.exists(&state) {
        let error = format!("state file '{state}' not found in scope");
        return fail(agent, state, error);
    }

    let (response_text, llm_cost) = if is_script_state(&state) {
        reporter.script_started(&agent_id, &state);
        let materialized = match scope.materialize(&state) {
            Ok(materialized) => materialized,
            Err(e) => return fail(agent, state, e.to_string()),
        };
        let env = HashMap::from([
            ("WAYMARK_AGENT_ID".to_string(), agent_id.clone()),
            ("WAYMARK_STATE".to_string(), state.clone()),
        ]);
        let started = Instant::now();
        match script::run(materialized.path(), config.script_timeout, &env).await {
            Ok(output) => {
                reporter.script_completed(
                    &agent_id,
                    output.exit_code,
                    started.elapsed().as_millis(),
                );
                (output.stdout, None)
            }
            Err(e) => return fail(agent, state, e.to_string()),
        }
        // The materialized handle drops here, deleting any temp extraction.
    } else {
        reporter.state_started(&agent_id, &state);
        let body = match scope.read(&state) {
            Ok(body) => body,
            Err(e) => return fail(agent, state, e.to_string()),
        };
        let prompt = render_prompt(&agent_id, &body, agent.pending_result.take());
        let params = ClaudeParams {
            model: config.model.clone(),
            session_id: agent.session_id.clone(),
            fork_session: false,
            skip_permissions: config.skip_permissions,
        };
        match claude::invoke(&prompt, &params, |event| {
            report_event(reporter, &agent_id, event);
        })
        .await
        {
            Ok(output) => {
                if let Some(session_id) = output.session_id {
                    agent.session_id = Some(session_id);
                }
                (claude::assistant_text(&output.events), Some(output.cost_usd))
            }
            Err(e) => return fail(agent, state, format!("claude execution failed: {e}")),
        }
    };

    let directives = transition::parse_directives(&response_text);
    apply_directives(agent, state, directives, llm_cost, config)
}

/// Fold parsed directives into the agent record.
fn apply_directives(
    mut agent: Agent,
    state: String,
    directives: Directives,
    llm_cost: Option<f64>,
    config: &StepConfig,
) -> StepOutcome {
    let Some(transition) = directives.transition else {
        agent.retries += 1;
        let attempt = agent.retries;
        if !directives.forks.is_empty() {
            // Spawning now and retrying would duplicate the children, so
            // the forks only take effect once a primary transition lands.
            tracing::warn!(
                agent = %agent.id,
                state = %state,
                "fork without a primary transition; retrying without spawning"
            );
        }
        if attempt > config.retry_limit {
            let error = format!(
                "no transition found after {} attempts",
                config.retry_limit
            );
            return fail_with_cost(agent, state, error, llm_cost);
        }
        return StepOutcome {
            agent,
            state,
            disposition: Disposition::Retrying { attempt },
            forks: Vec::new(),
            llm_cost,
        };
    };

    agent.retries = 0;

    let mut forks = Vec::new();
    for fork in directives.forks {
        let child_id = match fork.id {
            Some(name) => format!("{}.{name}", agent.id),
            None => {
                agent.fork_counter += 1;
                format!("{}.{}", agent.id, agent.fork_counter)
            }
        };
        forks.push(Agent::new(child_id, fork.state));
    }

    let disposition = match transition {
        Transition::Goto(target) => {
            agent.current_state = target.clone();
            Disposition::Transitioned {
                kind: TransitionKind::Goto,
                target,
            }
        }
        Transition::Reset(target) => {
            if !agent.stack.is_empty() {
                tracing::warn!(
                    agent = %agent.id,
                    state = %state,
                    "reset with a non-empty return stack; abandoning subroutine"
                );
            }
            agent.current_state = target.clone();
            agent.session_id = None;
            agent.stack.clear();
            Disposition::Transitioned {
                kind: TransitionKind::Reset,
                target,
            }
        }
        Transition::Call(target) => {
            agent.stack.push(Frame {
                caller_session: agent.session_id.take(),
                return_state: state.clone(),
            });
            agent.current_state = target.clone();
            Disposition::Transitioned {
                kind: TransitionKind::Call,
                target,
            }
        }
        Transition::Result(body) => match agent.stack.pop() {
            None => Disposition::Terminated { result: body },
            Some(frame) => {
                agent.current_state = frame.return_state.clone();
                agent.session_id = frame.caller_session;
                agent.pending_result = Some(body);
                Disposition::Transitioned {
                    kind: TransitionKind::Result,
                    target: frame.return_state,
                }
            }
        },
    };

    StepOutcome {
        agent,
        state,
        disposition,
        forks,
        llm_cost,
    }
}

fn fail(agent: Agent, state: String, error: String) -> StepOutcome {
    fail_with_cost(agent, state, error, None)
}

fn fail_with_cost(
    agent: Agent,
    state: String,
    error: String,
    llm_cost: Option<f64>,
) -> StepOutcome {
    tracing::error!(agent = %agent.id, state = %state, error = %error, "agent step failed");
    StepOutcome {
        agent,
        state,
        disposition: Disposition::Failed { error },
        forks: Vec::new(),
        llm_cost,
    }
}

/// Render the prompt body, interpolating a returned child's `<result>`
/// body as `{{result}}`.
///
/// Prompts are Handlebars templates in non-strict, no-escape mode, so a
/// body without placeholders passes through unchanged. A body that fails
/// to parse as a template is used verbatim.
fn render_prompt(agent_id: &str, body: &str, pending_result: Option<String>) -> String {
    let mut hbs = handlebars::Handlebars::new();
    hbs.set_strict_mode(false);
    hbs.register_escape_fn(handlebars::no_escape);

    let mut data: HashMap<&str, String> = HashMap::new();
    if let Some(result) = pending_result {
        data.insert("result", result);
    }

    match hbs.render_template(body, &data) {
        Ok(rendered) => rendered,
        Err(e) => {
            tracing::warn!(agent = %agent_id, error = %e, "prompt is not a valid template; using it verbatim");
            body.to_string()
        }
    }
}

/// Translate a stream-json event into reporter calls for live progress.
fn report_event<W: Write>(reporter: &Reporter<W>, agent_id: &str, event: &Value) {
    match event.get("type").and_then(Value::as_str) {
        Some("assistant") => {
            let Some(content) = event.pointer("/message/content").and_then(Value::as_array) else {
                return;
            };
            for block in content {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
                            if !flat.is_empty() {
                                reporter.progress_message(agent_id, &flat);
                            }
                        }
                    }
                    Some("tool_use") => {
                        if let Some(name) = block.get("name").and_then(Value::as_str) {
                            let detail = block.get("input").and_then(tool_detail);
                            reporter.tool_invocation(agent_id, name, detail.as_deref());
                        }
                    }
                    _ => {}
                }
            }
        }
        Some("user") => {
            let Some(content) = event.pointer("/message/content").and_then(Value::as_array) else {
                return;
            };
            for block in content {
                if block.get("type").and_then(Value::as_str) == Some("tool_result")
                    && block.get("is_error").and_then(Value::as_bool) == Some(true)
                {
                    let text = tool_result_text(block.get("content"));
                    reporter.tool_error(agent_id, &text, None);
                }
            }
        }
        _ => {}
    }
}

/// The most useful single-line summary of a tool input.
fn tool_detail(input: &Value) -> Option<String> {
    for key in ["command", "file_path", "path", "pattern", "url"] {
        if let Some(value) = input.get(key).and_then(Value::as_str) {
            return Some(value.to_string());
        }
    }
    None
}

fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(" "),
        _ => "tool failed".to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::transition::Fork;

    fn agent_with_session() -> Agent {
        let mut agent = Agent::new("main", "START.md");
        agent.session_id = Some("session_123".into());
        agent
    }

    fn directives(transition: Option<Transition>, forks: Vec<Fork>) -> Directives {
        Directives { transition, forks }
    }

    fn apply(agent: Agent, d: Directives) -> StepOutcome {
        apply_directives(agent, "START.md".into(), d, Some(0.01), &StepConfig::default())
    }

    #[test]
    fn goto_updates_state_and_preserves_session() {
        let outcome = apply(
            agent_with_session(),
            directives(Some(Transition::Goto("NEXT.md".into())), vec![]),
        );
        assert_eq!(outcome.agent.current_state, "NEXT.md");
        assert_eq!(outcome.agent.session_id.as_deref(), Some("session_123"));
        assert!(matches!(
            outcome.disposition,
            Disposition::Transitioned {
                kind: TransitionKind::Goto,
                ..
            }
        ));
    }

    #[test]
    fn reset_clears_session_and_stack() {
        let mut agent = agent_with_session();
        agent.stack.push(Frame {
            caller_session: Some("session_caller".into()),
            return_state: "RETURN.md".into(),
        });

        let outcome = apply(
            agent,
            directives(Some(Transition::Reset("NEXT.md".into())), vec![]),
        );
        assert_eq!(outcome.agent.current_state, "NEXT.md");
        assert!(outcome.agent.session_id.is_none());
        assert!(outcome.agent.stack.is_empty());
    }

    #[test]
    fn call_pushes_frame_and_starts_fresh() {
        let outcome = apply(
            agent_with_session(),
            directives(Some(Transition::Call("SUB.md".into())), vec![]),
        );
        assert_eq!(outcome.agent.current_state, "SUB.md");
        assert!(outcome.agent.session_id.is_none());
        assert_eq!(
            outcome.agent.stack,
            vec![Frame {
                caller_session: Some("session_123".into()),
                return_state: "START.md".into(),
            }]
        );
    }

    #[test]
    fn result_with_empty_stack_terminates() {
        let outcome = apply(
            agent_with_session(),
            directives(Some(Transition::Result("Task completed".into())), vec![]),
        );
        assert_eq!(
            outcome.disposition,
            Disposition::Terminated {
                result: "Task completed".into(),
            }
        );
        assert!(outcome.agent.stack.is_empty());
    }

    #[test]
    fn result_pops_frame_and_restores_caller() {
        let mut agent = agent_with_session();
        agent.session_id = Some("session_sub".into());
        agent.current_state = "SUB.md".into();
        agent.stack.push(Frame {
            caller_session: Some("session_caller".into()),
            return_state: "START.md".into(),
        });

        let outcome = apply_directives(
            agent,
            "SUB.md".into(),
            directives(Some(Transition::Result("42".into())), vec![]),
            Some(0.01),
            &StepConfig::default(),
        );
        assert_eq!(outcome.agent.current_state, "START.md");
        assert_eq!(outcome.agent.session_id.as_deref(), Some("session_caller"));
        assert_eq!(outcome.agent.pending_result.as_deref(), Some("42"));
        assert!(outcome.agent.stack.is_empty());
    }

    #[test]
    fn no_transition_retries_then_fails() {
        let mut agent = agent_with_session();
        for attempt in 1..=DEFAULT_RETRY_LIMIT {
            let outcome = apply(agent, directives(None, vec![]));
            assert_eq!(
                outcome.disposition,
                Disposition::Retrying { attempt },
                "attempt {attempt} should retry"
            );
            // Session preserved so the LLM sees the same conversation.
            assert_eq!(outcome.agent.session_id.as_deref(), Some("session_123"));
            agent = outcome.agent;
        }

        let outcome = apply(agent, directives(None, vec![]));
        assert!(matches!(outcome.disposition, Disposition::Failed { .. }));
    }

    #[test]
    fn successful_transition_resets_retry_counter() {
        let mut agent = agent_with_session();
        agent.retries = 2;
        let outcome = apply(
            agent,
            directives(Some(Transition::Goto("NEXT.md".into())), vec![]),
        );
        assert_eq!(outcome.agent.retries, 0);
    }

    #[test]
    fn fork_spawns_child_with_supplied_name() {
        let outcome = apply(
            agent_with_session(),
            directives(
                Some(Transition::Goto("WAIT.md".into())),
                vec![Fork {
                    state: "WORKER.md".into(),
                    id: Some("w1".into()),
                }],
            ),
        );
        assert_eq!(outcome.forks.len(), 1);
        let child = &outcome.forks[0];
        assert_eq!(child.id, "main.w1");
        assert_eq!(child.current_state, "WORKER.md");
        assert!(child.session_id.is_none());
        assert!(child.stack.is_empty());
        // Parent continues with its own session.
        assert_eq!(outcome.agent.current_state, "WAIT.md");
        assert_eq!(outcome.agent.session_id.as_deref(), Some("session_123"));
    }

    #[test]
    fn fork_auto_ids_are_monotonic_per_parent() {
        let outcome = apply(
            agent_with_session(),
            directives(
                Some(Transition::Goto("WAIT.md".into())),
                vec![
                    Fork {
                        state: "A.md".into(),
                        id: None,
                    },
                    Fork {
                        state: "B.md".into(),
                        id: None,
                    },
                ],
            ),
        );
        let ids: Vec<&str> = outcome.forks.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["main.1", "main.2"]);
        assert_eq!(outcome.agent.fork_counter, 2);

        let outcome = apply(
            outcome.agent,
            directives(
                Some(Transition::Goto("WAIT.md".into())),
                vec![Fork {
                    state: "C.md".into(),
                    id: None,
                }],
            ),
        );
        assert_eq!(outcome.forks[0].id, "main.3");
    }

    #[test]
    fn fork_without_primary_transition_spawns_nothing() {
        let outcome = apply(
            agent_with_session(),
            directives(
                None,
                vec![Fork {
                    state: "WORKER.md".into(),
                    id: Some("w1".into()),
                }],
            ),
        );
        assert!(outcome.forks.is_empty());
        assert!(matches!(outcome.disposition, Disposition::Retrying { .. }));
    }

    #[test]
    fn script_state_detection() {
        assert!(is_script_state("CHECK.sh"));
        assert!(is_script_state("CHECK.SH"));
        assert!(is_script_state("verify.bat"));
        assert!(!is_script_state("START.md"));
        assert!(!is_script_state("notes.txt"));
    }

    #[test]
    fn render_prompt_interpolates_result() {
        let rendered = render_prompt(
            "main",
            "The sub-task returned: {{result}}",
            Some("42".into()),
        );
        assert_eq!(rendered, "The sub-task returned: 42");
    }

    #[test]
    fn render_prompt_without_placeholder_unchanged() {
        let body = "Just do the thing.\n<goto>NEXT.md</goto>";
        assert_eq!(render_prompt("main", body, Some("ignored".into())), body);
        assert_eq!(render_prompt("main", body, None), body);
    }

    #[test]
    fn render_prompt_conditional_on_result() {
        let body = "{{#if result}}Got {{result}}{{else}}First pass{{/if}}";
        assert_eq!(render_prompt("main", body, None), "First pass");
        assert_eq!(
            render_prompt("main", body, Some("42".into())),
            "Got 42"
        );
    }

    #[test]
    fn tool_detail_prefers_command() {
        let input = serde_json::json!({"command": "ls -la", "file_path": "x"});
        assert_eq!(tool_detail(&input).as_deref(), Some("ls -la"));
        let input = serde_json::json!({"file_path": "notes.md"});
        assert_eq!(tool_detail(&input).as_deref(), Some("notes.md"));
        let input = serde_json::json!({"other": 1});
        assert_eq!(tool_detail(&input), None);
    }
}
