//! The persistent workflow record and its on-disk journal.
//!
//! One JSON document per workflow id lives under the state directory
//! (default `~/.waymark/state`, overridable via `WAYMARK_STATE_DIR`).
//! Saves are atomic (temp sibling + fsync + rename) and serialized by an
//! in-process mutex; cross-process ownership is enforced with an advisory
//! file lock per workflow. Unknown JSON keys round-trip untouched so older
//! binaries can open newer state files.

use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("workflow '{0}' not found")]
    NotFound(String),
    #[error("malformed state file for workflow '{id}': {source}")]
    Malformed {
        id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("workflow '{0}' is already owned by another process")]
    Locked(String),
    #[error("state i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle status of an agent. Terminated agents are removed from the
/// workflow rather than marked, so only these two persist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentStatus {
    #[default]
    Running,
    Paused,
}

/// A subroutine return frame pushed by `<call>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Conversation to re-enter when the callee returns.
    pub caller_session: Option<String>,
    /// State to resume at; must resolve in the scope.
    pub return_state: String,
}

/// One cursor walking the state graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    /// Filename of the next state to execute.
    pub current_state: String,
    /// Resume token, or `None` when the next step starts a fresh session.
    pub session_id: Option<String>,
    #[serde(default)]
    pub stack: Vec<Frame>,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_reason: Option<String>,
    /// Consecutive no-transition retries for the current state.
    #[serde(default)]
    pub retries: u32,
    /// Monotonic counter backing auto-generated child ids.
    #[serde(default)]
    pub fork_counter: u32,
    /// A returned child's `<result>` body, awaiting delivery into this
    /// agent's next prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_result: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Agent {
    pub fn new(id: impl Into<String>, entry_state: impl Into<String>) -> Self {
        Agent {
            id: id.into(),
            current_state: entry_state.into(),
            session_id: None,
            stack: Vec::new(),
            status: AgentStatus::Running,
            paused_reason: None,
            retries: 0,
            fork_counter: 0,
            pending_result: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == AgentStatus::Running
    }

    /// Mark the agent paused with the given reason.
    pub fn pause(&mut self, reason: &str) {
        self.status = AgentStatus::Paused;
        self.paused_reason = Some(reason.to_string());
    }

    /// Return a paused agent to the running set.
    pub fn unpause(&mut self) {
        self.status = AgentStatus::Running;
        self.paused_reason = None;
    }
}

/// Why an agent died, kept on the workflow after the agent itself is gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub agent_id: String,
    pub state: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// The top-level persistent record: one multi-agent execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub workflow_id: String,
    /// Content source: a directory path or a zip-archive path.
    pub scope: String,
    /// Order is display-only.
    pub agents: Vec<Agent>,
    /// Running USD sum of every LLM invocation. Monotonically non-decreasing.
    pub total_cost: f64,
    #[serde(default)]
    pub failures: Vec<FailureRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Workflow {
    /// Create a fresh workflow with a single `main` agent at `entry_state`.
    pub fn create(scope: &str, entry_state: &str) -> Self {
        let now = Utc::now();
        Workflow {
            workflow_id: generate_workflow_id(),
            scope: scope.to_string(),
            agents: vec![Agent::new("main", entry_state)],
            total_cost: 0.0,
            failures: Vec::new(),
            created_at: now,
            updated_at: now,
            extra: serde_json::Map::new(),
        }
    }

    pub fn agent_mut(&mut self, id: &str) -> Option<&mut Agent> {
        self.agents.iter_mut().find(|a| a.id == id)
    }

    pub fn has_agent(&self, id: &str) -> bool {
        self.agents.iter().any(|a| a.id == id)
    }

    /// Complete means every agent has terminated.
    pub fn is_complete(&self) -> bool {
        self.agents.is_empty()
    }
}

// ── Workflow id generation ──────────────────────────────────────────────

const ADJECTIVES: &[&str] = &[
    "swift", "quick", "bright", "calm", "clever", "cool", "crisp", "eager", "fast", "fresh",
    "keen", "light", "neat", "prime", "sharp", "silent", "smooth", "steady", "warm", "bold",
];

const NOUNS: &[&str] = &[
    "fox", "wolf", "bear", "hawk", "lion", "tiger", "raven", "eagle", "falcon", "otter", "river",
    "stream", "brook", "delta", "canyon", "spark", "flame", "ember", "comet", "nova",
];

/// Generate a readable workflow id: `adjective-noun-NNNN`.
pub fn generate_workflow_id() -> String {
    let mut rng = rand::rng();
    let adj = ADJECTIVES.choose(&mut rng).copied().unwrap_or("swift");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("fox");
    let num: u32 = rng.random_range(0..10000);
    format!("{adj}-{noun}-{num}")
}

// ── State store ─────────────────────────────────────────────────────────

/// Exclusive ownership of a workflow for the orchestrator's lifetime.
/// Released when dropped (the file lock is released by fs2 on drop).
#[derive(Debug)]
pub struct WorkflowLock {
    _file: File,
}

/// Load/save/list workflow journals under one state directory.
pub struct StateStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl StateStore {
    /// Open a store, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(StateStore {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// The conventional state directory: `WAYMARK_STATE_DIR` if set,
    /// otherwise `~/.waymark/state`.
    pub fn default_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("WAYMARK_STATE_DIR") {
            return PathBuf::from(dir);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".waymark")
            .join("state")
    }

    fn state_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Load a workflow by id.
    pub fn load(&self, id: &str) -> Result<Workflow, StateError> {
        let path = self.state_path(id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::NotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&contents).map_err(|source| StateError::Malformed {
            id: id.to_string(),
            source,
        })
    }

    /// Atomically persist a workflow: serialize, write a temp sibling,
    /// fsync, rename over the previous snapshot.
    pub fn save(&self, workflow: &Workflow) -> Result<(), StateError> {
        let _guard = self.write_lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let path = self.state_path(&workflow.workflow_id);
        let tmp_path = self.dir.join(format!("{}.json.tmp", workflow.workflow_id));

        let json = serde_json::to_vec_pretty(workflow).map_err(|source| StateError::Malformed {
            id: workflow.workflow_id.clone(),
            source,
        })?;

        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&json)?;
        tmp.sync_all()?;
        drop(tmp);
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Ids of every workflow present in the store.
    pub fn list(&self) -> Result<Vec<String>, StateError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Take exclusive cross-process ownership of a workflow.
    ///
    /// Concurrent writers from other processes are not supported; the
    /// advisory lock turns that rule into an error instead of corruption.
    pub fn acquire(&self, id: &str) -> Result<WorkflowLock, StateError> {
        let lock_path = self.dir.join(format!("{id}.lock"));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(WorkflowLock {
                _file: file,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                Err(StateError::Locked(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
