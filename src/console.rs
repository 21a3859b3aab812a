//! Hierarchical console reporting for workflow execution.
//!
//! Many agents emit events concurrently, so every agent-tagged line is
//! preceded by a `[agent_id] state` context header whenever the
//! `(agent, state)` context differs from the previous line's. All mutable
//! tracking state sits behind one mutex; lines from different agents never
//! interleave within a line.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Mutex;

use crossterm::tty::IsTty;
use unicode_width::UnicodeWidthChar;

const AGENT_COLORS: &[&str] = &[
    "\x1b[36m", // cyan
    "\x1b[33m", // yellow
    "\x1b[35m", // magenta
    "\x1b[32m", // green
    "\x1b[34m", // blue
    "\x1b[31m", // red
];
const RESET: &str = "\x1b[0m";
const ERROR_COLOR: &str = "\x1b[31m";
const WARNING_COLOR: &str = "\x1b[33m";

const MIN_CONTENT_WIDTH: usize = 40;
const MAX_CONTENT_WIDTH: usize = 160;
const DEFAULT_WIDTH: usize = 80;

// Prefix widths used when truncating content to fit the terminal.
const PREFIX_TREE_BRANCH: usize = 5; // "  ├─ "
const PREFIX_RESULT: usize = 15; // "  ⇒ Result: \"" plus closing quote

/// Transition flavor, for display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Goto,
    Reset,
    Call,
    Fork,
    Result,
}

struct Symbols {
    branch: &'static str,
    end: &'static str,
    arrow: &'static str,
    result_arrow: &'static str,
    fork: &'static str,
}

const UNICODE_SYMBOLS: Symbols = Symbols {
    branch: "├─",
    end: "└─",
    arrow: "→",
    result_arrow: "⇒",
    fork: "⑂",
};

const ASCII_SYMBOLS: Symbols = Symbols {
    branch: "|-",
    end: "`-",
    arrow: "->",
    result_arrow: "=>",
    fork: "++",
};

/// Reporter construction options. `None` fields are auto-detected for the
/// stdout reporter and default conservative for custom writers.
#[derive(Debug, Clone, Default)]
pub struct ReporterOptions {
    /// Suppress progress and tool lines (never errors, headers, costs,
    /// or results).
    pub quiet: bool,
    /// Fixed terminal width; `None` re-detects on every line.
    pub width: Option<usize>,
    pub color: Option<bool>,
    pub unicode: Option<bool>,
}

struct Inner<W> {
    out: W,
    agent_colors: HashMap<String, &'static str>,
    color_counter: usize,
    /// agent_id -> current state, for context headers.
    agent_states: HashMap<String, String>,
    last_context: Option<(String, String)>,
    /// agent_id -> last tool name, for tool error attribution.
    last_tool: HashMap<String, String>,
}

/// Formatted, capability-aware console output for workflow execution.
pub struct Reporter<W: Write = io::Stdout> {
    quiet: bool,
    color: bool,
    symbols: &'static Symbols,
    width_override: Option<usize>,
    inner: Mutex<Inner<W>>,
}

impl Reporter<io::Stdout> {
    /// Reporter on stdout with terminal capabilities auto-detected.
    pub fn stdout(options: &ReporterOptions) -> Self {
        let tty = io::stdout().is_tty();
        let resolved = ReporterOptions {
            quiet: options.quiet,
            width: options.width,
            color: Some(options.color.unwrap_or_else(|| tty && detect_color())),
            unicode: Some(options.unicode.unwrap_or_else(|| tty && detect_unicode())),
        };
        Self::with_writer(io::stdout(), &resolved)
    }
}

impl<W: Write> Reporter<W> {
    pub fn with_writer(out: W, options: &ReporterOptions) -> Self {
        Reporter {
            quiet: options.quiet,
            color: options.color.unwrap_or(false),
            symbols: if options.unicode.unwrap_or(false) {
                &UNICODE_SYMBOLS
            } else {
                &ASCII_SYMBOLS
            },
            width_override: options.width,
            inner: Mutex::new(Inner {
                out,
                agent_colors: HashMap::new(),
                color_counter: 0,
                agent_states: HashMap::new(),
                last_context: None,
                last_tool: HashMap::new(),
            }),
        }
    }

    /// Recover the writer, e.g. to inspect captured output in tests.
    pub fn into_writer(self) -> W {
        self.inner
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<W>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // ── Workflow-level events ───────────────────────────────────────────

    pub fn workflow_started(&self, workflow_id: &str, scope: &str) {
        let mut inner = self.lock();
        let timestamp = chrono::Local::now().format("%H:%M:%S");
        print_line(&mut inner.out, &format!("[{timestamp}] Workflow: {workflow_id}"));
        print_line(&mut inner.out, &format!("[{timestamp}] Scope: {scope}"));
        print_line(&mut inner.out, "");
    }

    pub fn workflow_completed(&self, total_cost: f64) {
        let mut inner = self.lock();
        print_line(
            &mut inner.out,
            &format!("\nWorkflow completed. Total cost: ${total_cost:.4}"),
        );
    }

    pub fn workflow_paused(&self, workflow_id: &str, total_cost: f64, paused_count: usize) {
        let mut inner = self.lock();
        print_line(
            &mut inner.out,
            &format!("\nWorkflow paused ({paused_count} agent(s) paused). Cost: ${total_cost:.4}"),
        );
        print_line(
            &mut inner.out,
            &format!("Resume with: waymark resume {workflow_id}"),
        );
    }

    // ── Per-agent events ────────────────────────────────────────────────

    /// Announce state execution. Always printed, even when the context has
    /// not changed — retries re-emit the header on purpose.
    pub fn state_started(&self, agent_id: &str, state: &str) {
        let mut inner = self.lock();
        inner
            .agent_states
            .insert(agent_id.to_string(), state.to_string());
        inner.last_context = Some((agent_id.to_string(), state.to_string()));
        let header = self.format_header(&mut inner, agent_id, state);
        print_line(&mut inner.out, &header);
    }

    pub fn progress_message(&self, agent_id: &str, message: &str) {
        if self.quiet {
            return;
        }
        let mut inner = self.lock();
        self.ensure_context(&mut inner, agent_id);
        let truncated = truncate(message, self.available_width(PREFIX_TREE_BRANCH));
        let line = format!("  {} {truncated}", self.symbols.branch);
        print_line(&mut inner.out, &line);
    }

    pub fn tool_invocation(&self, agent_id: &str, tool_name: &str, detail: Option<&str>) {
        if self.quiet {
            return;
        }
        let mut inner = self.lock();
        self.ensure_context(&mut inner, agent_id);
        inner
            .last_tool
            .insert(agent_id.to_string(), tool_name.to_string());
        let line = match detail {
            Some(detail) => {
                let prefix = PREFIX_TREE_BRANCH + tool_name.len() + 3;
                let truncated = truncate(detail, self.available_width(prefix));
                format!("  {} [{tool_name}] {truncated}", self.symbols.branch)
            }
            None => format!("  {} [{tool_name}]", self.symbols.branch),
        };
        print_line(&mut inner.out, &line);
    }

    pub fn tool_error(&self, agent_id: &str, error_message: &str, tool_name: Option<&str>) {
        let mut inner = self.lock();
        self.ensure_context(&mut inner, agent_id);

        let tool = tool_name
            .map(str::to_string)
            .or_else(|| inner.last_tool.get(agent_id).cloned());

        let error_str = match &tool {
            Some(tool) => {
                let truncated = truncate(error_message, self.available_width(14 + tool.len()));
                format!("! [{tool}] error: {truncated}")
            }
            None => {
                let truncated = truncate(error_message, self.available_width(16));
                format!("! Tool error: {truncated}")
            }
        };

        let line = format!("  {}", self.paint(&error_str, ERROR_COLOR));
        print_line(&mut inner.out, &line);
    }

    pub fn state_completed(&self, agent_id: &str, cost: f64, total_cost: f64) {
        let mut inner = self.lock();
        self.ensure_context(&mut inner, agent_id);
        let line = format!(
            "  {} Done (${cost:.4}, total: ${total_cost:.4})",
            self.symbols.end
        );
        print_line(&mut inner.out, &line);
    }

    pub fn transition(
        &self,
        agent_id: &str,
        target: &str,
        kind: TransitionKind,
        spawned_agent_id: Option<&str>,
    ) {
        let mut inner = self.lock();
        self.ensure_context(&mut inner, agent_id);
        match kind {
            TransitionKind::Fork => {
                let agent_str = self.format_agent_id(&mut inner, agent_id);
                let line = match spawned_agent_id {
                    Some(child) => format!(
                        "{agent_str} {} {target} {} {child}",
                        self.symbols.fork, self.symbols.arrow
                    ),
                    None => format!("{agent_str} {} {target}", self.symbols.fork),
                };
                print_line(&mut inner.out, &line);
            }
            // Result transitions are reported via agent_terminated.
            TransitionKind::Result => {}
            TransitionKind::Goto | TransitionKind::Reset | TransitionKind::Call => {
                let line = format!("  {} {target}", self.symbols.arrow);
                print_line(&mut inner.out, &line);
            }
        }
    }

    pub fn agent_terminated(&self, agent_id: &str, result: &str) {
        let mut inner = self.lock();
        self.ensure_context(&mut inner, agent_id);

        let body = extract_result_body(result);
        let truncated = truncate(body, self.available_width(PREFIX_RESULT));
        let line = format!("  {} Result: \"{truncated}\"", self.symbols.result_arrow);
        print_line(&mut inner.out, &line);

        inner.agent_states.remove(agent_id);
        inner.last_tool.remove(agent_id);
    }

    pub fn agent_paused(&self, agent_id: &str, reason: &str) {
        let mut inner = self.lock();
        self.ensure_context(&mut inner, agent_id);
        let line = format!("  {}", self.paint(&format!("|| Paused: {reason}"), WARNING_COLOR));
        print_line(&mut inner.out, &line);
    }

    pub fn error(&self, agent_id: &str, message: &str) {
        let mut inner = self.lock();
        self.ensure_context(&mut inner, agent_id);
        let line = format!("  {}", self.paint(&format!("! {message}"), ERROR_COLOR));
        print_line(&mut inner.out, &line);
    }

    pub fn script_started(&self, agent_id: &str, state: &str) {
        let mut inner = self.lock();
        inner
            .agent_states
            .insert(agent_id.to_string(), state.to_string());
        inner.last_context = Some((agent_id.to_string(), state.to_string()));
        let header = self.format_header(&mut inner, agent_id, state);
        print_line(&mut inner.out, &header);
        if !self.quiet {
            let line = format!("  {} Executing script...", self.symbols.branch);
            print_line(&mut inner.out, &line);
        }
    }

    pub fn script_completed(&self, agent_id: &str, exit_code: i32, duration_ms: u128) {
        let mut inner = self.lock();
        self.ensure_context(&mut inner, agent_id);
        let line = format!(
            "  {} Done (exit {exit_code}, {duration_ms}ms)",
            self.symbols.end
        );
        print_line(&mut inner.out, &line);
    }

    // ── Internals ───────────────────────────────────────────────────────

    /// Re-emit the `[agent] state` header when the last printed line
    /// belonged to a different (agent, state) context.
    fn ensure_context(&self, inner: &mut Inner<W>, agent_id: &str) {
        let Some(state) = inner.agent_states.get(agent_id).cloned() else {
            return;
        };
        let context = (agent_id.to_string(), state.clone());
        if inner.last_context.as_ref() != Some(&context) {
            inner.last_context = Some(context);
            let header = self.format_header(inner, agent_id, &state);
            print_line(&mut inner.out, &header);
        }
    }

    fn format_header(&self, inner: &mut Inner<W>, agent_id: &str, state: &str) -> String {
        format!("{} {state}", self.format_agent_id(inner, agent_id))
    }

    fn format_agent_id(&self, inner: &mut Inner<W>, agent_id: &str) -> String {
        if !self.color {
            return format!("[{agent_id}]");
        }
        let color = match inner.agent_colors.get(agent_id) {
            Some(color) => *color,
            None => {
                let color = AGENT_COLORS[inner.color_counter % AGENT_COLORS.len()];
                inner.color_counter += 1;
                inner.agent_colors.insert(agent_id.to_string(), color);
                color
            }
        };
        format!("{color}[{agent_id}]{RESET}")
    }

    fn paint(&self, text: &str, color: &str) -> String {
        if self.color {
            format!("{color}{text}{RESET}")
        } else {
            text.to_string()
        }
    }

    /// Content width available next to a prefix of the given length,
    /// clamped to sane bounds. Width is re-detected per call so terminal
    /// resizes take effect, unless an override is set.
    fn available_width(&self, prefix_length: usize) -> usize {
        let terminal_width = self
            .width_override
            .unwrap_or_else(detect_terminal_width);
        terminal_width
            .saturating_sub(prefix_length + 2)
            .clamp(MIN_CONTENT_WIDTH, MAX_CONTENT_WIDTH)
    }
}

fn print_line<W: Write>(out: &mut W, line: &str) {
    let _ = writeln!(out, "{line}");
    let _ = out.flush();
}

/// Truncate to a display width, appending an ellipsis when content is cut.
fn truncate(message: &str, max_width: usize) -> String {
    let total: usize = message.chars().map(|c| c.width().unwrap_or(0)).sum();
    if total <= max_width {
        return message.to_string();
    }

    let budget = max_width.saturating_sub(3);
    let mut out = String::new();
    let mut used = 0;
    for c in message.chars() {
        let w = c.width().unwrap_or(0);
        if used + w > budget {
            break;
        }
        out.push(c);
        used += w;
    }
    out.push_str("...");
    out
}

/// Pull the inner text out of a `<result>…</result>` wrapper, if present.
fn extract_result_body(result: &str) -> &str {
    if let Some(start) = result.find("<result>")
        && let Some(end) = result[start..].find("</result>")
    {
        return &result[start + "<result>".len()..start + end];
    }
    result
}

// ── Capability detection ────────────────────────────────────────────────

fn detect_color() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    if let Ok(term) = std::env::var("TERM")
        && term.to_lowercase().contains("color")
    {
        return true;
    }
    // Windows Terminal advertises itself via WT_SESSION.
    std::env::var_os("WT_SESSION").is_some()
}

fn detect_unicode() -> bool {
    if let Ok(term) = std::env::var("TERM") {
        let term = term.to_lowercase();
        if term.contains("xterm") || term.contains("utf") {
            return true;
        }
    }
    std::env::var_os("WT_SESSION").is_some()
}

/// Terminal width: `COLUMNS` first (the non-TTY escape hatch), then the
/// terminal itself, then 80.
fn detect_terminal_width() -> usize {
    if let Ok(columns) = std::env::var("COLUMNS")
        && let Ok(width) = columns.parse::<usize>()
        && width > 0
    {
        return width;
    }
    if let Ok((cols, _rows)) = crossterm::terminal::size()
        && cols > 0
    {
        return cols as usize;
    }
    DEFAULT_WIDTH
}
