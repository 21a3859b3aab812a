//! Extraction of control directives from state output.
//!
//! Prompt and script states steer their agent by emitting XML-ish tags in
//! their output. Tags are matched ASCII case-insensitively; when a response
//! carries several directives, the last well-formed one in textual order
//! wins. `<fork>` tags are collected separately — forking spawns a sibling
//! while the emitting agent continues along its own transition.

/// A control directive emitted by a state to steer its agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Fall through to the named state; the session is preserved.
    Goto(String),
    /// Switch to the named state and discard the session.
    Reset(String),
    /// Push a return frame and run the named state in a fresh session.
    Call(String),
    /// Pop a return frame, or terminate the agent when the stack is empty.
    /// The payload is the return value.
    Result(String),
}

impl Transition {
    /// Short lowercase name for display and logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Transition::Goto(_) => "goto",
            Transition::Reset(_) => "reset",
            Transition::Call(_) => "call",
            Transition::Result(_) => "result",
        }
    }
}

/// A `<fork>` directive: spawn a sibling agent at the named state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fork {
    pub state: String,
    /// Child name from a trailing `<id>` tag, if one was supplied.
    pub id: Option<String>,
}

/// Everything extracted from one response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Directives {
    /// The last non-fork tag in textual order, or `None` when the response
    /// contains no transition (a retryable authoring error).
    pub transition: Option<Transition>,
    /// All `<fork>` directives in textual order.
    pub forks: Vec<Fork>,
}

/// Parse all control directives from a state's output.
pub fn parse_directives(text: &str) -> Directives {
    let mut last: Option<(usize, Transition)> = None;

    let mut consider = |pos: usize, transition: Transition| {
        if last.as_ref().is_none_or(|(p, _)| pos > *p) {
            last = Some((pos, transition));
        }
    };

    for (pos, inner) in find_tags(text, "goto") {
        if let Some(name) = bare_filename(inner) {
            consider(pos, Transition::Goto(name));
        }
    }
    for (pos, inner) in find_tags(text, "reset") {
        if let Some(name) = bare_filename(inner) {
            consider(pos, Transition::Reset(name));
        }
    }
    for (pos, inner) in find_tags(text, "call") {
        if let Some(name) = bare_filename(inner) {
            consider(pos, Transition::Call(name));
        }
    }
    for (pos, inner) in find_tags(text, "result") {
        consider(pos, Transition::Result(inner.trim().to_string()));
    }

    let fork_tags = find_tags(text, "fork");
    let id_tags = find_tags(text, "id");
    let mut forks = Vec::new();
    for (i, (pos, inner)) in fork_tags.iter().enumerate() {
        let Some(state) = bare_filename(inner) else {
            continue;
        };
        // An <id> tag names the fork it follows, up to the next <fork>.
        let next_fork = fork_tags.get(i + 1).map_or(usize::MAX, |(p, _)| *p);
        let id = id_tags
            .iter()
            .find(|(ip, _)| *ip > *pos && *ip < next_fork)
            .and_then(|(_, name)| bare_filename(name));
        forks.push(Fork { state, id });
    }

    Directives {
        transition: last.map(|(_, t)| t),
        forks,
    }
}

/// Trim a tag payload expected to hold a bare filename.
///
/// Returns `None` for empty payloads — an empty target is not well-formed
/// and must not shadow an earlier valid tag.
fn bare_filename(inner: &str) -> Option<String> {
    let trimmed = inner.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Find every well-formed `<tag>…</tag>` pair, ASCII case-insensitively.
///
/// Returns `(open_position, inner_text)` pairs in textual order. Unclosed
/// tags are ignored.
fn find_tags<'a>(text: &'a str, tag: &str) -> Vec<(usize, &'a str)> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut pos = 0;

    while let Some(start) = find_ignore_ascii_case(text, &open, pos) {
        let after_open = start + open.len();
        let Some(end) = find_ignore_ascii_case(text, &close, after_open) else {
            break;
        };
        out.push((start, &text[after_open..end]));
        pos = end + close.len();
    }

    out
}

/// ASCII-case-insensitive substring search starting at `from`.
fn find_ignore_ascii_case(haystack: &str, needle: &str, from: usize) -> Option<usize> {
    let h = haystack.as_bytes();
    let n = needle.as_bytes();
    if n.is_empty() || from + n.len() > h.len() {
        return None;
    }
    (from..=h.len() - n.len()).find(|&i| h[i..i + n.len()].eq_ignore_ascii_case(n))
}
