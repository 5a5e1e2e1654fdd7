// src/transcript.rs
// The normalized session-transcript contract consumed by the boundary
// detector and the re-extraction reconciler.
//
// The transcript itself is produced upstream by a session-log parser that is
// out of scope for this crate (see spec §2, "session-transcript parser").
// This module only defines the shape of that contract plus a builder used by
// tests and by callers wiring in their own parser.

use chrono::{DateTime, Utc};
use serde_json::Map as JsonMap;
use serde_json::Value;
use std::path::PathBuf;

/// A single real or system-injected user prompt.
#[derive(Debug, Clone)]
pub struct UserPrompt {
    pub turn: usize,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    /// `false` for system-injected messages (hook output, queued reminders, …).
    pub is_real: bool,
}

/// A tool invocation attributed to a turn.
#[derive(Debug, Clone)]
pub struct ToolUse {
    pub turn: usize,
    pub name: String,
    pub input: JsonMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

/// A task tracked by the session (todo-list style), with its status as of
/// the turn it was observed.
#[derive(Debug, Clone)]
pub struct TaskCompletion {
    pub turn: usize,
    pub subject: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanStatus {
    Proposed,
    Approved,
    Rejected,
}

/// A plan proposal/approval event.
#[derive(Debug, Clone)]
pub struct PlanApproval {
    pub turn: usize,
    pub status: PlanStatus,
}

/// A subagent spawn event.
#[derive(Debug, Clone, Copy)]
pub struct SubagentSpawn {
    pub turn: usize,
}

/// Normalized, read-only view over an entire session transcript.
///
/// Turns are referenced by 0-based index; `num_turns` is the number of API
/// turns in the session, i.e. the valid range for `startTurn`/`endTurn` is
/// `0..num_turns`.
#[derive(Debug, Clone)]
pub struct SessionTranscript {
    pub session_id: String,
    pub num_turns: usize,
    pub cwd: String,
    pub file_path: PathBuf,
    pub first_timestamp: Option<DateTime<Utc>>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub user_prompts: Vec<UserPrompt>,
    pub tool_uses: Vec<ToolUse>,
    pub task_completions: Vec<TaskCompletion>,
    pub plan_approvals: Vec<PlanApproval>,
    pub subagent_spawns: Vec<SubagentSpawn>,
}

impl SessionTranscript {
    /// Real user prompts only, in turn order.
    pub fn real_prompts(&self) -> impl Iterator<Item = &UserPrompt> {
        self.user_prompts.iter().filter(|p| p.is_real)
    }

    /// Tool uses whose `turn` falls within `[start, end]` inclusive.
    pub fn tool_uses_in(&self, start: usize, end: usize) -> impl Iterator<Item = &ToolUse> {
        self.tool_uses
            .iter()
            .filter(move |t| t.turn >= start && t.turn <= end)
    }
}

/// Builder for constructing transcripts in tests and in adapters that sit in
/// front of a real transcript source.
#[derive(Debug, Default)]
pub struct SessionTranscriptBuilder {
    session_id: String,
    num_turns: usize,
    cwd: String,
    file_path: PathBuf,
    user_prompts: Vec<UserPrompt>,
    tool_uses: Vec<ToolUse>,
    task_completions: Vec<TaskCompletion>,
    plan_approvals: Vec<PlanApproval>,
    subagent_spawns: Vec<SubagentSpawn>,
}

impl SessionTranscriptBuilder {
    pub fn new(session_id: impl Into<String>, num_turns: usize) -> Self {
        Self {
            session_id: session_id.into(),
            num_turns,
            cwd: String::new(),
            file_path: PathBuf::new(),
            ..Default::default()
        }
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = path.into();
        self
    }

    pub fn user_prompt(mut self, turn: usize, timestamp: DateTime<Utc>, text: impl Into<String>, is_real: bool) -> Self {
        self.user_prompts.push(UserPrompt {
            turn,
            timestamp,
            text: text.into(),
            is_real,
        });
        self
    }

    pub fn tool_use(mut self, turn: usize, name: impl Into<String>, input: JsonMap<String, Value>) -> Self {
        self.tool_uses.push(ToolUse {
            turn,
            name: name.into(),
            input,
        });
        self
    }

    pub fn task_completed(mut self, turn: usize, subject: impl Into<String>) -> Self {
        self.task_completions.push(TaskCompletion {
            turn,
            subject: subject.into(),
            status: TaskStatus::Completed,
        });
        self
    }

    pub fn plan_approved(mut self, turn: usize) -> Self {
        self.plan_approvals.push(PlanApproval {
            turn,
            status: PlanStatus::Approved,
        });
        self
    }

    pub fn subagent(mut self, turn: usize) -> Self {
        self.subagent_spawns.push(SubagentSpawn { turn });
        self
    }

    pub fn build(self) -> SessionTranscript {
        let first_timestamp = self.user_prompts.iter().map(|p| p.timestamp).min();
        let last_timestamp = self.user_prompts.iter().map(|p| p.timestamp).max();
        SessionTranscript {
            session_id: self.session_id,
            num_turns: self.num_turns,
            cwd: self.cwd,
            file_path: self.file_path,
            first_timestamp,
            last_timestamp,
            user_prompts: self.user_prompts,
            tool_uses: self.tool_uses,
            task_completions: self.task_completions,
            plan_approvals: self.plan_approvals,
            subagent_spawns: self.subagent_spawns,
        }
    }
}

/// Tool input fields that identify a file path, by tool name. Used by the
/// boundary detector and segment builder to attribute reads/writes.
pub fn file_paths_touched(tool_use: &ToolUse) -> Vec<String> {
    const WRITE_FIELDS: &[&str] = &["file_path", "path", "notebook_path"];
    const READ_ONLY_TOOLS: &[&str] = &["Read", "Glob", "Grep"];
    let _ = READ_ONLY_TOOLS; // classification lives in milestone::segment; kept here for field extraction only.

    let mut paths = Vec::new();
    for field in WRITE_FIELDS {
        if let Some(Value::String(s)) = tool_use.input.get(*field) {
            paths.push(s.clone());
        }
    }
    paths
}

/// Whether a tool use is a write/edit (vs. a read-only lookup), used to
/// classify `filesModified` vs `filesRead`.
pub fn is_write_tool(name: &str) -> bool {
    matches!(name, "Write" | "Edit" | "NotebookEdit" | "MultiEdit")
}

/// Whether a tool use is a read-only file lookup.
pub fn is_read_tool(name: &str) -> bool {
    matches!(name, "Read" | "Glob" | "Grep")
}
