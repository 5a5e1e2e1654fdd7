// src/milestone/mod.rs
// The Milestone domain type and its lifecycle, plus the boundary detector,
// segment builder, thin-milestone handler, and re-extraction reconciler.

pub mod boundary;
pub mod reextract;
pub mod segment;
pub mod thin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{Display, EnumString};

pub use boundary::detect_boundaries;
pub use segment::extract_phase1;
pub use thin::is_substantive;

/// The six closed milestone types the enrichment model may assign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MilestoneType {
    Discovery,
    Implementation,
    Bugfix,
    Refactor,
    Decision,
    Configuration,
}

impl Default for MilestoneType {
    fn default() -> Self {
        Self::Implementation
    }
}

/// Phase 2 (LLM-enriched) content. Either every field is populated or the
/// whole milestone carries `phase2 == None` (spec §3 invariant 4).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Phase2Content {
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub milestone_type: MilestoneType,
    pub outcome: String,
    pub facts: Vec<String>,
    pub concepts: Vec<String>,
    pub architecture_relevant: bool,
    pub generated_at: DateTime<Utc>,
    pub model_used: String,
    #[serde(default)]
    pub merged_from: Vec<String>,
}

/// A single real user prompt retained on the milestone (not the whole
/// transcript — just what fell within this milestone's turn span).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptRecord {
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

/// A completed task captured within this milestone's span.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub subject: String,
}

/// The central entity: a contiguous span of session turns treated as one
/// unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub session_id: String,
    pub index: usize,

    pub start_turn: usize,
    pub end_turn: usize,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,

    pub user_prompts: Vec<PromptRecord>,
    pub files_modified: Vec<String>,
    pub files_read: Vec<String>,
    pub tool_use_summary: HashMap<String, u32>,
    pub task_completions: Vec<TaskRecord>,
    pub subagent_count: u32,

    pub phase2: Option<Phase2Content>,

    /// Non-empty only once this milestone has absorbed others via a merge
    /// directive or thin-milestone merge (source IDs, survivor first).
    pub merged_from: Vec<String>,
}

impl Milestone {
    /// Composite identity `sessionId:index`.
    pub fn id(&self) -> String {
        make_id(&self.session_id, self.index)
    }

    pub fn phase(&self) -> u8 {
        if self.phase2.is_some() { 2 } else { 1 }
    }

    /// Substantive per spec §4.4 — thin milestones never persist at phase 2
    /// unless absorbed into a neighbour.
    pub fn is_substantive(&self) -> bool {
        thin::is_substantive(self)
    }

    /// Total count of all tool invocations recorded on this milestone.
    pub fn total_tool_uses(&self) -> u32 {
        self.tool_use_summary.values().sum()
    }
}

/// Build the composite `sessionId:index` id without needing a `Milestone`.
pub fn make_id(session_id: &str, index: usize) -> String {
    format!("{session_id}:{index}")
}

/// Split a composite id back into `(session_id, index)`. Returns `None` if
/// the id is malformed (no `:` or a non-numeric suffix).
pub fn split_id(id: &str) -> Option<(&str, usize)> {
    let (sid, idx) = id.rsplit_once(':')?;
    let idx: usize = idx.parse().ok()?;
    Some((sid, idx))
}

/// Re-assign `index` (and therefore `id`) densely over a session's
/// milestone list, in place. Used after every mutation (merge, thin
/// absorption, deletion, re-extraction) per spec §3 invariant 1.
pub fn resequence(milestones: &mut [Milestone]) {
    for (i, m) in milestones.iter_mut().enumerate() {
        m.index = i;
    }
}

/// Validate spec §3 invariant 1 and 2 — used by tests and as a debug assert
/// at the store boundary.
pub fn validate_dense_ordering(milestones: &[Milestone]) -> std::result::Result<(), String> {
    for (i, m) in milestones.iter().enumerate() {
        if m.index != i {
            return Err(format!(
                "milestone at position {i} has index {} (expected {i})",
                m.index
            ));
        }
        if i > 0 && m.start_turn <= milestones[i - 1].end_turn {
            return Err(format!(
                "milestone {i} startTurn {} does not exceed previous endTurn {}",
                m.start_turn,
                milestones[i - 1].end_turn
            ));
        }
        let expected_phase2 = m.phase2.is_some();
        let _ = expected_phase2; // phase2 is already Option; all-or-nothing is structural.
    }
    Ok(())
}
