// src/summarizer/prompt.rs
// System prompt and milestone-rendering for Phase 2 enrichment calls —
// spec §4.6.4, §6 "System prompt for the LLM".

use crate::config::Phase2Model;
use crate::milestone::Milestone;
use crate::store::MilestoneStore;
use std::fmt::Write as _;

/// Stable contract: enumerates the six closed milestone types, the closed
/// concept vocabulary, field rules, and the architecture-relevance
/// criterion. Implementations must not let model output widen either closed
/// vocabulary — the response validator (`parse`) enforces that on the way
/// back in.
pub const SYSTEM_PROMPT: &str = r#"You summarize spans of an AI coding session into milestones for later semantic retrieval.

Each milestone must be classified as exactly one of:
- discovery: investigating or understanding existing code/behavior, no lasting change.
- implementation: new functionality added.
- bugfix: a defect corrected.
- refactor: internal restructuring with no behavior change.
- decision: a design or approach choice was made and recorded.
- configuration: settings, dependencies, or environment changed.

For each milestone return:
- title: a short (<= 8 word) imperative summary.
- description: one or two sentences, concrete and specific.
- type: one of the six types above.
- outcome: what the session actually achieved, in the past tense.
- facts: short, standalone, searchable statements the session established (empty array if none).
- concepts: short noun phrases naming the technical areas touched (empty array if none).
- architectureRelevant: true only if this milestone changed a structural decision future sessions should know about (a new module boundary, a changed data model, a new external dependency). Default to false.

Respond with a single JSON object for one milestone, or a JSON array of objects for multiple, matching the ids given in the prompt. For multiple milestones from the same session that are really one unit of work, you may instead return one object whose `id` is the first milestone's id and whose `mergedFrom` lists every source id it represents, in order.

Never invent a type or concept outside what is described here."#;

/// Header line included with every milestone in a prompt, establishing the
/// `sessionId:index` identity the model must echo back in `id`.
fn milestone_header(m: &Milestone) -> String {
    format!("## {}", m.id())
}

fn milestone_body(m: &Milestone) -> String {
    let mut body = String::new();
    writeln!(body, "Turns {}-{}", m.start_turn, m.end_turn).ok();
    if !m.user_prompts.is_empty() {
        writeln!(body, "Prompts:").ok();
        for p in &m.user_prompts {
            writeln!(body, "- {}", p.text).ok();
        }
    }
    if !m.files_modified.is_empty() {
        writeln!(body, "Files modified: {}", m.files_modified.join(", ")).ok();
    }
    if !m.files_read.is_empty() {
        writeln!(body, "Files read: {}", m.files_read.join(", ")).ok();
    }
    if !m.tool_use_summary.is_empty() {
        let mut tools: Vec<String> = m
            .tool_use_summary
            .iter()
            .map(|(tool, count)| format!("{tool}x{count}"))
            .collect();
        tools.sort();
        writeln!(body, "Tool uses: {}", tools.join(", ")).ok();
    }
    if !m.task_completions.is_empty() {
        let subjects: Vec<&str> = m.task_completions.iter().map(|t| t.subject.as_str()).collect();
        writeln!(body, "Tasks completed: {}", subjects.join(", ")).ok();
    }
    if m.subagent_count > 0 {
        writeln!(body, "Subagents spawned: {}", m.subagent_count).ok();
    }
    body
}

/// A batch of size 1 uses a single-object prompt; size >= 2 uses an array
/// prompt with merge instructions when more than one milestone shares a
/// session.
pub fn render_batch_prompt(milestones: &[Milestone]) -> String {
    if milestones.len() == 1 {
        return render_single_prompt(&milestones[0]);
    }

    let mut prompt = String::new();
    prompt.push_str("Summarize each of the following milestones. Return a JSON array with one entry per milestone, each entry's \"id\" matching its heading below.\n\n");

    let multi_session_group = has_same_session_run(milestones);
    if multi_session_group {
        prompt.push_str("Some milestones below belong to the same session and may represent one continuous unit of work — if so, merge them into a single summary per the merge-directive format described in the system prompt.\n\n");
    }

    for m in milestones {
        prompt.push_str(&milestone_header(m));
        prompt.push('\n');
        prompt.push_str(&milestone_body(m));
        prompt.push('\n');
    }
    prompt
}

pub fn render_single_prompt(m: &Milestone) -> String {
    let mut prompt = String::new();
    prompt.push_str("Summarize the following milestone. Return a single JSON object.\n\n");
    prompt.push_str(&milestone_header(m));
    prompt.push('\n');
    prompt.push_str(&milestone_body(m));
    prompt
}

fn has_same_session_run(milestones: &[Milestone]) -> bool {
    let mut seen = std::collections::HashSet::new();
    for m in milestones {
        if !seen.insert(m.session_id.as_str()) {
            return true;
        }
    }
    false
}

impl Phase2Model {
    pub fn as_model_str(&self) -> &'static str {
        match self {
            Phase2Model::Haiku => "haiku",
            Phase2Model::Sonnet => "sonnet",
            Phase2Model::Opus => "opus",
        }
    }
}

/// Model selection precedence: explicit runtime override (cleared after the
/// run) > settings > built-in default.
pub fn select_model(runtime_override: Option<&str>, settings_model: Phase2Model) -> String {
    runtime_override
        .map(|s| s.to_string())
        .unwrap_or_else(|| settings_model.as_model_str().to_string())
}

/// Resolve a milestone id to its live `Milestone`, used to build a fresh
/// batch prompt from a set of queue items.
pub fn resolve_milestones(store: &MilestoneStore, ids: &[String]) -> Vec<Milestone> {
    ids.iter().filter_map(|id| store.get_milestone_by_id(id)).collect()
}
