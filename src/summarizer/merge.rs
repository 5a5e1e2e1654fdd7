// src/summarizer/merge.rs
// Merge directive validation and application — spec §4.6.6.

use super::parse::ParsedSummary;
use crate::milestone::{self, Milestone, Phase2Content};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub enum MergeError {
    MissingSource(String),
    NotAdjacent,
    EmptyDirective,
}

impl std::fmt::Display for MergeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeError::MissingSource(id) => write!(f, "merge source {id} not found in session"),
            MergeError::NotAdjacent => write!(f, "merge sources are not adjacent indices"),
            MergeError::EmptyDirective => write!(f, "merge directive lists no sources"),
        }
    }
}

impl std::error::Error for MergeError {}

/// Result of a successful merge application: the indices the survivor and
/// absorbed milestones held *before* resequencing, needed so the vector
/// store can be told exactly which original indices to delete.
pub struct MergeOutcome {
    pub survivor_original_index: usize,
    pub absorbed_original_indices: Vec<usize>,
}

/// Apply one merge directive to a session's full milestone list in place.
/// `milestones` must already be densely indexed. On success the list is
/// mutated (absorbed entries removed, survivor updated) and resequenced;
/// on error the list is left untouched.
pub fn apply_merge(
    milestones: &mut Vec<Milestone>,
    directive: &ParsedSummary,
    model_used: &str,
    now: DateTime<Utc>,
) -> Result<MergeOutcome, MergeError> {
    if directive.merged_from.is_empty() {
        return Err(MergeError::EmptyDirective);
    }

    let mut source_indices = Vec::with_capacity(directive.merged_from.len());
    for id in &directive.merged_from {
        let (_, idx) = milestone::split_id(id).ok_or_else(|| MergeError::MissingSource(id.clone()))?;
        if idx >= milestones.len() || milestones[idx].id() != *id {
            return Err(MergeError::MissingSource(id.clone()));
        }
        source_indices.push(idx);
    }

    let mut sorted = source_indices.clone();
    sorted.sort_unstable();
    sorted.dedup();
    if sorted.len() != source_indices.len() {
        return Err(MergeError::MissingSource("duplicate source id".to_string()));
    }
    let is_adjacent = sorted
        .windows(2)
        .all(|w| w[1] == w[0] + 1);
    if !is_adjacent {
        return Err(MergeError::NotAdjacent);
    }

    let survivor_index = source_indices[0];
    let absorbed_indices: Vec<usize> = source_indices[1..].to_vec();

    // Combine Phase 1 metadata across the whole group onto the survivor.
    let mut start_turn = milestones[survivor_index].start_turn;
    let mut end_turn = milestones[survivor_index].end_turn;
    let mut start_timestamp = milestones[survivor_index].start_timestamp;
    let mut end_timestamp = milestones[survivor_index].end_timestamp;
    let mut user_prompts = milestones[survivor_index].user_prompts.clone();
    let mut files_modified = milestones[survivor_index].files_modified.clone();
    let mut files_read = milestones[survivor_index].files_read.clone();
    let mut tool_use_summary = milestones[survivor_index].tool_use_summary.clone();
    let mut task_completions = milestones[survivor_index].task_completions.clone();
    let mut subagent_count = milestones[survivor_index].subagent_count;

    for &idx in &absorbed_indices {
        let m = &milestones[idx];
        start_turn = start_turn.min(m.start_turn);
        end_turn = end_turn.max(m.end_turn);
        if m.start_timestamp < start_timestamp {
            start_timestamp = m.start_timestamp;
        }
        if m.end_timestamp > end_timestamp {
            end_timestamp = m.end_timestamp;
        }
        user_prompts.extend(m.user_prompts.clone());
        for f in &m.files_modified {
            if !files_modified.contains(f) {
                files_modified.push(f.clone());
            }
        }
        for f in &m.files_read {
            if !files_read.contains(f) {
                files_read.push(f.clone());
            }
        }
        for (tool, count) in &m.tool_use_summary {
            *tool_use_summary.entry(tool.clone()).or_insert(0) += count;
        }
        task_completions.extend(m.task_completions.clone());
        subagent_count += m.subagent_count;
    }
    user_prompts.sort_by_key(|p| p.timestamp);

    let survivor = &mut milestones[survivor_index];
    survivor.start_turn = start_turn;
    survivor.end_turn = end_turn;
    survivor.start_timestamp = start_timestamp;
    survivor.end_timestamp = end_timestamp;
    survivor.user_prompts = user_prompts;
    survivor.files_modified = files_modified;
    survivor.files_read = files_read;
    survivor.tool_use_summary = tool_use_summary;
    survivor.task_completions = task_completions;
    survivor.subagent_count = subagent_count;
    survivor.phase2 = Some(Phase2Content {
        title: directive.title.clone(),
        description: directive.description.clone(),
        milestone_type: directive.milestone_type,
        outcome: directive.outcome.clone(),
        facts: directive.facts.clone(),
        concepts: directive.concepts.clone(),
        architecture_relevant: directive.architecture_relevant,
        generated_at: now,
        model_used: model_used.to_string(),
        merged_from: directive.merged_from.clone(),
    });
    survivor.merged_from = directive.merged_from.clone();

    // Remove absorbed entries in descending index order so earlier removals
    // don't shift the indices still pending removal.
    let mut descending = absorbed_indices.clone();
    descending.sort_unstable_by(|a, b| b.cmp(a));
    for idx in descending {
        milestones.remove(idx);
    }
    milestone::resequence(milestones);

    Ok(MergeOutcome {
        survivor_original_index: survivor_index,
        absorbed_original_indices: absorbed_indices,
    })
}
