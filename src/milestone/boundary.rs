// src/milestone/boundary.rs
// Boundary detection — step 1 and 2 of Phase 1 extraction (spec §4.3).
//
// Walks a transcript once, accumulating strength-weighted signals per turn,
// then selects the turns whose accumulated strength clears the boundary
// threshold.

use crate::transcript::SessionTranscript;
use std::collections::{BTreeMap, HashSet};

/// Signal strengths, exactly as specified.
const STRENGTH_USER_PROMPT: u32 = 10;
const STRENGTH_TRIVIAL_PROMPT: u32 = 1;
const STRENGTH_TIME_GAP: u32 = 8;
const STRENGTH_TASK_COMPLETED: u32 = 8;
const STRENGTH_PLAN_APPROVED: u32 = 7;
const STRENGTH_SUBAGENT: u32 = 6;
const STRENGTH_FILE_CONTEXT_SWITCH: u32 = 5;

/// A turn becomes a boundary once its accumulated strength reaches this.
const BOUNDARY_THRESHOLD: u32 = 5;

/// Prompts shorter than this (in chars, after trimming) are trivial.
const TRIVIAL_LENGTH: usize = 15;

/// Minimum gap between consecutive real user prompts to count as a "time gap" signal.
const TIME_GAP_MINUTES: i64 = 5;

/// File-context-switch: need at least this many distinct file-touching turns
/// to be meaningful, and overlap below this fraction to count as a switch.
const MIN_FILE_TOUCHING_TURNS: usize = 4;
const FILE_OVERLAP_THRESHOLD: f64 = 0.30;

const TRIVIAL_ACKNOWLEDGEMENTS: &[&str] = &[
    "yes", "ok", "okay", "k", "continue", "go", "go ahead", "lgtm", "approved", "sounds good",
    "sure", "yep", "yeah", "thanks", "thank you", "ty", "cool", "great", "perfect", "good",
    "do it", "proceed", "👍", "+1", "ack", "noted", "got it", "makes sense",
];

#[derive(Debug, Clone, Default)]
pub struct BoundarySignal {
    pub reasons: Vec<&'static str>,
    pub strength: u32,
}

/// Whether a prompt's text matches the closed trivial-acknowledgement list,
/// evaluated case-insensitively after trimming.
pub fn is_trivial_prompt(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.len() < TRIVIAL_LENGTH {
        return true;
    }
    let lowered = trimmed.to_lowercase();
    TRIVIAL_ACKNOWLEDGEMENTS.iter().any(|ack| lowered == *ack)
}

/// Accumulate signals for every candidate turn, then select boundaries.
/// Returns boundary turns sorted ascending.
pub fn detect_boundaries(transcript: &SessionTranscript) -> Vec<usize> {
    let mut signals: BTreeMap<usize, BoundarySignal> = BTreeMap::new();

    add_prompt_signals(transcript, &mut signals);
    add_task_and_plan_and_subagent_signals(transcript, &mut signals);
    add_file_context_switch_signals(transcript, &mut signals);

    let mut boundaries: Vec<usize> = signals
        .into_iter()
        .filter(|(_, s)| s.strength >= BOUNDARY_THRESHOLD)
        .map(|(turn, _)| turn)
        .collect();
    boundaries.sort_unstable();
    boundaries
}

/// Same as [`detect_boundaries`] but also returns the signal map, for callers
/// (tests, diagnostics) that want to see why a turn became a boundary.
pub fn detect_boundaries_with_signals(
    transcript: &SessionTranscript,
) -> (Vec<usize>, BTreeMap<usize, BoundarySignal>) {
    let mut signals: BTreeMap<usize, BoundarySignal> = BTreeMap::new();
    add_prompt_signals(transcript, &mut signals);
    add_task_and_plan_and_subagent_signals(transcript, &mut signals);
    add_file_context_switch_signals(transcript, &mut signals);

    let mut boundaries: Vec<usize> = signals
        .iter()
        .filter(|(_, s)| s.strength >= BOUNDARY_THRESHOLD)
        .map(|(turn, _)| *turn)
        .collect();
    boundaries.sort_unstable();
    (boundaries, signals)
}

fn add_signal(signals: &mut BTreeMap<usize, BoundarySignal>, turn: usize, reason: &'static str, strength: u32) {
    let entry = signals.entry(turn).or_default();
    entry.reasons.push(reason);
    entry.strength += strength;
}

fn add_prompt_signals(transcript: &SessionTranscript, signals: &mut BTreeMap<usize, BoundarySignal>) {
    let real_prompts: Vec<_> = transcript.real_prompts().collect();

    for prompt in &real_prompts {
        if is_trivial_prompt(&prompt.text) {
            add_signal(signals, prompt.turn, "trivial_prompt", STRENGTH_TRIVIAL_PROMPT);
        } else {
            add_signal(signals, prompt.turn, "user_prompt", STRENGTH_USER_PROMPT);
        }
    }

    for pair in real_prompts.windows(2) {
        let (prev, cur) = (pair[0], pair[1]);
        let gap = cur.timestamp.signed_duration_since(prev.timestamp);
        if gap.num_minutes() >= TIME_GAP_MINUTES {
            add_signal(signals, cur.turn, "time_gap", STRENGTH_TIME_GAP);
        }
    }
}

fn add_task_and_plan_and_subagent_signals(
    transcript: &SessionTranscript,
    signals: &mut BTreeMap<usize, BoundarySignal>,
) {
    for task in &transcript.task_completions {
        if task.status == crate::transcript::TaskStatus::Completed {
            add_signal(signals, task.turn, "task_completed", STRENGTH_TASK_COMPLETED);
        }
    }
    for plan in &transcript.plan_approvals {
        if plan.status == crate::transcript::PlanStatus::Approved {
            add_signal(signals, plan.turn, "plan_approved", STRENGTH_PLAN_APPROVED);
        }
    }
    for spawn in &transcript.subagent_spawns {
        add_signal(signals, spawn.turn, "subagent", STRENGTH_SUBAGENT);
    }
}

/// A turn is a file-context-switch boundary when the union of files touched
/// in `[turn-2, turn]` overlaps by < 30% with the union of files touched in
/// `[turn-5, turn-3]`. Requires >= 4 distinct file-touching turns overall to
/// be meaningful.
fn add_file_context_switch_signals(transcript: &SessionTranscript, signals: &mut BTreeMap<usize, BoundarySignal>) {
    let mut files_by_turn: BTreeMap<usize, HashSet<String>> = BTreeMap::new();
    for tu in &transcript.tool_uses {
        let paths = crate::transcript::file_paths_touched(tu);
        if paths.is_empty() {
            continue;
        }
        files_by_turn
            .entry(tu.turn)
            .or_default()
            .extend(paths);
    }

    if files_by_turn.len() < MIN_FILE_TOUCHING_TURNS {
        return;
    }

    let turns: Vec<usize> = files_by_turn.keys().copied().collect();

    for &turn in &turns {
        if turn < 5 {
            continue;
        }
        let recent = union_files(&files_by_turn, turn.saturating_sub(2), turn);
        let prior = union_files(&files_by_turn, turn.saturating_sub(5), turn.saturating_sub(3));
        if recent.is_empty() || prior.is_empty() {
            continue;
        }
        let overlap = jaccard_like_overlap(&recent, &prior);
        if overlap < FILE_OVERLAP_THRESHOLD {
            add_signal(signals, turn, "file_context_switch", STRENGTH_FILE_CONTEXT_SWITCH);
        }
    }
}

fn union_files(files_by_turn: &BTreeMap<usize, HashSet<String>>, start: usize, end: usize) -> HashSet<String> {
    let mut out = HashSet::new();
    for (turn, files) in files_by_turn.range(start..=end) {
        let _ = turn;
        out.extend(files.iter().cloned());
    }
    out
}

/// Fraction of `recent` that is also present in `prior` (overlap relative to
/// the smaller/recent set — the fraction of current context still shared
/// with the preceding context).
fn jaccard_like_overlap(recent: &HashSet<String>, prior: &HashSet<String>) -> f64 {
    let shared = recent.intersection(prior).count();
    shared as f64 / recent.len() as f64
}
