// src/milestone/segment.rs
// Segment construction, merging, and materialization into Phase 1
// milestones — steps 3-5 of spec §4.3.

use super::{Milestone, PromptRecord, TaskRecord};
use crate::transcript::{SessionTranscript, file_paths_touched, is_read_tool, is_write_tool};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

const MIN_SEGMENT_SPAN: usize = 2;
const MERGE_FILE_OVERLAP_THRESHOLD: f64 = 0.50;
const GAP_MINUTES_NO_MERGE: i64 = 5;

#[derive(Debug, Clone)]
struct RawSegment {
    start_turn: usize,
    end_turn: usize,
    prompts: Vec<PromptRecord>,
    files_modified: HashSet<String>,
    files_read: HashSet<String>,
    tool_use_summary: HashMap<String, u32>,
    task_completions: Vec<TaskRecord>,
    subagent_count: u32,
}

impl RawSegment {
    fn new(start_turn: usize, end_turn: usize) -> Self {
        Self {
            start_turn,
            end_turn,
            prompts: Vec::new(),
            files_modified: HashSet::new(),
            files_read: HashSet::new(),
            tool_use_summary: HashMap::new(),
            task_completions: Vec::new(),
            subagent_count: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.prompts.is_empty() && self.tool_use_summary.is_empty()
    }

    fn span(&self) -> usize {
        self.end_turn - self.start_turn + 1
    }

    fn all_files(&self) -> HashSet<String> {
        self.files_modified.union(&self.files_read).cloned().collect()
    }
}

/// Step 3: build segments over `[0, num_turns-1]` from sorted boundary turns.
fn build_segments(boundaries: &[usize], num_turns: usize) -> Vec<(usize, usize)> {
    if num_turns == 0 {
        return Vec::new();
    }
    if boundaries.is_empty() {
        return vec![(0, num_turns - 1)];
    }

    let mut spans = Vec::new();
    if boundaries[0] > 0 {
        spans.push((0, boundaries[0] - 1));
    }
    for pair in boundaries.windows(2) {
        spans.push((pair[0], pair[1] - 1));
    }
    if let Some(&last) = boundaries.last() {
        spans.push((last, num_turns - 1));
    }
    spans
}

/// Step 3/collection: gather transcript content into raw segments.
fn collect_segments(transcript: &SessionTranscript, spans: Vec<(usize, usize)>) -> Vec<RawSegment> {
    spans
        .into_iter()
        .map(|(start, end)| {
            let mut seg = RawSegment::new(start, end);

            for p in transcript.real_prompts() {
                if p.turn >= start && p.turn <= end {
                    seg.prompts.push(PromptRecord {
                        timestamp: p.timestamp,
                        text: p.text.clone(),
                    });
                }
            }

            for tu in transcript.tool_uses_in(start, end) {
                *seg.tool_use_summary.entry(tu.name.clone()).or_insert(0) += 1;
                if is_write_tool(&tu.name) {
                    seg.files_modified.extend(file_paths_touched(tu));
                } else if is_read_tool(&tu.name) {
                    seg.files_read.extend(file_paths_touched(tu));
                }
            }

            for t in &transcript.task_completions {
                if t.turn >= start
                    && t.turn <= end
                    && t.status == crate::transcript::TaskStatus::Completed
                {
                    seg.task_completions.push(TaskRecord {
                        subject: t.subject.clone(),
                    });
                }
            }

            seg.subagent_count = transcript
                .subagent_spawns
                .iter()
                .filter(|s| s.turn >= start && s.turn <= end)
                .count() as u32;

            seg
        })
        .collect()
}

/// Step 4: fold segments into their predecessor per the merge rules.
fn merge_segments(segments: Vec<RawSegment>) -> Vec<RawSegment> {
    let mut merged: Vec<RawSegment> = Vec::new();

    for seg in segments {
        if seg.is_empty() {
            // Dropped entirely — nothing to fold into, and nothing worth keeping.
            continue;
        }

        let should_merge = match merged.last() {
            None => false,
            Some(prev) => {
                if seg.span() < MIN_SEGMENT_SPAN {
                    !blocked_by_gap(prev, &seg)
                } else {
                    let overlap = file_overlap(prev, &seg);
                    overlap > MERGE_FILE_OVERLAP_THRESHOLD && !blocked_by_gap(prev, &seg)
                }
            }
        };

        if should_merge {
            let prev = merged.last_mut().expect("checked Some above");
            fold_into(prev, seg);
        } else {
            merged.push(seg);
        }
    }

    merged
}

fn blocked_by_gap(prev: &RawSegment, cur: &RawSegment) -> bool {
    let (Some(prev_last), Some(cur_first)) = (prev.prompts.last(), cur.prompts.first()) else {
        return false;
    };
    let gap = cur_first.timestamp.signed_duration_since(prev_last.timestamp);
    gap.num_minutes() >= GAP_MINUTES_NO_MERGE
}

fn file_overlap(prev: &RawSegment, cur: &RawSegment) -> f64 {
    let prev_files = prev.all_files();
    let cur_files = cur.all_files();
    if cur_files.is_empty() {
        return 0.0;
    }
    let shared = cur_files.intersection(&prev_files).count();
    shared as f64 / cur_files.len() as f64
}

fn fold_into(prev: &mut RawSegment, cur: RawSegment) {
    prev.end_turn = cur.end_turn;
    prev.prompts.extend(cur.prompts);
    prev.files_modified.extend(cur.files_modified);
    prev.files_read.extend(cur.files_read);
    for (tool, count) in cur.tool_use_summary {
        *prev.tool_use_summary.entry(tool).or_insert(0) += count;
    }
    prev.task_completions.extend(cur.task_completions);
    prev.subagent_count += cur.subagent_count;
}

/// Step 5: resolve a milestone's start/end timestamps in priority order.
fn resolve_timestamps(
    transcript: &SessionTranscript,
    seg: &RawSegment,
) -> (DateTime<Utc>, DateTime<Utc>) {
    if let (Some(first), Some(last)) = (seg.prompts.first(), seg.prompts.last()) {
        return (first.timestamp, last.timestamp);
    }

    let mut before: Option<DateTime<Utc>> = None;
    let mut after: Option<DateTime<Utc>> = None;
    for p in transcript.real_prompts() {
        if p.turn < seg.start_turn {
            before = Some(p.timestamp);
        }
        if p.turn > seg.end_turn && after.is_none() {
            after = Some(p.timestamp);
        }
    }
    let start = before.or(after).or(transcript.first_timestamp);
    let end = after.or(before).or(transcript.last_timestamp);
    match (start, end) {
        (Some(s), Some(e)) => (s, e),
        _ => {
            let now = Utc::now();
            (now, now)
        }
    }
}

/// Run the full Phase 1 pipeline: detect boundaries, build spans, collect
/// segment content, merge, and materialize into milestones with dense
/// `0..n` indices. All Phase 2 fields are `None`.
pub fn extract_phase1(session_id: &str, transcript: &SessionTranscript) -> Vec<Milestone> {
    let boundaries = super::boundary::detect_boundaries(transcript);
    let spans = build_segments(&boundaries, transcript.num_turns);
    let raw_segments = collect_segments(transcript, spans);
    let merged = merge_segments(raw_segments);

    merged
        .into_iter()
        .enumerate()
        .map(|(index, seg)| {
            let (start_timestamp, end_timestamp) = resolve_timestamps(transcript, &seg);
            Milestone {
                session_id: session_id.to_string(),
                index,
                start_turn: seg.start_turn,
                end_turn: seg.end_turn,
                start_timestamp,
                end_timestamp,
                user_prompts: seg.prompts,
                files_modified: seg.files_modified.into_iter().collect(),
                files_read: seg.files_read.into_iter().collect(),
                tool_use_summary: seg.tool_use_summary,
                task_completions: seg.task_completions,
                subagent_count: seg.subagent_count,
                phase2: None,
                merged_from: Vec::new(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::SessionTranscriptBuilder;
    use chrono::TimeZone;
    use serde_json::Map;

    fn ts(mins: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + mins * 60, 0).unwrap()
    }

    fn path(p: &str) -> Map<String, serde_json::Value> {
        let mut m = Map::new();
        m.insert("file_path".to_string(), serde_json::Value::String(p.to_string()));
        m
    }

    #[test]
    fn no_boundaries_yields_single_segment_covering_whole_session() {
        let t = SessionTranscriptBuilder::new("s1", 10)
            .tool_use(2, "Bash", Map::new())
            .build();
        let spans = build_segments(&[], t.num_turns);
        assert_eq!(spans, vec![(0, 9)]);
    }

    #[test]
    fn s1_scenario_produces_two_milestones() {
        let t = SessionTranscriptBuilder::new("s1", 40)
            .user_prompt(0, ts(0), "implement the login flow with JWT sessions", true)
            .tool_use(1, "Write", path("auth.rs"))
            .user_prompt(10, ts(5), "ok", true)
            .user_prompt(25, ts(400), "now add refresh token rotation please", true)
            .tool_use(26, "Write", path("tokens.rs"))
            .build();

        let milestones = extract_phase1("s1", &t);
        assert_eq!(milestones.len(), 2);
        assert_eq!(milestones[0].start_turn, 0);
        assert_eq!(milestones[0].end_turn, 24);
        assert_eq!(milestones[1].start_turn, 25);
        assert_eq!(milestones[1].end_turn, 39);
        assert_eq!(milestones[0].index, 0);
        assert_eq!(milestones[1].index, 1);
    }

    #[test]
    fn empty_segment_is_dropped() {
        // A boundary with nothing in it (no prompts, no tools) between two
        // substantive segments should vanish rather than survive as a gap.
        let t = SessionTranscriptBuilder::new("s1", 20)
            .user_prompt(0, ts(0), "build the rate limiter middleware", true)
            .tool_use(1, "Write", path("limiter.rs"))
            .task_completed(9, "ship rate limiter")
            .user_prompt(15, ts(100), "now document the rate limiter config", true)
            .tool_use(16, "Write", path("README.md"))
            .build();

        let milestones = extract_phase1("s1", &t);
        // No milestone should have zero tool uses and zero prompts.
        for m in &milestones {
            assert!(!m.user_prompts.is_empty() || m.total_tool_uses() > 0);
        }
    }

    #[test]
    fn high_file_overlap_merges_into_previous_segment() {
        let t = SessionTranscriptBuilder::new("s1", 30)
            .user_prompt(0, ts(0), "refactor the billing module for clarity", true)
            .tool_use(1, "Edit", path("billing.rs"))
            .tool_use(2, "Edit", path("billing.rs"))
            .user_prompt(6, ts(1), "also tidy up billing error messages", true)
            .tool_use(7, "Edit", path("billing.rs"))
            .build();

        let milestones = extract_phase1("s1", &t);
        // The second prompt touches the same file as the first — overlap
        // should fold it into the same milestone rather than split.
        assert_eq!(milestones.len(), 1);
    }

    #[test]
    fn gap_of_five_minutes_blocks_merge_even_with_overlap() {
        let t = SessionTranscriptBuilder::new("s1", 30)
            .user_prompt(0, ts(0), "refactor the billing module for clarity", true)
            .tool_use(1, "Edit", path("billing.rs"))
            .tool_use(2, "Edit", path("billing.rs"))
            .user_prompt(20, ts(20), "billing module needs more tidying up too", true)
            .tool_use(21, "Edit", path("billing.rs"))
            .build();

        let milestones = extract_phase1("s1", &t);
        assert_eq!(milestones.len(), 2);
    }
}
