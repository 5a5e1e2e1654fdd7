// src/milestone/reextract.rs
// Re-extraction reconciler — spec §4.5.
//
// Whenever a session is re-scanned (new turns appended, or a cooldown
// re-extraction), the boundary detector and segment builder run again from
// scratch, producing a brand new set of phase 1 milestones. Naively
// replacing the stored milestones with that new set would throw away every
// Phase 2 enrichment already paid for. The reconciler instead matches new
// segments against the previous milestone list by turn-span overlap and
// carries Phase 2 content forward onto whichever new segment best
// corresponds to the old one.

use super::Milestone;

const OVERLAP_CLAIM_THRESHOLD: f64 = 0.50;

/// Fraction of `old`'s turn span covered by `new`'s turn span.
fn overlap_fraction(new: &Milestone, old: &Milestone) -> f64 {
    let start = new.start_turn.max(old.start_turn);
    let end = new.end_turn.min(old.end_turn);
    if start > end {
        return 0.0;
    }
    let overlap_len = (end - start + 1) as f64;
    let old_len = (old.end_turn - old.start_turn + 1) as f64;
    overlap_len / old_len
}

/// Reconcile a freshly re-extracted phase 1 list against the previously
/// stored milestones. Each old milestone can be claimed by at most one new
/// milestone; claims go to the new milestone with the single highest
/// overlap fraction, provided it clears the 50% threshold. Old milestones
/// that are never claimed are considered superseded and dropped. New
/// milestones that claim an old one inherit its `phase2` content and record
/// the old id in `merged_from` when the turn span actually changed.
pub fn reconcile(old: Vec<Milestone>, mut new_phase1: Vec<Milestone>) -> Vec<Milestone> {
    let phase2_old: Vec<Milestone> = old.into_iter().filter(|m| m.phase2.is_some()).collect();
    if phase2_old.is_empty() {
        return new_phase1;
    }

    // Score every (new, old) pair that clears the threshold.
    let mut candidates: Vec<(usize, usize, f64)> = Vec::new();
    for (ni, new) in new_phase1.iter().enumerate() {
        for (oi, old) in phase2_old.iter().enumerate() {
            let frac = overlap_fraction(new, old);
            if frac >= OVERLAP_CLAIM_THRESHOLD {
                candidates.push((ni, oi, frac));
            }
        }
    }
    // Highest overlap first so the greedy assignment below favours the best
    // match when a new segment could plausibly claim more than one old one,
    // and so each old milestone goes to its best-fitting new segment first.
    candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

    let mut claimed_old = vec![false; phase2_old.len()];
    let mut claimed_new = vec![false; new_phase1.len()];

    for (ni, oi, _frac) in candidates {
        if claimed_old[oi] || claimed_new[ni] {
            continue;
        }
        claimed_old[oi] = true;
        claimed_new[ni] = true;

        let old_milestone = &phase2_old[oi];
        let new_milestone = &mut new_phase1[ni];
        new_milestone.phase2 = old_milestone.phase2.clone();
        if old_milestone.start_turn != new_milestone.start_turn
            || old_milestone.end_turn != new_milestone.end_turn
        {
            let mut merged_from = old_milestone.merged_from.clone();
            merged_from.push(old_milestone.id());
            new_milestone.merged_from = merged_from;
        } else {
            new_milestone.merged_from = old_milestone.merged_from.clone();
        }
    }

    new_phase1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::milestone::{MilestoneType, Phase2Content};
    use chrono::Utc;
    use std::collections::HashMap;

    fn plain(start: usize, end: usize) -> Milestone {
        Milestone {
            session_id: "s1".to_string(),
            index: 0,
            start_turn: start,
            end_turn: end,
            start_timestamp: Utc::now(),
            end_timestamp: Utc::now(),
            user_prompts: vec![],
            files_modified: vec![],
            files_read: vec![],
            tool_use_summary: HashMap::new(),
            task_completions: vec![],
            subagent_count: 0,
            phase2: None,
            merged_from: vec![],
        }
    }

    fn enriched(start: usize, end: usize, title: &str) -> Milestone {
        let mut m = plain(start, end);
        m.phase2 = Some(Phase2Content {
            title: title.to_string(),
            description: "desc".to_string(),
            milestone_type: MilestoneType::Implementation,
            outcome: "done".to_string(),
            facts: vec![],
            concepts: vec![],
            architecture_relevant: false,
            generated_at: Utc::now(),
            model_used: "test-model".to_string(),
            merged_from: vec![],
        });
        m
    }

    #[test]
    fn exact_span_match_carries_phase2_without_merged_from() {
        let old = vec![enriched(0, 10, "Auth flow")];
        let new = vec![plain(0, 10)];
        let result = reconcile(old, new);
        assert_eq!(result.len(), 1);
        assert!(result[0].phase2.is_some());
        assert!(result[0].merged_from.is_empty());
    }

    #[test]
    fn shifted_span_with_majority_overlap_carries_phase2_and_records_merge() {
        let old = vec![enriched(0, 10, "Auth flow")];
        // New segment extends a couple turns further but still overlaps >=50%.
        let new = vec![plain(0, 13)];
        let result = reconcile(old, new);
        assert!(result[0].phase2.is_some());
        assert_eq!(result[0].merged_from, vec!["s1:0".to_string()]);
    }

    #[test]
    fn low_overlap_does_not_carry_phase2() {
        let old = vec![enriched(0, 10, "Auth flow")];
        let new = vec![plain(8, 40)]; // overlap is 3/33 turns, well under 50%
        let result = reconcile(old, new);
        assert!(result[0].phase2.is_none());
    }

    #[test]
    fn each_old_milestone_claimed_at_most_once() {
        let old = vec![enriched(0, 10, "Auth flow")];
        // Two new segments both overlap the old one; only the better match claims it.
        let new = vec![plain(0, 10), plain(5, 9)];
        let result = reconcile(old, new);
        let claimed_count = result.iter().filter(|m| m.phase2.is_some()).count();
        assert_eq!(claimed_count, 1);
        // The exact-span match (index 0) should be the one that wins.
        assert!(result[0].phase2.is_some());
        assert!(result[1].phase2.is_none());
    }

    #[test]
    fn no_phase2_in_old_set_returns_new_list_unchanged() {
        let old = vec![plain(0, 10)];
        let new = vec![plain(0, 5), plain(6, 10)];
        let result = reconcile(old, new);
        assert_eq!(result.len(), 2);
        assert!(result.iter().all(|m| m.phase2.is_none()));
    }
}
