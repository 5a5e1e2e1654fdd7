// src/summarizer/batch.rs
// Batch formation — spec §4.6.2.

use crate::milestone::Milestone;
use crate::store::MilestoneStore;
use std::collections::VecDeque;

/// One queued unit of work: a specific milestone in a specific session,
/// optionally tagged with the project path it belongs to (carried through
/// to the architecture-update set and the vector-store callback).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub session_id: String,
    pub milestone_index: usize,
    pub project_path: Option<String>,
}

pub const TOKEN_BUDGET: usize = 150_000;
pub const SYSTEM_PROMPT_RESERVE: usize = 2_500;
pub const MAX_BATCH_SIZE: usize = 50;

/// `ceil(len(text) / 4)` — the rough token estimate used throughout batch
/// formation and prompt sizing.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Text the prompt will actually carry for a milestone: prompts, touched
/// files, and the tool-use tally. Used only for sizing, not for the prompt
/// itself (see `prompt::render_milestone`).
fn milestone_text_for_sizing(m: &Milestone) -> String {
    let mut s = String::new();
    for p in &m.user_prompts {
        s.push_str(&p.text);
        s.push('\n');
    }
    for f in m.files_modified.iter().chain(m.files_read.iter()) {
        s.push_str(f);
        s.push('\n');
    }
    for (tool, count) in &m.tool_use_summary {
        s.push_str(&format!("{tool}:{count}\n"));
    }
    s
}

pub fn estimate_milestone_tokens(m: &Milestone) -> usize {
    estimate_tokens(&milestone_text_for_sizing(m))
}

/// One batch: the queue items alongside the milestone snapshot each refers
/// to, grouped in queue order.
pub type Batch = Vec<(QueueItem, Milestone)>;

/// Pull one batch off the front of `queue`. Items whose milestone no longer
/// exists, or whose milestone is already Phase 2, are dropped silently
/// (consumed, never placed in a batch). Sessions are kept atomic: either an
/// entire session's currently-queued items land in this batch, or none of
/// them do (in which case they remain queued for the next call).
pub fn form_next_batch(queue: &mut VecDeque<QueueItem>, store: &MilestoneStore) -> Batch {
    let budget = TOKEN_BUDGET.saturating_sub(SYSTEM_PROMPT_RESERVE);
    let mut batch: Batch = Vec::new();
    let mut tokens_used = 0usize;

    while let Some(front) = queue.front() {
        let session_id = front.session_id.clone();

        // Gather the full contiguous run of items for this session and
        // resolve each to its live milestone, dropping stale/phase-2 ones.
        let mut session_items: Vec<(QueueItem, Milestone)> = Vec::new();
        while let Some(item) = queue.front() {
            if item.session_id != session_id {
                break;
            }
            let item = queue.pop_front().expect("front() just returned Some");
            if let Some(m) = store.get_milestone_by_id(&crate::milestone::make_id(&item.session_id, item.milestone_index)) {
                if m.phase2.is_none() {
                    session_items.push((item, m));
                }
            }
        }

        if session_items.is_empty() {
            continue;
        }

        let session_tokens: usize = session_items.iter().map(|(_, m)| estimate_milestone_tokens(m)).sum();
        let session_count = session_items.len();

        let fits = tokens_used + session_tokens <= budget && batch.len() + session_count <= MAX_BATCH_SIZE;

        if batch.is_empty() || fits {
            tokens_used += session_tokens;
            batch.extend(session_items);
            if !fits {
                // Oversized single session admitted alone; nothing more
                // fits in this batch pass.
                break;
            }
        } else {
            // Doesn't fit and the batch already has content: put this
            // session's items back at the front for the next batch.
            let mut requeued: VecDeque<QueueItem> = session_items.into_iter().map(|(item, _)| item).collect();
            requeued.extend(queue.drain(..));
            *queue = requeued;
            break;
        }
    }

    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::milestone::PromptRecord;
    use chrono::Utc;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn milestone(session_id: &str, index: usize, text_len: usize) -> Milestone {
        Milestone {
            session_id: session_id.to_string(),
            index,
            start_turn: index * 2,
            end_turn: index * 2 + 1,
            start_timestamp: Utc::now(),
            end_timestamp: Utc::now(),
            user_prompts: vec![PromptRecord {
                timestamp: Utc::now(),
                text: "x".repeat(text_len),
            }],
            files_modified: vec![],
            files_read: vec![],
            tool_use_summary: HashMap::new(),
            task_completions: vec![],
            subagent_count: 0,
            phase2: None,
            merged_from: vec![],
        }
    }

    fn store_with(milestones: Vec<Milestone>) -> MilestoneStore {
        // save_milestones populates the in-memory cache, so the backing
        // directory need not outlive this call — reads below hit the cache.
        let dir = TempDir::new().unwrap();
        let store = MilestoneStore::new(dir.path().to_path_buf());
        let mut by_session: HashMap<String, Vec<Milestone>> = HashMap::new();
        for m in milestones {
            by_session.entry(m.session_id.clone()).or_default().push(m);
        }
        for (session_id, mut ms) in by_session {
            ms.sort_by_key(|m| m.index);
            store.save_milestones(&session_id, &ms).unwrap();
        }
        store
    }

    fn item(session_id: &str, index: usize) -> QueueItem {
        QueueItem {
            session_id: session_id.to_string(),
            milestone_index: index,
            project_path: None,
        }
    }

    #[test]
    fn whole_session_lands_in_one_batch() {
        let store = store_with(vec![milestone("s1", 0, 100), milestone("s1", 1, 100)]);
        let mut queue: VecDeque<QueueItem> = vec![item("s1", 0), item("s1", 1)].into();
        let batch = form_next_batch(&mut queue, &store);
        assert_eq!(batch.len(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn stale_or_phase2_items_are_dropped_silently() {
        let mut already_enriched = milestone("s1", 0, 10);
        already_enriched.phase2 = Some(crate::milestone::Phase2Content {
            title: "t".to_string(),
            description: "d".to_string(),
            milestone_type: crate::milestone::MilestoneType::Implementation,
            outcome: "o".to_string(),
            facts: vec![],
            concepts: vec![],
            architecture_relevant: false,
            generated_at: Utc::now(),
            model_used: "haiku".to_string(),
            merged_from: vec![],
        });
        let store = store_with(vec![already_enriched, milestone("s1", 1, 10)]);
        let mut queue: VecDeque<QueueItem> = vec![item("s1", 0), item("s1", 1), item("s1", 5)].into();
        let batch = form_next_batch(&mut queue, &store);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].0.milestone_index, 1);
    }

    #[test]
    fn second_session_deferred_when_it_would_exceed_token_budget() {
        let big_text = TOKEN_BUDGET * 4 + 10;
        let store = store_with(vec![milestone("s1", 0, 10), milestone("s2", 0, big_text)]);
        let mut queue: VecDeque<QueueItem> = vec![item("s1", 0), item("s2", 0)].into();
        let batch = form_next_batch(&mut queue, &store);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].0.session_id, "s1");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].session_id, "s2");
    }

    #[test]
    fn oversized_lone_session_is_still_admitted_alone() {
        let big_text = TOKEN_BUDGET * 4 + 10;
        let store = store_with(vec![milestone("s1", 0, big_text)]);
        let mut queue: VecDeque<QueueItem> = vec![item("s1", 0)].into();
        let batch = form_next_batch(&mut queue, &store);
        assert_eq!(batch.len(), 1);
        assert!(queue.is_empty());
    }
}
