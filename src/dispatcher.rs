// src/dispatcher.rs
// The session-change dispatcher — spec §4.7. Wires a single incoming
// transcript update through exclusion checks, re-extraction, persistence,
// vector indexing, summarizer enqueueing, and the debounced
// knowledge-generation trigger.

use crate::config::{self, SettingsStore};
use crate::milestone::{self, Milestone};
use crate::store::{IndexUpdate, MilestoneStore};
use crate::summarizer::Summarizer;
use crate::transcript::SessionTranscript;
use crate::vector::VectorIndexer;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Sessions spawned by a subagent carry this prefix on their id and on
/// their transcript filename; the dispatcher never processes them directly
/// (they're folded into their parent session's subagent count instead, see
/// `milestone::boundary`).
pub const AGENT_SESSION_PREFIX: &str = "agent-session-";

const KNOWLEDGE_DEBOUNCE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Session id/filename carries the agent-session prefix.
    RejectedAgentSession,
    /// cwd or file path matches an excluded path pattern.
    RejectedExcluded,
    /// Milestones are disabled in settings.
    Disabled,
    /// No re-extraction was needed; nothing changed.
    UpToDate,
    /// Re-extraction ran; carries how many milestones are newly introduced.
    ReExtracted { new_milestone_count: usize },
}

/// Narrow callback fired when a cwd's knowledge base should be regenerated.
/// The real generator lives outside this crate; this interface only
/// decouples the debounce/coalescing policy from what eventually runs.
#[async_trait]
pub trait KnowledgeGenTrigger: Send + Sync {
    async fn trigger(&self, cwd: &str);
}

pub struct NullKnowledgeGenTrigger;

#[async_trait]
impl KnowledgeGenTrigger for NullKnowledgeGenTrigger {
    async fn trigger(&self, _cwd: &str) {}
}

pub struct Dispatcher {
    store: Arc<MilestoneStore>,
    summarizer: Arc<Summarizer>,
    settings: Arc<SettingsStore>,
    vector: Arc<dyn VectorIndexer>,
    knowledge_gen: Arc<dyn KnowledgeGenTrigger>,
    knowledge_debouncers: Mutex<HashMap<String, crate::debounce::Debouncer>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<MilestoneStore>,
        summarizer: Arc<Summarizer>,
        settings: Arc<SettingsStore>,
        vector: Arc<dyn VectorIndexer>,
        knowledge_gen: Arc<dyn KnowledgeGenTrigger>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            summarizer,
            settings,
            vector,
            knowledge_gen,
            knowledge_debouncers: Mutex::new(HashMap::new()),
        })
    }

    pub async fn on_session_change(self: &Arc<Self>, transcript: &SessionTranscript, project_path: Option<String>) -> DispatchOutcome {
        if is_agent_session(transcript) {
            return DispatchOutcome::RejectedAgentSession;
        }

        let settings = self.settings.current();
        if config::is_excluded(&transcript.cwd, &settings.excluded_paths)
            || config::is_excluded(&crate::utils::path_to_string(&transcript.file_path), &settings.excluded_paths)
        {
            return DispatchOutcome::RejectedExcluded;
        }

        let mut outcome = DispatchOutcome::UpToDate;

        if settings.enabled {
            if self.store.needs_re_extraction(&transcript.session_id, transcript.num_turns) {
                outcome = self.re_extract(transcript, &settings, project_path.clone()).await;
            }
        } else {
            outcome = DispatchOutcome::Disabled;
        }

        if settings.auto_knowledge && !transcript.cwd.is_empty() {
            self.trigger_knowledge_gen(transcript.cwd.clone());
        }

        outcome
    }

    async fn re_extract(self: &Arc<Self>, transcript: &SessionTranscript, settings: &config::Settings, project_path: Option<String>) -> DispatchOutcome {
        let old = self.store.get_milestones(&transcript.session_id);
        let old_ids: HashSet<String> = old.iter().map(Milestone::id).collect();

        let fresh = milestone::extract_phase1(&transcript.session_id, transcript);
        let resolved = milestone::thin::resolve_thin_milestones(fresh);
        let reconciled = milestone::reextract::reconcile(old, resolved);

        if let Err(err) = self.store.save_milestones(&transcript.session_id, &reconciled) {
            warn!(session_id = %transcript.session_id, error = %err, "failed to persist re-extracted milestones");
            return DispatchOutcome::UpToDate;
        }

        let phase2_count = reconciled.iter().filter(|m| m.phase2.is_some()).count();
        let max_end_timestamp = reconciled.iter().map(|m| m.end_timestamp).max();
        if let Err(err) = self.store.update_index(
            &transcript.session_id,
            IndexUpdate {
                phase: Some(if phase2_count > 0 { 2 } else { 1 }),
                count: Some(reconciled.len()),
                phase1_count: Some(reconciled.len() - phase2_count),
                phase2_count: Some(phase2_count),
                last_turn_count: Some(transcript.num_turns),
                session_timestamp: max_end_timestamp,
            },
        ) {
            warn!(session_id = %transcript.session_id, error = %err, "failed to update session index");
        }

        let new_milestones: Vec<Milestone> = reconciled.iter().filter(|m| !old_ids.contains(&m.id())).cloned().collect();

        if !new_milestones.is_empty() {
            let summarizer = Arc::clone(&self.summarizer);
            let fresh_for_vector = new_milestones.clone();
            let vector_project_path = project_path.clone();
            tokio::spawn(async move {
                summarizer.index_new_phase1(&fresh_for_vector, vector_project_path.as_deref()).await;
            });

            let eligible: Vec<usize> = new_milestones
                .iter()
                .filter(|m| settings.within_scan_range(m.end_timestamp))
                .map(|m| m.index)
                .collect();
            if !eligible.is_empty() {
                self.summarizer.enqueue_milestones(&transcript.session_id, &eligible, project_path);
            }
        }

        debug!(session_id = %transcript.session_id, new = new_milestones.len(), "session re-extracted");
        DispatchOutcome::ReExtracted {
            new_milestone_count: new_milestones.len(),
        }
    }

    fn trigger_knowledge_gen(self: &Arc<Self>, cwd: String) {
        let debouncer = {
            let mut map = self.knowledge_debouncers.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(cwd.clone())
                .or_insert_with(|| crate::debounce::Debouncer::new(KNOWLEDGE_DEBOUNCE))
                .clone()
        };
        let hook = Arc::clone(&self.knowledge_gen);
        debouncer.trigger(move || async move {
            hook.trigger(&cwd).await;
        });
    }
}

fn is_agent_session(transcript: &SessionTranscript) -> bool {
    if transcript.session_id.starts_with(AGENT_SESSION_PREFIX) {
        return true;
    }
    transcript
        .file_path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| name.starts_with(AGENT_SESSION_PREFIX))
}
