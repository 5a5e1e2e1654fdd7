// src/summarizer/mod.rs
// The Phase 2 enrichment pipeline: queue, debounced auto-start, bounded
// concurrent batch dispatch, response application, merge directives, and
// the architecture-update drain on quiescence — spec §4.6.

pub mod batch;
pub mod merge;
pub mod parse;
pub mod prompt;
pub mod rate_limit;
pub mod status;

pub use batch::QueueItem;

use crate::config::SettingsStore;
use crate::debounce::Debouncer;
use crate::llm::{AgentEndpoint, AgentRequest};
use crate::milestone::{self, Milestone, Phase2Content};
use crate::shutdown::Shutdown;
use crate::store::{IndexUpdate, MilestoneStore};
use crate::vector::{VectorIndexer, VectorItem};
use chrono::Utc;
use parse::ParsedSummary;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, warn};

pub const DEFAULT_CONCURRENCY: usize = 10;
pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 20;
const DEBOUNCE_DURATION: Duration = Duration::from_secs(5);

fn clamp_concurrency(requested: usize) -> usize {
    requested.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    errors: AtomicU64,
    vectors_indexed: AtomicU64,
    vector_errors: AtomicU64,
    merges_applied: AtomicU64,
    milestones_absorbed: AtomicU64,
    batches_completed: AtomicU64,
}

/// One LLM-call outcome, either a batch response or a per-milestone
/// fallback call, carrying enough context (the queue items it covered) to
/// apply results and attribute project paths.
struct DispatchedBatch {
    items: Vec<QueueItem>,
    milestones: Vec<Milestone>,
}

/// Process-wide singleton coordinating Phase 2 enrichment. Construct once,
/// wrap in `Arc`, and drive enqueueing/processing through that handle —
/// `trigger`/`process` both need to outlive the call that started them.
pub struct Summarizer {
    store: Arc<MilestoneStore>,
    endpoint: Arc<dyn AgentEndpoint>,
    vector: Arc<dyn VectorIndexer>,
    settings: Arc<SettingsStore>,
    queue: Mutex<VecDeque<QueueItem>>,
    processing: AtomicBool,
    stopped: AtomicBool,
    rate_limiter: rate_limit::RateLimiter,
    concurrency: usize,
    debounce: Debouncer,
    shutdown: Shutdown,
    counters: Counters,
    architecture_projects: Mutex<HashSet<String>>,
    status_writer: status::StatusWriter,
    started_at: Mutex<Option<chrono::DateTime<Utc>>>,
    last_processed_at: Mutex<Option<chrono::DateTime<Utc>>>,
    current_model: Mutex<Option<String>>,
}

impl Summarizer {
    pub fn new(
        store: Arc<MilestoneStore>,
        endpoint: Arc<dyn AgentEndpoint>,
        vector: Arc<dyn VectorIndexer>,
        settings: Arc<SettingsStore>,
        data_dir: std::path::PathBuf,
    ) -> Arc<Self> {
        Self::with_concurrency(store, endpoint, vector, settings, data_dir, DEFAULT_CONCURRENCY)
    }

    pub fn with_concurrency(
        store: Arc<MilestoneStore>,
        endpoint: Arc<dyn AgentEndpoint>,
        vector: Arc<dyn VectorIndexer>,
        settings: Arc<SettingsStore>,
        data_dir: std::path::PathBuf,
        concurrency: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            endpoint,
            vector,
            settings,
            queue: Mutex::new(VecDeque::new()),
            processing: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            rate_limiter: rate_limit::RateLimiter::default(),
            concurrency: clamp_concurrency(concurrency),
            debounce: Debouncer::new(DEBOUNCE_DURATION),
            shutdown: Shutdown::new(),
            counters: Counters::default(),
            architecture_projects: Mutex::new(HashSet::new()),
            status_writer: status::StatusWriter::new(data_dir),
            started_at: Mutex::new(None),
            last_processed_at: Mutex::new(None),
            current_model: Mutex::new(None),
        })
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// §4.6.1: separates substantive from thin; queues substantive ones,
    /// deletes orphaned thin ones (any still standalone after extraction's
    /// own folding have no viable neighbour to absorb into). No side effect
    /// on processing.
    pub fn add_to_queue(&self, session_id: &str, new_indices: &[usize], project_path: Option<String>) -> usize {
        let mut milestones = self.store.get_milestones(session_id);
        let mut queued = 0usize;
        let mut orphaned_thin = Vec::new();

        for &idx in new_indices {
            let Some(m) = milestones.iter().find(|m| m.index == idx) else {
                continue;
            };
            if m.is_substantive() {
                self.queue.lock().unwrap_or_else(|e| e.into_inner()).push_back(QueueItem {
                    session_id: session_id.to_string(),
                    milestone_index: idx,
                    project_path: project_path.clone(),
                });
                queued += 1;
            } else {
                orphaned_thin.push(idx);
            }
        }

        if !orphaned_thin.is_empty() {
            milestones.retain(|m| !orphaned_thin.contains(&m.index));
            milestone::resequence(&mut milestones);
            if let Err(err) = self.store.save_milestones(session_id, &milestones) {
                warn!(session_id, error = %err, "failed to drop orphaned thin milestones");
            }
        }

        queued
    }

    /// §4.6.1: `addToQueue` plus arming the debounce timer. Bursts of calls
    /// within the debounce window collapse to one processing start.
    pub fn enqueue_milestones(self: &Arc<Self>, session_id: &str, new_indices: &[usize], project_path: Option<String>) {
        self.add_to_queue(session_id, new_indices, project_path);
        let me = Arc::clone(self);
        self.debounce.trigger(move || async move {
            me.start_if_idle();
        });
    }

    /// Starts the processing loop immediately if the queue is non-empty and
    /// nothing is already running, bypassing the debounce window. Used by
    /// the `run-once` CLI subcommand, which wants an immediate drain rather
    /// than waiting out the idle-delay meant for coalescing live bursts.
    pub fn start_processing(self: &Arc<Self>) {
        self.start_if_idle();
    }

    fn start_if_idle(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if self.queue_len() == 0 {
            return;
        }
        if self.processing.swap(true, Ordering::SeqCst) {
            return; // already running
        }
        let me = Arc::clone(self);
        tokio::spawn(async move {
            me.run().await;
        });
    }

    /// §4.6.3: the concurrent batch execution loop.
    async fn run(self: Arc<Self>) {
        {
            let mut started_at = self.started_at.lock().unwrap_or_else(|e| e.into_inner());
            if started_at.is_none() {
                *started_at = Some(Utc::now());
            }
        }

        while !self.stopped.load(Ordering::SeqCst) {
            let batches = self.drain_batches();
            if batches.is_empty() {
                break;
            }

            self.rate_limiter.acquire().await;

            let dispatches = batches.into_iter().map(|batch| {
                let me = Arc::clone(&self);
                async move { me.run_batch(batch).await }
            });
            futures::future::join_all(dispatches).await;

            self.counters.batches_completed.fetch_add(1, Ordering::SeqCst);
            *self.last_processed_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
            self.write_status(None);
        }

        self.processing.store(false, Ordering::SeqCst);

        if self.stopped.load(Ordering::SeqCst) {
            self.queue.lock().unwrap_or_else(|e| e.into_inner()).clear();
            self.write_status(None);
            return;
        }

        // §4.6.8: quiescence reached with nothing pending and no re-arm race.
        if self.queue_len() == 0 {
            self.drain_architecture_updates();
        }
        self.write_status(None);

        // Late arrivals during finalisation still need their debounce
        // rearmed, rather than either orphaning them or starting a new run
        // immediately and racing the caller that's still enqueueing.
        if self.queue_len() > 0 {
            let me = Arc::clone(&self);
            self.debounce.trigger(move || async move {
                me.start_if_idle();
            });
        }
    }

    fn drain_batches(&self) -> Vec<batch::Batch> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let mut batches = Vec::new();
        for _ in 0..self.concurrency {
            if queue.is_empty() {
                break;
            }
            let b = batch::form_next_batch(&mut queue, &self.store);
            if b.is_empty() {
                break;
            }
            batches.push(b);
        }
        batches
    }

    /// Drains the architecture-update project set accumulated during this
    /// run. The caller (dispatcher / embedding process) decides what a
    /// "fire the pipeline-complete hook" means outside this crate; here we
    /// simply hand back and clear the set.
    pub fn drain_architecture_updates(&self) -> Vec<String> {
        let mut set = self.architecture_projects.lock().unwrap_or_else(|e| e.into_inner());
        set.drain().collect()
    }

    async fn run_batch(self: Arc<Self>, raw_batch: batch::Batch) {
        let items: Vec<QueueItem> = raw_batch.iter().map(|(item, _)| item.clone()).collect();
        let milestones: Vec<Milestone> = raw_batch.into_iter().map(|(_, m)| m).collect();
        if milestones.is_empty() {
            return;
        }

        let model = self.select_model();
        *self.current_model.lock().unwrap_or_else(|e| e.into_inner()) = Some(model.clone());

        let dispatched = DispatchedBatch { items, milestones };

        if dispatched.milestones.len() == 1 {
            let prompt_text = prompt::render_single_prompt(&dispatched.milestones[0]);
            match self.call_llm(&prompt_text, &model).await {
                Ok(raw) => match parse::parse_single_response(&raw) {
                    Ok(summary) => self.apply_summaries(vec![summary], &dispatched, &model).await,
                    Err(err) => {
                        warn!(error = %err, "single-milestone response failed to parse");
                        self.counters.errors.fetch_add(1, Ordering::SeqCst);
                    }
                },
                Err(err) => {
                    warn!(error = %err, "single-milestone LLM call failed");
                    self.counters.errors.fetch_add(1, Ordering::SeqCst);
                }
            }
            return;
        }

        let prompt_text = prompt::render_batch_prompt(&dispatched.milestones);
        match self.call_llm(&prompt_text, &model).await {
            Ok(raw) => match parse::parse_batch_response(&raw) {
                Ok(summaries) => self.apply_summaries(summaries, &dispatched, &model).await,
                Err(err) => {
                    warn!(error = %err, "batch response failed to parse, falling back to per-milestone calls");
                    self.fallback_per_milestone(&dispatched, &model).await;
                }
            },
            Err(err) => {
                warn!(error = %err, "batch LLM call failed, falling back to per-milestone calls");
                self.fallback_per_milestone(&dispatched, &model).await;
            }
        }
    }

    /// §4.6.5: batch parse failure falls back to individual single-object
    /// calls, never re-queued (a malformed session would otherwise loop
    /// forever).
    async fn fallback_per_milestone(&self, dispatched: &DispatchedBatch, model: &str) {
        for m in &dispatched.milestones {
            let prompt_text = prompt::render_single_prompt(m);
            match self.call_llm(&prompt_text, model).await {
                Ok(raw) => match parse::parse_single_response(&raw) {
                    Ok(summary) => self.apply_summaries(vec![summary], dispatched, model).await,
                    Err(err) => {
                        warn!(error = %err, id = %m.id(), "fallback single call failed to parse");
                        self.counters.errors.fetch_add(1, Ordering::SeqCst);
                    }
                },
                Err(err) => {
                    warn!(error = %err, id = %m.id(), "fallback single call failed");
                    self.counters.errors.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    async fn call_llm(&self, prompt_text: &str, model: &str) -> crate::error::Result<String> {
        let request = AgentRequest::new(prompt_text, prompt::SYSTEM_PROMPT, model);
        self.endpoint.invoke(request).await
    }

    fn select_model(&self) -> String {
        let settings = self.settings.current();
        prompt::select_model(None, settings.phase2_model)
    }

    /// §4.6.6 / §4.6.7: split parsed summaries into merge directives (>= 2
    /// sources) and ordinary per-milestone applications, applying at most
    /// one merge per session per batch pass.
    async fn apply_summaries(&self, summaries: Vec<ParsedSummary>, dispatched: &DispatchedBatch, model: &str) {
        let project_paths: HashMap<String, Option<String>> = dispatched
            .items
            .iter()
            .map(|item| (milestone::make_id(&item.session_id, item.milestone_index), item.project_path.clone()))
            .collect();

        let mut merged_sessions: HashSet<String> = HashSet::new();
        let now = Utc::now();

        for summary in summaries {
            if summary.merged_from.len() >= 2 {
                let Some((session_id, _)) = milestone::split_id(&summary.id) else {
                    warn!(id = %summary.id, "merge directive has malformed id");
                    self.counters.errors.fetch_add(1, Ordering::SeqCst);
                    continue;
                };
                if !merged_sessions.insert(session_id.to_string()) {
                    warn!(session_id, "ignoring additional merge directive for session already merged this pass");
                    self.counters.errors.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
                self.apply_merge(session_id, &summary, model, now, &project_paths).await;
            } else {
                self.apply_single(&summary, model, now, &project_paths).await;
            }
        }
    }

    async fn apply_merge(
        &self,
        session_id: &str,
        summary: &ParsedSummary,
        model: &str,
        now: chrono::DateTime<Utc>,
        project_paths: &HashMap<String, Option<String>>,
    ) {
        let mut milestones = self.store.get_milestones(session_id);
        match merge::apply_merge(&mut milestones, summary, model, now) {
            Ok(outcome) => {
                if let Err(err) = self.store.save_milestones(session_id, &milestones) {
                    error!(session_id, error = %err, "failed to persist merge result");
                    self.counters.errors.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                let phase2_count = milestones.iter().filter(|m| m.phase2.is_some()).count();
                let _ = self.store.update_index(
                    session_id,
                    IndexUpdate {
                        count: Some(milestones.len()),
                        phase2_count: Some(phase2_count),
                        phase1_count: Some(milestones.len() - phase2_count),
                        ..Default::default()
                    },
                );

                for &absorbed_index in &outcome.absorbed_original_indices {
                    if let Err(err) = self.vector.delete_milestone(session_id, absorbed_index).await {
                        warn!(session_id, absorbed_index, error = %err, "vector delete failed for absorbed milestone");
                        self.counters.vector_errors.fetch_add(1, Ordering::SeqCst);
                    }
                }

                self.counters.merges_applied.fetch_add(1, Ordering::SeqCst);
                self.counters
                    .milestones_absorbed
                    .fetch_add(outcome.absorbed_original_indices.len() as u64, Ordering::SeqCst);
                self.counters.processed.fetch_add(1, Ordering::SeqCst);

                let survivor_id = summary.merged_from[0].clone();
                let project_path = project_paths.get(&survivor_id).cloned().flatten();
                if summary.architecture_relevant {
                    if let Some(path) = &project_path {
                        self.architecture_projects.lock().unwrap_or_else(|e| e.into_inner()).insert(path.clone());
                    }
                }

                if let Some(survivor) = milestones.iter().find(|m| m.merged_from == summary.merged_from) {
                    if let Err(err) = self.vector.on_phase2_complete(survivor, project_path.as_deref()).await {
                        warn!(session_id, error = %err, "vector on_phase2_complete failed for merge survivor");
                        self.counters.vector_errors.fetch_add(1, Ordering::SeqCst);
                    } else {
                        self.counters.vectors_indexed.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
            Err(err) => {
                warn!(session_id, error = %err, "merge directive rejected");
                self.counters.errors.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    async fn apply_single(
        &self,
        summary: &ParsedSummary,
        model: &str,
        now: chrono::DateTime<Utc>,
        project_paths: &HashMap<String, Option<String>>,
    ) {
        let Some((session_id, _)) = milestone::split_id(&summary.id) else {
            warn!(id = %summary.id, "summary has malformed id");
            self.counters.errors.fetch_add(1, Ordering::SeqCst);
            return;
        };

        let mut milestones = self.store.get_milestones(session_id);
        let Some(slot) = milestones.iter_mut().find(|m| m.id() == summary.id) else {
            // Stale: the milestone no longer exists (re-extracted away).
            return;
        };

        slot.phase2 = Some(Phase2Content {
            title: summary.title.clone(),
            description: summary.description.clone(),
            milestone_type: summary.milestone_type,
            outcome: summary.outcome.clone(),
            facts: summary.facts.clone(),
            concepts: summary.concepts.clone(),
            architecture_relevant: summary.architecture_relevant,
            generated_at: now,
            model_used: model.to_string(),
            merged_from: summary.merged_from.clone(),
        });
        if !summary.merged_from.is_empty() {
            slot.merged_from = summary.merged_from.clone();
        }
        let applied = slot.clone();

        if let Err(err) = self.store.save_milestones(session_id, &milestones) {
            error!(session_id, error = %err, "failed to persist phase 2 application");
            self.counters.errors.fetch_add(1, Ordering::SeqCst);
            return;
        }

        let phase2_count = milestones.iter().filter(|m| m.phase2.is_some()).count();
        let _ = self.store.update_index(
            session_id,
            IndexUpdate {
                phase: Some(2),
                phase2_count: Some(phase2_count),
                phase1_count: Some(milestones.len() - phase2_count),
                ..Default::default()
            },
        );
        self.counters.processed.fetch_add(1, Ordering::SeqCst);

        let project_path = project_paths.get(&summary.id).cloned().flatten();
        if summary.architecture_relevant {
            if let Some(path) = &project_path {
                self.architecture_projects.lock().unwrap_or_else(|e| e.into_inner()).insert(path.clone());
            }
        }

        match self.vector.on_phase2_complete(&applied, project_path.as_deref()).await {
            Ok(()) => {
                self.counters.vectors_indexed.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => {
                warn!(session_id, id = %summary.id, error = %err, "vector on_phase2_complete failed");
                self.counters.vector_errors.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Notify the vector store of freshly-discovered Phase 1 milestones
    /// (fire-and-forget per spec §5 — errors are logged, not propagated).
    pub async fn index_new_phase1(&self, milestones: &[Milestone], project_path: Option<&str>) {
        let items: Vec<VectorItem> = milestones
            .iter()
            .map(|m| VectorItem::from_phase1(m, project_path.map(str::to_string)))
            .collect();
        if items.is_empty() {
            return;
        }
        if let Err(err) = self.vector.add_vectors(items).await {
            warn!(error = %err, "add_vectors failed for new phase 1 milestones");
            self.counters.vector_errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Cooperative shutdown: in-flight batches finish and apply, then the
    /// queue is cleared. Does not block — poll `queue_len()` for drain
    /// completion, or await `shutdown().recv()` / `shutdown().is_requested()`
    /// from an embedding process that wants to react to the same signal.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.debounce.cancel();
        self.shutdown.request();
    }

    /// A clone of this summarizer's shutdown signal, for an embedding
    /// process to subscribe to or to drive the same stop from elsewhere.
    pub fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }

    fn write_status(&self, current_batch: Option<usize>) {
        // `stopped` latches permanently once `stop()` is called, so it only
        // distinguishes Stopping from Processing while a run is still
        // draining in-flight work; once `processing` goes false the run
        // loop has exited and the pipeline is simply idle again (spec §8 S5
        // expects `status=idle` after a stop finishes, not a stuck
        // "stopping").
        let status_state = if !self.processing.load(Ordering::SeqCst) {
            status::PipelineState::Idle
        } else if self.stopped.load(Ordering::SeqCst) {
            status::PipelineState::Stopping
        } else {
            status::PipelineState::Processing
        };

        let started_at = *self.started_at.lock().unwrap_or_else(|e| e.into_inner());
        let batches_completed = self.counters.batches_completed.load(Ordering::SeqCst);
        let processed = self.counters.processed.load(Ordering::SeqCst);
        let throughput = started_at.map(|start| {
            let minutes = (Utc::now() - start).num_seconds().max(1) as f64 / 60.0;
            status::Throughput {
                milestones_per_minute: processed as f64 / minutes,
                batches_completed,
            }
        });

        let snapshot = status::PipelineStatus {
            status: status_state,
            queue_size: self.queue_len(),
            processed,
            errors: self.counters.errors.load(Ordering::SeqCst),
            last_processed_at: *self.last_processed_at.lock().unwrap_or_else(|e| e.into_inner()),
            started_at,
            current_batch,
            throughput,
            vectors_indexed: self.counters.vectors_indexed.load(Ordering::SeqCst),
            vector_errors: self.counters.vector_errors.load(Ordering::SeqCst),
            merges_applied: self.counters.merges_applied.load(Ordering::SeqCst),
            milestones_absorbed: self.counters.milestones_absorbed.load(Ordering::SeqCst),
            current_model: self.current_model.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        };

        if let Err(err) = self.status_writer.write(&snapshot) {
            warn!(error = %err, "failed to write pipeline status snapshot");
        }
    }
}

impl std::fmt::Debug for Summarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Summarizer")
            .field("queue_len", &self.queue_len())
            .field("processing", &self.processing.load(Ordering::SeqCst))
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish()
    }
}
