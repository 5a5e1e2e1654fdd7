// src/store/mod.rs
// The milestone store: per-session JSON files, an LRU in-memory cache, and
// the session index — spec §4.2.

pub mod index;

pub use index::{IndexEntry, IndexUpdate};

use crate::error::Result;
use crate::milestone::{self, Milestone};
use chrono::Utc;
use index::Index;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, warn};

const DEFAULT_MAX_CACHE_SESSIONS: usize = 200;

struct CacheEntry {
    milestones: Vec<Milestone>,
    last_accessed: Instant,
}

/// On-disk milestone store with an LRU session cache in front of it.
/// Single-process only (spec §5 "Shared resources") — all mutation methods
/// take `&self` and serialize through an internal mutex rather than `&mut
/// self`, matching how the rest of the pipeline shares one store instance.
pub struct MilestoneStore {
    data_dir: PathBuf,
    max_cache_sessions: usize,
    cache: Mutex<HashMap<String, CacheEntry>>,
    index: Mutex<Index>,
}

impl MilestoneStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self::with_cache_size(data_dir, DEFAULT_MAX_CACHE_SESSIONS)
    }

    pub fn with_cache_size(data_dir: PathBuf, max_cache_sessions: usize) -> Self {
        let index = Self::load_index(&data_dir);
        Self {
            data_dir,
            max_cache_sessions,
            cache: Mutex::new(HashMap::new()),
            index: Mutex::new(index),
        }
    }

    fn index_path(&self) -> PathBuf {
        self.data_dir.join("index.json")
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.data_dir.join("milestones").join(format!("{session_id}.json"))
    }

    fn load_index(data_dir: &std::path::Path) -> Index {
        let path = data_dir.join("index.json");
        match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!(error = %err, "malformed milestone index, starting fresh");
                Index::new()
            }),
            Err(_) => Index::new(),
        }
    }

    /// Milestones for a session, LRU-cached. Empty list if the file doesn't
    /// exist; a malformed file is treated the same way (spec §7
    /// "Store-read-corrupt").
    pub fn get_milestones(&self, session_id: &str) -> Vec<Milestone> {
        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = cache.get_mut(session_id) {
                entry.last_accessed = Instant::now();
                return entry.milestones.clone();
            }
        }

        let milestones = self.read_session_file(session_id);
        self.insert_cache(session_id, milestones.clone());
        milestones
    }

    fn read_session_file(&self, session_id: &str) -> Vec<Milestone> {
        let path = self.session_path(session_id);
        match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!(error = %err, session_id, "malformed session milestone file, treating as empty");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        }
    }

    fn insert_cache(&self, session_id: &str, milestones: Vec<Milestone>) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            session_id.to_string(),
            CacheEntry {
                milestones,
                last_accessed: Instant::now(),
            },
        );
        self.evict_if_needed(&mut cache);
    }

    fn evict_if_needed(&self, cache: &mut HashMap<String, CacheEntry>) {
        while cache.len() > self.max_cache_sessions {
            let oldest = cache
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(session_id, _)| session_id.clone());
            match oldest {
                Some(session_id) => {
                    cache.remove(&session_id);
                }
                None => break,
            }
        }
    }

    /// A single milestone by composite id, or `None` if the session or the
    /// index within it doesn't exist.
    pub fn get_milestone_by_id(&self, id: &str) -> Option<Milestone> {
        let (session_id, idx) = milestone::split_id(id)?;
        self.get_milestones(session_id).into_iter().find(|m| m.index == idx)
    }

    /// Persist a session's milestone list. An empty list deletes the
    /// per-session file and its cache entry, but the index entry survives
    /// with `count=0` — deleting it entirely would make `needsReExtraction`
    /// true forever and re-extract a session whose milestones are all thin
    /// on every tick.
    pub fn save_milestones(&self, session_id: &str, milestones: &[Milestone]) -> Result<()> {
        if let Err(msg) = milestone::validate_dense_ordering(milestones) {
            return Err(crate::error::PipelineError::InvalidInput(msg));
        }

        let path = self.session_path(session_id);
        if milestones.is_empty() {
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.remove(session_id);
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(milestones)?;
            std::fs::write(&path, json)?;
            self.insert_cache(session_id, milestones.to_vec());
        }
        debug!(session_id, count = milestones.len(), "milestones saved");
        Ok(())
    }

    /// Merge an index update for `session_id`, refreshing `lastUpdated`.
    pub fn update_index(&self, session_id: &str, update: IndexUpdate) -> Result<()> {
        let mut index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        index::merge(&mut index, session_id, update, Utc::now());
        self.write_index(&index)
    }

    fn write_index(&self, index: &Index) -> Result<()> {
        if let Some(parent) = self.index_path().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(index)?;
        std::fs::write(self.index_path(), json)?;
        Ok(())
    }

    pub fn index_entry(&self, session_id: &str) -> Option<IndexEntry> {
        let index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        index.get(session_id).cloned()
    }

    /// True iff the session has no index entry yet, or its turn count has
    /// moved since the last extraction.
    pub fn needs_re_extraction(&self, session_id: &str, current_turn_count: usize) -> bool {
        match self.index_entry(session_id) {
            None => true,
            Some(entry) => entry.last_turn_count != current_turn_count,
        }
    }

    pub fn cached_session_count(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Session ids with at least one Phase 1 milestone still awaiting
    /// enrichment, per the index's `phase1Count`. Used by the `run-once`
    /// CLI subcommand to rebuild a queue from disk state, since the
    /// summarizer's in-memory queue does not itself persist across runs.
    pub fn sessions_needing_enrichment(&self) -> Vec<String> {
        let index = self.index.lock().unwrap_or_else(|e| e.into_inner());
        index
            .iter()
            .filter(|(_, entry)| entry.phase1_count > 0)
            .map(|(session_id, _)| session_id.clone())
            .collect()
    }
}
