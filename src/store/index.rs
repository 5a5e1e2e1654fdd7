// src/store/index.rs
// The session -> metadata map persisted at `<data>/milestones/index.json` —
// spec §3, §4.2.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    /// Highest phase reached by any milestone in the session (1 or 2).
    pub phase: u8,
    pub count: usize,
    #[serde(default)]
    pub phase1_count: usize,
    #[serde(default)]
    pub phase2_count: usize,
    #[serde(default)]
    pub last_turn_count: usize,
    #[serde(default)]
    pub session_timestamp: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
}

pub type Index = HashMap<String, IndexEntry>;

/// Fields supplied to `MilestoneStore::update_index`; any `None` leaves the
/// prior entry's value for that field untouched.
#[derive(Debug, Clone, Default)]
pub struct IndexUpdate {
    pub phase: Option<u8>,
    pub count: Option<usize>,
    pub phase1_count: Option<usize>,
    pub phase2_count: Option<usize>,
    pub last_turn_count: Option<usize>,
    pub session_timestamp: Option<DateTime<Utc>>,
}

/// Merge `update` onto the existing entry for `session_id` (or create one
/// from defaults), always refreshing `lastUpdated` to `now`.
pub fn merge(index: &mut Index, session_id: &str, update: IndexUpdate, now: DateTime<Utc>) {
    let entry = index.entry(session_id.to_string()).or_insert_with(|| IndexEntry {
        phase: 1,
        count: 0,
        phase1_count: 0,
        phase2_count: 0,
        last_turn_count: 0,
        session_timestamp: None,
        last_updated: now,
    });

    if let Some(phase) = update.phase {
        entry.phase = phase;
    }
    if let Some(count) = update.count {
        entry.count = count;
    }
    if let Some(p1) = update.phase1_count {
        entry.phase1_count = p1;
    }
    if let Some(p2) = update.phase2_count {
        entry.phase2_count = p2;
    }
    if let Some(turns) = update.last_turn_count {
        entry.last_turn_count = turns;
    }
    if let Some(ts) = update.session_timestamp {
        // The index tracks the maximum endTimestamp observed for a session
        // (spec §4.5 step 5), never a regression from a stale re-extraction.
        entry.session_timestamp = Some(match entry.session_timestamp {
            Some(existing) if existing > ts => existing,
            _ => ts,
        });
    }
    entry.last_updated = now;
}
