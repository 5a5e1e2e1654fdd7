// src/summarizer/status.rs
// Periodic pipeline-status snapshot written to disk — spec §6.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Processing,
    Stopping,
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Throughput {
    pub milestones_per_minute: f64,
    pub batches_completed: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    pub status: PipelineState,
    pub queue_size: usize,
    pub processed: u64,
    pub errors: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub current_batch: Option<usize>,
    pub throughput: Option<Throughput>,
    pub vectors_indexed: u64,
    pub vector_errors: u64,
    pub merges_applied: u64,
    pub milestones_absorbed: u64,
    pub current_model: Option<String>,
}

/// Writes `pipeline-status.json` under the milestone data directory. Each
/// write is a full-file overwrite, matching how the session store persists
/// its own JSON files — readers never see a torn snapshot.
pub struct StatusWriter {
    path: PathBuf,
}

impl StatusWriter {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            path: data_dir.join("pipeline-status.json"),
        }
    }

    pub fn write(&self, status: &PipelineStatus) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(status)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}
