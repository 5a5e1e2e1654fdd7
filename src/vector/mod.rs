// src/vector/mod.rs
// The vector store, consumed only through this narrow callback interface —
// spec §6 "Vector store (consumed via callback interface)".

use crate::error::Result;
use crate::milestone::Milestone;
use async_trait::async_trait;

/// A single milestone surfaced for indexing before it has Phase 2 content —
/// the "new Phase 1 milestones" side channel fired during re-extraction
/// (spec §4.5 step 6).
#[derive(Debug, Clone)]
pub struct VectorItem {
    pub id: String,
    pub session_id: String,
    pub index: usize,
    pub text: String,
    pub project_path: Option<String>,
}

impl VectorItem {
    pub fn from_phase1(milestone: &Milestone, project_path: Option<String>) -> Self {
        let text = milestone
            .user_prompts
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            id: milestone.id(),
            session_id: milestone.session_id.clone(),
            index: milestone.index,
            text,
            project_path,
        }
    }
}

/// Narrow interface the pipeline depends on; the real vector store lives
/// entirely outside this crate. Errors from any method are caught by the
/// caller and counted, never propagated as a hard failure (spec §7
/// "Vector-store error").
#[async_trait]
pub trait VectorIndexer: Send + Sync {
    /// Fire-and-forget from the caller's perspective (spec §5): index a
    /// batch of freshly discovered Phase 1 milestones.
    async fn add_vectors(&self, items: Vec<VectorItem>) -> Result<()>;

    /// Remove an absorbed milestone's vectors by its pre-resequence index.
    async fn delete_milestone(&self, session_id: &str, original_index: usize) -> Result<()>;

    /// Fired after a milestone is promoted to Phase 2; awaited serially per
    /// milestone so the vector store sees a consistent write order.
    async fn on_phase2_complete(&self, milestone: &Milestone, project_path: Option<&str>) -> Result<()>;
}

/// A no-op indexer for callers that haven't wired a real vector store yet,
/// and for tests that only care about the milestone-side behaviour.
pub struct NullVectorIndexer;

#[async_trait]
impl VectorIndexer for NullVectorIndexer {
    async fn add_vectors(&self, _items: Vec<VectorItem>) -> Result<()> {
        Ok(())
    }

    async fn delete_milestone(&self, _session_id: &str, _original_index: usize) -> Result<()> {
        Ok(())
    }

    async fn on_phase2_complete(&self, _milestone: &Milestone, _project_path: Option<&str>) -> Result<()> {
        Ok(())
    }
}
