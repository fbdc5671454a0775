use std::sync::Arc;

use serde::Serialize;

use crate::model::Track;
use crate::storage::StorageMode;

/// Emitted once per finished segment task, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub track: Track,
    /// Index of the segment that just finished
    pub index: usize,
    /// Finished segments across all tracks of the run, monotonic
    pub completed: usize,
    pub total: usize,
    pub percentage: f64,
    pub cumulative_bytes: u64,
    pub mode: StorageMode,
    pub failed: bool,
}

/// Progress sink supplied by the caller; invoked from segment tasks.
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync + 'static>;
