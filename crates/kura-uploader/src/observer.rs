//! Progress reporting hooks

use kura_core::models::{FileUploadResult, LocalId, UploadStage};

/// Running batch counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadCounters {
    pub total: usize,
    pub finished: usize,
    pub failed: usize,
}

/// Receives progress of a batch. All methods default to no-ops.
pub trait UploadObserver: Send + Sync {
    fn on_stage(&self, _stage: UploadStage) {}

    /// Percentage of the asset's encrypted bytes sent so far
    fn on_file_progress(&self, _local_id: LocalId, _percent: u8) {}

    fn on_file_result(&self, _local_id: LocalId, _title: &str, _result: FileUploadResult) {}

    fn on_counters(&self, _counters: UploadCounters) {}
}

/// Reports everything through `tracing`
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl UploadObserver for TracingObserver {
    fn on_stage(&self, stage: UploadStage) {
        tracing::info!(stage = ?stage, "Upload stage changed");
    }

    fn on_file_progress(&self, local_id: LocalId, percent: u8) {
        tracing::trace!(local_id, percent, "Upload progress");
    }

    fn on_file_result(&self, local_id: LocalId, title: &str, result: FileUploadResult) {
        tracing::info!(local_id, title = %title, result = ?result, "File finished");
    }

    fn on_counters(&self, counters: UploadCounters) {
        tracing::debug!(
            total = counters.total,
            finished = counters.finished,
            failed = counters.failed,
            "Batch progress"
        );
    }
}
