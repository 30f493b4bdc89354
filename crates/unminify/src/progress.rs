//! Progress reporting and the cost gate.
//!
//! Both are caller-supplied trait objects in the manner of a pluggable
//! output sink: the engine never renders anything itself, it only emits
//! structured records after every batch and asks once before spending.

use std::time::Duration;

use crate::tokens::CostEstimate;

/// One progress record, emitted after every completed batch.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    /// Functions processed so far.
    pub current: usize,
    /// Total functions in the run.
    pub total: usize,
    /// Cumulative cache hits.
    pub cache_hits: usize,
    /// Cumulative cache misses.
    pub cache_misses: usize,
    /// Cumulative input tokens sent to the oracle.
    pub input_tokens: usize,
    /// Cumulative output tokens received from the oracle.
    pub output_tokens: usize,
    /// Batches that failed and were recorded as empty mappings.
    pub errors: usize,
    /// Wall-clock time since the run started.
    pub elapsed: Duration,
    /// Human-readable label for the work just finished.
    pub label: String,
}

/// Receiver for progress records.
///
/// Implement this to drive a progress bar or structured logs. The engine
/// calls it from the scheduling loop; implementations should return
/// quickly.
pub trait ProgressSink {
    /// Called once per completed batch.
    fn update(&mut self, progress: &ProgressUpdate);
}

/// Sink that ignores all progress.
#[derive(Debug, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn update(&mut self, _progress: &ProgressUpdate) {}
}

/// Sink that collects every update, for tests and trace capture.
#[derive(Debug, Default)]
pub struct CollectProgress(Vec<ProgressUpdate>);

impl CollectProgress {
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// The updates received so far.
    #[must_use]
    pub fn updates(&self) -> &[ProgressUpdate] {
        &self.0
    }

    /// Consumes the sink and returns the collected updates.
    #[must_use]
    pub fn into_updates(self) -> Vec<ProgressUpdate> {
        self.0
    }
}

impl ProgressSink for CollectProgress {
    fn update(&mut self, progress: &ProgressUpdate) {
        self.0.push(progress.clone());
    }
}

/// Decides whether the run may spend the estimated amount.
///
/// Invoked exactly once, before any oracle traffic, unless confirmation is
/// skipped in the options. Returning `false` aborts the run with the
/// distinguished cancelled error.
pub trait CostGate {
    fn confirm(&self, estimate: &CostEstimate) -> bool;
}

/// Gate that approves every estimate.
#[derive(Debug, Default)]
pub struct ApproveAll;

impl CostGate for ApproveAll {
    fn confirm(&self, _estimate: &CostEstimate) -> bool {
        true
    }
}
