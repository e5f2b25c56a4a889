use serde::{Deserialize, Serialize};

fn is_false(v: &bool) -> bool {
    !*v
}

/// Counters gathered over one superstep and shipped in the completion
/// report. Reset after every report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub active_count: u64,
    pub send_count: u64,
    pub received_count: u64,
    pub superstep_runtime_milli: u64,
    /// Set when a vertex program failed during the superstep. The failing
    /// task's range is abandoned; the flag travels with the report so the
    /// conductor can decide what to do with the execution.
    #[serde(default, skip_serializing_if = "is_false")]
    pub failed: bool,
}

impl WorkerStats {
    /// Fold one worker task's counters into the superstep totals.
    /// Runtime keeps the slowest range since tasks run in parallel.
    pub fn accumulate(&mut self, other: &WorkerStats) {
        self.active_count += other.active_count;
        self.send_count += other.send_count;
        self.received_count += other.received_count;
        self.superstep_runtime_milli = self.superstep_runtime_milli.max(other.superstep_runtime_milli);
        self.failed |= other.failed;
    }

    /// No vertex stayed active, nothing was sent and nothing was received:
    /// the conductor reads this as this worker's convergence vote.
    pub fn all_zero(&self) -> bool {
        self.active_count == 0 && self.send_count == 0 && self.received_count == 0
    }

    pub fn reset(&mut self) {
        *self = WorkerStats::default();
    }
}
