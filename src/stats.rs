//! # Stage Telemetry
//!
//! Every pipeline stage appends one [`StageStats`] entry to the job's
//! [`JobStats`] ledger: how many tasks ran, with what memory budget, how
//! many store objects the stage created or removed, and how long it took.
//! The ledger is the basis for cost accounting of a run and for checking
//! that interim objects were actually cleaned up.

use std::time::Instant;

use serde::Serialize;

/// Telemetry for one fabric stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageStats {
    /// Stage name (for example `"scatter-spectra"`).
    pub stage: String,
    /// Number of tasks the stage ran.
    pub tasks: usize,
    /// Memory budget per task, in MiB.
    pub memory_mb: usize,
    /// Store objects created by the stage.
    pub objects_put: usize,
    /// Store objects deleted by the stage.
    pub objects_deleted: usize,
    /// Wall-clock duration of the stage, in seconds.
    pub wall_seconds: f64,
}

/// Accumulated telemetry for one job.
#[derive(Debug, Default, Clone, Serialize)]
pub struct JobStats {
    /// Per-stage entries, in execution order.
    pub stages: Vec<StageStats>,
}

impl JobStats {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start timing a stage; finish it with [`StageTimer::finish`].
    pub fn stage(&mut self, name: &str) -> StageTimer<'_> {
        StageTimer {
            stats: self,
            stage: name.to_string(),
            started: Instant::now(),
        }
    }

    /// Net number of store objects created and not deleted across all
    /// stages. Zero interim leakage means this equals the number of final
    /// outputs plus surviving chunks.
    pub fn net_objects(&self) -> isize {
        self.stages
            .iter()
            .map(|s| s.objects_put as isize - s.objects_deleted as isize)
            .sum()
    }

    /// Render the ledger as pretty JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// In-flight stage measurement returned by [`JobStats::stage`].
pub struct StageTimer<'a> {
    stats: &'a mut JobStats,
    stage: String,
    started: Instant,
}

impl StageTimer<'_> {
    /// Record the stage with its task count, memory budget, and object
    /// deltas.
    pub fn finish(self, tasks: usize, memory_mb: usize, objects_put: usize, objects_deleted: usize) {
        let wall_seconds = self.started.elapsed().as_secs_f64();
        log::info!(
            "stage '{}': {tasks} tasks, +{objects_put}/-{objects_deleted} objects, {wall_seconds:.2}s",
            self.stage
        );
        self.stats.stages.push(StageStats {
            stage: self.stage,
            tasks,
            memory_mb,
            objects_put,
            objects_deleted,
            wall_seconds,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_accumulates_stages() {
        let mut stats = JobStats::new();
        stats.stage("scatter").finish(4, 2048, 8, 0);
        stats.stage("merge").finish(2, 2048, 2, 8);

        assert_eq!(stats.stages.len(), 2);
        assert_eq!(stats.stages[0].stage, "scatter");
        assert_eq!(stats.net_objects(), 2);
        assert!(stats.to_json().unwrap().contains("\"merge\""));
    }
}
