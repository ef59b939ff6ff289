//! # Execution Fabric
//!
//! The outer concurrency layer: each scatter unit (one per chunk) and each
//! merge unit (one per coarse group) runs as an independent task that
//! shares no memory with its peers and coordinates only through the object
//! store. [`ExecutionFabric`] models the fleet as a parallel map with
//! results; a stage completes only when every task has, giving the
//! synchronous barrier between scatter and merge.
//!
//! [`RayonFabric`] is the in-process implementation used for tests and
//! single-machine runs. A remote fleet implements the same trait; the
//! per-task memory budget is advisory there and ignored here.
//!
//! # Failure semantics
//!
//! The first task failure aborts the whole stage: results of sibling tasks
//! are discarded and the error carries the stage name and task index.
//! There is no partial resume.

use rayon::prelude::*;

/// Errors raised by a fabric stage.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    /// A task returned an error; the stage is aborted.
    #[error("stage '{stage}' failed at task {task_index}: {source}")]
    TaskFailed {
        /// Stage that failed.
        stage: String,
        /// Index of the failing task within the stage's input list.
        task_index: usize,
        /// The task's own error.
        #[source]
        source: anyhow::Error,
    },

    /// The fabric itself could not be constructed.
    #[error("fabric initialization failed: {0}")]
    Init(String),
}

/// Parallel-map-with-results primitive over a fleet of isolated tasks.
pub trait ExecutionFabric: Send + Sync {
    /// Run `task` once per input, each as an independent invocation with
    /// `memory_mb` of provisioned memory, and collect one result per input
    /// in input order. Returns after every task has completed, or as soon
    /// as the stage is known to have failed.
    fn run<I, O, F>(
        &self,
        stage: &str,
        inputs: Vec<I>,
        memory_mb: usize,
        task: F,
    ) -> Result<Vec<O>, FabricError>
    where
        I: Send,
        O: Send,
        F: Fn(I) -> Result<O, anyhow::Error> + Send + Sync;
}

/// In-process fabric backed by an owned rayon thread pool.
pub struct RayonFabric {
    pool: rayon::ThreadPool,
}

impl RayonFabric {
    /// Fabric sized to the machine's available parallelism.
    pub fn new() -> Result<Self, FabricError> {
        let workers = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(4);
        Self::with_workers(workers)
    }

    /// Fabric with a fixed number of concurrent tasks.
    pub fn with_workers(workers: usize) -> Result<Self, FabricError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("mzsegment-task-{i}"))
            .build()
            .map_err(|e| FabricError::Init(e.to_string()))?;
        Ok(Self { pool })
    }
}

impl ExecutionFabric for RayonFabric {
    fn run<I, O, F>(
        &self,
        stage: &str,
        inputs: Vec<I>,
        memory_mb: usize,
        task: F,
    ) -> Result<Vec<O>, FabricError>
    where
        I: Send,
        O: Send,
        F: Fn(I) -> Result<O, anyhow::Error> + Send + Sync,
    {
        let task_count = inputs.len();
        log::info!("stage '{stage}': {task_count} tasks, {memory_mb} MiB per task");
        let results: Result<Vec<O>, FabricError> = self.pool.install(|| {
            inputs
                .into_par_iter()
                .enumerate()
                .map(|(task_index, input)| {
                    task(input).map_err(|source| FabricError::TaskFailed {
                        stage: stage.to_string(),
                        task_index,
                        source,
                    })
                })
                .collect()
        });
        if results.is_ok() {
            log::debug!("stage '{stage}': {task_count} tasks completed");
        }
        results
    }
}
