//! Running rechunk plans.
//!
//! An [`ExecutionContext`] is the explicit handle on the worker pool: it is
//! acquired from a [`ClusterConfig`], passed to whatever needs to execute a
//! plan, and torn down when it goes out of scope (outstanding work is
//! cancelled). [`ExecutionContext::scoped`] wraps a unit of work so teardown
//! also happens on error paths.
//!
//! Each stage of a plan runs as a set of tokio tasks. The synchronous zarrs
//! I/O happens in `spawn_blocking`, and a semaphore sized from the cluster
//! config bounds how many blocks are in flight. A failing task is retried
//! with exponential backoff; when it runs out of attempts the remaining tasks
//! are abandoned and the error is returned.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use metrics::counter;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use storage::{array_exists, clear_prefix, require_writable, ZarrStore};

use crate::array::{
    copy_block, create_array, is_marked_complete, mark_complete, open_array, ZarrArray,
    COMPLETE_ATTRIBUTE,
};
use crate::config::{ClusterConfig, RechunkConfig};
use crate::error::{RechunkError, Result};
use crate::plan::{CopyStage, CopyTask, RechunkPlan, StageKind};

/// Executes a single copy task. Called from a blocking thread.
pub trait TaskRunner: Send + Sync + 'static {
    /// Copy the task's block and return the number of bytes moved.
    fn run(&self, stage: &CopyStage, task: &CopyTask) -> Result<u64>;
}

/// [`TaskRunner`] that copies blocks between Zarr arrays.
///
/// Stages reading the source array read from `source`; everything else is
/// read from and written to `output`.
pub struct ZarrTaskRunner {
    source: ZarrStore,
    output: ZarrStore,
    arrays: Mutex<HashMap<(bool, String), Arc<ZarrArray>>>,
}

impl ZarrTaskRunner {
    pub fn new(source: ZarrStore, output: ZarrStore) -> Self {
        Self {
            source,
            output,
            arrays: Mutex::new(HashMap::new()),
        }
    }

    fn array(&self, from_source: bool, path: &str) -> Result<Arc<ZarrArray>> {
        let key = (from_source, path.to_string());
        if let Ok(arrays) = self.arrays.lock() {
            if let Some(array) = arrays.get(&key) {
                return Ok(array.clone());
            }
        }

        let store = if from_source { &self.source } else { &self.output };
        let array = Arc::new(open_array(store, path)?);
        if let Ok(mut arrays) = self.arrays.lock() {
            arrays.insert(key, array.clone());
        }
        Ok(array)
    }
}

impl TaskRunner for ZarrTaskRunner {
    fn run(&self, stage: &CopyStage, task: &CopyTask) -> Result<u64> {
        let from_source = stage.kind != StageKind::StagingToTarget;
        let from = self.array(from_source, &stage.from)?;
        let to = self.array(false, &stage.to)?;
        copy_block(&from, &to, &task.block)
    }
}

/// Outcome of a successful execution.
#[derive(Debug, Clone, Serialize)]
pub struct RechunkReport {
    pub run_id: Uuid,
    pub tasks_run: u64,
    pub retries: u64,
    pub bytes_copied: u64,
    pub elapsed: Duration,
}

#[derive(Default)]
struct RunCounters {
    tasks_run: AtomicU64,
    retries: AtomicU64,
    bytes_copied: AtomicU64,
}

#[derive(Clone, Copy)]
struct RetryPolicy {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl From<&RechunkConfig> for RetryPolicy {
    fn from(config: &RechunkConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: config.initial_retry_delay(),
            max_delay: config.max_retry_delay(),
        }
    }
}

/// Handle on the worker pool used to execute plans.
pub struct ExecutionContext {
    run_id: Uuid,
    cluster: ClusterConfig,
    cancelled: Arc<AtomicBool>,
}

impl ExecutionContext {
    /// Validate the cluster configuration and create a context.
    pub fn acquire(cluster: ClusterConfig) -> Result<Self> {
        cluster.validate()?;
        let run_id = Uuid::new_v4();
        info!(
            run_id = %run_id,
            worker_memory = %cluster.worker_memory,
            min_workers = cluster.min_workers,
            max_workers = cluster.max_workers,
            "Acquired execution context"
        );
        Ok(Self {
            run_id,
            cluster,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Run `f` with a freshly acquired context, tearing it down afterwards on
    /// every exit path.
    pub async fn scoped<F, Fut, T, E>(cluster: ClusterConfig, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Arc<ExecutionContext>) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<RechunkError>,
    {
        let context = Arc::new(Self::acquire(cluster)?);
        let _guard = Teardown(context.clone());
        f(context).await
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn cluster(&self) -> &ClusterConfig {
        &self.cluster
    }

    /// Abandon all pending work. Running tasks finish their current block.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            debug!(run_id = %self.run_id, "Execution context cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Execute `plan`, reading the source array from `source` and writing
    /// the staging and target arrays to `output`.
    pub async fn execute(
        &self,
        plan: &RechunkPlan,
        source: &ZarrStore,
        output: &ZarrStore,
        config: &RechunkConfig,
    ) -> Result<RechunkReport> {
        let runner = Arc::new(ZarrTaskRunner::new(source.clone(), output.clone()));
        self.execute_with(plan, output, config, runner).await
    }

    /// Execute `plan` with staging and target arrays in `store`, delegating
    /// each block copy to `runner`.
    ///
    /// Refuses to run when the store is read-only or a target array already
    /// exists. A staging array left over from an earlier run is cleared
    /// first. On success the target is marked complete and the staging array
    /// is removed; on failure both are left as they are.
    #[instrument(skip_all, fields(run_id = %self.run_id, target = %plan.target.path))]
    pub async fn execute_with(
        &self,
        plan: &RechunkPlan,
        store: &ZarrStore,
        config: &RechunkConfig,
        runner: Arc<dyn TaskRunner>,
    ) -> Result<RechunkReport> {
        if self.is_cancelled() {
            return Err(RechunkError::Cancelled);
        }
        self.cluster.check_budget(plan.max_mem)?;

        require_writable(store, &plan.target.path)?;

        if array_exists(store, &plan.target.path)? {
            return Err(RechunkError::TargetExists(plan.target.path.clone()));
        }

        if let Some(staging) = &plan.staging {
            if array_exists(store, &staging.path)? {
                warn!(path = %staging.path, "Removing stale staging store");
                clear_prefix(store, &staging.path)?;
            }
            create_array(store, staging, config, serde_json::Map::new())?;
        }

        let mut attributes = serde_json::Map::new();
        attributes.insert(COMPLETE_ATTRIBUTE.to_string(), serde_json::Value::Bool(false));
        attributes.insert("rechunk_run_id".to_string(), self.run_id.to_string().into());
        attributes.insert("source".to_string(), plan.source.path.clone().into());
        let mut target = create_array(store, &plan.target, config, attributes)?;

        info!(
            stages = plan.stages().len(),
            tasks = plan.task_count(),
            peak_task_bytes = plan.peak_task_bytes(),
            "Starting rechunk"
        );

        let start = Instant::now();
        let counters = Arc::new(RunCounters::default());
        let retry = RetryPolicy::from(config);

        for stage in plan.stages() {
            self.run_stage(stage, runner.clone(), retry, counters.clone())
                .await?;
        }

        mark_complete(&mut target)?;
        if let Some(staging) = &plan.staging {
            clear_prefix(store, &staging.path)?;
        }

        let report = RechunkReport {
            run_id: self.run_id,
            tasks_run: counters.tasks_run.load(Ordering::Relaxed),
            retries: counters.retries.load(Ordering::Relaxed),
            bytes_copied: counters.bytes_copied.load(Ordering::Relaxed),
            elapsed: start.elapsed(),
        };
        info!(
            tasks = report.tasks_run,
            retries = report.retries,
            bytes = report.bytes_copied,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Rechunk complete"
        );
        Ok(report)
    }

    async fn run_stage(
        &self,
        stage: &CopyStage,
        runner: Arc<dyn TaskRunner>,
        retry: RetryPolicy,
        counters: Arc<RunCounters>,
    ) -> Result<()> {
        let task_count = stage.task_count();
        let pool_size = self.cluster.pool_size(task_count);
        info!(
            stage = %stage.kind,
            tasks = task_count,
            workers = pool_size,
            "Running stage"
        );

        let semaphore = Arc::new(Semaphore::new(pool_size));
        let stage = Arc::new(stage.clone());
        let mut set = JoinSet::new();

        for task in stage.tasks() {
            let semaphore = semaphore.clone();
            let runner = runner.clone();
            let stage = stage.clone();
            let cancelled = self.cancelled.clone();
            let counters = counters.clone();

            set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| RechunkError::Cancelled)?;
                run_task(runner, stage, task, retry, cancelled, counters).await
            });
        }

        while let Some(joined) = set.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(RechunkError::TaskFailed {
                    stage: stage.kind.to_string(),
                    task: usize::MAX,
                    attempts: 1,
                    message: format!("task aborted: {}", e),
                })
            });

            if let Err(e) = result {
                // Abandon the rest of the stage
                self.cancel();
                set.abort_all();
                counter!("rechunk_tasks_failed_total", "stage" => stage.kind.as_str())
                    .increment(1);
                error!(stage = %stage.kind, error = %e, "Stage failed");
                return Err(e);
            }
        }

        Ok(())
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Cancels the context when dropped.
struct Teardown(Arc<ExecutionContext>);

impl Drop for Teardown {
    fn drop(&mut self) {
        self.0.cancel();
        info!(run_id = %self.0.run_id, "Released execution context");
    }
}

async fn run_task(
    runner: Arc<dyn TaskRunner>,
    stage: Arc<CopyStage>,
    task: CopyTask,
    retry: RetryPolicy,
    cancelled: Arc<AtomicBool>,
    counters: Arc<RunCounters>,
) -> Result<u64> {
    let mut attempts = 0u32;
    let mut delay = retry.initial_delay;

    loop {
        if cancelled.load(Ordering::SeqCst) {
            return Err(RechunkError::Cancelled);
        }
        attempts += 1;
        counter!("rechunk_tasks_dispatched_total", "stage" => stage.kind.as_str()).increment(1);

        let blocking_runner = runner.clone();
        let blocking_stage = stage.clone();
        let blocking_task = task.clone();
        let result =
            tokio::task::spawn_blocking(move || blocking_runner.run(&blocking_stage, &blocking_task))
                .await;

        let err = match result {
            Ok(Ok(bytes)) => {
                counters.tasks_run.fetch_add(1, Ordering::Relaxed);
                counters.bytes_copied.fetch_add(bytes, Ordering::Relaxed);
                debug!(stage = %stage.kind, task = task.index, bytes, "Task complete");
                return Ok(bytes);
            }
            Ok(Err(e)) => e,
            Err(join_error) => {
                return Err(RechunkError::TaskFailed {
                    stage: stage.kind.to_string(),
                    task: task.index,
                    attempts,
                    message: format!("worker panicked: {}", join_error),
                });
            }
        };

        if attempts > retry.max_retries || !err.is_transient() {
            return Err(RechunkError::TaskFailed {
                stage: stage.kind.to_string(),
                task: task.index,
                attempts,
                message: err.to_string(),
            });
        }

        counters.retries.fetch_add(1, Ordering::Relaxed);
        counter!("rechunk_tasks_retried_total", "stage" => stage.kind.as_str()).increment(1);
        warn!(
            stage = %stage.kind,
            task = task.index,
            attempt = attempts,
            max_retries = retry.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Task failed, retrying"
        );

        tokio::time::sleep(delay).await;
        delay = std::cmp::min(delay * 2, retry.max_delay);
    }
}

/// Remove a target array (metadata and chunks) so a failed rewrite can be
/// retried from scratch.
pub fn clear_target(store: &ZarrStore, path: &str) -> Result<()> {
    require_writable(store, path)?;
    if array_exists(store, path)? {
        clear_prefix(store, path)?;
        info!(path = %path, "Cleared target store");
    }
    Ok(())
}

/// True when a target array exists and was marked complete by a finished run.
pub fn is_complete(store: &ZarrStore, path: &str) -> Result<bool> {
    if !array_exists(store, path)? {
        return Ok(false);
    }
    Ok(is_marked_complete(&open_array(store, path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ByteSize;

    #[test]
    fn test_acquire_validates_cluster() {
        let cluster = ClusterConfig {
            min_workers: 0,
            ..Default::default()
        };
        assert!(matches!(
            ExecutionContext::acquire(cluster),
            Err(RechunkError::Config(_))
        ));
    }

    #[test]
    fn test_drop_cancels() {
        let context = ExecutionContext::acquire(ClusterConfig::default()).unwrap();
        let flag = context.cancelled.clone();
        drop(context);
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_scoped_tears_down_on_error() {
        let mut seen = None;
        let result: std::result::Result<(), RechunkError> =
            ExecutionContext::scoped(ClusterConfig::default(), |ctx| {
                seen = Some(ctx.clone());
                async move { Err(RechunkError::precondition("boom")) }
            })
            .await;

        assert!(result.is_err());
        assert!(seen.unwrap().is_cancelled());
    }

    #[test]
    fn test_scoped_skips_closure_on_invalid_cluster() {
        let cluster = ClusterConfig {
            min_workers: 3,
            max_workers: 1,
            ..Default::default()
        };
        let mut called = false;
        let result = tokio_test::block_on(ExecutionContext::scoped(cluster, |_ctx| {
            called = true;
            async { Ok::<_, RechunkError>(()) }
        }));

        assert!(matches!(result, Err(RechunkError::Config(_))));
        assert!(!called);
    }

    #[tokio::test]
    async fn test_scoped_returns_value() {
        let value = ExecutionContext::scoped(ClusterConfig::default(), |ctx| async move {
            assert!(!ctx.is_cancelled());
            Ok::<_, RechunkError>(ctx.cluster().max_workers)
        })
        .await
        .unwrap();
        assert_eq!(value, ClusterConfig::default().max_workers);
    }

    #[tokio::test]
    async fn test_budget_above_worker_memory_is_rejected() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let store = storage::open_store(&storage::StoreConfig::filesystem(temp_dir.path())).unwrap();
        let source = crate::types::ArrayDescriptor::new(vec![10, 4], vec![1, 4], 4).unwrap();
        let config = RechunkConfig {
            max_mem: ByteSize::gb(8),
            ..Default::default()
        };
        let plan = RechunkPlan::build(
            "/src.zarr",
            &source,
            &crate::types::ChunkShape::new(vec![10, 2]),
            &config,
            "/tmp.zarr",
            "/target.zarr",
        )
        .unwrap();

        let context = ExecutionContext::acquire(ClusterConfig::default()).unwrap();
        let result = context.execute(&plan, &store, &store, &config).await;
        assert!(matches!(result, Err(RechunkError::Config(_))));
        assert!(!array_exists(&store, "/target.zarr").unwrap());
    }
}
