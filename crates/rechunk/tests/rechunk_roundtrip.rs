//! End-to-end rechunk tests against a filesystem Zarr store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use rechunk::{
    clear_target, describe, is_complete, open_array, ByteSize, ChunkShape, ClusterConfig,
    CopyStage, CopyTask, ExecutionContext, RechunkConfig, RechunkError, RechunkPlan, StageKind,
    TaskRunner, ZarrCompression, ZarrTaskRunner,
};
use storage::{array_exists, open_store, StoreConfig, ZarrStore};
use test_utils::{index_cube, read_all, temp_dir, write_cube, Cube, ReadOnlyStore};

const SOURCE: &str = "/ds/tos.zarr";
const STAGING: &str = "/ds/tos_tmp.zarr";
const TARGET: &str = "/ds/tos_target.zarr";

fn setup(cube: &Cube, chunks: &[u64]) -> (tempfile::TempDir, ZarrStore) {
    let dir = temp_dir();
    let store = open_store(&StoreConfig::filesystem(dir.path())).unwrap();
    write_cube(store.clone(), SOURCE, cube, chunks, None).unwrap();
    (dir, store)
}

fn config(max_mem: u64) -> RechunkConfig {
    RechunkConfig {
        max_mem: ByteSize(max_mem),
        initial_retry_delay_ms: 1,
        max_retry_delay_ms: 5,
        compression: ZarrCompression::BloscZstd,
        ..Default::default()
    }
}

fn cluster() -> ClusterConfig {
    ClusterConfig {
        worker_memory: ByteSize::mb(64),
        min_workers: 1,
        max_workers: 3,
    }
}

fn plan_for(store: &ZarrStore, target_chunks: Vec<u64>, config: &RechunkConfig) -> RechunkPlan {
    let source = describe(store, SOURCE).unwrap();
    RechunkPlan::build(
        SOURCE,
        &source,
        &ChunkShape::new(target_chunks),
        config,
        STAGING,
        TARGET,
    )
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_roundtrip_through_staging() {
    let cube = index_cube(60, 8, 12);
    let (_dir, store) = setup(&cube, &[1, 8, 12]);
    let config = config(8_000);

    let plan = plan_for(&store, vec![60, 4, 4], &config);
    assert!(plan.staging.is_some());
    assert!(plan.peak_task_bytes() <= 8_000);

    let report = ExecutionContext::scoped(cluster(), |ctx| {
        let store = store.clone();
        let config = config.clone();
        let plan = plan.clone();
        async move { ctx.execute(&plan, &store, &store, &config).await }
    })
    .await
    .unwrap();

    assert_eq!(report.tasks_run as usize, plan.task_count());
    assert_eq!(report.retries, 0);
    // Every element is copied once per stage
    assert_eq!(report.bytes_copied, 2 * 60 * 8 * 12 * 4);

    let target = open_array(&store, TARGET).unwrap();
    assert_eq!(read_all(&target).unwrap(), cube.data);
    assert_eq!(
        describe(&store, TARGET).unwrap().chunks,
        ChunkShape::new(vec![60, 4, 4])
    );
    assert!(is_complete(&store, TARGET).unwrap());
    assert!(!array_exists(&store, STAGING).unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_roundtrip_without_staging() {
    let cube = index_cube(20, 6, 6);
    let (_dir, store) = setup(&cube, &[10, 6, 6]);
    let config = config(1_000_000);

    let plan = plan_for(&store, vec![10, 3, 3], &config);
    assert!(plan.staging.is_none());
    assert_eq!(plan.stages()[0].kind, StageKind::SourceToTarget);

    let ctx = ExecutionContext::acquire(cluster()).unwrap();
    ctx.execute(&plan, &store, &store, &config).await.unwrap();

    let target = open_array(&store, TARGET).unwrap();
    assert_eq!(read_all(&target).unwrap(), cube.data);
    assert!(is_complete(&store, TARGET).unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_existing_target_requires_explicit_clear() {
    let cube = index_cube(12, 4, 4);
    let (_dir, store) = setup(&cube, &[1, 4, 4]);
    let config = config(1_000_000);
    let plan = plan_for(&store, vec![12, 2, 2], &config);

    ExecutionContext::acquire(cluster())
        .unwrap()
        .execute(&plan, &store, &store, &config)
        .await
        .unwrap();

    let second = ExecutionContext::acquire(cluster())
        .unwrap()
        .execute(&plan, &store, &store, &config)
        .await;
    assert!(matches!(second, Err(RechunkError::TargetExists(ref p)) if p == TARGET));

    clear_target(&store, TARGET).unwrap();
    assert!(!array_exists(&store, TARGET).unwrap());

    ExecutionContext::acquire(cluster())
        .unwrap()
        .execute(&plan, &store, &store, &config)
        .await
        .unwrap();
    let target = open_array(&store, TARGET).unwrap();
    assert_eq!(read_all(&target).unwrap(), cube.data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_read_only_output_is_refused_before_writing() {
    let cube = index_cube(12, 4, 4);
    let (_dir, store) = setup(&cube, &[1, 4, 4]);
    let config = config(1_000_000);
    let plan = plan_for(&store, vec![12, 2, 2], &config);

    let read_only = ReadOnlyStore::shared(store.clone());
    let output: ZarrStore = read_only.clone();
    let runner = Arc::new(FlakyRunner::new(store.clone(), 0));

    let result = ExecutionContext::acquire(cluster())
        .unwrap()
        .execute_with(&plan, &output, &config, runner.clone())
        .await;
    assert!(matches!(result, Err(RechunkError::ReadOnly(ref p)) if p == TARGET));
    assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    assert!(!array_exists(&store, TARGET).unwrap());
    assert!(!array_exists(&store, STAGING).unwrap());

    let result = ExecutionContext::acquire(cluster())
        .unwrap()
        .execute(&plan, &store, &output, &config)
        .await;
    assert!(matches!(result, Err(RechunkError::ReadOnly(_))));
    assert!(matches!(
        clear_target(&output, TARGET),
        Err(RechunkError::ReadOnly(_))
    ));
    assert!(!array_exists(&store, TARGET).unwrap());
}

/// Fails selected tasks a fixed number of times before delegating.
struct FlakyRunner {
    inner: ZarrTaskRunner,
    fail_times: u32,
    failures: Mutex<HashSet<(StageKind, usize, u32)>>,
    calls: AtomicU32,
}

impl FlakyRunner {
    fn new(store: ZarrStore, fail_times: u32) -> Self {
        Self {
            inner: ZarrTaskRunner::new(store.clone(), store),
            fail_times,
            failures: Mutex::new(HashSet::new()),
            calls: AtomicU32::new(0),
        }
    }
}

impl TaskRunner for FlakyRunner {
    fn run(&self, stage: &CopyStage, task: &CopyTask) -> rechunk::Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if task.index == 0 {
            let mut failures = self.failures.lock().unwrap();
            for attempt in 0..self.fail_times {
                if failures.insert((stage.kind, task.index, attempt)) {
                    return Err(RechunkError::Storage("connection reset".to_string()));
                }
            }
        }
        self.inner.run(stage, task)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transient_failures_are_retried() {
    let cube = index_cube(30, 4, 6);
    let (_dir, store) = setup(&cube, &[1, 4, 6]);
    let config = RechunkConfig {
        max_retries: 2,
        ..config(2_000)
    };
    let plan = plan_for(&store, vec![30, 2, 2], &config);
    let stages = plan.stages().len() as u64;

    let runner = Arc::new(FlakyRunner::new(store.clone(), 2));
    let report = ExecutionContext::acquire(cluster())
        .unwrap()
        .execute_with(&plan, &store, &config, runner.clone())
        .await
        .unwrap();

    // Task 0 of every stage failed twice
    assert_eq!(report.retries, 2 * stages);
    let target = open_array(&store, TARGET).unwrap();
    assert_eq!(read_all(&target).unwrap(), cube.data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exhausted_retries_abort_and_keep_staging() {
    let cube = index_cube(30, 4, 6);
    let (_dir, store) = setup(&cube, &[1, 4, 6]);
    let config = RechunkConfig {
        max_retries: 1,
        ..config(2_000)
    };
    let plan = plan_for(&store, vec![30, 2, 2], &config);
    assert!(plan.staging.is_some());

    let runner = Arc::new(FlakyRunner::new(store.clone(), 5));
    let ctx = ExecutionContext::acquire(cluster()).unwrap();
    let result = ctx.execute_with(&plan, &store, &config, runner).await;

    match result {
        Err(RechunkError::TaskFailed { task, attempts, .. }) => {
            assert_eq!(task, 0);
            assert_eq!(attempts, 2);
        }
        other => panic!("expected TaskFailed, got {:?}", other),
    }
    assert!(ctx.is_cancelled());
    assert!(array_exists(&store, STAGING).unwrap());
    assert!(array_exists(&store, TARGET).unwrap());
    assert!(!is_complete(&store, TARGET).unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_default_config_does_not_retry() {
    let cube = index_cube(10, 2, 2);
    let (_dir, store) = setup(&cube, &[1, 2, 2]);
    let config = config(1_000_000);
    assert_eq!(config.max_retries, 0);
    let plan = plan_for(&store, vec![10, 1, 1], &config);

    let runner = Arc::new(FlakyRunner::new(store.clone(), 1));
    let result = ExecutionContext::acquire(cluster())
        .unwrap()
        .execute_with(&plan, &store, &config, runner)
        .await;
    assert!(matches!(
        result,
        Err(RechunkError::TaskFailed { attempts: 1, .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stale_staging_is_cleared_before_run() {
    let cube = index_cube(30, 4, 6);
    let (_dir, store) = setup(&cube, &[1, 4, 6]);
    let config = config(2_000);
    let plan = plan_for(&store, vec![30, 2, 2], &config);

    // Leftover staging array with unrelated contents
    let junk = index_cube(2, 2, 2);
    write_cube(store.clone(), STAGING, &junk, &[1, 1, 1], None).unwrap();

    ExecutionContext::acquire(cluster())
        .unwrap()
        .execute(&plan, &store, &store, &config)
        .await
        .unwrap();

    let target = open_array(&store, TARGET).unwrap();
    assert_eq!(read_all(&target).unwrap(), cube.data);
    assert!(!array_exists(&store, STAGING).unwrap());
}

#[test]
fn test_budget_below_one_target_chunk_fails_at_planning() {
    let cube = index_cube(100, 10, 10);
    let (_dir, store) = setup(&cube, &[1, 10, 10]);
    let source = describe(&store, SOURCE).unwrap();

    // One target chunk is 100 * 5 * 5 * 4 = 10_000 bytes
    let result = RechunkPlan::build(
        SOURCE,
        &source,
        &ChunkShape::new(vec![100, 5, 5]),
        &config(9_999),
        STAGING,
        TARGET,
    );
    assert!(matches!(result, Err(RechunkError::Config(_))));
    assert!(!array_exists(&store, TARGET).unwrap());
    assert!(!array_exists(&store, STAGING).unwrap());
}
