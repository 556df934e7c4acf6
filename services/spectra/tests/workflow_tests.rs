//! End-to-end workflow runs against filesystem stores.

use std::path::Path;

use rechunk::{describe, ChunkShape, RechunkError};
use spectra::{parse_config, RechunkOutcome, RunOptions, SpectrumReport, Stage, Workflow};
use storage::{array_exists, get_object, open_store, StorageError, StoreConfig, ZarrStore};
use test_utils::{catalog_json, read_all, sinusoid_cube, temp_dir, write_cube, ReadOnlyStore};

const NT: usize = 730;
const NY: usize = 4;
const NX: usize = 6;

/// Source store with a two-year daily cube whose cell (0, 0) is 90% missing,
/// plus a catalog pointing at it.
fn setup(dir: &Path) {
    setup_with_gaps(dir, &[(0, 0, 0.9)]);
}

fn setup_with_gaps(dir: &Path, gaps: &[(usize, usize, f64)]) {
    let source_root = dir.join("source");
    let store = open_store(&StoreConfig::filesystem(&source_root)).unwrap();

    let mut cube = sinusoid_cube(NT, NY, NX, 365.0, 1.0);
    for &(y, x, missing) in gaps {
        cube.punch_gaps(y, x, missing);
    }
    write_cube(store, "/ds/tos", &cube, &[1, NY as u64, NX as u64], None).unwrap();

    std::fs::write(
        dir.join("catalog.json"),
        catalog_json(&source_root, "ds", "/ds", "tos"),
    )
    .unwrap();
}

fn config_yaml(dir: &Path, extra: &str) -> String {
    format!(
        r#"
catalog:
  url: file://{catalog}
  dataset: ds
  variable: tos
storage:
  type: filesystem
  root: {output}
rechunk:
  target_chunks: [0, 2, 3]
  max_mem: 40000
  max_retries: 1
  initial_retry_delay_ms: 1
cluster:
  worker_memory: 64MB
  min_workers: 1
  max_workers: 2
bands:
  - {{ label: annual, low: 0.002, high: 0.004 }}
  - {{ label: synoptic, low: 0.0333, high: 0.5 }}
{extra}
"#,
        catalog = dir.join("catalog.json").display(),
        output = dir.join("output").display(),
        extra = extra,
    )
}

async fn workflow(dir: &Path, extra: &str) -> Workflow {
    workflow_from(&config_yaml(dir, extra)).await
}

async fn workflow_from(yaml: &str) -> Workflow {
    let config = parse_config(yaml).unwrap();
    Workflow::prepare(config).await.unwrap()
}

fn read_only(store: &ZarrStore) -> ZarrStore {
    ReadOnlyStore::shared(store.clone())
}

fn options(stage: Stage) -> RunOptions {
    RunOptions {
        stage,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_workflow_writes_bands_and_report() {
    let dir = temp_dir();
    setup(dir.path());
    let workflow = workflow(dir.path(), "").await;

    let outcome = workflow.run(&options(Stage::All)).await.unwrap();
    match outcome.rechunk {
        Some(RechunkOutcome::Completed(report)) => assert!(report.tasks_run > 0),
        other => panic!("unexpected rechunk outcome: {:?}", other),
    }

    let report = outcome.spectrum.unwrap();
    let global = report.region("global").unwrap();
    assert_eq!(global.masked_cells, 1);
    assert_eq!(global.contributing_cells, NY * NX - 1);

    let annual = global.band_mean("annual").unwrap();
    let synoptic = global.band_mean("synoptic").unwrap();
    assert!(annual > 1000.0 * synoptic, "annual {} synoptic {}", annual, synoptic);

    // A zero time chunk takes the whole time axis
    let paths = workflow.paths();
    assert_eq!(
        describe(workflow.output_store(), &paths.target()).unwrap().chunks,
        ChunkShape::new(vec![NT as u64, 2, 3])
    );

    // Band maps: [band, y, x] with the sparse cell masked in every band
    let bands = rechunk::open_array(workflow.output_store(), &paths.bands()).unwrap();
    assert_eq!(bands.shape(), &[2, NY as u64, NX as u64]);
    let values = read_all(&bands).unwrap();
    assert!(values[0].is_nan());
    assert!(values[NY * NX].is_nan());
    assert!(values[1..NY * NX].iter().all(|v| v.is_finite() && *v > 0.0));

    let attrs = bands.attributes();
    assert_eq!(attrs["labels"], serde_json::json!(["annual", "synoptic"]));

    // The persisted report matches the returned one
    let body = get_object(workflow.output_store(), &paths.report_key())
        .unwrap()
        .unwrap();
    let stored: SpectrumReport = serde_json::from_slice(&body).unwrap();
    assert_eq!(stored.regions.len(), 1);
    assert_eq!(stored.regions[0].band_mean("annual"), Some(annual));

    // Staging is removed after a successful rewrite
    assert!(!array_exists(workflow.output_store(), &paths.staging()).unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_run_skips_complete_target() {
    let dir = temp_dir();
    setup(dir.path());
    let workflow = workflow(dir.path(), "").await;

    workflow.run(&options(Stage::Rechunk)).await.unwrap();
    let again = workflow.run(&options(Stage::Rechunk)).await.unwrap();
    assert!(matches!(again.rechunk, Some(RechunkOutcome::AlreadyComplete)));
    assert!(again.spectrum.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dry_run_writes_nothing() {
    let dir = temp_dir();
    setup(dir.path());
    let workflow = workflow(dir.path(), "").await;

    let outcome = workflow
        .run(&RunOptions {
            stage: Stage::All,
            dry_run: true,
            clear_target: false,
        })
        .await
        .unwrap();

    match outcome.rechunk {
        Some(RechunkOutcome::DryRun { summary }) => assert!(summary.contains("tos_target.zarr")),
        other => panic!("unexpected rechunk outcome: {:?}", other),
    }
    assert!(outcome.spectrum.is_none());
    assert!(!array_exists(workflow.output_store(), &workflow.paths().target()).unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_incomplete_target_requires_clear() {
    let dir = temp_dir();
    setup(dir.path());
    let workflow = workflow(dir.path(), "").await;

    // Leftover of an interrupted run: a target without the completion marker
    let leftover = sinusoid_cube(NT, NY, NX, 365.0, 1.0);
    let output = workflow.output_store().clone();
    write_cube(output, &workflow.paths().target(), &leftover, &[730, 2, 3], None).unwrap();

    let err = workflow.run(&options(Stage::Rechunk)).await.unwrap_err();
    assert!(err.to_string().contains("--clear-target"), "{}", err);

    let outcome = workflow
        .run(&RunOptions {
            stage: Stage::Rechunk,
            dry_run: false,
            clear_target: true,
        })
        .await
        .unwrap();
    assert!(matches!(outcome.rechunk, Some(RechunkOutcome::Completed(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_spectrum_stage_requires_rechunked_target() {
    let dir = temp_dir();
    setup(dir.path());
    let workflow = workflow(dir.path(), "").await;

    let err = workflow.run(&options(Stage::Spectrum)).await.unwrap_err();
    assert!(err.to_string().contains("incomplete"), "{}", err);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_configured_regions_are_summarised_separately() {
    let dir = temp_dir();
    setup(dir.path());
    let regions = r#"
regions:
  - { name: west, y: [0, 4], x: [0, 3] }
  - { name: east, y: [0, 4], x: [3, 6] }
"#;
    let workflow = workflow(dir.path(), regions).await;

    let report = workflow
        .run(&options(Stage::All))
        .await
        .unwrap()
        .spectrum
        .unwrap();

    let west = report.region("west").unwrap();
    let east = report.region("east").unwrap();
    assert_eq!(west.masked_cells, 1);
    assert_eq!(east.masked_cells, 0);
    assert_eq!(east.contributing_cells, 12);
    assert_eq!(west.frequencies.len(), NT / 2 + 1);
    assert!(report.region("global").is_none());
}

#[tokio::test]
async fn test_region_outside_grid_fails() {
    let dir = temp_dir();
    setup(dir.path());
    let workflow = workflow(dir.path(), "regions:\n  - { name: far, y: [0, 2], x: [4, 9] }\n").await;

    workflow.run(&options(Stage::Rechunk)).await.unwrap();
    let err = workflow.run(&options(Stage::Spectrum)).await.unwrap_err();
    assert!(format!("{:#}", err).contains("far"), "{:#}", err);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_split_time_axis_is_refused_before_rewrite() {
    let dir = temp_dir();
    setup(dir.path());
    let yaml = config_yaml(dir.path(), "").replace("[0, 2, 3]", "[365, 2, 3]");
    let workflow = workflow_from(&yaml).await;

    for dry_run in [true, false] {
        let err = workflow
            .run(&RunOptions {
                stage: Stage::All,
                dry_run,
                clear_target: false,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("time chunk 365"), "{}", err);
    }
    assert!(!array_exists(workflow.output_store(), &workflow.paths().target()).unwrap());
    assert!(!array_exists(workflow.output_store(), &workflow.paths().staging()).unwrap());

    // Rechunking alone may split the time axis
    let outcome = workflow.run(&options(Stage::Rechunk)).await.unwrap();
    assert!(matches!(outcome.rechunk, Some(RechunkOutcome::Completed(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_read_only_output_is_refused() {
    let dir = temp_dir();
    setup(dir.path());
    let workflow = workflow(dir.path(), "").await;
    let paths = workflow.paths().clone();
    let store = workflow.output_store().clone();

    let err = workflow
        .clone()
        .with_output_store(read_only(&store))
        .run(&options(Stage::Rechunk))
        .await
        .unwrap_err();
    assert!(
        matches!(err.downcast_ref::<RechunkError>(), Some(RechunkError::ReadOnly(_))),
        "{:#}",
        err
    );
    assert!(!array_exists(&store, &paths.target()).unwrap());

    let first = workflow.run(&options(Stage::All)).await.unwrap();
    let report_before = get_object(&store, &paths.report_key()).unwrap().unwrap();

    let err = workflow
        .clone()
        .with_output_store(read_only(&store))
        .run(&options(Stage::Spectrum))
        .await
        .unwrap_err();
    assert!(
        matches!(err.downcast_ref::<StorageError>(), Some(StorageError::ReadOnly(_))),
        "{:#}",
        err
    );

    // Earlier outputs are untouched
    assert!(array_exists(&store, &paths.bands()).unwrap());
    let report_after = get_object(&store, &paths.report_key()).unwrap().unwrap();
    assert_eq!(report_before, report_after);
    assert!(first.spectrum.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mask_cells_follow_the_global_grid() {
    let dir = temp_dir();
    // Coarse cell (rows 0-1, cols 0-1) keeps (2 + 2 × 0.1) / 4 = 55% of its samples
    setup_with_gaps(dir.path(), &[(0, 1, 0.9), (1, 1, 0.9)]);
    let extra = r#"
mask:
  threshold: 0.6
  coarsen: 2
regions:
  - { name: all, y: [0, 4], x: [0, 6] }
  - { name: shifted, y: [0, 4], x: [1, 6] }
"#;
    let workflow = workflow(dir.path(), extra).await;

    let report = workflow
        .run(&options(Stage::All))
        .await
        .unwrap()
        .spectrum
        .unwrap();

    let all = report.region("all").unwrap();
    assert_eq!(all.masked_cells, 4);
    assert_eq!(all.contributing_cells, NY * NX - 4);

    // Column 0 falls outside the region but still shares the masked coarse cell
    let shifted = report.region("shifted").unwrap();
    assert_eq!(shifted.masked_cells, 2);
    assert_eq!(shifted.contributing_cells, NY * (NX - 1) - 2);
}
