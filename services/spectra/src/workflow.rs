//! The three-stage workflow: rechunk, transform, present.
//!
//! Stage 1 rewrites the catalog variable into whole-time-axis chunks, stage 2
//! opens a lazy spectrum over the rewritten array, and stage 3 reduces it to
//! band maps and regional spectra.

use std::ops::Range;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use zarrs::array_subset::ArraySubset;

use rechunk::{
    clear_target, describe, is_complete, open_array, ExecutionContext, RechunkPlan, RechunkReport,
    ZarrArray,
};
use spectral::{regional_mean_spectrum, BandTable, LazySpectrum, Region, ValidityMask};
use storage::{
    array_exists, open_store, require_writable, DatasetCatalog, DatasetEntry, StorePaths,
    ZarrStore,
};

use crate::config::{region_config, RegionConfig, WorkflowConfig};
use crate::report::{log_rechunk, write_report, BandWriter, RegionReport, SpectrumReport};

/// Which stages to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Rechunk,
    Spectrum,
    #[default]
    All,
}

impl Stage {
    fn includes_rechunk(self) -> bool {
        matches!(self, Stage::Rechunk | Stage::All)
    }

    fn includes_spectrum(self) -> bool {
        matches!(self, Stage::Spectrum | Stage::All)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub stage: Stage,
    /// Plan only; touch no storage.
    pub dry_run: bool,
    /// Erase an incomplete target before rewriting it.
    pub clear_target: bool,
}

#[derive(Debug, Clone)]
pub enum RechunkOutcome {
    DryRun { summary: String },
    AlreadyComplete,
    Completed(RechunkReport),
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowOutcome {
    pub rechunk: Option<RechunkOutcome>,
    pub spectrum: Option<SpectrumReport>,
}

/// A resolved dataset variable and the stores it flows through.
#[derive(Clone)]
pub struct Workflow {
    config: WorkflowConfig,
    entry: DatasetEntry,
    source: ZarrStore,
    output: ZarrStore,
    paths: StorePaths,
}

impl Workflow {
    /// Load the catalog and resolve the configured dataset variable.
    #[instrument(skip_all, fields(dataset = %config.catalog.dataset, variable = %config.catalog.variable))]
    pub async fn prepare(config: WorkflowConfig) -> Result<Self> {
        let catalog = DatasetCatalog::load(&config.catalog.url)
            .await
            .with_context(|| format!("Failed to load catalog {}", config.catalog.url))?;
        Self::from_catalog(config, &catalog)
    }

    pub fn from_catalog(config: WorkflowConfig, catalog: &DatasetCatalog) -> Result<Self> {
        let entry = catalog.resolve(&config.catalog.dataset, &config.catalog.variable)?;
        let source = open_store(&entry.store)
            .with_context(|| format!("Failed to open source store {}", entry.store.location()))?;
        let output = open_store(&config.storage)
            .with_context(|| format!("Failed to open output store {}", config.storage.location()))?;
        let paths = StorePaths::new(&entry.id, &entry.variable);

        info!(
            source = %entry.store.location(),
            array = %entry.array_path,
            output = %config.storage.location(),
            "Resolved dataset"
        );

        Ok(Self {
            config,
            entry,
            source,
            output,
            paths,
        })
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    pub fn entry(&self) -> &DatasetEntry {
        &self.entry
    }

    pub fn output_store(&self) -> &ZarrStore {
        &self.output
    }

    /// Replace the output store, e.g. with a wrapped view of the configured
    /// one.
    pub fn with_output_store(mut self, output: ZarrStore) -> Self {
        self.output = output;
        self
    }

    pub async fn run(&self, options: &RunOptions) -> Result<WorkflowOutcome> {
        let mut outcome = WorkflowOutcome::default();

        if options.stage.includes_rechunk() {
            outcome.rechunk = Some(self.rechunk(options).await?);
        }

        if options.stage.includes_spectrum() {
            if options.dry_run {
                info!("Dry run, skipping spectrum stage");
            } else {
                outcome.spectrum = Some(self.spectrum().await?);
            }
        }

        Ok(outcome)
    }

    /// Build the rechunk plan. Reads only source metadata.
    pub fn plan(&self) -> Result<RechunkPlan> {
        let descriptor = describe(&self.source, &self.entry.array_path)
            .with_context(|| format!("Failed to describe {}", self.entry.array_path))?;
        let target_chunks = self.config.rechunk.resolve_chunks(&descriptor.shape)?;
        let plan = RechunkPlan::build(
            &self.entry.array_path,
            &descriptor,
            &target_chunks,
            &self.config.rechunk.settings,
            &self.paths.staging(),
            &self.paths.target(),
        )?;
        Ok(plan)
    }

    /// Stage 1.
    #[instrument(skip_all, fields(target = %self.paths.target()))]
    pub async fn rechunk(&self, options: &RunOptions) -> Result<RechunkOutcome> {
        let plan = self.plan()?;
        if options.stage.includes_spectrum() {
            ensure_whole_time_axis(&plan)?;
        }
        if options.dry_run {
            info!(tasks = plan.task_count(), "Dry run, plan built");
            return Ok(RechunkOutcome::DryRun {
                summary: plan.summary(),
            });
        }

        let target = self.paths.target();
        if is_complete(&self.output, &target)? {
            info!(path = %target, "Target already complete, skipping rechunk");
            return Ok(RechunkOutcome::AlreadyComplete);
        }

        if array_exists(&self.output, &target)? {
            if !options.clear_target {
                bail!(
                    "Target {} exists but is incomplete; re-run with --clear-target to rewrite it",
                    target
                );
            }
            warn!(path = %target, "Clearing incomplete target");
            clear_target(&self.output, &target)?;
        }

        let settings = self.config.rechunk.settings.clone();
        let source = self.source.clone();
        let output = self.output.clone();
        let report = ExecutionContext::scoped(self.config.cluster.clone(), |ctx| async move {
            ctx.execute(&plan, &source, &output, &settings).await
        })
        .await?;

        log_rechunk(&report);
        Ok(RechunkOutcome::Completed(report))
    }

    /// Stages 2 and 3.
    pub async fn spectrum(&self) -> Result<SpectrumReport> {
        let workflow = self.clone();
        tokio::task::spawn_blocking(move || workflow.spectrum_blocking())
            .await
            .context("Spectrum task panicked")?
    }

    fn regions(&self, ny: usize, nx: usize) -> Vec<RegionConfig> {
        if self.config.regions.is_empty() {
            vec![region_config("global", 0..ny, 0..nx)]
        } else {
            self.config.regions.clone()
        }
    }

    /// Validity mask of `region` at full resolution.
    ///
    /// Samples are read over the region widened to whole coarse cells of the
    /// global grid, so a cell's mask does not depend on where the region
    /// starts.
    fn region_mask(
        &self,
        samples: &ZarrArray,
        region: &Region,
        nt: usize,
        ny: usize,
        nx: usize,
    ) -> Result<ValidityMask> {
        let (threshold, coarsen) = (self.config.mask.threshold, self.config.mask.coarsen);
        let (y0, y1) = align_to_cells(region.y.clone(), coarsen, ny);
        let (x0, x1) = align_to_cells(region.x.clone(), coarsen, nx);

        let subset = ArraySubset::new_with_start_shape(
            vec![0, y0 as u64, x0 as u64],
            vec![nt as u64, (y1 - y0) as u64, (x1 - x0) as u64],
        )
        .map_err(|e| anyhow::anyhow!("invalid region subset: {}", e))?;
        let values: Vec<f32> = samples.retrieve_array_subset_elements(&subset)?;

        let mask = ValidityMask::from_samples(&values, nt, y1 - y0, x1 - x0, coarsen, threshold)?;
        Ok(mask.window(
            region.y.start - y0..region.y.end - y0,
            region.x.start - x0..region.x.end - x0,
        )?)
    }

    #[instrument(skip_all, fields(target = %self.paths.target()))]
    fn spectrum_blocking(&self) -> Result<SpectrumReport> {
        let target = self.paths.target();
        require_writable(&self.output, &self.paths.bands())
            .with_context(|| format!("Cannot write band maps for {}", target))?;
        anyhow::ensure!(
            is_complete(&self.output, &target)?,
            "Target {} is missing or incomplete; run the rechunk stage first",
            target
        );

        let samples = open_array(&self.output, &target)?;
        let shape = samples.shape().to_vec();
        anyhow::ensure!(
            shape.len() == 3,
            "Expected a [time, y, x] array at {}, got shape {:?}",
            target,
            shape
        );
        let (nt, ny, nx) = (shape[0] as usize, shape[1] as usize, shape[2] as usize);

        let mut options = self.config.spectrum.options.clone();
        options.spacing_days = self.entry.time_step_days;
        let spacing_days = options.spacing_days;
        let lazy = LazySpectrum::open_with_cache(
            open_array(&self.output, &target)?,
            options,
            self.config.spectrum.cache_size.as_u64() as usize,
        )?;

        let table = BandTable::new(self.config.bands.clone())?;
        let writer = BandWriter::create(
            &self.output,
            &self.paths.bands(),
            &table,
            ny,
            nx,
            &self.config.rechunk.settings,
        )?;

        let mut regions = Vec::new();

        for rc in self.regions(ny, nx) {
            let region = rc.region();
            region
                .validate(ny, nx)
                .with_context(|| format!("Region '{}' lies outside the {}×{} grid", rc.name, ny, nx))?;
            let (rny, rnx) = (region.ny(), region.nx());

            let spectra = lazy.materialize(&region)?;

            let mask = self
                .region_mask(&samples, &region, nt, ny, nx)
                .with_context(|| format!("Failed to build the validity mask of region '{}'", rc.name))?;

            let mut maps = table.aggregate(&spectra, self.config.spectrum.empty_band)?;
            for map in &mut maps {
                mask.apply(map)?;
            }
            writer.write_region(region.y.start, region.x.start, &maps)?;

            let mean = regional_mean_spectrum(&spectra, &Region::full(rny, rnx), Some(&mask))?;
            let masked_cells = rny * rnx - mask.valid_cells();

            info!(
                region = %rc.name,
                cells = rny * rnx,
                masked = masked_cells,
                "Region summarised"
            );
            regions.push(RegionReport::new(&rc.name, rc.y, rc.x, masked_cells, &maps, mean));
        }

        let mut report = SpectrumReport {
            dataset: self.entry.id.clone(),
            variable: self.entry.variable.clone(),
            target,
            bands_path: writer.path().to_string(),
            spacing_days,
            mask_threshold: self.config.mask.threshold,
            regions,
            cache_hits: 0,
            cache_misses: 0,
        };
        report.set_cache_stats(lazy.cache_stats());

        write_report(&self.output, &self.paths.report_key(), &report)?;
        Ok(report)
    }
}

/// Fail unless the planned target holds the whole time axis in one chunk,
/// which the spectrum stage needs.
fn ensure_whole_time_axis(plan: &RechunkPlan) -> Result<()> {
    let (Some(&extent), Some(&chunk)) =
        (plan.target.shape.first(), plan.target.chunks.as_slice().first())
    else {
        bail!("Target {} has no time axis", plan.target.path);
    };
    if chunk < extent {
        bail!(
            "Target time chunk {} is shorter than the {} time steps of {}; the spectrum stage needs \
             the whole time axis in one chunk (set rechunk.target_chunks[0] to 0 or >= {})",
            chunk,
            extent,
            plan.source.path,
            extent
        );
    }
    Ok(())
}

/// Widen `range` to whole cells of a grid coarsened by `factor`, clamped to
/// `len`.
fn align_to_cells(range: Range<usize>, factor: usize, len: usize) -> (usize, usize) {
    let factor = factor.max(1);
    let start = (range.start / factor) * factor;
    let end = (range.end.div_ceil(factor) * factor).min(len);
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_selection() {
        assert!(Stage::All.includes_rechunk() && Stage::All.includes_spectrum());
        assert!(Stage::Rechunk.includes_rechunk() && !Stage::Rechunk.includes_spectrum());
        assert!(!Stage::Spectrum.includes_rechunk() && Stage::Spectrum.includes_spectrum());
    }

    #[test]
    fn test_align_to_cells() {
        assert_eq!(align_to_cells(1..6, 2, 6), (0, 6));
        assert_eq!(align_to_cells(2..5, 2, 5), (2, 5));
        assert_eq!(align_to_cells(3..4, 4, 10), (0, 4));
        assert_eq!(align_to_cells(3..4, 1, 10), (3, 4));
    }

    #[test]
    fn test_stage_from_cli_value() {
        assert_eq!(Stage::from_str("spectrum", true).unwrap(), Stage::Spectrum);
        assert!(Stage::from_str("render", true).is_err());
    }
}
