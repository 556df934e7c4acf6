//! Presentation outputs: band maps in Zarr and the JSON report.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::info;
use zarrs::array_subset::ArraySubset;

use rechunk::array::create_array;
use rechunk::{ArraySpec, ChunkShape, RechunkConfig, RechunkReport};
use spectral::{BandMap, BandTable, CacheStats, RegionalSpectrum};
use storage::{array_exists, clear_prefix, put_object, ZarrStore};

use anyhow::{Context, Result};

/// Per-band regional summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandSummary {
    pub label: String,
    pub low: f64,
    pub high: f64,
    /// Frequency bins in the band.
    pub bins: usize,
    /// Mean over valid cells; `None` when no cell holds a value.
    pub mean: Option<f64>,
    pub valid_cells: usize,
}

impl BandSummary {
    pub fn from_map(map: &BandMap) -> Self {
        let mean = map.nan_mean();
        Self {
            label: map.band.label.clone(),
            low: map.band.low,
            high: map.band.high,
            bins: map.bins,
            mean: mean.is_finite().then_some(mean),
            valid_cells: map.valid_cells(),
        }
    }
}

/// Summary of one configured region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionReport {
    pub name: String,
    pub y: [usize; 2],
    pub x: [usize; 2],
    /// Cells masked for too few valid samples.
    pub masked_cells: usize,
    pub bands: Vec<BandSummary>,
    /// Frequencies in cycles per day.
    pub frequencies: Vec<f64>,
    /// Spatial mean power per frequency; `None` where undefined.
    pub mean_spectrum: Vec<Option<f64>>,
    pub contributing_cells: usize,
}

impl RegionReport {
    pub fn new(
        name: &str,
        y: [usize; 2],
        x: [usize; 2],
        masked_cells: usize,
        maps: &[BandMap],
        spectrum: RegionalSpectrum,
    ) -> Self {
        Self {
            name: name.to_string(),
            y,
            x,
            masked_cells,
            bands: maps.iter().map(BandSummary::from_map).collect(),
            frequencies: spectrum.frequencies,
            mean_spectrum: spectrum
                .mean
                .into_iter()
                .map(|v| v.is_finite().then_some(v))
                .collect(),
            contributing_cells: spectrum.cells,
        }
    }

    /// Regional mean of one band.
    pub fn band_mean(&self, label: &str) -> Option<f64> {
        self.bands
            .iter()
            .find(|b| b.label == label)
            .and_then(|b| b.mean)
    }
}

/// Outcome of the spectrum stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectrumReport {
    pub dataset: String,
    pub variable: String,
    pub target: String,
    pub bands_path: String,
    pub spacing_days: f64,
    pub mask_threshold: f64,
    pub regions: Vec<RegionReport>,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl SpectrumReport {
    pub fn region(&self, name: &str) -> Option<&RegionReport> {
        self.regions.iter().find(|r| r.name == name)
    }

    pub fn set_cache_stats(&mut self, stats: CacheStats) {
        self.cache_hits = stats.hits;
        self.cache_misses = stats.misses;
    }
}

/// Serialise `report` to JSON under `key`.
pub fn write_report(store: &ZarrStore, key: &str, report: &SpectrumReport) -> Result<()> {
    let body = serde_json::to_vec_pretty(report).context("Failed to serialise report")?;
    put_object(store, key, Bytes::from(body))
        .with_context(|| format!("Failed to write report {}", key))?;
    info!(key = %key, regions = report.regions.len(), "Wrote spectrum report");
    Ok(())
}

/// `[band, y, x]` output array for band maps.
///
/// Replaces any previous band output. One chunk holds one band over the whole
/// spatial domain.
pub struct BandWriter {
    array: rechunk::ZarrArray,
    path: String,
}

impl BandWriter {
    pub fn create(
        store: &ZarrStore,
        path: &str,
        table: &BandTable,
        ny: usize,
        nx: usize,
        config: &RechunkConfig,
    ) -> Result<Self> {
        if array_exists(store, path)? {
            clear_prefix(store, path)?;
        }

        let bands = table.bands();
        let mut attributes = serde_json::Map::new();
        attributes.insert(
            "labels".to_string(),
            bands.iter().map(|b| b.label.clone()).collect::<Vec<_>>().into(),
        );
        attributes.insert(
            "low".to_string(),
            bands.iter().map(|b| b.low).collect::<Vec<_>>().into(),
        );
        attributes.insert(
            "high".to_string(),
            bands.iter().map(|b| b.high).collect::<Vec<_>>().into(),
        );

        let shape = vec![bands.len() as u64, ny as u64, nx as u64];
        let spec = ArraySpec {
            path: path.to_string(),
            shape: shape.clone(),
            chunks: ChunkShape::new(vec![1, ny as u64, nx as u64]),
        };
        let array = create_array(store, &spec, config, attributes)
            .with_context(|| format!("Failed to create band array {}", path))?;

        info!(path = %path, shape = ?shape, "Created band array");
        Ok(Self {
            array,
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Store band maps of a region whose top-left cell is `(y0, x0)`.
    ///
    /// `maps` are in band-table order.
    pub fn write_region(&self, y0: usize, x0: usize, maps: &[BandMap]) -> Result<()> {
        for (b, map) in maps.iter().enumerate() {
            let subset = ArraySubset::new_with_start_shape(
                vec![b as u64, y0 as u64, x0 as u64],
                vec![1, map.ny as u64, map.nx as u64],
            )
            .map_err(|e| anyhow::anyhow!("invalid band subset: {}", e))?;
            self.array
                .store_array_subset_elements(&subset, &map.values)
                .with_context(|| format!("Failed to write band '{}'", map.band.label))?;
        }
        Ok(())
    }
}

/// Log line summarising a finished rewrite.
pub fn log_rechunk(report: &RechunkReport) {
    info!(
        run_id = %report.run_id,
        tasks = report.tasks_run,
        retries = report.retries,
        bytes = report.bytes_copied,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "Rechunk complete"
    );
}
