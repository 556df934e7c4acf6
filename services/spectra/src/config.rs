//! Workflow configuration.
//!
//! Loaded from a single YAML file with `${VAR}` and `${VAR:-default}`
//! environment substitution, then validated.

use std::fs;
use std::ops::Range;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use rechunk::{ByteSize, ChunkShape, ClusterConfig, RechunkConfig};
use spectral::{EmptyBandPolicy, FrequencyBand, Region, SpectrumOptions};
use storage::StoreConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub catalog: CatalogSection,
    /// Store receiving staging, target and derived outputs.
    pub storage: StoreConfig,
    pub rechunk: RechunkSection,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub spectrum: SpectrumSection,
    pub bands: Vec<FrequencyBand>,
    #[serde(default)]
    pub mask: MaskSection,
    /// Regions to summarise; the whole domain when empty.
    #[serde(default)]
    pub regions: Vec<RegionConfig>,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSection {
    /// `http(s)://`, `file://` or a local path.
    pub url: String,
    pub dataset: String,
    pub variable: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RechunkSection {
    /// Target chunk extents per axis, e.g. `[0, 90, 180]`. `0` takes the
    /// full extent of that axis.
    pub target_chunks: Vec<u64>,
    #[serde(flatten)]
    pub settings: RechunkConfig,
}

impl RechunkSection {
    /// Resolve the configured target chunks against the source `shape`.
    pub fn resolve_chunks(&self, shape: &[u64]) -> Result<ChunkShape> {
        anyhow::ensure!(
            self.target_chunks.len() == shape.len(),
            "Target chunks {:?} have {} axes but the source array has {} (shape {:?})",
            self.target_chunks,
            self.target_chunks.len(),
            shape.len(),
            shape
        );
        Ok(ChunkShape::new(
            self.target_chunks
                .iter()
                .zip(shape)
                .map(|(&c, &extent)| if c == 0 { extent.max(1) } else { c })
                .collect::<Vec<_>>(),
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectrumSection {
    #[serde(flatten)]
    pub options: SpectrumOptions,
    #[serde(default)]
    pub empty_band: EmptyBandPolicy,
    /// Memory for cached spectral blocks.
    #[serde(default = "default_cache_size")]
    pub cache_size: ByteSize,
}

fn default_cache_size() -> ByteSize {
    ByteSize::mb(256)
}

impl Default for SpectrumSection {
    fn default() -> Self {
        Self {
            options: SpectrumOptions::default(),
            empty_band: EmptyBandPolicy::default(),
            cache_size: default_cache_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskSection {
    /// Cells with a valid-sample fraction at or below this are masked.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Spatial coarsening factor of the mask.
    #[serde(default = "default_coarsen")]
    pub coarsen: usize,
}

fn default_threshold() -> f64 {
    spectral::mask::DEFAULT_THRESHOLD
}

fn default_coarsen() -> usize {
    1
}

impl Default for MaskSection {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            coarsen: default_coarsen(),
        }
    }
}

/// A named spatial selection, as `[start, end)` index pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    pub name: String,
    pub y: [usize; 2],
    pub x: [usize; 2],
}

impl RegionConfig {
    pub fn region(&self) -> Region {
        Region::new(self.y[0]..self.y[1], self.x[0]..self.x[1])
    }
}

/// Convenience for building region entries in code.
pub fn region_config(name: &str, y: Range<usize>, x: Range<usize>) -> RegionConfig {
    RegionConfig {
        name: name.to_string(),
        y: [y.start, y.end],
        x: [x.start, x.end],
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "json".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }
}

// ============================================================================
// Loading Functions
// ============================================================================

/// Load, expand and validate a workflow config file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<WorkflowConfig> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read workflow config from {:?}", path.as_ref()))?;
    parse_config(&content)
        .with_context(|| format!("Invalid workflow config {:?}", path.as_ref()))
}

/// Parse and validate workflow config YAML.
pub fn parse_config(content: &str) -> Result<WorkflowConfig> {
    let expanded = expand_env_vars(content)?;
    let config: WorkflowConfig =
        serde_yaml::from_str(&expanded).context("Failed to parse workflow config YAML")?;
    validate_config(&config)?;
    Ok(config)
}

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in YAML content.
/// Supports ${VAR} and ${VAR:-default} syntax.
fn expand_env_vars(content: &str) -> Result<String> {
    let mut result = String::with_capacity(content.len());
    let mut rest = content;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .with_context(|| format!("Unclosed variable substitution: ${{{}", after))?;
        result.push_str(&resolve_var_expr(&after[..end])?);
        rest = &after[end + 1..];
    }
    result.push_str(rest);

    Ok(result)
}

/// Resolve variable expression (supports VAR and VAR:-default syntax).
fn resolve_var_expr(expr: &str) -> Result<String> {
    if let Some((var_name, default)) = expr.split_once(":-") {
        match std::env::var(var_name.trim()) {
            Ok(val) if !val.is_empty() => Ok(val),
            _ => Ok(default.to_string()),
        }
    } else {
        std::env::var(expr.trim()).with_context(|| format!("Environment variable {} not set", expr))
    }
}

// ============================================================================
// Validation
// ============================================================================

fn validate_config(config: &WorkflowConfig) -> Result<()> {
    anyhow::ensure!(!config.catalog.url.is_empty(), "Catalog URL cannot be empty");
    anyhow::ensure!(
        !config.catalog.dataset.is_empty() && !config.catalog.variable.is_empty(),
        "Catalog dataset and variable must be set"
    );

    config.storage.validate()?;
    config.rechunk.settings.validate()?;
    config.cluster.validate()?;
    config.cluster.check_budget(config.rechunk.settings.max_mem)?;

    anyhow::ensure!(
        !config.rechunk.target_chunks.is_empty(),
        "Target chunks must name at least one axis"
    );

    anyhow::ensure!(!config.bands.is_empty(), "At least one frequency band is required");
    // Overlap and bound checks
    spectral::BandTable::new(config.bands.clone())?;

    anyhow::ensure!(
        (0.0..1.0).contains(&config.mask.threshold),
        "Mask threshold must be in [0, 1): {}",
        config.mask.threshold
    );
    anyhow::ensure!(config.mask.coarsen > 0, "Mask coarsening factor must be >= 1");

    for region in &config.regions {
        anyhow::ensure!(
            region.y[0] < region.y[1] && region.x[0] < region.x[1],
            "Region '{}' is empty",
            region.name
        );
    }

    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    anyhow::ensure!(
        valid_levels.contains(&config.logging.level.as_str()),
        "Invalid log level: {}. Must be one of: {:?}",
        config.logging.level,
        valid_levels
    );

    let valid_formats = ["json", "pretty"];
    anyhow::ensure!(
        valid_formats.contains(&config.logging.format.as_str()),
        "Invalid log format: {}. Must be one of: {:?}",
        config.logging.format,
        valid_formats
    );

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
