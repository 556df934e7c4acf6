//! Climate spectra workflow.
//!
//! Resolves a dataset variable through the catalog, rewrites it so each
//! spatial cell's full time series is one chunk, computes per-cell power
//! spectra lazily and reduces them to frequency-band maps and regional mean
//! spectra.

pub mod config;
pub mod report;
pub mod workflow;

pub use config::{load_config, parse_config, WorkflowConfig};
pub use report::{RegionReport, SpectrumReport};
pub use workflow::{RechunkOutcome, RunOptions, Stage, Workflow, WorkflowOutcome};
