//! Memory-bounded rechunking of Zarr V3 arrays.
//!
//! Rewrites an array from one chunk geometry into another (typically from
//! "one time step per chunk" into "the whole time axis per chunk") without any
//! task holding more than a configured memory budget. The work is split in
//! two phases:
//!
//! 1. **Planning** ([`RechunkPlan::build`]) is pure: chunk shapes are
//!    negotiated against the budget and the copy stages are laid out.
//!    Budgets too small for the requested geometry fail here, before any
//!    storage is touched.
//! 2. **Execution** ([`ExecutionContext::execute`]) creates the staging and
//!    target arrays and runs the stages on a bounded worker pool.
//!
//! # Example
//!
//! ```ignore
//! use rechunk::{ChunkShape, ClusterConfig, ExecutionContext, RechunkConfig, RechunkPlan};
//!
//! let source = rechunk::describe(&source_store, "/cmip6/tos.zarr")?;
//! let plan = RechunkPlan::build(
//!     "/cmip6/tos.zarr",
//!     &source,
//!     &ChunkShape::new(vec![1825, 90, 180]),
//!     &RechunkConfig::default(),
//!     "/cmip6/tos_tmp.zarr",
//!     "/cmip6/tos_target.zarr",
//! )?;
//! println!("{}", plan.summary());
//!
//! let report = ExecutionContext::scoped(ClusterConfig::default(), |ctx| async move {
//!     ctx.execute(&plan, &source_store, &store, &RechunkConfig::default()).await
//! })
//! .await?;
//! ```

pub mod array;
pub mod config;
pub mod error;
pub mod executor;
pub mod plan;
pub mod planner;
pub mod types;

pub use array::{describe, open_array, ZarrArray, COMPLETE_ATTRIBUTE};
pub use config::{ByteSize, ClusterConfig, RechunkConfig, ZarrCompression};
pub use error::{RechunkError, Result};
pub use executor::{
    clear_target, is_complete, ExecutionContext, RechunkReport, TaskRunner, ZarrTaskRunner,
};
pub use plan::{ArraySpec, CopyStage, CopyTask, RechunkPlan, StageKind};
pub use planner::{consolidate_chunks, negotiate, ChunkNegotiation};
pub use types::{ArrayDescriptor, Block, ChunkShape};
